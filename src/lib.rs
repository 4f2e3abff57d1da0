pub mod bitstream;
pub mod channel;
pub mod config;
pub mod connection;
pub mod driver;
pub mod handler;
pub mod handshake;
pub mod names;
pub mod rng;
pub mod seq;
pub mod telemetry;
pub mod ticket;
