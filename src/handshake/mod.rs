//! Stateless challenge-response connection handshake.
//!
//! The server proves a client owns its source address before allocating any
//! per-connection state: an initial probe earns a challenge carrying a
//! keyed-MAC cookie over (timestamp, client address); only a client that
//! echoes the cookie back intact gets a connection. Cookies are stateless —
//! validation needs nothing but the current and previous signing secret.
//!
//! The same machinery re-validates a mid-session address change (NAT
//! rebinding): the server answers packets from an unknown address with a
//! tiny restart request, and the client re-proves itself with a fresh
//! cookie plus the original one identifying its session.
//!
//! Every validation failure is silently dropped. Responding to a bad
//! handshake packet would turn the server into a reflection oracle.

mod client;
mod cookie;
mod packet;
mod server;

#[cfg(test)]
mod tests;

pub use client::{ClientHandshake, ClientOutcome};
pub use cookie::{
    cookies_match, generate_cookie, HandshakeSecrets, COOKIE_BYTE_SIZE, MAX_COOKIE_LIFETIME,
    MIN_COOKIE_LIFETIME, SECRET_BYTE_SIZE, SECRET_COUNT, SECRET_UPDATE_TIME,
    SECRET_UPDATE_TIME_VARIANCE,
};
pub use packet::{
    HandshakeMessage, HANDSHAKE_PACKET_SIZE_BITS, RESTART_HANDSHAKE_PACKET_SIZE_BITS,
    RESTART_RESPONSE_SIZE_BITS,
};
pub use server::{HandshakeInit, ServerHandshake, ServerOutcome};

use thiserror::Error;

/// Interval before an unanswered handshake packet is re-sent.
pub const HANDSHAKE_RESEND_INTERVAL: f64 = 1.0;

/// Minimum interval between restart-handshake requests sent to unknown
/// addresses (anti-flood).
pub const RESTART_REQUEST_MIN_INTERVAL: f64 = 10.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed handshake packet ({0} bits)")]
    MalformedPacket(usize),
    #[error("handshake timed out")]
    Timeout,
}
