use super::cookie::COOKIE_BYTE_SIZE;
use super::HandshakeError;
use crate::bitstream::{BitReader, BitWriter};

/// Total bits of the main handshake exchange packet, including the leading
/// is-handshake bit: 1 + restart(1) + secret id(1) + timestamp(64) +
/// cookie(160).
pub const HANDSHAKE_PACKET_SIZE_BITS: usize = 227;

/// Total bits of a restart-handshake request: is-handshake bit + restart bit.
pub const RESTART_HANDSHAKE_PACKET_SIZE_BITS: usize = 2;

/// Total bits of a restart response: the exchange layout plus the original
/// session cookie.
pub const RESTART_RESPONSE_SIZE_BITS: usize = HANDSHAKE_PACKET_SIZE_BITS + COOKIE_BYTE_SIZE * 8;

/// A decoded handshake packet. The three shapes are distinguished purely by
/// their fixed bit sizes, so every packet of a given kind is
/// indistinguishable on the wire from any other of that kind
/// (anti-fingerprinting) and the client's initial probe is exactly as large
/// as the server's challenge (anti-amplification).
#[derive(Clone, Debug, PartialEq)]
pub enum HandshakeMessage {
    /// Server-to-client request that a peer with no matching connection
    /// restart its handshake.
    RestartRequest,
    /// Probe, challenge, challenge response and challenge ack all share
    /// this layout; the timestamp field tells them apart (0 = probe,
    /// positive = challenge/response, negative = ack).
    Exchange {
        restart: bool,
        secret_id: u8,
        timestamp: f64,
        cookie: [u8; COOKIE_BYTE_SIZE],
    },
    /// Client response to a restart request: a fresh challenge response
    /// plus the original cookie proving session continuity.
    RestartResponse {
        secret_id: u8,
        timestamp: f64,
        cookie: [u8; COOKIE_BYTE_SIZE],
        original_cookie: [u8; COOKIE_BYTE_SIZE],
    },
}

impl HandshakeMessage {
    /// Serialize to a raw datagram: leading is-handshake bit, fields,
    /// terminating sentinel bit.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BitWriter::with_capacity((RESTART_RESPONSE_SIZE_BITS + 1 + 7) / 8);
        w.write_bit(true); // is-handshake
        match self {
            HandshakeMessage::RestartRequest => {
                w.write_bit(true);
            }
            HandshakeMessage::Exchange {
                restart,
                secret_id,
                timestamp,
                cookie,
            } => {
                w.write_bit(*restart);
                w.write_bit(*secret_id & 1 == 1);
                w.write_f64(*timestamp);
                w.write_bytes(cookie);
            }
            HandshakeMessage::RestartResponse {
                secret_id,
                timestamp,
                cookie,
                original_cookie,
            } => {
                w.write_bit(true);
                w.write_bit(*secret_id & 1 == 1);
                w.write_f64(*timestamp);
                w.write_bytes(cookie);
                w.write_bytes(original_cookie);
            }
        }
        w.write_terminator();
        w.as_bytes().to_vec()
    }

    /// Decode a handshake packet body. `reader` is positioned after the
    /// stripped is-handshake bit; `body_bits` is the remaining meaningful
    /// bit count. Any unexpected size is malformed and must be dropped.
    pub fn decode(
        reader: &mut BitReader<'_>,
        body_bits: usize,
    ) -> Result<Self, HandshakeError> {
        match body_bits + 1 {
            RESTART_HANDSHAKE_PACKET_SIZE_BITS => {
                let restart = reader.read_bit();
                if !restart || reader.is_error() {
                    return Err(HandshakeError::MalformedPacket(body_bits));
                }
                Ok(HandshakeMessage::RestartRequest)
            }
            HANDSHAKE_PACKET_SIZE_BITS => {
                let restart = reader.read_bit();
                let secret_id = reader.read_bit() as u8;
                let timestamp = reader.read_f64();
                let mut cookie = [0u8; COOKIE_BYTE_SIZE];
                reader.read_bytes(&mut cookie);
                if reader.is_error() {
                    return Err(HandshakeError::MalformedPacket(body_bits));
                }
                Ok(HandshakeMessage::Exchange {
                    restart,
                    secret_id,
                    timestamp,
                    cookie,
                })
            }
            RESTART_RESPONSE_SIZE_BITS => {
                let restart = reader.read_bit();
                let secret_id = reader.read_bit() as u8;
                let timestamp = reader.read_f64();
                let mut cookie = [0u8; COOKIE_BYTE_SIZE];
                reader.read_bytes(&mut cookie);
                let mut original_cookie = [0u8; COOKIE_BYTE_SIZE];
                reader.read_bytes(&mut original_cookie);
                if !restart || reader.is_error() {
                    return Err(HandshakeError::MalformedPacket(body_bits));
                }
                Ok(HandshakeMessage::RestartResponse {
                    secret_id,
                    timestamp,
                    cookie,
                    original_cookie,
                })
            }
            _ => Err(HandshakeError::MalformedPacket(body_bits)),
        }
    }
}
