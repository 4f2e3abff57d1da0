//! Control channel message protocol.
//!
//! A closed set of tagged messages drives login above the transport. Each
//! variant owns its fixed field list and an explicit encode/decode pair; an
//! unknown tag is transport-fatal for the connection.

use thiserror::Error;

use crate::bitstream::{BitReader, BitWriter};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown control message type {0}")]
    UnknownMessageType(u8),
    #[error("truncated control message")]
    Truncated,
}

/// Wire tags. The numbering has gaps for historical reasons; it is part of
/// the protocol and must not be compacted.
const NMT_HELLO: u8 = 0;
const NMT_WELCOME: u8 = 1;
const NMT_UPGRADE: u8 = 2;
const NMT_CHALLENGE: u8 = 3;
const NMT_NETSPEED: u8 = 4;
const NMT_LOGIN: u8 = 5;
const NMT_FAILURE: u8 = 6;
const NMT_JOIN: u8 = 9;

#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    /// First client message: byte order and protocol version.
    Hello {
        is_little_endian: bool,
        remote_network_version: u32,
        encryption_token: String,
    },
    /// Server accepts the login; carries the map and game to load.
    Welcome {
        map: String,
        game_name: String,
        redirect_url: String,
    },
    /// Version mismatch: the server tells the client what it speaks.
    Upgrade { protocol_version: u32 },
    /// Server challenge string the client must answer in its login.
    Challenge { challenge: String },
    /// Client requests a bandwidth cap.
    Netspeed { rate: u32 },
    /// Client login answer.
    Login {
        client_response: String,
        request_url: String,
        unique_id: String,
        online_platform_name: String,
    },
    /// Terminal failure, with a reason for the peer's log.
    Failure { reason: String },
    /// Client is ready to spawn.
    Join,
}

impl ControlMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            ControlMessage::Hello { .. } => NMT_HELLO,
            ControlMessage::Welcome { .. } => NMT_WELCOME,
            ControlMessage::Upgrade { .. } => NMT_UPGRADE,
            ControlMessage::Challenge { .. } => NMT_CHALLENGE,
            ControlMessage::Netspeed { .. } => NMT_NETSPEED,
            ControlMessage::Login { .. } => NMT_LOGIN,
            ControlMessage::Failure { .. } => NMT_FAILURE,
            ControlMessage::Join => NMT_JOIN,
        }
    }

    pub fn encode(&self, w: &mut BitWriter) {
        w.write_u8(self.message_type());
        match self {
            ControlMessage::Hello {
                is_little_endian,
                remote_network_version,
                encryption_token,
            } => {
                w.write_u8(*is_little_endian as u8);
                w.write_u32(*remote_network_version);
                let _ = w.write_string(encryption_token);
            }
            ControlMessage::Welcome {
                map,
                game_name,
                redirect_url,
            } => {
                let _ = w.write_string(map);
                let _ = w.write_string(game_name);
                let _ = w.write_string(redirect_url);
            }
            ControlMessage::Upgrade { protocol_version } => {
                w.write_u32(*protocol_version);
            }
            ControlMessage::Challenge { challenge } => {
                let _ = w.write_string(challenge);
            }
            ControlMessage::Netspeed { rate } => {
                w.write_u32(*rate);
            }
            ControlMessage::Login {
                client_response,
                request_url,
                unique_id,
                online_platform_name,
            } => {
                let _ = w.write_string(client_response);
                let _ = w.write_string(request_url);
                let _ = w.write_string(unique_id);
                let _ = w.write_string(online_platform_name);
            }
            ControlMessage::Failure { reason } => {
                let _ = w.write_string(reason);
            }
            ControlMessage::Join => {}
        }
    }

    pub fn decode(r: &mut BitReader<'_>) -> Result<Self, ControlError> {
        let tag = r.read_u8();
        if r.is_error() {
            return Err(ControlError::Truncated);
        }
        let message = match tag {
            NMT_HELLO => ControlMessage::Hello {
                is_little_endian: r.read_u8() != 0,
                remote_network_version: r.read_u32(),
                encryption_token: r.read_string(),
            },
            NMT_WELCOME => ControlMessage::Welcome {
                map: r.read_string(),
                game_name: r.read_string(),
                redirect_url: r.read_string(),
            },
            NMT_UPGRADE => ControlMessage::Upgrade {
                protocol_version: r.read_u32(),
            },
            NMT_CHALLENGE => ControlMessage::Challenge {
                challenge: r.read_string(),
            },
            NMT_NETSPEED => ControlMessage::Netspeed { rate: r.read_u32() },
            NMT_LOGIN => ControlMessage::Login {
                client_response: r.read_string(),
                request_url: r.read_string(),
                unique_id: r.read_string(),
                online_platform_name: r.read_string(),
            },
            NMT_FAILURE => ControlMessage::Failure {
                reason: r.read_string(),
            },
            NMT_JOIN => ControlMessage::Join,
            other => return Err(ControlError::UnknownMessageType(other)),
        };
        if r.is_error() {
            return Err(ControlError::Truncated);
        }
        Ok(message)
    }

    /// Serialize into a standalone payload buffer.
    pub fn to_payload(&self) -> (Vec<u8>, usize) {
        let mut w = BitWriter::resizable(64);
        self.encode(&mut w);
        (w.as_bytes().to_vec(), w.num_bits())
    }
}
