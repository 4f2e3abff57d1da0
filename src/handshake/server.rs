use std::collections::HashMap;
use std::net::SocketAddr;

use super::cookie::{
    cookies_match, generate_cookie, HandshakeSecrets, COOKIE_BYTE_SIZE, MAX_COOKIE_LIFETIME,
};
use super::packet::HandshakeMessage;
use super::RESTART_REQUEST_MIN_INTERVAL;
use crate::rng::SharedRng;
use crate::seq::{SeqNum, SEQ_NUM_COUNT};
use crate::telemetry;

const RESTART_TRACKING_CAP: usize = 1024;

/// Sequence state derived from a validated cookie.
#[derive(Clone, Debug)]
pub struct HandshakeInit {
    /// The authorised cookie identifying this session.
    pub cookie: [u8; COOKIE_BYTE_SIZE],
    /// Server-side outgoing initial sequence.
    pub server_seq: SeqNum,
    /// Client-side outgoing initial sequence.
    pub client_seq: SeqNum,
    /// True when this completion re-validates an existing session from a
    /// new address rather than opening a fresh one.
    pub restarted: bool,
    /// For a restarted handshake, the cookie of the original session.
    pub original_cookie: Option<[u8; COOKIE_BYTE_SIZE]>,
}

/// What the driver should do with a connectionless handshake packet.
pub enum ServerOutcome {
    /// Send these bytes back to the source address; no state was created.
    Reply(Vec<u8>),
    /// Cookie validated: send the ack and create (or re-address) the
    /// connection described by `init`.
    Complete { reply: Vec<u8>, init: HandshakeInit },
    /// Silently discard the packet.
    Drop,
}

/// Server side of the stateless handshake.
///
/// Holds no per-client state for the challenge phase; everything a returning
/// cookie needs for validation is recomputable from the two live secrets.
pub struct ServerHandshake {
    secrets: HandshakeSecrets,
    last_challenge_success_address: Option<SocketAddr>,
    restart_requests: HashMap<SocketAddr, f64>,
}

impl ServerHandshake {
    pub fn new(rng: SharedRng, now: f64) -> Self {
        Self {
            secrets: HandshakeSecrets::new(rng, now),
            last_challenge_success_address: None,
            restart_requests: HashMap::new(),
        }
    }

    /// Drive secret rotation; call once per tick.
    pub fn tick(&mut self, now: f64) {
        self.secrets.update(now);
    }

    pub fn last_challenge_success_address(&self) -> Option<SocketAddr> {
        self.last_challenge_success_address
    }

    /// Handle a handshake packet from an address with no connection.
    pub fn incoming_connectionless(
        &mut self,
        addr: SocketAddr,
        message: HandshakeMessage,
        now: f64,
    ) -> ServerOutcome {
        match message {
            HandshakeMessage::Exchange { timestamp, .. } if timestamp == 0.0 => {
                // Initial probe: issue a challenge, allocate nothing.
                let cookie = generate_cookie(self.secrets.secret(self.secrets.active_id()), now, &addr);
                telemetry::record_handshake_challenge();
                tracing::trace!(%addr, "handshake probe, sending challenge");
                let reply = HandshakeMessage::Exchange {
                    restart: false,
                    secret_id: self.secrets.active_id(),
                    timestamp: now,
                    cookie,
                }
                .encode();
                ServerOutcome::Reply(reply)
            }
            HandshakeMessage::Exchange {
                secret_id,
                timestamp,
                cookie,
                ..
            } if timestamp > 0.0 => {
                self.complete_challenge(addr, secret_id, timestamp, cookie, None, now)
            }
            HandshakeMessage::RestartResponse {
                secret_id,
                timestamp,
                cookie,
                original_cookie,
            } if timestamp > 0.0 => self.complete_challenge(
                addr,
                secret_id,
                timestamp,
                cookie,
                Some(original_cookie),
                now,
            ),
            // Acks, negative timestamps and restart requests have no
            // business arriving at a server; drop without a reply.
            _ => {
                telemetry::record_handshake_reject();
                ServerOutcome::Drop
            }
        }
    }

    fn complete_challenge(
        &mut self,
        addr: SocketAddr,
        secret_id: u8,
        timestamp: f64,
        cookie: [u8; COOKIE_BYTE_SIZE],
        original_cookie: Option<[u8; COOKIE_BYTE_SIZE]>,
        now: f64,
    ) -> ServerOutcome {
        if !self.validate_cookie(&addr, secret_id, timestamp, &cookie, now) {
            telemetry::record_handshake_reject();
            tracing::debug!(%addr, "handshake cookie rejected");
            return ServerOutcome::Drop;
        }

        let (server_seq, client_seq) = sequences_from_cookie(&cookie);
        self.last_challenge_success_address = Some(addr);
        self.restart_requests.remove(&addr);
        telemetry::record_handshake_accept();
        tracing::debug!(
            %addr,
            server_seq = server_seq.value(),
            client_seq = client_seq.value(),
            restarted = original_cookie.is_some(),
            "handshake cookie validated"
        );

        let reply = HandshakeMessage::Exchange {
            restart: false,
            secret_id,
            timestamp: -1.0,
            cookie,
        }
        .encode();
        ServerOutcome::Complete {
            reply,
            init: HandshakeInit {
                cookie,
                server_seq,
                client_seq,
                restarted: original_cookie.is_some(),
                original_cookie,
            },
        }
    }

    fn validate_cookie(
        &self,
        addr: &SocketAddr,
        secret_id: u8,
        timestamp: f64,
        cookie: &[u8; COOKIE_BYTE_SIZE],
        now: f64,
    ) -> bool {
        let cookie_delta = now - timestamp;
        let secret_delta = now - self.secrets.last_update();

        let valid_lifetime = cookie_delta > 0.0 && MAX_COOKIE_LIFETIME - cookie_delta > 0.0;
        // A cookie signed with the previous secret must predate the
        // rotation that retired it.
        let valid_rotation = if secret_id == self.secrets.active_id() {
            secret_delta >= 0.0
        } else {
            cookie_delta >= secret_delta
        };
        if !valid_lifetime || !valid_rotation {
            return false;
        }

        let expected = generate_cookie(self.secrets.secret(secret_id), timestamp, addr);
        cookies_match(&expected, cookie)
    }

    /// A non-handshake packet arrived from an unknown address. Ask the peer
    /// to re-prove itself, rate-limited per address so a spoofed flood
    /// cannot turn this path into a packet amplifier.
    pub fn notify_unknown_packet(&mut self, addr: SocketAddr, now: f64) -> Option<Vec<u8>> {
        if let Some(last) = self.restart_requests.get(&addr) {
            if now - last < RESTART_REQUEST_MIN_INTERVAL {
                return None;
            }
        }
        if self.restart_requests.len() >= RESTART_TRACKING_CAP {
            self.restart_requests
                .retain(|_, t| now - *t < RESTART_REQUEST_MIN_INTERVAL);
            if self.restart_requests.len() >= RESTART_TRACKING_CAP {
                return None;
            }
        }
        self.restart_requests.insert(addr, now);
        telemetry::record_restart_request();
        tracing::debug!(%addr, "requesting handshake restart");
        Some(HandshakeMessage::RestartRequest.encode())
    }
}

/// Derive the two initial 14-bit sequence numbers from a validated cookie.
pub(super) fn sequences_from_cookie(cookie: &[u8; COOKIE_BYTE_SIZE]) -> (SeqNum, SeqNum) {
    let mask = SEQ_NUM_COUNT - 1;
    let server_seq = u16::from_be_bytes([cookie[0], cookie[1]]) & mask;
    let client_seq = u16::from_be_bytes([cookie[2], cookie[3]]) & mask;
    (SeqNum::new(server_seq), SeqNum::new(client_seq))
}
