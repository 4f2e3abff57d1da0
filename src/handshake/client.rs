use super::cookie::{COOKIE_BYTE_SIZE, MIN_COOKIE_LIFETIME};
use super::packet::HandshakeMessage;
use super::server::sequences_from_cookie;
use super::HANDSHAKE_RESEND_INTERVAL;
use crate::seq::SeqNum;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClientState {
    NotStarted,
    InProgress,
    Initialized,
}

/// What the caller should do with a handshake packet received client-side.
pub enum ClientOutcome {
    /// Send these bytes to the server.
    Reply(Vec<u8>),
    /// Handshake finished; seed the connection with these sequences. For a
    /// restarted handshake the previous sequences are preserved and
    /// `restarted` is set instead.
    Initialized {
        server_seq: SeqNum,
        client_seq: SeqNum,
        restarted: bool,
    },
    /// Nothing to do (duplicate, stale or irrelevant packet).
    Ignored,
}

/// Client side of the stateless handshake.
pub struct ClientHandshake {
    state: ClientState,
    restarting: bool,
    authorised_cookie: Option<[u8; COOKIE_BYTE_SIZE]>,
    server_seq: SeqNum,
    client_seq: SeqNum,
    begin_time: f64,
    last_send_time: f64,
    last_reply: Option<Vec<u8>>,
}

impl ClientHandshake {
    pub fn new() -> Self {
        Self {
            state: ClientState::NotStarted,
            restarting: false,
            authorised_cookie: None,
            server_seq: SeqNum::default(),
            client_seq: SeqNum::default(),
            begin_time: 0.0,
            last_send_time: 0.0,
            last_reply: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state == ClientState::Initialized
    }

    pub fn server_seq(&self) -> SeqNum {
        self.server_seq
    }

    pub fn client_seq(&self) -> SeqNum {
        self.client_seq
    }

    pub fn authorised_cookie(&self) -> Option<&[u8; COOKIE_BYTE_SIZE]> {
        self.authorised_cookie.as_ref()
    }

    /// Build the initial probe. The probe is padded to the exact size of
    /// the server's challenge so the exchange cannot amplify traffic.
    pub fn begin(&mut self, now: f64) -> Vec<u8> {
        self.state = ClientState::InProgress;
        self.begin_time = now;
        self.last_send_time = now;
        self.last_reply = None;
        self.probe()
    }

    fn probe(&self) -> Vec<u8> {
        HandshakeMessage::Exchange {
            restart: self.restarting,
            secret_id: 0,
            timestamp: 0.0,
            cookie: [0u8; COOKIE_BYTE_SIZE],
        }
        .encode()
    }

    /// Handle a decoded handshake packet from the server.
    pub fn incoming(&mut self, message: HandshakeMessage, now: f64) -> ClientOutcome {
        match message {
            HandshakeMessage::Exchange {
                secret_id,
                timestamp,
                cookie,
                ..
            } if timestamp > 0.0 => {
                // Challenge: echo the cookie back. When restarting, attach
                // the original cookie so the server can find the session.
                if self.state != ClientState::InProgress {
                    return ClientOutcome::Ignored;
                }
                let reply = if self.restarting {
                    match self.authorised_cookie {
                        Some(original_cookie) => HandshakeMessage::RestartResponse {
                            secret_id,
                            timestamp,
                            cookie,
                            original_cookie,
                        },
                        None => return ClientOutcome::Ignored,
                    }
                } else {
                    HandshakeMessage::Exchange {
                        restart: false,
                        secret_id,
                        timestamp,
                        cookie,
                    }
                };
                let bytes = reply.encode();
                self.last_send_time = now;
                self.last_reply = Some(bytes.clone());
                ClientOutcome::Reply(bytes)
            }
            HandshakeMessage::Exchange {
                timestamp, cookie, ..
            } if timestamp < 0.0 => {
                // Challenge ack. A restarted handshake keeps its session
                // sequences; a fresh one derives them from the cookie.
                if self.state == ClientState::Initialized {
                    return ClientOutcome::Ignored;
                }
                let restarted = self.restarting;
                if !restarted {
                    let (server_seq, client_seq) = sequences_from_cookie(&cookie);
                    self.server_seq = server_seq;
                    self.client_seq = client_seq;
                    self.authorised_cookie = Some(cookie);
                }
                self.state = ClientState::Initialized;
                self.restarting = false;
                self.last_reply = None;
                tracing::debug!(
                    server_seq = self.server_seq.value(),
                    client_seq = self.client_seq.value(),
                    restarted,
                    "client handshake initialized"
                );
                ClientOutcome::Initialized {
                    server_seq: self.server_seq,
                    client_seq: self.client_seq,
                    restarted,
                }
            }
            HandshakeMessage::RestartRequest => {
                // Mid-session address re-proof. Only meaningful once we
                // hold an authorised cookie.
                if self.authorised_cookie.is_none() {
                    return ClientOutcome::Ignored;
                }
                if self.state == ClientState::InProgress && self.restarting {
                    return ClientOutcome::Ignored;
                }
                tracing::debug!("server requested handshake restart");
                self.restarting = true;
                ClientOutcome::Reply(self.begin(now))
            }
            _ => ClientOutcome::Ignored,
        }
    }

    /// Timeout-driven resend: after ~1 s of silence re-send the current
    /// stage; once past the minimum cookie lifetime the stored challenge
    /// response may reference a retired secret, so restart from the probe.
    pub fn tick(&mut self, now: f64) -> Option<Vec<u8>> {
        if self.state != ClientState::InProgress {
            return None;
        }
        if now - self.last_send_time < HANDSHAKE_RESEND_INTERVAL {
            return None;
        }
        if now - self.begin_time > MIN_COOKIE_LIFETIME {
            self.begin_time = now;
            self.last_reply = None;
        }
        self.last_send_time = now;
        Some(self.last_reply.clone().unwrap_or_else(|| self.probe()))
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}
