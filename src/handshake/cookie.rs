use std::net::SocketAddr;

use blake2::digest::{Key, KeyInit, Mac};
use blake2::Blake2bMac512;
use subtle::ConstantTimeEq;

use crate::rng::SharedRng;

pub const SECRET_BYTE_SIZE: usize = 64;
pub const SECRET_COUNT: usize = 2;
pub const COOKIE_BYTE_SIZE: usize = 20;

/// Base secret rotation period, seconds.
pub const SECRET_UPDATE_TIME: f64 = 15.0;

/// Random jitter added to each rotation period so a fleet of servers does
/// not roll its secrets in lockstep.
pub const SECRET_UPDATE_TIME_VARIANCE: f64 = 5.0;

/// Longest a cookie can remain valid: both live secrets must rotate past it.
pub const MAX_COOKIE_LIFETIME: f64 =
    SECRET_COUNT as f64 * (SECRET_UPDATE_TIME + SECRET_UPDATE_TIME_VARIANCE);

/// A client restarts its handshake from scratch past this cookie age.
pub const MIN_COOKIE_LIFETIME: f64 = SECRET_UPDATE_TIME;

/// Keyed MAC over (timestamp, client address).
pub fn generate_cookie(
    secret: &[u8; SECRET_BYTE_SIZE],
    timestamp: f64,
    addr: &SocketAddr,
) -> [u8; COOKIE_BYTE_SIZE] {
    // 64-byte keys need the Blake2b variant; Blake2s caps at 32.
    let mut mac = <Blake2bMac512 as KeyInit>::new(Key::<Blake2bMac512>::from_slice(secret));
    mac.update(&timestamp.to_be_bytes());
    match addr {
        SocketAddr::V4(v4) => {
            mac.update(&v4.ip().octets());
            mac.update(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            mac.update(&v6.ip().octets());
            mac.update(&v6.port().to_be_bytes());
        }
    }
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; COOKIE_BYTE_SIZE];
    out.copy_from_slice(&digest[..COOKIE_BYTE_SIZE]);
    out
}

/// Constant-time cookie comparison.
pub fn cookies_match(a: &[u8; COOKIE_BYTE_SIZE], b: &[u8; COOKIE_BYTE_SIZE]) -> bool {
    a.ct_eq(b).unwrap_u8() == 1
}

/// The two live signing secrets plus rotation bookkeeping.
///
/// Exactly one secret is active at a time; the previous one stays valid
/// until the next rotation so cookies issued just before a roll survive it.
pub struct HandshakeSecrets {
    secrets: [[u8; SECRET_BYTE_SIZE]; SECRET_COUNT],
    active: u8,
    last_update: f64,
    next_interval: f64,
    rng: SharedRng,
}

impl HandshakeSecrets {
    pub fn new(rng: SharedRng, now: f64) -> Self {
        let mut secrets = [[0u8; SECRET_BYTE_SIZE]; SECRET_COUNT];
        for secret in secrets.iter_mut() {
            rng.fill_bytes(secret);
        }
        let next_interval = Self::pick_interval(&rng);
        Self {
            secrets,
            active: 0,
            last_update: now,
            next_interval,
            rng,
        }
    }

    fn pick_interval(rng: &SharedRng) -> f64 {
        SECRET_UPDATE_TIME + rng.next_f64() * SECRET_UPDATE_TIME_VARIANCE
    }

    /// Rotate if the jittered period has elapsed. Safe to call every tick.
    pub fn update(&mut self, now: f64) {
        if now - self.last_update >= self.next_interval {
            self.active ^= 1;
            let mut fresh = [0u8; SECRET_BYTE_SIZE];
            self.rng.fill_bytes(&mut fresh);
            self.secrets[self.active as usize] = fresh;
            self.last_update = now;
            self.next_interval = Self::pick_interval(&self.rng);
            tracing::debug!(active = self.active, "handshake secret rotated");
        }
    }

    pub fn active_id(&self) -> u8 {
        self.active
    }

    pub fn secret(&self, id: u8) -> &[u8; SECRET_BYTE_SIZE] {
        &self.secrets[(id & 1) as usize]
    }

    /// Time of the most recent rotation.
    pub fn last_update(&self) -> f64 {
        self.last_update
    }
}
