use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

pub(crate) const TELEMETRY_ENV: &str = "GALE_TELEMETRY";
pub(crate) const TELEMETRY_INTERVAL: Duration = Duration::from_secs(1);

static UDP_BYTES_IN: AtomicU64 = AtomicU64::new(0);
static UDP_BYTES_OUT: AtomicU64 = AtomicU64::new(0);
static PACKETS_IN: AtomicU64 = AtomicU64::new(0);
static PACKETS_OUT: AtomicU64 = AtomicU64::new(0);
static PACKETS_LOST: AtomicU64 = AtomicU64::new(0);
static BUNCHES_IN: AtomicU64 = AtomicU64::new(0);
static BUNCHES_OUT: AtomicU64 = AtomicU64::new(0);
static HANDSHAKE_CHALLENGES: AtomicU64 = AtomicU64::new(0);
static HANDSHAKE_ACCEPTS: AtomicU64 = AtomicU64::new(0);
static HANDSHAKE_REJECTS: AtomicU64 = AtomicU64::new(0);
static RESTART_REQUESTS: AtomicU64 = AtomicU64::new(0);
static CONNECTIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Default, Debug, serde::Serialize, serde::Deserialize)]
pub struct TransportSnapshot {
    pub udp_in_bytes: u64,
    pub udp_out_bytes: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub packets_lost: u64,
    pub bunches_in: u64,
    pub bunches_out: u64,
    pub handshake_challenges: u64,
    pub handshake_accepts: u64,
    pub handshake_rejects: u64,
    pub restart_requests: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
}

impl TransportSnapshot {
    pub(crate) fn delta(self, prev: Self) -> Self {
        Self {
            udp_in_bytes: self.udp_in_bytes.saturating_sub(prev.udp_in_bytes),
            udp_out_bytes: self.udp_out_bytes.saturating_sub(prev.udp_out_bytes),
            packets_in: self.packets_in.saturating_sub(prev.packets_in),
            packets_out: self.packets_out.saturating_sub(prev.packets_out),
            packets_lost: self.packets_lost.saturating_sub(prev.packets_lost),
            bunches_in: self.bunches_in.saturating_sub(prev.bunches_in),
            bunches_out: self.bunches_out.saturating_sub(prev.bunches_out),
            handshake_challenges: self
                .handshake_challenges
                .saturating_sub(prev.handshake_challenges),
            handshake_accepts: self
                .handshake_accepts
                .saturating_sub(prev.handshake_accepts),
            handshake_rejects: self
                .handshake_rejects
                .saturating_sub(prev.handshake_rejects),
            restart_requests: self.restart_requests.saturating_sub(prev.restart_requests),
            connections_closed: self
                .connections_closed
                .saturating_sub(prev.connections_closed),
            active_connections: self.active_connections,
        }
    }
}

pub(crate) fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        let res = std::env::var(TELEMETRY_ENV)
            .ok()
            .map(|value| {
                matches!(
                    value.to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(true);
        tracing::info!(enabled = res, "Telemetry status initialized");
        res
    })
}

pub(crate) fn record_udp_in(bytes: usize) {
    if !enabled() {
        return;
    }
    UDP_BYTES_IN.fetch_add(bytes as u64, Ordering::Relaxed);
}

pub(crate) fn record_udp_out(bytes: usize) {
    if !enabled() {
        return;
    }
    UDP_BYTES_OUT.fetch_add(bytes as u64, Ordering::Relaxed);
}

pub(crate) fn record_packet_in(_bytes: usize) {
    if !enabled() {
        return;
    }
    PACKETS_IN.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_packet_out(_bytes: usize) {
    if !enabled() {
        return;
    }
    PACKETS_OUT.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_packet_lost() {
    if !enabled() {
        return;
    }
    PACKETS_LOST.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_bunch_in() {
    if !enabled() {
        return;
    }
    BUNCHES_IN.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_bunch_out() {
    if !enabled() {
        return;
    }
    BUNCHES_OUT.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_handshake_challenge() {
    if !enabled() {
        return;
    }
    HANDSHAKE_CHALLENGES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_handshake_accept() {
    if !enabled() {
        return;
    }
    HANDSHAKE_ACCEPTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_handshake_reject() {
    if !enabled() {
        return;
    }
    HANDSHAKE_REJECTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_restart_request() {
    if !enabled() {
        return;
    }
    RESTART_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_connection_closed() {
    if !enabled() {
        return;
    }
    CONNECTIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_connection_open() {
    ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_connection_close() {
    ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
}

/// RAII guard for tracking an active connection.
pub struct ConnectionGuard;

impl ConnectionGuard {
    pub fn new() -> Self {
        record_connection_open();
        Self
    }
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        record_connection_close();
    }
}

pub fn transport_snapshot() -> TransportSnapshot {
    TransportSnapshot {
        udp_in_bytes: UDP_BYTES_IN.load(Ordering::Relaxed),
        udp_out_bytes: UDP_BYTES_OUT.load(Ordering::Relaxed),
        packets_in: PACKETS_IN.load(Ordering::Relaxed),
        packets_out: PACKETS_OUT.load(Ordering::Relaxed),
        packets_lost: PACKETS_LOST.load(Ordering::Relaxed),
        bunches_in: BUNCHES_IN.load(Ordering::Relaxed),
        bunches_out: BUNCHES_OUT.load(Ordering::Relaxed),
        handshake_challenges: HANDSHAKE_CHALLENGES.load(Ordering::Relaxed),
        handshake_accepts: HANDSHAKE_ACCEPTS.load(Ordering::Relaxed),
        handshake_rejects: HANDSHAKE_REJECTS.load(Ordering::Relaxed),
        restart_requests: RESTART_REQUESTS.load(Ordering::Relaxed),
        connections_closed: CONNECTIONS_CLOSED.load(Ordering::Relaxed),
        active_connections: ACTIVE_CONNECTIONS.load(Ordering::Relaxed),
    }
}
