//! UDP socket loop and per-tick dispatch.
//!
//! One background task owns the blocking socket receives and feeds raw
//! datagrams into an mpsc queue; all protocol processing happens on the
//! driver's tick task, which drains the queue at a fixed rate. That single
//! processing context is what lets connection and channel state go entirely
//! lock-free — the queue handoff is the only synchronized structure.
//!
//! Datagrams from an address with a registered connection go to it;
//! anything else takes the connectionless handshake path. A `Connection` is
//! created (and counted) only after the handshake completes.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bitstream::{packet_bit_len, BitReader};
use crate::connection::{Connection, ConnectionConfig, ConnectionEvent};
use crate::handshake::{
    ClientHandshake, ClientOutcome, HandshakeMessage, ServerHandshake, ServerOutcome,
};
use crate::names::NameTable;
use crate::rng::SharedRng;
use crate::telemetry;

const RECV_QUEUE_CAPACITY: usize = 1024;
const EVENT_QUEUE_CAPACITY: usize = 256;

/// How long a closed peer's address suppresses restart-handshake requests.
const DISCONNECT_SUPPRESS_SECS: f64 = 30.0;

/// Tuning for a driver instance.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub tick_hz: u32,
    pub max_connections: usize,
    pub connection: ConnectionConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_hz: 60,
            max_connections: 128,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Driver-level notifications surfaced to the application.
#[derive(Clone, Debug)]
pub enum DriverEvent {
    Connected { addr: SocketAddr },
    Disconnected { addr: SocketAddr },
    Connection {
        addr: SocketAddr,
        event: ConnectionEvent,
    },
}

fn spawn_recv_loop(
    socket: Arc<UdpSocket>,
    shutdown: CancellationToken,
) -> mpsc::Receiver<(SocketAddr, Bytes)> {
    let (tx, rx) = mpsc::channel(RECV_QUEUE_CAPACITY);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            telemetry::record_udp_in(len);
                            let datagram = Bytes::copy_from_slice(&buf[..len]);
                            if tx.send((addr, datagram)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "UDP receive error, exiting recv loop");
                            break;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("recv loop shutdown requested");
                    break;
                }
            }
        }
    });
    rx
}

fn start_transport_logger() {
    if !telemetry::enabled() {
        return;
    }

    static STARTED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
    if STARTED.set(()).is_err() {
        return;
    }

    tokio::spawn(async move {
        let mut last = telemetry::transport_snapshot();
        let mut interval = tokio::time::interval(telemetry::TELEMETRY_INTERVAL);
        loop {
            interval.tick().await;
            let current = telemetry::transport_snapshot();
            let delta = current.delta(last);
            last = current;

            tracing::info!(
                interval_ms = telemetry::TELEMETRY_INTERVAL.as_millis(),
                udp_in_bytes = delta.udp_in_bytes,
                udp_out_bytes = delta.udp_out_bytes,
                packets_in = delta.packets_in,
                packets_out = delta.packets_out,
                packets_lost = delta.packets_lost,
                bunches_in = delta.bunches_in,
                bunches_out = delta.bunches_out,
                handshake_challenges = delta.handshake_challenges,
                handshake_accepts = delta.handshake_accepts,
                handshake_rejects = delta.handshake_rejects,
                restart_requests = delta.restart_requests,
                connections_closed = delta.connections_closed,
                active_connections = delta.active_connections,
                "transport_telemetry"
            );
        }
    });
}

/// Decode a connectionless datagram into a handshake message, or `None`
/// when it is not handshake traffic (or malformed).
fn decode_connectionless(data: &[u8]) -> Option<Result<HandshakeMessage, ()>> {
    let bit_len = packet_bit_len(data)?;
    if bit_len < 1 {
        return None;
    }
    let mut reader = BitReader::new(data, bit_len);
    if !reader.read_bit() {
        // Not handshake traffic.
        return Some(Err(()));
    }
    match HandshakeMessage::decode(&mut reader, bit_len - 1) {
        Ok(message) => Some(Ok(message)),
        Err(_) => None,
    }
}

/// Server driver: owns the socket, the connection map and the stateless
/// handshake.
pub struct ServerDriver {
    socket: Arc<UdpSocket>,
    recv_rx: mpsc::Receiver<(SocketAddr, Bytes)>,
    shutdown: CancellationToken,
    connections: HashMap<SocketAddr, Connection>,
    handshake: ServerHandshake,
    config: DriverConfig,
    rng: SharedRng,
    names: Arc<NameTable>,
    event_tx: mpsc::Sender<DriverEvent>,
    recently_disconnected: HashMap<SocketAddr, f64>,
    start: Instant,
}

impl ServerDriver {
    /// Bind the socket and start the background receive loop.
    pub async fn bind(
        addr: SocketAddr,
        config: DriverConfig,
        rng: SharedRng,
        names: Arc<NameTable>,
    ) -> io::Result<(Self, mpsc::Receiver<DriverEvent>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("gale server listening on {}", socket.local_addr()?);
        start_transport_logger();

        let shutdown = CancellationToken::new();
        let recv_rx = spawn_recv_loop(socket.clone(), shutdown.clone());
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let handshake = ServerHandshake::new(rng.clone(), 0.0);
        Ok((
            Self {
                socket,
                recv_rx,
                shutdown,
                connections: HashMap::new(),
                handshake,
                config,
                rng,
                names,
                event_tx,
                recently_disconnected: HashMap::new(),
                start: Instant::now(),
            },
            event_rx,
        ))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Drive ticks until shutdown. Queued packets still in flight at
    /// shutdown are simply discarded.
    pub async fn run(&mut self) {
        let period = Duration::from_micros(1_000_000 / self.config.tick_hz.max(1) as u64);
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = self.shutdown.cancelled() => {
                    debug!("server driver shutdown requested, exiting loop");
                    break;
                }
            }
        }
    }

    /// One simulation tick: drain the receive queue, then run per-
    /// connection maintenance and flush.
    pub async fn tick(&mut self) {
        let now = self.now();
        self.handshake.tick(now);

        while let Ok((addr, datagram)) = self.recv_rx.try_recv() {
            self.process_datagram(addr, &datagram, now).await;
        }

        self.recently_disconnected
            .retain(|_, at| now - *at < DISCONNECT_SUPPRESS_SECS);

        let addrs: Vec<SocketAddr> = self.connections.keys().copied().collect();
        for addr in addrs {
            let alive = self
                .connections
                .get_mut(&addr)
                .map(|conn| conn.tick(now))
                .unwrap_or(false);
            self.flush_connection(addr, now).await;
            if !alive {
                self.drop_connection(addr, now).await;
            }
        }
    }

    async fn process_datagram(&mut self, addr: SocketAddr, data: &[u8], now: f64) {
        trace!(target: "gale::packet_dump", direction = "rx", peer = %addr, len = data.len(), hex = %hex::encode(data));

        // Handshake traffic always takes the connectionless path, even
        // from a known address: a client whose challenge ack was lost will
        // re-send its response and needs the ack again.
        if let Some(Ok(message)) = decode_connectionless(data) {
            match self.handshake.incoming_connectionless(addr, message, now) {
                ServerOutcome::Reply(reply) => {
                    self.send_raw(addr, &reply).await;
                }
                ServerOutcome::Complete { reply, init } => {
                    self.send_raw(addr, &reply).await;
                    if init.restarted {
                        self.readdress_connection(addr, &init);
                    } else {
                        self.create_connection(addr, &init, now);
                    }
                }
                ServerOutcome::Drop => {}
            }
            return;
        }

        if self.connections.contains_key(&addr) {
            let result = match self.connections.get_mut(&addr) {
                Some(conn) => conn.received_raw_packet(data, now),
                None => return,
            };
            match result {
                Ok(events) => {
                    for event in events {
                        self.emit(DriverEvent::Connection { addr, event });
                    }
                    if self
                        .connections
                        .get(&addr)
                        .is_some_and(|conn| conn.is_closed())
                    {
                        self.flush_connection(addr, now).await;
                        self.drop_connection(addr, now).await;
                    }
                }
                Err(e) => {
                    // Transport-fatal: the connection closed itself; get its
                    // close bunches out, then forget it.
                    warn!(peer = %addr, error = %e, "fatal packet error, closing connection");
                    self.flush_connection(addr, now).await;
                    self.drop_connection(addr, now).await;
                }
            }
            return;
        }

        match decode_connectionless(data) {
            Some(Err(())) => {
                // Plain traffic from an unknown address. Unless the peer
                // just disconnected, ask it to re-prove itself.
                if !self.recently_disconnected.contains_key(&addr) {
                    if let Some(request) = self.handshake.notify_unknown_packet(addr, now) {
                        self.send_raw(addr, &request).await;
                    }
                }
            }
            _ => {
                trace!(peer = %addr, "malformed connectionless datagram dropped");
            }
        }
    }

    fn create_connection(&mut self, addr: SocketAddr, init: &crate::handshake::HandshakeInit, now: f64) {
        if self.connections.contains_key(&addr) {
            // Duplicate challenge response; the ack was already re-sent.
            return;
        }
        if self.connections.len() >= self.config.max_connections {
            warn!(peer = %addr, "connection limit reached, ignoring handshake");
            return;
        }
        let mut conn = Connection::new(
            addr,
            true,
            self.config.connection.clone(),
            self.rng.clone(),
            self.names.clone(),
        );
        // The server receives at the client's sequence and sends at its own.
        conn.init_sequence(init.client_seq, init.server_seq, now);
        conn.set_authorised_cookie(init.cookie);
        self.connections.insert(addr, conn);
        telemetry::record_connection_open();
        info!(peer = %addr, "connection established");
        self.emit(DriverEvent::Connected { addr });
    }

    /// A restarted handshake re-validates an existing session from a new
    /// address: move the connection under its new key.
    fn readdress_connection(&mut self, new_addr: SocketAddr, init: &crate::handshake::HandshakeInit) {
        let Some(original) = init.original_cookie else {
            return;
        };
        let old_addr = self.connections.iter().find_map(|(addr, conn)| {
            conn.authorised_cookie()
                .is_some_and(|cookie| crate::handshake::cookies_match(cookie, &original))
                .then_some(*addr)
        });
        match old_addr {
            Some(old_addr) => {
                if let Some(mut conn) = self.connections.remove(&old_addr) {
                    conn.set_remote(new_addr);
                    conn.set_authorised_cookie(init.cookie);
                    self.connections.insert(new_addr, conn);
                    info!(%old_addr, %new_addr, "connection re-addressed after handshake restart");
                }
            }
            None => {
                debug!(peer = %new_addr, "restart handshake with no matching session, ignored");
            }
        }
    }

    async fn flush_connection(&mut self, addr: SocketAddr, now: f64) {
        let packets = match self.connections.get_mut(&addr) {
            Some(conn) => match conn.flush(now) {
                Ok(packets) => packets,
                Err(e) => {
                    warn!(peer = %addr, error = %e, "flush failed");
                    return;
                }
            },
            None => return,
        };
        for packet in packets {
            self.send_raw(addr, &packet).await;
        }
    }

    async fn drop_connection(&mut self, addr: SocketAddr, now: f64) {
        if self.connections.remove(&addr).is_some() {
            telemetry::record_connection_close();
            self.recently_disconnected.insert(addr, now);
            self.emit(DriverEvent::Disconnected { addr });
        }
    }

    async fn send_raw(&self, addr: SocketAddr, data: &[u8]) {
        trace!(target: "gale::packet_dump", direction = "tx", peer = %addr, len = data.len(), hex = %hex::encode(data));
        telemetry::record_udp_out(data.len());
        if let Err(e) = self.socket.send_to(data, addr).await {
            warn!(peer = %addr, error = %e, "UDP send error");
        }
    }

    fn emit(&self, event: DriverEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!(error = %e, "event queue full, driver event dropped");
        }
    }

    /// Queue data on an open channel of a connected peer.
    pub fn send_data(
        &mut self,
        addr: SocketAddr,
        ch_index: u32,
        payload: &[u8],
        reliable: bool,
    ) -> bool {
        match self.connections.get_mut(&addr) {
            Some(conn) => conn.send_data(ch_index, payload, reliable).is_ok(),
            None => false,
        }
    }
}

/// Client driver: one socket, one connection, plus the client half of the
/// handshake (including mid-session restart).
pub struct ClientDriver {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    recv_rx: mpsc::Receiver<(SocketAddr, Bytes)>,
    shutdown: CancellationToken,
    handshake: ClientHandshake,
    connection: Option<Connection>,
    config: DriverConfig,
    rng: SharedRng,
    names: Arc<NameTable>,
    event_tx: mpsc::Sender<DriverEvent>,
    start: Instant,
}

impl ClientDriver {
    /// Bind an ephemeral socket and send the first handshake probe.
    pub async fn connect(
        server_addr: SocketAddr,
        config: DriverConfig,
        rng: SharedRng,
        names: Arc<NameTable>,
    ) -> io::Result<(Self, mpsc::Receiver<DriverEvent>)> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server_addr).await?;
        let socket = Arc::new(socket);
        start_transport_logger();

        let shutdown = CancellationToken::new();
        let recv_rx = spawn_recv_loop(socket.clone(), shutdown.clone());
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let mut driver = Self {
            socket,
            server_addr,
            recv_rx,
            shutdown,
            handshake: ClientHandshake::new(),
            connection: None,
            config,
            rng,
            names,
            event_tx,
            start: Instant::now(),
        };
        let probe = driver.handshake.begin(driver.now());
        driver.send_raw(&probe).await;
        info!(server = %server_addr, "handshake started");
        Ok((driver, event_rx))
    }

    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub async fn run(&mut self) {
        let period = Duration::from_micros(1_000_000 / self.config.tick_hz.max(1) as u64);
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = self.shutdown.cancelled() => {
                    debug!("client driver shutdown requested, exiting loop");
                    break;
                }
            }
        }
    }

    pub async fn tick(&mut self) {
        let now = self.now();

        while let Ok((addr, datagram)) = self.recv_rx.try_recv() {
            if addr != self.server_addr {
                continue;
            }
            self.process_datagram(&datagram, now).await;
        }

        if let Some(resend) = self.handshake.tick(now) {
            self.send_raw(&resend).await;
        }

        let mut drop_connection = false;
        if let Some(conn) = self.connection.as_mut() {
            let alive = conn.tick(now);
            match conn.flush(now) {
                Ok(packets) => {
                    for packet in &packets {
                        trace!(target: "gale::packet_dump", direction = "tx", peer = %self.server_addr, len = packet.len(), hex = %hex::encode(packet));
                        telemetry::record_udp_out(packet.len());
                        if let Err(e) = self.socket.send(packet).await {
                            warn!(error = %e, "UDP send error");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "flush failed"),
            }
            drop_connection = !alive;
        }
        if drop_connection {
            self.connection = None;
            telemetry::record_connection_close();
            self.emit(DriverEvent::Disconnected {
                addr: self.server_addr,
            });
        }
    }

    async fn process_datagram(&mut self, data: &[u8], now: f64) {
        trace!(target: "gale::packet_dump", direction = "rx", peer = %self.server_addr, len = data.len(), hex = %hex::encode(data));

        // Handshake packets (challenges, acks, restart requests) route to
        // the handshake state machine even while a connection is live.
        match decode_connectionless(data) {
            Some(Ok(message)) => {
                match self.handshake.incoming(message, now) {
                    ClientOutcome::Reply(reply) => {
                        self.send_raw(&reply).await;
                    }
                    ClientOutcome::Initialized {
                        server_seq,
                        client_seq,
                        restarted,
                    } => {
                        if !restarted && self.connection.is_none() {
                            let mut conn = Connection::new(
                                self.server_addr,
                                false,
                                self.config.connection.clone(),
                                self.rng.clone(),
                                self.names.clone(),
                            );
                            // The client receives at the server's sequence
                            // and sends at its own.
                            conn.init_sequence(server_seq, client_seq, now);
                            if let Some(cookie) = self.handshake.authorised_cookie() {
                                conn.set_authorised_cookie(*cookie);
                            }
                            if let Err(e) = conn.begin_login() {
                                warn!(error = %e, "failed to start login");
                            }
                            self.connection = Some(conn);
                            telemetry::record_connection_open();
                            info!(server = %self.server_addr, "connection established");
                            self.emit(DriverEvent::Connected {
                                addr: self.server_addr,
                            });
                        }
                    }
                    ClientOutcome::Ignored => {}
                }
                return;
            }
            Some(Err(())) => {}
            None => {
                trace!("malformed datagram dropped");
                return;
            }
        }

        let mut fatal = false;
        let mut received = Vec::new();
        if let Some(conn) = self.connection.as_mut() {
            match conn.received_raw_packet(data, now) {
                Ok(events) => {
                    received = events;
                    fatal = conn.is_closed();
                }
                Err(e) => {
                    warn!(error = %e, "fatal packet error, closing connection");
                    fatal = true;
                }
            }
        }
        for event in received {
            self.emit(DriverEvent::Connection {
                addr: self.server_addr,
                event,
            });
        }
        if fatal {
            if let Some(conn) = self.connection.as_mut() {
                if let Ok(packets) = conn.flush(now) {
                    for packet in packets {
                        let _ = self.socket.send(&packet).await;
                    }
                }
            }
            self.connection = None;
            telemetry::record_connection_close();
            self.emit(DriverEvent::Disconnected {
                addr: self.server_addr,
            });
        }
    }

    async fn send_raw(&self, data: &[u8]) {
        trace!(target: "gale::packet_dump", direction = "tx", peer = %self.server_addr, len = data.len(), hex = %hex::encode(data));
        telemetry::record_udp_out(data.len());
        if let Err(e) = self.socket.send(data).await {
            warn!(error = %e, "UDP send error");
        }
    }

    fn emit(&self, event: DriverEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!(error = %e, "event queue full, driver event dropped");
        }
    }

    /// Queue data on an open channel.
    pub fn send_data(&mut self, ch_index: u32, payload: &[u8], reliable: bool) -> bool {
        match self.connection.as_mut() {
            Some(conn) => conn.send_data(ch_index, payload, reliable).is_ok(),
            None => false,
        }
    }

    /// Open a channel of the given kind; returns its index.
    pub fn open_channel(&mut self, kind: crate::channel::ChannelKind) -> Option<u32> {
        self.connection
            .as_mut()
            .and_then(|conn| conn.open_channel(kind).ok())
    }
}
