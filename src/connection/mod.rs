//! Per-peer connection state machine.
//!
//! A [`Connection`] owns the packet sequence state, the channel slots with
//! their reliable counters, partial-bunch reassembly (delegated to the
//! channels), the outgoing packet builder with retransmission-on-nak, and
//! the control-channel login state machine. All processing happens on the
//! driver's tick context; nothing here is shared across threads.

pub mod bunch;


use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::bitstream::{BitReader, BitWriter};
use crate::channel::{Channel, ChannelError, ChannelKind, ControlMessage};
use crate::handler::{HandlerError, PacketPipeline};
use crate::handshake::COOKIE_BYTE_SIZE;
use crate::names::NameTable;
use crate::rng::SharedRng;
use crate::seq::{PacketHeader, PacketNotify, SeqNum};
use crate::telemetry;
use bunch::{Bunch, BunchError, CloseReason};

/// Hard ceiling for a serialized packet, bytes.
pub const MAX_PACKET_BYTES: usize = 1024;

/// Outgoing payloads larger than this are split into partial bunches.
pub const MAX_SINGLE_BUNCH_BYTES: usize = 896;

/// The control channel always lives at index 0.
pub const CONTROL_CHANNEL_INDEX: u32 = 0;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("packet handler error: {0}")]
    Handler(#[from] HandlerError),
    #[error("malformed packet header")]
    MalformedHeader,
    #[error("bunch error: {0}")]
    Bunch(#[from] BunchError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("channel index {0} out of range")]
    ChannelIndexOutOfRange(u32),
    #[error("reliable bunch for channel {0} before its open bunch")]
    ReliableBeforeOpen(u32),
    #[error("unknown channel type {0:?}")]
    UnknownChannelType(String),
    #[error("connection is closed")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Invalid,
    Pending,
    Open,
    Closed,
}

/// Client-login sub-state tracked alongside the transport state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginState {
    Invalid,
    LoggingIn,
    Welcomed,
    ReceivedJoin,
    CleanedUp,
}

/// What a processed packet produced for the layer above.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    Control(ControlMessage),
    Data {
        ch_index: u32,
        payload: Vec<u8>,
        payload_bits: usize,
    },
    ChannelOpened {
        ch_index: u32,
        kind: ChannelKind,
    },
    ChannelClosed {
        ch_index: u32,
        reason: CloseReason,
    },
    /// Server side: the peer finished the login exchange.
    JoinComplete,
}

/// Tuning and identity knobs handed to every connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub max_channels: usize,
    /// Fully-reliable mode (e.g. replay playback): every packet is
    /// delivered in order by construction, so a reliable gap is fatal and
    /// nothing is ever retransmitted.
    pub internal_ack: bool,
    /// Seconds without inbound traffic before the connection times out.
    pub timeout: f64,
    /// Seconds of outbound silence before an empty keepalive goes out.
    pub keepalive_interval: f64,
    pub network_version: u32,
    pub map_name: String,
    pub game_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_channels: 32,
            internal_ack: false,
            timeout: 60.0,
            keepalive_interval: 5.0,
            network_version: 1033,
            map_name: "/Game/Maps/Entry".to_string(),
            game_name: "Game".to_string(),
        }
    }
}

/// Per-peer reliability, channel and login state.
pub struct Connection {
    state: ConnectionState,
    login_state: LoginState,
    remote: SocketAddr,
    server_side: bool,
    config: ConnectionConfig,
    rng: SharedRng,
    names: Arc<NameTable>,
    notify: PacketNotify,
    pipeline: PacketPipeline,
    channels: Vec<Option<Channel>>,
    in_reliable: Vec<u16>,
    out_reliable: Vec<u16>,
    sequence_initialized: bool,
    authorised_cookie: Option<[u8; COOKIE_BYTE_SIZE]>,
    issued_challenge: Option<String>,
    pending: VecDeque<Bunch>,
    resend: VecDeque<Bunch>,
    last_receive_time: f64,
    last_send_time: f64,
    packets_in: u64,
    packets_out: u64,
    bunches_in: u64,
    bunches_out: u64,
}

impl Connection {
    pub fn new(
        remote: SocketAddr,
        server_side: bool,
        config: ConnectionConfig,
        rng: SharedRng,
        names: Arc<NameTable>,
    ) -> Self {
        let max_channels = config.max_channels;
        Self {
            state: ConnectionState::Pending,
            login_state: LoginState::Invalid,
            remote,
            server_side,
            config,
            rng,
            names,
            notify: PacketNotify::new(),
            pipeline: PacketPipeline::new(),
            channels: (0..max_channels).map(|_| None).collect(),
            in_reliable: vec![0; max_channels],
            out_reliable: vec![0; max_channels],
            sequence_initialized: false,
            authorised_cookie: None,
            issued_challenge: None,
            pending: VecDeque::new(),
            resend: VecDeque::new(),
            last_receive_time: 0.0,
            last_send_time: 0.0,
            packets_in: 0,
            packets_out: 0,
            bunches_in: 0,
            bunches_out: 0,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = remote;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn login_state(&self) -> LoginState {
        self.login_state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn set_authorised_cookie(&mut self, cookie: [u8; COOKIE_BYTE_SIZE]) {
        self.authorised_cookie = Some(cookie);
    }

    pub fn authorised_cookie(&self) -> Option<&[u8; COOKIE_BYTE_SIZE]> {
        self.authorised_cookie.as_ref()
    }

    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.packets_in,
            self.packets_out,
            self.bunches_in,
            self.bunches_out,
        )
    }

    /// Seed packet and per-channel reliable sequences from the
    /// handshake-derived values. Idempotent: a second call is a no-op, so a
    /// duplicated challenge ack cannot reset a live connection.
    pub fn init_sequence(&mut self, incoming: SeqNum, outgoing: SeqNum, now: f64) {
        if self.sequence_initialized {
            return;
        }
        self.sequence_initialized = true;
        // The first packet the peer sends carries `incoming`, so the
        // tracker starts one behind it.
        self.notify
            .init(SeqNum::new(incoming.value().wrapping_sub(1)), outgoing);
        self.in_reliable.iter_mut().for_each(|s| *s = 0);
        self.out_reliable.iter_mut().for_each(|s| *s = 0);
        self.state = ConnectionState::Open;
        self.last_receive_time = now;
        self.last_send_time = now;
        tracing::debug!(
            remote = %self.remote,
            in_seq = incoming.value(),
            out_seq = outgoing.value(),
            "connection sequences initialized"
        );
    }

    // ---------------------------------------------------------------- //
    // Receive path
    // ---------------------------------------------------------------- //

    /// Entry point for one raw UDP payload addressed to this connection.
    ///
    /// A returned error is transport-fatal: the connection has moved to
    /// `Closed` and the caller must drop it, never swallow the error.
    pub fn received_raw_packet(
        &mut self,
        data: &[u8],
        now: f64,
    ) -> Result<Vec<ConnectionEvent>, ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        let packet = match self.pipeline.incoming(data) {
            Ok(packet) => packet,
            Err(e) => {
                // Malformed after a valid handshake: corruption or attack.
                self.close_internal(CloseReason::Destroyed);
                return Err(e.into());
            }
        };
        if packet.handshake {
            // Duplicate challenge acks after init are expected; the
            // connectionless path owns everything else.
            tracing::trace!(remote = %self.remote, "handshake packet on open connection ignored");
            return Ok(Vec::new());
        }

        telemetry::record_packet_in(data.len());
        self.packets_in += 1;
        self.last_receive_time = now;

        let mut reader = BitReader::new(&packet.data, packet.bit_len);
        for _ in 0..packet.bit_offset {
            reader.read_bit();
        }

        let Some(header) = PacketHeader::read(&mut reader) else {
            self.close_internal(CloseReason::Destroyed);
            return Err(ConnectionError::MalformedHeader);
        };

        let mut ack_results: Vec<(SeqNum, bool)> = Vec::new();
        let delta = self
            .notify
            .update(&header, |seq, delivered| ack_results.push((seq, delivered)));
        if delta == 0 {
            tracing::trace!(
                remote = %self.remote,
                seq = header.seq.value(),
                "stale or invalid packet dropped"
            );
            return Ok(Vec::new());
        }
        self.process_ack_results(&ack_results);

        // Optional packet-info payload.
        if reader.read_bit() {
            let _has_server_frame_time = reader.read_bit();
            let _jitter_clock = reader.read_bits(10);
        }
        if reader.is_error() {
            self.close_internal(CloseReason::Destroyed);
            return Err(ConnectionError::MalformedHeader);
        }

        // Disassemble into bunches and dispatch.
        let mut events = Vec::new();
        let mut ack_packet = true;
        while reader.remaining_bits() > 0 && self.state != ConnectionState::Closed {
            let bunch = match Bunch::read(&mut reader) {
                Ok(bunch) => bunch,
                Err(e) => {
                    self.close_internal(CloseReason::Destroyed);
                    return Err(e.into());
                }
            };
            self.bunches_in += 1;
            telemetry::record_bunch_in();
            match self.dispatch_bunch(bunch, &mut events) {
                Ok(dispatched) => {
                    // An unreliable bunch skipped before channel open must
                    // leave the whole packet unacknowledged.
                    ack_packet &= dispatched;
                }
                Err(e) => {
                    self.close_internal(CloseReason::Destroyed);
                    return Err(e);
                }
            }
        }

        self.notify.ack_seq(header.seq, ack_packet);
        Ok(events)
    }

    fn process_ack_results(&mut self, results: &[(SeqNum, bool)]) {
        for (seq, delivered) in results {
            if *delivered {
                for slot in self.channels.iter_mut() {
                    if let Some(ch) = slot {
                        ch.acked_packet(*seq);
                    }
                }
                // Channels whose close bunch just acked can tear down,
                // freeing their index for reuse.
                for slot in self.channels.iter_mut() {
                    if slot.as_ref().is_some_and(|ch| ch.can_destroy()) {
                        *slot = None;
                    }
                }
            } else {
                telemetry::record_packet_lost();
                for slot in self.channels.iter_mut() {
                    if let Some(ch) = slot {
                        for bunch in ch.take_naked(*seq) {
                            tracing::trace!(
                                ch = ch.index,
                                seq = bunch.ch_sequence,
                                "queueing reliable bunch for retransmission"
                            );
                            self.resend.push_back(bunch);
                        }
                    }
                }
            }
        }
    }

    /// Dispatch one bunch. `Ok(false)` means the bunch was legitimately
    /// skipped and the carrying packet must not be acknowledged.
    fn dispatch_bunch(
        &mut self,
        bunch: Bunch,
        events: &mut Vec<ConnectionEvent>,
    ) -> Result<bool, ConnectionError> {
        let index = bunch.ch_index;
        if index as usize >= self.config.max_channels {
            return Err(ConnectionError::ChannelIndexOutOfRange(index));
        }

        if self.channels[index as usize].is_none() {
            if !bunch.open {
                if bunch.close {
                    // Close for a channel we already tore down.
                    return Ok(true);
                }
                if bunch.reliable {
                    return Err(ConnectionError::ReliableBeforeOpen(index));
                }
                tracing::trace!(ch = index, "unreliable bunch for unknown channel skipped");
                return Ok(false);
            }
            let name = bunch.ch_name.resolve(&self.names).unwrap_or_default();
            let Some(kind) = ChannelKind::from_name(&name) else {
                if bunch.reliable {
                    return Err(ConnectionError::UnknownChannelType(name));
                }
                return Ok(false);
            };
            self.channels[index as usize] = Some(Channel::new(index, kind, false));
            events.push(ConnectionEvent::ChannelOpened { ch_index: index, kind });
            tracing::debug!(ch = index, kind = kind.name(), "channel opened by remote");
        }

        let slot = index as usize;
        let ready = match self.channels[slot].as_mut() {
            Some(ch) => {
                if bunch.open {
                    ch.remote_opened = true;
                }
                if !ch.remote_opened {
                    // We opened this channel locally and the peer has not
                    // opened its side yet.
                    if bunch.reliable {
                        return Err(ConnectionError::ReliableBeforeOpen(index));
                    }
                    tracing::trace!(ch = index, "unreliable bunch before open skipped");
                    return Ok(false);
                }
                ch.received_raw_bunch(
                    bunch,
                    &mut self.in_reliable[slot],
                    self.config.internal_ack,
                )?
            }
            None => return Ok(true),
        };

        for logical in ready {
            self.handle_logical_bunch(slot, logical, events)?;
            if self.state == ConnectionState::Closed {
                break;
            }
        }
        Ok(true)
    }

    fn handle_logical_bunch(
        &mut self,
        slot: usize,
        bunch: Bunch,
        events: &mut Vec<ConnectionEvent>,
    ) -> Result<(), ConnectionError> {
        let kind = self.channels[slot].as_ref().map(|ch| ch.kind);
        let Some(kind) = kind else {
            return Ok(());
        };

        if bunch.close {
            let reason = bunch.close_reason;
            if reason.destroys_remote_state() {
                self.channels[slot] = None;
            } else if let Some(ch) = self.channels[slot].as_mut() {
                ch.dormant = true;
            }
            events.push(ConnectionEvent::ChannelClosed {
                ch_index: slot as u32,
                reason,
            });
            tracing::debug!(ch = slot, ?reason, "channel closed by remote");
            return Ok(());
        }

        match kind {
            ChannelKind::Control => {
                let mut reader = BitReader::new(&bunch.payload, bunch.payload_bits);
                while reader.remaining_bits() >= 8 && !reader.is_error() {
                    let message = ControlMessage::decode(&mut reader)
                        .map_err(ChannelError::Control)?;
                    let is_join = matches!(message, ControlMessage::Join);
                    self.handle_control_message(&message)?;
                    events.push(ConnectionEvent::Control(message));
                    if is_join && self.login_state == LoginState::ReceivedJoin {
                        events.push(ConnectionEvent::JoinComplete);
                    }
                }
            }
            ChannelKind::Actor | ChannelKind::Voice => {
                // Payload interpretation for these lives above the
                // transport; surface the raw stream.
                events.push(ConnectionEvent::Data {
                    ch_index: slot as u32,
                    payload: bunch.payload.clone(),
                    payload_bits: bunch.payload_bits,
                });
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------- //
    // Login state machine
    // ---------------------------------------------------------------- //

    fn handle_control_message(&mut self, message: &ControlMessage) -> Result<(), ConnectionError> {
        if self.server_side {
            self.handle_control_server(message)
        } else {
            self.handle_control_client(message)
        }
    }

    fn handle_control_server(&mut self, message: &ControlMessage) -> Result<(), ConnectionError> {
        match message {
            ControlMessage::Hello {
                remote_network_version,
                ..
            } => {
                if *remote_network_version != self.config.network_version {
                    tracing::warn!(
                        remote_version = remote_network_version,
                        local_version = self.config.network_version,
                        "network version mismatch, upgrading and closing"
                    );
                    self.send_control(ControlMessage::Upgrade {
                        protocol_version: self.config.network_version,
                    })?;
                    self.close(CloseReason::Destroyed)?;
                    return Ok(());
                }
                let mut nonce = [0u8; 4];
                self.rng.fill_bytes(&mut nonce);
                let challenge = hex::encode(nonce).to_uppercase();
                self.issued_challenge = Some(challenge.clone());
                self.login_state = LoginState::LoggingIn;
                self.send_control(ControlMessage::Challenge { challenge })?;
            }
            ControlMessage::Login {
                client_response, ..
            } => {
                if self.login_state != LoginState::LoggingIn {
                    tracing::debug!(state = ?self.login_state, "login out of order, ignored");
                    return Ok(());
                }
                if !self
                    .issued_challenge
                    .as_deref()
                    .is_some_and(|challenge| challenge == client_response)
                {
                    self.send_control(ControlMessage::Failure {
                        reason: "challenge mismatch".to_string(),
                    })?;
                    self.close(CloseReason::Destroyed)?;
                    return Ok(());
                }
                self.login_state = LoginState::Welcomed;
                self.send_control(ControlMessage::Welcome {
                    map: self.config.map_name.clone(),
                    game_name: self.config.game_name.clone(),
                    redirect_url: String::new(),
                })?;
            }
            ControlMessage::Join => {
                if self.login_state == LoginState::Welcomed {
                    self.login_state = LoginState::ReceivedJoin;
                    tracing::info!(remote = %self.remote, "client joined");
                }
            }
            ControlMessage::Netspeed { rate } => {
                tracing::debug!(rate, "client requested netspeed");
            }
            ControlMessage::Failure { reason } => {
                tracing::warn!(reason = %reason, "peer reported failure");
                self.close(CloseReason::Destroyed)?;
            }
            _ => {
                tracing::debug!(tag = message.message_type(), "unexpected control message");
            }
        }
        Ok(())
    }

    fn handle_control_client(&mut self, message: &ControlMessage) -> Result<(), ConnectionError> {
        match message {
            ControlMessage::Challenge { challenge } => {
                self.login_state = LoginState::LoggingIn;
                self.send_control(ControlMessage::Login {
                    client_response: challenge.clone(),
                    request_url: self.config.map_name.clone(),
                    unique_id: String::new(),
                    online_platform_name: String::new(),
                })?;
            }
            ControlMessage::Welcome { .. } => {
                self.login_state = LoginState::Welcomed;
                self.send_control(ControlMessage::Join)?;
            }
            ControlMessage::Upgrade { protocol_version } => {
                tracing::warn!(
                    server_version = protocol_version,
                    "server requires a different network version"
                );
                self.close(CloseReason::Destroyed)?;
            }
            ControlMessage::Failure { reason } => {
                tracing::warn!(reason = %reason, "server reported failure");
                self.close(CloseReason::Destroyed)?;
            }
            _ => {
                tracing::debug!(tag = message.message_type(), "unexpected control message");
            }
        }
        Ok(())
    }

    /// Client side: open the control channel and start the login exchange.
    pub fn begin_login(&mut self) -> Result<(), ConnectionError> {
        self.open_channel(ChannelKind::Control)?;
        self.send_control(ControlMessage::Hello {
            is_little_endian: cfg!(target_endian = "little"),
            remote_network_version: self.config.network_version,
            encryption_token: String::new(),
        })
    }

    // ---------------------------------------------------------------- //
    // Send path
    // ---------------------------------------------------------------- //

    /// Open a channel locally; returns its index.
    pub fn open_channel(&mut self, kind: ChannelKind) -> Result<u32, ConnectionError> {
        let index = if kind == ChannelKind::Control {
            CONTROL_CHANNEL_INDEX as usize
        } else {
            self.channels
                .iter()
                .enumerate()
                .skip(1)
                .find(|(_, slot)| slot.is_none())
                .map(|(i, _)| i)
                .ok_or(ConnectionError::ChannelIndexOutOfRange(
                    self.config.max_channels as u32,
                ))?
        };
        if self.channels[index].is_some() {
            return Ok(index as u32);
        }
        self.channels[index] = Some(Channel::new(index as u32, kind, true));

        let mut open_bunch = Bunch::new(index as u32, kind.wire_name());
        open_bunch.control = true;
        open_bunch.reliable = true;
        self.queue_bunch(open_bunch)?;
        tracing::debug!(ch = index, kind = kind.name(), "channel opened locally");
        Ok(index as u32)
    }

    /// Queue a control message on channel 0.
    pub fn send_control(&mut self, message: ControlMessage) -> Result<(), ConnectionError> {
        if self.channels[CONTROL_CHANNEL_INDEX as usize].is_none() {
            self.open_channel(ChannelKind::Control)?;
        }
        let (payload, bits) = message.to_payload();
        let mut bunch = Bunch::new(CONTROL_CHANNEL_INDEX, ChannelKind::Control.wire_name());
        bunch.reliable = true;
        bunch.set_payload_bits(&payload, bits);
        self.queue_bunch(bunch)
    }

    /// Queue raw data on a channel, splitting oversized payloads into
    /// partial bunches (byte-aligned on all but the final fragment).
    pub fn send_data(
        &mut self,
        ch_index: u32,
        payload: &[u8],
        reliable: bool,
    ) -> Result<(), ConnectionError> {
        let slot = ch_index as usize;
        let Some(name) = self
            .channels
            .get(slot)
            .and_then(|s| s.as_ref())
            .map(|ch| ch.kind.wire_name())
        else {
            return Err(ConnectionError::ChannelIndexOutOfRange(ch_index));
        };

        if payload.len() <= MAX_SINGLE_BUNCH_BYTES {
            let mut bunch = Bunch::new(ch_index, name);
            bunch.reliable = reliable;
            bunch.set_payload_bytes(payload);
            return self.queue_bunch(bunch);
        }

        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + MAX_SINGLE_BUNCH_BYTES).min(payload.len());
            let mut bunch = Bunch::new(ch_index, name.clone());
            bunch.reliable = reliable;
            bunch.partial = true;
            bunch.partial_initial = offset == 0;
            bunch.partial_final = end == payload.len();
            bunch.set_payload_bytes(&payload[offset..end]);
            self.queue_bunch(bunch)?;
            offset = end;
        }
        Ok(())
    }

    /// Close one channel: the close bunch goes out reliable, and the slot
    /// tears down (freeing the index for reuse) once it is acknowledged.
    pub fn close_channel(
        &mut self,
        ch_index: u32,
        reason: CloseReason,
    ) -> Result<(), ConnectionError> {
        let slot = ch_index as usize;
        let Some(name) = self
            .channels
            .get(slot)
            .and_then(|s| s.as_ref())
            .map(|ch| ch.kind.wire_name())
        else {
            return Err(ConnectionError::ChannelIndexOutOfRange(ch_index));
        };
        let mut bunch = Bunch::new(ch_index, name);
        bunch.close = true;
        bunch.control = true;
        bunch.close_reason = reason;
        bunch.reliable = true;
        self.queue_bunch(bunch)?;
        if let Some(ch) = self.channels.get_mut(slot).and_then(|s| s.as_mut()) {
            ch.start_close(reason);
        }
        Ok(())
    }

    fn queue_bunch(&mut self, mut bunch: Bunch) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        let slot = bunch.ch_index as usize;
        // The first bunch either side sends on a channel announces the
        // open; the peer must not process anything on the channel before
        // seeing it.
        if let Some(ch) = self.channels.get_mut(slot).and_then(|s| s.as_mut()) {
            if !ch.open_sent && !bunch.close {
                bunch.open = true;
                ch.open_sent = true;
            }
        }
        if bunch.reliable {
            let next = (self.out_reliable[slot] as u32 + 1) % bunch::MAX_CHSEQUENCE;
            self.out_reliable[slot] = next as u16;
            bunch.ch_sequence = next;
        }
        self.pending.push_back(bunch);
        Ok(())
    }

    /// Build and return every packet ready to go on the wire.
    ///
    /// Reliable bunches are recorded against the packet that carries them;
    /// a nak later re-queues them through [`resend`](Self::process_ack_results).
    pub fn flush(&mut self, now: f64) -> Result<Vec<Vec<u8>>, ConnectionError> {
        if self.state != ConnectionState::Open && self.state != ConnectionState::Closed {
            return Ok(Vec::new());
        }
        let mut packets = Vec::new();

        while !self.resend.is_empty() || !self.pending.is_empty() {
            let packet = self.build_packet(now)?;
            packets.push(packet);
        }

        // Header-only keepalive when the link has gone quiet.
        if packets.is_empty()
            && self.state == ConnectionState::Open
            && now - self.last_send_time >= self.config.keepalive_interval
        {
            packets.push(self.build_packet(now)?);
        }
        Ok(packets)
    }

    fn build_packet(&mut self, now: f64) -> Result<Vec<u8>, ConnectionError> {
        let mut writer = BitWriter::with_capacity(MAX_PACKET_BYTES - 8);
        if !self.notify.write_header(&mut writer, false) {
            return Err(ConnectionError::MalformedHeader);
        }
        // Packet-info payload: jitter clock in milliseconds mod 1024.
        writer.write_bit(true);
        writer.write_bit(false);
        writer.write_bits(((now * 1000.0) as u64) & 0x3FF, 10);

        let packet_id = self.notify.out_seq();
        let mut carried = 0usize;

        loop {
            let source_resend = !self.resend.is_empty();
            let Some(bunch) = (if source_resend {
                self.resend.front()
            } else {
                self.pending.front()
            }) else {
                break;
            };

            let mut probe = BitWriter::resizable(MAX_PACKET_BYTES);
            bunch.write(&mut probe)?;
            if writer.num_bits() + probe.num_bits() + 1 > (MAX_PACKET_BYTES - 8) * 8 {
                if carried == 0 {
                    // A single bunch that cannot fit is a programming
                    // error upstream (send_data splits oversized payloads).
                    return Err(ConnectionError::Bunch(BunchError::PayloadTooLarge(
                        probe.num_bits(),
                    )));
                }
                break;
            }

            let Some(bunch) = (if source_resend {
                self.resend.pop_front()
            } else {
                self.pending.pop_front()
            }) else {
                break;
            };
            bunch.write(&mut writer)?;
            carried += 1;
            self.bunches_out += 1;
            telemetry::record_bunch_out();

            if bunch.reliable {
                let slot = bunch.ch_index as usize;
                if let Some(ch) = self.channels[slot].as_mut() {
                    ch.push_out_record(bunch, packet_id)?;
                }
            }
        }

        let bytes = self.pipeline.outgoing(writer)?;
        self.notify.commit_and_increment_out_seq();
        self.packets_out += 1;
        self.last_send_time = now;
        telemetry::record_packet_out(bytes.len());
        Ok(bytes)
    }

    // ---------------------------------------------------------------- //
    // Lifecycle
    // ---------------------------------------------------------------- //

    /// Per-tick maintenance: returns false when the connection timed out
    /// and has been closed.
    pub fn tick(&mut self, now: f64) -> bool {
        if self.state == ConnectionState::Open
            && now - self.last_receive_time > self.config.timeout
        {
            tracing::info!(remote = %self.remote, "connection timed out");
            self.close_internal(CloseReason::Destroyed);
            return false;
        }
        !self.is_closed()
    }

    /// Close gracefully: notify open channels' peers, then shut the door.
    pub fn close(&mut self, reason: CloseReason) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        for slot in 0..self.channels.len() {
            if let Some(ch) = self.channels[slot].as_ref() {
                if ch.opened_locally || ch.remote_opened {
                    let mut close_bunch = Bunch::new(slot as u32, ch.kind.wire_name());
                    close_bunch.close = true;
                    close_bunch.control = true;
                    close_bunch.close_reason = reason;
                    close_bunch.reliable = true;
                    self.queue_bunch(close_bunch)?;
                }
            }
        }
        self.close_internal(reason);
        Ok(())
    }

    fn close_internal(&mut self, reason: CloseReason) {
        if self.state != ConnectionState::Closed {
            tracing::debug!(remote = %self.remote, ?reason, "connection closed");
            self.state = ConnectionState::Closed;
            self.login_state = LoginState::CleanedUp;
            telemetry::record_connection_closed();
        }
    }
}
