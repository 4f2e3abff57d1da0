//! Channels: typed sub-streams multiplexed over one connection.
//!
//! Each channel owns its own reliable sequencing, an ahead-of-order queue
//! for reliable bunches that arrive early, the partial-bunch reassembly
//! buffer, and the retransmission records for reliable bunches it has sent.
//! Control decodes the tagged login protocol; actor and voice are lifecycle
//! placeholders.

pub mod control;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;

use thiserror::Error;

use crate::connection::bunch::{Bunch, CloseReason, WireName, MAX_PARTIAL_MERGE_BYTES};
use crate::seq::SeqNum;

pub use control::{ControlError, ControlMessage};

/// Most reliable bunches a channel may buffer in either direction before
/// the connection is considered broken.
pub const RELIABLE_BUFFER: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("reliable sequence gap on an internal-ack connection")]
    ReliableGapOnInternalAck,
    #[error("reliable partial bunch destroyed by a new reliable initial")]
    PartialInitialReliableDestroy,
    #[error("reassembled partial bunch of {0} bytes exceeds limit")]
    PartialMergeTooLarge(usize),
    #[error("non-final partial fragment is not byte aligned")]
    PartialFragmentUnaligned,
    #[error("reliable buffer overflow on channel {0}")]
    ReliableBufferOverflow(u32),
    #[error("control message error: {0}")]
    Control(#[from] ControlError),
}

/// The closed set of channel types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Actor,
    Voice,
}

impl ChannelKind {
    pub fn name(self) -> &'static str {
        match self {
            ChannelKind::Control => "Control",
            ChannelKind::Actor => "Actor",
            ChannelKind::Voice => "Voice",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Control" => Some(ChannelKind::Control),
            "Actor" => Some(ChannelKind::Actor),
            "Voice" => Some(ChannelKind::Voice),
            _ => None,
        }
    }

    /// The hardcoded wire index for this kind's channel name.
    pub fn wire_name(self) -> WireName {
        let index = match self {
            ChannelKind::Control => 1,
            ChannelKind::Actor => 2,
            ChannelKind::Voice => 3,
        };
        WireName::Hardcoded(index)
    }
}

/// A reliable bunch awaiting acknowledgment, tagged with the packet that
/// carried it last.
#[derive(Clone, Debug)]
pub struct OutRecord {
    pub bunch: Bunch,
    pub packet_id: SeqNum,
}

/// Per-connection channel state.
pub struct Channel {
    pub index: u32,
    pub kind: ChannelKind,
    /// True when this side created the channel (rather than a remote open
    /// bunch).
    pub opened_locally: bool,
    /// True once the remote's open bunch has been processed; bunches on a
    /// locally-opened channel must not be processed before this.
    pub remote_opened: bool,
    /// Our open bunch has been acknowledged.
    pub open_acked: bool,
    /// Our first outgoing bunch (which carries the open flag) was queued.
    pub open_sent: bool,
    pub dormant: bool,
    pub closing: bool,
    pub broken: bool,
    in_partial: Option<Bunch>,
    in_rec: VecDeque<Bunch>,
    pub(crate) out_rec: Vec<OutRecord>,
}

impl Channel {
    pub fn new(index: u32, kind: ChannelKind, opened_locally: bool) -> Self {
        Self {
            index,
            kind,
            opened_locally,
            remote_opened: !opened_locally,
            open_acked: false,
            open_sent: false,
            dormant: false,
            closing: false,
            broken: false,
            in_partial: None,
            in_rec: VecDeque::new(),
            out_rec: Vec::new(),
        }
    }

    pub fn has_pending_reliable(&self) -> bool {
        !self.out_rec.is_empty()
    }

    /// Accept a bunch off the wire, enforcing reliable ordering.
    ///
    /// Returns every logical bunch that became ready: the incoming one
    /// (possibly after reassembly) plus any queued successors it unblocked.
    /// `in_reliable` is the connection's per-channel reliable sequence
    /// counter.
    pub fn received_raw_bunch(
        &mut self,
        bunch: Bunch,
        in_reliable: &mut u16,
        internal_ack: bool,
    ) -> Result<Vec<Bunch>, ChannelError> {
        if self.broken {
            tracing::debug!(ch = self.index, "dropping bunch on broken channel");
            return Ok(Vec::new());
        }

        if bunch.reliable {
            let expected = next_reliable(*in_reliable);
            if bunch.ch_sequence != expected {
                if internal_ack {
                    // A fully-reliable connection delivers in order by
                    // construction; a gap here is a protocol violation.
                    return Err(ChannelError::ReliableGapOnInternalAck);
                }
                let ahead = SeqNum::diff(
                    SeqNum::new(bunch.ch_sequence as u16),
                    SeqNum::new(expected as u16),
                );
                if ahead > 0 {
                    self.queue_ahead(bunch)?;
                } else {
                    tracing::trace!(
                        ch = self.index,
                        seq = bunch.ch_sequence,
                        "duplicate reliable bunch dropped"
                    );
                }
                return Ok(Vec::new());
            }
        }

        let mut ready = Vec::new();
        if let Some(done) = self.received_next_bunch(bunch, in_reliable)? {
            ready.push(done);
        }

        // The accepted bunch may unblock queued successors.
        loop {
            match self.in_rec.front() {
                Some(front) if front.ch_sequence == next_reliable(*in_reliable) => {}
                _ => break,
            }
            let Some(queued) = self.in_rec.pop_front() else {
                break;
            };
            if let Some(done) = self.received_next_bunch(queued, in_reliable)? {
                ready.push(done);
            }
        }
        Ok(ready)
    }

    fn queue_ahead(&mut self, bunch: Bunch) -> Result<(), ChannelError> {
        if self.in_rec.len() >= RELIABLE_BUFFER {
            self.broken = true;
            return Err(ChannelError::ReliableBufferOverflow(self.index));
        }
        // Keep the queue ordered and duplicate-free.
        let pos = self
            .in_rec
            .iter()
            .position(|queued| {
                SeqNum::diff(
                    SeqNum::new(queued.ch_sequence as u16),
                    SeqNum::new(bunch.ch_sequence as u16),
                ) >= 0
            });
        match pos {
            Some(i) if self.in_rec[i].ch_sequence == bunch.ch_sequence => {}
            Some(i) => self.in_rec.insert(i, bunch),
            None => self.in_rec.push_back(bunch),
        }
        Ok(())
    }

    /// Handle the next in-order bunch: advance the reliable counter and run
    /// partial-bunch reassembly. Returns the completed logical bunch, if
    /// this one completed anything.
    fn received_next_bunch(
        &mut self,
        bunch: Bunch,
        in_reliable: &mut u16,
    ) -> Result<Option<Bunch>, ChannelError> {
        if bunch.reliable {
            *in_reliable = bunch.ch_sequence as u16;
        }
        if !bunch.partial {
            return Ok(Some(bunch));
        }

        if bunch.partial_initial {
            if let Some(old) = self.in_partial.take() {
                if old.reliable {
                    if bunch.reliable {
                        // Two reliable streams colliding can only mean a
                        // desynced or hostile peer.
                        return Err(ChannelError::PartialInitialReliableDestroy);
                    }
                    // The reliable buffer wins; the unreliable newcomer is
                    // dropped on the floor.
                    self.in_partial = Some(old);
                    return Ok(None);
                }
                tracing::debug!(
                    ch = self.index,
                    "discarding incomplete unreliable partial bunch"
                );
            }
            if !bunch.partial_final && bunch.payload_bits % 8 != 0 {
                return self.partial_alignment_violation(bunch.reliable);
            }
            if bunch.partial_final {
                // Degenerate single-fragment partial.
                let mut merged = bunch;
                merged.partial_final = true;
                return Ok(Some(merged));
            }
            self.in_partial = Some(bunch);
            return Ok(None);
        }

        // Continuation fragment.
        let Some(mut acc) = self.in_partial.take() else {
            // No initial fragment to attach to; out-of-order or stale.
            tracing::debug!(
                ch = self.index,
                "partial continuation without initial, dropped"
            );
            return Ok(None);
        };
        if acc.reliable != bunch.reliable {
            if acc.reliable {
                // Keep the reliable buffer, ignore the stray fragment.
                self.in_partial = Some(acc);
            }
            return Ok(None);
        }
        if !bunch.partial_final && bunch.payload_bits % 8 != 0 {
            return self.partial_alignment_violation(acc.reliable);
        }

        let merged_bytes = acc.payload.len() + bunch.payload.len();
        if merged_bytes > MAX_PARTIAL_MERGE_BYTES {
            return Err(ChannelError::PartialMergeTooLarge(merged_bytes));
        }
        debug_assert!(acc.payload_bits % 8 == 0);
        acc.payload.extend_from_slice(&bunch.payload[..(bunch.payload_bits + 7) / 8]);
        acc.payload_bits += bunch.payload_bits;
        if bunch.reliable {
            acc.ch_sequence = bunch.ch_sequence;
        }

        if bunch.partial_final {
            acc.partial_final = true;
            Ok(Some(acc))
        } else {
            self.in_partial = Some(acc);
            Ok(None)
        }
    }

    fn partial_alignment_violation(
        &mut self,
        reliable: bool,
    ) -> Result<Option<Bunch>, ChannelError> {
        if reliable {
            Err(ChannelError::PartialFragmentUnaligned)
        } else {
            // Unreliable merge conflicts are expected under loss; drop the
            // buffer and move on.
            self.in_partial = None;
            Ok(None)
        }
    }

    /// Record an outgoing reliable bunch for retransmission.
    pub fn push_out_record(&mut self, bunch: Bunch, packet_id: SeqNum) -> Result<(), ChannelError> {
        if self.out_rec.len() >= RELIABLE_BUFFER {
            self.broken = true;
            return Err(ChannelError::ReliableBufferOverflow(self.index));
        }
        self.out_rec.push(OutRecord { bunch, packet_id });
        Ok(())
    }

    /// Drop every out-record carried by the acked packet. Returns whether
    /// any of them was this channel's open bunch.
    pub fn acked_packet(&mut self, packet_id: SeqNum) -> bool {
        let mut acked_open = false;
        self.out_rec.retain(|record| {
            if record.packet_id == packet_id {
                acked_open |= record.bunch.open;
                false
            } else {
                true
            }
        });
        if acked_open {
            self.open_acked = true;
        }
        acked_open
    }

    /// Remove and return the bunches carried by a lost packet; the caller
    /// re-queues them and they re-record under the retransmitting packet.
    pub fn take_naked(&mut self, packet_id: SeqNum) -> Vec<Bunch> {
        let mut naked = Vec::new();
        self.out_rec.retain(|record| {
            if record.packet_id == packet_id {
                naked.push(record.bunch.clone());
                false
            } else {
                true
            }
        });
        naked
    }

    /// Begin closing; the channel is destroyed once the close bunch acks.
    pub fn start_close(&mut self, reason: CloseReason) {
        self.closing = true;
        if reason == CloseReason::Dormancy {
            self.dormant = true;
        }
    }

    /// Ready for teardown: closing with nothing left unacknowledged. Only
    /// after this may the index be reused.
    pub fn can_destroy(&self) -> bool {
        self.closing && self.out_rec.is_empty()
    }
}

fn next_reliable(current: u16) -> u32 {
    ((current as u32) + 1) % crate::connection::bunch::MAX_CHSEQUENCE
}
