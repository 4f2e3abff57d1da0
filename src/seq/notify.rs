use std::collections::VecDeque;

use super::history::{SeqHistory, MAX_HISTORY_BITS};
use super::number::{SeqNum, SEQ_NUM_BITS};
use crate::bitstream::{BitReader, BitWriter};

/// Most history words a single header may carry (the full 256-bit bitmap).
pub const MAX_HISTORY_WORD_COUNT: usize = MAX_HISTORY_BITS / 32;

const HISTORY_COUNT_BITS: u32 = 4;

/// Decoded form of the compact packet header: one packed 32-bit word
/// followed by `history_word_count` 32-bit ack-history words.
#[derive(Clone, Debug)]
pub struct PacketHeader {
    pub seq: SeqNum,
    pub acked_seq: SeqNum,
    pub history_word_count: usize,
    pub history: SeqHistory,
}

impl PacketHeader {
    pub fn read(reader: &mut BitReader<'_>) -> Option<Self> {
        let packed = reader.read_u32();
        if reader.is_error() {
            return None;
        }
        let seq = SeqNum::new((packed >> (SEQ_NUM_BITS + HISTORY_COUNT_BITS)) as u16);
        let acked_seq = SeqNum::new((packed >> HISTORY_COUNT_BITS) as u16);
        let history_word_count = ((packed & ((1 << HISTORY_COUNT_BITS) - 1)) + 1) as usize;
        let mut history = SeqHistory::new();
        history.read(reader, history_word_count);
        if reader.is_error() {
            return None;
        }
        Some(Self {
            seq,
            acked_seq,
            history_word_count,
            history,
        })
    }
}

#[derive(Clone, Copy, Debug)]
struct SentAckData {
    out_seq: SeqNum,
    in_ack_seq: SeqNum,
}

/// Per-connection sequence/ack state.
///
/// Tracks the incoming sequence (`in_seq`), the newest incoming packet we
/// have acknowledged (`in_ack_seq`), the oldest of our acks known to have
/// reached the peer (`in_ack_seq_ack`, which bounds how much history a
/// header must carry), and the outgoing counters (`out_seq`, `out_ack_seq`).
pub struct PacketNotify {
    in_seq: SeqNum,
    in_ack_seq: SeqNum,
    in_ack_seq_ack: SeqNum,
    out_seq: SeqNum,
    out_ack_seq: SeqNum,
    in_seq_history: SeqHistory,
    ack_records: VecDeque<SentAckData>,
    written_history_word_count: usize,
    written_in_ack_seq: SeqNum,
}

impl Default for PacketNotify {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketNotify {
    pub fn new() -> Self {
        Self {
            in_seq: SeqNum::default(),
            in_ack_seq: SeqNum::default(),
            in_ack_seq_ack: SeqNum::default(),
            out_seq: SeqNum::default(),
            out_ack_seq: SeqNum::new(u16::MAX),
            in_seq_history: SeqHistory::new(),
            ack_records: VecDeque::new(),
            written_history_word_count: 0,
            written_in_ack_seq: SeqNum::default(),
        }
    }

    /// Reset all counters to handshake-derived initial values.
    pub fn init(&mut self, initial_in: SeqNum, initial_out: SeqNum) {
        self.in_seq = initial_in;
        self.in_ack_seq = initial_in;
        self.in_ack_seq_ack = initial_in;
        self.out_seq = initial_out;
        self.out_ack_seq = SeqNum::new(initial_out.value().wrapping_sub(1));
        self.in_seq_history.reset();
        self.ack_records.clear();
        self.written_history_word_count = 0;
        self.written_in_ack_seq = initial_in;
    }

    pub fn in_seq(&self) -> SeqNum {
        self.in_seq
    }

    pub fn in_ack_seq(&self) -> SeqNum {
        self.in_ack_seq
    }

    pub fn in_ack_seq_ack(&self) -> SeqNum {
        self.in_ack_seq_ack
    }

    pub fn out_seq(&self) -> SeqNum {
        self.out_seq
    }

    pub fn out_ack_seq(&self) -> SeqNum {
        self.out_ack_seq
    }

    /// Words of history needed to cover every ack the peer may not have
    /// seen yet.
    fn current_history_word_count(&self) -> usize {
        let unseen = SeqNum::diff(self.in_ack_seq, self.in_ack_seq_ack).max(0) as usize;
        ((unseen + 31) / 32).clamp(1, MAX_HISTORY_WORD_COUNT)
    }

    /// Write the packet header.
    ///
    /// A `refresh` write re-emits the header for a packet that has not been
    /// flushed yet; it must not shrink the history word count committed by
    /// the original write, so it fails (returning `false`) when more words
    /// are now required and the caller has to do a full write instead.
    pub fn write_header(&mut self, writer: &mut BitWriter, refresh: bool) -> bool {
        let mut word_count = self.current_history_word_count();
        if refresh {
            if self.written_history_word_count == 0 || word_count > self.written_history_word_count
            {
                return false;
            }
            word_count = self.written_history_word_count;
        } else {
            self.written_history_word_count = word_count;
            self.written_in_ack_seq = self.in_ack_seq;
        }

        let packed = ((self.out_seq.value() as u32) << (SEQ_NUM_BITS + HISTORY_COUNT_BITS))
            | ((self.written_in_ack_seq.value() as u32) << HISTORY_COUNT_BITS)
            | (word_count as u32 - 1);
        writer.write_u32(packed);
        self.in_seq_history.write(writer, word_count);
        !writer.is_error()
    }

    /// Validate an incoming header against local state.
    ///
    /// Returns the positive gap between the header's sequence and `in_seq`,
    /// or 0 when the packet must be ignored: stale/duplicate sequence, an
    /// acked sequence older than what the peer already acked, or an ack for
    /// a packet we never sent.
    pub fn get_sequence_delta(&self, header: &PacketHeader) -> i32 {
        if header.seq.greater_than(self.in_seq)
            && header.acked_seq.greater_eq(self.out_ack_seq)
            && self.out_seq.greater_than(header.acked_seq)
        {
            SeqNum::diff(header.seq, self.in_seq)
        } else {
            0
        }
    }

    /// Process a validated header: resolve every newly-acknowledged
    /// outgoing sequence through `on_ack(seq, delivered)` in ascending
    /// order, then advance `in_seq`. Returns the sequence delta, 0 when the
    /// header was rejected.
    pub fn update<F: FnMut(SeqNum, bool)>(&mut self, header: &PacketHeader, mut on_ack: F) -> i32 {
        let delta = self.get_sequence_delta(header);
        if delta > 0 {
            self.process_received_acks(header, &mut on_ack);
            self.in_seq = header.seq;
        }
        delta
    }

    fn process_received_acks<F: FnMut(SeqNum, bool)>(
        &mut self,
        header: &PacketHeader,
        on_ack: &mut F,
    ) {
        if !header.acked_seq.greater_than(self.out_ack_seq) {
            return;
        }
        let ack_count = SeqNum::diff(header.acked_seq, self.out_ack_seq) as usize;
        self.update_in_ack_seq_ack(ack_count, header.acked_seq);

        let mut seq = self.out_ack_seq.increment();
        loop {
            let index = SeqNum::diff(header.acked_seq, seq);
            debug_assert!(index >= 0);
            let delivered = header.history.is_delivered(index as usize);
            on_ack(seq, delivered);
            if seq == header.acked_seq {
                break;
            }
            seq = seq.increment();
        }
        self.out_ack_seq = header.acked_seq;
    }

    fn update_in_ack_seq_ack(&mut self, ack_count: usize, acked_seq: SeqNum) {
        if ack_count > 0 && ack_count <= self.ack_records.len() {
            for _ in 0..ack_count {
                if let Some(record) = self.ack_records.pop_front() {
                    if record.out_seq == acked_seq {
                        self.in_ack_seq_ack = record.in_ack_seq;
                    }
                }
            }
        } else {
            // Records ran dry (e.g. after a re-init); fall back to the
            // newest ack so the history requirement stays bounded.
            self.ack_records.clear();
            self.in_ack_seq_ack = self.in_ack_seq;
        }
    }

    /// Record the just-written header as sent and advance `out_seq`.
    /// Must follow a successful [`write_header`](Self::write_header).
    pub fn commit_and_increment_out_seq(&mut self) -> SeqNum {
        debug_assert!(self.written_history_word_count != 0);
        self.ack_records.push_back(SentAckData {
            out_seq: self.out_seq,
            in_ack_seq: self.written_in_ack_seq,
        });
        self.written_history_word_count = 0;
        self.out_seq = self.out_seq.increment();
        self.out_seq
    }

    /// Acknowledge the incoming packet `seq`, recording any skipped
    /// intermediate sequences as lost.
    pub fn ack_seq(&mut self, seq: SeqNum, delivered: bool) {
        while seq.greater_than(self.in_ack_seq) {
            self.in_ack_seq = self.in_ack_seq.increment();
            let status = self.in_ack_seq == seq && delivered;
            self.in_seq_history.add_delivery_status(status);
        }
    }
}
