use thiserror::Error;

use crate::bitstream::{BitReader, BitWriter};
use crate::names::{NameTable, HARDCODED_NAMES};

/// Reliable channel sequences share the 14-bit packet sequence space.
pub const MAX_CHSEQUENCE: u32 = 16384;

/// A single bunch's payload must fit one packet.
pub const MAX_BUNCH_PAYLOAD_BITS: usize = 1024 * 8;

/// Hard cap on a reassembled partial-bunch payload. Exceeding it is a
/// fatal protocol error, not a resize.
pub const MAX_PARTIAL_MERGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BunchError {
    #[error("malformed bunch header")]
    Malformed,
    #[error("bunch payload of {0} bits exceeds limit")]
    PayloadTooLarge(usize),
    #[error("unknown close reason {0}")]
    UnknownCloseReason(u32),
}

/// Why a channel is being closed; decides whether the remote peer destroys
/// its mirrored state or merely suspends replication.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CloseReason {
    #[default]
    Destroyed = 0,
    Dormancy = 1,
    LevelUnloaded = 2,
    Relevancy = 3,
    TearOff = 4,
}

pub const CLOSE_REASON_COUNT: u32 = 5;

impl CloseReason {
    pub fn from_u32(value: u32) -> Result<Self, BunchError> {
        match value {
            0 => Ok(CloseReason::Destroyed),
            1 => Ok(CloseReason::Dormancy),
            2 => Ok(CloseReason::LevelUnloaded),
            3 => Ok(CloseReason::Relevancy),
            4 => Ok(CloseReason::TearOff),
            other => Err(BunchError::UnknownCloseReason(other)),
        }
    }

    /// Whether the remote should tear down its mirrored state entirely.
    pub fn destroys_remote_state(self) -> bool {
        !matches!(self, CloseReason::Dormancy)
    }
}

/// A channel name on the wire: a bare index for pre-registered names, a
/// literal string plus instance number otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireName {
    Hardcoded(u32),
    Literal { name: String, number: u32 },
}

impl WireName {
    pub fn write(&self, w: &mut BitWriter) -> Result<(), BunchError> {
        match self {
            WireName::Hardcoded(index) => {
                w.write_bit(true);
                w.write_int_packed(*index);
            }
            WireName::Literal { name, number } => {
                w.write_bit(false);
                w.write_string(name).map_err(|_| BunchError::Malformed)?;
                w.write_int_packed(*number);
            }
        }
        Ok(())
    }

    pub fn read(r: &mut BitReader<'_>) -> Result<Self, BunchError> {
        if r.read_bit() {
            let index = r.read_int_packed();
            if r.is_error() || index as usize >= HARDCODED_NAMES.len() {
                return Err(BunchError::Malformed);
            }
            Ok(WireName::Hardcoded(index))
        } else {
            let name = r.read_string();
            let number = r.read_int_packed();
            if r.is_error() || name.is_empty() {
                return Err(BunchError::Malformed);
            }
            Ok(WireName::Literal { name, number })
        }
    }

    /// Resolve to the local interning table.
    pub fn resolve(&self, names: &NameTable) -> Option<String> {
        match self {
            WireName::Hardcoded(index) => {
                HARDCODED_NAMES.get(*index as usize).map(|s| (*s).to_string())
            }
            WireName::Literal { name, .. } => {
                names.intern(name);
                Some(name.clone())
            }
        }
    }
}

/// One length-delimited message addressed to a channel, together with its
/// bit-level payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Bunch {
    pub control: bool,
    pub open: bool,
    pub close: bool,
    pub close_reason: CloseReason,
    pub replication_paused: bool,
    pub reliable: bool,
    pub ch_index: u32,
    pub has_package_map_exports: bool,
    pub has_must_be_mapped_guids: bool,
    pub partial: bool,
    /// Reliable sequence; meaningful only when `reliable` is set.
    pub ch_sequence: u32,
    pub partial_initial: bool,
    pub partial_final: bool,
    pub ch_name: WireName,
    pub payload: Vec<u8>,
    pub payload_bits: usize,
}

impl Bunch {
    /// A minimal bunch addressed to `ch_index`.
    pub fn new(ch_index: u32, ch_name: WireName) -> Self {
        Self {
            control: false,
            open: false,
            close: false,
            close_reason: CloseReason::Destroyed,
            replication_paused: false,
            reliable: false,
            ch_index,
            has_package_map_exports: false,
            has_must_be_mapped_guids: false,
            partial: false,
            ch_sequence: 0,
            partial_initial: false,
            partial_final: false,
            ch_name,
            payload: Vec::new(),
            payload_bits: 0,
        }
    }

    pub fn set_payload_bytes(&mut self, bytes: &[u8]) {
        self.payload = bytes.to_vec();
        self.payload_bits = bytes.len() * 8;
    }

    pub fn set_payload_bits(&mut self, bytes: &[u8], bits: usize) {
        debug_assert!(bits <= bytes.len() * 8);
        self.payload = bytes.to_vec();
        self.payload_bits = bits;
    }

    /// Serialize header then payload, in the fixed wire field order.
    pub fn write(&self, w: &mut BitWriter) -> Result<(), BunchError> {
        w.write_bit(self.control);
        w.write_bit(self.open);
        w.write_bit(self.close);
        w.write_int_max(self.close_reason as u32, CLOSE_REASON_COUNT)
            .map_err(|_| BunchError::Malformed)?;
        w.write_bit(self.replication_paused);
        w.write_bit(self.reliable);
        w.write_int_packed(self.ch_index);
        w.write_bit(self.has_package_map_exports);
        w.write_bit(self.has_must_be_mapped_guids);
        w.write_bit(self.partial);
        if self.reliable {
            w.write_int_max(self.ch_sequence, MAX_CHSEQUENCE)
                .map_err(|_| BunchError::Malformed)?;
        }
        if self.partial {
            w.write_bit(self.partial_initial);
            w.write_bit(self.partial_final);
        }
        self.ch_name.write(w)?;

        if self.payload_bits > MAX_BUNCH_PAYLOAD_BITS {
            return Err(BunchError::PayloadTooLarge(self.payload_bits));
        }
        w.write_int_packed(self.payload_bits as u32);
        write_bit_run(w, &self.payload, self.payload_bits);
        if w.is_error() {
            return Err(BunchError::Malformed);
        }
        Ok(())
    }

    /// Inverse of [`write`](Self::write).
    pub fn read(r: &mut BitReader<'_>) -> Result<Self, BunchError> {
        let control = r.read_bit();
        let open = r.read_bit();
        let close = r.read_bit();
        let close_reason = CloseReason::from_u32(r.read_int_max(CLOSE_REASON_COUNT))?;
        let replication_paused = r.read_bit();
        let reliable = r.read_bit();
        let ch_index = r.read_int_packed();
        let has_package_map_exports = r.read_bit();
        let has_must_be_mapped_guids = r.read_bit();
        let partial = r.read_bit();
        let ch_sequence = if reliable {
            r.read_int_max(MAX_CHSEQUENCE)
        } else {
            0
        };
        let (partial_initial, partial_final) = if partial {
            (r.read_bit(), r.read_bit())
        } else {
            (false, false)
        };
        let ch_name = WireName::read(r)?;

        let payload_bits = r.read_int_packed() as usize;
        if payload_bits > MAX_BUNCH_PAYLOAD_BITS {
            r.set_error();
            return Err(BunchError::PayloadTooLarge(payload_bits));
        }
        if r.is_error() || payload_bits > r.remaining_bits() {
            r.set_error();
            return Err(BunchError::Malformed);
        }
        let payload = read_bit_run(r, payload_bits);
        if r.is_error() {
            return Err(BunchError::Malformed);
        }
        Ok(Self {
            control,
            open,
            close,
            close_reason,
            replication_paused,
            reliable,
            ch_index,
            has_package_map_exports,
            has_must_be_mapped_guids,
            partial,
            ch_sequence,
            partial_initial,
            partial_final,
            ch_name,
            payload,
            payload_bits,
        })
    }
}

/// Copy `bits` bits out of `src` into the writer, starting at src bit 0.
pub fn write_bit_run(w: &mut BitWriter, src: &[u8], bits: usize) {
    let whole = bits / 8;
    w.write_bytes(&src[..whole]);
    let rest = bits % 8;
    if rest > 0 {
        w.write_bits(src[whole] as u64, rest as u32);
    }
}

/// Read `bits` bits into a fresh byte-aligned buffer.
pub fn read_bit_run(r: &mut BitReader<'_>, bits: usize) -> Vec<u8> {
    let mut out = vec![0u8; (bits + 7) / 8];
    let whole = bits / 8;
    r.read_bytes(&mut out[..whole]);
    let rest = bits % 8;
    if rest > 0 {
        out[whole] = r.read_bits(rest as u32) as u8;
    }
    out
}
