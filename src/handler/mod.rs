//! Packet handler pipeline.
//!
//! An ordered chain of components sits between the reliability layer and
//! the socket. Each component may transform outgoing packets and must
//! invert that transform on incoming packets: whatever one side prepends,
//! the peer's matching component strips. Components run in order on the way
//! out and in reverse order on the way in.
//!
//! The one shipped component is [`HandshakeBitComponent`], which frames
//! every packet with a single leading is-handshake bit. Handshake traffic
//! itself is emitted through the raw-send bypass so the pipeline never
//! re-frames its own packets.

use thiserror::Error;

use crate::bitstream::{packet_bit_len, BitWriter};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("incoming packet empty or missing terminator")]
    MissingTerminator,
    #[error("incoming packet truncated inside component framing")]
    Truncated,
    #[error("outgoing packet exceeded writer capacity")]
    Overflow,
}

/// An incoming packet passing through the pipeline. Components strip their
/// framing by advancing `bit_offset`; the payload is
/// `bits [bit_offset, bit_len)` of `data`.
#[derive(Debug)]
pub struct IncomingPacket {
    pub data: Vec<u8>,
    pub bit_len: usize,
    pub bit_offset: usize,
    /// Set by [`HandshakeBitComponent`] when the leading bit marked the
    /// packet as connectionless handshake traffic.
    pub handshake: bool,
}

impl IncomingPacket {
    pub fn payload_bits(&self) -> usize {
        self.bit_len.saturating_sub(self.bit_offset)
    }
}

/// One transform in the chain. `outgoing` receives the accumulated packet
/// and returns the transformed one; `incoming` must invert it.
pub trait HandlerComponent: Send {
    fn outgoing(&mut self, packet: BitWriter) -> Result<BitWriter, HandlerError>;
    fn incoming(&mut self, packet: &mut IncomingPacket) -> Result<(), HandlerError>;
}

/// Prepends the 1-bit is-handshake flag (always 0 for pipeline traffic) and
/// strips/classifies it on the way in.
pub struct HandshakeBitComponent;

impl HandlerComponent for HandshakeBitComponent {
    fn outgoing(&mut self, packet: BitWriter) -> Result<BitWriter, HandlerError> {
        let mut framed = BitWriter::resizable(packet.num_bytes() + 1);
        framed.write_bit(false);
        // Re-pack shifted by one bit.
        let bytes = packet.as_bytes();
        let bits = packet.num_bits();
        for i in 0..bits {
            framed.write_bit((bytes[i >> 3] >> (i & 7)) & 1 == 1);
        }
        if framed.is_error() {
            return Err(HandlerError::Overflow);
        }
        Ok(framed)
    }

    fn incoming(&mut self, packet: &mut IncomingPacket) -> Result<(), HandlerError> {
        if packet.payload_bits() < 1 {
            return Err(HandlerError::Truncated);
        }
        let bit =
            (packet.data[packet.bit_offset >> 3] >> (packet.bit_offset & 7)) & 1 == 1;
        packet.bit_offset += 1;
        packet.handshake = bit;
        Ok(())
    }
}

/// The ordered component chain plus the raw-send bypass flag.
pub struct PacketPipeline {
    components: Vec<Box<dyn HandlerComponent>>,
    raw_send: bool,
}

impl PacketPipeline {
    /// The standard pipeline: just the handshake-bit component.
    pub fn new() -> Self {
        Self {
            components: vec![Box::new(HandshakeBitComponent)],
            raw_send: false,
        }
    }

    pub fn empty() -> Self {
        Self {
            components: Vec::new(),
            raw_send: false,
        }
    }

    pub fn push(&mut self, component: Box<dyn HandlerComponent>) {
        self.components.push(component);
    }

    /// While set, [`outgoing`](Self::outgoing) passes packets through
    /// untouched. Used by the handshake path, which frames its own packets.
    pub fn set_raw_send(&mut self, raw: bool) {
        self.raw_send = raw;
    }

    pub fn raw_send(&self) -> bool {
        self.raw_send
    }

    /// Apply every component in order, append the terminator, and return
    /// the wire bytes.
    pub fn outgoing(&mut self, packet: BitWriter) -> Result<Vec<u8>, HandlerError> {
        if packet.is_error() {
            return Err(HandlerError::Overflow);
        }
        let mut current = packet;
        if !self.raw_send {
            for component in self.components.iter_mut() {
                current = component.outgoing(current)?;
            }
        }
        current.write_terminator();
        if current.is_error() {
            return Err(HandlerError::Overflow);
        }
        Ok(current.as_bytes().to_vec())
    }

    /// Recover the exact bit length from the terminator, then apply every
    /// component in reverse order. A failure here is transport-fatal for an
    /// established connection: the peer's pipeline and ours disagree.
    pub fn incoming(&mut self, data: &[u8]) -> Result<IncomingPacket, HandlerError> {
        let bit_len = packet_bit_len(data).ok_or(HandlerError::MissingTerminator)?;
        let mut packet = IncomingPacket {
            data: data.to_vec(),
            bit_len,
            bit_offset: 0,
            handshake: false,
        };
        for component in self.components.iter_mut().rev() {
            component.incoming(&mut packet)?;
        }
        Ok(packet)
    }
}

impl Default for PacketPipeline {
    fn default() -> Self {
        Self::new()
    }
}
