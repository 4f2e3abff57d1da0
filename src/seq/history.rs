use crate::bitstream::{BitReader, BitWriter};

/// Capacity of the delivery-status bitmap, in packets.
pub const MAX_HISTORY_BITS: usize = 256;

const WORD_BITS: usize = 32;
const WORD_COUNT: usize = MAX_HISTORY_BITS / WORD_BITS;

/// Fixed-size rolling bitmap of delivery status for the most recent packets.
///
/// Bit 0 is the newest entry; appending shifts every older entry up one and
/// drops anything past the fixed capacity. The bitmap never shrinks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeqHistory {
    words: [u32; WORD_COUNT],
}

impl SeqHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.words = [0; WORD_COUNT];
    }

    /// Push the newest packet's delivery status at index 0.
    pub fn add_delivery_status(&mut self, delivered: bool) {
        let mut carry = delivered as u32;
        for word in self.words.iter_mut() {
            let next_carry = *word >> (WORD_BITS - 1);
            *word = (*word << 1) | carry;
            carry = next_carry;
        }
    }

    /// Delivery status `index` packets back; out-of-range reads as lost.
    pub fn is_delivered(&self, index: usize) -> bool {
        if index >= MAX_HISTORY_BITS {
            return false;
        }
        (self.words[index / WORD_BITS] >> (index % WORD_BITS)) & 1 == 1
    }

    /// Serialize the `word_count` newest words.
    pub fn write(&self, writer: &mut BitWriter, word_count: usize) {
        for word in self.words.iter().take(word_count.min(WORD_COUNT)) {
            writer.write_u32(*word);
        }
    }

    /// Deserialize `word_count` words; anything beyond reads as lost.
    pub fn read(&mut self, reader: &mut BitReader<'_>, word_count: usize) {
        self.reset();
        for i in 0..word_count {
            let word = reader.read_u32();
            if i < WORD_COUNT {
                self.words[i] = word;
            }
        }
    }
}
