#![no_main]
use gale::bitstream::{packet_bit_len, BitReader};
use gale::handshake::HandshakeMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some(bit_len) = packet_bit_len(data) else {
        return;
    };
    if bit_len == 0 {
        return;
    }
    let mut reader = BitReader::new(data, bit_len);
    let _ = reader.read_bit();
    if let Ok(message) = HandshakeMessage::decode(&mut reader, bit_len - 1) {
        // NaN timestamps never compare equal; skip the round-trip check.
        if message != message {
            return;
        }
        // Round-trip: anything that decodes must re-encode to itself.
        let encoded = message.encode();
        let redecoded_len = packet_bit_len(&encoded).unwrap();
        let mut r2 = BitReader::new(&encoded, redecoded_len);
        let _ = r2.read_bit();
        let redecoded = HandshakeMessage::decode(&mut r2, redecoded_len - 1).unwrap();
        assert_eq!(message, redecoded);
    }
});
