#![no_main]
use gale::bitstream::BitReader;
use gale::connection::bunch::Bunch;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut reader = BitReader::new(data, data.len() * 8);
    // Decoding must never panic or allocate unboundedly, only error out.
    while reader.remaining_bits() > 0 {
        if Bunch::read(&mut reader).is_err() {
            break;
        }
    }
});
