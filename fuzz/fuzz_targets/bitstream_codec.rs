#![no_main]
use gale::bitstream::BitReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut reader = BitReader::new(data, data.len() * 8);
    let _ = reader.read_int_packed();
    let _ = reader.read_string();
    let _ = reader.read_bits(33);
    let _ = reader.read_int_max(5);
    // The sticky error flag must keep every later read total.
    let _ = reader.read_u64();
    let _ = reader.read_string();
});
