#![no_main]
use gale::ticket::AppTicket;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = AppTicket::parse(data);
});
