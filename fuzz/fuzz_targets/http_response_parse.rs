//! Fuzz target for the HTTP response parser.
//!
//! Feeds arbitrary bytes to the incremental parser. It must never panic:
//! every invalid input is an error, every valid input a message.

#![no_main]

use floodgate_http::ResponseParser;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = ResponseParser::new();
    if parser.decode(data).is_ok() {
        let _ = parser.decode_eof();
    }
});
