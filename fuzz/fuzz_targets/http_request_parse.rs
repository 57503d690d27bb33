//! Fuzz target for the HTTP request parser.
//!
//! Same contract as the response target: arbitrary input never panics.

#![no_main]

use floodgate_http::RequestParser;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = RequestParser::new();
    if parser.decode(data).is_ok() {
        let _ = parser.decode_eof();
    }
});
