//! Fuzz target for chunk-split equivalence.
//!
//! Splitting a byte stream at an arbitrary point must not change what the
//! parser produces: same messages, or an error in both runs.

#![no_main]

use floodgate_http::ResponseParser;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (Vec<u8>, usize)| {
    let (data, split) = input;
    let split = if data.is_empty() { 0 } else { split % data.len() };

    let mut whole = ResponseParser::new();
    let one_shot = whole.decode(&data);

    let mut chunked = ResponseParser::new();
    let in_pieces = chunked
        .decode(&data[..split])
        .and_then(|mut first| {
            let second = chunked.decode(&data[split..])?;
            first.extend(second);
            Ok(first)
        });

    match (one_shot, in_pieces) {
        (Ok(a), Ok(b)) => assert_eq!(a, b),
        (Err(_), Err(_)) => {},
        (a, b) => panic!("split changed the outcome: whole={a:?} chunked={b:?}"),
    }
});
