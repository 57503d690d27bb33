//! Property-based tests for the HTTP codec.
//!
//! Verifies the codec contract over arbitrary messages and arbitrary
//! chunkings of the byte stream, not just hand-picked examples:
//!
//! - encode → decode yields the original message with `content-length`
//!   prepended (when absent) reflecting the body length
//! - feeding a stream in arbitrary chunks decodes the same sequence as
//!   feeding it whole

use bytes::BytesMut;
use floodgate_core::Codec;
use floodgate_http::{
    Headers, HttpClientCodec, HttpCode, HttpRequest, HttpResponse, HttpServerCodec, Method,
    RequestParser, ResponseParser, Version,
};
use proptest::prelude::*;

/// Header names that the codec or parser treats specially.
fn is_reserved(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
}

fn arb_header() -> impl Strategy<Value = (String, String)> {
    let name = "[A-Za-z][A-Za-z0-9-]{0,12}"
        .prop_filter("reserved header name", |n: &String| !is_reserved(n));
    // Values keep trailing whitespace but the parser trims leading, so
    // start with a visible character (or be empty).
    let value = prop_oneof![Just(String::new()), "[!-~][ -~]{0,23}"];
    (name, value)
}

fn arb_headers() -> impl Strategy<Value = Headers> {
    prop::collection::vec(arb_header(), 0..6)
        .prop_map(|pairs| pairs.into_iter().collect())
}

fn arb_response() -> impl Strategy<Value = HttpResponse> {
    (
        100..=599u16,
        "[!-~][ -~]{0,19}",
        arb_headers(),
        prop::collection::vec(any::<u8>(), 0..64),
    )
        .prop_map(|(status, reason, headers, body)| HttpResponse {
            version: Version::V1_1,
            code: HttpCode::new(status, reason),
            headers,
            body: body.into(),
        })
}

fn arb_request() -> impl Strategy<Value = HttpRequest> {
    let method = prop_oneof![
        Just(Method::Get),
        Just(Method::Post),
        Just(Method::Put),
        Just(Method::Delete),
    ];
    (
        method,
        "/[!-~]{0,16}".prop_filter("spaces split the request line", |p: &String| {
            !p.contains(' ')
        }),
        arb_headers(),
        prop::collection::vec(any::<u8>(), 0..64),
    )
        .prop_map(|(method, path, headers, body)| HttpRequest {
            method,
            path,
            version: Version::V1_1,
            headers,
            body: body.into(),
        })
}

/// The canonical form decoding is expected to produce: `content-length`
/// prepended when the encoder had to insert one.
fn canonical_response(mut response: HttpResponse) -> HttpResponse {
    let mut headers = Headers::new();
    headers.push("content-length", response.body.len().to_string());
    for header in response.headers.iter() {
        headers.push(header.name.clone(), header.value.clone());
    }
    response.headers = headers;
    response
}

proptest! {
    #[test]
    fn response_round_trip(response in arb_response()) {
        let codec = HttpServerCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(&response, &mut wire);

        let mut parser = ResponseParser::new();
        let decoded = parser.decode(&wire).unwrap();

        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(&decoded[0], &canonical_response(response));

        // Nothing left over.
        prop_assert!(parser.decode_eof().unwrap().is_empty());
    }

    #[test]
    fn request_round_trip(request in arb_request()) {
        let codec = HttpClientCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(&request, &mut wire);

        let mut parser = RequestParser::new();
        let decoded = parser.decode(&wire).unwrap();

        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(&decoded[0].body, &request.body);
        prop_assert_eq!(&decoded[0].path, &request.path);
        prop_assert_eq!(decoded[0].method, request.method);

        if request.body.is_empty() {
            prop_assert_eq!(&decoded[0].headers, &request.headers);
        } else {
            let expected_len = request.body.len().to_string();
            prop_assert_eq!(
                decoded[0].headers.get("content-length"),
                Some(expected_len.as_str())
            );
        }
    }

    #[test]
    fn chunking_never_changes_the_decoded_sequence(
        responses in prop::collection::vec(arb_response(), 1..4),
        chunk_sizes in prop::collection::vec(1..32usize, 1..64),
    ) {
        let codec = HttpServerCodec::new();
        let mut wire = BytesMut::new();
        for response in &responses {
            codec.encode(response, &mut wire);
        }

        let mut whole = ResponseParser::new();
        let expected = whole.decode(&wire).unwrap();
        prop_assert_eq!(expected.len(), responses.len());

        let mut chunked = ResponseParser::new();
        let mut got = Vec::new();
        let mut offset = 0;
        let mut sizes = chunk_sizes.iter().cycle();
        while offset < wire.len() {
            let size = (*sizes.next().unwrap()).min(wire.len() - offset);
            got.extend(chunked.decode(&wire[offset..offset + size]).unwrap());
            offset += size;
        }

        prop_assert_eq!(got, expected);
    }
}
