//! Codec implementations for the two sides of an HTTP connection.
//!
//! Encoding canonicalises `content-length`: the header always reflects the
//! exact byte length of the body, overwriting a user-supplied value or being
//! prepended when absent. Requests are only given one when they carry a body
//! (or already declared one). The encoder emits `HTTP/1.1` regardless of the
//! version field; remaining headers keep their user casing and order.

use bytes::{BufMut, BytesMut};
use floodgate_core::{Codec, ProtocolViolation};

use crate::{
    message::{Headers, HttpRequest, HttpResponse},
    parser::{RequestParser, ResponseParser},
};

/// Server side of the wire: decodes requests, encodes responses.
#[derive(Default)]
pub struct HttpServerCodec {
    parser: RequestParser,
}

impl HttpServerCodec {
    /// A codec in its initial state.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Codec for HttpServerCodec {
    type In = HttpRequest;
    type Out = HttpResponse;

    fn decode(&mut self, bytes: &[u8]) -> Result<Vec<HttpRequest>, ProtocolViolation> {
        self.parser.decode(bytes)
    }

    fn decode_eof(&mut self) -> Result<Vec<HttpRequest>, ProtocolViolation> {
        self.parser.decode_eof()
    }

    fn encode(&self, msg: &HttpResponse, dst: &mut BytesMut) {
        encode_response(msg, dst);
    }

    fn reset(&mut self) {
        self.parser.reset();
    }
}

/// Client side of the wire: decodes responses, encodes requests.
#[derive(Default)]
pub struct HttpClientCodec {
    parser: ResponseParser,
}

impl HttpClientCodec {
    /// A codec in its initial state.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Codec for HttpClientCodec {
    type In = HttpResponse;
    type Out = HttpRequest;

    fn decode(&mut self, bytes: &[u8]) -> Result<Vec<HttpResponse>, ProtocolViolation> {
        self.parser.decode(bytes)
    }

    fn decode_eof(&mut self) -> Result<Vec<HttpResponse>, ProtocolViolation> {
        self.parser.decode_eof()
    }

    fn encode(&self, msg: &HttpRequest, dst: &mut BytesMut) {
        encode_request(msg, dst);
    }

    fn reset(&mut self) {
        self.parser.reset();
    }
}

/// Serialise a response: status line, canonicalised headers, blank line,
/// body.
pub fn encode_response(response: &HttpResponse, dst: &mut BytesMut) {
    dst.put_slice(b"HTTP/1.1 ");
    dst.put_slice(response.code.status.to_string().as_bytes());
    dst.put_slice(b" ");
    dst.put_slice(response.code.reason.as_bytes());
    dst.put_slice(b"\r\n");

    write_headers(&response.headers, Some(response.body.len()), dst);
    dst.put_slice(&response.body);
}

/// Serialise a request: request line, canonicalised headers, blank line,
/// body.
pub fn encode_request(request: &HttpRequest, dst: &mut BytesMut) {
    dst.put_slice(request.method.as_str().as_bytes());
    dst.put_slice(b" ");
    dst.put_slice(request.path.as_bytes());
    dst.put_slice(b" HTTP/1.1\r\n");

    let declares_length =
        !request.body.is_empty() || request.headers.get("content-length").is_some();
    let content_length = declares_length.then_some(request.body.len());

    write_headers(&request.headers, content_length, dst);
    dst.put_slice(&request.body);
}

/// Write the header block, forcing `content-length` to `forced_length` when
/// given: an existing header (first occurrence) is overwritten in place and
/// any duplicates dropped; otherwise the header is prepended.
fn write_headers(headers: &Headers, forced_length: Option<usize>, dst: &mut BytesMut) {
    let mut length_pending = forced_length;

    if let Some(n) = forced_length {
        if headers.get("content-length").is_none() {
            dst.put_slice(b"content-length: ");
            dst.put_slice(n.to_string().as_bytes());
            dst.put_slice(b"\r\n");
            length_pending = None;
        }
    }

    for header in headers.iter() {
        if header.is("content-length") && forced_length.is_some() {
            let Some(n) = length_pending.take() else {
                continue; // duplicate, dropped
            };
            dst.put_slice(header.name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(n.to_string().as_bytes());
            dst.put_slice(b"\r\n");
        } else {
            dst.put_slice(header.name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(header.value.as_bytes());
            dst.put_slice(b"\r\n");
        }
    }

    dst.put_slice(b"\r\n");
}
