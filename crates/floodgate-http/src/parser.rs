//! Incremental HTTP/1.x message parsers.
//!
//! One state machine, instantiated for each side of the wire: start line,
//! then headers line by line, then a body of exactly `content-length` bytes
//! (or, for responses marked `connection: close`, a body running to
//! end-of-stream). Partial input is buffered internally, so the chunking of
//! the byte stream never changes the decoded message sequence.
//!
//! Line endings are strict CRLF; a bare LF is a protocol violation, as are
//! duplicate or malformed `content-length` headers and any
//! `transfer-encoding` (chunked bodies are outside this codec's scope).

use std::mem;

use bytes::{Bytes, BytesMut};
use floodgate_core::ProtocolViolation;

use crate::message::{Headers, HttpCode, HttpRequest, HttpResponse, Method, Version};

/// Longest accepted start or header line, terminator included.
const MAX_LINE_LEN: usize = 8 * 1024;

/// The side-specific part of the state machine: how to read the start line
/// and assemble the finished message.
trait Head: Sized + Send + 'static {
    type Msg: Send + 'static;

    fn parse_start_line(line: &str) -> Result<Self, ProtocolViolation>;

    /// May this message's body run to end-of-stream when no
    /// `content-length` was declared?
    fn eof_delimited_body(&self, headers: &Headers) -> bool;

    fn build(self, headers: Headers, body: Bytes) -> Self::Msg;
}

struct RequestHead {
    method: Method,
    path: String,
    version: Version,
}

impl Head for RequestHead {
    type Msg = HttpRequest;

    fn parse_start_line(line: &str) -> Result<Self, ProtocolViolation> {
        let mut tokens = line.splitn(3, ' ');
        let (Some(method), Some(path), Some(version)) =
            (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(ProtocolViolation::new(format!("malformed request line {line:?}")));
        };

        if path.is_empty() {
            return Err(ProtocolViolation::new("empty request target"));
        }

        Ok(Self {
            method: Method::parse(method)?,
            path: path.to_string(),
            version: Version::parse(version)?,
        })
    }

    fn eof_delimited_body(&self, _headers: &Headers) -> bool {
        // A request body must always declare its length.
        false
    }

    fn build(self, headers: Headers, body: Bytes) -> HttpRequest {
        HttpRequest { method: self.method, path: self.path, version: self.version, headers, body }
    }
}

struct ResponseHead {
    version: Version,
    code: HttpCode,
}

impl Head for ResponseHead {
    type Msg = HttpResponse;

    fn parse_start_line(line: &str) -> Result<Self, ProtocolViolation> {
        let mut tokens = line.splitn(3, ' ');
        let (Some(version), Some(status), Some(reason)) =
            (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(ProtocolViolation::new(format!("malformed status line {line:?}")));
        };

        let status: u16 = status
            .parse()
            .map_err(|_| ProtocolViolation::new(format!("invalid status code {status:?}")))?;

        Ok(Self {
            version: Version::parse(version)?,
            code: HttpCode::new(status, reason),
        })
    }

    fn eof_delimited_body(&self, headers: &Headers) -> bool {
        headers.get("connection").is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }

    fn build(self, headers: Headers, body: Bytes) -> HttpResponse {
        HttpResponse { version: self.version, code: self.code, headers, body }
    }
}

enum State<H> {
    StartLine,
    Headers { head: H, headers: Headers },
    Body { head: H, headers: Headers, remaining: usize },
    BodyUntilEof { head: H, headers: Headers },
    Failed,
}

struct MessageParser<H: Head> {
    buf: BytesMut,
    state: State<H>,
}

impl<H: Head> MessageParser<H> {
    fn new() -> Self {
        Self { buf: BytesMut::new(), state: State::StartLine }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.state = State::StartLine;
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<Vec<H::Msg>, ProtocolViolation> {
        self.buf.extend_from_slice(bytes);
        match self.run() {
            Ok(messages) => Ok(messages),
            Err(violation) => {
                self.state = State::Failed;
                Err(violation)
            },
        }
    }

    fn decode_eof(&mut self) -> Result<Vec<H::Msg>, ProtocolViolation> {
        match mem::replace(&mut self.state, State::Failed) {
            State::StartLine if self.buf.is_empty() => {
                self.state = State::StartLine;
                Ok(Vec::new())
            },
            State::BodyUntilEof { head, headers } => {
                let body = self.buf.split().freeze();
                self.state = State::StartLine;
                Ok(vec![head.build(headers, body)])
            },
            _ => Err(ProtocolViolation::new("stream ended mid-message")),
        }
    }

    fn run(&mut self) -> Result<Vec<H::Msg>, ProtocolViolation> {
        let mut out = Vec::new();

        loop {
            match mem::replace(&mut self.state, State::Failed) {
                State::StartLine => {
                    let Some(line) = take_line(&mut self.buf)? else {
                        self.state = State::StartLine;
                        return Ok(out);
                    };
                    let head = H::parse_start_line(&line)?;
                    self.state = State::Headers { head, headers: Headers::new() };
                },

                State::Headers { head, mut headers } => {
                    let Some(line) = take_line(&mut self.buf)? else {
                        self.state = State::Headers { head, headers };
                        return Ok(out);
                    };

                    if line.is_empty() {
                        match self.finish_headers(head, headers)? {
                            Finished::Message(msg) => {
                                out.push(msg);
                                self.state = State::StartLine;
                            },
                            Finished::Pending(state) => self.state = state,
                        }
                        continue;
                    }

                    let (name, value) = line.split_once(':').ok_or_else(|| {
                        ProtocolViolation::new(format!("header line without ':': {line:?}"))
                    })?;
                    if name.is_empty() || name.contains(' ') || name.contains('\t') {
                        return Err(ProtocolViolation::new(format!("invalid header name {name:?}")));
                    }
                    let name = name.to_ascii_lowercase();
                    if name == "content-length" && headers.get("content-length").is_some() {
                        return Err(ProtocolViolation::new("duplicate content-length header"));
                    }
                    headers.push(name, value.trim_start());
                    self.state = State::Headers { head, headers };
                },

                State::Body { head, headers, remaining } => {
                    if self.buf.len() < remaining {
                        self.state = State::Body { head, headers, remaining };
                        return Ok(out);
                    }
                    let body = self.buf.split_to(remaining).freeze();
                    out.push(head.build(headers, body));
                    self.state = State::StartLine;
                },

                state @ State::BodyUntilEof { .. } => {
                    // Everything from here to end-of-stream is body.
                    self.state = state;
                    return Ok(out);
                },

                State::Failed => {
                    return Err(ProtocolViolation::new("decoder already failed"));
                },
            }
        }
    }

    fn finish_headers(
        &mut self,
        head: H,
        headers: Headers,
    ) -> Result<Finished<H>, ProtocolViolation> {
        if headers.get("transfer-encoding").is_some() {
            return Err(ProtocolViolation::new("transfer-encoding is not supported"));
        }

        let content_length = match headers.get("content-length") {
            Some(value) => Some(value.trim().parse::<usize>().map_err(|_| {
                ProtocolViolation::new(format!("invalid content-length {value:?}"))
            })?),
            None => None,
        };

        Ok(match content_length {
            Some(n) if n > 0 => Finished::Pending(State::Body { head, headers, remaining: n }),
            Some(_) => Finished::Message(head.build(headers, Bytes::new())),
            None if head.eof_delimited_body(&headers) => {
                Finished::Pending(State::BodyUntilEof { head, headers })
            },
            None => Finished::Message(head.build(headers, Bytes::new())),
        })
    }
}

enum Finished<H: Head> {
    Message(H::Msg),
    Pending(State<H>),
}

/// Take one CRLF-terminated line off the front of `buf`, without the
/// terminator. `None` when no complete line is buffered yet.
fn take_line(buf: &mut BytesMut) -> Result<Option<String>, ProtocolViolation> {
    let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_LINE_LEN {
            return Err(ProtocolViolation::new("line exceeds maximum length"));
        }
        return Ok(None);
    };

    if pos == 0 || buf[pos - 1] != b'\r' {
        return Err(ProtocolViolation::new("bare LF in line ending"));
    }
    if pos + 1 > MAX_LINE_LEN {
        return Err(ProtocolViolation::new("line exceeds maximum length"));
    }

    let line = buf.split_to(pos + 1);
    let text = std::str::from_utf8(&line[..pos - 1])
        .map_err(|_| ProtocolViolation::new("non-UTF-8 bytes in line"))?;
    Ok(Some(text.to_string()))
}

/// Incremental parser for HTTP requests (the server side of the wire).
pub struct RequestParser {
    inner: MessageParser<RequestHead>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    /// A parser in its initial state.
    pub fn new() -> Self {
        Self { inner: MessageParser::new() }
    }

    /// Feed a chunk; returns every request completed by it.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation`] on malformed input; the parser must then be
    /// [`reset`](Self::reset) or discarded.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Vec<HttpRequest>, ProtocolViolation> {
        self.inner.decode(bytes)
    }

    /// Signal end-of-stream.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation`] if the stream ends mid-message.
    pub fn decode_eof(&mut self) -> Result<Vec<HttpRequest>, ProtocolViolation> {
        self.inner.decode_eof()
    }

    /// Return to the initial state, dropping buffered bytes.
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Incremental parser for HTTP responses (the client side of the wire).
pub struct ResponseParser {
    inner: MessageParser<ResponseHead>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    /// A parser in its initial state.
    pub fn new() -> Self {
        Self { inner: MessageParser::new() }
    }

    /// Feed a chunk; returns every response completed by it.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation`] on malformed input; the parser must then be
    /// [`reset`](Self::reset) or discarded.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Vec<HttpResponse>, ProtocolViolation> {
        self.inner.decode(bytes)
    }

    /// Signal end-of-stream.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation`] if the stream ends mid-message.
    pub fn decode_eof(&mut self) -> Result<Vec<HttpResponse>, ProtocolViolation> {
        self.inner.decode_eof()
    }

    /// Return to the initial state, dropping buffered bytes.
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}
