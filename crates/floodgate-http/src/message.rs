//! HTTP message types: plain data with the codec's comparison rules baked
//! into equality.
//!
//! Header names compare case-insensitively everywhere (the wire keeps the
//! user's casing, the parser stores lowercase); insertion order is preserved
//! and significant on encode.

use bytes::Bytes;
use floodgate_core::ProtocolViolation;

/// HTTP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    V1_0,
    /// HTTP/1.1
    V1_1,
}

impl Version {
    /// Wire form, e.g. `"HTTP/1.1"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1_0 => "HTTP/1.0",
            Self::V1_1 => "HTTP/1.1",
        }
    }

    pub(crate) fn parse(token: &str) -> Result<Self, ProtocolViolation> {
        match token {
            "HTTP/1.0" => Ok(Self::V1_0),
            "HTTP/1.1" => Ok(Self::V1_1),
            other => Err(ProtocolViolation::new(format!("unsupported HTTP version {other:?}"))),
        }
    }
}

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
    Connect,
}

impl Method {
    /// Wire form, e.g. `"GET"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }

    pub(crate) fn parse(token: &str) -> Result<Self, ProtocolViolation> {
        match token {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "OPTIONS" => Ok(Self::Options),
            "PATCH" => Ok(Self::Patch),
            "TRACE" => Ok(Self::Trace),
            "CONNECT" => Ok(Self::Connect),
            other => Err(ProtocolViolation::new(format!("unknown method {other:?}"))),
        }
    }
}

/// Status code plus reason phrase.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HttpCode {
    /// Numeric status, e.g. `200`.
    pub status: u16,
    /// Reason phrase, e.g. `"OK"`.
    pub reason: String,
}

impl HttpCode {
    /// A code with the given status and reason.
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self { status, reason: reason.into() }
    }

    /// `200 OK`
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// `400 Bad Request`
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// `404 Not Found`
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    /// `500 Internal Server Error`
    pub fn internal_server_error() -> Self {
        Self::new(500, "Internal Server Error")
    }
}

/// One header: name as supplied, compared case-insensitively.
#[derive(Debug, Clone, Eq)]
pub struct Header {
    /// Header name in the casing the user (or wire) supplied.
    pub name: String,
    /// Header value, leading whitespace trimmed on parse.
    pub value: String,
}

impl Header {
    /// A header with the given name and value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    /// Does this header have the given (case-insensitive) name?
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self.value == other.value
    }
}

/// Ordered header sequence with case-insensitive lookup.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// An empty header sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, preserving insertion order.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// Value of the first header with this (case-insensitive) name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|h| h.is(name)).map(|h| h.value.as_str())
    }

    /// How many headers carry this (case-insensitive) name.
    pub fn count_of(&self, name: &str) -> usize {
        self.0.iter().filter(|h| h.is(name)).count()
    }

    /// All headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(n, v)| Header::new(n, v)).collect())
    }
}

/// A decoded HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Request target as it appeared on the request line.
    pub path: String,
    /// Protocol version.
    pub version: Version,
    /// Headers in wire order.
    pub headers: Headers,
    /// Message body; empty when none was declared.
    pub body: Bytes,
}

impl HttpRequest {
    /// A bodyless request for `path`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            version: Version::V1_1,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }
}

/// A decoded HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Protocol version.
    pub version: Version,
    /// Status code and reason phrase.
    pub code: HttpCode,
    /// Headers in wire order.
    pub headers: Headers,
    /// Message body; empty when none was declared.
    pub body: Bytes,
}

impl HttpResponse {
    /// A bodyless response with the given code.
    pub fn new(code: HttpCode) -> Self {
        Self { version: Version::V1_1, code, headers: Headers::new(), body: Bytes::new() }
    }

    /// A `200 OK` response with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(HttpCode::ok()).with_body(body)
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }
}
