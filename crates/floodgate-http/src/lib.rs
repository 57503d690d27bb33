//! HTTP/1.x codec for the floodgate server framework.
//!
//! The worked example of the pluggable codec contract: an incremental
//! request/response parser and a canonicalising encoder, packaged as
//! [`HttpServerCodec`] (requests in, responses out) and [`HttpClientCodec`]
//! (responses in, requests out).
//!
//! # Canonicalisations
//!
//! - Encoding a response inserts a `content-length` header reflecting the
//!   exact body length: an existing one is overwritten, an absent one is
//!   prepended. Requests get the same treatment when they carry a body.
//! - Header names hit the wire in the case the user supplied but compare
//!   lowercased; the parser stores them lowercased.
//! - The encoder only ever produces `HTTP/1.1`; the parser accepts
//!   `HTTP/1.0` and `HTTP/1.1`.
//! - Chunked transfer encoding is out of scope and rejected.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod message;
mod parser;

pub use codec::{HttpClientCodec, HttpServerCodec};
pub use message::{Header, Headers, HttpCode, HttpRequest, HttpResponse, Method, Version};
pub use parser::{RequestParser, ResponseParser};
