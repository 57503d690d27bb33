//! Codec contract: stateful incremental decoder plus pure encoder.
//!
//! A codec translates between a raw byte stream and typed messages of a wire
//! protocol. The decoder is fed whatever chunks the transport produces and
//! buffers partial messages internally, so splitting a stream at arbitrary
//! points never changes the decoded message sequence. The encoder is pure and
//! must round-trip through the decoder modulo the codec's documented
//! canonicalisations.

use bytes::BytesMut;
use thiserror::Error;

/// Malformed bytes on the wire.
///
/// Raised by a decoder when the input cannot be part of any valid message.
/// The framework's recovery policy is to close the offending connection with
/// [`CloseCause::ProtocolViolation`](crate::CloseCause::ProtocolViolation);
/// other connections are unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("protocol violation: {reason}")]
pub struct ProtocolViolation {
    /// What was wrong with the bytes.
    pub reason: String,
}

impl ProtocolViolation {
    /// Create a violation with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// A pluggable wire protocol: decoder for inbound bytes, encoder for outbound
/// messages.
///
/// The same contract serves both sides of a connection; a server-side HTTP
/// codec decodes requests and encodes responses, while the client-side
/// variant does the reverse.
///
/// # Contract
///
/// - `decode` consumes as many bytes as form complete messages and retains
///   the remainder as internal state across calls. It may yield zero or more
///   messages per call. For any split of a byte stream into chunks, feeding
///   the chunks in order yields the same messages as feeding the
///   concatenation.
/// - `decode_eof` is called once when the peer signals end-of-stream, giving
///   protocols with stream-delimited messages a chance to flush. Leftover
///   bytes that cannot form a message are a [`ProtocolViolation`].
/// - `encode` is pure: no state, and `decode(encode(m))` yields exactly
///   `[m]` modulo the codec's documented canonicalisations.
pub trait Codec: Send + 'static {
    /// Messages produced by the decoder.
    type In: Send + 'static;
    /// Messages accepted by the encoder.
    type Out: Send + 'static;

    /// Feed a chunk of bytes; returns every message completed by it.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation`] if the bytes are malformed. The decoder is in an
    /// undefined state afterwards; callers must [`reset`](Codec::reset) it or
    /// discard the connection.
    fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Self::In>, ProtocolViolation>;

    /// Signal end-of-stream; returns any message delimited by it.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation`] if buffered bytes form a truncated message.
    fn decode_eof(&mut self) -> Result<Vec<Self::In>, ProtocolViolation> {
        Ok(Vec::new())
    }

    /// Serialise one message into `dst`.
    fn encode(&self, msg: &Self::Out, dst: &mut BytesMut);

    /// Drop all buffered decoder state and return to the initial state.
    fn reset(&mut self);
}
