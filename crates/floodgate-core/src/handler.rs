//! Application seams: per-connection handlers and per-worker delegators.
//!
//! Uses the action pattern: handler methods return events for the owning
//! worker to execute instead of performing I/O themselves. This keeps
//! application logic free of sockets and makes it testable with plain
//! function calls. An `Err` from any handler method closes the connection
//! with cause [`CloseCause::HandlerError`]; the worker and its other
//! connections are unaffected.

use std::{any::Any, error::Error, fmt, sync::Arc, time::Duration};

use thiserror::Error;

use crate::conduit::Conduit;

/// Identifier of a connection, monotonic within its owning worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier of a worker within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Why a connection was closed.
///
/// Delivered to the handler exactly once via
/// [`ConnectionHandler::on_terminated`], and reported upward as the tag on
/// the server's `closed` rate. Everything per-connection is handled by the
/// owning worker; a close cause is the only form in which connection
/// failures propagate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The peer closed the stream.
    PeerClosed,
    /// The handler asked for the close.
    LocalClose,
    /// The delegator declined the connection.
    Refused,
    /// The decoder rejected the byte stream.
    ProtocolViolation(String),
    /// Reading or writing the socket failed.
    IoError(String),
    /// No activity within the effective idle bound.
    IdleTimeout,
    /// The handler returned an error.
    HandlerError(String),
    /// The owning server or system shut down.
    ServerShutdown,
}

impl CloseCause {
    /// Stable tag for metrics, one per variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::LocalClose => "local_close",
            Self::Refused => "refused",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::IoError(_) => "io_error",
            Self::IdleTimeout => "idle_timeout",
            Self::HandlerError(_) => "handler_error",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(reason) => write!(f, "protocol violation: {reason}"),
            Self::IoError(reason) => write!(f, "i/o error: {reason}"),
            Self::HandlerError(reason) => write!(f, "handler error: {reason}"),
            other => f.write_str(other.tag()),
        }
    }
}

/// Uncaught error from application code.
///
/// Wraps whatever the handler failed with; the connection is closed with
/// cause [`CloseCause::HandlerError`] carrying the message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(Box<dyn Error + Send + Sync>);

impl HandlerError {
    /// Wrap an application error.
    pub fn new(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self(err.into())
    }

    /// Shorthand for a message-only error.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self(msg.into().into())
    }
}

/// An event a handler asks its owning worker to execute.
#[derive(Debug, PartialEq, Eq)]
pub enum HandlerEvent<M> {
    /// Encode and queue this message on the connection.
    Send(M),
    /// Flush the outbound queue and close the connection.
    Close,
}

/// Per-connection application logic.
///
/// One handler per connection, owned by exactly one worker and never shared.
/// `Msg` and `Reply` must match the connection's codec (`Codec::In` and
/// `Codec::Out`); [`CodecConduit`](crate::CodecConduit) enforces the pairing.
///
/// Every method except `on_terminated` returns events the worker executes in
/// order. Handlers must not block: long-running work belongs on the task
/// facility, not in these callbacks.
pub trait ConnectionHandler: Send + 'static {
    /// Decoded inbound message type.
    type Msg: Send + 'static;
    /// Outbound message type.
    type Reply: Send + 'static;

    /// The connection is registered with its worker and readable.
    fn on_connected(
        &mut self,
        id: ConnectionId,
    ) -> Result<Vec<HandlerEvent<Self::Reply>>, HandlerError> {
        let _ = id;
        Ok(Vec::new())
    }

    /// One decoded message arrived. Messages within a connection are
    /// delivered in byte-arrival order.
    fn on_message(
        &mut self,
        msg: Self::Msg,
    ) -> Result<Vec<HandlerEvent<Self::Reply>>, HandlerError>;

    /// The connection's outbound queue fully drained.
    fn on_write_ready(&mut self) -> Result<Vec<HandlerEvent<Self::Reply>>, HandlerError> {
        Ok(Vec::new())
    }

    /// The owning server is draining. Emit any final messages; the
    /// connection closes once they are written.
    fn on_shutdown(&mut self) -> Vec<HandlerEvent<Self::Reply>> {
        vec![HandlerEvent::Close]
    }

    /// The connection exceeded its idle bound. Return `true` to keep it
    /// alive until the next scan; the default closes it.
    fn idle_check(&mut self, idle_for: Duration) -> bool {
        let _ = idle_for;
        false
    }

    /// The connection is gone. Called exactly once; no events may be
    /// produced and none will be accepted afterwards.
    fn on_terminated(&mut self, cause: &CloseCause) {
        let _ = cause;
    }
}

/// An application message fanned out to delegators.
pub type BroadcastMsg = Arc<dyn Any + Send + Sync>;

/// Per-(server, worker) factory for connection handlers, and the recipient
/// of delegator broadcasts.
///
/// One instance per worker for each server registered with it, created on
/// the worker by the server's [`DelegatorFactory`] and dropped when the
/// server unregisters. Because a delegator lives on a single worker it needs
/// no synchronisation of its own.
pub trait Delegator: Send + 'static {
    /// Produce the conduit for a newly assigned connection, or `None` to
    /// refuse it (the worker then closes the socket with cause
    /// [`CloseCause::Refused`]).
    fn accept_new_connection(&mut self, id: ConnectionId) -> Option<Box<dyn Conduit>>;

    /// An application message fanned out via `delegator_broadcast`.
    /// Broadcasts arrive in the order the manager enqueued them.
    fn handle_broadcast(&mut self, msg: &BroadcastMsg) {
        let _ = msg;
    }
}

/// Creates one [`Delegator`] per worker when a server registers.
pub trait DelegatorFactory: Send + Sync + 'static {
    /// Build the delegator instance owned by `worker`.
    fn delegator(&self, worker: WorkerId) -> Box<dyn Delegator>;
}

impl<F> DelegatorFactory for F
where
    F: Fn(WorkerId) -> Box<dyn Delegator> + Send + Sync + 'static,
{
    fn delegator(&self, worker: WorkerId) -> Box<dyn Delegator> {
        self(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_cause_tags_are_distinct() {
        let causes = [
            CloseCause::PeerClosed,
            CloseCause::LocalClose,
            CloseCause::Refused,
            CloseCause::ProtocolViolation("x".to_string()),
            CloseCause::IoError("x".to_string()),
            CloseCause::IdleTimeout,
            CloseCause::HandlerError("x".to_string()),
            CloseCause::ServerShutdown,
        ];

        let tags: std::collections::HashSet<_> = causes.iter().map(CloseCause::tag).collect();
        assert_eq!(tags.len(), causes.len());
    }

    #[test]
    fn close_cause_display_carries_reason() {
        let cause = CloseCause::ProtocolViolation("bare LF".to_string());
        assert_eq!(cause.to_string(), "protocol violation: bare LF");

        assert_eq!(CloseCause::IdleTimeout.to_string(), "idle_timeout");
    }

    #[test]
    fn handler_error_from_message() {
        let err = HandlerError::msg("boom");
        assert_eq!(err.to_string(), "boom");
    }
}
