//! Type-erasure seam between typed codec/handler pairs and the worker.
//!
//! A worker hosts connections for every server registered with it, and those
//! servers may speak different protocols. The worker therefore drives each
//! connection through the byte-level [`Conduit`] interface; the typed
//! [`Codec`] and [`ConnectionHandler`] pair is boxed behind it by
//! [`CodecConduit`], which is the only implementation the framework
//! provides. Delegators hand a `Box<dyn Conduit>` to the worker for each
//! accepted connection.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::{
    codec::Codec,
    handler::{CloseCause, ConnectionHandler, ConnectionId, HandlerEvent},
};

/// A byte-level event for the owning worker to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Queue these bytes on the connection's outbound queue.
    Write(Bytes),
    /// Flush the outbound queue and close the connection.
    Close,
}

/// Byte-level face of one connection: raw bytes in, [`WireEvent`]s out.
///
/// Mirrors the [`ConnectionHandler`] capability set with the codec already
/// applied. An `Err` from any method closes the connection with that cause.
pub trait Conduit: Send + 'static {
    /// The connection is registered and readable.
    fn on_connected(&mut self, id: ConnectionId) -> Result<Vec<WireEvent>, CloseCause>;

    /// A chunk of bytes arrived from the peer.
    fn on_bytes(&mut self, chunk: &[u8]) -> Result<Vec<WireEvent>, CloseCause>;

    /// The peer signalled end-of-stream. The connection closes after the
    /// returned events are executed.
    fn on_eof(&mut self) -> Result<Vec<WireEvent>, CloseCause>;

    /// The connection's outbound queue fully drained.
    fn on_write_ready(&mut self) -> Result<Vec<WireEvent>, CloseCause>;

    /// The owning server is draining; emit final events.
    fn on_shutdown(&mut self) -> Vec<WireEvent>;

    /// The connection exceeded its idle bound; `true` keeps it alive.
    fn idle_check(&mut self, idle_for: Duration) -> bool;

    /// The connection is gone. Called exactly once.
    fn on_terminated(&mut self, cause: &CloseCause);
}

/// Pairs a [`Codec`] with a [`ConnectionHandler`] behind the [`Conduit`]
/// interface.
pub struct CodecConduit<C, H> {
    codec: C,
    handler: H,
}

impl<C, H> CodecConduit<C, H>
where
    C: Codec,
    H: ConnectionHandler<Msg = C::In, Reply = C::Out>,
{
    /// Pair `codec` with `handler`.
    pub fn new(codec: C, handler: H) -> Self {
        Self { codec, handler }
    }

    /// Pair and box, ready to hand to a worker.
    pub fn boxed(codec: C, handler: H) -> Box<dyn Conduit> {
        Box::new(Self::new(codec, handler))
    }

    fn lower(&self, events: Vec<HandlerEvent<C::Out>>) -> Vec<WireEvent> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            match event {
                HandlerEvent::Send(msg) => {
                    let mut dst = BytesMut::new();
                    self.codec.encode(&msg, &mut dst);
                    out.push(WireEvent::Write(dst.freeze()));
                },
                HandlerEvent::Close => out.push(WireEvent::Close),
            }
        }
        out
    }

    fn dispatch(
        &mut self,
        messages: Vec<C::In>,
    ) -> Result<Vec<WireEvent>, CloseCause> {
        let mut out = Vec::new();
        for msg in messages {
            let events = self
                .handler
                .on_message(msg)
                .map_err(|e| CloseCause::HandlerError(e.to_string()))?;
            out.extend(self.lower(events));
        }
        Ok(out)
    }
}

impl<C, H> Conduit for CodecConduit<C, H>
where
    C: Codec,
    H: ConnectionHandler<Msg = C::In, Reply = C::Out>,
{
    fn on_connected(&mut self, id: ConnectionId) -> Result<Vec<WireEvent>, CloseCause> {
        let events = self
            .handler
            .on_connected(id)
            .map_err(|e| CloseCause::HandlerError(e.to_string()))?;
        Ok(self.lower(events))
    }

    fn on_bytes(&mut self, chunk: &[u8]) -> Result<Vec<WireEvent>, CloseCause> {
        let messages = self
            .codec
            .decode(chunk)
            .map_err(|e| CloseCause::ProtocolViolation(e.reason))?;
        self.dispatch(messages)
    }

    fn on_eof(&mut self) -> Result<Vec<WireEvent>, CloseCause> {
        let messages = self
            .codec
            .decode_eof()
            .map_err(|e| CloseCause::ProtocolViolation(e.reason))?;
        self.dispatch(messages)
    }

    fn on_write_ready(&mut self) -> Result<Vec<WireEvent>, CloseCause> {
        let events = self
            .handler
            .on_write_ready()
            .map_err(|e| CloseCause::HandlerError(e.to_string()))?;
        Ok(self.lower(events))
    }

    fn on_shutdown(&mut self) -> Vec<WireEvent> {
        let events = self.handler.on_shutdown();
        self.lower(events)
    }

    fn idle_check(&mut self, idle_for: Duration) -> bool {
        self.handler.idle_check(idle_for)
    }

    fn on_terminated(&mut self, cause: &CloseCause) {
        self.handler.on_terminated(cause);
    }
}
