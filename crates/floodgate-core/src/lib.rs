//! Core contracts for the floodgate event-driven TCP server framework.
//!
//! This crate holds everything that can be reasoned about without touching a
//! socket: the codec contract, the per-connection handler and per-worker
//! delegator contracts, the type-erasure seam between them, the
//! connection-volume watermark state machine, settings validation, and the
//! metrics sink. Nothing in here performs I/O or spawns a task, which is what
//! makes the state machines testable in isolation — the runtime glue lives in
//! `floodgate-io`.
//!
//! # Components
//!
//! - [`Codec`]: incremental decoder + pure encoder for a wire protocol
//! - [`ConnectionHandler`] / [`Delegator`]: application seams, action-style
//! - [`Conduit`]: byte-level erasure of a (codec, handler) pair
//! - [`volume`]: the pure watermark transition function
//! - [`ServerSettings`] / [`IoSystemConfig`]: validated configuration
//! - [`MetricsRegistry`]: named counters and windowed rates

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod conduit;
pub mod handler;
pub mod metrics;
pub mod settings;
pub mod volume;

pub use codec::{Codec, ProtocolViolation};
pub use conduit::{CodecConduit, Conduit, WireEvent};
pub use handler::{
    BroadcastMsg, CloseCause, ConnectionHandler, ConnectionId, Delegator, DelegatorFactory,
    HandlerError, HandlerEvent, WorkerId,
};
pub use metrics::{Counter, MetricsRegistry, Rate};
pub use settings::{ConfigError, IoSystemConfig, ServerSettings};
pub use volume::{ConnectionVolumeState, Watermarks};
