//! Floodgate runtime: worker event loops, the admitting server actor, and
//! the system facade that ties them together.
//!
//! # Architecture
//!
//! This crate is the production glue around the pure contracts in
//! `floodgate-core`. Every long-lived component is an actor: an owned state
//! struct driven by one task looping over a single-consumer mailbox, so no
//! component's state is ever touched by two tasks.
//!
//! ```text
//! IoSystem
//! ├── Server "web" (accepts, admits, drives the watermark state)
//! ├── Server "admin"
//! └── WorkerManager (round-robin router, crash restarts)
//!     ├── Worker 0 (connections, delegators, tasks, idle scans)
//!     ├── Worker 1
//!     └── ...
//! ```
//!
//! Accepted sockets flow Server → WorkerManager → Worker; the worker asks
//! the server's per-worker delegator for a handler and owns the connection
//! until it closes. Everything a connection does afterwards — decode,
//! handler callbacks, encode, idle checks — happens on its worker's loop.
//! Close causes flow back to the server as messages; nothing else crosses a
//! worker boundary.
//!
//! # Components
//!
//! - [`IoSystem`]: entry point; attaches servers, runs tasks, opens
//!   outbound connections
//! - [`ServerRef`]: handle to a running server (status, volume state,
//!   broadcast, shutdown)
//! - [`Task`] / [`TaskProxy`]: ad-hoc work bound to a worker's loop

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod manager;
mod server;
mod system;
mod task;
mod worker;

pub use error::SystemError;
pub use server::{ServerRef, ServerStatus, ServerToken};
pub use system::IoSystem;
pub use task::{Task, TaskId, TaskProxy};
