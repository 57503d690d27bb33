//! Ad-hoc work bound to a worker's event loop.
//!
//! A [`Task`] receives messages like any other handler: it is owned by
//! exactly one worker and its callbacks run on that worker's loop, so it
//! may be used to serialise work against connection handlers without locks.
//! [`IoSystem::run`](crate::IoSystem::run) binds a task to a worker picked
//! by the same round-robin policy as connections and returns its proxy.

use std::{any::Any, fmt};

use crate::{error::SystemError, worker::{WorkerMsg, WorkerSender}};
use floodgate_core::WorkerId;

/// Identifier of a bound task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Work that lives on a worker's loop and reacts to messages.
///
/// Like connection handlers, tasks must not block; they share the loop with
/// every connection the worker owns.
pub trait Task: Send + 'static {
    /// The task was bound to `worker`.
    fn on_bound(&mut self, worker: WorkerId) {
        let _ = worker;
    }

    /// A message sent through the task's proxy.
    fn on_message(&mut self, msg: Box<dyn Any + Send>);
}

/// Handle for sending messages to a bound [`Task`].
///
/// A task dies with its worker; sends to a dead worker's tasks fail with
/// [`SystemError::Terminated`].
#[derive(Debug, Clone)]
pub struct TaskProxy {
    id: TaskId,
    worker: WorkerSender,
}

impl TaskProxy {
    pub(crate) fn new(id: TaskId, worker: WorkerSender) -> Self {
        Self { id, worker }
    }

    /// The bound task's id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Enqueue a message for the task.
    ///
    /// # Errors
    ///
    /// [`SystemError::Terminated`] if the owning worker is gone.
    pub fn send(&self, msg: Box<dyn Any + Send>) -> Result<(), SystemError> {
        self.worker
            .send(WorkerMsg::TaskMessage { id: self.id, msg })
            .map_err(|_| SystemError::Terminated)
    }
}
