//! The worker pool manager.
//!
//! Owns the fixed-size pool, routes new-connection and task assignments
//! round-robin, fans broadcasts out in enqueue order, and restarts crashed
//! workers. A restarted worker comes back with the same id, an empty
//! connection map, and every known server re-registered; the dead worker's
//! connections are lost — servers learn about the loss through a
//! `WorkerLost` message and the `worker_restarts` counter records it.

use std::{collections::HashMap, net::SocketAddr, ops::ControlFlow};

use floodgate_core::{CloseCause, Conduit, ConnectionId, Counter, MetricsRegistry, WorkerId};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::{JoinError, JoinSet},
};

use crate::{
    server::{ServerMsg, ServerToken},
    task::{Task, TaskId, TaskProxy},
    worker::{BindConnection, ServerBindingSpec, Worker, WorkerMsg, WorkerSender},
};

pub(crate) type ManagerSender = mpsc::UnboundedSender<ManagerMsg>;

pub(crate) enum ManagerMsg {
    AssignConnection(BindConnection),
    AssignOutbound {
        stream: TcpStream,
        peer: SocketAddr,
        conduit: Box<dyn Conduit>,
        reply: oneshot::Sender<ConnectionId>,
    },
    RegisterServer { binding: ServerBindingSpec, ack: oneshot::Sender<()> },
    UnregisterServer { server: ServerToken, kill: bool },
    Broadcast { server: ServerToken, msg: floodgate_core::BroadcastMsg },
    BindTask { task: Box<dyn Task>, reply: oneshot::Sender<TaskProxy> },
    Shutdown { ack: oneshot::Sender<()> },
}

struct WorkerHandle {
    id: WorkerId,
    tx: WorkerSender,
}

pub(crate) struct WorkerManager {
    mailbox: mpsc::UnboundedReceiver<ManagerMsg>,
    workers: Vec<WorkerHandle>,
    cursor: usize,
    pool: JoinSet<()>,
    pool_slots: HashMap<tokio::task::Id, usize>,
    bindings: HashMap<ServerToken, ServerBindingSpec>,
    next_task: u64,
    worker_restarts: Counter,
    shutting_down: bool,
}

impl WorkerManager {
    /// Spawn the pool and the manager's own loop.
    pub(crate) fn start(
        num_workers: usize,
        metrics: &MetricsRegistry,
    ) -> (ManagerSender, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut manager = Self {
            mailbox: rx,
            workers: Vec::with_capacity(num_workers),
            cursor: 0,
            pool: JoinSet::new(),
            pool_slots: HashMap::new(),
            bindings: HashMap::new(),
            next_task: 0,
            worker_restarts: metrics.counter("worker_restarts"),
            shutting_down: false,
        };

        for slot in 0..num_workers {
            let worker_tx = manager.spawn_worker(slot);
            manager.workers.push(WorkerHandle { id: WorkerId(slot), tx: worker_tx });
        }

        let handle = tokio::spawn(manager.run());
        (tx, handle)
    }

    fn spawn_worker(&mut self, slot: usize) -> WorkerSender {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(WorkerId(slot), rx, tx.clone());
        let abort = self.pool.spawn(worker.run());
        self.pool_slots.insert(abort.id(), slot);
        tx
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(msg) => {
                        if self.handle(msg).await.is_break() {
                            break;
                        }
                    },
                    None => break,
                },
                Some(exited) = self.pool.join_next_with_id(), if !self.pool.is_empty() => {
                    self.handle_worker_exit(exited);
                },
            }
        }
    }

    async fn handle(&mut self, msg: ManagerMsg) -> ControlFlow<()> {
        match msg {
            ManagerMsg::AssignConnection(bind) => self.assign_connection(bind),

            ManagerMsg::AssignOutbound { stream, peer, conduit, reply } => {
                if let Some(worker) = self.next_worker() {
                    // Dropping the reply on send failure surfaces the error
                    // to the caller awaiting it.
                    let _ = worker.send(WorkerMsg::BindOutbound { stream, peer, conduit, reply });
                }
            },

            ManagerMsg::RegisterServer { binding, ack } => {
                self.bindings.insert(binding.token, binding.clone());

                let mut acks = Vec::with_capacity(self.workers.len());
                for worker in &self.workers {
                    let (worker_ack, rx) = oneshot::channel();
                    let _ = worker
                        .tx
                        .send(WorkerMsg::RegisterServer { binding: binding.clone(), ack: worker_ack });
                    acks.push(rx);
                }

                // Ack the server once every worker has its delegator, off
                // the manager loop so assignments keep flowing.
                tokio::spawn(async move {
                    for rx in acks {
                        let _ = rx.await;
                    }
                    let _ = ack.send(());
                });
            },

            ManagerMsg::UnregisterServer { server, kill } => {
                self.bindings.remove(&server);
                for worker in &self.workers {
                    let _ = worker.tx.send(WorkerMsg::UnregisterServer { server, kill });
                }
            },

            ManagerMsg::Broadcast { server, msg } => {
                for worker in &self.workers {
                    let _ = worker.tx.send(WorkerMsg::Broadcast { server, msg: msg.clone() });
                }
            },

            ManagerMsg::BindTask { task, reply } => {
                let id = TaskId(self.next_task);
                self.next_task += 1;
                if let Some(worker) = self.next_worker() {
                    let proxy = TaskProxy::new(id, worker.clone());
                    let _ = worker.send(WorkerMsg::BindTask { id, task });
                    let _ = reply.send(proxy);
                }
            },

            ManagerMsg::Shutdown { ack } => {
                self.shutting_down = true;

                let mut acks = Vec::with_capacity(self.workers.len());
                for worker in &self.workers {
                    let (worker_ack, rx) = oneshot::channel();
                    let _ = worker.tx.send(WorkerMsg::Shutdown { ack: worker_ack });
                    acks.push(rx);
                }
                for rx in acks {
                    let _ = rx.await;
                }

                let _ = ack.send(());
                return ControlFlow::Break(());
            },
        }

        ControlFlow::Continue(())
    }

    fn assign_connection(&mut self, bind: BindConnection) {
        let server = bind.server;
        let Some(worker) = self.next_worker() else {
            self.fail_assignment(server, "no workers available");
            return;
        };

        if let Err(mpsc::error::SendError(msg)) = worker.send(WorkerMsg::BindConnection(bind)) {
            // The worker died between exit detection and restart; the
            // socket is dropped and the server's accounting corrected.
            drop(msg);
            self.fail_assignment(server, "worker unavailable");
        }
    }

    fn fail_assignment(&self, server: ServerToken, reason: &str) {
        tracing::warn!(server = %server, reason, "assignment failed");
        if let Some(binding) = self.bindings.get(&server) {
            let _ = binding.server_tx.send(ServerMsg::AssignmentFailed {
                cause: CloseCause::IoError(reason.to_string()),
            });
        }
    }

    /// Round-robin cursor over the pool; `None` only when the pool is
    /// empty.
    fn next_worker(&mut self) -> Option<WorkerSender> {
        if self.workers.is_empty() {
            return None;
        }
        let worker = &self.workers[self.cursor % self.workers.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Some(worker.tx.clone())
    }

    fn handle_worker_exit(&mut self, exited: Result<(tokio::task::Id, ()), JoinError>) {
        let (join_id, panicked) = match exited {
            Ok((id, ())) => (id, false),
            Err(error) => (error.id(), error.is_panic()),
        };

        let Some(slot) = self.pool_slots.remove(&join_id) else {
            return;
        };
        if self.shutting_down {
            return;
        }

        let worker_id = WorkerId(slot);
        tracing::error!(
            worker = %worker_id,
            panicked,
            "worker terminated unexpectedly; restarting with empty state"
        );
        self.worker_restarts.increment();

        // The dead worker's connections are gone; tell every server so its
        // open-connection accounting stays exact.
        for binding in self.bindings.values() {
            let _ = binding.server_tx.send(ServerMsg::WorkerLost { worker: worker_id });
        }

        let tx = self.spawn_worker(slot);
        self.workers[slot].tx = tx;

        for binding in self.bindings.values() {
            let (ack, _pending) = oneshot::channel();
            let _ = self.workers[slot]
                .tx
                .send(WorkerMsg::RegisterServer { binding: binding.clone(), ack });
        }

        debug_assert_eq!(self.workers[slot].id, worker_id);
    }
}
