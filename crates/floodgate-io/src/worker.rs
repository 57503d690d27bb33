//! The worker event loop.
//!
//! A worker owns a share of the live connections: their conduits (codec +
//! handler), last-activity timestamps, and outbound queues. Only the
//! worker's own loop ever touches that state — every external input arrives
//! as a [`WorkerMsg`] on its mailbox, and socket I/O is delegated to a pair
//! of lightweight per-connection tasks that feed the mailbox (reads) and
//! drain the outbound queue (writes). Chunks from one connection are
//! forwarded by a single producer into a FIFO mailbox, so handlers see
//! bytes in arrival order.
//!
//! A maintenance tick fires every 100 ms to scan for idle connections. The
//! effective idle bound comes from the owning server's published volume
//! state: high water switches every connection of that server to the short
//! bound.

use std::{
    any::Any,
    collections::HashMap,
    net::SocketAddr,
    ops::ControlFlow,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use floodgate_core::{
    BroadcastMsg, CloseCause, Conduit, ConnectionId, ConnectionVolumeState, Delegator,
    DelegatorFactory, WireEvent, WorkerId,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{
    server::{ServerMsg, ServerToken},
    task::{Task, TaskId},
};

/// Period of the idle-scan tick.
pub(crate) const MAINTENANCE_TICK: Duration = Duration::from_millis(100);

/// Read chunk size for the per-connection reader.
const READ_BUFFER_SIZE: usize = 16 * 1024;

pub(crate) type WorkerSender = mpsc::UnboundedSender<WorkerMsg>;

/// A new inbound connection admitted by a server.
pub(crate) struct BindConnection {
    pub server: ServerToken,
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Everything a worker needs to host a server: how to build its delegator,
/// where to report closes, and which idle bounds apply.
#[derive(Clone)]
pub(crate) struct ServerBindingSpec {
    pub token: ServerToken,
    pub name: String,
    pub factory: Arc<dyn DelegatorFactory>,
    pub server_tx: mpsc::UnboundedSender<ServerMsg>,
    pub volume: watch::Receiver<ConnectionVolumeState>,
    pub max_idle_time: Option<Duration>,
    pub high_water_max_idle_time: Duration,
}

/// Mailbox message set of a worker. All cross-task entry points enqueue one
/// of these; nothing else reaches worker state.
pub(crate) enum WorkerMsg {
    BindConnection(BindConnection),
    BindOutbound {
        stream: TcpStream,
        peer: SocketAddr,
        conduit: Box<dyn Conduit>,
        reply: oneshot::Sender<ConnectionId>,
    },
    Chunk { conn: ConnectionId, data: Bytes },
    ReadEof { conn: ConnectionId },
    ReadFailed { conn: ConnectionId, error: String },
    WriteFailed { conn: ConnectionId, error: String },
    WriteDrained { conn: ConnectionId },
    RegisterServer { binding: ServerBindingSpec, ack: oneshot::Sender<()> },
    UnregisterServer { server: ServerToken, kill: bool },
    Broadcast { server: ServerToken, msg: BroadcastMsg },
    BindTask { id: TaskId, task: Box<dyn Task> },
    TaskMessage { id: TaskId, msg: Box<dyn Any + Send> },
    Shutdown { ack: oneshot::Sender<()> },
}

struct ServerBinding {
    spec: ServerBindingSpec,
    delegator: Box<dyn Delegator>,
}

struct ConnectionRecord {
    peer: SocketAddr,
    server: Option<ServerToken>,
    conduit: Box<dyn Conduit>,
    outbound: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    last_activity: Instant,
}

pub(crate) struct Worker {
    id: WorkerId,
    mailbox: mpsc::UnboundedReceiver<WorkerMsg>,
    self_tx: WorkerSender,
    connections: HashMap<ConnectionId, ConnectionRecord>,
    bindings: HashMap<ServerToken, ServerBinding>,
    tasks: HashMap<TaskId, Box<dyn Task>>,
    next_connection: u64,
}

impl Worker {
    pub(crate) fn new(
        id: WorkerId,
        mailbox: mpsc::UnboundedReceiver<WorkerMsg>,
        self_tx: WorkerSender,
    ) -> Self {
        Self {
            id,
            mailbox,
            self_tx,
            connections: HashMap::new(),
            bindings: HashMap::new(),
            tasks: HashMap::new(),
            next_connection: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(worker = %self.id, "worker started");

        let mut tick = time::interval(MAINTENANCE_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(msg) => {
                        if self.handle(msg).is_break() {
                            break;
                        }
                    },
                    None => break,
                },
                _ = tick.tick() => self.scan_idle(),
            }
        }

        tracing::debug!(worker = %self.id, "worker stopped");
    }

    fn handle(&mut self, msg: WorkerMsg) -> ControlFlow<()> {
        match msg {
            WorkerMsg::BindConnection(bind) => self.bind_inbound(bind),

            WorkerMsg::BindOutbound { stream, peer, conduit, reply } => {
                let id = self.next_connection_id();
                let record = self.spawn_connection(id, stream, peer, None, conduit);
                self.connections.insert(id, record);
                let _ = reply.send(id);
                tracing::debug!(worker = %self.id, conn = %id, %peer, "outbound connection bound");
                self.drive(id, |conduit| conduit.on_connected(id));
            },

            WorkerMsg::Chunk { conn, data } => {
                if let Some(record) = self.connections.get_mut(&conn) {
                    record.last_activity = Instant::now();
                }
                self.drive(conn, |conduit| conduit.on_bytes(&data));
            },

            WorkerMsg::ReadEof { conn } => {
                self.drive(conn, |conduit| conduit.on_eof());
                self.close_connection(conn, CloseCause::PeerClosed, true);
            },

            WorkerMsg::ReadFailed { conn, error } => {
                self.close_connection(conn, CloseCause::IoError(error), false);
            },

            WorkerMsg::WriteFailed { conn, error } => {
                self.close_connection(conn, CloseCause::IoError(error), false);
            },

            WorkerMsg::WriteDrained { conn } => {
                self.drive(conn, |conduit| conduit.on_write_ready());
            },

            WorkerMsg::RegisterServer { binding, ack } => {
                let delegator = binding.factory.delegator(self.id);
                tracing::debug!(worker = %self.id, server = %binding.name, "server registered");
                self.bindings.insert(binding.token, ServerBinding { spec: binding, delegator });
                let _ = ack.send(());
            },

            WorkerMsg::UnregisterServer { server, kill } => self.unregister_server(server, kill),

            WorkerMsg::Broadcast { server, msg } => {
                if let Some(binding) = self.bindings.get_mut(&server) {
                    binding.delegator.handle_broadcast(&msg);
                }
            },

            WorkerMsg::BindTask { id, task } => {
                let mut task = task;
                task.on_bound(self.id);
                self.tasks.insert(id, task);
            },

            WorkerMsg::TaskMessage { id, msg } => {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.on_message(msg);
                }
            },

            WorkerMsg::Shutdown { ack } => {
                let ids: Vec<_> = self.connections.keys().copied().collect();
                for id in ids {
                    self.close_connection(id, CloseCause::ServerShutdown, true);
                }
                self.bindings.clear();
                self.tasks.clear();
                let _ = ack.send(());
                return ControlFlow::Break(());
            },
        }

        ControlFlow::Continue(())
    }

    fn next_connection_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        id
    }

    fn bind_inbound(&mut self, bind: BindConnection) {
        let id = self.next_connection_id();

        let Some(binding) = self.bindings.get_mut(&bind.server) else {
            // The server unregistered while the assignment was in flight.
            tracing::debug!(worker = %self.id, server = %bind.server, "dropping assignment for unregistered server");
            return;
        };

        let _ = binding
            .spec
            .server_tx
            .send(ServerMsg::ConnectionBound { worker: self.id, conn: id });

        match binding.delegator.accept_new_connection(id) {
            Some(conduit) => {
                let server_token = bind.server;
                let record =
                    self.spawn_connection(id, bind.stream, bind.peer, Some(server_token), conduit);
                self.connections.insert(id, record);
                tracing::debug!(worker = %self.id, conn = %id, peer = %bind.peer, "connection bound");
                self.drive(id, |conduit| conduit.on_connected(id));
            },
            None => {
                tracing::debug!(worker = %self.id, conn = %id, peer = %bind.peer, "connection refused by delegator");
                drop(bind.stream);
                let _ = binding.spec.server_tx.send(ServerMsg::ConnectionClosed {
                    worker: self.id,
                    conn: id,
                    cause: CloseCause::Refused,
                });
            },
        }
    }

    fn spawn_connection(
        &self,
        id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
        server: Option<ServerToken>,
        conduit: Box<dyn Conduit>,
    ) -> ConnectionRecord {
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(id, read_half, self.self_tx.clone()));
        let writer = tokio::spawn(write_loop(id, out_rx, write_half, self.self_tx.clone()));

        ConnectionRecord {
            peer,
            server,
            conduit,
            outbound: out_tx,
            reader,
            writer,
            last_activity: Instant::now(),
        }
    }

    /// Run one conduit callback and execute whatever it asks for.
    fn drive<F>(&mut self, id: ConnectionId, callback: F)
    where
        F: FnOnce(&mut dyn Conduit) -> Result<Vec<WireEvent>, CloseCause>,
    {
        let result = match self.connections.get_mut(&id) {
            Some(record) => callback(record.conduit.as_mut()),
            // Already closed; late messages are dropped silently.
            None => return,
        };

        match result {
            Ok(events) => self.apply(id, events),
            Err(cause) => self.close_connection(id, cause, false),
        }
    }

    fn apply(&mut self, id: ConnectionId, events: Vec<WireEvent>) {
        for event in events {
            let Some(record) = self.connections.get_mut(&id) else {
                return;
            };
            match event {
                WireEvent::Write(bytes) => {
                    if record.outbound.send(bytes).is_err() {
                        let cause = CloseCause::IoError("outbound queue closed".to_string());
                        self.close_connection(id, cause, false);
                        return;
                    }
                },
                WireEvent::Close => {
                    self.close_connection(id, CloseCause::LocalClose, true);
                    return;
                },
            }
        }
    }

    /// Tear a connection down and deliver termination exactly once.
    ///
    /// With `flush` the writer drains what is queued before shutting the
    /// socket down; without it the socket is dropped on the spot.
    fn close_connection(&mut self, id: ConnectionId, cause: CloseCause, flush: bool) {
        let Some(mut record) = self.connections.remove(&id) else {
            return;
        };

        record.conduit.on_terminated(&cause);
        record.reader.abort();
        if !flush {
            record.writer.abort();
        }

        tracing::debug!(worker = %self.id, conn = %id, peer = %record.peer, %cause, "connection closed");

        if let Some(server) = record.server {
            if let Some(binding) = self.bindings.get(&server) {
                let _ = binding.spec.server_tx.send(ServerMsg::ConnectionClosed {
                    worker: self.id,
                    conn: id,
                    cause,
                });
            }
        }
        // Dropping the record drops the outbound sender; a surviving writer
        // finishes the queue and shuts the socket down.
    }

    fn unregister_server(&mut self, server: ServerToken, kill: bool) {
        let ids: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, record)| record.server == Some(server))
            .map(|(&id, _)| id)
            .collect();

        for id in ids {
            if kill {
                self.close_connection(id, CloseCause::ServerShutdown, false);
            } else {
                // Graceful drain: let the handler say goodbye, flush, close.
                let events = match self.connections.get_mut(&id) {
                    Some(record) => record.conduit.on_shutdown(),
                    None => continue,
                };
                if let Some(record) = self.connections.get(&id) {
                    for event in events {
                        if let WireEvent::Write(bytes) = event {
                            let _ = record.outbound.send(bytes);
                        }
                    }
                }
                self.close_connection(id, CloseCause::ServerShutdown, true);
            }
        }

        self.bindings.remove(&server);
    }

    fn scan_idle(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();

        for (&id, record) in &self.connections {
            let Some(server) = record.server else {
                // Outbound connections have no server and no idle bound.
                continue;
            };
            let Some(binding) = self.bindings.get(&server) else {
                continue;
            };

            let bound = match *binding.spec.volume.borrow() {
                ConnectionVolumeState::HighWater => Some(binding.spec.high_water_max_idle_time),
                ConnectionVolumeState::Normal => binding.spec.max_idle_time,
            };
            let Some(bound) = bound else {
                continue;
            };

            let idle_for = now.saturating_duration_since(record.last_activity);
            if idle_for > bound {
                expired.push((id, idle_for));
            }
        }

        for (id, idle_for) in expired {
            let keep = match self.connections.get_mut(&id) {
                Some(record) => record.conduit.idle_check(idle_for),
                None => continue,
            };
            if !keep {
                self.close_connection(id, CloseCause::IdleTimeout, false);
            }
        }
    }
}

async fn read_loop(conn: ConnectionId, mut stream: OwnedReadHalf, tx: WorkerSender) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(WorkerMsg::ReadEof { conn });
                return;
            },
            Ok(_) => {
                if tx.send(WorkerMsg::Chunk { conn, data: buf.split().freeze() }).is_err() {
                    return;
                }
            },
            Err(error) => {
                let _ = tx.send(WorkerMsg::ReadFailed { conn, error: error.to_string() });
                return;
            },
        }
    }
}

async fn write_loop(
    conn: ConnectionId,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    mut stream: OwnedWriteHalf,
    tx: WorkerSender,
) {
    while let Some(bytes) = queue.recv().await {
        if let Err(error) = stream.write_all(&bytes).await {
            let _ = tx.send(WorkerMsg::WriteFailed { conn, error: error.to_string() });
            return;
        }
        if queue.is_empty() {
            let _ = tx.send(WorkerMsg::WriteDrained { conn });
        }
    }
    // Queue closed: the connection is gone, flush politely.
    let _ = stream.shutdown().await;
}
