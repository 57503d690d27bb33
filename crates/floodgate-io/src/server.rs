//! The server actor: accept, admit, watch the water level.
//!
//! A server owns the listening socket and nothing else. Its loop makes the
//! admission decision for every accepted socket *before* anything reaches a
//! worker, which is what makes `open ≤ max_connections` an invariant rather
//! than a target. The connection-volume state is re-evaluated on every
//! admission and every close using the pure transition function in
//! `floodgate_core::volume`, and published through a watch cell that
//! workers read during idle scans.
//!
//! Lifecycle: `Initializing` (waiting for every worker to ack the server's
//! registration) → `Binding` (bind retries with a doubling backoff, 100 ms
//! up to 2 s, unlimited) → `Bound` → `Terminated`.

use std::{
    collections::HashMap, fmt, io, net::SocketAddr, ops::ControlFlow, sync::Arc, time::Duration,
};

use floodgate_core::{
    BroadcastMsg, CloseCause, ConnectionId, ConnectionVolumeState, Counter, DelegatorFactory,
    MetricsRegistry, Rate, ServerSettings, Watermarks, WorkerId,
};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    sync::{mpsc, oneshot, watch},
    time,
};

use crate::{
    error::SystemError,
    manager::{ManagerMsg, ManagerSender},
    worker::{BindConnection, ServerBindingSpec},
};

/// First bind retry delay.
const BIND_BACKOFF_START: Duration = Duration::from_millis(100);

/// Bind retry delay cap.
const BIND_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Listen backlog used when the settings leave it unset.
const DEFAULT_TCP_BACKLOG: u32 = 1024;

/// Identifier of an attached server within its system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerToken(pub(crate) u64);

impl fmt::Display for ServerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Externally observable lifecycle state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Waiting for the worker pool to acknowledge registration.
    Initializing,
    /// Retrying `bind` with backoff.
    Binding,
    /// Listening on the given address.
    Bound(SocketAddr),
    /// Shut down; no further transitions.
    Terminated,
}

pub(crate) enum ServerMsg {
    ConnectionBound { worker: WorkerId, conn: ConnectionId },
    ConnectionClosed { worker: WorkerId, conn: ConnectionId, cause: CloseCause },
    AssignmentFailed { cause: CloseCause },
    WorkerLost { worker: WorkerId },
    Shutdown { kill_connections: bool, ack: oneshot::Sender<()> },
}

/// Handle to a running server.
///
/// Cheap to clone; reads of the volume state and status see either the
/// previous or the new value, never a torn one (single writer, watch cell).
#[derive(Clone)]
pub struct ServerRef {
    token: ServerToken,
    settings: Arc<ServerSettings>,
    tx: mpsc::UnboundedSender<ServerMsg>,
    manager_tx: ManagerSender,
    volume: watch::Receiver<ConnectionVolumeState>,
    status: watch::Receiver<ServerStatus>,
    open: Counter,
}

impl ServerRef {
    /// The server's name, as configured.
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// The server's token within its system.
    pub fn token(&self) -> ServerToken {
        self.token
    }

    /// The settings the server was attached with.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ServerStatus {
        *self.status.borrow()
    }

    /// The bound address, once `Bound`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.status() {
            ServerStatus::Bound(addr) => Some(addr),
            _ => None,
        }
    }

    /// Wait until the server is listening and return its address.
    ///
    /// # Errors
    ///
    /// [`SystemError::Terminated`] if the server terminates first.
    pub async fn bound(&self) -> Result<SocketAddr, SystemError> {
        let mut status = self.status.clone();
        loop {
            match *status.borrow_and_update() {
                ServerStatus::Bound(addr) => return Ok(addr),
                ServerStatus::Terminated => return Err(SystemError::Terminated),
                _ => {},
            }
            if status.changed().await.is_err() {
                return Err(SystemError::Terminated);
            }
        }
    }

    /// Current connection-volume state.
    pub fn connection_volume_state(&self) -> ConnectionVolumeState {
        *self.volume.borrow()
    }

    /// Open connections right now (eventually consistent with closes in
    /// flight).
    pub fn open_connections(&self) -> i64 {
        self.open.value()
    }

    /// The idle bound currently in force, given the volume state.
    pub fn max_idle_time(&self) -> Option<Duration> {
        match self.connection_volume_state() {
            ConnectionVolumeState::HighWater => Some(self.settings.high_water_max_idle_time),
            ConnectionVolumeState::Normal => self.settings.max_idle_time,
        }
    }

    /// Fan an application message out to this server's delegator on every
    /// worker.
    pub fn delegator_broadcast(&self, msg: BroadcastMsg) {
        let _ = self.manager_tx.send(ManagerMsg::Broadcast { server: self.token, msg });
    }

    /// Stop accepting and close every connection: immediately with
    /// `kill_connections`, otherwise draining (handlers get the graceful
    /// close signal and finish writing).
    pub async fn shutdown(&self, kill_connections: bool) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(ServerMsg::Shutdown { kill_connections, ack }).is_ok() {
            let _ = done.await;
        }
    }
}

struct ServerMetrics {
    connects: Rate,
    refused: Rate,
    closed: Rate,
    highwaters: Rate,
    connections: Counter,
}

impl ServerMetrics {
    fn new(registry: &MetricsRegistry, server: &str) -> Self {
        let named = |metric: &str| format!("{server}.{metric}");
        Self {
            connects: registry.rate(&named("connects")),
            refused: registry.rate(&named("refused")),
            closed: registry.rate(&named("closed")),
            highwaters: registry.rate(&named("highwaters")),
            connections: registry.counter(&named("connections")),
        }
    }
}

pub(crate) struct Server {
    token: ServerToken,
    settings: Arc<ServerSettings>,
    mailbox: mpsc::UnboundedReceiver<ServerMsg>,
    self_tx: mpsc::UnboundedSender<ServerMsg>,
    manager_tx: ManagerSender,
    factory: Arc<dyn DelegatorFactory>,
    volume_tx: watch::Sender<ConnectionVolumeState>,
    status_tx: watch::Sender<ServerStatus>,
    watermarks: Watermarks,
    open: usize,
    per_worker: HashMap<WorkerId, usize>,
    metrics: ServerMetrics,
}

impl Server {
    /// Build the actor and the ref pointing at it; the caller spawns
    /// [`Server::run`].
    pub(crate) fn create(
        token: ServerToken,
        settings: ServerSettings,
        factory: Arc<dyn DelegatorFactory>,
        manager_tx: ManagerSender,
        registry: &MetricsRegistry,
    ) -> (Self, ServerRef) {
        let settings = Arc::new(settings);
        let (tx, rx) = mpsc::unbounded_channel();
        let (volume_tx, volume_rx) = watch::channel(ConnectionVolumeState::Normal);
        let (status_tx, status_rx) = watch::channel(ServerStatus::Initializing);
        let metrics = ServerMetrics::new(registry, &settings.name);

        let server = Self {
            token,
            settings: Arc::clone(&settings),
            mailbox: rx,
            self_tx: tx.clone(),
            manager_tx: manager_tx.clone(),
            factory,
            volume_tx,
            status_tx,
            watermarks: settings.watermarks(),
            open: 0,
            per_worker: HashMap::new(),
            metrics,
        };

        let server_ref = ServerRef {
            token,
            settings,
            tx,
            manager_tx,
            volume: volume_rx,
            status: status_rx,
            open: server.metrics.connections.clone(),
        };

        (server, server_ref)
    }

    pub(crate) async fn run(mut self) {
        // Initializing: hand every worker its delegator before the first
        // socket can possibly arrive.
        let binding = ServerBindingSpec {
            token: self.token,
            name: self.settings.name.clone(),
            factory: Arc::clone(&self.factory),
            server_tx: self.self_tx.clone(),
            volume: self.volume_tx.subscribe(),
            max_idle_time: self.settings.max_idle_time,
            high_water_max_idle_time: self.settings.high_water_max_idle_time,
        };

        let (ack, workers_ready) = oneshot::channel();
        if self.manager_tx.send(ManagerMsg::RegisterServer { binding, ack }).is_err() {
            self.terminate();
            return;
        }

        tokio::pin!(workers_ready);
        loop {
            tokio::select! {
                ready = &mut workers_ready => {
                    if ready.is_err() {
                        self.terminate();
                        return;
                    }
                    break;
                },
                msg = self.mailbox.recv() => {
                    if self.drain_control(msg).is_break() {
                        return;
                    }
                },
            }
        }

        // Binding: retry with doubling backoff, forever. Failures are
        // logged and observable through the status; they are never
        // surfaced as errors.
        self.status_tx.send_replace(ServerStatus::Binding);
        let mut backoff = BIND_BACKOFF_START;
        let listener = loop {
            match self.bind_listener() {
                Ok(listener) => break listener,
                Err(error) => {
                    tracing::warn!(
                        server = %self.settings.name,
                        %error,
                        retry_in = ?backoff,
                        "bind failed"
                    );
                },
            }

            tokio::select! {
                _ = time::sleep(backoff) => {},
                msg = self.mailbox.recv() => {
                    if self.drain_control(msg).is_break() {
                        return;
                    }
                },
            }
            backoff = (backoff * 2).min(BIND_BACKOFF_CAP);
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(error) => {
                tracing::error!(server = %self.settings.name, %error, "listener has no address");
                self.terminate();
                return;
            },
        };
        self.status_tx.send_replace(ServerStatus::Bound(local_addr));
        tracing::info!(
            server = %self.settings.name,
            %local_addr,
            max_connections = self.settings.max_connections,
            "server bound"
        );

        // Bound: accept and admit until told otherwise.
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(error) => {
                        tracing::warn!(server = %self.settings.name, %error, "accept failed");
                    },
                },
                msg = self.mailbox.recv() => match msg {
                    Some(msg) => {
                        if self.handle_control(msg).is_break() {
                            break;
                        }
                    },
                    None => break,
                },
            }
        }

        // Dropping the listener stops accepting before workers start
        // closing connections.
        drop(listener);
        self.terminate();
    }

    fn bind_listener(&self) -> io::Result<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", self.settings.interface, self.settings.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(self.settings.tcp_backlog_size.unwrap_or(DEFAULT_TCP_BACKLOG))
    }

    /// The admission gate. Runs in the server's own loop, so the cap holds
    /// unconditionally: a socket over it is closed here and never reaches a
    /// worker.
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.metrics.connects.hit();

        if self.open >= self.settings.max_connections {
            self.metrics.refused.hit();
            tracing::debug!(server = %self.settings.name, %peer, "connection refused: at capacity");
            drop(stream);
            return;
        }

        if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(server = %self.settings.name, %peer, %error, "set_nodelay failed");
        }

        self.open += 1;
        self.metrics.connections.increment();

        let bind = BindConnection { server: self.token, stream, peer };
        if self.manager_tx.send(ManagerMsg::AssignConnection(bind)).is_err() {
            self.open -= 1;
            self.metrics.connections.decrement();
            tracing::error!(server = %self.settings.name, "worker pool is gone; dropping connection");
            return;
        }

        self.update_volume();
    }

    /// Control messages valid in every phase.
    fn handle_control(&mut self, msg: ServerMsg) -> ControlFlow<()> {
        match msg {
            ServerMsg::ConnectionBound { worker, .. } => {
                *self.per_worker.entry(worker).or_insert(0) += 1;
            },

            ServerMsg::ConnectionClosed { worker, cause, .. } => {
                self.open = self.open.saturating_sub(1);
                self.metrics.connections.decrement();
                self.metrics.closed.hit_tagged(&[("cause", cause.tag())]);
                if let Some(count) = self.per_worker.get_mut(&worker) {
                    *count = count.saturating_sub(1);
                }
                self.update_volume();
            },

            ServerMsg::AssignmentFailed { cause } => {
                self.open = self.open.saturating_sub(1);
                self.metrics.connections.decrement();
                self.metrics.closed.hit_tagged(&[("cause", cause.tag())]);
                self.update_volume();
            },

            ServerMsg::WorkerLost { worker } => {
                let lost = self.per_worker.remove(&worker).unwrap_or(0);
                if lost > 0 {
                    tracing::error!(
                        server = %self.settings.name,
                        %worker,
                        lost,
                        "connections lost with worker"
                    );
                }
                for _ in 0..lost {
                    self.metrics.closed.hit_tagged(&[("cause", "worker_failure")]);
                    self.metrics.connections.decrement();
                }
                self.open = self.open.saturating_sub(lost);
                self.update_volume();
            },

            ServerMsg::Shutdown { kill_connections, ack } => {
                tracing::info!(
                    server = %self.settings.name,
                    kill_connections,
                    "server shutting down"
                );
                let _ = self.manager_tx.send(ManagerMsg::UnregisterServer {
                    server: self.token,
                    kill: kill_connections,
                });
                self.terminate();
                let _ = ack.send(());
                return ControlFlow::Break(());
            },
        }

        ControlFlow::Continue(())
    }

    /// Mailbox handling for the phases before `Bound`; `Break` means the
    /// server terminated.
    fn drain_control(&mut self, msg: Option<ServerMsg>) -> ControlFlow<()> {
        match msg {
            Some(msg) => {
                if self.handle_control(msg).is_break() {
                    self.terminate();
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            },
            None => {
                self.terminate();
                ControlFlow::Break(())
            },
        }
    }

    fn update_volume(&mut self) {
        let current = *self.volume_tx.borrow();
        let next = self.watermarks.next_state(current, self.open);
        if next == current {
            return;
        }

        if next == ConnectionVolumeState::HighWater {
            self.metrics.highwaters.hit();
        }
        tracing::info!(
            server = %self.settings.name,
            open = self.open,
            from = %current,
            to = %next,
            "connection volume state changed"
        );
        self.volume_tx.send_replace(next);
    }

    fn terminate(&mut self) {
        self.status_tx.send_replace(ServerStatus::Terminated);
    }
}
