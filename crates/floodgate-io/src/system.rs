//! The system facade: one worker pool, any number of servers.
//!
//! An [`IoSystem`] wires a metrics registry and a worker pool together and
//! is the entry point for everything else: attaching servers, opening
//! outbound connections (routed round-robin like inbound ones), and binding
//! ad-hoc tasks to worker loops. Several systems can coexist in one
//! process; they share nothing.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
};

use floodgate_core::{
    Conduit, ConnectionId, DelegatorFactory, IoSystemConfig, MetricsRegistry, ServerSettings,
};
use tokio::{
    net::TcpStream,
    sync::oneshot,
    task::JoinHandle,
};

use crate::{
    error::SystemError,
    manager::{ManagerMsg, ManagerSender, WorkerManager},
    server::{Server, ServerRef, ServerToken},
    task::{Task, TaskProxy},
};

/// A named I/O subsystem: worker pool, metrics, and attached servers.
pub struct IoSystem {
    name: String,
    num_workers: usize,
    metrics: Arc<MetricsRegistry>,
    manager_tx: ManagerSender,
    manager: JoinHandle<()>,
    servers: Mutex<Vec<(ServerRef, JoinHandle<()>)>>,
    next_token: AtomicU64,
}

impl IoSystem {
    /// Start a system: spawns the worker pool and returns the facade.
    ///
    /// The worker count defaults to the hardware parallelism when the
    /// config leaves it unset.
    ///
    /// # Errors
    ///
    /// [`ConfigError`](floodgate_core::ConfigError) if the config is
    /// invalid; nothing is spawned in that case.
    pub fn start(config: IoSystemConfig) -> Result<Self, floodgate_core::ConfigError> {
        config.validate()?;

        let num_workers = config
            .num_workers
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, usize::from));

        let metrics = Arc::new(MetricsRegistry::new());
        let (manager_tx, manager) = WorkerManager::start(num_workers, &metrics);

        tracing::info!(system = %config.name, num_workers, "io system started");

        Ok(Self {
            name: config.name,
            num_workers,
            metrics,
            manager_tx,
            manager,
            servers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(0),
        })
    }

    /// The system's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the worker pool.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// The system's metrics registry.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Attach a server: validates the settings, registers the delegator
    /// factory with every worker, and starts the bind/accept loop.
    ///
    /// # Errors
    ///
    /// - [`SystemError::Config`] if the settings are invalid
    /// - [`SystemError::NoWorkers`] on a zero-worker system
    pub fn attach_server(
        &self,
        settings: ServerSettings,
        factory: impl DelegatorFactory,
    ) -> Result<ServerRef, SystemError> {
        settings.validate()?;
        if self.num_workers == 0 {
            return Err(SystemError::NoWorkers);
        }

        let token = ServerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (server, server_ref) = Server::create(
            token,
            settings,
            Arc::new(factory),
            self.manager_tx.clone(),
            &self.metrics,
        );

        let handle = tokio::spawn(server.run());
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((server_ref.clone(), handle));

        tracing::info!(system = %self.name, server = %server_ref.name(), "server attached");
        Ok(server_ref)
    }

    /// Open an outbound connection and bind it to a worker picked by the
    /// same round-robin policy as inbound assignments.
    ///
    /// The conduit is driven by the owning worker exactly like a
    /// server-side connection, but with no server: no idle bound applies.
    ///
    /// # Errors
    ///
    /// - [`SystemError::NoWorkers`] on a zero-worker system
    /// - [`SystemError::Connect`] if the TCP connection fails
    /// - [`SystemError::Terminated`] if the pool is gone
    pub async fn connect(
        &self,
        addr: SocketAddr,
        conduit: Box<dyn Conduit>,
    ) -> Result<ConnectionId, SystemError> {
        if self.num_workers == 0 {
            return Err(SystemError::NoWorkers);
        }

        let stream = TcpStream::connect(addr).await?;
        if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(system = %self.name, %addr, %error, "set_nodelay failed");
        }
        let peer = stream.peer_addr()?;

        let (reply, bound) = oneshot::channel();
        self.manager_tx
            .send(ManagerMsg::AssignOutbound { stream, peer, conduit, reply })
            .map_err(|_| SystemError::Terminated)?;

        bound.await.map_err(|_| SystemError::Terminated)
    }

    /// Bind an ad-hoc [`Task`] to a worker and return its proxy.
    ///
    /// # Errors
    ///
    /// - [`SystemError::NoWorkers`] on a zero-worker system
    /// - [`SystemError::Terminated`] if the pool is gone
    pub async fn run(&self, task: Box<dyn Task>) -> Result<TaskProxy, SystemError> {
        if self.num_workers == 0 {
            return Err(SystemError::NoWorkers);
        }

        let (reply, bound) = oneshot::channel();
        self.manager_tx
            .send(ManagerMsg::BindTask { task, reply })
            .map_err(|_| SystemError::Terminated)?;

        bound.await.map_err(|_| SystemError::Terminated)
    }

    /// Graceful teardown: drain every server, then shut the workers down
    /// and wait for their acknowledgements.
    pub async fn shutdown(self) {
        tracing::info!(system = %self.name, "io system shutting down");

        let servers = {
            let mut guard = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for (server_ref, handle) in servers {
            server_ref.shutdown(false).await;
            let _ = handle.await;
        }

        let (ack, done) = oneshot::channel();
        if self.manager_tx.send(ManagerMsg::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
        let _ = self.manager.await;

        tracing::info!(system = %self.name, "io system stopped");
    }

    /// Immediate, non-graceful termination: every task the system owns —
    /// servers, manager, workers, their connections — is aborted without
    /// drain.
    pub fn apocalypse(self) {
        tracing::error!(system = %self.name, "apocalypse: terminating without drain");

        let servers = {
            let mut guard = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for (_, handle) in servers {
            handle.abort();
        }
        // Aborting the manager drops its pool, which aborts every worker.
        self.manager.abort();
    }
}
