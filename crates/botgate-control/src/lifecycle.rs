use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use axum::Router;
use botgate_model::ServerState;
use futures_util::future::join_all;
use tokio::{
    net::TcpListener,
    sync::{oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{self, AppState},
    config::ControlConfig,
    error::StartError,
    port_alloc::{LoopbackProbe, PortNegotiator, PortProbe},
    registry::InstanceRegistry,
    runner::BotRunner,
};

#[derive(Debug)]
pub enum StartOutcome {
    Started(u16),
    AlreadyRunning,
    Failed(StartError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The server task (or a pending start) ignored cancellation for the
    /// whole wait and was abandoned. The controller still counts as stopped.
    TimedOut,
}

#[derive(Debug)]
struct Inner {
    state: ServerState,
    port: Option<u16>,
    /// Bumped by every accepted `start`; a launch only settles its own run.
    generation: u64,
    shutdown: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    /// Flips to `true` once the current launch has settled. Set only while
    /// `Starting`.
    settled: Option<watch::Receiver<bool>>,
}

impl Inner {
    fn reset(&mut self, state: ServerState) {
        self.state = state;
        self.port = None;
        self.shutdown = None;
        self.task = None;
        self.settled = None;
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns the control-plane server: at most one instance is starting or
/// running at a time.
///
/// State transitions happen under a short synchronous lock that is never held
/// across an await, so concurrent `start` calls are resolved by whichever
/// reaches the guard first. The bring-up itself runs on its own task, so a
/// caller that drops `start` halfway never leaves the controller stuck in
/// `Starting`.
pub struct LifecycleController<P = LoopbackProbe> {
    config: ControlConfig,
    negotiator: Arc<PortNegotiator<P>>,
    registry: InstanceRegistry,
    runner: Arc<dyn BotRunner>,
    inner: Arc<Mutex<Inner>>,
}

impl LifecycleController<LoopbackProbe> {
    pub fn new(
        config: ControlConfig,
        registry: InstanceRegistry,
        runner: Arc<dyn BotRunner>,
    ) -> Self {
        Self::with_negotiator(config, PortNegotiator::new(), registry, runner)
    }
}

impl<P: PortProbe + 'static> LifecycleController<P> {
    pub fn with_negotiator(
        config: ControlConfig,
        negotiator: PortNegotiator<P>,
        registry: InstanceRegistry,
        runner: Arc<dyn BotRunner>,
    ) -> Self {
        Self {
            config,
            negotiator: Arc::new(negotiator),
            registry,
            runner,
            inner: Arc::new(Mutex::new(Inner {
                state: ServerState::Stopped,
                port: None,
                generation: 0,
                shutdown: None,
                task: None,
                settled: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    /// Port of the running server, if any.
    pub fn port(&self) -> Option<u16> {
        self.lock().port
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    fn app_state(&self) -> AppState {
        AppState {
            registry: self.registry.clone(),
            runner: self.runner.clone(),
            log_path: self.config.log_path(),
            probe_timeout: self.config.probe_timeout,
        }
    }

    /// Negotiates a port starting at `preferred`, registers this instance and
    /// brings the server up. Returns once the server has bound its sockets or
    /// failed to.
    ///
    /// Dropping the returned future does not abort the bring-up: the launch
    /// keeps going and settles the state on its own.
    pub async fn start(&self, preferred: u16) -> StartOutcome {
        let launch = {
            let mut inner = self.lock();
            if inner.state.is_live() {
                return StartOutcome::AlreadyRunning;
            }
            if inner.state == ServerState::Stopping {
                return StartOutcome::Failed(StartError::ShuttingDown);
            }
            let shutdown = CancellationToken::new();
            let (settled_tx, settled_rx) = watch::channel(false);
            inner.reset(ServerState::Starting);
            inner.generation += 1;
            inner.shutdown = Some(shutdown.clone());
            inner.settled = Some(settled_rx);
            Launch {
                config: self.config.clone(),
                negotiator: self.negotiator.clone(),
                registry: self.registry.clone(),
                app: self.app_state(),
                inner: self.inner.clone(),
                generation: inner.generation,
                shutdown,
                settled: settled_tx,
            }
        };
        tracing::info!(preferred, attempts = self.config.port_attempts, "starting control plane");

        let generation = launch.generation;
        match tokio::spawn(launch.run(preferred)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut inner = self.lock();
                if inner.generation == generation && inner.state == ServerState::Starting {
                    inner.reset(ServerState::Failed);
                }
                drop(inner);
                tracing::error!(error = %e, "control plane launch task failed");
                StartOutcome::Failed(StartError::Internal(format!("launch task failed: {e}")))
            }
        }
    }

    /// Cancels the server and waits up to `timeout` for it to exit.
    ///
    /// A stop during `Starting` cancels the pending start and waits, within
    /// the same timeout, for it to settle and release its port.
    pub async fn stop(&self, timeout: Duration) -> StopOutcome {
        let deadline = Instant::now() + timeout;

        let pending = {
            let inner = self.lock();
            match (inner.state, &inner.shutdown) {
                (ServerState::Starting, Some(token)) => {
                    token.cancel();
                    inner.settled.clone().map(|rx| (rx, inner.generation))
                }
                _ => None,
            }
        };
        if let Some((mut settled, generation)) = pending {
            tracing::info!("stop requested while starting");
            // A closed channel means the launch task is gone; treat it as settled.
            let in_time = tokio::time::timeout_at(deadline, settled.wait_for(|done| *done))
                .await
                .is_ok();
            if !in_time {
                let mut inner = self.lock();
                if inner.generation == generation && inner.state == ServerState::Starting {
                    inner.reset(ServerState::Stopped);
                }
                drop(inner);
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "pending start did not settle in time, abandoning it"
                );
                return StopOutcome::TimedOut;
            }
        }

        let (shutdown, task, port) = {
            let mut inner = self.lock();
            if inner.state != ServerState::Running {
                return StopOutcome::Stopped;
            }
            inner.state = ServerState::Stopping;
            (inner.shutdown.take(), inner.task.take(), inner.port)
        };
        tracing::info!(port, "stopping control plane");

        if let Some(token) = shutdown {
            token.cancel();
        }

        let outcome = match task {
            Some(task) => match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => StopOutcome::Stopped,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "server task ended abnormally");
                    StopOutcome::Stopped
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "server task did not exit in time, abandoning it"
                    );
                    StopOutcome::TimedOut
                }
            },
            None => StopOutcome::Stopped,
        };

        self.lock().reset(ServerState::Stopped);
        tracing::info!(?outcome, "control plane stopped");
        outcome
    }
}

/// One accepted `start`: everything the bring-up needs, detached from the
/// controller's borrow so it can run on its own task.
struct Launch<P> {
    config: ControlConfig,
    negotiator: Arc<PortNegotiator<P>>,
    registry: InstanceRegistry,
    app: AppState,
    inner: Arc<Mutex<Inner>>,
    generation: u64,
    shutdown: CancellationToken,
    settled: watch::Sender<bool>,
}

impl<P: PortProbe + 'static> Launch<P> {
    async fn run(self, preferred: u16) -> StartOutcome {
        let result = self.bring_up(preferred).await;
        let outcome = self.finish(result).await;
        self.settled.send_replace(true);
        outcome
    }

    async fn bring_up(&self, preferred: u16) -> Result<(u16, JoinHandle<()>), StartError> {
        let negotiator = self.negotiator.clone();
        let attempts = self.config.port_attempts;
        let port = tokio::task::spawn_blocking(move || negotiator.find_port(preferred, attempts))
            .await
            .map_err(|e| StartError::Internal(format!("port negotiation task failed: {e}")))??;

        if self.shutdown.is_cancelled() {
            return Err(StartError::Cancelled);
        }

        // Registered before the server accepts its first connection.
        let name = self.config.instance_name_for(port);
        self.registry.register(&name, &self.config.instance_host, port);

        let dual_stack = self.negotiator.probe().ipv6_supported();
        let (ready_tx, ready_rx) = oneshot::channel();
        let app = api::router(self.app.clone());
        let task = tokio::spawn(serve(port, dual_stack, app, self.shutdown.clone(), ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok((port, task)),
            // No retry on the same port: the caller picks a new preferred port.
            Ok(Err(source)) => Err(StartError::PortConflict { port, source }),
            Err(_) => Err(StartError::ServerExited),
        }
    }

    async fn finish(&self, result: Result<(u16, JoinHandle<()>), StartError>) -> StartOutcome {
        let (port, task) = match result {
            Ok(ok) => ok,
            Err(e) => {
                self.settle(match e {
                    StartError::Cancelled => ServerState::Stopped,
                    _ => ServerState::Failed,
                });
                tracing::error!(error = %e, "control plane failed to start");
                return StartOutcome::Failed(e);
            }
        };

        // The cancellation check happens under the lock `stop` cancels under.
        let task = {
            let mut inner = lock(&self.inner);
            if inner.generation == self.generation && !self.shutdown.is_cancelled() {
                inner.state = ServerState::Running;
                inner.port = Some(port);
                inner.task = Some(task);
                inner.settled = None;
                None
            } else {
                Some(task)
            }
        };
        let Some(task) = task else {
            tracing::info!(port, "control plane started");
            return StartOutcome::Started(port);
        };

        // A stop arrived while starting: wait for the server to let go of the
        // port before reporting.
        let _ = task.await;
        self.settle(ServerState::Stopped);
        tracing::warn!(port, "control plane start cancelled");
        StartOutcome::Failed(StartError::Cancelled)
    }

    fn settle(&self, state: ServerState) {
        let mut inner = lock(&self.inner);
        if inner.generation == self.generation && inner.state == ServerState::Starting {
            inner.reset(state);
        }
    }
}

impl<P> Drop for LifecycleController<P> {
    fn drop(&mut self) {
        if let Some(token) = lock(&self.inner).shutdown.take() {
            token.cancel();
        }
    }
}

async fn bind_loopback(port: u16, dual_stack: bool) -> io::Result<Vec<TcpListener>> {
    let mut listeners = vec![TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?];
    if dual_stack {
        listeners.push(TcpListener::bind((Ipv6Addr::LOCALHOST, port)).await?);
    }
    Ok(listeners)
}

/// Server task body. Reports the bind result through `ready` before serving,
/// then serves every listener until `shutdown` fires.
async fn serve(
    port: u16,
    dual_stack: bool,
    app: Router,
    shutdown: CancellationToken,
    ready: oneshot::Sender<io::Result<()>>,
) {
    let listeners = match bind_loopback(port, dual_stack).await {
        Ok(listeners) => listeners,
        Err(e) => {
            tracing::error!(port, error = %e, "control port bind failed");
            let _ = ready.send(Err(e));
            return;
        }
    };
    for listener in &listeners {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "control plane HTTP listening");
        }
    }
    if ready.send(Ok(())).is_err() {
        return;
    }

    let servers = listeners.into_iter().map(|listener| {
        let app = app.clone();
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }
    });
    for result in join_all(servers).await {
        if let Err(e) = result {
            tracing::error!(port, error = %e, "control plane server error");
        }
    }
    tracing::debug!(port, "server task exited");
}
