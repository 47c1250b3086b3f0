use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry, DEFAULT_METRICS_INTERVAL};
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handles passed to a component when the runner starts it.
#[derive(Clone)]
pub struct ComponentContext {
    pub shutdown: CancellationToken,
    pub fatal: FatalErrorHandler,
    pub telemetry: Arc<Telemetry>,
}

/// A long-lived service owned by a [`Runner`]. `run` must return once
/// `ctx.shutdown` is cancelled, after finishing the unit of work in progress.
pub trait Component: Send + 'static {
    fn name(&self) -> &'static str;

    fn run(self: Box<Self>, ctx: ComponentContext) -> BoxFuture<'static, Result<()>>;
}

/// Owns the root cancellation token, the fatal-error handler and the metrics
/// reporter, and drives a set of components until a signal or a fatal error.
pub struct Runner {
    components: Vec<Box<dyn Component>>,
    running: Vec<(&'static str, JoinHandle<Result<()>>)>,
    reporter: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    fatal: FatalErrorHandler,
    telemetry: Arc<Telemetry>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(Arc::new(Telemetry::default()))
    }
}

impl Runner {
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            components: Vec::new(),
            running: Vec::new(),
            reporter: None,
            fatal: FatalErrorHandler::new(shutdown.clone()),
            shutdown,
            telemetry,
        }
    }

    pub fn add(&mut self, component: impl Component) -> &mut Self {
        self.components.push(Box::new(component));
        self
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn fatal_handler(&self) -> FatalErrorHandler {
        self.fatal.clone()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.telemetry)
    }

    /// Spawns every added component and the metrics reporter.
    pub fn start(&mut self) {
        if self.reporter.is_none() {
            self.reporter = Some(spawn_metrics_reporter(
                Arc::clone(&self.telemetry),
                self.shutdown.child_token(),
                DEFAULT_METRICS_INTERVAL,
            ));
        }

        for component in self.components.drain(..) {
            let name = component.name();
            let ctx = ComponentContext {
                shutdown: self.shutdown.child_token(),
                fatal: self.fatal.clone(),
                telemetry: Arc::clone(&self.telemetry),
            };
            tracing::info!(component = name, "starting component");
            self.running.push((name, tokio::spawn(component.run(ctx))));
        }
    }

    /// Cancels the root token and waits for every component to return.
    ///
    /// Returns the captured fatal error if one was raised, otherwise the first
    /// component failure.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();

        let mut first_error = None;
        for (name, handle) in self.running.drain(..) {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(anyhow!("component {name} panicked: {join_err}")),
            };
            match outcome {
                Ok(()) => tracing::info!(component = name, "component stopped"),
                Err(err) => {
                    tracing::error!(component = name, error = %err, "component failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(reporter) = self.reporter.take() {
            let _ = reporter.await;
        }

        if let Some(fatal) = self.fatal.error() {
            return Err(fatal);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Runs until Ctrl-C (SIGINT), SIGTERM, or a cancellation of the root token
    /// (which a fatal error triggers), then stops every component.
    pub async fn run_until_signal(&mut self) -> Result<()> {
        self.start();
        tracing::info!("runner started; waiting for a shutdown signal");

        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received; stopping components");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.stop().await
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
