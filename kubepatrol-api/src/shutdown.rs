//! Graceful shutdown handling
//!
//! Provides coordinated shutdown of the daemon with:
//! - Signal handling (SIGTERM, SIGINT, SIGQUIT)
//! - Background task cancellation
//! - Ordered cleanup of scheduler, clusters and database

use crate::db::Database;
use crate::registry::ClusterRegistry;
use crate::scheduler::Scheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Shutdown coordinator for graceful termination
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Watch channel for shutdown signal
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Flag indicating shutdown has started
    is_shutting_down: Arc<AtomicBool>,
    /// Timeout for graceful shutdown
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator with default 30s timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            shutdown_tx,
            shutdown_rx,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Get a receiver for shutdown signals
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            // Already shutting down
            return;
        }

        info!("Initiating graceful shutdown...");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for a termination signal from the OS or a programmatic shutdown
    pub async fn wait_for_signal(&self) {
        let mut rx = self.subscribe();
        let requested = async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };

        tokio::select! {
            _ = Self::os_signal() => self.shutdown(),
            _ = requested => {}
        }
    }

    #[cfg(unix)]
    async fn os_signal() {
        use tokio::signal::unix::{signal, SignalKind};

        let (Ok(mut sigterm), Ok(mut sigint), Ok(mut sigquit)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::quit()),
        ) else {
            warn!("Failed to register signal handlers, falling back to Ctrl+C");
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
            }
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigquit.recv() => info!("Received SIGQUIT"),
        }
    }

    #[cfg(not(unix))]
    async fn os_signal() {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Manages graceful shutdown of background tasks
pub struct TaskShutdown {
    tasks: Vec<(&'static str, tokio::task::JoinHandle<()>)>,
}

impl TaskShutdown {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Register a background task for shutdown
    pub fn register(&mut self, name: &'static str, handle: tokio::task::JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Abort all registered tasks
    pub async fn abort_all(&mut self, timeout: Duration) {
        info!("Stopping {} background tasks...", self.tasks.len());

        for (name, handle) in self.tasks.drain(..) {
            handle.abort();

            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!("Task '{}' stopped gracefully", name),
                Ok(Err(e)) if e.is_cancelled() => info!("Task '{}' cancelled", name),
                Ok(Err(e)) => warn!("Task '{}' failed: {}", name, e),
                Err(_) => warn!("Task '{}' did not stop within timeout", name),
            }
        }
    }
}

impl Default for TaskShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs cleanup once the coordinator fires
pub struct GracefulShutdown {
    coordinator: ShutdownCoordinator,
}

impl GracefulShutdown {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Wait for shutdown, then run `cleanup` bounded by the coordinator timeout
    pub async fn run<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        self.coordinator.wait_for_signal().await;

        info!("Starting graceful shutdown sequence...");
        let shutdown_timeout = self.coordinator.timeout();

        match timeout(shutdown_timeout, cleanup()).await {
            Ok(()) => info!("Cleanup completed successfully"),
            Err(_) => warn!("Cleanup did not complete within {:?}, forcing exit", shutdown_timeout),
        }

        info!("Shutdown complete");
    }
}

/// Cleanup operations to run during shutdown, in registration order
pub struct CleanupRunner {
    operations: Vec<Box<dyn CleanupOperation + Send + Sync>>,
}

impl CleanupRunner {
    pub fn new() -> Self {
        Self {
            operations: Vec::new(),
        }
    }

    pub fn add<T: CleanupOperation + Send + Sync + 'static>(&mut self, op: T) {
        self.operations.push(Box::new(op));
    }

    /// Run all cleanup operations; a failing one does not stop the rest
    pub async fn run_all(&self) {
        for (i, op) in self.operations.iter().enumerate() {
            info!("Running cleanup operation {}/{}: {}", i + 1, self.operations.len(), op.name());

            if let Err(e) = op.cleanup().await {
                error!("Cleanup operation '{}' failed: {}", op.name(), e);
            }
        }
    }
}

impl Default for CleanupRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for cleanup operations during shutdown
#[async_trait::async_trait]
pub trait CleanupOperation {
    fn name(&self) -> &'static str;

    async fn cleanup(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Stops the dispatch loop and cancels running inspections
pub struct SchedulerCleanup {
    scheduler: Arc<Scheduler>,
}

impl SchedulerCleanup {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait::async_trait]
impl CleanupOperation for SchedulerCleanup {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn cleanup(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.scheduler.stop().await;
        Ok(())
    }
}

/// Disconnects every connected cluster, stopping their watches
pub struct RegistryCleanup {
    registry: Arc<ClusterRegistry>,
}

impl RegistryCleanup {
    pub fn new(registry: Arc<ClusterRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl CleanupOperation for RegistryCleanup {
    fn name(&self) -> &'static str {
        "cluster_registry"
    }

    async fn cleanup(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        for cluster in self.registry.connected_clusters().await {
            self.registry.disconnect(&cluster.id()).await;
        }
        Ok(())
    }
}

pub struct DatabaseCleanup {
    db: Database,
}

impl DatabaseCleanup {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl CleanupOperation for DatabaseCleanup {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn cleanup(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Closing database connections...");
        self.db.clone().close().await;
        Ok(())
    }
}
