//! Connection to the job store and the shared queue components.

use anyhow::{Context as _, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use deferred_core::backend::Backend;
use deferred_core::config::Config;
use deferred_core::db::PostgresBackend;
use deferred_core::jobs::{HandlerRegistry, JobQueue, Worker, WorkerConfig};
use deferred_core::plugins::{Instrumentation, Lifecycle, Plugin};

/// Everything a command needs: configuration, backend, handlers and the
/// lifecycle shared by workers and the enqueue client.
pub struct Context {
    pub config: Config,
    backend: Arc<PostgresBackend>,
    handlers: Arc<HandlerRegistry>,
    lifecycle: Arc<Lifecycle>,
}

impl Context {
    /// Connect to the configured database.
    pub async fn connect(config: Config) -> Result<Self> {
        let backend = PostgresBackend::connect(&config.database)
            .await
            .with_context(|| "Failed to connect to the job database")?;

        let instrumentation: Arc<dyn Plugin> = Arc::new(Instrumentation::new(backend.info()));
        let lifecycle = Lifecycle::with_plugins([instrumentation]);

        Ok(Self {
            config,
            backend: Arc::new(backend),
            handlers: Arc::new(HandlerRegistry::new().with_builtin_jobs()),
            lifecycle: Arc::new(lifecycle),
        })
    }

    pub fn backend(&self) -> &PostgresBackend {
        &self.backend
    }

    /// Enqueue client using the configured defaults.
    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.backend.clone(), self.handlers.clone())
            .with_lifecycle(self.lifecycle.clone())
            .with_config(self.config.enqueue.clone())
    }

    /// Build a worker that stops when `shutdown` is cancelled.
    pub fn worker(&self, config: WorkerConfig, shutdown: CancellationToken) -> Result<Worker> {
        let worker = Worker::builder(self.backend.clone(), self.handlers.clone())
            .config(config)
            .retry_policy(self.config.retry.clone())
            .lifecycle(self.lifecycle.clone())
            .shutdown_token(shutdown)
            .build()?;
        Ok(worker)
    }
}
