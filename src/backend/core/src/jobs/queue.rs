//! Enqueue client.
//!
//! Turns a job payload into a [`JobRecord`], resolving priority, queue and
//! scheduling defaults, and persists it inside the `enqueue` lifecycle event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::handlers::HandlerRegistry;
use super::job::{Job, JobRecord, NamedJob};
use crate::backend::{Backend, QueueStats};
use crate::clock::{Clock, SystemClock};
use crate::error::{DeferredError, Result};
use crate::plugins::{Event, HookArgs, Lifecycle};
use crate::telemetry::metrics::JobMetrics;

/// Defaults applied to enqueued jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnqueueConfig {
    /// Priority when neither the caller nor the payload sets one
    pub default_priority: i32,
    /// Queue when neither the caller nor the payload sets one
    pub default_queue: Option<String>,
}

impl Default for EnqueueConfig {
    fn default() -> Self {
        Self {
            default_priority: 10,
            default_queue: None,
        }
    }
}

/// Per-call enqueue options. Unset fields fall back to the payload and then
/// to [`EnqueueConfig`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<i32>,
    pub run_at: Option<DateTime<Utc>>,
    pub queue: Option<String>,
    pub max_attempts: Option<u32>,
    pub max_run_time: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = Some(max_run_time);
        self
    }
}

/// Client for inserting jobs.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn Backend>,
    handlers: Arc<HandlerRegistry>,
    lifecycle: Arc<Lifecycle>,
    clock: Arc<dyn Clock>,
    config: EnqueueConfig,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn Backend>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            backend,
            handlers,
            lifecycle: Arc::new(Lifecycle::new()),
            clock: Arc::new(SystemClock),
            config: EnqueueConfig::default(),
        }
    }

    /// Share a lifecycle with the workers.
    pub fn with_lifecycle(mut self, lifecycle: Arc<Lifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EnqueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Enqueue a typed job.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `J` is not registered, or the backend
    /// error if the insert fails.
    pub async fn enqueue<J: NamedJob>(&self, job: &J, options: EnqueueOptions) -> Result<JobRecord> {
        self.ensure_registered(J::NAME)?;
        let payload = serde_json::to_value(job)?;
        let record = self.prepare(J::NAME, payload, job, options)?;
        self.persist(record).await
    }

    /// Enqueue a job from its handler name and JSON document.
    ///
    /// The document is decoded through the registry first, so a payload
    /// that no worker could run is rejected here rather than at execution.
    pub async fn enqueue_raw(
        &self,
        handler: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobRecord> {
        self.ensure_registered(handler)?;
        reject_envelope(&payload)?;
        let job = self.handlers.decode_value(handler, &payload)?;
        let record = self.prepare(handler, payload, job.as_ref(), options)?;
        self.persist(record).await
    }

    /// Record counts as of the client's clock.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.backend.stats(self.clock.now()).await
    }

    /// Delete every record, or only failed ones.
    pub async fn clear(&self, failed_only: bool) -> Result<u64> {
        let deleted = self.backend.clear(failed_only).await?;
        info!(deleted, failed_only, "Cleared jobs");
        Ok(deleted)
    }

    fn ensure_registered(&self, handler: &str) -> Result<()> {
        if self.handlers.contains(handler) {
            Ok(())
        } else {
            Err(DeferredError::configuration(format!(
                "cannot enqueue items which do not respond to perform: no handler registered for '{}'",
                handler
            )))
        }
    }

    fn prepare(
        &self,
        handler: &str,
        payload: serde_json::Value,
        job: &dyn Job,
        options: EnqueueOptions,
    ) -> Result<JobRecord> {
        let now = self.clock.now();
        let run_at = options.run_at.unwrap_or(now);
        let mut record = JobRecord::new(handler, payload, run_at, now);

        record.priority = options
            .priority
            .or_else(|| job.priority())
            .unwrap_or(self.config.default_priority);
        record.queue = options
            .queue
            .or_else(|| job.queue_name().map(str::to_string))
            .or_else(|| self.config.default_queue.clone())
            .filter(|queue| !queue.is_empty());
        record.max_attempts = options.max_attempts.or_else(|| job.max_attempts());
        record.max_run_time = options.max_run_time.or_else(|| job.max_run_time());

        if record.max_attempts == Some(0) {
            return Err(DeferredError::configuration(format!(
                "max_attempts for {} must be at least 1",
                handler
            )));
        }

        Ok(record)
    }

    async fn persist(&self, record: JobRecord) -> Result<JobRecord> {
        let mut inserted = None;

        {
            let slot = &mut inserted;
            let backend = &self.backend;
            let pending = &record;
            self.lifecycle
                .run(Event::Enqueue, HookArgs::enqueue(&record), move || async move {
                    backend.insert(pending).await.map(|saved| *slot = Some(saved))
                })
                .await?;
        }

        let Some(inserted) = inserted else {
            debug!(job_name = %record.handler, "Enqueue skipped by a hook");
            return Ok(record);
        };

        JobMetrics::enqueued(&inserted.handler, inserted.queue.as_deref());
        debug!(
            job_id = %inserted.id,
            job_name = %inserted.handler,
            queue = inserted.queue.as_deref().unwrap_or(""),
            priority = inserted.priority,
            run_at = %inserted.run_at,
            "Enqueued {}",
            inserted.label()
        );
        Ok(inserted)
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("backend", &self.backend.info())
            .field("handlers", &self.handlers)
            .field("config", &self.config)
            .finish()
    }
}

/// A document that is itself a stored job (`{"handler", "payload"}`) must not
/// be wrapped a second time.
fn reject_envelope(payload: &serde_json::Value) -> Result<()> {
    let Some(object) = payload.as_object() else {
        return Ok(());
    };
    if object.len() == 2 && object.contains_key("handler") && object.contains_key("payload") {
        return Err(DeferredError::configuration(
            "payload is already a wrapped job; enqueue the inner payload instead",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::clock::ManualClock;
    use crate::error::ErrorCode;
    use crate::jobs::builtin::{FastJob, SlowJob};
    use crate::plugins::CallbackPlugin;
    use parking_lot::Mutex;
    use serde_json::json;

    fn queue_with(backend: Arc<InMemoryBackend>) -> JobQueue {
        JobQueue::new(backend, Arc::new(HandlerRegistry::new().with_builtin_jobs()))
    }

    #[tokio::test]
    async fn test_enqueue_applies_defaults() {
        let backend = Arc::new(InMemoryBackend::new());
        let queue = queue_with(backend.clone());

        let record = queue.enqueue(&FastJob {}, EnqueueOptions::new()).await.unwrap();

        assert!(record.id.is_persisted());
        assert_eq!(record.priority, 10);
        assert_eq!(record.queue.as_deref(), Some("default"));
        assert_eq!(record.attempts, 0);
        assert_eq!(record.run_at, record.created_at);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_options_override_payload() {
        let backend = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::default());
        let queue = queue_with(backend).with_clock(clock.clone());
        let later = clock.now() + chrono::Duration::minutes(5);

        let record = queue
            .enqueue(
                &SlowJob {},
                EnqueueOptions::new()
                    .priority(13)
                    .queue("test")
                    .run_at(later)
                    .max_attempts(3),
            )
            .await
            .unwrap();

        assert_eq!(record.priority, 13);
        assert_eq!(record.queue.as_deref(), Some("test"));
        assert_eq!(record.run_at, later);
        assert_eq!(record.max_attempts, Some(3));
        assert_eq!(record.max_run_time, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_configured_default_priority() {
        let queue = queue_with(Arc::new(InMemoryBackend::new())).with_config(EnqueueConfig {
            default_priority: 42,
            default_queue: Some("mail".to_string()),
        });

        let record = queue
            .enqueue_raw("FastJob", json!({}), EnqueueOptions::new())
            .await
            .unwrap();
        assert_eq!(record.priority, 42);
        // Payload queue wins over the configured default.
        assert_eq!(record.queue.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_unregistered_handler_is_configuration_error() {
        let backend = Arc::new(InMemoryBackend::new());
        let queue = JobQueue::new(backend.clone(), Arc::new(HandlerRegistry::new()));

        let err = queue.enqueue(&FastJob {}, EnqueueOptions::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_wrapped_envelope_rejected() {
        let backend = Arc::new(InMemoryBackend::new());
        let queue = queue_with(backend.clone());

        let err = queue
            .enqueue_raw(
                "FastJob",
                json!({"handler": "FastJob", "payload": {}}),
                EnqueueOptions::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_zero_max_attempts_rejected() {
        let queue = queue_with(Arc::new(InMemoryBackend::new()));
        let err = queue
            .enqueue(&FastJob {}, EnqueueOptions::new().max_attempts(0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[tokio::test]
    async fn test_enqueue_hooks_wrap_insert() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let before = seen.clone();
        let after = seen.clone();
        let plugin = CallbackPlugin::new("audit", move |lifecycle| {
            let before = before.clone();
            let after = after.clone();
            lifecycle
                .before(Event::Enqueue, move |args| {
                    before.lock().push(args.job.map(|job| job.id.0));
                    Ok(())
                })
                .after(Event::Enqueue, move |args| {
                    after.lock().push(args.job.map(|job| job.id.0));
                    Ok(())
                });
        });
        let mut lifecycle = Lifecycle::new();
        lifecycle.add_plugin(&plugin);

        let queue = queue_with(Arc::new(InMemoryBackend::new())).with_lifecycle(Arc::new(lifecycle));
        queue.enqueue(&FastJob {}, EnqueueOptions::new()).await.unwrap();

        // Hooks see the record as prepared, before an id is assigned.
        assert_eq!(*seen.lock(), vec![Some(0), Some(0)]);
    }

    #[tokio::test]
    async fn test_failing_before_hook_prevents_insert() {
        let plugin = CallbackPlugin::new("veto", |lifecycle| {
            lifecycle.before(Event::Enqueue, |_| {
                Err(DeferredError::configuration("enqueue disabled"))
            });
        });
        let mut lifecycle = Lifecycle::new();
        lifecycle.add_plugin(&plugin);

        let backend = Arc::new(InMemoryBackend::new());
        let queue = queue_with(backend.clone()).with_lifecycle(Arc::new(lifecycle));

        assert!(queue.enqueue(&FastJob {}, EnqueueOptions::new()).await.is_err());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let backend = Arc::new(InMemoryBackend::new());
        let queue = queue_with(backend);
        for _ in 0..3 {
            queue.enqueue(&FastJob {}, EnqueueOptions::new()).await.unwrap();
        }

        assert_eq!(queue.stats().await.unwrap().ready, 3);
        assert_eq!(queue.clear(false).await.unwrap(), 3);
        assert_eq!(queue.stats().await.unwrap().total(), 0);
    }
}
