//! Instrumentation plugin.
//!
//! Publishes a [`Notification`] for job lifecycle milestones:
//!
//! - `deferred.job.enqueue` after a record is inserted
//! - `deferred.job.run` around every execution, successful or not
//! - `deferred.job.error` after a failed record is rescheduled
//! - `deferred.job.failure` after a record fails permanently

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::lifecycle::{Event, HookArgs, Lifecycle};
use super::Plugin;
use crate::backend::BackendInfo;
use crate::jobs::JobRecord;
use crate::telemetry::metrics::JobMetrics;

pub const ENQUEUE: &str = "deferred.job.enqueue";
pub const RUN: &str = "deferred.job.run";
pub const ERROR: &str = "deferred.job.error";
pub const FAILURE: &str = "deferred.job.failure";

/// Payload attached to every notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    pub job_name: String,
    pub priority: i32,
    pub queue: Option<String>,
    pub table: String,
    pub database: String,
    pub database_adapter: String,
    pub job: JobRecord,
}

/// A published notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub name: &'static str,
    pub payload: NotificationPayload,
    /// Execution time, for `deferred.job.run`
    pub duration: Option<Duration>,
    /// Whether the instrumented action failed
    pub failed: bool,
}

/// Receiver of notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Emits notifications as tracing events and metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) {
        let payload = &notification.payload;
        tracing::info!(
            target: "deferred::instrumentation",
            event = notification.name,
            job_id = %payload.job.id,
            job_name = %payload.job_name,
            priority = payload.priority,
            queue = payload.queue.as_deref().unwrap_or(""),
            table = %payload.table,
            database = %payload.database,
            database_adapter = %payload.database_adapter,
            duration_ms = notification.duration.map(|d| d.as_millis() as u64),
            failed = notification.failed,
        );
        JobMetrics::notification(notification.name);
    }
}

/// Keeps every notification in memory. Useful in tests.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications received so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    /// Notifications with the given name.
    pub fn named(&self, name: &str) -> Vec<Notification> {
        self.notifications
            .lock()
            .iter()
            .filter(|n| n.name == name)
            .cloned()
            .collect()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: &Notification) {
        self.notifications.lock().push(notification.clone());
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Plugin
// ═══════════════════════════════════════════════════════════════════════════════

/// The instrumentation plugin.
#[derive(Clone)]
pub struct Instrumentation {
    notifier: Arc<dyn Notifier>,
    backend: BackendInfo,
}

impl Instrumentation {
    pub fn new(backend: BackendInfo) -> Self {
        Self::with_notifier(backend, Arc::new(TracingNotifier))
    }

    pub fn with_notifier(backend: BackendInfo, notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier, backend }
    }

    fn publish(
        &self,
        name: &'static str,
        args: HookArgs<'_>,
        duration: Option<Duration>,
        failed: bool,
    ) {
        let Some(job) = args.job else {
            return;
        };
        let notification = Notification {
            name,
            payload: NotificationPayload {
                job_name: job.name().to_string(),
                priority: job.priority,
                queue: job.queue.clone(),
                table: self.backend.table.clone(),
                database: self.backend.database.clone(),
                database_adapter: self.backend.adapter.clone(),
                job: job.clone(),
            },
            duration,
            failed,
        };
        self.notifier.notify(&notification);
    }
}

impl Plugin for Instrumentation {
    fn name(&self) -> &str {
        "instrumentation"
    }

    fn callbacks(&self, lifecycle: &mut Lifecycle) {
        let this = self.clone();
        lifecycle.after(Event::Enqueue, move |args| {
            this.publish(ENQUEUE, args, None, false);
            Ok(())
        });

        let this = self.clone();
        lifecycle.around(Event::Execute, move |args, next| {
            let this = this.clone();
            Box::pin(async move {
                let started = Instant::now();
                let result = next.run().await;
                this.publish(RUN, args, Some(started.elapsed()), result.is_err());
                result
            })
        });

        let this = self.clone();
        lifecycle.after(Event::Error, move |args| {
            this.publish(ERROR, args, None, true);
            Ok(())
        });

        let this = self.clone();
        lifecycle.after(Event::Failure, move |args| {
            this.publish(FAILURE, args, None, true);
            Ok(())
        });
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("backend", &self.backend)
            .finish()
    }
}
