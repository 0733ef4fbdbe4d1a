//! Lifecycle events and their callback chains.
//!
//! Each [`Event`] guards one action inside the queue or worker:
//!
//! | Event     | Guarded action                          | Arguments            |
//! |-----------|-----------------------------------------|----------------------|
//! | `Enqueue` | inserting a new record                  | job                  |
//! | `Reserve` | one reservation attempt                 | worker               |
//! | `Thread`  | everything done for one reserved job    | worker, job          |
//! | `Execute` | the job body                            | worker, job          |
//! | `Error`   | persisting a rescheduled record         | worker, job, error   |
//! | `Failure` | persisting or deleting a failed record  | worker, job, error   |
//!
//! Running an event calls every `before` callback, then the `around` chain
//! (first registered is outermost) with the action at its centre, then every
//! `after` callback. An error from a `before` or `around` callback aborts the
//! action and is returned to the caller; `after` callbacks only run when the
//! action succeeded.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::Plugin;
use crate::error::Result;
use crate::jobs::{JobError, JobRecord};

/// Result returned by callbacks and guarded actions.
pub type HookResult = Result<()>;

/// A `before` or `after` callback.
pub type Callback = Arc<dyn Fn(HookArgs<'_>) -> HookResult + Send + Sync>;

/// An `around` callback. It must call [`Next::run`] for the action to happen.
pub type AroundCallback =
    Arc<dyn for<'a> Fn(HookArgs<'a>, Next<'a>) -> BoxFuture<'a, HookResult> + Send + Sync>;

type Action<'a> = Box<dyn FnOnce() -> BoxFuture<'a, HookResult> + Send + 'a>;

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Enqueue,
    Reserve,
    Thread,
    Execute,
    Error,
    Failure,
}

impl Event {
    pub const ALL: [Event; 6] = [
        Event::Enqueue,
        Event::Reserve,
        Event::Thread,
        Event::Execute,
        Event::Error,
        Event::Failure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Reserve => "reserve",
            Self::Thread => "thread",
            Self::Execute => "execute",
            Self::Error => "error",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments passed to every callback of an event.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookArgs<'a> {
    /// Name of the worker running the event
    pub worker: Option<&'a str>,
    /// The record the event concerns
    pub job: Option<&'a JobRecord>,
    /// The failure being recorded
    pub error: Option<&'a JobError>,
}

impl<'a> HookArgs<'a> {
    pub fn enqueue(job: &'a JobRecord) -> Self {
        Self {
            job: Some(job),
            ..Default::default()
        }
    }

    pub fn worker(worker: &'a str) -> Self {
        Self {
            worker: Some(worker),
            ..Default::default()
        }
    }

    pub fn job(worker: &'a str, job: &'a JobRecord) -> Self {
        Self {
            worker: Some(worker),
            job: Some(job),
            error: None,
        }
    }

    pub fn failure(worker: &'a str, job: &'a JobRecord, error: &'a JobError) -> Self {
        Self {
            worker: Some(worker),
            job: Some(job),
            error: Some(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Around Chain
// ═══════════════════════════════════════════════════════════════════════════════

/// The rest of an `around` chain.
pub struct Next<'a> {
    args: HookArgs<'a>,
    chain: &'a [AroundCallback],
    action: Action<'a>,
}

impl<'a> Next<'a> {
    pub fn args(&self) -> HookArgs<'a> {
        self.args
    }

    /// Run the remaining `around` callbacks and then the guarded action.
    pub fn run(self) -> BoxFuture<'a, HookResult> {
        match self.chain.split_first() {
            Some((around, rest)) => around(
                self.args,
                Next {
                    args: self.args,
                    chain: rest,
                    action: self.action,
                },
            ),
            None => (self.action)(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Default)]
struct Callbacks {
    before: Vec<Callback>,
    around: Vec<AroundCallback>,
    after: Vec<Callback>,
}

/// Callback chains for every event, plus the names of installed plugins.
#[derive(Clone, Default)]
pub struct Lifecycle {
    events: HashMap<Event, Callbacks>,
    plugins: Vec<String>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a lifecycle with `plugins` installed in order.
    pub fn with_plugins<I>(plugins: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Plugin>>,
    {
        let mut lifecycle = Self::new();
        for plugin in plugins {
            lifecycle.add_plugin(plugin.as_ref());
        }
        lifecycle
    }

    /// Install a plugin's callbacks. A plugin whose name is already installed
    /// is skipped and `false` is returned.
    pub fn add_plugin(&mut self, plugin: &dyn Plugin) -> bool {
        let name = plugin.name();
        if self.has_plugin(name) {
            debug!(plugin = name, "Plugin already installed");
            return false;
        }
        self.plugins.push(name.to_string());
        plugin.callbacks(self);
        debug!(plugin = name, "Plugin installed");
        true
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|installed| installed == name)
    }

    /// Installed plugin names in installation order.
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    /// Register a callback to run before `event`'s action.
    pub fn before<F>(&mut self, event: Event, callback: F) -> &mut Self
    where
        F: Fn(HookArgs<'_>) -> HookResult + Send + Sync + 'static,
    {
        self.events
            .entry(event)
            .or_default()
            .before
            .push(Arc::new(callback));
        self
    }

    /// Register a callback to run after `event`'s action succeeded.
    pub fn after<F>(&mut self, event: Event, callback: F) -> &mut Self
    where
        F: Fn(HookArgs<'_>) -> HookResult + Send + Sync + 'static,
    {
        self.events
            .entry(event)
            .or_default()
            .after
            .push(Arc::new(callback));
        self
    }

    /// Register a callback that wraps `event`'s action.
    pub fn around<F>(&mut self, event: Event, callback: F) -> &mut Self
    where
        F: for<'a> Fn(HookArgs<'a>, Next<'a>) -> BoxFuture<'a, HookResult>
            + Send
            + Sync
            + 'static,
    {
        self.events
            .entry(event)
            .or_default()
            .around
            .push(Arc::new(callback));
        self
    }

    /// Number of callbacks registered for `event`.
    pub fn callback_count(&self, event: Event) -> usize {
        self.events
            .get(&event)
            .map(|c| c.before.len() + c.around.len() + c.after.len())
            .unwrap_or(0)
    }

    /// Run `action` guarded by `event`'s callbacks.
    pub async fn run<'a, F, Fut>(&'a self, event: Event, args: HookArgs<'a>, action: F) -> HookResult
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = HookResult> + Send + 'a,
    {
        let Some(callbacks) = self.events.get(&event) else {
            return action().await;
        };

        for before in &callbacks.before {
            before(args)?;
        }

        let action: Action<'a> = Box::new(move || Box::pin(action()) as BoxFuture<'a, HookResult>);
        Next {
            args,
            chain: &callbacks.around,
            action,
        }
        .run()
        .await?;

        for after in &callbacks.after {
            after(args)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = Event::ALL
            .iter()
            .map(|event| (event.as_str(), self.callback_count(*event)))
            .collect();
        f.debug_struct("Lifecycle")
            .field("plugins", &self.plugins)
            .field("callbacks", &counts)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
