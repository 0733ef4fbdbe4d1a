//! # Plugins
//!
//! Plugins extend the queue and worker by registering callbacks on
//! [`Lifecycle`] events. A plugin is installed at most once per lifecycle,
//! keyed by its name.
//!
//! ```rust,ignore
//! use deferred_core::plugins::{Event, Lifecycle, Plugin};
//!
//! struct AuditPlugin;
//!
//! impl Plugin for AuditPlugin {
//!     fn name(&self) -> &str { "audit" }
//!
//!     fn callbacks(&self, lifecycle: &mut Lifecycle) {
//!         lifecycle.after(Event::Failure, |args| {
//!             tracing::warn!(job = ?args.job.map(|j| j.id), "job failed for good");
//!             Ok(())
//!         });
//!     }
//! }
//! ```

pub mod instrumentation;
pub mod lifecycle;

pub use instrumentation::{
    Instrumentation, MemoryNotifier, Notification, NotificationPayload, Notifier, TracingNotifier,
};
pub use lifecycle::{
    AroundCallback, Callback, Event, HookArgs, HookResult, Lifecycle, Next,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Plugin Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The trait every plugin implements.
pub trait Plugin: Send + Sync {
    /// Unique plugin name. A second plugin with the same name is not installed.
    fn name(&self) -> &str;

    /// Register this plugin's callbacks.
    fn callbacks(&self, lifecycle: &mut Lifecycle);
}

/// A plugin built from a name and a setup closure.
pub struct CallbackPlugin {
    name: String,
    setup: Box<dyn Fn(&mut Lifecycle) + Send + Sync>,
}

impl CallbackPlugin {
    pub fn new<F>(name: impl Into<String>, setup: F) -> Self
    where
        F: Fn(&mut Lifecycle) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            setup: Box::new(setup),
        }
    }
}

impl Plugin for CallbackPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn callbacks(&self, lifecycle: &mut Lifecycle) {
        (self.setup)(lifecycle)
    }
}

impl std::fmt::Debug for CallbackPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackPlugin")
            .field("name", &self.name)
            .finish()
    }
}
