//! Handler registry: maps a record's handler name back to an executable job.

use std::collections::HashMap;
use std::sync::Arc;

use super::job::{Job, JobRecord, NamedJob};
use crate::error::{DeferredError, ErrorCode, Result};

type Decoder = Arc<dyn Fn(&serde_json::Value) -> Result<Box<dyn Job>> + Send + Sync>;

/// Registry of job types a worker knows how to run.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `J` under [`NamedJob::NAME`]. A later registration of the same
    /// name replaces the earlier one.
    pub fn register<J: NamedJob>(&mut self) -> &mut Self {
        let decoder: Decoder = Arc::new(|payload| {
            let job: J = serde_json::from_value(payload.clone()).map_err(|e| {
                DeferredError::with_internal(
                    ErrorCode::DeserializationError,
                    format!("Job payload for '{}' could not be decoded", J::NAME),
                    e.to_string(),
                )
                .with_source(e)
            })?;
            Ok(Box::new(job) as Box<dyn Job>)
        });
        self.decoders.insert(J::NAME, decoder);
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<J: NamedJob>(mut self) -> Self {
        self.register::<J>();
        self
    }

    /// Register the benchmark jobs shipped with the crate.
    pub fn with_builtin_jobs(self) -> Self {
        super::builtin::register_builtin_jobs(self)
    }

    pub fn contains(&self, handler: &str) -> bool {
        self.decoders.contains_key(handler)
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.decoders.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Decode a payload document for `handler`.
    pub fn decode_value(&self, handler: &str, payload: &serde_json::Value) -> Result<Box<dyn Job>> {
        let decoder = self
            .decoders
            .get(handler)
            .ok_or_else(|| DeferredError::handler_not_found(handler))?;
        decoder(payload)
    }

    /// Materialize the job behind a reserved record.
    pub fn decode(&self, record: &JobRecord) -> Result<Box<dyn Job>> {
        self.decode_value(&record.handler, &record.payload)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobContext, JobResult};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    #[async_trait]
    impl Job for Greet {
        async fn perform(&self, _ctx: &JobContext) -> JobResult {
            Ok(())
        }

        fn queue_name(&self) -> Option<&str> {
            Some("greetings")
        }
    }

    impl NamedJob for Greet {
        const NAME: &'static str = "Greet";
    }

    #[test]
    fn test_decode_registered_handler() {
        let registry = HandlerRegistry::new().with::<Greet>();
        assert!(registry.contains("Greet"));

        let job = registry
            .decode_value("Greet", &serde_json::json!({"name": "ada"}))
            .unwrap();
        assert_eq!(job.queue_name(), Some("greetings"));
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::new();
        let err = registry
            .decode_value("Nope", &serde_json::json!({}))
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::HandlerNotFound);
    }

    #[test]
    fn test_malformed_payload() {
        let registry = HandlerRegistry::new().with::<Greet>();
        let err = registry
            .decode_value("Greet", &serde_json::json!({"nom": 1}))
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::DeserializationError);
    }
}
