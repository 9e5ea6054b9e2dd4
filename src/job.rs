//! Job type capability and registration.
//!
//! A job type implements [`Job`]: a top-level entry point, a child entry
//! point for fan-out work, and optional hooks. Retry ceilings are
//! per-type configuration supplied at registration, not process-wide
//! state. The [`Dispatcher`] trait is the seam to the external
//! queue/dispatch engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::engine::Context;
use crate::error::{Error, Result};
use crate::model::JobId;

/// A job type. The engine drives the entry points; hooks have no-op
/// defaults.
#[async_trait]
pub trait Job: Send + Sync {
    /// Top-level entry point.
    async fn perform(&self, ctx: &Context) -> Result<()>;

    /// Entry point when running as a child of a fan-out parent.
    /// Defaults to the top-level body.
    async fn perform_child(&self, ctx: &Context) -> Result<()> {
        self.perform(ctx).await
    }

    /// Runs after the job (or the last child of a fan-out parent)
    /// completes.
    async fn on_success(&self, ctx: &Context) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Runs when the body fails. Return true when the failure is handled
    /// here; the default (false) lets the error propagate outward so the
    /// dispatcher's own failure handling also observes it.
    async fn on_failure(&self, ctx: &Context, error: &Error) -> bool {
        let _ = (ctx, error);
        false
    }

    /// Runs after a kill has been observed and recorded.
    async fn on_killed(&self, ctx: &Context) {
        let _ = ctx;
    }
}

/// Per-type configuration supplied at registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobConfig {
    /// Automatic re-enqueue ceiling for a failing top-level job.
    pub retry_limit: u32,
    /// Automatic re-enqueue ceiling for a failing child job.
    pub child_retry_limit: u32,
}

/// A registered job type with its configuration.
pub struct Registration {
    pub job: Arc<dyn Job>,
    pub config: JobConfig,
}

/// Registry of job types, indexed by name.
#[derive(Default)]
pub struct Registry {
    jobs: HashMap<String, Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, job: Arc<dyn Job>, config: JobConfig) {
        self.jobs.insert(name.into(), Registration { job, config });
    }

    /// Look up a job type by name.
    pub fn get(&self, name: &str) -> Result<&Registration> {
        self.jobs
            .get(name)
            .ok_or_else(|| Error::UnknownJob(name.to_string()))
    }
}

/// The external queue/dispatch engine, as this core consumes it.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Submit work. Returns false when the enqueue is rejected (a
    /// pre-enqueue veto, say); the caller is responsible for removing
    /// the record it created alongside.
    async fn enqueue(&self, name: &str, uuid: &JobId, options: &Map<String, Value>)
    -> Result<bool>;

    /// Cancel a not-yet-started enqueue.
    async fn dequeue(&self, name: &str, uuid: &JobId) -> Result<()>;
}
