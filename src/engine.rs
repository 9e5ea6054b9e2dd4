//! Lifecycle engine. The entry point the dispatcher invokes when a
//! worker picks up a job.
//!
//! Drives one job instance through the status state machine: Queued →
//! Working → {Completed | Failed | Killed}, with Failed looping back to
//! Queued under the retry policy. Wraps the job body with the working
//! transition, kill polling (through [`Context`] progress calls),
//! failure capture, and fan-in bookkeeping for children.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::fanout::FanCoordinator;
use crate::job::{Dispatcher, Registration, Registry};
use crate::model::{JobId, Patch, Status, StatusRecord};
use crate::retry::RetryPolicy;
use crate::store::StatusStore;

/// Handed to the job body. The only way a body reports progress, and
/// therefore the only place cancellation is observed.
pub struct Context {
    uuid: JobId,
    parent_uuid: Option<JobId>,
    name: String,
    options: Map<String, Value>,
    store: Arc<StatusStore>,
    fan: FanCoordinator,
    // Whether this body called init_parent. A fan-out parent's record
    // stays Working after the body returns; the last child completes it.
    fanned_out: AtomicBool,
}

impl Context {
    pub(crate) fn for_record(
        record: &StatusRecord,
        store: Arc<StatusStore>,
        fan: FanCoordinator,
    ) -> Self {
        Self {
            uuid: record.uuid,
            parent_uuid: record.parent_uuid,
            name: record.name.clone(),
            options: record.options.clone(),
            store,
            fan,
            fanned_out: AtomicBool::new(false),
        }
    }

    pub(crate) fn fanned_out(&self) -> bool {
        self.fanned_out.load(Ordering::SeqCst)
    }

    pub fn uuid(&self) -> &JobId {
        &self.uuid
    }

    pub fn parent_uuid(&self) -> Option<JobId> {
        self.parent_uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The job input this instance was created with.
    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    // Children watch their own flag and the parent's.
    async fn poll_kill(&self) -> Result<()> {
        if self.store.should_kill(&self.uuid).await? {
            return Err(Error::Killed);
        }
        if let Some(parent) = self.parent_uuid {
            if self.store.should_kill(&parent).await? {
                return Err(Error::Killed);
            }
        }
        Ok(())
    }

    /// Progress heartbeat without counters. A kill poll point.
    pub async fn tick(&self, message: impl Into<String>) -> Result<()> {
        self.poll_kill().await?;
        self.store
            .set(
                &self.uuid,
                &[Patch::new().status(Status::Working).message(message)],
            )
            .await?;
        Ok(())
    }

    /// Progress report with counters. A kill poll point. A non-positive
    /// `total` is caller-side misuse: the call errors and the record is
    /// left exactly as it was.
    pub async fn at(&self, num: i64, total: i64, message: impl Into<String>) -> Result<()> {
        if total <= 0 {
            return Err(Error::InvalidProgress(total));
        }
        self.poll_kill().await?;
        self.store
            .set(
                &self.uuid,
                &[Patch::new()
                    .status(Status::Working)
                    .message(message)
                    .progress(num.max(0) as u64, total as u64)],
            )
            .await?;
        Ok(())
    }

    /// Mark this instance completed.
    pub async fn completed(&self) -> Result<()> {
        self.store
            .set(
                &self.uuid,
                &[Patch::new().status(Status::Completed).message("")],
            )
            .await?;
        Ok(())
    }

    /// Record a failure without raising. The engine runs the failure
    /// path once the body returns.
    pub async fn failed(&self, message: impl Into<String>) -> Result<()> {
        self.store
            .set(
                &self.uuid,
                &[Patch::new().status(Status::Failed).message(message)],
            )
            .await?;
        Ok(())
    }

    /// Attach extension fields (artifact locations and the like).
    pub async fn set(&self, patch: Patch) -> Result<StatusRecord> {
        self.store.set(&self.uuid, &[patch]).await
    }

    /// Snapshot of the current record.
    pub async fn record(&self) -> Result<StatusRecord> {
        self.store.fetch(&self.uuid).await
    }

    /// Fan-out: fix the child count. Must precede every `enqueue_child`.
    pub async fn init_parent(&self, total: u64) -> Result<()> {
        self.fan.init_parent(&self.uuid, total).await?;
        self.fanned_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Fan-out: create and submit one child of this job.
    pub async fn enqueue_child(&self, options: Map<String, Value>) -> Result<Option<JobId>> {
        self.fan.enqueue_child(&self.uuid, options).await
    }
}

/// Drives job instances through the lifecycle state machine.
pub struct Engine {
    store: Arc<StatusStore>,
    registry: Arc<Registry>,
    dispatcher: Arc<dyn Dispatcher>,
    fan: FanCoordinator,
}

impl Engine {
    pub fn new(
        store: Arc<StatusStore>,
        registry: Arc<Registry>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let fan = FanCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
        );
        Self {
            store,
            registry,
            dispatcher,
            fan,
        }
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    pub fn fan(&self) -> &FanCoordinator {
        &self.fan
    }

    /// Create a record and submit it to the dispatcher. Returns None
    /// when the dispatcher rejects the enqueue; the record is rolled
    /// back so nothing dangles.
    pub async fn enqueue(
        &self,
        name: &str,
        options: Map<String, Value>,
    ) -> Result<Option<JobId>> {
        self.registry.get(name)?;
        let uuid = self.store.generate_uuid();
        self.store.create(&uuid, name, options.clone(), None).await?;
        if self.dispatcher.enqueue(name, &uuid, &options).await? {
            info!(id = %uuid, name, "job enqueued");
            Ok(Some(uuid))
        } else {
            self.store.remove(&uuid).await?;
            warn!(name, "dispatcher rejected enqueue, record removed");
            Ok(None)
        }
    }

    /// Cancel a not-yet-started enqueue and drop its record.
    pub async fn dequeue(&self, name: &str, uuid: &JobId) -> Result<()> {
        self.dispatcher.dequeue(name, uuid).await?;
        self.store.remove(uuid).await
    }

    /// Entry point invoked by the dispatcher with the descriptor it
    /// carried. Runs the job body and persists the terminal state.
    pub async fn run(&self, name: &str, uuid: &JobId) -> Result<()> {
        let registration = self.registry.get(name)?;
        let record = self.store.fetch(uuid).await?;
        if record.status.is_terminal() {
            // Stale redelivery of a finished attempt
            warn!(id = %uuid, status = %record.status, "ignoring run of terminal record");
            return Ok(());
        }
        let ctx = Context::for_record(&record, Arc::clone(&self.store), self.fan.clone());
        match record.parent_uuid {
            Some(parent) => self.run_child(registration, &ctx, &parent).await,
            None => self.run_top(registration, &ctx).await,
        }
    }

    async fn run_top(&self, registration: &Registration, ctx: &Context) -> Result<()> {
        self.begin(ctx).await?;
        match registration.job.perform(ctx).await {
            Ok(()) => self.finish_ok(registration, ctx).await,
            Err(Error::Killed) => self.finish_killed(registration, ctx).await,
            Err(e) => self.fail_path(registration, ctx, e, true).await,
        }
    }

    async fn run_child(
        &self,
        registration: &Registration,
        ctx: &Context,
        parent: &JobId,
    ) -> Result<()> {
        if self.store.should_kill(parent).await? {
            // Parent killed before this child started: skip the body and
            // still count it, so the fan-in converges.
            info!(id = %ctx.uuid(), parent = %parent, "parent killed, skipping child");
            return self.fan.report_child_done(parent, ctx.uuid(), true).await;
        }
        self.begin(ctx).await?;
        match registration.job.perform_child(ctx).await {
            Ok(()) => self.finish_ok(registration, ctx).await,
            Err(Error::Killed) => {
                self.finish_killed(registration, ctx).await?;
                // A killed child still counts toward fan-in, but its
                // record stays behind for inspection.
                self.fan.report_child_done(parent, ctx.uuid(), false).await
            }
            Err(e) => self.fail_path(registration, ctx, e, true).await,
        }
    }

    /// Working transition; `started_at` stamps only on the first attempt.
    async fn begin(&self, ctx: &Context) -> Result<()> {
        self.store
            .set(
                ctx.uuid(),
                &[Patch::new().status(Status::Working).started_at(Utc::now())],
            )
            .await?;
        info!(id = %ctx.uuid(), name = ctx.name(), "job started");
        Ok(())
    }

    /// Normal return from the body. The body may have completed itself,
    /// recorded its own failure, or just returned with the record still
    /// working.
    async fn finish_ok(&self, registration: &Registration, ctx: &Context) -> Result<()> {
        let record = self.store.fetch(ctx.uuid()).await?;
        if record.status == Status::Failed {
            // Failure path, but nothing re-raised from this step
            let err = Error::Execution(record.message.clone());
            return self.fail_path(registration, ctx, err, false).await;
        }
        if ctx.parent_uuid().is_none() && ctx.fanned_out() {
            // The record stays Working; whichever reporter observes the
            // last child complete will finalize it.
            info!(id = %ctx.uuid(), "fan-out parent, completion deferred to children");
            return Ok(());
        }
        if record.status == Status::Working {
            // Body never completed itself
            self.store
                .set(
                    ctx.uuid(),
                    &[Patch::new().status(Status::Completed).message("")],
                )
                .await?;
        }
        match ctx.parent_uuid() {
            Some(parent) => {
                self.fan
                    .report_child_done(&parent, ctx.uuid(), true)
                    .await
            }
            None => {
                registration.job.on_success(ctx).await?;
                info!(id = %ctx.uuid(), "job completed");
                Ok(())
            }
        }
    }

    async fn finish_killed(&self, registration: &Registration, ctx: &Context) -> Result<()> {
        self.store
            .set(ctx.uuid(), &[Patch::new().status(Status::Killed)])
            .await?;
        self.store.clear_kill(ctx.uuid()).await?;
        registration.job.on_killed(ctx).await;
        info!(id = %ctx.uuid(), "job killed");
        Ok(())
    }

    /// Record the failure, give the type's hook a chance to handle it,
    /// then apply the retry policy. `raise` is false when the body
    /// recorded the failure itself instead of returning an error.
    async fn fail_path(
        &self,
        registration: &Registration,
        ctx: &Context,
        error: Error,
        raise: bool,
    ) -> Result<()> {
        let mut record = self.store.fetch(ctx.uuid()).await?;
        if record.status != Status::Failed {
            record = self
                .store
                .set(
                    ctx.uuid(),
                    &[Patch::new()
                        .status(Status::Failed)
                        .message(error.to_string())],
                )
                .await?;
        }
        error!(id = %ctx.uuid(), %error, "job failed");

        let handled = registration.job.on_failure(ctx, &error).await;
        let child = ctx.parent_uuid().is_some();
        RetryPolicy::apply(
            &self.store,
            &self.dispatcher,
            &record,
            &registration.config,
            child,
        )
        .await?;

        if handled || !raise {
            Ok(())
        } else {
            Err(error)
        }
    }
}
