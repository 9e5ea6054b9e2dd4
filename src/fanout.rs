//! Fan-out/fan-in coordination.
//!
//! `init_parent` fixes `total` on the parent before any child is
//! enqueued, so the fan-in compare can never fire early. The increment
//! in `report_child_done` rides the store's atomic update: the one
//! caller whose write carries `num` up to `total` finalizes the parent;
//! every other caller sees `num < total` and does nothing further.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::engine::Context;
use crate::error::{Error, Result};
use crate::job::{Dispatcher, Registry};
use crate::model::{JobId, Patch, Status, StatusRecord};
use crate::store::StatusStore;

/// Options key under which children carry their parent reference.
pub const PARENT_UUID_KEY: &str = "parent_uuid";

/// Parent/child registration and the fan-in completion protocol.
#[derive(Clone)]
pub struct FanCoordinator {
    store: Arc<StatusStore>,
    registry: Arc<Registry>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl FanCoordinator {
    pub fn new(
        store: Arc<StatusStore>,
        registry: Arc<Registry>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
        }
    }

    /// Fix the child count on the parent record. Must run before any
    /// child is enqueued: children may finish at any moment after, and
    /// the fan-in compare is only sound once `total` is known.
    pub async fn init_parent(&self, parent: &JobId, total: u64) -> Result<StatusRecord> {
        info!(id = %parent, total, "fan-out initialized");
        self.store
            .set(parent, &[Patch::new().progress(0, total)])
            .await
    }

    /// Create and submit one child of an initialized parent. The child
    /// shares the parent's job type and carries the parent reference in
    /// its own options.
    pub async fn enqueue_child(
        &self,
        parent: &JobId,
        options: Map<String, Value>,
    ) -> Result<Option<JobId>> {
        let parent_record = self.store.fetch(parent).await?;
        if parent_record.total.is_none() {
            return Err(Error::FanNotInitialized(parent.to_string()));
        }

        let uuid = self.store.generate_uuid();
        let mut options = options;
        options.insert(
            PARENT_UUID_KEY.to_string(),
            Value::String(parent.to_string()),
        );
        self.store
            .create(&uuid, &parent_record.name, options.clone(), Some(*parent))
            .await?;

        if self
            .dispatcher
            .enqueue(&parent_record.name, &uuid, &options)
            .await?
        {
            info!(parent = %parent, child = %uuid, "child enqueued");
            Ok(Some(uuid))
        } else {
            self.store.remove(&uuid).await?;
            warn!(parent = %parent, "dispatcher rejected child enqueue, record removed");
            Ok(None)
        }
    }

    /// Count one finished child against the parent. `success` decides
    /// whether the child's own record is removed (bounding storage) or
    /// retained for diagnosis.
    pub async fn report_child_done(
        &self,
        parent: &JobId,
        child: &JobId,
        success: bool,
    ) -> Result<()> {
        if success {
            self.store.remove(child).await?;
        }

        let updated = self
            .store
            .update(parent, |record| {
                record.num = Some(record.num.unwrap_or(0) + 1);
            })
            .await?;

        let num = updated.num.unwrap_or(0);
        let total = updated.total.unwrap_or(0);
        info!(parent = %parent, child = %child, num, total, success, "child reported");

        if total > 0 && num == total {
            // This call observed the last child complete
            self.finalize(&updated).await?;
        }
        Ok(())
    }

    /// Runs exactly once per fan-out, by whichever reporter saw the last
    /// child complete.
    async fn finalize(&self, parent: &StatusRecord) -> Result<()> {
        let registration = self.registry.get(&parent.name)?;
        let ctx = Context::for_record(parent, Arc::clone(&self.store), self.clone());

        if self.store.should_kill(&parent.uuid).await? {
            self.store
                .set(&parent.uuid, &[Patch::new().status(Status::Killed)])
                .await?;
            self.store.clear_kill(&parent.uuid).await?;
            registration.job.on_killed(&ctx).await;
            info!(id = %parent.uuid, "parent killed");
            return Ok(());
        }

        self.store
            .set(
                &parent.uuid,
                &[Patch::new().status(Status::Completed).message("")],
            )
            .await?;
        if let Err(e) = registration.job.on_success(&ctx).await {
            error!(id = %parent.uuid, "success hook failed: {e}");
            self.store
                .set(
                    &parent.uuid,
                    &[Patch::new()
                        .status(Status::Failed)
                        .message(format!("success hook failed: {e}"))],
                )
                .await?;
            return Err(Error::Coordination(e.to_string()));
        }
        info!(id = %parent.uuid, "parent completed");
        Ok(())
    }
}
