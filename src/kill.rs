//! Cooperative cancellation flags.
//!
//! Marking is observed, not pushed: a running job sees its mark only at
//! progress poll points, so cancellation can be arbitrarily delayed if
//! the body never reports progress. Marking a uuid that is not
//! executing has no effect beyond set membership.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::Result;
use crate::kv::Kv;
use crate::model::JobId;

const KILL_SET: &str = "jobtrack:kill";

/// The set of uuids pending cancellation.
pub struct KillSwitch {
    kv: Arc<dyn Kv>,
    ttl: Duration,
}

impl KillSwitch {
    pub fn new(kv: Arc<dyn Kv>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Flag a uuid for cancellation. Idempotent.
    pub async fn mark(&self, uuid: &JobId) -> Result<()> {
        self.kv
            .set_add(KILL_SET, &uuid.to_string(), Some(self.ttl))
            .await?;
        info!(id = %uuid, "kill requested");
        Ok(())
    }

    /// Has this uuid been flagged?
    pub async fn is_marked(&self, uuid: &JobId) -> Result<bool> {
        self.kv.set_contains(KILL_SET, &uuid.to_string()).await
    }

    /// Drop the flag, typically after the kill has been observed.
    pub async fn clear(&self, uuid: &JobId) -> Result<()> {
        self.kv.set_remove(KILL_SET, &uuid.to_string()).await
    }
}
