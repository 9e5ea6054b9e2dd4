//! Bounded retry of failing job instances.
//!
//! Only the single failing instance is re-enqueued — the same uuid, the
//! original options — so finished siblings keep their contributions to
//! a parent's fan-in count.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::job::{Dispatcher, JobConfig};
use crate::model::{Patch, Status, StatusRecord};
use crate::store::StatusStore;

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue as attempt number `attempt`.
    Requeue { attempt: u32 },
    /// Ceiling reached; the failure stands as final.
    Exhausted,
}

pub struct RetryPolicy;

impl RetryPolicy {
    /// Compare the record's retry count against the applicable ceiling.
    pub fn decide(record: &StatusRecord, config: &JobConfig, child: bool) -> RetryDecision {
        let ceiling = if child {
            config.child_retry_limit
        } else {
            config.retry_limit
        };
        if record.retry_num >= ceiling {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Requeue {
                attempt: record.retry_num + 1,
            }
        }
    }

    /// Apply the policy to a just-failed record: either leave the
    /// failure standing, or loop the record back to Queued and request a
    /// re-enqueue through the dispatcher. Returns whether a retry was
    /// submitted.
    pub async fn apply(
        store: &StatusStore,
        dispatcher: &Arc<dyn Dispatcher>,
        record: &StatusRecord,
        config: &JobConfig,
        child: bool,
    ) -> Result<bool> {
        match Self::decide(record, config, child) {
            RetryDecision::Exhausted => {
                info!(id = %record.uuid, retries = record.retry_num, "retries exhausted");
                Ok(false)
            }
            RetryDecision::Requeue { attempt } => {
                store
                    .set(
                        &record.uuid,
                        &[Patch::new().status(Status::Queued).retry_num(attempt)],
                    )
                    .await?;
                let accepted = dispatcher
                    .enqueue(&record.name, &record.uuid, &record.options)
                    .await?;
                if !accepted {
                    // Nothing will run it; put the failure back
                    warn!(id = %record.uuid, "dispatcher rejected retry enqueue");
                    store
                        .set(&record.uuid, &[Patch::new().status(Status::Failed)])
                        .await?;
                    return Ok(false);
                }
                info!(id = %record.uuid, attempt, "retry enqueued");
                Ok(true)
            }
        }
    }
}
