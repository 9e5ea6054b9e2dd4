//! Status record persistence and indexing.
//!
//! Owns uuid generation, the TTL policy, the kill-list, and the listing
//! index. `update` is the one operation with a cross-call atomicity
//! guarantee — concurrent updates of the same uuid serialize through the
//! backend's compare-and-swap. Everything else is a single-key overwrite.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::kill::KillSwitch;
use crate::kv::Kv;
use crate::model::{JobId, Patch, Status, StatusRecord};

const STATUS_PREFIX: &str = "jobtrack:status:";
const INDEX_KEY: &str = "jobtrack:index";

// Index walk chunk for list/clear scans
const SCAN_CHUNK: usize = 100;

/// Exact-status and name-substring filtering for [`StatusStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<Status>,
    pub name_contains: Option<String>,
}

impl ListFilter {
    fn matches(&self, record: &StatusRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(ref needle) = self.name_contains {
            if !record.name.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Page-based pagination, 1-indexed.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub number: usize,
    pub per_page: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            number: 1,
            per_page: 25,
        }
    }
}

/// Persistence and indexing of status records in the shared store.
pub struct StatusStore {
    kv: Arc<dyn Kv>,
    ttl: Duration,
    kill: KillSwitch,
}

impl StatusStore {
    pub fn new(kv: Arc<dyn Kv>, ttl: Duration) -> Self {
        let kill = KillSwitch::new(kv.clone(), ttl);
        Self { kv, ttl, kill }
    }

    /// Produce a globally unique identifier for a new job instance.
    pub fn generate_uuid(&self) -> JobId {
        JobId::new()
    }

    fn key(uuid: &JobId) -> String {
        format!("{STATUS_PREFIX}{uuid}")
    }

    /// Write a fresh Queued record.
    pub async fn create(
        &self,
        uuid: &JobId,
        name: &str,
        options: Map<String, Value>,
        parent_uuid: Option<JobId>,
    ) -> Result<StatusRecord> {
        let record = StatusRecord::new(*uuid, name, options, parent_uuid, Utc::now());
        self.write(&record).await?;
        debug!(id = %uuid, name, "status record created");
        Ok(record)
    }

    /// Current merged record, or None for unknown/expired uuids.
    pub async fn get(&self, uuid: &JobId) -> Result<Option<StatusRecord>> {
        match self.kv.get(&Self::key(uuid)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but absent records are an error.
    pub async fn fetch(&self, uuid: &JobId) -> Result<StatusRecord> {
        self.get(uuid)
            .await?
            .ok_or_else(|| Error::NotFound(uuid.to_string()))
    }

    /// Merge patches into the current record, left to right, and write
    /// the result. Refreshes the TTL countdown and the listing index.
    pub async fn set(&self, uuid: &JobId, patches: &[Patch]) -> Result<StatusRecord> {
        let mut record = self.fetch(uuid).await?;
        for patch in patches {
            record.apply(patch);
        }
        record.time = Utc::now();
        self.write(&record).await?;
        Ok(record)
    }

    /// Read-transform-write, atomic with respect to concurrent `update`
    /// calls on the same uuid. Lost increments here would break fan-in,
    /// so the write goes through compare-and-swap and retries until it
    /// lands on an unchanged snapshot.
    pub async fn update<F>(&self, uuid: &JobId, mutate: F) -> Result<StatusRecord>
    where
        F: Fn(&mut StatusRecord),
    {
        let key = Self::key(uuid);
        loop {
            let old = self
                .kv
                .get(&key)
                .await?
                .ok_or_else(|| Error::NotFound(uuid.to_string()))?;
            let mut record: StatusRecord = serde_json::from_slice(&old)?;
            mutate(&mut record);
            record.time = Utc::now();
            let new = serde_json::to_vec(&record)?;
            if self
                .kv
                .compare_and_swap(&key, Some(old.as_slice()), &new, Some(self.ttl))
                .await?
            {
                self.touch_index(uuid, &record).await?;
                return Ok(record);
            }
            debug!(id = %uuid, "concurrent update, retrying");
        }
    }

    /// Delete the record and its index entry, and drop any pending kill
    /// flag for the uuid.
    pub async fn remove(&self, uuid: &JobId) -> Result<()> {
        self.kv.delete(&Self::key(uuid)).await?;
        self.kv.index_remove(INDEX_KEY, &uuid.to_string()).await?;
        self.kill.clear(uuid).await?;
        debug!(id = %uuid, "status record removed");
        Ok(())
    }

    /// Non-expired records, most-recent-first, filtered and paginated.
    pub async fn list(&self, filter: &ListFilter, page: Page) -> Result<Vec<StatusRecord>> {
        let mut matched = Vec::new();
        let mut stale = Vec::new();
        let mut offset = 0;
        loop {
            let members = self.kv.index_range(INDEX_KEY, offset, SCAN_CHUNK).await?;
            if members.is_empty() {
                break;
            }
            offset += members.len();
            for member in members {
                let uuid: JobId = member
                    .parse()
                    .map_err(|_| Error::Store(format!("bad index member: {member}")))?;
                match self.get(&uuid).await? {
                    Some(record) if filter.matches(&record) => matched.push(record),
                    Some(_) => {}
                    // Record expired out from under the index
                    None => stale.push(member),
                }
            }
        }
        for member in stale {
            self.kv.index_remove(INDEX_KEY, &member).await?;
        }
        let start = page.number.saturating_sub(1) * page.per_page;
        Ok(matched.into_iter().skip(start).take(page.per_page).collect())
    }

    /// Request cancellation. Idempotent; a no-op for unknown uuids and
    /// for records already in a terminal state.
    pub async fn kill(&self, uuid: &JobId) -> Result<()> {
        match self.get(uuid).await? {
            Some(record) if !record.status.is_terminal() => self.kill.mark(uuid).await,
            Some(_) => {
                debug!(id = %uuid, "kill ignored, already finished");
                Ok(())
            }
            None => {
                debug!(id = %uuid, "kill ignored, no such record");
                Ok(())
            }
        }
    }

    /// Is this uuid flagged for cancellation?
    pub async fn should_kill(&self, uuid: &JobId) -> Result<bool> {
        self.kill.is_marked(uuid).await
    }

    /// Drop a pending cancellation flag.
    pub async fn clear_kill(&self, uuid: &JobId) -> Result<()> {
        self.kill.clear(uuid).await
    }

    /// Remove every record.
    pub async fn clear_all(&self) -> Result<usize> {
        self.clear_where(|_| true).await
    }

    /// Remove completed records only.
    pub async fn clear_completed(&self) -> Result<usize> {
        self.clear_where(|r| r.status == Status::Completed).await
    }

    /// Remove failed records only.
    pub async fn clear_failed(&self) -> Result<usize> {
        self.clear_where(|r| r.status == Status::Failed).await
    }

    async fn clear_where(&self, should_clear: impl Fn(&StatusRecord) -> bool) -> Result<usize> {
        let mut victims = Vec::new();
        let mut offset = 0;
        loop {
            let members = self.kv.index_range(INDEX_KEY, offset, SCAN_CHUNK).await?;
            if members.is_empty() {
                break;
            }
            offset += members.len();
            for member in members {
                let uuid: JobId = member
                    .parse()
                    .map_err(|_| Error::Store(format!("bad index member: {member}")))?;
                match self.get(&uuid).await? {
                    Some(record) if should_clear(&record) => victims.push(uuid),
                    Some(_) => {}
                    // Dangling index entry, clean it up along the way
                    None => victims.push(uuid),
                }
            }
        }
        let cleared = victims.len();
        for uuid in victims {
            self.remove(&uuid).await?;
        }
        info!(cleared, "records cleared");
        Ok(cleared)
    }

    async fn write(&self, record: &StatusRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.kv
            .set(&Self::key(&record.uuid), bytes, Some(self.ttl))
            .await?;
        self.touch_index(&record.uuid, record).await
    }

    async fn touch_index(&self, uuid: &JobId, record: &StatusRecord) -> Result<()> {
        if let Err(e) = self
            .kv
            .index_put(
                INDEX_KEY,
                &uuid.to_string(),
                record.time.timestamp_millis(),
                Some(self.ttl),
            )
            .await
        {
            // Listing degrades; the record itself is already written
            warn!(id = %uuid, "index update failed: {e}");
        }
        Ok(())
    }
}
