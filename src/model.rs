//! Core data model.
//!
//! A status record is the persisted state of one job instance. Top-level
//! and child jobs share the same shape; mutation happens only through
//! ordered patches merged by [`StatusRecord::apply`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job Id
// ---------------------------------------------------------------------------

/// Newtype for job instance identifiers. Stable across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Full form — store keys are built from it
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created, waiting for a worker.
    Queued,
    /// Worker actively executing the body.
    Working,
    /// Done successfully. Terminal.
    Completed,
    /// Body raised an error. Terminal for the attempt; retry loops back
    /// to Queued.
    Failed,
    /// Cooperatively cancelled. Terminal.
    Killed,
}

impl Status {
    /// Is this terminal for the current attempt?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Killed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "queued",
            Status::Working => "working",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Killed => "killed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Status::Queued),
            "working" => Ok(Status::Working),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            "killed" => Ok(Status::Killed),
            _ => Err(crate::error::Error::Store(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status Record
// ---------------------------------------------------------------------------

/// The persisted status/progress state for one job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Unique identifier. Immutable, reused across retries.
    pub uuid: JobId,

    /// Reference (not ownership) to the parent record for child jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<JobId>,

    /// Display name of the job type. Immutable.
    pub name: String,

    /// Opaque job input, set at creation. Children carry their
    /// `parent_uuid` appended into this map.
    #[serde(default)]
    pub options: Map<String, Value>,

    /// Current lifecycle status.
    pub status: Status,

    /// Last-known human-readable status text.
    #[serde(default)]
    pub message: String,

    /// Progress counter. For a parent record: completed children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num: Option<u64>,

    /// Progress ceiling. For a parent record: fixed at fan-out time,
    /// never changed afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,

    /// Timestamp of the last update.
    pub time: DateTime<Utc>,

    /// Timestamp of the first transition to Working. Set once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Automatic re-enqueues performed so far.
    #[serde(default)]
    pub retry_num: u32,

    /// Extension fields attached by jobs (artifact locations and the
    /// like). Never validated, preserved across unrelated updates.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusRecord {
    /// A fresh record in Queued state.
    pub fn new(
        uuid: JobId,
        name: impl Into<String>,
        options: Map<String, Value>,
        parent_uuid: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid,
            parent_uuid,
            name: name.into(),
            options,
            status: Status::Queued,
            message: String::new(),
            num: None,
            total: None,
            time: now,
            started_at: None,
            retry_num: 0,
            extra: Map::new(),
        }
    }

    /// Percentage of progress, truncated. A completed record reports 100
    /// regardless of counters.
    pub fn pct_complete(&self) -> u32 {
        if self.status == Status::Completed {
            return 100;
        }
        match (self.num, self.total) {
            (Some(num), Some(total)) if total > 0 => {
                ((num as f64 / total as f64) * 100.0) as u32
            }
            _ => 0,
        }
    }

    /// Merge one patch into this record. Patches are applied left to
    /// right by callers; later values win on conflict. `started_at` is
    /// write-once and silently ignored after it has been set.
    pub fn apply(&mut self, patch: &Patch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(ref message) = patch.message {
            self.message = message.clone();
        }
        if let Some(num) = patch.num {
            self.num = Some(num);
        }
        if let Some(total) = patch.total {
            self.total = Some(total);
        }
        if let Some(started_at) = patch.started_at {
            if self.started_at.is_none() {
                self.started_at = Some(started_at);
            }
        }
        if let Some(retry_num) = patch.retry_num {
            self.retry_num = retry_num;
        }
        for (key, value) in &patch.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// A field-level partial update. The only way records mutate after
/// creation; "completed", "failed", "killed" are just status values
/// carried by a patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_num: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn progress(mut self, num: u64, total: u64) -> Self {
        self.num = Some(num);
        self.total = Some(total);
        self
    }

    pub fn num(mut self, num: u64) -> Self {
        self.num = Some(num);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn retry_num(mut self, n: u32) -> Self {
        self.retry_num = Some(n);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}
