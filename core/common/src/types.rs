//! Outbox data model shared by the store and the sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a queued mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier (e.g. one read back from storage).
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the remote record a mutation targets.
///
/// Numeric identifiers are kept in their decimal form so that `42` and `"42"`
/// address the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<i32> for RecordId {
    fn from(id: i32) -> Self {
        Self(id.to_string())
    }
}

/// Scheduling priority. Lower values are sent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const HIGH: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(5);
    pub const LOW: Priority = Priority(10);

    /// The more urgent of two priorities.
    pub fn most_urgent(self, other: Priority) -> Priority {
        self.min(other)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Kind of mutation applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Net effect of applying `self` and then `next` to the same record.
    ///
    /// Returns `None` when the two cancel out (a record created and deleted
    /// before the remote ever saw it).
    pub fn coalesce(self, next: SyncAction) -> Option<SyncAction> {
        match (self, next) {
            (Self::Create, Self::Delete) => None,
            (Self::Create, _) => Some(Self::Create),
            (Self::Delete, Self::Create) => Some(Self::Update),
            (_, next) => Some(next),
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown sync action: {}",
                other
            ))),
        }
    }
}

/// Lifecycle status of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be sent (possibly after a backoff delay).
    Pending,
    /// Claimed by the running sync pass.
    InFlight,
    /// Accepted by the remote. Terminal.
    Synced,
    /// Rejected or out of retries; needs a manual resync.
    Failed,
    /// Discarded in favour of the server version. Terminal.
    Conflicted,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::Conflicted => "conflicted",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            "conflicted" => Ok(Self::Conflicted),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown item status: {}",
                other
            ))),
        }
    }
}

/// Conflict policy applied when the remote reports a diverged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Resubmit the local payload unchanged.
    ClientWins,
    /// Drop the local mutation and surface the server version.
    ServerWins,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::ServerWins
    }
}

/// How a conflicted item was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Policy that produced this outcome.
    pub policy: ConflictPolicy,
    /// Record state reported by the remote, if it sent one.
    pub server_version: Option<serde_json::Value>,
    /// When the conflict was settled.
    pub resolved_at: DateTime<Utc>,
}

/// A mutation as submitted by application code, before it is queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub table: String,
    pub action: SyncAction,
    pub payload: serde_json::Value,
    pub record_id: Option<RecordId>,
    pub priority: Priority,
}

impl NewItem {
    pub fn new(table: impl Into<String>, action: SyncAction, payload: serde_json::Value) -> Self {
        Self {
            table: table.into(),
            action,
            payload,
            record_id: None,
            priority: Priority::default(),
        }
    }

    pub fn with_record_id(mut self, record_id: impl Into<RecordId>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// # Errors
    /// - Returns error if the table name is empty
    pub fn validate(&self) -> crate::Result<()> {
        if self.table.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "Table name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Materialize into a queued item with a fresh id.
    pub fn into_item(self, now: DateTime<Utc>) -> SyncItem {
        SyncItem {
            id: ItemId::generate(),
            table: self.table,
            action: self.action,
            payload: self.payload,
            record_id: self.record_id,
            priority: self.priority,
            status: ItemStatus::Pending,
            enqueued_at: now,
            last_attempt_at: None,
            next_attempt_at: None,
            retry_count: 0,
            last_error: None,
            resolution: None,
        }
    }
}

/// One pending or historical mutation in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    pub id: ItemId,
    pub table: String,
    pub action: SyncAction,
    pub payload: serde_json::Value,
    pub record_id: Option<RecordId>,
    pub priority: Priority,
    pub status: ItemStatus,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the item may be sent again after a failed attempt.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub resolution: Option<ConflictRecord>,
}

impl SyncItem {
    /// Whether the item can be picked up by a batch at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ItemStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Whether `other` describes a mutation on the same remote record.
    pub fn targets_same_record(&self, table: &str, record_id: Option<&RecordId>) -> bool {
        match (&self.record_id, record_id) {
            (Some(mine), Some(theirs)) => self.table == table && mine == theirs,
            _ => false,
        }
    }

    /// Fold a later mutation for the same record into this pending item.
    ///
    /// Returns `false` when the two mutations cancel out and the item should
    /// be removed instead.
    pub fn absorb(&mut self, next: &NewItem) -> bool {
        match self.action.coalesce(next.action) {
            Some(action) => {
                self.action = action;
                self.payload = next.payload.clone();
                self.priority = self.priority.most_urgent(next.priority);
                true
            }
            None => false,
        }
    }

    /// Fold an older unsettled item for the same record into this newer
    /// pending one.
    ///
    /// The action becomes the net effect of `older` followed by this item and
    /// the payload stays this item's. The older item's queue position, backoff
    /// deadline and spent retries carry over. Returns `false` when the two
    /// cancel out and both should be removed.
    pub fn absorb_older(&mut self, older: &SyncItem) -> bool {
        match older.action.coalesce(self.action) {
            Some(action) => {
                self.action = action;
                self.priority = self.priority.most_urgent(older.priority);
                self.enqueued_at = self.enqueued_at.min(older.enqueued_at);
                self.next_attempt_at = self.next_attempt_at.max(older.next_attempt_at);
                self.retry_count = self.retry_count.max(older.retry_count);
                if self.last_error.is_none() {
                    self.last_error = older.last_error.clone();
                }
                true
            }
            None => false,
        }
    }

    /// Selection order used by batch building: priority, then age, then id.
    pub fn selection_cmp(&self, other: &SyncItem) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.enqueued_at.cmp(&other.enqueued_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}
