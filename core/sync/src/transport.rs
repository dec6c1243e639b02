//! Remote transport boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tideline_common::{ItemId, Result, SyncItem};

/// What the remote did with one item of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ServerOutcome {
    /// Applied.
    Accepted,
    /// The remote record diverged from what the mutation assumed.
    RejectedConflict {
        server_version: Option<serde_json::Value>,
    },
    /// Malformed or refused by business rules. Retrying cannot help.
    RejectedInvalid { reason: String },
    /// Per-item transient failure (timeout, 5xx) while the batch itself went through.
    Transient { reason: String },
}

/// Outcome for one item, matched back to the batch by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerItemOutcome {
    pub item_id: ItemId,
    #[serde(flatten)]
    pub outcome: ServerOutcome,
}

impl PerItemOutcome {
    pub fn new(item_id: ItemId, outcome: ServerOutcome) -> Self {
        Self { item_id, outcome }
    }

    pub fn accepted(item_id: ItemId) -> Self {
        Self::new(item_id, ServerOutcome::Accepted)
    }
}

/// Sends a batch of mutations to the remote source of truth.
///
/// The engine does not care about the wire protocol; REST, RPC or anything
/// else can sit behind this trait.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// Transmit `items` in order and report one outcome per item.
    ///
    /// # Errors
    /// - The endpoint could not be reached at all. Every item in the batch is
    ///   then treated as a transient failure.
    async fn transmit_batch(&self, items: &[SyncItem]) -> Result<Vec<PerItemOutcome>>;
}
