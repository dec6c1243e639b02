//! Conflict resolution.

use serde::{Deserialize, Serialize};

use tideline_common::{ConflictPolicy, SyncItem};

use crate::transport::ServerOutcome;

/// What the engine should do with an item after the remote answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    /// Mark synced.
    Synced,
    /// Resubmit later through the retry coordinator.
    Retry { reason: String },
    /// Drop the local mutation and surface the server version.
    Conflicted {
        server_version: Option<serde_json::Value>,
    },
    /// Mark failed without retrying.
    Reject { reason: String },
}

/// Pure decision function from a server outcome to a resolution.
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    /// Create a new conflict resolver with the given policy.
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// Get the active policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Decide how to settle `item` given what the remote reported.
    ///
    /// Invalid rejections are never retried, whatever the policy.
    pub fn resolve(&self, item: &SyncItem, outcome: &ServerOutcome) -> Resolution {
        match outcome {
            ServerOutcome::Accepted => Resolution::Synced,
            ServerOutcome::RejectedInvalid { reason } => Resolution::Reject {
                reason: reason.clone(),
            },
            ServerOutcome::Transient { reason } => Resolution::Retry {
                reason: reason.clone(),
            },
            ServerOutcome::RejectedConflict { server_version } => match self.policy {
                ConflictPolicy::ClientWins => Resolution::Retry {
                    reason: format!("Conflict on {} {}, resubmitting local version", item.table, item.action),
                },
                ConflictPolicy::ServerWins => Resolution::Conflicted {
                    server_version: server_version.clone(),
                },
            },
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tideline_common::{NewItem, SyncAction};

    fn item() -> SyncItem {
        NewItem::new("todos", SyncAction::Update, json!({ "done": true }))
            .with_record_id(9)
            .into_item(Utc::now())
    }

    fn conflict() -> ServerOutcome {
        ServerOutcome::RejectedConflict {
            server_version: Some(json!({ "done": false, "rev": 12 })),
        }
    }

    #[test]
    fn test_server_wins_surfaces_server_version() {
        let resolver = ConflictResolver::new(ConflictPolicy::ServerWins);
        assert_eq!(
            resolver.resolve(&item(), &conflict()),
            Resolution::Conflicted {
                server_version: Some(json!({ "done": false, "rev": 12 }))
            }
        );
    }

    #[test]
    fn test_client_wins_resubmits() {
        let resolver = ConflictResolver::new(ConflictPolicy::ClientWins);
        assert!(matches!(
            resolver.resolve(&item(), &conflict()),
            Resolution::Retry { .. }
        ));
    }

    #[test]
    fn test_invalid_is_rejected_under_every_policy() {
        let invalid = ServerOutcome::RejectedInvalid {
            reason: "title too long".to_string(),
        };
        for policy in [ConflictPolicy::ClientWins, ConflictPolicy::ServerWins] {
            let resolution = ConflictResolver::new(policy).resolve(&item(), &invalid);
            assert_eq!(
                resolution,
                Resolution::Reject {
                    reason: "title too long".to_string()
                }
            );
        }
    }

    #[test]
    fn test_accepted_and_transient() {
        let resolver = ConflictResolver::default();
        assert_eq!(resolver.resolve(&item(), &ServerOutcome::Accepted), Resolution::Synced);
        assert_eq!(
            resolver.resolve(
                &item(),
                &ServerOutcome::Transient {
                    reason: "503".to_string()
                }
            ),
            Resolution::Retry {
                reason: "503".to_string()
            }
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let local = item();
        for policy in [ConflictPolicy::ClientWins, ConflictPolicy::ServerWins] {
            let resolver = ConflictResolver::new(policy);
            let first = resolver.resolve(&local, &conflict());
            for _ in 0..10 {
                assert_eq!(resolver.resolve(&local, &conflict()), first);
            }
        }
    }
}
