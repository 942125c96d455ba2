//! Fabric Client Contract
//!
//! The session to the fabric controller is an explicit handle so that
//! test doubles and several fabrics can coexist.

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::model::{GroupId, RelationKey, ScopeId, ScopeSnapshot};
use crate::reconciler::Delta;
use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Object touched by a change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum ChangedObject {
    Subnet { group: GroupId, prefix: IpNet },
    OutsideGroup { group: GroupId },
    InsideGroup { group: GroupId },
    Relation { group: GroupId, relation: RelationKey },
    Contract { tenant: String, name: String },
    ContractInterface { tenant: String, name: String },
}

/// Change notification from the subscription feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricEvent {
    /// Feed partition; sequence numbers are monotonic per partition
    pub partition: String,
    pub sequence: u64,
    pub object: ChangedObject,
}

/// Result of one pushed change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ItemOutcome {
    Applied,
    /// Current fabric state differs from the snapshot the change was computed from
    Conflict(String),
    Failed(String),
}

/// Per-item results of a push, in delta order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    pub outcomes: Vec<ItemOutcome>,
}

impl PushReport {
    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, ItemOutcome::Applied)).count()
    }

    pub fn conflicts(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, ItemOutcome::Conflict(_))).count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, ItemOutcome::Failed(_))).count()
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| matches!(o, ItemOutcome::Applied))
    }
}

/// Fabric controller session used by the engine
#[async_trait]
pub trait FabricClient: Send + Sync {
    /// Deep snapshot of one routed-network boundary
    async fn deep_fetch(&self, scope: &ScopeId) -> Result<ScopeSnapshot>;

    /// Apply a delta; each change is applied atomically on its own
    async fn push(&self, delta: &Delta) -> Result<PushReport>;

    /// Open the change-notification feed
    async fn subscribe(&self) -> Result<mpsc::Receiver<FabricEvent>>;

    /// New endpoint/credentials from an ingested configuration
    fn update_connection(&self, _connection: &ConnectionConfig) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_report_counts() {
        let report = PushReport {
            outcomes: vec![
                ItemOutcome::Applied,
                ItemOutcome::Conflict("tag changed".into()),
                ItemOutcome::Failed("timeout".into()),
                ItemOutcome::Applied,
            ],
        };
        assert_eq!(report.applied(), 2);
        assert_eq!(report.conflicts(), 1);
        assert_eq!(report.failures(), 1);
        assert!(!report.is_clean());
        assert!(PushReport::default().is_clean());
    }

    #[test]
    fn test_event_wire_shape() {
        let event = FabricEvent {
            partition: "t1".into(),
            sequence: 7,
            object: ChangedObject::Subnet {
                group: GroupId::outside("t1", "out1", "child"),
                prefix: "5.2.0.0/16".parse().unwrap(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["object"]["object"], "subnet");
        assert_eq!(value["object"]["prefix"], "5.2.0.0/16");
    }
}
