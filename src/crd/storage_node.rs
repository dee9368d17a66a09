//! StorageNode CRD
//!
//! Represents a cluster node as seen by the storage system. The node agent and
//! the node controller maintain its conditions; this controller only reads the
//! `Ready` condition to learn whether the node is confirmed gone.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Condition Constants
// =============================================================================

/// Condition type tracking node readiness
pub const CONDITION_TYPE_READY: &str = "Ready";

/// Reason set on a False `Ready` condition once the Kubernetes node object is gone
pub const REASON_KUBERNETES_NODE_GONE: &str = "KubernetesNodeGone";

/// Reason set on a False `Ready` condition while the Kubernetes node is NotReady
pub const REASON_KUBERNETES_NODE_NOT_READY: &str = "KubernetesNodeNotReady";

// =============================================================================
// StorageNode CRD
// =============================================================================

/// StorageNode tracks the storage system's view of a cluster node.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "block.billyronks.io",
    version = "v1",
    kind = "StorageNode",
    plural = "storagenodes",
    shortname = "sn",
    status = "StorageNodeStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Schedulable", "type": "boolean", "jsonPath": ".spec.allowScheduling"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeSpec {
    /// Name of the Kubernetes node
    pub node_name: String,

    /// Whether new replicas may be placed on this node
    #[serde(default = "default_true")]
    pub allow_scheduling: bool,

    /// Node labels for scheduling
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the StorageNode
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeStatus {
    /// Conditions
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

/// Condition status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Node condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Message
    #[serde(default)]
    pub message: Option<String>,
}

/// Health of a node as far as attachment safety is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    /// Ready condition is True
    Ready,
    /// Not ready, or no verdict yet; the node may come back
    Unready,
    /// The Kubernetes node object is gone; its attachments will never be cleaned up there
    ConfirmedGone,
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Implementations
// =============================================================================

impl StorageNode {
    /// Get the node name
    pub fn node_name(&self) -> &str {
        &self.spec.node_name
    }

    /// Get a condition by type
    pub fn condition(&self, condition_type: &str) -> Option<&NodeCondition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.r#type == condition_type))
    }

    /// Classify the node from its `Ready` condition
    pub fn health(&self) -> NodeHealth {
        match self.condition(CONDITION_TYPE_READY) {
            Some(c) if c.status == ConditionStatus::True => NodeHealth::Ready,
            Some(c)
                if c.status == ConditionStatus::False
                    && c.reason.as_deref() == Some(REASON_KUBERNETES_NODE_GONE) =>
            {
                NodeHealth::ConfirmedGone
            }
            _ => NodeHealth::Unready,
        }
    }

    /// Check if node is ready
    pub fn is_ready(&self) -> bool {
        self.health() == NodeHealth::Ready
    }

    /// Check if the node is confirmed gone, a stronger verdict than NotReady
    pub fn is_confirmed_gone(&self) -> bool {
        self.health() == NodeHealth::ConfirmedGone
    }
}

impl StorageNodeStatus {
    /// Set a condition
    pub fn set_condition(&mut self, condition: NodeCondition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }
}

impl NodeCondition {
    /// Build a `Ready` condition
    pub fn ready(status: ConditionStatus, reason: Option<&str>) -> Self {
        Self {
            r#type: CONDITION_TYPE_READY.to_string(),
            status,
            last_transition_time: Some(Utc::now()),
            reason: reason.map(str::to_string),
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with(condition: Option<NodeCondition>) -> StorageNode {
        let mut node = StorageNode::new(
            "node-1",
            StorageNodeSpec {
                node_name: "node-1".into(),
                ..Default::default()
            },
        );
        let mut status = StorageNodeStatus::default();
        if let Some(c) = condition {
            status.set_condition(c);
        }
        node.status = Some(status);
        node
    }

    #[test]
    fn test_node_health() {
        let ready = node_with(Some(NodeCondition::ready(ConditionStatus::True, None)));
        assert_eq!(ready.health(), NodeHealth::Ready);
        assert!(ready.is_ready());

        let not_ready = node_with(Some(NodeCondition::ready(
            ConditionStatus::False,
            Some(REASON_KUBERNETES_NODE_NOT_READY),
        )));
        assert_eq!(not_ready.health(), NodeHealth::Unready);
        assert!(!not_ready.is_confirmed_gone());

        let gone = node_with(Some(NodeCondition::ready(
            ConditionStatus::False,
            Some(REASON_KUBERNETES_NODE_GONE),
        )));
        assert!(gone.is_confirmed_gone());

        assert_eq!(node_with(None).health(), NodeHealth::Unready);
    }

    #[test]
    fn test_set_condition_replaces_same_type() {
        let mut status = StorageNodeStatus::default();
        status.set_condition(NodeCondition::ready(ConditionStatus::True, None));
        status.set_condition(NodeCondition::ready(
            ConditionStatus::False,
            Some(REASON_KUBERNETES_NODE_GONE),
        ));

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::False);
    }
}
