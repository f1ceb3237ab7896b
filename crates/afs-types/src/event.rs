//! Lifecycle events raised by storage mutations.
//!
//! Every event carries the id of the node it concerns. Events are
//! published on a topic; listeners and the durable event log both route
//! by topic.

use serde::{Deserialize, Serialize};

/// Topic for directory and attribute events
pub const NODE_TOPIC: &str = "appstorage.node";

/// Topic for dependency graph events
pub const DEPENDENCY_TOPIC: &str = "appstorage.dependency";

/// Topic for time-series events
pub const TIME_SERIES_TOPIC: &str = "appstorage.timeseries";

/// Typed notification of a storage mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    NodeCreated {
        id: String,
        parent_id: Option<String>,
    },
    NodeConsistent {
        id: String,
    },
    NodeRemoved {
        id: String,
        parent_id: Option<String>,
    },
    /// A single named attribute changed (`name`, `description`,
    /// `modificationTime` or a generic metadata key)
    AttributeUpdated {
        id: String,
        attribute: String,
    },
    NodeMetadataUpdated {
        id: String,
    },
    ParentChanged {
        id: String,
        old_parent_id: Option<String>,
        new_parent_id: String,
    },
    NodeDataUpdated {
        id: String,
        data_name: String,
    },
    NodeDataRemoved {
        id: String,
        data_name: String,
    },
    DependencyAdded {
        id: String,
        dependency_name: String,
    },
    DependencyRemoved {
        id: String,
        dependency_name: String,
    },
    TimeSeriesCreated {
        id: String,
        time_series_name: String,
    },
    TimeSeriesDataUpdated {
        id: String,
        time_series_name: String,
    },
    TimeSeriesRemoved {
        id: String,
    },
}

impl NodeEvent {
    /// Id of the node the event concerns.
    pub fn node_id(&self) -> &str {
        match self {
            NodeEvent::NodeCreated { id, .. }
            | NodeEvent::NodeConsistent { id }
            | NodeEvent::NodeRemoved { id, .. }
            | NodeEvent::AttributeUpdated { id, .. }
            | NodeEvent::NodeMetadataUpdated { id }
            | NodeEvent::ParentChanged { id, .. }
            | NodeEvent::NodeDataUpdated { id, .. }
            | NodeEvent::NodeDataRemoved { id, .. }
            | NodeEvent::DependencyAdded { id, .. }
            | NodeEvent::DependencyRemoved { id, .. }
            | NodeEvent::TimeSeriesCreated { id, .. }
            | NodeEvent::TimeSeriesDataUpdated { id, .. }
            | NodeEvent::TimeSeriesRemoved { id } => id,
        }
    }

    /// Topic the storage publishes this kind of event on.
    pub fn default_topic(&self) -> &'static str {
        match self {
            NodeEvent::DependencyAdded { .. } | NodeEvent::DependencyRemoved { .. } => {
                DEPENDENCY_TOPIC
            }
            NodeEvent::TimeSeriesCreated { .. }
            | NodeEvent::TimeSeriesDataUpdated { .. }
            | NodeEvent::TimeSeriesRemoved { .. } => TIME_SERIES_TOPIC,
            _ => NODE_TOPIC,
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// An event together with the topic it was published on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicEvent {
    pub topic: String,
    pub event: NodeEvent,
}

impl TopicEvent {
    pub fn new(topic: impl Into<String>, event: NodeEvent) -> Self {
        Self {
            topic: topic.into(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_roundtrip() {
        let event = NodeEvent::TimeSeriesDataUpdated {
            id: "n1".to_string(),
            time_series_name: "ts1".to_string(),
        };
        let decoded = NodeEvent::from_bytes(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.node_id(), "n1");
    }

    #[test]
    fn test_event_tagging() {
        let event = NodeEvent::NodeCreated {
            id: "n1".to_string(),
            parent_id: Some("root".to_string()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "node_created");
        assert_eq!(value["parent_id"], "root");
    }

    #[test]
    fn test_default_topics() {
        let removed = NodeEvent::NodeRemoved {
            id: "n".to_string(),
            parent_id: None,
        };
        let dep = NodeEvent::DependencyRemoved {
            id: "n".to_string(),
            dependency_name: "d".to_string(),
        };
        let ts = NodeEvent::TimeSeriesRemoved { id: "n".to_string() };
        assert_eq!(removed.default_topic(), NODE_TOPIC);
        assert_eq!(dep.default_topic(), DEPENDENCY_TOPIC);
        assert_eq!(ts.default_topic(), TIME_SERIES_TOPIC);
    }
}
