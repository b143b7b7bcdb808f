//! # Wire Messages
//!
//! JSON messages exchanged with clients, tagged by `type`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::diff::Delta;
use crate::ids::SubscriptionId;
use crate::store::CommitSeq;

/// Message from client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a live query
    Subscribe {
        #[serde(default)]
        request_id: Option<String>,
        function: String,
        #[serde(default)]
        args: Value,
    },

    /// Stop a live query
    Unsubscribe { subscription_id: SubscriptionId },

    /// Heartbeat/ping
    Heartbeat {
        #[serde(default)]
        ref_id: Option<String>,
    },
}

/// Message to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription accepted; its initial snapshot follows
    Subscribed {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        request_id: Option<String>,
        subscription_id: SubscriptionId,
        function: String,
    },

    /// Full result, sent first and after every resync
    Initial {
        subscription_id: SubscriptionId,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        request_id: Option<String>,
        seq: CommitSeq,
        value: Arc<Value>,
    },

    /// Change relative to the previous value
    Delta {
        subscription_id: SubscriptionId,
        seq: CommitSeq,
        delta: Delta,
    },

    /// Latest value after coalescing skipped intermediate deltas
    Update {
        subscription_id: SubscriptionId,
        seq: CommitSeq,
        value: Arc<Value>,
    },

    /// Recompute failure; the subscription stays alive
    Error {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        subscription_id: Option<SubscriptionId>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        request_id: Option<String>,
        code: String,
        message: String,
    },

    /// The subscription has been torn down by the server
    Terminal {
        subscription_id: SubscriptionId,
        code: String,
        message: String,
    },

    /// Unsubscription confirmed
    Unsubscribed { subscription_id: SubscriptionId },

    /// Heartbeat response
    Heartbeat {
        ref_id: Option<String>,
        server_time: i64,
    },

    /// System message
    System { message: String },
}

impl ServerMessage {
    /// Subscription this message belongs to, if any
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        match self {
            ServerMessage::Subscribed { subscription_id, .. }
            | ServerMessage::Initial { subscription_id, .. }
            | ServerMessage::Delta { subscription_id, .. }
            | ServerMessage::Update { subscription_id, .. }
            | ServerMessage::Terminal { subscription_id, .. }
            | ServerMessage::Unsubscribed { subscription_id } => Some(*subscription_id),
            ServerMessage::Error { subscription_id, .. } => *subscription_id,
            ServerMessage::Heartbeat { .. } | ServerMessage::System { .. } => None,
        }
    }

    /// Commit sequence number of a result-carrying message
    pub fn seq(&self) -> Option<CommitSeq> {
        match self {
            ServerMessage::Initial { seq, .. }
            | ServerMessage::Delta { seq, .. }
            | ServerMessage::Update { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Result messages may be merged under backpressure; errors and
    /// lifecycle messages never are.
    pub fn is_coalescable(&self) -> bool {
        matches!(
            self,
            ServerMessage::Initial { .. } | ServerMessage::Delta { .. } | ServerMessage::Update { .. }
        )
    }

    pub fn error(subscription_id: Option<SubscriptionId>, code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            subscription_id,
            request_id: None,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn terminal(subscription_id: SubscriptionId, code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Terminal {
            subscription_id,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn heartbeat(ref_id: Option<String>) -> Self {
        ServerMessage::Heartbeat {
            ref_id,
            server_time: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_subscribe_parse() {
        let text = r#"{"type": "subscribe", "request_id": "r1", "function": "rows.get",
                       "args": {"table": "tasks", "key": "a"}}"#;
        let msg: ClientMessage = serde_json::from_str(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                request_id: Some("r1".into()),
                function: "rows.get".into(),
                args: json!({"table": "tasks", "key": "a"}),
            }
        );
    }

    #[test]
    fn test_client_unsubscribe_parse() {
        let id = SubscriptionId::new();
        let text = format!(r#"{{"type": "unsubscribe", "subscription_id": "{}"}}"#, id);
        let msg: ClientMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(msg, ClientMessage::Unsubscribe { subscription_id: id });
    }

    #[test]
    fn test_server_message_serialize() {
        let id = SubscriptionId::new();
        let msg = ServerMessage::Update {
            subscription_id: id,
            seq: CommitSeq::new(7),
            value: Arc::new(json!([1, 2])),
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["type"], "update");
        assert_eq!(encoded["seq"], 7);
        assert_eq!(encoded["value"], json!([1, 2]));
        assert_eq!(encoded["subscription_id"], id.to_string());
    }

    #[test]
    fn test_coalescable() {
        let id = SubscriptionId::new();
        assert!(ServerMessage::Delta {
            subscription_id: id,
            seq: CommitSeq::new(1),
            delta: Delta::Replace { value: json!(1) },
        }
        .is_coalescable());
        assert!(!ServerMessage::terminal(id, "X", "gone").is_coalescable());
        assert!(!ServerMessage::error(Some(id), "X", "failed").is_coalescable());
    }
}
