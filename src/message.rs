//! Component J: the message envelope.
//!
//! Wire shape for every message exchanged between the agent and its
//! collaborators (the architect, via the dispatcher). Shaped like
//! `zmq_agent_runner.rs`'s envelope style elsewhere in this codebase (typed
//! `ZmqMessage` with a correlation id and a payload enum) and `traits.rs`'s
//! `Event` actor/metadata shape, narrowed to the wire types this agent's
//! external interfaces actually exchange.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Story,
    ApprovalRequest,
    ApprovalResult,
    Question,
    Answer,
    BudgetReviewRequest,
    BudgetReviewResult,
    StateChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalType {
    Plan,
    Code,
    Completion,
    BudgetReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    Approved,
    NeedsChanges,
    Rejected,
}

/// Typed payload variants, extracted by name. Unknown fields are preserved
/// on pass-through via `extra` so a sender on a newer wire revision doesn't
/// get its data silently dropped by an older reader: extraction always
/// returns a presence/error signal rather than panicking on a missing
/// field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Payload {
    Story {
        content: String,
        story_type: String,
        #[serde(default)]
        extra: HashMap<String, Value>,
    },
    ApprovalRequest {
        content: String,
        reason: String,
        approval_type: ApprovalType,
        story_id: String,
        #[serde(default)]
        extra: HashMap<String, Value>,
    },
    ApprovalResult {
        approval_status: ApprovalStatus,
        feedback: Option<String>,
        #[serde(default)]
        extra: HashMap<String, Value>,
    },
    Question {
        content: String,
        origin_state: String,
        #[serde(default)]
        extra: HashMap<String, Value>,
    },
    Answer {
        text: String,
        #[serde(default)]
        extra: HashMap<String, Value>,
    },
    BudgetReviewRequest {
        content: String,
        origin_state: String,
        story_id: String,
        #[serde(default)]
        extra: HashMap<String, Value>,
    },
    BudgetReviewResult {
        auto_action: String,
        #[serde(default)]
        extra: HashMap<String, Value>,
    },
    StateChange {
        from_state: String,
        to_state: String,
        #[serde(default)]
        extra: HashMap<String, Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub story_id: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from: String,
    pub to: String,
    pub metadata: Metadata,
    pub payload: Payload,
}

impl Message {
    pub fn new(
        message_type: MessageType,
        from: impl Into<String>,
        to: impl Into<String>,
        story_id: Option<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            from: from.into(),
            to: to.into(),
            metadata: Metadata {
                story_id,
                extra: HashMap::new(),
            },
            payload: payload,
        }
    }

    /// Correlates a reply message to this one's id.
    pub fn correlation_id(&self) -> Uuid {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message::new(
            MessageType::ApprovalRequest,
            "agent-1",
            "architect",
            Some("s-1".to_string()),
            Payload::ApprovalRequest {
                content: "plan text".into(),
                reason: "review the plan".into(),
                approval_type: ApprovalType::Plan,
                story_id: "s-1".into(),
                extra: HashMap::new(),
            },
        );

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.metadata.story_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn unknown_fields_are_preserved_on_passthrough() {
        let raw = r#"{
            "id": "00000000-0000-0000-0000-000000000000",
            "type": "Answer",
            "from": "architect",
            "to": "agent-1",
            "metadata": {"story_id": "s-1", "extra": {"custom_field": 42}},
            "payload": {"kind": "Answer", "text": "use library X", "extra": {"sender_version": "2.1"}}
        }"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.metadata.extra.get("custom_field").unwrap(), 42);
        match msg.payload {
            Payload::Answer { text, extra, .. } => {
                assert_eq!(text, "use library X");
                assert_eq!(extra.get("sender_version").unwrap(), "2.1");
            }
            _ => panic!("expected Answer payload"),
        }
    }
}
