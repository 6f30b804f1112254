use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ChatMessage;

/// Inbound event ids remembered per conversation for replay detection.
pub const RECENT_EVENT_LIMIT: usize = 32;

/// Per-turn execution status of a single node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Running,
    /// Walked until a node with no outgoing edge.
    Completed,
    /// Stopped at a router with no matching edge or a failed node.
    Halted,
    Failed,
}

impl TurnStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Bookkeeping for the turn currently (or last) executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    /// Id of the inbound event that started the turn.
    pub event_id: String,
    pub status: TurnStatus,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeStatus>,
    pub started_at: DateTime<Utc>,
}

/// Durable per-(flow, contact) conversation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub flow_id: String,
    pub contact_id: String,
    #[serde(default)]
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Which node last wrote each promoted root key.
    #[serde(default)]
    pub promoted_by: BTreeMap<String, String>,
    #[serde(default)]
    pub turn_id: u64,
    #[serde(default)]
    pub turn: Option<TurnRecord>,
    /// Ids of the events that started the most recent turns, oldest first.
    #[serde(default)]
    pub recent_events: VecDeque<String>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(flow_id: impl Into<String>, contact_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            flow_id: flow_id.into(),
            contact_id: contact_id.into(),
            current_node_id: None,
            variables: serde_json::Map::new(),
            promoted_by: BTreeMap::new(),
            turn_id: 0,
            turn: None,
            recent_events: VecDeque::new(),
            history: Vec::new(),
            created_at: now,
            last_updated: now,
        }
    }

    /// Start a new turn for `event_id`. Returns the new turn id.
    pub fn begin_turn(&mut self, event_id: impl Into<String>) -> u64 {
        let event_id = event_id.into();
        self.turn_id += 1;
        self.recent_events.push_back(event_id.clone());
        while self.recent_events.len() > RECENT_EVENT_LIMIT {
            self.recent_events.pop_front();
        }
        self.turn = Some(TurnRecord {
            event_id,
            status: TurnStatus::Running,
            nodes: BTreeMap::new(),
            started_at: Utc::now(),
        });
        self.touch();
        self.turn_id
    }

    pub fn mark(&mut self, node_id: &str, status: NodeStatus) {
        if let Some(turn) = self.turn.as_mut() {
            turn.nodes.insert(node_id.to_string(), status);
        }
        self.touch();
    }

    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.turn
            .as_ref()
            .and_then(|t| t.nodes.get(node_id).copied())
            .unwrap_or(NodeStatus::Pending)
    }

    pub fn finish_turn(&mut self, status: TurnStatus) {
        if let Some(turn) = self.turn.as_mut() {
            turn.status = status;
        }
        self.touch();
    }

    /// Whether `event_id` already started one of the recent turns.
    pub fn is_replay_of(&self, event_id: &str) -> bool {
        self.turn.as_ref().is_some_and(|t| t.event_id == event_id)
            || self.recent_events.iter().any(|id| id == event_id)
    }

    /// The turn record when `event_id` started the last turn.
    pub fn turn_for(&self, event_id: &str) -> Option<&TurnRecord> {
        self.turn.as_ref().filter(|t| t.event_id == event_id)
    }

    /// Append to the transcript, keeping at most `limit` entries.
    pub fn push_history(&mut self, message: ChatMessage, limit: usize) {
        self.history.push(message);
        if limit > 0 && self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_lifecycle() {
        let mut state = ConversationState::new("f1", "5491100");
        assert_eq!(state.begin_turn("evt-1"), 1);
        assert_eq!(state.node_status("send"), NodeStatus::Pending);

        state.mark("send", NodeStatus::Done);
        assert_eq!(state.node_status("send"), NodeStatus::Done);
        assert!(state.is_replay_of("evt-1"));
        assert!(!state.is_replay_of("evt-2"));

        state.finish_turn(TurnStatus::Completed);
        assert!(state.turn.as_ref().unwrap().status.is_finished());

        assert_eq!(state.begin_turn("evt-2"), 2);
        assert_eq!(state.node_status("send"), NodeStatus::Pending);
        assert!(state.is_replay_of("evt-1"));
        assert!(state.turn_for("evt-1").is_none());
        assert!(state.turn_for("evt-2").is_some());
    }

    #[test]
    fn test_recent_events_are_bounded() {
        let mut state = ConversationState::new("f1", "c1");
        for i in 0..RECENT_EVENT_LIMIT + 3 {
            state.begin_turn(format!("evt-{i}"));
        }
        assert_eq!(state.recent_events.len(), RECENT_EVENT_LIMIT);
        assert!(!state.is_replay_of("evt-0"));
        assert!(!state.is_replay_of("evt-2"));
        assert!(state.is_replay_of("evt-3"));
        assert!(state.is_replay_of(&format!("evt-{}", RECENT_EVENT_LIMIT + 2)));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = ConversationState::new("f1", "c1");
        for i in 0..5 {
            state.push_history(ChatMessage::user(format!("m{i}")), 3);
        }
        let contents: Vec<_> = state.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_state_document_shape() {
        let mut state = ConversationState::new("f1", "c1");
        state.begin_turn("evt-1");
        state.mark("extract", NodeStatus::Done);
        let doc = serde_json::to_value(&state).unwrap();
        assert_eq!(doc["flowId"], "f1");
        assert_eq!(doc["turnId"], 1);
        assert_eq!(doc["turn"]["nodes"]["extract"], "DONE");

        let back: ConversationState = serde_json::from_value(doc).unwrap();
        assert_eq!(back.node_status("extract"), NodeStatus::Done);
    }
}
