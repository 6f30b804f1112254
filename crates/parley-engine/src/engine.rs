use std::sync::Arc;

use tracing::info;

use parley_core::error::Result;
use parley_core::state::ConversationState;
use parley_core::traits::{FlowStore, StateStore};
use parley_core::types::InboundEvent;

use crate::locks::ContactLocks;
use crate::nodes::{Collaborators, EngineSettings};
use crate::registry::FlowRegistry;
use crate::walker::{GraphWalker, TurnReport};

/// Entry point for inbound events.
///
/// Events for the same (flow, contact) are serialized; everything else runs
/// concurrently.
pub struct Engine {
    flows: FlowRegistry,
    states: Arc<dyn StateStore>,
    walker: GraphWalker,
    locks: ContactLocks,
}

impl Engine {
    pub fn new(
        flows: Arc<dyn FlowStore>,
        states: Arc<dyn StateStore>,
        collaborators: Collaborators,
        settings: EngineSettings,
    ) -> Self {
        Self {
            flows: FlowRegistry::new(flows),
            walker: GraphWalker::new(collaborators, settings, states.clone()),
            states,
            locks: ContactLocks::new(),
        }
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    /// Run one turn of `flow_id` for the event's sender.
    pub async fn handle_event(&self, flow_id: &str, event: InboundEvent) -> Result<TurnReport> {
        let flow = self.flows.get(flow_id).await?;
        let _guard = self.locks.lock(flow_id, &event.from).await;
        let state = self.states.load_state(flow_id, &event.from).await?;
        self.walker.run_turn(&flow, state, &event).await
    }

    pub async fn conversation(
        &self,
        flow_id: &str,
        contact_id: &str,
    ) -> Result<Option<ConversationState>> {
        self.states.load_state(flow_id, contact_id).await
    }

    pub async fn conversations(&self, flow_id: &str) -> Result<Vec<ConversationState>> {
        self.states.list_states(flow_id).await
    }

    /// Forget a conversation. The next event starts from scratch.
    pub async fn reset_conversation(&self, flow_id: &str, contact_id: &str) -> Result<bool> {
        let _guard = self.locks.lock(flow_id, contact_id).await;
        let existed = self.states.delete_state(flow_id, contact_id).await?;
        if existed {
            info!(flow_id, contact = contact_id, "Conversation reset");
        }
        Ok(existed)
    }
}
