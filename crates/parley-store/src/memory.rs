use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::RwLock;

use parley_core::error::{ParleyError, Result};
use parley_core::flow::FlowDocument;
use parley_core::state::ConversationState;
use parley_core::traits::{FlowStore, StateStore};
use parley_core::types::FlowSummary;

/// Process-local store. Used by the CLI `chat` command and in tests.
#[derive(Default)]
pub struct MemoryStore {
    flows: RwLock<HashMap<String, (FlowDocument, DateTime<Utc>)>>,
    states: RwLock<HashMap<(String, String), ConversationState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowStore for MemoryStore {
    fn load_flow(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowDocument>>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            Ok(self
                .flows
                .read()
                .await
                .get(&flow_id)
                .map(|(doc, _)| doc.clone()))
        })
    }

    fn save_flow(&self, document: &FlowDocument) -> BoxFuture<'_, Result<()>> {
        let document = document.clone();
        Box::pin(async move {
            let id = document
                .id
                .clone()
                .ok_or_else(|| ParleyError::invalid_flow("<unnamed>", "missing flow id"))?;
            self.flows.write().await.insert(id, (document, Utc::now()));
            Ok(())
        })
    }

    fn list_flows(&self) -> BoxFuture<'_, Result<Vec<FlowSummary>>> {
        Box::pin(async move {
            let mut flows: Vec<FlowSummary> = self
                .flows
                .read()
                .await
                .iter()
                .map(|(id, (doc, updated_at))| FlowSummary {
                    id: id.clone(),
                    name: doc.name.clone(),
                    version: doc.version,
                    updated_at: *updated_at,
                })
                .collect();
            flows.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(flows)
        })
    }
}

impl StateStore for MemoryStore {
    fn load_state(
        &self,
        flow_id: &str,
        contact_id: &str,
    ) -> BoxFuture<'_, Result<Option<ConversationState>>> {
        let key = (flow_id.to_string(), contact_id.to_string());
        Box::pin(async move { Ok(self.states.read().await.get(&key).cloned()) })
    }

    fn save_state(&self, state: &ConversationState) -> BoxFuture<'_, Result<()>> {
        let state = state.clone();
        Box::pin(async move {
            let key = (state.flow_id.clone(), state.contact_id.clone());
            self.states.write().await.insert(key, state);
            Ok(())
        })
    }

    fn delete_state(&self, flow_id: &str, contact_id: &str) -> BoxFuture<'_, Result<bool>> {
        let key = (flow_id.to_string(), contact_id.to_string());
        Box::pin(async move { Ok(self.states.write().await.remove(&key).is_some()) })
    }

    fn list_states(&self, flow_id: &str) -> BoxFuture<'_, Result<Vec<ConversationState>>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            let mut states: Vec<ConversationState> = self
                .states
                .read()
                .await
                .values()
                .filter(|s| s.flow_id == flow_id)
                .cloned()
                .collect();
            states.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
            Ok(states)
        })
    }
}
