use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use parley_core::error::{ParleyError, Result};
use parley_core::flow::{Flow, FlowDocument};
use parley_core::traits::FlowStore;
use parley_core::types::FlowSummary;

use crate::condition::{Condition, ConditionError};

/// A malformed edge condition found while loading a flow.
#[derive(Debug, Clone)]
pub struct ConditionWarning {
    pub edge_id: String,
    pub condition: String,
    pub error: ConditionError,
}

/// Validated flows, cached by id.
pub struct FlowRegistry {
    store: Arc<dyn FlowStore>,
    cache: RwLock<HashMap<String, Arc<Flow>>>,
}

impl FlowRegistry {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load a flow, compiling and caching it on first use.
    pub async fn get(&self, flow_id: &str) -> Result<Arc<Flow>> {
        if let Some(flow) = self.cache.read().await.get(flow_id) {
            return Ok(flow.clone());
        }

        let document = self
            .store
            .load_flow(flow_id)
            .await?
            .ok_or_else(|| ParleyError::FlowNotFound(flow_id.to_string()))?;
        let flow = Arc::new(compile(document)?);
        self.cache
            .write()
            .await
            .insert(flow_id.to_string(), flow.clone());
        Ok(flow)
    }

    /// Validate and store a flow document, replacing any cached version.
    pub async fn install(&self, document: FlowDocument) -> Result<Arc<Flow>> {
        let flow = Arc::new(compile(document.clone())?);
        self.store.save_flow(&document).await?;
        self.cache
            .write()
            .await
            .insert(flow.id.clone(), flow.clone());
        info!(flow_id = %flow.id, version = flow.version, nodes = flow.nodes().len(), "Flow installed");
        Ok(flow)
    }

    pub async fn invalidate(&self, flow_id: &str) {
        self.cache.write().await.remove(flow_id);
    }

    pub async fn list(&self) -> Result<Vec<FlowSummary>> {
        self.store.list_flows().await
    }
}

/// Validate a document into a [`Flow`]. Malformed conditions are logged and
/// kept; they evaluate to false.
pub fn compile(document: FlowDocument) -> Result<Flow> {
    let flow = Flow::try_from(document)?;
    for warning in lint(&flow) {
        warn!(
            flow_id = %flow.id,
            edge_id = %warning.edge_id,
            condition = %warning.condition,
            error = %warning.error,
            "Malformed condition will always evaluate to false"
        );
    }
    Ok(flow)
}

/// Every edge condition that does not parse.
pub fn lint(flow: &Flow) -> Vec<ConditionWarning> {
    flow.edges()
        .iter()
        .filter_map(|edge| {
            let text = edge.condition.as_ref()?;
            Condition::parse(text).err().map(|error| ConditionWarning {
                edge_id: edge.id.clone(),
                condition: text.clone(),
                error,
            })
        })
        .collect()
}
