//! Node executors.
//!
//! Each executor turns the current variables plus the inbound event into a
//! [`NodeOutput`]. Collaborator failures are recovered inside the executor
//! with a safe default; an `Err` return means the node is misconfigured and
//! the turn halts.

mod connector;
mod converse;
mod extract;
mod messenger;
mod payment;
mod router;
mod trigger;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use parley_core::config::EngineConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::flow::{Flow, Node, NodeKind};
use parley_core::traits::{ApiClient, ChannelAdapter, LanguageModel, PaymentProvider};
use parley_core::types::{ChatMessage, InboundEvent};

use crate::variables::VariableStore;

/// The external collaborators node executors talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub model: Arc<dyn LanguageModel>,
    pub channel: Arc<dyn ChannelAdapter>,
    pub api: Arc<dyn ApiClient>,
    pub payments: Arc<dyn PaymentProvider>,
}

/// Engine-wide knobs for executors.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub history_limit: usize,
    pub collaborator_timeout: Duration,
    pub fallback_reply: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            history_limit: config.history_limit,
            collaborator_timeout: Duration::from_secs(config.collaborator_timeout_secs),
            fallback_reply: config.fallback_reply.clone(),
        }
    }
}

/// Everything an executor can see while running one node.
pub struct NodeContext<'a> {
    pub flow: &'a Flow,
    pub node: &'a Node,
    pub vars: &'a VariableStore,
    pub history: &'a [ChatMessage],
    pub event: &'a InboundEvent,
    pub contact_id: &'a str,
    pub turn_id: u64,
    pub collaborators: &'a Collaborators,
    pub settings: &'a EngineSettings,
}

impl NodeContext<'_> {
    /// The last `window` transcript entries (engine default when unset).
    fn history_window(&self, window: Option<usize>) -> Vec<ChatMessage> {
        let window = window.unwrap_or(self.settings.history_limit);
        let skip = self.history.len().saturating_sub(window);
        self.history[skip..].to_vec()
    }
}

/// How the walker should leave a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Take the node's single outgoing edge, if any.
    Follow,
    /// Take this specific edge.
    Edge(String),
    /// Stop the turn here.
    Halt,
}

#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub values: Map<String, Value>,
    /// Transcript entries to append.
    pub history: Vec<ChatMessage>,
    pub route: Route,
}

impl NodeOutput {
    pub fn new(values: Map<String, Value>) -> Self {
        Self {
            values,
            history: Vec::new(),
            route: Route::Follow,
        }
    }

    fn with_history(mut self, message: ChatMessage) -> Self {
        self.history.push(message);
        self
    }
}

/// Run a single node.
pub async fn execute_node(ctx: &NodeContext<'_>) -> Result<NodeOutput> {
    match &ctx.node.kind {
        NodeKind::Trigger(_) => Ok(trigger::execute(ctx)),
        NodeKind::Converse(config) => Ok(converse::execute(ctx, config).await),
        NodeKind::Extract(config) => Ok(extract::execute(ctx, config).await),
        NodeKind::Router(_) => Ok(router::execute(ctx)),
        NodeKind::Connector(config) => connector::execute(ctx, config).await,
        NodeKind::Messenger(config) => messenger::execute(ctx, config).await,
        NodeKind::PaymentLink(config) => Ok(payment::execute(ctx, config).await),
    }
}

/// Bound a collaborator call by `limit`.
pub(crate) async fn with_timeout<T>(
    collaborator: &str,
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ParleyError::Timeout {
            collaborator: collaborator.to_string(),
            timeout_secs: limit.as_secs(),
        }),
    }
}

/// Build a JSON object from key/value pairs.
pub(crate) fn object<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
