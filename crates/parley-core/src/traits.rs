use futures::future::BoxFuture;

use crate::error::Result;
use crate::flow::FlowDocument;
use crate::state::ConversationState;
use crate::types::*;

/// Language model: system prompt + transcript in, text or structured JSON out.
pub trait LanguageModel: Send + Sync + 'static {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>>;
}

/// Outbound messaging channel.
pub trait ChannelAdapter: Send + Sync + 'static {
    /// Adapter name (e.g., "whatsapp", "console").
    fn name(&self) -> &str;

    /// Deliver a text message to a recipient address. Adapters split text
    /// that exceeds the platform's length limit.
    fn send(&self, recipient: &str, text: &str) -> BoxFuture<'_, Result<SendReceipt>>;
}

/// Executes declared REST calls against named integrations.
///
/// Non-2xx statuses are returned as responses, not errors. An unknown
/// integration name is `ParleyError::UnknownIntegration`.
pub trait ApiClient: Send + Sync + 'static {
    fn execute(&self, call: ApiCall) -> BoxFuture<'_, Result<ApiResponse>>;
}

/// Mints payment links.
pub trait PaymentProvider: Send + Sync + 'static {
    fn create_link(&self, request: PaymentRequest) -> BoxFuture<'_, Result<PaymentLink>>;
}

/// Flow document persistence.
pub trait FlowStore: Send + Sync + 'static {
    fn load_flow(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowDocument>>>;

    fn save_flow(&self, document: &FlowDocument) -> BoxFuture<'_, Result<()>>;

    fn list_flows(&self) -> BoxFuture<'_, Result<Vec<FlowSummary>>>;
}

/// Conversation state persistence. Each save is one atomic replace.
pub trait StateStore: Send + Sync + 'static {
    fn load_state(
        &self,
        flow_id: &str,
        contact_id: &str,
    ) -> BoxFuture<'_, Result<Option<ConversationState>>>;

    fn save_state(&self, state: &ConversationState) -> BoxFuture<'_, Result<()>>;

    /// Returns whether a state existed.
    fn delete_state(&self, flow_id: &str, contact_id: &str) -> BoxFuture<'_, Result<bool>>;

    fn list_states(&self, flow_id: &str) -> BoxFuture<'_, Result<Vec<ConversationState>>>;
}
