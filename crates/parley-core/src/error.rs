use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    // Flow errors
    #[error("Invalid flow {flow}: {message}")]
    InvalidFlow { flow: String, message: String },

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    // Node errors
    #[error("Node configuration error: {node}: {message}")]
    NodeConfig { node: String, message: String },

    // Collaborator errors
    #[error("Collaborator failed: {collaborator}: {message}")]
    Collaborator {
        collaborator: String,
        message: String,
    },

    #[error("Collaborator timeout after {timeout_secs}s: {collaborator}")]
    Timeout {
        collaborator: String,
        timeout_secs: u64,
    },

    #[error("Unknown integration: {0}")]
    UnknownIntegration(String),

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Channel errors
    #[error("Channel error: {channel}: {message}")]
    Channel { channel: String, message: String },

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ParleyError {
    pub fn invalid_flow(flow: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFlow {
            flow: flow.into(),
            message: message.into(),
        }
    }

    pub fn node_config(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeConfig {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn collaborator(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    /// Whether this error stems from node configuration rather than a
    /// misbehaving collaborator. Configuration errors halt the turn.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::NodeConfig { .. } | Self::UnknownIntegration(_))
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
