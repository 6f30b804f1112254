use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An inbound channel event. This is the Trigger node's input contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// Channel-assigned message id. Redelivery of the same message reuses it.
    pub id: String,
    pub channel: String,
    /// Sender address (phone number for WhatsApp). Doubles as the contact id.
    pub from: String,
    pub message: String,
    #[serde(default)]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub channel_metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    /// Build an event with a freshly generated id.
    pub fn new(channel: impl Into<String>, from: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel: channel.into(),
            from: from.into(),
            message: message.into(),
            profile_name: None,
            channel_metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_profile_name(mut self, name: impl Into<String>) -> Self {
        self.profile_name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.channel_metadata = metadata;
        self
    }
}

/// Role in a conversation transcript.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Request to the language-model collaborator.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    /// JSON Schema the reply must satisfy. `None` asks for free text.
    pub output_schema: Option<serde_json::Value>,
}

/// Reply from the language-model collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    Structured(serde_json::Value),
}

impl Completion {
    /// The reply as text. Structured replies are rendered as compact JSON.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => value.to_string(),
        }
    }
}

/// Acknowledgement from the messaging channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendReceipt {
    pub message_id: Option<String>,
}

/// HTTP method for a declared external call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// A fully resolved REST call against a named integration.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub integration: String,
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

/// Parsed response of an [`ApiCall`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request to mint a payment link.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub title: String,
    pub amount: f64,
    pub description: String,
    pub currency: Option<String>,
    pub external_reference: String,
}

/// A minted payment link.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentLink {
    pub id: String,
    pub url: String,
    pub status: String,
}

/// Short listing entry for a stored flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub id: String,
    pub name: Option<String>,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}
