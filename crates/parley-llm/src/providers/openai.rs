use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use parley_core::config::ModelConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::traits::LanguageModel;
use parley_core::types::*;

use super::presets::{build_extra_headers, get_preset};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat-completions client. Works with OpenAI, Ollama,
/// Groq, OpenRouter and anything else speaking the same API.
pub struct OpenAiClient {
    http: Client,
    config: ModelConfig,
    base_url: String,
    headers: Vec<(String, String)>,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> Self {
        let preset = get_preset(&config.provider);
        let base_url = config
            .base_url
            .clone()
            .or_else(|| preset.as_ref().map(|p| p.default_base_url.to_string()))
            .unwrap_or_else(|| OPENAI_API_URL.to_string());
        if preset.as_ref().is_some_and(|p| p.needs_api_key) && config.api_key.is_none() {
            warn!(provider = %config.provider, "No API key configured for provider");
        }
        let headers = build_extra_headers(preset.as_ref(), &config.extra_headers);
        Self {
            http: Client::new(),
            config,
            base_url,
            headers,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize, Debug, PartialEq)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

fn convert_messages(system_prompt: &str, messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.trim().is_empty() {
        out.push(OaiMessage {
            role: "system",
            content: system_prompt.to_string(),
        });
    }
    out.extend(messages.into_iter().map(|m| OaiMessage {
        role: match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        },
        content: m.content,
    }));
    out
}

fn build_request(config: &ModelConfig, request: CompletionRequest) -> ChatRequest {
    let response_format = request.output_schema.map(|schema| {
        serde_json::json!({
            "type": "json_schema",
            "json_schema": {"name": "node_output", "schema": schema, "strict": true}
        })
    });

    ChatRequest {
        model: config.model_id.clone(),
        messages: convert_messages(&request.system_prompt, request.messages),
        max_tokens: config.max_tokens,
        temperature: (config.temperature > 0.0).then_some(config.temperature),
        response_format,
    }
}

fn parse_response(response: ChatResponse, structured: bool) -> Result<Completion> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ParleyError::LlmParse("response has no choices".into()))?;

    if let Some(refusal) = choice.message.refusal {
        return Err(ParleyError::LlmRequest(format!("model refused: {}", refusal)));
    }
    if choice.finish_reason.as_deref() == Some("length") {
        warn!("Model reply truncated at max_tokens");
    }
    let content = choice.message.content.unwrap_or_default();

    if structured {
        match serde_json::from_str(&content) {
            Ok(value) => return Ok(Completion::Structured(value)),
            Err(e) => debug!(error = %e, "Structured reply did not parse, returning text"),
        }
    }
    Ok(Completion::Text(content))
}

impl LanguageModel for OpenAiClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            let structured = request.output_schema.is_some();
            let body = build_request(&self.config, request);

            let mut req = self.http.post(&self.base_url).json(&body);
            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            for (k, v) in &self.headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .send()
                .await
                .map_err(|e| ParleyError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(ParleyError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| ParleyError::LlmParse(e.to_string()))?;
            parse_response(parsed, structured)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model() -> ModelConfig {
        serde_json::from_value(json!({"model_id": "gpt-4o-mini"})).unwrap()
    }

    #[test]
    fn test_system_prompt_goes_first() {
        let messages = convert_messages(
            "Sos un vendedor de libros.",
            vec![ChatMessage::user("hola"), ChatMessage::assistant("¡Hola!")],
        );
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[2].content, "¡Hola!");

        assert_eq!(convert_messages("  ", vec![]).len(), 0);
    }

    #[test]
    fn test_schema_becomes_response_format() {
        let request = CompletionRequest {
            system_prompt: "extract".into(),
            messages: vec![ChatMessage::user("busco harry potter")],
            output_schema: Some(json!({"type": "object"})),
        };
        let body = serde_json::to_value(build_request(&model(), request)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);

        let plain = serde_json::to_value(build_request(&model(), CompletionRequest::default())).unwrap();
        assert!(plain.get("response_format").is_none());
    }

    #[test]
    fn test_parse_structured_and_text() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "{\"titulo\": \"dune\"}"}, "finish_reason": "stop"}]
        }))
        .unwrap();
        assert_eq!(
            parse_response(response, true).unwrap(),
            Completion::Structured(json!({"titulo": "dune"}))
        );

        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "hola"}}]
        }))
        .unwrap();
        assert_eq!(parse_response(response, false).unwrap(), Completion::Text("hola".into()));
    }

    #[test]
    fn test_parse_errors() {
        let empty: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(parse_response(empty, false), Err(ParleyError::LlmParse(_))));

        let refused: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": null, "refusal": "no"}}]
        }))
        .unwrap();
        assert!(matches!(parse_response(refused, true), Err(ParleyError::LlmRequest(_))));
    }

    #[test]
    fn test_base_url_from_preset() {
        let mut config = model();
        config.provider = "groq".into();
        let client = OpenAiClient::new(config);
        assert!(client.base_url.contains("groq.com"));

        let mut config = model();
        config.base_url = Some("http://localhost:9999/v1/chat/completions".into());
        let client = OpenAiClient::new(config);
        assert_eq!(client.base_url, "http://localhost:9999/v1/chat/completions");
    }
}
