use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// Top-level Parley configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub integrations: HashMap<String, IntegrationConfig>,
    #[serde(default)]
    pub payments: PaymentsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database for flows and conversation states.
    #[serde(default = "default_database")]
    pub database: String,
    /// Transcript entries kept per conversation.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_collaborator_timeout")]
    pub collaborator_timeout_secs: u64,
    /// Reply used when the model fails mid-conversation.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    /// Flow that channel webhooks are routed to.
    #[serde(default)]
    pub default_flow: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            history_limit: default_history_limit(),
            collaborator_timeout_secs: default_collaborator_timeout(),
            fallback_reply: default_fallback_reply(),
            default_flow: None,
        }
    }
}

fn default_database() -> String { "~/.parley/parley.db".to_string() }
fn default_history_limit() -> usize { 20 }
fn default_collaborator_timeout() -> u64 { 30 }
fn default_fallback_reply() -> String {
    "Disculpá, tuve un problema para responderte. ¿Podés intentar de nuevo?".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f32 { 0.2 }

/// Retry configuration for model requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token for the `/api` routes. Unset leaves them open.
    #[serde(default)]
    pub api_token: Option<String>,
    /// Token echoed back during the WhatsApp webhook handshake.
    #[serde(default)]
    pub verify_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_token: None,
            verify_token: None,
        }
    }
}

fn default_bind() -> String { "127.0.0.1:8080".to_string() }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub whatsapp: Option<WhatsAppConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    pub access_token: String,
    pub phone_number_id: String,
    #[serde(default = "default_graph_version")]
    pub api_version: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_graph_version() -> String { "v21.0".to_string() }

/// A named REST integration that Connector nodes call through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth: IntegrationAuth,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegrationAuth {
    #[default]
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    /// Credentials sent as query parameters.
    Query { params: HashMap<String, String> },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentsConfig {
    #[serde(default)]
    pub mercadopago: Option<MercadoPagoConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MercadoPagoConfig {
    pub access_token: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub notification_url: Option<String>,
    #[serde(default)]
    pub back_url: Option<String>,
}

fn default_currency() -> String { "ARS".to_string() }

impl AppConfig {
    /// Load config from a TOML file, expanding `${ENV_VAR}` references first.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ParleyError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| ParleyError::Config(e.to_string()))
    }

    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.engine.database)
    }
}

/// Default config location: `~/.parley/config.toml`.
pub fn default_config_path() -> PathBuf {
    expand_home("~/.parley/config.toml")
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_PARLEY_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_PARLEY_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_PARLEY_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_PARLEY_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_PARLEY_VAR}\"");
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = AppConfig::parse(
            r#"
[model]
model_id = "gpt-4o-mini"
"#,
        )
        .unwrap();
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.engine.history_limit, 20);
        assert_eq!(config.engine.collaborator_timeout_secs, 30);
        assert!(config.engine.default_flow.is_none());
        assert_eq!(config.gateway.bind, "127.0.0.1:8080");
        assert!(config.channels.whatsapp.is_none());
        assert!(config.integrations.is_empty());
    }

    #[test]
    fn test_integration_auth_variants() {
        let config = AppConfig::parse(
            r#"
[model]
model_id = "gpt-4o-mini"

[integrations.shop]
base_url = "https://shop.example.com/wp-json/wc/v3"
auth = { type = "basic", username = "ck_1", password = "cs_1" }

[integrations.catalog]
base_url = "https://catalog.example.com"
auth = { type = "query", params = { api_key = "k" } }
timeout_secs = 5

[payments.mercadopago]
access_token = "TEST-123"
"#,
        )
        .unwrap();
        assert_eq!(
            config.integrations["shop"].auth,
            IntegrationAuth::Basic {
                username: "ck_1".into(),
                password: "cs_1".into()
            }
        );
        assert_eq!(config.integrations["catalog"].timeout_secs, Some(5));
        assert_eq!(config.payments.mercadopago.unwrap().currency, "ARS");
    }

    #[test]
    fn test_database_path_expands_home() {
        std::env::set_var("HOME", "/home/tester");
        let config = AppConfig::parse("[model]\nmodel_id = \"m\"\n").unwrap();
        assert_eq!(
            config.database_path(),
            PathBuf::from("/home/tester/.parley/parley.db")
        );
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/parley.toml")).unwrap_err();
        assert!(matches!(err, ParleyError::ConfigNotFound(_)));
    }
}
