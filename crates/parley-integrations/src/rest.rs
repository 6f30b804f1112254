use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use parley_core::config::{IntegrationAuth, IntegrationConfig};
use parley_core::error::{ParleyError, Result};
use parley_core::traits::ApiClient;
use parley_core::types::{ApiCall, ApiResponse, HttpMethod};

/// Executes declared calls against the named integrations from config.
///
/// Non-2xx statuses come back as responses. Bodies that are not JSON are
/// returned as a JSON string.
pub struct RestClient {
    integrations: HashMap<String, IntegrationConfig>,
    http: reqwest::Client,
}

impl RestClient {
    pub fn new(integrations: HashMap<String, IntegrationConfig>) -> Self {
        Self {
            integrations,
            http: reqwest::Client::new(),
        }
    }

    fn integration(&self, name: &str) -> Result<&IntegrationConfig> {
        self.integrations
            .get(name)
            .ok_or_else(|| ParleyError::UnknownIntegration(name.to_string()))
    }
}

/// Join the base URL and path, then append the call's query plus any
/// query-parameter credentials.
fn build_url(config: &IntegrationConfig, call: &ApiCall) -> String {
    let base = config.base_url.trim_end_matches('/');
    let path = call.path.trim_start_matches('/');
    let mut url = if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    };

    let mut query: Vec<(&str, &str)> = call
        .query
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    if let IntegrationAuth::Query { params } = &config.auth {
        let mut keys: Vec<&String> = params.keys().collect();
        keys.sort();
        query.extend(keys.into_iter().map(|k| (k.as_str(), params[k].as_str())));
    }

    if !query.is_empty() {
        let encoded: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&encoded.join("&"));
    }
    url
}

fn method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

impl ApiClient for RestClient {
    fn execute(&self, call: ApiCall) -> BoxFuture<'_, Result<ApiResponse>> {
        Box::pin(async move {
            let config = self.integration(&call.integration)?;
            let url = build_url(config, &call);

            let mut req = self.http.request(method(call.method), &url);
            if let Some(secs) = config.timeout_secs {
                req = req.timeout(Duration::from_secs(secs));
            }
            match &config.auth {
                IntegrationAuth::Basic { username, password } => {
                    req = req.basic_auth(username, Some(password));
                }
                IntegrationAuth::Bearer { token } => {
                    req = req.bearer_auth(token);
                }
                IntegrationAuth::None | IntegrationAuth::Query { .. } => {}
            }
            for (k, v) in &config.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            for (k, v) in &call.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(body) = &call.body {
                req = req.json(body);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| ParleyError::collaborator(&call.integration, e.to_string()))?;
            let status = resp.status().as_u16();
            let text = resp
                .text()
                .await
                .map_err(|e| ParleyError::collaborator(&call.integration, e.to_string()))?;

            debug!(
                integration = %call.integration,
                method = %call.method,
                path = %call.path,
                status,
                "Integration call finished"
            );
            Ok(ApiResponse {
                status,
                body: parse_body(&text),
            })
        })
    }
}
