use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use parley_core::error::Result;
use parley_core::flow::ConnectorConfig;
use parley_core::types::{ApiCall, ApiResponse};

use super::{object, with_timeout, NodeContext, NodeOutput};
use crate::template;
use crate::variables::walk;

/// Execute a declared REST call and store the parsed response.
///
/// Non-2xx responses, timeouts and transport failures produce a sentinel
/// (`ok: false`) instead of failing the node. An unknown integration is a
/// configuration error.
pub(super) async fn execute(ctx: &NodeContext<'_>, config: &ConnectorConfig) -> Result<NodeOutput> {
    let call = build_call(ctx, config);
    let limit = config
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(ctx.settings.collaborator_timeout);

    info!(
        node_id = %ctx.node.id,
        integration = %call.integration,
        method = %call.method,
        path = %call.path,
        "Calling integration"
    );

    let values = match with_timeout("api", limit, ctx.collaborators.api.execute(call)).await {
        Ok(response) if response.is_success() => success(&response, config.array_path.as_deref()),
        Ok(response) => {
            warn!(node_id = %ctx.node.id, status = response.status, "Integration returned an error status");
            sentinel(Value::from(response.status), format!("HTTP {}", response.status))
        }
        Err(e) if e.is_configuration() => return Err(e),
        Err(e) => {
            warn!(node_id = %ctx.node.id, turn_id = ctx.turn_id, error = %e, "Integration call failed");
            sentinel(Value::Null, e.to_string())
        }
    };
    Ok(NodeOutput::new(values))
}

fn build_call(ctx: &NodeContext<'_>, config: &ConnectorConfig) -> ApiCall {
    let query = config
        .query
        .iter()
        .map(|(k, v)| {
            let resolved = template::resolve_value(v, ctx.vars);
            (k.clone(), template::stringify(Some(&resolved)))
        })
        .collect();
    let headers = config
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), template::resolve(v, ctx.vars)))
        .collect();

    ApiCall {
        integration: config.integration.clone(),
        method: config.method,
        path: template::resolve(&config.path, ctx.vars),
        query,
        headers,
        body: config.body.as_ref().map(|b| template::resolve_value(b, ctx.vars)),
    }
}

fn success(response: &ApiResponse, array_path: Option<&str>) -> Map<String, Value> {
    let items = match array_path {
        Some(path) => match &response.body {
            Value::Object(map) => walk(map, path).cloned(),
            _ => None,
        },
        None => Some(response.body.clone()),
    };
    let items = match items {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };

    object([
        ("ok", Value::Bool(true)),
        ("status", Value::from(response.status)),
        ("count", Value::from(items.len())),
        ("items", Value::Array(items)),
        ("body", response.body.clone()),
        ("error", Value::Null),
    ])
}

fn sentinel(status: Value, error: String) -> Map<String, Value> {
    object([
        ("ok", Value::Bool(false)),
        ("status", status),
        ("body", Value::Null),
        ("items", Value::Array(Vec::new())),
        ("count", Value::from(0)),
        ("error", Value::String(error)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_with_array_body() {
        let response = ApiResponse {
            status: 200,
            body: json!([{"name": "Harry Potter"}]),
        };
        let values = success(&response, None);
        assert_eq!(values["ok"], json!(true));
        assert_eq!(values["count"], json!(1));
        assert_eq!(values["items"][0]["name"], json!("Harry Potter"));
    }

    #[test]
    fn test_success_with_array_path() {
        let response = ApiResponse {
            status: 200,
            body: json!({"data": {"results": [1, 2, 3]}}),
        };
        let values = success(&response, Some("data.results"));
        assert_eq!(values["count"], json!(3));

        let values = success(&response, Some("data.nothing"));
        assert_eq!(values["items"], json!([]));
        assert_eq!(values["count"], json!(0));
    }

    #[test]
    fn test_sentinel_shape() {
        let values = sentinel(json!(503), "HTTP 503".into());
        assert_eq!(values["ok"], json!(false));
        assert_eq!(values["body"], Value::Null);
        assert_eq!(values["items"], json!([]));
        assert_eq!(values["count"], json!(0));
        assert_eq!(values["status"], json!(503));
    }
}
