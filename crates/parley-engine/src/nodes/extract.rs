use serde_json::{json, Map, Number, Value};
use tracing::{debug, warn};

use parley_core::flow::{ExtractConfig, FieldSpec, FieldType};
use parley_core::types::{ChatMessage, Completion, CompletionRequest};

use super::{with_timeout, NodeContext, NodeOutput};
use crate::template;

/// Structured extraction. Writes every declared field (null when absent),
/// `complete` and `missing`.
///
/// Only `required` fields gate `complete`; optional fields never make the
/// extraction incomplete.
pub(super) async fn execute(ctx: &NodeContext<'_>, config: &ExtractConfig) -> NodeOutput {
    let messages = match &config.input {
        Some(input) => vec![ChatMessage::user(template::resolve(input, ctx.vars))],
        None => ctx.history_window(config.history_window),
    };
    let request = CompletionRequest {
        system_prompt: build_prompt(&template::resolve(&config.system_prompt, ctx.vars), &config.fields),
        messages,
        output_schema: Some(fields_schema(&config.fields)),
    };

    let call = ctx.collaborators.model.complete(request);
    let extracted = match with_timeout("model", ctx.settings.collaborator_timeout, call).await {
        Ok(completion) => match parse_completion(completion) {
            Some(map) => map,
            None => {
                warn!(node_id = %ctx.node.id, "Extraction reply is not a JSON object");
                Map::new()
            }
        },
        Err(e) => {
            warn!(
                node_id = %ctx.node.id,
                turn_id = ctx.turn_id,
                error = %e,
                "Model call failed, extraction left empty"
            );
            Map::new()
        }
    };

    let values = collect_fields(&config.fields, &extracted);
    debug!(
        node_id = %ctx.node.id,
        complete = %values["complete"],
        "Extraction finished"
    );
    NodeOutput::new(values)
}

fn build_prompt(base: &str, fields: &[FieldSpec]) -> String {
    let mut prompt = String::from(base.trim());
    if !prompt.is_empty() {
        prompt.push_str("\n\n");
    }
    prompt.push_str("Extract the following fields from the conversation:\n");
    for field in fields {
        prompt.push_str(&format!(
            "- {} ({}{})",
            field.name,
            field.kind.json_type(),
            if field.required { ", required" } else { "" }
        ));
        if let Some(description) = &field.description {
            prompt.push_str(&format!(": {}", description));
        }
        prompt.push('\n');
    }
    prompt.push_str("\nRespond with a single JSON object. Use null for anything not mentioned.");
    prompt
}

fn fields_schema(fields: &[FieldSpec]) -> Value {
    let properties: Map<String, Value> = fields
        .iter()
        .map(|f| {
            let mut schema = json!({"type": [f.kind.json_type(), "null"]});
            if f.kind == FieldType::Array {
                schema["items"] = json!({"type": "string"});
            }
            (f.name.clone(), schema)
        })
        .collect();
    let required: Vec<Value> = fields.iter().map(|f| Value::String(f.name.clone())).collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

fn parse_completion(completion: Completion) -> Option<Map<String, Value>> {
    let value = match completion {
        Completion::Structured(value) => value,
        Completion::Text(text) => serde_json::from_str(strip_code_fences(&text)).ok()?,
    };
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Remove a surrounding Markdown code fence, if any.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") on the opening line.
    let inner = match inner.find('\n') {
        Some(pos) => &inner[pos + 1..],
        None => inner,
    };
    inner.trim_end().strip_suffix("```").unwrap_or(inner).trim()
}

fn collect_fields(fields: &[FieldSpec], extracted: &Map<String, Value>) -> Map<String, Value> {
    let mut values = Map::new();
    let mut missing = Vec::new();
    for field in fields {
        let value = extracted
            .get(&field.name)
            .map(|v| coerce(v, field.kind))
            .unwrap_or(Value::Null);
        if field.required && value.is_null() {
            missing.push(Value::String(field.name.clone()));
        }
        values.insert(field.name.clone(), value);
    }
    values.insert("complete".into(), Value::Bool(missing.is_empty()));
    values.insert("missing".into(), Value::Array(missing));
    values
}

/// Coerce to the declared type. Anything that does not fit, and empty
/// strings or arrays, become null.
fn coerce(value: &Value, kind: FieldType) -> Value {
    match (kind, value) {
        (_, Value::Null) => Value::Null,
        (FieldType::String, Value::String(s)) => non_empty(s.trim()),
        (FieldType::String, Value::Number(n)) => Value::String(n.to_string()),
        (FieldType::String, Value::Bool(b)) => Value::String(b.to_string()),
        (FieldType::String, other) => Value::String(other.to_string()),

        (FieldType::Number, Value::Number(n)) => Value::Number(n.clone()),
        (FieldType::Number, Value::String(s)) => parse_number(s),

        (FieldType::Boolean, Value::Bool(b)) => Value::Bool(*b),
        (FieldType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "si" | "sí" | "1" => Value::Bool(true),
            "false" | "no" | "0" => Value::Bool(false),
            _ => Value::Null,
        },
        (FieldType::Boolean, Value::Number(n)) => match n.as_f64() {
            Some(f) if f == 0.0 => Value::Bool(false),
            Some(f) if f == 1.0 => Value::Bool(true),
            _ => Value::Null,
        },

        (FieldType::Array, Value::Array(items)) if items.is_empty() => Value::Null,
        (FieldType::Array, Value::Array(items)) => Value::Array(items.clone()),
        (FieldType::Array, Value::String(s)) => match s.trim() {
            "" => Value::Null,
            s => Value::Array(vec![Value::String(s.to_string())]),
        },

        (FieldType::Object, Value::Object(map)) => Value::Object(map.clone()),

        _ => Value::Null,
    }
}

fn non_empty(s: &str) -> Value {
    if s.is_empty() {
        Value::Null
    } else {
        Value::String(s.to_string())
    }
}

fn parse_number(s: &str) -> Value {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Value::Number(i.into());
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
