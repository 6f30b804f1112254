use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use parley_core::flow::{ConverseConfig, Topic};
use parley_core::types::{ChatMessage, Completion, CompletionRequest};

use super::{with_timeout, NodeContext, NodeOutput};
use crate::template;

/// Free-form conversation turn with the language model.
pub(super) async fn execute(ctx: &NodeContext<'_>, config: &ConverseConfig) -> NodeOutput {
    let mut system_prompt = template::resolve(&config.system_prompt, ctx.vars);
    let topics = matching_topics(&config.topics, &ctx.event.message);
    if !topics.is_empty() {
        debug!(
            node_id = %ctx.node.id,
            topics = topics.len(),
            "Injecting matched topics"
        );
        system_prompt.push_str("\n\n# Relevant information\n");
        for topic in topics {
            system_prompt.push_str(&format!("\n## {}\n{}\n", topic.title, topic.content));
        }
    }

    let output_schema = if config.outputs.is_empty() {
        None
    } else {
        system_prompt.push_str(&format!(
            "\n\nRespond with a JSON object containing `reply` (your message to the user) \
             and these fields, using null when unknown: {}.",
            config.outputs.join(", ")
        ));
        Some(reply_schema(&config.outputs))
    };

    let request = CompletionRequest {
        system_prompt,
        messages: ctx.history_window(config.history_window),
        output_schema,
    };

    let call = ctx.collaborators.model.complete(request);
    let (reply, mut values) = match with_timeout("model", ctx.settings.collaborator_timeout, call).await {
        Ok(completion) => parse_reply(completion, &config.outputs),
        Err(e) => {
            warn!(
                node_id = %ctx.node.id,
                turn_id = ctx.turn_id,
                error = %e,
                "Model call failed, using fallback reply"
            );
            let fallback = config
                .fallback_reply
                .clone()
                .unwrap_or_else(|| ctx.settings.fallback_reply.clone());
            let mut values = null_outputs(&config.outputs);
            values.insert("error".into(), Value::String(e.to_string()));
            (fallback, values)
        }
    };

    values.insert("reply".into(), Value::String(reply.clone()));
    let output = NodeOutput::new(values);
    if reply.trim().is_empty() {
        output
    } else {
        output.with_history(ChatMessage::assistant(reply))
    }
}

/// Topics with at least one keyword present in the message (case-insensitive).
fn matching_topics<'t>(topics: &'t [Topic], message: &str) -> Vec<&'t Topic> {
    let message = message.to_lowercase();
    topics
        .iter()
        .filter(|topic| {
            topic
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .any(|k| !k.is_empty() && message.contains(&k))
        })
        .collect()
}

fn reply_schema(outputs: &[String]) -> Value {
    let mut properties = Map::new();
    properties.insert("reply".into(), json!({"type": "string"}));
    for name in outputs {
        properties.insert(
            name.clone(),
            json!({"type": ["string", "number", "boolean", "null"]}),
        );
    }
    let mut required = vec![Value::String("reply".into())];
    required.extend(outputs.iter().cloned().map(Value::String));
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

fn null_outputs(outputs: &[String]) -> Map<String, Value> {
    outputs.iter().map(|name| (name.clone(), Value::Null)).collect()
}

/// Split a completion into the reply text and declared outputs.
fn parse_reply(completion: Completion, outputs: &[String]) -> (String, Map<String, Value>) {
    let map = match completion {
        Completion::Structured(Value::Object(map)) => map,
        Completion::Structured(other) => return (other.to_string(), null_outputs(outputs)),
        Completion::Text(text) => match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Object(map)) => map,
            _ => return (text.trim().to_string(), null_outputs(outputs)),
        },
    };

    let reply = ["reply", "message"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();
    let values = outputs
        .iter()
        .map(|name| (name.clone(), map.get(name).cloned().unwrap_or(Value::Null)))
        .collect();
    (reply, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        let topics = vec![
            Topic {
                title: "Envíos".into(),
                content: "Enviamos a todo el país".into(),
                keywords: vec!["envio".into(), "Envío".into()],
            },
            Topic {
                title: "Horarios".into(),
                content: "Lunes a viernes".into(),
                keywords: vec!["horario".into()],
            },
        ];
        let matched = matching_topics(&topics, "¿Hacen ENVÍO a Córdoba?");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].title, "Envíos");
        assert!(matching_topics(&topics, "hola").is_empty());
    }

    #[test]
    fn test_parse_structured_reply() {
        let outputs = vec!["tipo_accion".to_string()];
        let (reply, values) = parse_reply(
            Completion::Structured(json!({"reply": "¡Genial!", "tipo_accion": "comprar"})),
            &outputs,
        );
        assert_eq!(reply, "¡Genial!");
        assert_eq!(values["tipo_accion"], json!("comprar"));
    }

    #[test]
    fn test_parse_text_reply() {
        let outputs = vec!["x".to_string()];
        let (reply, values) = parse_reply(Completion::Text(" Hola, ¿qué buscás? ".into()), &outputs);
        assert_eq!(reply, "Hola, ¿qué buscás?");
        assert_eq!(values["x"], Value::Null);

        let (reply, _) = parse_reply(Completion::Text(r#"{"message": "hi"}"#.into()), &[]);
        assert_eq!(reply, "hi");
    }

    #[test]
    fn test_reply_schema_requires_everything() {
        let schema = reply_schema(&["a".to_string()]);
        assert_eq!(schema["required"], json!(["reply", "a"]));
        assert_eq!(schema["additionalProperties"], json!(false));
    }
}
