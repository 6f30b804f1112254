use serde_json::{Map, Value};
use tracing::{info, warn};

use parley_core::error::{ParleyError, Result};
use parley_core::flow::{ListFormat, MessengerConfig};

use super::{object, with_timeout, NodeContext, NodeOutput};
use crate::template;
use crate::variables::{Lookup, Scope};

/// Send a templated message. A message that resolves to blank is skipped.
pub(super) async fn execute(ctx: &NodeContext<'_>, config: &MessengerConfig) -> Result<NodeOutput> {
    let recipient = template::resolve(config.to.as_deref().unwrap_or("{{from}}"), ctx.vars);
    let recipient = recipient.trim().to_string();
    if recipient.is_empty() {
        return Err(ParleyError::node_config(
            &ctx.node.id,
            "recipient resolved to an empty address",
        ));
    }

    let mut overlay = Map::new();
    if let Some(list) = &config.list {
        overlay.insert("list".into(), Value::String(render_list(list, ctx.vars)));
    }
    let text = template::resolve(&config.message, &Scope::new(&overlay, ctx.vars));

    if text.trim().is_empty() {
        info!(node_id = %ctx.node.id, "Message resolved empty, skipping send");
        return Ok(NodeOutput::new(object([
            ("sent", Value::Bool(false)),
            ("skipped", Value::Bool(true)),
            ("to", Value::String(recipient)),
        ])));
    }

    let channel = &ctx.collaborators.channel;
    let send = channel.send(&recipient, &text);
    let values = match with_timeout(channel.name(), ctx.settings.collaborator_timeout, send).await {
        Ok(receipt) => {
            info!(node_id = %ctx.node.id, channel = %channel.name(), to = %recipient, "Message sent");
            object([
                ("sent", Value::Bool(true)),
                ("to", Value::String(recipient)),
                ("messageId", receipt.message_id.map(Value::String).unwrap_or(Value::Null)),
                ("text", Value::String(text)),
            ])
        }
        Err(e) => {
            warn!(
                node_id = %ctx.node.id,
                turn_id = ctx.turn_id,
                error = %e,
                "Channel send failed"
            );
            object([
                ("sent", Value::Bool(false)),
                ("to", Value::String(recipient)),
                ("error", Value::String(e.to_string())),
            ])
        }
    };
    Ok(NodeOutput::new(values))
}

/// Render an array variable with a per-item template.
///
/// Each item sees its own fields, `item` (the whole value) and `index`
/// (1-based), layered over the conversation variables.
fn render_list(list: &ListFormat, vars: &dyn Lookup) -> String {
    let items = match vars.lookup(&list.source) {
        Some(Value::Array(items)) if !items.is_empty() => items,
        _ => return list.empty.clone().unwrap_or_default(),
    };
    let limit = list.max_items.unwrap_or(items.len());

    items
        .iter()
        .take(limit)
        .enumerate()
        .map(|(i, item)| {
            let mut overlay = match item {
                Value::Object(fields) => fields.clone(),
                _ => Map::new(),
            };
            overlay.insert("item".into(), item.clone());
            overlay.insert("index".into(), Value::from(i + 1));
            template::resolve(&list.item, &Scope::new(&overlay, vars))
        })
        .collect::<Vec<_>>()
        .join(&list.separator)
}
