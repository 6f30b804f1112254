use serde_json::Value;

use parley_core::types::ChatMessage;

use super::{object, NodeContext, NodeOutput};

/// Expose the inbound event as variables and record the user message.
pub(super) fn execute(ctx: &NodeContext<'_>) -> NodeOutput {
    let event = ctx.event;
    let values = object([
        ("from", Value::String(event.from.clone())),
        ("message", Value::String(event.message.clone())),
        (
            "profileName",
            event.profile_name.clone().map(Value::String).unwrap_or(Value::Null),
        ),
        ("channelMetadata", event.channel_metadata.clone()),
        ("channel", Value::String(event.channel.clone())),
        ("eventId", Value::String(event.id.clone())),
    ]);

    let output = NodeOutput::new(values);
    if event.message.trim().is_empty() {
        output
    } else {
        output.with_history(ChatMessage::user(event.message.clone()))
    }
}
