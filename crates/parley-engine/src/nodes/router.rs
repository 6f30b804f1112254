use serde_json::Value;
use tracing::debug;

use super::{object, NodeContext, NodeOutput, Route};
use crate::condition;

/// Pick the first outgoing edge whose condition holds. Condition-less edges
/// always hold.
pub(super) fn execute(ctx: &NodeContext<'_>) -> NodeOutput {
    let node_id = ctx.node.id.as_str();
    let selected = ctx.flow.outgoing(node_id).find(|edge| match &edge.condition {
        None => true,
        Some(text) => condition::evaluate(text, ctx.vars),
    });

    match selected {
        Some(edge) => {
            debug!(node_id, edge_id = %edge.id, target = %edge.target, "Route selected");
            let mut output = NodeOutput::new(object([
                ("edge", Value::String(edge.id.clone())),
                ("target", Value::String(edge.target.clone())),
                (
                    "handle",
                    edge.source_handle.clone().map(Value::String).unwrap_or(Value::Null),
                ),
            ]));
            output.route = Route::Edge(edge.id.clone());
            output
        }
        None => {
            debug!(node_id, "No route matched, halting turn");
            let mut output = NodeOutput::new(object([
                ("edge", Value::Null),
                ("target", Value::Null),
                ("handle", Value::Null),
            ]));
            output.route = Route::Halt;
            output
        }
    }
}
