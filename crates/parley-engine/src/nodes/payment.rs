use serde_json::Value;
use tracing::{info, warn};

use parley_core::flow::PaymentLinkConfig;
use parley_core::types::PaymentRequest;

use super::{object, with_timeout, NodeContext, NodeOutput};
use crate::template;

pub(super) async fn execute(ctx: &NodeContext<'_>, config: &PaymentLinkConfig) -> NodeOutput {
    let amount = template::resolve_value(&config.amount, ctx.vars);
    let Some(parsed) = positive_amount(&amount) else {
        warn!(node_id = %ctx.node.id, amount = %amount, "Payment amount is not a positive number");
        return NodeOutput::new(object([
            ("url", Value::String(String::new())),
            ("status", Value::String("invalid_amount".into())),
            ("amount", amount),
        ]));
    };

    let title = template::resolve(&config.title, ctx.vars);
    let description = config
        .description
        .as_deref()
        .map(|d| template::resolve(d, ctx.vars))
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| title.clone());
    let external_reference = format!("{}:{}:{}", ctx.flow.id, ctx.contact_id, ctx.turn_id);

    let request = PaymentRequest {
        title,
        amount: parsed,
        description,
        currency: config
            .currency
            .as_deref()
            .map(|c| template::resolve(c, ctx.vars))
            .filter(|c| !c.trim().is_empty()),
        external_reference: external_reference.clone(),
    };

    let call = ctx.collaborators.payments.create_link(request);
    let values = match with_timeout("payments", ctx.settings.collaborator_timeout, call).await {
        Ok(link) => {
            info!(node_id = %ctx.node.id, link_id = %link.id, "Payment link created");
            object([
                ("url", Value::String(link.url)),
                ("status", Value::String(link.status)),
                ("id", Value::String(link.id)),
                ("amount", Value::from(parsed)),
                ("externalReference", Value::String(external_reference)),
            ])
        }
        Err(e) => {
            warn!(
                node_id = %ctx.node.id,
                turn_id = ctx.turn_id,
                error = %e,
                "Payment link creation failed"
            );
            object([
                ("url", Value::String(String::new())),
                ("status", Value::String("failed".into())),
                ("amount", Value::from(parsed)),
                ("error", Value::String(e.to_string())),
            ])
        }
    };
    NodeOutput::new(values)
}

fn positive_amount(value: &Value) -> Option<f64> {
    let amount = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (amount.is_finite() && amount > 0.0).then_some(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_positive_amount() {
        assert_eq!(positive_amount(&json!(1500)), Some(1500.0));
        assert_eq!(positive_amount(&json!(" 99.9 ")), Some(99.9));
        assert_eq!(positive_amount(&json!(0)), None);
        assert_eq!(positive_amount(&json!(-3)), None);
        assert_eq!(positive_amount(&json!("")), None);
        assert_eq!(positive_amount(&json!("NaN")), None);
        assert_eq!(positive_amount(&Value::Null), None);
    }
}
