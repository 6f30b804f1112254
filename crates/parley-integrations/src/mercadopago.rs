use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use parley_core::config::MercadoPagoConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::traits::PaymentProvider;
use parley_core::types::{PaymentLink, PaymentRequest};

const MERCADOPAGO_API_URL: &str = "https://api.mercadopago.com";

/// Creates Mercado Pago checkout preferences and returns their `init_point`.
pub struct MercadoPagoClient {
    config: MercadoPagoConfig,
    http: reqwest::Client,
}

fn mp_err(message: impl Into<String>) -> ParleyError {
    ParleyError::collaborator("mercadopago", message)
}

impl MercadoPagoClient {
    pub fn new(config: MercadoPagoConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn preferences_url(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(MERCADOPAGO_API_URL)
            .trim_end_matches('/');
        format!("{}/checkout/preferences", base)
    }
}

fn preference_body(config: &MercadoPagoConfig, request: &PaymentRequest) -> Value {
    let currency = request.currency.as_deref().unwrap_or(&config.currency);
    let mut body = json!({
        "items": [{
            "title": request.title,
            "description": request.description,
            "quantity": 1,
            "unit_price": request.amount,
            "currency_id": currency,
        }],
        "external_reference": request.external_reference,
    });
    if let Some(url) = &config.notification_url {
        body["notification_url"] = json!(url);
    }
    if let Some(url) = &config.back_url {
        body["back_urls"] = json!({"success": url, "failure": url, "pending": url});
        body["auto_return"] = json!("approved");
    }
    body
}

fn parse_preference(body: &Value) -> Result<PaymentLink> {
    let id = match &body["id"] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return Err(mp_err("preference response has no id")),
    };
    let url = body["init_point"]
        .as_str()
        .or_else(|| body["sandbox_init_point"].as_str())
        .ok_or_else(|| mp_err("preference response has no init_point"))?;
    Ok(PaymentLink {
        id,
        url: url.to_string(),
        status: "pending".into(),
    })
}

impl PaymentProvider for MercadoPagoClient {
    fn create_link(&self, request: PaymentRequest) -> BoxFuture<'_, Result<PaymentLink>> {
        Box::pin(async move {
            let resp = self
                .http
                .post(self.preferences_url())
                .bearer_auth(&self.config.access_token)
                // Retried requests with the same reference must not mint a second preference
                .header("X-Idempotency-Key", &request.external_reference)
                .json(&preference_body(&self.config, &request))
                .send()
                .await
                .map_err(|e| mp_err(e.to_string()))?;

            let status = resp.status();
            let body: Value = resp.json().await.map_err(|e| mp_err(e.to_string()))?;
            if !status.is_success() {
                return Err(mp_err(format!(
                    "HTTP {}: {}",
                    status,
                    body["message"].as_str().unwrap_or("unknown")
                )));
            }

            let link = parse_preference(&body)?;
            info!(
                preference = %link.id,
                reference = %request.external_reference,
                "Payment link created"
            );
            Ok(link)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MercadoPagoConfig {
        serde_json::from_value(json!({
            "access_token": "TEST-123",
            "notification_url": "https://bot.example.com/mp",
        }))
        .unwrap()
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            title: "Dune".into(),
            amount: 15000.0,
            description: "Dune, edición de bolsillo".into(),
            currency: None,
            external_reference: "books:5491122334455:3".into(),
        }
    }

    #[test]
    fn test_preference_body() {
        let body = preference_body(&config(), &request());
        assert_eq!(body["items"][0]["unit_price"], 15000.0);
        assert_eq!(body["items"][0]["currency_id"], "ARS");
        assert_eq!(body["items"][0]["quantity"], 1);
        assert_eq!(body["external_reference"], "books:5491122334455:3");
        assert_eq!(body["notification_url"], "https://bot.example.com/mp");
        assert!(body.get("back_urls").is_none());

        let mut usd = request();
        usd.currency = Some("USD".into());
        assert_eq!(preference_body(&config(), &usd)["items"][0]["currency_id"], "USD");
    }

    #[test]
    fn test_parse_preference() {
        let link = parse_preference(&json!({
            "id": "123-abc",
            "init_point": "https://www.mercadopago.com.ar/checkout/v1/redirect?pref_id=123-abc"
        }))
        .unwrap();
        assert_eq!(link.id, "123-abc");
        assert!(link.url.contains("pref_id=123-abc"));
        assert_eq!(link.status, "pending");

        assert!(parse_preference(&json!({"id": "x"})).is_err());
    }

    #[test]
    fn test_preferences_url_default() {
        let client = MercadoPagoClient::new(config());
        assert_eq!(
            client.preferences_url(),
            "https://api.mercadopago.com/checkout/preferences"
        );
    }
}
