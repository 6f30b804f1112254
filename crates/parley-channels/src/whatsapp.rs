use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use parley_core::config::WhatsAppConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::traits::ChannelAdapter;
use parley_core::types::{InboundEvent, SendReceipt};

use crate::util::split_message;

const WHATSAPP_MAX_LEN: usize = 4096;
const GRAPH_API_URL: &str = "https://graph.facebook.com";

/// WhatsApp Cloud API adapter. Sends text through the Graph API
/// `/{phone_number_id}/messages` endpoint; inbound traffic arrives through
/// the gateway webhook and is decoded by [`parse_webhook`].
pub struct WhatsAppAdapter {
    config: WhatsAppConfig,
    http: reqwest::Client,
}

fn channel_err(message: impl Into<String>) -> ParleyError {
    ParleyError::Channel {
        channel: "whatsapp".into(),
        message: message.into(),
    }
}

impl WhatsAppAdapter {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn messages_url(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(GRAPH_API_URL)
            .trim_end_matches('/');
        format!(
            "{}/{}/{}/messages",
            base, self.config.api_version, self.config.phone_number_id
        )
    }

    async fn post_text(&self, to: &str, body: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.config.access_token)
            .json(&text_payload(to, body))
            .send()
            .await
            .map_err(|e| channel_err(format!("send failed: {e}")))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| channel_err(format!("invalid send response: {e}")))?;

        if !status.is_success() {
            return Err(channel_err(format!(
                "HTTP {}: {}",
                status,
                body["error"]["message"].as_str().unwrap_or("unknown")
            )));
        }

        Ok(body["messages"][0]["id"].as_str().map(str::to_string))
    }
}

fn text_payload(to: &str, body: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {"preview_url": false, "body": body},
    })
}

impl ChannelAdapter for WhatsAppAdapter {
    fn name(&self) -> &str {
        "whatsapp"
    }

    fn send(&self, recipient: &str, text: &str) -> BoxFuture<'_, Result<SendReceipt>> {
        let recipient = recipient.to_string();
        let chunks = split_message(text, WHATSAPP_MAX_LEN);

        Box::pin(async move {
            let mut last_id = None;
            for chunk in &chunks {
                last_id = self.post_text(&recipient, chunk).await?;
            }
            debug!(to = %recipient, chunks = chunks.len(), "WhatsApp message sent");
            Ok(SendReceipt { message_id: last_id })
        })
    }
}

/// Answer the webhook subscription handshake. Returns the challenge to echo
/// back when the mode is `subscribe` and the token matches.
pub fn verify_challenge(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    expected_token: Option<&str>,
) -> Option<String> {
    let expected = expected_token?;
    if mode == Some("subscribe") && token == Some(expected) {
        challenge.map(str::to_string)
    } else {
        None
    }
}

/// Decode a Cloud API webhook payload into inbound events.
///
/// Status callbacks and unsupported message types (media, location, ...)
/// produce no events. Interactive replies use the title the user tapped.
pub fn parse_webhook(payload: &Value) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    let entries = payload["entry"].as_array().map(Vec::as_slice).unwrap_or_default();
    for change in entries.iter().flat_map(|e| {
        e["changes"].as_array().map(Vec::as_slice).unwrap_or_default()
    }) {
        let value = &change["value"];
        let Some(messages) = value["messages"].as_array() else {
            continue;
        };
        let contacts = value["contacts"].as_array().map(Vec::as_slice).unwrap_or_default();

        for msg in messages {
            let (Some(id), Some(from)) = (msg["id"].as_str(), msg["from"].as_str()) else {
                warn!("WhatsApp message without id or sender, skipping");
                continue;
            };
            let kind = msg["type"].as_str().unwrap_or_default();
            let Some((text, reply_id)) = message_text(msg) else {
                debug!(message_id = %id, kind, "Unsupported WhatsApp message type");
                continue;
            };

            let profile_name = contacts
                .iter()
                .find(|c| c["wa_id"].as_str() == Some(from))
                .or_else(|| contacts.first())
                .and_then(|c| c["profile"]["name"].as_str());

            let mut event = InboundEvent::new("whatsapp", from, text)
                .with_id(id)
                .with_metadata(json!({
                    "phoneNumberId": value["metadata"]["phone_number_id"],
                    "displayPhoneNumber": value["metadata"]["display_phone_number"],
                    "type": kind,
                    "replyId": reply_id,
                }));
            if let Some(name) = profile_name {
                event = event.with_profile_name(name);
            }
            if let Some(ts) = parse_timestamp(&msg["timestamp"]) {
                event.timestamp = ts;
            }
            events.push(event);
        }
    }

    events
}

fn message_text(msg: &Value) -> Option<(String, Option<String>)> {
    match msg["type"].as_str()? {
        "text" => Some((msg["text"]["body"].as_str()?.to_string(), None)),
        "button" => Some((msg["button"]["text"].as_str()?.to_string(), None)),
        "interactive" => {
            let interactive = &msg["interactive"];
            let reply = match interactive["type"].as_str()? {
                "button_reply" => &interactive["button_reply"],
                "list_reply" => &interactive["list_reply"],
                _ => return None,
            };
            Some((
                reply["title"].as_str()?.to_string(),
                reply["id"].as_str().map(str::to_string),
            ))
        }
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::String(s) => s.parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WhatsAppConfig {
        serde_json::from_value(json!({
            "access_token": "token",
            "phone_number_id": "1234567890",
            "base_url": "http://localhost:9000/"
        }))
        .unwrap()
    }

    fn payload(message: Value) -> Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {"display_phone_number": "5491100000000", "phone_number_id": "1234567890"},
                        "contacts": [{"profile": {"name": "Ana"}, "wa_id": "5491122334455"}],
                        "messages": [message]
                    }
                }]
            }]
        })
    }

    #[test]
    fn test_messages_url() {
        let adapter = WhatsAppAdapter::new(config());
        assert_eq!(
            adapter.messages_url(),
            "http://localhost:9000/v21.0/1234567890/messages"
        );
    }

    #[test]
    fn test_text_payload_shape() {
        let body = text_payload("5491122334455", "hola");
        assert_eq!(body["messaging_product"], "whatsapp");
        assert_eq!(body["to"], "5491122334455");
        assert_eq!(body["text"]["body"], "hola");
    }

    #[test]
    fn test_parse_text_message() {
        let events = parse_webhook(&payload(json!({
            "from": "5491122334455",
            "id": "wamid.ABC",
            "timestamp": "1717000000",
            "type": "text",
            "text": {"body": "busco harry potter"}
        })));
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.id, "wamid.ABC");
        assert_eq!(event.from, "5491122334455");
        assert_eq!(event.message, "busco harry potter");
        assert_eq!(event.profile_name.as_deref(), Some("Ana"));
        assert_eq!(event.timestamp.timestamp(), 1_717_000_000);
        assert_eq!(event.channel_metadata["phoneNumberId"], "1234567890");
    }

    #[test]
    fn test_parse_interactive_reply() {
        let events = parse_webhook(&payload(json!({
            "from": "5491122334455",
            "id": "wamid.DEF",
            "timestamp": "1717000001",
            "type": "interactive",
            "interactive": {"type": "list_reply", "list_reply": {"id": "isbn-1", "title": "Dune"}}
        })));
        assert_eq!(events[0].message, "Dune");
        assert_eq!(events[0].channel_metadata["replyId"], "isbn-1");
    }

    #[test]
    fn test_statuses_and_media_are_ignored() {
        let statuses = json!({
            "entry": [{"changes": [{"value": {"statuses": [{"id": "wamid.X", "status": "read"}]}}]}]
        });
        assert!(parse_webhook(&statuses).is_empty());

        let image = payload(json!({
            "from": "5491122334455", "id": "wamid.IMG", "type": "image", "image": {"id": "m1"}
        }));
        assert!(parse_webhook(&image).is_empty());
        assert!(parse_webhook(&json!({})).is_empty());
    }

    #[test]
    fn test_verify_challenge() {
        let ok = verify_challenge(Some("subscribe"), Some("secret"), Some("42"), Some("secret"));
        assert_eq!(ok.as_deref(), Some("42"));
        assert!(verify_challenge(Some("subscribe"), Some("wrong"), Some("42"), Some("secret")).is_none());
        assert!(verify_challenge(Some("subscribe"), Some("secret"), Some("42"), None).is_none());
    }
}
