use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use parley_channels::{parse_webhook, verify_challenge};
use parley_core::error::ParleyError;
use parley_core::flow::FlowDocument;
use parley_core::types::InboundEvent;

use crate::middleware::Authenticated;
use crate::state::AppState;

type ApiError = (StatusCode, Json<Value>);

fn api_error(e: ParleyError) -> ApiError {
    let status = match &e {
        ParleyError::FlowNotFound(_) => StatusCode::NOT_FOUND,
        ParleyError::InvalidFlow { .. } | ParleyError::Json(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "Request failed");
    }
    (status, Json(json!({ "error": e.to_string() })))
}

// GET /api/health: no auth required
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── WhatsApp webhook ────────────────────────────────────────────

#[derive(Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

// GET /webhook/whatsapp: subscription handshake
pub async fn verify_whatsapp(
    State(state): State<Arc<AppState>>,
    Query(q): Query<VerifyQuery>,
) -> Result<String, StatusCode> {
    verify_challenge(
        q.mode.as_deref(),
        q.token.as_deref(),
        q.challenge.as_deref(),
        state.config.verify_token.as_deref(),
    )
    .ok_or(StatusCode::FORBIDDEN)
}

// POST /webhook/whatsapp: one background turn per message, answered at once
pub async fn receive_whatsapp(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> StatusCode {
    let events = parse_webhook(&payload);
    if events.is_empty() {
        return StatusCode::OK;
    }
    let Some(flow_id) = state.default_flow.clone() else {
        warn!(events = events.len(), "No default flow configured, dropping WhatsApp events");
        return StatusCode::OK;
    };

    for event in events {
        let engine = state.engine.clone();
        let flow_id = flow_id.clone();
        tokio::spawn(async move {
            let event_id = event.id.clone();
            let contact = event.from.clone();
            match engine.handle_event(&flow_id, event).await {
                Ok(report) => info!(
                    flow_id = %flow_id,
                    contact = %contact,
                    turn_id = report.turn_id,
                    outcome = ?report.outcome,
                    "Webhook event handled"
                ),
                Err(e) => error!(
                    flow_id = %flow_id,
                    contact = %contact,
                    event_id = %event_id,
                    error = %e,
                    "Webhook event failed"
                ),
            }
        });
    }
    StatusCode::OK
}

// ── Management API ──────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBody {
    pub from: String,
    pub message: String,
    /// Reusing an id replays that event instead of starting a new turn.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub profile_name: Option<String>,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub channel_metadata: Value,
}

fn default_channel() -> String {
    "api".to_string()
}

impl From<EventBody> for InboundEvent {
    fn from(body: EventBody) -> Self {
        let mut event =
            InboundEvent::new(body.channel, body.from, body.message).with_metadata(body.channel_metadata);
        if let Some(id) = body.id {
            event = event.with_id(id);
        }
        if let Some(name) = body.profile_name {
            event = event.with_profile_name(name);
        }
        event
    }
}

// POST /api/flows/{flow}/events: run one turn synchronously
pub async fn post_event(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
    Json(body): Json<EventBody>,
) -> Result<Json<Value>, ApiError> {
    if body.from.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "from must not be empty" })),
        ));
    }
    let report = state
        .engine
        .handle_event(&flow_id, body.into())
        .await
        .map_err(api_error)?;
    Ok(Json(json!(report)))
}

// GET /api/flows
pub async fn list_flows(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let flows = state.engine.flows().list().await.map_err(api_error)?;
    Ok(Json(json!({ "flows": flows })))
}

// PUT /api/flows/{flow}: validate and store a flow document
pub async fn put_flow(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
    Json(mut document): Json<FlowDocument>,
) -> Result<Json<Value>, ApiError> {
    match &document.id {
        Some(id) if *id != flow_id => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("document id '{}' does not match path", id) })),
            ));
        }
        Some(_) => {}
        None => document.id = Some(flow_id.clone()),
    }

    let flow = state.engine.flows().install(document).await.map_err(api_error)?;
    Ok(Json(json!({
        "id": flow.id,
        "version": flow.version,
        "nodes": flow.nodes().len(),
        "edges": flow.edges().len(),
    })))
}

// GET /api/flows/{flow}/conversations/{contact}
pub async fn get_conversation(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((flow_id, contact)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    match state.engine.conversation(&flow_id, &contact).await {
        Ok(Some(conversation)) => Ok(Json(json!(conversation))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )),
        Err(e) => Err(api_error(e)),
    }
}

// DELETE /api/flows/{flow}/conversations/{contact}
pub async fn reset_conversation(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((flow_id, contact)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let existed = state
        .engine
        .reset_conversation(&flow_id, &contact)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "reset": existed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parley_core::config::GatewayConfig;
    use parley_engine::{Collaborators, Engine, EngineSettings};
    use parley_store::MemoryStore;
    use parley_test_utils::{
        bookstore_flow, harry_potter_results, MockApi, MockPayments, RecordingChannel,
        ScriptedModel,
    };

    struct Fixture {
        state: Arc<AppState>,
        model: Arc<ScriptedModel>,
        channel: Arc<RecordingChannel>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let model = ScriptedModel::new();
        let channel = RecordingChannel::new();
        let api = MockApi::new();
        api.respond("shop", 200, harry_potter_results());
        let collaborators = Collaborators {
            model: model.clone(),
            channel: channel.clone(),
            api,
            payments: MockPayments::new(),
        };
        let engine = Engine::new(store.clone(), store, collaborators, EngineSettings::default());
        engine.flows().install(bookstore_flow()).await.unwrap();

        let config = GatewayConfig {
            verify_token: Some("verify-me".into()),
            ..GatewayConfig::default()
        };
        Fixture {
            state: Arc::new(AppState {
                config,
                engine: Arc::new(engine),
                default_flow: Some("books".into()),
            }),
            model,
            channel,
        }
    }

    fn body(id: &str, message: &str) -> EventBody {
        EventBody {
            from: "5491122334455".into(),
            message: message.into(),
            id: Some(id.into()),
            profile_name: None,
            channel: default_channel(),
            channel_metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_verify_handshake() {
        let f = fixture().await;
        let query = |token: &str| VerifyQuery {
            mode: Some("subscribe".into()),
            token: Some(token.into()),
            challenge: Some("1158201444".into()),
        };

        let ok = verify_whatsapp(State(f.state.clone()), Query(query("verify-me"))).await;
        assert_eq!(ok.unwrap(), "1158201444");

        let denied = verify_whatsapp(State(f.state.clone()), Query(query("nope"))).await;
        assert_eq!(denied.unwrap_err(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_post_event_runs_turn() {
        let f = fixture().await;
        f.model.push_json(json!({"titulo": "harry potter"}));

        let Json(report) = post_event(
            Authenticated,
            State(f.state.clone()),
            Path("books".into()),
            Json(body("evt-1", "busco harry potter")),
        )
        .await
        .unwrap();

        assert_eq!(report["outcome"], "completed");
        assert_eq!(report["turnId"], 1);
        assert_eq!(f.channel.sent().len(), 1);

        let Json(conversation) = get_conversation(
            Authenticated,
            State(f.state.clone()),
            Path(("books".into(), "5491122334455".into())),
        )
        .await
        .unwrap();
        assert_eq!(conversation["variables"]["titulo"], "harry potter");
    }

    #[tokio::test]
    async fn test_unknown_flow_is_404() {
        let f = fixture().await;
        let (status, _) = post_event(
            Authenticated,
            State(f.state.clone()),
            Path("nope".into()),
            Json(body("evt-1", "hola")),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reset_conversation() {
        let f = fixture().await;
        f.model.push_json(json!({"titulo": null}));
        post_event(
            Authenticated,
            State(f.state.clone()),
            Path("books".into()),
            Json(body("evt-1", "hola")),
        )
        .await
        .unwrap();

        let path = || Path(("books".to_string(), "5491122334455".to_string()));
        let Json(reset) = reset_conversation(Authenticated, State(f.state.clone()), path())
            .await
            .unwrap();
        assert_eq!(reset["reset"], true);

        let (status, _) = get_conversation(Authenticated, State(f.state.clone()), path())
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_flow_validates() {
        let f = fixture().await;

        let mut doc = bookstore_flow();
        doc.id = None;
        let Json(stored) = put_flow(Authenticated, State(f.state.clone()), Path("books-v2".into()), Json(doc))
            .await
            .unwrap();
        assert_eq!(stored["id"], "books-v2");
        assert_eq!(stored["nodes"], 6);

        let mismatched = bookstore_flow();
        let (status, _) = put_flow(Authenticated, State(f.state.clone()), Path("other".into()), Json(mismatched))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut cyclic = bookstore_flow();
        cyclic.edges[4].target = "extract".into();
        let (status, Json(error)) =
            put_flow(Authenticated, State(f.state.clone()), Path("books".into()), Json(cyclic))
                .await
                .unwrap_err();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(error["error"].as_str().unwrap().contains("books"));
    }

    #[tokio::test]
    async fn test_webhook_spawns_turns() {
        let f = fixture().await;
        f.model.push_json(json!({"titulo": "harry potter"}));

        let payload = json!({
            "entry": [{"changes": [{"value": {
                "metadata": {"phone_number_id": "1234567890"},
                "contacts": [{"profile": {"name": "Ana"}, "wa_id": "5491122334455"}],
                "messages": [{
                    "from": "5491122334455", "id": "wamid.1", "timestamp": "1717000000",
                    "type": "text", "text": {"body": "busco harry potter"}
                }]
            }}]}]
        });
        let status = receive_whatsapp(State(f.state.clone()), Json(payload)).await;
        assert_eq!(status, StatusCode::OK);

        for _ in 0..100 {
            if !f.channel.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.channel.sent().len(), 1);
    }
}
