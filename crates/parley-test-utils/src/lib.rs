//! Mock collaborators and fixtures shared by Parley's tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use parley_core::config::AppConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::flow::FlowDocument;
use parley_core::traits::{ApiClient, ChannelAdapter, LanguageModel, PaymentProvider};
use parley_core::types::*;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

enum Scripted {
    Reply(Completion),
    Fail(String),
    Hang,
}

/// Language model that answers from a queue and records every request.
/// An exhausted queue answers with a collaborator error.
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_text(&self, text: &str) -> &Self {
        lock(&self.script).push_back(Scripted::Reply(Completion::Text(text.into())));
        self
    }

    pub fn push_json(&self, value: Value) -> &Self {
        lock(&self.script).push_back(Scripted::Reply(Completion::Structured(value)));
        self
    }

    pub fn push_error(&self, message: &str) -> &Self {
        lock(&self.script).push_back(Scripted::Fail(message.into()));
        self
    }

    /// The next call never completes.
    pub fn push_hang(&self) -> &Self {
        lock(&self.script).push_back(Scripted::Hang);
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }
}

impl LanguageModel for ScriptedModel {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>> {
        lock(&self.requests).push(request);
        let next = lock(&self.script).pop_front();
        Box::pin(async move {
            match next {
                Some(Scripted::Reply(completion)) => Ok(completion),
                Some(Scripted::Fail(message)) => Err(ParleyError::LlmRequest(message)),
                Some(Scripted::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(ParleyError::LlmRequest("hung call returned".into()))
                }
                None => Err(ParleyError::collaborator("model", "script exhausted")),
            }
        })
    }
}

/// Channel that records outbound messages instead of sending them.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following send fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// `(recipient, text)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }

    pub fn texts(&self) -> Vec<String> {
        lock(&self.sent).iter().map(|(_, text)| text.clone()).collect()
    }
}

impl ChannelAdapter for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, recipient: &str, text: &str) -> BoxFuture<'_, Result<SendReceipt>> {
        let entry = (recipient.to_string(), text.to_string());
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ParleyError::Channel {
                    channel: "recording".into(),
                    message: "send refused".into(),
                });
            }
            let mut sent = lock(&self.sent);
            sent.push(entry);
            Ok(SendReceipt {
                message_id: Some(format!("msg-{}", sent.len())),
            })
        })
    }
}

/// REST client with canned responses per integration. Unregistered
/// integrations are unknown.
#[derive(Default)]
pub struct MockApi {
    responses: Mutex<HashMap<String, ApiResponse>>,
    calls: Mutex<Vec<ApiCall>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, integration: &str, status: u16, body: Value) -> &Self {
        lock(&self.responses).insert(integration.to_string(), ApiResponse { status, body });
        self
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.calls).clone()
    }
}

impl ApiClient for MockApi {
    fn execute(&self, call: ApiCall) -> BoxFuture<'_, Result<ApiResponse>> {
        Box::pin(async move {
            let response = lock(&self.responses).get(&call.integration).cloned();
            let integration = call.integration.clone();
            lock(&self.calls).push(call);
            response.ok_or(ParleyError::UnknownIntegration(integration))
        })
    }
}

/// Payment provider that mints `https://pay.example/<reference>` links.
#[derive(Default)]
pub struct MockPayments {
    requests: Mutex<Vec<PaymentRequest>>,
    minted: AtomicUsize,
}

impl MockPayments {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<PaymentRequest> {
        lock(&self.requests).clone()
    }
}

impl PaymentProvider for MockPayments {
    fn create_link(&self, request: PaymentRequest) -> BoxFuture<'_, Result<PaymentLink>> {
        Box::pin(async move {
            let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
            let link = PaymentLink {
                id: format!("pref-{}", n),
                url: format!("https://pay.example/{}", request.external_reference),
                status: "pending".into(),
            };
            lock(&self.requests).push(request);
            Ok(link)
        })
    }
}

/// An inbound WhatsApp text event with a fixed id.
pub fn event(id: &str, from: &str, message: &str) -> InboundEvent {
    InboundEvent::new("whatsapp", from, message).with_id(id)
}

/// The bookstore flow: extract the title, ask for it when missing, otherwise
/// search the shop and send the results as a list.
///
/// ```text
/// start -> extract -> route --proceed--> search -> reply
///                           \--ask-----> ask
/// ```
pub fn bookstore_flow() -> FlowDocument {
    let doc = json!({
        "id": "books",
        "name": "Librería",
        "version": 1,
        "restartNodeId": "extract",
        "nodes": [
            {"id": "start", "type": "trigger", "data": {"label": "WhatsApp"}},
            {"id": "extract", "type": "gpt_transform", "data": {"config": {
                "systemPrompt": "Sos el asistente de una librería.",
                "fields": [
                    {"name": "titulo", "type": "string", "required": true},
                    {"name": "editorial", "type": "string"},
                    {"name": "edicion", "type": "string"}
                ]
            }}},
            {"id": "route", "type": "router"},
            {"id": "ask", "type": "messenger", "data": {"config": {
                "message": "¿Qué libro estás buscando?"
            }}},
            {"id": "search", "type": "connector", "data": {"config": {
                "integration": "shop",
                "path": "/products",
                "query": {"search": "{{titulo}}"}
            }}},
            {"id": "reply", "type": "messenger", "data": {"config": {
                "message": "Encontré estos libros:\n{{list}}",
                "list": {
                    "source": "search.items",
                    "item": "{{index}}. {{name}} (${{price}})",
                    "empty": "No encontré resultados."
                }
            }}}
        ],
        "edges": [
            {"id": "e1", "source": "start", "target": "extract"},
            {"id": "e2", "source": "extract", "target": "route"},
            {"id": "e3", "source": "route", "target": "search", "sourceHandle": "proceed",
             "data": {"condition": "{{complete}} equals true"}},
            {"id": "e4", "source": "route", "target": "ask", "sourceHandle": "ask"},
            {"id": "e5", "source": "search", "target": "reply"}
        ]
    });
    serde_json::from_value(doc).unwrap_or_else(|e| panic!("bookstore fixture is invalid: {e}"))
}

/// Shop search results for "harry potter".
pub fn harry_potter_results() -> Value {
    json!([
        {"id": 11, "name": "Harry Potter y la piedra filosofal", "price": "15000"},
        {"id": 12, "name": "Harry Potter y la cámara secreta", "price": "16500"}
    ])
}

/// Write a config file into a temp dir and load it.
pub fn load_config(toml_content: &str) -> (tempfile::TempDir, PathBuf, Result<AppConfig>) {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
    let path = dir.path().join("config.toml");
    std::fs::write(&path, toml_content).unwrap_or_else(|e| panic!("write config: {e}"));
    let config = AppConfig::load(&path);
    (dir, path, config)
}
