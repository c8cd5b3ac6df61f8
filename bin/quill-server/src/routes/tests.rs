use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use quill_core::config::ModelProfile;
use quill_core::engine::{GenerationEngine, ScriptedEngine};
use quill_core::{Settings, ToolDeclaration, ToolRegistry, tool_fn};
use serde_json::{Value, json};
use tower::ServiceExt;
use tracing_test::traced_test;

use super::build;
use crate::config::Config;
use crate::middleware::auth::API_KEY_HEADER;
use crate::middleware::trace::X_TRACE_ID;
use crate::state::AppState;

struct TestApp {
    engine: Arc<ScriptedEngine>,
    state: Arc<AppState>,
}

impl TestApp {
    fn new() -> Self {
        let mut settings = Settings::default();
        let mut second = ModelProfile::new("second");
        second.description = Some("the other one".into());
        settings.models.push(second);
        Self::with_settings(settings)
    }

    fn with_settings(settings: Settings) -> Self {
        Self::with_config(Config::default(), settings)
    }

    fn with_api_key(key: &str) -> Self {
        let config = Config {
            api_key: Some(key.into()),
            ..Config::default()
        };
        Self::with_config(config, Settings::default())
    }

    fn with_config(config: Config, settings: Settings) -> Self {
        let engine = Arc::new(ScriptedEngine::new());
        let shared = engine.clone();
        let state = AppState::with_engines(
            config,
            &settings,
            Arc::new(ToolRegistry::new()),
            move |_| shared.clone() as Arc<dyn GenerationEngine>,
        )
        .expect("valid settings");
        Self {
            engine,
            state: Arc::new(state),
        }
    }

    fn router(&self) -> Router {
        build(Arc::clone(&self.state))
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router().oneshot(request).await.unwrap()
    }

    async fn post(&self, uri: &str, body: Value) -> Response {
        self.send(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// `data:` payloads of an SSE body, in order.
fn sse_payloads(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|frame| frame.trim().strip_prefix("data:"))
        .map(|data| data.trim().to_owned())
        .collect()
}

fn chat_body(stream: bool) -> Value {
    json!({
        "model": "default",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream
    })
}

fn tool_chat_body(stream: bool) -> Value {
    json!({
        "model": "default",
        "messages": [{"role": "user", "content": "look it up"}],
        "stream": stream,
        "tools": [{"type": "function", "function": {
            "name": "lookup",
            "description": "find a fact",
            "parameters": {"type": "object", "properties": {"q": {"type": "string"}}}
        }}]
    })
}

const CALL_FRAGMENTS: [&str; 3] = ["✿FUNCTION✿", ": lookup", "\n✿ARGS✿: {\"q\": \"x\"}"];

// ── Health and tracing ───────────────────────────────────────────────────────

#[tokio::test]
async fn health_assigns_a_trace_id() {
    let app = TestApp::new();
    let response = app.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(X_TRACE_ID));
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn health_reports_models_and_tools() {
    let app = TestApp::new();
    app.state.registry.register(
        ToolDeclaration::new("clock"),
        tool_fn(|_| async move { Ok(json!("noon")) }),
    );
    let body = body_json(app.get("/health").await).await;
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["models"], json!(["default", "second"]));
    assert_eq!(body["tools"], 1);
}

#[tokio::test]
async fn incoming_trace_id_is_echoed() {
    let app = TestApp::new();
    let id = "6f1c3a52-33f6-4c3e-9f53-8d0a5ea3c0de";
    let response = app
        .send(
            Request::get("/health")
                .header(X_TRACE_ID, id)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.headers()[X_TRACE_ID], id);
}

// ── Chat completions ─────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_completion_returns_openai_json() {
    let app = TestApp::new();
    app.engine.queue_with_prompt_tokens(&["Hello", " there"], 4);

    let response = app.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello there");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"], json!({"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}));
}

#[tokio::test]
async fn chat_completion_is_also_served_without_prefix() {
    let app = TestApp::new();
    app.engine.queue(&["ok"]);
    let response = app.post("/chat/completions", chat_body(false)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["choices"][0]["message"]["content"], "ok");
}

#[tokio::test]
async fn streamed_chat_ends_with_done() {
    let app = TestApp::new();
    app.engine.queue(&["a", "b", "c"]);

    let response = app.post("/v1/chat/completions", chat_body(true)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let payloads = sse_payloads(&body_text(response).await);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    let chunks: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    assert_eq!(chunks.len(), 5);
    assert_eq!(chunks[0]["choices"][0]["delta"], json!({"role": "assistant"}));
    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "abc");
    assert_eq!(chunks[4]["choices"][0]["finish_reason"], "stop");
    assert_eq!(chunks[4]["choices"][0]["delta"], json!({}));
}

#[tokio::test]
async fn unregistered_tool_calls_are_redirected() {
    let app = TestApp::new();
    app.engine.queue(&CALL_FRAGMENTS);

    let body = body_json(app.post("/v1/chat/completions", tool_chat_body(false)).await).await;
    let choice = &body["choices"][0];
    assert_eq!(choice["finish_reason"], "tool_calls");
    assert_eq!(choice["message"]["tool_calls"][0]["function"]["name"], "lookup");
    assert_eq!(
        choice["message"]["tool_calls"][0]["function"]["arguments"],
        "{\"q\": \"x\"}"
    );
    assert!(
        choice["message"]["content"]
            .as_str()
            .unwrap()
            .contains("Tool Result for <tool_id>: <tool_result>")
    );
}

#[tokio::test]
async fn registered_tools_are_executed_server_side() {
    let app = TestApp::new();
    app.state.registry.register(
        ToolDeclaration::new("lookup"),
        tool_fn(|_| async move { Ok(json!("found")) }),
    );
    app.engine.queue(&CALL_FRAGMENTS).queue(&["It ", "was ", "found."]);

    let payloads = sse_payloads(&body_text(app.post("/v1/chat/completions", tool_chat_body(true)).await).await);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    let text: String = payloads
        .iter()
        .filter_map(|p| serde_json::from_str::<Value>(p).ok())
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str().map(str::to_owned))
        .collect();
    assert_eq!(text, "It was found.");
    assert!(app.engine.recorded_calls()[1].prompt.contains(": found"));
}

#[tokio::test]
async fn empty_conversation_is_a_bad_request() {
    let app = TestApp::new();
    let response = app
        .post("/v1/chat/completions", json!({"model": "default", "messages": []}))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "no message in chat history");
}

#[tokio::test]
async fn out_of_range_temperature_is_a_bad_request() {
    let app = TestApp::new();
    let mut body = chat_body(false);
    body["temperature"] = json!(3.5);
    let response = app.post("/v1/chat/completions", body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.engine.recorded_calls().is_empty());
}

#[tokio::test]
async fn engine_failure_is_a_gateway_error_without_details() {
    let app = TestApp::new();
    app.engine.queue_status(500, "/models/secret.gguf missing");
    let response = app.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let text = body_text(response).await;
    assert!(!text.contains("secret"));
}

#[tokio::test]
#[traced_test]
async fn failed_stream_stops_without_done() {
    let app = TestApp::new();
    app.engine.queue_status(503, "loading");

    let response = app.post("/v1/chat/completions", chat_body(true)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let payloads = sse_payloads(&body_text(response).await);
    assert_eq!(payloads.len(), 1, "only the role chunk precedes the failure");
    assert!(!payloads.iter().any(|p| p == "[DONE]"));
    assert!(logs_contain("stream failed"));
}

#[tokio::test]
async fn request_model_selects_profile() {
    let mut settings = Settings::default();
    let mut gemma = ModelProfile::new("gemma");
    gemma.template = "gemma".into();
    settings.models.push(gemma);
    let app = TestApp::with_settings(settings);
    app.engine.queue(&["a"]).queue(&["b"]);

    let mut body = chat_body(false);
    body["model"] = json!("gemma");
    app.post("/v1/chat/completions", body).await;
    body = chat_body(false);
    body["model"] = json!("gpt-4o");
    app.post("/v1/chat/completions", body).await;

    let calls = app.engine.recorded_calls();
    assert!(calls[0].prompt.starts_with("<start_of_turn>user"));
    assert!(calls[1].prompt.starts_with("<|im_start|>user"));
}

// ── Completions, models, tools ───────────────────────────────────────────────

#[tokio::test]
async fn raw_completion_round_trip() {
    let app = TestApp::new();
    app.engine.queue(&[" world"]);
    let response = app
        .post("/v1/completions", json!({"model": "default", "prompt": "hello"}))
        .await;
    let body = body_json(response).await;
    assert_eq!(body["object"], "text_completion");
    assert_eq!(body["choices"][0]["text"], " world");
    assert_eq!(app.engine.recorded_calls()[0].prompt, "hello");
}

#[tokio::test]
async fn completion_is_also_served_without_prefix() {
    let app = TestApp::new();
    app.engine.queue(&["!"]);
    let response = app
        .post("/completions", json!({"model": "default", "prompt": "hi"}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["choices"][0]["text"], "!");
}

#[tokio::test]
async fn streamed_completion_ends_with_done() {
    let app = TestApp::new();
    app.engine.queue(&["1", "2"]);
    let response = app
        .post(
            "/v1/completions",
            json!({"model": "default", "prompt": "count", "stream": true}),
        )
        .await;
    let payloads = sse_payloads(&body_text(response).await);
    assert_eq!(payloads.len(), 4);
    assert_eq!(payloads[3], "[DONE]");
}

#[tokio::test]
async fn models_lists_profiles_in_order() {
    let app = TestApp::new();
    let body = body_json(app.get("/v1/models").await).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "default");
    assert_eq!(body["data"][1]["id"], "second");
    assert_eq!(body["data"][1]["description"], "the other one");
    assert_eq!(body["data"][1]["object"], "model");
}

#[tokio::test]
async fn tools_lists_registered_declarations() {
    let app = TestApp::new();
    app.state.registry.register(
        ToolDeclaration::new("clock").with_description("current time"),
        tool_fn(|_| async move { Ok(json!("noon")) }),
    );
    let body = body_json(app.get("/v1/tools").await).await;
    assert_eq!(
        body["data"],
        json!([{"type": "function", "function": {"name": "clock", "description": "current time"}}])
    );
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = TestApp::new();
    let body = body_json(app.get("/api-docs/openapi.json").await).await;
    assert!(body["paths"].get("/v1/chat/completions").is_some());
    assert!(body["paths"].get("/v1/tools").is_some());
}

// ── Deployment routes ────────────────────────────────────────────────────────

fn gemma_app() -> TestApp {
    let mut settings = Settings::default();
    let mut gemma = ModelProfile::new("gemma");
    gemma.template = "gemma".into();
    settings.models.push(gemma);
    TestApp::with_settings(settings)
}

#[tokio::test]
async fn deployment_path_overrides_body_model() {
    let app = gemma_app();
    app.engine.queue(&["a"]);

    let body = json!({"messages": [{"role": "user", "content": "hi"}]});
    let response = app
        .post("/openai/deployments/gemma/chat/completions", body)
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["model"], "gemma");
    assert!(app.engine.recorded_calls()[0].prompt.starts_with("<start_of_turn>user"));
}

#[tokio::test]
async fn deployment_completion_uses_path_model() {
    let app = gemma_app();
    app.engine.queue(&["b"]);

    let response = app
        .post(
            "/openai/deployments/gemma/completions",
            json!({"model": "default", "prompt": "p"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["model"], "gemma");
}

// ── API key ──────────────────────────────────────────────────────────────────

fn keyed_chat(uri: &str, auth: Option<(&str, &str)>) -> Request<Body> {
    let mut request = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some((name, value)) = auth {
        request = request.header(name, value);
    }
    request.body(Body::from(chat_body(false).to_string())).unwrap()
}

#[tokio::test]
async fn missing_or_wrong_key_is_unauthorised() {
    let app = TestApp::with_api_key("s3cret");

    for auth in [None, Some(("authorization", "Bearer nope"))] {
        let response = app.send(keyed_chat("/v1/chat/completions", auth)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await, json!({"error": "unauthorised"}));
    }
    let response = app.send(keyed_chat("/openai/deployments/default/chat/completions", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app.engine.recorded_calls().is_empty());
}

#[tokio::test]
async fn matching_key_is_accepted() {
    let app = TestApp::with_api_key("s3cret");
    app.engine.queue(&["one"]).queue(&["two"]);

    let response = app
        .send(keyed_chat("/v1/chat/completions", Some(("authorization", "Bearer s3cret"))))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .send(keyed_chat("/chat/completions", Some((API_KEY_HEADER, "s3cret"))))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["choices"][0]["message"]["content"], "two");
}

#[tokio::test]
async fn health_stays_open_with_a_key() {
    let app = TestApp::with_api_key("s3cret");
    assert_eq!(app.get("/health").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn openapi_advertises_bearer_auth_when_keyed() {
    let open = body_json(TestApp::new().get("/api-docs/openapi.json").await).await;
    assert!(open.get("security").is_none());
    assert!(open["paths"].get("/openai/deployments/{model}/chat/completions").is_some());

    let keyed = body_json(TestApp::with_api_key("k").get("/api-docs/openapi.json").await).await;
    assert_eq!(keyed["components"]["securitySchemes"]["api_key"]["scheme"], "bearer");
    assert_eq!(keyed["security"], json!([{"api_key": []}]));
}
