// REST ingest surface for the agent engine: begin a run, emit lifecycle
// events. Delivery to the owner's connections happens through the emitter.
//
// The owning user of a run is always the authenticated caller; nothing in a
// request body can bind a run to, or emit events onto, someone else's
// stream.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use crate::auth::middleware::{require_bearer_auth, AuthenticatedUser};
use crate::error::{ErrorCode, GatewayError};
use crate::run::{DeliveryOutcome, EmitError, EventPayload};
use crate::server::AppState;

pub fn router(state: AppState) -> Router {
    let auth_layer =
        middleware::from_fn_with_state(state.verifier.clone(), require_bearer_auth);

    Router::new()
        .route("/v1/runs", post(begin_run))
        .route("/v1/runs/{run_id}/events", post(emit_event))
        .route_layer(auth_layer)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct BeginRunRequest {
    pub thread_id: Uuid,
    #[serde(default)]
    pub run_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BeginRunResponse {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub seq: i64,
    pub delivery: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum EmitEventRequest {
    Thinking { text: String },
    ExecutingTool {
        invocation_id: Uuid,
        tool_name: String,
        #[serde(default)]
        arguments: Value,
    },
    ToolResult {
        invocation_id: Uuid,
        #[serde(default)]
        output: Value,
    },
    Completed,
}

impl From<EmitEventRequest> for EventPayload {
    fn from(request: EmitEventRequest) -> Self {
        match request {
            EmitEventRequest::Thinking { text } => EventPayload::Thinking { text },
            EmitEventRequest::ExecutingTool { invocation_id, tool_name, arguments } => {
                EventPayload::ExecutingTool { invocation_id, tool_name, arguments }
            }
            EmitEventRequest::ToolResult { invocation_id, output } => {
                EventPayload::ToolResult { invocation_id, output }
            }
            EmitEventRequest::Completed => EventPayload::Completed,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmitEventResponse {
    pub run_id: Uuid,
    pub seq: i64,
    pub delivery: String,
}

pub async fn begin_run(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<BeginRunRequest>,
) -> Response {
    let run_id = payload.run_id.unwrap_or_else(Uuid::new_v4);

    match state.emitter.begin_run(run_id, payload.thread_id, user.user_id).await {
        Ok(emitted) => (
            StatusCode::CREATED,
            Json(BeginRunResponse {
                run_id,
                thread_id: payload.thread_id,
                seq: emitted.seq,
                delivery: delivery_label(emitted.outcome),
            }),
        )
            .into_response(),
        Err(emit_error) => emit_error_response(emit_error),
    }
}

pub async fn emit_event(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<EmitEventRequest>,
) -> Response {
    match state.emitter.runs().owner_of(run_id) {
        None => return GatewayError::from_code(ErrorCode::NotFound).into_response(),
        Some(owner) if owner != user.user_id => {
            error!(
                run_id = %run_id,
                caller = %user.user_id,
                owner = %owner,
                "caller attempted to emit onto another user's run; rejected as an isolation violation"
            );
            return GatewayError::from_code(ErrorCode::AuthForbidden).into_response();
        }
        Some(_) => {}
    }

    match state.emitter.emit(run_id, payload.into()).await {
        Ok(emitted) => Json(EmitEventResponse {
            run_id,
            seq: emitted.seq,
            delivery: delivery_label(emitted.outcome),
        })
        .into_response(),
        Err(emit_error) => emit_error_response(emit_error),
    }
}

fn delivery_label(outcome: DeliveryOutcome) -> String {
    match outcome {
        DeliveryOutcome::Delivered(_) => "delivered".to_string(),
        DeliveryOutcome::Queued => "queued".to_string(),
    }
}

fn emit_error_response(emit_error: EmitError) -> Response {
    let code = match &emit_error {
        EmitError::UnknownRun(_) => ErrorCode::NotFound,
        EmitError::DuplicateRun(_) => ErrorCode::ValidationFailed,
        EmitError::RunCompleted(_) => ErrorCode::RunCompleted,
        EmitError::UnmatchedToolResult { .. } => ErrorCode::ValidationFailed,
    };
    GatewayError::new(code, emit_error.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::{BeginRunResponse, EmitEventResponse};
    use crate::config::GatewayConfig;
    use crate::server::{build_state, AppState};
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn test_app() -> (Router, AppState) {
        let state = build_state(&GatewayConfig::default())
            .await
            .expect("state should build");
        (super::router(state.clone()), state)
    }

    fn token_for(state: &AppState, user_id: Uuid) -> String {
        state.verifier.issue(user_id, &["read", "write"]).expect("token should be issued")
    }

    fn post_json(uri: &str, token: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        serde_json::from_slice(&body).expect("body should be valid json")
    }

    #[tokio::test]
    async fn begin_run_creates_a_run_owned_by_the_caller() {
        let (app, state) = test_app().await;
        let user_id = Uuid::new_v4();
        let token = token_for(&state, user_id);

        let response = app
            .oneshot(post_json("/v1/runs", &token, json!({ "thread_id": Uuid::new_v4() })))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::CREATED);
        let parsed: BeginRunResponse =
            serde_json::from_value(json_body(response).await).expect("response should parse");
        assert_eq!(parsed.seq, 1);
        assert_eq!(parsed.delivery, "queued");
        assert_eq!(state.emitter.runs().owner_of(parsed.run_id), Some(user_id));
    }

    #[tokio::test]
    async fn emit_event_advances_the_run() {
        let (app, state) = test_app().await;
        let user_id = Uuid::new_v4();
        let token = token_for(&state, user_id);
        let run_id = Uuid::new_v4();

        app.clone()
            .oneshot(post_json(
                "/v1/runs",
                &token,
                json!({ "thread_id": Uuid::new_v4(), "run_id": run_id }),
            ))
            .await
            .expect("begin should respond");

        let response = app
            .oneshot(post_json(
                &format!("/v1/runs/{run_id}/events"),
                &token,
                json!({ "stage": "thinking", "text": "pondering" }),
            ))
            .await
            .expect("emit should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let parsed: EmitEventResponse =
            serde_json::from_value(json_body(response).await).expect("response should parse");
        assert_eq!(parsed.seq, 2);
    }

    #[tokio::test]
    async fn emitting_on_another_users_run_is_forbidden() {
        let (app, state) = test_app().await;
        let owner = Uuid::new_v4();
        let attacker = Uuid::new_v4();
        let run_id = Uuid::new_v4();

        app.clone()
            .oneshot(post_json(
                "/v1/runs",
                &token_for(&state, owner),
                json!({ "thread_id": Uuid::new_v4(), "run_id": run_id }),
            ))
            .await
            .expect("begin should respond");

        let response = app
            .oneshot(post_json(
                &format!("/v1/runs/{run_id}/events"),
                &token_for(&state, attacker),
                json!({ "stage": "thinking", "text": "stolen" }),
            ))
            .await
            .expect("emit should respond");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn emitting_on_an_unknown_run_is_not_found() {
        let (app, state) = test_app().await;
        let token = token_for(&state, Uuid::new_v4());

        let response = app
            .oneshot(post_json(
                &format!("/v1/runs/{}/events", Uuid::new_v4()),
                &token,
                json!({ "stage": "completed" }),
            ))
            .await
            .expect("emit should respond");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn emitting_after_completion_conflicts() {
        let (app, state) = test_app().await;
        let user_id = Uuid::new_v4();
        let token = token_for(&state, user_id);
        let run_id = Uuid::new_v4();

        app.clone()
            .oneshot(post_json(
                "/v1/runs",
                &token,
                json!({ "thread_id": Uuid::new_v4(), "run_id": run_id }),
            ))
            .await
            .expect("begin should respond");
        app.clone()
            .oneshot(post_json(
                &format!("/v1/runs/{run_id}/events"),
                &token,
                json!({ "stage": "completed" }),
            ))
            .await
            .expect("complete should respond");

        let response = app
            .oneshot(post_json(
                &format!("/v1/runs/{run_id}/events"),
                &token,
                json!({ "stage": "thinking", "text": "too late" }),
            ))
            .await
            .expect("emit should respond");

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["error"]["code"], "RUN_COMPLETED");
    }

    #[tokio::test]
    async fn unmatched_tool_result_is_a_validation_failure() {
        let (app, state) = test_app().await;
        let token = token_for(&state, Uuid::new_v4());
        let run_id = Uuid::new_v4();

        app.clone()
            .oneshot(post_json(
                "/v1/runs",
                &token,
                json!({ "thread_id": Uuid::new_v4(), "run_id": run_id }),
            ))
            .await
            .expect("begin should respond");

        let response = app
            .oneshot(post_json(
                &format!("/v1/runs/{run_id}/events"),
                &token,
                json!({ "stage": "tool_result", "invocation_id": Uuid::new_v4() }),
            ))
            .await
            .expect("emit should respond");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ingest_requires_authentication() {
        let (app, _state) = test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "thread_id": Uuid::new_v4() }).to_string()))
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
