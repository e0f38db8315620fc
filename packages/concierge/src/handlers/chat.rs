use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use turn_relay::{RelayEvent, TurnRequest};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

/// Run one turn and stream it back as server-sent events.
///
/// The turn is cancelled as soon as the client drops the response.
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let user_id = req.user_id.trim();
    if user_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "user_id is required".to_string()));
    }
    if req.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message is required".to_string()));
    }

    let request = TurnRequest {
        user_id: user_id.to_string(),
        session_id: req.session_id.filter(|s| !s.trim().is_empty()),
        message: req.message,
    };
    debug!(user_id = %request.user_id, session_id = ?request.session_id, "Starting chat turn");

    let (tx, rx) = mpsc::channel(state.relay_config.event_buffer);
    let cancel = CancellationToken::new();

    let driver = state.driver.clone();
    let metrics = state.metrics.clone();
    let turn_cancel = cancel.clone();
    metrics.turn_started();
    tokio::spawn(async move {
        let report = driver.run(request, tx, turn_cancel).await;
        metrics.turn_finished(&report);
    });

    // Dropping the response stream drops the guard, which cancels the turn
    let guard = cancel.drop_guard();
    let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok(to_sse_event(event)), (rx, guard)))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

fn to_sse_event(event: RelayEvent) -> Event {
    match event {
        RelayEvent::Session(id) => Event::default().event("session").data(id),
        RelayEvent::Text(content) => {
            Event::default().data(serde_json::json!({ "content": content }).to_string())
        }
        RelayEvent::Done => Event::default().data("[DONE]"),
        RelayEvent::Error(err) => Event::default()
            .event("error")
            .data(serde_json::json!({ "error": err.error }).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedBackend, sse_delta, sse_done, test_app_state_with};
    use axum::{Router, body::Body, http::Request, routing::post};
    use std::sync::Arc;
    use tower::ServiceExt;
    use turn_relay::{APOLOGY_MESSAGE, RelayError};

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/chat", post(chat_handler))
            .with_state(state)
    }

    async fn post_chat(app: Router, body: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_chat_streams_clean_text_and_applies_marker() {
        let backend = Arc::new(ScriptedBackend::new(&[
            sse_delta("Tu especialidad es "),
            sse_delta("[PERFIL:profession_special"),
            sse_delta("ization=Dentista]"),
            sse_done(),
        ]));
        let state = test_app_state_with(backend, &["Dentista"]).await;
        let driver = state.driver.clone();
        let metrics = state.metrics.clone();

        let (status, body) = post_chat(
            router(state),
            r#"{"user_id":"u-1","message":"Soy dentista"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("event: session\n"));
        assert!(body.contains(r#"data: {"content":"Tu especialidad es "}"#));
        assert!(body.contains("data: [DONE]"));
        assert!(!body.contains("PERFIL"));

        let plan = driver.orchestrator().plan("u-1").await.unwrap();
        assert_eq!(plan.facts.specialization.as_deref(), Some("Dentista"));

        // The spawned turn may still be folding its report into the counters
        for _ in 0..50 {
            if metrics.snapshot().turns.completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.turns.completed, 1);
        assert_eq!(snapshot.markers.applied, 1);
    }

    #[tokio::test]
    async fn test_chat_upstream_failure_sends_single_error() {
        let backend = Arc::new(
            ScriptedBackend::new(&[sse_delta("Hola, ")])
                .then_fail(RelayError::UpstreamDisconnect("connection reset".to_string())),
        );
        let state = test_app_state_with(backend, &["Dentista"]).await;

        let (status, body) =
            post_chat(router(state), r#"{"user_id":"u-1","message":"hola"}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.matches("event: error").count(), 1);
        assert!(body.contains(APOLOGY_MESSAGE));
        assert!(!body.contains("connection reset"));
        assert!(!body.contains("[DONE]"));
    }

    #[tokio::test]
    async fn test_chat_resumes_given_session() {
        let backend = Arc::new(ScriptedBackend::new(&[sse_delta("Vale."), sse_done()]));
        let state = test_app_state_with(backend, &["Dentista"]).await;
        let app = router(state);

        let (_, first) =
            post_chat(app.clone(), r#"{"user_id":"u-1","message":"hola"}"#).await;
        let session_id = first
            .lines()
            .nth(1)
            .and_then(|l| l.strip_prefix("data: "))
            .unwrap()
            .to_string();

        let (_, second) = post_chat(
            app,
            &format!(
                r#"{{"user_id":"u-1","session_id":"{}","message":"sigo"}}"#,
                session_id
            ),
        )
        .await;
        assert!(second.contains(&format!("data: {}\n", session_id)));
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_message() {
        let backend = Arc::new(ScriptedBackend::new(&[sse_done()]));
        let state = test_app_state_with(backend, &[]).await;

        let (status, _) =
            post_chat(router(state), r#"{"user_id":"u-1","message":"   "}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_rejects_missing_user() {
        let backend = Arc::new(ScriptedBackend::new(&[sse_done()]));
        let state = test_app_state_with(backend, &[]).await;

        let (status, _) = post_chat(router(state), r#"{"user_id":"","message":"hola"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
