use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use turn_relay::{ByteStream, ChatMessage, GenerationBackend, RelayError, TurnConfig, TurnDriver};

use crate::AppState;
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::repository::Repository;

/// Replays canned upstream chunks for every request.
pub struct ScriptedBackend {
    chunks: Vec<Result<Bytes, RelayError>>,
}

impl ScriptedBackend {
    pub fn new(chunks: &[String]) -> Self {
        Self {
            chunks: chunks
                .iter()
                .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
                .collect(),
        }
    }

    pub fn then_fail(mut self, err: RelayError) -> Self {
        self.chunks.push(Err(err));
        self
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn open_stream(&self, _messages: &[ChatMessage]) -> Result<ByteStream, RelayError> {
        Ok(futures::stream::iter(self.chunks.clone()).boxed())
    }
}

/// One SSE frame carrying `content` as a chat-completion delta.
pub fn sse_delta(content: &str) -> String {
    let record = serde_json::json!({
        "choices": [{ "index": 0, "delta": { "content": content }, "finish_reason": null }]
    });
    format!("data: {}\n\n", record)
}

pub fn sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}

/// Build a fully-wired `AppState` backed by an in-memory SQLite database and
/// the given backend, with `specializations` seeded.
///
/// Each call returns an isolated database.
pub async fn test_app_state_with(
    backend: Arc<dyn GenerationBackend>,
    specializations: &[&str],
) -> AppState {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    crate::db::run_migrations(&pool).await.expect("migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("pragma");

    let names: Vec<String> = specializations.iter().map(|s| s.to_string()).collect();
    crate::db::seed_specializations(&pool, &names)
        .await
        .expect("seed");

    let db = Arc::new(Database { pool: pool.clone() });
    let repository = Arc::new(Repository::new(pool));
    let turn_config = TurnConfig {
        system_prompt: "Eres un asistente de pruebas.".to_string(),
        ..Default::default()
    };
    let relay_config = Arc::new(turn_config.relay.clone());
    let driver = Arc::new(TurnDriver::new(
        repository.clone(),
        repository.clone(),
        repository.clone(),
        backend,
        turn_config,
    ));

    AppState {
        db,
        driver,
        relay_config,
        metrics: Arc::new(ServerMetrics::new()),
    }
}

/// `test_app_state_with` using a backend that answers with an empty, finished stream.
pub async fn test_app_state() -> AppState {
    let backend = Arc::new(ScriptedBackend::new(&[sse_done()]));
    test_app_state_with(backend, &["Dentista", "Abogado"]).await
}
