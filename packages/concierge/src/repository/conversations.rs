use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use tracing::{debug, warn};
use turn_relay::{ConversationSession, ConversationStore, ConversationTurn, Role};

use super::Repository;

impl Repository {
    async fn owned_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Option<ConversationSession>> {
        let row = match session_id {
            Some(id) => {
                sqlx::query(
                    "SELECT id, user_id, last_updated FROM conversation_sessions WHERE id = ? AND user_id = ?",
                )
                .bind(id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, user_id, last_updated FROM conversation_sessions
                    WHERE user_id = ?
                    ORDER BY last_updated DESC, created_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .context("Failed to load conversation session")?;

        Ok(row.map(|r| ConversationSession {
            id: r.get("id"),
            user_id: r.get("user_id"),
            last_updated: r.get("last_updated"),
        }))
    }
}

#[async_trait]
impl ConversationStore for Repository {
    async fn ensure_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<ConversationSession> {
        if let Some(session) = self.owned_session(user_id, session_id).await? {
            debug!(user_id, session_id = %session.id, "Resuming conversation session");
            return Ok(session);
        }
        if let Some(requested) = session_id {
            warn!(user_id, requested, "Requested session not found, starting a new one");
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO conversation_sessions (id, user_id, created_at, last_updated) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create conversation session")?;

        Ok(ConversationSession {
            id,
            user_id: user_id.to_string(),
            last_updated: now,
        })
    }

    async fn append_turn(&self, session_id: &str, role: Role, text: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO conversation_turns (session_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(text)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to append conversation turn")?;

        sqlx::query("UPDATE conversation_sessions SET last_updated = ? WHERE id = ?")
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .context("Failed to touch conversation session")?;

        tx.commit().await?;
        Ok(())
    }

    async fn recent_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let rows = sqlx::query(
            r#"
            SELECT role, content, created_at FROM conversation_turns
            WHERE session_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load conversation history")?;

        let mut turns: Vec<ConversationTurn> = rows
            .into_iter()
            .filter_map(|r| {
                let raw: String = r.get("role");
                let Some(role) = Role::parse(&raw) else {
                    warn!(session_id, role = %raw, "Skipping turn with unknown role");
                    return None;
                };
                Some(ConversationTurn {
                    role,
                    content: r.get("content"),
                    created_at: r.get("created_at"),
                })
            })
            .collect();
        turns.reverse();
        Ok(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers;
    use super::*;

    #[tokio::test]
    async fn new_user_gets_fresh_session() {
        let repo = test_helpers::test_repository().await;
        let session = repo.ensure_session("u-1", None).await.unwrap();
        assert_eq!(session.user_id, "u-1");
        assert!(!session.id.is_empty());
    }

    #[tokio::test]
    async fn explicit_session_is_resumed() {
        let repo = test_helpers::test_repository().await;
        let first = repo.ensure_session("u-1", None).await.unwrap();
        let again = repo.ensure_session("u-1", Some(&first.id)).await.unwrap();
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn missing_session_id_resumes_latest() {
        let repo = test_helpers::test_repository().await;
        let first = repo.ensure_session("u-1", None).await.unwrap();
        repo.append_turn(&first.id, Role::User, "hola").await.unwrap();

        let resumed = repo.ensure_session("u-1", None).await.unwrap();
        assert_eq!(resumed.id, first.id);
    }

    #[tokio::test]
    async fn foreign_session_is_not_resumed() {
        let repo = test_helpers::test_repository().await;
        let theirs = repo.ensure_session("u-1", None).await.unwrap();

        let mine = repo.ensure_session("u-2", Some(&theirs.id)).await.unwrap();
        assert_ne!(mine.id, theirs.id);
        assert_eq!(mine.user_id, "u-2");
    }

    #[tokio::test]
    async fn history_is_last_n_oldest_first() {
        let repo = test_helpers::test_repository().await;
        let session = repo.ensure_session("u-1", None).await.unwrap();
        for (i, role) in [Role::User, Role::Assistant, Role::User, Role::Assistant]
            .into_iter()
            .enumerate()
        {
            repo.append_turn(&session.id, role, &format!("m{}", i))
                .await
                .unwrap();
        }

        let history = repo.recent_history(&session.id, 3).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);
        assert_eq!(history[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn append_to_unknown_session_fails() {
        let repo = test_helpers::test_repository().await;
        assert!(repo.append_turn("missing", Role::User, "hola").await.is_err());
    }
}
