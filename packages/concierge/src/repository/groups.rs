use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sqlx::Row;
use tracing::info;
use turn_relay::{GroupCandidate, GroupDirectory, SeatHolder};

use super::Repository;

impl Repository {
    async fn group_exists(&self, group_id: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT id FROM groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up group")?;
        Ok(found.is_some())
    }

    async fn seats(&self, group_id: &str) -> Result<Vec<SeatHolder>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, specialization
            FROM group_members
            WHERE group_id = ? AND specialization IS NOT NULL
            ORDER BY joined_at, user_id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load group seats")?;

        Ok(rows
            .into_iter()
            .map(|r| SeatHolder {
                user_id: r.get("user_id"),
                specialization: r.get("specialization"),
            })
            .collect())
    }
}

#[async_trait]
impl GroupDirectory for Repository {
    /// Groups in `location_hint`, busiest first, then newest.
    async fn find_candidates(&self, location_hint: &str) -> Result<Vec<GroupCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT g.id, g.name, g.location, COUNT(m.user_id) as member_count
            FROM groups g
            LEFT JOIN group_members m ON m.group_id = g.id
            WHERE g.location = ? COLLATE NOCASE
            GROUP BY g.id
            ORDER BY member_count DESC, g.created_at DESC, g.id
            "#,
        )
        .bind(location_hint.trim())
        .fetch_all(&self.pool)
        .await
        .context("Failed to find group candidates")?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let seats = self.seats(&id).await?;
            candidates.push(GroupCandidate {
                name: row.get("name"),
                location: row
                    .get::<Option<String>, _>("location")
                    .unwrap_or_default(),
                seats,
                id,
            });
        }
        Ok(candidates)
    }

    async fn assign(&self, user_id: &str, group_id: &str) -> Result<()> {
        if !self.group_exists(group_id).await? {
            bail!("Unknown group {}", group_id);
        }

        let mut tx = self.pool.begin().await?;

        let specialization: Option<String> = sqlx::query_scalar(
            r#"
            SELECT s.name FROM profiles p
            JOIN specializations s ON s.id = p.specialization_id
            WHERE p.user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to load member specialization")?;

        if let Some(spec) = &specialization {
            let holder: Option<String> = sqlx::query_scalar(
                r#"
                SELECT user_id FROM group_members
                WHERE group_id = ? AND specialization = ? COLLATE NOCASE AND user_id != ?
                "#,
            )
            .bind(group_id)
            .bind(spec)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to check seat")?;
            if let Some(holder) = holder {
                bail!(
                    "Seat {} in group {} is held by {}",
                    spec,
                    group_id,
                    holder
                );
            }
        }

        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, group_id, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                group_id = excluded.group_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(group_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .context("Failed to set profile group")?;

        // A member sits in one group at a time
        sqlx::query("DELETE FROM group_members WHERE user_id = ? AND group_id != ?")
            .bind(user_id)
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .context("Failed to leave previous group")?;

        sqlx::query(
            r#"
            INSERT INTO group_members (group_id, user_id, specialization) VALUES (?, ?, ?)
            ON CONFLICT(group_id, user_id) DO UPDATE SET specialization = excluded.specialization
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .bind(&specialization)
        .execute(&mut *tx)
        .await
        .context("Failed to add group member")?;

        tx.commit().await?;

        info!(user_id, group_id, "Assigned member to group");
        Ok(())
    }

    async fn create(&self, name: &str, location_hint: Option<&str>) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let location = location_hint.map(str::trim).filter(|l| !l.is_empty());

        sqlx::query("INSERT INTO groups (id, name, location, created_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(name.trim())
            .bind(location)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .context("Failed to create group")?;

        info!(group_id = %id, name, "Created group");
        Ok(id)
    }

    async fn open_conflict_case(
        &self,
        requester_id: &str,
        group_id: &str,
        incumbent_id: &str,
        proposed_specialization: &str,
    ) -> Result<String> {
        if !self.group_exists(group_id).await? {
            bail!("Unknown group {}", group_id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO conflict_cases (id, requester_id, group_id, incumbent_id, specialization, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(requester_id)
        .bind(group_id)
        .bind(incumbent_id)
        .bind(proposed_specialization)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to open conflict case")?;

        info!(case_id = %id, group_id, requester_id, incumbent_id, "Opened conflict case");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers;
    use super::*;
    use turn_relay::{ProfileStore, ProfileUpdate};

    async fn give_specialization(repo: &Repository, user_id: &str, name: &str) {
        let spec = repo.find_specialization(name).await.unwrap().unwrap();
        repo.apply_update(
            user_id,
            &ProfileUpdate {
                specialization: Some(spec),
                location: None,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn create_then_find_by_location() {
        let repo = test_helpers::test_repository().await;
        let id = repo.create("Centro Norte", Some("Madrid")).await.unwrap();
        repo.create("Triana", Some("Sevilla")).await.unwrap();

        let found = repo.find_candidates("madrid").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
        assert_eq!(found[0].name, "Centro Norte");
        assert!(found[0].seats.is_empty());
    }

    #[tokio::test]
    async fn candidates_rank_busiest_first() {
        let repo = test_helpers::test_repository().await;
        let quiet = repo.create("Quiet", Some("Madrid")).await.unwrap();
        let busy = repo.create("Busy", Some("Madrid")).await.unwrap();
        repo.assign("u-1", &busy).await.unwrap();
        repo.assign("u-2", &busy).await.unwrap();

        let ids: Vec<String> = repo
            .find_candidates("Madrid")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![busy, quiet]);
    }

    #[tokio::test]
    async fn assign_records_seat_and_profile_group() {
        let repo = test_helpers::seeded_repository(&["Dentista"]).await;
        give_specialization(&repo, "u-1", "Dentista").await;
        let group = repo.create("Centro", Some("Madrid")).await.unwrap();

        repo.assign("u-1", &group).await.unwrap();

        let facts = repo.get_facts("u-1").await.unwrap();
        assert_eq!(facts.group_id.as_deref(), Some(group.as_str()));
        let candidate = &repo.find_candidates("Madrid").await.unwrap()[0];
        assert_eq!(
            candidate.incumbent_for("dentista").map(|s| s.user_id.as_str()),
            Some("u-1")
        );
    }

    #[tokio::test]
    async fn assign_rejects_taken_seat() {
        let repo = test_helpers::seeded_repository(&["Dentista"]).await;
        give_specialization(&repo, "u-1", "Dentista").await;
        give_specialization(&repo, "u-2", "Dentista").await;
        let group = repo.create("Centro", Some("Madrid")).await.unwrap();
        repo.assign("u-1", &group).await.unwrap();

        let err = repo.assign("u-2", &group).await.unwrap_err();
        assert!(err.to_string().contains("held by u-1"));
        assert!(repo.get_facts("u-2").await.unwrap().group_id.is_none());
    }

    #[tokio::test]
    async fn reassign_moves_member() {
        let repo = test_helpers::test_repository().await;
        let first = repo.create("Uno", Some("Madrid")).await.unwrap();
        let second = repo.create("Dos", Some("Madrid")).await.unwrap();
        repo.assign("u-1", &first).await.unwrap();
        repo.assign("u-1", &second).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM group_members WHERE user_id = ?")
            .bind("u-1")
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn assign_unknown_group_fails() {
        let repo = test_helpers::test_repository().await;
        assert!(repo.assign("u-1", "missing").await.is_err());
    }

    #[tokio::test]
    async fn conflict_case_does_not_assign() {
        let repo = test_helpers::test_repository().await;
        let group = repo.create("Centro", Some("Madrid")).await.unwrap();

        let case_id = repo
            .open_conflict_case("u-2", &group, "u-1", "Dentista")
            .await
            .unwrap();

        let status: String = sqlx::query_scalar("SELECT status FROM conflict_cases WHERE id = ?")
            .bind(&case_id)
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(status, "open");
        assert!(repo.get_facts("u-2").await.unwrap().group_id.is_none());
    }

    #[tokio::test]
    async fn conflict_case_for_unknown_group_fails() {
        let repo = test_helpers::test_repository().await;
        assert!(
            repo.open_conflict_case("u-2", "missing", "u-1", "Dentista")
                .await
                .is_err()
        );
    }
}
