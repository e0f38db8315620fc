use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use turn_relay::{ProfileFacts, ProfileStore, ProfileUpdate, Specialization};

use super::Repository;

#[async_trait]
impl ProfileStore for Repository {
    async fn get_facts(&self, user_id: &str) -> Result<ProfileFacts> {
        let row = sqlx::query(
            r#"
            SELECT s.name as specialization, p.city, p.region, p.group_id
            FROM profiles p
            LEFT JOIN specializations s ON s.id = p.specialization_id
            WHERE p.user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load profile facts")?;

        Ok(row
            .map(|r| ProfileFacts {
                specialization: r.get("specialization"),
                city: r.get("city"),
                region: r.get("region"),
                group_id: r.get("group_id"),
            })
            .unwrap_or_default())
    }

    async fn apply_update(&self, user_id: &str, update: &ProfileUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let specialization_id = update.specialization.as_ref().map(|s| s.id);
        let city = update.location.as_ref().map(|l| l.city.as_str());
        let region = update.location.as_ref().and_then(|l| l.region.as_deref());

        // A new city always replaces the region, even with none
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, specialization_id, city, region, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                specialization_id = COALESCE(excluded.specialization_id, profiles.specialization_id),
                city = COALESCE(excluded.city, profiles.city),
                region = CASE WHEN excluded.city IS NULL THEN profiles.region ELSE excluded.region END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(specialization_id)
        .bind(city)
        .bind(region)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to update profile")?;

        Ok(())
    }

    async fn find_specialization(&self, name: &str) -> Result<Option<Specialization>> {
        let row = sqlx::query("SELECT id, name FROM specializations WHERE name = ? COLLATE NOCASE")
            .bind(name.trim())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up specialization")?;

        Ok(row.map(|r| Specialization {
            id: r.get("id"),
            name: r.get("name"),
        }))
    }

    async fn list_specializations(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM specializations ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list specializations")?;
        Ok(names)
    }
}
