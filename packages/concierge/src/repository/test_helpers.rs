use sqlx::sqlite::SqlitePoolOptions;

/// Create a fresh Repository backed by an in-memory SQLite database.
/// Each call returns an isolated database with all migrations applied.
pub async fn test_repository() -> super::Repository {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("Failed to enable foreign keys");

    super::Repository::new(pool)
}

/// Same as [`test_repository`], with the given vocabulary seeded.
pub async fn seeded_repository(specializations: &[&str]) -> super::Repository {
    let repo = test_repository().await;
    let names: Vec<String> = specializations.iter().map(|s| s.to_string()).collect();
    crate::db::seed_specializations(&repo.pool, &names)
        .await
        .expect("Failed to seed specializations");
    repo
}
