// Repository layer: each domain lives in its own file and implements one of
// the `turn_relay` collaborator traits on `Repository`.

use sqlx::sqlite::SqlitePool;

mod conversations;
mod groups;
mod profiles;

#[cfg(test)]
pub(crate) mod test_helpers;

#[derive(Clone)]
pub struct Repository {
    pub(crate) pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}
