//! # quepasa-store
//!
//! SQLite-backed persistence, split into focused submodules:
//! - `users` — account rows, bcrypt hashes, password-strength gate
//! - `servers` — tenant rows (token, wid, owner, tri-state options)
//! - `dispatching` — per-tenant subscription rows with failure accounting

mod dispatching;
mod servers;
mod users;

pub use servers::TenantRecord;
pub use users::UserRecord;

use quepasa_core::config::DatabaseConfig;
use quepasa_core::error::QpError;
use quepasa_core::options::TriState;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// Persistent store backing the tenant registry.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database and run migrations.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, QpError> {
        let url = config.url()?;

        if let Some(parent) = std::path::Path::new(&config.database).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| QpError::Store(format!("failed to create data dir: {e}")))?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| QpError::Store(format!("invalid db path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| QpError::Store(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;

        info!("store initialized at {}", config.database);

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run SQL migrations, tracking which have already been applied.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), QpError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| QpError::Store(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] =
            &[("001_init", include_str!("../migrations/001_init.sql"))];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| {
                        QpError::Store(format!("failed to check migration {name}: {e}"))
                    })?;

            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| QpError::Store(format!("migration {name} failed: {e}")))?;

            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| QpError::Store(format!("failed to record migration {name}: {e}")))?;
        }
        Ok(())
    }
}

/// Column encoding of a tri-state: -1 false, 0 unset, 1 true.
pub(crate) fn tristate_to_i64(value: TriState) -> i64 {
    match value {
        TriState::True => 1,
        TriState::False => -1,
        TriState::UnSet => 0,
    }
}

pub(crate) fn tristate_from_i64(value: i64) -> TriState {
    match value {
        v if v > 0 => TriState::True,
        v if v < 0 => TriState::False,
        _ => TriState::UnSet,
    }
}
