use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::{debug, info};

use crate::config::DbConfig;

/// Create a connection pool with sensible defaults.
///
/// Runs the environment credential checks before connecting, so a
/// misconfigured production deployment fails here rather than after the
/// first query.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    config.validate_for_environment()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.host()))?;
    Ok(pool)
}

/// Apply schema migrations from `dir`.
///
/// Migrations load at runtime rather than through the `sqlx::migrate!`
/// macro, so building this crate never needs a reachable database.
pub async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("no usable migrations at {}", dir.display()))?;
    let known = migrator.iter().count();

    migrator.run(pool).await.context("migration run failed")?;

    debug!(known, "schema migrations up to date");
    Ok(())
}

/// Create the target database when it is missing.
///
/// Issues `CREATE DATABASE` against the maintenance database up front and
/// treats "already exists" (SQLSTATE 42P04) as success, which sidesteps
/// the check-then-create race. The name is allowlist-validated before it
/// is spliced into the statement; CREATE DATABASE cannot take it as a
/// bind parameter.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let name = config
        .database_name()
        .context("database URL has no database name")?;
    crate::order_by::validate_identifier(name)
        .with_context(|| format!("unsafe database name {name:?}"))?;

    let mut conn = PgConnection::connect(&config.maintenance_url())
        .await
        .with_context(|| format!("maintenance connection to {} failed", config.host()))?;

    let outcome = conn.execute(format!("CREATE DATABASE {name}").as_str()).await;
    let _ = conn.close().await;

    match outcome {
        Ok(_) => {
            info!(db = name, "created project database");
            Ok(())
        }
        Err(e) if is_duplicate_database(&e) => {
            debug!(db = name, "project database already present");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("CREATE DATABASE {name} failed")),
    }
}

/// SQLSTATE 42P04: duplicate_database.
fn is_duplicate_database(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("42P04"),
        _ => false,
    }
}

/// Return the default path to the migrations directory shipped with
/// `maestro-db`.
///
/// At runtime this resolves relative to the `maestro-db` crate's source
/// tree via the `CARGO_MANIFEST_DIR` compile-time env.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
