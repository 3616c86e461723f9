//! Database provisioning for maestro's integration tests.
//!
//! Tests run against disposable databases inside one shared PostgreSQL
//! server. Point `MAESTRO_TEST_PG_URL` at an already-running server to
//! skip container startup (CI setup scripts do this); otherwise the first
//! test in a binary boots a testcontainers instance that lives until the
//! process exits.
//!
//! The unit of isolation is [`TestDb`]: a guard owning one freshly
//! migrated database and a pool into it. Call [`TestDb::close`] at the
//! end of the test; a guard that is merely dropped leaves its database
//! behind on the shared server for post-mortem inspection.

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// The PostgreSQL server every test in this binary shares.
struct Server {
    url: String,
    /// Keeps the container from being reaped mid-run. Absent when an
    /// external server is in use.
    _keepalive: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<Server> = OnceCell::const_new();

async fn server() -> &'static Server {
    SERVER
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("MAESTRO_TEST_PG_URL") {
                return Server {
                    url,
                    _keepalive: None,
                };
            }

            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("could not boot the test PostgreSQL container");
            let host = container.get_host().await.expect("container has no host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container exposes no port 5432");

            Server {
                url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _keepalive: Some(container),
            }
        })
        .await
}

/// Run one admin statement against the server's `postgres` database over
/// a short-lived direct connection. No pool is involved, so nothing can
/// pin the target database open across tests.
async fn admin_exec(statement: &str) {
    let base = &server().await.url;
    let mut conn = PgConnection::connect(&format!("{base}/postgres"))
        .await
        .expect("could not open an admin connection to the test server");
    conn.execute(statement)
        .await
        .unwrap_or_else(|e| panic!("admin statement {statement:?} failed: {e}"));
    let _ = conn.close().await;
}

/// One disposable, fully migrated database.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    /// Provision a fresh uniquely-named database and bring its schema up
    /// to date.
    pub async fn create() -> Self {
        let name = format!("maestro_it_{}", Uuid::new_v4().simple());
        admin_exec(&format!("CREATE DATABASE {name}")).await;

        let url = format!("{}/{name}", server().await.url);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .unwrap_or_else(|e| panic!("could not connect to test database {name}: {e}"));

        maestro_db::pool::run_migrations(&pool, maestro_db::pool::default_migrations_path())
            .await
            .expect("migrations failed on a fresh test database");

        Self { pool, name }
    }

    /// Name of the underlying database, for assertions and inspection.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tear the database down: close the pool, then drop with
    /// `WITH (FORCE)` so any connection the test leaked (live listeners
    /// included) is evicted instead of blocking the drop.
    pub async fn close(self) {
        self.pool.close().await;
        admin_exec(&format!(
            "DROP DATABASE IF EXISTS {} WITH (FORCE)",
            self.name
        ))
        .await;
    }
}
