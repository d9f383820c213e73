// backup-ingest/src/restore/verification.rs
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool};
use sqlx::{ConnectOptions, Connection};
use tracing::{debug, info, warn};

use crate::errors::PipelineError;

const CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Waits until a freshly restored database accepts connections.
///
/// The server must list it in `pg_database` with `datallowconn` set, and a
/// direct connection must answer `SELECT 1`. Returns the number of tables in
/// the `public` schema of the restored database.
pub async fn wait_until_online(
    admin_pool: &PgPool,
    connect_options: &PgConnectOptions,
    database: &str,
    timeout: Duration,
) -> Result<i64, PipelineError> {
    let poll = async {
        loop {
            match check_once(admin_pool, connect_options, database).await {
                Ok(Some(tables)) => return tables,
                Ok(None) => debug!("Database '{}' is not accepting connections yet", database),
                Err(e) => warn!("Error checking state of database '{}': {}", database, e),
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    };

    let tables = tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| PipelineError::Timeout {
            operation: format!("waiting for database '{}' to come online", database),
            after: timeout,
        })?;

    if tables == 0 {
        warn!(
            "No tables found in the public schema of restored database '{}'",
            database
        );
    } else {
        info!("Database '{}' is online with {} public tables", database, tables);
    }
    Ok(tables)
}

async fn check_once(
    admin_pool: &PgPool,
    connect_options: &PgConnectOptions,
    database: &str,
) -> Result<Option<i64>, sqlx::Error> {
    let allow_connections: Option<bool> =
        sqlx::query_scalar("SELECT datallowconn FROM pg_database WHERE datname = $1")
            .bind(database)
            .fetch_optional(admin_pool)
            .await?;
    if allow_connections != Some(true) {
        return Ok(None);
    }

    let mut conn = connect_options.clone().database(database).connect().await?;
    let _: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&mut conn).await?;
    let tables: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM pg_catalog.pg_tables WHERE schemaname = 'public'",
    )
    .fetch_one(&mut conn)
    .await?;
    conn.close().await?;
    Ok(Some(tables))
}
