//! Database pool, change trigger installation and health checks.

use std::time::Duration;

use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Timeout for the health check ping.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Open the connection pool.
pub async fn connect(config: &ServerConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_max_connections)
        .acquire_timeout(config.pool_acquire_timeout)
        .connect_with(config.connect_options.clone())
        .await?;

    info!(
        max_connections = config.pool_max_connections,
        "connected to database"
    );
    Ok(pool)
}

/// Quote an SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Name of the trigger function that publishes on `channel`.
pub fn notify_function_name(channel: &str) -> String {
    format!("{}_notify", channel)
}

/// Name of the change trigger installed on `table`.
pub fn trigger_name(table: &str) -> String {
    format!("{}_trigger", table)
}

/// `CREATE OR REPLACE FUNCTION` statement for the notify trigger function.
///
/// The function emits `{"operation", "table", "data"}` with the new row for
/// inserts and updates and the old row for deletes.
pub fn notify_function_sql(schema: &str, channel: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {schema}.{function}() RETURNS trigger AS $$
DECLARE
    payload json;
BEGIN
    IF TG_OP = 'DELETE' THEN
        payload := json_build_object('operation', lower(TG_OP), 'table', TG_TABLE_NAME, 'data', row_to_json(OLD));
    ELSE
        payload := json_build_object('operation', lower(TG_OP), 'table', TG_TABLE_NAME, 'data', row_to_json(NEW));
    END IF;
    PERFORM pg_notify('{channel}', payload::text);
    RETURN NULL;
END;
$$ LANGUAGE plpgsql"#,
        schema = quote_ident(schema),
        function = quote_ident(&notify_function_name(channel)),
        channel = channel.replace('\'', "''"),
    )
}

/// Statement dropping an existing change trigger on `table`.
pub fn drop_trigger_sql(schema: &str, table: &str) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {} ON {}.{}",
        quote_ident(&trigger_name(table)),
        quote_ident(schema),
        quote_ident(table)
    )
}

/// Statement creating the change trigger on `table`.
pub fn create_trigger_sql(schema: &str, table: &str, channel: &str) -> String {
    format!(
        "CREATE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {schema}.{} \
         FOR EACH ROW EXECUTE FUNCTION {schema}.{}()",
        quote_ident(&trigger_name(table)),
        quote_ident(table),
        quote_ident(&notify_function_name(channel)),
        schema = quote_ident(schema),
    )
}

/// Install the notify function and a change trigger on every table in `schema`.
///
/// Runs in one transaction; returns the number of tables covered.
pub async fn install_triggers(pool: &PgPool, schema: &str, channel: &str) -> Result<usize> {
    let mut tx = pool.begin().await.map_err(Error::Setup)?;

    sqlx::query(&notify_function_sql(schema, channel))
        .execute(&mut *tx)
        .await
        .map_err(Error::Setup)?;

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT tablename::text FROM pg_tables WHERE schemaname = $1")
            .bind(schema)
            .fetch_all(&mut *tx)
            .await
            .map_err(Error::Setup)?;

    for table in &tables {
        sqlx::query(&drop_trigger_sql(schema, table))
            .execute(&mut *tx)
            .await
            .map_err(Error::Setup)?;
        sqlx::query(&create_trigger_sql(schema, table, channel))
            .execute(&mut *tx)
            .await
            .map_err(Error::Setup)?;
        debug!(schema, table = %table, "installed change trigger");
    }

    tx.commit().await.map_err(Error::Setup)?;

    info!(schema, channel, tables = tables.len(), "change triggers installed");
    Ok(tables.len())
}

/// Database status in a health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
}

/// Health report served by `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub open_connections: u32,
    pub idle: usize,
    pub max_connections: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribers: Option<usize>,
    pub version: &'static str,
}

impl HealthReport {
    /// Whether the database answered the ping.
    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }
}

/// Describe pool utilization.
///
/// More than 80% of the configured maximum in use counts as heavy load.
pub fn pool_message(open: u32, max: u32) -> &'static str {
    if max > 0 && u64::from(open) * 5 > u64::from(max) * 4 {
        "The database is experiencing heavy load."
    } else {
        "It's healthy"
    }
}

/// Ping the database and collect pool statistics.
///
/// `subscribers` is reported as-is; `None` omits it.
pub async fn check_health(pool: &PgPool, subscribers: Option<usize>) -> HealthReport {
    let ping = tokio::time::timeout(
        HEALTH_CHECK_TIMEOUT,
        sqlx::query("SELECT 1").execute(pool),
    )
    .await;

    let open_connections = pool.size();
    let max_connections = pool.options().get_max_connections();

    let (status, message, error) = match ping {
        Ok(Ok(_)) => (
            HealthStatus::Up,
            pool_message(open_connections, max_connections).to_string(),
            None,
        ),
        Ok(Err(e)) => (HealthStatus::Down, "db down".to_string(), Some(e.to_string())),
        Err(_) => (
            HealthStatus::Down,
            "db down".to_string(),
            Some(format!("ping timed out after {:?}", HEALTH_CHECK_TIMEOUT)),
        ),
    };

    HealthReport {
        status,
        message,
        error,
        open_connections,
        idle: pool.num_idle(),
        max_connections,
        subscribers,
        version: env!("CARGO_PKG_VERSION"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_notify_function_sql() {
        let sql = notify_function_sql("public", "pulse_watcher");
        assert!(sql.starts_with(
            "CREATE OR REPLACE FUNCTION \"public\".\"pulse_watcher_notify\"() RETURNS trigger"
        ));
        assert!(sql.contains("pg_notify('pulse_watcher', payload::text)"));
        assert!(sql.contains("'operation', lower(TG_OP)"));
        assert!(sql.contains("row_to_json(OLD)"));
        assert!(sql.contains("row_to_json(NEW)"));
    }

    #[test]
    fn test_trigger_sql() {
        assert_eq!(
            drop_trigger_sql("public", "orders"),
            "DROP TRIGGER IF EXISTS \"orders_trigger\" ON \"public\".\"orders\""
        );
        assert_eq!(
            create_trigger_sql("sales", "Order Items", "pulse_watcher"),
            "CREATE TRIGGER \"Order Items_trigger\" AFTER INSERT OR UPDATE OR DELETE \
             ON \"sales\".\"Order Items\" FOR EACH ROW EXECUTE FUNCTION \
             \"sales\".\"pulse_watcher_notify\"()"
        );
    }

    #[test]
    fn test_pool_message() {
        assert_eq!(pool_message(0, 10), "It's healthy");
        assert_eq!(pool_message(8, 10), "It's healthy");
        assert_eq!(pool_message(9, 10), "The database is experiencing heavy load.");
        assert_eq!(pool_message(41, 50), "The database is experiencing heavy load.");
        assert_eq!(pool_message(3, 0), "It's healthy");
    }

    #[test]
    fn test_health_report_json() {
        let report = HealthReport {
            status: HealthStatus::Down,
            message: "db down".to_string(),
            error: Some("connection refused".to_string()),
            open_connections: 0,
            idle: 0,
            max_connections: 10,
            subscribers: None,
            version: "0.1.0",
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "down");
        assert_eq!(json["error"], "connection refused");
        assert!(json.get("subscribers").is_none());
        assert!(!report.is_up());
    }

    #[tokio::test]
    async fn test_check_health_unreachable_database() {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://pulse@127.0.0.1:1/pulse")
            .unwrap();

        let report = check_health(&pool, Some(3)).await;

        assert_eq!(report.status, HealthStatus::Down);
        assert!(report.error.is_some());
        assert_eq!(report.subscribers, Some(3));
        assert_eq!(report.max_connections, 2);
    }
}
