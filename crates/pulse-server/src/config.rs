//! Server configuration.

use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::connection::ConnectionConfig;
use crate::error::Error;
use crate::hub::HubConfig;
use crate::listener::ListenerConfig;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default notification channel.
pub const DEFAULT_CHANNEL: &str = "pulse_watcher";

/// Default database schema whose tables are watched.
pub const DEFAULT_SCHEMA: &str = "public";

/// Default listener backoff in milliseconds.
pub const DEFAULT_LISTENER_BACKOFF_MS: u64 = 1_000;

/// Default keepalive interval in seconds.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 5;

/// Default per-write deadline in seconds.
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Default time the listener waits for room in the hub's event queue, in milliseconds.
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 5_000;

/// Default capacity of the hub's event queue.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1_024;

/// Default capacity of each subscriber's outbox.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Pulse server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to.
    pub host: String,

    /// Port to bind the HTTP server to.
    pub port: u16,

    /// PostgreSQL connection options.
    pub connect_options: PgConnectOptions,

    /// Schema whose tables get change triggers.
    pub schema: String,

    /// Notification channel the triggers publish on.
    pub channel: String,

    /// Maximum number of pooled database connections.
    pub pool_max_connections: u32,

    /// Timeout when acquiring a pooled connection.
    pub pool_acquire_timeout: Duration,

    /// Delay before the listener retries after a stream failure.
    pub listener_backoff: Duration,

    /// How long the listener waits for room in the hub's event queue.
    pub delivery_timeout: Duration,

    /// Capacity of the hub's event queue.
    pub event_queue_capacity: usize,

    /// Capacity of each subscriber's outbox.
    pub outbox_capacity: usize,

    /// Interval between keepalive pings.
    pub keepalive_interval: Duration,

    /// Deadline for a single write to a subscriber.
    pub write_timeout: Duration,

    /// Skip installing the change triggers at startup.
    pub skip_setup: bool,
}

impl ServerConfig {
    /// Create a new configuration for the given database.
    pub fn new(connect_options: PgConnectOptions) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            connect_options,
            schema: DEFAULT_SCHEMA.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            pool_max_connections: 10,
            pool_acquire_timeout: Duration::from_secs(30),
            listener_backoff: Duration::from_millis(DEFAULT_LISTENER_BACKOFF_MS),
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            skip_setup: false,
        }
    }

    /// Set the listen port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the notification channel.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Set the watched schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the listener backoff.
    pub fn with_listener_backoff(mut self, backoff: Duration) -> Self {
        self.listener_backoff = backoff;
        self
    }

    /// Set how long the listener waits for room in the hub's event queue.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Set the keepalive interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the per-write deadline.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the subscriber outbox capacity.
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    /// Disable trigger installation at startup.
    pub fn without_setup(mut self) -> Self {
        self.skip_setup = true;
        self
    }

    /// Address the HTTP server binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the configuration for values the server cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if !is_identifier(&self.channel) {
            return Err(Error::Config(format!(
                "channel {:?} is not a valid identifier",
                self.channel
            )));
        }
        if !is_identifier(&self.schema) {
            return Err(Error::Config(format!(
                "schema {:?} is not a valid identifier",
                self.schema
            )));
        }
        if self.pool_max_connections < 2 {
            // One connection is held by the listener for its whole lifetime.
            return Err(Error::Config(
                "pool_max_connections must be at least 2".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 || self.outbox_capacity == 0 {
            return Err(Error::Config("queue capacities must be non-zero".to_string()));
        }
        if self.listener_backoff.is_zero()
            || self.keepalive_interval.is_zero()
            || self.write_timeout.is_zero()
            || self.delivery_timeout.is_zero()
        {
            return Err(Error::Config("intervals and timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Listener settings derived from this configuration.
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            channel: self.channel.clone(),
            backoff: self.listener_backoff,
            delivery_timeout: self.delivery_timeout,
        }
    }

    /// Hub settings derived from this configuration.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            event_queue_capacity: self.event_queue_capacity,
            outbox_capacity: self.outbox_capacity,
        }
    }

    /// Per-connection settings derived from this configuration.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            keepalive_interval: self.keepalive_interval,
            write_timeout: self.write_timeout,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            PgConnectOptions::new()
                .host("localhost")
                .port(5432)
                .database("postgres"),
        )
    }
}

/// A plain SQL identifier: ASCII letters, digits and underscores, not starting with a digit.
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Command-line arguments for the server.
///
/// Database settings fall back to the `DB_*` environment variables, which may
/// also come from a `.env` file.
#[derive(Parser, Debug)]
#[command(name = "pulse-server")]
#[command(version, about = "Relays PostgreSQL row changes to WebSocket subscribers", long_about = None)]
pub struct Args {
    /// Address to bind to.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Full database URL. Overrides the individual DB_* settings.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Database host.
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// Database port.
    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    /// Database name.
    #[arg(long, env = "DB_DATABASE", default_value = "postgres")]
    pub db_database: String,

    /// Database user.
    #[arg(long, env = "DB_USERNAME", default_value = "postgres")]
    pub db_username: String,

    /// Database password.
    #[arg(long, env = "DB_PASSWORD", default_value = "", hide_env_values = true)]
    pub db_password: String,

    /// Schema whose tables are watched.
    #[arg(long, env = "DB_SCHEMA", default_value = DEFAULT_SCHEMA)]
    pub db_schema: String,

    /// Notification channel name.
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Maximum pooled database connections.
    #[arg(long, default_value_t = 10)]
    pub max_connections: u32,

    /// Listener backoff after a stream failure, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_LISTENER_BACKOFF_MS)]
    pub listener_backoff_ms: u64,

    /// Capacity of the hub's event queue.
    #[arg(long, default_value_t = DEFAULT_EVENT_QUEUE_CAPACITY)]
    pub event_queue: usize,

    /// Events buffered per subscriber before it is evicted as too slow.
    #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox: usize,

    /// Keepalive ping interval in seconds.
    #[arg(long, default_value_t = DEFAULT_KEEPALIVE_SECS)]
    pub keepalive: u64,

    /// How long to wait for room in the hub's event queue before dropping an event, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_DELIVERY_TIMEOUT_MS)]
    pub delivery_timeout_ms: u64,

    /// Per-write deadline in seconds.
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT_SECS)]
    pub write_timeout: u64,

    /// Don't install change triggers at startup.
    #[arg(long)]
    pub skip_setup: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Connection options from `--database-url`, or built from the DB_* settings.
    ///
    /// The DB_* settings are passed to the driver as-is, so passwords need no escaping.
    /// The schema becomes the session's `search_path`.
    pub fn connect_options(&self) -> Result<PgConnectOptions, Error> {
        match &self.database_url {
            Some(url) => PgConnectOptions::from_str(url)
                .map_err(|e| Error::Config(format!("invalid database URL: {}", e))),
            None => Ok(PgConnectOptions::new()
                .host(&self.db_host)
                .port(self.db_port)
                .username(&self.db_username)
                .password(&self.db_password)
                .database(&self.db_database)
                .ssl_mode(PgSslMode::Disable)
                .options([("search_path", self.db_schema.as_str())])),
        }
    }

    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> Result<ServerConfig, Error> {
        let connect_options = self.connect_options()?;

        Ok(ServerConfig {
            host: self.host,
            port: self.port,
            connect_options,
            schema: self.db_schema,
            channel: self.channel,
            pool_max_connections: self.max_connections,
            listener_backoff: Duration::from_millis(self.listener_backoff_ms),
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            event_queue_capacity: self.event_queue,
            outbox_capacity: self.outbox,
            keepalive_interval: Duration::from_secs(self.keepalive),
            write_timeout: Duration::from_secs(self.write_timeout),
            skip_setup: self.skip_setup,
            ..ServerConfig::default()
        })
    }
}
