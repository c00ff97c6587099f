use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionConfig;
use crate::hub::HubHandle;

/// Application state shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub pool: PgPool,
    pub connection: ConnectionConfig,
    /// Cancelled on server shutdown; each subscriber connection holds a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        hub: HubHandle,
        pool: PgPool,
        connection: ConnectionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub,
            pool,
            connection,
            shutdown,
        }
    }
}
