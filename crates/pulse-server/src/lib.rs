//! Pulse - PostgreSQL change relay
//!
//! This crate relays row changes from PostgreSQL to WebSocket subscribers:
//! - Database triggers publish each row change with `pg_notify`
//! - A [`listener::Listener`] turns notifications into [`pulse_proto::ChangeEvent`]s
//! - The [`hub::Hub`] fans each event out to every subscriber whose filter matches
//! - Slow or broken subscribers are evicted without affecting the others

pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod hub;
pub mod listener;
pub mod registry;
pub mod routes;
pub mod state;
pub mod subscription;
pub mod ws;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};

use axum::{routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the Axum router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .merge(routes::health::routes())
        // Change subscriptions
        .route("/ws/all", get(ws::ws_all))
        .route("/ws/:table", get(ws::ws_table))
        .route("/ws/:table/:id", get(ws::ws_row))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
