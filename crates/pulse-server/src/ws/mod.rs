//! WebSocket subscription endpoints.
//!
//! The URL path picks the subscriber's filter: `/ws/all` for every table,
//! `/ws/:table` for one table and `/ws/:table/:id` for a single row.

mod socket;

pub use socket::{WsSignals, WsSink};

use axum::{
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    response::Response,
};
use futures::StreamExt;

use crate::connection;
use crate::state::AppState;
use crate::subscription::Filter;

/// Subscribe to changes on every table.
pub async fn ws_all(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, state, Filter::AllTables)
}

/// Subscribe to changes on one table.
pub async fn ws_table(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> Response {
    upgrade(ws, state, Filter::from_segments(Some(&table), None))
}

/// Subscribe to changes on one row.
pub async fn ws_row(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> Response {
    upgrade(ws, state, Filter::from_segments(Some(&table), Some(&id)))
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, filter: Filter) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

async fn handle_socket(socket: WebSocket, state: AppState, filter: Filter) {
    let (sink, stream) = socket.split();
    connection::serve(
        &state.hub,
        filter,
        WsSink(sink),
        WsSignals(stream),
        &state.connection,
        &state.shutdown,
    )
    .await;
}
