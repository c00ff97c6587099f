//! Adapters from an axum [`WebSocket`] to the connection traits.

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use crate::connection::{ControlSignals, Transport, TransportError};

/// Write half of a WebSocket.
pub struct WsSink(pub SplitSink<WebSocket, Message>);

/// Read half of a WebSocket. Only control frames matter; client text is ignored.
pub struct WsSignals(pub SplitStream<WebSocket>);

fn transport_error(e: axum::Error) -> TransportError {
    TransportError::Io(e.to_string())
}

#[async_trait]
impl Transport for WsSink {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(text.to_string()))
            .await
            .map_err(transport_error)
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.0
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(transport_error)
    }

    async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        self.0
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: reason.to_string().into(),
            })))
            .await
            .map_err(transport_error)
    }
}

#[async_trait]
impl ControlSignals for WsSignals {
    async fn closed(&mut self) {
        while let Some(message) = self.0.next().await {
            match message {
                Ok(Message::Close(frame)) => {
                    tracing::trace!(?frame, "peer sent close frame");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "websocket read failed");
                    return;
                }
            }
        }
    }
}
