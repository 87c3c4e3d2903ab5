//! Per-connection WebSocket loop
//!
//! Messages from one client are handled strictly in arrival order; replies
//! go out through a queue drained by a writer task.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::Result;
use crate::signaling::SignalingGateway;

/// Replies queued per connection before the reader waits on the writer
const OUTBOUND_QUEUE: usize = 64;

/// One client connection
pub struct Connection {
    gateway: Arc<SignalingGateway>,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn new(gateway: Arc<SignalingGateway>, peer_addr: SocketAddr) -> Self {
        Self { gateway, peer_addr }
    }

    /// Run the WebSocket handshake and the message loop
    ///
    /// The peer created for this connection is destroyed when the loop ends,
    /// whatever the reason.
    pub async fn run<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws = accept_async(stream).await?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let peer_addr = self.peer_addr;
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    tracing::debug!(peer = %peer_addr, error = %e, "WebSocket send failed");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let (session, welcome) = match self.gateway.open_session().await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!(peer = %peer_addr, error = %e, "Failed to create peer");
                drop(tx);
                let _ = writer.await;
                return Err(e.into());
            }
        };

        tracing::info!(session_id = %session, peer = %peer_addr, "Session opened");

        if tx.send(Message::Text(welcome)).await.is_ok() {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let Some(reply) = self.gateway.handle_message(&session, &text).await
                        else {
                            continue;
                        };
                        if tx.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        tracing::debug!(session_id = %session, bytes = data.len(), "Ignoring binary message");
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(session_id = %session, frame = ?frame, "Close received");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(session_id = %session, error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
        }

        self.gateway.close_session(&session).await;
        drop(tx);
        let _ = writer.await;

        tracing::info!(session_id = %session, peer = %peer_addr, "Session closed");
        Ok(())
    }
}
