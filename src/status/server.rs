//! WebSocket status server.
//! Every client gets the current status on connect, then every broadcast
//! `status_update`, and may send `ping` / `get_status` requests.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use super::{ServerMessage, StatusPublisher};
use crate::cancellation::StopFlag;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("failed to bind status server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

fn error_reply(message: impl Into<String>) -> Option<String> {
    Some(json!({ "error": message.into() }).to_string())
}

/// Render the `type` field for the error text. Missing or null is `None`.
fn describe_type(kind: Option<&Value>) -> String {
    match kind {
        None | Some(Value::Null) => "None".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(true)) => "True".to_string(),
        Some(Value::Bool(false)) => "False".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Reply to one client text frame.
pub fn handle_client_message(raw: &str, publisher: &StatusPublisher) -> Option<String> {
    let Ok(Value::Object(msg)) = serde_json::from_str::<Value>(raw) else {
        return error_reply("Invalid JSON format");
    };

    match msg.get("type").and_then(Value::as_str) {
        Some("ping") => ServerMessage::pong().to_json(),
        Some("get_status") => publisher.current_message(),
        _ => error_reply(format!(
            "Unknown message type: {}",
            describe_type(msg.get("type"))
        )),
    }
}

pub struct StatusServer {
    listener: TcpListener,
    publisher: Arc<StatusPublisher>,
}

impl StatusServer {
    pub async fn bind(addr: SocketAddr, publisher: Arc<StatusPublisher>) -> Result<Self, StatusError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StatusError::Bind { addr, source })?;
        Ok(Self {
            listener,
            publisher,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StatusError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `stop` fires.
    pub async fn serve(self, stop: StopFlag) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "status server listening");
        }
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let publisher = self.publisher.clone();
                        let stop = stop.clone();
                        tokio::spawn(async move {
                            info!(%peer, "status client connected");
                            if let Err(e) = serve_client(stream, publisher, stop).await {
                                debug!(%peer, error = %e, "status client error");
                            }
                            info!(%peer, "status client disconnected");
                        });
                    }
                    Err(e) => warn!(error = %e, "status accept failed"),
                },
            }
        }
        info!("status server stopped");
    }
}

async fn serve_client(
    stream: TcpStream,
    publisher: Arc<StatusPublisher>,
    stop: StopFlag,
) -> Result<(), StatusError> {
    let ws = accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    // subscribe first so nothing published after the snapshot is missed
    let mut updates = publisher.subscribe();
    if let Some(status) = publisher.current_message() {
        write.send(Message::Text(status.into())).await?;
    }

    loop {
        tokio::select! {
            _ = stop.stopped() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            update = updates.recv() => match update {
                Ok(json) => write.send(Message::Text(json.into())).await?,
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "status client lagging"),
                Err(RecvError::Closed) => break,
            },
            incoming = read.next() => {
                let raw = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => {
                        String::from_utf8_lossy(bytes.as_slice()).into_owned()
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };
                if let Some(reply) = handle_client_message(&raw, &publisher) {
                    write.send(Message::Text(reply.into())).await?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(raw: &str) -> Value {
        let publisher = StatusPublisher::new();
        serde_json::from_str(&handle_client_message(raw, &publisher).unwrap()).unwrap()
    }

    #[test]
    fn ping_gets_pong() {
        let v = reply(r#"{"type":"ping"}"#);
        assert_eq!(v["type"], "pong");
        assert!(v["timestamp"].as_f64().is_some());
    }

    #[test]
    fn get_status_returns_status_update() {
        let v = reply(r#"{"type":"get_status"}"#);
        assert_eq!(v["type"], "status_update");
        assert_eq!(v["user_present"], false);
    }

    #[test]
    fn unknown_types() {
        assert_eq!(reply(r#"{"type":"dance"}"#)["error"], "Unknown message type: dance");
        assert_eq!(reply(r#"{"hello":1}"#)["error"], "Unknown message type: None");
        assert_eq!(reply(r#"{"type":null}"#)["error"], "Unknown message type: None");
        assert_eq!(reply(r#"{"type":5}"#)["error"], "Unknown message type: 5");
    }

    #[test]
    fn malformed_payloads() {
        assert_eq!(reply("not json")["error"], "Invalid JSON format");
        assert_eq!(reply("[1,2]")["error"], "Invalid JSON format");
        assert_eq!(reply("\"ping\"")["error"], "Invalid JSON format");
    }
}
