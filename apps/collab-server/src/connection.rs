/// One WebSocket client: decode requests, answer them, forward broadcasts
use collab_engine::{ClientMessage, CollaborationEngine, CollaborationError, Connection, Reply};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Inbound frame: a client message plus an optional id echoed on the reply
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub reply: Reply,
}

/// Decode and run one text frame
pub async fn handle_text(
    engine: &CollaborationEngine,
    conn: &mut Connection,
    text: &str,
) -> Response {
    match serde_json::from_str::<Request>(text) {
        Ok(request) => Response {
            request_id: request.request_id,
            reply: engine.handle_message(conn, request.message).await,
        },
        Err(e) => Response {
            request_id: None,
            reply: Reply::from(CollaborationError::Validation(format!(
                "malformed message: {e}"
            ))),
        },
    }
}

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, engine: Arc<CollaborationEngine>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    info!("WebSocket connection established: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Message>();
    let (broadcast_tx, mut broadcast_rx) = mpsc::unbounded_channel();

    // Task to send replies and broadcasts to the client
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = reply_rx.recv() => msg,
                Some(broadcast) = broadcast_rx.recv() => match serde_json::to_string(&broadcast) {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        error!("Failed to serialize broadcast: {}", e);
                        continue;
                    }
                },
                else => break,
            };

            if let Err(e) = ws_sender.send(msg).await {
                debug!("Failed to send message: {}", e);
                break;
            }
        }
    });

    let mut conn = Connection::new(broadcast_tx);

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("Error receiving message from {}: {}", addr, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let response = handle_text(&engine, &mut conn, &text).await;
                match serde_json::to_string(&response) {
                    Ok(json) => {
                        let _ = reply_tx.send(Message::Text(json));
                    }
                    Err(e) => error!("Failed to serialize reply: {}", e),
                }
            }
            Message::Ping(data) => {
                let _ = reply_tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                info!("Client requested close");
                break;
            }
            _ => {}
        }
    }

    // Users stay in their sessions until they leave or go idle
    engine.close_connection(&conn);
    send_task.abort();
    info!("Connection closed: {}", addr);
}
