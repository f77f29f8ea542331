use crate::{ agent::ChatAgent, models::websocket::{ ClientMessage, ServerMessage } };
use futures::{ SinkExt, StreamExt };
use log::{ debug, info, warn, error };
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::sync::{ broadcast, mpsc };
use tokio_stream::wrappers::{ errors::BroadcastStreamRecvError, BroadcastStream };
use tokio_tungstenite::{ tungstenite::protocol::Message, WebSocketStream };
use uuid::Uuid;

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;

/// Fan-out of persisted messages to every connected feed client.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<ServerMessage>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers received the message.
    pub fn publish(&self, message: ServerMessage) -> usize {
        // only fails when nobody is subscribed
        self.tx.send(message).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.tx.subscribe()
    }
}

fn to_frame(message: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            error!("Failed to encode server message: {}", e);
            None
        }
    }
}

pub(crate) fn error_frame(message: impl Into<String>) -> Option<Message> {
    to_frame(&ServerMessage::Error { message: message.into() })
}

fn spawn_turn(
    agent: Arc<ChatAgent>,
    author: String,
    room_id: i64,
    content: String,
    replies: mpsc::Sender<ServerMessage>
) {
    tokio::spawn(async move {
        // successful turns reach this client through the feed
        if let Err(e) = agent.handle_turn(room_id, &author, &content).await {
            let _ = replies.send(ServerMessage::Error {
                message: format!("Error processing message: {}", e),
            }).await;
        }
    });
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    agent: Arc<ChatAgent>,
    feed: broadcast::Receiver<ServerMessage>,
    author: String
)
    where S: AsyncRead + AsyncWrite + Unpin
{
    info!("New WebSocket connection: {} as {}", peer, author);
    let connection_id = Uuid::new_v4();
    info!("Assigned connection ID {} to {}", connection_id, peer);

    let (mut tx, mut rx) = websocket.split();
    let mut feed = BroadcastStream::new(feed);
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(16);

    loop {
        let outgoing = tokio::select! {
            incoming = rx.next() => {
                match incoming {
                    Some(Ok(message)) => {
                        if message.len() > MAX_MESSAGE_SIZE {
                            warn!(
                                "Message from {} exceeds size limit ({} > {})",
                                peer,
                                message.len(),
                                MAX_MESSAGE_SIZE
                            );
                            if let Some(frame) = error_frame("Message too large") {
                                if tx.send(frame).await.is_err() {
                                    error!("Failed to send size limit error to {}", peer);
                                }
                            }
                            break;
                        }

                        match message {
                            Message::Text(text) => {
                                match serde_json::from_str::<ClientMessage>(&text) {
                                    Ok(ClientMessage::Chat { room_id, content }) => {
                                        spawn_turn(
                                            Arc::clone(&agent),
                                            author.clone(),
                                            room_id,
                                            content,
                                            reply_tx.clone()
                                        );
                                        to_frame(&ServerMessage::Processing)
                                    }
                                    Err(e) => {
                                        error!("Failed to parse message from {}: {}", peer, e);
                                        error_frame(format!("Failed to parse message: {}", e))
                                    }
                                }
                            }
                            Message::Close(_) => {
                                info!("Received close frame from {}", peer);
                                break;
                            }
                            Message::Ping(ping_data) => Some(Message::Pong(ping_data)),
                            Message::Pong(_) => None,
                            Message::Binary(_) => {
                                warn!("Ignoring binary message from {}", peer);
                                None
                            }
                            Message::Frame(_) => None,
                        }
                    }
                    Some(Err(e)) => {
                        match e {
                            | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                            | tokio_tungstenite::tungstenite::Error::Protocol(_)
                            | tokio_tungstenite::tungstenite::Error::Utf8 => {
                                info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                            }
                            tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                                io_err.kind() == std::io::ErrorKind::ConnectionReset
                            => {
                                info!("WebSocket connection reset by peer {}", peer);
                            }
                            tokio_tungstenite::tungstenite::Error::Capacity(ref cap_err) => {
                                error!("WebSocket capacity error for {}: {}", peer, cap_err);
                                if let Some(frame) = error_frame("Server capacity error") {
                                    let _ = tx.send(frame).await;
                                }
                            }
                            _ => {
                                error!("Error receiving message from {}: {}", peer, e);
                            }
                        }
                        break;
                    }
                    None => break,
                }
            }
            item = feed.next() => {
                match item {
                    Some(Ok(message)) => to_frame(&message),
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!("Feed for {} lagged, {} messages skipped", peer, skipped);
                        None
                    }
                    None => {
                        debug!("Feed closed for {}", peer);
                        break;
                    }
                }
            }
            Some(reply) = reply_rx.recv() => to_frame(&reply),
        };

        if let Some(frame) = outgoing {
            if let Err(e) = tx.send(frame).await {
                error!("Error sending message to {}: {}", peer, e);
                break;
            }
        }
    }
    info!("WebSocket connection {} closed for {}", connection_id, peer);
}
