//! WebSocket handling

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use promptdock_protocol::{ClientMessage, ServerMessage};

use crate::chat_session::{ChatPhase, ChatSession, Effect, Input};
use crate::chat_turn::{spawn_turn, TurnEvent, TurnEventKind};
use crate::state::AppState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const INVALID_FORMAT: &str = "Invalid message format";

/// Messages that can be sent through the WebSocket
#[derive(Debug)]
pub(crate) enum OutboundMessage {
    Json(ServerMessage),
    Pong(Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let (turn_tx, mut turn_rx) = mpsc::unbounded_channel::<TurnEvent>();
    let mut conn = ChatConnection::new(conn_id, state, outbound_tx.clone(), turn_tx);

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(
                            component = "websocket",
                            event = "ws.connection.close_frame",
                            connection_id = conn_id,
                            "Client sent close frame"
                        );
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        conn.handle_binary(data.len()).await;
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Err(e)) => {
                        warn!(
                            component = "websocket",
                            event = "ws.connection.error",
                            connection_id = conn_id,
                            error = %e,
                            "WebSocket error"
                        );
                        break;
                    }
                    None => break,
                };
                conn.handle_text(text.as_str()).await;
            }
            Some(event) = turn_rx.recv() => {
                conn.handle_turn_event(event).await;
            }
        }
    }

    conn.teardown();
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// One client's chat: owns its session and routes turn events back to it.
pub(crate) struct ChatConnection {
    conn_id: u64,
    state: Arc<AppState>,
    session: ChatSession,
    outbound: mpsc::Sender<OutboundMessage>,
    turn_tx: mpsc::UnboundedSender<TurnEvent>,
}

impl ChatConnection {
    pub(crate) fn new(
        conn_id: u64,
        state: Arc<AppState>,
        outbound: mpsc::Sender<OutboundMessage>,
        turn_tx: mpsc::UnboundedSender<TurnEvent>,
    ) -> Self {
        let session = ChatSession::new(state.config().chat.session_root.clone());
        Self {
            conn_id,
            state,
            session,
            outbound,
            turn_tx,
        }
    }

    pub(crate) async fn handle_text(&mut self, text: &str) {
        let client_msg: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = self.conn_id,
                    error = %e,
                    payload_bytes = text.len(),
                    payload_preview = %truncate_for_log(text, 240),
                    "Failed to parse client message"
                );
                self.send(ServerMessage::Error(INVALID_FORMAT.into())).await;
                return;
            }
        };

        let input = match client_msg {
            ClientMessage::Start => Input::Start,
            ClientMessage::CloseSession => Input::Close,
            ClientMessage::Chat(prompt) => {
                debug!(
                    component = "websocket",
                    event = "ws.chat.received",
                    connection_id = self.conn_id,
                    prompt_chars = prompt.chars().count(),
                    "Chat prompt received"
                );
                Input::Chat(prompt)
            }
        };
        let effects = self.session.apply(input);
        self.execute(effects).await;
    }

    /// Binary frames are never valid chat messages.
    pub(crate) async fn handle_binary(&mut self, payload_bytes: usize) {
        warn!(
            component = "websocket",
            event = "ws.message.binary_rejected",
            connection_id = self.conn_id,
            payload_bytes,
            "Binary frame rejected"
        );
        self.send(ServerMessage::Error(INVALID_FORMAT.into())).await;
    }

    pub(crate) async fn handle_turn_event(&mut self, event: TurnEvent) {
        match event.kind {
            TurnEventKind::Message(msg) => {
                if self.session.routes(event.generation) {
                    self.send(msg).await;
                }
            }
            TurnEventKind::Finished(outcome) => {
                let effects = self.session.apply(Input::TurnFinished {
                    generation: event.generation,
                    outcome,
                });
                self.execute(effects).await;
            }
        }
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Emit(msg) => self.send(msg).await,
                Effect::RunTurn(request) => {
                    let config = self.state.config();
                    info!(
                        component = "websocket",
                        event = "ws.chat.turn_started",
                        connection_id = self.conn_id,
                        generation = request.generation,
                        history_len = request.history.len(),
                        working_dir = %request.working_dir.display(),
                        "Starting chat turn"
                    );
                    spawn_turn(
                        request,
                        config.chat.worker_command(),
                        config.chat.retry_policy(),
                        self.turn_tx.clone(),
                    );
                }
            }
        }
    }

    async fn send(&self, msg: ServerMessage) {
        let _ = self.outbound.send(OutboundMessage::Json(msg)).await;
    }

    fn teardown(&self) {
        if self.session.phase() == ChatPhase::Responding {
            warn!(
                component = "websocket",
                event = "ws.connection.closed_mid_turn",
                connection_id = self.conn_id,
                generation = self.session.generation(),
                history_len = self.session.history().len(),
                working_dir = ?self.session.working_dir(),
                "Connection closed during a turn; worker left to finish, output discarded"
            );
        }
    }
}
