//! C8 WebSocket Signaling (spec.md §4.8).
//!
//! Grounded on the teacher's `rust/src/streaming/webrtc_streamer.rs` accept
//! loop shape (`TcpListener` + `tokio_tungstenite::accept_hdr_async`, one
//! spawned task per connection) combined with the chunked-JSON reassembly
//! contract from `examples/original_source/src/app_ws_client.cc`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use crate::config::ConfigRegistry;
use crate::encoder::{DelayedReinitController, EncoderWrapper};
use crate::quality::QualityController;
use crate::session::{FrontEnd, SessionProxy};
use crate::webrtc::WebRtcPeer;

use super::chunked::{ChunkOutcome, ChunkedFrameBuffer};
use super::messages::{ClientCommand, ConfigAction, InnerEnvelope, ServerEnvelope, INNER_TYPE_BYE};

struct SocketState {
    peer_id: Option<String>,
    outbound: UnboundedSender<Message>,
}

/// Whether the accept loop in `handle_connection` should keep reading after
/// `on_message` returns (spec.md §7: a malformed `register` closes the
/// connection; every other `MessageInvalid` just replies with an event).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Continue,
    CloseConnection,
}

/// Process-wide signaling front-end. Owns per-socket outbound senders and
/// the active `WebRtcPeer` keyed by peer id; the single-active-peer
/// invariant itself lives in `SessionProxy` (C7), not here.
pub struct SignalingServer {
    session: Arc<SessionProxy>,
    config: Arc<ConfigRegistry>,
    encoder: Arc<EncoderWrapper>,
    quality: Arc<QualityController>,
    reinit: Arc<DelayedReinitController>,
    device_id: String,
    stun_server: String,
    sockets: Mutex<HashMap<u64, SocketState>>,
    peers: Mutex<HashMap<String, Arc<WebRtcPeer>>>,
    next_socket_id: AtomicU64,
}

impl SignalingServer {
    pub fn new(
        session: Arc<SessionProxy>,
        config: Arc<ConfigRegistry>,
        encoder: Arc<EncoderWrapper>,
        quality: Arc<QualityController>,
        reinit: Arc<DelayedReinitController>,
        device_id: String,
        stun_server: String,
    ) -> Self {
        SignalingServer {
            session,
            config,
            encoder,
            quality,
            reinit,
            device_id,
            stun_server,
            sockets: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            next_socket_id: AtomicU64::new(1),
        }
    }

    pub async fn run(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr, "signaling server listening");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    warn!(error = %e, "websocket connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let socket_id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        info!(socket_id, %peer_addr, "new websocket connection");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        self.sockets.lock().insert(socket_id, SocketState { peer_id: None, outbound: out_tx.clone() });

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut chunked = ChunkedFrameBuffer::new();
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, socket_id, "websocket read error");
                    break;
                }
            };
            let Message::Text(text) = msg else { continue };
            let outcome = Arc::clone(&self).on_message(socket_id, text.as_str(), &mut chunked).await;
            if outcome == MessageOutcome::CloseConnection {
                break;
            }
        }

        self.on_disconnect(socket_id).await;
        writer.abort();
        Ok(())
    }

    /// Takes `Arc<Self>` by value (rather than `&self`) so the `register`
    /// branch can hand a clone off to a spawned task without needing a
    /// self-referential `Weak` field.
    async fn on_message(self: Arc<Self>, socket_id: u64, payload: &str, chunked: &mut ChunkedFrameBuffer) -> MessageOutcome {
        let value = match chunked.feed(payload) {
            ChunkOutcome::Dispatch(v) => v,
            ChunkOutcome::Buffering => return MessageOutcome::Continue,
            ChunkOutcome::Overflowed => {
                warn!(socket_id, "chunk reassembly overflowed, buffer dropped");
                return MessageOutcome::Continue;
            }
        };

        let command = match ClientCommand::from_value(&value) {
            Ok(c) => c,
            Err(e) => {
                warn!(socket_id, error = %e, "message invalid");
                self.send_to_socket(socket_id, ServerEnvelope::error_event(format!("invalid message: {e}")));
                // spec.md §7: a malformed `register` is the one MessageInvalid
                // case that closes the connection rather than just replying.
                if value.get("cmd").and_then(Value::as_str) == Some("register") {
                    return MessageOutcome::CloseConnection;
                }
                return MessageOutcome::Continue;
            }
        };

        match command {
            ClientCommand::Register { room_id, client_id } => {
                self.on_register(socket_id, room_id, client_id).await;
            }
            ClientCommand::Send { msg } => {
                self.on_send(socket_id, msg).await;
            }
            ClientCommand::RequestDeviceId => {
                self.send_to_socket(
                    socket_id,
                    ServerEnvelope::response_ok("deviceid", Value::String(self.device_id.clone())),
                );
            }
            ClientCommand::RequestConfig { data, .. } => {
                self.on_request_config(socket_id, data);
            }
            ClientCommand::Unknown => {
                self.send_to_socket(socket_id, ServerEnvelope::error_event("Unknown Command Type"));
            }
        }
        MessageOutcome::Continue
    }

    async fn on_register(self: Arc<Self>, socket_id: u64, room_id: i64, client_id: i64) {
        let peer_id = client_id.to_string();
        let room_id = room_id.to_string();
        match self.session.obtain(FrontEnd::WebSocket, peer_id.clone(), peer_id.clone(), room_id, socket_id, None) {
            Ok(()) => {
                if let Some(state) = self.sockets.lock().get_mut(&socket_id) {
                    state.peer_id = Some(peer_id.clone());
                }
                info!(socket_id, %peer_id, "session registered");
                let server = Arc::clone(&self);
                let peer_id_for_peer = peer_id.clone();
                tokio::spawn(async move {
                    server.spawn_peer(socket_id, peer_id_for_peer).await;
                });
            }
            Err(e) => {
                warn!(socket_id, error = %e, "register failed, session occupied");
                self.send_to_socket(socket_id, ServerEnvelope::error_event(e.to_string()));
            }
        }
    }

    async fn spawn_peer(self: Arc<Self>, socket_id: u64, peer_id: String) {
        let (ice_tx, mut ice_rx) = mpsc::unbounded_channel::<String>();
        let peer = match WebRtcPeer::new(
            &self.stun_server,
            Arc::clone(&self.encoder),
            Arc::clone(&self.quality),
            Arc::clone(&self.reinit),
            Arc::clone(&self.config),
            ice_tx,
        )
        .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to construct peer connection");
                self.send_to_socket(socket_id, ServerEnvelope::error_event("failed to start streaming session"));
                return;
            }
        };
        self.peers.lock().insert(peer_id.clone(), peer);

        let server = Arc::clone(&self);
        let peer_id_for_ice = peer_id.clone();
        tokio::spawn(async move {
            while let Some(candidate_json) = ice_rx.recv().await {
                let envelope = ServerEnvelope::send(
                    serde_json::json!({"iceCandidate": serde_json::from_str::<Value>(&candidate_json).unwrap_or(Value::Null)}).to_string(),
                );
                server.send_to_peer(&peer_id_for_ice, envelope);
            }
        });
    }

    async fn on_send(&self, socket_id: u64, msg: String) {
        let peer_id = self.sockets.lock().get(&socket_id).and_then(|s| s.peer_id.clone());
        let Some(peer_id) = peer_id else {
            warn!(socket_id, "send command from socket with no registered peer");
            return;
        };
        if !self.session.message_from_peer(&peer_id) {
            return;
        }

        let Ok(inner) = serde_json::from_str::<InnerEnvelope>(&msg) else {
            warn!(socket_id, "send command carried invalid inner JSON");
            self.send_to_socket(socket_id, ServerEnvelope::error_event("Failed to parse Json Message in send command"));
            return;
        };

        if inner.message_type.as_deref() == Some(INNER_TYPE_BYE) {
            self.release_session(&peer_id).await;
            return;
        }

        let Some(peer) = self.peers.lock().get(&peer_id).cloned() else {
            return;
        };

        if let Ok(offer) = serde_json::from_str::<webrtc::peer_connection::sdp::session_description::RTCSessionDescription>(&msg) {
            match peer.handle_offer(offer).await {
                Ok(answer) => {
                    if let Ok(answer_json) = serde_json::to_string(&answer) {
                        self.send_to_socket(socket_id, ServerEnvelope::send(answer_json));
                    }
                }
                Err(e) => warn!(error = %e, "failed to handle offer"),
            }
        } else if let Ok(candidate) = serde_json::from_str::<webrtc::ice_transport::ice_candidate::RTCIceCandidateInit>(&msg) {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!(error = %e, "failed to add ice candidate");
            }
        } else {
            warn!(socket_id, "unrecognized inner send payload");
        }
    }

    fn on_request_config(&self, socket_id: u64, action: ConfigAction) {
        let envelope = match action {
            ConfigAction::Read => ServerEnvelope::response_ok("config", self.config.to_json()),
            ConfigAction::Save => match self.config.save() {
                Ok(()) => ServerEnvelope::response_ok("config", self.config.to_json()),
                Err(e) => ServerEnvelope::response_failed("config", e.to_string()),
            },
            ConfigAction::ResetToDefault => {
                self.config.reset_defaults();
                ServerEnvelope::response_ok("config", self.config.to_json())
            }
            ConfigAction::Apply => {
                self.encoder.apply_media_config(&self.config);
                ServerEnvelope::response_ok("config", self.config.to_json())
            }
            ConfigAction::Patch(patch) => match self.config.patch_from_json(&patch) {
                Ok(_changed) => {
                    self.encoder.apply_media_config(&self.config);
                    ServerEnvelope::response_ok("config", self.config.to_json())
                }
                Err(e) => ServerEnvelope::response_failed("config", e.to_string()),
            },
        };
        self.send_to_socket(socket_id, envelope);
    }

    async fn on_disconnect(&self, socket_id: u64) {
        let peer_id = self.sockets.lock().remove(&socket_id).and_then(|s| s.peer_id);
        if let Some(peer_id) = peer_id {
            self.release_session(&peer_id).await;
        }
        info!(socket_id, "websocket connection closed");
    }

    /// Releases the session iff this socket's peer owns it, and tears down
    /// the associated `WebRtcPeer` and Encoder Adapter (spec.md §4.8
    /// "Disconnect").
    async fn release_session(&self, peer_id: &str) {
        self.session.release(FrontEnd::WebSocket, peer_id);
        if let Some(peer) = self.peers.lock().remove(peer_id) {
            peer.close().await;
        }
    }

    fn send_to_socket(&self, socket_id: u64, envelope: ServerEnvelope) {
        if let Some(state) = self.sockets.lock().get(&socket_id) {
            let _ = state.outbound.send(Message::Text(envelope.to_json_string().into()));
        }
    }

    /// Forwards to the owning front-end (spec.md §4.7 `send_to_peer`).
    fn send_to_peer(&self, peer_id: &str, envelope: ServerEnvelope) {
        let socket_id = self
            .sockets
            .lock()
            .iter()
            .find(|(_, s)| s.peer_id.as_deref() == Some(peer_id))
            .map(|(id, _)| *id);
        if let Some(socket_id) = socket_id {
            self.send_to_socket(socket_id, envelope);
        }
    }
}

/// Connects an already-accepted `WebSocketStream` (used by tests that stand
/// up a connection without going through `run`'s `TcpListener`).
#[allow(dead_code)]
fn _assert_stream_type<S>(_s: WebSocketStream<S>) {}
