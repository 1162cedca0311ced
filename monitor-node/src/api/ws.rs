use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::{web, HttpRequest, HttpResponse};
use base64::Engine;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_common::utils::epoch_secs;
use vigil_common::Frame;

use crate::events::MonitorEvent;
use crate::AppState;

/// Outbound WebSocket payload, pre-serialized. Frames are sheddable; events
/// and status are not.
#[derive(Debug, Clone)]
enum Outbound {
    Frame(String),
    Event(String),
}

fn envelope(msg_type: &str, data: Value) -> String {
    json!({
        "type": msg_type,
        "data": data,
        "timestamp": epoch_secs(),
    })
    .to_string()
}

/// Bounded per-connection send queue.
///
/// When full, queued `video_frame` messages are shed first; an incoming
/// frame is dropped outright rather than displace an event.
struct SendQueue {
    inner: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, msg: Outbound) {
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(|m| matches!(m, Outbound::Frame(_))) {
                    queue.remove(pos);
                } else if matches!(msg, Outbound::Frame(_)) {
                    return;
                }
            }
            queue.push_back(msg);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> Outbound {
        loop {
            if let Some(msg) = self.inner.lock().unwrap().pop_front() {
                return msg;
            }
            self.notify.notified().await;
        }
    }
}

struct WsConn {
    queue: Arc<SendQueue>,
    streaming: Arc<AtomicBool>,
}

/// All live WebSocket connections and their per-connection streaming flags.
pub struct WsRegistry {
    conns: DashMap<String, WsConn>,
    queue_capacity: usize,
}

impl WsRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            conns: DashMap::new(),
            queue_capacity,
        }
    }

    fn register(&self, id: String) -> (Arc<SendQueue>, Arc<AtomicBool>) {
        let queue = Arc::new(SendQueue::new(self.queue_capacity));
        let streaming = Arc::new(AtomicBool::new(false));
        self.conns.insert(
            id,
            WsConn {
                queue: Arc::clone(&queue),
                streaming: Arc::clone(&streaming),
            },
        );
        (queue, streaming)
    }

    fn remove(&self, id: &str) {
        self.conns.remove(id);
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn any_streaming(&self) -> bool {
        self.conns
            .iter()
            .any(|c| c.streaming.load(Ordering::Relaxed))
    }

    /// Queue a sheddable frame message on every streaming connection.
    fn broadcast_frame(&self, payload: &str) {
        for conn in self.conns.iter() {
            if conn.streaming.load(Ordering::Relaxed) {
                conn.queue.push(Outbound::Frame(payload.to_string()));
            }
        }
    }

    /// Queue a must-deliver message on every connection.
    pub fn broadcast_event(&self, payload: &str) {
        for conn in self.conns.iter() {
            conn.queue.push(Outbound::Event(payload.to_string()));
        }
    }
}

/// HTTP handler upgrading to WebSocket and spawning the session tasks.
pub async fn ws_route(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (response, session, msg_stream) = actix_ws::handle(&req, body)?;
    actix_web::rt::spawn(ws_session(session, msg_stream, state.into_inner()));
    Ok(response)
}

async fn ws_session(
    session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
    state: Arc<AppState>,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn = %conn_id, "WebSocket connected");
    let (queue, streaming) = state.ws.register(conn_id.clone());

    queue.push(Outbound::Event(envelope(
        "status_update",
        json!({ "message": "connected", "connected": true }),
    )));

    // Sender task: drain the queue into the socket.
    let sender = {
        let mut session = session.clone();
        let queue = Arc::clone(&queue);
        actix_web::rt::spawn(async move {
            loop {
                let msg = queue.pop().await;
                let text = match msg {
                    Outbound::Frame(t) | Outbound::Event(t) => t,
                };
                if session.text(text).await.is_err() {
                    break;
                }
            }
        })
    };

    // Receiver loop: client commands.
    while let Some(result) = msg_stream.next().await {
        match result {
            Ok(actix_ws::Message::Text(text)) => {
                handle_command(&text, &queue, &streaming, &state);
            }
            Ok(actix_ws::Message::Ping(bytes)) => {
                let mut session = session.clone();
                if session.pong(&bytes).await.is_err() {
                    break;
                }
            }
            Ok(actix_ws::Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %conn_id, "WebSocket receive error: {e}");
                break;
            }
        }
    }

    state.ws.remove(&conn_id);
    sender.abort();
    let _ = session.close(None).await;
    info!(conn = %conn_id, "WebSocket disconnected");
}

fn handle_command(
    text: &str,
    queue: &Arc<SendQueue>,
    streaming: &Arc<AtomicBool>,
    state: &Arc<AppState>,
) {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            queue.push(Outbound::Event(envelope(
                "error",
                json!("malformed command"),
            )));
            return;
        }
    };

    match parsed.get("type").and_then(Value::as_str) {
        Some("start_stream") => {
            streaming.store(true, Ordering::Relaxed);
            queue.push(Outbound::Event(envelope(
                "stream_status",
                json!({ "message": "stream started", "streaming": true }),
            )));
        }
        Some("stop_stream") => {
            streaming.store(false, Ordering::Relaxed);
            queue.push(Outbound::Event(envelope(
                "stream_status",
                json!({ "message": "stream stopped", "streaming": false }),
            )));
        }
        Some("get_latest_inference") => {
            let data = state
                .store
                .latest_inference()
                .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
                .unwrap_or(Value::Null);
            queue.push(Outbound::Event(envelope("inference_result", data)));
        }
        other => {
            queue.push(Outbound::Event(envelope(
                "error",
                json!(format!("unknown message type: {other:?}")),
            )));
        }
    }
}

fn frame_payload(frame: &Frame) -> String {
    let data = base64::engine::general_purpose::STANDARD.encode(&frame.data);
    envelope(
        "video_frame",
        json!({
            "data": data,
            "timestamp": frame.epoch_secs(),
            "frame_number": frame.seq,
        }),
    )
}

/// Long-lived pumps feeding the registry: live frames, finalized results,
/// and reader status changes.
pub async fn run_broadcaster(state: Arc<AppState>, cancel: CancellationToken) {
    let frames = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sub = state.distributor.subscribe();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = sub.next(Duration::from_secs(1)) => {
                        let Some(frame) = frame else { continue };
                        if !state.streaming.load(Ordering::Relaxed) || !state.ws.any_streaming() {
                            continue;
                        }
                        state.ws.broadcast_frame(&frame_payload(&frame));
                    }
                }
            }
        })
    };

    let events = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        let mut rx = state.events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(MonitorEvent::InferenceResult(record)) => {
                        let data = serde_json::to_value(&record).unwrap_or(Value::Null);
                        state.ws.broadcast_event(&envelope("inference_result", data));
                    }
                    Ok(MonitorEvent::StatusUpdate(data)) => {
                        state.ws.broadcast_event(&envelope("status_update", data));
                    }
                    Ok(MonitorEvent::Error(message)) => {
                        state.ws.broadcast_event(&envelope("error", json!(message)));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "WebSocket event pump lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let status = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut watch = state.distributor.status_watch();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = watch.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *watch.borrow_and_update();
                        state.ws.broadcast_event(&envelope(
                            "status_update",
                            json!({ "reader": status }),
                        ));
                    }
                }
            }
        })
    };

    cancel.cancelled().await;
    frames.abort();
    events.abort();
    status.abort();
}
