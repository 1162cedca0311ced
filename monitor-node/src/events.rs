use serde_json::Value;
use tokio::sync::broadcast;
use vigil_common::InferenceRecord;

/// Events pushed from the pipeline to the delivery surface.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A new record was finalized in the store.
    InferenceResult(InferenceRecord),
    /// Scheduling / ingress status change.
    StatusUpdate(Value),
    /// A recoverable error worth surfacing to UI clients.
    Error(String),
}

pub type EventSender = broadcast::Sender<MonitorEvent>;

pub fn channel() -> EventSender {
    // Slow WS consumers lag and drop rather than backpressure the pipeline.
    broadcast::channel(64).0
}
