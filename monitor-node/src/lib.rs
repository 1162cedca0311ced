pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod inference;
pub mod processing;
pub mod services;
pub mod stats;
pub mod storage;
pub mod stream;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use config::MonitorConfig;
use events::EventSender;
use inference::{InferenceScheduler, QuestionRegistry};
use stats::PipelineStats;
use storage::ResultStore;
use stream::FrameDistributor;

/// Application state shared across the delivery surface.
pub struct AppState {
    pub config: MonitorConfig,
    pub distributor: Arc<FrameDistributor>,
    pub store: Arc<ResultStore>,
    pub scheduler: Arc<InferenceScheduler>,
    pub questions: Arc<QuestionRegistry>,
    pub stats: Arc<PipelineStats>,
    pub events: EventSender,
    /// Global stream gate driven by the REST start/stop endpoints; the
    /// per-connection flags live in the WS registry.
    pub streaming: AtomicBool,
    pub ws: api::ws::WsRegistry,
}
