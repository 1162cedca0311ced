use std::sync::atomic::Ordering;

use actix_web::{get, web, HttpResponse};
use base64::Engine;
use serde_json::json;

use crate::AppState;

/// Internal endpoints backing the packager path, so no second TCP client to
/// the camera is ever needed. They expose the distributor's latest slot.

#[get("/internal/video/latest-frame")]
async fn latest_frame(state: web::Data<AppState>) -> HttpResponse {
    match state.distributor.latest() {
        Some(frame) => HttpResponse::Ok().json(json!({
            "frame_data": base64::engine::general_purpose::STANDARD.encode(&frame.data),
            "timestamp": frame.epoch_secs(),
            "frame_number": frame.seq,
        })),
        None => HttpResponse::NotFound().json(json!({ "error": "no frame available" })),
    }
}

#[get("/internal/video/status")]
async fn video_status(state: web::Data<AppState>) -> HttpResponse {
    let stats = state.stats.snapshot();
    HttpResponse::Ok().json(json!({
        "streaming": state.streaming.load(Ordering::Relaxed),
        "reader": state.distributor.status(),
        "subscriber_count": state.distributor.subscriber_count(),
        "frame_count": stats.total_frames_received,
        "has_latest_frame": state.distributor.latest().is_some(),
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(latest_frame).service(video_status);
}
