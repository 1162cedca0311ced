use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;

use actix_web::{delete, get, post, web, HttpRequest, HttpResponse};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use vigil_common::ApiResponse;

use crate::AppState;

#[derive(Debug, Serialize)]
struct SystemStatus {
    streaming: bool,
    reader: vigil_common::ReaderStatus,
    connected_clients: usize,
    frame_count: u64,
    has_experiment_log: bool,
    session_dir: String,
}

#[get("/api/status")]
async fn get_status(state: web::Data<AppState>) -> HttpResponse {
    let stats = state.stats.snapshot();
    let status = SystemStatus {
        streaming: state.streaming.load(Ordering::Relaxed),
        reader: state.distributor.status(),
        connected_clients: state.ws.connection_count(),
        frame_count: stats.total_frames_received,
        has_experiment_log: state.store.has_experiment_log(),
        session_dir: state.store.session().dir.to_string_lossy().into_owned(),
    };
    HttpResponse::Ok().json(ApiResponse::ok(status))
}

#[get("/api/experiment-log")]
async fn get_experiment_log(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok(state.store.experiment_log()))
}

#[get("/api/inference-history")]
async fn get_inference_history(
    state: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let limit = query
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(50);
    HttpResponse::Ok().json(ApiResponse::ok(state.store.history(limit)))
}

#[get("/api/latest-inference")]
async fn get_latest_inference(state: web::Data<AppState>) -> HttpResponse {
    match state.store.latest_inference() {
        Some(record) => HttpResponse::Ok().json(ApiResponse::ok(record)),
        None => HttpResponse::Ok().json(ApiResponse::<()>::err("no inference results yet")),
    }
}

#[get("/api/latest-inference-with-ai")]
async fn get_latest_inference_with_ai(state: web::Data<AppState>) -> HttpResponse {
    match state.store.latest_inference_with_ai() {
        Some(record) => HttpResponse::Ok().json(ApiResponse::ok(record)),
        None => {
            HttpResponse::Ok().json(ApiResponse::<()>::err("no analytically meaningful results"))
        }
    }
}

#[get("/api/inference-count")]
async fn get_inference_count(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok(json!({
        "count": state.store.inference_count(),
        "session_dir": state.store.session().id,
        "has_experiment_log": state.store.has_experiment_log(),
    })))
}

#[get("/api/media-history")]
async fn get_media_history(
    state: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let limit = query
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(50);
    HttpResponse::Ok().json(ApiResponse::ok(state.store.media_history(limit)))
}

#[get("/api/videos")]
async fn list_videos(state: web::Data<AppState>) -> HttpResponse {
    let names: Vec<String> = state
        .store
        .media_history(usize::MAX)
        .into_iter()
        .filter(|a| a.kind == vigil_common::MediaKind::Video)
        .map(|a| a.file_name())
        .collect();
    HttpResponse::Ok().json(ApiResponse::ok(names))
}

#[get("/api/videos/{filename}")]
async fn serve_video(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
) -> HttpResponse {
    serve_media_file(&state, &path, &req, "video/mp4").await
}

#[get("/api/media/{filename}")]
async fn serve_media(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
) -> HttpResponse {
    let content_type = if path.ends_with(".mp4") {
        "video/mp4"
    } else {
        "image/jpeg"
    };
    serve_media_file(&state, &path, &req, content_type).await
}

#[post("/api/stream/start")]
async fn start_stream(state: web::Data<AppState>) -> HttpResponse {
    state.streaming.store(true, Ordering::Relaxed);
    HttpResponse::Ok().json(ApiResponse::ok(json!({ "message": "stream enabled" })))
}

#[post("/api/stream/stop")]
async fn stop_stream(state: web::Data<AppState>) -> HttpResponse {
    state.streaming.store(false, Ordering::Relaxed);
    HttpResponse::Ok().json(ApiResponse::ok(json!({ "message": "stream disabled" })))
}

#[delete("/api/history")]
async fn clear_history(state: web::Data<AppState>) -> HttpResponse {
    state.store.clear_history();
    HttpResponse::Ok().json(ApiResponse::ok(json!({ "message": "history cleared" })))
}

#[get("/api/sentry/status")]
async fn sentry_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok(json!({
        "enabled": state.scheduler.is_sentry(),
    })))
}

#[post("/api/sentry/toggle")]
async fn sentry_toggle(state: web::Data<AppState>) -> HttpResponse {
    let enabled = state.scheduler.toggle_sentry();
    HttpResponse::Ok().json(ApiResponse::ok(json!({ "enabled": enabled })))
}

#[get("/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": vigil_common::utils::epoch_secs(),
    }))
}

/// Byte-range aware file serving for UI playback.
async fn serve_media_file(
    state: &AppState,
    filename: &str,
    req: &HttpRequest,
    content_type: &str,
) -> HttpResponse {
    let Some(path) = state.store.find_media(filename) else {
        return HttpResponse::NotFound().json(ApiResponse::<()>::err(format!(
            "media not found: {filename}"
        )));
    };

    let total = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            debug!("Media stat failed for {filename}: {e}");
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::err(format!("media read failed: {e}")));
        }
    };

    let range = req
        .headers()
        .get("range")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    let (start, end, partial) = match range {
        Some(range) => match resolve_range(&range, total) {
            Some((start, end)) => (start, end, true),
            None => {
                return HttpResponse::RangeNotSatisfiable()
                    .insert_header(("Content-Range", format!("bytes */{total}")))
                    .finish();
            }
        },
        None => (0, total.saturating_sub(1), false),
    };

    match read_segment(&path, start, end, total).await {
        Ok(body) => {
            let mut builder = if partial {
                let mut b = HttpResponse::PartialContent();
                b.insert_header(("Content-Range", format!("bytes {start}-{end}/{total}")));
                b
            } else {
                HttpResponse::Ok()
            };
            builder
                .insert_header(("Accept-Ranges", "bytes"))
                .insert_header(("Cache-Control", "no-cache"))
                .content_type(content_type.to_string())
                .body(body)
        }
        Err(e) => {
            debug!("Media read failed for {filename}: {e}");
            HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::err(format!("media read failed: {e}")))
        }
    }
}

/// One parsed `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    /// `bytes=START-` or `bytes=START-END`.
    FromTo(u64, Option<u64>),
    /// `bytes=-N`: the last N bytes of the file.
    Suffix(u64),
}

fn parse_range_header(value: &str) -> Option<ByteRange> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    if start.is_empty() {
        return end.parse().ok().map(ByteRange::Suffix);
    }
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some(ByteRange::FromTo(start, end))
}

/// Resolve a parsed range against the file size into inclusive byte bounds.
/// `None` means the range is unsatisfiable (RFC 7233: respond 416).
fn resolve_range(range: &ByteRange, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    match *range {
        ByteRange::FromTo(start, end) => {
            if start >= total {
                return None;
            }
            let end = end.unwrap_or(total - 1).min(total - 1);
            Some((start, end.max(start)))
        }
        ByteRange::Suffix(n) => {
            if n == 0 {
                return None;
            }
            Some((total - n.min(total), total - 1))
        }
    }
}

async fn read_segment(path: &Path, start: u64, end: u64, total: u64) -> std::io::Result<Vec<u8>> {
    if total == 0 {
        return Ok(Vec::new());
    }
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let len = (end - start + 1) as usize;
    let mut body = vec![0u8; len];
    file.read_exact(&mut body).await?;
    Ok(body)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_status)
        .service(get_experiment_log)
        .service(get_inference_history)
        .service(get_latest_inference)
        .service(get_latest_inference_with_ai)
        .service(get_inference_count)
        .service(get_media_history)
        .service(list_videos)
        .service(serve_video)
        .service(serve_media)
        .service(start_stream)
        .service(stop_stream)
        .service(clear_history)
        .service(sentry_status)
        .service(sentry_toggle)
        .service(health);
}
