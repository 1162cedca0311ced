use std::sync::Arc;
use std::time::Instant;

use actix_web::{dev::Server, get, post, web, App, HttpResponse, HttpServer};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use validator::Validate;

use vigil_common::ApiResponse;

use crate::config::{AsrConfig, QuestionConfig};
use crate::error::{MonitorError, Result};
use crate::inference::QuestionRegistry;

/// User-question intake: the HTTP face of the question registry, fed by an
/// external speech-recognition client.
pub struct AsrState {
    questions: Arc<QuestionRegistry>,
    max_question_length: usize,
    question_timeout_secs: u64,
    started: Instant,
}

#[derive(Debug, Deserialize, Validate)]
struct QuestionRequest {
    #[validate(length(min = 1, max = 500))]
    question: String,
}

#[post("/asr")]
async fn receive_question(
    state: web::Data<AsrState>,
    body: web::Json<QuestionRequest>,
) -> HttpResponse {
    if body.validate().is_err() {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::err(
            "question must be between 1 and 500 characters",
        ));
    }
    let question = body.question.trim().to_string();
    if question.is_empty() || question.len() > state.max_question_length {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::err(format!(
            "question length out of bounds (max {})",
            state.max_question_length
        )));
    }

    let stored = state.questions.set(question);
    HttpResponse::Ok().json(ApiResponse::ok(json!({
        "status": "success",
        "message": "question received",
        "question": stored.text,
        "timestamp": stored.created_at.to_rfc3339(),
    })))
}

#[get("/question/current")]
async fn current_question(state: web::Data<AsrState>) -> HttpResponse {
    let data = match state.questions.current() {
        Some(q) => json!({
            "has_question": true,
            "question": q.text,
            "timestamp": q.created_at.to_rfc3339(),
        }),
        None => json!({
            "has_question": false,
            "question": null,
            "timestamp": null,
        }),
    };
    HttpResponse::Ok().json(ApiResponse::ok(data))
}

#[post("/question/clear")]
async fn clear_question(state: web::Data<AsrState>) -> HttpResponse {
    let cleared = state.questions.clear();
    HttpResponse::Ok().json(ApiResponse::ok(json!({
        "status": "success",
        "message": "question cleared",
        "cleared_question": cleared,
    })))
}

#[get("/health")]
async fn health(state: web::Data<AsrState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "current_question": state.questions.has_question(),
    })))
}

#[get("/stats")]
async fn stats(state: web::Data<AsrState>) -> HttpResponse {
    let current = state.questions.current();
    HttpResponse::Ok().json(ApiResponse::ok(json!({
        "server_status": "running",
        "current_question_exists": current.is_some(),
        "question_timestamp": current.map(|q| q.created_at.to_rfc3339()),
        "question_timeout_seconds": state.question_timeout_secs,
        "max_question_length": state.max_question_length,
        "uptime_seconds": state.started.elapsed().as_secs_f64(),
    })))
}

/// Build the intake server on its own port.
pub fn server(
    asr: &AsrConfig,
    question_config: &QuestionConfig,
    questions: Arc<QuestionRegistry>,
) -> Result<Server> {
    let state = web::Data::new(AsrState {
        questions,
        max_question_length: question_config.max_length,
        question_timeout_secs: question_config.expiry_secs,
        started: Instant::now(),
    });

    info!(host = %asr.host, port = asr.port, "ASR intake listening");
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(receive_question)
            .service(current_question)
            .service(clear_question)
            .service(health)
            .service(stats)
    })
    .bind((asr.host.clone(), asr.port))
    .map_err(|e| MonitorError::ConfigError(format!("ASR bind failed: {e}")))?
    .run();

    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use serde_json::Value;
    use std::time::Duration;

    fn test_state() -> web::Data<AsrState> {
        web::Data::new(AsrState {
            questions: Arc::new(QuestionRegistry::new(Duration::from_secs(300))),
            max_question_length: 500,
            question_timeout_secs: 300,
            started: Instant::now(),
        })
    }

    macro_rules! asr_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .service(receive_question)
                    .service(current_question)
                    .service(clear_question)
                    .service(health)
                    .service(stats),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn post_then_get_round_trips() {
        let state = test_state();
        let app = asr_app!(state);

        let req = test::TestRequest::post()
            .uri("/asr")
            .set_json(json!({ "question": "how many people" }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["question"], "how many people");

        let req = test::TestRequest::get().uri("/question/current").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["has_question"], true);
        assert_eq!(body["data"]["question"], "how many people");
    }

    #[actix_web::test]
    async fn clear_empties_the_slot() {
        let state = test_state();
        let app = asr_app!(state);

        let req = test::TestRequest::post()
            .uri("/asr")
            .set_json(json!({ "question": "anything?" }))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::post().uri("/question/clear").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["cleared_question"], "anything?");

        let req = test::TestRequest::get().uri("/question/current").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["has_question"], false);
    }

    #[actix_web::test]
    async fn oversized_question_is_rejected() {
        let state = test_state();
        let app = asr_app!(state);

        let req = test::TestRequest::post()
            .uri("/asr")
            .set_json(json!({ "question": "x".repeat(501) }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn stats_reflect_slot_state() {
        let state = test_state();
        let app = asr_app!(state);

        let req = test::TestRequest::get().uri("/stats").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["current_question_exists"], false);
        assert_eq!(body["data"]["max_question_length"], 500);
    }
}
