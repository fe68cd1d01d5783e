use crate::{
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Current configuration with API keys redacted.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config.redacted()
    })))
}

/// Apply a partial JSON update to the streaming section.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(updated.clone())
        .map_err(AppError::ValidationError)?;

    tracing::info!(streaming = ?updated.streaming, "Runtime configuration updated");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated.redacted()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{test_state, ScriptedPipeline};
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_update_streaming_settings() {
        let state = test_state(Arc::new(ScriptedPipeline::default()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"streaming": {"response_chunk_size": 1024}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.get_config().streaming.response_chunk_size, 1024);
        assert_eq!(state.response_streamer().chunk_size(), 1024);

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/config").to_request()).await;
        assert_eq!(body["config"]["streaming"]["response_chunk_size"], 1024);
    }

    #[actix_web::test]
    async fn test_secret_updates_are_rejected() {
        let state = test_state(Arc::new(ScriptedPipeline::default()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"pipeline": {"openai_api_key": "sk-test"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.get_config().pipeline.openai_api_key.is_none());
    }
}
