use crate::{
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Summaries of every live voice session.
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.registry.summaries();
    let max_sessions = state.get_config().streaming.max_concurrent_sessions;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_sessions": sessions.len(),
        "max_sessions": max_sessions,
        "sessions": sessions
    })))
}

/// One session by its server-generated id.
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let session = state
        .registry
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))?;

    Ok(HttpResponse::Ok().json(session.summary()))
}
