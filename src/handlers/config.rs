use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Current configuration, with upstream credentials masked.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.config.redacted()
    })))
}
