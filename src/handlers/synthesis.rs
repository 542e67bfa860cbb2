use crate::error::{AppError, AppResult};
use crate::session::{start_synthesis, ClientId};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
    /// Id from the `welcome` message of an open `/ws` connection
    pub client_id: String,
}

/// Start a synthesis for a connected gateway client.
///
/// The audio is not part of the response: it streams to the client over its
/// WebSocket, exactly as if the client had sent `synthesize` itself.
pub async fn synthesize(state: web::Data<AppState>, body: web::Json<SynthesizeRequest>) -> AppResult<HttpResponse> {
    let request = body.into_inner();

    let not_connected = || AppError::NotFound(format!("client {} is not connected", request.client_id));
    let client_id = ClientId::parse(&request.client_id).ok_or_else(not_connected)?;
    let events = state.clients.sender(client_id).ok_or_else(not_connected)?;

    let session_id = start_synthesis(&state.sessions, client_id, events, &request.text)?;
    info!(%client_id, %session_id, "synthesis started over HTTP");

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "synthesis started, audio streams over the client's WebSocket",
        "session_id": session_id
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::session::{SessionEvent, SessionKind};
    use crate::upstream::mock::MockConnector;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn post(client_id: &str, text: &str) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/api/v1/tts/synthesize")
            .set_json(json!({"client_id": client_id, "text": text}))
    }

    #[actix_web::test]
    async fn test_synthesize_over_http() {
        let (connector, _accepted) = MockConnector::new();
        connector.hang();
        let state = AppState::new(test_config(), connector).unwrap();

        let client = ClientId::new();
        let (tx, mut events) = mpsc::channel(16);
        state.clients.register(client, tx);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/v1/tts/synthesize", web::post().to(synthesize)),
        )
        .await;

        // Unknown or unparsable client ids.
        let resp = test::call_service(&app, post(&ClientId::new().to_string(), "你好").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = test::call_service(&app, post("not-a-uuid", "你好").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = test::call_service(&app, post(&client.to_string(), "   ").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = test::call_service(&app, post(&client.to_string(), "你好").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], true);
        let session_id = body["session_id"].as_str().unwrap().to_string();

        match events.recv().await.unwrap() {
            SessionEvent::SynthesisStarted { session_id: started } => {
                assert_eq!(started.to_string(), session_id)
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Still connecting upstream, so a second request is single-flighted.
        let resp = test::call_service(&app, post(&client.to_string(), "再见").to_request()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(state.registry().count(SessionKind::Synthesis), 1);

        state.registry().shutdown_all().await;
        assert!(state.registry().is_empty());
    }
}
