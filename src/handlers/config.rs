use crate::{config::AppConfig, error::{AppError, AppResult}, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

fn config_body(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port,
            "ws_path": config.server.ws_path
        },
        "session": {
            "silence_threshold_ms": config.session.silence_threshold_ms,
            "pacing_ms": config.session.pacing_ms,
            "echo_mode": config.session.echo_mode,
            "max_concurrent_sessions": config.session.max_concurrent_sessions
        },
        "heartbeat": {
            "interval_secs": config.heartbeat.interval_secs,
            "timeout_secs": config.heartbeat.timeout_secs
        },
        "logging": {
            "call_log_path": config.logging.call_log_path
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_body(&config)
    })))
}

/// Apply a partial configuration update.
///
/// Server and logging changes only take effect after a restart; session and heartbeat
/// changes apply to calls that connect after the update.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_body(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::TracingReporter;
    use crate::session::SessionRegistry;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn app_state() -> web::Data<AppState> {
        web::Data::new(AppState::new(
            AppConfig::default(),
            SessionRegistry::new(Arc::new(TracingReporter)),
        ))
    }

    #[actix_web::test]
    async fn test_get_and_update_config() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/config", web::get().to(get_config))
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["session"]["silence_threshold_ms"], 2000);

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"session": {"silence_threshold_ms": 1500}}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["updated_config"]["session"]["silence_threshold_ms"], 1500);
        assert_eq!(state.get_config().session.silence_threshold_ms, 1500);
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"session": {"silence_threshold_ms": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().session.silence_threshold_ms, 2000);
    }
}
