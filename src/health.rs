use crate::config::AppConfig;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let active_sessions = state.registry.len();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "ws_path": config.server.ws_path
        },
        "sessions": session_status(&config, active_sessions),
        "connections": state.registry.connection_ids()
    }))
}

fn session_status(config: &AppConfig, active_sessions: usize) -> serde_json::Value {
    let limit = config.session.max_concurrent_sessions;
    let usage = if limit > 0 {
        active_sessions as f64 / limit as f64
    } else {
        0.0
    };

    let load = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "active": active_sessions,
        "max_concurrent_sessions": limit,
        "usage_percent": (usage * 100.0).round(),
        "load": load,
        "echo_mode": config.session.echo_mode,
        "silence_threshold_ms": config.session.silence_threshold_ms,
        "pacing_ms": config.session.pacing_ms
    })
}
