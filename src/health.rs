//! Operational endpoints: liveness plus the gateway's counters.

use crate::session::SessionKind;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let config = &state.config;
    let active = state.registry().len();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "clients": {
            "connected": metrics.connected_clients,
            "registered": state.clients.len(),
            "total_connections": metrics.total_connections
        },
        "sessions": {
            "recognition": state.registry().count(SessionKind::Recognition),
            "synthesis": state.registry().count(SessionKind::Synthesis),
            "failure_rate": metrics.failure_rate()
        },
        "upstream_open": metrics.upstream_open(),
        "memory": get_memory_info(),
        "system": load_status(active, config.performance.max_concurrent_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics: AppMetrics = state.metrics.snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "counters": metrics,
        "derived": {
            "upstream_open": metrics.upstream_open(),
            "failure_rate": metrics.failure_rate(),
            "audio_frames_up_per_second": if uptime_seconds > 0 {
                metrics.audio_frames_up as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "registry": {
            "recognition": state.registry().count(SessionKind::Recognition),
            "synthesis": state.registry().count(SessionKind::Synthesis)
        },
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": state.config.performance.max_concurrent_sessions,
            "connect_timeout_secs": state.config.performance.connect_timeout_secs,
            "registry_shards": state.config.performance.registry_shards
        }
    }))
}

/// Resident and virtual memory of this process, read from `/proc` on Linux.
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn load_status(active_sessions: usize, max_sessions: usize) -> serde_json::Value {
    let session_usage = if max_sessions > 0 {
        active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::upstream::mock::MockConnector;
    use actix_web::{test as actix_test, App};
    use serde_json::Value;

    #[test]
    fn test_load_status_thresholds() {
        assert_eq!(load_status(0, 100)["status"], "normal");
        assert_eq!(load_status(75, 100)["status"], "moderate_load");
        assert_eq!(load_status(95, 100)["status"], "high_load");
        assert_eq!(load_status(85, 100)["load_warnings"].as_array().unwrap().len(), 1);
        assert_eq!(load_status(3, 0)["session_usage_percent"], 0.0);
    }

    #[actix_web::test]
    async fn test_health_reports_counters() {
        let (connector, _accepted) = MockConnector::new();
        let state = AppState::new(test_config(), connector).unwrap();
        state.metrics.client_connected();
        state.metrics.upstream_opened();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["clients"]["connected"], 1);
        assert_eq!(body["clients"]["registered"], 0);
        assert_eq!(body["upstream_open"], 1);
        assert_eq!(body["sessions"]["recognition"], 0);

        let req = actix_test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["counters"]["total_connections"], 1);
        assert_eq!(body["counters"]["upstream_closed"], 0);
        assert_eq!(body["derived"]["upstream_open"], 1);
    }
}
