//! HTTP router.
//!
//! Returns a composable `Router` that can be mounted on any axum server.
//! Routes are nested under `/api/`.

use std::sync::Arc;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::api::types::ApiContext;
use crate::core_state::CoreState;

/// Build the analysis API router.
pub fn analysis_api_router(core: Arc<CoreState>) -> Router {
    build_router(ApiContext::new(core))
}

fn build_router(ctx: ApiContext) -> Router {
    // NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    // Static segments (`run`, `stats`, `patient`) win over `:run_id`.
    let api = Router::new()
        .route("/health", get(endpoints::health::check))
        .route("/analysis/run", post(endpoints::analysis::start))
        .route("/analysis/stats", get(endpoints::analysis::stats))
        .route("/analysis/:run_id/status", get(endpoints::analysis::status))
        .route("/analysis/:run_id/stream", get(endpoints::analysis::stream))
        .route("/analysis/:run_id/stop", post(endpoints::analysis::stop))
        .route("/analysis/:run_id/results", get(endpoints::analysis::results))
        .route(
            "/analysis/patient/:patient_id/active",
            get(endpoints::analysis::active),
        )
        .route(
            "/analysis/patient/:patient_id/history",
            get(endpoints::analysis::history),
        )
        .with_state(ctx);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::core_state::test_state;
    use crate::pipeline::analysis::testing::{Behavior, ScriptedHandler};
    use crate::pipeline::analysis::StepName;

    fn router(overrides: Vec<Arc<ScriptedHandler>>) -> Router {
        analysis_api_router(Arc::new(test_state(overrides)))
    }

    fn slow_history() -> Arc<ScriptedHandler> {
        Arc::new(ScriptedHandler::new(
            StepName::MedicalHistory,
            Behavior::Delay(Duration::from_millis(300)),
        ))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        app.clone().oneshot(builder.body(body).unwrap()).await.unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn start_run(app: &Router, patient_id: &str) -> String {
        let body = format!(r#"{{"patient_id": "{patient_id}"}}"#);
        let response = send(app, "POST", "/api/analysis/run", Some(&body)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        json_body(response).await["run_id"].as_str().unwrap().to_string()
    }

    async fn wait_terminal(app: &Router, run_id: &str) -> serde_json::Value {
        let uri = format!("/api/analysis/{run_id}/status");
        for _ in 0..300 {
            let json = json_body(send(app, "GET", &uri, None).await).await;
            let status = json["status"].as_str().unwrap_or_default().to_string();
            if matches!(status.as_str(), "completed" | "error" | "cancelled") {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} did not finish");
    }

    fn terminal_event(text: &str, status: &str) -> bool {
        text.lines()
            .any(|l| l.starts_with("event:") && l.trim_start_matches("event:").trim() == status)
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = router(vec![]);
        let response = send(&app, "GET", "/api/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], crate::config::APP_VERSION);
    }

    #[tokio::test]
    async fn empty_patient_id_is_bad_request() {
        let app = router(vec![]);
        let response =
            send(&app, "POST", "/api/analysis/run", Some(r#"{"patient_id": "  "}"#)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_run_exposes_results_history_and_stats() {
        let app = router(vec![]);
        let run_id = start_run(&app, "p1").await;

        let last = wait_terminal(&app, &run_id).await;
        assert_eq!(last["status"], "completed");
        assert_eq!(last["progress"], 100);

        let response = send(&app, "GET", &format!("/api/analysis/{run_id}/results"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert_eq!(report["run_id"], run_id.as_str());
        assert_eq!(report["subject_id"], "p1");

        let response = send(&app, "GET", "/api/analysis/patient/p1/history?limit=5", None).await;
        let history = json_body(response).await;
        assert_eq!(history.as_array().unwrap().len(), 1);

        let stats = json_body(send(&app, "GET", "/api/analysis/stats", None).await).await;
        assert_eq!(stats["reports"]["completed"], 1);
        assert_eq!(stats["active_runs"], 0);
    }

    #[tokio::test]
    async fn second_start_conflicts_then_stop_cancels() {
        let app = router(vec![slow_history()]);
        let run_id = start_run(&app, "p1").await;

        let response =
            send(&app, "POST", "/api/analysis/run", Some(r#"{"patient_id": "p1"}"#)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = json_body(response).await;
        assert_eq!(json["error"]["run_id"], run_id.as_str());

        let active = json_body(send(&app, "GET", "/api/analysis/patient/p1/active", None).await).await;
        assert_eq!(active["active"]["run_id"], run_id.as_str());

        let response = send(&app, "POST", &format!("/api/analysis/{run_id}/stop"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["outcome"], "requested");

        let last = wait_terminal(&app, &run_id).await;
        assert_eq!(last["status"], "cancelled");

        let response = send(&app, "POST", &format!("/api/analysis/{run_id}/stop"), None).await;
        assert_eq!(json_body(response).await["outcome"], "already_terminal");

        let active = json_body(send(&app, "GET", "/api/analysis/patient/p1/active", None).await).await;
        assert!(active["active"].is_null());
    }

    #[tokio::test]
    async fn results_before_finish_are_not_ready() {
        let app = router(vec![slow_history()]);
        let run_id = start_run(&app, "p1").await;

        let response = send(&app, "GET", &format!("/api/analysis/{run_id}/results"), None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["error"]["code"], "NOT_READY");
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let app = router(vec![]);
        for uri in [
            "/api/analysis/missing/status",
            "/api/analysis/missing/results",
            "/api/analysis/missing/stream",
        ] {
            let response = send(&app, "GET", uri, None).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
        let response = send(&app, "POST", "/api/analysis/missing/stop", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_patient_run_ends_in_error() {
        let app = router(vec![]);
        let run_id = start_run(&app, "ghost").await;
        let last = wait_terminal(&app, &run_id).await;
        assert_eq!(last["status"], "error");
        assert_eq!(last["error"], "Patient not found: ghost");
    }

    #[tokio::test]
    async fn stream_ends_with_terminal_event() {
        let app = router(vec![]);
        let run_id = start_run(&app, "p1").await;

        let response = send(&app, "GET", &format!("/api/analysis/{run_id}/stream"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(terminal_event(&text, "completed"), "{text}");
        assert!(text.contains(&run_id));
        assert!(text.lines().any(|l| l.starts_with("id:")));
    }

    #[tokio::test]
    async fn stream_of_finished_run_replays_terminal_snapshot() {
        let app = router(vec![]);
        let run_id = start_run(&app, "p1").await;
        wait_terminal(&app, &run_id).await;

        let response = send(&app, "GET", &format!("/api/analysis/{run_id}/stream"), None).await;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("event:")).count(), 1, "{text}");
        assert!(terminal_event(&text, "completed"));
    }
}
