// Web服务器模块

pub mod error;
pub mod extract;
pub mod handlers;
pub mod state;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// 构建路由
pub fn build_router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let api_routes = Router::new()
        .route("/download", post(handlers::submit_download))
        .route("/jobs", get(handlers::list_jobs))
        .route("/job/:id", get(handlers::get_job))
        .route("/job/:id/log", get(handlers::get_job_log));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes)
        .route("/ws/jobs/:id", get(websocket::job_log_stream))
        .layer(middleware)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::AppConfig;
    use crate::jobs::{JobStatus, JobSummary, JobView};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use handlers::SubmitResponse;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    struct TestApp {
        router: Router,
        broker: Arc<MemoryBroker>,
        token: String,
        _dir: TempDir,
    }

    fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.auth.jwt_secret = SECRET.to_string();
        config.storage.model_dir = dir.path().join("models");
        config.storage.data_dir = dir.path().join("data");

        let broker = Arc::new(MemoryBroker::new());
        let state = AppState::new(config, broker.clone());
        let token = state.verifier.issue("tester", None).unwrap();

        TestApp {
            router: build_router(state),
            broker,
            token,
            _dir: dir,
        }
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let response = app.router.oneshot(get("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = json(response).await;
        assert_eq!(body, serde_json::json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_missing_or_bad_token_is_forbidden() {
        let app = app();
        let response = app
            .router
            .clone()
            .oneshot(get("/api/jobs", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = json(response).await;
        assert_eq!(body["code"], 403);

        let response = app
            .router
            .clone()
            .oneshot(post_json("/api/download", Some("garbage"), r#"{"model_id":"a/b"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(app.broker.queue_len("hf-jobs"), 0);
    }

    #[tokio::test]
    async fn test_submit_then_query() {
        let app = app();
        let response = app
            .router
            .clone()
            .oneshot(post_json(
                "/api/download",
                Some(&app.token),
                r#"{"model_id":"org/model","download_type":"files","files":["a.bin","b.bin"]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let submitted: SubmitResponse = json(response).await;
        assert_eq!(app.broker.queue_len("hf-jobs"), 1);

        let response = app
            .router
            .clone()
            .oneshot(get(&format!("/api/job/{}", submitted.job_id), Some(&app.token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view: JobView = json(response).await;
        assert_eq!(view.id, submitted.job_id);
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.result, None);

        let response = app
            .router
            .clone()
            .oneshot(get("/api/jobs", Some(&app.token)))
            .await
            .unwrap();
        let jobs: Vec<JobSummary> = json(response).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, submitted.job_id);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_bad_request() {
        let app = app();
        for body in [
            r#"{"model_id":""}"#,
            r#"{"model_id":"org/model","download_type":"branch"}"#,
            r#"{"model_id":"org/model","local_dir":"../etc"}"#,
            r#"{"no_model":true}"#,
            "not json",
        ] {
            let response = app
                .router
                .clone()
                .oneshot(post_json("/api/download", Some(&app.token), body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", body);
        }

        let response = app
            .router
            .clone()
            .oneshot(get("/api/jobs", Some(&app.token)))
            .await
            .unwrap();
        let jobs: Vec<JobSummary> = json(response).await;
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_empty_model_id_message() {
        let app = app();
        let response = app
            .router
            .oneshot(post_json("/api/download", Some(&app.token), r#"{"model_id":""}"#))
            .await
            .unwrap();
        let body: serde_json::Value = json(response).await;
        assert_eq!(body, serde_json::json!({ "code": 400, "message": "model_id required" }));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let app = app();
        for uri in ["/api/job/does-not-exist", "/api/job/does-not-exist/log"] {
            let response = app
                .router
                .clone()
                .oneshot(get(uri, Some(&app.token)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_job_log_empty_before_start() {
        let app = app();
        let response = app
            .router
            .clone()
            .oneshot(post_json("/api/download", Some(&app.token), r#"{"model_id":"org/m"}"#))
            .await
            .unwrap();
        let submitted: SubmitResponse = json(response).await;

        let response = app
            .router
            .clone()
            .oneshot(get(&format!("/api/job/{}/log", submitted.job_id), Some(&app.token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_broker_down_is_unavailable() {
        let app = app();
        app.broker.set_offline(true);
        let response = app
            .router
            .clone()
            .oneshot(post_json("/api/download", Some(&app.token), r#"{"model_id":"org/m"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ws_requires_token_before_upgrade() {
        let app = app();
        let response = app
            .router
            .clone()
            .oneshot(get("/ws/jobs/some-job", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .router
            .oneshot(get("/ws/jobs/some-job?token=garbage", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
