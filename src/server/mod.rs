//! HTTP surface of the job service
//!
//! Routes:
//! - `GET /` health probe, no auth
//! - `POST /token` form login, returns a bearer token
//! - `POST /run` execute a job, bearer token required

mod error;

pub use error::ApiError;

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::{header, HeaderMap},
    routing::{get, post},
    Form, Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use crate::job::{JobRequest, JobResult, LoginForm, TokenResponse};
use crate::service::JobService;

/// Slack on top of the storage limit for JSON framing and escaping
const BODY_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Build the router over a shared service
pub fn router(service: Arc<JobService>) -> Router {
    let body_limit = service
        .policy()
        .storage_limit_bytes()
        .saturating_mul(2)
        .saturating_add(BODY_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/", get(health))
        .route("/token", post(token))
        .route("/run", post(run))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(service)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    service: Arc<JobService>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "Secure Agent Runtime is online." }))
}

async fn token(
    State(service): State<Arc<JobService>>,
    Form(form): Form<LoginForm>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = service
        .login(&form.username, &form.password)
        .await
        .map_err(|e| match ApiError::from(e) {
            ApiError::Unauthorized(_) => {
                ApiError::Unauthorized("Incorrect username or password".to_string())
            }
            other => other,
        })?;

    info!("Issued token for {}", token.subject);
    Ok(Json(TokenResponse {
        access_token: token.encoded,
        token_type: "bearer".to_string(),
        expires_in: u64::try_from(service.token_lifetime().num_seconds()).ok(),
    }))
}

async fn run(
    State(service): State<Arc<JobService>>,
    headers: HeaderMap,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> Result<Json<JobResult>, ApiError> {
    // Authenticate before looking at the body
    let caller = service.authorize(bearer_token(&headers))?;
    let Json(job) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let result = service.run_authorized(&caller, job).await?;
    Ok(Json(result))
}

/// Extract the token from an `Authorization: Bearer <token>` header
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FilePayload;
    use crate::policy::ResourcePolicy;
    use crate::sandbox::engine::testing::{FakeEngine, Script};
    use crate::service::tests::{fixture, Fixture};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        response::Response,
    };
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        engine: Arc<FakeEngine>,
        _fixture_root: tempfile::TempDir,
    }

    fn app(engine: FakeEngine, policy: ResourcePolicy) -> TestApp {
        let Fixture {
            service,
            engine,
            workspace_root,
        } = fixture(engine, policy);
        TestApp {
            app: router(Arc::new(service)),
            engine,
            _fixture_root: workspace_root,
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn login(app: &Router) -> String {
        let request = Request::builder()
            .method("POST")
            .uri("/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("username=agent_user&password=pw"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["token_type"], "bearer");
        assert_eq!(body["expires_in"], 1800);
        body["access_token"].as_str().unwrap().to_string()
    }

    fn run_request(token: Option<&str>, body: String) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/run")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn job_json(job: &JobRequest) -> String {
        serde_json::to_string(job).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let t = app(FakeEngine::default(), ResourcePolicy::default());
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = t.app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "status": "Secure Agent Runtime is online." })
        );
    }

    #[tokio::test]
    async fn test_bad_login() {
        let t = app(FakeEngine::default(), ResourcePolicy::default());
        let request = Request::builder()
            .method("POST")
            .uri("/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("username=agent_user&password=nope"))
            .unwrap();
        let response = t.app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["www-authenticate"], "Bearer");
        assert_eq!(
            json_body(response).await["detail"],
            "Incorrect username or password"
        );
    }

    #[tokio::test]
    async fn test_run_scenario() {
        let t = app(FakeEngine::exiting(0, "2\n"), ResourcePolicy::default());
        let token = login(&t.app).await;
        let job = JobRequest::new("python a.py", vec![FilePayload::new("a.py", "print(1+1)")]);

        let response = t
            .app
            .clone()
            .oneshot(run_request(Some(&token), job_json(&job)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "success": true, "exit_code": 0, "stdout": "2\n", "stderr": "" })
        );
        assert_eq!(t.engine.creates(), 1);
    }

    #[tokio::test]
    async fn test_run_without_token() {
        let t = app(FakeEngine::default(), ResourcePolicy::default());
        let job = JobRequest::new("ls", vec![]);

        let response = t
            .app
            .clone()
            .oneshot(run_request(None, job_json(&job)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = t
            .app
            .clone()
            .oneshot(run_request(Some("forged.token.value"), job_json(&job)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(t.engine.creates(), 0);
    }

    #[tokio::test]
    async fn test_auth_checked_before_body() {
        let t = app(FakeEngine::default(), ResourcePolicy::default());
        let response = t
            .app
            .oneshot(run_request(None, "{not json".to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let t = app(FakeEngine::default(), ResourcePolicy::default());
        let token = login(&t.app).await;

        let response = t
            .app
            .clone()
            .oneshot(run_request(Some(&token), r#"{"files": [], "command": ""}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(t.engine.creates(), 0);
    }

    #[tokio::test]
    async fn test_malformed_body_rejected() {
        let t = app(FakeEngine::default(), ResourcePolicy::default());
        let token = login(&t.app).await;

        let response = t
            .app
            .clone()
            .oneshot(run_request(Some(&token), r#"{"files": []}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["detail"].is_string());
        assert_eq!(t.engine.creates(), 0);
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let t = app(FakeEngine::default(), ResourcePolicy::default());
        let token = login(&t.app).await;
        let job = JobRequest::new("ls", vec![FilePayload::new("../x.py", "")]);

        let response = t
            .app
            .clone()
            .oneshot(run_request(Some(&token), job_json(&job)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(t.engine.creates(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let policy = ResourcePolicy {
            max_jobs_per_minute: 1,
            ..ResourcePolicy::default()
        };
        let t = app(FakeEngine::exiting(0, ""), policy);
        let token = login(&t.app).await;
        let job = JobRequest::new("ls", vec![]);

        let first = t
            .app
            .clone()
            .oneshot(run_request(Some(&token), job_json(&job)))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = t
            .app
            .clone()
            .oneshot(run_request(Some(&token), job_json(&job)))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = second.headers()["retry-after"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry_after));
        assert_eq!(t.engine.creates(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_job_result() {
        let engine = FakeEngine::new(Script {
            create_error: Some("python:3.10-slim".to_string()),
            ..Default::default()
        });
        let t = app(engine, ResourcePolicy::default());
        let token = login(&t.app).await;

        let response = t
            .app
            .clone()
            .oneshot(run_request(Some(&token), job_json(&JobRequest::new("ls", vec![]))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["exit_code"], -1);
        assert_eq!(body["stdout"], "");
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, "bearer  abc ".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
