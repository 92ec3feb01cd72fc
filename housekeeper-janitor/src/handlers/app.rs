use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use housekeeper_common::registry::RegistryError;
use housekeeper_common::scheduler::{Scheduler, SchedulerError, SchedulerState, SchedulerStatus};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_derive::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Consecutive failures at which a job marks the janitor as degraded.
pub const FAILING_THRESHOLD: u32 = 3;

const DEFAULT_SAMPLE_LIMIT: usize = 20;

#[derive(Clone)]
struct AppState {
    scheduler: Scheduler,
    shutdown: CancellationToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub state: SchedulerState,
    pub failing_jobs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SamplesQuery {
    limit: Option<usize>,
}

pub fn app(
    scheduler: Scheduler,
    shutdown: CancellationToken,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let router: Router = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/jobs/:name/samples", get(samples))
        .route("/stop", post(stop))
        .with_state(AppState {
            scheduler,
            shutdown,
        });

    match metrics {
        Some(handle) => router.route(
            "/metrics",
            get(move || std::future::ready(handle.render())),
        ),
        None => router,
    }
}

async fn index() -> &'static str {
    "housekeeper janitor"
}

async fn health(State(app): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let status = app.scheduler.status().await;
    let failing_jobs: Vec<String> = status
        .jobs
        .iter()
        .filter(|job| job.consecutive_failures >= FAILING_THRESHOLD)
        .map(|job| job.name.clone())
        .collect();

    let (code, label) = match status.state {
        SchedulerState::Running if failing_jobs.is_empty() => (StatusCode::OK, "healthy"),
        SchedulerState::Running => (StatusCode::OK, "degraded"),
        SchedulerState::Stopped | SchedulerState::Draining => {
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };

    (
        code,
        Json(HealthResponse {
            status: label.to_owned(),
            state: status.state,
            failing_jobs,
        }),
    )
}

async fn status(State(app): State<AppState>) -> Json<SchedulerStatus> {
    Json(app.scheduler.status().await)
}

async fn samples(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<SamplesQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_SAMPLE_LIMIT);

    match app.scheduler.samples(&name, limit).await {
        Ok(samples) => Json(samples).into_response(),
        Err(SchedulerError::Registry(RegistryError::NotFound(_))) => {
            (StatusCode::NOT_FOUND, format!("no job named {}", name)).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn stop(State(app): State<AppState>) -> (StatusCode, &'static str) {
    if !app.shutdown.is_cancelled() {
        info!("stop requested over http");
        app.shutdown.cancel();
    }

    (StatusCode::ACCEPTED, "stopping")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, Bytes};
    use axum::http::Request;
    use housekeeper_common::job::JobFailure;
    use housekeeper_common::samples::MetricSample;
    use housekeeper_common::scheduler::SchedulerConfig;
    use http_body_util::BodyExt; // for `collect`
    use std::time::Duration;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    async fn scheduler_with_jobs() -> Scheduler {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        scheduler
            .register("storage-cleanup", Duration::from_secs(1), || async {
                Ok::<(), JobFailure>(())
            })
            .await
            .unwrap();
        scheduler
            .register("cache-refresh", Duration::from_secs(1), || async {
                Err::<(), JobFailure>(JobFailure::new("cache backend unreachable"))
            })
            .await
            .unwrap();
        scheduler
    }

    async fn get_request(app: Router, uri: &str) -> (StatusCode, Bytes) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }

    #[tokio::test]
    async fn test_index_banner() {
        let scheduler = scheduler_with_jobs().await;
        let app = app(scheduler, CancellationToken::new(), None);

        let (status, body) = get_request(app, "/").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"housekeeper janitor");
    }

    #[tokio::test]
    async fn test_status_lists_jobs_in_registration_order() {
        let scheduler = scheduler_with_jobs().await;
        let app = app(scheduler, CancellationToken::new(), None);

        let (status, body) = get_request(app, "/status").await;

        assert_eq!(status, StatusCode::OK);
        let status: SchedulerStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.state, SchedulerState::Stopped);
        let names: Vec<&str> = status.jobs.iter().map(|job| job.name.as_str()).collect();
        assert_eq!(names, vec!["storage-cleanup", "cache-refresh"]);
        assert!(status.jobs.iter().all(|job| job.last_run_at.is_none()));
    }

    #[tokio::test]
    async fn test_health_is_unavailable_when_stopped() {
        let scheduler = scheduler_with_jobs().await;
        let app = app(scheduler, CancellationToken::new(), None);

        let (status, body) = get_request(app, "/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_degrades_on_repeated_failures() {
        let scheduler = scheduler_with_jobs().await;
        let app = app(scheduler.clone(), CancellationToken::new(), None);

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        let (status, body) = get_request(app, "/health").await;
        scheduler.stop().await.unwrap();

        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "degraded");
        assert_eq!(health.state, SchedulerState::Running);
        assert_eq!(health.failing_jobs, vec!["cache-refresh"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_of_a_job() {
        let scheduler = scheduler_with_jobs().await;
        let app = app(scheduler.clone(), CancellationToken::new(), None);

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        scheduler.stop().await.unwrap();

        let (status, body) = get_request(app, "/jobs/cache-refresh/samples?limit=2").await;

        assert_eq!(status, StatusCode::OK);
        let samples: Vec<MetricSample> = serde_json::from_slice(&body).unwrap();
        assert_eq!(samples.len(), 2);
        assert!(samples
            .iter()
            .all(|s| s.error_message.as_deref() == Some("cache backend unreachable")));
    }

    #[tokio::test]
    async fn test_samples_of_unknown_job() {
        let scheduler = scheduler_with_jobs().await;
        let app = app(scheduler, CancellationToken::new(), None);

        let (status, _) = get_request(app, "/jobs/missing/samples").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stop_cancels_shutdown_token() {
        let scheduler = scheduler_with_jobs().await;
        let shutdown = CancellationToken::new();
        let app = app(scheduler, shutdown.clone(), None);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_metrics_route_requires_recorder() {
        let scheduler = scheduler_with_jobs().await;
        let app = app(scheduler, CancellationToken::new(), None);

        let (status, _) = get_request(app, "/metrics").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
