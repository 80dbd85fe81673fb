//! Thin HTTP front end: queue a download job, poll its status. The routes
//! are deliberately minimal wrappers around the job runner.

use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use url::Url;

use crate::app::job_store::{JobStore, LocalFsJobStore};
use crate::app::model::{Job, StartJobRequest};
use crate::app::runner::JobRunner;
use crate::blob::{BlobStore, DropboxStore};
use crate::cli::ServeArgs;
use crate::download::DownloadOptions;

#[derive(Clone)]
pub struct AppState {
    job_store: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
}

pub async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let data_dir = std::path::PathBuf::from(&args.data_dir);
    let job_store: Arc<dyn JobStore> = Arc::new(LocalFsJobStore::new(&data_dir));

    let blob: Option<Arc<dyn BlobStore>> = dropbox_from_env_or_arg(args.dropbox_token.as_deref());

    let options = DownloadOptions {
        output_dir: data_dir.join("novel_output"),
        temp_dir: data_dir.join("novel_temp"),
        checkpoint_interval: args.checkpoint_interval,
        ..DownloadOptions::default()
    };

    let runner = Arc::new(JobRunner::new(
        Arc::clone(&job_store),
        blob,
        options,
        args.max_concurrency,
    ));
    let shutdown = runner.shutdown_token();

    let state = AppState { job_store, runner };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("bind {}", args.addr))?;
    tracing::info!(addr = %args.addr, "serving download jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received; letting jobs wind down");
            shutdown.cancel();
        })
        .await
        .context("serve http")?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/novels", post(submit_job))
        .route("/api/jobs/:job_id", get(job_status))
        .with_state(state)
}

pub fn dropbox_from_env_or_arg(arg_token: Option<&str>) -> Option<Arc<dyn BlobStore>> {
    let token = arg_token
        .map(str::to_string)
        .or_else(|| std::env::var("NOVEL2EPUB_DROPBOX_TOKEN").ok())
        .filter(|token| !token.trim().is_empty())?;
    Some(Arc::new(DropboxStore::new(token)))
}

#[derive(Debug, serde::Serialize)]
struct SubmitResponse {
    job_id: String,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<StartJobRequest>,
) -> Response {
    if let Err(err) = Url::parse(&request.url) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid novel url: {err}"),
        );
    }

    let job_id = uuid::Uuid::new_v4().simple().to_string();
    let job = Job::queued(&job_id, &request.url);
    if let Err(err) = state.job_store.put(&job).await {
        tracing::error!(?err, "failed to persist new job");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to persist job".to_string(),
        );
    }

    state.runner.spawn_job(job_id.clone(), request);
    (StatusCode::ACCEPTED, Json(SubmitResponse { job_id })).into_response()
}

async fn job_status(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.job_store.get(&job_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("no such job: {job_id}")),
        Err(err) => {
            tracing::error!(?err, job_id, "failed to load job");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to load job".to_string(),
            )
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
