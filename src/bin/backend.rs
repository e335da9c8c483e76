#![forbid(unsafe_code)]

//! Axum front of the download service.
//!
//! Routes validate their query, hand the work to the [`DownloadManager`] or the
//! [`MetadataResolver`] and translate the outcome into HTTP. Nothing here owns
//! job state; a dropped request simply drops its job subscription.

use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::get,
};
use clap::Parser;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{info, warn};
use tubefetch::{
    admission::AdmissionController,
    artifacts::ArtifactStore,
    config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config},
    error::{ErrorKind, FetchError},
    job::{DownloadManager, JobRequest, JobState, JobStatus, ManagerSettings},
    logging::{self, LoggingOptions},
    media::{MediaFormat, MediaRef, Quality, Variant},
    metadata::{MediaInfo, MetadataResolver, ResolverSettings},
    relay,
    retry::RetryPolicy,
    security::ensure_not_root,
};

#[derive(Debug, Clone, Parser)]
#[command(name = "backend", about = "HTTP server for audio and video downloads")]
struct BackendArgs {
    /// Directory where artifacts are written and served from.
    #[arg(long)]
    download_root: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Maximum number of downloads running at once.
    #[arg(long)]
    max_concurrent: Option<usize>,
    #[arg(long)]
    ytdlp_bin: Option<PathBuf>,
    /// Enables a daily rolling log file in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Tracing filter, e.g. `debug` or `tubefetch=trace`. Wins over RUST_LOG.
    #[arg(long)]
    log_filter: Option<String>,
    /// Alternative `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            download_root: self.download_root.clone(),
            port: self.port,
            host: self.host.clone(),
            max_concurrent: self.max_concurrent,
            ytdlp_bin: self.ytdlp_bin.clone(),
            log_dir: self.log_dir.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    downloads: DownloadManager,
    resolver: MetadataResolver,
    keepalive: Duration,
}

impl AppState {
    fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let store = ArtifactStore::open(&config.download_root, config.artifact_max_age)
            .with_context(|| {
                format!(
                    "creating download root {}",
                    config.download_root.display()
                )
            })?;
        let downloads = DownloadManager::new(
            ManagerSettings {
                ytdlp_bin: config.ytdlp_bin.clone(),
                timeout: config.download_timeout,
                retention: config.retention,
                rate_limit: config.outbound_rate_limit.clone(),
            },
            AdmissionController::new(config.max_concurrent),
            store,
        );
        let resolver = MetadataResolver::new(ResolverSettings {
            ytdlp_bin: config.ytdlp_bin.clone(),
            timeout: config.metadata_timeout,
            retry: RetryPolicy::new(
                config.metadata_retry_attempts,
                config.metadata_retry_delay,
            ),
            cache_ttl: config.metadata_cache_ttl,
        });
        Ok(Self {
            downloads,
            resolver,
            keepalive: config.keepalive,
        })
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let status = match err.kind() {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::ServerBusy => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::UpstreamUnavailable
            | ErrorKind::ProcessFailure
            | ErrorKind::Filesystem => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(kind = ?err.kind(), "request failed: {err}");
        }
        Self {
            status,
            message: err.user_message(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct InfoQuery {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadQuery {
    id: Option<String>,
    quality: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProgressQuery {
    id: Option<String>,
    title: Option<String>,
    format: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileQuery {
    path: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobsResponse {
    jobs: Vec<JobStatus>,
    active: usize,
    max: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    ensure_not_root("backend")?;

    let config =
        resolve_runtime_config(args.overrides()).context("loading runtime configuration")?;
    let _logging = logging::init(&LoggingOptions {
        cli_filter: args.log_filter.clone(),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        log_dir: config.log_dir.clone(),
    })?;

    let state = AppState::from_config(&config)?;
    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid listen address {:?}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        download_root = %config.download_root.display(),
        max_concurrent = config.max_concurrent,
        "API server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;
    info!("API server stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/get-info", get(get_info))
        .route("/download-audio", get(download_audio))
        .route("/download-video", get(download_video))
        .route("/download-progress", get(download_progress))
        .route("/download-file", get(download_file))
        .route("/jobs", get(list_jobs))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
}

fn media_ref_param(id: Option<&str>) -> ApiResult<MediaRef> {
    Ok(MediaRef::parse(id.unwrap_or_default())?)
}

/// Title used to name the artifact. A caller-supplied title wins; otherwise
/// the resolver is asked. Lookup failures other than unavailable media fall
/// back to naming the file after the media reference.
async fn artifact_title(
    state: &AppState,
    media_ref: &MediaRef,
    supplied: Option<&str>,
) -> ApiResult<Option<String>> {
    if let Some(title) = supplied.map(str::trim).filter(|title| !title.is_empty()) {
        return Ok(Some(title.to_string()));
    }
    match state.resolver.resolve(media_ref).await {
        Ok(info) => Ok(Some(info.title)),
        Err(err @ FetchError::UpstreamUnavailable(_)) => Err(err.into()),
        Err(err) => {
            warn!(%media_ref, "title lookup failed, naming file after id: {err}");
            Ok(None)
        }
    }
}

async fn get_info(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
) -> ApiResult<Json<MediaInfo>> {
    let media_ref = media_ref_param(query.id.as_deref())?;
    Ok(Json(state.resolver.resolve(&media_ref).await?))
}

async fn download_audio(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    download_direct(state, query, MediaFormat::Audio, headers).await
}

async fn download_video(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    download_direct(state, query, MediaFormat::Video, headers).await
}

/// Runs the job while the request is open and answers with the file itself.
async fn download_direct(
    state: AppState,
    query: DownloadQuery,
    format: MediaFormat,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let media_ref = media_ref_param(query.id.as_deref())?;
    let variant = Variant::new(format, Quality::parse(format, query.quality.as_deref())?);
    let title = artifact_title(&state, &media_ref, query.title.as_deref()).await?;

    let mut subscription = state
        .downloads
        .submit(JobRequest {
            media_ref,
            variant,
            title,
        })
        .await?;
    let status = subscription.wait_terminal().await;
    match status.state {
        JobState::Succeeded => {
            let name = status
                .artifact
                .ok_or_else(|| ApiError::internal("Failed to download media"))?;
            let store = state.downloads.store();
            let path = store.path_for(&name);
            store
                .serve(&path, Some(&headers), Some(&name))
                .await
                .map_err(|_| ApiError::not_found("File not found"))
        }
        JobState::Failed => Err(status
            .error
            .unwrap_or_else(|| FetchError::ProcessFailure("unknown failure".into()))
            .into()),
        _ => Err(ApiError::internal("Download cancelled")),
    }
}

async fn download_progress(
    State(state): State<AppState>,
    Query(query): Query<ProgressQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let media_ref = media_ref_param(query.id.as_deref())?;
    let variant = Variant::parse(
        query.format.as_deref().unwrap_or("audio"),
        query.quality.as_deref(),
    )?;
    let title = artifact_title(&state, &media_ref, query.title.as_deref()).await?;

    let subscription = state
        .downloads
        .submit(JobRequest {
            media_ref,
            variant,
            title,
        })
        .await?;
    Ok(relay::sse(subscription, state.keepalive))
}

async fn download_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let requested = query
        .path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .ok_or_else(|| ApiError::bad_request("File path is required"))?;
    let store = state.downloads.store();
    let path = store
        .resolve(requested)
        .ok_or_else(|| ApiError::not_found("File not found"))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    let mut response = store
        .serve(&path, Some(&headers), name.as_deref())
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-store"));
    Ok(response)
}

async fn list_jobs(State(state): State<AppState>) -> Json<JobsResponse> {
    let admission = state.downloads.admission();
    Json(JobsResponse {
        jobs: state.downloads.list_jobs(),
        active: admission.active(),
        max: admission.max_concurrent(),
    })
}

// The library's test helpers are not compiled into the binary's test target.
#[cfg(test)]
#[path = "../testing.rs"]
mod testing;
