use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use axum::{
    Form, Json, Router,
    body::Body,
    extract::{
        Path as AxumPath, Query, State,
        rejection::{FormRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::{MimeGuess, mime::Mime};
use serde::Deserialize;
use tokio::{fs::File, signal, task};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tubefetch::{
    config::{self, DEFAULT_CONFIG_PATH, PORT_ENV, ServerConfig},
    download::{DownloadKind, attachment_disposition, prepare_download},
    error::{FetchError, MSG_NO_VIDEO_ID},
    extractor::{Extractor, YtDlp},
    metadata::fetch_video_metadata,
    pages, security,
    thumbnail::{ThumbnailQuality, fetch_thumbnail, video_id_from_thumbnail_url},
    video_url::{extract_video_id, is_safe_video_id},
};

const MSG_THUMBNAIL_FAILED: &str = "Failed to download thumbnail";
const MSG_INVALID_VIDEO_ID: &str = "Invalid video ID.";
const MSG_INTERNAL: &str = "Something went wrong. Please try again later.";
const MSG_PAGE_NOT_FOUND: &str = "The page you requested does not exist.";

#[derive(Parser, Debug)]
#[command(author, version, about = "tubefetch web backend")]
struct Cli {
    /// Env-style config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Used when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Clone)]
struct AppState {
    config: Arc<ServerConfig>,
    extractor: Arc<dyn Extractor>,
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

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    /// Like the `From` conversion, but non-input failures report `message`.
    fn from_fetch_with(err: FetchError, message: &str) -> Self {
        if err.is_input() {
            return err.into();
        }
        error!("{message}: {err}");
        Self::internal(message)
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        if err.is_input() {
            debug!("rejected request: {err}");
            Self::bad_request(err.user_message())
        } else {
            error!("request failed: {err}");
            Self::internal(err.user_message())
        }
    }
}

impl From<FormRejection> for ApiError {
    fn from(rejection: FormRejection) -> Self {
        debug!("rejected form: {rejection}");
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        debug!("rejected query: {rejection}");
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Failure on a page route, rendered as HTML instead of JSON.
#[derive(Debug)]
struct PageError {
    status: StatusCode,
    message: String,
}

impl PageError {
    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: MSG_PAGE_NOT_FOUND.to_string(),
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: MSG_INTERNAL.to_string(),
        }
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        let html = pages::render_error(self.status.as_u16(), &self.message);
        (self.status, Html(html)).into_response()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_server_config_from(&cli.config)?;
    config::apply_port_override(&mut config, std::env::var(PORT_ENV).ok().as_deref())?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("invalid log level {:?}", config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    security::ensure_not_root("tubefetch backend")?;
    if config.uses_default_secret() {
        warn!("SESSION_SECRET is not set; using the built-in development secret");
    }
    debug!(?config, "loaded configuration");

    let extractor =
        YtDlp::new(&config.ytdlp_path).with_cookies(config.cookies_file.clone());
    match extractor.version() {
        Some(version) => info!(%version, "using {}", config.ytdlp_path.display()),
        None => bail!(
            "{} could not be run; install yt-dlp or set YTDLP_PATH",
            config.ytdlp_path.display()
        ),
    }

    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("parsing bind address {}", config.bind_addr()))?;

    let state = AppState {
        config: Arc::new(config),
        extractor: Arc::new(extractor),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("tubefetch listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/get_video_info", post(get_video_info))
        .route("/download_thumbnail", get(download_thumbnail))
        .route("/download_video", get(download_video))
        .route("/download_audio", get(download_audio))
        .route("/sw.js", get(service_worker))
        .route("/manifest.json", get(manifest))
        .route("/static/{*path}", get(static_asset))
        .route("/healthz", get(healthz))
        .fallback(not_found)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {}", err);
    }
    info!("shutting down");
}

/// Runs blocking work (child processes, synchronous HTTP) off the runtime.
async fn run_blocking<R, F>(work: F) -> ApiResult<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    task::spawn_blocking(work).await.map_err(|err| {
        error!("task join error: {err}");
        ApiError::internal(MSG_INTERNAL)
    })
}

async fn index() -> Html<&'static str> {
    Html(pages::render_index())
}

async fn not_found() -> PageError {
    PageError::not_found()
}

#[derive(Debug, Default, Deserialize)]
struct VideoInfoForm {
    #[serde(default)]
    url: Option<String>,
}

async fn get_video_info(
    State(state): State<AppState>,
    form: Result<Form<VideoInfoForm>, FormRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Form(form) = form?;
    let url = form.url.unwrap_or_default();
    let extractor = state.extractor.clone();
    let image_host = state.config.thumbnail_host.clone();

    let metadata =
        run_blocking(move || fetch_video_metadata(extractor.as_ref(), &url, &image_host))
            .await??;

    Ok(Json(serde_json::json!({
        "success": true,
        "video_info": metadata,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct ThumbnailQuery {
    url: Option<String>,
    video_id: Option<String>,
    quality: Option<String>,
}

impl ThumbnailQuery {
    /// Explicit `video_id` first, then whatever `url` points at: a video
    /// link or an image URL.
    fn resolve_video_id(&self) -> Option<String> {
        if let Some(id) = self.video_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return Some(id.to_string());
        }
        let url = self.url.as_deref()?.trim();
        extract_video_id(url)
            .filter(|id| !id.is_empty())
            .or_else(|| video_id_from_thumbnail_url(url))
    }
}

async fn download_thumbnail(
    State(state): State<AppState>,
    query: Result<Query<ThumbnailQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let video_id = query
        .resolve_video_id()
        .ok_or_else(|| ApiError::bad_request(MSG_NO_VIDEO_ID))?;
    if !is_safe_video_id(&video_id) {
        return Err(ApiError::bad_request(MSG_INVALID_VIDEO_ID));
    }
    let quality = ThumbnailQuality::from_token(query.quality.as_deref().unwrap_or_default());
    let image_host = state.config.thumbnail_host.clone();

    let image = run_blocking(move || fetch_thumbnail(&image_host, &video_id, quality))
        .await?
        .map_err(|err| ApiError::from_fetch_with(err, MSG_THUMBNAIL_FAILED))?;

    let len = image.bytes.len() as u64;
    attachment_response(
        Body::from(image.bytes),
        &mime_guess::mime::IMAGE_JPEG,
        &image.filename,
        len,
    )
}

#[derive(Debug, Default, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    format_id: Option<String>,
    /// Older clients send the selected rendition as `itag`.
    itag: Option<String>,
}

impl DownloadQuery {
    fn selector(&self) -> Option<String> {
        self.format_id
            .as_deref()
            .or(self.itag.as_deref())
            .map(str::to_string)
    }
}

async fn download_video(
    State(state): State<AppState>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let selector = query.selector();
    serve_download(state, query.url, selector, DownloadKind::Video).await
}

async fn download_audio(
    State(state): State<AppState>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    serve_download(state, query.url, query.format_id, DownloadKind::Audio).await
}

async fn serve_download(
    state: AppState,
    url: Option<String>,
    selector: Option<String>,
    kind: DownloadKind,
) -> ApiResult<Response> {
    let url = url.unwrap_or_default();
    let extractor = state.extractor.clone();
    let temp_root = state.config.temp_root.clone();

    let artifact = run_blocking(move || {
        prepare_download(
            extractor.as_ref(),
            &temp_root,
            &url,
            selector.as_deref(),
            kind,
        )
    })
    .await??;

    info!(file = %artifact.filename(), bytes = artifact.len(), "sending download");
    let mime = artifact.mime().clone();
    let filename = artifact.filename().to_string();
    let len = artifact.len();

    let body = artifact.into_body().await.map_err(|err| {
        error!("opening {filename}: {err}");
        ApiError::internal(MSG_INTERNAL)
    })?;
    attachment_response(body, &mime, &filename, len)
}

fn attachment_response(body: Body, mime: &Mime, filename: &str, len: u64) -> ApiResult<Response> {
    Response::builder()
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_DISPOSITION, attachment_disposition(filename))
        .header(header::CONTENT_LENGTH, len)
        .body(body)
        .map_err(|err| {
            error!("building attachment response for {filename}: {err}");
            ApiError::internal(MSG_INTERNAL)
        })
}

async fn service_worker(State(state): State<AppState>) -> Result<Response, PageError> {
    stream_file(state.config.static_root.join("sw.js"), None).await
}

async fn manifest(State(state): State<AppState>) -> Result<Response, PageError> {
    stream_file(
        state.config.static_root.join("manifest.json"),
        Some(mime_guess::mime::APPLICATION_JSON),
    )
    .await
}

async fn static_asset(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> Result<Response, PageError> {
    let resolved = security::resolve_static_path(&state.config.static_root, &path)
        .ok_or_else(|| {
            warn!("rejected static path {path:?}");
            PageError::not_found()
        })?;
    stream_file(resolved, None).await
}

async fn healthz(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let extractor = state.extractor.clone();
    let version = run_blocking(move || extractor.version()).await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "extractor": version,
    })))
}

async fn stream_file(path: PathBuf, mime: Option<Mime>) -> Result<Response, PageError> {
    let file = File::open(&path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            debug!("static file {} not found", path.display());
            PageError::not_found()
        } else {
            error!("opening {}: {err}", path.display());
            PageError::internal()
        }
    })?;
    let metadata = file.metadata().await.map_err(|err| {
        error!("reading metadata of {}: {err}", path.display());
        PageError::internal()
    })?;
    if !metadata.is_file() {
        return Err(PageError::not_found());
    }

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let mut response = body.into_response();
    if let Some(mime) = guessed {
        if let Ok(value) = mime.to_string().parse() {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }

    Ok(response)
}
