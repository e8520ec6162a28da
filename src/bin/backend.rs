#![forbid(unsafe_code)]

//! Axum backend: accepts video links, fetches their audio through the
//! external downloader and serves the result for playback.
//!
//! Routes:
//! * `GET /` a minimal submission form.
//! * `GET /download?v=<id-or-url>[&mp3=on]` resolves or downloads, then
//!   redirects to the playback page.
//! * `GET /listen?v=<file>&t=<seconds>` the playback page.
//! * `GET /static/{file}` the stored artifacts, with range support.
//! * `POST /<bot token>` the Telegram webhook, when a token is configured.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use listentube::{
    INVALID_VIDEO_MESSAGE, already_in_progress_message,
    config::{
        DEFAULT_ENV_PATH, RuntimeOverrides, RuntimeSettings, parse_filesize_limit,
        resolve_runtime_settings,
    },
    downloader::{AudioFormat, Downloader},
    error::DownloadError,
    playback_query,
    security::{ensure_unprivileged, is_plain_file_name},
    storage::ArtifactStore,
    telegram::{TelegramBot, TelegramClient, Update},
};
use mime_guess::MimeGuess;
use serde::Deserialize;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STATIC_PREFIX: &str = "/static/";

const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Listen</title>
</head>
<body>
<form action="/download" method="get">
<input type="text" name="v" placeholder="https://youtu.be/b8g1o8Ph7LQ" autofocus required>
<label><input type="checkbox" name="mp3"> mp3</label>
<button type="submit">Listen</button>
</form>
</body>
</html>
"#;

#[derive(Debug, Parser)]
#[command(
    name = "backend",
    about = "Serves audio tracks fetched by an external downloader"
)]
struct BackendArgs {
    /// Directory the downloader writes artifacts into.
    #[arg(long)]
    storage_dir: Option<PathBuf>,
    /// Address to listen on.
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Downloader executable.
    #[arg(long)]
    downloader: Option<PathBuf>,
    /// Size cap for the downloaded format, e.g. `20M`.
    #[arg(long, value_name = "SIZE", value_parser = parse_filesize_arg)]
    max_filesize: Option<String>,
    /// Kill the downloader after this many seconds.
    #[arg(long, value_name = "SECS")]
    download_timeout: Option<u64>,
    /// Public domain used in the links the bot sends.
    #[arg(long)]
    domain: Option<String>,
    /// Enables the Telegram webhook.
    #[arg(long)]
    telegram_bot_token: Option<String>,
    #[arg(long, default_value = DEFAULT_ENV_PATH)]
    env_file: PathBuf,
    #[arg(short, long)]
    verbose: bool,
}

impl BackendArgs {
    fn settings(&self) -> Result<RuntimeSettings> {
        resolve_runtime_settings(RuntimeOverrides {
            storage_dir: self.storage_dir.clone(),
            listen_host: self.host.clone(),
            listen_port: self.port,
            downloader_bin: self.downloader.clone(),
            max_filesize: self.max_filesize.clone(),
            download_timeout: self
                .download_timeout
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            public_domain: self.domain.clone(),
            telegram_bot_token: self.telegram_bot_token.clone(),
            env_path: Some(self.env_file.clone()),
        })
    }
}

fn parse_filesize_arg(value: &str) -> Result<String, String> {
    parse_filesize_limit(value)
        .ok_or_else(|| format!("expected digits with an optional K/M/G suffix, got {value:?}"))
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/LISTEN_HOST")
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    downloader: Downloader,
    bot: Option<TelegramBot>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        match &err {
            DownloadError::InvalidIdentifier => Self::bad_request(INVALID_VIDEO_MESSAGE),
            DownloadError::AlreadyInProgress { id } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                already_in_progress_message(id),
            ),
            DownloadError::DownloadFailed { command, .. } => {
                Self::internal(format!("Command {command} error: {err}"))
            }
            DownloadError::CleanupFailed { .. } | DownloadError::Tool(_) => {
                Self::internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.message,
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    init_tracing(args.verbose);
    ensure_unprivileged("backend")?;

    let settings = args.settings()?;
    let host = parse_host_arg(&settings.listen_host)?;

    let store = ArtifactStore::new(&settings.storage_dir);
    store
        .ensure_root()
        .with_context(|| format!("creating {}", settings.storage_dir.display()))?;
    let downloader = Downloader::new(store, settings.tool_config());

    let bot = match settings.telegram_bot_token.as_deref() {
        Some(token) => {
            info!(domain = %settings.public_domain, "telegram webhook enabled");
            Some(TelegramBot::new(
                Arc::new(TelegramClient::new(token)),
                downloader.clone(),
                settings.listen_base_url(),
            ))
        }
        None => {
            info!("no telegram bot token, webhook disabled");
            None
        }
    };

    let app = router(
        AppState { downloader, bot },
        settings.telegram_bot_token.as_deref(),
    );

    let addr = SocketAddr::new(host, settings.listen_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    Ok(())
}

fn router(state: AppState, telegram_token: Option<&str>) -> Router {
    let mut app = Router::new()
        .route("/", get(index))
        .route("/download", get(download))
        .route("/listen", get(listen))
        .route("/static/{file}", get(static_file));
    if let Some(token) = telegram_token {
        app = app.route(&format!("/{token}"), post(telegram_webhook));
    }
    app.with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

#[derive(Debug, Default, Deserialize)]
struct DownloadParams {
    #[serde(default)]
    v: Option<String>,
    #[serde(default)]
    mp3: Option<String>,
}

async fn download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> ApiResult<Response> {
    let raw = params
        .v
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("Must specify 'v' parameter"))?;
    let format = (params.mp3.as_deref() == Some("on"))
        .then(|| AudioFormat::parse("mp3"))
        .flatten();
    info!(v = %raw, format = ?format, "received download request");

    let resolution = state
        .downloader
        .request(&raw, format.as_ref())
        .await
        .map_err(|err| {
            warn!(%err, "download request failed");
            ApiError::from(err)
        })?;

    let location = format!("/listen?{}", playback_query(&resolution.file_name));
    let location = HeaderValue::from_str(&location)
        .map_err(|err| ApiError::internal(format!("invalid redirect target: {err}")))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ListenParams {
    #[serde(default)]
    v: Option<String>,
    #[serde(default)]
    t: Option<String>,
}

async fn listen(Query(params): Query<ListenParams>) -> ApiResult<Response> {
    let file_name = params
        .v
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("Must specify 'v' parameter"))?;
    let t = params
        .t
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("Must specify 't' parameter"))?;
    let start: i64 = t
        .parse()
        .map_err(|_| ApiError::bad_request("Parameter 't' must be integer"))?;

    let page = render_listen_page(&file_name, start);
    Ok((
        [(header::HeaderName::from_static("feature-policy"), "autoplay 'self'")],
        Html(page),
    )
        .into_response())
}

fn render_listen_page(file_name: &str, start: i64) -> String {
    let title = escape_html(file_name);
    let src = format!("{STATIC_PREFIX}{}", urlencoding::encode(file_name));
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
</head>
<body>
<h1>{title}</h1>
<audio controls autoplay preload="auto" src="{src}#t={start}"></audio>
<p><a href="{src}" download>{title}</a></p>
</body>
</html>
"#
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

async fn static_file(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_plain_file_name(&file) {
        return Err(ApiError::not_found("file not found"));
    }
    serve_file(state.downloader.store().path_for(&file), &headers).await
}

async fn serve_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let mime = MimeGuess::from_path(&path).first_or_octet_stream();
    let content_type = header_value(mime.as_ref())?;
    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let response = match range {
        Some((start, _)) if start >= size => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, header_value(&format!("bytes */{size}"))?)],
        )
            .into_response(),
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (
                        header::CONTENT_RANGE,
                        header_value(&format!("bytes {start}-{end}/{size}"))?,
                    ),
                    (header::CONTENT_LENGTH, HeaderValue::from(length)),
                    (header::ACCEPT_RANGES, HeaderValue::from_static("bytes")),
                    (header::CONTENT_TYPE, content_type),
                ],
                Body::from_stream(ReaderStream::new(file.take(length))),
            )
                .into_response()
        }
        None => (
            [
                (header::CONTENT_LENGTH, HeaderValue::from(size)),
                (header::ACCEPT_RANGES, HeaderValue::from_static("bytes")),
                (header::CONTENT_TYPE, content_type),
            ],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response(),
    };
    Ok(response)
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| ApiError::internal(err.to_string()))
}

/// Parses a single `bytes=` range against a file of `size` bytes.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let range = value.to_str().ok()?.trim().strip_prefix("bytes=")?.trim();
    let (start, end) = range.split_once('-')?;

    if start.is_empty() {
        // "-N" asks for the last N bytes.
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix), size.saturating_sub(1)));
    }

    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        size.saturating_sub(1)
    } else {
        end.parse().ok()?
    };
    (end >= start).then_some((start, end))
}

async fn telegram_webhook(State(state): State<AppState>, Json(update): Json<Update>) -> StatusCode {
    let Some(bot) = state.bot.clone() else {
        return StatusCode::NOT_FOUND;
    };
    tokio::spawn(async move { bot.handle_update(update).await });
    StatusCode::OK
}
