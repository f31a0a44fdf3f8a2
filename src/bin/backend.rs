#![forbid(unsafe_code)]

//! Axum backend for the YouTube to MP3 converter.
//!
//! Each browser gets a cookie session holding its conversion quota. The
//! quota lock is held for the whole conversion, so two requests from the
//! same session never race past the limit while other sessions run in
//! parallel.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use axum::{
    Form, Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use clap::Parser;
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tokio::{signal, sync::Mutex as AsyncMutex};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use ytmp3_tools::config::{RuntimeOverrides, resolve_runtime_config};
use ytmp3_tools::conversion::{
    ConversionOutcome, ConversionWorkflow, QuotaCounter, download_link,
};
use ytmp3_tools::error::{ConversionError, ConversionResult};
use ytmp3_tools::library::{ConversionLibrary, ConversionRecord};
use ytmp3_tools::security::ensure_not_root;
use ytmp3_tools::storage::{AUDIO_CONTENT_TYPE, FileRetrieval, RetrievedFile};
use ytmp3_tools::ytdlp::YtDlp;

const SESSION_COOKIE: &str = "ytmp3_session";
const SESSION_ID_BYTES: usize = 32;
const SUCCESS_MESSAGE: &str = "Video successfully converted to MP3!";
const DEFAULT_LOG_FILTER: &str = "info,tower_http=info";
/// Idle time after which a session and its quota are forgotten.
const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Parser)]
#[command(name = "backend", about = "Serve the YouTube to MP3 converter")]
struct BackendArgs {
    /// Directory holding converted_files/ and library.db
    #[arg(long)]
    media_root: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Conversions allowed per session
    #[arg(long)]
    conversion_limit: Option<u32>,
    /// Upper bound for each yt-dlp invocation
    #[arg(long)]
    tool_timeout_secs: Option<u64>,
    #[arg(long)]
    ytdlp_bin: Option<PathBuf>,
    /// Optional .env file consulted after the process environment
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            media_root: self.media_root,
            host: self.host,
            port: self.port,
            conversion_limit: self.conversion_limit,
            tool_timeout_secs: self.tool_timeout_secs,
            ytdlp_bin: self.ytdlp_bin,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/YTMP3_HOST")
}

type Workflow = ConversionWorkflow<YtDlp, ConversionLibrary>;
type SharedQuota = Arc<AsyncMutex<QuotaCounter>>;

#[derive(Clone)]
struct AppState {
    workflow: Arc<Workflow>,
    files: Arc<FileRetrieval>,
    sessions: Arc<SessionStore>,
}

/// In-memory session map. Sessions idle for longer than the TTL are
/// dropped whenever a new session is created.
struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

struct SessionEntry {
    quota: SharedQuota,
    last_seen: Instant,
}

struct Session {
    id: String,
    quota: SharedQuota,
    is_new: bool,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl SessionStore {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the session named by the request cookie, or a fresh one when
    /// the cookie is absent, unknown or expired.
    fn resolve(&self, jar: &CookieJar) -> Session {
        let id = jar.get(SESSION_COOKIE).map(|cookie| cookie.value());
        self.resolve_at(id, Instant::now())
    }

    fn resolve_at(&self, id: Option<&str>, now: Instant) -> Session {
        let mut sessions = self.sessions.lock();
        if let Some(id) = id.filter(|id| !id.is_empty())
            && let Some(entry) = sessions.get_mut(id)
            && now.saturating_duration_since(entry.last_seen) < self.ttl
        {
            entry.last_seen = now;
            return Session {
                id: id.to_string(),
                quota: entry.quota.clone(),
                is_new: false,
            };
        }

        // A quota still referenced elsewhere belongs to an in-flight request.
        let ttl = self.ttl;
        let before = sessions.len();
        sessions.retain(|_, entry| {
            now.saturating_duration_since(entry.last_seen) < ttl
                || Arc::strong_count(&entry.quota) > 1
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "evicted idle sessions");
        }

        let id = new_session_id();
        let quota = SharedQuota::default();
        sessions.insert(
            id.clone(),
            SessionEntry {
                quota: quota.clone(),
                last_seen: now,
            },
        );
        Session {
            id,
            quota,
            is_new: true,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl Session {
    /// Adds the session cookie to `jar` when the session was just created.
    fn attach_cookie(&self, jar: CookieJar, ttl: Duration) -> CookieJar {
        if !self.is_new {
            return jar;
        }
        let max_age = time::Duration::seconds(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
        let cookie = Cookie::build((SESSION_COOKIE, self.id.clone()))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(max_age)
            .build();
        jar.add(cookie)
    }

    /// Remaining conversions, or `None` while a conversion holds the lock.
    fn remaining(&self, limit: u32) -> Option<u32> {
        self.quota
            .try_lock()
            .ok()
            .map(|quota| quota.remaining(limit))
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "record_not_found",
            message: message.into(),
        }
    }
}

impl From<ConversionError> for ApiError {
    fn from(err: ConversionError) -> Self {
        Self {
            status: StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: err.code(),
            message: err.user_message().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct ConvertParams {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MusicFilter {
    file: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConvertResponse {
    title: String,
    file_name: String,
    download_link: String,
    message: &'static str,
}

impl From<ConversionOutcome> for ConvertResponse {
    fn from(outcome: ConversionOutcome) -> Self {
        Self {
            title: outcome.title,
            file_name: outcome.output_file_name,
            download_link: outcome.download_link,
            message: SUCCESS_MESSAGE,
        }
    }
}

/// Library entry as exposed over HTTP; the on-disk path stays private.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MusicEntry {
    id: i64,
    title: String,
    source_url: String,
    file_name: String,
    download_link: String,
    created_at: String,
}

impl From<ConversionRecord> for MusicEntry {
    fn from(record: ConversionRecord) -> Self {
        Self {
            id: record.id,
            download_link: download_link(&record.output_file_name),
            title: record.title,
            source_url: record.source_url,
            file_name: record.output_file_name,
            created_at: record.created_at,
        }
    }
}

fn init_tracing() {
    let env_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::fmt().with_env_filter(&env_filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    init_tracing();
    ensure_not_root("backend")?;

    let config = resolve_runtime_config(args.into_overrides())?;
    let host = parse_host_arg(&config.host)?;

    let library = ConversionLibrary::open(&config.database_path())
        .await
        .context("opening conversion library")?;

    let ytdlp = YtDlp::new(config.ytdlp_bin.clone(), config.tool_timeout);
    match ytdlp.ensure_available().await {
        Ok(version) => info!(binary = %ytdlp.binary().display(), %version, "yt-dlp found"),
        // Keep serving downloads and the library even without the tool.
        Err(err) => warn!(binary = %ytdlp.binary().display(), error = %err, "yt-dlp is not usable"),
    }

    let storage_dir = config.storage_dir();
    let state = AppState {
        workflow: Arc::new(ConversionWorkflow::new(
            ytdlp,
            library,
            storage_dir.clone(),
            config.conversion_limit,
        )),
        files: Arc::new(FileRetrieval::new(storage_dir)),
        sessions: Arc::new(SessionStore::default()),
    };

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        %addr,
        media_root = %config.media_root.display(),
        limit = config.conversion_limit,
        "converter listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index).post(submit_form))
        .route("/api", get(convert_api))
        .route("/api/music", get(list_music))
        .route("/api/music/{id}", get(get_music))
        .route("/download/{filename}", get(download_file))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}

async fn run_conversion(
    state: &AppState,
    session: &Session,
    url: &str,
) -> ConversionResult<ConversionOutcome> {
    let mut quota = session.quota.lock().await;
    state.workflow.convert(url, &mut quota).await
}

async fn index(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Html<String>) {
    let session = state.sessions.resolve(&jar);
    let view = PageView {
        remaining: session.remaining(state.workflow.limit()),
        ..PageView::default()
    };
    (
        session.attach_cookie(jar, state.sessions.ttl),
        Html(render_page(&view)),
    )
}

async fn submit_form(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(params): Form<ConvertParams>,
) -> (CookieJar, Html<String>) {
    let session = state.sessions.resolve(&jar);
    let url = params.url.unwrap_or_default();
    let mut view = match run_conversion(&state, &session, &url).await {
        Ok(outcome) => PageView {
            outcome: Some(outcome),
            ..PageView::default()
        },
        Err(err) => PageView {
            url,
            error: Some(err.user_message()),
            ..PageView::default()
        },
    };
    view.remaining = session.remaining(state.workflow.limit());

    (
        session.attach_cookie(jar, state.sessions.ttl),
        Html(render_page(&view)),
    )
}

async fn convert_api(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<ConvertParams>,
) -> (CookieJar, Response) {
    let session = state.sessions.resolve(&jar);
    let url = params.url.unwrap_or_default();
    let response = match run_conversion(&state, &session, &url).await {
        Ok(outcome) => Json(ConvertResponse::from(outcome)).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    };
    (session.attach_cookie(jar, state.sessions.ttl), response)
}

/// Whole library, or only the conversions of one file with `?file=`.
async fn list_music(
    State(state): State<AppState>,
    Query(filter): Query<MusicFilter>,
) -> ApiResult<Json<Vec<MusicEntry>>> {
    let library = state.workflow.store();
    let records = match filter.file.as_deref() {
        Some(file) => library.find_by_file_name(file).await,
        None => library.list().await,
    }
    .map_err(|err| {
        error!(error = %err, "listing conversions failed");
        ApiError::internal("could not load the music library")
    })?;
    Ok(Json(records.into_iter().map(MusicEntry::from).collect()))
}

async fn get_music(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<MusicEntry>> {
    let record = state.workflow.store().get(id).await.map_err(|err| {
        error!(id, error = %err, "loading conversion failed");
        ApiError::internal("could not load the music library")
    })?;
    record
        .map(|record| Json(MusicEntry::from(record)))
        .ok_or_else(|| ApiError::not_found("no conversion with this id"))
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Response> {
    let retrieved = state.files.retrieve(&filename).await?;
    Ok(stream_file(retrieved, &filename))
}

fn stream_file(retrieved: RetrievedFile, file_name: &str) -> Response {
    let body = Body::from_stream(ReaderStream::new(retrieved.file));
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(AUDIO_CONTENT_TYPE),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(retrieved.len));
    let disposition = format!("attachment; filename=\"{}\"", file_name.replace('"', ""));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

#[derive(Debug, Default)]
struct PageView {
    url: String,
    outcome: Option<ConversionOutcome>,
    error: Option<&'static str>,
    remaining: Option<u32>,
}

fn render_page(view: &PageView) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>YouTube to MP3</title>\n</head>\n<body>\n<h1>YouTube to MP3</h1>\n",
    );

    if let Some(message) = view.error {
        html.push_str(&format!(
            "<p class=\"error\">{}</p>\n",
            escape_html(message)
        ));
    }
    if let Some(outcome) = &view.outcome {
        html.push_str(&format!(
            "<p class=\"success\">{}</p>\n<p><a href=\"{}\" download>Download {}</a></p>\n",
            SUCCESS_MESSAGE,
            escape_html(&outcome.download_link),
            escape_html(&outcome.output_file_name),
        ));
    }

    html.push_str(&format!(
        "<form method=\"post\" action=\"/\">\n\
         <label for=\"url\">YouTube URL</label>\n\
         <input type=\"url\" id=\"url\" name=\"url\" value=\"{}\" required>\n\
         <button type=\"submit\">Convert</button>\n</form>\n",
        escape_html(&view.url)
    ));
    if let Some(remaining) = view.remaining {
        html.push_str(&format!(
            "<p class=\"quota\">Conversions remaining: {remaining}</p>\n"
        ));
    }
    html.push_str("</body>\n</html>\n");
    html
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
