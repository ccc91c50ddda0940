#![forbid(unsafe_code)]

//! Axum backend for StudyBeats.
//!
//! Serves embed resolutions and the stored link list to the UI, and exposes
//! two maintenance triggers (availability sweep, title backfill) guarded by a
//! bearer secret. The same sweep also runs on a timer when configured.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use studybeats_tools::{
    app::{INITIAL_CLEANUP_DELAY, Services, init_tracing},
    classify::Provider,
    config::{RuntimeOverrides, RuntimeSettings, resolve_settings},
    resolver::{EmbedResolver, ResolveOptions, Resolution},
    security::{TriggerAccess, check_trigger_access, ensure_not_root},
    store::{LinkFilter, LinkItem, LinkStore},
    sweeper::{AvailabilitySweeper, SweepReport},
    titles::{BackfillReport, TitleBackfill},
};
use tokio::{signal, task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
struct BackendArgs {
    settings: RuntimeSettings,
    listen_host: IpAddr,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some((flag, value)) = arg.split_once('=')
                && flag.starts_with("--")
            {
                apply_flag(&mut overrides, flag, value.to_string())?;
                continue;
            }
            match arg.as_str() {
                "--data-root" | "--host" | "--port" | "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("{arg} requires a value"))?;
                    apply_flag(&mut overrides, &arg, value)?;
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let settings = resolve_settings(overrides)?;
        let listen_host = parse_host_arg(&settings.host)?;
        Ok(Self {
            settings,
            listen_host,
        })
    }
}

fn apply_flag(overrides: &mut RuntimeOverrides, flag: &str, value: String) -> Result<()> {
    match flag {
        "--data-root" => overrides.data_root = Some(PathBuf::from(value)),
        "--host" => overrides.host = Some(value),
        "--port" => overrides.port = Some(parse_port_arg(&value)?),
        "--env-file" => overrides.env_path = Some(PathBuf::from(value)),
        _ => return Err(anyhow!("unknown argument: {flag}")),
    }
    Ok(())
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/STUDYBEATS_HOST")
}

#[derive(Clone)]
struct AppState {
    resolver: Arc<EmbedResolver>,
    store: Arc<dyn LinkStore>,
    sweeper: Arc<AvailabilitySweeper>,
    backfill: Arc<TitleBackfill>,
    sweep_secret: Option<Arc<str>>,
    /// Held while a sweep or backfill runs; at most one at a time.
    maintenance: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    fn new(services: &Services, sweep_secret: Option<String>) -> Self {
        Self {
            resolver: Arc::clone(&services.resolver),
            store: services.store.clone(),
            sweeper: Arc::clone(&services.sweeper),
            backfill: Arc::clone(&services.backfill),
            sweep_secret: sweep_secret.map(Arc::from),
            maintenance: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> ApiResult<()> {
        match check_trigger_access(self.sweep_secret.as_deref(), headers) {
            TriggerAccess::Granted => Ok(()),
            TriggerAccess::Disabled => Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "maintenance triggers are not configured",
            )),
            TriggerAccess::Denied => Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "missing or invalid bearer token",
            )),
        }
    }
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

    fn internal(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (
            self.status,
            [(header::CONTENT_TYPE, "application/json")],
            Json(body),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    ensure_not_root("backend")?;

    let BackendArgs {
        settings,
        listen_host,
    } = BackendArgs::parse()?;

    let services = Services::open(&settings)
        .await
        .context("initializing services")?;
    services.metadata.spawn_initial_cleanup(INITIAL_CLEANUP_DELAY);

    let state = AppState::new(&services, settings.sweep_secret.clone());
    if state.sweep_secret.is_none() {
        warn!("STUDYBEATS_SWEEP_SECRET not set; maintenance triggers disabled");
    }
    if let Some(period) = settings.sweep_interval() {
        info!("scheduled sweep every {}h", settings.sweep_interval_hours);
        spawn_scheduled_sweep(state.clone(), period);
    }

    let addr = SocketAddr::new(listen_host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/embed", get(resolve_embed))
        .route("/api/links", get(list_links))
        .route("/api/sweep", post(trigger_sweep))
        .route("/api/titles/backfill", post(trigger_backfill))
        .fallback(|| async { ApiError::new(StatusCode::NOT_FOUND, "endpoint not found") })
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}

fn spawn_scheduled_sweep(state: AppState, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the first sweep waits a full period.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let _guard = state.maintenance.lock().await;
            match state.sweeper.sweep().await {
                Ok(report) => info!(
                    "scheduled sweep removed {} of {} checked links",
                    report.removed, report.checked
                ),
                Err(err) => warn!("scheduled sweep failed: {err:#}"),
            }
        }
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmbedQuery {
    url: Option<String>,
    provider: Option<String>,
    /// Title currently shown for the link.
    title: Option<String>,
    needs_title: Option<bool>,
}

async fn resolve_embed(
    State(state): State<AppState>,
    Query(query): Query<EmbedQuery>,
) -> ApiResult<Json<Resolution>> {
    let url = query
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("url query parameter is required"))?;
    let provider_hint = match query.provider.as_deref() {
        Some(raw) => Some(
            Provider::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown provider {raw:?}")))?,
        ),
        None => None,
    };
    let options = ResolveOptions {
        provider_hint,
        needs_title: query.needs_title.unwrap_or(true),
        current_title: query.title,
    };
    Ok(Json(state.resolver.resolve_with(url, &options).await))
}

#[derive(Debug, Default, Deserialize)]
struct LinksQuery {
    genre: Option<String>,
    provider: Option<String>,
}

impl LinksQuery {
    fn filter(&self) -> ApiResult<LinkFilter> {
        if let Some(genre) = self.genre.as_deref().map(str::trim)
            && !genre.is_empty()
        {
            return Ok(LinkFilter::Genre(genre.to_string()));
        }
        match self.provider.as_deref() {
            Some(raw) => Provider::parse(raw)
                .map(LinkFilter::Provider)
                .ok_or_else(|| ApiError::bad_request(format!("unknown provider {raw:?}"))),
            None => Ok(LinkFilter::All),
        }
    }
}

async fn list_links(
    State(state): State<AppState>,
    Query(query): Query<LinksQuery>,
) -> ApiResult<Json<Vec<LinkItem>>> {
    let filter = query.filter()?;
    let links = state
        .store
        .list_links(&filter)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(links))
}

#[derive(Debug, Serialize)]
struct TriggerResponse<T> {
    status: &'static str,
    #[serde(flatten)]
    report: T,
}

impl<T> TriggerResponse<T> {
    fn ok(report: T) -> Json<Self> {
        Json(Self {
            status: "ok",
            report,
        })
    }
}

fn busy() -> ApiError {
    ApiError::new(StatusCode::CONFLICT, "another maintenance run is in progress")
}

async fn trigger_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<TriggerResponse<SweepReport>>> {
    state.authorize(&headers)?;
    let _guard = state.maintenance.try_lock().map_err(|_| busy())?;
    let report = state.sweeper.sweep().await.map_err(ApiError::internal)?;
    Ok(TriggerResponse::ok(report))
}

async fn trigger_backfill(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<TriggerResponse<BackfillReport>>> {
    state.authorize(&headers)?;
    let _guard = state.maintenance.try_lock().map_err(|_| busy())?;
    let report = state.backfill.run().await.map_err(ApiError::internal)?;
    Ok(TriggerResponse::ok(report))
}
