use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use dice_forecast_api::feed::DEFAULT_FEED_TIMEOUT_MS;
use dice_forecast_api::{
    CapitalAdvice, FeedClient, FeedError, ForecastApi, PollReport, StoreUnavailable,
};
use dice_forecast_core::{
    EnsembleConfig, ForecastError, ForecastReport, HistoryStats, IngestReport, Round, RoundInput,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Clone)]
struct ServiceState {
    api: ForecastApi,
    feed: Option<FeedClient>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    polling: bool,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_ready_total: AtomicU64,
    feed_unavailable_total: AtomicU64,
    schema_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_ready_total: u64,
    feed_unavailable_total: u64,
    schema_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "dice-forecast-service")]
#[command(about = "Local HTTP service for dice forecasts")]
struct Args {
    #[arg(long, default_value = "./dice_forecast.sqlite3")]
    db: PathBuf,
    /// Ensemble config JSON file; stored as the active config when given.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// Remote feed to poll in the background; polling is off without it.
    #[arg(long)]
    feed_url: Option<String>,
    #[arg(long, default_value_t = 30)]
    poll_interval_secs: u64,
    #[arg(long, default_value_t = DEFAULT_FEED_TIMEOUT_MS)]
    feed_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({ "rejection": rejection.to_string() })),
        )
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();

        if let Some(forecast_err) = err.downcast_ref::<ForecastError>() {
            return match forecast_err {
                ForecastError::NotReady => {
                    Self::failure(StatusCode::SERVICE_UNAVAILABLE, "not_ready", message, None)
                }
                ForecastError::Validation(_) => {
                    Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
                }
                ForecastError::Configuration(_) => Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    message,
                    None,
                ),
            };
        }

        if let Some(feed_err) = err.downcast_ref::<FeedError>() {
            return match feed_err {
                FeedError::Incomplete(_) => Self::failure(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "validation_error",
                    message,
                    None,
                ),
                FeedError::Status(code) => Self::failure(
                    StatusCode::BAD_GATEWAY,
                    "feed_unavailable",
                    message,
                    Some(json!({ "upstream_status": code })),
                ),
                FeedError::Transport(_) | FeedError::InvalidJson(_) => {
                    Self::failure(StatusCode::BAD_GATEWAY, "feed_unavailable", message, None)
                }
            };
        }

        if err.downcast_ref::<StoreUnavailable>().is_some() {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "schema_unavailable",
                format!("{err:#}"),
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ForecastApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                if failure.status.is_server_error() && failure.code != "not_ready" {
                    warn!(operation = operation_label, code = failure.code, error = %format!("{err:#}"), "request failed");
                }
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "not_ready" => &self.not_ready_total,
            "feed_unavailable" => &self.feed_unavailable_total,
            "schema_unavailable" => &self.schema_unavailable_total,
            "internal_error" => &self.internal_error_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_ready_total: self.not_ready_total.load(Ordering::Relaxed),
            feed_unavailable_total: self.feed_unavailable_total.load(Ordering::Relaxed),
            schema_unavailable_total: self.schema_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/forecast", get(forecast))
        .route("/v1/stats", get(stats))
        .route("/v1/history", get(history))
        .route("/v1/capital-advice", get(capital_advice))
        .route("/v1/rounds", post(rounds_append))
        .route("/v1/poll", post(poll))
        .with_state(state)
}

/// Polls the feed every `interval` until the task is aborted. Failures are
/// logged and the loop keeps going.
fn spawn_poll_loop(api: ForecastApi, client: FeedClient, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let api = api.clone();
            let client = client.clone();
            match tokio::task::spawn_blocking(move || api.poll_once(&client)).await {
                Ok(Ok(report)) if report.new => {
                    info!(round_id = report.round_id, "poll ingested new round");
                }
                Ok(Ok(report)) => {
                    tracing::debug!(round_id = report.round_id, "poll saw no new round");
                }
                Ok(Err(err)) => warn!(error = %format!("{err:#}"), "poll failed"),
                Err(err) => warn!(error = %err, "poll task join failure"),
            }
        }
    })
}

fn load_config(path: &std::path::Path) -> Result<EnsembleConfig> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    Ok(EnsembleConfig::from_json(&value)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let config = args.config.as_deref().map(load_config).transpose()?;
    let api = ForecastApi::open(&args.db, config)?;
    let feed = args
        .feed_url
        .map(|url| FeedClient::new(url, args.feed_timeout_ms));

    let _poller = feed.clone().map(|client| {
        info!(feed_url = client.url(), interval_secs = args.poll_interval_secs, "background polling enabled");
        spawn_poll_loop(
            api.clone(),
            client,
            Duration::from_secs(args.poll_interval_secs.max(1)),
        )
    });

    let state = ServiceState {
        api,
        feed,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "dice forecast service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        polling: state.feed.is_some(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn forecast(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ForecastReport>>, ServiceFailure> {
    let report = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "forecast",
            |api| api.forecast(),
        )
        .await?;
    Ok(Json(envelope(report)))
}

async fn stats(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<HistoryStats>>, ServiceFailure> {
    let stats = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "stats",
            |api| api.stats(),
        )
        .await?;
    Ok(Json(envelope(stats)))
}

async fn history(
    State(state): State<ServiceState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ServiceEnvelope<Vec<Round>>>, ServiceFailure> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let rounds = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "history",
            move |api| api.history(limit),
        )
        .await?;
    Ok(Json(envelope(rounds)))
}

async fn capital_advice(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<CapitalAdvice>>, ServiceFailure> {
    let advice = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "capital_advice",
            |api| api.capital_advice(),
        )
        .await?;
    Ok(Json(envelope(advice)))
}

async fn rounds_append(
    State(state): State<ServiceState>,
    payload: Result<Json<RoundInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<IngestReport>>, ServiceFailure> {
    let Json(input) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let report = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "rounds_append",
            move |api| api.ingest(&input),
        )
        .await?;
    Ok(Json(envelope(report)))
}

async fn poll(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<PollReport>>, ServiceFailure> {
    let Some(client) = state.feed.clone() else {
        state.telemetry.record_failure("feed_unavailable", false);
        return Err(ServiceState::failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "feed_unavailable",
            "no feed url configured; start the service with --feed-url",
            None,
        ));
    };
    let report = state
        .run_blocking(
            StatusCode::BAD_GATEWAY,
            "feed_unavailable",
            "poll",
            move |api| api.poll_once(&client),
        )
        .await?;
    Ok(Json(envelope(report)))
}
