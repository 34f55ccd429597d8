//! Recap server.
//!
//! Wires Slack, the language model and the read-state store into a job
//! coordinator and mounts the slash-command routes on top.

use crate::config::RecapConfig;
use crate::coordinator::{Collaborators, CoordinatorSettings, JobCoordinator};
use crate::read_state::{ReadStateStore, SqliteReadStateStore};
use crate::routes;
use crate::summarizer::LlmSummaryEngine;
use anyhow::{Context, Result};
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use recap_channels::{ChannelId, ResponseUrlNotifier, SlackClient, UserId};
use recap_llm::LlmClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

pub struct RecapState {
    pub coordinator: Arc<JobCoordinator>,
    pub started_at: Instant,
    pub ack_timeout: Duration,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RecapConfig::load(config_path).await?;
    let read_state_path = cfg.read_state_path()?;
    let store = SqliteReadStateStore::open(&read_state_path)
        .await
        .with_context(|| format!("open read state at {}", read_state_path.display()))?;
    tracing::info!(
        model = %cfg.general.model,
        provider = ?recap_llm::detect_provider(&cfg.general.model),
        bind_addr = %cfg.bind_addr()?,
        read_state_path = %store.path().display(),
        window_hours = cfg.jobs.window_hours,
        "config ok"
    );
    Ok(())
}

pub async fn show_marker(config_path: Option<PathBuf>, user_id: &str, channel_id: &str) -> Result<()> {
    let cfg = RecapConfig::load(config_path).await?;
    let store = SqliteReadStateStore::open(cfg.read_state_path()?).await?;
    let user = UserId::new(user_id);
    let channel = ChannelId::new(channel_id);
    match store.get(&user, &channel).await? {
        Some(marker) => println!(
            "user={} channel={} position={} at={} updated_at={}",
            marker.user_id,
            marker.channel_id,
            marker.position,
            marker
                .position
                .to_datetime()
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "out of range".to_string()),
            marker.updated_at.to_rfc3339()
        ),
        None => println!("user={user} channel={channel} position=none (everything in the window is unread)"),
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RecapConfig::load(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.bind_addr()?;
    tracing::info!(
        bind_addr = %addr,
        model = %cfg.general.model,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        ack_timeout_ms = cfg.server.ack_timeout_ms,
        window_hours = cfg.jobs.window_hours,
        job_budget_seconds = cfg.jobs.job_budget_seconds,
        "recap starting"
    );

    let listener = preflight_bind_listener(addr).await?;
    let coordinator = build_coordinator(&cfg).await?;
    coordinator.spawn_sweeper(SWEEP_INTERVAL);

    let state = Arc::new(RecapState {
        coordinator: coordinator.clone(),
        started_at,
        ack_timeout: Duration::from_millis(cfg.server.ack_timeout_ms),
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let shutdown = CancellationToken::new();
    tracing::info!(%addr, "recap serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    coordinator.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn build_coordinator(cfg: &RecapConfig) -> Result<Arc<JobCoordinator>> {
    let token = cfg
        .slack_bot_token()
        .ok_or_else(|| anyhow::anyhow!("missing Slack bot token"))?;
    let slack = Arc::new(
        SlackClient::new(&token)?
            .with_page_limit(cfg.slack.page_limit)
            .with_max_pages(cfg.slack.max_pages)
            .with_page_delay(Duration::from_millis(cfg.slack.page_delay_ms))
            .with_channel_cache_ttl(Duration::from_secs(cfg.slack.channel_cache_ttl_seconds)),
    );

    let api_key = cfg
        .api_key_for_model()
        .ok_or_else(|| anyhow::anyhow!("missing API key for model {}", cfg.general.model))?;
    let llm = LlmClient::new(&api_key, &cfg.general.model)?
        .with_request_timeout(Duration::from_secs(cfg.jobs.summarize_timeout_seconds))?;
    tracing::info!(provider = ?llm.provider(), model = %llm.model(), "language model ready");
    let engine = Arc::new(LlmSummaryEngine::new(llm, cfg.jobs.max_transcript_chars));

    let notifier = Arc::new(ResponseUrlNotifier::new(Duration::from_secs(
        cfg.jobs.delivery_timeout_seconds,
    ))?);

    let read_state_path = cfg.read_state_path()?;
    let read_state = Arc::new(
        SqliteReadStateStore::open(&read_state_path)
            .await
            .with_context(|| format!("open read state at {}", read_state_path.display()))?,
    );
    tracing::info!(read_state_path = %read_state_path.display(), "read state ready");

    Ok(JobCoordinator::new(
        Collaborators {
            source: slack.clone(),
            directory: slack,
            engine,
            notifier,
            read_state,
        },
        CoordinatorSettings::from_config(&cfg.jobs),
    ))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
