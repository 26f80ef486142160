//! agentbridge server.
//!
//! Wires the agent service client, the chat channels, the monitors, and the
//! session router together, then serves the health endpoint until shutdown.

use crate::config::AppConfig;
use crate::gateway::Gateway;
use crate::monitor::{MonitorConfig, SessionMonitor};
use crate::registry::MonitorRegistry;
use crate::resolver::{LlmTransform, PassthroughTransform, TextTransform, numbered_sources};
use crate::router::SessionRouter;
use crate::routes;
use crate::scaling::{CloudRunScaler, ScalingPolicy};
use ab_agent::{AgentClient, AgentService};
use ab_channels::{ChannelAdapter, InboundMessage, TelegramAdapter};
use ab_llm::LlmClient;
use anyhow::Result;
use axum::Extension;
use axum::http::Request;
use axum::response::Response;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub started_at: Instant,
    pub monitors: Arc<MonitorRegistry>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AppConfig::load(config_path).await?;
    build_agent_client(&cfg)?;
    tracing::info!(
        model = %cfg.general.model,
        llm_key_configured = cfg.api_key_for_model().is_some(),
        agent_base_url = %cfg.agent.base_url,
        translation_enabled = cfg.translation.enabled,
        telegram_enabled = cfg.channels.telegram.enabled,
        scaling_enabled = cfg.scaling.enabled,
        poll_interval_seconds = cfg.monitor.poll_interval_seconds,
        monitor_timeout_seconds = cfg.monitor.timeout_seconds,
        "config ok"
    );
    Ok(())
}

pub async fn print_sources(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AppConfig::load(config_path).await?;
    let client = build_agent_client(&cfg)?;
    let sources = client.list_sources().await?;
    if sources.is_empty() {
        println!("no sources connected");
    } else {
        println!("{}", numbered_sources(&sources));
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AppConfig::load(config_path).await?;
    let started_at = Instant::now();
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    tracing::info!(
        bind_addr = %addr,
        model = %cfg.general.model,
        agent_base_url = %cfg.agent.base_url,
        require_plan_approval = cfg.agent.require_plan_approval,
        translation_enabled = cfg.translation.enabled,
        telegram_enabled = cfg.channels.telegram.enabled,
        scaling_enabled = cfg.scaling.enabled,
        "server configuration loaded"
    );

    let listener = preflight_bind_listener(addr).await?;

    let service: Arc<dyn AgentService> = Arc::new(build_agent_client(&cfg)?);
    let transform = build_transform(&cfg);
    let scaling = build_scaling(&cfg)?;
    let monitor = Arc::new(SessionMonitor::new(
        service.clone(),
        transform.clone(),
        MonitorConfig::from(&cfg.monitor),
    ));
    let monitors = MonitorRegistry::new(monitor, scaling);
    let router = Arc::new(SessionRouter::new(
        service.clone(),
        transform,
        monitors.clone(),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let channels = load_channels(&cfg, inbound_tx).await?;
    if channels.is_empty() {
        tracing::warn!("no chat channels enabled; only the health endpoint will be served");
    }

    let gateway = Arc::new(Gateway::new(
        started_at,
        router,
        service,
        channels.clone(),
        inbound_rx,
    ));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!(
        channel_count = channels.len(),
        channels = ?channels.keys().collect::<Vec<_>>(),
        "gateway started"
    );

    let state = Arc::new(AppState {
        started_at,
        monitors,
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::debug!(
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
        .layer(trace_layer);

    tracing::info!(%addr, "agentbridge serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }

    Ok(())
}

fn build_agent_client(cfg: &AppConfig) -> Result<AgentClient> {
    Ok(AgentClient::new(
        &cfg.agent.base_url,
        &cfg.agent.api_key,
        cfg.agent_request_timeout(),
    )?
    .with_default_branch(cfg.agent.default_branch.clone())
    .with_require_plan_approval(cfg.agent.require_plan_approval))
}

fn build_transform(cfg: &AppConfig) -> Arc<dyn TextTransform> {
    match cfg.api_key_for_model() {
        Some(api_key) => {
            let llm = LlmClient::new(&api_key, &cfg.general.model);
            tracing::info!(
                model = %cfg.general.model,
                provider = ?llm.provider(),
                "language model transform enabled"
            );
            Arc::new(LlmTransform::new(llm, &cfg.translation))
        }
        None => {
            if cfg.translation.enabled {
                tracing::warn!(
                    model = %cfg.general.model,
                    "translation is enabled but no api key matches the model; passing text through"
                );
            }
            Arc::new(PassthroughTransform)
        }
    }
}

fn build_scaling(cfg: &AppConfig) -> Result<ScalingPolicy> {
    if !cfg.scaling.enabled {
        return Ok(ScalingPolicy::disabled());
    }
    let scaler = CloudRunScaler::new(&cfg.scaling)?;
    tracing::info!(
        project = %cfg.scaling.project,
        region = %cfg.scaling.region,
        service = %cfg.scaling.service,
        active_min_instances = cfg.scaling.active_min_instances,
        idle_min_instances = cfg.scaling.idle_min_instances,
        "compute scaling enabled"
    );
    Ok(ScalingPolicy::new(Arc::new(scaler), &cfg.scaling))
}

async fn load_channels(
    cfg: &AppConfig,
    inbound_tx: mpsc::Sender<InboundMessage>,
) -> Result<HashMap<String, Arc<dyn ChannelAdapter>>> {
    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    if cfg.channels.telegram.enabled {
        let adapter = Arc::new(TelegramAdapter::new(&cfg.channels.telegram.bot_token)?);
        adapter.start(inbound_tx.clone()).await?;
        channels.insert(adapter.channel_id().to_string(), adapter);
    }
    Ok(channels)
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
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
