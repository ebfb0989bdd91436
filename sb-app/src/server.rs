//! Salonbot worker: wires stores, booking, model and channels together and
//! serves the HTTP surface.

use crate::backends;
use crate::channels;
use crate::clock::{Clock, SystemClock};
use crate::config::{SalonbotConfig, ServerConfig};
use crate::context_store::{ContextConfig, ContextStore};
use crate::debounce::{DebounceBatcher, DebounceConfig};
use crate::gateway::Gateway;
use crate::history::HistoryStore;
use crate::outbound::ChannelRegistry;
use crate::routes;
use crate::store::KeyedStore;
use crate::tenants::TenantRegistry;
use crate::turn::{TurnConfig, TurnController};
use anyhow::Result;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::{Extension, Router};
use sb_booking::{CatalogCache, CommandExecutor, ExecutorConfig};
use sb_channels::{InboundMessage, OutboundMessage, TenantId};
use sb_llm::LanguageModel;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub worker_id: String,
    pub store_backend: &'static str,
    pub model: String,
    pub gateway: Arc<Gateway>,
    pub contexts: Arc<ContextStore>,
    pub batcher: Arc<DebounceBatcher>,
    pub tenants: Arc<TenantRegistry>,
    pub channels: Vec<String>,
    pub started_at: Instant,
}

/// Everything a running worker owns.
pub struct Runtime {
    pub state: Arc<AppState>,
    pub gateway: Arc<Gateway>,
    pub store: Arc<dyn KeyedStore>,
    pub channels: Arc<ChannelRegistry>,
    pub routers: Vec<Router>,
    pub inbound_tx: mpsc::Sender<InboundMessage>,
}

pub fn build_runtime(
    cfg: &SalonbotConfig,
    model: Arc<dyn LanguageModel>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> Result<Runtime> {
    let worker_id = cfg.worker_id();
    let tenants = Arc::new(TenantRegistry::from_config(&cfg.tenants)?);
    let store = backends::build_store(cfg, clock.clone())?;

    let batcher = Arc::new(DebounceBatcher::new(
        store.clone(),
        clock.clone(),
        DebounceConfig {
            window: cfg.debounce.window(),
            max_batch_age: cfg.debounce.max_batch_age(),
            joiner: cfg.debounce.joiner.clone(),
            pending_grace: cfg.debounce.pending_grace(),
        },
    ));
    let contexts = Arc::new(ContextStore::new(
        store.clone(),
        clock.clone(),
        ContextConfig {
            worker_id: worker_id.clone(),
            abandon_after: Duration::from_secs(cfg.processing.abandon_after_seconds),
            terminal_ttl: Duration::from_secs(cfg.processing.terminal_ttl_seconds),
        },
    ));
    let history = Arc::new(HistoryStore::new(
        store.clone(),
        cfg.history.max_messages,
        Duration::from_secs(cfg.history.ttl_seconds),
    ));

    let booking = backends::build_booking_backend(cfg)?;
    let catalog = Arc::new(CatalogCache::new(
        booking.clone(),
        Duration::from_secs(cfg.booking.catalog_ttl_seconds),
    ));
    let executor = Arc::new(CommandExecutor::with_default_handlers(
        booking,
        catalog.clone(),
        ExecutorConfig {
            call_timeout: Duration::from_secs(cfg.booking.timeout_seconds),
            max_retries: cfg.booking.max_retries,
            retry_backoff: Duration::from_millis(cfg.booking.retry_backoff_ms),
        },
    ));

    let channel_registry = Arc::new(channels::build_channel_registry(cfg, &tenants)?);
    let model_name = model.model().to_string();
    let controller = Arc::new(TurnController::new(
        batcher.clone(),
        contexts.clone(),
        history,
        tenants.clone(),
        catalog,
        executor,
        model,
        channel_registry.clone(),
        clock.clone(),
        TurnConfig {
            busy_policy: cfg.processing.busy_policy,
            queue_poll: Duration::from_millis(cfg.processing.queue_poll_ms),
            queue_max_wait: Duration::from_millis(cfg.processing.queue_max_wait_ms),
            defer_retry: Duration::from_millis(cfg.processing.defer_retry_ms),
            llm_timeout: Duration::from_secs(cfg.llm.timeout_seconds),
            llm_max_retries: cfg.llm.max_retries,
            llm_retry_backoff: Duration::from_millis(cfg.llm.retry_backoff_ms),
        },
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let gateway = Arc::new(Gateway::new(
        tenants.clone(),
        batcher.clone(),
        controller,
        clock,
        inbound_rx,
        shutdown,
    ));
    let routers = channels::webhook_routers(cfg, tenants.clone(), gateway.clone());

    let state = Arc::new(AppState {
        worker_id,
        store_backend: store.backend_name(),
        model: model_name,
        gateway: gateway.clone(),
        contexts,
        batcher,
        tenants,
        channels: channel_registry.channel_ids(),
        started_at: Instant::now(),
    });

    Ok(Runtime {
        state,
        gateway,
        store,
        channels: channel_registry,
        routers,
        inbound_tx,
    })
}

/// The full HTTP application with the standard middleware stack.
pub fn app(state: Arc<AppState>, routers: Vec<Router>, server: &ServerConfig) -> Router {
    let mut router = routes::router().layer(Extension(state));
    for channel_router in routers {
        router = router.merge(channel_router);
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
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

    router
        .layer(GlobalConcurrencyLimitLayer::new(server.max_concurrent_requests))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(server.request_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = SalonbotConfig::load(config_path).await?;
    let addr: SocketAddr = cfg
        .server
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {}: {e}", cfg.server.bind_addr))?;
    let model = backends::build_language_model(&cfg)?;
    let shutdown = CancellationToken::new();
    let runtime = build_runtime(&cfg, model, Arc::new(SystemClock), shutdown.child_token())?;
    tracing::info!(
        worker_id = %runtime.state.worker_id,
        model = %runtime.state.model,
        store = runtime.state.store_backend,
        tenants = runtime.state.tenants.len(),
        channels = ?runtime.state.channels,
        busy_policy = ?cfg.processing.busy_policy,
        debounce_window_ms = cfg.debounce.window_ms,
        "server configuration loaded"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind failed for {addr}: {e}"))?;

    runtime.gateway.clone().start();
    for adapter in runtime.channels.adapters() {
        if let Err(e) = adapter.start(runtime.inbound_tx.clone()).await {
            tracing::error!(channel = adapter.channel_id(), error = %e, "channel failed to start");
        }
    }
    let sweeper = spawn_sweeper(
        runtime.store.clone(),
        Duration::from_secs(cfg.store.sweep_interval_seconds),
        shutdown.child_token(),
    );

    let app = app(runtime.state.clone(), runtime.routers, &cfg.server);
    tracing::info!(%addr, "salonbot serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "sweeper task join failed during shutdown");
    }
    Ok(())
}

/// Periodically drop expired records from the store.
fn spawn_sweeper(
    store: Arc<dyn KeyedStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "expired records purged"),
                Err(e) => tracing::warn!(error = %e, "store sweep failed"),
            }
        }
    })
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = SalonbotConfig::load(config_path).await?;
    let tenants = TenantRegistry::from_config(&cfg.tenants)?;
    let store = backends::build_store(&cfg, Arc::new(SystemClock))?;
    store.purge_expired().await?;
    backends::build_booking_backend(&cfg)?;
    let model = backends::build_language_model(&cfg)?;
    let channels = channels::build_channel_registry(&cfg, &tenants)?;
    tracing::info!(
        worker_id = %cfg.worker_id(),
        model = %model.model(),
        store = store.backend_name(),
        booking = ?cfg.booking.mode,
        tenants = tenants.len(),
        channels = ?channels.channel_ids(),
        "config ok"
    );
    println!(
        "salonbot doctor: ok (worker {}, model {}, store {}, {} tenant(s), channels {:?})",
        cfg.worker_id(),
        model.model(),
        store.backend_name(),
        tenants.len(),
        channels.channel_ids()
    );
    Ok(())
}

/// Print the conversation key a raw sender address maps to.
pub async fn normalize(config_path: Option<PathBuf>, tenant: &str, raw: &str) -> Result<()> {
    let cfg = SalonbotConfig::load(config_path).await?;
    let tenants = TenantRegistry::from_config(&cfg.tenants)?;
    let profile = tenants
        .get(&TenantId::new(tenant))
        .ok_or_else(|| anyhow::anyhow!("unknown tenant: {tenant}"))?;
    let key = profile
        .conversation_key(raw)
        .ok_or_else(|| anyhow::anyhow!("sender {raw:?} has no usable identifier"))?;
    println!("{key}");
    Ok(())
}

/// Send one message through a tenant's channel, bypassing the model.
pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    tenant: &str,
    channel: &str,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = SalonbotConfig::load(config_path).await?;
    let tenants = TenantRegistry::from_config(&cfg.tenants)?;
    let tenant = TenantId::new(tenant);
    if tenants.get(&tenant).is_none() {
        return Err(anyhow::anyhow!("unknown tenant: {tenant}"));
    }
    let channels = channels::build_channel_registry(&cfg, &tenants)?;
    let adapter = channels
        .get(channel, &tenant)
        .ok_or_else(|| anyhow::anyhow!("channel {channel} is not enabled for tenant {tenant}"))?;
    adapter
        .send(recipient, OutboundMessage::text(message))
        .await?;
    Ok(())
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
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::turn::test_support::ScriptedModel;

    pub const CONFIG: &str = r#"
[general]
worker_id = "worker-test"

[llm]
model = "scripted"

[debounce]
window_ms = 1000
max_batch_age_ms = 5000

[[tenants]]
id = "salon-1"
name = "Salon Aurora"
utc_offset = "+03:00"

[tenants.catalog]
slot_minutes = 60

[[tenants.catalog.services]]
id = "haircut"
name = "Women's haircut"

[[tenants.catalog.staff]]
id = "anna"
name = "Anna"
"#;

    pub fn runtime(reply: &str) -> Runtime {
        let cfg = SalonbotConfig::parse(CONFIG).expect("parse");
        cfg.validate().expect("valid");
        build_runtime(
            &cfg,
            Arc::new(ScriptedModel::replying(reply)),
            Arc::new(SystemClock),
            CancellationToken::new(),
        )
        .expect("runtime")
    }

    pub fn test_app(runtime: &Runtime) -> Router {
        let cfg = SalonbotConfig::parse(CONFIG).expect("parse");
        app(runtime.state.clone(), Vec::new(), &cfg.server)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::store::Expect;
    use axum::body::Body;
    use tower::ServiceExt;

    #[tokio::test]
    async fn responses_carry_a_request_id() {
        let runtime = runtime("hi");
        let response = test_app(&runtime)
            .oneshot(
                Request::get("/api/v1/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn runtime_uses_configured_worker_and_log_channel() {
        let runtime = runtime("hi");
        assert_eq!(runtime.state.worker_id, "worker-test");
        assert_eq!(runtime.state.store_backend, "memory");
        assert_eq!(runtime.state.channels, vec!["http".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_records() {
        let runtime = runtime("hi");
        runtime
            .store
            .put_if("stale", Expect::Absent, "x", Duration::ZERO)
            .await
            .expect("put");
        let shutdown = CancellationToken::new();
        let handle = spawn_sweeper(runtime.store.clone(), Duration::from_secs(1), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        handle.await.expect("join");
        assert!(runtime.store.get("stale").await.expect("get").is_none());
        assert_eq!(runtime.store.purge_expired().await.expect("purge"), 0);
    }
}
