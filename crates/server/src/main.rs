//! Dialler server entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use outdial_config::{load_settings, Settings};
use outdial_dialer::{
    ActivePhoneRegistry, CallContextRegistry, CallServices, ConversationRecorder, CostLedger,
    DidPool, Dispatcher, DispatcherConfig, ProductionCallDriver,
};
use outdial_llm::OpenAiClient;
use outdial_pipeline::{ProviderSttConnector, TtsClient};
use outdial_server::{create_router, AppState};
use outdial_telephony::CarrierClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration: config/default.yaml -> config/{env}.yaml -> env vars
    let env = std::env::var("OUTDIAL_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized; use eprintln for early logging
            eprintln!("Warning: failed to load config: {}. Using defaults.", e);
            Settings::default()
        }
    };

    init_tracing(&settings);
    tracing::info!("Starting dialler server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(environment = ?settings.environment, "Configuration loaded");

    // Prometheus metrics
    let metrics_handle = if settings.observability.metrics_enabled {
        outdial_server::metrics::init_metrics()
    } else {
        None
    };

    // Provider clients
    let carrier: Arc<CarrierClient> = Arc::new(CarrierClient::new(settings.carrier.clone())?);
    let tts = Arc::new(TtsClient::new(settings.tts.clone())?);
    let llm = Arc::new(OpenAiClient::new(settings.llm.clone())?);
    let stt = Arc::new(ProviderSttConnector::new(settings.stt.clone()));

    // Persistence is optional in development; the runtime degrades to
    // in-memory records when the database is unreachable
    let persistence = match outdial_persistence::init(&settings.persistence).await {
        Ok(layer) => {
            tracing::info!("Postgres persistence initialized");
            Some(layer)
        }
        Err(e) => {
            tracing::warn!("Persistence unavailable, running in-memory: {}", e);
            None
        }
    };

    // DID pool: configured numbers, refreshed from the carrier inventory
    // when none are configured
    let mut numbers = settings.carrier.numbers.clone();
    if numbers.is_empty() {
        match carrier.list_purchased_numbers().await {
            Ok(purchased) => {
                tracing::info!(count = purchased.len(), "Loaded DID inventory from carrier");
                numbers = purchased;
            }
            Err(e) => {
                tracing::warn!("Could not load carrier number inventory: {}", e);
            }
        }
    }
    let did_pool = Arc::new(DidPool::new(&numbers));
    tracing::info!(dids = did_pool.len(), "DID pool ready");

    // Process-wide call machinery
    let services = Arc::new(CallServices {
        carrier,
        tts,
        llm,
        stt,
        stt_linear16: settings.stt.is_linear16(),
        webhook_base_url: settings.server.webhook_base_url.clone(),
        transfer_number: RwLock::new(settings.dialer.transfer_number.clone()),
        verified_number: settings.carrier.verified_number.clone(),
        no_response_timeout: Duration::from_secs(settings.dialer.no_response_timeout_secs),
        contexts: Arc::new(CallContextRegistry::new()),
        registry: Arc::new(ActivePhoneRegistry::new()),
        recorder: Arc::new(ConversationRecorder::new()),
        ledger: Arc::new(CostLedger::new(settings.costs.clone())),
        persistence,
    });

    let driver = Arc::new(ProductionCallDriver::new(Arc::clone(&services)));
    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            max_concurrent_calls: settings.dialer.max_concurrent_calls,
            delay_between_calls: Duration::from_millis(settings.dialer.delay_between_calls_ms),
            max_origination_attempts: settings.dialer.max_origination_attempts,
            call_timeout: Duration::from_secs(settings.dialer.call_timeout_secs),
        },
        Arc::clone(&did_pool),
        Arc::clone(&services.registry),
        driver,
    );

    let state = AppState::new(
        Arc::clone(&services),
        Arc::clone(&dispatcher),
        did_pool,
        settings.clone(),
        metrics_handle,
    );
    let app = create_router(state);

    let addr = SocketAddr::new(settings.server.host.parse()?, settings.server.port);
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&dispatcher), services))
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then wind the dialler down: stop accepting
/// queue items, cancel per-call contexts, and give workers a bounded
/// grace period.
async fn shutdown_signal(dispatcher: Arc<Dispatcher>, services: Arc<CallServices>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    dispatcher.stop();
    for context in services.contexts.all() {
        context.cancel();
    }

    let grace = Duration::from_secs(10);
    let deadline = tokio::time::Instant::now() + grace;
    while dispatcher.active_calls() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if dispatcher.active_calls() > 0 {
        tracing::warn!(
            remaining = dispatcher.active_calls(),
            "Shutdown grace period expired with calls in flight"
        );
    }
}

/// Initialize tracing from the observability config
fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("outdial={},tower_http=info", settings.observability.log_level).into()
    });

    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
