use anyhow::Result;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quotagate::{
    api::{router, AppState},
    config::{load_config_from_file, EngineConfig},
    gate::EnforcementGate,
    metrics::Metrics,
    policy::PolicyStore,
    redis::{RedisConfig, RedisCounterStore},
    store::{CounterStore, MemoryCounterStore},
    utils::SystemClock,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quotagate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting quotagate admission-control service");

    let config = match std::env::var("CONFIG_PATH") {
        Ok(path) => {
            info!("Loading engine configuration from: {}", path);
            load_config_from_file(&path)?
        }
        Err(_) => EngineConfig::default(),
    };

    let clock = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::new()?);
    let policies = Arc::new(PolicyStore::new());

    for spec in config.policies {
        let policy = policies.create(spec).await?;
        info!(policy_id = policy.id, name = %policy.name, "Seeded policy");
    }

    // Redis when configured, otherwise process-local counters
    let memory_store: Option<Arc<MemoryCounterStore>>;
    let store: Arc<dyn CounterStore> = match std::env::var("REDIS_URL") {
        Ok(url) => {
            memory_store = None;
            let redis_config = RedisConfig {
                url,
                ..Default::default()
            };
            Arc::new(RedisCounterStore::connect(redis_config).await?)
        }
        Err(_) => {
            info!("REDIS_URL not set, using in-memory counter store");
            let local = Arc::new(MemoryCounterStore::new(clock.clone()));
            memory_store = Some(local.clone());
            local
        }
    };

    // Housekeeping: prune expired in-memory entries off the request path
    if let Some(local) = memory_store {
        let interval_secs = std::env::var("HOUSEKEEPING_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60u64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                local.prune_expired();
            }
        });
    }

    let gate = Arc::new(EnforcementGate::new(
        policies.clone(),
        config.algorithm,
        store.clone(),
        clock,
        config.failure_policy,
        metrics.clone(),
    ));

    info!(
        algorithm = config.algorithm.as_str(),
        failure_policy = ?config.failure_policy,
        "Enforcement gate configured"
    );

    let state = AppState {
        gate,
        policies,
        metrics,
        store,
    };

    let http_addr = std::env::var("HTTP_PORT")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse::<SocketAddr>()?;

    info!("HTTP server listening on {}", http_addr);

    let server = start_http_server(state, http_addr);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

async fn start_http_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}
