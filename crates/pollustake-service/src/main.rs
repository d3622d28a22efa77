use clap::{Parser, ValueEnum};
use pollustake_core::{FailurePolicy, MonitorConfig, StorageConfig};
use pollustake_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "pollustaked", version, about = "PolluStake autonomous compliance monitor")]
struct Cli {
    /// Query API socket address to bind, e.g. 127.0.0.1:8090
    #[arg(long, default_value = "127.0.0.1:8090", env = "POLLUSTAKE_LISTEN")]
    listen: SocketAddr,
    /// State backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "POLLUSTAKE_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url. Falls back to DATABASE_URL.
    #[arg(long, env = "POLLUSTAKE_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 10, env = "POLLUSTAKE_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// PM2.5 level above which an actual reading is penalized.
    #[arg(long, default_value_t = 200.0)]
    actual_penalty_threshold: f64,
    /// Predicted PM2.5 level above which an entity is put on alert.
    #[arg(long, default_value_t = 150.0)]
    forecast_alert_threshold: f64,
    /// Delay between monitoring cycles.
    #[arg(long, default_value_t = 3.0)]
    monitoring_interval_secs: f64,
    /// Maximum stake debited per slash.
    #[arg(long, default_value_t = 10)]
    fixed_slash_amount: u64,
    /// Readings required before the forecast oracle is consulted.
    #[arg(long, default_value_t = 10)]
    lookback: usize,
    /// Keep evaluating the remaining entities after a storage failure instead of aborting the cycle.
    #[arg(long, default_value_t = false)]
    isolate_entity_failures: bool,
    /// Seed for the sensor simulator.
    #[arg(long, env = "POLLUSTAKE_FEED_SEED")]
    feed_seed: Option<u64>,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => {
            if let Some(database_url) = resolved_url {
                StorageConfig::postgres(database_url, cli.pg_max_connections)
            } else {
                StorageConfig::Memory
            }
        }
    };

    Ok(storage)
}

fn resolve_monitor(cli: &Cli) -> anyhow::Result<MonitorConfig> {
    let monitoring_interval = Duration::try_from_secs_f64(cli.monitoring_interval_secs)
        .map_err(|e| {
            anyhow::anyhow!(
                "--monitoring-interval-secs {} is not a usable delay: {e}",
                cli.monitoring_interval_secs
            )
        })?;
    Ok(MonitorConfig {
        actual_penalty_threshold: cli.actual_penalty_threshold,
        monitoring_interval,
        fixed_slash_amount: cli.fixed_slash_amount,
        failure_policy: if cli.isolate_entity_failures {
            FailurePolicy::IsolateEntity
        } else {
            FailurePolicy::AbortCycle
        },
        ..MonitorConfig::default()
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "pollustake_service=info,pollustake_core=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig {
        storage: resolve_storage(&cli)?,
        monitor: resolve_monitor(&cli)?,
        lookback: cli.lookback,
        forecast_alert_threshold: cli.forecast_alert_threshold,
        feed_seed: cli.feed_seed,
    };
    info!(backend = config.storage.label(), "Connecting state store");

    let state = ServiceState::bootstrap(config).await?;
    let store = state.store.clone();
    let monitor = state.monitor.clone().spawn();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("pollustake-service listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    monitor.shutdown().await;
    store.close().await;
    info!("pollustake-service stopped");

    served.map_err(anyhow::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_config_follows_flags() {
        let cli = Cli::parse_from([
            "pollustaked",
            "--monitoring-interval-secs",
            "0.25",
            "--isolate-entity-failures",
        ]);
        let config = resolve_monitor(&cli).unwrap();
        assert_eq!(config.monitoring_interval, Duration::from_millis(250));
        assert_eq!(config.failure_policy, FailurePolicy::IsolateEntity);
    }

    #[test]
    fn oversized_or_negative_interval_is_an_error() {
        for value in ["1e30", "-1", "NaN"] {
            let flag = format!("--monitoring-interval-secs={value}");
            let cli = Cli::parse_from(["pollustaked", flag.as_str()]);
            assert!(resolve_monitor(&cli).is_err(), "{value} accepted");
        }
    }
}
