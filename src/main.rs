//! transfer_saga - money-movement orchestration service
//!
//! ```text
//! submit ──▶ TransferService ──▶ Executor ──▶ Ledger (freeze)
//!                                    │
//!                                    └─▶ outbox ──▶ risk engine
//!                                                      │
//! risk result ──▶ RiskContinuation ──▶ settle / unfreeze
//!
//! CompensationSweeper: timed-out freezes, orphan holds, stalled orders
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use transfer_saga::app::{SagaDeps, SagaRuntime};
use transfer_saga::config::AppConfig;
use transfer_saga::idempotency::MemoryIdempotencyGuard;
use transfer_saga::money::CurrencyCode;
use transfer_saga::transfer::adapters::{
    AccountSnapshot, Argon2Credentials, HttpNetworkGateway, LoggingNetworkGateway,
    MemoryAccountDirectory, NetworkGateway,
};
use transfer_saga::transfer::audit::TracingAuditSink;
use transfer_saga::transfer::events::ChannelPublisher;
use transfer_saga::transfer::store::TransferStore;
use transfer_saga::transfer::store::memory::MemoryTransferStore;
use transfer_saga::transfer::store::postgres::PgTransferStore;

/// Config profile from `--env <name>` / `-e <name>` / `--env=<name>`.
fn profile_from_args<I: IntoIterator<Item = String>>(args: I) -> String {
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        if let Some(name) = arg.strip_prefix("--env=") {
            return name.to_string();
        }
        if arg == "--env" || arg == "-e" {
            if let Some(name) = args.next() {
                return name;
            }
        }
    }
    "dev".to_string()
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn TransferStore>> {
    match &config.postgres_url {
        Some(url) => {
            let store = PgTransferStore::connect(url, config.postgres_pool_size)
                .await
                .context("Failed to connect to PostgreSQL")?;
            store.migrate().await.context("Failed to run migrations")?;
            info!("PostgreSQL store ready");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No postgres_url configured, using in-memory store");
            Ok(Arc::new(MemoryTransferStore::new()))
        }
    }
}

fn build_gateway(config: &AppConfig) -> anyhow::Result<Arc<dyn NetworkGateway>> {
    match &config.saga.network_url {
        Some(url) => {
            let timeout = Duration::from_millis(config.saga.network_timeout_ms);
            let gateway = HttpNetworkGateway::new(url.clone(), timeout)
                .context("Failed to build network gateway")?;
            Ok(Arc::new(gateway))
        }
        None => Ok(Arc::new(LoggingNetworkGateway)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = profile_from_args(std::env::args());
    let config = AppConfig::load(&env)?;
    let _log_guard = transfer_saga::logging::init_logging(&config);

    info!(env = %env, git = transfer_saga::GIT_HASH, "Starting transfer saga");

    let store = build_store(&config).await?;

    let directory = Arc::new(MemoryAccountDirectory::new());
    let credentials = Arc::new(Argon2Credentials::new(config.saga.credential)?);
    for seed in &config.seed_accounts {
        directory.upsert(AccountSnapshot::active(
            seed.account_no.clone(),
            seed.account_name.clone(),
            seed.user_id.clone(),
            seed.tier,
        ));
        if let Some(secret) = &seed.credential {
            credentials.enroll(&seed.user_id, secret)?;
        }
    }

    let (publisher, outbound) = ChannelPublisher::channel(config.saga.event_buffer);
    let deps = SagaDeps {
        store,
        directory,
        credentials,
        guard: Arc::new(MemoryIdempotencyGuard::new(config.saga.idempotency)),
        gateway: build_gateway(&config)?,
        publisher: Arc::new(publisher),
        audit: Arc::new(TracingAuditSink),
    };
    let runtime = SagaRuntime::assemble(&config.saga, config.policy.clone(), deps)?;

    runtime.open_house_accounts().await?;
    for seed in &config.seed_accounts {
        let currency = CurrencyCode::parse(&seed.currency)
            .with_context(|| format!("seed account {}", seed.account_no))?;
        if runtime
            .open_account(&seed.account_no, &currency, seed.opening_balance)
            .await?
        {
            info!(account_no = %seed.account_no, currency = %currency, "Seed account opened");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (risk_tx, risk_rx) = mpsc::channel(config.saga.event_buffer);
    let mut tasks = Vec::new();

    let sweeper = runtime.sweeper.clone();
    let sweeper_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        sweeper.run(sweeper_shutdown).await;
    }));

    let continuation = runtime.continuation.clone();
    let redelivery = config.saga.risk_redelivery;
    let continuation_shutdown = shutdown_rx.clone();
    let redeliver = risk_tx.clone();
    tasks.push(tokio::spawn(async move {
        continuation
            .run(risk_rx, redeliver, redelivery, continuation_shutdown)
            .await;
    }));

    #[cfg(feature = "mock-risk-engine")]
    {
        let engine = transfer_saga::mock_risk::MockRiskEngine::new(&config.mock_risk);
        let engine_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            engine.run(outbound, risk_tx, engine_shutdown).await;
        }));
    }

    #[cfg(not(feature = "mock-risk-engine"))]
    {
        // No broker bridge in this build; outbound events are logged only
        drop(risk_tx);
        let mut outbound = outbound;
        let mut drain_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = drain_shutdown.changed() => break,
                    next = outbound.recv() => match next {
                        Some(event) => event,
                        None => break,
                    },
                };
                match serde_json::to_string(&event) {
                    Ok(json) => info!(message_id = %event.message_id(), event = %json, "Outbound event"),
                    Err(e) => error!(error = %e, "Outbound event not serializable"),
                }
            }
        }));
    }

    info!("Transfer saga running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    if shutdown_tx.send(true).is_err() {
        warn!("All workers already stopped");
    }
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Worker task failed");
        }
    }
    info!("Transfer saga stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::profile_from_args;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_profile_from_args() {
        assert_eq!(profile_from_args(argv(&["saga"])), "dev");
        assert_eq!(profile_from_args(argv(&["saga", "-e", "prod"])), "prod");
        assert_eq!(profile_from_args(argv(&["saga", "--env=staging"])), "staging");
        // dangling flag falls back
        assert_eq!(profile_from_args(argv(&["saga", "--env"])), "dev");
        // argv[0] is never a flag
        assert_eq!(profile_from_args(argv(&["-e", "prod"])), "dev");
    }
}
