use rulebot::config::EngineConfig;
use rulebot::engine::Engine;
use rulebot::exchange::{CoinbaseClient, ExchangeClient, PaperExchange};
use rulebot::notify::{LogNotifier, Notifier};
use rulebot::persistence::{MemoryRuleStore, RedisRuleStore, RuleStore};
use rulebot::Result;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let config = EngineConfig::from_env();
    tracing::info!("rulebot starting");
    tracing::info!("  instruments: {:?}", config.instruments);
    tracing::info!("  poll interval: {}s", config.poll_interval_secs);
    tracing::info!("  stop loss: {}%", config.rule.stop_loss_pct);
    tracing::info!("  limit: {}%", config.rule.limit_pct);
    tracing::info!("  portfolio diversity: {}%", config.rule.portfolio_diversity_pct);

    let exchange = create_exchange()?;
    let store = connect_store().await;
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let engine = Engine::new(config, exchange, store, notifier);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut engine_task = tokio::spawn(async move { engine.run(shutdown_rx).await });

    tracing::info!("press Ctrl+C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
        result = &mut engine_task => {
            tracing::error!("engine exited early: {:?}", result);
            return Err("engine exited unexpectedly".into());
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = engine_task.await;
    tracing::info!("rulebot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rulebot=info".into()),
        )
        .init();
}

/// Paper trading unless PAPER_TRADING=false; the live adapter reads its
/// endpoints and keys from the environment.
fn create_exchange() -> Result<Arc<dyn ExchangeClient>> {
    let paper = std::env::var("PAPER_TRADING")
        .map(|v| v != "false")
        .unwrap_or(true);

    if paper {
        let available = env_f64("INITIAL_AVAILABLE_FUNDS", 1000.0);
        let invested = env_f64("INITIAL_INVESTED", 0.0);
        tracing::info!(available, invested, "paper trading mode");
        Ok(Arc::new(PaperExchange::new(available, invested)))
    } else {
        tracing::info!("live trading mode");
        Ok(Arc::new(CoinbaseClient::from_env()?))
    }
}

/// Redis-backed rule storage, falling back to in-memory when Redis is
/// unreachable. In-memory state does not survive a restart.
async fn connect_store() -> Arc<dyn RuleStore> {
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    match RedisRuleStore::new(&redis_url).await {
        Ok(store) => {
            tracing::info!("rule persistence enabled at {}", redis_url);
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(
                "failed to connect to Redis ({}), continuing with in-memory rules",
                e
            );
            Arc::new(MemoryRuleStore::new())
        }
    }
}

fn env_f64(key: &str, fallback: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(fallback)
}
