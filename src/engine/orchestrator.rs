use crate::config::EngineConfig;
use crate::engine::feed::FeedManager;
use crate::engine::rule::RuleEngine;
use crate::engine::thresholds::recompute;
use crate::exchange::{ExchangeClient, Granularity};
use crate::history::HistoryStore;
use crate::models::{FeedMessage, Rule, RuleStatus, TickerMsg};
use crate::notify::Notifier;
use crate::persistence::RuleStore;
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};

const WORKER_CHANNEL_CAPACITY: usize = 256;

/// Top-level orchestrator.
///
/// Startup order: refresh credentials, reconcile one rule per configured
/// instrument, preload history, then spawn the independent loops: one
/// worker per instrument (strictly sequential decisions), the feed
/// manager, the synthetic poll timer and the credential refresh timer.
pub struct Engine {
    config: EngineConfig,
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn RuleStore>,
    notifier: Arc<dyn Notifier>,
    history: HistoryStore,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn RuleStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            exchange,
            store,
            notifier,
            history: HistoryStore::new(),
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Run until shutdown flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Err(e) = self.exchange.refresh_credentials().await {
            tracing::warn!(error = %e, "initial credential refresh failed, continuing");
        }

        let mut workers: HashMap<String, mpsc::Sender<FeedMessage>> = HashMap::new();
        let mut handles = Vec::new();

        for instrument_id in &self.config.instruments {
            let rule = self.reconcile_rule(instrument_id).await?;
            self.preload_history(instrument_id).await;

            let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
            workers.insert(instrument_id.clone(), tx);

            let engine = RuleEngine::new(
                rule,
                self.config.rule.clone(),
                self.history.clone(),
                self.exchange.clone(),
                self.store.clone(),
                self.notifier.clone(),
            );
            handles.push(tokio::spawn(worker_loop(engine, rx, shutdown.clone())));
        }

        tracing::info!(
            instruments = ?self.config.instruments,
            poll_interval_secs = self.config.poll_interval_secs,
            "engine started"
        );

        // Feed loop: live ticks and fills.
        let feed = FeedManager::new(
            self.exchange.clone(),
            self.config.instruments.clone(),
            workers.clone(),
        );
        let feed_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = feed.run(feed_shutdown).await {
                tracing::error!(error = %e, "feed manager exited");
            }
        }));

        // Poll loop: synthetic ticks keep decisions flowing through feed
        // outages.
        handles.push(tokio::spawn(poll_loop(
            self.exchange.clone(),
            workers,
            self.config.poll_interval_secs,
            shutdown.clone(),
        )));

        // Refresh loop: session credentials on a fixed schedule.
        handles.push(tokio::spawn(refresh_loop(
            self.exchange.clone(),
            self.config.token_refresh_secs,
            shutdown.clone(),
        )));

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        tracing::info!("engine shutting down");
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Load the persisted rule or derive a fresh one from the account.
    /// A held position means Bought; free funds mean Sold; an empty
    /// account stays Idle until funded.
    async fn reconcile_rule(&self, instrument_id: &str) -> Result<Rule> {
        if let Some(rule) = self.store.load(instrument_id).await? {
            tracing::info!(
                instrument = %instrument_id,
                status = ?rule.status,
                "restored persisted rule"
            );
            return Ok(rule);
        }

        let mut rule = Rule::new(instrument_id, &self.config.rule);
        let balances = self.exchange.get_account_balances(instrument_id).await?;

        if balances.invested > 0.0 {
            rule.status = RuleStatus::Bought;
            rule.balance = balances.invested;
            // Seed the ratchet from the current quote so the stop is
            // armed before the first tick.
            match self.exchange.get_quote(instrument_id).await {
                Ok(quote) => recompute(&mut rule, quote, self.config.rule.price_precision),
                Err(e) => {
                    tracing::warn!(instrument = %instrument_id, error = %e, "quote unavailable at startup");
                }
            }
        } else if balances.available > 0.0 {
            rule.status = RuleStatus::Sold;
            rule.balance = balances.available * rule.portfolio_diversity_pct / 100.0;
        }

        tracing::info!(
            instrument = %instrument_id,
            status = ?rule.status,
            balance = rule.balance,
            "created rule from account state"
        );
        self.store.save(&rule).await?;
        Ok(rule)
    }

    /// Bulk-load recent candles so the indicator is usable before a full
    /// live window accumulates. Failure is not fatal; live ticks fill in.
    async fn preload_history(&self, instrument_id: &str) {
        match self
            .exchange
            .get_historical_rates(instrument_id, Granularity::OneMinute)
            .await
        {
            Ok(rows) => {
                let count = rows.len();
                self.history.merge(instrument_id, &rows);
                tracing::info!(instrument = %instrument_id, rows = count, "history preloaded");
            }
            Err(e) => {
                tracing::warn!(instrument = %instrument_id, error = %e, "history preload failed");
            }
        }
    }
}

/// One instrument's worker: applies messages to the rule engine in arrival
/// order. Errors are logged and dropped; the next tick is the retry.
async fn worker_loop(
    mut engine: RuleEngine,
    mut rx: mpsc::Receiver<FeedMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => {
                    if let Err(e) = engine.on_message(&message).await {
                        tracing::warn!(
                            instrument = %engine.rule().instrument_id,
                            error = %e,
                            "message processing failed, next tick retries"
                        );
                    }
                }
                None => break,
            },
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Quote poller: injects a synthetic ticker per instrument on a fixed
/// cadence through the same worker channels as the live feed.
async fn poll_loop(
    exchange: Arc<dyn ExchangeClient>,
    workers: HashMap<String, mpsc::Sender<FeedMessage>>,
    poll_interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(poll_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; skip it so the
    // live feed gets a chance to connect first.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (instrument_id, sender) in &workers {
                    match exchange.get_quote(instrument_id).await {
                        Ok(price) => {
                            let tick = TickerMsg {
                                instrument_id: instrument_id.clone(),
                                time: Utc::now(),
                                price: Some(price),
                                close: None,
                                open: None,
                                high: None,
                                low: None,
                                volume: None,
                                best_bid: None,
                                best_ask: None,
                                trade_id: None,
                            };
                            if sender.send(FeedMessage::Ticker(tick)).await.is_err() {
                                return; // workers gone
                            }
                        }
                        Err(e) => {
                            tracing::warn!(instrument = %instrument_id, error = %e, "quote poll failed");
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Credential refresh on a fixed schedule. A failed refresh is retried at
/// the next interval; requests in between fail transiently and get retried
/// per tick as usual.
async fn refresh_loop(
    exchange: Arc<dyn ExchangeClient>,
    refresh_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(refresh_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // startup refresh already happened

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match exchange.refresh_credentials().await {
                    Ok(()) => tracing::info!("credentials refreshed"),
                    Err(e) => tracing::warn!(error = %e, "credential refresh failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::notify::LogNotifier;
    use crate::persistence::MemoryRuleStore;

    fn engine_with(
        exchange: Arc<PaperExchange>,
        store: Arc<MemoryRuleStore>,
    ) -> Engine {
        let config = EngineConfig {
            instruments: vec!["BTC-USD".to_string()],
            poll_interval_secs: 3600, // keep the poller quiet in tests
            token_refresh_secs: 3600,
            ..EngineConfig::default()
        };
        Engine::new(config, exchange, store, Arc::new(LogNotifier))
    }

    #[tokio::test]
    async fn test_reconcile_held_position_starts_bought() {
        let exchange = Arc::new(PaperExchange::new(0.0, 3.0));
        exchange.set_quote(100.0);
        let store = Arc::new(MemoryRuleStore::new());
        let engine = engine_with(exchange, store.clone());

        let rule = engine.reconcile_rule("BTC-USD").await.unwrap();

        assert_eq!(rule.status, RuleStatus::Bought);
        assert_eq!(rule.balance, 3.0);
        // Stop armed from the startup quote.
        assert_eq!(rule.stop_loss_price, Some(99.0));
        assert!(store.load("BTC-USD").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reconcile_free_funds_start_sold() {
        let exchange = Arc::new(PaperExchange::new(500.0, 0.0));
        let store = Arc::new(MemoryRuleStore::new());
        let engine = engine_with(exchange, store);

        let rule = engine.reconcile_rule("BTC-USD").await.unwrap();

        assert_eq!(rule.status, RuleStatus::Sold);
        assert_eq!(rule.balance, 500.0);
    }

    #[tokio::test]
    async fn test_reconcile_empty_account_stays_idle() {
        let exchange = Arc::new(PaperExchange::new(0.0, 0.0));
        let store = Arc::new(MemoryRuleStore::new());
        let engine = engine_with(exchange, store);

        let rule = engine.reconcile_rule("BTC-USD").await.unwrap();
        assert_eq!(rule.status, RuleStatus::Idle);
    }

    #[tokio::test]
    async fn test_reconcile_prefers_persisted_rule() {
        let exchange = Arc::new(PaperExchange::new(500.0, 0.0));
        let store = Arc::new(MemoryRuleStore::new());

        let mut persisted = Rule::new("BTC-USD", &crate::config::RuleConfig::default());
        persisted.status = RuleStatus::Bought;
        persisted.high = Some(123.0);
        store.save(&persisted).await.unwrap();

        let engine = engine_with(exchange, store);
        let rule = engine.reconcile_rule("BTC-USD").await.unwrap();

        assert_eq!(rule.status, RuleStatus::Bought);
        assert_eq!(rule.high, Some(123.0));
    }

    #[tokio::test]
    async fn test_run_processes_live_ticks_until_shutdown() {
        let exchange = Arc::new(PaperExchange::new(500.0, 0.0));
        let store = Arc::new(MemoryRuleStore::new());
        let engine = Arc::new(engine_with(exchange.clone(), store.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(shutdown_rx).await })
        };

        // Let startup finish, then feed a live tick through.
        tokio::time::sleep(Duration::from_millis(100)).await;
        exchange.push_feed(FeedMessage::Ticker(TickerMsg {
            instrument_id: "BTC-USD".to_string(),
            time: Utc::now(),
            price: Some(100.0),
            close: None,
            open: None,
            high: None,
            low: None,
            volume: None,
            best_bid: None,
            best_ask: None,
            trade_id: None,
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // The tick landed in the shared history.
        assert_eq!(engine.history().len("BTC-USD"), 1);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_stops_run() {
        let exchange = Arc::new(PaperExchange::new(500.0, 0.0));
        let store = Arc::new(MemoryRuleStore::new());
        let engine = Arc::new(engine_with(exchange, store));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(shutdown_tx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
