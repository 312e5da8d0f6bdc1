//! End-to-end engine flow against the paper exchange: history preload,
//! dip-then-recovery entry, fill handling and the stop-loss exit.

use chrono::Utc;
use rulebot::config::EngineConfig;
use rulebot::engine::Engine;
use rulebot::exchange::PaperExchange;
use rulebot::models::{FeedMessage, OrderSide, RuleStatus, TickerMsg};
use rulebot::notify::LogNotifier;
use rulebot::persistence::{MemoryRuleStore, RuleStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn quiet_config() -> EngineConfig {
    EngineConfig {
        instruments: vec!["BTC-USD".to_string()],
        // Long timers so only pushed feed messages drive the test.
        poll_interval_secs: 3600,
        token_refresh_secs: 3600,
        ..EngineConfig::default()
    }
}

fn tick(price: f64) -> FeedMessage {
    FeedMessage::Ticker(TickerMsg {
        instrument_id: "BTC-USD".to_string(),
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
    })
}

/// Falling one-minute candles ending two minutes ago, enough to put the
/// momentum oscillator deep in oversold territory.
fn falling_history() -> Vec<Vec<Option<f64>>> {
    let now = Utc::now().timestamp();
    (0..15)
        .map(|i| {
            let ts = now - (17 - i) * 60;
            let close = 200.0 - i as f64;
            vec![
                Some(ts as f64),
                Some(close - 1.0), // low
                Some(close + 1.0), // high
                Some(close + 0.5), // open
                Some(close),
                Some(10.0), // volume
            ]
        })
        .collect()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within timeout");
}

struct Harness {
    exchange: Arc<PaperExchange>,
    store: Arc<MemoryRuleStore>,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<rulebot::Result<()>>,
}

impl Harness {
    async fn start(available: f64, invested: f64, history: Vec<Vec<Option<f64>>>) -> Self {
        let exchange = Arc::new(PaperExchange::new(available, invested));
        exchange.set_quote(100.0);
        exchange.set_history(history);
        let store = Arc::new(MemoryRuleStore::new());

        let engine = Engine::new(
            quiet_config(),
            exchange.clone(),
            store.clone(),
            Arc::new(LogNotifier),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { engine.run(shutdown_rx).await });

        // Startup is done once the reconciled rule is persisted and the
        // feed subscription is live.
        let ready_store = store.clone();
        wait_for(move || ready_store.save_count() > 0).await;
        let ready_exchange = exchange.clone();
        wait_for(move || ready_exchange.subscriber_count() > 0).await;

        Self {
            exchange,
            store,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn no_order_without_enough_history() {
    let harness = Harness::start(1000.0, 0.0, Vec::new()).await;

    harness.exchange.push_feed(tick(100.0));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(harness.exchange.placed_orders().is_empty());
    let rule = harness.store.load("BTC-USD").await.unwrap().unwrap();
    assert_eq!(rule.status, RuleStatus::Sold);

    harness.stop().await;
}

#[tokio::test]
async fn dip_recovery_places_buy_above_market() {
    let harness = Harness::start(1000.0, 0.0, falling_history()).await;

    // Oversold dip: trailing entry follows the fall, then the higher low
    // triggers the buy.
    harness.exchange.push_feed(tick(100.0));
    harness.exchange.push_feed(tick(95.0));
    harness.exchange.push_feed(tick(96.0));

    let exchange = harness.exchange.clone();
    wait_for(move || !exchange.placed_orders().is_empty()).await;

    let placed = harness.exchange.placed_orders();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].side, OrderSide::Buy);
    assert_eq!(placed[0].price, 96.02); // 0.02% above market, cent rounded

    let rule = harness.store.load("BTC-USD").await.unwrap().unwrap();
    assert_eq!(rule.status, RuleStatus::Bought);
    assert!(rule.open_order_id.is_some());

    harness.stop().await;
}

#[tokio::test]
async fn full_cycle_buy_fill_then_stop_loss_sell() {
    let harness = Harness::start(1000.0, 0.0, falling_history()).await;

    harness.exchange.push_feed(tick(100.0));
    harness.exchange.push_feed(tick(95.0));
    harness.exchange.push_feed(tick(96.0));

    let exchange = harness.exchange.clone();
    wait_for(move || !exchange.open_order_ids().is_empty()).await;

    // Fill the entry; the fill notification clears the open order id.
    let order_id = harness.exchange.open_order_ids()[0].clone();
    harness.exchange.fill_order(&order_id);

    let mut fill_seen = false;
    for _ in 0..250 {
        let rule = harness.store.load("BTC-USD").await.unwrap().unwrap();
        if rule.open_order_id.is_none() && rule.status == RuleStatus::Bought {
            fill_seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(fill_seen, "fill never reached the rule engine");

    // Ratchet the high up, then breach the stop.
    harness.exchange.push_feed(tick(120.0));
    harness.exchange.push_feed(tick(90.0));

    let exchange = harness.exchange.clone();
    wait_for(move || exchange.placed_orders().len() == 2).await;

    let placed = harness.exchange.placed_orders();
    assert_eq!(placed[1].side, OrderSide::Sell);
    assert_eq!(placed[1].price, 89.98); // 0.02% below market

    let rule = harness.store.load("BTC-USD").await.unwrap().unwrap();
    assert_eq!(rule.status, RuleStatus::Sold);
    assert_eq!(rule.high, None);
    assert_eq!(rule.stop_loss_price, None);

    harness.stop().await;
}

#[tokio::test]
async fn startup_reconciles_held_position_to_bought() {
    let harness = Harness::start(0.0, 2.5, Vec::new()).await;

    let rule = harness.store.load("BTC-USD").await.unwrap().unwrap();
    assert_eq!(rule.status, RuleStatus::Bought);
    assert_eq!(rule.balance, 2.5);
    // Stop armed from the startup quote of 100.
    assert_eq!(rule.stop_loss_price, Some(99.0));

    harness.stop().await;
}
