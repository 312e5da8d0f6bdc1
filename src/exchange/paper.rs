use super::{ChannelType, ExchangeClient, ExchangeError, ExchangeResult, Granularity};
use crate::models::{AccountBalances, FeedMessage, OrderIntent, OrderSide};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// In-memory exchange for dry runs and tests.
///
/// Orders hold funds when placed and release them on cancel; `fill_order`
/// settles an open order and emits the matching user-fill message on any
/// live subscription. Failure injection flags make the retry paths
/// testable.
pub struct PaperExchange {
    inner: Mutex<Inner>,
}

struct Inner {
    available: f64,
    invested: f64,
    quote: f64,
    history_rows: Vec<Vec<Option<f64>>>,
    open_orders: HashMap<String, OrderIntent>,
    placed: Vec<OrderIntent>,
    cancel_count: u32,
    refresh_count: u32,
    fail_next_cancel: bool,
    fail_next_place: bool,
    feed_senders: Vec<mpsc::Sender<FeedMessage>>,
}

impl PaperExchange {
    pub fn new(available: f64, invested: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                available,
                invested,
                quote: 0.0,
                history_rows: Vec::new(),
                open_orders: HashMap::new(),
                placed: Vec::new(),
                cancel_count: 0,
                refresh_count: 0,
                fail_next_cancel: false,
                fail_next_place: false,
                feed_senders: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_quote(&self, price: f64) {
        self.lock().quote = price;
    }

    pub fn set_history(&self, rows: Vec<Vec<Option<f64>>>) {
        self.lock().history_rows = rows;
    }

    pub fn fail_next_cancel(&self) {
        self.lock().fail_next_cancel = true;
    }

    pub fn fail_next_place(&self) {
        self.lock().fail_next_place = true;
    }

    pub fn cancel_count(&self) -> u32 {
        self.lock().cancel_count
    }

    pub fn refresh_count(&self) -> u32 {
        self.lock().refresh_count
    }

    /// Every intent ever placed, in submission order.
    pub fn placed_orders(&self) -> Vec<OrderIntent> {
        self.lock().placed.clone()
    }

    pub fn open_order_ids(&self) -> Vec<String> {
        self.lock().open_orders.keys().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().feed_senders.len()
    }

    /// Push a message to all live subscriptions, dropping closed ones.
    pub fn push_feed(&self, message: FeedMessage) {
        self.lock().feed_senders.retain(|tx| {
            !matches!(
                tx.try_send(message.clone()),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }

    /// Settle an open order at its limit price and emit the user fill.
    pub fn fill_order(&self, order_id: &str) {
        let (intent, fill) = {
            let mut inner = self.lock();
            let Some(intent) = inner.open_orders.remove(order_id) else {
                return;
            };
            match intent.side {
                // Funds were held at placement; settle the other leg.
                OrderSide::Buy => inner.invested += intent.quantity,
                OrderSide::Sell => inner.available += intent.price * intent.quantity,
            }
            let fill = crate::models::FillMsg {
                instrument_id: intent.instrument_id.clone(),
                order_id: order_id.to_string(),
                side: intent.side,
                price: Some(intent.price),
                size: Some(intent.quantity),
                time: chrono::Utc::now(),
            };
            (intent, fill)
        };
        tracing::info!(
            instrument = %intent.instrument_id,
            side = ?intent.side,
            price = intent.price,
            "paper order filled"
        );
        self.push_feed(FeedMessage::UserFill(fill));
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_account_balances(&self, _instrument_id: &str) -> ExchangeResult<AccountBalances> {
        let inner = self.lock();
        Ok(AccountBalances {
            available: inner.available,
            invested: inner.invested,
        })
    }

    async fn get_quote(&self, _instrument_id: &str) -> ExchangeResult<f64> {
        Ok(self.lock().quote)
    }

    async fn get_historical_rates(
        &self,
        _instrument_id: &str,
        _granularity: Granularity,
    ) -> ExchangeResult<Vec<Vec<Option<f64>>>> {
        Ok(self.lock().history_rows.clone())
    }

    async fn place_order(&self, intent: &OrderIntent) -> ExchangeResult<String> {
        let mut inner = self.lock();
        if inner.fail_next_place {
            inner.fail_next_place = false;
            return Err(ExchangeError::Transient("injected place failure".into()));
        }

        // Hold funds so a concurrent decision cannot double-spend them.
        match intent.side {
            OrderSide::Buy => {
                let cost = intent.price * intent.quantity;
                // Small slack so a size computed from the full balance is
                // not rejected over float rounding.
                if cost > inner.available * (1.0 + 1e-9) {
                    return Err(ExchangeError::Rejected("insufficient funds".into()));
                }
                inner.available -= cost;
            }
            OrderSide::Sell => {
                if intent.quantity > inner.invested {
                    return Err(ExchangeError::Rejected("insufficient position".into()));
                }
                inner.invested -= intent.quantity;
            }
        }

        let order_id = Uuid::new_v4().to_string();
        inner.open_orders.insert(order_id.clone(), intent.clone());
        inner.placed.push(intent.clone());
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()> {
        let mut inner = self.lock();
        if inner.fail_next_cancel {
            inner.fail_next_cancel = false;
            return Err(ExchangeError::Timeout("injected cancel timeout".into()));
        }

        if let Some(intent) = inner.open_orders.remove(order_id) {
            // Release the held funds.
            match intent.side {
                OrderSide::Buy => inner.available += intent.price * intent.quantity,
                OrderSide::Sell => inner.invested += intent.quantity,
            }
        }
        inner.cancel_count += 1;
        Ok(())
    }

    async fn subscribe(
        &self,
        _instruments: &[String],
        _channels: &[ChannelType],
    ) -> ExchangeResult<mpsc::Receiver<FeedMessage>> {
        let (tx, rx) = mpsc::channel(256);
        self.lock().feed_senders.push(tx);
        Ok(rx)
    }

    async fn refresh_credentials(&self) -> ExchangeResult<()> {
        self.lock().refresh_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buy_holds_and_fill_settles() {
        let exchange = PaperExchange::new(1000.0, 0.0);
        let intent = OrderIntent::new("BTC-USD", OrderSide::Buy, 100.0, 2.0);
        let order_id = exchange.place_order(&intent).await.unwrap();

        let balances = exchange.get_account_balances("BTC-USD").await.unwrap();
        assert_eq!(balances.available, 800.0);
        assert_eq!(balances.invested, 0.0);

        exchange.fill_order(&order_id);
        let balances = exchange.get_account_balances("BTC-USD").await.unwrap();
        assert_eq!(balances.invested, 2.0);
    }

    #[tokio::test]
    async fn test_cancel_releases_held_funds() {
        let exchange = PaperExchange::new(1000.0, 0.0);
        let intent = OrderIntent::new("BTC-USD", OrderSide::Buy, 100.0, 2.0);
        let order_id = exchange.place_order(&intent).await.unwrap();

        exchange.cancel_order(&order_id).await.unwrap();
        let balances = exchange.get_account_balances("BTC-USD").await.unwrap();
        assert_eq!(balances.available, 1000.0);
    }

    #[tokio::test]
    async fn test_rejects_oversized_buy() {
        let exchange = PaperExchange::new(50.0, 0.0);
        let intent = OrderIntent::new("BTC-USD", OrderSide::Buy, 100.0, 1.0);
        assert!(exchange.place_order(&intent).await.is_err());
    }

    #[tokio::test]
    async fn test_fill_emits_user_fill_on_feed() {
        let exchange = PaperExchange::new(1000.0, 0.0);
        let mut feed = exchange
            .subscribe(&["BTC-USD".to_string()], &[ChannelType::User])
            .await
            .unwrap();

        let intent = OrderIntent::new("BTC-USD", OrderSide::Buy, 100.0, 1.0);
        let order_id = exchange.place_order(&intent).await.unwrap();
        exchange.fill_order(&order_id);

        match feed.recv().await {
            Some(FeedMessage::UserFill(fill)) => assert_eq!(fill.order_id, order_id),
            other => panic!("expected user fill, got {:?}", other.is_some()),
        }
    }

    #[tokio::test]
    async fn test_push_feed_prunes_dropped_subscriptions() {
        let exchange = PaperExchange::new(0.0, 0.0);
        let stale = exchange
            .subscribe(&["BTC-USD".to_string()], &[ChannelType::Heartbeat])
            .await
            .unwrap();
        let mut live = exchange
            .subscribe(&["BTC-USD".to_string()], &[ChannelType::Heartbeat])
            .await
            .unwrap();
        assert_eq!(exchange.subscriber_count(), 2);

        drop(stale);
        exchange.push_feed(FeedMessage::Heartbeat);

        assert_eq!(exchange.subscriber_count(), 1);
        assert!(matches!(live.recv().await, Some(FeedMessage::Heartbeat)));
    }
}
