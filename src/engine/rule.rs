use crate::config::RuleConfig;
use crate::engine::orders::OrderManager;
use crate::engine::thresholds::{recompute, round_to};
use crate::exchange::ExchangeClient;
use crate::history::HistoryStore;
use crate::indicators::momentum;
use crate::models::{
    FeedMessage, FillMsg, OrderIntent, OrderSide, Rule, RuleStatus, TickerMsg,
};
use crate::notify::Notifier;
use crate::persistence::RuleStore;
use crate::Result;
use std::sync::Arc;

/// Intent awaiting a confirmed submission while the rule is Pending.
struct PendingOrder {
    intent: OrderIntent,
    /// State to enter once the exchange confirms the placement.
    next_status: RuleStatus,
    /// Committed funds for the new state: base quantity after a buy, quote
    /// proceeds after a sell.
    next_balance: f64,
}

/// Per-instrument rule state machine.
///
/// Owns one rule's lifecycle and decides on every processed tick whether a
/// buy or sell action is warranted. Each instance is driven by a single
/// worker task, so decisions for one instrument are strictly sequential;
/// the Pending status additionally guards against double submission when a
/// decision spans several ticks (failed submit retried later).
///
/// Every failure is caught at the tick boundary by the caller; the next
/// tick is the retry point.
pub struct RuleEngine {
    rule: Rule,
    config: RuleConfig,
    history: HistoryStore,
    orders: OrderManager,
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn RuleStore>,
    notifier: Arc<dyn Notifier>,
    /// Trailing entry price while Sold. Distinct from the rule's
    /// `limit_price` (the post-trigger entry cap): this one follows the
    /// dip down and triggers the buy on the first higher low.
    limit_buy_price: Option<f64>,
    pending: Option<PendingOrder>,
}

impl RuleEngine {
    pub fn new(
        rule: Rule,
        config: RuleConfig,
        history: HistoryStore,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn RuleStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            rule,
            config,
            history,
            orders: OrderManager::new(exchange.clone()),
            exchange,
            store,
            notifier,
            limit_buy_price: None,
            pending: None,
        }
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn trailing_buy_price(&self) -> Option<f64> {
        self.limit_buy_price
    }

    /// Process one inbound feed message.
    pub async fn on_message(&mut self, message: &FeedMessage) -> Result<()> {
        match message {
            FeedMessage::Ticker(tick) => {
                if tick.instrument_id != self.rule.instrument_id {
                    return Ok(());
                }
                self.history.append(tick);
                self.on_tick(tick).await
            }
            FeedMessage::UserFill(fill) => self.on_fill(fill).await,
            // Heartbeats only keep the connection warm.
            FeedMessage::Heartbeat => Ok(()),
        }
    }

    async fn on_tick(&mut self, tick: &TickerMsg) -> Result<()> {
        // Unpriced records stay in the history but cannot drive a decision.
        let Some(price) = tick.price.or(tick.close) else {
            tracing::debug!(instrument = %self.rule.instrument_id, "tick without price, skipping");
            return Ok(());
        };

        match self.rule.status {
            RuleStatus::Idle => Ok(()), // safe mode until reconciled
            RuleStatus::Pending => self.retry_pending().await,
            RuleStatus::Sold => self.decide_sold(price).await,
            RuleStatus::Bought => self.decide_bought(price).await,
        }
    }

    /// A confirmed fill for our open order clears it; a fill for an order
    /// we do not know about means a second order got live, which is an
    /// invariant violation.
    async fn on_fill(&mut self, fill: &FillMsg) -> Result<()> {
        if fill.instrument_id != self.rule.instrument_id {
            return Ok(());
        }

        match &self.rule.open_order_id {
            Some(open) if *open == fill.order_id => {
                tracing::info!(
                    instrument = %self.rule.instrument_id,
                    order_id = %fill.order_id,
                    side = ?fill.side,
                    "open order filled"
                );
                self.rule.open_order_id = None;
                self.persist().await?;
                self.notifier.notify(&format!(
                    "{}: {:?} order {} filled",
                    self.rule.instrument_id, fill.side, fill.order_id
                ));
                Ok(())
            }
            Some(_) => self.enter_safe_mode("fill for unknown order id").await,
            None => Ok(()),
        }
    }

    /// Not invested: follow the dip with a trailing entry price and buy on
    /// the first higher low, but only while the oscillator reads oversold.
    async fn decide_sold(&mut self, price: f64) -> Result<()> {
        recompute(&mut self.rule, price, self.config.price_precision);
        self.persist().await?;

        // Without a full indicator window there is no decision point yet.
        let Some(osc) = momentum(
            &self.history,
            &self.rule.instrument_id,
            self.config.lookback_periods,
        ) else {
            tracing::debug!(
                instrument = %self.rule.instrument_id,
                "indicator not ready, skipping decision"
            );
            return Ok(());
        };

        if osc > self.config.oversold_level {
            // No longer oversold: stand down and wait for the next dip.
            if self.limit_buy_price.take().is_some() || self.rule.open_order_id.is_some() {
                self.orders.cancel(&mut self.rule).await?;
                self.persist().await?;
            }
            return Ok(());
        }

        match self.limit_buy_price {
            None => {
                // First oversold tick: mark the dip and wait.
                self.limit_buy_price = Some(price);
                tracing::debug!(
                    instrument = %self.rule.instrument_id,
                    trailing = price,
                    oscillator = osc,
                    "trailing entry price set"
                );
                Ok(())
            }
            Some(trailing) if price < trailing => {
                // Still falling: follow it down, never buy into the fall.
                self.limit_buy_price = Some(price);
                self.orders.cancel(&mut self.rule).await?;
                self.persist().await?;
                Ok(())
            }
            Some(trailing) if price > trailing => self.enter_position(price).await,
            Some(_) => Ok(()), // unchanged price, no action
        }
    }

    /// Invested: tighten the stop ratchet and force-sell when hit.
    async fn decide_bought(&mut self, price: f64) -> Result<()> {
        recompute(&mut self.rule, price, self.config.price_precision);
        self.persist().await?;

        // A stale order from a previous decision goes first.
        if self.rule.open_order_id.is_some() {
            self.orders.cancel(&mut self.rule).await?;
            self.persist().await?;
        }

        match self.rule.stop_loss_price {
            Some(stop) if price <= stop => self.exit_position(price).await,
            _ => Ok(()), // the ratchet alone tightens the stop
        }
    }

    /// Submit the entry buy: sized from a fresh balance read, priced
    /// slightly above market to favor the fill on a rising breakout.
    async fn enter_position(&mut self, price: f64) -> Result<()> {
        self.orders.cancel(&mut self.rule).await?;

        // Balances are read fresh at every decision; another instrument's
        // order may have consumed funds since the last tick.
        let balances = self
            .exchange
            .get_account_balances(&self.rule.instrument_id)
            .await?;
        if balances.available < 0.0 {
            return self.enter_safe_mode("negative available balance").await;
        }

        let limit = round_to(
            price * (1.0 + self.config.price_offset_pct / 100.0),
            self.config.price_precision,
        );
        let funds = balances.available * self.rule.portfolio_diversity_pct / 100.0;
        let quantity = funds / limit;
        if quantity <= 0.0 {
            tracing::debug!(instrument = %self.rule.instrument_id, "no funds available for entry");
            return Ok(());
        }

        let intent = OrderIntent::new(&self.rule.instrument_id, OrderSide::Buy, limit, quantity);
        self.limit_buy_price = None;
        self.begin_pending(intent, RuleStatus::Bought, quantity).await
    }

    /// Submit the stop-loss sell for the full position, slightly below
    /// market for an immediate fill.
    async fn exit_position(&mut self, price: f64) -> Result<()> {
        let balances = self
            .exchange
            .get_account_balances(&self.rule.instrument_id)
            .await?;
        if balances.invested <= 0.0 {
            return self
                .enter_safe_mode("stop loss hit with no position on the account")
                .await;
        }

        let limit = round_to(
            price * (1.0 - self.config.price_offset_pct / 100.0),
            self.config.price_precision,
        );
        let quantity = balances.invested;

        let intent = OrderIntent::new(&self.rule.instrument_id, OrderSide::Sell, limit, quantity);
        self.notifier.notify(&format!(
            "{}: stop loss {} hit at {}, selling {}",
            self.rule.instrument_id,
            self.rule.stop_loss_price.unwrap_or_default(),
            price,
            quantity
        ));
        self.begin_pending(intent, RuleStatus::Sold, limit * quantity)
            .await
    }

    /// Enter Pending, persist, then try the submission once. A failure
    /// leaves the rule Pending; the next tick retries with a fresh
    /// client ref id.
    async fn begin_pending(
        &mut self,
        intent: OrderIntent,
        next_status: RuleStatus,
        next_balance: f64,
    ) -> Result<()> {
        self.rule.status = RuleStatus::Pending;
        self.pending = Some(PendingOrder {
            intent,
            next_status,
            next_balance,
        });
        self.persist().await?;
        self.try_submit_pending().await
    }

    async fn retry_pending(&mut self) -> Result<()> {
        if self.pending.is_none() {
            // Pending without an intent (e.g. restored from storage after
            // a crash) cannot make progress on its own.
            return self
                .enter_safe_mode("pending state with no in-flight intent")
                .await;
        }

        // Abandoned ref ids are never reused.
        if let Some(pending) = self.pending.as_mut() {
            pending.intent = pending.intent.clone().with_fresh_ref_id();
        }
        self.try_submit_pending().await
    }

    async fn try_submit_pending(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        match self.orders.submit(&mut self.rule, &pending.intent).await {
            Ok(order_id) => {
                self.transition_to(pending.next_status, pending.next_balance);
                self.persist().await?;
                tracing::info!(
                    instrument = %self.rule.instrument_id,
                    status = ?self.rule.status,
                    %order_id,
                    "order confirmed, rule transitioned"
                );
                Ok(())
            }
            Err(e) => {
                // Still Pending; the next tick retries with a new ref id.
                tracing::warn!(
                    instrument = %self.rule.instrument_id,
                    error = %e,
                    "submission failed, staying pending"
                );
                self.pending = Some(pending);
                self.persist().await?;
                Ok(())
            }
        }
    }

    /// Apply a confirmed status change, resetting the marks that are only
    /// defined in the state being left.
    fn transition_to(&mut self, status: RuleStatus, balance: f64) {
        self.rule.status = status;
        self.rule.balance = balance;
        match status {
            RuleStatus::Bought => {
                self.rule.low = None;
                self.rule.limit_price = None;
                self.limit_buy_price = None;
            }
            RuleStatus::Sold => {
                self.rule.high = None;
                self.rule.stop_loss_price = None;
                self.rule.risk_price = None;
            }
            RuleStatus::Idle | RuleStatus::Pending => {}
        }
    }

    /// Invariant violation: stop trading this rule until externally
    /// reconciled. Existing history keeps accumulating.
    async fn enter_safe_mode(&mut self, reason: &str) -> Result<()> {
        tracing::error!(
            instrument = %self.rule.instrument_id,
            reason,
            "invariant violation, rule forced to safe mode"
        );
        self.rule.status = RuleStatus::Idle;
        self.pending = None;
        self.limit_buy_price = None;
        self.persist().await?;
        self.notifier
            .notify(&format!("{}: safe mode: {}", self.rule.instrument_id, reason));
        Ok(())
    }

    /// Save before acting on the new state.
    async fn persist(&self) -> Result<()> {
        self.store.save(&self.rule).await?;
        Ok(())
    }
}
