use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normalized price record, one per tick or historical row.
///
/// Built either from a live ticker message (named fields) or from a bulk
/// historical row (positional `[time, low, high, open, close, volume]`).
/// Missing or unparseable fields stay `None`; a record is never rejected so
/// the time series keeps no holes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRecord {
    pub instrument_id: String,
    pub timestamp: DateTime<Utc>,
    pub price: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub trade_id: Option<u64>,
}

impl PriceRecord {
    /// Normalize a live ticker message.
    ///
    /// `price` comes from the explicit price field when present, else the
    /// close-price fallback.
    pub fn from_ticker(tick: &TickerMsg) -> Self {
        Self {
            instrument_id: tick.instrument_id.clone(),
            timestamp: tick.time,
            price: tick.price.or(tick.close),
            open: tick.open,
            high: tick.high,
            low: tick.low,
            volume: tick.volume,
            best_bid: tick.best_bid,
            best_ask: tick.best_ask,
            trade_id: tick.trade_id,
        }
    }

    /// Normalize a positional historical row: `[time, low, high, open,
    /// close, volume]`. Out-of-range indices stay `None`.
    pub fn from_rate_row(instrument_id: &str, row: &[Option<f64>]) -> Self {
        let at = |i: usize| row.get(i).copied().flatten();
        let timestamp = at(0)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
            .unwrap_or_else(Utc::now);

        Self {
            instrument_id: instrument_id.to_string(),
            timestamp,
            price: at(4), // close
            open: at(3),
            high: at(2),
            low: at(1),
            volume: at(5),
            best_bid: None,
            best_ask: None,
            trade_id: None,
        }
    }
}

/// Ticker payload after the exchange adapter has parsed the raw message.
/// All numeric fields are resolved once here, never re-checked downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerMsg {
    pub instrument_id: String,
    pub time: DateTime<Utc>,
    pub price: Option<f64>,
    pub close: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub trade_id: Option<u64>,
}

/// Fill notification from the user channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillMsg {
    pub instrument_id: String,
    pub order_id: String,
    pub side: OrderSide,
    pub price: Option<f64>,
    pub size: Option<f64>,
    pub time: DateTime<Utc>,
}

/// Tagged feed message. Only `Ticker` and `UserFill` drive the rule engine;
/// heartbeats keep the connection alive and are otherwise ignored.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Ticker(TickerMsg),
    Heartbeat,
    UserFill(FillMsg),
}

/// Rule lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuleStatus {
    /// Safe mode: no new orders until externally reconciled.
    Idle,
    /// Holding a position; watching the stop-loss ratchet.
    Bought,
    /// Uninvested; watching for a dip-then-recovery entry.
    Sold,
    /// Order submission or cancellation in flight; guards against
    /// re-entrant double submission on rapid ticks.
    Pending,
}

/// Per-instrument trading rule. Created once at startup, mutated on every
/// processed tick, never deleted during the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub instrument_id: String,
    pub status: RuleStatus,
    /// Funds committed to this rule: quote currency while Sold, base
    /// quantity while Bought.
    pub balance: f64,
    pub portfolio_diversity_pct: f64,
    pub risk_limit_pct: f64,
    pub stop_loss_pct: f64,
    pub limit_pct: f64,
    /// High-water mark while Bought. Only resets on a transition out.
    pub high: Option<f64>,
    /// Low-water mark while Sold.
    pub low: Option<f64>,
    pub current_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub limit_price: Option<f64>,
    pub risk_price: Option<f64>,
    pub open_order_id: Option<String>,
}

impl Rule {
    pub fn new(instrument_id: &str, config: &crate::config::RuleConfig) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            status: RuleStatus::Idle,
            balance: 0.0,
            portfolio_diversity_pct: config.portfolio_diversity_pct,
            risk_limit_pct: config.risk_limit_pct,
            stop_loss_pct: config.stop_loss_pct,
            limit_pct: config.limit_pct,
            high: None,
            low: None,
            current_price: None,
            stop_loss_price: None,
            limit_price: None,
            risk_price: None,
            open_order_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Ephemeral order request produced by the rule engine and consumed exactly
/// once by the order lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub instrument_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub client_ref_id: Uuid,
}

impl OrderIntent {
    pub fn new(instrument_id: &str, side: OrderSide, price: f64, quantity: f64) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            side,
            price,
            quantity,
            client_ref_id: Uuid::new_v4(),
        }
    }

    /// A retried submission must not reuse an abandoned client ref id.
    pub fn with_fresh_ref_id(mut self) -> Self {
        self.client_ref_id = Uuid::new_v4();
        self
    }
}

/// Account balances read fresh at the start of each buy decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountBalances {
    /// Uninvested quote currency available for new orders.
    pub available: f64,
    /// Base quantity currently held for the instrument.
    pub invested: f64,
}
