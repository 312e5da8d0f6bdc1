pub mod coinbase;
pub mod paper;

use crate::models::{AccountBalances, FeedMessage, OrderIntent};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use coinbase::CoinbaseClient;
pub use paper::PaperExchange;

/// Errors at the exchange seam.
///
/// The engine only ever distinguishes transient failures (retried on the
/// next tick) from rejections and invariant breaks; everything here is
/// caught at the tick boundary and never terminates the process.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Network failure or 5xx; safe to retry next tick.
    #[error("transient exchange failure: {0}")]
    Transient(String),

    /// Call timed out. Never treated as implicit success.
    #[error("exchange call timed out: {0}")]
    Timeout(String),

    /// The exchange refused the request (4xx, bad order).
    #[error("order rejected: {0}")]
    Rejected(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Candle width accepted by the historical-rates endpoint, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    OneMinute = 60,
    FiveMinutes = 300,
    FifteenMinutes = 900,
    OneHour = 3600,
    SixHours = 21600,
    OneDay = 86400,
}

/// Market-data feed channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Ticker,
    Heartbeat,
    User,
}

/// Opaque exchange collaborator.
///
/// Message shapes are already normalized by the time they reach the engine;
/// transport details live entirely behind this trait.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Balances for one instrument: uninvested quote funds plus the held
    /// base quantity. Read fresh at every decision, never cached.
    async fn get_account_balances(&self, instrument_id: &str) -> ExchangeResult<AccountBalances>;

    /// Latest market price.
    async fn get_quote(&self, instrument_id: &str) -> ExchangeResult<f64>;

    /// Bulk history as positional `[time, low, high, open, close, volume]`
    /// rows. Unparseable cells come back as `None`.
    async fn get_historical_rates(
        &self,
        instrument_id: &str,
        granularity: Granularity,
    ) -> ExchangeResult<Vec<Vec<Option<f64>>>>;

    /// Place an order; returns the exchange order id.
    async fn place_order(&self, intent: &OrderIntent) -> ExchangeResult<String>;

    /// Cancel an order. Only a returned `Ok` counts as confirmation.
    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()>;

    /// Open one live subscription for the given instruments and channels.
    /// The receiver closing means the connection dropped; reconnection is
    /// the feed manager's job, not the adapter's.
    async fn subscribe(
        &self,
        instruments: &[String],
        channels: &[ChannelType],
    ) -> ExchangeResult<mpsc::Receiver<FeedMessage>>;

    /// Refresh session credentials. Mechanics are the adapter's concern;
    /// the engine only drives the schedule.
    async fn refresh_credentials(&self) -> ExchangeResult<()>;
}
