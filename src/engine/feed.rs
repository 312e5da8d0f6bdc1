use crate::exchange::{ChannelType, ExchangeClient};
use crate::models::FeedMessage;
use crate::Result;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

/// Owns the market-data subscription and fans messages out to the
/// per-instrument workers.
///
/// The subscription covers the ticker, heartbeat and user channels for all
/// configured instruments at once. When the stream drops, the manager
/// reconnects with bounded exponential backoff plus jitter; workers never
/// see the gap, only a pause in messages.
pub struct FeedManager {
    exchange: Arc<dyn ExchangeClient>,
    instruments: Vec<String>,
    workers: HashMap<String, mpsc::Sender<FeedMessage>>,
}

impl FeedManager {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        instruments: Vec<String>,
        workers: HashMap<String, mpsc::Sender<FeedMessage>>,
    ) -> Self {
        Self {
            exchange,
            instruments,
            workers,
        }
    }

    /// Run until shutdown is signalled. Each pass subscribes, pumps the
    /// stream until it ends, then backs off and resubscribes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let channels = [ChannelType::Ticker, ChannelType::Heartbeat, ChannelType::User];
            let mut stream = match self.exchange.subscribe(&self.instruments, &channels).await {
                Ok(stream) => {
                    tracing::info!(
                        instruments = ?self.instruments,
                        "market data feed connected"
                    );
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    stream
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff_secs, "feed subscription failed");
                    if self.wait_backoff(&mut shutdown, &mut backoff_secs).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    message = stream.recv() => match message {
                        Some(message) => self.dispatch(message).await,
                        None => {
                            tracing::warn!("market data feed disconnected, reconnecting");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        // A dropped sender counts as shutdown.
                        if changed.is_err() || *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }

            if self.wait_backoff(&mut shutdown, &mut backoff_secs).await {
                return Ok(());
            }
        }
    }

    /// Route a message to its instrument's worker. Heartbeats carry no
    /// instrument and are dropped here.
    async fn dispatch(&self, message: FeedMessage) {
        let instrument_id = match &message {
            FeedMessage::Ticker(tick) => tick.instrument_id.clone(),
            FeedMessage::UserFill(fill) => fill.instrument_id.clone(),
            FeedMessage::Heartbeat => return,
        };

        match self.workers.get(&instrument_id) {
            Some(sender) => {
                if sender.send(message).await.is_err() {
                    tracing::warn!(instrument = %instrument_id, "worker channel closed");
                }
            }
            None => {
                tracing::debug!(instrument = %instrument_id, "message for unconfigured instrument");
            }
        }
    }

    /// Sleep for the current backoff (with jitter) unless shutdown fires
    /// first. Returns true when shutting down.
    async fn wait_backoff(&self, shutdown: &mut watch::Receiver<bool>, backoff_secs: &mut u64) -> bool {
        let jitter_ms = rand::thread_rng().gen_range(0..1000);
        let delay = Duration::from_secs(*backoff_secs) + Duration::from_millis(jitter_ms);
        *backoff_secs = (*backoff_secs * 2).min(MAX_BACKOFF_SECS);

        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }
}
