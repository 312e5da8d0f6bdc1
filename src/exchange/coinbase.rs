use crate::exchange::{
    ChannelType, ExchangeClient, ExchangeError, ExchangeResult, Granularity,
};
use crate::models::{AccountBalances, FeedMessage, FillMsg, OrderIntent, OrderSide, TickerMsg};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_REST_URL: &str = "https://api.exchange.coinbase.com";
const DEFAULT_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";
const RATE_LIMIT_RPS: u32 = 10; // public REST limit per key
const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const WS_CONNECT_TIMEOUT_SECS: u64 = 10;
const FEED_CHANNEL_CAPACITY: usize = 1000;

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Live exchange adapter: REST for accounts and orders, WebSocket for the
/// market-data feed.
///
/// Cloneable; all clones share the rate limiter and the session token.
#[derive(Clone)]
pub struct CoinbaseClient {
    client: Client,
    rest_url: String,
    ws_url: String,
    api_key: String,
    api_secret: String,
    session_token: Arc<RwLock<String>>,
    rate_limiter: Arc<DirectRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    currency: String,
    available: String,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    price: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
}

/// Raw feed message. Every numeric field arrives as a string and is parsed
/// leniently: a malformed value becomes `None` rather than dropping the
/// whole record.
#[derive(Debug, Deserialize)]
struct RawFeedMessage {
    #[serde(rename = "type")]
    kind: String,
    product_id: Option<String>,
    time: Option<DateTime<Utc>>,
    price: Option<String>,
    open_24h: Option<String>,
    high_24h: Option<String>,
    low_24h: Option<String>,
    volume_24h: Option<String>,
    best_bid: Option<String>,
    best_ask: Option<String>,
    trade_id: Option<u64>,
    order_id: Option<String>,
    taker_order_id: Option<String>,
    maker_order_id: Option<String>,
    side: Option<String>,
    size: Option<String>,
}

fn lenient_f64(value: &Option<String>) -> Option<f64> {
    value.as_deref().and_then(|s| s.parse().ok())
}

/// Parse one raw text frame into a feed message. Returns `None` for frames
/// the engine has no use for (subscription acks, errors already logged).
fn parse_feed_message(text: &str) -> Option<FeedMessage> {
    let raw: RawFeedMessage = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable feed frame");
            return None;
        }
    };

    match raw.kind.as_str() {
        "ticker" => Some(FeedMessage::Ticker(TickerMsg {
            instrument_id: raw.product_id?,
            time: raw.time.unwrap_or_else(Utc::now),
            price: lenient_f64(&raw.price),
            close: None,
            open: lenient_f64(&raw.open_24h),
            high: lenient_f64(&raw.high_24h),
            low: lenient_f64(&raw.low_24h),
            volume: lenient_f64(&raw.volume_24h),
            best_bid: lenient_f64(&raw.best_bid),
            best_ask: lenient_f64(&raw.best_ask),
            trade_id: raw.trade_id,
        })),
        "heartbeat" => Some(FeedMessage::Heartbeat),
        "match" | "done" => {
            let order_id = raw
                .order_id
                .or(raw.taker_order_id)
                .or(raw.maker_order_id)?;
            let side = match raw.side.as_deref() {
                Some("buy") => OrderSide::Buy,
                Some("sell") => OrderSide::Sell,
                _ => return None,
            };
            Some(FeedMessage::UserFill(FillMsg {
                instrument_id: raw.product_id?,
                order_id,
                side,
                price: lenient_f64(&raw.price),
                size: lenient_f64(&raw.size),
                time: raw.time.unwrap_or_else(Utc::now),
            }))
        }
        "error" => {
            tracing::warn!(frame = %text, "feed error frame");
            None
        }
        _ => None,
    }
}

impl CoinbaseClient {
    pub fn new(rest_url: &str, ws_url: &str, api_key: &str, api_secret: &str) -> ExchangeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ExchangeError::Transient(format!("failed to build HTTP client: {e}")))?;

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).unwrap_or(NonZeroU32::MIN));
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        Ok(Self {
            client,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            session_token: Arc::new(RwLock::new(String::new())),
            rate_limiter,
        })
    }

    pub fn from_env() -> ExchangeResult<Self> {
        let rest_url =
            std::env::var("EXCHANGE_REST_URL").unwrap_or_else(|_| DEFAULT_REST_URL.to_string());
        let ws_url =
            std::env::var("EXCHANGE_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());
        let api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("EXCHANGE_API_SECRET").unwrap_or_default();
        Self::new(&rest_url, &ws_url, &api_key, &api_secret)
    }

    /// Rate-limited request with retry on 429/5xx and network errors.
    /// Timeouts surface as `Timeout`; they are never treated as success.
    async fn send_request(&self, request: reqwest::RequestBuilder) -> ExchangeResult<reqwest::Response> {
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let token = self.session_token.read().await.clone();
            let request = match request.try_clone() {
                Some(r) => r.bearer_auth(&token),
                None => return Err(ExchangeError::Transient("request not cloneable".into())),
            };

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let backoff_secs = 2u64.pow(attempt);
                        tracing::warn!(
                            status = %status,
                            backoff_secs,
                            attempt,
                            max = MAX_RETRIES,
                            "exchange request failed, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        continue;
                    }

                    // 4xx other than rate limiting is a hard rejection.
                    let body = response.text().await.unwrap_or_default();
                    return Err(ExchangeError::Rejected(format!("{status}: {body}")));
                }
                Err(e) if e.is_timeout() => {
                    return Err(ExchangeError::Timeout(e.to_string()));
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff_secs = 2u64.pow(attempt);
                    tracing::warn!(error = %e, backoff_secs, attempt, "network error, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                }
                Err(e) => return Err(ExchangeError::Transient(e.to_string())),
            }
        }

        Err(ExchangeError::Transient(format!(
            "request failed after {MAX_RETRIES} retries"
        )))
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> ExchangeResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| ExchangeError::Transient(format!("malformed response body: {e}")))
    }
}

#[async_trait]
impl ExchangeClient for CoinbaseClient {
    async fn get_account_balances(&self, instrument_id: &str) -> ExchangeResult<AccountBalances> {
        let url = format!("{}/accounts", self.rest_url);
        let response = self.send_request(self.client.get(&url)).await?;
        let accounts: Vec<AccountEntry> = Self::parse_json(response).await?;

        // "BTC-USD" holds the base before the dash, quote after.
        let (base, quote) = instrument_id
            .split_once('-')
            .ok_or_else(|| ExchangeError::Rejected(format!("bad instrument id {instrument_id}")))?;

        let mut balances = AccountBalances::default();
        for account in accounts {
            let amount: f64 = account.available.parse().unwrap_or(0.0);
            if account.currency == quote {
                balances.available = amount;
            } else if account.currency == base {
                balances.invested = amount;
            }
        }
        Ok(balances)
    }

    async fn get_quote(&self, instrument_id: &str) -> ExchangeResult<f64> {
        let url = format!("{}/products/{}/ticker", self.rest_url, instrument_id);
        let response = self.send_request(self.client.get(&url)).await?;
        let ticker: TickerResponse = Self::parse_json(response).await?;
        ticker
            .price
            .parse()
            .map_err(|e| ExchangeError::Transient(format!("unparseable quote: {e}")))
    }

    async fn get_historical_rates(
        &self,
        instrument_id: &str,
        granularity: Granularity,
    ) -> ExchangeResult<Vec<Vec<Option<f64>>>> {
        let url = format!(
            "{}/products/{}/candles?granularity={}",
            self.rest_url, instrument_id, granularity as u32
        );
        let response = self.send_request(self.client.get(&url)).await?;

        // Rows are positional arrays of numbers; any cell that fails to
        // parse becomes None and flows through as an unpriced record.
        let rows: Vec<Vec<serde_json::Value>> = Self::parse_json(response).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().map(|cell| cell.as_f64()).collect())
            .collect())
    }

    async fn place_order(&self, intent: &OrderIntent) -> ExchangeResult<String> {
        let url = format!("{}/orders", self.rest_url);
        let side = match intent.side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let body = json!({
            "client_oid": intent.client_ref_id,
            "product_id": intent.instrument_id,
            "type": "limit",
            "side": side,
            "price": format!("{:.2}", intent.price),
            "size": intent.quantity.to_string(),
        });

        let response = self.send_request(self.client.post(&url).json(&body)).await?;
        let order: OrderResponse = Self::parse_json(response).await?;
        tracing::info!(
            instrument = %intent.instrument_id,
            side,
            price = intent.price,
            quantity = intent.quantity,
            order_id = %order.id,
            "order placed"
        );
        Ok(order.id)
    }

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()> {
        let url = format!("{}/orders/{}", self.rest_url, order_id);
        self.send_request(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        instruments: &[String],
        channels: &[ChannelType],
    ) -> ExchangeResult<mpsc::Receiver<FeedMessage>> {
        let (ws_stream, _) =
            tokio::time::timeout(Duration::from_secs(WS_CONNECT_TIMEOUT_SECS), connect_async(self.ws_url.as_str()))
                .await
                .map_err(|_| ExchangeError::Timeout("websocket connect".into()))?
                .map_err(|e| ExchangeError::Transient(format!("websocket connect: {e}")))?;

        let channel_names: Vec<&str> = channels
            .iter()
            .map(|c| match c {
                ChannelType::Ticker => "ticker",
                ChannelType::Heartbeat => "heartbeat",
                ChannelType::User => "user",
            })
            .collect();
        let subscribe_frame = json!({
            "type": "subscribe",
            "product_ids": instruments,
            "channels": channel_names,
        });

        let (mut write, mut read) = ws_stream.split();
        write
            .send(Message::Text(subscribe_frame.to_string()))
            .await
            .map_err(|e| ExchangeError::Transient(format!("subscribe frame: {e}")))?;

        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);

        // Reader task; when it ends the receiver closes, which the feed
        // manager takes as a disconnect.
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(message) = parse_feed_message(&text) {
                            if tx.send(message).await.is_err() {
                                break; // consumer gone
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("feed closed by the exchange");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "feed read error");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn refresh_credentials(&self) -> ExchangeResult<()> {
        let url = format!("{}/sessions", self.rest_url);
        let body = json!({
            "api_key": self.api_key,
            "api_secret": self.api_secret,
        });

        let response = self.send_request(self.client.post(&url).json(&body)).await?;
        let session: SessionResponse = Self::parse_json(response).await?;
        *self.session_token.write().await = session.token;
        tracing::info!("session credentials refreshed");
        Ok(())
    }
}
