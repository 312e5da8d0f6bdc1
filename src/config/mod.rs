use serde::{Deserialize, Serialize};

/// Per-instrument rule parameters.
///
/// Loaded once at startup and immutable for the session; the engine never
/// reads trading parameters from shared mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Percentage of available balance committed per entry
    pub portfolio_diversity_pct: f64,

    /// Loss percentage from the high-water mark that triggers a forced sell
    pub stop_loss_pct: f64,

    /// Loss percentage from the high-water mark flagged as the risk price
    pub risk_limit_pct: f64,

    /// Percentage above the low-water mark for the post-dip entry cap
    pub limit_pct: f64,

    /// Oscillator level at or below which the instrument counts as oversold
    pub oversold_level: f64,

    /// Distinct-minute periods for the momentum oscillator
    pub lookback_periods: usize,

    /// Offset applied to the market price on entry/exit orders, in percent.
    /// Buys are priced above market and sells below to favor fills.
    pub price_offset_pct: f64,

    /// Quote-currency decimal places for order prices
    pub price_precision: u32,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            portfolio_diversity_pct: 100.0, // whole available balance
            stop_loss_pct: 1.0,
            risk_limit_pct: 10.0,
            limit_pct: 1.0,
            oversold_level: 30.0, // standard RSI oversold line
            lookback_periods: 14,
            price_offset_pct: 0.02,
            price_precision: 2,
        }
    }
}

/// Engine-level settings parsed from the environment in main.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Instruments to trade, e.g. ["BTC-USD"]
    pub instruments: Vec<String>,

    /// Interval for the synthetic quote refresh, seconds
    pub poll_interval_secs: u64,

    /// Interval for the credential refresh timer, seconds
    pub token_refresh_secs: u64,

    pub rule: RuleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instruments: vec!["BTC-USD".to_string()],
            poll_interval_secs: 10,
            token_refresh_secs: 5 * 60 * 60, // 5h, matches exchange token TTL
            rule: RuleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let instruments = std::env::var("INSTRUMENTS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.instruments);

        Self {
            instruments,
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS", defaults.poll_interval_secs),
            token_refresh_secs: env_parse("TOKEN_REFRESH_SECS", defaults.token_refresh_secs),
            rule: RuleConfig {
                portfolio_diversity_pct: env_parse(
                    "PORTFOLIO_DIVERSITY_PCT",
                    defaults.rule.portfolio_diversity_pct,
                ),
                stop_loss_pct: env_parse("STOP_LOSS_PCT", defaults.rule.stop_loss_pct),
                risk_limit_pct: env_parse("RISK_LIMIT_PCT", defaults.rule.risk_limit_pct),
                limit_pct: env_parse("LIMIT_PCT", defaults.rule.limit_pct),
                ..defaults.rule
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(fallback)
}
