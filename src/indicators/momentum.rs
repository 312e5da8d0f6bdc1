use crate::history::HistoryStore;

/// RSI-style momentum oscillator over distinct-minute samples.
///
/// Takes the most recent `lookback + 1` samples, one per calendar minute
/// (extra samples within the same minute are discarded), averages positive
/// deltas as gain and the magnitude of negative deltas as loss, then returns
/// `100 - 100 / (1 + gain/loss)`.
///
/// Values:
/// - > 70: overbought
/// - < 30: oversold
///
/// Returns `None` until enough distinct-minute history exists; the caller
/// must treat that as "not ready", never as a neutral reading. The value is
/// a decision trigger, recomputed fresh on demand and never cached.
pub fn momentum(history: &HistoryStore, instrument_id: &str, lookback: usize) -> Option<f64> {
    let samples = history.recent_minute_samples(instrument_id, lookback + 1);

    if samples.len() < lookback + 1 {
        return None;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    // Samples are newest-first; delta is newer minus older.
    for pair in samples.windows(2) {
        let change = pair[0] - pair[1];
        if change >= 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= lookback as f64;
    avg_loss /= lookback as f64;

    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceRecord;
    use chrono::{TimeZone, Utc};

    fn push(store: &HistoryStore, secs: i64, price: Option<f64>) {
        store.insert(PriceRecord {
            instrument_id: "BTC-USD".to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            price,
            open: None,
            high: None,
            low: None,
            volume: None,
            best_bid: None,
            best_ask: None,
            trade_id: None,
        });
    }

    #[test]
    fn test_not_ready_with_insufficient_minutes() {
        let store = HistoryStore::new();
        for i in 0..5 {
            push(&store, i * 60, Some(100.0 + i as f64));
        }
        assert_eq!(momentum(&store, "BTC-USD", 14), None);
    }

    #[test]
    fn test_value_is_bounded() {
        let store = HistoryStore::new();
        let prices = [
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5, 46.0, 46.5, 46.25,
            46.0, 46.5,
        ];
        for (i, price) in prices.iter().enumerate() {
            push(&store, i as i64 * 60, Some(*price));
        }

        let value = momentum(&store, "BTC-USD", 14).unwrap();
        assert!(value > 0.0 && value < 100.0);
    }

    #[test]
    fn test_saturates_at_100_when_loss_is_zero() {
        let store = HistoryStore::new();
        for i in 0..15 {
            push(&store, i * 60, Some(100.0 + i as f64));
        }
        assert_eq!(momentum(&store, "BTC-USD", 14), Some(100.0));
    }

    #[test]
    fn test_all_losses_reads_zero() {
        let store = HistoryStore::new();
        for i in 0..15 {
            push(&store, i * 60, Some(200.0 - i as f64));
        }
        assert_eq!(momentum(&store, "BTC-USD", 14), Some(0.0));
    }

    #[test]
    fn test_same_minute_samples_are_discarded() {
        let store = HistoryStore::new();
        // Four ticks inside minute zero, then one per minute. Only the
        // newest tick of minute zero may contribute a sample.
        for i in 0..4 {
            push(&store, i * 10, Some(90.0 + i as f64));
        }
        for i in 1..5 {
            push(&store, i * 60, Some(100.0 + i as f64));
        }

        // 5 distinct minutes in total, so a 4-period oscillator is ready
        // but a 5-period one is not.
        assert!(momentum(&store, "BTC-USD", 4).is_some());
        assert_eq!(momentum(&store, "BTC-USD", 5), None);
    }

    #[test]
    fn test_tick_burst_within_one_minute_keeps_oscillator_ready() {
        let store = HistoryStore::new();
        for i in 0..15 {
            push(&store, i * 60, Some(100.0 + i as f64));
        }
        // A flood of ticks inside a single later minute must not push the
        // earlier minutes out of reach.
        for _ in 0..2_000 {
            push(&store, 15 * 60, Some(120.0));
        }

        assert!(momentum(&store, "BTC-USD", 14).is_some());
    }

    #[test]
    fn test_unpriced_records_do_not_count() {
        let store = HistoryStore::new();
        for i in 0..15 {
            push(&store, i * 60, None);
        }
        assert_eq!(momentum(&store, "BTC-USD", 14), None);
    }
}
