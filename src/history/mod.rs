use crate::models::{PriceRecord, TickerMsg};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe, per-instrument price history.
///
/// Keeps one time-ordered sequence of normalized records per instrument.
/// Bulk historical loads and live ticks merge into the same sequence; the
/// store never shrinks during a session.
#[derive(Clone, Default)]
pub struct HistoryStore {
    data: Arc<RwLock<HashMap<String, Vec<PriceRecord>>>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Normalize and merge a bulk historical load.
    ///
    /// Rows are positional `[time, low, high, open, close, volume]` arrays.
    /// Creates the instrument's sequence if absent.
    pub fn merge(&self, instrument_id: &str, rows: &[Vec<Option<f64>>]) {
        for row in rows {
            self.insert(PriceRecord::from_rate_row(instrument_id, row));
        }
    }

    /// Normalize and insert a single live tick.
    pub fn append(&self, tick: &TickerMsg) {
        self.insert(PriceRecord::from_ticker(tick));
    }

    /// Insert a record at its sorted position by timestamp.
    ///
    /// Ticks usually arrive in order, so the common case is an O(1) tail
    /// push; records with equal timestamps land after existing ones
    /// (stable order).
    pub fn insert(&self, record: PriceRecord) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let records = data.entry(record.instrument_id.clone()).or_default();

        match records.last() {
            Some(last) if last.timestamp > record.timestamp => {
                let pos = records.partition_point(|r| r.timestamp <= record.timestamp);
                records.insert(pos, record);
            }
            _ => records.push(record),
        }
    }

    /// The most recent `n` records, sorted by non-decreasing timestamp.
    pub fn latest(&self, instrument_id: &str, n: usize) -> Vec<PriceRecord> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(instrument_id)
            .map(|records| {
                let start = records.len().saturating_sub(n);
                records[start..].to_vec()
            })
            .unwrap_or_default()
    }

    /// The most recent priced sample per distinct calendar minute, newest
    /// first, up to `needed` samples.
    ///
    /// Scans the whole sequence in reverse so a burst of ticks inside one
    /// minute never hides older minutes. Unpriced records are skipped and do
    /// not claim their minute.
    pub fn recent_minute_samples(&self, instrument_id: &str, needed: usize) -> Vec<f64> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let Some(records) = data.get(instrument_id) else {
            return Vec::new();
        };

        let mut samples = Vec::with_capacity(needed);
        let mut bucket_minute: Option<i64> = None;
        for record in records.iter().rev() {
            let Some(price) = record.price else { continue };
            let minute = record.timestamp.timestamp() / 60;
            if bucket_minute != Some(minute) {
                samples.push(price);
                bucket_minute = Some(minute);
                if samples.len() == needed {
                    break;
                }
            }
        }
        samples
    }

    /// Number of records held for an instrument.
    pub fn len(&self, instrument_id: &str) -> usize {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(instrument_id).map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, instrument_id: &str) -> bool {
        self.len(instrument_id) == 0
    }

    /// All instruments with at least one record.
    pub fn instruments(&self) -> Vec<String> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.keys().cloned().collect()
    }
}
