//! File-backed prediction store and the pending-evaluation sweep.
//!
//! One JSON file per record, named `{symbol}_{unix}_{nano}.json`, so records
//! survive restarts and can be inspected individually. Malformed files are
//! skipped, never fatal.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::record::{PredictionRecord, RealizedPath};
use perppilot_core::types::Prediction;

/// Errors from the prediction tracker.
#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Source of realized price paths for evaluation.
#[async_trait]
pub trait PricePathProvider: Send + Sync {
    /// Price path of `symbol` over `[start, end]`.
    async fn price_path(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<RealizedPath>;

    /// Latest price, used as a degraded fallback when history is missing.
    async fn current_price(&self, symbol: &str) -> anyhow::Result<f64>;
}

/// Records every prediction and evaluates them after their horizon.
pub struct PredictionTracker {
    data_dir: PathBuf,
}

impl PredictionTracker {
    /// Opens (and creates) the record directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    /// Records an executed prediction at its entry price.
    pub fn record(&self, prediction: &Prediction, entry_price: f64) -> Result<(), TrackerError> {
        self.record_all(prediction, entry_price, true, "")
    }

    /// Records any prediction, executed or rejected, so accuracy statistics
    /// cover the whole population.
    pub fn record_all(
        &self,
        prediction: &Prediction,
        entry_price: f64,
        executed: bool,
        reject_reason: &str,
    ) -> Result<(), TrackerError> {
        let record = PredictionRecord::new(
            prediction.clone(),
            entry_price,
            Utc::now(),
            executed,
            reject_reason,
        );
        self.write_record(&record)
    }

    fn write_record(&self, record: &PredictionRecord) -> Result<(), TrackerError> {
        let path = self.data_dir.join(format!("{}.json", record.id));
        let data = serde_json::to_vec_pretty(record)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Loads every parseable record; malformed files are skipped.
    #[must_use]
    pub fn load_records(&self) -> Vec<PredictionRecord> {
        let Ok(entries) = fs::read_dir(&self.data_dir) else {
            return Vec::new();
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping malformed record");
                }
            }
        }
        records
    }

    /// Evaluates every pending record whose target time has passed.
    ///
    /// Missing price history degrades to the current price; symbols whose
    /// price cannot be fetched at all are skipped for this sweep.
    pub async fn evaluate_pending<P: PricePathProvider + ?Sized>(&self, provider: &P) -> usize {
        let now = Utc::now();
        let mut evaluated = 0;

        for mut record in self.load_records() {
            if record.evaluated || now < record.target_time {
                continue;
            }

            let path = match provider
                .price_path(&record.symbol, record.timestamp, record.target_time)
                .await
            {
                Ok(path) => path,
                Err(err) => match provider.current_price(&record.symbol).await {
                    Ok(price) => {
                        warn!(
                            symbol = %record.symbol,
                            error = %err,
                            "price history unavailable, evaluating against spot"
                        );
                        RealizedPath::flat(price)
                    }
                    Err(err2) => {
                        warn!(symbol = %record.symbol, error = %err2, "cannot evaluate prediction");
                        continue;
                    }
                },
            };

            record.evaluate(&path, now);
            if let Err(err) = self.write_record(&record) {
                warn!(id = %record.id, error = %err, "failed to persist evaluated record");
                continue;
            }
            evaluated += 1;
        }

        evaluated
    }

    /// The most recent records, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<PredictionRecord> {
        let mut records = self.load_records();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        records
    }
}

fn read_record(path: &Path) -> Result<PredictionRecord, TrackerError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use perppilot_core::types::{Confidence, Direction, RiskLevel, Timeframe};
    use std::io::Write;
    use tempfile::TempDir;

    struct FlatProvider(f64);

    #[async_trait]
    impl PricePathProvider for FlatProvider {
        async fn price_path(
            &self,
            _symbol: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> anyhow::Result<RealizedPath> {
            Ok(RealizedPath::flat(self.0))
        }

        async fn current_price(&self, _symbol: &str) -> anyhow::Result<f64> {
            Ok(self.0)
        }
    }

    fn prediction(symbol: &str) -> Prediction {
        Prediction {
            symbol: symbol.to_string(),
            direction: Direction::Up,
            probability: 0.7,
            expected_move: 2.0,
            best_case: 4.0,
            worst_case: -2.0,
            timeframe: Timeframe::H1,
            confidence: Confidence::High,
            risk_level: RiskLevel::Medium,
            reasoning: "test".to_string(),
            key_factors: vec![],
        }
    }

    #[test]
    fn records_are_persisted_one_file_each() {
        let dir = TempDir::new().unwrap();
        let tracker = PredictionTracker::new(dir.path()).unwrap();

        tracker.record(&prediction("BTCUSDT"), 100.0).unwrap();
        tracker
            .record_all(&prediction("ETHUSDT"), 2000.0, false, "cooldown")
            .unwrap();

        let records = tracker.load_records();
        assert_eq!(records.len(), 2);
        let rejected = records.iter().find(|r| r.symbol == "ETHUSDT").unwrap();
        assert!(!rejected.executed);
        assert_eq!(rejected.reject_reason, "cooldown");
    }

    #[test]
    fn malformed_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let tracker = PredictionTracker::new(dir.path()).unwrap();
        tracker.record(&prediction("BTCUSDT"), 100.0).unwrap();

        let mut file = fs::File::create(dir.path().join("garbage.json")).unwrap();
        file.write_all(b"not valid json {{{").unwrap();

        assert_eq!(tracker.load_records().len(), 1);
    }

    #[tokio::test]
    async fn pending_records_evaluate_after_target_time() {
        let dir = TempDir::new().unwrap();
        let tracker = PredictionTracker::new(dir.path()).unwrap();

        // Write a record whose target time is already in the past.
        let mut record =
            PredictionRecord::new(prediction("BTCUSDT"), 100.0, Utc::now(), true, "");
        record.timestamp = Utc::now() - chrono::Duration::hours(3);
        record.target_time = Utc::now() - chrono::Duration::hours(2);
        tracker.write_record(&record).unwrap();

        let n = tracker.evaluate_pending(&FlatProvider(103.0)).await;
        assert_eq!(n, 1);

        let records = tracker.load_records();
        assert!(records[0].evaluated);
        assert!(records[0].is_correct);
        assert!((records[0].actual_move - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn future_records_stay_pending() {
        let dir = TempDir::new().unwrap();
        let tracker = PredictionTracker::new(dir.path()).unwrap();
        tracker.record(&prediction("BTCUSDT"), 100.0).unwrap();

        let n = tracker.evaluate_pending(&FlatProvider(103.0)).await;
        assert_eq!(n, 0);
        assert!(!tracker.load_records()[0].evaluated);
    }

    #[test]
    fn recent_orders_newest_first() {
        let dir = TempDir::new().unwrap();
        let tracker = PredictionTracker::new(dir.path()).unwrap();

        let old = PredictionRecord::new(
            prediction("BTCUSDT"),
            100.0,
            Utc::now() - chrono::Duration::hours(5),
            true,
            "",
        );
        let new = PredictionRecord::new(prediction("ETHUSDT"), 2000.0, Utc::now(), true, "");
        tracker.write_record(&old).unwrap();
        tracker.write_record(&new).unwrap();

        let recent = tracker.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].symbol, "ETHUSDT");
    }
}
