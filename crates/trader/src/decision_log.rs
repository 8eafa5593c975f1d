//! Per-tick decision records: one JSON file per cycle, enough to resume
//! cycle numbering after a restart and to derive recent performance.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use perppilot_core::types::Decision;

#[derive(Error, Debug)]
pub enum DecisionLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_equity: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
    pub position_count: usize,
    pub margin_used_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedAction {
    pub action: String,
    pub symbol: String,
    pub success: bool,
    #[serde(default)]
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything worth keeping about one tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub cycle_number: u64,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cot_trace: String,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub executed: Vec<ExecutedAction>,
    #[serde(default)]
    pub account: AccountSnapshot,
    #[serde(default)]
    pub positions: Vec<perppilot_core::types::PositionInfo>,
    #[serde(default)]
    pub candidate_symbols: Vec<String>,
    #[serde(default)]
    pub execution_log: Vec<String>,
    pub success: bool,
    #[serde(default)]
    pub error_message: String,
}

/// Aggregates derived from recent records.
#[derive(Debug, Clone, Default)]
pub struct PerformanceAnalysis {
    pub cycles: usize,
    pub sharpe_ratio: Option<f64>,
    pub equity_change_pct: f64,
}

pub struct DecisionLogger {
    dir: PathBuf,
}

impl DecisionLogger {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, DecisionLogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Persists one cycle record.
    pub fn log(&self, mut record: DecisionRecord) -> Result<(), DecisionLogError> {
        record.timestamp.get_or_insert_with(Utc::now);
        let name = format!(
            "cycle_{:08}_{}.json",
            record.cycle_number,
            record.timestamp.map_or(0, |t| t.timestamp())
        );
        let data = serde_json::to_vec_pretty(&record)?;
        fs::write(self.dir.join(name), data)?;
        Ok(())
    }

    fn load_records(&self) -> Vec<DecisionRecord> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).map_err(DecisionLogError::from).and_then(|data| {
                serde_json::from_slice::<DecisionRecord>(&data).map_err(Into::into)
            }) {
                Ok(record) => records.push(record),
                Err(err) => debug!(path = %path.display(), error = %err, "skipping bad record"),
            }
        }
        records
    }

    /// Highest persisted cycle number, for resuming after a restart.
    #[must_use]
    pub fn recover_last_cycle(&self) -> u64 {
        self.load_records()
            .iter()
            .map(|r| r.cycle_number)
            .max()
            .unwrap_or(0)
    }

    /// Sharpe and equity change over the most recent `limit` cycles.
    #[must_use]
    pub fn analyze_performance(&self, limit: usize) -> PerformanceAnalysis {
        let mut records = self.load_records();
        records.sort_by_key(|r| r.cycle_number);
        let start = records.len().saturating_sub(limit);
        let window = &records[start..];

        let equities: Vec<f64> = window
            .iter()
            .map(|r| r.account.total_equity)
            .filter(|e| *e > 0.0)
            .collect();

        if equities.len() < 3 {
            return PerformanceAnalysis { cycles: window.len(), ..PerformanceAnalysis::default() };
        }

        let returns: Vec<f64> = equities
            .windows(2)
            .map(|pair| (pair[1] - pair[0]) / pair[0])
            .collect();
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();

        let sharpe = if std_dev > 0.0 {
            // Annualized against a 3-minute cycle cadence.
            Some(mean / std_dev * (480.0 * 365.0_f64).sqrt())
        } else {
            None
        };

        let first = equities[0];
        let last = equities[equities.len() - 1];

        PerformanceAnalysis {
            cycles: window.len(),
            sharpe_ratio: sharpe,
            equity_change_pct: (last - first) / first * 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(cycle: u64, equity: f64) -> DecisionRecord {
        DecisionRecord {
            cycle_number: cycle,
            timestamp: Some(Utc::now()),
            account: AccountSnapshot { total_equity: equity, ..AccountSnapshot::default() },
            success: true,
            ..DecisionRecord::default()
        }
    }

    #[test]
    fn cycle_numbering_resumes_from_the_largest_record() {
        let dir = TempDir::new().unwrap();
        let logger = DecisionLogger::open(dir.path()).unwrap();
        assert_eq!(logger.recover_last_cycle(), 0);

        logger.log(record(7, 1000.0)).unwrap();
        logger.log(record(12, 1010.0)).unwrap();
        logger.log(record(9, 1005.0)).unwrap();

        let reopened = DecisionLogger::open(dir.path()).unwrap();
        assert_eq!(reopened.recover_last_cycle(), 12);
    }

    #[test]
    fn performance_needs_enough_samples() {
        let dir = TempDir::new().unwrap();
        let logger = DecisionLogger::open(dir.path()).unwrap();
        logger.log(record(1, 1000.0)).unwrap();
        let perf = logger.analyze_performance(10);
        assert!(perf.sharpe_ratio.is_none());
    }

    #[test]
    fn rising_equity_has_positive_sharpe() {
        let dir = TempDir::new().unwrap();
        let logger = DecisionLogger::open(dir.path()).unwrap();
        let mut equity = 1000.0;
        for i in 0..10 {
            equity *= if i % 3 == 0 { 1.002 } else { 1.004 };
            logger.log(record(i, equity)).unwrap();
        }
        let perf = logger.analyze_performance(10);
        assert!(perf.sharpe_ratio.unwrap() > 0.0);
        assert!(perf.equity_change_pct > 0.0);
    }

    #[test]
    fn malformed_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let logger = DecisionLogger::open(dir.path()).unwrap();
        logger.log(record(3, 1000.0)).unwrap();
        fs::write(dir.path().join("junk.json"), b"]{[").unwrap();
        assert_eq!(logger.recover_last_cycle(), 3);
    }
}
