//! Prediction records and their horizon evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use perppilot_core::types::{Direction, Prediction};

/// Realized price path over the evaluation window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RealizedPath {
    pub final_price: f64,
    pub high: f64,
    pub low: f64,
}

impl RealizedPath {
    /// Degenerate path from a single price, used when history is missing.
    #[must_use]
    pub const fn flat(price: f64) -> Self {
        Self { final_price: price, high: price, low: price }
    }
}

/// One tracked prediction, evaluated once its target time has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub prediction: Prediction,
    /// Price at the moment of the prediction.
    pub entry_price: f64,
    pub target_time: DateTime<Utc>,
    #[serde(default)]
    pub evaluated: bool,
    #[serde(default)]
    pub actual_move: f64,
    #[serde(default)]
    pub actual_high: f64,
    #[serde(default)]
    pub actual_low: f64,
    #[serde(default)]
    pub is_correct: bool,
    /// 0..1 closeness of the realized move to the predicted one.
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub evaluated_time: Option<DateTime<Utc>>,
    /// Whether the prediction was actually traded.
    #[serde(default)]
    pub executed: bool,
    #[serde(default)]
    pub reject_reason: String,
}

impl PredictionRecord {
    #[must_use]
    pub fn new(
        prediction: Prediction,
        entry_price: f64,
        now: DateTime<Utc>,
        executed: bool,
        reject_reason: impl Into<String>,
    ) -> Self {
        let target_time = now + chrono::Duration::hours(prediction.timeframe.hours());
        let id = format!(
            "{}_{}_{}",
            prediction.symbol,
            now.timestamp(),
            now.timestamp_subsec_nanos()
        );
        Self {
            id,
            timestamp: now,
            symbol: prediction.symbol.clone(),
            prediction,
            entry_price,
            target_time,
            evaluated: false,
            actual_move: 0.0,
            actual_high: 0.0,
            actual_low: 0.0,
            is_correct: false,
            accuracy: 0.0,
            evaluated_time: None,
            executed,
            reject_reason: reject_reason.into(),
        }
    }

    /// Scores the record against the realized path.
    ///
    /// `up` is correct iff the move was positive, `down` iff negative,
    /// `neutral` iff the absolute move stayed under 1%. Accuracy is
    /// `1 - min(|expected - actual| / |expected|, 1)`, 0.5 when the expected
    /// move was zero.
    pub fn evaluate(&mut self, path: &RealizedPath, now: DateTime<Utc>) {
        self.actual_move = if self.entry_price > 0.0 {
            ((path.final_price - self.entry_price) / self.entry_price) * 100.0
        } else {
            0.0
        };
        self.actual_high = path.high;
        self.actual_low = path.low;

        self.is_correct = match self.prediction.direction {
            Direction::Up => self.actual_move > 0.0,
            Direction::Down => self.actual_move < 0.0,
            Direction::Neutral => self.actual_move.abs() < 1.0,
        };

        let expected = self.prediction.expected_move;
        self.accuracy = if expected != 0.0 {
            let deviation = (expected - self.actual_move).abs();
            1.0 - (deviation / expected.abs()).min(1.0)
        } else {
            0.5
        };

        self.evaluated = true;
        self.evaluated_time = Some(now);
    }
}
