//! Aggregate performance statistics and probability calibration.

use std::fmt::Write as _;

use crate::record::PredictionRecord;
use crate::store::PredictionTracker;

/// Minimum evaluated sample before calibration is trusted.
const CALIBRATION_MIN_SAMPLE: usize = 5;
/// Calibration factor clamp.
const CALIBRATION_CLAMP: (f64, f64) = (0.5, 1.5);
/// Predictions above this probability count toward overconfidence when they
/// miss.
const OVERCONFIDENCE_PROB: f64 = 0.70;

/// Win-rate and accuracy summary over evaluated records.
#[derive(Debug, Clone, Default)]
pub struct HistoricalPerformance {
    pub overall_win_rate: f64,
    pub symbol_win_rate: f64,
    pub avg_accuracy: f64,
    pub evaluated_count: usize,
    pub common_mistakes: String,
}

/// Calibration derived from realized accuracy vs stated probability.
#[derive(Debug, Clone)]
pub struct CalibrationData {
    pub symbol: String,
    pub sample_size: usize,
    /// Multiplier applied to raw probabilities, clamped to `[0.5, 1.5]`.
    pub calibration_factor: f64,
    /// Share of high-probability predictions that missed.
    pub overconfidence_bias: f64,
    pub direction_accuracy: f64,
    pub magnitude_accuracy: f64,
}

impl CalibrationData {
    fn default_for(symbol: &str, sample_size: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            sample_size,
            calibration_factor: 1.0,
            overconfidence_bias: 0.0,
            direction_accuracy: 0.5,
            magnitude_accuracy: 0.5,
        }
    }
}

impl PredictionTracker {
    /// Performance over all evaluated records, with the per-symbol win rate
    /// for `symbol`.
    #[must_use]
    pub fn performance(&self, symbol: &str) -> HistoricalPerformance {
        let evaluated: Vec<PredictionRecord> =
            self.load_records().into_iter().filter(|r| r.evaluated).collect();

        if evaluated.is_empty() {
            return HistoricalPerformance::default();
        }

        let correct = evaluated.iter().filter(|r| r.is_correct).count();
        let accuracy_sum: f64 = evaluated.iter().map(|r| r.accuracy).sum();

        let symbol_records: Vec<&PredictionRecord> =
            evaluated.iter().filter(|r| r.symbol == symbol).collect();
        let symbol_win_rate = if symbol_records.is_empty() {
            0.0
        } else {
            symbol_records.iter().filter(|r| r.is_correct).count() as f64
                / symbol_records.len() as f64
        };

        HistoricalPerformance {
            overall_win_rate: correct as f64 / evaluated.len() as f64,
            symbol_win_rate,
            avg_accuracy: accuracy_sum / evaluated.len() as f64,
            evaluated_count: evaluated.len(),
            common_mistakes: analyze_common_mistakes(&evaluated),
        }
    }

    /// Calibration data for `symbol` (empty string: all symbols).
    #[must_use]
    pub fn calibration(&self, symbol: &str) -> CalibrationData {
        let records: Vec<PredictionRecord> = self
            .load_records()
            .into_iter()
            .filter(|r| r.evaluated && (symbol.is_empty() || r.symbol == symbol))
            .collect();

        if records.len() < CALIBRATION_MIN_SAMPLE {
            return CalibrationData::default_for(symbol, records.len());
        }

        let n = records.len() as f64;
        let avg_predicted_prob: f64 =
            records.iter().map(|r| r.prediction.probability).sum::<f64>() / n;
        let actual_accuracy = records.iter().filter(|r| r.is_correct).count() as f64 / n;

        let mut magnitude_error_sum = 0.0;
        let mut overconfident = 0usize;
        for r in &records {
            if r.prediction.expected_move != 0.0 {
                let err = ((r.prediction.expected_move - r.actual_move)
                    / r.prediction.expected_move)
                    .abs()
                    .min(1.0);
                magnitude_error_sum += err;
            }
            if r.prediction.probability > OVERCONFIDENCE_PROB && !r.is_correct {
                overconfident += 1;
            }
        }

        let calibration_factor = if avg_predicted_prob > 0.1 {
            (actual_accuracy / avg_predicted_prob)
                .clamp(CALIBRATION_CLAMP.0, CALIBRATION_CLAMP.1)
        } else {
            1.0
        };

        CalibrationData {
            symbol: symbol.to_string(),
            sample_size: records.len(),
            calibration_factor,
            overconfidence_bias: overconfident as f64 / n,
            direction_accuracy: actual_accuracy,
            magnitude_accuracy: 1.0 - magnitude_error_sum / n,
        }
    }

    /// Applies the calibration factor to a raw probability. Below the
    /// minimum sample the probability passes through unchanged.
    #[must_use]
    pub fn calibrate_probability(&self, symbol: &str, probability: f64) -> f64 {
        let calibration = self.calibration(symbol);
        if calibration.sample_size < CALIBRATION_MIN_SAMPLE {
            return probability;
        }
        (probability * calibration.calibration_factor).clamp(0.0, 1.0)
    }

    /// Human-readable feedback block for the prediction prompt: successes
    /// first, then misses, then one insight line.
    #[must_use]
    pub fn recent_feedback(&self, symbol: &str, limit: usize) -> String {
        let records: Vec<PredictionRecord> = self
            .recent(limit * 3)
            .into_iter()
            .filter(|r| r.evaluated && (symbol.is_empty() || r.symbol == symbol))
            .take(limit)
            .collect();

        if records.is_empty() {
            return String::new();
        }

        let now = chrono::Utc::now();
        let mut successes = Vec::new();
        let mut misses = Vec::new();
        for r in &records {
            let minutes_ago = (now - r.timestamp).num_minutes();
            let when = if minutes_ago >= 60 {
                format!("{}h ago", minutes_ago / 60)
            } else {
                format!("{minutes_ago}m ago")
            };
            let line = format!(
                "{} {}: predicted {} {:+.1}%, actually {:+.1}%",
                when,
                r.symbol,
                r.prediction.direction.as_str(),
                r.prediction.expected_move,
                r.actual_move
            );
            if r.is_correct {
                successes.push(line);
            } else {
                misses.push(line);
            }
        }

        let accuracy = successes.len() as f64 / records.len() as f64 * 100.0;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Recent performance: {}/{} correct ({accuracy:.0}% accuracy)",
            successes.len(),
            records.len()
        );

        if !successes.is_empty() {
            out.push_str("\nRecent successes:\n");
            for line in successes.iter().take(2) {
                let _ = writeln!(out, "  - {line}");
            }
        }
        if !misses.is_empty() {
            out.push_str("\nAreas for improvement:\n");
            for line in misses.iter().take(2) {
                let _ = writeln!(out, "  - {line}");
            }
            if let Some(insight) = error_pattern_insight(&records) {
                let _ = writeln!(out, "\nInsight: {insight}");
            }
        }

        out
    }
}

fn analyze_common_mistakes(records: &[PredictionRecord]) -> String {
    if records.len() < 10 {
        return String::new();
    }

    let mut overconfident = 0usize;
    let mut risk_underestimated = 0usize;
    for r in records.iter().filter(|r| !r.is_correct) {
        if r.prediction.probability >= 0.75 {
            overconfident += 1;
        }
        if matches!(r.prediction.risk_level, perppilot_core::types::RiskLevel::Low) {
            risk_underestimated += 1;
        }
    }

    if overconfident == 0 && risk_underestimated == 0 {
        return String::new();
    }
    if overconfident >= risk_underestimated {
        format!("overconfident high-probability calls ({overconfident} misses)")
    } else {
        format!("risk underestimated on losing calls ({risk_underestimated} misses)")
    }
}

fn error_pattern_insight(records: &[PredictionRecord]) -> Option<String> {
    if records.len() < 5 {
        return None;
    }

    let mut wrong_direction = 0;
    let mut overestimated = 0;
    let mut underestimated = 0;
    for r in records.iter().filter(|r| !r.is_correct) {
        use perppilot_core::types::Direction;
        if (r.prediction.direction == Direction::Up && r.actual_move < 0.0)
            || (r.prediction.direction == Direction::Down && r.actual_move > 0.0)
        {
            wrong_direction += 1;
        }
        if r.prediction.expected_move.abs() > r.actual_move.abs() {
            overestimated += 1;
        } else if r.prediction.expected_move.abs() < r.actual_move.abs() {
            underestimated += 1;
        }
    }

    if wrong_direction >= 3 {
        Some("frequently wrong on direction; require stronger trend confirmation".to_string())
    } else if overestimated >= 3 {
        Some("move sizes are often overestimated; be more conservative".to_string())
    } else if underestimated >= 3 {
        Some("moves are often underestimated when signals align".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PredictionRecord, RealizedPath};
    use chrono::Utc;
    use perppilot_core::types::{Confidence, Direction, Prediction, RiskLevel, Timeframe};
    use tempfile::TempDir;

    fn prediction(direction: Direction, probability: f64, expected: f64) -> Prediction {
        Prediction {
            symbol: "BTCUSDT".to_string(),
            direction,
            probability,
            expected_move: expected,
            best_case: 4.0,
            worst_case: -2.0,
            timeframe: Timeframe::H1,
            confidence: Confidence::Medium,
            risk_level: RiskLevel::Medium,
            reasoning: String::new(),
            key_factors: vec![],
        }
    }

    fn seeded_tracker(outcomes: &[(f64, bool)]) -> (TempDir, PredictionTracker) {
        let dir = TempDir::new().unwrap();
        let tracker = PredictionTracker::new(dir.path()).unwrap();
        for (i, (prob, correct)) in outcomes.iter().enumerate() {
            let ts = Utc::now() - chrono::Duration::minutes(i as i64 + 1);
            let mut rec =
                PredictionRecord::new(prediction(Direction::Up, *prob, 2.0), 100.0, ts, true, "");
            let path = if *correct {
                RealizedPath::flat(102.0)
            } else {
                RealizedPath::flat(98.0)
            };
            rec.evaluate(&path, Utc::now());
            // Re-persist through the public surface.
            let file = dir.path().join(format!("{}.json", rec.id));
            std::fs::write(file, serde_json::to_vec_pretty(&rec).unwrap()).unwrap();
        }
        (dir, tracker)
    }

    #[test]
    fn win_rate_and_accuracy_from_evaluated_records() {
        let (_dir, tracker) =
            seeded_tracker(&[(0.7, true), (0.7, true), (0.7, false), (0.7, true)]);
        let perf = tracker.performance("BTCUSDT");
        assert_eq!(perf.evaluated_count, 4);
        assert!((perf.overall_win_rate - 0.75).abs() < 1e-9);
        assert!((perf.symbol_win_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn calibration_needs_minimum_sample() {
        let (_dir, tracker) = seeded_tracker(&[(0.7, true), (0.7, false)]);
        let cal = tracker.calibration("BTCUSDT");
        assert_eq!(cal.sample_size, 2);
        assert!((cal.calibration_factor - 1.0).abs() < 1e-9);
        // Probability passes through when the sample is thin.
        assert!((tracker.calibrate_probability("BTCUSDT", 0.8) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn calibration_shrinks_overconfident_probabilities() {
        // Stated 0.8 on average but only 50% realized: factor 0.5/0.8.
        let outcomes: Vec<(f64, bool)> =
            (0..10).map(|i| (0.8, i % 2 == 0)).collect();
        let (_dir, tracker) = seeded_tracker(&outcomes);
        let cal = tracker.calibration("BTCUSDT");
        assert_eq!(cal.sample_size, 10);
        assert!((cal.calibration_factor - 0.625).abs() < 1e-9);
        assert!(cal.overconfidence_bias > 0.0);
        let calibrated = tracker.calibrate_probability("BTCUSDT", 0.8);
        assert!((calibrated - 0.5).abs() < 1e-9);
    }

    #[test]
    fn calibration_factor_is_clamped() {
        // All wrong: raw factor 0 clamps to 0.5.
        let outcomes: Vec<(f64, bool)> = (0..8).map(|_| (0.9, false)).collect();
        let (_dir, tracker) = seeded_tracker(&outcomes);
        let cal = tracker.calibration("BTCUSDT");
        assert!((cal.calibration_factor - 0.5).abs() < 1e-9);
    }

    #[test]
    fn calibration_is_idempotent_at_clamp_equilibrium() {
        // Applying the factor to an already-calibrated average keeps it
        // inside the clamp band rather than spiralling.
        let outcomes: Vec<(f64, bool)> = (0..10).map(|i| (0.7, i < 7)).collect();
        let (_dir, tracker) = seeded_tracker(&outcomes);
        let once = tracker.calibrate_probability("BTCUSDT", 0.7);
        let twice = tracker.calibrate_probability("BTCUSDT", once);
        assert!((once - 0.7).abs() < 1e-9);
        assert!((twice - once).abs() < 1e-9);
    }

    #[test]
    fn feedback_lists_successes_before_misses() {
        let (_dir, tracker) = seeded_tracker(&[(0.7, true), (0.7, false), (0.7, true)]);
        let feedback = tracker.recent_feedback("BTCUSDT", 5);
        assert!(feedback.contains("Recent performance"));
        let success_idx = feedback.find("Recent successes").unwrap();
        let miss_idx = feedback.find("Areas for improvement").unwrap();
        assert!(success_idx < miss_idx);
    }

    #[test]
    fn feedback_empty_without_evaluations() {
        let dir = TempDir::new().unwrap();
        let tracker = PredictionTracker::new(dir.path()).unwrap();
        assert!(tracker.recent_feedback("BTCUSDT", 5).is_empty());
    }
}
