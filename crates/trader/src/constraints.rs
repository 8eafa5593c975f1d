//! Pre-trade hard constraints: cooldowns, rate caps, position caps and the
//! open-time registry. Every operation is O(1) (the rolling-hour window is
//! amortized O(1)); state is in-memory and re-seeded conservatively after a
//! restart.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Datelike, Duration, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use perppilot_core::config::ConstraintConfig;
use perppilot_core::types::PositionSide;

/// Why an open was refused.
#[derive(Error, Debug)]
pub enum ConstraintError {
    #[error("{symbol} in cooldown for another {remaining_minutes} min")]
    Cooldown { symbol: String, remaining_minutes: i64 },

    #[error("daily open cap reached ({cap})")]
    DailyCap { cap: usize },

    #[error("hourly open cap reached ({cap})")]
    HourlyCap { cap: usize },

    #[error("position cap reached ({count}/{cap})")]
    MaxPositions { count: usize, cap: usize },
}

struct State {
    cooldown_until: HashMap<String, DateTime<Utc>>,
    open_times: HashMap<(String, PositionSide), DateTime<Utc>>,
    opens_today: usize,
    day_number: i32,
    hourly_opens: VecDeque<DateTime<Utc>>,
}

pub struct TradingConstraints {
    config: ConstraintConfig,
    state: Mutex<State>,
}

impl TradingConstraints {
    #[must_use]
    pub fn new(config: ConstraintConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                cooldown_until: HashMap::new(),
                open_times: HashMap::new(),
                opens_today: 0,
                day_number: Utc::now().date_naive().num_days_from_ce(),
                hourly_opens: VecDeque::new(),
            }),
        }
    }

    /// Gate for a prospective open on `symbol` given the current live
    /// position count.
    pub fn can_open_position(
        &self,
        symbol: &str,
        current_position_count: usize,
    ) -> Result<(), ConstraintError> {
        let now = Utc::now();
        let mut state = self.state.lock();

        if current_position_count >= self.config.max_positions {
            return Err(ConstraintError::MaxPositions {
                count: current_position_count,
                cap: self.config.max_positions,
            });
        }

        if let Some(until) = state.cooldown_until.get(symbol) {
            if now < *until {
                return Err(ConstraintError::Cooldown {
                    symbol: symbol.to_string(),
                    remaining_minutes: (*until - now).num_minutes().max(1),
                });
            }
        }

        let today = now.date_naive().num_days_from_ce();
        if state.day_number != today {
            state.day_number = today;
            state.opens_today = 0;
        }
        if state.opens_today >= self.config.daily_open_cap {
            return Err(ConstraintError::DailyCap { cap: self.config.daily_open_cap });
        }

        let hour_ago = now - Duration::hours(1);
        while state.hourly_opens.front().is_some_and(|t| *t < hour_ago) {
            state.hourly_opens.pop_front();
        }
        if state.hourly_opens.len() >= self.config.hourly_open_cap {
            return Err(ConstraintError::HourlyCap { cap: self.config.hourly_open_cap });
        }

        Ok(())
    }

    /// Registers a filled open and its open time.
    pub fn record_open_position(&self, symbol: &str, side: PositionSide) {
        let now = Utc::now();
        let mut state = self.state.lock();
        let today = now.date_naive().num_days_from_ce();
        if state.day_number != today {
            state.day_number = today;
            state.opens_today = 0;
        }
        state.opens_today += 1;
        state.hourly_opens.push_back(now);
        state.open_times.insert((symbol.to_string(), side), now);
    }

    /// Registers a close: starts the cooldown and forgets the open time.
    pub fn record_close_position(&self, symbol: &str, side: PositionSide) {
        let mut state = self.state.lock();
        state.cooldown_until.insert(
            symbol.to_string(),
            Utc::now() + Duration::minutes(self.config.cooldown_minutes),
        );
        state.open_times.remove(&(symbol.to_string(), side));
    }

    /// When the position was opened, if this process saw the open.
    #[must_use]
    pub fn position_open_time(&self, symbol: &str, side: PositionSide) -> Option<DateTime<Utc>> {
        self.state.lock().open_times.get(&(symbol.to_string(), side)).copied()
    }

    /// Seeds an open time for a position discovered at startup (or one
    /// opened outside this process). Existing entries are kept.
    pub fn seed_open_time(&self, symbol: &str, side: PositionSide, open_time: DateTime<Utc>) {
        self.state
            .lock()
            .open_times
            .entry((symbol.to_string(), side))
            .or_insert(open_time);
    }

    /// Minimum hold time for direction-flip closes, from configuration.
    #[must_use]
    pub const fn min_hold_minutes(&self) -> i64 {
        self.config.min_hold_minutes
    }
}
