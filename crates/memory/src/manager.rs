//! Trade-memory manager: bounded working memory with atomic persistence.
//!
//! `add_trade` is the only mutating entry point; it appends, trims, refreshes
//! the learning summary and persists, all under one write lock, so callers
//! never have to reason about lock ordering.

use std::fs;
use std::path::PathBuf;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::learner::{self, MIN_COMPLETED_FOR_LEARNING};
use crate::types::{
    MemoryStatus, TradeEntry, TradeMemory, TradeResult, MATURE_TRADE_COUNT, WORKING_MEMORY_SIZE,
};

/// Errors from memory persistence.
#[derive(thiserror::Error, Debug)]
pub enum MemoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct MemoryManager {
    path: PathBuf,
    memory: RwLock<TradeMemory>,
}

impl MemoryManager {
    /// Loads the memory for `trader_id` from `dir`, initializing a fresh one
    /// when the file is missing. A corrupt file is treated as missing (and
    /// logged) rather than aborting startup.
    pub fn open(dir: impl Into<PathBuf>, trader_id: &str) -> Result<Self, MemoryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{trader_id}.json"));

        let memory = match fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<TradeMemory>(&data) {
                Ok(memory) => {
                    info!(trader_id, total_trades = memory.total_trades, "loaded trade memory");
                    memory
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "corrupt memory file, starting fresh");
                    TradeMemory::new(trader_id)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(trader_id, "initializing fresh trade memory");
                TradeMemory::new(trader_id)
            }
            Err(err) => return Err(err.into()),
        };

        let manager = Self { path, memory: RwLock::new(memory) };
        manager.save()?;
        Ok(manager)
    }

    /// Appends a trade, refreshes the learning summary and persists.
    pub fn add_trade(&self, mut entry: TradeEntry) -> Result<(), MemoryError> {
        {
            let mut memory = self.memory.write();

            entry.trade_id = memory.total_trades + 1;
            memory.recent_trades.push(entry);
            if memory.recent_trades.len() > WORKING_MEMORY_SIZE {
                let excess = memory.recent_trades.len() - WORKING_MEMORY_SIZE;
                memory.recent_trades.drain(..excess);
            }

            memory.total_trades += 1;
            memory.updated_at = chrono::Utc::now();

            if memory.total_trades >= MATURE_TRADE_COUNT
                && memory.status == MemoryStatus::Learning
            {
                memory.status = MemoryStatus::Mature;
                info!(total_trades = memory.total_trades, "trade memory is now mature");
            }

            if let Some(summary) = learner::build_summary(&memory) {
                memory.learning_summary = Some(summary);
            }
        }

        self.save()
    }

    /// Serializes the memory atomically (temp file, then rename).
    pub fn save(&self) -> Result<(), MemoryError> {
        let data = {
            let memory = self.memory.read();
            serde_json::to_vec_pretty(&*memory)?
        };

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// A clone of the current memory (for APIs and tests).
    #[must_use]
    pub fn snapshot(&self) -> TradeMemory {
        self.memory.read().clone()
    }

    /// Renders the memory block injected verbatim into the prediction
    /// prompt: the last three trades plus, once the sample is large enough,
    /// the mined learning summary.
    #[must_use]
    pub fn context_prompt(&self) -> String {
        let memory = self.memory.read();

        if memory.total_trades == 0 {
            return "## Your trading memory\n\nNo trades yet; you are starting from a blank slate.\n"
                .to_string();
        }

        let mut out = format!(
            "## Your recent decisions ({} trades total)\n\n",
            memory.total_trades
        );

        let recent = &memory.recent_trades;
        let start = recent.len().saturating_sub(3);
        for trade in &recent[start..] {
            let age_min = (chrono::Utc::now() - trade.timestamp).num_minutes();
            out.push_str(&format!(
                "cycle #{} ({}):\n  decision: {:?} {} {}\n",
                trade.cycle,
                format_age(age_min),
                trade.action,
                trade.symbol,
                trade.side.as_str(),
            ));
            if !trade.reasoning.is_empty() {
                out.push_str(&format!("  reasoning: {}\n", trade.reasoning));
            }
            if let Some(direction) = trade.predicted_direction {
                out.push_str(&format!(
                    "  prediction: {} at {:.0}% for {:+.1}%\n",
                    direction.as_str(),
                    trade.predicted_prob * 100.0,
                    trade.predicted_move
                ));
            }
            match trade.result {
                Some(result) => out.push_str(&format!(
                    "  outcome: {} {:+.2}% over {} min\n",
                    result_label(result),
                    trade.return_pct,
                    trade.hold_minutes
                )),
                None if trade.is_limit_order => {
                    out.push_str("  outcome: limit order waiting for a fill\n");
                }
                None => out.push_str("  outcome: position still open\n"),
            }
            out.push('\n');
        }

        if let Some(summary) = &memory.learning_summary {
            if memory.total_trades >= MIN_COMPLETED_FOR_LEARNING as u64 {
                out.push_str("## Learned from your own history\n\n");

                let completed = memory.completed_trades().count();
                if completed < 50 {
                    out.push_str(
                        "(small sample; treat these statistics as provisional)\n\n",
                    );
                }
                if !summary.failure_patterns.is_empty() {
                    out.push_str("Failure patterns:\n");
                    for p in &summary.failure_patterns {
                        out.push_str(&format!("- {p}\n"));
                    }
                    out.push('\n');
                }
                if !summary.success_patterns.is_empty() {
                    out.push_str("Success patterns:\n");
                    for p in &summary.success_patterns {
                        out.push_str(&format!("- {p}\n"));
                    }
                    out.push('\n');
                }
                if !summary.market_preferences.is_empty() {
                    out.push_str("Win rate by market regime:\n");
                    let mut prefs: Vec<_> = summary.market_preferences.iter().collect();
                    prefs.sort_by(|a, b| a.0.cmp(b.0));
                    for (regime, rate) in prefs {
                        out.push_str(&format!("- {regime}: {:.0}%\n", rate * 100.0));
                    }
                    out.push('\n');
                }
            }
        }

        out
    }
}

fn format_age(minutes: i64) -> String {
    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{minutes}m ago")
    } else if minutes < 24 * 60 {
        format!("{}h ago", minutes / 60)
    } else {
        format!("{}d ago", minutes / (24 * 60))
    }
}

const fn result_label(result: TradeResult) -> &'static str {
    match result {
        TradeResult::Win => "win",
        TradeResult::Loss => "loss",
        TradeResult::BreakEven => "break-even",
    }
}
