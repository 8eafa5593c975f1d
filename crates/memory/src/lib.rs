pub mod learner;
pub mod manager;
pub mod types;

pub use manager::{MemoryError, MemoryManager};
pub use types::{
    LearningSummary, MemoryStatus, SignalStat, TradeAction, TradeEntry, TradeMemory, TradeResult,
};
