pub mod auto_trader;
pub mod constraints;
pub mod decision_log;
pub mod order_manager;
pub mod price_paths;
pub mod reconcile;
pub mod recovery;
pub mod universe;

pub use auto_trader::{AutoTrader, AutoTraderDeps};
pub use constraints::{ConstraintError, TradingConstraints};
pub use decision_log::{DecisionLogger, DecisionRecord, PerformanceAnalysis};
pub use order_manager::{ManagedOrder, OrderManager};
pub use universe::{CandidateUniverse, StaticUniverse};
