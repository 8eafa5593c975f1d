pub mod performance;
pub mod record;
pub mod store;

pub use performance::{CalibrationData, HistoricalPerformance};
pub use record::{PredictionRecord, RealizedPath};
pub use store::{PredictionTracker, PricePathProvider, TrackerError};
