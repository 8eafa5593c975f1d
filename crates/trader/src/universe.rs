//! Candidate-universe provider seam.

use async_trait::async_trait;

use perppilot_core::types::{normalize_symbol, CandidateSymbol};

/// Source of the ranked candidate symbol list.
#[async_trait]
pub trait CandidateUniverse: Send + Sync {
    async fn candidates(&self, limit: usize) -> anyhow::Result<Vec<CandidateSymbol>>;
}

/// Fixed universe from configuration; the production deployment swaps in a
/// ranked external provider behind the same trait.
pub struct StaticUniverse {
    symbols: Vec<String>,
}

impl StaticUniverse {
    #[must_use]
    pub fn new(symbols: Vec<String>) -> Self {
        Self { symbols: symbols.iter().map(|s| normalize_symbol(s)).collect() }
    }
}

#[async_trait]
impl CandidateUniverse for StaticUniverse {
    async fn candidates(&self, limit: usize) -> anyhow::Result<Vec<CandidateSymbol>> {
        Ok(self
            .symbols
            .iter()
            .take(limit)
            .map(|symbol| CandidateSymbol {
                symbol: symbol.clone(),
                sources: vec!["static".to_string()],
            })
            .collect())
    }
}
