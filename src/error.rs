/// error.rs — structured, recoverable error kinds.
///
/// Per §7 most failures are logged-and-skipped rather than
/// propagated; this enum gives those call sites something to match on
/// instead of stringly-typed anyhow contexts. Call sites that must
/// bubble up (invariant violations) still use `anyhow::Result`.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("market data unavailable for {symbol}: {reason}")]
    MissingData { symbol: String, reason: String },

    #[error("strategy evaluation failed for {symbol}: {reason}")]
    StrategyFailure { symbol: String, reason: String },

    #[error("order dispatch failed for {symbol}: {reason}")]
    OrderDispatch { symbol: String, reason: String },

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Invariant violations are the only fatal kind (§7); everything
    /// else is skip-and-continue for the current tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Invariant(_))
    }
}
