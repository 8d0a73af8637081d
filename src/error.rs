use thiserror::Error;

/// Failures coming back from the exchange gateway.
///
/// Transient variants (`RateLimited`, `Timeout`) are safe to retry for
/// idempotent reads. Placement calls are never blindly retried: a timeout
/// there means "unknown outcome" and must be resolved with a follow-up
/// status query before any compensating action.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("rate limited by exchange")]
    RateLimited,

    #[error("exchange call timed out")]
    Timeout,

    #[error("insufficient margin")]
    InsufficientMargin,

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("order rejected by exchange: {0}")]
    Rejected(String),

    #[error("order {0} not found")]
    OrderNotFound(u64),

    #[error("order {0} already in a terminal state")]
    AlreadyTerminal(u64),

    #[error("transport error: {0}")]
    Transport(String),
}

impl ExchangeError {
    /// True for failures that a bounded-backoff retry of an idempotent
    /// call (status, price) may recover from.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::RateLimited | ExchangeError::Timeout)
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExchangeError::Timeout
        } else {
            ExchangeError::Transport(e.to_string())
        }
    }
}

/// Strategy-level failures.
///
/// The first three are creation-time rejections: the strategy is never
/// instantiated. `InvariantViolation` is fatal to one instance only and
/// never crashes the supervisor.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("invalid price relationship: {0}")]
    InvalidPriceRelationship(String),

    #[error("invalid schedule granularity: {0}")]
    InvalidScheduleGranularity(String),

    #[error("invalid grid bounds: {0}")]
    InvalidGridBounds(String),

    #[error("strategy invariant violated: {0}")]
    InvariantViolation(String),

    #[error("strategy {0} not found")]
    NotFound(uuid::Uuid),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
