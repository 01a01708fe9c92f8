use thiserror::Error;

/// Errors surfaced by the acquisition and scheduling layers.
///
/// Retry policy lives entirely in the download scheduler; the orchestrator
/// and browser pool only classify failures and propagate them.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The underlying fetch failed: network, parse, block, or zero-result.
    /// Never cached.
    #[error("acquisition failed: {0}")]
    Acquisition(String),

    /// An operation exceeded its hard or stale threshold; its page was
    /// forcibly reclaimed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Enqueue rejected because the per-series storage cap is already met.
    #[error("storage budget exceeded: {used_bytes} of {budget_bytes} bytes used")]
    BudgetExceeded { used_bytes: u64, budget_bytes: u64 },

    /// An abort signal fired or a job's cancellation flag was observed.
    /// Not counted as a failed attempt.
    #[error("operation canceled")]
    Canceled,

    /// The shared browser could not be launched or a page could not be
    /// created/configured.
    #[error("browser error: {0}")]
    Browser(String),

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Shorthand used by adapters to wrap arbitrary scrape failures.
    pub fn acquisition(err: impl std::fmt::Display) -> Self {
        FetchError::Acquisition(err.to_string())
    }

    /// Whether the scheduler may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Acquisition(_) | FetchError::Timeout(_) | FetchError::Browser(_)
        )
    }
}

impl From<rusqlite::Error> for FetchError {
    fn from(err: rusqlite::Error) -> Self {
        FetchError::Store(err.to_string())
    }
}
