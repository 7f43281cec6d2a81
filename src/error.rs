// =============================================================================
// Error taxonomy — every failure knows how far its retry scope reaches
// =============================================================================
//
//   Item     — one sub-window, one connect attempt, one cleanup delegate.
//   Cycle    — the whole reconciliation pass; the next pass comes sooner.
//   Terminal — the loop stops and needs an external restart.
// =============================================================================

use thiserror::Error;

/// How far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
    Item,
    Cycle,
    Terminal,
}

/// Errors that can classify their own retry scope.
pub trait ErrorScope {
    fn scope(&self) -> FailureScope;

    fn is_terminal(&self) -> bool {
        self.scope() == FailureScope::Terminal
    }
}

// ---------------------------------------------------------------------------
// Streaming feed
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("reconnect attempts exhausted after {attempts} consecutive failures")]
    RetryExhausted { attempts: u32 },
}

impl ErrorScope for FeedError {
    fn scope(&self) -> FailureScope {
        match self {
            FeedError::TransientNetwork(_) => FailureScope::Item,
            FeedError::RetryExhausted { .. } => FailureScope::Terminal,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::TransientNetwork(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Batch market data source
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("exchange returned {status}: {body}")]
    Exchange { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl SourceError {
    /// The remaining sub-windows of this symbol cannot succeed this cycle.
    pub fn skips_symbol(&self) -> bool {
        matches!(self, SourceError::UnknownSymbol(_))
    }
}

impl ErrorScope for SourceError {
    fn scope(&self) -> FailureScope {
        FailureScope::Item
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SourceError::Decode(e.to_string())
        } else {
            SourceError::Network(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Data store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl ErrorScope for StoreError {
    fn scope(&self) -> FailureScope {
        FailureScope::Cycle
    }
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("{component} cleanup failed: {source}")]
    Store {
        component: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ErrorScope for CleanupError {
    fn scope(&self) -> FailureScope {
        FailureScope::Item
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration unavailable: {0}")]
    Unavailable(String),
}

impl ErrorScope for ConfigError {
    fn scope(&self) -> FailureScope {
        FailureScope::Item
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no active subscribers")]
    NoSubscribers,
}

// ---------------------------------------------------------------------------
// Reconciliation cycle
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("integrity check for {symbol} failed: {source}")]
    Integrity {
        symbol: String,
        #[source]
        source: StoreError,
    },

    #[error("cycle interrupted by shutdown")]
    Stopped,
}

impl ErrorScope for CycleError {
    fn scope(&self) -> FailureScope {
        FailureScope::Cycle
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor already started")]
    AlreadyStarted,

    #[error("failed to load watched symbols: {0}")]
    Seed(#[source] StoreError),

    #[error("failed to persist watchlist change: {0}")]
    Persist(#[source] StoreError),
}

impl ErrorScope for SupervisorError {
    fn scope(&self) -> FailureScope {
        match self {
            SupervisorError::Seed(_) => FailureScope::Terminal,
            _ => FailureScope::Item,
        }
    }
}
