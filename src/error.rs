// =============================================================================
// Error taxonomy
// =============================================================================
//
// Every fallible core operation returns one of these typed errors rather than
// an opaque `anyhow::Error`. `anyhow` remains in use at the broker I/O
// boundary (see `broker::deribit`) where the underlying cause is a mix of
// network, serde and protocol failures worth chaining with `.context(...)`.
// =============================================================================

use thiserror::Error;

/// Failures surfaced by a [`crate::broker::BrokerClient`] call.
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    #[error("order rejected: invalid parameters: {0}")]
    RejectedInvalid(String),
    #[error("order rejected: insufficient funds")]
    RejectedInsufficientFunds,
    #[error("rate limited, retry later")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("broker client disconnected")]
    Disconnected,
    #[error("order not found")]
    NotFound,
    #[error("unknown broker error: {0}")]
    Unknown(String),
}

/// Outcome of a [`crate::bracket::BracketOrchestrator::place_bracket`] call.
#[derive(Debug, Error, Clone)]
pub enum BracketError {
    #[error("broker rejected the bracket: {0}")]
    Rejected(String),
    #[error("timed out placing bracket")]
    Timeout,
    #[error("rolled back after partial placement: {0}")]
    RolledBack(String),
    #[error("unknown bracket failure: {0}")]
    Unknown(String),
}

/// Failures surfaced by the Trade Ledger (C3).
#[derive(Debug, Error, Clone)]
pub enum LedgerError {
    #[error("an open trade already exists for this (user, strategy, instrument)")]
    LedgerConflict,
    #[error("trade {0} not found")]
    NotFound(String),
    #[error("trade {0} is already closed")]
    AlreadyClosed(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Failures surfaced by the Strategy-State Repository (C7).
#[derive(Debug, Error, Clone)]
pub enum RepositoryError {
    #[error("record not found for key {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Failures surfaced by the Per-User Strategy Manager (C6).
#[derive(Debug, Error, Clone)]
pub enum ManagerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown strategy kind: {0}")]
    UnknownStrategy(String),
    #[error("user's broker client is not connected")]
    NotConnected,
    #[error("a strategy instance is already running for this key")]
    AlreadyRunning,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
