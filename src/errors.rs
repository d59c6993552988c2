//! Error types for the lottery settlement engine
//!
//! Every fallible engine operation returns [`LotteryResult`]. A failed call
//! never leaves a partial mutation behind: mutations are staged and committed
//! as one write batch only after every check has passed.

use crate::types::{AccountId, RoundState, TransferKind, Wei};

/// Root error type for all engine operations
#[derive(Debug, thiserror::Error)]
pub enum LotteryError {
    #[error("Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    #[error("Insufficient tokens for {account}: balance {balance}, required {required}")]
    InsufficientTokens {
        account: AccountId,
        balance: u64,
        required: u64,
    },

    #[error("Guess {value} outside allowed range {min}..={max}")]
    GuessOutOfRange { value: i64, min: u8, max: u8 },

    #[error("Round {round_id} is not open (state: {state})")]
    RoundNotOpen { round_id: u64, state: RoundState },

    #[error("Round {round_id} is not settling (state: {state})")]
    RoundNotSettling { round_id: u64, state: RoundState },

    #[error("Invalid transition for round {round_id}: {from} -> {to}")]
    InvalidTransition {
        round_id: u64,
        from: RoundState,
        to: RoundState,
    },

    #[error("Caller {caller} is not the owner")]
    Unauthorized { caller: AccountId },

    #[error("Winner already computed for round {round_id}")]
    AlreadyComputed { round_id: u64 },

    #[error("Round {round_id} cannot finalize: reimbursed={reimbursed}, paid_out={paid_out}")]
    NotDistributed {
        round_id: u64,
        reimbursed: bool,
        paid_out: bool,
    },

    #[error("{kind} transfer of {amount} to {account} failed: {source}")]
    TransferFailed {
        kind: TransferKind,
        account: AccountId,
        amount: Wei,
        #[source]
        source: TransferError,
    },

    #[error("Round {0} not found")]
    RoundNotFound(u64),

    #[error("Winner not computed yet for round {round_id}")]
    WinnerNotComputed { round_id: u64 },

    #[error("Invalid entropy: {0}")]
    InvalidEntropy(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigValidationError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Storage system errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Ledger invariant violated: {0}")]
    InvariantViolated(String),
}

/// Failure reported by the value-transfer collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// May succeed if the same transfer is attempted again later
    #[error("transient transfer failure: {0}")]
    Transient(String),

    #[error("permanent transfer failure: {0}")]
    Permanent(String),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient(_))
    }
}

impl LotteryError {
    /// Stable, low-cardinality label used for logging fields and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            LotteryError::InvalidAmount { .. } => "invalid_amount",
            LotteryError::InsufficientTokens { .. } => "insufficient_tokens",
            LotteryError::GuessOutOfRange { .. } => "guess_out_of_range",
            LotteryError::RoundNotOpen { .. } => "round_not_open",
            LotteryError::RoundNotSettling { .. } => "round_not_settling",
            LotteryError::InvalidTransition { .. } => "invalid_transition",
            LotteryError::Unauthorized { .. } => "unauthorized",
            LotteryError::AlreadyComputed { .. } => "already_computed",
            LotteryError::NotDistributed { .. } => "not_distributed",
            LotteryError::TransferFailed { .. } => "transfer_failed",
            LotteryError::RoundNotFound(_) => "round_not_found",
            LotteryError::WinnerNotComputed { .. } => "winner_not_computed",
            LotteryError::InvalidEntropy(_) => "invalid_entropy",
            LotteryError::Storage(_) => "storage",
            LotteryError::Configuration(_) => "configuration",
            LotteryError::Metrics(_) => "metrics",
        }
    }

    pub(crate) fn invalid_amount(reason: impl Into<String>) -> Self {
        LotteryError::InvalidAmount {
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for LotteryError {
    fn from(e: bincode::Error) -> Self {
        LotteryError::Storage(StorageError::CorruptedData(e.to_string()))
    }
}

// Convenience type alias for Results
pub type LotteryResult<T> = Result<T, LotteryError>;
