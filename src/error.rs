//! Error types for the lending workflow coordinator

use ethers::types::{Address, H256, U256};
use std::time::Duration;
use thiserror::Error;

/// Main error type for workflow steps and the components beneath them
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Step '{step}' must run on {expected}, but the active chain is {actual}")]
    WrongNetwork {
        step: String,
        expected: String,
        actual: String,
    },

    #[error("Message {} has not been delivered yet", fmt_id(.message_id))]
    NotFound { message_id: H256 },

    #[error("Caller {caller:?} is not the recorded depositor {depositor:?}")]
    Authorization { caller: Address, depositor: Address },

    #[error(
        "Cannot draw against message {}: already drawn, or the depositor has an outstanding draw of {outstanding}",
        fmt_id(.message_id)
    )]
    AlreadyBorrowed { message_id: H256, outstanding: U256 },

    #[error("Repay amount {requested} does not equal the outstanding borrow {outstanding}")]
    InvalidAmount { requested: U256, outstanding: U256 },

    #[error("Held borrow-token balance {held} does not match the recorded borrow {recorded}")]
    BalanceMismatch { held: U256, recorded: U256 },

    #[error("Transient submission error on chain {chain_id}: {message}")]
    Transient { chain_id: u64, message: String },

    #[error("Rejected on chain {chain_id}: {reason}")]
    Rejected { chain_id: u64, reason: String },

    #[error("Timeout after {waited:?} waiting for {operation}")]
    Timeout { operation: String, waited: Duration },

    #[error("Reorg detected on chain {chain_id}: tx {} is no longer included", fmt_id(.tx_hash))]
    ReorgDetected { chain_id: u64, tx_hash: H256 },

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Insufficient {token} balance on {holder:?}: have {have}, need {need}")]
    InsufficientBalance {
        token: String,
        holder: Address,
        have: U256,
        need: U256,
    },

    #[error("Borrowed {borrowed} exceeds the collateral limit {limit}")]
    BorrowLimitExceeded { borrowed: U256, limit: U256 },

    #[error("Repay of {} emitted {count} release messages, expected exactly one", fmt_id(.message_id))]
    UnexpectedReleaseCount { message_id: H256, count: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Check if the condition may clear by waiting or resubmitting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::Transient { .. }
                | WorkflowError::Timeout { .. }
                | WorkflowError::ReorgDetected { .. }
                | WorkflowError::ChainConnection { .. }
                | WorkflowError::NotFound { .. }
        )
    }

    /// Stable label for metrics and machine-readable output
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::Configuration(_) => "configuration",
            WorkflowError::WrongNetwork { .. } => "wrong_network",
            WorkflowError::NotFound { .. } => "not_found",
            WorkflowError::Authorization { .. } => "authorization",
            WorkflowError::AlreadyBorrowed { .. } => "already_borrowed",
            WorkflowError::InvalidAmount { .. } => "invalid_amount",
            WorkflowError::BalanceMismatch { .. } => "balance_mismatch",
            WorkflowError::Transient { .. } => "transient",
            WorkflowError::Rejected { .. } => "rejected",
            WorkflowError::Timeout { .. } => "timeout",
            WorkflowError::ReorgDetected { .. } => "reorg",
            WorkflowError::ChainConnection { .. } => "chain_connection",
            WorkflowError::InsufficientBalance { .. } => "insufficient_balance",
            WorkflowError::BorrowLimitExceeded { .. } => "borrow_limit_exceeded",
            WorkflowError::UnexpectedReleaseCount { .. } => "unexpected_release_count",
            WorkflowError::Internal(_) => "internal",
        }
    }
}

/// Full 0x-prefixed hex for 32-byte identifiers (H256's Display elides the middle)
pub fn fmt_id(id: &H256) -> String {
    format!("0x{}", hex::encode(id.as_bytes()))
}

/// Result type for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;
