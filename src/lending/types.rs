//! Ledger-side records shared by the sender, the coordinator and the reports

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// Bridge-assigned message identifier
pub type MessageId = H256;

/// A deposit message as recorded by the destination ledger on delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossChainMessage {
    pub message_id: MessageId,
    pub source_chain_selector: u64,
    pub source_contract: Address,
    pub depositor: Address,
    pub token: Address,
    pub amount: U256,
}

/// Credited collateral for a (depositor, token) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollateralPosition {
    pub depositor: Address,
    pub token: Address,
    pub amount: U256,
}

/// Outstanding borrow for a (depositor, borrow token) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BorrowPosition {
    pub depositor: Address,
    pub borrow_token: Address,
    pub amount: U256,
}

impl BorrowPosition {
    pub fn is_open(&self) -> bool {
        !self.amount.is_zero()
    }
}

/// Whether a message has reached the destination ledger yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Delivery<T> {
    Pending,
    Delivered(T),
}

impl<T> Delivery<T> {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered(_))
    }
}
