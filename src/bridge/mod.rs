//! Cross-chain messaging capability
//!
//! The workflow only needs three things from a bridge: what a message costs,
//! handing a message over, and asking whether it has arrived. Delivery itself
//! is asynchronous and driven by the bridge, never by the coordinator.

pub mod mock;

pub use mock::MockBridge;

use crate::lending::MessageId;

use ethers::types::{Address, U256};
use serde::Serialize;
use thiserror::Error;

/// What the sending contract encodes into the message data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Collateral locked on the source chain for `depositor`
    Deposit { depositor: Address },
    /// A position opened by `original_message_id` was repaid
    Release {
        original_message_id: MessageId,
        depositor: Address,
        repaid: bool,
    },
}

/// A message as handed to the bridge on the source chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub source_chain_selector: u64,
    /// Contract that submitted the message
    pub sender: Address,
    pub destination_chain_selector: u64,
    pub receiver: Address,
    /// Token moved with the message, in source-chain terms
    pub token_amount: Option<(Address, U256)>,
    pub payload: Payload,
}

/// A message as handed to the receiving contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveredMessage {
    pub message_id: MessageId,
    pub source_chain_selector: u64,
    pub sender: Address,
    pub receiver: Address,
    /// Token moved with the message, in destination-chain terms
    pub token_amount: Option<(Address, U256)>,
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    /// Accepted, not yet delivered
    Pending,
    Delivered,
    /// Dropped at the destination; never retried
    Failed,
    Unknown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Token {token:?} has no route from chain selector {source_chain_selector}")]
    UnroutedToken {
        source_chain_selector: u64,
        token: Address,
    },

    #[error("No chain is registered for selector {0}")]
    UnknownDestination(u64),
}

/// Abstract messaging bridge
pub trait Bridge: Send + Sync {
    /// Fee charged in the source chain's fee token
    fn fee(&self, envelope: &Envelope) -> U256;

    /// Accept a message; the returned id is what the destination records
    fn submit(&self, envelope: Envelope) -> Result<MessageId, BridgeError>;

    fn status(&self, message_id: &MessageId) -> BridgeStatus;
}

/// A contract-hosting chain the bridge can deliver into
pub trait BridgeReceiver: Send + Sync {
    /// Hand a message to `message.receiver`; an error drops the message
    fn receive(&self, message: DeliveredMessage) -> Result<(), String>;
}
