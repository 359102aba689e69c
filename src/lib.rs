//! xchain-lending - workflow coordinator for bridge-collateralized lending
//!
//! Collateral is locked in a vault on a source chain and sent over a
//! cross-chain messaging bridge to a lending ledger on a destination chain,
//! where the depositor can borrow against it and later repay to release it.

pub mod bridge;
pub mod chain;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod lending;
pub mod metrics;
pub mod network;
pub mod workflow;

pub use error::{WorkflowError, WorkflowResult};
