//! Lending module - the two contract-facing halves of the workflow
//!
//! - [`CollateralSender`] drives the source-side vault
//! - [`LendingCoordinator`] drives the destination-side ledger

pub mod coordinator;
pub mod policy;
pub mod sender;
pub mod types;

pub use coordinator::{BorrowOutcome, LendingCoordinator, ReleaseOutcome};
pub use policy::CollateralPolicy;
pub use sender::CollateralSender;
pub use types::{BorrowPosition, CollateralPosition, CrossChainMessage, Delivery, MessageId};
