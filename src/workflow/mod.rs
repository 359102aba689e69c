//! Workflow module - step sequencing across the source and destination chains

pub mod orchestrator;
pub mod preconditions;
pub mod report;
pub mod simulate;

pub use orchestrator::{WorkflowOrchestrator, WorkflowParams};
pub use preconditions::ChainRole;
pub use report::{
    BalanceReport, BorrowReport, DeliveredState, ReadBorrowedReport, RepayReport,
    SetupProtocolReport, SetupSenderReport, StepReport, SupplyReport, TransferReport,
    WithdrawReport,
};
pub use simulate::{SimulatedWorkflow, SimulationReport, SIMULATED_OPERATOR};

/// Operator-invoked workflow steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SetupSender,
    SetupProtocol,
    Transfer,
    AwaitDelivery,
    ReadRelease,
    ReadBorrowed,
    Borrow,
    Repay,
    Withdraw,
    TokenSupply,
    BalanceOf,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::SetupSender => "setup-sender",
            Step::SetupProtocol => "setup-protocol",
            Step::Transfer => "transfer",
            Step::AwaitDelivery => "await-delivery",
            Step::ReadRelease => "read-release",
            Step::ReadBorrowed => "read-borrowed",
            Step::Borrow => "borrow",
            Step::Repay => "repay",
            Step::Withdraw => "withdraw",
            Step::TokenSupply => "token-supply",
            Step::BalanceOf => "balance-of",
        }
    }
}
