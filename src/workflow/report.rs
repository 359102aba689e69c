//! Step results, printable as text or JSON

use crate::error::fmt_id;
use crate::lending::{CrossChainMessage, Delivery, ReleaseOutcome};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::Serialize;
use std::fmt;

/// Envelope shared by every step
#[derive(Debug, Clone, Serialize)]
pub struct StepReport<T> {
    pub step: &'static str,
    pub network: String,
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> StepReport<T> {
    pub fn new(step: &'static str, network: &str, body: T) -> Self {
        Self {
            step,
            network: network.to_string(),
            generated_at: Utc::now(),
            body,
        }
    }
}

impl<T: fmt::Display> fmt::Display for StepReport<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {} on {}", self.generated_at.to_rfc3339(), self.step, self.network)?;
        write!(f, "{}", self.body)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupSenderReport {
    pub vault: Address,
    pub bridge_token: Address,
    pub bridge_balance: U256,
    pub fee_token: Address,
    pub fee_balance: U256,
}

impl fmt::Display for SetupSenderReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Vault deployed at     : {:?}", self.vault)?;
        writeln!(f, "  Bridge token balance  : {} ({:?})", self.bridge_balance, self.bridge_token)?;
        write!(f, "  Fee token balance     : {} ({:?})", self.fee_balance, self.fee_token)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupProtocolReport {
    pub ledger: Address,
    pub fee_token: Address,
    pub fee_balance: U256,
    pub borrow_token: Address,
}

impl fmt::Display for SetupProtocolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Ledger deployed at    : {:?}", self.ledger)?;
        writeln!(f, "  Fee token balance     : {} ({:?})", self.fee_balance, self.fee_token)?;
        write!(f, "  Borrow token deployed : {:?}", self.borrow_token)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub vault: Address,
    pub ledger: Address,
    pub destination: String,
    pub destination_chain_selector: u64,
    pub token: Address,
    pub amount: U256,
    pub tx_hash: H256,
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Sent {} of {:?} from {:?}", self.amount, self.token, self.vault)?;
        writeln!(
            f,
            "  To ledger {:?} on {} (selector {})",
            self.ledger, self.destination, self.destination_chain_selector
        )?;
        writeln!(f, "  Tx hash: {}", fmt_id(&self.tx_hash))?;
        write!(
            f,
            "  The message id becomes visible on {} once the bridge delivers; poll with await-delivery.",
            self.destination
        )
    }
}

/// Ledger state once a deposit message has arrived
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveredState {
    pub message: CrossChainMessage,
    pub collateral: U256,
    pub borrow_token: Address,
    pub borrowed: U256,
}

impl fmt::Display for Delivery<DeliveredState> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Pending => write!(f, "  Not delivered yet; try again later."),
            Delivery::Delivered(state) => {
                write_message(f, &state.message)?;
                writeln!(f, "  Deposited amount      : {}", state.collateral)?;
                write!(f, "  Borrowing             : {}", state.borrowed)
            }
        }
    }
}

/// Release message as seen by the source vault
impl fmt::Display for Delivery<CrossChainMessage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Pending => write!(f, "  Release not delivered yet; try again later."),
            Delivery::Delivered(message) => {
                writeln!(f, "  Release message id    : {}", fmt_id(&message.message_id))?;
                writeln!(f, "  Source chain selector : {}", message.source_chain_selector)?;
                writeln!(f, "  Sender contract       : {:?}", message.source_contract)?;
                write!(f, "  Depositor             : {:?}", message.depositor)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadBorrowedReport {
    pub ledger: Address,
    pub caller: Address,
    pub last_message: Option<CrossChainMessage>,
    pub collateral: U256,
    pub borrowed: U256,
}

impl fmt::Display for ReadBorrowedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.last_message {
            Some(message) => write_message(f, message)?,
            None => writeln!(f, "  No message received yet")?,
        }
        writeln!(f, "  Depositor             : {:?}", self.caller)?;
        writeln!(f, "  Deposited amount      : {}", self.collateral)?;
        write!(f, "  Borrowing             : {}", self.borrowed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BorrowReport {
    pub message_id: H256,
    pub borrow_token: Address,
    pub starting_borrowed: U256,
    pub borrowed: U256,
    pub limit: U256,
    pub borrower_balance: U256,
    pub total_supply: U256,
    pub tx_hash: H256,
}

impl fmt::Display for BorrowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Borrow tx             : {}", fmt_id(&self.tx_hash))?;
        writeln!(f, "  Borrowing recorded    : {} (limit {})", self.borrowed, self.limit)?;
        writeln!(f, "  Starting borrowing    : {}", self.starting_borrowed)?;
        writeln!(f, "  Borrower balance      : {}", self.borrower_balance)?;
        write!(f, "  Borrow token supply   : {}", self.total_supply)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RepayReport {
    NothingToRepay {
        borrower: Address,
    },
    Repaid {
        release: ReleaseOutcome,
        borrower_balance: U256,
        total_supply: U256,
    },
}

impl fmt::Display for RepayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepayReport::NothingToRepay { borrower } => write!(
                f,
                "  Borrower {:?} has no outstanding borrowings. Nothing to repay.",
                borrower
            ),
            RepayReport::Repaid {
                release,
                borrower_balance,
                total_supply,
            } => {
                writeln!(f, "  Repaid                : {}", release.repaid)?;
                writeln!(f, "  Release message id    : {}", fmt_id(&release.release_message_id))?;
                writeln!(f, "  Borrower balance now  : {}", borrower_balance)?;
                write!(f, "  Borrow token supply   : {}", total_supply)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawReport {
    pub contract: Address,
    pub bridge_balance: U256,
    pub fee_balance: U256,
    pub native_balance: U256,
    pub native_currency_symbol: String,
}

impl fmt::Display for WithdrawReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Contract              : {:?}", self.contract)?;
        writeln!(f, "  Fee token balance     : {}", self.fee_balance)?;
        writeln!(f, "  Bridge token balance  : {}", self.bridge_balance)?;
        write!(
            f,
            "  Native balance        : {} {}",
            self.native_balance, self.native_currency_symbol
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SupplyReport {
    pub token: Address,
    pub total_supply: U256,
}

impl fmt::Display for SupplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  Token {:?} supply is {}", self.token, self.total_supply)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceReport {
    pub account: Address,
    pub token: Address,
    pub balance: U256,
}

impl fmt::Display for BalanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  Balance of {:?}: {} ({:?})", self.account, self.balance, self.token)
    }
}

fn write_message(f: &mut fmt::Formatter<'_>, message: &CrossChainMessage) -> fmt::Result {
    writeln!(f, "  Message id            : {}", fmt_id(&message.message_id))?;
    writeln!(f, "  Source chain selector : {}", message.source_chain_selector)?;
    writeln!(f, "  Sender contract       : {:?}", message.source_contract)?;
    writeln!(f, "  Depositor             : {:?}", message.depositor)?;
    writeln!(f, "  Token                 : {:?}", message.token)?;
    writeln!(f, "  Amount                : {}", message.amount)
}
