//! Chain module - one client per chain on top of a pluggable backend
//!
//! This module provides:
//! - The fixed call surface of the vault, ledger and token contracts ([`ChainCall`], [`ChainQuery`])
//! - The [`ChainBackend`] seam with an RPC implementation and an in-memory simulator
//! - [`ChainClient`], which serializes writes and gates them on finality

pub mod finality;
pub mod provider;
pub mod simulated;
pub mod token;

pub use finality::FinalityTracker;
pub use provider::EvmChain;
pub use simulated::SimulatedChain;
pub use token::Erc20;

use crate::config::FinalityConfig;
use crate::error::{fmt_id, WorkflowError, WorkflowResult};
use crate::events::ChainEvent;
use crate::lending::{CrossChainMessage, MessageId};
use crate::network::NetworkProfile;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Mutating calls against the vault, ledger and token contracts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCall {
    DeployVault {
        router: Address,
        fee_token: Address,
    },
    DeployLedger {
        router: Address,
        fee_token: Address,
    },
    TokenTransfer {
        token: Address,
        to: Address,
        amount: U256,
    },
    TokenApprove {
        token: Address,
        spender: Address,
        amount: U256,
    },
    SendDeposit {
        vault: Address,
        destination_chain_selector: u64,
        receiver: Address,
        token: Address,
        amount: U256,
    },
    Borrow {
        ledger: Address,
        message_id: MessageId,
    },
    RepayAndRelease {
        ledger: Address,
        amount: U256,
        destination_chain_selector: u64,
        receiver: Address,
        message_id: MessageId,
    },
    Withdraw {
        contract: Address,
    },
    WithdrawToken {
        contract: Address,
        token: Address,
    },
}

impl ChainCall {
    /// Short name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            ChainCall::DeployVault { .. } => "deploy_vault",
            ChainCall::DeployLedger { .. } => "deploy_ledger",
            ChainCall::TokenTransfer { .. } => "token_transfer",
            ChainCall::TokenApprove { .. } => "token_approve",
            ChainCall::SendDeposit { .. } => "send_deposit",
            ChainCall::Borrow { .. } => "borrow",
            ChainCall::RepayAndRelease { .. } => "repay_and_release",
            ChainCall::Withdraw { .. } => "withdraw",
            ChainCall::WithdrawToken { .. } => "withdraw_token",
        }
    }
}

/// Read-only calls; never wait for finality
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainQuery {
    TokenBalance {
        token: Address,
        owner: Address,
    },
    NativeBalance {
        owner: Address,
    },
    TotalSupply {
        token: Address,
    },
    MessageDetail {
        ledger: Address,
        message_id: MessageId,
    },
    ReceivedMessageDetails {
        ledger: Address,
        message_id: MessageId,
    },
    /// Release message as recorded by the source-side vault
    VaultMessageDetail {
        vault: Address,
        message_id: MessageId,
    },
    LastReceived {
        ledger: Address,
    },
    DepositedBalance {
        ledger: Address,
        depositor: Address,
        token: Address,
    },
    BorrowedBalance {
        ledger: Address,
        depositor: Address,
        token: Address,
    },
    BorrowToken {
        ledger: Address,
    },
}

/// Decoded answer to a [`ChainQuery`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Amount(U256),
    Address(Address),
    /// `None` when the contract has no record for the id
    Message(Option<CrossChainMessage>),
}

/// Receipt of an included transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub succeeded: bool,
    pub contract_address: Option<Address>,
    pub events: Vec<ChainEvent>,
    pub revert_reason: Option<String>,
}

impl Receipt {
    /// Ids of all bridge messages emitted by this transaction
    pub fn sent_message_ids(&self) -> Vec<MessageId> {
        self.events
            .iter()
            .filter_map(ChainEvent::sent_message_id)
            .collect()
    }
}

/// Raw access to one chain under one signing identity
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Chain id reported by the endpoint
    fn chain_id(&self) -> u64;

    /// Address every submission is signed by
    fn signer(&self) -> Address;

    /// Submit a mutating call; returns as soon as the transaction is accepted
    async fn submit(&self, call: &ChainCall) -> WorkflowResult<H256>;

    async fn block_number(&self) -> WorkflowResult<u64>;

    async fn receipt(&self, tx_hash: H256) -> WorkflowResult<Option<Receipt>>;

    async fn query(&self, query: &ChainQuery) -> WorkflowResult<QueryValue>;
}

/// Finality-gated access to one chain
pub struct ChainClient {
    profile: NetworkProfile,
    backend: Arc<dyn ChainBackend>,
    finality: FinalityTracker,
    /// Held from submission until finality
    write_lock: Mutex<()>,
    wait_budget: Duration,
}

impl ChainClient {
    /// Bind a backend to a network profile, checking that they agree on the chain
    pub fn connect(profile: NetworkProfile, backend: Arc<dyn ChainBackend>) -> WorkflowResult<Self> {
        let reported = backend.chain_id();
        if reported != profile.chain_id {
            return Err(WorkflowError::WrongNetwork {
                step: "connect".to_string(),
                expected: format!("{} (chain id {})", profile.name, profile.chain_id),
                actual: format!("chain id {}", reported),
            });
        }

        let defaults = FinalityConfig::default();
        let finality = FinalityTracker::new(
            profile.chain_id,
            profile.required_confirmations,
            backend.clone(),
            Duration::from_millis(defaults.poll_interval_ms),
        );

        info!(
            "Connected to {} (chain {}) as {:?}",
            profile.name,
            profile.chain_id,
            backend.signer()
        );

        Ok(Self {
            profile,
            backend,
            finality,
            write_lock: Mutex::new(()),
            wait_budget: Duration::from_secs(defaults.wait_budget_secs),
        })
    }

    /// Override the poll interval and the default finality budget
    pub fn with_finality(mut self, poll_interval: Duration, wait_budget: Duration) -> Self {
        self.finality = FinalityTracker::new(
            self.profile.chain_id,
            self.profile.required_confirmations,
            self.backend.clone(),
            poll_interval,
        );
        self.wait_budget = wait_budget;
        self
    }

    pub fn profile(&self) -> &NetworkProfile {
        &self.profile
    }

    pub fn network(&self) -> &str {
        &self.profile.name
    }

    pub fn chain_id(&self) -> u64 {
        self.profile.chain_id
    }

    pub fn signer(&self) -> Address {
        self.backend.signer()
    }

    /// Submit a call and wait for finality within the default budget
    pub async fn write(&self, call: ChainCall) -> WorkflowResult<Receipt> {
        self.write_within(call, self.wait_budget).await
    }

    /// Submit a call and wait for finality within `budget`
    pub async fn write_within(&self, call: ChainCall, budget: Duration) -> WorkflowResult<Receipt> {
        let _guard = self.write_lock.lock().await;
        let chain_id = self.chain_id();

        info!("Submitting {} on {}", call.name(), self.profile.name);
        let tx_hash = match self.backend.submit(&call).await {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                warn!("{} failed on {}: {}", call.name(), self.profile.name, e);
                crate::metrics::record_write_failure(chain_id, e.kind());
                return Err(e);
            }
        };
        crate::metrics::record_write(chain_id);
        debug!("{} submitted as {}", call.name(), fmt_id(&tx_hash));

        self.finality
            .wait(tx_hash, budget)
            .await
            .map_err(|e| {
                crate::metrics::record_write_failure(chain_id, e.kind());
                e
            })
    }

    /// Wait for an already submitted transaction
    pub async fn wait_for_finality(&self, tx_hash: H256, budget: Duration) -> WorkflowResult<Receipt> {
        self.finality.wait(tx_hash, budget).await
    }

    /// Pure query
    pub async fn read(&self, query: ChainQuery) -> WorkflowResult<QueryValue> {
        debug!("Reading {:?} on {}", query, self.profile.name);
        self.backend.query(&query).await
    }

    pub async fn read_amount(&self, query: ChainQuery) -> WorkflowResult<U256> {
        match self.read(query).await? {
            QueryValue::Amount(amount) => Ok(amount),
            other => Err(unexpected("amount", &other)),
        }
    }

    pub async fn read_address(&self, query: ChainQuery) -> WorkflowResult<Address> {
        match self.read(query).await? {
            QueryValue::Address(address) => Ok(address),
            other => Err(unexpected("address", &other)),
        }
    }

    pub async fn read_message(&self, query: ChainQuery) -> WorkflowResult<Option<CrossChainMessage>> {
        match self.read(query).await? {
            QueryValue::Message(message) => Ok(message),
            other => Err(unexpected("message", &other)),
        }
    }

    pub async fn native_balance(&self, owner: Address) -> WorkflowResult<U256> {
        self.read_amount(ChainQuery::NativeBalance { owner }).await
    }
}

fn unexpected(wanted: &str, got: &QueryValue) -> WorkflowError {
    WorkflowError::Internal(format!("Expected {} from query, got {:?}", wanted, got))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::profile;

    fn receipt(tx_hash: H256, block_number: u64) -> Receipt {
        Receipt {
            tx_hash,
            block_number,
            succeeded: true,
            contract_address: None,
            events: vec![],
            revert_reason: None,
        }
    }

    #[test]
    fn test_connect_rejects_chain_mismatch() {
        let mut backend = MockChainBackend::new();
        backend.expect_chain_id().return_const(5u64);
        backend.expect_submit().never();

        let result = ChainClient::connect(profile("alpha", 1, 11), Arc::new(backend));
        assert!(matches!(result, Err(WorkflowError::WrongNetwork { .. })));
    }

    #[tokio::test]
    async fn test_write_waits_for_required_depth() {
        let tx = H256::repeat_byte(1);
        let mut backend = MockChainBackend::new();
        backend.expect_chain_id().return_const(1u64);
        backend.expect_signer().return_const(Address::repeat_byte(9));
        backend.expect_submit().times(1).returning(move |_| Ok(tx));
        backend
            .expect_receipt()
            .returning(move |hash| Ok(Some(receipt(hash, 10))));

        // head advances one block per poll: 10, 11
        let mut head = 9u64;
        backend.expect_block_number().returning(move || {
            head += 1;
            Ok(head)
        });

        let client = ChainClient::connect(profile("alpha", 1, 11), Arc::new(backend))
            .unwrap()
            .with_finality(Duration::from_millis(1), Duration::from_secs(5));

        let call = ChainCall::Withdraw {
            contract: Address::repeat_byte(2),
        };
        let receipt = client.write(call).await.unwrap();
        assert_eq!(receipt.tx_hash, tx);
        assert_eq!(receipt.block_number, 10);
    }

    #[tokio::test]
    async fn test_submission_error_passes_through() {
        let mut backend = MockChainBackend::new();
        backend.expect_chain_id().return_const(1u64);
        backend.expect_signer().return_const(Address::zero());
        backend.expect_submit().returning(|_| {
            Err(WorkflowError::Rejected {
                chain_id: 1,
                reason: "execution reverted: NotDepositor".to_string(),
            })
        });
        backend.expect_receipt().never();

        let client = ChainClient::connect(profile("alpha", 1, 11), Arc::new(backend)).unwrap();
        let err = client
            .write(ChainCall::Withdraw {
                contract: Address::zero(),
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WorkflowError::Rejected {
                chain_id: 1,
                reason: "execution reverted: NotDepositor".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_typed_read_shape_mismatch() {
        let mut backend = MockChainBackend::new();
        backend.expect_chain_id().return_const(1u64);
        backend.expect_signer().return_const(Address::zero());
        backend
            .expect_query()
            .returning(|_| Ok(QueryValue::Address(Address::zero())));

        let client = ChainClient::connect(profile("alpha", 1, 11), Arc::new(backend)).unwrap();
        let err = client
            .read_amount(ChainQuery::TotalSupply {
                token: Address::zero(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Internal(_)));
    }
}
