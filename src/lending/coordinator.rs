//! Destination-side ledger: credited collateral, borrows and repay-and-release
//!
//! Every fund-moving operation re-reads the ledger immediately before acting.
//! Nothing computed earlier in a session is trusted, since the ledger keeps
//! changing underneath us as the bridge delivers.

use crate::chain::{ChainCall, ChainClient, ChainQuery, Erc20};
use crate::error::{WorkflowError, WorkflowResult};
use crate::lending::{CollateralPolicy, CrossChainMessage, MessageId};

use ethers::types::{Address, H256, U256};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Revert reason the ledger gives for a message that was already drawn
const LEDGER_ALREADY_BORROWED: &str = "AlreadyBorrowed";

/// Result of a successful draw
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BorrowOutcome {
    pub message: CrossChainMessage,
    pub borrow_token: Address,
    pub borrowed: U256,
    pub limit: U256,
    pub tx_hash: H256,
}

/// Result of a successful repay-and-release
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseOutcome {
    pub original_message_id: MessageId,
    pub release_message_id: MessageId,
    pub repaid: U256,
    pub tx_hash: H256,
}

pub struct LendingCoordinator {
    client: Arc<ChainClient>,
    address: Address,
    policy: CollateralPolicy,
}

impl LendingCoordinator {
    /// Deploy a new ledger bound to `router`, paying bridge fees in `fee_token`
    pub async fn deploy(
        client: Arc<ChainClient>,
        router: Address,
        fee_token: Address,
        policy: CollateralPolicy,
    ) -> WorkflowResult<Self> {
        let receipt = client
            .write(ChainCall::DeployLedger { router, fee_token })
            .await?;
        let address = receipt.contract_address.ok_or_else(|| {
            WorkflowError::Internal("Ledger deployment receipt has no contract address".to_string())
        })?;

        info!("Ledger deployed to {:?} on {}", address, client.network());
        Ok(Self::attach(client, address, policy))
    }

    pub fn attach(client: Arc<ChainClient>, address: Address, policy: CollateralPolicy) -> Self {
        Self {
            client,
            address,
            policy,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn policy(&self) -> &CollateralPolicy {
        &self.policy
    }

    /// Delivered message by id, `None` while the bridge has not delivered it
    pub async fn find_message(&self, message_id: MessageId) -> WorkflowResult<Option<CrossChainMessage>> {
        self.client
            .read_message(ChainQuery::MessageDetail {
                ledger: self.address,
                message_id,
            })
            .await
    }

    pub async fn read_message(&self, message_id: MessageId) -> WorkflowResult<CrossChainMessage> {
        self.find_message(message_id)
            .await?
            .ok_or(WorkflowError::NotFound { message_id })
    }

    /// Most recently delivered message.
    ///
    /// Single slot: with more than one active depositor this may not be the
    /// caller's message. Prefer [`read_message`](Self::read_message).
    pub async fn read_last_received(&self) -> WorkflowResult<Option<CrossChainMessage>> {
        self.client
            .read_message(ChainQuery::LastReceived {
                ledger: self.address,
            })
            .await
    }

    pub async fn received_message_details(&self, message_id: MessageId) -> WorkflowResult<CrossChainMessage> {
        self.client
            .read_message(ChainQuery::ReceivedMessageDetails {
                ledger: self.address,
                message_id,
            })
            .await?
            .ok_or(WorkflowError::NotFound { message_id })
    }

    pub async fn deposited_balance(&self, depositor: Address, token: Address) -> WorkflowResult<U256> {
        self.client
            .read_amount(ChainQuery::DepositedBalance {
                ledger: self.address,
                depositor,
                token,
            })
            .await
    }

    pub async fn borrowed_balance(&self, depositor: Address, token: Address) -> WorkflowResult<U256> {
        self.client
            .read_amount(ChainQuery::BorrowedBalance {
                ledger: self.address,
                depositor,
                token,
            })
            .await
    }

    pub async fn borrow_token(&self) -> WorkflowResult<Address> {
        self.client
            .read_address(ChainQuery::BorrowToken {
                ledger: self.address,
            })
            .await
    }

    /// Draw against the collateral credited by `message_id`. One draw per message.
    pub async fn borrow(&self, message_id: MessageId) -> WorkflowResult<BorrowOutcome> {
        let caller = self.client.signer();
        let message = self.read_message(message_id).await?;

        if message.depositor != caller {
            return Err(WorkflowError::Authorization {
                caller,
                depositor: message.depositor,
            });
        }

        let borrow_token = self.borrow_token().await?;
        let outstanding = self.borrowed_balance(caller, borrow_token).await?;
        if !outstanding.is_zero() {
            return Err(WorkflowError::AlreadyBorrowed {
                message_id,
                outstanding,
            });
        }

        // A repaid message leaves no outstanding balance; the ledger still refuses a second draw
        let receipt = self
            .client
            .write(ChainCall::Borrow {
                ledger: self.address,
                message_id,
            })
            .await
            .map_err(|e| match e {
                WorkflowError::Rejected { ref reason, .. } if reason.contains(LEDGER_ALREADY_BORROWED) => {
                    WorkflowError::AlreadyBorrowed {
                        message_id,
                        outstanding,
                    }
                }
                other => other,
            })?;

        let borrowed = self.borrowed_balance(caller, borrow_token).await?;
        let limit = self.policy.max_borrow(message.amount);
        if borrowed > limit {
            warn!("Ledger issued {} against a limit of {}", borrowed, limit);
            return Err(WorkflowError::BorrowLimitExceeded { borrowed, limit });
        }

        info!("Borrowed {} against message {:?}", borrowed, message_id);
        Ok(BorrowOutcome {
            message,
            borrow_token,
            borrowed,
            limit,
            tx_hash: receipt.tx_hash,
        })
    }

    /// Repay the full outstanding borrow and send one release message to
    /// `receiver` on `destination_chain_selector`
    pub async fn repay_and_release(
        &self,
        amount: U256,
        destination_chain_selector: u64,
        receiver: Address,
        message_id: MessageId,
    ) -> WorkflowResult<ReleaseOutcome> {
        let caller = self.client.signer();
        let message = self.read_message(message_id).await?;

        if message.depositor != caller {
            return Err(WorkflowError::Authorization {
                caller,
                depositor: message.depositor,
            });
        }

        let borrow_token = self.borrow_token().await?;
        let outstanding = self.borrowed_balance(caller, borrow_token).await?;
        if amount != outstanding || outstanding.is_zero() {
            return Err(WorkflowError::InvalidAmount {
                requested: amount,
                outstanding,
            });
        }

        info!("Approving ledger {:?} to burn {}", self.address, amount);
        Erc20::new(self.client.clone(), borrow_token)
            .approve(self.address, amount)
            .await?;

        let receipt = self
            .client
            .write(ChainCall::RepayAndRelease {
                ledger: self.address,
                amount,
                destination_chain_selector,
                receiver,
                message_id,
            })
            .await?;

        let releases = receipt.sent_message_ids();
        let release_message_id = match releases.as_slice() {
            [single] => *single,
            _ => {
                return Err(WorkflowError::UnexpectedReleaseCount {
                    message_id,
                    count: releases.len(),
                })
            }
        };

        let remaining = self.borrowed_balance(caller, borrow_token).await?;
        if !remaining.is_zero() {
            return Err(WorkflowError::Internal(format!(
                "Borrow position still {} after repaying {}",
                remaining, amount
            )));
        }

        info!(
            "Repaid {}; release message {:?} sent toward selector {}",
            amount, release_message_id, destination_chain_selector
        );
        Ok(ReleaseOutcome {
            original_message_id: message_id,
            release_message_id,
            repaid: amount,
            tx_hash: receipt.tx_hash,
        })
    }

    pub async fn withdraw(&self) -> WorkflowResult<()> {
        self.client
            .write(ChainCall::Withdraw {
                contract: self.address,
            })
            .await
            .map(|_| ())
    }

    pub async fn withdraw_token(&self, token: Address) -> WorkflowResult<()> {
        self.client
            .write(ChainCall::WithdrawToken {
                contract: self.address,
                token,
            })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainBackend, QueryValue};
    use crate::network::tests::profile;

    const LEDGER: u64 = 0x1ed9;

    fn message(depositor: Address) -> CrossChainMessage {
        CrossChainMessage {
            message_id: H256::repeat_byte(0x11),
            source_chain_selector: 14767482510784806043,
            source_contract: Address::repeat_byte(0x5e),
            depositor,
            token: Address::repeat_byte(0xb1),
            amount: U256::from(100_000_000_000_000u64),
        }
    }

    /// Backend whose ledger answers reads from fixed values and refuses writes
    fn read_only_backend(signer: Address, depositor: Address, outstanding: U256) -> MockChainBackend {
        let mut backend = ledger_backend(signer, depositor, outstanding);
        backend.expect_submit().never();
        backend
    }

    /// Backend whose ledger answers reads from fixed values
    fn ledger_backend(signer: Address, depositor: Address, outstanding: U256) -> MockChainBackend {
        let mut backend = MockChainBackend::new();
        backend.expect_chain_id().return_const(1u64);
        backend.expect_signer().return_const(signer);
        backend.expect_query().returning(move |query| {
            Ok(match query {
                ChainQuery::MessageDetail { .. } => QueryValue::Message(Some(message(depositor))),
                ChainQuery::BorrowToken { .. } => QueryValue::Address(Address::repeat_byte(0xc0)),
                ChainQuery::BorrowedBalance { .. } => QueryValue::Amount(outstanding),
                other => panic!("unexpected query {:?}", other),
            })
        });
        backend
    }

    fn coordinator(backend: MockChainBackend) -> LendingCoordinator {
        let client = ChainClient::connect(profile("dest", 1, 11), Arc::new(backend)).unwrap();
        LendingCoordinator::attach(
            Arc::new(client),
            Address::from_low_u64_be(LEDGER),
            CollateralPolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_borrow_by_other_identity_is_unauthorized() {
        let depositor = Address::repeat_byte(0xaa);
        let intruder = Address::repeat_byte(0xbb);
        let ledger = coordinator(read_only_backend(intruder, depositor, U256::zero()));

        let err = ledger.borrow(H256::repeat_byte(0x11)).await.unwrap_err();
        assert_eq!(
            err,
            WorkflowError::Authorization {
                caller: intruder,
                depositor,
            }
        );
    }

    #[tokio::test]
    async fn test_second_draw_is_rejected_before_submitting() {
        let depositor = Address::repeat_byte(0xaa);
        let ledger = coordinator(read_only_backend(depositor, depositor, U256::from(7)));

        let err = ledger.borrow(H256::repeat_byte(0x11)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyBorrowed { outstanding, .. } if outstanding == U256::from(7)));
    }

    #[tokio::test]
    async fn test_ledger_refusal_of_a_repaid_message_is_already_borrowed() {
        let depositor = Address::repeat_byte(0xaa);
        let mut backend = ledger_backend(depositor, depositor, U256::zero());
        backend.expect_submit().times(1).returning(|_| {
            Err(WorkflowError::Rejected {
                chain_id: 1,
                reason: "execution reverted: AlreadyBorrowed".to_string(),
            })
        });

        let ledger = coordinator(backend);
        let id = H256::repeat_byte(0x11);
        assert_eq!(
            ledger.borrow(id).await.unwrap_err(),
            WorkflowError::AlreadyBorrowed {
                message_id: id,
                outstanding: U256::zero(),
            }
        );
    }

    #[tokio::test]
    async fn test_partial_repay_is_invalid_amount() {
        let depositor = Address::repeat_byte(0xaa);
        let ledger = coordinator(read_only_backend(depositor, depositor, U256::from(140)));

        let err = ledger
            .repay_and_release(U256::from(139), 14767482510784806043, Address::zero(), H256::repeat_byte(0x11))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WorkflowError::InvalidAmount {
                requested: U256::from(139),
                outstanding: U256::from(140),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_message_is_not_found() {
        let mut backend = MockChainBackend::new();
        backend.expect_chain_id().return_const(1u64);
        backend.expect_signer().return_const(Address::zero());
        backend.expect_submit().never();
        backend
            .expect_query()
            .returning(|_| Ok(QueryValue::Message(None)));

        let ledger = coordinator(backend);
        let id = H256::repeat_byte(0x42);
        assert_eq!(ledger.find_message(id).await.unwrap(), None);
        assert_eq!(
            ledger.borrow(id).await.unwrap_err(),
            WorkflowError::NotFound { message_id: id }
        );
    }
}
