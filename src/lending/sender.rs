//! Source-side vault: holds collateral and fee tokens, emits deposit messages

use crate::chain::{ChainCall, ChainClient, ChainQuery, Erc20, Receipt};
use crate::error::{WorkflowError, WorkflowResult};
use crate::lending::{CrossChainMessage, MessageId};

use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use tracing::info;

pub struct CollateralSender {
    client: Arc<ChainClient>,
    address: Address,
}

impl CollateralSender {
    /// Deploy a new vault bound to `router`, paying bridge fees in `fee_token`
    pub async fn deploy(
        client: Arc<ChainClient>,
        router: Address,
        fee_token: Address,
    ) -> WorkflowResult<Self> {
        let receipt = client
            .write(ChainCall::DeployVault { router, fee_token })
            .await?;
        let address = receipt.contract_address.ok_or_else(|| {
            WorkflowError::Internal("Vault deployment receipt has no contract address".to_string())
        })?;

        info!("Vault deployed to {:?} on {}", address, client.network());
        Ok(Self { client, address })
    }

    pub fn attach(client: Arc<ChainClient>, address: Address) -> Self {
        Self { client, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Move `amount` of `token` from the signer into the vault.
    ///
    /// One finality-gated transfer. Funding with several tokens is several
    /// independent calls; re-read [`balances`](Self::balances) afterwards.
    pub async fn fund(&self, token: &Erc20, amount: U256) -> WorkflowResult<Receipt> {
        info!(
            "Funding vault {:?} with {} of token {:?}",
            self.address,
            amount,
            token.address()
        );
        token.transfer(self.address, amount).await
    }

    /// Vault balances of the bridge token and the fee token, read concurrently
    pub async fn balances(&self, bridge_token: Address, fee_token: Address) -> WorkflowResult<(U256, U256)> {
        let bridge = Erc20::new(self.client.clone(), bridge_token);
        let fee = Erc20::new(self.client.clone(), fee_token);
        futures::try_join!(bridge.balance_of(self.address), fee.balance_of(self.address))
    }

    /// Lock `amount` of `token` and send it with a deposit message.
    ///
    /// Returns the local transaction hash. The bridge message id is only
    /// observable on the destination once delivered.
    pub async fn send_deposit(
        &self,
        destination_chain_selector: u64,
        receiver: Address,
        token: Address,
        amount: U256,
    ) -> WorkflowResult<H256> {
        let fee_token = self.client.profile().fee_token;
        let (held, fee_held) = self.balances(token, fee_token).await?;

        if held < amount {
            return Err(WorkflowError::InsufficientBalance {
                token: format!("{:?}", token),
                holder: self.address,
                have: held,
                need: amount,
            });
        }
        // The bridge fee is unknown up front; the vault needs some fee token
        if fee_held.is_zero() {
            return Err(WorkflowError::InsufficientBalance {
                token: format!("{:?}", fee_token),
                holder: self.address,
                have: fee_held,
                need: U256::one(),
            });
        }

        let receipt = self
            .client
            .write(ChainCall::SendDeposit {
                vault: self.address,
                destination_chain_selector,
                receiver,
                token,
                amount,
            })
            .await?;

        info!(
            "Deposit of {} sent from vault {:?} toward selector {}",
            amount, self.address, destination_chain_selector
        );
        Ok(receipt.tx_hash)
    }

    /// Release message delivered to this vault, `None` until the bridge delivers it
    pub async fn find_message(&self, message_id: MessageId) -> WorkflowResult<Option<CrossChainMessage>> {
        self.client
            .read_message(ChainQuery::VaultMessageDetail {
                vault: self.address,
                message_id,
            })
            .await
    }

    /// Return native currency held by the vault to its owner
    pub async fn withdraw(&self) -> WorkflowResult<Receipt> {
        self.client
            .write(ChainCall::Withdraw {
                contract: self.address,
            })
            .await
    }

    /// Return the vault's whole balance of `token` to its owner
    pub async fn withdraw_token(&self, token: Address) -> WorkflowResult<Receipt> {
        self.client
            .write(ChainCall::WithdrawToken {
                contract: self.address,
                token,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainQuery, MockChainBackend, QueryValue};
    use crate::network::tests::profile;

    fn vault_holding(bridge: u64, fee: u64) -> CollateralSender {
        let fee_token = profile("source", 1, 11).fee_token;
        let mut backend = MockChainBackend::new();
        backend.expect_chain_id().return_const(1u64);
        backend.expect_signer().return_const(Address::repeat_byte(0xaa));
        backend.expect_submit().never();
        backend.expect_query().returning(move |query| match query {
            ChainQuery::TokenBalance { token, .. } if *token == fee_token => {
                Ok(QueryValue::Amount(U256::from(fee)))
            }
            ChainQuery::TokenBalance { .. } => Ok(QueryValue::Amount(U256::from(bridge))),
            other => panic!("unexpected query {:?}", other),
        });

        let client = ChainClient::connect(profile("source", 1, 11), Arc::new(backend)).unwrap();
        CollateralSender::attach(Arc::new(client), Address::repeat_byte(0x5e))
    }

    #[tokio::test]
    async fn test_deposit_needs_collateral_on_hand() {
        let vault = vault_holding(99, 500);
        let err = vault
            .send_deposit(2, Address::repeat_byte(0x1e), Address::repeat_byte(0xb1), U256::from(100))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WorkflowError::InsufficientBalance {
                token: format!("{:?}", Address::repeat_byte(0xb1)),
                holder: Address::repeat_byte(0x5e),
                have: U256::from(99),
                need: U256::from(100),
            }
        );
    }

    #[tokio::test]
    async fn test_deposit_needs_some_fee_token() {
        let vault = vault_holding(100, 0);
        let err = vault
            .send_deposit(2, Address::repeat_byte(0x1e), Address::repeat_byte(0xb1), U256::from(100))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InsufficientBalance { have, .. } if have.is_zero()));
    }
}
