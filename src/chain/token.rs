//! ERC-20 call surface on top of a [`ChainClient`]

use crate::chain::{ChainCall, ChainClient, ChainQuery, Receipt};
use crate::error::WorkflowResult;

use ethers::types::{Address, U256};
use std::sync::Arc;

/// Handle to one token contract
#[derive(Clone)]
pub struct Erc20 {
    client: Arc<ChainClient>,
    address: Address,
}

impl Erc20 {
    pub fn new(client: Arc<ChainClient>, address: Address) -> Self {
        Self { client, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn balance_of(&self, owner: Address) -> WorkflowResult<U256> {
        self.client
            .read_amount(ChainQuery::TokenBalance {
                token: self.address,
                owner,
            })
            .await
    }

    pub async fn total_supply(&self) -> WorkflowResult<U256> {
        self.client
            .read_amount(ChainQuery::TotalSupply {
                token: self.address,
            })
            .await
    }

    pub async fn transfer(&self, to: Address, amount: U256) -> WorkflowResult<Receipt> {
        self.client
            .write(ChainCall::TokenTransfer {
                token: self.address,
                to,
                amount,
            })
            .await
    }

    pub async fn approve(&self, spender: Address, amount: U256) -> WorkflowResult<Receipt> {
        self.client
            .write(ChainCall::TokenApprove {
                token: self.address,
                spender,
                amount,
            })
            .await
    }
}
