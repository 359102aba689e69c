//! In-memory chain hosting the vault, ledger and token contracts
//!
//! Every call runs against a scratch copy of the state that is committed only
//! if the call succeeds, so a revert never leaves partial effects. Reverts are
//! reported at submission, the way a node reports them during gas estimation.

use crate::bridge::{Bridge, BridgeReceiver, DeliveredMessage, Envelope, Payload};
use crate::chain::{ChainBackend, ChainCall, ChainQuery, QueryValue, Receipt};
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::ChainEvent;
use crate::lending::{CollateralPolicy, CrossChainMessage, MessageId};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use sha3::{Digest, Keccak256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

type Revert = String;

#[derive(Debug, Clone, Default)]
struct TokenState {
    symbol: String,
    /// Only this address may mint and burn
    minter: Option<Address>,
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    supply: U256,
}

#[derive(Debug, Clone)]
struct VaultState {
    owner: Address,
    fee_token: Address,
    releases: Vec<DeliveredMessage>,
}

#[derive(Debug, Clone)]
struct LedgerState {
    owner: Address,
    fee_token: Address,
    borrow_token: Address,
    messages: HashMap<MessageId, CrossChainMessage>,
    last_received: Option<MessageId>,
    deposits: HashMap<(Address, Address), U256>,
    borrowings: HashMap<(Address, Address), U256>,
    /// Amount drawn per message; one draw each
    draws: HashMap<MessageId, U256>,
    settled: HashSet<MessageId>,
}

#[derive(Debug, Clone, Default)]
struct ChainState {
    block: u64,
    auto_mine: bool,
    deploy_nonce: u64,
    tx_count: u64,
    native: HashMap<Address, U256>,
    tokens: HashMap<Address, TokenState>,
    vaults: HashMap<Address, VaultState>,
    ledgers: HashMap<Address, LedgerState>,
    receipts: HashMap<H256, Receipt>,
    fault: Option<String>,
}

/// One simulated chain, shared by every account acting on it
pub struct SimulatedChain {
    chain_id: u64,
    chain_selector: u64,
    bridge: Arc<dyn Bridge>,
    policy: CollateralPolicy,
    state: Mutex<ChainState>,
}

impl SimulatedChain {
    pub fn new(
        chain_id: u64,
        chain_selector: u64,
        bridge: Arc<dyn Bridge>,
        policy: CollateralPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            chain_selector,
            bridge,
            policy,
            state: Mutex::new(ChainState {
                block: 1,
                auto_mine: true,
                ..Default::default()
            }),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn chain_selector(&self) -> u64 {
        self.chain_selector
    }

    /// Backend acting as `signer`
    pub fn account(self: &Arc<Self>, signer: Address) -> Arc<SimulatedAccount> {
        Arc::new(SimulatedAccount {
            chain: self.clone(),
            signer,
        })
    }

    /// Install a plain ERC-20 at a fixed address (e.g. a configured fee token)
    pub fn create_token(&self, address: Address, symbol: &str) {
        self.lock().tokens.entry(address).or_insert_with(|| TokenState {
            symbol: symbol.to_string(),
            ..Default::default()
        });
    }

    /// Faucet: credit `amount` of `token` to `to`
    pub fn mint(&self, token: Address, to: Address, amount: U256) {
        let mut state = self.lock();
        let entry = state.tokens.entry(token).or_default();
        *entry.balances.entry(to).or_default() += amount;
        entry.supply += amount;
    }

    pub fn set_native_balance(&self, owner: Address, amount: U256) {
        self.lock().native.insert(owner, amount);
    }

    pub fn token_balance(&self, token: Address, owner: Address) -> U256 {
        token_balance(&self.lock(), token, owner)
    }

    /// Release messages a vault has received
    pub fn releases(&self, vault: Address) -> Vec<DeliveredMessage> {
        self.lock()
            .vaults
            .get(&vault)
            .map(|v| v.releases.clone())
            .unwrap_or_default()
    }

    /// With auto-mining on, each head poll produces one block
    pub fn set_auto_mine(&self, enabled: bool) {
        self.lock().auto_mine = enabled;
    }

    pub fn mine(&self, blocks: u64) {
        self.lock().block += blocks;
    }

    /// Make the next submission fail with a transient error
    pub fn fail_next_submission(&self, message: &str) {
        self.lock().fault = Some(message.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn submit_as(&self, signer: Address, call: &ChainCall) -> WorkflowResult<H256> {
        let mut state = self.lock();

        if let Some(message) = state.fault.take() {
            return Err(WorkflowError::Transient {
                chain_id: self.chain_id,
                message,
            });
        }

        let mut draft = state.clone();
        let mut contract_address = None;
        let events = self
            .execute(&mut draft, signer, call, &mut contract_address)
            .map_err(|reason| {
                debug!("{} reverted on chain {}: {}", call.name(), self.chain_id, reason);
                WorkflowError::Rejected {
                    chain_id: self.chain_id,
                    reason: format!("execution reverted: {}", reason),
                }
            })?;

        draft.tx_count += 1;
        draft.block += 1;
        let tx_hash = keccak_words(&[
            &self.chain_id.to_be_bytes()[..],
            signer.as_bytes(),
            &draft.tx_count.to_be_bytes()[..],
        ]);
        let receipt = Receipt {
            tx_hash,
            block_number: draft.block,
            succeeded: true,
            contract_address,
            events,
            revert_reason: None,
        };
        draft.receipts.insert(tx_hash, receipt);
        *state = draft;

        debug!("{} included on chain {} at block {}", call.name(), self.chain_id, state.block);
        Ok(tx_hash)
    }

    fn execute(
        &self,
        state: &mut ChainState,
        caller: Address,
        call: &ChainCall,
        contract_address: &mut Option<Address>,
    ) -> Result<Vec<ChainEvent>, Revert> {
        match call {
            ChainCall::DeployVault { fee_token, .. } => {
                let vault = next_address(state, self.chain_id, caller);
                state.vaults.insert(
                    vault,
                    VaultState {
                        owner: caller,
                        fee_token: *fee_token,
                        releases: Vec::new(),
                    },
                );
                *contract_address = Some(vault);
                Ok(vec![])
            }

            ChainCall::DeployLedger { fee_token, .. } => {
                let ledger = next_address(state, self.chain_id, caller);
                let borrow_token = next_address(state, self.chain_id, ledger);
                state.tokens.insert(
                    borrow_token,
                    TokenState {
                        symbol: "USDC".to_string(),
                        minter: Some(ledger),
                        ..Default::default()
                    },
                );
                state.ledgers.insert(
                    ledger,
                    LedgerState {
                        owner: caller,
                        fee_token: *fee_token,
                        borrow_token,
                        messages: HashMap::new(),
                        last_received: None,
                        deposits: HashMap::new(),
                        borrowings: HashMap::new(),
                        draws: HashMap::new(),
                        settled: HashSet::new(),
                    },
                );
                *contract_address = Some(ledger);
                Ok(vec![])
            }

            ChainCall::TokenTransfer { token, to, amount } => {
                move_tokens(state, *token, caller, *to, *amount)?;
                Ok(vec![])
            }

            ChainCall::TokenApprove {
                token,
                spender,
                amount,
            } => {
                let entry = state
                    .tokens
                    .get_mut(token)
                    .ok_or_else(|| "call to non-contract".to_string())?;
                entry.allowances.insert((caller, *spender), *amount);
                Ok(vec![])
            }

            ChainCall::SendDeposit {
                vault,
                destination_chain_selector,
                receiver,
                token,
                amount,
            } => {
                let (owner, fee_token) = state
                    .vaults
                    .get(vault)
                    .map(|v| (v.owner, v.fee_token))
                    .ok_or_else(|| "call to non-contract".to_string())?;
                if owner != caller {
                    return Err("OnlyOwner".to_string());
                }
                if token_balance(state, *token, *vault) < *amount {
                    return Err("NotEnoughBalance".to_string());
                }

                let envelope = Envelope {
                    source_chain_selector: self.chain_selector,
                    sender: *vault,
                    destination_chain_selector: *destination_chain_selector,
                    receiver: *receiver,
                    token_amount: Some((*token, *amount)),
                    payload: Payload::Deposit { depositor: caller },
                };
                // Collateral leaves the vault before the fee is charged from what remains
                move_tokens(state, *token, *vault, Address::zero(), *amount)?;
                let message_id = self.pay_and_submit(state, *vault, fee_token, envelope)?;

                Ok(vec![ChainEvent::MessageSent {
                    message_id,
                    destination_chain_selector: *destination_chain_selector,
                }])
            }

            ChainCall::Borrow { ledger, message_id } => {
                let entry = state
                    .ledgers
                    .get(ledger)
                    .ok_or_else(|| "call to non-contract".to_string())?;
                let message = entry
                    .messages
                    .get(message_id)
                    .cloned()
                    .ok_or_else(|| "MessageNotFound".to_string())?;
                if message.depositor != caller {
                    return Err("NotDepositor".to_string());
                }
                if entry.draws.contains_key(message_id) || entry.settled.contains(message_id) {
                    return Err("AlreadyBorrowed".to_string());
                }

                let borrow_token = entry.borrow_token;
                let amount = self.policy.max_borrow(message.amount);
                mint_tokens(state, borrow_token, *ledger, caller, amount)?;

                let entry = state
                    .ledgers
                    .get_mut(ledger)
                    .ok_or_else(|| "call to non-contract".to_string())?;
                *entry.borrowings.entry((caller, borrow_token)).or_default() += amount;
                entry.draws.insert(*message_id, amount);
                Ok(vec![])
            }

            ChainCall::RepayAndRelease {
                ledger,
                amount,
                destination_chain_selector,
                receiver,
                message_id,
            } => {
                let entry = state
                    .ledgers
                    .get(ledger)
                    .ok_or_else(|| "call to non-contract".to_string())?;
                let message = entry
                    .messages
                    .get(message_id)
                    .cloned()
                    .ok_or_else(|| "MessageNotFound".to_string())?;
                if message.depositor != caller {
                    return Err("NotDepositor".to_string());
                }
                let borrow_token = entry.borrow_token;
                let fee_token = entry.fee_token;
                let outstanding = entry
                    .borrowings
                    .get(&(caller, borrow_token))
                    .copied()
                    .unwrap_or_default();
                if outstanding.is_zero() {
                    return Err("NothingToRepay".to_string());
                }
                if *amount < outstanding {
                    return Err("InsufficientRepayment".to_string());
                }

                burn_from(state, borrow_token, *ledger, caller, *amount)?;

                let envelope = Envelope {
                    source_chain_selector: self.chain_selector,
                    sender: *ledger,
                    destination_chain_selector: *destination_chain_selector,
                    receiver: *receiver,
                    token_amount: None,
                    payload: Payload::Release {
                        original_message_id: *message_id,
                        depositor: caller,
                        repaid: true,
                    },
                };
                let release_id = self.pay_and_submit(state, *ledger, fee_token, envelope)?;

                let entry = state
                    .ledgers
                    .get_mut(ledger)
                    .ok_or_else(|| "call to non-contract".to_string())?;
                entry.borrowings.insert((caller, borrow_token), U256::zero());
                entry.settled.insert(*message_id);

                Ok(vec![ChainEvent::MessageSent {
                    message_id: release_id,
                    destination_chain_selector: *destination_chain_selector,
                }])
            }

            ChainCall::Withdraw { contract } => {
                let owner = contract_owner(state, *contract)?;
                if owner != caller {
                    return Err("OnlyOwner".to_string());
                }
                let amount = state.native.remove(contract).unwrap_or_default();
                *state.native.entry(owner).or_default() += amount;
                Ok(vec![])
            }

            ChainCall::WithdrawToken { contract, token } => {
                let owner = contract_owner(state, *contract)?;
                if owner != caller {
                    return Err("OnlyOwner".to_string());
                }
                let amount = token_balance(state, *token, *contract);
                if !amount.is_zero() {
                    move_tokens(state, *token, *contract, owner, amount)?;
                }
                Ok(vec![])
            }
        }
    }

    /// Charge the bridge fee from `payer`'s fee-token balance and hand the message over.
    /// Must be the last fallible step of a call.
    fn pay_and_submit(
        &self,
        state: &mut ChainState,
        payer: Address,
        fee_token: Address,
        envelope: Envelope,
    ) -> Result<MessageId, Revert> {
        let fee = self.bridge.fee(&envelope);
        if token_balance(state, fee_token, payer) < fee {
            return Err("NotEnoughFeeBalance".to_string());
        }
        move_tokens(state, fee_token, payer, Address::zero(), fee)?;
        self.bridge.submit(envelope).map_err(|e| e.to_string())
    }

    fn query(&self, query: &ChainQuery) -> WorkflowResult<QueryValue> {
        let state = self.lock();

        let value = match query {
            ChainQuery::TokenBalance { token, owner } => {
                QueryValue::Amount(token_balance(&state, *token, *owner))
            }
            ChainQuery::NativeBalance { owner } => {
                QueryValue::Amount(state.native.get(owner).copied().unwrap_or_default())
            }
            ChainQuery::TotalSupply { token } => QueryValue::Amount(
                state.tokens.get(token).map(|t| t.supply).unwrap_or_default(),
            ),
            ChainQuery::MessageDetail { ledger, message_id }
            | ChainQuery::ReceivedMessageDetails { ledger, message_id } => {
                let entry = ledger_at(&state, self.chain_id, *ledger)?;
                QueryValue::Message(entry.messages.get(message_id).cloned())
            }
            ChainQuery::VaultMessageDetail { vault, message_id } => {
                let entry = state.vaults.get(vault).ok_or_else(|| WorkflowError::Rejected {
                    chain_id: self.chain_id,
                    reason: "execution reverted: call to non-contract".to_string(),
                })?;
                QueryValue::Message(
                    entry
                        .releases
                        .iter()
                        .find(|m| m.message_id == *message_id)
                        .map(release_record),
                )
            }
            ChainQuery::LastReceived { ledger } => {
                let entry = ledger_at(&state, self.chain_id, *ledger)?;
                QueryValue::Message(
                    entry
                        .last_received
                        .and_then(|id| entry.messages.get(&id).cloned()),
                )
            }
            ChainQuery::DepositedBalance {
                ledger,
                depositor,
                token,
            } => QueryValue::Amount(
                ledger_at(&state, self.chain_id, *ledger)?
                    .deposits
                    .get(&(*depositor, *token))
                    .copied()
                    .unwrap_or_default(),
            ),
            ChainQuery::BorrowedBalance {
                ledger,
                depositor,
                token,
            } => QueryValue::Amount(
                ledger_at(&state, self.chain_id, *ledger)?
                    .borrowings
                    .get(&(*depositor, *token))
                    .copied()
                    .unwrap_or_default(),
            ),
            ChainQuery::BorrowToken { ledger } => {
                QueryValue::Address(ledger_at(&state, self.chain_id, *ledger)?.borrow_token)
            }
        };
        Ok(value)
    }
}

impl BridgeReceiver for SimulatedChain {
    fn receive(&self, message: DeliveredMessage) -> Result<(), String> {
        let mut state = self.lock();
        let mut draft = state.clone();

        match &message.payload {
            Payload::Deposit { depositor } => {
                let (token, amount) = message
                    .token_amount
                    .ok_or_else(|| "deposit without tokens".to_string())?;
                let ledger = draft
                    .ledgers
                    .get_mut(&message.receiver)
                    .ok_or_else(|| format!("{:?} is not a ledger", message.receiver))?;

                ledger.messages.insert(
                    message.message_id,
                    CrossChainMessage {
                        message_id: message.message_id,
                        source_chain_selector: message.source_chain_selector,
                        source_contract: message.sender,
                        depositor: *depositor,
                        token,
                        amount,
                    },
                );
                ledger.last_received = Some(message.message_id);
                *ledger.deposits.entry((*depositor, token)).or_default() += amount;

                // Bridged tokens arrive at the receiving contract
                let entry = draft.tokens.entry(token).or_default();
                *entry.balances.entry(message.receiver).or_default() += amount;
                entry.supply += amount;
            }
            Payload::Release { .. } => {
                let vault = draft
                    .vaults
                    .get_mut(&message.receiver)
                    .ok_or_else(|| format!("{:?} is not a vault", message.receiver))?;
                vault.releases.push(message.clone());
            }
        }

        draft.block += 1;
        *state = draft;
        info!(
            "Chain {} accepted bridge message from selector {}",
            self.chain_id, message.source_chain_selector
        );
        Ok(())
    }
}

/// [`ChainBackend`] for one signer on a [`SimulatedChain`]
pub struct SimulatedAccount {
    chain: Arc<SimulatedChain>,
    signer: Address,
}

#[async_trait]
impl ChainBackend for SimulatedAccount {
    fn chain_id(&self) -> u64 {
        self.chain.chain_id
    }

    fn signer(&self) -> Address {
        self.signer
    }

    async fn submit(&self, call: &ChainCall) -> WorkflowResult<H256> {
        self.chain.submit_as(self.signer, call)
    }

    async fn block_number(&self) -> WorkflowResult<u64> {
        let mut state = self.chain.lock();
        if state.auto_mine {
            state.block += 1;
        }
        Ok(state.block)
    }

    async fn receipt(&self, tx_hash: H256) -> WorkflowResult<Option<Receipt>> {
        Ok(self.chain.lock().receipts.get(&tx_hash).cloned())
    }

    async fn query(&self, query: &ChainQuery) -> WorkflowResult<QueryValue> {
        self.chain.query(query)
    }
}

fn keccak_words(words: &[&[u8]]) -> H256 {
    let mut hasher = Keccak256::new();
    for word in words {
        hasher.update(word);
    }
    H256::from_slice(&hasher.finalize())
}

/// keccak(chain id, deployer, nonce), truncated to 20 bytes
fn next_address(state: &mut ChainState, chain_id: u64, deployer: Address) -> Address {
    state.deploy_nonce += 1;
    let hash = keccak_words(&[
        &chain_id.to_be_bytes()[..],
        deployer.as_bytes(),
        &state.deploy_nonce.to_be_bytes()[..],
    ]);
    Address::from_slice(&hash.as_bytes()[12..])
}

fn ledger_at(state: &ChainState, chain_id: u64, address: Address) -> WorkflowResult<&LedgerState> {
    state
        .ledgers
        .get(&address)
        .ok_or_else(|| WorkflowError::Rejected {
            chain_id,
            reason: "execution reverted: call to non-contract".to_string(),
        })
}

/// Vault-side record of a release: who sent it and for whom, no tokens
fn release_record(message: &DeliveredMessage) -> CrossChainMessage {
    let depositor = match &message.payload {
        Payload::Release { depositor, .. } | Payload::Deposit { depositor } => *depositor,
    };
    CrossChainMessage {
        message_id: message.message_id,
        source_chain_selector: message.source_chain_selector,
        source_contract: message.sender,
        depositor,
        token: Address::zero(),
        amount: U256::zero(),
    }
}

fn token_balance(state: &ChainState, token: Address, owner: Address) -> U256 {
    state
        .tokens
        .get(&token)
        .and_then(|t| t.balances.get(&owner))
        .copied()
        .unwrap_or_default()
}

fn contract_owner(state: &ChainState, contract: Address) -> Result<Address, Revert> {
    state
        .vaults
        .get(&contract)
        .map(|v| v.owner)
        .or_else(|| state.ledgers.get(&contract).map(|l| l.owner))
        .ok_or_else(|| "call to non-contract".to_string())
}

/// Transfer; a zero recipient burns
fn move_tokens(
    state: &mut ChainState,
    token: Address,
    from: Address,
    to: Address,
    amount: U256,
) -> Result<(), Revert> {
    let entry = state
        .tokens
        .get_mut(&token)
        .ok_or_else(|| "call to non-contract".to_string())?;
    let balance = entry.balances.entry(from).or_default();
    if *balance < amount {
        return Err(format!("ERC20: transfer amount exceeds balance ({})", entry.symbol));
    }
    *balance -= amount;
    if to.is_zero() {
        entry.supply -= amount;
    } else {
        *entry.balances.entry(to).or_default() += amount;
    }
    Ok(())
}

fn mint_tokens(
    state: &mut ChainState,
    token: Address,
    minter: Address,
    to: Address,
    amount: U256,
) -> Result<(), Revert> {
    let entry = state
        .tokens
        .get_mut(&token)
        .ok_or_else(|| "call to non-contract".to_string())?;
    if entry.minter != Some(minter) {
        return Err("caller is not the minter".to_string());
    }
    *entry.balances.entry(to).or_default() += amount;
    entry.supply += amount;
    Ok(())
}

/// Burn `amount` from `owner` using `spender`'s allowance
fn burn_from(
    state: &mut ChainState,
    token: Address,
    spender: Address,
    owner: Address,
    amount: U256,
) -> Result<(), Revert> {
    let entry = state
        .tokens
        .get_mut(&token)
        .ok_or_else(|| "call to non-contract".to_string())?;
    let allowance = entry.allowances.entry((owner, spender)).or_default();
    if *allowance < amount {
        return Err("ERC20: insufficient allowance".to_string());
    }
    *allowance -= amount;
    move_tokens(state, token, owner, Address::zero(), amount)
}
