//! JSON-RPC backend with multi-RPC failover and a local signing wallet

use crate::chain::{ChainBackend, ChainCall, ChainQuery, QueryValue, Receipt};
use crate::config::ArtifactsConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::EventParser;
use crate::lending::{CrossChainMessage, MessageId};
use crate::network::NetworkProfile;

use async_trait::async_trait;
use ethers::abi::{Abi, Detokenize, Token};
use ethers::prelude::*;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

abigen!(
    Erc20Token,
    r#"[
        function transfer(address to, uint256 amount) external returns (bool)
        function approve(address spender, uint256 amount) external returns (bool)
        function balanceOf(address owner) external view returns (uint256)
        function totalSupply() external view returns (uint256)
    ]"#
);

abigen!(
    CollateralVault,
    r#"[
        function messageDetail(bytes32 messageId) external view returns (uint64, address, address, address, uint256)
        function sendMessage(uint64 destinationChainSelector, address receiver, address tokenToTransfer, uint256 transferAmount) external returns (bytes32)
        function withdraw() external
        function withdrawToken(address token) external
    ]"#
);

abigen!(
    LendingLedger,
    r#"[
        function messageDetail(bytes32 messageId) external view returns (uint64, address, address, address, uint256)
        function getLastReceivedMessageDetails() external view returns (bytes32, uint64, address, address, address, uint256)
        function getReceivedMessageDetails(bytes32 messageId) external view returns (uint64, address, address, address, uint256)
        function deposits(address depositor, address token) external view returns (uint256)
        function borrowings(address depositor, address token) external view returns (uint256)
        function usdcToken() external view returns (address)
        function borrowUSDC(bytes32 msgId) external returns (uint256)
        function repayAndSendMessage(uint256 amount, uint64 destinationChain, address receiver, bytes32 msgId) external
        function withdraw() external
        function withdrawToken(address token) external
    ]"#
);

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Real chain reached over HTTP JSON-RPC
pub struct EvmChain {
    /// Chain id reported by the endpoint
    chain_id: u64,
    signer: Address,
    clients: Vec<Arc<SignerClient>>,
    current: AtomicUsize,
    artifacts: ArtifactsConfig,
}

impl EvmChain {
    /// Build signing clients for every configured RPC URL and ask the first
    /// reachable one which chain it serves
    pub async fn connect(
        profile: &NetworkProfile,
        private_key: &str,
        artifacts: ArtifactsConfig,
    ) -> WorkflowResult<Self> {
        let wallet = private_key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| WorkflowError::Configuration(format!("Invalid private key: {}", e)))?
            .with_chain_id(profile.chain_id);

        let mut clients = Vec::new();
        for url in &profile.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    clients.push(Arc::new(SignerMiddleware::new(provider, wallet.clone())));
                    debug!("Added HTTP provider for {}: {}", profile.name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if clients.is_empty() {
            return Err(WorkflowError::ChainConnection {
                chain_id: profile.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let mut chain = Self {
            chain_id: profile.chain_id,
            signer: wallet.address(),
            clients,
            current: AtomicUsize::new(0),
            artifacts,
        };
        chain.chain_id = chain.reported_chain_id().await?;
        Ok(chain)
    }

    /// Get the active client
    fn client(&self) -> Arc<SignerClient> {
        let idx = self.current.load(Ordering::Relaxed);
        self.clients[idx % self.clients.len()].clone()
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.clients.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    async fn reported_chain_id(&self) -> WorkflowResult<u64> {
        for _ in 0..self.clients.len() {
            match self.client().get_chainid().await {
                Ok(id) => return Ok(id.as_u64()),
                Err(e) => {
                    warn!("Failed to get chain id from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }
        Err(self.all_failed())
    }

    fn all_failed(&self) -> WorkflowError {
        WorkflowError::ChainConnection {
            chain_id: self.chain_id,
            message: "All providers failed".to_string(),
        }
    }

    async fn send<D: Detokenize>(&self, call: ContractCall<SignerClient, D>) -> WorkflowResult<H256> {
        let pending = call.send().await.map_err(|e| self.contract_error(e))?;
        Ok(pending.tx_hash())
    }

    async fn call<D: Detokenize>(&self, call: ContractCall<SignerClient, D>) -> WorkflowResult<D> {
        call.call().await.map_err(|e| self.contract_error(e))
    }

    fn contract_error(&self, e: ContractError<SignerClient>) -> WorkflowError {
        if e.is_revert() {
            WorkflowError::Rejected {
                chain_id: self.chain_id,
                reason: e.to_string(),
            }
        } else {
            classify_submission_error(self.chain_id, &e.to_string())
        }
    }

    async fn deploy(
        &self,
        artifact: Option<&Path>,
        what: &str,
        router: Address,
        fee_token: Address,
    ) -> WorkflowResult<H256> {
        let path = artifact.ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "No compiled {} artifact configured under [artifacts]",
                what
            ))
        })?;
        let (abi, bytecode) = load_artifact(path)?;

        let data = match abi.constructor() {
            Some(constructor) => constructor
                .encode_input(bytecode, &[Token::Address(router), Token::Address(fee_token)])
                .map_err(|e| {
                    WorkflowError::Configuration(format!("Cannot encode {} constructor: {}", what, e))
                })?,
            None => {
                return Err(WorkflowError::Configuration(format!(
                    "{} artifact has no constructor taking (router, feeToken)",
                    what
                )))
            }
        };

        let tx = TransactionRequest::new().from(self.signer).data(data);
        let client = self.client();
        let pending = client
            .send_transaction(tx, None)
            .await
            .map_err(|e| classify_submission_error(self.chain_id, &e.to_string()))?;
        Ok(pending.tx_hash())
    }
}

#[async_trait]
impl ChainBackend for EvmChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn signer(&self) -> Address {
        self.signer
    }

    async fn submit(&self, call: &ChainCall) -> WorkflowResult<H256> {
        let client = self.client();
        match call {
            ChainCall::DeployVault { router, fee_token } => {
                self.deploy(self.artifacts.vault.as_deref(), "vault", *router, *fee_token)
                    .await
            }
            ChainCall::DeployLedger { router, fee_token } => {
                self.deploy(self.artifacts.ledger.as_deref(), "ledger", *router, *fee_token)
                    .await
            }
            ChainCall::TokenTransfer { token, to, amount } => {
                self.send(Erc20Token::new(*token, client).transfer(*to, *amount))
                    .await
            }
            ChainCall::TokenApprove {
                token,
                spender,
                amount,
            } => {
                self.send(Erc20Token::new(*token, client).approve(*spender, *amount))
                    .await
            }
            ChainCall::SendDeposit {
                vault,
                destination_chain_selector,
                receiver,
                token,
                amount,
            } => {
                let vault = CollateralVault::new(*vault, client);
                self.send(vault.send_message(*destination_chain_selector, *receiver, *token, *amount))
                    .await
            }
            ChainCall::Borrow { ledger, message_id } => {
                self.send(LendingLedger::new(*ledger, client).borrow_usdc(message_id.0))
                    .await
            }
            ChainCall::RepayAndRelease {
                ledger,
                amount,
                destination_chain_selector,
                receiver,
                message_id,
            } => {
                let ledger = LendingLedger::new(*ledger, client);
                self.send(ledger.repay_and_send_message(
                    *amount,
                    *destination_chain_selector,
                    *receiver,
                    message_id.0,
                ))
                .await
            }
            // Vault and ledger share the withdraw surface
            ChainCall::Withdraw { contract } => {
                self.send(CollateralVault::new(*contract, client).withdraw())
                    .await
            }
            ChainCall::WithdrawToken { contract, token } => {
                self.send(CollateralVault::new(*contract, client).withdraw_token(*token))
                    .await
            }
        }
    }

    async fn block_number(&self) -> WorkflowResult<u64> {
        for _ in 0..self.clients.len() {
            match self.client().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }
        Err(self.all_failed())
    }

    async fn receipt(&self, tx_hash: H256) -> WorkflowResult<Option<Receipt>> {
        let mut fetched = None;
        for _ in 0..self.clients.len() {
            match self.client().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => {
                    fetched = Some(receipt);
                    break;
                }
                Err(e) => {
                    warn!("Failed to get receipt from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }
        let receipt = fetched.ok_or_else(|| self.all_failed())?;

        // A receipt without a block is still pending
        Ok(receipt.and_then(|r| {
            let block_number = r.block_number?.as_u64();
            Some(Receipt {
                tx_hash,
                block_number,
                succeeded: r.status.map(|s| s.as_u64() == 1).unwrap_or(true),
                contract_address: r.contract_address,
                events: EventParser::parse_logs(&r.logs),
                revert_reason: None,
            })
        }))
    }

    async fn query(&self, query: &ChainQuery) -> WorkflowResult<QueryValue> {
        let client = self.client();
        let value = match query {
            ChainQuery::TokenBalance { token, owner } => QueryValue::Amount(
                self.call(Erc20Token::new(*token, client).balance_of(*owner))
                    .await?,
            ),
            ChainQuery::NativeBalance { owner } => QueryValue::Amount(
                client
                    .get_balance(*owner, None)
                    .await
                    .map_err(|e| WorkflowError::ChainConnection {
                        chain_id: self.chain_id,
                        message: e.to_string(),
                    })?,
            ),
            ChainQuery::TotalSupply { token } => {
                QueryValue::Amount(self.call(Erc20Token::new(*token, client).total_supply()).await?)
            }
            ChainQuery::MessageDetail { ledger, message_id } => {
                let ledger = LendingLedger::new(*ledger, client);
                let (selector, source, depositor, token, amount) =
                    self.call(ledger.message_detail(message_id.0)).await?;
                QueryValue::Message(decode_message(
                    *message_id,
                    selector,
                    source,
                    depositor,
                    token,
                    amount,
                ))
            }
            ChainQuery::VaultMessageDetail { vault, message_id } => {
                let vault = CollateralVault::new(*vault, client);
                let (selector, source, depositor, token, amount) =
                    self.call(vault.message_detail(message_id.0)).await?;
                QueryValue::Message(decode_message(
                    *message_id,
                    selector,
                    source,
                    depositor,
                    token,
                    amount,
                ))
            }
            ChainQuery::ReceivedMessageDetails { ledger, message_id } => {
                let ledger = LendingLedger::new(*ledger, client);
                let (selector, source, depositor, token, amount) = self
                    .call(ledger.get_received_message_details(message_id.0))
                    .await?;
                QueryValue::Message(decode_message(
                    *message_id,
                    selector,
                    source,
                    depositor,
                    token,
                    amount,
                ))
            }
            ChainQuery::LastReceived { ledger } => {
                let ledger = LendingLedger::new(*ledger, client);
                let (id, selector, source, depositor, token, amount) =
                    self.call(ledger.get_last_received_message_details()).await?;
                QueryValue::Message(decode_message(
                    H256::from(id),
                    selector,
                    source,
                    depositor,
                    token,
                    amount,
                ))
            }
            ChainQuery::DepositedBalance {
                ledger,
                depositor,
                token,
            } => QueryValue::Amount(
                self.call(LendingLedger::new(*ledger, client).deposits(*depositor, *token))
                    .await?,
            ),
            ChainQuery::BorrowedBalance {
                ledger,
                depositor,
                token,
            } => QueryValue::Amount(
                self.call(LendingLedger::new(*ledger, client).borrowings(*depositor, *token))
                    .await?,
            ),
            ChainQuery::BorrowToken { ledger } => QueryValue::Address(
                self.call(LendingLedger::new(*ledger, client).usdc_token())
                    .await?,
            ),
        };
        Ok(value)
    }
}

/// Vaults and ledgers answer unknown ids with an all-zero record
fn decode_message(
    message_id: MessageId,
    source_chain_selector: u64,
    source_contract: Address,
    depositor: Address,
    token: Address,
    amount: U256,
) -> Option<CrossChainMessage> {
    if source_chain_selector == 0 && depositor.is_zero() {
        return None;
    }
    Some(CrossChainMessage {
        message_id,
        source_chain_selector,
        source_contract,
        depositor,
        token,
        amount,
    })
}

/// Split node errors into resubmittable and final
pub fn classify_submission_error(chain_id: u64, message: &str) -> WorkflowError {
    let lower = message.to_lowercase();
    if lower.contains("revert") {
        WorkflowError::Rejected {
            chain_id,
            reason: message.to_string(),
        }
    } else if ["nonce", "underpriced", "insufficient funds", "fee", "gas", "already known"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        WorkflowError::Transient {
            chain_id,
            message: message.to_string(),
        }
    } else {
        WorkflowError::ChainConnection {
            chain_id,
            message: message.to_string(),
        }
    }
}

/// Read `{"abi": [...], "bytecode": "0x..."}` (hardhat) or `{"bytecode": {"object": ...}}` (foundry)
fn load_artifact(path: &Path) -> WorkflowResult<(Abi, Vec<u8>)> {
    let bad = |msg: String| WorkflowError::Configuration(format!("Artifact {:?}: {}", path, msg));

    let raw = std::fs::read_to_string(path).map_err(|e| bad(e.to_string()))?;
    let json: serde_json::Value = serde_json::from_str(&raw).map_err(|e| bad(e.to_string()))?;

    let abi: Abi = serde_json::from_value(json["abi"].clone()).map_err(|e| bad(e.to_string()))?;
    let bytecode = json["bytecode"]
        .as_str()
        .or_else(|| json["bytecode"]["object"].as_str())
        .ok_or_else(|| bad("missing bytecode".to_string()))?;
    let code = hex::decode(bytecode.trim_start_matches("0x")).map_err(|e| bad(e.to_string()))?;

    if code.is_empty() {
        return Err(bad("empty bytecode".to_string()));
    }
    Ok((abi, code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_classify_submission_errors() {
        assert!(matches!(
            classify_submission_error(1, "nonce too low"),
            WorkflowError::Transient { .. }
        ));
        assert!(matches!(
            classify_submission_error(1, "replacement transaction underpriced"),
            WorkflowError::Transient { .. }
        ));
        assert_eq!(
            classify_submission_error(1, "execution reverted: NotDepositor"),
            WorkflowError::Rejected {
                chain_id: 1,
                reason: "execution reverted: NotDepositor".to_string(),
            }
        );
        assert!(matches!(
            classify_submission_error(1, "connection refused"),
            WorkflowError::ChainConnection { .. }
        ));
    }

    #[test]
    fn test_zero_record_is_not_found() {
        let id = H256::repeat_byte(3);
        assert_eq!(
            decode_message(id, 0, Address::zero(), Address::zero(), Address::zero(), U256::zero()),
            None
        );
        let message = decode_message(
            id,
            14767482510784806043,
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            Address::repeat_byte(3),
            U256::from(100),
        )
        .unwrap();
        assert_eq!(message.depositor, Address::repeat_byte(2));
    }

    /// Chain with one signing client per URL, bypassing the chain id handshake
    fn offline_chain(urls: &[&str]) -> EvmChain {
        let wallet = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
            .parse::<LocalWallet>()
            .unwrap()
            .with_chain_id(11155111u64);
        let clients = urls
            .iter()
            .map(|url| {
                let provider = Provider::<Http>::try_from(*url).unwrap();
                Arc::new(SignerMiddleware::new(provider, wallet.clone()))
            })
            .collect();
        EvmChain {
            chain_id: 11155111,
            signer: wallet.address(),
            clients,
            current: AtomicUsize::new(0),
            artifacts: ArtifactsConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_receipt_tries_every_provider() {
        let chain = offline_chain(&["http://127.0.0.1:1", "http://127.0.0.1:2"]);

        let err = chain.receipt(H256::repeat_byte(7)).await.unwrap_err();
        assert_eq!(err, chain.all_failed());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_load_hardhat_artifact() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"abi": [{{"type": "constructor", "inputs": [
                {{"name": "router", "type": "address"}},
                {{"name": "link", "type": "address"}}], "stateMutability": "nonpayable"}}],
                "bytecode": "0x6080"}}"#
        )
        .unwrap();

        let (abi, code) = load_artifact(file.path()).unwrap();
        assert_eq!(code, vec![0x60, 0x80]);
        assert_eq!(abi.constructor().unwrap().inputs.len(), 2);
    }
}
