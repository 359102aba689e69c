//! Top-level sequencer: one operation per workflow step
//!
//! Each step checks, in order, that it runs on the right chain and that its
//! reference data is present, and only then touches the chain. An orchestrator
//! is bound to one active chain; running the whole workflow takes one per side.

use super::preconditions::{
    require_address, require_balance_match, require_chain, require_workflow_chain, ChainRole,
};
use super::report::*;
use super::Step;
use crate::chain::{ChainClient, Erc20};
use crate::config::Settings;
use crate::error::{fmt_id, WorkflowError, WorkflowResult};
use crate::lending::{
    CollateralPolicy, CollateralSender, CrossChainMessage, Delivery, LendingCoordinator, MessageId,
};
use crate::network::{NetworkProfile, NetworkRegistry};

use ethers::types::{Address, U256};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Workflow-wide values taken from configuration
#[derive(Debug, Clone)]
pub struct WorkflowParams {
    pub source_network: String,
    pub destination_network: String,
    pub policy: CollateralPolicy,
    /// Bridge-token amount moved into a fresh vault
    pub collateral_amount: U256,
    /// Fee-token amount moved into each fresh contract
    pub fee_funding: U256,
}

impl WorkflowParams {
    pub fn from_settings(settings: &Settings) -> WorkflowResult<Self> {
        let config_error = |e: anyhow::Error| WorkflowError::Configuration(format!("{:#}", e));
        Ok(Self {
            source_network: settings.workflow.source_network.clone(),
            destination_network: settings.workflow.destination_network.clone(),
            policy: settings.collateral_policy(),
            collateral_amount: settings.collateral_amount().map_err(config_error)?,
            fee_funding: settings.fee_funding().map_err(config_error)?,
        })
    }
}

pub struct WorkflowOrchestrator {
    registry: NetworkRegistry,
    source: NetworkProfile,
    destination: NetworkProfile,
    client: Arc<ChainClient>,
    params: WorkflowParams,
}

impl WorkflowOrchestrator {
    pub fn new(
        registry: NetworkRegistry,
        params: WorkflowParams,
        client: Arc<ChainClient>,
    ) -> WorkflowResult<Self> {
        let source = registry.get(&params.source_network)?.clone();
        let destination = registry.get(&params.destination_network)?.clone();

        if source.chain_id == destination.chain_id {
            return Err(WorkflowError::Configuration(
                "Source and destination networks must differ".to_string(),
            ));
        }

        Ok(Self {
            registry,
            source,
            destination,
            client,
            params,
        })
    }

    /// The chain this orchestrator acts on
    pub fn active(&self) -> &NetworkProfile {
        self.client.profile()
    }

    pub fn client(&self) -> &Arc<ChainClient> {
        &self.client
    }

    /// Deploy a vault on the source chain and fund it with collateral and fee tokens
    pub async fn setup_sender(&self) -> WorkflowResult<StepReport<SetupSenderReport>> {
        self.run_step(Step::SetupSender, async {
            self.require_role(Step::SetupSender, ChainRole::Source)?;
            let active = self.active();
            let bridge_token = active.require_bridge_token()?;
            let fee_token = active.fee_token;

            let vault = CollateralSender::deploy(self.client.clone(), active.router, fee_token).await?;

            let funding = async {
                vault
                    .fund(&self.token(bridge_token), self.params.collateral_amount)
                    .await?;
                vault
                    .fund(&self.token(fee_token), self.params.fee_funding)
                    .await?;
                Ok::<_, WorkflowError>(())
            }
            .await;

            // The two transfers are independent; look at what actually landed
            let (bridge_balance, fee_balance) = vault.balances(bridge_token, fee_token).await?;
            info!(
                "Vault {:?} holds {} bridge token and {} fee token",
                vault.address(),
                bridge_balance,
                fee_balance
            );
            funding?;

            require_funded("bridge token", vault.address(), bridge_balance, self.params.collateral_amount)?;
            require_funded("fee token", vault.address(), fee_balance, self.params.fee_funding)?;

            Ok(SetupSenderReport {
                vault: vault.address(),
                bridge_token,
                bridge_balance,
                fee_token,
                fee_balance,
            })
        })
        .await
    }

    /// Deploy a ledger on the destination chain and fund it with fee tokens
    pub async fn setup_protocol(&self) -> WorkflowResult<StepReport<SetupProtocolReport>> {
        self.run_step(Step::SetupProtocol, async {
            self.require_role(Step::SetupProtocol, ChainRole::Destination)?;
            let active = self.active();
            active.require_bridge_token()?;
            let fee_token = active.fee_token;

            let ledger = LendingCoordinator::deploy(
                self.client.clone(),
                active.router,
                fee_token,
                self.params.policy,
            )
            .await?;

            let fee = self.token(fee_token);
            let funding = fee.transfer(ledger.address(), self.params.fee_funding).await;
            let fee_balance = fee.balance_of(ledger.address()).await?;
            funding?;
            require_funded("fee token", ledger.address(), fee_balance, self.params.fee_funding)?;

            let borrow_token = ledger.borrow_token().await?;
            info!("Borrow token deployed at {:?}", borrow_token);

            Ok(SetupProtocolReport {
                ledger: ledger.address(),
                fee_token,
                fee_balance,
                borrow_token,
            })
        })
        .await
    }

    /// Send `amount` of the bridge token from `vault` to `ledger` on `destination`
    pub async fn transfer(
        &self,
        vault: Address,
        ledger: Address,
        destination: &str,
        amount: U256,
    ) -> WorkflowResult<StepReport<TransferReport>> {
        self.run_step(Step::Transfer, async {
            self.require_role(Step::Transfer, ChainRole::Source)?;
            let vault = require_address("vault", vault)?;
            let ledger = require_address("ledger", ledger)?;
            let token = self.active().require_bridge_token()?;

            let target = self.registry.get(destination)?;
            if target.chain_id == self.active().chain_id {
                return Err(WorkflowError::Configuration(format!(
                    "Destination '{}' is the active chain",
                    destination
                )));
            }
            if amount.is_zero() {
                return Err(WorkflowError::Configuration(
                    "Transfer amount must be positive".to_string(),
                ));
            }

            let sender = CollateralSender::attach(self.client.clone(), vault);
            let tx_hash = sender
                .send_deposit(target.chain_selector, ledger, token, amount)
                .await?;

            Ok(TransferReport {
                vault,
                ledger,
                destination: target.name.clone(),
                destination_chain_selector: target.chain_selector,
                token,
                amount,
                tx_hash,
            })
        })
        .await
    }

    /// One poll for a delivered message. Not delivered yet is `Pending`, not an error.
    pub async fn await_delivery(
        &self,
        ledger: Address,
        message_id: MessageId,
    ) -> WorkflowResult<StepReport<Delivery<DeliveredState>>> {
        self.run_step(Step::AwaitDelivery, async {
            self.require_role(Step::AwaitDelivery, ChainRole::Destination)?;
            let ledger = self.coordinator(require_address("ledger", ledger)?);

            let message = match ledger.find_message(message_id).await? {
                Some(message) => message,
                None => {
                    crate::metrics::record_delivery_poll("pending");
                    info!("Message {:?} not delivered yet", message_id);
                    return Ok(Delivery::Pending);
                }
            };
            crate::metrics::record_delivery_poll("delivered");

            let borrow_token = ledger.borrow_token().await?;
            let (collateral, borrowed) = futures::try_join!(
                ledger.deposited_balance(message.depositor, message.token),
                ledger.borrowed_balance(message.depositor, borrow_token),
            )?;

            Ok(Delivery::Delivered(DeliveredState {
                message,
                collateral,
                borrow_token,
                borrowed,
            }))
        })
        .await
    }

    /// One poll on the source vault for the release sent by `repay`
    pub async fn read_release(
        &self,
        vault: Address,
        release_message_id: MessageId,
    ) -> WorkflowResult<StepReport<Delivery<CrossChainMessage>>> {
        self.run_step(Step::ReadRelease, async {
            self.require_role(Step::ReadRelease, ChainRole::Source)?;
            let vault = CollateralSender::attach(self.client.clone(), require_address("vault", vault)?);

            match vault.find_message(release_message_id).await? {
                Some(message) => {
                    crate::metrics::record_delivery_poll("delivered");
                    Ok(Delivery::Delivered(message))
                }
                None => {
                    crate::metrics::record_delivery_poll("pending");
                    info!("Release {:?} not delivered yet", release_message_id);
                    Ok(Delivery::Pending)
                }
            }
        })
        .await
    }

    /// Caller's positions next to the ledger's last received message
    pub async fn read_borrowed(&self, ledger: Address) -> WorkflowResult<StepReport<ReadBorrowedReport>> {
        self.run_step(Step::ReadBorrowed, async {
            self.require_role(Step::ReadBorrowed, ChainRole::Destination)?;
            let ledger = self.coordinator(require_address("ledger", ledger)?);

            warn!(
                "read-borrowed shows the ledger's single last-received message; \
                 with more than one depositor it may not be yours. Prefer await-delivery with a message id."
            );
            let last_message = ledger.read_last_received().await?;

            let caller = self.client.signer();
            let collateral = match &last_message {
                Some(message) => ledger.deposited_balance(caller, message.token).await?,
                None => U256::zero(),
            };
            let borrow_token = ledger.borrow_token().await?;
            let borrowed = ledger.borrowed_balance(caller, borrow_token).await?;

            Ok(ReadBorrowedReport {
                ledger: ledger.address(),
                caller,
                last_message,
                collateral,
                borrowed,
            })
        })
        .await
    }

    /// Draw against the collateral credited by `message_id`
    pub async fn borrow(
        &self,
        ledger: Address,
        message_id: MessageId,
    ) -> WorkflowResult<StepReport<BorrowReport>> {
        self.run_step(Step::Borrow, async {
            self.require_role(Step::Borrow, ChainRole::Destination)?;
            let ledger = self.coordinator(require_address("ledger", ledger)?);
            let caller = self.client.signer();

            let borrow_token = ledger.borrow_token().await?;
            let starting_borrowed = ledger.borrowed_balance(caller, borrow_token).await?;

            let outcome = ledger.borrow(message_id).await?;

            let token = self.token(outcome.borrow_token);
            let (borrower_balance, total_supply) =
                futures::try_join!(token.balance_of(caller), token.total_supply())?;

            Ok(BorrowReport {
                message_id,
                borrow_token: outcome.borrow_token,
                starting_borrowed,
                borrowed: outcome.borrowed,
                limit: outcome.limit,
                borrower_balance,
                total_supply,
                tx_hash: outcome.tx_hash,
            })
        })
        .await
    }

    /// Repay everything owed on `message_id` and release toward `vault` on the origin chain
    pub async fn repay(
        &self,
        ledger: Address,
        vault: Address,
        message_id: MessageId,
    ) -> WorkflowResult<StepReport<RepayReport>> {
        self.run_step(Step::Repay, async {
            self.require_role(Step::Repay, ChainRole::Destination)?;
            let ledger = self.coordinator(require_address("ledger", ledger)?);
            let vault = require_address("vault", vault)?;

            let message = ledger.received_message_details(message_id).await?;
            if message.source_contract != vault {
                return Err(WorkflowError::Configuration(format!(
                    "Message {} came from vault {:?}, not {:?}; the release must go back to the sending vault",
                    fmt_id(&message_id),
                    message.source_contract,
                    vault
                )));
            }
            let origin = self
                .registry
                .by_selector(message.source_chain_selector)
                .ok_or_else(|| {
                    WorkflowError::Configuration(format!(
                        "Message came from unknown chain selector {}",
                        message.source_chain_selector
                    ))
                })?;

            let caller = self.client.signer();
            let borrow_token = ledger.borrow_token().await?;
            let token = self.token(borrow_token);
            let (held, recorded) = futures::try_join!(
                token.balance_of(caller),
                ledger.borrowed_balance(caller, borrow_token),
            )?;
            info!("Borrowings: {}, repayment amount: {}", recorded, held);

            require_balance_match(held, recorded)?;
            if recorded.is_zero() {
                info!("Borrower {:?} has no outstanding borrowings", caller);
                return Ok(RepayReport::NothingToRepay { borrower: caller });
            }

            let release = ledger
                .repay_and_release(held, origin.chain_selector, vault, message_id)
                .await?;

            let (borrower_balance, total_supply) =
                futures::try_join!(token.balance_of(caller), token.total_supply())?;

            Ok(RepayReport::Repaid {
                release,
                borrower_balance,
                total_supply,
            })
        })
        .await
    }

    /// Return a vault's or ledger's native and token balances to its owner
    pub async fn withdraw(
        &self,
        role: ChainRole,
        contract: Address,
    ) -> WorkflowResult<StepReport<WithdrawReport>> {
        self.run_step(Step::Withdraw, async {
            self.require_role(Step::Withdraw, role)?;
            let contract = require_address("contract", contract)?;
            let active = self.active();
            let bridge_token = active.require_bridge_token()?;
            let fee_token = active.fee_token;

            match role {
                ChainRole::Source => {
                    let vault = CollateralSender::attach(self.client.clone(), contract);
                    vault.withdraw().await?;
                    vault.withdraw_token(bridge_token).await?;
                    vault.withdraw_token(fee_token).await?;
                }
                ChainRole::Destination => {
                    let ledger = self.coordinator(contract);
                    ledger.withdraw_token(bridge_token).await?;
                    ledger.withdraw_token(fee_token).await?;
                    ledger.withdraw().await?;
                }
            }

            let bridge = self.token(bridge_token);
            let fee = self.token(fee_token);
            let (bridge_balance, fee_balance, native_balance) = futures::try_join!(
                bridge.balance_of(contract),
                fee.balance_of(contract),
                self.client.native_balance(contract),
            )?;

            Ok(WithdrawReport {
                contract,
                bridge_balance,
                fee_balance,
                native_balance,
                native_currency_symbol: active.native_currency_symbol.clone(),
            })
        })
        .await
    }

    /// Total supply of the ledger's borrow token
    pub async fn token_supply(&self, ledger: Address) -> WorkflowResult<StepReport<SupplyReport>> {
        self.run_step(Step::TokenSupply, async {
            require_workflow_chain(Step::TokenSupply.name(), &self.source, &self.destination, self.active())?;
            let ledger = self.coordinator(require_address("ledger", ledger)?);

            let token = ledger.borrow_token().await?;
            let total_supply = self.token(token).total_supply().await?;
            Ok(SupplyReport { token, total_supply })
        })
        .await
    }

    /// ERC-20 balance of any account
    pub async fn balance_of(
        &self,
        account: Address,
        token: Address,
    ) -> WorkflowResult<StepReport<BalanceReport>> {
        self.run_step(Step::BalanceOf, async {
            require_workflow_chain(Step::BalanceOf.name(), &self.source, &self.destination, self.active())?;
            let account = require_address("account", account)?;
            let token = require_address("token", token)?;

            let balance = self.token(token).balance_of(account).await?;
            Ok(BalanceReport {
                account,
                token,
                balance,
            })
        })
        .await
    }

    fn require_role(&self, step: Step, role: ChainRole) -> WorkflowResult<()> {
        let required = match role {
            ChainRole::Source => &self.source,
            ChainRole::Destination => &self.destination,
        };
        require_chain(step.name(), role, required, self.active())
    }

    fn coordinator(&self, ledger: Address) -> LendingCoordinator {
        LendingCoordinator::attach(self.client.clone(), ledger, self.params.policy)
    }

    fn token(&self, address: Address) -> Erc20 {
        Erc20::new(self.client.clone(), address)
    }

    async fn run_step<T, F>(&self, step: Step, body: F) -> WorkflowResult<StepReport<T>>
    where
        F: Future<Output = WorkflowResult<T>>,
    {
        info!("Running {} on {}", step.name(), self.active().name);
        let result = body.await;

        match result {
            Ok(body) => {
                crate::metrics::record_step(step.name(), "ok");
                Ok(StepReport::new(step.name(), &self.active().name, body))
            }
            Err(e) => {
                crate::metrics::record_step(step.name(), e.kind());
                warn!("{} failed on {}: {}", step.name(), self.active().name, e);
                Err(e)
            }
        }
    }
}

fn require_funded(what: &str, holder: Address, have: U256, need: U256) -> WorkflowResult<()> {
    if have < need {
        warn!("Funding shortfall on {:?}: {} {} of {}", holder, what, have, need);
        return Err(WorkflowError::InsufficientBalance {
            token: what.to_string(),
            holder,
            have,
            need,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainQuery, MockChainBackend, QueryValue};
    use crate::network::tests::profile;

    const SOURCE_ID: u64 = 43113;
    const DEST_ID: u64 = 11155111;

    fn registry() -> NetworkRegistry {
        NetworkRegistry::new(vec![
            profile("fuji", SOURCE_ID, 14767482510784806043),
            profile("sepolia", DEST_ID, 16015286601757825753),
        ])
        .unwrap()
    }

    fn params() -> WorkflowParams {
        WorkflowParams {
            source_network: "fuji".to_string(),
            destination_network: "sepolia".to_string(),
            policy: CollateralPolicy::default(),
            collateral_amount: U256::from(100),
            fee_funding: U256::from(500),
        }
    }

    fn orchestrator(backend: MockChainBackend, network: &str) -> WorkflowOrchestrator {
        let registry = registry();
        let profile = registry.get(network).unwrap().clone();
        let client = ChainClient::connect(profile, Arc::new(backend)).unwrap();
        WorkflowOrchestrator::new(registry, params(), Arc::new(client)).unwrap()
    }

    /// A backend on `chain_id` that fails the test if anything is submitted or read
    fn untouchable(chain_id: u64) -> MockChainBackend {
        let mut backend = MockChainBackend::new();
        backend.expect_chain_id().return_const(chain_id);
        backend.expect_signer().return_const(Address::repeat_byte(0xaa));
        backend.expect_submit().never();
        backend.expect_query().never();
        backend
    }

    #[tokio::test]
    async fn test_wrong_network_fails_before_any_call() {
        let on_source = orchestrator(untouchable(SOURCE_ID), "fuji");
        let on_dest = orchestrator(untouchable(DEST_ID), "sepolia");
        let ledger = Address::repeat_byte(0x1e);
        let vault = Address::repeat_byte(0x5e);
        let id = MessageId::repeat_byte(0x11);

        let errors = vec![
            on_source.setup_protocol().await.map(|_| ()),
            on_source.await_delivery(ledger, id).await.map(|_| ()),
            on_source.read_borrowed(ledger).await.map(|_| ()),
            on_source.borrow(ledger, id).await.map(|_| ()),
            on_source.repay(ledger, vault, id).await.map(|_| ()),
            on_source.withdraw(ChainRole::Destination, ledger).await.map(|_| ()),
            on_dest.setup_sender().await.map(|_| ()),
            on_dest.transfer(vault, ledger, "sepolia", U256::one()).await.map(|_| ()),
            on_dest.withdraw(ChainRole::Source, vault).await.map(|_| ()),
            on_dest.read_release(vault, id).await.map(|_| ()),
        ];

        for result in errors {
            assert!(
                matches!(result, Err(WorkflowError::WrongNetwork { .. })),
                "got {:?}",
                result
            );
        }
    }

    #[tokio::test]
    async fn test_missing_reference_data_is_configuration_error() {
        let on_dest = orchestrator(untouchable(DEST_ID), "sepolia");
        let err = on_dest
            .borrow(Address::zero(), MessageId::repeat_byte(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));

        let on_source = orchestrator(untouchable(SOURCE_ID), "fuji");
        let err = on_source
            .transfer(Address::repeat_byte(1), Address::repeat_byte(2), "mumbai", U256::one())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
    }

    /// Destination backend holding one delivered message from vault 0x5e; refuses writes
    fn repay_backend(depositor: Address, held: u64, recorded: u64) -> MockChainBackend {
        let mut backend = MockChainBackend::new();
        backend.expect_chain_id().return_const(DEST_ID);
        backend.expect_signer().return_const(depositor);
        backend.expect_submit().never();
        backend.expect_query().returning(move |query| {
            Ok(match query {
                ChainQuery::ReceivedMessageDetails { message_id, .. } => {
                    QueryValue::Message(Some(crate::lending::CrossChainMessage {
                        message_id: *message_id,
                        source_chain_selector: 14767482510784806043,
                        source_contract: Address::repeat_byte(0x5e),
                        depositor,
                        token: Address::repeat_byte(0xb1),
                        amount: U256::from(100),
                    }))
                }
                ChainQuery::BorrowToken { .. } => QueryValue::Address(Address::repeat_byte(0xc0)),
                ChainQuery::TokenBalance { .. } => QueryValue::Amount(U256::from(held)),
                ChainQuery::BorrowedBalance { .. } => QueryValue::Amount(U256::from(recorded)),
                other => panic!("unexpected query {:?}", other),
            })
        });
        backend
    }

    #[tokio::test]
    async fn test_repay_balance_mismatch_before_any_write() {
        let depositor = Address::repeat_byte(0xaa);
        let on_dest = orchestrator(repay_backend(depositor, 139, 140), "sepolia");
        let err = on_dest
            .repay(Address::repeat_byte(0x1e), Address::repeat_byte(0x5e), MessageId::repeat_byte(0x11))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WorkflowError::BalanceMismatch {
                held: U256::from(139),
                recorded: U256::from(140),
            }
        );
    }

    #[tokio::test]
    async fn test_repay_to_a_vault_other_than_the_sender_is_refused() {
        let depositor = Address::repeat_byte(0xaa);
        let on_dest = orchestrator(repay_backend(depositor, 140, 140), "sepolia");
        let err = on_dest
            .repay(Address::repeat_byte(0x1e), Address::repeat_byte(0x99), MessageId::repeat_byte(0x11))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
        assert!(err.to_string().contains("sending vault"));
    }

    #[tokio::test]
    async fn test_pending_delivery_is_not_an_error() {
        let mut backend = MockChainBackend::new();
        backend.expect_chain_id().return_const(DEST_ID);
        backend.expect_signer().return_const(Address::repeat_byte(0xaa));
        backend.expect_submit().never();
        backend
            .expect_query()
            .returning(|_| Ok(QueryValue::Message(None)));

        let on_dest = orchestrator(backend, "sepolia");
        let report = on_dest
            .await_delivery(Address::repeat_byte(0x1e), MessageId::repeat_byte(0x11))
            .await
            .unwrap();
        assert_eq!(report.body, Delivery::Pending);
    }
}
