//! Offline run of the whole workflow on two simulated chains and a mock bridge

use super::orchestrator::{WorkflowOrchestrator, WorkflowParams};
use super::preconditions::ChainRole;
use crate::bridge::{BridgeReceiver, MockBridge};
use crate::chain::{ChainClient, SimulatedChain};
use crate::error::{WorkflowError, WorkflowResult};
use crate::lending::{Delivery, MessageId};
use crate::network::{NetworkProfile, NetworkRegistry};
use crate::workflow::report::RepayReport;

use ethers::types::{Address, U256};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::info;

/// Signing identity used by `simulate`
pub const SIMULATED_OPERATOR: u64 = 0xa11ce;

/// Flat bridge fee, 0.01 fee token
const BRIDGE_FEE: u64 = 10_000_000_000_000_000;

/// Faucet grants to the operator on both chains
const FAUCET_BRIDGE_TOKEN: u64 = 1_000_000_000_000_000_000;
const FAUCET_FEE_TOKEN: u64 = 10_000_000_000_000_000_000;

/// Two simulated chains joined by a mock bridge, with an orchestrator on each
pub struct SimulatedWorkflow {
    pub bridge: Arc<MockBridge>,
    pub source_chain: Arc<SimulatedChain>,
    pub destination_chain: Arc<SimulatedChain>,
    pub source: WorkflowOrchestrator,
    pub destination: WorkflowOrchestrator,
    pub operator: Address,
    registry: NetworkRegistry,
    params: WorkflowParams,
    poll_interval: Duration,
    wait_budget: Duration,
}

impl SimulatedWorkflow {
    pub fn build(
        registry: NetworkRegistry,
        params: WorkflowParams,
        operator: Address,
        poll_interval: Duration,
        wait_budget: Duration,
    ) -> WorkflowResult<Self> {
        let source_profile = registry.get(&params.source_network)?.clone();
        let destination_profile = registry.get(&params.destination_network)?.clone();
        let source_token = source_profile.require_bridge_token()?;
        let destination_token = destination_profile.require_bridge_token()?;

        let bridge = Arc::new(MockBridge::new(U256::from(BRIDGE_FEE)));
        let source_chain = simulated_chain(&bridge, &source_profile, &params, operator);
        let destination_chain = simulated_chain(&bridge, &destination_profile, &params, operator);

        bridge.add_route(source_profile.chain_selector, source_token, destination_token);
        bridge.add_route(destination_profile.chain_selector, destination_token, source_token);

        let timing = (poll_interval, wait_budget);
        let source = orchestrator(&registry, &params, &source_profile, &source_chain, operator, timing)?;
        let destination =
            orchestrator(&registry, &params, &destination_profile, &destination_chain, operator, timing)?;

        Ok(Self {
            bridge,
            source_chain,
            destination_chain,
            source,
            destination,
            operator,
            registry,
            params,
            poll_interval,
            wait_budget,
        })
    }

    /// Orchestrator on one side acting as `signer`
    pub fn orchestrator_as(&self, role: ChainRole, signer: Address) -> WorkflowResult<WorkflowOrchestrator> {
        let (network, chain) = match role {
            ChainRole::Source => (&self.params.source_network, &self.source_chain),
            ChainRole::Destination => (&self.params.destination_network, &self.destination_chain),
        };
        let profile = self.registry.get(network)?.clone();
        orchestrator(
            &self.registry,
            &self.params,
            &profile,
            chain,
            signer,
            (self.poll_interval, self.wait_budget),
        )
    }

    /// Drive every step once, delivering bridge messages in between
    pub async fn run(&self) -> WorkflowResult<SimulationReport> {
        let mut transcript = Vec::new();

        let sender = self.source.setup_sender().await?;
        transcript.push(sender.to_string());
        let vault = sender.body.vault;

        let protocol = self.destination.setup_protocol().await?;
        transcript.push(protocol.to_string());
        let ledger = protocol.body.ledger;

        let transfer = self
            .source
            .transfer(vault, ledger, &self.params.destination_network, self.params.collateral_amount)
            .await?;
        transcript.push(transfer.to_string());

        let delivered = self.bridge.deliver_all();
        let message_id = single(&delivered, "deposit")?;

        let delivery = self.destination.await_delivery(ledger, message_id).await?;
        transcript.push(delivery.to_string());
        let collateral = match &delivery.body {
            Delivery::Delivered(state) => state.collateral,
            Delivery::Pending => {
                return Err(WorkflowError::Internal(
                    "Deposit was delivered but the ledger has no record".to_string(),
                ))
            }
        };

        let borrow = self.destination.borrow(ledger, message_id).await?;
        transcript.push(borrow.to_string());

        let repay = self.destination.repay(ledger, vault, message_id).await?;
        transcript.push(repay.to_string());
        let release_message_id = match &repay.body {
            RepayReport::Repaid { release, .. } => Some(release.release_message_id),
            RepayReport::NothingToRepay { .. } => None,
        };

        self.bridge.deliver_all();
        let release_delivered = match release_message_id {
            Some(release_id) => {
                let release = self.source.read_release(vault, release_id).await?;
                transcript.push(release.to_string());
                release.body.is_delivered()
            }
            None => false,
        };

        transcript.push(self.source.withdraw(ChainRole::Source, vault).await?.to_string());
        transcript.push(
            self.destination
                .withdraw(ChainRole::Destination, ledger)
                .await?
                .to_string(),
        );

        info!("Simulated workflow finished");
        Ok(SimulationReport {
            vault,
            ledger,
            message_id,
            collateral,
            borrowed: borrow.body.borrowed,
            limit: borrow.body.limit,
            release_message_id,
            release_delivered,
            transcript,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub vault: Address,
    pub ledger: Address,
    pub message_id: MessageId,
    pub collateral: U256,
    pub borrowed: U256,
    pub limit: U256,
    pub release_message_id: Option<MessageId>,
    pub release_delivered: bool,
    pub transcript: Vec<String>,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.transcript {
            writeln!(f, "{}", entry)?;
        }
        write!(
            f,
            "Collateral {} credited, {} borrowed (limit {}), release delivered: {}",
            self.collateral, self.borrowed, self.limit, self.release_delivered
        )
    }
}

fn simulated_chain(
    bridge: &Arc<MockBridge>,
    profile: &NetworkProfile,
    params: &WorkflowParams,
    operator: Address,
) -> Arc<SimulatedChain> {
    let chain = SimulatedChain::new(
        profile.chain_id,
        profile.chain_selector,
        bridge.clone(),
        params.policy,
    );
    let receiver: Weak<dyn BridgeReceiver> = Arc::downgrade(&chain) as Weak<dyn BridgeReceiver>;
    bridge.register(profile.chain_selector, receiver);

    chain.create_token(profile.fee_token, "LINK");
    chain.mint(profile.fee_token, operator, U256::from(FAUCET_FEE_TOKEN));
    if let Some(token) = profile.bridge_token {
        chain.create_token(token, "BnM");
        chain.mint(token, operator, U256::from(FAUCET_BRIDGE_TOKEN));
    }
    chain
}

fn orchestrator(
    registry: &NetworkRegistry,
    params: &WorkflowParams,
    profile: &NetworkProfile,
    chain: &Arc<SimulatedChain>,
    signer: Address,
    (poll_interval, wait_budget): (Duration, Duration),
) -> WorkflowResult<WorkflowOrchestrator> {
    let client = ChainClient::connect(profile.clone(), chain.account(signer))?
        .with_finality(poll_interval, wait_budget);
    WorkflowOrchestrator::new(registry.clone(), params.clone(), Arc::new(client))
}

fn single(ids: &[MessageId], what: &str) -> WorkflowResult<MessageId> {
    match ids {
        [id] => Ok(*id),
        _ => Err(WorkflowError::Internal(format!(
            "Expected one {} message in flight, found {}",
            what,
            ids.len()
        ))),
    }
}
