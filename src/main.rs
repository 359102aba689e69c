//! xlend - operator CLI for bridge-collateralized lending
//!
//! Each invocation runs one workflow step against one chain, prints its
//! report and exits. `simulate` runs the whole workflow offline.

use anyhow::{Context, Result};
use clap::Parser;
use ethers::types::Address;
use serde::Serialize;
use std::fmt::Display;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use xchain_lending::chain::{ChainClient, EvmChain};
use xchain_lending::cli::{Args, Command};
use xchain_lending::config::Settings;
use xchain_lending::error::WorkflowError;
use xchain_lending::metrics;
use xchain_lending::network::NetworkRegistry;
use xchain_lending::workflow::{
    SimulatedWorkflow, WorkflowOrchestrator, WorkflowParams, SIMULATED_OPERATOR,
};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    let outcome = run(&args).await;

    if let Some(path) = &args.metrics_file {
        if let Err(e) = metrics::write_textfile(path) {
            warn!("{:#}", e);
        }
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(args.json, &e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<()> {
    let settings = match &args.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    let registry = NetworkRegistry::from_settings(&settings)?;
    let params = WorkflowParams::from_settings(&settings)?;

    if let Command::Simulate = args.command {
        let simulation = SimulatedWorkflow::build(
            registry,
            params,
            Address::from_low_u64_be(SIMULATED_OPERATOR),
            Duration::from_millis(1),
            settings.wait_budget(),
        )?;
        return emit(args.json, &simulation.run().await?);
    }

    let network = args
        .network
        .as_deref()
        .context("--network is required for this command")?;
    let profile = registry.get(network)?.clone();
    let private_key = settings.private_key()?;

    let backend = EvmChain::connect(&profile, &private_key, settings.artifacts.clone()).await?;
    let client = ChainClient::connect(profile, Arc::new(backend))?
        .with_finality(settings.poll_interval(), settings.wait_budget());
    let orchestrator = WorkflowOrchestrator::new(registry, params, Arc::new(client))?;
    info!(
        "Acting on {} as {:?}",
        network,
        orchestrator.client().signer()
    );

    match &args.command {
        Command::SetupSender => emit(args.json, &orchestrator.setup_sender().await?),
        Command::SetupProtocol => emit(args.json, &orchestrator.setup_protocol().await?),
        Command::Transfer {
            sender,
            protocol,
            dest_chain,
            amount,
        } => emit(
            args.json,
            &orchestrator
                .transfer(*sender, *protocol, dest_chain, *amount)
                .await?,
        ),
        Command::AwaitDelivery {
            protocol,
            message_id,
        } => emit(
            args.json,
            &orchestrator.await_delivery(*protocol, *message_id).await?,
        ),
        Command::ReadRelease { sender, message_id } => emit(
            args.json,
            &orchestrator.read_release(*sender, *message_id).await?,
        ),
        Command::ReadBorrowed { protocol } => {
            emit(args.json, &orchestrator.read_borrowed(*protocol).await?)
        }
        Command::Borrow {
            protocol,
            message_id,
        } => emit(args.json, &orchestrator.borrow(*protocol, *message_id).await?),
        Command::Repay {
            protocol,
            sender,
            message_id,
        } => emit(
            args.json,
            &orchestrator.repay(*protocol, *sender, *message_id).await?,
        ),
        Command::Withdraw { role, address } => emit(
            args.json,
            &orchestrator.withdraw((*role).into(), *address).await?,
        ),
        Command::TokenSupply { protocol } => {
            emit(args.json, &orchestrator.token_supply(*protocol).await?)
        }
        Command::BalanceOf { account, token } => {
            emit(args.json, &orchestrator.balance_of(*account, *token).await?)
        }
        Command::Simulate => Ok(()),
    }
}

/// Reports go to stdout; logs stay on stderr
fn emit<T: Serialize + Display>(json: bool, report: &T) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

fn report_error(json: bool, e: &anyhow::Error) {
    let workflow_error = e.downcast_ref::<WorkflowError>();
    if json {
        let body = serde_json::json!({
            "error": workflow_error.map(|w| w.kind()).unwrap_or("internal"),
            "retryable": workflow_error.map(|w| w.is_retryable()).unwrap_or(false),
            "message": format!("{:#}", e),
        });
        println!("{}", body);
    }
    error!("{:#}", e);
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,xchain_lending=debug,xlend=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}
