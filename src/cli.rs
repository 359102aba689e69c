//! Command line surface of the `xlend` binary

use crate::config::parse_address;
use crate::lending::MessageId;
use crate::workflow::ChainRole;

use clap::{Parser, Subcommand, ValueEnum};
use ethers::types::{Address, U256};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[clap(name = "xlend", version, about = "Bridge-collateralized lending across two EVM chains")]
#[clap(rename_all = "kebab-case")]
pub struct Args {
    /// Configuration file (defaults to config/default.toml)
    #[clap(long, env = "XLEND_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print step reports as JSON
    #[clap(long)]
    pub json: bool,

    /// Write Prometheus text metrics here on exit
    #[clap(long = "metrics-file")]
    pub metrics_file: Option<PathBuf>,

    /// Network to act on, by its name in the configuration
    #[clap(long, env = "XLEND_NETWORK")]
    pub network: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum Command {
    /// Deploy and fund the collateral vault (source chain)
    SetupSender,
    /// Deploy and fund the lending ledger (destination chain)
    SetupProtocol,
    /// Send collateral from the vault to the ledger (source chain)
    Transfer {
        /// Vault address
        #[clap(long, value_parser = parse_address)]
        sender: Address,
        /// Ledger address
        #[clap(long, value_parser = parse_address)]
        protocol: Address,
        /// Destination network name
        #[clap(long = "dest-chain")]
        dest_chain: String,
        /// Amount in the token's smallest denomination
        #[clap(long, value_parser = parse_base_units)]
        amount: U256,
    },
    /// Check once whether a deposit has been delivered (destination chain)
    AwaitDelivery {
        #[clap(long, value_parser = parse_address)]
        protocol: Address,
        #[clap(long = "message-id", value_parser = parse_message_id)]
        message_id: MessageId,
    },
    /// Check once whether a release has reached the vault (source chain)
    ReadRelease {
        /// Vault address
        #[clap(long, value_parser = parse_address)]
        sender: Address,
        /// Release message id printed by repay
        #[clap(long = "message-id", value_parser = parse_message_id)]
        message_id: MessageId,
    },
    /// Show the last received message and the caller's positions (destination chain)
    ReadBorrowed {
        #[clap(long, value_parser = parse_address)]
        protocol: Address,
    },
    /// Borrow against a delivered deposit (destination chain)
    Borrow {
        #[clap(long, value_parser = parse_address)]
        protocol: Address,
        #[clap(long = "message-id", value_parser = parse_message_id)]
        message_id: MessageId,
    },
    /// Repay a borrow and release the collateral (destination chain)
    Repay {
        #[clap(long, value_parser = parse_address)]
        protocol: Address,
        /// Vault on the origin chain that receives the release
        #[clap(long, value_parser = parse_address)]
        sender: Address,
        #[clap(long = "message-id", value_parser = parse_message_id)]
        message_id: MessageId,
    },
    /// Return a contract's funds to its owner
    Withdraw {
        #[clap(long, value_enum)]
        role: RoleArg,
        #[clap(long, value_parser = parse_address)]
        address: Address,
    },
    /// Total supply of the ledger's borrow token
    TokenSupply {
        #[clap(long, value_parser = parse_address)]
        protocol: Address,
    },
    /// ERC-20 balance of an account
    BalanceOf {
        #[clap(long, value_parser = parse_address)]
        account: Address,
        #[clap(long, value_parser = parse_address)]
        token: Address,
    },
    /// Run the whole workflow offline on simulated chains
    Simulate,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleArg {
    Source,
    Destination,
}

impl From<RoleArg> for ChainRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Source => ChainRole::Source,
            RoleArg::Destination => ChainRole::Destination,
        }
    }
}

fn parse_message_id(value: &str) -> Result<MessageId, String> {
    let trimmed = value.trim();
    let hex = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if hex.len() != 64 {
        return Err(format!("'{}' is not a 32-byte message id", value));
    }
    MessageId::from_str(hex).map_err(|e| format!("'{}' is not a valid message id: {}", value, e))
}

fn parse_base_units(value: &str) -> Result<U256, String> {
    U256::from_dec_str(value.trim()).map_err(|e| format!("'{}' is not a valid amount: {}", value, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_arguments() {
        let args = Args::try_parse_from([
            "xlend",
            "--network",
            "fuji",
            "transfer",
            "--sender",
            "0x1111111111111111111111111111111111111111",
            "--protocol",
            "0x2222222222222222222222222222222222222222",
            "--dest-chain",
            "sepolia",
            "--amount",
            "100000000000000",
        ])
        .unwrap();

        assert_eq!(args.network.as_deref(), Some("fuji"));
        match args.command {
            Command::Transfer {
                sender,
                dest_chain,
                amount,
                ..
            } => {
                assert_eq!(sender, Address::repeat_byte(0x11));
                assert_eq!(dest_chain, "sepolia");
                assert_eq!(amount, U256::from(100_000_000_000_000u64));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_message_id_must_be_32_bytes() {
        let id = format!("0x{}", "ab".repeat(32));
        assert_eq!(parse_message_id(&id).unwrap(), MessageId::repeat_byte(0xab));
        assert!(parse_message_id("0xabcd").is_err());
        assert!(parse_message_id(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_read_release_arguments() {
        let id = format!("0x{}", "cd".repeat(32));
        let args = Args::try_parse_from([
            "xlend",
            "--network",
            "fuji",
            "read-release",
            "--sender",
            "0x1111111111111111111111111111111111111111",
            "--message-id",
            id.as_str(),
        ])
        .unwrap();
        match args.command {
            Command::ReadRelease { sender, message_id } => {
                assert_eq!(sender, Address::repeat_byte(0x11));
                assert_eq!(message_id, MessageId::repeat_byte(0xcd));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_withdraw_role() {
        let args = Args::try_parse_from([
            "xlend",
            "--network",
            "sepolia",
            "withdraw",
            "--role",
            "destination",
            "--address",
            "0x3333333333333333333333333333333333333333",
        ])
        .unwrap();
        match args.command {
            Command::Withdraw { role, .. } => {
                assert_eq!(ChainRole::from(role), ChainRole::Destination)
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Args::try_parse_from(["xlend", "withdraw", "--role", "sideways", "--address", "0x0"]).is_err());
    }
}
