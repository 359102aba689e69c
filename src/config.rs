//! Configuration management for the lending workflow
//!
//! Loads configuration from a TOML file with environment variable substitution.
//! The resulting [`Settings`] is built once at start-up, validated eagerly and then
//! passed by reference to every component; nothing reads configuration from globals.

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use ethers::utils::parse_units;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lending::CollateralPolicy;

/// Environment variable naming an alternative configuration file
pub const CONFIG_ENV: &str = "XLEND_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub wallet: WalletConfig,
    pub workflow: WorkflowConfig,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub finality: FinalityConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    pub networks: BTreeMap<String, NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the hex private key
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    pub source_network: String,
    pub destination_network: String,
    /// Bridge-token amount moved into a fresh vault, in whole tokens
    pub collateral_amount: String,
    /// Fee-token amount moved into each fresh contract, in whole tokens
    pub fee_funding: String,
    #[serde(default = "default_decimals")]
    pub token_decimals: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Collateral price in borrow-token units, scaled by `price_decimals`
    pub price: u64,
    pub price_decimals: u32,
    /// Loan-to-value in basis points
    pub ltv_bps: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinalityConfig {
    pub poll_interval_ms: u64,
    pub wait_budget_secs: u64,
}

impl Default for FinalityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            wait_budget_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactsConfig {
    /// Compiled vault artifact (`{"abi": [...], "bytecode": "0x..."}`)
    pub vault: Option<PathBuf>,
    /// Compiled ledger artifact
    pub ledger: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    /// Bridge routing selector. Kept as a string because the values exceed i64.
    pub chain_selector: String,
    pub rpc_urls: Vec<String>,
    pub router: String,
    pub fee_token: String,
    pub bridge_token: Option<String>,
    pub confirmations: u64,
    pub native_currency_symbol: String,
}

fn default_decimals() -> u32 {
    18
}

impl Settings {
    /// Load settings from `XLEND_CONFIG` or `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate a configuration document
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        for role in [&self.workflow.source_network, &self.workflow.destination_network] {
            if !self.networks.contains_key(role) {
                anyhow::bail!("Workflow network '{}' has no [networks.{}] entry", role, role);
            }
        }
        if self.workflow.source_network == self.workflow.destination_network {
            anyhow::bail!("Source and destination networks must differ");
        }

        self.collateral_amount()?;
        self.fee_funding()?;

        if self.policy.ltv_bps == 0 || self.policy.ltv_bps > 10_000 {
            anyhow::bail!("policy.ltv_bps must be in 1..=10000");
        }
        if self.finality.poll_interval_ms == 0 {
            anyhow::bail!("finality.poll_interval_ms must be positive");
        }

        // Profile-level checks live in the registry so that they also cover
        // programmatically built tables.
        crate::network::NetworkRegistry::from_settings(self)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        Ok(())
    }

    /// Bridge-token amount used to fund a new vault, in base units
    pub fn collateral_amount(&self) -> Result<U256> {
        parse_amount(&self.workflow.collateral_amount, self.workflow.token_decimals)
            .with_context(|| "Invalid workflow.collateral_amount")
    }

    /// Fee-token amount used to fund each new contract, in base units
    pub fn fee_funding(&self) -> Result<U256> {
        parse_amount(&self.workflow.fee_funding, self.workflow.token_decimals)
            .with_context(|| "Invalid workflow.fee_funding")
    }

    pub fn collateral_policy(&self) -> CollateralPolicy {
        CollateralPolicy::new(
            U256::from(self.policy.price),
            self.policy.price_decimals,
            self.policy.ltv_bps,
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.finality.poll_interval_ms)
    }

    pub fn wait_budget(&self) -> Duration {
        Duration::from_secs(self.finality.wait_budget_secs)
    }

    /// Read the signing key named by `wallet.private_key_env`
    pub fn private_key(&self) -> Result<String> {
        env::var(&self.wallet.private_key_env).with_context(|| {
            format!(
                "Set the {} environment variable with your EVM wallet private key",
                self.wallet.private_key_env
            )
        })
    }
}

/// Parse a decimal token amount (e.g. "0.0001") into base units
pub fn parse_amount(amount: &str, decimals: u32) -> Result<U256> {
    let parsed = parse_units(amount.trim(), decimals)
        .map_err(|e| anyhow::anyhow!("'{}' is not a valid amount: {}", amount, e))?;
    Ok(parsed.into())
}

/// Parse a 0x-prefixed address
pub fn parse_address(value: &str) -> Result<Address, String> {
    value
        .trim()
        .parse::<Address>()
        .map_err(|e| format!("'{}' is not a valid address: {}", value, e))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern");

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const SAMPLE: &str = r#"
[wallet]
private_key_env = "PRIVATE_KEY"

[workflow]
source_network = "fuji"
destination_network = "sepolia"
collateral_amount = "0.0001"
fee_funding = "0.5"

[policy]
price = 200000000000
price_decimals = 8
ltv_bps = 7000

[finality]
poll_interval_ms = 1
wait_budget_secs = 5

[networks.sepolia]
chain_id = 11155111
chain_selector = "16015286601757825753"
rpc_urls = ["${XLEND_TEST_SEPOLIA_URL}", "https://rpc.sepolia.org"]
router = "0xd0daae2231e9cb96b94c8512223533293c3693bf"
fee_token = "0x779877A7B0D9E8603169DdbD7836e478b4624789"
bridge_token = "0xFd57b4ddBf88a4e07fF4e34C487b99af2Fe82a05"
confirmations = 2
native_currency_symbol = "ETH"

[networks.fuji]
chain_id = 43113
chain_selector = "14767482510784806043"
rpc_urls = ["https://api.avax-test.network/ext/bc/C/rpc"]
router = "0x554472a2720e5e7d5d3c817529aba05eed5f82d8"
fee_token = "0x0b9d5D9136855f6FEc3c0993feE6E9CE8a297846"
bridge_token = "0xd21341536c5cf5eb1bcb58f6723ce26e8d8e90e4"
confirmations = 4
native_currency_symbol = "AVAX"
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("XLEND_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${XLEND_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file() {
        env::set_var("XLEND_TEST_SEPOLIA_URL", "https://sepolia.example.org");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.workflow.source_network, "fuji");
        assert_eq!(
            settings.networks["sepolia"].rpc_urls,
            vec![
                "https://sepolia.example.org".to_string(),
                "https://rpc.sepolia.org".to_string()
            ]
        );
        assert_eq!(
            settings.collateral_amount().unwrap(),
            U256::from(100_000_000_000_000u64)
        );
        assert_eq!(
            settings.fee_funding().unwrap(),
            U256::from(500_000_000_000_000_000u64)
        );
    }

    #[test]
    fn test_rejects_unknown_role_network() {
        let broken = SAMPLE.replace("source_network = \"fuji\"", "source_network = \"mumbai\"");
        let err = Settings::parse(&broken).unwrap_err();
        assert!(err.to_string().contains("mumbai"));
    }

    #[test]
    fn test_rejects_network_whose_only_rpc_url_is_unset() {
        env::remove_var("XLEND_TEST_UNSET_URL");
        let broken = SAMPLE.replace(
            "rpc_urls = [\"https://api.avax-test.network/ext/bc/C/rpc\"]",
            "rpc_urls = [\"${XLEND_TEST_UNSET_URL}\"]",
        );
        let err = Settings::parse(&broken).unwrap_err();
        assert!(err.to_string().contains("fuji"));
    }

    #[test]
    fn test_rejects_zero_confirmations() {
        let broken = SAMPLE.replace("confirmations = 4", "confirmations = 0");
        assert!(Settings::parse(&broken).is_err());
    }

    #[test]
    fn test_rejects_bad_amount() {
        let broken = SAMPLE.replace("fee_funding = \"0.5\"", "fee_funding = \"half\"");
        assert!(Settings::parse(&broken).is_err());
    }
}
