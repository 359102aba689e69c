//! Static catalog of network profiles
//!
//! Profiles are built once from [`Settings`] and never mutated afterwards.

use crate::config::{NetworkConfig, Settings};
use crate::error::{WorkflowError, WorkflowResult};

use ethers::types::Address;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Local development chain name; never a valid workflow target
const LOCAL_DEV_NETWORK: &str = "hardhat";

/// Everything the workflow needs to know about one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkProfile {
    pub name: String,
    pub chain_id: u64,
    pub chain_selector: u64,
    pub rpc_urls: Vec<String>,
    pub router: Address,
    pub fee_token: Address,
    pub bridge_token: Option<Address>,
    pub required_confirmations: u64,
    pub native_currency_symbol: String,
}

impl NetworkProfile {
    /// Bridge token, required by every step that moves collateral
    pub fn require_bridge_token(&self) -> WorkflowResult<Address> {
        self.bridge_token.ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "Missing bridge token address for network '{}'",
                self.name
            ))
        })
    }

    fn from_config(name: &str, config: &NetworkConfig) -> WorkflowResult<Self> {
        let field = |what: &str, value: &str| -> WorkflowResult<Address> {
            value.trim().parse::<Address>().map_err(|e| {
                WorkflowError::Configuration(format!(
                    "Network '{}' has an invalid {} address '{}': {}",
                    name, what, value, e
                ))
            })
        };

        let chain_selector = config.chain_selector.trim().parse::<u64>().map_err(|e| {
            WorkflowError::Configuration(format!(
                "Network '{}' has an invalid chain selector '{}': {}",
                name, config.chain_selector, e
            ))
        })?;

        let bridge_token = match config.bridge_token.as_deref() {
            Some(value) if !value.trim().is_empty() => Some(field("bridge token", value)?),
            _ => None,
        };

        // An unset ${VAR} leaves an empty entry behind
        let rpc_urls: Vec<String> = config
            .rpc_urls
            .iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if rpc_urls.is_empty() {
            return Err(WorkflowError::Configuration(format!(
                "Network '{}' has no RPC URL; set the environment variable its rpc_urls reference",
                name
            )));
        }

        let profile = Self {
            name: name.to_string(),
            chain_id: config.chain_id,
            chain_selector,
            rpc_urls,
            router: field("router", &config.router)?,
            fee_token: field("fee token", &config.fee_token)?,
            bridge_token,
            required_confirmations: config.confirmations,
            native_currency_symbol: config.native_currency_symbol.clone(),
        };
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> WorkflowResult<()> {
        let fail = |msg: &str| {
            Err(WorkflowError::Configuration(format!(
                "Network '{}': {}",
                self.name, msg
            )))
        };

        if self.name == LOCAL_DEV_NETWORK {
            return fail("local development chains cannot run the workflow");
        }
        if self.required_confirmations == 0 {
            return fail("confirmations must be at least 1");
        }
        if self.chain_selector == 0 {
            return fail("chain selector must be non-zero");
        }
        if self.router.is_zero() {
            return fail("router address is zero");
        }
        if self.fee_token.is_zero() {
            return fail("fee token address is zero");
        }
        if self.rpc_urls.is_empty() {
            return fail("no RPC URLs configured");
        }
        if self.rpc_urls.iter().any(|url| url.trim().is_empty()) {
            return fail("blank RPC URL");
        }
        Ok(())
    }
}

/// Pure lookup over the configured profiles
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    profiles: BTreeMap<String, NetworkProfile>,
}

impl NetworkRegistry {
    /// Build and validate the registry from loaded settings
    pub fn from_settings(settings: &Settings) -> WorkflowResult<Self> {
        let profiles = settings
            .networks
            .iter()
            .map(|(name, config)| NetworkProfile::from_config(name, config))
            .collect::<WorkflowResult<Vec<_>>>()?;
        Self::new(profiles)
    }

    /// Build the registry from already-constructed profiles
    pub fn new(profiles: Vec<NetworkProfile>) -> WorkflowResult<Self> {
        let mut selectors = HashSet::new();
        let mut chain_ids = HashSet::new();
        let mut by_name = BTreeMap::new();

        for profile in profiles {
            profile.validate()?;
            if !selectors.insert(profile.chain_selector) {
                return Err(WorkflowError::Configuration(format!(
                    "Chain selector {} is used by more than one network",
                    profile.chain_selector
                )));
            }
            if !chain_ids.insert(profile.chain_id) {
                return Err(WorkflowError::Configuration(format!(
                    "Chain id {} is used by more than one network",
                    profile.chain_id
                )));
            }
            if by_name.insert(profile.name.clone(), profile).is_some() {
                return Err(WorkflowError::Configuration(
                    "Duplicate network name".to_string(),
                ));
            }
        }

        Ok(Self { profiles: by_name })
    }

    /// Look up a network by name
    pub fn get(&self, name: &str) -> WorkflowResult<&NetworkProfile> {
        if name == LOCAL_DEV_NETWORK {
            return Err(WorkflowError::Configuration(
                "This command cannot be used on a local development chain. Specify a valid network."
                    .to_string(),
            ));
        }
        self.profiles.get(name).ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "Unknown network '{}' (configured: {})",
                name,
                self.names().join(", ")
            ))
        })
    }

    /// Bridge token of a named network, failing if absent
    pub fn require_bridge_token(&self, name: &str) -> WorkflowResult<Address> {
        self.get(name)?.require_bridge_token()
    }

    pub fn selector_of(&self, name: &str) -> WorkflowResult<u64> {
        Ok(self.get(name)?.chain_selector)
    }

    pub fn by_chain_id(&self, chain_id: u64) -> Option<&NetworkProfile> {
        self.profiles.values().find(|p| p.chain_id == chain_id)
    }

    pub fn by_selector(&self, selector: u64) -> Option<&NetworkProfile> {
        self.profiles.values().find(|p| p.chain_selector == selector)
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn profile(name: &str, chain_id: u64, selector: u64) -> NetworkProfile {
        NetworkProfile {
            name: name.to_string(),
            chain_id,
            chain_selector: selector,
            rpc_urls: vec!["http://localhost:8545".to_string()],
            router: Address::from_low_u64_be(0x1000 + chain_id),
            fee_token: Address::from_low_u64_be(0x2000 + chain_id),
            bridge_token: Some(Address::from_low_u64_be(0x3000 + chain_id)),
            required_confirmations: 2,
            native_currency_symbol: "ETH".to_string(),
        }
    }

    #[test]
    fn test_registry_from_settings() {
        let settings = Settings::parse(crate::config::tests::SAMPLE).unwrap();
        let registry = NetworkRegistry::from_settings(&settings).unwrap();

        let fuji = registry.get("fuji").unwrap();
        assert_eq!(fuji.chain_id, 43113);
        assert_eq!(fuji.chain_selector, 14767482510784806043);
        assert_eq!(fuji.required_confirmations, 4);
        assert_eq!(registry.selector_of("sepolia").unwrap(), 16015286601757825753);
        assert_eq!(registry.by_chain_id(11155111).unwrap().name, "sepolia");
    }

    #[test]
    fn test_unknown_and_local_networks() {
        let registry = NetworkRegistry::new(vec![profile("alpha", 1, 11)]).unwrap();
        assert!(matches!(
            registry.get("beta"),
            Err(WorkflowError::Configuration(_))
        ));
        assert!(matches!(
            registry.get("hardhat"),
            Err(WorkflowError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_bridge_token() {
        let mut alpha = profile("alpha", 1, 11);
        alpha.bridge_token = None;
        let registry = NetworkRegistry::new(vec![alpha]).unwrap();
        let err = registry.require_bridge_token("alpha").unwrap_err();
        assert!(err.to_string().contains("Missing bridge token"));
    }

    fn network_config(rpc_urls: &[&str]) -> NetworkConfig {
        NetworkConfig {
            chain_id: 11155111,
            chain_selector: "16015286601757825753".to_string(),
            rpc_urls: rpc_urls.iter().map(|url| url.to_string()).collect(),
            router: "0xd0daae2231e9cb96b94c8512223533293c3693bf".to_string(),
            fee_token: "0x779877A7B0D9E8603169DdbD7836e478b4624789".to_string(),
            bridge_token: None,
            confirmations: 2,
            native_currency_symbol: "ETH".to_string(),
        }
    }

    #[test]
    fn test_unset_rpc_url_is_a_configuration_error() {
        let err = NetworkProfile::from_config("sepolia", &network_config(&[""])).unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
        assert!(err.to_string().contains("no RPC URL"));

        let profile =
            NetworkProfile::from_config("sepolia", &network_config(&["  ", "https://rpc.example"])).unwrap();
        assert_eq!(profile.rpc_urls, vec!["https://rpc.example".to_string()]);

        let mut blank = profile.clone();
        blank.rpc_urls.push(String::new());
        assert!(matches!(
            NetworkRegistry::new(vec![blank]),
            Err(WorkflowError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_selector_rejected() {
        let result = NetworkRegistry::new(vec![profile("alpha", 1, 11), profile("beta", 2, 11)]);
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }
}
