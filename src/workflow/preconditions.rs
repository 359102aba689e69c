//! Checks every step runs before its first mutating call

use crate::error::{WorkflowError, WorkflowResult};
use crate::network::NetworkProfile;

use ethers::types::{Address, U256};
use serde::Serialize;
use std::fmt;

/// Which side of the workflow a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainRole {
    Source,
    Destination,
}

impl fmt::Display for ChainRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainRole::Source => write!(f, "source"),
            ChainRole::Destination => write!(f, "destination"),
        }
    }
}

/// The active chain must be the one configured for `role`. No redirects.
pub fn require_chain(
    step: &str,
    role: ChainRole,
    required: &NetworkProfile,
    active: &NetworkProfile,
) -> WorkflowResult<()> {
    if active.chain_id != required.chain_id {
        return Err(WorkflowError::WrongNetwork {
            step: step.to_string(),
            expected: format!("{} ({} chain)", required.name, role),
            actual: active.name.clone(),
        });
    }
    Ok(())
}

/// The active chain must be one of the two workflow chains
pub fn require_workflow_chain(
    step: &str,
    source: &NetworkProfile,
    destination: &NetworkProfile,
    active: &NetworkProfile,
) -> WorkflowResult<()> {
    if active.chain_id != source.chain_id && active.chain_id != destination.chain_id {
        return Err(WorkflowError::WrongNetwork {
            step: step.to_string(),
            expected: format!("{} or {}", source.name, destination.name),
            actual: active.name.clone(),
        });
    }
    Ok(())
}

/// Reference data supplied by the operator must be present and non-zero
pub fn require_address(what: &str, value: Address) -> WorkflowResult<Address> {
    if value.is_zero() {
        return Err(WorkflowError::Configuration(format!("Missing {} address", what)));
    }
    Ok(value)
}

/// What the repayer holds must equal what the ledger says is owed
pub fn require_balance_match(held: U256, recorded: U256) -> WorkflowResult<()> {
    if held != recorded {
        return Err(WorkflowError::BalanceMismatch { held, recorded });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::profile;

    #[test]
    fn test_chain_identity() {
        let fuji = profile("fuji", 43113, 1);
        let sepolia = profile("sepolia", 11155111, 2);

        assert!(require_chain("borrow", ChainRole::Destination, &sepolia, &sepolia).is_ok());
        let err = require_chain("borrow", ChainRole::Destination, &sepolia, &fuji).unwrap_err();
        assert_eq!(
            err,
            WorkflowError::WrongNetwork {
                step: "borrow".to_string(),
                expected: "sepolia (destination chain)".to_string(),
                actual: "fuji".to_string(),
            }
        );

        let other = profile("mumbai", 80001, 3);
        assert!(require_workflow_chain("balance-of", &fuji, &sepolia, &other).is_err());
        assert!(require_workflow_chain("balance-of", &fuji, &sepolia, &fuji).is_ok());
    }

    #[test]
    fn test_reference_data() {
        assert!(matches!(
            require_address("ledger", Address::zero()),
            Err(WorkflowError::Configuration(_))
        ));
        assert!(require_address("ledger", Address::repeat_byte(1)).is_ok());
    }

    #[test]
    fn test_balance_reconciliation() {
        assert!(require_balance_match(U256::from(5), U256::from(5)).is_ok());
        assert_eq!(
            require_balance_match(U256::from(4), U256::from(5)),
            Err(WorkflowError::BalanceMismatch {
                held: U256::from(4),
                recorded: U256::from(5),
            })
        );
    }
}
