use alloy_primitives::Address;
use dn_types::{ChainId, parse_address};
use thiserror::Error;

pub const CONTRACT_ADDRESS_VAR: &str = "DONATION_CONTRACT_ADDRESS";
pub const CHAIN_ID_VAR: &str = "DONATION_CHAIN_ID";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid contract address {0:?}")]
    InvalidContractAddress(String),
    #[error("invalid chain id {0:?}; expected a positive decimal integer")]
    InvalidChainId(String),
}

/// Process-wide constants validated once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DappConfig {
    pub contract_address: Address,
    pub required_chain_id: ChainId,
}

impl DappConfig {
    pub fn parse(contract_address: &str, required_chain_id: &str) -> Result<Self, ConfigError> {
        let contract_address = parse_address(contract_address)
            .ok_or_else(|| ConfigError::InvalidContractAddress(contract_address.to_owned()))?;

        let chain_id = required_chain_id
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| ConfigError::InvalidChainId(required_chain_id.to_owned()))?;

        Ok(Self {
            contract_address,
            required_chain_id: ChainId(chain_id),
        })
    }

    /// Reads `DONATION_CONTRACT_ADDRESS` and `DONATION_CHAIN_ID`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let contract = std::env::var(CONTRACT_ADDRESS_VAR)
            .map_err(|_| ConfigError::MissingVar(CONTRACT_ADDRESS_VAR))?;
        let chain_id =
            std::env::var(CHAIN_ID_VAR).map_err(|_| ConfigError::MissingVar(CHAIN_ID_VAR))?;
        Self::parse(&contract, &chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_configuration() {
        let config = DappConfig::parse("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed", " 11155111 ").unwrap();
        assert_eq!(config.required_chain_id, ChainId(11_155_111));
        assert_eq!(
            config.contract_address.to_checksum(None),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
    }

    #[test]
    fn rejects_bad_address_and_chain_id() {
        assert_eq!(
            DappConfig::parse("0x1234", "1"),
            Err(ConfigError::InvalidContractAddress("0x1234".to_owned()))
        );
        for chain_id in ["", "sepolia", "-1", "0", "0x1"] {
            assert_eq!(
                DappConfig::parse("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed", chain_id),
                Err(ConfigError::InvalidChainId(chain_id.to_owned())),
                "{chain_id:?}"
            );
        }
    }
}
