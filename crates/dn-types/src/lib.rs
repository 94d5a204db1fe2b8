use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Donate,
    Withdraw,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Donate => "donate",
            TxKind::Withdraw => "withdraw",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Donated,
    Withdrawn,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::Donated, EventKind::Withdrawn];

    /// Canonical Solidity event signature, hashed to form topic0.
    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::Donated => "Donated(address,uint256)",
            EventKind::Withdrawn => "Withdrawn(address,uint256)",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Donated => f.write_str("Donated"),
            EventKind::Withdrawn => f.write_str("Withdrawn"),
        }
    }
}

/// Contract-level scalars read together at one logical point in chain time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractSnapshot {
    pub owner: Address,
    pub min_donation_wei: U256,
    pub total_donated_wei: U256,
    pub contract_balance_wei: U256,
    pub my_donated_wei: U256,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CharityEntity {
    pub address: Address,
    pub name: String,
    /// `None` when the balance read for this charity failed.
    pub allocated_wei: Option<U256>,
}

impl CharityEntity {
    /// Builds an entity from independently-read parts. A missing or blank
    /// on-chain name falls back to the shortened address.
    pub fn from_reads(address: Address, name: Option<String>, allocated_wei: Option<U256>) -> Self {
        let name = match name {
            Some(name) if !name.trim().is_empty() => name,
            _ => short_address(&address),
        };
        Self {
            address,
            name,
            allocated_wei,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub actor: Address,
    pub amount_wei: U256,
    pub tx_hash: B256,
}

/// Parses a `0x`-prefixed 20-byte hex address.
///
/// All-lowercase and all-uppercase forms are accepted as-is; a mixed-case
/// input must carry a valid EIP-55 checksum.
pub fn parse_address(input: &str) -> Option<Address> {
    let trimmed = input.trim();
    let hex = trimmed.strip_prefix("0x")?;
    if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    let address: Address = trimmed.parse().ok()?;

    let has_lower = hex.bytes().any(|b| b.is_ascii_lowercase());
    let has_upper = hex.bytes().any(|b| b.is_ascii_uppercase());
    if has_lower && has_upper && address.to_checksum(None) != trimmed {
        return None;
    }

    Some(address)
}

/// `0x1234...abcd` form of the checksummed address.
pub fn short_address(address: &Address) -> String {
    let full = address.to_checksum(None);
    format!("{}...{}", &full[..6], &full[full.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKSUMMED: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    #[test]
    fn parse_address_accepts_checksummed_and_single_case() {
        let expected = parse_address(CHECKSUMMED).expect("checksummed address");
        assert_eq!(parse_address(&CHECKSUMMED.to_lowercase()), Some(expected));
        assert_eq!(
            parse_address(&format!("0x{}", CHECKSUMMED[2..].to_uppercase())),
            Some(expected)
        );
        assert_eq!(parse_address(&format!("  {CHECKSUMMED} ")), Some(expected));
    }

    #[test]
    fn parse_address_rejects_malformed_input() {
        assert_eq!(parse_address(""), None);
        assert_eq!(parse_address("0x1234"), None);
        assert_eq!(parse_address(&CHECKSUMMED[2..]), None);
        assert_eq!(parse_address("0xZZaeb6053F3E94C9b9A09f33669435E7Ef1BeAed"), None);
        // flipped case on one letter breaks the checksum
        assert_eq!(parse_address("0x5aaeb6053F3E94C9b9A09f33669435E7Ef1BeAed"), None);
    }

    #[test]
    fn short_address_keeps_prefix_and_suffix() {
        let address = parse_address(CHECKSUMMED).expect("address");
        assert_eq!(short_address(&address), "0x5aAe...eAed");
    }

    #[test]
    fn charity_name_falls_back_to_short_address() {
        let address = parse_address(CHECKSUMMED).expect("address");

        let named = CharityEntity::from_reads(address, Some("Red Cross".to_owned()), None);
        assert_eq!(named.name, "Red Cross");

        let blank = CharityEntity::from_reads(address, Some("   ".to_owned()), Some(U256::from(5)));
        assert_eq!(blank.name, "0x5aAe...eAed");
        assert_eq!(blank.allocated_wei, Some(U256::from(5)));

        let missing = CharityEntity::from_reads(address, None, None);
        assert_eq!(missing.name, "0x5aAe...eAed");
    }

    #[test]
    fn tx_kind_serializes_snake_case() {
        let json = serde_json::to_string(&TxKind::Withdraw).expect("serialize");
        assert_eq!(json, "\"withdraw\"");
    }
}
