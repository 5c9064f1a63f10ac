use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::host::Transaction;
use crate::ledger::DEFAULT_DECIMALS;
use crate::types::{Address, Amount, Timestamp};

/// Initial world layout: deployed ledgers, vaults and the starting clock.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Genesis {
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub ledgers: Vec<LedgerConfig>,
    #[serde(default)]
    pub vaults: Vec<VaultConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Label the ledger address is derived from.
    pub label: String,
    #[serde(default)]
    pub name: Option<String>,
    pub symbol: String,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
    /// Account reference (label or hex address) to amount, minted at genesis.
    #[serde(default)]
    pub allocations: BTreeMap<String, Amount>,
}

impl LedgerConfig {
    pub fn address(&self) -> Address {
        Address::from_label(&self.label)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.label)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultConfig {
    pub label: String,
    /// Account reference of the deployer, who becomes the vault owner.
    pub owner: String,
}

impl VaultConfig {
    pub fn address(&self) -> Address {
        Address::from_label(&self.label)
    }
}

fn default_decimals() -> u8 {
    DEFAULT_DECIMALS
}

/// A replayable script: a genesis followed by ordered steps.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scenario {
    #[serde(default)]
    pub genesis: Genesis,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Execute {
        caller: String,
        transaction: Transaction<String>,
    },
    AdvanceTime {
        seconds: u64,
    },
    SetTime {
        timestamp: Timestamp,
    },
}

impl Scenario {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
