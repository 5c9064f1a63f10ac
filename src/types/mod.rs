use std::{fmt, str::FromStr};

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub type Amount = u128;
pub type Timestamp = u64;
pub type GrantId = u64;

/// Allowance value that is never decremented by a delegated transfer.
pub const UNLIMITED_ALLOWANCE: Amount = Amount::MAX;

pub const ADDRESS_LEN: usize = 20;

const LABEL_DOMAIN: &[u8] = b"vault-ledger/address";

/// 20-byte account identifier. Ledgers and vaults are addressed the same way
/// as the accounts they hold balances for.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// The null identifier. Never a valid transfer destination.
    pub const ZERO: Address = Address([0u8; ADDRESS_LEN]);

    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Deterministic address for a human-readable label ("alice", "token", ...).
    pub fn from_label(label: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(LABEL_DOMAIN);
        hasher.update(label.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&digest[..ADDRESS_LEN]);
        Self(bytes)
    }

    /// Accepts either a `0x`-prefixed hex address or a label. Anything that
    /// starts with `0x` must be a well-formed address.
    pub fn resolve(reference: &str) -> Result<Self, AddressParseError> {
        if reference.trim().starts_with("0x") {
            reference.parse()
        } else {
            Ok(Self::from_label(reference))
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AddressParseError {
    #[error("address must start with 0x")]
    MissingPrefix,
    #[error("invalid address hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("address must be 20 bytes, got {0}")]
    Length(usize),
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .trim()
            .strip_prefix("0x")
            .ok_or(AddressParseError::MissingPrefix)?;
        let raw = hex::decode(body)?;
        if raw.len() != ADDRESS_LEN {
            return Err(AddressParseError::Length(raw.len()));
        }
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}

/// Explicit authorization context for one operation: who is calling and the
/// single clock reading the operation observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallContext {
    pub caller: Address,
    pub timestamp: Timestamp,
}

impl CallContext {
    pub fn new(caller: Address, timestamp: Timestamp) -> Self {
        Self { caller, timestamp }
    }
}

pub(crate) mod serde_hash {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let raw = hex::decode(&encoded).map_err(D::Error::custom)?;
        raw.try_into()
            .map_err(|_| D::Error::custom("state root must be 32 bytes"))
    }
}
