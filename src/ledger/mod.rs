use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::types::{Address, Amount, UNLIMITED_ALLOWANCE};

pub const DEFAULT_DECIMALS: u8 = 18;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ERC20: insufficient-balance")]
    InsufficientBalance {
        account: Address,
        available: Amount,
        required: Amount,
    },
    #[error("ERC20: insufficient-allowance")]
    InsufficientAllowance {
        owner: Address,
        spender: Address,
        available: Amount,
        required: Amount,
    },
    #[error("ERC20: invalid-recipient")]
    InvalidRecipient { recipient: Address },
    #[error("ERC20: supply-overflow")]
    Overflow,
}

impl LedgerError {
    /// Stable tag surfaced to the host alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientBalance { .. } => "InsufficientBalance",
            LedgerError::InsufficientAllowance { .. } => "InsufficientAllowance",
            LedgerError::InvalidRecipient { .. } => "InvalidRecipient",
            LedgerError::Overflow => "Overflow",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    /// Mints are reported as transfers from [`Address::ZERO`].
    Transfer {
        token: Address,
        from: Address,
        to: Address,
        amount: Amount,
    },
    Approval {
        token: Address,
        owner: Address,
        spender: Address,
        amount: Amount,
    },
}

/// Capability handle for one asset ledger. The vault only ever talks to a
/// ledger through this interface.
pub trait TokenLedger {
    fn address(&self) -> Address;

    fn balance_of(&self, account: &Address) -> Amount;

    fn allowance(&self, owner: &Address, spender: &Address) -> Amount;

    fn total_supply(&self) -> Amount;

    fn transfer(&mut self, caller: &Address, to: &Address, amount: Amount)
        -> Result<bool, LedgerError>;

    fn approve(&mut self, caller: &Address, spender: &Address, amount: Amount) -> bool;

    fn transfer_from(
        &mut self,
        caller: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<bool, LedgerError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowanceEntry {
    pub owner: Address,
    pub spender: Address,
    pub amount: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: Amount,
    pub balances: BTreeMap<Address, Amount>,
    pub allowances: Vec<AllowanceEntry>,
    #[serde(with = "crate::types::serde_hash")]
    pub merkle_root: [u8; 32],
}

/// Balance and allowance accounting for a single fungible asset.
///
/// Every mutating operation validates all of its preconditions before it
/// writes anything, so a failed call leaves the ledger untouched.
#[derive(Clone, Debug)]
pub struct AccountLedger {
    address: Address,
    name: String,
    symbol: String,
    decimals: u8,
    balances: BTreeMap<Address, Amount>,
    allowances: BTreeMap<(Address, Address), Amount>,
    total_supply: Amount,
    events: Vec<LedgerEvent>,
}

impl AccountLedger {
    pub fn new(address: Address, name: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            symbol: symbol.into(),
            decimals: DEFAULT_DECIMALS,
            balances: BTreeMap::new(),
            allowances: BTreeMap::new(),
            total_supply: 0,
            events: Vec::new(),
        }
    }

    pub fn with_decimals(mut self, decimals: u8) -> Self {
        self.decimals = decimals;
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn total_supply(&self) -> Amount {
        self.total_supply
    }

    pub fn balance_of(&self, account: &Address) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(&(*owner, *spender))
            .copied()
            .unwrap_or(0)
    }

    /// Events recorded since the last drain, oldest first.
    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn drain_events(&mut self) -> Vec<LedgerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn mint(&mut self, to: &Address, amount: Amount) -> Result<(), LedgerError> {
        let total_supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        // balance <= supply, so this cannot overflow once the supply check passed
        let balance = self
            .balance_of(to)
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;

        self.total_supply = total_supply;
        if amount > 0 {
            self.balances.insert(*to, balance);
        }
        debug!(token = %self.address, %to, amount, "mint");
        self.events.push(LedgerEvent::Transfer {
            token: self.address,
            from: Address::ZERO,
            to: *to,
            amount,
        });
        Ok(())
    }

    pub fn transfer(
        &mut self,
        caller: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<bool, LedgerError> {
        self.ensure_recipient(to)?;
        self.ensure_balance(caller, amount)?;
        self.move_balance(caller, to, amount);
        Ok(true)
    }

    pub fn approve(&mut self, caller: &Address, spender: &Address, amount: Amount) -> bool {
        self.set_allowance(caller, spender, amount);
        debug!(token = %self.address, owner = %caller, %spender, amount, "approve");
        self.events.push(LedgerEvent::Approval {
            token: self.address,
            owner: *caller,
            spender: *spender,
            amount,
        });
        true
    }

    /// Delegated transfer. The allowance is checked before the balance, so
    /// when both fall short the allowance error wins. An account spending its
    /// own balance needs no allowance.
    pub fn transfer_from(
        &mut self,
        caller: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<bool, LedgerError> {
        self.ensure_recipient(to)?;
        let remaining = if caller == from {
            None
        } else {
            let allowed = self.allowance(from, caller);
            if allowed < amount {
                return Err(LedgerError::InsufficientAllowance {
                    owner: *from,
                    spender: *caller,
                    available: allowed,
                    required: amount,
                });
            }
            (allowed != UNLIMITED_ALLOWANCE).then(|| allowed - amount)
        };
        self.ensure_balance(from, amount)?;

        if let Some(remaining) = remaining {
            self.set_allowance(from, caller, remaining);
        }
        self.move_balance(from, to, amount);
        Ok(true)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let allowances = self
            .allowances
            .iter()
            .map(|((owner, spender), amount)| AllowanceEntry {
                owner: *owner,
                spender: *spender,
                amount: *amount,
            })
            .collect();
        LedgerSnapshot {
            address: self.address,
            name: self.name.clone(),
            symbol: self.symbol.clone(),
            decimals: self.decimals,
            total_supply: self.total_supply,
            balances: self.balances.clone(),
            allowances,
            merkle_root: compute_merkle_root(&self.balances, &self.allowances),
        }
    }

    fn ensure_recipient(&self, to: &Address) -> Result<(), LedgerError> {
        if to.is_zero() || *to == self.address {
            return Err(LedgerError::InvalidRecipient { recipient: *to });
        }
        Ok(())
    }

    fn ensure_balance(&self, account: &Address, amount: Amount) -> Result<(), LedgerError> {
        let available = self.balance_of(account);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                account: *account,
                available,
                required: amount,
            });
        }
        Ok(())
    }

    // A zero allowance is stored as no entry at all.
    fn set_allowance(&mut self, owner: &Address, spender: &Address, amount: Amount) {
        if amount == 0 {
            self.allowances.remove(&(*owner, *spender));
        } else {
            self.allowances.insert((*owner, *spender), amount);
        }
    }

    // Callers have already checked the debit side.
    fn move_balance(&mut self, from: &Address, to: &Address, amount: Amount) {
        if amount > 0 {
            let balance = self.balances.entry(*from).or_insert(0);
            *balance -= amount;
            *self.balances.entry(*to).or_insert(0) += amount;
        }
        debug!(token = %self.address, %from, %to, amount, "transfer");
        self.events.push(LedgerEvent::Transfer {
            token: self.address,
            from: *from,
            to: *to,
            amount,
        });
    }
}

impl TokenLedger for AccountLedger {
    fn address(&self) -> Address {
        self.address
    }

    fn balance_of(&self, account: &Address) -> Amount {
        AccountLedger::balance_of(self, account)
    }

    fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        AccountLedger::allowance(self, owner, spender)
    }

    fn total_supply(&self) -> Amount {
        self.total_supply
    }

    fn transfer(
        &mut self,
        caller: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<bool, LedgerError> {
        AccountLedger::transfer(self, caller, to, amount)
    }

    fn approve(&mut self, caller: &Address, spender: &Address, amount: Amount) -> bool {
        AccountLedger::approve(self, caller, spender, amount)
    }

    fn transfer_from(
        &mut self,
        caller: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<bool, LedgerError> {
        AccountLedger::transfer_from(self, caller, from, to, amount)
    }
}

fn compute_merkle_root(
    balances: &BTreeMap<Address, Amount>,
    allowances: &BTreeMap<(Address, Address), Amount>,
) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::new();
    for (account, balance) in balances {
        let mut hasher = Sha256::new();
        hasher.update(b"acct");
        hasher.update(account.as_bytes());
        hasher.update(balance.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    for ((owner, spender), amount) in allowances {
        let mut hasher = Sha256::new();
        hasher.update(b"allowance");
        hasher.update(owner.as_bytes());
        hasher.update(spender.as_bytes());
        hasher.update(amount.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    build_merkle(leaves)
}

pub(crate) fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"vault-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}
