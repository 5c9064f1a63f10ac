use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::ledger::{build_merkle, AccountLedger, LedgerError, TokenLedger};
use crate::types::{Address, Amount, CallContext, GrantId, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    #[error("Not owner")]
    NotOwner { caller: Address },
    #[error("Not recipient address")]
    NotRecipient { grant_id: GrantId, caller: Address },
    #[error("This contract cannot be the recipient")]
    InvalidRecipient { recipient: Address },
    #[error("Cannot withdraw")]
    CannotWithdraw { grant_id: GrantId },
    #[error("Cannot cancel after unlock")]
    CannotCancelAfterUnlock { grant_id: GrantId },
    #[error("unknown grant {grant_id}")]
    UnknownGrant { grant_id: GrantId },
    #[error("unknown token ledger {token}")]
    UnknownToken { token: Address },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl VaultError {
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::NotOwner { .. } => "NotOwner",
            VaultError::NotRecipient { .. } => "NotRecipient",
            VaultError::InvalidRecipient { .. } => "InvalidRecipient",
            VaultError::CannotWithdraw { .. } => "CannotWithdraw",
            VaultError::CannotCancelAfterUnlock { .. } => "CannotCancelAfterUnlock",
            VaultError::UnknownGrant { .. } => "UnknownGrant",
            VaultError::UnknownToken { .. } => "UnknownToken",
            VaultError::Ledger(err) => err.code(),
        }
    }
}

/// Resolves a grant's token reference to a live ledger handle.
pub trait TokenDirectory {
    fn token_mut(&mut self, token: &Address) -> Option<&mut dyn TokenLedger>;
}

impl TokenDirectory for BTreeMap<Address, AccountLedger> {
    fn token_mut(&mut self, token: &Address) -> Option<&mut dyn TokenLedger> {
        self.get_mut(token).map(|ledger| ledger as &mut dyn TokenLedger)
    }
}

/// A single ledger is a directory that knows exactly one token.
impl TokenDirectory for AccountLedger {
    fn token_mut(&mut self, token: &Address) -> Option<&mut dyn TokenLedger> {
        if *token == self.address() {
            Some(self as &mut dyn TokenLedger)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Grant {
    pub recipient: Address,
    pub amount: Amount,
    pub unlock_timestamp: Timestamp,
    pub token: Address,
    pub active: bool,
}

impl Grant {
    pub fn is_unlocked(&self, now: Timestamp) -> bool {
        now >= self.unlock_timestamp
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VaultEvent {
    GrantCreated {
        vault: Address,
        grant_id: GrantId,
        recipient: Address,
        amount: Amount,
        unlock_timestamp: Timestamp,
        token: Address,
    },
    GrantWithdrawn {
        vault: Address,
        grant_id: GrantId,
        recipient: Address,
        amount: Amount,
    },
    GrantCancelled {
        vault: Address,
        grant_id: GrantId,
        owner: Address,
        amount: Amount,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultSnapshot {
    pub address: Address,
    pub owner: Address,
    pub grant_count: u64,
    pub grants: Vec<Grant>,
    #[serde(with = "crate::types::serde_hash")]
    pub merkle_root: [u8; 32],
}

/// Time-locked escrow held on behalf of a single owner.
///
/// Grants are append-only; an index handed out by [`GrantVault::create_grant`]
/// identifies its grant forever. A grant leaves the active state exactly once,
/// together with the single outbound transfer of its escrowed amount.
#[derive(Clone, Debug)]
pub struct GrantVault {
    address: Address,
    owner: Address,
    grants: Vec<Grant>,
    events: Vec<VaultEvent>,
}

impl GrantVault {
    pub fn new(address: Address, owner: Address) -> Self {
        Self {
            address,
            owner,
            grants: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn grant_count(&self) -> u64 {
        self.grants.len() as u64
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    pub fn count_to_grant(&self, grant_id: GrantId) -> Result<&Grant, VaultError> {
        usize::try_from(grant_id)
            .ok()
            .and_then(|idx| self.grants.get(idx))
            .ok_or(VaultError::UnknownGrant { grant_id })
    }

    /// Sum of active grants escrowed in `token`.
    pub fn escrowed(&self, token: &Address) -> Amount {
        self.grants
            .iter()
            .filter(|g| g.active && g.token == *token)
            .map(|g| g.amount)
            .sum()
    }

    pub fn events(&self) -> &[VaultEvent] {
        &self.events
    }

    pub fn drain_events(&mut self) -> Vec<VaultEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn create_grant<D>(
        &mut self,
        ctx: &CallContext,
        amount: Amount,
        unlock_timestamp: Timestamp,
        recipient: Address,
        token: Address,
        tokens: &mut D,
    ) -> Result<GrantId, VaultError>
    where
        D: TokenDirectory + ?Sized,
    {
        self.ensure_owner(&ctx.caller)?;
        if recipient == self.address {
            return Err(VaultError::InvalidRecipient { recipient });
        }
        let ledger = tokens
            .token_mut(&token)
            .ok_or(VaultError::UnknownToken { token })?;
        ledger.transfer_from(&self.address, &self.owner, &self.address, amount)?;

        let grant_id = self.grant_count();
        self.grants.push(Grant {
            recipient,
            amount,
            unlock_timestamp,
            token,
            active: true,
        });
        debug!(
            vault = %self.address,
            grant_id,
            %recipient,
            amount,
            unlock_timestamp,
            "grant created"
        );
        self.events.push(VaultEvent::GrantCreated {
            vault: self.address,
            grant_id,
            recipient,
            amount,
            unlock_timestamp,
            token,
        });
        Ok(grant_id)
    }

    /// Releases a matured grant to its recipient. Maturity is checked before
    /// the active flag, so a settled grant reports `CannotWithdraw` as well.
    pub fn withdraw_grant<D>(
        &mut self,
        ctx: &CallContext,
        grant_id: GrantId,
        tokens: &mut D,
    ) -> Result<(), VaultError>
    where
        D: TokenDirectory + ?Sized,
    {
        let grant = self.count_to_grant(grant_id)?.clone();
        if ctx.caller != grant.recipient {
            return Err(VaultError::NotRecipient {
                grant_id,
                caller: ctx.caller,
            });
        }
        if !grant.is_unlocked(ctx.timestamp) || !grant.active {
            return Err(VaultError::CannotWithdraw { grant_id });
        }

        self.release(grant_id, &grant, &grant.recipient, tokens)?;
        debug!(
            vault = %self.address,
            grant_id,
            recipient = %grant.recipient,
            "grant withdrawn"
        );
        self.events.push(VaultEvent::GrantWithdrawn {
            vault: self.address,
            grant_id,
            recipient: grant.recipient,
            amount: grant.amount,
        });
        Ok(())
    }

    /// Returns an unmatured grant to the owner.
    pub fn cancel_grant<D>(
        &mut self,
        ctx: &CallContext,
        grant_id: GrantId,
        tokens: &mut D,
    ) -> Result<(), VaultError>
    where
        D: TokenDirectory + ?Sized,
    {
        self.ensure_owner(&ctx.caller)?;
        let grant = self.count_to_grant(grant_id)?.clone();
        if grant.is_unlocked(ctx.timestamp) || !grant.active {
            return Err(VaultError::CannotCancelAfterUnlock { grant_id });
        }

        let owner = self.owner;
        self.release(grant_id, &grant, &owner, tokens)?;
        debug!(vault = %self.address, grant_id, %owner, "grant cancelled");
        self.events.push(VaultEvent::GrantCancelled {
            vault: self.address,
            grant_id,
            owner,
            amount: grant.amount,
        });
        Ok(())
    }

    pub fn snapshot(&self) -> VaultSnapshot {
        VaultSnapshot {
            address: self.address,
            owner: self.owner,
            grant_count: self.grant_count(),
            grants: self.grants.clone(),
            merkle_root: compute_merkle_root(&self.owner, &self.grants),
        }
    }

    fn ensure_owner(&self, caller: &Address) -> Result<(), VaultError> {
        if *caller != self.owner {
            return Err(VaultError::NotOwner { caller: *caller });
        }
        Ok(())
    }

    // The outbound transfer runs first; the grant is only deactivated once it
    // has gone through, so a failing ledger leaves the grant active.
    fn release<D>(
        &mut self,
        grant_id: GrantId,
        grant: &Grant,
        to: &Address,
        tokens: &mut D,
    ) -> Result<(), VaultError>
    where
        D: TokenDirectory + ?Sized,
    {
        let ledger = tokens
            .token_mut(&grant.token)
            .ok_or(VaultError::UnknownToken { token: grant.token })?;
        ledger.transfer(&self.address, to, grant.amount)?;
        let idx = grant_id as usize;
        self.grants[idx].active = false;
        Ok(())
    }
}

fn compute_merkle_root(owner: &Address, grants: &[Grant]) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::with_capacity(grants.len() + 1);
    let mut hasher = Sha256::new();
    hasher.update(b"owner");
    hasher.update(owner.as_bytes());
    leaves.push(hasher.finalize().into());
    for (idx, grant) in grants.iter().enumerate() {
        let mut hasher = Sha256::new();
        hasher.update(b"grant");
        hasher.update((idx as u64).to_le_bytes());
        hasher.update(grant.recipient.as_bytes());
        hasher.update(grant.amount.to_le_bytes());
        hasher.update(grant.unlock_timestamp.to_le_bytes());
        hasher.update(grant.token.as_bytes());
        hasher.update([grant.active as u8]);
        leaves.push(hasher.finalize().into());
    }
    build_merkle(leaves)
}

#[cfg(test)]
mod tests {
    use super::*;

    const E18: Amount = 1_000_000_000_000_000_000;
    const UNLOCK: Timestamp = 1_657_606_008;

    fn addr(label: &str) -> Address {
        Address::from_label(label)
    }

    fn setup() -> (GrantVault, AccountLedger) {
        let mut token = AccountLedger::new(addr("token"), "token", "TKN");
        token.mint(&addr("owner"), 100 * E18).unwrap();
        token.mint(&addr("stranger"), 100 * E18).unwrap();
        let vault = GrantVault::new(addr("vault"), addr("owner"));
        token.approve(&addr("owner"), &vault.address(), 10 * E18);
        (vault, token)
    }

    fn at(caller: &str, timestamp: Timestamp) -> CallContext {
        CallContext::new(addr(caller), timestamp)
    }

    fn create(
        vault: &mut GrantVault,
        token: &mut AccountLedger,
        caller: &str,
        amount: Amount,
        recipient: Address,
        token_ref: &str,
    ) -> Result<GrantId, VaultError> {
        vault.create_grant(&at(caller, 0), amount, UNLOCK, recipient, addr(token_ref), token)
    }

    #[test]
    fn create_grant_escrows_funds() {
        let (mut vault, mut token) = setup();
        let id = create(&mut vault, &mut token, "owner", 2 * E18, addr("recipient"), "token")
            .unwrap();
        assert_eq!(id, 0);
        assert_eq!(vault.grant_count(), 1);
        let grant = vault.count_to_grant(0).unwrap();
        assert_eq!(grant.recipient, addr("recipient"));
        assert_eq!(grant.amount, 2 * E18);
        assert_eq!(grant.unlock_timestamp, UNLOCK);
        assert_eq!(grant.token, addr("token"));
        assert!(grant.active);
        assert_eq!(token.balance_of(&vault.address()), 2 * E18);
        assert_eq!(token.balance_of(&addr("owner")), 98 * E18);
        assert_eq!(token.allowance(&addr("owner"), &vault.address()), 8 * E18);
        assert_eq!(vault.escrowed(&addr("token")), 2 * E18);
    }

    #[test]
    fn only_owner_creates_grants() {
        let (mut vault, mut token) = setup();
        token.approve(&addr("stranger"), &vault.address(), 10 * E18);
        let err = create(&mut vault, &mut token, "stranger", 2 * E18, addr("recipient"), "token")
            .unwrap_err();
        assert_eq!(err.to_string(), "Not owner");
        assert_eq!(vault.grant_count(), 0);
    }

    #[test]
    fn vault_cannot_be_recipient() {
        let (mut vault, mut token) = setup();
        let own = vault.address();
        let err = create(&mut vault, &mut token, "owner", 2 * E18, own, "token")
            .unwrap_err();
        assert_eq!(err.to_string(), "This contract cannot be the recipient");
    }

    #[test]
    fn ledger_errors_pass_through_unchanged() {
        let (mut vault, mut token) = setup();
        let before = token.snapshot();
        let err = create(&mut vault, &mut token, "owner", 20 * E18, addr("recipient"), "token")
            .unwrap_err();
        assert_eq!(err.to_string(), "ERC20: insufficient-allowance");
        assert_eq!(err.code(), "InsufficientAllowance");
        assert_eq!(token.snapshot(), before);
        assert_eq!(vault.grant_count(), 0);
        assert!(vault.events().is_empty());
    }

    #[test]
    fn unknown_token_is_rejected() {
        let (mut vault, mut token) = setup();
        let err = create(&mut vault, &mut token, "owner", E18, addr("recipient"), "other")
            .unwrap_err();
        assert!(matches!(err, VaultError::UnknownToken { .. }));
    }

    #[test]
    fn withdraw_follows_maturity() {
        let (mut vault, mut token) = setup();
        let id = create(&mut vault, &mut token, "owner", 2 * E18, addr("recipient"), "token")
            .unwrap();

        let err = vault
            .withdraw_grant(&at("recipient", UNLOCK - 1), id, &mut token)
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot withdraw");

        let err = vault
            .withdraw_grant(&at("stranger", UNLOCK + 1), id, &mut token)
            .unwrap_err();
        assert_eq!(err.to_string(), "Not recipient address");

        vault
            .withdraw_grant(&at("recipient", UNLOCK), id, &mut token)
            .unwrap();
        assert!(!vault.count_to_grant(id).unwrap().active);
        assert_eq!(token.balance_of(&addr("recipient")), 2 * E18);
        assert_eq!(token.balance_of(&vault.address()), 0);

        let err = vault
            .withdraw_grant(&at("recipient", UNLOCK + 10), id, &mut token)
            .unwrap_err();
        assert!(matches!(err, VaultError::CannotWithdraw { .. }));
        assert_eq!(token.balance_of(&addr("recipient")), 2 * E18);
    }

    #[test]
    fn cancel_returns_funds_once() {
        let (mut vault, mut token) = setup();
        let id = create(&mut vault, &mut token, "owner", 3 * E18, addr("recipient"), "token")
            .unwrap();

        let err = vault
            .cancel_grant(&at("stranger", 0), id, &mut token)
            .unwrap_err();
        assert_eq!(err.to_string(), "Not owner");

        vault.cancel_grant(&at("owner", UNLOCK - 1), id, &mut token).unwrap();
        assert!(!vault.count_to_grant(id).unwrap().active);
        assert_eq!(token.balance_of(&addr("owner")), 100 * E18);
        assert_eq!(token.balance_of(&vault.address()), 0);

        let err = vault
            .cancel_grant(&at("owner", UNLOCK - 1), id, &mut token)
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot cancel after unlock");

        // a cancelled grant never pays out, even after maturity
        let err = vault
            .withdraw_grant(&at("recipient", UNLOCK), id, &mut token)
            .unwrap_err();
        assert!(matches!(err, VaultError::CannotWithdraw { .. }));
    }

    #[test]
    fn cancel_at_unlock_is_refused() {
        let (mut vault, mut token) = setup();
        let id = create(&mut vault, &mut token, "owner", E18, addr("recipient"), "token")
            .unwrap();
        let err = vault
            .cancel_grant(&at("owner", UNLOCK), id, &mut token)
            .unwrap_err();
        assert!(matches!(err, VaultError::CannotCancelAfterUnlock { grant_id: 0 }));
        assert!(vault.count_to_grant(id).unwrap().active);
    }

    #[test]
    fn out_of_range_grant_is_unknown() {
        let (mut vault, mut token) = setup();
        assert!(matches!(
            vault.count_to_grant(3),
            Err(VaultError::UnknownGrant { grant_id: 3 })
        ));
        let err = vault
            .withdraw_grant(&at("recipient", UNLOCK), 3, &mut token)
            .unwrap_err();
        assert_eq!(err.code(), "UnknownGrant");
    }

    #[test]
    fn failed_payout_keeps_grant_active() {
        let (mut vault, mut token) = setup();
        let id = create(&mut vault, &mut token, "owner", E18, addr("recipient"), "token")
            .unwrap();
        let mut other = AccountLedger::new(addr("other"), "other", "OTH");
        let err = vault
            .withdraw_grant(&at("recipient", UNLOCK), id, &mut other)
            .unwrap_err();
        assert!(matches!(err, VaultError::UnknownToken { .. }));
        assert!(vault.count_to_grant(id).unwrap().active);
        assert_eq!(vault.escrowed(&addr("token")), E18);
    }

    #[test]
    fn snapshot_root_tracks_grant_state() {
        let (mut vault, mut token) = setup();
        let empty = vault.snapshot().merkle_root;
        let id = create(&mut vault, &mut token, "owner", E18, addr("recipient"), "token")
            .unwrap();
        let created = vault.snapshot();
        assert_ne!(created.merkle_root, empty);
        assert_eq!(created.grant_count, 1);
        vault.cancel_grant(&at("owner", 0), id, &mut token).unwrap();
        assert_ne!(vault.snapshot().merkle_root, created.merkle_root);
        assert_eq!(vault.drain_events().len(), 2);
    }
}
