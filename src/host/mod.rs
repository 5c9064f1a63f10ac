//! In-process execution environment for ledgers and vaults.
//!
//! The [`World`] runs every transaction as one atomic unit: the whole state is
//! staged before the call and restored if the call fails, so neither a ledger
//! nor a vault ever shows a partial write. Each executed transaction leaves a
//! [`Receipt`] in the journal whether it succeeded or reverted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::ledger::{build_merkle, AccountLedger, LedgerError, LedgerEvent, LedgerSnapshot};
use crate::types::{Address, AddressParseError, Amount, CallContext, GrantId, Timestamp};
use crate::vault::{Grant, GrantVault, VaultError, VaultEvent, VaultSnapshot};

mod config;

pub use config::{Genesis, LedgerConfig, Scenario, Step, VaultConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("unknown ledger {0}")]
    UnknownLedger(Address),
    #[error("unknown vault {0}")]
    UnknownVault(Address),
    #[error("address {0} is already deployed")]
    AddressInUse(Address),
    #[error("invalid address {reference:?}: {reason}")]
    InvalidAddress { reference: String, reason: String },
    #[error("clock cannot move backwards: now {now}, requested {requested}")]
    ClockRegression {
        now: Timestamp,
        requested: Timestamp,
    },
}

impl HostError {
    pub fn code(&self) -> &'static str {
        match self {
            HostError::Ledger(err) => err.code(),
            HostError::Vault(err) => err.code(),
            HostError::UnknownLedger(_) => "UnknownLedger",
            HostError::UnknownVault(_) => "UnknownVault",
            HostError::AddressInUse(_) => "AddressInUse",
            HostError::InvalidAddress { .. } => "InvalidAddress",
            HostError::ClockRegression { .. } => "ClockRegression",
        }
    }
}

/// Resolves a script account reference (label or `0x` hex).
pub fn resolve_account(reference: &str) -> Result<Address, HostError> {
    Address::resolve(reference).map_err(|err: AddressParseError| HostError::InvalidAddress {
        reference: reference.to_string(),
        reason: err.to_string(),
    })
}

/// A single call into a ledger or vault. The caller travels separately.
///
/// Scripts use `Transaction<String>` so accounts can be written as labels;
/// [`Transaction::resolve`] turns those into addresses.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transaction<A = Address> {
    Mint {
        ledger: A,
        to: A,
        amount: Amount,
    },
    Transfer {
        ledger: A,
        to: A,
        amount: Amount,
    },
    Approve {
        ledger: A,
        spender: A,
        amount: Amount,
    },
    TransferFrom {
        ledger: A,
        from: A,
        to: A,
        amount: Amount,
    },
    CreateGrant {
        vault: A,
        amount: Amount,
        unlock_timestamp: Timestamp,
        recipient: A,
        token: A,
    },
    WithdrawGrant {
        vault: A,
        grant_id: GrantId,
    },
    CancelGrant {
        vault: A,
        grant_id: GrantId,
    },
}

impl<A> Transaction<A> {
    pub fn try_map_accounts<B, E>(
        self,
        mut f: impl FnMut(A) -> Result<B, E>,
    ) -> Result<Transaction<B>, E> {
        Ok(match self {
            Transaction::Mint { ledger, to, amount } => Transaction::Mint {
                ledger: f(ledger)?,
                to: f(to)?,
                amount,
            },
            Transaction::Transfer { ledger, to, amount } => Transaction::Transfer {
                ledger: f(ledger)?,
                to: f(to)?,
                amount,
            },
            Transaction::Approve {
                ledger,
                spender,
                amount,
            } => Transaction::Approve {
                ledger: f(ledger)?,
                spender: f(spender)?,
                amount,
            },
            Transaction::TransferFrom {
                ledger,
                from,
                to,
                amount,
            } => Transaction::TransferFrom {
                ledger: f(ledger)?,
                from: f(from)?,
                to: f(to)?,
                amount,
            },
            Transaction::CreateGrant {
                vault,
                amount,
                unlock_timestamp,
                recipient,
                token,
            } => Transaction::CreateGrant {
                vault: f(vault)?,
                amount,
                unlock_timestamp,
                recipient: f(recipient)?,
                token: f(token)?,
            },
            Transaction::WithdrawGrant { vault, grant_id } => Transaction::WithdrawGrant {
                vault: f(vault)?,
                grant_id,
            },
            Transaction::CancelGrant { vault, grant_id } => Transaction::CancelGrant {
                vault: f(vault)?,
                grant_id,
            },
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transaction::Mint { .. } => "mint",
            Transaction::Transfer { .. } => "transfer",
            Transaction::Approve { .. } => "approve",
            Transaction::TransferFrom { .. } => "transfer_from",
            Transaction::CreateGrant { .. } => "create_grant",
            Transaction::WithdrawGrant { .. } => "withdraw_grant",
            Transaction::CancelGrant { .. } => "cancel_grant",
        }
    }
}

impl Transaction<String> {
    pub fn resolve(self) -> Result<Transaction<Address>, HostError> {
        self.try_map_accounts(|reference| resolve_account(&reference))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExecutionValue {
    Unit,
    Bool(bool),
    GrantId(GrantId),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { value: ExecutionValue },
    Reverted { code: String, message: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub height: u64,
    pub timestamp: Timestamp,
    pub caller: Address,
    pub transaction: Transaction,
    pub outcome: Outcome,
}

/// Externally tagged as `{"ledger": ...}` / `{"vault": ...}` so u128 amounts
/// deserialize without buffering.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorldEvent {
    Ledger(LedgerEvent),
    Vault(VaultEvent),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldSnapshot {
    pub height: u64,
    pub timestamp: Timestamp,
    pub ledgers: Vec<LedgerSnapshot>,
    pub vaults: Vec<VaultSnapshot>,
    #[serde(with = "crate::types::serde_hash")]
    pub state_root: [u8; 32],
}

#[derive(Clone, Debug, Default)]
struct WorldState {
    ledgers: BTreeMap<Address, AccountLedger>,
    vaults: BTreeMap<Address, GrantVault>,
}

impl WorldState {
    fn is_deployed(&self, address: &Address) -> bool {
        self.ledgers.contains_key(address) || self.vaults.contains_key(address)
    }

    fn ledger_mut(&mut self, address: &Address) -> Result<&mut AccountLedger, HostError> {
        self.ledgers
            .get_mut(address)
            .ok_or(HostError::UnknownLedger(*address))
    }

    fn drain_events(&mut self) -> Vec<WorldEvent> {
        let mut events: Vec<WorldEvent> = Vec::new();
        for ledger in self.ledgers.values_mut() {
            events.extend(ledger.drain_events().into_iter().map(WorldEvent::Ledger));
        }
        for vault in self.vaults.values_mut() {
            events.extend(vault.drain_events().into_iter().map(WorldEvent::Vault));
        }
        events
    }
}

#[derive(Clone, Debug, Default)]
pub struct World {
    state: WorldState,
    height: u64,
    timestamp: Timestamp,
    receipts: Vec<Receipt>,
    events: Vec<WorldEvent>,
}

impl World {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    pub fn from_genesis(genesis: &Genesis) -> Result<Self, HostError> {
        let mut world = World::new(genesis.timestamp);
        for cfg in &genesis.ledgers {
            let address = world.deploy_ledger(
                AccountLedger::new(cfg.address(), cfg.display_name(), cfg.symbol.clone())
                    .with_decimals(cfg.decimals),
            )?;
            let ledger = world.state.ledger_mut(&address)?;
            for (account, amount) in &cfg.allocations {
                ledger.mint(&resolve_account(account)?, *amount)?;
            }
        }
        for cfg in &genesis.vaults {
            world.deploy_vault(cfg.address(), resolve_account(&cfg.owner)?)?;
        }
        // genesis allocations are not part of the event log
        world.state.drain_events();
        Ok(world)
    }

    pub fn deploy_ledger(&mut self, ledger: AccountLedger) -> Result<Address, HostError> {
        let address = ledger.address();
        if address.is_zero() || self.state.is_deployed(&address) {
            return Err(HostError::AddressInUse(address));
        }
        info!(%address, symbol = ledger.symbol(), "ledger deployed");
        self.state.ledgers.insert(address, ledger);
        Ok(address)
    }

    /// Deploys an empty vault; the deployer becomes its owner.
    pub fn deploy_vault(
        &mut self,
        address: Address,
        deployer: Address,
    ) -> Result<Address, HostError> {
        if address.is_zero() || self.state.is_deployed(&address) {
            return Err(HostError::AddressInUse(address));
        }
        info!(%address, owner = %deployer, "vault deployed");
        self.state
            .vaults
            .insert(address, GrantVault::new(address, deployer));
        Ok(address)
    }

    pub fn ledger(&self, address: &Address) -> Option<&AccountLedger> {
        self.state.ledgers.get(address)
    }

    pub fn vault(&self, address: &Address) -> Option<&GrantVault> {
        self.state.vaults.get(address)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn receipts(&self) -> &[Receipt] {
        &self.receipts
    }

    pub fn events(&self) -> &[WorldEvent] {
        &self.events
    }

    pub fn set_time(&mut self, timestamp: Timestamp) -> Result<(), HostError> {
        if timestamp < self.timestamp {
            return Err(HostError::ClockRegression {
                now: self.timestamp,
                requested: timestamp,
            });
        }
        debug!(from = self.timestamp, to = timestamp, "clock set");
        self.timestamp = timestamp;
        Ok(())
    }

    pub fn advance_time(&mut self, seconds: u64) {
        self.timestamp = self.timestamp.saturating_add(seconds);
        debug!(timestamp = self.timestamp, "clock advanced");
    }

    /// Runs `transaction` on behalf of `caller` as one atomic unit.
    pub fn execute(
        &mut self,
        caller: Address,
        transaction: Transaction,
    ) -> Result<ExecutionValue, HostError> {
        let ctx = CallContext::new(caller, self.timestamp);
        let staged = self.state.clone();
        let result = self.apply(&ctx, &transaction);

        let outcome = match &result {
            Ok(value) => {
                let events = self.state.drain_events();
                debug!(
                    height = self.height,
                    %caller,
                    kind = transaction.kind(),
                    events = events.len(),
                    "transaction applied"
                );
                self.events.extend(events);
                Outcome::Success {
                    value: value.clone(),
                }
            }
            Err(err) => {
                self.state = staged;
                warn!(
                    height = self.height,
                    %caller,
                    kind = transaction.kind(),
                    code = err.code(),
                    "transaction reverted: {err}"
                );
                Outcome::Reverted {
                    code: err.code().to_string(),
                    message: err.to_string(),
                }
            }
        };

        self.receipts.push(Receipt {
            height: self.height,
            timestamp: ctx.timestamp,
            caller,
            transaction,
            outcome,
        });
        self.height += 1;
        result
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        let ledgers: Vec<LedgerSnapshot> =
            self.state.ledgers.values().map(|l| l.snapshot()).collect();
        let vaults: Vec<VaultSnapshot> =
            self.state.vaults.values().map(|v| v.snapshot()).collect();
        let mut leaves: Vec<[u8; 32]> = Vec::with_capacity(ledgers.len() + vaults.len());
        for ledger in &ledgers {
            let mut hasher = Sha256::new();
            hasher.update(b"ledger");
            hasher.update(ledger.address.as_bytes());
            hasher.update(ledger.total_supply.to_le_bytes());
            hasher.update(ledger.merkle_root);
            leaves.push(hasher.finalize().into());
        }
        for vault in &vaults {
            let mut hasher = Sha256::new();
            hasher.update(b"vault");
            hasher.update(vault.address.as_bytes());
            hasher.update(vault.merkle_root);
            leaves.push(hasher.finalize().into());
        }
        WorldSnapshot {
            height: self.height,
            timestamp: self.timestamp,
            ledgers,
            vaults,
            state_root: build_merkle(leaves),
        }
    }

    fn apply(
        &mut self,
        ctx: &CallContext,
        transaction: &Transaction,
    ) -> Result<ExecutionValue, HostError> {
        let state = &mut self.state;
        let value = match transaction {
            Transaction::Mint { ledger, to, amount } => {
                state.ledger_mut(ledger)?.mint(to, *amount)?;
                ExecutionValue::Unit
            }
            Transaction::Transfer { ledger, to, amount } => {
                let ok = state.ledger_mut(ledger)?.transfer(&ctx.caller, to, *amount)?;
                ExecutionValue::Bool(ok)
            }
            Transaction::Approve {
                ledger,
                spender,
                amount,
            } => ExecutionValue::Bool(state.ledger_mut(ledger)?.approve(
                &ctx.caller,
                spender,
                *amount,
            )),
            Transaction::TransferFrom {
                ledger,
                from,
                to,
                amount,
            } => ExecutionValue::Bool(state.ledger_mut(ledger)?.transfer_from(
                &ctx.caller,
                from,
                to,
                *amount,
            )?),
            Transaction::CreateGrant {
                vault,
                amount,
                unlock_timestamp,
                recipient,
                token,
            } => {
                let vault = state
                    .vaults
                    .get_mut(vault)
                    .ok_or(HostError::UnknownVault(*vault))?;
                let grant_id = vault.create_grant(
                    ctx,
                    *amount,
                    *unlock_timestamp,
                    *recipient,
                    *token,
                    &mut state.ledgers,
                )?;
                ExecutionValue::GrantId(grant_id)
            }
            Transaction::WithdrawGrant { vault, grant_id } => {
                let vault = state
                    .vaults
                    .get_mut(vault)
                    .ok_or(HostError::UnknownVault(*vault))?;
                vault.withdraw_grant(ctx, *grant_id, &mut state.ledgers)?;
                ExecutionValue::Unit
            }
            Transaction::CancelGrant { vault, grant_id } => {
                let vault = state
                    .vaults
                    .get_mut(vault)
                    .ok_or(HostError::UnknownVault(*vault))?;
                vault.cancel_grant(ctx, *grant_id, &mut state.ledgers)?;
                ExecutionValue::Unit
            }
        };
        Ok(value)
    }

    /// Replays a scenario's steps. Reverted transactions are recorded and
    /// skipped unless `fail_fast` is set.
    pub fn run_steps(&mut self, steps: &[Step], fail_fast: bool) -> Result<(), HostError> {
        for step in steps {
            match step {
                Step::Execute {
                    caller,
                    transaction,
                } => {
                    let caller = resolve_account(caller)?;
                    let result = self.execute(caller, transaction.clone().resolve()?);
                    if fail_fast {
                        result?;
                    }
                }
                Step::AdvanceTime { seconds } => self.advance_time(*seconds),
                Step::SetTime { timestamp } => self.set_time(*timestamp)?,
            }
        }
        Ok(())
    }

    /// Grant record lookup through the host, for callers holding only addresses.
    pub fn grant(&self, vault: &Address, grant_id: GrantId) -> Result<&Grant, HostError> {
        let vault = self.vault(vault).ok_or(HostError::UnknownVault(*vault))?;
        Ok(vault.count_to_grant(grant_id)?)
    }
}
