//! Token accounting and time-locked grant escrow.
//!
//! * [`ledger`]: balances, allowances and supply for one fungible asset.
//! * [`vault`]: grants that hold tokens for an owner until a maturity
//!   timestamp, then release them to a recipient or back to the owner.
//! * [`host`]: the execution environment: a registry of deployed ledgers and
//!   vaults, a monotonic clock, atomic transaction execution and receipts.
//! * [`types`]: addresses, amounts and the per-call context.
//!
//! The vault only reaches a ledger through the [`ledger::TokenLedger`]
//! capability; ledgers know nothing about vaults.

pub mod host;
pub mod ledger;
pub mod types;
pub mod vault;

pub use host::{ExecutionValue, HostError, Outcome, Receipt, Transaction, World};
pub use ledger::{AccountLedger, LedgerError, TokenLedger};
pub use types::{Address, Amount, CallContext, GrantId, Timestamp, UNLIMITED_ALLOWANCE};
pub use vault::{Grant, GrantVault, TokenDirectory, VaultError};
