use std::collections::BTreeMap;

use rand::{rngs::StdRng, Rng, SeedableRng};
use vault_ledger::{
    AccountLedger, Address, Amount, GrantId, Transaction, World, UNLIMITED_ALLOWANCE,
};

const ACCOUNTS: [&str; 4] = ["owner", "alice", "bob", "carol"];

fn token() -> Address {
    Address::from_label("token")
}

fn vault() -> Address {
    Address::from_label("vault")
}

fn pick_account(rng: &mut StdRng) -> Address {
    Address::from_label(ACCOUNTS[rng.gen_range(0..ACCOUNTS.len())])
}

// Mixes the null, ledger and vault addresses in with ordinary accounts.
fn pick_destination(rng: &mut StdRng) -> Address {
    match rng.gen_range(0..10) {
        0 => Address::ZERO,
        1 => token(),
        2 => vault(),
        _ => pick_account(rng),
    }
}

fn random_transaction(rng: &mut StdRng, grant_count: u64) -> (Address, Transaction) {
    let caller = if rng.gen_bool(0.4) {
        Address::from_label("owner")
    } else {
        pick_account(rng)
    };
    let amount: Amount = rng.gen_range(0..400);
    let grant_id: GrantId = rng.gen_range(0..=grant_count);
    let tx = match rng.gen_range(0..7) {
        0 => Transaction::Mint {
            ledger: token(),
            to: pick_account(rng),
            amount: rng.gen_range(0..1_000),
        },
        1 => Transaction::Transfer {
            ledger: token(),
            to: pick_destination(rng),
            amount,
        },
        2 => Transaction::Approve {
            ledger: token(),
            spender: if rng.gen_bool(0.5) { vault() } else { pick_account(rng) },
            amount: if rng.gen_bool(0.3) { UNLIMITED_ALLOWANCE } else { amount },
        },
        3 => Transaction::TransferFrom {
            ledger: token(),
            from: pick_account(rng),
            to: pick_destination(rng),
            amount,
        },
        4 => Transaction::CreateGrant {
            vault: vault(),
            amount,
            unlock_timestamp: rng.gen_range(0..200),
            recipient: pick_destination(rng),
            token: token(),
        },
        5 => Transaction::WithdrawGrant {
            vault: vault(),
            grant_id,
        },
        _ => Transaction::CancelGrant {
            vault: vault(),
            grant_id,
        },
    };
    (caller, tx)
}

fn unlimited_pairs(world: &World) -> Vec<(Address, Address)> {
    world
        .ledger(&token())
        .unwrap()
        .snapshot()
        .allowances
        .into_iter()
        .filter(|a| a.amount == UNLIMITED_ALLOWANCE)
        .map(|a| (a.owner, a.spender))
        .collect()
}

#[test]
fn random_sequences_preserve_invariants() {
    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut world = World::new(0);
        world
            .deploy_ledger(AccountLedger::new(token(), "token", "TKN"))
            .unwrap();
        world
            .deploy_vault(vault(), Address::from_label("owner"))
            .unwrap();

        let mut settled: BTreeMap<GrantId, bool> = BTreeMap::new();
        for _ in 0..300 {
            if rng.gen_bool(0.1) {
                world.advance_time(rng.gen_range(0..30));
            }
            let unlimited_before = unlimited_pairs(&world);
            let grant_count = world.vault(&vault()).unwrap().grant_count();
            let (caller, tx) = random_transaction(&mut rng, grant_count);
            let is_approve = matches!(tx, Transaction::Approve { .. });
            let _ = world.execute(caller, tx);

            let ledger = world.ledger(&token()).unwrap();
            let snapshot = ledger.snapshot();
            let sum: Amount = snapshot.balances.values().sum();
            assert_eq!(sum, ledger.total_supply(), "seed {seed}: supply drifted");
            assert_eq!(ledger.balance_of(&Address::ZERO), 0);
            assert_eq!(ledger.balance_of(&token()), 0);

            let vault_state = world.vault(&vault()).unwrap();
            // plain transfers may top the vault up, never drain it below escrow
            assert!(
                ledger.balance_of(&vault()) >= vault_state.escrowed(&token()),
                "seed {seed}: active grants are not covered"
            );

            for (id, grant) in vault_state.grants().iter().enumerate() {
                let id = id as GrantId;
                if settled.get(&id).copied().unwrap_or(false) {
                    assert!(!grant.active, "seed {seed}: grant {id} reactivated");
                }
                settled.insert(id, !grant.active);
            }

            if !is_approve {
                for (owner, spender) in unlimited_before {
                    assert_eq!(ledger.allowance(&owner, &spender), UNLIMITED_ALLOWANCE);
                }
            }
        }
        assert_eq!(world.receipts().len(), 300);
    }
}

#[test]
fn withdraw_before_unlock_never_pays_out() {
    let mut world = World::new(10);
    world
        .deploy_ledger(AccountLedger::new(token(), "token", "TKN"))
        .unwrap();
    let owner = Address::from_label("owner");
    world.deploy_vault(vault(), owner).unwrap();
    for tx in [
        Transaction::Mint {
            ledger: token(),
            to: owner,
            amount: 50,
        },
        Transaction::Approve {
            ledger: token(),
            spender: vault(),
            amount: 50,
        },
        Transaction::CreateGrant {
            vault: vault(),
            amount: 50,
            unlock_timestamp: 100,
            recipient: Address::from_label("alice"),
            token: token(),
        },
    ] {
        world.execute(owner, tx).unwrap();
    }

    for now in [10, 50, 99] {
        world.set_time(now).unwrap();
        let err = world
            .execute(
                Address::from_label("alice"),
                Transaction::WithdrawGrant {
                    vault: vault(),
                    grant_id: 0,
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "CannotWithdraw");
        for other in ["owner", "bob"] {
            let err = world
                .execute(
                    Address::from_label(other),
                    Transaction::WithdrawGrant {
                        vault: vault(),
                        grant_id: 0,
                    },
                )
                .unwrap_err();
            assert_eq!(err.code(), "NotRecipient");
        }
    }
    assert!(world.grant(&vault(), 0).unwrap().active);
}
