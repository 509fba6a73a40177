//! Cached wallet balances: incremental projection of UTXO deltas and full
//! reconciliation against the unspent set.

use std::collections::{BTreeMap, HashMap};

use ledgerd_params::money::Amount;
use ledgerd_primitives::{address_key, AddressKey};
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};
use rayon::prelude::*;

use crate::error::ChainStateError;
use crate::utxo::UtxoEntry;
use crate::wallet::{WalletId, WalletRegistry};

/// Net value change per address accumulated while applying or reverting a block.
#[derive(Debug, Default)]
pub struct AddressDeltas {
    deltas: HashMap<AddressKey, Amount>,
}

impl AddressDeltas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credit(&mut self, address: &str, value: Amount) -> Result<(), ChainStateError> {
        self.add(address_key(address), value)
    }

    pub fn debit(&mut self, address: &str, value: Amount) -> Result<(), ChainStateError> {
        self.add(address_key(address), -value)
    }

    fn add(&mut self, key: AddressKey, value: Amount) -> Result<(), ChainStateError> {
        let slot = self.deltas.entry(key).or_insert(0);
        *slot = slot
            .checked_add(value)
            .ok_or(ChainStateError::ValueOutOfRange)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

/// A wallet whose cached balance would have gone negative and was clamped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BalanceDrift {
    pub wallet: WalletId,
    pub unclamped: Amount,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BalanceCorrection {
    pub wallet: WalletId,
    pub cached: Amount,
    pub actual: Amount,
}

/// Folds address deltas into the owning wallets' cached balances.
///
/// Balances are clamped at zero; every clamp is reported so the caller can
/// schedule a reconciliation.
pub fn project<S: KeyValueStore>(
    store: &S,
    deltas: &AddressDeltas,
    batch: &mut WriteBatch,
) -> Result<Vec<BalanceDrift>, ChainStateError> {
    if deltas.is_empty() {
        return Ok(Vec::new());
    }
    let registry = WalletRegistry::new(store);
    let mut per_wallet: BTreeMap<WalletId, Amount> = BTreeMap::new();
    for (key, delta) in &deltas.deltas {
        if *delta == 0 {
            continue;
        }
        if let Some(owner) = registry.owner_by_key(key)? {
            let slot = per_wallet.entry(owner.wallet).or_insert(0);
            *slot = slot
                .checked_add(*delta)
                .ok_or(ChainStateError::ValueOutOfRange)?;
        }
    }

    let mut drift = Vec::new();
    for (wallet, delta) in per_wallet {
        let cached = registry.balance(wallet)?.unwrap_or(0);
        let next = cached
            .checked_add(delta)
            .ok_or(ChainStateError::ValueOutOfRange)?;
        if next < 0 {
            ledgerd_log::log_warn!(
                "wallet {wallet} balance would drop to {next}; clamping to zero"
            );
            drift.push(BalanceDrift {
                wallet,
                unclamped: next,
            });
            registry.set_balance(batch, wallet, 0);
        } else {
            registry.set_balance(batch, wallet, next);
        }
    }
    Ok(drift)
}

/// Sum of unspent values per wallet, computed from the UTXO column.
pub fn actual_balances<S: KeyValueStore>(
    store: &S,
) -> Result<HashMap<WalletId, Amount>, ChainStateError> {
    let registry = WalletRegistry::new(store);
    let owners: HashMap<AddressKey, WalletId> = registry.address_owners()?.into_iter().collect();
    if owners.is_empty() {
        return Ok(HashMap::new());
    }
    let rows = store.scan_prefix(Column::Utxo, &[])?;
    rows.par_iter()
        .try_fold(HashMap::new, |mut acc: HashMap<WalletId, Amount>, (_, value)| {
            let entry = UtxoEntry::decode(value)?;
            if let Some(wallet) = owners.get(&address_key(&entry.address)) {
                let slot = acc.entry(*wallet).or_insert(0);
                *slot = slot
                    .checked_add(entry.value)
                    .ok_or(ChainStateError::ValueOutOfRange)?;
            }
            Ok(acc)
        })
        .try_reduce(HashMap::new, |mut left, right| {
            for (wallet, value) in right {
                let slot = left.entry(wallet).or_insert(0);
                *slot = slot
                    .checked_add(value)
                    .ok_or(ChainStateError::ValueOutOfRange)?;
            }
            Ok(left)
        })
}

/// Compares every cached balance against the UTXO set and stages rewrites for
/// the ones that differ.
pub fn reconcile<S: KeyValueStore>(
    store: &S,
    batch: &mut WriteBatch,
) -> Result<Vec<BalanceCorrection>, ChainStateError> {
    let registry = WalletRegistry::new(store);
    let actual = actual_balances(store)?;
    let mut corrections = Vec::new();
    for wallet in registry.all()? {
        let cached = registry.balance(wallet.id)?.unwrap_or(0);
        let expected = actual.get(&wallet.id).copied().unwrap_or(0);
        if cached != expected {
            registry.set_balance(batch, wallet.id, expected);
            corrections.push(BalanceCorrection {
                wallet: wallet.id,
                cached,
                actual: expected,
            });
        }
    }
    Ok(corrections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::{WalletAddress, WalletRecord};
    use ledgerd_primitives::OutPoint;
    use ledgerd_storage::memory::MemoryStore;

    fn setup() -> MemoryStore {
        let store = MemoryStore::new();
        let registry = WalletRegistry::new(&store);
        let mut batch = WriteBatch::new();
        registry.create(
            &mut batch,
            &WalletRecord {
                id: 1,
                name: "w".to_string(),
                created_at: 0,
            },
        );
        registry.add_address(
            &mut batch,
            &WalletAddress {
                wallet: 1,
                address: "alice".to_string(),
                is_change: false,
            },
        );
        store.write_batch(&batch).expect("commit");
        store
    }

    #[test]
    fn projection_clamps_and_reports_drift() {
        let store = setup();
        let mut deltas = AddressDeltas::new();
        deltas.credit("alice", 30).expect("credit");
        deltas.credit("stranger", 99).expect("credit");
        let mut batch = WriteBatch::new();
        assert!(project(&store, &deltas, &mut batch).expect("project").is_empty());
        store.write_batch(&batch).expect("commit");
        assert_eq!(WalletRegistry::new(&store).balance(1).expect("bal"), Some(30));

        let mut deltas = AddressDeltas::new();
        deltas.debit("alice", 45).expect("debit");
        let mut batch = WriteBatch::new();
        let drift = project(&store, &deltas, &mut batch).expect("project");
        assert_eq!(
            drift,
            vec![BalanceDrift {
                wallet: 1,
                unclamped: -15
            }]
        );
        store.write_batch(&batch).expect("commit");
        assert_eq!(WalletRegistry::new(&store).balance(1).expect("bal"), Some(0));
    }

    #[test]
    fn reconcile_rewrites_from_utxos() {
        let store = setup();
        let mut batch = WriteBatch::new();
        for (i, value) in [12i64, 8].into_iter().enumerate() {
            batch.put(
                Column::Utxo,
                OutPoint::new([i as u8; 32], 0).key(),
                UtxoEntry {
                    value,
                    address: "alice".to_string(),
                    height: 1,
                    is_coinbase: false,
                }
                .encode(),
            );
        }
        store.write_batch(&batch).expect("seed utxos");

        let mut batch = WriteBatch::new();
        let corrections = reconcile(&store, &mut batch).expect("reconcile");
        assert_eq!(
            corrections,
            vec![BalanceCorrection {
                wallet: 1,
                cached: 0,
                actual: 20
            }]
        );
        store.write_batch(&batch).expect("commit");

        let mut batch = WriteBatch::new();
        assert!(reconcile(&store, &mut batch).expect("reconcile").is_empty());
        assert!(batch.is_empty());
    }
}
