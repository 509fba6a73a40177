//! Wallet registry: wallets, their address sets and cached balances.

use ledgerd_params::money::Amount;
use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ledgerd_primitives::{address_key, AddressKey};
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainStateError;

pub type WalletId = u64;

const META_NEXT_WALLET_ID_KEY: &[u8] = b"next_wallet_id";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletRecord {
    pub id: WalletId,
    pub name: String,
    pub created_at: u64,
}

impl WalletRecord {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_str(&self.name);
        encoder.write_u64_le(self.created_at);
        encoder.into_inner()
    }

    fn decode(id: WalletId, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let name = decoder.read_var_str()?;
        let created_at = decoder.read_u64_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            id,
            name,
            created_at,
        })
    }
}

/// Owner record stored per address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletAddress {
    pub wallet: WalletId,
    pub address: String,
    pub is_change: bool,
}

impl WalletAddress {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.wallet);
        encoder.write_var_str(&self.address);
        encoder.write_bool(self.is_change);
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let wallet = decoder.read_u64_le()?;
        let address = decoder.read_var_str()?;
        let is_change = decoder.read_bool()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            wallet,
            address,
            is_change,
        })
    }
}

fn wallet_key(wallet: WalletId) -> [u8; 8] {
    wallet.to_be_bytes()
}

fn wallet_address_list_key(wallet: WalletId, address: &AddressKey) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&wallet.to_be_bytes());
    key[8..].copy_from_slice(address);
    key
}

pub struct WalletRegistry<S> {
    store: S,
}

impl<S> WalletRegistry<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> WalletRegistry<S> {
    pub fn next_id(&self) -> Result<WalletId, ChainStateError> {
        match self.store.get(Column::Meta, META_NEXT_WALLET_ID_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainStateError::CorruptIndex("invalid next wallet id"))?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(1),
        }
    }

    pub fn create(&self, batch: &mut WriteBatch, record: &WalletRecord) {
        batch.put(Column::Wallet, wallet_key(record.id), record.encode());
        batch.put(
            Column::Meta,
            META_NEXT_WALLET_ID_KEY,
            (record.id + 1).to_le_bytes(),
        );
        self.set_balance(batch, record.id, 0);
    }

    pub fn get(&self, wallet: WalletId) -> Result<Option<WalletRecord>, ChainStateError> {
        match self.store.get(Column::Wallet, &wallet_key(wallet))? {
            Some(bytes) => Ok(Some(WalletRecord::decode(wallet, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require(&self, wallet: WalletId) -> Result<WalletRecord, ChainStateError> {
        self.get(wallet)?
            .ok_or(ChainStateError::UnknownWallet(wallet))
    }

    pub fn all(&self) -> Result<Vec<WalletRecord>, ChainStateError> {
        let rows = self.store.scan_prefix(Column::Wallet, &[])?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let raw: [u8; 8] = key
                .as_slice()
                .try_into()
                .map_err(|_| ChainStateError::CorruptIndex("invalid wallet key"))?;
            out.push(WalletRecord::decode(u64::from_be_bytes(raw), &value)?);
        }
        Ok(out)
    }

    pub fn owner(&self, address: &str) -> Result<Option<WalletAddress>, ChainStateError> {
        self.owner_by_key(&address_key(address))
    }

    pub fn owner_by_key(&self, key: &AddressKey) -> Result<Option<WalletAddress>, ChainStateError> {
        match self.store.get(Column::WalletAddress, key)? {
            Some(bytes) => Ok(Some(WalletAddress::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn add_address(&self, batch: &mut WriteBatch, record: &WalletAddress) {
        let key = address_key(&record.address);
        batch.put(Column::WalletAddress, key, record.encode());
        batch.put(
            Column::WalletAddressList,
            wallet_address_list_key(record.wallet, &key),
            [u8::from(record.is_change)],
        );
    }

    /// Addresses registered to `wallet`, ordered by address key.
    pub fn addresses(&self, wallet: WalletId) -> Result<Vec<WalletAddress>, ChainStateError> {
        let rows = self
            .store
            .scan_prefix(Column::WalletAddressList, &wallet_key(wallet))?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            let address: AddressKey = key
                .get(8..)
                .and_then(|tail| tail.try_into().ok())
                .ok_or(ChainStateError::CorruptIndex("invalid wallet address list key"))?;
            let record = self
                .owner_by_key(&address)?
                .ok_or(ChainStateError::CorruptIndex("wallet address list entry without owner"))?;
            out.push(record);
        }
        Ok(out)
    }

    /// Every registered address key with its owning wallet.
    pub fn address_owners(&self) -> Result<Vec<(AddressKey, WalletId)>, ChainStateError> {
        let rows = self.store.scan_prefix(Column::WalletAddress, &[])?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let address: AddressKey = key
                .as_slice()
                .try_into()
                .map_err(|_| ChainStateError::CorruptIndex("invalid wallet address key"))?;
            out.push((address, WalletAddress::decode(&value)?.wallet));
        }
        Ok(out)
    }

    pub fn balance(&self, wallet: WalletId) -> Result<Option<Amount>, ChainStateError> {
        let Some(bytes) = self.store.get(Column::WalletBalance, &wallet_key(wallet))? else {
            return Ok(None);
        };
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChainStateError::CorruptIndex("invalid wallet balance"))?;
        Ok(Some(i64::from_le_bytes(raw)))
    }

    pub fn set_balance(&self, batch: &mut WriteBatch, wallet: WalletId, balance: Amount) {
        batch.put(Column::WalletBalance, wallet_key(wallet), balance.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_storage::memory::MemoryStore;

    #[test]
    fn wallet_lifecycle() {
        let store = MemoryStore::new();
        let registry = WalletRegistry::new(&store);
        assert_eq!(registry.next_id().expect("id"), 1);

        let mut batch = WriteBatch::new();
        registry.create(
            &mut batch,
            &WalletRecord {
                id: 1,
                name: "savings".to_string(),
                created_at: 5,
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
        registry.add_address(
            &mut batch,
            &WalletAddress {
                wallet: 1,
                address: "alice-change".to_string(),
                is_change: true,
            },
        );
        store.write_batch(&batch).expect("commit");

        assert_eq!(registry.next_id().expect("id"), 2);
        assert_eq!(registry.balance(1).expect("balance"), Some(0));
        assert_eq!(registry.require(1).expect("wallet").name, "savings");
        assert!(matches!(
            registry.require(2),
            Err(ChainStateError::UnknownWallet(2))
        ));
        let addresses = registry.addresses(1).expect("addresses");
        assert_eq!(addresses.len(), 2);
        assert!(addresses.iter().any(|a| a.is_change && a.address == "alice-change"));
        assert_eq!(
            registry.owner("alice").expect("owner").map(|o| o.wallet),
            Some(1)
        );
        assert_eq!(registry.address_owners().expect("owners").len(), 2);
    }
}
