//! In-memory mirror of the output tables.

//---------------------------------------------------------------------------------------------------- Import
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    hash::Hash,
};

use redb::{ReadableMultimapTable, ReadableTable};

use crate::{
    error::{DbResult, RuntimeError},
    storable::{Storable, StorableRedb},
    tables::{
        ACCOUNTS, CONFIG, GENERATION, KEYS, NYMS, OUTPUTS, OUTPUT_PROPOSAL, POSITIONS,
        PROPOSAL_CONSUMED, PROPOSAL_CREATED, STATES, SUBCHAINS,
    },
    types::{
        decode_position, AccountId, BlockHeight, ConfigKey, KeyId, NymId, Outpoint, Output,
        Position, ProposalId, SubchainId, TxoState,
    },
};

//---------------------------------------------------------------------------------------------------- IndexKey
/// A key of one of the `key -> {outpoint}` indices.
///
/// Maps the in-memory key onto the key stored in the table.
pub(crate) trait IndexKey: Copy + Ord + Hash {
    /// The table key type.
    type Durable: Storable + Copy + 'static;

    /// The table key of `self`.
    fn durable(self) -> Self::Durable;

    /// Recover the in-memory key, [`None`] if the stored key is invalid.
    fn from_durable(durable: Self::Durable) -> Option<Self>;
}

/// Implement [`IndexKey`] for types stored as themselves.
macro_rules! impl_index_key_identity {
    ($($t:ty),* $(,)?) => {
        $(
            impl IndexKey for $t {
                type Durable = Self;

                #[inline]
                fn durable(self) -> Self {
                    self
                }

                #[inline]
                fn from_durable(durable: Self) -> Option<Self> {
                    Some(durable)
                }
            }
        )*
    };
}

// `AccountId`, `NymId` and `ProposalId` are all `[u8; 32]`.
impl_index_key_identity!([u8; 32], KeyId, Position, SubchainId);

impl IndexKey for TxoState {
    type Durable = u8;

    #[inline]
    fn durable(self) -> u8 {
        self.to_u8()
    }

    #[inline]
    fn from_durable(durable: u8) -> Option<Self> {
        Self::try_from(durable).ok()
    }
}

//---------------------------------------------------------------------------------------------------- OutpointIndex
/// Returned for keys that have no outpoints.
pub(crate) static EMPTY: BTreeSet<Outpoint> = BTreeSet::new();

/// A `key -> {outpoint}` map.
///
/// Empty sets are never kept, so the map always
/// equals what a fresh load from the tables returns.
pub(crate) trait OutpointIndex<K> {
    /// Add `outpoint` under `key`, returns `false` if it already was.
    fn add(&mut self, key: K, outpoint: Outpoint) -> bool;

    /// Remove `outpoint` from under `key`, returns `false` if it was not there.
    fn remove_member(&mut self, key: &K, outpoint: &Outpoint) -> bool;

    /// The outpoints under `key`.
    fn members(&self, key: &K) -> &BTreeSet<Outpoint>;
}

impl<K: Eq + Hash> OutpointIndex<K> for HashMap<K, BTreeSet<Outpoint>> {
    fn add(&mut self, key: K, outpoint: Outpoint) -> bool {
        self.entry(key).or_default().insert(outpoint)
    }

    fn remove_member(&mut self, key: &K, outpoint: &Outpoint) -> bool {
        let Some(set) = self.get_mut(key) else {
            return false;
        };
        let removed = set.remove(outpoint);
        if set.is_empty() {
            self.remove(key);
        }
        removed
    }

    fn members(&self, key: &K) -> &BTreeSet<Outpoint> {
        self.get(key).unwrap_or(&EMPTY)
    }
}

impl<K: Ord> OutpointIndex<K> for BTreeMap<K, BTreeSet<Outpoint>> {
    fn add(&mut self, key: K, outpoint: Outpoint) -> bool {
        self.entry(key).or_default().insert(outpoint)
    }

    fn remove_member(&mut self, key: &K, outpoint: &Outpoint) -> bool {
        let Some(set) = self.get_mut(key) else {
            return false;
        };
        let removed = set.remove(outpoint);
        if set.is_empty() {
            self.remove(key);
        }
        removed
    }

    fn members(&self, key: &K) -> &BTreeSet<Outpoint> {
        self.get(key).unwrap_or(&EMPTY)
    }
}

//---------------------------------------------------------------------------------------------------- Indices
/// Everything the output tables hold, in memory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Indices {
    pub(crate) outputs: HashMap<Outpoint, Output>,
    pub(crate) accounts: HashMap<AccountId, BTreeSet<Outpoint>>,
    pub(crate) keys: HashMap<KeyId, BTreeSet<Outpoint>>,
    pub(crate) nyms: HashMap<NymId, BTreeSet<Outpoint>>,
    pub(crate) positions: BTreeMap<Position, BTreeSet<Outpoint>>,
    pub(crate) states: HashMap<TxoState, BTreeSet<Outpoint>>,
    pub(crate) subchains: HashMap<SubchainId, BTreeSet<Outpoint>>,
    pub(crate) generation: BTreeMap<BlockHeight, BTreeSet<Outpoint>>,
    pub(crate) output_proposal: HashMap<Outpoint, ProposalId>,
    pub(crate) created: HashMap<ProposalId, BTreeSet<Outpoint>>,
    pub(crate) consumed: HashMap<ProposalId, BTreeSet<Outpoint>>,
    pub(crate) wallet_tip: Option<Position>,
}

/// Load every table through a read-only or read/write transaction.
///
/// Both transaction types expose the same `open_*` functions,
/// only the returned table types differ.
macro_rules! load_indices {
    ($tx:expr) => {{
        let tx = $tx;
        Ok(Indices {
            outputs: load_outputs(&tx.open_table(OUTPUTS)?)?,
            accounts: load_index::<AccountId, _, _>(&tx.open_multimap_table(ACCOUNTS)?)?,
            keys: load_index::<KeyId, _, _>(&tx.open_multimap_table(KEYS)?)?,
            nyms: load_index::<NymId, _, _>(&tx.open_multimap_table(NYMS)?)?,
            positions: load_index::<Position, _, _>(&tx.open_multimap_table(POSITIONS)?)?,
            states: load_index::<TxoState, _, _>(&tx.open_multimap_table(STATES)?)?,
            subchains: load_index::<SubchainId, _, _>(&tx.open_multimap_table(SUBCHAINS)?)?,
            generation: load_generation(&tx.open_multimap_table(GENERATION)?)?,
            output_proposal: load_output_proposal(&tx.open_table(OUTPUT_PROPOSAL)?)?,
            created: load_index::<ProposalId, _, _>(&tx.open_multimap_table(PROPOSAL_CREATED)?)?,
            consumed: load_index::<ProposalId, _, _>(&tx.open_multimap_table(PROPOSAL_CONSUMED)?)?,
            wallet_tip: load_wallet_tip(&tx.open_table(CONFIG)?)?,
        })
    }};
}

impl Indices {
    /// Load from committed data.
    pub(crate) fn load(tx_ro: &redb::ReadTransaction) -> DbResult<Self> {
        load_indices!(tx_ro)
    }

    /// Load from the state of a write transaction,
    /// including anything it has not committed yet.
    pub(crate) fn load_rw(tx_rw: &redb::WriteTransaction) -> DbResult<Self> {
        load_indices!(tx_rw)
    }
}

//---------------------------------------------------------------------------------------------------- Loaders
/// Load one `key -> {outpoint}` table.
fn load_index<K, T, C>(table: &T) -> DbResult<C>
where
    K: IndexKey,
    T: ReadableMultimapTable<StorableRedb<K::Durable>, StorableRedb<Outpoint>>,
    C: FromIterator<(K, BTreeSet<Outpoint>)>,
{
    table
        .iter()?
        .map(|entry| -> DbResult<(K, BTreeSet<Outpoint>)> {
            let (key, values) = entry?;
            let durable = key.value();
            let key = K::from_durable(durable)
                .ok_or_else(|| RuntimeError::Corrupt(format!("invalid index key: {durable:?}")))?;
            let set = values
                .map(|value| value.map(|v| v.value()))
                .collect::<Result<BTreeSet<Outpoint>, redb::StorageError>>()?;
            Ok((key, set))
        })
        .collect()
}

/// Load the height ordered generation table.
fn load_generation<T>(table: &T) -> DbResult<BTreeMap<BlockHeight, BTreeSet<Outpoint>>>
where
    T: ReadableMultimapTable<u64, StorableRedb<Outpoint>>,
{
    table
        .iter()?
        .map(|entry| -> DbResult<(BlockHeight, BTreeSet<Outpoint>)> {
            let (height, values) = entry?;
            let set = values
                .map(|value| value.map(|v| v.value()))
                .collect::<Result<BTreeSet<Outpoint>, redb::StorageError>>()?;
            Ok((height.value(), set))
        })
        .collect()
}

/// Load and decode every stored output.
fn load_outputs<T>(table: &T) -> DbResult<HashMap<Outpoint, Output>>
where
    T: ReadableTable<StorableRedb<Outpoint>, &'static [u8]>,
{
    table
        .iter()?
        .map(|entry| -> DbResult<(Outpoint, Output)> {
            let (outpoint, blob) = entry?;
            let outpoint = outpoint.value();
            let output = Output::from_bytes(blob.value())
                .map_err(|e| RuntimeError::Corrupt(format!("output {outpoint}: {e}")))?;
            Ok((outpoint, output))
        })
        .collect()
}

fn load_output_proposal<T>(table: &T) -> DbResult<HashMap<Outpoint, ProposalId>>
where
    T: ReadableTable<StorableRedb<Outpoint>, StorableRedb<ProposalId>>,
{
    table
        .iter()?
        .map(|entry| -> DbResult<(Outpoint, ProposalId)> {
            let (outpoint, proposal) = entry?;
            Ok((outpoint.value(), proposal.value()))
        })
        .collect()
}

fn load_wallet_tip<T>(table: &T) -> DbResult<Option<Position>>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    let Some(row) = table.get(ConfigKey::WalletTip.key())? else {
        return Ok(None);
    };

    decode_position(row.value())
        .map(Some)
        .ok_or_else(|| RuntimeError::Corrupt("invalid wallet tip row".to_string()))
}
