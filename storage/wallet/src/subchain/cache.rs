//! Subchain cache.
//!
//! In-memory mirror of the subchain tables. Every sub-index sits
//! behind its own [`RwLock`] and is filled lazily, one key at a time,
//! on first read.
//!
//! Writes go through the caller's [`WriteTransaction`]. A write to a
//! key that is not loaded yet loads it from that transaction first,
//! so the mirror never holds a partial set.

//---------------------------------------------------------------------------------------------------- Import
use std::{
    collections::{hash_map::Entry, BTreeSet, HashMap},
    hash::Hash,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use redb::{ReadableMultimapTable, ReadableTable, WriteTransaction};
use tracing::trace;

use crate::{
    env::ConcreteEnv,
    error::{DbResult, RuntimeError},
    storable::StorableRedb,
    tables::{
        SUBCHAIN_IDS, SUBCHAIN_LAST_INDEXED, SUBCHAIN_LAST_SCANNED, SUBCHAIN_PATTERNS,
        WALLET_PATTERNS,
    },
    types::{
        Bip32Index, ElementId, FilterType, Pattern, Position, SubaccountId, SubchainId,
        SubchainIndex, SubchainRole, VersionNumber,
    },
};

use super::id::index_id;

//---------------------------------------------------------------------------------------------------- Locks
// The mirror is re-derivable from the tables,
// a panic while holding a lock does not make it unusable.

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Read `key` from `mirror`, calling `load` on a miss.
///
/// `load` runs without holding the lock. A value written in the
/// meantime is newer than the loaded one and is kept.
fn read_through<K, V>(
    mirror: &RwLock<HashMap<K, V>>,
    key: &K,
    load: impl FnOnce() -> DbResult<Option<V>>,
) -> DbResult<Option<V>>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    if let Some(value) = read(mirror).get(key) {
        return Ok(Some(*value));
    }

    let Some(value) = load()? else {
        return Ok(None);
    };
    Ok(Some(*write(mirror).entry(*key).or_insert(value)))
}

//---------------------------------------------------------------------------------------------------- SubchainCache
/// Pattern index and scan cursors of every subchain.
#[derive(Debug)]
pub(crate) struct SubchainCache {
    env: Arc<ConcreteEnv>,

    /// `subchain_ids`
    ids: RwLock<HashMap<SubchainId, SubchainIndex>>,
    /// `subchain_last_indexed`
    last_indexed: RwLock<HashMap<SubchainId, Bip32Index>>,
    /// `subchain_last_scanned`
    last_scanned: RwLock<HashMap<SubchainId, Position>>,
    /// `wallet_patterns`
    patterns: RwLock<HashMap<ElementId, BTreeSet<Pattern>>>,
    /// `subchain_patterns`
    pattern_index: RwLock<HashMap<SubchainId, BTreeSet<ElementId>>>,
}

impl SubchainCache {
    pub(crate) fn new(env: Arc<ConcreteEnv>) -> Self {
        Self {
            env,
            ids: RwLock::default(),
            last_indexed: RwLock::default(),
            last_scanned: RwLock::default(),
            patterns: RwLock::default(),
            pattern_index: RwLock::default(),
        }
    }

    /// Drop everything in memory.
    pub(crate) fn clear(&self) {
        write(&self.ids).clear();
        write(&self.last_indexed).clear();
        write(&self.last_scanned).clear();
        write(&self.patterns).clear();
        write(&self.pattern_index).clear();
        trace!("cleared subchain cache");
    }

    //------------------------------------------------------------------------------------------------ IDs
    /// Resolve the ID of a subchain, storing its decode row if it is new.
    pub(crate) fn get_index(
        &self,
        subaccount: SubaccountId,
        role: SubchainRole,
        filter: FilterType,
        version: VersionNumber,
        tx: &WriteTransaction,
    ) -> DbResult<SubchainId> {
        let index = SubchainIndex::new(subaccount, role, filter, version);
        let id = index_id(&index);

        let mut ids = write(&self.ids);
        if !ids.contains_key(&id) {
            tx.open_table(SUBCHAIN_IDS)?.insert(id, index)?;
            ids.insert(id, index);
            trace!(%id, ?role, ?filter, version, "registered subchain");
        }

        Ok(id)
    }

    /// The components `id` was derived from.
    pub(crate) fn decode(&self, id: &SubchainId) -> DbResult<Option<SubchainIndex>> {
        read_through(&self.ids, id, || {
            let tx_ro = self.env.tx_ro()?;
            let index = tx_ro.open_table(SUBCHAIN_IDS)?.get(id)?.map(|row| row.value());
            Ok(index)
        })
    }

    //------------------------------------------------------------------------------------------------ Cursors
    /// The highest derivation index with patterns.
    pub(crate) fn get_last_indexed(&self, id: &SubchainId) -> DbResult<Option<Bip32Index>> {
        read_through(&self.last_indexed, id, || {
            let tx_ro = self.env.tx_ro()?;
            let index = tx_ro
                .open_table(SUBCHAIN_LAST_INDEXED)?
                .get(id)?
                .map(|row| row.value());
            Ok(index)
        })
    }

    pub(crate) fn set_last_indexed(
        &self,
        id: &SubchainId,
        index: Bip32Index,
        tx: &WriteTransaction,
    ) -> DbResult<()> {
        let mut last_indexed = write(&self.last_indexed);
        tx.open_table(SUBCHAIN_LAST_INDEXED)?.insert(id, index)?;
        last_indexed.insert(*id, index);
        Ok(())
    }

    /// The position scanning has reached.
    pub(crate) fn get_last_scanned(&self, id: &SubchainId) -> DbResult<Option<Position>> {
        read_through(&self.last_scanned, id, || {
            let tx_ro = self.env.tx_ro()?;
            let position = tx_ro
                .open_table(SUBCHAIN_LAST_SCANNED)?
                .get(id)?
                .map(|row| row.value());
            Ok(position)
        })
    }

    pub(crate) fn set_last_scanned(
        &self,
        id: &SubchainId,
        position: Position,
        tx: &WriteTransaction,
    ) -> DbResult<()> {
        let mut last_scanned = write(&self.last_scanned);
        tx.open_table(SUBCHAIN_LAST_SCANNED)?.insert(id, position)?;
        last_scanned.insert(*id, position);
        Ok(())
    }

    //------------------------------------------------------------------------------------------------ Patterns
    /// Register one pattern of `element`.
    pub(crate) fn add_pattern(
        &self,
        element: &ElementId,
        index: Bip32Index,
        data: &[u8],
        tx: &WriteTransaction,
    ) -> DbResult<()> {
        let pattern = Pattern::new(index, data.to_vec());

        let mut patterns = write(&self.patterns);
        let mut table = tx.open_multimap_table(WALLET_PATTERNS)?;
        table.insert(element, pattern.to_row().as_slice())?;

        match patterns.entry(*element) {
            Entry::Occupied(mut e) => {
                e.get_mut().insert(pattern);
            }
            Entry::Vacant(e) => {
                e.insert(load_patterns(&table, element)?);
            }
        }

        Ok(())
    }

    /// Register `element` under `subchain`.
    pub(crate) fn add_pattern_index(
        &self,
        subchain: &SubchainId,
        element: &ElementId,
        tx: &WriteTransaction,
    ) -> DbResult<()> {
        let mut pattern_index = write(&self.pattern_index);
        let mut table = tx.open_multimap_table(SUBCHAIN_PATTERNS)?;
        table.insert(subchain, element)?;

        match pattern_index.entry(*subchain) {
            Entry::Occupied(mut e) => {
                e.get_mut().insert(*element);
            }
            Entry::Vacant(e) => {
                e.insert(load_pattern_index(&table, subchain)?);
            }
        }

        Ok(())
    }

    /// Every pattern of `element`.
    pub(crate) fn get_pattern(&self, element: &ElementId) -> DbResult<BTreeSet<Pattern>> {
        if let Some(set) = read(&self.patterns).get(element) {
            return Ok(set.clone());
        }

        let tx_ro = self.env.tx_ro()?;
        let set = load_patterns(&tx_ro.open_multimap_table(WALLET_PATTERNS)?, element)?;
        Ok(write(&self.patterns).entry(*element).or_insert(set).clone())
    }

    /// Every element registered under `subchain`.
    pub(crate) fn get_pattern_index(&self, subchain: &SubchainId) -> DbResult<BTreeSet<ElementId>> {
        if let Some(set) = read(&self.pattern_index).get(subchain) {
            return Ok(set.clone());
        }

        let tx_ro = self.env.tx_ro()?;
        let set = load_pattern_index(&tx_ro.open_multimap_table(SUBCHAIN_PATTERNS)?, subchain)?;
        Ok(write(&self.pattern_index)
            .entry(*subchain)
            .or_insert(set)
            .clone())
    }
}

//---------------------------------------------------------------------------------------------------- Loaders
/// Decode every pattern row of `element`.
pub(crate) fn load_patterns<T>(table: &T, element: &ElementId) -> DbResult<BTreeSet<Pattern>>
where
    T: ReadableMultimapTable<StorableRedb<ElementId>, &'static [u8]>,
{
    table
        .get(element)?
        .map(|row| -> DbResult<Pattern> {
            let row = row?;
            Pattern::from_row(row.value())
                .ok_or_else(|| RuntimeError::Corrupt(format!("invalid pattern row of {element}")))
        })
        .collect()
}

/// Every element registered under `subchain`.
pub(crate) fn load_pattern_index<T>(table: &T, subchain: &SubchainId) -> DbResult<BTreeSet<ElementId>>
where
    T: ReadableMultimapTable<StorableRedb<SubchainId>, StorableRedb<ElementId>>,
{
    Ok(table
        .get(subchain)?
        .map(|row| row.map(|r| r.value()))
        .collect::<Result<BTreeSet<ElementId>, redb::StorageError>>()?)
}
