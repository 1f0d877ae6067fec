//! Subchain index schema upgrade.
//!
//! A subchain's ID covers the schema version, so a version bump
//! leaves every stored row under an ID nothing asks for anymore.
//! [`upgrade`] re-homes those rows under the current IDs and deletes
//! the stale ones.

//---------------------------------------------------------------------------------------------------- Import
use std::collections::BTreeSet;

use redb::{ReadableMultimapTable, ReadableTable, WriteTransaction};
use tracing::{debug, error, info};

use crate::{
    constants::SUBCHAIN_INDEX_VERSION,
    env::ConcreteEnv,
    error::{DbResult, RuntimeError},
    tables::{
        CONFIG, SUBCHAIN_IDS, SUBCHAIN_LAST_INDEXED, SUBCHAIN_LAST_SCANNED, SUBCHAIN_PATTERNS,
        WALLET_PATTERNS,
    },
    types::{
        decode_version, encode_version, ConfigKey, ElementId, Pattern, SubchainId, SubchainIndex,
        VersionNumber,
    },
};

use super::{
    cache::load_pattern_index,
    id::{element_id, index_id},
};

//---------------------------------------------------------------------------------------------------- Upgrade
/// Bring the stored subchain index up to [`SUBCHAIN_INDEX_VERSION`].
///
/// Runs in one write transaction, nothing is changed on error.
/// A database written by newer software is left untouched.
pub(super) fn upgrade(env: &ConcreteEnv) -> DbResult<()> {
    let tx = env.tx_rw()?;

    match stored_version(&tx)? {
        None => {
            debug!(version = SUBCHAIN_INDEX_VERSION, "new subchain index");
        }
        Some(version) if version == SUBCHAIN_INDEX_VERSION => {
            tx.abort()?;
            return Ok(());
        }
        Some(version) if version > SUBCHAIN_INDEX_VERSION => {
            error!(
                version,
                supported = SUBCHAIN_INDEX_VERSION,
                "subchain index was written by newer software, not upgrading"
            );
            tx.abort()?;
            return Ok(());
        }
        Some(version) => {
            info!(from = version, to = SUBCHAIN_INDEX_VERSION, "upgrading subchain index");
            let migrated = migrate(&tx)?;
            info!(migrated, "upgraded subchain index");
        }
    }

    tx.open_table(CONFIG)?.insert(
        ConfigKey::Version.key(),
        encode_version(SUBCHAIN_INDEX_VERSION).as_slice(),
    )?;
    tx.commit()?;

    Ok(())
}

/// The stored schema version, [`None`] on a new database.
fn stored_version(tx: &WriteTransaction) -> DbResult<Option<VersionNumber>> {
    let table = tx.open_table(CONFIG)?;
    let Some(row) = table.get(ConfigKey::Version.key())? else {
        return Ok(None);
    };

    decode_version(row.value())
        .map(Some)
        .ok_or_else(|| RuntimeError::Corrupt("invalid schema version row".to_string()))
}

/// Migrate every subchain not at the current version,
/// returns how many there were.
fn migrate(tx: &WriteTransaction) -> DbResult<usize> {
    let stale = {
        let table = tx.open_table(SUBCHAIN_IDS)?;
        table
            .iter()?
            .map(|entry| -> DbResult<(SubchainId, SubchainIndex)> {
                let (id, index) = entry?;
                Ok((id.value(), index.value()))
            })
            .filter(|row| !matches!(row, Ok((_, index)) if index.version() == SUBCHAIN_INDEX_VERSION))
            .collect::<DbResult<Vec<_>>>()?
    };

    for (old, index) in &stale {
        migrate_subchain(tx, old, *index)?;
    }

    Ok(stale.len())
}

/// Move one subchain to its current-version ID.
///
/// Patterns and the last indexed cursor are carried over unless the
/// replacement already has its own. The last scanned cursor is dropped,
/// the subchain is rescanned.
fn migrate_subchain(tx: &WriteTransaction, old: &SubchainId, index: SubchainIndex) -> DbResult<()> {
    let index = index.with_version(SUBCHAIN_INDEX_VERSION);
    let new = index_id(&index);
    tx.open_table(SUBCHAIN_IDS)?.insert(new, index)?;

    let elements = load_pattern_index(&tx.open_multimap_table(SUBCHAIN_PATTERNS)?, old)?;

    let last_indexed = {
        let table = tx.open_table(SUBCHAIN_LAST_INDEXED)?;
        let existing = table.get(new)?.is_some();
        let last = table.get(old)?.map(|row| row.value());
        (!existing).then_some(last)
    };

    if let Some(last) = last_indexed {
        let moved = rehome_patterns(tx, old, &new, &elements)?;
        if let Some(last) = last {
            tx.open_table(SUBCHAIN_LAST_INDEXED)?.insert(new, last)?;
        }
        debug!(%old, %new, patterns = moved, "migrated subchain");
    } else {
        debug!(%old, %new, "subchain already migrated, dropping stale rows");
    }

    {
        let mut patterns = tx.open_multimap_table(WALLET_PATTERNS)?;
        for element in &elements {
            drop(patterns.remove_all(element)?);
        }
    }
    drop(tx.open_multimap_table(SUBCHAIN_PATTERNS)?.remove_all(old)?);
    tx.open_table(SUBCHAIN_IDS)?.remove(old)?;
    tx.open_table(SUBCHAIN_LAST_INDEXED)?.remove(old)?;
    tx.open_table(SUBCHAIN_LAST_SCANNED)?.remove(old)?;

    Ok(())
}

/// Copy every pattern of `elements` to element IDs under `new`,
/// returns how many were copied.
fn rehome_patterns(
    tx: &WriteTransaction,
    old: &SubchainId,
    new: &SubchainId,
    elements: &BTreeSet<ElementId>,
) -> DbResult<usize> {
    let mut patterns = tx.open_multimap_table(WALLET_PATTERNS)?;
    let mut pattern_index = tx.open_multimap_table(SUBCHAIN_PATTERNS)?;
    let mut moved = 0;

    for element in elements {
        let rows = patterns
            .get(element)?
            .map(|row| row.map(|r| r.value().to_vec()))
            .collect::<Result<Vec<Vec<u8>>, redb::StorageError>>()?;

        for row in rows {
            let pattern = Pattern::from_row(&row).ok_or_else(|| {
                RuntimeError::Corrupt(format!("invalid pattern row of {element} in subchain {old}"))
            })?;

            let element = element_id(new, pattern.index);
            patterns.insert(element, row.as_slice())?;
            pattern_index.insert(new, element)?;
            moved += 1;
        }
    }

    Ok(moved)
}

//---------------------------------------------------------------------------------------------------- Tests
#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::{
        tests::tmp_concrete_env,
        types::{FilterType, Position, SubchainRole},
    };

    fn version(env: &ConcreteEnv) -> Option<VersionNumber> {
        let tx = env.tx_rw().unwrap();
        let version = stored_version(&tx).unwrap();
        tx.abort().unwrap();
        version
    }

    #[test]
    /// A new database gets the current version.
    fn fresh() {
        let (env, _tempdir) = tmp_concrete_env();
        assert_eq!(version(&env), None);

        upgrade(&env).unwrap();
        assert_eq!(version(&env), Some(SUBCHAIN_INDEX_VERSION));

        // Again, nothing to do.
        upgrade(&env).unwrap();
        assert_eq!(version(&env), Some(SUBCHAIN_INDEX_VERSION));
    }

    #[test]
    /// Newer databases are not touched.
    fn newer() {
        let (env, _tempdir) = tmp_concrete_env();
        let newer = SUBCHAIN_INDEX_VERSION + 1;
        let id = SubchainId([1; 32]);
        let index = SubchainIndex::new([1; 32], SubchainRole::External, FilterType::Basic, newer);

        {
            let tx = env.tx_rw().unwrap();
            tx.open_table(CONFIG)
                .unwrap()
                .insert(ConfigKey::Version.key(), encode_version(newer).as_slice())
                .unwrap();
            tx.open_table(SUBCHAIN_IDS).unwrap().insert(id, index).unwrap();
            tx.commit().unwrap();
        }

        upgrade(&env).unwrap();
        assert_eq!(version(&env), Some(newer));

        let tx_ro = env.tx_ro().unwrap();
        let table = tx_ro.open_table(SUBCHAIN_IDS).unwrap();
        assert_eq!(table.get(id).unwrap().unwrap().value(), index);
    }

    #[test]
    /// 4 byte version rows are read.
    fn legacy_version_width() {
        let (env, _tempdir) = tmp_concrete_env();

        {
            let tx = env.tx_rw().unwrap();
            tx.open_table(CONFIG)
                .unwrap()
                .insert(
                    ConfigKey::Version.key(),
                    SUBCHAIN_INDEX_VERSION.to_le_bytes().as_slice(),
                )
                .unwrap();
            tx.commit().unwrap();
        }

        assert_eq!(version(&env), Some(SUBCHAIN_INDEX_VERSION));
    }

    #[test]
    /// Stale subchains move to their current ID,
    /// keeping patterns and the last indexed cursor.
    fn migrate_stale() {
        let (env, _tempdir) = tmp_concrete_env();
        let old_version = SUBCHAIN_INDEX_VERSION - 1;
        let index = SubchainIndex::new([1; 32], SubchainRole::Internal, FilterType::Es, old_version);
        let old = index_id(&index);
        let old_element = element_id(&old, 3);
        let pattern = Pattern::new(3, vec![7; 20]);

        {
            let tx = env.tx_rw().unwrap();
            tx.open_table(CONFIG)
                .unwrap()
                .insert(ConfigKey::Version.key(), encode_version(old_version).as_slice())
                .unwrap();
            tx.open_table(SUBCHAIN_IDS).unwrap().insert(old, index).unwrap();
            tx.open_table(SUBCHAIN_LAST_INDEXED).unwrap().insert(old, 3_u32).unwrap();
            tx.open_table(SUBCHAIN_LAST_SCANNED)
                .unwrap()
                .insert(old, Position::new(9, [9; 32]))
                .unwrap();
            tx.open_multimap_table(WALLET_PATTERNS)
                .unwrap()
                .insert(old_element, pattern.to_row().as_slice())
                .unwrap();
            tx.open_multimap_table(SUBCHAIN_PATTERNS)
                .unwrap()
                .insert(old, old_element)
                .unwrap();
            tx.commit().unwrap();
        }

        upgrade(&env).unwrap();
        assert_eq!(version(&env), Some(SUBCHAIN_INDEX_VERSION));

        let new = index_id(&index.with_version(SUBCHAIN_INDEX_VERSION));
        let new_element = element_id(&new, 3);

        let tx_ro = env.tx_ro().unwrap();
        let ids = tx_ro.open_table(SUBCHAIN_IDS).unwrap();
        assert!(ids.get(old).unwrap().is_none());
        assert_eq!(
            ids.get(new).unwrap().unwrap().value().version(),
            SUBCHAIN_INDEX_VERSION
        );

        let last_indexed = tx_ro.open_table(SUBCHAIN_LAST_INDEXED).unwrap();
        assert!(last_indexed.get(old).unwrap().is_none());
        assert_eq!(last_indexed.get(new).unwrap().unwrap().value(), 3);

        let last_scanned = tx_ro.open_table(SUBCHAIN_LAST_SCANNED).unwrap();
        assert!(last_scanned.get(old).unwrap().is_none());
        assert!(last_scanned.get(new).unwrap().is_none());

        let index_table = tx_ro.open_multimap_table(SUBCHAIN_PATTERNS).unwrap();
        assert!(load_pattern_index(&index_table, &old).unwrap().is_empty());
        assert_eq!(
            load_pattern_index(&index_table, &new).unwrap(),
            BTreeSet::from([new_element])
        );

        let patterns = tx_ro.open_multimap_table(WALLET_PATTERNS).unwrap();
        assert!(patterns.get(old_element).unwrap().is_empty());
        let rows: Vec<Vec<u8>> = patterns
            .get(new_element)
            .unwrap()
            .map(|r| r.unwrap().value().to_vec())
            .collect();
        assert_eq!(rows, vec![pattern.to_row()]);
    }
}
