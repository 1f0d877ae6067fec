//! Subchain scan state.
//!
//! A subchain is one derivation role of one subaccount, scanned for
//! with one block filter type. [`Subchain`] records what to watch for
//! (patterns, per derived element) and how far scanning has gotten
//! (cursors), keyed by an opaque [`SubchainId`].
//!
//! # Upgrade gate
//! [`Subchain::init`] runs a one-shot schema upgrade on its own thread
//! and returns once it has finished. No caller sees a half-upgraded index:
//! reads block until the upgrade is done, and functions taking a
//! [`WriteTransaction`] fail with [`RuntimeError::UpgradePending`] instead,
//! as the upgrade cannot begin its own write while the caller holds one.
//!
//! # Aborted transactions
//! Writes through a caller's transaction update memory right away.
//! After aborting such a transaction, call [`Subchain::clear`].

//---------------------------------------------------------------------------------------------------- Import
use std::{
    collections::BTreeMap,
    sync::{Arc, OnceLock},
};

use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};
use redb::WriteTransaction;
use tracing::{error, trace, warn};

use crate::{
    constants::SUBCHAIN_INDEX_VERSION,
    env::ConcreteEnv,
    error::{DbResult, RuntimeError},
    header::HeaderOracle,
    types::{
        Bip32Index, BlockHeight, ElementId, FilterType, Pattern, Position, SubaccountId,
        SubchainId, SubchainIndex, SubchainRole,
    },
};

use cache::SubchainCache;

mod cache;
mod id;
mod upgrade;

pub use id::{element_id, subchain_id};

//---------------------------------------------------------------------------------------------------- Constants
/// Name of the upgrade thread.
const UPGRADE_THREAD_NAME: &str = "cuprate_wallet::subchain::Upgrade";

//---------------------------------------------------------------------------------------------------- Subchain
/// Patterns and scan cursors of every subchain of one filter type.
///
/// This is a cheap [`Clone`] handle, all clones share one cache.
#[derive(Clone)]
pub struct Subchain {
    inner: Arc<Inner>,
}

struct Inner {
    env: Arc<ConcreteEnv>,

    /// Filter type of the subchains resolved by [`Subchain::get_id`].
    filter: FilterType,

    cache: SubchainCache,

    /// Resolves once the upgrade has finished.
    gate: OnceLock<Shared<oneshot::Receiver<()>>>,
}

impl std::fmt::Debug for Subchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subchain")
            .field("filter", &self.inner.filter)
            .field("upgrade_started", &self.inner.gate.get().is_some())
            .finish_non_exhaustive()
    }
}

impl Subchain {
    /// Create a handle over `env` for subchains matched with `filter`.
    ///
    /// Nothing is read until [`Subchain::init`] or the first access.
    pub fn new(env: Arc<ConcreteEnv>, filter: FilterType) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: SubchainCache::new(Arc::clone(&env)),
                env,
                filter,
                gate: OnceLock::new(),
            }),
        }
    }

    /// Run the schema upgrade, returning once it has finished.
    ///
    /// Only the first call (on any clone) starts it. Call this before
    /// opening a write transaction to pass to this type.
    pub fn init(&self) {
        self.wait();
    }

    /// The upgrade gate, spawning the upgrade on first use.
    fn gate(&self) -> &Shared<oneshot::Receiver<()>> {
        self.inner.gate.get_or_init(|| {
            let (sender, receiver) = oneshot::channel();
            let inner = Arc::clone(&self.inner);

            let spawned = std::thread::Builder::new()
                .name(UPGRADE_THREAD_NAME.into())
                .spawn(move || {
                    if let Err(e) = upgrade::upgrade(&inner.env) {
                        error!("subchain index upgrade failed: {e}");
                    }
                    inner.cache.clear();
                    drop(sender.send(()));
                });

            // On failure the sender is dropped with the closure,
            // which releases the gate as well.
            if let Err(e) = spawned {
                error!("failed to spawn the subchain upgrade thread: {e}");
            }

            receiver.shared()
        })
    }

    /// Block until the upgrade has finished, starting it if needed.
    ///
    /// The upgrade opens a write transaction of its own, this must not
    /// be called while holding one.
    pub fn wait(&self) {
        if futures::executor::block_on(self.gate().clone()).is_err() {
            warn!("subchain upgrade exited without signalling, continuing");
        }
    }

    /// Fail instead of blocking if the upgrade has not finished,
    /// the caller holds the write lock it needs.
    fn ready(&self) -> DbResult<()> {
        match self.gate().clone().now_or_never() {
            Some(_) => Ok(()),
            None => Err(RuntimeError::UpgradePending),
        }
    }

    /// Drop everything in memory, the next access reloads from the tables.
    ///
    /// Call this after aborting a transaction that was passed to
    /// [`Subchain::get_id`], [`Subchain::set_last_scanned`] or
    /// [`Subchain::reorg`], memory still holds what was written to it.
    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    //------------------------------------------------------------------------------------------------ Reads
    /// Resolve the ID of a subchain at the current schema version,
    /// storing its decode row if it is new.
    ///
    /// # Errors
    /// Returns an error if the decode row could not be written,
    /// or [`RuntimeError::UpgradePending`] before [`Subchain::init`] returned.
    pub fn get_id(
        &self,
        subaccount: SubaccountId,
        role: SubchainRole,
        tx: &WriteTransaction,
    ) -> DbResult<SubchainId> {
        self.ready()?;
        self.inner.cache.get_index(
            subaccount,
            role,
            self.inner.filter,
            SUBCHAIN_INDEX_VERSION,
            tx,
        )
    }

    /// The components `subchain` was derived from,
    /// [`None`] if it was never registered.
    ///
    /// # Errors
    /// Returns an error if the table could not be read.
    pub fn decode(&self, subchain: &SubchainId) -> DbResult<Option<SubchainIndex>> {
        self.wait();
        self.inner.cache.decode(subchain)
    }

    /// The highest derivation index with patterns.
    ///
    /// # Errors
    /// Returns an error if the table could not be read.
    pub fn get_last_indexed(&self, subchain: &SubchainId) -> DbResult<Option<Bip32Index>> {
        self.wait();
        self.inner.cache.get_last_indexed(subchain)
    }

    /// The position scanning has reached,
    /// [`None`] if the subchain was never scanned.
    ///
    /// # Errors
    /// Returns an error if the table could not be read.
    pub fn get_last_scanned(&self, subchain: &SubchainId) -> DbResult<Option<Position>> {
        self.wait();
        self.inner.cache.get_last_scanned(subchain)
    }

    /// Every pattern registered under `subchain`, with its element.
    ///
    /// Ordered by element, then pattern.
    ///
    /// # Errors
    /// Returns an error if a table could not be read.
    pub fn get_patterns(&self, subchain: &SubchainId) -> DbResult<Vec<(ElementId, Pattern)>> {
        self.wait();

        let cache = &self.inner.cache;
        let mut patterns = Vec::new();
        for element in cache.get_pattern_index(subchain)? {
            patterns.extend(
                cache
                    .get_pattern(&element)?
                    .into_iter()
                    .map(|pattern| (element, pattern)),
            );
        }

        Ok(patterns)
    }

    //------------------------------------------------------------------------------------------------ Writes
    /// Record how far `subchain` has been scanned.
    ///
    /// Returns `false` if the write to `tx` failed, the caller should abort `tx`.
    /// Also `false` before [`Subchain::init`] returned.
    pub fn set_last_scanned(
        &self,
        subchain: &SubchainId,
        position: Position,
        tx: &WriteTransaction,
    ) -> bool {
        let result = self
            .ready()
            .and_then(|()| self.inner.cache.set_last_scanned(subchain, position, tx));
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(%subchain, %position, "failed to set last scanned: {e}");
                self.inner.cache.clear();
                false
            }
        }
    }

    /// Register the patterns of newly derived elements.
    ///
    /// `elements` maps each derivation index to its pattern bytes.
    /// Each index becomes the element [`element_id`]`(subchain, index)`, and
    /// the last indexed cursor is set to the highest index. Elements already
    /// registered under `subchain` only gain the new patterns. This runs and
    /// commits its own write transaction.
    ///
    /// Returns `false` on failure, nothing is committed then.
    pub fn add_elements(
        &self,
        subchain: &SubchainId,
        elements: &BTreeMap<Bip32Index, Vec<Vec<u8>>>,
    ) -> bool {
        self.wait();
        match self.try_add_elements(subchain, elements) {
            Ok(()) => true,
            Err(e) => {
                error!(%subchain, "failed to add elements: {e}");
                self.inner.cache.clear();
                false
            }
        }
    }

    fn try_add_elements(
        &self,
        subchain: &SubchainId,
        elements: &BTreeMap<Bip32Index, Vec<Vec<u8>>>,
    ) -> DbResult<()> {
        let Some(highest) = elements.keys().next_back().copied() else {
            return Ok(());
        };

        let cache = &self.inner.cache;
        let known = cache.get_pattern_index(subchain)?;
        let tx = self.inner.env.tx_rw()?;

        let mut added = Vec::with_capacity(elements.len());
        for (index, patterns) in elements {
            let element = element_id(subchain, *index);
            for data in patterns {
                cache.add_pattern(&element, *index, data, &tx)?;
            }
            if !known.contains(&element) {
                added.push(element);
            }
        }

        cache.set_last_indexed(subchain, highest, &tx)?;
        for element in &added {
            cache.add_pattern_index(subchain, element, &tx)?;
        }

        tx.commit()?;
        trace!(%subchain, new = added.len(), highest, "added elements");
        Ok(())
    }

    /// Roll the last scanned cursor of `subchain` back after a reorg.
    ///
    /// `surviving` is the highest block still on the best chain. If the
    /// subchain was scanned to at least that height, its cursor is moved to
    /// the best chain's block at `surviving`, or one below it if the cursor
    /// was exactly at `surviving`. Otherwise nothing changes.
    ///
    /// The whole cache is cleared afterwards, success or not.
    ///
    /// Returns `false` if the cursor needed moving but could not be moved,
    /// including when `headers` does not know the target height, or if
    /// [`Subchain::init`] has not returned yet. Returns `true` otherwise,
    /// whether or not anything changed.
    pub fn reorg(
        &self,
        headers: &impl HeaderOracle,
        subchain: &SubchainId,
        surviving: BlockHeight,
        tx: &WriteTransaction,
    ) -> bool {
        let result = self
            .ready()
            .and_then(|()| self.try_reorg(headers, subchain, surviving, tx));
        self.inner.cache.clear();

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(%subchain, surviving, "failed to reorg subchain: {e}");
                false
            }
        }
    }

    fn try_reorg(
        &self,
        headers: &impl HeaderOracle,
        subchain: &SubchainId,
        surviving: BlockHeight,
        tx: &WriteTransaction,
    ) -> DbResult<()> {
        let cache = &self.inner.cache;

        let Some(last) = cache.get_last_scanned(subchain)? else {
            trace!(%subchain, "never scanned, no reorg needed");
            return Ok(());
        };

        if last.height < surviving {
            trace!(%subchain, %last, surviving, "below surviving height, no reorg needed");
            return Ok(());
        }

        let target = if last.height == surviving {
            surviving.saturating_sub(1)
        } else {
            surviving
        };

        let Some(position) = headers.best_position(target) else {
            return Err(RuntimeError::KeyNotFound);
        };

        cache.set_last_scanned(subchain, position, tx)?;
        trace!(%subchain, from = %last, to = %position, "rolled back last scanned");
        Ok(())
    }
}

//---------------------------------------------------------------------------------------------------- Tests
#[cfg(test)]
mod test {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;

    use pretty_assertions::assert_eq;

    use crate::{
        tables::WALLET_PATTERNS,
        tests::{tmp_shared_env, TestHeaders},
    };

    const SUBACCOUNT: SubaccountId = [1; 32];

    /// An initialized [`Subchain`] and one registered subchain.
    fn subchain() -> (Subchain, SubchainId, Arc<ConcreteEnv>, tempfile::TempDir) {
        let (env, tempdir) = tmp_shared_env();
        let subchain = Subchain::new(Arc::clone(&env), FilterType::Basic);
        subchain.init();

        let tx = env.tx_rw().unwrap();
        let id = subchain.get_id(SUBACCOUNT, SubchainRole::External, &tx).unwrap();
        tx.commit().unwrap();

        (subchain, id, env, tempdir)
    }

    /// Set the last scanned cursor to the best chain's block at `height`.
    fn scan_to(subchain: &Subchain, id: &SubchainId, env: &ConcreteEnv, height: BlockHeight) {
        let tx = env.tx_rw().unwrap();
        let position = Position::new(height, TestHeaders::hash(height));
        assert!(subchain.set_last_scanned(id, position, &tx));
        tx.commit().unwrap();
    }

    #[test]
    fn get_id() {
        let (subchain, id, env, _tempdir) = subchain();

        let tx = env.tx_rw().unwrap();
        assert_eq!(
            subchain.get_id(SUBACCOUNT, SubchainRole::External, &tx).unwrap(),
            id
        );
        assert_ne!(
            subchain.get_id(SUBACCOUNT, SubchainRole::Internal, &tx).unwrap(),
            id
        );
        tx.commit().unwrap();

        assert_eq!(
            id,
            subchain_id(
                SUBACCOUNT,
                SubchainRole::External,
                FilterType::Basic,
                SUBCHAIN_INDEX_VERSION
            )
        );

        let index = subchain.decode(&id).unwrap().unwrap();
        assert_eq!(index.role(), Some(SubchainRole::External));
        assert_eq!(index.version(), SUBCHAIN_INDEX_VERSION);
    }

    #[test]
    /// Last scanned at 500, a reorg surviving 480 rolls back to 480,
    /// a reorg surviving 600 changes nothing.
    fn reorg() {
        let (subchain, id, env, _tempdir) = subchain();
        let headers = TestHeaders { tip: 1000 };
        scan_to(&subchain, &id, &env, 500);

        let tx = env.tx_rw().unwrap();
        assert!(subchain.reorg(&headers, &id, 480, &tx));
        tx.commit().unwrap();

        let expected = Position::new(480, TestHeaders::hash(480));
        assert_eq!(subchain.get_last_scanned(&id).unwrap(), Some(expected));

        let tx = env.tx_rw().unwrap();
        assert!(subchain.reorg(&headers, &id, 600, &tx));
        tx.commit().unwrap();

        assert_eq!(subchain.get_last_scanned(&id).unwrap(), Some(expected));
    }

    #[test]
    /// A cursor exactly at the surviving height moves one below it.
    fn reorg_at_surviving_height() {
        let (subchain, id, env, _tempdir) = subchain();
        let headers = TestHeaders { tip: 1000 };
        scan_to(&subchain, &id, &env, 480);

        let tx = env.tx_rw().unwrap();
        assert!(subchain.reorg(&headers, &id, 480, &tx));
        tx.commit().unwrap();

        assert_eq!(
            subchain.get_last_scanned(&id).unwrap(),
            Some(Position::new(479, TestHeaders::hash(479)))
        );
    }

    #[test]
    /// Unknown target heights fail and leave the cursor alone.
    fn reorg_unknown_height() {
        let (subchain, id, env, _tempdir) = subchain();
        scan_to(&subchain, &id, &env, 500);

        let tx = env.tx_rw().unwrap();
        assert!(!subchain.reorg(&TestHeaders { tip: 100 }, &id, 200, &tx));
        tx.abort().unwrap();

        assert_eq!(
            subchain.get_last_scanned(&id).unwrap(),
            Some(Position::new(500, TestHeaders::hash(500)))
        );
    }

    #[test]
    /// Never scanned subchains need no reorg.
    fn reorg_never_scanned() {
        let (subchain, id, env, _tempdir) = subchain();

        let tx = env.tx_rw().unwrap();
        assert!(subchain.reorg(&TestHeaders { tip: 0 }, &id, 0, &tx));
        tx.commit().unwrap();

        assert_eq!(subchain.get_last_scanned(&id).unwrap(), None);
    }

    #[test]
    fn add_elements() {
        let (subchain, id, env, _tempdir) = subchain();

        let elements = BTreeMap::from([
            (0, vec![vec![0xa], vec![0xb]]),
            (1, vec![vec![0xc]]),
            (5, vec![vec![0xd]]),
        ]);
        assert!(subchain.add_elements(&id, &elements));
        assert_eq!(subchain.get_last_indexed(&id).unwrap(), Some(5));

        let mut expected = vec![
            (element_id(&id, 0), Pattern::new(0, vec![0xa])),
            (element_id(&id, 0), Pattern::new(0, vec![0xb])),
            (element_id(&id, 1), Pattern::new(1, vec![0xc])),
            (element_id(&id, 5), Pattern::new(5, vec![0xd])),
        ];
        expected.sort();
        assert_eq!(subchain.get_patterns(&id).unwrap(), expected);

        // A fresh handle reads the same from the tables.
        let fresh = Subchain::new(Arc::clone(&env), FilterType::Basic);
        assert_eq!(fresh.get_patterns(&id).unwrap(), expected);
        assert_eq!(fresh.get_last_indexed(&id).unwrap(), Some(5));

        // Nothing to add.
        assert!(subchain.add_elements(&id, &BTreeMap::new()));
        assert_eq!(subchain.get_last_indexed(&id).unwrap(), Some(5));
    }

    #[test]
    /// Once `init` returns, a caller can resolve IDs inside its own write transaction.
    fn init_then_write() {
        let (env, _tempdir) = tmp_shared_env();
        let (sender, receiver) = mpsc::channel();

        let env_clone = Arc::clone(&env);
        thread::spawn(move || {
            let subchain = Subchain::new(Arc::clone(&env_clone), FilterType::Basic);
            subchain.init();

            let tx = env_clone.tx_rw().unwrap();
            let id = subchain.get_id(SUBACCOUNT, SubchainRole::External, &tx).unwrap();
            tx.commit().unwrap();
            sender.send(id).unwrap();
        });

        let id = receiver.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(
            id,
            subchain_id(
                SUBACCOUNT,
                SubchainRole::External,
                FilterType::Basic,
                SUBCHAIN_INDEX_VERSION
            )
        );
    }

    #[test]
    /// Before `init`, calls taking a write transaction fail instead of waiting.
    fn upgrade_pending() {
        let (env, _tempdir) = tmp_shared_env();
        let subchain = Subchain::new(Arc::clone(&env), FilterType::Basic);
        let id = SubchainId([1; 32]);

        let tx = env.tx_rw().unwrap();
        assert!(matches!(
            subchain.get_id(SUBACCOUNT, SubchainRole::External, &tx),
            Err(RuntimeError::UpgradePending)
        ));
        assert!(!subchain.set_last_scanned(&id, Position::new(1, [1; 32]), &tx));
        assert!(!subchain.reorg(&TestHeaders { tip: 0 }, &id, 0, &tx));
        tx.abort().unwrap();

        subchain.init();
        let tx = env.tx_rw().unwrap();
        assert!(subchain.get_id(SUBACCOUNT, SubchainRole::External, &tx).is_ok());
        tx.commit().unwrap();
    }

    #[test]
    /// A cursor from an aborted transaction stays in memory until `clear`.
    fn abort_then_clear() {
        let (subchain, id, env, _tempdir) = subchain();
        let position = Position::new(500, TestHeaders::hash(500));

        let tx = env.tx_rw().unwrap();
        assert!(subchain.set_last_scanned(&id, position, &tx));
        tx.abort().unwrap();

        assert_eq!(subchain.get_last_scanned(&id).unwrap(), Some(position));
        subchain.clear();
        assert_eq!(subchain.get_last_scanned(&id).unwrap(), None);
    }

    #[test]
    /// A failure part way through commits nothing.
    fn add_elements_failure() {
        let (subchain, id, env, _tempdir) = subchain();

        // Unreadable row under the second element.
        {
            let tx = env.tx_rw().unwrap();
            tx.open_multimap_table(WALLET_PATTERNS)
                .unwrap()
                .insert(element_id(&id, 1), [1_u8].as_slice())
                .unwrap();
            tx.commit().unwrap();
        }

        let elements = BTreeMap::from([(0, vec![vec![0xa]]), (1, vec![vec![0xb]])]);
        assert!(!subchain.add_elements(&id, &elements));

        assert_eq!(subchain.get_last_indexed(&id).unwrap(), None);
        assert_eq!(subchain.get_patterns(&id).unwrap(), vec![]);
    }

    #[test]
    /// Re-adding an element only adds its new patterns.
    fn add_elements_again() {
        let (subchain, id, _env, _tempdir) = subchain();

        assert!(subchain.add_elements(&id, &BTreeMap::from([(0, vec![vec![0xa]])])));
        assert!(subchain.add_elements(&id, &BTreeMap::from([(0, vec![vec![0xb]])])));

        subchain.clear();
        assert_eq!(
            subchain.get_patterns(&id).unwrap(),
            vec![
                (element_id(&id, 0), Pattern::new(0, vec![0xa])),
                (element_id(&id, 0), Pattern::new(0, vec![0xb])),
            ]
        );
    }

    #[test]
    /// Clones share the gate and the cache across threads.
    fn shared() {
        let (subchain, id, env, _tempdir) = subchain();
        scan_to(&subchain, &id, &env, 7);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let subchain = subchain.clone();
                thread::spawn(move || subchain.get_last_scanned(&id).unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(
                handle.join().unwrap(),
                Some(Position::new(7, TestHeaders::hash(7)))
            );
        }
    }
}
