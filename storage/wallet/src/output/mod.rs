//! The wallet's output cache.
//!
//! [`OutputCache`] owns the authoritative set of wallet outputs, the
//! secondary indices over it and the proposal reservations.
//!
//! # Writes
//! Every mutation takes the caller's [`redb::WriteTransaction`] and is
//! applied to the tables and to memory in the same call. The caller
//! commits or aborts the transaction.
//!
//! If a write fails half-way, the in-memory indices are thrown away
//! and lazily reloaded from the tables on the next access. There is no
//! finer grained rollback. Until the next write reloads them through its
//! transaction, reads see only committed rows.
//!
//! A caller that aborts a transaction after a successful write must
//! call [`OutputCache::clear`], memory still holds the aborted rows.
//!
//! # Concurrency
//! The cache assumes a single writer, every function takes `&mut self`.
//! Wrap it in a `Mutex` to share it.

//---------------------------------------------------------------------------------------------------- Import
use std::{collections::BTreeSet, sync::Arc};

use redb::{MultimapTableDefinition, ReadableMultimapTable, WriteTransaction};
use tracing::{debug, error, trace, warn};

use crate::{
    env::ConcreteEnv,
    error::{DbResult, InvariantViolation, StorageError},
    storable::{Storable, StorableRedb},
    tables::{ACCOUNTS, CONFIG, GENERATION, KEYS, NYMS, OUTPUTS, POSITIONS, STATES, SUBCHAINS},
    types::{
        AccountId, BlockHeight, ConfigKey, KeyId, NymId, Outpoint, Output, Position, SubchainId,
        TxoState,
    },
};

use index::{IndexKey, Indices, OutpointIndex};
use macros::doc_write_bool;

mod index;
mod macros;
mod proposal;

//---------------------------------------------------------------------------------------------------- OutputIndices
/// Where a new output is filed by [`OutputCache::add_output_with_indices`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutputIndices {
    /// Initial spend state.
    pub state: TxoState,
    /// Block the output was seen in.
    pub position: Position,
    /// Owning account, must not be empty.
    pub account: AccountId,
    /// Subchain the output was matched by, must not be empty.
    pub subchain: SubchainId,
}

//---------------------------------------------------------------------------------------------------- OutputCache
/// The wallet's outputs and every index over them.
pub struct OutputCache {
    /// The database.
    env: Arc<ConcreteEnv>,

    /// `true` once `data` mirrors the tables.
    populated: bool,

    /// Set by a failed write. The caller's transaction may still hold
    /// rows a read-only load cannot see, so only a load through a write
    /// transaction counts as populated.
    reload_rw: bool,

    /// In-memory mirror of the tables.
    data: Indices,
}

impl std::fmt::Debug for OutputCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputCache")
            .field("populated", &self.populated)
            .field("outputs", &self.data.outputs.len())
            .finish_non_exhaustive()
    }
}

impl OutputCache {
    /// Create an empty cache over `env`.
    ///
    /// Nothing is loaded until the first access or [`OutputCache::populate`].
    pub fn new(env: Arc<ConcreteEnv>) -> Self {
        Self {
            env,
            populated: false,
            reload_rw: false,
            data: Indices::default(),
        }
    }

    //------------------------------------------------------------------------------------------------ Lifecycle
    /// Load every output table into memory.
    ///
    /// Does nothing if the cache is already populated.
    ///
    /// # Errors
    /// Returns an error if a table could not be read.
    pub fn populate(&mut self) -> DbResult<()> {
        if self.populated {
            return Ok(());
        }

        let tx_ro = self.env.tx_ro()?;
        self.data = Indices::load(&tx_ro)?;
        self.populated = !self.reload_rw;
        debug!(
            outputs = self.data.outputs.len(),
            kept = self.populated,
            "populated output cache"
        );

        Ok(())
    }

    /// [`OutputCache::populate`] through a write transaction,
    /// so rows it has not committed yet are seen.
    fn populate_rw(&mut self, tx: &WriteTransaction) -> DbResult<()> {
        if self.populated {
            return Ok(());
        }

        self.data = Indices::load_rw(tx)?;
        self.populated = true;
        self.reload_rw = false;
        debug!(outputs = self.data.outputs.len(), "populated output cache");

        Ok(())
    }

    /// Throw away everything in memory.
    ///
    /// The next access reloads from the tables.
    pub fn clear(&mut self) {
        self.data = Indices::default();
        self.populated = false;
        trace!("cleared output cache");
    }

    /// Clear after a failed write.
    fn discard(&mut self) {
        self.clear();
        self.reload_rw = true;
    }

    /// Log and recover from a failed mutation.
    fn report(&mut self, op: &'static str, result: Result<(), StorageError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(op, "output cache write failed: {e}");
                self.discard();
                false
            }
        }
    }

    /// The outpoint must be a known output.
    fn require_output(&self, outpoint: &Outpoint) -> Result<(), InvariantViolation> {
        if self.data.outputs.contains_key(outpoint) {
            Ok(())
        } else {
            Err(InvariantViolation::UnknownOutput(*outpoint))
        }
    }

    //------------------------------------------------------------------------------------------------ Outputs
    /// Is `outpoint` a wallet output?
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn exists(&mut self, outpoint: &Outpoint) -> DbResult<bool> {
        self.populate()?;
        Ok(self.data.outputs.contains_key(outpoint))
    }

    /// Get a wallet output.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_output(&mut self, outpoint: &Outpoint) -> DbResult<Option<Output>> {
        self.populate()?;
        Ok(self.data.outputs.get(outpoint).cloned())
    }

    /// Add an output, without filing it in any index.
    ///
    /// Adding an existing outpoint overwrites its output.
    ///
    #[doc = doc_write_bool!()]
    pub fn add_output(&mut self, outpoint: Outpoint, output: &Output, tx: &WriteTransaction) -> bool {
        let result = self
            .populate_rw(tx)
            .and_then(|()| self.write_output(outpoint, output, tx))
            .map_err(StorageError::from);
        self.report("add_output", result)
    }

    /// Add an output and file it under its state, position,
    /// account, subchain and every key in [`Output::keys`].
    ///
    #[doc = doc_write_bool!()]
    ///
    /// Also returns `false` if the account or subchain is empty.
    pub fn add_output_with_indices(
        &mut self,
        outpoint: Outpoint,
        output: &Output,
        indices: OutputIndices,
        tx: &WriteTransaction,
    ) -> bool {
        let result = self.try_add_output_with_indices(outpoint, output, indices, tx);
        self.report("add_output_with_indices", result)
    }

    fn try_add_output_with_indices(
        &mut self,
        outpoint: Outpoint,
        output: &Output,
        indices: OutputIndices,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        if indices.account == AccountId::default() {
            return Err(InvariantViolation::EmptyKey("account").into());
        }
        if indices.subchain == SubchainId::default() {
            return Err(InvariantViolation::EmptyKey("subchain").into());
        }

        self.populate_rw(tx)?;
        self.write_output(outpoint, output, tx)?;

        self.index_insert(tx, STATES, indices.state, outpoint, |d| &mut d.states)?;
        self.index_insert(tx, POSITIONS, indices.position, outpoint, |d| {
            &mut d.positions
        })?;
        self.index_insert(tx, ACCOUNTS, indices.account, outpoint, |d| {
            &mut d.accounts
        })?;
        self.index_insert(tx, SUBCHAINS, indices.subchain, outpoint, |d| {
            &mut d.subchains
        })?;
        for key in &output.keys {
            self.index_insert(tx, KEYS, *key, outpoint, |d| &mut d.keys)?;
        }

        trace!(%outpoint, state = ?indices.state, "added output");
        Ok(())
    }

    /// Replace the stored data of an existing output.
    ///
    /// The indices are not touched.
    ///
    #[doc = doc_write_bool!()]
    pub fn update_output(
        &mut self,
        outpoint: Outpoint,
        output: &Output,
        tx: &WriteTransaction,
    ) -> bool {
        let result = self.try_update_output(outpoint, output, tx);
        self.report("update_output", result)
    }

    fn try_update_output(
        &mut self,
        outpoint: Outpoint,
        output: &Output,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        self.populate_rw(tx)?;
        self.require_output(&outpoint)?;
        self.write_output(outpoint, output, tx)?;
        Ok(())
    }

    fn write_output(
        &mut self,
        outpoint: Outpoint,
        output: &Output,
        tx: &WriteTransaction,
    ) -> DbResult<()> {
        tx.open_table(OUTPUTS)?
            .insert(outpoint, output.to_bytes().as_slice())?;
        self.data.outputs.insert(outpoint, output.clone());
        Ok(())
    }

    //------------------------------------------------------------------------------------------------ Index writes
    /// File a known output under `key` in one index.
    fn index_insert<K: IndexKey>(
        &mut self,
        tx: &WriteTransaction,
        table: MultimapTableDefinition<'static, StorableRedb<K::Durable>, StorableRedb<Outpoint>>,
        key: K,
        outpoint: Outpoint,
        index: impl FnOnce(&mut Indices) -> &mut dyn OutpointIndex<K>,
    ) -> Result<(), StorageError> {
        self.populate_rw(tx)?;
        self.require_output(&outpoint)?;
        put_index(tx, table, key.durable(), outpoint)?;
        index(&mut self.data).add(key, outpoint);
        Ok(())
    }

    /// File a known output under an account.
    ///
    #[doc = doc_write_bool!()]
    pub fn add_to_account(
        &mut self,
        account: AccountId,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> bool {
        let result = self.index_insert(tx, ACCOUNTS, account, outpoint, |d| &mut d.accounts);
        self.report("add_to_account", result)
    }

    /// File a known output under a key.
    ///
    #[doc = doc_write_bool!()]
    pub fn add_to_key(&mut self, key: KeyId, outpoint: Outpoint, tx: &WriteTransaction) -> bool {
        let result = self.index_insert(tx, KEYS, key, outpoint, |d| &mut d.keys);
        self.report("add_to_key", result)
    }

    /// File a known output under a nym.
    ///
    #[doc = doc_write_bool!()]
    pub fn add_to_nym(&mut self, nym: NymId, outpoint: Outpoint, tx: &WriteTransaction) -> bool {
        let result = self.index_insert(tx, NYMS, nym, outpoint, |d| &mut d.nyms);
        self.report("add_to_nym", result)
    }

    /// File a known output under a block position.
    ///
    #[doc = doc_write_bool!()]
    pub fn add_to_position(
        &mut self,
        position: Position,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> bool {
        let result = self.index_insert(tx, POSITIONS, position, outpoint, |d| &mut d.positions);
        self.report("add_to_position", result)
    }

    /// File a known output under a spend state.
    ///
    /// This does not remove it from any other state,
    /// see [`OutputCache::change_state`].
    ///
    #[doc = doc_write_bool!()]
    pub fn add_to_state(&mut self, state: TxoState, outpoint: Outpoint, tx: &WriteTransaction) -> bool {
        let result = self.index_insert(tx, STATES, state, outpoint, |d| &mut d.states);
        self.report("add_to_state", result)
    }

    /// File a known output under a subchain.
    ///
    #[doc = doc_write_bool!()]
    pub fn add_to_subchain(
        &mut self,
        subchain: SubchainId,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> bool {
        let result = self.index_insert(tx, SUBCHAINS, subchain, outpoint, |d| &mut d.subchains);
        self.report("add_to_subchain", result)
    }

    //------------------------------------------------------------------------------------------------ State & position
    /// Move an output from state `old` to state `new`.
    ///
    /// The output is removed from _every_ state, not just `old`, so an
    /// output wrongly filed under several states is repaired. A warning is
    /// logged if it was not under `old`, or was under more than one state.
    ///
    #[doc = doc_write_bool!()]
    pub fn change_state(
        &mut self,
        old: TxoState,
        new: TxoState,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> bool {
        let result = self.try_change_state(old, new, outpoint, tx);
        self.report("change_state", result)
    }

    fn try_change_state(
        &mut self,
        old: TxoState,
        new: TxoState,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        self.populate_rw(tx)?;
        self.require_output(&outpoint)?;

        let removed = replace_state(tx, new, outpoint)?;
        if !removed.contains(&old) {
            warn!(%outpoint, ?old, ?new, "output was not found under its old state");
        }
        if removed.len() > 1 {
            warn!(%outpoint, ?removed, "output was filed under multiple states");
        }

        for state in TxoState::ALL {
            self.data.states.remove_member(&state, &outpoint);
        }
        self.data.states.add(new, outpoint);

        trace!(%outpoint, ?old, ?new, "changed output state");
        Ok(())
    }

    /// Move an output from block position `old` to `new`.
    ///
    /// A warning is logged if it was not under `old`.
    ///
    #[doc = doc_write_bool!()]
    pub fn change_position(
        &mut self,
        old: Position,
        new: Position,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> bool {
        let result = self.try_change_position(old, new, outpoint, tx);
        self.report("change_position", result)
    }

    fn try_change_position(
        &mut self,
        old: Position,
        new: Position,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        self.populate_rw(tx)?;
        self.require_output(&outpoint)?;

        if !delete_index(tx, POSITIONS, old, outpoint)? {
            warn!(%outpoint, %old, "output was not found under its old position");
        }
        put_index(tx, POSITIONS, new, outpoint)?;

        self.data.positions.remove_member(&old, &outpoint);
        self.data.positions.add(new, outpoint);

        trace!(%outpoint, %old, %new, "changed output position");
        Ok(())
    }

    //------------------------------------------------------------------------------------------------ Index reads
    /// Outputs of an account.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_account(&mut self, account: &AccountId) -> DbResult<&BTreeSet<Outpoint>> {
        self.populate()?;
        Ok(self.data.accounts.members(account))
    }

    /// Outputs spendable by a key.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_key(&mut self, key: &KeyId) -> DbResult<&BTreeSet<Outpoint>> {
        self.populate()?;
        Ok(self.data.keys.members(key))
    }

    /// Outputs of a nym.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_nym(&mut self, nym: &NymId) -> DbResult<&BTreeSet<Outpoint>> {
        self.populate()?;
        Ok(self.data.nyms.members(nym))
    }

    /// Outputs seen in a block.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_position(&mut self, position: &Position) -> DbResult<&BTreeSet<Outpoint>> {
        self.populate()?;
        Ok(self.data.positions.members(position))
    }

    /// Outputs in a spend state.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_state(&mut self, state: TxoState) -> DbResult<&BTreeSet<Outpoint>> {
        self.populate()?;
        Ok(self.data.states.members(&state))
    }

    /// Outputs matched by a subchain.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_subchain(&mut self, subchain: &SubchainId) -> DbResult<&BTreeSet<Outpoint>> {
        self.populate()?;
        Ok(self.data.subchains.members(subchain))
    }

    //------------------------------------------------------------------------------------------------ Generation
    /// Register a known output as a generation output created at `height`.
    ///
    #[doc = doc_write_bool!()]
    pub fn add_generation_output(
        &mut self,
        height: BlockHeight,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> bool {
        let result = self.try_add_generation_output(height, outpoint, tx);
        self.report("add_generation_output", result)
    }

    fn try_add_generation_output(
        &mut self,
        height: BlockHeight,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        self.populate_rw(tx)?;
        self.require_output(&outpoint)?;
        put_generation(tx, height, outpoint)?;
        self.data.generation.add(height, outpoint);
        Ok(())
    }

    /// Generation outputs created in `first..=last`, ordered by height.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_matured(&mut self, first: BlockHeight, last: BlockHeight) -> DbResult<Vec<Outpoint>> {
        self.populate()?;

        if first > last {
            return Ok(Vec::new());
        }

        Ok(self
            .data
            .generation
            .range(first..=last)
            .flat_map(|(_, set)| set.iter().copied())
            .collect())
    }

    /// Remove every generation output created above `height`.
    ///
    /// Used on reorg, `height` is the highest surviving block.
    /// Returns the removed outpoints, ordered by height.
    ///
    /// # Errors
    /// Returns an error if a table could not be written,
    /// in which case the cache is cleared.
    pub fn delete_generation_above(
        &mut self,
        height: BlockHeight,
        tx: &WriteTransaction,
    ) -> DbResult<Vec<Outpoint>> {
        let result = self.try_delete_generation_above(height, tx);
        if let Err(e) = &result {
            error!(height, "failed to delete generation outputs: {e}");
            self.discard();
        }
        result
    }

    fn try_delete_generation_above(
        &mut self,
        height: BlockHeight,
        tx: &WriteTransaction,
    ) -> DbResult<Vec<Outpoint>> {
        self.populate_rw(tx)?;

        let Some(first) = height.checked_add(1) else {
            return Ok(Vec::new());
        };

        let mut table = tx.open_multimap_table(GENERATION)?;
        let mut heights = Vec::new();
        let mut removed = Vec::new();
        for entry in table.range(first..)? {
            let (key, values) = entry?;
            heights.push(key.value());
            for value in values {
                removed.push(value?.value());
            }
        }
        for h in heights {
            table.remove_all(h)?;
        }

        drop(self.data.generation.split_off(&first));

        debug!(height, removed = removed.len(), "deleted generation outputs");
        Ok(removed)
    }

    //------------------------------------------------------------------------------------------------ Wallet tip
    /// The wallet-wide tip.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_wallet_tip(&mut self) -> DbResult<Option<Position>> {
        self.populate()?;
        Ok(self.data.wallet_tip)
    }

    /// Set the wallet-wide tip.
    ///
    #[doc = doc_write_bool!()]
    pub fn set_wallet_tip(&mut self, position: Position, tx: &WriteTransaction) -> bool {
        let result = self
            .populate_rw(tx)
            .and_then(|()| {
                tx.open_table(CONFIG)?
                    .insert(ConfigKey::WalletTip.key(), Storable::as_bytes(&position))?;
                Ok(())
            })
            .map_err(StorageError::from);

        if result.is_ok() {
            self.data.wallet_tip = Some(position);
        }
        self.report("set_wallet_tip", result)
    }

    //------------------------------------------------------------------------------------------------ Test
    /// The in-memory state.
    #[cfg(test)]
    pub(crate) const fn data(&self) -> &Indices {
        &self.data
    }
}

//---------------------------------------------------------------------------------------------------- Table writes
/// Insert one `key -> outpoint` row, returns `true` if it already existed.
fn put_index<D: Storable + 'static>(
    tx: &WriteTransaction,
    table: MultimapTableDefinition<'static, StorableRedb<D>, StorableRedb<Outpoint>>,
    key: D,
    outpoint: Outpoint,
) -> DbResult<bool> {
    Ok(tx.open_multimap_table(table)?.insert(key, outpoint)?)
}

/// Insert one `height -> outpoint` generation row.
fn put_generation(tx: &WriteTransaction, height: BlockHeight, outpoint: Outpoint) -> DbResult<bool> {
    Ok(tx.open_multimap_table(GENERATION)?.insert(height, outpoint)?)
}

/// Remove every `states` row of `outpoint` and file it under `new`,
/// returns the states it was removed from.
fn replace_state(tx: &WriteTransaction, new: TxoState, outpoint: Outpoint) -> DbResult<Vec<TxoState>> {
    let mut table = tx.open_multimap_table(STATES)?;
    let mut removed = Vec::new();
    for state in TxoState::ALL {
        if table.remove(state.durable(), outpoint)? {
            removed.push(state);
        }
    }
    table.insert(new.durable(), outpoint)?;
    Ok(removed)
}

/// Remove one `key -> outpoint` row, returns `true` if it existed.
fn delete_index<D: Storable + 'static>(
    tx: &WriteTransaction,
    table: MultimapTableDefinition<'static, StorableRedb<D>, StorableRedb<Outpoint>>,
    key: D,
    outpoint: Outpoint,
) -> DbResult<bool> {
    Ok(tx.open_multimap_table(table)?.remove(key, outpoint)?)
}
