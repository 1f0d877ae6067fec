//! Proposal reservations.
//!
//! A spend proposal reserves the outputs it consumes and
//! stages the outputs it creates. An outpoint belongs to at most
//! one proposal at a time, tracked by the `output_proposal` table.
//!
//! The only allowed re-association is a proposal consuming
//! an output it created itself.

//---------------------------------------------------------------------------------------------------- Import
use std::collections::{BTreeSet, HashMap};

use redb::{MultimapTableDefinition, ReadableTable, WriteTransaction};
use tracing::{error, trace, warn};

use crate::{
    constants::DATABASE_CORRUPT_MSG,
    error::{DbResult, InvariantViolation, StorageError},
    storable::StorableRedb,
    tables::{OUTPUT_PROPOSAL, PROPOSAL_CONSUMED, PROPOSAL_CREATED},
    types::{Association, Outpoint, ProposalId},
};

use super::{
    delete_index,
    index::{Indices, OutpointIndex},
    macros::doc_proposal_error,
    put_index, OutputCache,
};

//---------------------------------------------------------------------------------------------------- Side
/// The two relations between a proposal and an outpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Side {
    Created,
    Consumed,
}

impl Side {
    const fn table(
        self,
    ) -> MultimapTableDefinition<'static, StorableRedb<ProposalId>, StorableRedb<Outpoint>> {
        match self {
            Self::Created => PROPOSAL_CREATED,
            Self::Consumed => PROPOSAL_CONSUMED,
        }
    }

    const fn set(self, data: &Indices) -> &HashMap<ProposalId, BTreeSet<Outpoint>> {
        match self {
            Self::Created => &data.created,
            Self::Consumed => &data.consumed,
        }
    }

    const fn set_mut(
        self,
        data: &mut Indices,
    ) -> &mut HashMap<ProposalId, BTreeSet<Outpoint>> {
        match self {
            Self::Created => &mut data.created,
            Self::Consumed => &mut data.consumed,
        }
    }
}

//---------------------------------------------------------------------------------------------------- OutputCache
impl OutputCache {
    /// Record `outpoint` as created by `proposal`.
    ///
    /// The outpoint must be a known output with no proposal.
    ///
    #[doc = doc_proposal_error!()]
    pub fn create_output(
        &mut self,
        proposal: &ProposalId,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        let result = self.associate_proposal(proposal, outpoint, Side::Created, tx);
        self.check("create_output", result)
    }

    /// Record `outpoint` as consumed by `proposal`.
    ///
    /// The outpoint must be a known output with no proposal,
    /// or one created by this same proposal, in which case it
    /// moves from the created set to the consumed set.
    ///
    #[doc = doc_proposal_error!()]
    pub fn consume_output(
        &mut self,
        proposal: &ProposalId,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        let result = self.associate_proposal(proposal, outpoint, Side::Consumed, tx);
        self.check("consume_output", result)
    }

    /// Release one output created by `proposal`.
    ///
    #[doc = doc_proposal_error!()]
    pub fn proposal_confirm_created(
        &mut self,
        proposal: &ProposalId,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        let result = self.confirm(proposal, outpoint, Side::Created, tx);
        self.check("proposal_confirm_created", result)
    }

    /// Release one output consumed by `proposal`.
    ///
    #[doc = doc_proposal_error!()]
    pub fn proposal_confirm_consumed(
        &mut self,
        proposal: &ProposalId,
        outpoint: Outpoint,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        let result = self.confirm(proposal, outpoint, Side::Consumed, tx);
        self.check("proposal_confirm_consumed", result)
    }

    /// Drop every remaining reservation of `proposal`.
    ///
    /// All of its outputs should have been confirmed already. Any that
    /// were not are still released, and
    /// [`InvariantViolation::UndrainedProposal`] is returned.
    ///
    #[doc = doc_proposal_error!()]
    pub fn finish_proposal(
        &mut self,
        proposal: &ProposalId,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        let result = self.try_finish_proposal(proposal, tx);
        self.check("finish_proposal", result)
    }

    /// How `proposal` relates to `outpoint`.
    ///
    /// # Panics
    /// If the outpoint is both created and consumed by the proposal,
    /// the database is corrupt and this panics.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_association(
        &mut self,
        proposal: &ProposalId,
        outpoint: &Outpoint,
    ) -> DbResult<Association> {
        self.populate()?;

        let created = self.data.created.members(proposal).contains(outpoint);
        let consumed = self.data.consumed.members(proposal).contains(outpoint);

        Ok(match (created, consumed) {
            (true, true) => {
                error!(
                    proposal = hex::encode(proposal),
                    %outpoint,
                    "output is both created and consumed by one proposal"
                );
                panic!("{DATABASE_CORRUPT_MSG}");
            }
            (true, false) => Association::Created,
            (false, true) => Association::Consumed,
            (false, false) => Association::None,
        })
    }

    /// The proposal reserving `outpoint`, if any.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_reservation(&mut self, outpoint: &Outpoint) -> DbResult<Option<ProposalId>> {
        self.populate()?;
        Ok(self.data.output_proposal.get(outpoint).copied())
    }

    /// Outputs still staged by `proposal`.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_proposal_created(&mut self, proposal: &ProposalId) -> DbResult<&BTreeSet<Outpoint>> {
        self.populate()?;
        Ok(self.data.created.members(proposal))
    }

    /// Outputs still reserved by `proposal`.
    ///
    /// # Errors
    /// Returns an error if the cache could not be populated.
    pub fn get_proposal_consumed(
        &mut self,
        proposal: &ProposalId,
    ) -> DbResult<&BTreeSet<Outpoint>> {
        self.populate()?;
        Ok(self.data.consumed.members(proposal))
    }

    //------------------------------------------------------------------------------------------------ Private
    /// Log and clear on a failed proposal operation.
    fn check(
        &mut self,
        op: &'static str,
        result: Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        if let Err(e) = &result {
            error!(op, "proposal operation failed: {e}");
            self.discard();
        }
        result
    }

    fn associate_proposal(
        &mut self,
        proposal: &ProposalId,
        outpoint: Outpoint,
        side: Side,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        self.populate_rw(tx)?;
        self.require_output(&outpoint)?;

        let mut self_consume = false;
        if let Some(existing) = self.data.output_proposal.get(&outpoint).copied() {
            if &existing != proposal {
                return Err(InvariantViolation::AlreadyAssociated { outpoint, existing }.into());
            }

            let created = self.data.created.members(proposal).contains(&outpoint);
            let consumed = self.data.consumed.members(proposal).contains(&outpoint);
            if side != Side::Consumed || !created || consumed {
                return Err(InvariantViolation::IncompatibleAssociation(outpoint).into());
            }
            self_consume = true;
        }

        write_association(tx, proposal, outpoint, side, self_consume)?;

        if self_consume {
            self.data.created.remove_member(proposal, &outpoint);
        }
        side.set_mut(&mut self.data).add(*proposal, outpoint);
        self.data.output_proposal.insert(outpoint, *proposal);

        trace!(proposal = hex::encode(proposal), %outpoint, ?side, self_consume, "associated output");
        Ok(())
    }

    fn confirm(
        &mut self,
        proposal: &ProposalId,
        outpoint: Outpoint,
        side: Side,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        self.populate_rw(tx)?;

        let Some(set) = side.set(&self.data).get(proposal) else {
            return Err(InvariantViolation::MissingProposal(*proposal).into());
        };
        if !set.contains(&outpoint) {
            return Err(InvariantViolation::MissingMember(outpoint).into());
        }

        let reserved = self.data.output_proposal.get(&outpoint) == Some(proposal);
        release(tx, proposal, side, std::iter::once(outpoint), reserved)?;

        side.set_mut(&mut self.data).remove_member(proposal, &outpoint);
        if reserved {
            self.data.output_proposal.remove(&outpoint);
        }

        trace!(proposal = hex::encode(proposal), %outpoint, ?side, "confirmed output");
        Ok(())
    }

    fn try_finish_proposal(
        &mut self,
        proposal: &ProposalId,
        tx: &WriteTransaction,
    ) -> Result<(), StorageError> {
        self.populate_rw(tx)?;

        let mut outstanding = 0;
        for side in [Side::Created, Side::Consumed] {
            let Some(set) = side.set_mut(&mut self.data).remove(proposal) else {
                continue;
            };
            outstanding += set.len();

            release(tx, proposal, side, set.iter().copied(), true)?;
            for outpoint in &set {
                if self.data.output_proposal.get(outpoint) == Some(proposal) {
                    self.data.output_proposal.remove(outpoint);
                }
            }
        }

        if outstanding > 0 {
            warn!(
                proposal = hex::encode(proposal),
                outstanding, "proposal finished with outstanding outputs"
            );
            return Err(InvariantViolation::UndrainedProposal(*proposal).into());
        }

        trace!(proposal = hex::encode(proposal), "finished proposal");
        Ok(())
    }
}

//---------------------------------------------------------------------------------------------------- Table writes
/// Write the rows of a new association.
fn write_association(
    tx: &WriteTransaction,
    proposal: &ProposalId,
    outpoint: Outpoint,
    side: Side,
    self_consume: bool,
) -> DbResult<()> {
    if self_consume {
        delete_index(tx, PROPOSAL_CREATED, *proposal, outpoint)?;
    }
    put_index(tx, side.table(), *proposal, outpoint)?;
    tx.open_table(OUTPUT_PROPOSAL)?.insert(outpoint, proposal)?;
    Ok(())
}

/// Delete the `side` rows of `outpoints`, and their
/// `output_proposal` rows if they point at `proposal`.
fn release(
    tx: &WriteTransaction,
    proposal: &ProposalId,
    side: Side,
    outpoints: impl Iterator<Item = Outpoint>,
    reverse: bool,
) -> DbResult<()> {
    let mut reverse_table = tx.open_table(OUTPUT_PROPOSAL)?;
    for outpoint in outpoints {
        delete_index(tx, side.table(), *proposal, outpoint)?;

        if !reverse {
            continue;
        }
        let points_here = reverse_table
            .get(outpoint)?
            .is_some_and(|p| &p.value() == proposal);
        if points_here {
            reverse_table.remove(outpoint)?;
        }
    }
    Ok(())
}

//---------------------------------------------------------------------------------------------------- Tests
#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    use pretty_assertions::assert_eq;

    use crate::{
        output::OutputIndices,
        tests::{outpoint, output, tmp_shared_env},
        types::{Position, SubchainId, TxoState},
        ConcreteEnv,
    };

    const P1: ProposalId = [1; 32];
    const P2: ProposalId = [2; 32];

    /// A cache with outputs `1..=3` committed.
    fn cache() -> (OutputCache, Arc<ConcreteEnv>, tempfile::TempDir) {
        let (env, tempdir) = tmp_shared_env();
        let mut cache = OutputCache::new(Arc::clone(&env));

        let indices = OutputIndices {
            state: TxoState::UnconfirmedNew,
            position: Position::new(1, [1; 32]),
            account: [1; 32],
            subchain: SubchainId([1; 32]),
        };

        let tx = env.tx_rw().unwrap();
        for i in 1..=3 {
            assert!(cache.add_output_with_indices(outpoint(i), &output(i), indices, &tx));
        }
        tx.commit().unwrap();

        (cache, env, tempdir)
    }

    fn is_invariant(result: Result<(), StorageError>, expected: &InvariantViolation) -> bool {
        matches!(result, Err(StorageError::Invariant(e)) if &e == expected)
    }

    #[test]
    /// A proposal may consume an output it created.
    fn self_consumption() {
        let (mut cache, env, _tempdir) = cache();
        let o = outpoint(1);

        let tx = env.tx_rw().unwrap();
        cache.create_output(&P1, o, &tx).unwrap();
        assert_eq!(cache.get_association(&P1, &o).unwrap(), Association::Created);

        cache.consume_output(&P1, o, &tx).unwrap();
        assert_eq!(cache.get_association(&P1, &o).unwrap(), Association::Consumed);
        assert!(cache.get_proposal_created(&P1).unwrap().is_empty());
        assert_eq!(cache.get_reservation(&o).unwrap(), Some(P1));
        tx.commit().unwrap();

        // The tables agree.
        cache.clear();
        assert_eq!(cache.get_association(&P1, &o).unwrap(), Association::Consumed);
        assert_eq!(cache.get_reservation(&o).unwrap(), Some(P1));
    }

    #[test]
    /// An output belongs to at most one proposal.
    fn other_proposal_rejected() {
        let (mut cache, env, _tempdir) = cache();
        let o = outpoint(1);

        let tx = env.tx_rw().unwrap();
        cache.create_output(&P1, o, &tx).unwrap();

        let expected = InvariantViolation::AlreadyAssociated {
            outpoint: o,
            existing: P1,
        };
        assert!(is_invariant(cache.create_output(&P2, o, &tx), &expected));
        assert!(is_invariant(cache.consume_output(&P2, o, &tx), &expected));
        tx.commit().unwrap();

        // Errors cleared the cache, it reloads from the tables.
        assert_eq!(cache.get_association(&P2, &o).unwrap(), Association::None);
        assert_eq!(cache.get_association(&P1, &o).unwrap(), Association::Created);
        assert_eq!(cache.get_reservation(&o).unwrap(), Some(P1));
    }

    #[test]
    /// Re-associating with the same proposal is only allowed for self-consumption.
    fn incompatible_association() {
        let (mut cache, env, _tempdir) = cache();
        let o = outpoint(1);
        let expected = InvariantViolation::IncompatibleAssociation(o);

        let tx = env.tx_rw().unwrap();
        cache.create_output(&P1, o, &tx).unwrap();
        assert!(is_invariant(cache.create_output(&P1, o, &tx), &expected));

        cache.consume_output(&P1, o, &tx).unwrap();
        assert!(is_invariant(cache.consume_output(&P1, o, &tx), &expected));
        assert!(is_invariant(cache.create_output(&P1, o, &tx), &expected));
    }

    #[test]
    fn unknown_output() {
        let (mut cache, env, _tempdir) = cache();
        let o = outpoint(9);

        let tx = env.tx_rw().unwrap();
        assert!(is_invariant(
            cache.create_output(&P1, o, &tx),
            &InvariantViolation::UnknownOutput(o)
        ));
    }

    #[test]
    fn confirm() {
        let (mut cache, env, _tempdir) = cache();

        let tx = env.tx_rw().unwrap();
        cache.create_output(&P1, outpoint(1), &tx).unwrap();
        cache.consume_output(&P1, outpoint(2), &tx).unwrap();

        assert!(is_invariant(
            cache.proposal_confirm_created(&P2, outpoint(1), &tx),
            &InvariantViolation::MissingProposal(P2)
        ));
        assert!(is_invariant(
            cache.proposal_confirm_created(&P1, outpoint(2), &tx),
            &InvariantViolation::MissingMember(outpoint(2))
        ));

        cache.proposal_confirm_created(&P1, outpoint(1), &tx).unwrap();
        cache.proposal_confirm_consumed(&P1, outpoint(2), &tx).unwrap();
        assert_eq!(cache.get_reservation(&outpoint(1)).unwrap(), None);
        assert_eq!(cache.get_reservation(&outpoint(2)).unwrap(), None);

        // Everything was drained.
        cache.finish_proposal(&P1, &tx).unwrap();
        tx.commit().unwrap();

        cache.clear();
        cache.populate().unwrap();
        assert!(cache.data().created.is_empty());
        assert!(cache.data().consumed.is_empty());
        assert!(cache.data().output_proposal.is_empty());
    }

    #[test]
    /// Finishing a proposal with outstanding outputs fails,
    /// but still releases them.
    fn finish_undrained() {
        let (mut cache, env, _tempdir) = cache();

        let tx = env.tx_rw().unwrap();
        cache.create_output(&P1, outpoint(1), &tx).unwrap();
        cache.consume_output(&P1, outpoint(2), &tx).unwrap();
        cache.consume_output(&P2, outpoint(3), &tx).unwrap();

        assert!(is_invariant(
            cache.finish_proposal(&P1, &tx),
            &InvariantViolation::UndrainedProposal(P1)
        ));
        tx.commit().unwrap();

        assert_eq!(cache.get_association(&P1, &outpoint(1)).unwrap(), Association::None);
        assert_eq!(cache.get_association(&P1, &outpoint(2)).unwrap(), Association::None);
        assert_eq!(cache.get_reservation(&outpoint(1)).unwrap(), None);

        // Other proposals are untouched.
        assert_eq!(cache.get_reservation(&outpoint(3)).unwrap(), Some(P2));

        // Finishing an unknown (or already finished) proposal is fine.
        let tx = env.tx_rw().unwrap();
        cache.finish_proposal(&P1, &tx).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    #[should_panic(expected = "wallet database")]
    /// An outpoint both created and consumed by one proposal is corruption.
    fn both_created_and_consumed() {
        let (mut cache, env, _tempdir) = cache();
        let o = outpoint(1);

        {
            let tx = env.tx_rw().unwrap();
            put_index(&tx, PROPOSAL_CREATED, P1, o).unwrap();
            put_index(&tx, PROPOSAL_CONSUMED, P1, o).unwrap();
            tx.commit().unwrap();
        }

        cache.clear();
        drop(cache.get_association(&P1, &o));
    }
}
