//! Macros.
//!
//! These generate repetitive documentation
//! for the [`OutputCache`](super::OutputCache) functions.

//---------------------------------------------------------------------------------------------------- Documentation macros
/// Generate documentation for functions that report write failures as `false`.
macro_rules! doc_write_bool {
    () => {
        r"# Failure
Returns `false` if the write to `tx` failed, or if the outpoint is not a known output.
The failure is logged and the in-memory indices are cleared; the caller should abort `tx`."
    };
}
pub(super) use doc_write_bool;

/// Generate documentation for the proposal-lifecycle errors.
macro_rules! doc_proposal_error {
    () => {
        r"# Errors
Returns [`StorageError::Invariant`](crate::StorageError::Invariant) if the reservation rules are broken,
or [`StorageError::Write`](crate::StorageError::Write) on database errors.
On any error the in-memory indices are cleared."
    };
}
pub(super) use doc_proposal_error;
