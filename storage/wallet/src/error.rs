//! Database error types.
//!
//! Also holds the conversions from `redb`'s errors.
//!
//! HACK: There's a lot of `_ =>` usage in the conversions
//! because `redb`'s errors are `#[non_exhaustive]`...

//---------------------------------------------------------------------------------------------------- Import
use crate::{
    constants::DATABASE_CORRUPT_MSG,
    types::{Outpoint, ProposalId},
};

//---------------------------------------------------------------------------------------------------- Types
/// Alias for a thread-safe boxed error.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// `Result<T, RuntimeError>`
pub type DbResult<T> = Result<T, RuntimeError>;

//---------------------------------------------------------------------------------------------------- InitError
/// Errors that occur during [`open`](crate::open).
///
/// # Handling
/// As this is a database initialization error, the correct
/// way to handle any of these occurring is probably just to
/// exit the program.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    /// The given `Path/File` existed and was accessible,
    /// but was not a valid database file.
    #[error("database file exists but is not valid")]
    Invalid,

    /// The given `Path/File` existed, was a valid
    /// database, but the version is incorrect.
    #[error("database file is valid, but version is incorrect")]
    InvalidVersion,

    /// I/O error.
    #[error("database I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The given `Path/File` existed,
    /// was a valid database, but it is corrupt.
    #[error("database file is corrupt")]
    Corrupt,

    /// An unknown error occurred.
    #[error("unknown error: {0}")]
    Unknown(BoxError),
}

//---------------------------------------------------------------------------------------------------- RuntimeError
/// Errors that occur _after_ a successful [`open`](crate::open).
///
/// There are no errors for (de)serialization of fixed-width
/// types, as the byte casts in [`Storable`](crate::Storable)
/// cannot fail.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    /// The given key did not exist in the database.
    #[error("key/value pair was not found")]
    KeyNotFound,

    /// The given table did not exist in the database.
    #[error("database table did not exist")]
    TableNotFound,

    /// A [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be decoded.
    #[error("corrupt value: {0}")]
    Corrupt(String),

    /// The subchain index upgrade has not finished yet.
    #[error("subchain index upgrade has not finished")]
    UpgradePending,

    /// Any other engine error.
    #[error("database error: {0}")]
    Unknown(String),
}

//---------------------------------------------------------------------------------------------------- InvariantViolation
/// A broken rule of the proposal-reservation protocol.
///
/// These are always caught at the proposal-lifecycle boundary
/// and reported to the caller as a [`StorageError::Invariant`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The outpoint is not in the output set.
    #[error("output {0} does not exist")]
    UnknownOutput(Outpoint),

    /// A required index key was empty (all zeros).
    #[error("the {0} of a new output must not be empty")]
    EmptyKey(&'static str),

    /// The outpoint is reserved by another proposal.
    #[error("output {outpoint} is already associated with proposal {}", hex::encode(.existing))]
    AlreadyAssociated {
        outpoint: Outpoint,
        existing: ProposalId,
    },

    /// The outpoint is already associated with this
    /// proposal in a way that forbids the new association.
    #[error("output {0} has an incompatible association with this proposal")]
    IncompatibleAssociation(Outpoint),

    /// The proposal has no set of the requested kind.
    #[error("proposal {} does not exist", hex::encode(.0))]
    MissingProposal(ProposalId),

    /// The outpoint is not a member of the proposal's set.
    #[error("output {0} is not a member of the proposal")]
    MissingMember(Outpoint),

    /// The proposal still had outstanding outputs when finished.
    #[error("proposal {} still had outstanding outputs", hex::encode(.0))]
    UndrainedProposal(ProposalId),
}

//---------------------------------------------------------------------------------------------------- StorageError
/// Errors returned by proposal-lifecycle operations.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// A durable write failed.
    #[error(transparent)]
    Write(#[from] RuntimeError),

    /// A protocol rule was broken.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

//---------------------------------------------------------------------------------------------------- InitError from redb
impl From<redb::DatabaseError> for InitError {
    /// Created by `redb` in:
    /// - [`redb::Database::create`](https://docs.rs/redb/2.1.0/redb/struct.Database.html#method.create).
    fn from(error: redb::DatabaseError) -> Self {
        use redb::DatabaseError as E;
        use redb::StorageError as E2;

        match error {
            E::RepairAborted => Self::Corrupt,
            E::UpgradeRequired(_) => Self::InvalidVersion,
            E::Storage(s_error) => match s_error {
                E2::Io(e) => Self::Io(e),
                E2::Corrupted(_) => Self::Corrupt,

                // HACK: Handle new errors as `redb` adds them.
                _ => Self::Unknown(Box::new(s_error)),
            },

            // HACK: Handle new errors as `redb` adds them.
            _ => Self::Unknown(Box::new(error)),
        }
    }
}

impl From<redb::StorageError> for InitError {
    fn from(error: redb::StorageError) -> Self {
        use redb::StorageError as E;

        match error {
            E::Io(e) => Self::Io(e),
            E::Corrupted(_) => Self::Corrupt,
            // HACK: Handle new errors as `redb` adds them.
            _ => Self::Unknown(Box::new(error)),
        }
    }
}

impl From<redb::TransactionError> for InitError {
    fn from(error: redb::TransactionError) -> Self {
        match error {
            redb::TransactionError::Storage(error) => error.into(),
            // HACK: Handle new errors as `redb` adds them.
            _ => Self::Unknown(Box::new(error)),
        }
    }
}

impl From<redb::TableError> for InitError {
    fn from(error: redb::TableError) -> Self {
        match error {
            redb::TableError::Storage(error) => error.into(),
            // HACK: Handle new errors as `redb` adds them.
            _ => Self::Unknown(Box::new(error)),
        }
    }
}

impl From<redb::CommitError> for InitError {
    fn from(error: redb::CommitError) -> Self {
        match error {
            redb::CommitError::Storage(error) => error.into(),
            // HACK: Handle new errors as `redb` adds them.
            _ => Self::Unknown(Box::new(error)),
        }
    }
}

impl From<RuntimeError> for InitError {
    fn from(error: RuntimeError) -> Self {
        match error {
            RuntimeError::Io(e) => Self::Io(e),
            RuntimeError::Corrupt(_) => Self::Corrupt,
            RuntimeError::KeyNotFound
            | RuntimeError::TableNotFound
            | RuntimeError::UpgradePending
            | RuntimeError::Unknown(_) => Self::Unknown(Box::new(error)),
        }
    }
}

//---------------------------------------------------------------------------------------------------- RuntimeError from redb
impl From<redb::TransactionError> for RuntimeError {
    /// Created by `redb` in:
    /// - [`redb::Database::begin_write`](https://docs.rs/redb/2.1.0/redb/struct.Database.html#method.begin_write)
    /// - [`redb::Database::begin_read`](https://docs.rs/redb/2.1.0/redb/struct.Database.html#method.begin_read)
    fn from(error: redb::TransactionError) -> Self {
        match error {
            redb::TransactionError::Storage(error) => error.into(),

            // HACK: Handle new errors as `redb` adds them.
            _ => Self::Unknown(error.to_string()),
        }
    }
}

impl From<redb::CommitError> for RuntimeError {
    /// Created by `redb` in:
    /// - [`redb::WriteTransaction::commit`](https://docs.rs/redb/2.1.0/redb/struct.WriteTransaction.html#method.commit)
    fn from(error: redb::CommitError) -> Self {
        match error {
            redb::CommitError::Storage(error) => error.into(),

            // HACK: Handle new errors as `redb` adds them.
            _ => Self::Unknown(error.to_string()),
        }
    }
}

#[expect(clippy::fallible_impl_from, reason = "table mismatches are bugs")]
impl From<redb::TableError> for RuntimeError {
    /// Created by `redb` in:
    /// - [`redb::WriteTransaction::open_table`](https://docs.rs/redb/2.1.0/redb/struct.WriteTransaction.html#method.open_table)
    /// - [`redb::ReadTransaction::open_table`](https://docs.rs/redb/2.1.0/redb/struct.ReadTransaction.html#method.open_table)
    fn from(error: redb::TableError) -> Self {
        use redb::TableError as E;

        match error {
            E::Storage(error) => error.into(),

            E::TableDoesNotExist(_) => Self::TableNotFound,

            // Only if we write incorrect code.
            E::TableTypeMismatch { .. }
            | E::TableIsMultimap(_)
            | E::TableIsNotMultimap(_)
            | E::TypeDefinitionChanged { .. }
            | E::TableAlreadyOpen(..) => panic!("fix the database code! {error:#?}"),

            // HACK: Handle new errors as `redb` adds them.
            _ => Self::Unknown(error.to_string()),
        }
    }
}

#[expect(clippy::fallible_impl_from, reason = "corruption is fatal")]
impl From<redb::StorageError> for RuntimeError {
    /// Created by `redb` in:
    /// - [`redb::Table`](https://docs.rs/redb/2.1.0/redb/struct.Table.html) functions
    /// - [`redb::ReadOnlyTable`](https://docs.rs/redb/2.1.0/redb/struct.ReadOnlyTable.html) functions
    fn from(error: redb::StorageError) -> Self {
        use redb::StorageError as E;

        match error {
            E::Io(e) => Self::Io(e),
            E::Corrupted(s) => {
                tracing::error!("{s}");
                panic!("{s:#?}\n{DATABASE_CORRUPT_MSG}")
            }
            E::ValueTooLarge(s) => panic!("fix the database code! {s:#?}"),

            // HACK: Handle new errors as `redb` adds them.
            _ => Self::Unknown(error.to_string()),
        }
    }
}
