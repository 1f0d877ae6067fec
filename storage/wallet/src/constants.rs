//! General constants used throughout `cuprate-wallet`.

//---------------------------------------------------------------------------------------------------- Import
use crate::types::VersionNumber;

//---------------------------------------------------------------------------------------------------- Version
/// Current version of the subchain index schema.
///
/// This is both the value stored in the config table and the
/// version component of every [`SubchainId`](crate::types::SubchainId)
/// derived by this build.
///
/// Bumping this makes every existing subchain resolve to a new ID.
/// Rows under the old IDs are migrated and then removed by
/// the upgrade run from [`Subchain::init`](crate::subchain::Subchain::init).
pub const SUBCHAIN_INDEX_VERSION: VersionNumber = 1;

//---------------------------------------------------------------------------------------------------- Error Messages
/// Corrupt database error message.
///
/// The error message shown to end-users in panic
/// messages if we think the database is corrupted.
///
/// This is meant to be user-friendly.
pub const DATABASE_CORRUPT_MSG: &str = r"Cuprate has encountered a fatal error. The wallet database may be corrupted.

The in-memory wallet indices disagree with each other in a way
that cannot be repaired automatically. Restart to rebuild them
from disk; if this keeps happening, rescan the wallet.";

//---------------------------------------------------------------------------------------------------- Misc
/// The file name of the database data file.
pub const DATABASE_DATA_FILENAME: &str = "wallet.redb";

//---------------------------------------------------------------------------------------------------- Tests
#[cfg(test)]
mod test {}
