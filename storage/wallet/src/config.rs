//! Database configuration.
//!
//! This module contains the main [`Config`]uration struct
//! for the wallet database, and the [`SyncMode`] it commits with.

//---------------------------------------------------------------------------------------------------- Import
use std::{borrow::Cow, path::Path};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::constants::DATABASE_DATA_FILENAME;

//---------------------------------------------------------------------------------------------------- SyncMode
/// Disk synchronization mode.
///
/// This controls how/when the database syncs its data to disk.
///
/// Regardless of the variant chosen, dropping
/// [`ConcreteEnv`](crate::ConcreteEnv) will always
/// cause it to fully sync to disk.
#[derive(Copy, Clone, Debug, Default, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SyncMode {
    /// Fully sync to disk per transaction.
    ///
    /// Every write transaction commit will fully sync
    /// all data to disk before returning.
    Safe,

    /// Only flush at database shutdown
    /// or when [`ConcreteEnv::sync`](crate::ConcreteEnv::sync) is called.
    ///
    /// A crash may lose the most recent commits,
    /// but never leaves the database inconsistent.
    #[default]
    Fast,
}

impl SyncMode {
    /// The `redb` durability used for each write transaction.
    pub(crate) const fn durability(self) -> redb::Durability {
        match self {
            Self::Safe => redb::Durability::Immediate,
            Self::Fast => redb::Durability::Eventual,
        }
    }
}

//---------------------------------------------------------------------------------------------------- ConfigBuilder
/// Builder for [`Config`].
#[derive(Debug, Clone, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConfigBuilder {
    /// [`Config::db_directory`].
    db_directory: Cow<'static, Path>,

    /// [`Config::sync_mode`].
    sync_mode: Option<SyncMode>,
}

impl ConfigBuilder {
    /// Create a new [`ConfigBuilder`].
    ///
    /// [`ConfigBuilder::build`] can be called immediately
    /// after this function to use default values.
    pub const fn new(db_directory: Cow<'static, Path>) -> Self {
        Self {
            db_directory,
            sync_mode: None,
        }
    }

    /// Build into a [`Config`].
    ///
    /// # Default values
    /// [`Default::default`] is used for all values (except the `db_directory`).
    pub fn build(self) -> Config {
        // Add the database filename to the directory.
        let db_file = {
            let mut db_file = self.db_directory.to_path_buf();
            db_file.push(DATABASE_DATA_FILENAME);
            Cow::Owned(db_file)
        };

        Config {
            db_directory: self.db_directory,
            db_file,
            sync_mode: self.sync_mode.unwrap_or_default(),
        }
    }

    /// Set a custom database directory (and file) [`Path`].
    #[must_use]
    pub fn db_directory(mut self, db_directory: Cow<'static, Path>) -> Self {
        self.db_directory = db_directory;
        self
    }

    /// Tune the [`ConfigBuilder`] for the highest performing settings.
    ///
    /// Good default for testing, and resource-available machines.
    #[must_use]
    pub const fn fast(mut self) -> Self {
        self.sync_mode = Some(SyncMode::Fast);
        self
    }

    /// Tune the [`ConfigBuilder`] for the safest settings.
    ///
    /// Every commit is synced to disk.
    #[must_use]
    pub const fn low_power(mut self) -> Self {
        self.sync_mode = Some(SyncMode::Safe);
        self
    }

    /// Set a custom [`SyncMode`].
    #[must_use]
    pub const fn sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = Some(sync_mode);
        self
    }
}

//---------------------------------------------------------------------------------------------------- Config
/// Database configuration.
///
/// This is the struct passed to [`open`](crate::open).
///
/// For construction, use [`ConfigBuilder`].
#[derive(Debug, Clone, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// The directory used to store all database files.
    pub(crate) db_directory: Cow<'static, Path>,
    /// The actual database data file.
    ///
    /// This is private, and created from the above `db_directory`.
    pub(crate) db_file: Cow<'static, Path>,

    /// Disk synchronization mode.
    pub sync_mode: SyncMode,
}

impl Config {
    /// Create a new [`Config`] with sane default settings.
    ///
    /// The [`Config::db_directory`] must be passed.
    ///
    /// All other values will be [`Default::default`].
    pub fn new(db_directory: Cow<'static, Path>) -> Self {
        ConfigBuilder::new(db_directory).build()
    }

    /// Return the absolute [`Path`] to the database directory.
    pub const fn db_directory(&self) -> &Cow<'_, Path> {
        &self.db_directory
    }

    /// Return the absolute [`Path`] to the database data file.
    pub const fn db_file(&self) -> &Cow<'_, Path> {
        &self.db_file
    }
}

//---------------------------------------------------------------------------------------------------- Tests
#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let db_directory = tmp_dir.path().to_owned();
        let config = Config::new(db_directory.clone().into());

        assert_eq!(*config.db_directory(), db_directory);
        assert!(config.db_file().starts_with(&db_directory));
        assert!(config.db_file().ends_with(DATABASE_DATA_FILENAME));
        assert_eq!(config.sync_mode, SyncMode::Fast);
    }

    #[test]
    fn builder() {
        let config = ConfigBuilder::new(Cow::Borrowed(Path::new("/a")))
            .db_directory(Cow::Borrowed(Path::new("/b")))
            .low_power()
            .build();

        assert_eq!(*config.db_directory(), PathBuf::from("/b"));
        assert_eq!(config.sync_mode, SyncMode::Safe);
        assert!(matches!(
            config.sync_mode.durability(),
            redb::Durability::Immediate
        ));

        let fast = ConfigBuilder::new(Cow::Borrowed(Path::new("/a")))
            .fast()
            .build();
        assert!(matches!(
            fast.sync_mode.durability(),
            redb::Durability::Eventual
        ));
    }
}
