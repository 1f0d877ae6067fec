//! The database environment, backed by `redb`.

//---------------------------------------------------------------------------------------------------- Import
use tracing::warn;

use crate::{
    config::Config,
    error::{DbResult, InitError},
};

//---------------------------------------------------------------------------------------------------- ConcreteEnv
/// A strongly typed, concrete database environment, backed by `redb`.
///
/// Created by [`open`](crate::open), shared behind an `Arc`
/// by the [`OutputCache`](crate::output::OutputCache) and the
/// [`Subchain`](crate::subchain::Subchain) coordinator.
pub struct ConcreteEnv {
    /// The actual database environment.
    env: redb::Database,

    /// The configuration we were opened with
    /// (and in current use).
    config: Config,

    /// A cached, redb version of [`SyncMode`](crate::config::SyncMode).
    /// `redb` needs the sync mode to be set _per_ TX, so we
    /// will continue to use this value every [`ConcreteEnv::tx_rw`].
    durability: redb::Durability,
}

impl Drop for ConcreteEnv {
    fn drop(&mut self) {
        // INVARIANT: drop(ConcreteEnv) must sync.
        if let Err(e) = self.sync() {
            warn!("Env sync error: {e}");
        }
    }
}

impl std::fmt::Debug for ConcreteEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcreteEnv")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConcreteEnv {
    /// Open the database file (or the in-memory backend), creating it if needed.
    ///
    /// This does not create any tables, see [`open`](crate::open).
    #[cold]
    #[inline(never)] // called once.
    pub(crate) fn open(config: Config) -> Result<Self, InitError> {
        let durability = config.sync_mode.durability();

        let env_builder = redb::Builder::new();

        // Use the in-memory backend if the feature is enabled.
        let env = if cfg!(feature = "redb-memory") {
            env_builder.create_with_backend(redb::backends::InMemoryBackend::new())?
        } else {
            // Create the database directory if it doesn't exist.
            std::fs::create_dir_all(config.db_directory())?;

            // Open the database file, create if needed.
            let db_file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(config.db_file())?;

            env_builder.create_file(db_file)?
        };

        Ok(Self {
            env,
            config,
            durability,
        })
    }

    /// Return the [`Config`] this database was opened with.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Fully sync the database to disk.
    ///
    /// # Errors
    /// Returns an error if the sync commit fails.
    pub fn sync(&self) -> DbResult<()> {
        // `redb`'s syncs are tied with write transactions,
        // so just create one, don't do anything and commit.
        let mut tx_rw = self.env.begin_write()?;
        tx_rw.set_durability(redb::Durability::Immediate);
        tx_rw.set_two_phase_commit(true);
        tx_rw.commit()?;
        Ok(())
    }

    /// Begin a read-only transaction.
    ///
    /// # Errors
    /// Returns an error if the transaction cannot be started.
    #[inline]
    pub fn tx_ro(&self) -> DbResult<redb::ReadTransaction> {
        Ok(self.env.begin_read()?)
    }

    /// Begin a read/write transaction.
    ///
    /// Only one may exist at a time, this blocks until
    /// any other write transaction is committed or aborted.
    ///
    /// # Errors
    /// Returns an error if the transaction cannot be started.
    #[inline]
    pub fn tx_rw(&self) -> DbResult<redb::WriteTransaction> {
        // `redb` has sync modes on the TX level,
        // so set the durability here before returning the TX.
        let mut tx_rw = self.env.begin_write()?;
        tx_rw.set_durability(self.durability);
        Ok(tx_rw)
    }
}

//---------------------------------------------------------------------------------------------------- Tests
#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::{config::SyncMode, tests::tmp_concrete_env};

    #[test]
    /// The file is created where the config says.
    fn open_creates_file() {
        let (env, tempdir) = tmp_concrete_env();

        assert!(env.config().db_file().starts_with(tempdir.path()));
        if !cfg!(feature = "redb-memory") {
            assert!(env.config().db_file().exists());
        }
        assert_eq!(env.config().sync_mode, SyncMode::Safe);
    }

    #[test]
    fn transactions() {
        let (env, _tempdir) = tmp_concrete_env();

        env.tx_rw().unwrap().commit().unwrap();
        drop(env.tx_ro().unwrap());
        env.sync().unwrap();
    }
}
