//! General free functions (related to the database).

//---------------------------------------------------------------------------------------------------- Import
use redb::ReadableTable;
use tracing::{debug, error};

use crate::{
    config::Config,
    env::ConcreteEnv,
    error::InitError,
    tables::{self, CONFIG},
    types::{decode_version, ConfigKey},
};

//---------------------------------------------------------------------------------------------------- Free functions
/// Open the wallet database using the passed [`Config`].
///
/// This calls [`ConcreteEnv::open`] and prepares the
/// database with all the tables it needs.
///
/// The schema version row is left for
/// [`Subchain::init`](crate::subchain::Subchain::init) to migrate,
/// it is only checked to be readable here.
///
/// # Errors
/// This will error if:
/// - The database file could not be opened
/// - A write transaction could not be opened
/// - A table could not be created/opened
/// - The stored schema version row is not a valid width
#[cold]
#[inline(never)] // only called once
pub fn open(config: Config) -> Result<ConcreteEnv, InitError> {
    let env = ConcreteEnv::open(config)?;

    // Create all tables.
    let tx_rw = env.tx_rw()?;
    tables::create_tables(&tx_rw)?;

    {
        let table = tx_rw.open_table(CONFIG)?;
        if let Some(row) = table.get(ConfigKey::Version.key())? {
            let version = decode_version(row.value()).ok_or_else(|| {
                error!(bytes = row.value().len(), "unreadable schema version row");
                InitError::Corrupt
            })?;
            debug!(version, "stored subchain index version");
        };
    }

    tx_rw.commit()?;

    Ok(env)
}

//---------------------------------------------------------------------------------------------------- Tests
#[cfg(test)]
mod test {
    use super::*;

    use crate::tests::tmp_concrete_env;

    #[test]
    /// Re-opening an existing database keeps working.
    fn reopen() {
        let (env, tempdir) = tmp_concrete_env();
        let config = env.config().clone();
        drop(env);

        let env = open(config).unwrap();
        assert!(env.config().db_file().starts_with(tempdir.path()));
    }

    #[test]
    /// A version row of an unknown width is corruption.
    fn bad_version_row() {
        let (env, _tempdir) = tmp_concrete_env();
        let config = env.config().clone();

        {
            let tx_rw = env.tx_rw().unwrap();
            tx_rw
                .open_table(CONFIG)
                .unwrap()
                .insert(ConfigKey::Version.key(), [1_u8, 2, 3].as_slice())
                .unwrap();
            tx_rw.commit().unwrap();
        }

        if cfg!(feature = "redb-memory") {
            return;
        }
        drop(env);

        assert!(matches!(open(config), Err(InitError::Corrupt)));
    }
}
