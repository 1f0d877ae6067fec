//! Database tables.
//!
//! Every durable table of the wallet database, defined as
//! `redb` table definitions. Single-value tables map a key to one
//! value, multimap tables hold many (sorted, de-duplicated) values
//! per key.

//---------------------------------------------------------------------------------------------------- Import
use crate::{
    storable::StorableRedb,
    types::{
        AccountId, ElementId, KeyId, NymId, Outpoint, Position, ProposalId, SubchainId,
        SubchainIndex,
    },
};

//---------------------------------------------------------------------------------------------------- Tables
/// Define every table, and a function that creates all of them.
///
/// The table name strings are persisted on disk and must never change.
macro_rules! define_tables {
    (
        single {
            $(
                $(#[$single_attr:meta])*
                $single:ident: $single_key:ty => $single_value:ty = $single_name:literal,
            )*
        }
        multimap {
            $(
                $(#[$multi_attr:meta])*
                $multi:ident: $multi_key:ty => $multi_value:ty = $multi_name:literal,
            )*
        }
    ) => {
        $(
            $(#[$single_attr])*
            pub(crate) const $single: redb::TableDefinition<'static, $single_key, $single_value> =
                redb::TableDefinition::new($single_name);
        )*

        $(
            $(#[$multi_attr])*
            pub(crate) const $multi: redb::MultimapTableDefinition<'static, $multi_key, $multi_value> =
                redb::MultimapTableDefinition::new($multi_name);
        )*

        /// The name of every table.
        #[cfg(test)]
        pub(crate) const TABLE_NAMES: &[&str] = &[$($single_name,)* $($multi_name,)*];

        /// Create every table that does not exist yet.
        ///
        /// `redb` creates tables on their first open within a write transaction.
        pub(crate) fn create_tables(tx_rw: &redb::WriteTransaction) -> Result<(), redb::TableError> {
            $(
                tx_rw.open_table($single)?;
            )*
            $(
                tx_rw.open_multimap_table($multi)?;
            )*
            Ok(())
        }
    };
}

define_tables! {
    single {
        /// Schema version and wallet tip rows.
        ///
        /// Keyed by `ConfigKey`, values are raw bytes.
        CONFIG: u64 => &'static [u8] = "config",

        /// The authoritative output set.
        ///
        /// Values are `borsh` encoded [`Output`](crate::types::Output)s.
        OUTPUTS: StorableRedb<Outpoint> => &'static [u8] = "outputs",

        /// The single live proposal reserving an outpoint.
        OUTPUT_PROPOSAL: StorableRedb<Outpoint> => StorableRedb<ProposalId> = "output_proposal",

        /// Decode rows of every opaque subchain ID.
        SUBCHAIN_IDS: StorableRedb<SubchainId> => StorableRedb<SubchainIndex> = "subchain_ids",

        /// Highest derivation index with generated patterns.
        SUBCHAIN_LAST_INDEXED: StorableRedb<SubchainId> => u32 = "subchain_last_indexed",

        /// Position scanning has reached.
        SUBCHAIN_LAST_SCANNED: StorableRedb<SubchainId> => StorableRedb<Position> = "subchain_last_scanned",
    }
    multimap {
        ACCOUNTS: StorableRedb<AccountId> => StorableRedb<Outpoint> = "accounts",
        KEYS: StorableRedb<KeyId> => StorableRedb<Outpoint> = "keys",
        NYMS: StorableRedb<NymId> => StorableRedb<Outpoint> = "nyms",
        POSITIONS: StorableRedb<Position> => StorableRedb<Outpoint> = "positions",
        /// Keyed by the raw [`TxoState`](crate::types::TxoState).
        STATES: StorableRedb<u8> => StorableRedb<Outpoint> = "states",
        SUBCHAINS: StorableRedb<SubchainId> => StorableRedb<Outpoint> = "subchains",

        PROPOSAL_CREATED: StorableRedb<ProposalId> => StorableRedb<Outpoint> = "proposal_created",
        PROPOSAL_CONSUMED: StorableRedb<ProposalId> => StorableRedb<Outpoint> = "proposal_consumed",

        /// Generation outputs, ordered by height.
        GENERATION: u64 => StorableRedb<Outpoint> = "generation",

        /// Pattern rows (`index || bytes`) of each element.
        WALLET_PATTERNS: StorableRedb<ElementId> => &'static [u8] = "wallet_patterns",

        /// Elements registered under each subchain.
        SUBCHAIN_PATTERNS: StorableRedb<SubchainId> => StorableRedb<ElementId> = "subchain_patterns",
    }
}
