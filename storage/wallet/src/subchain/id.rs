//! Subchain and element identifiers.
//!
//! Both are `blake3` digests of fixed-width little-endian encodings,
//! so they are pure functions of their inputs.

//---------------------------------------------------------------------------------------------------- Import
use crate::types::{
    Bip32Index, ElementId, FilterType, SubaccountId, SubchainId, SubchainIndex, SubchainRole,
    VersionNumber,
};

//---------------------------------------------------------------------------------------------------- Free functions
/// Derive the opaque ID of a subchain.
///
/// The digest covers `subaccount || role || filter || version (LE)`,
/// which is exactly the [`SubchainIndex`] decode row. Bumping `version`
/// yields an unrelated ID.
pub fn subchain_id(
    subaccount: SubaccountId,
    role: SubchainRole,
    filter: FilterType,
    version: VersionNumber,
) -> SubchainId {
    index_id(&SubchainIndex::new(subaccount, role, filter, version))
}

/// [`subchain_id`] of an already built decode row.
pub(crate) fn index_id(index: &SubchainIndex) -> SubchainId {
    SubchainId(*blake3::hash(bytemuck::bytes_of(index)).as_bytes())
}

/// Derive the ID of the element at `index` of `subchain`.
///
/// The digest covers `subchain || index (LE)`.
pub fn element_id(subchain: &SubchainId, index: Bip32Index) -> ElementId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&subchain.0);
    hasher.update(&index.to_le_bytes());
    ElementId(*hasher.finalize().as_bytes())
}
