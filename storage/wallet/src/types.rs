//! Wallet [table](crate::tables) types.
//!
//! This module contains all types used by the database tables,
//! and aliases for common wallet types that share the
//! same underlying primitive type.
//!
//! The fixed-width types are cast to/from bytes with `bytemuck`,
//! so only `bytemuck`'s derive macros may be used to implement
//! [`Pod`] on them. The derive fails at compile time if a
//! type has padding or otherwise cannot be cast.

#![forbid(unsafe_code)]

//---------------------------------------------------------------------------------------------------- Import
use std::fmt::{self, Display};

use borsh::{BorshDeserialize, BorshSerialize};
use bytemuck::{Pod, Zeroable};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::storable::Storable;

//---------------------------------------------------------------------------------------------------- Aliases
/// A block's height.
pub type BlockHeight = u64;

/// A block's hash.
pub type BlockHash = [u8; 32];

/// A transaction's hash.
pub type TxHash = [u8; 32];

/// An output's amount.
pub type Amount = u64;

/// A wallet account.
pub type AccountId = [u8; 32];

/// A subaccount of a wallet account.
pub type SubaccountId = [u8; 32];

/// A wallet nym (identity).
pub type NymId = [u8; 32];

/// An in-flight spend proposal.
pub type ProposalId = [u8; 32];

/// A BIP-32 style derivation index.
pub type Bip32Index = u32;

/// Schema version of the subchain index.
pub type VersionNumber = u32;

//---------------------------------------------------------------------------------------------------- Outpoint
/// The identity of one transaction output.
///
/// This is the key to the [`Outputs`](crate::tables::OUTPUTS) table,
/// and the value of every secondary index.
///
/// ```rust
/// # use cuprate_wallet::{Storable, types::*};
/// let a = Outpoint::new([1; 32], 3);
/// let b = Storable::as_bytes(&a);
/// let c: Outpoint = Storable::from_bytes(b);
/// assert_eq!(a, c);
/// ```
///
/// # Size & Alignment
/// ```rust
/// # use cuprate_wallet::types::*;
/// assert_eq!(size_of::<Outpoint>(), 36);
/// assert_eq!(align_of::<Outpoint>(), 4);
/// ```
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Eq, Ord, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Outpoint {
    /// Hash of the transaction that created the output.
    pub txid: TxHash,
    /// Index of the output within that transaction.
    pub index: u32,
}

impl Outpoint {
    /// Create a new [`Outpoint`].
    pub const fn new(txid: TxHash, index: u32) -> Self {
        Self { txid, index }
    }
}

impl Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.txid), self.index)
    }
}

//---------------------------------------------------------------------------------------------------- Position
/// A `(height, block hash)` pair.
///
/// Used both as the block an output was seen in
/// and as the scan cursor of a subchain.
///
/// # Size & Alignment
/// ```rust
/// # use cuprate_wallet::types::*;
/// assert_eq!(size_of::<Position>(), 40);
/// assert_eq!(align_of::<Position>(), 8);
/// ```
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Default, PartialEq, PartialOrd, Eq, Ord, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Position {
    /// Block height.
    pub height: BlockHeight,
    /// Block hash.
    pub hash: BlockHash,
}

impl Position {
    /// Create a new [`Position`].
    pub const fn new(height: BlockHeight, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.height, hex::encode(self.hash))
    }
}

//---------------------------------------------------------------------------------------------------- TxoState
/// The spend state of a wallet output.
///
/// An output is filed under exactly one of these at any time.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[repr(u8)]
pub enum TxoState {
    UnconfirmedNew = 0,
    ConfirmedNew = 1,
    UnconfirmedSpend = 2,
    ConfirmedSpend = 3,
    OrphanedNew = 4,
    OrphanedSpend = 5,
    Immature = 6,
}

impl TxoState {
    /// Every state, in discriminant order.
    pub const ALL: [Self; 7] = [
        Self::UnconfirmedNew,
        Self::ConfirmedNew,
        Self::UnconfirmedSpend,
        Self::ConfirmedSpend,
        Self::OrphanedNew,
        Self::OrphanedSpend,
        Self::Immature,
    ];

    /// The raw table key of this state.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for TxoState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::UnconfirmedNew,
            1 => Self::ConfirmedNew,
            2 => Self::UnconfirmedSpend,
            3 => Self::ConfirmedSpend,
            4 => Self::OrphanedNew,
            5 => Self::OrphanedSpend,
            6 => Self::Immature,
            _ => return Err(value),
        })
    }
}

//---------------------------------------------------------------------------------------------------- SubchainRole
/// The derivation role of a subchain within a subaccount.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[repr(u8)]
pub enum SubchainRole {
    Internal = 0,
    External = 1,
    Incoming = 2,
    Outgoing = 3,
    Notification = 4,
    None = 5,
}

impl TryFrom<u8> for SubchainRole {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Internal,
            1 => Self::External,
            2 => Self::Incoming,
            3 => Self::Outgoing,
            4 => Self::Notification,
            5 => Self::None,
            _ => return Err(value),
        })
    }
}

//---------------------------------------------------------------------------------------------------- FilterType
/// The block filter type a subchain is matched with.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[repr(u8)]
pub enum FilterType {
    Basic = 0,
    BasicBch = 1,
    Es = 2,
}

impl TryFrom<u8> for FilterType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Basic,
            1 => Self::BasicBch,
            2 => Self::Es,
            _ => return Err(value),
        })
    }
}

//---------------------------------------------------------------------------------------------------- KeyId
/// A derived key: `(subaccount, role, index)`.
///
/// Outputs list the keys that can spend them; each
/// key is a secondary index into the output set.
///
/// # Size & Alignment
/// ```rust
/// # use cuprate_wallet::types::*;
/// assert_eq!(size_of::<KeyId>(), 37);
/// assert_eq!(align_of::<KeyId>(), 1);
/// ```
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    PartialOrd,
    Eq,
    Ord,
    Hash,
    Pod,
    Zeroable,
    BorshSerialize,
    BorshDeserialize,
)]
#[repr(C)]
pub struct KeyId {
    subaccount: SubaccountId,
    role: u8,
    index: [u8; 4],
}

impl KeyId {
    /// Create a new [`KeyId`].
    pub const fn new(subaccount: SubaccountId, role: SubchainRole, index: Bip32Index) -> Self {
        Self {
            subaccount,
            role: role as u8,
            index: index.to_le_bytes(),
        }
    }

    /// The subaccount this key belongs to.
    pub const fn subaccount(&self) -> &SubaccountId {
        &self.subaccount
    }

    /// The subchain role of this key, [`None`] if the stored byte is unknown.
    pub fn role(&self) -> Option<SubchainRole> {
        SubchainRole::try_from(self.role).ok()
    }

    /// The derivation index of this key.
    pub const fn index(&self) -> Bip32Index {
        u32::from_le_bytes(self.index)
    }
}

//---------------------------------------------------------------------------------------------------- SubchainIndex
/// The components a [`SubchainId`] is derived from.
///
/// This is the value of the [`SUBCHAIN_IDS`](crate::tables::SUBCHAIN_IDS)
/// table, and lets an opaque ID be decoded back into its parts.
///
/// # Size & Alignment
/// ```rust
/// # use cuprate_wallet::types::*;
/// assert_eq!(size_of::<SubchainIndex>(), 38);
/// assert_eq!(align_of::<SubchainIndex>(), 1);
/// ```
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Eq, Ord, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct SubchainIndex {
    subaccount: SubaccountId,
    role: u8,
    filter: u8,
    version: [u8; 4],
}

impl SubchainIndex {
    /// Create a new [`SubchainIndex`].
    pub const fn new(
        subaccount: SubaccountId,
        role: SubchainRole,
        filter: FilterType,
        version: VersionNumber,
    ) -> Self {
        Self {
            subaccount,
            role: role as u8,
            filter: filter as u8,
            version: version.to_le_bytes(),
        }
    }

    /// The subaccount.
    pub const fn subaccount(&self) -> &SubaccountId {
        &self.subaccount
    }

    /// The subchain role, [`None`] if the stored byte is unknown.
    pub fn role(&self) -> Option<SubchainRole> {
        SubchainRole::try_from(self.role).ok()
    }

    /// The filter type, [`None`] if the stored byte is unknown.
    pub fn filter(&self) -> Option<FilterType> {
        FilterType::try_from(self.filter).ok()
    }

    /// The schema version.
    pub const fn version(&self) -> VersionNumber {
        u32::from_le_bytes(self.version)
    }

    /// The same components at another schema version.
    #[must_use]
    pub const fn with_version(mut self, version: VersionNumber) -> Self {
        self.version = version.to_le_bytes();
        self
    }
}

//---------------------------------------------------------------------------------------------------- SubchainId
/// Opaque identifier of one scanning subchain.
///
/// See [`crate::subchain::subchain_id`].
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Default, PartialEq, PartialOrd, Eq, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct SubchainId(pub [u8; 32]);

impl Display for SubchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

//---------------------------------------------------------------------------------------------------- ElementId
/// Identifier of one derived element (one index) of a subchain.
///
/// See [`crate::subchain::element_id`].
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Default, PartialEq, PartialOrd, Eq, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct ElementId(pub [u8; 32]);

impl Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

//---------------------------------------------------------------------------------------------------- Pattern
/// A matchable byte fragment and the derivation index it came from.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct Pattern {
    /// Derivation index of the element.
    pub index: Bip32Index,
    /// Raw bytes to match against block filters.
    pub data: Vec<u8>,
}

impl Pattern {
    /// Create a new [`Pattern`].
    pub const fn new(index: Bip32Index, data: Vec<u8>) -> Self {
        Self { index, data }
    }

    /// Encode as a table row: `index (LE) || data`.
    pub fn to_row(&self) -> Vec<u8> {
        let mut row = Vec::with_capacity(4 + self.data.len());
        row.extend_from_slice(&self.index.to_le_bytes());
        row.extend_from_slice(&self.data);
        row
    }

    /// Decode a table row, [`None`] if it is shorter than the index.
    pub fn from_row(row: &[u8]) -> Option<Self> {
        let (index, data) = row.split_first_chunk::<4>()?;
        Some(Self {
            index: u32::from_le_bytes(*index),
            data: data.to_vec(),
        })
    }
}

//---------------------------------------------------------------------------------------------------- Output
/// A wallet output.
///
/// This is stored `borsh` encoded as the value
/// of the [`OUTPUTS`](crate::tables::OUTPUTS) table.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Output {
    /// Amount of the output.
    pub amount: Amount,
    /// Locking script.
    pub script: Vec<u8>,
    /// Keys able to spend this output.
    pub keys: Vec<KeyId>,
}

impl Output {
    /// Serialize into the stored blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 4 + self.script.len() + 4 + self.keys.len() * 37);
        // Writing into a `Vec` never returns an I/O error.
        if let Err(e) = self.serialize(&mut bytes) {
            unreachable!("{e}");
        }
        bytes
    }

    /// Deserialize from the stored blob.
    ///
    /// # Errors
    /// Returns an error if `bytes` is not a valid encoding.
    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<Self> {
        borsh::from_slice(bytes)
    }
}

//---------------------------------------------------------------------------------------------------- Association
/// How a proposal relates to an outpoint.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Association {
    /// No relation.
    #[default]
    None,
    /// The proposal creates the output.
    Created,
    /// The proposal spends the output.
    Consumed,
}

//---------------------------------------------------------------------------------------------------- Config rows
/// Keys of the [`CONFIG`](crate::tables::CONFIG) table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum ConfigKey {
    /// Schema version of the subchain index.
    Version = 0,
    /// Wallet-wide tip [`Position`].
    WalletTip = 1,
}

impl ConfigKey {
    pub(crate) const fn key(self) -> u64 {
        self as u64
    }
}

/// Decode a stored schema version.
///
/// Rows are written 8 bytes wide, older databases wrote
/// them 4 bytes wide; both are read as little-endian.
pub(crate) fn decode_version(bytes: &[u8]) -> Option<VersionNumber> {
    match bytes.len() {
        4 => Some(u32::from_le_bytes(bytes.try_into().ok()?)),
        8 => u32::try_from(u64::from_le_bytes(bytes.try_into().ok()?)).ok(),
        _ => None,
    }
}

/// Encode a schema version as a config row.
pub(crate) const fn encode_version(version: VersionNumber) -> [u8; 8] {
    (version as u64).to_le_bytes()
}

/// Decode the stored wallet tip.
pub(crate) fn decode_position(bytes: &[u8]) -> Option<Position> {
    (bytes.len() == size_of::<Position>()).then(|| <Position as Storable>::from_bytes(bytes))
}

//---------------------------------------------------------------------------------------------------- Tests
#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn txo_state_round_trip() {
        for state in TxoState::ALL {
            assert_eq!(TxoState::try_from(state.to_u8()), Ok(state));
        }
        assert_eq!(TxoState::try_from(7), Err(7));
    }

    #[test]
    fn key_id_layout() {
        let key = KeyId::new([3; 32], SubchainRole::External, 0x0102_0304);
        let bytes = Storable::as_bytes(&key);

        assert_eq!(bytes.len(), 37);
        assert_eq!(&bytes[..32], &[3; 32]);
        assert_eq!(bytes[32], SubchainRole::External as u8);
        assert_eq!(&bytes[33..], &[4, 3, 2, 1]);
        assert_eq!(key.role(), Some(SubchainRole::External));
        assert_eq!(key.index(), 0x0102_0304);
    }

    #[test]
    fn subchain_index_layout() {
        let index = SubchainIndex::new([5; 32], SubchainRole::Internal, FilterType::Es, 2);
        let bytes = Storable::as_bytes(&index);

        assert_eq!(bytes.len(), 38);
        assert_eq!(bytes[32], 0);
        assert_eq!(bytes[33], 2);
        assert_eq!(&bytes[34..], &[2, 0, 0, 0]);
        assert_eq!(index.with_version(9).version(), 9);
        assert_eq!(index.filter(), Some(FilterType::Es));
    }

    #[test]
    fn pattern_row() {
        let pattern = Pattern::new(258, vec![0xAA, 0xBB]);
        let row = pattern.to_row();

        assert_eq!(row, vec![2, 1, 0, 0, 0xAA, 0xBB]);
        assert_eq!(Pattern::from_row(&row), Some(pattern));
        assert_eq!(Pattern::from_row(&[1, 2]), None);
        assert_eq!(Pattern::from_row(&[0; 4]), Some(Pattern::new(0, vec![])));
    }

    #[test]
    fn output_blob() {
        let output = Output {
            amount: 5_000,
            script: vec![0x51],
            keys: vec![KeyId::new([1; 32], SubchainRole::External, 7)],
        };

        let bytes = output.to_bytes();
        assert_eq!(Output::from_bytes(&bytes).unwrap(), output);
        assert!(Output::from_bytes(&bytes[..3]).is_err());
    }

    #[test]
    /// Both historical widths of the version row are readable.
    fn version_widths() {
        assert_eq!(decode_version(&encode_version(3)), Some(3));
        assert_eq!(decode_version(&3_u32.to_le_bytes()), Some(3));
        assert_eq!(decode_version(&[1, 2]), None);
        assert_eq!(decode_version(&u64::MAX.to_le_bytes()), None);
    }

    #[test]
    fn display() {
        let outpoint = Outpoint::new([0xAB; 32], 1);
        assert!(outpoint.to_string().ends_with("abab:1"));
        assert_eq!(SubchainId([0; 32]).to_string().len(), 64);
    }
}
