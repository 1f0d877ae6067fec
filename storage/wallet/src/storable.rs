//! (De)serialization for table keys & values.
//!
//! Also contains the glue that lets any [`Storable`]
//! type be used as a `redb` key or value.

//---------------------------------------------------------------------------------------------------- Import
use std::{any::type_name, cmp::Ordering, fmt::Debug, marker::PhantomData};

use bytemuck::Pod;
use redb::TypeName;

//---------------------------------------------------------------------------------------------------- Storable
/// Storable types in the database.
///
/// All keys and values in the database must be able
/// to be (de)serialized into/from raw bytes (`[u8]`).
///
/// This trait represents types that can be **perfectly**
/// casted/represented as raw bytes.
///
/// # `bytemuck`
/// Any type that implements `bytemuck`'s [`Pod`]
/// (and [Debug]) will automatically implement [`Storable`].
///
/// All the fixed-width wallet types in [`crate::types`]
/// are `#[repr(C)]` without padding, so their byte form
/// is exactly their fields laid out in order.
///
/// # Invariants
/// No function in this trait is expected to panic.
///
/// The byte conversions must execute flawlessly.
pub trait Storable: Debug + Sized {
    /// Is this type fixed width in byte length?
    ///
    /// I.e., when converting `Self` to bytes, is it
    /// represented with a fixed length array of bytes?
    const BYTE_LENGTH: Option<usize>;

    /// Return `self` in byte form.
    fn as_bytes(&self) -> &[u8];

    /// Create an owned [`Self`] from bytes.
    ///
    /// # Blanket implementation
    /// The blanket implementation that covers all types used
    /// by `cuprate_wallet` will simply copy `bytes` into `Self`,
    /// without any alignment requirements on the input.
    fn from_bytes(bytes: &[u8]) -> Self;
}

impl<T> Storable for T
where
    Self: Pod + Debug,
{
    const BYTE_LENGTH: Option<usize> = Some(size_of::<T>());

    #[inline]
    fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    #[inline]
    fn from_bytes(bytes: &[u8]) -> T {
        bytemuck::pod_read_unaligned(bytes)
    }
}

//---------------------------------------------------------------------------------------------------- StorableRedb
/// The glue struct that implements `redb`'s (de)serialization
/// traits on any type that implements [`Storable`].
///
/// Never actually gets constructed, just used for trait bound translations.
///
/// Keys compare as a straight byte comparison, which gives the
/// wallet types a stable (if not always meaningful) sort order.
#[derive(Debug)]
pub(crate) struct StorableRedb<T>(PhantomData<T>)
where
    T: Storable;

//---------------------------------------------------------------------------------------------------- redb::Key
impl<T> redb::Key for StorableRedb<T>
where
    T: Storable + 'static,
{
    #[inline]
    fn compare(left: &[u8], right: &[u8]) -> Ordering {
        left.cmp(right)
    }
}

//---------------------------------------------------------------------------------------------------- redb::Value
impl<T> redb::Value for StorableRedb<T>
where
    T: Storable + 'static,
{
    type SelfType<'a>
        = T
    where
        Self: 'a;
    type AsBytes<'a>
        = &'a [u8]
    where
        Self: 'a;

    #[inline]
    fn fixed_width() -> Option<usize> {
        <T as Storable>::BYTE_LENGTH
    }

    #[inline]
    fn from_bytes<'a>(data: &'a [u8]) -> Self::SelfType<'a>
    where
        Self: 'a,
    {
        <T as Storable>::from_bytes(data)
    }

    #[inline]
    fn as_bytes<'a, 'b: 'a>(value: &'a Self::SelfType<'b>) -> &'a [u8]
    where
        Self: 'a + 'b,
    {
        <T as Storable>::as_bytes(value)
    }

    #[inline]
    fn type_name() -> TypeName {
        TypeName::new(type_name::<T>())
    }
}

//---------------------------------------------------------------------------------------------------- Tests
#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::types::{Outpoint, Position};

    #[test]
    /// Assert `redb::Key::fixed_width` is accurate.
    fn fixed_width() {
        fn test<T>(expected: Option<usize>)
        where
            T: Storable + 'static,
        {
            assert_eq!(<StorableRedb::<T> as redb::Value>::fixed_width(), expected);
        }

        test::<u8>(Some(1));
        test::<[u8; 32]>(Some(32));
        test::<Outpoint>(Some(36));
        test::<Position>(Some(40));
    }

    #[test]
    /// Outpoints are laid out as `txid || index (LE)`.
    fn outpoint_bytes() {
        let outpoint = Outpoint::new([7; 32], 258);
        let bytes = <StorableRedb<Outpoint> as redb::Value>::as_bytes(&outpoint);

        assert_eq!(&bytes[..32], &[7; 32]);
        assert_eq!(&bytes[32..], &[2, 1, 0, 0]);
        assert_eq!(
            <StorableRedb<Outpoint> as redb::Value>::from_bytes(bytes),
            outpoint
        );
    }

    #[test]
    /// Positions are laid out as `height (LE) || hash`.
    fn position_bytes() {
        let position = Position::new(1, [9; 32]);
        let bytes = Storable::as_bytes(&position);

        assert_eq!(&bytes[..8], &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..], &[9; 32]);
    }

    #[test]
    /// Assert `redb::Key::compare` is a byte comparison.
    fn compare() {
        let left = Outpoint::new([1; 32], 0);
        let right = Outpoint::new([1; 32], 1);

        assert_eq!(
            <StorableRedb<Outpoint> as redb::Key>::compare(
                Storable::as_bytes(&left),
                Storable::as_bytes(&right)
            ),
            Ordering::Less
        );
    }
}
