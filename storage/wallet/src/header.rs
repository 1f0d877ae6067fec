//! The chain's header index, as seen by the wallet.
//!
//! The wallet does not own block headers, it only asks
//! the node's header index to resolve positions during a reorg.

//---------------------------------------------------------------------------------------------------- Import
use crate::types::{BlockHash, BlockHeight, Position};

//---------------------------------------------------------------------------------------------------- HeaderOracle
/// Read access to the node's header index.
pub trait HeaderOracle {
    /// The hash of the block at `height` on the current best chain,
    /// [`None`] if the best chain is shorter than `height`.
    fn best_hash(&self, height: BlockHeight) -> Option<BlockHash>;

    /// The [`Position`] at `height` on the current best chain.
    fn best_position(&self, height: BlockHeight) -> Option<Position> {
        self.best_hash(height).map(|hash| Position::new(height, hash))
    }
}

impl<T: HeaderOracle + ?Sized> HeaderOracle for &T {
    fn best_hash(&self, height: BlockHeight) -> Option<BlockHash> {
        T::best_hash(self, height)
    }
}

//---------------------------------------------------------------------------------------------------- Tests
#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::tests::TestHeaders;

    #[test]
    fn best_position() {
        let headers = TestHeaders { tip: 10 };

        assert_eq!(
            headers.best_position(7),
            Some(Position::new(7, TestHeaders::hash(7)))
        );
        assert_eq!((&headers).best_position(11), None);
    }
}
