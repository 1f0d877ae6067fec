#![doc = include_str!("../README.md")]
#![allow(
    // See `cuprate-database` for reasoning.
    clippy::significant_drop_tightening
)]

// Only allow building 64-bit little-endian targets.
//
// The on-disk key encodings (heights, indices) are little-endian
// and `Storable` casts in native endian, so the two must agree.
#[cfg(not(all(target_pointer_width = "64", target_endian = "little")))]
compile_error!("cuprate-wallet is only compatible with 64-bit little-endian CPUs");

//---------------------------------------------------------------------------------------------------- Public API
// Import private modules, export public types.
//
// Documentation for each module is located in the respective file.

mod constants;
mod env;
mod error;
mod free;
mod storable;
mod tables;

pub mod config;
pub mod header;
pub mod output;
pub mod subchain;
pub mod types;

pub use constants::{
    DATABASE_CORRUPT_MSG, DATABASE_DATA_FILENAME, SUBCHAIN_INDEX_VERSION,
};
pub use env::ConcreteEnv;
pub use error::{DbResult, InitError, InvariantViolation, RuntimeError, StorageError};
pub use free::open;
pub use storable::Storable;


#[cfg(test)]
mod test {
    use pretty_assertions as _;
    use proptest as _;
}
