//! Foundation types for the dedup block store.
//!
//! Every other dedup crate depends on `dedup-types`.
//!
//! # Key Types
//!
//! - [`Digest`] -- SHA-256 content identifier with the `A..=P` text form
//! - [`block`] -- block size, partitioning and the record length prefix

pub mod block;
pub mod digest;
pub mod error;

pub use block::{BLOCK_SIZE, DIGEST_ALGORITHM, FILLER_BYTE, LENGTH_PREFIX_WIDTH};
pub use digest::{Digest, DIGEST_HEX_LEN, DIGEST_LEN};
pub use error::TypeError;
