//! Block partitioning and the segment record length prefix.

use crate::digest::Digest;
use crate::error::TypeError;

/// Fixed block size. Every block but the last of a stream is exactly this long.
pub const BLOCK_SIZE: usize = 16;

/// Width in bytes of the big-endian length prefix in front of each segment
/// record.
pub const LENGTH_PREFIX_WIDTH: usize = 1;

/// Byte substituted for content that cannot be reconstructed.
pub const FILLER_BYTE: u8 = b'x';

/// Name of the digest algorithm, used in file naming and help output.
pub const DIGEST_ALGORITHM: &str = "sha256";

const _: () = assert!(
    (BLOCK_SIZE as u128) < (1u128 << (8 * LENGTH_PREFIX_WIDTH)),
    "BLOCK_SIZE overflows LENGTH_PREFIX_WIDTH"
);
const _: () = assert!(BLOCK_SIZE > 0);

/// Largest payload length the prefix can describe.
pub const fn max_prefixed_len() -> u64 {
    if LENGTH_PREFIX_WIDTH >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * LENGTH_PREFIX_WIDTH)) - 1
    }
}

/// Number of blocks a buffer of `len` bytes splits into.
pub const fn block_count(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE)
}

/// Iterate over consecutive blocks of `buf`. The last block may be shorter.
pub fn blocks(buf: &[u8]) -> std::slice::Chunks<'_, u8> {
    buf.chunks(BLOCK_SIZE)
}

/// Digest every block of `buf`, in order.
pub fn digest_blocks(buf: &[u8]) -> Vec<Digest> {
    blocks(buf).map(Digest::of).collect()
}

/// Encode a payload length as a big-endian prefix.
pub fn encode_length(len: usize) -> Result<[u8; LENGTH_PREFIX_WIDTH], TypeError> {
    if len as u64 > max_prefixed_len() {
        return Err(TypeError::BlockTooLarge(len));
    }
    let be = (len as u64).to_be_bytes();
    let mut out = [0u8; LENGTH_PREFIX_WIDTH];
    out.copy_from_slice(&be[8 - LENGTH_PREFIX_WIDTH..]);
    Ok(out)
}

/// Decode a big-endian length prefix.
pub fn decode_length(prefix: &[u8; LENGTH_PREFIX_WIDTH]) -> usize {
    prefix
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | usize::from(b))
}
