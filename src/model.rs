//! Core identifier types and the deployment-wide layout constants.

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

/// Identity of a metadata frontend, as surfaced in redirects.
pub type ServerName = String;
/// Dialable address of a chunkserver.
pub type ServerAddress = String;

/// Number of low bits of a [`ChunkNum`] holding the entry-within-block
/// index. This is an exponent: a block holds `1 << ENTRY_INDEX_BITS`
/// entries, and the block id is the chunk number shifted right by the same
/// constant.
pub const ENTRY_INDEX_BITS: u32 = 6;

/// Entries packed into one metadata block.
pub const ENTRIES_PER_BLOCK: usize = 1 << ENTRY_INDEX_BITS;

/// Fixed width of one serialized entry slot, zero padding included.
pub const ENTRY_SLOT_BYTES: usize = 128;

/// Width of the allocation bitset at the front of a block.
pub const BITSET_BYTES: usize = ENTRIES_PER_BLOCK / 8;

/// Total on-wire size of a metadata block.
pub const BLOCK_BYTES: usize = BITSET_BYTES + ENTRIES_PER_BLOCK * ENTRY_SLOT_BYTES;

/// Well-known block id of the filesystem root. Block 0 is reserved and
/// never holds chunk metadata, so the root takes the lowest legal id.
pub const FS_ROOT_BLOCK: BlockId = BlockId(1);

/// Identifier of one metadata block. Id 0 is reserved.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque 64-bit chunk identifier. The low [`ENTRY_INDEX_BITS`] bits index
/// the entry within its metadata block; the remaining bits are the block id.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChunkNum(pub u64);

impl ChunkNum {
    /// Composes a chunk number from its block and entry index.
    ///
    /// Panics on block 0 or an out-of-range index: both mean the metadata
    /// layer handed out a corrupt allocation, and continuing would scribble
    /// on reserved state.
    pub fn compose(block: BlockId, index: usize) -> Self {
        assert!(block.0 != 0, "metadata block 0 is reserved");
        assert!(
            index < ENTRIES_PER_BLOCK,
            "entry index {index} out of range for block {block}"
        );
        ChunkNum((block.0 << ENTRY_INDEX_BITS) | index as u64)
    }

    /// The metadata block holding this chunk's entry.
    pub fn block(self) -> BlockId {
        BlockId(self.0 >> ENTRY_INDEX_BITS)
    }

    /// The entry index within the block.
    pub fn slot_index(self) -> usize {
        (self.0 & (ENTRIES_PER_BLOCK as u64 - 1)) as usize
    }
}

impl fmt::Display for ChunkNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-chunk committed version. Monotonic; 0 means "no committed content".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub const ZERO: Version = Version(0);

    /// The successor version a writer contends for.
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content fingerprint binding a prepared write to its expected bytes.
///
/// Commit compares the fingerprint of the staged buffer against the hash the
/// writer computed; a mismatch fails the commit.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(xxh64(data, 0).to_be_bytes())
}
