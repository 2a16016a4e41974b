//! Error types of the allocator.

/// Errors reported by [`crate::Allocator`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The page backend could not map more memory.
    #[error("page backend could not map {requested} bytes")]
    Exhausted { requested: usize },

    /// The allocator was used before a successful `init`.
    #[error("allocator has not been initialized")]
    Uninitialized,

    /// `free` was called with a pointer that is not a live allocation.
    /// Nothing was modified.
    #[error("invalid free of {addr:#x}: {reason}")]
    InvalidFree {
        addr: usize,
        reason: InvalidFreeReason,
    },

    /// The heap metadata is inconsistent. The allocator refuses to do any
    /// more work once this has been reported.
    #[error("heap corruption detected: {0}")]
    Corrupted(#[from] Corruption),
}

/// Why a pointer was rejected by `free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidFreeReason {
    #[error("pointer lies outside every mapped region")]
    OutOfBounds,
    #[error("pointer is not aligned to a block payload")]
    Misaligned,
    #[error("pointer does not start a block")]
    NotABlock,
    #[error("block is not allocated")]
    NotAllocated,
}

/// A broken heap invariant, found while freeing or by [`crate::Allocator::verify`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Corruption {
    #[error("boundary tags of block {addr:#x} disagree (header {header}, footer {footer})")]
    TagMismatch {
        addr: usize,
        header: usize,
        footer: usize,
    },
    #[error("block {addr:#x} has an invalid size of {size} bytes")]
    BadSize { addr: usize, size: usize },
    #[error("block {addr:#x} is outside of its region")]
    OutOfRegion { addr: usize },
    #[error("region {addr:#x} does not end with a terminator")]
    MissingTerminator { addr: usize },
    #[error("free block {addr:#x} is not linked into the free list")]
    Unlinked { addr: usize },
    #[error("allocated block {addr:#x} is linked into the free list")]
    AllocatedInFreeList { addr: usize },
    #[error("free list links are broken at {addr:#x}")]
    BrokenLinks { addr: usize },
    #[error("free list has {listed} entries but {found} free blocks exist")]
    FreeCountMismatch { listed: usize, found: usize },
    #[error("free blocks {first:#x} and {second:#x} overlap")]
    Overlap { first: usize, second: usize },
    #[error("adjacent free blocks {first:#x} and {second:#x} were not coalesced")]
    Uncoalesced { first: usize, second: usize },
    #[error("free list holds {listed} bytes but {tracked} are tracked as free")]
    FreeBytesMismatch { listed: usize, tracked: usize },
    #[error("largest free block is {actual} bytes but the hint says {hint}")]
    StaleHint { hint: usize, actual: usize },
    #[error("heap was poisoned by an earlier corruption")]
    Poisoned,
}
