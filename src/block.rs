use std::{fmt, mem, ptr::NonNull};

use crate::utils::{align, checked_align};

/// Every payload handed out by the allocator is aligned to this many bytes,
/// and every block size is a multiple of it.
pub const ALIGNMENT: usize = 16;

/// Size of one boundary tag. Header and footer are both a [`Tag`].
pub(crate) const TAG_SIZE: usize = mem::size_of::<Tag>();

/// Bytes a block spends on metadata: one header plus one footer.
pub(crate) const OVERHEAD: usize = 2 * TAG_SIZE;

/// Smallest block that can be handed out or left behind by a split. It has
/// room for one payload byte, which in practice means room for the free list
/// links once the block is released.
pub(crate) const MIN_BLOCK_SIZE: usize = align(1 + OVERHEAD, ALIGNMENT);

/// The allocated block at the start of every region. It has no payload and
/// only exists so that the first real block has a predecessor to look at.
pub(crate) const PROLOGUE_SIZE: usize = align(OVERHEAD, ALIGNMENT);

const ALLOCATED: usize = 1;

/// Boundary tag. Every block starts with one (the header) and ends with
/// another one (the footer) holding the same values:
///
/// ```text
///                  payload
///                     |
/// +-------------------v----------------------------+-------------------+
/// |  header (Tag)     |   payload ...              |   footer (Tag)    |
/// |  size | flags     |                            |   size | flags    |
/// +-------------------+----------------------------+-------------------+
/// <---------------------------------- size ---------------------------->
/// ```
///
/// The footer is what makes it possible to walk backwards: the block before
/// `payload` ends right where our header starts, so its footer is always at
/// `payload - OVERHEAD`.
///
/// The terminator at the end of a region only has a header, with size `0`.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Tag {
    /// Total size of the block, header and footer included.
    pub size: usize,
    flags: usize,
}

impl Tag {
    pub const fn new(size: usize, allocated: bool) -> Self {
        Self {
            size,
            flags: if allocated { ALLOCATED } else { 0 },
        }
    }

    #[inline]
    pub const fn is_allocated(&self) -> bool {
        self.flags & ALLOCATED != 0
    }
}

/// Returns the total block size needed to hand out `payload` bytes, or `None`
/// if the computation overflows.
pub(crate) fn block_size_for(payload: usize) -> Option<usize> {
    checked_align(payload.checked_add(OVERHEAD)?, ALIGNMENT)
}

/// Handle to a block, identified by the address of its payload.
///
/// This is the only type that reads or writes boundary tags. Every accessor
/// is `unsafe` because the handle itself does not know whether it points into
/// memory owned by the allocator: callers guarantee that the block lies inside
/// a formatted region that is still mapped.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockPtr(NonNull<u8>);

impl fmt::Debug for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockPtr({:p})", self.0)
    }
}

impl BlockPtr {
    #[inline]
    pub const fn from_payload(payload: NonNull<u8>) -> Self {
        Self(payload)
    }

    #[inline]
    pub const fn payload(self) -> NonNull<u8> {
        self.0
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Block whose payload starts `bytes` after ours.
    ///
    /// **SAFETY**: the resulting address must stay inside the same region.
    #[inline]
    pub unsafe fn offset(self, bytes: usize) -> Self {
        unsafe { Self(self.0.add(bytes)) }
    }

    #[inline]
    unsafe fn header_ptr(self) -> *mut Tag {
        unsafe { self.0.as_ptr().sub(TAG_SIZE).cast() }
    }

    #[inline]
    unsafe fn footer_ptr(self, size: usize) -> *mut Tag {
        unsafe { self.0.as_ptr().add(size - OVERHEAD).cast() }
    }

    #[inline]
    pub unsafe fn header(self) -> Tag {
        unsafe { self.header_ptr().read() }
    }

    /// Reads the footer using the size stored in the header. Must not be
    /// called on a terminator.
    #[inline]
    pub unsafe fn footer(self) -> Tag {
        unsafe { self.footer_ptr(self.size()).read() }
    }

    #[inline]
    pub unsafe fn size(self) -> usize {
        unsafe { self.header().size }
    }

    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        unsafe { self.header().is_allocated() }
    }

    /// Writes both boundary tags. The footer position is derived from the new
    /// `size`, so this is also how a block is grown or shrunk.
    pub unsafe fn write_tags(self, size: usize, allocated: bool) {
        debug_assert!(size >= PROLOGUE_SIZE && size % ALIGNMENT == 0);

        let tag = Tag::new(size, allocated);
        unsafe {
            self.header_ptr().write(tag);
            self.footer_ptr(size).write(tag);
        }
    }

    /// Flips the allocated flag in both tags, keeping the size.
    pub unsafe fn set_allocated(self, allocated: bool) {
        unsafe { self.write_tags(self.size(), allocated) }
    }

    /// Writes a zero sized, allocated header. Nothing follows a terminator,
    /// so it has no footer.
    pub unsafe fn write_terminator(self) {
        unsafe { self.header_ptr().write(Tag::new(0, true)) }
    }

    #[inline]
    pub unsafe fn is_terminator(self) -> bool {
        unsafe { self.size() == 0 }
    }

    /// Next block in memory.
    #[inline]
    pub unsafe fn next(self) -> Self {
        unsafe { self.offset(self.size()) }
    }

    /// Footer of the block physically before this one.
    #[inline]
    pub unsafe fn prev_footer(self) -> Tag {
        unsafe { self.0.as_ptr().sub(OVERHEAD).cast::<Tag>().read() }
    }

    /// Previous block in memory, found through its footer.
    #[inline]
    pub unsafe fn prev(self) -> Self {
        unsafe { Self(self.0.sub(self.prev_footer().size)) }
    }
}
