use std::marker::PhantomData;

use crate::block::BlockPtr;

/// Links of a free block. They live in the first bytes of the block's payload:
/// the payload of a free block is not used by anyone, so we can store our
/// metadata there instead of somewhere else.
///
/// ```text
/// +------------------------+
/// |       header (Tag)     |
/// +------------------------+ <--- payload
/// |       next_free        |
/// |       prev_free        |
/// +------------------------+
/// |      Free Payload      |
/// |        (unused)        |
/// +------------------------+
/// |       footer (Tag)     |
/// +------------------------+
/// ```
///
/// The links store block handles, not references, so following them never
/// needs anything more than the payload address.
#[repr(C)]
struct Links {
    next: Option<BlockPtr>,
    prev: Option<BlockPtr>,
}

#[inline]
unsafe fn links(block: BlockPtr) -> *mut Links {
    block.payload().as_ptr().cast()
}

/// Explicit list of free blocks.
///
/// The order of this list has nothing to do with the physical order of the
/// blocks:
///
/// ```text
///                                     Free List
///
///                     next free block                next free block
///                +----------------------+  +--------------------------------------+
///                |                      |  |                                      |
/// +--------------|----------------------|--|----+      +--------------------------|-------------------+
/// |        | +---|--+    +-------+    +-|--|-+  |      |        | +-------+    +--|---+    +-------+  |
/// | Region | | Free | -> | Block | -> | Free |  | ---> | Region | | Block | -> | Free | -> | Block |  |
/// |        | +------+    +-------+    +------+  |      |        | +-------+    +------+    +-------+  |
/// +---------------------------------------------+      +----------------------------------------------+
/// ```
///
/// Insertion happens at the head (LIFO), so the block released last is the
/// first one we look at.
pub(crate) struct FreeList {
    head: Option<BlockPtr>,
    tail: Option<BlockPtr>,
    len: usize,
}

/// Outcome of [`FreeList::find_first_fit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fit {
    Found(BlockPtr),
    /// Nothing was big enough. Since the whole list was scanned we also know
    /// exactly how big the largest free block is.
    Miss { largest: usize },
}

pub(crate) struct Iter<'a> {
    current: Option<BlockPtr>,
    remaining: usize,
    marker: PhantomData<&'a FreeList>,
}

impl FreeList {
    /// Creates a new empty list.
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn first(&self) -> Option<BlockPtr> {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Option<BlockPtr> {
        self.tail
    }

    /// Block after `block` in list order.
    pub unsafe fn next_of(block: BlockPtr) -> Option<BlockPtr> {
        unsafe { (*links(block)).next }
    }

    /// Block before `block` in list order.
    pub unsafe fn prev_of(block: BlockPtr) -> Option<BlockPtr> {
        unsafe { (*links(block)).prev }
    }

    /// Cheap membership test for a block we believe to be free. A linked
    /// block is either the head or has a predecessor.
    pub unsafe fn is_linked(&self, block: BlockPtr) -> bool {
        self.first() == Some(block) || unsafe { Self::prev_of(block).is_some() }
    }

    /// Pushes `block` at the head of the list.
    ///
    /// **SAFETY**: `block` must be a free block with a payload big enough for
    /// the links, and it must not be in the list already.
    pub unsafe fn insert(&mut self, block: BlockPtr) {
        unsafe {
            debug_assert!(!block.is_allocated());

            links(block).write(Links {
                next: self.head,
                prev: None,
            });

            match self.head {
                Some(head) => (*links(head)).prev = Some(block),
                None => self.tail = Some(block),
            }
        }

        self.head = Some(block);
        self.len += 1;
    }

    /// Unlinks `block`, which must currently be in the list.
    pub unsafe fn remove(&mut self, block: BlockPtr) {
        unsafe {
            let Links { next, prev } = links(block).read();

            match prev {
                Some(prev) => (*links(prev)).next = next,
                None => self.head = next,
            }

            match next {
                Some(next) => (*links(next)).prev = prev,
                None => self.tail = prev,
            }

            links(block).write(Links {
                next: None,
                prev: None,
            });
        }

        self.len -= 1;
    }

    /// Puts `new` exactly where `old` was. Used when a block is split and the
    /// remainder takes over its position.
    pub unsafe fn replace(&mut self, old: BlockPtr, new: BlockPtr) {
        unsafe {
            let Links { next, prev } = links(old).read();
            links(new).write(Links { next, prev });

            match prev {
                Some(prev) => (*links(prev)).next = Some(new),
                None => self.head = Some(new),
            }

            match next {
                Some(next) => (*links(next)).prev = Some(new),
                None => self.tail = Some(new),
            }
        }
    }

    /// Returns the first block, starting at the head, whose size is at least
    /// `min_size`.
    ///
    /// This is first-fit: linear in the length of the list. A size indexed
    /// structure (segregated bins or a tree) would make this sub-linear.
    pub unsafe fn find_first_fit(&self, min_size: usize) -> Fit {
        if self.is_empty() {
            return Fit::Miss { largest: 0 };
        }

        let mut largest = 0;

        for block in unsafe { self.iter() } {
            let size = unsafe { block.size() };

            if size >= min_size {
                return Fit::Found(block);
            }

            largest = largest.max(size);
        }

        Fit::Miss { largest }
    }

    /// Iterates from head to tail. The iterator never yields more than
    /// [`FreeList::len`] blocks, even if the links are broken.
    pub unsafe fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }

    /// Forgets every block. Only valid once the memory behind them is gone.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl Iterator for Iter<'_> {
    type Item = BlockPtr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let block = self.current?;
        self.current = unsafe { FreeList::next_of(block) };
        self.remaining -= 1;

        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::tests::Scratch;

    /// Lays out free blocks of the given sizes back to back.
    fn blocks(scratch: &mut Scratch, sizes: &[usize]) -> Vec<BlockPtr> {
        let mut offset = 0;
        sizes
            .iter()
            .map(|&size| {
                let block = scratch.block_at(offset);
                unsafe { block.write_tags(size, false) };
                offset += size;
                block
            })
            .collect()
    }

    fn collect(list: &FreeList) -> Vec<BlockPtr> {
        unsafe { list.iter().collect() }
    }

    #[test]
    fn new_list_is_empty() {
        let list = FreeList::new();

        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert!(list.first().is_none());
        assert!(list.last().is_none());
        assert_eq!(unsafe { list.find_first_fit(48) }, Fit::Miss { largest: 0 });
    }

    #[test]
    fn insert_is_lifo() {
        let mut scratch = Scratch::new();
        let b = blocks(&mut scratch, &[48, 64, 80]);
        let mut list = FreeList::new();

        unsafe {
            for &block in &b {
                list.insert(block);
            }
        }

        assert_eq!(collect(&list), vec![b[2], b[1], b[0]]);
        assert_eq!(list.first(), Some(b[2]));
        assert_eq!(list.last(), Some(b[0]));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn remove_head_middle_and_tail() {
        let mut scratch = Scratch::new();
        let b = blocks(&mut scratch, &[48, 48, 48, 48]);
        let mut list = FreeList::new();

        unsafe {
            for &block in &b {
                list.insert(block);
            }
            // [3, 2, 1, 0]
            list.remove(b[2]);
            assert_eq!(collect(&list), vec![b[3], b[1], b[0]]);
            assert_eq!(FreeList::next_of(b[2]), None);
            assert_eq!(FreeList::prev_of(b[2]), None);

            list.remove(b[3]);
            assert_eq!(list.first(), Some(b[1]));
            assert_eq!(FreeList::prev_of(b[1]), None);

            list.remove(b[0]);
            assert_eq!(list.last(), Some(b[1]));
            assert_eq!(FreeList::next_of(b[1]), None);

            list.remove(b[1]);
        }

        assert!(list.is_empty());
        assert!(list.first().is_none());
        assert!(list.last().is_none());
    }

    #[test]
    fn replace_keeps_position() {
        let mut scratch = Scratch::new();
        let b = blocks(&mut scratch, &[48, 48, 48, 48]);
        let mut list = FreeList::new();

        unsafe {
            list.insert(b[0]);
            list.insert(b[1]);
            list.insert(b[2]);
            // [2, 1, 0]
            list.replace(b[1], b[3]);
            assert_eq!(collect(&list), vec![b[2], b[3], b[0]]);

            list.replace(b[2], b[1]);
            assert_eq!(list.first(), Some(b[1]));

            list.replace(b[0], b[2]);
            assert_eq!(list.last(), Some(b[2]));
            assert_eq!(collect(&list), vec![b[1], b[3], b[2]]);
        }
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn first_fit_takes_first_large_enough() {
        let mut scratch = Scratch::new();
        let b = blocks(&mut scratch, &[48, 128, 64]);
        let mut list = FreeList::new();

        unsafe {
            // Inserted in reverse so the list reads [48, 128, 64].
            list.insert(b[2]);
            list.insert(b[1]);
            list.insert(b[0]);

            assert_eq!(list.find_first_fit(50), Fit::Found(b[1]));
            assert_eq!(list.find_first_fit(48), Fit::Found(b[0]));
            assert_eq!(list.find_first_fit(129), Fit::Miss { largest: 128 });
        }
    }

    #[test]
    fn is_linked_checks_head_and_prev() {
        let mut scratch = Scratch::new();
        let b = blocks(&mut scratch, &[48, 48]);
        let mut list = FreeList::new();

        unsafe {
            list.insert(b[0]);
            list.insert(b[1]);
            assert!(list.is_linked(b[0]));
            assert!(list.is_linked(b[1]));

            list.remove(b[0]);
            assert!(!list.is_linked(b[0]));
        }
    }
}
