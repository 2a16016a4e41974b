use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Where the allocator gets its memory from.
///
/// The allocator never manages virtual memory itself. It asks a `PageMapper`
/// for page-aligned regions whenever it runs out of space, and gives them all
/// back when it is torn down.
///
/// # Safety
///
/// Implementors must guarantee that a region returned by
/// [`PageMapper::map_pages`] is readable and writable for `len` bytes, aligned
/// to at least 16 bytes, and not handed out again until it has been released
/// with [`PageMapper::release_pages`] or [`PageMapper::reset`].
pub unsafe trait PageMapper {
    /// Size of a page in bytes. It never changes for a given mapper and is
    /// always a power of two.
    fn page_size(&self) -> usize;

    /// Maps `len` bytes, which is always a multiple of [`PageMapper::page_size`].
    /// Returns `None` if no more memory is available.
    fn map_pages(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Gives back one region previously returned by [`PageMapper::map_pages`].
    ///
    /// # Safety
    ///
    /// `base` and `len` must describe exactly one region obtained from this
    /// mapper, and nothing may access it afterwards.
    unsafe fn release_pages(&mut self, base: NonNull<u8>, len: usize);

    /// Called once all regions have been released, before the allocator starts
    /// a new session.
    fn reset(&mut self) {}
}

/// Virtual memory page size of the computer. This is usually 4096.
/// It should be a constant, but we don't know the value at compile time, so
/// we ask the OS once and remember it.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Wrapper to calculate the computer's page size.
#[inline]
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { <Kernel as PlatformMemory>::page_size() };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// [`PageMapper`] backed by the operating system: `mmap` on unix and
/// `VirtualAlloc` on Windows.
#[derive(Debug, Clone, Copy)]
pub struct Kernel {
    page_size: usize,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Creates a new mapper. It will calculate the computer's page size the
    /// first time one is created.
    pub fn new() -> Self {
        Self {
            page_size: page_size(),
        }
    }
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. As the allocator, our top level view of this has nothing
/// to do with the concrete implementations / APIs offered by each kernel.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a Pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

unsafe impl PageMapper for Kernel {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map_pages(&mut self, len: usize) -> Option<NonNull<u8>> {
        let addr = unsafe { Self::request_memory(len) };

        if addr.is_none() {
            log::warn!("[kernel] could not map {len} bytes");
        }

        addr
    }

    unsafe fn release_pages(&mut self, base: NonNull<u8>, len: usize) {
        unsafe { Self::return_memory(base.as_ptr(), len) }
    }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            if unsafe { munmap(addr.cast::<c_void>(), len as size_t) } != 0 {
                log::warn!("[kernel] munmap({addr:p}, {len}) failed");
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            let released =
                unsafe { Memory::VirtualFree(addr.cast::<c_void>(), 0, Memory::MEM_RELEASE) };

            if released.is_err() {
                log::warn!("[kernel] VirtualFree({addr:p}) failed");
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let kernel = Kernel::new();

        assert!(kernel.page_size().is_power_of_two());
        assert_eq!(kernel.page_size(), page_size());
    }

    #[test]
    fn mapped_pages_are_writable() {
        let mut kernel = Kernel::new();
        let len = 2 * kernel.page_size();

        let base = kernel.map_pages(len).unwrap();
        assert_eq!(base.as_ptr() as usize % kernel.page_size(), 0);

        unsafe {
            base.as_ptr().write_bytes(0xAB, len);
            assert_eq!(*base.as_ptr().add(len - 1), 0xAB);

            kernel.release_pages(base, len);
        }
    }
}
