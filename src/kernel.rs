use std::ptr::NonNull;

use crate::utils::align;

/// The heap lives inside a single contiguous reservation obtained from the
/// operating system once, when the allocator is created. Growth happens by
/// moving a break pointer forward through the reservation, so every
/// extension is physically adjacent to the previous one:
///
/// ```text
///  base                      brk                         capacity
///   |                         |                             |
///   v                         v                             v
///   +-------------------------+-----------------------------+
///   |     managed heap        |      reserved, unused       |
///   +-------------------------+-----------------------------+
///             grows ----->
/// ```
///
/// The managed part only ever grows. The whole reservation goes back to the
/// kernel in one piece when the [`Segment`] is dropped.
pub(crate) struct Segment {
    /// Start of the reservation.
    base: NonNull<u8>,
    /// Bytes already handed to the allocator.
    brk: usize,
    /// Bytes currently backed by committed pages. On unix the whole
    /// reservation is usable from the start, so this equals `capacity`.
    committed: usize,
    /// Total size of the reservation.
    capacity: usize,
    /// Virtual memory page size of the computer. Commit requests are
    /// rounded up to this.
    page_size: usize,
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. As the allocator, our top level view of this, has nothing
/// to do with the concrete implementations / APIs offered by each kernel.
trait PlatformMemory {
    /// Reserve a contiguous region of size `len`. It returns a pointer to
    /// the region or None if the underlying syscall fails. The region is
    /// not necessarily usable yet, see [`PlatformMemory::commit_memory`].
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Make `len` bytes starting at `addr` readable and writable. On
    /// platforms where [`PlatformMemory::request_memory`] already returns
    /// usable memory this is a no-op.
    unsafe fn commit_memory(addr: *mut u8, len: usize) -> bool;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

impl Segment {
    /// Reserves a region of at least `capacity` bytes, rounded up to the
    /// page size. Returns None if the kernel refuses the reservation.
    pub fn reserve(capacity: usize) -> Option<Self> {
        unsafe {
            let page_size = Self::page_size();
            let capacity = align(capacity, page_size);
            let base = Self::request_memory(capacity)?;

            Some(Self {
                base,
                brk: 0,
                committed: if cfg!(unix) { capacity } else { 0 },
                capacity,
                page_size,
            })
        }
    }

    /// Start of the managed region. Stable for the whole segment lifetime.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Bytes handed out so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.brk
    }

    /// Grows the managed region by `len` bytes and returns the start of the
    /// new span, which immediately follows the previous one. Returns None
    /// when the reservation is exhausted or the new pages cannot be
    /// committed; the managed region is left untouched in that case.
    ///
    /// The allocator only ever calls this with `len` a multiple of the
    /// alignment unit.
    pub fn extend_region(&mut self, len: usize) -> Option<NonNull<u8>> {
        let new_brk = self.brk.checked_add(len)?;
        if new_brk > self.capacity {
            return None;
        }

        // Back the new span with committed pages where that is not implicit.
        let needed = align(new_brk, self.page_size);
        if needed > self.committed {
            unsafe {
                let addr = self.base.as_ptr().add(self.committed);
                if !Self::commit_memory(addr, needed - self.committed) {
                    return None;
                }
            }
            self.committed = needed;
        }

        let old_brk = self.brk;
        self.brk = new_brk;

        unsafe { Some(NonNull::new_unchecked(self.base.as_ptr().add(old_brk))) }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe { Self::return_memory(self.base.as_ptr(), self.capacity) }
    }
}

#[cfg(unix)]
mod unix {
    use super::{PlatformMemory, Segment};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Segment {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            // MAP_NORESERVE because the reservation is usually much larger
            // than what the heap ends up touching.
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn commit_memory(_addr: *mut u8, _len: usize) -> bool {
            // The anonymous mapping is already readable and writable.
            true
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
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

    use crate::kernel::{PlatformMemory, Segment};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Segment {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Reserve address space only. Pages are committed as the break
            // moves through the reservation.
            let flags = Memory::MEM_RESERVE;
            let protection = Memory::PAGE_NOACCESS;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit_memory(addr: *mut u8, len: usize) -> bool {
            let flags = Memory::MEM_COMMIT;
            let protection = Memory::PAGE_READWRITE;

            unsafe {
                let committed =
                    Memory::VirtualAlloc(Some(addr as *const c_void), len, flags, protection);

                !committed.is_null()
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
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
