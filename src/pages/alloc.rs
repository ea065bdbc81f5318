use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::slice;

use libc::c_void;
use nix::errno::Errno;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::sys::mman::mlock;
use nix::sys::mman::mmap_anonymous;
use nix::sys::mman::munmap;

/// A page-aligned, page-multiple region of private anonymous memory.
///
/// The region is zero-filled by the kernel, optionally locked into RAM, and
/// returned to the OS on drop. Ownership is movable but the allocation is
/// never copied.
pub struct PageAlloc {
    ptr: NonNull<c_void>,
    len: usize,
}

// The mapping is private to this allocation and carries no thread affinity.
unsafe impl Send for PageAlloc {}

impl PageAlloc {
    /// Maps `len` bytes of anonymous memory. `len` must be a positive
    /// multiple of the page size.
    ///
    /// With `lock` set the region is `mlock`ed at creation; failure to lock
    /// (typically an `RLIMIT_MEMLOCK` quota) unmaps the region and reports
    /// `ENOMEM`.
    pub fn new(len: usize, lock: bool) -> Result<PageAlloc, Errno> {
        debug_assert!(len % page_size::get() == 0);
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )?
        };
        if lock {
            if let Err(err) = unsafe { mlock(ptr, len) } {
                let _ = unsafe { munmap(ptr, len) };
                return Err(match err {
                    Errno::EAGAIN | Errno::ENOMEM => Errno::ENOMEM,
                    other => other,
                });
            }
        }
        Ok(PageAlloc { ptr, len })
    }

    /// Size of the region in bytes. Immutable for the allocation's lifetime.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Never true: allocations always have a positive size.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Raw base pointer, valid for `len` bytes while the allocation is live.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.as_ptr(), self.len) }
    }
}

impl Drop for PageAlloc {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            log::error!("munmap of {} bytes failed: {}", self.len, err);
        }
    }
}

impl fmt::Debug for PageAlloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAlloc")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
