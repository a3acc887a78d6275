use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Protection;

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_POPULATE: libc::c_int = libc::MAP_POPULATE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_POPULATE: libc::c_int = 0;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

const fn prot_flags(protection: Protection) -> libc::c_int {
    match protection {
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        Protection::ReadOnly => libc::PROT_READ,
        Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates a new anonymous memory mapping with an optional address hint.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn map_anon(
        hint_addr: usize,
        len: usize,
        populate: bool,
        no_reserve: bool,
    ) -> io::Result<Self> {
        let addr = if hint_addr == 0 {
            ptr::null_mut()
        } else {
            hint_addr as *mut libc::c_void
        };
        let ptr = unsafe { raw_map(addr, len, populate, no_reserve)? };
        Ok(Self { ptr, len })
    }

    /// Maps `len` bytes starting at an `align`-aligned address.
    ///
    /// Reserves `len + align` bytes and unmaps the misaligned head and the
    /// unused tail.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap` and `munmap`.
    pub unsafe fn map_anon_aligned(
        len: usize,
        align: usize,
        populate: bool,
        no_reserve: bool,
    ) -> io::Result<Self> {
        let reserve = len
            .checked_add(align)
            .ok_or_else(|| Error::from(io::ErrorKind::OutOfMemory))?;
        let raw = unsafe { raw_map(ptr::null_mut(), reserve, false, no_reserve)? };

        let start = raw as usize;
        let aligned = (start + align - 1) & !(align - 1);
        let head = aligned - start;
        let tail = reserve - head - len;
        unsafe {
            if head > 0 {
                libc::munmap(raw, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if populate {
            unsafe {
                libc::madvise(aligned as *mut libc::c_void, len, libc::MADV_WILLNEED);
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = populate;

        Ok(Self {
            ptr: aligned as *mut libc::c_void,
            len,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// The caller must not rely on access rights revoked by `protection`.
    pub unsafe fn protect(&self, protection: Protection) -> io::Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        let rc = unsafe { libc::mprotect(self.ptr, self.len, prot_flags(protection)) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `new_len` must be page aligned and smaller than the current length; the
    /// released tail must no longer be referenced.
    pub unsafe fn truncate(&mut self, new_len: usize) -> io::Result<()> {
        let tail = (self.ptr as usize + new_len) as *mut libc::c_void;
        let rc = unsafe { libc::munmap(tail, self.len - new_len) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        self.len = new_len;
        Ok(())
    }
}

unsafe fn raw_map(
    addr: *mut libc::c_void,
    len: usize,
    populate: bool,
    no_reserve: bool,
) -> io::Result<*mut libc::c_void> {
    let populate = if populate { MAP_POPULATE } else { 0 };
    let no_reserve = if no_reserve { MAP_NORESERVE } else { 0 };

    let flags = libc::MAP_PRIVATE | libc::MAP_ANON | populate | no_reserve;
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    let ptr = unsafe { libc::mmap(addr, len, prot, flags, -1, 0) };

    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(ptr)
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
