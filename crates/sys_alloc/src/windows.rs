use std::io::{self, Error};
use std::mem;
use std::ptr;

use crate::Protection;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_EXECUTE_READ, PAGE_READONLY, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Attempts at placing an aligned mapping before giving up.
#[cfg(not(miri))]
const ALIGNED_MAP_ATTEMPTS: usize = 8;

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
    /// Length of the original reservation; `VirtualFree` releases all of it.
    reserved: usize,
}

impl MmapInner {
    /// Creates a new anonymous memory mapping with an optional address hint.
    pub unsafe fn map_anon(
        hint_addr: usize,
        len: usize,
        _populate: bool,
        _no_reserve: bool,
    ) -> io::Result<Self> {
        #[cfg(miri)]
        {
            let _ = hint_addr;
            unsafe { Self::miri_alloc(len, allocation_granularity()) }
        }
        #[cfg(not(miri))]
        {
            let addr = if hint_addr == 0 {
                ptr::null()
            } else {
                hint_addr as *const std::ffi::c_void
            };

            // Windows requires MEM_RESERVE | MEM_COMMIT to actually get usable memory
            let mut ptr =
                unsafe { VirtualAlloc(addr, len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };

            // If strict allocation at hint_addr failed, and we had a hint, try letting the OS decide.
            if ptr.is_null() && !addr.is_null() {
                ptr = unsafe {
                    VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
                };
            }

            if ptr.is_null() {
                return Err(Error::last_os_error());
            }

            Ok(Self {
                ptr,
                len,
                reserved: len,
            })
        }
    }

    /// Maps `len` bytes starting at an `align`-aligned address.
    ///
    /// A reservation cannot be partially released on Windows, so this reserves
    /// an oversized range to find an aligned address, releases it, and maps
    /// again at that address. Another thread may win the range in between, in
    /// which case the whole dance is retried.
    pub unsafe fn map_anon_aligned(
        len: usize,
        align: usize,
        _populate: bool,
        _no_reserve: bool,
    ) -> io::Result<Self> {
        #[cfg(miri)]
        {
            unsafe { Self::miri_alloc(len, align) }
        }
        #[cfg(not(miri))]
        {
            let reserve = len
                .checked_add(align)
                .ok_or_else(|| Error::from(io::ErrorKind::OutOfMemory))?;
            for _ in 0..ALIGNED_MAP_ATTEMPTS {
                let probe = unsafe { VirtualAlloc(ptr::null(), reserve, MEM_RESERVE, PAGE_READWRITE) };
                if probe.is_null() {
                    return Err(Error::last_os_error());
                }
                let aligned = (probe as usize + align - 1) & !(align - 1);
                unsafe {
                    VirtualFree(probe, 0, MEM_RELEASE);
                }

                let ptr = unsafe {
                    VirtualAlloc(
                        aligned as *const std::ffi::c_void,
                        len,
                        MEM_COMMIT | MEM_RESERVE,
                        PAGE_READWRITE,
                    )
                };
                if !ptr.is_null() {
                    return Ok(Self {
                        ptr,
                        len,
                        reserved: len,
                    });
                }
            }
            Err(Error::from(io::ErrorKind::OutOfMemory))
        }
    }

    #[cfg(miri)]
    unsafe fn miri_alloc(len: usize, align: usize) -> io::Result<Self> {
        use std::alloc::{alloc_zeroed, Layout};
        // Miri doesn't support VirtualAlloc, use std::alloc
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::from(io::ErrorKind::OutOfMemory));
        }
        Ok(Self {
            ptr: ptr.cast::<std::ffi::c_void>(),
            len,
            reserved: len,
        })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub unsafe fn protect(&self, protection: Protection) -> io::Result<()> {
        #[cfg(miri)]
        {
            let _ = protection;
            Ok(())
        }
        #[cfg(not(miri))]
        {
            if self.len == 0 {
                return Ok(());
            }
            let flags = match protection {
                Protection::ReadWrite => PAGE_READWRITE,
                Protection::ReadOnly => PAGE_READONLY,
                Protection::ReadExecute => PAGE_EXECUTE_READ,
            };
            let mut old = 0;
            let ok = unsafe { VirtualProtect(self.ptr, self.len, flags, &mut old) };
            if ok == 0 {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }

    /// Decommits the tail; the address range stays reserved until drop.
    pub unsafe fn truncate(&mut self, new_len: usize) -> io::Result<()> {
        #[cfg(not(miri))]
        {
            let tail = (self.ptr as usize + new_len) as *mut std::ffi::c_void;
            let ok = unsafe { VirtualFree(tail, self.len - new_len, MEM_DECOMMIT) };
            if ok == 0 {
                return Err(Error::last_os_error());
            }
        }
        self.len = new_len;
        Ok(())
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.reserved > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    let align = allocation_granularity();
                    if let Ok(layout) = Layout::from_size_align(self.reserved, align) {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
