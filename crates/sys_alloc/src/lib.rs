use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// When requesting a specific address, it should be aligned to this granularity.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Access rights of a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Readable and writable, not executable.
    ReadWrite,
    /// Readable only.
    ReadOnly,
    /// Readable and executable, not writable.
    ReadExecute,
}

/// A handle to a memory mapped region.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping has been truncated to nothing.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns the first address past the mapping.
    pub fn end(&self) -> usize {
        self.ptr() as usize + self.len()
    }

    /// Returns `true` if `addr` lies inside the mapping.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr < self.end()
    }

    /// Changes the access rights of the whole mapping.
    pub fn protect(&self, protection: Protection) -> io::Result<()> {
        // SAFETY: the range is exactly the region owned by this handle.
        unsafe { self.inner.protect(protection) }
    }

    /// Releases everything past `new_len` back to the OS.
    ///
    /// `new_len` is rounded up to the system page size. Shrinking to a length
    /// that is not smaller than the current one is a no-op.
    pub fn truncate(&mut self, new_len: usize) -> io::Result<()> {
        let page = page_size();
        let new_len = new_len.div_ceil(page) * page;
        if new_len >= self.len() {
            return Ok(());
        }
        // SAFETY: the released tail belongs to this mapping and no handle to it
        // survives the call.
        unsafe { self.inner.truncate(new_len) }
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
    hint_addr: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub fn new() -> Self {
        Self {
            len: 0,
            align: 0,
            hint_addr: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requires the start of the mapping to be aligned to `align` bytes.
    ///
    /// `align` must be a power of two. Alignments up to the allocation
    /// granularity are always satisfied by the OS; larger ones are obtained by
    /// over-reserving and trimming.
    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Sets a hint address for the mapping.
    ///
    /// This is a request to the OS to place the mapping at this specific virtual address.
    /// The OS is not required to honor this request (on some platforms), or the call
    /// may fail if the address is already in use or invalid.
    ///
    /// The hint is ignored for aligned mappings.
    pub fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    pub fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to reserve swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    pub fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous, zero-filled, read-write memory map.
    ///
    /// # Safety
    ///
    /// The returned `Mmap` owns the memory, so the pointer it yields is valid
    /// for as long as the `Mmap` is alive. The caller must not keep using
    /// pointers into the region after the handle is dropped or truncated.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.align != 0 && !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let inner = if self.align > allocation_granularity() {
            unsafe {
                os::MmapInner::map_anon_aligned(
                    self.len,
                    self.align,
                    self.populate,
                    self.no_reserve,
                )?
            }
        } else {
            unsafe {
                os::MmapInner::map_anon(self.hint_addr, self.len, self.populate, self.no_reserve)?
            }
        };

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_anon()
                .expect("failed to map")
        };

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let result = unsafe { MmapOptions::new().map_anon() };
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_aligned_map() {
        let align = 256 * 1024;
        for _ in 0..4 {
            let mmap = unsafe {
                MmapOptions::new()
                    .len(align)
                    .align(align)
                    .map_anon()
                    .expect("failed to map")
            };
            assert_eq!(mmap.ptr() as usize % align, 0);
            assert_eq!(mmap.len(), align);
            assert!(mmap.contains(mmap.ptr() as usize));
            assert!(!mmap.contains(mmap.end()));
        }
    }

    #[test]
    fn test_protect_round_trip() {
        let mmap = unsafe {
            MmapOptions::new()
                .len(page_size())
                .map_anon()
                .expect("failed to map")
        };
        mmap.protect(Protection::ReadOnly).expect("read-only");
        unsafe {
            assert_eq!(ptr::read_volatile(mmap.ptr()), 0);
        }
        mmap.protect(Protection::ReadWrite).expect("read-write");
        unsafe {
            ptr::write_volatile(mmap.ptr(), 7);
            assert_eq!(ptr::read_volatile(mmap.ptr()), 7);
        }
    }

    #[test]
    fn test_truncate_releases_tail() {
        let ps = page_size();
        let mut mmap = unsafe {
            MmapOptions::new()
                .len(ps * 4)
                .map_anon()
                .expect("failed to map")
        };
        mmap.truncate(ps + 1).expect("truncate");
        assert_eq!(mmap.len(), ps * 2);

        mmap.truncate(ps * 8).expect("grow is a no-op");
        assert_eq!(mmap.len(), ps * 2);

        unsafe {
            ptr::write_volatile(mmap.ptr().add(ps * 2 - 1), 1);
        }
    }

    #[test]
    fn test_map_with_hint() {
        let len = allocation_granularity();

        #[cfg(target_pointer_width = "64")]
        let hint_base = 0x6000_0000_0000usize;
        #[cfg(target_pointer_width = "32")]
        let hint_base = 0x4000_0000usize;

        let mmap_opts = MmapOptions::new().len(len).with_hint(hint_base);

        // The OS may refuse the hint; only a successful mapping is checked.
        if let Ok(mmap) = unsafe { mmap_opts.map_anon() } {
            let ptr = mmap.ptr();
            unsafe {
                ptr::write_volatile(ptr, 99);
                assert_eq!(ptr::read_volatile(ptr), 99);
            }
        }
    }
}
