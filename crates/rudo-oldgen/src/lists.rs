//! The page lists of a space and the address index over them.
//!
//! Every page is owned by exactly one list. Moving a page between lists
//! moves the `Page` value. The index maps each page base to its end and
//! list, answering `contains` in `O(log n)` for image pages as well, which
//! masking cannot handle.

use std::collections::BTreeMap;

use crate::object::bytes_to_words;
use crate::page::{Page, PageKind};

/// Which list a page lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ListKind {
    Data,
    Executable,
    Large,
    Image,
}

impl ListKind {
    /// List of the regular pages of `kind`.
    pub(crate) const fn regular(kind: PageKind) -> Self {
        match kind {
            PageKind::Data => Self::Data,
            PageKind::Executable => Self::Executable,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    end: usize,
    list: ListKind,
    kind: PageKind,
}

/// A located page, as returned by [`PageLists::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageRef {
    pub(crate) base: usize,
    pub(crate) list: ListKind,
    pub(crate) kind: PageKind,
}

#[derive(Debug, Default)]
pub(crate) struct PageLists {
    pub(crate) data: Vec<Page>,
    pub(crate) executable: Vec<Page>,
    pub(crate) large: Vec<Page>,
    pub(crate) image: Vec<Page>,
    index: BTreeMap<usize, IndexEntry>,
    capacity_in_words: usize,
    /// Set by a space-wide `write_protect(true)`.
    pub(crate) protected: bool,
}

impl PageLists {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn list(&self, list: ListKind) -> &Vec<Page> {
        match list {
            ListKind::Data => &self.data,
            ListKind::Executable => &self.executable,
            ListKind::Large => &self.large,
            ListKind::Image => &self.image,
        }
    }

    pub(crate) fn list_mut(&mut self, list: ListKind) -> &mut Vec<Page> {
        match list {
            ListKind::Data => &mut self.data,
            ListKind::Executable => &mut self.executable,
            ListKind::Large => &mut self.large,
            ListKind::Image => &mut self.image,
        }
    }

    /// Words of mapped memory; image pages do not count.
    pub(crate) const fn capacity_in_words(&self) -> usize {
        self.capacity_in_words
    }

    pub(crate) fn page_count(&self) -> usize {
        self.index.len()
    }

    /// Every page, in list order: data, executable, large, image.
    pub(crate) fn pages(&self) -> impl Iterator<Item = &Page> {
        self.data
            .iter()
            .chain(&self.executable)
            .chain(&self.large)
            .chain(&self.image)
    }

    /// Every page the space owns (image pages excluded).
    pub(crate) fn owned_pages_mut(&mut self) -> impl Iterator<Item = &mut Page> {
        self.data
            .iter_mut()
            .chain(&mut self.executable)
            .chain(&mut self.large)
    }

    /// Take ownership of `page` on `list`.
    pub(crate) fn add(&mut self, page: Page, list: ListKind) {
        debug_assert_eq!(page.is_image_page(), list == ListKind::Image);
        debug_assert_eq!(page.is_large(), list == ListKind::Large);
        let base = page.base();
        let previous = self.index.insert(
            base,
            IndexEntry {
                end: page.end(),
                list,
                kind: page.kind(),
            },
        );
        assert!(previous.is_none(), "page {base:#x} added twice");
        if list != ListKind::Image {
            self.capacity_in_words += page.size_in_words();
        }

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_page_allocated(
            page.kind(),
            base,
            page.size_in_words(),
            page.is_large(),
        );

        self.list_mut(list).push(page);
    }

    /// Remove the page at `position` of `list` and unmap it.
    ///
    /// Returns the capacity given back, in words.
    pub(crate) fn release(&mut self, list: ListKind, position: usize) -> usize {
        assert!(list != ListKind::Image, "image pages are never freed");
        let page = self.list_mut(list).remove(position);
        self.index.remove(&page.base());
        let words = page.size_in_words();
        self.capacity_in_words -= words;

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_page_freed(page.kind(), page.base(), words);

        drop(page);
        words
    }

    /// Account for `bytes` handed back to the OS from the end of the page
    /// at `base`, which stays.
    pub(crate) fn shrink_page(&mut self, base: usize, bytes: usize) {
        if let Some(entry) = self.index.get_mut(&base) {
            entry.end -= bytes;
        }
        self.capacity_in_words -= bytes_to_words(bytes);
    }

    /// Page whose memory holds `addr`.
    pub(crate) fn lookup(&self, addr: usize) -> Option<PageRef> {
        let (&base, entry) = self.index.range(..=addr).next_back()?;
        (addr < entry.end).then_some(PageRef {
            base,
            list: entry.list,
            kind: entry.kind,
        })
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.lookup(addr).is_some()
    }

    /// Returns `true` if `addr` lies in a page the space owns.
    pub(crate) fn contains_owned(&self, addr: usize) -> bool {
        self.lookup(addr)
            .is_some_and(|page| page.list != ListKind::Image)
    }

    pub(crate) fn position(&self, page: PageRef) -> Option<usize> {
        self.list(page.list)
            .iter()
            .position(|candidate| candidate.base() == page.base)
    }

    pub(crate) fn page(&self, page: PageRef) -> Option<&Page> {
        let position = self.position(page)?;
        self.list(page.list).get(position)
    }

    pub(crate) fn page_mut(&mut self, page: PageRef) -> Option<&mut Page> {
        let position = self.position(page)?;
        self.list_mut(page.list).get_mut(position)
    }

    /// Set the protection of every executable page except the one at
    /// `except`.
    pub(crate) fn write_protect_code(&mut self, read_only: bool, except: Option<usize>) {
        let code = self.executable.iter_mut().chain(
            self.large
                .iter_mut()
                .filter(|page| page.kind() == PageKind::Executable),
        );
        for page in code {
            if Some(page.base()) != except && page.is_write_protected() != read_only {
                page.write_protect(read_only);
            }
        }
    }

    /// Set the protection of every owned page.
    pub(crate) fn write_protect_all(&mut self, read_only: bool) {
        for page in self.owned_pages_mut() {
            if page.is_write_protected() != read_only {
                page.write_protect(read_only);
            }
        }
    }
}
