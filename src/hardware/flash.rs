// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Page-granular flash abstraction.
//!
//! The credential store lives on an external flash part that is programmed
//! a page at a time: bytes are first written into the chip's single internal
//! staging buffer and only land on a page when the buffer is committed. The
//! [`PageFlash`] trait exposes exactly that contract, because two of the
//! core's features lean on it directly: the multi-packet node write stages
//! a whole page across several USB packets before committing it, and the
//! media import streams page-sized runs through the same buffer.
//!
//! There is exactly one staging buffer. The core serializes its users (one
//! write-in-progress at a time, tracked by the session state machine); the
//! trait does not attempt to detect interleaved staging.

use static_assertions::assert_obj_safe;

/// A [`PageFlash`] error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Indicates that an operation referenced a page or offset outside of
    /// the device's address space.
    OutOfRange,

    /// Indicates that the device rejected a program or commit operation.
    ///
    /// This is not recoverable within a command; the dispatcher folds it
    /// into the generic error byte.
    WriteFailed,
}

/// Provides access to a page-programmed flash device.
///
/// Reads may touch any in-bounds `(page, offset)` range. Writes go through
/// the staging buffer: [`PageFlash::load_page`] fills it from an existing
/// page, [`PageFlash::stage`] patches bytes into it, and
/// [`PageFlash::commit`] programs it to a page. Nothing is persistent until
/// `commit` returns.
pub trait PageFlash {
    /// Returns the number of bytes in one page.
    fn page_size(&self) -> usize;

    /// Returns the number of pages in this device.
    fn page_count(&self) -> u16;

    /// Reads `out.len()` bytes from `page`, starting `offset` bytes in.
    fn read(&self, page: u16, offset: usize, out: &mut [u8])
        -> Result<(), Error>;

    /// Fills the staging buffer with the current contents of `page`.
    fn load_page(&mut self, page: u16) -> Result<(), Error>;

    /// Overwrites `data.len()` bytes of the staging buffer, starting
    /// `offset` bytes in. The staging buffer's previous contents outside
    /// the patched range are preserved.
    fn stage(&mut self, offset: usize, data: &[u8]) -> Result<(), Error>;

    /// Programs the staging buffer to `page`.
    ///
    /// The staging buffer's contents remain valid after a commit, so a
    /// caller may commit the same bytes to a second page.
    fn commit(&mut self, page: u16) -> Result<(), Error>;
}
assert_obj_safe!(PageFlash);

impl<F: PageFlash + ?Sized> PageFlash for &mut F {
    #[inline]
    fn page_size(&self) -> usize {
        F::page_size(self)
    }

    #[inline]
    fn page_count(&self) -> u16 {
        F::page_count(self)
    }

    #[inline]
    fn read(
        &self,
        page: u16,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Error> {
        F::read(self, page, offset, out)
    }

    #[inline]
    fn load_page(&mut self, page: u16) -> Result<(), Error> {
        F::load_page(self, page)
    }

    #[inline]
    fn stage(&mut self, offset: usize, data: &[u8]) -> Result<(), Error> {
        F::stage(self, offset, data)
    }

    #[inline]
    fn commit(&mut self, page: u16) -> Result<(), Error> {
        F::commit(self, page)
    }
}

/// A RAM-backed [`PageFlash`], for host-side tests.
///
/// `PAGES` pages of `PAGE_SIZE` bytes each, plus one staging buffer. A
/// freshly created device reads as erased flash (all ones), which is what
/// the node store's free-slot scan expects of untouched slots.
pub struct RamFlash<const PAGE_SIZE: usize, const PAGES: usize> {
    pages: [[u8; PAGE_SIZE]; PAGES],
    staging: [u8; PAGE_SIZE],
}

impl<const PAGE_SIZE: usize, const PAGES: usize> RamFlash<PAGE_SIZE, PAGES> {
    /// Creates a new, fully erased `RamFlash`.
    pub fn new() -> Self {
        Self {
            pages: [[0xff; PAGE_SIZE]; PAGES],
            staging: [0xff; PAGE_SIZE],
        }
    }
}

impl<const PAGE_SIZE: usize, const PAGES: usize> Default
    for RamFlash<PAGE_SIZE, PAGES>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const PAGE_SIZE: usize, const PAGES: usize> PageFlash
    for RamFlash<PAGE_SIZE, PAGES>
{
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn page_count(&self) -> u16 {
        PAGES as u16
    }

    fn read(
        &self,
        page: u16,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Error> {
        let page = self.pages.get(page as usize).ok_or(Error::OutOfRange)?;
        let end = offset.checked_add(out.len()).ok_or(Error::OutOfRange)?;
        if end > PAGE_SIZE {
            return Err(Error::OutOfRange);
        }
        out.copy_from_slice(&page[offset..end]);
        Ok(())
    }

    fn load_page(&mut self, page: u16) -> Result<(), Error> {
        let page = self.pages.get(page as usize).ok_or(Error::OutOfRange)?;
        self.staging.copy_from_slice(page);
        Ok(())
    }

    fn stage(&mut self, offset: usize, data: &[u8]) -> Result<(), Error> {
        let end = offset.checked_add(data.len()).ok_or(Error::OutOfRange)?;
        if end > PAGE_SIZE {
            return Err(Error::OutOfRange);
        }
        self.staging[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self, page: u16) -> Result<(), Error> {
        let page =
            self.pages.get_mut(page as usize).ok_or(Error::OutOfRange)?;
        page.copy_from_slice(&self.staging);
        Ok(())
    }
}
