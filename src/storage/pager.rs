//! Disk-backed page allocation and file-header management.
//!
//! The [`Pager`] owns the database file exclusively: it allocates and frees
//! pages against an in-memory free list, assigns page ids, and is the only
//! component that knows how page ids map to byte offsets. Everything above it
//! (the [`super::buffer_pool::BufferPool`], indexes, collections) deals only in
//! page ids.
//!
//! # File layout
//!
//! Byte 0 begins the 128-byte file header (see [`FileHeader`]). Page `i` (for
//! `i >= 1`) begins at `HEADER_SIZE + i * page_size` — the header occupies the
//! page-0 slot but, per the file-header design note, is *not* itself a
//! [`Page`]: it has no 16-byte page header, only the fields below.
//!
//! # Free-list durability
//!
//! Freeing a page only updates the pager's in-memory free list. The on-disk
//! chain (threaded through the first 4 bytes of each freed page) and the file
//! header's `free_list_head`/`free_page_count` fields are only rewritten by
//! [`Pager::flush`]. A crash between `free_page` and the next flush leaks the
//! page's space but can never cause double allocation, since the in-memory
//! free list that would hand it back out again is gone too.
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace, warn};
use thiserror::Error;

use super::page::{Page, PageError, PageType, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

pub const FILE_HEADER_SIZE: usize = 128;
pub const FILE_MAGIC: u32 = 0x4443_4442;
pub const FILE_FORMAT_VERSION: u32 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_PAGE_SIZE: usize = 8;
const OFF_PAGE_COUNT: usize = 12;
const OFF_FREE_LIST_HEAD: usize = 16;
const OFF_FREE_PAGE_COUNT: usize = 20;
const OFF_SCHEMA_ROOT: usize = 24;
const OFF_FLAGS: usize = 28;

const SENTINEL_PAGE_ID: u32 = u32::MAX;
pub const FLAG_DIRTY_SHUTDOWN: u8 = 0x04;

#[derive(Debug, Error)]
pub enum PagerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("page error: {0}")]
    Page(#[from] PageError),
    #[error("not a docdb file: bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
    #[error("page id {0} is out of bounds (page count {1})")]
    OutOfBounds(u32, u32),
    #[error("invalid page size {0}: must be a power of two in [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]")]
    InvalidPageSize(u32),
}

/// In-memory view of the 128-byte page-0 header. See module docs for layout.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub page_size: u32,
    pub page_count: u32,
    pub free_list_head: u32,
    pub free_page_count: u32,
    pub schema_root: u32,
    pub dirty_shutdown: bool,
}

impl FileHeader {
    fn fresh(page_size: u32) -> Self {
        Self {
            page_size,
            page_count: 0,
            free_list_head: SENTINEL_PAGE_ID,
            free_page_count: 0,
            schema_root: SENTINEL_PAGE_ID,
            dirty_shutdown: false,
        }
    }

    fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&FILE_FORMAT_VERSION.to_le_bytes());
        buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&self.page_size.to_le_bytes());
        buf[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4].copy_from_slice(&self.page_count.to_le_bytes());
        buf[OFF_FREE_LIST_HEAD..OFF_FREE_LIST_HEAD + 4]
            .copy_from_slice(&self.free_list_head.to_le_bytes());
        buf[OFF_FREE_PAGE_COUNT..OFF_FREE_PAGE_COUNT + 4]
            .copy_from_slice(&self.free_page_count.to_le_bytes());
        buf[OFF_SCHEMA_ROOT..OFF_SCHEMA_ROOT + 4].copy_from_slice(&self.schema_root.to_le_bytes());
        buf[OFF_FLAGS] = if self.dirty_shutdown {
            FLAG_DIRTY_SHUTDOWN
        } else {
            0
        };
        buf
    }

    fn from_bytes(buf: &[u8; FILE_HEADER_SIZE]) -> Result<Self, PagerError> {
        let magic = u32::from_le_bytes(buf[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap());
        if magic != FILE_MAGIC {
            return Err(PagerError::BadMagic(magic));
        }
        let version = u32::from_le_bytes(buf[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap());
        if version != FILE_FORMAT_VERSION {
            return Err(PagerError::UnsupportedVersion(version));
        }
        Ok(Self {
            page_size: u32::from_le_bytes(buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].try_into().unwrap()),
            page_count: u32::from_le_bytes(
                buf[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4].try_into().unwrap(),
            ),
            free_list_head: u32::from_le_bytes(
                buf[OFF_FREE_LIST_HEAD..OFF_FREE_LIST_HEAD + 4]
                    .try_into()
                    .unwrap(),
            ),
            free_page_count: u32::from_le_bytes(
                buf[OFF_FREE_PAGE_COUNT..OFF_FREE_PAGE_COUNT + 4]
                    .try_into()
                    .unwrap(),
            ),
            schema_root: u32::from_le_bytes(
                buf[OFF_SCHEMA_ROOT..OFF_SCHEMA_ROOT + 4].try_into().unwrap(),
            ),
            dirty_shutdown: buf[OFF_FLAGS] & FLAG_DIRTY_SHUTDOWN != 0,
        })
    }
}

/// Owns the database file: page allocation, the free list, and the file
/// header. Does not cache page contents — that is the buffer pool's job.
#[derive(Debug)]
pub struct Pager {
    file: File,
    header: FileHeader,
    /// In-memory free list, most-recently-freed last. Not durable until
    /// `flush`.
    free_list: Vec<u32>,
    verify_checksums: bool,
    recovered_from_dirty_shutdown: bool,
}

impl Pager {
    pub fn create(path: impl AsRef<Path>, page_size: u32) -> Result<Self, PagerError> {
        Self::open_with(path, Some(page_size), true)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, PagerError> {
        Self::open_with(path, None, true)
    }

    pub fn open_with_checksum_policy(
        path: impl AsRef<Path>,
        page_size: Option<u32>,
        verify_checksums: bool,
    ) -> Result<Self, PagerError> {
        Self::open_with(path, page_size, verify_checksums)
    }

    fn open_with(
        path: impl AsRef<Path>,
        page_size: Option<u32>,
        verify_checksums: bool,
    ) -> Result<Self, PagerError> {
        if let Some(size) = page_size {
            if !size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) {
                return Err(PagerError::InvalidPageSize(size));
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path.as_ref())?;

        let existing = file.metadata()?.len() > 0;
        let mut recovered = false;

        let header = if existing {
            let mut buf = [0u8; FILE_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let mut header = FileHeader::from_bytes(&buf)?;
            if header.dirty_shutdown {
                warn!("database was not shut down cleanly; recovery is required");
                recovered = true;
            } else {
                header.dirty_shutdown = true;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&header.to_bytes())?;
                file.flush()?;
            }
            header
        } else {
            let size = page_size.unwrap_or(DEFAULT_PAGE_SIZE);
            let mut header = FileHeader::fresh(size);
            header.dirty_shutdown = true;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.to_bytes())?;
            file.flush()?;
            header
        };

        let mut pager = Self {
            file,
            header,
            free_list: Vec::new(),
            verify_checksums,
            recovered_from_dirty_shutdown: recovered,
        };
        pager.load_free_list()?;
        Ok(pager)
    }

    fn load_free_list(&mut self) -> Result<(), PagerError> {
        let mut chain = Vec::with_capacity(self.header.free_page_count as usize);
        let mut current = self.header.free_list_head;
        for _ in 0..self.header.free_page_count {
            if current == SENTINEL_PAGE_ID {
                break;
            }
            chain.push(current);
            let offset = self.page_offset(current);
            let mut buf = [0u8; 4];
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut buf)?;
            current = u32::from_le_bytes(buf);
        }
        // Stored head-to-tail; our stack pops from the end, so the head goes last.
        chain.reverse();
        self.free_list = chain;
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.header.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.header.page_count
    }

    pub fn free_page_count(&self) -> u32 {
        self.free_list.len() as u32
    }

    pub fn recovered_from_dirty_shutdown(&self) -> bool {
        self.recovered_from_dirty_shutdown
    }

    pub fn schema_root(&self) -> Option<u32> {
        (self.header.schema_root != SENTINEL_PAGE_ID).then_some(self.header.schema_root)
    }

    pub fn set_schema_root(&mut self, page_id: u32) {
        self.header.schema_root = page_id;
    }

    fn page_offset(&self, id: u32) -> u64 {
        FILE_HEADER_SIZE as u64 + id as u64 * self.header.page_size as u64
    }

    /// Allocates a page, preferring a slot from the free list over growing the
    /// file.
    pub fn allocate_page(&mut self, page_type: PageType) -> Result<Page, PagerError> {
        let id = if let Some(id) = self.free_list.pop() {
            trace!("reusing freed page {id}");
            id
        } else {
            let id = self.header.page_count;
            self.header.page_count += 1;
            id
        };
        let page = Page::new(id, page_type, self.header.page_size);
        self.write_page(&page)?;
        Ok(page)
    }

    /// Marks a page free. Durable only after the next `flush`.
    pub fn free_page(&mut self, id: u32) -> Result<(), PagerError> {
        if id >= self.header.page_count {
            return Err(PagerError::OutOfBounds(id, self.header.page_count));
        }
        self.free_list.push(id);
        debug!("page {id} queued for free (pending flush)");
        Ok(())
    }

    pub fn read_page(&mut self, id: u32) -> Result<Page, PagerError> {
        if id >= self.header.page_count {
            return Err(PagerError::OutOfBounds(id, self.header.page_count));
        }
        let mut buf = vec![0u8; self.header.page_size as usize];
        self.file.seek(SeekFrom::Start(self.page_offset(id)))?;
        self.file.read_exact(&mut buf)?;
        let page = Page::from_bytes(buf);
        if self.verify_checksums {
            page.verify_checksum()?;
        }
        Ok(page)
    }

    pub fn write_page(&mut self, page: &Page) -> Result<(), PagerError> {
        let mut page = page.clone();
        page.update_checksum();
        self.file
            .seek(SeekFrom::Start(self.page_offset(page.page_id())))?;
        self.file.write_all(page.as_bytes())?;
        Ok(())
    }

    pub fn write_pages(&mut self, pages: &[Page]) -> Result<(), PagerError> {
        for page in pages {
            self.write_page(page)?;
        }
        Ok(())
    }

    /// Flushes the free-list chain and file header to disk. This is the only
    /// point at which a `free_page` call becomes durable.
    pub fn flush(&mut self) -> Result<(), PagerError> {
        for window in 0..self.free_list.len() {
            let id = self.free_list[window];
            let next = if window == 0 {
                SENTINEL_PAGE_ID
            } else {
                self.free_list[window - 1]
            };
            let mut link = [0u8; 4];
            link.copy_from_slice(&next.to_le_bytes());
            self.file.seek(SeekFrom::Start(self.page_offset(id)))?;
            self.file.write_all(&link)?;
        }
        self.header.free_list_head = self.free_list.last().copied().unwrap_or(SENTINEL_PAGE_ID);
        self.header.free_page_count = self.free_list.len() as u32;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Clears the dirty-shutdown bit. Called on a clean `Database::close`.
    pub fn mark_clean_shutdown(&mut self) -> Result<(), PagerError> {
        self.header.dirty_shutdown = false;
        self.flush()?;
        self.recovered_from_dirty_shutdown = false;
        Ok(())
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("failed to flush pager on drop: {e}");
        }
    }
}

/// Returns the directory component used for WAL files for a given database
/// path, matching `<path>/wal/` from the persisted-state layout.
pub fn default_wal_dir(db_path: impl AsRef<Path>) -> PathBuf {
    db_path
        .as_ref()
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("wal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn allocate_grows_page_count() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::create(temp.path().join("db"), DEFAULT_PAGE_SIZE).unwrap();
        let p0 = pager.allocate_page(PageType::Data).unwrap();
        let p1 = pager.allocate_page(PageType::Data).unwrap();
        assert_eq!(p0.page_id(), 0);
        assert_eq!(p1.page_id(), 1);
        assert_eq!(pager.page_count(), 2);
    }

    #[test]
    fn free_then_allocate_reuses_slot() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::create(temp.path().join("db"), DEFAULT_PAGE_SIZE).unwrap();
        let p0 = pager.allocate_page(PageType::Data).unwrap();
        let _p1 = pager.allocate_page(PageType::Data).unwrap();
        pager.free_page(p0.page_id()).unwrap();
        let reused = pager.allocate_page(PageType::Data).unwrap();
        assert_eq!(reused.page_id(), p0.page_id());
        assert_eq!(pager.page_count(), 2);
    }

    #[test]
    fn free_list_survives_reopen_after_flush() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("db");
        {
            let mut pager = Pager::create(&path, DEFAULT_PAGE_SIZE).unwrap();
            let p0 = pager.allocate_page(PageType::Data).unwrap();
            let _p1 = pager.allocate_page(PageType::Data).unwrap();
            pager.free_page(p0.page_id()).unwrap();
            pager.flush().unwrap();
        }
        let mut reopened = Pager::open(&path).unwrap();
        assert_eq!(reopened.free_page_count(), 1);
        let reused = reopened.allocate_page(PageType::Data).unwrap();
        assert_eq!(reused.page_id(), 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::create(temp.path().join("db"), DEFAULT_PAGE_SIZE).unwrap();
        let mut page = pager.allocate_page(PageType::Data).unwrap();
        page.write_u32(super::super::page::PAGE_HEADER_SIZE, 42)
            .unwrap();
        pager.write_page(&page).unwrap();

        let read_back = pager.read_page(page.page_id()).unwrap();
        assert_eq!(
            read_back
                .read_u32(super::super::page::PAGE_HEADER_SIZE)
                .unwrap(),
            42
        );
    }

    #[test]
    fn dirty_shutdown_detected_on_reopen_without_clean_close() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("db");
        {
            let mut pager = Pager::create(&path, DEFAULT_PAGE_SIZE).unwrap();
            pager.allocate_page(PageType::Data).unwrap();
            pager.flush().unwrap();
            // Dropped without mark_clean_shutdown: dirty bit stays set.
        }
        let reopened = Pager::open(&path).unwrap();
        assert!(reopened.recovered_from_dirty_shutdown());
    }

    #[test]
    fn clean_close_clears_dirty_bit() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("db");
        {
            let mut pager = Pager::create(&path, DEFAULT_PAGE_SIZE).unwrap();
            pager.allocate_page(PageType::Data).unwrap();
            pager.mark_clean_shutdown().unwrap();
        }
        let reopened = Pager::open(&path).unwrap();
        assert!(!reopened.recovered_from_dirty_shutdown());
    }

    #[test]
    fn rejects_bad_page_size() {
        let temp = TempDir::new("pager").unwrap();
        let err = Pager::create(temp.path().join("db"), 100);
        assert!(matches!(err, Err(PagerError::InvalidPageSize(100))));
    }
}
