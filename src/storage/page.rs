//! Fixed-size page representation.
//!
//! A [`Page`] is the unit of I/O and caching throughout the storage engine: the
//! [`super::pager::Pager`] reads and writes whole pages, the
//! [`super::buffer_pool::BufferPool`] caches whole pages, and every higher layer
//! (indexes, collections) ultimately bottoms out in page-relative byte offsets.
//!
//! # Layout
//!
//! ```text
//! byte 0   page-id            (u32, LE)
//! byte 4   type               (u8)
//! byte 5   flags              (u8, bitfield)
//! byte 6   free-space-offset  (u16, LE)
//! byte 8   checksum           (u32, LE, CRC32)
//! byte 12  reserved           (4 bytes)
//! byte 16  ...page body...
//! ```
//!
//! Page 0 of a database file is the exception: per the file-header design note it
//! carries no page header at all and is never constructed as a [`Page`] — see
//! [`super::pager::FileHeader`].
use thiserror::Error;

pub const MIN_PAGE_SIZE: u32 = 4096;
pub const MAX_PAGE_SIZE: u32 = 32768;
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

pub const PAGE_HEADER_SIZE: usize = 16;

const OFF_PAGE_ID: usize = 0;
const OFF_TYPE: usize = 4;
const OFF_FLAGS: usize = 5;
const OFF_FREE_SPACE: usize = 6;
const OFF_CHECKSUM: usize = 8;

pub const FLAG_DIRTY: u8 = 0x01;
pub const FLAG_PINNED: u8 = 0x02;
pub const FLAG_DELETED: u8 = 0x04;
pub const FLAG_OVERFLOW: u8 = 0x08;
pub const FLAG_COMPRESSED: u8 = 0x10;
pub const FLAG_ENCRYPTED: u8 = 0x20;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("offset {offset} + {len} exceeds page size {page_size}")]
    OutOfRange {
        offset: usize,
        len: usize,
        page_size: usize,
    },
    #[error("string at offset {0} is not valid UTF-8")]
    InvalidString(usize),
    #[error("checksum mismatch on page {page_id}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        page_id: u32,
        stored: u32,
        computed: u32,
    },
    #[error("unknown page type byte {0}")]
    UnknownType(u8),
}

/// The kind of content a page holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Header = 0,
    Data = 1,
    Index = 2,
    Overflow = 3,
    FreeList = 4,
    Schema = 5,
    Wal = 6,
}

impl TryFrom<u8> for PageType {
    type Error = PageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PageType::Header,
            1 => PageType::Data,
            2 => PageType::Index,
            3 => PageType::Overflow,
            4 => PageType::FreeList,
            5 => PageType::Schema,
            6 => PageType::Wal,
            other => return Err(PageError::UnknownType(other)),
        })
    }
}

/// A fixed-size block of bytes plus the typed accessors used to read and write
/// it. `pin_count` and the dirty bit are tracked on the page itself so a page
/// obtained directly from the [`super::pager::Pager`] (bypassing the buffer
/// pool) still has well-defined pin semantics.
#[derive(Debug, Clone)]
pub struct Page {
    buf: Vec<u8>,
    pin_count: u32,
}

impl Page {
    /// Allocates a zero-filled page of `page_size` bytes with a freshly written
    /// header.
    pub fn new(page_id: u32, page_type: PageType, page_size: u32) -> Self {
        let mut page = Self {
            buf: vec![0u8; page_size as usize],
            pin_count: 0,
        };
        page.write_u32(OFF_PAGE_ID, page_id)
            .expect("header region always fits in a page");
        page.buf[OFF_TYPE] = page_type as u8;
        page.write_u16(OFF_FREE_SPACE, PAGE_HEADER_SIZE as u16)
            .expect("header region always fits in a page");
        page.update_checksum();
        page
    }

    /// Wraps a raw buffer read from disk. The caller is responsible for
    /// checksum verification via [`Page::verify_checksum`].
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf, pin_count: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn page_id(&self) -> u32 {
        u32::from_le_bytes(self.buf[OFF_PAGE_ID..OFF_PAGE_ID + 4].try_into().unwrap())
    }

    pub fn page_type(&self) -> Result<PageType, PageError> {
        PageType::try_from(self.buf[OFF_TYPE])
    }

    /// Replaces the type byte and marks the page dirty.
    pub fn set_type(&mut self, page_type: PageType) {
        self.buf[OFF_TYPE] = page_type as u8;
        self.set_flag(FLAG_DIRTY);
    }

    pub fn free_space_offset(&self) -> u16 {
        u16::from_le_bytes(
            self.buf[OFF_FREE_SPACE..OFF_FREE_SPACE + 2]
                .try_into()
                .unwrap(),
        )
    }

    pub fn set_free_space_offset(&mut self, offset: u16) {
        self.buf[OFF_FREE_SPACE..OFF_FREE_SPACE + 2].copy_from_slice(&offset.to_le_bytes());
        self.set_flag(FLAG_DIRTY);
    }

    // -- flags --------------------------------------------------------------

    pub fn flags(&self) -> u8 {
        self.buf[OFF_FLAGS]
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.buf[OFF_FLAGS] |= flag;
    }

    pub fn clear_flag(&mut self, flag: u8) {
        self.buf[OFF_FLAGS] &= !flag;
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.buf[OFF_FLAGS] & flag != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.has_flag(FLAG_DIRTY)
    }

    pub fn mark_clean(&mut self) {
        self.clear_flag(FLAG_DIRTY);
    }

    // -- pin counting -----------------------------------------------------------

    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    pub fn pin(&mut self) {
        self.pin_count += 1;
        self.set_flag(FLAG_PINNED);
    }

    /// Decrements the pin count. Per spec, unpinning an already-unpinned page
    /// is a loud contract violation, not a recoverable error.
    pub fn unpin(&mut self) {
        if self.pin_count == 0 {
            panic!(
                "unpin() called on page {} with pin_count already 0",
                self.page_id()
            );
        }
        self.pin_count -= 1;
        if self.pin_count == 0 {
            self.clear_flag(FLAG_PINNED);
        }
    }

    // -- checksum -----------------------------------------------------------

    /// CRC32 (polynomial 0xEDB88320, init 0xFFFFFFFF) over the whole page with
    /// the checksum field zeroed.
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.buf[..OFF_CHECKSUM]);
        hasher.update(&[0u8; 4]);
        hasher.update(&self.buf[OFF_CHECKSUM + 4..]);
        hasher.finalize()
    }

    pub fn stored_checksum(&self) -> u32 {
        u32::from_le_bytes(
            self.buf[OFF_CHECKSUM..OFF_CHECKSUM + 4]
                .try_into()
                .unwrap(),
        )
    }

    pub fn update_checksum(&mut self) {
        let checksum = self.compute_checksum();
        self.buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());
    }

    pub fn verify_checksum(&self) -> Result<(), PageError> {
        let computed = self.compute_checksum();
        let stored = self.stored_checksum();
        if computed == stored {
            Ok(())
        } else {
            Err(PageError::ChecksumMismatch {
                page_id: self.page_id(),
                stored,
                computed,
            })
        }
    }

    // -- typed byte accessors -------------------------------------------------

    fn check_range(&self, offset: usize, len: usize) -> Result<(), PageError> {
        if offset + len > self.buf.len() {
            return Err(PageError::OutOfRange {
                offset,
                len,
                page_size: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8], PageError> {
        self.check_range(offset, len)?;
        Ok(&self.buf[offset..offset + len])
    }

    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<(), PageError> {
        self.check_range(offset, data.len())?;
        self.buf[offset..offset + data.len()].copy_from_slice(data);
        self.set_flag(FLAG_DIRTY);
        Ok(())
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8, PageError> {
        self.check_range(offset, 1)?;
        Ok(self.buf[offset])
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) -> Result<(), PageError> {
        self.write_bytes(offset, &[value])
    }

    pub fn read_i8(&self, offset: usize) -> Result<i8, PageError> {
        Ok(self.read_u8(offset)? as i8)
    }

    pub fn write_i8(&mut self, offset: usize, value: i8) -> Result<(), PageError> {
        self.write_u8(offset, value as u8)
    }
}

macro_rules! int_accessor {
    ($read:ident, $write:ident, $ty:ty) => {
        impl Page {
            pub fn $read(&self, offset: usize) -> Result<$ty, PageError> {
                let bytes = self.read_bytes(offset, size_of::<$ty>())?;
                Ok(<$ty>::from_le_bytes(bytes.try_into().unwrap()))
            }

            pub fn $write(&mut self, offset: usize, value: $ty) -> Result<(), PageError> {
                self.write_bytes(offset, &value.to_le_bytes())
            }
        }
    };
}

int_accessor!(read_u16, write_u16, u16);
int_accessor!(read_i16, write_i16, i16);
int_accessor!(read_u32, write_u32, u32);
int_accessor!(read_i32, write_i32, i32);
int_accessor!(read_u64, write_u64, u64);
int_accessor!(read_i64, write_i64, i64);
int_accessor!(read_f32, write_f32, f32);
int_accessor!(read_f64, write_f64, f64);

impl Page {
    /// Writes a `u16`-length-prefixed UTF-8 string; returns the offset just
    /// past the written data.
    pub fn write_string(&mut self, offset: usize, s: &str) -> Result<usize, PageError> {
        let bytes = s.as_bytes();
        self.write_u16(offset, bytes.len() as u16)?;
        self.write_bytes(offset + 2, bytes)?;
        Ok(offset + 2 + bytes.len())
    }

    pub fn read_string(&self, offset: usize) -> Result<(String, usize), PageError> {
        let len = self.read_u16(offset)? as usize;
        let bytes = self.read_bytes(offset + 2, len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| PageError::InvalidString(offset))?
            .to_string();
        Ok((s, offset + 2 + len))
    }

    /// Writes a NUL-terminated string, bounded by `max_len` total bytes
    /// (including the terminator).
    pub fn write_cstr(&mut self, offset: usize, s: &str, max_len: usize) -> Result<(), PageError> {
        let bytes = s.as_bytes();
        if bytes.len() + 1 > max_len {
            return Err(PageError::OutOfRange {
                offset,
                len: max_len,
                page_size: self.buf.len(),
            });
        }
        self.write_bytes(offset, bytes)?;
        self.write_u8(offset + bytes.len(), 0)?;
        Ok(())
    }

    pub fn read_cstr_bounded(&self, offset: usize, max_len: usize) -> Result<String, PageError> {
        let region = self.read_bytes(offset, max_len)?;
        let end = region.iter().position(|&b| b == 0).unwrap_or(region.len());
        std::str::from_utf8(&region[..end])
            .map(|s| s.to_string())
            .map_err(|_| PageError::InvalidString(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_has_valid_checksum() {
        let page = Page::new(1, PageType::Data, DEFAULT_PAGE_SIZE);
        assert!(page.verify_checksum().is_ok());
        assert_eq!(page.page_id(), 1);
        assert_eq!(page.page_type().unwrap(), PageType::Data);
    }

    #[test]
    fn round_trip_through_bytes() {
        let mut page = Page::new(7, PageType::Index, DEFAULT_PAGE_SIZE);
        page.write_u32(PAGE_HEADER_SIZE, 0xdead_beef).unwrap();
        page.update_checksum();

        let bytes = page.as_bytes().to_vec();
        let restored = Page::from_bytes(bytes);
        assert_eq!(restored.page_id(), 7);
        assert_eq!(restored.read_u32(PAGE_HEADER_SIZE).unwrap(), 0xdead_beef);
        assert!(restored.verify_checksum().is_ok());
    }

    #[test]
    fn corrupted_page_fails_checksum() {
        let mut page = Page::new(1, PageType::Data, DEFAULT_PAGE_SIZE);
        page.update_checksum();
        let mut bytes = page.as_bytes().to_vec();
        bytes[PAGE_HEADER_SIZE] ^= 0xff;
        let corrupted = Page::from_bytes(bytes);
        assert!(corrupted.verify_checksum().is_err());
    }

    #[test]
    fn string_round_trip() {
        let mut page = Page::new(1, PageType::Data, DEFAULT_PAGE_SIZE);
        let next = page.write_string(PAGE_HEADER_SIZE, "hello").unwrap();
        let (s, end) = page.read_string(PAGE_HEADER_SIZE).unwrap();
        assert_eq!(s, "hello");
        assert_eq!(end, next);
    }

    #[test]
    fn out_of_range_rejected() {
        let page = Page::new(1, PageType::Data, DEFAULT_PAGE_SIZE);
        let err = page.read_u64(DEFAULT_PAGE_SIZE as usize - 2);
        assert!(matches!(err, Err(PageError::OutOfRange { .. })));
    }

    #[test]
    #[should_panic]
    fn unpin_underflow_panics() {
        let mut page = Page::new(1, PageType::Data, DEFAULT_PAGE_SIZE);
        page.unpin();
    }

    #[test]
    fn pin_unpin_tracks_flag() {
        let mut page = Page::new(1, PageType::Data, DEFAULT_PAGE_SIZE);
        page.pin();
        assert!(page.has_flag(FLAG_PINNED));
        page.unpin();
        assert!(!page.has_flag(FLAG_PINNED));
    }
}
