//! Paged storage stack: fixed-size pages, a file-backed pager, a bounded LRU
//! buffer pool sitting on top of it, and a write-ahead log for durability.
//!
//! This plays the role `cryo::storage` plays for its row/BTree store, but the
//! unit of storage here is an opaque page, not a typed row — collections and
//! indexes above this module decide how to lay entities out inside pages.
//!
//! # Layering
//!
//! - [`page`]: a single fixed-size page, its header, flags, and checksum.
//! - [`pager`]: allocates/frees/reads/writes whole pages in a file, and owns
//!   the on-disk file header and free list.
//! - [`buffer_pool`]: caches a bounded number of pages in memory with LRU
//!   eviction and pin/dirty tracking, backed by a [`pager::Pager`].
//! - [`wal`]: an independent append-only log of typed, transaction-scoped
//!   records, replayed on recovery via a [`wal::RedoHandler`] implemented by
//!   the database layer.
pub mod buffer_pool;
pub mod page;
pub mod pager;
pub mod wal;

pub use buffer_pool::{BufferPool, BufferPoolError, BufferPoolStats};
pub use page::{Page, PageError, PageType};
pub use pager::{Pager, PagerError};
