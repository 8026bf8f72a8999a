//! Database configuration.
//!
//! Generalizes the options `cryo`'s CLI wires up ad hoc (page path, whether to
//! log, etc.) into a single builder passed to
//! [`crate::database::Database::open`].

use crate::storage::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::storage::buffer_pool::{DEFAULT_POOL_SIZE, MIN_POOL_SIZE};

/// Where entity and index data actually lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Pages live in a file on disk, backed by the pager/buffer-pool/WAL stack.
    Paged,
    /// Everything lives in process memory; useful for tests and short-lived
    /// embeddings. WAL and crash recovery are no-ops under this backend.
    Memory,
}

/// How a freshly-opened database handles a WAL left behind by a prior,
/// non-clean shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Recovery never runs; a dirty-shutdown WAL is left untouched. Mostly
    /// useful for tests that want to inspect the WAL after a simulated crash.
    Disabled,
    /// Recovery runs on open.
    Enabled {
        /// Delete the WAL file once redo has finished replaying it.
        delete_wal_after_recovery: bool,
        /// Surface a `RecoveryFailure` instead of opening in a possibly
        /// inconsistent state when a WAL record fails to validate.
        throw_on_recovery_error: bool,
    },
}

impl Default for RecoveryMode {
    fn default() -> Self {
        RecoveryMode::Enabled {
            delete_wal_after_recovery: true,
            throw_on_recovery_error: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub storage_backend: StorageBackend,
    pub page_size: u32,
    pub buffer_pool_size: usize,
    pub enable_transactions: bool,
    pub verify_checksums: bool,
    pub max_entity_size: usize,
    pub enable_debug_logging: bool,
    pub auto_flush_on_close: bool,
    pub wal_dir: Option<String>,
    pub recovery_mode: RecoveryMode,
    /// Reserved slot for an at-rest encryption key. No cipher is wired up
    /// yet — [`crate::storage::page::FLAG_ENCRYPTED`] exists as a hook on the
    /// page format so one can be added later without a format migration.
    pub encryption_key: Option<Vec<u8>>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            storage_backend: StorageBackend::Paged,
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pool_size: DEFAULT_POOL_SIZE,
            enable_transactions: true,
            verify_checksums: true,
            max_entity_size: 1 << 20,
            enable_debug_logging: false,
            auto_flush_on_close: true,
            wal_dir: None,
            recovery_mode: RecoveryMode::default(),
            encryption_key: None,
        }
    }
}

impl DbConfig {
    pub fn in_memory() -> Self {
        Self {
            storage_backend: StorageBackend::Memory,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
            || !self.page_size.is_power_of_two()
        {
            return Err(format!(
                "page_size must be a power of two in [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}], got {}",
                self.page_size
            ));
        }
        if self.buffer_pool_size < MIN_POOL_SIZE {
            return Err(format!(
                "buffer_pool_size must be >= {MIN_POOL_SIZE}, got {}",
                self.buffer_pool_size
            ));
        }
        Ok(())
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = size;
        self
    }

    pub fn recovery_mode(mut self, mode: RecoveryMode) -> Self {
        self.recovery_mode = mode;
        self
    }
}
