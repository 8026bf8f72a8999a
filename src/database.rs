//! The top-level embeddable database: owns the file-backed pager/buffer-pool/
//! WAL stack, the on-disk collection directory, advisory file locking, and
//! the lifecycle (`open` → crash recovery → ... → `close`) that wires them
//! together.
//!
//! Generalizes `cryo`'s `Database` (a single open file plus a `Logger`) into
//! a directory of named, independently-typed collections, laid out on disk
//! as:
//!
//! ```text
//! <path>/db                           data file (pager)
//! <path>/wal/<db-file-name>.wal        write-ahead log
//! <path>/indexes/<collection>_<field>.idx   persisted indexes
//! <path>/backups/                     snapshots (see crate::snapshot)
//! ```
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{info, warn};

use crate::collection::{self, Collection};
use crate::config::{DbConfig, RecoveryMode, StorageBackend};
use crate::error::{DocDbError, Result};
use crate::id::{CounterIdGenerator, IdGenerator};
use crate::index::IndexKind;
use crate::query::Predicate;
use crate::storage::buffer_pool::BufferPool;
use crate::storage::pager::Pager;
use crate::storage::wal::{recover, RecoveryError, RedoHandler, WalWriter};
use crate::value::{Entity, Value};

const LOCK_FILE_NAME: &str = ".lock";
const INDEXES_DIR_NAME: &str = "indexes";
const BACKUPS_DIR_NAME: &str = "backups";
const DATA_FILE_NAME: &str = "db";

/// What a [`Database`] remembers about one collection, persisted as the
/// schema-root page chain so the set of collections and their head pages
/// survive a restart.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
struct CollectionMeta {
    type_tag: String,
    directory_head_page: Option<u32>,
}

/// The database-wide directory of collections, rooted at
/// [`crate::storage::pager::Pager::schema_root`] and persisted through the
/// same page-chain mechanism [`crate::collection::Collection`] uses for its
/// own per-entity directory.
#[derive(Debug, Clone, Default, bincode::Encode, bincode::Decode)]
struct DatabaseDirectory {
    collections: HashMap<String, CollectionMeta>,
}

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatabaseState {
    Open,
    Closed,
}

/// An embeddable, single-process document database.
///
/// Single-threaded cooperative concurrency: `Database` holds no internal
/// locking beyond the advisory cross-process file lock acquired in `open`.
/// Callers, not this type, serialize concurrent access within one process.
pub struct Database {
    root: PathBuf,
    config: DbConfig,
    pool: Option<Rc<RefCell<BufferPool>>>,
    wal: Option<WalWriter>,
    wal_path: Option<PathBuf>,
    id_gen: Box<dyn IdGenerator>,
    directory: DatabaseDirectory,
    collections: HashMap<String, Collection>,
    lock_file: Option<File>,
    state: DatabaseState,
}

impl Database {
    /// Opens (creating if necessary) the database rooted at `path`, a
    /// directory. Runs WAL recovery first if the prior session exited
    /// without a clean shutdown and `config.recovery_mode` allows it.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self> {
        config
            .validate()
            .map_err(DocDbError::InvalidConfig)?;
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let lock_file = if config.storage_backend == StorageBackend::Paged {
            Some(acquire_lock(&root)?)
        } else {
            None
        };

        let (pool, wal, wal_path, directory) = match config.storage_backend {
            StorageBackend::Memory => (None, None, None, DatabaseDirectory::default()),
            StorageBackend::Paged => {
                let data_path = root.join(DATA_FILE_NAME);
                let pager = Pager::open_with_checksum_policy(
                    &data_path,
                    Some(config.page_size),
                    config.verify_checksums,
                )?;
                let recovered = pager.recovered_from_dirty_shutdown();
                let mut pool = BufferPool::new(pager, config.buffer_pool_size);
                let mut directory = load_directory(&mut pool)?;

                let wal_dir = config
                    .wal_dir
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| root.join("wal"));
                let wal_path = wal_dir.join(format!("{DATA_FILE_NAME}.wal"));

                if recovered {
                    if let RecoveryMode::Enabled {
                        delete_wal_after_recovery,
                        throw_on_recovery_error,
                    } = config.recovery_mode
                    {
                        match run_recovery(&wal_path, &mut pool, &mut directory) {
                            Ok(result) => {
                                info!(
                                    "recovered {} record(s) across {} committed transaction(s)",
                                    result.records_redone, result.transactions_committed
                                );
                                save_directory(&mut pool, &mut directory)?;
                                pool.flush_all()?;
                                if delete_wal_after_recovery && wal_path.exists() {
                                    fs::remove_file(&wal_path)?;
                                }
                            }
                            Err(err) if throw_on_recovery_error => {
                                return Err(DocDbError::Recovery(err));
                            }
                            Err(err) => {
                                warn!("ignoring recovery failure per configuration: {err}");
                            }
                        }
                    } else {
                        warn!("database was left in a dirty state but recovery is disabled");
                    }
                }

                let pool = Rc::new(RefCell::new(pool));
                let wal = if config.enable_transactions {
                    Some(WalWriter::open(&wal_path)?)
                } else {
                    None
                };
                (Some(pool), wal, Some(wal_path), directory)
            }
        };

        Ok(Self {
            root,
            config,
            pool,
            wal,
            wal_path,
            id_gen: Box::new(CounterIdGenerator::new()),
            directory,
            collections: HashMap::new(),
            lock_file,
            state: DatabaseState::Open,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(".", DbConfig::in_memory())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != DatabaseState::Open {
            return Err(DocDbError::DatabaseDisposed);
        }
        Ok(())
    }

    fn indexes_dir(&self) -> PathBuf {
        self.root.join(INDEXES_DIR_NAME)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR_NAME)
    }

    /// Opens or creates a named collection bound to `type_tag`. A collection
    /// that already exists under a different tag is a [`DocDbError::CollectionTypeMismatch`];
    /// a collection first created by WAL redo (which has no type information
    /// to go on) silently adopts the first tag it's opened with.
    pub fn collection(&mut self, name: &str, type_tag: &str) -> Result<&mut Collection> {
        self.ensure_open()?;
        if !self.collections.contains_key(name) {
            self.open_collection(name, type_tag)?;
        }
        Ok(self.collections.get_mut(name).expect("just opened"))
    }

    fn open_collection(&mut self, name: &str, type_tag: &str) -> Result<()> {
        let meta = self.directory.collections.get(name).cloned();
        if let Some(meta) = &meta {
            if !meta.type_tag.is_empty() && meta.type_tag != type_tag {
                return Err(DocDbError::CollectionTypeMismatch {
                    name: name.to_string(),
                    expected: type_tag.to_string(),
                    actual: meta.type_tag.clone(),
                });
            }
        }

        let mut collection = match &self.pool {
            Some(pool) => Collection::new_paged(
                name,
                type_tag,
                Rc::clone(pool),
                meta.as_ref().and_then(|m| m.directory_head_page),
            )?,
            None => Collection::new_memory(name, type_tag),
        };

        if self.pool.is_some() {
            collection.indexes_mut().load(self.indexes_dir(), name)?;
        }

        self.directory.collections.insert(
            name.to_string(),
            CollectionMeta {
                type_tag: type_tag.to_string(),
                directory_head_page: meta.and_then(|m| m.directory_head_page),
            },
        );
        self.collections.insert(name.to_string(), collection);
        Ok(())
    }

    fn begin_txn(&mut self) -> Result<Option<u64>> {
        match self.wal.as_mut() {
            Some(wal) => Ok(Some(wal.begin_transaction()?)),
            None => Ok(None),
        }
    }

    fn commit_txn(&mut self, txn_id: Option<u64>) -> Result<()> {
        if let (Some(wal), Some(txn_id)) = (self.wal.as_mut(), txn_id) {
            wal.commit_transaction(txn_id)?;
        }
        Ok(())
    }

    pub fn insert(
        &mut self,
        collection: &str,
        type_tag: &str,
        fields: BTreeMap<String, Value>,
    ) -> Result<String> {
        self.ensure_open()?;
        self.open_collection_if_missing(collection, type_tag)?;
        let txn_id = self.begin_txn()?;
        let coll = self.collections.get_mut(collection).expect("ensured above");
        let id = coll.insert(fields, self.id_gen.as_mut(), self.wal.as_mut(), txn_id.unwrap_or(0))?;
        self.commit_txn(txn_id)?;
        Ok(id)
    }

    pub fn insert_many(
        &mut self,
        collection: &str,
        type_tag: &str,
        many: Vec<BTreeMap<String, Value>>,
    ) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.open_collection_if_missing(collection, type_tag)?;
        let txn_id = self.begin_txn()?;
        let coll = self.collections.get_mut(collection).expect("ensured above");
        let ids = coll.insert_many(many, self.id_gen.as_mut(), self.wal.as_mut(), txn_id.unwrap_or(0))?;
        self.commit_txn(txn_id)?;
        Ok(ids)
    }

    pub fn update(&mut self, collection: &str, type_tag: &str, entity: Entity) -> Result<()> {
        self.ensure_open()?;
        self.open_collection_if_missing(collection, type_tag)?;
        let txn_id = self.begin_txn()?;
        let coll = self.collections.get_mut(collection).expect("ensured above");
        coll.update(entity, self.wal.as_mut(), txn_id.unwrap_or(0))?;
        self.commit_txn(txn_id)?;
        Ok(())
    }

    pub fn delete(&mut self, collection: &str, type_tag: &str, id: &str) -> Result<bool> {
        self.ensure_open()?;
        self.open_collection_if_missing(collection, type_tag)?;
        let txn_id = self.begin_txn()?;
        let coll = self.collections.get_mut(collection).expect("ensured above");
        let deleted = coll.delete(id, self.wal.as_mut(), txn_id.unwrap_or(0))?;
        self.commit_txn(txn_id)?;
        Ok(deleted)
    }

    pub fn delete_all(&mut self, collection: &str, type_tag: &str) -> Result<usize> {
        self.ensure_open()?;
        self.open_collection_if_missing(collection, type_tag)?;
        let txn_id = self.begin_txn()?;
        let coll = self.collections.get_mut(collection).expect("ensured above");
        let count = coll.delete_all(self.wal.as_mut(), txn_id.unwrap_or(0))?;
        self.commit_txn(txn_id)?;
        Ok(count)
    }

    fn open_collection_if_missing(&mut self, name: &str, type_tag: &str) -> Result<()> {
        if !self.collections.contains_key(name) {
            self.open_collection(name, type_tag)?;
        }
        Ok(())
    }

    /// Runs a maintenance pass over every page in the data file, verifying
    /// its checksum regardless of `config.verify_checksums`. Returns the
    /// number of pages checked.
    pub fn verify(&mut self) -> Result<usize> {
        self.ensure_open()?;
        let Some(pool) = self.pool.as_ref() else {
            return Ok(0);
        };
        let mut pool = pool.borrow_mut();
        let count = pool.pager().page_count();
        for id in 0..count {
            let page = pool.fetch_page(id)?;
            page.verify_checksum()?;
            pool.unpin_page(id)?;
        }
        Ok(count as usize)
    }

    /// Flushes every open collection's directory, persists the database
    /// directory and indexes, flushes the buffer pool, and clears the
    /// dirty-shutdown bit. Idempotent; safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.state != DatabaseState::Open {
            return Ok(());
        }
        for (name, collection) in self.collections.iter_mut() {
            let head = collection.flush_directory()?;
            if let Some(meta) = self.directory.collections.get_mut(name) {
                meta.directory_head_page = head;
            }
            if self.pool.is_some() {
                collection.indexes().save(self.root.join(INDEXES_DIR_NAME), name);
            }
            collection.close();
        }

        if let Some(pool) = &self.pool {
            let mut pool = pool.borrow_mut();
            save_directory(&mut pool, &mut self.directory)?;
            if self.config.auto_flush_on_close {
                pool.flush_all()?;
            }
            pool.pager_mut().mark_clean_shutdown()?;
        }

        // Everything committed through the WAL is now durable in the paged
        // store itself; a clean shutdown has no use for the log, so drop the
        // writer (flushing its buffer) and discard the file. A dirty
        // shutdown leaves it behind for the next open's recovery pass.
        self.wal.take();
        if self.config.auto_flush_on_close {
            if let Some(path) = &self.wal_path {
                if path.exists() {
                    let _ = fs::remove_file(path);
                }
            }
        }

        if let Some(lock_file) = self.lock_file.take() {
            drop(lock_file);
            let _ = fs::remove_file(self.root.join(LOCK_FILE_NAME));
        }

        self.state = DatabaseState::Closed;
        Ok(())
    }

    pub fn find(&mut self, collection: &str, type_tag: &str, predicate: &Predicate) -> Result<Vec<Entity>> {
        self.collection(collection, type_tag)?.find(predicate)
    }

    pub fn create_index(&mut self, collection: &str, type_tag: &str, field: &str, kind: IndexKind) -> Result<()> {
        self.collection(collection, type_tag)?.create_index(field, kind)
    }

    pub fn drop_index(&mut self, collection: &str, type_tag: &str, field: &str) -> Result<()> {
        self.collection(collection, type_tag)?.drop_index(field)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.state == DatabaseState::Open {
            if let Err(err) = self.close() {
                warn!("error while dropping an open database: {err}");
            }
        }
    }
}

fn acquire_lock(root: &Path) -> Result<File> {
    let path = root.join(LOCK_FILE_NAME);
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(DocDbError::DatabaseLocked(path.display().to_string()))
        }
        Err(err) => Err(DocDbError::Io(err)),
    }
}

fn load_directory(pool: &mut BufferPool) -> Result<DatabaseDirectory> {
    match pool.pager().schema_root() {
        Some(head) => {
            let bytes = collection::chain_read(pool, head)?;
            let (directory, _): (DatabaseDirectory, usize) =
                bincode::decode_from_slice(&bytes, bincode_config())
                    .map_err(|e| DocDbError::InvalidFormat(e.to_string()))?;
            Ok(directory)
        }
        None => Ok(DatabaseDirectory::default()),
    }
}

fn save_directory(pool: &mut BufferPool, directory: &mut DatabaseDirectory) -> Result<()> {
    let bytes =
        bincode::encode_to_vec(&*directory, bincode_config()).expect("directory encoding never fails");
    let existing = pool.pager().schema_root();
    let head = collection::chain_write(pool, existing, &bytes)?;
    pool.pager_mut().set_schema_root(head);
    Ok(())
}

/// Applies redone WAL records directly against each collection's page-chain
/// store, bypassing `Collection` entirely since none has been opened yet at
/// recovery time. Collections first seen here get an empty `type_tag`,
/// backfilled the first time a caller opens them through [`Database::collection`].
struct RecoveryApplier<'a> {
    pool: &'a mut BufferPool,
    directory: &'a mut DatabaseDirectory,
}

impl RedoHandler for RecoveryApplier<'_> {
    fn redo_insert(&mut self, collection: &str, entity_id: &str, after: &[u8]) -> std::result::Result<(), String> {
        self.apply_put(collection, entity_id, after).map_err(|e| e.to_string())
    }

    fn redo_update(&mut self, collection: &str, entity_id: &str, after: &[u8]) -> std::result::Result<(), String> {
        self.apply_put(collection, entity_id, after).map_err(|e| e.to_string())
    }

    fn redo_delete(&mut self, collection: &str, entity_id: &str) -> std::result::Result<(), String> {
        self.apply_delete(collection, entity_id).map_err(|e| e.to_string())
    }
}

impl RecoveryApplier<'_> {
    fn apply_put(&mut self, collection: &str, _entity_id: &str, after: &[u8]) -> Result<()> {
        let meta = self
            .directory
            .collections
            .entry(collection.to_string())
            .or_insert_with(|| CollectionMeta {
                type_tag: String::new(),
                directory_head_page: None,
            });
        meta.directory_head_page = collection::raw_put_bytes(self.pool, meta.directory_head_page, after)?;
        Ok(())
    }

    fn apply_delete(&mut self, collection: &str, entity_id: &str) -> Result<()> {
        if let Some(meta) = self.directory.collections.get_mut(collection) {
            meta.directory_head_page = collection::raw_delete(self.pool, meta.directory_head_page, entity_id)?;
        }
        Ok(())
    }
}

fn run_recovery(
    wal_path: &Path,
    pool: &mut BufferPool,
    directory: &mut DatabaseDirectory,
) -> std::result::Result<crate::storage::wal::RecoveryResult, RecoveryError> {
    let mut applier = RecoveryApplier { pool, directory };
    recover(wal_path, &mut applier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn fields(price: i64) -> BTreeMap<String, Value> {
        let mut f = BTreeMap::new();
        f.insert("price".to_string(), Value::Int(price));
        f
    }

    #[test]
    fn insert_then_find_round_trips_on_disk() {
        let temp = TempDir::new("docdb").unwrap();
        let mut db = Database::open(temp.path(), DbConfig::default()).unwrap();
        let id = db.insert("products", "product", fields(10)).unwrap();
        let found = db.find("products", "product", &Predicate::Equals("price".into(), Value::Int(10))).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
    }

    #[test]
    fn reopen_after_clean_close_preserves_data() {
        let temp = TempDir::new("docdb").unwrap();
        {
            let mut db = Database::open(temp.path(), DbConfig::default()).unwrap();
            db.insert("products", "product", fields(5)).unwrap();
            db.close().unwrap();
        }
        let mut db = Database::open(temp.path(), DbConfig::default()).unwrap();
        let found = db.find("products", "product", &Predicate::Equals("price".into(), Value::Int(5))).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let temp = TempDir::new("docdb").unwrap();
        let mut db = Database::open(temp.path(), DbConfig::default()).unwrap();
        db.insert("products", "product", fields(1)).unwrap();
        let err = db.collection("products", "widget");
        assert!(matches!(err, Err(DocDbError::CollectionTypeMismatch { .. })));
    }

    #[test]
    fn second_open_on_same_path_is_locked() {
        let temp = TempDir::new("docdb").unwrap();
        let _db = Database::open(temp.path(), DbConfig::default()).unwrap();
        let err = Database::open(temp.path(), DbConfig::default());
        assert!(matches!(err, Err(DocDbError::DatabaseLocked(_))));
    }

    #[test]
    fn in_memory_backend_round_trips_without_a_lock_file() {
        let mut db = Database::in_memory().unwrap();
        db.insert("products", "product", fields(1)).unwrap();
        assert_eq!(db.find("products", "product", &Predicate::Equals("price".into(), Value::Int(1))).unwrap().len(), 1);
    }
}
