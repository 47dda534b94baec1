//! Durable key-value persistence.
//!
//! The feed manager only needs `get`/`put` of JSON documents under a handful
//! of well-known keys. [`Storage`] backs that with redb; [`MemoryStore`] is an
//! in-process stand-in with failure injection for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{MeshError, MeshResult};

/// JSON document store used for best-effort persistence.
///
/// Both operations are individually fallible; callers log failures and keep
/// running on in-memory state.
pub trait KvStore: Send + Sync {
    /// Read the document under `key`, `None` if it was never written
    fn get(&self, key: &str) -> MeshResult<Option<serde_json::Value>>;

    /// Replace the document under `key`
    fn put(&self, key: &str, value: &serde_json::Value) -> MeshResult<()>;
}

// Table definitions
const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const ENDPOINT_SECRET_KEY_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("endpoint_secret_key");

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    const ENDPOINT_SECRET_KEY: &'static str = "endpoint_secret_key";

    /// Create a new storage instance at the given path.
    ///
    /// Creates the parent directory and all tables if they don't exist.
    pub fn new(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(KV_TABLE)?;
            let _ = write_txn.open_table(ENDPOINT_SECRET_KEY_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Save the endpoint's secret key.
    ///
    /// There is only one endpoint per node, stored with a fixed key, so the
    /// node id is stable across restarts.
    pub fn save_endpoint_secret_key(&self, secret_key: &[u8; 32]) -> MeshResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENDPOINT_SECRET_KEY_TABLE)?;
            table.insert(Self::ENDPOINT_SECRET_KEY, secret_key.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the endpoint's secret key, `None` if none was created yet.
    pub fn load_endpoint_secret_key(&self) -> MeshResult<Option<[u8; 32]>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ENDPOINT_SECRET_KEY_TABLE)?;

        match table.get(Self::ENDPOINT_SECRET_KEY)? {
            Some(v) => {
                let bytes = v.value();
                if bytes.len() != 32 {
                    return Err(MeshError::Storage(format!(
                        "endpoint secret key has {} bytes",
                        bytes.len()
                    )));
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                Ok(Some(arr))
            }
            None => Ok(None),
        }
    }
}

impl KvStore for Storage {
    fn get(&self, key: &str) -> MeshResult<Option<serde_json::Value>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;

        match table.get(key)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &serde_json::Value) -> MeshResult<()> {
        let data = serde_json::to_vec(value)?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            table.insert(key, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// In-memory [`KvStore`].
///
/// `fail_reads` / `fail_writes` make the respective operation error, to
/// exercise the degraded paths.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, serde_json::Value>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Keys of every successful put, in order
    pub fn write_log(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    /// Number of successful puts of `key`
    pub fn write_count(&self, key: &str) -> usize {
        self.writes.lock().iter().filter(|k| k.as_str() == key).count()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> MeshResult<Option<serde_json::Value>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(MeshError::Storage(format!("read of {} failed", key)));
        }
        Ok(self.values.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &serde_json::Value) -> MeshResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MeshError::Storage(format!("write of {} failed", key)));
        }
        self.values.lock().insert(key.to_string(), value.clone());
        self.writes.lock().push(key.to_string());
        Ok(())
    }
}
