//! Durable key-value storage and metadata bootstrap.

use crate::cli::NodeConfig;
use eyre::{eyre, Result, WrapErr};
use parking_lot::RwLock;
use reth_db::{
    mdbx::{init_db_for, DatabaseArguments, DatabaseEnv},
    ClientVersion, Database,
};
use reth_db_api::{
    cursor::DbCursorRO,
    transaction::{DbTx, DbTxMut},
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

mod tables {
    use reth_db_api::{table::TableInfo, tables, TableSet, TableType, TableViewer};
    use std::fmt;

    tables! {
        /// Schema and network metadata.
        table Meta {
            type Key = String;
            type Value = Vec<u8>;
        }

        /// Server pool entries, indexer checkpoints and bloom vectors.
        table Records {
            type Key = String;
            type Value = Vec<u8>;
        }
    }
}

const SCHEMA_VERSION: u64 = 1;
const META_SCHEMA_VERSION_KEY: &str = "schema_version";
const META_NETWORK_ID_KEY: &str = "network_id";
const DB_DIR_NAME: &str = "db";

/// Minimal durable key-value contract used by the pool and the indexers.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Writes every pair atomically.
    fn put_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Returns every `(key, value)` pair whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
    fn flush(&self) -> Result<()>;
}

/// Volatile store, used by tests and the simulator.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn put_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        self.map.write().extend(entries);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .map
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// MDBX environment: string-keyed records plus a metadata table.
#[derive(Debug)]
pub struct MdbxStore {
    db: DatabaseEnv,
}

impl MdbxStore {
    pub fn open(path: &Path) -> Result<Self> {
        let args = DatabaseArguments::new(ClientVersion::default());
        let db = init_db_for::<_, tables::Tables>(path, args)
            .wrap_err("failed to open MDBX environment")?;
        Ok(Self { db })
    }

    fn meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let tx = self.db.tx()?;
        let value = tx.get::<tables::Meta>(key.to_string())?;
        tx.commit()?;
        Ok(value)
    }

    fn put_meta(&self, entries: &[(&str, Vec<u8>)]) -> Result<()> {
        let tx = self.db.tx_mut()?;
        for (key, value) in entries {
            tx.put::<tables::Meta>(key.to_string(), value.clone())?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl KeyValueStore for MdbxStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let tx = self.db.tx()?;
        let value = tx.get::<tables::Records>(key.to_string())?;
        tx.commit()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let tx = self.db.tx_mut()?;
        tx.put::<tables::Records>(key.to_string(), value.to_vec())?;
        tx.commit()?;
        Ok(())
    }

    fn put_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        let count = entries.len();
        let tx = self.db.tx_mut()?;
        for (key, value) in entries {
            tx.put::<tables::Records>(key, value)?;
        }
        tx.commit()?;
        debug!(count, "record batch committed");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let tx = self.db.tx_mut()?;
        tx.delete::<tables::Records>(key.to_string(), None)?;
        tx.commit()?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let tx = self.db.tx()?;
        let mut rows = Vec::new();
        {
            let mut cursor = tx.cursor_read::<tables::Records>()?;
            for row in cursor.walk(Some(prefix.to_string()))? {
                let (key, value) = row?;
                if !key.starts_with(prefix) {
                    break;
                }
                rows.push((key, value));
            }
        }
        tx.commit()?;
        Ok(rows)
    }

    // Every write commits its own transaction.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Node storage handle: a bootstrapped key-value store under the data dir.
#[derive(Clone)]
pub struct Storage {
    kv: Arc<dyn KeyValueStore>,
    path: PathBuf,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.path).finish()
    }
}

impl Storage {
    /// Open the MDBX environment and bootstrap metadata if needed.
    pub fn open(config: &NodeConfig) -> Result<Self> {
        let path = config.data_dir.join(DB_DIR_NAME);
        let store = MdbxStore::open(&path)?;
        match store.meta(META_SCHEMA_VERSION_KEY)? {
            None => {
                store.put_meta(&[
                    (META_SCHEMA_VERSION_KEY, encode_json(&SCHEMA_VERSION)?),
                    (META_NETWORK_ID_KEY, encode_json(&config.network_id)?),
                ])?;
                info!(db_path = %path.display(), network_id = config.network_id, "initialized storage metadata");
            }
            Some(bytes) => {
                let stored = store.meta(META_NETWORK_ID_KEY)?;
                check_meta(&bytes, stored.as_deref(), config.network_id)?;
            }
        }
        Ok(Self {
            kv: Arc::new(store),
            path,
        })
    }

    pub fn kv(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.kv)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> Result<()> {
        self.kv.flush()
    }
}

fn check_meta(schema: &[u8], network: Option<&[u8]>, network_id: u64) -> Result<()> {
    let schema_version: u64 = decode_json(schema)?;
    if schema_version != SCHEMA_VERSION {
        return Err(eyre!(
            "unsupported schema version {schema_version} (expected {SCHEMA_VERSION})"
        ));
    }
    let stored: u64 = decode_json(network.ok_or_else(|| eyre!("missing network_id metadata"))?)?;
    if stored != network_id {
        return Err(eyre!(
            "network id mismatch: storage has {stored}, config has {network_id}"
        ));
    }
    Ok(())
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).wrap_err("failed to encode json")
}

pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).wrap_err("failed to decode json")
}
