//! Durable pod→resources mapping (§4.2), backed by `sled` as the embedded ordered
//! key-value store. An in-memory shadow is loaded once at open time; after that the
//! shadow is authoritative for reads and every mutation writes through to disk before
//! it is applied in memory, so a crash between the two never loses an acknowledged
//! write (the disk copy always leads).

use crate::error::{PoolError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::RwLock;

pub struct Ledger<T> {
    tree: sled::Tree,
    shadow: RwLock<HashMap<String, T>>,
    _marker: PhantomData<T>,
}

impl<T> Ledger<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open (creating if absent) the named tree within `db` and load its current
    /// contents into the in-memory shadow.
    pub fn open(db: &sled::Db, tree_name: &str) -> Result<Self> {
        let tree = db
            .open_tree(tree_name)
            .map_err(|e| PoolError::Ledger(e.into()))?;

        let mut shadow = HashMap::new();
        for entry in tree.iter() {
            let (key, value) = entry.map_err(|e| PoolError::Ledger(e.into()))?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let value: T =
                serde_json::from_slice(&value).map_err(|e| PoolError::Ledger(e.into()))?;
            tracing::debug!(key = %key, "loaded ledger entry from disk");
            shadow.insert(key, value);
        }

        Ok(Self {
            tree,
            shadow: RwLock::new(shadow),
            _marker: PhantomData,
        })
    }

    pub async fn put(&self, key: &str, value: T) -> Result<()> {
        let data = serde_json::to_vec(&value).map_err(|e| PoolError::Ledger(e.into()))?;
        self.tree
            .insert(key.as_bytes(), data)
            .map_err(|e| PoolError::Ledger(e.into()))?;
        self.tree.flush_async().await.map_err(|e| PoolError::Ledger(e.into()))?;

        self.shadow
            .write()
            .expect("ledger shadow lock poisoned")
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<T> {
        self.shadow
            .read()
            .expect("ledger shadow lock poisoned")
            .get(key)
            .cloned()
            .ok_or(PoolError::NotFound)
    }

    pub fn list(&self) -> Vec<T> {
        self.shadow
            .read()
            .expect("ledger shadow lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.tree
            .remove(key.as_bytes())
            .map_err(|e| PoolError::Ledger(e.into()))?;
        self.tree.flush_async().await.map_err(|e| PoolError::Ledger(e.into()))?;
        self.shadow
            .write()
            .expect("ledger shadow lock poisoned")
            .remove(key);
        Ok(())
    }
}
