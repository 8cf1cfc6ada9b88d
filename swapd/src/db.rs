//! Keyed-record persistence. The daemon stores swaps, offers and key files
//! through the `RecordDb` interface; the bundled implementation keeps one
//! JSON file per key with atomic replacement.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, SwapError};
use crate::state::{Swap, SwapState};

pub trait RecordDb: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Keys under a prefix, e.g. `swap/`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub struct JsonFileDb {
    base_dir: PathBuf,
}

impl JsonFileDb {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)
            .map_err(|err| SwapError::Database(format!("create {base_dir:?}: {err}")))?;
        Ok(Self { base_dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| {
            part.is_empty() || !part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }) {
            return Err(SwapError::Database(format!("invalid record key {key:?}")));
        }
        Ok(self.base_dir.join(format!("{key}.json")))
    }
}

impl RecordDb for JsonFileDb {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| SwapError::Database(format!("create {parent:?}: {err}")))?;
        }
        // Write-then-rename keeps each put atomic for readers.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).map_err(|err| SwapError::Database(format!("write {tmp:?}: {err}")))?;
        fs::rename(&tmp, &path)
            .map_err(|err| SwapError::Database(format!("rename {path:?}: {err}")))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path)
            .map(Some)
            .map_err(|err| SwapError::Database(format!("read {path:?}: {err}")))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|err| SwapError::Database(format!("remove {path:?}: {err}")))?;
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.base_dir.join(prefix.trim_end_matches('/'));
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        let entries =
            fs::read_dir(&dir).map_err(|err| SwapError::Database(format!("list {dir:?}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| SwapError::Database(err.to_string()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                keys.push(format!("{}/{stem}", prefix.trim_end_matches('/')));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Typed access over the record store.
#[derive(Clone)]
pub struct SwapStore {
    db: Arc<dyn RecordDb>,
}

impl SwapStore {
    pub fn new(db: Arc<dyn RecordDb>) -> Self {
        Self { db }
    }

    pub fn save_swap(&self, swap: &Swap) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(swap).map_err(|err| SwapError::Database(err.to_string()))?;
        self.db.put(&format!("swap/{}", swap.offer_id), &bytes)
    }

    pub fn load_swap(&self, offer_id: &str) -> Result<Option<Swap>> {
        let Some(bytes) = self.db.get(&format!("swap/{offer_id}"))? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| SwapError::Database(err.to_string()))
    }

    /// Non-terminal swaps found at startup, for resume.
    pub fn active_swaps(&self) -> Result<Vec<Swap>> {
        let mut active = Vec::new();
        for key in self.db.list("swap/")? {
            let Some(bytes) = self.db.get(&key)? else {
                continue;
            };
            let swap: Swap = serde_json::from_slice(&bytes)
                .map_err(|err| SwapError::Database(err.to_string()))?;
            if !swap.state.is_terminal() {
                active.push(swap);
            }
        }
        Ok(active)
    }

    pub fn save_offer(&self, offer_id: &str, bytes: &[u8]) -> Result<()> {
        self.db.put(&format!("offers/{offer_id}"), bytes)
    }

    pub fn load_offer(&self, offer_id: &str) -> Result<Option<Vec<u8>>> {
        self.db.get(&format!("offers/{offer_id}"))
    }

    pub fn delete_offer(&self, offer_id: &str) -> Result<()> {
        self.db.delete(&format!("offers/{offer_id}"))
    }

    pub fn load_key(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.db.get(&format!("keys/{name}"))
    }

    pub fn save_key(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.db.put(&format!("keys/{name}"), bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Asset, ExchangeRate, SwapRole};

    fn sample_swap(offer_id: &str, state: SwapState) -> Swap {
        let mut swap = Swap::new(
            offer_id.into(),
            SwapRole::XmrTaker,
            "peer".into(),
            Asset::Eth,
            10,
            100,
            ExchangeRate { num: 10, den: 1 },
            false,
        );
        swap.state = state;
        swap
    }

    #[test]
    fn swap_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SwapStore::new(Arc::new(JsonFileDb::new(dir.path()).unwrap()));
        let swap = sample_swap("aabb", SwapState::Created);
        store.save_swap(&swap).unwrap();
        let loaded = store.load_swap("aabb").unwrap().unwrap();
        assert_eq!(loaded.offer_id, "aabb");
        assert_eq!(loaded.state, SwapState::Created);
        assert!(store.load_swap("missing").unwrap().is_none());
    }

    #[test]
    fn active_swaps_skip_terminal_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = SwapStore::new(Arc::new(JsonFileDb::new(dir.path()).unwrap()));
        store.save_swap(&sample_swap("aa", SwapState::EthLocked)).unwrap();
        store.save_swap(&sample_swap("bb", SwapState::Claimed)).unwrap();
        store.save_swap(&sample_swap("cc", SwapState::Aborted)).unwrap();
        let active = store.active_swaps().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].offer_id, "aa");
    }

    #[test]
    fn rejects_path_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let db = JsonFileDb::new(dir.path()).unwrap();
        assert!(db.put("../escape", b"x").is_err());
        assert!(db.put("", b"x").is_err());
        assert!(db.put("swap/..", b"x").is_err());
    }

    #[test]
    fn keys_are_stored_and_listed() {
        let dir = tempfile::tempdir().unwrap();
        let db = JsonFileDb::new(dir.path()).unwrap();
        db.put("offers/one", b"1").unwrap();
        db.put("offers/two", b"2").unwrap();
        assert_eq!(db.list("offers/").unwrap(), vec!["offers/one", "offers/two"]);
        db.delete("offers/one").unwrap();
        assert_eq!(db.list("offers/").unwrap(), vec!["offers/two"]);
        assert!(db.get("offers/one").unwrap().is_none());
    }
}
