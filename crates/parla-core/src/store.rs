//! Media Store: durable key-indexed collections over Sled with a DashMap read cache.

use crate::error::{AssistantError, AssistantResult};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// One Sled tree per collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Messages,
    UserMemory,
    SharedKnowledge,
}

impl Collection {
    pub fn tree_name(&self) -> &'static str {
        match self {
            Collection::Messages => "messages",
            Collection::UserMemory => "user_memory",
            Collection::SharedKnowledge => "shared_knowledge",
        }
    }
}

/// Records that know their own store key.
pub trait Keyed {
    fn key(&self) -> String;
}

impl Keyed for crate::message::Message {
    fn key(&self) -> String {
        self.store_key()
    }
}

#[derive(Clone)]
pub struct MediaStore {
    db: Db,
    cache: Arc<DashMap<(Collection, String), Vec<u8>>>,
}

impl MediaStore {
    pub fn open_path<P: AsRef<Path>>(path: P) -> AssistantResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            cache: Arc::new(DashMap::new()),
        })
    }

    /// Throwaway store, removed when dropped.
    pub fn temporary() -> AssistantResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            cache: Arc::new(DashMap::new()),
        })
    }

    fn tree(&self, collection: Collection) -> AssistantResult<sled::Tree> {
        Ok(self.db.open_tree(collection.tree_name())?)
    }

    /// All records in key order.
    pub fn get_all<T: DeserializeOwned>(&self, collection: Collection) -> AssistantResult<Vec<T>> {
        let tree = self.tree(collection)?;
        let mut out = Vec::new();
        for item in tree.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Insert a new record. Fails with `Duplicate` when the key is taken.
    pub fn add<T: Serialize + Keyed>(&self, collection: Collection, item: &T) -> AssistantResult<()> {
        let key = item.key();
        let bytes = serde_json::to_vec(item)?;
        let tree = self.tree(collection)?;
        match tree.compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(bytes.as_slice()))? {
            Ok(()) => {
                self.cache.insert((collection, key), bytes);
                Ok(())
            }
            Err(_) => Err(AssistantError::Duplicate(key)),
        }
    }

    pub fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        key: &str,
    ) -> AssistantResult<Option<T>> {
        let ck = (collection, key.to_string());
        if let Some(v) = self.cache.get(&ck) {
            return Ok(Some(serde_json::from_slice(v.value())?));
        }
        let tree = self.tree(collection)?;
        match tree.get(key.as_bytes())? {
            Some(iv) => {
                let bytes = iv.to_vec();
                let value = serde_json::from_slice(&bytes)?;
                self.cache.insert(ck, bytes);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Upsert.
    pub fn put<T: Serialize + Keyed>(&self, collection: Collection, item: &T) -> AssistantResult<()> {
        let key = item.key();
        let bytes = serde_json::to_vec(item)?;
        self.tree(collection)?.insert(key.as_bytes(), bytes.as_slice())?;
        self.cache.insert((collection, key), bytes);
        Ok(())
    }

    pub fn delete(&self, collection: Collection, key: &str) -> AssistantResult<()> {
        self.tree(collection)?.remove(key.as_bytes())?;
        self.cache.remove(&(collection, key.to_string()));
        Ok(())
    }

    pub fn clear(&self, collection: Collection) -> AssistantResult<()> {
        self.tree(collection)?.clear()?;
        self.cache.retain(|(c, _), _| *c != collection);
        debug!(target: "parla::store", collection = collection.tree_name(), "collection cleared");
        Ok(())
    }

    pub fn flush(&self) -> AssistantResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl Keyed for Note {
        fn key(&self) -> String {
            self.id.clone()
        }
    }

    fn note(id: &str, body: &str) -> Note {
        Note {
            id: id.into(),
            body: body.into(),
        }
    }

    #[test]
    fn add_get_put_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open_path(dir.path()).unwrap();
        store.add(Collection::Messages, &note("a", "one")).unwrap();
        assert!(matches!(
            store.add(Collection::Messages, &note("a", "again")),
            Err(AssistantError::Duplicate(_))
        ));
        store.put(Collection::Messages, &note("a", "two")).unwrap();
        let got: Option<Note> = store.get(Collection::Messages, "a").unwrap();
        assert_eq!(got.unwrap().body, "two");
        store.delete(Collection::Messages, "a").unwrap();
        let got: Option<Note> = store.get(Collection::Messages, "a").unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn get_all_is_key_ordered_and_clear_is_per_collection() {
        let store = MediaStore::temporary().unwrap();
        store.put(Collection::Messages, &note("b", "2")).unwrap();
        store.put(Collection::Messages, &note("a", "1")).unwrap();
        store.put(Collection::UserMemory, &note("u", "x")).unwrap();
        let all: Vec<Note> = store.get_all(Collection::Messages).unwrap();
        assert_eq!(all.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        store.clear(Collection::Messages).unwrap();
        assert!(store.get_all::<Note>(Collection::Messages).unwrap().is_empty());
        let kept: Option<Note> = store.get(Collection::UserMemory, "u").unwrap();
        assert!(kept.is_some());
    }

    #[test]
    fn reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MediaStore::open_path(dir.path()).unwrap();
            store.put(Collection::SharedKnowledge, &note("shared", "f")).unwrap();
            store.flush().unwrap();
        }
        let store = MediaStore::open_path(dir.path()).unwrap();
        let got: Option<Note> = store.get(Collection::SharedKnowledge, "shared").unwrap();
        assert_eq!(got.unwrap().body, "f");
    }
}
