use std::sync::Arc;

use crate::error::DbResult;
use crate::keys;
use crate::store::{Batch, StoreAdapter};

use super::{stage_meta, track_key_count, Kind};

/// Plain string value. The metadata key carries only the kind tag; the value
/// itself lives at `_[key]` and both are written or removed together.
pub(crate) struct StringObject {
    store: Arc<dyn StoreAdapter>,
    key: Vec<u8>,
    present: bool,
}

impl StringObject {
    pub(crate) fn new(store: Arc<dyn StoreAdapter>, key: Vec<u8>, present: bool) -> Self {
        Self {
            store,
            key,
            present,
        }
    }

    pub(crate) fn len(&self) -> i64 {
        i64::from(self.present)
    }

    pub(crate) fn get(&self) -> DbResult<Option<Vec<u8>>> {
        if !self.present {
            return Ok(None);
        }
        self.store.get(&keys::string_key(&self.key))
    }

    pub(crate) fn set(&mut self, value: &[u8]) -> DbResult<()> {
        let mut batch = Batch::default();
        batch.put(keys::meta_key(&self.key), super::encode_meta(Kind::String, 1));
        batch.put(keys::string_key(&self.key), value.to_vec());
        self.store.write_batch(batch)?;
        track_key_count(Kind::String, i64::from(self.present), 1);
        self.present = true;
        Ok(())
    }

    pub(crate) fn remove(&mut self) -> DbResult<bool> {
        if !self.present {
            return Ok(false);
        }
        let mut batch = Batch::default();
        stage_meta(&mut batch, &self.key, Kind::String, 0);
        batch.delete(keys::string_key(&self.key));
        self.store.write_batch(batch)?;
        track_key_count(Kind::String, 1, 0);
        self.present = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;

    fn string(store: &Arc<MemStore>, key: &[u8]) -> StringObject {
        StringObject::new(
            Arc::clone(store) as Arc<dyn StoreAdapter>,
            key.to_vec(),
            false,
        )
    }

    #[test]
    fn set_get_roundtrip() {
        let store = MemStore::new();
        let mut s = string(&store, b"greeting");
        s.set(b"hello").unwrap();
        assert_eq!(s.get().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn set_writes_meta_and_value_atomically() {
        let store = MemStore::new();
        let mut s = string(&store, b"k");
        s.set(b"v").unwrap();
        assert_eq!(
            store.get(&keys::meta_key(b"k")).unwrap(),
            Some(b"k".to_vec())
        );
        assert_eq!(store.key_count(), 2);
    }

    #[test]
    fn remove_clears_every_physical_key() {
        let store = MemStore::new();
        let mut s = string(&store, b"k");
        s.set(b"v").unwrap();
        assert!(s.remove().unwrap());
        assert_eq!(store.key_count(), 0);
        assert!(!s.remove().unwrap());
    }

    #[test]
    fn failed_set_leaves_absence_intact() {
        let store = MemStore::new();
        let mut s = string(&store, b"k");
        store.poison_writes();
        assert!(s.set(b"v").is_err());
        store.heal_writes();
        assert_eq!(s.get().unwrap(), None);
        assert_eq!(s.len(), 0);
    }
}
