use std::collections::HashSet;
use std::sync::Arc;

use crate::error::DbResult;
use crate::keys;
use crate::store::{scan_prefix, Batch, Direction, StoreAdapter};

use super::{stage_meta, track_key_count, Kind};

/// Hash aggregate: one physical key per field under `h[key]`, fields sorted
/// by byte order, cardinality cached and mirrored into the metadata key.
pub(crate) struct HashObject {
    store: Arc<dyn StoreAdapter>,
    key: Vec<u8>,
    len: i64,
}

impl HashObject {
    pub(crate) fn new(store: Arc<dyn StoreAdapter>, key: Vec<u8>, len: i64) -> Self {
        Self { store, key, len }
    }

    pub(crate) fn len(&self) -> i64 {
        self.len
    }

    /// Set fields, last write winning for duplicates within one call.
    /// Returns the number of fields that did not exist before.
    pub(crate) fn set(&mut self, pairs: &[(Vec<u8>, Vec<u8>)]) -> DbResult<i64> {
        let mut batch = Batch::default();
        let mut staged: HashSet<&[u8]> = HashSet::new();
        let mut added = 0i64;
        for (field, value) in pairs {
            let existed = staged.contains(field.as_slice())
                || self.store.get(&keys::hash_field_key(&self.key, field))?.is_some();
            if !existed {
                added += 1;
            }
            staged.insert(field);
            batch.put(keys::hash_field_key(&self.key, field), value.clone());
        }
        let new_len = self.len + added;
        stage_meta(&mut batch, &self.key, Kind::Hash, new_len);
        self.store.write_batch(batch)?;
        track_key_count(Kind::Hash, self.len, new_len);
        self.len = new_len;
        Ok(added)
    }

    pub(crate) fn get(&self, field: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.store.get(&keys::hash_field_key(&self.key, field))
    }

    pub(crate) fn contains(&self, field: &[u8]) -> DbResult<bool> {
        Ok(self.get(field)?.is_some())
    }

    /// All `(field, value)` pairs in field byte order.
    pub(crate) fn entries(&self) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let prefix = keys::hash_prefix(&self.key);
        let mut out = Vec::new();
        for item in scan_prefix(self.store.as_ref(), &prefix, Direction::Forward)? {
            let (key, value) = item?;
            out.push((key[prefix.len()..].to_vec(), value));
        }
        Ok(out)
    }

    pub(crate) fn remove(&mut self, fields: &[Vec<u8>]) -> DbResult<i64> {
        let mut batch = Batch::default();
        let mut removed_set: HashSet<&[u8]> = HashSet::new();
        let mut removed = 0i64;
        for field in fields {
            if removed_set.contains(field.as_slice()) {
                continue;
            }
            if self.store.get(&keys::hash_field_key(&self.key, field))?.is_none() {
                continue;
            }
            removed_set.insert(field);
            batch.delete(keys::hash_field_key(&self.key, field));
            removed += 1;
        }
        if removed == 0 {
            return Ok(0);
        }
        let new_len = self.len - removed;
        stage_meta(&mut batch, &self.key, Kind::Hash, new_len);
        self.store.write_batch(batch)?;
        track_key_count(Kind::Hash, self.len, new_len);
        self.len = new_len;
        Ok(removed)
    }

    pub(crate) fn drop_all(&mut self) -> DbResult<bool> {
        if self.len == 0 {
            return Ok(false);
        }
        let prefix = keys::hash_prefix(&self.key);
        let mut batch = Batch::default();
        for item in scan_prefix(self.store.as_ref(), &prefix, Direction::Forward)? {
            let (key, _) = item?;
            batch.delete(key);
        }
        batch.delete(keys::meta_key(&self.key));
        self.store.write_batch(batch)?;
        track_key_count(Kind::Hash, self.len, 0);
        self.len = 0;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;

    fn hash(store: &Arc<MemStore>) -> HashObject {
        HashObject::new(Arc::clone(store) as Arc<dyn StoreAdapter>, b"h".to_vec(), 0)
    }

    fn pair(f: &str, v: &str) -> (Vec<u8>, Vec<u8>) {
        (f.as_bytes().to_vec(), v.as_bytes().to_vec())
    }

    #[test]
    fn set_counts_only_new_fields() {
        let store = MemStore::new();
        let mut h = hash(&store);
        assert_eq!(h.set(&[pair("a", "1"), pair("b", "2")]).unwrap(), 2);
        assert_eq!(h.set(&[pair("a", "9"), pair("c", "3")]).unwrap(), 1);
        assert_eq!(h.len(), 3);
        assert_eq!(h.get(b"a").unwrap(), Some(b"9".to_vec()));
    }

    #[test]
    fn duplicate_field_in_one_call_counts_once_and_last_wins() {
        let store = MemStore::new();
        let mut h = hash(&store);
        assert_eq!(h.set(&[pair("f", "1"), pair("f", "2")]).unwrap(), 1);
        assert_eq!(h.len(), 1);
        assert_eq!(h.get(b"f").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn entries_sorted_by_field_bytes() {
        let store = MemStore::new();
        let mut h = hash(&store);
        h.set(&[pair("b", "2"), pair("a", "1"), pair("c", "3")]).unwrap();
        let entries = h.entries().unwrap();
        let fields: Vec<Vec<u8>> = entries.into_iter().map(|(f, _)| f).collect();
        assert_eq!(fields, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn remove_updates_len_and_deletes_meta_at_zero() {
        let store = MemStore::new();
        let mut h = hash(&store);
        h.set(&[pair("a", "1"), pair("b", "2")]).unwrap();
        assert_eq!(h.remove(&[b"a".to_vec(), b"missing".to_vec()]).unwrap(), 1);
        assert_eq!(h.len(), 1);
        assert_eq!(h.remove(&[b"b".to_vec()]).unwrap(), 1);
        assert_eq!(h.len(), 0);
        assert_eq!(store.key_count(), 0, "no zombie metadata");
    }

    #[test]
    fn duplicate_field_in_remove_counts_once() {
        let store = MemStore::new();
        let mut h = hash(&store);
        h.set(&[pair("a", "1"), pair("b", "2")]).unwrap();
        assert_eq!(h.remove(&[b"a".to_vec(), b"a".to_vec()]).unwrap(), 1);
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn drop_all_clears_the_prefix() {
        let store = MemStore::new();
        let mut h = hash(&store);
        h.set(&[pair("a", "1"), pair("b", "2")]).unwrap();
        assert!(h.drop_all().unwrap());
        assert_eq!(store.key_count(), 0);
        assert!(!h.drop_all().unwrap());
    }

    #[test]
    fn failed_commit_keeps_cached_len() {
        let store = MemStore::new();
        let mut h = hash(&store);
        h.set(&[pair("a", "1")]).unwrap();
        store.poison_writes();
        assert!(h.set(&[pair("b", "2")]).is_err());
        store.heal_writes();
        assert_eq!(h.len(), 1);
        assert_eq!(h.get(b"b").unwrap(), None);
    }
}
