use std::collections::HashSet;
use std::sync::Arc;

use crate::error::DbResult;
use crate::keys;
use crate::store::{scan_prefix, Batch, Direction, StoreAdapter};

use super::{stage_meta, track_key_count, Kind};

/// Set aggregate: members are the key suffixes under `s[key]`, values empty.
pub(crate) struct SetObject {
    store: Arc<dyn StoreAdapter>,
    key: Vec<u8>,
    len: i64,
}

impl SetObject {
    pub(crate) fn new(store: Arc<dyn StoreAdapter>, key: Vec<u8>, len: i64) -> Self {
        Self { store, key, len }
    }

    pub(crate) fn len(&self) -> i64 {
        self.len
    }

    /// Returns the number of members that were not already present.
    pub(crate) fn add(&mut self, members: &[Vec<u8>]) -> DbResult<i64> {
        let mut batch = Batch::default();
        let mut staged: HashSet<&[u8]> = HashSet::new();
        let mut added = 0i64;
        for member in members {
            let existed = staged.contains(member.as_slice())
                || self.store.get(&keys::set_member_key(&self.key, member))?.is_some();
            if existed {
                continue;
            }
            staged.insert(member);
            batch.put(keys::set_member_key(&self.key, member), Vec::new());
            added += 1;
        }
        if added == 0 {
            return Ok(0);
        }
        let new_len = self.len + added;
        stage_meta(&mut batch, &self.key, Kind::Set, new_len);
        self.store.write_batch(batch)?;
        track_key_count(Kind::Set, self.len, new_len);
        self.len = new_len;
        Ok(added)
    }

    pub(crate) fn contains(&self, member: &[u8]) -> DbResult<bool> {
        Ok(self
            .store
            .get(&keys::set_member_key(&self.key, member))?
            .is_some())
    }

    /// All members in byte order.
    pub(crate) fn members(&self) -> DbResult<Vec<Vec<u8>>> {
        let prefix = keys::set_prefix(&self.key);
        let mut out = Vec::new();
        for item in scan_prefix(self.store.as_ref(), &prefix, Direction::Forward)? {
            let (key, _) = item?;
            out.push(key[prefix.len()..].to_vec());
        }
        Ok(out)
    }

    pub(crate) fn remove(&mut self, members: &[Vec<u8>]) -> DbResult<i64> {
        let mut batch = Batch::default();
        let mut staged: HashSet<&[u8]> = HashSet::new();
        let mut removed = 0i64;
        for member in members {
            if staged.contains(member.as_slice()) {
                continue;
            }
            if !self.contains(member)? {
                continue;
            }
            staged.insert(member);
            batch.delete(keys::set_member_key(&self.key, member));
            removed += 1;
        }
        if removed == 0 {
            return Ok(0);
        }
        let new_len = self.len - removed;
        stage_meta(&mut batch, &self.key, Kind::Set, new_len);
        self.store.write_batch(batch)?;
        track_key_count(Kind::Set, self.len, new_len);
        self.len = new_len;
        Ok(removed)
    }

    pub(crate) fn drop_all(&mut self) -> DbResult<bool> {
        if self.len == 0 {
            return Ok(false);
        }
        let prefix = keys::set_prefix(&self.key);
        let mut batch = Batch::default();
        for item in scan_prefix(self.store.as_ref(), &prefix, Direction::Forward)? {
            let (key, _) = item?;
            batch.delete(key);
        }
        batch.delete(keys::meta_key(&self.key));
        self.store.write_batch(batch)?;
        track_key_count(Kind::Set, self.len, 0);
        self.len = 0;
        Ok(true)
    }
}
