use std::sync::Arc;

use crate::error::DbResult;
use crate::keys;
use crate::store::{scan_prefix, Batch, Direction, StoreAdapter};

use super::{stage_meta, track_key_count, Kind};

/// List aggregate: elements live at `l[key]<ord64(position)>`. Positions are
/// contiguous signed integers; pushes extend either boundary, pops shrink it,
/// so the byte order of the element keys is exactly the list order.
pub(crate) struct ListObject {
    store: Arc<dyn StoreAdapter>,
    key: Vec<u8>,
    len: i64,
}

impl ListObject {
    pub(crate) fn new(store: Arc<dyn StoreAdapter>, key: Vec<u8>, len: i64) -> Self {
        Self { store, key, len }
    }

    pub(crate) fn len(&self) -> i64 {
        self.len
    }

    /// Position of the first (Forward) or last (Backward) element.
    fn edge_position(&self, direction: Direction) -> DbResult<Option<i64>> {
        let prefix = keys::list_prefix(&self.key);
        let mut iter = scan_prefix(self.store.as_ref(), &prefix, direction)?;
        match iter.next() {
            None => Ok(None),
            Some(item) => {
                let (key, _) = item?;
                keys::decode_ord64(&key[prefix.len()..]).map(Some)
            }
        }
    }

    pub(crate) fn push_front(&mut self, values: &[Vec<u8>]) -> DbResult<i64> {
        let head = self.edge_position(Direction::Forward)?;
        let start = head.map_or(0, |h| h - 1);
        let mut batch = Batch::default();
        for (i, value) in values.iter().enumerate() {
            batch.put(
                keys::list_elem_key(&self.key, start - i as i64),
                value.clone(),
            );
        }
        let new_len = self.len + values.len() as i64;
        stage_meta(&mut batch, &self.key, Kind::List, new_len);
        self.store.write_batch(batch)?;
        track_key_count(Kind::List, self.len, new_len);
        self.len = new_len;
        Ok(new_len)
    }

    pub(crate) fn push_back(&mut self, values: &[Vec<u8>]) -> DbResult<i64> {
        let tail = self.edge_position(Direction::Backward)?;
        let start = tail.map_or(0, |t| t + 1);
        let mut batch = Batch::default();
        for (i, value) in values.iter().enumerate() {
            batch.put(
                keys::list_elem_key(&self.key, start + i as i64),
                value.clone(),
            );
        }
        let new_len = self.len + values.len() as i64;
        stage_meta(&mut batch, &self.key, Kind::List, new_len);
        self.store.write_batch(batch)?;
        track_key_count(Kind::List, self.len, new_len);
        self.len = new_len;
        Ok(new_len)
    }

    pub(crate) fn pop_front(&mut self) -> DbResult<Option<Vec<u8>>> {
        self.pop(Direction::Forward)
    }

    pub(crate) fn pop_back(&mut self) -> DbResult<Option<Vec<u8>>> {
        self.pop(Direction::Backward)
    }

    fn pop(&mut self, direction: Direction) -> DbResult<Option<Vec<u8>>> {
        let prefix = keys::list_prefix(&self.key);
        let first = {
            let mut iter = scan_prefix(self.store.as_ref(), &prefix, direction)?;
            match iter.next() {
                None => return Ok(None),
                Some(item) => item?,
            }
        };
        let (elem_key, value) = first;
        let mut batch = Batch::default();
        batch.delete(elem_key);
        let new_len = self.len - 1;
        stage_meta(&mut batch, &self.key, Kind::List, new_len);
        self.store.write_batch(batch)?;
        track_key_count(Kind::List, self.len, new_len);
        self.len = new_len;
        Ok(Some(value))
    }

    /// Redis LRANGE semantics: `start`/`stop` may be negative (from the end),
    /// both inclusive, out-of-range indices clamped.
    pub(crate) fn range(&self, start: i64, stop: i64) -> DbResult<Vec<Vec<u8>>> {
        if self.len == 0 {
            return Ok(Vec::new());
        }
        let start = normalize(start, self.len).max(0);
        let stop = normalize(stop, self.len).min(self.len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        let head = match self.edge_position(Direction::Forward)? {
            None => return Ok(Vec::new()),
            Some(h) => h,
        };
        let lower = keys::list_elem_key(&self.key, head + start);
        let upper = keys::list_elem_key(&self.key, head + stop);
        let mut out = Vec::new();
        for item in self.store.iterate(&lower, &upper, Direction::Forward)? {
            let (_, value) = item?;
            out.push(value);
        }
        Ok(out)
    }

    pub(crate) fn index(&self, index: i64) -> DbResult<Option<Vec<u8>>> {
        let pos = normalize(index, self.len);
        if pos < 0 || pos >= self.len {
            return Ok(None);
        }
        let head = match self.edge_position(Direction::Forward)? {
            None => return Ok(None),
            Some(h) => h,
        };
        self.store.get(&keys::list_elem_key(&self.key, head + pos))
    }

    pub(crate) fn drop_all(&mut self) -> DbResult<bool> {
        if self.len == 0 {
            return Ok(false);
        }
        let prefix = keys::list_prefix(&self.key);
        let mut batch = Batch::default();
        for item in scan_prefix(self.store.as_ref(), &prefix, Direction::Forward)? {
            let (key, _) = item?;
            batch.delete(key);
        }
        batch.delete(keys::meta_key(&self.key));
        self.store.write_batch(batch)?;
        track_key_count(Kind::List, self.len, 0);
        self.len = 0;
        Ok(true)
    }
}

fn normalize(index: i64, len: i64) -> i64 {
    if index < 0 {
        len + index
    } else {
        index
    }
}
