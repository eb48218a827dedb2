use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DbResult;
use crate::keys;
use crate::store::{scan_prefix, Batch, Direction, StoreAdapter};

use super::{stage_meta, track_key_count, Kind};

/// Sorted-set aggregate, kept as two parallel regions under `z[key]`:
///
///   m#<member>                    -> ord64(score)   (point lookups)
///   s#<ord64(score)>#<member>     -> ""             (ordered scans)
///
/// Every mutation keeps the two in lockstep inside a single batch: for each
/// member exactly one score-index entry exists, carrying the same score bytes
/// as the member-index value.
pub(crate) struct ZSetObject {
    store: Arc<dyn StoreAdapter>,
    key: Vec<u8>,
    len: i64,
}

impl ZSetObject {
    pub(crate) fn new(store: Arc<dyn StoreAdapter>, key: Vec<u8>, len: i64) -> Self {
        Self { store, key, len }
    }

    pub(crate) fn len(&self) -> i64 {
        self.len
    }

    /// Insert or update `(score, member)` pairs; the last occurrence of a
    /// member within one call wins. Returns the number of members that were
    /// not present before.
    pub(crate) fn add(&mut self, pairs: &[(i64, Vec<u8>)]) -> DbResult<i64> {
        let mut batch = Batch::default();
        let mut staged: HashMap<&[u8], i64> = HashMap::new();
        let mut added = 0i64;
        for (score, member) in pairs {
            let prev = match staged.get(member.as_slice()) {
                Some(s) => Some(*s),
                None => self.score(member)?,
            };
            match prev {
                // The delete lands before this pair's put, so an updated
                // member never leaves a stale score-index entry behind.
                Some(old) => batch.delete(keys::zset_score_key(&self.key, member, old)),
                None => added += 1,
            }
            batch.put(
                keys::zset_member_key(&self.key, member),
                keys::encode_ord64(*score).to_vec(),
            );
            batch.put(keys::zset_score_key(&self.key, member, *score), Vec::new());
            staged.insert(member, *score);
        }
        let new_len = self.len + added;
        stage_meta(&mut batch, &self.key, Kind::ZSet, new_len);
        self.store.write_batch(batch)?;
        track_key_count(Kind::ZSet, self.len, new_len);
        self.len = new_len;
        Ok(added)
    }

    pub(crate) fn score(&self, member: &[u8]) -> DbResult<Option<i64>> {
        match self.store.get(&keys::zset_member_key(&self.key, member))? {
            None => Ok(None),
            Some(raw) => keys::decode_ord64(&raw).map(Some),
        }
    }

    /// Add `delta` to the member's score (0 if absent), creating it if needed.
    /// Returns the new score.
    pub(crate) fn incr_by(&mut self, member: &[u8], delta: i64) -> DbResult<i64> {
        let old = self.score(member)?;
        let new_score = old.unwrap_or(0).saturating_add(delta);
        let mut batch = Batch::default();
        let mut new_len = self.len;
        match old {
            Some(prev) => batch.delete(keys::zset_score_key(&self.key, member, prev)),
            None => new_len += 1,
        }
        batch.put(
            keys::zset_member_key(&self.key, member),
            keys::encode_ord64(new_score).to_vec(),
        );
        batch.put(
            keys::zset_score_key(&self.key, member, new_score),
            Vec::new(),
        );
        stage_meta(&mut batch, &self.key, Kind::ZSet, new_len);
        self.store.write_batch(batch)?;
        track_key_count(Kind::ZSet, self.len, new_len);
        self.len = new_len;
        Ok(new_score)
    }

    /// Zero-based position of `member` in score order (ties by member bytes),
    /// counting from the top when `high_to_low`. `None` if absent.
    pub(crate) fn rank(&self, member: &[u8], high_to_low: bool) -> DbResult<Option<i64>> {
        // Absent members would otherwise cost a full scan.
        if self.score(member)?.is_none() {
            return Ok(None);
        }
        let prefix = keys::zset_score_prefix(&self.key);
        let direction = if high_to_low {
            Direction::Backward
        } else {
            Direction::Forward
        };
        for (i, item) in scan_prefix(self.store.as_ref(), &prefix, direction)?.enumerate() {
            let (key, _) = item?;
            let (_, current) = keys::split_score_key(prefix.len(), &key)?;
            if current == member {
                return Ok(Some(i as i64));
            }
        }
        Ok(None)
    }

    /// `(score, member)` pairs for positions `start..=stop` in score order;
    /// `stop == -1` means "to the end".
    pub(crate) fn range_by_index(
        &self,
        start: i64,
        stop: i64,
        high_to_low: bool,
    ) -> DbResult<Vec<(i64, Vec<u8>)>> {
        let prefix = keys::zset_score_prefix(&self.key);
        let direction = if high_to_low {
            Direction::Backward
        } else {
            Direction::Forward
        };
        let mut out = Vec::new();
        for (i, item) in scan_prefix(self.store.as_ref(), &prefix, direction)?.enumerate() {
            let i = i as i64;
            if i < start {
                continue;
            }
            if stop != -1 && i > stop {
                break;
            }
            let (key, _) = item?;
            out.push(keys::split_score_key(prefix.len(), &key)?);
        }
        Ok(out)
    }

    /// `(score, member)` pairs with `min <= score <= max`, skipping `offset`
    /// and emitting at most `count` (`-1` = unbounded), in scan direction.
    pub(crate) fn range_by_score(
        &self,
        min: i64,
        max: i64,
        offset: i64,
        count: i64,
        high_to_low: bool,
    ) -> DbResult<Vec<(i64, Vec<u8>)>> {
        if min > max {
            return Ok(Vec::new());
        }
        let prefix = keys::zset_score_prefix(&self.key);
        let (lower, upper) = self.score_range(min, max);
        let direction = if high_to_low {
            Direction::Backward
        } else {
            Direction::Forward
        };
        let mut out = Vec::new();
        for (i, item) in self.store.iterate(&lower, &upper, direction)?.enumerate() {
            let i = i as i64;
            if i < offset {
                continue;
            }
            if count != -1 && i >= offset + count {
                break;
            }
            let (key, _) = item?;
            out.push(keys::split_score_key(prefix.len(), &key)?);
        }
        Ok(out)
    }

    /// Inclusive physical endpoints for a score window: the upper endpoint
    /// gets `MAXBYTE` appended so every member tied at `max` is covered.
    fn score_range(&self, min: i64, max: i64) -> (Vec<u8>, Vec<u8>) {
        let mut lower = keys::zset_score_prefix(&self.key);
        lower.extend_from_slice(&keys::encode_ord64(min));
        let mut upper = keys::zset_score_prefix(&self.key);
        upper.extend_from_slice(&keys::encode_ord64(max));
        (lower, keys::upper_bound(upper))
    }

    /// Returns the number of members actually removed.
    pub(crate) fn remove(&mut self, members: &[Vec<u8>]) -> DbResult<i64> {
        let mut batch = Batch::default();
        let mut seen: std::collections::HashSet<&[u8]> = std::collections::HashSet::new();
        let mut removed = 0i64;
        for member in members {
            if seen.contains(member.as_slice()) {
                continue;
            }
            let Some(score) = self.score(member)? else {
                continue;
            };
            seen.insert(member);
            batch.delete(keys::zset_member_key(&self.key, member));
            batch.delete(keys::zset_score_key(&self.key, member, score));
            removed += 1;
        }
        if removed == 0 {
            return Ok(0);
        }
        self.commit_removal(batch, removed)
    }

    /// Remove positions `start..=stop` in ascending score order
    /// (`stop == -1` = through the end). Returns the count removed.
    pub(crate) fn remove_by_index(&mut self, start: i64, stop: i64) -> DbResult<i64> {
        let victims = self.range_by_index(start, stop, false)?;
        self.remove_pairs(&victims)
    }

    /// Remove every member with `min <= score <= max`.
    pub(crate) fn remove_by_score(&mut self, min: i64, max: i64) -> DbResult<i64> {
        let victims = self.range_by_score(min, max, 0, -1, false)?;
        self.remove_pairs(&victims)
    }

    fn remove_pairs(&mut self, pairs: &[(i64, Vec<u8>)]) -> DbResult<i64> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let mut batch = Batch::default();
        for (score, member) in pairs {
            batch.delete(keys::zset_member_key(&self.key, member));
            batch.delete(keys::zset_score_key(&self.key, member, *score));
        }
        self.commit_removal(batch, pairs.len() as i64)
    }

    fn commit_removal(&mut self, mut batch: Batch, removed: i64) -> DbResult<i64> {
        let new_len = self.len - removed;
        stage_meta(&mut batch, &self.key, Kind::ZSet, new_len);
        self.store.write_batch(batch)?;
        track_key_count(Kind::ZSet, self.len, new_len);
        self.len = new_len;
        Ok(removed)
    }

    pub(crate) fn drop_all(&mut self) -> DbResult<bool> {
        if self.len == 0 {
            return Ok(false);
        }
        let prefix = keys::zset_prefix(&self.key);
        let mut batch = Batch::default();
        for item in scan_prefix(self.store.as_ref(), &prefix, Direction::Forward)? {
            let (key, _) = item?;
            batch.delete(key);
        }
        batch.delete(keys::meta_key(&self.key));
        self.store.write_batch(batch)?;
        track_key_count(Kind::ZSet, self.len, 0);
        self.len = 0;
        Ok(true)
    }
}
