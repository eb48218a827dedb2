use std::path::Path;
use std::sync::Arc;

use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{DbError, DbResult};

/// Snapshot feeder channel depth: bounds memory while a slow slave drains.
const SNAPSHOT_CHANNEL_DEPTH: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Forward,
    Backward,
}

enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An all-or-nothing group of mutations. Engines stage every physical write
/// of one logical operation here so invariants hold across crashes.
#[derive(Default)]
pub(crate) struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub(crate) fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub(crate) fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub(crate) type KvPair = (Vec<u8>, Vec<u8>);
pub(crate) type ScanIter<'a> = Box<dyn Iterator<Item = DbResult<KvPair>> + 'a>;

/// Thin contract over the ordered store. Everything above this trait sees
/// byte keys, atomic batches, inclusive range scans, and point-in-time
/// snapshots — nothing engine-specific leaks through.
pub(crate) trait StoreAdapter: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>>;

    fn write_batch(&self, batch: Batch) -> DbResult<()>;

    /// Lazy scan of `[lower, upper]`, both endpoints inclusive. The consumer
    /// abandons a scan early by dropping the iterator.
    fn iterate(&self, lower: &[u8], upper: &[u8], direction: Direction) -> DbResult<ScanIter<'_>>;

    /// Acquire a point-in-time view of the whole keyspace and stream it in
    /// ascending key order. The view is pinned before this returns and
    /// released when the stream is dropped.
    fn snapshot(&self) -> DbResult<SnapshotStream>;
}

/// Scan every key extending `prefix`, in the given direction.
pub(crate) fn scan_prefix<'a>(
    store: &'a dyn StoreAdapter,
    prefix: &[u8],
    direction: Direction,
) -> DbResult<ScanIter<'a>> {
    let upper = crate::keys::upper_bound(prefix.to_vec());
    store.iterate(prefix, &upper, direction)
}

// ── Snapshot stream ───────────────────────────────────────────────────────────

/// Key-value pairs from a pinned store snapshot, fed by a background thread.
/// Dropping the stream releases the snapshot and stops the feeder.
pub(crate) struct SnapshotStream {
    rx: mpsc::Receiver<DbResult<KvPair>>,
}

impl SnapshotStream {
    pub(crate) async fn next(&mut self) -> Option<DbResult<KvPair>> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub(crate) fn from_pairs(pairs: Vec<KvPair>) -> Self {
        let (tx, rx) = mpsc::channel(pairs.len().max(1));
        for pair in pairs {
            tx.try_send(Ok(pair)).expect("snapshot channel sized to fit");
        }
        Self { rx }
    }
}

// ── RocksDB implementation ────────────────────────────────────────────────────

pub(crate) struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    pub(crate) fn open(path: &Path) -> DbResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        // Bound WAL growth and info-log retention; data durability is the
        // store's job, not ours.
        opts.set_max_total_wal_size(64 * 1024 * 1024);
        opts.set_keep_log_file_num(5);
        let db = DB::open(&opts, path).map_err(|e| DbError::Open(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) fn flush(&self) -> DbResult<()> {
        self.db.flush().map_err(|e| DbError::Write(e.to_string()))
    }
}

impl StoreAdapter for RocksStore {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.db.get(key).map_err(|e| DbError::Read(e.to_string()))
    }

    fn write_batch(&self, batch: Batch) -> DbResult<()> {
        let mut wb = WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => wb.put(k, v),
                BatchOp::Delete(k) => wb.delete(k),
            }
        }
        self.db.write(wb).map_err(|e| DbError::Write(e.to_string()))
    }

    fn iterate(&self, lower: &[u8], upper: &[u8], direction: Direction) -> DbResult<ScanIter<'_>> {
        let mode = match direction {
            Direction::Forward => IteratorMode::From(lower, rocksdb::Direction::Forward),
            // Positions at the largest key <= upper, keeping the bound inclusive.
            Direction::Backward => IteratorMode::From(upper, rocksdb::Direction::Reverse),
        };
        let lower = lower.to_vec();
        let upper = upper.to_vec();
        let iter = self
            .db
            .iterator(mode)
            .map(|item| {
                item.map(|(k, v)| (k.into_vec(), v.into_vec()))
                    .map_err(|e| DbError::Read(e.to_string()))
            })
            .take_while(move |item| match item {
                Ok((k, _)) => match direction {
                    Direction::Forward => k.as_slice() <= upper.as_slice(),
                    Direction::Backward => k.as_slice() >= lower.as_slice(),
                },
                // Pass the fault through; the consumer stops on it.
                Err(_) => true,
            });
        Ok(Box::new(iter))
    }

    fn snapshot(&self) -> DbResult<SnapshotStream> {
        let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_DEPTH);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<()>(1);
        let db = Arc::clone(&self.db);
        std::thread::Builder::new()
            .name("shale-snapshot".into())
            .spawn(move || {
                let snap = db.snapshot();
                // The caller holds the suspend gate until this handshake
                // completes, so the view is pinned while writes are paused.
                let _ = ready_tx.send(());
                for item in snap.iterator(IteratorMode::Start) {
                    let item = item
                        .map(|(k, v)| (k.into_vec(), v.into_vec()))
                        .map_err(|e| DbError::Read(e.to_string()));
                    let faulted = item.is_err();
                    if tx.blocking_send(item).is_err() {
                        debug!("snapshot stream released early");
                        break;
                    }
                    if faulted {
                        break;
                    }
                }
            })
            .map_err(|e| DbError::Snapshot(e.to_string()))?;
        ready_rx
            .recv()
            .map_err(|_| DbError::Snapshot("feeder thread exited before pinning".into()))?;
        Ok(SnapshotStream { rx })
    }
}

// ── In-memory test double ─────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod mem {
    use std::collections::BTreeMap;
    use std::ops::Bound::Included;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// BTreeMap-backed `StoreAdapter` so engine tests stay hermetic.
    #[derive(Default)]
    pub(crate) struct MemStore {
        map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
        fail_writes: AtomicBool,
    }

    impl MemStore {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make every subsequent `write_batch` fail, for store-fault paths.
        pub(crate) fn poison_writes(&self) {
            self.fail_writes.store(true, Ordering::SeqCst);
        }

        pub(crate) fn heal_writes(&self) {
            self.fail_writes.store(false, Ordering::SeqCst);
        }

        pub(crate) fn dump(&self) -> Vec<KvPair> {
            self.map
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }

        pub(crate) fn key_count(&self) -> usize {
            self.map.lock().unwrap().len()
        }
    }

    impl StoreAdapter for MemStore {
        fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
            Ok(self.map.lock().unwrap().get(key).cloned())
        }

        fn write_batch(&self, batch: Batch) -> DbResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(DbError::Write("poisoned".into()));
            }
            let mut map = self.map.lock().unwrap();
            for op in batch.ops {
                match op {
                    BatchOp::Put(k, v) => {
                        map.insert(k, v);
                    }
                    BatchOp::Delete(k) => {
                        map.remove(&k);
                    }
                }
            }
            Ok(())
        }

        fn iterate(
            &self,
            lower: &[u8],
            upper: &[u8],
            direction: Direction,
        ) -> DbResult<ScanIter<'_>> {
            if lower > upper {
                return Ok(Box::new(std::iter::empty()));
            }
            let map = self.map.lock().unwrap();
            let mut pairs: Vec<KvPair> = map
                .range::<Vec<u8>, _>((Included(&lower.to_vec()), Included(&upper.to_vec())))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if direction == Direction::Backward {
                pairs.reverse();
            }
            Ok(Box::new(pairs.into_iter().map(Ok)))
        }

        fn snapshot(&self) -> DbResult<SnapshotStream> {
            Ok(SnapshotStream::from_pairs(self.dump()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mem::MemStore;
    use super::*;
    use tempfile::TempDir;

    fn rocks() -> (TempDir, RocksStore) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn rocks_put_get_delete_roundtrip() {
        let (_dir, store) = rocks();
        let mut b = Batch::default();
        assert!(b.is_empty());
        b.put(b"a".to_vec(), b"1".to_vec());
        assert_eq!(b.len(), 1);
        store.write_batch(b).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

        let mut b = Batch::default();
        b.delete(b"a".to_vec());
        store.write_batch(b).unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn rocks_iterate_respects_inclusive_bounds() {
        let (_dir, store) = rocks();
        let mut b = Batch::default();
        for k in ["a", "b", "c", "d"] {
            b.put(k.as_bytes().to_vec(), b"v".to_vec());
        }
        store.write_batch(b).unwrap();

        let keys: Vec<Vec<u8>> = store
            .iterate(b"b", b"c", Direction::Forward)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let keys: Vec<Vec<u8>> = store
            .iterate(b"b", b"c", Direction::Backward)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn rocks_backward_from_upper_with_no_exact_match() {
        let (_dir, store) = rocks();
        let mut b = Batch::default();
        b.put(b"a".to_vec(), b"v".to_vec());
        b.put(b"c".to_vec(), b"v".to_vec());
        store.write_batch(b).unwrap();

        // Upper bound "b" is absent; the scan must start from "a".
        let keys: Vec<Vec<u8>> = store
            .iterate(b"a", b"b", Direction::Backward)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec()]);
    }

    #[test]
    fn rocks_scan_prefix_stops_at_neighbours() {
        let (_dir, store) = rocks();
        let mut b = Batch::default();
        b.put(b"h[k]f1".to_vec(), b"1".to_vec());
        b.put(b"h[k]f2".to_vec(), b"2".to_vec());
        b.put(b"h[kk]f1".to_vec(), b"3".to_vec());
        b.put(b"s[k]m".to_vec(), b"".to_vec());
        store.write_batch(b).unwrap();

        let keys: Vec<Vec<u8>> = scan_prefix(&store, b"h[k]", Direction::Forward)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"h[k]f1".to_vec(), b"h[k]f2".to_vec()]);
    }

    #[tokio::test]
    async fn rocks_snapshot_isolated_from_later_writes() {
        let (_dir, store) = rocks();
        let mut b = Batch::default();
        b.put(b"before".to_vec(), b"1".to_vec());
        store.write_batch(b).unwrap();

        let mut snap = store.snapshot().unwrap();

        let mut b = Batch::default();
        b.put(b"after".to_vec(), b"2".to_vec());
        store.write_batch(b).unwrap();

        let mut seen = Vec::new();
        while let Some(item) = snap.next().await {
            seen.push(item.unwrap().0);
        }
        assert_eq!(seen, vec![b"before".to_vec()]);
    }

    #[tokio::test]
    async fn rocks_snapshot_released_early_without_drain() {
        let (_dir, store) = rocks();
        let mut b = Batch::default();
        for i in 0..1000u32 {
            b.put(format!("k{i:06}").into_bytes(), b"v".to_vec());
        }
        store.write_batch(b).unwrap();

        let mut snap = store.snapshot().unwrap();
        let first = snap.next().await.unwrap().unwrap();
        assert_eq!(first.0, b"k000000".to_vec());
        drop(snap); // feeder must unblock and exit
    }

    #[test]
    fn mem_store_matches_contract() {
        let store = MemStore::new();
        let mut b = Batch::default();
        b.put(b"x".to_vec(), b"1".to_vec());
        b.put(b"y".to_vec(), b"2".to_vec());
        store.write_batch(b).unwrap();

        assert_eq!(store.get(b"x").unwrap(), Some(b"1".to_vec()));
        let keys: Vec<Vec<u8>> = store
            .iterate(b"x", b"y", Direction::Backward)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"y".to_vec(), b"x".to_vec()]);
    }

    #[test]
    fn mem_store_poisoned_writes_fail_atomically() {
        let store = MemStore::new();
        store.poison_writes();
        let mut b = Batch::default();
        b.put(b"x".to_vec(), b"1".to_vec());
        assert!(store.write_batch(b).is_err());
        assert_eq!(store.key_count(), 0);
        store.heal_writes();
    }
}
