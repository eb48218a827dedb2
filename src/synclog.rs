use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::info;

use crate::error::{DbError, DbResult};
use crate::store::{Batch, StoreAdapter};

/// Log entries live inside the main store, under the reserved namespace the
/// snapshot stream skips. Entry keys order by sequence; the bounds keys hold
/// decimal text so the window survives restarts.
const ENTRY_PREFIX: &[u8] = b"__shale:log:e:";
const MIN_KEY: &[u8] = b"__shale:log:min";
const MAX_KEY: &[u8] = b"__shale:log:max";

/// How long a tail waits before re-checking when no append notification
/// arrives (missed wakeups stay bounded).
pub(crate) const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct LogState {
    enabled: bool,
    min: u64,
    max: u64,
}

/// Append-only sequenced log of raw write-command bytes.
///
/// Disabled until the first slave connects; enabling is sticky. Sequences
/// start at 1 and are gap-free. Retention is bounded: old entries fall off
/// the trailing edge once the window exceeds `cap`.
pub(crate) struct SyncLog {
    store: Arc<dyn StoreAdapter>,
    state: Mutex<LogState>,
    notify: Notify,
    cap: u64,
}

fn entry_key(seq: u64) -> Vec<u8> {
    let mut key = ENTRY_PREFIX.to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn read_bound(store: &dyn StoreAdapter, key: &[u8]) -> DbResult<u64> {
    match store.get(key)? {
        None => Ok(0),
        Some(raw) => std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| DbError::CorruptKey(format!("bad log bound value {raw:?}"))),
    }
}

impl SyncLog {
    pub(crate) fn open(store: Arc<dyn StoreAdapter>, cap: u64) -> DbResult<Arc<Self>> {
        let min = read_bound(store.as_ref(), MIN_KEY)?;
        let max = read_bound(store.as_ref(), MAX_KEY)?;
        Ok(Arc::new(Self {
            store,
            state: Mutex::new(LogState {
                enabled: false,
                min,
                max,
            }),
            notify: Notify::new(),
            cap: cap.max(1),
        }))
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.state.lock().expect("sync log state poisoned").enabled
    }

    /// Sticky: once any slave has connected, writes keep being logged.
    pub(crate) fn enable(&self) {
        let mut state = self.state.lock().expect("sync log state poisoned");
        if !state.enabled {
            state.enabled = true;
            info!(min = state.min, max = state.max, "sync log enabled");
        }
    }

    pub(crate) fn min_seq(&self) -> u64 {
        let state = self.state.lock().expect("sync log state poisoned");
        if state.enabled {
            state.min
        } else {
            0
        }
    }

    pub(crate) fn max_seq(&self) -> u64 {
        let state = self.state.lock().expect("sync log state poisoned");
        if state.enabled {
            state.max
        } else {
            0
        }
    }

    pub(crate) fn last_seq(&self) -> u64 {
        self.max_seq()
    }

    /// Append one raw command payload. Returns the assigned sequence, or
    /// `None` while the log is disabled. The entry, the bounds, and any
    /// retention trimming commit as one batch.
    pub(crate) fn append(&self, payload: &[u8]) -> DbResult<Option<u64>> {
        let mut state = self.state.lock().expect("sync log state poisoned");
        if !state.enabled {
            return Ok(None);
        }
        let seq = state.max + 1;
        let mut min = if state.min == 0 { seq } else { state.min };

        let mut batch = Batch::default();
        batch.put(entry_key(seq), payload.to_vec());
        // Trim entries that fell past the retention window.
        if seq - min + 1 > self.cap {
            let new_min = seq - self.cap + 1;
            for old in min..new_min {
                batch.delete(entry_key(old));
            }
            min = new_min;
        }
        batch.put(MIN_KEY.to_vec(), min.to_string().into_bytes());
        batch.put(MAX_KEY.to_vec(), seq.to_string().into_bytes());
        self.store.write_batch(batch)?;

        state.min = min;
        state.max = seq;
        metrics::gauge!("shale_synclog_max_seq").set(seq as f64);
        metrics::gauge!("shale_synclog_min_seq").set(min as f64);
        drop(state);
        self.notify.notify_waiters();
        Ok(Some(seq))
    }

    /// Fetch the payload at `seq`.
    ///
    /// `Ok(None)` means not written yet (the caller waits); an error below
    /// the window means the slave can no longer catch up from here.
    pub(crate) fn read(&self, seq: u64) -> DbResult<Option<Vec<u8>>> {
        let (min, max) = {
            let state = self.state.lock().expect("sync log state poisoned");
            (state.min, state.max)
        };
        if seq == 0 || seq < min {
            return Err(DbError::SeqBelowWindow { seq, min });
        }
        if seq > max {
            return Ok(None);
        }
        match self.store.get(&entry_key(seq))? {
            Some(payload) => Ok(Some(payload)),
            // In-window entries are never deleted, so a hole is corruption.
            None => Err(DbError::CorruptKey(format!("log entry {seq} missing"))),
        }
    }

    /// Wait until an append happens, or the poll interval elapses.
    pub(crate) async fn wait_for_append(&self) {
        let _ = tokio::time::timeout(TAIL_POLL_INTERVAL, self.notify.notified()).await;
    }
}
