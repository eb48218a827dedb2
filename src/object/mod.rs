use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::error::{DbError, DbResult};
use crate::keys;
use crate::store::{Batch, StoreAdapter};

mod hash;
mod list;
mod set;
mod string;
mod zset;

pub(crate) use hash::HashObject;
pub(crate) use list::ListObject;
pub(crate) use set::SetObject;
pub(crate) use string::StringObject;
pub(crate) use zset::ZSetObject;

/// Quiescent engine cells are shed once the registry cache passes this size.
const CELL_CACHE_CAP: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    String,
    Hash,
    List,
    Set,
    ZSet,
}

impl Kind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Kind::String => b'k',
            Kind::Hash => b'h',
            Kind::List => b'l',
            Kind::Set => b's',
            Kind::ZSet => b'z',
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Kind> {
        match tag {
            b'k' => Some(Kind::String),
            b'h' => Some(Kind::Hash),
            b'l' => Some(Kind::List),
            b's' => Some(Kind::Set),
            b'z' => Some(Kind::ZSet),
            _ => None,
        }
    }

    /// The name the TYPE command reports.
    pub(crate) fn type_name(self) -> &'static str {
        match self {
            Kind::String => "string",
            Kind::Hash => "hash",
            Kind::List => "list",
            Kind::Set => "set",
            Kind::ZSet => "zset",
        }
    }
}

// ── Metadata value codec ──────────────────────────────────────────────────────
//
// One tag byte, then the cardinality as decimal text (aggregates only).
// A single point read of `+[key]` yields both the kind and the length.

pub(crate) fn encode_meta(kind: Kind, len: i64) -> Vec<u8> {
    let mut out = vec![kind.tag()];
    if kind != Kind::String {
        out.extend_from_slice(len.to_string().as_bytes());
    }
    out
}

pub(crate) fn decode_meta(value: &[u8]) -> DbResult<(Kind, i64)> {
    let tag = *value
        .first()
        .ok_or_else(|| DbError::CorruptKey("empty metadata value".into()))?;
    let kind = Kind::from_tag(tag)
        .ok_or_else(|| DbError::CorruptKey(format!("unknown kind tag {tag:#04x}")))?;
    if kind == Kind::String {
        return Ok((kind, 1));
    }
    let len = std::str::from_utf8(&value[1..])
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| DbError::CorruptKey(format!("bad cardinality in metadata: {value:?}")))?;
    Ok((kind, len))
}

/// Stage the metadata write that accompanies every mutating batch: the key is
/// rewritten with the new cardinality, or deleted outright when the aggregate
/// became empty (no zombie metadata).
pub(crate) fn stage_meta(batch: &mut Batch, key: &[u8], kind: Kind, len: i64) {
    if len <= 0 {
        batch.delete(keys::meta_key(key));
    } else {
        batch.put(keys::meta_key(key), encode_meta(kind, len));
    }
}

/// Keep the per-kind key gauge in step with the metadata lifecycle: a logical
/// key is born when its metadata first lands and dies when it is deleted.
/// Engines call this after a successful commit with the cardinality before
/// and after; only the empty/non-empty transitions move the gauge.
pub(crate) fn track_key_count(kind: Kind, old_len: i64, new_len: i64) {
    let gauge = metrics::gauge!("shale_keys_total", "kind" => kind.type_name());
    if old_len <= 0 && new_len > 0 {
        gauge.increment(1.0);
    } else if old_len > 0 && new_len <= 0 {
        gauge.decrement(1.0);
    }
}

// ── Engine dispatch ───────────────────────────────────────────────────────────

/// One engine per logical key, tagged by kind. Commands match on the variant
/// they asked the registry for; the registry guarantees the kinds agree.
pub(crate) enum Object {
    String(StringObject),
    Hash(HashObject),
    List(ListObject),
    Set(SetObject),
    ZSet(ZSetObject),
}

impl Object {
    fn new(kind: Kind, store: Arc<dyn StoreAdapter>, key: Vec<u8>, len: i64) -> Self {
        match kind {
            Kind::String => Object::String(StringObject::new(store, key, len > 0)),
            Kind::Hash => Object::Hash(HashObject::new(store, key, len)),
            Kind::List => Object::List(ListObject::new(store, key, len)),
            Kind::Set => Object::Set(SetObject::new(store, key, len)),
            Kind::ZSet => Object::ZSet(ZSetObject::new(store, key, len)),
        }
    }

    pub(crate) fn kind(&self) -> Kind {
        match self {
            Object::String(_) => Kind::String,
            Object::Hash(_) => Kind::Hash,
            Object::List(_) => Kind::List,
            Object::Set(_) => Kind::Set,
            Object::ZSet(_) => Kind::ZSet,
        }
    }

    pub(crate) fn len(&self) -> i64 {
        match self {
            Object::String(o) => o.len(),
            Object::Hash(o) => o.len(),
            Object::List(o) => o.len(),
            Object::Set(o) => o.len(),
            Object::ZSet(o) => o.len(),
        }
    }

    /// Delete every physical key of this aggregate in one batch.
    /// Returns whether anything existed.
    pub(crate) fn drop_all(&mut self) -> DbResult<bool> {
        match self {
            Object::String(o) => o.remove(),
            Object::Hash(o) => o.drop_all(),
            Object::List(o) => o.drop_all(),
            Object::Set(o) => o.drop_all(),
            Object::ZSet(o) => o.drop_all(),
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

type Cell = Arc<AsyncMutex<Object>>;

pub(crate) enum Lookup {
    /// The engine cell; lock it to operate.
    Object(Cell),
    /// The key holds a different kind; the command must answer WRONGTYPE.
    WrongKind(Kind),
}

/// Owns the engine instances, one per logical key. The committed metadata is
/// authoritative for a key's kind; the cell provides the per-key lock and the
/// cached cardinality that engines maintain across operations.
pub(crate) struct Registry {
    store: Arc<dyn StoreAdapter>,
    cells: Mutex<HashMap<Vec<u8>, (Kind, Cell)>>,
}

impl Registry {
    pub(crate) fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            store,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// The kind currently committed for `key`, if any. One point read.
    pub(crate) fn kind_of(&self, key: &[u8]) -> DbResult<Option<Kind>> {
        match self.store.get(&keys::meta_key(key))? {
            Some(value) => decode_meta(&value).map(|(kind, _)| Some(kind)),
            None => Ok(None),
        }
    }

    /// Fetch (or lazily create) the engine for `key` as `kind`.
    ///
    /// The metadata probe doubles as the type check: a key committed under a
    /// different kind is refused here, which is what keeps one logical key
    /// bound to at most one aggregate kind.
    pub(crate) fn acquire(&self, key: &[u8], kind: Kind) -> DbResult<Lookup> {
        let committed = match self.store.get(&keys::meta_key(key))? {
            Some(value) => Some(decode_meta(&value)?),
            None => None,
        };
        if let Some((have, _)) = committed {
            if have != kind {
                return Ok(Lookup::WrongKind(have));
            }
        }

        let mut cells = self.cells.lock().expect("registry cell map poisoned");
        if let Some((cached_kind, cell)) = cells.get(key) {
            if *cached_kind == kind {
                return Ok(Lookup::Object(Arc::clone(cell)));
            }
            // The key was dropped and re-typed since this cell was built.
        }
        if cells.len() >= CELL_CACHE_CAP {
            cells.retain(|_, (_, cell)| Arc::strong_count(cell) > 1);
        }
        let len = committed.map(|(_, n)| n).unwrap_or(0);
        let cell = Arc::new(AsyncMutex::new(Object::new(
            kind,
            Arc::clone(&self.store),
            key.to_vec(),
            len,
        )));
        cells.insert(key.to_vec(), (kind, Arc::clone(&cell)));
        Ok(Lookup::Object(cell))
    }

    #[cfg(test)]
    pub(crate) fn cached_cells(&self) -> usize {
        self.cells.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;

    #[test]
    fn meta_roundtrip_for_aggregates() {
        let v = encode_meta(Kind::ZSet, 42);
        assert_eq!(v, b"z42");
        assert_eq!(decode_meta(&v).unwrap(), (Kind::ZSet, 42));
    }

    #[test]
    fn meta_string_carries_no_count() {
        let v = encode_meta(Kind::String, 1);
        assert_eq!(v, b"k");
        assert_eq!(decode_meta(&v).unwrap(), (Kind::String, 1));
    }

    #[test]
    fn meta_rejects_garbage() {
        assert!(decode_meta(b"").is_err());
        assert!(decode_meta(b"q1").is_err());
        assert!(decode_meta(b"zxyz").is_err());
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses_cell() {
        let store = MemStore::new();
        let reg = Registry::new(store);
        let Lookup::Object(a) = reg.acquire(b"k", Kind::Hash).unwrap() else {
            panic!("expected object");
        };
        let Lookup::Object(b) = reg.acquire(b"k", Kind::Hash).unwrap() else {
            panic!("expected object");
        };
        assert!(Arc::ptr_eq(&a, &b), "same key must share one lock");
        assert_eq!(reg.cached_cells(), 1);
    }

    #[tokio::test]
    async fn acquire_refuses_cross_kind_access() {
        let store = MemStore::new();
        let reg = Registry::new(Arc::clone(&store) as Arc<dyn StoreAdapter>);
        let Lookup::Object(cell) = reg.acquire(b"k", Kind::Set).unwrap() else {
            panic!("expected object");
        };
        {
            let mut obj = cell.lock().await;
            let Object::Set(s) = &mut *obj else { unreachable!() };
            s.add(&[b"m".to_vec()]).unwrap();
        }
        match reg.acquire(b"k", Kind::ZSet).unwrap() {
            Lookup::WrongKind(kind) => assert_eq!(kind, Kind::Set),
            Lookup::Object(_) => panic!("mixed kinds on one key must be refused"),
        }
    }

    #[tokio::test]
    async fn retyping_after_drop_builds_fresh_cell() {
        let store = MemStore::new();
        let reg = Registry::new(Arc::clone(&store) as Arc<dyn StoreAdapter>);
        let Lookup::Object(cell) = reg.acquire(b"k", Kind::Set).unwrap() else {
            panic!("expected object");
        };
        {
            let mut obj = cell.lock().await;
            let Object::Set(s) = &mut *obj else { unreachable!() };
            s.add(&[b"m".to_vec()]).unwrap();
            obj.drop_all().unwrap();
        }
        match reg.acquire(b"k", Kind::String).unwrap() {
            Lookup::Object(cell) => assert_eq!(cell.lock().await.kind(), Kind::String),
            Lookup::WrongKind(_) => panic!("dropped key must be re-typable"),
        }
    }

    #[test]
    fn kind_of_reports_committed_kind_only() {
        let store = MemStore::new();
        let reg = Registry::new(Arc::clone(&store) as Arc<dyn StoreAdapter>);
        assert_eq!(reg.kind_of(b"k").unwrap(), None);
        // Creating a cell without writing anything must not invent a kind.
        let _ = reg.acquire(b"k", Kind::List).unwrap();
        assert_eq!(reg.kind_of(b"k").unwrap(), None);
    }
}
