use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

use crate::error::DbError;
use crate::keys;
use crate::object::{Kind, Lookup, Object};
use crate::resp::{
    append_array_header, append_bulk, append_null, encode_command, resp_array, resp_bulk,
    resp_db_err, resp_err, resp_err_tag, resp_int, resp_null, resp_ok, resp_pong, resp_simple,
    resp_wrongtype, wrong_args,
};
use crate::server::Shared;
use crate::store::{scan_prefix, Direction};

pub(crate) enum Outcome {
    Reply(Vec<u8>),
    /// Reply, then close the connection.
    Quit(Vec<u8>),
    /// Hand the connection to the replicator.
    Sync { seq: i64 },
}

// ── Small shared helpers ──────────────────────────────────────────────────────

fn parse_int(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Score bound: `-inf` / `+inf` / `inf` (any case) or a signed integer.
fn parse_score_bound(bytes: &[u8]) -> Option<i64> {
    match bytes.to_ascii_lowercase().as_slice() {
        b"-inf" => Some(i64::MIN),
        b"+inf" | b"inf" => Some(i64::MAX),
        _ => parse_int(bytes),
    }
}

fn not_an_integer() -> Vec<u8> {
    resp_err("value is not an integer or out of range")
}

fn store_fault(e: DbError) -> Vec<u8> {
    error!(error = %e, "store fault");
    resp_db_err(&e)
}

type Cell = Arc<AsyncMutex<Object>>;

fn grab(shared: &Shared, key: &[u8], kind: Kind) -> Result<Cell, Vec<u8>> {
    match shared.objects.acquire(key, kind) {
        Ok(Lookup::Object(cell)) => Ok(cell),
        Ok(Lookup::WrongKind(_)) => Err(resp_wrongtype()),
        Err(e) => Err(store_fault(e)),
    }
}

/// Record a successfully applied write in the sync log. The caller still
/// holds its gate pass, so the append lands inside the same suspension
/// window as the commit. An append failure degrades replication, not the
/// already-committed command.
fn record_mutation(shared: &Shared, args: &[Vec<u8>]) {
    let refs: Vec<&[u8]> = args.iter().map(|a| a.as_slice()).collect();
    if let Err(e) = shared.synclog.append(&encode_command(&refs)) {
        warn!(error = %e, "sync log append failed; slaves may need a full resync");
    }
}

/// Clamp a Redis `[start, stop]` index window (negatives count from the end)
/// against `len`. `None` means the window is empty.
fn normalize_window(start: i64, stop: i64, len: i64) -> Option<(i64, i64)> {
    if len == 0 {
        return None;
    }
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || start >= len {
        return None;
    }
    Some((start, stop))
}

fn score_member_reply(pairs: &[(i64, Vec<u8>)], withscores: bool) -> Vec<u8> {
    let mut out = Vec::new();
    let items = if withscores {
        pairs.len() * 2
    } else {
        pairs.len()
    };
    append_array_header(&mut out, items);
    for (score, member) in pairs {
        append_bulk(&mut out, member);
        if withscores {
            append_bulk(&mut out, score.to_string().as_bytes());
        }
    }
    out
}

// ── Strings ───────────────────────────────────────────────────────────────────

async fn cmd_set(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 3 {
        return wrong_args(&args[0]);
    }
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::String) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::String(s) = &mut *obj else {
        unreachable!()
    };
    match s.set(&args[2]) {
        Ok(()) => {
            debug!(key = %String::from_utf8_lossy(&args[1]), "SET");
            record_mutation(shared, args);
            resp_ok()
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_get(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::String) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::String(s) = &*obj else {
        unreachable!()
    };
    match s.get() {
        Ok(Some(value)) => resp_bulk(&value),
        Ok(None) => resp_null(),
        Err(e) => store_fault(e),
    }
}

async fn cmd_incr_by(args: &[Vec<u8>], shared: &Shared, delta: i64) -> Vec<u8> {
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::String) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::String(s) = &mut *obj else {
        unreachable!()
    };
    let current = match s.get() {
        Ok(Some(raw)) => match parse_int(&raw) {
            Some(n) => n,
            None => return not_an_integer(),
        },
        Ok(None) => 0,
        Err(e) => return store_fault(e),
    };
    let Some(next) = current.checked_add(delta) else {
        return resp_err("increment or decrement would overflow");
    };
    match s.set(next.to_string().as_bytes()) {
        Ok(()) => {
            record_mutation(shared, args);
            resp_int(next)
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_incr(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    cmd_incr_by(args, shared, 1).await
}

async fn cmd_incrby(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 3 {
        return wrong_args(&args[0]);
    }
    let Some(delta) = parse_int(&args[2]) else {
        return not_an_integer();
    };
    cmd_incr_by(args, shared, delta).await
}

async fn cmd_decr(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    cmd_incr_by(args, shared, -1).await
}

// ── Keyspace ──────────────────────────────────────────────────────────────────

async fn cmd_del(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() < 2 {
        return wrong_args(&args[0]);
    }
    let _pass = shared.gate.pass().await;
    let mut removed = 0i64;
    // Per-key locks are taken strictly one at a time, never nested.
    for key in &args[1..] {
        let kind = match shared.objects.kind_of(key) {
            Ok(Some(kind)) => kind,
            Ok(None) => continue,
            Err(e) => return store_fault(e),
        };
        let cell = match grab(shared, key, kind) {
            Ok(c) => c,
            Err(reply) => return reply,
        };
        let mut obj = cell.lock().await;
        match obj.drop_all() {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => return store_fault(e),
        }
    }
    if removed > 0 {
        record_mutation(shared, args);
    }
    resp_int(removed)
}

async fn cmd_exists(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() < 2 {
        return wrong_args(&args[0]);
    }
    let mut found = 0i64;
    for key in &args[1..] {
        match shared.objects.kind_of(key) {
            Ok(Some(_)) => found += 1,
            Ok(None) => {}
            Err(e) => return store_fault(e),
        }
    }
    resp_int(found)
}

async fn cmd_type(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    match shared.objects.kind_of(&args[1]) {
        Ok(Some(kind)) => resp_simple(kind.type_name()),
        Ok(None) => resp_simple("none"),
        Err(e) => store_fault(e),
    }
}

async fn cmd_keys(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    let pattern = &args[1];
    let prefix = [keys::META_PREFIX, keys::SEP_LEFT];
    let iter = match scan_prefix(shared.store.as_ref(), &prefix, Direction::Forward) {
        Ok(iter) => iter,
        Err(e) => return store_fault(e),
    };
    let mut matched: Vec<Vec<u8>> = Vec::new();
    for item in iter {
        let (meta, _) = match item {
            Ok(kv) => kv,
            Err(e) => return store_fault(e),
        };
        let Some(logical) = keys::logical_key_from_meta(&meta) else {
            continue;
        };
        if key_pattern_match(pattern, logical) {
            matched.push(logical.to_vec());
        }
    }
    // The metadata region scans in key order, so the reply is already sorted.
    resp_array(&matched)
}

async fn cmd_info(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() > 2 {
        return wrong_args(&args[0]);
    }
    let info = format!(
        "# Server\r\nrole:master\r\ndata_dir:{}\r\n\r\n# Replication\r\nconnected_slaves:{}\r\nsync_enabled:{}\r\nsync_min_seq:{}\r\nsync_max_seq:{}\r\n",
        shared.data_dir,
        shared.slaves.count(),
        if shared.synclog.is_enabled() { 1 } else { 0 },
        shared.synclog.min_seq(),
        shared.synclog.max_seq(),
    );
    resp_bulk(info.as_bytes())
}

// ── Hashes ────────────────────────────────────────────────────────────────────

async fn cmd_hset(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() < 4 || (args.len() - 2) % 2 != 0 {
        return wrong_args(&args[0]);
    }
    let pairs: Vec<(Vec<u8>, Vec<u8>)> = args[2..]
        .chunks(2)
        .map(|chunk| (chunk[0].clone(), chunk[1].clone()))
        .collect();
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::Hash) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::Hash(h) = &mut *obj else {
        unreachable!()
    };
    match h.set(&pairs) {
        Ok(added) => {
            record_mutation(shared, args);
            resp_int(added)
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_hget(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 3 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::Hash) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::Hash(h) = &*obj else {
        unreachable!()
    };
    match h.get(&args[2]) {
        Ok(Some(value)) => resp_bulk(&value),
        Ok(None) => resp_null(),
        Err(e) => store_fault(e),
    }
}

async fn cmd_hmget(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() < 3 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::Hash) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::Hash(h) = &*obj else {
        unreachable!()
    };
    let mut out = Vec::new();
    append_array_header(&mut out, args.len() - 2);
    for field in &args[2..] {
        match h.get(field) {
            Ok(Some(value)) => append_bulk(&mut out, &value),
            Ok(None) => append_null(&mut out),
            Err(e) => return store_fault(e),
        }
    }
    out
}

async fn cmd_hgetall(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::Hash) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::Hash(h) = &*obj else {
        unreachable!()
    };
    match h.entries() {
        Ok(entries) => {
            let mut out = Vec::new();
            append_array_header(&mut out, entries.len() * 2);
            for (field, value) in entries {
                append_bulk(&mut out, &field);
                append_bulk(&mut out, &value);
            }
            out
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_hdel(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() < 3 {
        return wrong_args(&args[0]);
    }
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::Hash) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::Hash(h) = &mut *obj else {
        unreachable!()
    };
    match h.remove(&args[2..]) {
        Ok(removed) => {
            if removed > 0 {
                record_mutation(shared, args);
            }
            resp_int(removed)
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_hlen(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::Hash) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    resp_int(obj.len())
}

async fn cmd_hexists(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 3 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::Hash) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::Hash(h) = &*obj else {
        unreachable!()
    };
    match h.contains(&args[2]) {
        Ok(found) => resp_int(i64::from(found)),
        Err(e) => store_fault(e),
    }
}

async fn cmd_hkeys(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    hash_projection(args, shared, |field, _| field).await
}

async fn cmd_hvals(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    hash_projection(args, shared, |_, value| value).await
}

async fn hash_projection(
    args: &[Vec<u8>],
    shared: &Shared,
    pick: fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::Hash) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::Hash(h) = &*obj else {
        unreachable!()
    };
    match h.entries() {
        Ok(entries) => {
            let picked: Vec<Vec<u8>> = entries
                .into_iter()
                .map(|(field, value)| pick(field, value))
                .collect();
            resp_array(&picked)
        }
        Err(e) => store_fault(e),
    }
}

// ── Lists ─────────────────────────────────────────────────────────────────────

async fn cmd_push(args: &[Vec<u8>], shared: &Shared, front: bool) -> Vec<u8> {
    if args.len() < 3 {
        return wrong_args(&args[0]);
    }
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::List) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::List(l) = &mut *obj else {
        unreachable!()
    };
    let result = if front {
        l.push_front(&args[2..])
    } else {
        l.push_back(&args[2..])
    };
    match result {
        Ok(new_len) => {
            record_mutation(shared, args);
            resp_int(new_len)
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_pop(args: &[Vec<u8>], shared: &Shared, front: bool) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::List) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::List(l) = &mut *obj else {
        unreachable!()
    };
    let result = if front { l.pop_front() } else { l.pop_back() };
    match result {
        Ok(Some(value)) => {
            record_mutation(shared, args);
            resp_bulk(&value)
        }
        Ok(None) => resp_null(),
        Err(e) => store_fault(e),
    }
}

async fn cmd_llen(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::List) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    resp_int(obj.len())
}

async fn cmd_lrange(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 4 {
        return wrong_args(&args[0]);
    }
    let (Some(start), Some(stop)) = (parse_int(&args[2]), parse_int(&args[3])) else {
        return not_an_integer();
    };
    let cell = match grab(shared, &args[1], Kind::List) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::List(l) = &*obj else {
        unreachable!()
    };
    match l.range(start, stop) {
        Ok(values) => resp_array(&values),
        Err(e) => store_fault(e),
    }
}

async fn cmd_lindex(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 3 {
        return wrong_args(&args[0]);
    }
    let Some(index) = parse_int(&args[2]) else {
        return not_an_integer();
    };
    let cell = match grab(shared, &args[1], Kind::List) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::List(l) = &*obj else {
        unreachable!()
    };
    match l.index(index) {
        Ok(Some(value)) => resp_bulk(&value),
        Ok(None) => resp_null(),
        Err(e) => store_fault(e),
    }
}

// ── Sets ──────────────────────────────────────────────────────────────────────

async fn cmd_sadd(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() < 3 {
        return wrong_args(&args[0]);
    }
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::Set) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::Set(s) = &mut *obj else {
        unreachable!()
    };
    match s.add(&args[2..]) {
        Ok(added) => {
            if added > 0 {
                record_mutation(shared, args);
            }
            resp_int(added)
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_srem(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() < 3 {
        return wrong_args(&args[0]);
    }
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::Set) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::Set(s) = &mut *obj else {
        unreachable!()
    };
    match s.remove(&args[2..]) {
        Ok(removed) => {
            if removed > 0 {
                record_mutation(shared, args);
            }
            resp_int(removed)
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_smembers(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::Set) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::Set(s) = &*obj else {
        unreachable!()
    };
    match s.members() {
        Ok(members) => resp_array(&members),
        Err(e) => store_fault(e),
    }
}

async fn cmd_sismember(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 3 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::Set) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::Set(s) = &*obj else {
        unreachable!()
    };
    match s.contains(&args[2]) {
        Ok(found) => resp_int(i64::from(found)),
        Err(e) => store_fault(e),
    }
}

async fn cmd_scard(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::Set) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    resp_int(obj.len())
}

// ── Sorted sets ───────────────────────────────────────────────────────────────

async fn cmd_zadd(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() < 4 || (args.len() - 2) % 2 != 0 {
        return wrong_args(&args[0]);
    }
    let mut pairs = Vec::with_capacity((args.len() - 2) / 2);
    for chunk in args[2..].chunks(2) {
        // Scores are signed integers; floats are refused outright.
        let Some(score) = parse_int(&chunk[0]) else {
            return not_an_integer();
        };
        pairs.push((score, chunk[1].clone()));
    }
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::ZSet) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::ZSet(z) = &mut *obj else {
        unreachable!()
    };
    match z.add(&pairs) {
        Ok(added) => {
            record_mutation(shared, args);
            resp_int(added)
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_zscore(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 3 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::ZSet) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::ZSet(z) = &*obj else {
        unreachable!()
    };
    match z.score(&args[2]) {
        Ok(Some(score)) => resp_bulk(score.to_string().as_bytes()),
        Ok(None) => resp_null(),
        Err(e) => store_fault(e),
    }
}

async fn cmd_zincrby(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 4 {
        return wrong_args(&args[0]);
    }
    let Some(delta) = parse_int(&args[2]) else {
        return not_an_integer();
    };
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::ZSet) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::ZSet(z) = &mut *obj else {
        unreachable!()
    };
    match z.incr_by(&args[3], delta) {
        Ok(score) => {
            record_mutation(shared, args);
            resp_bulk(score.to_string().as_bytes())
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_zcard(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::ZSet) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    resp_int(obj.len())
}

async fn cmd_zrank(args: &[Vec<u8>], shared: &Shared, high_to_low: bool) -> Vec<u8> {
    if args.len() != 3 {
        return wrong_args(&args[0]);
    }
    let cell = match grab(shared, &args[1], Kind::ZSet) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::ZSet(z) = &*obj else {
        unreachable!()
    };
    match z.rank(&args[2], high_to_low) {
        Ok(Some(rank)) => resp_int(rank),
        Ok(None) => resp_null(),
        Err(e) => store_fault(e),
    }
}

async fn cmd_zrange(args: &[Vec<u8>], shared: &Shared, high_to_low: bool) -> Vec<u8> {
    if args.len() != 4 && args.len() != 5 {
        return wrong_args(&args[0]);
    }
    let (Some(start), Some(stop)) = (parse_int(&args[2]), parse_int(&args[3])) else {
        return not_an_integer();
    };
    let withscores = match args.get(4) {
        None => false,
        Some(flag) if flag.eq_ignore_ascii_case(b"withscores") => true,
        Some(_) => return resp_err("syntax error"),
    };
    let cell = match grab(shared, &args[1], Kind::ZSet) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::ZSet(z) = &*obj else {
        unreachable!()
    };
    let Some((start, stop)) = normalize_window(start, stop, z.len()) else {
        return resp_array(&[]);
    };
    match z.range_by_index(start, stop, high_to_low) {
        Ok(pairs) => score_member_reply(&pairs, withscores),
        Err(e) => store_fault(e),
    }
}

async fn cmd_zrangebyscore(args: &[Vec<u8>], shared: &Shared, high_to_low: bool) -> Vec<u8> {
    if args.len() < 4 {
        return wrong_args(&args[0]);
    }
    // ZREVRANGEBYSCORE takes its bounds as (max, min).
    let (min_arg, max_arg) = if high_to_low {
        (&args[3], &args[2])
    } else {
        (&args[2], &args[3])
    };
    let (Some(min), Some(max)) = (parse_score_bound(min_arg), parse_score_bound(max_arg)) else {
        return resp_err("min or max is not an integer");
    };

    let mut withscores = false;
    let mut offset = 0i64;
    let mut count = -1i64;
    let mut i = 4;
    while i < args.len() {
        if args[i].eq_ignore_ascii_case(b"withscores") {
            withscores = true;
            i += 1;
        } else if args[i].eq_ignore_ascii_case(b"limit") && i + 2 < args.len() {
            let (Some(parsed_offset), Some(parsed_count)) =
                (parse_int(&args[i + 1]), parse_int(&args[i + 2]))
            else {
                return not_an_integer();
            };
            offset = parsed_offset.max(0);
            count = parsed_count;
            i += 3;
        } else {
            return resp_err("syntax error");
        }
    }

    let cell = match grab(shared, &args[1], Kind::ZSet) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let obj = cell.lock().await;
    let Object::ZSet(z) = &*obj else {
        unreachable!()
    };
    // Negative count means "all remaining", matching Redis.
    let count = if count < 0 { -1 } else { count };
    match z.range_by_score(min, max, offset, count, high_to_low) {
        Ok(pairs) => score_member_reply(&pairs, withscores),
        Err(e) => store_fault(e),
    }
}

async fn cmd_zrem(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() < 3 {
        return wrong_args(&args[0]);
    }
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::ZSet) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::ZSet(z) = &mut *obj else {
        unreachable!()
    };
    match z.remove(&args[2..]) {
        Ok(removed) => {
            if removed > 0 {
                record_mutation(shared, args);
            }
            resp_int(removed)
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_zremrangebyrank(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 4 {
        return wrong_args(&args[0]);
    }
    let (Some(start), Some(stop)) = (parse_int(&args[2]), parse_int(&args[3])) else {
        return not_an_integer();
    };
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::ZSet) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::ZSet(z) = &mut *obj else {
        unreachable!()
    };
    let Some((start, stop)) = normalize_window(start, stop, z.len()) else {
        return resp_int(0);
    };
    match z.remove_by_index(start, stop) {
        Ok(removed) => {
            if removed > 0 {
                record_mutation(shared, args);
            }
            resp_int(removed)
        }
        Err(e) => store_fault(e),
    }
}

async fn cmd_zremrangebyscore(args: &[Vec<u8>], shared: &Shared) -> Vec<u8> {
    if args.len() != 4 {
        return wrong_args(&args[0]);
    }
    let (Some(min), Some(max)) = (
        parse_score_bound(&args[2]),
        parse_score_bound(&args[3]),
    ) else {
        return resp_err("min or max is not an integer");
    };
    let _pass = shared.gate.pass().await;
    let cell = match grab(shared, &args[1], Kind::ZSet) {
        Ok(c) => c,
        Err(reply) => return reply,
    };
    let mut obj = cell.lock().await;
    let Object::ZSet(z) = &mut *obj else {
        unreachable!()
    };
    match z.remove_by_score(min, max) {
        Ok(removed) => {
            if removed > 0 {
                record_mutation(shared, args);
            }
            resp_int(removed)
        }
        Err(e) => store_fault(e),
    }
}

// ── Replication handshake ─────────────────────────────────────────────────────

/// `SYNC [uid] [seq]` — absent or negative seq requests a full resync.
fn cmd_sync(args: &[Vec<u8>]) -> Outcome {
    let seq = match args.get(2) {
        None => -1,
        Some(raw) => match parse_int(raw) {
            Some(seq) => seq,
            None => return Outcome::Reply(resp_err_tag("bad [SEQ]")),
        },
    };
    Outcome::Sync { seq }
}

// ── Key pattern matching ──────────────────────────────────────────────────────

/// Membership test against a bracket expression body (the bytes between `[`
/// and `]`): leading `^`/`!` inverts, `a-c` spans a byte range.
fn bracket_match(spec: &[u8], ch: u8) -> bool {
    let (invert, body) = match spec.split_first() {
        Some((b'^' | b'!', rest)) => (true, rest),
        _ => (false, spec),
    };
    let mut hit = false;
    let mut i = 0;
    while i < body.len() {
        if body.len() >= i + 3 && body[i + 1] == b'-' {
            hit |= (body[i]..=body[i + 2]).contains(&ch);
            i += 3;
        } else {
            hit |= body[i] == ch;
            i += 1;
        }
    }
    hit != invert
}

/// Redis KEYS-style pattern match (`*`, `?`, `[...]`), iterative with
/// single-star backtracking: on a mismatch, rewind to just past the most
/// recent `*` and let it swallow one more key byte.
fn key_pattern_match(pattern: &[u8], key: &[u8]) -> bool {
    let (mut p, mut k) = (0usize, 0usize);
    let mut rewind: Option<(usize, usize)> = None;
    while k < key.len() {
        if p < pattern.len() {
            let step = match pattern[p] {
                b'*' => {
                    rewind = Some((p, k));
                    p += 1;
                    continue;
                }
                b'?' => 1,
                b'[' => match pattern[p + 1..].iter().position(|&b| b == b']') {
                    Some(close) if bracket_match(&pattern[p + 1..p + 1 + close], key[k]) => {
                        close + 2
                    }
                    // An unterminated `[` only matches itself.
                    None if key[k] == b'[' => 1,
                    _ => 0,
                },
                lit if lit == key[k] => 1,
                _ => 0,
            };
            if step > 0 {
                p += step;
                k += 1;
                continue;
            }
        }
        match rewind {
            None => return false,
            Some((star, from)) => {
                rewind = Some((star, from + 1));
                p = star + 1;
                k = from + 1;
            }
        }
    }
    pattern[p..].iter().all(|&b| b == b'*')
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

pub(crate) async fn dispatch(args: &[Vec<u8>], shared: &Shared) -> Outcome {
    let cmd = String::from_utf8_lossy(&args[0]).to_ascii_lowercase();
    let start = Instant::now();
    let reply = match cmd.as_str() {
        "ping" => resp_pong(),
        "echo" => {
            if args.len() == 2 {
                resp_bulk(&args[1])
            } else {
                wrong_args(&args[0])
            }
        }
        "quit" => return Outcome::Quit(resp_ok()),
        "sync" => return cmd_sync(args),

        "set" => cmd_set(args, shared).await,
        "get" => cmd_get(args, shared).await,
        "incr" => cmd_incr(args, shared).await,
        "incrby" => cmd_incrby(args, shared).await,
        "decr" => cmd_decr(args, shared).await,

        "del" => cmd_del(args, shared).await,
        "exists" => cmd_exists(args, shared).await,
        "type" => cmd_type(args, shared).await,
        "keys" => cmd_keys(args, shared).await,
        "info" => cmd_info(args, shared).await,

        "hset" => cmd_hset(args, shared).await,
        "hget" => cmd_hget(args, shared).await,
        "hmget" => cmd_hmget(args, shared).await,
        "hgetall" => cmd_hgetall(args, shared).await,
        "hdel" => cmd_hdel(args, shared).await,
        "hlen" => cmd_hlen(args, shared).await,
        "hexists" => cmd_hexists(args, shared).await,
        "hkeys" => cmd_hkeys(args, shared).await,
        "hvals" => cmd_hvals(args, shared).await,

        "lpush" => cmd_push(args, shared, true).await,
        "rpush" => cmd_push(args, shared, false).await,
        "lpop" => cmd_pop(args, shared, true).await,
        "rpop" => cmd_pop(args, shared, false).await,
        "llen" => cmd_llen(args, shared).await,
        "lrange" => cmd_lrange(args, shared).await,
        "lindex" => cmd_lindex(args, shared).await,

        "sadd" => cmd_sadd(args, shared).await,
        "srem" => cmd_srem(args, shared).await,
        "smembers" => cmd_smembers(args, shared).await,
        "sismember" => cmd_sismember(args, shared).await,
        "scard" => cmd_scard(args, shared).await,

        "zadd" => cmd_zadd(args, shared).await,
        "zscore" => cmd_zscore(args, shared).await,
        "zincrby" => cmd_zincrby(args, shared).await,
        "zcard" => cmd_zcard(args, shared).await,
        "zrank" => cmd_zrank(args, shared, false).await,
        "zrevrank" => cmd_zrank(args, shared, true).await,
        "zrange" => cmd_zrange(args, shared, false).await,
        "zrevrange" => cmd_zrange(args, shared, true).await,
        "zrangebyscore" => cmd_zrangebyscore(args, shared, false).await,
        "zrevrangebyscore" => cmd_zrangebyscore(args, shared, true).await,
        "zrem" => cmd_zrem(args, shared).await,
        "zremrangebyrank" => cmd_zremrangebyrank(args, shared).await,
        "zremrangebyscore" => cmd_zremrangebyscore(args, shared).await,

        _ => resp_err(&format!(
            "unknown command {}",
            String::from_utf8_lossy(&args[0])
        )),
    };
    metrics::histogram!("shale_command_duration_seconds", "command" => cmd)
        .record(start.elapsed().as_secs_f64());
    Outcome::Reply(reply)
}
