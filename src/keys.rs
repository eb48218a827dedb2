use crate::error::{DbError, DbResult};

// ── Key space layout ──────────────────────────────────────────────────────────
//
// Every physical key starts with a one-byte region prefix, so range scans
// never cross kinds. For a logical key `k`:
//
//   +[k]              metadata: kind tag byte, then cardinality as decimal text
//   _[k]              string value
//   h[k]<field>       hash field
//   l[k]<ord64(i)>    list element at signed position i
//   s[k]<member>      set member (empty value)
//   z[k]m#<member>    zset member index: member -> ord64(score)
//   z[k]s#<ord64(score)>#<member>   zset score index (empty value)
//
// `__shale:` is the reserved internal namespace (sync log bookkeeping); the
// replicator skips it when streaming snapshots.

pub(crate) const SEP_LEFT: u8 = b'[';
pub(crate) const SEP_RIGHT: u8 = b']';
pub(crate) const SEP: u8 = b'#';
/// Strictly greater than any payload byte we emit; appended to a prefix or an
/// upper endpoint to make lexicographic scans inclusive of longer suffixes.
pub(crate) const MAXBYTE: u8 = 0xff;

pub(crate) const META_PREFIX: u8 = b'+';
pub(crate) const STRING_PREFIX: u8 = b'_';
pub(crate) const HASH_PREFIX: u8 = b'h';
pub(crate) const LIST_PREFIX: u8 = b'l';
pub(crate) const SET_PREFIX: u8 = b's';
pub(crate) const ZSET_PREFIX: u8 = b'z';

pub(crate) const RESERVED_PREFIX: &[u8] = b"__shale:";

fn bracketed(region: u8, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 3);
    out.push(region);
    out.push(SEP_LEFT);
    out.extend_from_slice(key);
    out.push(SEP_RIGHT);
    out
}

pub(crate) fn meta_key(key: &[u8]) -> Vec<u8> {
    bracketed(META_PREFIX, key)
}

/// Recover the logical key from a metadata key, if it is well-formed.
pub(crate) fn logical_key_from_meta(meta: &[u8]) -> Option<&[u8]> {
    let body = meta.strip_prefix(&[META_PREFIX, SEP_LEFT][..])?;
    body.strip_suffix(&[SEP_RIGHT][..])
}

pub(crate) fn string_key(key: &[u8]) -> Vec<u8> {
    bracketed(STRING_PREFIX, key)
}

pub(crate) fn hash_prefix(key: &[u8]) -> Vec<u8> {
    bracketed(HASH_PREFIX, key)
}

pub(crate) fn hash_field_key(key: &[u8], field: &[u8]) -> Vec<u8> {
    let mut out = hash_prefix(key);
    out.extend_from_slice(field);
    out
}

pub(crate) fn list_prefix(key: &[u8]) -> Vec<u8> {
    bracketed(LIST_PREFIX, key)
}

pub(crate) fn list_elem_key(key: &[u8], index: i64) -> Vec<u8> {
    let mut out = list_prefix(key);
    out.extend_from_slice(&encode_ord64(index));
    out
}

pub(crate) fn set_prefix(key: &[u8]) -> Vec<u8> {
    bracketed(SET_PREFIX, key)
}

pub(crate) fn set_member_key(key: &[u8], member: &[u8]) -> Vec<u8> {
    let mut out = set_prefix(key);
    out.extend_from_slice(member);
    out
}

pub(crate) fn zset_prefix(key: &[u8]) -> Vec<u8> {
    bracketed(ZSET_PREFIX, key)
}

pub(crate) fn zset_member_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = zset_prefix(key);
    out.push(b'm');
    out.push(SEP);
    out
}

pub(crate) fn zset_member_key(key: &[u8], member: &[u8]) -> Vec<u8> {
    let mut out = zset_member_prefix(key);
    out.extend_from_slice(member);
    out
}

pub(crate) fn zset_score_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = zset_prefix(key);
    out.push(b's');
    out.push(SEP);
    out
}

pub(crate) fn zset_score_key(key: &[u8], member: &[u8], score: i64) -> Vec<u8> {
    let mut out = zset_score_prefix(key);
    out.extend_from_slice(&encode_ord64(score));
    out.push(SEP);
    out.extend_from_slice(member);
    out
}

/// Append `MAXBYTE` so the result bounds every key extending `lower_or_prefix`.
pub(crate) fn upper_bound(mut lower_or_prefix: Vec<u8>) -> Vec<u8> {
    lower_or_prefix.push(MAXBYTE);
    lower_or_prefix
}

// ── Order-preserving i64 encoding ─────────────────────────────────────────────

pub(crate) const ORD64_LEN: usize = 9;

/// Sign byte (`'0'` negative, `'1'` otherwise) followed by the 8 big-endian
/// two's-complement bytes. Within each sign class two's complement already
/// sorts numerically, so byte comparison equals numeric comparison over the
/// full i64 range.
pub(crate) fn encode_ord64(n: i64) -> [u8; ORD64_LEN] {
    let mut out = [0u8; ORD64_LEN];
    out[0] = if n < 0 { b'0' } else { b'1' };
    out[1..].copy_from_slice(&n.to_be_bytes());
    out
}

pub(crate) fn decode_ord64(bytes: &[u8]) -> DbResult<i64> {
    if bytes.len() != ORD64_LEN {
        return Err(DbError::CorruptKey(format!(
            "ord64 length {} (want {ORD64_LEN})",
            bytes.len()
        )));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[1..]);
    let n = i64::from_be_bytes(raw);
    let expected_sign = if n < 0 { b'0' } else { b'1' };
    if bytes[0] != expected_sign {
        return Err(DbError::CorruptKey(format!(
            "ord64 sign byte {:#04x} disagrees with value {n}",
            bytes[0]
        )));
    }
    Ok(n)
}

/// Split a zset score-index key into `(score, member)`.
///
/// `prefix_len` is the length of the score-index prefix the key was scanned
/// under. The layout after it is fixed width — ord64 score, `SEP`, member —
/// so the split is exact even when the member itself contains `SEP`.
pub(crate) fn split_score_key(prefix_len: usize, key: &[u8]) -> DbResult<(i64, Vec<u8>)> {
    let suffix = key.get(prefix_len..).ok_or_else(|| {
        DbError::CorruptKey(format!("score key shorter than its prefix: {key:?}"))
    })?;
    if suffix.len() < ORD64_LEN + 1 {
        return Err(DbError::CorruptKey(format!(
            "score key suffix too short: {suffix:?}"
        )));
    }
    let score = decode_ord64(&suffix[..ORD64_LEN])?;
    if suffix[ORD64_LEN] != SEP {
        return Err(DbError::CorruptKey(format!(
            "score key missing member separator: {suffix:?}"
        )));
    }
    Ok((score, suffix[ORD64_LEN + 1..].to_vec()))
}
