use thiserror::Error;

/// Faults surfaced by the storage layer and the key codec.
///
/// Command-level problems (wrong argument count, non-integer values) never
/// reach this type; they are answered directly with a RESP error and the
/// session continues. `DbError` means the durable state itself misbehaved.
#[derive(Debug, Error)]
pub(crate) enum DbError {
    #[error("store open failed: {0}")]
    Open(String),

    #[error("store read failed: {0}")]
    Read(String),

    #[error("store write failed: {0}")]
    Write(String),

    #[error("snapshot failed: {0}")]
    Snapshot(String),

    /// A physical key did not decode under the layout that wrote it.
    /// Indicates store corruption, not a client mistake.
    #[error("corrupt key encoding: {0}")]
    CorruptKey(String),

    /// A sync-log read below the retained window; the slave must resync.
    #[error("sequence {seq} below log window start {min}")]
    SeqBelowWindow { seq: u64, min: u64 },
}

pub(crate) type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_sequence_bounds() {
        let e = DbError::SeqBelowWindow { seq: 5, min: 10 };
        assert_eq!(e.to_string(), "sequence 5 below log window start 10");
    }
}
