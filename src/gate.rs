use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Process-wide write gate used by replication bootstrap.
///
/// Every mutating command holds a shared pass across its store commit and its
/// sync-log append; the replicator takes the exclusive side just long enough
/// to pin a snapshot and note the log sequence. tokio's writer preference
/// gives the required behaviour: in-flight passes finish, new ones queue
/// behind the suspend. Readers never touch the gate.
///
/// One suspend holder at a time; a holder must not suspend again.
#[derive(Default)]
pub(crate) struct SuspendGate {
    gate: RwLock<()>,
}

impl SuspendGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Shared pass for one mutating command. Blocks while suspended.
    pub(crate) async fn pass(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Exclusive pass: resolves once every in-flight mutator has finished,
    /// and holds all new ones until the guard drops.
    pub(crate) async fn suspend(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }
}
