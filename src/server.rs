use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

use crate::commands::{dispatch, Outcome};
use crate::error::DbResult;
use crate::gate::SuspendGate;
use crate::object::Registry;
use crate::replica::{self, SlaveRegistry};
use crate::resp::{read_command_with, WireLimits};
use crate::store::StoreAdapter;
use crate::synclog::SyncLog;

/// Everything a session needs, built once at startup and injected everywhere
/// (no process-wide statics, so tests run servers side by side).
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn StoreAdapter>,
    pub(crate) objects: Registry,
    pub(crate) synclog: Arc<SyncLog>,
    pub(crate) gate: SuspendGate,
    pub(crate) slaves: SlaveRegistry,
    /// Where the store lives on disk; surfaced through INFO.
    pub(crate) data_dir: String,
}

impl Shared {
    pub(crate) fn new(
        store: Arc<dyn StoreAdapter>,
        sync_log_cap: u64,
        data_dir: String,
    ) -> DbResult<Arc<Self>> {
        let synclog = SyncLog::open(Arc::clone(&store), sync_log_cap)?;
        Ok(Arc::new(Self {
            objects: Registry::new(Arc::clone(&store)),
            synclog,
            gate: SuspendGate::new(),
            slaves: SlaveRegistry::new(),
            store,
            data_dir,
        }))
    }
}

#[derive(Clone, Copy)]
pub(crate) struct ServerLimits {
    pub wire: WireLimits,
}

pub(crate) async fn handle_connection(
    stream: TcpStream,
    shared: Arc<Shared>,
    limits: ServerLimits,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    // Disable Nagle: send responses immediately rather than waiting to coalesce small writes.
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(64 * 1024, read_half);
    // BufWriter accumulates responses; we flush only when no more pipelined
    // commands are buffered, collapsing N pipelined writes into one syscall.
    let mut writer = BufWriter::with_capacity(64 * 1024, write_half);
    loop {
        match read_command_with(&mut reader, limits.wire).await {
            Ok(None) => break,
            Ok(Some(args)) if args.is_empty() => continue,
            Ok(Some(args)) => match dispatch(&args, &shared).await {
                Outcome::Reply(response) => {
                    if writer.write_all(&response).await.is_err() {
                        break;
                    }
                    // Only flush when the read buffer is drained: pipelined commands share a flush.
                    if reader.buffer().is_empty() && writer.flush().await.is_err() {
                        break;
                    }
                }
                Outcome::Quit(response) => {
                    if writer.write_all(&response).await.is_ok() {
                        let _ = writer.flush().await;
                    }
                    break;
                }
                // SYNC hands the connection over to the replicator; nothing
                // else is ever served on it.
                Outcome::Sync { seq } => {
                    if writer.flush().await.is_err() {
                        break;
                    }
                    replica::serve(&mut writer, &peer, &shared, seq).await;
                    break;
                }
            },
            Err(e) => {
                debug!(error = %e, "parse error, closing connection");
                break;
            }
        }
    }
}
