//! Consumer-side listener for producer connections.

use super::assembler::BatchAssembler;
use crate::{Error, Result};
use skyfill_core::CommitMessage;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixListener;

/// Read commit lines from one producer connection until it closes.
///
/// At end of stream any pending rows are flushed. A malformed line ends the
/// connection with [`Error::Protocol`]; other connections are unaffected.
pub async fn serve_connection<R>(assembler: &BatchAssembler, reader: R, peer: &str) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut received = 0u64;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match CommitMessage::parse_line(&line) {
            Ok(message) => message,
            Err(e) => {
                metrics::counter!("consumer_protocol_errors_total").increment(1);
                tracing::error!("Protocol error from {}, closing connection: {}", peer, e);
                assembler.finish().await;
                return Err(Error::Protocol(format!("{peer}: {e}")));
            }
        };
        assembler.push(message).await;
        received += 1;
    }

    tracing::info!("Connection {} closed after {} records", peer, received);
    assembler.finish().await;
    Ok(received)
}

/// Bind a Unix socket at `path`, replacing a stale socket file.
pub fn bind_unix(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!("Listening on {}", path.display());
    Ok(listener)
}

/// Accept producer connections until `running` is cleared, serving each on
/// its own task.
pub async fn serve(
    listener: UnixListener,
    assembler: Arc<BatchAssembler>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let mut next_id = 0u64;
    let mut connections = tokio::task::JoinSet::new();

    while running.load(Ordering::SeqCst) {
        let accepted =
            match tokio::time::timeout(Duration::from_millis(500), listener.accept()).await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };
        let (stream, _) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                continue;
            }
        };

        next_id += 1;
        let peer = format!("producer-{next_id}");
        tracing::info!("Accepted connection {}", peer);

        let assembler = Arc::clone(&assembler);
        connections.spawn(async move {
            if let Err(e) = serve_connection(&assembler, stream, &peer).await {
                tracing::warn!("Connection {} ended with error: {}", peer, e);
            }
        });

        while connections.try_join_next().is_some() {}
    }

    tracing::info!("Stopped accepting, flushing pending rows");
    connections.abort_all();
    while connections.join_next().await.is_some() {}
    assembler.finish().await;
    Ok(())
}
