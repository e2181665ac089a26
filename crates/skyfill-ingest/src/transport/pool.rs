//! Fixed-size pool of persistent producer → consumer connections.
//!
//! Connections are established eagerly and never re-established: a
//! connection that fails a write is dropped and its slot is gone for the rest
//! of the run. At any instant
//!
//! ```text
//! idle + active + lost == size
//! ```
//!
//! Callers must size the pool to at least their own concurrency bound so that
//! [`ConnectionPool::checkout`] never finds the idle set empty, and must not
//! cancel a [`PooledConnection::write_line`] in progress: a cancelled write
//! loses its slot.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

/// Point-in-time view of a pool's slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub active: usize,
    pub lost: usize,
}

/// A set of long-lived connections to one endpoint.
pub struct ConnectionPool<C> {
    endpoint: String,
    size: usize,
    idle: Mutex<Vec<C>>,
    active: AtomicUsize,
    lost: AtomicUsize,
}

impl ConnectionPool<UnixStream> {
    /// Open `size` connections to the Unix socket at `path`.
    pub async fn connect_unix(path: impl AsRef<Path>, size: usize) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            conns.push(UnixStream::connect(path).await?);
        }
        tracing::info!("Opened {} connections to {}", size, path.display());
        Ok(Self::from_connections(path.display().to_string(), conns))
    }
}

impl<C> ConnectionPool<C>
where
    C: AsyncWrite + Unpin + Send,
{
    /// Wrap already-established connections.
    pub fn from_connections(endpoint: impl Into<String>, conns: Vec<C>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.into(),
            size: conns.len(),
            idle: Mutex::new(conns),
            active: AtomicUsize::new(0),
            lost: AtomicUsize::new(0),
        })
    }

    /// Take an idle connection. It returns to the pool when the guard drops.
    pub fn checkout(self: &Arc<Self>) -> Result<PooledConnection<C>> {
        let conn = {
            let mut idle = self.idle.lock();
            let conn = idle.pop();
            if conn.is_some() {
                // Counted while the lock is held so stats never see the
                // connection in neither set.
                self.active.fetch_add(1, Ordering::SeqCst);
            }
            conn
        };

        match conn {
            Some(conn) => Ok(PooledConnection {
                pool: Arc::clone(self),
                conn: Some(conn),
                broken: false,
            }),
            None => Err(Error::PoolExhausted {
                endpoint: self.endpoint.clone(),
                lost: self.lost.load(Ordering::SeqCst),
            }),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock();
        PoolStats {
            size: self.size,
            idle: idle.len(),
            active: self.active.load(Ordering::SeqCst),
            lost: self.lost.load(Ordering::SeqCst),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn release(&self, conn: Option<C>, broken: bool) {
        let mut idle = self.idle.lock();
        self.active.fetch_sub(1, Ordering::SeqCst);
        match conn {
            Some(conn) if !broken => idle.push(conn),
            _ => {
                let lost = self.lost.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::error!(
                    "Connection to {} lost ({}/{} slots gone)",
                    self.endpoint,
                    lost,
                    self.size
                );
            }
        }
    }
}

/// A checked-out connection.
///
/// Dropping it releases the connection on every exit path, including task
/// cancellation. A connection dropped in the middle of a write may hold a
/// partial line, so it is discarded rather than reused.
pub struct PooledConnection<C>
where
    C: AsyncWrite + Unpin + Send,
{
    pool: Arc<ConnectionPool<C>>,
    conn: Option<C>,
    broken: bool,
}

impl<C> PooledConnection<C>
where
    C: AsyncWrite + Unpin + Send,
{
    /// Write one complete line and wait for it to be flushed.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::PoolExhausted {
                endpoint: self.pool.endpoint.clone(),
                lost: self.pool.lost.load(Ordering::SeqCst),
            });
        };

        self.broken = true;
        conn.write_all(line.as_bytes()).await?;
        conn.flush().await?;
        self.broken = false;
        Ok(())
    }
}

impl<C> Drop for PooledConnection<C>
where
    C: AsyncWrite + Unpin + Send,
{
    fn drop(&mut self) {
        self.pool.release(self.conn.take(), self.broken);
    }
}
