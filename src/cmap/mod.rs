pub(crate) mod conn;
pub(crate) mod establish;

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    client::options::{ClientOptions, TlsOptions},
    error::Result,
    options::ServerAddress,
};

pub(crate) use self::{
    conn::{Command, Connection, ConnectionInfo, LegacyWireMessage, RawCommandResponse},
    establish::{establish_connection, Handshaker},
};
pub(crate) use conn::StreamDescription;

const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A pool of connections to a single endpoint. Connections are checked out exclusively and
/// returned when dropped; broken or stale connections are discarded on the way back in.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    available: Mutex<VecDeque<Connection>>,
    semaphore: Arc<Semaphore>,

    /// Incremented whenever the pool is cleared; connections from an older generation are
    /// discarded rather than reused.
    generation: AtomicU32,

    handshaker: Handshaker,
    connect_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
    max_idle_time: Option<Duration>,
    tls_options: Option<TlsOptions>,
}

impl ConnectionPool {
    pub(crate) fn new(address: ServerAddress, options: &ClientOptions) -> Self {
        let max_pool_size = options.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE);

        Self {
            address,
            inner: Arc::new(PoolInner {
                available: Mutex::new(VecDeque::new()),
                semaphore: Arc::new(Semaphore::new(max_pool_size as usize)),
                generation: AtomicU32::new(0),
                handshaker: Handshaker::new(options),
                connect_timeout: options.connect_timeout,
                socket_timeout: options.socket_timeout,
                max_idle_time: options.max_idle_time,
                tls_options: options.tls_options(),
            }),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Checks out a connection, waiting for one to become available when the pool is at its
    /// maximum size, and establishing a fresh one when the pool is empty.
    pub(crate) async fn check_out(&self) -> Result<PooledConnection> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| crate::error::Error::internal("connection pool closed"))?;

        let generation = self.generation();

        loop {
            let conn = self.inner.available.lock().unwrap().pop_back();
            match conn {
                Some(conn)
                    if conn.generation != generation
                        || conn.has_errored()
                        || conn.is_idle(self.inner.max_idle_time) =>
                {
                    tracing::debug!(address = %self.address, id = conn.id, "discarding stale pooled connection");
                    continue;
                }
                Some(mut conn) => {
                    conn.mark_checked_out();
                    return Ok(PooledConnection {
                        conn: Some(conn),
                        pool: Arc::clone(&self.inner),
                        _permit: permit,
                    });
                }
                None => break,
            }
        }

        tracing::debug!(address = %self.address, "establishing new pooled connection");
        let (conn, _) = establish_connection(
            &self.inner.handshaker,
            self.address.clone(),
            generation,
            self.inner.connect_timeout,
            self.inner.socket_timeout,
            self.inner.tls_options.as_ref(),
        )
        .await?;

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Clears the pool: subsequent check-ins of connections established before the clear are
    /// discarded.
    pub(crate) fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.available.lock().unwrap().clear();
        tracing::debug!(address = %self.address, "connection pool cleared");
    }
}

/// A connection checked out from a pool. Dereferences to the underlying [`Connection`]; when
/// dropped, healthy connections return to the pool and broken ones are closed.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let current_generation = self.pool.generation.load(Ordering::SeqCst);
            if !conn.has_errored() && conn.generation == current_generation {
                conn.mark_checked_in();
                self.pool.available.lock().unwrap().push_back(conn);
            }
        }
    }
}
