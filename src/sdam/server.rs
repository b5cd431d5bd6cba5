use std::sync::atomic::{AtomicU32, Ordering};

use crate::{client::options::ClientOptions, cmap::ConnectionPool, options::ServerAddress};

/// Contains the state for a given server in the topology: its connection pool and the count of
/// operations currently routed to it.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    /// The connection pool for the server.
    pool: ConnectionPool,

    /// Number of operations currently using this server.
    operation_count: AtomicU32,
}

impl Server {
    pub(crate) fn new(address: ServerAddress, options: &ClientOptions) -> Self {
        Self {
            pool: ConnectionPool::new(address.clone(), options),
            address,
            operation_count: AtomicU32::new(0),
        }
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub(crate) fn increment_operation_count(&self) {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_operation_count(&self) {
        self.operation_count.fetch_sub(1, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub(crate) fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::SeqCst)
    }
}
