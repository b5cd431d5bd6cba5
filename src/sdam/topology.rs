use std::{
    collections::{HashMap, HashSet},
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        RwLock,
        Weak,
    },
    time::{Duration, Instant},
};

use tokio::sync::{watch, Mutex as AsyncMutex, Notify};

use super::{
    description::{
        server::ServerDescription,
        topology::{TopologyDescription, TopologyType},
    },
    monitor::Monitor,
    server::Server,
};
use crate::{
    client::{options::ClientOptions, session::ClusterTime},
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
};

pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The driver's view of the deployment: the topology description, a `Server` handle (with its
/// connection pool) per member, and the monitors keeping the description fresh. Updates
/// serialize through a single async lock and are published through a watch channel that
/// server selection waits on.
#[derive(Clone, Debug)]
pub(crate) struct Topology {
    inner: Arc<TopologyInner>,
}

#[derive(Debug)]
struct TopologyInner {
    watch_tx: watch::Sender<Arc<TopologyDescription>>,
    watch_rx: watch::Receiver<Arc<TopologyDescription>>,

    /// Serializes all description updates.
    update_lock: AsyncMutex<()>,

    servers: RwLock<HashMap<ServerAddress, Arc<Server>>>,
    monitors: RwLock<HashMap<ServerAddress, Arc<Notify>>>,

    options: ClientOptions,
    is_alive: AtomicBool,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Self> {
        let mut description = TopologyDescription::default();
        description.initialize(&options);

        let (watch_tx, watch_rx) = watch::channel(Arc::new(description.clone()));

        let topology = Self {
            inner: Arc::new(TopologyInner {
                watch_tx,
                watch_rx,
                update_lock: AsyncMutex::new(()),
                servers: RwLock::new(HashMap::new()),
                monitors: RwLock::new(HashMap::new()),
                options,
                is_alive: AtomicBool::new(true),
            }),
        };

        topology.sync_server_handles(&description);

        Ok(topology)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.is_alive.load(Ordering::SeqCst)
    }

    /// Stops all monitoring tasks. Pools are dropped along with their servers.
    pub(crate) fn shutdown(&self) {
        self.inner.is_alive.store(false, Ordering::SeqCst);
        for notify in self.inner.monitors.read().unwrap().values() {
            notify.notify_waiters();
        }
    }

    pub(crate) fn watcher(&self) -> TopologyWatcher {
        TopologyWatcher {
            receiver: self.inner.watch_rx.clone(),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakTopology {
        WeakTopology {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The latest published topology description.
    pub(crate) fn description(&self) -> Arc<TopologyDescription> {
        self.inner.watch_rx.borrow().clone()
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.description().topology_type
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.description().cluster_time.clone()
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.description().logical_session_timeout
    }

    /// Whether the deployment is known to support logical sessions. Sessions are supported
    /// once any data-bearing server has reported a logical session timeout.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.description().logical_session_timeout.is_some()
    }

    pub(crate) fn get_server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.inner.servers.read().unwrap().get(address).cloned()
    }

    pub(crate) fn server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<ServerDescription> {
        self.description().servers.get(address).cloned()
    }

    /// Incorporates a monitor's check result into the topology description, waking up any
    /// waiting server selection operations if the description changed. Returns whether the
    /// description changed.
    pub(crate) async fn update(&self, server_description: ServerDescription) -> bool {
        let _guard = self.inner.update_lock.lock().await;

        let mut description = self.description().deref().clone();
        let previous = description.clone();

        if let Err(e) = description.update(server_description) {
            tracing::warn!(error = %e, "ignoring invalid topology update");
            return false;
        }

        if description == previous {
            // Still publish so selection deadlines observe fresh heartbeats, but skip handle
            // churn.
            let _ = self.inner.watch_tx.send(Arc::new(description));
            return false;
        }

        tracing::debug!(topology = %description, "topology changed");
        self.sync_server_handles(&description);
        let _ = self.inner.watch_tx.send(Arc::new(description));
        true
    }

    /// Merges a cluster time gossiped on a command reply into the topology's maximum.
    pub(crate) async fn advance_cluster_time(&self, cluster_time: &ClusterTime) {
        let _guard = self.inner.update_lock.lock().await;
        let mut description = self.description().deref().clone();
        description.advance_cluster_time(cluster_time);
        let _ = self.inner.watch_tx.send(Arc::new(description));
    }

    /// Replaces the set of hosts in the topology, preserving the descriptions, pools and
    /// monitors of servers present in both the old and new sets. Driven by SRV polling.
    pub(crate) async fn sync_hosts(&self, hosts: HashSet<ServerAddress>) {
        let _guard = self.inner.update_lock.lock().await;
        let mut description = self.description().deref().clone();
        description.sync_hosts(hosts);
        self.sync_server_handles(&description);
        let _ = self.inner.watch_tx.send(Arc::new(description));
    }

    /// Marks the server as unknown in response to a failed heartbeat and clears its pool.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address.clone(), error);
        let changed = self.update(description).await;
        if let Some(server) = self.get_server(&address) {
            server.pool().clear();
        }
        changed
    }

    /// Updates the topology in response to an error encountered while running an operation,
    /// per the SDAM error handling rules: state-change errors mark the server unknown and
    /// request an immediate rescan; network and handshake errors additionally clear the
    /// server's pool.
    pub(crate) async fn handle_application_error(&self, address: ServerAddress, error: &Error) {
        if error.is_state_change_error() {
            self.mark_server_unknown(address.clone(), error.clone()).await;
            if error.is_shutting_down() {
                if let Some(server) = self.get_server(&address) {
                    server.pool().clear();
                }
            }
            self.request_update();
        } else if error.is_non_timeout_network_error() || error.is_handshake_error() {
            self.mark_server_unknown(address.clone(), error.clone()).await;
            if let Some(server) = self.get_server(&address) {
                server.pool().clear();
            }
        } else if error.is_auth_error() {
            if let Some(server) = self.get_server(&address) {
                server.pool().clear();
            }
        }
    }

    async fn mark_server_unknown(&self, address: ServerAddress, error: Error) {
        let description = ServerDescription::new_from_error(address, error);
        self.update(description).await;
    }

    /// Requests an immediate recheck of every monitored server, waking monitors in scanning
    /// order: the primary first, then possible primaries, then members of known type, then
    /// the stalest.
    pub(crate) fn request_update(&self) {
        let order = self.description().scan_order();
        let monitors = self.inner.monitors.read().unwrap();
        for address in order {
            if let Some(notify) = monitors.get(&address) {
                notify.notify_one();
            }
        }
    }

    /// Attempts to select a server matching the criteria, requesting topology rescans and
    /// waiting for updates until the timeout elapses.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        timeout: Duration,
    ) -> Result<SelectedServer> {
        let start = Instant::now();
        let mut watcher = self.watcher();

        loop {
            let description = watcher.peek();

            if let Some(server_description) = description.select_server(criteria)? {
                if let Some(server) = self.get_server(&server_description.address) {
                    tracing::debug!(
                        address = %server.address,
                        "server selected for criteria {:?}", criteria
                    );
                    return Ok(SelectedServer::new(server));
                }
            }

            // No candidate matched: ask the monitors to recheck immediately and wait for the
            // topology to change.
            self.request_update();

            let remaining = match timeout.checked_sub(start.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return Err(ErrorKind::ServerSelection {
                        message: description.server_selection_timeout_error_message(criteria),
                    }
                    .into())
                }
            };

            if !watcher.wait_for_update(remaining).await {
                return Err(ErrorKind::ServerSelection {
                    message: description.server_selection_timeout_error_message(criteria),
                }
                .into());
            }
        }
    }

    /// Returns a handle to the server a cursor is pinned to, bypassing server selection.
    pub(crate) fn pinned_server(&self, address: &ServerAddress) -> Result<SelectedServer> {
        match self.get_server(address) {
            Some(server) => Ok(SelectedServer::new(server)),
            None => Err(ErrorKind::ServerSelection {
                message: format!(
                    "the server {} serving this cursor is no longer in the topology",
                    address
                ),
            }
            .into()),
        }
    }

    fn sync_server_handles(&self, description: &TopologyDescription) {
        let mut servers = self.inner.servers.write().unwrap();
        let mut monitors = self.inner.monitors.write().unwrap();

        servers.retain(|address, _| description.servers.contains_key(address));
        monitors.retain(|address, notify| {
            let keep = description.servers.contains_key(address);
            if !keep {
                // Wake the monitor so it can observe its removal and exit.
                notify.notify_waiters();
            }
            keep
        });

        for address in description.servers.keys() {
            if !servers.contains_key(address) {
                servers.insert(
                    address.clone(),
                    Arc::new(Server::new(address.clone(), &self.inner.options)),
                );

                let notify = Arc::new(Notify::new());
                monitors.insert(address.clone(), notify.clone());
                Monitor::start(
                    address.clone(),
                    self.downgrade(),
                    notify,
                    self.inner.options.clone(),
                );
            }
        }
    }

    pub(crate) fn monitored_addresses(&self) -> Vec<ServerAddress> {
        self.inner.servers.read().unwrap().keys().cloned().collect()
    }

    /// Whether this topology is still monitoring the given address.
    pub(crate) fn contains_server(&self, address: &ServerAddress) -> bool {
        self.inner.servers.read().unwrap().contains_key(address)
    }
}

/// A handle to the topology that does not keep it (or its monitors) alive.
#[derive(Clone, Debug)]
pub(crate) struct WeakTopology {
    inner: Weak<TopologyInner>,
}

impl WeakTopology {
    pub(crate) fn upgrade(&self) -> Option<Topology> {
        self.inner.upgrade().map(|inner| Topology { inner })
    }

    /// A weak handle that never upgrades, for tests that exercise monitors in isolation.
    #[cfg(test)]
    pub(crate) fn new_disconnected() -> Self {
        Self { inner: Weak::new() }
    }
}

/// A borrow of the latest published topology description, refreshable without locking the
/// topology itself.
#[derive(Debug)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<Arc<TopologyDescription>>,
}

impl TopologyWatcher {
    /// The most recently published description, marking it seen so that `wait_for_update`
    /// only fires for newer ones.
    pub(crate) fn peek(&mut self) -> Arc<TopologyDescription> {
        self.receiver.borrow_and_update().clone()
    }

    /// Waits up to `timeout` for a description newer than the last `peek`. Returns false if
    /// the timeout elapsed or the topology was dropped.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }
}

/// A server picked by server selection. Holds the operation count up while the operation
/// executes so that future selections can prefer less loaded servers.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    fn new(server: Arc<Server>) -> Self {
        server.increment_operation_count();
        Self { server }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.server.address
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        self.server.deref()
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.server.decrement_operation_count();
    }
}
