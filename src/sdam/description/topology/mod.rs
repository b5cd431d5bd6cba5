pub(crate) mod server_selection;

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use bson::oid::ObjectId;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::{
    client::{options::ClientOptions, session::ClusterTime},
    error::{Error, Result},
    options::ServerAddress,
    sdam::{
        description::server::{ServerDescription, ServerType},
        DEFAULT_HEARTBEAT_FREQUENCY,
    },
};

const DRIVER_MIN_WIRE_VERSION: i32 = 0;
const DRIVER_MAX_WIRE_VERSION: i32 = 8;

/// The possible types for a topology.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Default)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

impl std::fmt::Display for TopologyType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Self::Single => "Single",
            Self::ReplicaSetNoPrimary => "ReplicaSetNoPrimary",
            Self::ReplicaSetWithPrimary => "ReplicaSetWithPrimary",
            Self::Sharded => "Sharded",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A description of the most up-to-date information known about a topology.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct TopologyDescription {
    /// Whether or not the topology was initialized with a single seed.
    #[serde(skip)]
    pub(crate) single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology.
    pub(crate) set_name: Option<String>,

    /// The highest replica set version the driver has seen by a member of the topology.
    pub(crate) max_set_version: Option<i32>,

    /// The highest replica set election id the driver has seen by a member of the topology.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between the driver and server with regards to the
    /// respective supported wire versions.
    pub(crate) compatibility_error: Option<String>,

    /// The time that a session remains active after its most recent use.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The highest reported cluster time by any server in this topology.
    #[serde(skip)]
    pub(crate) cluster_time: Option<ClusterTime>,

    /// The amount of latency beyond that of the suitable server with the minimum latency that
    /// is acceptable for a read operation.
    #[serde(skip)]
    pub(crate) local_threshold: Option<Duration>,

    /// The interval between server checks.
    #[serde(skip)]
    pub(crate) heartbeat_freq: Option<Duration>,

    /// The server descriptions of each member of the topology.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        // Equality is only used to decide whether to wake up waiting server selection
        // operations, so only the fields the selection algorithm reads are compared.
        self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
            && self.topology_type == other.topology_type
    }
}

impl Default for TopologyDescription {
    fn default() -> Self {
        Self {
            single_seed: false,
            topology_type: TopologyType::Unknown,
            set_name: Default::default(),
            max_set_version: Default::default(),
            max_election_id: Default::default(),
            compatibility_error: Default::default(),
            logical_session_timeout: None,
            cluster_time: Default::default(),
            local_threshold: Default::default(),
            heartbeat_freq: Default::default(),
            servers: Default::default(),
        }
    }
}

impl TopologyDescription {
    pub(crate) fn initialize(&mut self, options: &ClientOptions) {
        debug_assert!(
            self.servers.is_empty() && self.topology_type == TopologyType::Unknown,
            "new TopologyDescriptions should start empty"
        );

        self.topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.repl_set_name.is_some() && options.hosts.len() > 1 {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        for address in options.hosts.iter() {
            let description = ServerDescription::new(address);
            self.servers.insert(description.address.clone(), description);
        }

        self.single_seed = self.servers.len() == 1;
        self.set_name.clone_from(&options.repl_set_name);
        self.local_threshold = options.local_threshold;
        self.heartbeat_freq = options.heartbeat_freq;
    }

    /// Gets the topology type of the cluster.
    pub(crate) fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    /// Gets the heartbeat frequency.
    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    /// Stamps `$readPreference` into the command according to the topology and server type:
    /// mongos forwards non-primary modes, a directly-connected replica set member is read as
    /// primaryPreferred, and `primary` is always omitted.
    pub(crate) fn update_command_with_read_pref(
        &self,
        address: &ServerAddress,
        command: &mut crate::cmap::Command,
        criteria: Option<&crate::selection_criteria::SelectionCriteria>,
    ) {
        use crate::selection_criteria::{ReadPreference, SelectionCriteria};

        let server_type = self
            .get_server_description(address)
            .map(|sd| sd.server_type)
            .unwrap_or(ServerType::Unknown);

        match (self.topology_type, server_type) {
            (TopologyType::Sharded, ServerType::Mongos)
            | (TopologyType::Single, ServerType::Mongos) => {
                let read_preference = match criteria {
                    Some(SelectionCriteria::ReadPreference(rp)) => rp,
                    _ => return,
                };
                match read_preference {
                    ReadPreference::Secondary { .. }
                    | ReadPreference::PrimaryPreferred { .. }
                    | ReadPreference::Nearest { .. }
                    | ReadPreference::SecondaryPreferred { .. } => {
                        command.set_read_preference(read_preference.clone())
                    }
                    ReadPreference::Primary => {}
                }
            }
            (TopologyType::Single, ServerType::Standalone) => {}
            (TopologyType::Single, _) => {
                let specified_read_pref =
                    criteria.and_then(SelectionCriteria::as_read_pref).cloned();

                let resolved_read_pref = match specified_read_pref {
                    Some(ReadPreference::Primary) | None => ReadPreference::PrimaryPreferred {
                        options: Default::default(),
                    },
                    Some(other) => other,
                };
                command.set_read_preference(resolved_read_pref)
            }
            _ => {
                let read_pref = match criteria {
                    Some(SelectionCriteria::ReadPreference(rp)) => rp.clone(),
                    Some(SelectionCriteria::Predicate(_)) => ReadPreference::PrimaryPreferred {
                        options: Default::default(),
                    },
                    None => ReadPreference::Primary,
                };
                if read_pref != ReadPreference::Primary {
                    command.set_read_preference(read_pref)
                }
            }
        }
    }

    /// Check the cluster for a compatibility error, and record the error message if one is
    /// found.
    fn check_compatibility(&mut self) {
        self.compatibility_error = None;

        for server in self.servers.values() {
            if let Ok(Some(ref reply)) = server.reply {
                let hello_min_wire_version =
                    reply.command_response.min_wire_version.unwrap_or(0);

                if hello_min_wire_version > DRIVER_MAX_WIRE_VERSION {
                    self.compatibility_error = Some(format!(
                        "Server at {} requires wire version {}, but this driver only supports \
                         up to {}",
                        server.address, hello_min_wire_version, DRIVER_MAX_WIRE_VERSION,
                    ));
                    return;
                }

                let hello_max_wire_version =
                    reply.command_response.max_wire_version.unwrap_or(0);

                if hello_max_wire_version < DRIVER_MIN_WIRE_VERSION {
                    self.compatibility_error = Some(format!(
                        "Server at {} reports wire version {}, but this driver requires at \
                         least {}",
                        server.address, hello_max_wire_version, DRIVER_MIN_WIRE_VERSION,
                    ));
                    return;
                }
            }
        }
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    /// Updates the topology's logical session timeout to the minimum of the data-bearing
    /// servers' values.
    fn update_logical_session_timeout(&mut self, server_description: &ServerDescription) {
        if !server_description.server_type.is_data_bearing() {
            return;
        }
        match server_description.logical_session_timeout().ok().flatten() {
            Some(new_timeout) => match self.logical_session_timeout {
                Some(current_timeout) => {
                    self.logical_session_timeout =
                        Some(std::cmp::min(current_timeout, new_timeout));
                }
                None => {
                    let min_timeout = self
                        .servers
                        .values()
                        .filter(|s| s.server_type.is_data_bearing())
                        .map(|s| s.logical_session_timeout().ok().flatten())
                        .min()
                        .flatten();
                    self.logical_session_timeout = min_timeout;
                }
            },
            // If any data-bearing server does not report a logicalSessionTimeoutMinutes value,
            // the topology's value must be unset.
            None => self.logical_session_timeout = None,
        }
    }

    /// Sets the topology's cluster time to the provided one if it is higher than the currently
    /// recorded one.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if self.cluster_time.as_ref() >= Some(cluster_time) {
            return;
        }
        self.cluster_time = Some(cluster_time.clone());
    }

    /// Syncs the set of servers in the description to those in `hosts`. Servers in the set not
    /// already present in the cluster will be added, and servers in the cluster not present in
    /// the set will be removed.
    pub(crate) fn sync_hosts(&mut self, hosts: HashSet<ServerAddress>) {
        self.servers.retain(|host, _| hosts.contains(host));
        for host in hosts {
            if !self.servers.contains_key(&host) {
                self.servers.insert(host.clone(), ServerDescription::new(&host));
            }
        }
    }

    /// The order in which a bulk rescan should check the topology's servers: the primary
    /// first if known, then any member another server has named as primary, then members of
    /// known type, then the stalest remaining, ties broken randomly.
    pub(crate) fn scan_order(&self) -> Vec<ServerAddress> {
        let mut entries: Vec<(&ServerAddress, &ServerDescription)> = self.servers.iter().collect();
        entries.shuffle(&mut rand::thread_rng());
        entries.sort_by_key(|(_, description)| {
            let type_rank = match description.server_type {
                ServerType::RsPrimary => 0,
                ServerType::PossiblePrimary => 1,
                ServerType::Unknown | ServerType::RsGhost => 3,
                _ => 2,
            };
            (
                type_rank,
                description
                    .last_update_time
                    .map(|t| t.timestamp_millis())
                    .unwrap_or(i64::MIN),
            )
        });
        entries.into_iter().map(|(address, _)| address.clone()).collect()
    }

    /// Update the topology based on the new information about the topology contained by the
    /// ServerDescription.
    pub(crate) fn update(&mut self, server_description: ServerDescription) -> Result<()> {
        // Ignore updates from servers not in the topology.
        if !self.servers.contains_key(&server_description.address) {
            return Ok(());
        }

        // Replace the old info about the server with the new info.
        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        // Update the topology's min logicalSessionTimeout.
        self.update_logical_session_timeout(&server_description);

        // Update the topology's max reported $clusterTime.
        if let Some(ref cluster_time) = server_description.cluster_time().ok().flatten() {
            self.advance_cluster_time(cluster_time);
        }

        // Update the topology description based on the current topology type.
        match self.topology_type {
            TopologyType::Single => {}
            TopologyType::Unknown => self.update_unknown_topology(server_description)?,
            TopologyType::Sharded => self.update_sharded_topology(server_description),
            TopologyType::ReplicaSetNoPrimary => {
                self.update_replica_set_no_primary_topology(server_description)?
            }
            TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_with_primary_topology(server_description)?;
            }
        }

        // Record any compatibility error.
        self.check_compatibility();

        Ok(())
    }

    /// Update the Unknown topology description based on the server description.
    fn update_unknown_topology(&mut self, server_description: ServerDescription) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost | ServerType::PossiblePrimary => {}
            ServerType::Standalone => {
                self.update_unknown_with_standalone_server(server_description)
            }
            ServerType::Mongos => self.topology_type = TopologyType::Sharded,
            ServerType::RsPrimary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_rs_from_primary_server(server_description)?;
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary_server(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the Sharded topology description based on the server description.
    fn update_sharded_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::Mongos => {}
            _ => {
                self.servers.remove(&server_description.address);
            }
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the server description.
    fn update_replica_set_no_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost | ServerType::PossiblePrimary => {}
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
            }
            ServerType::RsPrimary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_rs_from_primary_server(server_description)?
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_without_primary_server(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the server description.
    fn update_replica_set_with_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost | ServerType::PossiblePrimary => {
                self.record_primary_state();
            }
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
                self.record_primary_state();
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_with_primary_from_member(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the Unknown topology description based on the Standalone server description.
    fn update_unknown_with_standalone_server(&mut self, server_description: ServerDescription) {
        if self.single_seed && self.set_name.is_none() {
            self.topology_type = TopologyType::Single;
        } else {
            // A standalone that shows up among multiple seeds is presumed to be a replica set
            // member under maintenance.
            self.servers.remove(&server_description.address);
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the non-primary server
    /// description.
    fn update_rs_without_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);

            return Ok(());
        }

        self.add_new_servers(server_description.known_hosts()?);

        if let Some(primary_hint) = server_description.primary_hint()? {
            self.mark_possible_primary(&primary_hint);
        }

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the non-primary server
    /// description.
    fn update_rs_with_primary_from_member(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        self.record_primary_state();

        Ok(())
    }

    /// Update the replica set topology description based on the RSPrimary server description.
    fn update_rs_from_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        // Reject primaries whose set version and election id are stale relative to the
        // highest seen so far.
        if let Some(server_set_version) = server_description.set_version()? {
            if let Some(server_election_id) = server_description.election_id()? {
                if let Some(topology_max_set_version) = self.max_set_version {
                    if let Some(ref topology_max_election_id) = self.max_election_id {
                        if topology_max_set_version > server_set_version
                            || (topology_max_set_version == server_set_version
                                && *topology_max_election_id > server_election_id)
                        {
                            self.servers.insert(
                                server_description.address.clone(),
                                ServerDescription::new(&server_description.address),
                            );
                            self.record_primary_state();
                            return Ok(());
                        }
                    }
                }

                self.max_election_id = Some(server_election_id);
            }
        }

        if let Some(server_set_version) = server_description.set_version()? {
            if self
                .max_set_version
                .map(|topology_max_set_version| server_set_version > topology_max_set_version)
                .unwrap_or(true)
            {
                self.max_set_version = Some(server_set_version);
            }
        }

        let addresses: Vec<_> = self.servers.keys().cloned().collect();

        // If any other servers are RSPrimary, replace them with an unknown server description,
        // which will cause them to be rechecked.
        for address in addresses.clone() {
            if address == server_description.address {
                continue;
            }

            if let ServerType::RsPrimary = self.servers.get(&address).unwrap().server_type {
                let description = ServerDescription::new(&address);
                self.servers.insert(address, description);
            }
        }

        // Union the hosts, passives and arbiters the primary names into the topology, and
        // remove any member the primary does not name.
        let known_hosts = server_description.known_hosts()?;
        self.add_new_servers(known_hosts.clone());

        for address in addresses {
            if !known_hosts.contains(&address) {
                self.servers.remove(&address);
            }
        }

        self.record_primary_state();

        Ok(())
    }

    /// Inspect the topology for a primary server, and update the topology type to
    /// ReplicaSetNoPrimary if none is found.
    ///
    /// This should only be called on a replica set topology.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Upgrade the type of the named server to PossiblePrimary if the driver has not yet
    /// checked it, biasing the scanning order toward it.
    fn mark_possible_primary(&mut self, address: &ServerAddress) {
        if let Some(description) = self.servers.get_mut(address) {
            if description.server_type == ServerType::Unknown {
                *description = ServerDescription::possible_primary(address.clone());
            }
        }
    }

    /// Create a new ServerDescription for each address and add it to the topology.
    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(&address));
        }
    }
}

pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let smallest_max_staleness = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency
            .checked_add(server_selection::IDLE_WRITE_PERIOD)
            .unwrap_or(Duration::MAX),
    );

    if max_staleness < smallest_max_staleness {
        return Err(Error::invalid_argument(format!(
            "invalid max_staleness value: must be at least {} seconds",
            smallest_max_staleness.as_secs()
        )));
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::HashSet;

    use bson::doc;

    use super::*;
    use crate::hello::parse_hello_reply;
    use crate::sdam::description::server::ServerDescription;

    pub(crate) fn address(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    pub(crate) fn description_from_response(
        addr: &str,
        mut response: bson::Document,
    ) -> ServerDescription {
        response.insert("ok", 1);
        response.insert("maxWireVersion", 8);
        response.insert("minWireVersion", 0);
        let reply = parse_hello_reply(
            address(addr),
            crate::cmap::RawCommandResponse::with_document(response),
        )
        .unwrap();
        ServerDescription::new_from_hello_reply(
            address(addr),
            reply,
            Duration::from_millis(10),
        )
    }

    pub(crate) fn standalone(addr: &str) -> ServerDescription {
        description_from_response(addr, doc! { "ismaster": true })
    }

    pub(crate) fn mongos(addr: &str) -> ServerDescription {
        description_from_response(addr, doc! { "ismaster": true, "msg": "isdbgrid" })
    }

    pub(crate) fn rs_primary(addr: &str, set: &str, hosts: &[&str]) -> ServerDescription {
        description_from_response(
            addr,
            doc! {
                "ismaster": true,
                "setName": set,
                "hosts": hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
            },
        )
    }

    pub(crate) fn rs_secondary(addr: &str, set: &str, hosts: &[&str]) -> ServerDescription {
        description_from_response(
            addr,
            doc! {
                "ismaster": false,
                "secondary": true,
                "setName": set,
                "hosts": hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
            },
        )
    }

    fn topology_with_seeds(seeds: &[&str]) -> TopologyDescription {
        let mut topology = TopologyDescription::default();
        for seed in seeds {
            let description = ServerDescription::new(&address(seed));
            topology.servers.insert(description.address.clone(), description);
        }
        topology.single_seed = seeds.len() == 1;
        topology
    }

    fn primary_count(topology: &TopologyDescription) -> usize {
        topology
            .servers
            .values()
            .filter(|s| s.server_type == ServerType::RsPrimary)
            .count()
    }

    #[test]
    fn single_seed_standalone_becomes_single() {
        let mut topology = topology_with_seeds(&["a:27017"]);
        topology.update(standalone("a:27017")).unwrap();
        assert_eq!(topology.topology_type, TopologyType::Single);
    }

    #[test]
    fn multi_seed_standalone_is_removed() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology.update(standalone("a:27017")).unwrap();
        assert_eq!(topology.topology_type, TopologyType::Unknown);
        assert!(!topology.servers.contains_key(&address("a:27017")));
    }

    #[test]
    fn mongos_transitions_to_sharded() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology.update(mongos("a:27017")).unwrap();
        assert_eq!(topology.topology_type, TopologyType::Sharded);

        // A replica set member that wanders into a sharded topology is removed.
        topology
            .update(rs_primary("b:27017", "rs", &["b:27017"]))
            .unwrap();
        assert!(!topology.servers.contains_key(&address("b:27017")));
        assert_eq!(topology.topology_type, TopologyType::Sharded);
    }

    #[test]
    fn primary_discovery_unions_hosts_and_removes_absent() {
        let mut topology = topology_with_seeds(&["a:27017", "stale:27017"]);
        topology
            .update(rs_primary("a:27017", "rs", &["a:27017", "b:27017", "c:27017"]))
            .unwrap();

        assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.set_name.as_deref(), Some("rs"));
        assert!(topology.servers.contains_key(&address("b:27017")));
        assert!(topology.servers.contains_key(&address("c:27017")));
        assert!(!topology.servers.contains_key(&address("stale:27017")));
        assert_eq!(primary_count(&topology), 1);
    }

    #[test]
    fn with_primary_invariant_holds_after_new_primary() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology
            .update(rs_primary("a:27017", "rs", &["a:27017", "b:27017"]))
            .unwrap();
        topology
            .update(rs_primary("b:27017", "rs", &["a:27017", "b:27017"]))
            .unwrap();

        // The old primary is reset to Unknown; exactly one primary remains.
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
        assert_eq!(primary_count(&topology), 1);
        assert_eq!(
            topology.servers.get(&address("a:27017")).unwrap().server_type,
            ServerType::Unknown
        );
    }

    #[test]
    fn set_name_mismatch_removes_server() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology
            .update(rs_primary("a:27017", "rs", &["a:27017", "b:27017"]))
            .unwrap();
        topology
            .update(rs_secondary("b:27017", "other", &["b:27017"]))
            .unwrap();

        assert!(!topology.servers.contains_key(&address("b:27017")));
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
    }

    #[test]
    fn secondary_discovery_without_primary() {
        let mut topology = topology_with_seeds(&["b:27017"]);
        topology
            .update(rs_secondary("b:27017", "rs", &["a:27017", "b:27017"]))
            .unwrap();

        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
        assert!(topology.servers.contains_key(&address("a:27017")));
    }

    #[test]
    fn member_naming_primary_marks_possible_primary() {
        let mut topology = topology_with_seeds(&["b:27017"]);
        topology.update(description_from_response(
            "b:27017",
            doc! {
                "ismaster": false,
                "secondary": true,
                "setName": "rs",
                "hosts": ["a:27017", "b:27017"],
                "primary": "a:27017",
            },
        ))
        .unwrap();

        assert_eq!(
            topology.servers.get(&address("a:27017")).unwrap().server_type,
            ServerType::PossiblePrimary
        );
        // The possible primary is checked first on the next scan.
        assert_eq!(topology.scan_order().first(), Some(&address("a:27017")));
    }

    #[test]
    fn losing_the_primary_demotes_topology() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology
            .update(rs_primary("a:27017", "rs", &["a:27017", "b:27017"]))
            .unwrap();

        // The primary stepping down (now reporting as secondary) leaves no primary.
        topology
            .update(rs_secondary("a:27017", "rs", &["a:27017", "b:27017"]))
            .unwrap();
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn stale_primary_rejected_by_set_version_and_election_id() {
        let oid_small = ObjectId::parse_str("000000000000000000000001").unwrap();
        let oid_big = ObjectId::parse_str("000000000000000000000002").unwrap();

        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology.update(description_from_response(
            "a:27017",
            doc! {
                "ismaster": true,
                "setName": "rs",
                "hosts": ["a:27017", "b:27017"],
                "setVersion": 2,
                "electionId": oid_big,
            },
        ))
        .unwrap();

        // A stale primary claim (same set version, older election id) is rejected and the
        // server reset to Unknown.
        topology.update(description_from_response(
            "b:27017",
            doc! {
                "ismaster": true,
                "setName": "rs",
                "hosts": ["a:27017", "b:27017"],
                "setVersion": 2,
                "electionId": oid_small,
            },
        ))
        .unwrap();

        assert_eq!(
            topology.servers.get(&address("b:27017")).unwrap().server_type,
            ServerType::Unknown
        );
        assert_eq!(
            topology.servers.get(&address("a:27017")).unwrap().server_type,
            ServerType::RsPrimary
        );
    }

    #[test]
    fn single_topology_never_changes_type() {
        let mut topology = topology_with_seeds(&["a:27017"]);
        topology.update(standalone("a:27017")).unwrap();
        assert_eq!(topology.topology_type, TopologyType::Single);

        topology
            .update(rs_primary("a:27017", "rs", &["a:27017", "b:27017"]))
            .unwrap();
        assert_eq!(topology.topology_type, TopologyType::Single);
        assert_eq!(topology.servers.len(), 1);
    }

    #[test]
    fn sync_hosts_preserves_surviving_descriptions() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology
            .update(rs_secondary("b:27017", "rs", &["a:27017", "b:27017"]))
            .unwrap();

        // SRV update from [a, b] to [b, c]: a removed, c added, b's description preserved.
        let new_hosts: HashSet<_> = [address("b:27017"), address("c:27017")].into_iter().collect();
        topology.sync_hosts(new_hosts);

        assert!(!topology.servers.contains_key(&address("a:27017")));
        assert!(topology.servers.contains_key(&address("c:27017")));
        let b = topology.servers.get(&address("b:27017")).unwrap();
        assert_eq!(b.server_type, ServerType::RsSecondary);
    }

    #[test]
    fn logical_session_timeout_is_minimum_of_data_bearing() {
        let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
        topology.update(description_from_response(
            "a:27017",
            doc! {
                "ismaster": true,
                "setName": "rs",
                "hosts": ["a:27017", "b:27017"],
                "logicalSessionTimeoutMinutes": 30,
            },
        ))
        .unwrap();
        assert_eq!(
            topology.logical_session_timeout,
            Some(Duration::from_secs(30 * 60))
        );

        topology.update(description_from_response(
            "b:27017",
            doc! {
                "ismaster": false,
                "secondary": true,
                "setName": "rs",
                "hosts": ["a:27017", "b:27017"],
                "logicalSessionTimeoutMinutes": 10,
            },
        ))
        .unwrap();
        assert_eq!(
            topology.logical_session_timeout,
            Some(Duration::from_secs(10 * 60))
        );
    }
}
