use std::time::Duration;

use rand::seq::SliceRandom;

use super::TopologyDescription;
use crate::{
    error::{ErrorKind, Result},
    sdam::description::{
        server::{ServerDescription, ServerType},
        topology::TopologyType,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// The wire version at which servers report the lastWrite metadata that max staleness
/// filtering depends on.
const MAX_STALENESS_MIN_WIRE_VERSION: i32 = 5;

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {:?}. Topology: {}",
                criteria, self
            )
        } else {
            format!(
                "Server selection timeout: No available servers. Topology: {}",
                self
            )
        }
    }

    /// Selects a server from this topology according to the given criteria, picking uniformly
    /// at random among the servers in the latency window.
    pub(crate) fn select_server(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Option<&ServerDescription>> {
        let in_window = self.suitable_servers_in_latency_window(criteria)?;
        Ok(in_window.choose(&mut rand::thread_rng()).copied())
    }

    pub(crate) fn suitable_servers_in_latency_window(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::ServerSelection {
                message: message.to_string(),
            }
            .into());
        }

        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => self.suitable_servers(read_pref)?,
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .values()
                .filter(|s| s.is_available() && filter(&crate::sdam::public::ServerInfo::new_borrowed(s)))
                .collect(),
        };

        self.retain_servers_within_latency_window(&mut suitable_servers);

        Ok(suitable_servers)
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    fn suitable_servers(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let servers = match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single => self
                .servers
                .values()
                .filter(|server| server.is_available())
                .collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)?
            }
        };

        Ok(servers)
    }

    fn retain_servers_within_latency_window(
        &self,
        suitable_servers: &mut Vec<&ServerDescription>,
    ) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .fold(Option::<Duration>::None, |min, curr| match min {
                Some(prev) => Some(prev.min(curr)),
                None => Some(curr),
            });

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window = shortest_average_rtt
            .map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(move |server_desc| {
            match (server_desc.average_round_trip_time, max_rtt_within_window) {
                (Some(server_rtt), Some(max_rtt)) => server_rtt <= max_rtt,
                _ => false,
            }
        });
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    pub(crate) fn primary(&self) -> Option<&ServerDescription> {
        self.servers_with_type(&[ServerType::RsPrimary]).next()
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let tag_sets = read_preference.tag_sets();
        let max_staleness = read_preference.max_staleness();

        let servers = match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary { .. } => self.suitable_servers_for_read_preference(
                &[ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
            ReadPreference::PrimaryPreferred { .. } => {
                match self.servers_with_type(&[ServerType::RsPrimary]).next() {
                    Some(primary) => vec![primary],
                    None => self.suitable_servers_for_read_preference(
                        &[ServerType::RsSecondary],
                        tag_sets,
                        max_staleness,
                    )?,
                }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let suitable_servers = self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    tag_sets,
                    max_staleness,
                )?;

                if suitable_servers.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable_servers
                }
            }
            ReadPreference::Nearest { .. } => self.suitable_servers_for_read_preference(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
        };

        Ok(servers)
    }

    fn suitable_servers_for_read_preference(
        &self,
        types: &'static [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
        max_staleness: Option<Duration>,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(max_staleness) = max_staleness {
            super::verify_max_staleness(max_staleness, self.heartbeat_frequency())?;
            self.verify_max_staleness_wire_versions()?;
        }

        let mut servers = self.servers_with_type(types).collect();

        if let Some(max_staleness) = max_staleness {
            // A max staleness of zero or below is equivalent to no max staleness.
            if max_staleness > Duration::from_secs(0) {
                self.filter_servers_by_max_staleness(&mut servers, max_staleness);
            }
        }

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        Ok(servers)
    }

    /// Max staleness requires every data-bearing server to be at wire version 5 or newer.
    fn verify_max_staleness_wire_versions(&self) -> Result<()> {
        for server in self.servers.values() {
            if server.server_type.is_data_bearing()
                && server.max_wire_version()?.unwrap_or(0) < MAX_STALENESS_MIN_WIRE_VERSION
            {
                return Err(ErrorKind::ServerSelection {
                    message: "maxStalenessSeconds can only be used with 3.4+ servers".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let primary = self
            .servers
            .values()
            .find(|server| server.server_type == ServerType::RsPrimary);

        match primary {
            Some(primary) => {
                self.filter_servers_by_max_staleness_with_primary(servers, primary, max_staleness)
            }
            None => self.filter_servers_by_max_staleness_without_primary(servers, max_staleness),
        };
    }

    fn filter_servers_by_max_staleness_with_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        primary: &ServerDescription,
        max_staleness: Duration,
    ) {
        let max_staleness_ms = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);

        servers.retain(|server| {
            let server_staleness = self.calculate_secondary_staleness_with_primary(server, primary);

            server_staleness
                .map(|staleness| staleness <= max_staleness_ms)
                .unwrap_or(false)
        })
    }

    fn filter_servers_by_max_staleness_without_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let max_staleness = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);
        let max_write_date = self
            .servers
            .values()
            .filter(|server| server.server_type == ServerType::RsSecondary)
            .filter_map(|server| server.last_write_date().ok().flatten())
            .map(|last_write_date| last_write_date.timestamp_millis())
            .max();

        let secondary_max_write_date = match max_write_date {
            Some(max_write_date) => max_write_date,
            None => return,
        };

        servers.retain(|server| {
            let server_staleness = self
                .calculate_secondary_staleness_without_primary(server, secondary_max_write_date);

            server_staleness
                .map(|staleness| staleness <= max_staleness)
                .unwrap_or(false)
        })
    }

    fn calculate_secondary_staleness_with_primary(
        &self,
        secondary: &ServerDescription,
        primary: &ServerDescription,
    ) -> Option<i64> {
        let primary_last_update = primary.last_update_time?.timestamp_millis();
        let primary_last_write = primary.last_write_date().ok()??.timestamp_millis();

        let secondary_last_update = secondary.last_update_time?.timestamp_millis();
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();

        let heartbeat_frequency = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        let staleness = (secondary_last_update - secondary_last_write)
            - (primary_last_update - primary_last_write)
            + heartbeat_frequency;

        Some(staleness)
    }

    fn calculate_secondary_staleness_without_primary(
        &self,
        secondary: &ServerDescription,
        max_last_write_date: i64,
    ) -> Option<i64> {
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();
        let heartbeat_frequency = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        let staleness = max_last_write_date - secondary_last_write + heartbeat_frequency;
        Some(staleness)
    }
}

impl std::fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {}", set_name)?;
        }

        if let Some(max_set_version) = self.max_set_version {
            write!(f, ", Max Set Version: {}", max_set_version)?;
        }

        if let Some(max_election_id) = self.max_election_id {
            write!(f, ", Max Election ID: {}", max_election_id)?;
        }

        if let Some(ref compatibility_error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {}", compatibility_error)?;
        }

        if !self.servers.is_empty() {
            write!(f, ", Servers: [ ")?;
            let mut iter = self.servers.values();
            if let Some(server) = iter.next() {
                write!(f, "{}", crate::sdam::public::ServerInfo::new_borrowed(server))?;
            }
            for server in iter {
                write!(f, ", {}", crate::sdam::public::ServerInfo::new_borrowed(server))?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);

            return;
        }
    }

    servers.clear();
}

#[cfg(test)]
mod test {
    use bson::{doc, DateTime};

    use super::super::test::{address, description_from_response, rs_primary, rs_secondary};
    use super::*;
    use crate::selection_criteria::ReadPreferenceOptions;

    fn replica_set_topology() -> TopologyDescription {
        let mut topology = TopologyDescription {
            topology_type: TopologyType::ReplicaSetWithPrimary,
            set_name: Some("rs".to_string()),
            ..Default::default()
        };

        let hosts = ["a:27017", "b:27017", "c:27017"];
        let primary = rs_primary("a:27017", "rs", &hosts);
        let secondary_b = rs_secondary("b:27017", "rs", &hosts);
        let secondary_c = rs_secondary("c:27017", "rs", &hosts);

        for description in [primary, secondary_b, secondary_c] {
            topology
                .servers
                .insert(description.address.clone(), description);
        }
        topology
    }

    fn set_rtt(topology: &mut TopologyDescription, addr: &str, millis: u64) {
        topology
            .servers
            .get_mut(&address(addr))
            .unwrap()
            .average_round_trip_time = Some(Duration::from_millis(millis));
    }

    fn secondary_pref() -> SelectionCriteria {
        SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: Default::default(),
        })
    }

    #[test]
    fn primary_mode_selects_only_primary() {
        let topology = replica_set_topology();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address, address("a:27017"));
    }

    #[test]
    fn latency_window_keeps_servers_within_threshold() {
        let mut topology = replica_set_topology();
        set_rtt(&mut topology, "a:27017", 30);
        set_rtt(&mut topology, "b:27017", 10);
        set_rtt(&mut topology, "c:27017", 14);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest {
            options: Default::default(),
        });
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();

        // Minimum RTT is 10ms; the 15ms default threshold admits b and c but not a.
        let addresses: Vec<_> = suitable.iter().map(|s| s.address.clone()).collect();
        assert_eq!(addresses.len(), 2);
        assert!(addresses.contains(&address("b:27017")));
        assert!(addresses.contains(&address("c:27017")));
    }

    #[test]
    fn primary_preferred_falls_back_to_secondaries() {
        let mut topology = replica_set_topology();
        let hosts = ["a:27017", "b:27017", "c:27017"];

        // Demote the primary to unknown.
        let unknown = ServerDescription::new(&address("a:27017"));
        topology.servers.insert(address("a:27017"), unknown);
        topology.topology_type = TopologyType::ReplicaSetNoPrimary;

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred {
            options: Default::default(),
        });
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(suitable.len(), 2);

        // Restore the primary; it becomes the only suitable server again.
        topology
            .servers
            .insert(address("a:27017"), rs_primary("a:27017", "rs", &hosts));
        topology.topology_type = TopologyType::ReplicaSetWithPrimary;
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address, address("a:27017"));
    }

    #[test]
    fn tag_sets_filter_in_order() {
        let mut topology = replica_set_topology();
        let tagged = description_from_response(
            "b:27017",
            doc! {
                "ismaster": false,
                "secondary": true,
                "setName": "rs",
                "hosts": ["a:27017", "b:27017", "c:27017"],
                "tags": { "dc": "ny" },
            },
        );
        topology.servers.insert(address("b:27017"), tagged);

        let mut ny = TagSet::default();
        ny.insert("dc".to_string(), "ny".to_string());
        let mut sf = TagSet::default();
        sf.insert("dc".to_string(), "sf".to_string());

        // The first tag set with any match wins; the empty set matches everything.
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .tag_sets(vec![sf, ny, TagSet::default()])
                .build(),
        });
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address, address("b:27017"));
    }

    #[test]
    fn no_matching_tag_set_empties_candidates() {
        let topology = replica_set_topology();
        let mut chicago = TagSet::default();
        chicago.insert("dc".to_string(), "chi".to_string());

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .tag_sets(vec![chicago])
                .build(),
        });
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert!(suitable.is_empty());
    }

    #[test]
    fn max_staleness_filters_lagging_secondaries() {
        let now = DateTime::now().timestamp_millis();
        let hosts = ["a:27017", "b:27017", "c:27017"];

        let mut topology = TopologyDescription {
            topology_type: TopologyType::ReplicaSetWithPrimary,
            set_name: Some("rs".to_string()),
            heartbeat_freq: Some(Duration::from_secs(10)),
            ..Default::default()
        };

        let mut with_write_date = |addr: &str, primary: bool, write_ms: i64| {
            let mut response = doc! {
                "setName": "rs",
                "hosts": hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
                "lastWrite": { "lastWriteDate": DateTime::from_millis(write_ms) },
            };
            if primary {
                response.insert("ismaster", true);
            } else {
                response.insert("secondary", true);
            }
            let description = description_from_response(addr, response);
            topology.servers.insert(address(addr), description);
        };

        with_write_date("a:27017", true, now);
        with_write_date("b:27017", false, now - 200_000);
        with_write_date("c:27017", false, now - 50_000);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .max_staleness(Duration::from_secs(120))
                .build(),
        });

        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        // b lags ~200s + heartbeat, beyond the 120s bound; c lags ~50s + heartbeat, within it.
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address, address("c:27017"));
    }

    #[test]
    fn max_staleness_requires_wire_version_five() {
        let mut topology = replica_set_topology();
        // An old server in the topology poisons max staleness selection.
        let old = description_from_response(
            "c:27017",
            doc! {
                "ismaster": false,
                "secondary": true,
                "setName": "rs",
                "hosts": ["a:27017", "b:27017", "c:27017"],
            },
        );
        let mut old = old;
        if let Ok(Some(ref mut reply)) = old.reply {
            reply.command_response.max_wire_version = Some(4);
        }
        topology.servers.insert(address("c:27017"), old);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .max_staleness(Duration::from_secs(120))
                .build(),
        });
        assert!(topology
            .suitable_servers_in_latency_window(&criteria)
            .is_err());
    }

    #[test]
    fn unknown_servers_are_never_suitable() {
        let mut topology = TopologyDescription {
            topology_type: TopologyType::Single,
            ..Default::default()
        };
        let description = ServerDescription::new(&address("a:27017"));
        topology.servers.insert(address("a:27017"), description);

        let suitable = topology
            .suitable_servers_in_latency_window(&secondary_pref())
            .unwrap();
        assert!(suitable.is_empty());
        assert!(!topology.has_available_servers());
    }
}
