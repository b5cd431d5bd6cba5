use std::{collections::HashSet, time::Duration};

use super::topology::{Topology, WeakTopology};
use crate::{
    client::options::{ClientOptions, OriginalSrvInfo},
    error::Result,
    runtime,
    sdam::TopologyType,
    srv::SrvResolver,
};

const MIN_RESCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically re-resolves the SRV seedlist of a `mongodb+srv` deployment and syncs the
/// topology's hosts to it. Record TTLs bound how often the lookup is repeated.
pub(crate) struct SrvPollingMonitor {
    initial_info: OriginalSrvInfo,
    topology: WeakTopology,
    rescan_interval: Duration,
}

impl SrvPollingMonitor {
    /// Spawns a polling task for the client when its options came from an SRV URI; a no-op
    /// otherwise.
    pub(crate) fn start(topology: Topology, options: ClientOptions) {
        let initial_info = match options.original_srv_info {
            Some(ref info) => info.clone(),
            None => return,
        };

        let monitor = Self {
            rescan_interval: initial_info.min_ttl.max(MIN_RESCAN_INTERVAL),
            initial_info,
            topology: topology.downgrade(),
        };

        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        loop {
            runtime::delay_for(self.rescan_interval).await;

            let topology = match self.topology.upgrade() {
                Some(topology) if topology.is_alive() => topology,
                _ => return,
            };

            // A topology that has settled on a single server no longer follows the seedlist.
            if topology.topology_type() == TopologyType::Single {
                return;
            }

            match self.lookup_hosts().await {
                Ok((hosts, min_ttl)) => {
                    self.rescan_interval = min_ttl.max(MIN_RESCAN_INTERVAL);
                    topology.sync_hosts(hosts).await;
                }
                Err(e) => {
                    // Resolution failures leave the current hosts in place; the next rescan
                    // happens sooner rather than waiting out a full TTL.
                    tracing::debug!(error = %e, "SRV lookup failed during polling");
                    self.rescan_interval = MIN_RESCAN_INTERVAL;
                }
            }
        }
    }

    async fn lookup_hosts(&self) -> Result<(HashSet<crate::options::ServerAddress>, Duration)> {
        let resolver = SrvResolver::new().await?;
        let (hosts, min_ttl) = resolver
            .get_srv_hosts(self.initial_info.hostname.as_str())
            .await?;
        Ok((hosts.into_iter().collect(), min_ttl))
    }
}
