pub(crate) mod description;
mod monitor;
pub mod public;
mod server;
mod srv_polling;
mod topology;

pub(crate) use self::{
    description::{
        server::{ServerDescription, ServerType},
        topology::{TopologyDescription, TopologyType},
    },
    monitor::{DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    server::Server,
    srv_polling::SrvPollingMonitor,
    topology::{
        SelectedServer,
        Topology,
        TopologyWatcher,
        WeakTopology,
        DEFAULT_SERVER_SELECTION_TIMEOUT,
    },
};
