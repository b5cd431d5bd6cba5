use std::{borrow::Cow, fmt, time::Duration};

use bson::DateTime;

use crate::{options::ServerAddress, selection_criteria::TagSet};

pub use crate::sdam::description::{server::ServerType, topology::TopologyType};

use super::description::server::ServerDescription;

/// A description of the most up-to-date information known about a server. Further details can
/// be found in the [Server Discovery and Monitoring specification](https://specifications.readthedocs.io/en/latest/server-discovery-and-monitoring/server-discovery-and-monitoring/).
#[derive(Clone, Debug)]
pub struct ServerInfo<'a> {
    pub(crate) description: Cow<'a, ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self {
            description: Cow::Borrowed(description),
        }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the round trip time of the server's heartbeats.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the last time that the driver's monitoring thread for the server updated the
    /// internal information about the server.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.description.last_update_time
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the name of the replica set that the server is part of, if any.
    pub fn set_name(&self) -> Option<String> {
        self.description.set_name().ok().flatten()
    }

    /// Gets the tags associated with the server, if any.
    pub fn tags(&self) -> Option<&TagSet> {
        match self.description.reply {
            Ok(Some(ref reply)) => reply.command_response.tags.as_ref(),
            _ => None,
        }
    }
}

impl<'a> fmt::Display for ServerInfo<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ Address: {}, Type: {:?}",
            self.address(),
            self.server_type()
        )?;

        match self.description.reply {
            Ok(_) => {
                if let Some(rtt) = self.average_round_trip_time() {
                    write!(f, ", Average RTT: {:?}", rtt)?;
                }
            }
            Err(ref e) => {
                write!(f, ", Error: {}", e)?;
            }
        }

        write!(f, " }}")
    }
}
