//! Contains the events and functionality for monitoring the behavior of the server discovery
//! and monitoring of the driver.

use std::time::Duration;

use bson::Document;

use crate::{error::Error, options::ServerAddress};

/// Published when a server monitor sends a hello to the server it is monitoring.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Published when a server monitor receives a successful reply to the hello it sent.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The execution time of the event.
    pub duration: Duration,

    /// The reply to the hello command.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Published when a server monitor's hello fails, either with a command error or a network
/// error.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The execution time of the event.
    pub duration: Duration,

    /// The failure that occurred.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event
/// sent by the driver.
pub trait SdamEventHandler: Send + Sync {
    /// A [`Client`](../../struct.Client.html) will call this method on each registered handler
    /// whenever a server heartbeat is started.
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    /// A [`Client`](../../struct.Client.html) will call this method on each registered handler
    /// whenever a server heartbeat succeeds.
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    /// A [`Client`](../../struct.Client.html) will call this method on each registered handler
    /// whenever a server heartbeat fails.
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
}
