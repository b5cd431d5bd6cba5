use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Notify;

use super::{description::server::ServerDescription, topology::WeakTopology};
use crate::{
    client::options::ClientOptions,
    cmap::{Connection, Handshaker},
    error::{Error, Result},
    event::sdam::{
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, HelloReply},
    options::ServerAddress,
    runtime,
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(60);
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// The weight of a new round-trip-time sample in the moving average.
const RTT_ALPHA: f64 = 0.2;

/// Monitor that performs periodic hello checks of a single server over its own dedicated
/// connection, pushing the results into the topology. Monitors never lend their connection to
/// application operations.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    handshaker: Handshaker,
    topology: WeakTopology,
    check_requester: Arc<Notify>,
    client_options: ClientOptions,
    average_round_trip_time: Option<Duration>,
}

impl Monitor {
    /// Starts a monitor for the given address on a background task.
    pub(crate) fn start(
        address: ServerAddress,
        topology: WeakTopology,
        check_requester: Arc<Notify>,
        client_options: ClientOptions,
    ) {
        let handshaker = Handshaker::for_monitoring(&client_options);
        let monitor = Self {
            address,
            connection: None,
            handshaker,
            topology,
            check_requester,
            client_options,
            average_round_trip_time: None,
        };
        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
            .max(MIN_HEARTBEAT_FREQUENCY);

        loop {
            let topology = match self.topology.upgrade() {
                Some(topology) if topology.is_alive() && topology.contains_server(&self.address) => {
                    topology
                }
                _ => break,
            };

            self.check_server(&topology).await;
            drop(topology);

            // An out-of-band check request shortens the wait, but checks never run more often
            // than the minimum frequency.
            let wait_start = Instant::now();
            let requester = Arc::clone(&self.check_requester);
            let _ = runtime::timeout(heartbeat_frequency, requester.notified()).await;

            let elapsed = wait_start.elapsed();
            if elapsed < MIN_HEARTBEAT_FREQUENCY {
                runtime::delay_for(MIN_HEARTBEAT_FREQUENCY - elapsed).await;
            }
        }

        tracing::debug!(address = %self.address, "monitor stopped");
    }

    /// Checks the server by running a hello command, updating the topology with the result.
    /// A network error on an established monitoring connection is retried once with a fresh
    /// connection before the server is declared unknown.
    async fn check_server(&mut self, topology: &super::topology::Topology) -> bool {
        let mut retried = false;
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let previous_is_available = topology
                    .server_description(&self.address)
                    .map(|sd| sd.is_available())
                    .unwrap_or(false);

                if (e.is_network_error() || e.is_handshake_error()) && previous_is_available {
                    topology
                        .handle_monitor_error(self.address.clone(), e)
                        .await;
                    retried = true;
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                let server_description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    self.average_round_trip_time
                        .expect("rtt must be set after a successful hello"),
                );
                topology.update(server_description).await
            }
            Err(e) => {
                self.average_round_trip_time = None;
                topology.handle_monitor_error(self.address.clone(), e).await || retried
            }
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        self.emit_started_event();

        let start = Instant::now();
        let result = self.perform_hello_inner().await;
        let duration = start.elapsed();

        match result {
            Ok(ref reply) => {
                self.update_average_round_trip_time(duration);
                self.emit_succeeded_event(duration, reply);
            }
            Err(ref e) => {
                self.connection.take();
                self.emit_failed_event(duration, e.clone());
            }
        }

        result
    }

    async fn perform_hello_inner(&mut self) -> Result<HelloReply> {
        match self.connection {
            Some(ref mut conn) => {
                let command = hello_command(Some(conn.stream_description()?.hello_ok));
                run_hello(conn, command).await
            }
            None => {
                let mut connection = Connection::connect_monitoring(
                    self.address.clone(),
                    self.client_options.connect_timeout,
                    self.client_options.tls_options().as_ref(),
                )
                .await
                .map_err(Error::into_handshake_error)?;

                let result = self.handshaker.handshake(&mut connection).await;
                self.connection = Some(connection);
                result.map(|r| r.hello_reply)
            }
        }
    }

    /// Folds a new round-trip-time sample into the exponentially weighted moving average. The
    /// first sample becomes the average outright.
    fn update_average_round_trip_time(&mut self, sample: Duration) {
        let average = match self.average_round_trip_time {
            Some(old_rtt) => Duration::from_secs_f64(
                RTT_ALPHA * sample.as_secs_f64() + (1.0 - RTT_ALPHA) * old_rtt.as_secs_f64(),
            ),
            None => sample,
        };
        self.average_round_trip_time = Some(average);
    }

    fn emit_started_event(&self) {
        if let Some(ref handler) = self.client_options.sdam_event_handler {
            handler.handle_server_heartbeat_started_event(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
            });
        }
    }

    fn emit_succeeded_event(&self, duration: Duration, reply: &HelloReply) {
        if let Some(ref handler) = self.client_options.sdam_event_handler {
            let mut reply_doc = reply.raw_command_response.clone();
            // A handshake reply may carry speculative authentication data; it never belongs in
            // published events.
            reply_doc.remove("speculativeAuthenticate");
            handler.handle_server_heartbeat_succeeded_event(ServerHeartbeatSucceededEvent {
                duration,
                reply: reply_doc,
                server_address: self.address.clone(),
            });
        }
    }

    fn emit_failed_event(&self, duration: Duration, failure: Error) {
        if let Some(ref handler) = self.client_options.sdam_event_handler {
            handler.handle_server_heartbeat_failed_event(ServerHeartbeatFailedEvent {
                duration,
                failure,
                server_address: self.address.clone(),
            });
        }
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use super::*;

    fn monitor_for_test() -> Monitor {
        Monitor {
            address: ServerAddress::parse("a:27017").unwrap(),
            connection: None,
            handshaker: Handshaker::for_monitoring(&ClientOptions::default()),
            topology: WeakTopology::new_disconnected(),
            check_requester: Arc::new(Notify::new()),
            client_options: ClientOptions::default(),
            average_round_trip_time: None,
        }
    }

    #[test]
    fn first_rtt_sample_is_adopted_directly() {
        let mut monitor = monitor_for_test();
        monitor.update_average_round_trip_time(Duration::from_millis(100));
        assert_eq!(
            monitor.average_round_trip_time,
            Some(Duration::from_millis(100))
        );
    }

    #[test]
    fn rtt_average_weights_new_samples_at_one_fifth() {
        let mut monitor = monitor_for_test();
        monitor.update_average_round_trip_time(Duration::from_millis(100));
        monitor.update_average_round_trip_time(Duration::from_millis(200));

        // 0.2 * 200ms + 0.8 * 100ms = 120ms
        assert_relative_eq!(
            monitor.average_round_trip_time.unwrap().as_secs_f64(),
            0.120,
            epsilon = 1e-9
        );
    }
}
