mod cluster_time;
mod pool;

use std::time::{Duration, Instant};

use bson::{doc, spec::BinarySubtype, Binary, Document, Timestamp};
use serde::Deserialize;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::Client;

pub use cluster_time::ClusterTime;
pub(crate) use pool::ServerSessionPool;

/// The amount of time before server-side expiry at which a session is no longer trusted to be
/// alive and is discarded instead of reused.
const EXPIRY_GUARD_BAND: Duration = Duration::from_secs(60);

/// A server-side logical session, identified by a UUID. Pooled and reused across operations.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// A monotonically increasing transaction number for this session.
    pub(crate) txn_number: i64,

    /// Whether a network error was encountered while using this session. Dirty sessions are
    /// not returned to the pool.
    pub(crate) dirty: bool,
}

impl ServerSession {
    /// Creates a new session, generating the id client-side.
    pub(crate) fn new() -> Self {
        let binary = Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        };

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            txn_number: 0,
            dirty: false,
        }
    }

    fn update_last_use(&mut self) {
        self.last_use = Instant::now();
    }

    /// Whether the session is likely to be retired by the server within the guard band, in
    /// which case it must not be reused.
    pub(crate) fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        match logical_session_timeout {
            Some(timeout) => {
                self.last_use.elapsed() >= timeout.saturating_sub(EXPIRY_GUARD_BAND)
            }
            None => false,
        }
    }
}

/// Contains the options that can be used to create a new [`ClientSession`].
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SessionOptions {
    /// Whether operations using the session are causally consistent: reads after writes on the
    /// session observe those writes. Defaults to true for explicitly created sessions.
    pub causal_consistency: Option<bool>,
}

/// A MongoDB client session. This struct represents a logical session used for ordering
/// sequential operations. To create a `ClientSession`, call `start_session` on a `Client`.
///
/// `ClientSession` instances are not thread safe or fork safe. They can only be used by one
/// thread or process at a time.
#[derive(Debug)]
pub struct ClientSession {
    cluster_time: Option<ClusterTime>,
    server_session: Option<ServerSession>,
    client: Client,
    is_implicit: bool,
    options: Option<SessionOptions>,
    operation_time: Option<Timestamp>,

    /// The recovery token for sharded transaction commit retry, recorded from replies.
    pub(crate) recovery_token: Option<Document>,
}

impl ClientSession {
    pub(crate) fn new(
        server_session: ServerSession,
        client: Client,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Self {
        Self {
            cluster_time: None,
            server_session: Some(server_session),
            client,
            is_implicit,
            options,
            operation_time: None,
            recovery_token: None,
        }
    }

    /// The client used to create this session.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub(crate) fn is_from_client(&self, client: &Client) -> bool {
        self.client.same_client(client)
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        &self
            .server_session
            .as_ref()
            .expect("session used after ending")
            .id
    }

    /// Whether this session has been ended and its server session returned to the pool.
    pub(crate) fn is_ended(&self) -> bool {
        self.server_session.is_none()
    }

    /// Whether operations on this session request causal consistency.
    pub(crate) fn is_causally_consistent(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|options| options.causal_consistency)
            .unwrap_or(!self.is_implicit)
    }

    /// The highest seen cluster time this session has seen so far.
    /// This value will be `None` if this session has not been used in an operation yet.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The operation time of the most recent operation performed using this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Set the cluster time to the provided one if it is greater than this session's highest
    /// seen cluster time or if this session's cluster time is `None`.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Advance operation time for this session. If the provided timestamp is earlier than this
    /// session's current operation time, then the operation time is unchanged.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        self.operation_time = match self.operation_time {
            Some(current) if current >= ts => Some(current),
            _ => Some(ts),
        }
    }

    /// Increments the transaction number and returns the new value, providing the per-retry
    /// stable `txnNumber` for retryable writes.
    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        let session = self
            .server_session
            .as_mut()
            .expect("session used after ending");
        session.txn_number += 1;
        session.txn_number
    }

    pub(crate) fn update_last_use(&mut self) {
        if let Some(ref mut session) = self.server_session {
            session.update_last_use();
        }
    }

    /// Mark this session as dirty, preventing the underlying server session from being reused.
    pub(crate) fn mark_dirty(&mut self) {
        if let Some(ref mut session) = self.server_session {
            session.dirty = true;
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(server_session) = self.server_session.take() {
            // A session dropped outside of an async context cannot be returned to the pool;
            // the server will retire it after its timeout.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let client = self.client.clone();
                handle.spawn(async move {
                    client.check_in_server_session(server_session).await;
                });
            }
        }
    }
}
