use std::time::Duration;

use crate::{hello::HelloReply, options::ServerAddress, sdam::ServerType};

/// The capability vector captured from a connection's handshake, consulted by the dispatch
/// pipeline before every capability-gated injection.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// The supported authentication mechanisms for the handshake user, if any were reported.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// How long sessions started on this server will stay alive without further activity.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The largest BSON object (in bytes) the server accepts in a single document.
    pub(crate) max_bson_object_size: i64,

    /// The largest number of write operations the server accepts in a single write command.
    pub(crate) max_write_batch_size: i64,

    /// The largest wire message (in bytes) the server accepts.
    pub(crate) max_message_size_bytes: i32,

    /// Whether the server supports the `hello` command for monitoring.
    pub(crate) hello_ok: bool,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            min_wire_version: response.min_wire_version,
            sasl_supported_mechs: response.sasl_supported_mechs.clone(),
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins as u64 * 60)),
            max_bson_object_size: response.max_bson_object_size,
            max_write_batch_size: response.max_write_batch_size.unwrap_or(1000),
            max_message_size_bytes: response.max_message_size_bytes,
            hello_ok: response.hello_ok.unwrap_or(false),
        }
    }

    /// Whether this server supports OP_MSG transport (MongoDB 3.6+).
    pub(crate) fn supports_op_msg(&self) -> bool {
        self.max_wire_version.unwrap_or(0) >= 6
    }

    /// Whether this server supports logical sessions.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some() && self.max_wire_version.unwrap_or(0) >= 6
    }

    /// Whether this server supports retryable writes.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.initial_server_type != ServerType::Standalone
            && self.supports_sessions()
            && self.max_wire_version.unwrap_or(0) >= 6
    }

    /// Whether this server accepts a write concern on DDL-style commands (`drop`,
    /// `dropIndexes`, `createIndexes`, `renameCollection`, `findAndModify`); MongoDB 3.4+.
    pub(crate) fn supports_write_concern_on_command(&self) -> bool {
        self.max_wire_version.unwrap_or(0) >= 5
    }

    /// Whether this server supports the `collation` option; MongoDB 3.4+.
    pub(crate) fn supports_collation(&self) -> bool {
        self.max_wire_version.unwrap_or(0) >= 5
    }

    /// Whether this server supports the `find`/`getMore`/`killCursors` commands rather than
    /// the legacy opcodes; MongoDB 3.2+.
    pub(crate) fn supports_find_command(&self) -> bool {
        self.max_wire_version.unwrap_or(0) >= 4
    }

    /// Whether this server supports readConcern; MongoDB 3.2+.
    pub(crate) fn supports_read_concern(&self) -> bool {
        self.max_wire_version.unwrap_or(0) >= 4
    }

    /// Whether the maxStalenessSeconds read preference option may be used; MongoDB 3.4+.
    pub(crate) fn supports_max_staleness(&self) -> bool {
        self.max_wire_version.unwrap_or(0) >= 5
    }

    /// Gets a description of a stream for a 4.2 server for testing purposes.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self {
            max_wire_version: Some(8),
            min_wire_version: Some(0),
            max_bson_object_size: 16 * 1024 * 1024,
            max_write_batch_size: 100_000,
            max_message_size_bytes: 48_000_000,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            ..Default::default()
        }
    }

    /// Gets a description of a stream for a legacy (pre-3.6) server for testing purposes.
    #[cfg(test)]
    pub(crate) fn new_legacy_testing(max_wire_version: i32) -> Self {
        Self {
            max_wire_version: Some(max_wire_version),
            min_wire_version: Some(0),
            max_bson_object_size: 16 * 1024 * 1024,
            max_write_batch_size: 1000,
            max_message_size_bytes: 48_000_000,
            ..Default::default()
        }
    }
}
