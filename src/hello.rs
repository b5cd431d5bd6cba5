use bson::{doc, oid::ObjectId, DateTime, Document, Timestamp};
use serde::{Deserialize, Serialize};

use crate::{
    bson_util,
    client::session::ClusterTime,
    cmap::{Command, Connection, RawCommandResponse},
    error::{CommandError, ErrorKind, Result},
    options::ServerAddress,
    sdam::ServerType,
    selection_criteria::TagSet,
};

/// The legacy version of the `hello` command, which all wire versions this driver supports
/// understand. To limit usages of the legacy name in the codebase, this constant should be used
/// wherever possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// Construct a hello or legacy hello command, depending on whether the server has advertised
/// `helloOk`. When the answer is not yet known, legacy hello is sent with `helloOk: true` so
/// that the server can advertise support.
pub(crate) fn hello_command(hello_ok: Option<bool>) -> Command {
    let (body, command_name) = if matches!(hello_ok, Some(true)) {
        (doc! { "hello": 1 }, "hello")
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    Command::new(command_name, "admin", body)
}

/// Execute a hello or legacy hello command over the given connection.
pub(crate) async fn run_hello(conn: &mut Connection, command: Command) -> Result<HelloReply> {
    let server_address = conn.address().clone();
    let response = conn.send_command(command, None).await?;
    parse_hello_reply(server_address, response)
}

/// Validates a hello response and extracts the typed reply from it.
pub(crate) fn parse_hello_reply(
    server_address: ServerAddress,
    response: RawCommandResponse,
) -> Result<HelloReply> {
    let raw = response.into_raw();

    match raw.get("ok").and_then(bson_util::get_int) {
        Some(1) => {}
        Some(_) => {
            let error: CommandError =
                bson::from_document(raw).map_err(|e| ErrorKind::InvalidResponse {
                    message: format!("invalid server response: {}", e),
                })?;
            return Err(ErrorKind::Command(error).into());
        }
        None => {
            return Err(ErrorKind::InvalidResponse {
                message: "hello response did not contain an ok field".to_string(),
            }
            .into())
        }
    }

    let cluster_time = raw
        .get_document("$clusterTime")
        .ok()
        .and_then(|doc| bson::from_document(doc.clone()).ok());

    let command_response: HelloCommandResponse =
        bson::from_document(raw.clone()).map_err(|e| ErrorKind::InvalidResponse {
            message: format!("invalid hello response: {}", e),
        })?;

    Ok(HelloReply {
        server_address,
        command_response,
        cluster_time,
        raw_command_response: raw,
    })
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) cluster_time: Option<ClusterTime>,
    pub(crate) raw_command_response: Document,
}

/// The response to a `hello` or legacy `isMaster` command.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/command/hello/) for more details.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub is_writable_primary: Option<bool>,

    #[serde(rename = "ismaster")]
    /// Legacy name for the `is_writable_primary` field.
    pub is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring instead
    /// of the legacy hello command.
    pub hello_ok: Option<bool>,

    /// The list of all hosts.
    pub hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub msg: Option<String>,

    /// The address of the server that returned this `HelloCommandResponse`.
    pub me: Option<String>,

    #[serde(rename = "compression")]
    /// The list of compressors negotiated between the client's advertisement and the server's
    /// support.
    pub compressors: Option<Vec<String>>,

    /// The current replica set config version.
    pub set_version: Option<i32>,

    /// The name of the current replica set.
    pub set_name: Option<String>,

    /// Whether the server is hidden.
    pub hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub arbiter_only: Option<bool>,

    #[serde(rename = "isreplicaset")]
    /// Whether the server is a member of an uninitialized replica set.
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub election_id: Option<ObjectId>,

    /// The address of current primary member of the replica set.
    pub primary: Option<String>,

    /// A list of SASL mechanisms used to create the user's credential(s).
    pub sasl_supported_mechs: Option<Vec<String>>,

    /// The reply to speculative authentication done in the authentication handshake.
    pub speculative_authenticate: Option<Document>,

    /// The maximum permitted size of a BSON object in bytes.
    #[serde(default = "default_max_bson_object_size")]
    pub max_bson_object_size: i64,

    /// The maximum number of write operations permitted in a write batch.
    pub max_write_batch_size: Option<i64>,

    /// The maximum permitted size of a BSON wire protocol message.
    #[serde(default = "default_max_message_size_bytes")]
    pub max_message_size_bytes: i32,

    /// The cluster time sent by the server, if any.
    #[serde(rename = "operationTime")]
    pub operation_time: Option<Timestamp>,
}

fn default_max_bson_object_size() -> i64 {
    16 * 1024 * 1024
}

fn default_max_message_size_bytes() -> i32 {
    48_000_000
}

impl HelloCommandResponse {
    /// Classifies the responding server based on the reply's shape.
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub last_write_date: DateTime,
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    fn parse(doc: Document) -> HelloCommandResponse {
        bson::from_document(doc).unwrap()
    }

    #[test]
    fn mongos_inferred_from_msg() {
        let response = parse(doc! { "ok": 1, "msg": "isdbgrid", "maxBsonObjectSize": 16777216i64, "maxMessageSizeBytes": 48000000 });
        assert_eq!(response.server_type(), ServerType::Mongos);
    }

    #[test]
    fn replica_set_member_types() {
        let primary = parse(doc! { "ok": 1, "setName": "rs", "ismaster": true });
        assert_eq!(primary.server_type(), ServerType::RsPrimary);

        let secondary = parse(doc! { "ok": 1, "setName": "rs", "secondary": true });
        assert_eq!(secondary.server_type(), ServerType::RsSecondary);

        let arbiter = parse(doc! { "ok": 1, "setName": "rs", "arbiterOnly": true });
        assert_eq!(arbiter.server_type(), ServerType::RsArbiter);

        let hidden = parse(doc! { "ok": 1, "setName": "rs", "secondary": true, "hidden": true });
        assert_eq!(hidden.server_type(), ServerType::RsOther);
    }

    #[test]
    fn ghost_and_standalone() {
        let ghost = parse(doc! { "ok": 1, "isreplicaset": true });
        assert_eq!(ghost.server_type(), ServerType::RsGhost);

        let standalone = parse(doc! { "ok": 1, "ismaster": true });
        assert_eq!(standalone.server_type(), ServerType::Standalone);
    }

    #[test]
    fn hello_command_upgrades_after_hello_ok() {
        let unknown = hello_command(None);
        assert_eq!(unknown.name, LEGACY_HELLO_COMMAND_NAME);
        assert_eq!(unknown.body.get_bool("helloOk"), Ok(true));

        let supported = hello_command(Some(true));
        assert_eq!(supported.name, "hello");

        let unsupported = hello_command(Some(false));
        assert_eq!(unsupported.name, LEGACY_HELLO_COMMAND_NAME);
        assert!(!unsupported.body.contains_key("helloOk"));
    }
}
