use std::collections::HashSet;

use bson::{Bson, Document, Timestamp};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;

use crate::{
    client::session::ClusterTime,
    concern::{ReadConcern, WriteConcern},
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

lazy_static! {
    /// Commands that may carry credentials and so must never be compressed and must have
    /// their bodies redacted in monitoring events.
    pub(crate) static ref REDACTED_COMMANDS: HashSet<&'static str> = {
        let mut hash_set = HashSet::new();
        hash_set.insert("saslstart");
        hash_set.insert("saslcontinue");
        hash_set.insert("getnonce");
        hash_set.insert("authenticate");
        hash_set.insert("createuser");
        hash_set.insert("updateuser");
        hash_set.insert("copydbgetnonce");
        hash_set.insert("copydbsaslstart");
        hash_set.insert("copydb");
        hash_set
    };

    /// The handshake commands, which are never compressed since they negotiate compression.
    pub(crate) static ref HELLO_COMMAND_NAMES: HashSet<&'static str> = {
        let mut hash_set = HashSet::new();
        hash_set.insert("ismaster");
        hash_set.insert("hello");
        hash_set
    };
}

/// Driver-side abstraction of a server command, containing everything necessary to serialize it
/// to a wire message.
#[derive(Debug, Clone, Default)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) document_sequences: Vec<CommandSequence>,
}

/// A batch of documents attached to a write command. Sent as an OP_MSG document sequence when
/// the transport supports it, and folded into the body as a BSON array otherwise.
#[derive(Debug, Clone)]
pub(crate) struct CommandSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Document>,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(name: impl Into<String>, target_db: impl Into<String>, body: Document) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            document_sequences: Vec::new(),
        }
    }

    pub(crate) fn add_document_sequence(
        &mut self,
        identifier: impl Into<String>,
        documents: Vec<Document>,
    ) {
        self.document_sequences.push(CommandSequence {
            identifier: identifier.into(),
            documents,
        });
    }

    pub(crate) fn set_session_id(&mut self, session_id: Document) {
        self.body.insert("lsid", session_id);
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        // This serialization should never fail.
        if let Ok(doc) = bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.body
            .insert("$readPreference", read_preference.into_document());
    }

    pub(crate) fn set_read_concern(
        &mut self,
        read_concern: Option<&ReadConcern>,
        after_cluster_time: Option<Timestamp>,
    ) -> Result<()> {
        let mut doc = match read_concern {
            Some(rc) => match bson::to_bson(rc)? {
                Bson::Document(doc) => doc,
                _ => Document::new(),
            },
            None => Document::new(),
        };

        if let Some(timestamp) = after_cluster_time {
            doc.insert("afterClusterTime", timestamp);
        }

        if !doc.is_empty() {
            self.body.insert("readConcern", doc);
        }

        Ok(())
    }

    pub(crate) fn set_write_concern(&mut self, write_concern: &WriteConcern) -> Result<()> {
        if !write_concern.is_empty() {
            self.body
                .insert("writeConcern", bson::to_bson(write_concern)?);
        }
        Ok(())
    }

    pub(crate) fn set_max_time_ms(&mut self, max_time_ms: i64) {
        self.body.insert("maxTimeMS", max_time_ms);
    }

    /// Whether the body of this command must be redacted in monitoring events.
    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        REDACTED_COMMANDS.contains(name.as_str())
            || (HELLO_COMMAND_NAMES.contains(name.as_str())
                && self.body.contains_key("speculativeAuthenticate"))
    }

    /// Whether this command may be wrapped in an OP_COMPRESSED envelope.
    pub(crate) fn should_compress(&self) -> bool {
        let name = self.name.to_lowercase();
        !REDACTED_COMMANDS.contains(name.as_str()) && !HELLO_COMMAND_NAMES.contains(name.as_str())
    }

    /// Converts the document sequences into body arrays for transports that do not support
    /// OP_MSG payload type 1 sections.
    pub(crate) fn fold_sequences_into_body(&mut self) {
        for sequence in self.document_sequences.drain(..) {
            self.body.insert(
                sequence.identifier,
                crate::bson_util::to_bson_array(&sequence.documents),
            );
        }
    }

}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    #[test]
    fn sensitive_commands_are_never_compressed() {
        for name in [
            "isMaster",
            "hello",
            "saslStart",
            "saslContinue",
            "getnonce",
            "authenticate",
            "createUser",
            "updateUser",
            "copydbSaslStart",
            "copydbGetNonce",
            "copydb",
        ] {
            let command = Command::new(name, "admin", doc! { name: 1 });
            assert!(!command.should_compress(), "{} must not be compressed", name);
        }

        let insert = Command::new("insert", "test", doc! { "insert": "coll" });
        assert!(insert.should_compress());
        let getnonce = Command::new("getnonce", "test", doc! { "getnonce": 1 });
        assert!(!getnonce.should_compress());
    }

    #[test]
    fn credential_commands_are_redacted() {
        let sasl = Command::new("saslStart", "admin", doc! { "saslStart": 1 });
        assert!(sasl.should_redact());

        let find = Command::new("find", "test", doc! { "find": "coll" });
        assert!(!find.should_redact());

        // A handshake is only sensitive when it smuggles credentials.
        let plain_hello = Command::new("isMaster", "admin", doc! { "isMaster": 1 });
        assert!(!plain_hello.should_redact());
        let speculative = Command::new(
            "isMaster",
            "admin",
            doc! { "isMaster": 1, "speculativeAuthenticate": { "saslStart": 1 } },
        );
        assert!(speculative.should_redact());
    }

    #[test]
    fn session_and_cluster_time_stamping() {
        let mut command = Command::new("insert", "test", doc! { "insert": "coll" });
        command.set_session_id(doc! { "id": 42 });
        command.set_txn_number(7);
        assert_eq!(
            command.body.get_document("lsid").unwrap(),
            &doc! { "id": 42 }
        );
        assert_eq!(command.body.get_i64("txnNumber").unwrap(), 7);
    }

    #[test]
    fn sequences_fold_into_body_for_legacy_transport() {
        let mut command = Command::new("insert", "test", doc! { "insert": "coll" });
        command.add_document_sequence("documents", vec![doc! { "_id": 1 }, doc! { "_id": 2 }]);
        command.fold_sequences_into_body();

        assert!(command.document_sequences.is_empty());
        let docs = command.body.get_array("documents").unwrap();
        assert_eq!(docs.len(), 2);
    }
}

/// A server's reply to a command, along with the address of the server that sent it.
#[derive(Debug, Clone)]
pub(crate) struct RawCommandResponse {
    source: ServerAddress,
    raw: Document,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, raw: Document) -> Self {
        Self { source, raw }
    }

    #[cfg(test)]
    pub(crate) fn with_document(doc: Document) -> Self {
        Self::new(
            ServerAddress {
                host: "localhost".to_string(),
                port: None,
            },
            doc,
        )
    }

    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_document(self.raw.clone()).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                message: format!("{}", e),
            })
        })
    }

    /// Deserialize the body of this response, returning an authentication error if it fails.
    pub(crate) fn auth_response_body<T: DeserializeOwned>(
        &self,
        mechanism_name: &str,
    ) -> Result<T> {
        self.body()
            .map_err(|_| Error::invalid_authentication_response(mechanism_name))
    }

    pub(crate) fn raw(&self) -> &Document {
        &self.raw
    }

    pub(crate) fn into_raw(self) -> Document {
        self.raw
    }

    /// The address of the server that sent this response.
    pub(crate) fn source_address(&self) -> &ServerAddress {
        &self.source
    }
}
