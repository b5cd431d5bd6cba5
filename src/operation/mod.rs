mod aggregate;
mod create_indexes;
mod delete;
mod drop_collection;
mod drop_database;
mod drop_indexes;
mod end_sessions;
mod find;
mod find_and_modify;
mod get_more;
mod insert;
mod kill_cursors;
mod run_command;
mod update;

use std::{collections::VecDeque, ops::Deref};

use bson::{Bson, Document, Timestamp};
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    bson_util,
    client::session::ClusterTime,
    cmap::{
        conn::wire::legacy,
        Command,
        RawCommandResponse,
        StreamDescription,
    },
    error::{
        BulkWriteError,
        BulkWriteFailure,
        CommandError,
        Error,
        ErrorKind,
        Result,
        WriteConcernError,
        WriteFailure,
    },
    concern::WriteConcern,
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
    Namespace,
};

pub(crate) use aggregate::Aggregate;
pub(crate) use create_indexes::CreateIndexes;
pub(crate) use delete::Delete;
pub(crate) use drop_collection::DropCollection;
pub(crate) use drop_database::DropDatabase;
pub(crate) use drop_indexes::DropIndexes;
pub(crate) use end_sessions::{EndSessions, MAX_END_SESSIONS_BATCH_SIZE};
pub(crate) use find::Find;
pub(crate) use find_and_modify::{FindAndModify, Modification};
pub(crate) use get_more::{GetMore, GetMoreResult};
pub(crate) use insert::Insert;
pub(crate) use kill_cursors::KillCursors;
pub(crate) use run_command::RunCommand;
pub(crate) use update::Update;
pub use update::UpdateModifications;

/// A request serialized with the legacy opcodes rather than as a command. The server only
/// replies to queries and getMores; the other shapes are fire-and-forget.
#[derive(Debug)]
pub(crate) enum LegacyRequest {
    Query(legacy::Query),
    GetMore(legacy::GetMore),
    KillCursors(legacy::KillCursors),
    Insert(legacy::Insert),
}

/// A trait modeling the behavior of a server side operation: how its command is assembled for
/// a given connection's capabilities, and how the reply is interpreted.
pub(crate) trait Operation {
    /// The output type of this operation.
    type O;

    /// The name of the server side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    /// The operation may store some additional state that is required for handling the
    /// response.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Returns a legacy-opcode request for servers that do not understand this operation as a
    /// command, or `None` when the command form applies.
    fn build_legacy(&mut self, _description: &StreamDescription) -> Result<Option<LegacyRequest>> {
        Ok(None)
    }

    /// Interprets the server response to the command.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Interprets the reply to a legacy-opcode request produced by `build_legacy`.
    fn handle_legacy_response(
        &self,
        _reply: legacy::Reply,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Err(Error::internal(format!(
            "operation {} has no legacy reply handling",
            Self::NAME
        )))
    }

    /// Interpret an error encountered while sending the built command to the server,
    /// potentially recovering.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// A cursor operation must target the server that created the cursor; all other
    /// operations go through server selection.
    fn pinned_address(&self) -> Option<&ServerAddress> {
        None
    }

    /// Whether or not this operation will request acknowledgment from the server.
    fn is_acknowledged(&self) -> bool {
        self.write_concern()
            .map(WriteConcern::is_acknowledged)
            .unwrap_or(true)
    }

    /// The write concern to use for this operation, if any.
    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }

    /// Returns whether or not this command supports the `readConcern` field.
    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        false
    }

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    fn name(&self) -> &str {
        Self::NAME
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

/// A response to a command with a body shaped deserialized to a `T`.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CommandResponse<T> {
    pub(crate) ok: Bson,

    #[serde(rename = "$clusterTime")]
    pub(crate) cluster_time: Option<ClusterTime>,

    pub(crate) operation_time: Option<Timestamp>,

    #[serde(flatten)]
    pub(crate) body: T,
}

impl<T: DeserializeOwned> CommandResponse<T> {
    /// Whether the command succeeded or not (i.e. if this response is ok: 1).
    pub(crate) fn is_success(&self) -> bool {
        bson_util::get_int(&self.ok) == Some(1)
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }
}

/// A response body useful for deserializing command errors.
#[derive(Deserialize, Debug)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}

impl From<CommandErrorBody> for Error {
    fn from(command_error_response: CommandErrorBody) -> Error {
        Error::new(
            ErrorKind::Command(command_error_response.command_error),
            command_error_response.error_labels,
        )
    }
}

/// Interprets a raw response as either a successful `T`-shaped reply or a command error.
pub(crate) fn handle_response<T: DeserializeOwned>(
    response: &RawCommandResponse,
) -> Result<CommandResponse<T>> {
    let command_response: CommandResponse<T> = response.body()?;
    if command_response.is_success() {
        Ok(command_response)
    } else {
        let error_response: CommandErrorBody = response.body()?;
        Err(error_response.into())
    }
}

#[derive(Deserialize, Debug)]
pub(crate) struct EmptyBody {}

/// Body of a write response that could possibly have a write concern error but not write
/// errors.
#[derive(Debug, Deserialize, Default, Clone)]
pub(crate) struct WriteConcernOnlyBody {
    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    labels: Option<Vec<String>>,
}

impl WriteConcernOnlyBody {
    pub(crate) fn validate(&self) -> Result<()> {
        match self.write_concern_error {
            Some(ref wc_error) => Err(Error::new(
                ErrorKind::Write(WriteFailure::WriteConcernError(wc_error.clone())),
                self.labels.clone(),
            )),
            None => Ok(()),
        }
    }
}

#[derive(Deserialize, Debug)]
pub(crate) struct WriteResponseBody<T = EmptyBody> {
    #[serde(flatten)]
    body: T,

    pub(crate) n: u64,

    #[serde(rename = "writeErrors")]
    pub(crate) write_errors: Option<Vec<BulkWriteError>>,

    #[serde(rename = "writeConcernError")]
    pub(crate) write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    pub(crate) labels: Option<Vec<String>>,
}

impl<T> WriteResponseBody<T> {
    /// Surfaces write errors and write concern errors as a bulk write failure, after the
    /// business results have been recorded by the caller.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.write_errors.is_none() && self.write_concern_error.is_none() {
            return Ok(());
        };

        let failure = BulkWriteFailure {
            write_errors: self.write_errors.clone(),
            write_concern_error: self.write_concern_error.clone(),
            inserted_ids: Default::default(),
        };

        Err(Error::new(
            ErrorKind::BulkWrite(failure),
            self.labels.clone(),
        ))
    }
}

impl<T> Deref for WriteResponseBody<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.body
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,

    pub(crate) ns: Namespace,

    #[serde(default)]
    pub(crate) first_batch: VecDeque<Document>,

    #[serde(default)]
    pub(crate) next_batch: VecDeque<Document>,
}

/// Verifies that a collation option is only used against servers that support it.
pub(crate) fn verify_collation_support(
    description: &StreamDescription,
    collation: Option<&Document>,
) -> Result<()> {
    if collation.is_some() && !description.supports_collation() {
        return Err(ErrorKind::InvalidArgument {
            message: "Specifying a collation requires server version 3.4 or higher".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Stamps the write concern into the command body when the connected server accepts one for
/// this command; older servers receive the command without it.
pub(crate) fn append_write_concern_when_supported(
    body: &mut Document,
    write_concern: Option<&WriteConcern>,
    description: &StreamDescription,
) -> Result<()> {
    if !description.supports_write_concern_on_command() {
        return Ok(());
    }

    if let Some(write_concern) = write_concern {
        if !write_concern.is_empty() {
            body.insert("writeConcern", bson::to_bson(write_concern)?);
        }
    }

    Ok(())
}
