use bson::doc;

use super::{handle_response, EmptyBody, LegacyRequest, Operation};
use crate::{
    bson_util,
    cmap::{conn::wire::legacy, Command, RawCommandResponse, StreamDescription},
    error::Result,
    options::ServerAddress,
    Namespace,
};

/// The `killCursors` operation, releasing server-side cursor resources before natural
/// exhaustion. Pinned to the server that created the cursors.
#[derive(Debug)]
pub(crate) struct KillCursors {
    ns: Namespace,
    cursor_ids: Vec<i64>,
    address: ServerAddress,
}

impl KillCursors {
    pub(crate) fn new(ns: Namespace, cursor_ids: Vec<i64>, address: ServerAddress) -> Self {
        Self {
            ns,
            cursor_ids,
            address,
        }
    }
}

impl Operation for KillCursors {
    type O = ();

    const NAME: &'static str = "killCursors";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "cursors": bson_util::to_i64_array(&self.cursor_ids),
        };

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn build_legacy(&mut self, description: &StreamDescription) -> Result<Option<LegacyRequest>> {
        if description.supports_find_command() {
            return Ok(None);
        }

        Ok(Some(LegacyRequest::KillCursors(legacy::KillCursors {
            cursor_ids: self.cursor_ids.clone(),
        })))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        handle_response::<EmptyBody>(&response)?;
        Ok(())
    }

    fn handle_legacy_response(
        &self,
        _reply: legacy::Reply,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Ok(())
    }

    fn pinned_address(&self) -> Option<&ServerAddress> {
        Some(&self.address)
    }

    /// The server never attributes cursor cleanup to a logical session.
    fn supports_sessions(&self) -> bool {
        false
    }
}
