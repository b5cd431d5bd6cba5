use bson::{doc, Document};

use super::{handle_response, EmptyBody, Operation};
use crate::{
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
};

/// The number of session ids that may be retired in one `endSessions` command.
pub(crate) const MAX_END_SESSIONS_BATCH_SIZE: usize = 10_000;

/// The `endSessions` command, retiring pooled server sessions during client shutdown.
#[derive(Debug)]
pub(crate) struct EndSessions {
    session_ids: Vec<Document>,
}

impl EndSessions {
    pub(crate) fn new(session_ids: Vec<Document>) -> Self {
        debug_assert!(session_ids.len() <= MAX_END_SESSIONS_BATCH_SIZE);
        Self { session_ids }
    }
}

impl Operation for EndSessions {
    type O = ();

    const NAME: &'static str = "endSessions";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let body = doc! {
            Self::NAME: bson_util::to_bson_array(&self.session_ids),
        };

        Ok(Command::new(Self::NAME, "admin", body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        handle_response::<EmptyBody>(&response)?;
        Ok(())
    }

    fn supports_sessions(&self) -> bool {
        false
    }
}
