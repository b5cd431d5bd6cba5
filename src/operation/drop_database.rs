use bson::doc;

use super::{
    append_write_concern_when_supported,
    handle_response,
    Operation,
    WriteConcernOnlyBody,
};
use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::Result,
};

/// The `dropDatabase` command.
#[derive(Debug)]
pub(crate) struct DropDatabase {
    target_db: String,
    write_concern: Option<WriteConcern>,
}

impl DropDatabase {
    pub(crate) fn new(target_db: impl Into<String>, write_concern: Option<WriteConcern>) -> Self {
        Self {
            target_db: target_db.into(),
            write_concern,
        }
    }
}

impl Operation for DropDatabase {
    type O = ();

    const NAME: &'static str = "dropDatabase";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
        };

        append_write_concern_when_supported(&mut body, self.write_concern.as_ref(), description)?;

        Ok(Command::new(Self::NAME, self.target_db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: WriteConcernOnlyBody = handle_response(&response)?.body;
        body.validate()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }
}
