use bson::Document;

use super::{handle_response, EmptyBody, Operation};
use crate::{
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{ErrorKind, Result},
    selection_criteria::SelectionCriteria,
};

/// Runs an arbitrary database command as-is, returning the reply document. Used for admin and
/// diagnostic commands that have no dedicated operation.
#[derive(Debug)]
pub(crate) struct RunCommand {
    target_db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    pub(crate) fn new(
        target_db: impl Into<String>,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Self> {
        if bson_util::first_key(&command).is_none() {
            return Err(ErrorKind::InvalidArgument {
                message: "an empty document cannot be passed to a run_command operation"
                    .to_string(),
            }
            .into());
        }

        Ok(Self {
            target_db: target_db.into(),
            command,
            selection_criteria,
        })
    }

    fn command_name(&self) -> &str {
        bson_util::first_key(&self.command).unwrap_or("")
    }
}

impl Operation for RunCommand {
    type O = Document;

    const NAME: &'static str = "runCommand";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(
            self.command_name().to_string(),
            self.target_db.clone(),
            self.command.clone(),
        ))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        handle_response::<EmptyBody>(&response)?;
        Ok(response.into_raw())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    /// User-provided commands may be session-incompatible (e.g. another `getMore`), so no
    /// implicit session is attached.
    fn supports_sessions(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        self.command_name()
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    #[test]
    fn empty_command_rejected() {
        assert!(RunCommand::new("admin", doc! {}, None).is_err());
    }

    #[test]
    fn command_name_from_first_key() {
        let mut op = RunCommand::new("admin", doc! { "ping": 1 }, None).unwrap();
        assert_eq!(op.name(), "ping");
        let command = op.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(command.name, "ping");
        assert_eq!(command.target_db, "admin");
    }
}
