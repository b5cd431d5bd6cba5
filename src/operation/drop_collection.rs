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
    Namespace,
};

/// The `drop` command, removing a collection. "ns not found" replies are treated as success
/// so that dropping an absent collection is a no-op.
#[derive(Debug)]
pub(crate) struct DropCollection {
    ns: Namespace,
    write_concern: Option<WriteConcern>,
}

impl DropCollection {
    pub(crate) fn new(ns: Namespace, write_concern: Option<WriteConcern>) -> Self {
        Self { ns, write_concern }
    }
}

impl Operation for DropCollection {
    type O = ();

    const NAME: &'static str = "drop";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
        };

        append_write_concern_when_supported(&mut body, self.write_concern.as_ref(), description)?;

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: WriteConcernOnlyBody = handle_response(&response)?.body;
        body.validate()
    }

    fn handle_error(&self, error: crate::error::Error) -> Result<Self::O> {
        if error.is_ns_not_found() {
            Ok(())
        } else {
            Err(error)
        }
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        concern::Acknowledgment,
        error::{CommandError, ErrorKind},
    };

    #[test]
    fn ns_not_found_is_success() {
        let op = DropCollection::new(Namespace::new("db", "coll"), None);
        let error = ErrorKind::Command(CommandError {
            code: 26,
            code_name: "NamespaceNotFound".to_string(),
            message: "ns not found".to_string(),
        })
        .into();
        assert!(op.handle_error(error).is_ok());
    }

    #[test]
    fn write_concern_omitted_on_old_servers() {
        let write_concern = WriteConcern::builder().w(Acknowledgment::Majority).build();
        let mut op = DropCollection::new(Namespace::new("db", "coll"), Some(write_concern));

        let modern = op.build(&StreamDescription::new_testing()).unwrap();
        assert!(modern.body.contains_key("writeConcern"));

        let legacy = op.build(&StreamDescription::new_legacy_testing(4)).unwrap();
        assert!(!legacy.body.contains_key("writeConcern"));
    }
}
