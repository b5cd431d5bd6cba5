use bson::doc;

use super::{
    append_write_concern_when_supported,
    handle_response,
    EmptyBody,
    Operation,
};
use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::Result,
    Namespace,
};

/// The `dropIndexes` command. The index name `"*"` drops every index except the one on `_id`.
#[derive(Debug)]
pub(crate) struct DropIndexes {
    ns: Namespace,
    name: String,
    write_concern: Option<WriteConcern>,
}

impl DropIndexes {
    pub(crate) fn new(
        ns: Namespace,
        name: impl Into<String>,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            ns,
            name: name.into(),
            write_concern,
        }
    }
}

impl Operation for DropIndexes {
    type O = ();

    const NAME: &'static str = "dropIndexes";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "index": self.name.clone(),
        };

        append_write_concern_when_supported(&mut body, self.write_concern.as_ref(), description)?;

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        handle_response::<EmptyBody>(&response)?;
        Ok(())
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::concern::Acknowledgment;

    #[test]
    fn write_concern_gated_on_wire_version() {
        let write_concern = WriteConcern::builder().w(Acknowledgment::Majority).build();
        let mut op = DropIndexes::new(
            Namespace::new("db", "coll"),
            "a_1",
            Some(write_concern),
        );

        let modern = op.build(&StreamDescription::new_testing()).unwrap();
        assert!(modern.body.contains_key("writeConcern"));
        assert_eq!(modern.body.get_str("index"), Ok("a_1"));

        let legacy = op.build(&StreamDescription::new_legacy_testing(4)).unwrap();
        assert!(!legacy.body.contains_key("writeConcern"));
    }
}
