use bson::{doc, Document};
use serde::Deserialize;

use super::{
    append_write_concern_when_supported,
    handle_response,
    Operation,
    Retryability,
    WriteConcernOnlyBody,
};
use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::Result,
    operation::update::UpdateModifications,
    options::ReturnDocument,
    results::FindAndModifyResult,
    Namespace,
};

/// What a findAndModify does with the matched document.
#[derive(Debug)]
pub(crate) enum Modification {
    /// Apply an update or replacement.
    Update {
        update: UpdateModifications,
        upsert: Option<bool>,
        return_document: Option<ReturnDocument>,
    },

    /// Remove the document.
    Delete,
}

/// The `findAndModify` command: atomically modifies (or removes) a single document and
/// returns it.
#[derive(Debug)]
pub(crate) struct FindAndModify {
    ns: Namespace,
    query: Document,
    modification: Modification,
    sort: Option<Document>,
    projection: Option<Document>,
    collation: Option<Document>,
    write_concern: Option<WriteConcern>,
}

impl FindAndModify {
    pub(crate) fn new(
        ns: Namespace,
        query: Document,
        modification: Modification,
        sort: Option<Document>,
        projection: Option<Document>,
        collation: Option<Document>,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            ns,
            query,
            modification,
            sort,
            projection,
            collation,
            write_concern,
        }
    }
}

impl Operation for FindAndModify {
    type O = FindAndModifyResult;

    const NAME: &'static str = "findAndModify";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        super::verify_collation_support(description, self.collation.as_ref())?;

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "query": self.query.clone(),
        };

        match self.modification {
            Modification::Update {
                ref update,
                upsert,
                return_document,
            } => {
                update.validate()?;
                body.insert("update", update.to_bson());
                if let Some(upsert) = upsert {
                    body.insert("upsert", upsert);
                }
                if let Some(return_document) = return_document {
                    body.insert("new", return_document.as_bool());
                }
            }
            Modification::Delete => {
                body.insert("remove", true);
            }
        }

        if let Some(ref sort) = self.sort {
            body.insert("sort", sort.clone());
        }
        if let Some(ref projection) = self.projection {
            body.insert("fields", projection.clone());
        }
        if let Some(ref collation) = self.collation {
            body.insert("collation", collation.clone());
        }

        // findAndModify only accepts a write concern on 3.4+ servers.
        append_write_concern_when_supported(&mut body, self.write_concern.as_ref(), description)?;

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: FindAndModifyBody = handle_response(&response)?.body;
        body.write_concern_info.validate()?;

        Ok(FindAndModifyResult { value: body.value })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}

#[derive(Debug, Deserialize)]
struct FindAndModifyBody {
    value: Option<Document>,

    #[serde(flatten)]
    write_concern_info: WriteConcernOnlyBody,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::concern::Acknowledgment;

    fn namespace() -> Namespace {
        Namespace::new("test", "coll")
    }

    #[test]
    fn write_concern_gated_on_wire_version() {
        let write_concern = WriteConcern::builder().w(Acknowledgment::Majority).build();

        let mut op = FindAndModify::new(
            namespace(),
            doc! { "x": 1 },
            Modification::Delete,
            None,
            None,
            None,
            Some(write_concern.clone()),
        );
        let command = op.build(&StreamDescription::new_testing()).unwrap();
        assert!(command.body.contains_key("writeConcern"));

        // Servers predating wire version 5 receive the command without a write concern.
        let mut op = FindAndModify::new(
            namespace(),
            doc! { "x": 1 },
            Modification::Delete,
            None,
            None,
            None,
            Some(write_concern),
        );
        let command = op.build(&StreamDescription::new_legacy_testing(4)).unwrap();
        assert!(!command.body.contains_key("writeConcern"));
        assert_eq!(command.body.get_bool("remove"), Ok(true));
    }

    #[test]
    fn update_modification_validated_and_serialized() {
        let mut op = FindAndModify::new(
            namespace(),
            doc! {},
            Modification::Update {
                update: UpdateModifications::Document(doc! { "$inc": { "n": 1 } }),
                upsert: Some(true),
                return_document: Some(ReturnDocument::After),
            },
            None,
            None,
            None,
            None,
        );
        let command = op.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(command.body.get_bool("new"), Ok(true));
        assert_eq!(command.body.get_bool("upsert"), Ok(true));
        assert!(command.body.contains_key("update"));
    }
}
