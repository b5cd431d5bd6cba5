use bson::{doc, Document};

use super::{handle_response, Operation, Retryability, WriteResponseBody};
use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::Result,
    results::DeleteResult,
    Namespace,
};

/// The `delete` write command. A limit of 1 removes a single matching document; a limit of 0
/// removes all matches.
#[derive(Debug)]
pub(crate) struct Delete {
    ns: Namespace,
    filter: Document,
    limit: u32,
    collation: Option<Document>,
    write_concern: Option<WriteConcern>,
}

impl Delete {
    pub(crate) fn new(
        ns: Namespace,
        filter: Document,
        limit: Option<u32>,
        collation: Option<Document>,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            ns,
            filter,
            limit: limit.map(|limit| limit.min(1)).unwrap_or(0),
            collation,
            write_concern,
        }
    }
}

impl Operation for Delete {
    type O = DeleteResult;

    const NAME: &'static str = "delete";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        super::verify_collation_support(description, self.collation.as_ref())?;

        let mut delete = doc! {
            "q": self.filter.clone(),
            "limit": self.limit as i32,
        };

        if let Some(ref collation) = self.collation {
            delete.insert("collation", collation.clone());
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "ordered": true,
        };

        if let Some(ref write_concern) = self.write_concern {
            if !write_concern.is_empty() {
                body.insert("writeConcern", bson::to_bson(write_concern)?);
            }
        }

        let mut command = Command::new(Self::NAME, self.ns.db.clone(), body);
        command.add_document_sequence("deletes", vec![delete]);
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: WriteResponseBody = handle_response(&response)?.body;
        body.validate()?;

        Ok(DeleteResult {
            deleted_count: body.n,
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        if self.limit == 1 {
            Retryability::Write
        } else {
            Retryability::None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    fn namespace() -> Namespace {
        Namespace::new("test", "coll")
    }

    #[test]
    fn limit_controls_retryability() {
        let one = Delete::new(namespace(), doc! {}, Some(1), None, None);
        assert_eq!(one.retryability(), Retryability::Write);

        let many = Delete::new(namespace(), doc! {}, None, None, None);
        assert_eq!(many.retryability(), Retryability::None);
    }

    #[test]
    fn build_uses_deletes_sequence() {
        let mut delete = Delete::new(namespace(), doc! { "x": 1 }, Some(1), None, None);
        let command = delete.build(&StreamDescription::new_testing()).unwrap();

        assert_eq!(command.name, "delete");
        assert_eq!(command.document_sequences.len(), 1);
        let sequence = &command.document_sequences[0];
        assert_eq!(sequence.identifier, "deletes");
        assert_eq!(sequence.documents[0].get_i64("limit").ok(), None);
        assert_eq!(sequence.documents[0].get_i32("limit").unwrap(), 1);
    }

    #[test]
    fn write_concern_error_surfaces_after_count() {
        let delete = Delete::new(namespace(), doc! {}, None, None, None);
        let response = RawCommandResponse::with_document(doc! {
            "ok": 1,
            "n": 3,
            "writeConcernError": { "code": 64, "codeName": "WriteConcernFailed", "errmsg": "waiting for replication timed out" },
        });
        let error = delete
            .handle_response(response, &StreamDescription::new_testing())
            .unwrap_err();
        assert!(matches!(
            error.kind.as_ref(),
            ErrorKind::BulkWrite(ref failure) if failure.write_concern_error.is_some()
        ));
    }
}
