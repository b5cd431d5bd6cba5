use std::collections::HashMap;

use bson::{doc, oid::ObjectId, Bson, Document};

use super::{
    handle_response,
    Operation,
    Retryability,
    WriteResponseBody,
};
use crate::{
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, ErrorKind, Result},
    results::InsertManyResult,
    Namespace,
};

/// The `insert` write command: inserts one or more pre-validated documents into a namespace,
/// recording the `_id` assigned to each.
#[derive(Debug)]
pub(crate) struct Insert {
    ns: Namespace,
    documents: Vec<Document>,
    inserted_ids: Vec<Bson>,
    ordered: bool,
    bypass_document_validation: Option<bool>,
    write_concern: Option<WriteConcern>,
}

impl Insert {
    pub(crate) fn new(
        ns: Namespace,
        documents: Vec<Document>,
        ordered: Option<bool>,
        bypass_document_validation: Option<bool>,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            ns,
            documents,
            inserted_ids: Vec::new(),
            ordered: ordered.unwrap_or(true),
            bypass_document_validation,
            write_concern,
        }
    }

    pub(crate) fn new_single(
        ns: Namespace,
        document: Document,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self::new(ns, vec![document], None, None, write_concern)
    }
}

impl Operation for Insert {
    type O = InsertManyResult;

    const NAME: &'static str = "insert";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.inserted_ids.clear();

        let max_size = description.max_bson_object_size as usize;
        let mut documents = Vec::with_capacity(self.documents.len());

        for document in &self.documents {
            let mut document = document.clone();

            // Documents without an `_id` get a driver-generated ObjectId, recorded so the
            // caller learns the ids of its inserts.
            let id = match document.get("_id") {
                Some(id) => id.clone(),
                None => {
                    let id = Bson::ObjectId(ObjectId::new());
                    let mut with_id = doc! { "_id": id.clone() };
                    with_id.extend(document);
                    document = with_id;
                    id
                }
            };

            let size = bson_util::document_byte_size(&document)?;
            if size > max_size {
                return Err(ErrorKind::InvalidDocument {
                    message: format!(
                        "document size {} exceeds the {}-byte maximum",
                        size, max_size
                    ),
                    document,
                }
                .into());
            }

            self.inserted_ids.push(id);
            documents.push(document);
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "ordered": self.ordered,
        };

        if let Some(bypass) = self.bypass_document_validation {
            body.insert("bypassDocumentValidation", bypass);
        }

        if let Some(ref write_concern) = self.write_concern {
            if !write_concern.is_empty() {
                body.insert("writeConcern", bson::to_bson(write_concern)?);
            }
        }

        let mut command = Command::new(Self::NAME, self.ns.db.clone(), body);
        command.add_document_sequence("documents", documents);
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: WriteResponseBody = handle_response(&response)?.body;

        let mut map = HashMap::new();
        if self.ordered {
            // in ordered inserts, only the first n were attempted.
            for (i, id) in self
                .inserted_ids
                .iter()
                .enumerate()
                .take(body.n as usize)
            {
                map.insert(i, id.clone());
            }
        } else {
            // for unordered, add all the attempted ids and then remove the ones that have
            // associated write errors.
            for (i, id) in self.inserted_ids.iter().enumerate() {
                map.insert(i, id.clone());
            }

            if let Some(write_errors) = body.write_errors.as_ref() {
                for err in write_errors {
                    map.remove(&err.index);
                }
            }
        }

        if body.write_errors.is_some() || body.write_concern_error.is_some() {
            return Err(Error::new(
                ErrorKind::BulkWrite(crate::error::BulkWriteFailure {
                    write_errors: body.write_errors.clone(),
                    write_concern_error: body.write_concern_error.clone(),
                    inserted_ids: map,
                }),
                body.labels.clone(),
            ));
        }

        Ok(InsertManyResult { inserted_ids: map })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn namespace() -> Namespace {
        Namespace::new("test", "coll")
    }

    #[test]
    fn build_assigns_ids_and_uses_document_sequence() {
        let mut insert = Insert::new(
            namespace(),
            vec![doc! { "x": 1 }, doc! { "_id": 42, "x": 2 }],
            None,
            None,
            None,
        );

        let command = insert.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(command.name, "insert");
        assert_eq!(command.target_db, "test");
        assert_eq!(command.body.get_str("insert").unwrap(), "coll");
        assert_eq!(command.body.get_bool("ordered").unwrap(), true);

        assert_eq!(command.document_sequences.len(), 1);
        let sequence = &command.document_sequences[0];
        assert_eq!(sequence.identifier, "documents");
        assert_eq!(sequence.documents.len(), 2);

        // The first document got a generated ObjectId; the second kept its own.
        assert!(matches!(insert.inserted_ids[0], Bson::ObjectId(_)));
        assert_eq!(insert.inserted_ids[1], Bson::Int32(42));
        assert!(sequence.documents[0].contains_key("_id"));
    }

    #[test]
    fn oversized_document_rejected_before_the_wire() {
        let mut description = StreamDescription::new_testing();
        description.max_bson_object_size = 64;

        let big = "x".repeat(128);
        let mut insert = Insert::new_single(namespace(), doc! { "big": big }, None);

        let error = insert.build(&description).unwrap_err();
        assert!(matches!(
            error.kind.as_ref(),
            ErrorKind::InvalidDocument { .. }
        ));
    }

    #[test]
    fn response_with_write_errors_preserves_successful_ids() {
        let mut insert = Insert::new(
            namespace(),
            vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
            Some(true),
            None,
            None,
        );
        insert.build(&StreamDescription::new_testing()).unwrap();

        let response = RawCommandResponse::with_document(doc! {
            "ok": 1,
            "n": 1,
            "writeErrors": [ { "index": 1, "code": 11000, "errmsg": "duplicate key" } ],
        });

        let error = insert
            .handle_response(response, &StreamDescription::new_testing())
            .unwrap_err();

        match error.kind.as_ref() {
            ErrorKind::BulkWrite(failure) => {
                assert_eq!(failure.inserted_ids.len(), 1);
                assert_eq!(failure.inserted_ids.get(&0), Some(&Bson::Int32(1)));
                let write_errors = failure.write_errors.as_ref().unwrap();
                assert_eq!(write_errors.len(), 1);
                assert_eq!(write_errors[0].index, 1);
            }
            other => panic!("expected bulk write error, got {:?}", other),
        }
    }
}
