use bson::{doc, oid::ObjectId, Bson, Document};

use crate::{
    bson_util,
    error::Result,
    operation::UpdateModifications,
};

/// A single operation in a bulk write.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteModel {
    /// Insert one document.
    InsertOne {
        /// The document to insert.
        document: Document,
    },

    /// Update the first document matching the filter.
    UpdateOne {
        /// The match filter.
        filter: Document,
        /// The update operators to apply.
        update: UpdateModifications,
        /// Insert the document if no document matches.
        upsert: Option<bool>,
        /// The collation for string comparisons.
        collation: Option<Document>,
    },

    /// Update all documents matching the filter.
    UpdateMany {
        /// The match filter.
        filter: Document,
        /// The update operators to apply.
        update: UpdateModifications,
        /// Insert the document if no document matches.
        upsert: Option<bool>,
        /// The collation for string comparisons.
        collation: Option<Document>,
    },

    /// Replace the first document matching the filter.
    ReplaceOne {
        /// The match filter.
        filter: Document,
        /// The replacement document. May not contain update operators or dotted keys.
        replacement: Document,
        /// Insert the document if no document matches.
        upsert: Option<bool>,
        /// The collation for string comparisons.
        collation: Option<Document>,
    },

    /// Delete the first document matching the filter.
    DeleteOne {
        /// The match filter.
        filter: Document,
        /// The collation for string comparisons.
        collation: Option<Document>,
    },

    /// Delete all documents matching the filter.
    DeleteMany {
        /// The match filter.
        filter: Document,
        /// The collation for string comparisons.
        collation: Option<Document>,
    },
}

/// The write command a model belongs to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum BulkOpType {
    Insert,
    Update,
    Delete,
}

impl BulkOpType {
    pub(crate) fn command_name(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub(crate) fn sequence_identifier(&self) -> &'static str {
        match self {
            Self::Insert => "documents",
            Self::Update => "updates",
            Self::Delete => "deletes",
        }
    }
}

/// A write model pre-encoded into the sub-document shape its write command expects, tagged
/// with the input position it came from so that batch results can be mapped back.
#[derive(Clone, Debug)]
pub(crate) struct EncodedOp {
    pub(crate) op_type: BulkOpType,
    pub(crate) original_index: usize,
    pub(crate) body: Document,

    /// The `_id` this op will insert, when it is an insert.
    pub(crate) inserted_id: Option<Bson>,

    /// Whether the op is idempotent and thus eligible for single-retry semantics.
    pub(crate) retryable: bool,
}

impl WriteModel {
    /// Validates this model and encodes it into its command sub-document form. Inserts are
    /// assigned an `_id` here if they lack one.
    pub(crate) fn encode(&self, original_index: usize) -> Result<EncodedOp> {
        match self {
            WriteModel::InsertOne { document } => {
                let mut document = document.clone();
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

                Ok(EncodedOp {
                    op_type: BulkOpType::Insert,
                    original_index,
                    body: document,
                    inserted_id: Some(id),
                    retryable: true,
                })
            }

            WriteModel::UpdateOne {
                filter,
                update,
                upsert,
                collation,
            } => {
                update.validate()?;
                Ok(EncodedOp {
                    op_type: BulkOpType::Update,
                    original_index,
                    body: update_body(filter, update.to_bson(), false, *upsert, collation),
                    inserted_id: None,
                    retryable: true,
                })
            }

            WriteModel::UpdateMany {
                filter,
                update,
                upsert,
                collation,
            } => {
                update.validate()?;
                Ok(EncodedOp {
                    op_type: BulkOpType::Update,
                    original_index,
                    body: update_body(filter, update.to_bson(), true, *upsert, collation),
                    inserted_id: None,
                    retryable: false,
                })
            }

            WriteModel::ReplaceOne {
                filter,
                replacement,
                upsert,
                collation,
            } => {
                bson_util::replacement_document_check(replacement)?;
                Ok(EncodedOp {
                    op_type: BulkOpType::Update,
                    original_index,
                    body: update_body(
                        filter,
                        Bson::Document(replacement.clone()),
                        false,
                        *upsert,
                        collation,
                    ),
                    inserted_id: None,
                    retryable: true,
                })
            }

            WriteModel::DeleteOne { filter, collation } => Ok(EncodedOp {
                op_type: BulkOpType::Delete,
                original_index,
                body: delete_body(filter, 1, collation),
                inserted_id: None,
                retryable: true,
            }),

            WriteModel::DeleteMany { filter, collation } => Ok(EncodedOp {
                op_type: BulkOpType::Delete,
                original_index,
                body: delete_body(filter, 0, collation),
                inserted_id: None,
                retryable: false,
            }),
        }
    }
}

fn update_body(
    filter: &Document,
    update: Bson,
    multi: bool,
    upsert: Option<bool>,
    collation: &Option<Document>,
) -> Document {
    let mut body = doc! {
        "q": filter.clone(),
        "u": update,
        "multi": multi,
    };
    if let Some(upsert) = upsert {
        body.insert("upsert", upsert);
    }
    if let Some(ref collation) = collation {
        body.insert("collation", collation.clone());
    }
    body
}

fn delete_body(filter: &Document, limit: i32, collation: &Option<Document>) -> Document {
    let mut body = doc! {
        "q": filter.clone(),
        "limit": limit,
    };
    if let Some(ref collation) = collation {
        body.insert("collation", collation.clone());
    }
    body
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_encoding_assigns_missing_id() {
        let model = WriteModel::InsertOne {
            document: doc! { "x": 1 },
        };
        let encoded = model.encode(3).unwrap();
        assert_eq!(encoded.op_type, BulkOpType::Insert);
        assert_eq!(encoded.original_index, 3);
        assert!(encoded.body.contains_key("_id"));
        assert!(matches!(encoded.inserted_id, Some(Bson::ObjectId(_))));
        assert!(encoded.retryable);
    }

    #[test]
    fn replacement_with_dotted_keys_rejected() {
        let model = WriteModel::ReplaceOne {
            filter: doc! {},
            replacement: doc! { "a.b": 1 },
            upsert: None,
            collation: None,
        };
        assert!(model.encode(0).is_err());
    }

    #[test]
    fn update_one_requires_operators() {
        let model = WriteModel::UpdateOne {
            filter: doc! {},
            update: UpdateModifications::Document(doc! { "x": 1 }),
            upsert: None,
            collation: None,
        };
        assert!(model.encode(0).is_err());
    }

    #[test]
    fn multi_ops_are_not_retryable() {
        let update_many = WriteModel::UpdateMany {
            filter: doc! {},
            update: UpdateModifications::Document(doc! { "$set": { "x": 1 } }),
            upsert: None,
            collation: None,
        };
        assert!(!update_many.encode(0).unwrap().retryable);

        let delete_many = WriteModel::DeleteMany {
            filter: doc! {},
            collation: None,
        };
        let encoded = delete_many.encode(0).unwrap();
        assert!(!encoded.retryable);
        assert_eq!(encoded.body.get_i32("limit").unwrap(), 0);

        let delete_one = WriteModel::DeleteOne {
            filter: doc! {},
            collation: None,
        };
        assert!(delete_one.encode(0).unwrap().retryable);
    }
}
