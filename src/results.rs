//! Contains the types of results returned by CRUD operations.

use std::collections::HashMap;

use bson::{Bson, Document};
use serde::Serialize;

/// The result of an insert of a single document.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertOneResult {
    /// The `_id` field of the document inserted.
    pub inserted_id: Bson,
}

impl InsertOneResult {
    pub(crate) fn from_insert_many_result(result: InsertManyResult) -> Self {
        Self {
            inserted_id: result
                .inserted_ids
                .get(&0)
                .cloned()
                .unwrap_or(Bson::Null),
        }
    }
}

/// The result of an insert of multiple documents.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertManyResult {
    /// The `_id` field of the documents inserted, keyed by their index in the input.
    pub inserted_ids: HashMap<usize, Bson>,
}

impl InsertManyResult {
    pub(crate) fn new() -> Self {
        InsertManyResult {
            inserted_ids: HashMap::new(),
        }
    }
}

/// The result of an update operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateResult {
    /// The number of documents that matched the filter.
    pub matched_count: u64,

    /// The number of documents that were modified by the operation.
    pub modified_count: u64,

    /// The `_id` field of the upserted document.
    pub upserted_id: Option<Bson>,
}

/// The result of a delete operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DeleteResult {
    /// The number of documents deleted by the operation.
    pub deleted_count: u64,
}

/// The result of a bulk write, aggregated across all of its batches and indexed against the
/// caller's original input order.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkWriteResult {
    /// The number of documents inserted.
    pub inserted_count: u64,

    /// The `_id` field of the inserted documents, keyed by their index in the caller's input.
    pub inserted_ids: HashMap<usize, Bson>,

    /// The number of documents matched by update operations.
    pub matched_count: u64,

    /// The number of documents modified by update operations.
    pub modified_count: u64,

    /// The upserted ids, keyed by the index of the originating op in the caller's input.
    pub upserted_ids: HashMap<usize, Bson>,

    /// The number of documents deleted.
    pub deleted_count: u64,

    /// The per-document failures, each indexed against the caller's input order.
    pub write_errors: Vec<crate::error::BulkWriteError>,

    /// Any write concern errors reported by the batches. These never halt processing and are
    /// reported once everything attempted has been recorded.
    pub write_concern_errors: Vec<crate::error::WriteConcernError>,
}

/// The result of a `createIndexes` operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CreateIndexesResult {
    /// The names of the indexes created, in the order they were specified.
    pub index_names: Vec<String>,
}

/// The result of a `findAndModify` style operation: the document before (or, with
/// `returnDocument: After`, after) the modification, if any matched.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct FindAndModifyResult {
    /// The matched document.
    pub value: Option<Document>,
}
