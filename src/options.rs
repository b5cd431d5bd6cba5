//! Contains all of the types needed to specify options for operations and for the client
//! itself.

use std::time::Duration;

use bson::{doc, Document};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

pub use crate::{
    client::{
        auth::{AuthMechanism, Credential},
        options::{ClientOptions, ServerAddress, Tls, TlsOptions},
        session::SessionOptions,
    },
    compression::Compressor,
    concern::{Acknowledgment, ReadConcern, ReadConcernLevel, WriteConcern},
    operation::UpdateModifications,
    selection_criteria::{
        HedgedReadOptions,
        ReadPreference,
        ReadPreferenceOptions,
        SelectionCriteria,
        TagSet,
    },
};

/// The type of cursor a query produces.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub enum CursorType {
    /// A regular, non-tailable cursor: exhausted once all matching results are returned.
    NonTailable,

    /// A tailable cursor over a capped collection that remains open after the last result.
    Tailable,

    /// A tailable cursor on which `getMore` blocks server-side for new results up to
    /// `max_await_time`.
    TailableAwait,
}

/// Which version of a modified document a `findAndModify`-style operation returns.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub enum ReturnDocument {
    /// Return the document after modification.
    After,

    /// Return the document before modification.
    Before,
}

impl ReturnDocument {
    pub(crate) fn as_bool(&self) -> bool {
        matches!(self, ReturnDocument::After)
    }
}

/// The options for a find operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct FindOptions {
    /// If true, partial results will be returned from a mongos rather than an error when one
    /// or more shards is down.
    pub allow_partial_results: Option<bool>,

    /// The number of documents the server should return per cursor batch.
    pub batch_size: Option<u32>,

    /// The collation to use for string comparisons; requires MongoDB 3.4+.
    pub collation: Option<Document>,

    /// The type of cursor to return.
    #[serde(skip)]
    pub cursor_type: Option<CursorType>,

    /// The maximum number of documents to return.
    pub limit: Option<i64>,

    /// The server-side time limit for the initial query.
    #[serde(skip)]
    pub max_time: Option<Duration>,

    /// The maximum amount of time for the server to wait on new documents to satisfy a
    /// tailable-await cursor's `getMore`. Sent as the `maxTimeMS` of each `getMore` only.
    #[serde(skip)]
    pub max_await_time: Option<Duration>,

    /// Whether the server should close the cursor after a period of inactivity.
    pub no_cursor_timeout: Option<bool>,

    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// The number of documents to skip before counting.
    pub skip: Option<u64>,

    /// The order of the documents for the purposes of the operation.
    pub sort: Option<Document>,
}

/// The options for an aggregate operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct AggregateOptions {
    /// Enables writing to temporary files on the server.
    pub allow_disk_use: Option<bool>,

    /// The number of documents the server should return per cursor batch.
    #[serde(skip)]
    pub batch_size: Option<u32>,

    /// Opt out of document-level validation for `$out`/`$merge` stages.
    pub bypass_document_validation: Option<bool>,

    /// The collation to use for string comparisons; requires MongoDB 3.4+.
    pub collation: Option<Document>,

    /// The server-side time limit for the aggregation.
    #[serde(skip)]
    pub max_time: Option<Duration>,
}

/// A description of an index to create.
#[derive(Clone, Debug, TypedBuilder)]
#[non_exhaustive]
pub struct IndexModel {
    /// The index specification document: field names mapped to index directions or types.
    pub keys: Document,

    /// Additional options such as `unique` or a custom `name`, merged into the index
    /// document.
    #[builder(default, setter(into, strip_option))]
    pub options: Option<Document>,
}

impl IndexModel {
    /// The name of this index, either the one given in the options or the one derived from
    /// its keys the way the server derives it.
    pub(crate) fn index_name(&self) -> String {
        if let Some(name) = self
            .options
            .as_ref()
            .and_then(|options| options.get_str("name").ok())
        {
            return name.to_string();
        }

        let mut parts = Vec::new();
        for (key, value) in self.keys.iter() {
            match crate::bson_util::get_int(value) {
                Some(i) => parts.push(format!("{}_{}", key, i)),
                None => match value.as_str() {
                    Some(s) => parts.push(format!("{}_{}", key, s)),
                    None => parts.push(key.to_string()),
                },
            }
        }
        parts.join("_")
    }

    /// The document form of this index as it appears in a `createIndexes` command or a
    /// `system.indexes` insert.
    pub(crate) fn to_index_document(&self, ns: Option<&crate::Namespace>) -> Document {
        let mut index = doc! {
            "key": self.keys.clone(),
            "name": self.index_name(),
        };

        if let Some(ref options) = self.options {
            for (key, value) in options.iter() {
                if key != "name" {
                    index.insert(key, value.clone());
                }
            }
        }

        if let Some(ns) = ns {
            index.insert("ns", ns.to_string());
        }

        index
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_names_derived_from_keys() {
        let model = IndexModel::builder().keys(doc! { "a": 1, "b": -1 }).build();
        assert_eq!(model.index_name(), "a_1_b_-1");

        let text = IndexModel::builder().keys(doc! { "c": "text" }).build();
        assert_eq!(text.index_name(), "c_text");

        let named = IndexModel::builder()
            .keys(doc! { "a": 1 })
            .options(doc! { "name": "custom" })
            .build();
        assert_eq!(named.index_name(), "custom");
    }

    #[test]
    fn index_document_includes_options_and_ns() {
        let model = IndexModel::builder()
            .keys(doc! { "a": 1 })
            .options(doc! { "unique": true })
            .build();
        let ns = crate::Namespace::new("db", "coll");
        let doc = model.to_index_document(Some(&ns));
        assert_eq!(doc.get_str("name").unwrap(), "a_1");
        assert_eq!(doc.get_bool("unique").unwrap(), true);
        assert_eq!(doc.get_str("ns").unwrap(), "db.coll");
    }
}
