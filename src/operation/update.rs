use bson::{doc, Bson, Document};
use serde::Deserialize;

use super::{handle_response, Operation, Retryability, WriteResponseBody};
use crate::{
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, ErrorKind, Result},
    results::UpdateResult,
    Namespace,
};

/// The modifications an update applies: either a document of update operators, a replacement
/// document, or an aggregation pipeline (4.2+).
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum UpdateModifications {
    /// A document of update operators, or a replacement document when no top-level key is an
    /// operator.
    Document(Document),

    /// An aggregation pipeline.
    Pipeline(Vec<Document>),
}

impl UpdateModifications {
    pub(crate) fn to_bson(&self) -> Bson {
        match self {
            Self::Document(doc) => Bson::Document(doc.clone()),
            Self::Pipeline(pipeline) => bson_util::to_bson_array(pipeline),
        }
    }

    /// Whether the document form is a replacement rather than a set of update operators.
    pub(crate) fn is_replacement(&self) -> bool {
        match self {
            Self::Document(doc) => !matches!(
                bson_util::first_key(doc),
                Some(key) if key.starts_with('$')
            ),
            Self::Pipeline(_) => false,
        }
    }

    /// Validates this update: operator documents must contain only operators, replacements
    /// must contain no operators or dotted keys.
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Self::Document(doc) => {
                if self.is_replacement() {
                    bson_util::replacement_document_check(doc)
                } else {
                    bson_util::update_document_check(doc)
                }
            }
            Self::Pipeline(_) => Ok(()),
        }
    }
}

impl From<Document> for UpdateModifications {
    fn from(item: Document) -> Self {
        UpdateModifications::Document(item)
    }
}

/// The `update` write command.
#[derive(Debug)]
pub(crate) struct Update {
    ns: Namespace,
    filter: Document,
    update: UpdateModifications,
    multi: Option<bool>,
    upsert: Option<bool>,
    collation: Option<Document>,
    bypass_document_validation: Option<bool>,
    write_concern: Option<WriteConcern>,
}

impl Update {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ns: Namespace,
        filter: Document,
        update: UpdateModifications,
        multi: bool,
        upsert: Option<bool>,
        collation: Option<Document>,
        bypass_document_validation: Option<bool>,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            ns,
            filter,
            update,
            multi: multi.then(|| true),
            upsert,
            collation,
            bypass_document_validation,
            write_concern,
        }
    }
}

impl Operation for Update {
    type O = UpdateResult;

    const NAME: &'static str = "update";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.update.validate()?;
        super::verify_collation_support(description, self.collation.as_ref())?;

        let mut update = doc! {
            "q": self.filter.clone(),
            "u": self.update.to_bson(),
        };

        if let Some(multi) = self.multi {
            update.insert("multi", multi);
        }

        if let Some(upsert) = self.upsert {
            update.insert("upsert", upsert);
        }

        if let Some(ref collation) = self.collation {
            update.insert("collation", collation.clone());
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "ordered": true,
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
        command.add_document_sequence("updates", vec![update]);
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: WriteResponseBody<UpdateBody> = handle_response(&response)?.body;
        body.validate()?;

        let modified_count = body.n_modified;
        let upserted_id = body
            .upserted
            .as_ref()
            .and_then(|upserted| upserted.first())
            .map(|upserted| upserted.id.clone());

        let matched_count = if upserted_id.is_some() { 0 } else { body.n };

        Ok(UpdateResult {
            matched_count,
            modified_count,
            upserted_id,
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        if self.multi != Some(true) {
            Retryability::Write
        } else {
            Retryability::None
        }
    }
}

#[derive(Deserialize, Debug)]
pub(crate) struct UpdateBody {
    #[serde(rename = "nModified", default)]
    n_modified: u64,
    upserted: Option<Vec<Upserted>>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct Upserted {
    #[serde(rename = "_id")]
    id: Bson,
}

#[cfg(test)]
mod test {
    use super::*;

    fn namespace() -> Namespace {
        Namespace::new("test", "coll")
    }

    #[test]
    fn replacement_with_operators_is_rejected() {
        let mut update = Update::new(
            namespace(),
            doc! { "x": 1 },
            UpdateModifications::Document(doc! { "a.b": 1 }),
            false,
            None,
            None,
            None,
            None,
        );
        let error = update.build(&StreamDescription::new_testing()).unwrap_err();
        assert!(matches!(
            error.kind.as_ref(),
            ErrorKind::InvalidDocument { .. }
        ));
    }

    #[test]
    fn collation_requires_modern_server() {
        let mut update = Update::new(
            namespace(),
            doc! {},
            UpdateModifications::Document(doc! { "$set": { "x": 1 } }),
            false,
            None,
            Some(doc! { "locale": "fr" }),
            None,
            None,
        );
        let error = update
            .build(&StreamDescription::new_legacy_testing(3))
            .unwrap_err();
        assert!(matches!(
            error.kind.as_ref(),
            ErrorKind::InvalidArgument { .. }
        ));
    }

    #[test]
    fn multi_updates_are_not_retryable() {
        let multi = Update::new(
            namespace(),
            doc! {},
            UpdateModifications::Document(doc! { "$set": { "x": 1 } }),
            true,
            None,
            None,
            None,
            None,
        );
        assert_eq!(multi.retryability(), Retryability::None);

        let single = Update::new(
            namespace(),
            doc! {},
            UpdateModifications::Document(doc! { "$set": { "x": 1 } }),
            false,
            None,
            None,
            None,
            None,
        );
        assert_eq!(single.retryability(), Retryability::Write);
    }

    #[test]
    fn upsert_reply_maps_to_result() {
        let update = Update::new(
            namespace(),
            doc! {},
            UpdateModifications::Document(doc! { "$set": { "x": 1 } }),
            false,
            Some(true),
            None,
            None,
            None,
        );

        let response = RawCommandResponse::with_document(doc! {
            "ok": 1,
            "n": 1,
            "nModified": 0,
            "upserted": [ { "index": 0, "_id": 7 } ],
        });
        let result = update
            .handle_response(response, &StreamDescription::new_testing())
            .unwrap();
        assert_eq!(result.matched_count, 0);
        assert_eq!(result.modified_count, 0);
        assert_eq!(result.upserted_id, Some(Bson::Int32(7)));
    }
}
