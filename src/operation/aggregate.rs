use bson::{doc, Bson, Document};

use super::{handle_response, CursorBody, Operation, Retryability};
use crate::{
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::{ErrorKind, Result},
    operation::CursorInfo,
    options::AggregateOptions,
    selection_criteria::SelectionCriteria,
    Namespace,
};

/// The `aggregate` command, returning its results through a cursor.
#[derive(Debug)]
pub(crate) struct Aggregate {
    ns: Namespace,
    pipeline: Vec<Document>,
    options: Option<AggregateOptions>,
    selection_criteria: Option<SelectionCriteria>,
}

impl Aggregate {
    pub(crate) fn new(
        ns: Namespace,
        pipeline: impl IntoIterator<Item = Document>,
        options: Option<AggregateOptions>,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Self {
        Self {
            ns,
            pipeline: pipeline.into_iter().collect(),
            options,
            selection_criteria,
        }
    }

    /// Whether the pipeline writes its results server-side ($out or $merge final stage).
    fn is_out_or_merge(&self) -> bool {
        self.pipeline
            .last()
            .and_then(bson_util::first_key)
            .map(|key| key == "$out" || key == "$merge")
            .unwrap_or(false)
    }
}

impl Operation for Aggregate {
    type O = CursorSpecification;

    const NAME: &'static str = "aggregate";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        super::verify_collation_support(
            description,
            self.options
                .as_ref()
                .and_then(|options| options.collation.as_ref()),
        )?;

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "pipeline": bson_util::to_bson_array(&self.pipeline),
        };

        let mut cursor = Document::new();
        if let Some(batch_size) = self.options.as_ref().and_then(|o| o.batch_size) {
            if !(self.is_out_or_merge() && batch_size == 0) {
                cursor.insert("batchSize", batch_size as i32);
            }
        }
        body.insert("cursor", cursor);

        if let Some(ref options) = self.options {
            if let Some(allow_disk_use) = options.allow_disk_use {
                body.insert("allowDiskUse", allow_disk_use);
            }
            if let Some(bypass) = options.bypass_document_validation {
                body.insert("bypassDocumentValidation", bypass);
            }
            if let Some(ref collation) = options.collation {
                body.insert("collation", collation.clone());
            }
            if let Some(max_time) = options.max_time {
                body.insert("maxTimeMS", max_time.as_millis() as i64);
            }
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        // Servers predating cursor-based aggregation reply with a plain `result` array;
        // convert it into a synthetic single-batch cursor.
        if let Some(results) = response.raw().get_array("result").ok() {
            let batch = results
                .iter()
                .map(|item| match item {
                    Bson::Document(doc) => Ok(doc.clone()),
                    other => Err(ErrorKind::InvalidResponse {
                        message: format!("expected document in aggregate result, got {:?}", other),
                    }
                    .into()),
                })
                .collect::<Result<_>>()?;

            return Ok(CursorSpecification::new(
                CursorInfo {
                    id: 0,
                    ns: self.ns.clone(),
                    first_batch: batch,
                    next_batch: Default::default(),
                },
                description.server_address.clone(),
                None,
                None,
            ));
        }

        let body: CursorBody = handle_response(&response)?.body;

        Ok(CursorSpecification::new(
            body.cursor,
            description.server_address.clone(),
            self.options.as_ref().and_then(|o| o.batch_size),
            None,
        ))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn supports_read_concern(&self, description: &StreamDescription) -> bool {
        // $out and $merge aggregations are writes and do not accept a read concern.
        !self.is_out_or_merge() && description.supports_read_concern()
    }

    fn retryability(&self) -> Retryability {
        if self.is_out_or_merge() {
            Retryability::None
        } else {
            Retryability::Read
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn namespace() -> Namespace {
        Namespace::new("test", "coll")
    }

    #[test]
    fn pre_cursor_result_array_becomes_single_batch_cursor() {
        let aggregate = Aggregate::new(namespace(), vec![doc! { "$match": {} }], None, None);

        let response = RawCommandResponse::with_document(doc! {
            "ok": 1,
            "result": [ { "x": 1 }, { "x": 2 } ],
        });

        let spec = aggregate
            .handle_response(response, &StreamDescription::new_testing())
            .unwrap();

        assert!(spec.is_exhausted());
        assert_eq!(spec.initial_buffer.len(), 2);
    }

    #[test]
    fn cursor_reply_preserved() {
        let aggregate = Aggregate::new(namespace(), vec![doc! { "$match": {} }], None, None);

        let response = RawCommandResponse::with_document(doc! {
            "ok": 1,
            "cursor": {
                "id": 42i64,
                "ns": "test.coll",
                "firstBatch": [ { "x": 1 } ],
            },
        });

        let spec = aggregate
            .handle_response(response, &StreamDescription::new_testing())
            .unwrap();
        assert_eq!(spec.id, 42);
        assert_eq!(spec.initial_buffer.len(), 1);
    }

    #[test]
    fn out_pipelines_are_not_retryable() {
        let out = Aggregate::new(
            namespace(),
            vec![doc! { "$match": {} }, doc! { "$out": "dest" }],
            None,
            None,
        );
        assert_eq!(out.retryability(), Retryability::None);
        assert!(!out.supports_read_concern(&StreamDescription::new_testing()));

        let read_only = Aggregate::new(namespace(), vec![doc! { "$match": {} }], None, None);
        assert_eq!(read_only.retryability(), Retryability::Read);
    }
}
