//! The bulk write engine: groups heterogeneous write models into per-type batches bounded by
//! the server's size and count limits, executes them with ordered or unordered semantics, and
//! merges the per-batch results back into a single result indexed against the caller's input
//! order.

mod models;

use std::collections::{HashMap, VecDeque};

use bson::{doc, Bson};
use serde::Deserialize;
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, ErrorKind, Result, WriteConcernError},
    operation::{self, Operation, Retryability},
    results::BulkWriteResult,
    Client,
    Namespace,
};

pub use models::WriteModel;
pub(crate) use models::{BulkOpType, EncodedOp};

/// Options for a bulk write.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkWriteOptions {
    /// Whether the operations are applied in order and processing halts on the first error
    /// (the default), or all operations are attempted regardless of individual failures.
    pub ordered: Option<bool>,

    /// Opt out of server-side document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// The write concern for the entire bulk write.
    pub write_concern: Option<WriteConcern>,
}

impl Client {
    /// Executes an ordered or unordered sequence of insert, update and delete operations
    /// against a single namespace as a minimal number of write commands.
    ///
    /// Per-document failures are aggregated into the returned
    /// [`BulkWriteResult`](crate::results::BulkWriteResult); terminal failures (network
    /// errors, a document too large to send, usage errors) are returned as errors.
    pub async fn bulk_write(
        &self,
        ns: Namespace,
        models: Vec<WriteModel>,
        options: Option<BulkWriteOptions>,
    ) -> Result<BulkWriteResult> {
        if models.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "bulk write requires at least one operation".to_string(),
            }
            .into());
        }

        let options = options.unwrap_or_default();
        let ordered = options.ordered.unwrap_or(true);

        // Pre-encode every model up front: each becomes raw command sub-document bytes with
        // its assigned `_id` recorded, and local validation failures surface before any wire
        // traffic.
        let max_batch_size = self.current_max_write_batch_size();
        let encoded: Vec<EncodedOp> = models
            .iter()
            .enumerate()
            .map(|(index, model)| model.encode(index))
            .collect::<Result<_>>()?;

        let mut batches: VecDeque<Batch> = build_batches(encoded, ordered, max_batch_size)
            .into_iter()
            .collect();

        let mut result = BulkWriteResult::default();
        let acknowledged = options
            .write_concern
            .as_ref()
            .map(WriteConcern::is_acknowledged)
            .unwrap_or(true);

        while let Some(batch) = batches.pop_front() {
            let operation = BatchOperation {
                ns: ns.clone(),
                batch: batch.clone(),
                options: options.clone(),
            };

            let outcome = match self.execute_operation(operation).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_command_size_error() => {
                    // The serialized command overflowed the server's limit: split the batch
                    // at its midpoint and retry the halves. A single op that still does not
                    // fit is a document error.
                    match batch.clone().split() {
                        Some((left, right)) => {
                            batches.push_front(right);
                            batches.push_front(left);
                            continue;
                        }
                        None => {
                            return Err(ErrorKind::InvalidDocument {
                                message: "a single operation exceeded the maximum command size \
                                          and cannot be split further"
                                    .to_string(),
                                document: batch.ops[0].body.clone(),
                            }
                            .into())
                        }
                    }
                }
                Err(e) => return Err(e),
            };

            if !acknowledged {
                continue;
            }

            let halt = outcome.merge_into(&mut result, &batch);

            // Ordered bulks stop at the first write error; what succeeded so far stays
            // recorded.
            if ordered && halt {
                break;
            }
        }

        Ok(result)
    }

    fn current_max_write_batch_size(&self) -> usize {
        self.topology()
            .description()
            .servers
            .values()
            .filter_map(|server| match server.reply {
                Ok(Some(ref reply)) => reply.command_response.max_write_batch_size,
                _ => None,
            })
            .min()
            .unwrap_or(1000) as usize
    }
}

/// A single batch: one write command's worth of same-type operations, remembering where each
/// came from in the caller's input.
#[derive(Clone, Debug)]
pub(crate) struct Batch {
    pub(crate) op_type: BulkOpType,
    pub(crate) ops: Vec<EncodedOp>,
}

impl Batch {
    /// Splits this batch into two halves, or `None` if it cannot be split further.
    fn split(self) -> Option<(Batch, Batch)> {
        if self.ops.len() < 2 {
            return None;
        }

        let mid = self.ops.len() / 2;
        let mut ops = self.ops;
        let right = ops.split_off(mid);

        Some((
            Batch {
                op_type: self.op_type,
                ops,
            },
            Batch {
                op_type: self.op_type,
                ops: right,
            },
        ))
    }

    fn original_index(&self, batch_local: usize) -> usize {
        self.ops
            .get(batch_local)
            .map(|op| op.original_index)
            .unwrap_or(batch_local)
    }
}

/// Groups the encoded ops into batches: ordered mode closes a batch whenever the op type
/// changes or the count limit is reached; unordered mode keeps one open batch per type and
/// flushes full ones.
pub(crate) fn build_batches(
    ops: Vec<EncodedOp>,
    ordered: bool,
    max_batch_size: usize,
) -> Vec<Batch> {
    let mut batches = Vec::new();

    if ordered {
        let mut current: Option<Batch> = None;

        for op in ops {
            let close = match current {
                Some(ref batch) => {
                    batch.op_type != op.op_type || batch.ops.len() >= max_batch_size
                }
                None => false,
            };

            if close {
                batches.push(current.take().unwrap());
            }

            current
                .get_or_insert_with(|| Batch {
                    op_type: op.op_type,
                    ops: Vec::new(),
                })
                .ops
                .push(op);
        }

        if let Some(batch) = current {
            batches.push(batch);
        }
    } else {
        let mut open: HashMap<BulkOpType, Batch> = HashMap::new();

        for op in ops {
            let op_type = op.op_type;
            let batch = open.entry(op_type).or_insert_with(|| Batch {
                op_type,
                ops: Vec::new(),
            });
            batch.ops.push(op);

            if batch.ops.len() >= max_batch_size {
                batches.push(open.remove(&op_type).unwrap());
            }
        }

        // Batches of different types may run in any order; emit leftovers type by type.
        batches.extend(open.into_values().filter(|batch| !batch.ops.is_empty()));
    }

    batches
}

/// The per-batch write command: `insert`, `update` or `delete` with its document sequence.
#[derive(Debug)]
struct BatchOperation {
    ns: Namespace,
    batch: Batch,
    options: BulkWriteOptions,
}

impl Operation for BatchOperation {
    type O = BatchOutcome;

    const NAME: &'static str = "bulkWrite";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let command_name = self.batch.op_type.command_name();

        let mut body = doc! {
            command_name: self.ns.coll.clone(),
            "ordered": self.options.ordered.unwrap_or(true),
        };

        if self.batch.op_type == BulkOpType::Insert || self.batch.op_type == BulkOpType::Update {
            if let Some(bypass) = self.options.bypass_document_validation {
                body.insert("bypassDocumentValidation", bypass);
            }
        }

        if let Some(ref write_concern) = self.options.write_concern {
            if !write_concern.is_empty() {
                body.insert("writeConcern", bson::to_bson(write_concern)?);
            }
        }

        let documents = self.batch.ops.iter().map(|op| op.body.clone()).collect();

        let mut command = Command::new(command_name, self.ns.db.clone(), body);
        command.add_document_sequence(self.batch.op_type.sequence_identifier(), documents);
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: operation::WriteResponseBody<BatchBody> =
            operation::handle_response(&response)?.body;

        Ok(BatchOutcome {
            op_type: self.batch.op_type,
            n: body.n,
            n_modified: body.n_modified,
            upserted: body
                .upserted
                .clone()
                .unwrap_or_default()
                .into_iter()
                .map(|upserted| (upserted.index, upserted.id))
                .collect(),
            write_errors: body.write_errors.clone().unwrap_or_default(),
            write_concern_error: body.write_concern_error.clone(),
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        if self.batch.ops.iter().all(|op| op.retryable) {
            Retryability::Write
        } else {
            Retryability::None
        }
    }

    fn name(&self) -> &str {
        self.batch.op_type.command_name()
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
struct BatchBody {
    #[serde(rename = "nModified", default)]
    n_modified: u64,

    upserted: Option<Vec<Upserted>>,
}

#[derive(Debug, Deserialize, Clone)]
struct Upserted {
    index: usize,

    #[serde(rename = "_id")]
    id: Bson,
}

/// What one batch accomplished, in batch-local index space.
#[derive(Debug)]
pub(crate) struct BatchOutcome {
    op_type: BulkOpType,
    n: u64,
    n_modified: u64,
    upserted: Vec<(usize, Bson)>,
    write_errors: Vec<crate::error::BulkWriteError>,
    write_concern_error: Option<WriteConcernError>,
}

impl BatchOutcome {
    /// Folds this outcome into the aggregate result, translating batch-local indices back to
    /// the caller's input positions. Returns whether an ordered bulk must halt.
    fn merge_into(self, result: &mut BulkWriteResult, batch: &Batch) -> bool {
        match self.op_type {
            BulkOpType::Insert => {
                result.inserted_count += self.n;

                let mut failed: std::collections::HashSet<usize> =
                    self.write_errors.iter().map(|e| e.index).collect();
                // In ordered batches the server stops at the first error, so everything after
                // it also failed.
                if let Some(first) = self.write_errors.first() {
                    if self.n as usize <= first.index {
                        failed.extend(first.index..batch.ops.len());
                    }
                }

                for (local, op) in batch.ops.iter().enumerate() {
                    if !failed.contains(&local) {
                        if let Some(ref id) = op.inserted_id {
                            result.inserted_ids.insert(op.original_index, id.clone());
                        }
                    }
                }
            }
            BulkOpType::Update => {
                let upserted_count = self.upserted.len() as u64;
                result.matched_count += self.n.saturating_sub(upserted_count);
                result.modified_count += self.n_modified;

                for (local, id) in self.upserted {
                    result.upserted_ids.insert(batch.original_index(local), id);
                }
            }
            BulkOpType::Delete => {
                result.deleted_count += self.n;
            }
        }

        let had_write_errors = !self.write_errors.is_empty();

        for mut error in self.write_errors {
            error.index = batch.original_index(error.index);
            result.write_errors.push(error);
        }

        // A write concern error is recorded but never halts processing.
        if let Some(write_concern_error) = self.write_concern_error {
            result.write_concern_errors.push(write_concern_error);
        }

        had_write_errors
    }
}

/// Raises an aggregated failure for callers that want thrown errors rather than the
/// aggregated result form.
pub fn result_into_error(result: BulkWriteResult) -> Option<Error> {
    if result.write_errors.is_empty() && result.write_concern_errors.is_empty() {
        return None;
    }

    Some(
        ErrorKind::BulkWrite(crate::error::BulkWriteFailure {
            write_errors: Some(result.write_errors.clone()),
            write_concern_error: result.write_concern_errors.first().cloned(),
            inserted_ids: result.inserted_ids.clone().into_iter().collect(),
        })
        .into(),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bulk_write::models::WriteModel;

    fn insert(x: i32) -> WriteModel {
        WriteModel::InsertOne {
            document: doc! { "x": x },
        }
    }

    fn delete(x: i32) -> WriteModel {
        WriteModel::DeleteOne {
            filter: doc! { "x": x },
            collation: None,
        }
    }

    fn encode_all(models: &[WriteModel]) -> Vec<EncodedOp> {
        models
            .iter()
            .enumerate()
            .map(|(i, m)| m.encode(i).unwrap())
            .collect()
    }

    #[test]
    fn ordered_batches_split_on_type_change() {
        let models = vec![insert(1), insert(2), delete(1), insert(3)];
        let batches = build_batches(encode_all(&models), true, 1000);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].op_type, BulkOpType::Insert);
        assert_eq!(batches[0].ops.len(), 2);
        assert_eq!(batches[1].op_type, BulkOpType::Delete);
        assert_eq!(batches[2].op_type, BulkOpType::Insert);
        // Original positions survive the batching.
        assert_eq!(batches[2].ops[0].original_index, 3);
    }

    #[test]
    fn ordered_batches_split_at_count_limit() {
        let models: Vec<_> = (0..5).map(insert).collect();
        let batches = build_batches(encode_all(&models), true, 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].ops.len(), 2);
        assert_eq!(batches[1].ops.len(), 2);
        assert_eq!(batches[2].ops.len(), 1);
    }

    #[test]
    fn unordered_batches_group_by_type() {
        let models = vec![insert(1), delete(1), insert(2), delete(2), insert(3)];
        let batches = build_batches(encode_all(&models), false, 1000);

        assert_eq!(batches.len(), 2);
        let insert_batch = batches
            .iter()
            .find(|b| b.op_type == BulkOpType::Insert)
            .unwrap();
        assert_eq!(insert_batch.ops.len(), 3);
        assert_eq!(
            insert_batch
                .ops
                .iter()
                .map(|op| op.original_index)
                .collect::<Vec<_>>(),
            vec![0, 2, 4]
        );
    }

    #[test]
    fn batch_splitting_halves_preserve_order() {
        let models: Vec<_> = (0..4).map(insert).collect();
        let batches = build_batches(encode_all(&models), true, 1000);
        let (left, right) = batches.into_iter().next().unwrap().split().unwrap();
        assert_eq!(
            left.ops.iter().map(|op| op.original_index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(
            right.ops.iter().map(|op| op.original_index).collect::<Vec<_>>(),
            vec![2, 3]
        );

        let single = Batch {
            op_type: BulkOpType::Insert,
            ops: encode_all(&[insert(1)]),
        };
        assert!(single.split().is_none());
    }

    #[test]
    fn write_errors_map_back_to_original_indices() {
        let models = vec![insert(1), delete(1), insert(2)];
        let batches = build_batches(encode_all(&models), true, 1000);
        // Third batch-local op 0 is original index 2.
        let last = batches.last().unwrap();

        let outcome = BatchOutcome {
            op_type: BulkOpType::Insert,
            n: 0,
            n_modified: 0,
            upserted: Vec::new(),
            write_errors: vec![crate::error::BulkWriteError {
                index: 0,
                code: 11000,
                code_name: None,
                message: "duplicate key".to_string(),
                details: None,
            }],
            write_concern_error: None,
        };

        let mut result = BulkWriteResult::default();
        let halt = outcome.merge_into(&mut result, last);
        assert!(halt);
        assert_eq!(result.write_errors.len(), 1);
        assert_eq!(result.write_errors[0].index, 2);
    }

    #[test]
    fn ordered_insert_error_drops_unattempted_ids() {
        let models = vec![insert(1), insert(2), insert(3)];
        let batches = build_batches(encode_all(&models), true, 1000);
        let batch = &batches[0];

        let outcome = BatchOutcome {
            op_type: BulkOpType::Insert,
            n: 1,
            n_modified: 0,
            upserted: Vec::new(),
            write_errors: vec![crate::error::BulkWriteError {
                index: 1,
                code: 11000,
                code_name: None,
                message: "duplicate key".to_string(),
                details: None,
            }],
            write_concern_error: None,
        };

        let mut result = BulkWriteResult::default();
        outcome.merge_into(&mut result, batch);
        assert_eq!(result.inserted_count, 1);
        assert_eq!(result.inserted_ids.len(), 1);
        assert!(result.inserted_ids.contains_key(&0));
    }

    #[test]
    fn write_concern_error_does_not_halt() {
        let models = vec![insert(1)];
        let batches = build_batches(encode_all(&models), true, 1000);

        let outcome = BatchOutcome {
            op_type: BulkOpType::Insert,
            n: 1,
            n_modified: 0,
            upserted: Vec::new(),
            write_errors: Vec::new(),
            write_concern_error: Some(WriteConcernError {
                code: 64,
                code_name: "WriteConcernFailed".to_string(),
                message: "timed out".to_string(),
                details: None,
            }),
        };

        let mut result = BulkWriteResult::default();
        let halt = outcome.merge_into(&mut result, &batches[0]);
        assert!(!halt);
        assert_eq!(result.write_concern_errors.len(), 1);
        assert_eq!(result.inserted_count, 1);
    }
}
