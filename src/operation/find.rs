use bson::{doc, Document};

use super::{handle_response, CursorBody, LegacyRequest, Operation, Retryability};
use crate::{
    cmap::{conn::wire::legacy, Command, RawCommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::{ErrorKind, Result},
    options::{CursorType, FindOptions},
    selection_criteria::SelectionCriteria,
    Namespace,
};

/// The `find` operation: runs the `find` command on 3.2+ servers and falls back to a raw
/// OP_QUERY against the collection on older ones. Either way the output is a cursor
/// specification pinned to the answering server.
#[derive(Debug)]
pub(crate) struct Find {
    ns: Namespace,
    filter: Document,
    options: Option<FindOptions>,
    selection_criteria: Option<SelectionCriteria>,
}

impl Find {
    pub(crate) fn new(
        ns: Namespace,
        filter: Document,
        options: Option<FindOptions>,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Self {
        Self {
            ns,
            filter,
            options,
            selection_criteria,
        }
    }

    fn cursor_type(&self) -> CursorType {
        self.options
            .as_ref()
            .and_then(|options| options.cursor_type)
            .unwrap_or(CursorType::NonTailable)
    }

    fn batch_size(&self) -> Option<u32> {
        self.options.as_ref().and_then(|options| options.batch_size)
    }

    fn max_await_time(&self) -> Option<std::time::Duration> {
        match self.cursor_type() {
            CursorType::TailableAwait => self
                .options
                .as_ref()
                .and_then(|options| options.max_await_time),
            _ => None,
        }
    }
}

impl Operation for Find {
    type O = CursorSpecification;

    const NAME: &'static str = "find";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        super::verify_collation_support(
            description,
            self.options
                .as_ref()
                .and_then(|options| options.collation.as_ref()),
        )?;

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "filter": self.filter.clone(),
        };

        if let Some(ref options) = self.options {
            if let Some(allow_partial) = options.allow_partial_results {
                body.insert("allowPartialResults", allow_partial);
            }
            if let Some(batch_size) = options.batch_size {
                body.insert("batchSize", batch_size as i32);
            }
            if let Some(ref collation) = options.collation {
                body.insert("collation", collation.clone());
            }
            if let Some(limit) = options.limit {
                body.insert("limit", limit);
            }
            // The initial query's server-side budget is maxTimeMS on `find`; the await budget
            // of a tailable-await cursor applies to `getMore` only.
            if let Some(max_time) = options.max_time {
                body.insert("maxTimeMS", max_time.as_millis() as i64);
            }
            if let Some(no_timeout) = options.no_cursor_timeout {
                body.insert("noCursorTimeout", no_timeout);
            }
            if let Some(ref projection) = options.projection {
                body.insert("projection", projection.clone());
            }
            if let Some(skip) = options.skip {
                body.insert("skip", skip as i64);
            }
            if let Some(ref sort) = options.sort {
                body.insert("sort", sort.clone());
            }
        }

        match self.cursor_type() {
            CursorType::NonTailable => {}
            CursorType::Tailable => {
                body.insert("tailable", true);
            }
            CursorType::TailableAwait => {
                body.insert("tailable", true);
                body.insert("awaitData", true);
            }
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn build_legacy(&mut self, description: &StreamDescription) -> Result<Option<LegacyRequest>> {
        if description.supports_find_command() {
            return Ok(None);
        }

        if self
            .options
            .as_ref()
            .and_then(|options| options.collation.as_ref())
            .is_some()
        {
            return Err(ErrorKind::InvalidArgument {
                message: "Specifying a collation requires server version 3.4 or higher"
                    .to_string(),
            }
            .into());
        }

        let mut flags = legacy::QueryFlags::empty();
        match self.cursor_type() {
            CursorType::NonTailable => {}
            CursorType::Tailable => flags |= legacy::QueryFlags::TAILABLE_CURSOR,
            CursorType::TailableAwait => {
                flags |= legacy::QueryFlags::TAILABLE_CURSOR | legacy::QueryFlags::AWAIT_DATA
            }
        }

        let options = self.options.as_ref();

        if options.and_then(|o| o.no_cursor_timeout) == Some(true) {
            flags |= legacy::QueryFlags::NO_CURSOR_TIMEOUT;
        }
        if options.and_then(|o| o.allow_partial_results) == Some(true) {
            flags |= legacy::QueryFlags::PARTIAL;
        }
        if !matches!(
            self.selection_criteria,
            None | Some(SelectionCriteria::ReadPreference(
                crate::selection_criteria::ReadPreference::Primary
            ))
        ) {
            flags |= legacy::QueryFlags::SECONDARY_OK;
        }

        let mut query = doc! { "$query": self.filter.clone() };
        if let Some(sort) = options.and_then(|o| o.sort.as_ref()) {
            query.insert("$orderby", sort.clone());
        }
        if let Some(max_time) = options.and_then(|o| o.max_time) {
            query.insert("$maxTimeMS", max_time.as_millis() as i64);
        }

        let number_to_return = match (
            options.and_then(|o| o.limit),
            options.and_then(|o| o.batch_size),
        ) {
            (Some(limit), Some(batch_size)) => (limit.min(batch_size as i64)) as i32,
            (Some(limit), None) => limit as i32,
            (None, Some(batch_size)) => batch_size as i32,
            (None, None) => 0,
        };

        Ok(Some(LegacyRequest::Query(legacy::Query {
            flags,
            full_collection_name: self.ns.to_string(),
            number_to_skip: options.and_then(|o| o.skip).unwrap_or(0) as i32,
            number_to_return,
            query,
            return_field_selector: options.and_then(|o| o.projection.clone()),
            request_id: None,
        })))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: CursorBody = handle_response(&response)?.body;

        Ok(CursorSpecification::new(
            body.cursor,
            description.server_address.clone(),
            self.batch_size(),
            self.max_await_time(),
        ))
    }

    fn handle_legacy_response(
        &self,
        reply: legacy::Reply,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        if reply.flags.contains(legacy::ReplyFlags::QUERY_FAILURE) {
            // Convert the $err document into the equivalent command error.
            return reply.into_command_response().map(|_| unreachable!());
        }

        Ok(CursorSpecification {
            ns: self.ns.clone(),
            address: description.server_address.clone(),
            id: reply.cursor_id,
            batch_size: self.batch_size(),
            max_await_time: self.max_await_time(),
            initial_buffer: reply.documents.into_iter().collect(),
        })
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn supports_read_concern(&self, description: &StreamDescription) -> bool {
        description.supports_read_concern()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn namespace() -> Namespace {
        Namespace::new("test", "coll")
    }

    #[test]
    fn tailable_await_sets_flags_but_not_max_time() {
        let options = FindOptions::builder()
            .cursor_type(CursorType::TailableAwait)
            .max_await_time(Duration::from_secs(2))
            .build();
        let mut find = Find::new(namespace(), doc! {}, Some(options), None);
        let command = find.build(&StreamDescription::new_testing()).unwrap();

        assert_eq!(command.body.get_bool("tailable"), Ok(true));
        assert_eq!(command.body.get_bool("awaitData"), Ok(true));
        // The await budget belongs to getMore, not to find.
        assert!(!command.body.contains_key("maxTimeMS"));
        assert_eq!(find.max_await_time(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn max_time_goes_to_find() {
        let options = FindOptions::builder()
            .max_time(Duration::from_millis(150))
            .build();
        let mut find = Find::new(namespace(), doc! {}, Some(options), None);
        let command = find.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(command.body.get_i64("maxTimeMS"), Ok(150));
    }

    #[test]
    fn legacy_servers_get_op_query() {
        let options = FindOptions::builder()
            .skip(4u64)
            .limit(2i64)
            .sort(doc! { "x": 1 })
            .build();
        let mut find = Find::new(namespace(), doc! { "y": 5 }, Some(options), None);

        let request = find
            .build_legacy(&StreamDescription::new_legacy_testing(3))
            .unwrap()
            .expect("legacy server should use OP_QUERY");

        match request {
            LegacyRequest::Query(query) => {
                assert_eq!(query.full_collection_name, "test.coll");
                assert_eq!(query.number_to_skip, 4);
                assert_eq!(query.number_to_return, 2);
                assert_eq!(
                    query.query,
                    doc! { "$query": { "y": 5 }, "$orderby": { "x": 1 } }
                );
            }
            other => panic!("expected query, got {:?}", other),
        }

        // Modern servers use the find command.
        assert!(find
            .build_legacy(&StreamDescription::new_testing())
            .unwrap()
            .is_none());
    }
}
