use std::{collections::VecDeque, time::Duration};

use bson::{doc, Document};

use super::{handle_response, CursorBody, LegacyRequest, Operation, Retryability};
use crate::{
    cmap::{conn::wire::legacy, Command, RawCommandResponse, StreamDescription},
    error::{CommandError, ErrorKind, Result},
    options::ServerAddress,
    Namespace,
};

/// The next batch of a cursor, produced by a `getMore`.
#[derive(Debug)]
pub(crate) struct GetMoreResult {
    pub(crate) batch: VecDeque<Document>,
    pub(crate) id: i64,
}

/// The `getMore` operation. Always dispatched to the server that created the cursor, never
/// through server selection.
#[derive(Debug)]
pub(crate) struct GetMore {
    ns: Namespace,
    cursor_id: i64,
    address: ServerAddress,
    batch_size: Option<u32>,
    max_await_time: Option<Duration>,
}

impl GetMore {
    pub(crate) fn new(
        ns: Namespace,
        cursor_id: i64,
        address: ServerAddress,
        batch_size: Option<u32>,
        max_await_time: Option<Duration>,
    ) -> Self {
        Self {
            ns,
            cursor_id,
            address,
            batch_size,
            max_await_time,
        }
    }
}

impl Operation for GetMore {
    type O = GetMoreResult;

    const NAME: &'static str = "getMore";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.cursor_id,
            "collection": self.ns.coll.clone(),
        };

        if let Some(batch_size) = self.batch_size {
            if batch_size != 0 {
                body.insert("batchSize", batch_size as i32);
            }
        }

        // An awaitData cursor's await budget rides on every getMore as maxTimeMS.
        if let Some(max_await_time) = self.max_await_time {
            body.insert("maxTimeMS", max_await_time.as_millis() as i64);
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn build_legacy(&mut self, description: &StreamDescription) -> Result<Option<LegacyRequest>> {
        if description.supports_find_command() {
            return Ok(None);
        }

        Ok(Some(LegacyRequest::GetMore(legacy::GetMore {
            full_collection_name: self.ns.to_string(),
            number_to_return: self.batch_size.unwrap_or(0) as i32,
            cursor_id: self.cursor_id,
        })))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: CursorBody = handle_response(&response)?.body;

        Ok(GetMoreResult {
            batch: body.cursor.next_batch,
            id: body.cursor.id,
        })
    }

    fn handle_legacy_response(
        &self,
        reply: legacy::Reply,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        if reply.flags.contains(legacy::ReplyFlags::CURSOR_NOT_FOUND) {
            return Err(ErrorKind::Command(CommandError {
                code: 43,
                code_name: "CursorNotFound".to_string(),
                message: format!("cursor id {} not found", self.cursor_id),
            })
            .into());
        }

        Ok(GetMoreResult {
            batch: reply.documents.into_iter().collect(),
            id: reply.cursor_id,
        })
    }

    fn pinned_address(&self) -> Option<&ServerAddress> {
        Some(&self.address)
    }

    fn retryability(&self) -> Retryability {
        Retryability::None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn await_time_rides_on_get_more() {
        let mut get_more = GetMore::new(
            Namespace::new("test", "capped"),
            42,
            ServerAddress::parse("a:27017").unwrap(),
            None,
            Some(Duration::from_secs(2)),
        );
        let command = get_more.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(command.body.get_i64("getMore"), Ok(42));
        assert_eq!(command.body.get_i64("maxTimeMS"), Ok(2000));
    }

    #[test]
    fn pinned_to_originating_server() {
        let address = ServerAddress::parse("b:27018").unwrap();
        let get_more = GetMore::new(Namespace::new("db", "c"), 7, address.clone(), None, None);
        assert_eq!(get_more.pinned_address(), Some(&address));
    }
}
