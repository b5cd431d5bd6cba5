use std::{collections::VecDeque, time::Duration};

use bson::Document;

use crate::{
    error::Result,
    operation::{CursorInfo, GetMore, KillCursors},
    options::ServerAddress,
    Client,
    ClientSession,
    Namespace,
};

/// Specification used to create a new cursor from an initial server reply. A cursor is bound
/// to the server that created it: `getMore` and `killCursors` always target that address.
#[derive(Debug, Clone)]
pub(crate) struct CursorSpecification {
    pub(crate) ns: Namespace,
    pub(crate) address: ServerAddress,
    pub(crate) id: i64,
    pub(crate) batch_size: Option<u32>,
    pub(crate) max_await_time: Option<Duration>,
    pub(crate) initial_buffer: VecDeque<Document>,
}

impl CursorSpecification {
    pub(crate) fn new(
        info: CursorInfo,
        address: ServerAddress,
        batch_size: Option<u32>,
        max_await_time: Option<Duration>,
    ) -> Self {
        let mut buffer = info.first_batch;
        if buffer.is_empty() {
            buffer = info.next_batch;
        }
        Self {
            ns: info.ns,
            address,
            id: info.id,
            batch_size,
            max_await_time,
            initial_buffer: buffer,
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.id == 0
    }
}

/// A cursor over the results of a query, streaming documents in server-defined batches.
///
/// Iteration surfaces `getMore` failures on the `next` call that triggered them. If the
/// cursor is dropped before exhaustion, the server-side cursor is killed on a best-effort
/// basis.
#[derive(Debug)]
pub struct Cursor {
    client: Client,
    ns: Namespace,
    address: ServerAddress,
    id: i64,
    batch_size: Option<u32>,
    max_await_time: Option<Duration>,
    buffer: VecDeque<Document>,
    session: Option<ClientSession>,
}

impl Cursor {
    pub(crate) fn new(
        client: Client,
        spec: CursorSpecification,
        session: Option<ClientSession>,
    ) -> Self {
        Self {
            client,
            ns: spec.ns,
            address: spec.address,
            id: spec.id,
            batch_size: spec.batch_size,
            max_await_time: spec.max_await_time,
            buffer: spec.initial_buffer,
            session,
        }
    }

    /// The namespace this cursor iterates.
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// The address of the server that created and serves this cursor.
    pub fn server_address(&self) -> &ServerAddress {
        &self.address
    }

    fn is_exhausted(&self) -> bool {
        self.id == 0
    }

    /// Advances the cursor, returning the next document. `None` indicates the cursor is
    /// exhausted. A tailable-await cursor blocks in `getMore` (up to the configured
    /// `max_await_time`, server-side) and returns `None` for an empty batch without becoming
    /// exhausted.
    pub async fn next(&mut self) -> Option<Result<Document>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Some(Ok(doc));
            }

            if self.is_exhausted() {
                return None;
            }

            let get_more = GetMore::new(
                self.ns.clone(),
                self.id,
                self.address.clone(),
                self.batch_size,
                self.max_await_time,
            );

            let result = self
                .client
                .execute_operation_with_optional_session(get_more, self.session.as_mut())
                .await;

            match result {
                Ok(batch) => {
                    self.id = batch.id;
                    self.buffer = batch.batch;

                    // A live tailable cursor may legitimately return an empty batch; report it
                    // to the caller rather than spinning in getMore.
                    if self.buffer.is_empty() {
                        return None;
                    }
                }
                Err(e) => {
                    self.mark_exhausted();
                    return Some(Err(e));
                }
            }
        }
    }

    fn mark_exhausted(&mut self) {
        self.id = 0;
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.is_exhausted() {
            return;
        }

        // killCursors is best-effort: failures are swallowed.
        let kill = KillCursors::new(self.ns.clone(), vec![self.id], self.address.clone());
        let client = self.client.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = client.execute_operation_without_session(kill).await;
            });
        }
    }
}
