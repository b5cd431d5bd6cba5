pub(crate) mod command;
mod stream;
pub(crate) mod stream_description;
pub(crate) mod wire;

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use bson::doc;
use lazy_static::lazy_static;
use tokio::io::AsyncWriteExt;

use self::wire::{legacy, Message, MessageFlags};
use crate::{
    bson_util,
    compression::Compressor,
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime,
};

pub(crate) use self::{
    command::{Command, RawCommandResponse},
    stream::AsyncStream,
    stream_description::StreamDescription,
};

lazy_static! {
    static ref CONNECTION_ID: AtomicU32 = AtomicU32::new(1);
}

/// User-facing information about a connection to the database.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A driver-generated identifier that uniquely identifies the connection.
    pub id: u32,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// A wrapper around a single TCP (optionally TLS) socket to an endpoint, tracking the
/// handshake-derived capability vector, per-socket request/reply sequencing and the negotiated
/// compressor. At most one request may be in flight at a time.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,

    stream: AsyncStream,
    error: bool,
    in_flight: bool,

    /// The time when this connection was last checked into the pool.
    ready_and_available_time: Option<Instant>,

    stream_description: Option<StreamDescription>,

    /// The compressor negotiated during the handshake, if any.
    pub(super) compressor: Option<Compressor>,

    /// The maximum amount of time to wait for a reply before the socket is considered broken.
    socket_timeout: Option<Duration>,
}

impl Connection {
    /// Opens a socket to the given address without handshaking. The `Handshaker` completes
    /// establishment.
    pub(crate) async fn connect(
        address: ServerAddress,
        generation: u32,
        connect_timeout: Option<Duration>,
        socket_timeout: Option<Duration>,
        tls_options: Option<&crate::client::options::TlsOptions>,
    ) -> Result<Self> {
        let stream = AsyncStream::connect(address.clone(), connect_timeout, tls_options).await?;
        Ok(Self {
            id: CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
            address,
            generation,
            stream,
            error: false,
            in_flight: false,
            ready_and_available_time: None,
            stream_description: None,
            compressor: None,
            socket_timeout,
        })
    }

    /// Opens a connection for monitoring. Monitoring connections are owned by their monitor and
    /// never enter the application pool.
    pub(crate) async fn connect_monitoring(
        address: ServerAddress,
        connect_timeout: Option<Duration>,
        tls_options: Option<&crate::client::options::TlsOptions>,
    ) -> Result<Self> {
        Self::connect(address, 0, connect_timeout, None, tls_options).await
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn set_stream_description(&mut self, description: StreamDescription) {
        self.stream_description = Some(description);
    }

    /// Gets the capability vector captured from this connection's handshake.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            Error::internal("cannot retrieve a StreamDescription before the handshake completes")
        })
    }

    /// Whether an I/O error was encountered on this connection, rendering it unusable.
    pub(crate) fn has_errored(&self) -> bool {
        self.error
    }

    pub(crate) fn mark_checked_in(&mut self) {
        self.ready_and_available_time = Some(Instant::now());
    }

    pub(crate) fn mark_checked_out(&mut self) {
        self.ready_and_available_time = None;
    }

    /// Whether this connection has sat idle in the pool longer than `max_idle_time`.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match (max_idle_time, self.ready_and_available_time) {
            (Some(max), Some(ready)) => Instant::now().duration_since(ready) >= max,
            _ => false,
        }
    }

    fn begin_request(&mut self) -> Result<()> {
        debug_assert!(!self.in_flight, "connection used while a request is in flight");
        if self.in_flight {
            return Err(Error::internal(
                "attempted to send a request on a connection with a request in flight",
            ));
        }
        self.in_flight = true;
        Ok(())
    }

    /// Executes a `Command` and returns its response. The OP_MSG transport is used when the
    /// handshake advertised support for it; OP_QUERY against the `$cmd` collection otherwise.
    /// An explicit `request_id` may be passed so that callers can correlate monitoring
    /// events; otherwise one is allocated.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
    ) -> Result<RawCommandResponse> {
        self.begin_request()?;
        let result = self.send_command_inner(command, request_id.into()).await;
        self.in_flight = false;

        if let Err(ref e) = result {
            if e.is_network_error() {
                self.error = true;
            }
        }

        result
    }

    /// Whether the command's write concern is `w: 0`, in which case the server sends no
    /// reply.
    fn is_unacknowledged(command: &Command) -> bool {
        command
            .body
            .get_document("writeConcern")
            .ok()
            .and_then(|wc| wc.get("w"))
            .and_then(bson_util::get_int)
            == Some(0)
    }

    async fn send_command_inner(
        &mut self,
        command: Command,
        request_id: Option<i32>,
    ) -> Result<RawCommandResponse> {
        self.check_command_size(&command)?;

        let use_op_msg = self
            .stream_description
            .as_ref()
            .map(StreamDescription::supports_op_msg)
            // The handshake itself runs before the description is cached; it always uses the
            // legacy transport, which every supported server understands.
            .unwrap_or(false);

        let compress = command.should_compress();
        let unacknowledged = Self::is_unacknowledged(&command);

        if use_op_msg {
            let mut message = Message::from_command(command, request_id);

            if unacknowledged {
                // The reply for a `w: 0` write never comes; moreToCome tells the server not to
                // send one.
                message.flags |= MessageFlags::MORE_TO_COME;
            }

            let request_id = match (compress, self.compressor.clone()) {
                (true, Some(ref compressor)) => {
                    message
                        .write_compressed_to(&mut self.stream, compressor)
                        .await?
                }
                _ => message.write_to(&mut self.stream).await?,
            };

            if unacknowledged {
                return Ok(RawCommandResponse::new(
                    self.address.clone(),
                    doc! { "ok": 1 },
                ));
            }

            let reply = self.read_op_msg().await?;
            if reply.response_to != request_id {
                return Err(Error::invalid_response(format!(
                    "expected a response to request {} but got a response to request {}",
                    request_id, reply.response_to
                )));
            }

            Ok(RawCommandResponse::new(
                self.address.clone(),
                reply.single_document_response()?,
            ))
        } else {
            let mut command = command;
            command.fold_sequences_into_body();

            let target_db = std::mem::take(&mut command.target_db);
            let mut body = std::mem::take(&mut command.body);

            // The legacy transport wraps commands carrying a read preference in
            // $query/$readPreference.
            let (query, secondary_ok) = match body.remove("$readPreference") {
                Some(read_pref) => {
                    let secondary_ok = read_pref
                        .as_document()
                        .and_then(|d| d.get_str("mode").ok())
                        .map(|mode| mode != "primary")
                        .unwrap_or(false);
                    (
                        doc! { "$query": body, "$readPreference": read_pref },
                        secondary_ok,
                    )
                }
                None => (body, false),
            };

            let mut flags = legacy::QueryFlags::empty();
            if secondary_ok {
                flags |= legacy::QueryFlags::SECONDARY_OK;
            }

            let op_query = legacy::Query {
                flags,
                full_collection_name: format!("{}.$cmd", target_db),
                number_to_skip: 0,
                number_to_return: -1,
                query,
                return_field_selector: None,
                request_id,
            };

            let request_id = op_query.write_to(&mut self.stream).await?;
            let reply = self.read_op_reply().await?;
            if reply.response_to != request_id {
                return Err(Error::invalid_response(format!(
                    "expected a response to request {} but got a response to request {}",
                    request_id, reply.response_to
                )));
            }

            Ok(RawCommandResponse::new(
                self.address.clone(),
                reply.into_command_response()?,
            ))
        }
    }

    /// Sends a raw OP_QUERY and reads its OP_REPLY.
    pub(crate) async fn send_query(&mut self, query: legacy::Query) -> Result<legacy::Reply> {
        self.begin_request()?;
        let result = self.send_query_inner(query).await;
        self.in_flight = false;

        if let Err(ref e) = result {
            if e.is_network_error() {
                self.error = true;
            }
        }

        result
    }

    async fn send_query_inner(&mut self, query: legacy::Query) -> Result<legacy::Reply> {
        let request_id = query.write_to(&mut self.stream).await?;
        let reply = self.read_op_reply().await?;
        if reply.response_to != request_id {
            return Err(Error::invalid_response(format!(
                "expected a response to request {} but got a response to request {}",
                request_id, reply.response_to
            )));
        }
        Ok(reply)
    }

    /// Sends a raw OP_GET_MORE and reads its OP_REPLY.
    pub(crate) async fn send_get_more(&mut self, get_more: legacy::GetMore) -> Result<legacy::Reply> {
        self.begin_request()?;
        let result = self.send_get_more_inner(get_more).await;
        self.in_flight = false;

        if let Err(ref e) = result {
            if e.is_network_error() {
                self.error = true;
            }
        }

        result
    }

    async fn send_get_more_inner(&mut self, get_more: legacy::GetMore) -> Result<legacy::Reply> {
        let request_id = get_more.write_to(&mut self.stream).await?;
        let reply = self.read_op_reply().await?;
        if reply.response_to != request_id {
            return Err(Error::invalid_response(format!(
                "expected a response to request {} but got a response to request {}",
                request_id, reply.response_to
            )));
        }
        Ok(reply)
    }

    /// Sends a legacy fire-and-forget message (OP_INSERT, OP_UPDATE, OP_DELETE or
    /// OP_KILL_CURSORS); the server sends no reply to these.
    pub(crate) async fn send_fire_and_forget(&mut self, message: LegacyWireMessage) -> Result<()> {
        self.begin_request()?;
        let result = self.send_fire_and_forget_inner(message).await;
        self.in_flight = false;

        if let Err(ref e) = result {
            if e.is_network_error() {
                self.error = true;
            }
        }

        result
    }

    async fn send_fire_and_forget_inner(&mut self, message: LegacyWireMessage) -> Result<()> {
        match message {
            LegacyWireMessage::Insert(m) => m.write_to(&mut self.stream).await?,
            LegacyWireMessage::Update(m) => m.write_to(&mut self.stream).await?,
            LegacyWireMessage::Delete(m) => m.write_to(&mut self.stream).await?,
            LegacyWireMessage::KillCursors(m) => m.write_to(&mut self.stream).await?,
        };
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_op_msg(&mut self) -> Result<Message> {
        match self.socket_timeout {
            Some(timeout) => runtime::timeout(timeout, Message::read_from(&mut self.stream)).await?,
            None => Message::read_from(&mut self.stream).await,
        }
    }

    async fn read_op_reply(&mut self) -> Result<legacy::Reply> {
        match self.socket_timeout {
            Some(timeout) => {
                runtime::timeout(timeout, legacy::Reply::read_from(&mut self.stream)).await?
            }
            None => legacy::Reply::read_from(&mut self.stream).await,
        }
    }

    /// Fails with a `CommandSize` error if the serialized command will not fit in a single wire
    /// message on this connection.
    fn check_command_size(&self, command: &Command) -> Result<()> {
        let max_size = self
            .stream_description
            .as_ref()
            .map(|d| d.max_message_size_bytes as usize)
            .unwrap_or(48_000_000);

        let mut size = bson_util::document_byte_size(&command.body)?;
        for sequence in &command.document_sequences {
            for document in &sequence.documents {
                size += bson_util::document_byte_size(document)?;
            }
        }

        if size > max_size {
            return Err(ErrorKind::CommandSize { size, max_size }.into());
        }

        Ok(())
    }
}

/// The legacy messages a connection can send without expecting a reply.
#[derive(Debug)]
pub(crate) enum LegacyWireMessage {
    Insert(legacy::Insert),
    Update(legacy::Update),
    Delete(legacy::Delete),
    KillCursors(legacy::KillCursors),
}

