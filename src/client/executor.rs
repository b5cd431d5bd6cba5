use std::time::Instant;

use bson::Timestamp;

use super::Client;
use crate::{
    client::session::ClusterTime,
    cmap::{
        conn::wire::util::next_request_id,
        PooledConnection,
        RawCommandResponse,
        StreamDescription,
    },
    error::{Error, ErrorKind, Result, RETRYABLE_WRITE_ERROR},
    event::command::{CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent},
    operation::{LegacyRequest, Operation, Retryability},
    sdam::{SelectedServer, TopologyType},
    selection_criteria::{ReadPreference, SelectionCriteria},
    ClientSession,
};

impl Client {
    /// Executes an operation without any session attached: no implicit session is acquired.
    pub(crate) async fn execute_operation_without_session<T: Operation>(
        &self,
        op: T,
    ) -> Result<T::O> {
        self.execute_operation_inner(op, None, false).await
    }

    /// Executes an operation, acquiring an implicit session when the deployment supports
    /// sessions and the operation can use one.
    pub(crate) async fn execute_operation<T: Operation>(&self, op: T) -> Result<T::O> {
        self.execute_operation_inner(op, None, true).await
    }

    /// Executes an operation with an optional explicit session.
    pub(crate) async fn execute_operation_with_optional_session<T: Operation>(
        &self,
        op: T,
        session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        match session {
            Some(session) => self.execute_operation_with_session(op, session).await,
            None => self.execute_operation(op).await,
        }
    }

    /// Executes an operation with the provided explicit session, validating that the session
    /// may be used for it.
    pub(crate) async fn execute_operation_with_session<T: Operation>(
        &self,
        op: T,
        session: &mut ClientSession,
    ) -> Result<T::O> {
        if !session.is_from_client(self) {
            return Err(ErrorKind::InvalidArgument {
                message: "the session provided to an operation must be created from the same \
                          client as the operation's collection"
                    .to_string(),
            }
            .into());
        }

        if session.is_ended() {
            return Err(ErrorKind::InvalidArgument {
                message: "the session provided to an operation has been ended".to_string(),
            }
            .into());
        }

        if !op.is_acknowledged() {
            return Err(ErrorKind::InvalidArgument {
                message: "an explicit session cannot be used with an unacknowledged write \
                          concern"
                    .to_string(),
            }
            .into());
        }

        self.execute_operation_inner(op, Some(session), false).await
    }

    async fn execute_operation_inner<T: Operation>(
        &self,
        mut op: T,
        session: Option<&mut ClientSession>,
        may_use_implicit_session: bool,
    ) -> Result<T::O> {
        // Implicit sessions attach only to acknowledged operations on deployments known to
        // support them; the reply that would confirm a `w: 0` session's liveness never
        // arrives.
        let mut implicit_session = match session {
            Some(_) => None,
            None
                if may_use_implicit_session
                    && op.supports_sessions()
                    && op.is_acknowledged()
                    && self.topology().supports_sessions() =>
            {
                Some(self.start_implicit_session().await?)
            }
            None => None,
        };

        let mut session = match session {
            Some(session) => Some(session),
            None => implicit_session.as_mut(),
        };

        let server = self.select_server_for(&op).await?;

        let mut conn = match server.pool().check_out().await {
            Ok(conn) => conn,
            Err(e) => {
                self.topology()
                    .handle_application_error(server.address.clone(), &e)
                    .await;
                return Err(e);
            }
        };

        let retryability = self.get_retryability(&conn, &op, &session)?;

        let txn_number = match (retryability, session.as_deref_mut()) {
            (Retryability::Write, Some(session)) => Some(session.get_and_increment_txn_number()),
            _ => None,
        };

        let first_error = match self
            .execute_operation_on_connection(&mut op, &mut conn, &mut session, txn_number)
            .await
        {
            Ok(result) => return Ok(result),
            Err(mut err) => {
                // Classify for retryable writes before the SDAM reaction tears state down.
                let max_wire_version = conn
                    .stream_description()
                    .ok()
                    .and_then(|d| d.max_wire_version)
                    .unwrap_or(0);
                if retryability == Retryability::Write
                    && err.should_add_retryable_write_label(max_wire_version)
                {
                    err.add_label(RETRYABLE_WRITE_ERROR);
                }

                self.topology()
                    .handle_application_error(conn.address().clone(), &err)
                    .await;
                drop(conn);
                drop(server);

                if err.is_network_error() {
                    if let Some(ref mut session) = session {
                        session.mark_dirty();
                    }
                }

                let retryable = match retryability {
                    Retryability::Write => err.is_write_retryable(),
                    Retryability::Read => err.is_read_retryable(),
                    Retryability::None => false,
                };

                if !retryable {
                    return op.handle_error(err);
                }

                err
            }
        };

        // Exactly one retry: reselect a server and run the operation again with the same
        // transaction number.
        op.update_for_retry();

        let server = match self.select_server_for(&op).await {
            Ok(server) => server,
            Err(_) => return op.handle_error(first_error),
        };

        let mut conn = match server.pool().check_out().await {
            Ok(conn) => conn,
            Err(_) => return op.handle_error(first_error),
        };

        if retryability == Retryability::Write
            && !conn.stream_description()?.supports_retryable_writes()
        {
            return op.handle_error(first_error);
        }

        match self
            .execute_operation_on_connection(&mut op, &mut conn, &mut session, txn_number)
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                self.topology()
                    .handle_application_error(conn.address().clone(), &err)
                    .await;

                if err.is_network_error() {
                    if let Some(ref mut session) = session {
                        session.mark_dirty();
                    }
                }

                op.handle_error(err)
            }
        }
    }

    /// Runs the per-connection portion of the dispatch pipeline: command assembly, the
    /// session/cluster-time/read-preference/concern injections, the send/receive exchange
    /// with monitoring events, and the post-reply session updates.
    async fn execute_operation_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut PooledConnection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<T::O> {
        let stream_description = connection.stream_description()?.clone();

        if let Some(request) = op.build_legacy(&stream_description)? {
            return self
                .execute_legacy_request(op, request, connection, &stream_description)
                .await;
        }

        let mut cmd = op.build(&stream_description)?;

        self.topology().description().update_command_with_read_pref(
            connection.address(),
            &mut cmd,
            op.selection_criteria(),
        );

        if let Some(session) = session.as_deref_mut() {
            cmd.set_session_id(session.id().clone());
            if let Some(txn_number) = txn_number {
                cmd.set_txn_number(txn_number);
            }
            session.update_last_use();
        }

        if op.supports_read_concern(&stream_description) {
            let after_cluster_time = session
                .as_ref()
                .filter(|session| session.is_causally_consistent())
                .and_then(|session| session.operation_time());

            cmd.set_read_concern(self.read_concern(), after_cluster_time)?;
        }

        if let Some(cluster_time) = self.effective_cluster_time(session) {
            cmd.set_cluster_time(&cluster_time);
        }

        let request_id = next_request_id();
        let connection_info = connection.info();
        let should_redact = cmd.should_redact();

        self.emit_command_event(|handler| {
            let command_body = if should_redact {
                bson::Document::new()
            } else {
                let mut body = cmd.body.clone();
                // Document sequences are part of the command on the wire.
                for sequence in &cmd.document_sequences {
                    body.insert(
                        sequence.identifier.clone(),
                        crate::bson_util::to_bson_array(&sequence.documents),
                    );
                }
                body
            };
            handler.handle_command_started_event(CommandStartedEvent {
                command: command_body,
                db: cmd.target_db.clone(),
                command_name: cmd.name.clone(),
                request_id,
                connection: connection_info.clone(),
            });
        });

        let start = Instant::now();
        let response_result = connection.send_command(cmd.clone(), request_id).await;
        let duration = start.elapsed();

        let response = match response_result {
            Ok(response) => response,
            Err(err) => {
                self.emit_command_event(|handler| {
                    let mut failure = err.clone();
                    if should_redact {
                        failure.redact();
                    }
                    handler.handle_command_failed_event(CommandFailedEvent {
                        duration,
                        command_name: cmd.name.clone(),
                        failure,
                        request_id,
                        connection: connection_info.clone(),
                    });
                });
                return Err(err);
            }
        };

        self.update_state_from_response(session, &response).await;

        // An `ok: 1` reply is a successful command exchange even when it reports
        // per-document write errors, so it publishes a succeeded event either way.
        let command_succeeded = response
            .raw()
            .get("ok")
            .and_then(crate::bson_util::get_int)
            == Some(1);

        let result = op.handle_response(response.clone(), &stream_description);

        if command_succeeded {
            self.emit_command_event(|handler| {
                let reply = if should_redact {
                    bson::Document::new()
                } else {
                    response.raw().clone()
                };
                handler.handle_command_succeeded_event(CommandSucceededEvent {
                    duration,
                    reply,
                    command_name: cmd.name.clone(),
                    request_id,
                    connection: connection_info.clone(),
                });
            });
        } else if let Err(ref err) = result {
            self.emit_command_event(|handler| {
                let mut failure = err.clone();
                if should_redact {
                    failure.redact();
                }
                handler.handle_command_failed_event(CommandFailedEvent {
                    duration,
                    command_name: cmd.name.clone(),
                    failure,
                    request_id,
                    connection: connection_info.clone(),
                });
            });
        }

        result
    }

    async fn execute_legacy_request<T: Operation>(
        &self,
        op: &mut T,
        request: LegacyRequest,
        connection: &mut PooledConnection,
        stream_description: &StreamDescription,
    ) -> Result<T::O> {
        let reply = match request {
            LegacyRequest::Query(query) => Some(connection.send_query(query).await?),
            LegacyRequest::GetMore(get_more) => Some(connection.send_get_more(get_more).await?),
            LegacyRequest::KillCursors(kill_cursors) => {
                connection
                    .send_fire_and_forget(crate::cmap::LegacyWireMessage::KillCursors(
                        kill_cursors,
                    ))
                    .await?;
                None
            }
            LegacyRequest::Insert(insert) => {
                connection
                    .send_fire_and_forget(crate::cmap::LegacyWireMessage::Insert(insert))
                    .await?;
                None
            }
        };

        let reply = reply.unwrap_or_else(empty_legacy_reply);
        op.handle_legacy_response(reply, stream_description)
    }

    /// Picks the server the operation runs on: the pinned server for cursor traffic, and a
    /// freshly selected one for everything else.
    async fn select_server_for<T: Operation>(&self, op: &T) -> Result<SelectedServer> {
        if let Some(address) = op.pinned_address() {
            return self.topology().pinned_server(address);
        }

        // Read operations carry their effective read preference; everything else goes to a
        // primary (or mongos).
        let default_criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let criteria = op.selection_criteria().unwrap_or(&default_criteria);

        self.topology()
            .select_server(criteria, self.server_selection_timeout())
            .await
    }

    /// Resolves how retryable this execution may be, per the preconditions of retryable
    /// writes: an attached session, a connection that supports them, a deployment that is not
    /// a single server, and the client option left enabled.
    fn get_retryability<T: Operation>(
        &self,
        conn: &PooledConnection,
        op: &T,
        session: &Option<&mut ClientSession>,
    ) -> Result<Retryability> {
        match op.retryability() {
            Retryability::Write => {
                if session.is_none() {
                    return Ok(Retryability::None);
                }
                if !conn.stream_description()?.supports_retryable_writes() {
                    return Ok(Retryability::None);
                }
                if self.topology().topology_type() == TopologyType::Single {
                    return Ok(Retryability::None);
                }
                if self.options().retry_writes == Some(false) {
                    return Ok(Retryability::None);
                }
                Ok(Retryability::Write)
            }
            Retryability::Read => {
                if self.options().retry_reads == Some(false) {
                    return Ok(Retryability::None);
                }
                Ok(Retryability::Read)
            }
            Retryability::None => Ok(Retryability::None),
        }
    }

    /// Absorbs the gossip riding on a reply: the `$clusterTime` merge into the client and
    /// session clocks, the session `operationTime` (updated even for error replies), and any
    /// recovery token.
    async fn update_state_from_response(
        &self,
        session: &mut Option<&mut ClientSession>,
        response: &RawCommandResponse,
    ) {
        let cluster_time: Option<ClusterTime> = response
            .raw()
            .get_document("$clusterTime")
            .ok()
            .and_then(|doc| bson::from_document(doc.clone()).ok());

        if let Some(ref cluster_time) = cluster_time {
            self.topology().advance_cluster_time(cluster_time).await;
        }

        if let Some(session) = session.as_deref_mut() {
            if let Some(ref cluster_time) = cluster_time {
                session.advance_cluster_time(cluster_time);
            }

            let operation_time: Option<Timestamp> = response
                .raw()
                .get("operationTime")
                .and_then(|bson| bson.as_timestamp());
            if let Some(operation_time) = operation_time {
                session.advance_operation_time(operation_time);
            }

            if let Ok(recovery_token) = response.raw().get_document("recoveryToken") {
                session.recovery_token = Some(recovery_token.clone());
            }
        }
    }

    /// The most recent cluster time known to either the client or the session.
    fn effective_cluster_time(
        &self,
        session: &Option<&mut ClientSession>,
    ) -> Option<ClusterTime> {
        let client_time = self.topology().cluster_time();
        let session_time = session.as_ref().and_then(|s| s.cluster_time().cloned());

        match (client_time, session_time) {
            (Some(client_time), Some(session_time)) => {
                Some(std::cmp::max(client_time, session_time))
            }
            (cluster_time, None) => cluster_time,
            (None, cluster_time) => cluster_time,
        }
    }

    fn emit_command_event(
        &self,
        emit: impl FnOnce(&dyn crate::event::command::CommandEventHandler),
    ) {
        if let Some(ref handler) = self.options().command_event_handler {
            emit(handler.as_ref());
        }
    }
}

fn empty_legacy_reply() -> crate::cmap::conn::wire::legacy::Reply {
    crate::cmap::conn::wire::legacy::Reply {
        response_to: 0,
        flags: crate::cmap::conn::wire::legacy::ReplyFlags::empty(),
        cursor_id: 0,
        starting_from: 0,
        number_returned: 0,
        documents: Vec::new(),
    }
}
