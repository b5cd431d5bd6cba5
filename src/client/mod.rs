pub(crate) mod auth;
mod executor;
pub mod options;
pub mod session;

use std::{sync::Arc, time::Duration};

use bson::Document;
use derivative::Derivative;

use crate::{
    concern::{ReadConcern, WriteConcern},
    cursor::Cursor,
    error::{convert_bulk_errors, ErrorKind, Result},
    operation::{
        Aggregate,
        CreateIndexes,
        Delete,
        DropCollection,
        DropDatabase,
        DropIndexes,
        EndSessions,
        Find,
        FindAndModify,
        Insert,
        Modification,
        RunCommand,
        Update,
        UpdateModifications,
    },
    options::{
        AggregateOptions,
        ClientOptions,
        FindOptions,
        IndexModel,
        ReturnDocument,
        ServerAddress,
    },
    results::{
        CreateIndexesResult,
        DeleteResult,
        FindAndModifyResult,
        InsertManyResult,
        InsertOneResult,
        UpdateResult,
    },
    sdam::{SrvPollingMonitor, Topology, DEFAULT_SERVER_SELECTION_TIMEOUT},
    selection_criteria::SelectionCriteria,
    Namespace,
};

use session::{ClientSession, ServerSession, ServerSessionPool, SessionOptions};

const MAX_END_SESSIONS_BATCH_SIZE: usize = crate::operation::MAX_END_SESSIONS_BATCH_SIZE;

/// The client side of a connection to a MongoDB deployment. The `Client` discovers and
/// continuously monitors the deployment's members, routes each operation to a suitable
/// server, and owns the pools of connections and logical sessions used to do so.
///
/// `Client` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html)
/// internally, so it can be shared safely across threads or async tasks by cloning it.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct ClientInner {
    topology: Topology,
    options: ClientOptions,
    #[derivative(Debug = "ignore")]
    session_pool: ServerSessionPool,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `uri`. `uri` must be a
    /// valid MongoDB connection string; `mongodb+srv` URIs trigger the DNS seedlist lookups
    /// as part of this call.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri.as_ref()).await?;
        Client::with_options(options)
    }

    /// Creates a new `Client` connected to the cluster specified by `options`. Server
    /// monitoring starts immediately in the background.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let topology = Topology::new(options.clone())?;

        let client = Self {
            inner: Arc::new(ClientInner {
                topology,
                options,
                session_pool: ServerSessionPool::new(),
            }),
        };

        SrvPollingMonitor::start(client.topology().clone(), client.options().clone());

        Ok(client)
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Whether two handles refer to the same underlying client.
    pub(crate) fn same_client(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Gets the default read concern the `Client` uses for operations.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.options.read_concern.as_ref()
    }

    /// Gets the default write concern the `Client` uses for operations.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.options.write_concern.as_ref()
    }

    /// Gets the default selection criteria the `Client` uses for operations.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.options.selection_criteria.as_ref()
    }

    pub(crate) fn server_selection_timeout(&self) -> Duration {
        self.inner
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT)
    }

    /// The addresses the client is currently monitoring.
    pub fn monitored_addresses(&self) -> Vec<ServerAddress> {
        self.inner.topology.monitored_addresses()
    }

    /// Starts a new [`ClientSession`].
    pub async fn start_session(&self, options: Option<SessionOptions>) -> Result<ClientSession> {
        let timeout = self.inner.topology.logical_session_timeout();
        let server_session = self.inner.session_pool.check_out(timeout).await;
        Ok(ClientSession::new(
            server_session,
            self.clone(),
            options,
            false,
        ))
    }

    pub(crate) async fn start_implicit_session(&self) -> Result<ClientSession> {
        let timeout = self.inner.topology.logical_session_timeout();
        let server_session = self.inner.session_pool.check_out(timeout).await;
        Ok(ClientSession::new(server_session, self.clone(), None, true))
    }

    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        if !self.inner.topology.is_alive() {
            return;
        }
        let timeout = self.inner.topology.logical_session_timeout();
        self.inner.session_pool.check_in(session, timeout).await;
    }

    /// Runs a database command directly on the given database, returning the reply document.
    ///
    /// Intended for administrative and diagnostic commands; CRUD access should go through the
    /// typed surfaces built on this crate.
    pub async fn run_command(
        &self,
        target_db: impl AsRef<str>,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let operation = RunCommand::new(
            target_db.as_ref().to_string(),
            command,
            selection_criteria.into(),
        )?;
        self.execute_operation(operation).await
    }

    /// Runs a query, returning a [`Cursor`] over the matching documents. The cursor holds the
    /// session that created it so that its `getMore`s are attributed to the same logical
    /// session, and it always targets the server that answered the initial query.
    pub async fn find(
        &self,
        ns: Namespace,
        filter: Document,
        options: Option<FindOptions>,
    ) -> Result<Cursor> {
        let criteria = self.selection_criteria().cloned();
        let operation = Find::new(ns, filter, options, criteria);

        let mut implicit_session = if self.topology().supports_sessions() {
            Some(self.start_implicit_session().await?)
        } else {
            None
        };

        let spec = self
            .execute_operation_with_optional_session(operation, implicit_session.as_mut())
            .await?;

        Ok(Cursor::new(self.clone(), spec, implicit_session))
    }

    /// Creates the given indexes on a collection. Servers that do not recognize the
    /// `createIndexes` command fall back to inserting the index documents into
    /// `system.indexes` directly.
    pub async fn create_indexes(
        &self,
        ns: Namespace,
        indexes: Vec<IndexModel>,
        write_concern: Option<WriteConcern>,
    ) -> Result<CreateIndexesResult> {
        let operation = CreateIndexes::new(ns.clone(), indexes.clone(), write_concern.clone());

        match self.execute_operation(operation).await {
            Err(e) if e.is_command_not_found() => {
                let fallback = CreateIndexes::new(ns, indexes, write_concern).into_legacy();
                self.execute_operation(fallback).await
            }
            other => other,
        }
    }

    /// Inserts a single document into the given namespace.
    pub async fn insert_one(
        &self,
        ns: Namespace,
        document: Document,
        write_concern: Option<WriteConcern>,
    ) -> Result<InsertOneResult> {
        let operation = Insert::new_single(ns, document, write_concern);
        self.execute_operation(operation)
            .await
            .map(InsertOneResult::from_insert_many_result)
            .map_err(convert_bulk_errors)
    }

    /// Inserts the given documents into a namespace as a single write command. Inputs larger
    /// than the server's batch limits belong in [`Client::bulk_write`], which splits them.
    pub async fn insert_many(
        &self,
        ns: Namespace,
        documents: Vec<Document>,
        ordered: Option<bool>,
        write_concern: Option<WriteConcern>,
    ) -> Result<InsertManyResult> {
        let operation = Insert::new(ns, documents, ordered, None, write_concern);
        self.execute_operation(operation).await
    }

    /// Updates the first document matching `filter`.
    pub async fn update_one(
        &self,
        ns: Namespace,
        filter: Document,
        update: UpdateModifications,
        upsert: Option<bool>,
        collation: Option<Document>,
        write_concern: Option<WriteConcern>,
    ) -> Result<UpdateResult> {
        let operation = Update::new(
            ns,
            filter,
            update,
            false,
            upsert,
            collation,
            None,
            write_concern,
        );
        self.execute_operation(operation)
            .await
            .map_err(convert_bulk_errors)
    }

    /// Updates all documents matching `filter`.
    pub async fn update_many(
        &self,
        ns: Namespace,
        filter: Document,
        update: UpdateModifications,
        upsert: Option<bool>,
        collation: Option<Document>,
        write_concern: Option<WriteConcern>,
    ) -> Result<UpdateResult> {
        let operation = Update::new(
            ns,
            filter,
            update,
            true,
            upsert,
            collation,
            None,
            write_concern,
        );
        self.execute_operation(operation)
            .await
            .map_err(convert_bulk_errors)
    }

    /// Deletes the first document matching `filter`.
    pub async fn delete_one(
        &self,
        ns: Namespace,
        filter: Document,
        collation: Option<Document>,
        write_concern: Option<WriteConcern>,
    ) -> Result<DeleteResult> {
        let operation = Delete::new(ns, filter, Some(1), collation, write_concern);
        self.execute_operation(operation)
            .await
            .map_err(convert_bulk_errors)
    }

    /// Deletes all documents matching `filter`.
    pub async fn delete_many(
        &self,
        ns: Namespace,
        filter: Document,
        collation: Option<Document>,
        write_concern: Option<WriteConcern>,
    ) -> Result<DeleteResult> {
        let operation = Delete::new(ns, filter, None, collation, write_concern);
        self.execute_operation(operation)
            .await
            .map_err(convert_bulk_errors)
    }

    /// Atomically updates the first document matching `filter` and returns it.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_one_and_update(
        &self,
        ns: Namespace,
        filter: Document,
        update: UpdateModifications,
        upsert: Option<bool>,
        return_document: Option<ReturnDocument>,
        sort: Option<Document>,
        write_concern: Option<WriteConcern>,
    ) -> Result<FindAndModifyResult> {
        let operation = FindAndModify::new(
            ns,
            filter,
            Modification::Update {
                update,
                upsert,
                return_document,
            },
            sort,
            None,
            None,
            write_concern,
        );
        self.execute_operation(operation).await
    }

    /// Atomically deletes the first document matching `filter` and returns it.
    pub async fn find_one_and_delete(
        &self,
        ns: Namespace,
        filter: Document,
        sort: Option<Document>,
        write_concern: Option<WriteConcern>,
    ) -> Result<FindAndModifyResult> {
        let operation = FindAndModify::new(
            ns,
            filter,
            Modification::Delete,
            sort,
            None,
            None,
            write_concern,
        );
        self.execute_operation(operation).await
    }

    /// Runs an aggregation pipeline, returning a cursor over its results. Replies from
    /// servers that predate cursor-based aggregation are converted into a single-batch
    /// cursor.
    pub async fn aggregate(
        &self,
        ns: Namespace,
        pipeline: impl IntoIterator<Item = Document>,
        options: Option<AggregateOptions>,
    ) -> Result<Cursor> {
        let criteria = self.selection_criteria().cloned();
        let operation = Aggregate::new(ns, pipeline, options, criteria);

        let mut implicit_session = if self.topology().supports_sessions() {
            Some(self.start_implicit_session().await?)
        } else {
            None
        };

        let spec = self
            .execute_operation_with_optional_session(operation, implicit_session.as_mut())
            .await?;

        Ok(Cursor::new(self.clone(), spec, implicit_session))
    }

    /// Drops a collection. Dropping a collection that does not exist is a no-op.
    pub async fn drop_collection(
        &self,
        ns: Namespace,
        write_concern: Option<WriteConcern>,
    ) -> Result<()> {
        let operation = DropCollection::new(ns, write_concern);
        self.execute_operation(operation).await
    }

    /// Drops the named index on a collection, or all of its indexes when `name` is `"*"`.
    /// Dropping an index that does not exist is a no-op.
    pub async fn drop_indexes(
        &self,
        ns: Namespace,
        name: impl Into<String>,
        write_concern: Option<WriteConcern>,
    ) -> Result<()> {
        let operation = DropIndexes::new(ns, name, write_concern);
        match self.execute_operation(operation).await {
            Err(e) if e.is_index_not_found() || e.is_ns_not_found() => Ok(()),
            other => other,
        }
    }

    /// Drops an entire database.
    pub async fn drop_database(
        &self,
        name: impl AsRef<str>,
        write_concern: Option<WriteConcern>,
    ) -> Result<()> {
        let operation = DropDatabase::new(name.as_ref(), write_concern);
        self.execute_operation(operation).await
    }

    /// Shuts the client down: pooled server sessions are retired with `endSessions` sweeps
    /// and all monitoring stops. Any errors during the sweep are ignored, since the server
    /// will eventually retire the sessions itself.
    pub async fn shutdown(self) {
        let sessions = self.inner.session_pool.drain().await;
        let mut ids: Vec<Document> = sessions.into_iter().map(|session| session.id).collect();

        while !ids.is_empty() {
            let batch: Vec<Document> = ids
                .drain(..ids.len().min(MAX_END_SESSIONS_BATCH_SIZE))
                .collect();
            let _ = self
                .execute_operation_without_session(EndSessions::new(batch))
                .await;
        }

        self.inner.topology.shutdown();
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.topology.shutdown();
    }
}

impl Client {
    /// Verifies that an explicit session may be used by this client.
    #[allow(dead_code)]
    pub(crate) fn validate_session(&self, session: &ClientSession) -> Result<()> {
        if !session.is_from_client(self) {
            return Err(ErrorKind::InvalidArgument {
                message: "the session provided does not belong to this client".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
