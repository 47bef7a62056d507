//! Asynchronous PostgreSQL connection.

use std::collections::VecDeque;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::buffer_set::BufferSet;
use crate::command::{IsolationLevel, TxSettings};
use crate::encoding::Encoding;
use crate::error::{Error, Result};
use crate::handler::AsyncMessageHandler;
use crate::json::JsonRegistry;
use crate::opts::Opts;
use crate::pipeline::PipelineState;
use crate::protocol::frontend::write_terminate;
use crate::protocol::types::TransactionStatus;
use crate::result::QueryResult;
use crate::state::{
    ConnectionStateMachine, ExtendedQueryStateMachine, RawNotification, SimpleQueryStateMachine,
};
use crate::types::Param;
use crate::xid::Xid;

use super::cancel::CancelHandle;
use super::stream::{Endpoint, Stream};
use super::wait::{InterruptHandle, settle_interrupt};

/// Connection state guarded by the execution lock.
pub(crate) struct Inner {
    pub(crate) stream: Stream,
    pub(crate) buffer_set: BufferSet,
    server_params: Vec<(String, String)>,
    pub(crate) encoding: Encoding,
    pub(crate) transaction_status: TransactionStatus,
    broken: bool,
    closed: bool,
    pub(crate) autocommit: bool,
    pub(crate) tx_settings: TxSettings,
    /// Number of open transaction scopes
    pub(crate) num_transactions: usize,
    /// Bound two-phase transaction and whether it is prepared
    pub(crate) tpc: Option<(Xid, bool)>,
    pub(crate) pipeline: Option<PipelineState>,
    pub(crate) next_pipeline_id: u64,
    pub(crate) pending_notifies: VecDeque<RawNotification>,
    pub(crate) async_message_handler: Option<Box<dyn AsyncMessageHandler>>,
    pub(crate) interrupt: InterruptHandle,
    pub(crate) cancel: Option<CancelHandle>,
}

impl Inner {
    pub(crate) fn set_server_param(&mut self, name: String, value: String) {
        if name == "client_encoding" {
            self.encoding = Encoding::from_name(&value);
        }
        match self.server_params.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.server_params.push((name, value)),
        }
    }

    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
        self.transaction_status = TransactionStatus::Unknown;
    }

    /// A FATAL or PANIC server error ends the session.
    fn check_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            warn!(error = %e, "connection broken");
            self.mark_broken();
        }
        result
    }

    pub(crate) fn check_usable(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        if self.transaction_status == TransactionStatus::Active {
            // A command future was dropped halfway
            warn!("connection abandoned in the middle of a command");
            self.mark_broken();
        }
        if self.broken {
            return Err(Error::ConnectionBroken);
        }
        Ok(())
    }

    /// Run a simple query, one result per statement.
    pub(crate) async fn simple_query(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        debug!(sql, "simple query");
        let mut state_machine = SimpleQueryStateMachine::new(sql, self.encoding);
        let interrupted = self.drive(&mut state_machine).await?;
        let results = settle_interrupt(interrupted, state_machine.into_results());
        self.check_fatal(results)
    }

    /// Run one parameterized command with the extended protocol.
    pub(crate) async fn extended_query(&mut self, sql: &str, params: &[Param]) -> Result<QueryResult> {
        debug!(sql, params = params.len(), "extended query");
        let mut state_machine = ExtendedQueryStateMachine::execute(sql, params, self.encoding);
        let interrupted = self.drive(&mut state_machine).await?;
        let outcome = state_machine
            .into_outcomes()
            .pop()
            .ok_or_else(|| Error::Protocol("no result for extended query".into()))?;
        self.check_fatal(settle_interrupt(interrupted, outcome))
    }

    /// Run a driver-issued command, discarding its result.
    ///
    /// In pipeline mode the command is only queued.
    pub(crate) async fn run_command(&mut self, sql: &str) -> Result<()> {
        if let Some(pipeline) = &mut self.pipeline {
            debug!(sql, pipeline = pipeline.id, "queue command");
            pipeline.queue(sql, &[], false);
            return Ok(());
        }
        self.simple_query(sql).await.map(drop)
    }

    /// Outside autocommit, start the transaction the session expects before
    /// the first command.
    pub(crate) async fn start_implicit_transaction(&mut self) -> Result<()> {
        if !self.autocommit
            && self.transaction_status == TransactionStatus::Idle
            && self.num_transactions == 0
        {
            let begin = self.tx_settings.begin_command();
            self.run_command(&begin).await?;
            // Refresh the status so the next command does not begin again
            if self.pipeline.is_some() {
                self.pipeline_sync().await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn execute(&mut self, sql: &str, params: &[Param]) -> Result<QueryResult> {
        self.start_implicit_transaction().await?;

        if let Some(pipeline) = &mut self.pipeline {
            debug!(sql, pipeline = pipeline.id, "queue command");
            let ticket = pipeline.queue(sql, params, true);
            self.pipeline_sync().await?;
            return match (&mut self.pipeline, ticket) {
                (Some(pipeline), Some(ticket)) => pipeline.claim(ticket),
                _ => Err(Error::Protocol("pipeline lost its queued command".into())),
            };
        }

        if params.is_empty() {
            let mut results = self.simple_query(sql).await?;
            Ok(results.pop().unwrap_or_default())
        } else {
            self.extended_query(sql, params).await
        }
    }

    /// Send a Sync for everything queued in the pipeline and collect the
    /// results. Returns the first failure of the batch.
    pub(crate) async fn pipeline_sync(&mut self) -> Result<()> {
        let Some(pipeline) = &mut self.pipeline else {
            return Ok(());
        };
        let id = pipeline.id;
        let (request, tickets) = pipeline.take_batch();
        debug!(pipeline = id, commands = tickets.len(), "pipeline sync");

        let mut state_machine = ExtendedQueryStateMachine::batch(request, tickets.len(), self.encoding);
        let interrupted = self.drive(&mut state_machine).await?;
        let outcomes = state_machine
            .into_outcomes()
            .into_iter()
            .map(|outcome| settle_interrupt(interrupted, outcome))
            .collect();

        let completed = match &mut self.pipeline {
            Some(pipeline) => pipeline.complete_batch(tickets, outcomes),
            None => Err(Error::Protocol("pipeline detached during sync".into())),
        };
        self.check_fatal(completed)
    }

    /// Fail unless session characteristics may change now.
    pub(crate) async fn check_intrans(&mut self, attribute: &str) -> Result<()> {
        if self.transaction_status == TransactionStatus::Idle && self.pipeline.is_some() {
            self.pipeline_sync().await?;
        }
        let status = self.transaction_status;
        if status == TransactionStatus::Idle {
            return Ok(());
        }
        if self.num_transactions > 0 {
            Err(Error::InvalidUsage(format!(
                "can't change '{}' now: connection.transaction() context in progress",
                attribute
            )))
        } else {
            Err(Error::InvalidUsage(format!(
                "can't change '{}' now: connection in transaction status {}",
                attribute,
                status.name()
            )))
        }
    }

    fn check_explicit_end(&self, command: &str) -> Result<()> {
        if self.tpc.is_some() {
            return Err(Error::InvalidUsage(format!(
                "{}() cannot be used during a two-phase transaction",
                command
            )));
        }
        if self.num_transactions > 0 {
            return Err(Error::InvalidUsage(format!(
                "Explicit {}() forbidden within a transaction scope; \
                 the scope ends the transaction when it exits",
                command
            )));
        }
        Ok(())
    }

    /// End the current transaction with `COMMIT` or `ROLLBACK`.
    pub(crate) async fn end_transaction(&mut self, command: &str) -> Result<()> {
        if self.pipeline.is_some() {
            self.pipeline_sync().await?;
        }
        if self.transaction_status == TransactionStatus::Idle {
            return Ok(());
        }
        self.run_command(command).await?;
        if self.pipeline.is_some() {
            self.pipeline_sync().await?;
        }
        Ok(())
    }
}

/// Asynchronous PostgreSQL connection.
///
/// Every method takes `&self`; the connection can be shared between tasks
/// (e.g. in an `Arc`). Operations are serialized by an internal lock, so
/// the commands of concurrent callers never interleave on the wire.
pub struct Conn {
    inner: Mutex<Inner>,
    interrupt: InterruptHandle,
    cancel: Option<CancelHandle>,
    json: JsonRegistry,
}

impl Conn {
    /// Connect to a PostgreSQL server.
    ///
    /// Fails with [`Error::ConnectTimeout`] if `connect_timeout` is set and
    /// startup does not finish in time.
    pub async fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        match opts.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, Self::connect_inner(opts))
                .await
                .map_err(|_| Error::ConnectTimeout(limit))?,
            None => Self::connect_inner(opts).await,
        }
    }

    async fn connect_inner(opts: Opts) -> Result<Self> {
        let endpoint = Endpoint::from_opts(&opts)?;
        debug!(?endpoint, user = %opts.user, "connecting");
        let stream = Stream::connect(&endpoint).await?;
        let interrupt = InterruptHandle::default();

        let mut inner = Inner {
            stream,
            buffer_set: BufferSet::new(),
            server_params: Vec::new(),
            encoding: Encoding::default(),
            transaction_status: TransactionStatus::Unknown,
            broken: false,
            closed: false,
            autocommit: opts.autocommit,
            tx_settings: TxSettings::default(),
            num_transactions: 0,
            tpc: None,
            pipeline: None,
            next_pipeline_id: 0,
            pending_notifies: VecDeque::new(),
            async_message_handler: None,
            interrupt: interrupt.clone(),
            cancel: None,
        };

        let mut state_machine = ConnectionStateMachine::new(opts);
        inner.drive_idle(&mut state_machine).await?;

        for (name, value) in state_machine.take_server_params() {
            inner.set_server_param(name, value);
        }
        let cancel = state_machine
            .backend_key()
            .map(|(pid, secret)| CancelHandle::new(endpoint, pid, secret));
        inner.cancel = cancel.clone();
        debug!(
            pid = cancel.as_ref().map_or(0, |c| c.process_id()),
            "connection established"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            interrupt,
            cancel,
            json: JsonRegistry::default(),
        })
    }

    /// Acquire the execution lock, failing if the connection is unusable.
    pub(crate) async fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().await;
        inner.check_usable()?;
        Ok(inner)
    }

    /// Acquire the execution lock whatever the connection state.
    pub(crate) async fn lock_any(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().await
    }

    /// Handle for canceling the running command from anywhere.
    ///
    /// `None` if the server did not send a backend key.
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.cancel.clone()
    }

    /// Handle for interrupting the running command.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Backend process id, `0` if unknown.
    pub fn backend_pid(&self) -> u32 {
        self.cancel.as_ref().map_or(0, |c| c.process_id())
    }

    /// JSON adaptation strategies scoped to this connection.
    pub fn json(&self) -> &JsonRegistry {
        &self.json
    }

    /// Transaction status after the last command.
    pub async fn transaction_status(&self) -> TransactionStatus {
        self.inner.lock().await.transaction_status
    }

    /// Value of a server parameter reported by the server.
    pub async fn server_param(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Whether the connection is out of sync with the server, including a
    /// command abandoned halfway.
    pub async fn is_broken(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.broken || inner.transaction_status == TransactionStatus::Active
    }

    pub async fn autocommit(&self) -> bool {
        self.inner.lock().await.autocommit
    }

    pub async fn isolation_level(&self) -> Option<IsolationLevel> {
        self.inner.lock().await.tx_settings.isolation_level
    }

    pub async fn read_only(&self) -> Option<bool> {
        self.inner.lock().await.tx_settings.read_only
    }

    pub async fn deferrable(&self) -> Option<bool> {
        self.inner.lock().await.tx_settings.deferrable
    }

    /// Switch autocommit mode. Only allowed while idle.
    pub async fn set_autocommit(&self, value: bool) -> Result<()> {
        let mut inner = self.lock().await?;
        inner.check_intrans("autocommit").await?;
        inner.autocommit = value;
        Ok(())
    }

    /// Isolation level of the transactions started from now on.
    pub async fn set_isolation_level(&self, value: Option<IsolationLevel>) -> Result<()> {
        let mut inner = self.lock().await?;
        inner.check_intrans("isolation_level").await?;
        inner.tx_settings.isolation_level = value;
        Ok(())
    }

    /// Read-only mode of the transactions started from now on.
    pub async fn set_read_only(&self, value: Option<bool>) -> Result<()> {
        let mut inner = self.lock().await?;
        inner.check_intrans("read_only").await?;
        inner.tx_settings.read_only = value;
        Ok(())
    }

    /// Deferrable mode of the transactions started from now on.
    pub async fn set_deferrable(&self, value: Option<bool>) -> Result<()> {
        let mut inner = self.lock().await?;
        inner.check_intrans("deferrable").await?;
        inner.tx_settings.deferrable = value;
        Ok(())
    }

    /// Set the async message handler.
    ///
    /// The handler is called when the server sends asynchronous messages:
    /// - `Notification` - from LISTEN/NOTIFY
    /// - `Notice` - warnings and informational messages
    /// - `ParameterChanged` - server parameter updates
    pub async fn set_async_message_handler<H: AsyncMessageHandler + 'static>(&self, handler: H) {
        self.inner.lock().await.async_message_handler = Some(Box::new(handler));
    }

    /// Remove the async message handler.
    pub async fn clear_async_message_handler(&self) {
        self.inner.lock().await.async_message_handler = None;
    }

    /// Execute one command and return its result.
    ///
    /// Without parameters the simple query protocol is used and `sql` may
    /// hold several statements; the result of the last one is returned.
    /// With parameters (`$1`, `$2`, ...) the extended protocol is used.
    ///
    /// Outside autocommit mode a transaction is started first if the
    /// connection is idle. In pipeline mode the command is queued and the
    /// pipeline synchronized.
    pub async fn execute(&self, sql: &str, params: &[Param]) -> Result<QueryResult> {
        let mut inner = self.lock().await?;
        inner.execute(sql, params).await
    }

    /// Run a simple query and return the result of every statement.
    pub async fn query(&self, sql: &str) -> Result<Vec<QueryResult>> {
        let mut inner = self.lock().await?;
        if inner.pipeline.is_some() {
            return Err(Error::InvalidUsage(
                "multi-statement queries are not available in pipeline mode".into(),
            ));
        }
        inner.start_implicit_transaction().await?;
        inner.simple_query(sql).await
    }

    /// Commit the current transaction. A no-op while idle.
    pub async fn commit(&self) -> Result<()> {
        let mut inner = self.lock().await?;
        inner.check_explicit_end("commit")?;
        inner.end_transaction("COMMIT").await
    }

    /// Roll back the current transaction. A no-op while idle.
    pub async fn rollback(&self) -> Result<()> {
        let mut inner = self.lock().await?;
        inner.check_explicit_end("rollback")?;
        inner.end_transaction("ROLLBACK").await
    }

    /// Close the connection.
    ///
    /// Closing twice is a no-op; other operations on a closed connection
    /// fail with [`Error::ConnectionClosed`].
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.pipeline = None;

        if !inner.broken {
            let inner = &mut *inner;
            inner.buffer_set.write_buffer.clear();
            write_terminate(&mut inner.buffer_set.write_buffer);
            if let Err(e) = inner.stream.write_all(&inner.buffer_set.write_buffer).await {
                debug!(error = %e, "failed to send Terminate");
            }
        }
        if let Err(e) = inner.stream.shutdown().await {
            debug!(error = %e, "failed to shut down the stream");
        }
        inner.transaction_status = TransactionStatus::Unknown;
        Ok(())
    }
}
