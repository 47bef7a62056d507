//! Async pipeline mode for batching multiple commands.
//!
//! Commands queued in a pipeline are sent together with the Sync that
//! closes them, saving a round trip per command.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo(conn: &zero_pgdriver::tokio::Conn) -> zero_pgdriver::Result<()> {
//! use zero_pgdriver::Param;
//!
//! let (a, b) = conn
//!     .pipeline(async |p| {
//!         let t1 = p.execute("INSERT INTO t VALUES ($1)", &[Param::text("1")]).await?;
//!         let t2 = p.execute("SELECT count(*) FROM t", &[]).await?;
//!         p.sync().await?;
//!         Ok((p.claim(t1).await?, p.claim(t2).await?))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pipeline::{PipelineState, Ticket};
use crate::result::QueryResult;
use crate::types::Param;

use super::conn::{Conn, Inner};

/// Handle to the active pipeline, passed to the [`Conn::pipeline`] closure.
pub struct Pipeline<'c> {
    conn: &'c Conn,
    id: u64,
}

fn active(inner: &mut Inner, id: u64) -> Result<&mut PipelineState> {
    inner
        .pipeline
        .as_mut()
        .filter(|p| p.id == id)
        .ok_or_else(|| Error::InvalidUsage("the pipeline is no longer active".into()))
}

impl<'c> Pipeline<'c> {
    /// Identifier shared by every nesting level of the same pipeline.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The connection the pipeline runs on.
    pub fn connection(&self) -> &'c Conn {
        self.conn
    }

    /// Current nesting level, `1` for the outermost scope.
    pub async fn level(&self) -> Result<usize> {
        let mut inner = self.conn.lock().await?;
        Ok(active(&mut inner, self.id)?.level)
    }

    /// Queue a command. Its result can be claimed after the next sync.
    pub async fn execute(&self, sql: &str, params: &[Param]) -> Result<Ticket> {
        let mut inner = self.conn.lock().await?;
        active(&mut inner, self.id)?;
        inner.start_implicit_transaction().await?;
        debug!(sql, pipeline = self.id, "queue command");
        active(&mut inner, self.id)?
            .queue(sql, params, true)
            .ok_or_else(|| Error::Protocol("ticketed command without ticket".into()))
    }

    /// Send the queued commands and collect their results.
    ///
    /// Returns the first failure; commands after it resolve to
    /// [`Error::PipelineAborted`].
    pub async fn sync(&self) -> Result<()> {
        let mut inner = self.conn.lock().await?;
        active(&mut inner, self.id)?;
        inner.pipeline_sync().await
    }

    /// Take the result of a synchronized command.
    pub async fn claim(&self, ticket: Ticket) -> Result<QueryResult> {
        let mut inner = self.conn.lock().await?;
        active(&mut inner, self.id)?.claim(ticket)
    }
}

impl Conn {
    /// Run `f` in pipeline mode.
    ///
    /// Pipelines nest: entering while one is active raises its level (after
    /// syncing anything still queued) instead of creating a new one. Every
    /// exit syncs; leaving the outermost level ends pipeline mode. If the
    /// closure fails, a failure of the closing sync is only logged.
    pub async fn pipeline<R, F>(&self, f: F) -> Result<R>
    where
        F: AsyncFnOnce(&Pipeline<'_>) -> Result<R>,
    {
        let id = self.pipeline_enter().await?;
        let pipeline = Pipeline { conn: self, id };
        let result = f(&pipeline).await;
        self.pipeline_exit(result).await
    }

    /// Current pipeline nesting level, `0` outside pipeline mode.
    pub async fn pipeline_level(&self) -> usize {
        let inner = self.lock_any().await;
        inner.pipeline.as_ref().map_or(0, |p| p.level)
    }

    pub(crate) async fn pipeline_enter(&self) -> Result<u64> {
        let mut inner = self.lock().await?;
        match inner.pipeline.as_ref().map(PipelineState::has_queued) {
            None => {
                inner.next_pipeline_id += 1;
                let id = inner.next_pipeline_id;
                debug!(pipeline = id, "entering pipeline mode");
                inner.pipeline = Some(PipelineState::new(id));
            }
            Some(true) => inner.pipeline_sync().await?,
            Some(false) => {}
        }
        let pipeline = inner
            .pipeline
            .as_mut()
            .ok_or_else(|| Error::Protocol("pipeline detached while entering".into()))?;
        pipeline.level += 1;
        Ok(pipeline.id)
    }

    pub(crate) async fn pipeline_exit<R>(&self, result: Result<R>) -> Result<R> {
        let mut guard = self.lock_any().await;
        let inner = &mut *guard;
        let synced = match inner.check_usable() {
            Ok(()) => inner.pipeline_sync().await,
            Err(e) => Err(e),
        };

        if let Some(pipeline) = &mut inner.pipeline {
            pipeline.level = pipeline.level.saturating_sub(1);
            if pipeline.level == 0 {
                debug!(pipeline = pipeline.id, "leaving pipeline mode");
                inner.pipeline = None;
            }
        }

        match (result, synced) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(sync_err)) => {
                warn!(error = %sync_err, "error ignored terminating pipeline");
                Err(e)
            }
        }
    }
}
