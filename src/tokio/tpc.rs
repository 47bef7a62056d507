//! Two-phase commit.

use tracing::debug;

use crate::command::{commit_prepared, prepare_transaction, rollback_prepared};
use crate::error::{Error, Result, sqlstate};
use crate::protocol::types::TransactionStatus;
use crate::xid::Xid;

use super::Conn;

const RECOVER_QUERY: &str = "SELECT gid, prepared, owner, database FROM pg_prepared_xacts";

#[derive(Debug, Clone, Copy)]
enum Finish {
    Commit,
    Rollback,
}

impl Finish {
    fn name(self) -> &'static str {
        match self {
            Finish::Commit => "commit",
            Finish::Rollback => "rollback",
        }
    }
}

impl Conn {
    /// Begin a two-phase transaction identified by `xid`.
    ///
    /// The connection must be idle, not in autocommit mode, and not bound to
    /// another two-phase transaction (prepared ones included).
    pub async fn tpc_begin(&self, xid: impl Into<Xid>) -> Result<()> {
        let xid = xid.into();
        let mut inner = self.lock().await?;
        if let Some((bound, _)) = &inner.tpc {
            return Err(Error::InvalidUsage(format!(
                "can't start two-phase transaction: {} is still bound",
                bound
            )));
        }
        if inner.transaction_status != TransactionStatus::Idle {
            return Err(Error::InvalidUsage(format!(
                "can't start two-phase transaction: connection in status {}",
                inner.transaction_status.name()
            )));
        }
        if inner.autocommit {
            return Err(Error::InvalidUsage(
                "can't use two-phase transactions in autocommit mode".into(),
            ));
        }

        debug!(xid = %xid, "tpc begin");
        inner.tpc = Some((xid, false));
        let begin = inner.tx_settings.begin_command();
        inner.run_command(&begin).await
    }

    /// Prepare the bound two-phase transaction (first phase).
    ///
    /// Fails with [`Error::Unsupported`] if the server does not allow
    /// prepared transactions.
    pub async fn tpc_prepare(&self) -> Result<()> {
        let mut inner = self.lock().await?;
        let xid = match &inner.tpc {
            None => {
                return Err(Error::InvalidUsage(
                    "tpc_prepare() must be called inside a two-phase transaction".into(),
                ));
            }
            Some((_, true)) => {
                return Err(Error::InvalidUsage(
                    "tpc_prepare() cannot be used during a prepared two-phase transaction".into(),
                ));
            }
            Some((xid, false)) => xid.clone(),
        };

        debug!(xid = %xid, "tpc prepare");
        inner.tpc = Some((xid.clone(), true));
        let mut result = inner.run_command(&prepare_transaction(&xid.gid())).await;
        if result.is_ok() && inner.pipeline.is_some() {
            result = inner.pipeline_sync().await;
        }

        result.map_err(|e| match e {
            Error::Server(fields)
                if fields.code.as_deref() == Some(sqlstate::OBJECT_NOT_IN_PREREQUISITE_STATE) =>
            {
                Error::Unsupported(fields.to_string())
            }
            other => other,
        })
    }

    /// Commit a two-phase transaction (second phase).
    ///
    /// Without `xid` the bound transaction is committed: with a plain
    /// `COMMIT` if it was never prepared, with `COMMIT PREPARED` otherwise.
    /// With `xid` a transaction prepared earlier (possibly by another
    /// session) is committed; no two-phase transaction may be bound.
    pub async fn tpc_commit(&self, xid: Option<Xid>) -> Result<()> {
        self.tpc_finish(Finish::Commit, xid).await
    }

    /// Roll back a two-phase transaction. See [`Conn::tpc_commit`].
    pub async fn tpc_rollback(&self, xid: Option<Xid>) -> Result<()> {
        self.tpc_finish(Finish::Rollback, xid).await
    }

    async fn tpc_finish(&self, action: Finish, xid: Option<Xid>) -> Result<()> {
        let mut inner = self.lock().await?;
        let fname = format!("tpc_{}()", action.name());

        let xid = match (xid, &inner.tpc) {
            (None, None) => {
                return Err(Error::InvalidUsage(format!(
                    "{} without xid must be called inside a two-phase transaction",
                    fname
                )));
            }
            (None, Some((bound, _))) => bound.clone(),
            (Some(_), Some(_)) => {
                return Err(Error::InvalidUsage(format!(
                    "{} with xid must be called outside a two-phase transaction",
                    fname
                )));
            }
            (Some(xid), None) => xid,
        };
        debug!(xid = %xid, action = action.name(), "tpc finish");

        if let Some((_, false)) = inner.tpc {
            inner.tpc = None;
            let command = match action {
                Finish::Commit => "COMMIT",
                Finish::Rollback => "ROLLBACK",
            };
            return inner.end_transaction(command).await;
        }

        let gid = xid.gid();
        let command = match action {
            Finish::Commit => commit_prepared(&gid),
            Finish::Rollback => rollback_prepared(&gid),
        };
        inner.run_command(&command).await?;
        if inner.pipeline.is_some() {
            inner.pipeline_sync().await?;
        }
        inner.tpc = None;
        Ok(())
    }

    /// List the transactions prepared on the server.
    ///
    /// If listing them opened a transaction on an idle connection, it is
    /// rolled back so the connection is left idle.
    pub async fn tpc_recover(&self) -> Result<Vec<Xid>> {
        let mut inner = self.lock().await?;
        let before = inner.transaction_status;
        let result = inner.execute(RECOVER_QUERY, &[]).await?;

        let xids = result
            .rows
            .into_iter()
            .map(|mut row| {
                row.resize(4, None);
                let mut values = row.into_iter();
                let gid = values.next().flatten().unwrap_or_default();
                let prepared = values.next().flatten();
                let owner = values.next().flatten();
                let database = values.next().flatten();
                Xid::from_gid(&gid).with_recovery_info(prepared, owner, database)
            })
            .collect();

        if before == TransactionStatus::Idle
            && inner.transaction_status == TransactionStatus::InTransaction
        {
            debug!("rolling back the transaction opened by tpc_recover");
            inner.end_transaction("ROLLBACK").await?;
        }
        Ok(xids)
    }
}
