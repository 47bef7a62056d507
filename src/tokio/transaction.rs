//! Transaction scopes for asynchronous PostgreSQL connections.

use tracing::{debug, warn};

use crate::command::{generated_savepoint_name, release_savepoint, rollback_to_savepoint, savepoint};
use crate::error::{Error, Result};
use crate::protocol::types::TransactionStatus;

use super::Conn;

/// An open transaction scope, passed to the [`Conn::transaction`] closure.
///
/// The outermost scope is a real transaction; nested scopes are savepoints.
pub struct Transaction<'c> {
    conn: &'c Conn,
    savepoint_name: Option<String>,
    outer: bool,
}

impl<'c> Transaction<'c> {
    /// The connection the transaction runs on.
    pub fn connection(&self) -> &'c Conn {
        self.conn
    }

    /// Savepoint of this scope, if any.
    pub fn savepoint_name(&self) -> Option<&str> {
        self.savepoint_name.as_deref()
    }

    /// Whether this scope started the transaction.
    pub fn is_outer(&self) -> bool {
        self.outer
    }
}

impl Conn {
    /// Run `f` inside a transaction scope.
    ///
    /// On an idle connection the scope starts a transaction (with the
    /// configured isolation level, read-only and deferrable modes); inside a
    /// transaction it creates a savepoint, named `savepoint_name` or
    /// `_zp_<depth>`. The scope commits when `f` returns `Ok` and rolls back
    /// when it returns `Err` or `force_rollback` is set. A rollback failure
    /// while handling an error from `f` is logged and `f`'s error returned.
    ///
    /// In pipeline mode the scope's control commands are queued in the
    /// pipeline rather than sent one by one.
    ///
    /// ```no_run
    /// # async fn demo(conn: &zero_pgdriver::tokio::Conn) -> zero_pgdriver::Result<()> {
    /// conn.transaction(None, false, async |tx| {
    ///     tx.connection().execute("INSERT INTO t VALUES (1)", &[]).await?;
    ///     Ok(())
    /// })
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn transaction<R, F>(
        &self,
        savepoint_name: Option<&str>,
        force_rollback: bool,
        f: F,
    ) -> Result<R>
    where
        F: AsyncFnOnce(&Transaction<'_>) -> Result<R>,
    {
        let pipelined = self.lock().await?.pipeline.is_some();
        if !pipelined {
            return self.transaction_scope(savepoint_name, force_rollback, f).await;
        }

        self.pipeline_enter().await?;
        let result = self
            .transaction_scope(savepoint_name, force_rollback, async move |tx| {
                self.pipeline_enter().await?;
                let result = f(tx).await;
                self.pipeline_exit(result).await
            })
            .await;
        self.pipeline_exit(result).await
    }

    async fn transaction_scope<R, F>(
        &self,
        savepoint_name: Option<&str>,
        force_rollback: bool,
        f: F,
    ) -> Result<R>
    where
        F: AsyncFnOnce(&Transaction<'_>) -> Result<R>,
    {
        let tx = self.tx_enter(savepoint_name).await?;
        let result = f(&tx).await;
        self.tx_exit(&tx, force_rollback, result).await
    }

    async fn tx_enter(&self, savepoint_name: Option<&str>) -> Result<Transaction<'_>> {
        let mut inner = self.lock().await?;
        if inner.tpc.is_some() {
            return Err(Error::InvalidUsage(
                "transaction scopes cannot be used during a two-phase transaction".into(),
            ));
        }

        let outer = inner.transaction_status == TransactionStatus::Idle;
        if outer && inner.num_transactions > 0 {
            return Err(Error::InvalidUsage(
                "transaction scope open on an idle connection".into(),
            ));
        }
        let savepoint_name = match savepoint_name {
            Some(name) => Some(name.to_string()),
            None if outer => None,
            None => Some(generated_savepoint_name(inner.num_transactions + 1)),
        };
        inner.num_transactions += 1;
        debug!(outer, savepoint = ?savepoint_name, depth = inner.num_transactions, "enter transaction scope");

        let mut commands = Vec::with_capacity(2);
        if outer {
            commands.push(inner.tx_settings.begin_command());
        }
        if let Some(name) = &savepoint_name {
            commands.push(savepoint(name));
        }
        for command in &commands {
            if let Err(e) = inner.run_command(command).await {
                inner.num_transactions -= 1;
                return Err(e);
            }
        }

        Ok(Transaction {
            conn: self,
            savepoint_name,
            outer,
        })
    }

    async fn tx_exit<R>(&self, tx: &Transaction<'_>, force_rollback: bool, result: Result<R>) -> Result<R> {
        let mut inner = self.lock_any().await;
        inner.num_transactions = inner.num_transactions.saturating_sub(1);

        let mut commands = Vec::with_capacity(2);
        let commit = result.is_ok() && !force_rollback;
        if let Some(name) = tx.savepoint_name.as_deref().filter(|_| !tx.outer) {
            if commit {
                commands.push(release_savepoint(name));
            } else {
                commands.extend(rollback_to_savepoint(name));
            }
        }
        if tx.outer {
            commands.push(if commit { "COMMIT" } else { "ROLLBACK" }.to_string());
        }
        debug!(commit, depth = inner.num_transactions, "exit transaction scope");

        let mut ended = inner.check_usable();
        for command in &commands {
            if ended.is_err() {
                break;
            }
            ended = inner.run_command(command).await;
        }

        match (result, ended) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(rollback_err)) => {
                warn!(error = %rollback_err, "error ignored in transaction rollback");
                Err(e)
            }
        }
    }
}
