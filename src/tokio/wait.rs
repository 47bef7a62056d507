//! Driving state machines over the transport.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::types::TransactionStatus;
use crate::state::{Action, AsyncMessage, StateMachine};

use super::conn::Inner;

/// Interrupts the command a connection is running.
///
/// Triggering the handle (from a signal handler, another task, ...) makes
/// the connection send a cancel request for the command in flight and keep
/// waiting for its outcome. A command the server cancels fails with
/// [`Error::Canceled`]. A command that completes before the cancel request
/// takes effect keeps its result: the interrupt is logged and dropped.
/// Triggering while no command runs has no effect.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<Notify>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.notify_waiters();
    }
}

/// Report a server-side cancellation of an interrupted command as [`Error::Canceled`].
pub(crate) fn settle_interrupt<T>(interrupted: bool, result: Result<T>) -> Result<T> {
    match result {
        Err(err) if interrupted && err.is_query_canceled() => Err(Error::Canceled),
        other => other,
    }
}

impl Inner {
    /// Drive `state_machine` to completion, sending a cancel request if the
    /// connection is interrupted meanwhile.
    ///
    /// Returns whether an interrupt was received.
    pub(crate) async fn drive<S: StateMachine>(&mut self, state_machine: &mut S) -> Result<bool> {
        let interrupt = self.interrupt.clone();
        let cancel = self.cancel.clone();
        let mut interrupted = false;

        self.transaction_status = TransactionStatus::Active;
        let result = {
            let run = self.run(state_machine);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    result = &mut run => break result,
                    _ = interrupt.0.notified(), if !interrupted => {
                        interrupted = true;
                        warn!("interrupted, canceling the running command");
                        if let Some(cancel) = &cancel
                            && let Err(e) = cancel.cancel().await
                        {
                            warn!(error = %e, "cancel request failed");
                        }
                    }
                }
            }
        };
        self.settle(state_machine, result)?;
        Ok(interrupted)
    }

    /// Drive `state_machine` to completion without watching for interrupts.
    ///
    /// Used for waits that write nothing. The status is left untouched and
    /// reads are cancel safe, so the wait can be abandoned at any point.
    pub(crate) async fn drive_idle<S: StateMachine>(&mut self, state_machine: &mut S) -> Result<()> {
        let result = self.run(state_machine).await;
        self.settle(state_machine, result)
    }

    fn settle<S: StateMachine>(&mut self, state_machine: &S, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.transaction_status = state_machine.transaction_status();
                Ok(())
            }
            Err(e) => {
                // The exchange stopped halfway; the stream is out of sync
                warn!(error = %e, "connection broken");
                self.mark_broken();
                Err(e)
            }
        }
    }

    async fn run<S: StateMachine>(&mut self, state_machine: &mut S) -> Result<()> {
        loop {
            let action = state_machine.step(&mut self.buffer_set)?;
            trace!(?action, "state machine action");
            match action {
                Action::Write => {
                    self.stream.write_all(&self.buffer_set.write_buffer).await?;
                    self.stream.flush().await?;
                }
                Action::ReadMessage => {
                    self.stream.readable().await?;
                    self.stream.read_message(&mut self.buffer_set).await?;
                }
                Action::WriteAndReadMessage => {
                    self.stream.write_all(&self.buffer_set.write_buffer).await?;
                    self.stream.flush().await?;
                    self.stream.read_message(&mut self.buffer_set).await?;
                }
                Action::HandleAsyncMessageAndReadMessage(msg) => {
                    self.handle_async_message(msg);
                    self.stream.readable().await?;
                    self.stream.read_message(&mut self.buffer_set).await?;
                }
                Action::Finished => return Ok(()),
            }
        }
    }

    pub(crate) fn handle_async_message(&mut self, msg: AsyncMessage) {
        if let Some(handler) = &mut self.async_message_handler {
            handler.handle(&msg);
        }
        match msg {
            AsyncMessage::Notification(raw) => {
                trace!(pid = raw.pid, "notification buffered");
                self.pending_notifies.push_back(raw);
            }
            AsyncMessage::Notice(fields) => {
                warn!(
                    severity = fields.severity().unwrap_or_default(),
                    code = fields.code.as_deref().unwrap_or_default(),
                    "server notice: {}",
                    fields.message.as_deref().unwrap_or_default()
                );
            }
            AsyncMessage::ParameterChanged { name, value } => {
                debug!(%name, %value, "parameter changed");
                self.set_server_param(name, value);
            }
        }
    }
}
