//! Waiting for LISTEN/NOTIFY notifications on an idle connection.

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::protocol::backend::query::unexpected;
use crate::protocol::backend::{NotificationResponse, msg_type};
use crate::protocol::types::TransactionStatus;

use super::StateMachine;
use super::action::{Action, parse_async_message};

/// A notification as it arrived, before text decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    /// PID of the notifying backend process
    pub pid: u32,
    /// Channel name
    pub channel: Vec<u8>,
    /// Notification payload
    pub payload: Vec<u8>,
}

/// Reads until a NotificationResponse arrives.
///
/// Nothing is written; notices and parameter changes seen while waiting are
/// passed through as asynchronous messages.
pub struct NotifyStateMachine {
    started: bool,
    received: Option<RawNotification>,
    transaction_status: TransactionStatus,
}

impl NotifyStateMachine {
    /// Create a machine for a connection currently in `transaction_status`.
    pub fn new(transaction_status: TransactionStatus) -> Self {
        Self {
            started: false,
            received: None,
            transaction_status,
        }
    }

    /// The notification that finished the machine.
    pub fn take_notification(&mut self) -> Option<RawNotification> {
        self.received.take()
    }
}

impl StateMachine for NotifyStateMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if !self.started {
            self.started = true;
            return Ok(Action::ReadMessage);
        }
        if self.received.is_some() {
            return Err(Error::Protocol("notification already received".into()));
        }

        match buffer_set.type_byte {
            msg_type::NOTIFICATION_RESPONSE => {
                let n = NotificationResponse::parse(&buffer_set.read_buffer)?;
                self.received = Some(RawNotification {
                    pid: n.pid,
                    channel: n.channel.to_vec(),
                    payload: n.payload.to_vec(),
                });
                Ok(Action::Finished)
            }
            msg_type::NOTICE_RESPONSE | msg_type::PARAMETER_STATUS => Ok(
                Action::HandleAsyncMessageAndReadMessage(parse_async_message(buffer_set)?),
            ),
            other => Err(unexpected("notification wait", other)),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}
