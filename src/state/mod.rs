//! Sans-I/O state machines for PostgreSQL protocol.
//!
//! Each command (startup, simple query, extended query batch, notification
//! poll) is a state machine that performs no I/O. It produces [`Action`]
//! values that tell the driver what to wait for, and is resumed by calling
//! [`StateMachine::step`] once that I/O is done. The same machines can be
//! driven by any runtime; the `tokio` module provides the async driver.

pub mod action;
pub mod connection;
pub mod extended;
pub mod notify;
pub mod simple_query;

use crate::buffer_set::BufferSet;
use crate::error::Result;
use crate::protocol::types::TransactionStatus;

pub use action::{Action, AsyncMessage};
pub use connection::{ConnectionState, ConnectionStateMachine};
pub use extended::ExtendedQueryStateMachine;
pub use notify::{NotifyStateMachine, RawNotification};
pub use simple_query::SimpleQueryStateMachine;

/// A resumable protocol operation.
pub trait StateMachine {
    /// Advance the machine with the message in `buffer_set` (or start it).
    ///
    /// On the first call no message has been read yet.
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action>;

    /// Transaction status reported by the last ReadyForQuery.
    fn transaction_status(&self) -> TransactionStatus;
}
