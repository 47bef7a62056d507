//! Shared pipeline types.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::protocol::frontend::write_query_unnamed;
use crate::result::QueryResult;
use crate::types::Param;

/// A ticket for a queued pipeline command.
///
/// Created by [`Pipeline::execute`](crate::tokio::Pipeline::execute).
/// Redeem with [`Pipeline::claim`](crate::tokio::Pipeline::claim) once the
/// command has been synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Ticket {
    pub(crate) pipeline_id: u64,
    pub(crate) seq: u64,
}

/// Pipeline mode state owned by the connection.
///
/// Commands are encoded into `request` as they are queued and reach the
/// server together with the Sync that closes them.
#[derive(Debug)]
pub(crate) struct PipelineState {
    pub(crate) id: u64,
    pub(crate) level: usize,
    request: Vec<u8>,
    /// Ticket sequence of each queued command, `None` for internal commands
    queued: Vec<Option<u64>>,
    outcomes: HashMap<u64, Result<QueryResult>>,
    next_seq: u64,
}

impl PipelineState {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            level: 0,
            request: Vec::new(),
            queued: Vec::new(),
            outcomes: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Encode a command into the pending batch.
    pub(crate) fn queue(&mut self, query: &str, params: &[Param], ticketed: bool) -> Option<Ticket> {
        write_query_unnamed(&mut self.request, query, params);
        let ticket = ticketed.then(|| {
            let seq = self.next_seq;
            self.next_seq += 1;
            Ticket {
                pipeline_id: self.id,
                seq,
            }
        });
        self.queued.push(ticket.map(|t| t.seq));
        ticket
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Take the pending batch: its encoded commands and their tickets.
    pub(crate) fn take_batch(&mut self) -> (Vec<u8>, Vec<Option<u64>>) {
        (
            std::mem::take(&mut self.request),
            std::mem::take(&mut self.queued),
        )
    }

    /// Store the outcomes of a synchronized batch, returning its first failure.
    ///
    /// Ticketed failures stay claimable; the caller receives a copy.
    pub(crate) fn complete_batch(
        &mut self,
        tickets: Vec<Option<u64>>,
        outcomes: Vec<Result<QueryResult>>,
    ) -> Result<()> {
        let mut first_error = None;
        for (ticket, outcome) in tickets.into_iter().zip(outcomes) {
            if first_error.is_none()
                && let Err(err) = &outcome
            {
                first_error = Some(copy_command_error(err));
            }
            if let Some(seq) = ticket {
                self.outcomes.insert(seq, outcome);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Take the outcome of a synchronized command.
    pub(crate) fn claim(&mut self, ticket: Ticket) -> Result<QueryResult> {
        if ticket.pipeline_id != self.id {
            return Err(Error::InvalidUsage(
                "ticket belongs to another pipeline".into(),
            ));
        }
        if let Some(outcome) = self.outcomes.remove(&ticket.seq) {
            return outcome;
        }
        if self.queued.contains(&Some(ticket.seq)) {
            Err(Error::InvalidUsage(
                "command not synchronized yet, call sync() first".into(),
            ))
        } else {
            Err(Error::InvalidUsage("ticket already claimed".into()))
        }
    }
}

/// Copy the error of a failed pipeline command.
///
/// Commands only fail with a server error, a cancel or by being skipped.
fn copy_command_error(err: &Error) -> Error {
    match err {
        Error::Server(fields) => Error::Server(fields.clone()),
        Error::PipelineAborted => Error::PipelineAborted,
        Error::Canceled => Error::Canceled,
        other => Error::Protocol(other.to_string()),
    }
}
