//! Extended query protocol state machine.
//!
//! Every command is sent as Parse/Bind/Describe/Execute on the unnamed
//! statement and portal. A batch of such commands is closed by one Sync;
//! the machine then reads the results of the whole batch until the
//! ReadyForQuery that answers the Sync.

use crate::buffer_set::BufferSet;
use crate::encoding::Encoding;
use crate::error::{Error, Result};
use crate::protocol::backend::query::unexpected;
use crate::protocol::backend::{ErrorResponse, ReadyForQuery, is_async_message, msg_type};
use crate::protocol::frontend::{write_query_unnamed, write_sync};
use crate::protocol::types::TransactionStatus;
use crate::result::QueryResult;
use crate::types::Param;

use super::StateMachine;
use super::action::{Action, parse_async_message};
use super::simple_query::ResultCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Reading,
    Finished,
}

/// Extended query state machine.
///
/// After an ErrorResponse the server skips every remaining command of the
/// batch; those resolve to [`Error::PipelineAborted`].
pub struct ExtendedQueryStateMachine {
    state: State,
    request: Vec<u8>,
    expected: usize,
    encoding: Encoding,
    collector: ResultCollector,
    outcomes: Vec<Result<QueryResult>>,
    aborted: bool,
    transaction_status: TransactionStatus,
}

impl ExtendedQueryStateMachine {
    /// A single parameterized command followed by Sync.
    pub fn execute(query: &str, params: &[Param], encoding: Encoding) -> Self {
        let mut request = Vec::new();
        write_query_unnamed(&mut request, query, params);
        Self::batch(request, 1, encoding)
    }

    /// `expected` already encoded commands in `request`, closed by a Sync.
    pub fn batch(mut request: Vec<u8>, expected: usize, encoding: Encoding) -> Self {
        write_sync(&mut request);
        Self::with_request(request, expected, encoding)
    }

    fn with_request(request: Vec<u8>, expected: usize, encoding: Encoding) -> Self {
        Self {
            state: State::Initial,
            request,
            expected,
            encoding,
            collector: ResultCollector::default(),
            outcomes: Vec::with_capacity(expected),
            aborted: false,
            transaction_status: TransactionStatus::Active,
        }
    }

    /// Whether a command of the batch failed.
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Consume the machine, returning one outcome per command in send order.
    pub fn into_outcomes(self) -> Vec<Result<QueryResult>> {
        self.outcomes
    }

    fn push_outcome(&mut self, outcome: Result<QueryResult>) -> Result<()> {
        if self.outcomes.len() >= self.expected {
            return Err(Error::Protocol(format!(
                "more results than the {} commands sent",
                self.expected
            )));
        }
        self.outcomes.push(outcome);
        Ok(())
    }

    fn handle_message(&mut self, buffer_set: &BufferSet) -> Result<Action> {
        let payload = buffer_set.read_buffer.as_slice();

        match buffer_set.type_byte {
            msg_type::PARSE_COMPLETE | msg_type::BIND_COMPLETE | msg_type::NO_DATA => {}
            msg_type::ROW_DESCRIPTION => self.collector.row_description(payload)?,
            msg_type::DATA_ROW => self.collector.data_row(payload, self.encoding)?,
            msg_type::COMMAND_COMPLETE => {
                let result = self.collector.complete(payload)?;
                self.push_outcome(Ok(result))?;
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                let result = self.collector.empty();
                self.push_outcome(Ok(result))?;
            }
            msg_type::ERROR_RESPONSE => {
                let error = ErrorResponse::parse(payload)?.into_error();
                self.collector.empty();
                self.aborted = true;
                if self.outcomes.len() < self.expected && !error.is_connection_broken() {
                    self.outcomes.push(Err(error));
                } else {
                    // Failure of the Sync itself, or of the session
                    return Err(error);
                }
            }
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(payload)?.transaction_status()?;
                while self.outcomes.len() < self.expected {
                    self.outcomes.push(Err(Error::PipelineAborted));
                }
                self.state = State::Finished;
                return Ok(Action::Finished);
            }
            other => return Err(unexpected("extended query", other)),
        }

        Ok(Action::ReadMessage)
    }
}

impl StateMachine for ExtendedQueryStateMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match self.state {
            State::Initial => {
                buffer_set.write_buffer.clear();
                buffer_set.write_buffer.append(&mut self.request);
                self.state = State::Reading;
                Ok(Action::WriteAndReadMessage)
            }
            State::Reading => {
                if is_async_message(buffer_set.type_byte) {
                    return Ok(Action::HandleAsyncMessageAndReadMessage(
                        parse_async_message(buffer_set)?,
                    ));
                }
                self.handle_message(buffer_set)
            }
            State::Finished => Err(Error::Protocol("extended query already finished".into())),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(sm: &mut ExtendedQueryStateMachine, bs: &mut BufferSet, type_byte: u8, payload: &[u8]) -> Action {
        bs.type_byte = type_byte;
        bs.read_buffer.clear();
        bs.read_buffer.extend_from_slice(payload);
        sm.step(bs).unwrap()
    }

    fn complete(sm: &mut ExtendedQueryStateMachine, bs: &mut BufferSet, tag: &str) {
        feed(sm, bs, b'1', b"");
        feed(sm, bs, b'2', b"");
        feed(sm, bs, b'n', b"");
        let mut payload = tag.as_bytes().to_vec();
        payload.push(0);
        feed(sm, bs, b'C', &payload);
    }

    #[test]
    fn execute_writes_sync() {
        let mut sm = ExtendedQueryStateMachine::execute("SELECT $1", &[Param::text("1")], Encoding::Utf8);
        let mut bs = BufferSet::new();
        assert!(matches!(sm.step(&mut bs).unwrap(), Action::WriteAndReadMessage));
        assert_eq!(bs.write_buffer[0], b'P');
        assert_eq!(&bs.write_buffer[bs.write_buffer.len() - 5..], &[b'S', 0, 0, 0, 4]);

        complete(&mut sm, &mut bs, "SELECT 1");
        assert!(matches!(feed(&mut sm, &mut bs, b'Z', b"I"), Action::Finished));
        let outcomes = sm.into_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].as_ref().unwrap().tag, "SELECT 1");
    }

    #[test]
    fn error_aborts_rest_of_batch() {
        let mut sm = ExtendedQueryStateMachine::batch(Vec::new(), 3, Encoding::Utf8);
        let mut bs = BufferSet::new();
        sm.step(&mut bs).unwrap();
        assert_eq!(bs.write_buffer, vec![b'S', 0, 0, 0, 4]);

        complete(&mut sm, &mut bs, "INSERT 0 1");
        feed(&mut sm, &mut bs, b'1', b"");
        feed(&mut sm, &mut bs, b'E', b"SERROR\0C23505\0Mduplicate\0\0");
        feed(&mut sm, &mut bs, b'Z', b"E");

        assert!(sm.aborted());
        assert_eq!(sm.transaction_status(), TransactionStatus::InError);
        let outcomes = sm.into_outcomes();
        assert!(outcomes[0].is_ok());
        assert_eq!(outcomes[1].as_ref().unwrap_err().sqlstate(), Some("23505"));
        assert!(matches!(outcomes[2], Err(Error::PipelineAborted)));
    }

    #[test]
    fn extra_result_is_protocol_error() {
        let mut sm = ExtendedQueryStateMachine::batch(Vec::new(), 0, Encoding::Utf8);
        let mut bs = BufferSet::new();
        sm.step(&mut bs).unwrap();
        bs.type_byte = b'C';
        bs.read_buffer = b"SELECT 1\0".to_vec();
        assert!(matches!(sm.step(&mut bs), Err(Error::Protocol(_))));
    }
}
