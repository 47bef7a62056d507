//! Simple query protocol state machine.

use crate::buffer_set::BufferSet;
use crate::encoding::Encoding;
use crate::error::{Error, Result};
use crate::protocol::backend::query::unexpected;
use crate::protocol::backend::{
    CommandComplete, DataRow, ErrorResponse, ReadyForQuery, RowDescription, is_async_message,
    msg_type,
};
use crate::protocol::frontend::write_query;
use crate::protocol::types::TransactionStatus;
use crate::result::QueryResult;

use super::StateMachine;
use super::action::{Action, parse_async_message};

/// Accumulates the RowDescription / DataRow / CommandComplete messages of one
/// command into a [`QueryResult`].
#[derive(Debug, Default)]
pub(crate) struct ResultCollector {
    current: QueryResult,
}

impl ResultCollector {
    pub(crate) fn row_description(&mut self, payload: &[u8]) -> Result<()> {
        let desc = RowDescription::parse(payload)?;
        self.current.columns = desc.names().iter().map(|s| s.to_string()).collect();
        Ok(())
    }

    pub(crate) fn data_row(&mut self, payload: &[u8], encoding: Encoding) -> Result<()> {
        let row = DataRow::parse(payload)?;
        let values = row
            .values()
            .iter()
            .map(|v| v.map(|bytes| encoding.decode(bytes)).transpose())
            .collect::<Result<Vec<_>>>()?;
        self.current.rows.push(values);
        Ok(())
    }

    pub(crate) fn complete(&mut self, payload: &[u8]) -> Result<QueryResult> {
        let complete = CommandComplete::parse(payload)?;
        let mut result = std::mem::take(&mut self.current);
        result.tag = complete.tag.to_string();
        Ok(result)
    }

    pub(crate) fn empty(&mut self) -> QueryResult {
        std::mem::take(&mut self.current)
    }
}

/// Simple query state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    WaitingResponse,
    Finished,
}

/// Simple query protocol state machine.
///
/// Sends one Query message (which may hold several `;`-separated
/// statements) and collects one [`QueryResult`] per statement. A server
/// error is held until ReadyForQuery so the connection is left in sync.
pub struct SimpleQueryStateMachine {
    state: State,
    query: String,
    encoding: Encoding,
    collector: ResultCollector,
    results: Vec<QueryResult>,
    error: Option<Error>,
    transaction_status: TransactionStatus,
}

impl SimpleQueryStateMachine {
    /// Create a new simple query state machine.
    pub fn new(query: impl Into<String>, encoding: Encoding) -> Self {
        Self {
            state: State::Initial,
            query: query.into(),
            encoding,
            collector: ResultCollector::default(),
            results: Vec::new(),
            error: None,
            transaction_status: TransactionStatus::Active,
        }
    }

    /// The SQL this machine sends.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Consume the machine, returning the results or the server error.
    pub fn into_results(self) -> Result<Vec<QueryResult>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.results),
        }
    }

    fn handle_response(&mut self, buffer_set: &BufferSet) -> Result<Action> {
        let payload = buffer_set.read_buffer.as_slice();

        match buffer_set.type_byte {
            msg_type::ROW_DESCRIPTION => self.collector.row_description(payload)?,
            msg_type::DATA_ROW => self.collector.data_row(payload, self.encoding)?,
            msg_type::COMMAND_COMPLETE => {
                let result = self.collector.complete(payload)?;
                self.results.push(result);
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                let result = self.collector.empty();
                self.results.push(result);
            }
            msg_type::ERROR_RESPONSE => {
                let error = ErrorResponse::parse(payload)?.into_error();
                if error.is_connection_broken() {
                    // The server closes the session; no ReadyForQuery follows
                    return Err(error);
                }
                // Only the first error of a multi-statement query is kept
                self.error.get_or_insert(error);
            }
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(payload)?.transaction_status()?;
                self.state = State::Finished;
                return Ok(Action::Finished);
            }
            other => return Err(unexpected("simple query", other)),
        }

        Ok(Action::ReadMessage)
    }
}

impl StateMachine for SimpleQueryStateMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match self.state {
            State::Initial => {
                buffer_set.write_buffer.clear();
                write_query(&mut buffer_set.write_buffer, &self.query);
                self.state = State::WaitingResponse;
                Ok(Action::WriteAndReadMessage)
            }
            State::WaitingResponse => {
                if is_async_message(buffer_set.type_byte) {
                    return Ok(Action::HandleAsyncMessageAndReadMessage(
                        parse_async_message(buffer_set)?,
                    ));
                }
                self.handle_response(buffer_set)
            }
            State::Finished => Err(Error::Protocol("simple query already finished".into())),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(sm: &mut SimpleQueryStateMachine, bs: &mut BufferSet, type_byte: u8, payload: &[u8]) -> Action {
        bs.type_byte = type_byte;
        bs.read_buffer.clear();
        bs.read_buffer.extend_from_slice(payload);
        sm.step(bs).unwrap()
    }

    fn row_description(name: &str) -> Vec<u8> {
        let mut p = 1i16.to_be_bytes().to_vec();
        p.extend_from_slice(name.as_bytes());
        p.push(0);
        p.extend_from_slice(&[0u8; 18]);
        p
    }

    fn data_row(value: Option<&str>) -> Vec<u8> {
        let mut p = 1i16.to_be_bytes().to_vec();
        match value {
            Some(v) => {
                p.extend_from_slice(&(v.len() as i32).to_be_bytes());
                p.extend_from_slice(v.as_bytes());
            }
            None => p.extend_from_slice(&(-1i32).to_be_bytes()),
        }
        p
    }

    #[test]
    fn collects_rows() {
        let mut sm = SimpleQueryStateMachine::new("SELECT x FROM t", Encoding::Utf8);
        let mut bs = BufferSet::new();

        assert!(matches!(sm.step(&mut bs).unwrap(), Action::WriteAndReadMessage));
        assert_eq!(bs.write_buffer[0], b'Q');

        feed(&mut sm, &mut bs, b'T', &row_description("x"));
        feed(&mut sm, &mut bs, b'D', &data_row(Some("1")));
        feed(&mut sm, &mut bs, b'D', &data_row(None));
        feed(&mut sm, &mut bs, b'C', b"SELECT 2\0");
        assert!(matches!(feed(&mut sm, &mut bs, b'Z', b"T"), Action::Finished));

        assert_eq!(sm.transaction_status(), TransactionStatus::InTransaction);
        let results = sm.into_results().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].columns, vec!["x"]);
        assert_eq!(results[0].rows, vec![vec![Some("1".to_string())], vec![None]]);
        assert_eq!(results[0].rows_affected(), Some(2));
    }

    #[test]
    fn error_waits_for_ready() {
        let mut sm = SimpleQueryStateMachine::new("SELECT boom", Encoding::Utf8);
        let mut bs = BufferSet::new();
        sm.step(&mut bs).unwrap();

        assert!(matches!(
            feed(&mut sm, &mut bs, b'E', b"SERROR\0C42703\0Mno column\0\0"),
            Action::ReadMessage
        ));
        assert!(matches!(feed(&mut sm, &mut bs, b'Z', b"E"), Action::Finished));
        assert_eq!(sm.transaction_status(), TransactionStatus::InError);
        assert_eq!(sm.into_results().unwrap_err().sqlstate(), Some("42703"));
    }

    #[test]
    fn notice_is_async() {
        let mut sm = SimpleQueryStateMachine::new("SELECT 1", Encoding::Utf8);
        let mut bs = BufferSet::new();
        sm.step(&mut bs).unwrap();

        let action = feed(&mut sm, &mut bs, b'N', b"SWARNING\0Mcareful\0\0");
        assert!(matches!(
            action,
            Action::HandleAsyncMessageAndReadMessage(crate::state::AsyncMessage::Notice(_))
        ));
    }

    #[test]
    fn fatal_error_ends_the_exchange() {
        let mut sm = SimpleQueryStateMachine::new("SELECT 1", Encoding::Utf8);
        let mut bs = BufferSet::new();
        sm.step(&mut bs).unwrap();

        bs.type_byte = b'E';
        bs.read_buffer.clear();
        bs.read_buffer
            .extend_from_slice(b"SFATAL\0VFATAL\0C57P01\0Mterminating connection\0\0");
        let err = sm.step(&mut bs).unwrap_err();
        assert_eq!(err.sqlstate(), Some("57P01"));
        assert!(err.is_connection_broken());
    }
}
