//! Action types for state machine I/O requests.

use crate::buffer_set::BufferSet;
use crate::error::{ErrorFields, Result};
use crate::protocol::backend::{NoticeResponse, NotificationResponse, ParameterStatus, msg_type};
use crate::protocol::backend::query::unexpected;

use super::notify::RawNotification;

/// Action requested by a state machine.
///
/// This is the "what am I waiting for" answer of a command: the caller
/// performs the requested I/O and then calls `step()` again.
///
/// | Action | Waits for |
/// |---|---|
/// | `Write` | writable |
/// | `ReadMessage` | readable |
/// | `WriteAndReadMessage` | writable, then readable |
/// | `Finished` | nothing |
#[derive(Debug)]
pub enum Action {
    /// Write `buffer_set.write_buffer` to the server and flush.
    Write,

    /// Read a PostgreSQL message from the server.
    ///
    /// The caller should:
    /// 1. Read the message type byte (1 byte)
    /// 2. Read the length (4 bytes, big-endian i32)
    /// 3. Read (length - 4) bytes of payload into the buffer set
    /// 4. Call the state machine's `step()` method again
    ReadMessage,

    /// Write `buffer_set.write_buffer` to the server, then read a message.
    WriteAndReadMessage,

    /// An asynchronous message was received.
    ///
    /// The caller should handle the message, read the next message,
    /// then call `step()` again.
    HandleAsyncMessageAndReadMessage(AsyncMessage),

    /// The state machine has finished.
    Finished,
}

/// Asynchronous message from the server.
///
/// These can arrive at any time during query execution.
#[derive(Debug, Clone)]
pub enum AsyncMessage {
    /// Notification from LISTEN/NOTIFY, not yet decoded.
    Notification(RawNotification),

    /// Non-fatal notice/warning from server.
    Notice(ErrorFields),

    /// Server parameter value changed.
    ParameterChanged {
        /// Parameter name
        name: String,
        /// New value
        value: String,
    },
}

/// Parse the asynchronous message held in `buffer_set`.
pub(crate) fn parse_async_message(buffer_set: &BufferSet) -> Result<AsyncMessage> {
    let payload = buffer_set.read_buffer.as_slice();
    match buffer_set.type_byte {
        msg_type::NOTICE_RESPONSE => Ok(AsyncMessage::Notice(NoticeResponse::parse(payload)?.0)),
        msg_type::PARAMETER_STATUS => {
            let param = ParameterStatus::parse(payload)?;
            Ok(AsyncMessage::ParameterChanged {
                name: param.name.to_string(),
                value: param.value.to_string(),
            })
        }
        msg_type::NOTIFICATION_RESPONSE => {
            let n = NotificationResponse::parse(payload)?;
            Ok(AsyncMessage::Notification(RawNotification {
                pid: n.pid,
                channel: n.channel.to_vec(),
                payload: n.payload.to_vec(),
            }))
        }
        other => Err(unexpected("async message", other)),
    }
}
