//! Callbacks for asynchronous server messages.

use crate::state::AsyncMessage;

/// Receives notifications, notices and parameter changes as they arrive.
///
/// Called from inside the connection's execution lock; the handler must not
/// call back into the same connection.
pub trait AsyncMessageHandler: Send {
    fn handle(&mut self, msg: &AsyncMessage);
}

impl<F> AsyncMessageHandler for F
where
    F: FnMut(&AsyncMessage) + Send,
{
    fn handle(&mut self, msg: &AsyncMessage) {
        self(msg)
    }
}
