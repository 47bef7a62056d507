//! Stream of LISTEN/NOTIFY notifications.

use std::collections::VecDeque;

use futures::Stream;
use futures::stream;
use tracing::trace;

use crate::error::Result;
use crate::notify::Notify;
use crate::state::{AsyncMessage, NotifyStateMachine};

use super::Conn;

impl Conn {
    /// Notifications received by the session, as an endless stream.
    ///
    /// Notifications that arrived while other commands ran are yielded
    /// first; otherwise the stream waits on the connection for new ones.
    /// Other operations queue behind a waiting stream, so use a dedicated
    /// connection for listening. Dropping the stream stops listening; the
    /// connection stays usable. The stream ends after yielding an error.
    pub fn notifies(&self) -> impl Stream<Item = Result<Notify>> + '_ {
        stream::unfold(
            (self, VecDeque::new(), false),
            |(conn, mut batch, done)| async move {
                if done {
                    return None;
                }
                if let Some(notify) = batch.pop_front() {
                    return Some((Ok(notify), (conn, batch, false)));
                }
                match conn.next_notifies().await {
                    Ok(mut fresh) => {
                        let first = fresh.pop_front()?;
                        Some((Ok(first), (conn, fresh, false)))
                    }
                    Err(e) => Some((Err(e), (conn, batch, true))),
                }
            },
        )
    }

    /// Wait for at least one notification and return all available ones.
    async fn next_notifies(&self) -> Result<VecDeque<Notify>> {
        let mut inner = self.lock().await?;

        if inner.pending_notifies.is_empty() {
            let mut state_machine = NotifyStateMachine::new(inner.transaction_status);
            inner.drive_idle(&mut state_machine).await?;
            if let Some(raw) = state_machine.take_notification() {
                if let Some(handler) = &mut inner.async_message_handler {
                    handler.handle(&AsyncMessage::Notification(raw.clone()));
                }
                inner.pending_notifies.push_back(raw);
            }
        }

        let encoding = inner.encoding;
        let batch = inner
            .pending_notifies
            .drain(..)
            .map(|raw| Notify::decode(&raw, encoding))
            .collect::<Result<VecDeque<_>>>()?;
        trace!(count = batch.len(), "notifications received");
        Ok(batch)
    }
}
