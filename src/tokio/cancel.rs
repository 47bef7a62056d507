//! Out-of-band cancellation of the running command.

use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::Result;
use crate::protocol::frontend::write_cancel_request;

use super::stream::{Endpoint, Stream};

/// Sends CancelRequest messages for one connection.
///
/// The request travels over a new connection carrying the backend key, so it
/// never waits for the connection's execution lock. Cancellation is best
/// effort: the server may finish the command before the request arrives.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    endpoint: Endpoint,
    pid: u32,
    secret: u32,
}

impl CancelHandle {
    pub(crate) fn new(endpoint: Endpoint, pid: u32, secret: u32) -> Self {
        Self {
            endpoint,
            pid,
            secret,
        }
    }

    /// Backend process id of the target connection.
    pub fn process_id(&self) -> u32 {
        self.pid
    }

    /// Ask the server to cancel whatever the connection is running.
    pub async fn cancel(&self) -> Result<()> {
        debug!(pid = self.pid, "sending cancel request");
        let mut stream = Stream::connect(&self.endpoint).await?;
        let mut buf = Vec::with_capacity(16);
        write_cancel_request(&mut buf, self.pid, self.secret);
        stream.write_all(&buf).await?;
        stream.flush().await?;

        // The server answers by closing the side channel
        let mut byte = [0u8; 1];
        let _ = match &mut stream {
            Stream::Tcp(r) => r.read(&mut byte).await,
            #[cfg(unix)]
            Stream::Unix(r) => r.read(&mut byte).await,
        };
        Ok(())
    }
}
