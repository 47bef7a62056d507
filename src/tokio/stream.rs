//! Async stream abstraction for tokio.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;

/// Where a server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(String),
}

impl Endpoint {
    pub(crate) fn from_opts(opts: &Opts) -> Result<Self> {
        if let Some(socket) = &opts.socket {
            return Ok(Endpoint::Unix(socket.clone()));
        }
        if opts.host.is_empty() {
            return Err(Error::InvalidUsage("host is empty".into()));
        }
        Ok(Endpoint::Tcp {
            host: opts.host.clone(),
            port: opts.port,
        })
    }
}

pub(crate) enum Stream {
    Tcp(BufReader<TcpStream>),
    #[cfg(unix)]
    Unix(BufReader<UnixStream>),
}

impl Stream {
    pub(crate) async fn connect(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let tcp = TcpStream::connect((host.as_str(), *port)).await?;
                tcp.set_nodelay(true)?;
                Ok(Self::Tcp(BufReader::new(tcp)))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Self::Unix(BufReader::new(UnixStream::connect(path).await?))),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(Error::Unsupported(
                "Unix sockets are not available on this platform".into(),
            )),
        }
    }

    /// Move up to `limit` buffered bytes into `out`, reading from the socket
    /// if nothing is buffered.
    ///
    /// Cancel safe: bytes leave the reader only once they are in `out`.
    async fn read_into(&mut self, out: &mut Vec<u8>, limit: usize) -> std::io::Result<()> {
        let taken = match self {
            Stream::Tcp(r) => {
                let buf = r.fill_buf().await?;
                let n = buf.len().min(limit);
                out.extend_from_slice(&buf[..n]);
                r.consume(n);
                n
            }
            #[cfg(unix)]
            Stream::Unix(r) => {
                let buf = r.fill_buf().await?;
                let n = buf.len().min(limit);
                out.extend_from_slice(&buf[..n]);
                r.consume(n);
                n
            }
        };
        if taken == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    /// Wait until at least one byte can be read without consuming it.
    ///
    /// Cancel safe: dropping the future leaves the stream untouched.
    pub(crate) async fn readable(&mut self) -> std::io::Result<()> {
        let available = match self {
            Stream::Tcp(r) => r.fill_buf().await?.len(),
            #[cfg(unix)]
            Stream::Unix(r) => r.fill_buf().await?.len(),
        };
        if available == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().write_all(buf).await,
            #[cfg(unix)]
            Stream::Unix(r) => r.get_mut().write_all(buf).await,
        }
    }

    pub(crate) async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().flush().await,
            #[cfg(unix)]
            Stream::Unix(r) => r.get_mut().flush().await,
        }
    }

    pub(crate) async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().shutdown().await,
            #[cfg(unix)]
            Stream::Unix(r) => r.get_mut().shutdown().await,
        }
    }

    /// Read one backend message into `buffer_set`.
    ///
    /// Cancel safe: a message cut short by dropping the future is kept in
    /// `buffer_set` and completed by the next call.
    pub(crate) async fn read_message(&mut self, buffer_set: &mut BufferSet) -> Result<()> {
        loop {
            let wanted = match frame_length(&buffer_set.partial)? {
                None => 5 - buffer_set.partial.len(),
                Some(total) if buffer_set.partial.len() >= total => break,
                Some(total) => total - buffer_set.partial.len(),
            };
            self.read_into(&mut buffer_set.partial, wanted).await?;
        }

        buffer_set.type_byte = buffer_set.partial[0];
        buffer_set.read_buffer.clear();
        buffer_set.read_buffer.extend_from_slice(&buffer_set.partial[5..]);
        buffer_set.partial.clear();
        Ok(())
    }
}

/// Total size of the message starting `buf`, once its header is complete.
fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    let Some(header) = buf.get(..5) else {
        return Ok(None);
    };
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if length < 4 {
        return Err(Error::Protocol(format!(
            "Invalid message length: {}",
            length
        )));
    }
    Ok(Some(1 + length as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_length_waits_for_header() {
        assert_eq!(frame_length(&[b'Z', 0, 0]).unwrap(), None);
        assert_eq!(frame_length(&[b'Z', 0, 0, 0, 5, b'I']).unwrap(), Some(6));
    }

    #[test]
    fn frame_length_rejects_short_length() {
        assert!(matches!(frame_length(&[b'Z', 0, 0, 0, 3]), Err(Error::Protocol(_))));
    }
}
