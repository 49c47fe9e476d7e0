//! Scoped, lazily connected transports shared by the discovery phases.
//!
//! A [`SessionHandle`] knows where to connect and how (plain TCP or TLS over
//! TCP). It opens its socket on first use and closes it exactly once, either
//! through [`SessionHandle::destroy`] or when the handle is dropped.
pub mod tls;

use std::fmt;
use std::time::Duration;

use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::ProbeError;

/// Default bound on a single connect, read or write.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(3);

/// Byte stream a handle talks over.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransport {
    Plain,
    Tls,
}

pub struct SessionHandle {
    host: String,
    port: u16,
    transport: SessionTransport,
    io_timeout: Duration,
    stream: Option<Box<dyn Connection>>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("transport", &self.transport)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

impl SessionHandle {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self::new(host.into(), port, SessionTransport::Plain)
    }

    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self::new(host.into(), port, SessionTransport::Tls)
    }

    const fn new(host: String, port: u16, transport: SessionTransport) -> Self {
        Self {
            host,
            port,
            transport,
            io_timeout: DEFAULT_IO_TIMEOUT,
            stream: None,
        }
    }

    #[must_use]
    pub const fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub const fn transport(&self) -> SessionTransport {
        self.transport
    }

    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// An unconnected handle to the same endpoint over the same transport.
    /// Each probe of a phase gets its own, so no socket is ever shared.
    pub fn detached(&self) -> Self {
        Self::new(self.host.clone(), self.port, self.transport).with_io_timeout(self.io_timeout)
    }

    /// Opens the underlying connection. Does nothing when already connected.
    pub async fn connect(&mut self) -> Result<(), ProbeError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.host, self.port);
        let tcp = match timeout(
            self.io_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ProbeError::Connect { addr, source }),
            Err(_) => return Err(ProbeError::Timeout(self.io_timeout)),
        };

        let stream: Box<dyn Connection> = match self.transport {
            SessionTransport::Plain => Box::new(tcp),
            SessionTransport::Tls => {
                let tls = timeout(self.io_timeout, tls::handshake(tcp, &self.host))
                    .await
                    .map_err(|_| ProbeError::Timeout(self.io_timeout))??;
                Box::new(tls)
            }
        };

        trace!("session to {addr} opened ({:?})", self.transport);
        self.stream = Some(stream);
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut Box<dyn Connection>, ProbeError> {
        self.stream
            .as_mut()
            .ok_or_else(|| ProbeError::Malformed("session is not connected".to_owned()))
    }

    /// Reads whatever is available. Returns 0 when the peer closed the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProbeError> {
        self.connect().await?;
        let io_timeout = self.io_timeout;
        let stream = self.stream()?;
        timeout(io_timeout, stream.read(buf))
            .await
            .map_err(|_| ProbeError::Timeout(io_timeout))?
            .map_err(ProbeError::from)
    }

    /// Like [`read`](Self::read), but a closed stream is an error.
    pub async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize, ProbeError> {
        match self.read(buf).await? {
            0 => Err(ProbeError::EndOfStream),
            n => Ok(n),
        }
    }

    /// Reads until the peer closes the stream or `limit` bytes arrived.
    /// A timeout after some bytes were received returns what was read.
    pub async fn read_to_limit(&mut self, limit: usize) -> Result<Vec<u8>, ProbeError> {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];

        while data.len() < limit {
            match self.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(ProbeError::Timeout(_)) if !data.is_empty() => break,
                Err(e) => return Err(e),
            }
        }

        data.truncate(limit);
        Ok(data)
    }

    /// Reads one length-prefixed message. Once `header` bytes are in,
    /// `total_len` turns them into the size of the whole message, header
    /// included. A message claiming more than `limit` bytes is rejected
    /// before its body is read.
    pub async fn read_message<F>(
        &mut self,
        header: usize,
        limit: usize,
        total_len: F,
    ) -> Result<Vec<u8>, ProbeError>
    where
        F: Fn(&[u8]) -> usize,
    {
        let mut data = Vec::with_capacity(header);
        let mut buf = [0u8; 4096];
        let mut wanted = header;
        let mut sized = false;

        while data.len() < wanted {
            let chunk = (wanted - data.len()).min(buf.len());
            let read = self.read_frame(&mut buf[..chunk]).await?;
            data.extend_from_slice(&buf[..read]);

            if !sized && data.len() >= header {
                sized = true;
                wanted = total_len(&data[..header]).max(header);
                if wanted > limit {
                    return Err(ProbeError::Malformed(format!(
                        "message of {wanted} bytes exceeds the {limit} byte limit"
                    )));
                }
            }
        }

        Ok(data)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ProbeError> {
        self.connect().await?;
        let io_timeout = self.io_timeout;
        let stream = self.stream()?;
        timeout(io_timeout, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| ProbeError::Timeout(io_timeout))?
        .map_err(ProbeError::from)
    }

    /// Closes the connection. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.stream.take().is_some() {
            trace!("session to {}:{} closed", self.host, self.port);
        }
    }
}
