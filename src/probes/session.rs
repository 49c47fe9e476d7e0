//! Session layer probes: TLS and plain TCP.
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::discovery::probe::{SessionDiscovery, SessionProbe};
use crate::error::ProbeError;
use crate::session::{tls, SessionHandle};

async fn dial(host: &str, port: u16, wait: Duration) -> Result<TcpStream, ProbeError> {
    match timeout(wait, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProbeError::Connect {
            addr: format!("{host}:{port}"),
            source,
        }),
        Err(_) => Err(ProbeError::Timeout(wait)),
    }
}

/// Detects a TLS server by completing a handshake. Certificates are not
/// checked.
#[derive(Debug, Clone)]
pub struct TlsSessionProbe {
    timeout: Duration,
}

impl TlsSessionProbe {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SessionProbe for TlsSessionProbe {
    fn protocol(&self) -> &str {
        "tls"
    }

    async fn session_layer_discover(
        &self,
        host: &str,
        port: u16,
    ) -> Result<SessionDiscovery, ProbeError> {
        let stream = dial(host, port, self.timeout).await?;

        let stream = match timeout(self.timeout, tls::handshake(stream, host)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("no TLS on {host}:{port}: {e}");
                return Ok(SessionDiscovery::not_detected(self.protocol()));
            }
            Err(_) => return Ok(SessionDiscovery::not_detected(self.protocol())),
        };

        let (version, cipher) = tls::negotiated(&stream);
        let handle = SessionHandle::tls(host, port).with_io_timeout(self.timeout);
        let mut found = SessionDiscovery::detected(self.protocol(), handle);
        if let Some(version) = version {
            found = found.with_property("tls_version", version);
        }
        if let Some(cipher) = cipher {
            found = found.with_property("cipher_suite", cipher);
        }
        Ok(found)
    }
}

/// Any endpoint accepting a TCP connection has a plain TCP session.
#[derive(Debug, Clone)]
pub struct TcpSessionProbe {
    timeout: Duration,
}

impl TcpSessionProbe {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SessionProbe for TcpSessionProbe {
    fn protocol(&self) -> &str {
        "tcp"
    }

    async fn session_layer_discover(
        &self,
        host: &str,
        port: u16,
    ) -> Result<SessionDiscovery, ProbeError> {
        drop(dial(host, port, self.timeout).await?);
        let handle = SessionHandle::plain(host, port).with_io_timeout(self.timeout);
        Ok(SessionDiscovery::detected(self.protocol(), handle))
    }
}
