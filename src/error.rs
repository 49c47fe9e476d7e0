//! Error taxonomy shared by the scanner and the discovery engine.
//!
//! Only [`ConfigurationError`] is ever fatal. It is raised while options and
//! targets are being validated, before any socket is opened. Every
//! [`ProbeError`] is absorbed where it happens and turned into a
//! "not detected" verdict.
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Invalid input supplied by the caller.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The target string is not an IP address, hostname, range or CIDR.
    #[error("invalid target '{input}': {reason}")]
    InvalidTarget { input: String, reason: String },

    /// An IP range whose bounds cannot be parsed or are reversed.
    #[error("invalid IP range '{input}': {reason}")]
    InvalidRange { input: String, reason: String },

    /// IPv6 targets are not scanned.
    #[error("IPv6 address not supported: {0}")]
    Ipv6Unsupported(String),

    /// A hostname that resolved to no IPv4 address.
    #[error("failed to resolve hostname: {0}")]
    Unresolvable(String),

    /// A port or port range that cannot be parsed.
    #[error("invalid port specification: {0}")]
    InvalidPort(String),

    /// The discovery engine was asked to probe something it cannot address.
    #[error("invalid discovery endpoint {host}:{port}")]
    InvalidEndpoint { host: String, port: u16 },

    /// Two probes registered under the same protocol name in one layer.
    #[error("duplicate {layer} probe '{protocol}'")]
    DuplicateProbe { layer: &'static str, protocol: String },

    /// The configuration file exists but could not be read or parsed.
    #[error("configuration file {path}: {reason}")]
    ConfigFile { path: String, reason: String },
}

/// A failure inside a single probe.
///
/// Whatever the variant, the cascade records the probe as "not detected".
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The endpoint refused or did not accept the connection.
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed the stream.
    #[error("end of stream")]
    EndOfStream,

    /// A response was truncated or could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("tls: {0}")]
    Tls(String),
}

impl ProbeError {
    /// End-of-stream is the expected way for a foreign service to reject a
    /// probe, so it is not worth logging.
    pub const fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_of_stream_is_only_matched_by_its_variant() {
        assert!(ProbeError::EndOfStream.is_end_of_stream());
        assert!(!ProbeError::Timeout(Duration::from_millis(10)).is_end_of_stream());
        assert!(!ProbeError::Malformed("short".into()).is_end_of_stream());
    }

    #[test]
    fn configuration_errors_name_the_offending_input() {
        let err = ConfigurationError::InvalidRange {
            input: "10.0.0.5-10.0.0.abc".into(),
            reason: "bad end".into(),
        };
        assert!(err.to_string().contains("10.0.0.5-10.0.0.abc"));
    }
}
