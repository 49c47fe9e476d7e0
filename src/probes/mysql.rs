//! MySQL and MariaDB announce themselves with a handshake packet as soon as
//! a client connects. Every account check happens after that, so a detected
//! server always requires authentication.
use async_trait::async_trait;

use crate::discovery::probe::{ApplicationDiscovery, ApplicationProbe, PresentationDiscovery};
use crate::error::ProbeError;
use crate::session::SessionHandle;

const PROTOCOL: &str = "mysql";
const HANDSHAKE_V10: u8 = 0x0a;
const ERROR_PACKET: u8 = 0xff;
const MAX_GREETING: usize = 16 * 1024;

/// Packet size from the 3-byte little-endian length and the sequence byte.
fn packet_len(header: &[u8]) -> usize {
    4 + (usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16)
}

#[derive(Debug, PartialEq, Eq)]
enum Greeting {
    Handshake {
        server_version: String,
        connection_id: u32,
    },
    /// The server refused this client before the handshake (host not allowed,
    /// too many connections).
    Refused { code: u16, message: String },
}

fn decode(packet: &[u8]) -> Result<Greeting, ProbeError> {
    if packet.len() < 5 {
        return Err(ProbeError::Malformed("short mysql packet".to_owned()));
    }

    let length = usize::from(packet[0]) | usize::from(packet[1]) << 8 | usize::from(packet[2]) << 16;
    let sequence = packet[3];
    let payload = &packet[4..];
    if sequence != 0 || length == 0 || length > payload.len() {
        return Err(ProbeError::Malformed("not a mysql greeting".to_owned()));
    }
    let payload = &payload[..length];

    match payload[0] {
        HANDSHAKE_V10 => {
            let rest = &payload[1..];
            let end = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| ProbeError::Malformed("unterminated server version".to_owned()))?;
            let version = &rest[..end];
            if version.is_empty() || !version.iter().all(|b| b.is_ascii_graphic()) {
                return Err(ProbeError::Malformed("server version is not text".to_owned()));
            }
            let id = rest
                .get(end + 1..end + 5)
                .ok_or_else(|| ProbeError::Malformed("missing connection id".to_owned()))?;

            Ok(Greeting::Handshake {
                server_version: String::from_utf8_lossy(version).into_owned(),
                connection_id: u32::from_le_bytes([id[0], id[1], id[2], id[3]]),
            })
        }
        ERROR_PACKET if payload.len() >= 3 => {
            let code = u16::from_le_bytes([payload[1], payload[2]]);
            let message = String::from_utf8_lossy(&payload[3..]).into_owned();
            Ok(Greeting::Refused { code, message })
        }
        other => Err(ProbeError::Malformed(format!(
            "unexpected mysql greeting type {other:#04x}"
        ))),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MysqlProbe;

#[async_trait]
impl ApplicationProbe for MysqlProbe {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn discover(
        &self,
        session: &mut SessionHandle,
        _presentation: Option<&PresentationDiscovery>,
    ) -> Result<ApplicationDiscovery, ProbeError> {
        let greeting = match session.read_message(4, MAX_GREETING, packet_len).await {
            Ok(greeting) => greeting,
            Err(ProbeError::Malformed(_)) => return Ok(ApplicationDiscovery::not_detected(PROTOCOL)),
            Err(e) => return Err(e),
        };

        let found = match decode(&greeting) {
            Ok(Greeting::Handshake {
                server_version,
                connection_id,
            }) => ApplicationDiscovery::detected(PROTOCOL, true)
                .with_property("protocol_version", HANDSHAKE_V10)
                .with_property("server_version", server_version)
                .with_property("connection_id", connection_id),
            Ok(Greeting::Refused { code, message }) => ApplicationDiscovery::detected(PROTOCOL, true)
                .with_property("error_code", code)
                .with_property("error", message),
            Err(_) => ApplicationDiscovery::not_detected(PROTOCOL),
        };
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::{decode, Greeting, MysqlProbe};
    use crate::discovery::probe::{ApplicationProbe, Detection};
    use crate::session::SessionHandle;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn packet(payload: &[u8]) -> Vec<u8> {
        let len = payload.len();
        let mut packet = vec![len as u8, (len >> 8) as u8, (len >> 16) as u8, 0];
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn handshake_is_decoded() {
        let mut payload = vec![0x0a];
        payload.extend_from_slice(b"8.0.36\0");
        payload.extend_from_slice(&42u32.to_le_bytes());
        payload.extend_from_slice(b"salt1234\0");

        assert_eq!(
            decode(&packet(&payload)).unwrap(),
            Greeting::Handshake {
                server_version: "8.0.36".to_owned(),
                connection_id: 42
            }
        );
    }

    #[tokio::test]
    async fn greeting_split_across_reads_is_detected() {
        let mut payload = vec![0x0a];
        payload.extend_from_slice(b"10.11.6-MariaDB\0");
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.extend_from_slice(b"saltsalt\0");
        let greeting = packet(&payload);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (head, tail) = greeting.split_at(9);
            socket.write_all(head).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            socket.write_all(tail).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut session = SessionHandle::plain("127.0.0.1", port);
        let found = MysqlProbe.discover(&mut session, None).await.unwrap();

        assert!(found.is_detected());
        assert!(found.is_auth_required());
        assert_eq!(found.into_properties()["server_version"], "10.11.6-MariaDB");
    }

    #[test]
    fn refusal_is_still_mysql() {
        let mut payload = vec![0xff];
        payload.extend_from_slice(&1130u16.to_le_bytes());
        payload.extend_from_slice(b"Host '10.0.0.9' is not allowed to connect");

        match decode(&packet(&payload)).unwrap() {
            Greeting::Refused { code, message } => {
                assert_eq!(code, 1130);
                assert!(message.contains("not allowed"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn other_services_are_rejected() {
        assert!(decode(b"SSH-2.0-OpenSSH_9.6\r\n").is_err());
        assert!(decode(b"+PONG\r\n").is_err());
        assert!(decode(b"\x01").is_err());
    }
}
