//! PostgreSQL: send a startup message for user `postgres` and look at the
//! first backend message.
use async_trait::async_trait;

use crate::discovery::probe::{ApplicationDiscovery, ApplicationProbe, PresentationDiscovery};
use crate::error::ProbeError;
use crate::session::SessionHandle;

const PROTOCOL: &str = "postgresql";
const PROTOCOL_VERSION_3: u32 = 196_608;

fn startup_message(user: &str, database: &str) -> Vec<u8> {
    let mut body = PROTOCOL_VERSION_3.to_be_bytes().to_vec();
    for (key, value) in [("user", user), ("database", database)] {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);

    let length = u32::try_from(body.len() + 4).unwrap_or(u32::MAX);
    let mut message = length.to_be_bytes().to_vec();
    message.extend(body);
    message
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    /// `AuthenticationOk`: the server let us in without a password.
    Trusted,
    /// Any other authentication request, named after its method.
    Challenge(&'static str),
    /// An `ErrorResponse`, with its message field.
    Error(String),
}

const fn auth_method(code: u32) -> &'static str {
    match code {
        2 => "kerberos",
        3 => "cleartext",
        5 => "md5",
        7 => "gss",
        9 => "sspi",
        10 => "sasl",
        _ => "unknown",
    }
}

fn decode(reply: &[u8]) -> Result<Reply, ProbeError> {
    let (&tag, rest) = reply
        .split_first()
        .ok_or_else(|| ProbeError::Malformed("empty postgres reply".to_owned()))?;
    let header = rest
        .get(..4)
        .ok_or_else(|| ProbeError::Malformed("short postgres reply".to_owned()))?;
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if !(4..=65_536).contains(&length) {
        return Err(ProbeError::Malformed(format!("implausible length {length}")));
    }

    match tag {
        b'R' => {
            let code = rest
                .get(4..8)
                .ok_or_else(|| ProbeError::Malformed("short authentication request".to_owned()))?;
            match u32::from_be_bytes([code[0], code[1], code[2], code[3]]) {
                0 => Ok(Reply::Trusted),
                other => Ok(Reply::Challenge(auth_method(other))),
            }
        }
        b'E' => {
            // Fields are `type byte, cstring` pairs; 'M' carries the message.
            let fields = rest.get(4..).unwrap_or_default();
            let message = fields
                .split(|&b| b == 0)
                .find_map(|field| field.strip_prefix(b"M"))
                .map(|m| String::from_utf8_lossy(m).into_owned())
                .unwrap_or_default();
            Ok(Reply::Error(message))
        }
        other => Err(ProbeError::Malformed(format!(
            "unexpected postgres message type {other:#04x}"
        ))),
    }
}

#[derive(Debug, Clone, Default)]
pub struct PostgresProbe;

#[async_trait]
impl ApplicationProbe for PostgresProbe {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn discover(
        &self,
        session: &mut SessionHandle,
        _presentation: Option<&PresentationDiscovery>,
    ) -> Result<ApplicationDiscovery, ProbeError> {
        session
            .write_all(&startup_message("postgres", "postgres"))
            .await?;

        let mut buf = [0u8; 1024];
        let read = session.read_frame(&mut buf).await?;

        let found = match decode(&buf[..read]) {
            Ok(Reply::Trusted) => ApplicationDiscovery::detected(PROTOCOL, false)
                .with_property("auth_method", "trust"),
            Ok(Reply::Challenge(method)) => ApplicationDiscovery::detected(PROTOCOL, true)
                .with_property("auth_method", method),
            Ok(Reply::Error(message)) => {
                ApplicationDiscovery::detected(PROTOCOL, true).with_property("error", message)
            }
            Err(_) => ApplicationDiscovery::not_detected(PROTOCOL),
        };
        Ok(found)
    }
}
