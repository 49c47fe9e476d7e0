//! Cassandra native protocol v4. `OPTIONS` needs no session and is answered
//! with `SUPPORTED`; the reply to `STARTUP` says whether an authenticator is
//! configured.
use async_trait::async_trait;

use super::wire::{length_u16, length_u32, to_usize, Reader};
use crate::discovery::probe::{ApplicationDiscovery, ApplicationProbe, PresentationDiscovery};
use crate::error::ProbeError;
use crate::session::SessionHandle;

const PROTOCOL: &str = "cassandra";
const VERSION: u8 = 0x04;
const RESPONSE: u8 = 0x80;
const HEADER_LEN: usize = 9;
const MAX_FRAME: usize = 256 * 1024;

const ERROR: u8 = 0x00;
const STARTUP: u8 = 0x01;
const READY: u8 = 0x02;
const AUTHENTICATE: u8 = 0x03;
const OPTIONS: u8 = 0x05;
const SUPPORTED: u8 = 0x06;

fn frame(stream: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![VERSION, 0];
    out.extend_from_slice(&stream.to_be_bytes());
    out.push(opcode);
    out.extend_from_slice(&length_u32(body.len()).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn string_map(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut out = length_u16(entries.len()).to_be_bytes().to_vec();
    for text in entries.iter().flat_map(|(k, v)| [k, v]) {
        out.extend_from_slice(&length_u16(text.len()).to_be_bytes());
        out.extend_from_slice(text.as_bytes());
    }
    out
}

fn frame_len(header: &[u8]) -> usize {
    to_usize(u32::from_be_bytes([header[5], header[6], header[7], header[8]]))
        .saturating_add(HEADER_LEN)
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Error { code: i32, message: String },
    Ready,
    Authenticate(String),
    Supported(Vec<(String, Vec<String>)>),
}

fn decode(stream: i16, frame: &[u8]) -> Result<Reply, ProbeError> {
    let mut reader = Reader::new(frame);
    let version = reader.u8()?;
    let _flags = reader.u8()?;
    let reply_stream = reader.i16()?;
    let opcode = reader.u8()?;
    let mut body = Reader::new(reader.long_bytes()?);

    if version & RESPONSE == 0 || !(3..=6).contains(&(version & !RESPONSE)) {
        return Err(ProbeError::Malformed(format!("not a cql response version {version:#04x}")));
    }
    if reply_stream != stream {
        return Err(ProbeError::Malformed(format!("reply on stream {reply_stream}")));
    }

    match opcode {
        ERROR => Ok(Reply::Error {
            code: body.i32()?,
            message: body.short_string()?,
        }),
        READY => Ok(Reply::Ready),
        AUTHENTICATE => Ok(Reply::Authenticate(body.short_string()?)),
        SUPPORTED => {
            let mut options = Vec::new();
            for _ in 0..body.u16()? {
                let key = body.short_string()?;
                let values: Vec<String> = (0..body.u16()?)
                    .map(|_| body.short_string())
                    .collect::<Result<_, _>>()?;
                options.push((key, values));
            }
            Ok(Reply::Supported(options))
        }
        other => Err(ProbeError::Malformed(format!("unexpected cql opcode {other:#04x}"))),
    }
}

async fn exchange(
    session: &mut SessionHandle,
    stream: i16,
    opcode: u8,
    body: &[u8],
) -> Result<Reply, ProbeError> {
    session.write_all(&frame(stream, opcode, body)).await?;
    let reply = session.read_message(HEADER_LEN, MAX_FRAME, frame_len).await?;
    decode(stream, &reply)
}

#[derive(Debug, Clone, Default)]
pub struct CassandraProbe;

#[async_trait]
impl ApplicationProbe for CassandraProbe {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn discover(
        &self,
        session: &mut SessionHandle,
        _presentation: Option<&PresentationDiscovery>,
    ) -> Result<ApplicationDiscovery, ProbeError> {
        let options = match exchange(session, 1, OPTIONS, &[]).await {
            Ok(Reply::Supported(options)) => options,
            Ok(Reply::Error { code, message }) => {
                return Ok(ApplicationDiscovery::detected(PROTOCOL, true)
                    .with_property("error_code", code)
                    .with_property("error", message))
            }
            Ok(_) | Err(ProbeError::Malformed(_)) => {
                return Ok(ApplicationDiscovery::not_detected(PROTOCOL))
            }
            Err(e) => return Err(e),
        };

        let startup = string_map(&[("CQL_VERSION", "3.0.0")]);
        let (auth_required, authenticator) = match exchange(session, 2, STARTUP, &startup).await {
            Ok(Reply::Ready) => (false, Some("none".to_owned())),
            Ok(Reply::Authenticate(authenticator)) => (true, Some(authenticator)),
            _ => (true, None),
        };

        let mut found = ApplicationDiscovery::detected(PROTOCOL, auth_required);
        for (key, values) in options {
            if matches!(key.as_str(), "CQL_VERSION" | "PROTOCOL_VERSIONS" | "COMPRESSION") {
                found = found.with_property(key.to_lowercase(), values);
            }
        }
        if let Some(authenticator) = authenticator {
            found = found.with_property("authenticator", authenticator);
        }
        Ok(found)
    }
}
