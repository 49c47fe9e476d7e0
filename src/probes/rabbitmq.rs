//! AMQP 0-9-1. After the protocol header the broker speaks first with
//! `Connection.Start`, which lists its properties and the SASL mechanisms it
//! accepts. Only the `ANONYMOUS` mechanism lets a client in without
//! credentials.
use async_trait::async_trait;

use super::wire::{to_usize, Reader};
use crate::discovery::probe::{ApplicationDiscovery, ApplicationProbe, PresentationDiscovery};
use crate::error::ProbeError;
use crate::session::SessionHandle;

const PROTOCOL: &str = "rabbitmq";
const PROTOCOL_HEADER: &[u8] = b"AMQP\x00\x00\x09\x01";
const METHOD_FRAME: u8 = 1;
const FRAME_END: u8 = 0xce;
const CONNECTION_START: (u16, u16) = (10, 10);
const MAX_FRAME: usize = 128 * 1024;
const SERVER_PROPERTIES: [&str; 4] = ["product", "version", "platform", "cluster_name"];

fn frame_len(header: &[u8]) -> usize {
    if header.starts_with(b"AMQP") {
        PROTOCOL_HEADER.len()
    } else {
        let size = u32::from_be_bytes([header[3], header[4], header[5], header[6]]);
        to_usize(size).saturating_add(8)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ConnectionStart {
    version: (u8, u8),
    properties: Vec<(String, String)>,
    mechanisms: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Start(ConnectionStart),
    /// The broker answered with the protocol header it does support.
    Unsupported(String),
}

fn short_str(reader: &mut Reader<'_>) -> Result<String, ProbeError> {
    let len = reader.u8()?;
    Ok(String::from_utf8_lossy(reader.take(usize::from(len))?).into_owned())
}

fn skip_field(reader: &mut Reader<'_>, kind: u8) -> Result<(), ProbeError> {
    let width = match kind {
        b't' | b'b' | b'B' => 1,
        b's' | b'u' | b'U' => 2,
        b'I' | b'i' | b'f' => 4,
        b'D' => 5,
        b'l' | b'L' | b'd' | b'T' => 8,
        b'V' => 0,
        b'S' | b'F' | b'A' | b'x' => {
            reader.long_bytes()?;
            return Ok(());
        }
        other => {
            return Err(ProbeError::Malformed(format!(
                "unknown amqp field type {other:#04x}"
            )))
        }
    };
    reader.take(width)?;
    Ok(())
}

/// String valued entries of a field table. Everything else is skipped.
fn field_table(reader: &mut Reader<'_>) -> Result<Vec<(String, String)>, ProbeError> {
    let mut table = Reader::new(reader.long_bytes()?);
    let mut entries = Vec::new();
    while !table.is_empty() {
        let name = short_str(&mut table)?;
        match table.u8()? {
            b'S' => {
                let value = String::from_utf8_lossy(table.long_bytes()?).into_owned();
                entries.push((name, value));
            }
            kind => skip_field(&mut table, kind)?,
        }
    }
    Ok(entries)
}

fn decode(frame: &[u8]) -> Result<Reply, ProbeError> {
    if let Some(rest) = frame.strip_prefix(b"AMQP") {
        let version = rest
            .get(1..4)
            .ok_or_else(|| ProbeError::Malformed("short amqp protocol header".to_owned()))?;
        return Ok(Reply::Unsupported(format!(
            "{}-{}-{}",
            version[0], version[1], version[2]
        )));
    }

    let mut reader = Reader::new(frame);
    let kind = reader.u8()?;
    let _channel = reader.u16()?;
    let payload = reader.long_bytes()?;
    if kind != METHOD_FRAME || reader.u8()? != FRAME_END {
        return Err(ProbeError::Malformed("not an amqp method frame".to_owned()));
    }

    let mut method = Reader::new(payload);
    let id = (method.u16()?, method.u16()?);
    if id != CONNECTION_START {
        return Err(ProbeError::Malformed(format!("unexpected amqp method {id:?}")));
    }
    let version = (method.u8()?, method.u8()?);
    let properties = field_table(&mut method)?;
    let mechanisms = String::from_utf8_lossy(method.long_bytes()?)
        .split_whitespace()
        .map(str::to_owned)
        .collect();

    Ok(Reply::Start(ConnectionStart {
        version,
        properties,
        mechanisms,
    }))
}

#[derive(Debug, Clone, Default)]
pub struct RabbitmqProbe;

#[async_trait]
impl ApplicationProbe for RabbitmqProbe {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn discover(
        &self,
        session: &mut SessionHandle,
        _presentation: Option<&PresentationDiscovery>,
    ) -> Result<ApplicationDiscovery, ProbeError> {
        session.write_all(PROTOCOL_HEADER).await?;
        let frame = match session.read_message(7, MAX_FRAME, frame_len).await {
            Ok(frame) => frame,
            Err(ProbeError::Malformed(_)) => return Ok(ApplicationDiscovery::not_detected(PROTOCOL)),
            Err(e) => return Err(e),
        };

        let found = match decode(&frame) {
            Ok(Reply::Start(start)) => {
                let anonymous = start.mechanisms.iter().any(|m| m == "ANONYMOUS");
                let mut found = ApplicationDiscovery::detected(PROTOCOL, !anonymous)
                    .with_property(
                        "amqp_version",
                        format!("{}-{}", start.version.0, start.version.1),
                    )
                    .with_property("mechanisms", start.mechanisms);
                for (name, value) in start.properties {
                    if SERVER_PROPERTIES.contains(&name.as_str()) {
                        found = found.with_property(name, value);
                    }
                }
                found
            }
            Ok(Reply::Unsupported(version)) => ApplicationDiscovery::detected(PROTOCOL, true)
                .with_property("amqp_version", version),
            Err(_) => ApplicationDiscovery::not_detected(PROTOCOL),
        };
        Ok(found)
    }
}
