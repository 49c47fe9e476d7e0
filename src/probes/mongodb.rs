//! MongoDB over `OP_MSG`. `isMaster` is answered before authentication, so it
//! identifies the server; `serverStatus` is only answered to a client that
//! is allowed to run commands.
use async_trait::async_trait;
use serde_json::Value;

use super::wire::{length_u32, to_usize, Reader};
use crate::discovery::probe::{
    ApplicationDiscovery, ApplicationProbe, PresentationDiscovery, Properties,
};
use crate::error::ProbeError;
use crate::session::SessionHandle;

const PROTOCOL: &str = "mongodb";
const OP_MSG: i32 = 2013;
const MAX_REPLY: usize = 4 * 1024 * 1024;
const UNAUTHORIZED: i64 = 13;

#[derive(Debug, Clone, Copy)]
enum Bson<'a> {
    Int(i32),
    Str(&'a str),
}

fn document(fields: &[(&str, Bson<'_>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        let kind = match value {
            Bson::Int(_) => 0x10,
            Bson::Str(_) => 0x02,
        };
        body.push(kind);
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        match value {
            Bson::Int(n) => body.extend_from_slice(&n.to_le_bytes()),
            Bson::Str(s) => {
                body.extend_from_slice(&length_u32(s.len() + 1).to_le_bytes());
                body.extend_from_slice(s.as_bytes());
                body.push(0);
            }
        }
    }
    body.push(0);

    let mut doc = length_u32(body.len() + 4).to_le_bytes().to_vec();
    doc.extend(body);
    doc
}

/// Header, zero flag bits and a single body section.
fn op_msg(request_id: i32, response_to: i32, body: &[u8]) -> Vec<u8> {
    let total = 16 + 4 + 1 + body.len();
    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(&length_u32(total).to_le_bytes());
    msg.extend_from_slice(&request_id.to_le_bytes());
    msg.extend_from_slice(&response_to.to_le_bytes());
    msg.extend_from_slice(&OP_MSG.to_le_bytes());
    msg.extend_from_slice(&0u32.to_le_bytes());
    msg.push(0);
    msg.extend_from_slice(body);
    msg
}

fn message_len(header: &[u8]) -> usize {
    to_usize(u32::from_le_bytes([header[0], header[1], header[2], header[3]]))
}

fn length_of(len: i32, already_read: usize) -> Result<usize, ProbeError> {
    usize::try_from(len)
        .ok()
        .and_then(|len| len.checked_sub(already_read))
        .ok_or_else(|| ProbeError::Malformed(format!("bad bson length {len}")))
}

/// Top level scalar fields of a BSON document. Nested documents, arrays and
/// binary values are skipped.
fn read_document(reader: &mut Reader<'_>) -> Result<Properties, ProbeError> {
    let len = reader.i32_le()?;
    let mut doc = Reader::new(reader.take(length_of(len, 4)?)?);
    let mut fields = Properties::new();

    loop {
        let kind = doc.u8()?;
        if kind == 0 {
            break;
        }
        let name = doc.cstring()?;
        let value = match kind {
            0x01 => Value::from(doc.f64_le()?),
            0x02 => {
                let len = doc.i32_le()?;
                let text = doc.take(length_of(len, 0)?)?;
                let text = text.strip_suffix(b"\0").unwrap_or(text);
                Value::from(String::from_utf8_lossy(text).into_owned())
            }
            0x08 => Value::from(doc.u8()? != 0),
            0x10 => Value::from(doc.i32_le()?),
            0x12 => Value::from(doc.i64_le()?),
            0x0a => Value::Null,
            0x03 | 0x04 => {
                let len = doc.i32_le()?;
                doc.take(length_of(len, 4)?)?;
                continue;
            }
            0x05 => {
                let len = doc.i32_le()?;
                doc.take(length_of(len, 0)?.saturating_add(1))?;
                continue;
            }
            0x07 => {
                doc.take(12)?;
                continue;
            }
            0x09 | 0x11 => {
                doc.take(8)?;
                continue;
            }
            0x13 => {
                doc.take(16)?;
                continue;
            }
            0x7f | 0xff => continue,
            other => {
                return Err(ProbeError::Malformed(format!(
                    "unsupported bson type {other:#04x} in '{name}'"
                )))
            }
        };
        fields.insert(name, value);
    }
    Ok(fields)
}

/// Checks that `reply` answers `request_id` and returns its body document.
fn decode_reply(request_id: i32, reply: &[u8]) -> Result<Properties, ProbeError> {
    let mut reader = Reader::new(reply);
    let _length = reader.i32_le()?;
    let _own_id = reader.i32_le()?;
    let response_to = reader.i32_le()?;
    let opcode = reader.i32_le()?;
    if opcode != OP_MSG || response_to != request_id {
        return Err(ProbeError::Malformed(format!(
            "opcode {opcode} answering {response_to} is not a reply to {request_id}"
        )));
    }

    let _flags = reader.i32_le()?;
    match reader.u8()? {
        0 => read_document(&mut reader),
        kind => Err(ProbeError::Malformed(format!("unexpected section kind {kind}"))),
    }
}

fn is_ok(reply: &Properties) -> bool {
    reply.get("ok").and_then(Value::as_f64).is_some_and(|ok| ok >= 1.0)
}

fn is_handshake(reply: &Properties) -> bool {
    ["ismaster", "isWritablePrimary", "maxWireVersion"]
        .iter()
        .any(|key| reply.contains_key(*key))
}

fn is_unauthorized(reply: &Properties) -> bool {
    reply.get("code").and_then(Value::as_i64) == Some(UNAUTHORIZED)
        || reply
            .get("errmsg")
            .and_then(Value::as_str)
            .is_some_and(|msg| msg.contains("auth"))
}

async fn command(
    session: &mut SessionHandle,
    request_id: i32,
    fields: &[(&str, Bson<'_>)],
) -> Result<Properties, ProbeError> {
    session
        .write_all(&op_msg(request_id, 0, &document(fields)))
        .await?;
    let reply = session.read_message(4, MAX_REPLY, message_len).await?;
    decode_reply(request_id, &reply)
}

#[derive(Debug, Clone, Default)]
pub struct MongodbProbe;

#[async_trait]
impl ApplicationProbe for MongodbProbe {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn discover(
        &self,
        session: &mut SessionHandle,
        _presentation: Option<&PresentationDiscovery>,
    ) -> Result<ApplicationDiscovery, ProbeError> {
        let admin = ("$db", Bson::Str("admin"));
        let hello = match command(session, 1, &[("isMaster", Bson::Int(1)), admin]).await {
            Ok(reply) if is_handshake(&reply) => reply,
            Ok(_) | Err(ProbeError::Malformed(_)) => {
                return Ok(ApplicationDiscovery::not_detected(PROTOCOL))
            }
            Err(e) => return Err(e),
        };

        let status = command(
            session,
            2,
            &[
                ("serverStatus", Bson::Int(1)),
                ("recordStats", Bson::Int(0)),
                admin,
            ],
        )
        .await
        .unwrap_or_default();

        let open = is_ok(&status);
        let mut found = ApplicationDiscovery::detected(PROTOCOL, !open);
        for (from, to) in [("maxWireVersion", "max_wire_version"), ("setName", "set_name")] {
            if let Some(value) = hello.get(from) {
                found = found.with_property(to, value.clone());
            }
        }
        if open {
            for key in ["version", "host"] {
                if let Some(value) = status.get(key) {
                    found = found.with_property(key, value.clone());
                }
            }
        } else if is_unauthorized(&status) {
            found = found.with_property("error", "unauthorized");
        }
        Ok(found)
    }
}
