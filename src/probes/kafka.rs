//! Kafka brokers answer `ApiVersions` even on SASL listeners, so it
//! identifies the broker. A `Metadata` request is only served once the
//! client is authenticated; a SASL listener drops the connection instead.
use async_trait::async_trait;

use super::wire::{length_u16, length_u32, to_usize, Reader};
use crate::discovery::probe::{ApplicationDiscovery, ApplicationProbe, PresentationDiscovery};
use crate::error::ProbeError;
use crate::session::SessionHandle;

const PROTOCOL: &str = "kafka";
const CLIENT_ID: &str = "layerscan";
const API_VERSIONS: i16 = 18;
const METADATA: i16 = 3;
const SASL_HANDSHAKE: i16 = 17;
const UNSUPPORTED_VERSION: i16 = 35;
const MAX_API_KEYS: i32 = 1024;
const MAX_RESPONSE: usize = 64 * 1024;

fn request(api_key: i16, correlation_id: i32, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(&api_key.to_be_bytes());
    message.extend_from_slice(&0i16.to_be_bytes());
    message.extend_from_slice(&correlation_id.to_be_bytes());
    message.extend_from_slice(&length_u16(CLIENT_ID.len()).to_be_bytes());
    message.extend_from_slice(CLIENT_ID.as_bytes());
    message.extend_from_slice(body);

    let mut framed = length_u32(message.len()).to_be_bytes().to_vec();
    framed.extend(message);
    framed
}

fn response_len(header: &[u8]) -> usize {
    to_usize(u32::from_be_bytes([header[0], header[1], header[2], header[3]])).saturating_add(4)
}

#[derive(Debug, PartialEq, Eq)]
struct ApiVersions {
    error_code: i16,
    api_keys: Vec<i16>,
}

fn decode_api_versions(correlation_id: i32, response: &[u8]) -> Result<ApiVersions, ProbeError> {
    let mut reader = Reader::new(response);
    let _size = reader.u32()?;
    if reader.i32()? != correlation_id {
        return Err(ProbeError::Malformed("correlation id mismatch".to_owned()));
    }

    let error_code = reader.i16()?;
    if error_code != 0 && error_code != UNSUPPORTED_VERSION {
        return Err(ProbeError::Malformed(format!("unexpected error code {error_code}")));
    }
    let count = reader.i32()?;
    if !(0..=MAX_API_KEYS).contains(&count) {
        return Err(ProbeError::Malformed(format!("implausible api count {count}")));
    }

    let mut api_keys = Vec::new();
    for _ in 0..count {
        let key = reader.i16()?;
        let min = reader.i16()?;
        let max = reader.i16()?;
        if min > max {
            return Err(ProbeError::Malformed(format!("api {key} has versions {min}..{max}")));
        }
        api_keys.push(key);
    }
    Ok(ApiVersions {
        error_code,
        api_keys,
    })
}

/// Whether the broker answers a metadata request for no topics.
async fn serves_metadata(session: &mut SessionHandle) -> bool {
    let correlation_id = 2;
    if session
        .write_all(&request(METADATA, correlation_id, &0i32.to_be_bytes()))
        .await
        .is_err()
    {
        return false;
    }
    match session.read_message(8, 8, |_| 8).await {
        Ok(header) => Reader::new(&header[4..]).i32().ok() == Some(correlation_id),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct KafkaProbe;

#[async_trait]
impl ApplicationProbe for KafkaProbe {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn discover(
        &self,
        session: &mut SessionHandle,
        _presentation: Option<&PresentationDiscovery>,
    ) -> Result<ApplicationDiscovery, ProbeError> {
        session.write_all(&request(API_VERSIONS, 1, &[])).await?;
        let response = match session.read_message(4, MAX_RESPONSE, response_len).await {
            Ok(response) => response,
            Err(ProbeError::Malformed(_)) => return Ok(ApplicationDiscovery::not_detected(PROTOCOL)),
            Err(e) => return Err(e),
        };
        let Ok(versions) = decode_api_versions(1, &response) else {
            return Ok(ApplicationDiscovery::not_detected(PROTOCOL));
        };

        let open = serves_metadata(session).await;
        Ok(ApplicationDiscovery::detected(PROTOCOL, !open)
            .with_property("api_count", versions.api_keys.len())
            .with_property("sasl", versions.api_keys.contains(&SASL_HANDSHAKE))
            .with_property("error_code", versions.error_code))
    }
}
