//! etcd: `GET /version` identifies the server, then a v3 range request over
//! the JSON gateway tells whether reads need a token.
use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::http::{self, HttpResponse};
use crate::discovery::probe::{ApplicationDiscovery, ApplicationProbe, PresentationDiscovery};
use crate::error::ProbeError;
use crate::session::SessionHandle;

const PROTOCOL: &str = "etcd";
/// Range over key `\0` (base64 `AA==`), limited to a single key.
const RANGE_REQUEST: &str = r#"{"key":"AA==","limit":1}"#;

fn version(response: &HttpResponse) -> Option<Value> {
    if response.status != 200 {
        return None;
    }
    let body = response.json()?;
    body.get("etcdserver").is_some().then_some(body)
}

fn range_requires_auth(response: &HttpResponse) -> bool {
    if response.status == 200 {
        return false;
    }
    let message = String::from_utf8_lossy(&response.body).to_ascii_lowercase();
    matches!(response.status, 401 | 403)
        || message.contains("user name is empty")
        || message.contains("invalid auth token")
        || message.contains("permission denied")
}

#[derive(Debug, Clone, Default)]
pub struct EtcdProbe;

#[async_trait]
impl ApplicationProbe for EtcdProbe {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn discover(
        &self,
        session: &mut SessionHandle,
        presentation: Option<&PresentationDiscovery>,
    ) -> Result<ApplicationDiscovery, ProbeError> {
        if !http::is_http(presentation) {
            return Ok(ApplicationDiscovery::not_detected(PROTOCOL));
        }

        let response = http::fetch(session, "GET", "/version", None).await?;
        let Some(body) = version(&response) else {
            return Ok(ApplicationDiscovery::not_detected(PROTOCOL));
        };

        // The connection was closed by the server; the range request needs a new one.
        session.destroy();
        let auth_required =
            match http::fetch(session, "POST", "/v3/kv/range", Some(RANGE_REQUEST)).await {
                Ok(range) => range_requires_auth(&range),
                Err(e) => {
                    debug!("etcd range on {}:{}: {e}", session.host(), session.port());
                    false
                }
            };

        let mut found = ApplicationDiscovery::detected(PROTOCOL, auth_required);
        for key in ["etcdserver", "etcdcluster"] {
            if let Some(value) = body.get(key).and_then(Value::as_str) {
                found = found.with_property(key, value);
            }
        }
        Ok(found)
    }
}
