//! Kubernetes API server, recognised by `GET /api`.
use async_trait::async_trait;
use serde_json::Value;

use super::http::{self, HttpResponse};
use crate::discovery::probe::{ApplicationDiscovery, ApplicationProbe, PresentationDiscovery};
use crate::error::ProbeError;
use crate::session::SessionHandle;

const PROTOCOL: &str = "kubernetes-api";

fn classify(response: &HttpResponse) -> ApplicationDiscovery {
    let Some(body) = response.json() else {
        return ApplicationDiscovery::not_detected(PROTOCOL);
    };
    let kind = body.get("kind").and_then(Value::as_str);

    match (response.status, kind) {
        (200, Some("APIVersions")) => {
            let mut found = ApplicationDiscovery::detected(PROTOCOL, false);
            if let Some(versions) = body.get("versions") {
                found = found.with_property("versions", versions.clone());
            }
            found
        }
        (401 | 403, Some("Status")) => {
            let mut found = ApplicationDiscovery::detected(PROTOCOL, true);
            if let Some(reason) = body.get("reason").and_then(Value::as_str) {
                found = found.with_property("reason", reason);
            }
            found
        }
        _ => ApplicationDiscovery::not_detected(PROTOCOL),
    }
}

#[derive(Debug, Clone, Default)]
pub struct KubernetesApiProbe;

#[async_trait]
impl ApplicationProbe for KubernetesApiProbe {
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

        let response = http::fetch(session, "GET", "/api", None).await?;
        Ok(classify(&response))
    }
}
