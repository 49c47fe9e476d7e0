//! Elasticsearch: `GET /` returns cluster metadata, or a `security_exception`
//! when security is enabled.
use async_trait::async_trait;
use serde_json::Value;

use super::http::{self, HttpResponse};
use crate::discovery::probe::{ApplicationDiscovery, ApplicationProbe, PresentationDiscovery};
use crate::error::ProbeError;
use crate::session::SessionHandle;

const PROTOCOL: &str = "elasticsearch";

fn classify(response: &HttpResponse) -> ApplicationDiscovery {
    let body = response.json().unwrap_or(Value::Null);

    if response.status == 200 && body.get("cluster_name").is_some() {
        let mut found = ApplicationDiscovery::detected(PROTOCOL, false);
        for key in ["name", "cluster_name", "cluster_uuid"] {
            if let Some(value) = body.get(key).and_then(Value::as_str) {
                found = found.with_property(key, value);
            }
        }
        if let Some(number) = body.pointer("/version/number").and_then(Value::as_str) {
            found = found.with_property("version", number);
        }
        return found;
    }

    let security_error = body.pointer("/error/type").and_then(Value::as_str)
        == Some("security_exception");
    let security_realm = response
        .header("www-authenticate")
        .is_some_and(|v| v.contains("realm=\"security\""));

    if response.status == 401 && (security_error || security_realm) {
        return ApplicationDiscovery::detected(PROTOCOL, true);
    }

    ApplicationDiscovery::not_detected(PROTOCOL)
}

#[derive(Debug, Clone, Default)]
pub struct ElasticsearchProbe;

#[async_trait]
impl ApplicationProbe for ElasticsearchProbe {
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

        let response = http::fetch(session, "GET", "/", None).await?;
        Ok(classify(&response))
    }
}

#[cfg(test)]
mod tests {
    use super::classify;
    use crate::discovery::probe::Detection;
    use crate::probes::http::HttpResponse;

    fn response(raw: &str) -> HttpResponse {
        HttpResponse::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn open_cluster_reports_metadata() {
        let found = classify(&response(
            "HTTP/1.1 200 OK\r\n\r\n{\"name\":\"es01\",\"cluster_name\":\"docker-cluster\",\"cluster_uuid\":\"abc\",\"version\":{\"number\":\"8.13.0\"},\"tagline\":\"You Know, for Search\"}",
        ));
        assert!(found.is_detected());
        assert!(!found.is_auth_required());
        assert_eq!(found.properties()["cluster_name"], "docker-cluster");
        assert_eq!(found.properties()["version"], "8.13.0");
    }

    #[test]
    fn secured_cluster_requires_auth() {
        let found = classify(&response(
            "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"security\" charset=\"UTF-8\"\r\n\r\n{\"error\":{\"type\":\"security_exception\"},\"status\":401}",
        ));
        assert!(found.is_detected());
        assert!(found.is_auth_required());
    }

    #[test]
    fn plain_web_server_is_not_elasticsearch() {
        let found = classify(&response("HTTP/1.1 401 Unauthorized\r\n\r\n<html></html>"));
        assert!(!found.is_detected());
    }
}
