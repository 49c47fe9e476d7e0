//! HTTP presentation probe and the minimal HTTP/1.1 client the HTTP based
//! application probes share.
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;

use crate::discovery::probe::{PresentationDiscovery, PresentationProbe};
use crate::error::ProbeError;
use crate::session::SessionHandle;

pub const PROTOCOL: &str = "http";

const MAX_RESPONSE: usize = 256 * 1024;

static STATUS_LINE: OnceCell<Regex> = OnceCell::new();

fn status_line() -> Result<&'static Regex, ProbeError> {
    STATUS_LINE
        .get_or_try_init(|| Regex::new(r"^HTTP/(\d+\.\d+) (\d{3})"))
        .map_err(|e| ProbeError::Malformed(e.to_string()))
}

/// Parses `HTTP/x.y NNN` at the start of `line`.
fn parse_status(line: &str) -> Result<Option<(String, u16)>, ProbeError> {
    let Some(captures) = status_line()?.captures(line) else {
        return Ok(None);
    };
    let status = captures[2]
        .parse()
        .map_err(|_| ProbeError::Malformed(format!("bad status in '{line}'")))?;
    Ok(Some((captures[1].to_owned(), status)))
}

fn request(host: &str, method: &str, path: &str, body: Option<&str>) -> Vec<u8> {
    let mut head = format!(
        "{method} {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: layerscan/{}\r\nAccept: */*\r\nConnection: close\r\n",
        env!("CARGO_PKG_VERSION")
    );
    if let Some(body) = body {
        head.push_str("Content-Type: application/json\r\n");
        head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        head.push_str(body);
    } else {
        head.push_str("\r\n");
    }
    head.into_bytes()
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn parse(raw: &[u8]) -> Result<Self, ProbeError> {
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| ProbeError::Malformed("incomplete HTTP head".to_owned()))?;

        let head = String::from_utf8_lossy(&raw[..split]);
        let mut lines = head.split("\r\n");
        let first = lines.next().unwrap_or_default();
        let (version, status) = parse_status(first)?
            .ok_or_else(|| ProbeError::Malformed(format!("not an HTTP status line: '{first}'")))?;

        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_owned()))
            .collect();

        let mut response = Self {
            version,
            status,
            headers,
            body: raw[split + 4..].to_vec(),
        };

        if response
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
        {
            response.body = dechunk(&response.body);
        } else if let Some(length) = response
            .header("content-length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            response.body.truncate(length);
        }

        Ok(response)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Decodes a chunked body, keeping whatever arrived before a truncation.
fn dechunk(mut data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let Some(eol) = data.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let size_field = String::from_utf8_lossy(&data[..eol]);
        let size_field = size_field.split(';').next().unwrap_or_default().trim();
        let Ok(size) = usize::from_str_radix(size_field, 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let start = eol + 2;
        let end = (start + size).min(data.len());
        body.extend_from_slice(&data[start..end]);
        if end + 2 > data.len() {
            break;
        }
        data = &data[end + 2..];
    }
    body
}

/// Sends one request on the session and reads the whole response.
pub async fn fetch(
    session: &mut SessionHandle,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> Result<HttpResponse, ProbeError> {
    let request = request(session.host(), method, path, body);
    session.write_all(&request).await?;
    let raw = session.read_to_limit(MAX_RESPONSE).await?;
    if raw.is_empty() {
        return Err(ProbeError::EndOfStream);
    }
    HttpResponse::parse(&raw)
}

/// Application probes built on HTTP only speak when HTTP was detected.
pub fn is_http(presentation: Option<&PresentationDiscovery>) -> bool {
    use crate::discovery::probe::Detection;
    presentation.is_some_and(|p| p.protocol() == PROTOCOL)
}

#[derive(Debug, Clone, Default)]
pub struct HttpPresentationProbe;

#[async_trait]
impl PresentationProbe for HttpPresentationProbe {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn discover(
        &self,
        session: &mut SessionHandle,
    ) -> Result<PresentationDiscovery, ProbeError> {
        let request = request(session.host(), "GET", "/", None);
        session.write_all(&request).await?;

        let mut buf = [0u8; 2048];
        let read = session.read_frame(&mut buf).await?;
        let head = String::from_utf8_lossy(&buf[..read]);
        let first = head.lines().next().unwrap_or_default();

        let Some((version, status)) = parse_status(first)? else {
            return Ok(PresentationDiscovery::not_detected(PROTOCOL));
        };

        let mut found = PresentationDiscovery::detected(PROTOCOL)
            .with_property("version", version)
            .with_property("status", status);

        if let Some(server) = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("server"))
            .map(|(_, value)| value.trim().to_owned())
        {
            found = found.with_property("server", server);
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::{dechunk, parse_status, HttpResponse};

    #[test]
    fn status_line_is_recognised() {
        assert_eq!(
            parse_status("HTTP/1.1 401 Unauthorized").unwrap(),
            Some(("1.1".to_owned(), 401))
        );
        assert_eq!(parse_status("-ERR unknown command").unwrap(), None);
        assert_eq!(parse_status("SSH-2.0-OpenSSH_9.6").unwrap(), None);
    }

    #[test]
    fn response_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 13\r\n\r\n{\"ok\": true}\nextra";
        let response = HttpResponse::parse(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.json().unwrap()["ok"], true);
    }

    #[test]
    fn chunked_response_is_decoded() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n{\"a\"\r\n4\r\n: 1}\r\n0\r\n\r\n";
        let response = HttpResponse::parse(raw).unwrap();
        assert_eq!(response.body, b"{\"a\": 1}");
    }

    #[test]
    fn truncated_chunk_keeps_what_arrived() {
        assert_eq!(dechunk(b"a\r\n0123"), b"0123");
    }

    #[test]
    fn non_http_is_malformed() {
        assert!(HttpResponse::parse(b"+PONG\r\n\r\n").is_err());
    }
}
