//! Redis: `PING` answers `+PONG` without credentials and an auth error with them.
use async_trait::async_trait;
use log::debug;

use crate::discovery::probe::{ApplicationDiscovery, ApplicationProbe, PresentationDiscovery};
use crate::error::ProbeError;
use crate::session::SessionHandle;

const PROTOCOL: &str = "redis";
const PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";
const INFO_SERVER: &[u8] = b"*2\r\n$4\r\nINFO\r\n$6\r\nserver\r\n";

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Pong,
    AuthRequired,
    Other,
}

fn classify(reply: &str) -> Reply {
    let reply = reply.trim_end();
    if reply.eq_ignore_ascii_case("+PONG") {
        return Reply::Pong;
    }

    let upper = reply.to_ascii_uppercase();
    if upper.starts_with("-NOAUTH")
        || upper.starts_with("-WRONGPASS")
        || upper.starts_with("-DENIED")
        || (upper.starts_with("-ERR") && upper.contains("AUTH"))
    {
        return Reply::AuthRequired;
    }

    Reply::Other
}

/// Pulls `key:value` pairs of interest out of an `INFO server` bulk reply.
fn server_info(reply: &str) -> Vec<(&str, &str)> {
    reply
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(key, _)| matches!(*key, "redis_version" | "redis_mode" | "os"))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct RedisProbe;

#[async_trait]
impl ApplicationProbe for RedisProbe {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn discover(
        &self,
        session: &mut SessionHandle,
        _presentation: Option<&PresentationDiscovery>,
    ) -> Result<ApplicationDiscovery, ProbeError> {
        session.write_all(PING).await?;

        let mut buf = [0u8; 512];
        let read = session.read_frame(&mut buf).await?;
        let reply = String::from_utf8_lossy(&buf[..read]);

        match classify(&reply) {
            Reply::AuthRequired => Ok(ApplicationDiscovery::detected(PROTOCOL, true)),
            Reply::Other => Ok(ApplicationDiscovery::not_detected(PROTOCOL)),
            Reply::Pong => {
                let mut found = ApplicationDiscovery::detected(PROTOCOL, false);

                // Best effort; the detection stands without it.
                let mut info = vec![0u8; 8192];
                let details = match session.write_all(INFO_SERVER).await {
                    Ok(()) => session.read_frame(&mut info).await,
                    Err(e) => Err(e),
                };
                match details {
                    Ok(read) => {
                        let text = String::from_utf8_lossy(&info[..read]);
                        for (key, value) in server_info(&text) {
                            found = found.with_property(key, value.trim());
                        }
                    }
                    Err(e) => debug!("redis INFO on {}:{}: {e}", session.host(), session.port()),
                }

                Ok(found)
            }
        }
    }
}
