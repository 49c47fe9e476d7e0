//! Text and JSON rendering of a [`ScanReport`].
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use crate::report::{ScanReport, ServiceReport};

/// One line per host with its open ports, then one line per discovered service.
pub fn render_text(report: &ScanReport) -> Vec<String> {
    let mut lines = Vec::new();

    for host in &report.hosts {
        if host.open_tcp_ports.is_empty() && host.open_udp_ports.is_empty() {
            continue;
        }
        let mut line = format!("{} ({})", host.host, host.ip);
        if !host.open_tcp_ports.is_empty() {
            let _ = write!(line, " tcp {:?}", host.open_tcp_ports);
        }
        if !host.open_udp_ports.is_empty() {
            let _ = write!(line, " udp {:?}", host.open_udp_ports);
        }
        lines.push(line);
    }

    lines.extend(report.services.iter().map(service_line));
    lines
}

fn service_line(service: &ServiceReport) -> String {
    let discovery = &service.discovery;
    let layer = |name: &str| {
        if name.is_empty() {
            "-".to_owned()
        } else {
            name.to_owned()
        }
    };

    let mut line = format!(
        "{}:{}/{} session={} presentation={} application={}",
        service.host,
        service.port,
        service.transport,
        layer(&discovery.session_layer),
        layer(&discovery.presentation_layer),
        layer(&discovery.application_layer),
    );

    if !discovery.application_layer.is_empty() {
        let auth = if discovery.is_authenticated {
            "required"
        } else {
            "none"
        };
        let _ = write!(line, " auth={auth}");
    }
    if !discovery.properties.is_empty() {
        let properties = serde_json::to_string(&discovery.properties).unwrap_or_default();
        let _ = write!(line, " {properties}");
    }
    line
}

pub fn render_json(report: &ScanReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

/// Writes the rendered report to `path`.
pub fn write_to_file(report: &ScanReport, json: bool, path: &Path) -> io::Result<()> {
    let content = if json {
        render_json(report)?
    } else {
        let mut text = render_text(report).join("\n");
        text.push('\n');
        text
    };
    fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::{render_json, render_text, write_to_file};
    use crate::discovery::DiscoveryResult;
    use crate::input::Transport;
    use crate::report::{ScanReport, ServiceReport};
    use crate::scanner::ScanResult;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};

    fn report() -> ScanReport {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let mut discovery = DiscoveryResult {
            session_layer: "tcp".to_owned(),
            application_layer: "redis".to_owned(),
            ..DiscoveryResult::default()
        };
        discovery
            .properties
            .insert("redis_version".to_owned(), "7.2.4".into());

        ScanReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            hosts: vec![
                ScanResult {
                    host: "10.0.0.5".to_owned(),
                    ip,
                    open_tcp_ports: vec![6379],
                    open_udp_ports: vec![],
                },
                ScanResult {
                    host: "10.0.0.6".to_owned(),
                    ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6)),
                    open_tcp_ports: vec![],
                    open_udp_ports: vec![],
                },
            ],
            services: vec![ServiceReport {
                host: "10.0.0.5".to_owned(),
                ip,
                port: 6379,
                transport: Transport::Tcp,
                discovery,
            }],
        }
    }

    #[test]
    fn text_lists_hosts_with_open_ports_and_services() {
        let lines = render_text(&report());

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "10.0.0.5 (10.0.0.5) tcp [6379]");
        assert_eq!(
            lines[1],
            "10.0.0.5:6379/tcp session=tcp presentation=- application=redis auth=none {\"redis_version\":\"7.2.4\"}"
        );
    }

    #[test]
    fn json_contains_hosts_and_services() {
        let json: serde_json::Value = serde_json::from_str(&render_json(&report()).unwrap()).unwrap();

        assert_eq!(json["hosts"][0]["open_tcp_ports"][0], 6379);
        assert_eq!(json["services"][0]["application_layer"], "redis");
        assert!(json["started_at"].is_string());
    }

    #[test]
    fn report_is_written_to_file() {
        let path = std::env::temp_dir().join(format!("layerscan-{}.json", std::process::id()));
        write_to_file(&report(), true, &path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"redis\""));
        std::fs::remove_file(path).unwrap();
    }
}
