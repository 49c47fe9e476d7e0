//! Provides functions to parse target specifications and resolve them into
//! scan targets.
//!
//! Accepted forms:
//!
//! - a single IPv4 address, `10.0.0.5`
//! - a hostname, `db.internal`
//! - an IPv4 range, `10.0.0.1-10.0.0.20`, or abbreviated, `10.0.0.1-20`
//! - a CIDR block, `10.0.0.0/28`
//!
//! Parsing is pure and happens before any network I/O, so a malformed target
//! is rejected before the first socket is opened.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use cidr_utils::cidr::IpCidr;
use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use log::debug;
use serde::Serialize;
use tokio::{fs, io};

use crate::error::ConfigurationError;

/// Upper bound on the number of addresses one range or CIDR may expand to.
pub const MAX_TARGETS: u64 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Ip,
    Hostname,
    RangeMember,
}

/// A resolved host identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub kind: TargetKind,
    pub address: IpAddr,
    pub hostname: Option<String>,
}

impl Target {
    pub fn ip(address: Ipv4Addr) -> Self {
        Self {
            kind: TargetKind::Ip,
            address: IpAddr::V4(address),
            hostname: None,
        }
    }

    fn range_member(address: Ipv4Addr) -> Self {
        Self {
            kind: TargetKind::RangeMember,
            address: IpAddr::V4(address),
            hostname: None,
        }
    }

    /// Hostname when there is one, otherwise the address.
    pub fn host(&self) -> String {
        self.hostname
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

/// A parsed, not yet resolved, target specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Ip(Ipv4Addr),
    Hostname(String),
    Range { start: Ipv4Addr, end: Ipv4Addr },
}

impl TargetSpec {
    /// Number of addresses this specification covers, one for a hostname.
    pub fn len(&self) -> u64 {
        match self {
            Self::Ip(_) | Self::Hostname(_) => 1,
            Self::Range { start, end } => {
                u64::from(u32::from(*end)).saturating_sub(u64::from(u32::from(*start))) + 1
            }
        }
    }

    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// Given a string, parse it as an IPv4 address, IPv4 range, CIDR or hostname.
///
/// ```rust
/// # use layerscan::address::{parse_target_spec, TargetSpec};
/// let spec = parse_target_spec("192.168.0.1-4").unwrap();
/// assert_eq!(spec.len(), 4);
/// assert!(parse_target_spec("10.0.0.5-10.0.0.abc").is_err());
/// ```
pub fn parse_target_spec(input: &str) -> Result<TargetSpec, ConfigurationError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ConfigurationError::InvalidTarget {
            input: input.to_owned(),
            reason: "empty target".to_owned(),
        });
    }

    if let Some((start, end)) = input.split_once('-') {
        if let Ok(start) = start.trim().parse::<Ipv4Addr>() {
            return parse_range(input, start, end.trim());
        }
        if start.trim().parse::<IpAddr>().is_ok() {
            return Err(ConfigurationError::Ipv6Unsupported(input.to_owned()));
        }
    }

    if input.contains('/') {
        return parse_cidr(input);
    }

    match input.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => return Ok(TargetSpec::Ip(ip)),
        Ok(IpAddr::V6(_)) => return Err(ConfigurationError::Ipv6Unsupported(input.to_owned())),
        Err(_) => {}
    }

    if is_hostname(input) {
        Ok(TargetSpec::Hostname(input.to_owned()))
    } else {
        Err(ConfigurationError::InvalidTarget {
            input: input.to_owned(),
            reason: "not an IPv4 address, range, CIDR or hostname".to_owned(),
        })
    }
}

fn parse_range(input: &str, start: Ipv4Addr, end: &str) -> Result<TargetSpec, ConfigurationError> {
    let invalid = |reason: String| ConfigurationError::InvalidRange {
        input: input.to_owned(),
        reason,
    };

    let end = parse_range_end(end, start).map_err(invalid)?;
    if u32::from(start) > u32::from(end) {
        return Err(invalid(format!("start {start} is after end {end}")));
    }

    let spec = TargetSpec::Range { start, end };
    if spec.len() > MAX_TARGETS {
        return Err(invalid(format!(
            "{} addresses exceed the limit of {MAX_TARGETS}",
            spec.len()
        )));
    }
    Ok(spec)
}

/// Handles abbreviated forms like "192.168.1.1-50" (implies 192.168.1.50)
/// and full forms like "192.168.1.1-192.168.1.255".
fn parse_range_end(end: &str, start: Ipv4Addr) -> Result<Ipv4Addr, String> {
    if let Ok(full) = end.parse::<Ipv4Addr>() {
        return Ok(full);
    }

    let partial = end
        .split('.')
        .map(str::parse::<u8>)
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|e| format!("invalid end '{end}': {e}"))?;

    if partial.is_empty() || partial.len() > 4 {
        return Err(format!("invalid end '{end}'"));
    }

    let mut octets = start.octets();
    let from = 4 - partial.len();
    octets[from..].copy_from_slice(&partial);
    Ok(Ipv4Addr::from(octets))
}

fn parse_cidr(input: &str) -> Result<TargetSpec, ConfigurationError> {
    let cidr = IpCidr::from_str(input).map_err(|e| ConfigurationError::InvalidTarget {
        input: input.to_owned(),
        reason: e.to_string(),
    })?;

    let IpCidr::V4(cidr) = cidr else {
        return Err(ConfigurationError::Ipv6Unsupported(input.to_owned()));
    };

    let spec = TargetSpec::Range {
        start: cidr.first_address(),
        end: cidr.last_address(),
    };
    if spec.len() > MAX_TARGETS {
        return Err(ConfigurationError::InvalidRange {
            input: input.to_owned(),
            reason: format!("{} addresses exceed the limit of {MAX_TARGETS}", spec.len()),
        });
    }
    Ok(spec)
}

fn is_hostname(input: &str) -> bool {
    input.len() <= 253
        && input.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

/// Turns a parsed specification into targets. Hostnames are resolved with the
/// system resolver first, then with `resolver` (or the system configuration,
/// or Cloudflare as a last resort). Only IPv4 answers are kept.
pub async fn resolve_targets(
    spec: &TargetSpec,
    resolver: Option<&str>,
) -> Result<Vec<Target>, ConfigurationError> {
    match spec {
        TargetSpec::Ip(ip) => Ok(vec![Target::ip(*ip)]),
        TargetSpec::Range { start, end } => Ok((u32::from(*start)..=u32::from(*end))
            .map(|ip| Target::range_member(Ipv4Addr::from(ip)))
            .collect()),
        TargetSpec::Hostname(host) => {
            let address = resolve_host(host, resolver)
                .await
                .ok_or_else(|| ConfigurationError::Unresolvable(host.clone()))?;
            Ok(vec![Target {
                kind: TargetKind::Hostname,
                address: IpAddr::V4(address),
                hostname: Some(host.clone()),
            }])
        }
    }
}

async fn resolve_host(host: &str, resolver: Option<&str>) -> Option<Ipv4Addr> {
    let first_v4 = |ips: Vec<IpAddr>| {
        ips.into_iter().find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
    };

    if let Ok(addrs) = tokio::net::lookup_host((host, 80)).await {
        if let Some(ip) = first_v4(addrs.map(|a| a.ip()).collect()) {
            return Some(ip);
        }
    }

    debug!("system resolver has no IPv4 address for {host}, trying fallback resolver");
    let backup = get_resolver(resolver).await;
    match backup.lookup_ip(host).await {
        Ok(answer) => first_v4(answer.iter().collect()),
        Err(e) => {
            debug!("fallback resolution of {host} failed: {e}");
            None
        }
    }
}

/// Derive a DNS resolver.
///
/// 1. if the `resolver` parameter has been set:
///     1. assume the parameter is a path and attempt to read IPs.
///     2. parse the input as a comma-separated list of IPs.
/// 2. if `resolver` is not set:
///    1. attempt to derive a resolver from the system config. (e.g.
///       `/etc/resolv.conf` on *nix).
///    2. finally, build a CloudFlare-based resolver (default
///       behaviour).
async fn get_resolver(resolver: Option<&str>) -> TokioAsyncResolver {
    match resolver {
        Some(r) => {
            let mut config = ResolverConfig::new();
            let resolver_ips = match read_resolver_from_file(r).await {
                Ok(ips) => ips,
                Err(_) => r
                    .split(',')
                    .filter_map(|r| IpAddr::from_str(r.trim()).ok())
                    .collect::<Vec<_>>(),
            };
            for ip in resolver_ips {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(ip, 53),
                    Protocol::Udp,
                ));
            }
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        }
        None => TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare_tls(), ResolverOpts::default())
        }),
    }
}

/// Parses an input file of IPs for use in DNS resolution.
async fn read_resolver_from_file(path: &str) -> io::Result<Vec<IpAddr>> {
    let ips = fs::read_to_string(path)
        .await?
        .lines()
        .filter_map(|line| IpAddr::from_str(line.trim()).ok())
        .collect();

    Ok(ips)
}
