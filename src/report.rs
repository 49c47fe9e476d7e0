//! Joins port scan results with per-port discovery into the final report.
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use log::{debug, warn};
use serde::Serialize;
use tokio::time::timeout;

use crate::discovery::{DiscoveryResult, Discoverer};
use crate::input::{Transport, DEFAULT_CONCURRENCY};
use crate::scanner::ScanResult;

/// Discovery outcome of one open port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceReport {
    pub host: String,
    pub ip: IpAddr,
    pub port: u16,
    pub transport: Transport,
    #[serde(flatten)]
    pub discovery: DiscoveryResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub hosts: Vec<ScanResult>,
    pub services: Vec<ServiceReport>,
}

impl ScanReport {
    /// A report carrying only the open ports.
    pub fn without_discovery(hosts: Vec<ScanResult>, started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            hosts,
            services: vec![],
        }
    }
}

/// Runs discovery for every open port a scan reported.
pub struct Aggregator {
    discoverer: Arc<Discoverer>,
    deadline: Option<Duration>,
    concurrency: usize,
}

impl Aggregator {
    pub const fn new(discoverer: Arc<Discoverer>) -> Self {
        Self {
            discoverer,
            deadline: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Wall-clock limit for one port's whole cascade. A port that exceeds it
    /// is logged and left out of the report.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// How many ports are discovered at the same time.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn run(&self, hosts: Vec<ScanResult>, started_at: DateTime<Utc>) -> ScanReport {
        let jobs: Vec<(String, IpAddr, u16, Transport)> = hosts
            .iter()
            .flat_map(|result| {
                result
                    .open_ports()
                    .map(|(port, transport)| (result.host.clone(), result.ip, port, transport))
            })
            .collect();

        debug!("Running discovery on {} open ports", jobs.len());

        let mut services: Vec<ServiceReport> = stream::iter(jobs)
            .map(|(host, ip, port, transport)| async move {
                self.discover_one(host, ip, port, transport).await
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|service| async move { service })
            .collect()
            .await;

        services.sort_by_key(|s| (s.ip, s.port, s.transport == Transport::Udp));

        ScanReport {
            started_at,
            finished_at: Utc::now(),
            hosts,
            services,
        }
    }

    async fn discover_one(
        &self,
        host: String,
        ip: IpAddr,
        port: u16,
        transport: Transport,
    ) -> Option<ServiceReport> {
        let discovery = self.discoverer.discover_on(&host, port, transport);

        let outcome = match self.deadline {
            Some(deadline) => {
                if let Ok(outcome) = timeout(deadline, discovery).await {
                    outcome
                } else {
                    warn!("discovery of {host}:{port}/{transport} timed out after {deadline:?}, dropping it");
                    return None;
                }
            }
            None => discovery.await,
        };

        match outcome {
            Ok(discovery) => Some(ServiceReport {
                host,
                ip,
                port,
                transport,
                discovery,
            }),
            Err(e) => {
                warn!("skipping {host}:{port}/{transport}: {e}");
                None
            }
        }
    }
}
