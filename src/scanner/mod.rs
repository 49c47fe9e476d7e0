//! Core functionality for actual scanning behaviour.
//!
//! One task is spawned per (target, transport) pair. Inside a task the ports
//! are probed through a bounded window of `concurrency` in-flight attempts,
//! so a single target never holds more than that many sockets per transport.
//! Results are fanned in through a channel and returned once every task has
//! reported.
use crate::address::Target;
use crate::input::{PortSpec, ProtocolFilter, ScanOrder, Transport, DEFAULT_CONCURRENCY};
use crate::port_strategy::PortStrategy;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use log::{debug, warn};
use serde::Serialize;
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZero,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{self, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::{mpsc, Semaphore},
    time,
};

/// Decides whether a single socket is open.
///
/// A closed, filtered or timed out port is simply `false`; no error leaves a
/// connector.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn is_open(&self, socket: SocketAddr, transport: Transport) -> bool;
}

/// Connects with real sockets.
#[derive(Debug)]
pub struct SocketConnector {
    tries: NonZero<u8>,
    timeout: Duration,
}

impl SocketConnector {
    pub fn new(timeout: Duration, tries: u8) -> Self {
        Self {
            timeout,
            tries: NonZero::new(tries).unwrap_or(NonZero::<u8>::MIN),
        }
    }

    /// Connects up to `tries` times; the port is open as soon as one
    /// connection succeeds. The stream is shut down right away.
    async fn scan_tcp(&self, socket: SocketAddr) -> bool {
        for nr_try in 1..=self.tries.get() {
            match self.connect(socket).await {
                Ok(tcp_stream) => {
                    debug!("Connection was successful, shutting down stream {socket}");
                    if let Err(e) = { tcp_stream }.shutdown().await {
                        debug!("Shutdown stream error {e}");
                    }
                    debug!("Return Ok after {nr_try} tries");
                    return true;
                }
                Err(e) => {
                    if e.to_string().to_lowercase().contains("too many open files") {
                        warn!("Too many open files while scanning {socket}. Lower --concurrency or raise --ulimit.");
                    }
                }
            }
        }
        false
    }

    /// Performs the connection to the socket with timeout
    async fn connect(&self, socket: SocketAddr) -> io::Result<TcpStream> {
        time::timeout(self.timeout, TcpStream::connect(socket)).await?
    }

    /// A UDP port counts as open when it answers the payload within the timeout.
    async fn scan_udp(&self, socket: SocketAddr) -> bool {
        let payload = udp_payload(socket.port());
        for _ in 1..=self.tries.get() {
            match self.udp_scan(socket, &payload, self.timeout).await {
                Ok(true) => return true,
                Ok(false) => continue,
                Err(e) => {
                    debug!("UDP scan of {socket} failed: {e}");
                    return false;
                }
            }
        }
        false
    }

    /// Binds to a UDP socket so we can send and receive packets
    async fn udp_bind(&self, socket: SocketAddr) -> io::Result<UdpSocket> {
        let local_addr = match socket {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };

        UdpSocket::bind(local_addr).await
    }

    /// Sends `payload` and waits `wait` for any datagram in return.
    /// Ok(false) means no answer; an ICMP port unreachable surfaces as Err.
    async fn udp_scan(&self, socket: SocketAddr, payload: &[u8], wait: Duration) -> io::Result<bool> {
        let udp_socket = self.udp_bind(socket).await?;
        let mut buf = [0u8; 1024];

        udp_socket.connect(socket).await?;
        udp_socket.send(payload).await?;

        match time::timeout(wait, udp_socket.recv(&mut buf)).await {
            Ok(Ok(size)) => {
                debug!("Received {size} bytes from {socket}");
                Ok(true)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl Connector for SocketConnector {
    async fn is_open(&self, socket: SocketAddr, transport: Transport) -> bool {
        match transport {
            Transport::Tcp => self.scan_tcp(socket).await,
            Transport::Udp => self.scan_udp(socket).await,
        }
    }
}

/// A datagram likely to get an answer from the service usually found on `port`.
fn udp_payload(port: u16) -> Vec<u8> {
    match port {
        // DNS: standard query for the root NS records
        53 => vec![
            0x13, 0x37, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x02, 0x00, 0x01,
        ],
        // NTP: version 3 client request
        123 => {
            let mut packet = vec![0u8; 48];
            packet[0] = 0x1b;
            packet
        }
        _ => b"\r\n\r\n".to_vec(),
    }
}

/// Open ports found on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub host: String,
    pub ip: IpAddr,
    pub open_tcp_ports: Vec<u16>,
    pub open_udp_ports: Vec<u16>,
}

impl ScanResult {
    fn empty(target: &Target) -> Self {
        Self {
            host: target.host(),
            ip: target.address,
            open_tcp_ports: vec![],
            open_udp_ports: vec![],
        }
    }

    /// Every open port with its transport, TCP first.
    pub fn open_ports(&self) -> impl Iterator<Item = (u16, Transport)> + '_ {
        self.open_tcp_ports
            .iter()
            .map(|&port| (port, Transport::Tcp))
            .chain(self.open_udp_ports.iter().map(|&port| (port, Transport::Udp)))
    }
}

/// The class for the scanner
/// targets are the resolved hosts to scan
/// port_strategy decides which ports are scanned and in which order
/// filter selects TCP, UDP or both
/// concurrency is how many ports of one target and transport are probed at a time
/// target_gate optionally bounds how many (target, transport) scans run at once
pub struct Scanner {
    targets: Vec<Target>,
    port_strategy: PortStrategy,
    filter: ProtocolFilter,
    concurrency: usize,
    target_gate: Option<Arc<Semaphore>>,
    connector: Arc<dyn Connector>,
}

impl Scanner {
    pub fn new(
        targets: &[Target],
        port_strategy: PortStrategy,
        filter: ProtocolFilter,
        timeout: Duration,
        tries: u8,
        concurrency: usize,
    ) -> Self {
        Self {
            targets: targets.to_vec(),
            port_strategy,
            filter,
            concurrency: concurrency.max(1),
            target_gate: None,
            connector: Arc::new(SocketConnector::new(timeout, tries)),
        }
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Bounds the number of (target, transport) scans running at once.
    #[must_use]
    pub fn with_target_concurrency(mut self, limit: Option<usize>) -> Self {
        self.target_gate = limit.map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    /// Scans every target and returns one result per target, in target order,
    /// with ports sorted. Closed ports are never reported.
    pub async fn run(&self) -> Vec<ScanResult> {
        let ports: Arc<[u16]> = self.port_strategy.order().into();
        let transports = self.filter.transports();
        let jobs = self.targets.len() * transports.len();

        debug!(
            "Start scanning sockets. \nConcurrency {}\nNumber of targets {}\nNumber of ports {}\nTransports {:?}",
            self.concurrency,
            self.targets.len(),
            ports.len(),
            transports
        );

        let (tx, mut rx) = mpsc::channel(jobs.max(1));

        for (index, target) in self.targets.iter().enumerate() {
            for &transport in transports {
                let tx = tx.clone();
                let ports = Arc::clone(&ports);
                let connector = Arc::clone(&self.connector);
                let gate = self.target_gate.clone();
                let concurrency = self.concurrency;
                let ip = target.address;

                tokio::spawn(async move {
                    let _permit = match gate {
                        Some(gate) => gate.acquire_owned().await.ok(),
                        None => None,
                    };

                    let open = stream::iter(ports.iter().copied())
                        .map(|port| {
                            let connector = Arc::clone(&connector);
                            async move {
                                connector
                                    .is_open(SocketAddr::new(ip, port), transport)
                                    .await
                                    .then_some(port)
                            }
                        })
                        .buffer_unordered(concurrency)
                        .filter_map(|open| async move { open })
                        .collect::<Vec<u16>>()
                        .await;

                    if tx.send((index, transport, open)).await.is_err() {
                        debug!("scan result for {ip} dropped, receiver gone");
                    }
                });
            }
        }
        drop(tx);

        let mut results: Vec<ScanResult> = self.targets.iter().map(ScanResult::empty).collect();
        while let Some((index, transport, mut open)) = rx.recv().await {
            open.sort_unstable();
            match transport {
                Transport::Tcp => results[index].open_tcp_ports = open,
                Transport::Udp => results[index].open_udp_ports = open,
            }
        }

        debug!("Open ports found: {results:?}");
        results
    }
}

/// Scans `targets` for open ports. An empty `ports` scans 1-65535;
/// `tcp_only` and `udp_only` narrow the transports, `tcp_only` winning when
/// both are set (neither means both).
pub async fn scan(
    targets: &[Target],
    tcp_only: bool,
    udp_only: bool,
    ports: &[u16],
    timeout: Duration,
) -> Vec<ScanResult> {
    let strategy = PortStrategy::pick(&PortSpec::from_ports(ports.to_vec()), ScanOrder::Serial);
    Scanner::new(
        targets,
        strategy,
        ProtocolFilter::from_flags(tcp_only, udp_only),
        timeout,
        1,
        DEFAULT_CONCURRENCY,
    )
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn scanner_finds_loopback_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = {
            let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
            spare.local_addr().unwrap().port()
        };

        let targets = vec![Target::ip(Ipv4Addr::LOCALHOST)];
        let results = scan(&targets, true, false, &[open, closed], Duration::from_millis(500)).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].open_tcp_ports, vec![open]);
        assert!(results[0].open_udp_ports.is_empty());
    }

    #[tokio::test]
    async fn udp_port_answering_is_open() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let Ok((_, peer)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(b"pong", peer).await;
            }
        });

        let targets = vec![Target::ip(Ipv4Addr::LOCALHOST)];
        let results = scan(&targets, false, true, &[port], Duration::from_millis(500)).await;

        assert_eq!(results[0].open_udp_ports, vec![port]);
        assert!(results[0].open_tcp_ports.is_empty());
    }

    #[tokio::test]
    async fn silent_udp_port_is_closed() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let targets = vec![Target::ip(Ipv4Addr::LOCALHOST)];
        let results = scan(&targets, false, true, &[port], Duration::from_millis(200)).await;
        drop(server);

        assert!(results[0].open_udp_ports.is_empty());
    }

    #[test]
    fn udp_payloads_match_well_known_ports() {
        assert_eq!(udp_payload(123).len(), 48);
        assert_eq!(udp_payload(53)[5], 0x01);
        assert!(!udp_payload(9999).is_empty());
    }
}
