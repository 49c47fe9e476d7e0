use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use layerscan::address::Target;
use layerscan::input::{PortSpec, ProtocolFilter, ScanOrder, Transport};
use layerscan::port_strategy::PortStrategy;
use layerscan::scanner::{Connector, Scanner};

/// Records every attempt and reports `open` ports as open.
#[derive(Default)]
struct Counting {
    open: HashSet<u16>,
    tcp: AtomicUsize,
    udp: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl Connector for Counting {
    async fn is_open(&self, socket: SocketAddr, transport: Transport) -> bool {
        match transport {
            Transport::Tcp => self.tcp.fetch_add(1, Ordering::SeqCst),
            Transport::Udp => self.udp.fetch_add(1, Ordering::SeqCst),
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.open.contains(&socket.port())
    }
}

fn localhost() -> Vec<Target> {
    vec![Target::ip(Ipv4Addr::LOCALHOST)]
}

fn scanner(targets: &[Target], spec: &PortSpec, filter: ProtocolFilter, connector: Arc<Counting>) -> Scanner {
    Scanner::new(
        targets,
        PortStrategy::pick(spec, ScanOrder::Serial),
        filter,
        Duration::from_millis(100),
        1,
        8,
    )
    .with_connector(connector)
}

#[tokio::test]
async fn tcp_only_never_dials_udp() {
    // udp_only never overrides tcp_only
    for udp_only in [false, true] {
        let connector = Arc::new(Counting {
            open: HashSet::from([53, 80]),
            ..Counting::default()
        });

        let results = scanner(
            &localhost(),
            &PortSpec::Explicit(vec![53, 80, 443]),
            ProtocolFilter::from_flags(true, udp_only),
            Arc::clone(&connector),
        )
        .run()
        .await;

        assert_eq!(connector.udp.load(Ordering::SeqCst), 0, "udp_only = {udp_only}");
        assert_eq!(connector.tcp.load(Ordering::SeqCst), 3);
        assert_eq!(results[0].open_tcp_ports, vec![53, 80]);
        assert!(results[0].open_udp_ports.is_empty());
    }
}

#[tokio::test]
async fn empty_port_list_scans_every_port() {
    let connector = Arc::new(Counting::default());

    let results = scanner(
        &localhost(),
        &PortSpec::from_ports(vec![]),
        ProtocolFilter::Tcp,
        Arc::clone(&connector),
    )
    .run()
    .await;

    assert_eq!(connector.tcp.load(Ordering::SeqCst), 65535);
    assert!(results[0].open_tcp_ports.is_empty());
}

#[tokio::test]
async fn both_transports_are_scanned_without_flags() {
    let connector = Arc::new(Counting {
        open: HashSet::from([53]),
        ..Counting::default()
    });

    let results = scanner(
        &localhost(),
        &PortSpec::Explicit(vec![53, 54]),
        ProtocolFilter::from_flags(false, false),
        Arc::clone(&connector),
    )
    .run()
    .await;

    assert_eq!(connector.tcp.load(Ordering::SeqCst), 2);
    assert_eq!(connector.udp.load(Ordering::SeqCst), 2);
    assert_eq!(results[0].open_tcp_ports, vec![53]);
    assert_eq!(results[0].open_udp_ports, vec![53]);
}

#[tokio::test]
async fn closed_ports_are_never_reported() {
    let connector = Arc::new(Counting {
        open: HashSet::from([22, 6379]),
        ..Counting::default()
    });
    let ports: Vec<u16> = (1..=1024).chain([6379, 9200]).collect();

    let results = scanner(
        &localhost(),
        &PortSpec::Explicit(ports),
        ProtocolFilter::Both,
        connector,
    )
    .run()
    .await;

    assert_eq!(results[0].open_tcp_ports, vec![22, 6379]);
    assert_eq!(results[0].open_udp_ports, vec![22, 6379]);
}

#[tokio::test]
async fn one_result_per_target() {
    let targets: Vec<Target> = (1..=3)
        .map(|last| Target::ip(Ipv4Addr::new(127, 0, 0, last)))
        .collect();
    let connector = Arc::new(Counting {
        open: HashSet::from([80]),
        ..Counting::default()
    });

    let results = scanner(
        &targets,
        &PortSpec::Explicit(vec![80, 81]),
        ProtocolFilter::Tcp,
        connector,
    )
    .run()
    .await;

    assert_eq!(results.len(), 3);
    for (result, target) in results.iter().zip(&targets) {
        assert_eq!(result.ip, target.address);
        assert_eq!(result.open_tcp_ports, vec![80]);
    }
}

#[tokio::test]
async fn concurrency_gate_bounds_in_flight_attempts() {
    let connector = Arc::new(Counting {
        delay: Duration::from_millis(5),
        ..Counting::default()
    });

    scanner(
        &localhost(),
        &PortSpec::Explicit((1..=64).collect()),
        ProtocolFilter::Tcp,
        Arc::clone(&connector),
    )
    .run()
    .await;

    let max = connector.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 8, "saw {max} attempts in flight");
}

#[tokio::test]
async fn target_concurrency_bounds_parallel_targets() {
    let targets: Vec<Target> = (1..=4)
        .map(|last| Target::ip(Ipv4Addr::new(127, 0, 0, last)))
        .collect();
    let connector = Arc::new(Counting {
        delay: Duration::from_millis(5),
        ..Counting::default()
    });

    scanner(
        &targets,
        &PortSpec::Explicit((1..=32).collect()),
        ProtocolFilter::Tcp,
        Arc::clone(&connector),
    )
    .with_target_concurrency(Some(1))
    .run()
    .await;

    let max = connector.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 8, "saw {max} attempts in flight");
    assert_eq!(connector.tcp.load(Ordering::SeqCst), 128);
}
