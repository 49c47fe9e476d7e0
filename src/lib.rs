//! This crate exposes the internal functionality of the `layerscan` port
//! scanner and service fingerprinter.
//!
//! layerscan finds open TCP and UDP ports on a set of targets and then works
//! out, without credentials, which service listens behind each open port and
//! whether it asks for authentication. It is meant for unauthenticated
//! security-posture assessment of infrastructure you are allowed to probe.
//!
//! ## Architecture Overview
//!
//! 1. **Input Processing**: targets ([`address`]) and ports ([`input`]) are
//!    parsed and validated. Invalid input is a
//!    [`ConfigurationError`](crate::error::ConfigurationError) raised before
//!    any socket is opened.
//! 2. **Port Scanning**: the [`Scanner`](crate::scanner::Scanner) probes every
//!    (target, transport) pair concurrently, each through a bounded window of
//!    in-flight connects, in the order picked by the
//!    [`PortStrategy`](crate::port_strategy::PortStrategy).
//! 3. **Discovery**: for every open port the
//!    [`Discoverer`](crate::discovery::Discoverer) runs the session,
//!    presentation and application probes of a
//!    [`ProbeRegistry`](crate::discovery::ProbeRegistry) as a cascade.
//! 4. **Reporting**: the [`Aggregator`](crate::report::Aggregator) joins both
//!    into a [`ScanReport`](crate::report::ScanReport), rendered by [`output`].
//!
//! ## Basic Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use layerscan::address::{parse_target_spec, resolve_targets};
//! use layerscan::discovery::{Discoverer, DiscoveryOptions};
//! use layerscan::probes::default_registry;
//! use layerscan::scanner::scan;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let spec = parse_target_spec("127.0.0.1")?;
//!     let targets = resolve_targets(&spec, None).await?;
//!
//!     // TCP only, two ports, 500ms connect timeout
//!     let results = scan(&targets, true, false, &[6379, 9200], Duration::from_millis(500)).await;
//!
//!     let registry = Arc::new(default_registry(Duration::from_secs(2))?);
//!     let discoverer = Discoverer::new(registry, DiscoveryOptions::default());
//!
//!     for result in &results {
//!         for &port in &result.open_tcp_ports {
//!             let found = discoverer.discover(&result.host, port).await?;
//!             println!("{port}: {} / {}", found.session_layer, found.application_layer);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Writing a Probe
//!
//! A probe implements one of
//! [`SessionProbe`](crate::discovery::probe::SessionProbe),
//! [`PresentationProbe`](crate::discovery::probe::PresentationProbe) or
//! [`ApplicationProbe`](crate::discovery::probe::ApplicationProbe) and is
//! registered through [`ProbeRegistry::builder`](crate::discovery::ProbeRegistry::builder).
//! A target that does not speak the probe's protocol is reported as
//! "not detected", never as an error.
#![allow(clippy::needless_doctest_main)]

pub mod tui;

pub mod error;

pub mod input;

pub mod address;

pub mod port_strategy;

pub mod scanner;

pub mod session;

pub mod discovery;

pub mod probes;

pub mod report;

pub mod output;
