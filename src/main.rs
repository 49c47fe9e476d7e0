#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown, clippy::if_not_else, clippy::non_ascii_literal)]

use layerscan::address::{parse_target_spec, resolve_targets};
use layerscan::discovery::{Discoverer, DiscoveryOptions};
use layerscan::input::{Config, Opts};
use layerscan::port_strategy::PortStrategy;
use layerscan::probes::default_registry;
use layerscan::report::{Aggregator, ScanReport};
use layerscan::scanner::Scanner;
use layerscan::{detail, output, warning};

use chrono::Utc;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

// Average value for Ubuntu
#[cfg(unix)]
const DEFAULT_FILE_DESCRIPTORS_LIMIT: u64 = 8000;

#[cfg(not(tarpaulin_include))]
#[tokio::main]
/// Scans, discovers and reports. The heavy lifting lives in the library:
/// `scanner` for open ports and `discovery` for the protocol cascade.
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut opts: Opts = Opts::read();
    if !opts.no_config {
        let config = Config::read(opts.config_path.clone())?;
        opts.merge(&config);
    }

    debug!("Main() `opts` arguments are {opts:?}");

    // Everything the user typed is validated before the first socket opens.
    let port_spec = opts.port_spec()?;
    let filter = opts.protocol_filter();
    let target_spec = parse_target_spec(&opts.target)?;
    let probe_timeout = Duration::from_millis(opts.probe_timeout.into());
    let registry = if opts.no_discovery {
        None
    } else {
        Some(Arc::new(default_registry(probe_timeout)?))
    };

    // JSON on stdout must not be interleaved with status lines.
    let quiet = opts.greppable || (opts.json && opts.output.is_none());

    let targets = resolve_targets(&target_spec, opts.resolver.as_deref()).await?;
    debug!("Resolved targets {targets:?}");

    let ulimit = adjust_ulimit_size(&opts);
    let fan_out = opts.concurrency as u64
        * filter.transports().len() as u64
        * opts
            .target_concurrency
            .unwrap_or(targets.len())
            .min(targets.len()) as u64;
    if fan_out > ulimit {
        warning!(
            format!("Up to {fan_out} sockets may be open at once but the file limit is {ulimit}. Lower --concurrency, set --target-concurrency or raise --ulimit."),
            quiet,
            opts.accessible
        );
    }

    let strategy = PortStrategy::pick(&port_spec, opts.scan_order);
    detail!(
        format!(
            "Scanning {} target(s), {} port(s) each over {:?}",
            targets.len(),
            strategy.len(),
            filter.transports()
        ),
        quiet,
        opts.accessible
    );

    let started_at = Utc::now();
    let scanner = Scanner::new(
        &targets,
        strategy,
        filter,
        Duration::from_millis(opts.timeout.into()),
        opts.tries,
        opts.concurrency,
    )
    .with_target_concurrency(opts.target_concurrency);
    let hosts = scanner.run().await;

    let report = match registry {
        Some(registry) => {
            let discoverer = Discoverer::new(
                registry,
                DiscoveryOptions {
                    probe_timeout,
                    policy: opts.winner_policy,
                },
            );
            Aggregator::new(Arc::new(discoverer))
                .with_deadline(
                    opts.discovery_timeout
                        .map(|ms| Duration::from_millis(ms.into())),
                )
                .with_concurrency(opts.concurrency)
                .run(hosts, started_at)
                .await
        }
        None => ScanReport::without_discovery(hosts, started_at),
    };

    if let Some(path) = &opts.output {
        output::write_to_file(&report, opts.json, path)?;
        detail!(
            format!("Results written to {}", path.display()),
            quiet,
            opts.accessible
        );
    } else if opts.json {
        println!("{}", output::render_json(&report)?);
    } else {
        let lines = output::render_text(&report);
        if lines.is_empty() {
            warning!("No open ports found.", quiet, opts.accessible);
        }
        for line in lines {
            if opts.greppable {
                println!("{line}");
            } else {
                output!(line, false, opts.accessible);
            }
        }
    }

    Ok(())
}

#[cfg(unix)]
fn adjust_ulimit_size(opts: &Opts) -> u64 {
    use rlimit::Resource;

    if let Some(limit) = opts.ulimit {
        if Resource::NOFILE.set(limit, limit).is_ok() {
            detail!(
                format!("Automatically increasing ulimit value to {limit}."),
                opts.greppable,
                opts.accessible
            );
        } else {
            warning!(
                "ERROR. Failed to set ulimit value.",
                opts.greppable,
                opts.accessible
            );
        }
    }

    let (soft, _) = Resource::NOFILE
        .get()
        .unwrap_or((DEFAULT_FILE_DESCRIPTORS_LIMIT, DEFAULT_FILE_DESCRIPTORS_LIMIT));
    debug!("File descriptor limit is {soft}");
    soft
}

#[cfg(not(unix))]
fn adjust_ulimit_size(_opts: &Opts) -> u64 {
    u64::MAX
}
