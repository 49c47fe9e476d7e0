//! Provides a means to read, parse and hold configuration options for scans.
use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_derive::Deserialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::error::ConfigurationError;

pub(crate) const LOWEST_PORT_NUMBER: u16 = 1;
pub(crate) const TOP_PORT_NUMBER: u16 = 65535;

/// Number of ports probed at the same time for one target and protocol.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Represents the strategy in which the port scanning will run.
///   - Serial will run from start to end, for example 1 to 1_000.
///   - Random will randomize the order in which ports will be scanned.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanOrder {
    #[default]
    Serial,
    Random,
}

/// How the winner of a discovery phase is chosen when several probes of the
/// same layer report a detection.
///   - RegistryOrder: the detecting probe registered first wins. Probes still
///     run concurrently; the decision waits only for earlier probes.
///   - FirstCompleted: the first detection to arrive wins (race order).
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq, Default)]
pub enum WinnerPolicy {
    #[default]
    RegistryOrder,
    FirstCompleted,
}

/// Transport a port is scanned over and a probe requires.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Which transports a scan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFilter {
    Tcp,
    Udp,
    Both,
}

impl ProtocolFilter {
    /// `tcp_only` and `udp_only` narrow the filter. `tcp_only` wins when both
    /// are set; neither scans both transports.
    pub const fn from_flags(tcp_only: bool, udp_only: bool) -> Self {
        match (tcp_only, udp_only) {
            (true, _) => Self::Tcp,
            (false, true) => Self::Udp,
            (false, false) => Self::Both,
        }
    }

    pub const fn transports(self) -> &'static [Transport] {
        match self {
            Self::Tcp => &[Transport::Tcp],
            Self::Udp => &[Transport::Udp],
            Self::Both => &[Transport::Tcp, Transport::Udp],
        }
    }

    pub fn includes(self, transport: Transport) -> bool {
        self.transports().contains(&transport)
    }
}

/// The set of ports to scan: an explicit list, or every port from 1 to 65535.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    All,
    Explicit(Vec<u16>),
}

impl PortSpec {
    /// An empty list means "all ports".
    pub fn from_ports(ports: Vec<u16>) -> Self {
        if ports.is_empty() {
            Self::All
        } else {
            Self::Explicit(ports)
        }
    }

    /// Parses the positional port arguments. Each argument may itself be a
    /// comma separated list of ports and ranges.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self, ConfigurationError> {
        if args.is_empty() {
            return Ok(Self::All);
        }

        let joined = args
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(",");

        parse_ports_and_ranges(&joined)
            .map(Self::Explicit)
            .map_err(ConfigurationError::InvalidPort)
    }

    pub fn len(&self) -> usize {
        match self {
            Self::All => usize::from(TOP_PORT_NUMBER),
            Self::Explicit(ports) => ports.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type Ports = Vec<u16>;

#[cfg(not(tarpaulin_include))]
pub fn parse_ports_and_ranges(input: &str) -> Result<Ports, String> {
    let mut ports = Vec::new();

    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if part.contains('-') {
            let range_ports = parse_port_range(part)?;
            ports.extend(range_ports);
        } else {
            let port = parse_single_port(part)?;
            ports.push(port);
        }
    }

    if ports.is_empty() {
        return Err(String::from("No valid ports or ranges provided"));
    }

    ports.sort_unstable();
    ports.dedup();

    Ok(ports)
}

fn parse_port_range(range_str: &str) -> Result<Vec<u16>, String> {
    let range_parts: Vec<&str> = range_str.split('-').collect();
    if range_parts.len() != 2 {
        return Err(format!(
            "Invalid range format '{range_str}'. Expected 'start-end'. Example: 1-1000.",
        ));
    }

    let start: u16 = range_parts[0].parse().map_err(|_| {
        format!(
            "Invalid start port '{}' in range '{range_str}'",
            range_parts[0]
        )
    })?;
    let end: u16 = range_parts[1].parse().map_err(|_| {
        format!(
            "Invalid end port '{}' in range '{range_str}'",
            range_parts[1]
        )
    })?;

    if start > end {
        return Err(format!(
            "Start port {start} is greater than end port {end} in range '{range_str}'",
        ));
    }

    if start < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Ports in range '{range_str}' must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok((start..=end).collect())
}

fn parse_single_port(port_str: &str) -> Result<u16, String> {
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("Invalid port number '{port_str}'"))?;

    if port < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Port {port} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok(port)
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "layerscan",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// Finds open ports and fingerprints the services behind them without credentials.
/// Only scan infrastructure you are authorised to assess.
pub struct Opts {
    /// Host, IPv4 address, IPv4 range (10.0.0.1-10.0.0.20 or 10.0.0.1-20) or CIDR to scan.
    pub target: String,

    /// Ports and/or port ranges to scan, e.g. 80 443 or 1-1024,8080. Scans all ports when empty.
    pub ports: Vec<String>,

    /// Scan only TCP ports.
    #[arg(long)]
    pub tcp: bool,

    /// Scan only UDP ports.
    #[arg(long)]
    pub udp: bool,

    /// Output results in JSON format.
    #[arg(long)]
    pub json: bool,

    /// Output file to write results to.
    #[arg(short, long, value_parser)]
    pub output: Option<PathBuf>,

    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,

    /// Greppable mode. Only print results, no status lines.
    #[arg(short, long)]
    pub greppable: bool,

    /// Accessible mode. Turns off features which negatively affect screen readers.
    #[arg(long)]
    pub accessible: bool,

    /// A comma-delimited list or file of DNS resolvers.
    #[arg(long)]
    pub resolver: Option<String>,

    /// How many ports of one target and protocol are probed at the same time.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Upper bound on (target, protocol) scans running at the same time. Unbounded when unset.
    #[arg(long)]
    pub target_concurrency: Option<usize>,

    /// The timeout in milliseconds before a port is assumed to be closed.
    #[arg(short, long, default_value = "1500")]
    pub timeout: u32,

    /// The number of tries before a port is assumed to be closed.
    /// If set to 0, layerscan will correct it to 1.
    #[arg(long, default_value = "1")]
    pub tries: u8,

    /// The timeout in milliseconds allowed to each discovery probe.
    #[arg(long, default_value = "3000")]
    pub probe_timeout: u32,

    /// Wall-clock limit in milliseconds for discovering one port. Ports that
    /// exceed it are dropped from the report.
    #[arg(long)]
    pub discovery_timeout: Option<u32>,

    /// How the winner of a discovery phase is chosen.
    #[arg(long, value_enum, ignore_case = true, default_value = "registry-order")]
    pub winner_policy: WinnerPolicy,

    /// The order of scanning to be performed. The "serial" option will
    /// scan ports in ascending order while the "random" option will scan
    /// ports randomly.
    #[arg(long, value_enum, ignore_case = true, default_value = "serial")]
    pub scan_order: ScanOrder,

    /// Automatically ups the ULIMIT with the value you provided.
    #[arg(short, long)]
    pub ulimit: Option<u64>,

    /// Only report open ports, skip service discovery.
    #[arg(long)]
    pub no_discovery: bool,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    pub fn read() -> Self {
        Self::parse()
    }

    /// Reads the command line arguments into an Opts struct and merge
    /// values found within the user configuration file.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            greppable,
            accessible,
            json,
            concurrency,
            timeout,
            tries,
            probe_timeout,
            winner_policy,
            scan_order
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        // Ports given on the command line always take precedence
        if self.ports.is_empty() {
            if let Some(ports) = &config.ports {
                self.ports = ports.iter().map(u16::to_string).collect();
            }
        }

        merge_optional!(
            resolver,
            ulimit,
            output,
            target_concurrency,
            discovery_timeout
        );
    }

    pub fn port_spec(&self) -> Result<PortSpec, ConfigurationError> {
        PortSpec::parse(&self.ports)
    }

    pub const fn protocol_filter(&self) -> ProtocolFilter {
        ProtocolFilter::from_flags(self.tcp, self.udp)
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            target: String::new(),
            ports: vec![],
            tcp: false,
            udp: false,
            json: false,
            output: None,
            no_config: true,
            config_path: None,
            greppable: true,
            accessible: false,
            resolver: None,
            concurrency: DEFAULT_CONCURRENCY,
            target_concurrency: None,
            timeout: 0,
            tries: 0,
            probe_timeout: 0,
            discovery_timeout: None,
            winner_policy: WinnerPolicy::RegistryOrder,
            scan_order: ScanOrder::Serial,
            ulimit: None,
            no_discovery: false,
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[cfg(not(tarpaulin_include))]
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    ports: Option<Vec<u16>>,
    greppable: Option<bool>,
    accessible: Option<bool>,
    json: Option<bool>,
    output: Option<PathBuf>,
    resolver: Option<String>,
    concurrency: Option<usize>,
    target_concurrency: Option<usize>,
    timeout: Option<u32>,
    tries: Option<u8>,
    probe_timeout: Option<u32>,
    discovery_timeout: Option<u32>,
    winner_policy: Option<WinnerPolicy>,
    scan_order: Option<ScanOrder>,
    ulimit: Option<u64>,
}

#[cfg(not(tarpaulin_include))]
#[allow(clippy::doc_link_with_quotes)]
impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct. A missing file yields an empty configuration.
    ///
    /// # Format
    ///
    /// ports = [80, 443, 6379]
    /// concurrency = 16
    /// probe_timeout = 2000
    /// winner_policy = "RegistryOrder"
    /// scan_order = "Serial"
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> Result<Self, ConfigurationError> {
        let Some(config_path) = custom_config_path.or_else(default_config_path) else {
            return Ok(Self::default());
        };

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content =
            fs::read_to_string(&config_path).map_err(|e| ConfigurationError::ConfigFile {
                path: config_path.display().to_string(),
                reason: e.to_string(),
            })?;

        toml::from_str(&content).map_err(|e| ConfigurationError::ConfigFile {
            path: config_path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> Option<PathBuf> {
    let mut config_path = dirs::home_dir()?;
    config_path.push(".layerscan.toml");
    Some(config_path)
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use parameterized::parameterized;

    use super::{
        parse_ports_and_ranges, Config, Opts, PortSpec, ProtocolFilter, ScanOrder, Transport,
        WinnerPolicy,
    };

    impl Config {
        fn sample() -> Self {
            Self {
                ports: Some(vec![6379, 9200]),
                greppable: Some(false),
                accessible: Some(true),
                json: Some(true),
                output: None,
                resolver: None,
                concurrency: Some(32),
                target_concurrency: None,
                timeout: Some(1_000),
                tries: Some(2),
                probe_timeout: Some(750),
                discovery_timeout: None,
                winner_policy: Some(WinnerPolicy::FirstCompleted),
                scan_order: Some(ScanOrder::Random),
                ulimit: None,
            }
        }
    }

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[parameterized(input = {
        vec!["layerscan", "10.0.0.1"],
        vec!["layerscan", "--tcp", "10.0.0.1", "80", "443"],
        vec!["layerscan", "--udp", "10.0.0.1-20", "53"],
        vec!["layerscan", "--tcp", "--udp", "example.com", "1-1024,8080"],
    }, filter = {
        ProtocolFilter::Both,
        ProtocolFilter::Tcp,
        ProtocolFilter::Udp,
        ProtocolFilter::Both,
    }, ports = {
        0,
        2,
        1,
        1025,
    })]
    fn parse_positional_target_and_ports(input: Vec<&str>, filter: ProtocolFilter, ports: usize) {
        let opts = Opts::parse_from(input);
        let spec = opts.port_spec().unwrap();

        assert_eq!(opts.protocol_filter(), filter);
        match spec {
            PortSpec::All => assert_eq!(ports, 0),
            PortSpec::Explicit(list) => assert_eq!(list.len(), ports),
        }
    }

    #[test]
    fn winner_policy_is_parsed_from_the_command_line() {
        let opts = Opts::parse_from(["layerscan", "--winner-policy", "first-completed", "::"]);
        assert_eq!(opts.winner_policy, WinnerPolicy::FirstCompleted);

        let opts = Opts::parse_from(["layerscan", "127.0.0.1"]);
        assert_eq!(opts.winner_policy, WinnerPolicy::RegistryOrder);
    }

    #[test]
    fn opts_no_merge_when_config_is_ignored() {
        let mut opts = Opts::default();
        let config = Config::sample();

        opts.merge(&config);

        assert!(opts.ports.is_empty());
        assert!(opts.greppable);
        assert_eq!(opts.timeout, 0);
        assert_eq!(opts.scan_order, ScanOrder::Serial);
        assert_eq!(opts.winner_policy, WinnerPolicy::RegistryOrder);
    }

    #[test]
    fn opts_merge_required_arguments() {
        let mut opts = Opts::default();
        let config = Config::sample();

        opts.merge_required(&config);

        assert_eq!(opts.greppable, config.greppable.unwrap());
        assert_eq!(opts.accessible, config.accessible.unwrap());
        assert_eq!(opts.concurrency, config.concurrency.unwrap());
        assert_eq!(opts.timeout, config.timeout.unwrap());
        assert_eq!(opts.probe_timeout, config.probe_timeout.unwrap());
        assert_eq!(opts.winner_policy, config.winner_policy.unwrap());
        assert_eq!(opts.scan_order, config.scan_order.unwrap());
    }

    #[test]
    fn opts_merge_optional_arguments() {
        let mut opts = Opts::default();
        let mut config = Config::sample();
        config.ulimit = Some(1_000);
        config.resolver = Some("1.1.1.1".to_owned());
        config.discovery_timeout = Some(10_000);

        opts.merge_optional(&config);

        assert_eq!(opts.ports, vec!["6379".to_owned(), "9200".to_owned()]);
        assert_eq!(opts.ulimit, config.ulimit);
        assert_eq!(opts.resolver, config.resolver);
        assert_eq!(opts.discovery_timeout, Some(10_000));
    }

    #[test]
    fn command_line_ports_win_over_config_ports() {
        let mut opts = Opts {
            ports: vec!["22".to_owned()],
            ..Opts::default()
        };

        opts.merge_optional(&Config::sample());

        assert_eq!(opts.ports, vec!["22".to_owned()]);
    }

    #[test]
    fn config_reads_toml() {
        let config: Config = toml::from_str(
            "ports = [80, 443]\nwinner_policy = \"FirstCompleted\"\nconcurrency = 4\n",
        )
        .unwrap();

        assert_eq!(config.ports, Some(vec![80, 443]));
        assert_eq!(config.winner_policy, Some(WinnerPolicy::FirstCompleted));
        assert_eq!(config.concurrency, Some(4));
    }

    #[test]
    fn missing_config_file_is_empty_config() {
        let config = Config::read(Some("/nonexistent/layerscan.toml".into())).unwrap();
        assert!(config.ports.is_none());
    }

    #[test]
    fn protocol_filter_narrows_transports() {
        assert_eq!(ProtocolFilter::from_flags(true, false).transports(), &[Transport::Tcp]);
        assert_eq!(ProtocolFilter::from_flags(false, true).transports(), &[Transport::Udp]);
        assert_eq!(ProtocolFilter::from_flags(true, true).transports(), &[Transport::Tcp]);
        assert_eq!(
            ProtocolFilter::from_flags(false, false).transports(),
            &[Transport::Tcp, Transport::Udp]
        );
        assert!(!ProtocolFilter::Tcp.includes(Transport::Udp));
    }

    #[test]
    fn empty_port_list_means_all_ports() {
        assert_eq!(PortSpec::from_ports(vec![]), PortSpec::All);
        assert_eq!(PortSpec::parse::<&str>(&[]).unwrap().len(), 65535);
        assert!(PortSpec::parse(&["80", "abc"]).is_err());
    }

    #[parameterized(
        input = {"80", "80,443,1-3,8080", "22, 6379, 9200-9201", "6379,6379,22"},
        expected = {vec![80], vec![1, 2, 3, 80, 443, 8080], vec![22, 6379, 9200, 9201], vec![22, 6379]}
    )]
    fn port_lists_are_sorted_and_deduplicated(input: &str, expected: Vec<u16>) {
        assert_eq!(parse_ports_and_ranges(input), Ok(expected));
    }

    #[parameterized(
        input = {"", "80,1-abc", "9201-9200", "6379,70000", "0,22"},
        message = {
            "No valid ports or ranges provided",
            "Invalid end port 'abc'",
            "Start port 9201 is greater than end port 9200",
            "Invalid port number '70000'",
            "Port 0 must be between 1 and 65535"
        }
    )]
    fn bad_port_lists_explain_themselves(input: &str, message: &str) {
        let err = parse_ports_and_ranges(input).unwrap_err();
        assert!(err.contains(message), "{err}");
    }
}
