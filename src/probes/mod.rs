//! Built-in probes and the default registry.
//!
//! Registration order is the priority order under
//! [`WinnerPolicy::RegistryOrder`](crate::input::WinnerPolicy::RegistryOrder):
//!
//! | layer | probes |
//! |---|---|
//! | session | `tls`, `tcp` |
//! | presentation | `http` |
//! | application | `kubernetes-api`, `elasticsearch`, `etcd`, `mysql`, `postgresql`, `redis`, `mongodb`, `rabbitmq`, `kafka`, `cassandra` |
//!
//! TLS is tried before plain TCP, so a port that completes a handshake is
//! reported as `tls`. The HTTP based application probes stay silent unless
//! HTTP was detected.
pub mod cassandra;
pub mod elasticsearch;
pub mod etcd;
pub mod http;
pub mod kafka;
pub mod kubernetes;
pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod rabbitmq;
pub mod redis;
pub mod session;
pub(crate) mod wire;

use std::time::Duration;

use crate::discovery::ProbeRegistry;
use crate::error::ConfigurationError;
use crate::input::Transport;

pub use cassandra::CassandraProbe;
pub use elasticsearch::ElasticsearchProbe;
pub use etcd::EtcdProbe;
pub use http::HttpPresentationProbe;
pub use kafka::KafkaProbe;
pub use kubernetes::KubernetesApiProbe;
pub use mongodb::MongodbProbe;
pub use mysql::MysqlProbe;
pub use postgres::PostgresProbe;
pub use rabbitmq::RabbitmqProbe;
pub use redis::RedisProbe;
pub use session::{TcpSessionProbe, TlsSessionProbe};

/// The registry used by the command line tool. `io_timeout` bounds each
/// connect and handshake of the session probes and is inherited by every
/// session handle they hand out.
pub fn default_registry(io_timeout: Duration) -> Result<ProbeRegistry, ConfigurationError> {
    ProbeRegistry::builder()
        .session(TlsSessionProbe::new(io_timeout), Transport::Tcp)
        .session(TcpSessionProbe::new(io_timeout), Transport::Tcp)
        .presentation(HttpPresentationProbe, Transport::Tcp)
        .application(KubernetesApiProbe, Transport::Tcp)
        .application(ElasticsearchProbe, Transport::Tcp)
        .application(EtcdProbe, Transport::Tcp)
        .application(MysqlProbe, Transport::Tcp)
        .application(PostgresProbe, Transport::Tcp)
        .application(RedisProbe, Transport::Tcp)
        .application(MongodbProbe, Transport::Tcp)
        .application(RabbitmqProbe, Transport::Tcp)
        .application(KafkaProbe, Transport::Tcp)
        .application(CassandraProbe, Transport::Tcp)
        .build()
}
