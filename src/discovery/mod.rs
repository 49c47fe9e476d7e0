//! Layered service discovery for a single open port.
//!
//! Discovery is a cascade of three phases, run strictly in order:
//!
//! 1. **session**: every session probe for the port's transport races to
//!    detect the wrapper protocol (TLS, plain TCP). Without a winner the
//!    cascade stops and the result is empty.
//! 2. **presentation**: probes look for a framing protocol such as HTTP on
//!    top of the winning session.
//! 3. **application**: probes identify the service itself, with the
//!    presentation winner (if any) as context. This phase runs whenever a
//!    session was accepted.
//!
//! Within a phase all probes run concurrently and the winner is picked
//! according to [`WinnerPolicy`]. Each probe is bounded by the configured
//! probe timeout, and losing probes are aborted as soon as the winner is
//! known. Presentation and application probes each receive their own
//! detached [`SessionHandle`], so no socket is ever shared between tasks.
//!
//! Probe failures never escape a phase: they are logged and counted as "not
//! detected". The only error [`Discoverer::discover`] returns is a
//! [`ConfigurationError`] for an endpoint that cannot be probed at all.
pub mod probe;
pub mod registry;
mod race;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, warn};
use serde::Serialize;

use crate::error::ConfigurationError;
use crate::input::{Transport, WinnerPolicy};
use crate::session::SessionHandle;
use probe::{ApplicationDiscovery, Detection, PresentationDiscovery, SessionDiscovery};
use race::{race, ProbeTask};
pub use probe::Properties;
pub use registry::ProbeRegistry;

/// Default time a single probe may take before it is abandoned.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryOptions {
    pub probe_timeout: Duration,
    pub policy: WinnerPolicy,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            policy: WinnerPolicy::RegistryOrder,
        }
    }
}

/// The protocol stack detected on one port.
///
/// `is_authenticated` is true when the detected service requires credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryResult {
    pub session_layer: String,
    pub presentation_layer: String,
    pub application_layer: String,
    pub is_authenticated: bool,
    pub properties: Properties,
}

/// How far the cascade got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NoSession,
    SessionOnly,
    Presentation,
    Application,
}

impl DiscoveryResult {
    pub fn outcome(&self) -> Outcome {
        if !self.application_layer.is_empty() {
            Outcome::Application
        } else if !self.presentation_layer.is_empty() {
            Outcome::Presentation
        } else if !self.session_layer.is_empty() {
            Outcome::SessionOnly
        } else {
            Outcome::NoSession
        }
    }
}

/// Runs the discovery cascade against endpoints using a fixed registry.
pub struct Discoverer {
    registry: Arc<ProbeRegistry>,
    options: DiscoveryOptions,
}

impl Discoverer {
    pub const fn new(registry: Arc<ProbeRegistry>, options: DiscoveryOptions) -> Self {
        Self { registry, options }
    }

    pub const fn options(&self) -> DiscoveryOptions {
        self.options
    }

    /// Discovers the protocol stack of a TCP port.
    pub async fn discover(
        &self,
        host: &str,
        port: u16,
    ) -> Result<DiscoveryResult, ConfigurationError> {
        self.discover_on(host, port, Transport::Tcp).await
    }

    /// Discovers the protocol stack of a port using the probes registered for
    /// `transport`.
    pub async fn discover_on(
        &self,
        host: &str,
        port: u16,
        transport: Transport,
    ) -> Result<DiscoveryResult, ConfigurationError> {
        if port == 0 || host.trim().is_empty() {
            return Err(ConfigurationError::InvalidEndpoint {
                host: host.to_owned(),
                port,
            });
        }

        let endpoint = format!("{host}:{port}/{transport}");
        let mut result = DiscoveryResult::default();

        let Some(mut session) = self.session_phase(host, port, transport, &endpoint).await else {
            debug!("{endpoint}: no session protocol detected");
            return Ok(result);
        };
        result.session_layer = session.protocol().to_owned();

        let mut handle = match session.session_handler() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("{endpoint}: {} session unusable: {e}", result.session_layer);
                return Ok(result);
            }
        };

        let presentation = self.presentation_phase(&handle, transport, &endpoint).await;
        if let Some(found) = &presentation {
            result.presentation_layer = found.protocol().to_owned();
        }

        let application = self
            .application_phase(&handle, transport, presentation.map(Arc::new), &endpoint)
            .await;
        if let Some(found) = application {
            result.application_layer = found.protocol().to_owned();
            result.is_authenticated = found.is_auth_required();
            result.properties = found.into_properties();
        }

        handle.destroy();
        debug!("{endpoint}: {:?}", result.outcome());
        Ok(result)
    }

    async fn session_phase(
        &self,
        host: &str,
        port: u16,
        transport: Transport,
        endpoint: &str,
    ) -> Option<SessionDiscovery> {
        let tasks: Vec<ProbeTask<SessionDiscovery>> = self
            .registry
            .session_probes(transport)
            .map(|probe| {
                let probe = Arc::clone(probe);
                let host = host.to_owned();
                let name = probe.protocol().to_owned();
                let task = async move { probe.session_layer_discover(&host, port).await };
                (name, task.boxed())
            })
            .collect();

        self.race("session", endpoint, tasks).await
    }

    async fn presentation_phase(
        &self,
        session: &SessionHandle,
        transport: Transport,
        endpoint: &str,
    ) -> Option<PresentationDiscovery> {
        let tasks: Vec<ProbeTask<PresentationDiscovery>> = self
            .registry
            .presentation_probes(transport)
            .map(|probe| {
                let probe = Arc::clone(probe);
                let mut own = session.detached();
                let name = probe.protocol().to_owned();
                let task = async move {
                    let found = probe.discover(&mut own).await;
                    own.destroy();
                    found
                };
                (name, task.boxed())
            })
            .collect();

        self.race("presentation", endpoint, tasks).await
    }

    async fn application_phase(
        &self,
        session: &SessionHandle,
        transport: Transport,
        presentation: Option<Arc<PresentationDiscovery>>,
        endpoint: &str,
    ) -> Option<ApplicationDiscovery> {
        let tasks: Vec<ProbeTask<ApplicationDiscovery>> = self
            .registry
            .application_probes(transport)
            .map(|probe| {
                let probe = Arc::clone(probe);
                let mut own = session.detached();
                let context = presentation.clone();
                let name = probe.protocol().to_owned();
                let task = async move {
                    let found = probe.discover(&mut own, context.as_deref()).await;
                    own.destroy();
                    found
                };
                (name, task.boxed())
            })
            .collect();

        self.race("application", endpoint, tasks).await
    }

    async fn race<T>(&self, phase: &'static str, endpoint: &str, tasks: Vec<ProbeTask<T>>) -> Option<T>
    where
        T: Detection + Send + 'static,
    {
        if tasks.is_empty() {
            return None;
        }
        race(
            phase,
            endpoint,
            self.options.policy,
            self.options.probe_timeout,
            tasks,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::probe::{ApplicationProbe, PresentationProbe, SessionProbe};
    use crate::error::ProbeError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSession {
        name: &'static str,
        detect: bool,
    }

    #[async_trait]
    impl SessionProbe for FakeSession {
        fn protocol(&self) -> &str {
            self.name
        }

        async fn session_layer_discover(
            &self,
            host: &str,
            port: u16,
        ) -> Result<SessionDiscovery, ProbeError> {
            if self.detect {
                Ok(SessionDiscovery::detected(self.name, SessionHandle::plain(host, port)))
            } else {
                Ok(SessionDiscovery::not_detected(self.name))
            }
        }
    }

    struct FakeFraming;

    #[async_trait]
    impl PresentationProbe for FakeFraming {
        fn protocol(&self) -> &str {
            "framing"
        }

        async fn discover(
            &self,
            _session: &mut SessionHandle,
        ) -> Result<PresentationDiscovery, ProbeError> {
            Ok(PresentationDiscovery::detected("framing"))
        }
    }

    struct FakeApp {
        name: &'static str,
        needs_framing: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ApplicationProbe for FakeApp {
        fn protocol(&self) -> &str {
            self.name
        }

        async fn discover(
            &self,
            _session: &mut SessionHandle,
            presentation: Option<&PresentationDiscovery>,
        ) -> Result<ApplicationDiscovery, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.needs_framing && presentation.is_none() {
                return Ok(ApplicationDiscovery::not_detected(self.name));
            }
            Ok(ApplicationDiscovery::detected(self.name, true).with_property("by", self.name))
        }
    }

    fn discoverer(registry: ProbeRegistry) -> Discoverer {
        Discoverer::new(Arc::new(registry), DiscoveryOptions::default())
    }

    #[tokio::test]
    async fn no_session_stops_the_cascade() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ProbeRegistry::builder()
            .session(FakeSession { name: "tcp", detect: false }, Transport::Tcp)
            .application(
                FakeApp { name: "app", needs_framing: false, calls: Arc::clone(&calls) },
                Transport::Tcp,
            )
            .build()
            .unwrap();

        let result = discoverer(registry).discover("127.0.0.1", 9000).await.unwrap();

        assert_eq!(result, DiscoveryResult::default());
        assert_eq!(result.outcome(), Outcome::NoSession);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn application_runs_without_presentation_winner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ProbeRegistry::builder()
            .session(FakeSession { name: "tcp", detect: true }, Transport::Tcp)
            .application(
                FakeApp { name: "app", needs_framing: false, calls: Arc::clone(&calls) },
                Transport::Tcp,
            )
            .build()
            .unwrap();

        let result = discoverer(registry).discover("127.0.0.1", 9000).await.unwrap();

        assert_eq!(result.session_layer, "tcp");
        assert_eq!(result.presentation_layer, "");
        assert_eq!(result.application_layer, "app");
        assert!(result.is_authenticated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn presentation_winner_is_passed_to_application_probes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ProbeRegistry::builder()
            .session(FakeSession { name: "tcp", detect: true }, Transport::Tcp)
            .presentation(FakeFraming, Transport::Tcp)
            .application(
                FakeApp { name: "framed", needs_framing: true, calls: Arc::clone(&calls) },
                Transport::Tcp,
            )
            .build()
            .unwrap();

        let result = discoverer(registry).discover("127.0.0.1", 9000).await.unwrap();

        assert_eq!(result.presentation_layer, "framing");
        assert_eq!(result.application_layer, "framed");
        assert_eq!(result.outcome(), Outcome::Application);
    }

    #[tokio::test]
    async fn session_registry_order_decides_between_two_detections() {
        let registry = ProbeRegistry::builder()
            .session(FakeSession { name: "tls", detect: true }, Transport::Tcp)
            .session(FakeSession { name: "tcp", detect: true }, Transport::Tcp)
            .build()
            .unwrap();

        let result = discoverer(registry).discover("127.0.0.1", 9000).await.unwrap();
        assert_eq!(result.session_layer, "tls");
        assert_eq!(result.outcome(), Outcome::SessionOnly);
    }

    #[tokio::test]
    async fn udp_ports_only_use_udp_probes() {
        let registry = ProbeRegistry::builder()
            .session(FakeSession { name: "tcp", detect: true }, Transport::Tcp)
            .build()
            .unwrap();

        let result = discoverer(registry)
            .discover_on("127.0.0.1", 53, Transport::Udp)
            .await
            .unwrap();
        assert_eq!(result.outcome(), Outcome::NoSession);
    }

    #[tokio::test]
    async fn unaddressable_endpoints_are_configuration_errors() {
        let registry = ProbeRegistry::builder().build().unwrap();
        let discoverer = discoverer(registry);

        assert!(matches!(
            discoverer.discover("127.0.0.1", 0).await,
            Err(ConfigurationError::InvalidEndpoint { port: 0, .. })
        ));
        assert!(discoverer.discover("  ", 80).await.is_err());
    }
}
