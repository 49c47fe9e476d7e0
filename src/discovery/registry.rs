//! Immutable, ordered collection of the probes the orchestrator runs.
//!
//! Registration order matters: under [`WinnerPolicy::RegistryOrder`] the
//! earliest registered probe that detects wins its phase.
//!
//! [`WinnerPolicy::RegistryOrder`]: crate::input::WinnerPolicy::RegistryOrder
use std::sync::Arc;

use itertools::Itertools;

use super::probe::{ApplicationProbe, PresentationProbe, SessionProbe};
use crate::error::ConfigurationError;
use crate::input::Transport;

/// A probe together with the transport it needs.
pub struct ProbeDescriptor<P: ?Sized> {
    probe: Arc<P>,
    transport: Transport,
}

impl<P: ?Sized> ProbeDescriptor<P> {
    pub const fn new(probe: Arc<P>, transport: Transport) -> Self {
        Self { probe, transport }
    }

    pub const fn probe(&self) -> &Arc<P> {
        &self.probe
    }

    pub const fn required_transport(&self) -> Transport {
        self.transport
    }
}

pub struct ProbeRegistry {
    session: Vec<ProbeDescriptor<dyn SessionProbe>>,
    presentation: Vec<ProbeDescriptor<dyn PresentationProbe>>,
    application: Vec<ProbeDescriptor<dyn ApplicationProbe>>,
}

impl ProbeRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn session_probes(
        &self,
        transport: Transport,
    ) -> impl Iterator<Item = &Arc<dyn SessionProbe>> {
        matching(&self.session, transport)
    }

    pub fn presentation_probes(
        &self,
        transport: Transport,
    ) -> impl Iterator<Item = &Arc<dyn PresentationProbe>> {
        matching(&self.presentation, transport)
    }

    pub fn application_probes(
        &self,
        transport: Transport,
    ) -> impl Iterator<Item = &Arc<dyn ApplicationProbe>> {
        matching(&self.application, transport)
    }

    /// Protocol names per layer, in registration order.
    pub fn protocols(&self) -> (Vec<&str>, Vec<&str>, Vec<&str>) {
        (
            self.session.iter().map(|d| d.probe.protocol()).collect(),
            self.presentation.iter().map(|d| d.probe.protocol()).collect(),
            self.application.iter().map(|d| d.probe.protocol()).collect(),
        )
    }
}

fn matching<P: ?Sized>(
    descriptors: &[ProbeDescriptor<P>],
    transport: Transport,
) -> impl Iterator<Item = &Arc<P>> {
    descriptors
        .iter()
        .filter(move |d| d.required_transport() == transport)
        .map(ProbeDescriptor::probe)
}

#[derive(Default)]
pub struct RegistryBuilder {
    session: Vec<ProbeDescriptor<dyn SessionProbe>>,
    presentation: Vec<ProbeDescriptor<dyn PresentationProbe>>,
    application: Vec<ProbeDescriptor<dyn ApplicationProbe>>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn session<P: SessionProbe + 'static>(mut self, probe: P, transport: Transport) -> Self {
        let probe: Arc<dyn SessionProbe> = Arc::new(probe);
        self.session.push(ProbeDescriptor::new(probe, transport));
        self
    }

    #[must_use]
    pub fn presentation<P: PresentationProbe + 'static>(
        mut self,
        probe: P,
        transport: Transport,
    ) -> Self {
        let probe: Arc<dyn PresentationProbe> = Arc::new(probe);
        self.presentation.push(ProbeDescriptor::new(probe, transport));
        self
    }

    #[must_use]
    pub fn application<P: ApplicationProbe + 'static>(
        mut self,
        probe: P,
        transport: Transport,
    ) -> Self {
        let probe: Arc<dyn ApplicationProbe> = Arc::new(probe);
        self.application.push(ProbeDescriptor::new(probe, transport));
        self
    }

    /// Freezes the registry. Two probes of one layer may not share a
    /// protocol name on the same transport.
    pub fn build(self) -> Result<ProbeRegistry, ConfigurationError> {
        check_unique(
            "session",
            self.session.iter().map(|d| (d.probe.protocol(), d.transport)),
        )?;
        check_unique(
            "presentation",
            self.presentation
                .iter()
                .map(|d| (d.probe.protocol(), d.transport)),
        )?;
        check_unique(
            "application",
            self.application
                .iter()
                .map(|d| (d.probe.protocol(), d.transport)),
        )?;

        Ok(ProbeRegistry {
            session: self.session,
            presentation: self.presentation,
            application: self.application,
        })
    }
}

fn check_unique<'a>(
    layer: &'static str,
    entries: impl Iterator<Item = (&'a str, Transport)>,
) -> Result<(), ConfigurationError> {
    let duplicate = entries.duplicates().next();

    match duplicate {
        Some((name, _)) => Err(ConfigurationError::DuplicateProbe {
            layer,
            protocol: name.to_owned(),
        }),
        None => Ok(()),
    }
}
