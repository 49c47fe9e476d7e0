//! Probe contract for the three discovery layers and their result types.
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProbeError;
use crate::session::SessionHandle;

/// Free-form facts a probe learned about the service.
pub type Properties = BTreeMap<String, Value>;

/// Common view over every layer's result.
pub trait Detection {
    fn protocol(&self) -> &str;
    fn is_detected(&self) -> bool;
    fn properties(&self) -> &Properties;
}

/// Outcome of a session probe. When detected it carries the handle the rest
/// of the cascade will use.
#[derive(Debug)]
pub struct SessionDiscovery {
    protocol: String,
    detected: bool,
    properties: Properties,
    handle: Option<SessionHandle>,
}

impl SessionDiscovery {
    pub fn detected(protocol: impl Into<String>, handle: SessionHandle) -> Self {
        Self {
            protocol: protocol.into(),
            detected: true,
            properties: Properties::new(),
            handle: Some(handle),
        }
    }

    pub fn not_detected(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            detected: false,
            properties: Properties::new(),
            handle: None,
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Hands the session over to the caller. Fails when nothing was detected
    /// or the handle was already taken.
    pub fn session_handler(&mut self) -> Result<SessionHandle, ProbeError> {
        self.handle.take().ok_or_else(|| {
            ProbeError::Malformed(format!("{} session has no handle", self.protocol))
        })
    }
}

impl Detection for SessionDiscovery {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn is_detected(&self) -> bool {
        self.detected
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresentationDiscovery {
    protocol: String,
    detected: bool,
    properties: Properties,
}

impl PresentationDiscovery {
    pub fn detected(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            detected: true,
            properties: Properties::new(),
        }
    }

    pub fn not_detected(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            detected: false,
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl Detection for PresentationDiscovery {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn is_detected(&self) -> bool {
        self.detected
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationDiscovery {
    protocol: String,
    detected: bool,
    auth_required: bool,
    properties: Properties,
}

impl ApplicationDiscovery {
    pub fn detected(protocol: impl Into<String>, auth_required: bool) -> Self {
        Self {
            protocol: protocol.into(),
            detected: true,
            auth_required,
            properties: Properties::new(),
        }
    }

    pub fn not_detected(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            detected: false,
            auth_required: false,
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub const fn is_auth_required(&self) -> bool {
        self.auth_required
    }

    pub fn into_properties(self) -> Properties {
        self.properties
    }
}

impl Detection for ApplicationDiscovery {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn is_detected(&self) -> bool {
        self.detected
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }
}

/// Detects the wrapper protocol (plain TCP, TLS, ...) of an endpoint.
///
/// Implementations open and close their own connection. A peer that does not
/// speak the protocol is `Ok(not_detected)`; `Err` is reserved for failures
/// such as an unreachable endpoint, and is treated the same way by the caller.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    fn protocol(&self) -> &str;

    async fn session_layer_discover(
        &self,
        host: &str,
        port: u16,
    ) -> Result<SessionDiscovery, ProbeError>;
}

/// Detects a framing protocol on top of an established session.
///
/// The handle is exclusively owned by this probe for the call and connects on
/// first use.
#[async_trait]
pub trait PresentationProbe: Send + Sync {
    fn protocol(&self) -> &str;

    async fn discover(
        &self,
        session: &mut SessionHandle,
    ) -> Result<PresentationDiscovery, ProbeError>;
}

/// Identifies the service and whether it asks for credentials.
#[async_trait]
pub trait ApplicationProbe: Send + Sync {
    fn protocol(&self) -> &str;

    async fn discover(
        &self,
        session: &mut SessionHandle,
        presentation: Option<&PresentationDiscovery>,
    ) -> Result<ApplicationDiscovery, ProbeError>;
}
