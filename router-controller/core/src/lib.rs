#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod endpoint_id;
pub mod plugin;
pub mod routing;
pub mod status;

pub use self::{
    endpoint_id::endpoint_id,
    plugin::{EventType, Namespaces, Plugin},
    routing::{
        Endpoint, ServiceAliasConfig, ServiceAliasConfigKey, ServiceUnit, ServiceUnitKey,
        TlsSettings,
    },
    status::{LogRejections, RouteStatusRecorder, SharedRecorder},
};

use router_controller_k8s_api::{Resource, ResourceExt};
use std::fmt;

pub const ROUTER_CONTROLLER_NAME: &str = "router-controller";

/// Identifies a namespaced resource.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Builds the identity of a namespaced resource. Resources without a
    /// namespace are attributed to the empty namespace.
    pub fn of<T: Resource>(resource: &T) -> Self {
        Self {
            namespace: resource.namespace().unwrap_or_default(),
            name: resource.name_any(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
