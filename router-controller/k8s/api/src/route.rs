use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Annotation holding the path that replaces a route's path prefix before the
/// request is forwarded to the backend.
pub const REWRITE_TARGET_ANNOTATION: &str = "haproxy.router.openshift.io/rewrite-target";

/// The weight given to a backend that does not specify one.
pub const DEFAULT_WEIGHT: u32 = 100;

/// The largest weight the proxy accepts for a backend.
pub const MAX_WEIGHT: u32 = 256;

/// Exposes a service at a host name, optionally restricted to a path prefix.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    status = "RouteStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    pub to: RouteTargetReference,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_backends: Vec<RouteTargetReference>,

    pub port: Option<RoutePort>,

    pub tls: Option<TlsConfig>,
}

/// References a backend service and the share of traffic it receives.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteTargetReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub name: String,
    pub weight: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutePort {
    pub target_port: TargetPort,
}

/// References a service port by name or number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum TargetPort {
    Number(i32),
    Name(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub termination: String,
    pub certificate: Option<String>,
    pub key: Option<String>,
    pub ca_certificate: Option<String>,
    #[serde(rename = "destinationCACertificate")]
    pub destination_ca_certificate: Option<String>,
    pub insecure_edge_termination_policy: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsTermination {
    Edge,
    Passthrough,
    Reencrypt,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid TLS termination {0:?}: must be one of edge, passthrough, reencrypt")]
pub struct InvalidTermination(pub String);

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<RouteIngress>,
}

/// Describes the state of a route as observed by one router.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteIngress {
    pub host: Option<String>,
    pub router_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RouteIngressCondition>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteIngressCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub last_transition_time: Option<Time>,
}

// === impl Route ===

impl Route {
    /// Returns the rewrite target configured by annotation, if any.
    pub fn rewrite_target(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()?
            .get(REWRITE_TARGET_ANNOTATION)
            .map(String::as_str)
    }

    /// Iterates over all backends referenced by the route, starting with the
    /// primary target.
    pub fn backends(&self) -> impl Iterator<Item = &RouteTargetReference> {
        std::iter::once(&self.spec.to).chain(self.spec.alternate_backends.iter())
    }
}

// === impl RouteTargetReference ===

impl RouteTargetReference {
    /// The backend's weight, clamped to the range accepted by the proxy.
    pub fn weight(&self) -> u32 {
        match self.weight {
            None => DEFAULT_WEIGHT,
            Some(w) if w <= 0 => 0,
            Some(w) => (w as u32).min(MAX_WEIGHT),
        }
    }

    pub fn is_service(&self) -> bool {
        self.kind.is_empty() || self.kind == "Service"
    }
}

// === impl TargetPort ===

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPort::Number(n) => fmt::Display::fmt(n, f),
            TargetPort::Name(n) => fmt::Display::fmt(n, f),
        }
    }
}

// === impl TlsConfig ===

impl TlsConfig {
    pub fn termination(&self) -> Result<TlsTermination, InvalidTermination> {
        self.termination.parse()
    }

    pub fn certificate(&self) -> Option<&str> {
        non_empty(&self.certificate)
    }

    pub fn key(&self) -> Option<&str> {
        non_empty(&self.key)
    }

    pub fn ca_certificate(&self) -> Option<&str> {
        non_empty(&self.ca_certificate)
    }

    pub fn destination_ca_certificate(&self) -> Option<&str> {
        non_empty(&self.destination_ca_certificate)
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

// === impl TlsTermination ===

impl FromStr for TlsTermination {
    type Err = InvalidTermination;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edge" => Ok(Self::Edge),
            "passthrough" => Ok(Self::Passthrough),
            "reencrypt" => Ok(Self::Reencrypt),
            s => Err(InvalidTermination(s.to_string())),
        }
    }
}

impl fmt::Display for TlsTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Edge => "edge".fmt(f),
            Self::Passthrough => "passthrough".fmt(f),
            Self::Reencrypt => "reencrypt".fmt(f),
        }
    }
}
