use crate::ResourceId;
use chrono::{DateTime, Utc};
use router_controller_k8s_api::{
    InvalidTermination, ResourceExt, Route, TlsConfig, TlsTermination, Time,
};
use std::{collections::BTreeMap, fmt};

/// Identifies a backend service as `namespace/service`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceUnitKey(String);

/// A backend service and its current endpoint table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceUnit {
    pub name: ServiceUnitKey,
    pub endpoints: Vec<Endpoint>,
}

/// A single address that can serve traffic for a service port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub port_name: String,
    pub target_name: String,

    /// A stable digest of the endpoint, used as the proxy's server name.
    pub id_hash: String,
}

/// Identifies the configuration of a host and path, as `host:path`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceAliasConfigKey(String);

/// The admitted configuration of a route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAliasConfig {
    pub route: ResourceId,
    pub route_uid: Option<String>,
    pub host: String,
    pub path: String,
    pub creation_timestamp: DateTime<Utc>,
    pub tls: Option<TlsSettings>,
    pub rewrite_target: Option<String>,

    /// Backends and their weights.
    pub service_units: BTreeMap<ServiceUnitKey, u32>,

    /// The service port the route targets, by name or number. When unset, all
    /// ports are served.
    pub preferred_port: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSettings {
    pub termination: TlsTermination,
    pub certificate: Option<String>,
    pub key: Option<String>,
    pub ca_certificate: Option<String>,
    pub destination_ca_certificate: Option<String>,
    pub insecure_edge_termination_policy: Option<String>,
}

/// Returns the time a route was created. Routes without a timestamp are
/// treated as the oldest possible.
pub fn creation_timestamp(route: &Route) -> DateTime<Utc> {
    match route.metadata.creation_timestamp {
        Some(Time(t)) => t,
        None => DateTime::<Utc>::MIN_UTC,
    }
}

// === impl ServiceUnitKey ===

impl ServiceUnitKey {
    pub fn from_parts(namespace: &str, service: &str) -> Self {
        Self(format!("{namespace}/{service}"))
    }

    /// Splits the key into its namespace and service name.
    pub fn parts(&self) -> (&str, &str) {
        self.0.split_once('/').unwrap_or(("", &self.0))
    }

    pub fn namespace(&self) -> &str {
        self.parts().0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceUnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl ServiceUnit ===

impl ServiceUnit {
    pub fn new(name: ServiceUnitKey) -> Self {
        Self {
            name,
            endpoints: Vec::new(),
        }
    }
}

// === impl ServiceAliasConfigKey ===

impl ServiceAliasConfigKey {
    pub fn new(host: &str, path: &str) -> Self {
        Self(format!("{host}:{path}"))
    }

    pub fn for_route(route: &Route) -> Self {
        Self::new(&route.spec.host, &route.spec.path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceAliasConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl ServiceAliasConfig ===

impl ServiceAliasConfig {
    /// Builds the configuration admitted for a route.
    pub fn from_route(route: &Route) -> Result<Self, InvalidTermination> {
        let id = ResourceId::of(route);
        let tls = route
            .spec
            .tls
            .as_ref()
            .map(TlsSettings::try_from)
            .transpose()?;

        let service_units = route
            .backends()
            .filter(|backend| backend.is_service() && !backend.name.is_empty())
            .map(|backend| {
                (
                    ServiceUnitKey::from_parts(&id.namespace, &backend.name),
                    backend.weight(),
                )
            })
            .collect();

        Ok(Self {
            route_uid: route.uid(),
            host: route.spec.host.clone(),
            path: route.spec.path.clone(),
            creation_timestamp: creation_timestamp(route),
            tls,
            rewrite_target: route.rewrite_target().map(ToString::to_string),
            service_units,
            preferred_port: route
                .spec
                .port
                .as_ref()
                .map(|p| p.target_port.to_string()),
            route: id,
        })
    }

    pub fn key(&self) -> ServiceAliasConfigKey {
        ServiceAliasConfigKey::new(&self.host, &self.path)
    }

    pub fn termination(&self) -> Option<TlsTermination> {
        self.tls.as_ref().map(|tls| tls.termination)
    }
}

// === impl TlsSettings ===

impl TryFrom<&TlsConfig> for TlsSettings {
    type Error = InvalidTermination;

    fn try_from(tls: &TlsConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            termination: tls.termination()?,
            certificate: tls.certificate().map(Into::into),
            key: tls.key().map(Into::into),
            ca_certificate: tls.ca_certificate().map(Into::into),
            destination_ca_certificate: tls.destination_ca_certificate().map(Into::into),
            insecure_edge_termination_policy: tls.insecure_edge_termination_policy.clone(),
        })
    }
}
