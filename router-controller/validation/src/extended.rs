use crate::{cert::SharedInspector, rules, ValidationErrors};
use ahash::AHashSet as HashSet;
use anyhow::Result;
use prometheus_client::{metrics::gauge::Gauge, registry::Registry};
use router_controller_core::{
    status::EXTENDED_VALIDATION_FAILED, EventType, Namespaces, Plugin, ResourceId,
    SharedRecorder,
};
use router_controller_k8s_api::{Endpoints, Node, Route};
use thiserror::Error;

/// Blocks routes whose configuration cannot be served.
///
/// A rejected route is recorded and removed from the rest of the chain with a
/// synthetic `Deleted` event. Routes that are served today but would be
/// rejected by the stricter rules of future versions are counted.
pub struct ExtendedValidator<P> {
    next: P,
    recorder: SharedRecorder,
    inspector: SharedInspector,

    /// Routes that fail the rules of future versions. Routes outside of the
    /// namespace scope are kept but not counted.
    post_upgrade_invalid: HashSet<ResourceId>,
    namespaces: Option<Namespaces>,
    metrics: ExtendedValidatorMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct ExtendedValidatorMetrics {
    post_upgrade_invalid_routes: Gauge,
}

#[derive(Debug, Error)]
#[error("route {route} rejected: {errors}")]
pub struct RouteRejected {
    pub route: ResourceId,
    pub errors: ValidationErrors,
}

// === impl ExtendedValidator ===

impl<P> ExtendedValidator<P> {
    pub fn new(
        next: P,
        recorder: SharedRecorder,
        inspector: SharedInspector,
        metrics: ExtendedValidatorMetrics,
    ) -> Self {
        Self {
            next,
            recorder,
            inspector,
            post_upgrade_invalid: HashSet::new(),
            namespaces: None,
            metrics,
        }
    }

    pub fn inner(&self) -> &P {
        &self.next
    }

    fn track_post_upgrade(&mut self, id: &ResourceId, invalid: Option<ValidationErrors>) {
        match invalid {
            Some(errors) => {
                if self.post_upgrade_invalid.insert(id.clone()) {
                    tracing::warn!(route = %id, %errors, "Route will be invalid after an upgrade");
                }
            }
            None => {
                self.post_upgrade_invalid.remove(id);
            }
        }
        self.update_gauge();
    }

    fn update_gauge(&self) {
        let in_scope = match &self.namespaces {
            Some(namespaces) => self
                .post_upgrade_invalid
                .iter()
                .filter(|id| namespaces.contains(&id.namespace))
                .count(),
            None => self.post_upgrade_invalid.len(),
        };
        self.metrics.post_upgrade_invalid_routes.set(in_scope as i64);
    }
}

impl<P: Plugin> Plugin for ExtendedValidator<P> {
    fn handle_route(&mut self, event: EventType, route: &Route) -> Result<()> {
        let id = ResourceId::of(route);
        if event == EventType::Deleted {
            self.track_post_upgrade(&id, None);
            return self.next.handle_route(event, route);
        }

        if let Err(errors) = rules::validate_route(route, &*self.inspector) {
            tracing::warn!(route = %id, %errors, "Skipping route due to invalid configuration");
            self.recorder
                .record_route_rejection(route, EXTENDED_VALIDATION_FAILED, &errors.to_string());
            self.track_post_upgrade(&id, None);
            if let Err(error) = self.next.handle_route(EventType::Deleted, route) {
                tracing::warn!(route = %id, %error, "Failed to remove rejected route");
            }
            return Err(RouteRejected { route: id, errors }.into());
        }

        self.track_post_upgrade(&id, rules::validate_route_post_upgrade(route).err());
        self.next.handle_route(event, route)
    }

    fn handle_endpoints(&mut self, event: EventType, endpoints: &Endpoints) -> Result<()> {
        self.next.handle_endpoints(event, endpoints)
    }

    fn handle_node(&mut self, event: EventType, node: &Node) -> Result<()> {
        self.next.handle_node(event, node)
    }

    fn handle_namespaces(&mut self, namespaces: &Namespaces) -> Result<()> {
        self.namespaces = Some(namespaces.clone());
        self.update_gauge();
        self.next.handle_namespaces(namespaces)
    }

    fn commit(&mut self) -> Result<()> {
        self.next.commit()
    }
}

// === impl ExtendedValidatorMetrics ===

impl ExtendedValidatorMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let post_upgrade_invalid_routes = Gauge::default();
        prom.register(
            "post_upgrade_invalid_routes",
            "The number of routes that will be invalid after an upgrade",
            post_upgrade_invalid_routes.clone(),
        );
        Self {
            post_upgrade_invalid_routes,
        }
    }

    pub fn post_upgrade_invalid_routes(&self) -> i64 {
        self.post_upgrade_invalid_routes.get()
    }
}
