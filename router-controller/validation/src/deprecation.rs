use crate::{cert::SharedInspector, rules};
use anyhow::Result;
use router_controller_core::{
    status::DEPRECATED_VALIDATION_FAILED, EventType, Namespaces, Plugin, ResourceId,
    SharedRecorder,
};
use router_controller_k8s_api::{Endpoints, Node, Route};

/// Marks routes that use deprecated configuration. Routes are never blocked.
pub struct DeprecationValidation<P> {
    next: P,
    recorder: SharedRecorder,
    inspector: SharedInspector,
}

// === impl DeprecationValidation ===

impl<P> DeprecationValidation<P> {
    pub fn new(next: P, recorder: SharedRecorder, inspector: SharedInspector) -> Self {
        Self {
            next,
            recorder,
            inspector,
        }
    }
}

impl<P: Plugin> Plugin for DeprecationValidation<P> {
    fn handle_route(&mut self, event: EventType, route: &Route) -> Result<()> {
        if event != EventType::Deleted {
            match rules::validate_route_deprecations(route, &*self.inspector) {
                Err(errors) => {
                    let route_id = ResourceId::of(route);
                    tracing::info!(route = %route_id, %errors, "Route uses deprecated configuration");
                    self.recorder.record_route_deprecated(
                        route,
                        DEPRECATED_VALIDATION_FAILED,
                        &errors.to_string(),
                    );
                }
                Ok(()) => self.recorder.record_route_not_deprecated(route),
            }
        }
        self.next.handle_route(event, route)
    }

    fn handle_endpoints(&mut self, event: EventType, endpoints: &Endpoints) -> Result<()> {
        self.next.handle_endpoints(event, endpoints)
    }

    fn handle_node(&mut self, event: EventType, node: &Node) -> Result<()> {
        self.next.handle_node(event, node)
    }

    fn handle_namespaces(&mut self, namespaces: &Namespaces) -> Result<()> {
        self.next.handle_namespaces(namespaces)
    }

    fn commit(&mut self) -> Result<()> {
        self.next.commit()
    }
}
