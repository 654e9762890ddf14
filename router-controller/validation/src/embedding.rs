use crate::{extended::RouteRejected, rules};
use anyhow::Result;
use router_controller_core::{
    status::UNSAFE_ROUTE_VALUE, EventType, Namespaces, Plugin, ResourceId, SharedRecorder,
};
use router_controller_k8s_api::{Endpoints, Node, Route};

/// Blocks routes whose host, path or rewrite target cannot be embedded in the
/// proxy configuration.
///
/// This stage is always part of the chain, so that disabling extended
/// validation never lets such a value reach the renderer.
pub struct EmbeddingValidator<P> {
    next: P,
    recorder: SharedRecorder,
}

// === impl EmbeddingValidator ===

impl<P> EmbeddingValidator<P> {
    pub fn new(next: P, recorder: SharedRecorder) -> Self {
        Self { next, recorder }
    }

    pub fn inner(&self) -> &P {
        &self.next
    }
}

impl<P: Plugin> Plugin for EmbeddingValidator<P> {
    fn handle_route(&mut self, event: EventType, route: &Route) -> Result<()> {
        if event == EventType::Deleted {
            return self.next.handle_route(event, route);
        }

        if let Err(errors) = rules::validate_route_embedding(route) {
            let id = ResourceId::of(route);
            tracing::warn!(route = %id, %errors, "Skipping route with unsafe values");
            self.recorder
                .record_route_rejection(route, UNSAFE_ROUTE_VALUE, &errors.to_string());
            if let Err(error) = self.next.handle_route(EventType::Deleted, route) {
                tracing::warn!(route = %id, %error, "Failed to remove rejected route");
            }
            return Err(RouteRejected { route: id, errors }.into());
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
