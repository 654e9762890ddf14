use ahash::AHashSet as HashSet;
use anyhow::Result;
use router_controller_k8s_api::{Endpoints, Node, Route};
use std::fmt;

/// The set of namespaces whose routes and endpoints the router serves.
pub type Namespaces = HashSet<String>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A stage of the route-processing chain.
///
/// Stages compose by wrapping: each stage owns the next one and decides
/// whether an event is forwarded unchanged, forwarded after recording an
/// observation, or replaced by a synthetic `Deleted` event. Returning an error
/// signals that the event was rejected; it never indicates that processing
/// must stop.
pub trait Plugin {
    fn handle_route(&mut self, event: EventType, route: &Route) -> Result<()>;

    fn handle_endpoints(&mut self, event: EventType, endpoints: &Endpoints) -> Result<()>;

    fn handle_node(&mut self, event: EventType, node: &Node) -> Result<()>;

    /// Restricts the router to the given namespaces.
    fn handle_namespaces(&mut self, namespaces: &Namespaces) -> Result<()>;

    /// Signals that a batch of events has been applied.
    fn commit(&mut self) -> Result<()>;
}

impl<P: Plugin + ?Sized> Plugin for Box<P> {
    #[inline]
    fn handle_route(&mut self, event: EventType, route: &Route) -> Result<()> {
        (**self).handle_route(event, route)
    }

    #[inline]
    fn handle_endpoints(&mut self, event: EventType, endpoints: &Endpoints) -> Result<()> {
        (**self).handle_endpoints(event, endpoints)
    }

    #[inline]
    fn handle_node(&mut self, event: EventType, node: &Node) -> Result<()> {
        (**self).handle_node(event, node)
    }

    #[inline]
    fn handle_namespaces(&mut self, namespaces: &Namespaces) -> Result<()> {
        (**self).handle_namespaces(namespaces)
    }

    #[inline]
    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }
}

// === impl EventType ===

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => "Added".fmt(f),
            Self::Modified => "Modified".fmt(f),
            Self::Deleted => "Deleted".fmt(f),
        }
    }
}
