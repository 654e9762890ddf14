//! Adapts kubert indexes into router events.
//!
//! kubert reports objects as applied or deleted by name. The plugin chain
//! needs to know whether an object is new and needs the last known object
//! when it is deleted, so the adapters cache what they have seen.

use crate::event_loop::{Event, Kind};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use router_controller_core::{EventType, Namespaces, ResourceId};
use router_controller_k8s_api::{Endpoints, Namespace, Node, ResourceExt, Route};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Converts a watched resource into a router event.
pub trait IntoEvent: Sized {
    const KIND: Kind;

    fn into_event(self, event: EventType) -> Event;
}

/// Forwards changes to a namespaced resource.
#[derive(Debug)]
pub struct Watch<T> {
    known: HashMap<ResourceId, T>,
    events: UnboundedSender<Event>,
    synced: bool,
}

/// Tracks the namespaces selected by a label selector.
#[derive(Debug)]
pub struct NamespaceWatch {
    selected: Namespaces,
    events: UnboundedSender<Event>,
    synced: bool,
}

// === impl Watch ===

impl<T> Watch<T> {
    pub fn shared(events: UnboundedSender<Event>) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self {
            known: HashMap::new(),
            events,
            synced: false,
        }))
    }
}

impl<T: IntoEvent> Watch<T> {
    fn send(&self, event: Event) {
        if self.events.send(event).is_err() {
            tracing::debug!(kind = ?T::KIND, "Event loop stopped");
        }
    }
}

impl<T: IntoEvent + ResourceExt + Clone> Watch<T> {
    fn upsert(&mut self, resource: T) {
        let id = ResourceId::of(&resource);
        let event = match self.known.insert(id, resource.clone()) {
            Some(_) => EventType::Modified,
            None => EventType::Added,
        };
        self.send(resource.into_event(event));
    }

    fn remove(&mut self, id: ResourceId) {
        match self.known.remove(&id) {
            Some(resource) => self.send(resource.into_event(EventType::Deleted)),
            None => tracing::debug!(kind = ?T::KIND, %id, "Ignoring deletion of unknown resource"),
        }
    }

    fn replace(&mut self, resources: Vec<T>, removed: impl IntoIterator<Item = ResourceId>) {
        for resource in resources {
            self.upsert(resource);
        }
        for id in removed {
            self.remove(id);
        }

        if !self.synced {
            self.synced = true;
            tracing::debug!(kind = ?T::KIND, resources = self.known.len(), "Initial listing received");
            self.send(Event::Synced(T::KIND));
        }
    }
}

impl<T> kubert::index::IndexNamespacedResource<T> for Watch<T>
where
    T: IntoEvent + ResourceExt + Clone,
{
    fn apply(&mut self, resource: T) {
        self.upsert(resource)
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.remove(ResourceId::new(namespace, name))
    }

    fn reset(&mut self, resources: Vec<T>, removed: kubert::index::NamespacedRemoved) {
        let removed = removed.into_iter().flat_map(|(namespace, names)| {
            names
                .into_iter()
                .map(move |name| ResourceId::new(namespace.clone(), name))
        });
        self.replace(resources, removed)
    }
}

// Nodes are not namespaced; they are tracked in the empty namespace.
impl kubert::index::IndexClusterResource<Node> for Watch<Node> {
    fn apply(&mut self, node: Node) {
        self.upsert(node)
    }

    fn delete(&mut self, name: String) {
        self.remove(ResourceId::new("", name))
    }

    fn reset(&mut self, nodes: Vec<Node>, removed: kubert::index::ClusterRemoved) {
        let removed = removed.into_iter().map(|name| ResourceId::new("", name));
        self.replace(nodes, removed)
    }
}

impl IntoEvent for Route {
    const KIND: Kind = Kind::Routes;

    fn into_event(self, event: EventType) -> Event {
        Event::Route(event, Box::new(self))
    }
}

impl IntoEvent for Endpoints {
    const KIND: Kind = Kind::Endpoints;

    fn into_event(self, event: EventType) -> Event {
        Event::Endpoints(event, Box::new(self))
    }
}

impl IntoEvent for Node {
    const KIND: Kind = Kind::Nodes;

    fn into_event(self, event: EventType) -> Event {
        Event::Node(event, Box::new(self))
    }
}

// === impl NamespaceWatch ===

impl NamespaceWatch {
    pub fn shared(events: UnboundedSender<Event>) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self {
            selected: Namespaces::default(),
            events,
            synced: false,
        }))
    }

    fn publish(&self) {
        if self
            .events
            .send(Event::Namespaces(self.selected.clone()))
            .is_err()
        {
            tracing::debug!("Event loop stopped");
        }
    }
}

impl kubert::index::IndexClusterResource<Namespace> for NamespaceWatch {
    fn apply(&mut self, namespace: Namespace) {
        if self.selected.insert(namespace.name_any()) {
            self.publish();
        }
    }

    fn delete(&mut self, name: String) {
        if self.selected.remove(&name) {
            self.publish();
        }
    }

    fn reset(&mut self, namespaces: Vec<Namespace>, _: kubert::index::ClusterRemoved) {
        let selected = namespaces.iter().map(|ns| ns.name_any()).collect::<Namespaces>();
        if selected != self.selected || !self.synced {
            self.selected = selected;
            self.publish();
        }

        if !self.synced {
            self.synced = true;
            if self.events.send(Event::Synced(Kind::Namespaces)).is_err() {
                tracing::debug!("Event loop stopped");
            }
        }
    }
}
