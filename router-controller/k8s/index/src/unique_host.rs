use ahash::AHashMap as HashMap;
use anyhow::Result;
use chrono::{DateTime, Utc};
use router_controller_core::{
    routing::creation_timestamp,
    status::{HOST_ALREADY_CLAIMED, NO_HOST_VALUE},
    EventType, Namespaces, Plugin, ResourceId, SharedRecorder,
};
use router_controller_k8s_api::{Endpoints, Node, Route};
use std::collections::BTreeMap;

/// Arbitrates between routes that claim the same host and path.
///
/// The route with the oldest creation timestamp owns a claim; on a tie the
/// current owner keeps it. Only owners are forwarded to the next plugin. Other
/// claimants are rejected but remembered, so that the oldest of them is
/// admitted when the owner goes away.
///
/// Routes and endpoints outside of the namespace scope are held back and
/// replayed when their namespace enters the scope.
pub struct UniqueHost<P> {
    next: P,
    recorder: SharedRecorder,
    namespaces: Option<Namespaces>,

    /// Claimants by host, then path.
    claims: HashMap<String, BTreeMap<String, Claimants>>,

    /// The host and path each known route claims.
    claimed_by: HashMap<ResourceId, (String, String)>,

    /// Routes outside of the namespace scope.
    held: HashMap<ResourceId, Route>,

    /// Every endpoints object, in or out of scope.
    endpoints: HashMap<ResourceId, Endpoints>,
}

/// The routes claiming a host and path. The first entry owns the claim; the
/// rest wait, oldest first.
#[derive(Debug, Default)]
struct Claimants(Vec<Claim>);

#[derive(Debug)]
struct Claim {
    id: ResourceId,
    created: DateTime<Utc>,
    route: Route,
}

// === impl UniqueHost ===

impl<P: Plugin> UniqueHost<P> {
    pub fn new(next: P, recorder: SharedRecorder) -> Self {
        Self {
            next,
            recorder,
            namespaces: None,
            claims: HashMap::new(),
            claimed_by: HashMap::new(),
            held: HashMap::new(),
            endpoints: HashMap::new(),
        }
    }

    /// Lists the routes claiming a host: for each path, the owner followed by
    /// the routes waiting for it.
    pub fn routes_for_host(&self, host: &str) -> Option<Vec<ResourceId>> {
        let paths = self.claims.get(host)?;
        Some(
            paths
                .values()
                .flat_map(|claimants| claimants.0.iter().map(|c| c.id.clone()))
                .collect(),
        )
    }

    /// The number of hosts with at least one claim.
    pub fn host_len(&self) -> usize {
        self.claims.len()
    }

    pub fn inner(&self) -> &P {
        &self.next
    }

    fn allows(&self, namespace: &str) -> bool {
        self.namespaces
            .as_ref()
            .map_or(true, |namespaces| namespaces.contains(namespace))
    }

    fn claim(&mut self, event: EventType, id: ResourceId, route: &Route) -> Result<()> {
        let host = route.spec.host.clone();
        let path = route.spec.path.clone();

        match self.claimed_by.get(&id) {
            Some((h, p)) if *h == host && *p == path => {}
            Some(_) => {
                tracing::debug!(route = %id, %host, %path, "Route changed its host or path");
                self.release(&id)?;
            }
            None => {}
        }

        let created = creation_timestamp(route);
        let claimants = self
            .claims
            .entry(host.clone())
            .or_default()
            .entry(path.clone())
            .or_default();
        self.claimed_by.insert(id.clone(), (host.clone(), path));

        let claim = Claim {
            id: id.clone(),
            created,
            route: route.clone(),
        };

        let Some(owner) = claimants.0.first_mut() else {
            claimants.0.push(claim);
            return self.admit(event, route);
        };

        if owner.id == id {
            *owner = claim;
            return self.admit(event, route);
        }

        // The route may already be waiting; it is re-evaluated.
        claimants.0.retain(|c| c.id != id);

        if created < claimants.0[0].created {
            let evicted = std::mem::replace(&mut claimants.0[0], claim);
            let evicted_id = evicted.id.clone();
            let evicted_route = evicted.route.clone();
            claimants.insert_waiting(evicted);

            tracing::info!(route = %id, evicted = %evicted_id, %host, "Route replaces newer owner");
            self.next.handle_route(EventType::Deleted, &evicted_route)?;
            self.recorder.record_route_rejection(
                &evicted_route,
                HOST_ALREADY_CLAIMED,
                &format!("replaced by older route {}", id.name),
            );
            return self.admit(event, route);
        }

        let owner = claimants.0[0].id.name.clone();
        claimants.insert_waiting(claim);
        tracing::info!(route = %id, %owner, %host, "Host already claimed by an older route");
        self.recorder.record_route_rejection(
            route,
            HOST_ALREADY_CLAIMED,
            &format!("route {owner} already exposes {host} and is older"),
        );
        Ok(())
    }

    /// Drops a route's claim. If the route owned its claim, it is removed
    /// downstream and the oldest waiting route is admitted in its place.
    fn release(&mut self, id: &ResourceId) -> Result<bool> {
        let Some((host, path)) = self.claimed_by.remove(id) else {
            return Ok(false);
        };
        let Some(paths) = self.claims.get_mut(&host) else {
            return Ok(false);
        };
        let Some(claimants) = paths.get_mut(&path) else {
            return Ok(false);
        };
        let Some(pos) = claimants.0.iter().position(|c| c.id == *id) else {
            return Ok(false);
        };

        let released = claimants.0.remove(pos);
        let promoted = match claimants.0.first() {
            Some(next) if pos == 0 => Some(next.route.clone()),
            _ => None,
        };
        if claimants.0.is_empty() {
            paths.remove(&path);
        }
        if paths.is_empty() {
            self.claims.remove(&host);
        }

        if pos != 0 {
            tracing::debug!(route = %id, %host, "Released waiting claim");
            return Ok(false);
        }

        self.next.handle_route(EventType::Deleted, &released.route)?;
        if let Some(route) = promoted {
            tracing::info!(route = %ResourceId::of(&route), %host, "Promoting waiting route");
            self.admit(EventType::Added, &route)?;
        }
        Ok(true)
    }

    fn admit(&mut self, event: EventType, route: &Route) -> Result<()> {
        self.next.handle_route(event, route)?;
        self.recorder.record_route_admitted(route);
        Ok(())
    }
}

impl<P: Plugin> Plugin for UniqueHost<P> {
    fn handle_route(&mut self, event: EventType, route: &Route) -> Result<()> {
        let id = ResourceId::of(route);
        if !self.allows(&id.namespace) {
            tracing::debug!(route = %id, "Holding route outside of the namespace scope");
            match event {
                EventType::Deleted => self.held.remove(&id),
                EventType::Added | EventType::Modified => self.held.insert(id, route.clone()),
            };
            return Ok(());
        }

        match event {
            EventType::Deleted => {
                self.release(&id)?;
                Ok(())
            }
            EventType::Added | EventType::Modified if route.spec.host.is_empty() => {
                self.release(&id)?;
                self.recorder.record_route_rejection(
                    route,
                    NO_HOST_VALUE,
                    "no host value was defined for the route",
                );
                self.next.handle_route(EventType::Deleted, route)
            }
            EventType::Added | EventType::Modified => self.claim(event, id, route),
        }
    }

    fn handle_endpoints(&mut self, event: EventType, endpoints: &Endpoints) -> Result<()> {
        let id = ResourceId::of(endpoints);
        match event {
            EventType::Deleted => self.endpoints.remove(&id),
            EventType::Added | EventType::Modified => {
                self.endpoints.insert(id.clone(), endpoints.clone())
            }
        };

        if !self.allows(&id.namespace) {
            tracing::debug!(endpoints = %id, "Holding endpoints outside of the namespace scope");
            return Ok(());
        }
        self.next.handle_endpoints(event, endpoints)
    }

    fn handle_node(&mut self, event: EventType, node: &Node) -> Result<()> {
        self.next.handle_node(event, node)
    }

    fn handle_namespaces(&mut self, namespaces: &Namespaces) -> Result<()> {
        let previous = self.namespaces.replace(namespaces.clone());
        self.next.handle_namespaces(namespaces)?;

        // Hold claimants outside of the scope. Where an owner was dropped, the
        // oldest remaining claimant takes over.
        let mut promoted = Vec::new();
        let held = &mut self.held;
        self.claims.retain(|_, paths| {
            paths.retain(|_, claimants| {
                let owner = claimants.0.first().map(|c| c.id.clone());
                let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut claimants.0)
                    .into_iter()
                    .partition(|c| namespaces.contains(&c.id.namespace));
                claimants.0 = kept;
                held.extend(dropped.into_iter().map(|c| (c.id, c.route)));
                if let Some(first) = claimants.0.first() {
                    if Some(&first.id) != owner.as_ref() {
                        promoted.push(first.route.clone());
                    }
                }
                !claimants.0.is_empty()
            });
            !paths.is_empty()
        });
        self.claimed_by
            .retain(|id, _| namespaces.contains(&id.namespace));

        for route in promoted {
            tracing::info!(route = %ResourceId::of(&route), "Promoting waiting route");
            self.admit(EventType::Added, &route)?;
        }

        // Namespaces that entered the scope get their endpoints and routes
        // back. Endpoints go first so that restored routes have backends.
        let entered = |namespace: &str| {
            namespaces.contains(namespace)
                && previous
                    .as_ref()
                    .map_or(false, |previous| !previous.contains(namespace))
        };
        let endpoints = self
            .endpoints
            .iter()
            .filter(|(id, _)| entered(&id.namespace))
            .map(|(_, endpoints)| endpoints.clone())
            .collect::<Vec<_>>();
        for endpoints in endpoints {
            if let Err(error) = self.next.handle_endpoints(EventType::Added, &endpoints) {
                tracing::warn!(endpoints = %ResourceId::of(&endpoints), %error, "Failed to restore endpoints");
            }
        }

        let mut restored = Vec::new();
        self.held.retain(|id, route| {
            if namespaces.contains(&id.namespace) {
                restored.push((creation_timestamp(route), id.clone(), route.clone()));
                return false;
            }
            true
        });
        restored.sort_by(|(a, a_id, _), (b, b_id, _)| a.cmp(b).then_with(|| a_id.cmp(b_id)));
        for (_, id, route) in restored {
            tracing::debug!(route = %id, "Restoring route that entered the namespace scope");
            if let Err(error) = self.handle_route(EventType::Added, &route) {
                tracing::warn!(route = %id, %error, "Failed to restore route");
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.next.commit()
    }
}

// === impl Claimants ===

impl Claimants {
    /// Inserts a claim after the owner, keeping waiting claims ordered by age.
    /// Claims of equal age keep their arrival order.
    fn insert_waiting(&mut self, claim: Claim) {
        let pos = self.0[1..]
            .iter()
            .position(|c| c.created > claim.created)
            .map_or(self.0.len(), |p| p + 1);
        self.0.insert(pos, claim);
    }
}
