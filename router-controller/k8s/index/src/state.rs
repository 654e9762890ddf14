use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use router_controller_core::{
    Endpoint, Namespaces, ResourceId, ServiceAliasConfig, ServiceAliasConfigKey, ServiceUnit,
    ServiceUnitKey,
};
use std::{
    collections::{hash_map::Entry, BTreeMap},
    sync::Arc,
};

pub type SharedState = Arc<RwLock<RouterState>>;

/// Tracks backend endpoint tables and admitted route configurations.
///
/// Every operation is idempotent. The generation is advanced only when an
/// operation changes the state, so replaying events does not cause the
/// configuration to be synthesized again.
#[derive(Debug, Default)]
pub struct RouterState {
    service_units: HashMap<ServiceUnitKey, ServiceUnit>,
    routes: HashMap<ServiceAliasConfigKey, ServiceAliasConfig>,

    /// The key under which each admitted route is stored.
    route_keys: HashMap<ResourceId, ServiceAliasConfigKey>,

    /// When set, only these namespaces are served.
    namespaces: Option<Namespaces>,

    generation: u64,
    synced: bool,
}

/// A consistent, ordered copy of the router state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub generation: u64,
    pub service_units: BTreeMap<ServiceUnitKey, ServiceUnit>,
    pub routes: BTreeMap<ServiceAliasConfigKey, ServiceAliasConfig>,
}

// === impl RouterState ===

impl RouterState {
    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Creates an empty service unit, if one does not already exist.
    pub fn create_service_unit(&mut self, key: ServiceUnitKey) -> bool {
        match self.service_units.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                tracing::debug!(service = %entry.key(), "Creating service unit");
                let unit = ServiceUnit::new(entry.key().clone());
                entry.insert(unit);
                self.generation += 1;
                true
            }
        }
    }

    pub fn find_service_unit(&self, key: &ServiceUnitKey) -> Option<&ServiceUnit> {
        self.service_units.get(key)
    }

    pub fn delete_service_unit(&mut self, key: &ServiceUnitKey) -> bool {
        if self.service_units.remove(key).is_none() {
            return false;
        }
        tracing::debug!(service = %key, "Deleted service unit");
        self.generation += 1;
        true
    }

    pub fn service_units(&self) -> impl Iterator<Item = &ServiceUnit> {
        self.service_units.values()
    }

    /// Replaces the endpoint table of a service unit, creating the unit if
    /// necessary. Tables are compared irrespective of order.
    pub fn add_endpoints(&mut self, key: ServiceUnitKey, mut endpoints: Vec<Endpoint>) -> bool {
        endpoints.sort();
        endpoints.dedup();

        let created = self.create_service_unit(key.clone());
        let Some(unit) = self.service_units.get_mut(&key) else {
            return created;
        };
        if unit.endpoints == endpoints {
            tracing::debug!(service = %key, "no changes");
            return created;
        }

        tracing::debug!(service = %key, endpoints = endpoints.len(), "Updating endpoints");
        unit.endpoints = endpoints;
        self.generation += 1;
        true
    }

    /// Empties the endpoint table of a service unit. The unit itself remains.
    pub fn delete_endpoints(&mut self, key: &ServiceUnitKey) -> bool {
        match self.service_units.get_mut(key) {
            Some(unit) if !unit.endpoints.is_empty() => {
                tracing::debug!(service = %key, "Clearing endpoints");
                unit.endpoints.clear();
                self.generation += 1;
                true
            }
            _ => false,
        }
    }

    /// Stores the configuration of an admitted route, creating the service
    /// units it references.
    ///
    /// If the route was previously stored under a different key, the old
    /// configuration is removed.
    pub fn add_route(&mut self, config: ServiceAliasConfig) -> bool {
        let mut changed = false;
        for key in config.service_units.keys() {
            changed = self.create_service_unit(key.clone()) || changed;
        }

        let key = config.key();
        if let Some(previous) = self.route_keys.insert(config.route.clone(), key.clone()) {
            if previous != key && self.owns(&previous, &config.route) {
                tracing::debug!(route = %config.route, %previous, %key, "Route moved");
                self.routes.remove(&previous);
                self.generation += 1;
                changed = true;
            }
        }

        match self.routes.entry(key) {
            Entry::Occupied(entry) if *entry.get() == config => {
                tracing::debug!(route = %config.route, "no changes");
                return changed;
            }
            Entry::Occupied(mut entry) => {
                tracing::debug!(route = %config.route, key = %entry.key(), "Updating route");
                let previous = entry.insert(config);
                if previous.route != entry.get().route {
                    self.route_keys.remove(&previous.route);
                }
            }
            Entry::Vacant(entry) => {
                tracing::debug!(route = %config.route, key = %entry.key(), "Adding route");
                entry.insert(config);
            }
        }
        self.generation += 1;
        true
    }

    /// Removes the configuration of a route, if it is stored.
    pub fn remove_route(&mut self, route: &ResourceId) -> Option<ServiceAliasConfig> {
        let key = self.route_keys.remove(route)?;
        if !self.owns(&key, route) {
            return None;
        }
        let config = self.routes.remove(&key)?;
        tracing::debug!(%route, %key, "Removed route");
        self.generation += 1;
        Some(config)
    }

    pub fn find_route(&self, key: &ServiceAliasConfigKey) -> Option<&ServiceAliasConfig> {
        self.routes.get(key)
    }

    pub fn routes(&self) -> impl Iterator<Item = &ServiceAliasConfig> {
        self.routes.values()
    }

    /// Restricts the state to the given namespaces, removing every service
    /// unit and route outside of them.
    pub fn filter_namespaces(&mut self, namespaces: &Namespaces) {
        let units = self.service_units.len();
        let routes = self.routes.len();

        self.service_units
            .retain(|key, _| namespaces.contains(key.namespace()));
        self.routes
            .retain(|_, config| namespaces.contains(&config.route.namespace));
        self.route_keys
            .retain(|id, _| namespaces.contains(&id.namespace));
        self.namespaces = Some(namespaces.clone());

        let removed_units = units - self.service_units.len();
        let removed_routes = routes - self.routes.len();
        if removed_units + removed_routes > 0 {
            tracing::info!(
                service_units = removed_units,
                routes = removed_routes,
                "Removed resources outside of the namespace scope"
            );
            self.generation += 1;
        }
    }

    /// Indicates whether resources in the namespace are served.
    pub fn allows_namespace(&self, namespace: &str) -> bool {
        self.namespaces
            .as_ref()
            .map_or(true, |namespaces| namespaces.contains(namespace))
    }

    /// Returns a counter that is advanced on every change to the state.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Marks that the state reflects the initial listing of every watched
    /// resource.
    pub fn mark_synced(&mut self) {
        if !self.synced {
            tracing::info!(generation = self.generation, "Router state synced");
            self.synced = true;
        }
    }

    pub fn synced_at_least_once(&self) -> bool {
        self.synced
    }

    pub fn service_units_len(&self) -> usize {
        self.service_units.len()
    }

    pub fn routes_len(&self) -> usize {
        self.routes.len()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            generation: self.generation,
            service_units: self
                .service_units
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            routes: self
                .routes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn owns(&self, key: &ServiceAliasConfigKey, route: &ResourceId) -> bool {
        self.routes
            .get(key)
            .map_or(false, |config| config.route == *route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use maplit::btreemap;

    fn mk_endpoint(ip: &str, port: u16) -> Endpoint {
        Endpoint {
            id: format!("ept:svc:http:{ip}:{port}"),
            ip: ip.to_string(),
            port,
            port_name: "http".to_string(),
            target_name: ip.to_string(),
            id_hash: format!("{ip}-{port}"),
        }
    }

    fn mk_config(ns: &str, name: &str, host: &str, path: &str) -> ServiceAliasConfig {
        ServiceAliasConfig {
            route: ResourceId::new(ns, name),
            route_uid: None,
            host: host.to_string(),
            path: path.to_string(),
            creation_timestamp: DateTime::<Utc>::MIN_UTC,
            tls: None,
            rewrite_target: None,
            service_units: btreemap! { ServiceUnitKey::from_parts(ns, name) => 100 },
            preferred_port: None,
        }
    }

    #[test]
    fn service_units_are_not_duplicated() {
        let mut state = RouterState::default();
        let key = ServiceUnitKey::from_parts("ns-0", "svc");
        assert!(state.create_service_unit(key.clone()));
        let generation = state.generation();
        assert!(!state.create_service_unit(key.clone()));
        assert_eq!(state.generation(), generation);
        assert_eq!(state.service_units_len(), 1);

        assert!(state.delete_service_unit(&key));
        assert!(state.find_service_unit(&key).is_none());
        assert!(!state.delete_service_unit(&key));
    }

    #[test]
    fn endpoint_tables_are_compared_structurally() {
        let mut state = RouterState::default();
        let key = ServiceUnitKey::from_parts("ns-0", "svc");

        let a = mk_endpoint("10.0.0.1", 8080);
        let b = mk_endpoint("10.0.0.2", 8080);
        assert!(state.add_endpoints(key.clone(), vec![a.clone(), b.clone()]));
        let generation = state.generation();

        // The same set, in another order, is not a change.
        assert!(!state.add_endpoints(key.clone(), vec![b.clone(), a.clone()]));
        assert_eq!(state.generation(), generation);

        assert!(state.add_endpoints(key.clone(), vec![a.clone()]));
        assert_eq!(state.generation(), generation + 1);

        assert!(state.delete_endpoints(&key));
        assert!(!state.delete_endpoints(&key));
        let unit = state.find_service_unit(&key).expect("unit must remain");
        assert!(unit.endpoints.is_empty());
    }

    #[test]
    fn route_moves_between_keys() {
        let mut state = RouterState::default();
        let config = mk_config("ns-0", "web", "www.example.com", "");
        assert!(state.add_route(config.clone()));
        assert!(!state.add_route(config.clone()));
        assert!(state
            .find_service_unit(&ServiceUnitKey::from_parts("ns-0", "web"))
            .is_some());

        let moved = mk_config("ns-0", "web", "www.example.com", "/app");
        assert!(state.add_route(moved.clone()));
        assert_eq!(state.routes_len(), 1);
        assert!(state.find_route(&config.key()).is_none());
        assert_eq!(state.find_route(&moved.key()), Some(&moved));

        assert_eq!(state.remove_route(&moved.route), Some(moved.clone()));
        assert_eq!(state.remove_route(&moved.route), None);
        assert_eq!(state.routes_len(), 0);
    }

    #[test]
    fn replacing_a_route_forgets_the_previous_owner() {
        let mut state = RouterState::default();
        let a = mk_config("ns-0", "a", "www.example.com", "");
        let c = mk_config("ns-0", "c", "www.example.com", "");
        state.add_route(a.clone());
        state.add_route(c.clone());

        // The replaced route no longer owns the key.
        assert_eq!(state.remove_route(&a.route), None);
        assert_eq!(state.find_route(&c.key()), Some(&c));
    }

    #[test]
    fn filter_namespaces_purges_both_maps() {
        let mut state = RouterState::default();
        state.add_route(mk_config("ns-0", "a", "a.example.com", ""));
        state.add_route(mk_config("ns-1", "b", "b.example.com", ""));
        state.add_endpoints(
            ServiceUnitKey::from_parts("ns-1", "other"),
            vec![mk_endpoint("10.0.0.1", 80)],
        );
        assert!(state.allows_namespace("ns-1"));

        let generation = state.generation();
        state.filter_namespaces(&Some("ns-0".to_string()).into_iter().collect());
        assert!(state.generation() > generation);
        assert!(!state.allows_namespace("ns-1"));
        assert!(state.routes().all(|r| r.route.namespace == "ns-0"));
        assert!(state.service_units().all(|u| u.name.namespace() == "ns-0"));
        assert_eq!(state.routes_len(), 1);
        assert_eq!(state.service_units_len(), 1);

        // Filtering again is a no-op.
        let generation = state.generation();
        state.filter_namespaces(&Some("ns-0".to_string()).into_iter().collect());
        assert_eq!(state.generation(), generation);
    }

    #[test]
    fn snapshot_is_ordered() {
        let mut state = RouterState::default();
        state.add_route(mk_config("ns-0", "b", "b.example.com", ""));
        state.add_route(mk_config("ns-0", "a", "a.example.com", ""));
        assert!(!state.synced_at_least_once());
        state.mark_synced();
        assert!(state.synced_at_least_once());

        let snapshot = state.snapshot();
        assert_eq!(snapshot.generation, state.generation());
        assert_eq!(
            snapshot
                .routes
                .keys()
                .map(ServiceAliasConfigKey::as_str)
                .collect::<Vec<_>>(),
            vec!["a.example.com:", "b.example.com:"]
        );
    }
}
