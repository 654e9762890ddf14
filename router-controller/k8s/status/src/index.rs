use crate::{ADMITTED, DEPRECATED, UNSERVABLE_IN_FUTURE_VERSIONS};
use ahash::AHashMap as HashMap;
#[cfg(not(test))]
use chrono::offset::Utc;
use parking_lot::Mutex;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use router_controller_core::{ResourceId, RouteStatusRecorder};
use router_controller_k8s_api::{
    self as k8s, ResourceExt, Route, RouteIngress, RouteIngressCondition, RouteStatus, Time,
};
use std::{
    collections::{btree_map, hash_map::Entry, BTreeMap},
    sync::Arc,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

const ROUTE_API_VERSION: &str = "route.openshift.io/v1";

pub type SharedIndex = Arc<Index>;

/// Applies status patches to routes.
pub struct Controller {
    client: k8s::Client,
    updates: UnboundedReceiver<Update>,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
}

/// Tracks the conditions this router has observed for each route and emits a
/// status patch whenever they change.
pub struct Index {
    router_name: String,
    updates: UnboundedSender<Update>,
    metrics: IndexMetrics,
    routes: Mutex<HashMap<ResourceId, RouteConditions>>,
}

#[derive(Clone, Debug)]
pub struct IndexMetrics {
    patch_enqueues: Counter,
    patch_drops: Counter,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub id: ResourceId,
    pub patch: k8s::Patch<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct RouteConditions {
    host: String,
    conditions: BTreeMap<String, Condition>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Condition {
    status: bool,
    reason: Option<String>,
    message: Option<String>,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        client: k8s::Client,
        updates: UnboundedReceiver<Update>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            updates,
            metrics,
        }
    }

    pub async fn process_updates(mut self) {
        let patch_params = k8s::PatchParams::default();

        while let Some(Update { id, patch }) = self.updates.recv().await {
            let api = k8s::Api::<Route>::namespaced(self.client.clone(), &id.namespace);
            match api.patch_status(&id.name, &patch_params, &patch).await {
                Ok(_) => {
                    tracing::debug!(route = %id, "Patched route status");
                    self.metrics.patch_succeeded.inc();
                }
                Err(error) => {
                    tracing::error!(route = %id, %error, "Failed to patch route status");
                    self.metrics.patch_failed.inc();
                }
            }
        }
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Count of successful route status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Count of failed route status patches",
            patch_failed.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
        }
    }
}

// === impl Index ===

impl Index {
    pub fn shared(
        router_name: impl ToString,
        updates: UnboundedSender<Update>,
        metrics: IndexMetrics,
    ) -> SharedIndex {
        Arc::new(Self {
            router_name: router_name.to_string(),
            updates,
            metrics,
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// Forgets a deleted route. No patch is sent.
    pub fn delete_route(&self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.routes.lock().remove(&id).is_some() {
            tracing::debug!(route = %id, "Forgot route status");
        }
    }

    fn set_condition(
        &self,
        route: &Route,
        type_: &str,
        status: bool,
        reason: Option<&str>,
        message: Option<&str>,
    ) {
        let id = ResourceId::of(route);
        let condition = Condition {
            status,
            reason: reason.map(Into::into),
            message: message.map(Into::into),
        };

        let mut routes = self.routes.lock();
        let state = routes.entry(id.clone()).or_default();
        let host_changed = state.host != route.spec.host;
        let condition_changed = match state.conditions.entry(type_.to_string()) {
            btree_map::Entry::Occupied(entry) if *entry.get() == condition => false,
            btree_map::Entry::Occupied(mut entry) => {
                entry.insert(condition);
                true
            }
            btree_map::Entry::Vacant(entry) => {
                entry.insert(condition);
                true
            }
        };
        if !host_changed && !condition_changed {
            tracing::trace!(route = %id, condition = %type_, "no changes");
            return;
        }
        state.host = route.spec.host.clone();

        let patch = self.make_patch(route, state);
        self.send(id, patch);
    }

    fn clear_condition(&self, route: &Route, type_: &str) {
        let id = ResourceId::of(route);
        let mut routes = self.routes.lock();
        let Entry::Occupied(mut state) = routes.entry(id.clone()) else {
            return;
        };
        if state.get_mut().conditions.remove(type_).is_none() {
            return;
        }

        let patch = self.make_patch(route, state.get());
        if state.get().conditions.is_empty() {
            state.remove();
        }
        self.send(id, patch);
    }

    /// Builds a patch carrying this router's ingress entry. A merge patch
    /// replaces the whole ingress list, so the entries of other routers, as
    /// last observed on the route, are carried over.
    fn make_patch(&self, route: &Route, state: &RouteConditions) -> k8s::Patch<serde_json::Value> {
        #[cfg(not(test))]
        let timestamp = Utc::now();
        #[cfg(test)]
        let timestamp = chrono::DateTime::<chrono::Utc>::MIN_UTC;

        let conditions = state
            .conditions
            .iter()
            .map(|(type_, c)| RouteIngressCondition {
                type_: type_.clone(),
                status: if c.status { "True" } else { "False" }.to_string(),
                reason: c.reason.clone(),
                message: c.message.clone(),
                last_transition_time: Some(Time(timestamp)),
            })
            .collect();

        let mut ingress = route
            .status
            .iter()
            .flat_map(|status| status.ingress.iter())
            .filter(|ingress| ingress.router_name.as_deref() != Some(self.router_name.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        ingress.push(RouteIngress {
            host: Some(state.host.clone()),
            router_name: Some(self.router_name.clone()),
            conditions,
        });
        make_patch(&route.name_any(), RouteStatus { ingress })
    }

    fn send(&self, id: ResourceId, patch: k8s::Patch<serde_json::Value>) {
        match self.updates.send(Update {
            id: id.clone(),
            patch,
        }) {
            Ok(()) => {
                self.metrics.patch_enqueues.inc();
            }
            Err(error) => {
                self.metrics.patch_drops.inc();
                tracing::error!(route = %id, %error, "Failed to send route status patch");
            }
        };
    }
}

impl RouteStatusRecorder for Index {
    fn record_route_rejection(&self, route: &Route, reason: &str, message: &str) {
        self.set_condition(route, ADMITTED, false, Some(reason), Some(message));
    }

    fn record_route_admitted(&self, route: &Route) {
        self.set_condition(route, ADMITTED, true, None, None);
    }

    fn record_route_deprecated(&self, route: &Route, reason: &str, message: &str) {
        self.set_condition(route, DEPRECATED, true, Some(reason), Some(message));
    }

    fn record_route_not_deprecated(&self, route: &Route) {
        self.clear_condition(route, DEPRECATED);
    }

    fn record_route_unservable_in_future_versions(
        &self,
        route: &Route,
        reason: &str,
        message: &str,
    ) {
        self.set_condition(
            route,
            UNSERVABLE_IN_FUTURE_VERSIONS,
            true,
            Some(reason),
            Some(message),
        );
    }

    fn record_route_unservable_in_future_versions_clear(&self, route: &Route) {
        self.clear_condition(route, UNSERVABLE_IN_FUTURE_VERSIONS);
    }

    fn record_route_condition_true(
        &self,
        route: &Route,
        condition: &str,
        reason: &str,
        message: &str,
    ) {
        self.set_condition(route, condition, true, Some(reason), Some(message));
    }

    fn record_route_condition_clear(&self, route: &Route, condition: &str) {
        self.clear_condition(route, condition);
    }
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_enqueues = Counter::default();
        prom.register(
            "patch_enqueues",
            "Count of route status patches enqueued",
            patch_enqueues.clone(),
        );

        let patch_drops = Counter::default();
        prom.register(
            "patch_drops",
            "Count of route status patches dropped because the controller stopped",
            patch_drops.clone(),
        );

        Self {
            patch_enqueues,
            patch_drops,
        }
    }
}

pub(crate) fn make_patch(name: &str, status: RouteStatus) -> k8s::Patch<serde_json::Value> {
    let value = serde_json::json!({
        "apiVersion": ROUTE_API_VERSION,
        "kind": "Route",
        "name": name,
        "status": status,
    });
    k8s::Patch::Merge(value)
}
