use crate::{cert::SharedInspector, rules};
use anyhow::Result;
use router_controller_core::{
    status::{FORCE_UPGRADE_VALIDATION_CONDITION, UPGRADE_ROUTE_VALIDATION_FAILED},
    EventType, Namespaces, Plugin, ResourceId, SharedRecorder,
};
use router_controller_k8s_api::{Endpoints, Node, Route};

const FORCED_MESSAGE: &str = "forced upgrade validation condition";

/// Marks routes that future versions will not serve. Routes are never
/// blocked.
pub struct UpgradeValidation<P> {
    next: P,
    recorder: SharedRecorder,
    inspector: SharedInspector,
    mode: UpgradeMode,
}

/// Overrides the upgrade validation outcome, for testing upgrade tooling.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum UpgradeMode {
    #[default]
    Normal,

    /// Sets the named condition on every route.
    ForceSet(String),

    /// Clears the named condition from every route.
    ForceClear(String),
}

// === impl UpgradeValidation ===

impl<P> UpgradeValidation<P> {
    pub fn new(
        next: P,
        recorder: SharedRecorder,
        inspector: SharedInspector,
        mode: UpgradeMode,
    ) -> Self {
        Self {
            next,
            recorder,
            inspector,
            mode,
        }
    }
}

impl<P: Plugin> Plugin for UpgradeValidation<P> {
    fn handle_route(&mut self, event: EventType, route: &Route) -> Result<()> {
        if event == EventType::Deleted {
            return self.next.handle_route(event, route);
        }

        match &self.mode {
            UpgradeMode::ForceSet(condition) => {
                tracing::debug!(route = %ResourceId::of(route), %condition, "Forcing upgrade validation condition");
                self.recorder.record_route_condition_true(
                    route,
                    condition,
                    FORCE_UPGRADE_VALIDATION_CONDITION,
                    FORCED_MESSAGE,
                );
            }
            UpgradeMode::ForceClear(condition) => {
                tracing::debug!(route = %ResourceId::of(route), %condition, "Forcing removal of upgrade validation condition");
                self.recorder.record_route_condition_clear(route, condition);
            }
            UpgradeMode::Normal => match rules::validate_route_upgrade(route, &*self.inspector) {
                Err(errors) => {
                    tracing::info!(route = %ResourceId::of(route), %errors, "Route failed upgrade validation");
                    self.recorder.record_route_unservable_in_future_versions(
                        route,
                        UPGRADE_ROUTE_VALIDATION_FAILED,
                        &errors.to_string(),
                    );
                }
                Ok(()) => self
                    .recorder
                    .record_route_unservable_in_future_versions_clear(route),
            },
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
