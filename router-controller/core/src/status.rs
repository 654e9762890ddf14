use crate::ResourceId;
use router_controller_k8s_api::Route;
use std::sync::Arc;

pub const HOST_ALREADY_CLAIMED: &str = "HostAlreadyClaimed";
pub const NO_HOST_VALUE: &str = "NoHostValue";
pub const EXTENDED_VALIDATION_FAILED: &str = "ExtendedValidationFailed";
pub const UNSAFE_ROUTE_VALUE: &str = "UnsafeRouteValue";
pub const DEPRECATED_VALIDATION_FAILED: &str = "DeprecatedValidationFailed";
pub const UPGRADE_ROUTE_VALIDATION_FAILED: &str = "UpgradeRouteValidationFailed";
pub const FORCE_UPGRADE_VALIDATION_CONDITION: &str = "ForceUpgradeValidationCondition";
pub const HAPROXY_CHECK_CONFIG_FAILED: &str = "HAProxyCheckConfigFailed";

pub type SharedRecorder = Arc<dyn RouteStatusRecorder + Send + Sync>;

/// Records the router's observations about routes.
///
/// Recording the same observation repeatedly must converge to a single
/// recorded state.
pub trait RouteStatusRecorder {
    fn record_route_rejection(&self, route: &Route, reason: &str, message: &str);

    fn record_route_admitted(&self, route: &Route);

    fn record_route_deprecated(&self, route: &Route, reason: &str, message: &str);

    fn record_route_not_deprecated(&self, route: &Route);

    fn record_route_unservable_in_future_versions(
        &self,
        route: &Route,
        reason: &str,
        message: &str,
    );

    fn record_route_unservable_in_future_versions_clear(&self, route: &Route);

    fn record_route_condition_true(
        &self,
        route: &Route,
        condition: &str,
        reason: &str,
        message: &str,
    );

    fn record_route_condition_clear(&self, route: &Route, condition: &str);
}

/// Logs route observations without persisting them.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogRejections;

impl RouteStatusRecorder for LogRejections {
    fn record_route_rejection(&self, route: &Route, reason: &str, message: &str) {
        let route = ResourceId::of(route);
        tracing::info!(%route, %reason, %message, "Route rejected");
    }

    fn record_route_admitted(&self, route: &Route) {
        let route = ResourceId::of(route);
        tracing::debug!(%route, "Route admitted");
    }

    fn record_route_deprecated(&self, route: &Route, reason: &str, message: &str) {
        let route = ResourceId::of(route);
        tracing::info!(%route, %reason, %message, "Route uses deprecated configuration");
    }

    fn record_route_not_deprecated(&self, _: &Route) {}

    fn record_route_unservable_in_future_versions(
        &self,
        route: &Route,
        reason: &str,
        message: &str,
    ) {
        let route = ResourceId::of(route);
        tracing::info!(%route, %reason, %message, "Route will be unservable in future versions");
    }

    fn record_route_unservable_in_future_versions_clear(&self, _: &Route) {}

    fn record_route_condition_true(
        &self,
        route: &Route,
        condition: &str,
        reason: &str,
        message: &str,
    ) {
        let route = ResourceId::of(route);
        tracing::info!(%route, %condition, %reason, %message, "Route condition set");
    }

    fn record_route_condition_clear(&self, route: &Route, condition: &str) {
        let route = ResourceId::of(route);
        tracing::debug!(%route, %condition, "Route condition cleared");
    }
}
