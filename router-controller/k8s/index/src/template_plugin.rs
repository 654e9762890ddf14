use crate::{endpoints::endpoints_table, state::SharedState};
use anyhow::{Context, Result};
use router_controller_core::{
    EventType, Namespaces, Plugin, ResourceId, ServiceAliasConfig, ServiceUnitKey,
};
use router_controller_k8s_api::{Endpoints, Node, ResourceExt, Route};
use tokio::sync::watch;

/// Applies admitted routes and endpoint tables to the router state.
///
/// On commit, the state's generation is published so that the configuration
/// can be synthesized. Publishing replaces any value that has not yet been
/// observed, so bursts of commits coalesce.
pub struct TemplatePlugin {
    state: SharedState,
    commits: watch::Sender<u64>,
}

// === impl TemplatePlugin ===

impl TemplatePlugin {
    pub fn new(state: SharedState, commits: watch::Sender<u64>) -> Self {
        Self { state, commits }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }
}

impl Plugin for TemplatePlugin {
    fn handle_route(&mut self, event: EventType, route: &Route) -> Result<()> {
        let id = ResourceId::of(route);
        if event == EventType::Deleted {
            self.state.write().remove_route(&id);
            return Ok(());
        }

        let config = match ServiceAliasConfig::from_route(route) {
            Ok(config) => config,
            Err(error) => {
                self.state.write().remove_route(&id);
                return Err(error).with_context(|| format!("route {id}"));
            }
        };
        self.state.write().add_route(config);
        Ok(())
    }

    fn handle_endpoints(&mut self, event: EventType, endpoints: &Endpoints) -> Result<()> {
        let namespace = endpoints.namespace().unwrap_or_default();
        let key = ServiceUnitKey::from_parts(&namespace, &endpoints.name_any());
        if event == EventType::Deleted {
            self.state.write().delete_endpoints(&key);
            return Ok(());
        }

        let table = endpoints_table(endpoints)
            .with_context(|| format!("failed to build endpoints for {key}"))?;
        self.state.write().add_endpoints(key, table);
        Ok(())
    }

    fn handle_node(&mut self, _: EventType, node: &Node) -> Result<()> {
        tracing::trace!(node = %node.name_any(), "Ignoring node");
        Ok(())
    }

    fn handle_namespaces(&mut self, namespaces: &Namespaces) -> Result<()> {
        self.state.write().filter_namespaces(namespaces);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let generation = self.state.read().generation();
        self.commits.send_replace(generation);
        Ok(())
    }
}
