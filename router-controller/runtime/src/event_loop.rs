use ahash::AHashSet as HashSet;
use anyhow::Result;
use router_controller_core::{EventType, Namespaces, Plugin, ResourceId, SharedRecorder};
use router_controller_k8s_api::{Endpoints, Node, ResourceExt, Route};
use router_controller_k8s_index::{SharedState, TemplatePlugin, UniqueHost};
use router_controller_k8s_status::SharedIndex;
use router_controller_validation::{
    DeprecationValidation, EmbeddingValidator, ExtendedValidator, ExtendedValidatorMetrics,
    RouteRejected, SharedInspector, UpgradeMode, UpgradeValidation,
};
use tokio::sync::{mpsc::UnboundedReceiver, watch};

/// A change observed by one of the watches.
#[derive(Clone, Debug)]
pub enum Event {
    Route(EventType, Box<Route>),
    Endpoints(EventType, Box<Endpoints>),
    Node(EventType, Box<Node>),
    Namespaces(Namespaces),

    /// The initial listing of a resource kind has been delivered.
    Synced(Kind),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Routes,
    Endpoints,
    Nodes,
    Namespaces,
}

/// Configures the plugin chain.
pub struct ChainConfig {
    pub recorder: SharedRecorder,
    pub inspector: SharedInspector,
    pub extended_validation: Option<ExtendedValidatorMetrics>,
    pub upgrade_mode: UpgradeMode,
}

/// Feeds watch events through the plugin chain, one at a time.
pub struct EventLoop {
    chain: Box<dyn Plugin + Send>,
    state: SharedState,
    status: Option<SharedIndex>,

    /// Kinds whose initial listing has not been delivered yet.
    pending: HashSet<Kind>,
}

/// Builds the route-processing chain:
///
/// ```text
/// [ ExtendedValidator ] -> [ EmbeddingValidator ] -> [ DeprecationValidation ]
///     -> [ UpgradeValidation ] -> [ UniqueHost ] -> [ TemplatePlugin ]
/// ```
///
/// The extended validator is omitted when no metrics are configured for it.
/// The embedding validator is always present.
pub fn chain(
    config: ChainConfig,
    state: SharedState,
    commits: watch::Sender<u64>,
) -> Box<dyn Plugin + Send> {
    let ChainConfig {
        recorder,
        inspector,
        extended_validation,
        upgrade_mode,
    } = config;

    let template = TemplatePlugin::new(state, commits);
    let unique = UniqueHost::new(template, recorder.clone());
    let upgrade = UpgradeValidation::new(unique, recorder.clone(), inspector.clone(), upgrade_mode);
    let deprecation = DeprecationValidation::new(upgrade, recorder.clone(), inspector.clone());
    let embedding = EmbeddingValidator::new(deprecation, recorder.clone());
    match extended_validation {
        Some(metrics) => Box::new(ExtendedValidator::new(
            embedding,
            recorder,
            inspector,
            metrics,
        )),
        None => {
            tracing::info!("Extended route validation disabled");
            Box::new(embedding)
        }
    }
}

// === impl EventLoop ===

impl EventLoop {
    pub fn new(
        chain: Box<dyn Plugin + Send>,
        state: SharedState,
        status: Option<SharedIndex>,
        kinds: impl IntoIterator<Item = Kind>,
    ) -> Self {
        Self {
            chain,
            state,
            status,
            pending: kinds.into_iter().collect(),
        }
    }

    /// Handles events until every watch has stopped.
    pub async fn run(mut self, mut events: UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        tracing::debug!("Event loop stopped");
    }

    /// Applies a single event to the chain and commits it.
    pub fn handle(&mut self, event: Event) {
        if let Err(error) = self.apply(event) {
            match error.downcast_ref::<RouteRejected>() {
                Some(rejected) => tracing::debug!(%rejected, "Route rejected"),
                None => tracing::warn!(%error, "Failed to process event"),
            }
        }

        if let Err(error) = self.chain.commit() {
            tracing::warn!(%error, "Failed to commit");
        }
    }

    pub fn is_synced(&self) -> bool {
        self.pending.is_empty()
    }

    fn apply(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Route(event, route) => {
                let id = ResourceId::of(&*route);
                tracing::trace!(?event, route = %id, "Handling route");
                let res = self.chain.handle_route(event, &route);
                if event == EventType::Deleted {
                    if let Some(status) = &self.status {
                        status.delete_route(id.namespace, id.name);
                    }
                }
                res
            }
            Event::Endpoints(event, endpoints) => {
                tracing::trace!(?event, endpoints = %ResourceId::of(&*endpoints), "Handling endpoints");
                self.chain.handle_endpoints(event, &endpoints)
            }
            Event::Node(event, node) => {
                tracing::trace!(?event, node = %node.name_any(), "Handling node");
                self.chain.handle_node(event, &node)
            }
            Event::Namespaces(namespaces) => {
                tracing::debug!(namespaces = namespaces.len(), "Handling namespaces");
                self.chain.handle_namespaces(&namespaces)
            }
            Event::Synced(kind) => {
                if self.pending.remove(&kind) && self.pending.is_empty() {
                    self.state.write().mark_synced();
                }
                Ok(())
            }
        }
    }
}
