use crate::{
    chain,
    core::{LogRejections, SharedRecorder, ROUTER_CONTROLLER_NAME},
    event_loop::{ChainConfig, EventLoop, Kind},
    index::{self, RouterState},
    k8s::{self, watcher},
    status,
    template::{CommitMetrics, CommitScheduler, ProxyCommand, RenderOptions},
    validation::{ExtendedValidatorMetrics, OpenSslInspector, UpgradeMode},
    watch::{NamespaceWatch, Watch},
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    time::Duration,
};
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "router-controller",
    about = "Configures an HAProxy ingress router from routes and endpoints"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "router_controller=info,warn",
        env = "ROUTER_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name reported in route status ingress entries.
    #[clap(long, default_value = ROUTER_CONTROLLER_NAME)]
    router_name: String,

    #[clap(long, default_value = "/var/lib/haproxy/conf/haproxy.config")]
    config_path: PathBuf,

    #[clap(long, default_value = "/var/lib/haproxy/router/certs")]
    cert_dir: PathBuf,

    #[clap(long, default_value = "/var/lib/haproxy/router/cacerts")]
    cacert_dir: PathBuf,

    /// A PEM bundle served to TLS clients that match no route.
    #[clap(long)]
    default_certificate: Option<PathBuf>,

    #[clap(long, default_value = "haproxy")]
    haproxy_binary: PathBuf,

    /// Invoked with `CONFIG_FILE` set after a configuration is written.
    #[clap(long)]
    reload_script: Option<PathBuf>,

    /// Delay between observing a change and writing the configuration, so
    /// that bursts of changes are written once.
    #[clap(long, default_value = "5000")]
    commit_interval_ms: u64,

    /// Restricts the router to namespaces matching the label selector.
    #[clap(long)]
    namespace_label_selector: Option<String>,

    /// Admits routes without validating host names, paths and certificates.
    #[clap(long)]
    extended_validation_disabled: bool,

    /// Sets the named condition on every route instead of running upgrade
    /// validation.
    #[clap(long, conflicts_with = "upgrade_validation_force_remove_condition")]
    upgrade_validation_force_add_condition: Option<String>,

    /// Clears the named condition from every route instead of running upgrade
    /// validation.
    #[clap(long)]
    upgrade_validation_force_remove_condition: Option<String>,

    /// Logs route conditions instead of writing them to route status.
    #[clap(long)]
    status_updates_disabled: bool,

    #[clap(long, default_value = "80")]
    http_port: u16,

    #[clap(long, default_value = "443")]
    https_port: u16,

    #[clap(long, default_value = "20000")]
    max_connections: u32,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            router_name,
            config_path,
            cert_dir,
            cacert_dir,
            default_certificate,
            haproxy_binary,
            reload_script,
            commit_interval_ms,
            namespace_label_selector,
            extended_validation_disabled,
            upgrade_validation_force_add_condition,
            upgrade_validation_force_remove_condition,
            status_updates_disabled,
            http_port,
            https_port,
            max_connections,
        } = self;

        let upgrade_mode = match (
            upgrade_validation_force_add_condition,
            upgrade_validation_force_remove_condition,
        ) {
            (Some(_), Some(_)) => {
                bail!("upgrade validation conditions cannot be both added and removed")
            }
            (Some(condition), None) => UpgradeMode::ForceSet(condition),
            (None, Some(condition)) => UpgradeMode::ForceClear(condition),
            (None, None) => UpgradeMode::Normal,
        };

        let state = RouterState::shared();

        let mut prom = <Registry>::default();
        let router = prom.sub_registry_with_prefix("router");
        let extended_validation =
            (!extended_validation_disabled).then(|| ExtendedValidatorMetrics::register(router));
        let commit_metrics = CommitMetrics::register(router);
        index::metrics::register(prom.sub_registry_with_prefix("router_state"), state.clone());
        let route_status = prom.sub_registry_with_prefix("route_status");
        let status_metrics = status::ControllerMetrics::register(route_status);
        let status_index_metrics = status::IndexMetrics::register(route_status);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Route conditions are either written to route status or only logged.
        let (status_index, recorder) = if status_updates_disabled {
            tracing::info!("Route status updates disabled");
            let recorder: SharedRecorder = Arc::new(LogRejections);
            (None, recorder)
        } else {
            let (updates_tx, updates_rx) = mpsc::unbounded_channel();
            let index = status::Index::shared(&router_name, updates_tx, status_index_metrics);
            let controller =
                status::Controller::new(runtime.client(), updates_rx, status_metrics);
            tokio::spawn(
                controller
                    .process_updates()
                    .instrument(info_span!("status_controller")),
            );
            let recorder: SharedRecorder = index.clone();
            (Some(index), recorder)
        };

        // Spawn resource watches. Every watch feeds the same event loop, so
        // the plugin chain sees one event at a time.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut kinds = vec![Kind::Routes, Kind::Endpoints, Kind::Nodes];

        let routes = runtime.watch_all::<k8s::Route>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(Watch::<k8s::Route>::shared(events_tx.clone()), routes)
                .instrument(info_span!("routes")),
        );

        let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(Watch::<k8s::Endpoints>::shared(events_tx.clone()), endpoints)
                .instrument(info_span!("endpoints")),
        );

        let nodes = runtime.watch_all::<k8s::Node>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(Watch::<k8s::Node>::shared(events_tx.clone()), nodes)
                .instrument(info_span!("nodes")),
        );

        if let Some(selector) = namespace_label_selector {
            tracing::info!(%selector, "Restricting routes to selected namespaces");
            kinds.push(Kind::Namespaces);
            let namespaces =
                runtime.watch_all::<k8s::Namespace>(watcher::Config::default().labels(&selector));
            tokio::spawn(
                kubert::index::cluster(NamespaceWatch::shared(events_tx.clone()), namespaces)
                    .instrument(info_span!("namespaces")),
            );
        }
        drop(events_tx);

        let (commits_tx, commits_rx) = watch::channel(0);
        let chain = chain(
            ChainConfig {
                recorder,
                inspector: OpenSslInspector::shared(),
                extended_validation,
                upgrade_mode,
            },
            state.clone(),
            commits_tx,
        );
        let event_loop = EventLoop::new(chain, state.clone(), status_index, kinds);
        tokio::spawn(event_loop.run(events_rx).instrument(info_span!("event_loop")));

        // Write the proxy configuration as the state changes.
        let scheduler = CommitScheduler::new(
            state,
            commits_rx,
            ProxyCommand::new(haproxy_binary, reload_script),
            config_path,
            RenderOptions {
                http_port,
                https_port,
                cert_dir,
                cacert_dir,
                default_certificate,
                max_connections,
            },
            Duration::from_millis(commit_interval_ms),
            commit_metrics,
        );
        tokio::spawn(
            scheduler
                .run(runtime.shutdown_handle())
                .instrument(info_span!("commit_scheduler")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let args = Args::try_parse_from(["router-controller"]).expect("defaults must parse");
        assert_eq!(args.router_name, ROUTER_CONTROLLER_NAME);
        assert_eq!(args.commit_interval_ms, 5000);
        assert_eq!(args.http_port, 80);
        assert_eq!(args.https_port, 443);
        assert!(args.namespace_label_selector.is_none());
        assert!(!args.extended_validation_disabled);
    }

    #[test]
    fn upgrade_conditions_are_exclusive() {
        assert!(Args::try_parse_from([
            "router-controller",
            "--upgrade-validation-force-add-condition=Foo",
            "--upgrade-validation-force-remove-condition=Foo",
        ])
        .is_err());

        let args = Args::try_parse_from([
            "router-controller",
            "--upgrade-validation-force-remove-condition=Foo",
        ])
        .expect("must parse");
        assert_eq!(
            args.upgrade_validation_force_remove_condition.as_deref(),
            Some("Foo")
        );
    }
}
