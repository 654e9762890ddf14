//! Renders a proxy configuration from routes and endpoints read from a JSON
//! document, without a cluster.
//!
//! ```json
//! { "routes": [ ... ], "endpoints": [ ... ] }
//! ```
//!
//! Routes pass through the same validation and host arbitration as in the
//! controller. Rejections are logged to stderr; the configuration is written
//! to stdout.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use router_controller_runtime::{
    chain,
    core::{EventType, LogRejections},
    index::RouterState,
    k8s::{Endpoints, Route},
    template::{render, RenderOptions},
    validation::{ExtendedValidatorMetrics, OpenSslInspector, UpgradeMode},
    ChainConfig, Event, EventLoop, Kind,
};
use std::{io::Read, path::PathBuf, sync::Arc};
use tokio::sync::watch;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[clap(name = "config-gen", about = "Renders a proxy configuration from a file")]
struct Args {
    #[clap(long, default_value = "warn", env = "ROUTER_CONTROLLER_LOG")]
    log_level: String,

    /// The JSON document to read. Reads stdin when unset.
    input: Option<PathBuf>,

    #[clap(long, default_value = "/var/lib/haproxy/router/certs")]
    cert_dir: PathBuf,

    #[clap(long, default_value = "/var/lib/haproxy/router/cacerts")]
    cacert_dir: PathBuf,

    #[clap(long)]
    default_certificate: Option<PathBuf>,

    /// Admits routes without validating host names, paths and certificates.
    #[clap(long)]
    extended_validation_disabled: bool,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Input {
    routes: Vec<Route>,
    endpoints: Vec<Endpoints>,
}

fn main() -> Result<()> {
    let Args {
        log_level,
        input,
        cert_dir,
        cacert_dir,
        default_certificate,
        extended_validation_disabled,
    } = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&log_level)?)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    let Input { routes, endpoints } = read_input(input)?;
    tracing::debug!(routes = routes.len(), endpoints = endpoints.len(), "Read input");

    let state = RouterState::shared();
    let (commits, _) = watch::channel(0);
    let mut prom = <Registry>::default();
    let chain = chain(
        ChainConfig {
            recorder: Arc::new(LogRejections),
            inspector: OpenSslInspector::shared(),
            extended_validation: (!extended_validation_disabled)
                .then(|| ExtendedValidatorMetrics::register(&mut prom)),
            upgrade_mode: UpgradeMode::Normal,
        },
        state.clone(),
        commits,
    );

    let mut events = EventLoop::new(chain, state.clone(), None, [Kind::Routes, Kind::Endpoints]);
    for ep in endpoints {
        events.handle(Event::Endpoints(EventType::Added, Box::new(ep)));
    }
    events.handle(Event::Synced(Kind::Endpoints));
    for route in routes {
        events.handle(Event::Route(EventType::Added, Box::new(route)));
    }
    events.handle(Event::Synced(Kind::Routes));

    let snapshot = state.read().snapshot();
    let rendered = render(
        &snapshot,
        &RenderOptions {
            cert_dir,
            cacert_dir,
            default_certificate,
            ..Default::default()
        },
    )?;
    for path in rendered.certificates.keys() {
        tracing::info!(path = %path.display(), "Configuration refers to route certificate");
    }
    print!("{}", rendered.config);

    Ok(())
}

fn read_input(path: Option<PathBuf>) -> Result<Input> {
    let buf = match path {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };
    serde_json::from_str(&buf).context("failed to parse input")
}
