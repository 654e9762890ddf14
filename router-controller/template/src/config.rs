//! Renders a [`Snapshot`] of the router state as proxy configuration.

use crate::rewrite::{accept_value, replace_path_directive, single_quote, UnsafeValue};
use router_controller_core::{ResourceId, ServiceAliasConfig, TlsSettings};
use router_controller_k8s_api::TlsTermination;
use router_controller_k8s_index::Snapshot;
use std::{
    collections::BTreeMap,
    fmt::{self, Write},
    path::PathBuf,
};
use thiserror::Error;

/// The address the TLS-terminating frontend listens on. Connections are
/// forwarded to it from the SNI frontend.
const FE_SNI_ADDR: &str = "127.0.0.1:10444";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderOptions {
    pub http_port: u16,
    pub https_port: u16,

    /// Where edge and reencrypt route certificates are written.
    pub cert_dir: PathBuf,

    /// Where reencrypt destination CA certificates are written.
    pub cacert_dir: PathBuf,

    pub default_certificate: Option<PathBuf>,
    pub max_connections: u32,
}

/// A rendered configuration and the certificate files it refers to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderedConfig {
    pub config: String,
    pub certificates: BTreeMap<PathBuf, String>,

    /// Routes left out of the configuration because one of their values
    /// cannot be embedded safely.
    pub skipped: Vec<UnsafeRoute>,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Format(#[from] fmt::Error),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UnsafeRoute {
    #[error("route {route} has a path that cannot be embedded in a rewrite: {path:?}: {source}")]
    Path {
        route: ResourceId,
        path: String,
        #[source]
        source: UnsafeValue,
    },

    #[error("route {route} has control characters in its {field}")]
    ControlCharacter {
        route: ResourceId,
        field: &'static str,
    },
}

/// How a route is reached through the HTTP frontend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Insecure {
    Serve,
    Redirect,
    Refuse,
}

// === impl RenderOptions ===

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            cert_dir: PathBuf::from("/var/lib/haproxy/router/certs"),
            cacert_dir: PathBuf::from("/var/lib/haproxy/router/cacerts"),
            default_certificate: None,
            max_connections: 20000,
        }
    }
}

/// Renders the proxy configuration for every route in the snapshot.
///
/// Routes are expected to have been checked at admission. A route whose
/// values still cannot be embedded safely is left out and reported in
/// [`RenderedConfig::skipped`]; every other route is rendered.
pub fn render(snapshot: &Snapshot, opts: &RenderOptions) -> Result<RenderedConfig, RenderError> {
    let mut served = Vec::with_capacity(snapshot.routes.len());
    let mut skipped = Vec::new();
    for route in snapshot.routes.values() {
        match check_route(route) {
            Ok(()) => served.push(route),
            Err(error) => {
                tracing::warn!(%error, "Leaving route out of the configuration");
                skipped.push(error);
            }
        }
    }

    let mut routes = served.clone();
    // Longer paths are matched first so that a prefix does not shadow a more
    // specific route on the same host.
    routes.sort_by(|a, b| {
        b.path
            .len()
            .cmp(&a.path.len())
            .then_with(|| a.host.cmp(&b.host))
            .then_with(|| a.path.cmp(&b.path))
    });

    let mut config = String::new();
    let mut certificates = BTreeMap::new();

    writeln!(
        config,
        "# Generated by {}. Do not edit.\n# generation {}\n",
        router_controller_core::ROUTER_CONTROLLER_NAME,
        snapshot.generation
    )?;
    write_globals(&mut config, opts)?;
    write_public(&mut config, opts, &routes)?;
    write_public_ssl(&mut config, opts, &routes)?;
    write_fe_sni(&mut config, opts, &routes)?;

    for route in served {
        write_backend(&mut config, snapshot, opts, route)?;

        let Some(tls) = route.tls.as_ref() else {
            continue;
        };
        if let Some(pem) = certificate_bundle(tls) {
            certificates.insert(opts.cert_dir.join(pem_file(&route.route)), pem);
        }
        if tls.termination == TlsTermination::Reencrypt {
            if let Some(ca) = tls.destination_ca_certificate.as_ref() {
                certificates.insert(opts.cacert_dir.join(pem_file(&route.route)), ca.clone());
            }
        }
    }

    Ok(RenderedConfig {
        config,
        certificates,
        skipped,
    })
}

/// Checks every value of a route that is embedded in the configuration.
fn check_route(route: &ServiceAliasConfig) -> Result<(), UnsafeRoute> {
    let control = |field: &'static str, value: &str| {
        if value.chars().any(char::is_control) {
            return Err(UnsafeRoute::ControlCharacter {
                route: route.route.clone(),
                field,
            });
        }
        Ok(())
    };
    control("host", &route.host)?;
    control("path", &route.path)?;

    let Some(target) = route.rewrite_target.as_ref() else {
        return Ok(());
    };
    accept_value(&route.path).map_err(|source| UnsafeRoute::Path {
        route: route.route.clone(),
        path: route.path.clone(),
        source,
    })?;
    control("rewrite target", target)
}

fn write_globals(config: &mut String, opts: &RenderOptions) -> fmt::Result {
    writeln!(config, "global")?;
    writeln!(config, "  maxconn {}", opts.max_connections)?;
    writeln!(config, "  daemon")?;
    writeln!(config, "  ca-base /etc/ssl")?;
    writeln!(config, "  crt-base /etc/ssl")?;
    writeln!(config)?;
    writeln!(config, "defaults")?;
    writeln!(config, "  maxconn {}", opts.max_connections)?;
    writeln!(config, "  timeout connect 5s")?;
    writeln!(config, "  timeout client 30s")?;
    writeln!(config, "  timeout client-fin 1s")?;
    writeln!(config, "  timeout server 30s")?;
    writeln!(config, "  timeout server-fin 1s")?;
    writeln!(config, "  timeout http-request 10s")?;
    writeln!(config, "  timeout http-keep-alive 300s")?;
    writeln!(config, "  timeout tunnel 1h")?;
    writeln!(config)
}

fn write_public(
    config: &mut String,
    opts: &RenderOptions,
    routes: &[&ServiceAliasConfig],
) -> fmt::Result {
    writeln!(config, "frontend public")?;
    writeln!(config, "  bind :{}", opts.http_port)?;
    writeln!(config, "  mode http")?;
    writeln!(config, "  tcp-request inspect-delay 5s")?;
    writeln!(config, "  tcp-request content accept if HTTP")?;

    for route in routes {
        if insecure(route) == Insecure::Redirect {
            writeln!(
                config,
                "  http-request redirect scheme https if {}",
                http_acl(route)
            )?;
        }
    }
    for route in routes {
        if insecure(route) == Insecure::Serve {
            writeln!(
                config,
                "  use_backend {} if {}",
                backend_name(route),
                http_acl(route)
            )?;
        }
    }
    writeln!(config)
}

fn write_public_ssl(
    config: &mut String,
    opts: &RenderOptions,
    routes: &[&ServiceAliasConfig],
) -> fmt::Result {
    writeln!(config, "frontend public_ssl")?;
    writeln!(config, "  bind :{}", opts.https_port)?;
    writeln!(config, "  mode tcp")?;
    writeln!(config, "  tcp-request inspect-delay 5s")?;
    writeln!(config, "  tcp-request content accept if {{ req_ssl_hello_type 1 }}")?;
    for route in routes {
        if route.termination() == Some(TlsTermination::Passthrough) {
            writeln!(
                config,
                "  use_backend {} if {{ req_ssl_sni -i {} }}",
                backend_name(route),
                single_quote(&route.host)
            )?;
        }
    }
    writeln!(config, "  default_backend be_sni")?;
    writeln!(config)?;

    writeln!(config, "backend be_sni")?;
    writeln!(config, "  mode tcp")?;
    writeln!(config, "  server fe_sni {FE_SNI_ADDR} weight 1 send-proxy")?;
    writeln!(config)
}

fn write_fe_sni(
    config: &mut String,
    opts: &RenderOptions,
    routes: &[&ServiceAliasConfig],
) -> fmt::Result {
    write!(config, "frontend fe_sni\n  bind {FE_SNI_ADDR} ssl")?;
    if let Some(default) = opts.default_certificate.as_ref() {
        write!(config, " crt {}", single_quote(&default.to_string_lossy()))?;
    }
    writeln!(
        config,
        " crt {} accept-proxy",
        single_quote(&opts.cert_dir.to_string_lossy())
    )?;
    writeln!(config, "  mode http")?;
    for route in routes {
        if matches!(
            route.termination(),
            Some(TlsTermination::Edge | TlsTermination::Reencrypt)
        ) {
            writeln!(
                config,
                "  use_backend {} if {}",
                backend_name(route),
                http_acl(route)
            )?;
        }
    }
    writeln!(config)
}

fn write_backend(
    config: &mut String,
    snapshot: &Snapshot,
    opts: &RenderOptions,
    route: &ServiceAliasConfig,
) -> fmt::Result {
    let termination = route.termination();
    writeln!(config, "backend {}", backend_name(route))?;
    if termination == Some(TlsTermination::Passthrough) {
        writeln!(config, "  mode tcp")?;
        writeln!(config, "  balance source")?;
    } else {
        writeln!(config, "  mode http")?;
        writeln!(config, "  option redispatch")?;
        writeln!(config, "  balance leastconn")?;
        if termination.is_some() {
            writeln!(config, "  http-request set-header X-Forwarded-Proto https")?;
        }
        if let Some(target) = route.rewrite_target.as_ref() {
            writeln!(config, "  {}", replace_path_directive(&route.path, target))?;
        }
    }

    let server_tls = match (termination, route.tls.as_ref()) {
        (Some(TlsTermination::Reencrypt), Some(tls)) => {
            Some(match tls.destination_ca_certificate {
                Some(_) => format!(
                    " ssl verify required ca-file {}",
                    single_quote(&opts.cacert_dir.join(pem_file(&route.route)).to_string_lossy())
                ),
                None => " ssl verify none".to_string(),
            })
        }
        _ => None,
    };

    for (key, weight) in &route.service_units {
        if *weight == 0 {
            continue;
        }
        let Some(unit) = snapshot.service_units.get(key) else {
            continue;
        };
        let endpoints = unit.endpoints.iter().filter(|ep| match &route.preferred_port {
            Some(port) => ep.port_name == *port || ep.port.to_string() == *port,
            None => true,
        });
        for ep in endpoints {
            writeln!(
                config,
                "  server {} {}:{} weight {weight}{}",
                ep.id_hash,
                ep.ip,
                ep.port,
                server_tls.as_deref().unwrap_or_default(),
            )?;
        }
    }
    writeln!(config)
}

fn insecure(route: &ServiceAliasConfig) -> Insecure {
    let Some(tls) = route.tls.as_ref() else {
        return Insecure::Serve;
    };
    if tls.termination == TlsTermination::Passthrough {
        return Insecure::Refuse;
    }
    match tls.insecure_edge_termination_policy.as_deref() {
        Some(policy) if policy.eq_ignore_ascii_case("redirect") => Insecure::Redirect,
        Some(policy) if policy.eq_ignore_ascii_case("allow") => Insecure::Serve,
        _ => Insecure::Refuse,
    }
}

fn backend_name(route: &ServiceAliasConfig) -> String {
    let prefix = match route.termination() {
        None => "be_http",
        Some(TlsTermination::Edge) => "be_edge_http",
        Some(TlsTermination::Reencrypt) => "be_secure",
        Some(TlsTermination::Passthrough) => "be_tcp",
    };
    format!("{prefix}:{}:{}", route.route.namespace, route.route.name)
}

fn http_acl(route: &ServiceAliasConfig) -> String {
    let host = format!("{{ hdr(host) -i {} }}", single_quote(&route.host));
    if route.path.is_empty() {
        return host;
    }
    format!("{host} {{ path_beg {} }}", single_quote(&route.path))
}

fn pem_file(route: &ResourceId) -> String {
    format!("{}:{}.pem", route.namespace, route.name)
}

/// Concatenates a route's certificate, key and CA certificate.
fn certificate_bundle(tls: &TlsSettings) -> Option<String> {
    if tls.termination == TlsTermination::Passthrough {
        return None;
    }
    let mut pem = String::new();
    for part in [&tls.certificate, &tls.key, &tls.ca_certificate]
        .into_iter()
        .flatten()
    {
        pem.push_str(part.trim_end());
        pem.push('\n');
    }
    tls.certificate.as_ref().map(|_| pem)
}
