//! Route rule sets.
//!
//! Each rule set checks a route and aggregates every violation it finds, so
//! that a route's status reports all of its problems at once.

use crate::cert::{CertificateInspector, TlsError};
use regex::Regex;
use router_controller_k8s_api::{InvalidTermination, Route, TlsConfig, TlsTermination};
use router_controller_template::rewrite::{self, StrictPathError, UnsafeValue};
use std::fmt;
use thiserror::Error;

const DNS_1123_SUBDOMAIN_REGEX: &str =
    r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";

const MAX_HOST_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// RSA keys shorter than this will not be served by future versions.
pub const MIN_RSA_KEY_BITS: u32 = 2048;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("must be no more than {} characters", MAX_HOST_LEN)]
    HostTooLong,

    #[error("each label must be no more than {} characters", MAX_LABEL_LEN)]
    LabelTooLong,

    #[error(
        "must consist of lower case alphanumeric characters, '-' or '.', and must start and end \
         with an alphanumeric character"
    )]
    InvalidHost,

    #[error("must begin with '/'")]
    PathNotAbsolute,

    #[error("must not contain control characters")]
    ControlCharacter,

    #[error("cannot be used with a rewrite target: {0}")]
    UnsafeRewritePath(#[source] UnsafeValue),

    #[error("will not be accepted with a rewrite target by future versions: {0}")]
    StrictRewritePath(#[source] StrictPathError),

    #[error(transparent)]
    Termination(#[from] InvalidTermination),

    #[error("not allowed with {0} termination")]
    NotAllowed(TlsTermination),

    #[error("must be specified with {0}")]
    Required(&'static str),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("certificate {0:?} is signed with SHA1")]
    Sha1Signature(String),

    #[error(
        "certificate {subject:?} has a {bits} bit RSA key; at least {} bits are required",
        MIN_RSA_KEY_BITS
    )]
    WeakKey { subject: String, bits: u32 },
}

/// A rule violation and the route field it applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub error: RuleError,
}

/// All rule violations found on a route.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

// === impl FieldError ===

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.error)
    }
}

// === impl ValidationErrors ===

impl ValidationErrors {
    fn push(&mut self, field: &'static str, error: impl Into<RuleError>) {
        self.0.push(FieldError {
            field,
            error: error.into(),
        });
    }

    fn into_result(self) -> Result<(), Self> {
        if self.0.is_empty() {
            return Ok(());
        }
        Err(self)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [error] = self.0.as_slice() {
            return error.fmt(f);
        }
        write!(f, "[")?;
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            error.fmt(f)?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for ValidationErrors {}

/// Checks everything a route must satisfy to be served.
pub fn validate_route(
    route: &Route,
    inspector: &dyn CertificateInspector,
) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();

    if !route.spec.host.is_empty() {
        if let Err(error) = validate_host(&route.spec.host) {
            errors.push("spec.host", error);
        }
    }

    if !route.spec.path.is_empty() && !route.spec.path.starts_with('/') {
        errors.push("spec.path", RuleError::PathNotAbsolute);
    }
    validate_embedded_path(route, &mut errors);

    if let Some(tls) = route.spec.tls.as_ref() {
        validate_tls(tls, inspector, &mut errors);
    }

    errors.into_result()
}

/// Checks that a route's values can be embedded in the proxy configuration.
/// This holds even when the rest of [`validate_route`] is not enforced.
pub fn validate_route_embedding(route: &Route) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    if route.spec.host.chars().any(char::is_control) {
        errors.push("spec.host", RuleError::ControlCharacter);
    }
    validate_embedded_path(route, &mut errors);
    errors.into_result()
}

fn validate_embedded_path(route: &Route, errors: &mut ValidationErrors) {
    let path = &route.spec.path;
    if path.chars().any(char::is_control) {
        errors.push("spec.path", RuleError::ControlCharacter);
    }

    if let Some(target) = route.rewrite_target() {
        if let Err(error) = rewrite::accept_value(path) {
            errors.push("spec.path", RuleError::UnsafeRewritePath(error));
        }
        if target.chars().any(char::is_control) {
            errors.push(
                "metadata.annotations.haproxy.router.openshift.io/rewrite-target",
                RuleError::ControlCharacter,
            );
        }
    }
}

/// Checks the rules future versions will hold routes to. Routes failing
/// them are still served.
pub fn validate_route_post_upgrade(route: &Route) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    if route.rewrite_target().is_some() && !route.spec.path.is_empty() {
        if let Err(error) = rewrite::check_strict_path(&route.spec.path) {
            errors.push("spec.path", RuleError::StrictRewritePath(error));
        }
    }
    errors.into_result()
}

/// Reports certificates signed with SHA1. Certificates that cannot be parsed
/// are not reported.
pub fn validate_route_deprecations(
    route: &Route,
    inspector: &dyn CertificateInspector,
) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    for (field, pem) in certificates(route) {
        let Ok(infos) = inspector.parse_certificates(pem) else {
            continue;
        };
        for info in infos.into_iter().filter(|info| info.sha1_signature) {
            errors.push(field, RuleError::Sha1Signature(info.subject));
        }
    }
    errors.into_result()
}

/// Reports certificates with RSA keys too small to be served by future
/// versions.
pub fn validate_route_upgrade(
    route: &Route,
    inspector: &dyn CertificateInspector,
) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    for (field, pem) in certificates(route) {
        let Ok(infos) = inspector.parse_certificates(pem) else {
            continue;
        };
        for info in infos {
            match info.rsa_bits {
                Some(bits) if bits < MIN_RSA_KEY_BITS => errors.push(
                    field,
                    RuleError::WeakKey {
                        subject: info.subject,
                        bits,
                    },
                ),
                _ => {}
            }
        }
    }
    errors.into_result()
}

fn validate_host(host: &str) -> Result<(), RuleError> {
    if host.len() > MAX_HOST_LEN {
        return Err(RuleError::HostTooLong);
    }
    let regex = Regex::new(DNS_1123_SUBDOMAIN_REGEX).expect("should_compile");
    if !regex.is_match(host) {
        return Err(RuleError::InvalidHost);
    }
    if host.split('.').any(|label| label.len() > MAX_LABEL_LEN) {
        return Err(RuleError::LabelTooLong);
    }
    Ok(())
}

fn validate_tls(tls: &TlsConfig, inspector: &dyn CertificateInspector, errors: &mut ValidationErrors) {
    let termination = match tls.termination() {
        Ok(termination) => termination,
        Err(error) => {
            errors.push("spec.tls.termination", error);
            return;
        }
    };

    match termination {
        TlsTermination::Passthrough => {
            let fields = [
                ("spec.tls.certificate", tls.certificate()),
                ("spec.tls.key", tls.key()),
                ("spec.tls.caCertificate", tls.ca_certificate()),
                (
                    "spec.tls.destinationCACertificate",
                    tls.destination_ca_certificate(),
                ),
            ];
            for (field, _) in fields.into_iter().filter(|(_, value)| value.is_some()) {
                errors.push(field, RuleError::NotAllowed(termination));
            }
            return;
        }
        TlsTermination::Edge => {
            if tls.destination_ca_certificate().is_some() {
                errors.push(
                    "spec.tls.destinationCACertificate",
                    RuleError::NotAllowed(termination),
                );
            }
        }
        TlsTermination::Reencrypt => {}
    }

    match (tls.certificate(), tls.key()) {
        (Some(certificate), Some(key)) => match inspector.parse_certificates(certificate) {
            Err(error) => errors.push("spec.tls.certificate", error),
            Ok(_) => {
                if let Err(error) = inspector.verify_key_pair(certificate, key) {
                    errors.push("spec.tls.key", error);
                }
                if let Some(ca) = tls.ca_certificate() {
                    match inspector.parse_certificates(ca) {
                        Err(error) => errors.push("spec.tls.caCertificate", error),
                        Ok(_) => {
                            if let Err(error) = inspector.verify_chain(certificate, ca) {
                                errors.push("spec.tls.certificate", error);
                            }
                        }
                    }
                }
            }
        },
        (Some(_), None) => errors.push("spec.tls.key", RuleError::Required("spec.tls.certificate")),
        (None, Some(_)) => errors.push("spec.tls.certificate", RuleError::Required("spec.tls.key")),
        (None, None) => {
            if let Some(Err(error)) = tls.ca_certificate().map(|ca| inspector.parse_certificates(ca)) {
                errors.push("spec.tls.caCertificate", error);
            }
        }
    }

    if termination == TlsTermination::Reencrypt {
        if let Some(Err(error)) = tls
            .destination_ca_certificate()
            .map(|ca| inspector.parse_certificates(ca))
        {
            errors.push("spec.tls.destinationCACertificate", error);
        }
    }
}

/// Iterates over the certificate material of a route's TLS configuration.
fn certificates(route: &Route) -> impl Iterator<Item = (&'static str, &str)> {
    let tls = route.spec.tls.as_ref();
    [
        ("spec.tls.certificate", tls.and_then(TlsConfig::certificate)),
        (
            "spec.tls.caCertificate",
            tls.and_then(TlsConfig::ca_certificate),
        ),
        (
            "spec.tls.destinationCACertificate",
            tls.and_then(TlsConfig::destination_ca_certificate),
        ),
    ]
    .into_iter()
    .filter_map(|(field, pem)| Some((field, pem?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cert::OpenSslInspector,
        test_certs::{self, Digest},
    };
    use router_controller_k8s_api::{ObjectMeta, RouteSpec, REWRITE_TARGET_ANNOTATION};

    fn mk_route(host: &str, path: &str, rewrite_target: Option<&str>, tls: Option<TlsConfig>) -> Route {
        Route {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some("web".to_string()),
                annotations: rewrite_target.map(|target| {
                    maplit::btreemap! {
                        REWRITE_TARGET_ANNOTATION.to_string() => target.to_string(),
                    }
                }),
                ..Default::default()
            },
            spec: RouteSpec {
                host: host.to_string(),
                path: path.to_string(),
                tls,
                ..Default::default()
            },
            status: None,
        }
    }

    fn mk_tls(termination: &str) -> TlsConfig {
        TlsConfig {
            termination: termination.to_string(),
            ..Default::default()
        }
    }

    fn fields(result: Result<(), ValidationErrors>) -> Vec<&'static str> {
        result
            .err()
            .map(|errors| errors.0.into_iter().map(|e| e.field).collect())
            .unwrap_or_default()
    }

    #[test]
    fn valid_hosts() {
        for host in ["www.example.com", "a", "a-b.c0", "a".repeat(63).as_str()] {
            assert_eq!(validate_host(host), Ok(()), "{host}");
        }
    }

    #[test]
    fn invalid_hosts() {
        assert_eq!(validate_host("Example.com"), Err(RuleError::InvalidHost));
        assert_eq!(validate_host("-a.com"), Err(RuleError::InvalidHost));
        assert_eq!(validate_host("a..com"), Err(RuleError::InvalidHost));
        assert_eq!(validate_host("a.com."), Err(RuleError::InvalidHost));
        assert_eq!(validate_host("a b.com"), Err(RuleError::InvalidHost));
        assert_eq!(validate_host(&"a".repeat(64)), Err(RuleError::LabelTooLong));
        let long = vec!["a".repeat(50); 6].join(".");
        assert_eq!(validate_host(&long), Err(RuleError::HostTooLong));
    }

    #[test]
    fn paths() {
        let inspector = OpenSslInspector;
        assert_eq!(
            validate_route(&mk_route("www.example.com", "/app", None, None), &inspector),
            Ok(())
        );
        assert_eq!(
            validate_route(&mk_route("", "", None, None), &inspector),
            Ok(())
        );
        assert_eq!(
            fields(validate_route(&mk_route("www.example.com", "app", None, None), &inspector)),
            vec!["spec.path"]
        );
        assert_eq!(
            fields(validate_route(&mk_route("www.example.com", "/a\nb", None, None), &inspector)),
            vec!["spec.path"]
        );
    }

    #[test]
    fn rewrite_paths() {
        let inspector = OpenSslInspector;

        // Unsafe paths are only a problem when they are embedded in a rewrite.
        let route = mk_route("www.example.com", "/foo bar", None, None);
        assert_eq!(validate_route(&route, &inspector), Ok(()));

        let route = mk_route("www.example.com", "/foo bar", Some("/"), None);
        let errors = validate_route(&route, &inspector).expect_err("must be rejected");
        assert_eq!(
            errors.0,
            vec![FieldError {
                field: "spec.path",
                error: RuleError::UnsafeRewritePath(UnsafeValue::UnquotedSeparator(' ', 4)),
            }]
        );
        assert_eq!(
            errors.to_string(),
            "spec.path: cannot be used with a rewrite target: unquoted ' ' at offset 4 would split the directive"
        );

        let route = mk_route("www.example.com", "/'foo bar'", Some("/\r"), None);
        assert_eq!(
            fields(validate_route(&route, &inspector)),
            vec!["metadata.annotations.haproxy.router.openshift.io/rewrite-target"]
        );
    }

    #[test]
    fn post_upgrade_paths() {
        let route = mk_route("www.example.com", "/[a-z]+", Some("/"), None);
        assert_eq!(validate_route(&route, &OpenSslInspector), Ok(()));
        assert_eq!(
            validate_route_post_upgrade(&route),
            Err(ValidationErrors(vec![FieldError {
                field: "spec.path",
                error: RuleError::StrictRewritePath(StrictPathError::UnescapedBracket('[')),
            }]))
        );

        // Without a rewrite target the path is not a regular expression.
        let route = mk_route("www.example.com", "/[a-z]+", None, None);
        assert_eq!(validate_route_post_upgrade(&route), Ok(()));
    }

    #[test]
    fn embedding_rules() {
        // Only values that would break the configuration are checked.
        for route in [
            mk_route("Not A Host", "app", None, Some(mk_tls("bogus"))),
            mk_route("www.example.com", "/foo bar", None, None),
            mk_route("www.example.com", "/'foo bar'", Some("/"), None),
        ] {
            assert_eq!(validate_route_embedding(&route), Ok(()), "{:?}", route.spec);
        }

        assert_eq!(
            fields(validate_route_embedding(&mk_route("www.example.com\n", "/", None, None))),
            vec!["spec.host"]
        );
        assert_eq!(
            fields(validate_route_embedding(&mk_route(
                "www.example.com",
                "/x' }\n  bind :6666\n#",
                None,
                None
            ))),
            vec!["spec.path"]
        );
        assert_eq!(
            validate_route_embedding(&mk_route("www.example.com", "/foo # bar", Some("/"), None)),
            Err(ValidationErrors(vec![FieldError {
                field: "spec.path",
                error: RuleError::UnsafeRewritePath(UnsafeValue::UnquotedSeparator(' ', 4)),
            }]))
        );
        assert_eq!(
            fields(validate_route_embedding(&mk_route("www.example.com", "/", Some("/\n"), None))),
            vec!["metadata.annotations.haproxy.router.openshift.io/rewrite-target"]
        );
    }

    #[test]
    fn termination_rules() {
        let inspector = OpenSslInspector;
        let ca = test_certs::ca("root-ca", test_certs::rsa(2048));
        let leaf = ca.issue("www.example.com", test_certs::ec(), Digest::Sha256);

        let tls = mk_tls("bogus");
        assert_eq!(
            fields(validate_route(&mk_route("www.example.com", "", None, Some(tls)), &inspector)),
            vec!["spec.tls.termination"]
        );

        let tls = TlsConfig {
            certificate: Some(leaf.cert_pem()),
            key: Some(leaf.key_pem()),
            ..mk_tls("passthrough")
        };
        assert_eq!(
            fields(validate_route(&mk_route("www.example.com", "", None, Some(tls)), &inspector)),
            vec!["spec.tls.certificate", "spec.tls.key"]
        );

        let tls = TlsConfig {
            destination_ca_certificate: Some(ca.cert_pem()),
            ..mk_tls("edge")
        };
        assert_eq!(
            fields(validate_route(&mk_route("www.example.com", "", None, Some(tls)), &inspector)),
            vec!["spec.tls.destinationCACertificate"]
        );

        let tls = TlsConfig {
            certificate: Some(leaf.cert_pem()),
            ..mk_tls("edge")
        };
        assert_eq!(
            fields(validate_route(&mk_route("www.example.com", "", None, Some(tls)), &inspector)),
            vec!["spec.tls.key"]
        );

        // Empty material is treated as unset.
        let tls = TlsConfig {
            certificate: Some(String::new()),
            key: Some(String::new()),
            ..mk_tls("passthrough")
        };
        assert_eq!(
            validate_route(&mk_route("www.example.com", "", None, Some(tls)), &inspector),
            Ok(())
        );
    }

    #[test]
    fn edge_certificates() {
        let inspector = OpenSslInspector;
        let ca = test_certs::ca("root-ca", test_certs::rsa(2048));
        let other_ca = test_certs::ca("other-ca", test_certs::rsa(2048));
        let leaf = ca.issue("www.example.com", test_certs::ec(), Digest::Sha256);
        let other = ca.issue("other.example.com", test_certs::ec(), Digest::Sha256);

        let tls = TlsConfig {
            certificate: Some(leaf.cert_pem()),
            key: Some(leaf.key_pem()),
            ca_certificate: Some(ca.cert_pem()),
            ..mk_tls("edge")
        };
        let route = mk_route("www.example.com", "", None, Some(tls.clone()));
        assert_eq!(validate_route(&route, &inspector), Ok(()));

        let route = mk_route(
            "www.example.com",
            "",
            None,
            Some(TlsConfig {
                key: Some(other.key_pem()),
                ..tls.clone()
            }),
        );
        let errors = validate_route(&route, &inspector).expect_err("must be rejected");
        assert_eq!(
            errors.0,
            vec![FieldError {
                field: "spec.tls.key",
                error: RuleError::Tls(TlsError::KeyMismatch),
            }]
        );

        let route = mk_route(
            "www.example.com",
            "",
            None,
            Some(TlsConfig {
                ca_certificate: Some(other_ca.cert_pem()),
                ..tls.clone()
            }),
        );
        assert_eq!(
            fields(validate_route(&route, &inspector)),
            vec!["spec.tls.certificate"]
        );

        let route = mk_route(
            "www.example.com",
            "",
            None,
            Some(TlsConfig {
                certificate: Some("garbage".to_string()),
                ..tls
            }),
        );
        assert_eq!(
            fields(validate_route(&route, &inspector)),
            vec!["spec.tls.certificate"]
        );
    }

    #[test]
    fn reencrypt_destination_ca() {
        let inspector = OpenSslInspector;
        let tls = TlsConfig {
            destination_ca_certificate: Some("garbage".to_string()),
            ..mk_tls("reencrypt")
        };
        assert_eq!(
            fields(validate_route(&mk_route("www.example.com", "", None, Some(tls)), &inspector)),
            vec!["spec.tls.destinationCACertificate"]
        );
    }

    #[test]
    fn multiple_errors_are_aggregated() {
        let route = mk_route("Bad_Host", "app", None, Some(mk_tls("bogus")));
        let errors = validate_route(&route, &OpenSslInspector).expect_err("must be rejected");
        assert_eq!(errors.len(), 3);
        let message = errors.to_string();
        assert!(message.starts_with("[spec.host: "), "{message}");
        assert!(message.ends_with(']'), "{message}");
    }

    #[test]
    fn sha1_certificates_are_deprecated() {
        let inspector = OpenSslInspector;
        let ca = test_certs::ca("root-ca", test_certs::rsa(2048));
        let sha1 = ca.issue("www.example.com", test_certs::rsa(2048), Digest::Sha1);
        let sha256 = ca.issue("www.example.com", test_certs::rsa(2048), Digest::Sha256);

        let route = |cert: &test_certs::Issued| {
            mk_route(
                "www.example.com",
                "",
                None,
                Some(TlsConfig {
                    certificate: Some(cert.cert_pem()),
                    key: Some(cert.key_pem()),
                    ..mk_tls("edge")
                }),
            )
        };
        assert_eq!(
            validate_route_deprecations(&route(&sha1), &inspector),
            Err(ValidationErrors(vec![FieldError {
                field: "spec.tls.certificate",
                error: RuleError::Sha1Signature("www.example.com".to_string()),
            }]))
        );
        assert_eq!(validate_route_deprecations(&route(&sha256), &inspector), Ok(()));

        let garbage = mk_route(
            "www.example.com",
            "",
            None,
            Some(TlsConfig {
                certificate: Some("garbage".to_string()),
                ..mk_tls("edge")
            }),
        );
        assert_eq!(validate_route_deprecations(&garbage, &inspector), Ok(()));
    }

    #[test]
    fn small_rsa_keys_fail_upgrade() {
        let inspector = OpenSslInspector;
        let ca = test_certs::ca("root-ca", test_certs::rsa(2048));
        let weak = ca.issue("www.example.com", test_certs::rsa(1024), Digest::Sha256);
        let ec = ca.issue("www.example.com", test_certs::ec(), Digest::Sha256);

        let route = mk_route(
            "www.example.com",
            "",
            None,
            Some(TlsConfig {
                certificate: Some(weak.cert_pem()),
                key: Some(weak.key_pem()),
                ca_certificate: Some(ca.cert_pem()),
                ..mk_tls("edge")
            }),
        );
        assert_eq!(
            validate_route_upgrade(&route, &inspector),
            Err(ValidationErrors(vec![FieldError {
                field: "spec.tls.certificate",
                error: RuleError::WeakKey {
                    subject: "www.example.com".to_string(),
                    bits: 1024,
                },
            }]))
        );

        let route = mk_route(
            "www.example.com",
            "",
            None,
            Some(TlsConfig {
                certificate: Some(ec.cert_pem()),
                key: Some(ec.key_pem()),
                ..mk_tls("edge")
            }),
        );
        assert_eq!(validate_route_upgrade(&route, &inspector), Ok(()));
    }
}
