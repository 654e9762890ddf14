use router_controller_k8s_api::ObjectReference;

/// Derives the identity of an endpoint address.
///
/// Addresses backed by a pod in the service's namespace are identified by the
/// pod, so that the identity survives the address being reported under a
/// different endpoints object. All other addresses are identified by the
/// service.
pub fn endpoint_id(
    namespace: &str,
    service: &str,
    port_name: &str,
    ip: &str,
    port: u16,
    target_ref: Option<&ObjectReference>,
) -> String {
    if let Some(pod) = target_ref.and_then(|t| pod_name(namespace, t)) {
        return format!("pod:{pod}:{service}:{port_name}:{ip}:{port}");
    }
    format!("ept:{service}:{port_name}:{ip}:{port}")
}

fn pod_name<'t>(namespace: &str, target: &'t ObjectReference) -> Option<&'t str> {
    if target.kind.as_deref() != Some("Pod") {
        return None;
    }
    match target.namespace.as_deref() {
        None | Some("") => {}
        Some(ns) if ns == namespace => {}
        Some(_) => return None,
    }
    target.name.as_deref().filter(|n| !n.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(kind: &str, namespace: Option<&str>, name: Option<&str>) -> ObjectReference {
        ObjectReference {
            kind: Some(kind.to_string()),
            namespace: namespace.map(Into::into),
            name: name.map(Into::into),
            ..Default::default()
        }
    }

    #[test]
    fn service_identity_without_target() {
        assert_eq!(
            endpoint_id("ns", "test", "port", "1.1.1.1", 345, None),
            "ept:test:port:1.1.1.1:345"
        );
    }

    #[test]
    fn pod_identity_preferred() {
        let pod = target("Pod", Some("ns"), Some("pod-1"));
        assert_eq!(
            endpoint_id("ns", "test", "port", "2.2.2.2", 8080, Some(&pod)),
            "pod:pod-1:test:port:2.2.2.2:8080"
        );

        let pod = target("Pod", None, Some("pod-1"));
        assert_eq!(
            endpoint_id("ns", "test", "port", "2.2.2.2", 8080, Some(&pod)),
            "pod:pod-1:test:port:2.2.2.2:8080"
        );
    }

    #[test]
    fn falls_back_to_service_identity() {
        for t in [
            target("Node", Some("ns"), Some("node-1")),
            target("Pod", Some("other"), Some("pod-1")),
            target("Pod", Some("ns"), None),
            target("Pod", Some("ns"), Some("")),
        ] {
            assert_eq!(
                endpoint_id("ns", "test", "port", "2.2.2.2", 8080, Some(&t)),
                "ept:test:port:2.2.2.2:8080",
                "{t:?}"
            );
        }
    }
}
