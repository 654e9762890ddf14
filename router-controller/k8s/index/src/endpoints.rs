use anyhow::Result;
use openssl::hash::{hash, MessageDigest};
use router_controller_core::{endpoint_id, Endpoint};
use router_controller_k8s_api::{Endpoints, ResourceExt};

/// Builds the endpoint table for the ready TCP addresses of a service.
pub fn endpoints_table(endpoints: &Endpoints) -> Result<Vec<Endpoint>> {
    let namespace = endpoints.namespace().unwrap_or_default();
    let service = endpoints.name_any();

    let mut table = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        for port in subset.ports.iter().flatten() {
            if !matches!(port.protocol.as_deref(), None | Some("TCP")) {
                continue;
            }
            let Ok(port_number) = u16::try_from(port.port) else {
                tracing::warn!(%namespace, %service, port = port.port, "Ignoring invalid port");
                continue;
            };
            let port_name = port.name.clone().unwrap_or_default();

            for address in subset.addresses.iter().flatten() {
                let target = address.target_ref.as_ref();
                let id = endpoint_id(
                    &namespace,
                    &service,
                    &port_name,
                    &address.ip,
                    port_number,
                    target,
                );
                let id_hash = id_hash(&id, &address.ip, port_number)?;
                table.push(Endpoint {
                    id,
                    ip: address.ip.clone(),
                    port: port_number,
                    port_name: port_name.clone(),
                    target_name: target
                        .and_then(|t| t.name.clone())
                        .unwrap_or_else(|| address.ip.clone()),
                    id_hash,
                });
            }
        }
    }
    Ok(table)
}

/// Hex-encoded MD5 digest of an endpoint's identity.
fn id_hash(id: &str, ip: &str, port: u16) -> Result<String> {
    let digest = hash(MessageDigest::md5(), format!("{id}{ip}{port}").as_bytes())?;
    Ok(hex::encode(digest))
}
