use std::collections::BTreeMap;

pub use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use rosterd_ipam::allocator::IpReservation;
use rosterd_ipam::range::Range;

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(group = "rosterd.io", version = "v1alpha1", kind = "IPPool", namespaced)]
#[kube(
    printcolumn = r#"{"name":"RANGE", "type":"string", "description":"The IP range served by this pool", "jsonPath":".spec.range"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct IPPoolSpec {
    /// Range is an RFC 4632/4291-style string representing the pool's CIDR.
    pub range: String,
    /// Allocations maps the decimal offset of each reserved IP from the
    /// range's network address to the attachment owning it.
    #[serde(default)]
    pub allocations: BTreeMap<String, IPAllocation>,
}

/// Metadata about the pod/container owner of a specific IP.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq, JsonSchema)]
pub struct IPAllocation {
    pub id: String,
    pub podref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifname: Option<String>,
}

impl IPPool {
    /// Expands the offset-keyed allocation map into reservations. Entries
    /// whose key does not parse or does not map into the range are dropped
    /// with a warning rather than wedging the whole pool.
    pub fn reservations(&self, range: &Range) -> Vec<IpReservation> {
        self.spec
            .allocations
            .iter()
            .filter_map(|(key, allocation)| {
                let offset: u128 = match key.parse() {
                    Ok(offset) => offset,
                    Err(_) => {
                        tracing::warn!(key, "dropping allocation with malformed offset key");
                        return None;
                    }
                };
                let ip = match range.address_at(offset) {
                    Ok(ip) => ip,
                    Err(_) => {
                        tracing::warn!(key, range = %range, "dropping allocation outside the range");
                        return None;
                    }
                };
                Some(IpReservation {
                    ip,
                    container_id: allocation.id.clone(),
                    pod_ref: allocation.podref.clone(),
                    ifname: allocation.ifname.clone().unwrap_or_default(),
                })
            })
            .collect()
    }
}

pub fn allocations_from_reservations(
    range: &Range,
    reservations: &[IpReservation],
) -> BTreeMap<String, IPAllocation> {
    reservations
        .iter()
        .filter_map(|r| {
            let offset = range.offset_of(&r.ip).ok()?;
            Some((
                offset.to_string(),
                IPAllocation {
                    id: r.container_id.clone(),
                    podref: r.pod_ref.clone(),
                    ifname: if r.ifname.is_empty() {
                        None
                    } else {
                        Some(r.ifname.clone())
                    },
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::str::FromStr;

    #[test]
    fn works_allocation_map_roundtrip() {
        let range = Range::parse("192.168.1.0/24").unwrap();
        let reservations = vec![IpReservation {
            ip: IpAddr::from_str("192.168.1.1").unwrap(),
            container_id: "cid-0".to_string(),
            pod_ref: "dummyNS/dummyPOD-0".to_string(),
            ifname: "net1".to_string(),
        }];
        let allocations = allocations_from_reservations(&range, &reservations);
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations["1"].id, "cid-0");

        let pool = IPPool::new(
            "10.0.0.0-8",
            IPPoolSpec {
                range: range.to_string(),
                allocations,
            },
        );
        assert_eq!(pool.reservations(&range), reservations);
    }

    #[test]
    fn works_persisted_schema_field_names() {
        let allocation = IPAllocation {
            id: "cid".to_string(),
            podref: "ns/pod".to_string(),
            ifname: Some("net1".to_string()),
        };
        let json = serde_json::to_value(&allocation).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "cid", "podref": "ns/pod", "ifname": "net1"})
        );
    }

    #[test]
    fn works_malformed_offset_keys_are_dropped() {
        let range = Range::parse("192.168.1.0/24").unwrap();
        let mut allocations = BTreeMap::new();
        allocations.insert(
            "not-a-number".to_string(),
            IPAllocation {
                id: "cid".to_string(),
                podref: "ns/pod".to_string(),
                ifname: None,
            },
        );
        allocations.insert(
            "9999".to_string(),
            IPAllocation {
                id: "cid".to_string(),
                podref: "ns/pod".to_string(),
                ifname: None,
            },
        );
        let pool = IPPool::new(
            "p",
            IPPoolSpec {
                range: range.to_string(),
                allocations,
            },
        );
        assert!(pool.reservations(&range).is_empty());
    }
}
