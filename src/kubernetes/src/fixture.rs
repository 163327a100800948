//! Canned objects shared by the unit tests.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use kube::core::ObjectMeta;

use crate::crd::ip_pool::{IPAllocation, IPPool, IPPoolSpec};
use crate::crd::overlapping_range::{
    OverlappingRangeIPReservation, OverlappingRangeIPReservationSpec,
};
use crate::reconciler::pod::NETWORK_STATUS_ANNOTATION;

pub fn test_ip_pool(name: &str, range: &str, entries: &[(u128, &str, &str)]) -> IPPool {
    let mut allocations = BTreeMap::new();
    for (offset, container_id, pod_ref) in entries {
        allocations.insert(
            offset.to_string(),
            IPAllocation {
                id: container_id.to_string(),
                podref: pod_ref.to_string(),
                ifname: Some("net1".to_string()),
            },
        );
    }
    IPPool {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: IPPoolSpec {
            range: range.to_string(),
            allocations,
        },
    }
}

pub fn test_overlap(ip_name: &str, container_id: &str, pod_ref: &str) -> OverlappingRangeIPReservation {
    OverlappingRangeIPReservation {
        metadata: ObjectMeta {
            name: Some(ip_name.to_string()),
            ..Default::default()
        },
        spec: OverlappingRangeIPReservationSpec {
            containerid: Some(container_id.to_string()),
            podref: pod_ref.to_string(),
            ifname: Some("net1".to_string()),
        },
    }
}

/// A pod whose network-status annotation reports the given secondary IPs,
/// plus a default-network entry that must be ignored.
pub fn test_pod(namespace: &str, name: &str, phase: &str, ips: &[&str]) -> Pod {
    let mut statuses = vec![serde_json::json!({
        "name": "cbr0",
        "interface": "eth0",
        "ips": ["10.244.0.5"],
        "default": true,
    })];
    statuses.push(serde_json::json!({
        "name": format!("{namespace}/testnet"),
        "interface": "net1",
        "ips": ips,
        "default": false,
    }));
    let annotation = serde_json::to_string(&statuses).unwrap();

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                NETWORK_STATUS_ANNOTATION.to_string(),
                annotation,
            )])),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

pub fn test_pod_without_annotation(namespace: &str, name: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// A running pod the taint manager is about to evict; the reconciler must
/// treat it as already gone.
pub fn test_pod_marked_for_deletion(namespace: &str, name: &str) -> Pod {
    let mut pod = test_pod(namespace, name, "Running", &["192.168.1.1"]);
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "DisruptionTarget".to_string(),
            status: "True".to_string(),
            reason: Some("DeletionByTaintManager".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}
