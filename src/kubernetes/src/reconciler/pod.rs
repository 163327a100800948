use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Deserialize;

/// Annotation published by the meta plugin with the per-network attachment
/// status of a pod.
pub const NETWORK_STATUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/network-status";

const POD_PHASE_PENDING: &str = "Pending";

/// One entry of the network-status annotation. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub default: bool,
}

/// The slice of pod state the reconciler cares about: the set of secondary
/// IPs the pod reports, and its phase.
#[derive(Debug, Clone)]
pub struct WrappedPod {
    pub ips: HashSet<String>,
    pub phase: String,
}

impl WrappedPod {
    pub fn has_ip(&self, ip: &str) -> bool {
        self.ips.contains(ip)
    }

    pub fn is_pending(&self) -> bool {
        self.phase == POD_PHASE_PENDING
    }
}

pub fn wrap_pod(pod: &Pod) -> WrappedPod {
    let ips = match flat_ip_set(pod) {
        Ok(ips) => ips,
        Err(e) => {
            tracing::warn!(
                pod = compose_pod_ref(pod),
                error = %e,
                "could not parse the network-status annotation"
            );
            HashSet::new()
        }
    };
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default();
    WrappedPod { ips, phase }
}

/// Secondary-interface IPs only; the default network is not ours to manage.
fn flat_ip_set(pod: &Pod) -> Result<HashSet<String>, serde_json::Error> {
    let raw = pod
        .annotations()
        .get(NETWORK_STATUS_ANNOTATION)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .unwrap_or("[]");
    let statuses: Vec<NetworkStatus> = serde_json::from_str(raw)?;
    let mut ips = HashSet::new();
    for status in statuses {
        if status.default {
            continue;
        }
        ips.extend(status.ips);
    }
    Ok(ips)
}

pub fn compose_pod_ref(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

pub fn split_pod_ref(pod_ref: &str) -> Option<(&str, &str)> {
    match pod_ref.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Some((namespace, name))
        }
        _ => None,
    }
}

/// Indexes the live pods this IPAM serves, keyed by pod ref. Pods being
/// evicted by the taint manager are left out so their reservations age out.
pub fn index_pods(pods: &[Pod], served_refs: &HashSet<String>) -> HashMap<String, WrappedPod> {
    let mut index = HashMap::new();
    for pod in pods {
        let pod_ref = compose_pod_ref(pod);
        if !served_refs.contains(&pod_ref) {
            continue;
        }
        if is_marked_for_deletion(pod) {
            tracing::debug!(pod = pod_ref, "pod is marked for deletion, skipping");
            continue;
        }
        index.insert(pod_ref, wrap_pod(pod));
    }
    index
}

fn is_marked_for_deletion(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "DisruptionTarget"
                    && c.status == "True"
                    && c.reason.as_deref() == Some("DeletionByTaintManager")
            })
        })
        .unwrap_or(false)
}
