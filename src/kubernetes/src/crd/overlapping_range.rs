use std::net::IpAddr;

pub use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use rosterd_ipam::error::Error;

/// Cluster-wide arbiter for a single IP. At most one of these exists per
/// address, regardless of how many pools cover it.
#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq, JsonSchema)]
#[kube(
    group = "rosterd.io",
    version = "v1alpha1",
    kind = "OverlappingRangeIPReservation",
    namespaced
)]
#[kube(
    printcolumn = r#"{"name":"PODREF", "type":"string", "description":"The pod owning this address", "jsonPath":".spec.podref"}"#
)]
pub struct OverlappingRangeIPReservationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containerid: Option<String>,
    pub podref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifname: Option<String>,
}

/// Object names may not contain `:` or `/`, so the IP is normalized on write
/// and denormalized on read.
pub fn ip_to_name(ip: &IpAddr) -> String {
    ip.to_string().replace(':', "-").replace('/', "-")
}

pub fn name_to_ip(name: &str) -> Result<IpAddr, Error> {
    let denormalized = if name.contains('.') {
        name.to_string()
    } else {
        name.replace('-', ":")
    };
    denormalized
        .parse()
        .map_err(|_| Error::InvalidAddress(name.to_string()))
}
