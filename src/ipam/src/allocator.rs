use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;

use super::{error::Error, range::Range};

/// A reserved address and the attachment that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpReservation {
    pub ip: IpAddr,
    pub container_id: String,
    pub pod_ref: String,
    pub ifname: String,
}

/// Identity of the attachment asking for or returning an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRequest {
    pub container_id: String,
    pub ifname: String,
    pub pod_ref: String,
}

impl AddressRequest {
    pub fn new(container_id: &str, ifname: &str, pod_ref: &str) -> AddressRequest {
        AddressRequest {
            container_id: container_id.to_string(),
            ifname: ifname.to_string(),
            pod_ref: pod_ref.to_string(),
        }
    }
}

/// Picks the lowest free offset in the range's effective interval, skipping
/// exclusions, existing reservations and the caller's do-not-pick set.
/// Re-requests for an already reserved `(pod_ref, ifname)` are answered from
/// the existing reservation instead of burning a new address.
pub fn allocate(
    range: &Range,
    reservations: &[IpReservation],
    request: &AddressRequest,
    avoid: &HashSet<IpAddr>,
) -> Result<(Vec<IpReservation>, IpAddr), Error> {
    if let Some(existing) = reservations
        .iter()
        .find(|r| r.pod_ref == request.pod_ref && r.ifname == request.ifname)
    {
        let ip = existing.ip;
        if existing.container_id == request.container_id {
            return Ok((reservations.to_vec(), ip));
        }
        // Same pod and interface under a new container id: the pod was
        // restarted. Reclaim the address in place.
        let mut updated = reservations.to_vec();
        for r in updated.iter_mut() {
            if r.pod_ref == request.pod_ref && r.ifname == request.ifname {
                r.container_id = request.container_id.clone();
            }
        }
        return Ok((updated, ip));
    }

    let (lo, hi) = range.effective_interval()?;
    let reserved: BTreeSet<u128> = reservations
        .iter()
        .filter_map(|r| range.offset_of(&r.ip).ok())
        .collect();

    let mut offset = lo;
    while offset <= hi {
        if let Some(span_end) = range.excluded_span_end(offset) {
            match span_end.checked_add(1) {
                Some(next) => {
                    offset = next;
                    continue;
                }
                None => break,
            }
        }
        if !reserved.contains(&offset) {
            let ip = range.address_at(offset)?;
            if !avoid.contains(&ip) {
                let mut updated = reservations.to_vec();
                updated.push(IpReservation {
                    ip,
                    container_id: request.container_id.clone(),
                    pod_ref: request.pod_ref.clone(),
                    ifname: request.ifname.clone(),
                });
                return Ok((updated, ip));
            }
        }
        match offset.checked_add(1) {
            Some(next) => offset = next,
            None => break,
        }
    }
    Err(Error::RangeExhausted)
}

/// Removes the reservation matching `(container_id, ifname)`, falling back to
/// matching by `pod_ref`. An absent reservation is already released.
pub fn release(
    reservations: &[IpReservation],
    request: &AddressRequest,
) -> (Vec<IpReservation>, Option<IpAddr>) {
    let position = reservations
        .iter()
        .position(|r| r.container_id == request.container_id && r.ifname == request.ifname)
        .or_else(|| {
            reservations
                .iter()
                .position(|r| r.pod_ref == request.pod_ref)
        });
    match position {
        Some(idx) => {
            let mut updated = reservations.to_vec();
            let removed = updated.remove(idx);
            (updated, Some(removed.ip))
        }
        None => (reservations.to_vec(), None),
    }
}
