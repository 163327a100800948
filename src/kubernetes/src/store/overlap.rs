use std::net::IpAddr;

use kube::core::ObjectMeta;
use tokio::time::Instant;

use rosterd_ipam::allocator::AddressRequest;

use crate::crd::overlapping_range::{
    ip_to_name, OverlappingRangeIPReservation, OverlappingRangeIPReservationSpec,
};
use crate::error::Error;
use crate::store::{Datastore, DATASTORE_RETRIES};

/// Outcome of a cluster-wide claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// The record was created; this attachment owns the address.
    Claimed,
    /// A record already exists for exactly this attachment (replayed request).
    AlreadyOwned,
    /// Another attachment owns the address.
    Conflict,
}

/// Arbitrates true per-IP uniqueness across pools whose ranges overlap, using
/// the datastore's unique-name create semantics.
pub struct OverlapStore<'a> {
    store: &'a dyn Datastore,
}

impl<'a> OverlapStore<'a> {
    pub fn new(store: &'a dyn Datastore) -> OverlapStore<'a> {
        OverlapStore { store }
    }

    pub async fn claim(
        &self,
        ip: &IpAddr,
        request: &AddressRequest,
        deadline: Instant,
    ) -> Result<ClaimResult, Error> {
        let name = ip_to_name(ip);
        let record = OverlappingRangeIPReservation {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            spec: OverlappingRangeIPReservationSpec {
                containerid: Some(request.container_id.clone()),
                podref: request.pod_ref.clone(),
                ifname: Some(request.ifname.clone()),
            },
        };

        for _ in 0..DATASTORE_RETRIES {
            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded);
            }
            match self.store.create_overlap(&record).await {
                Ok(_) => return Ok(ClaimResult::Claimed),
                Err(e) if e.is_already_exists() => {
                    match self.store.get_overlap(&name).await? {
                        Some(existing) if existing.spec == record.spec => {
                            return Ok(ClaimResult::AlreadyOwned)
                        }
                        Some(existing)
                            if existing.spec.podref == record.spec.podref
                                && existing.spec.ifname == record.spec.ifname =>
                        {
                            // our own record from a previous container of the
                            // same pod; rewrite it with the new container id
                            self.store.delete_overlap(&name).await?;
                            continue;
                        }
                        Some(_) => return Ok(ClaimResult::Conflict),
                        // deleted between create and get; try again
                        None => continue,
                    }
                }
                Err(e) => return Err(e),
            }
        }
        // the record kept vanishing and reappearing under us
        Err(Error::OverlapConflict(*ip))
    }

    /// Deleting an absent record is success: release is idempotent.
    pub async fn release(&self, ip: &IpAddr) -> Result<(), Error> {
        self.store.delete_overlap(&ip_to_name(ip)).await
    }
}
