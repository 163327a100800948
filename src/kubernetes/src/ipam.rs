use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tokio::time::Instant;

use rosterd_ipam::allocator::{self, AddressRequest};
use rosterd_ipam::range::Range;

use crate::config::IPAMConfig;
use crate::error::Error;
use crate::store::overlap::{ClaimResult, OverlapStore};
use crate::store::pool::{Mutation, PoolIdentifier, PoolStore};
use crate::store::{Datastore, REQUEST_TIMEOUT};

/// Ties the pure allocator to the stores: ledger commit first, cluster-wide
/// claim second, with compensation in between when the claim loses.
pub struct Ipam {
    store: Arc<dyn Datastore>,
    config: IPAMConfig,
}

impl Ipam {
    pub fn new(store: Arc<dyn Datastore>, config: IPAMConfig) -> Ipam {
        Ipam { store, config }
    }

    /// Allocates one address per configured range. If a later range fails,
    /// addresses already taken from earlier ranges are handed back so the
    /// request leaves no partial state behind.
    pub async fn allocate(&self, request: &AddressRequest) -> Result<Vec<IpNet>, Error> {
        let deadline = Instant::now() + REQUEST_TIMEOUT;
        let mut granted: Vec<(Range, IpAddr)> = Vec::new();

        for range_config in &self.config.ip_ranges {
            let range = range_config.to_range()?;
            match self.allocate_in_range(&range, request, deadline).await {
                Ok(ip) => granted.push((range, ip)),
                Err(e) => {
                    for (range, ip) in &granted {
                        if let Err(undo) =
                            self.release_in_range(range, request, deadline).await
                        {
                            tracing::warn!(
                                ip = %ip,
                                error = %undo,
                                "failed to roll back an address after a partial allocation"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        granted
            .into_iter()
            .map(|(range, ip)| {
                IpNet::new(ip, range.prefix_len()).map_err(|_| {
                    Error::Ipam(rosterd_ipam::error::Error::InvalidAddress(ip.to_string()))
                })
            })
            .collect()
    }

    /// Releases this attachment's address in every configured range. Absent
    /// reservations are already released.
    pub async fn release(&self, request: &AddressRequest) -> Result<(), Error> {
        let deadline = Instant::now() + REQUEST_TIMEOUT;
        for range_config in &self.config.ip_ranges {
            let range = range_config.to_range()?;
            self.release_in_range(&range, request, deadline).await?;
        }
        Ok(())
    }

    fn pool_name(&self, range: &Range) -> String {
        PoolIdentifier {
            network_name: self.config.network_name.clone(),
            node_name: self.config.node_name.clone(),
            ip_range: range.to_string(),
        }
        .name()
    }

    async fn allocate_in_range(
        &self,
        range: &Range,
        request: &AddressRequest,
        deadline: Instant,
    ) -> Result<IpAddr, Error> {
        let pool_store = PoolStore::new(self.store.as_ref());
        let overlap_store = OverlapStore::new(self.store.as_ref());
        let name = self.pool_name(range);
        let mut avoid: HashSet<IpAddr> = HashSet::new();

        loop {
            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded);
            }

            let chosen = pool_store
                .with_pool(&name, range, true, deadline, |current| {
                    let (updated, ip) = allocator::allocate(range, current, request, &avoid)?;
                    if updated.as_slice() == current {
                        Ok(Mutation::Skip(ip))
                    } else {
                        Ok(Mutation::Commit(updated, ip))
                    }
                })
                .await?;

            if !self.config.enable_overlapping_ranges {
                return Ok(chosen);
            }

            match overlap_store.claim(&chosen, request, deadline).await {
                Ok(ClaimResult::Claimed) | Ok(ClaimResult::AlreadyOwned) => return Ok(chosen),
                Ok(ClaimResult::Conflict) => {
                    tracing::info!(
                        ip = %chosen,
                        pool = name,
                        "address is claimed by another pool, picking again"
                    );
                    self.withdraw_ledger_entry(&name, range, chosen, request, deadline)
                        .await?;
                    avoid.insert(chosen);
                }
                Err(e) => {
                    // the ledger entry must not outlive a failed claim
                    if let Err(undo) = self
                        .withdraw_ledger_entry(&name, range, chosen, request, deadline)
                        .await
                    {
                        tracing::warn!(
                            ip = %chosen,
                            error = %undo,
                            "failed to withdraw the ledger entry, leaving it to the reconciler"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn release_in_range(
        &self,
        range: &Range,
        request: &AddressRequest,
        deadline: Instant,
    ) -> Result<(), Error> {
        let pool_store = PoolStore::new(self.store.as_ref());
        let overlap_store = OverlapStore::new(self.store.as_ref());
        let name = self.pool_name(range);

        let released = pool_store
            .with_pool(&name, range, false, deadline, |current| {
                let (updated, released) = allocator::release(current, request);
                match released {
                    Some(_) => Ok(Mutation::Commit(updated, released)),
                    None => Ok(Mutation::Skip(None)),
                }
            })
            .await?;

        if let Some(ip) = released {
            if self.config.enable_overlapping_ranges {
                overlap_store.release(&ip).await?;
            }
        }
        Ok(())
    }

    async fn withdraw_ledger_entry(
        &self,
        name: &str,
        range: &Range,
        ip: IpAddr,
        request: &AddressRequest,
        deadline: Instant,
    ) -> Result<(), Error> {
        let pool_store = PoolStore::new(self.store.as_ref());
        pool_store
            .with_pool(name, range, false, deadline, |current| {
                let updated: Vec<_> = current
                    .iter()
                    .filter(|r| !(r.ip == ip && r.container_id == request.container_id))
                    .cloned()
                    .collect();
                if updated.len() == current.len() {
                    Ok(Mutation::Skip(()))
                } else {
                    Ok(Mutation::Commit(updated, ()))
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    use crate::store::memory::MemoryDatastore;

    fn config(range: &str, overlapping: bool) -> IPAMConfig {
        let conf = serde_json::json!({ "ipam": {
            "range": range,
            "enable_overlapping_ranges": overlapping,
        }});
        IPAMConfig::from_net_conf(conf.to_string().as_bytes()).unwrap()
    }

    fn request(n: u32) -> AddressRequest {
        AddressRequest::new(
            &format!("cid-{n}"),
            "net1",
            &format!("dummyNS/dummyPOD-{n}"),
        )
    }

    fn net(s: &str) -> IpNet {
        IpNet::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn works_sequential_pods_and_reuse_after_release() {
        let store = Arc::new(MemoryDatastore::new());
        let ipam = Ipam::new(store.clone(), config("192.168.1.0/24", true));

        assert_eq!(
            ipam.allocate(&request(0)).await.unwrap(),
            vec![net("192.168.1.1/24")]
        );
        assert_eq!(
            ipam.allocate(&request(1)).await.unwrap(),
            vec![net("192.168.1.2/24")]
        );

        ipam.release(&request(0)).await.unwrap();
        assert_eq!(
            ipam.allocate(&request(2)).await.unwrap(),
            vec![net("192.168.1.1/24")]
        );
    }

    #[tokio::test]
    async fn works_allocate_release_restores_pool() {
        let store = Arc::new(MemoryDatastore::new());
        let ipam = Ipam::new(store.clone(), config("192.168.1.0/24", true));

        ipam.allocate(&request(0)).await.unwrap();
        let before = store.pool("192.168.1.0-24").unwrap().spec;

        ipam.allocate(&request(1)).await.unwrap();
        ipam.release(&request(1)).await.unwrap();

        let after = store.pool("192.168.1.0-24").unwrap().spec;
        assert_eq!(
            serde_json::to_vec(&before).unwrap(),
            serde_json::to_vec(&after).unwrap()
        );
    }

    #[tokio::test]
    async fn works_allocate_is_idempotent() {
        let store = Arc::new(MemoryDatastore::new());
        let ipam = Ipam::new(store.clone(), config("192.168.1.0/24", true));

        let first = ipam.allocate(&request(0)).await.unwrap();
        let pool_before = store.pool("192.168.1.0-24").unwrap();
        let again = ipam.allocate(&request(0)).await.unwrap();
        let pool_after = store.pool("192.168.1.0-24").unwrap();

        assert_eq!(first, again);
        assert_eq!(pool_before.spec.allocations, pool_after.spec.allocations);
        // idempotent replay is answered from the existing reservation and
        // writes nothing
        assert_eq!(
            pool_before.metadata.resource_version,
            pool_after.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn works_overlapping_pools_are_arbitrated() {
        let store = Arc::new(MemoryDatastore::new());
        let wide = Ipam::new(store.clone(), config("192.168.22.0/24", true));
        let narrow = Ipam::new(store.clone(), config("192.168.22.0/28", true));

        assert_eq!(
            wide.allocate(&request(0)).await.unwrap(),
            vec![net("192.168.22.1/24")]
        );
        // the narrow pool's ledger is empty, but .1 is claimed cluster-wide
        assert_eq!(
            narrow.allocate(&request(1)).await.unwrap(),
            vec![net("192.168.22.2/28")]
        );

        // the losing candidate was withdrawn from the narrow ledger
        let narrow_pool = store.pool("192.168.22.0-28").unwrap();
        assert_eq!(narrow_pool.spec.allocations.len(), 1);
        assert!(narrow_pool.spec.allocations.contains_key("2"));
        assert_eq!(
            store.overlap_names(),
            vec!["192.168.22.1".to_string(), "192.168.22.2".to_string()]
        );
    }

    #[tokio::test]
    async fn works_overlapping_pools_collide_when_disabled() {
        let store = Arc::new(MemoryDatastore::new());
        let wide = Ipam::new(store.clone(), config("192.168.22.0/24", false));
        let narrow = Ipam::new(store.clone(), config("192.168.22.0/28", false));

        assert_eq!(
            wide.allocate(&request(0)).await.unwrap(),
            vec![net("192.168.22.1/24")]
        );
        assert_eq!(
            narrow.allocate(&request(1)).await.unwrap(),
            vec![net("192.168.22.1/28")]
        );
        assert!(store.overlap_names().is_empty());
    }

    #[tokio::test]
    async fn works_pod_restart_keeps_its_address() {
        let store = Arc::new(MemoryDatastore::new());
        let ipam = Ipam::new(store.clone(), config("192.168.1.0/24", true));

        let first = ipam.allocate(&request(0)).await.unwrap();

        let restarted = AddressRequest::new("cid-0-new", "net1", "dummyNS/dummyPOD-0");
        let again = ipam.allocate(&restarted).await.unwrap();
        assert_eq!(first, again);

        let pool = store.pool("192.168.1.0-24").unwrap();
        assert_eq!(pool.spec.allocations["1"].id, "cid-0-new");
    }

    #[tokio::test]
    async fn works_release_removes_overlap_record() {
        let store = Arc::new(MemoryDatastore::new());
        let ipam = Ipam::new(store.clone(), config("192.168.1.0/24", true));

        ipam.allocate(&request(0)).await.unwrap();
        assert_eq!(store.overlap_names(), vec!["192.168.1.1".to_string()]);

        ipam.release(&request(0)).await.unwrap();
        assert!(store.overlap_names().is_empty());
    }

    #[tokio::test]
    async fn works_release_of_unknown_attachment_is_noop() {
        let store = Arc::new(MemoryDatastore::new());
        let ipam = Ipam::new(store.clone(), config("192.168.1.0/24", true));
        ipam.release(&request(7)).await.unwrap();
        assert!(store.pool("192.168.1.0-24").is_none());
    }

    #[tokio::test]
    async fn works_exhaustion_surfaces_assignment_error() {
        let store = Arc::new(MemoryDatastore::new());
        let conf = serde_json::json!({ "ipam": {
            "range": "192.168.1.0/24",
            "range_start": "192.168.1.5",
            "range_end": "192.168.1.12",
        }});
        let ipam = Ipam::new(
            store.clone(),
            IPAMConfig::from_net_conf(conf.to_string().as_bytes()).unwrap(),
        );

        for n in 0..8 {
            let ips = ipam.allocate(&request(n)).await.unwrap();
            assert_eq!(ips, vec![net(&format!("192.168.1.{}/24", 5 + n))]);
        }
        let err = ipam.allocate(&request(8)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Ipam(rosterd_ipam::error::Error::RangeExhausted)
        ));
    }
}
