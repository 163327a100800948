use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use rosterd_ipam::allocator::IpReservation;
use rosterd_ipam::range::Range;

use crate::context::Context;
use crate::crd::overlapping_range::name_to_ip;
use crate::error::Error;
use crate::reconciler::pod::WrappedPod;
use crate::store::pool::{Mutation, PoolStore};
use crate::store::{Datastore, POD_REFRESH_RETRIES, REQUEST_TIMEOUT};

pub mod cron;
pub mod pod;
pub mod server;

/// Spacing between re-fetches of a Pending pod during the grace window.
const POD_REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// Where a pool ended up during one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolSweep {
    /// Scanned, nothing to remove.
    Scanned,
    /// Orphans found, removal not yet committed.
    NeedsUpdate { orphans: Vec<IpReservation> },
    /// Orphans removed.
    Committed { removed: Vec<IpAddr> },
    /// Removal failed; other pools are unaffected.
    Failed { reason: String },
}

/// Outcome of a full sweep across pools and overlap records.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub pools: BTreeMap<String, PoolSweep>,
    pub cleaned_ips: Vec<IpAddr>,
    pub overlaps_removed: Vec<String>,
}

/// Correlates pool reservations and overlap records with live pod state and
/// purges what no pod owns anymore. Stateless between runs.
pub struct Reconciler {
    ctx: Arc<Context>,
}

impl Reconciler {
    pub fn new(ctx: Arc<Context>) -> Reconciler {
        Reconciler { ctx }
    }

    fn store(&self) -> &dyn Datastore {
        self.ctx.store.as_ref()
    }

    #[tracing::instrument(skip_all)]
    pub async fn run_once(&self) -> Result<ReconcileReport, Error> {
        self.ctx.metrics.reconciliations.inc();
        let timer = self
            .ctx
            .metrics
            .reconcile_duration
            .with_label_values(&[])
            .start_timer();

        let pools = self.store().list_pools().await?;
        let overlaps = self.store().list_overlaps().await?;
        let all_pods = self.store().list_pods().await?;

        // parse ranges up front; a pool with a bad range is reported, not fatal
        let mut parsed: Vec<(String, Range, Vec<IpReservation>)> = Vec::new();
        let mut report = ReconcileReport::default();
        for pool in &pools {
            let name = pool
                .metadata
                .name
                .clone()
                .unwrap_or_else(|| "<unnamed>".to_string());
            match Range::parse(&pool.spec.range) {
                Ok(range) => {
                    let reservations = pool.reservations(&range);
                    parsed.push((name, range, reservations));
                }
                Err(e) => {
                    tracing::warn!(pool = name, error = %e, "pool carries an unparseable range");
                    report.pools.insert(
                        name,
                        PoolSweep::Failed {
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }

        let served_refs: HashSet<String> = parsed
            .iter()
            .flat_map(|(_, _, reservations)| reservations.iter())
            .map(|r| r.pod_ref.clone())
            .chain(overlaps.iter().map(|o| o.spec.podref.clone()))
            .collect();
        let live = pod::index_pods(&all_pods, &served_refs);

        // find orphans per pool
        for (name, _, reservations) in &parsed {
            let mut orphans = Vec::new();
            for reservation in reservations {
                if reservation.pod_ref.is_empty() {
                    tracing::warn!(
                        pool = name,
                        ip = %reservation.ip,
                        "reservation has no pod ref, skipping"
                    );
                    continue;
                }
                if self
                    .is_orphaned(&live, &reservation.pod_ref, &reservation.ip.to_string())
                    .await
                {
                    orphans.push(reservation.clone());
                }
            }
            let state = if orphans.is_empty() {
                PoolSweep::Scanned
            } else {
                PoolSweep::NeedsUpdate { orphans }
            };
            report.pools.insert(name.clone(), state);
        }

        // commit removals; pools are independent of each other
        for (name, range, _) in &parsed {
            let Some(PoolSweep::NeedsUpdate { orphans }) = report.pools.get(name).cloned()
            else {
                continue;
            };
            match self.purge_pool(name, range, &orphans).await {
                Ok(removed) => {
                    tracing::info!(pool = name, removed = removed.len(), "purged orphans");
                    self.ctx
                        .metrics
                        .orphaned_ips_cleaned
                        .inc_by(removed.len() as u64);
                    report.cleaned_ips.extend(removed.iter().copied());
                    report
                        .pools
                        .insert(name.clone(), PoolSweep::Committed { removed });
                }
                Err(e) => {
                    tracing::error!(pool = name, error = %e, "failed to purge orphans");
                    self.ctx.metrics.reconcile_failure(name, &e);
                    report.pools.insert(
                        name.clone(),
                        PoolSweep::Failed {
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }

        // overlap records go through the same orphan test
        for overlap in &overlaps {
            let Some(name) = overlap.metadata.name.clone() else {
                continue;
            };
            let ip = match name_to_ip(&name) {
                Ok(ip) => ip,
                Err(e) => {
                    tracing::warn!(record = name, error = %e, "unparseable overlap record name");
                    continue;
                }
            };
            if self
                .is_orphaned(&live, &overlap.spec.podref, &ip.to_string())
                .await
            {
                match self.store().delete_overlap(&name).await {
                    Ok(()) => {
                        tracing::info!(record = name, "removed stale overlapping allocation");
                        report.overlaps_removed.push(name);
                    }
                    Err(e) => {
                        tracing::warn!(record = name, error = %e, "failed to remove overlap record");
                    }
                }
            }
        }

        timer.observe_duration();
        Ok(report)
    }

    /// A reservation is orphaned when its pod is gone, or alive but not
    /// reporting the IP. Pending pods get a short grace window: the network
    /// status annotation may simply not have landed yet.
    async fn is_orphaned(
        &self,
        live: &HashMap<String, WrappedPod>,
        pod_ref: &str,
        ip: &str,
    ) -> bool {
        let Some(pod) = live.get(pod_ref) else {
            return true;
        };
        if pod.has_ip(ip) {
            return false;
        }
        if !pod.is_pending() {
            return true;
        }

        tracing::debug!(pod = pod_ref, ip, "re-fetching a Pending pod");
        let mut current = pod.clone();
        for _ in 0..POD_REFRESH_RETRIES {
            let Some(refreshed) = self.refresh_pod(pod_ref).await else {
                return true;
            };
            if !refreshed.is_pending() {
                tracing::debug!(pod = pod_ref, phase = refreshed.phase, "pod left Pending");
                current = refreshed;
                break;
            }
            if refreshed.has_ip(ip) {
                tracing::debug!(pod = pod_ref, "pod gained the IP while Pending");
                return false;
            }
            current = refreshed;
            tokio::time::sleep(POD_REFRESH_INTERVAL).await;
        }
        !current.has_ip(ip)
    }

    async fn refresh_pod(&self, pod_ref: &str) -> Option<WrappedPod> {
        let (namespace, name) = pod::split_pod_ref(pod_ref)?;
        match self.store().get_pod(namespace, name).await {
            Ok(Some(pod)) => Some(pod::wrap_pod(&pod)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(pod = pod_ref, error = %e, "failed to re-fetch pod");
                None
            }
        }
    }

    /// One CAS update removing this pool's orphans. The reservations are
    /// re-read inside the loop, so an orphan released concurrently is simply
    /// not there anymore.
    async fn purge_pool(
        &self,
        name: &str,
        range: &Range,
        orphans: &[IpReservation],
    ) -> Result<Vec<IpAddr>, Error> {
        let pool_store = PoolStore::new(self.store());
        let deadline = Instant::now() + REQUEST_TIMEOUT;
        pool_store
            .with_pool(name, range, false, deadline, |current| {
                let mut removed = Vec::new();
                let updated: Vec<_> = current
                    .iter()
                    .filter(|r| {
                        let orphaned = orphans
                            .iter()
                            .any(|o| o.pod_ref == r.pod_ref && o.ip == r.ip);
                        if orphaned {
                            removed.push(r.ip);
                        }
                        !orphaned
                    })
                    .cloned()
                    .collect();
                if removed.is_empty() {
                    Ok(Mutation::Skip(Vec::new()))
                } else {
                    Ok(Mutation::Commit(updated, removed))
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::context::State;
    use crate::fixture;
    use crate::store::memory::MemoryDatastore;

    async fn seeded(
        pods: Vec<k8s_openapi::api::core::v1::Pod>,
    ) -> (Arc<MemoryDatastore>, Reconciler) {
        let store = Arc::new(MemoryDatastore::new());
        for pod in pods {
            store.add_pod(pod);
        }
        let state = State::new("reconciler-test");
        let ctx = state.to_context(store.clone());
        (store, Reconciler::new(ctx))
    }

    #[tokio::test]
    async fn works_removes_reservations_of_deleted_pods() {
        let (store, reconciler) = seeded(vec![fixture::test_pod(
            "dummyNS",
            "dummyPOD-0",
            "Running",
            &["192.168.1.1"],
        )])
        .await;

        store
            .create_pool(&fixture::test_ip_pool(
                "192.168.1.0-24",
                "192.168.1.0/24",
                &[
                    (1, "cid-0", "dummyNS/dummyPOD-0"),
                    (2, "cid-1", "dummyNS/dummyPOD-1"),
                ],
            ))
            .await
            .unwrap();

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(
            report.cleaned_ips,
            vec!["192.168.1.2".parse::<IpAddr>().unwrap()]
        );

        let pool = store.pool("192.168.1.0-24").unwrap();
        assert_eq!(pool.spec.allocations.len(), 1);
        assert!(pool.spec.allocations.contains_key("1"));
    }

    #[tokio::test]
    async fn works_removes_reservation_when_pod_lacks_the_ip() {
        let (store, reconciler) = seeded(vec![fixture::test_pod(
            "dummyNS",
            "dummyPOD-0",
            "Running",
            &["192.168.1.200"],
        )])
        .await;

        store
            .create_pool(&fixture::test_ip_pool(
                "192.168.1.0-24",
                "192.168.1.0/24",
                &[(1, "cid-0", "dummyNS/dummyPOD-0")],
            ))
            .await
            .unwrap();

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.cleaned_ips.len(), 1);
        assert!(store
            .pool("192.168.1.0-24")
            .unwrap()
            .spec
            .allocations
            .is_empty());
    }

    #[tokio::test]
    async fn works_pending_pod_grace_when_ip_appears() {
        // the listing snapshot shows a Pending pod without the annotation,
        // but a re-fetch sees it Running with the IP
        let stale = fixture::test_pod_without_annotation("dummyNS", "dummyPOD-0", "Pending");
        let (store, reconciler) = seeded(vec![stale]).await;
        store.stage_pod_update(fixture::test_pod(
            "dummyNS",
            "dummyPOD-0",
            "Running",
            &["192.168.1.1"],
        ));

        store
            .create_pool(&fixture::test_ip_pool(
                "192.168.1.0-24",
                "192.168.1.0/24",
                &[(1, "cid-0", "dummyNS/dummyPOD-0")],
            ))
            .await
            .unwrap();

        let report = reconciler.run_once().await.unwrap();
        assert!(report.cleaned_ips.is_empty());
        assert_eq!(
            report.pools.get("192.168.1.0-24"),
            Some(&PoolSweep::Scanned)
        );
    }

    #[tokio::test]
    async fn works_pending_pod_still_missing_ip_is_orphaned() {
        let pending = fixture::test_pod_without_annotation("dummyNS", "dummyPOD-0", "Pending");
        let (store, reconciler) = seeded(vec![pending]).await;

        store
            .create_pool(&fixture::test_ip_pool(
                "192.168.1.0-24",
                "192.168.1.0/24",
                &[(1, "cid-0", "dummyNS/dummyPOD-0")],
            ))
            .await
            .unwrap();

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.cleaned_ips.len(), 1);
    }

    #[tokio::test]
    async fn works_overlap_records_are_swept() {
        let (store, reconciler) = seeded(vec![]).await;
        store
            .create_overlap(&fixture::test_overlap(
                "192.168.22.1",
                "cid-0",
                "dummyNS/dummyPOD-0",
            ))
            .await
            .unwrap();

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.overlaps_removed, vec!["192.168.22.1".to_string()]);
        assert!(store.overlap_names().is_empty());
    }

    #[tokio::test]
    async fn works_live_overlap_records_are_kept() {
        let (store, reconciler) = seeded(vec![fixture::test_pod(
            "dummyNS",
            "dummyPOD-0",
            "Running",
            &["192.168.22.1"],
        )])
        .await;
        store
            .create_overlap(&fixture::test_overlap(
                "192.168.22.1",
                "cid-0",
                "dummyNS/dummyPOD-0",
            ))
            .await
            .unwrap();

        let report = reconciler.run_once().await.unwrap();
        assert!(report.overlaps_removed.is_empty());
        assert_eq!(store.overlap_names(), vec!["192.168.22.1".to_string()]);
    }

    #[tokio::test]
    async fn works_second_run_is_idempotent() {
        let (store, reconciler) = seeded(vec![]).await;
        store
            .create_pool(&fixture::test_ip_pool(
                "192.168.1.0-24",
                "192.168.1.0/24",
                &[(1, "cid-0", "dummyNS/dummyPOD-0")],
            ))
            .await
            .unwrap();

        let first = reconciler.run_once().await.unwrap();
        assert_eq!(first.cleaned_ips.len(), 1);
        let version_after_first = store.pool("192.168.1.0-24").unwrap().metadata.resource_version;

        let second = reconciler.run_once().await.unwrap();
        assert!(second.cleaned_ips.is_empty());
        assert_eq!(
            second.pools.get("192.168.1.0-24"),
            Some(&PoolSweep::Scanned)
        );
        // no further writes happened
        assert_eq!(
            store.pool("192.168.1.0-24").unwrap().metadata.resource_version,
            version_after_first
        );
    }

    #[tokio::test]
    async fn works_evicted_pods_are_treated_as_gone() {
        let (store, reconciler) = seeded(vec![fixture::test_pod_marked_for_deletion(
            "dummyNS",
            "dummyPOD-0",
        )])
        .await;
        store
            .create_pool(&fixture::test_ip_pool(
                "192.168.1.0-24",
                "192.168.1.0/24",
                &[(1, "cid-0", "dummyNS/dummyPOD-0")],
            ))
            .await
            .unwrap();

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.cleaned_ips.len(), 1);
    }
}
