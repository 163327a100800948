use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

use crate::crd::ip_pool::IPPool;
use crate::crd::overlapping_range::OverlappingRangeIPReservation;
use crate::error::Error;

pub mod kubernetes;
pub mod memory;
pub mod overlap;
pub mod pool;

/// How long one outer allocation, release or pool update may take in total.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How many times an optimistic pool update is retried before giving up.
pub const DATASTORE_RETRIES: usize = 100;

/// How many times a Pending pod is re-fetched before its reservation is
/// declared orphaned.
pub const POD_REFRESH_RETRIES: usize = 3;

/// The storage capabilities the allocator and the reconciler need. The
/// production implementation talks to the Kubernetes API; tests substitute
/// the in-memory one.
///
/// Semantics the implementations must provide:
/// - `get_*` return `Ok(None)` for absent objects.
/// - `create_*` fail with an already-exists error when racing another writer.
/// - `update_pool` fails with a conflict error when the pool's version token
///   no longer matches the cluster state.
/// - `delete_overlap` treats an absent record as success.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get_pool(&self, name: &str) -> Result<Option<IPPool>, Error>;
    async fn create_pool(&self, pool: &IPPool) -> Result<IPPool, Error>;
    async fn update_pool(&self, pool: &IPPool) -> Result<IPPool, Error>;
    async fn list_pools(&self) -> Result<Vec<IPPool>, Error>;

    async fn get_overlap(
        &self,
        name: &str,
    ) -> Result<Option<OverlappingRangeIPReservation>, Error>;
    async fn create_overlap(
        &self,
        reservation: &OverlappingRangeIPReservation,
    ) -> Result<OverlappingRangeIPReservation, Error>;
    async fn delete_overlap(&self, name: &str) -> Result<(), Error>;
    async fn list_overlaps(&self) -> Result<Vec<OverlappingRangeIPReservation>, Error>;

    async fn list_pods(&self) -> Result<Vec<Pod>, Error>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;
}
