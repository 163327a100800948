use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::crd::ip_pool::IPPool;
use crate::crd::overlapping_range::OverlappingRangeIPReservation;
use crate::error::Error;
use crate::store::Datastore;

/// In-memory datastore with the same observable semantics as the Kubernetes
/// one: synthetic resource versions, conflict on stale updates, already-exists
/// on create races. Tests can additionally inject a number of artificial
/// update conflicts to exercise the CAS loop.
#[derive(Default)]
pub struct MemoryDatastore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    pools: HashMap<String, IPPool>,
    overlaps: HashMap<String, OverlappingRangeIPReservation>,
    pods: HashMap<String, Pod>,
    staged_pods: HashMap<String, Pod>,
    next_version: u64,
    update_conflicts: usize,
}

impl MemoryDatastore {
    pub fn new() -> MemoryDatastore {
        MemoryDatastore::default()
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = format!(
            "{}/{}",
            pod.namespace().unwrap_or_default(),
            pod.name_any()
        );
        self.inner.lock().unwrap().pods.insert(key, pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .pods
            .remove(&format!("{namespace}/{name}"));
    }

    /// The next `n` pool updates fail with a version conflict before any
    /// write is applied.
    pub fn inject_update_conflicts(&self, n: usize) {
        self.inner.lock().unwrap().update_conflicts = n;
    }

    /// Stages a pod change that becomes visible on the next `get_pod`,
    /// simulating a pod that moved on between a listing and a re-fetch.
    pub fn stage_pod_update(&self, pod: Pod) {
        let key = format!(
            "{}/{}",
            pod.namespace().unwrap_or_default(),
            pod.name_any()
        );
        self.inner.lock().unwrap().staged_pods.insert(key, pod);
    }

    pub fn pool(&self, name: &str) -> Option<IPPool> {
        self.inner.lock().unwrap().pools.get(name).cloned()
    }

    pub fn overlap_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .unwrap()
            .overlaps
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

fn conflict(name: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("Operation cannot be fulfilled on \"{name}\": the object has been modified"),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

fn already_exists(name: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("\"{name}\" already exists"),
        reason: "AlreadyExists".to_string(),
        code: 409,
    }))
}

fn not_found(name: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("\"{name}\" not found"),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get_pool(&self, name: &str) -> Result<Option<IPPool>, Error> {
        Ok(self.inner.lock().unwrap().pools.get(name).cloned())
    }

    async fn create_pool(&self, pool: &IPPool) -> Result<IPPool, Error> {
        let mut inner = self.inner.lock().unwrap();
        let name = pool.name_any();
        if inner.pools.contains_key(&name) {
            return Err(already_exists(&name));
        }
        let mut stored = pool.clone();
        inner.next_version += 1;
        stored.metadata.resource_version = Some(inner.next_version.to_string());
        inner.pools.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update_pool(&self, pool: &IPPool) -> Result<IPPool, Error> {
        let mut inner = self.inner.lock().unwrap();
        let name = pool.name_any();
        if inner.update_conflicts > 0 {
            inner.update_conflicts -= 1;
            return Err(conflict(&name));
        }
        match inner.pools.get(&name) {
            None => Err(not_found(&name)),
            Some(existing)
                if existing.metadata.resource_version != pool.metadata.resource_version =>
            {
                Err(conflict(&name))
            }
            Some(_) => {
                let mut stored = pool.clone();
                inner.next_version += 1;
                stored.metadata.resource_version = Some(inner.next_version.to_string());
                inner.pools.insert(name, stored.clone());
                Ok(stored)
            }
        }
    }

    async fn list_pools(&self) -> Result<Vec<IPPool>, Error> {
        let mut pools: Vec<IPPool> = self.inner.lock().unwrap().pools.values().cloned().collect();
        pools.sort_by_key(|p| p.name_any());
        Ok(pools)
    }

    async fn get_overlap(
        &self,
        name: &str,
    ) -> Result<Option<OverlappingRangeIPReservation>, Error> {
        Ok(self.inner.lock().unwrap().overlaps.get(name).cloned())
    }

    async fn create_overlap(
        &self,
        reservation: &OverlappingRangeIPReservation,
    ) -> Result<OverlappingRangeIPReservation, Error> {
        let mut inner = self.inner.lock().unwrap();
        let name = reservation.name_any();
        if inner.overlaps.contains_key(&name) {
            return Err(already_exists(&name));
        }
        inner.overlaps.insert(name, reservation.clone());
        Ok(reservation.clone())
    }

    async fn delete_overlap(&self, name: &str) -> Result<(), Error> {
        self.inner.lock().unwrap().overlaps.remove(name);
        Ok(())
    }

    async fn list_overlaps(&self) -> Result<Vec<OverlappingRangeIPReservation>, Error> {
        let mut overlaps: Vec<OverlappingRangeIPReservation> = self
            .inner
            .lock()
            .unwrap()
            .overlaps
            .values()
            .cloned()
            .collect();
        overlaps.sort_by_key(|o| o.name_any());
        Ok(overlaps)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, Error> {
        Ok(self.inner.lock().unwrap().pods.values().cloned().collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let mut inner = self.inner.lock().unwrap();
        let key = format!("{namespace}/{name}");
        if let Some(staged) = inner.staged_pods.remove(&key) {
            inner.pods.insert(key.clone(), staged);
        }
        Ok(inner.pods.get(&key).cloned())
    }
}
