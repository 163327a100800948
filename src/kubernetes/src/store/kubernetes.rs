use std::future::Future;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    Api, Client, ResourceExt,
};

use crate::crd::ip_pool::IPPool;
use crate::crd::overlapping_range::OverlappingRangeIPReservation;
use crate::error::Error;
use crate::store::{Datastore, REQUEST_TIMEOUT};

/// Datastore backed by the Kubernetes API. Pools and overlap records live in
/// one namespace; pods are read cluster-wide. Optimistic concurrency rides on
/// `metadata.resourceVersion`, which the apiserver enforces on replace.
pub struct KubeDatastore {
    client: Client,
    namespace: String,
}

impl KubeDatastore {
    pub fn new(client: Client, namespace: &str) -> KubeDatastore {
        KubeDatastore {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn pools(&self) -> Api<IPPool> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn overlaps(&self) -> Api<OverlappingRangeIPReservation> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn attempt<T, F>(fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, kube::Error>> + Send,
    {
        match tokio::time::timeout(REQUEST_TIMEOUT, fut).await {
            Ok(res) => res.map_err(Error::Kube),
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }
}

#[async_trait]
impl Datastore for KubeDatastore {
    async fn get_pool(&self, name: &str) -> Result<Option<IPPool>, Error> {
        Self::attempt(self.pools().get_opt(name)).await
    }

    async fn create_pool(&self, pool: &IPPool) -> Result<IPPool, Error> {
        Self::attempt(self.pools().create(&PostParams::default(), pool)).await
    }

    async fn update_pool(&self, pool: &IPPool) -> Result<IPPool, Error> {
        let name = pool.name_any();
        Self::attempt(self.pools().replace(&name, &PostParams::default(), pool)).await
    }

    async fn list_pools(&self) -> Result<Vec<IPPool>, Error> {
        Self::attempt(self.pools().list(&ListParams::default()))
            .await
            .map(|list| list.items)
    }

    async fn get_overlap(
        &self,
        name: &str,
    ) -> Result<Option<OverlappingRangeIPReservation>, Error> {
        Self::attempt(self.overlaps().get_opt(name)).await
    }

    async fn create_overlap(
        &self,
        reservation: &OverlappingRangeIPReservation,
    ) -> Result<OverlappingRangeIPReservation, Error> {
        Self::attempt(self.overlaps().create(&PostParams::default(), reservation)).await
    }

    async fn delete_overlap(&self, name: &str) -> Result<(), Error> {
        let deleted = tokio::time::timeout(
            REQUEST_TIMEOUT,
            self.overlaps().delete(name, &DeleteParams::default()),
        )
        .await;
        match deleted {
            Err(_) => Err(Error::DeadlineExceeded),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                let err = Error::Kube(e);
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn list_overlaps(&self) -> Result<Vec<OverlappingRangeIPReservation>, Error> {
        Self::attempt(self.overlaps().list(&ListParams::default()))
            .await
            .map(|list| list.items)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, Error> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        Self::attempt(pods.list(&ListParams::default()))
            .await
            .map(|list| list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Self::attempt(pods.get_opt(name)).await
    }
}
