use std::collections::BTreeMap;
use std::time::Duration;

use kube::core::ObjectMeta;
use rand::Rng;
use tokio::time::Instant;

use rosterd_ipam::allocator::IpReservation;
use rosterd_ipam::range::Range;

use crate::crd::ip_pool::{allocations_from_reservations, IPPool, IPPoolSpec};
use crate::error::Error;
use crate::store::{Datastore, DATASTORE_RETRIES};

/// The coordinates a reservation ledger is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolIdentifier {
    pub network_name: Option<String>,
    pub node_name: Option<String>,
    pub ip_range: String,
}

impl PoolIdentifier {
    /// Object name: non-empty scope parts joined with `-`, the range with
    /// `/` and `:` flattened to `-`.
    pub fn name(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(network) = self.network_name.as_deref() {
            if !network.is_empty() {
                parts.push(network);
            }
        }
        if let Some(node) = self.node_name.as_deref() {
            if !node.is_empty() {
                parts.push(node);
            }
        }
        let range = self.ip_range.replace(['/', ':'], "-");
        parts.push(&range);
        parts.join("-")
    }
}

/// What a mutate pass decided to do with the reservation list.
pub enum Mutation<R> {
    /// Persist the new reservation list, then return the result.
    Commit(Vec<IpReservation>, R),
    /// Nothing to write; return the result as-is.
    Skip(R),
}

/// Serializes reservation changes onto one pool through an optimistic
/// read-mutate-replace loop.
pub struct PoolStore<'a> {
    store: &'a dyn Datastore,
}

impl<'a> PoolStore<'a> {
    pub fn new(store: &'a dyn Datastore) -> PoolStore<'a> {
        PoolStore { store }
    }

    /// Runs `mutate` over the pool's current reservations until a commit
    /// lands or the retry budget / deadline runs out. An absent pool is
    /// created empty when `create_if_missing` is set; otherwise `mutate`
    /// sees an empty list and any commit is a no-op.
    pub async fn with_pool<R, F>(
        &self,
        name: &str,
        range: &Range,
        create_if_missing: bool,
        deadline: Instant,
        mut mutate: F,
    ) -> Result<R, Error>
    where
        F: FnMut(&[IpReservation]) -> Result<Mutation<R>, Error>,
    {
        let mut last_err: Option<Error> = None;

        for attempt in 0..DATASTORE_RETRIES {
            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded);
            }

            let pool = match self.store.get_pool(name).await? {
                Some(pool) => Some(pool),
                None if create_if_missing => {
                    let fresh = IPPool {
                        metadata: ObjectMeta {
                            name: Some(name.to_string()),
                            ..Default::default()
                        },
                        spec: IPPoolSpec {
                            range: range.to_string(),
                            allocations: BTreeMap::new(),
                        },
                    };
                    match self.store.create_pool(&fresh).await {
                        Ok(created) => Some(created),
                        Err(e) if e.is_already_exists() => {
                            // lost the create race; re-read on the next pass
                            last_err = Some(e);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => None,
            };

            let reservations = match &pool {
                Some(pool) => pool.reservations(range),
                None => Vec::new(),
            };

            match mutate(&reservations)? {
                Mutation::Skip(result) => return Ok(result),
                Mutation::Commit(updated, result) => {
                    let Some(pool) = pool else {
                        // nothing persisted, nothing to rewrite
                        return Ok(result);
                    };
                    let mut next = pool;
                    next.spec.allocations = allocations_from_reservations(range, &updated);
                    match self.store.update_pool(&next).await {
                        Ok(_) => return Ok(result),
                        Err(e) if e.is_conflict() || e.is_transient() => {
                            tracing::debug!(
                                pool = name,
                                attempt,
                                error = %e,
                                "pool update lost the race, retrying"
                            );
                            last_err = Some(e);
                            jitter_sleep().await;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Err(Error::DatastoreRetriesExceeded {
            retries: DATASTORE_RETRIES,
            last: Box::new(last_err.unwrap_or(Error::DeadlineExceeded)),
        })
    }
}

async fn jitter_sleep() {
    let millis = rand::thread_rng().gen_range(20..120);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
