//! Lease manager: CRUD and state transitions of partition leases.
//!
//! Every mutation goes through the [`LeaseUpdater`] with a transform that
//! first asserts the stored owner still matches what the caller believed.
//! A mismatch means someone else took the lease, reported as `LeaseLost`.
//!
//! | Operation | Re-reads first | Transform |
//! |-----------|----------------|-----------|
//! | acquire | no | owner unchanged ⇒ owner = self, copy properties |
//! | renew | yes | owner unchanged ⇒ timestamp only |
//! | checkpoint | no | owner unchanged ⇒ set continuation |
//! | release | yes | owner unchanged ⇒ owner = none |
//! | update_properties | no | owner unchanged and == self ⇒ copy properties |
//!
//! Renew and release re-read because their callers hold copies that are often
//! stale (renewal cadence is independent of checkpoint cadence).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::record::Lease;
use super::store::{LeaseStore, RequestOptionsFactory, query_all};
use super::traits::{InitializationStore, LeaseCheckpointer, LeaseContainer, LeaseOwnership};
use super::updater::LeaseUpdater;
use crate::constants::{INITIALIZATION_LOCK_SUFFIX, INITIALIZED_MARKER_SUFFIX};
use crate::error::{LeaseError, LeaseResult};
use crate::metrics;

/// Lease manager over a [`LeaseStore`].
pub struct LeaseStoreManager {
    store: Arc<dyn LeaseStore>,
    updater: LeaseUpdater,
    request_options: Arc<dyn RequestOptionsFactory>,
    prefix: String,
    host_name: String,
    /// Version of the bootstrap lock record written by this host.
    lock_etag: Mutex<Option<String>>,
}

impl LeaseStoreManager {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        request_options: Arc<dyn RequestOptionsFactory>,
        prefix: impl Into<String>,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            updater: LeaseUpdater::new(store.clone(), request_options.clone()),
            store,
            request_options,
            prefix: prefix.into(),
            host_name: host_name.into(),
            lock_etag: Mutex::new(None),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn lease_id(&self, partition_id: &str) -> String {
        Lease::id_for(&self.prefix, partition_id)
    }

    fn marker_id(&self) -> String {
        format!("{}{}", self.prefix, INITIALIZED_MARKER_SUFFIX)
    }

    fn lock_id(&self) -> String {
        format!("{}{}", self.prefix, INITIALIZATION_LOCK_SUFFIX)
    }

    /// Read the current server copy, mapping a missing record to `LeaseLost`.
    async fn read_lease(&self, lease: &Lease) -> LeaseResult<Lease> {
        let partition_key = self.request_options.partition_key(&lease.id);
        match self.store.read(&lease.id, partition_key.as_deref()).await {
            Ok(document) => Lease::from_document(document),
            Err(LeaseError::NotFound { .. }) => {
                info!(partition_id = %lease.partition_id, "Lease no longer exists");
                Err(LeaseError::lease_lost(&lease.partition_id))
            }
            Err(e) => Err(e),
        }
    }

    /// Record outcome and latency of a lease operation.
    fn observe<T>(operation: &str, started: Instant, result: &LeaseResult<T>) {
        let status = match result {
            Ok(_) => "success",
            Err(e) if e.is_lease_lost() => "lost",
            Err(_) => "error",
        };
        metrics::record_lease_operation(operation, status);
        metrics::record_lease_duration(operation, started.elapsed().as_secs_f64());
    }
}

/// Transform guard: the stored owner must equal the caller's cached owner.
fn ensure_owner_unchanged(server: &Lease, expected_owner: &Option<String>) -> LeaseResult<()> {
    if server.owner != *expected_owner {
        info!(
            partition_id = %server.partition_id,
            owner = ?server.owner,
            expected = ?expected_owner,
            "Lease was taken over"
        );
        return Err(LeaseError::lease_lost(&server.partition_id));
    }
    Ok(())
}

fn ensure_version_unchanged(server: &Lease, cached_version: &Option<String>) -> LeaseResult<()> {
    if server.concurrency_token != *cached_version {
        info!(
            partition_id = %server.partition_id,
            "Lease changed since it was read, not acquiring"
        );
        return Err(LeaseError::lease_lost(&server.partition_id));
    }
    Ok(())
}

#[async_trait]
impl LeaseContainer for LeaseStoreManager {
    async fn get_all_leases(&self) -> LeaseResult<Vec<Lease>> {
        let documents = query_all(self.store.as_ref(), &Lease::id_prefix(&self.prefix)).await?;
        documents.into_iter().map(Lease::from_document).collect()
    }

    async fn get_owned_leases(&self) -> LeaseResult<Vec<Lease>> {
        Ok(self
            .get_all_leases()
            .await?
            .into_iter()
            .filter(|lease| lease.is_owned_by(&self.host_name))
            .collect())
    }
}

#[async_trait]
impl LeaseOwnership for LeaseStoreManager {
    fn host_name(&self) -> &str {
        &self.host_name
    }

    async fn create_if_not_exist(
        &self,
        partition_id: &str,
        continuation_token: Option<String>,
    ) -> LeaseResult<Option<Lease>> {
        let started = Instant::now();
        let lease = Lease::new(self.lease_id(partition_id), partition_id, continuation_token);
        let partition_key = self.request_options.partition_key(&lease.id);

        let result = match self
            .store
            .create(lease.to_document()?, partition_key.as_deref())
            .await
        {
            Ok(document) => {
                info!(partition_id, "Created lease");
                Lease::from_document(document).map(Some)
            }
            Err(LeaseError::Conflict { .. }) => {
                info!(partition_id, "Some other host created the lease");
                Ok(None)
            }
            Err(e) => Err(e),
        };
        Self::observe("create", started, &result);
        result
    }

    async fn acquire(&self, lease: &Lease) -> LeaseResult<Lease> {
        let started = Instant::now();
        let old_owner = lease.owner.clone();
        let cached_version = lease.concurrency_token.clone();
        let properties = lease.properties.clone();
        let host_name = self.host_name.clone();

        // Taking a lease is decided on the copy the caller listed; any write
        // since then, even by the same owner, voids that decision.
        let result = self
            .updater
            .update(lease.clone(), |mut server| {
                ensure_version_unchanged(&server, &cached_version)?;
                ensure_owner_unchanged(&server, &old_owner)?;
                server.owner = Some(host_name.clone());
                server.properties = properties.clone();
                Ok(Some(server))
            })
            .await
            .and_then(|updated| updated.ok_or_else(|| LeaseError::lease_lost(&lease.partition_id)));

        Self::observe("acquire", started, &result);
        if result.is_ok() {
            info!(partition_id = %lease.partition_id, previous_owner = ?old_owner, "Acquired lease");
        }
        result
    }

    async fn renew(&self, lease: &Lease) -> LeaseResult<Lease> {
        let started = Instant::now();
        let result = async {
            let refreshed = self.read_lease(lease).await?;
            let expected_owner = lease.owner.clone();
            self.updater
                .update(refreshed, |server| {
                    ensure_owner_unchanged(&server, &expected_owner)?;
                    Ok(Some(server))
                })
                .await?
                .ok_or_else(|| LeaseError::lease_lost(&lease.partition_id))
        }
        .await;

        Self::observe("renew", started, &result);
        result
    }

    async fn release(&self, lease: &Lease) -> LeaseResult<()> {
        let started = Instant::now();
        let result = async {
            let refreshed = self.read_lease(lease).await?;
            let expected_owner = lease.owner.clone();
            self.updater
                .update(refreshed, |mut server| {
                    ensure_owner_unchanged(&server, &expected_owner)?;
                    server.owner = None;
                    Ok(Some(server))
                })
                .await?;
            Ok(())
        }
        .await;

        Self::observe("release", started, &result);
        if result.is_ok() {
            info!(partition_id = %lease.partition_id, "Released lease");
        }
        result
    }

    async fn update_properties(&self, lease: &Lease) -> LeaseResult<Lease> {
        let started = Instant::now();
        let result = async {
            if !lease.is_owned_by(&self.host_name) {
                info!(
                    partition_id = %lease.partition_id,
                    owner = ?lease.owner,
                    "Lease is not owned by this host, cannot update properties"
                );
                return Err(LeaseError::lease_lost(&lease.partition_id));
            }
            let expected_owner = lease.owner.clone();
            let properties = lease.properties.clone();
            self.updater
                .update(lease.clone(), |mut server| {
                    ensure_owner_unchanged(&server, &expected_owner)?;
                    server.properties = properties.clone();
                    Ok(Some(server))
                })
                .await?
                .ok_or_else(|| LeaseError::lease_lost(&lease.partition_id))
        }
        .await;

        Self::observe("update_properties", started, &result);
        result
    }

    async fn delete(&self, lease: &Lease) -> LeaseResult<()> {
        let started = Instant::now();
        let partition_key = self.request_options.partition_key(&lease.id);
        let result = match self
            .store
            .delete(&lease.id, None, partition_key.as_deref())
            .await
        {
            Ok(()) => {
                info!(partition_id = %lease.partition_id, "Deleted lease");
                Ok(())
            }
            Err(LeaseError::NotFound { .. }) => {
                debug!(partition_id = %lease.partition_id, "Lease already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        };
        Self::observe("delete", started, &result);
        result
    }
}

#[async_trait]
impl LeaseCheckpointer for LeaseStoreManager {
    async fn checkpoint(&self, lease: &Lease, continuation_token: &str) -> LeaseResult<Lease> {
        if continuation_token.is_empty() {
            return Err(LeaseError::InvalidArgument(
                "continuation token must not be empty".to_string(),
            ));
        }

        let started = Instant::now();
        let expected_owner = lease.owner.clone();
        let token = continuation_token.to_string();
        let result = self
            .updater
            .update(lease.clone(), |mut server| {
                ensure_owner_unchanged(&server, &expected_owner)?;
                server.continuation_token = Some(token.clone());
                Ok(Some(server))
            })
            .await
            .and_then(|updated| updated.ok_or_else(|| LeaseError::lease_lost(&lease.partition_id)));

        Self::observe("checkpoint", started, &result);
        result
    }
}

#[async_trait]
impl InitializationStore for LeaseStoreManager {
    async fn is_initialized(&self) -> LeaseResult<bool> {
        let id = self.marker_id();
        let partition_key = self.request_options.partition_key(&id);
        match self.store.read(&id, partition_key.as_deref()).await {
            Ok(_) => Ok(true),
            Err(LeaseError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn mark_initialized(&self) -> LeaseResult<()> {
        let id = self.marker_id();
        let partition_key = self.request_options.partition_key(&id);
        match self
            .store
            .create(json!({ "id": id }), partition_key.as_deref())
            .await
        {
            Ok(_) | Err(LeaseError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn acquire_initialization_lock(&self, lock_time: Duration) -> LeaseResult<bool> {
        let id = self.lock_id();
        let partition_key = self.request_options.partition_key(&id);
        let document = json!({
            "id": id,
            "Owner": self.host_name,
            "ttl": lock_time.as_secs().max(1),
        });
        match self.store.create(document, partition_key.as_deref()).await {
            Ok(stored) => {
                let etag = stored
                    .get("_etag")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                *self.lock_etag.lock().await = etag;
                Ok(true)
            }
            Err(LeaseError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn release_initialization_lock(&self) -> LeaseResult<bool> {
        let id = self.lock_id();
        let partition_key = self.request_options.partition_key(&id);
        let Some(etag) = self.lock_etag.lock().await.take() else {
            return Ok(false);
        };
        match self
            .store
            .delete(&id, Some(&etag), partition_key.as_deref())
            .await
        {
            Ok(()) => Ok(true),
            Err(LeaseError::NotFound { .. }) | Err(LeaseError::PreconditionFailed { .. }) => {
                warn!(host_name = %self.host_name, "Bootstrap lock expired before release");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::memory::InMemoryLeaseStore;
    use crate::lease::store::SinglePartitionRequestOptions;

    fn manager(store: &Arc<InMemoryLeaseStore>, host: &str) -> LeaseStoreManager {
        LeaseStoreManager::new(
            store.clone(),
            Arc::new(SinglePartitionRequestOptions),
            "test",
            host,
        )
    }

    #[tokio::test]
    async fn test_create_if_not_exist_is_idempotent() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");

        let created = a.create_if_not_exist("0", Some("10".to_string())).await.unwrap();
        let lease = created.unwrap();
        assert_eq!(lease.id, "test..0");
        assert_eq!(lease.continuation_token.as_deref(), Some("10"));
        assert!(lease.concurrency_token.is_some());

        assert!(b.create_if_not_exist("0", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_sets_owner_and_properties() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let mut lease = a.create_if_not_exist("0", None).await.unwrap().unwrap();
        lease.properties.insert("k".to_string(), "v".to_string());

        let acquired = a.acquire(&lease).await.unwrap();
        assert_eq!(acquired.owner.as_deref(), Some("a"));
        assert_eq!(acquired.properties.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");
        let lease = a.create_if_not_exist("0", None).await.unwrap().unwrap();

        let (ra, rb) = tokio::join!(a.acquire(&lease), b.acquire(&lease));
        let winners = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(winners, 1);
        let loser = if ra.is_ok() { rb } else { ra };
        assert!(loser.unwrap_err().is_lease_lost());
    }

    #[tokio::test]
    async fn test_acquire_from_outdated_copy_is_lease_lost() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");
        let lease = a.create_if_not_exist("0", None).await.unwrap().unwrap();
        let held = a.acquire(&lease).await.unwrap();
        a.renew(&held).await.unwrap();

        assert!(b.acquire(&held).await.unwrap_err().is_lease_lost());
        let current = b.get_all_leases().await.unwrap().remove(0);
        assert!(b.acquire(&current).await.unwrap().is_owned_by("b"));
    }

    #[tokio::test]
    async fn test_renew_after_steal_is_lease_lost() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");
        let lease = a.create_if_not_exist("0", None).await.unwrap().unwrap();
        let held = a.acquire(&lease).await.unwrap();

        b.acquire(&held).await.unwrap();
        assert!(a.renew(&held).await.unwrap_err().is_lease_lost());
    }

    #[tokio::test]
    async fn test_renew_with_stale_copy_succeeds() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let lease = a.create_if_not_exist("0", None).await.unwrap().unwrap();
        let held = a.acquire(&lease).await.unwrap();

        // A checkpoint moves the token; renewal still works from the old copy.
        a.checkpoint(&held, "42").await.unwrap();
        let renewed = a.renew(&held).await.unwrap();
        assert_eq!(renewed.continuation_token.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_renew_missing_lease_is_lease_lost() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let lease = a.create_if_not_exist("0", None).await.unwrap().unwrap();
        let held = a.acquire(&lease).await.unwrap();
        a.delete(&held).await.unwrap();

        assert!(a.renew(&held).await.unwrap_err().is_lease_lost());
        assert!(a.release(&held).await.unwrap_err().is_lease_lost());
    }

    #[tokio::test]
    async fn test_checkpoint_requires_token() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let lease = a.create_if_not_exist("0", None).await.unwrap().unwrap();
        let err = a.checkpoint(&lease, "").await.unwrap_err();
        assert!(matches!(err, LeaseError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_release_clears_owner() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let lease = a.create_if_not_exist("0", None).await.unwrap().unwrap();
        let held = a.acquire(&lease).await.unwrap();
        a.release(&held).await.unwrap();

        let all = a.get_all_leases().await.unwrap();
        assert!(all[0].is_unowned());
    }

    #[tokio::test]
    async fn test_update_properties_requires_own_lease() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");
        let lease = a.create_if_not_exist("0", None).await.unwrap().unwrap();
        let mut held = a.acquire(&lease).await.unwrap();
        held.properties.insert("x".to_string(), "1".to_string());

        assert!(b.update_properties(&held).await.unwrap_err().is_lease_lost());
        let updated = a.update_properties(&held).await.unwrap();
        assert_eq!(updated.properties.get("x").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let lease = a.create_if_not_exist("0", None).await.unwrap().unwrap();
        a.delete(&lease).await.unwrap();
        a.delete(&lease).await.unwrap();
        assert!(a.get_all_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_ignores_bootstrap_records() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        a.create_if_not_exist("0", None).await.unwrap();
        let lease = a.create_if_not_exist("1", None).await.unwrap().unwrap();
        a.acquire(&lease).await.unwrap();
        a.mark_initialized().await.unwrap();
        assert!(a.acquire_initialization_lock(Duration::from_secs(30)).await.unwrap());

        assert_eq!(a.get_all_leases().await.unwrap().len(), 2);
        let owned = a.get_owned_leases().await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].partition_id, "1");
    }

    #[tokio::test]
    async fn test_initialization_lock_is_exclusive() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");

        assert!(!a.is_initialized().await.unwrap());
        assert!(a.acquire_initialization_lock(Duration::from_secs(30)).await.unwrap());
        assert!(!b.acquire_initialization_lock(Duration::from_secs(30)).await.unwrap());
        assert!(!b.release_initialization_lock().await.unwrap());

        a.mark_initialized().await.unwrap();
        assert!(a.release_initialization_lock().await.unwrap());
        assert!(b.is_initialized().await.unwrap());
        assert!(b.acquire_initialization_lock(Duration::from_secs(30)).await.unwrap());
    }
}
