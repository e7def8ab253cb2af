//! Ownership and checkpoint guarantees of the lease manager under contention.
//!
//! These tests run several managers (one per simulated host) against a single
//! in-memory lease store and check the properties the fleet relies on:
//!
//! 1. **Single owner**: of many concurrent acquirers of one lease, exactly
//!    one succeeds and the rest see `LeaseLost`
//! 2. **Checkpoints survive renewals**: renewals racing with checkpoints
//!    never roll the continuation back
//! 3. **Stale owners are fenced**: a host that lost its lease cannot
//!    checkpoint, renew or release it
//! 4. **Takeovers need a current copy**: an acquire decided on a copy that
//!    has since been written to fails with `LeaseLost`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use feedlease::error::LeaseError;
use feedlease::lease::{
    InMemoryLeaseStore, Lease, LeaseCheckpointer, LeaseContainer, LeaseOwnership,
    LeaseStoreManager, PartitionedByIdRequestOptions, SinglePartitionRequestOptions,
};
use tokio::task::JoinSet;

fn manager(store: &InMemoryLeaseStore, host: &str) -> Arc<LeaseStoreManager> {
    Arc::new(LeaseStoreManager::new(
        Arc::new(store.clone()),
        Arc::new(SinglePartitionRequestOptions),
        "fleet",
        host,
    ))
}

async fn unowned_lease(store: &InMemoryLeaseStore, partition_id: &str) -> Lease {
    manager(store, "creator")
        .create_if_not_exist(partition_id, None)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_has_single_winner() {
    let store = InMemoryLeaseStore::new();
    let lease = unowned_lease(&store, "0").await;

    let mut tasks = JoinSet::new();
    for i in 0..16 {
        let manager = manager(&store, &format!("host-{i}"));
        let lease = lease.clone();
        tasks.spawn(async move { manager.acquire(&lease).await });
    }

    let mut winners = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(acquired) => winners.push(acquired.owner.unwrap()),
            Err(e) => assert!(e.is_lease_lost(), "unexpected error: {e}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = manager(&store, "observer").get_all_leases().await.unwrap();
    assert_eq!(stored[0].owner.as_deref(), Some(winners[0].as_str()));
}

#[tokio::test]
async fn test_create_is_idempotent_across_hosts() {
    let store = InMemoryLeaseStore::new();
    let a = manager(&store, "a");
    let b = manager(&store, "b");

    assert!(a.create_if_not_exist("7", Some("10".into())).await.unwrap().is_some());
    assert!(b.create_if_not_exist("7", None).await.unwrap().is_none());

    let leases = a.get_all_leases().await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].continuation_token.as_deref(), Some("10"));
}

#[tokio::test]
async fn test_checkpoints_survive_concurrent_renewals() {
    let store = InMemoryLeaseStore::new();
    let host = manager(&store, "a");
    let lease = host.acquire(&unowned_lease(&store, "0").await).await.unwrap();

    let renewing = {
        let host = host.clone();
        let lease = lease.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                host.renew(&lease).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    // The checkpointer keeps its original copy, so most writes hit a stale
    // etag and must be re-applied on the server copy.
    for i in 1..=50 {
        let updated = host.checkpoint(&lease, &i.to_string()).await.unwrap();
        assert_eq!(updated.continuation_token, Some(i.to_string()));
        tokio::task::yield_now().await;
    }
    renewing.await.unwrap();

    let stored = host.get_owned_leases().await.unwrap();
    assert_eq!(stored[0].continuation_token.as_deref(), Some("50"));
}

#[tokio::test]
async fn test_renewal_never_clobbers_checkpoint() {
    let store = InMemoryLeaseStore::new();
    let host = manager(&store, "a");
    let stale = host.acquire(&unowned_lease(&store, "0").await).await.unwrap();

    host.checkpoint(&stale, "42").await.unwrap();
    let renewed = host.renew(&stale).await.unwrap();

    assert_eq!(renewed.continuation_token.as_deref(), Some("42"));
}

#[tokio::test]
async fn test_checkpoint_after_takeover_is_rejected() {
    let store = InMemoryLeaseStore::new();
    let a = manager(&store, "a");
    let b = manager(&store, "b");
    let held_by_a = a.acquire(&unowned_lease(&store, "0").await).await.unwrap();
    a.checkpoint(&held_by_a, "5").await.unwrap();

    // B takes the lease from the copy it listed.
    let listed = b.get_all_leases().await.unwrap().remove(0);
    b.acquire(&listed).await.unwrap();

    let err = a.checkpoint(&held_by_a, "9").await.unwrap_err();
    assert!(err.is_lease_lost());
    assert!(a.renew(&held_by_a).await.unwrap_err().is_lease_lost());
    assert!(a.release(&held_by_a).await.unwrap_err().is_lease_lost());

    let stored = b.get_owned_leases().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].continuation_token.as_deref(), Some("5"));
}

#[tokio::test]
async fn test_checkpoint_and_takeover_from_same_copy_have_one_winner() {
    let store = InMemoryLeaseStore::new();
    let a = manager(&store, "a");
    let b = manager(&store, "b");
    let held = a.acquire(&unowned_lease(&store, "0").await).await.unwrap();

    // Checkpoint first: the takeover's copy is outdated.
    let (checkpointed, taken) = tokio::join!(a.checkpoint(&held, "tok1"), b.acquire(&held));
    assert!(checkpointed.is_ok());
    assert!(taken.unwrap_err().is_lease_lost());

    // Takeover first: the checkpoint finds a new owner.
    let current = b.get_all_leases().await.unwrap().remove(0);
    let (taken, checkpointed) = tokio::join!(b.acquire(&current), a.checkpoint(&current, "tok2"));
    assert!(taken.is_ok());
    assert!(checkpointed.unwrap_err().is_lease_lost());

    let stored = b.get_owned_leases().await.unwrap();
    assert_eq!(stored[0].continuation_token.as_deref(), Some("tok1"));
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let store = InMemoryLeaseStore::new();
    let a = manager(&store, "a");
    let b = manager(&store, "b");
    let held = a.acquire(&unowned_lease(&store, "0").await).await.unwrap();

    store.set_timestamp(&held.id, Utc::now() - chrono::Duration::seconds(120));
    let listed = b.get_all_leases().await.unwrap().remove(0);
    assert!(listed.is_expired(Duration::from_secs(60), Utc::now()));

    let taken = b.acquire(&listed).await.unwrap();
    assert!(taken.is_owned_by("b"));
    assert!(!taken.is_expired(Duration::from_secs(60), Utc::now()));
}

#[tokio::test]
async fn test_deleted_lease_is_lost() {
    let store = InMemoryLeaseStore::new();
    let a = manager(&store, "a");
    let held = a.acquire(&unowned_lease(&store, "0").await).await.unwrap();

    a.delete(&held).await.unwrap();
    // Deleting twice is fine.
    a.delete(&held).await.unwrap();

    assert!(a.renew(&held).await.unwrap_err().is_lease_lost());
    assert!(a.checkpoint(&held, "1").await.unwrap_err().is_lease_lost());
}

#[tokio::test]
async fn test_properties_require_ownership() {
    let store = InMemoryLeaseStore::new();
    let a = manager(&store, "a");
    let b = manager(&store, "b");
    let mut held = a.acquire(&unowned_lease(&store, "0").await).await.unwrap();

    held.properties.insert("region".into(), "west".into());
    let updated = a.update_properties(&held).await.unwrap();
    assert_eq!(updated.properties.get("region").map(String::as_str), Some("west"));

    assert!(matches!(
        b.update_properties(&held).await,
        Err(LeaseError::LeaseLost { .. })
    ));
}

#[tokio::test]
async fn test_partitioned_request_options_round_trip() {
    let store = InMemoryLeaseStore::new();
    let host = LeaseStoreManager::new(
        Arc::new(store.clone()),
        Arc::new(PartitionedByIdRequestOptions),
        "fleet",
        "a",
    );
    let created = host.create_if_not_exist("3", None).await.unwrap().unwrap();
    let acquired = host.acquire(&created).await.unwrap();
    host.checkpoint(&acquired, "12").await.unwrap();
    host.release(&acquired).await.unwrap();

    let stored = host.get_all_leases().await.unwrap();
    assert!(stored[0].is_unowned());
    assert_eq!(stored[0].continuation_token.as_deref(), Some("12"));
}
