//! Two hosts sharing a four-partition in-memory feed.
//!
//! The first host starts alone and takes every lease; when the second joins
//! it steals leases until each owns two. Stopping the first host releases its
//! leases, which the second then picks up.
//!
//! Run with: cargo run --example in_memory --features test-utilities

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use feedlease::feed::InMemoryFeed;
use feedlease::lease::InMemoryLeaseStore;
use feedlease::prelude::*;
use feedlease::telemetry::{LogFormat, init_logging};
use serde_json::{Value, json};
use tracing::info;

struct CountingObserver {
    host: String,
    processed: Arc<AtomicUsize>,
}

#[async_trait]
impl ChangeObserver for CountingObserver {
    async fn open(&self, ctx: &ObserverContext) -> Result<(), ObserverError> {
        info!(host = %self.host, partition_id = ctx.partition_id(), "Observer opened");
        Ok(())
    }

    async fn close(&self, ctx: &ObserverContext, reason: CloseReason) -> Result<(), ObserverError> {
        info!(host = %self.host, partition_id = ctx.partition_id(), %reason, "Observer closed");
        Ok(())
    }

    async fn process_changes(
        &self,
        ctx: &ObserverContext,
        changes: Vec<Value>,
    ) -> Result<(), ObserverError> {
        self.processed.fetch_add(changes.len(), Ordering::SeqCst);
        info!(host = %self.host, partition_id = ctx.partition_id(), count = changes.len(), "Processed changes");
        Ok(())
    }
}

fn host(
    name: &str,
    store: &InMemoryLeaseStore,
    feed: &InMemoryFeed,
    processed: Arc<AtomicUsize>,
) -> LeaseResult<FeedProcessorHost> {
    let options = ProcessorOptions {
        host_name: name.to_string(),
        lease_renew_interval: Duration::from_secs(1),
        lease_acquire_interval: Duration::from_millis(500),
        lease_expiration_interval: Duration::from_secs(5),
        feed_poll_delay: Duration::from_millis(200),
        start_from_beginning: true,
        ..Default::default()
    };
    let host_name = name.to_string();
    FeedProcessorHost::builder(options)
        .lease_store(Arc::new(store.clone()))
        .feed(Arc::new(feed.clone()))
        .observer_factory(Arc::new(move || {
            Arc::new(CountingObserver {
                host: host_name.clone(),
                processed: processed.clone(),
            }) as Arc<dyn ChangeObserver>
        }))
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(LogFormat::from_env())?;

    let store = InMemoryLeaseStore::new();
    let feed = InMemoryFeed::with_partitions(&["0", "1", "2", "3"]);
    for i in 0..40 {
        feed.append(&(i % 4).to_string(), json!({ "id": i }));
    }

    let processed = Arc::new(AtomicUsize::new(0));
    let first = host("host-a", &store, &feed, processed.clone())?;
    let second = host("host-b", &store, &feed, processed.clone())?;

    first.start().await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!(owned = ?first.owned_partitions(), "host-a alone");

    second.start().await?;
    tokio::time::sleep(Duration::from_secs(4)).await;
    info!(a = ?first.owned_partitions(), b = ?second.owned_partitions(), "Balanced");

    first.stop().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!(owned = ?second.owned_partitions(), "host-a stopped");

    let backlog = second.remaining_work_estimator().estimate().await?;
    info!(processed = processed.load(Ordering::SeqCst), backlog, "Done");
    second.stop().await;
    Ok(())
}
