//! Host wiring: one process's participation in the fleet.
//!
//! ```text
//! FeedProcessorHost::start
//!   ├── Bootstrapper::initialize      (lease set exists)
//!   ├── PartitionController::initialize (resume leases we already own)
//!   └── PartitionLoadBalancer::start  (periodic acquisition)
//!
//! FeedProcessorHost::stop
//!   ├── PartitionLoadBalancer::stop   (no new acquisitions)
//!   └── PartitionController::shutdown (close observers, release leases)
//! ```

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::balancing::{EqualPartitionsBalancingStrategy, LoadBalancingStrategy, PartitionLoadBalancer};
use crate::bootstrap::Bootstrapper;
use crate::config::ProcessorOptions;
use crate::error::{LeaseError, LeaseResult};
use crate::estimator::RemainingWorkEstimator;
use crate::feed::FeedSource;
use crate::lease::{LeaseStore, LeaseStoreManager, RequestOptionsFactory, SinglePartitionRequestOptions};
use crate::observer::ChangeObserverFactory;
use crate::partition::{
    FeedProcessorFactory, PartitionController, PartitionProcessorFactory, PartitionSynchronizer,
    ProcessorSettings, SupervisorFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostState {
    Created,
    Running,
    Stopped,
}

/// Builder for [`FeedProcessorHost`].
pub struct FeedProcessorHostBuilder {
    options: ProcessorOptions,
    lease_store: Option<Arc<dyn LeaseStore>>,
    feed: Option<Arc<dyn FeedSource>>,
    observer_factory: Option<Arc<dyn ChangeObserverFactory>>,
    request_options: Arc<dyn RequestOptionsFactory>,
    processor_factory: Option<Arc<dyn PartitionProcessorFactory>>,
    strategy: Option<Arc<dyn LoadBalancingStrategy>>,
}

impl FeedProcessorHostBuilder {
    pub fn new(options: ProcessorOptions) -> Self {
        Self {
            options,
            lease_store: None,
            feed: None,
            observer_factory: None,
            request_options: Arc::new(SinglePartitionRequestOptions),
            processor_factory: None,
            strategy: None,
        }
    }

    pub fn lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(store);
        self
    }

    pub fn feed(mut self, feed: Arc<dyn FeedSource>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn observer_factory(mut self, factory: Arc<dyn ChangeObserverFactory>) -> Self {
        self.observer_factory = Some(factory);
        self
    }

    /// How lease requests are routed in a partitioned lease collection.
    pub fn request_options(mut self, factory: Arc<dyn RequestOptionsFactory>) -> Self {
        self.request_options = factory;
        self
    }

    /// Replace the default feed-draining partition processor.
    pub fn processor_factory(mut self, factory: Arc<dyn PartitionProcessorFactory>) -> Self {
        self.processor_factory = Some(factory);
        self
    }

    /// Replace the equal-partitions strategy.
    pub fn balancing_strategy(mut self, strategy: Arc<dyn LoadBalancingStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn build(self) -> LeaseResult<FeedProcessorHost> {
        self.options.ensure_valid()?;
        let options = self.options;

        let store = self
            .lease_store
            .ok_or_else(|| LeaseError::Config("a lease store is required".to_string()))?;
        let feed = self
            .feed
            .ok_or_else(|| LeaseError::Config("a feed source is required".to_string()))?;
        let observer_factory = self
            .observer_factory
            .ok_or_else(|| LeaseError::Config("an observer factory is required".to_string()))?;

        let manager = Arc::new(LeaseStoreManager::new(
            store,
            self.request_options,
            options.lease_prefix.clone(),
            options.host_name.clone(),
        ));

        let synchronizer = Arc::new(PartitionSynchronizer::new(
            feed.clone(),
            manager.clone(),
            manager.clone(),
            options.degree_of_parallelism,
            options.query_batch_size,
        ));

        let processor_factory = self.processor_factory.unwrap_or_else(|| {
            Arc::new(FeedProcessorFactory::new(
                feed.clone(),
                ProcessorSettings::from(&options),
            ))
        });
        let supervisors = SupervisorFactory::new(
            observer_factory,
            processor_factory,
            manager.clone(),
            manager.clone(),
            options.lease_renew_interval,
            options.checkpoint_frequency.clone(),
        );
        let controller = PartitionController::new(
            manager.clone(),
            manager.clone(),
            synchronizer.clone(),
            supervisors,
        );

        let strategy = self.strategy.unwrap_or_else(|| {
            Arc::new(EqualPartitionsBalancingStrategy::new(
                options.host_name.clone(),
                options.min_partition_count,
                options.max_partition_count,
                options.lease_expiration_interval,
            ))
        });
        let balancer = Arc::new(PartitionLoadBalancer::new(
            controller.clone(),
            manager.clone(),
            strategy,
            options.lease_acquire_interval,
        ));

        let bootstrapper = Bootstrapper::new(
            synchronizer,
            manager.clone(),
            options.lock_time,
            options.sleep_time,
        );

        Ok(FeedProcessorHost {
            options,
            manager,
            feed,
            bootstrapper,
            controller,
            balancer,
            state: Mutex::new(HostState::Created),
        })
    }
}

pub struct FeedProcessorHost {
    options: ProcessorOptions,
    manager: Arc<LeaseStoreManager>,
    feed: Arc<dyn FeedSource>,
    bootstrapper: Bootstrapper,
    controller: PartitionController,
    balancer: Arc<PartitionLoadBalancer>,
    state: Mutex<HostState>,
}

impl FeedProcessorHost {
    pub fn builder(options: ProcessorOptions) -> FeedProcessorHostBuilder {
        FeedProcessorHostBuilder::new(options)
    }

    pub fn host_name(&self) -> &str {
        &self.options.host_name
    }

    /// Bootstrap the lease set, resume owned leases, and start balancing.
    ///
    /// A host can be started once; starting a running host is a no-op.
    pub async fn start(&self) -> LeaseResult<()> {
        let mut state = self.state.lock().await;
        match *state {
            HostState::Running => return Ok(()),
            HostState::Stopped => {
                return Err(LeaseError::InvalidOperation(
                    "a stopped host cannot be restarted".to_string(),
                ));
            }
            HostState::Created => {}
        }

        info!(host_name = %self.options.host_name, prefix = %self.options.lease_prefix, "Starting feed processor host");
        self.bootstrapper.initialize().await?;
        self.controller.initialize().await?;
        self.balancer.start().await;
        *state = HostState::Running;
        info!(host_name = %self.options.host_name, "Feed processor host started");
        Ok(())
    }

    /// Stop balancing, close every observer and release every lease.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if *state == HostState::Stopped {
            return;
        }
        info!(host_name = %self.options.host_name, "Stopping feed processor host");
        self.balancer.stop().await;
        self.controller.shutdown().await;
        *state = HostState::Stopped;
        info!(host_name = %self.options.host_name, "Feed processor host stopped");
    }

    /// Partitions this host currently owns or is acquiring.
    pub fn owned_partitions(&self) -> Vec<String> {
        self.controller.owned_partitions()
    }

    /// Estimator over the same lease set and feed as this host.
    pub fn remaining_work_estimator(&self) -> RemainingWorkEstimator {
        RemainingWorkEstimator::new(self.manager.clone(), self.feed.clone(), &self.options)
    }

    pub fn lease_manager(&self) -> Arc<LeaseStoreManager> {
        self.manager.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::memory::InMemoryFeed;
    use crate::lease::memory::InMemoryLeaseStore;
    use crate::error::ObserverError;
    use crate::observer::{ChangeObserver, ObserverContext};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Discard;

    #[async_trait]
    impl ChangeObserver for Discard {
        async fn process_changes(
            &self,
            _ctx: &ObserverContext,
            _changes: Vec<Value>,
        ) -> Result<(), ObserverError> {
            Ok(())
        }
    }

    fn factory() -> Arc<dyn ChangeObserverFactory> {
        Arc::new(|| Arc::new(Discard) as Arc<dyn ChangeObserver>)
    }

    #[test]
    fn test_build_requires_collaborators() {
        let err = FeedProcessorHost::builder(ProcessorOptions::default())
            .feed(Arc::new(InMemoryFeed::new()))
            .observer_factory(factory())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, LeaseError::Config(_)));
    }

    #[test]
    fn test_build_rejects_invalid_options() {
        let options = ProcessorOptions {
            host_name: String::new(),
            ..Default::default()
        };
        let err = FeedProcessorHost::builder(options)
            .lease_store(Arc::new(InMemoryLeaseStore::new()))
            .feed(Arc::new(InMemoryFeed::new()))
            .observer_factory(factory())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, LeaseError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_host_cannot_restart() {
        let host = FeedProcessorHost::builder(ProcessorOptions::default())
            .lease_store(Arc::new(InMemoryLeaseStore::new()))
            .feed(Arc::new(InMemoryFeed::with_partitions(&["0"])))
            .observer_factory(factory())
            .build()
            .unwrap();

        host.start().await.unwrap();
        host.start().await.unwrap();
        host.stop().await;
        assert!(host.owned_partitions().is_empty());
        assert!(matches!(
            host.start().await,
            Err(LeaseError::InvalidOperation(_))
        ));
    }
}
