//! Lease distribution across the fleet.

pub mod load_balancer;
pub mod strategy;

pub use load_balancer::PartitionLoadBalancer;
pub use strategy::{EqualPartitionsBalancingStrategy, LoadBalancingStrategy};
