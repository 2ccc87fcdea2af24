//! Load Balancer Service
//!
//! Pure domain logic for picking one instance out of the healthy set.
//! This is the only place selection strategies live; the registry just
//! hands over health-filtered lists.

use crate::domain::entities::InstanceSnapshot;
use crate::domain::value_objects::LoadBalancingStrategy;
use rand::Rng;
use std::net::IpAddr;

/// Per-request inputs a strategy may look at.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub client_ip: Option<IpAddr>,
}

impl SelectionContext {
    pub fn with_client_ip(ip: IpAddr) -> Self {
        Self {
            client_ip: Some(ip),
        }
    }
}

/// Strategy-based instance selection.
///
/// All functions are deterministic for the same inputs except the weighted
/// and random strategies, whose randomness comes from the caller's `rng`.
pub struct LoadBalancer;

impl LoadBalancer {
    /// Select an instance index from `candidates`.
    ///
    /// # Arguments
    /// * `strategy` - Selection rule
    /// * `candidates` - Healthy instances in registration order
    /// * `ctx` - Request context (client IP for ip-hash)
    /// * `cursor` - Round-robin counter value for this call
    /// * `rng` - Randomness source for weighted/random
    ///
    /// # Returns
    /// Index into `candidates`, or None when the list is empty
    pub fn pick_index<R: Rng>(
        strategy: LoadBalancingStrategy,
        candidates: &[InstanceSnapshot],
        ctx: &SelectionContext,
        cursor: usize,
        rng: &mut R,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let index = match strategy {
            LoadBalancingStrategy::RoundRobin => cursor % candidates.len(),
            LoadBalancingStrategy::Weighted => Self::weighted_index(candidates, rng),
            LoadBalancingStrategy::LeastConnections => Self::least_connections_index(candidates),
            LoadBalancingStrategy::IpHash => Self::ip_hash_index(candidates, ctx.client_ip),
            LoadBalancingStrategy::Random => rng.gen_range(0..candidates.len()),
            LoadBalancingStrategy::FastestResponse => Self::fastest_response_index(candidates),
        };

        Some(index)
    }

    /// Cumulative weight walk over a uniform draw in `[0, total_weight)`.
    fn weighted_index<R: Rng>(candidates: &[InstanceSnapshot], rng: &mut R) -> usize {
        let total: u64 = candidates.iter().map(|c| c.weight.max(1) as u64).sum();
        let mut draw = rng.gen_range(0..total);

        for (i, candidate) in candidates.iter().enumerate() {
            let weight = candidate.weight.max(1) as u64;
            if draw < weight {
                return i;
            }
            draw -= weight;
        }

        candidates.len() - 1
    }

    /// Fewest active connections; first-seen wins ties.
    fn least_connections_index(candidates: &[InstanceSnapshot]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.current_connections)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Stable hash of the client IP modulo the instance count.
    ///
    /// Requests without a client address all hash the same key.
    fn ip_hash_index(candidates: &[InstanceSnapshot], client_ip: Option<IpAddr>) -> usize {
        let key = client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        crc32fast::hash(key.as_bytes()) as usize % candidates.len()
    }

    /// Lowest last-observed latency. Instances without a sample count as 0.
    fn fastest_response_index(candidates: &[InstanceSnapshot]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.last_latency_ms.unwrap_or(0))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}
