//! Property-based tests for pool accounting and retry behavior

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::strategies::*;
use proptest::prelude::*;
use reelflow_core::error::StepError;
use reelflow_core::models::{ResourceAmounts, ResourceType};
use reelflow_core::resilience::RetryExecutor;
use reelflow_core::resources::{ResourceAllocator, ResourcePool};

const EPSILON: f64 = 1e-6;

fn assert_within_capacity(pool: &ResourcePool) {
    for resource_type in ResourceType::ALL {
        let reserved = pool.reserved(resource_type);
        assert!(reserved >= -EPSILON, "{resource_type} reserved went negative: {reserved}");
        assert!(
            reserved <= pool.total(resource_type) + EPSILON,
            "{resource_type} oversubscribed: {reserved} > {}",
            pool.total(resource_type)
        );
    }
}

#[derive(Debug, Clone)]
enum PoolOp {
    Reserve(ResourceAmounts),
    /// Release the n-th live reservation, modulo the live count
    Release(usize),
}

fn pool_op_strategy() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        3 => requirements_strategy().prop_map(|r| PoolOp::Reserve(r.amounts())),
        2 => any::<usize>().prop_map(PoolOp::Release),
    ]
}

proptest! {
    #[test]
    fn test_pool_never_oversubscribes(
        totals in pool_totals_strategy(),
        ops in prop::collection::vec(pool_op_strategy(), 1..60),
    ) {
        let pool = ResourcePool::new("prop-node", totals);
        let mut live: Vec<ResourceAmounts> = Vec::new();

        for op in ops {
            match op {
                PoolOp::Reserve(amounts) => {
                    let fitted = pool.fits(&amounts);
                    let reserved = pool.try_reserve(&amounts).is_ok();
                    prop_assert_eq!(fitted, reserved);
                    if reserved {
                        live.push(amounts);
                    }
                }
                PoolOp::Release(n) if !live.is_empty() => {
                    let amounts = live.swap_remove(n % live.len());
                    pool.release(&amounts);
                }
                PoolOp::Release(_) => {}
            }
            assert_within_capacity(&pool);
        }

        for amounts in live.drain(..) {
            pool.release(&amounts);
        }
        for resource_type in ResourceType::ALL {
            prop_assert!(pool.reserved(resource_type).abs() < EPSILON);
            prop_assert!((pool.available(resource_type) - pool.total(resource_type)).abs() < EPSILON);
        }
    }

    #[test]
    fn test_refused_reservation_changes_nothing(
        totals in pool_totals_strategy(),
        requirements in requirements_strategy(),
    ) {
        let pool = ResourcePool::new("prop-node", totals);
        let before = pool.reserved_amounts();
        if let Err(err) = pool.try_reserve(&requirements.amounts()) {
            prop_assert_eq!(pool.reserved_amounts(), before);
            prop_assert!(err.requested > err.available);
        }
    }

    #[test]
    fn test_release_is_idempotent(
        requirements in requirements_strategy(),
        priority in priority_strategy(),
        releases in 1usize..5,
    ) {
        let pool = Arc::new(ResourcePool::new(
            "prop-node",
            ResourceAmounts {
                cpu_cores: 64.0,
                memory_gb: 256.0,
                storage_gb: 2_000.0,
                network_mbps: 10_000.0,
                gpu_units: 8.0,
            },
        ));
        let allocator = ResourceAllocator::new(pool.clone());
        let allocation = allocator
            .allocate(&analysis_with("prop-job".to_string(), requirements, priority))
            .expect("oversized pool fits every generated request");

        let released = (0..releases)
            .filter(|_| allocator.release(allocation.id).is_some())
            .count();

        prop_assert_eq!(released, 1);
        prop_assert_eq!(allocator.active_count(), 0);
        for resource_type in ResourceType::ALL {
            prop_assert!(pool.reserved(resource_type).abs() < EPSILON);
        }
        prop_assert!(allocator.verify_invariants().is_ok());
    }

    #[test]
    fn test_backoff_is_bounded_and_never_shrinks(
        policy in retry_policy_strategy(),
        retries in 1u32..12,
    ) {
        let max = Duration::from_millis(policy.max_backoff_ms);
        let executor = RetryExecutor::new(policy);
        let mut previous = Duration::ZERO;

        for retry_index in 0..retries {
            let delay = executor.delay_for(retry_index, previous);
            prop_assert!(delay >= previous, "delay shrank: {:?} < {:?}", delay, previous);
            prop_assert!(delay <= max, "delay {:?} above cap {:?}", delay, max);
            previous = delay;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_attempts_never_exceed_policy(
        policy in retry_policy_strategy(),
        failures in 0u32..10,
    ) {
        // Keep the real sleeps short
        let mut policy = policy;
        policy.backoff_ms = 1;
        policy.max_backoff_ms = 2;
        let max_attempts = policy.max_retries + 1;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        let calls = AtomicU32::new(0);
        let outcome = runtime.block_on(RetryExecutor::new(policy).execute(|_attempt| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < failures {
                    Err(StepError::transient("flaky"))
                } else {
                    Ok(call)
                }
            }
        }));

        let calls = calls.load(Ordering::SeqCst);
        prop_assert_eq!(outcome.attempts, calls);
        prop_assert!(outcome.attempts <= max_attempts);
        prop_assert_eq!(outcome.delays.len() as u32, outcome.attempts - 1);
        prop_assert_eq!(outcome.result.is_ok(), failures < max_attempts);
    }
}
