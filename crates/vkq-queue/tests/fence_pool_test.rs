//! Integration test: FencePool
//!
//! Fence acquisition, recycling and teardown against the simulated driver.
//!
//! Run with: cargo test --test fence_pool_test -- --nocapture

use std::sync::Arc;

use vkq_queue::driver::Driver;
use vkq_queue::fence::{ExternalFence, FencePool, RecyclableFence};
use vkq_queue::simulated::SimulatedDriver;

fn make_pool() -> (Arc<SimulatedDriver>, Arc<FencePool>) {
    vkq_common::try_init_logging();
    let driver = Arc::new(SimulatedDriver::new());
    let pool = Arc::new(FencePool::new(driver.clone()));
    (driver, pool)
}

#[test]
fn test_two_acquires_yield_distinct_fences() {
    let (driver, pool) = make_pool();

    let (a, recycled_a) = pool.acquire().expect("acquire first fence");
    let (b, recycled_b) = pool.acquire().expect("acquire second fence");
    println!("acquired {:?} and {:?}", a, b);

    assert_ne!(a, b);
    assert!(!recycled_a && !recycled_b);
    assert_eq!(driver.live_fence_count(), 2);
}

#[test]
fn test_recycled_fence_is_reset_before_reuse() {
    let (driver, pool) = make_pool();

    let first = RecyclableFence::new(&pool).expect("create fence");
    let handle = first.handle();
    driver.signal_fence(handle);
    assert_eq!(first.status(), Ok(true));

    drop(first);
    assert_eq!(pool.free_count(), 1);
    // Release leaves the signaled state alone
    assert_eq!(driver.is_fence_signaled(handle), Some(true));

    let second = RecyclableFence::new(&pool).expect("recycle fence");
    assert_eq!(second.handle(), handle);
    assert_eq!(second.status(), Ok(false));
    assert_eq!(pool.free_count(), 0);
}

#[test]
fn test_shared_fence_stays_out_of_pool_while_referenced() {
    let (_driver, pool) = make_pool();

    let fence = Arc::new(RecyclableFence::new(&pool).expect("create fence"));
    let waiter_ref = fence.clone();

    drop(fence);
    assert_eq!(pool.free_count(), 0, "fence recycled while a waiter holds it");

    drop(waiter_ref);
    assert_eq!(pool.free_count(), 1);
}

#[test]
fn test_release_after_destroy_all_destroys_fence() {
    let (driver, pool) = make_pool();

    let pooled = RecyclableFence::new(&pool).expect("create pooled fence");
    let outstanding = RecyclableFence::new(&pool).expect("create outstanding fence");
    drop(pooled);
    assert_eq!(driver.live_fence_count(), 2);

    pool.destroy_all();
    assert_eq!(driver.live_fence_count(), 1);

    drop(outstanding);
    assert_eq!(pool.free_count(), 0);
    assert_eq!(driver.live_fence_count(), 0);
}

#[test]
fn test_wait_times_out_on_unsignaled_fence() {
    let (driver, pool) = make_pool();

    let fence = RecyclableFence::new(&pool).expect("create fence");
    let result = fence.wait(5_000_000);
    assert_eq!(result, Err(ash::vk::Result::TIMEOUT));

    let handle = fence.handle();
    let signaler = {
        let driver = driver.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            driver.signal_fence(handle);
        })
    };
    fence.wait(5_000_000_000).expect("fence signaled by other thread");
    signaler.join().expect("signaler thread panicked");
}

#[test]
fn test_external_fence_is_destroyed_not_pooled() {
    let (driver, pool) = make_pool();
    let dyn_driver: Arc<dyn Driver> = driver.clone();

    let external = ExternalFence::new(dyn_driver).expect("create external fence");
    assert_eq!(driver.live_fence_count(), 1);

    drop(external);
    assert_eq!(driver.live_fence_count(), 0);
    assert_eq!(pool.free_count(), 0);
}
