//! Integration test: CommandQueue
//!
//! Drives the synchronous submission engine against the simulated driver:
//! ordered completion, release, failure handling, blocking waits, garbage
//! cleanup and device loss.
//!
//! Run with: cargo test --test command_queue_test -- --nocapture

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};
use vkq_core::config::QueueLimits;
use vkq_core::{Priority, ProtectionType, QueueSerial, ResourceUse, Serial, SerialIndex, SerialLedger};
use vkq_queue::batch::{SecondaryCommandPool, SecondaryCommands};
use vkq_queue::command_queue::CommandQueue;
use vkq_queue::driver::{Driver, PresentDescriptor, SwapchainStatus};
use vkq_queue::fence::ExternalFence;
use vkq_queue::simulated::{CommandBufferState, SimulatedDriver};
use vkq_queue::QueueError;

const PROT: ProtectionType = ProtectionType::Unprotected;
const PRIO: Priority = Priority::Medium;
const LONG_WAIT_NS: u64 = 5_000_000_000;

#[derive(Default)]
struct RecyclingPool {
    recycled: Mutex<Vec<vk::CommandBuffer>>,
}

impl SecondaryCommandPool for RecyclingPool {
    fn recycle(&self, command_buffer: vk::CommandBuffer) {
        self.recycled.lock().unwrap().push(command_buffer);
    }
}

fn test_limits() -> QueueLimits {
    QueueLimits {
        in_flight_commands_limit: 8,
        max_finished_commands_limit: 16,
        max_fence_wait_time_ns: LONG_WAIT_NS,
        serial_index_count: 4,
    }
}

fn make_queue(limits: QueueLimits) -> (Arc<SimulatedDriver>, Arc<SerialLedger>, Arc<CommandQueue>) {
    vkq_common::try_init_logging();
    let driver = Arc::new(SimulatedDriver::new());
    let ledger = Arc::new(SerialLedger::new(limits.serial_index_count));
    let queue = CommandQueue::new(driver.clone(), ledger.clone(), &limits, false)
        .expect("create command queue");
    (driver, ledger, Arc::new(queue))
}

fn idx(i: u32) -> SerialIndex {
    SerialIndex::new(i)
}

/// Record one secondary into the open primary and submit it under the next
/// serial of `index`.
fn record_and_submit(
    queue: &CommandQueue,
    ledger: &SerialLedger,
    owner: &Arc<RecyclingPool>,
    index: SerialIndex,
) -> QueueSerial {
    let serial = ledger.reserve_next(index);
    let secondary = SecondaryCommands::new(
        vk::CommandBuffer::from_raw(0xf000 + serial.serial.value()),
        owner.clone(),
    );
    queue
        .flush_outside_render_pass_commands(PROT, PRIO, secondary)
        .expect("flush secondary");
    queue
        .submit_commands(PROT, PRIO, None, None, serial)
        .expect("submit batch");
    serial
}

#[test]
fn test_completion_is_reported_in_submission_order() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());

    let s1 = record_and_submit(&queue, &ledger, &owner, idx(0));
    let _s2 = record_and_submit(&queue, &ledger, &owner, idx(0));
    let s3 = record_and_submit(&queue, &ledger, &owner, idx(0));
    assert_eq!(ledger.last_submitted(idx(0)), Serial::new(3));

    // Batches 2 and 3 finish first; batch 1 still blocks the prefix
    driver.signal_submission(1);
    driver.signal_submission(2);
    queue.check_completed().expect("check completed");
    assert_eq!(ledger.last_completed(idx(0)), Serial::ZERO);
    assert_eq!(queue.in_flight_count(), 3);
    assert!(!queue.has_queue_serial_finished(s3));

    driver.signal_submission(0);
    queue.check_completed().expect("check completed");
    assert_eq!(ledger.last_completed(idx(0)), Serial::new(3));
    assert_eq!(queue.in_flight_count(), 0);
    assert_eq!(queue.finished_count(), 3);
    assert!(queue.has_queue_serial_finished(s1));
    assert!(queue.has_queue_serial_finished(s3));
}

#[test]
fn test_release_resets_buffers_and_recycles_fences() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());

    record_and_submit(&queue, &ledger, &owner, idx(0));
    let first = driver.submissions()[0].clone();
    let primary = first.command_buffers[0];
    assert_eq!(driver.command_buffer_state(primary), Some(CommandBufferState::Executable));

    driver.signal_all();
    queue.check_and_cleanup_completed().expect("cleanup");
    assert_eq!(queue.total_batch_count(), 0);
    assert_eq!(driver.command_buffer_state(primary), Some(CommandBufferState::Initial));
    assert_eq!(queue.command_pools().free_count(PROT), 1);
    assert_eq!(queue.fence_pool().free_count(), 1);
    assert_eq!(owner.recycled.lock().unwrap().len(), 1);

    // The next batch reuses both the reset primary and the fence
    record_and_submit(&queue, &ledger, &owner, idx(0));
    let second = driver.submissions()[1].clone();
    assert_eq!(second.command_buffers, vec![primary]);
    assert_eq!(second.fence, first.fence);
    assert_eq!(driver.is_fence_signaled(second.fence), Some(false));
}

#[test]
fn test_failed_submission_is_not_enqueued() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());

    driver.fail_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    let serial = ledger.reserve_next(idx(0));
    queue
        .flush_outside_render_pass_commands(
            PROT,
            PRIO,
            SecondaryCommands::new(vk::CommandBuffer::from_raw(0xe1), owner.clone()),
        )
        .expect("flush secondary");

    match queue.submit_commands(PROT, PRIO, None, None, serial) {
        Err(QueueError::Native(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)) => {}
        other => panic!("expected Native(ERROR_OUT_OF_DEVICE_MEMORY), got {:?}", other),
    }

    assert_eq!(queue.in_flight_count(), 0);
    assert_eq!(queue.total_batch_count(), 0);
    assert_eq!(ledger.last_submitted(idx(0)), Serial::ZERO);
    assert!(!queue.has_queue_serial_submitted(serial));
    // Nothing leaked: primary back in its pool, fence back in the fence pool
    assert_eq!(queue.command_pools().free_count(PROT), 1);
    assert_eq!(queue.fence_pool().free_count(), 1);
    assert_eq!(owner.recycled.lock().unwrap().len(), 1);
    assert_eq!(queue.perf_counters().native_submit_failures_total, 1);

    // The engine keeps working with the next serial
    let next = record_and_submit(&queue, &ledger, &owner, idx(0));
    assert!(queue.has_queue_serial_submitted(next));
}

#[test]
fn test_finish_releases_lock_while_waiting() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());

    let s1 = record_and_submit(&queue, &ledger, &owner, idx(0));

    let waiter = {
        let queue = queue.clone();
        std::thread::spawn(move || queue.finish_queue_serial(s1, LONG_WAIT_NS))
    };
    std::thread::sleep(Duration::from_millis(50));

    // Submitting and polling must not block behind the waiter
    let started = Instant::now();
    let s2 = record_and_submit(&queue, &ledger, &owner, idx(1));
    queue.check_completed().expect("check completed");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(queue.has_queue_serial_submitted(s2));

    driver.signal_submission(0);
    waiter
        .join()
        .expect("waiter thread panicked")
        .expect("finish succeeded");
    assert!(queue.has_queue_serial_finished(s1));
    assert!(!queue.has_queue_serial_finished(s2));
}

#[test]
fn test_overtaken_serial_is_rejected_before_native_submit() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let s1 = ledger.reserve_next(idx(0));
    let s2 = ledger.reserve_next(idx(0));

    // s2 gets to the driver first and parks there with the submit lock held
    driver.hold_submissions();
    let later = {
        let queue = queue.clone();
        std::thread::spawn(move || {
            queue.submit_one_off(PROT, PRIO, vk::CommandBuffer::null(), None, s2)
        })
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while driver.parked_submission_count() == 0 {
        assert!(Instant::now() < deadline, "s2 never reached the driver");
        std::thread::sleep(Duration::from_millis(1));
    }

    // s1 passes the early serial check and queues up behind the submit lock
    let earlier = {
        let queue = queue.clone();
        std::thread::spawn(move || {
            queue.submit_one_off(PROT, PRIO, vk::CommandBuffer::null(), None, s1)
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    driver.release_submissions();

    later
        .join()
        .expect("submit thread panicked")
        .expect("s2 submitted");
    match earlier.join().expect("submit thread panicked") {
        Err(QueueError::InvalidTask(msg)) => println!("rejected: {}", msg),
        other => panic!("expected InvalidTask, got {:?}", other),
    }

    let order: Vec<QueueSerial> = driver.submissions().iter().map(|r| r.serial).collect();
    assert_eq!(order, vec![s2]);
    assert_eq!(queue.in_flight_count(), 1);
    // The rejected batch's fence went straight back to the pool
    assert_eq!(queue.fence_pool().free_count(), 1);

    driver.signal_submission(0);
    queue.check_completed().expect("check completed");
    assert_eq!(ledger.last_completed(idx(0)), Serial::new(2));
}

#[test]
fn test_user_timeout_wait_reports_timeout_as_result() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());

    let serial = record_and_submit(&queue, &ledger, &owner, idx(0));
    let use_ = ResourceUse::from(serial);

    let polled = queue
        .wait_for_resource_use_to_finish_with_user_timeout(&use_, 0)
        .expect("poll");
    assert_eq!(polled, vk::Result::TIMEOUT);
    assert_eq!(queue.in_flight_count(), 1);

    driver.signal_all();
    let waited = queue
        .wait_for_resource_use_to_finish_with_user_timeout(&use_, LONG_WAIT_NS)
        .expect("wait");
    assert_eq!(waited, vk::Result::SUCCESS);
    assert!(queue.has_resource_use_finished(&use_));

    let unsubmitted = ResourceUse::from(ledger.reserve_next(idx(1)));
    match queue.wait_for_resource_use_to_finish_with_user_timeout(&unsubmitted, 0) {
        Err(QueueError::NotSubmitted(_)) => {}
        other => panic!("expected NotSubmitted, got {:?}", other),
    }
}

#[test]
fn test_finish_timeout_leaves_batch_in_flight() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());

    let serial = record_and_submit(&queue, &ledger, &owner, idx(0));
    match queue.finish_queue_serial(serial, 10_000_000) {
        Err(QueueError::Timeout { timeout_ns }) => assert_eq!(timeout_ns, 10_000_000),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert_eq!(queue.in_flight_count(), 1);

    driver.signal_all();
    queue
        .finish_queue_serial(serial, LONG_WAIT_NS)
        .expect("finish after signal");
    assert_eq!(queue.total_batch_count(), 0);
}

#[test]
fn test_finish_unsubmitted_serial_is_an_error() {
    let (_driver, ledger, queue) = make_queue(test_limits());

    let reserved = ledger.reserve_next(idx(2));
    match queue.finish_queue_serial(reserved, LONG_WAIT_NS) {
        Err(QueueError::NotSubmitted(serial)) => assert_eq!(serial, reserved),
        other => panic!("expected NotSubmitted, got {:?}", other),
    }
}

#[test]
fn test_wait_idle_covers_every_index() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());

    let a = record_and_submit(&queue, &ledger, &owner, idx(0));
    let b = record_and_submit(&queue, &ledger, &owner, idx(3));

    let signaler = {
        let driver = driver.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            driver.signal_all();
        })
    };
    queue.wait_idle(LONG_WAIT_NS).expect("wait idle");
    signaler.join().expect("signaler thread panicked");

    let mut use_ = ResourceUse::from(a);
    use_.set_queue_serial(b);
    assert!(queue.has_resource_use_finished(&use_));
    assert!(!queue.is_busy());
}

#[test]
fn test_device_lost_unblocks_waiters() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());

    record_and_submit(&queue, &ledger, &owner, idx(0));
    record_and_submit(&queue, &ledger, &owner, idx(1));

    let done = Arc::new(AtomicBool::new(false));
    let waiter = {
        let queue = queue.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            let result = queue.wait_idle(60_000_000_000);
            done.store(true, Ordering::Release);
            result
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::Acquire));

    let started = Instant::now();
    driver.lose_device();
    queue.handle_device_lost();
    let result = waiter.join().expect("waiter thread panicked");
    println!("waiter returned {:?} after {:?}", result, started.elapsed());
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(queue.total_batch_count(), 0);
    assert_eq!(ledger.last_completed(idx(0)), ledger.last_submitted(idx(0)));
    assert_eq!(ledger.last_completed(idx(1)), Serial::new(1));
    assert_eq!(owner.recycled.lock().unwrap().len(), 2);
    assert!(!queue.is_busy());
}

#[test]
fn test_cleanup_some_garbage_finishes_oldest_batch() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());

    for _ in 0..3 {
        record_and_submit(&queue, &ledger, &owner, idx(0));
    }

    // Nothing finished and at most 5 to keep: nothing to do
    assert!(!queue.cleanup_some_garbage(5).expect("cleanup"));

    let signaler = {
        let driver = driver.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            driver.signal_submission(0);
        })
    };
    assert!(queue.cleanup_some_garbage(1).expect("cleanup"));
    signaler.join().expect("signaler thread panicked");

    assert_eq!(ledger.last_completed(idx(0)), Serial::new(1));
    assert_eq!(queue.in_flight_count(), 2);
    assert_eq!(queue.total_batch_count(), 2);
}

#[test]
fn test_in_flight_soft_limit_is_enforced_on_submit() {
    let limits = QueueLimits {
        in_flight_commands_limit: 2,
        max_finished_commands_limit: 4,
        ..test_limits()
    };
    let (driver, ledger, queue) = make_queue(limits);
    let owner = Arc::new(RecyclingPool::default());

    record_and_submit(&queue, &ledger, &owner, idx(0));
    record_and_submit(&queue, &ledger, &owner, idx(0));
    assert_eq!(queue.in_flight_count(), 2);

    let signaler = {
        let driver = driver.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            driver.signal_submission(0);
        })
    };
    // The third submission pushes past the limit and retires the oldest batch
    record_and_submit(&queue, &ledger, &owner, idx(0));
    signaler.join().expect("signaler thread panicked");

    assert_eq!(queue.in_flight_count(), 2);
    assert_eq!(ledger.last_completed(idx(0)), Serial::new(1));
}

#[test]
fn test_invalid_limits_are_rejected() {
    vkq_common::try_init_logging();
    let driver = Arc::new(SimulatedDriver::new());
    let ledger = Arc::new(SerialLedger::new(1));
    let limits = QueueLimits {
        in_flight_commands_limit: 10,
        max_finished_commands_limit: 5,
        ..test_limits()
    };

    match CommandQueue::new(driver, ledger, &limits, false) {
        Err(QueueError::Core(e)) => println!("rejected: {}", e),
        Err(other) => panic!("expected Core error, got {:?}", other),
        Ok(_) => panic!("expected Core error, got a queue"),
    }
}

#[test]
fn test_serials_must_increase_and_stay_in_range() {
    let (_driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());

    let serial = record_and_submit(&queue, &ledger, &owner, idx(0));
    match queue.submit_commands(PROT, PRIO, None, None, serial) {
        Err(QueueError::InvalidTask(msg)) => println!("rejected: {}", msg),
        other => panic!("expected InvalidTask, got {:?}", other),
    }

    let outside = QueueSerial::new(idx(9), Serial::new(1));
    match queue.submit_commands(PROT, PRIO, None, None, outside) {
        Err(QueueError::InvalidTask(_)) => {}
        other => panic!("expected InvalidTask, got {:?}", other),
    }
}

#[test]
fn test_protected_submission_requires_protected_content() {
    let (_driver, ledger, queue) = make_queue(test_limits());

    let serial = ledger.reserve_next(idx(0));
    match queue.submit_commands(ProtectionType::Protected, PRIO, None, None, serial) {
        Err(QueueError::ProtectedContentUnavailable) => {}
        other => panic!("expected ProtectedContentUnavailable, got {:?}", other),
    }
}

#[test]
fn test_external_fence_is_not_recycled() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let dyn_driver: Arc<dyn Driver> = driver.clone();

    let external = Arc::new(ExternalFence::new(dyn_driver).expect("create external fence"));
    let serial = ledger.reserve_next(idx(0));
    queue
        .submit_commands(PROT, PRIO, None, Some(external.clone()), serial)
        .expect("submit with external fence");
    assert_eq!(driver.submissions()[0].fence, external.handle());

    driver.signal_all();
    queue
        .finish_queue_serial(serial, LONG_WAIT_NS)
        .expect("finish");
    assert_eq!(queue.fence_pool().free_count(), 0);
    assert_eq!(external.status(), Ok(true));
}

#[test]
fn test_one_off_submission_uses_caller_buffer() {
    let (driver, ledger, queue) = make_queue(test_limits());

    let pool = driver
        .create_command_pool(PROT)
        .expect("create caller pool");
    let cb = driver.allocate_command_buffer(pool).expect("allocate");
    driver.begin_command_buffer(cb).expect("begin");
    driver.end_command_buffer(cb).expect("end");

    let wait = (vk::Semaphore::from_raw(0x77), vk::PipelineStageFlags::TRANSFER);
    let serial = ledger.reserve_next(idx(0));
    queue
        .submit_one_off(PROT, Priority::High, cb, Some(wait), serial)
        .expect("one-off submit");

    let record = driver.submissions()[0].clone();
    assert_eq!(record.command_buffers, vec![cb]);
    assert_eq!(record.wait_semaphores, vec![wait.0]);
    assert_eq!(record.priority, Priority::High);

    driver.signal_all();
    queue.finish_queue_serial(serial, LONG_WAIT_NS).expect("finish");
    // Caller-owned buffers are left alone
    assert_eq!(driver.command_buffer_state(cb), Some(CommandBufferState::Executable));
    assert_eq!(queue.command_pools().free_count(PROT), 0);
}

#[test]
fn test_present_errors_are_not_fatal() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());
    let status = SwapchainStatus::new();
    let present = PresentDescriptor {
        swapchain: vk::SwapchainKHR::from_raw(0x5c),
        image_index: 1,
        ..Default::default()
    };

    driver.set_present_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
    let code = queue.present(PRIO, &present, &status);
    assert_eq!(code, vk::Result::ERROR_OUT_OF_DATE_KHR);
    assert_eq!(status.last_present_result(), vk::Result::ERROR_OUT_OF_DATE_KHR);
    assert!(!status.is_pending());

    driver.set_present_result(Ok(true));
    assert_eq!(queue.present(PRIO, &present, &status), vk::Result::SUBOPTIMAL_KHR);

    // Submission is unaffected
    let serial = record_and_submit(&queue, &ledger, &owner, idx(0));
    assert!(queue.has_queue_serial_submitted(serial));
    assert_eq!(queue.perf_counters().present_calls_total, 2);
    assert_eq!(driver.presents().len(), 2);
}

#[test]
fn test_perf_counters_track_submissions() {
    let (driver, ledger, queue) = make_queue(test_limits());
    let owner = Arc::new(RecyclingPool::default());

    queue
        .flush_wait_semaphores(
            PROT,
            PRIO,
            vec![vk::Semaphore::from_raw(0x10), vk::Semaphore::from_raw(0x11)],
            vec![vk::PipelineStageFlags::ALL_COMMANDS; 2],
        )
        .expect("flush waits");
    record_and_submit(&queue, &ledger, &owner, idx(0));
    record_and_submit(&queue, &ledger, &owner, idx(0));

    let perf = queue.perf_counters();
    println!("{:?}", perf);
    assert_eq!(perf.submit_calls_total, 2);
    assert_eq!(perf.native_submit_calls_per_frame, 2);
    assert_eq!(perf.wait_semaphores_total, 2);
    assert_eq!(perf.batches_in_flight, 2);

    queue.reset_per_frame_perf_counters();
    let perf = queue.perf_counters();
    assert_eq!(perf.native_submit_calls_per_frame, 0);
    assert_eq!(perf.native_submit_calls_total, 2);

    driver.signal_all();
    queue.destroy();
    assert_eq!(driver.live_fence_count(), 0);
    assert_eq!(driver.live_command_pool_count(), 0);
}
