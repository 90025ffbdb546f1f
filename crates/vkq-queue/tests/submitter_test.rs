//! Integration test: Submitter
//!
//! The sync/async routing facade, end to end on the simulated driver.
//!
//! Run with: cargo test --test submitter_test -- --nocapture

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ash::vk::{self, Handle};
use vkq_core::{Priority, ProtectionType, ResourceUse, SerialIndex, VkqConfig};
use vkq_queue::batch::{SecondaryCommandPool, SecondaryCommands};
use vkq_queue::driver::{PresentDescriptor, SwapchainStatus};
use vkq_queue::simulated::SimulatedDriver;
use vkq_queue::task::SubmitPolicy;
use vkq_queue::{QueueError, Submitter};

const PROT: ProtectionType = ProtectionType::Unprotected;
const PRIO: Priority = Priority::Medium;
const WAIT_NS: u64 = 5_000_000_000;

#[derive(Default)]
struct RecyclingPool {
    recycled: Mutex<Vec<vk::CommandBuffer>>,
}

impl SecondaryCommandPool for RecyclingPool {
    fn recycle(&self, command_buffer: vk::CommandBuffer) {
        self.recycled.lock().unwrap().push(command_buffer);
    }
}

fn make_submitter(async_mode: bool, auto_signal: bool) -> (Arc<SimulatedDriver>, Submitter) {
    vkq_common::try_init_logging();
    let driver = Arc::new(SimulatedDriver::new());
    driver.set_auto_signal(auto_signal);

    let mut config = VkqConfig::default();
    config.processor.async_command_queue = async_mode;
    config.queue.max_fence_wait_time_ns = WAIT_NS;
    config.queue.serial_index_count = 4;

    let submitter = Submitter::new(driver.clone(), &config).expect("create submitter");
    (driver, submitter)
}

#[test]
fn test_sync_mode_submits_on_calling_thread() {
    let (driver, submitter) = make_submitter(false, false);
    let owner = Arc::new(RecyclingPool::default());
    assert!(!submitter.is_async());

    let serial = submitter.reserve_serial(SerialIndex::new(0));
    submitter
        .flush_outside_render_pass_commands(
            PROT,
            PRIO,
            SecondaryCommands::new(vk::CommandBuffer::from_raw(0xd1), owner.clone()),
        )
        .expect("flush");
    submitter
        .submit_commands(PROT, PRIO, None, None, serial)
        .expect("submit");
    // No worker: the native call already happened
    assert_eq!(driver.submission_count(), 1);
    assert!(submitter.is_busy());

    driver.signal_all();
    submitter
        .finish_queue_serial(serial, WAIT_NS)
        .expect("finish");
    assert!(submitter.has_resource_use_finished(&ResourceUse::from(serial)));
    assert_eq!(owner.recycled.lock().unwrap().len(), 1);
}

#[test]
fn test_async_finish_waits_for_submission_then_completion() {
    let (driver, submitter) = make_submitter(true, false);
    assert!(submitter.is_async());

    let mut use_ = ResourceUse::new();
    for index in 0..3 {
        let serial = submitter.reserve_serial(SerialIndex::new(index));
        submitter
            .submit_commands(PROT, PRIO, None, None, serial)
            .expect("enqueue submit");
        use_.set_queue_serial(serial);
    }

    let signaler = {
        let driver = driver.clone();
        std::thread::spawn(move || {
            while driver.submission_count() < 3 {
                std::thread::sleep(Duration::from_millis(1));
            }
            driver.signal_all();
        })
    };
    submitter
        .finish_resource_use(&use_, WAIT_NS)
        .expect("finish resource use");
    signaler.join().expect("signaler thread panicked");

    assert!(submitter.has_resource_use_submitted(&use_));
    assert!(submitter.has_resource_use_finished(&use_));
}

#[test]
fn test_one_off_and_present_in_async_mode() {
    let (driver, submitter) = make_submitter(true, true);
    let status = Arc::new(SwapchainStatus::new());

    let serial = submitter.reserve_serial(SerialIndex::new(1));
    submitter
        .submit_one_off(
            PROT,
            Priority::Low,
            vk::CommandBuffer::null(),
            None,
            SubmitPolicy::AllowDeferred,
            serial,
        )
        .expect("one-off submit");
    submitter
        .present(PRIO, PresentDescriptor::default(), status.clone())
        .expect("enqueue present");

    submitter
        .wait_for_present_to_be_submitted(&status)
        .expect("present submitted");
    assert_eq!(status.last_present_result(), vk::Result::SUCCESS);

    submitter.wait_idle(WAIT_NS).expect("wait idle");
    assert_eq!(driver.submission_count(), 1);
    assert_eq!(submitter.perf_counters().present_calls_total, 1);
}

#[test]
fn test_device_lost_result_tears_queue_down() {
    let (driver, submitter) = make_submitter(false, false);

    let first = submitter.reserve_serial(SerialIndex::new(0));
    submitter
        .submit_commands(PROT, PRIO, None, None, first)
        .expect("submit");

    driver.lose_device();
    let second = submitter.reserve_serial(SerialIndex::new(0));
    match submitter.submit_commands(PROT, PRIO, None, None, second) {
        Err(QueueError::DeviceLost) => {}
        other => panic!("expected DeviceLost, got {:?}", other),
    }

    // The failed submit escalated: everything in flight was force-completed
    assert!(submitter.has_resource_use_finished(&ResourceUse::from(first)));
    assert_eq!(submitter.queue().total_batch_count(), 0);
    assert!(!submitter.is_busy());
}

#[test]
fn test_async_deferred_device_lost_escalates() {
    let (driver, submitter) = make_submitter(true, false);

    let first = submitter.reserve_serial(SerialIndex::new(0));
    submitter
        .submit_commands(PROT, PRIO, None, None, first)
        .expect("enqueue submit");
    submitter
        .processor()
        .expect("async mode has a processor")
        .wait_for_all_work_to_be_submitted()
        .expect("submitted");

    driver.lose_device();
    let second = submitter.reserve_serial(SerialIndex::new(0));
    submitter
        .submit_commands(PROT, PRIO, None, None, second)
        .expect("enqueue submit");

    match submitter.wait_idle(WAIT_NS) {
        Err(e) if e.is_device_lost() => println!("wait_idle surfaced: {}", e),
        other => panic!("expected a device-lost error, got {:?}", other),
    }
    assert!(submitter.has_resource_use_finished(&ResourceUse::from(first)));
    assert!(submitter.has_resource_use_finished(&ResourceUse::from(second)));
}

#[test]
fn test_perf_counters_reset_per_frame() {
    let (_driver, submitter) = make_submitter(false, true);

    for _ in 0..3 {
        let serial = submitter.reserve_serial(SerialIndex::new(0));
        submitter
            .submit_commands(PROT, PRIO, None, None, serial)
            .expect("submit");
    }
    submitter
        .check_and_cleanup_completed()
        .expect("cleanup");

    let perf = submitter.perf_counters();
    assert_eq!(perf.native_submit_calls_total, 3);
    assert_eq!(perf.native_submit_calls_per_frame, 3);
    assert_eq!(perf.batches_in_flight, 0);

    submitter.reset_per_frame_perf_counters();
    assert_eq!(submitter.perf_counters().native_submit_calls_per_frame, 0);
}
