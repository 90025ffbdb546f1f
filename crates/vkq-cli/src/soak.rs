use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use ash::vk::{self, Handle};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use vkq_core::{Priority, ProtectionType, SerialIndex, VkqConfig};
use vkq_queue::{
    AshDriver, Driver, PerfCounters, SecondaryCommandPool, SecondaryCommands, SimulatedDriver,
    Submitter,
};

use crate::Backend;

/// Batches a producer may run ahead of its oldest unfinished batch.
const PRODUCER_LAG: u64 = 8;

pub struct SoakOptions {
    pub producers: u32,
    pub batches: u64,
    pub backend: Backend,
}

pub struct SoakReport {
    pub producers: u32,
    pub batches: u64,
    pub elapsed: Duration,
    pub recycled_secondaries: usize,
    pub perf: PerfCounters,
}

impl SoakReport {
    pub fn summary(&self) -> String {
        let total = self.producers as u64 * self.batches;
        let rate = total as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON);
        format!(
            "{} producers x {} batches in {:.2?} ({:.0} batches/s), {} secondaries recycled",
            self.producers, self.batches, self.elapsed, rate, self.recycled_secondaries
        )
    }
}

/// Stand-in for an application's secondary command buffer allocator.
#[derive(Default)]
struct CountingPool {
    recycled: AtomicUsize,
}

impl SecondaryCommandPool for CountingPool {
    fn recycle(&self, _command_buffer: vk::CommandBuffer) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }
}

/// Signals simulated fences in random order until stopped.
struct SimulatedGpu {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl SimulatedGpu {
    fn start(driver: Arc<SimulatedDriver>) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("vkq-simulated-gpu".into())
            .spawn(move || {
                let mut rng = rand::thread_rng();
                while !thread_stop.load(Ordering::Acquire) {
                    let mut pending = driver.unsignaled_submissions();
                    pending.shuffle(&mut rng);
                    let count = rng.gen_range(0..=pending.len());
                    for record in pending.into_iter().take(count) {
                        driver.signal_fence(record.fence);
                    }
                    std::thread::sleep(Duration::from_micros(rng.gen_range(50..500)));
                }
            })
            .context("failed to spawn simulated GPU thread")?;
        Ok(Self { stop, thread })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.thread.join().is_err() {
            warn!("simulated GPU thread panicked");
        }
    }
}

pub fn run(config: &VkqConfig, options: SoakOptions) -> anyhow::Result<SoakReport> {
    if options.producers as usize > config.queue.serial_index_count {
        anyhow::bail!(
            "{} producers need {} serial indices, only {} configured",
            options.producers,
            options.producers,
            config.queue.serial_index_count
        );
    }

    let (driver, gpu): (Arc<dyn Driver>, Option<SimulatedGpu>) = match options.backend {
        Backend::Simulated => {
            let simulated = Arc::new(SimulatedDriver::new());
            let gpu = SimulatedGpu::start(simulated.clone())?;
            let driver: Arc<dyn Driver> = simulated;
            (driver, Some(gpu))
        }
        Backend::Vulkan => {
            let driver: Arc<dyn Driver> = Arc::new(
                AshDriver::create_headless(config.device.protected_content)
                    .context("failed to create a headless Vulkan device")?,
            );
            (driver, None)
        }
    };
    // Fake secondary handles are only meaningful to the simulated driver.
    let record_secondaries = options.backend == Backend::Simulated;

    let submitter = Arc::new(Submitter::new(driver, config)?);
    let owner = Arc::new(CountingPool::default());
    let timeout_ns = config.queue.max_fence_wait_time_ns;

    info!(
        "soak: {} producers x {} batches ({} mode, {:?} backend)",
        options.producers,
        options.batches,
        if submitter.is_async() { "async" } else { "sync" },
        options.backend
    );

    let started = Instant::now();
    let mut producers = Vec::new();
    for producer in 0..options.producers {
        let submitter = submitter.clone();
        let owner = owner.clone();
        let batches = options.batches;
        let handle = std::thread::Builder::new()
            .name(format!("vkq-producer-{}", producer))
            .spawn(move || -> anyhow::Result<()> {
                let index = SerialIndex::new(producer);
                let priority = Priority::ALL[producer as usize % Priority::COUNT];
                let mut rng = rand::thread_rng();
                let mut serials = Vec::with_capacity(batches as usize);

                for batch in 0..batches {
                    let serial = submitter.reserve_serial(index);
                    if record_secondaries {
                        for _ in 0..rng.gen_range(1..=3) {
                            let secondary = SecondaryCommands::new(
                                vk::CommandBuffer::from_raw(rng.gen_range(0x1_0000..0x2_0000)),
                                owner.clone(),
                            );
                            submitter.flush_outside_render_pass_commands(
                                ProtectionType::Unprotected,
                                priority,
                                secondary,
                            )?;
                        }
                    }
                    submitter.submit_commands(
                        ProtectionType::Unprotected,
                        priority,
                        None,
                        None,
                        serial,
                    )?;
                    serials.push(serial);

                    if batch >= PRODUCER_LAG {
                        let oldest = serials[(batch - PRODUCER_LAG) as usize];
                        submitter.finish_queue_serial(oldest, timeout_ns)?;
                    }
                    if batch % 16 == 0 {
                        submitter.check_and_cleanup_completed()?;
                    }
                }
                debug!("producer {} done", producer);
                Ok(())
            })
            .context("failed to spawn producer thread")?;
        producers.push(handle);
    }

    let mut failures = Vec::new();
    for (producer, handle) in producers.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(format!("producer {}: {:#}", producer, e)),
            Err(_) => failures.push(format!("producer {} panicked", producer)),
        }
    }

    let idle = submitter.wait_idle(timeout_ns);
    let elapsed = started.elapsed();
    if let Some(gpu) = gpu {
        gpu.stop();
    }
    idle?;
    if !failures.is_empty() {
        anyhow::bail!("soak failed: {}", failures.join("; "));
    }

    let perf = submitter.perf_counters();
    submitter.destroy();

    Ok(SoakReport {
        producers: options.producers,
        batches: options.batches,
        elapsed,
        recycled_secondaries: owner.recycled.load(Ordering::Relaxed),
        perf,
    })
}
