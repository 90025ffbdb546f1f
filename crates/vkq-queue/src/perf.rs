use serde::Serialize;

/// Snapshot of submission statistics for external telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerfCounters {
    /// Calls into the engine's submit paths
    pub submit_calls_total: u64,
    pub submit_calls_per_frame: u64,
    /// Wait semaphores attached to native submissions
    pub wait_semaphores_total: u64,
    /// Successful native queue-submit calls
    pub native_submit_calls_total: u64,
    pub native_submit_calls_per_frame: u64,
    /// Native queue-submit calls that failed
    pub native_submit_failures_total: u64,
    pub present_calls_total: u64,
    /// Batches waiting on their fence at snapshot time
    pub batches_in_flight: u64,
    /// Batches finished but not yet released at snapshot time
    pub batches_finished: u64,
}

impl PerfCounters {
    pub(crate) fn reset_per_frame(&mut self) {
        self.submit_calls_per_frame = 0;
        self.native_submit_calls_per_frame = 0;
    }
}
