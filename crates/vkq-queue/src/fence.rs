//! Fence recycling.
//!
//! Creating fences is comparatively expensive, so batches draw them from a
//! [`FencePool`] and hand them back once released. A [`RecyclableFence`]
//! returns itself to the pool on drop; batches hold it through an `Arc`
//! ([`SharedFence`]) so that a thread blocked on the fence keeps it alive
//! even after the batch that owned it has been released.

use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use tracing::debug;

use crate::driver::Driver;

struct FreeList {
    fences: Vec<vk::Fence>,
    destroyed: bool,
}

/// Thread-safe free list of fences.
pub struct FencePool {
    driver: Arc<dyn Driver>,
    free: Mutex<FreeList>,
}

impl FencePool {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            free: Mutex::new(FreeList {
                fences: Vec::new(),
                destroyed: false,
            }),
        }
    }

    /// Take a fence from the free list, or create one. The flag is true when
    /// the fence was recycled; it may still be signaled from its last use.
    pub fn acquire(&self) -> VkResult<(vk::Fence, bool)> {
        if let Some(fence) = self.free.lock().fences.pop() {
            return Ok((fence, true));
        }
        let fence = self.driver.create_fence()?;
        Ok((fence, false))
    }

    /// Return a fence for reuse. Its signaled state is left untouched.
    pub fn release(&self, fence: vk::Fence) {
        let mut free = self.free.lock();
        if free.destroyed {
            drop(free);
            self.driver.destroy_fence(fence);
            return;
        }
        free.fences.push(fence);
    }

    /// Destroy every pooled fence. Fences released afterwards are destroyed
    /// immediately instead of being pooled.
    pub fn destroy_all(&self) {
        let fences = {
            let mut free = self.free.lock();
            free.destroyed = true;
            std::mem::take(&mut free.fences)
        };
        debug!("destroying {} pooled fences", fences.len());
        for fence in fences {
            self.driver.destroy_fence(fence);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().fences.len()
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

/// A pooled fence, reset and ready for a submission.
pub struct RecyclableFence {
    fence: vk::Fence,
    pool: Arc<FencePool>,
}

impl RecyclableFence {
    pub fn new(pool: &Arc<FencePool>) -> VkResult<Self> {
        let (fence, recycled) = pool.acquire()?;
        if recycled {
            if let Err(e) = pool.driver().reset_fence(fence) {
                pool.release(fence);
                return Err(e);
            }
        }
        Ok(Self {
            fence,
            pool: pool.clone(),
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    pub fn status(&self) -> VkResult<bool> {
        self.pool.driver().fence_status(self.fence)
    }

    pub fn wait(&self, timeout_ns: u64) -> VkResult<()> {
        self.pool.driver().wait_for_fence(self.fence, timeout_ns)
    }
}

impl Drop for RecyclableFence {
    fn drop(&mut self) {
        self.pool.release(self.fence);
    }
}

pub type SharedFence = Arc<RecyclableFence>;

/// A fence owned by the caller of a submission, e.g. one exported to another
/// API. Destroyed once the last reference goes away.
pub struct ExternalFence {
    fence: vk::Fence,
    driver: Arc<dyn Driver>,
}

impl ExternalFence {
    pub fn new(driver: Arc<dyn Driver>) -> VkResult<Self> {
        let fence = driver.create_fence()?;
        Ok(Self { fence, driver })
    }

    /// Adopt an existing fence.
    pub fn from_raw(driver: Arc<dyn Driver>, fence: vk::Fence) -> Self {
        Self { fence, driver }
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    pub fn status(&self) -> VkResult<bool> {
        self.driver.fence_status(self.fence)
    }

    pub fn wait(&self, timeout_ns: u64) -> VkResult<()> {
        self.driver.wait_for_fence(self.fence, timeout_ns)
    }
}

impl Drop for ExternalFence {
    fn drop(&mut self) {
        self.driver.destroy_fence(self.fence);
    }
}

pub type SharedExternalFence = Arc<ExternalFence>;
