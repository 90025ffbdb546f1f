//! [`Driver`] implementation on a real Vulkan device through `ash`.

use std::ffi::CStr;

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use vkq_core::{Priority, ProtectionType};

use crate::driver::{Driver, PresentDescriptor, RenderPassBegin, SubmitDescriptor};
use crate::error::{QueueError, QueueResult};

const QUEUE_PRIORITIES: [f32; Priority::COUNT] = [1.0, 0.5, 0.0];

/// Device queues of one family, indexed by [`Priority`]. Queue access must be
/// externally synchronized, so each distinct queue sits behind its own lock;
/// priorities that share a queue share the lock.
pub struct DeviceQueueMap {
    family_index: u32,
    queues: Vec<Mutex<vk::Queue>>,
    slots: [usize; Priority::COUNT],
    protected: Option<Mutex<vk::Queue>>,
}

impl DeviceQueueMap {
    /// `queues` is ordered from highest to lowest priority and must not be
    /// empty. Missing priorities collapse onto the lowest available queue.
    pub fn new(family_index: u32, queues: Vec<vk::Queue>, protected: Option<vk::Queue>) -> Self {
        let last = queues.len().saturating_sub(1);
        let mut slots = [0; Priority::COUNT];
        for priority in Priority::ALL {
            // High -> 0, Medium -> 1, Low -> 2
            let rank = Priority::COUNT - 1 - priority.index();
            slots[priority.index()] = rank.min(last);
        }

        Self {
            family_index,
            queues: queues.into_iter().map(Mutex::new).collect(),
            slots,
            protected: protected.map(Mutex::new),
        }
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn distinct_queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn supports_protected(&self) -> bool {
        self.protected.is_some()
    }

    fn queue_for(&self, priority: Priority, protection: ProtectionType) -> VkResult<&Mutex<vk::Queue>> {
        if protection.is_protected() {
            return self.protected.as_ref().ok_or(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        self.queues
            .get(self.slots[priority.index()])
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }
}

/// Instance and loader owned by a driver that bootstrapped its own device.
struct OwnedInstance {
    _entry: ash::Entry,
    instance: ash::Instance,
}

pub struct AshDriver {
    device: ash::Device,
    queues: DeviceQueueMap,
    swapchain: Option<ash::khr::swapchain::Device>,
    owned: Option<OwnedInstance>,
}

// SAFETY: queue access is serialized through DeviceQueueMap; every other
// handle is only used under the engine's own locking rules.
unsafe impl Send for AshDriver {}
unsafe impl Sync for AshDriver {}

impl AshDriver {
    /// Wrap a device created elsewhere. The device stays owned by the caller.
    ///
    /// # Safety
    /// `device` must be a valid device created from `instance`, the queues in
    /// `queues` must belong to it, and `swapchain_enabled` must only be set
    /// when `VK_KHR_swapchain` was enabled on it. The device must outlive the
    /// driver.
    pub unsafe fn from_raw_parts(
        instance: &ash::Instance,
        device: ash::Device,
        queues: DeviceQueueMap,
        swapchain_enabled: bool,
    ) -> Self {
        let swapchain =
            swapchain_enabled.then(|| ash::khr::swapchain::Device::new(instance, &device));
        Self {
            device,
            queues,
            swapchain,
            owned: None,
        }
    }

    /// Create an instance and a device without any surface, using the first
    /// graphics-capable queue family. Presentation is unavailable.
    pub fn create_headless(protected_content: bool) -> QueueResult<Self> {
        // SAFETY: loading the system Vulkan library has no preconditions
        // beyond the library itself being well-behaved.
        let entry = match unsafe { ash::Entry::load() } {
            Ok(entry) => entry,
            Err(e) => {
                error!("failed to load Vulkan entry: {}", e);
                return Err(QueueError::Native(vk::Result::ERROR_INITIALIZATION_FAILED));
            }
        };

        let app_name: &CStr = c"vkq";
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name)
            .api_version(vk::make_api_version(0, 1, 1, 0));
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);

        // SAFETY: create_info and everything it points to are alive for the call.
        let instance = unsafe { entry.create_instance(&create_info, None) }?;

        // SAFETY: instance is valid; on error it is destroyed before returning.
        match unsafe { Self::create_device(&instance, protected_content) } {
            Ok((device, queues)) => {
                info!(
                    "created headless Vulkan device (family {}, {} queues, protected: {})",
                    queues.family_index(),
                    queues.distinct_queue_count(),
                    queues.supports_protected()
                );
                Ok(Self {
                    device,
                    queues,
                    swapchain: None,
                    owned: Some(OwnedInstance {
                        _entry: entry,
                        instance,
                    }),
                })
            }
            Err(e) => {
                // SAFETY: nothing created from the instance survives.
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    unsafe fn create_device(
        instance: &ash::Instance,
        protected_content: bool,
    ) -> QueueResult<(ash::Device, DeviceQueueMap)> {
        // SAFETY: the caller passes a valid instance.
        let physical_devices = unsafe { instance.enumerate_physical_devices() }?;

        let mut chosen = None;
        for pd in physical_devices {
            // SAFETY: pd was enumerated from instance.
            let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
            if let Some((family_index, family)) = families
                .iter()
                .enumerate()
                .find(|(_, family)| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            {
                chosen = Some((pd, family_index as u32, *family));
                break;
            }
        }
        let Some((pd, family_index, family)) = chosen else {
            error!("no physical device exposes a graphics queue");
            return Err(QueueError::Native(vk::Result::ERROR_INITIALIZATION_FAILED));
        };

        let protected = protected_content && {
            let mut protected_features = vk::PhysicalDeviceProtectedMemoryFeatures::default();
            let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut protected_features);
            // SAFETY: pd is valid and the chain is well formed.
            unsafe { instance.get_physical_device_features2(pd, &mut features) };
            protected_features.protected_memory == vk::TRUE
                && family.queue_flags.contains(vk::QueueFlags::PROTECTED)
        };
        if protected_content && !protected {
            warn!("protected content requested but unsupported by the device");
            return Err(QueueError::ProtectedContentUnavailable);
        }

        let queue_count = (family.queue_count as usize).clamp(1, Priority::COUNT);
        let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(family_index)
            .queue_priorities(&QUEUE_PRIORITIES[..queue_count])];
        if protected {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .flags(vk::DeviceQueueCreateFlags::PROTECTED)
                    .queue_family_index(family_index)
                    .queue_priorities(&QUEUE_PRIORITIES[..1]),
            );
        }

        let mut protected_features =
            vk::PhysicalDeviceProtectedMemoryFeatures::default().protected_memory(true);
        let mut device_create_info =
            vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);
        if protected {
            device_create_info = device_create_info.push_next(&mut protected_features);
        }

        // SAFETY: pd belongs to instance; create info is alive for the call.
        let device = unsafe { instance.create_device(pd, &device_create_info, None) }?;

        let queues = (0..queue_count as u32)
            // SAFETY: every index below queue_count was requested above.
            .map(|index| unsafe { device.get_device_queue(family_index, index) })
            .collect();
        let protected_queue = protected.then(|| {
            let info = vk::DeviceQueueInfo2::default()
                .flags(vk::DeviceQueueCreateFlags::PROTECTED)
                .queue_family_index(family_index)
                .queue_index(0);
            // SAFETY: a protected queue was requested on this family.
            unsafe { device.get_device_queue2(&info) }
        });

        Ok((device, DeviceQueueMap::new(family_index, queues, protected_queue)))
    }

    pub fn queues(&self) -> &DeviceQueueMap {
        &self.queues
    }
}

impl Drop for AshDriver {
    fn drop(&mut self) {
        let Some(owned) = self.owned.take() else {
            return;
        };
        // SAFETY: this driver created the device and instance; the engine has
        // been torn down before the driver is dropped.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("device_wait_idle failed during teardown: {}", e);
            }
            self.device.destroy_device(None);
            owned.instance.destroy_instance(None);
        }
        debug!("destroyed headless Vulkan device");
    }
}

impl Driver for AshDriver {
    fn create_fence(&self) -> VkResult<vk::Fence> {
        // SAFETY: the device is valid for the lifetime of the driver.
        unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: fences are destroyed once, after their last submission finished.
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        // SAFETY: recycled fences are not in use by any pending submission.
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        // SAFETY: fence is a live fence of this device.
        unsafe { self.device.get_fence_status(fence) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        // SAFETY: fence is kept alive by the waiter.
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn create_command_pool(&self, protection: ProtectionType) -> VkResult<vk::CommandPool> {
        let mut flags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        if protection.is_protected() {
            flags |= vk::CommandPoolCreateFlags::PROTECTED;
        }
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(flags)
            .queue_family_index(self.queues.family_index());
        // SAFETY: create info is alive for the call.
        unsafe { self.device.create_command_pool(&create_info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: no buffer of the pool is pending when it is destroyed.
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: pool access is serialized by the caller.
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }?;
        buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        // SAFETY: the buffer is not pending and pool access is serialized.
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: the buffer is in the initial state.
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        // SAFETY: the buffer is recording.
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        // SAFETY: the buffer is not pending; its pool allows individual resets.
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        // SAFETY: primary is recording and the secondaries are executable.
        unsafe { self.device.cmd_execute_commands(primary, secondaries) }
    }

    fn cmd_begin_render_pass(&self, primary: vk::CommandBuffer, begin: &RenderPassBegin) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.render_area);
        // SAFETY: primary is recording outside any render pass.
        unsafe {
            self.device.cmd_begin_render_pass(
                primary,
                &begin_info,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            )
        }
    }

    fn cmd_end_render_pass(&self, primary: vk::CommandBuffer) {
        // SAFETY: primary is recording inside a render pass.
        unsafe { self.device.cmd_end_render_pass(primary) }
    }

    fn queue_submit(
        &self,
        priority: Priority,
        submit: &SubmitDescriptor,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let queue = self.queues.queue_for(priority, submit.protection)?;

        let mut submit_info = vk::SubmitInfo::default().command_buffers(&submit.command_buffers);
        if !submit.wait_semaphores.is_empty() {
            submit_info = submit_info
                .wait_semaphores(&submit.wait_semaphores)
                .wait_dst_stage_mask(&submit.wait_stage_masks);
        }
        if !submit.signal_semaphores.is_empty() {
            submit_info = submit_info.signal_semaphores(&submit.signal_semaphores);
        }
        let mut protected_info = vk::ProtectedSubmitInfo::default().protected_submit(true);
        if submit.protection.is_protected() {
            submit_info = submit_info.push_next(&mut protected_info);
        }

        let queue = queue.lock();
        // SAFETY: the queue lock serializes access to the queue; all arrays
        // referenced by submit_info outlive the call.
        unsafe { self.device.queue_submit(*queue, &[submit_info], fence) }
    }

    fn queue_present(&self, priority: Priority, present: &PresentDescriptor) -> VkResult<bool> {
        let Some(swapchain) = &self.swapchain else {
            return Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT);
        };
        let queue = self.queues.queue_for(priority, ProtectionType::Unprotected)?;

        let swapchains = [present.swapchain];
        let image_indices = [present.image_index];
        let wait_semaphores: Vec<vk::Semaphore> = present.wait_semaphore.into_iter().collect();
        let mut present_info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(&image_indices)
            .wait_semaphores(&wait_semaphores);

        let region = vk::PresentRegionKHR::default().rectangles(&present.regions);
        let mut regions =
            vk::PresentRegionsKHR::default().regions(std::slice::from_ref(&region));
        if !present.regions.is_empty() {
            present_info = present_info.push_next(&mut regions);
        }

        let present_fences: Vec<vk::Fence> = present.present_fence.into_iter().collect();
        let mut fence_info = vk::SwapchainPresentFenceInfoEXT::default().fences(&present_fences);
        if !present_fences.is_empty() {
            present_info = present_info.push_next(&mut fence_info);
        }

        let present_modes: Vec<vk::PresentModeKHR> = present.present_mode.into_iter().collect();
        let mut mode_info = vk::SwapchainPresentModeInfoEXT::default().present_modes(&present_modes);
        if !present_modes.is_empty() {
            present_info = present_info.push_next(&mut mode_info);
        }

        let queue = queue.lock();
        // SAFETY: the queue lock serializes access to the queue; the chained
        // structs outlive the call.
        unsafe { swapchain.queue_present(*queue, &present_info) }
    }
}
