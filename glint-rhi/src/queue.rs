//! Vulkan Queue - queue handle with a single-submit command protocol.

use ash::{Device, vk};
use glint_core::log;

use crate::error::{RhiError, RhiResult};

/// Transient command pool/buffer pair backing one single-submit sequence.
struct ScratchCommands {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    /// False when the caller supplied the pool; it is then never destroyed here.
    owns_pool: bool,
}

/// One device queue plus helpers for the "record a short batch and block
/// until it finishes" pattern.
///
/// At most one single-submit sequence may be outstanding per handle. Clones
/// never inherit an in-flight sequence. Dropping a handle with a sequence
/// still open is a fatal usage error.
pub struct QueueHandle {
    device: Device,
    queue: vk::Queue,
    family: u32,
    index: Option<u32>,
    capabilities: vk::QueueFlags,
    protected: bool,
    present_capable: bool,

    scratch: Option<ScratchCommands>,
}

impl QueueHandle {
    pub fn new(
        device: Device,
        queue: vk::Queue,
        family: u32,
        index: Option<u32>,
        capabilities: vk::QueueFlags,
        protected: bool,
        present_capable: bool,
    ) -> Self {
        Self {
            device,
            queue,
            family,
            index,
            capabilities,
            protected,
            present_capable,
            scratch: None,
        }
    }

    pub fn handle(&self) -> vk::Queue {
        self.queue
    }

    pub fn family_index(&self) -> u32 {
        self.family
    }

    /// Logical index within the family, when known.
    pub fn queue_index(&self) -> Option<u32> {
        self.index
    }

    pub fn supports_graphics(&self) -> bool {
        self.capabilities.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_compute(&self) -> bool {
        self.capabilities.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn supports_transfer(&self) -> bool {
        self.capabilities.contains(vk::QueueFlags::TRANSFER)
    }

    pub fn supports_present(&self) -> bool {
        self.present_capable
    }

    /// Whether the queue was created as a protected-capable queue.
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Graphics, compute, and transfer all on one queue.
    pub fn supports_big_three(&self) -> bool {
        self.supports_graphics() && self.supports_compute() && self.supports_transfer()
    }

    /// Whether a single-submit sequence is currently open.
    pub fn single_submit_open(&self) -> bool {
        self.scratch.is_some()
    }

    /// Allocate and begin a one-time-submit command buffer.
    ///
    /// A sequence left open by a previous `begin` is flushed first after a
    /// queue-idle wait; that is recoverable misuse and only warned about.
    pub fn begin_single_submit(
        &mut self,
        custom_pool: Option<vk::CommandPool>,
    ) -> RhiResult<vk::CommandBuffer> {
        if self.scratch.is_some() {
            log::warn!(
                "queue family {}: beginning a single-submit sequence while one is open; flushing the stale one",
                self.family
            );
            unsafe { self.device.queue_wait_idle(self.queue)? };
            self.release_scratch();
        }

        let (pool, owns_pool) = match custom_pool {
            Some(pool) => (pool, false),
            None => {
                let pool_info = vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                    .queue_family_index(self.family);
                let pool = unsafe { self.device.create_command_pool(&pool_info, None)? };
                (pool, true)
            }
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffer = match unsafe { self.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(err) => {
                if owns_pool {
                    unsafe { self.device.destroy_command_pool(pool, None) };
                }
                return Err(err.into());
            }
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(err) = unsafe { self.device.begin_command_buffer(buffer, &begin_info) } {
            unsafe { self.device.free_command_buffers(pool, &[buffer]) };
            if owns_pool {
                unsafe { self.device.destroy_command_pool(pool, None) };
            }
            return Err(err.into());
        }

        self.scratch = Some(ScratchCommands {
            pool,
            buffer,
            owns_pool,
        });
        Ok(buffer)
    }

    /// End the sequence, submit with no synchronization objects, and block
    /// until the queue is idle. The transient pool is released afterwards.
    pub fn end_single_submit_and_flush(&mut self, buffer: vk::CommandBuffer) -> RhiResult<()> {
        self.check_outstanding(buffer)?;

        unsafe {
            self.device.end_command_buffer(buffer)?;

            let submit_info =
                vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&buffer));
            self.device
                .queue_submit(self.queue, &[submit_info], vk::Fence::null())?;
            self.device.queue_wait_idle(self.queue)?;
        }

        self.release_scratch();
        Ok(())
    }

    /// End the sequence and submit with caller-provided synchronization.
    ///
    /// The caller must invoke [`signal_single_submit_complete`] once the
    /// fence or semaphores indicate completion so the transient pool can be
    /// freed.
    ///
    /// [`signal_single_submit_complete`]: Self::signal_single_submit_complete
    pub fn end_single_submit(
        &mut self,
        buffer: vk::CommandBuffer,
        fence: vk::Fence,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
    ) -> RhiResult<()> {
        self.check_outstanding(buffer)?;
        if wait_semaphores.len() != wait_stages.len() {
            return Err(RhiError::Usage(
                "wait semaphore and wait stage counts differ".into(),
            ));
        }

        unsafe {
            self.device.end_command_buffer(buffer)?;

            let submit_info = vk::SubmitInfo::default()
                .command_buffers(std::slice::from_ref(&buffer))
                .wait_semaphores(wait_semaphores)
                .wait_dst_stage_mask(wait_stages)
                .signal_semaphores(signal_semaphores);
            self.device.queue_submit(self.queue, &[submit_info], fence)?;
        }

        Ok(())
    }

    /// Release the transient pool of a sequence ended with
    /// [`end_single_submit`](Self::end_single_submit). The caller asserts the
    /// submission has completed on the device.
    pub fn signal_single_submit_complete(&mut self) {
        self.release_scratch();
    }

    fn check_outstanding(&self, buffer: vk::CommandBuffer) -> RhiResult<()> {
        match &self.scratch {
            Some(scratch) if scratch.buffer == buffer => Ok(()),
            Some(_) => Err(RhiError::Usage(
                "command buffer does not match the open single-submit sequence".into(),
            )),
            None => Err(RhiError::Usage(
                "no single-submit sequence is open on this queue".into(),
            )),
        }
    }

    fn release_scratch(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            unsafe {
                self.device
                    .free_command_buffers(scratch.pool, &[scratch.buffer]);
                if scratch.owns_pool {
                    self.device.destroy_command_pool(scratch.pool, None);
                }
            }
        }
    }
}

impl Clone for QueueHandle {
    /// The clone starts with no outstanding single-submit sequence; two
    /// handles must never race to free the same transient pool.
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            queue: self.queue,
            family: self.family,
            index: self.index,
            capabilities: self.capabilities,
            protected: self.protected,
            present_capable: self.present_capable,
            scratch: None,
        }
    }
}

impl Drop for QueueHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.queue_wait_idle(self.queue);
        }
        if self.scratch.is_some() {
            panic!(
                "queue family {} destroyed with an open single-submit sequence",
                self.family
            );
        }
    }
}
