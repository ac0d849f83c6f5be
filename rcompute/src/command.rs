//! Command pools and primary command buffers.
//!
//! [`CommandPool`] owns a `VkCommandPool`; every [`CommandBuffer`] allocated
//! from it keeps the pool alive through a shared inner `Arc`, so a buffer can
//! never outlive the pool it came from.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferHandle;
use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
}

/// The raw pool handle, co-owned by [`CommandPool`] and its buffers.
struct CommandPoolShared {
    parent: Arc<Device>,
    pool: vk::CommandPool,
}

impl Drop for CommandPoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: pool was created from parent. This runs only once the pool
        // wrapper and every buffer allocated from it are gone.
        unsafe { self.parent.destroy_raw_command_pool(self.pool) };
    }
}

/// An owned command pool on a single queue family.
///
/// The pool is `!Sync` because `vkAllocateCommandBuffers` needs external
/// synchronization on the pool.
pub struct CommandPool {
    shared: Arc<CommandPoolShared>,
    flags: vk::CommandPoolCreateFlags,
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.shared.pool)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    /// Create a command pool for `queue_family`.
    ///
    /// Pass `RESET_COMMAND_BUFFER` for pools whose buffers get re-recorded,
    /// `TRANSIENT` for one-shot work.
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        // SAFETY: create_info uses a queue family index supplied by the
        // caller for this device.
        let pool = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;

        // SAFETY: pool is a valid command pool created from device.
        let name_result = unsafe { device.set_object_name_str(pool, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name command pool {:?}: {e}", pool);
        }

        Ok(Self {
            shared: Arc::new(CommandPoolShared {
                parent: Arc::clone(device),
                pool,
            }),
            flags,
            _not_sync: std::marker::PhantomData,
        })
    }

    /// Allocate one primary command buffer in the initial state.
    pub fn allocate_command_buffer(
        &self,
    ) -> Result<CommandBuffer, AllocateCommandBufferError> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.shared.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        // SAFETY: allocate_info references a valid pool created from parent.
        // CommandPool is !Sync so no concurrent pool access is possible.
        let handle = unsafe {
            self.shared
                .parent
                .allocate_raw_command_buffers(&allocate_info)
        }
        .map(|mut bufs| {
            debug_assert_eq!(bufs.len(), 1);
            bufs.remove(0)
        })
        .map_err(AllocateCommandBufferError::Vulkan)?;

        Ok(CommandBuffer {
            pool: Arc::clone(&self.shared),
            parent: Arc::clone(&self.shared.parent),
            handle,
            resettable: self
                .flags
                .contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
        })
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        self.shared.pool
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.shared.parent
    }
}

/// A primary command buffer.
///
/// Recording operations are `unsafe`: the caller sequences Vulkan state.
/// Dropping the buffer frees it back to its pool, so it must not be
/// dropped while pending execution.
pub struct CommandBuffer {
    pool: Arc<CommandPoolShared>,
    parent: Arc<Device>,
    handle: vk::CommandBuffer,
    resettable: bool,
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        // SAFETY: handle was allocated from pool, which is still alive via
        // the Arc we hold. Callers do not drop buffers that are pending.
        unsafe {
            self.parent
                .free_raw_command_buffers(self.pool.pool, &[self.handle])
        };
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    /// Return this buffer to the initial state.
    ///
    /// # Safety
    /// The buffer must not be pending execution on the GPU.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        debug_assert!(
            self.resettable,
            "command buffer pool lacks RESET_COMMAND_BUFFER"
        );
        // SAFETY: Caller guarantees the buffer is not pending; the pool
        // flag is checked above in debug builds.
        unsafe { self.parent.reset_raw_command_buffer(self.handle) }
    }

    /// Begin recording with `ONE_TIME_SUBMIT`.
    ///
    /// # Safety
    /// The buffer must be in the initial state (freshly allocated or reset).
    pub unsafe fn begin_one_time(&mut self) -> Result<(), vk::Result> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: Caller guarantees the buffer is in the initial state.
        unsafe {
            self.parent
                .begin_raw_command_buffer(self.handle, &begin_info)
        }
    }

    /// End recording.
    ///
    /// # Safety
    /// The buffer must be in the recording state.
    pub unsafe fn end(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is in the recording state.
        unsafe { self.parent.end_raw_command_buffer(self.handle) }
    }

    /// Record a copy of `size` bytes from offset 0 of `src` to offset 0 of
    /// `dst`.
    ///
    /// # Safety
    /// The buffer must be in the recording state. Both buffers must be
    /// created from the same device, carry TRANSFER_SRC / TRANSFER_DST usage
    /// respectively, and be at least `size` bytes long.
    pub unsafe fn copy_buffer<S, D>(&mut self, src: &S, dst: &D, size: u64)
    where
        S: BufferHandle + ?Sized,
        D: BufferHandle + ?Sized,
    {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        // SAFETY: Caller guarantees recording state and buffer validity.
        unsafe {
            self.parent.cmd_copy_buffer(
                self.handle,
                src.raw_buffer(),
                dst.raw_buffer(),
                std::slice::from_ref(&region),
            )
        }
    }

    /// Bind a compute pipeline.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `pipeline` must be a valid
    /// compute pipeline created from the same device.
    pub unsafe fn bind_compute_pipeline(&mut self, pipeline: vk::Pipeline) {
        // SAFETY: Caller guarantees recording state and pipeline validity.
        unsafe {
            self.parent
                .cmd_bind_compute_pipeline(self.handle, pipeline)
        }
    }

    /// # Safety
    /// The buffer must be in the recording state. `layout` must be
    /// compatible with the bound pipeline and every set must be valid.
    pub unsafe fn bind_compute_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: Caller guarantees recording state and handle validity.
        unsafe {
            self.parent.cmd_bind_compute_descriptor_sets(
                self.handle,
                layout,
                first_set,
                descriptor_sets,
            )
        }
    }

    /// Push `constants` at offset 0 of the compute push-constant range.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `layout` must declare a
    /// COMPUTE push-constant range of at least `size_of::<P>()` bytes.
    pub unsafe fn push_compute_constants<P: bytemuck::Pod>(
        &mut self,
        layout: vk::PipelineLayout,
        constants: &P,
    ) {
        // SAFETY: Caller guarantees recording state and range validity.
        unsafe {
            self.parent.cmd_push_constants(
                self.handle,
                layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(constants),
            )
        }
    }

    /// # Safety
    /// The buffer must be in the recording state with a compute pipeline and
    /// its descriptor sets bound.
    pub unsafe fn dispatch(&mut self, groups: [u32; 3]) {
        let [x, y, z] = groups;
        // SAFETY: Caller guarantees recording and binding state.
        unsafe { self.parent.cmd_dispatch(self.handle, x, y, z) }
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }
}
