//! The saxpy compute kernel: `y[i] = a * x[i] + y[i]` over a
//! `width × height` grid.
//!
//! [`ComputeKernel`] owns every long-lived object needed to dispatch one
//! compute shader over two storage buffers. Per dispatch it rebuilds the
//! descriptor set and re-records its command buffer, then submits and blocks
//! on a fence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::buffer::DeviceBuffer;
use crate::command::{
    AllocateCommandBufferError, CommandBuffer, CommandPool,
    CreateCommandPoolError,
};
use crate::descriptor::{
    DescriptorBindingDesc, DescriptorPool, DescriptorSetLayout,
};
use crate::device::{CreateDeviceError, Device, DeviceConfig};
use crate::instance::{Instance, InstanceCreationError};
use crate::log::VulkanLogLevel;
use crate::pipeline::{
    ComputePipeline, CreateComputePipelineError, PipelineCache,
    PipelineLayout,
};
use crate::shader::{LoadShaderError, ShaderModule};
use crate::sync::{CreateFenceError, Fence, WaitFenceError};

/// Workgroup edge length in both X and Y, baked in through specialization
/// constants 0 and 1.
pub const WORKGROUP_SIZE: u32 = 16;

/// Storage-buffer descriptors in the kernel's single set.
pub const NUM_DESCRIPTORS: u32 = 2;

pub const ENTRY_POINT: &str = "main";

const OUTPUT_BINDING: u32 = 0;
const INPUT_BINDING: u32 = 1;

/// Push constants for one dispatch. Matches the shader block
/// `{ uint width; uint height; float a; }`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct KernelParams {
    pub width: u32,
    pub height: u32,
    pub scalar: f32,
}

impl KernelParams {
    pub fn new(width: u32, height: u32, scalar: f32) -> Self {
        Self {
            width,
            height,
            scalar,
        }
    }

    /// `width * height`, the number of `f32`s each buffer must hold.
    pub fn element_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Workgroups needed to cover a `width × height` grid.
pub fn workgroup_count(width: u32, height: u32) -> [u32; 3] {
    [
        width.div_ceil(WORKGROUP_SIZE),
        height.div_ceil(WORKGROUP_SIZE),
        1,
    ]
}

/// Everything needed to go from nothing to a ready kernel.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub app_name: String,
    /// Compiled SPIR-V for the kernel.
    pub shader_path: PathBuf,
    /// Validation-layer verbosity; `None` disables validation.
    pub validation: Option<VulkanLogLevel>,
    pub device: DeviceConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            app_name: "rcompute".to_owned(),
            shader_path: PathBuf::from("out/shaders/saxpy.spv"),
            validation: None,
            device: DeviceConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CreateKernelError {
    #[error("Failed to create Vulkan instance: {0}")]
    Instance(#[from] InstanceCreationError),

    #[error("Failed to create device: {0}")]
    Device(#[from] CreateDeviceError),

    #[error("Failed to load shader: {0}")]
    ShaderLoad(#[from] LoadShaderError),

    #[error("Invalid entry point name: {0}")]
    EntryPoint(std::ffi::NulError),

    #[error("Vulkan error creating descriptor set layout: {0}")]
    DescriptorSetLayout(vk::Result),

    #[error("Vulkan error creating descriptor pool: {0}")]
    DescriptorPool(vk::Result),

    #[error("Vulkan error creating pipeline layout: {0}")]
    PipelineLayout(vk::Result),

    #[error("Vulkan error creating pipeline cache: {0}")]
    PipelineCache(vk::Result),

    #[error(transparent)]
    Pipeline(#[from] CreateComputePipelineError),

    #[error(transparent)]
    CommandPool(#[from] CreateCommandPoolError),

    #[error(transparent)]
    CommandBuffer(#[from] AllocateCommandBufferError),
}

#[derive(Debug, Error)]
pub enum BindKernelError {
    #[error("Dispatch grid {width}x{height} is empty")]
    EmptyDispatch { width: u32, height: u32 },

    #[error(
        "Buffer at binding {binding} holds {len} elements but the grid needs \
         {required}"
    )]
    BufferTooSmall {
        binding: u32,
        len: usize,
        required: u64,
    },

    #[error("Buffer at binding {0} belongs to a different device")]
    ForeignBuffer(u32),

    #[error("A previous dispatch is still executing")]
    PreviousDispatchPending,

    #[error("Error waiting for previous dispatch: {0}")]
    PreviousDispatch(WaitFenceError),

    #[error("Vulkan error resetting descriptor pool: {0}")]
    ResetDescriptorPool(vk::Result),

    #[error("Vulkan error allocating descriptor set: {0}")]
    AllocateDescriptorSet(vk::Result),

    #[error("Vulkan error recording dispatch: {0}")]
    Record(vk::Result),
}

#[derive(Debug, Error)]
pub enum RunKernelError {
    #[error("Kernel has no recorded dispatch; call bind_parameters first")]
    NotBound,

    #[error(transparent)]
    CreateFence(#[from] CreateFenceError),

    #[error("Vulkan error submitting dispatch: {0}")]
    Submit(vk::Result),

    #[error("Timed out waiting for dispatch to complete")]
    Timeout,

    #[error("Error waiting for dispatch to complete: {0}")]
    Wait(WaitFenceError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Bind(#[from] BindKernelError),

    #[error(transparent)]
    Run(#[from] RunKernelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KernelState {
    Ready,
    Bound,
}

/// A compute pipeline plus the objects needed to dispatch it over an output
/// and an input `f32` buffer.
///
/// Fields are declared in teardown order.
pub struct ComputeKernel {
    /// Submission that timed out and may still be executing.
    in_flight: Option<Fence>,
    command_buffer: CommandBuffer,
    pipeline: ComputePipeline,
    pipeline_layout: PipelineLayout,
    _pipeline_cache: PipelineCache,
    _command_pool: CommandPool,
    descriptor_pool: DescriptorPool,
    set_layout: DescriptorSetLayout,
    _shader: ShaderModule,
    device: Arc<Device>,
    state: KernelState,
}

impl std::fmt::Debug for ComputeKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeKernel")
            .field("pipeline", &self.pipeline.raw_handle())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ComputeKernel {
    /// Build a kernel from SPIR-V bytes.
    pub fn new(
        device: &Arc<Device>,
        spirv: &[u8],
    ) -> Result<Self, CreateKernelError> {
        let shader = ShaderModule::new(device, spirv, Some("saxpy"))?;
        Self::with_shader(device, shader)
    }

    /// Build a kernel from a SPIR-V file.
    pub fn from_file(
        device: &Arc<Device>,
        path: &Path,
    ) -> Result<Self, CreateKernelError> {
        let shader = ShaderModule::from_file(device, path)?;
        Self::with_shader(device, shader)
    }

    /// Create the instance and device described by `config`, then build the
    /// kernel from `config.shader_path`.
    ///
    /// # Safety
    /// This loads the Vulkan library at runtime, which may execute arbitrary
    /// code from it.
    pub unsafe fn from_config(
        config: &KernelConfig,
    ) -> Result<Self, CreateKernelError> {
        // SAFETY: forwarded to the caller.
        let instance =
            Arc::new(unsafe { Instance::new(&config.app_name, config.validation) }?);
        let device = Arc::new(Device::new(&instance, &config.device)?);
        Self::from_file(&device, &config.shader_path)
    }

    fn with_shader(
        device: &Arc<Device>,
        shader: ShaderModule,
    ) -> Result<Self, CreateKernelError> {
        let set_layout = DescriptorSetLayout::new(
            device,
            &[
                DescriptorBindingDesc::compute_storage_buffer(OUTPUT_BINDING),
                DescriptorBindingDesc::compute_storage_buffer(INPUT_BINDING),
            ],
        )
        .map_err(CreateKernelError::DescriptorSetLayout)?;

        let descriptor_pool = DescriptorPool::new(
            device,
            1,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: NUM_DESCRIPTORS,
            }],
        )
        .map_err(CreateKernelError::DescriptorPool)?;

        let pipeline_layout = PipelineLayout::new_compute(
            device,
            &set_layout,
            std::mem::size_of::<KernelParams>() as u32,
        )
        .map_err(CreateKernelError::PipelineLayout)?;

        let pipeline_cache = PipelineCache::new(device)
            .map_err(CreateKernelError::PipelineCache)?;

        let entry = shader
            .compute_entry_point(ENTRY_POINT)
            .map_err(CreateKernelError::EntryPoint)?;
        let pipeline = ComputePipeline::new(
            device,
            &entry,
            &pipeline_layout,
            &pipeline_cache,
            &[WORKGROUP_SIZE, WORKGROUP_SIZE],
            Some("saxpy pipeline"),
        )?;

        let command_pool = CommandPool::new(
            device,
            device.compute_queue_family(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            Some("kernel command pool"),
        )?;
        let command_buffer = command_pool.allocate_command_buffer()?;

        tracing::debug!("Created compute kernel {:?}", pipeline.raw_handle());

        Ok(Self {
            in_flight: None,
            command_buffer,
            pipeline,
            pipeline_layout,
            _pipeline_cache: pipeline_cache,
            _command_pool: command_pool,
            descriptor_pool,
            set_layout,
            _shader: shader,
            device: Arc::clone(device),
            state: KernelState::Ready,
        })
    }

    /// Wait out a dispatch that previously timed out.
    fn retire_in_flight(&mut self) -> Result<(), BindKernelError> {
        if let Some(fence) = &self.in_flight {
            match fence.wait() {
                Ok(()) => {}
                Err(WaitFenceError::Timeout) => {
                    return Err(BindKernelError::PreviousDispatchPending);
                }
                Err(e) => return Err(BindKernelError::PreviousDispatch(e)),
            }
        }
        self.in_flight = None;
        Ok(())
    }

    fn check_buffer(
        &self,
        binding: u32,
        buffer: &DeviceBuffer<f32>,
        required: u64,
    ) -> Result<(), BindKernelError> {
        if !Arc::ptr_eq(buffer.parent(), &self.device) {
            return Err(BindKernelError::ForeignBuffer(binding));
        }
        if (buffer.len() as u64) < required {
            return Err(BindKernelError::BufferTooSmall {
                binding,
                len: buffer.len(),
                required,
            });
        }
        Ok(())
    }

    /// Point the kernel at `out` (binding 0) and `input` (binding 1) and
    /// record a dispatch over `params.width × params.height`.
    ///
    /// Re-binding replaces the previous recording. On failure the kernel is
    /// left unbound.
    pub fn bind_parameters(
        &mut self,
        out: &DeviceBuffer<f32>,
        input: &DeviceBuffer<f32>,
        params: KernelParams,
    ) -> Result<(), BindKernelError> {
        self.state = KernelState::Ready;
        self.retire_in_flight()?;

        if params.width == 0 || params.height == 0 {
            return Err(BindKernelError::EmptyDispatch {
                width: params.width,
                height: params.height,
            });
        }
        let elements = params.element_count();
        self.check_buffer(OUTPUT_BINDING, out, elements)?;
        self.check_buffer(INPUT_BINDING, input, elements)?;
        let range = elements * std::mem::size_of::<f32>() as u64;

        // SAFETY: no submission using the previous set is pending: run()
        // waits for completion and timed-out runs were retired above.
        unsafe { self.descriptor_pool.reset() }
            .map_err(BindKernelError::ResetDescriptorPool)?;
        let set = self
            .descriptor_pool
            .allocate_set(&self.set_layout)
            .map_err(BindKernelError::AllocateDescriptorSet)?;
        // SAFETY: both buffers are storage buffers on self.device and hold at
        // least `range` bytes. Keeping them alive until run() finishes is
        // run()'s contract.
        unsafe {
            set.write_storage_buffer(&self.device, OUTPUT_BINDING, out, range);
            set.write_storage_buffer(&self.device, INPUT_BINDING, input, range);
        }

        let groups = workgroup_count(params.width, params.height);
        let layout = self.pipeline_layout.raw_handle();
        let cmd = &mut self.command_buffer;
        // SAFETY: the command buffer is not pending (see above). Commands are
        // recorded in begin / bind / push / dispatch / end order against
        // objects owned by this kernel.
        unsafe {
            cmd.reset().map_err(BindKernelError::Record)?;
            cmd.begin_one_time().map_err(BindKernelError::Record)?;
            cmd.bind_compute_pipeline(self.pipeline.raw_handle());
            cmd.bind_compute_descriptor_sets(
                layout,
                0,
                &[set.raw_descriptor_set()],
            );
            cmd.push_compute_constants(layout, &params);
            cmd.dispatch(groups);
            cmd.end().map_err(BindKernelError::Record)?;
        }

        tracing::debug!(
            "Recorded dispatch {groups:?} for {}x{} (out {:?}, in {:?})",
            params.width,
            params.height,
            out.raw_buffer(),
            input.raw_buffer(),
        );
        self.state = KernelState::Bound;
        Ok(())
    }

    /// Submit the recorded dispatch and block until it finishes.
    ///
    /// The recording is consumed; call
    /// [`bind_parameters`](Self::bind_parameters) again before the next run.
    ///
    /// On [`RunKernelError::Timeout`] the device is told that the dispatch
    /// may still be running, so dropping the bound buffers afterwards waits
    /// for the device to go idle.
    ///
    /// # Safety
    /// The buffers passed to the last `bind_parameters` call must still be
    /// alive when this is called.
    pub unsafe fn run(&mut self) -> Result<(), RunKernelError> {
        if self.state != KernelState::Bound {
            return Err(RunKernelError::NotBound);
        }
        self.state = KernelState::Ready;

        let mut fence = Fence::new(&self.device, Some("dispatch fence"))?;
        // SAFETY: the command buffer is executable (state was Bound) and was
        // allocated on the compute queue family. Caller guarantees the bound
        // buffers are alive; past a timeout their drops wait for the device.
        unsafe { fence.submit(&[self.command_buffer.raw_command_buffer()]) }
            .map_err(RunKernelError::Submit)?;

        match fence.wait() {
            Ok(()) => Ok(()),
            Err(WaitFenceError::Timeout) => {
                tracing::warn!(
                    "Dispatch did not finish within the wait timeout; keeping \
                     fence {:?} until it does",
                    fence.raw_fence()
                );
                self.device.note_abandoned_submission();
                self.in_flight = Some(fence);
                Err(RunKernelError::Timeout)
            }
            Err(e) => Err(RunKernelError::Wait(e)),
        }
    }

    /// Bind `out` and `input`, run, and wait for the result.
    pub fn dispatch(
        &mut self,
        out: &mut DeviceBuffer<f32>,
        input: &DeviceBuffer<f32>,
        params: KernelParams,
    ) -> Result<(), DispatchError> {
        self.bind_parameters(out, input, params)?;
        // SAFETY: `out` and `input` are borrowed across run(). If it times
        // out, the device has been told and their drops wait for idle.
        unsafe { self.run() }?;
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.state == KernelState::Bound
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for ComputeKernel {
    fn drop(&mut self) {
        tracing::debug!("Dropping compute kernel {:?}", self.pipeline.raw_handle());
        let Some(fence) = self.in_flight.take() else {
            return;
        };
        if matches!(fence.is_signaled(), Ok(true)) {
            return;
        }
        tracing::warn!(
            "Compute kernel dropped with a dispatch in flight; waiting for \
             the device to go idle"
        );
        // The fence and the recording it guards are destroyed right after.
        if let Err(e) = self.device.settle_abandoned_work() {
            tracing::error!("Failed to wait for device idle: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_layout_matches_push_constant_block() {
        assert_eq!(std::mem::size_of::<KernelParams>(), 12);
        assert_eq!(std::mem::offset_of!(KernelParams, width), 0);
        assert_eq!(std::mem::offset_of!(KernelParams, height), 4);
        assert_eq!(std::mem::offset_of!(KernelParams, scalar), 8);

        let params = KernelParams::new(90, 60, 2.0);
        let bytes = bytemuck::bytes_of(&params);
        assert_eq!(&bytes[0..4], &90u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &60u32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &2.0f32.to_ne_bytes());
    }

    #[test]
    fn workgroup_count_rounds_up() {
        assert_eq!(workgroup_count(16, 16), [1, 1, 1]);
        assert_eq!(workgroup_count(17, 16), [2, 1, 1]);
        assert_eq!(workgroup_count(16, 17), [1, 2, 1]);
        assert_eq!(workgroup_count(90, 60), [6, 4, 1]);
        assert_eq!(workgroup_count(1, 1), [1, 1, 1]);
    }

    #[test]
    fn element_count_does_not_overflow() {
        let params = KernelParams::new(u32::MAX, u32::MAX, 1.0);
        assert_eq!(
            params.element_count(),
            u64::from(u32::MAX) * u64::from(u32::MAX)
        );
    }

    #[test]
    fn default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.shader_path, PathBuf::from("out/shaders/saxpy.spv"));
        assert_eq!(config.validation, None);
        assert_eq!(config.device.wait_timeout, None);
    }
}
