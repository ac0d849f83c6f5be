//! Logical device wrapper ([`Device`]).
//!
//! `Device` wraps a `VkDevice` created with a single compute queue and
//! centralises all per-device state: the physical device's properties,
//! its memory-type table, the compute queue and its family index, the
//! debug-utils loader used for object naming, and the wait timeout applied
//! to every blocking fence wait issued through this crate.
//!
//! A wait that gives up at that timeout leaves its submission running. The
//! device remembers this ([`Device::note_abandoned_submission`]), and every
//! buffer, and the device itself, waits for the GPU to go idle before it is
//! destroyed while such a submission may still be executing.
//!
//! Physical device choice is delegated to a [`DeviceSelection`] policy that
//! operates on plain [`PhysicalDeviceInfo`] values, so it can be tested
//! against a fake enumeration.
//!
//! All raw Vulkan operations on the device handle are surfaced as
//! `unsafe fn` methods prefixed with `raw_` or `cmd_` (e.g.
//! `create_raw_buffer`). Higher-level wrappers in sibling modules call
//! these rather than accessing `ash::Device` directly.

use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ash::vk;
use thiserror::Error;

use crate::instance::{FetchPhysicalDeviceError, Instance};
use crate::memory::MemoryTypeTable;

/// What the selection policy gets to see about each physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDeviceInfo {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
}

impl PhysicalDeviceInfo {
    fn from_properties(props: &vk::PhysicalDeviceProperties) -> Self {
        Self {
            name: props
                .device_name_as_c_str()
                .unwrap_or(c"unknown")
                .to_string_lossy()
                .into_owned(),
            device_type: props.device_type,
        }
    }
}

/// Policy used by [`Device::new`] to pick a physical device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelection {
    /// The first enumerated device.
    #[default]
    First,
    /// The first discrete GPU, falling back to the first device.
    PreferDiscrete,
    /// The first device whose name contains this text (ASCII
    /// case-insensitive).
    ByName(String),
}

impl DeviceSelection {
    /// Index into `candidates` of the chosen device, or `None` when the
    /// policy matches nothing.
    pub fn pick(&self, candidates: &[PhysicalDeviceInfo]) -> Option<usize> {
        match self {
            DeviceSelection::First => (!candidates.is_empty()).then_some(0),
            DeviceSelection::PreferDiscrete => candidates
                .iter()
                .position(|c| {
                    c.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
                })
                .or_else(|| (!candidates.is_empty()).then_some(0)),
            DeviceSelection::ByName(needle) => {
                let needle = needle.to_ascii_lowercase();
                candidates
                    .iter()
                    .position(|c| c.name.to_ascii_lowercase().contains(&needle))
            }
        }
    }
}

/// Index of the queue family to run compute work on.
///
/// Prefers a family that supports compute but not graphics, falls back to
/// any compute-capable family, and returns `None` if there is none.
/// Families that expose zero queues are ignored.
pub fn find_compute_queue_family(
    families: &[vk::QueueFamilyProperties],
) -> Option<u32> {
    let usable = |qf: &vk::QueueFamilyProperties| {
        qf.queue_count > 0 && qf.queue_flags.contains(vk::QueueFlags::COMPUTE)
    };
    families
        .iter()
        .position(|qf| {
            usable(qf) && !qf.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .or_else(|| families.iter().position(usable))
        .map(|idx| idx as u32)
}

#[derive(Debug, Default, Clone)]
pub struct DeviceConfig {
    pub selection: DeviceSelection,
    /// Upper bound for every fence wait issued through this device.
    /// `None` waits forever.
    pub wait_timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error("Host memory exhaustion while enumerating physical devices")]
    MemoryExhaustion,

    #[error("Unknown Vulkan error while enumerating physical devices: {0}")]
    UnknownVulkan(vk::Result),

    #[error("No physical device matches the selection policy {0:?}")]
    NoSuitableDevice(DeviceSelection),

    #[error("Physical device {0:?} has no queue family supporting compute")]
    NoComputeQueue(String),

    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),
}

impl From<FetchPhysicalDeviceError> for CreateDeviceError {
    fn from(value: FetchPhysicalDeviceError) -> Self {
        match value {
            FetchPhysicalDeviceError::MemoryExhaustion => {
                Self::MemoryExhaustion
            }
            FetchPhysicalDeviceError::UnknownVulkan(e) => {
                Self::UnknownVulkan(e)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),

    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

/// A logical Vulkan device with one compute queue.
///
/// Constructed via [`Device::new`]. Raw Vulkan operations are exposed as
/// `unsafe fn` methods prefixed with `raw_` / `cmd_`.
pub struct Device {
    handle: ash::Device,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    properties: vk::PhysicalDeviceProperties,
    memory_types: MemoryTypeTable,
    compute_queue: (Mutex<vk::Queue>, u32),
    wait_timeout_ns: u64,
    /// Bumped whenever a wait gives up on a running submission.
    abandoned_gen: AtomicU64,
    /// Highest `abandoned_gen` known to have finished.
    settled_gen: AtomicU64,
    parent: Arc<Instance>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("compute_queue_family", &self.compute_queue.1)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        if let Err(e) = self.settle_abandoned_work() {
            tracing::error!(
                "Failed to wait for abandoned submissions before destroying \
                 the device: {e}"
            );
        }
        //SAFETY: Every object derived from this device holds an Arc<Device>,
        //so all of them have been dropped before we get here.
        unsafe { self.handle.destroy_device(None) };
    }
}

impl Device {
    /// Create a logical device on the physical device chosen by
    /// `config.selection`, with one queue from its compute queue family.
    pub fn new(
        instance: &Arc<Instance>,
        config: &DeviceConfig,
    ) -> Result<Self, CreateDeviceError> {
        let physical_devices = instance.fetch_raw_physical_devices()?;
        let all_props: Vec<vk::PhysicalDeviceProperties> = physical_devices
            .iter()
            .map(|&dev| {
                // SAFETY: every handle was enumerated from this instance.
                unsafe { instance.get_raw_physical_device_properties(dev) }
            })
            .collect();
        let candidates: Vec<PhysicalDeviceInfo> = all_props
            .iter()
            .map(PhysicalDeviceInfo::from_properties)
            .collect();

        for (idx, c) in candidates.iter().enumerate() {
            tracing::debug!(
                "Physical device {idx}: {:?} ({:?})",
                c.name,
                c.device_type
            );
        }

        let chosen = config.selection.pick(&candidates).ok_or_else(|| {
            CreateDeviceError::NoSuitableDevice(config.selection.clone())
        })?;
        let physical_device = physical_devices[chosen];
        let properties = all_props[chosen];
        let info = &candidates[chosen];

        // SAFETY: physical_device was enumerated from this instance.
        let queue_families = unsafe {
            instance.get_raw_physical_device_queue_family_properties(
                physical_device,
            )
        };
        let compute_family = find_compute_queue_family(&queue_families)
            .ok_or_else(|| CreateDeviceError::NoComputeQueue(info.name.clone()))?;

        // SAFETY: physical_device was enumerated from this instance.
        let memory_properties = unsafe {
            instance.get_raw_physical_device_memory_properties(physical_device)
        };

        tracing::info!(
            "Selected physical device: {:?} (type: {:?}), compute queue \
             family: {compute_family}",
            info.name,
            info.device_type,
        );

        let priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(compute_family)
            .queue_priorities(&priorities);
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        // SAFETY: physical_device was derived from instance;
        // device_create_info is fully initialised above.
        let device = unsafe {
            instance.create_ash_device(physical_device, &device_create_info)
        }
        .map_err(CreateDeviceError::DeviceCreationFailed)?;

        // SAFETY: device was just created with one queue in this family.
        let queue = unsafe { device.get_device_queue(compute_family, 0) };

        let wait_timeout_ns = config
            .wait_timeout
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(u64::MAX);

        Ok(Self {
            debug_utils_device: instance
                .create_debug_utils_device_loader(&device),
            handle: device,
            properties,
            memory_types: MemoryTypeTable::from_properties(&memory_properties),
            compute_queue: (Mutex::new(queue), compute_family),
            wait_timeout_ns,
            abandoned_gen: AtomicU64::new(0),
            settled_gen: AtomicU64::new(0),
            parent: Arc::clone(instance),
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn device_type(&self) -> vk::PhysicalDeviceType {
        self.properties.device_type
    }

    pub fn name(&self) -> String {
        PhysicalDeviceInfo::from_properties(&self.properties).name
    }

    pub fn memory_types(&self) -> &MemoryTypeTable {
        &self.memory_types
    }

    pub fn compute_queue_family(&self) -> u32 {
        self.compute_queue.1
    }

    /// Timeout in nanoseconds applied to blocking fence waits;
    /// `u64::MAX` means unbounded.
    pub fn wait_timeout_ns(&self) -> u64 {
        self.wait_timeout_ns
    }

    /// Wait until all submitted work on this device has completed.
    ///
    /// This may block the calling thread indefinitely and is meant for
    /// teardown paths rather than per-dispatch use.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // vkDeviceWaitIdle needs every queue of the device externally
        // synchronized.
        let _queue = self
            .compute_queue
            .0
            .lock()
            .expect("compute queue lock poisoned");
        // SAFETY: `self.handle` is a valid logical device for the lifetime of
        // `self`, and the only queue is locked above.
        unsafe { self.handle.device_wait_idle() }
    }

    /// Record that a wait gave up on a submission the GPU may still be
    /// executing.
    pub fn note_abandoned_submission(&self) {
        self.abandoned_gen.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether a timed-out submission may still be executing.
    pub fn has_abandoned_work(&self) -> bool {
        self.abandoned_gen.load(Ordering::Acquire)
            != self.settled_gen.load(Ordering::Acquire)
    }

    /// If a timed-out submission may still be executing, block until the
    /// device is idle. Objects that such a submission could reference call
    /// this before destroying their handles.
    pub fn settle_abandoned_work(&self) -> Result<(), vk::Result> {
        // Submissions abandoned after this load are not covered by the wait
        // below and stay unsettled.
        let abandoned = self.abandoned_gen.load(Ordering::Acquire);
        if abandoned == self.settled_gen.load(Ordering::Acquire) {
            return Ok(());
        }
        tracing::warn!(
            "Waiting for the device to go idle before releasing objects a \
             timed-out submission may use"
        );
        self.wait_idle()?;
        self.settled_gen.fetch_max(abandoned, Ordering::AcqRel);
        Ok(())
    }

    /// Submit work to the compute queue.
    ///
    /// # Safety
    /// All handles in `submits` must be valid and derived from this device.
    /// Command buffers must be in the executable state and must have been
    /// allocated from a pool on the compute queue family. `fence`, when not
    /// null, must be an unsignaled fence created from this device.
    pub unsafe fn compute_queue_submit(
        &self,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let queue = self
            .compute_queue
            .0
            .lock()
            .expect("compute queue lock poisoned");
        // SAFETY: Caller guarantees all handle validity and
        // synchronization state; the lock gives external synchronization
        // on the queue.
        unsafe { self.handle.queue_submit(*queue, submits, fence) }
    }
}

// Debug naming functionality
impl Device {
    /// Set a Vulkan debug name for an object owned by this device.
    ///
    /// Passing `None` as the name, or calling this when validation is off,
    /// is a no-op.
    ///
    /// # Safety
    /// `object` must be a valid Vulkan handle created from this device (or a
    /// child object associated with this device) and must remain valid for the
    /// duration of the call.
    pub unsafe fn set_object_name<H>(
        &self,
        object: H,
        name: Option<&CStr>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        let Some(debug_utils) = self.debug_utils_device.as_ref() else {
            return Ok(());
        };

        let Some(name) = name else {
            return Ok(());
        };

        let object_name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name);

        // SAFETY: Caller guarantees object provenance and validity.
        unsafe { debug_utils.set_debug_utils_object_name(&object_name_info) }
            .map_err(NameObjectError::Vulkan)
    }

    /// Convenience helper to set a name from UTF-8 text.
    ///
    /// # Safety
    /// Same contract as [`set_object_name`](Self::set_object_name).
    pub unsafe fn set_object_name_str<H>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        if self.debug_utils_device.is_none() {
            return Ok(());
        }
        let name = name
            .map(CString::new)
            .transpose()
            .map_err(NameObjectError::InvalidName)?;

        // SAFETY: This method shares the same safety contract as
        // set_object_name.
        unsafe { self.set_object_name(object, name.as_deref()) }
    }
}

// Buffer and memory functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid and reference only objects derived from
    /// this device.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must be a valid handle created from this device and not yet
    /// destroyed. No in-flight GPU work may still reference `buffer`.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: Caller guarantees buffer provenance and drop ordering.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// Query memory requirements for a buffer.
    ///
    /// # Safety
    /// `buffer` must be a valid handle created from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees buffer validity.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `allocate_info` must be valid and describe a memory type index
    /// supported by this device.
    pub unsafe fn allocate_raw_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        // SAFETY: Caller guarantees allocation info validity.
        unsafe { self.handle.allocate_memory(allocate_info, None) }
    }

    /// # Safety
    /// `memory` must be a valid handle created from this device and not yet
    /// freed. Any buffer bound to it must already be destroyed.
    pub unsafe fn free_raw_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Caller guarantees memory provenance and drop ordering.
        unsafe { self.handle.free_memory(memory, None) };
    }

    /// # Safety
    /// `buffer` and `memory` must both be valid handles created from this
    /// device. `offset` must satisfy alignment/size requirements from
    /// `vkGetBufferMemoryRequirements`.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle validity and offset constraints.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// `memory` must be a host-visible allocation from this device that is
    /// not currently mapped. The mapped range (`offset`, `size`) must be
    /// within the allocation.
    pub unsafe fn map_raw_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<*mut std::ffi::c_void, vk::Result> {
        // SAFETY: Caller guarantees mapping preconditions.
        unsafe {
            self.handle.map_memory(
                memory,
                offset,
                size,
                vk::MemoryMapFlags::empty(),
            )
        }
    }

    /// # Safety
    /// Every range in `memory_ranges` must reference currently mapped
    /// memory from this device and satisfy Vulkan flush requirements.
    pub unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.flush_mapped_memory_ranges(memory_ranges) }
    }

    /// # Safety
    /// Every range in `memory_ranges` must reference currently mapped
    /// memory from this device and satisfy Vulkan invalidate requirements.
    pub unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.invalidate_mapped_memory_ranges(memory_ranges) }
    }

    /// # Safety
    /// `memory` must currently be mapped on this device.
    pub unsafe fn unmap_raw_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Caller guarantees memory is currently mapped.
        unsafe { self.handle.unmap_memory(memory) };
    }
}

// Command pool functionality
impl Device {
    /// # Safety
    /// `create_info` must have a valid `queue_family_index` for this device.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: Caller guarantees create_info validity and queue
        // family provenance.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must be a valid handle created from this device and not yet
    /// destroyed. All command buffers allocated from it must have finished
    /// execution and must not be referenced by any pending GPU work.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: Caller guarantees pool provenance and drop ordering.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info.command_pool` must be a valid pool created from this
    /// device. `command_buffer_count` must be non-zero.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: Caller guarantees allocate_info validity and pool provenance.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// # Safety
    /// `command_buffer` must be in the initial state and must not be
    /// pending execution.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command_buffer state and
        // begin_info validity.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command_buffer is in the recording state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must not be pending execution on the GPU. The pool it
    /// was allocated from must have been created with
    /// `RESET_COMMAND_BUFFER`.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command_buffer is not pending
        // and pool flag is set.
        unsafe {
            self.handle.reset_command_buffer(
                command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )
        }
    }

    /// Free command buffers back to their source pool.
    ///
    /// A no-op when `command_buffers` is empty.
    ///
    /// # Safety
    /// All handles in `command_buffers` must have been allocated from `pool`
    /// and none may be pending execution on the GPU.
    pub unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        if command_buffers.is_empty() {
            return;
        }
        // SAFETY: Caller guarantees pool/buffer provenance and idle state.
        unsafe { self.handle.free_command_buffers(pool, command_buffers) }
    }
}

// Recording commands
impl Device {
    /// Record a buffer-to-buffer copy.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. `src_buffer` and
    /// `dst_buffer` must be valid handles created from this device. Regions
    /// must be valid, non-overlapping within each buffer, and within bounds.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: Caller guarantees command buffer state and copy region
        // validity.
        unsafe {
            self.handle.cmd_copy_buffer(
                command_buffer,
                src_buffer,
                dst_buffer,
                regions,
            )
        }
    }

    /// Bind a compute pipeline for subsequent dispatch commands.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. `pipeline` must be a
    /// valid compute pipeline created from this device.
    pub unsafe fn cmd_bind_compute_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: Caller guarantees command_buffer state and pipeline validity.
        unsafe {
            self.handle.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline,
            )
        }
    }

    /// Bind descriptor sets for subsequent dispatch commands.
    ///
    /// # Safety
    /// - `command_buffer` must be in the recording state.
    /// - `layout` must be compatible with the pipeline to be used.
    /// - All handles in `descriptor_sets` must be valid and derived
    ///   from this device.
    pub unsafe fn cmd_bind_compute_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: Caller guarantees command buffer state, layout
        // compatibility, and descriptor set validity.
        unsafe {
            self.handle.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                first_set,
                descriptor_sets,
                &[],
            )
        }
    }

    /// Update push constant values.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. `layout` must
    /// declare a push-constant range covering `offset..offset + data.len()`
    /// for `stage_flags`.
    pub unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        // SAFETY: Caller guarantees command buffer state and range validity.
        unsafe {
            self.handle.cmd_push_constants(
                command_buffer,
                layout,
                stage_flags,
                offset,
                data,
            )
        }
    }

    /// Record a compute dispatch.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state with a compute
    /// pipeline and every descriptor set it uses bound.
    pub unsafe fn cmd_dispatch(
        &self,
        command_buffer: vk::CommandBuffer,
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    ) {
        // SAFETY: Caller guarantees command buffer and binding state.
        unsafe {
            self.handle.cmd_dispatch(
                command_buffer,
                group_count_x,
                group_count_y,
                group_count_z,
            )
        }
    }
}

// Fence functionality
impl Device {
    /// # Safety
    /// `create_info` must be a valid fence create info.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must be a valid handle created from this device and not yet
    /// destroyed. No GPU work may reference this fence at time of destruction.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: Caller guarantees fence provenance and drop ordering.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// `Ok(true)` when the fence is signaled.
    ///
    /// # Safety
    /// `fence` must be a valid fence created from this device.
    pub unsafe fn get_raw_fence_status(
        &self,
        fence: vk::Fence,
    ) -> Result<bool, vk::Result> {
        // SAFETY: Caller guarantees fence handle validity.
        unsafe { self.handle.get_fence_status(fence) }
    }

    /// # Safety
    /// All handles in `fences` must be valid fences created from this device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence handle validity.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }
}

// Descriptor set functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid and reference only objects
    /// derived from this device.
    pub unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_set_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must be a valid handle created from this device
    /// and not yet destroyed.
    pub unsafe fn destroy_raw_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) {
        // SAFETY: Caller guarantees layout provenance and ordering.
        unsafe { self.handle.destroy_descriptor_set_layout(layout, None) };
    }

    /// # Safety
    /// `create_info` must be valid and reference only objects
    /// derived from this device.
    pub unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must be a valid handle created from this device and
    /// not yet destroyed. All descriptor sets allocated from it
    /// must not be referenced by any pending GPU work.
    pub unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: Caller guarantees pool provenance and ordering.
        unsafe { self.handle.destroy_descriptor_pool(pool, None) };
    }

    /// Return every set allocated from `pool` to it.
    ///
    /// # Safety
    /// `pool` must be a valid handle created from this device. No set
    /// allocated from it may be referenced by pending GPU work.
    pub unsafe fn reset_raw_descriptor_pool(
        &self,
        pool: vk::DescriptorPool,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees pool provenance and idle state.
        unsafe {
            self.handle.reset_descriptor_pool(
                pool,
                vk::DescriptorPoolResetFlags::empty(),
            )
        }
    }

    /// # Safety
    /// `alloc_info.descriptor_pool` must be a valid pool created
    /// from this device with sufficient capacity. All layouts in
    /// `alloc_info` must be valid handles derived from this device.
    pub unsafe fn allocate_raw_descriptor_sets(
        &self,
        alloc_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        // SAFETY: Caller guarantees alloc_info validity.
        unsafe { self.handle.allocate_descriptor_sets(alloc_info) }
    }

    /// Write descriptor set updates.
    ///
    /// # Safety
    /// All handles in `descriptor_writes` must be valid and derived from
    /// this device. Buffers referenced by the writes must remain valid for
    /// as long as the descriptor set is bound in a submitted command
    /// buffer.
    pub unsafe fn update_raw_descriptor_sets(
        &self,
        descriptor_writes: &[vk::WriteDescriptorSet<'_>],
    ) {
        // SAFETY: Caller guarantees write validity.
        unsafe { self.handle.update_descriptor_sets(descriptor_writes, &[]) }
    }
}

// Shader module and pipeline functionality
impl Device {
    /// # Safety
    /// `create_info` must contain valid SPIR-V code.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `shader_module` must be a valid handle created from this device and
    /// not yet destroyed.
    pub unsafe fn destroy_raw_shader_module(
        &self,
        shader_module: vk::ShaderModule,
    ) {
        // SAFETY: Caller guarantees shader_module provenance and drop ordering.
        unsafe { self.handle.destroy_shader_module(shader_module, None) };
    }

    /// # Safety
    /// `create_info` must be a valid pipeline layout create info. All
    /// referenced descriptor set layouts must be valid handles created from
    /// this device.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must be a valid handle created from this device and not yet
    /// destroyed. No pipeline still using this layout may be in use.
    pub unsafe fn destroy_raw_pipeline_layout(
        &self,
        layout: vk::PipelineLayout,
    ) {
        // SAFETY: Caller guarantees layout provenance and drop ordering.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// # Safety
    /// `create_info` must be a valid pipeline cache create info.
    pub unsafe fn create_raw_pipeline_cache(
        &self,
        create_info: &vk::PipelineCacheCreateInfo<'_>,
    ) -> Result<vk::PipelineCache, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_pipeline_cache(create_info, None) }
    }

    /// # Safety
    /// `cache` must be a valid handle created from this device and not yet
    /// destroyed.
    pub unsafe fn destroy_raw_pipeline_cache(&self, cache: vk::PipelineCache) {
        // SAFETY: Caller guarantees cache provenance and drop ordering.
        unsafe { self.handle.destroy_pipeline_cache(cache, None) };
    }

    /// Create a single compute pipeline.
    ///
    /// On failure ash may return partially created handles alongside the
    /// error; this wrapper destroys them so callers never receive a mix of
    /// valid and invalid handles.
    ///
    /// # Safety
    /// `create_info` must reference a valid shader module, entry point and
    /// pipeline layout created from this device. `cache` must be null or a
    /// valid pipeline cache from this device.
    pub unsafe fn create_raw_compute_pipeline(
        &self,
        cache: vk::PipelineCache,
        create_info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: Caller guarantees create_info and cache validity.
        let result = unsafe {
            self.handle.create_compute_pipelines(
                cache,
                std::slice::from_ref(create_info),
                None,
            )
        };
        match result {
            Ok(mut pipelines) => Ok(pipelines.remove(0)),
            Err((pipelines, e)) => {
                for pipeline in pipelines
                    .into_iter()
                    .filter(|p| *p != vk::Pipeline::null())
                {
                    // SAFETY: pipeline was just created by this device and
                    // never handed out.
                    unsafe { self.handle.destroy_pipeline(pipeline, None) };
                }
                Err(e)
            }
        }
    }

    /// # Safety
    /// `pipeline` must be a valid handle created from this device and not
    /// yet destroyed. No pending GPU work may still reference it.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: Caller guarantees pipeline provenance and drop ordering.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    fn info(name: &str, ty: vk::PhysicalDeviceType) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            name: name.to_owned(),
            device_type: ty,
        }
    }

    #[test]
    fn prefers_compute_only_family() {
        use vk::QueueFlags as Q;
        let families = [
            family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER, 16),
            family(Q::TRANSFER, 2),
            family(Q::COMPUTE | Q::TRANSFER | Q::SPARSE_BINDING, 8),
        ];
        assert_eq!(find_compute_queue_family(&families), Some(2));
    }

    #[test]
    fn falls_back_to_graphics_compute_family() {
        use vk::QueueFlags as Q;
        let families = [
            family(Q::TRANSFER, 1),
            family(Q::GRAPHICS | Q::COMPUTE, 1),
        ];
        assert_eq!(find_compute_queue_family(&families), Some(1));
    }

    #[test]
    fn ignores_families_without_queues() {
        use vk::QueueFlags as Q;
        let families =
            [family(Q::COMPUTE, 0), family(Q::GRAPHICS | Q::COMPUTE, 1)];
        assert_eq!(find_compute_queue_family(&families), Some(1));
    }

    #[test]
    fn no_compute_family() {
        use vk::QueueFlags as Q;
        let families = [family(Q::GRAPHICS, 1), family(Q::TRANSFER, 1)];
        assert_eq!(find_compute_queue_family(&families), None);
        assert_eq!(find_compute_queue_family(&[]), None);
    }

    #[test]
    fn first_selection_picks_index_zero() {
        let devices = [
            info("llvmpipe", vk::PhysicalDeviceType::CPU),
            info("Radeon", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(DeviceSelection::First.pick(&devices), Some(0));
        assert_eq!(DeviceSelection::First.pick(&[]), None);
    }

    #[test]
    fn prefer_discrete_selection() {
        let devices = [
            info("Intel UHD", vk::PhysicalDeviceType::INTEGRATED_GPU),
            info("GeForce", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(DeviceSelection::PreferDiscrete.pick(&devices), Some(1));

        let integrated_only =
            [info("Intel UHD", vk::PhysicalDeviceType::INTEGRATED_GPU)];
        assert_eq!(
            DeviceSelection::PreferDiscrete.pick(&integrated_only),
            Some(0)
        );
        assert_eq!(DeviceSelection::PreferDiscrete.pick(&[]), None);
    }

    #[test]
    fn by_name_selection_is_case_insensitive_substring() {
        let devices = [
            info("Intel(R) UHD Graphics", vk::PhysicalDeviceType::INTEGRATED_GPU),
            info("NVIDIA GeForce RTX", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        let by_name = DeviceSelection::ByName("geforce".to_owned());
        assert_eq!(by_name.pick(&devices), Some(1));
        let missing = DeviceSelection::ByName("radeon".to_owned());
        assert_eq!(missing.pick(&devices), None);
    }
}
