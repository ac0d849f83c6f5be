//! Descriptor set layout, pool, and set wrappers.
//!
//! [`DescriptorSetLayout`] describes the binding slots of a set,
//! [`DescriptorPool`] hands out sets and is reset wholesale between
//! dispatches, and [`DescriptorSet`] is a plain handle whose storage belongs
//! to the pool.

use std::sync::Arc;

use ash::vk;

use crate::buffer::BufferHandle;
use crate::device::Device;

/// Describes a single binding within a descriptor set layout.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorBindingDesc {
    /// Binding slot index used by the shader.
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Array length of the binding.
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

impl DescriptorBindingDesc {
    /// One storage buffer visible to the compute stage.
    pub fn compute_storage_buffer(binding: u32) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            count: 1,
            stage_flags: vk::ShaderStageFlags::COMPUTE,
        }
    }
}

impl From<DescriptorBindingDesc>
    for vk::DescriptorSetLayoutBinding<'static>
{
    fn from(b: DescriptorBindingDesc) -> Self {
        vk::DescriptorSetLayoutBinding::default()
            .binding(b.binding)
            .descriptor_type(b.descriptor_type)
            .descriptor_count(b.count)
            .stage_flags(b.stage_flags)
    }
}

/// An owned wrapper around a `VkDescriptorSetLayout`.
pub struct DescriptorSetLayout {
    parent: Arc<Device>,
    handle: vk::DescriptorSetLayout,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DescriptorSetLayout {
    pub fn new(
        device: &Arc<Device>,
        bindings: &[DescriptorBindingDesc],
    ) -> Result<Self, vk::Result> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> =
            bindings.iter().copied().map(Into::into).collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&vk_bindings);
        // SAFETY: create_info references valid binding descriptions
        // for the duration of this call.
        let handle =
            unsafe { device.create_raw_descriptor_set_layout(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor set layout {:?}", self.handle);
        // SAFETY: handle was created from parent. Pipeline layouts built
        // from it are dropped first by their owner.
        unsafe { self.parent.destroy_raw_descriptor_set_layout(self.handle) };
    }
}

/// An owned wrapper around a `VkDescriptorPool`.
///
/// Sets are never freed individually; [`reset`](Self::reset) returns all of
/// them at once.
pub struct DescriptorPool {
    parent: Arc<Device>,
    handle: vk::DescriptorPool,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    /// Create a descriptor pool.
    ///
    /// `max_sets` is the total number of descriptor sets that may be
    /// allocated between resets. `pool_sizes` specifies the capacity
    /// per descriptor type.
    pub fn new(
        device: &Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self, vk::Result> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        // SAFETY: create_info is valid and references only stack data.
        let handle =
            unsafe { device.create_raw_descriptor_pool(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Allocate a single set with `layout`.
    pub fn allocate_set(
        &mut self,
        layout: &DescriptorSetLayout,
    ) -> Result<DescriptorSet, vk::Result> {
        let raw_layouts = [layout.raw_descriptor_set_layout()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&raw_layouts);
        // SAFETY: alloc_info references a valid pool and a valid layout,
        // both created from self.parent. &mut self serialises pool access.
        let mut raw_sets =
            unsafe { self.parent.allocate_raw_descriptor_sets(&alloc_info) }?;
        Ok(DescriptorSet {
            handle: raw_sets.remove(0),
        })
    }

    /// Return every set allocated from this pool.
    ///
    /// # Safety
    /// No set allocated from this pool may be referenced by a command buffer
    /// that is pending execution or will be submitted later.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees no set is still in use.
        unsafe { self.parent.reset_raw_descriptor_pool(self.handle) }
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor pool {:?}", self.handle);
        // SAFETY: handle was created from parent. All GPU work referencing
        // sets from this pool has completed before drop.
        unsafe { self.parent.destroy_raw_descriptor_pool(self.handle) };
    }
}

/// A descriptor set allocated from a [`DescriptorPool`].
///
/// The handle is invalidated when its pool is reset or dropped.
#[derive(Debug)]
pub struct DescriptorSet {
    handle: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn raw_descriptor_set(&self) -> vk::DescriptorSet {
        self.handle
    }

    /// Point `binding` at the first `range` bytes of `buffer`.
    ///
    /// # Safety
    /// - `buffer` must be a valid buffer created from `device` with
    ///   `STORAGE_BUFFER` usage.
    /// - `range` must not exceed the buffer's size.
    /// - The buffer must remain valid for as long as this descriptor
    ///   set is bound in any submitted command buffer.
    pub unsafe fn write_storage_buffer<B: BufferHandle + ?Sized>(
        &self,
        device: &Device,
        binding: u32,
        buffer: &B,
        range: vk::DeviceSize,
    ) {
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer.raw_buffer())
            .offset(0)
            .range(range);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info));
        // SAFETY: Caller guarantees buffer validity and lifetime.
        unsafe { device.update_raw_descriptor_sets(std::slice::from_ref(&write)) }
    }
}
