//! Compute pipeline objects: [`PipelineLayout`], [`PipelineCache`] and
//! [`ComputePipeline`].

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::descriptor::DescriptorSetLayout;
use crate::device::Device;
use crate::shader::EntryPoint;

/// An owned wrapper around a `VkPipelineLayout`.
pub struct PipelineLayout {
    parent: Arc<Device>,
    handle: vk::PipelineLayout,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    /// Create a layout with one descriptor set layout and a single COMPUTE
    /// push-constant range of `push_constant_size` bytes at offset 0.
    pub fn new_compute(
        device: &Arc<Device>,
        set_layout: &DescriptorSetLayout,
        push_constant_size: u32,
    ) -> Result<Self, vk::Result> {
        let set_layouts = [set_layout.raw_descriptor_set_layout()];
        let push_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: push_constant_size,
        }];
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        // SAFETY: create_info references a set layout created from device and
        // stack data that outlives the call.
        let handle =
            unsafe { device.create_raw_pipeline_layout(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: handle was created from parent. Pipelines using this
        // layout are dropped first by their owner.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

/// An owned, initially empty `VkPipelineCache`.
pub struct PipelineCache {
    parent: Arc<Device>,
    handle: vk::PipelineCache,
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCache")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PipelineCache {
    pub fn new(device: &Arc<Device>) -> Result<Self, vk::Result> {
        let create_info = vk::PipelineCacheCreateInfo::default();
        // SAFETY: create_info carries no initial data.
        let handle = unsafe { device.create_raw_pipeline_cache(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::PipelineCache {
        self.handle
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline cache {:?}", self.handle);
        // SAFETY: handle was created from parent and is not in use by any
        // pipeline creation call.
        unsafe { self.parent.destroy_raw_pipeline_cache(self.handle) };
    }
}

#[derive(Debug, Error)]
pub enum CreateComputePipelineError {
    #[error("Vulkan error creating compute pipeline: {0}")]
    Vulkan(vk::Result),
}

/// 4-byte integer specialization constants with ids `0..values.len()`,
/// packed back to back.
fn specialization_entries(values: &[u32]) -> Vec<vk::SpecializationMapEntry> {
    let size = std::mem::size_of::<u32>();
    values
        .iter()
        .enumerate()
        .map(|(i, _)| vk::SpecializationMapEntry {
            constant_id: i as u32,
            offset: (i * size) as u32,
            size,
        })
        .collect()
}

/// A compute pipeline with integer specialization constants baked in.
pub struct ComputePipeline {
    parent: Arc<Device>,
    handle: vk::Pipeline,
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ComputePipeline {
    /// Build a compute pipeline for `entry`.
    ///
    /// `specialization` supplies the values of integer constants
    /// `0..specialization.len()`.
    pub fn new(
        device: &Arc<Device>,
        entry: &EntryPoint<'_>,
        layout: &PipelineLayout,
        cache: &PipelineCache,
        specialization: &[u32],
        name: Option<&str>,
    ) -> Result<Self, CreateComputePipelineError> {
        let map_entries = specialization_entries(specialization);
        let data: &[u8] = bytemuck::cast_slice(specialization);
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(data);
        let stage = entry.as_stage_create_info(Some(&spec_info));
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout.raw_handle());

        // SAFETY: the shader module, layout and cache were all created from
        // device and outlive this call.
        let handle = unsafe {
            device.create_raw_compute_pipeline(cache.raw_handle(), &create_info)
        }
        .map_err(CreateComputePipelineError::Vulkan)?;

        // SAFETY: handle is a valid pipeline created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name compute pipeline {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::Pipeline {
        self.handle
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping compute pipeline {:?}", self.handle);
        // SAFETY: handle was created from parent; the owning kernel has
        // retired all dispatches that use it.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specialization_entries_are_packed_u32s() {
        let entries = specialization_entries(&[16, 16]);
        assert_eq!(entries.len(), 2);
        assert_eq!(
            (entries[0].constant_id, entries[0].offset, entries[0].size),
            (0, 0, 4)
        );
        assert_eq!(
            (entries[1].constant_id, entries[1].offset, entries[1].size),
            (1, 4, 4)
        );
    }
}
