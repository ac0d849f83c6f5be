use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum LoadShaderError {
    #[error("Failed to read shader file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("SPIR-V byte length ({0}) is zero or not a multiple of 4")]
    InvalidLength(usize),

    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

/// Decode little-endian SPIR-V bytes into words.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>, LoadShaderError> {
    if bytes.is_empty() || !bytes.len().is_multiple_of(4) {
        return Err(LoadShaderError::InvalidLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub struct ShaderModule {
    parent: Arc<Device>,
    handle: vk::ShaderModule,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Create a shader module from raw SPIR-V bytes.
    ///
    /// `name` is an optional debug label applied via `VK_EXT_debug_utils` when
    /// the extension is available. Naming failures are logged as warnings and
    /// do not cause the call to fail.
    pub fn new(
        device: &Arc<Device>,
        spirv_bytes: &[u8],
        name: Option<&str>,
    ) -> Result<Self, LoadShaderError> {
        let code = spirv_words(spirv_bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        // SAFETY: create_info contains whole SPIR-V words; the driver
        // validates the module contents.
        let handle = unsafe { device.create_raw_shader_module(&create_info) }
            .map_err(LoadShaderError::Vulkan)?;

        // SAFETY: handle is a valid shader module created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name shader module {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Read a SPIR-V binary from disk and create a module from it.
    pub fn from_file(
        device: &Arc<Device>,
        path: &Path,
    ) -> Result<Self, LoadShaderError> {
        let bytes = std::fs::read(path).map_err(|source| LoadShaderError::Io {
            path: path.to_owned(),
            source,
        })?;
        tracing::debug!("Loaded {} bytes of SPIR-V from {path:?}", bytes.len());
        let name = path.file_name().and_then(|n| n.to_str());
        Self::new(device, &bytes, name)
    }

    /// A compute-stage view of entry point `name` in this module.
    ///
    /// Returns `Err` only if `name` contains an interior NUL byte.
    pub fn compute_entry_point(
        &self,
        name: &str,
    ) -> Result<EntryPoint<'_>, std::ffi::NulError> {
        Ok(EntryPoint {
            module: self,
            name: CString::new(name)?,
        })
    }

    pub fn raw_handle(&self) -> vk::ShaderModule {
        self.handle
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: handle was created from parent. Pipelines built from this
        // module do not reference it after creation.
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}

/// A borrow-view pairing a [`ShaderModule`] with a compute entry point name.
#[derive(Debug)]
pub struct EntryPoint<'a> {
    module: &'a ShaderModule,
    name: CString,
}

impl EntryPoint<'_> {
    /// Build a `VkPipelineShaderStageCreateInfo` for this entry point.
    ///
    /// The returned struct borrows from `self` and `specialization`.
    pub fn as_stage_create_info<'s>(
        &'s self,
        specialization: Option<&'s vk::SpecializationInfo<'s>>,
    ) -> vk::PipelineShaderStageCreateInfo<'s> {
        let info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.module.raw_handle())
            .name(&self.name);
        match specialization {
            Some(spec) => info.specialization_info(spec),
            None => info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian_words() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];
        let words = spirv_words(&bytes).expect("two whole words");
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn rejects_partial_words() {
        assert!(matches!(
            spirv_words(&[0x03, 0x02, 0x23]),
            Err(LoadShaderError::InvalidLength(3))
        ));
        assert!(matches!(
            spirv_words(&[]),
            Err(LoadShaderError::InvalidLength(0))
        ));
    }
}
