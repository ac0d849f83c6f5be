//! Typed device buffers and the host ↔ device staging protocol.
//!
//! [`DeviceBuffer<T>`] owns a `VkBuffer` and the `VkDeviceMemory` bound to
//! it. Memory is allocated directly with `vkAllocateMemory` from the type
//! picked by [`MemoryTypeTable::select`](crate::memory::MemoryTypeTable::select).
//!
//! Host data moves in one of two ways:
//!
//! - **direct**: the buffer's memory is host-visible, so it is mapped for
//!   the duration of one copy ([`write_mapped`](DeviceBuffer::write_mapped),
//!   [`read_mapped`](DeviceBuffer::read_mapped)).
//! - **staged**: a temporary host-visible buffer is filled or drained
//!   directly and a device copy moves the bytes
//!   ([`write_staged`](DeviceBuffer::write_staged),
//!   [`read_staged`](DeviceBuffer::read_staged)).
//!
//! [`from_host`](DeviceBuffer::from_host) and
//! [`to_host`](DeviceBuffer::to_host) pick whichever applies.

use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use thiserror::Error;

use crate::device::Device;
use crate::memory::NoSuitableMemory;
use crate::transfer::{self, TransferError};

/// Trait for types that expose a raw `VkBuffer` handle and its size.
///
/// Blanket impls cover `&T`, so both owned wrappers and borrows of them
/// satisfy the bound.
pub trait BufferHandle {
    fn raw_buffer(&self) -> vk::Buffer;

    /// Size of the buffer object in bytes.
    fn size_bytes(&self) -> vk::DeviceSize;
}

impl<T> BufferHandle for &T
where
    T: BufferHandle + ?Sized,
{
    fn raw_buffer(&self) -> vk::Buffer {
        (*self).raw_buffer()
    }

    fn size_bytes(&self) -> vk::DeviceSize {
        (*self).size_bytes()
    }
}

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Refusing to create a zero-sized buffer")]
    ZeroSized,

    #[error("Buffer of {len} elements of {elem_size} bytes overflows")]
    SizeOverflow { len: usize, elem_size: usize },

    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),

    #[error(transparent)]
    NoSuitableMemory(#[from] NoSuitableMemory),

    #[error("Vulkan error allocating buffer memory: {0}")]
    AllocationFailed(vk::Result),

    #[error("Vulkan error binding buffer memory: {0}")]
    BindMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum BufferAccessError {
    #[error("Host data has {actual} elements but the buffer holds {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Buffer memory {0:?} is not host visible")]
    NotHostVisible(vk::MemoryPropertyFlags),

    #[error("Buffer usage {actual:?} lacks {required:?} needed for staging")]
    MissingUsage {
        required: vk::BufferUsageFlags,
        actual: vk::BufferUsageFlags,
    },

    #[error("Vulkan error mapping buffer memory: {0}")]
    Map(vk::Result),

    #[error("Vulkan error flushing mapped memory: {0}")]
    Flush(vk::Result),

    #[error("Vulkan error invalidating mapped memory: {0}")]
    Invalidate(vk::Result),

    #[error("Failed to create buffer: {0}")]
    Create(#[from] CreateBufferError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Memory and usage requirements for a new buffer.
///
/// # Defaults (via [`Default`])
/// | field | default |
/// |---|---|
/// | `properties` | `DEVICE_LOCAL` |
/// | `usage` | `STORAGE_BUFFER` |
/// | `name` | `None` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc<'a> {
    /// Property flags the backing memory type must have.
    pub properties: vk::MemoryPropertyFlags,
    pub usage: vk::BufferUsageFlags,
    /// Debug label applied when validation is enabled.
    pub name: Option<&'a str>,
}

impl Default for BufferDesc<'_> {
    fn default() -> Self {
        Self {
            properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            name: None,
        }
    }
}

impl<'a> BufferDesc<'a> {
    /// Host-visible, host-coherent storage buffer.
    pub fn host_visible() -> Self {
        Self {
            properties: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            ..Self::default()
        }
    }

    pub fn with_usage(self, usage: vk::BufferUsageFlags) -> Self {
        Self { usage, ..self }
    }

    pub fn with_name(self, name: &'a str) -> Self {
        Self {
            name: Some(name),
            ..self
        }
    }
}

/// Usage flags actually requested from Vulkan for a buffer.
///
/// A plain device-local storage buffer on a discrete GPU also gets
/// TRANSFER_SRC | TRANSFER_DST, since staging is the only way to reach it
/// from the host there.
pub fn effective_usage(
    device_type: vk::PhysicalDeviceType,
    properties: vk::MemoryPropertyFlags,
    usage: vk::BufferUsageFlags,
) -> vk::BufferUsageFlags {
    if device_type == vk::PhysicalDeviceType::DISCRETE_GPU
        && properties == vk::MemoryPropertyFlags::DEVICE_LOCAL
        && usage == vk::BufferUsageFlags::STORAGE_BUFFER
    {
        usage
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST
    } else {
        usage
    }
}

/// Untyped buffer + dedicated memory allocation.
///
/// Both staging buffers and [`DeviceBuffer`] are built on this.
struct RawBuffer {
    parent: Arc<Device>,
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
}

impl std::fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("memory_properties", &self.memory_properties)
            .finish_non_exhaustive()
    }
}

impl RawBuffer {
    fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        if size == 0 {
            return Err(CreateBufferError::ZeroSized);
        }

        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: create_info is fully initialised and has no borrowed data.
        let handle = unsafe { device.create_raw_buffer(&create_info) }
            .map_err(CreateBufferError::CreateBuffer)?;

        // SAFETY: handle is a valid buffer created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name buffer {:?}: {e}", handle);
        }

        // SAFETY: handle is a valid buffer created from this device.
        let reqs = unsafe { device.get_raw_buffer_memory_requirements(handle) };

        let memory_type_index = match device
            .memory_types()
            .select(reqs.memory_type_bits, properties)
        {
            Ok(idx) => idx,
            Err(e) => {
                // SAFETY: handle was created above and is not bound to memory.
                unsafe { device.destroy_raw_buffer(handle) };
                return Err(e.into());
            }
        };
        let memory_properties = device
            .memory_types()
            .flags(memory_type_index)
            .unwrap_or(properties);

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(reqs.size)
            .memory_type_index(memory_type_index);

        // SAFETY: memory_type_index was selected from this device's table.
        let memory = match unsafe { device.allocate_raw_memory(&allocate_info) }
        {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: handle was created above and is not bound to memory.
                unsafe { device.destroy_raw_buffer(handle) };
                return Err(CreateBufferError::AllocationFailed(e));
            }
        };

        // SAFETY: handle and memory belong to this device; the allocation
        // was sized from the buffer's requirements and offset 0 is aligned.
        let bind_result =
            unsafe { device.bind_raw_buffer_memory(handle, memory, 0) };
        if let Err(e) = bind_result {
            // SAFETY: both handles are valid and owned by this scope.
            unsafe {
                device.destroy_raw_buffer(handle);
                device.free_raw_memory(memory);
            }
            return Err(CreateBufferError::BindMemory(e));
        }

        tracing::debug!(
            "Created buffer {:?}: {size} bytes, usage {usage:?}, memory type \
             {memory_type_index} ({memory_properties:?})",
            handle
        );

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            memory,
            size,
            usage,
            memory_properties,
        })
    }

    fn is_host_visible(&self) -> bool {
        self.memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn is_host_coherent(&self) -> bool {
        self.memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn map(&self) -> Result<MappedMemory<'_>, BufferAccessError> {
        if !self.is_host_visible() {
            return Err(BufferAccessError::NotHostVisible(
                self.memory_properties,
            ));
        }
        // SAFETY: memory is host visible, owned by self and not currently
        // mapped: every mapping is scoped to a MappedMemory guard that
        // borrows self.
        let ptr = unsafe {
            self.parent
                .map_raw_memory(self.memory, 0, vk::WHOLE_SIZE)
        }
        .map_err(BufferAccessError::Map)?;
        Ok(MappedMemory {
            buffer: self,
            ptr: ptr.cast::<u8>(),
        })
    }

    fn whole_range(&self) -> vk::MappedMemoryRange<'static> {
        vk::MappedMemoryRange::default()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }

    /// Copy `bytes` into the start of the buffer through a mapping.
    fn write_bytes(&self, bytes: &[u8]) -> Result<(), BufferAccessError> {
        debug_assert!(bytes.len() as vk::DeviceSize <= self.size);
        let mapping = self.map()?;
        // SAFETY: the mapping covers the whole allocation, which is at least
        // self.size bytes, and bytes.len() <= self.size.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapping.ptr,
                bytes.len(),
            )
        };
        if !self.is_host_coherent() {
            let range = self.whole_range();
            // SAFETY: range references memory currently mapped by `mapping`.
            unsafe {
                self.parent
                    .flush_raw_mapped_memory_ranges(std::slice::from_ref(&range))
            }
            .map_err(BufferAccessError::Flush)?;
        }
        Ok(())
    }

    /// Fill `out` from the start of the buffer through a mapping.
    fn read_bytes(&self, out: &mut [u8]) -> Result<(), BufferAccessError> {
        debug_assert!(out.len() as vk::DeviceSize <= self.size);
        let mapping = self.map()?;
        if !self.is_host_coherent() {
            let range = self.whole_range();
            // SAFETY: range references memory currently mapped by `mapping`.
            unsafe {
                self.parent.invalidate_raw_mapped_memory_ranges(
                    std::slice::from_ref(&range),
                )
            }
            .map_err(BufferAccessError::Invalidate)?;
        }
        // SAFETY: see write_bytes; out.len() <= self.size.
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapping.ptr.cast_const(),
                out.as_mut_ptr(),
                out.len(),
            )
        };
        Ok(())
    }

    fn require_usage(
        &self,
        required: vk::BufferUsageFlags,
    ) -> Result<(), BufferAccessError> {
        if self.usage.contains(required) {
            Ok(())
        } else {
            Err(BufferAccessError::MissingUsage {
                required,
                actual: self.usage,
            })
        }
    }
}

impl BufferHandle for RawBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.handle
    }

    fn size_bytes(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        if let Err(e) = self.parent.settle_abandoned_work() {
            tracing::error!(
                "Leaking buffer {:?}; a timed-out submission may still use it \
                 and waiting for the device failed: {e}",
                self.handle
            );
            return;
        }
        // SAFETY: both handles were created from parent and are owned by
        // this wrapper, and no abandoned submission is still running. The
        // buffer goes first so memory is never freed while still bound to a
        // live buffer.
        unsafe {
            self.parent.destroy_raw_buffer(self.handle);
            self.parent.free_raw_memory(self.memory);
        }
    }
}

/// Unmaps its buffer's memory when dropped.
struct MappedMemory<'a> {
    buffer: &'a RawBuffer,
    ptr: *mut u8,
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        // SAFETY: the memory was mapped when this guard was created.
        unsafe { self.buffer.parent.unmap_raw_memory(self.buffer.memory) };
    }
}

/// Create a host-visible staging buffer of `size` bytes.
fn staging_buffer(
    device: &Arc<Device>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> Result<RawBuffer, CreateBufferError> {
    RawBuffer::new(
        device,
        size,
        usage,
        vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT,
        Some("staging buffer"),
    )
}

/// A linear array of `len` elements of `T` in device memory.
///
/// Move-only. Dropping it destroys the buffer and frees its memory. If a
/// copy or dispatch on the same device timed out, the drop first waits for
/// the device to go idle.
pub struct DeviceBuffer<T: Pod> {
    raw: RawBuffer,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("handle", &self.raw.handle)
            .field("len", &self.len)
            .field("memory_properties", &self.raw.memory_properties)
            .finish_non_exhaustive()
    }
}

impl<T: Pod> DeviceBuffer<T> {
    /// Allocate an uninitialised buffer of `len` elements.
    pub fn new(
        device: &Arc<Device>,
        len: usize,
        desc: BufferDesc<'_>,
    ) -> Result<Self, CreateBufferError> {
        let elem_size = std::mem::size_of::<T>();
        let size = len
            .checked_mul(elem_size)
            .ok_or(CreateBufferError::SizeOverflow { len, elem_size })?;
        let usage =
            effective_usage(device.device_type(), desc.properties, desc.usage);
        let raw = RawBuffer::new(
            device,
            size as vk::DeviceSize,
            usage,
            desc.properties,
            desc.name,
        )?;
        Ok(Self {
            raw,
            len,
            _marker: PhantomData,
        })
    }

    /// Allocate a buffer sized to `data` and upload it.
    ///
    /// Host-visible memory is written through a mapping; anything else goes
    /// through a staging buffer, which needs TRANSFER_DST in the effective
    /// usage.
    ///
    /// If the staged copy times out the new buffer is leaked along with its
    /// staging buffer, since the copy may still be writing to it.
    pub fn from_host(
        device: &Arc<Device>,
        data: &[T],
        desc: BufferDesc<'_>,
    ) -> Result<Self, BufferAccessError> {
        let mut buffer = Self::new(device, data.len(), desc)?;
        if buffer.is_host_visible() {
            buffer.write_mapped(data)?;
            return Ok(buffer);
        }
        match buffer.write_staged(data) {
            Ok(()) => Ok(buffer),
            Err(BufferAccessError::Transfer(TransferError::Timeout)) => {
                tracing::warn!(
                    "Leaking buffer {:?} after a timed-out upload",
                    buffer.raw.handle
                );
                std::mem::forget(buffer);
                Err(TransferError::Timeout.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Download the whole buffer into `out`, which ends up with exactly
    /// [`len`](Self::len) elements.
    pub fn to_host(&self, out: &mut Vec<T>) -> Result<(), BufferAccessError> {
        out.clear();
        out.resize(self.len, <T as bytemuck::Zeroable>::zeroed());
        if self.is_host_visible() {
            self.read_mapped(out)
        } else {
            self.read_staged(out)
        }
    }

    pub fn to_vec(&self) -> Result<Vec<T>, BufferAccessError> {
        let mut out = Vec::with_capacity(self.len);
        self.to_host(&mut out)?;
        Ok(out)
    }

    fn check_len(&self, actual: usize) -> Result<(), BufferAccessError> {
        if actual == self.len {
            Ok(())
        } else {
            Err(BufferAccessError::LengthMismatch {
                expected: self.len,
                actual,
            })
        }
    }

    /// Overwrite the buffer through a host mapping.
    pub fn write_mapped(&mut self, data: &[T]) -> Result<(), BufferAccessError> {
        self.check_len(data.len())?;
        self.raw.write_bytes(bytemuck::cast_slice(data))
    }

    /// Read the buffer through a host mapping.
    pub fn read_mapped(&self, out: &mut [T]) -> Result<(), BufferAccessError> {
        self.check_len(out.len())?;
        self.raw.read_bytes(bytemuck::cast_slice_mut(out))
    }

    /// Overwrite the buffer via a staging buffer and a device copy.
    ///
    /// On a copy timeout the staging buffer is leaked, and dropping `self`
    /// waits for the device to go idle.
    pub fn write_staged(&mut self, data: &[T]) -> Result<(), BufferAccessError> {
        self.check_len(data.len())?;
        self.raw.require_usage(vk::BufferUsageFlags::TRANSFER_DST)?;
        let device = Arc::clone(&self.raw.parent);
        let staging = staging_buffer(
            &device,
            self.raw.size,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        staging.write_bytes(bytemuck::cast_slice(data))?;
        match transfer::copy_buffer(&device, &staging, &self.raw, self.raw.size)
        {
            Err(TransferError::Timeout) => {
                std::mem::forget(staging);
                Err(TransferError::Timeout.into())
            }
            result => Ok(result?),
        }
    }

    /// Read the buffer via a device copy into a staging buffer.
    ///
    /// Timeouts are handled as in [`write_staged`](Self::write_staged).
    pub fn read_staged(&self, out: &mut [T]) -> Result<(), BufferAccessError> {
        self.check_len(out.len())?;
        self.raw.require_usage(vk::BufferUsageFlags::TRANSFER_SRC)?;
        let device = &self.raw.parent;
        let staging = staging_buffer(
            device,
            self.raw.size,
            vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        match transfer::copy_buffer(device, &self.raw, &staging, self.raw.size)
        {
            Err(TransferError::Timeout) => {
                std::mem::forget(staging);
                return Err(TransferError::Timeout.into());
            }
            result => result?,
        }
        staging.read_bytes(bytemuck::cast_slice_mut(out))
    }

    /// Number of `T` elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; zero-length buffers are rejected at creation.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Property flags of the memory type actually allocated, which may be a
    /// superset of what was requested.
    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.raw.memory_properties
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.raw.usage
    }

    pub fn is_host_visible(&self) -> bool {
        self.raw.is_host_visible()
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.raw.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.raw.parent
    }
}

impl<T: Pod> BufferHandle for DeviceBuffer<T> {
    fn raw_buffer(&self) -> vk::Buffer {
        self.raw.handle
    }

    fn size_bytes(&self) -> vk::DeviceSize {
        self.raw.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use vk::BufferUsageFlags as U;
    use vk::MemoryPropertyFlags as M;
    use vk::PhysicalDeviceType as D;

    #[test]
    fn default_desc_is_device_local_storage() {
        let desc = BufferDesc::default();
        assert_eq!(desc.properties, M::DEVICE_LOCAL);
        assert_eq!(desc.usage, U::STORAGE_BUFFER);
        assert_eq!(desc.name, None);
    }

    #[test]
    fn host_visible_desc() {
        let desc = BufferDesc::host_visible().with_name("x");
        assert!(desc.properties.contains(M::HOST_VISIBLE));
        assert_eq!(desc.usage, U::STORAGE_BUFFER);
        assert_eq!(desc.name, Some("x"));
    }

    #[test]
    fn widens_plain_storage_buffer_on_discrete_gpu() {
        let usage = effective_usage(D::DISCRETE_GPU, M::DEVICE_LOCAL, U::STORAGE_BUFFER);
        assert_eq!(usage, U::STORAGE_BUFFER | U::TRANSFER_SRC | U::TRANSFER_DST);
    }

    #[test]
    fn leaves_other_requests_alone() {
        assert_eq!(
            effective_usage(D::INTEGRATED_GPU, M::DEVICE_LOCAL, U::STORAGE_BUFFER),
            U::STORAGE_BUFFER
        );
        assert_eq!(
            effective_usage(
                D::DISCRETE_GPU,
                M::DEVICE_LOCAL | M::HOST_VISIBLE,
                U::STORAGE_BUFFER
            ),
            U::STORAGE_BUFFER
        );
        assert_eq!(
            effective_usage(
                D::DISCRETE_GPU,
                M::DEVICE_LOCAL,
                U::STORAGE_BUFFER | U::TRANSFER_DST
            ),
            U::STORAGE_BUFFER | U::TRANSFER_DST
        );
    }
}
