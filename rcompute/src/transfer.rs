//! One-shot, blocking buffer-to-buffer copies on the compute queue.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferHandle;
use crate::command::{
    AllocateCommandBufferError, CommandPool, CreateCommandPoolError,
};
use crate::device::Device;
use crate::sync::{CreateFenceError, Fence, WaitFenceError};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(
        "Copy of {copy_size} bytes out of bounds: src is {src_size} bytes, \
         dst is {dst_size} bytes"
    )]
    RegionOutOfBounds {
        src_size: vk::DeviceSize,
        dst_size: vk::DeviceSize,
        copy_size: vk::DeviceSize,
    },

    #[error(transparent)]
    CreateCommandPool(#[from] CreateCommandPoolError),

    #[error(transparent)]
    AllocateCommandBuffer(#[from] AllocateCommandBufferError),

    #[error("Vulkan error recording copy command: {0}")]
    Record(vk::Result),

    #[error(transparent)]
    CreateFence(#[from] CreateFenceError),

    #[error("Vulkan error submitting copy: {0}")]
    Submit(vk::Result),

    #[error("Timed out waiting for copy to complete")]
    Timeout,

    #[error("Error waiting for copy to complete: {0}")]
    Wait(WaitFenceError),
}

impl From<WaitFenceError> for TransferError {
    fn from(value: WaitFenceError) -> Self {
        match value {
            WaitFenceError::Timeout => Self::Timeout,
            e => Self::Wait(e),
        }
    }
}

/// Copy the first `size` bytes of `src` into the first `size` bytes of `dst`
/// and block until the GPU has finished.
///
/// A transient command pool, one command buffer and one fence are created
/// for the copy and released afterwards. If the wait times out they are
/// leaked instead, since the GPU may still be executing the copy, and the
/// device is told so: dropping `src` or `dst` afterwards blocks until the
/// device is idle.
///
/// `src` needs `TRANSFER_SRC` usage and `dst` needs `TRANSFER_DST`.
pub fn copy_buffer<S, D>(
    device: &Arc<Device>,
    src: &S,
    dst: &D,
    size: vk::DeviceSize,
) -> Result<(), TransferError>
where
    S: BufferHandle + ?Sized,
    D: BufferHandle + ?Sized,
{
    if size > src.size_bytes() || size > dst.size_bytes() {
        return Err(TransferError::RegionOutOfBounds {
            src_size: src.size_bytes(),
            dst_size: dst.size_bytes(),
            copy_size: size,
        });
    }

    let _span = tracing::debug_span!(
        "copy_buffer",
        src = ?src.raw_buffer(),
        dst = ?dst.raw_buffer(),
        size
    )
    .entered();

    let pool = CommandPool::new(
        device,
        device.compute_queue_family(),
        vk::CommandPoolCreateFlags::TRANSIENT,
        Some("transfer pool"),
    )?;
    let mut cmd = pool.allocate_command_buffer()?;

    // SAFETY: cmd was just allocated and is in the initial state. Both
    // buffers are valid for this device and the region was bounds-checked.
    unsafe {
        cmd.begin_one_time().map_err(TransferError::Record)?;
        cmd.copy_buffer(src, dst, size);
        cmd.end().map_err(TransferError::Record)?;
    }

    let mut fence = Fence::new(device, Some("transfer fence"))?;
    // SAFETY: cmd is executable and was allocated on the compute queue
    // family. src and dst outlive the wait below; on timeout the device
    // keeps them from being destroyed until it is idle.
    unsafe { fence.submit(&[cmd.raw_command_buffer()]) }
        .map_err(TransferError::Submit)?;

    match fence.wait() {
        Ok(()) => Ok(()),
        Err(WaitFenceError::Timeout) => {
            tracing::warn!(
                "Copy did not finish within the wait timeout; leaking its \
                 command pool {:?} and fence {:?}",
                pool.raw_command_pool(),
                fence.raw_fence()
            );
            device.note_abandoned_submission();
            std::mem::forget(cmd);
            std::mem::forget(pool);
            std::mem::forget(fence);
            Err(TransferError::Timeout)
        }
        Err(e) => Err(e.into()),
    }
}
