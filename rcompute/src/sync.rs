//! Host-side completion tracking for queue submissions: [`Fence`].
//!
//! Each blocking operation in this crate submits through a fresh fence and
//! then waits on it with the device's configured timeout.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("Vulkan error creating fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("Fence wait timed out")]
    Timeout,
    #[error("Vulkan error waiting for fence: {0}")]
    Vulkan(vk::Result),
    #[error("Fence was never submitted, so it can never signal")]
    NotSubmitted,
}

/// An owned binary fence, used for exactly one submission.
pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
    submitted: bool,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("submitted", &self.submitted)
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Create an unsignaled fence. Naming failures are only logged.
    pub fn new(
        device: &Arc<Device>,
        name: Option<&str>,
    ) -> Result<Self, CreateFenceError> {
        let create_info = vk::FenceCreateInfo::default();

        // SAFETY: create_info is fully initialised with no borrowed pointers.
        let handle = unsafe { device.create_raw_fence(&create_info) }
            .map_err(CreateFenceError::Vulkan)?;

        // SAFETY: handle is a valid fence created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name fence {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            submitted: false,
        })
    }

    /// Submit `command_buffers` to the device's compute queue, signaling this
    /// fence on completion.
    ///
    /// # Safety
    /// The command buffers must be executable, allocated from a pool on the
    /// compute queue family of this fence's device, and every resource they
    /// reference must stay alive until the fence signals.
    pub unsafe fn submit(
        &mut self,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<(), vk::Result> {
        debug_assert!(!self.submitted, "fence submitted twice");
        let submit_info =
            vk::SubmitInfo::default().command_buffers(command_buffers);
        // SAFETY: the fence is unsignaled and unused; the caller vouches for
        // the command buffers.
        unsafe {
            self.parent.compute_queue_submit(
                std::slice::from_ref(&submit_info),
                self.handle,
            )
        }?;
        self.submitted = true;
        Ok(())
    }

    /// Block until the submission completes or the device's wait timeout
    /// elapses.
    pub fn wait(&self) -> Result<(), WaitFenceError> {
        if !self.submitted {
            return Err(WaitFenceError::NotSubmitted);
        }
        let _span =
            tracing::debug_span!("fence_wait", fence = ?self.handle).entered();
        // SAFETY: handle is a valid fence created from parent.
        unsafe {
            self.parent.wait_for_raw_fences(
                &[self.handle],
                true,
                self.parent.wait_timeout_ns(),
            )
        }
        // ash reports VK_TIMEOUT as an error code.
        .map_err(|e| match e {
            vk::Result::TIMEOUT => WaitFenceError::Timeout,
            e => WaitFenceError::Vulkan(e),
        })
    }

    /// Non-blocking completion check.
    pub fn is_signaled(&self) -> Result<bool, WaitFenceError> {
        if !self.submitted {
            return Err(WaitFenceError::NotSubmitted);
        }
        // SAFETY: handle is a valid fence created from parent.
        unsafe { self.parent.get_raw_fence_status(self.handle) }
            .map_err(WaitFenceError::Vulkan)
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        // SAFETY: handle was created from parent. Owners keep a fence alive
        // while its submission may still be pending.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}
