//! Synchronous Vulkan compute dispatch, built on [`ash`].
//!
//! The crate runs one compute kernel over two linear storage buffers and
//! moves data between host slices and device memory. Every operation that
//! touches the GPU blocks until that work has finished.
//!
//! # Object hierarchy
//!
//! ```text
//! Instance
//! └── Device (compute queue, memory-type table)
//!     ├── DeviceBuffer<T>            (buffer + memory, staging on demand)
//!     └── ComputeKernel
//!         ├── ShaderModule
//!         ├── DescriptorSetLayout → DescriptorPool → DescriptorSet
//!         ├── PipelineLayout / PipelineCache → ComputePipeline
//!         ├── CommandPool → CommandBuffer
//!         └── Fence
//! ```
//!
//! Each wrapper holds its parent via `Arc` so parents cannot be
//! destroyed while children are alive.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `cmd_*` | records a command into a command buffer   |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod instance;
pub mod kernel;
pub mod log;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod sync;
pub mod transfer;

pub use ash;
pub use buffer::{BufferDesc, BufferHandle, DeviceBuffer};
pub use device::{Device, DeviceConfig, DeviceSelection};
pub use instance::Instance;
pub use kernel::{ComputeKernel, KernelConfig, KernelParams};
pub use log::VulkanLogLevel;
