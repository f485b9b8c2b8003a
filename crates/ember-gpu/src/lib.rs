//! Device acquisition and frame pacing for the Ember renderer.
//!
//! This crate provides:
//! - GPU capability probing and two-pass physical device selection
//! - Logical device, queue and allocator setup
//! - Swapchain ownership with in-place recreation
//! - A three-slot frame ring driving the begin/end frame protocol
//! - Synchronously executed one-shot command buffers
//!
//! [`RenderCore`] ties these together for a single window.

pub mod capabilities;
pub mod command;
pub mod context;
pub mod error;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod ops;
pub mod render_core;
pub mod selection;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use capabilities::{DeviceProbe, GpuCapabilities, GpuVendor, SurfaceSupport, VulkanProbe};
pub use command::{record_layout_transition, LayoutTransition, OneShotExecutor};
pub use context::DeviceContext;
pub use error::{GpuError, Result};
pub use frame::{FrameInfo, FrameStatus, FrameSynchronizer, SlotState, MAX_FRAMES_IN_FLIGHT};
pub use instance::GpuInstance;
pub use memory::{GpuAllocator, GpuImage};
pub use ops::{DeviceOps, Submission};
pub use render_core::{RenderConfig, RenderCore};
pub use selection::{select_device, QueueFamilies, SelectedDevice, SelectionPolicy};
pub use surface::{Surface, SurfaceCapabilities, SurfaceSwapchain};
pub use swapchain::{PresentTarget, RebuildGate, SwapchainStatus};
pub use sync::FrameSync;

pub use ash;
