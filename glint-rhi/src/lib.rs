//! Glint RHI (Render Hardware Interface) - Pure Vulkan backend.
//!
//! GPU resource and frame lifecycle management: device/queue handles,
//! buffer allocation and host/device transfer, and the presentation
//! surface's acquire/present/recreate cycle.

pub mod alloc;
pub mod buffer;
pub mod core;
pub mod device;
pub mod error;
pub mod queue;
pub mod scope;
pub mod surface;
mod utility;

pub use ash::{Device, vk};

pub use alloc::{Allocation, AllocationCreate, AllocationCreateInfo, DeviceAllocator, MemoryUsage};
pub use buffer::{Buffer, MapFlag, MapFlags, MappableBuffer, StagedBuffer};
pub use crate::core::{PhysicalDevice, RhiCore, device_type_rank, select_physical_device};
pub use device::{DeviceBundle, DeviceDesc};
pub use error::{RhiError, RhiResult};
pub use queue::QueueHandle;
pub use scope::{RuntimeScope, ScopeChild};
pub use surface::{
    DEFAULT_IN_FLIGHT_TIMEOUT_NS, FrameBundle, PresentationSurface, PresentationSurfaceBuilder,
    SurfaceWindow,
};
