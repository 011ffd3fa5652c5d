//! Error types shared across the RHI.

use ash::vk;

/// Errors surfaced by the RHI.
///
/// Fallback conditions (unsupported format, suboptimal swapchain) are not
/// errors; they are reported through return values and log diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum RhiError {
    /// Operation attempted on an object in its default/invalid state.
    #[error("invalid resource: {0}")]
    InvalidResource(&'static str),

    /// A byte count exceeded the capacity of the target resource.
    #[error("requested {requested} bytes, capacity is {capacity}")]
    OutOfRange { requested: u64, capacity: u64 },

    /// Incorrect call sequence or configuration detected up front.
    #[error("usage error: {0}")]
    Usage(String),

    /// The surface reports no supported formats at all.
    #[error("surface reports zero supported formats")]
    NoSurfaceFormats,

    /// A bounded fence wait expired.
    #[error("timed out after {0} ns waiting on an in-flight fence")]
    Timeout(u64),

    /// Failure propagated from the Vulkan API.
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

pub type RhiResult<T> = Result<T, RhiError>;
