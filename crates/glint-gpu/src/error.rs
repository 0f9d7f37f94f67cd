//! GPU error types.

use thiserror::Error;

/// Errors from the Vulkan abstraction layer.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Raw Vulkan error
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Memory allocation failed
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Operation attempted in an invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unsupported format or texture configuration
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Other GPU error
    #[error("{0}")]
    Other(String),
}

/// Result type alias using GpuError.
pub type Result<T> = std::result::Result<T, GpuError>;
