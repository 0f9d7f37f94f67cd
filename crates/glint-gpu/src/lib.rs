//! Vulkan abstraction layer for the Glint engine.
//!
//! This crate provides:
//! - Memory allocation via gpu-allocator
//! - Persistent-mapped buffers for the per-camera grid uploads
//! - Cubemap and cubemap-array texture creation for the probe pools
//! - Deferred resource deletion for frames-in-flight safety
//! - Blocking GPU-to-CPU readback tickets for probe depth capture

pub mod deferred;
pub mod error;
pub mod memory;
pub mod readback;

pub use deferred::{DeferredDeletionQueue, DeferredResource};
pub use error::{GpuError, Result};
pub use gpu_allocator::MemoryLocation;
pub use memory::{full_mip_count, GpuAllocator, GpuBuffer, GpuImage, SharedAllocator};
pub use readback::{ReadbackRegion, SliceReadback};
