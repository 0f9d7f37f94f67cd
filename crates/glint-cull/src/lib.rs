//! Forward+ clustered light, decal, and probe culling.
//!
//! This crate provides:
//! - The GPU packing contract for the global light/decal/probe buffer
//! - Exponential depth slicing and CPU cluster binning
//! - A per-camera grid cache with same-frame generation rotation
//! - The [`ForwardClustered`] orchestrator that turns visible object
//!   lists into the two per-camera GPU inputs
//!
//! The grid is rebuilt only when a camera's pose, frame, or culling key
//! changes; binning runs data-parallel over depth slices and the hot path
//! allocates nothing once the scratch arenas are warm.

pub mod cache;
pub mod cluster;
pub mod forward;
pub mod layout;

pub use cache::{CachedGrid, Checkout, GridCache, ASPECT_RATIO_TOLERANCE, STALE_FRAME_EVICTION_AGE};
pub use cluster::{
    compute_slice_regions, BinBounds, ClusterGridConfig, SliceBins, SliceDistribution, SliceRegion,
};
pub use forward::{ForwardClustered, GridBufferPair, GridStaging, VisibleObjects};
pub use layout::{
    calculate_bytes_needed, GpuDecalRecord, GpuLightRecord, GpuProbeRecord, ObjectCounts,
    PackingView, DECAL_FLOAT4_SLOTS, LIGHT_FLOAT4_SLOTS, PROBE_FLOAT4_SLOTS,
};
