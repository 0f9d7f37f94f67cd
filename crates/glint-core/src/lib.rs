//! Core types, math, and traits for the Glint engine.
//!
//! This crate provides the foundational types used throughout the engine:
//! - Bounding volumes and frustum math for culling
//! - Object identity, masks, and render-queue vocabulary
//! - Common error types

pub mod error;
pub mod math;
pub mod types;

pub use error::{Error, Result};
pub use math::{Aabb, Frustum};
pub use types::{
    CameraId, FrameCount, LightMask, RenderQueueId, ShadowNodeId, VisibilityMask, ALL_VISIBLE,
};

/// Engine-wide constants
pub mod constants {
    /// Number of faces in a cubemap texture
    pub const CUBEMAP_FACES: usize = 6;
    /// Frames the GPU may have in flight; a resource last used on frame N
    /// must survive until frame N + FRAMES_IN_FLIGHT has begun
    pub const FRAMES_IN_FLIGHT: u32 = 3;
}
