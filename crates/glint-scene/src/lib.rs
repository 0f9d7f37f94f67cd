//! Cameras, lights, decals, and probe proxies for the Glint engine.
//!
//! This crate holds the scene-side vocabulary of the lighting pipeline:
//! the camera (with pose extraction for cull caching), the light and decal
//! descriptions the grid builder bins, and the lightweight probe proxy the
//! reflection system keeps in sync for GPU-side culling.

pub mod camera;
pub mod decal;
pub mod light;
pub mod probe_proxy;

pub use camera::{Camera, CameraPose, CubemapFace};
pub use decal::Decal;
pub use light::{Light, LightType};
pub use probe_proxy::ProbeProxy;
