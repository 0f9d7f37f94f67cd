//! Parallax-corrected cubemap reflection probes.
//!
//! This crate provides:
//! - [`CubemapProbe`]: a capture point with an influence area, an inner
//!   blend region, and a parallax-correction shape
//! - [`PccManager`]: probe lifecycle, dirty tracking, and the iterative
//!   capture loop, with pooled-array or per-probe texture storage behind
//!   [`SlotStrategy`]
//! - Blend-probe selection and Lagarde weighting for manual-mode shading
//! - [`PccPerPixelGridPlacement`]: automatic grid placement with
//!   depth-readback area refinement
//! - The [`RenderBackend`] trait the manager drives, so probe logic stays
//!   independent of the compositor and GPU plumbing
//!
//! Cameras, probe proxies for culling, and GPU buffers come from
//! `glint-scene` and `glint-gpu`; the Forward+ pipeline in `glint-cull`
//! consumes the proxies this crate maintains.

pub mod backend;
pub mod blend;
pub mod error;
pub mod manager;
pub mod placement;
pub mod probe;

pub use backend::{
    ReadbackImage, ReadbackTicket, RenderBackend, TextureDesc, TextureFormat, TextureHandle,
    WorkspaceId, WorkspaceParams,
};
pub use blend::{collect_blend_probes, lagarde_weights, BlendSelection, MAX_BLEND_PROBES};
pub use error::{ProbeError, Result};
pub use manager::{
    PccManager, ProbeSamplerDesc, SlotStrategy, CLEAR_WORKSPACE_DEFINITION,
};
pub use placement::{PccPerPixelGridPlacement, PlacementParams};
pub use probe::{
    CubemapProbe, ManualProbeBlock, ProbeBinding, ProbeDescriptor, ProbeId, INVALID_SLICE,
    NDF_EPSILON, PROBE_PADDING,
};
