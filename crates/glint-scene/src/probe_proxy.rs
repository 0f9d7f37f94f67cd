//! Lightweight movable proxy a reflection probe keeps registered with the
//! scene for GPU-side culling.
//!
//! The probe itself owns textures and workspaces; the proxy carries only
//! what the grid builder packs into the per-camera probe records, and is
//! re-synced whenever the probe's parameters change.

use glam::{Mat3, Vec3};
use glint_core::math::Aabb;
use glint_core::types::{RenderQueueId, VisibilityMask, ALL_VISIBLE};

/// Culling proxy for one reflection probe.
#[derive(Debug, Clone)]
pub struct ProbeProxy {
    /// Geometric extent (world center + half-size, oriented by `orientation`)
    pub probe_shape: Aabb,
    pub orientation: Mat3,
    pub inv_orientation: Mat3,
    /// World position the cubemap was captured from
    pub cubemap_position: Vec3,
    /// Per-axis distance where the blend band starts
    pub inner_range: Vec3,
    /// Per-axis distance where the probe's influence ends
    pub outer_range: Vec3,
    /// Texture array slice bound to this probe, `u32::MAX` when unassigned
    pub texture_slice: u32,
    /// Tie-breaker when more probes overlap a cell than fit (1..=65535)
    pub priority: u16,
    pub visibility_mask: VisibilityMask,
    pub render_queue: RenderQueueId,
    /// Proxies are detached around full-scene clears and while disabled
    pub attached: bool,
    /// Static probes live in the scene's static partition
    pub in_static_partition: bool,
}

impl Default for ProbeProxy {
    fn default() -> Self {
        Self {
            probe_shape: Aabb::new(Vec3::ZERO, Vec3::ONE),
            orientation: Mat3::IDENTITY,
            inv_orientation: Mat3::IDENTITY,
            cubemap_position: Vec3::ZERO,
            inner_range: Vec3::ZERO,
            outer_range: Vec3::ONE,
            texture_slice: u32::MAX,
            priority: 10,
            visibility_mask: ALL_VISIBLE,
            render_queue: RenderQueueId::PROBE_FIRST,
            attached: false,
            in_static_partition: true,
        }
    }
}

impl ProbeProxy {
    /// Cubemap capture position in probe-local space, relative to the shape
    /// center. This is the `cubemapPosLS` lane of the packed probe record.
    #[inline]
    pub fn cubemap_position_ls(&self) -> Vec3 {
        self.inv_orientation * (self.cubemap_position - self.probe_shape.center)
    }

    /// Axis-aligned world bounds of the oriented shape.
    pub fn world_aabb(&self) -> Aabb {
        let abs = Mat3::from_cols(
            self.orientation.x_axis.abs(),
            self.orientation.y_axis.abs(),
            self.orientation.z_axis.abs(),
        );
        Aabb::new(self.probe_shape.center, abs * self.probe_shape.half_size)
    }
}
