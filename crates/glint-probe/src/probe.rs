//! A single parallax-corrected cubemap probe.
//!
//! A probe captures the scene from a fixed point into a cubemap and
//! declares two oriented boxes: the `probe_shape` the shader intersects
//! reflection rays against, and the `area` whose blend band (driven by
//! `area_inner_region`) controls how strongly the probe applies. In
//! pooled automatic mode the probe borrows a slice of the manager's
//! cubemap array; in manual mode it owns its cube texture and renderables
//! bind it through a refcounted [`ProbeBinding`].

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec3, Vec4};
use glint_core::math::Aabb;
use glint_core::types::{VisibilityMask, ALL_VISIBLE};
use glint_gpu::{GpuBuffer, SharedAllocator};
use glint_scene::{Camera, ProbeProxy};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{TextureDesc, TextureHandle, WorkspaceId};

/// Safety margin multiplied into both probe boxes when stored, so geometry
/// lying exactly on a boundary still resolves inside it.
pub const PROBE_PADDING: f32 = 1.005;

/// Keeps the NDF division finite when the inner region touches the edge.
pub const NDF_EPSILON: f32 = 1e-6;

/// Shrink factor applied to an area that must be forced back inside its
/// probe shape.
const AREA_CORRECTION_SCALE: f32 = 0.98;

/// Sentinel for "no cubemap array slice assigned".
pub const INVALID_SLICE: u32 = u32::MAX;

/// Identifies a probe within the manager that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(pub u64);

/// Refcount and lazily created constant buffer shared by every
/// [`ProbeBinding`] of one probe.
#[derive(Default)]
pub(crate) struct BindingState {
    pub(crate) count: u32,
    pub(crate) const_buffer: Option<GpuBuffer>,
}

/// One reflection probe.
///
/// Constructed through `PccManager::create_probe`; all operations that
/// touch GPU resources (textures, workspaces, slots) live on the manager,
/// which owns the backend seam. The probe itself holds the geometric
/// state and the capture camera.
pub struct CubemapProbe {
    pub(crate) id: ProbeId,
    pub(crate) automatic: bool,

    pub(crate) camera_pos: Vec3,
    pub(crate) area: Aabb,
    pub(crate) area_inner_region: Vec3,
    pub(crate) orientation: Mat3,
    pub(crate) inv_orientation: Mat3,
    pub(crate) probe_shape: Aabb,

    pub(crate) texture: Option<TextureHandle>,
    pub(crate) texture_slice: u32,
    pub(crate) texture_params: Option<TextureDesc>,
    pub(crate) tmp_rtt: Option<TextureHandle>,
    pub(crate) workspace: Option<WorkspaceId>,
    pub(crate) clear_workspace: Option<WorkspaceId>,
    pub(crate) workspace_def_override: Option<String>,
    pub(crate) additional_channels: Vec<TextureHandle>,
    pub(crate) mipmaps_exec_mask: u8,
    pub(crate) camera: Option<Camera>,
    pub(crate) camera_planes: (f32, f32),
    /// Set while the pool is disabled so `set_enabled(true)` knows which
    /// probes to re-initialize.
    pub(crate) reinit_pending: bool,

    pub(crate) proxy: ProbeProxy,
    pub(crate) binding: Arc<Mutex<BindingState>>,

    pub(crate) is_static: bool,
    pub(crate) enabled: bool,
    pub(crate) dirty: bool,
    pub(crate) num_iterations: u16,
    pub(crate) priority: u16,
    pub(crate) mask: VisibilityMask,
}

impl CubemapProbe {
    pub(crate) fn new(id: ProbeId, automatic: bool) -> Self {
        Self {
            id,
            automatic,
            camera_pos: Vec3::ZERO,
            area: Aabb::new(Vec3::ZERO, Vec3::ZERO),
            area_inner_region: Vec3::ZERO,
            orientation: Mat3::IDENTITY,
            inv_orientation: Mat3::IDENTITY,
            probe_shape: Aabb::new(Vec3::ZERO, Vec3::ZERO),
            texture: None,
            texture_slice: INVALID_SLICE,
            texture_params: None,
            tmp_rtt: None,
            workspace: None,
            clear_workspace: None,
            workspace_def_override: None,
            additional_channels: Vec::new(),
            mipmaps_exec_mask: 0x01,
            camera: None,
            camera_planes: (0.5, 1000.0),
            reinit_pending: false,
            proxy: ProbeProxy::default(),
            binding: Arc::new(Mutex::new(BindingState::default())),
            is_static: true,
            enabled: true,
            dirty: true,
            num_iterations: 8,
            priority: 10,
            mask: ALL_VISIBLE,
        }
    }

    /// Reconfigure the probe's capture point and boxes.
    ///
    /// The inner region is clamped to `[0, 1]` per axis. An `area` that is
    /// not fully contained by `probe_shape` produces visible artifacts, so
    /// it is shrunk about its own center and clamped back inside before
    /// anything is stored. Both boxes then receive the boundary padding.
    /// The stored state is a pure function of the arguments, so repeated
    /// identical calls are stable.
    pub fn set(
        &mut self,
        camera_pos: Vec3,
        area: Aabb,
        area_inner_region: Vec3,
        orientation: Mat3,
        probe_shape: Aabb,
    ) {
        let inner_region = area_inner_region.clamp(Vec3::ZERO, Vec3::ONE);

        let mut area = area;
        if !probe_shape.contains_aabb(&area) {
            warn!(
                probe = self.id.0,
                "probe area is not fully inside the probe shape, shrinking it to fit"
            );
            let shrunk = Aabb::new(area.center, area.half_size * AREA_CORRECTION_SCALE);
            area = shrunk.clamped_to(&probe_shape);
        }

        self.camera_pos = camera_pos;
        self.area = Aabb::new(area.center, area.half_size * PROBE_PADDING);
        self.area_inner_region = inner_region;
        self.orientation = orientation;
        self.inv_orientation = orientation.inverse();
        self.probe_shape = Aabb::new(probe_shape.center, probe_shape.half_size * PROBE_PADDING);
        self.sync_proxy();
        self.dirty = true;
    }

    /// Normalized distance function at a probe-local position.
    ///
    /// `<= 0` inside the inner region, `(0, 1)` in the blend band, `>= 1`
    /// at and beyond the area boundary. Chebyshev-style: the largest of
    /// the per-axis distances wins.
    pub fn ndf(&self, pos_ls: Vec3) -> f32 {
        let distance = pos_ls.abs();
        let inner = self.area.half_size * self.area_inner_region;
        let outer = self.area.half_size;
        let ndf = (distance - inner) / (outer - inner + Vec3::splat(NDF_EPSILON));
        ndf.max_element()
    }

    /// The area box recentered on the probe-local origin.
    pub fn area_ls(&self) -> Aabb {
        Aabb::new(Vec3::ZERO, self.area.half_size)
    }

    /// Push the probe's state into its culling proxy.
    pub(crate) fn sync_proxy(&mut self) {
        self.proxy.probe_shape = self.probe_shape;
        self.proxy.orientation = self.orientation;
        self.proxy.inv_orientation = self.inv_orientation;
        self.proxy.cubemap_position = self.camera_pos;
        self.proxy.inner_range = self.area.half_size * self.area_inner_region;
        self.proxy.outer_range = self.area.half_size;
        self.proxy.texture_slice = self.texture_slice;
        self.proxy.visibility_mask = self.mask;
        self.proxy.priority = self.priority;
        self.proxy.in_static_partition = self.is_static;
    }

    /// Move the capture camera to the probe and, for static probes, make
    /// it visible to light culling again for the upcoming render.
    pub(crate) fn prepare_for_rendering(&mut self) {
        let orientation = self.orientation;
        let position = self.camera_pos;
        let is_static = self.is_static;
        if let Some(camera) = &mut self.camera {
            camera.position = position;
            camera.direction = orientation * Vec3::NEG_Z;
            camera.up = orientation * Vec3::Y;
            if is_static {
                camera.light_culling_enabled = true;
            }
        }
    }

    /// Register a renderable as a user of this manual probe.
    ///
    /// The first live binding lazily allocates the probe's shader constant
    /// buffer; dropping the last one frees it. The probe must outlive its
    /// bindings: destroying it while any are alive is a contract violation.
    pub fn bind(&self, allocator: &SharedAllocator) -> crate::error::Result<ProbeBinding> {
        assert!(
            !self.automatic,
            "bindings are only used with manually managed probes"
        );
        let mut state = self.binding.lock();
        if state.const_buffer.is_none() {
            let buffer = allocator.lock().create_const_buffer(
                ManualProbeBlock::SIZE as u64,
                "probe_manual_constants",
            )?;
            state.const_buffer = Some(buffer);
        }
        state.count += 1;
        Ok(ProbeBinding {
            state: Arc::clone(&self.binding),
            allocator: Arc::clone(allocator),
        })
    }

    /// True while any [`ProbeBinding`] for this probe is alive.
    pub fn has_live_bindings(&self) -> bool {
        self.binding.lock().count > 0
    }

    /// Run `f` against the manual constant buffer, if one exists.
    pub fn with_manual_const_buffer<R>(&self, f: impl FnOnce(&GpuBuffer) -> R) -> Option<R> {
        let state = self.binding.lock();
        state.const_buffer.as_ref().map(f)
    }

    /// Snapshot of the configuration surface, for export tooling.
    pub fn descriptor(&self) -> ProbeDescriptor {
        ProbeDescriptor {
            camera_pos: self.camera_pos.to_array(),
            area_center: self.area.center.to_array(),
            area_half_size: self.area.half_size.to_array(),
            area_inner_region: self.area_inner_region.to_array(),
            orientation: self.orientation.to_cols_array_2d(),
            shape_center: self.probe_shape.center.to_array(),
            shape_half_size: self.probe_shape.half_size.to_array(),
            is_static: self.is_static,
            enabled: self.enabled,
            num_iterations: self.num_iterations,
            priority: self.priority,
            visibility_mask: self.mask,
            texture_slice: (self.texture_slice != INVALID_SLICE).then_some(self.texture_slice),
        }
    }

    pub fn id(&self) -> ProbeId {
        self.id
    }

    pub fn camera_pos(&self) -> Vec3 {
        self.camera_pos
    }

    pub fn area(&self) -> &Aabb {
        &self.area
    }

    pub fn area_inner_region(&self) -> Vec3 {
        self.area_inner_region
    }

    pub fn orientation(&self) -> &Mat3 {
        &self.orientation
    }

    pub fn inv_orientation(&self) -> &Mat3 {
        &self.inv_orientation
    }

    pub fn probe_shape(&self) -> &Aabb {
        &self.probe_shape
    }

    pub fn proxy(&self) -> &ProbeProxy {
        &self.proxy
    }

    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    pub fn texture_slice(&self) -> u32 {
        self.texture_slice
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable the probe without releasing its resources.
    pub fn set_probe_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Request a re-render on the next update pass.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// A workspace exists and the probe can render.
    pub fn is_initialized(&self) -> bool {
        self.workspace.is_some()
    }

    pub fn num_iterations(&self) -> u16 {
        self.num_iterations
    }

    /// How many capture frames this probe needs to converge. Probes above
    /// the expensive-update threshold render this many full frames.
    pub fn set_num_iterations(&mut self, num_iterations: u16) {
        self.num_iterations = num_iterations.max(1);
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    /// Relative influence when overlapping probes blend per pixel; higher
    /// wins more weight. Zero is clamped into the valid `1..=65535` range.
    pub fn set_priority(&mut self, priority: u16) {
        self.priority = priority.max(1);
        self.proxy.priority = self.priority;
    }

    pub fn visibility_mask(&self) -> VisibilityMask {
        self.mask
    }

    pub fn set_visibility_mask(&mut self, mask: VisibilityMask) {
        self.mask = mask;
        self.proxy.visibility_mask = mask;
    }

    pub fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }
}

/// RAII registration of a renderable against a manual probe.
///
/// Holds the probe's binding state alive independently of the manager's
/// borrow rules, so datablocks can keep the guard across frames.
pub struct ProbeBinding {
    state: Arc<Mutex<BindingState>>,
    allocator: SharedAllocator,
}

impl Drop for ProbeBinding {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.count -= 1;
        if state.count == 0 {
            if let Some(mut buffer) = state.const_buffer.take() {
                if let Err(err) = self.allocator.lock().free_buffer(&mut buffer) {
                    warn!(error = %err, "failed to free a manual probe constant buffer");
                }
            }
        }
    }
}

/// Serializable snapshot of one probe's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeDescriptor {
    pub camera_pos: [f32; 3],
    pub area_center: [f32; 3],
    pub area_half_size: [f32; 3],
    pub area_inner_region: [f32; 3],
    /// Column-major 3x3 orientation
    pub orientation: [[f32; 3]; 3],
    pub shape_center: [f32; 3],
    pub shape_half_size: [f32; 3],
    pub is_static: bool,
    pub enabled: bool,
    pub num_iterations: u16,
    pub priority: u16,
    pub visibility_mask: VisibilityMask,
    pub texture_slice: Option<u32>,
}

/// Shader constant block bound per manually managed probe: the view-space
/// to probe-local rows, shape half-size and local capture position.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ManualProbeBlock {
    /// Rows of `inv_orientation * inv_view3`; w lanes carry the
    /// view-space probe-shape center.
    pub row0_center_x: Vec4,
    pub row1_center_y: Vec4,
    pub row2_center_z: Vec4,
    /// Probe-shape half size (w = 1).
    pub half_size: Vec4,
    /// Capture position in probe-local space (w = 1).
    pub cubemap_pos_ls: Vec4,
    pub reserved: Vec4,
}

impl ManualProbeBlock {
    pub const SIZE: usize = 96;

    pub fn from_probe(probe: &CubemapProbe, view: &Mat4, inv_view3: &Mat3) -> Self {
        let view_to_local = probe.inv_orientation * *inv_view3;
        let center_vs = view.transform_point3(probe.probe_shape.center);
        let pos_ls = probe.inv_orientation * (probe.camera_pos - probe.probe_shape.center);

        Self {
            row0_center_x: view_to_local.row(0).extend(center_vs.x),
            row1_center_y: view_to_local.row(1).extend(center_vs.y),
            row2_center_z: view_to_local.row(2).extend(center_vs.z),
            half_size: probe.probe_shape.half_size.extend(1.0),
            cubemap_pos_ls: pos_ls.extend(1.0),
            reserved: Vec4::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn probe_with_area(half_size: Vec3, inner_region: Vec3) -> CubemapProbe {
        let mut probe = CubemapProbe::new(ProbeId(1), false);
        probe.set(
            Vec3::ZERO,
            Aabb::new(Vec3::ZERO, half_size),
            inner_region,
            Mat3::IDENTITY,
            Aabb::new(Vec3::ZERO, half_size * 2.0),
        );
        probe
    }

    #[test]
    fn ndf_is_monotonic_along_a_ray() {
        let probe = probe_with_area(Vec3::new(2.0, 3.0, 4.0), Vec3::splat(0.5));

        let mut previous = f32::NEG_INFINITY;
        for step in 0..=40 {
            let t = step as f32 / 40.0 * 3.0;
            let value = probe.ndf(Vec3::new(t, 0.0, 0.0));
            assert!(
                value >= previous,
                "ndf went down from {previous} to {value} at t={t}"
            );
            previous = value;
        }
    }

    #[test]
    fn ndf_signs_match_the_regions() {
        let probe = probe_with_area(Vec3::splat(2.0), Vec3::splat(0.5));
        let outer = probe.area().half_size.x;
        let inner = outer * 0.5;

        assert!(probe.ndf(Vec3::ZERO) <= 0.0);
        assert!(probe.ndf(Vec3::new(inner * 0.99, 0.0, 0.0)) <= 0.0);
        let in_band = probe.ndf(Vec3::new((inner + outer) * 0.5, 0.0, 0.0));
        assert!(in_band > 0.0 && in_band < 1.0);
        assert_relative_eq!(probe.ndf(Vec3::new(outer, 0.0, 0.0)), 1.0, epsilon = 1e-4);
        assert!(probe.ndf(Vec3::new(outer * 1.5, 0.0, 0.0)) > 1.0);
    }

    #[test]
    fn set_is_stable_under_repeated_identical_calls() {
        let mut probe = CubemapProbe::new(ProbeId(7), false);
        let area = Aabb::new(Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0));
        let shape = Aabb::new(Vec3::new(1.0, 2.0, 3.0), Vec3::new(8.0, 9.0, 10.0));
        let orientation = Mat3::from_rotation_y(0.3);

        probe.set(Vec3::ONE, area, Vec3::splat(0.25), orientation, shape);
        let first_area = *probe.area();
        let first_shape = *probe.probe_shape();

        for _ in 0..5 {
            probe.set(Vec3::ONE, area, Vec3::splat(0.25), orientation, shape);
        }

        assert_eq!(probe.area().center, first_area.center);
        assert_eq!(probe.area().half_size, first_area.half_size);
        assert_eq!(probe.probe_shape().half_size, first_shape.half_size);
    }

    #[test]
    fn oversized_area_is_forced_inside_the_shape() {
        let mut probe = CubemapProbe::new(ProbeId(2), false);
        let shape = Aabb::new(Vec3::ZERO, Vec3::splat(2.0));
        let area = Aabb::new(Vec3::new(1.0, 0.0, 0.0), Vec3::splat(2.0));

        probe.set(Vec3::ZERO, area, Vec3::splat(0.1), Mat3::IDENTITY, shape);

        // Undo the stored padding before checking containment against the
        // raw shape.
        let stored = Aabb::new(probe.area().center, probe.area().half_size / PROBE_PADDING);
        assert!(shape.contains_aabb(&stored));
    }

    #[test]
    fn inner_region_is_clamped_to_unit_range() {
        let probe = probe_with_area(Vec3::splat(1.0), Vec3::new(-2.0, 0.5, 7.0));
        assert_eq!(probe.area_inner_region(), Vec3::new(0.0, 0.5, 1.0));
    }

    #[test]
    fn manual_block_is_96_bytes_with_unit_w_lanes() {
        assert_eq!(std::mem::size_of::<ManualProbeBlock>(), 96);

        let probe = probe_with_area(Vec3::splat(1.0), Vec3::splat(0.5));
        let block = ManualProbeBlock::from_probe(&probe, &Mat4::IDENTITY, &Mat3::IDENTITY);
        assert_relative_eq!(block.half_size.w, 1.0);
        assert_relative_eq!(block.cubemap_pos_ls.w, 1.0);
    }

    #[test]
    fn proxy_tracks_blend_ranges() {
        let probe = probe_with_area(Vec3::splat(2.0), Vec3::splat(0.5));
        let proxy = probe.proxy();
        assert_eq!(proxy.outer_range, probe.area().half_size);
        assert_eq!(
            proxy.inner_range,
            probe.area().half_size * probe.area_inner_region()
        );
        assert_eq!(proxy.texture_slice, INVALID_SLICE);
    }

    #[test]
    fn priority_defaults_to_ten_and_rejects_zero() {
        let mut probe = CubemapProbe::new(ProbeId(3), false);
        assert_eq!(probe.priority(), 10);

        probe.set_priority(0);
        assert_eq!(probe.priority(), 1, "zero priority must clamp to one");

        probe.set_priority(500);
        assert_eq!(probe.proxy().priority, 500);
    }
}
