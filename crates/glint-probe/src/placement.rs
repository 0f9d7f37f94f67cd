//! Automatic probe placement over a uniform grid.
//!
//! [`PccPerPixelGridPlacement`] fills a region with pooled probes in two
//! phases. `build_start` lays probes on a regular grid and captures the
//! scene once; the capture encodes per-face scene depth into the last
//! mip's alpha channel. `build_end` reads those depths back and shrinks
//! each probe's area to the space its camera actually sees, snapping
//! near-misses to the region bounds, then renders the final captures.

use glam::{Mat3, Vec3};
use glint_core::math::Aabb;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{
    ReadbackImage, ReadbackTicket, RenderBackend, TextureDesc, TextureFormat,
};
use crate::error::Result;
use crate::manager::PccManager;
use crate::probe::ProbeId;

/// Margin applied to the depth-refined area so geometry right at the
/// measured boundary still falls inside the probe.
const DEPTH_MARGIN: f32 = 1.01;

/// Readback faces follow cubemap order: +X, -X, +Y, -Y, +Z, -Z.
const NUM_CUBE_FACES: u32 = 6;

/// Grid-based probe placement with depth-driven area refinement.
pub struct PccPerPixelGridPlacement {
    full_region: Aabb,
    overlap: Vec3,
    snap_deviation_error: Vec3,
    snap_sides_delta_min: Vec3,
    snap_sides_delta_max: Vec3,
    num_probes: (u32, u32, u32),
    format: TextureFormat,
    probe_ids: Vec<ProbeId>,
    tickets: Vec<ReadbackTicket>,
}

impl Default for PccPerPixelGridPlacement {
    fn default() -> Self {
        Self {
            full_region: Aabb::new(Vec3::ZERO, Vec3::ONE),
            overlap: Vec3::splat(1.5),
            snap_deviation_error: Vec3::splat(0.05),
            snap_sides_delta_min: Vec3::splat(0.25),
            snap_sides_delta_max: Vec3::splat(0.25),
            num_probes: (2, 2, 2),
            format: TextureFormat::Rgba8Unorm,
            probe_ids: Vec::new(),
            tickets: Vec::new(),
        }
    }
}

impl PccPerPixelGridPlacement {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between `build_start` and `build_end`.
    pub fn is_building(&self) -> bool {
        !self.tickets.is_empty()
    }

    fn assert_not_building(&self) {
        assert!(
            !self.is_building(),
            "cannot change parameters while a build is in flight"
        );
    }

    /// The world region the probe grid covers.
    pub fn set_full_region(&mut self, full_region: Aabb) {
        self.assert_not_building();
        self.full_region = full_region;
    }

    pub fn full_region(&self) -> &Aabb {
        &self.full_region
    }

    /// Per-axis factor by which neighbouring probe areas overlap; 1 tiles
    /// the region exactly, larger values blend across cell borders.
    pub fn set_overlap(&mut self, overlap: Vec3) {
        self.assert_not_building();
        self.overlap = overlap;
    }

    pub fn overlap(&self) -> Vec3 {
        self.overlap
    }

    /// Relative deviation below which a refined bound collapses onto the
    /// full region's bound.
    pub fn set_snap_deviation_error(&mut self, deviation: Vec3) {
        self.assert_not_building();
        self.snap_deviation_error = deviation;
    }

    pub fn snap_deviation_error(&self) -> Vec3 {
        self.snap_deviation_error
    }

    /// Tolerances for snapping edge probes' outer bounds to the region,
    /// separately for the min and max corners.
    pub fn set_snap_sides_delta(&mut self, delta_min: Vec3, delta_max: Vec3) {
        self.assert_not_building();
        self.snap_sides_delta_min = delta_min;
        self.snap_sides_delta_max = delta_max;
    }

    pub fn snap_sides_delta_min(&self) -> Vec3 {
        self.snap_sides_delta_min
    }

    pub fn snap_sides_delta_max(&self) -> Vec3 {
        self.snap_sides_delta_max
    }

    pub fn set_num_probes(&mut self, num_probes: (u32, u32, u32)) {
        self.assert_not_building();
        assert!(
            num_probes.0 >= 1 && num_probes.1 >= 1 && num_probes.2 >= 1,
            "probe grid needs at least one cell per axis"
        );
        self.num_probes = num_probes;
    }

    pub fn num_probes(&self) -> (u32, u32, u32) {
        self.num_probes
    }

    pub fn max_num_probes(&self) -> u32 {
        self.num_probes.0 * self.num_probes.1 * self.num_probes.2
    }

    pub fn set_pixel_format(&mut self, format: TextureFormat) {
        self.assert_not_building();
        self.format = format;
    }

    pub fn pixel_format(&self) -> TextureFormat {
        self.format
    }

    /// Snapshot of every tunable, for persistence tooling.
    pub fn params(&self) -> PlacementParams {
        PlacementParams {
            full_region_center: self.full_region.center.to_array(),
            full_region_half_size: self.full_region.half_size.to_array(),
            overlap: self.overlap.to_array(),
            snap_deviation_error: self.snap_deviation_error.to_array(),
            snap_sides_delta_min: self.snap_sides_delta_min.to_array(),
            snap_sides_delta_max: self.snap_sides_delta_max.to_array(),
            num_probes: [self.num_probes.0, self.num_probes.1, self.num_probes.2],
            pixel_format: self.format,
        }
    }

    /// Apply a stored parameter set in one call.
    pub fn apply_params(&mut self, params: &PlacementParams) {
        self.set_full_region(Aabb::new(
            Vec3::from_array(params.full_region_center),
            Vec3::from_array(params.full_region_half_size),
        ));
        self.set_overlap(Vec3::from_array(params.overlap));
        self.set_snap_deviation_error(Vec3::from_array(params.snap_deviation_error));
        self.set_snap_sides_delta(
            Vec3::from_array(params.snap_sides_delta_min),
            Vec3::from_array(params.snap_sides_delta_max),
        );
        self.set_num_probes((params.num_probes[0], params.num_probes[1], params.num_probes[2]));
        self.set_pixel_format(params.pixel_format);
    }

    /// Probes created by the last build, in grid order (x fastest).
    pub fn probes(&self) -> &[ProbeId] {
        &self.probe_ids
    }

    /// Phase one: rebuild the manager's pool at `resolution` with one
    /// slice per grid cell, lay the probes out, render them, and queue
    /// the per-probe depth readbacks.
    pub fn build_start(
        &mut self,
        resolution: u32,
        pcc: &mut PccManager,
        backend: &mut dyn RenderBackend,
        camera_near: f32,
        camera_far: f32,
    ) -> Result<()> {
        assert!(!self.is_building(), "previous build still in flight");
        let (nx, ny, nz) = self.num_probes;
        let total = nx * ny * nz;
        debug!(probes = total, resolution, "building probe grid");

        pcc.destroy_all_probes(backend);
        pcc.set_enabled(backend, false, 0, 0, 0, self.format)?;
        pcc.set_enabled(backend, true, resolution, resolution, total, self.format)?;

        self.probe_ids.clear();
        let cell_count = Vec3::new(nx as f32, ny as f32, nz as f32);
        let full_size = self.full_region.half_size * 2.0;
        for i in 0..total {
            let grid = Vec3::new(
                (i % nx) as f32,
                ((i / nx) % ny) as f32,
                (i / (nx * ny)) as f32,
            );
            let fraction = (grid + Vec3::splat(0.5)) / cell_count;
            let camera_center = self.full_region.min() + fraction * full_size;
            let area = Aabb::new(
                camera_center,
                self.overlap * self.full_region.half_size / cell_count,
            );

            let id = pcc.create_probe();
            if let Some(probe) = pcc.probe_mut(id) {
                probe.set(
                    camera_center,
                    area,
                    Vec3::splat(0.05),
                    Mat3::IDENTITY,
                    self.full_region,
                );
            }
            pcc.set_texture_params(
                backend,
                id,
                TextureDesc::square(resolution, self.format),
                true,
            )?;
            pcc.init_workspace(backend, id, camera_near, camera_far, None, &[], 0x01)?;
            self.probe_ids.push(id);
        }

        pcc.set_depth_capture(true);
        pcc.update_all_dirty_probes(backend);
        self.tickets = pcc.take_depth_readbacks();
        Ok(())
    }

    /// Phase two: wait for the depth readbacks, refine every probe's area
    /// to what its capture saw, and render the final set.
    pub fn build_end(&mut self, pcc: &mut PccManager, backend: &mut dyn RenderBackend) {
        assert!(self.is_building(), "build_end without a build in flight");
        let tickets = std::mem::take(&mut self.tickets);
        let (nx, ny, _) = self.num_probes;

        // Mapping a whole cube at once is a backend capability; without it
        // (or with a paraboloid array spanning several probes) the faces
        // are staged out slice by slice.
        let needs_staging = !backend.can_map_more_than_one_slice()
            || (pcc.uses_dpm_2d_array() && self.probe_ids.len() > 1);

        for (i, (&id, &ticket)) in self.probe_ids.iter().zip(tickets.iter()).enumerate() {
            let image = if needs_staging {
                stage_slices(backend, ticket)
            } else {
                backend.wait_readback(ticket)
            };
            backend.destroy_readback(ticket);

            let mut alphas = [0.0_f32; NUM_CUBE_FACES as usize];
            for (face, alpha) in alphas.iter_mut().enumerate() {
                *alpha = image.alpha_at(0, 0, face as u32);
            }

            let Some(probe) = pcc.probe(id) else {
                continue;
            };
            let camera_center = probe.camera_pos();
            let camera_ls = *probe.inv_orientation() * (camera_center - self.full_region.center);

            let mut area = refine_area(camera_ls, self.full_region.half_size, &alphas);
            area.center += self.full_region.center;
            self.snap_to_full_region(&mut area);
            let index = i as u32;
            self.snap_to_sides((index % nx, (index / nx) % ny, index / (nx * ny)), &mut area);

            if let Some(probe) = pcc.probe_mut(id) {
                probe.set(
                    camera_center,
                    area,
                    Vec3::splat(0.5),
                    Mat3::IDENTITY,
                    self.full_region,
                );
            }
        }

        pcc.set_depth_capture(false);
        pcc.update_all_dirty_probes(backend);
    }

    /// Collapse refined bounds that land within the deviation tolerance
    /// of the full region's bounds.
    fn snap_to_full_region(&self, area: &mut Aabb) {
        let full_size = self.full_region.half_size * 2.0;
        let full_min = self.full_region.min();
        let full_max = self.full_region.max();
        let mut min = area.min();
        let mut max = area.max();
        for axis in 0..3 {
            if (full_min[axis] - min[axis]).abs() / full_size[axis]
                <= self.snap_deviation_error[axis]
            {
                min[axis] = full_min[axis];
            }
            if (full_max[axis] - max[axis]).abs() / full_size[axis]
                <= self.snap_deviation_error[axis]
            {
                max[axis] = full_max[axis];
            }
        }
        *area = Aabb::from_min_max(min, max);
    }

    /// Edge probes additionally snap their outward bounds to the region
    /// under looser per-side tolerances, so the grid's border stays
    /// covered even when the scene's walls sit short of the region.
    fn snap_to_sides(&self, grid_pos: (u32, u32, u32), area: &mut Aabb) {
        let count = [self.num_probes.0, self.num_probes.1, self.num_probes.2];
        let grid = [grid_pos.0, grid_pos.1, grid_pos.2];
        let full_size = self.full_region.half_size * 2.0;
        let full_min = self.full_region.min();
        let full_max = self.full_region.max();
        let mut min = area.min();
        let mut max = area.max();
        for axis in 0..3 {
            if grid[axis] == 0
                && (min[axis] - full_min[axis]).abs() / full_size[axis]
                    <= self.snap_sides_delta_min[axis]
            {
                min[axis] = full_min[axis];
            }
            if grid[axis] + 1 == count[axis]
                && (full_max[axis] - max[axis]).abs() / full_size[axis]
                    <= self.snap_sides_delta_max[axis]
            {
                max[axis] = full_max[axis];
            }
        }
        *area = Aabb::from_min_max(min, max);
    }
}

/// Serializable snapshot of the placement tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementParams {
    pub full_region_center: [f32; 3],
    pub full_region_half_size: [f32; 3],
    pub overlap: [f32; 3],
    pub snap_deviation_error: [f32; 3],
    pub snap_sides_delta_min: [f32; 3],
    pub snap_sides_delta_max: [f32; 3],
    pub num_probes: [u32; 3],
    pub pixel_format: TextureFormat,
}

/// Turn six per-face depth fractions into a probe-local area.
///
/// An alpha of 0.5 means the scene boundary sits exactly on the region
/// bound along that face's axis; smaller values pull the bound towards
/// the camera proportionally.
fn refine_area(camera_ls: Vec3, half: Vec3, alphas: &[f32; 6]) -> Aabb {
    let max = Vec3::new(
        camera_ls.x + (half.x - camera_ls.x) * alphas[0] * 2.0,
        camera_ls.y + (half.y - camera_ls.y) * alphas[2] * 2.0,
        camera_ls.z + (half.z - camera_ls.z) * alphas[4] * 2.0,
    );
    let min = Vec3::new(
        camera_ls.x + (-half.x - camera_ls.x) * alphas[1] * 2.0,
        camera_ls.y + (-half.y - camera_ls.y) * alphas[3] * 2.0,
        camera_ls.z + (-half.z - camera_ls.z) * alphas[5] * 2.0,
    );
    let mut area = Aabb::from_min_max(min, max);
    area.half_size *= DEPTH_MARGIN;
    area
}

/// Assemble a whole-cube image from per-slice readbacks.
fn stage_slices(backend: &mut dyn RenderBackend, ticket: ReadbackTicket) -> ReadbackImage {
    let mut data = Vec::new();
    let mut dims = (1, 1, TextureFormat::Rgba8Unorm);
    for slice in 0..NUM_CUBE_FACES {
        let image = backend.wait_readback_slice(ticket, slice);
        data.extend_from_slice(&image.data);
        dims = (image.width, image.height, image.format);
    }
    ReadbackImage {
        width: dims.0,
        height: dims.1,
        num_slices: NUM_CUBE_FACES,
        format: dims.2,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::MockBackend;
    use crate::manager::SlotStrategy;
    use approx::assert_abs_diff_eq;

    fn grid_manager() -> PccManager {
        PccManager::new(SlotStrategy::pooled(), "probe_capture")
    }

    #[test]
    fn depth_refinement_shrinks_areas_to_visible_space() {
        let mut backend = MockBackend::new();
        backend.face_alphas = [0.2; 6];
        let mut pcc = grid_manager();
        let mut placement = PccPerPixelGridPlacement::new();
        placement.set_num_probes((1, 1, 3));

        placement
            .build_start(64, &mut pcc, &mut backend, 0.5, 500.0)
            .unwrap();
        assert!(placement.is_building());
        assert_eq!(placement.probes().len(), 3);

        placement.build_end(&mut pcc, &mut backend);
        assert!(!placement.is_building());
        assert!(backend.tickets.is_empty());

        // Faces all reported depth fraction 0.2, so the middle probe's
        // bounds pull in to 0.4 of the region, by the margin and boundary
        // padding factors.
        let middle = pcc.probe(placement.probes()[1]).unwrap();
        let expected = 0.4 * 1.01 * 1.005;
        assert_abs_diff_eq!(middle.area().half_size.z, expected, epsilon = 1e-4);
        assert_abs_diff_eq!(middle.area().half_size.x, expected, epsilon = 1e-4);
        assert_abs_diff_eq!(middle.area().center.z, 0.0, epsilon = 1e-4);
        assert_eq!(middle.area_inner_region(), Vec3::splat(0.5));

        // Edge probes sit close enough to the region border for the side
        // snap to stretch their outward bound onto it.
        let first = pcc.probe(placement.probes()[0]).unwrap();
        assert!(first.area().min().z <= -1.0);
        let last = pcc.probe(placement.probes()[2]).unwrap();
        assert!(last.area().max().z >= 1.0);
    }

    #[test]
    fn staged_slice_reads_decode_like_whole_image_reads() {
        let mut backend = MockBackend::new();
        backend.face_alphas = [0.2; 6];
        backend.map_whole_image = false;
        let mut pcc = grid_manager();
        let mut placement = PccPerPixelGridPlacement::new();
        placement.set_num_probes((1, 1, 1));

        placement
            .build_start(32, &mut pcc, &mut backend, 0.5, 500.0)
            .unwrap();
        placement.build_end(&mut pcc, &mut backend);

        let probe = pcc.probe(placement.probes()[0]).unwrap();
        let expected = 0.4 * 1.01 * 1.005;
        assert_abs_diff_eq!(probe.area().half_size.x, expected, epsilon = 1e-4);
        assert_abs_diff_eq!(probe.area().half_size.y, expected, epsilon = 1e-4);
        assert_abs_diff_eq!(probe.area().half_size.z, expected, epsilon = 1e-4);
    }

    #[test]
    fn bounds_near_the_region_snap_onto_it() {
        let placement = PccPerPixelGridPlacement::new();
        let mut area = Aabb::from_min_max(
            Vec3::new(-0.92, 0.0, -0.5),
            Vec3::new(0.95, 0.5, 0.2),
        );
        placement.snap_to_full_region(&mut area);
        let min = area.min();
        let max = area.max();
        assert_abs_diff_eq!(min.x, -1.0);
        assert_abs_diff_eq!(max.x, 1.0);
        assert_abs_diff_eq!(min.y, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(max.y, 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(min.z, -0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(max.z, 0.2, epsilon = 1e-6);
    }

    #[test]
    fn params_snapshot_round_trips() {
        let mut placement = PccPerPixelGridPlacement::new();
        placement.set_full_region(Aabb::new(Vec3::ONE, Vec3::splat(4.0)));
        placement.set_overlap(Vec3::splat(1.2));
        placement.set_num_probes((3, 1, 2));

        let params = placement.params();
        let mut restored = PccPerPixelGridPlacement::new();
        restored.apply_params(&params);
        assert_eq!(restored.params(), params);
        assert_eq!(restored.num_probes(), (3, 1, 2));
        assert_eq!(restored.full_region().center, Vec3::ONE);
    }

    #[test]
    #[should_panic(expected = "build is in flight")]
    fn setters_reject_changes_mid_build() {
        let mut backend = MockBackend::new();
        let mut pcc = grid_manager();
        let mut placement = PccPerPixelGridPlacement::new();
        placement.set_num_probes((1, 1, 1));
        placement
            .build_start(32, &mut pcc, &mut backend, 0.5, 500.0)
            .unwrap();
        placement.set_num_probes((2, 2, 2));
    }
}
