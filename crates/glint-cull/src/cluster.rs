//! Clustered grid geometry: depth-slice distribution, per-slice frustum
//! regions, and per-cell binning scratch.
//!
//! The view frustum is partitioned into `width x height` screen cells times
//! `num_slices` exponential depth slices. Binning assigns each visible
//! light/decal/probe to the cells its view-space bounds overlap; slices are
//! independent so they can be processed in parallel and merged by
//! concatenation.

use glam::{Vec3, Vec3A, Vec4};
use glint_core::{Aabb, Error, Result};
use glint_scene::Camera;
use serde::{Deserialize, Serialize};

/// Nudge applied inside `slice_at_depth` so that a depth produced by
/// `depth_at_slice(s)` lands exactly on slice `s` despite float rounding.
pub const SLICE_EPSILON: f32 = 1e-4;

/// Grid dimensions and per-cell capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterGridConfig {
    /// Screen cells along X.
    pub width: u32,
    /// Screen cells along Y.
    pub height: u32,
    /// Exponential depth slices.
    pub num_slices: u32,
    pub lights_per_cell: u32,
    pub decals_per_cell: u32,
    pub probes_per_cell: u32,
    /// Depth of the first slice boundary. Objects nearer still land in
    /// slice 0.
    pub min_distance: f32,
    pub max_distance: f32,
    pub decals_enabled: bool,
    pub probes_enabled: bool,
    /// Height of the light-profile (IES) texture used to encode profile
    /// indices into the packed light records.
    pub light_profile_tex_height: u32,
}

impl Default for ClusterGridConfig {
    fn default() -> Self {
        Self {
            width: 24,
            height: 16,
            num_slices: 24,
            lights_per_cell: 96,
            decals_per_cell: 32,
            probes_per_cell: 8,
            min_distance: 0.5,
            max_distance: 500.0,
            decals_enabled: true,
            probes_enabled: true,
            light_profile_tex_height: 1,
        }
    }
}

impl ClusterGridConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.num_slices == 0 {
            return Err(Error::InvalidConfig(format!(
                "Grid dimensions must be non-zero, got {}x{}x{}",
                self.width, self.height, self.num_slices
            )));
        }
        if self.lights_per_cell == 0 {
            return Err(Error::InvalidConfig(
                "lights_per_cell must be non-zero".to_string(),
            ));
        }
        if !(self.min_distance > 0.0) || !(self.max_distance > self.min_distance) {
            return Err(Error::InvalidConfig(format!(
                "Distance range [{}, {}] must satisfy 0 < min < max",
                self.min_distance, self.max_distance
            )));
        }
        if self.light_profile_tex_height == 0 {
            return Err(Error::InvalidConfig(
                "light_profile_tex_height must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn cells_per_slice(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    pub fn num_cells(&self) -> usize {
        self.cells_per_slice() * self.num_slices as usize
    }

    /// Flat cell index for `(x, y, slice)`.
    #[inline]
    pub fn cell_index(&self, x: u32, y: u32, slice: u32) -> usize {
        ((slice * self.height + y) * self.width + x) as usize
    }
}

/// Exponential depth-to-slice mapping.
///
/// Slice boundaries sit at `min * e^(k*s)` with `k = ln(max/min)/num_slices`,
/// so near slices are thin and far slices are thick.
#[derive(Debug, Clone, Copy)]
pub struct SliceDistribution {
    min_distance: f32,
    num_slices: u32,
    exponent_k: f32,
}

impl SliceDistribution {
    pub fn new(min_distance: f32, max_distance: f32, num_slices: u32) -> Self {
        debug_assert!(min_distance > 0.0 && max_distance > min_distance && num_slices > 0);
        Self {
            min_distance,
            num_slices,
            exponent_k: (max_distance / min_distance).ln() / num_slices as f32,
        }
    }

    /// View depth of slice boundary `slice`; `depth_at_slice(0)` is the
    /// minimum distance and `depth_at_slice(num_slices)` the maximum.
    #[inline]
    pub fn depth_at_slice(&self, slice: u32) -> f32 {
        self.min_distance * (self.exponent_k * slice as f32).exp()
    }

    /// Slice containing `depth`, clamped to `[0, num_slices)`.
    #[inline]
    pub fn slice_at_depth(&self, depth: f32) -> u32 {
        let depth = depth.max(self.min_distance);
        let slice = ((depth / self.min_distance).ln() / self.exponent_k + SLICE_EPSILON).floor();
        (slice as u32).min(self.num_slices - 1)
    }

    /// Inclusive slice range covering `[min_depth, max_depth]`.
    #[inline]
    pub fn slice_range(&self, min_depth: f32, max_depth: f32) -> (u32, u32) {
        (self.slice_at_depth(min_depth), self.slice_at_depth(max_depth))
    }
}

/// One depth slice's sub-frustum in view space: bounding planes, a bounding
/// box, and the eight corner points, laid out for 4-wide testing.
#[derive(Debug, Clone)]
pub struct SliceRegion {
    /// Inward-facing planes as `(normal, d)` rows; a point is inside when
    /// `dot(normal, p) + d >= 0` for all six.
    pub planes: [Vec4; 6],
    pub aabb: Aabb,
    pub corners: [Vec3A; 8],
}

impl SliceRegion {
    /// Region for the slice spanning depths `[near, far]` of a symmetric
    /// frustum with the given half-angle tangents. View space looks down -Z.
    pub fn new(near: f32, far: f32, tan_half_x: f32, tan_half_y: f32) -> Self {
        let (nx, ny) = (near * tan_half_x, near * tan_half_y);
        let (fx, fy) = (far * tan_half_x, far * tan_half_y);

        let corners = [
            Vec3A::new(-nx, -ny, -near),
            Vec3A::new(nx, -ny, -near),
            Vec3A::new(-nx, ny, -near),
            Vec3A::new(nx, ny, -near),
            Vec3A::new(-fx, -fy, -far),
            Vec3A::new(fx, -fy, -far),
            Vec3A::new(-fx, fy, -far),
            Vec3A::new(fx, fy, -far),
        ];

        let aabb = Aabb::from_min_max(Vec3::new(-fx, -fy, -far), Vec3::new(fx, fy, -near));

        // Side planes pass through the eye; near/far cap the depth range.
        let inv_len_x = 1.0 / (1.0 + tan_half_x * tan_half_x).sqrt();
        let inv_len_y = 1.0 / (1.0 + tan_half_y * tan_half_y).sqrt();
        let planes = [
            Vec4::new(0.0, 0.0, -1.0, -near),
            Vec4::new(0.0, 0.0, 1.0, far),
            Vec4::new(1.0, 0.0, -tan_half_x, 0.0) * inv_len_x,
            Vec4::new(-1.0, 0.0, -tan_half_x, 0.0) * inv_len_x,
            Vec4::new(0.0, 1.0, -tan_half_y, 0.0) * inv_len_y,
            Vec4::new(0.0, -1.0, -tan_half_y, 0.0) * inv_len_y,
        ];

        Self {
            planes,
            aabb,
            corners,
        }
    }

    /// Conservative intersection test against a view-space AABB.
    pub fn intersects(&self, aabb: &Aabb) -> bool {
        if !self.aabb.intersects(aabb) {
            return false;
        }

        // Positive-vertex test: reject when the AABB corner furthest along
        // a plane normal is still behind it.
        for plane in &self.planes {
            let normal = Vec3::new(plane.x, plane.y, plane.z);
            let positive = aabb.center + aabb.half_size * normal.signum();
            if normal.dot(positive) + plane.w < 0.0 {
                return false;
            }
        }

        true
    }

    /// Inclusive cell rectangle covered by `aabb` when this slice's bounding
    /// extent is subdivided into `width x height` cells.
    pub fn cell_range(&self, aabb: &Aabb, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let region_min = self.aabb.min();
        let region_size = self.aabb.size();

        let to_cell = |value: f32, min: f32, size: f32, cells: u32| -> u32 {
            let normalized = (value - min) / size;
            let cell = (normalized * cells as f32).floor();
            (cell.max(0.0) as u32).min(cells - 1)
        };

        let x0 = to_cell(aabb.min().x, region_min.x, region_size.x, width);
        let x1 = to_cell(aabb.max().x, region_min.x, region_size.x, width);
        let y0 = to_cell(aabb.min().y, region_min.y, region_size.y, height);
        let y1 = to_cell(aabb.max().y, region_min.y, region_size.y, height);

        (x0, x1, y0, y1)
    }
}

/// Precompute all slice regions for a camera.
pub fn compute_slice_regions(
    camera: &Camera,
    distribution: &SliceDistribution,
    num_slices: u32,
) -> Vec<SliceRegion> {
    let tan_half_y = (camera.fov * 0.5).tan();
    let tan_half_x = tan_half_y * camera.aspect;

    (0..num_slices)
        .map(|slice| {
            let near = distribution.depth_at_slice(slice);
            let far = distribution.depth_at_slice(slice + 1);
            SliceRegion::new(near, far, tan_half_x, tan_half_y)
        })
        .collect()
}

/// A binnable object: its packed-buffer index, view-space bounds, and the
/// precomputed slice range those bounds cover.
#[derive(Debug, Clone, Copy)]
pub struct BinBounds {
    pub index: u16,
    pub aabb: Aabb,
    pub slice_start: u32,
    pub slice_end: u32,
}

impl BinBounds {
    /// View-space bounds for a world AABB; `None` when the object sits
    /// entirely behind the near limit.
    pub fn from_world_aabb(
        index: u16,
        world: &Aabb,
        view: &glam::Mat4,
        distribution: &SliceDistribution,
    ) -> Option<Self> {
        let aabb = world.transformed(view);
        let min_depth = -aabb.max().z;
        let max_depth = -aabb.min().z;
        if max_depth <= 0.0 {
            return None;
        }

        let (slice_start, slice_end) = distribution.slice_range(min_depth.max(0.0), max_depth);
        Some(Self {
            index,
            aabb,
            slice_start,
            slice_end,
        })
    }
}

/// Per-slice binning output: fixed-stride index arrays plus per-cell counts.
///
/// Strides are the per-cell capacity limits, so inserting never allocates.
/// Cells keep objects in insertion order and silently drop overflow
/// first-come-first-served; `dropped` tallies the losses for diagnostics.
pub struct SliceBins {
    light_indices: Vec<u16>,
    decal_indices: Vec<u16>,
    probe_indices: Vec<u16>,
    light_counts: Vec<u16>,
    decal_counts: Vec<u16>,
    probe_counts: Vec<u16>,
    pub dropped: u32,
}

impl SliceBins {
    pub fn new(config: &ClusterGridConfig) -> Self {
        let cells = config.cells_per_slice();
        Self {
            light_indices: vec![0; cells * config.lights_per_cell as usize],
            decal_indices: vec![0; cells * config.decals_per_cell as usize],
            probe_indices: vec![0; cells * config.probes_per_cell as usize],
            light_counts: vec![0; cells],
            decal_counts: vec![0; cells],
            probe_counts: vec![0; cells],
            dropped: 0,
        }
    }

    pub fn clear(&mut self) {
        self.light_counts.fill(0);
        self.decal_counts.fill(0);
        self.probe_counts.fill(0);
        self.dropped = 0;
    }

    /// Bin every object whose slice range covers `slice` into this slice's
    /// cells.
    pub fn bin(
        &mut self,
        slice: u32,
        region: &SliceRegion,
        config: &ClusterGridConfig,
        lights: &[BinBounds],
        decals: &[BinBounds],
        probes: &[BinBounds],
    ) {
        Self::bin_kind(
            &mut self.light_indices,
            &mut self.light_counts,
            &mut self.dropped,
            config.lights_per_cell,
            slice,
            region,
            config,
            lights,
        );
        Self::bin_kind(
            &mut self.decal_indices,
            &mut self.decal_counts,
            &mut self.dropped,
            config.decals_per_cell,
            slice,
            region,
            config,
            decals,
        );
        Self::bin_kind(
            &mut self.probe_indices,
            &mut self.probe_counts,
            &mut self.dropped,
            config.probes_per_cell,
            slice,
            region,
            config,
            probes,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn bin_kind(
        indices: &mut [u16],
        counts: &mut [u16],
        dropped: &mut u32,
        per_cell: u32,
        slice: u32,
        region: &SliceRegion,
        config: &ClusterGridConfig,
        objects: &[BinBounds],
    ) {
        let stride = per_cell as usize;
        if stride == 0 {
            return;
        }

        for object in objects {
            if slice < object.slice_start || slice > object.slice_end {
                continue;
            }
            if !region.intersects(&object.aabb) {
                continue;
            }

            let (x0, x1, y0, y1) = region.cell_range(&object.aabb, config.width, config.height);
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let cell = (y * config.width + x) as usize;
                    let count = counts[cell] as usize;
                    if count < stride {
                        indices[cell * stride + count] = object.index;
                        counts[cell] += 1;
                    } else {
                        *dropped += 1;
                    }
                }
            }
        }
    }

    #[inline]
    pub fn cell_lights(&self, cell: usize, per_cell: u32) -> &[u16] {
        let stride = per_cell as usize;
        &self.light_indices[cell * stride..cell * stride + self.light_counts[cell] as usize]
    }

    #[inline]
    pub fn cell_decals(&self, cell: usize, per_cell: u32) -> &[u16] {
        let stride = per_cell as usize;
        &self.decal_indices[cell * stride..cell * stride + self.decal_counts[cell] as usize]
    }

    #[inline]
    pub fn cell_probes(&self, cell: usize, per_cell: u32) -> &[u16] {
        let stride = per_cell as usize;
        &self.probe_indices[cell * stride..cell * stride + self.probe_counts[cell] as usize]
    }

    #[inline]
    pub fn counts(&self, cell: usize) -> (u16, u16, u16) {
        (
            self.light_counts[cell],
            self.decal_counts[cell],
            self.probe_counts[cell],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_config() -> ClusterGridConfig {
        ClusterGridConfig {
            width: 4,
            height: 4,
            num_slices: 8,
            lights_per_cell: 4,
            decals_per_cell: 2,
            probes_per_cell: 2,
            min_distance: 0.5,
            max_distance: 100.0,
            ..ClusterGridConfig::default()
        }
    }

    #[test]
    fn slice_inversion_is_exact_for_every_slice() {
        for (min, max, slices) in [(0.5f32, 500.0f32, 24u32), (5.0, 500.0, 32), (0.1, 50.0, 8)] {
            let dist = SliceDistribution::new(min, max, slices);
            for s in 0..slices {
                let depth = dist.depth_at_slice(s);
                assert_eq!(dist.slice_at_depth(depth), s, "slice {s} of {slices}");
            }
        }
    }

    #[test]
    fn slice_at_depth_is_monotonic() {
        let dist = SliceDistribution::new(0.5, 500.0, 24);
        let mut previous = 0;
        let mut depth = 0.1f32;
        while depth < 600.0 {
            let slice = dist.slice_at_depth(depth);
            assert!(slice >= previous, "regressed at depth {depth}");
            previous = slice;
            depth *= 1.07;
        }
        assert_eq!(dist.slice_at_depth(600.0), 23);
    }

    #[test]
    fn slice_boundaries_span_distance_range() {
        let dist = SliceDistribution::new(0.5, 500.0, 24);
        assert_relative_eq!(dist.depth_at_slice(0), 0.5);
        assert_relative_eq!(dist.depth_at_slice(24), 500.0, epsilon = 1e-2);
    }

    #[test]
    fn region_extent_follows_fov() {
        // 90 degree vertical fov, square aspect: half-extent equals depth.
        let region = SliceRegion::new(2.0, 4.0, 1.0, 1.0);
        assert_relative_eq!(region.aabb.max().x, 4.0);
        assert_relative_eq!(region.aabb.min().z, -4.0);
        assert_relative_eq!(region.aabb.max().z, -2.0);
        assert_relative_eq!(Vec3::from(region.corners[0]).x, -2.0);
        assert_relative_eq!(Vec3::from(region.corners[7]).y, 4.0);
    }

    #[test]
    fn region_rejects_outside_volumes() {
        let region = SliceRegion::new(2.0, 4.0, 1.0, 1.0);

        let inside = Aabb::new(Vec3::new(0.0, 0.0, -3.0), Vec3::splat(0.25));
        assert!(region.intersects(&inside));

        let behind = Aabb::new(Vec3::new(0.0, 0.0, 3.0), Vec3::splat(0.25));
        assert!(!region.intersects(&behind));

        let too_near = Aabb::new(Vec3::new(0.0, 0.0, -1.0), Vec3::splat(0.25));
        assert!(!region.intersects(&too_near));

        // Within the bounding box's x range but outside the side plane.
        let past_side = Aabb::new(Vec3::new(3.5, 0.0, -2.2), Vec3::splat(0.1));
        assert!(!region.intersects(&past_side));
    }

    #[test]
    fn cell_range_maps_extent_to_cells() {
        let region = SliceRegion::new(2.0, 4.0, 1.0, 1.0);

        let center = Aabb::new(Vec3::new(0.0, 0.0, -3.0), Vec3::splat(0.1));
        let (x0, x1, y0, y1) = region.cell_range(&center, 4, 4);
        assert_eq!((x0, x1, y0, y1), (1, 2, 1, 2));

        let everything = Aabb::new(Vec3::new(0.0, 0.0, -3.0), Vec3::splat(100.0));
        let (x0, x1, y0, y1) = region.cell_range(&everything, 4, 4);
        assert_eq!((x0, x1, y0, y1), (0, 3, 0, 3));
    }

    #[test]
    fn bins_respect_per_cell_capacity_first_come_first_served() {
        let config = test_config();
        let dist =
            SliceDistribution::new(config.min_distance, config.max_distance, config.num_slices);
        let mut bins = SliceBins::new(&config);

        // Five lights stacked on the same spot; capacity is four per cell.
        let world = Aabb::new(Vec3::new(0.0, 0.0, -10.0), Vec3::splat(0.1));
        let lights: Vec<BinBounds> = (0..5)
            .map(|i| BinBounds::from_world_aabb(i, &world, &glam::Mat4::IDENTITY, &dist).unwrap())
            .collect();

        let slice = lights[0].slice_start;
        let region = {
            let near = dist.depth_at_slice(slice);
            let far = dist.depth_at_slice(slice + 1);
            SliceRegion::new(near, far, 1.0, 1.0)
        };

        bins.bin(slice, &region, &config, &lights, &[], &[]);

        let cell = lights
            .iter()
            .map(|l| {
                let (x0, _, y0, _) = region.cell_range(&l.aabb, config.width, config.height);
                (y0 * config.width + x0) as usize
            })
            .next()
            .unwrap();

        assert_eq!(bins.counts(cell).0, 4);
        assert_eq!(bins.cell_lights(cell, config.lights_per_cell), &[0, 1, 2, 3]);
        assert!(bins.dropped >= 1);

        bins.clear();
        assert_eq!(bins.counts(cell).0, 0);
        assert_eq!(bins.dropped, 0);
    }

    #[test]
    fn bin_bounds_skips_objects_behind_camera() {
        let dist = SliceDistribution::new(0.5, 100.0, 8);
        let behind = Aabb::new(Vec3::new(0.0, 0.0, 5.0), Vec3::splat(1.0));
        assert!(BinBounds::from_world_aabb(0, &behind, &glam::Mat4::IDENTITY, &dist).is_none());
    }

    #[test]
    fn config_validation_rejects_bad_ranges() {
        let mut config = ClusterGridConfig::default();
        assert!(config.validate().is_ok());

        config.min_distance = 0.0;
        assert!(config.validate().is_err());

        config = ClusterGridConfig {
            max_distance: 0.25,
            ..ClusterGridConfig::default()
        };
        assert!(config.validate().is_err());

        config = ClusterGridConfig {
            width: 0,
            ..ClusterGridConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
