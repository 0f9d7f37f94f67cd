//! Forward+ clustered orchestrator.
//!
//! `collect` consumes the scene's externally-culled object lists for one
//! camera and produces the two per-camera GPU inputs: the cluster grid (a
//! u16 table of per-cell offsets and counts followed by the per-cell index
//! lists) and the packed global light/decal/probe buffer described by
//! [`crate::layout`]. Results are cached per camera pose and frame; binning
//! is data-parallel over depth slices.

use crate::cache::{Checkout, GridCache};
use crate::cluster::{
    compute_slice_regions, BinBounds, ClusterGridConfig, SliceBins, SliceDistribution, SliceRegion,
};
use crate::layout::{
    GpuDecalRecord, GpuLightRecord, GpuProbeRecord, ObjectCounts, PackingView,
};
use glint_core::{FrameCount, Result, ShadowNodeId, VisibilityMask};
use glint_gpu::{DeferredDeletionQueue, DeferredResource, GpuAllocator, GpuBuffer};
use glint_scene::{Camera, Decal, Light, LightType, ProbeProxy};
use rayon::prelude::*;

/// GPU buffers backing one cache generation.
#[derive(Default)]
pub struct GridBufferPair {
    pub grid: Option<GpuBuffer>,
    pub list: Option<GpuBuffer>,
}

/// Scene objects already frustum-culled against the camera by the scene
/// pass. Slices are in scene iteration order, which fixes the
/// first-come-first-served drop order on cell overflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisibleObjects<'a> {
    pub lights: &'a [Light],
    pub decals: &'a [Decal],
    pub probes: &'a [ProbeProxy],
}

/// CPU staging for the two GPU buffers.
///
/// `grid_data` holds the cell table (4 u16 per cell: list offset, light
/// count, decal count, probe count) followed by the concatenated per-cell
/// index lists; offsets are u16 positions from the buffer start. Indices
/// are per-section object positions in the packed list. `list_data` is the
/// packed record buffer.
#[derive(Default)]
pub struct GridStaging {
    pub grid_data: Vec<u16>,
    pub list_data: Vec<u8>,
    pub counts: ObjectCounts,
}

impl GridStaging {
    fn reset(&mut self, num_cells: usize) {
        self.grid_data.clear();
        self.grid_data.resize(num_cells * 4, 0);
        self.list_data.clear();
        self.counts = ObjectCounts::default();
    }

    /// Table entry for one cell.
    pub fn cell_table_entry(&self, config: &ClusterGridConfig, x: u32, y: u32, slice: u32) -> [u16; 4] {
        let i = config.cell_index(x, y, slice) * 4;
        [
            self.grid_data[i],
            self.grid_data[i + 1],
            self.grid_data[i + 2],
            self.grid_data[i + 3],
        ]
    }

    /// The index list a table entry points at: lights, then decals, then
    /// probes.
    pub fn cell_indices(&self, entry: [u16; 4]) -> &[u16] {
        let start = entry[0] as usize;
        let len = (entry[1] + entry[2] + entry[3]) as usize;
        &self.grid_data[start..start + len]
    }
}

/// Reusable per-instance arenas so the per-frame hot path never allocates.
struct BinScratch {
    slices: Vec<SliceBins>,
    packed_lights: Vec<u16>,
    packed_decals: Vec<u16>,
    packed_probes: Vec<u16>,
    light_bounds: Vec<BinBounds>,
    decal_bounds: Vec<BinBounds>,
    probe_bounds: Vec<BinBounds>,
    cell_lists: Vec<u16>,
}

impl BinScratch {
    fn new(config: &ClusterGridConfig) -> Self {
        Self {
            slices: (0..config.num_slices).map(|_| SliceBins::new(config)).collect(),
            packed_lights: Vec::new(),
            packed_decals: Vec::new(),
            packed_probes: Vec::new(),
            light_bounds: Vec::new(),
            decal_bounds: Vec::new(),
            probe_bounds: Vec::new(),
            cell_lists: Vec::new(),
        }
    }
}

/// The clustered Forward+ grid builder.
pub struct ForwardClustered {
    config: ClusterGridConfig,
    distribution: SliceDistribution,
    cache: GridCache<GridBufferPair>,
    regions: Vec<SliceRegion>,
    scratch: BinScratch,
    staging: GridStaging,
    last_checkout: Option<Checkout>,
}

impl ForwardClustered {
    pub fn new(config: ClusterGridConfig) -> Result<Self> {
        config.validate()?;
        let distribution =
            SliceDistribution::new(config.min_distance, config.max_distance, config.num_slices);
        let scratch = BinScratch::new(&config);

        Ok(Self {
            config,
            distribution,
            cache: GridCache::new(),
            regions: Vec::new(),
            scratch,
            staging: GridStaging::default(),
            last_checkout: None,
        })
    }

    #[inline]
    pub fn config(&self) -> &ClusterGridConfig {
        &self.config
    }

    #[inline]
    pub fn distribution(&self) -> &SliceDistribution {
        &self.distribution
    }

    /// Counts and section offsets of the most recent collect.
    #[inline]
    pub fn counts(&self) -> &ObjectCounts {
        &self.staging.counts
    }

    /// CPU staging of the most recent collect.
    #[inline]
    pub fn staging(&self) -> &GridStaging {
        &self.staging
    }

    /// Build (or reuse) the grid for `camera`.
    ///
    /// Returns the cache checkout; when it is already up to date the
    /// previous staging and buffers remain valid and nothing is rebuilt.
    pub fn collect(
        &mut self,
        camera: &Camera,
        objects: VisibleObjects<'_>,
        reflection: bool,
        shadow_node: Option<ShadowNodeId>,
        frame: FrameCount,
    ) -> Checkout {
        let visibility_mask = camera.visibility_mask;
        let checkout = self
            .cache
            .checkout(camera, reflection, visibility_mask, shadow_node, frame);
        self.last_checkout = Some(checkout);
        if checkout.up_to_date {
            return checkout;
        }

        self.staging.reset(self.config.num_cells());

        // Capture cameras for static probes skip light culling entirely;
        // they still get a valid, empty grid.
        if !camera.light_culling_enabled {
            for bins in &mut self.scratch.slices {
                bins.clear();
            }
            return checkout;
        }

        let packing = PackingView::new(camera.view_matrix());
        self.gather(&objects, visibility_mask, &packing);
        self.bin_slices(camera);
        self.serialize(&objects, &packing);

        checkout
    }

    /// Filter and order the scene lists into packed order: directional
    /// lights first (they are never binned), then point and spot lights,
    /// then decals and probes from their render-queue ranges.
    fn gather(&mut self, objects: &VisibleObjects<'_>, mask: VisibilityMask, packing: &PackingView) {
        debug_assert!(objects.lights.len() <= usize::from(u16::MAX));
        debug_assert!(objects.decals.len() <= usize::from(u16::MAX));
        debug_assert!(objects.probes.len() <= usize::from(u16::MAX));

        let scratch = &mut self.scratch;
        scratch.packed_lights.clear();
        scratch.packed_decals.clear();
        scratch.packed_probes.clear();
        scratch.light_bounds.clear();
        scratch.decal_bounds.clear();
        scratch.probe_bounds.clear();

        let mut directional = 0u32;
        for (i, light) in objects.lights.iter().enumerate() {
            if light.visibility_mask & mask == 0 || light.light_type != LightType::Directional {
                continue;
            }
            scratch.packed_lights.push(i as u16);
            directional += 1;
        }

        let mut point = 0u32;
        let mut spot = 0u32;
        for (i, light) in objects.lights.iter().enumerate() {
            if light.visibility_mask & mask == 0 || light.light_type == LightType::Directional {
                continue;
            }
            let packed = scratch.packed_lights.len() as u16;
            scratch.packed_lights.push(i as u16);
            match light.light_type {
                LightType::Point => point += 1,
                LightType::Spot => spot += 1,
                LightType::Directional => {}
            }
            if let Some(world) = light.world_aabb() {
                if let Some(bounds) =
                    BinBounds::from_world_aabb(packed, &world, &packing.view, &self.distribution)
                {
                    scratch.light_bounds.push(bounds);
                }
            }
        }

        let mut decals = 0u32;
        if self.config.decals_enabled {
            for decal in objects.decals {
                if decal.visibility_mask & mask == 0 || !decal.render_queue.is_decal_queue() {
                    continue;
                }
                let packed = decals as u16;
                decals += 1;
                if let Some(bounds) = BinBounds::from_world_aabb(
                    packed,
                    &decal.world_aabb(),
                    &packing.view,
                    &self.distribution,
                ) {
                    scratch.decal_bounds.push(bounds);
                }
                scratch.packed_decals.push(packed);
            }
        }

        let mut probes = 0u32;
        if self.config.probes_enabled {
            for (i, proxy) in objects.probes.iter().enumerate() {
                if !proxy.attached
                    || proxy.visibility_mask & mask == 0
                    || !proxy.render_queue.is_probe_queue()
                {
                    continue;
                }
                let packed = probes as u16;
                probes += 1;
                if let Some(bounds) = BinBounds::from_world_aabb(
                    packed,
                    &proxy.world_aabb(),
                    &packing.view,
                    &self.distribution,
                ) {
                    scratch.probe_bounds.push(bounds);
                }
                scratch.packed_probes.push(i as u16);
            }
        }

        self.staging.counts = ObjectCounts::new(directional, point, spot, decals, probes);
    }

    /// Bin all gathered objects, one depth slice per parallel task. Slices
    /// own disjoint cell storage, so the merge is pure concatenation during
    /// serialization.
    fn bin_slices(&mut self, camera: &Camera) {
        self.regions = compute_slice_regions(camera, &self.distribution, self.config.num_slices);

        let regions = &self.regions;
        let config = &self.config;
        let light_bounds: &[BinBounds] = &self.scratch.light_bounds;
        let decal_bounds: &[BinBounds] = &self.scratch.decal_bounds;
        let probe_bounds: &[BinBounds] = &self.scratch.probe_bounds;

        self.scratch
            .slices
            .par_iter_mut()
            .enumerate()
            .for_each(|(slice, bins)| {
                bins.clear();
                bins.bin(
                    slice as u32,
                    &regions[slice],
                    config,
                    light_bounds,
                    decal_bounds,
                    probe_bounds,
                );
            });

        let dropped: u32 = self.scratch.slices.iter().map(|bins| bins.dropped).sum();
        if dropped > 0 {
            tracing::debug!(dropped, "cluster cells over capacity, dropped overflow in scene order");
        }
    }

    /// Serialize the cell table, index lists, and packed records into
    /// staging.
    fn serialize(&mut self, objects: &VisibleObjects<'_>, packing: &PackingView) {
        let config = &self.config;
        let counts = self.staging.counts;
        let table_len = config.num_cells() * 4;

        let slices: &[SliceBins] = &self.scratch.slices;
        let cell_lists = &mut self.scratch.cell_lists;
        let grid = &mut self.staging.grid_data;
        cell_lists.clear();

        let mut next_offset = table_len;
        let mut overflowed = false;
        for slice in 0..config.num_slices {
            let bins = &slices[slice as usize];
            for y in 0..config.height {
                for x in 0..config.width {
                    let cell = (y * config.width + x) as usize;
                    let (lights, decals, probes) = bins.counts(cell);
                    let total = (lights + decals + probes) as usize;
                    if total == 0 {
                        continue;
                    }
                    if next_offset + total > usize::from(u16::MAX) {
                        // The u16 grid cannot address further lists; the
                        // cell renders with no clustered objects.
                        overflowed = true;
                        continue;
                    }

                    let flat = config.cell_index(x, y, slice) * 4;
                    grid[flat] = next_offset as u16;
                    grid[flat + 1] = lights;
                    grid[flat + 2] = decals;
                    grid[flat + 3] = probes;

                    cell_lists.extend_from_slice(bins.cell_lights(cell, config.lights_per_cell));
                    cell_lists.extend_from_slice(bins.cell_decals(cell, config.decals_per_cell));
                    cell_lists.extend_from_slice(bins.cell_probes(cell, config.probes_per_cell));
                    next_offset += total;
                }
            }
        }
        grid.extend_from_slice(cell_lists);

        if overflowed {
            tracing::warn!("cluster grid exceeded u16 index range, some cells were emptied");
        }

        let inv_profile_height = 1.0 / self.config.light_profile_tex_height as f32;
        let list = &mut self.staging.list_data;

        for &scene_idx in &self.scratch.packed_lights {
            let record = GpuLightRecord::from_light(
                &objects.lights[scene_idx as usize],
                &packing.view,
                &packing.view3,
                inv_profile_height,
            );
            list.extend_from_slice(bytemuck::bytes_of(&record));
        }

        if counts.decals > 0 {
            list.resize(counts.decal_float4_offset as usize * 16, 0);
            for decal in objects
                .decals
                .iter()
                .filter(|d| d.render_queue.is_decal_queue())
                .take(counts.decals as usize)
            {
                let record = GpuDecalRecord::from_decal(decal, &packing.view);
                list.extend_from_slice(bytemuck::bytes_of(&record));
            }
        }

        if counts.probes > 0 {
            list.resize(counts.probe_float4_offset as usize * 16, 0);
            for &scene_idx in &self.scratch.packed_probes {
                let record = GpuProbeRecord::from_proxy(
                    &objects.probes[scene_idx as usize],
                    &packing.view,
                    &packing.inv_view3,
                );
                list.extend_from_slice(bytemuck::bytes_of(&record));
            }
        }

        debug_assert_eq!(list.len(), counts.bytes_needed());
    }

    /// Upload the staged grid and packed list into the checked-out
    /// generation's buffers, growing them as needed.
    pub fn upload(
        &mut self,
        allocator: &mut GpuAllocator,
        deferred: &mut DeferredDeletionQueue,
        frame: FrameCount,
    ) -> glint_gpu::Result<()> {
        let Some(checkout) = self.last_checkout else {
            return Ok(());
        };
        if checkout.up_to_date {
            return Ok(());
        }

        let pair = self.cache.entry_mut(checkout.index).current_mut();

        let grid_bytes = (self.staging.grid_data.len() * 2) as u64;
        let grid = Self::ensure_capacity(
            &mut pair.grid,
            allocator,
            deferred,
            frame,
            grid_bytes,
            "forward_clustered_grid",
        )?;
        grid.write(&self.staging.grid_data)?;

        if !self.staging.list_data.is_empty() {
            let list = Self::ensure_capacity(
                &mut pair.list,
                allocator,
                deferred,
                frame,
                self.staging.list_data.len() as u64,
                "forward_clustered_list",
            )?;
            list.write(&self.staging.list_data)?;
        }

        Ok(())
    }

    fn ensure_capacity<'a>(
        slot: &'a mut Option<GpuBuffer>,
        allocator: &mut GpuAllocator,
        deferred: &mut DeferredDeletionQueue,
        frame: FrameCount,
        needed: u64,
        name: &str,
    ) -> glint_gpu::Result<&'a GpuBuffer> {
        let needed = needed.max(64);
        if !matches!(slot, Some(buffer) if buffer.size >= needed) {
            if let Some(old) = slot.take() {
                deferred.queue(DeferredResource::Buffer(old), frame);
            }
            let capacity = needed.next_power_of_two();
            tracing::debug!(name, bytes = capacity, "growing forward clustered buffer");
            return Ok(slot.insert(allocator.create_grid_buffer(capacity, name)?));
        }
        match slot {
            Some(buffer) => Ok(buffer),
            None => unreachable!("slot populated above"),
        }
    }

    /// Non-mutating staleness probe; true when `collect` must run before
    /// this camera's buffers may be consumed.
    pub fn is_cache_dirty(
        &self,
        camera: &Camera,
        reflection: bool,
        shadow_node: Option<ShadowNodeId>,
        frame: FrameCount,
    ) -> bool {
        self.cache
            .is_dirty(camera, reflection, camera.visibility_mask, shadow_node, frame)
    }

    /// Grid buffer of the camera's current generation.
    ///
    /// Consuming this without a prior up-to-date `collect` is a contract
    /// violation; debug builds assert, release builds return the stale
    /// generation.
    pub fn grid_buffer(
        &self,
        camera: &Camera,
        reflection: bool,
        shadow_node: Option<ShadowNodeId>,
        frame: FrameCount,
    ) -> Option<&GpuBuffer> {
        let peeked = self
            .cache
            .peek(camera, reflection, camera.visibility_mask, shadow_node, frame);
        debug_assert!(
            peeked.as_ref().is_some_and(|(_, up_to_date)| *up_to_date),
            "collect must run before grid_buffer"
        );
        peeked.and_then(|(entry, _)| entry.current().grid.as_ref())
    }

    /// Packed global list buffer of the camera's current generation; same
    /// contract as [`Self::grid_buffer`].
    pub fn global_list_buffer(
        &self,
        camera: &Camera,
        reflection: bool,
        shadow_node: Option<ShadowNodeId>,
        frame: FrameCount,
    ) -> Option<&GpuBuffer> {
        let peeked = self
            .cache
            .peek(camera, reflection, camera.visibility_mask, shadow_node, frame);
        debug_assert!(
            peeked.as_ref().is_some_and(|(_, up_to_date)| *up_to_date),
            "collect must run before global_list_buffer"
        );
        peeked.and_then(|(entry, _)| entry.current().list.as_ref())
    }

    /// Evict cache entries stale by more than the eviction age, queueing
    /// their buffers for deferred deletion.
    pub fn delete_old_buffers(
        &mut self,
        deferred: &mut DeferredDeletionQueue,
        frame: FrameCount,
    ) {
        self.cache.evict_stale(frame, |pair| {
            Self::release_pair(pair, deferred, frame);
        });
    }

    /// Release every cached buffer. For shutdown.
    pub fn release_all(&mut self, deferred: &mut DeferredDeletionQueue, frame: FrameCount) {
        self.last_checkout = None;
        self.cache.clear(|pair| {
            Self::release_pair(pair, deferred, frame);
        });
    }

    fn release_pair(pair: GridBufferPair, deferred: &mut DeferredDeletionQueue, frame: FrameCount) {
        if let Some(buffer) = pair.grid {
            deferred.queue(DeferredResource::Buffer(buffer), frame);
        }
        if let Some(buffer) = pair.list {
            deferred.queue(DeferredResource::Buffer(buffer), frame);
        }
    }
}
