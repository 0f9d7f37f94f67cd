//! Probe collection lifecycle and per-frame update scheduling.
//!
//! [`PccManager`] owns every [`CubemapProbe`] and drives them through the
//! render backend: workspace setup, dirty tracking, the iterative capture
//! loop, and the copy into the bound cubemap (array slice in pooled mode,
//! the probe's own texture in manual mode). Slot bookkeeping lives in
//! [`SlotStrategy`] so the two modes share one manager type.

use glam::{Mat3, Mat4, Vec3};
use glint_core::types::{CameraId, VisibilityMask, ALL_VISIBLE};
use glint_scene::camera::Camera;
use tracing::warn;

use crate::backend::{
    ReadbackTicket, RenderBackend, TextureDesc, TextureFormat, TextureHandle, WorkspaceParams,
};
use crate::blend::{collect_blend_probes, BlendSelection};
use crate::error::{ProbeError, Result};
use crate::probe::{CubemapProbe, ManualProbeBlock, ProbeId, INVALID_SLICE};

/// Workspace definition used to clear a pooled slice before a dynamic
/// probe's first capture iteration.
pub const CLEAR_WORKSPACE_DEFINITION: &str = "probe_clear";

/// Sampler state expected when the probe cubemap (array) is bound to a
/// material. Blending between mips needs trilinear filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSamplerDesc {
    pub trilinear: bool,
    pub clamp_to_edge: bool,
}

impl Default for ProbeSamplerDesc {
    fn default() -> Self {
        Self {
            trilinear: true,
            clamp_to_edge: true,
        }
    }
}

/// How probes obtain their cubemap storage.
///
/// `ManualSlots`: every probe carries its own cubemap texture, created
/// through [`PccManager::set_texture_params`]. `PooledArraySlots`: probes
/// lease slices of one shared cubemap array; a free-slot bitset hands out
/// the lowest free slice and takes it back on release.
#[derive(Debug)]
pub enum SlotStrategy {
    ManualSlots,
    PooledArraySlots {
        render_target: Option<TextureHandle>,
        texture_array: Option<TextureHandle>,
        /// One bit per array slice, set while the slice is free.
        free_slots: Vec<u64>,
        capacity: u32,
        desc: Option<TextureDesc>,
    },
}

impl SlotStrategy {
    /// Pooled strategy with no backing resources yet; textures and the
    /// bitset appear when the pool is enabled.
    pub const fn pooled() -> Self {
        Self::PooledArraySlots {
            render_target: None,
            texture_array: None,
            free_slots: Vec::new(),
            capacity: 0,
            desc: None,
        }
    }

    pub fn is_automatic(&self) -> bool {
        matches!(self, Self::PooledArraySlots { .. })
    }

    pub fn capacity(&self) -> u32 {
        match self {
            Self::ManualSlots => 0,
            Self::PooledArraySlots { capacity, .. } => *capacity,
        }
    }

    pub fn free_slot_count(&self) -> u32 {
        match self {
            Self::ManualSlots => 0,
            Self::PooledArraySlots { free_slots, .. } => {
                free_slots.iter().map(|word| word.count_ones()).sum()
            }
        }
    }

    /// Take the lowest free slice out of the bitset, if any remains.
    pub fn acquire_texture_slot(&mut self) -> Option<u32> {
        let Self::PooledArraySlots { free_slots, .. } = self else {
            return None;
        };
        for (word_index, word) in free_slots.iter_mut().enumerate() {
            if *word == 0 {
                continue;
            }
            let bit = word.trailing_zeros();
            *word &= !(1u64 << bit);
            return Some(word_index as u32 * 64 + bit);
        }
        None
    }

    /// Hand a slice back to the pool.
    ///
    /// # Panics
    /// If `slot` is out of range or was not currently acquired.
    pub fn release_texture_slot(&mut self, slot: u32) {
        let Self::PooledArraySlots {
            free_slots,
            capacity,
            ..
        } = self
        else {
            return;
        };
        assert!(
            slot < *capacity,
            "slot {slot} out of bounds for capacity {capacity}"
        );
        let word = (slot / 64) as usize;
        let bit = slot % 64;
        assert!(
            free_slots[word] & (1u64 << bit) == 0,
            "slot {slot} was already released"
        );
        free_slots[word] |= 1u64 << bit;
    }
}

/// Reference-counted temporary render target, shared between manual static
/// probes whose captures agree on resolution, format, and sample count.
#[derive(Debug)]
struct TmpRtt {
    desc: TextureDesc,
    texture: TextureHandle,
    ref_count: u32,
}

/// Owner of the probe collection and its GPU-side lifecycle.
pub struct PccManager {
    probes: Vec<CubemapProbe>,
    next_probe_id: u64,
    strategy: SlotStrategy,
    tmp_rtts: Vec<TmpRtt>,
    /// Indices of probes collected for rendering this frame.
    dirty_queue: Vec<usize>,
    default_workspace_def: String,
    system_mask: VisibilityMask,
    tracked_position: Vec3,
    tracked_view_proj: Mat4,
    cached_last_view: Mat4,
    paused: bool,
    hooks_active: bool,
    is_rendering: bool,
    use_dpm_2d_array: bool,
    capture_depth: bool,
    depth_tickets: Vec<ReadbackTicket>,
}

impl PccManager {
    pub fn new(strategy: SlotStrategy, default_workspace_def: impl Into<String>) -> Self {
        // Manual managers have no enable switch, so their frame hooks run
        // from the start; pooled managers arm them in `set_enabled`.
        let hooks_active = !strategy.is_automatic();
        Self {
            probes: Vec::new(),
            next_probe_id: 0,
            strategy,
            tmp_rtts: Vec::new(),
            dirty_queue: Vec::new(),
            default_workspace_def: default_workspace_def.into(),
            system_mask: ALL_VISIBLE,
            tracked_position: Vec3::ZERO,
            tracked_view_proj: Mat4::IDENTITY,
            cached_last_view: Mat4::NAN,
            paused: false,
            hooks_active,
            is_rendering: false,
            use_dpm_2d_array: false,
            capture_depth: false,
            depth_tickets: Vec::new(),
        }
    }

    pub fn create_probe(&mut self) -> ProbeId {
        let id = ProbeId(self.next_probe_id);
        self.next_probe_id += 1;
        let automatic = self.strategy.is_automatic();
        self.probes.push(CubemapProbe::new(id, automatic));
        id
    }

    /// Tear down one probe, releasing its workspace, camera, and texture
    /// or array slice first.
    ///
    /// # Panics
    /// If material bindings against the probe are still alive.
    pub fn destroy_probe(&mut self, backend: &mut dyn RenderBackend, id: ProbeId) -> Result<()> {
        let index = self.index_of(id)?;
        assert!(
            !self.probes[index].has_live_bindings(),
            "probe {} destroyed with live material bindings",
            id.0
        );
        self.destroy_workspace_at(backend, index);
        if !self.strategy.is_automatic() {
            if let Some(texture) = self.probes[index].texture.take() {
                backend.destroy_texture(texture);
            }
        }
        self.probes.swap_remove(index);
        // Queued indices may now point at the wrong probe.
        self.dirty_queue.clear();
        Ok(())
    }

    pub fn destroy_all_probes(&mut self, backend: &mut dyn RenderBackend) {
        while let Some(id) = self.probes.last().map(|probe| probe.id) {
            if self.destroy_probe(backend, id).is_err() {
                break;
            }
        }
    }

    /// Choose the probe's cubemap storage parameters.
    ///
    /// In pooled mode this records the request and the static flag (the
    /// array itself is shared); in manual mode it replaces the probe's own
    /// cubemap texture, re-initializing the workspace if one existed.
    pub fn set_texture_params(
        &mut self,
        backend: &mut dyn RenderBackend,
        id: ProbeId,
        desc: TextureDesc,
        is_static: bool,
    ) -> Result<()> {
        let index = self.index_of(id)?;
        if self.strategy.is_automatic() {
            let probe = &mut self.probes[index];
            probe.texture_params = Some(desc);
            if probe.is_static != is_static {
                probe.is_static = is_static;
                probe.proxy.in_static_partition = is_static;
                probe.dirty = true;
                if let Some(camera) = probe.camera.as_mut() {
                    camera.light_culling_enabled = !is_static;
                }
            }
            return Ok(());
        }

        let was_initialized = self.probes[index].is_initialized();
        let (near, far) = self.probes[index].camera_planes;
        let definition = self.probes[index].workspace_def_override.clone();
        let channels = self.probes[index].additional_channels.clone();
        let exec_mask = self.probes[index].mipmaps_exec_mask;

        self.destroy_workspace_at(backend, index);
        if let Some(texture) = self.probes[index].texture.take() {
            backend.destroy_texture(texture);
        }
        let name = format!("probe_{}_cubemap", id.0);
        let texture = backend.create_cubemap(&desc, &name);

        let probe = &mut self.probes[index];
        probe.texture = Some(texture);
        probe.texture_params = Some(desc);
        probe.is_static = is_static;
        probe.proxy.in_static_partition = is_static;
        probe.dirty = true;

        if was_initialized {
            self.init_workspace_at(backend, index, near, far, definition, channels, exec_mask)?;
        }
        Ok(())
    }

    /// Build the probe's capture camera and compositor workspace.
    ///
    /// Pooled mode additionally leases an array slice; running out of
    /// slices disables the probe with a warning instead of failing.
    pub fn init_workspace(
        &mut self,
        backend: &mut dyn RenderBackend,
        id: ProbeId,
        camera_near: f32,
        camera_far: f32,
        workspace_definition: Option<&str>,
        additional_channels: &[TextureHandle],
        mipmaps_execution_mask: u8,
    ) -> Result<()> {
        let index = self.index_of(id)?;
        self.init_workspace_at(
            backend,
            index,
            camera_near,
            camera_far,
            workspace_definition.map(str::to_owned),
            additional_channels.to_vec(),
            mipmaps_execution_mask,
        )
    }

    fn init_workspace_at(
        &mut self,
        backend: &mut dyn RenderBackend,
        index: usize,
        camera_near: f32,
        camera_far: f32,
        workspace_definition: Option<String>,
        additional_channels: Vec<TextureHandle>,
        mipmaps_execution_mask: u8,
    ) -> Result<()> {
        let automatic = self.strategy.is_automatic();
        assert!(
            self.probes[index].texture_params.is_some() || automatic,
            "set_texture_params must be called before init_workspace"
        );

        self.destroy_workspace_at(backend, index);

        let probe_id = self.probes[index].id;
        let probe_pos = self.probes[index].camera_pos;
        let is_static = self.probes[index].is_static;

        // Storage plus render target per mode: pooled slices render into
        // the shared target, manual static into a pooled temporary, manual
        // dynamic straight into the probe's own cubemap.
        let (texture, slice, capture_target, tmp_rtt) = if automatic {
            let pool = match &self.strategy {
                SlotStrategy::PooledArraySlots {
                    render_target: Some(render_target),
                    texture_array: Some(texture_array),
                    ..
                } => Some((*render_target, *texture_array)),
                _ => None,
            };
            let slot = pool.and_then(|_| self.strategy.acquire_texture_slot());
            match (pool, slot) {
                (Some((render_target, texture_array)), Some(slot)) => {
                    (texture_array, slot, render_target, Some(render_target))
                }
                _ => {
                    let probe = &mut self.probes[index];
                    probe.enabled = false;
                    warn!(
                        probe = probe_id.0,
                        "no free cubemap array slice, disabling probe"
                    );
                    return Ok(());
                }
            }
        } else {
            let Some(texture) = self.probes[index].texture else {
                return Err(ProbeError::TextureParamsNotSet);
            };
            backend.make_resident(texture);
            if is_static {
                let Some(desc) = self.probes[index].texture_params else {
                    return Err(ProbeError::TextureParamsNotSet);
                };
                let tmp = self.find_tmp_rtt(backend, &desc);
                (texture, INVALID_SLICE, tmp, Some(tmp))
            } else {
                (texture, INVALID_SLICE, texture, None)
            }
        };

        // Dual-paraboloid arrays flip which mips run their passes; plain
        // pooled captures mip every slice.
        let effective_mask = if automatic {
            if self.use_dpm_2d_array {
                !mipmaps_execution_mask
            } else {
                0xff
            }
        } else {
            mipmaps_execution_mask
        };

        let definition = workspace_definition
            .clone()
            .unwrap_or_else(|| self.default_workspace_def.clone());
        let workspace = backend.add_workspace(&WorkspaceParams {
            render_target: capture_target,
            definition,
            additional_channels: additional_channels.clone(),
            mipmaps_execution_mask: effective_mask,
        });
        let clear_workspace = if automatic && !is_static {
            Some(backend.add_workspace(&WorkspaceParams {
                render_target: capture_target,
                definition: CLEAR_WORKSPACE_DEFINITION.to_owned(),
                additional_channels: Vec::new(),
                mipmaps_execution_mask: 0xff,
            }))
        } else {
            None
        };

        let mut camera = Camera::capture(CameraId(probe_id.0), probe_pos, camera_near, camera_far);
        camera.light_culling_enabled = !is_static;

        let probe = &mut self.probes[index];
        probe.texture = Some(texture);
        probe.texture_slice = slice;
        probe.tmp_rtt = tmp_rtt;
        probe.workspace = Some(workspace);
        probe.clear_workspace = clear_workspace;
        probe.workspace_def_override = workspace_definition;
        probe.additional_channels = additional_channels;
        probe.mipmaps_exec_mask = mipmaps_execution_mask;
        probe.camera = Some(camera);
        probe.camera_planes = (camera_near, camera_far);
        probe.reinit_pending = false;
        if automatic {
            probe.proxy.attached = true;
        }
        probe.sync_proxy();
        Ok(())
    }

    /// Release everything `init_workspace` built, in reverse dependency
    /// order: temporary target, workspaces, storage residency, camera, and
    /// the array slice last.
    fn destroy_workspace_at(&mut self, backend: &mut dyn RenderBackend, index: usize) {
        let was_initialized = self.probes[index].is_initialized();
        if let Some(tmp) = self.probes[index].tmp_rtt.take() {
            self.release_tmp_rtt(backend, tmp);
        }
        if let Some(workspace) = self.probes[index].workspace.take() {
            backend.remove_workspace(workspace);
        }
        if let Some(clear_workspace) = self.probes[index].clear_workspace.take() {
            backend.remove_workspace(clear_workspace);
        }
        let automatic = self.strategy.is_automatic();
        if !automatic && was_initialized {
            if let Some(texture) = self.probes[index].texture {
                backend.return_to_storage(texture);
            }
        }
        let probe = &mut self.probes[index];
        probe.camera = None;
        if automatic {
            let slice = probe.texture_slice;
            probe.texture = None;
            probe.texture_slice = INVALID_SLICE;
            probe.proxy.attached = false;
            probe.sync_proxy();
            if slice != INVALID_SLICE {
                self.strategy.release_texture_slot(slice);
            }
        }
    }

    /// Find or create a temporary capture target matching `desc`.
    fn find_tmp_rtt(&mut self, backend: &mut dyn RenderBackend, desc: &TextureDesc) -> TextureHandle {
        if let SlotStrategy::PooledArraySlots {
            render_target: Some(render_target),
            ..
        } = &self.strategy
        {
            return *render_target;
        }
        if let Some(entry) = self.tmp_rtts.iter_mut().find(|entry| entry.desc == *desc) {
            entry.ref_count += 1;
            return entry.texture;
        }
        let texture = backend.create_render_target(desc, "probe_tmp_rtt");
        self.tmp_rtts.push(TmpRtt {
            desc: *desc,
            texture,
            ref_count: 1,
        });
        texture
    }

    fn release_tmp_rtt(&mut self, backend: &mut dyn RenderBackend, texture: TextureHandle) {
        if self.strategy.is_automatic() {
            // The shared pool target outlives individual probes.
            return;
        }
        if let Some(position) = self
            .tmp_rtts
            .iter()
            .position(|entry| entry.texture == texture)
        {
            self.tmp_rtts[position].ref_count -= 1;
            if self.tmp_rtts[position].ref_count == 0 {
                backend.destroy_texture(texture);
                self.tmp_rtts.swap_remove(position);
            }
        }
    }

    /// Copy the just-rendered shared target into a permanent array slice.
    /// No-op for manual probes, which render into their own storage.
    fn copy_render_target_to_cubemap(&mut self, backend: &mut dyn RenderBackend, slice: u32) {
        if slice == INVALID_SLICE {
            return;
        }
        let (render_target, texture_array) = match &self.strategy {
            SlotStrategy::PooledArraySlots {
                render_target: Some(render_target),
                texture_array: Some(texture_array),
                ..
            } => (*render_target, *texture_array),
            _ => return,
        };
        backend.copy_to_cubemap_slice(render_target, texture_array, slice);
    }

    /// One capture pass for the probe at `index`: run its workspace, move
    /// the result into permanent storage, and re-disable light culling on
    /// static captures.
    fn render_probe(&mut self, backend: &mut dyn RenderBackend, index: usize) {
        let probe = &self.probes[index];
        debug_assert!(
            probe.dirty || !probe.is_static,
            "clean static probe sent to render"
        );
        let Some(workspace) = probe.workspace else {
            return;
        };
        let Some(camera) = probe.camera.clone() else {
            return;
        };
        let slice = probe.texture_slice;
        let is_static = probe.is_static;
        let static_copy = (!probe.automatic && is_static)
            .then(|| probe.tmp_rtt.zip(probe.texture))
            .flatten();

        let automatic = self.strategy.is_automatic();
        if automatic {
            self.is_rendering = true;
        }
        backend.update_workspace(workspace, &camera);
        if let Some((tmp, texture)) = static_copy {
            backend.copy_texture(tmp, texture);
        }
        if is_static {
            if let Some(stored) = self.probes[index].camera.as_mut() {
                stored.light_culling_enabled = false;
            }
        }
        self.copy_render_target_to_cubemap(backend, slice);
        if automatic {
            self.is_rendering = false;
        }
    }

    /// Bring the shared slot pool up or down. Pooled managers only.
    ///
    /// Enabling creates the shared capture target, the cubemap array, and
    /// an all-free bitset (trailing bits past `max_num_probes` stay
    /// clear), then re-initializes probes that had workspaces when the
    /// pool last went down. Disabling reverses in order, remembering which
    /// probes to bring back.
    pub fn set_enabled(
        &mut self,
        backend: &mut dyn RenderBackend,
        enabled: bool,
        width: u32,
        height: u32,
        max_num_probes: u32,
        format: TextureFormat,
    ) -> Result<()> {
        if !self.strategy.is_automatic() {
            return Err(ProbeError::ManualMode);
        }
        if enabled == self.is_pool_enabled() {
            return Ok(());
        }

        if enabled {
            let desc = TextureDesc {
                width,
                height,
                format,
                samples: 1,
            };
            let render_target = backend.create_render_target(&desc, "probe_pool_target");
            let texture_array =
                backend.create_cubemap_array(&desc, max_num_probes, "probe_pool_array");

            let num_words = (max_num_probes as usize + 63) / 64;
            let mut free_slots = vec![u64::MAX; num_words];
            let trailing = max_num_probes % 64;
            if trailing != 0 {
                if let Some(last) = free_slots.last_mut() {
                    *last = (1u64 << trailing) - 1;
                }
            }
            if let SlotStrategy::PooledArraySlots {
                render_target: pool_target,
                texture_array: pool_array,
                free_slots: pool_slots,
                capacity,
                desc: pool_desc,
            } = &mut self.strategy
            {
                *pool_target = Some(render_target);
                *pool_array = Some(texture_array);
                *pool_slots = free_slots;
                *capacity = max_num_probes;
                *pool_desc = Some(desc);
            }
            self.hooks_active = true;

            for index in 0..self.probes.len() {
                if !self.probes[index].reinit_pending {
                    continue;
                }
                let (near, far) = self.probes[index].camera_planes;
                let definition = self.probes[index].workspace_def_override.clone();
                let channels = self.probes[index].additional_channels.clone();
                let exec_mask = self.probes[index].mipmaps_exec_mask;
                self.init_workspace_at(backend, index, near, far, definition, channels, exec_mask)?;
            }
        } else {
            for index in 0..self.probes.len() {
                let was_initialized = self.probes[index].is_initialized();
                self.destroy_workspace_at(backend, index);
                self.probes[index].reinit_pending = was_initialized;
            }
            let mut pool_textures = (None, None);
            if let SlotStrategy::PooledArraySlots {
                render_target,
                texture_array,
                free_slots,
                capacity,
                desc,
            } = &mut self.strategy
            {
                pool_textures = (render_target.take(), texture_array.take());
                free_slots.clear();
                *capacity = 0;
                *desc = None;
            }
            if let Some(render_target) = pool_textures.0 {
                backend.destroy_texture(render_target);
            }
            if let Some(texture_array) = pool_textures.1 {
                backend.destroy_texture(texture_array);
            }
            self.hooks_active = false;
        }
        Ok(())
    }

    /// Whether the shared pool currently holds GPU resources.
    pub fn is_pool_enabled(&self) -> bool {
        matches!(
            &self.strategy,
            SlotStrategy::PooledArraySlots {
                render_target: Some(_),
                ..
            }
        )
    }

    /// Collect this frame's render queue and prepare each probe's camera.
    ///
    /// A probe queues when it is enabled and either explicitly dirty or
    /// dynamic with the tracked position inside its area.
    pub fn update_scene_graph(&mut self) {
        self.dirty_queue.clear();
        let tracked = self.tracked_position;
        for (index, probe) in self.probes.iter_mut().enumerate() {
            let near_tracked = probe
                .area_ls()
                .contains_point(probe.inv_orientation * (tracked - probe.area.center));
            if ((near_tracked && !probe.is_static) || probe.dirty) && probe.enabled {
                self.dirty_queue.push(index);
            }
        }
        for i in 0..self.dirty_queue.len() {
            let index = self.dirty_queue[i];
            self.probes[index].prepare_for_rendering();
        }
    }

    /// Render every queued probe whose iteration count exceeds the
    /// threshold, one full backend frame per iteration so the command
    /// backlog stays bounded. The global visibility mask is widened to
    /// all-ones for the duration and restored afterwards.
    pub fn update_expensive_collected_dirty_probes(
        &mut self,
        backend: &mut dyn RenderBackend,
        iteration_threshold: u16,
    ) {
        let previous_mask = backend.swap_visibility_mask(ALL_VISIBLE);
        let queue = std::mem::take(&mut self.dirty_queue);
        for &index in &queue {
            let num_iterations = self.probes[index].num_iterations;
            if num_iterations <= iteration_threshold {
                continue;
            }
            for iteration in 0..num_iterations {
                backend.begin_frame();
                if iteration == 0 {
                    let clear = self.probes[index]
                        .clear_workspace
                        .zip(self.probes[index].camera.clone());
                    if let Some((clear_workspace, camera)) = clear {
                        backend.update_workspace(clear_workspace, &camera);
                    }
                }
                self.render_probe(backend, index);
                backend.end_frame();
            }
            if self.capture_depth {
                self.read_back_probe_depth(backend, index);
            }
            self.probes[index].dirty = false;
        }
        self.dirty_queue = queue;
        backend.swap_visibility_mask(previous_mask);
    }

    /// Render the queued probes the expensive pass left behind, inside the
    /// main frame. Clean static probes already flushed are skipped.
    fn update_render_pending(&mut self, backend: &mut dyn RenderBackend) {
        let previous_mask = backend.swap_visibility_mask(ALL_VISIBLE);
        let queue = std::mem::take(&mut self.dirty_queue);
        for &index in &queue {
            let probe = &self.probes[index];
            if probe.dirty || !probe.is_static {
                self.render_probe(backend, index);
            }
            self.probes[index].dirty = false;
        }
        self.dirty_queue = queue;
        backend.swap_visibility_mask(previous_mask);
    }

    /// Synchronous full rebuild: collect every dirty probe (no proximity
    /// rule) and flush each through the expensive path. Used by the
    /// placement helper between its refinement phases.
    pub fn update_all_dirty_probes(&mut self, backend: &mut dyn RenderBackend) {
        backend.update_scene_graph();
        self.dirty_queue.clear();
        for (index, probe) in self.probes.iter().enumerate() {
            if probe.dirty && probe.enabled {
                self.dirty_queue.push(index);
            }
        }
        for i in 0..self.dirty_queue.len() {
            let index = self.dirty_queue[i];
            self.probes[index].prepare_for_rendering();
        }
        self.update_expensive_collected_dirty_probes(backend, 0);
        backend.clear_frame_data();
    }

    /// Frame-start hook: rebuild the render queue.
    pub fn frame_started(&mut self) {
        if self.hooks_active && !self.paused {
            self.update_scene_graph();
        }
    }

    /// Pre-begin hook: flush multi-iteration probes in their own frames.
    pub fn workspaces_before_begin(&mut self, backend: &mut dyn RenderBackend) {
        if self.hooks_active && !self.paused {
            self.update_expensive_collected_dirty_probes(backend, 1);
        }
    }

    /// Begin-update hook: render whatever the queue still holds.
    pub fn workspaces_begin_update(&mut self, backend: &mut dyn RenderBackend) {
        if self.hooks_active && !self.paused {
            self.update_render_pending(backend);
        }
    }

    /// Record the position and view-projection the dirty heuristic and
    /// blend selection follow, usually from the main render camera.
    pub fn set_updated_tracked_data_from_camera(&mut self, camera: &Camera) {
        self.tracked_position = camera.position;
        self.tracked_view_proj = camera.view_projection_matrix();
    }

    /// Re-run blend-probe selection against the tracked position.
    pub fn update_blend_selection(&self, selection: &mut BlendSelection) {
        collect_blend_probes(
            &self.probes,
            self.tracked_position,
            &self.tracked_view_proj,
            self.system_mask,
            selection,
        );
    }

    /// Refresh manual-probe constant buffers after a view matrix change.
    /// Probes without live material bindings are skipped.
    pub fn notify_prepare_pass(&mut self, view: &Mat4) {
        if *view == self.cached_last_view {
            return;
        }
        if !self.probes.iter().any(CubemapProbe::has_live_bindings) {
            return;
        }
        let inv_view3 = Mat3::from_mat4(*view).inverse();
        for probe in &self.probes {
            if !probe.has_live_bindings() {
                continue;
            }
            let _ = probe.with_manual_const_buffer(|buffer| {
                let block = ManualProbeBlock::from_probe(probe, view, &inv_view3);
                if let Err(error) = buffer.write(&[block]) {
                    warn!(probe = probe.id.0, %error, "probe constant upload failed");
                }
            });
        }
        self.cached_last_view = *view;
    }

    /// Detach every probe proxy ahead of a scene clear.
    pub fn prepare_for_clear_scene(&mut self) {
        for probe in &mut self.probes {
            probe.proxy.attached = false;
        }
    }

    /// Re-attach proxies for probes that still hold storage.
    pub fn restore_from_clear_scene(&mut self) {
        for probe in &mut self.probes {
            probe.proxy.attached = probe.is_initialized()
                && (!probe.automatic || probe.texture_slice != INVALID_SLICE);
        }
    }

    fn read_back_probe_depth(&mut self, backend: &mut dyn RenderBackend, index: usize) {
        let source = match &self.strategy {
            SlotStrategy::PooledArraySlots {
                render_target: Some(render_target),
                ..
            } => Some(*render_target),
            SlotStrategy::PooledArraySlots { .. } => None,
            SlotStrategy::ManualSlots => self.probes[index].texture,
        };
        if let Some(source) = source {
            self.depth_tickets.push(backend.read_back_last_mip(source));
        }
    }

    /// When set, every expensive flush queues a 1x1x6 last-mip readback
    /// per probe; the placement helper consumes the tickets.
    pub fn set_depth_capture(&mut self, capture: bool) {
        self.capture_depth = capture;
    }

    pub fn take_depth_readbacks(&mut self) -> Vec<ReadbackTicket> {
        std::mem::take(&mut self.depth_tickets)
    }

    /// Dual-paraboloid 2D-array layout toggle; must be chosen while the
    /// pool is down because it changes workspace execution masks.
    pub fn set_use_dpm_2d_array(&mut self, use_dpm: bool) {
        debug_assert!(
            !self.is_pool_enabled(),
            "DPM layout must be chosen before enabling the pool"
        );
        self.use_dpm_2d_array = use_dpm;
    }

    pub fn uses_dpm_2d_array(&self) -> bool {
        self.use_dpm_2d_array
    }

    /// The texture materials sample probes from: the shared cubemap array
    /// in pooled mode, `None` in manual mode (probes bind individually).
    pub fn bind_texture(&self) -> Option<TextureHandle> {
        match &self.strategy {
            SlotStrategy::ManualSlots => None,
            SlotStrategy::PooledArraySlots { texture_array, .. } => *texture_array,
        }
    }

    pub fn bind_sampler(&self) -> ProbeSamplerDesc {
        ProbeSamplerDesc::default()
    }

    pub fn probes(&self) -> &[CubemapProbe] {
        &self.probes
    }

    pub fn probe(&self, id: ProbeId) -> Option<&CubemapProbe> {
        self.probes.iter().find(|probe| probe.id == id)
    }

    pub fn probe_mut(&mut self, id: ProbeId) -> Option<&mut CubemapProbe> {
        self.probes.iter_mut().find(|probe| probe.id == id)
    }

    pub fn strategy(&self) -> &SlotStrategy {
        &self.strategy
    }

    pub fn system_mask(&self) -> VisibilityMask {
        self.system_mask
    }

    /// Mask a probe must intersect to participate in blend selection.
    pub fn set_system_mask(&mut self, mask: VisibilityMask) {
        self.system_mask = mask;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Pausing stops the frame hooks from collecting or rendering probes;
    /// explicit update calls still work.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_rendering(&self) -> bool {
        self.is_rendering
    }

    pub fn tracked_position(&self) -> Vec3 {
        self.tracked_position
    }

    fn index_of(&self, id: ProbeId) -> Result<usize> {
        self.probes
            .iter()
            .position(|probe| probe.id == id)
            .ok_or(ProbeError::ForeignProbe(id.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::MockBackend;
    use glint_core::math::Aabb;

    fn texture_desc() -> TextureDesc {
        TextureDesc::square(64, TextureFormat::Rgba8Unorm)
    }

    fn pooled_manager(backend: &mut MockBackend, capacity: u32) -> PccManager {
        let mut manager = PccManager::new(SlotStrategy::pooled(), "probe_capture");
        manager
            .set_enabled(backend, true, 64, 64, capacity, TextureFormat::Rgba8Unorm)
            .unwrap();
        manager
    }

    fn add_probe(manager: &mut PccManager, center: Vec3) -> ProbeId {
        let id = manager.create_probe();
        let probe = manager.probe_mut(id).unwrap();
        probe.set(
            center,
            Aabb::new(center, Vec3::splat(2.0)),
            Vec3::splat(0.5),
            Mat3::IDENTITY,
            Aabb::new(center, Vec3::splat(4.0)),
        );
        probe.set_num_iterations(1);
        id
    }

    fn init(manager: &mut PccManager, backend: &mut MockBackend, id: ProbeId) {
        manager
            .init_workspace(backend, id, 0.5, 100.0, None, &[], 0x01)
            .unwrap();
    }

    fn slots_with_capacity(capacity: u32, free_slots: Vec<u64>) -> SlotStrategy {
        SlotStrategy::PooledArraySlots {
            render_target: None,
            texture_array: None,
            free_slots,
            capacity,
            desc: None,
        }
    }

    #[test]
    fn slot_scan_returns_the_lowest_free_bit() {
        let mut strategy = slots_with_capacity(100, vec![u64::MAX, (1u64 << 36) - 1]);
        assert_eq!(strategy.free_slot_count(), 100);
        for expected in 0..100 {
            assert_eq!(strategy.acquire_texture_slot(), Some(expected));
        }
        assert_eq!(strategy.acquire_texture_slot(), None);
        assert_eq!(strategy.free_slot_count(), 0);
    }

    #[test]
    fn released_slot_is_the_next_one_acquired() {
        let mut strategy = slots_with_capacity(100, vec![u64::MAX, (1u64 << 36) - 1]);
        while strategy.acquire_texture_slot().is_some() {}
        strategy.release_texture_slot(57);
        assert_eq!(strategy.free_slot_count(), 1);
        assert_eq!(strategy.acquire_texture_slot(), Some(57));
        assert_eq!(strategy.free_slot_count(), 0);
    }

    #[test]
    #[should_panic(expected = "already released")]
    fn double_release_panics() {
        let mut strategy = slots_with_capacity(64, vec![u64::MAX]);
        assert_eq!(strategy.acquire_texture_slot(), Some(0));
        strategy.release_texture_slot(0);
        strategy.release_texture_slot(0);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_range_release_panics() {
        let mut strategy = slots_with_capacity(64, vec![u64::MAX]);
        strategy.release_texture_slot(64);
    }

    #[test]
    fn bitset_trailing_bits_stay_clear() {
        let mut backend = MockBackend::new();
        let manager = pooled_manager(&mut backend, 65);
        let SlotStrategy::PooledArraySlots {
            free_slots,
            capacity,
            ..
        } = &manager.strategy
        else {
            panic!("pooled manager lost its strategy");
        };
        assert_eq!(*capacity, 65);
        assert_eq!(free_slots.as_slice(), &[u64::MAX, 1]);
    }

    #[test]
    fn pool_exhaustion_disables_the_probe() {
        let mut backend = MockBackend::new();
        let mut manager = pooled_manager(&mut backend, 1);
        let first = add_probe(&mut manager, Vec3::ZERO);
        let second = add_probe(&mut manager, Vec3::new(10.0, 0.0, 0.0));
        init(&mut manager, &mut backend, first);
        init(&mut manager, &mut backend, second);

        assert_eq!(manager.probe(first).unwrap().texture_slice(), 0);
        let starved = manager.probe(second).unwrap();
        assert!(!starved.is_enabled());
        assert_eq!(starved.texture_slice(), INVALID_SLICE);
        assert_eq!(manager.strategy().free_slot_count(), 0);
    }

    #[test]
    fn destroying_a_probe_frees_its_slice_for_reuse() {
        let mut backend = MockBackend::new();
        let mut manager = pooled_manager(&mut backend, 1);
        let first = add_probe(&mut manager, Vec3::ZERO);
        let second = add_probe(&mut manager, Vec3::new(10.0, 0.0, 0.0));
        init(&mut manager, &mut backend, first);
        init(&mut manager, &mut backend, second);

        manager.destroy_probe(&mut backend, first).unwrap();
        assert_eq!(manager.strategy().free_slot_count(), 1);

        init(&mut manager, &mut backend, second);
        let revived = manager.probe(second).unwrap();
        assert_eq!(revived.texture_slice(), 0);
        // Starvation disabled it; reacquiring a slice does not re-enable.
        assert!(!revived.is_enabled());
    }

    #[test]
    fn destroying_a_foreign_probe_errors() {
        let mut backend = MockBackend::new();
        let mut manager = pooled_manager(&mut backend, 1);
        let result = manager.destroy_probe(&mut backend, ProbeId(99));
        assert!(matches!(result, Err(ProbeError::ForeignProbe(99))));
    }

    #[test]
    fn set_enabled_roundtrip_reinitializes_probes() {
        let mut backend = MockBackend::new();
        let mut manager = pooled_manager(&mut backend, 4);
        let fixed = add_probe(&mut manager, Vec3::ZERO);
        let roaming = add_probe(&mut manager, Vec3::new(8.0, 0.0, 0.0));
        manager
            .set_texture_params(&mut backend, roaming, texture_desc(), false)
            .unwrap();
        init(&mut manager, &mut backend, fixed);
        init(&mut manager, &mut backend, roaming);
        // Static probe: capture workspace; dynamic adds a clear workspace.
        assert_eq!(backend.live_workspaces.len(), 3);

        manager
            .set_enabled(&mut backend, false, 0, 0, 0, TextureFormat::Rgba8Unorm)
            .unwrap();
        assert!(!manager.is_pool_enabled());
        assert!(backend.live_workspaces.is_empty());
        assert!(backend.textures.is_empty());
        assert_eq!(manager.probe(fixed).unwrap().texture_slice(), INVALID_SLICE);

        manager
            .set_enabled(&mut backend, true, 64, 64, 4, TextureFormat::Rgba8Unorm)
            .unwrap();
        assert_eq!(backend.live_workspaces.len(), 3);
        let slice_a = manager.probe(fixed).unwrap().texture_slice();
        let slice_b = manager.probe(roaming).unwrap().texture_slice();
        assert_ne!(slice_a, INVALID_SLICE);
        assert_ne!(slice_b, INVALID_SLICE);
        assert_ne!(slice_a, slice_b);
    }

    #[test]
    fn full_rebuild_runs_one_frame_per_iteration() {
        let mut backend = MockBackend::new();
        backend.visibility_mask = 0x5;
        let mut manager = pooled_manager(&mut backend, 2);
        let id = add_probe(&mut manager, Vec3::ZERO);
        manager.probe_mut(id).unwrap().set_num_iterations(3);
        init(&mut manager, &mut backend, id);

        manager.update_all_dirty_probes(&mut backend);

        assert_eq!(backend.frame_begins, 3);
        assert_eq!(backend.frame_ends, 3);
        assert_eq!(backend.workspace_updates.len(), 3);
        assert_eq!(backend.slice_copies.len(), 3);
        assert_eq!(backend.scene_graph_updates, 1);
        assert_eq!(backend.frame_clears, 1);
        assert_eq!(backend.mask_history, vec![ALL_VISIBLE, 0x5]);
        assert_eq!(backend.visibility_mask, 0x5);

        let probe = manager.probe(id).unwrap();
        assert!(!probe.is_dirty());
        // Static captures keep light culling off between renders.
        assert!(!probe.camera().unwrap().light_culling_enabled);
    }

    #[test]
    fn dynamic_probe_rerenders_when_tracked_position_enters_its_area() {
        let mut backend = MockBackend::new();
        let mut manager = pooled_manager(&mut backend, 2);
        let id = add_probe(&mut manager, Vec3::ZERO);
        manager
            .set_texture_params(&mut backend, id, texture_desc(), false)
            .unwrap();
        init(&mut manager, &mut backend, id);
        manager.update_all_dirty_probes(&mut backend);
        assert!(!manager.probe(id).unwrap().is_dirty());
        let updates_after_flush = backend.workspace_updates.len();

        let camera = Camera {
            position: Vec3::new(0.5, 0.0, 0.0),
            ..Camera::default()
        };
        manager.set_updated_tracked_data_from_camera(&camera);
        manager.frame_started();
        manager.workspaces_before_begin(&mut backend);
        manager.workspaces_begin_update(&mut backend);

        assert_eq!(backend.workspace_updates.len(), updates_after_flush + 1);
    }

    #[test]
    fn clean_static_probe_ignores_the_tracked_position() {
        let mut backend = MockBackend::new();
        let mut manager = pooled_manager(&mut backend, 2);
        let id = add_probe(&mut manager, Vec3::ZERO);
        init(&mut manager, &mut backend, id);
        manager.update_all_dirty_probes(&mut backend);
        let updates_after_flush = backend.workspace_updates.len();

        let camera = Camera {
            position: Vec3::ZERO,
            ..Camera::default()
        };
        manager.set_updated_tracked_data_from_camera(&camera);
        manager.frame_started();
        manager.workspaces_before_begin(&mut backend);
        manager.workspaces_begin_update(&mut backend);
        assert_eq!(backend.workspace_updates.len(), updates_after_flush);

        manager.probe_mut(id).unwrap().mark_dirty();
        manager.frame_started();
        manager.workspaces_before_begin(&mut backend);
        manager.workspaces_begin_update(&mut backend);
        assert_eq!(backend.workspace_updates.len(), updates_after_flush + 1);
    }

    #[test]
    fn paused_manager_skips_frame_hooks() {
        let mut backend = MockBackend::new();
        let mut manager = pooled_manager(&mut backend, 1);
        let id = add_probe(&mut manager, Vec3::ZERO);
        init(&mut manager, &mut backend, id);
        manager.set_paused(true);

        manager.frame_started();
        manager.workspaces_before_begin(&mut backend);
        manager.workspaces_begin_update(&mut backend);

        assert!(backend.workspace_updates.is_empty());
        assert!(manager.probe(id).unwrap().is_dirty());
    }

    #[test]
    fn tmp_rtt_pool_is_shared_by_description() {
        let mut backend = MockBackend::new();
        let mut manager = PccManager::new(SlotStrategy::ManualSlots, "probe_capture");
        let first = add_probe(&mut manager, Vec3::ZERO);
        let second = add_probe(&mut manager, Vec3::new(8.0, 0.0, 0.0));
        manager
            .set_texture_params(&mut backend, first, texture_desc(), true)
            .unwrap();
        manager
            .set_texture_params(&mut backend, second, texture_desc(), true)
            .unwrap();
        init(&mut manager, &mut backend, first);
        init(&mut manager, &mut backend, second);
        // Two cubemaps plus one shared temporary target.
        assert_eq!(backend.textures.len(), 3);

        manager.destroy_probe(&mut backend, first).unwrap();
        assert_eq!(backend.textures.len(), 2);
        manager.destroy_probe(&mut backend, second).unwrap();
        assert!(backend.textures.is_empty());
    }

    #[test]
    fn manual_static_probe_copies_into_its_own_cubemap() {
        let mut backend = MockBackend::new();
        let mut manager = PccManager::new(SlotStrategy::ManualSlots, "probe_capture");
        let id = add_probe(&mut manager, Vec3::ZERO);
        manager
            .set_texture_params(&mut backend, id, texture_desc(), true)
            .unwrap();
        init(&mut manager, &mut backend, id);
        manager.probe_mut(id).unwrap().set_num_iterations(2);

        manager.update_all_dirty_probes(&mut backend);

        assert_eq!(backend.full_copies.len(), 2);
        assert!(backend.slice_copies.is_empty());
        let cube = manager.probe(id).unwrap().texture().unwrap();
        assert!(backend.full_copies.iter().all(|(_, dst)| *dst == cube));
    }

    #[test]
    fn depth_capture_takes_one_ticket_per_probe() {
        let mut backend = MockBackend::new();
        let mut manager = pooled_manager(&mut backend, 2);
        let first = add_probe(&mut manager, Vec3::ZERO);
        let second = add_probe(&mut manager, Vec3::new(8.0, 0.0, 0.0));
        init(&mut manager, &mut backend, first);
        init(&mut manager, &mut backend, second);
        manager.probe_mut(first).unwrap().set_num_iterations(2);
        manager.set_depth_capture(true);

        manager.update_all_dirty_probes(&mut backend);

        let tickets = manager.take_depth_readbacks();
        assert_eq!(tickets.len(), 2);
        assert!(manager.take_depth_readbacks().is_empty());
    }

    #[test]
    fn clear_scene_detaches_and_restores_proxies() {
        let mut backend = MockBackend::new();
        let mut manager = pooled_manager(&mut backend, 2);
        let live = add_probe(&mut manager, Vec3::ZERO);
        let bare = add_probe(&mut manager, Vec3::new(8.0, 0.0, 0.0));
        init(&mut manager, &mut backend, live);

        manager.prepare_for_clear_scene();
        assert!(manager.probes().iter().all(|probe| !probe.proxy().attached));

        manager.restore_from_clear_scene();
        assert!(manager.probe(live).unwrap().proxy().attached);
        assert!(!manager.probe(bare).unwrap().proxy().attached);
    }
}
