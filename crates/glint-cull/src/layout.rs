//! GPU buffer layout for the packed light/decal/probe list.
//!
//! Lights, decals, and reflection probes share one linear buffer read by the
//! shading stage. Record sizes, field order, and section alignment are a
//! stable contract with the shaders: all lights first, then decals, then
//! probes, with the decal and probe sections each aligned to their own slot
//! granularity. Everything positional is in the current camera's view space;
//! the buffer is per-camera, not per-frame-global.

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec3, Vec4};
use glint_scene::{Decal, Light, LightType, ProbeProxy};

/// float4 slots occupied by one light record.
pub const LIGHT_FLOAT4_SLOTS: usize = 6;
/// float4 slots occupied by one decal record.
pub const DECAL_FLOAT4_SLOTS: usize = 4;
/// float4 slots occupied by one probe record.
pub const PROBE_FLOAT4_SLOTS: usize = 8;

const FLOAT4_BYTES: usize = 16;

pub const LIGHT_SLOT_BYTES: usize = LIGHT_FLOAT4_SLOTS * FLOAT4_BYTES;
pub const DECAL_SLOT_BYTES: usize = DECAL_FLOAT4_SLOTS * FLOAT4_BYTES;
pub const PROBE_SLOT_BYTES: usize = PROBE_FLOAT4_SLOTS * FLOAT4_BYTES;

/// Round `value` up to the next multiple of `multiple`.
#[inline]
pub const fn align_to(value: usize, multiple: usize) -> usize {
    (value + multiple - 1) / multiple * multiple
}

/// Total buffer size for the packed list.
///
/// The decal and probe sections only introduce alignment padding when they
/// are non-empty; a lights-only buffer is exactly `num_lights *
/// LIGHT_SLOT_BYTES`.
pub fn calculate_bytes_needed(num_lights: usize, num_decals: usize, num_probes: usize) -> usize {
    let mut total = num_lights * LIGHT_SLOT_BYTES;
    if num_decals > 0 {
        total = align_to(total, DECAL_SLOT_BYTES);
        total += num_decals * DECAL_SLOT_BYTES;
    }
    if num_probes > 0 {
        total = align_to(total, PROBE_SLOT_BYTES);
        total += num_probes * PROBE_SLOT_BYTES;
    }
    total
}

/// Per-type object counts and section offsets for one packed buffer.
///
/// Directional lights sit at the head of the light section and are never
/// binned into grid cells; the shader walks them globally using
/// `directional_lights`. Offsets are in float4 units from the buffer start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectCounts {
    pub directional_lights: u32,
    pub point_lights: u32,
    pub spot_lights: u32,
    pub decals: u32,
    pub probes: u32,
    pub decal_float4_offset: u32,
    pub probe_float4_offset: u32,
}

impl ObjectCounts {
    pub fn new(
        directional_lights: u32,
        point_lights: u32,
        spot_lights: u32,
        decals: u32,
        probes: u32,
    ) -> Self {
        let num_lights = (directional_lights + point_lights + spot_lights) as usize;

        let mut accum = num_lights * LIGHT_FLOAT4_SLOTS;
        if decals > 0 {
            accum = align_to(accum, DECAL_FLOAT4_SLOTS);
        }
        let decal_float4_offset = accum as u32;
        accum += decals as usize * DECAL_FLOAT4_SLOTS;
        if probes > 0 {
            accum = align_to(accum, PROBE_FLOAT4_SLOTS);
        }
        let probe_float4_offset = accum as u32;

        Self {
            directional_lights,
            point_lights,
            spot_lights,
            decals,
            probes,
            decal_float4_offset,
            probe_float4_offset,
        }
    }

    #[inline]
    pub fn total_lights(&self) -> u32 {
        self.directional_lights + self.point_lights + self.spot_lights
    }

    /// Byte size of the packed buffer these counts describe.
    pub fn bytes_needed(&self) -> usize {
        calculate_bytes_needed(
            self.total_lights() as usize,
            self.decals as usize,
            self.probes as usize,
        )
    }
}

/// One packed light, 6 float4s.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuLightRecord {
    /// View-space position, or view-space direction for directional lights.
    /// w = light type tag (0 directional, 1 point, 2 spot).
    pub position: Vec4,
    /// Diffuse colour; w carries the light mask bit pattern reinterpreted
    /// as a float so fine-grained per-object light masking survives the
    /// float buffer.
    pub diffuse: Vec4,
    pub specular: Vec4,
    /// (range, linear, quadratic, 1/range).
    pub attenuation: Vec4,
    /// View-space spot direction; w = encoded light profile row
    /// `(profile_index + 0.5) / profile_texture_height`.
    pub spot_direction: Vec4,
    /// (1/(cos(inner/2) - cos(outer/2)), cos(outer/2), falloff, 0).
    pub spot_params: Vec4,
}

impl GpuLightRecord {
    pub const SIZE: usize = LIGHT_SLOT_BYTES;

    pub fn from_light(
        light: &Light,
        view: &Mat4,
        view3: &Mat3,
        inv_profile_tex_height: f32,
    ) -> Self {
        let position = if light.light_type == LightType::Directional {
            *view3 * light.direction.normalize_or_zero()
        } else {
            view.transform_point3(light.position)
        };

        let spot_dir = *view3 * light.direction.normalize_or_zero();
        let (cos_inner, cos_outer) = light.spot_cosines();
        let profile = (f32::from(light.profile_index) + 0.5) * inv_profile_tex_height;

        Self {
            position: position.extend(light.light_type.tag()),
            diffuse: light.diffuse.extend(f32::from_bits(light.light_mask)),
            specular: light.specular.extend(0.0),
            attenuation: Vec4::new(
                light.attenuation_range,
                light.attenuation_linear,
                light.attenuation_quadratic,
                1.0 / light.attenuation_range,
            ),
            spot_direction: spot_dir.extend(profile),
            spot_params: Vec4::new(1.0 / (cos_inner - cos_outer), cos_outer, light.spot_falloff, 0.0),
        }
    }
}

/// One packed decal, 4 float4s.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuDecalRecord {
    /// Rows 0..3 of the inverse world-view affine transform (row-major 3x4).
    pub inv_world_view: [Vec4; 3],
    /// (diffuse slice, normal slice, emissive slice, ignore-diffuse-alpha).
    pub texture_slices: [u32; 4],
}

impl GpuDecalRecord {
    pub const SIZE: usize = DECAL_SLOT_BYTES;

    pub fn from_decal(decal: &Decal, view: &Mat4) -> Self {
        let inv_world_view = (*view * decal.world_from_local).inverse();

        Self {
            inv_world_view: [
                inv_world_view.row(0),
                inv_world_view.row(1),
                inv_world_view.row(2),
            ],
            texture_slices: [
                decal.diffuse_slice,
                decal.normal_slice,
                decal.emissive_slice,
                u32::from(decal.ignore_diffuse_alpha),
            ],
        }
    }
}

/// One packed reflection probe, 8 float4s.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuProbeRecord {
    /// Rows of `inv_orientation * inv_view3` (view space to probe local);
    /// the w lanes hold the view-space probe-shape center.
    pub row0_center_x: Vec4,
    pub row1_center_y: Vec4,
    pub row2_center_z: Vec4,
    /// Probe-shape half size; w = cubemap array slice index.
    pub half_size: Vec4,
    /// Capture position in probe-local space (w = 1).
    pub cubemap_pos_ls: Vec4,
    /// Capture position in view space (w = 1).
    pub cubemap_pos_vs: Vec4,
    pub inner_range: Vec4,
    pub outer_range: Vec4,
}

impl GpuProbeRecord {
    pub const SIZE: usize = PROBE_SLOT_BYTES;

    pub fn from_proxy(proxy: &ProbeProxy, view: &Mat4, inv_view3: &Mat3) -> Self {
        let view_to_local = proxy.inv_orientation * *inv_view3;
        let center_vs = view.transform_point3(proxy.probe_shape.center);
        let cubemap_pos_ls = proxy.cubemap_position_ls();
        let cubemap_pos_vs = view.transform_point3(proxy.cubemap_position);

        Self {
            row0_center_x: view_to_local.row(0).extend(center_vs.x),
            row1_center_y: view_to_local.row(1).extend(center_vs.y),
            row2_center_z: view_to_local.row(2).extend(center_vs.z),
            half_size: proxy.probe_shape.half_size.extend(proxy.texture_slice as f32),
            cubemap_pos_ls: cubemap_pos_ls.extend(1.0),
            cubemap_pos_vs: cubemap_pos_vs.extend(1.0),
            inner_range: proxy.inner_range.extend(0.0),
            outer_range: proxy.outer_range.extend(0.0),
        }
    }
}

/// View matrices derived once per packed-buffer fill.
pub struct PackingView {
    pub view: Mat4,
    pub view3: Mat3,
    pub inv_view3: Mat3,
}

impl PackingView {
    pub fn new(view: Mat4) -> Self {
        let view3 = Mat3::from_mat4(view);
        Self {
            view,
            view3,
            inv_view3: view3.inverse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Quat;
    use glint_core::Aabb;

    #[test]
    fn record_sizes_match_slot_constants() {
        assert_eq!(std::mem::size_of::<GpuLightRecord>(), 96);
        assert_eq!(std::mem::size_of::<GpuDecalRecord>(), 64);
        assert_eq!(std::mem::size_of::<GpuProbeRecord>(), 128);
        assert_eq!(GpuLightRecord::SIZE, LIGHT_SLOT_BYTES);
        assert_eq!(GpuDecalRecord::SIZE, DECAL_SLOT_BYTES);
        assert_eq!(GpuProbeRecord::SIZE, PROBE_SLOT_BYTES);
    }

    #[test]
    fn lights_only_buffer_has_no_padding() {
        assert_eq!(calculate_bytes_needed(0, 0, 0), 0);
        assert_eq!(calculate_bytes_needed(1, 0, 0), 96);
        assert_eq!(calculate_bytes_needed(7, 0, 0), 7 * 96);
    }

    #[test]
    fn section_alignment_matches_slot_granularity() {
        // 1 light = 96 B, decals start at the next 64 B boundary (128).
        assert_eq!(calculate_bytes_needed(1, 1, 0), 128 + 64);
        // 2 lights = 192 B, probes start at the next 128 B boundary (256).
        assert_eq!(calculate_bytes_needed(2, 0, 1), 256 + 128);
        // All three sections stacked.
        let bytes = calculate_bytes_needed(3, 2, 2);
        let after_lights = 3 * 96;
        let decal_start = align_to(after_lights, 64);
        let probe_start = align_to(decal_start + 2 * 64, 128);
        assert_eq!(bytes, probe_start + 2 * 128);
    }

    #[test]
    fn object_counts_offsets_in_float4_units() {
        let counts = ObjectCounts::new(1, 2, 0, 2, 1);
        assert_eq!(counts.total_lights(), 3);
        // 3 lights = 18 float4s, decals align to 4 -> 20.
        assert_eq!(counts.decal_float4_offset, 20);
        // 20 + 2*4 = 28, probes align to 8 -> 32.
        assert_eq!(counts.probe_float4_offset, 32);
        assert_eq!(counts.bytes_needed(), 32 * 16 + 128);
    }

    #[test]
    fn light_record_point_light_fields() {
        let light = Light {
            position: Vec3::new(1.0, 2.0, 3.0),
            diffuse: Vec3::new(0.5, 0.25, 0.125),
            light_mask: 0xDEAD_BEEF,
            ..Light::default()
        };
        let record = GpuLightRecord::from_light(&light, &Mat4::IDENTITY, &Mat3::IDENTITY, 1.0);

        assert_relative_eq!(record.position.x, 1.0);
        assert_relative_eq!(record.position.y, 2.0);
        assert_relative_eq!(record.position.z, 3.0);
        assert_relative_eq!(record.position.w, 1.0); // point tag
        assert_eq!(record.diffuse.w.to_bits(), 0xDEAD_BEEF);
        assert_relative_eq!(record.attenuation.w * record.attenuation.x, 1.0);
    }

    #[test]
    fn light_record_directional_stores_direction() {
        let light = Light {
            light_type: LightType::Directional,
            position: Vec3::new(100.0, 100.0, 100.0),
            direction: Vec3::new(0.0, -1.0, 0.0),
            ..Light::default()
        };
        let record = GpuLightRecord::from_light(&light, &Mat4::IDENTITY, &Mat3::IDENTITY, 1.0);

        assert_relative_eq!(record.position.x, 0.0);
        assert_relative_eq!(record.position.y, -1.0);
        assert_relative_eq!(record.position.z, 0.0);
        assert_relative_eq!(record.position.w, 0.0); // directional tag
    }

    #[test]
    fn light_record_spot_params_use_half_angles() {
        let light = Light {
            light_type: LightType::Spot,
            spot_inner_angle: 60f32.to_radians(),
            spot_outer_angle: 90f32.to_radians(),
            spot_falloff: 2.0,
            ..Light::default()
        };
        let record = GpuLightRecord::from_light(&light, &Mat4::IDENTITY, &Mat3::IDENTITY, 1.0);

        let cos_inner = 30f32.to_radians().cos();
        let cos_outer = 45f32.to_radians().cos();
        assert_relative_eq!(record.spot_params.x, 1.0 / (cos_inner - cos_outer), epsilon = 1e-5);
        assert_relative_eq!(record.spot_params.y, cos_outer, epsilon = 1e-6);
        assert_relative_eq!(record.spot_params.z, 2.0);
    }

    #[test]
    fn light_record_encodes_profile_row() {
        let light = Light {
            profile_index: 3,
            ..Light::default()
        };
        let record = GpuLightRecord::from_light(&light, &Mat4::IDENTITY, &Mat3::IDENTITY, 1.0 / 8.0);
        assert_relative_eq!(record.spot_direction.w, 3.5 / 8.0);
    }

    #[test]
    fn decal_record_inverts_world_view() {
        let decal = Decal {
            world_from_local: Mat4::from_translation(Vec3::new(4.0, 0.0, 0.0)),
            diffuse_slice: 7,
            normal_slice: 8,
            emissive_slice: u32::MAX,
            ignore_diffuse_alpha: true,
            ..Decal::default()
        };
        let record = GpuDecalRecord::from_decal(&decal, &Mat4::IDENTITY);

        // Inverse of a pure translation negates it; rows are (I | -t).
        assert_relative_eq!(record.inv_world_view[0].w, -4.0);
        assert_relative_eq!(record.inv_world_view[1].w, 0.0);
        assert_relative_eq!(record.inv_world_view[0].x, 1.0);
        assert_eq!(record.texture_slices, [7, 8, u32::MAX, 1]);
    }

    #[test]
    fn probe_record_identity_view_matches_local_data() {
        let proxy = ProbeProxy {
            probe_shape: Aabb::new(Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0)),
            cubemap_position: Vec3::new(2.0, 2.0, 3.0),
            inner_range: Vec3::splat(1.0),
            outer_range: Vec3::splat(4.0),
            texture_slice: 5,
            ..ProbeProxy::default()
        };
        let record = GpuProbeRecord::from_proxy(&proxy, &Mat4::IDENTITY, &Mat3::IDENTITY);

        assert_relative_eq!(record.row0_center_x.w, 1.0);
        assert_relative_eq!(record.row1_center_y.w, 2.0);
        assert_relative_eq!(record.row2_center_z.w, 3.0);
        assert_relative_eq!(record.half_size.x, 4.0);
        assert_relative_eq!(record.half_size.w, 5.0);
        // Capture position relative to the shape center.
        assert_relative_eq!(record.cubemap_pos_ls.x, 1.0);
        assert_relative_eq!(record.cubemap_pos_ls.y, 0.0);
        assert_relative_eq!(record.cubemap_pos_vs.x, 2.0);
        assert_relative_eq!(record.cubemap_pos_ls.w, 1.0);
        assert_relative_eq!(record.outer_range.x, 4.0);
    }

    #[test]
    fn probe_record_rotated_view_round_trips() {
        let rotation = Mat3::from_quat(Quat::from_rotation_y(std::f32::consts::FRAC_PI_2));
        let proxy = ProbeProxy {
            probe_shape: Aabb::new(Vec3::ZERO, Vec3::ONE),
            orientation: rotation,
            inv_orientation: rotation.inverse(),
            cubemap_position: Vec3::ZERO,
            ..ProbeProxy::default()
        };
        let view = Mat4::from_rotation_x(0.3) * Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0));
        let packing = PackingView::new(view);
        let record = GpuProbeRecord::from_proxy(&proxy, &packing.view, &packing.inv_view3);

        // The packed rows must take a view-space direction back to probe
        // local space: rows * view3 == inv_orientation.
        let rows = Mat3::from_cols(
            record.row0_center_x.truncate(),
            record.row1_center_y.truncate(),
            record.row2_center_z.truncate(),
        )
        .transpose();
        let recovered = rows * packing.view3;
        let expected = proxy.inv_orientation;
        for col in 0..3 {
            assert_relative_eq!(recovered.col(col).x, expected.col(col).x, epsilon = 1e-5);
            assert_relative_eq!(recovered.col(col).y, expected.col(col).y, epsilon = 1e-5);
            assert_relative_eq!(recovered.col(col).z, expected.col(col).z, epsilon = 1e-5);
        }
    }
}
