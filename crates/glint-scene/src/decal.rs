//! Screen-projected decals binned by the clustered grid builder.

use glam::{Mat4, Vec3};
use glint_core::math::Aabb;
use glint_core::types::{RenderQueueId, VisibilityMask, ALL_VISIBLE};

/// A decal projector: a unit cube in local space, oriented and scaled by its
/// world transform, projecting textures onto geometry it overlaps.
#[derive(Debug, Clone)]
pub struct Decal {
    /// Local-to-world transform; the local volume is the origin-centered
    /// unit cube, so the transform's scale is the projector's full size
    pub world_from_local: Mat4,
    /// Slice of the diffuse texture array, `u32::MAX` when unused
    pub diffuse_slice: u32,
    /// Slice of the normal-map array, `u32::MAX` when unused
    pub normal_slice: u32,
    /// Slice of the emissive array, `u32::MAX` when unused
    pub emissive_slice: u32,
    /// Skip diffuse alpha when blending
    pub ignore_diffuse_alpha: bool,
    pub visibility_mask: VisibilityMask,
    pub render_queue: RenderQueueId,
}

impl Default for Decal {
    fn default() -> Self {
        Self {
            world_from_local: Mat4::IDENTITY,
            diffuse_slice: u32::MAX,
            normal_slice: u32::MAX,
            emissive_slice: u32::MAX,
            ignore_diffuse_alpha: false,
            visibility_mask: ALL_VISIBLE,
            render_queue: RenderQueueId::DECAL_FIRST,
        }
    }
}

impl Decal {
    /// World-space bounds of the projector volume.
    pub fn world_aabb(&self) -> Aabb {
        Aabb::new(Vec3::ZERO, Vec3::splat(0.5)).transformed(&self.world_from_local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_aabb_follows_transform() {
        let decal = Decal {
            world_from_local: Mat4::from_scale_rotation_translation(
                Vec3::new(4.0, 2.0, 6.0),
                glam::Quat::IDENTITY,
                Vec3::new(1.0, 2.0, 3.0),
            ),
            ..Decal::default()
        };
        let aabb = decal.world_aabb();
        assert_eq!(aabb.center, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(aabb.half_size, Vec3::new(2.0, 1.0, 3.0));
    }
}
