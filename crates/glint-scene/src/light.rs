//! Light descriptions consumed by the clustered grid builder.

use glam::Vec3;
use glint_core::math::Aabb;
use glint_core::types::{LightMask, VisibilityMask, ALL_VISIBLE};

/// Kind of light source, also the type tag written into the packed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightType {
    Directional,
    Point,
    Spot,
}

impl LightType {
    /// Tag value stored in the w lane of the packed position
    #[inline]
    pub const fn tag(self) -> f32 {
        match self {
            Self::Directional => 0.0,
            Self::Point => 1.0,
            Self::Spot => 2.0,
        }
    }
}

/// A light source, in world space.
#[derive(Debug, Clone)]
pub struct Light {
    pub light_type: LightType,
    pub position: Vec3,
    /// Normalized; meaningful for directional and spot lights
    pub direction: Vec3,
    pub diffuse: Vec3,
    pub specular: Vec3,
    /// Maximum influence distance
    pub attenuation_range: f32,
    pub attenuation_linear: f32,
    pub attenuation_quadratic: f32,
    /// Full inner cone angle, radians
    pub spot_inner_angle: f32,
    /// Full outer cone angle, radians
    pub spot_outer_angle: f32,
    pub spot_falloff: f32,
    /// Grouping mask forwarded into the packed record
    pub light_mask: LightMask,
    pub visibility_mask: VisibilityMask,
    /// Photometric profile row in the profile texture, 0 when unused
    pub profile_index: u16,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            light_type: LightType::Point,
            position: Vec3::ZERO,
            direction: Vec3::NEG_Z,
            diffuse: Vec3::ONE,
            specular: Vec3::ONE,
            attenuation_range: 100.0,
            attenuation_linear: 0.0,
            attenuation_quadratic: 0.0,
            spot_inner_angle: 30.0_f32.to_radians(),
            spot_outer_angle: 40.0_f32.to_radians(),
            spot_falloff: 1.0,
            light_mask: ALL_VISIBLE,
            visibility_mask: ALL_VISIBLE,
            profile_index: 0,
        }
    }
}

impl Light {
    /// Cosines of the half inner and half outer cone angles.
    #[inline]
    pub fn spot_cosines(&self) -> (f32, f32) {
        (
            (self.spot_inner_angle * 0.5).cos(),
            (self.spot_outer_angle * 0.5).cos(),
        )
    }

    /// World-space bounds of this light's influence.
    ///
    /// Directional lights are unbounded and return None; they are carried
    /// in the global list but never binned into grid cells.
    pub fn world_aabb(&self) -> Option<Aabb> {
        match self.light_type {
            LightType::Directional => None,
            LightType::Point | LightType::Spot => Some(Aabb::new(
                self.position,
                Vec3::splat(self.attenuation_range),
            )),
        }
    }
}
