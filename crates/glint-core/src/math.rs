//! Math utilities and helpers.

use glam::{Mat3, Mat4, Vec3, Vec4};

/// Axis-aligned bounding box stored as center + half-size.
///
/// Probe shapes, blend areas, and cluster bounds all reason about boxes
/// relative to their center, so the center/half-size form is primary and
/// min/max corners are derived.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    /// Box center
    pub center: Vec3,
    /// Half-size along each axis (non-negative)
    pub half_size: Vec3,
}

impl Aabb {
    /// Create a new AABB from center and half-size
    #[inline]
    pub const fn new(center: Vec3, half_size: Vec3) -> Self {
        Self { center, half_size }
    }

    /// Create an AABB from min and max corners
    #[inline]
    pub fn from_min_max(min: Vec3, max: Vec3) -> Self {
        Self {
            center: (min + max) * 0.5,
            half_size: (max - min) * 0.5,
        }
    }

    /// Get the minimum corner
    #[inline]
    pub fn min(&self) -> Vec3 {
        self.center - self.half_size
    }

    /// Get the maximum corner
    #[inline]
    pub fn max(&self) -> Vec3 {
        self.center + self.half_size
    }

    /// Get the full size of the AABB
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.half_size * 2.0
    }

    /// Check if a point is inside the AABB
    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        let d = (point - self.center).abs();
        d.x <= self.half_size.x && d.y <= self.half_size.y && d.z <= self.half_size.z
    }

    /// Check if another AABB is fully inside this one
    #[inline]
    pub fn contains_aabb(&self, other: &Self) -> bool {
        let d = (other.center - self.center).abs() + other.half_size;
        d.x <= self.half_size.x && d.y <= self.half_size.y && d.z <= self.half_size.z
    }

    /// Check if this AABB intersects another
    #[inline]
    pub fn intersects(&self, other: &Self) -> bool {
        let d = (other.center - self.center).abs();
        let s = self.half_size + other.half_size;
        d.x <= s.x && d.y <= s.y && d.z <= s.z
    }

    /// Merge two AABBs
    #[inline]
    pub fn merge(&self, other: &Self) -> Self {
        Self::from_min_max(self.min().min(other.min()), self.max().max(other.max()))
    }

    /// Clamp this AABB so it lies inside `bounds`, shrinking where needed.
    ///
    /// Each corner is clamped independently; a box entirely outside the
    /// bounds collapses to a degenerate box on the nearest face.
    pub fn clamped_to(&self, bounds: &Self) -> Self {
        let min = self.min().clamp(bounds.min(), bounds.max());
        let max = self.max().clamp(bounds.min(), bounds.max());
        Self::from_min_max(min, max.max(min))
    }

    /// Bounds of this box after an affine transform.
    ///
    /// The half-size is pushed through the absolute value of the upper 3x3,
    /// which yields the tight AABB of the transformed (possibly rotated) box.
    pub fn transformed(&self, matrix: &Mat4) -> Self {
        let center = matrix.transform_point3(self.center);
        let abs = Mat3::from_cols(
            matrix.x_axis.truncate().abs(),
            matrix.y_axis.truncate().abs(),
            matrix.z_axis.truncate().abs(),
        );
        Self {
            center,
            half_size: abs * self.half_size,
        }
    }
}

/// Frustum for culling operations.
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    /// Six frustum planes (left, right, bottom, top, near, far)
    /// Each plane is (nx, ny, nz, d) where n is normal and d is distance
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Extract frustum planes from view-projection matrix
    pub fn from_view_projection(vp: Mat4) -> Self {
        let row0 = vp.row(0);
        let row1 = vp.row(1);
        let row2 = vp.row(2);
        let row3 = vp.row(3);

        let planes = [
            (row3 + row0).normalize(), // Left
            (row3 - row0).normalize(), // Right
            (row3 + row1).normalize(), // Bottom
            (row3 - row1).normalize(), // Top
            (row3 + row2).normalize(), // Near
            (row3 - row2).normalize(), // Far
        ];

        Self { planes }
    }

    /// Test if an AABB is inside or intersects the frustum
    pub fn test_aabb(&self, aabb: &Aabb) -> bool {
        for plane in &self.planes {
            let normal = Vec3::new(plane.x, plane.y, plane.z);

            // Positive vertex: the corner furthest along the plane normal
            let p = aabb.center
                + Vec3::new(
                    normal.x.signum() * aabb.half_size.x,
                    normal.y.signum() * aabb.half_size.y,
                    normal.z.signum() * aabb.half_size.z,
                );

            if normal.dot(p) + plane.w < 0.0 {
                return false;
            }
        }
        true
    }
}
