//! Camera and view management.

use glam::{Mat3, Mat4, Quat, Vec3};
use glint_core::math::Frustum;
use glint_core::types::{CameraId, VisibilityMask, ALL_VISIBLE};

/// Camera for rendering and culling.
#[derive(Debug, Clone)]
pub struct Camera {
    pub id: CameraId,
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    /// Objects whose visibility mask ANDs to zero with this are skipped
    pub visibility_mask: VisibilityMask,
    /// Static probe captures turn this off to skip per-pixel light culling
    pub light_culling_enabled: bool,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            id: CameraId::default(),
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
            visibility_mask: ALL_VISIBLE,
            light_culling_enabled: true,
        }
    }
}

impl Camera {
    /// Create a new camera looking at a target.
    pub fn new(id: CameraId, position: Vec3, target: Vec3, up: Vec3) -> Self {
        Self {
            id,
            position,
            direction: (target - position).normalize(),
            up,
            ..Self::default()
        }
    }

    /// Create a 90 degree square capture camera, as used for cubemap faces.
    pub fn capture(id: CameraId, position: Vec3, near: f32, far: f32) -> Self {
        Self {
            id,
            position,
            fov: std::f32::consts::FRAC_PI_2,
            aspect: 1.0,
            near,
            far,
            ..Self::default()
        }
    }

    /// Set the camera position.
    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    /// Look at a target position.
    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize();
    }

    /// Set the aspect ratio.
    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    /// Reorient this camera toward one face of a cubemap capture.
    pub fn face_towards(&mut self, face: CubemapFace) {
        self.direction = face.direction();
        self.up = face.up();
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far)
    }

    pub fn inverse_view_matrix(&self) -> Mat4 {
        self.view_matrix().inverse()
    }

    /// Get the view-projection matrix.
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Extract frustum planes from the current camera state.
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.view_projection_matrix())
    }

    /// Derived world pose, used by the cull cache to detect same-frame reuse.
    pub fn pose(&self) -> CameraPose {
        let right = self.direction.cross(self.up).normalize();
        let up = right.cross(self.direction);
        CameraPose {
            position: self.position,
            orientation: Quat::from_mat3(&Mat3::from_cols(right, up, -self.direction)),
        }
    }
}

/// Snapshot of a camera's world position and orientation.
///
/// Compared bit-for-bit: the cache treats any numeric difference as a pose
/// change, since a reused capture camera moves in exact steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    pub position: Vec3,
    pub orientation: Quat,
}

/// One face of a cubemap, in texture layer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CubemapFace {
    PositiveX,
    NegativeX,
    PositiveY,
    NegativeY,
    PositiveZ,
    NegativeZ,
}

impl CubemapFace {
    /// All faces in layer order
    pub const ALL: [Self; 6] = [
        Self::PositiveX,
        Self::NegativeX,
        Self::PositiveY,
        Self::NegativeY,
        Self::PositiveZ,
        Self::NegativeZ,
    ];

    /// Face from its texture layer index
    #[inline]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::PositiveX),
            1 => Some(Self::NegativeX),
            2 => Some(Self::PositiveY),
            3 => Some(Self::NegativeY),
            4 => Some(Self::PositiveZ),
            5 => Some(Self::NegativeZ),
            _ => None,
        }
    }

    /// Texture layer index of this face
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// View direction when capturing this face
    #[inline]
    pub const fn direction(self) -> Vec3 {
        match self {
            Self::PositiveX => Vec3::X,
            Self::NegativeX => Vec3::NEG_X,
            Self::PositiveY => Vec3::Y,
            Self::NegativeY => Vec3::NEG_Y,
            Self::PositiveZ => Vec3::Z,
            Self::NegativeZ => Vec3::NEG_Z,
        }
    }

    /// Up vector when capturing this face
    #[inline]
    pub const fn up(self) -> Vec3 {
        match self {
            Self::PositiveY => Vec3::Z,
            Self::NegativeY => Vec3::NEG_Z,
            _ => Vec3::NEG_Y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_changes_with_orientation() {
        let mut camera = Camera::default();
        let before = camera.pose();
        assert_eq!(before, camera.pose(), "pose derivation must be stable");

        camera.look_at(Vec3::new(10.0, 0.0, 0.0));
        assert_ne!(before, camera.pose());
        assert_eq!(before.position, camera.pose().position);
    }

    #[test]
    fn capture_camera_is_square() {
        let camera = Camera::capture(CameraId(7), Vec3::ONE, 0.02, 50.0);
        assert_eq!(camera.aspect, 1.0);
        approx::assert_relative_eq!(camera.fov, std::f32::consts::FRAC_PI_2);
        assert_eq!(camera.near, 0.02);
        assert_eq!(camera.far, 50.0);
    }

    #[test]
    fn face_basis_is_orthogonal() {
        for face in CubemapFace::ALL {
            let dot = face.direction().dot(face.up());
            assert!(dot.abs() < 1e-6, "{face:?} direction and up not orthogonal");
            assert_eq!(CubemapFace::from_index(face.index()), Some(face));
        }
        assert_eq!(CubemapFace::from_index(6), None);
    }

    #[test]
    fn frustum_sees_forward() {
        let camera = Camera::new(CameraId(1), Vec3::ZERO, Vec3::NEG_Z * 10.0, Vec3::Y);
        let frustum = camera.frustum();
        assert!(frustum.test_aabb(&glint_core::math::Aabb::new(
            Vec3::new(0.0, 0.0, -10.0),
            Vec3::ONE,
        )));
    }
}
