//! Per-frame transform pipeline
//!
//! Model, view and projection are recomputed from [`CameraConfig`] every frame.
//! Nothing carries over between frames.

use crate::config::CameraConfig;
use crate::foundation::math::{utils, Mat4, Mat4Ext};

/// The three matrices uploaded before any drawable renders
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTransforms {
    /// Demonstration rotation applied to every drawable
    pub model: Mat4,
    /// Camera offset
    pub view: Mat4,
    /// Perspective projection
    pub projection: Mat4,
}

impl FrameTransforms {
    /// Uniform names, in upload order
    pub const UNIFORMS: [&'static str; 3] = ["model", "view", "projection"];

    /// Compute this frame's matrices
    pub fn compute(camera: &CameraConfig) -> Self {
        Self {
            model: Mat4::rotation_about(
                camera.model_axis,
                utils::deg_to_rad(camera.model_angle_degrees),
            ),
            view: Mat4::translation(camera.view_offset),
            projection: projection_matrix(camera.fov_radians(), camera.aspect, camera.near, camera.far),
        }
    }

    /// `(name, matrix)` pairs in upload order
    pub fn uniforms(&self) -> [(&'static str, &Mat4); 3] {
        [
            (Self::UNIFORMS[0], &self.model),
            (Self::UNIFORMS[1], &self.view),
            (Self::UNIFORMS[2], &self.projection),
        ]
    }
}

/// Perspective projection; a pure function of its inputs
pub fn projection_matrix(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    Mat4::perspective(fov_y, aspect, near, far)
}
