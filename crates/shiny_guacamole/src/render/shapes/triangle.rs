use crate::foundation::math::{Point3, Quat, Transform, Vec3};
use crate::render::backend::GraphicsBackend;
use crate::render::mesh::{Mesh, Vertex};

use super::Drawable;

const UNIT_TRIANGLE: [[f32; 3]; 3] = [[-0.5, -0.5, 0.0], [0.5, -0.5, 0.0], [0.0, 0.5, 0.0]];

/// Untextured triangle
#[derive(Debug, Clone)]
pub struct Triangle {
    transform: Transform,
    mesh: Mesh,
}

impl Triangle {
    /// Unit triangle at the origin
    pub fn new() -> Self {
        Self::from_transform(Transform::identity())
    }

    /// Triangle of `size` centred at `position`
    pub fn with_transform(size: Vec3, position: Vec3) -> Self {
        Self::from_transform(Transform::from_size_position(size, position))
    }

    /// Triangle with a full local transform
    pub fn from_transform(transform: Transform) -> Self {
        let mesh = bake(&transform);
        Self { transform, mesh }
    }

    /// Local transform
    pub const fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Current geometry
    pub const fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Move the centre to `position`
    pub fn set_position(&mut self, position: Vec3) {
        self.transform.position = position;
        self.mesh = bake(&self.transform);
    }

    /// Resize
    pub fn set_size(&mut self, size: Vec3) {
        self.transform.scale = size;
        self.mesh = bake(&self.transform);
    }

    /// Rotate about the centre
    pub fn set_rotation(&mut self, rotation: Quat) {
        self.transform.rotation = rotation;
        self.mesh = bake(&self.transform);
    }
}

fn bake(transform: &Transform) -> Mesh {
    let vertices = UNIT_TRIANGLE
        .iter()
        .map(|&corner| {
            let p = transform.transform_point(Point3::from(corner));
            Vertex::position_only([p.x, p.y, p.z])
        })
        .collect();

    Mesh::from_trusted(vertices, vec![0, 1, 2], false)
}

impl Default for Triangle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drawable for Triangle {
    fn render(&self, gpu: &mut dyn GraphicsBackend) {
        gpu.draw_mesh(&self.mesh);
    }
}
