use crate::foundation::math::{Point3, Quat, Transform, Vec3};
use crate::render::backend::GraphicsBackend;
use crate::render::mesh::{Mesh, MeshError, Vertex};

use super::Drawable;

/// Unit quad centred on the origin, textured corner to corner
const UNIT_QUAD: [Vertex; 4] = [
    Vertex::new([0.5, 0.5, 0.0], [1.0, 1.0]),
    Vertex::new([0.5, -0.5, 0.0], [1.0, 0.0]),
    Vertex::new([-0.5, -0.5, 0.0], [0.0, 0.0]),
    Vertex::new([-0.5, 0.5, 0.0], [0.0, 1.0]),
];

const QUAD_INDICES: [u32; 6] = [0, 1, 3, 1, 2, 3];

/// Textured square built from two triangles
///
/// The local transform is baked into the vertices; changing it rebuilds the
/// mesh.
#[derive(Debug, Clone)]
pub struct Square {
    transform: Transform,
    mesh: Mesh,
}

impl Square {
    /// Unit square at the origin
    pub fn new() -> Self {
        Self::from_transform(Transform::identity())
    }

    /// Square of `size` centred at `position`
    pub fn with_transform(size: Vec3, position: Vec3) -> Self {
        Self::from_transform(Transform::from_size_position(size, position))
    }

    /// Square with a full local transform
    pub fn from_transform(transform: Transform) -> Self {
        let mesh = bake(&transform);
        Self { transform, mesh }
    }

    /// Build from caller-supplied quad corners.
    ///
    /// Fails if `indices` do not form whole triangles over `vertices`.
    pub fn from_components(vertices: Vec<Vertex>, indices: Vec<u32>) -> Result<Self, MeshError> {
        Ok(Self {
            transform: Transform::identity(),
            mesh: Mesh::new(vertices, indices, true)?,
        })
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
        self.rebuild();
    }

    /// Resize
    pub fn set_size(&mut self, size: Vec3) {
        self.transform.scale = size;
        self.rebuild();
    }

    /// Rotate about the centre
    pub fn set_rotation(&mut self, rotation: Quat) {
        self.transform.rotation = rotation;
        self.rebuild();
    }

    fn rebuild(&mut self) {
        self.mesh = bake(&self.transform);
    }
}

impl Default for Square {
    fn default() -> Self {
        Self::new()
    }
}

impl Drawable for Square {
    fn render(&self, gpu: &mut dyn GraphicsBackend) {
        gpu.draw_mesh(&self.mesh);
    }
}

fn bake(transform: &Transform) -> Mesh {
    let vertices = UNIT_QUAD
        .iter()
        .map(|v| {
            let p = transform.transform_point(Point3::from(v.position));
            Vertex::new([p.x, p.y, p.z], v.tex_coords)
        })
        .collect();

    Mesh::from_trusted(vertices, QUAD_INDICES.to_vec(), true)
}
