//! CPU-side geometry for drawables
//!
//! A [`Mesh`] is immutable once built. Backends key their GPU-side copies by
//! [`MeshId`], so changing geometry means building a new mesh with a new id.

use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// Process-unique mesh identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(u64);

impl MeshId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Interleaved vertex: position followed by texture coordinates
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Position
    pub position: [f32; 3],
    /// Texture coordinates; zero when the mesh has none
    pub tex_coords: [f32; 2],
}

impl Vertex {
    /// Vertex with texture coordinates
    pub const fn new(position: [f32; 3], tex_coords: [f32; 2]) -> Self {
        Self {
            position,
            tex_coords,
        }
    }

    /// Vertex without texture coordinates
    pub const fn position_only(position: [f32; 3]) -> Self {
        Self {
            position,
            tex_coords: [0.0, 0.0],
        }
    }
}

/// Malformed geometry handed to [`Mesh::new`]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MeshError {
    /// The index list does not describe whole triangles
    #[error("index count {0} is not a multiple of 3")]
    IncompleteTriangle(usize),

    /// An index points past the vertex list
    #[error("index {index} out of range for {vertex_count} vertices")]
    IndexOutOfBounds {
        /// Offending index value
        index: u32,
        /// Number of vertices
        vertex_count: usize,
    },

    /// No geometry at all
    #[error("mesh has no triangles")]
    Empty,
}

/// Indexed triangle list
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    id: MeshId,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    has_tex_coords: bool,
}

impl Mesh {
    /// Validate and build a mesh
    pub fn new(
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
        has_tex_coords: bool,
    ) -> Result<Self, MeshError> {
        if indices.is_empty() {
            return Err(MeshError::Empty);
        }
        if indices.len() % 3 != 0 {
            return Err(MeshError::IncompleteTriangle(indices.len()));
        }
        if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(MeshError::IndexOutOfBounds {
                index,
                vertex_count: vertices.len(),
            });
        }

        Ok(Self {
            id: MeshId::next(),
            vertices,
            indices,
            has_tex_coords,
        })
    }

    /// Build from geometry the crate generates itself
    pub(crate) fn from_trusted(vertices: Vec<Vertex>, indices: Vec<u32>, has_tex_coords: bool) -> Self {
        debug_assert!(indices.len() % 3 == 0);
        debug_assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));

        Self {
            id: MeshId::next(),
            vertices,
            indices,
            has_tex_coords,
        }
    }

    /// Identifier used by backends to cache uploads
    pub const fn id(&self) -> MeshId {
        self.id
    }

    /// Vertex data
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    /// Triangle indices
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Whether the texture coordinate attribute is meaningful
    pub const fn has_tex_coords(&self) -> bool {
        self.has_tex_coords
    }

    /// Vertex data as raw bytes for upload
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index data as raw bytes for upload
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}
