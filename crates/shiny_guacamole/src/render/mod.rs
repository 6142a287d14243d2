//! Rendering: backends, geometry, shaders and surfaces

pub mod backend;
pub mod backends;
pub mod mesh;
pub mod shader;
pub mod shapes;
pub mod surface;
pub mod transforms;

pub use backend::{GraphicsBackend, Key, KeyState, SurfaceDescriptor, SurfaceEvent};
pub use backends::{GlfwBackend, HeadlessBackend};
pub use mesh::{Mesh, MeshError, Vertex};
pub use shader::{ShaderCompileError, ShaderProgram, UniformResolutionWarning, UniformValue};
pub use shapes::{Drawable, Square, Triangle};
pub use surface::{RenderSurface, SurfaceCreationError, SurfaceId, SurfaceIdAllocator};
pub use transforms::FrameTransforms;
