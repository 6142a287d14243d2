//! Graphics backend capability surface
//!
//! The core never talks to a windowing library or a GL loader directly. It
//! drives a [`GraphicsBackend`], a small capability trait covering surface
//! lifetime, context switching, presentation, input queries, program
//! compilation and uniform upload. Two implementations ship with the crate:
//!
//! - [`GlfwBackend`](super::backends::GlfwBackend): GLFW windows with an
//!   OpenGL context driven through `glow`
//! - [`HeadlessBackend`](super::backends::HeadlessBackend): no GPU, records
//!   every call; used by the test-suite
//!
//! # Current context
//! "Current" is backend-global state, not per-surface state. Every operation
//! that issues graphics commands acts on whichever surface was last passed to
//! [`GraphicsBackend::make_current`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::mesh::{Mesh, MeshId};
use super::shader::{ShaderCompileError, UniformValue};
use super::surface::SurfaceCreationError;

slotmap::new_key_type! {
    /// Backend handle to a native surface (window + context)
    pub struct SurfaceHandle;

    /// Backend handle to a linked shader program
    pub struct ProgramHandle;
}

/// Backend handle to a resolved uniform slot of one program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub(crate) u32);

/// Backend initialization errors. These are fatal for the whole process.
#[derive(Error, Debug)]
pub enum BackendInitError {
    /// The windowing library could not be initialized
    #[error("windowing system initialization failed: {0}")]
    InitializationFailed(String),

    /// The requested context version/profile is not available
    #[error("OpenGL {major}.{minor} ({profile:?} profile) is not supported")]
    UnsupportedContext {
        /// Requested major version
        major: u32,
        /// Requested minor version
        minor: u32,
        /// Requested profile
        profile: ContextProfile,
    },

    /// Graphics function pointers could not be loaded
    #[error("failed to load graphics function pointers")]
    FunctionLoadFailed,
}

/// OpenGL context profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextProfile {
    /// Core profile (no deprecated functionality)
    Core,
    /// Compatibility profile
    Compat,
    /// Let the driver decide
    Any,
}

/// Parameters for creating a native surface
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceDescriptor {
    /// Window title
    pub title: String,
    /// Width in screen coordinates
    pub width: u32,
    /// Height in screen coordinates
    pub height: u32,
    /// Position of the top-left corner on screen
    pub position: (i32, i32),
}

impl SurfaceDescriptor {
    /// Create a descriptor positioned at the screen origin
    pub fn new(title: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            title: title.into(),
            width,
            height,
            position: (0, 0),
        }
    }

    /// Set the on-screen position
    #[must_use]
    pub const fn at(mut self, x: i32, y: i32) -> Self {
        self.position = (x, y);
        self
    }
}

/// Keys the core can query. Backends map their native key codes onto these.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Escape,
    Enter,
    Space,
    Tab,
    Q,
    W,
    A,
    S,
    D,
    Up,
    Down,
    Left,
    Right,
}

/// Pressed state of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Key is held down
    Pressed,
    /// Key is up
    Released,
}

bitflags::bitflags! {
    /// Which framebuffer planes to clear
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClearMask: u32 {
        /// Color buffer
        const COLOR = 0b01;
        /// Depth buffer
        const DEPTH = 0b10;
    }
}

/// Events reported by [`GraphicsBackend::poll_events`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// The framebuffer of a surface changed size (pixels)
    FramebufferResized {
        /// Affected surface
        surface: SurfaceHandle,
        /// New framebuffer width
        width: u32,
        /// New framebuffer height
        height: u32,
    },
    /// The OS asked for the surface to close
    CloseRequested {
        /// Affected surface
        surface: SurfaceHandle,
    },
}

/// Callback receiving backend error codes and descriptions
pub type ErrorCallback = Box<dyn FnMut(i32, &str)>;

/// Capability surface consumed by the core.
///
/// The trait is object safe; drawables receive `&mut dyn GraphicsBackend`.
/// Implementations are single-threaded: all calls happen on the thread that
/// drives the render loop.
pub trait GraphicsBackend {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    /// Create a native surface and its context.
    ///
    /// The new context is made current before returning.
    fn create_surface(
        &mut self,
        descriptor: &SurfaceDescriptor,
    ) -> Result<SurfaceHandle, SurfaceCreationError>;

    /// Release a native surface. Unknown handles are ignored.
    fn destroy_surface(&mut self, surface: SurfaceHandle);

    /// Make the surface's context current for subsequent graphics calls
    fn make_current(&mut self, surface: SurfaceHandle);

    /// Install the callback invoked for backend errors
    fn set_error_callback(&mut self, callback: ErrorCallback);

    /// Process pending OS events and return the ones the core cares about
    fn poll_events(&mut self) -> Vec<SurfaceEvent>;

    /// Present the surface's back buffer; may block on vsync
    fn swap_buffers(&mut self, surface: SurfaceHandle);

    /// Whether a close was requested for the surface
    fn should_close(&self, surface: SurfaceHandle) -> bool;

    /// Flag the surface for closing
    fn request_close(&mut self, surface: SurfaceHandle);

    /// Current state of `key` on the surface
    fn key_state(&self, surface: SurfaceHandle, key: Key) -> KeyState;

    /// Set the viewport of the current context
    fn set_viewport(&mut self, width: u32, height: u32);

    /// Clear the current framebuffer
    fn clear(&mut self, color: [f32; 4], mask: ClearMask);

    /// Compile and link a vertex + fragment program
    fn compile_program(
        &mut self,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<ProgramHandle, ShaderCompileError>;

    /// Delete a program. Unknown handles are ignored.
    fn delete_program(&mut self, program: ProgramHandle);

    /// Bind a program on the current context
    fn use_program(&mut self, program: ProgramHandle);

    /// Program bound on the current context, if any
    fn current_program(&self) -> Option<ProgramHandle>;

    /// Resolve an active uniform; `None` when the program has no such uniform
    fn uniform_location(&mut self, program: ProgramHandle, name: &str) -> Option<UniformLocation>;

    /// Write a uniform of the currently bound program
    fn set_uniform(&mut self, location: UniformLocation, value: &UniformValue);

    /// Issue an indexed triangle draw of `mesh` on the current context
    fn draw_mesh(&mut self, mesh: &Mesh);

    /// Release every native resource. Further calls are no-ops.
    fn terminate(&mut self);
}

/// Uploads owned by `surface` that were not drawn during `frame`.
///
/// Backends that cache GPU copies of meshes call this when a surface presents
/// so geometry that stopped being drawn (a removed shape, a rebuilt mesh) is
/// released instead of piling up.
pub(crate) fn stale_uploads<'a>(
    uploads: impl IntoIterator<Item = (&'a (SurfaceHandle, MeshId), u64)>,
    surface: SurfaceHandle,
    frame: u64,
) -> Vec<(SurfaceHandle, MeshId)> {
    uploads
        .into_iter()
        .filter(|((owner, _), last_drawn)| *owner == surface && *last_drawn < frame)
        .map(|(key, _)| *key)
        .collect()
}
