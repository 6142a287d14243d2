//! Concrete graphics backends
//!
//! - **`opengl`**: GLFW windows with OpenGL contexts, driven through `glow`
//! - **`headless`**: in-memory backend that records every call; no display needed

pub mod headless;
pub mod opengl;

pub use headless::HeadlessBackend;
pub use opengl::GlfwBackend;
