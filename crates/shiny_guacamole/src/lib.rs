//! # Shiny Guacamole
//!
//! A minimal real-time rendering scaffold: windows with OpenGL contexts, a
//! shared shader program, and shapes that draw themselves.
//!
//! ## Features
//!
//! - **Environment main loop**: poll input, clear, upload model/view/projection,
//!   draw every shape in insertion order, present
//! - **Multiple surfaces**: extra windows share the primary context's objects
//! - **Owned and borrowed drawables**: surfaces hold either a shared `Rc` or a
//!   `Weak` the caller keeps alive
//! - **Shader hot swap**: a failed replacement leaves the working program bound
//! - **Headless backend**: the whole loop runs without a display for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shiny_guacamole::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     shiny_guacamole::foundation::logging::init();
//!
//!     let mut env = Environment::new(EnvironmentConfig::default())?;
//!     env.spawn_shape(Square::new());
//!     env.spawn_shape(Square::with_transform(
//!         Vec3::new(0.5, 0.5, 1.0),
//!         Vec3::new(1.0, 0.0, 0.0),
//!     ));
//!     env.run()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod render;

mod environment;
#[cfg(test)]
mod environment_tests;

pub use environment::{Environment, EnvironmentError, EnvironmentState, IndexOutOfRange, LoopControl};

/// Common imports for users of the crate
pub mod prelude {
    pub use crate::{
        config::{Config, EnvironmentConfig},
        foundation::math::{Mat4, Transform, Vec3},
        render::{
            Drawable, GlfwBackend, GraphicsBackend, HeadlessBackend, Key, RenderSurface,
            ShaderProgram, Square, SurfaceDescriptor, Triangle,
        },
        Environment, EnvironmentError, LoopControl,
    };
}
