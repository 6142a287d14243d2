//! Shader programs and uniform upload
//!
//! A [`ShaderProgram`] wraps one linked vertex + fragment program owned by
//! the backend. Uniform locations are resolved on first use and cached by
//! name, including misses, so the per-frame upload path never asks the
//! backend twice for the same name.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::backend::{GraphicsBackend, ProgramHandle, UniformLocation};
use crate::config::ShaderConfig;
use crate::foundation::math::{Mat4, Vec2, Vec3, Vec4};

/// Programmable pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    /// Vertex stage
    Vertex,
    /// Fragment stage
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vertex => f.write_str("vertex"),
            Self::Fragment => f.write_str("fragment"),
        }
    }
}

/// Shader loading, compilation or link failure.
///
/// Recoverable: the caller may retry with corrected sources or keep using a
/// previously working program.
#[derive(Error, Debug)]
pub enum ShaderCompileError {
    /// A source file is missing or unreadable
    #[error("cannot read {stage} shader source `{}`: {source}", path.display())]
    Source {
        /// Stage the file was meant for
        stage: ShaderStage,
        /// Path that was read
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// A stage failed to compile
    #[error("{stage} shader failed to compile: {log}")]
    Compile {
        /// Failing stage
        stage: ShaderStage,
        /// Compiler info log
        log: String,
    },

    /// The stages compiled but did not link
    #[error("shader program failed to link: {log}")]
    Link {
        /// Linker info log
        log: String,
    },
}

/// Non-fatal uniform write failure. Rendering continues without the write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UniformResolutionWarning {
    /// The name is not an active uniform of the program
    #[error("`{0}` is not an active uniform of the program")]
    Unresolved(String),

    /// The program was not bound when the write was attempted
    #[error("uniform `{0}` written while the program is not bound")]
    ProgramNotBound(String),
}

/// Value that can be uploaded to a uniform slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    /// `float`
    Float(f32),
    /// `int` / sampler
    Int(i32),
    /// `vec2`
    Vec2(Vec2),
    /// `vec3`
    Vec3(Vec3),
    /// `vec4`
    Vec4(Vec4),
    /// `mat4`
    Mat4(Mat4),
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<i32> for UniformValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<Vec2> for UniformValue {
    fn from(value: Vec2) -> Self {
        Self::Vec2(value)
    }
}

impl From<Vec3> for UniformValue {
    fn from(value: Vec3) -> Self {
        Self::Vec3(value)
    }
}

impl From<Vec4> for UniformValue {
    fn from(value: Vec4) -> Self {
        Self::Vec4(value)
    }
}

impl From<Mat4> for UniformValue {
    fn from(value: Mat4) -> Self {
        Self::Mat4(value)
    }
}

/// A compiled and linked vertex + fragment program
#[derive(Debug)]
pub struct ShaderProgram {
    handle: ProgramHandle,
    locations: HashMap<String, Option<UniformLocation>>,
}

impl ShaderProgram {
    /// Compile and link a program from source text
    pub fn compile(
        gpu: &mut dyn GraphicsBackend,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<Self, ShaderCompileError> {
        let handle = gpu.compile_program(vertex_source, fragment_source)?;
        log::debug!("Compiled shader program {handle:?} on {}", gpu.name());

        Ok(Self {
            handle,
            locations: HashMap::new(),
        })
    }

    /// Read both stages from disk and compile them
    pub fn from_files(
        gpu: &mut dyn GraphicsBackend,
        vertex_path: &Path,
        fragment_path: &Path,
    ) -> Result<Self, ShaderCompileError> {
        let vertex_source = read_source(ShaderStage::Vertex, vertex_path)?;
        let fragment_source = read_source(ShaderStage::Fragment, fragment_path)?;

        log::info!(
            "Loading shaders: {} + {}",
            vertex_path.display(),
            fragment_path.display()
        );
        Self::compile(gpu, &vertex_source, &fragment_source)
    }

    /// Compile the program named by a shader configuration
    pub fn from_config(
        gpu: &mut dyn GraphicsBackend,
        config: &ShaderConfig,
    ) -> Result<Self, ShaderCompileError> {
        Self::from_files(gpu, &config.vertex_path(), &config.fragment_path())
    }

    /// Backend handle
    pub const fn handle(&self) -> ProgramHandle {
        self.handle
    }

    /// Bind as the current program on the current context
    pub fn bind(&self, gpu: &mut dyn GraphicsBackend) {
        gpu.use_program(self.handle);
    }

    /// Whether this program is bound on the current context
    pub fn is_bound(&self, gpu: &dyn GraphicsBackend) -> bool {
        gpu.current_program() == Some(self.handle)
    }

    /// Write a uniform of this program.
    ///
    /// The program must be bound. Unknown names and unbound writes are
    /// no-ops reported through the returned warning and the log; an unknown
    /// name logs at `warn` the first time and at `debug` afterwards.
    pub fn set_uniform(
        &mut self,
        gpu: &mut dyn GraphicsBackend,
        name: &str,
        value: impl Into<UniformValue>,
    ) -> Result<(), UniformResolutionWarning> {
        if !self.is_bound(gpu) {
            log::warn!("Uniform `{name}` written while program {:?} is not bound", self.handle);
            return Err(UniformResolutionWarning::ProgramNotBound(name.to_string()));
        }

        let location = match self.locations.get(name) {
            Some(cached) => *cached,
            None => {
                let resolved = gpu.uniform_location(self.handle, name);
                if resolved.is_none() {
                    log::warn!(
                        "Uniform `{name}` is not active in program {:?}; writes will be skipped",
                        self.handle
                    );
                }
                self.locations.insert(name.to_string(), resolved);
                resolved
            }
        };

        match location {
            Some(location) => {
                gpu.set_uniform(location, &value.into());
                Ok(())
            }
            None => {
                log::debug!("Skipping write to unresolved uniform `{name}`");
                Err(UniformResolutionWarning::Unresolved(name.to_string()))
            }
        }
    }

    /// Write a `mat4` uniform
    pub fn set_mat4(
        &mut self,
        gpu: &mut dyn GraphicsBackend,
        name: &str,
        matrix: &Mat4,
    ) -> Result<(), UniformResolutionWarning> {
        self.set_uniform(gpu, name, *matrix)
    }

    /// Number of names with a cached lookup result
    pub fn cached_uniform_count(&self) -> usize {
        self.locations.len()
    }

    /// Release the backend program
    pub fn delete(self, gpu: &mut dyn GraphicsBackend) {
        log::debug!("Deleting shader program {:?}", self.handle);
        gpu.delete_program(self.handle);
    }
}

fn read_source(stage: ShaderStage, path: &Path) -> Result<String, ShaderCompileError> {
    std::fs::read_to_string(path).map_err(|source| ShaderCompileError::Source {
        stage,
        path: path.to_path_buf(),
        source,
    })
}
