//! Configuration system
//!
//! Every configurable piece of the environment lives in [`EnvironmentConfig`].
//! Files are TOML or RON, chosen by extension.

use std::path::{Path, PathBuf};

pub use serde::{Deserialize, Serialize};

use crate::foundation::math::{utils, Vec3};
use crate::render::backend::{ContextProfile, Key, SurfaceDescriptor};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        match extension(path) {
            Some("toml") => toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string())),
            Some("ron") => ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string())),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match extension(path) {
            Some("toml") => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
            Some("ron") => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?,
            _ => return Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Primary window settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Window title
    pub title: String,
    /// Width in screen coordinates
    pub width: u32,
    /// Height in screen coordinates
    pub height: u32,
    /// Horizontal screen position
    pub x: i32,
    /// Vertical screen position
    pub y: i32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Shiny Guacamole".to_string(),
            width: 800,
            height: 600,
            x: 100,
            y: 100,
        }
    }
}

impl WindowConfig {
    /// Descriptor for creating the window this config describes
    pub fn descriptor(&self) -> SurfaceDescriptor {
        SurfaceDescriptor::new(self.title.clone(), self.width, self.height).at(self.x, self.y)
    }
}

/// Requested OpenGL context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Profile
    pub profile: ContextProfile,
    /// Wait for vertical blank on present
    pub vsync: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            major: 3,
            minor: 3,
            profile: ContextProfile::Core,
            vsync: true,
        }
    }
}

/// Shader source locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    /// Vertex stage source file
    pub vertex: PathBuf,
    /// Fragment stage source file
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("resources/shaders/vertex.glsl"),
            fragment: PathBuf::from("resources/shaders/fragment.glsl"),
        }
    }
}

impl ShaderConfig {
    /// Resolved vertex shader path
    pub fn vertex_path(&self) -> PathBuf {
        resolve_resource(&self.vertex)
    }

    /// Resolved fragment shader path
    pub fn fragment_path(&self) -> PathBuf {
        resolve_resource(&self.fragment)
    }
}

/// Relative paths are tried against the working directory, then its parent
/// (running a workspace member from its own directory). The path is returned
/// unchanged when neither exists so the read error names what was configured.
fn resolve_resource(path: &Path) -> PathBuf {
    if path.is_absolute() || path.exists() {
        return path.to_path_buf();
    }

    let parent = Path::new("..").join(path);
    if parent.exists() {
        parent
    } else {
        path.to_path_buf()
    }
}

/// Fixed camera and demonstration transform used every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Model rotation axis
    pub model_axis: Vec3,
    /// Model rotation in degrees
    pub model_angle_degrees: f32,
    /// View translation
    pub view_offset: Vec3,
    /// Vertical field of view in degrees
    pub fov_degrees: f32,
    /// Width / height
    pub aspect: f32,
    /// Near clip plane
    pub near: f32,
    /// Far clip plane
    pub far: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            model_axis: Vec3::new(1.0, 0.0, 0.0),
            model_angle_degrees: -55.0,
            view_offset: Vec3::new(0.0, 0.0, -3.0),
            fov_degrees: 45.0,
            aspect: 800.0 / 600.0,
            near: 0.1,
            far: 100.0,
        }
    }
}

impl CameraConfig {
    /// Vertical field of view in radians
    pub fn fov_radians(&self) -> f32 {
        utils::deg_to_rad(self.fov_degrees)
    }
}

/// Everything needed to bring up an [`Environment`](crate::Environment)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Background color
    pub clear_color: [f32; 4],
    /// Key that closes the surface it is pressed on
    pub close_key: Key,
    /// Primary window
    pub window: WindowConfig,
    /// OpenGL context request
    pub context: ContextConfig,
    /// Default shader program sources
    pub shaders: ShaderConfig,
    /// Frame transforms
    pub camera: CameraConfig,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.1, 0.1, 0.1, 1.0],
            close_key: Key::Escape,
            window: WindowConfig::default(),
            context: ContextConfig::default(),
            shaders: ShaderConfig::default(),
            camera: CameraConfig::default(),
        }
    }
}

impl Config for EnvironmentConfig {}

impl EnvironmentConfig {
    /// Load from `path`, or use defaults when no such file exists
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::load_from_file(path)?;
            log::info!("Loaded configuration from {}", path.display());
            Ok(config)
        } else {
            log::info!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}
