//! Environment: the top-level orchestrator and its main loop
//!
//! An [`Environment`] owns the graphics backend, one primary surface, any
//! number of secondary surfaces, the shared shader program and a list of
//! shared-ownership drawables. Each call to [`Environment::step`] runs one
//! frame:
//!
//! 1. poll input: the configured close key requests close on its surface
//! 2. evaluate close: primary closing terminates the environment, a
//!    secondary closing destroys only that surface
//! 3. for every surface: make current, clear, bind the shader, upload
//!    `model`/`view`/`projection`, render drawables in insertion order, present
//! 4. poll backend events (framebuffer resize, OS close requests)
//!
//! The environment is `Running` from construction until close or
//! [`Environment::shutdown`], then `Terminated` for good.

use std::path::Path;
use std::rc::Rc;

use thiserror::Error;

use crate::config::EnvironmentConfig;
use crate::render::backend::{
    BackendInitError, ClearMask, ErrorCallback, GraphicsBackend, KeyState, SurfaceDescriptor,
    SurfaceEvent, SurfaceHandle,
};
use crate::render::backends::GlfwBackend;
use crate::render::shader::{ShaderCompileError, ShaderProgram};
use crate::render::shapes::{same_entity, Drawable};
use crate::render::surface::{RenderSurface, SurfaceCreationError, SurfaceId};
use crate::render::transforms::FrameTransforms;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    /// Rendering frames
    Running,
    /// Shut down; cannot be restarted
    Terminated,
}

/// Whether the main loop should keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// Render another frame
    Continue,
    /// Stop
    Exit,
}

/// Index-based removal outside the shape list
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("shape index {index} is out of range for {len} shape(s)")]
pub struct IndexOutOfRange {
    /// Requested index
    pub index: usize,
    /// Shape count at the time of the call
    pub len: usize,
}

/// Environment errors
#[derive(Error, Debug)]
pub enum EnvironmentError {
    /// The graphics backend could not start
    #[error("graphics backend: {0}")]
    Backend(#[from] BackendInitError),

    /// A surface could not be created
    #[error("surface: {0}")]
    Surface(#[from] SurfaceCreationError),

    /// A shader program could not be built
    #[error("shader: {0}")]
    Shader(#[from] ShaderCompileError),

    /// Shape index out of range
    #[error(transparent)]
    IndexOutOfRange(#[from] IndexOutOfRange),

    /// No surface with this id belongs to the environment
    #[error("no surface {0} in this environment")]
    UnknownSurface(SurfaceId),

    /// The environment has already shut down
    #[error("environment has been terminated")]
    Terminated,
}

enum ShaderSource<'a> {
    Config,
    Text { vertex: &'a str, fragment: &'a str },
}

/// Main loop driver
pub struct Environment<B: GraphicsBackend = GlfwBackend> {
    backend: B,
    config: EnvironmentConfig,
    primary: Option<RenderSurface>,
    secondary: Vec<RenderSurface>,
    shader: Option<ShaderProgram>,
    shapes: Vec<Rc<dyn Drawable>>,
    state: EnvironmentState,
    frames: u64,
}

impl Environment<GlfwBackend> {
    /// Start GLFW, open the primary window and compile the configured shaders
    pub fn new(config: EnvironmentConfig) -> Result<Self, EnvironmentError> {
        let backend = GlfwBackend::init(&config.context)?;
        Self::with_backend(backend, config)
    }
}

impl<B: GraphicsBackend> Environment<B> {
    /// Bring up an environment on `backend`, reading shaders from `config.shaders`
    pub fn with_backend(backend: B, config: EnvironmentConfig) -> Result<Self, EnvironmentError> {
        Self::bring_up(backend, config, &ShaderSource::Config)
    }

    /// Bring up an environment on `backend` with in-memory shader sources
    pub fn with_shader_sources(
        backend: B,
        config: EnvironmentConfig,
        vertex: &str,
        fragment: &str,
    ) -> Result<Self, EnvironmentError> {
        Self::bring_up(backend, config, &ShaderSource::Text { vertex, fragment })
    }

    fn bring_up(
        mut backend: B,
        config: EnvironmentConfig,
        shaders: &ShaderSource<'_>,
    ) -> Result<Self, EnvironmentError> {
        log::info!("Initializing environment on {} backend", backend.name());

        let primary = match RenderSurface::create(&mut backend, &config.window.descriptor()) {
            Ok(surface) => surface,
            Err(e) => {
                backend.terminate();
                return Err(e.into());
            }
        };

        let shader = match shaders {
            ShaderSource::Config => ShaderProgram::from_config(&mut backend, &config.shaders),
            ShaderSource::Text { vertex, fragment } => {
                ShaderProgram::compile(&mut backend, vertex, fragment)
            }
        };
        let shader = match shader {
            Ok(shader) => shader,
            Err(e) => {
                primary.destroy(&mut backend);
                backend.terminate();
                return Err(e.into());
            }
        };

        log::info!("Environment running, primary surface {}", primary.id());

        Ok(Self {
            backend,
            config,
            primary: Some(primary),
            secondary: Vec::new(),
            shader: Some(shader),
            shapes: Vec::new(),
            state: EnvironmentState::Running,
            frames: 0,
        })
    }

    /// Lifecycle state
    pub const fn state(&self) -> EnvironmentState {
        self.state
    }

    /// Whether frames are still being rendered
    pub fn is_running(&self) -> bool {
        self.state == EnvironmentState::Running
    }

    /// Frames rendered so far
    pub const fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Configuration the environment was built with
    pub const fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// The graphics backend
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the graphics backend
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Route backend error reports to `callback`
    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.backend.set_error_callback(callback);
    }

    fn ensure_running(&self) -> Result<(), EnvironmentError> {
        match self.state {
            EnvironmentState::Running => Ok(()),
            EnvironmentState::Terminated => Err(EnvironmentError::Terminated),
        }
    }

    // Shapes

    /// Append a shape shared with the caller
    pub fn add_shape(&mut self, shape: Rc<dyn Drawable>) {
        self.shapes.push(shape);
    }

    /// Take ownership of `shape`, append it, and hand back a shared handle
    pub fn spawn_shape<D: Drawable + 'static>(&mut self, shape: D) -> Rc<dyn Drawable> {
        let shape: Rc<dyn Drawable> = Rc::new(shape);
        self.shapes.push(Rc::clone(&shape));
        shape
    }

    /// Remove every entry that is the same entity as `shape`; returns how many
    pub fn remove_shape(&mut self, shape: &Rc<dyn Drawable>) -> usize {
        let before = self.shapes.len();
        self.shapes.retain(|held| !same_entity(held, shape));
        before - self.shapes.len()
    }

    /// Remove and return the shape at `index`
    pub fn remove_shape_at(&mut self, index: usize) -> Result<Rc<dyn Drawable>, IndexOutOfRange> {
        if index >= self.shapes.len() {
            return Err(IndexOutOfRange {
                index,
                len: self.shapes.len(),
            });
        }
        Ok(self.shapes.remove(index))
    }

    /// Shapes in render order
    pub fn shapes(&self) -> &[Rc<dyn Drawable>] {
        &self.shapes
    }

    // Surfaces

    /// The primary surface, until termination
    pub const fn primary(&self) -> Option<&RenderSurface> {
        self.primary.as_ref()
    }

    /// Mutable primary surface
    pub fn primary_mut(&mut self) -> Option<&mut RenderSurface> {
        self.primary.as_mut()
    }

    /// Open another window sharing the primary context's objects
    pub fn create_surface(&mut self, descriptor: &SurfaceDescriptor) -> Result<SurfaceId, EnvironmentError> {
        self.ensure_running()?;

        let surface = RenderSurface::create(&mut self.backend, descriptor)?;
        let id = surface.id();
        self.secondary.push(surface);
        Ok(id)
    }

    /// Every live surface, primary first
    pub fn surfaces(&self) -> impl Iterator<Item = &RenderSurface> {
        self.primary.iter().chain(self.secondary.iter())
    }

    /// Look a surface up by id
    pub fn surface(&self, id: SurfaceId) -> Option<&RenderSurface> {
        self.surfaces().find(|s| s.id() == id)
    }

    /// Mutable surface lookup
    pub fn surface_mut(&mut self, id: SurfaceId) -> Option<&mut RenderSurface> {
        self.primary
            .iter_mut()
            .chain(self.secondary.iter_mut())
            .find(|s| s.id() == id)
    }

    /// Close a surface. Closing the primary shuts the environment down.
    pub fn close_surface(&mut self, id: SurfaceId) -> Result<(), EnvironmentError> {
        self.ensure_running()?;

        if self.primary.as_ref().is_some_and(|p| p.id() == id) {
            self.shutdown();
            return Ok(());
        }

        let index = self
            .secondary
            .iter()
            .position(|s| s.id() == id)
            .ok_or(EnvironmentError::UnknownSurface(id))?;
        self.secondary.remove(index).destroy(&mut self.backend);
        Ok(())
    }

    fn surface_by_handle(&mut self, handle: SurfaceHandle) -> Option<&mut RenderSurface> {
        self.primary
            .iter_mut()
            .chain(self.secondary.iter_mut())
            .find(|s| s.handle() == handle)
    }

    // Shaders

    /// Replace the shared program with one read from disk.
    ///
    /// On failure the current program stays bound and in use.
    pub fn set_shaders(
        &mut self,
        vertex_path: impl AsRef<Path>,
        fragment_path: impl AsRef<Path>,
    ) -> Result<(), EnvironmentError> {
        self.ensure_running()?;
        self.make_primary_current();

        let program =
            ShaderProgram::from_files(&mut self.backend, vertex_path.as_ref(), fragment_path.as_ref())?;
        self.replace_shader(program);
        Ok(())
    }

    /// Replace the shared program with one compiled from source text.
    ///
    /// On failure the current program stays bound and in use.
    pub fn set_shader_sources(&mut self, vertex: &str, fragment: &str) -> Result<(), EnvironmentError> {
        self.ensure_running()?;
        self.make_primary_current();

        let program = ShaderProgram::compile(&mut self.backend, vertex, fragment)?;
        self.replace_shader(program);
        Ok(())
    }

    /// The shared program
    pub const fn shader(&self) -> Option<&ShaderProgram> {
        self.shader.as_ref()
    }

    fn make_primary_current(&mut self) {
        if let Some(primary) = &self.primary {
            primary.make_current(&mut self.backend);
        }
    }

    fn replace_shader(&mut self, program: ShaderProgram) {
        log::info!("Replacing shader program with {:?}", program.handle());
        if let Some(old) = self.shader.replace(program) {
            old.delete(&mut self.backend);
        }
    }

    // Main loop

    /// Ask the primary surface to close; the next step terminates
    pub fn request_close(&mut self) {
        if let Some(primary) = &self.primary {
            self.backend.request_close(primary.handle());
        }
    }

    /// Run one frame.
    ///
    /// Returns [`LoopControl::Exit`] once the primary surface has been asked
    /// to close, after shutting down. No frame is rendered in that call.
    pub fn step(&mut self) -> Result<LoopControl, EnvironmentError> {
        self.ensure_running()?;

        self.poll_input();

        if self.close_requested() {
            log::info!("Close requested after {} frame(s)", self.frames);
            self.shutdown();
            return Ok(LoopControl::Exit);
        }
        self.close_secondary_surfaces();

        self.render_frame();

        for event in self.backend.poll_events() {
            self.handle_event(event);
        }

        self.frames += 1;
        Ok(LoopControl::Continue)
    }

    /// Run frames until close
    pub fn run(&mut self) -> Result<(), EnvironmentError> {
        self.run_with(|_| LoopControl::Continue)
    }

    /// Run frames until close, calling `between_frames` after every frame.
    ///
    /// Shape and surface changes made in the callback take effect on the next
    /// frame. Returning [`LoopControl::Exit`] shuts the environment down.
    pub fn run_with<F>(&mut self, mut between_frames: F) -> Result<(), EnvironmentError>
    where
        F: FnMut(&mut Self) -> LoopControl,
    {
        log::info!("Starting main loop");

        while self.step()? == LoopControl::Continue {
            if between_frames(self) == LoopControl::Exit {
                self.shutdown();
                break;
            }
        }
        Ok(())
    }

    fn poll_input(&mut self) {
        let close_key = self.config.close_key;
        for surface in self.primary.iter().chain(self.secondary.iter()) {
            if self.backend.key_state(surface.handle(), close_key) == KeyState::Pressed {
                log::debug!("{close_key:?} pressed on surface {}", surface.id());
                self.backend.request_close(surface.handle());
            }
        }
    }

    fn close_requested(&self) -> bool {
        self.primary
            .as_ref()
            .map_or(true, |primary| primary.should_close(&self.backend))
    }

    fn close_secondary_surfaces(&mut self) {
        let (closing, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.secondary)
            .into_iter()
            .partition(|s| s.should_close(&self.backend));

        self.secondary = open;
        for surface in closing {
            surface.destroy(&mut self.backend);
        }
    }

    fn render_frame(&mut self) {
        let frame = self.frames;
        let Self {
            backend,
            config,
            primary,
            secondary,
            shader,
            shapes,
            ..
        } = self;
        let Some(shader) = shader.as_mut() else {
            return;
        };

        let transforms = FrameTransforms::compute(&config.camera);
        let clear_color = config.clear_color;

        if let Some(primary) = primary.as_ref() {
            draw_surface(backend, primary, shader, &transforms, clear_color, shapes);
        }
        for surface in secondary.iter() {
            draw_surface(backend, surface, shader, &transforms, clear_color, &[]);
        }

        log::trace!("Frame {frame} rendered");
    }

    fn handle_event(&mut self, event: SurfaceEvent) {
        match event {
            SurfaceEvent::FramebufferResized {
                surface,
                width,
                height,
            } => {
                let Self {
                    backend, primary, secondary, ..
                } = self;
                if let Some(target) = primary
                    .iter_mut()
                    .chain(secondary.iter_mut())
                    .find(|s| s.handle() == surface)
                {
                    target.handle_resize(backend, width, height);
                }
            }
            SurfaceEvent::CloseRequested { surface } => {
                if let Some(target) = self.surface_by_handle(surface) {
                    log::debug!("OS close request for surface {}", target.id());
                }
            }
        }
    }

    /// Destroy every surface, delete the program and release the backend
    pub fn shutdown(&mut self) {
        if self.state == EnvironmentState::Terminated {
            return;
        }

        self.make_primary_current();
        if let Some(shader) = self.shader.take() {
            shader.delete(&mut self.backend);
        }
        for surface in self.secondary.drain(..) {
            surface.destroy(&mut self.backend);
        }
        if let Some(primary) = self.primary.take() {
            primary.destroy(&mut self.backend);
        }
        self.backend.terminate();
        self.state = EnvironmentState::Terminated;

        log::info!("Environment terminated after {} frame(s)", self.frames);
    }
}

fn draw_surface(
    gpu: &mut dyn GraphicsBackend,
    surface: &RenderSurface,
    shader: &mut ShaderProgram,
    transforms: &FrameTransforms,
    clear_color: [f32; 4],
    shared: &[Rc<dyn Drawable>],
) {
    surface.make_current(gpu);
    gpu.clear(clear_color, ClearMask::COLOR | ClearMask::DEPTH);

    shader.bind(gpu);
    for (name, matrix) in transforms.uniforms() {
        // Unresolved names are already reported by the program
        shader.set_mat4(gpu, name, matrix).ok();
    }

    for shape in shared {
        shape.render(gpu);
    }
    surface.draw(gpu);
    surface.present(gpu);
}

impl<B: GraphicsBackend> Drop for Environment<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
