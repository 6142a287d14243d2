//! GLFW + OpenGL backend
//!
//! Windows and contexts come from GLFW; GL calls go through `glow`. Every
//! surface after the first is created sharing the first surface's context, so
//! programs and buffers are visible from every surface. Vertex array objects
//! are not shareable between contexts, so uploaded meshes are cached per
//! surface. An upload that a surface did not draw during a frame is released
//! when that surface presents.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashMap;

use glfw::Context as _;
use glow::HasContext;
use slotmap::SlotMap;

use crate::config::ContextConfig;
use crate::render::backend::{
    stale_uploads, BackendInitError, ClearMask, ContextProfile, ErrorCallback, GraphicsBackend, Key, KeyState,
    ProgramHandle, SurfaceDescriptor, SurfaceEvent, SurfaceHandle, UniformLocation,
};
use crate::render::mesh::{Mesh, MeshId, Vertex};
use crate::render::shader::{ShaderCompileError, ShaderStage, UniformValue};
use crate::render::surface::SurfaceCreationError;

const MIN_CONTEXT_VERSION: (u32, u32) = (3, 3);

thread_local! {
    static ERROR_CALLBACK: RefCell<Option<ErrorCallback>> = RefCell::new(None);
}

#[allow(clippy::needless_pass_by_value)]
fn report_glfw_error(error: glfw::Error, description: String) {
    log::error!("GLFW error {error:?}: {description}");
    ERROR_CALLBACK.with(|slot| {
        if let Some(callback) = slot.borrow_mut().as_mut() {
            callback(error as i32, &description);
        }
    });
}

struct GlfwSurface {
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
    bound_program: Option<ProgramHandle>,
    frame: u64,
}

struct GpuMesh {
    vao: glow::VertexArray,
    vbo: glow::Buffer,
    ebo: glow::Buffer,
    index_count: i32,
    last_drawn: u64,
}

/// GLFW windows with OpenGL contexts
pub struct GlfwBackend {
    glfw: Option<glfw::Glfw>,
    context: ContextConfig,
    gl: Option<glow::Context>,
    surfaces: SlotMap<SurfaceHandle, GlfwSurface>,
    programs: SlotMap<ProgramHandle, glow::Program>,
    locations: HashMap<u32, (ProgramHandle, glow::UniformLocation)>,
    next_location: u32,
    meshes: HashMap<(SurfaceHandle, MeshId), GpuMesh>,
    current: Option<SurfaceHandle>,
}

impl GlfwBackend {
    /// Initialize GLFW and record the context hints for later surfaces
    pub fn init(context: &ContextConfig) -> Result<Self, BackendInitError> {
        // Vertex array objects and `layout` qualifiers need 3.3
        if (context.major, context.minor) < MIN_CONTEXT_VERSION {
            return Err(BackendInitError::UnsupportedContext {
                major: context.major,
                minor: context.minor,
                profile: context.profile,
            });
        }

        let mut glfw = glfw::init(report_glfw_error)
            .map_err(|e| BackendInitError::InitializationFailed(format!("{e:?}")))?;

        glfw.window_hint(glfw::WindowHint::ContextVersion(context.major, context.minor));
        glfw.window_hint(glfw::WindowHint::OpenGlProfile(match context.profile {
            ContextProfile::Core => glfw::OpenGlProfileHint::Core,
            ContextProfile::Compat => glfw::OpenGlProfileHint::Compat,
            ContextProfile::Any => glfw::OpenGlProfileHint::Any,
        }));
        if cfg!(target_os = "macos") {
            glfw.window_hint(glfw::WindowHint::OpenGlForwardCompat(true));
        }
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        log::info!(
            "GLFW initialized, requesting OpenGL {}.{} {:?}",
            context.major,
            context.minor,
            context.profile
        );

        Ok(Self {
            glfw: Some(glfw),
            context: context.clone(),
            gl: None,
            surfaces: SlotMap::with_key(),
            programs: SlotMap::with_key(),
            locations: HashMap::new(),
            next_location: 0,
            meshes: HashMap::new(),
            current: None,
        })
    }

    fn delete_mesh(gl: &glow::Context, mesh: GpuMesh) {
        unsafe {
            gl.delete_vertex_array(mesh.vao);
            gl.delete_buffer(mesh.vbo);
            gl.delete_buffer(mesh.ebo);
        }
    }
}

fn map_key(key: Key) -> glfw::Key {
    match key {
        Key::Escape => glfw::Key::Escape,
        Key::Enter => glfw::Key::Enter,
        Key::Space => glfw::Key::Space,
        Key::Tab => glfw::Key::Tab,
        Key::Q => glfw::Key::Q,
        Key::W => glfw::Key::W,
        Key::A => glfw::Key::A,
        Key::S => glfw::Key::S,
        Key::D => glfw::Key::D,
        Key::Up => glfw::Key::Up,
        Key::Down => glfw::Key::Down,
        Key::Left => glfw::Key::Left,
        Key::Right => glfw::Key::Right,
    }
}

fn to_gl_size(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

unsafe fn compile_stage(
    gl: &glow::Context,
    stage: ShaderStage,
    source: &str,
) -> Result<glow::Shader, ShaderCompileError> {
    let kind = match stage {
        ShaderStage::Vertex => glow::VERTEX_SHADER,
        ShaderStage::Fragment => glow::FRAGMENT_SHADER,
    };

    let shader = gl
        .create_shader(kind)
        .map_err(|log| ShaderCompileError::Compile { stage, log })?;
    gl.shader_source(shader, source);
    gl.compile_shader(shader);

    if gl.get_shader_compile_status(shader) {
        Ok(shader)
    } else {
        let log = gl.get_shader_info_log(shader);
        gl.delete_shader(shader);
        Err(ShaderCompileError::Compile { stage, log })
    }
}

unsafe fn upload_mesh(gl: &glow::Context, mesh: &Mesh) -> Result<GpuMesh, String> {
    let vao = gl.create_vertex_array()?;
    let vbo = gl.create_buffer()?;
    let ebo = gl.create_buffer()?;

    gl.bind_vertex_array(Some(vao));

    gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
    gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, mesh.vertex_bytes(), glow::STATIC_DRAW);

    gl.bind_buffer(glow::ELEMENT_ARRAY_BUFFER, Some(ebo));
    gl.buffer_data_u8_slice(glow::ELEMENT_ARRAY_BUFFER, mesh.index_bytes(), glow::STATIC_DRAW);

    let stride = std::mem::size_of::<Vertex>() as i32;
    gl.vertex_attrib_pointer_f32(0, 3, glow::FLOAT, false, stride, 0);
    gl.enable_vertex_attrib_array(0);
    if mesh.has_tex_coords() {
        let offset = std::mem::size_of::<[f32; 3]>() as i32;
        gl.vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, stride, offset);
        gl.enable_vertex_attrib_array(1);
    }

    gl.bind_vertex_array(None);

    Ok(GpuMesh {
        vao,
        vbo,
        ebo,
        index_count: i32::try_from(mesh.indices().len()).map_err(|e| e.to_string())?,
        last_drawn: 0,
    })
}

impl GraphicsBackend for GlfwBackend {
    fn name(&self) -> &'static str {
        "glfw-opengl"
    }

    fn create_surface(
        &mut self,
        descriptor: &SurfaceDescriptor,
    ) -> Result<SurfaceHandle, SurfaceCreationError> {
        let glfw = self
            .glfw
            .as_mut()
            .ok_or(SurfaceCreationError::BackendTerminated)?;

        let created = match self.surfaces.values().next() {
            Some(existing) => existing.window.create_shared(
                descriptor.width,
                descriptor.height,
                &descriptor.title,
                glfw::WindowMode::Windowed,
            ),
            None => glfw.create_window(
                descriptor.width,
                descriptor.height,
                &descriptor.title,
                glfw::WindowMode::Windowed,
            ),
        };
        let (mut window, events) = created.ok_or_else(|| SurfaceCreationError::ContextUnavailable {
            title: descriptor.title.clone(),
        })?;

        window.set_pos(descriptor.position.0, descriptor.position.1);
        window.set_framebuffer_size_polling(true);
        window.set_close_polling(true);
        window.make_current();

        glfw.set_swap_interval(if self.context.vsync {
            glfw::SwapInterval::Sync(1)
        } else {
            glfw::SwapInterval::None
        });

        if self.gl.is_none() {
            if window.get_proc_address("glClear").is_null() {
                return Err(SurfaceCreationError::FunctionLoad(
                    BackendInitError::FunctionLoadFailed,
                ));
            }
            let gl = unsafe {
                glow::Context::from_loader_function(|name| window.get_proc_address(name) as *const _)
            };
            log::info!("Loaded OpenGL: {}", unsafe { gl.get_parameter_string(glow::VERSION) });
            self.gl = Some(gl);
        }

        if let Some(gl) = self.gl.as_ref() {
            let (width, height) = window.get_framebuffer_size();
            unsafe {
                gl.viewport(0, 0, width, height);
                gl.enable(glow::DEPTH_TEST);
            }
        }

        let handle = self.surfaces.insert(GlfwSurface {
            window,
            events,
            bound_program: None,
            frame: 0,
        });
        self.current = Some(handle);
        Ok(handle)
    }

    fn destroy_surface(&mut self, surface: SurfaceHandle) {
        let Some(mut removed) = self.surfaces.remove(surface) else {
            return;
        };

        removed.window.make_current();
        let stale: Vec<_> = self
            .meshes
            .keys()
            .filter(|(owner, _)| *owner == surface)
            .copied()
            .collect();
        for key in stale {
            if let (Some(mesh), Some(gl)) = (self.meshes.remove(&key), self.gl.as_ref()) {
                Self::delete_mesh(gl, mesh);
            }
        }

        drop(removed);

        // Destroying a window leaves no context current; restore the previous one
        match self.current.filter(|&c| c != surface) {
            Some(previous) => self.make_current(previous),
            None => self.current = None,
        }
    }

    fn make_current(&mut self, surface: SurfaceHandle) {
        match self.surfaces.get_mut(surface) {
            Some(s) => {
                s.window.make_current();
                self.current = Some(surface);
            }
            None => log::error!("make_current on unknown surface {surface:?}"),
        }
    }

    fn set_error_callback(&mut self, callback: ErrorCallback) {
        ERROR_CALLBACK.with(|slot| *slot.borrow_mut() = Some(callback));
    }

    fn poll_events(&mut self) -> Vec<SurfaceEvent> {
        let Some(glfw) = self.glfw.as_mut() else {
            return Vec::new();
        };
        glfw.poll_events();

        let mut events = Vec::new();
        for (handle, surface) in &self.surfaces {
            for (_, event) in glfw::flush_messages(&surface.events) {
                match event {
                    glfw::WindowEvent::FramebufferSize(width, height) => {
                        events.push(SurfaceEvent::FramebufferResized {
                            surface: handle,
                            width: u32::try_from(width).unwrap_or(0),
                            height: u32::try_from(height).unwrap_or(0),
                        });
                    }
                    glfw::WindowEvent::Close => {
                        events.push(SurfaceEvent::CloseRequested { surface: handle });
                    }
                    _ => {}
                }
            }
        }
        events
    }

    fn swap_buffers(&mut self, surface: SurfaceHandle) {
        let Some(s) = self.surfaces.get_mut(surface) else {
            return;
        };
        s.window.swap_buffers();
        let frame = s.frame;
        s.frame += 1;

        // Deleting needs this surface's context; otherwise wait for its next present
        if self.current != Some(surface) {
            return;
        }
        let stale = stale_uploads(
            self.meshes.iter().map(|(key, mesh)| (key, mesh.last_drawn)),
            surface,
            frame,
        );
        for key in stale {
            if let (Some(mesh), Some(gl)) = (self.meshes.remove(&key), self.gl.as_ref()) {
                log::trace!("Released mesh {:?} from surface {surface:?}", key.1);
                Self::delete_mesh(gl, mesh);
            }
        }
    }

    fn should_close(&self, surface: SurfaceHandle) -> bool {
        self.surfaces
            .get(surface)
            .map_or(true, |s| s.window.should_close())
    }

    fn request_close(&mut self, surface: SurfaceHandle) {
        if let Some(s) = self.surfaces.get_mut(surface) {
            s.window.set_should_close(true);
        }
    }

    fn key_state(&self, surface: SurfaceHandle, key: Key) -> KeyState {
        match self.surfaces.get(surface) {
            Some(s) if s.window.get_key(map_key(key)) == glfw::Action::Press => KeyState::Pressed,
            _ => KeyState::Released,
        }
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        if let Some(gl) = self.gl.as_ref() {
            unsafe { gl.viewport(0, 0, to_gl_size(width), to_gl_size(height)) };
        }
    }

    fn clear(&mut self, color: [f32; 4], mask: ClearMask) {
        let Some(gl) = self.gl.as_ref() else {
            return;
        };

        let mut bits = 0;
        if mask.contains(ClearMask::COLOR) {
            bits |= glow::COLOR_BUFFER_BIT;
        }
        if mask.contains(ClearMask::DEPTH) {
            bits |= glow::DEPTH_BUFFER_BIT;
        }

        unsafe {
            gl.clear_color(color[0], color[1], color[2], color[3]);
            gl.clear(bits);
        }
    }

    fn compile_program(
        &mut self,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<ProgramHandle, ShaderCompileError> {
        let Some(gl) = self.gl.as_ref() else {
            return Err(ShaderCompileError::Link {
                log: "no OpenGL context has been created yet".to_string(),
            });
        };

        unsafe {
            let vertex = compile_stage(gl, ShaderStage::Vertex, vertex_source)?;
            let fragment = match compile_stage(gl, ShaderStage::Fragment, fragment_source) {
                Ok(fragment) => fragment,
                Err(e) => {
                    gl.delete_shader(vertex);
                    return Err(e);
                }
            };

            let program = match gl.create_program() {
                Ok(program) => program,
                Err(log) => {
                    gl.delete_shader(vertex);
                    gl.delete_shader(fragment);
                    return Err(ShaderCompileError::Link { log });
                }
            };

            gl.attach_shader(program, vertex);
            gl.attach_shader(program, fragment);
            gl.link_program(program);
            let linked = gl.get_program_link_status(program);

            gl.detach_shader(program, vertex);
            gl.detach_shader(program, fragment);
            gl.delete_shader(vertex);
            gl.delete_shader(fragment);

            if !linked {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(ShaderCompileError::Link { log });
            }

            Ok(self.programs.insert(program))
        }
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if let (Some(native), Some(gl)) = (self.programs.remove(program), self.gl.as_ref()) {
            unsafe { gl.delete_program(native) };
            self.locations.retain(|_, (owner, _)| *owner != program);
            for surface in self.surfaces.values_mut() {
                if surface.bound_program == Some(program) {
                    surface.bound_program = None;
                }
            }
        }
    }

    fn use_program(&mut self, program: ProgramHandle) {
        let (Some(gl), Some(&native)) = (self.gl.as_ref(), self.programs.get(program)) else {
            log::error!("use_program with unknown program {program:?}");
            return;
        };
        unsafe { gl.use_program(Some(native)) };

        if let Some(s) = self.current.and_then(|h| self.surfaces.get_mut(h)) {
            s.bound_program = Some(program);
        }
    }

    fn current_program(&self) -> Option<ProgramHandle> {
        self.current
            .and_then(|h| self.surfaces.get(h))
            .and_then(|s| s.bound_program)
    }

    fn uniform_location(&mut self, program: ProgramHandle, name: &str) -> Option<UniformLocation> {
        let gl = self.gl.as_ref()?;
        let native = *self.programs.get(program)?;
        let location = unsafe { gl.get_uniform_location(native, name) }?;

        let index = self.next_location;
        self.next_location = self.next_location.checked_add(1)?;
        self.locations.insert(index, (program, location));
        Some(UniformLocation(index))
    }

    fn set_uniform(&mut self, location: UniformLocation, value: &UniformValue) {
        let (Some(gl), Some((_, loc))) = (self.gl.as_ref(), self.locations.get(&location.0))
        else {
            return;
        };

        unsafe {
            match value {
                UniformValue::Float(v) => gl.uniform_1_f32(Some(loc), *v),
                UniformValue::Int(v) => gl.uniform_1_i32(Some(loc), *v),
                UniformValue::Vec2(v) => gl.uniform_2_f32(Some(loc), v.x, v.y),
                UniformValue::Vec3(v) => gl.uniform_3_f32(Some(loc), v.x, v.y, v.z),
                UniformValue::Vec4(v) => gl.uniform_4_f32(Some(loc), v.x, v.y, v.z, v.w),
                UniformValue::Mat4(m) => gl.uniform_matrix_4_f32_slice(Some(loc), false, m.as_slice()),
            }
        }
    }

    fn draw_mesh(&mut self, mesh: &Mesh) {
        let (Some(gl), Some(surface)) = (self.gl.as_ref(), self.current) else {
            log::error!("draw issued with no current context");
            return;
        };

        let frame = self.surfaces.get(surface).map_or(0, |s| s.frame);
        let key = (surface, mesh.id());
        if !self.meshes.contains_key(&key) {
            match unsafe { upload_mesh(gl, mesh) } {
                Ok(uploaded) => {
                    log::trace!("Uploaded mesh {:?} to surface {surface:?}", mesh.id());
                    self.meshes.insert(key, uploaded);
                }
                Err(e) => {
                    log::error!("Failed to upload mesh {:?}: {e}", mesh.id());
                    return;
                }
            }
        }

        if let Some(uploaded) = self.meshes.get_mut(&key) {
            uploaded.last_drawn = frame;
            unsafe {
                gl.bind_vertex_array(Some(uploaded.vao));
                gl.draw_elements(glow::TRIANGLES, uploaded.index_count, glow::UNSIGNED_INT, 0);
                gl.bind_vertex_array(None);
            }
        }
    }

    fn terminate(&mut self) {
        if self.glfw.is_none() {
            return;
        }

        // Programs go while a context is still current
        if let Some(surface) = self.current.or_else(|| self.surfaces.keys().next()) {
            self.make_current(surface);
        }
        if let Some(gl) = self.gl.as_ref() {
            for (_, program) in self.programs.drain() {
                unsafe { gl.delete_program(program) };
            }
        }
        let handles: Vec<SurfaceHandle> = self.surfaces.keys().collect();
        for handle in handles {
            self.destroy_surface(handle);
        }
        self.gl = None;
        self.locations.clear();
        self.current = None;
        self.glfw = None;
        ERROR_CALLBACK.with(|slot| slot.borrow_mut().take());

        log::info!("GLFW backend terminated");
    }
}

impl Drop for GlfwBackend {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_old_context_rejected_before_glfw_starts() {
        let context = ContextConfig {
            major: 2,
            minor: 1,
            ..ContextConfig::default()
        };

        assert!(matches!(
            GlfwBackend::init(&context),
            Err(BackendInitError::UnsupportedContext { major: 2, minor: 1, .. })
        ));
    }

    #[test]
    fn test_gl_size_saturates() {
        assert_eq!(to_gl_size(800), 800);
        assert_eq!(to_gl_size(u32::MAX), i32::MAX);
    }
}
