//! Headless backend
//!
//! Implements [`GraphicsBackend`] without a display or GPU. Every call is
//! appended to a log of [`BackendCall`]s so tests can assert frame structure
//! (which surface was current, what was cleared, bound, written, drawn and
//! presented). Input, resize and close requests are injected by the caller.
//!
//! Mesh residency follows the GPU backend's cache: a mesh becomes resident on
//! the current surface when drawn, and is released when that surface presents
//! without having drawn it during the frame.
//!
//! Shader "compilation" is a light syntax check: each stage needs a `main`
//! entry point with balanced braces and parentheses, and the fragment stage
//! must declare a color output. Active uniforms are the `uniform`
//! declarations found in either stage.

use std::collections::{HashMap, HashSet};

use slotmap::SlotMap;

use crate::render::backend::{
    stale_uploads, ClearMask, ErrorCallback, GraphicsBackend, Key, KeyState, ProgramHandle, SurfaceDescriptor,
    SurfaceEvent, SurfaceHandle, UniformLocation,
};
use crate::render::mesh::{Mesh, MeshId};
use crate::render::shader::{ShaderCompileError, ShaderStage, UniformValue};
use crate::render::surface::SurfaceCreationError;

/// Error code reported when a graphics call is issued with no current surface
pub const NO_CURRENT_CONTEXT: i32 = 0x0001_0002;

/// One recorded backend call
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    /// A surface was created
    CreateSurface(SurfaceHandle),
    /// A surface was destroyed
    DestroySurface(SurfaceHandle),
    /// A surface was made current
    MakeCurrent(SurfaceHandle),
    /// The current framebuffer was cleared
    Clear {
        /// Current surface at the time of the call
        surface: Option<SurfaceHandle>,
        /// Clear color
        color: [f32; 4],
        /// Cleared planes
        mask: ClearMask,
    },
    /// The viewport of the current surface changed
    Viewport {
        /// Current surface at the time of the call
        surface: Option<SurfaceHandle>,
        /// Viewport width
        width: u32,
        /// Viewport height
        height: u32,
    },
    /// A program was compiled
    CompileProgram(ProgramHandle),
    /// A program was deleted
    DeleteProgram(ProgramHandle),
    /// A program was bound
    UseProgram {
        /// Current surface at the time of the call
        surface: Option<SurfaceHandle>,
        /// Bound program
        program: ProgramHandle,
    },
    /// A uniform was written
    SetUniform {
        /// Current surface at the time of the call
        surface: Option<SurfaceHandle>,
        /// Uniform name
        name: String,
        /// Written value
        value: UniformValue,
    },
    /// A mesh was drawn
    Draw {
        /// Current surface at the time of the call
        surface: Option<SurfaceHandle>,
        /// Drawn mesh
        mesh: MeshId,
    },
    /// A surface presented its back buffer
    SwapBuffers(SurfaceHandle),
    /// Events were polled
    PollEvents,
    /// The backend was terminated
    Terminate,
}

#[derive(Debug)]
struct HeadlessSurface {
    descriptor: SurfaceDescriptor,
    close_requested: bool,
    pressed: HashSet<Key>,
    bound_program: Option<ProgramHandle>,
    viewport: (u32, u32),
    frame: u64,
}

#[derive(Debug)]
struct HeadlessProgram {
    uniforms: Vec<String>,
}

/// Backend that renders nothing and remembers everything
#[derive(Default)]
pub struct HeadlessBackend {
    surfaces: SlotMap<SurfaceHandle, HeadlessSurface>,
    programs: SlotMap<ProgramHandle, HeadlessProgram>,
    locations: HashMap<u32, (ProgramHandle, String)>,
    next_location: u32,
    resident: HashMap<(SurfaceHandle, MeshId), u64>,
    current: Option<SurfaceHandle>,
    calls: Vec<BackendCall>,
    pending_events: Vec<SurfaceEvent>,
    fail_next_surface: bool,
    uniform_lookups: usize,
    error_callback: Option<ErrorCallback>,
    terminated: bool,
}

impl HeadlessBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create_surface` call fail
    pub fn fail_next_surface(&mut self) {
        self.fail_next_surface = true;
    }

    /// Hold `key` down on `surface`
    pub fn press_key(&mut self, surface: SurfaceHandle, key: Key) {
        if let Some(s) = self.surfaces.get_mut(surface) {
            s.pressed.insert(key);
        }
    }

    /// Release `key` on `surface`
    pub fn release_key(&mut self, surface: SurfaceHandle, key: Key) {
        if let Some(s) = self.surfaces.get_mut(surface) {
            s.pressed.remove(&key);
        }
    }

    /// Deliver a framebuffer resize on the next `poll_events`
    pub fn queue_resize(&mut self, surface: SurfaceHandle, width: u32, height: u32) {
        self.pending_events.push(SurfaceEvent::FramebufferResized {
            surface,
            width,
            height,
        });
    }

    /// Deliver an OS close request on the next `poll_events`
    pub fn queue_close_request(&mut self, surface: SurfaceHandle) {
        self.pending_events
            .push(SurfaceEvent::CloseRequested { surface });
    }

    /// Every call recorded so far
    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    /// Drain the call log
    pub fn take_calls(&mut self) -> Vec<BackendCall> {
        std::mem::take(&mut self.calls)
    }

    /// Number of uniform location queries issued
    pub const fn uniform_lookups(&self) -> usize {
        self.uniform_lookups
    }

    /// Number of live surfaces
    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    /// Number of live programs
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Currently bound surface
    pub const fn current_surface(&self) -> Option<SurfaceHandle> {
        self.current
    }

    /// Last viewport set on `surface`
    pub fn viewport(&self, surface: SurfaceHandle) -> Option<(u32, u32)> {
        self.surfaces.get(surface).map(|s| s.viewport)
    }

    /// Title the surface was created with
    pub fn surface_title(&self, surface: SurfaceHandle) -> Option<&str> {
        self.surfaces
            .get(surface)
            .map(|s| s.descriptor.title.as_str())
    }

    /// Meshes drawn on `surface`, in call order
    pub fn draws_on(&self, surface: SurfaceHandle) -> Vec<MeshId> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Draw {
                    surface: Some(s),
                    mesh,
                } if *s == surface => Some(*mesh),
                _ => None,
            })
            .collect()
    }

    /// Meshes currently resident on `surface`, in id order
    pub fn resident_meshes(&self, surface: SurfaceHandle) -> Vec<MeshId> {
        let mut meshes: Vec<MeshId> = self
            .resident
            .keys()
            .filter(|(owner, _)| *owner == surface)
            .map(|(_, mesh)| *mesh)
            .collect();
        meshes.sort();
        meshes
    }

    /// Number of live uniform locations across all programs
    pub fn uniform_location_count(&self) -> usize {
        self.locations.len()
    }

    /// Number of presents on `surface`
    pub fn swap_count(&self, surface: SurfaceHandle) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, BackendCall::SwapBuffers(s) if *s == surface))
            .count()
    }

    /// Whether `terminate` has run
    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn report_error(&mut self, code: i32, description: &str) {
        log::error!("Headless backend error {code:#x}: {description}");
        if let Some(callback) = self.error_callback.as_mut() {
            callback(code, description);
        }
    }

    fn require_current(&mut self, operation: &str) -> Option<SurfaceHandle> {
        if self.current.is_none() {
            self.report_error(
                NO_CURRENT_CONTEXT,
                &format!("{operation} issued with no current context"),
            );
        }
        self.current
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_surface(
        &mut self,
        descriptor: &SurfaceDescriptor,
    ) -> Result<SurfaceHandle, SurfaceCreationError> {
        if self.terminated {
            return Err(SurfaceCreationError::BackendTerminated);
        }
        if std::mem::take(&mut self.fail_next_surface) {
            return Err(SurfaceCreationError::ContextUnavailable {
                title: descriptor.title.clone(),
            });
        }

        let handle = self.surfaces.insert(HeadlessSurface {
            descriptor: descriptor.clone(),
            close_requested: false,
            pressed: HashSet::new(),
            bound_program: None,
            viewport: (descriptor.width, descriptor.height),
            frame: 0,
        });
        self.current = Some(handle);
        self.calls.push(BackendCall::CreateSurface(handle));
        Ok(handle)
    }

    fn destroy_surface(&mut self, surface: SurfaceHandle) {
        if self.surfaces.remove(surface).is_some() {
            self.resident.retain(|(owner, _), _| *owner != surface);
            if self.current == Some(surface) {
                self.current = None;
            }
            self.calls.push(BackendCall::DestroySurface(surface));
        }
    }

    fn make_current(&mut self, surface: SurfaceHandle) {
        if self.surfaces.contains_key(surface) {
            self.current = Some(surface);
            self.calls.push(BackendCall::MakeCurrent(surface));
        } else {
            self.report_error(NO_CURRENT_CONTEXT, "make_current on an unknown surface");
        }
    }

    fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.error_callback = Some(callback);
    }

    fn poll_events(&mut self) -> Vec<SurfaceEvent> {
        self.calls.push(BackendCall::PollEvents);

        let events: Vec<SurfaceEvent> = self
            .pending_events
            .drain(..)
            .filter(|event| match event {
                SurfaceEvent::FramebufferResized { surface, .. }
                | SurfaceEvent::CloseRequested { surface } => self.surfaces.contains_key(*surface),
            })
            .collect();

        for event in &events {
            if let SurfaceEvent::CloseRequested { surface } = event {
                if let Some(s) = self.surfaces.get_mut(*surface) {
                    s.close_requested = true;
                }
            }
        }
        events
    }

    fn swap_buffers(&mut self, surface: SurfaceHandle) {
        let Some(s) = self.surfaces.get_mut(surface) else {
            return;
        };
        let frame = s.frame;
        s.frame += 1;
        self.calls.push(BackendCall::SwapBuffers(surface));

        if self.current == Some(surface) {
            let stale = stale_uploads(
                self.resident.iter().map(|(key, last)| (key, *last)),
                surface,
                frame,
            );
            for key in stale {
                self.resident.remove(&key);
            }
        }
    }

    fn should_close(&self, surface: SurfaceHandle) -> bool {
        self.surfaces
            .get(surface)
            .map_or(true, |s| s.close_requested)
    }

    fn request_close(&mut self, surface: SurfaceHandle) {
        if let Some(s) = self.surfaces.get_mut(surface) {
            s.close_requested = true;
        }
    }

    fn key_state(&self, surface: SurfaceHandle, key: Key) -> KeyState {
        match self.surfaces.get(surface) {
            Some(s) if s.pressed.contains(&key) => KeyState::Pressed,
            _ => KeyState::Released,
        }
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        let surface = self.require_current("viewport");
        if let Some(s) = surface.and_then(|h| self.surfaces.get_mut(h)) {
            s.viewport = (width, height);
        }
        self.calls.push(BackendCall::Viewport {
            surface,
            width,
            height,
        });
    }

    fn clear(&mut self, color: [f32; 4], mask: ClearMask) {
        let surface = self.require_current("clear");
        self.calls.push(BackendCall::Clear {
            surface,
            color,
            mask,
        });
    }

    fn compile_program(
        &mut self,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<ProgramHandle, ShaderCompileError> {
        check_stage(ShaderStage::Vertex, vertex_source)?;
        check_stage(ShaderStage::Fragment, fragment_source)?;
        if !fragment_source.contains("out ") && !fragment_source.contains("gl_FragColor") {
            return Err(ShaderCompileError::Link {
                log: "fragment shader does not write a color output".to_string(),
            });
        }

        let mut uniforms = Vec::new();
        for name in declared_uniforms(vertex_source).chain(declared_uniforms(fragment_source)) {
            if !uniforms.contains(&name) {
                uniforms.push(name);
            }
        }

        let handle = self.programs.insert(HeadlessProgram { uniforms });
        self.calls.push(BackendCall::CompileProgram(handle));
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if self.programs.remove(program).is_some() {
            self.require_current("delete_program");
            self.locations.retain(|_, (owner, _)| *owner != program);
            for surface in self.surfaces.values_mut() {
                if surface.bound_program == Some(program) {
                    surface.bound_program = None;
                }
            }
            self.calls.push(BackendCall::DeleteProgram(program));
        }
    }

    fn use_program(&mut self, program: ProgramHandle) {
        let surface = self.require_current("use_program");
        if let Some(s) = surface.and_then(|h| self.surfaces.get_mut(h)) {
            s.bound_program = Some(program);
        }
        self.calls
            .push(BackendCall::UseProgram { surface, program });
    }

    fn current_program(&self) -> Option<ProgramHandle> {
        self.current
            .and_then(|h| self.surfaces.get(h))
            .and_then(|s| s.bound_program)
    }

    fn uniform_location(&mut self, program: ProgramHandle, name: &str) -> Option<UniformLocation> {
        self.uniform_lookups += 1;

        let active = self
            .programs
            .get(program)
            .is_some_and(|p| p.uniforms.iter().any(|u| u == name));
        if !active {
            return None;
        }

        let index = self.next_location;
        self.next_location = self.next_location.checked_add(1)?;
        self.locations.insert(index, (program, name.to_string()));
        Some(UniformLocation(index))
    }

    fn set_uniform(&mut self, location: UniformLocation, value: &UniformValue) {
        let surface = self.require_current("set_uniform");
        let Some((_, name)) = self.locations.get(&location.0) else {
            self.report_error(0x0001_0004, "set_uniform with an unknown location");
            return;
        };
        self.calls.push(BackendCall::SetUniform {
            surface,
            name: name.clone(),
            value: *value,
        });
    }

    fn draw_mesh(&mut self, mesh: &Mesh) {
        let surface = self.require_current("draw");
        if let Some((handle, s)) = surface.and_then(|h| self.surfaces.get(h).map(|s| (h, s))) {
            self.resident.insert((handle, mesh.id()), s.frame);
        }
        self.calls.push(BackendCall::Draw {
            surface,
            mesh: mesh.id(),
        });
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.surfaces.clear();
        self.programs.clear();
        self.locations.clear();
        self.resident.clear();
        self.current = None;
        self.terminated = true;
        self.calls.push(BackendCall::Terminate);
    }
}

fn check_stage(stage: ShaderStage, source: &str) -> Result<(), ShaderCompileError> {
    let error = |message: &str| ShaderCompileError::Compile {
        stage,
        log: format!("0:1(1): error: {message}"),
    };

    if source.trim().is_empty() {
        return Err(error("empty shader source"));
    }
    if !source.contains("void main") {
        return Err(error("no definition of `main`"));
    }

    let mut braces = 0i32;
    let mut parens = 0i32;
    for c in source.chars() {
        match c {
            '{' => braces += 1,
            '}' => braces -= 1,
            '(' => parens += 1,
            ')' => parens -= 1,
            _ => {}
        }
        if braces < 0 || parens < 0 {
            return Err(error("syntax error, unexpected closing delimiter"));
        }
    }
    if braces != 0 || parens != 0 {
        return Err(error("syntax error, unexpected end of file"));
    }
    Ok(())
}

fn declared_uniforms(source: &str) -> impl Iterator<Item = String> + '_ {
    source.lines().filter_map(|line| {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "uniform" {
            return None;
        }
        let _ty = tokens.next()?;
        let name = tokens.next()?.trim_end_matches(';');
        let name = name.split('[').next().unwrap_or(name);
        (!name.is_empty()).then(|| name.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_declared_uniforms() {
        let source = "uniform mat4 model;\n  uniform vec3 lights[4];\nin vec3 aPos;\n";
        let names: Vec<String> = declared_uniforms(source).collect();
        assert_eq!(names, vec!["model".to_string(), "lights".to_string()]);
    }

    #[test]
    fn test_program_binding_is_per_surface() {
        let mut gpu = HeadlessBackend::new();
        let a = gpu.create_surface(&SurfaceDescriptor::new("a", 10, 10)).unwrap();
        let b = gpu.create_surface(&SurfaceDescriptor::new("b", 10, 10)).unwrap();
        let program = gpu
            .compile_program("void main() {}", "out vec4 c; void main() {}")
            .unwrap();

        gpu.make_current(a);
        gpu.use_program(program);
        assert_eq!(gpu.current_program(), Some(program));

        gpu.make_current(b);
        assert_eq!(gpu.current_program(), None);
    }

    #[test]
    fn test_error_callback_without_current_context() {
        let mut gpu = HeadlessBackend::new();
        let codes = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&codes);
        gpu.set_error_callback(Box::new(move |code, _| sink.borrow_mut().push(code)));

        gpu.clear([0.0; 4], ClearMask::COLOR);
        assert_eq!(*codes.borrow(), vec![NO_CURRENT_CONTEXT]);
    }

    #[test]
    fn test_close_request_sets_flag_on_poll() {
        let mut gpu = HeadlessBackend::new();
        let s = gpu.create_surface(&SurfaceDescriptor::new("a", 10, 10)).unwrap();
        gpu.queue_close_request(s);
        assert!(!gpu.should_close(s));

        let events = gpu.poll_events();
        assert_eq!(events, vec![SurfaceEvent::CloseRequested { surface: s }]);
        assert!(gpu.should_close(s));
    }

    #[test]
    fn test_link_requires_color_output() {
        let mut gpu = HeadlessBackend::new();
        let err = gpu
            .compile_program("void main() {}", "void main() {}")
            .unwrap_err();
        assert!(matches!(err, ShaderCompileError::Link { .. }));
    }

    fn triangle() -> Mesh {
        let vertices = vec![
            crate::render::mesh::Vertex::position_only([0.0, 0.0, 0.0]),
            crate::render::mesh::Vertex::position_only([1.0, 0.0, 0.0]),
            crate::render::mesh::Vertex::position_only([0.0, 1.0, 0.0]),
        ];
        Mesh::new(vertices, vec![0, 1, 2], false).unwrap()
    }

    #[test]
    fn test_undrawn_mesh_released_on_present() {
        let mut gpu = HeadlessBackend::new();
        let s = gpu.create_surface(&SurfaceDescriptor::new("a", 10, 10)).unwrap();
        let first = triangle();
        let second = triangle();

        gpu.draw_mesh(&first);
        gpu.swap_buffers(s);
        assert_eq!(gpu.resident_meshes(s), vec![first.id()]);

        gpu.draw_mesh(&second);
        gpu.swap_buffers(s);
        assert_eq!(gpu.resident_meshes(s), vec![second.id()]);

        gpu.swap_buffers(s);
        assert!(gpu.resident_meshes(s).is_empty());
    }

    #[test]
    fn test_residency_is_per_surface() {
        let mut gpu = HeadlessBackend::new();
        let a = gpu.create_surface(&SurfaceDescriptor::new("a", 10, 10)).unwrap();
        let b = gpu.create_surface(&SurfaceDescriptor::new("b", 10, 10)).unwrap();
        let mesh = triangle();

        gpu.make_current(a);
        gpu.draw_mesh(&mesh);
        gpu.make_current(b);
        gpu.draw_mesh(&mesh);
        gpu.swap_buffers(b);
        // `a` has not presented yet, so its copy stays
        assert_eq!(gpu.resident_meshes(a), vec![mesh.id()]);

        gpu.destroy_surface(a);
        assert!(gpu.resident_meshes(a).is_empty());
        assert_eq!(gpu.resident_meshes(b), vec![mesh.id()]);
    }

    #[test]
    fn test_destroying_other_surface_keeps_current() {
        let mut gpu = HeadlessBackend::new();
        let a = gpu.create_surface(&SurfaceDescriptor::new("a", 10, 10)).unwrap();
        let b = gpu.create_surface(&SurfaceDescriptor::new("b", 10, 10)).unwrap();
        assert_eq!(gpu.surface_title(b), Some("b"));

        gpu.destroy_surface(a);
        assert_eq!(gpu.current_surface(), Some(b));
        assert_eq!(gpu.surface_title(a), None);

        gpu.destroy_surface(b);
        assert_eq!(gpu.current_surface(), None);
    }

    #[test]
    fn test_deleted_program_releases_locations() {
        let mut gpu = HeadlessBackend::new();
        gpu.create_surface(&SurfaceDescriptor::new("a", 10, 10)).unwrap();
        let vertex = "uniform mat4 model;\nvoid main() {}";
        let fragment = "out vec4 c; void main() {}";

        let old = gpu.compile_program(vertex, fragment).unwrap();
        let new = gpu.compile_program(vertex, fragment).unwrap();
        let stale = gpu.uniform_location(old, "model").unwrap();
        let live = gpu.uniform_location(new, "model").unwrap();
        assert_ne!(stale, live);

        gpu.delete_program(old);
        assert_eq!(gpu.uniform_location_count(), 1);

        // Locations handed out later never collide with live ones
        let again = gpu.uniform_location(new, "model").unwrap();
        assert_ne!(again, live);
        assert_eq!(gpu.uniform_location_count(), 2);
    }

    #[test]
    fn test_released_key_no_longer_pressed() {
        let mut gpu = HeadlessBackend::new();
        let s = gpu.create_surface(&SurfaceDescriptor::new("a", 10, 10)).unwrap();

        gpu.press_key(s, Key::Escape);
        assert_eq!(gpu.key_state(s, Key::Escape), KeyState::Pressed);
        gpu.release_key(s, Key::Escape);
        assert_eq!(gpu.key_state(s, Key::Escape), KeyState::Released);
    }
}
