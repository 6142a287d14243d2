//! End-to-end main loop tests on the headless backend

use std::cell::Cell;
use std::rc::Rc;

use crate::config::{EnvironmentConfig, ShaderConfig};
use crate::environment::{Environment, EnvironmentError, EnvironmentState, LoopControl};
use crate::foundation::math::Vec3;
use crate::render::backend::{ClearMask, GraphicsBackend, Key, SurfaceDescriptor};
use crate::render::backends::headless::{BackendCall, HeadlessBackend};
use crate::render::shader::{ShaderCompileError, UniformValue};
use crate::render::shapes::{Drawable, Square, Triangle};
use crate::render::surface::SurfaceCreationError;
use crate::render::transforms::FrameTransforms;

const VERTEX: &str = "#version 330 core
layout (location = 0) in vec3 aPos;
uniform mat4 model;
uniform mat4 view;
uniform mat4 projection;
void main() {
    gl_Position = projection * view * model * vec4(aPos, 1.0);
}
";

const FRAGMENT: &str = "#version 330 core
out vec4 FragColor;
void main() {
    FragColor = vec4(1.0, 0.5, 0.2, 1.0);
}
";

const BROKEN_FRAGMENT: &str = "#version 330 core
out vec4 FragColor;
void main() {
    FragColor = vec4(1.0, 0.5, 0.2, 1.0;
}
";

fn environment() -> Environment<HeadlessBackend> {
    Environment::with_shader_sources(
        HeadlessBackend::new(),
        EnvironmentConfig::default(),
        VERTEX,
        FRAGMENT,
    )
    .unwrap()
}

fn primary_handle(env: &Environment<HeadlessBackend>) -> crate::render::backend::SurfaceHandle {
    env.primary().unwrap().handle()
}

/// Counts how often it was rendered
#[derive(Default)]
struct Counter {
    renders: Cell<usize>,
}

impl Drawable for Counter {
    fn render(&self, _gpu: &mut dyn GraphicsBackend) {
        self.renders.set(self.renders.get() + 1);
    }
}

#[test]
fn test_empty_frame_clears_swaps_then_exits() {
    let mut env = environment();
    let primary = primary_handle(&env);
    env.backend_mut().take_calls();

    assert_eq!(env.step().unwrap(), LoopControl::Continue);

    let calls = env.backend().calls().to_vec();
    let clear = calls
        .iter()
        .position(|c| matches!(c, BackendCall::Clear { mask, .. } if *mask == ClearMask::COLOR | ClearMask::DEPTH))
        .unwrap();
    let swap = calls
        .iter()
        .position(|c| *c == BackendCall::SwapBuffers(primary))
        .unwrap();
    assert!(clear < swap);
    assert!(!calls.iter().any(|c| matches!(c, BackendCall::Draw { .. })));

    env.request_close();
    assert_eq!(env.step().unwrap(), LoopControl::Exit);
    assert_eq!(env.state(), EnvironmentState::Terminated);
    assert_eq!(env.frame_count(), 1);
    assert_eq!(env.backend().swap_count(primary), 1);
    assert!(env.backend().is_terminated());
}

#[test]
fn test_frame_order_bind_uniforms_draw_present() {
    let mut env = environment();
    let square = env.spawn_shape(Square::new());
    let triangle = Rc::new(Triangle::new());
    env.add_shape(triangle.clone());
    env.backend_mut().take_calls();

    env.step().unwrap();

    let calls = env.backend_mut().take_calls();
    let kinds: Vec<&str> = calls
        .iter()
        .map(|c| match c {
            BackendCall::MakeCurrent(_) => "current",
            BackendCall::Clear { .. } => "clear",
            BackendCall::UseProgram { .. } => "bind",
            BackendCall::SetUniform { .. } => "uniform",
            BackendCall::Draw { .. } => "draw",
            BackendCall::SwapBuffers(_) => "present",
            BackendCall::PollEvents => "events",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "current", "clear", "bind", "uniform", "uniform", "uniform", "draw", "draw",
            "present", "events"
        ]
    );

    let primary = primary_handle(&env);
    assert_eq!(
        env.backend().draws_on(primary),
        vec![
            // Rendered in insertion order
            square_mesh(&square),
            triangle.mesh().id(),
        ]
    );
}

fn square_mesh(shape: &Rc<dyn Drawable>) -> crate::render::mesh::MeshId {
    // Render into a scratch backend to learn which mesh the shape draws
    let mut scratch = HeadlessBackend::new();
    let surface = scratch.create_surface(&SurfaceDescriptor::new("scratch", 1, 1)).unwrap();
    shape.render(&mut scratch);
    scratch.draws_on(surface)[0]
}

#[test]
fn test_transform_uniforms_recomputed_each_frame() {
    let mut env = environment();
    let expected = FrameTransforms::compute(&env.config().camera);

    for _ in 0..2 {
        env.backend_mut().take_calls();
        env.step().unwrap();

        let uploads: Vec<(String, UniformValue)> = env
            .backend()
            .calls()
            .iter()
            .filter_map(|c| match c {
                BackendCall::SetUniform { name, value, .. } => Some((name.clone(), *value)),
                _ => None,
            })
            .collect();
        assert_eq!(
            uploads,
            vec![
                ("model".to_string(), UniformValue::Mat4(expected.model)),
                ("view".to_string(), UniformValue::Mat4(expected.view)),
                ("projection".to_string(), UniformValue::Mat4(expected.projection)),
            ]
        );
    }
    // Locations were resolved once and then served from the cache
    assert_eq!(env.backend().uniform_lookups(), 3);
}

#[test]
fn test_shader_without_transform_uniforms_keeps_rendering() {
    let vertex = "layout (location = 0) in vec3 aPos;\nvoid main() { gl_Position = vec4(aPos, 1.0); }";
    let mut env = Environment::with_shader_sources(
        HeadlessBackend::new(),
        EnvironmentConfig::default(),
        vertex,
        FRAGMENT,
    )
    .unwrap();
    let counter = Rc::new(Counter::default());
    env.add_shape(counter.clone());

    env.step().unwrap();
    env.step().unwrap();

    assert_eq!(counter.renders.get(), 2);
    assert!(!env
        .backend()
        .calls()
        .iter()
        .any(|c| matches!(c, BackendCall::SetUniform { .. })));
}

#[test]
fn test_escape_key_terminates() {
    let mut env = environment();
    env.step().unwrap();

    let primary = primary_handle(&env);
    env.backend_mut().press_key(primary, Key::Escape);

    assert_eq!(env.step().unwrap(), LoopControl::Exit);
    assert!(matches!(env.step(), Err(EnvironmentError::Terminated)));
    assert!(matches!(
        env.set_shader_sources(VERTEX, FRAGMENT),
        Err(EnvironmentError::Terminated)
    ));
}

#[test]
fn test_os_close_request_terminates_on_next_step() {
    let mut env = environment();
    let primary = primary_handle(&env);
    env.backend_mut().queue_close_request(primary);

    assert_eq!(env.step().unwrap(), LoopControl::Continue);
    assert_eq!(env.step().unwrap(), LoopControl::Exit);
}

#[test]
fn test_run_until_callback_exits() {
    let mut env = environment();
    let counter = Rc::new(Counter::default());
    env.add_shape(counter.clone());

    env.run_with(|env| {
        if env.frame_count() == 3 {
            LoopControl::Exit
        } else {
            LoopControl::Continue
        }
    })
    .unwrap();

    assert_eq!(counter.renders.get(), 3);
    assert_eq!(env.state(), EnvironmentState::Terminated);
}

#[test]
fn test_remove_shape_by_identity_and_index() {
    let mut env = environment();
    let a: Rc<dyn Drawable> = Rc::new(Square::new());
    let b = env.spawn_shape(Square::with_transform(Vec3::new(2.0, 2.0, 1.0), Vec3::zeros()));
    env.add_shape(Rc::clone(&a));
    env.add_shape(Rc::clone(&a));

    assert_eq!(env.remove_shape(&a), 2);
    assert_eq!(env.remove_shape(&a), 0);
    assert_eq!(env.shapes().len(), 1);

    let err = env.remove_shape_at(1).err().unwrap();
    assert_eq!((err.index, err.len), (1, 1));

    let removed = env.remove_shape_at(0).unwrap();
    assert!(crate::render::shapes::same_entity(&removed, &b));
    assert!(env.shapes().is_empty());
}

#[test]
fn test_failed_hot_swap_keeps_previous_program() {
    let mut env = environment();
    env.step().unwrap();
    let before = env.shader().unwrap().handle();

    let err = env.set_shader_sources(VERTEX, BROKEN_FRAGMENT).unwrap_err();
    assert!(matches!(
        err,
        EnvironmentError::Shader(ShaderCompileError::Compile { .. })
    ));
    assert_eq!(env.shader().unwrap().handle(), before);
    assert_eq!(env.backend().program_count(), 1);

    env.backend_mut().take_calls();
    env.step().unwrap();
    assert!(env
        .backend()
        .calls()
        .iter()
        .any(|c| matches!(c, BackendCall::UseProgram { program, .. } if *program == before)));
}

#[test]
fn test_successful_hot_swap_deletes_old_program() {
    let mut env = environment();
    let before = env.shader().unwrap().handle();

    env.set_shader_sources(VERTEX, FRAGMENT).unwrap();

    assert_ne!(env.shader().unwrap().handle(), before);
    assert_eq!(env.backend().program_count(), 1);
    assert!(env.backend().calls().contains(&BackendCall::DeleteProgram(before)));
}

#[test]
fn test_set_shaders_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let vertex = dir.path().join("vertex.glsl");
    let fragment = dir.path().join("fragment.glsl");
    std::fs::write(&vertex, VERTEX).unwrap();
    std::fs::write(&fragment, FRAGMENT).unwrap();

    let mut env = environment();
    env.set_shaders(&vertex, &fragment).unwrap();

    let missing = dir.path().join("missing.glsl");
    assert!(matches!(
        env.set_shaders(&vertex, &missing),
        Err(EnvironmentError::Shader(ShaderCompileError::Source { .. }))
    ));
}

#[test]
fn test_construction_reads_configured_shader_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EnvironmentConfig::default();
    config.shaders = ShaderConfig {
        vertex: dir.path().join("vertex.glsl"),
        fragment: dir.path().join("fragment.glsl"),
    };
    std::fs::write(&config.shaders.vertex, VERTEX).unwrap();
    std::fs::write(&config.shaders.fragment, FRAGMENT).unwrap();

    let env = Environment::with_backend(HeadlessBackend::new(), config).unwrap();
    assert!(env.is_running());
}

#[test]
fn test_missing_shader_files_fail_construction() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EnvironmentConfig::default();
    config.shaders = ShaderConfig {
        vertex: dir.path().join("nope.glsl"),
        fragment: dir.path().join("nope.glsl"),
    };

    let err = Environment::with_backend(HeadlessBackend::new(), config)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        EnvironmentError::Shader(ShaderCompileError::Source { .. })
    ));
}

#[test]
fn test_surface_failure_is_fatal_for_construction() {
    let mut backend = HeadlessBackend::new();
    backend.fail_next_surface();

    let err = Environment::with_shader_sources(backend, EnvironmentConfig::default(), VERTEX, FRAGMENT)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        EnvironmentError::Surface(SurfaceCreationError::ContextUnavailable { .. })
    ));
}

#[test]
fn test_resize_updates_viewport_exactly() {
    let mut env = environment();
    let primary = primary_handle(&env);
    env.backend_mut().queue_resize(primary, 1280, 720);

    env.step().unwrap();

    assert_eq!(env.backend().viewport(primary), Some((1280, 720)));
    assert_eq!(env.primary().unwrap().size(), (1280, 720));
}

#[test]
fn test_secondary_surface_renders_own_list() {
    let mut env = environment();
    let shared = Rc::new(Counter::default());
    let only_secondary: Rc<dyn Drawable> = Rc::new(Square::new());
    env.add_shape(shared.clone());

    let id = env
        .create_surface(&SurfaceDescriptor::new("second", 320, 240).at(900, 100))
        .unwrap();
    env.surface_mut(id).unwrap().add_drawable(&only_secondary);
    let secondary = env.surface(id).unwrap().handle();
    assert!(id > env.primary().unwrap().id());

    env.step().unwrap();

    assert_eq!(shared.renders.get(), 1);
    assert_eq!(env.backend().draws_on(secondary), vec![square_mesh(&only_secondary)]);
    assert_eq!(env.backend().swap_count(secondary), 1);
    assert!(env
        .backend()
        .calls()
        .iter()
        .any(|c| matches!(c, BackendCall::UseProgram { surface: Some(s), .. } if *s == secondary)));
}

#[test]
fn test_closing_secondary_keeps_environment_running() {
    let mut env = environment();
    let id = env
        .create_surface(&SurfaceDescriptor::new("second", 320, 240))
        .unwrap();
    let secondary = env.surface(id).unwrap().handle();

    env.backend_mut().press_key(secondary, Key::Escape);
    assert_eq!(env.step().unwrap(), LoopControl::Continue);

    assert!(env.surface(id).is_none());
    assert_eq!(env.backend().surface_count(), 1);
    assert!(env.backend().calls().contains(&BackendCall::DestroySurface(secondary)));
    assert!(matches!(
        env.close_surface(id),
        Err(EnvironmentError::UnknownSurface(_))
    ));
}

#[test]
fn test_close_primary_surface_shuts_down() {
    let mut env = environment();
    let primary = env.primary().unwrap().id();

    env.close_surface(primary).unwrap();

    assert_eq!(env.state(), EnvironmentState::Terminated);
    assert!(env.primary().is_none());
    assert!(matches!(
        env.create_surface(&SurfaceDescriptor::new("late", 1, 1)),
        Err(EnvironmentError::Terminated)
    ));
}

#[test]
fn test_shutdown_releases_everything_once() {
    let mut env = environment();
    env.create_surface(&SurfaceDescriptor::new("second", 1, 1)).unwrap();

    env.shutdown();
    env.shutdown();

    let terminates = env
        .backend()
        .calls()
        .iter()
        .filter(|c| **c == BackendCall::Terminate)
        .count();
    assert_eq!(terminates, 1);
    assert_eq!(env.backend().surface_count(), 0);
    assert_eq!(env.backend().program_count(), 0);
}

#[test]
fn test_failed_secondary_surface_leaves_others_running() {
    let mut env = environment();
    let existing = env
        .create_surface(&SurfaceDescriptor::new("second", 320, 240))
        .unwrap();
    let existing_handle = env.surface(existing).unwrap().handle();
    assert_eq!(env.backend().surface_title(existing_handle), Some("second"));

    env.backend_mut().fail_next_surface();
    let err = env
        .create_surface(&SurfaceDescriptor::new("third", 320, 240))
        .unwrap_err();

    assert!(matches!(err, EnvironmentError::Surface(_)));
    assert!(env.is_running());
    assert_eq!(env.surfaces().count(), 2);
    assert!(env.surface(existing).is_some());

    let primary = primary_handle(&env);
    assert_eq!(env.step().unwrap(), LoopControl::Continue);
    assert_eq!(env.backend().swap_count(primary), 1);
    assert_eq!(env.backend().swap_count(existing_handle), 1);
}

#[test]
fn test_replaced_shapes_release_their_meshes() {
    let mut env = environment();
    let primary = primary_handle(&env);
    let old = env.spawn_shape(Square::new());
    env.step().unwrap();
    assert_eq!(env.backend().resident_meshes(primary), vec![square_mesh(&old)]);

    for _ in 0..5 {
        let shape = env.shapes()[0].clone();
        env.remove_shape(&shape);
        env.spawn_shape(Square::new());
        env.step().unwrap();
    }

    let current = env.shapes()[0].clone();
    assert_eq!(env.backend().resident_meshes(primary), vec![square_mesh(&current)]);
}

#[test]
fn test_hot_swaps_do_not_accumulate_uniform_locations() {
    let mut env = environment();
    env.step().unwrap();

    for _ in 0..4 {
        env.set_shader_sources(VERTEX, FRAGMENT).unwrap();
        env.step().unwrap();
    }

    assert_eq!(env.backend().uniform_location_count(), 3);
}

#[test]
fn test_teardown_always_has_a_current_context() {
    let mut env = environment();
    let errors = Rc::new(Cell::new(0));
    let sink = Rc::clone(&errors);
    env.set_error_callback(Box::new(move |_, _| sink.set(sink.get() + 1)));

    let id = env
        .create_surface(&SurfaceDescriptor::new("second", 320, 240))
        .unwrap();
    env.step().unwrap();
    // The secondary rendered last, so closing it leaves nothing current
    env.close_surface(id).unwrap();
    assert_eq!(env.backend().current_surface(), None);

    env.shutdown();

    assert_eq!(errors.get(), 0);
    let calls = env.backend().calls();
    let delete = calls
        .iter()
        .position(|c| matches!(c, BackendCall::DeleteProgram(_)))
        .unwrap();
    assert!(matches!(calls[delete - 1], BackendCall::MakeCurrent(_)));
}

#[test]
fn test_released_close_key_does_not_close() {
    let mut env = environment();
    let primary = primary_handle(&env);

    env.backend_mut().press_key(primary, Key::Escape);
    env.backend_mut().release_key(primary, Key::Escape);

    assert_eq!(env.step().unwrap(), LoopControl::Continue);
    assert!(env.is_running());
}
