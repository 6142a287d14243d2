//! Shiny Guacamole demo
//!
//! Opens the primary window with three squares and a second window showing a
//! triangle. Escape closes the window it is pressed in; closing the primary
//! window exits.

use std::rc::Rc;

use shiny_guacamole::foundation::logging;
use shiny_guacamole::prelude::*;

const CONFIG_PATH: &str = "guacamole.toml";

fn main() {
    logging::init();

    if let Err(e) = run() {
        log::error!("Fatal: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = EnvironmentConfig::load_or_default(CONFIG_PATH)?;
    let mut env = Environment::new(config)?;

    env.spawn_shape(Square::new());
    env.spawn_shape(Square::with_transform(
        Vec3::new(0.5, 0.5, 1.0),
        Vec3::new(-1.0, 0.75, 0.0),
    ));
    env.spawn_shape(Square::with_transform(
        Vec3::new(0.5, 0.5, 1.0),
        Vec3::new(1.0, -0.75, 0.0),
    ));

    // Owned by main; the second window only borrows it
    let triangle: Rc<dyn Drawable> = Rc::new(Triangle::new());
    let second = env.create_surface(&SurfaceDescriptor::new("Shiny Guacamole (2)", 400, 300).at(950, 100))?;
    if let Some(surface) = env.surface_mut(second) {
        surface.add_drawable(&triangle);
    }

    env.run_with(|env| {
        if env.frame_count() % 600 == 0 {
            log::debug!("{} frames rendered", env.frame_count());
        }
        LoopControl::Continue
    })?;

    log::info!("Goodbye");
    Ok(())
}
