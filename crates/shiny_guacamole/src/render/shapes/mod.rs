//! Drawable shapes
//!
//! A [`Drawable`] issues its own draw calls against whatever program and
//! uniforms are currently bound. It never binds programs or writes uniforms
//! itself.

mod square;
mod triangle;

pub use square::Square;
pub use triangle::Triangle;

use std::rc::{Rc, Weak};

use super::backend::GraphicsBackend;

/// Something that can draw itself with the currently bound shader state
pub trait Drawable {
    /// Issue this entity's draw call(s) on the current context
    fn render(&self, gpu: &mut dyn GraphicsBackend);
}

/// Address of the shared allocation, without the vtable
pub(crate) fn entity_addr(drawable: &Rc<dyn Drawable>) -> *const () {
    Rc::as_ptr(drawable).cast::<()>()
}

pub(crate) fn weak_entity_addr(drawable: &Weak<dyn Drawable>) -> *const () {
    Weak::as_ptr(drawable).cast::<()>()
}

/// Whether two handles denote the same entity.
///
/// Compares allocations, not values: two equal squares are different entities.
pub fn same_entity(a: &Rc<dyn Drawable>, b: &Rc<dyn Drawable>) -> bool {
    std::ptr::eq(entity_addr(a), entity_addr(b))
}
