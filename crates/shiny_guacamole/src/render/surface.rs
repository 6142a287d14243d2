//! Render surfaces
//!
//! A [`RenderSurface`] is one native window plus its context, a process-unique
//! [`SurfaceId`], and an ordered list of drawables. The list is render order.
//!
//! # Drawable ownership
//! Entries are either owned ([`RenderSurface::add_owned`], the surface holds a
//! strong `Rc` and keeps the entity alive) or borrowed
//! ([`RenderSurface::add_drawable`], the surface holds a `Weak`). A borrowed
//! entry whose owner has dropped it is skipped at render time and removed by
//! [`RenderSurface::prune`]. A borrowed entry is never upgraded into an owned
//! one.
//!
//! # Context discipline
//! The current context is backend-global. Creation leaves the new surface
//! current, and [`RenderSurface::render`] re-binds it before issuing anything.

use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use super::backend::{BackendInitError, GraphicsBackend, SurfaceDescriptor, SurfaceHandle};
use super::shapes::{entity_addr, weak_entity_addr, Drawable};

/// Process-unique surface identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u32);

impl SurfaceId {
    /// Raw value
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out strictly increasing surface ids.
///
/// The process-wide allocator starts at 1 when the process starts and is
/// never reset. Ids are not reused, even after the surface is destroyed.
#[derive(Debug)]
pub struct SurfaceIdAllocator {
    next: AtomicU32,
}

static GLOBAL_SURFACE_IDS: SurfaceIdAllocator = SurfaceIdAllocator::new();

impl SurfaceIdAllocator {
    /// Allocator whose first id is 1
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// The allocator used by [`RenderSurface::create`]
    pub fn global() -> &'static Self {
        &GLOBAL_SURFACE_IDS
    }

    /// Next id
    pub fn allocate(&self) -> SurfaceId {
        SurfaceId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SurfaceIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Surface creation failures. Fatal for the surface being created only.
#[derive(Error, Debug)]
pub enum SurfaceCreationError {
    /// The backend could not allocate a window or context
    #[error("could not create a context for surface \"{title}\"")]
    ContextUnavailable {
        /// Title of the requested surface
        title: String,
    },

    /// The context was created but graphics functions could not be loaded
    #[error("surface context is unusable: {0}")]
    FunctionLoad(#[source] BackendInitError),

    /// The backend has already been terminated
    #[error("backend has been terminated")]
    BackendTerminated,
}

#[derive(Clone)]
enum DrawableRef {
    Owned(Rc<dyn Drawable>),
    Borrowed(Weak<dyn Drawable>),
}

impl DrawableRef {
    fn addr(&self) -> *const () {
        match self {
            Self::Owned(rc) => entity_addr(rc),
            Self::Borrowed(weak) => weak_entity_addr(weak),
        }
    }

    fn upgrade(&self) -> Option<Rc<dyn Drawable>> {
        match self {
            Self::Owned(rc) => Some(Rc::clone(rc)),
            Self::Borrowed(weak) => weak.upgrade(),
        }
    }

    fn is_live(&self) -> bool {
        match self {
            Self::Owned(_) => true,
            Self::Borrowed(weak) => weak.strong_count() > 0,
        }
    }
}

/// A window, its context and the drawables rendered into it
pub struct RenderSurface {
    id: SurfaceId,
    handle: SurfaceHandle,
    title: String,
    size: (u32, u32),
    position: (i32, i32),
    drawables: Vec<DrawableRef>,
}

impl RenderSurface {
    /// Create a surface with an id from the process-wide allocator
    pub fn create(
        gpu: &mut dyn GraphicsBackend,
        descriptor: &SurfaceDescriptor,
    ) -> Result<Self, SurfaceCreationError> {
        Self::create_with_ids(gpu, descriptor, SurfaceIdAllocator::global())
    }

    /// Create a surface with an id from `ids`.
    ///
    /// The id is allocated only once the backend has produced the surface, so
    /// a failed creation leaves nothing behind.
    pub fn create_with_ids(
        gpu: &mut dyn GraphicsBackend,
        descriptor: &SurfaceDescriptor,
        ids: &SurfaceIdAllocator,
    ) -> Result<Self, SurfaceCreationError> {
        let handle = gpu.create_surface(descriptor)?;
        let id = ids.allocate();

        log::info!(
            "Created surface {id} \"{}\" ({}x{}) on {}",
            descriptor.title,
            descriptor.width,
            descriptor.height,
            gpu.name()
        );

        Ok(Self {
            id,
            handle,
            title: descriptor.title.clone(),
            size: (descriptor.width, descriptor.height),
            position: descriptor.position,
            drawables: Vec::new(),
        })
    }

    /// Process-unique id
    pub const fn id(&self) -> SurfaceId {
        self.id
    }

    /// Backend handle
    pub const fn handle(&self) -> SurfaceHandle {
        self.handle
    }

    /// Window title
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Framebuffer size
    pub const fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Screen position
    pub const fn position(&self) -> (i32, i32) {
        self.position
    }

    /// Append a non-owning reference. The caller keeps the entity alive.
    pub fn add_drawable(&mut self, drawable: &Rc<dyn Drawable>) {
        self.drawables.push(DrawableRef::Borrowed(Rc::downgrade(drawable)));
    }

    /// Append a reference that shares ownership of the entity
    pub fn add_owned(&mut self, drawable: Rc<dyn Drawable>) {
        self.drawables.push(DrawableRef::Owned(drawable));
    }

    /// Remove every entry denoting the same entity as `drawable`.
    ///
    /// Returns how many entries were removed; zero is not an error.
    pub fn remove_drawable(&mut self, drawable: &Rc<dyn Drawable>) -> usize {
        let target = entity_addr(drawable);
        let before = self.drawables.len();
        self.drawables.retain(|entry| !std::ptr::eq(entry.addr(), target));
        before - self.drawables.len()
    }

    /// Number of entries, including borrowed ones whose owner has gone
    pub fn drawable_count(&self) -> usize {
        self.drawables.len()
    }

    /// Entries still alive, in render order
    pub fn live_drawables(&self) -> Vec<Rc<dyn Drawable>> {
        self.drawables.iter().filter_map(DrawableRef::upgrade).collect()
    }

    /// Drop borrowed entries whose owner has gone; returns how many
    pub fn prune(&mut self) -> usize {
        let before = self.drawables.len();
        self.drawables.retain(DrawableRef::is_live);
        let pruned = before - self.drawables.len();
        if pruned > 0 {
            log::debug!("Surface {} pruned {pruned} dead drawable(s)", self.id);
        }
        pruned
    }

    /// Bind this surface's context
    pub fn make_current(&self, gpu: &mut dyn GraphicsBackend) {
        gpu.make_current(self.handle);
    }

    /// Render every live entry in insertion order on the current context
    pub fn draw(&self, gpu: &mut dyn GraphicsBackend) {
        for drawable in self.drawables.iter().filter_map(DrawableRef::upgrade) {
            drawable.render(gpu);
        }
    }

    /// Present the back buffer
    pub fn present(&self, gpu: &mut dyn GraphicsBackend) {
        gpu.swap_buffers(self.handle);
    }

    /// Make current, draw everything, present
    pub fn render(&self, gpu: &mut dyn GraphicsBackend) {
        self.make_current(gpu);
        self.draw(gpu);
        self.present(gpu);
    }

    /// Apply a framebuffer resize: the viewport matches the new size exactly
    pub fn handle_resize(&mut self, gpu: &mut dyn GraphicsBackend, width: u32, height: u32) {
        self.make_current(gpu);
        gpu.set_viewport(width, height);
        self.size = (width, height);
        log::debug!("Surface {} resized to {width}x{height}", self.id);
    }

    /// Whether the user or the OS asked this surface to close
    pub fn should_close(&self, gpu: &dyn GraphicsBackend) -> bool {
        gpu.should_close(self.handle)
    }

    /// Release the native surface
    pub fn destroy(self, gpu: &mut dyn GraphicsBackend) {
        gpu.destroy_surface(self.handle);
        log::info!("Destroyed surface {} \"{}\"", self.id, self.title);
    }
}

impl fmt::Debug for RenderSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderSurface")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("size", &self.size)
            .field("position", &self.position)
            .field("drawables", &self.drawables.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{BackendCall, HeadlessBackend};
    use std::cell::RefCell;

    /// Records its tag into a shared log when rendered
    struct Marker {
        tag: u32,
        log: Rc<RefCell<Vec<u32>>>,
    }

    impl Drawable for Marker {
        fn render(&self, _gpu: &mut dyn GraphicsBackend) {
            self.log.borrow_mut().push(self.tag);
        }
    }

    fn marker(tag: u32, log: &Rc<RefCell<Vec<u32>>>) -> Rc<dyn Drawable> {
        Rc::new(Marker {
            tag,
            log: Rc::clone(log),
        })
    }

    fn surface(gpu: &mut HeadlessBackend) -> RenderSurface {
        RenderSurface::create_with_ids(
            gpu,
            &SurfaceDescriptor::new("test", 64, 48).at(5, 6),
            &SurfaceIdAllocator::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_consecutive_ids_increase_by_one() {
        let mut gpu = HeadlessBackend::new();
        let ids = SurfaceIdAllocator::new();
        let descriptor = SurfaceDescriptor::new("a", 10, 10);

        let first = RenderSurface::create_with_ids(&mut gpu, &descriptor, &ids).unwrap();
        let second = RenderSurface::create_with_ids(&mut gpu, &descriptor, &ids).unwrap();
        first.destroy(&mut gpu);
        let third = RenderSurface::create_with_ids(&mut gpu, &descriptor, &ids).unwrap();

        assert_eq!(second.id().value(), 2);
        assert_eq!(third.id().value(), second.id().value() + 1);
    }

    #[test]
    fn test_global_ids_strictly_increase() {
        let mut gpu = HeadlessBackend::new();
        let descriptor = SurfaceDescriptor::new("g", 10, 10);

        let a = RenderSurface::create(&mut gpu, &descriptor).unwrap();
        let b = RenderSurface::create(&mut gpu, &descriptor).unwrap();

        assert!(b.id() > a.id());
    }

    #[test]
    fn test_failed_creation_allocates_no_id() {
        let mut gpu = HeadlessBackend::new();
        let ids = SurfaceIdAllocator::new();
        gpu.fail_next_surface();

        let err = RenderSurface::create_with_ids(&mut gpu, &SurfaceDescriptor::new("x", 1, 1), &ids)
            .unwrap_err();
        assert!(matches!(err, SurfaceCreationError::ContextUnavailable { .. }));
        assert_eq!(gpu.surface_count(), 0);
        assert_eq!(ids.allocate().value(), 1);
    }

    #[test]
    fn test_creation_records_descriptor() {
        let mut gpu = HeadlessBackend::new();
        let s = surface(&mut gpu);

        assert_eq!(s.title(), "test");
        assert_eq!(s.size(), (64, 48));
        assert_eq!(s.position(), (5, 6));
        assert_eq!(gpu.current_surface(), Some(s.handle()));
    }

    #[test]
    fn test_render_order_is_insertion_order_minus_removed() {
        let mut gpu = HeadlessBackend::new();
        let mut s = surface(&mut gpu);
        let log = Rc::new(RefCell::new(Vec::new()));

        let shapes: Vec<_> = (0..5).map(|tag| marker(tag, &log)).collect();
        for shape in &shapes {
            s.add_drawable(shape);
        }
        s.remove_drawable(&shapes[1]);
        s.remove_drawable(&shapes[3]);
        s.add_drawable(&shapes[1]);

        s.render(&mut gpu);

        assert_eq!(*log.borrow(), vec![0, 2, 4, 1]);
    }

    #[test]
    fn test_remove_by_identity_removes_all_entries() {
        let mut gpu = HeadlessBackend::new();
        let mut s = surface(&mut gpu);
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = marker(1, &log);
        let b = marker(1, &log);

        s.add_drawable(&a);
        s.add_owned(Rc::clone(&a));
        s.add_drawable(&b);
        s.add_drawable(&a);

        assert_eq!(s.remove_drawable(&a), 3);
        assert_eq!(s.drawable_count(), 1);
        assert_eq!(s.remove_drawable(&a), 0);
    }

    #[test]
    fn test_dead_borrowed_entry_is_skipped_then_pruned() {
        let mut gpu = HeadlessBackend::new();
        let mut s = surface(&mut gpu);
        let log = Rc::new(RefCell::new(Vec::new()));
        let kept = marker(1, &log);
        let dropped = marker(2, &log);

        s.add_drawable(&dropped);
        s.add_drawable(&kept);
        drop(dropped);

        s.render(&mut gpu);
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(s.drawable_count(), 2);
        assert_eq!(s.prune(), 1);
        assert_eq!(s.live_drawables().len(), 1);
    }

    #[test]
    fn test_owned_entry_keeps_entity_alive() {
        let mut gpu = HeadlessBackend::new();
        let mut s = surface(&mut gpu);
        let log = Rc::new(RefCell::new(Vec::new()));

        s.add_owned(marker(7, &log));
        s.render(&mut gpu);

        assert_eq!(*log.borrow(), vec![7]);
        assert_eq!(s.prune(), 0);
    }

    #[test]
    fn test_render_binds_before_presenting() {
        let mut gpu = HeadlessBackend::new();
        let a = surface(&mut gpu);
        let b = surface(&mut gpu);
        gpu.take_calls();

        a.render(&mut gpu);
        b.render(&mut gpu);

        assert_eq!(
            gpu.take_calls(),
            vec![
                BackendCall::MakeCurrent(a.handle()),
                BackendCall::SwapBuffers(a.handle()),
                BackendCall::MakeCurrent(b.handle()),
                BackendCall::SwapBuffers(b.handle()),
            ]
        );
    }

    #[test]
    fn test_resize_sets_exact_viewport() {
        let mut gpu = HeadlessBackend::new();
        let mut a = surface(&mut gpu);
        let _b = surface(&mut gpu);

        a.handle_resize(&mut gpu, 1024, 700);

        assert_eq!(a.size(), (1024, 700));
        assert_eq!(gpu.viewport(a.handle()), Some((1024, 700)));
        assert_eq!(gpu.current_surface(), Some(a.handle()));
    }
}
