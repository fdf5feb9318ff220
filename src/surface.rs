// Copyright 2026 the welkin authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Client surfaces. A surface double-buffers its state: requests accumulate
//! into the pending half and become current atomically on commit. The
//! surface's buffer reference is weak (a destroyed client buffer simply
//! disappears from the state); the strong reference that keeps a presented
//! buffer alive belongs to the view.

use std::cell::Ref;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use bitflags::bitflags;

use crate::buffer::Buffer;
use crate::event::Signal;
use crate::geometry::Rectangle;
use crate::prelude::*;
use crate::protocol::ClientId;
use crate::protocol::FrameCallback;
use crate::protocol::SurfaceId;
use crate::protocol::SurfaceResource;
use crate::region::Region;
use crate::server::Server;
use crate::view::View;
use crate::view::ViewHandler;
use crate::view::ViewHandlerId;

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct CommitFlags: u32 {
        const ATTACH = 1 << 0;
        const DAMAGE = 1 << 1;
        const OPAQUE = 1 << 2;
        const INPUT = 1 << 3;
        const FRAME = 1 << 4;
    }
}

pub struct SurfaceState {
    pub buffer: Option<Weak<Buffer>>,
    pub damage: Region,
    pub opaque: Region,
    /// Defaults to infinite; clients opt out of input per region.
    pub input: Region,
    pub frame_callbacks: Vec<Rc<dyn FrameCallback>>,
}

impl SurfaceState {
    fn new() -> Self {
        Self {
            buffer: None,
            damage: Region::new(),
            opaque: Region::new(),
            input: Region::infinite(),
            frame_callbacks: Vec::new(),
        }
    }

    pub fn buffer(&self) -> Option<Rc<Buffer>> {
        self.buffer.as_ref().and_then(Weak::upgrade)
    }
}

struct Pending {
    state: SurfaceState,
    flags: CommitFlags,
}

pub struct Surface {
    id: SurfaceId,
    client: ClientId,
    resource: Rc<dyn SurfaceResource>,
    state: RefCell<SurfaceState>,
    pending: RefCell<Pending>,
    view: RefCell<Option<Rc<View>>>,
    view_handler: RefCell<Option<(Rc<dyn ViewHandler>, ViewHandlerId)>>,
    pub destroy_signal: Signal<()>,
}

/// The surface's subscription on its view: presentation timestamps fan out
/// to frame callbacks, screen-set changes become output enter/leave.
struct SurfaceViewHandler {
    surface: Weak<Surface>,
}

impl ViewHandler for SurfaceViewHandler {
    fn frame(&self, _server: &Rc<Server>, _view: &Rc<View>, time: u32) {
        let Some(surface) = self.surface.upgrade() else {
            return;
        };
        let callbacks = std::mem::take(&mut surface.state.borrow_mut().frame_callbacks);
        for callback in callbacks {
            callback.done(time);
        }
    }

    fn screens_changed(&self, server: &Rc<Server>, _view: &Rc<View>, entered: u32, left: u32) {
        let Some(surface) = self.surface.upgrade() else {
            return;
        };
        for screen in server.screens().iter() {
            if entered & screen.mask() != 0 {
                surface.resource.enter_output(screen.id());
            } else if left & screen.mask() != 0 {
                surface.resource.leave_output(screen.id());
            }
        }
    }
}

impl Surface {
    pub fn new(id: SurfaceId, client: ClientId, resource: Rc<dyn SurfaceResource>) -> Rc<Self> {
        Rc::new(Self {
            id,
            client,
            resource,
            state: RefCell::new(SurfaceState::new()),
            pending: RefCell::new(Pending {
                state: SurfaceState::new(),
                flags: CommitFlags::empty(),
            }),
            view: RefCell::new(None),
            view_handler: RefCell::new(None),
            destroy_signal: Signal::new(),
        })
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn state(&self) -> Ref<'_, SurfaceState> {
        self.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> std::cell::RefMut<'_, SurfaceState> {
        self.state.borrow_mut()
    }

    pub fn view(&self) -> Option<Rc<View>> {
        self.view.borrow().clone()
    }

    // Pending-state accumulators, one per wl_surface request.

    pub fn attach(&self, buffer: Option<&Rc<Buffer>>) {
        let mut pending = self.pending.borrow_mut();
        pending.flags |= CommitFlags::ATTACH;
        pending.state.buffer = buffer.map(Rc::downgrade);
    }

    pub fn damage(&self, rect: Rectangle) {
        let mut pending = self.pending.borrow_mut();
        pending.flags |= CommitFlags::DAMAGE;
        pending.state.damage.add_rect(rect);
    }

    pub fn frame(&self, callback: Rc<dyn FrameCallback>) {
        let mut pending = self.pending.borrow_mut();
        pending.flags |= CommitFlags::FRAME;
        pending.state.frame_callbacks.push(callback);
    }

    pub fn set_opaque_region(&self, region: Option<&Region>) {
        let mut pending = self.pending.borrow_mut();
        pending.flags |= CommitFlags::OPAQUE;
        pending.state.opaque = region.cloned().unwrap_or_default();
    }

    pub fn set_input_region(&self, region: Option<&Region>) {
        let mut pending = self.pending.borrow_mut();
        pending.flags |= CommitFlags::INPUT;
        pending.state.input = region.cloned().unwrap_or_else(Region::infinite);
    }

    /// Applies pending state to current. Returns the flags that were set so
    /// the caller can decide whether the view needs a fresh attach.
    pub fn apply_pending(&self) -> CommitFlags {
        let mut pending = self.pending.borrow_mut();
        let mut state = self.state.borrow_mut();
        let flags = pending.flags;

        if flags.contains(CommitFlags::ATTACH) {
            let old = state.buffer();
            let new = pending.state.buffer.as_ref().and_then(Weak::upgrade);
            match (&old, &new) {
                (Some(old_buffer), Some(new_buffer)) if Rc::ptr_eq(old_buffer, new_buffer) => {},
                (Some(old_buffer), _) => old_buffer.release(),
                _ => {},
            }
            state.buffer = pending.state.buffer.clone();
        }

        if flags.contains(CommitFlags::DAMAGE) {
            let damage = std::mem::take(&mut pending.state.damage);
            state.damage.union(&damage);
        }
        if flags.contains(CommitFlags::OPAQUE) {
            state.opaque = pending.state.opaque.clone();
        }
        if flags.contains(CommitFlags::INPUT) {
            state.input = pending.state.input.clone();
        }
        if flags.contains(CommitFlags::FRAME) {
            let callbacks = std::mem::take(&mut pending.state.frame_callbacks);
            state.frame_callbacks.extend(callbacks);
        }

        // Damage and opacity are meaningless outside the buffer.
        let bounds = match state.buffer() {
            Some(buffer) => Rectangle::new(0, 0, buffer.width(), buffer.height()),
            None => Rectangle::default(),
        };
        state.damage.intersect_rect(bounds);
        state.opaque.intersect_rect(bounds);

        pending.flags = CommitFlags::empty();
        flags
    }

    pub fn commit(&self, server: &Rc<Server>) {
        let flags = self.apply_pending();

        let view = self.view.borrow().clone();
        if let Some(view) = view {
            if flags.contains(CommitFlags::ATTACH) {
                let buffer = self.state.borrow().buffer();
                view.attach(server, buffer.as_ref()).warn_and_ignore(loc!());
            }
            view.update(server);
        }
    }

    /// Links or unlinks this surface to a view. The view adopts the current
    /// buffer immediately.
    pub fn set_view(self: &Rc<Self>, server: &Rc<Server>, view: Option<&Rc<View>>) {
        {
            let current = self.view.borrow();
            match (&*current, view) {
                (Some(a), Some(b)) if Rc::ptr_eq(a, b) => return,
                (None, None) => return,
                _ => {},
            }
        }

        if let Some(old) = self.view.borrow_mut().take()
            && let Some((_, id)) = self.view_handler.borrow_mut().take()
        {
            old.remove_handler(id);
        }

        if let Some(view) = view {
            let handler: Rc<dyn ViewHandler> = Rc::new(SurfaceViewHandler {
                surface: Rc::downgrade(self),
            });
            let id = view.add_handler(&handler);
            *self.view_handler.borrow_mut() = Some((handler, id));
            *self.view.borrow_mut() = Some(view.clone());

            let buffer = self.state.borrow().buffer();
            view.attach(server, buffer.as_ref()).warn_and_ignore(loc!());
            view.update(server);
        }
    }

    /// Tears the surface down when the client resource goes away.
    pub fn destroy(&self, _server: &Rc<Server>) {
        self.destroy_signal.emit(&());
        if let Some(view) = self.view.borrow_mut().take()
            && let Some((_, id)) = self.view_handler.borrow_mut().take()
        {
            view.remove_handler(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use drm_fourcc::DrmFourcc;

    use super::*;
    use crate::protocol::BufferHandle;
    use crate::protocol::ScreenId;

    struct NullResource;

    impl SurfaceResource for NullResource {
        fn client(&self) -> ClientId {
            ClientId(1)
        }
        fn enter_output(&self, _screen: ScreenId) {}
        fn leave_output(&self, _screen: ScreenId) {}
    }

    struct ReleaseCounter(Cell<u32>);

    impl BufferHandle for ReleaseCounter {
        fn release(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn surface() -> Rc<Surface> {
        Surface::new(SurfaceId(1), ClientId(1), Rc::new(NullResource))
    }

    fn buffer(w: u32, h: u32) -> Rc<Buffer> {
        Rc::new(Buffer::new(w, h, w * 4, DrmFourcc::Xrgb8888, None, None))
    }

    #[test]
    fn test_pending_is_not_visible_until_commit() {
        let s = surface();
        let buf = buffer(4, 4);
        s.attach(Some(&buf));
        s.damage(Rectangle::new(0, 0, 4, 4));
        assert!(s.state().buffer().is_none());
        assert!(s.state().damage.is_empty());
        s.apply_pending();
        assert!(s.state().buffer().is_some());
        assert_eq!(s.state().damage.area(), 16);
    }

    #[test]
    fn test_damage_and_opaque_trimmed_to_buffer() {
        let s = surface();
        let buf = buffer(2, 2);
        s.attach(Some(&buf));
        s.damage(Rectangle::new(-10, -10, 100, 100));
        s.set_opaque_region(Some(&Region::from_rect(Rectangle::new(1, 1, 50, 50))));
        s.apply_pending();
        assert_eq!(s.state().damage.area(), 4);
        assert_eq!(s.state().opaque.area(), 1);
    }

    #[test]
    fn test_destroyed_buffer_disappears_from_state() {
        let s = surface();
        let buf = buffer(2, 2);
        s.attach(Some(&buf));
        s.apply_pending();
        assert!(s.state().buffer().is_some());
        drop(buf);
        assert!(s.state().buffer().is_none());
    }

    #[test]
    fn test_replacing_buffer_releases_the_old_one() {
        let s = surface();
        let counter = Rc::new(ReleaseCounter(Cell::new(0)));
        let old = buffer(2, 2);
        old.set_release_handler(counter.clone());
        let new = buffer(2, 2);

        s.attach(Some(&old));
        s.apply_pending();
        // Committing the same buffer again must not release it.
        s.attach(Some(&old));
        s.apply_pending();
        assert_eq!(counter.0.get(), 0);

        s.attach(Some(&new));
        s.apply_pending();
        assert_eq!(counter.0.get(), 1);
    }

    #[test]
    fn test_frame_callbacks_accumulate_across_commits() {
        struct Cb(Cell<Option<u32>>);
        impl FrameCallback for Cb {
            fn done(&self, time: u32) {
                self.0.set(Some(time));
            }
        }

        let s = surface();
        let cb = Rc::new(Cb(Cell::new(None)));
        s.frame(cb.clone());
        s.apply_pending();
        s.frame(Rc::new(Cb(Cell::new(None))));
        s.apply_pending();
        assert_eq!(s.state().frame_callbacks.len(), 2);
    }

    #[test]
    fn test_input_region_defaults_to_infinite_and_resets() {
        let s = surface();
        assert!(s.state().input.contains_point(crate::geometry::Point::new(5000, 5000)));
        s.set_input_region(Some(&Region::from_rect(Rectangle::new(0, 0, 1, 1))));
        s.apply_pending();
        assert!(!s.state().input.contains_point(crate::geometry::Point::new(5, 5)));
        s.set_input_region(None);
        s.apply_pending();
        assert!(s.state().input.contains_point(crate::geometry::Point::new(5, 5)));
    }
}
