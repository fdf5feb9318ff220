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

//! Scene-graph nodes. A view is a movable rectangle with an attached buffer
//! and a set of screens it currently intersects. The role behind it decides
//! what attach/update/move actually do: composite into the scene, drive the
//! primary plane, or drive a hardware cursor.
//!
//! Observers subscribe with `add_handler`. Handlers never own the view and
//! the view never owns its handlers; registrations are weak and dropped
//! subscribers are pruned on dispatch.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use thiserror::Error;

use crate::buffer::Buffer;
use crate::geometry::Rectangle;
use crate::geometry::Size;
use crate::server::Server;

#[derive(Debug, Error)]
pub enum AttachError {
    /// The KMS device returned EACCES: the session is being deactivated and
    /// the launcher's notice has not reached us yet.
    #[error("DRM access revoked")]
    AccessRevoked,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Observer of view state changes. All callbacks are synchronous and run on
/// the event loop; implementations must tolerate reentrant view operations.
pub trait ViewHandler {
    fn attached(&self, _server: &Rc<Server>, _view: &Rc<View>) {}
    fn moved(&self, _server: &Rc<Server>, _view: &Rc<View>) {}
    fn resized(&self, _server: &Rc<Server>, _view: &Rc<View>, _old: Size) {}
    fn screens_changed(&self, _server: &Rc<Server>, _view: &Rc<View>, _entered: u32, _left: u32) {}
    fn frame(&self, _server: &Rc<Server>, _view: &Rc<View>, _time: u32) {}
}

/// The polymorphic part of a view.
pub(crate) trait ViewRole {
    /// Presents a new buffer. On success the caller adopts the reference.
    fn attach(
        &self,
        server: &Rc<Server>,
        view: &Rc<View>,
        buffer: Option<&Rc<Buffer>>,
    ) -> Result<(), AttachError>;

    /// Something about the displayed content changed; arrange for a redraw.
    fn update(&self, server: &Rc<Server>, view: &Rc<View>) -> bool;

    /// Repositions the view.
    fn move_to(&self, server: &Rc<Server>, view: &Rc<View>, x: i32, y: i32) -> bool;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ViewHandlerId(u64);

pub struct View {
    geometry: Cell<Rectangle>,
    buffer: RefCell<Option<Rc<Buffer>>>,
    /// Bitmask of screens this view currently intersects.
    screens: Cell<u32>,
    handlers: RefCell<Vec<(ViewHandlerId, Weak<dyn ViewHandler>)>>,
    next_handler_id: Cell<u64>,
    pub(crate) role: Box<dyn ViewRole>,
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("geometry", &self.geometry.get())
            .field("screens", &self.screens.get())
            .field("has_buffer", &self.buffer.borrow().is_some())
            .finish()
    }
}

impl View {
    pub(crate) fn new(role: Box<dyn ViewRole>) -> Rc<Self> {
        Rc::new(Self {
            geometry: Cell::new(Rectangle::default()),
            buffer: RefCell::new(None),
            screens: Cell::new(0),
            handlers: RefCell::new(Vec::new()),
            next_handler_id: Cell::new(0),
            role,
        })
    }

    pub fn geometry(&self) -> Rectangle {
        self.geometry.get()
    }

    pub fn screens(&self) -> u32 {
        self.screens.get()
    }

    pub fn buffer(&self) -> Option<Rc<Buffer>> {
        self.buffer.borrow().clone()
    }

    pub fn add_handler(&self, handler: &Rc<dyn ViewHandler>) -> ViewHandlerId {
        let id = ViewHandlerId(self.next_handler_id.get());
        self.next_handler_id.set(id.0 + 1);
        self.handlers
            .borrow_mut()
            .push((id, Rc::downgrade(handler)));
        id
    }

    pub fn remove_handler(&self, id: ViewHandlerId) {
        self.handlers.borrow_mut().retain(|(hid, _)| *hid != id);
    }

    fn live_handlers(&self) -> Vec<Rc<dyn ViewHandler>> {
        let mut handlers = self.handlers.borrow_mut();
        handlers.retain(|(_, weak)| weak.strong_count() > 0);
        handlers.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    pub fn attach(
        self: &Rc<Self>,
        server: &Rc<Server>,
        buffer: Option<&Rc<Buffer>>,
    ) -> Result<(), AttachError> {
        self.role.attach(server, self, buffer)?;
        *self.buffer.borrow_mut() = buffer.cloned();
        for handler in self.live_handlers() {
            handler.attached(server, self);
        }
        Ok(())
    }

    pub fn update(self: &Rc<Self>, server: &Rc<Server>) -> bool {
        self.role.update(server, self)
    }

    pub fn move_to(self: &Rc<Self>, server: &Rc<Server>, x: i32, y: i32) -> bool {
        self.role.move_to(server, self, x, y)
    }

    /// Updates the position, notifying handlers. Returns whether anything
    /// changed. Role implementations call this; external movement goes
    /// through `move_to`.
    pub(crate) fn set_position(self: &Rc<Self>, server: &Rc<Server>, x: i32, y: i32) -> bool {
        let mut geometry = self.geometry.get();
        if geometry.x == x && geometry.y == y {
            return false;
        }
        geometry.x = x;
        geometry.y = y;
        self.geometry.set(geometry);
        for handler in self.live_handlers() {
            handler.moved(server, self);
        }
        true
    }

    pub(crate) fn set_size(self: &Rc<Self>, server: &Rc<Server>, width: u32, height: u32) -> bool {
        let mut geometry = self.geometry.get();
        if geometry.width == width && geometry.height == height {
            return false;
        }
        let old = geometry.size();
        geometry.width = width;
        geometry.height = height;
        self.geometry.set(geometry);
        for handler in self.live_handlers() {
            handler.resized(server, self, old);
        }
        true
    }

    pub(crate) fn set_size_from_buffer(
        self: &Rc<Self>,
        server: &Rc<Server>,
        buffer: Option<&Rc<Buffer>>,
    ) -> bool {
        match buffer {
            Some(buffer) => self.set_size(server, buffer.width(), buffer.height()),
            None => self.set_size(server, 0, 0),
        }
    }

    pub(crate) fn set_screens(self: &Rc<Self>, server: &Rc<Server>, screens: u32) {
        let old = self.screens.get();
        if old == screens {
            return;
        }
        let entered = screens & !old;
        let left = old & !screens;
        self.screens.set(screens);
        for handler in self.live_handlers() {
            handler.screens_changed(server, self, entered, left);
        }
    }

    /// Recomputes the screen mask from geometry intersection.
    pub(crate) fn update_screens(self: &Rc<Self>, server: &Rc<Server>) {
        let geometry = self.geometry.get();
        let mut screens = 0;
        for screen in server.screens().iter() {
            if screen.geometry().overlaps(&geometry) {
                screens |= screen.mask();
            }
        }
        self.set_screens(server, screens);
    }

    /// Delivers a presentation timestamp to handlers; surfaces turn this
    /// into client frame callbacks.
    pub(crate) fn frame(self: &Rc<Self>, server: &Rc<Server>, time: u32) {
        for handler in self.live_handlers() {
            handler.frame(server, self, time);
        }
    }

    pub(crate) fn role_as<T: 'static>(&self) -> Option<&T> {
        self.role.as_any().downcast_ref::<T>()
    }
}
