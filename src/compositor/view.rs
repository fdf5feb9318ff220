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

//! Views composited into the scene. On top of the generic view core this
//! adds visibility (with parent-follows), a border, the clip region (parts
//! hidden by opaque content above), and cached extents.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use crate::buffer::Buffer;
use crate::event::Signal;
use crate::geometry::Rectangle;
use crate::prelude::*;
use crate::region::Region;
use crate::render::BufferFlags;
use crate::render::Capabilities;
use crate::server::Server;
use crate::surface::Surface;
use crate::view::AttachError;
use crate::view::View;
use crate::view::ViewRole;
use crate::window::Window;

#[derive(Debug, Copy, Clone)]
pub struct Border {
    pub width: u32,
    pub color: u32,
    pub damaged: bool,
}

pub struct CompositorView {
    view: Rc<View>,
    surface: Rc<Surface>,
    /// What the renderer reads: the client buffer, or a mappable proxy of it
    /// when the renderer cannot read the client's storage directly.
    render_buffer: RefCell<Option<Rc<Buffer>>>,
    window: RefCell<Option<Weak<Window>>>,
    parent: RefCell<Option<Weak<CompositorView>>>,
    visible: Cell<bool>,
    /// View rectangle inflated by the border.
    extents: Cell<Rectangle>,
    border: RefCell<Border>,
    /// Region of this view hidden by opaque content above it; recomputed
    /// every repaint.
    pub(crate) clip: RefCell<Region>,
    pub destroy_signal: Signal<()>,
}

pub(crate) struct CompositorRole {
    pub(crate) state: Weak<CompositorView>,
}

impl CompositorView {
    pub(crate) fn new(surface: &Rc<Surface>) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<CompositorView>| Self {
            view: View::new(Box::new(CompositorRole {
                state: weak.clone(),
            })),
            surface: surface.clone(),
            render_buffer: RefCell::new(None),
            window: RefCell::new(None),
            parent: RefCell::new(None),
            visible: Cell::new(false),
            extents: Cell::new(Rectangle::default()),
            border: RefCell::new(Border {
                width: 0,
                color: 0xff000000,
                damaged: false,
            }),
            clip: RefCell::new(Region::new()),
            destroy_signal: Signal::new(),
        })
    }

    pub fn view(&self) -> Rc<View> {
        self.view.clone()
    }

    pub fn surface(&self) -> &Rc<Surface> {
        &self.surface
    }

    pub fn visible(&self) -> bool {
        self.visible.get()
    }

    pub fn extents(&self) -> Rectangle {
        self.extents.get()
    }

    pub fn border(&self) -> Border {
        *self.border.borrow()
    }

    pub(crate) fn clear_border_damage(&self) {
        self.border.borrow_mut().damaged = false;
    }

    pub fn window(&self) -> Option<Rc<Window>> {
        self.window.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_window(&self, window: Option<&Rc<Window>>) {
        *self.window.borrow_mut() = window.map(Rc::downgrade);
    }

    pub fn parent(&self) -> Option<Rc<CompositorView>> {
        self.parent.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn render_buffer(&self) -> Option<Rc<Buffer>> {
        self.render_buffer.borrow().clone()
    }

    fn update_extents(&self) {
        let width = self.border.borrow().width;
        let geometry = self.view().geometry();
        self.extents.set(geometry.inflated(width));
        self.border.borrow_mut().damaged = true;
    }

    /// Adds the area below this view (extents minus clip) to the compositor
    /// damage.
    pub(crate) fn damage_below(&self, server: &Rc<Server>) {
        let mut below = Region::from_rect(self.extents.get());
        below.subtract(&self.clip.borrow());
        server.compositor.add_damage(&below);
    }

    fn damage_fully(&self, server: &Rc<Server>) {
        self.damage_below(server);
        self.border.borrow_mut().damaged = true;
    }

    pub fn show(self: &Rc<Self>, server: &Rc<Server>) {
        if self.visible.get() {
            return;
        }
        self.visible.set(true);
        let view = self.view();
        view.update_screens(server);

        // Assume worst-case no clipping until the next frame recomputes it
        // (the view may move again before that).
        self.clip.borrow_mut().clear();
        self.damage_fully(server);
        view.update(server);

        for other in server.compositor.views() {
            if let Some(parent) = other.parent()
                && Rc::ptr_eq(&parent, self)
            {
                other.show(server);
            }
        }
    }

    pub fn hide(self: &Rc<Self>, server: &Rc<Server>) {
        if !self.visible.get() {
            return;
        }
        let view = self.view();
        // Update all the screens the view was on.
        view.update(server);
        self.damage_below(server);

        view.set_screens(server, 0);
        self.visible.set(false);

        for other in server.compositor.views() {
            if let Some(parent) = other.parent()
                && Rc::ptr_eq(&parent, self)
            {
                other.hide(server);
            }
        }
    }

    pub fn set_parent(self: &Rc<Self>, server: &Rc<Server>, parent: &Rc<CompositorView>) {
        *self.parent.borrow_mut() = Some(Rc::downgrade(parent));
        if parent.visible() {
            self.show(server);
        } else {
            self.hide(server);
        }
    }

    pub fn set_border_width(self: &Rc<Self>, server: &Rc<Server>, width: u32) {
        {
            let mut border = self.border.borrow_mut();
            if border.width == width {
                return;
            }
            border.width = width;
            border.damaged = true;
        }
        self.update_extents();
        self.view().update(server);
    }

    pub fn set_border_color(self: &Rc<Self>, server: &Rc<Server>, color: u32) {
        {
            let mut border = self.border.borrow_mut();
            if border.color == color {
                return;
            }
            border.color = color;
            border.damaged = true;
        }
        self.view().update(server);
    }

    pub fn destroy(self: &Rc<Self>, server: &Rc<Server>) {
        self.destroy_signal.emit(&());
        self.hide(server);
        self.surface.set_view(server, None);
        server.compositor.remove_view(self);
    }

    /// Keeps `render_buffer` in sync with the client buffer, inserting or
    /// reusing a mappable proxy when the renderer cannot read the client's
    /// storage.
    fn update_render_buffer(
        &self,
        server: &Rc<Server>,
        view: &Rc<View>,
        client_buffer: Option<&Rc<Buffer>>,
    ) -> Result<()> {
        let old_render = self.render_buffer.borrow().clone();
        let old_client = view.buffer();
        let was_proxy = match (&old_render, &old_client) {
            (Some(render), Some(client)) => !Rc::ptr_eq(render, client),
            _ => false,
        };
        let needs_proxy = client_buffer.is_some_and(|b| {
            !server
                .renderer()
                .capabilities(b)
                .contains(Capabilities::READ)
        });
        let resized = match (&old_render, client_buffer) {
            (Some(old), Some(new)) => {
                old.width() != new.width() || old.height() != new.height()
            },
            _ => false,
        };

        let buffer = match client_buffer {
            Some(client_buffer) => {
                if needs_proxy {
                    if !was_proxy || resized {
                        debug!("creating a proxy buffer");
                        Some(server.cpu_context().create_buffer(
                            client_buffer.width(),
                            client_buffer.height(),
                            client_buffer.format(),
                            BufferFlags::MAP,
                        )?)
                    } else {
                        old_render
                    }
                } else {
                    Some(client_buffer.clone())
                }
            },
            None => None,
        };

        *self.render_buffer.borrow_mut() = buffer;
        Ok(())
    }

    /// Copies freshly-damaged pixels from the client buffer into the proxy.
    /// No-op when compositing reads the client buffer directly.
    pub(crate) fn flush_render_buffer(&self, server: &Rc<Server>) {
        let render = self.render_buffer.borrow().clone();
        let client = self.view().buffer();
        let (Some(render), Some(client)) = (render, client) else {
            return;
        };
        if Rc::ptr_eq(&render, &client) {
            return;
        }
        let damage = self.surface.state().damage.clone();
        let renderer = server.cpu_renderer();
        log_and_return!(renderer.set_target(&render));
        renderer.copy_region(&client, 0, 0, &damage);
        renderer.flush();
    }
}

impl ViewRole for CompositorRole {
    fn attach(
        &self,
        server: &Rc<Server>,
        view: &Rc<View>,
        buffer: Option<&Rc<Buffer>>,
    ) -> Result<(), AttachError> {
        let Some(state) = self.state.upgrade() else {
            return Ok(());
        };

        state.update_render_buffer(server, view, buffer)?;

        // Schedule updates on the screens the view was previously visible
        // on.
        self.update(server, view);

        if view.set_size_from_buffer(server, buffer) {
            let old_extents = state.extents.get();
            state.update_extents();

            if state.visible.get() {
                // Damage the newly covered or uncovered area, minus the
                // clip region.
                let mut changed = Region::from_rect(old_extents);
                let new_extents = Region::from_rect(state.extents.get());
                let mut both = changed.clone();
                both.intersect(&new_extents);
                changed.union(&new_extents);
                changed.subtract(&both);
                changed.subtract(&state.clip.borrow());
                server.compositor.add_damage(&changed);

                view.update_screens(server);
                self.update(server, view);
            }
        }

        Ok(())
    }

    fn update(&self, server: &Rc<Server>, view: &Rc<View>) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        if !server.active() || !state.visible.get() {
            return false;
        }
        server.compositor.schedule_updates(server, view.screens());
        true
    }

    fn move_to(&self, server: &Rc<Server>, view: &Rc<View>, x: i32, y: i32) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };

        if state.visible.get() {
            state.damage_below(server);
            self.update(server, view);
        }

        if view.set_position(server, x, y) {
            state.update_extents();

            if state.visible.get() {
                // Assume worst-case no clipping until the next frame is
                // drawn, in case the view moves again before then.
                state.clip.borrow_mut().clear();

                view.update_screens(server);
                state.damage_below(server);
                self.update(server, view);
            }
        }

        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Recovers the compositor state behind a generic view, if it is one.
pub fn compositor_view(view: &View) -> Option<Rc<CompositorView>> {
    view.role_as::<CompositorRole>()
        .and_then(|role| role.state.upgrade())
}
