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

//! The pointer: sub-pixel position clipped to the union of screen
//! geometries, the pressed-button array with per-press winning handlers,
//! pointer focus, and the cursor image driven onto every screen's hardware
//! cursor plane.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use crate::buffer::Buffer;
use crate::compositor::CompositorView;
use crate::event::Signal;
use crate::event::SubscriptionId;
use crate::geometry::FPoint;
use crate::geometry::Point;
use crate::input::Press;
use crate::input::PressSet;
use crate::input::focus::FocusChange;
use crate::input::focus::InputFocus;
use crate::prelude::*;
use crate::protocol::Axis;
use crate::protocol::ButtonState;
use crate::protocol::ClientId;
use crate::protocol::PointerResource;
use crate::protocol::Serial;
use crate::region::Region;
use crate::render::BufferFlags;
use crate::server::Server;
use crate::surface::Surface;
use crate::utils;
use crate::view::AttachError;
use crate::view::View;
use crate::view::ViewRole;

pub type PointerHandlerRef = Rc<dyn PointerHandler>;

/// A stage in the pointer handler stack. Interactive move/resize pushes a
/// one-shot handler to the front; the compositor's focus tracker and the
/// client forwarder sit at the back.
pub trait PointerHandler {
    fn motion(&self, _server: &Rc<Server>, _time: u32, _position: FPoint) -> bool {
        false
    }

    fn button(
        &self,
        _server: &Rc<Server>,
        _time: u32,
        _press: &Press<PointerHandlerRef>,
        _state: ButtonState,
    ) -> bool {
        false
    }

    fn axis(&self, _server: &Rc<Server>, _time: u32, _axis: Axis, _amount: f64) -> bool {
        false
    }
}

/// Forwards events to the focused client's pointer resources.
struct ClientPointerHandler {
    pointer: Weak<Pointer>,
}

impl PointerHandler for ClientPointerHandler {
    fn motion(&self, _server: &Rc<Server>, time: u32, position: FPoint) -> bool {
        let Some(pointer) = self.pointer.upgrade() else {
            return false;
        };
        let focus = pointer.focus.borrow();
        let Some(view) = focus.view() else {
            return false;
        };
        if focus.active().is_empty() {
            return false;
        }
        let geometry = view.view().geometry();
        let local = FPoint::new(position.x - geometry.x as f64, position.y - geometry.y as f64);
        for resource in focus.active() {
            resource.motion(time, local);
        }
        true
    }

    fn button(
        &self,
        _server: &Rc<Server>,
        time: u32,
        press: &Press<PointerHandlerRef>,
        state: ButtonState,
    ) -> bool {
        let Some(pointer) = self.pointer.upgrade() else {
            return false;
        };
        let focus = pointer.focus.borrow();
        if focus.active().is_empty() {
            return false;
        }
        for resource in focus.active() {
            resource.button(press.serial, time, press.value, state);
        }
        true
    }

    fn axis(&self, _server: &Rc<Server>, time: u32, axis: Axis, amount: f64) -> bool {
        let Some(pointer) = self.pointer.upgrade() else {
            return false;
        };
        let focus = pointer.focus.borrow();
        if focus.active().is_empty() {
            return false;
        }
        for resource in focus.active() {
            resource.axis(time, axis, amount);
        }
        true
    }
}

struct Cursor {
    view: Rc<View>,
    /// Client surface currently providing the cursor image, if any.
    surface: Option<Rc<Surface>>,
    surface_destroy: Option<SubscriptionId>,
    hotspot: Point,
    /// Staging buffer sized to the hardware cursor dimensions; what the
    /// cursor planes actually scan out.
    plane_buffer: Option<Rc<Buffer>>,
    /// The built-in arrow image.
    internal_buffer: Option<Rc<Buffer>>,
}

/// Role of the pointer's cursor view: attach composites the image into the
/// plane-sized staging buffer and hands it to every screen's cursor plane;
/// move commands the planes directly.
struct PointerCursorRole {
    pointer: Weak<Pointer>,
}

impl ViewRole for PointerCursorRole {
    fn attach(
        &self,
        server: &Rc<Server>,
        view: &Rc<View>,
        buffer: Option<&Rc<Buffer>>,
    ) -> Result<(), AttachError> {
        let Some(pointer) = self.pointer.upgrade() else {
            return Ok(());
        };

        let (surface, plane_buffer) = {
            let cursor = pointer.cursor.borrow();
            (cursor.surface.clone(), cursor.plane_buffer.clone())
        };

        // A committed cursor surface with no new damage needs no recompose.
        if let Some(surface) = &surface
            && surface.state().damage.is_empty()
        {
            return Ok(());
        }

        if let Some(plane_buffer) = &plane_buffer {
            let renderer = server.cpu_renderer();
            renderer
                .set_target(plane_buffer)
                .map_err(AttachError::Other)?;
            let full = Region::from_rect(crate::geometry::Rectangle::new(
                0,
                0,
                plane_buffer.width(),
                plane_buffer.height(),
            ));
            renderer.fill_region(0x00000000, &full);
            if let Some(buffer) = buffer {
                let content = Region::from_rect(crate::geometry::Rectangle::new(
                    0,
                    0,
                    buffer.width(),
                    buffer.height(),
                ));
                renderer.copy_region(buffer, 0, 0, &content);
            }
            renderer.flush();
        }

        if let Some(surface) = &surface {
            surface.state_mut().damage.clear();
        }

        if view.set_size_from_buffer(server, buffer) {
            view.update_screens(server);
        }

        for screen in server.screens().iter() {
            if let Some(plane) = &screen.cursor {
                let plane_view = plane.view();
                let content = buffer.is_some().then_some(plane_buffer.clone()).flatten();
                plane_view
                    .attach(server, content.as_ref())
                    .warn_and_ignore(loc!());
                plane_view.update(server);
            }
        }

        Ok(())
    }

    fn update(&self, server: &Rc<Server>, view: &Rc<View>) -> bool {
        view.frame(server, utils::time_ms());
        true
    }

    fn move_to(&self, server: &Rc<Server>, view: &Rc<View>, x: i32, y: i32) -> bool {
        if view.set_position(server, x, y) {
            view.update_screens(server);
        }
        let geometry = view.geometry();
        for screen in server.screens().iter() {
            if let Some(plane) = &screen.cursor {
                let plane_view = plane.view();
                plane_view.move_to(server, geometry.x, geometry.y);
                plane_view.update(server);
            }
        }
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Clips intended pointer motion to the region. Motion escaping the region
/// is clamped to the edges of the rectangle the pointer was last inside; a
/// pointer outside the region entirely snaps to the origin.
pub(crate) fn clip_position(region: &Region, last: FPoint, target: FPoint) -> FPoint {
    if region.contains_point(Point::from(target)) {
        return target;
    }
    let Some(rect) = region.containing_rect(Point::from(last)) else {
        if !region.is_empty() {
            warn!("pointer is outside the visible screen area");
        }
        return FPoint::new(0.0, 0.0);
    };
    FPoint::new(
        target.x.clamp(rect.x as f64, (rect.right() - 1) as f64),
        target.y.clamp(rect.y as f64, (rect.bottom() - 1) as f64),
    )
}

pub struct Pointer {
    x: Cell<f64>,
    y: Cell<f64>,
    /// Union of all screen geometries; pointer motion never leaves it.
    region: RefCell<Region>,
    focus: RefCell<InputFocus<dyn PointerResource>>,
    pub focus_changed: Signal<FocusChange>,
    handlers: RefCell<Vec<PointerHandlerRef>>,
    buttons: RefCell<PressSet<PointerHandlerRef>>,
    cursor: RefCell<Cursor>,
    view_destroy: RefCell<Option<(Rc<CompositorView>, SubscriptionId)>>,
}

impl Pointer {
    pub(crate) fn new() -> Rc<Self> {
        let pointer = Rc::new_cyclic(|weak: &Weak<Pointer>| Self {
            x: Cell::new(0.0),
            y: Cell::new(0.0),
            region: RefCell::new(Region::new()),
            focus: RefCell::new(InputFocus::new()),
            focus_changed: Signal::new(),
            handlers: RefCell::new(Vec::new()),
            buttons: RefCell::new(PressSet::new()),
            cursor: RefCell::new(Cursor {
                view: View::new(Box::new(PointerCursorRole {
                    pointer: weak.clone(),
                })),
                surface: None,
                surface_destroy: None,
                hotspot: Point::new(0, 0),
                plane_buffer: None,
                internal_buffer: None,
            }),
            view_destroy: RefCell::new(None),
        });
        let client_handler: PointerHandlerRef = Rc::new(ClientPointerHandler {
            pointer: Rc::downgrade(&pointer),
        });
        pointer.handlers.borrow_mut().push(client_handler);
        pointer
    }

    /// Allocates the plane staging buffer, centers the pointer on the first
    /// screen, and arms every cursor plane.
    pub(crate) fn initialize(self: &Rc<Self>, server: &Rc<Server>) -> Result<()> {
        // The staging buffer must be scannable by the cursor plane, so it
        // comes from the scanout allocator rather than plain memory.
        let (cursor_width, cursor_height) = server.drm.cursor_size();
        let plane_buffer = server.scanout_context().create_buffer(
            cursor_width,
            cursor_height,
            drm_fourcc::DrmFourcc::Argb8888,
            BufferFlags::MAP | BufferFlags::CURSOR,
        )?;
        self.cursor.borrow_mut().plane_buffer = Some(plane_buffer.clone());

        if let Some(screen) = server.screens().first() {
            let geometry = screen.geometry();
            self.x.set((geometry.x + geometry.width as i32 / 2) as f64);
            self.y.set((geometry.y + geometry.height as i32 / 2) as f64);
        }

        for screen in server.screens().iter() {
            if let Some(plane) = &screen.cursor {
                plane
                    .view()
                    .attach(server, Some(&plane_buffer))
                    .warn_and_ignore(loc!());
            }
        }

        self.set_default_cursor(server);
        Ok(())
    }

    pub fn position(&self) -> FPoint {
        FPoint::new(self.x.get(), self.y.get())
    }

    pub fn buttons_pressed(&self) -> bool {
        !self.buttons.borrow().is_empty()
    }

    pub fn pressed_buttons(&self) -> Vec<u32> {
        self.buttons.borrow().values().collect()
    }

    pub fn focused_view(&self) -> Option<Rc<CompositorView>> {
        self.focus.borrow().view()
    }

    pub fn focused_client(&self) -> Option<ClientId> {
        self.focus.borrow().client()
    }

    /// Installs a handler in front of all existing ones.
    pub fn push_handler(&self, handler: PointerHandlerRef) {
        self.handlers.borrow_mut().insert(0, handler);
    }

    pub fn remove_handler(&self, handler: &PointerHandlerRef) {
        self.handlers.borrow_mut().retain(|h| !Rc::ptr_eq(h, handler));
    }

    pub fn bind(self: &Rc<Self>, server: &Rc<Server>, resource: Rc<dyn PointerResource>) {
        let became_active = self.focus.borrow_mut().add_resource(resource.clone());
        if became_active
            && let Some(view) = self.focus.borrow().view()
        {
            let serial = server.next_serial();
            let geometry = view.view().geometry();
            let position = self.position();
            resource.enter(
                serial,
                view.surface().id(),
                FPoint::new(position.x - geometry.x as f64, position.y - geometry.y as f64),
            );
        }
    }

    pub fn unbind(&self, resource: &Rc<dyn PointerResource>) {
        self.focus.borrow_mut().remove_resource(resource);
    }

    pub fn set_focus(self: &Rc<Self>, server: &Rc<Server>, view: Option<&Rc<CompositorView>>) {
        let Some(transition) = self.focus.borrow_mut().set(view) else {
            return;
        };

        if let Some((old_view, sub)) = self.view_destroy.borrow_mut().take() {
            old_view.destroy_signal.unsubscribe(sub);
        }
        if let Some(new_view) = &transition.new_view {
            let weak = Rc::downgrade(self);
            let sub = new_view.destroy_signal.subscribe(move |()| {
                if let Some(pointer) = weak.upgrade() {
                    pointer.focus.borrow_mut().clear_destroyed_view();
                    pointer.view_destroy.borrow_mut().take();
                }
            });
            *self.view_destroy.borrow_mut() = Some((new_view.clone(), sub));
        }

        if let Some(old_view) = &transition.old_view {
            let serial = server.next_serial();
            for resource in &transition.left {
                resource.leave(serial, old_view.surface().id());
            }
        }
        if let Some(new_view) = &transition.new_view {
            if transition.entered.is_empty() {
                // Focused client has no pointer; show our own cursor.
                self.set_default_cursor(server);
            } else {
                let serial = server.next_serial();
                let geometry = new_view.view().geometry();
                let position = self.position();
                let local = FPoint::new(
                    position.x - geometry.x as f64,
                    position.y - geometry.y as f64,
                );
                for resource in &transition.entered {
                    resource.enter(serial, new_view.surface().id(), local);
                }
            }
        }

        self.focus_changed.emit(&FocusChange {
            old: transition.old_view,
            new: transition.new_view,
        });
    }

    /// Adopts a client surface as the cursor image. Only honoured from the
    /// client that currently has pointer focus.
    pub fn set_cursor_surface(
        self: &Rc<Self>,
        server: &Rc<Server>,
        client: ClientId,
        surface: Option<&Rc<Surface>>,
        hotspot: Point,
    ) {
        if Some(client) != self.focus.borrow().client() {
            return;
        }

        self.detach_cursor_surface(server);

        {
            let mut cursor = self.cursor.borrow_mut();
            cursor.surface = surface.cloned();
            cursor.hotspot = hotspot;
        }

        if let Some(surface) = surface {
            let view = self.cursor.borrow().view.clone();
            surface.set_view(server, Some(&view));
            let weak = Rc::downgrade(self);
            let server_weak = Rc::downgrade(server);
            let sub = surface.destroy_signal.subscribe(move |()| {
                let (Some(pointer), Some(server)) = (weak.upgrade(), server_weak.upgrade()) else {
                    return;
                };
                let view = pointer.cursor.borrow().view.clone();
                view.attach(&server, None).warn_and_ignore(loc!());
                let mut cursor = pointer.cursor.borrow_mut();
                cursor.surface = None;
                cursor.surface_destroy = None;
            });
            self.cursor.borrow_mut().surface_destroy = Some(sub);
            self.update_cursor(server);
        }
    }

    fn detach_cursor_surface(&self, server: &Rc<Server>) {
        let (surface, sub) = {
            let mut cursor = self.cursor.borrow_mut();
            (cursor.surface.take(), cursor.surface_destroy.take())
        };
        if let Some(surface) = surface {
            if let Some(sub) = sub {
                surface.destroy_signal.unsubscribe(sub);
            }
            surface.set_view(server, None);
        }
    }

    /// Shows the built-in arrow image.
    pub fn set_default_cursor(self: &Rc<Self>, server: &Rc<Server>) {
        self.detach_cursor_surface(server);

        let image = default_cursor_image(server);
        let (view, hotspot_changed) = {
            let mut cursor = self.cursor.borrow_mut();
            cursor.internal_buffer = image.as_ref().map(|(buffer, _)| buffer.clone());
            if let Some((_, hotspot)) = &image {
                cursor.hotspot = *hotspot;
            }
            (cursor.view.clone(), image.is_some())
        };
        if hotspot_changed {
            self.update_cursor(server);
        }
        let buffer = self.cursor.borrow().internal_buffer.clone();
        view.attach(server, buffer.as_ref()).warn_and_ignore(loc!());
    }

    fn update_cursor(&self, server: &Rc<Server>) {
        let (view, hotspot) = {
            let cursor = self.cursor.borrow();
            (cursor.view.clone(), cursor.hotspot)
        };
        let x = self.x.get() as i32 - hotspot.x;
        let y = self.y.get() as i32 - hotspot.y;
        view.move_to(server, x, y);
    }

    /// Replaces the motion region (the union of screen geometries) and
    /// clamps the current position into it.
    pub fn set_region(&self, server: &Rc<Server>, region: &Region) {
        *self.region.borrow_mut() = region.clone();
        let position = clip_position(region, self.position(), self.position());
        self.x.set(position.x);
        self.y.set(position.y);
        self.update_cursor(server);
    }

    pub fn handle_relative_motion(self: &Rc<Self>, server: &Rc<Server>, time: u32, dx: f64, dy: f64) {
        self.handle_absolute_motion(server, time, self.x.get() + dx, self.y.get() + dy);
    }

    pub fn handle_absolute_motion(self: &Rc<Self>, server: &Rc<Server>, time: u32, x: f64, y: f64) {
        let clipped = clip_position(&self.region.borrow(), self.position(), FPoint::new(x, y));
        self.x.set(clipped.x);
        self.y.set(clipped.y);

        let handlers = self.handlers.borrow().clone();
        for handler in handlers {
            if handler.motion(server, time, clipped) {
                break;
            }
        }

        self.update_cursor(server);
    }

    pub fn handle_button(self: &Rc<Self>, server: &Rc<Server>, time: u32, value: u32, state: ButtonState) {
        let serial = server.next_serial();

        match state {
            ButtonState::Released => {
                let Some(press) = self.buttons.borrow_mut().end(value, serial) else {
                    return;
                };
                if let Some(handler) = press.handler.clone() {
                    handler.button(server, time, &press, ButtonState::Released);
                }
            },
            ButtonState::Pressed => {
                if !self.buttons.borrow_mut().begin(value, serial) {
                    return;
                }
                let press = Press {
                    value,
                    serial,
                    handler: None,
                };
                let handlers = self.handlers.borrow().clone();
                let mut winner = None;
                for handler in handlers {
                    if handler.button(server, time, &press, ButtonState::Pressed) {
                        winner = Some(handler);
                        break;
                    }
                }
                self.buttons.borrow_mut().set_handler(value, winner);
            },
        }
    }

    pub fn handle_axis(self: &Rc<Self>, server: &Rc<Server>, time: u32, axis: Axis, amount: f64) {
        let handlers = self.handlers.borrow().clone();
        for handler in handlers {
            if handler.axis(server, time, axis, amount) {
                break;
            }
        }
    }

    /// The press record for a given serial, if that button is still down.
    pub fn find_button(&self, serial: Serial) -> Option<(u32, Serial)> {
        self.buttons
            .borrow()
            .find_serial(serial)
            .map(|press| (press.value, press.serial))
    }

    /// Captures or restores the handler of a held button. Used by
    /// interactive move/resize to reroute the eventual release.
    pub fn swap_button_handler(
        &self,
        serial: Serial,
        handler: Option<PointerHandlerRef>,
    ) -> Option<Option<PointerHandlerRef>> {
        self.buttons.borrow_mut().swap_handler(serial, handler)
    }
}

/// Rasterizes the built-in arrow cursor. Returns the buffer and hotspot.
fn default_cursor_image(server: &Rc<Server>) -> Option<(Rc<Buffer>, Point)> {
    const WIDTH: u32 = 12;
    const HEIGHT: u32 = 19;

    let buffer = server
        .cpu_context()
        .create_buffer(WIDTH, HEIGHT, drm_fourcc::DrmFourcc::Argb8888, BufferFlags::MAP)
        .log(loc!())
        .ok()?;

    buffer
        .with_bytes(&mut |bytes| {
            for y in 0..HEIGHT as usize {
                // A left arrow: the outline column grows with y until the
                // notch, then tapers into the tail.
                let edge = if y < 12 { y + 1 } else { 19 - y };
                for x in 0..WIDTH as usize {
                    let i = (y * WIDTH as usize + x) * 4;
                    let color: u32 = if x < edge {
                        if x == 0 || x == edge - 1 || y == HEIGHT as usize - 1 {
                            0xff000000
                        } else {
                            0xffffffff
                        }
                    } else {
                        0x00000000
                    };
                    bytes[i..i + 4].copy_from_slice(&color.to_le_bytes());
                }
            }
        })
        .log_and_ignore(loc!());

    Some((buffer, Point::new(0, 0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rectangle;

    #[test]
    fn test_clip_keeps_position_inside_region() {
        let region = Region::from_rect(Rectangle::new(0, 0, 100, 100));
        let inside = clip_position(&region, FPoint::new(50.0, 50.0), FPoint::new(70.5, 10.25));
        assert_eq!(inside, FPoint::new(70.5, 10.25));
    }

    #[test]
    fn test_clip_clamps_to_last_rect() {
        let region = Region::from_rect(Rectangle::new(0, 0, 100, 100));
        let clipped = clip_position(&region, FPoint::new(50.0, 50.0), FPoint::new(150.0, -20.0));
        assert_eq!(clipped, FPoint::new(99.0, 0.0));
    }

    #[test]
    fn test_clip_across_disjoint_screens() {
        // Two side-by-side screens; motion crossing between them is legal,
        // motion into the void clamps to the screen we were on.
        let mut region = Region::from_rect(Rectangle::new(0, 0, 100, 100));
        region.add_rect(Rectangle::new(100, 0, 100, 50));
        let crossed = clip_position(&region, FPoint::new(90.0, 25.0), FPoint::new(120.0, 25.0));
        assert_eq!(crossed, FPoint::new(120.0, 25.0));
        let clamped = clip_position(&region, FPoint::new(120.0, 25.0), FPoint::new(120.0, 80.0));
        assert_eq!(clamped, FPoint::new(120.0, 49.0));
    }

    #[test]
    fn test_clip_with_empty_region() {
        let region = Region::new();
        assert_eq!(
            clip_position(&region, FPoint::new(5.0, 5.0), FPoint::new(9.0, 9.0)),
            FPoint::new(0.0, 0.0)
        );
    }
}
