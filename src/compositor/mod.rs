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

//! The compositing engine. Keeps the flat front-to-back list of scene
//! views, accumulates damage and opaque coverage, and repaints each screen's
//! target from an idle task. Finished frames are attached to the screen's
//! primary plane; the page-flip completion drives client frame callbacks and
//! any follow-up repaint.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use drm_fourcc::DrmFourcc;

use crate::buffer::Buffer;
use crate::geometry::FPoint;
use crate::geometry::Point;
use crate::geometry::Rectangle;
use crate::input::pointer::PointerHandler;
use crate::prelude::*;
use crate::region::Region;
use crate::render::BufferFlags;
use crate::render::Swapchain;
use crate::screen::Screen;
use crate::server::Server;
use crate::surface::Surface;
use crate::view::AttachError;
use crate::view::View;
use crate::view::ViewHandler;

pub mod view;

pub use view::CompositorView;
pub use view::compositor_view;

/// Mask meaning "every screen".
pub const ALL_SCREENS: u32 = u32::MAX;

/// Per-screen render target: the swapchain feeding the primary plane.
struct Target {
    screen: Weak<Screen>,
    mask: u32,
    swapchain: RefCell<Swapchain>,
    current_buffer: RefCell<Option<Rc<Buffer>>>,
    next_buffer: RefCell<Option<Rc<Buffer>>>,
}

/// The target's subscription on its primary plane view: page-flip
/// completions arrive here.
struct TargetFrameHandler {
    compositor: Weak<Compositor>,
    target: Weak<Target>,
}

impl ViewHandler for TargetFrameHandler {
    fn frame(&self, server: &Rc<Server>, _view: &Rc<View>, time: u32) {
        let (Some(compositor), Some(target)) = (self.compositor.upgrade(), self.target.upgrade())
        else {
            return;
        };
        compositor.handle_screen_frame(server, &target, time);
    }
}

pub struct Compositor {
    /// Scene views in front-to-back order; index 0 is on top.
    views: RefCell<Vec<Rc<CompositorView>>>,
    damage: RefCell<Region>,
    opaque: RefCell<Region>,
    /// Screens repainted and waiting on a page flip.
    pending_flips: Cell<u32>,
    /// Screens to repaint on the next idle.
    scheduled_updates: Cell<u32>,
    updating: Cell<bool>,
    targets: RefCell<Vec<Rc<Target>>>,
    target_handlers: RefCell<Vec<Rc<dyn ViewHandler>>>,
}

impl Compositor {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            views: RefCell::new(Vec::new()),
            damage: RefCell::new(Region::new()),
            opaque: RefCell::new(Region::new()),
            pending_flips: Cell::new(0),
            scheduled_updates: Cell::new(0),
            updating: Cell::new(false),
            targets: RefCell::new(Vec::new()),
            target_handlers: RefCell::new(Vec::new()),
        })
    }

    /// Builds a render target per screen and registers the built-in
    /// bindings. Called once after screens exist.
    pub(crate) fn initialize(self: &Rc<Self>, server: &Rc<Server>) -> Result<()> {
        for screen in server.screens().iter() {
            self.add_target(server, screen)?;
        }

        server.bindings.add_key_binding(
            crate::bindings::BindingModifiers::exactly(
                crate::protocol::Modifiers::CTRL | crate::protocol::Modifiers::ALT,
            ),
            xkbcommon::xkb::keysyms::KEY_BackSpace,
            Rc::new(|server: &Rc<Server>, _time, _value| {
                server.terminate();
            }),
        );
        for (i, keysym) in (xkbcommon::xkb::keysyms::KEY_XF86Switch_VT_1
            ..=xkbcommon::xkb::keysyms::KEY_XF86Switch_VT_12)
            .enumerate()
        {
            let vt = i as u32 + 1;
            server.bindings.add_key_binding(
                crate::bindings::BindingModifiers::Any,
                keysym,
                Rc::new(move |server: &Rc<Server>, _time, _value| {
                    server.launch.activate_vt(vt).warn_and_ignore(loc!());
                }),
            );
        }

        Ok(())
    }

    fn add_target(self: &Rc<Self>, server: &Rc<Server>, screen: &Rc<Screen>) -> Result<()> {
        let geometry = screen.geometry();
        let swapchain = Swapchain::new(
            server.scanout_context(),
            geometry.width,
            geometry.height,
            DrmFourcc::Xrgb8888,
            BufferFlags::MAP | BufferFlags::SCANOUT,
        );
        let target = Rc::new(Target {
            screen: Rc::downgrade(screen),
            mask: screen.mask(),
            swapchain: RefCell::new(swapchain),
            current_buffer: RefCell::new(None),
            next_buffer: RefCell::new(None),
        });
        let handler: Rc<dyn ViewHandler> = Rc::new(TargetFrameHandler {
            compositor: Rc::downgrade(self),
            target: Rc::downgrade(&target),
        });
        screen.primary.view().add_handler(&handler);
        self.targets.borrow_mut().push(target);
        self.target_handlers.borrow_mut().push(handler);
        Ok(())
    }

    /// Creates a scene view for a surface and stacks it on top.
    pub fn create_view(
        self: &Rc<Self>,
        server: &Rc<Server>,
        surface: &Rc<Surface>,
    ) -> Rc<CompositorView> {
        let view = CompositorView::new(surface);
        self.views.borrow_mut().insert(0, view.clone());
        surface.set_view(server, Some(&view.view()));
        view
    }

    pub(crate) fn remove_view(&self, view: &Rc<CompositorView>) {
        self.views.borrow_mut().retain(|v| !Rc::ptr_eq(v, view));
    }

    /// Restacks `view` to the top.
    pub fn raise_view(&self, view: &Rc<CompositorView>) {
        let mut views = self.views.borrow_mut();
        if let Some(i) = views.iter().position(|v| Rc::ptr_eq(v, view)) {
            let view = views.remove(i);
            views.insert(0, view);
        }
    }

    pub(crate) fn views(&self) -> Vec<Rc<CompositorView>> {
        self.views.borrow().clone()
    }

    pub(crate) fn add_damage(&self, damage: &Region) {
        self.damage.borrow_mut().union(damage);
    }

    pub(crate) fn pending_flips(&self) -> u32 {
        self.pending_flips.get()
    }

    /// Marks screens as needing a repaint and queues the idle task. The
    /// task is queued at most once while the mask is non-zero.
    pub fn schedule_updates(&self, server: &Rc<Server>, screens: u32) {
        let screens = if screens == ALL_SCREENS {
            server
                .screens()
                .iter()
                .fold(0, |mask, screen| mask | screen.mask())
        } else {
            screens
        };
        if screens == 0 {
            return;
        }
        if self.scheduled_updates.get() == 0 {
            server.queue_repaint();
        }
        self.scheduled_updates
            .set(self.scheduled_updates.get() | screens);
    }

    pub(crate) fn clear_scheduled(&self) {
        self.scheduled_updates.set(0);
    }

    /// One repaint pass: accumulate damage, repaint every scheduled screen
    /// that is not waiting on a flip, submit the results to the primary
    /// planes.
    #[instrument(skip_all, level = "trace")]
    pub fn perform_update(self: &Rc<Self>, server: &Rc<Server>) {
        let updates = self.scheduled_updates.get() & !self.pending_flips.get();
        if !server.active() || updates == 0 {
            return;
        }

        trace!("performing update for screens {updates:#x}");
        self.updating.set(true);
        self.calculate_damage(server);

        let targets = self.targets.borrow().clone();
        for target in &targets {
            self.update_screen(server, target);
        }

        self.damage.borrow_mut().clear();
        self.scheduled_updates
            .set(self.scheduled_updates.get() & !updates);
        self.updating.set(false);
    }

    /// Walks views front to back: assigns clip regions, accumulates opaque
    /// coverage, and folds fresh surface damage (and border damage) into the
    /// compositor damage.
    fn calculate_damage(&self, server: &Rc<Server>) {
        self.opaque.borrow_mut().clear();

        for view in self.views() {
            if !view.visible() {
                continue;
            }
            let geometry = view.view().geometry();

            // Clip the view by the opaque region covering it.
            *view.clip.borrow_mut() = self.opaque.borrow().clone();

            let surface_opaque = view
                .surface()
                .state()
                .opaque
                .clone()
                .translated(geometry.x, geometry.y);
            self.opaque.borrow_mut().union(&surface_opaque);

            let has_damage = !view.surface().state().damage.is_empty();
            if has_damage {
                view.flush_render_buffer(server);
                let damage = std::mem::take(&mut view.surface().state_mut().damage);
                self.damage
                    .borrow_mut()
                    .union(&damage.translated(geometry.x, geometry.y));
            }

            let border_damaged = view.border().damaged;
            if border_damaged {
                let mut border = Region::from_rect(view.extents());
                border.subtract_rect(geometry);
                self.damage.borrow_mut().union(&border);
                view.clear_border_damage();
            }
        }
    }

    fn update_screen(self: &Rc<Self>, server: &Rc<Server>, target: &Rc<Target>) {
        if self.scheduled_updates.get() & target.mask == 0 {
            return;
        }
        let Some(screen) = target.screen.upgrade() else {
            return;
        };
        let geometry = screen.geometry();

        // Record this frame's damage with the swapchain in screen-local
        // coordinates; get back the total stale area of the next buffer.
        let mut damage = self.damage.borrow().clone();
        damage.intersect_rect(geometry);
        damage.translate(-geometry.x, -geometry.y);
        let total = match target.swapchain.borrow_mut().damage(&damage) {
            Ok(total) => total,
            Err(e) => {
                error!("swapchain damage failed: {e:?}");
                return;
            },
        };

        // Don't repaint the screen while it waits for a page flip; the
        // recorded damage is picked up by the next pass.
        if self.pending_flips.get() & target.mask != 0 {
            return;
        }

        let buffer = match target.swapchain.borrow_mut().take() {
            Ok(buffer) => buffer,
            Err(e) => {
                error!("no back buffer for screen {:?}: {e:?}", screen.id());
                return;
            },
        };

        let damage_global = total.translated(geometry.x, geometry.y);
        let mut base_damage = damage_global.clone();
        base_damage.subtract(&self.opaque.borrow());

        let renderer = server.renderer();
        log_and_return!(renderer.set_target(&buffer));

        // Paint base damage black.
        if !base_damage.is_empty() {
            let local = base_damage.translated(-geometry.x, -geometry.y);
            renderer.fill_region(0xff000000, &local);
        }

        for view in self.views().iter().rev() {
            if view.visible() && view.view().screens() & target.mask != 0 {
                self.repaint_view(server, &geometry, view, &damage_global);
            }
        }
        renderer.flush();

        match screen.primary.view().attach(server, Some(&buffer)) {
            Ok(()) => {
                self.pending_flips.set(self.pending_flips.get() | target.mask);
                *target.next_buffer.borrow_mut() = Some(buffer);
            },
            Err(AttachError::AccessRevoked) => {
                // The session is being deactivated but the launcher's notice
                // has not arrived yet.
                target.swapchain.borrow_mut().release(&buffer);
                server.deactivate();
            },
            Err(e) => {
                error!("failed to present frame: {e:?}");
                target.swapchain.borrow_mut().release(&buffer);
            },
        }
    }

    /// Draws one view into the current target: its damaged content clipped
    /// to the view rectangle, and the border ring around it.
    fn repaint_view(
        &self,
        server: &Rc<Server>,
        target_geometry: &Rectangle,
        view: &Rc<CompositorView>,
        damage: &Region,
    ) {
        let Some(buffer) = view.render_buffer() else {
            return;
        };
        let geometry = view.view().geometry();

        let mut view_damage = Region::from_rect(view.extents());
        view_damage.intersect(damage);
        view_damage.subtract(&view.clip.borrow());

        let mut border_damage = view_damage.clone();
        border_damage.subtract_rect(geometry);
        view_damage.intersect_rect(geometry);

        let renderer = server.renderer();

        if !view_damage.is_empty() {
            view_damage.translate(-geometry.x, -geometry.y);
            renderer.copy_region(
                &buffer,
                geometry.x - target_geometry.x,
                geometry.y - target_geometry.y,
                &view_damage,
            );
        }

        if !border_damage.is_empty() {
            border_damage.translate(-target_geometry.x, -target_geometry.y);
            renderer.fill_region(view.border().color, &border_damage);
        }
    }

    /// Page flip completed on `target`: deliver frame timestamps to visible
    /// views, recycle the previous front buffer, and run any repaint that
    /// was blocked on the flip.
    fn handle_screen_frame(self: &Rc<Self>, server: &Rc<Server>, target: &Rc<Target>, time: u32) {
        self.pending_flips.set(self.pending_flips.get() & !target.mask);

        for view in self.views() {
            if view.visible() && view.view().screens() & target.mask != 0 {
                view.view().frame(server, time);
            }
        }

        let previous = target.current_buffer.borrow_mut().take();
        if let Some(previous) = previous {
            target.swapchain.borrow_mut().release(&previous);
        }
        *target.current_buffer.borrow_mut() = target.next_buffer.borrow_mut().take();

        // If updates were scheduled while waiting on this flip, run them
        // now. When the compositor is mid-update the pass that submitted
        // this frame is still on the stack and will cover them.
        if self.scheduled_updates.get() != 0 && !self.updating.get() {
            self.perform_update(server);
        }
    }

    /// The pointer handler that tracks focus: the topmost visible view whose
    /// geometry and input region contain the pointer becomes the pointer
    /// focus. Held buttons lock focus in place.
    pub(crate) fn pointer_focus_handler(self: &Rc<Self>) -> Rc<dyn PointerHandler> {
        Rc::new(FocusTrackingHandler {
            compositor: Rc::downgrade(self),
        })
    }
}

struct FocusTrackingHandler {
    compositor: Weak<Compositor>,
}

impl PointerHandler for FocusTrackingHandler {
    fn motion(&self, server: &Rc<Server>, _time: u32, position: FPoint) -> bool {
        let Some(compositor) = self.compositor.upgrade() else {
            return false;
        };
        let pointer = &server.seat.pointer;
        if pointer.buttons_pressed() {
            return false;
        }

        let point = Point::from(position);
        let mut found = None;
        for view in compositor.views() {
            if !view.visible() {
                continue;
            }
            let geometry = view.view().geometry();
            if geometry.contains(point)
                && view
                    .surface()
                    .state()
                    .input
                    .contains_point(Point::new(point.x - geometry.x, point.y - geometry.y))
            {
                found = Some(view);
                break;
            }
        }

        pointer.set_focus(server, found.as_ref());
        false
    }
}
