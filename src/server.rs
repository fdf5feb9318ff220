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

//! The server: one owned instance wiring the launcher, the KMS device, the
//! screens, the compositing engine, and the seat together, and running the
//! single-threaded event loop everything dispatches on. There is exactly one
//! per process, passed by reference; nothing here is a hidden global.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;
use std::time::Duration;

use calloop::EventLoop;
use calloop::Interest;
use calloop::LoopSignal;
use calloop::Mode;
use calloop::PostAction;
use calloop::RegistrationToken;
use calloop::generic::Generic;

use crate::bindings::BindingConfig;
use crate::bindings::Bindings;
use crate::compositor::ALL_SCREENS;
use crate::compositor::Compositor;
use crate::drm::DrmDevice;
use crate::drm::ScanoutContext;
use crate::event::Signal;
use crate::input::Seat;
use crate::input::evdev::EvdevDevice;
use crate::input::keyboard::XkbConfig;
use crate::launch::LaunchClient;
use crate::launch::SessionEvent;
use crate::prelude::*;
use crate::protocol::Serial;
use crate::protocol::SurfaceId;
use crate::region::Region;
use crate::render::CpuRenderContext;
use crate::render::CpuRenderer;
use crate::render::RenderContext;
use crate::render::Renderer;
use crate::screen::Screen;
use crate::window::Window;

/// The external window-management policy. Shell adapters create windows;
/// every one of them is handed here exactly once.
pub trait Manager {
    fn new_window(&self, server: &Rc<Server>, window: &Rc<Window>);
    fn new_screen(&self, server: &Rc<Server>, screen: &Rc<Screen>);
    fn activate(&self, _server: &Rc<Server>) {}
    fn deactivate(&self, _server: &Rc<Server>) {}
}

/// State threaded through the calloop sources.
pub struct EventLoopState {
    pub server: Rc<Server>,
}

pub type LoopHandle = calloop::LoopHandle<'static, EventLoopState>;

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub seat_name: String,
    pub xkb: XkbConfig,
    pub bindings: Vec<BindingConfig>,
}

pub struct Server {
    pub launch: LaunchClient,
    pub drm: Rc<DrmDevice>,
    pub compositor: Rc<Compositor>,
    pub seat: Rc<Seat>,
    pub bindings: Rc<Bindings>,
    manager: Rc<dyn Manager>,

    screens: RefCell<Vec<Rc<Screen>>>,
    active: Cell<bool>,

    cpu_context: Rc<dyn RenderContext>,
    scanout_context: Rc<dyn RenderContext>,
    renderer: Rc<CpuRenderer>,

    serial: Cell<u32>,
    next_surface_id: Cell<u64>,

    /// Emitted after the session switches state; external layers (shells,
    /// the WM) subscribe here.
    pub session_signal: Signal<SessionEvent>,

    loop_handle: RefCell<Option<LoopHandle>>,
    loop_signal: RefCell<Option<LoopSignal>>,
    device_tokens: RefCell<Vec<(Weak<EvdevDevice>, RegistrationToken)>>,
}

impl Server {
    /// Brings the whole stack up: launcher socket, DRM device, screens,
    /// compositor targets, input devices, handler stacks. Failure unwinds in
    /// reverse order through drops.
    pub fn new(options: &ServerOptions, manager: Rc<dyn Manager>) -> Result<Rc<Self>> {
        let launch = LaunchClient::connect().context(loc!(), "could not reach welkin-launch")?;
        let drm = DrmDevice::open(&launch).context(loc!(), "could not initialize DRM")?;
        let scanout_context: Rc<dyn RenderContext> = ScanoutContext::new(&drm);
        let cpu_context: Rc<dyn RenderContext> = Rc::new(CpuRenderContext);
        let renderer = Rc::new(CpuRenderer::new());

        let seat = Seat::new(&options.seat_name, &options.xkb)
            .context(loc!(), "could not initialize the seat")?;

        let server = Rc::new(Self {
            launch,
            drm: drm.clone(),
            compositor: Compositor::new(),
            seat,
            bindings: Bindings::new(),
            manager,
            screens: RefCell::new(Vec::new()),
            active: Cell::new(false),
            cpu_context,
            scanout_context,
            renderer,
            serial: Cell::new(0),
            next_surface_id: Cell::new(1),
            session_signal: Signal::new(),
            loop_handle: RefCell::new(None),
            loop_signal: RefCell::new(None),
            device_tokens: RefCell::new(Vec::new()),
        });

        let screens = drm.create_screens(&server)?;
        if screens.is_empty() {
            bail!("no usable screens");
        }
        *server.screens.borrow_mut() = screens;
        for screen in server.screens() {
            server.manager.new_screen(&server, &screen);
        }

        server.compositor.initialize(&server)?;
        server.bindings.load_config(&options.bindings)?;

        server.seat.pointer.initialize(&server)?;
        server.seat.add_devices(&server);

        server.setup_input_stacks();
        server.update_pointer_region();

        Ok(server)
    }

    fn setup_input_stacks(self: &Rc<Self>) {
        // Front-to-back after these pushes: focus tracking, bindings, then
        // the client forwarders installed at creation.
        self.seat
            .keyboard
            .push_handler(self.bindings.keyboard_handler());
        self.seat
            .pointer
            .push_handler(self.bindings.pointer_handler());
        self.seat
            .pointer
            .push_handler(self.compositor.pointer_focus_handler());

        // Keyboard focus changes re-advertise the selection to the newly
        // focused client.
        {
            let weak = Rc::downgrade(self);
            self.seat.keyboard.focus_changed.subscribe(move |change| {
                let Some(server) = weak.upgrade() else {
                    return;
                };
                if let Some(new) = &change.new {
                    server
                        .seat
                        .data_device
                        .offer_selection(new.surface().client());
                }
            });
        }
        // So do selection changes, to whoever is focused right now.
        {
            let weak = Rc::downgrade(self);
            self.seat.data_device.selection_changed.subscribe(move |()| {
                let Some(server) = weak.upgrade() else {
                    return;
                };
                if let Some(client) = server.seat.keyboard.focused_client() {
                    server.seat.data_device.offer_selection(client);
                }
            });
        }
        // Pointer focus entering a window tells the window manager.
        self.seat.pointer.focus_changed.subscribe(|change| {
            if let Some(new) = &change.new
                && let Some(window) = new.window()
                && let Some(handler) = window.handler()
            {
                handler.entered(&window);
            }
        });
    }

    fn update_pointer_region(self: &Rc<Self>) {
        let mut region = Region::new();
        for screen in self.screens() {
            region.add_rect(screen.geometry());
        }
        self.seat.pointer.set_region(self, &region);
    }

    pub fn screens(&self) -> Vec<Rc<Screen>> {
        self.screens.borrow().clone()
    }

    pub fn active(&self) -> bool {
        self.active.get()
    }

    pub fn manager(&self) -> Rc<dyn Manager> {
        self.manager.clone()
    }

    pub fn next_serial(&self) -> Serial {
        let serial = self.serial.get().wrapping_add(1);
        self.serial.set(serial);
        Serial(serial)
    }

    pub fn alloc_surface_id(&self) -> SurfaceId {
        let id = self.next_surface_id.get();
        self.next_surface_id.set(id + 1);
        SurfaceId(id)
    }

    pub fn renderer(&self) -> Rc<dyn Renderer> {
        self.renderer.clone()
    }

    pub(crate) fn cpu_renderer(&self) -> Rc<dyn Renderer> {
        self.renderer.clone()
    }

    pub(crate) fn cpu_context(&self) -> Rc<dyn RenderContext> {
        self.cpu_context.clone()
    }

    pub(crate) fn scanout_context(&self) -> Rc<dyn RenderContext> {
        self.scanout_context.clone()
    }

    /// Queues the repaint idle task. Repainting is never run inline so
    /// request handlers can schedule updates freely without recursing into
    /// rendering; before the loop exists there is nothing to repaint for.
    pub(crate) fn queue_repaint(self: &Rc<Self>) {
        let handle = self.loop_handle.borrow().clone();
        match handle {
            Some(handle) => {
                handle.insert_idle(|state| {
                    let server = state.server.clone();
                    server.compositor.perform_update(&server);
                });
            },
            None => debug!("repaint requested before the event loop started"),
        }
    }

    /// Runs `f` from the next idle.
    pub(crate) fn insert_idle(self: &Rc<Self>, f: impl FnOnce(&Rc<Server>) + 'static) {
        let handle = self.loop_handle.borrow().clone();
        match handle {
            Some(handle) => {
                handle.insert_idle(move |state| {
                    let server = state.server.clone();
                    f(&server);
                });
            },
            None => debug!("idle task dropped before the event loop started"),
        }
    }

    /// Adds (or re-adds, after a reopen) an input device to the loop.
    pub(crate) fn register_device(self: &Rc<Self>, device: &Rc<EvdevDevice>) {
        let handle = self.loop_handle.borrow().clone();
        let Some(handle) = handle else {
            return;
        };

        // Drop the stale registration if the device was reopened.
        self.device_tokens.borrow_mut().retain(|(weak, token)| {
            match weak.upgrade() {
                Some(existing) if Rc::ptr_eq(&existing, device) => {
                    handle.remove(*token);
                    false
                },
                Some(_) => true,
                None => false,
            }
        });

        let source = Generic::new(device.clone(), Interest::READ, Mode::Level);
        let weak = Rc::downgrade(device);
        let result = handle.insert_source(source, move |_, _, state| {
            let server = state.server.clone();
            let Some(device) = weak.upgrade() else {
                return Ok(PostAction::Remove);
            };
            if device.dispatch(&server) {
                Ok(PostAction::Continue)
            } else {
                server.seat.remove_device(&device);
                Ok(PostAction::Remove)
            }
        });
        match result {
            Ok(token) => {
                self.device_tokens
                    .borrow_mut()
                    .push((Rc::downgrade(device), token));
            },
            Err(e) => warn!("could not watch input device: {e}"),
        }
    }

    /// VT acquired: master is back, devices reopen, every screen gets a
    /// fresh mode-set with its next frame.
    pub fn activate(self: &Rc<Self>) {
        if self.active.get() {
            return;
        }
        info!("session activated");
        self.active.set(true);

        for screen in self.screens() {
            screen.primary.handle_session_activate();
            if let Some(cursor) = &screen.cursor {
                cursor.handle_session_activate(self);
            }
        }
        self.seat.reopen_devices(self);
        self.compositor.schedule_updates(self, ALL_SCREENS);

        self.session_signal.emit(&SessionEvent::Activate);
        self.manager.activate(self);
    }

    /// VT being released: input freezes (pressed keys release), repaints
    /// stop. Page flips already in flight fail with EACCES and are given
    /// up.
    pub fn deactivate(self: &Rc<Self>) {
        if !self.active.get() {
            return;
        }
        info!("session deactivated");
        self.active.set(false);

        self.compositor.clear_scheduled();
        self.seat.keyboard.reset(self);

        self.session_signal.emit(&SessionEvent::Deactivate);
        self.manager.deactivate(self);
    }

    fn handle_launch_events(self: &Rc<Self>) {
        match self.launch.drain_events() {
            Ok(events) => {
                for event in events {
                    match event {
                        SessionEvent::Activate => self.activate(),
                        SessionEvent::Deactivate => self.deactivate(),
                    }
                }
            },
            Err(e) => {
                // Desync with the launcher is unrecoverable.
                error!("launcher protocol failure: {e:?}");
                self.terminate();
            },
        }
    }

    /// Stops the event loop after the current dispatch; `run` then returns
    /// cleanly.
    pub fn terminate(&self) {
        if let Some(signal) = &*self.loop_signal.borrow() {
            signal.stop();
            signal.wakeup();
        }
    }

    /// The main loop: launcher socket, DRM events, and every input device,
    /// dispatched until terminated.
    pub fn run(self: &Rc<Self>) -> Result<()> {
        let mut event_loop: EventLoop<'static, EventLoopState> =
            EventLoop::try_new().location(loc!())?;
        *self.loop_handle.borrow_mut() = Some(event_loop.handle());
        *self.loop_signal.borrow_mut() = Some(event_loop.get_signal());

        let launch_fd = self
            .launch
            .socket_fd()
            .try_clone_to_owned()
            .location(loc!())?;
        event_loop
            .handle()
            .insert_source(
                Generic::new(launch_fd, Interest::READ, Mode::Level),
                |_, _, state| {
                    let server = state.server.clone();
                    server.handle_launch_events();
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|e| anyhow!("could not watch launcher socket: {e}"))?;

        let drm_fd = self.drm.fd().try_clone_to_owned().location(loc!())?;
        event_loop
            .handle()
            .insert_source(
                Generic::new(drm_fd, Interest::READ, Mode::Level),
                |_, _, state| {
                    let server = state.server.clone();
                    server.drm.dispatch(&server).warn_and_ignore(loc!());
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|e| anyhow!("could not watch DRM fd: {e}"))?;

        for device in self.seat.devices() {
            self.register_device(&device);
        }

        // Catch up on session events that raced our startup requests.
        self.handle_launch_events();

        let mut state = EventLoopState {
            server: self.clone(),
        };
        event_loop
            .run(Duration::from_millis(100), &mut state, |_| {})
            .location(loc!())?;

        *self.loop_handle.borrow_mut() = None;
        *self.loop_signal.borrow_mut() = None;
        Ok(())
    }
}
