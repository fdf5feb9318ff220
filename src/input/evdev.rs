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

//! One evdev device. Decodes the event stream into keyboard keys, pointer
//! buttons, accumulated motion, and wheel axis steps, and feeds them to the
//! seat. Relative motion within one sync frame coalesces into a single
//! event, flushed before any non-motion event.

use std::cell::Cell;
use std::cell::RefCell;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use evdev::Device;
use evdev::InputEventKind;
use evdev::Key;
use evdev::RelativeAxisType;
use nix::fcntl::OFlag;

use crate::input::SeatCapabilities;
use crate::prelude::*;
use crate::protocol::Axis;
use crate::protocol::ButtonState;
use crate::protocol::KeyState;
use crate::server::Server;
use crate::utils;

/// Units per wheel notch, matching the wl_pointer convention.
const AXIS_STEP: f64 = 10.0;

fn is_button_code(code: u16) -> bool {
    (Key::BTN_MISC.code()..=Key::BTN_GEAR_UP.code()).contains(&code)
        || code >= Key::BTN_TRIGGER_HAPPY.code()
}

#[derive(Debug, Default, Copy, Clone)]
struct PendingMotion {
    dx: i32,
    dy: i32,
    pending: bool,
    abs_x: i32,
    abs_y: i32,
    abs_pending: bool,
}

pub struct EvdevDevice {
    device: RefCell<Device>,
    path: PathBuf,
    capabilities: SeatCapabilities,
    motion: Cell<PendingMotion>,
}

impl EvdevDevice {
    /// Opens the node via the launcher and probes its capabilities.
    pub(crate) fn open(server: &Rc<Server>, path: &Path) -> Result<Rc<Self>> {
        let fd = server.launch.open_device(
            path,
            OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
        )?;
        let device = Device::from_fd(std::fs::File::from(fd)).location(loc!())?;

        let mut capabilities = SeatCapabilities::empty();
        if device
            .supported_keys()
            .is_some_and(|keys| keys.contains(Key::KEY_ENTER))
        {
            capabilities |= SeatCapabilities::KEYBOARD;
        }
        if device
            .supported_relative_axes()
            .is_some_and(|axes| {
                axes.contains(RelativeAxisType::REL_X) && axes.contains(RelativeAxisType::REL_Y)
            })
            && device
                .supported_keys()
                .is_some_and(|keys| keys.contains(Key::BTN_LEFT))
        {
            capabilities |= SeatCapabilities::POINTER;
        }

        debug!(
            "adding input device {:?} ({}), capabilities {capabilities:?}",
            path,
            device.name().unwrap_or("unnamed"),
        );

        Ok(Rc::new(Self {
            device: RefCell::new(device),
            path: path.to_path_buf(),
            capabilities,
            motion: Cell::new(PendingMotion::default()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capabilities(&self) -> SeatCapabilities {
        self.capabilities
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        // The Device owns the fd for its own lifetime; the borrow we hand
        // out is tied to &self.
        let raw = self.device.borrow().as_raw_fd();
        // SAFETY: raw stays open while self is alive and borrowed.
        unsafe { BorrowedFd::borrow_raw(raw) }
    }

    /// The session came back: the old fd was revoked, get a fresh one.
    pub(crate) fn reopen(&self, server: &Rc<Server>) -> Result<()> {
        let fd = server.launch.open_device(
            &self.path,
            OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
        )?;
        let device = Device::from_fd(std::fs::File::from(fd)).location(loc!())?;
        *self.device.borrow_mut() = device;
        self.motion.set(PendingMotion::default());
        Ok(())
    }

    fn flush_motion(&self, server: &Rc<Server>, time: u32) {
        let mut motion = self.motion.get();
        if motion.pending {
            server.seat.pointer.handle_relative_motion(
                server,
                time,
                motion.dx as f64,
                motion.dy as f64,
            );
            motion.dx = 0;
            motion.dy = 0;
            motion.pending = false;
        }
        if motion.abs_pending {
            server.seat.pointer.handle_absolute_motion(
                server,
                time,
                motion.abs_x as f64,
                motion.abs_y as f64,
            );
            motion.abs_pending = false;
        }
        self.motion.set(motion);
    }

    fn handle_event(&self, server: &Rc<Server>, event: &evdev::InputEvent) {
        let time = utils::time_ms();

        let is_motion = matches!(
            event.kind(),
            InputEventKind::RelAxis(RelativeAxisType::REL_X)
                | InputEventKind::RelAxis(RelativeAxisType::REL_Y)
                | InputEventKind::AbsAxis(evdev::AbsoluteAxisType::ABS_X)
                | InputEventKind::AbsAxis(evdev::AbsoluteAxisType::ABS_Y)
        );
        if !is_motion {
            self.flush_motion(server, time);
        }

        match event.kind() {
            InputEventKind::Key(key) => {
                if is_button_code(key.code()) {
                    let state = if event.value() != 0 {
                        ButtonState::Pressed
                    } else {
                        ButtonState::Released
                    };
                    server
                        .seat
                        .pointer
                        .handle_button(server, time, key.code() as u32, state);
                } else {
                    let state = if event.value() != 0 {
                        KeyState::Pressed
                    } else {
                        KeyState::Released
                    };
                    server
                        .seat
                        .keyboard
                        .handle_key(server, time, key.code() as u32, state);
                }
            },
            InputEventKind::RelAxis(axis) => match axis {
                RelativeAxisType::REL_X => {
                    let mut motion = self.motion.get();
                    motion.dx += event.value();
                    motion.pending = true;
                    self.motion.set(motion);
                },
                RelativeAxisType::REL_Y => {
                    let mut motion = self.motion.get();
                    motion.dy += event.value();
                    motion.pending = true;
                    self.motion.set(motion);
                },
                RelativeAxisType::REL_WHEEL => {
                    server.seat.pointer.handle_axis(
                        server,
                        time,
                        Axis::Vertical,
                        -AXIS_STEP * event.value() as f64,
                    );
                },
                RelativeAxisType::REL_HWHEEL => {
                    server.seat.pointer.handle_axis(
                        server,
                        time,
                        Axis::Horizontal,
                        AXIS_STEP * event.value() as f64,
                    );
                },
                _ => {},
            },
            InputEventKind::AbsAxis(axis) => match axis {
                evdev::AbsoluteAxisType::ABS_X => {
                    let mut motion = self.motion.get();
                    motion.abs_x = event.value();
                    motion.abs_pending = true;
                    self.motion.set(motion);
                },
                evdev::AbsoluteAxisType::ABS_Y => {
                    let mut motion = self.motion.get();
                    motion.abs_y = event.value();
                    motion.abs_pending = true;
                    self.motion.set(motion);
                },
                _ => {},
            },
            _ => {},
        }
    }

    /// Drains pending events. Returns false when the device is gone and its
    /// event source should be removed; revocation mid-session is survived
    /// silently.
    pub(crate) fn dispatch(&self, server: &Rc<Server>) -> bool {
        loop {
            let events: Vec<evdev::InputEvent> = {
                let mut device = self.device.borrow_mut();
                match device.fetch_events() {
                    Ok(events) => events.collect(),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        if e.raw_os_error() == Some(libc::ENODEV) {
                            debug!("input device {:?} disappeared", self.path);
                        } else {
                            warn!("error reading {:?}: {e}", self.path);
                        }
                        self.flush_motion(server, utils::time_ms());
                        return false;
                    },
                }
            };
            if events.is_empty() {
                break;
            }
            for event in &events {
                self.handle_event(server, event);
            }
        }

        self.flush_motion(server, utils::time_ms());
        true
    }
}

impl AsFd for EvdevDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_button_range_classification() {
        // KEY_A and friends are keyboard keys.
        assert!(!is_button_code(Key::KEY_A.code()));
        assert!(!is_button_code(Key::KEY_ENTER.code()));
        // Mouse buttons and joystick triggers route to the pointer.
        assert!(is_button_code(Key::BTN_LEFT.code()));
        assert!(is_button_code(Key::BTN_RIGHT.code()));
        assert!(is_button_code(Key::BTN_MISC.code()));
        assert!(is_button_code(Key::BTN_GEAR_UP.code()));
        assert!(is_button_code(Key::BTN_TRIGGER_HAPPY1.code()));
        // The gap between BTN_GEAR_UP and BTN_TRIGGER_HAPPY holds ordinary
        // keys (e.g. KEY_OK at 0x160).
        assert!(!is_button_code(0x160));
    }

    #[test]
    fn test_wheel_axis_step() {
        assert_eq!(-AXIS_STEP * 1.0, -10.0);
        assert_eq!(AXIS_STEP * -2.0, -20.0);
    }
}
