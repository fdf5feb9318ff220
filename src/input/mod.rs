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

//! Input. One seat aggregates every evdev device on the system; decoded
//! events fan into the keyboard and pointer, each of which routes through
//! its handler stack.

use std::cell::Cell;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use bitflags::bitflags;

use crate::data_device::DataDevice;
use crate::event::Signal;
use crate::input::evdev::EvdevDevice;
use crate::input::keyboard::Keyboard;
use crate::input::keyboard::XkbConfig;
use crate::input::pointer::Pointer;
use crate::prelude::*;
use crate::protocol::Serial;
use crate::server::Server;

pub mod evdev;
pub mod focus;
pub mod keyboard;
pub mod pointer;

/// One pressed key or button: the value, the serial of its press event, and
/// the handler that accepted it. The matching release is routed to that
/// handler and nothing else.
#[derive(Clone)]
pub struct Press<H> {
    pub value: u32,
    pub serial: Serial,
    pub handler: Option<H>,
}

/// The set of currently-pressed keys or buttons. Kept as a small contiguous
/// array: bounded by the number of physical keys and scanned linearly.
pub struct PressSet<H> {
    presses: Vec<Press<H>>,
}

impl<H: Clone> PressSet<H> {
    pub fn new() -> Self {
        Self {
            presses: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.presses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.presses.len()
    }

    pub fn values(&self) -> impl Iterator<Item = u32> + '_ {
        self.presses.iter().map(|p| p.value)
    }

    pub fn contains(&self, value: u32) -> bool {
        self.presses.iter().any(|p| p.value == value)
    }

    /// Records a press. Returns false when the value is already down (a
    /// repeat, which callers ignore).
    pub fn begin(&mut self, value: u32, serial: Serial) -> bool {
        if self.contains(value) {
            return false;
        }
        self.presses.push(Press {
            value,
            serial,
            handler: None,
        });
        true
    }

    /// Records the handler that accepted the most recent press of `value`.
    pub fn set_handler(&mut self, value: u32, handler: Option<H>) {
        if let Some(press) = self.presses.iter_mut().find(|p| p.value == value) {
            press.handler = handler;
        }
    }

    /// Removes the press entry for `value`, restamping it with the release
    /// serial. None for an unpaired release.
    pub fn end(&mut self, value: u32, serial: Serial) -> Option<Press<H>> {
        let i = self.presses.iter().position(|p| p.value == value)?;
        let mut press = self.presses.remove(i);
        press.serial = serial;
        Some(press)
    }

    pub fn find_serial(&self, serial: Serial) -> Option<&Press<H>> {
        self.presses.iter().find(|p| p.serial == serial)
    }

    /// Swaps the handler of the press with the given serial, returning the
    /// previous one. Interactive move/resize uses this to capture a press.
    pub fn swap_handler(&mut self, serial: Serial, handler: Option<H>) -> Option<Option<H>> {
        let press = self.presses.iter_mut().find(|p| p.serial == serial)?;
        Some(std::mem::replace(&mut press.handler, handler))
    }

    pub fn drain(&mut self) -> Vec<Press<H>> {
        std::mem::take(&mut self.presses)
    }
}

impl<H: Clone> Default for PressSet<H> {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct SeatCapabilities: u32 {
        const KEYBOARD = 1 << 0;
        const POINTER = 1 << 1;
    }
}

pub struct Seat {
    pub name: String,
    pub keyboard: Rc<Keyboard>,
    pub pointer: Rc<Pointer>,
    pub data_device: Rc<DataDevice>,
    devices: RefCell<Vec<Rc<EvdevDevice>>>,
    capabilities: Cell<SeatCapabilities>,
    /// Emitted when the aggregate capability set changes.
    pub capabilities_signal: Signal<SeatCapabilities>,
}

impl Seat {
    pub(crate) fn new(name: &str, xkb: &XkbConfig) -> Result<Rc<Self>> {
        Ok(Rc::new(Self {
            name: name.to_string(),
            keyboard: Keyboard::new(xkb)?,
            pointer: Pointer::new(),
            data_device: DataDevice::new(),
            devices: RefCell::new(Vec::new()),
            capabilities: Cell::new(SeatCapabilities::empty()),
            capabilities_signal: Signal::new(),
        }))
    }

    pub fn capabilities(&self) -> SeatCapabilities {
        self.capabilities.get()
    }

    pub fn devices(&self) -> Vec<Rc<EvdevDevice>> {
        self.devices.borrow().clone()
    }

    /// Opens every evdev node via the launcher. Nodes we cannot open are
    /// skipped; hotplug is handled by rescanning on session activation.
    pub(crate) fn add_devices(self: &Rc<Self>, server: &Rc<Server>) {
        let mut paths = Vec::new();
        match std::fs::read_dir("/dev/input") {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    if name.to_string_lossy().starts_with("event") {
                        paths.push(entry.path());
                    }
                }
            },
            Err(e) => {
                warn!("could not enumerate /dev/input: {e}");
                return;
            },
        }
        paths.sort();

        for path in paths {
            if self.devices.borrow().iter().any(|d| d.path() == path) {
                continue;
            }
            self.add_device(server, &path);
        }
    }

    pub(crate) fn add_device(self: &Rc<Self>, server: &Rc<Server>, path: &Path) {
        match EvdevDevice::open(server, path) {
            Ok(device) => {
                self.devices.borrow_mut().push(device.clone());
                server.register_device(&device);
                self.update_capabilities();
            },
            Err(e) => {
                debug!("skipping input device {path:?}: {e:#}");
            },
        }
    }

    pub(crate) fn remove_device(&self, device: &Rc<EvdevDevice>) {
        self.devices
            .borrow_mut()
            .retain(|d| !Rc::ptr_eq(d, device));
        self.update_capabilities();
    }

    fn update_capabilities(&self) {
        let mut caps = SeatCapabilities::empty();
        for device in self.devices.borrow().iter() {
            caps |= device.capabilities();
        }
        if caps != self.capabilities.get() {
            self.capabilities.set(caps);
            self.capabilities_signal.emit(&caps);
        }
    }

    /// Session reactivated: the old fds were revoked, so reopen everything
    /// and pick up devices that appeared while we were away.
    pub(crate) fn reopen_devices(self: &Rc<Self>, server: &Rc<Server>) {
        let devices = self.devices();
        for device in devices {
            if let Err(e) = device.reopen(server) {
                warn!("dropping input device {:?}: {e:#}", device.path());
                self.remove_device(&device);
            } else {
                server.register_device(&device);
            }
        }
        self.add_devices(server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(n: u32) -> Serial {
        Serial(n)
    }

    #[test]
    fn test_press_release_pairing() {
        let mut set: PressSet<u32> = PressSet::new();
        assert!(set.begin(30, serial(1)));
        set.set_handler(30, Some(7));
        // Repeat is rejected.
        assert!(!set.begin(30, serial(2)));

        let press = set.end(30, serial(3)).unwrap();
        assert_eq!(press.handler, Some(7));
        assert_eq!(press.serial, serial(3));
        assert!(set.is_empty());
    }

    #[test]
    fn test_unpaired_release_is_ignored() {
        let mut set: PressSet<u32> = PressSet::new();
        assert!(set.end(30, serial(1)).is_none());
    }

    #[test]
    fn test_swap_handler_by_serial() {
        let mut set: PressSet<u32> = PressSet::new();
        set.begin(0x110, serial(5));
        set.set_handler(0x110, Some(1));
        let old = set.swap_handler(serial(5), Some(2)).unwrap();
        assert_eq!(old, Some(1));
        let press = set.end(0x110, serial(6)).unwrap();
        assert_eq!(press.handler, Some(2));
        assert!(set.swap_handler(serial(5), None).is_none());
    }
}
