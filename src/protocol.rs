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

//! The seam between the engine and the wire-protocol dispatcher. The
//! dispatcher owns sockets, object ids and request decoding; the engine calls
//! back through the resource traits below to deliver events to clients. Each
//! trait corresponds to one protocol object class; implementations are
//! expected to be cheap handles that enqueue messages.
//!
//! The engine never assumes anything about a client beyond its `ClientId`:
//! resources compare clients by id, and focus bookkeeping partitions
//! resources by it.

use std::fmt;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use bitflags::bitflags;

use crate::geometry::FPoint;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ClientId(pub u32);

/// Event serial, shared across all interfaces of the display.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Serial(pub u32);

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KeyState {
    Released,
    Pressed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ButtonState {
    Released,
    Pressed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Axis {
    Vertical,
    Horizontal,
}

bitflags! {
    /// Compact modifier summary derived from the XKB state, used for binding
    /// lookup.
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Modifiers: u32 {
        const CTRL = 1 << 0;
        const ALT = 1 << 1;
        const LOGO = 1 << 2;
        const SHIFT = 1 << 3;
    }
}

/// The full serialized XKB modifier state, forwarded to clients verbatim.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ModifierState {
    pub depressed: u32,
    pub latched: u32,
    pub locked: u32,
    pub group: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SurfaceId(pub u64);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ScreenId(pub u8);

/// Anything owned by a client that focus bookkeeping partitions by owner.
pub trait InputResource {
    fn client(&self) -> ClientId;
}

/// A client's wl_keyboard.
pub trait KeyboardResource: InputResource {
    fn keymap(&self, fd: BorrowedFd<'_>, size: usize);
    fn repeat_info(&self, rate: i32, delay: i32);
    fn enter(&self, serial: Serial, surface: SurfaceId, keys: &[u32]);
    fn leave(&self, serial: Serial, surface: SurfaceId);
    fn key(&self, serial: Serial, time: u32, key: u32, state: KeyState);
    fn modifiers(&self, serial: Serial, state: ModifierState);
}

/// A client's wl_pointer. Coordinates are surface-local.
pub trait PointerResource: InputResource {
    fn enter(&self, serial: Serial, surface: SurfaceId, position: FPoint);
    fn leave(&self, serial: Serial, surface: SurfaceId);
    fn motion(&self, time: u32, position: FPoint);
    fn button(&self, serial: Serial, time: u32, button: u32, state: ButtonState);
    fn axis(&self, time: u32, axis: Axis, amount: f64);
}

/// A client's wl_surface, as far as the engine needs to talk back to it.
pub trait SurfaceResource {
    fn client(&self) -> ClientId;
    fn enter_output(&self, screen: ScreenId);
    fn leave_output(&self, screen: ScreenId);
}

/// A queued wl_callback from wl_surface.frame. Fired at most once.
pub trait FrameCallback {
    fn done(&self, time: u32);
}

/// The client half of a buffer: told when the compositor is finished reading
/// from it.
pub trait BufferHandle {
    fn release(&self);
}

/// A client's wl_data_device.
pub trait DataDeviceResource: InputResource {
    /// Creates a fresh data_offer protocol object on this device and
    /// returns its event-sending half. The engine follows up with `offer()`
    /// per mime type and a `selection()` naming the finished offer.
    fn new_offer(&self) -> Rc<dyn DataOfferResource>;
    /// Announces the selection. The adapter keeps the offer and routes the
    /// client's accept/receive requests back through it.
    fn selection(&self, offer: Option<&Rc<crate::data_device::DataOffer>>);
}

/// A data_offer advertised to some client.
pub trait DataOfferResource {
    fn offer(&self, mime_type: &str);
}

/// The client half of a data source: receives transfer requests and
/// lifecycle events for its selection.
pub trait DataSourceHandle {
    fn target(&self, mime_type: Option<&str>);
    fn send(&self, mime_type: &str, fd: OwnedFd);
    fn cancelled(&self);
}
