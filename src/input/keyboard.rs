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

//! Keyboard state: the XKB keymap and modifier tracking, the pressed-key
//! array with per-press winning handlers, and keyboard focus. The handler
//! stack is walked front to back on each press; the first taker owns the
//! matching release. The always-last client handler forwards to the focused
//! client and mirrors its keys in `client_keys`.

use std::cell::Cell;
use std::cell::RefCell;
use std::fs::File;
use std::os::fd::AsFd;
use std::rc::Rc;

use memmap2::MmapMut;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use xkbcommon::xkb;

use crate::compositor::CompositorView;
use crate::event::Signal;
use crate::event::SubscriptionId;
use crate::input::Press;
use crate::input::PressSet;
use crate::input::focus::FocusChange;
use crate::input::focus::InputFocus;
use crate::prelude::*;
use crate::protocol::KeyState;
use crate::protocol::KeyboardResource;
use crate::protocol::ModifierState;
use crate::protocol::Modifiers;
use crate::server::Server;
use crate::utils;

const REPEAT_RATE: i32 = 40;
const REPEAT_DELAY: i32 = 500;

/// Evdev keycode to XKB keycode offset.
const KEYCODE_OFFSET: u32 = 8;

/// Mask bit for a modifier index; keymaps without the modifier contribute
/// nothing.
fn mod_bit(index: xkb::ModIndex) -> u32 {
    if index == xkb::MOD_INVALID {
        0
    } else {
        1 << index
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct XkbConfig {
    pub rules: String,
    pub model: String,
    pub layout: String,
    pub variant: String,
    pub options: Option<String>,
}

impl Default for XkbConfig {
    fn default() -> Self {
        Self {
            rules: String::new(),
            model: String::new(),
            layout: String::new(),
            variant: String::new(),
            options: None,
        }
    }
}

struct ModIndices {
    ctrl: xkb::ModIndex,
    alt: xkb::ModIndex,
    logo: xkb::ModIndex,
    shift: xkb::ModIndex,
}

struct Xkb {
    _context: xkb::Context,
    keymap: xkb::Keymap,
    state: xkb::State,
    indices: ModIndices,
    /// The keymap text, sealed in a memfd for advertising to clients.
    keymap_file: File,
    keymap_size: usize,
}

impl Xkb {
    fn new(config: &XkbConfig) -> Result<Self> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_names(
            &context,
            &config.rules,
            &config.model,
            &config.layout,
            &config.variant,
            config.options.clone(),
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| anyhow!("could not compile XKB keymap"))?;
        let state = xkb::State::new(&keymap);

        let indices = ModIndices {
            ctrl: keymap.mod_get_index(xkb::MOD_NAME_CTRL),
            alt: keymap.mod_get_index(xkb::MOD_NAME_ALT),
            logo: keymap.mod_get_index(xkb::MOD_NAME_LOGO),
            shift: keymap.mod_get_index(xkb::MOD_NAME_SHIFT),
        };

        let (keymap_file, keymap_size) = materialize_keymap(&keymap)?;

        Ok(Self {
            _context: context,
            keymap,
            state,
            indices,
            keymap_file,
            keymap_size,
        })
    }
}

/// Writes the keymap text into an anonymous file clients can map read-only.
fn materialize_keymap(keymap: &xkb::Keymap) -> Result<(File, usize)> {
    let text = keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1);
    let size = text.len() + 1;

    let fd = nix::sys::memfd::memfd_create(
        c"welkin-xkb-keymap",
        nix::sys::memfd::MemFdCreateFlag::MFD_CLOEXEC,
    )
    .location(loc!())?;
    let file = File::from(fd);
    file.set_len(size as u64).location(loc!())?;

    // SAFETY: we are the only writer; clients map read-only.
    let mut map = unsafe { MmapMut::map_mut(&file) }.location(loc!())?;
    map[..text.len()].copy_from_slice(text.as_bytes());
    map[text.len()] = 0;

    Ok((file, size))
}

pub type KeyboardHandlerRef = Rc<dyn KeyboardHandler>;

/// A stage in the keyboard handler stack.
pub trait KeyboardHandler {
    /// Returns true to accept the press (and its future release).
    fn key(
        &self,
        _server: &Rc<Server>,
        _keyboard: &Keyboard,
        _time: u32,
        _press: &Press<KeyboardHandlerRef>,
        _state: KeyState,
    ) -> bool {
        false
    }

    /// Modifier state changed. Delivered to every handler.
    fn modifiers(&self, _server: &Rc<Server>, _keyboard: &Keyboard, _state: &ModifierState) {}
}

/// The always-last handler: forwards keys and modifiers to the focused
/// client's keyboard resources.
struct ClientKeyboardHandler;

impl KeyboardHandler for ClientKeyboardHandler {
    fn key(
        &self,
        _server: &Rc<Server>,
        keyboard: &Keyboard,
        time: u32,
        press: &Press<KeyboardHandlerRef>,
        state: KeyState,
    ) -> bool {
        {
            let mut client_keys = keyboard.client_keys.borrow_mut();
            match state {
                KeyState::Pressed => client_keys.push(press.value),
                KeyState::Released => {
                    if let Some(i) = client_keys.iter().position(|&v| v == press.value) {
                        client_keys.remove(i);
                    }
                },
            }
        }
        for resource in keyboard.focus.borrow().active() {
            resource.key(press.serial, time, press.value, state);
        }
        true
    }

    fn modifiers(&self, server: &Rc<Server>, keyboard: &Keyboard, state: &ModifierState) {
        let focus = keyboard.focus.borrow();
        if focus.active().is_empty() {
            return;
        }
        let serial = server.next_serial();
        for resource in focus.active() {
            resource.modifiers(serial, *state);
        }
    }
}

pub struct Keyboard {
    xkb: RefCell<Xkb>,
    focus: RefCell<InputFocus<dyn KeyboardResource>>,
    pub focus_changed: Signal<FocusChange>,
    handlers: RefCell<Vec<KeyboardHandlerRef>>,
    keys: RefCell<PressSet<KeyboardHandlerRef>>,
    /// Mirror of `keys` restricted to presses the client handler accepted.
    client_keys: RefCell<Vec<u32>>,
    modifier_state: Cell<ModifierState>,
    modifiers: Cell<Modifiers>,
    view_destroy: RefCell<Option<(Rc<CompositorView>, SubscriptionId)>>,
}

impl Keyboard {
    pub(crate) fn new(config: &XkbConfig) -> Result<Rc<Self>> {
        let client_handler: KeyboardHandlerRef = Rc::new(ClientKeyboardHandler);
        Ok(Rc::new(Self {
            xkb: RefCell::new(Xkb::new(config)?),
            focus: RefCell::new(InputFocus::new()),
            focus_changed: Signal::new(),
            handlers: RefCell::new(vec![client_handler]),
            keys: RefCell::new(PressSet::new()),
            client_keys: RefCell::new(Vec::new()),
            modifier_state: Cell::new(ModifierState::default()),
            modifiers: Cell::new(Modifiers::empty()),
            view_destroy: RefCell::new(None),
        }))
    }

    /// Installs a handler in front of all existing ones.
    pub fn push_handler(&self, handler: KeyboardHandlerRef) {
        self.handlers.borrow_mut().insert(0, handler);
    }

    pub fn modifiers(&self) -> Modifiers {
        self.modifiers.get()
    }

    pub fn modifier_state(&self) -> ModifierState {
        self.modifier_state.get()
    }

    pub fn focused_view(&self) -> Option<Rc<CompositorView>> {
        self.focus.borrow().view()
    }

    pub fn focused_client(&self) -> Option<crate::protocol::ClientId> {
        self.focus.borrow().client()
    }

    pub fn client_keys(&self) -> Vec<u32> {
        self.client_keys.borrow().clone()
    }

    pub fn pressed_keys(&self) -> Vec<u32> {
        self.keys.borrow().values().collect()
    }

    /// The keysym an evdev keycode currently produces.
    pub fn keysym(&self, keycode: u32) -> u32 {
        self.xkb
            .borrow()
            .state
            .key_get_one_sym((keycode + KEYCODE_OFFSET).into())
            .raw()
    }

    /// Registers a client keyboard: advertises the keymap and repeat info,
    /// and delivers an immediate enter when its client holds focus.
    pub fn bind(self: &Rc<Self>, server: &Rc<Server>, resource: Rc<dyn KeyboardResource>) {
        {
            let xkb = self.xkb.borrow();
            // Advertised size excludes the terminating NUL.
            resource.keymap(xkb.keymap_file.as_fd(), xkb.keymap_size - 1);
        }
        resource.repeat_info(REPEAT_RATE, REPEAT_DELAY);

        let became_active = self.focus.borrow_mut().add_resource(resource.clone());
        if became_active
            && let Some(view) = self.focus.borrow().view()
        {
            let serial = server.next_serial();
            resource.modifiers(serial, self.modifier_state.get());
            resource.enter(serial, view.surface().id(), &self.client_keys());
        }
    }

    pub fn unbind(&self, resource: &Rc<dyn KeyboardResource>) {
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
                if let Some(keyboard) = weak.upgrade() {
                    keyboard.focus.borrow_mut().clear_destroyed_view();
                    keyboard.view_destroy.borrow_mut().take();
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
            let serial = server.next_serial();
            let state = self.modifier_state.get();
            let keys = self.client_keys();
            for resource in &transition.entered {
                resource.modifiers(serial, state);
                resource.enter(serial, new_view.surface().id(), &keys);
            }
        }

        self.focus_changed.emit(&FocusChange {
            old: transition.old_view,
            new: transition.new_view,
        });
    }

    pub fn handle_key(self: &Rc<Self>, server: &Rc<Server>, time: u32, value: u32, state: KeyState) {
        let serial = server.next_serial();

        match state {
            KeyState::Released => {
                let Some(press) = self.keys.borrow_mut().end(value, serial) else {
                    // Unpaired release.
                    return;
                };
                if let Some(handler) = press.handler.clone() {
                    handler.key(server, self, time, &press, KeyState::Released);
                }
            },
            KeyState::Pressed => {
                if !self.keys.borrow_mut().begin(value, serial) {
                    // Repeat of a key we already track.
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
                    if handler.key(server, self, time, &press, KeyState::Pressed) {
                        winner = Some(handler);
                        break;
                    }
                }
                self.keys.borrow_mut().set_handler(value, winner);
            },
        }

        self.update_xkb_state(server, value, state);
    }

    fn update_xkb_state(self: &Rc<Self>, server: &Rc<Server>, value: u32, state: KeyState) {
        let (new_state, compact) = {
            let mut xkb = self.xkb.borrow_mut();
            let direction = match state {
                KeyState::Pressed => xkb::KeyDirection::Down,
                KeyState::Released => xkb::KeyDirection::Up,
            };
            xkb.state
                .update_key((value + KEYCODE_OFFSET).into(), direction);

            let new_state = ModifierState {
                depressed: xkb.state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
                latched: xkb.state.serialize_mods(xkb::STATE_MODS_LATCHED),
                locked: xkb.state.serialize_mods(xkb::STATE_MODS_LOCKED),
                group: xkb.state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
            };

            let active = new_state.depressed | new_state.latched;
            let mut compact = Modifiers::empty();
            if active & mod_bit(xkb.indices.ctrl) != 0 {
                compact |= Modifiers::CTRL;
            }
            if active & mod_bit(xkb.indices.alt) != 0 {
                compact |= Modifiers::ALT;
            }
            if active & mod_bit(xkb.indices.logo) != 0 {
                compact |= Modifiers::LOGO;
            }
            if active & mod_bit(xkb.indices.shift) != 0 {
                compact |= Modifiers::SHIFT;
            }
            (new_state, compact)
        };

        if new_state != self.modifier_state.get() {
            self.modifier_state.set(new_state);
            self.modifiers.set(compact);
            let handlers = self.handlers.borrow().clone();
            for handler in handlers {
                handler.modifiers(server, self, &new_state);
            }
        }
    }

    /// Synthesizes releases for every handled key and resets the XKB state.
    /// Called on session deactivation, before input freezes.
    pub fn reset(self: &Rc<Self>, server: &Rc<Server>) {
        let time = utils::time_ms();
        let presses = self.keys.borrow_mut().drain();
        for mut press in presses {
            if let Some(handler) = press.handler.clone() {
                press.serial = server.next_serial();
                handler.key(server, self, time, &press, KeyState::Released);
            }
        }
        // Delivering the synthetic releases through the client handler must
        // have emptied its mirror.
        debug_assert!(self.client_keys.borrow().is_empty());
        self.client_keys.borrow_mut().clear();
        self.modifier_state.set(ModifierState::default());
        self.modifiers.set(Modifiers::empty());

        let mut xkb = self.xkb.borrow_mut();
        xkb.state = xkb::State::new(&xkb.keymap);
    }
}
