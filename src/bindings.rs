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

//! Key and button bindings. One keyboard handler and one pointer handler sit
//! at the front of their stacks; presses are matched against the binding
//! arrays by value and current modifier set, and the matching release is
//! consumed silently. Bindings can be registered programmatically or loaded
//! from the config file.

use std::cell::RefCell;
use std::process::Command;
use std::rc::Rc;

use serde_derive::Deserialize;
use serde_derive::Serialize;
use xkbcommon::xkb;

use crate::input::Press;
use crate::input::keyboard::Keyboard;
use crate::input::keyboard::KeyboardHandler;
use crate::input::keyboard::KeyboardHandlerRef;
use crate::input::pointer::PointerHandler;
use crate::input::pointer::PointerHandlerRef;
use crate::prelude::*;
use crate::protocol::ButtonState;
use crate::protocol::KeyState;
use crate::protocol::Modifiers;
use crate::server::Server;

/// The modifier requirement of a binding: an exact modifier set, or the
/// wildcard that matches any state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BindingModifiers {
    Any,
    Mods(Modifiers),
}

impl BindingModifiers {
    pub fn exactly(mods: Modifiers) -> Self {
        Self::Mods(mods)
    }

    fn matches(&self, current: Modifiers) -> bool {
        match self {
            Self::Any => true,
            Self::Mods(mods) => *mods == current,
        }
    }
}

pub type BindingAction = dyn Fn(&Rc<Server>, u32, u32);

struct Binding {
    modifiers: BindingModifiers,
    value: u32,
    action: Rc<BindingAction>,
}

/// Finds the first binding matching `value` under `modifiers`.
fn lookup(bindings: &[Binding], modifiers: Modifiers, value: u32) -> Option<Rc<BindingAction>> {
    bindings
        .iter()
        .find(|b| b.value == value && b.modifiers.matches(modifiers))
        .map(|b| b.action.clone())
}

pub struct Bindings {
    key_bindings: RefCell<Vec<Binding>>,
    button_bindings: RefCell<Vec<Binding>>,
}

impl Bindings {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            key_bindings: RefCell::new(Vec::new()),
            button_bindings: RefCell::new(Vec::new()),
        })
    }

    /// Registers a key binding. `keysym` is matched against the level-0
    /// keysym of the pressed key.
    pub fn add_key_binding(
        &self,
        modifiers: BindingModifiers,
        keysym: u32,
        action: Rc<BindingAction>,
    ) {
        self.key_bindings.borrow_mut().push(Binding {
            modifiers,
            value: keysym,
            action,
        });
    }

    /// Registers a button binding on an evdev button code.
    pub fn add_button_binding(
        &self,
        modifiers: BindingModifiers,
        button: u32,
        action: Rc<BindingAction>,
    ) {
        self.button_bindings.borrow_mut().push(Binding {
            modifiers,
            value: button,
            action,
        });
    }

    pub(crate) fn keyboard_handler(self: &Rc<Self>) -> KeyboardHandlerRef {
        Rc::new(BindingsKeyboardHandler {
            bindings: self.clone(),
        })
    }

    pub(crate) fn pointer_handler(self: &Rc<Self>) -> PointerHandlerRef {
        Rc::new(BindingsPointerHandler {
            bindings: self.clone(),
        })
    }
}

struct BindingsKeyboardHandler {
    bindings: Rc<Bindings>,
}

impl KeyboardHandler for BindingsKeyboardHandler {
    fn key(
        &self,
        server: &Rc<Server>,
        keyboard: &Keyboard,
        time: u32,
        press: &Press<KeyboardHandlerRef>,
        state: KeyState,
    ) -> bool {
        if state != KeyState::Pressed {
            // The release of an accepted press comes back to us; swallow it.
            return false;
        }
        let keysym = keyboard.keysym(press.value);
        let Some(action) =
            lookup(&self.bindings.key_bindings.borrow(), keyboard.modifiers(), keysym)
        else {
            return false;
        };
        action(server, time, keysym);
        true
    }
}

struct BindingsPointerHandler {
    bindings: Rc<Bindings>,
}

impl PointerHandler for BindingsPointerHandler {
    fn button(
        &self,
        server: &Rc<Server>,
        time: u32,
        press: &Press<PointerHandlerRef>,
        state: ButtonState,
    ) -> bool {
        if state != ButtonState::Pressed {
            return false;
        }
        let modifiers = server.seat.keyboard.modifiers();
        let Some(action) = lookup(
            &self.bindings.button_bindings.borrow(),
            modifiers,
            press.value,
        ) else {
            return false;
        };
        action(server, time, press.value);
        true
    }
}

/// A binding as it appears in the config file.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct BindingConfig {
    /// Subset of ["ctrl", "alt", "logo", "shift"], or ["any"].
    pub modifiers: Vec<String>,
    /// An XKB keysym name ("Return", "XF86AudioMute") for key bindings, or
    /// an evdev button code for button bindings.
    pub key: String,
    pub action: ActionConfig,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum ActionConfig {
    /// Spawn a command (argv vector).
    Spawn(Vec<String>),
    /// Exit the compositor cleanly.
    Terminate,
    /// Switch to a VT.
    SwitchVt(u32),
}

fn parse_modifiers(names: &[String]) -> Result<BindingModifiers> {
    let mut mods = Modifiers::empty();
    for name in names {
        match name.as_str() {
            "any" => return Ok(BindingModifiers::Any),
            "ctrl" => mods |= Modifiers::CTRL,
            "alt" => mods |= Modifiers::ALT,
            "logo" | "super" => mods |= Modifiers::LOGO,
            "shift" => mods |= Modifiers::SHIFT,
            other => bail!("unknown modifier {other:?}"),
        }
    }
    Ok(BindingModifiers::Mods(mods))
}

fn action_from_config(action: &ActionConfig) -> Rc<BindingAction> {
    match action {
        ActionConfig::Spawn(argv) => {
            let argv = argv.clone();
            Rc::new(move |_server: &Rc<Server>, _time, _value| {
                let Some((program, args)) = argv.split_first() else {
                    return;
                };
                match Command::new(program).args(args).spawn() {
                    Ok(child) => debug!("spawned {program} as pid {}", child.id()),
                    Err(e) => error!("failed to spawn {program}: {e}"),
                }
            })
        },
        ActionConfig::Terminate => Rc::new(|server: &Rc<Server>, _time, _value| {
            server.terminate();
        }),
        ActionConfig::SwitchVt(vt) => {
            let vt = *vt;
            Rc::new(move |server: &Rc<Server>, _time, _value| {
                server.launch.activate_vt(vt).warn_and_ignore(loc!());
            })
        },
    }
}

impl Bindings {
    /// Installs bindings from the config file.
    pub fn load_config(&self, configs: &[BindingConfig]) -> Result<()> {
        for config in configs {
            let modifiers = parse_modifiers(&config.modifiers)?;
            let action = action_from_config(&config.action);

            if let Ok(button) = config.key.parse::<u32>() {
                self.add_button_binding(modifiers, button, action);
                continue;
            }

            let keysym =
                xkb::keysym_from_name(&config.key, xkb::KEYSYM_CASE_INSENSITIVE);
            if keysym.raw() == xkb::keysyms::KEY_NoSymbol {
                bail!("unknown keysym {:?}", config.key);
            }
            self.add_key_binding(modifiers, keysym.raw(), action);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(modifiers: BindingModifiers, value: u32) -> Binding {
        Binding {
            modifiers,
            value,
            action: Rc::new(|_, _, _| {}),
        }
    }

    #[test]
    fn test_exact_modifier_match() {
        let bindings = vec![binding(
            BindingModifiers::exactly(Modifiers::CTRL | Modifiers::ALT),
            100,
        )];
        assert!(lookup(&bindings, Modifiers::CTRL | Modifiers::ALT, 100).is_some());
        assert!(lookup(&bindings, Modifiers::CTRL, 100).is_none());
        // A superset of the required modifiers does not match.
        assert!(
            lookup(
                &bindings,
                Modifiers::CTRL | Modifiers::ALT | Modifiers::SHIFT,
                100
            )
            .is_none()
        );
        assert!(lookup(&bindings, Modifiers::CTRL | Modifiers::ALT, 101).is_none());
    }

    #[test]
    fn test_any_matches_every_state() {
        let bindings = vec![binding(BindingModifiers::Any, 200)];
        assert!(lookup(&bindings, Modifiers::empty(), 200).is_some());
        assert!(lookup(&bindings, Modifiers::LOGO | Modifiers::SHIFT, 200).is_some());
    }

    #[test]
    fn test_first_match_wins() {
        let first = Rc::new(std::cell::Cell::new(false));
        let flag = first.clone();
        let bindings = vec![
            Binding {
                modifiers: BindingModifiers::Any,
                value: 1,
                action: Rc::new(move |_, _, _| flag.set(true)),
            },
            binding(BindingModifiers::Any, 1),
        ];
        let action = lookup(&bindings, Modifiers::empty(), 1).unwrap();
        // Calling the returned action requires a server; instead check
        // identity by pointer.
        assert!(Rc::ptr_eq(&action, &bindings[0].action));
        drop(action);
        assert!(!first.get());
    }

    #[test]
    fn test_parse_modifiers() {
        assert_eq!(
            parse_modifiers(&["ctrl".into(), "shift".into()]).unwrap(),
            BindingModifiers::Mods(Modifiers::CTRL | Modifiers::SHIFT)
        );
        assert_eq!(
            parse_modifiers(&["any".into()]).unwrap(),
            BindingModifiers::Any
        );
        assert!(parse_modifiers(&["hyper".into()]).is_err());
    }
}
