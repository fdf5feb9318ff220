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

//! The compositor daemon. Run it under welkin-launch:
//!
//!     welkin-launch -- welkind
//!
//! Configuration comes from `$XDG_CONFIG_HOME/welkin/welkind.ron`, overridden
//! by command-line flags. Without an external window manager a small
//! built-in stacking policy places and focuses windows.

use std::cell::Cell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::rc::Weak;

use clap::Parser;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use tracing::Level;
use welkin::args;
use welkin::args::Config;
use welkin::args::SerializableLevel;
use welkin::bindings::ActionConfig;
use welkin::bindings::BindingConfig;
use welkin::input::keyboard::XkbConfig;
use welkin::prelude::*;
use welkin::screen::Screen;
use welkin::server::Manager;
use welkin::server::Server;
use welkin::server::ServerOptions;
use welkin::utils;
use welkin::window::Window;
use welkin::window::WindowHandler;

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
struct WelkindConfig {
    #[serde(skip_serializing)]
    config_file: PathBuf,
    seat_name: String,
    stderr_log_level: SerializableLevel,
    file_log_level: SerializableLevel,
    log_file: Option<PathBuf>,
    xkb: XkbConfig,
    bindings: Vec<BindingConfig>,
    border_width: u32,
    active_border_color: u32,
    inactive_border_color: u32,
}

impl Default for WelkindConfig {
    fn default() -> Self {
        Self {
            config_file: args::default_config_file("welkind"),
            seat_name: "seat0".to_string(),
            stderr_log_level: SerializableLevel(Level::INFO),
            file_log_level: SerializableLevel(Level::TRACE),
            log_file: None,
            xkb: XkbConfig::default(),
            bindings: vec![BindingConfig {
                modifiers: vec!["logo".to_string()],
                key: "Return".to_string(),
                action: ActionConfig::Spawn(vec!["foot".to_string()]),
            }],
            border_width: 1,
            active_border_color: 0xff6688cc,
            inactive_border_color: 0xff444444,
        }
    }
}

impl Config for WelkindConfig {
    fn config_file(&self) -> PathBuf {
        self.config_file.clone()
    }
}

#[derive(Debug, Parser)]
#[command(name = "welkind", about = "a kernel-mode-setting Wayland compositor")]
struct Flags {
    /// Print a config file with default values and exit.
    #[arg(long)]
    print_default_config_and_exit: bool,
    /// Path to the config file.
    #[arg(long)]
    config_file: Option<PathBuf>,
    #[arg(long)]
    seat_name: Option<String>,
    #[arg(long)]
    stderr_log_level: Option<SerializableLevel>,
    #[arg(long)]
    file_log_level: Option<SerializableLevel>,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn load_config() -> WelkindConfig {
    let flags = Flags::parse();
    if flags.print_default_config_and_exit {
        WelkindConfig::print_default_and_exit();
    }

    let mut config = WelkindConfig::default();
    let path = flags
        .config_file
        .clone()
        .unwrap_or_else(|| config.config_file.clone());
    if let Some(from_file) = WelkindConfig::read_from_file(&path) {
        config = from_file;
    }

    args::apply(&mut config.config_file, flags.config_file);
    args::apply(&mut config.seat_name, flags.seat_name);
    args::apply(&mut config.stderr_log_level, flags.stderr_log_level);
    args::apply(&mut config.file_log_level, flags.file_log_level);
    args::apply(&mut config.log_file, flags.log_file.map(Some));
    config
}

/// A window's upcalls into the built-in policy.
struct PolicyWindowHandler {
    server: Weak<Server>,
}

impl WindowHandler for PolicyWindowHandler {
    fn entered(&self, window: &Rc<Window>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        Window::focus(&server, Some(window));
    }

    fn destroy(&self, window: &Rc<Window>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let focused = server
            .seat
            .keyboard
            .focused_view()
            .is_some_and(|view| Rc::ptr_eq(&view, window.view()));
        if focused {
            Window::focus(&server, None);
        }
    }
}

/// Built-in stacking policy: cascade new windows, focus them, color their
/// borders. Enough to use a terminal; real window managers replace it.
struct StackingPolicy {
    border_width: u32,
    active_border_color: u32,
    inactive_border_color: u32,
    next_offset: Cell<i32>,
}

impl Manager for StackingPolicy {
    fn new_window(&self, server: &Rc<Server>, window: &Rc<Window>) {
        window.set_handler(Rc::new(PolicyWindowHandler {
            server: Rc::downgrade(server),
        }));

        let offset = self.next_offset.get();
        self.next_offset.set((offset + 40) % 400);
        let origin = server
            .screens()
            .first()
            .map(|screen: &Rc<Screen>| screen.usable_geometry().pos())
            .unwrap_or_default();

        window.set_stacked(server);
        window.set_position(server, origin.x + 40 + offset, origin.y + 40 + offset);
        window.set_border(server, self.inactive_border_color, self.border_width);
        window.show(server);
        Window::focus(server, Some(window));
        window.set_border(server, self.active_border_color, self.border_width);
    }

    fn new_screen(&self, _server: &Rc<Server>, screen: &Rc<Screen>) {
        info!(
            "screen {:?}: {}x{}",
            screen.id(),
            screen.geometry().width,
            screen.geometry().height
        );
    }
}

fn main() -> ExitCode {
    let config = load_config();
    if let Err(e) = utils::configure_tracing(
        config.stderr_log_level.0,
        config.log_file.as_ref(),
        config.file_log_level.0,
    ) {
        eprintln!("could not set up logging: {e:?}");
        return ExitCode::FAILURE;
    }
    utils::exit_on_thread_panic();

    let options = ServerOptions {
        seat_name: config.seat_name.clone(),
        xkb: config.xkb.clone(),
        bindings: config.bindings.clone(),
    };
    let manager = Rc::new(StackingPolicy {
        border_width: config.border_width,
        active_border_color: config.active_border_color,
        inactive_border_color: config.inactive_border_color,
        next_offset: Cell::new(0),
    });

    let server = match Server::new(&options, manager) {
        Ok(server) => server,
        Err(e) => {
            error!("initialization failed: {e:?}");
            return ExitCode::FAILURE;
        },
    };

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            ExitCode::FAILURE
        },
    }
}
