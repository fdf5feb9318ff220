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

//! The privileged launcher. Keeps root, owns the TTY, opens DRM and input
//! devices for the unprivileged compositor child, and relays VT switches.
//! The child runs with the caller's real uid and finds the socket through
//! `WELKIN_LAUNCH_SOCKET`.

use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::process::exit;
use std::time::Duration;

use calloop::EventLoop;
use calloop::Interest;
use calloop::Mode;
use calloop::PostAction;
use calloop::generic::Generic;
use calloop::signals::Signal;
use calloop::signals::Signals;
use clap::Parser;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use nix::sys::socket::socketpair;
use nix::sys::wait::WaitStatus;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use welkin::launch::protocol::LAUNCH_SOCKET_ENV;
use welkin::launch::server::Launcher;
use welkin::launch::server::find_vt;
use welkin::launch::server::open_tty;
use welkin::prelude::*;

#[derive(Debug, Parser)]
#[command(
    name = "welkin-launch",
    about = "run a welkin compositor on its own VT",
    trailing_var_arg = true
)]
struct Flags {
    /// Do not switch VTs at startup.
    #[arg(short = 'n')]
    no_vt_switch: bool,
    /// TTY device to run on; defaults to a free VT.
    #[arg(short = 't')]
    tty: Option<PathBuf>,
    /// The compositor command to run.
    #[arg(required = true)]
    command: Vec<String>,
}

struct LoopState {
    launcher: Launcher,
    child: Pid,
}

fn reap_and_exit(state: &mut LoopState) -> ! {
    let status = match waitpid(state.child, None) {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(..)) => 1,
        _ => 1,
    };
    state.launcher.cleanup();
    exit(status);
}

fn run() -> Result<()> {
    let flags = Flags::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::INFO)
        .init();

    let (parent_sock, child_sock) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )
    .location(loc!())?;
    nix::fcntl::fcntl(
        &parent_sock,
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
    )
    .location(loc!())?;

    let tty_path = match &flags.tty {
        Some(path) => path.clone(),
        None => find_vt()?,
    };
    info!("running on {tty_path:?}");
    let tty = open_tty(&tty_path)?;

    let mut launcher = Launcher::new(parent_sock, tty, flags.no_vt_switch);
    launcher.setup_tty()?;

    // The signal source must exist (and have the signals masked) before the
    // child can die or the kernel can ask for the VT.
    let mut event_loop: EventLoop<'static, LoopState> = EventLoop::try_new().location(loc!())?;
    let signals = Signals::new(&[Signal::SIGCHLD, Signal::SIGUSR1, Signal::SIGUSR2])
        .location(loc!())?;

    // The child drops back to the invoking user; device access goes through
    // us from here on.
    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();
    let mut command = Command::new(&flags.command[0]);
    command
        .args(&flags.command[1..])
        .env(LAUNCH_SOCKET_ENV, child_sock.as_raw_fd().to_string());
    unsafe {
        command.pre_exec(move || {
            // Undo our signal mask; the child gets a clean slate.
            nix::sys::signal::sigprocmask(
                nix::sys::signal::SigmaskHow::SIG_SETMASK,
                Some(&nix::sys::signal::SigSet::empty()),
                None,
            )?;
            nix::unistd::setgid(gid)?;
            nix::unistd::setuid(uid)?;
            Ok(())
        });
    }
    let child = match command.spawn() {
        Ok(child) => Pid::from_raw(child.id() as i32),
        Err(e) => {
            launcher.cleanup();
            return Err(e).context(loc!(), "could not start the compositor");
        },
    };
    drop(child_sock);

    event_loop
        .handle()
        .insert_source(signals, |event, _, state| match event.signal() {
            Signal::SIGCHLD => {
                reap_and_exit(state);
            },
            Signal::SIGUSR1 => {
                if let Err(e) = state.launcher.handle_vt_release() {
                    error!("VT release failed: {e:?}");
                    state.launcher.cleanup();
                    exit(1);
                }
            },
            Signal::SIGUSR2 => {
                if let Err(e) = state.launcher.handle_vt_acquire() {
                    error!("VT acquire failed: {e:?}");
                }
            },
            _ => {},
        })
        .map_err(|e| anyhow!("could not watch signals: {e}"))?;

    let sock_fd = launcher.socket_fd().try_clone_to_owned().location(loc!())?;
    event_loop
        .handle()
        .insert_source(
            Generic::new(sock_fd, Interest::READ, Mode::Level),
            |_, _, state| match state.launcher.handle_socket() {
                Ok(true) => Ok(PostAction::Continue),
                Ok(false) => {
                    // Child closed its end; SIGCHLD does the rest.
                    Ok(PostAction::Remove)
                },
                Err(e) => {
                    error!("launcher socket error: {e:?}");
                    Ok(PostAction::Continue)
                },
            },
        )
        .map_err(|e| anyhow!("could not watch the socket: {e}"))?;

    let mut state = LoopState { launcher, child };
    event_loop
        .run(Duration::from_millis(500), &mut state, |_| {})
        .location(loc!())?;

    state.launcher.cleanup();
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("{e:?}");
        eprintln!("welkin-launch: {e:#}");
        exit(1);
    }
}
