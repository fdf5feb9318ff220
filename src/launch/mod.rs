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

//! Client side of the launcher socket. The compositor runs unprivileged and
//! asks its privileged parent (`welkin-launch`) to open DRM and input device
//! nodes and to switch VTs. Session activation flows back the other way as
//! asynchronous events.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::env;
use std::io::IoSlice;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::FcntlArg;
use nix::fcntl::FdFlag;
use nix::fcntl::OFlag;
use nix::sys::socket::MsgFlags;

use crate::launch::protocol::LaunchEvent;
use crate::launch::protocol::RequestType;
use crate::prelude::*;

pub mod protocol;
pub mod server;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionEvent {
    /// VT acquired; DRM master has been re-asserted by the parent.
    Activate,
    /// VT about to be released; DRM master dropped and input fds revoked.
    Deactivate,
}

pub struct LaunchClient {
    socket: OwnedFd,
    next_serial: Cell<u32>,
    /// Session events that arrived while waiting for a request's response.
    pending: RefCell<VecDeque<SessionEvent>>,
}

impl LaunchClient {
    /// Connects using the socket fd inherited from welkin-launch, named by
    /// the environment variable. The variable is consumed.
    pub fn connect() -> Result<Self> {
        let value = env::var(protocol::LAUNCH_SOCKET_ENV)
            .map_err(|_| anyhow!("{} is not set; run under welkin-launch", protocol::LAUNCH_SOCKET_ENV))?;
        // SAFETY: single-threaded startup; nothing is reading the
        // environment concurrently.
        unsafe { env::remove_var(protocol::LAUNCH_SOCKET_ENV) };

        let raw: i32 = value
            .parse()
            .map_err(|_| anyhow!("{} is not an fd number: {value:?}", protocol::LAUNCH_SOCKET_ENV))?;
        // SAFETY: the fd was opened for us by the parent and is otherwise
        // unowned in this process.
        let socket = unsafe { OwnedFd::from_raw_fd(raw) };
        nix::fcntl::fcntl(&socket, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).location(loc!())?;

        Ok(Self {
            socket,
            next_serial: Cell::new(0),
            pending: RefCell::new(VecDeque::new()),
        })
    }

    pub fn socket_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    /// Opens a DRM or input device node via the privileged parent.
    #[instrument(skip(self), level = "debug")]
    pub fn open_device(&self, path: &Path, flags: OFlag) -> Result<OwnedFd> {
        let mut path_bytes = path.as_os_str().as_bytes().to_vec();
        path_bytes.push(0);
        if path_bytes.len() > protocol::MAX_PATH_LEN {
            bail!("device path too long: {path:?}");
        }

        let (success, fd) = self.request(RequestType::OpenDevice, flags.bits() as u32, &path_bytes)?;
        match (success, fd) {
            (true, Some(fd)) => Ok(fd),
            _ => bail!("launcher refused to open {path:?}"),
        }
    }

    /// Asks the parent to switch to the given VT. The switch itself is
    /// asynchronous; Deactivate arrives when the kernel signals release.
    pub fn activate_vt(&self, vt: u32) -> Result<()> {
        let (success, _) = self.request(RequestType::ActivateVt, vt, &[])?;
        if !success {
            bail!("launcher failed to activate VT {vt}");
        }
        Ok(())
    }

    fn request(&self, kind: RequestType, arg: u32, trailing: &[u8]) -> Result<(bool, Option<OwnedFd>)> {
        let serial = self.next_serial.get().wrapping_add(1);
        self.next_serial.set(serial);
        let header = protocol::encode_request(kind, serial, arg);

        let header_bytes = bytemuck::bytes_of(&header);
        let bufs = if trailing.is_empty() {
            vec![IoSlice::new(header_bytes)]
        } else {
            vec![IoSlice::new(header_bytes), IoSlice::new(trailing)]
        };
        protocol::send_with_fd(self.socket.as_fd(), &bufs, None).location(loc!())?;

        // Block until the matching response; session events arriving in the
        // meantime are queued for the next drain.
        loop {
            let mut buf = [0u8; 16];
            let (len, fd) =
                protocol::recv_with_fd(self.socket.as_fd(), &mut buf, MsgFlags::empty())
                    .location(loc!())?;
            if len == 0 {
                bail!("launcher closed the socket");
            }
            match protocol::decode_event(&buf[..len], fd)? {
                LaunchEvent::Response {
                    serial: got,
                    success,
                    fd,
                } if got == serial => return Ok((success, fd)),
                LaunchEvent::Response { serial: got, .. } => {
                    warn!("launch response with unexpected serial {got} (wanted {serial})");
                },
                LaunchEvent::Activate => self.pending.borrow_mut().push_back(SessionEvent::Activate),
                LaunchEvent::Deactivate => {
                    self.pending.borrow_mut().push_back(SessionEvent::Deactivate)
                },
            }
        }
    }

    /// Drains queued and newly-arrived session events. Called from the event
    /// loop when the socket polls readable. An undecodable message is fatal
    /// to the session and is propagated.
    pub fn drain_events(&self) -> Result<Vec<SessionEvent>> {
        let mut events: Vec<SessionEvent> = self.pending.borrow_mut().drain(..).collect();

        loop {
            let mut buf = [0u8; 16];
            match protocol::recv_with_fd(self.socket.as_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
                Ok((0, _)) => {
                    bail!("launcher closed the socket");
                },
                Ok((len, fd)) => match protocol::decode_event(&buf[..len], fd)? {
                    LaunchEvent::Activate => events.push(SessionEvent::Activate),
                    LaunchEvent::Deactivate => events.push(SessionEvent::Deactivate),
                    LaunchEvent::Response { serial, .. } => {
                        warn!("unsolicited launch response with serial {serial}");
                    },
                },
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).location(loc!()),
            }
        }
        Ok(events)
    }
}
