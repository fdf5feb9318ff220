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

//! Wire format of the launcher socket. The privileged parent and the
//! compositor child share a `SOCK_SEQPACKET` pair; every message is one
//! packet: a fixed-layout header, for OpenDevice a NUL-terminated path
//! trailing it, and at most one fd in ancillary data. Requests are answered
//! by exactly one Response with a matching serial; Activate/Deactivate are
//! parent-initiated and carry no serial.

use std::io::IoSlice;
use std::io::IoSliceMut;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

use bytemuck::Pod;
use bytemuck::Zeroable;
use nix::cmsg_space;
use nix::sys::socket::ControlMessage;
use nix::sys::socket::ControlMessageOwned;
use nix::sys::socket::MsgFlags;
use nix::sys::socket::recvmsg;
use nix::sys::socket::sendmsg;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use static_assertions::const_assert_eq;

use crate::prelude::*;

pub const LAUNCH_SOCKET_ENV: &str = "WELKIN_LAUNCH_SOCKET";

/// Longest device path accepted in an OpenDevice request.
pub const MAX_PATH_LEN: usize = 4096;

#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum RequestType {
    OpenDevice = 0,
    ActivateVt = 1,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum EventType {
    Response = 0,
    Activate = 1,
    Deactivate = 2,
}

/// Header of a child-to-parent request. `arg` is the open(2) flags for
/// OpenDevice and the VT number for ActivateVt.
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
#[repr(C)]
pub struct RawRequest {
    pub kind: u32,
    pub serial: u32,
    pub arg: u32,
}

/// A parent-to-child event. `serial` and `success` are meaningful only for
/// Response.
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
#[repr(C)]
pub struct RawEvent {
    pub kind: u32,
    pub serial: u32,
    pub success: u32,
}

const_assert_eq!(std::mem::size_of::<RawRequest>(), 12);
const_assert_eq!(std::mem::size_of::<RawEvent>(), 12);

/// Sends one packet consisting of `bufs`, with `fd` attached as SCM_RIGHTS
/// when present.
pub fn send_with_fd(sock: BorrowedFd<'_>, bufs: &[IoSlice<'_>], fd: Option<BorrowedFd<'_>>) -> Result<()> {
    let raw_fds;
    let cmsgs: &[ControlMessage] = match &fd {
        Some(fd) => {
            raw_fds = [fd.as_raw_fd()];
            &[ControlMessage::ScmRights(&raw_fds)]
        },
        None => &[],
    };
    sendmsg::<()>(sock.as_raw_fd(), bufs, cmsgs, MsgFlags::empty(), None).location(loc!())?;
    Ok(())
}

/// Receives one packet into `buf`. Returns the packet length and the fd from
/// ancillary data, if any. A zero length means the peer closed the socket.
pub fn recv_with_fd(
    sock: BorrowedFd<'_>,
    buf: &mut [u8],
    flags: MsgFlags,
) -> nix::Result<(usize, Option<OwnedFd>)> {
    let mut cmsg_buf = cmsg_space!([std::os::fd::RawFd; 1]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        flags | MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    let mut fd = None;
    if let Ok(cmsgs) = msg.cmsgs() {
        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for raw in fds {
                    // SAFETY: the kernel hands us a fresh descriptor we now own.
                    fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
    }
    Ok((msg.bytes, fd))
}

pub fn encode_request(kind: RequestType, serial: u32, arg: u32) -> RawRequest {
    RawRequest {
        kind: kind.into(),
        serial,
        arg,
    }
}

pub fn encode_event(kind: EventType, serial: u32, success: bool) -> RawEvent {
    RawEvent {
        kind: kind.into(),
        serial,
        success: success as u32,
    }
}

/// A decoded parent-to-child event.
#[derive(Debug)]
pub enum LaunchEvent {
    Response {
        serial: u32,
        success: bool,
        fd: Option<OwnedFd>,
    },
    Activate,
    Deactivate,
}

/// Decodes an event packet. An unknown type is a protocol desync and is
/// fatal to the session; callers must not ignore it.
pub fn decode_event(buf: &[u8], fd: Option<OwnedFd>) -> Result<LaunchEvent> {
    if buf.len() < std::mem::size_of::<RawEvent>() {
        bail!("short launch event: {} bytes", buf.len());
    }
    let raw: RawEvent = bytemuck::pod_read_unaligned(&buf[..std::mem::size_of::<RawEvent>()]);
    match EventType::try_from(raw.kind) {
        Ok(EventType::Response) => Ok(LaunchEvent::Response {
            serial: raw.serial,
            success: raw.success != 0,
            fd,
        }),
        Ok(EventType::Activate) => Ok(LaunchEvent::Activate),
        Ok(EventType::Deactivate) => Ok(LaunchEvent::Deactivate),
        Err(_) => bail!("unknown launch event type {}", raw.kind),
    }
}

#[cfg(test)]
mod tests {
    use std::io::IoSlice;
    use std::os::fd::AsFd;

    use nix::sys::socket::AddressFamily;
    use nix::sys::socket::SockFlag;
    use nix::sys::socket::SockType;
    use nix::sys::socket::socketpair;

    use super::*;

    #[test]
    fn test_request_roundtrip_with_path() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();

        let req = encode_request(RequestType::OpenDevice, 7, 0o2);
        let path = b"/dev/input/event3\0";
        let bufs = [IoSlice::new(bytemuck::bytes_of(&req)), IoSlice::new(path)];
        send_with_fd(a.as_fd(), &bufs, None).unwrap();

        let mut buf = [0u8; 64];
        let (len, fd) = recv_with_fd(b.as_fd(), &mut buf, MsgFlags::empty()).unwrap();
        assert!(fd.is_none());
        assert_eq!(len, 12 + path.len());
        let got: RawRequest = bytemuck::pod_read_unaligned(&buf[..12]);
        assert_eq!(got.kind, u32::from(RequestType::OpenDevice));
        assert_eq!(got.serial, 7);
        assert_eq!(&buf[12..len], path);
    }

    #[test]
    fn test_fd_passing() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();

        let passed = nix::fcntl::open(
            "/dev/null",
            nix::fcntl::OFlag::O_RDONLY,
            nix::sys::stat::Mode::empty(),
        )
        .unwrap();

        let ev = encode_event(EventType::Response, 3, true);
        let bufs = [IoSlice::new(bytemuck::bytes_of(&ev))];
        send_with_fd(a.as_fd(), &bufs, Some(passed.as_fd())).unwrap();

        let mut buf = [0u8; 16];
        let (len, fd) = recv_with_fd(b.as_fd(), &mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(len, 12);
        let fd = fd.expect("fd should have been passed");
        match decode_event(&buf[..len], Some(fd)).unwrap() {
            LaunchEvent::Response {
                serial,
                success,
                fd,
            } => {
                assert_eq!(serial, 3);
                assert!(success);
                assert!(fd.is_some());
            },
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_type_is_an_error() {
        let raw = RawEvent {
            kind: 99,
            serial: 0,
            success: 0,
        };
        assert!(decode_event(bytemuck::bytes_of(&raw), None).is_err());
    }
}
