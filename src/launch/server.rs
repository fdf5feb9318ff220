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

//! Privileged side of the launcher. welkin-launch keeps root (or the
//! relevant capabilities), owns the controlling TTY in `KD_GRAPHICS`/`K_OFF`
//! mode, opens device nodes on the compositor's behalf, and relays VT
//! switches negotiated with the kernel through `VT_PROCESS` signals.

use std::io::IoSlice;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use drm::Device as DrmCapDevice;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::socket::MsgFlags;
use nix::sys::stat::Mode;
use nix::sys::stat::fstat;
use nix::sys::stat::major;
use nix::unistd::isatty;

use crate::launch::protocol;
use crate::launch::protocol::EventType;
use crate::launch::protocol::RawRequest;
use crate::launch::protocol::RequestType;
use crate::prelude::*;

/// Bounds on the device tables. A session has a handful of each; the caps
/// only exist to keep a runaway client from exhausting the parent.
pub const MAX_INPUT_DEVICES: usize = 128;
pub const MAX_DRM_DEVICES: usize = 16;

const INPUT_MAJOR: u64 = 13;
const DRM_MAJOR: u64 = 226;

// linux/vt.h, linux/kd.h
const VT_OPENQRY: u64 = 0x5600;
const VT_SETMODE: u64 = 0x5602;
const VT_GETSTATE: u64 = 0x5603;
const VT_RELDISP: u64 = 0x5605;
const VT_ACTIVATE: u64 = 0x5606;
const VT_WAITACTIVE: u64 = 0x5607;
const KDSETMODE: u64 = 0x4b3a;
const KDGETMODE: u64 = 0x4b3b;
const KDGKBMODE: u64 = 0x4b44;
const KDSKBMODE: u64 = 0x4b45;

const VT_AUTO: i8 = 0;
const VT_PROCESS: i8 = 1;
const VT_ACKACQ: libc::c_ulong = 2;
const KD_GRAPHICS: libc::c_ulong = 1;
const K_OFF: libc::c_ulong = 4;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct VtMode {
    mode: i8,
    waitv: i8,
    relsig: i16,
    acqsig: i16,
    frsig: i16,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct VtStat {
    v_active: u16,
    v_signal: u16,
    v_state: u16,
}

nix::ioctl_write_int_bad!(vt_activate, VT_ACTIVATE);
nix::ioctl_write_int_bad!(vt_waitactive, VT_WAITACTIVE);
nix::ioctl_write_int_bad!(vt_reldisp, VT_RELDISP);
nix::ioctl_write_ptr_bad!(vt_setmode, VT_SETMODE, VtMode);
nix::ioctl_read_bad!(vt_getstate, VT_GETSTATE, VtStat);
nix::ioctl_read_bad!(vt_openqry, VT_OPENQRY, libc::c_int);
nix::ioctl_write_int_bad!(kd_set_mode, KDSETMODE);
nix::ioctl_read_bad!(kd_get_mode, KDGETMODE, libc::c_ulong);
nix::ioctl_write_int_bad!(kd_set_kb_mode, KDSKBMODE);
nix::ioctl_read_bad!(kd_get_kb_mode, KDGKBMODE, libc::c_ulong);
nix::ioctl_write_ptr!(evioc_revoke, b'E', 0x91, libc::c_int);

/// Wrapper giving us the DRM master ioctls on a bare fd.
struct DrmFd<'a>(std::os::fd::BorrowedFd<'a>);

impl AsFd for DrmFd<'_> {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.0
    }
}

impl drm::Device for DrmFd<'_> {}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum DeviceKind {
    Input,
    Drm,
    Other,
}

fn device_kind(rdev: u64) -> DeviceKind {
    match major(rdev) {
        INPUT_MAJOR => DeviceKind::Input,
        DRM_MAJOR => DeviceKind::Drm,
        _ => DeviceKind::Other,
    }
}

#[derive(Debug, Default)]
struct SavedVtState {
    altered: bool,
    vt: u16,
    kb_mode: libc::c_ulong,
    console_mode: libc::c_ulong,
}

pub struct Launcher {
    sock: OwnedFd,
    tty: OwnedFd,
    input_fds: Vec<OwnedFd>,
    drm_fds: Vec<OwnedFd>,
    active: bool,
    no_vt_switch: bool,
    saved: SavedVtState,
}

/// Picks the VT to run on: `XDG_VTNR` when we were started from a console
/// login, otherwise a free VT from `VT_OPENQRY` (always when a display
/// server is already running on the current one).
pub fn find_vt() -> Result<PathBuf> {
    if std::env::var_os("DISPLAY").is_none()
        && std::env::var_os("WAYLAND_DISPLAY").is_none()
        && let Some(vtnr) = std::env::var_os("XDG_VTNR")
    {
        let vtnr = vtnr
            .to_str()
            .ok_or_else(|| anyhow!("XDG_VTNR is not valid UTF-8"))?;
        return Ok(PathBuf::from(format!("/dev/tty{vtnr}")));
    }

    let tty0 = nix::fcntl::open("/dev/tty0", OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
        .location(loc!())?;
    let mut vt: libc::c_int = 0;
    // SAFETY: tty0 is a valid console fd and vt points at a c_int.
    unsafe { vt_openqry(tty0.as_raw_fd(), &mut vt) }.location(loc!())?;
    Ok(PathBuf::from(format!("/dev/tty{vt}")))
}

pub fn open_tty(path: &PathBuf) -> Result<OwnedFd> {
    // Reuse stdin if it already is the requested terminal.
    if let Ok(true) = isatty(std::io::stdin())
        && let Ok(stdin_name) = nix::unistd::ttyname(std::io::stdin())
        && stdin_name == *path
    {
        let stdin = std::io::stdin().as_fd().try_clone_to_owned().location(loc!())?;
        return Ok(stdin);
    }

    nix::fcntl::open(path, OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC, Mode::empty())
        .location(loc!())
}

impl Launcher {
    pub fn new(sock: OwnedFd, tty: OwnedFd, no_vt_switch: bool) -> Self {
        Self {
            sock,
            tty,
            input_fds: Vec::new(),
            drm_fds: Vec::new(),
            active: false,
            no_vt_switch,
            saved: SavedVtState::default(),
        }
    }

    pub fn socket_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.sock.as_fd()
    }

    /// Puts the TTY into compositor mode: keyboard off, graphics mode, and
    /// process-controlled VT switching via SIGUSR1/SIGUSR2. Activates the
    /// session immediately if we are already on the target VT.
    pub fn setup_tty(&mut self) -> Result<()> {
        let fd = self.tty.as_raw_fd();
        let st = fstat(&self.tty).location(loc!())?;
        let vt = nix::sys::stat::minor(st.st_rdev as u64) as u16;
        if major(st.st_rdev as u64) != 4 || vt == 0 {
            bail!("not a valid VT");
        }

        let mut state = VtStat::default();
        // SAFETY: fd is our tty; out-params point at the right structs.
        unsafe {
            vt_getstate(fd, &mut state).location(loc!())?;
            kd_get_kb_mode(fd, &mut self.saved.kb_mode).location(loc!())?;
            kd_get_mode(fd, &mut self.saved.console_mode).location(loc!())?;
        }
        self.saved.vt = state.v_active;

        let mode = VtMode {
            mode: VT_PROCESS,
            relsig: libc::SIGUSR1 as i16,
            acqsig: libc::SIGUSR2 as i16,
            ..VtMode::default()
        };
        // SAFETY: same fd; K_OFF and KD_GRAPHICS are valid modes.
        let res: Result<()> = unsafe {
            kd_set_kb_mode(fd, K_OFF as i32).location(loc!())?;
            kd_set_mode(fd, KD_GRAPHICS as i32).location(loc!())?;
            vt_setmode(fd, &mode).location(loc!())?;
            Ok(())
        };
        if let Err(e) = res {
            self.restore_tty();
            return Err(e);
        }
        self.saved.altered = true;

        if vt == self.saved.vt {
            self.activate()?;
        } else if !self.no_vt_switch {
            // SAFETY: switching to the VT we just validated.
            unsafe {
                vt_activate(fd, vt as i32).location(loc!())?;
                vt_waitactive(fd, vt as i32).location(loc!())?;
            }
        }

        Ok(())
    }

    fn restore_tty(&mut self) {
        let fd = self.tty.as_raw_fd();
        let mode = VtMode {
            mode: VT_AUTO,
            ..VtMode::default()
        };
        // SAFETY: best-effort restoration on our tty fd.
        unsafe {
            _ = vt_setmode(fd, &mode);
            _ = kd_set_mode(fd, self.saved.console_mode as i32);
            _ = kd_set_kb_mode(fd, self.saved.kb_mode as i32);
        }
    }

    fn start_devices(&mut self) -> Result<()> {
        for fd in &self.drm_fds {
            DrmFd(fd.as_fd())
                .acquire_master_lock()
                .context(loc!(), "failed to set DRM master")?;
        }
        Ok(())
    }

    /// Drops DRM master and revokes + closes all input fds. A master drop
    /// failure with `fatal` set is session loss and is propagated.
    fn stop_devices(&mut self, fatal: bool) -> Result<()> {
        for fd in &self.drm_fds {
            if let Err(e) = DrmFd(fd.as_fd()).release_master_lock()
                && fatal
            {
                return Err(e).context(loc!(), "failed to drop DRM master");
            }
        }
        for fd in self.input_fds.drain(..) {
            // SAFETY: fd is an evdev device we opened.
            match unsafe { evioc_revoke(fd.as_raw_fd(), &0) } {
                Ok(_) | Err(Errno::ENODEV) => {},
                Err(e) if fatal => {
                    return Err(e).context(loc!(), "EVIOCREVOKE failed");
                },
                Err(e) => warn!("EVIOCREVOKE failed: {e}"),
            }
        }
        Ok(())
    }

    fn send_event(&self, kind: EventType) {
        let event = protocol::encode_event(kind, 0, false);
        let bufs = [IoSlice::new(bytemuck::bytes_of(&event))];
        protocol::send_with_fd(self.sock.as_fd(), &bufs, None).log_and_ignore(loc!());
    }

    fn activate(&mut self) -> Result<()> {
        self.start_devices()?;
        self.send_event(EventType::Activate);
        self.active = true;
        Ok(())
    }

    fn deactivate(&mut self) -> Result<()> {
        self.send_event(EventType::Deactivate);
        self.stop_devices(true)?;
        self.active = false;
        Ok(())
    }

    /// Kernel asked us to release the VT (SIGUSR1).
    pub fn handle_vt_release(&mut self) -> Result<()> {
        self.deactivate()?;
        // SAFETY: acknowledging the release on our tty.
        unsafe { vt_reldisp(self.tty.as_raw_fd(), 1) }.location(loc!())?;
        Ok(())
    }

    /// Kernel granted us the VT back (SIGUSR2).
    pub fn handle_vt_acquire(&mut self) -> Result<()> {
        // SAFETY: acknowledging the acquisition on our tty.
        unsafe { vt_reldisp(self.tty.as_raw_fd(), VT_ACKACQ as i32) }.location(loc!())?;
        self.activate()?;
        Ok(())
    }

    /// Restores the TTY and original VT. Called on child exit and on fatal
    /// errors; also sweeps the process group so stray children die with us.
    pub fn cleanup(&mut self) {
        if !self.saved.altered {
            return;
        }
        self.restore_tty();
        // Release the DRM device before the next session tries to claim it.
        _ = self.stop_devices(false);
        // SAFETY: switching back to the VT we started from.
        unsafe { _ = vt_activate(self.tty.as_raw_fd(), self.saved.vt as i32) };
        self.saved.altered = false;
        _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(0),
            nix::sys::signal::Signal::SIGTERM,
        );
    }

    fn open_device(&mut self, path: &str, flags: i32) -> Result<OwnedFd> {
        let allowed = OFlag::O_ACCMODE | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC;
        let flags = OFlag::from_bits(flags).ok_or_else(|| anyhow!("invalid open flags"))?;
        if !allowed.contains(flags) {
            bail!("invalid open flags {flags:?}");
        }

        let fd = nix::fcntl::open(path, flags, Mode::empty())
            .with_context(loc!(), || format!("open {path}"))?;
        let st = fstat(&fd).location(loc!())?;

        match device_kind(st.st_rdev as u64) {
            DeviceKind::Input => {
                if !self.active {
                    bail!("input devices are only available while active");
                }
                if self.input_fds.len() == MAX_INPUT_DEVICES {
                    bail!("too many input devices opened");
                }
                let dup = fd.try_clone().location(loc!())?;
                self.input_fds.push(dup);
            },
            DeviceKind::Drm => {
                if self.drm_fds.len() == MAX_DRM_DEVICES {
                    bail!("too many DRM devices opened");
                }
                let dup = fd.try_clone().location(loc!())?;
                self.drm_fds.push(dup);
            },
            DeviceKind::Other => bail!("{path} is not a DRM or input device"),
        }

        Ok(fd)
    }

    /// Processes one request packet from the child. Returns false when the
    /// child has closed its end.
    pub fn handle_socket(&mut self) -> Result<bool> {
        let mut buf = vec![0u8; std::mem::size_of::<RawRequest>() + protocol::MAX_PATH_LEN];
        let (len, _) = match protocol::recv_with_fd(self.sock.as_fd(), &mut buf, MsgFlags::empty())
        {
            Ok(r) => r,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(true),
            Err(e) => return Err(e).location(loc!()),
        };
        if len == 0 {
            return Ok(false);
        }
        if len < std::mem::size_of::<RawRequest>() {
            warn!("short launch request: {len} bytes");
            return Ok(true);
        }

        let header: RawRequest =
            bytemuck::pod_read_unaligned(&buf[..std::mem::size_of::<RawRequest>()]);
        let trailing = &buf[std::mem::size_of::<RawRequest>()..len];

        let mut fd = None;
        let success = match RequestType::try_from(header.kind) {
            Ok(RequestType::OpenDevice) => match trailing {
                [path @ .., 0] => match std::str::from_utf8(path) {
                    Ok(path) => match self.open_device(path, header.arg as i32) {
                        Ok(opened) => {
                            fd = Some(opened);
                            true
                        },
                        Err(e) => {
                            warn!("open device: {e:#}");
                            false
                        },
                    },
                    Err(_) => {
                        warn!("device path is not valid UTF-8");
                        false
                    },
                },
                _ => {
                    warn!("device path is not NUL terminated");
                    false
                },
            },
            Ok(RequestType::ActivateVt) => {
                if self.active {
                    // SAFETY: switching VTs on our tty.
                    match unsafe { vt_activate(self.tty.as_raw_fd(), header.arg as i32) } {
                        Ok(_) => true,
                        Err(e) => {
                            warn!("failed to activate VT {}: {e}", header.arg);
                            false
                        },
                    }
                } else {
                    false
                }
            },
            Err(_) => {
                warn!("unknown launch request {}", header.kind);
                false
            },
        };

        let response = protocol::encode_event(EventType::Response, header.serial, success);
        let bufs = [IoSlice::new(bytemuck::bytes_of(&response))];
        protocol::send_with_fd(self.sock.as_fd(), &bufs, fd.as_ref().map(|f| f.as_fd()))
            .location(loc!())?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kind_by_major() {
        assert_eq!(device_kind(nix::sys::stat::makedev(13, 64)), DeviceKind::Input);
        assert_eq!(device_kind(nix::sys::stat::makedev(226, 0)), DeviceKind::Drm);
        assert_eq!(device_kind(nix::sys::stat::makedev(1, 3)), DeviceKind::Other);
    }

    #[test]
    fn test_vt_mode_layout() {
        // struct vt_mode from linux/vt.h is 8 bytes with these offsets.
        assert_eq!(std::mem::size_of::<VtMode>(), 8);
        assert_eq!(std::mem::size_of::<VtStat>(), 6);
    }
}
