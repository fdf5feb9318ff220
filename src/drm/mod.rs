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

//! The KMS device. Finds the primary GPU, builds screens out of connected
//! connectors with free CRTCs and cursor planes, allocates dumb scanout
//! buffers, caches KMS framebuffer ids on buffers via their exporter and
//! destructor chains, and dispatches page-flip completions to the primary
//! planes that submitted them.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::rc::Weak;

use drm::ClientCapability;
use drm::DriverCapability;
use drm::buffer::Buffer as DrmBufferExt;
use drm::control::Device as ControlDevice;
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::FbCmd2Flags;
use drm::control::ModeTypeFlags;
use drm::control::connector;
use drm::control::framebuffer;
use drm::Device;
use drm::control::plane as plane_ctrl;
use drm_fourcc::DrmFourcc;
use nix::fcntl::OFlag;

use crate::buffer::Buffer;
use crate::buffer::Export;
use crate::buffer::ExportKind;
use crate::buffer::Exporter;
use crate::buffer::Mapping;
use crate::drm::plane::CursorPlane;
use crate::drm::plane::PrimaryPlane;
use crate::geometry::Rectangle;
use crate::launch::LaunchClient;
use crate::prelude::*;
use crate::render::BufferFlags;
use crate::render::RenderContext;
use crate::screen::OutputMode;
use crate::screen::Screen;
use crate::server::Server;

pub mod plane;

// DRM_PLANE_TYPE_* property values.
const PLANE_TYPE_CURSOR: u64 = 2;

fn interface_name(interface: connector::Interface) -> &'static str {
    use connector::Interface;
    match interface {
        Interface::VGA => "VGA",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::Composite => "Composite",
        Interface::SVideo => "SVIDEO",
        Interface::LVDS => "LVDS",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::DisplayPort => "DP",
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::TV => "TV",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        _ => "Unknown",
    }
}

pub struct Card(OwnedFd);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for Card {}
impl ControlDevice for Card {}

/// Scans /dev/dri for the primary GPU, preferring the boot VGA device.
fn find_primary_device() -> Result<PathBuf> {
    let mut fallback = None;
    let mut cards: Vec<_> = std::fs::read_dir("/dev/dri")
        .location(loc!())?
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .strip_prefix("card")
                .is_some_and(|n| n.chars().all(|c| c.is_ascii_digit()))
        })
        .map(|entry| entry.path())
        .collect();
    cards.sort();

    for path in cards {
        let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        let boot_vga = format!("/sys/class/drm/{name}/device/boot_vga");
        if let Ok(contents) = std::fs::read_to_string(boot_vga)
            && contents.trim() == "1"
        {
            debug!("{path:?} is the primary GPU");
            return Ok(path);
        }
        fallback.get_or_insert(path);
    }

    fallback.ok_or_else(|| anyhow!("no DRM device found"))
}

pub struct DrmDevice {
    card: Card,
    path: PathBuf,
    cursor_size: (u32, u32),
    taken_screen_ids: Cell<u32>,
    /// Page-flip completions are keyed by CRTC.
    flip_handlers: RefCell<HashMap<u32, Weak<PrimaryPlane>>>,
}

impl DrmDevice {
    /// Opens the primary GPU through the launcher and prepares it for
    /// universal-plane modesetting.
    pub(crate) fn open(launch: &LaunchClient) -> Result<Rc<Self>> {
        let path = find_primary_device()?;
        let fd = launch
            .open_device(&path, OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .with_context(loc!(), || format!("could not open DRM device at {path:?}"))?;
        let card = Card(fd);

        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .context(loc!(), "could not enable universal planes")?;

        let cursor_width = card
            .get_driver_capability(DriverCapability::CursorWidth)
            .unwrap_or(64) as u32;
        let cursor_height = card
            .get_driver_capability(DriverCapability::CursorHeight)
            .unwrap_or(64) as u32;

        Ok(Rc::new(Self {
            card,
            path,
            cursor_size: (cursor_width, cursor_height),
            taken_screen_ids: Cell::new(0),
            flip_handlers: RefCell::new(HashMap::new()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }

    pub(crate) fn card(&self) -> &Card {
        &self.card
    }

    pub fn cursor_size(&self) -> (u32, u32) {
        self.cursor_size
    }

    fn allocate_screen_id(&self) -> Option<u8> {
        let taken = self.taken_screen_ids.get();
        let id = (!taken).trailing_zeros();
        if id > 31 {
            return None;
        }
        self.taken_screen_ids.set(taken | 1 << id);
        Some(id as u8)
    }

    pub(crate) fn release_screen_id(&self, id: u8) {
        self.taken_screen_ids
            .set(self.taken_screen_ids.get() & !(1 << id));
    }

    pub(crate) fn register_flip_handler(&self, crtc: drm::control::crtc::Handle, plane: &Rc<PrimaryPlane>) {
        self.flip_handlers
            .borrow_mut()
            .insert(NonZeroU32::from(crtc).get(), Rc::downgrade(plane));
    }

    /// Builds one screen per connected connector with an assignable CRTC.
    pub(crate) fn create_screens(self: &Rc<Self>, server: &Rc<Server>) -> Result<Vec<Rc<Screen>>> {
        let resources = self
            .card
            .resource_handles()
            .context(loc!(), "could not get DRM resources")?;

        // Pool of unclaimed cursor planes.
        let mut cursor_planes: Vec<plane_ctrl::Handle> = Vec::new();
        match self.card.plane_handles() {
            Ok(planes) => {
                for handle in planes {
                    match self.plane_type(handle) {
                        Ok(PLANE_TYPE_CURSOR) => cursor_planes.push(handle),
                        Ok(_) => {},
                        Err(e) => warn!("could not query plane {handle:?}: {e:#}"),
                    }
                }
            },
            Err(e) => warn!("could not get DRM plane resources: {e}"),
        }

        let mut taken_crtcs = Vec::new();
        let mut screens = Vec::new();
        let mut next_x = 0;

        for conn_handle in resources.connectors() {
            let conn = match self.card.get_connector(*conn_handle, false) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("could not get connector {conn_handle:?}: {e}");
                    continue;
                },
            };
            if conn.state() != connector::State::Connected {
                continue;
            }

            let Some(crtc) = self.find_free_crtc(&resources, &conn, &taken_crtcs) else {
                warn!("could not find a CRTC for connector {conn_handle:?}");
                continue;
            };

            let cursor = cursor_planes
                .iter()
                .position(|&p| self.plane_reaches_crtc(&resources, p, crtc))
                .map(|i| cursor_planes.remove(i));
            if cursor.is_none() {
                warn!("no cursor plane for CRTC {crtc:?}");
            }

            let Some(id) = self.allocate_screen_id() else {
                warn!("out of screen ids");
                break;
            };

            let modes = conn.modes();
            let Some(mode) = modes
                .iter()
                .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
                .or_else(|| modes.first())
                .copied()
            else {
                warn!("connector {conn_handle:?} has no modes");
                self.release_screen_id(id);
                continue;
            };

            let (width, height) = mode.size();
            // Screens line up along +x in discovery order.
            let geometry = Rectangle::new(next_x, 0, width as u32, height as u32);
            next_x += width as i32;

            let output_modes: Vec<OutputMode> = modes
                .iter()
                .map(|m| OutputMode {
                    width: m.size().0 as u32,
                    height: m.size().1 as u32,
                    refresh: m.vrefresh() * 1000,
                    preferred: m.mode_type().contains(ModeTypeFlags::PREFERRED),
                })
                .collect();
            let current_mode = OutputMode {
                width: width as u32,
                height: height as u32,
                refresh: mode.vrefresh() * 1000,
                preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
            };

            let (physical_width, physical_height) = conn.size().unwrap_or((0, 0));
            let output = crate::screen::OutputInfo {
                connector: format!(
                    "{}-{}",
                    interface_name(conn.interface()),
                    conn.interface_id()
                ),
                physical_width,
                physical_height,
            };

            let primary = PrimaryPlane::new(server, self, crtc, vec![*conn_handle], mode, geometry)?;
            let cursor_plane = match cursor {
                Some(handle) => match CursorPlane::new(server, self, handle, crtc, geometry.pos()) {
                    Ok(plane) => Some(plane),
                    Err(e) => {
                        warn!("could not initialize cursor plane: {e:#}");
                        None
                    },
                },
                None => None,
            };

            taken_crtcs.push(crtc);
            screens.push(Screen::new(
                id,
                geometry,
                output,
                output_modes,
                current_mode,
                primary,
                cursor_plane,
            ));
        }

        Ok(screens)
    }

    fn find_free_crtc(
        &self,
        resources: &drm::control::ResourceHandles,
        conn: &connector::Info,
        taken: &[drm::control::crtc::Handle],
    ) -> Option<drm::control::crtc::Handle> {
        for enc_handle in conn.encoders() {
            let Ok(enc) = self.card.get_encoder(*enc_handle) else {
                continue;
            };
            for crtc in resources.filter_crtcs(enc.possible_crtcs()) {
                if !taken.contains(&crtc) {
                    return Some(crtc);
                }
            }
        }
        None
    }

    fn plane_reaches_crtc(
        &self,
        resources: &drm::control::ResourceHandles,
        plane: plane_ctrl::Handle,
        crtc: drm::control::crtc::Handle,
    ) -> bool {
        self.card
            .get_plane(plane)
            .map(|info| resources.filter_crtcs(info.possible_crtcs()).contains(&crtc))
            .unwrap_or(false)
    }

    /// The "type" property of a plane.
    fn plane_type(&self, handle: plane_ctrl::Handle) -> Result<u64> {
        let props = self.card.get_properties(handle).location(loc!())?;
        let (ids, values) = props.as_props_and_values();
        for (id, value) in ids.iter().zip(values) {
            let info = self.card.get_property(*id).location(loc!())?;
            if info.name().to_str() == Ok("type") {
                return Ok(*value);
            }
        }
        bail!("plane {handle:?} has no type property");
    }

    /// Dispatches pending DRM events; page flips go to the plane that
    /// submitted them.
    pub(crate) fn dispatch(&self, server: &Rc<Server>) -> Result<()> {
        let events = self.card.receive_events().location(loc!())?;
        for event in events {
            if let drm::control::Event::PageFlip(flip) = event {
                let handler = self
                    .flip_handlers
                    .borrow()
                    .get(&NonZeroU32::from(flip.crtc).get())
                    .and_then(Weak::upgrade);
                if let Some(plane) = handler {
                    plane.handle_page_flip(server, flip.duration.as_millis() as u32);
                }
            }
        }
        Ok(())
    }

    /// The KMS framebuffer for a buffer, created on first use. The id is
    /// cached on the buffer as an exporter and removed with it by a
    /// destructor, so re-attaching the same buffer is free.
    pub(crate) fn framebuffer(self: &Rc<Self>, buffer: &Rc<Buffer>) -> Result<framebuffer::Handle> {
        if let Some(Export::Framebuffer(id)) = buffer.export(ExportKind::Framebuffer) {
            let raw = NonZeroU32::new(id).ok_or_else(|| anyhow!("invalid cached framebuffer"))?;
            return Ok(framebuffer::Handle::from(raw));
        }

        let Some(Export::GemHandle(gem)) = buffer.export(ExportKind::GemHandle) else {
            bail!("buffer has no GEM handle to scan out");
        };
        let gem = NonZeroU32::new(gem).ok_or_else(|| anyhow!("invalid GEM handle"))?;

        let source = FbSource {
            buffer,
            handle: drm::buffer::Handle::from(gem),
        };
        let fb = self
            .card
            .add_planar_framebuffer(&source, FbCmd2Flags::empty())
            .location(loc!())?;

        let id = NonZeroU32::from(fb).get();
        buffer.add_exporter(Rc::new(FramebufferExporter { id }));
        let drm = self.clone();
        buffer.add_destructor(move || {
            if let Err(e) = drm.card.destroy_framebuffer(fb) {
                debug!("could not remove framebuffer {id}: {e}");
            }
        });

        Ok(fb)
    }

    /// Imports a PRIME fd as a scanout-capable buffer.
    pub fn import_prime(
        self: &Rc<Self>,
        fd: &OwnedFd,
        width: u32,
        height: u32,
        format: DrmFourcc,
        stride: u32,
        _offset: u32,
    ) -> Result<Rc<Buffer>> {
        let handle = self
            .card
            .prime_fd_to_buffer(fd.as_fd())
            .context(loc!(), "PRIME import failed")?;
        let gem = NonZeroU32::from(handle).get();

        let buffer = Rc::new(Buffer::new(width, height, stride, format, None, Some(gem)));
        let drm = self.clone();
        buffer.add_destructor(move || {
            if let Err(e) = drm.card.close_buffer(handle) {
                debug!("could not close GEM handle {gem}: {e}");
            }
        });
        Ok(buffer)
    }
}

/// Adapter presenting one of our buffers to AddFB2.
struct FbSource<'a> {
    buffer: &'a Buffer,
    handle: drm::buffer::Handle,
}

impl drm::buffer::PlanarBuffer for FbSource<'_> {
    fn size(&self) -> (u32, u32) {
        (self.buffer.width(), self.buffer.height())
    }

    fn format(&self) -> DrmFourcc {
        self.buffer.format()
    }

    fn modifier(&self) -> Option<drm_fourcc::DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        [self.buffer.stride(), 0, 0, 0]
    }

    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        [Some(self.handle), None, None, None]
    }

    fn offsets(&self) -> [u32; 4] {
        [0; 4]
    }
}

struct FramebufferExporter {
    id: u32,
}

impl Exporter for FramebufferExporter {
    fn export(&self, _buffer: &Buffer, kind: ExportKind) -> Option<Export> {
        match kind {
            ExportKind::Framebuffer => Some(Export::Framebuffer(self.id)),
            _ => None,
        }
    }
}

/// Allocates dumb buffers for scanout (and the cursor plane) and lets the
/// CPU renderer composite into them.
pub struct ScanoutContext {
    drm: Rc<DrmDevice>,
}

impl ScanoutContext {
    pub(crate) fn new(drm: &Rc<DrmDevice>) -> Rc<Self> {
        Rc::new(Self { drm: drm.clone() })
    }
}

impl RenderContext for ScanoutContext {
    fn create_buffer(
        &self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        _flags: BufferFlags,
    ) -> Result<Rc<Buffer>> {
        let dumb = self
            .drm
            .card
            .create_dumb_buffer((width, height), format, 32)
            .context(loc!(), "could not allocate dumb buffer")?;
        let pitch = dumb.pitch();
        let gem = NonZeroU32::from(dumb.handle()).get();

        let backing = DumbBacking {
            drm: self.drm.clone(),
            dumb: RefCell::new(Some(dumb)),
        };
        Ok(Rc::new(Buffer::new(
            width,
            height,
            pitch,
            format,
            Some(Box::new(backing)),
            Some(gem),
        )))
    }
}

struct DumbBacking {
    drm: Rc<DrmDevice>,
    dumb: RefCell<Option<DumbBuffer>>,
}

impl Mapping for DumbBacking {
    fn with_bytes(&self, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let mut dumb = self.dumb.borrow_mut();
        let dumb = dumb.as_mut().ok_or_else(|| anyhow!("dumb buffer gone"))?;
        let mut mapping = self
            .drm
            .card
            .map_dumb_buffer(dumb)
            .context(loc!(), "could not map dumb buffer")?;
        f(mapping.as_mut());
        Ok(())
    }
}

impl Drop for DumbBacking {
    fn drop(&mut self) {
        if let Some(dumb) = self.dumb.get_mut().take()
            && let Err(e) = self.drm.card.destroy_dumb_buffer(dumb)
        {
            debug!("could not destroy dumb buffer: {e}");
        }
    }
}
