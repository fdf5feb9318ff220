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

//! Hardware plane views. The primary plane mode-sets once and then page
//! flips; the cursor plane tracks the pointer image. Both re-arm after the
//! session comes back from a VT switch.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::rc::Weak;

use drm::control::Device as ControlDevice;
use drm::control::PageFlipFlags;
use drm::control::connector;
use drm::control::crtc;
use drm::control::plane;

use crate::buffer::Buffer;
use crate::drm::DrmDevice;
use crate::geometry::Point;
use crate::geometry::Rectangle;
use crate::prelude::*;
use crate::server::Server;
use crate::utils;
use crate::view::AttachError;
use crate::view::View;
use crate::view::ViewRole;

fn is_access_revoked(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EACCES)
}

/// The view behind a screen's composited scene. Attaching a buffer submits
/// it to the CRTC: the first time (and after every session reactivation)
/// with a full mode-set, afterwards with a page flip whose completion fires
/// the view's frame event.
pub struct PrimaryPlane {
    drm: Rc<DrmDevice>,
    crtc: crtc::Handle,
    connectors: Vec<connector::Handle>,
    mode: drm::control::Mode,
    need_modeset: Cell<bool>,
    original_crtc: Option<drm::control::crtc::Info>,
    view: Rc<View>,
}

struct PrimaryRole {
    plane: Weak<PrimaryPlane>,
}

impl PrimaryPlane {
    pub(crate) fn new(
        server: &Rc<Server>,
        drm: &Rc<DrmDevice>,
        crtc: crtc::Handle,
        connectors: Vec<connector::Handle>,
        mode: drm::control::Mode,
        geometry: Rectangle,
    ) -> Result<Rc<Self>> {
        let original_crtc = drm.card().get_crtc(crtc).ok();

        let plane = Rc::new_cyclic(|weak: &Weak<PrimaryPlane>| Self {
            drm: drm.clone(),
            crtc,
            connectors,
            mode,
            need_modeset: Cell::new(true),
            original_crtc,
            view: View::new(Box::new(PrimaryRole {
                plane: weak.clone(),
            })),
        });

        plane.view.set_position(server, geometry.x, geometry.y);
        plane.view.set_size(server, geometry.width, geometry.height);
        drm.register_flip_handler(crtc, &plane);

        Ok(plane)
    }

    pub fn view(&self) -> Rc<View> {
        self.view.clone()
    }

    pub(crate) fn handle_page_flip(&self, server: &Rc<Server>, time: u32) {
        self.view.frame(server, time);
    }

    /// DRM master was re-asserted; the next attach must mode-set afresh.
    pub(crate) fn handle_session_activate(&self) {
        self.need_modeset.set(true);
    }
}

impl Drop for PrimaryPlane {
    fn drop(&mut self) {
        // Put the CRTC back the way we found it.
        if let Some(saved) = &self.original_crtc
            && let Err(e) = self.drm.card().set_crtc(
                self.crtc,
                saved.framebuffer(),
                saved.position(),
                &[],
                saved.mode(),
            )
        {
            debug!("could not restore CRTC state: {e}");
        }
    }
}

impl ViewRole for PrimaryRole {
    fn attach(
        &self,
        server: &Rc<Server>,
        _view: &Rc<View>,
        buffer: Option<&Rc<Buffer>>,
    ) -> Result<(), AttachError> {
        let Some(plane) = self.plane.upgrade() else {
            return Ok(());
        };
        let Some(buffer) = buffer else {
            return Ok(());
        };

        let fb = plane.drm.framebuffer(buffer)?;

        if plane.need_modeset.get() {
            match plane.drm.card().set_crtc(
                plane.crtc,
                Some(fb),
                (0, 0),
                &plane.connectors,
                Some(plane.mode),
            ) {
                Ok(()) => {
                    plane.need_modeset.set(false);
                    // A mode-set completes immediately; deliver the frame
                    // from the next idle so callers see consistent ordering
                    // with the page-flip path.
                    let weak = self.plane.clone();
                    server.insert_idle(move |server| {
                        if let Some(plane) = weak.upgrade() {
                            plane.view.frame(server, utils::time_ms());
                        }
                    });
                    Ok(())
                },
                Err(e) if is_access_revoked(&e) => Err(AttachError::AccessRevoked),
                Err(e) => Err(anyhow!(e).context("could not set CRTC").into()),
            }
        } else {
            match plane
                .drm
                .card()
                .page_flip(plane.crtc, fb, PageFlipFlags::EVENT, None)
            {
                Ok(()) => Ok(()),
                Err(e) if is_access_revoked(&e) => Err(AttachError::AccessRevoked),
                Err(e) => Err(anyhow!(e).context("page flip failed").into()),
            }
        }
    }

    fn update(&self, _server: &Rc<Server>, _view: &Rc<View>) -> bool {
        // Redraws of the scene are driven by the compositor, not the plane.
        true
    }

    fn move_to(&self, server: &Rc<Server>, view: &Rc<View>, x: i32, y: i32) -> bool {
        view.set_position(server, x, y);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The view behind a screen's hardware cursor. Attach points the cursor
/// plane at the (cursor-sized) buffer; move repositions it relative to the
/// screen origin.
pub struct CursorPlane {
    drm: Rc<DrmDevice>,
    plane: plane::Handle,
    crtc: crtc::Handle,
    /// Screen position; plane coordinates are CRTC-relative.
    origin: Cell<Point>,
    view: Rc<View>,
}

struct CursorRole {
    plane: Weak<CursorPlane>,
}

impl CursorPlane {
    pub(crate) fn new(
        _server: &Rc<Server>,
        drm: &Rc<DrmDevice>,
        handle: plane::Handle,
        crtc: crtc::Handle,
        origin: Point,
    ) -> Result<Rc<Self>> {
        let plane = Rc::new_cyclic(|weak: &Weak<CursorPlane>| Self {
            drm: drm.clone(),
            plane: handle,
            crtc,
            origin: Cell::new(origin),
            view: View::new(Box::new(CursorRole {
                plane: weak.clone(),
            })),
        });

        // Start with the cursor disabled.
        plane.disable()?;
        Ok(plane)
    }

    pub fn view(&self) -> Rc<View> {
        self.view.clone()
    }

    fn disable(&self) -> Result<()> {
        self.drm
            .card()
            .set_plane(self.plane, self.crtc, None, 0, (0, 0, 0, 0), (0, 0, 0, 0))
            .context(loc!(), "could not disable cursor plane")
    }

    fn program(&self, buffer: &Rc<Buffer>) -> Result<(), AttachError> {
        let fb = self.drm.framebuffer(buffer)?;
        let geometry = self.view.geometry();
        let origin = self.origin.get();
        let width = buffer.width();
        let height = buffer.height();
        self.drm
            .card()
            .set_plane(
                self.plane,
                self.crtc,
                Some(fb),
                0,
                (
                    geometry.x - origin.x,
                    geometry.y - origin.y,
                    width,
                    height,
                ),
                (0, 0, width << 16, height << 16),
            )
            .map_err(|e| {
                if is_access_revoked(&e) {
                    AttachError::AccessRevoked
                } else {
                    AttachError::Other(anyhow!(e).context("could not set cursor plane"))
                }
            })
    }

    /// Session came back: replay position and image.
    pub(crate) fn handle_session_activate(&self, server: &Rc<Server>) {
        let geometry = self.view.geometry();
        self.view.move_to(server, geometry.x, geometry.y);
        let buffer = self.view.buffer();
        self.view
            .attach(server, buffer.as_ref())
            .warn_and_ignore(loc!());
    }
}

impl Drop for CursorPlane {
    fn drop(&mut self) {
        _ = self.disable();
    }
}

impl ViewRole for CursorRole {
    fn attach(
        &self,
        server: &Rc<Server>,
        view: &Rc<View>,
        buffer: Option<&Rc<Buffer>>,
    ) -> Result<(), AttachError> {
        let Some(plane) = self.plane.upgrade() else {
            return Ok(());
        };

        match buffer {
            Some(buffer) => plane.program(buffer)?,
            None => plane.disable()?,
        }
        view.set_size_from_buffer(server, buffer);
        Ok(())
    }

    fn update(&self, _server: &Rc<Server>, _view: &Rc<View>) -> bool {
        // The pointer drives cursor redraws directly.
        true
    }

    fn move_to(&self, server: &Rc<Server>, view: &Rc<View>, x: i32, y: i32) -> bool {
        let Some(plane) = self.plane.upgrade() else {
            return false;
        };

        view.set_position(server, x, y);

        // Reprogramming with the same framebuffer is how universal planes
        // move the cursor.
        if let Some(buffer) = view.buffer()
            && let Err(e) = plane.program(&buffer)
        {
            debug!("could not move cursor: {e}");
            return false;
        }
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
