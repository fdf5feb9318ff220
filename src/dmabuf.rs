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

//! linux-dmabuf import. Clients build up a parameter set plane by plane and
//! then create a buffer from it; everything is validated here, the PRIME
//! import itself happens on the DRM device. Only single-plane XRGB/ARGB is
//! accepted.

use std::cell::Cell;
use std::cell::RefCell;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use drm_fourcc::DrmFourcc;
use thiserror::Error;

use crate::buffer::Buffer;
use crate::server::Server;

pub const MAX_PLANES: usize = 4;

/// Validation failures map 1:1 onto zwp_linux_buffer_params_v1 errors.
#[derive(Debug, Error)]
pub enum DmabufError {
    #[error("the params object was already used to create a buffer")]
    AlreadyUsed,
    #[error("plane index {0} is too large")]
    PlaneIndex(u32),
    #[error("plane {0} was already set")]
    PlaneSet(u32),
    #[error("missing plane {0}")]
    Incomplete(usize),
    #[error("too many planes for the format")]
    TooManyPlanes,
    #[error("unsupported format {0:#x}")]
    InvalidFormat(u32),
    #[error("PRIME import failed")]
    ImportFailed(#[source] anyhow::Error),
}

struct Plane {
    fd: OwnedFd,
    offset: u32,
    stride: u32,
    #[allow(dead_code)]
    modifier: u64,
}

/// One zwp_linux_buffer_params_v1 object.
pub struct DmabufParams {
    planes: RefCell<[Option<Plane>; 4]>,
    used: Cell<bool>,
}

impl DmabufParams {
    pub fn new() -> Self {
        Self {
            planes: RefCell::new([None, None, None, None]),
            used: Cell::new(false),
        }
    }

    /// zwp_linux_buffer_params_v1.add.
    pub fn add(
        &self,
        fd: OwnedFd,
        index: u32,
        offset: u32,
        stride: u32,
        modifier: u64,
    ) -> Result<(), DmabufError> {
        if self.used.get() {
            return Err(DmabufError::AlreadyUsed);
        }
        if index as usize >= MAX_PLANES {
            return Err(DmabufError::PlaneIndex(index));
        }
        let mut planes = self.planes.borrow_mut();
        if planes[index as usize].is_some() {
            return Err(DmabufError::PlaneSet(index));
        }
        planes[index as usize] = Some(Plane {
            fd,
            offset,
            stride,
            modifier,
        });
        Ok(())
    }

    fn plane_count(format: u32) -> Result<usize, DmabufError> {
        match format {
            f if f == DrmFourcc::Xrgb8888 as u32 || f == DrmFourcc::Argb8888 as u32 => Ok(1),
            other => Err(DmabufError::InvalidFormat(other)),
        }
    }

    /// Consumes the params, checking plane completeness for `format`.
    /// Returns the plane set in index order.
    fn take_planes(&self, format: u32) -> Result<Vec<Plane>, DmabufError> {
        if self.used.replace(true) {
            return Err(DmabufError::AlreadyUsed);
        }
        let num_planes = Self::plane_count(format)?;
        let mut planes = self.planes.borrow_mut();
        for (i, plane) in planes.iter().enumerate().take(num_planes) {
            if plane.is_none() {
                return Err(DmabufError::Incomplete(i));
            }
        }
        if planes.iter().skip(num_planes).any(Option::is_some) {
            return Err(DmabufError::TooManyPlanes);
        }
        Ok(planes
            .iter_mut()
            .take(num_planes)
            .map(|p| p.take().unwrap())
            .collect())
    }

    /// zwp_linux_buffer_params_v1.create / create_immed.
    pub fn create(
        &self,
        server: &Rc<Server>,
        width: i32,
        height: i32,
        format: u32,
    ) -> Result<Rc<Buffer>, DmabufError> {
        let planes = self.take_planes(format)?;
        let plane = &planes[0];

        let fourcc = if format == DrmFourcc::Argb8888 as u32 {
            DrmFourcc::Argb8888
        } else {
            DrmFourcc::Xrgb8888
        };

        server
            .drm
            .import_prime(
                &plane.fd,
                width as u32,
                height as u32,
                fourcc,
                plane.stride,
                plane.offset,
            )
            .map_err(DmabufError::ImportFailed)
    }
}

impl Default for DmabufParams {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd() -> OwnedFd {
        let (r, _w) = nix::unistd::pipe().unwrap();
        r
    }

    fn xrgb() -> u32 {
        DrmFourcc::Xrgb8888 as u32
    }

    #[test]
    fn test_plane_index_and_duplicates() {
        let params = DmabufParams::new();
        assert!(matches!(
            params.add(fd(), 4, 0, 64, 0),
            Err(DmabufError::PlaneIndex(4))
        ));
        params.add(fd(), 0, 0, 64, 0).unwrap();
        assert!(matches!(
            params.add(fd(), 0, 0, 64, 0),
            Err(DmabufError::PlaneSet(0))
        ));
    }

    #[test]
    fn test_missing_plane() {
        let params = DmabufParams::new();
        assert!(matches!(
            params.take_planes(xrgb()),
            Err(DmabufError::Incomplete(0))
        ));
    }

    #[test]
    fn test_extra_plane_rejected() {
        let params = DmabufParams::new();
        params.add(fd(), 0, 0, 64, 0).unwrap();
        params.add(fd(), 1, 0, 64, 0).unwrap();
        assert!(matches!(
            params.take_planes(xrgb()),
            Err(DmabufError::TooManyPlanes)
        ));
    }

    #[test]
    fn test_params_are_single_use() {
        let params = DmabufParams::new();
        params.add(fd(), 0, 0, 64, 0).unwrap();
        params.take_planes(xrgb()).unwrap();
        assert!(matches!(
            params.take_planes(xrgb()),
            Err(DmabufError::AlreadyUsed)
        ));
        assert!(matches!(
            params.add(fd(), 1, 0, 64, 0),
            Err(DmabufError::AlreadyUsed)
        ));
    }

    #[test]
    fn test_unknown_format() {
        let params = DmabufParams::new();
        params.add(fd(), 0, 0, 64, 0).unwrap();
        assert!(matches!(
            params.take_planes(0x3231564e), // NV12
            Err(DmabufError::InvalidFormat(_))
        ));
    }
}
