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

//! Shared-memory buffer import. A pool maps a client's fd; buffers are
//! windows into it. The pool mapping stays alive as long as any buffer
//! references it, and can only grow.

use std::cell::Cell;
use std::cell::RefCell;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use drm_fourcc::DrmFourcc;
use memmap2::MmapMut;
use thiserror::Error;

use crate::buffer::Buffer;
use crate::buffer::Mapping;
use crate::prelude::*;

/// Validation failures map 1:1 onto wl_shm protocol errors.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("offset {offset} + size {size} is outside the pool of {pool_size} bytes")]
    InvalidOffset {
        offset: i32,
        size: usize,
        pool_size: usize,
    },
    #[error("stride {stride} is invalid for width {width}")]
    InvalidStride { stride: i32, width: i32 },
    #[error("unsupported format {0:?}")]
    InvalidFormat(u32),
    #[error("pools cannot shrink ({0} < {1})")]
    BadResize(usize, usize),
    #[error("could not map the pool")]
    Map(#[source] std::io::Error),
}

pub struct ShmPool {
    file: File,
    size: Cell<usize>,
    map: RefCell<MmapMut>,
}

impl ShmPool {
    pub fn new(fd: OwnedFd, size: usize) -> Result<Rc<Self>, ShmError> {
        let file = File::from(fd);
        // SAFETY: shared mapping of a client-provided fd; clients that
        // truncate their own pool only hurt themselves.
        let map = unsafe { memmap2::MmapOptions::new().len(size).map_mut(&file) }
            .map_err(ShmError::Map)?;
        Ok(Rc::new(Self {
            file,
            size: Cell::new(size),
            map: RefCell::new(map),
        }))
    }

    pub fn size(&self) -> usize {
        self.size.get()
    }

    /// wl_shm_pool.resize. Pools only grow.
    pub fn resize(&self, size: usize) -> Result<(), ShmError> {
        if size < self.size.get() {
            return Err(ShmError::BadResize(size, self.size.get()));
        }
        // SAFETY: as in new().
        let map = unsafe { memmap2::MmapOptions::new().len(size).map_mut(&self.file) }
            .map_err(ShmError::Map)?;
        *self.map.borrow_mut() = map;
        self.size.set(size);
        Ok(())
    }

    /// wl_shm_pool.create_buffer.
    pub fn create_buffer(
        self: &Rc<Self>,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: DrmFourcc,
    ) -> Result<Rc<Buffer>, ShmError> {
        if !matches!(format, DrmFourcc::Xrgb8888 | DrmFourcc::Argb8888) {
            return Err(ShmError::InvalidFormat(format as u32));
        }
        if stride < width * 4 || width <= 0 || height <= 0 {
            return Err(ShmError::InvalidStride { stride, width });
        }
        let len = stride as usize * height as usize;
        if offset < 0 || offset as usize + len > self.size.get() {
            return Err(ShmError::InvalidOffset {
                offset,
                size: len,
                pool_size: self.size.get(),
            });
        }

        let mapping = PoolMapping {
            pool: self.clone(),
            offset: offset as usize,
            len,
        };
        Ok(Rc::new(Buffer::new(
            width as u32,
            height as u32,
            stride as u32,
            format,
            Some(Box::new(mapping)),
            None,
        )))
    }
}

/// A buffer's window into its pool. Holding the pool `Rc` keeps the mapping
/// alive past wl_shm_pool destruction, per the protocol.
struct PoolMapping {
    pool: Rc<ShmPool>,
    offset: usize,
    len: usize,
}

impl Mapping for PoolMapping {
    fn with_bytes(&self, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let mut map = self.pool.map.borrow_mut();
        if self.offset + self.len > map.len() {
            bail!("buffer window escapes the pool mapping");
        }
        f(&mut map[self.offset..self.offset + self.len]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn pool_with_size(size: usize) -> Rc<ShmPool> {
        let fd = nix::sys::memfd::memfd_create(
            c"welkin-test-pool",
            nix::sys::memfd::MemFdCreateFlag::MFD_CLOEXEC,
        )
        .unwrap();
        let mut file = File::from(fd);
        file.set_len(size as u64).unwrap();
        file.write_all(&vec![0xaa; size]).unwrap();
        ShmPool::new(file.into(), size).unwrap()
    }

    #[test]
    fn test_buffer_reads_pool_bytes() {
        let pool = pool_with_size(4 * 4 * 4);
        let buffer = pool
            .create_buffer(0, 4, 4, 16, DrmFourcc::Xrgb8888)
            .unwrap();
        buffer
            .with_bytes(&mut |bytes| {
                assert_eq!(bytes.len(), 64);
                assert!(bytes.iter().all(|&b| b == 0xaa));
            })
            .unwrap();
    }

    #[test]
    fn test_offset_out_of_range() {
        let pool = pool_with_size(64);
        assert!(matches!(
            pool.create_buffer(32, 4, 4, 16, DrmFourcc::Xrgb8888),
            Err(ShmError::InvalidOffset { .. })
        ));
        assert!(matches!(
            pool.create_buffer(-1, 4, 4, 16, DrmFourcc::Xrgb8888),
            Err(ShmError::InvalidOffset { .. })
        ));
    }

    #[test]
    fn test_bad_stride_and_format() {
        let pool = pool_with_size(256);
        assert!(matches!(
            pool.create_buffer(0, 4, 4, 8, DrmFourcc::Xrgb8888),
            Err(ShmError::InvalidStride { .. })
        ));
        assert!(matches!(
            pool.create_buffer(0, 4, 4, 16, DrmFourcc::Nv12),
            Err(ShmError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_pool_grows_but_never_shrinks() {
        let pool = pool_with_size(64);
        // Growing requires the backing file to be large enough.
        pool.file.set_len(128).unwrap();
        pool.resize(128).unwrap();
        assert_eq!(pool.size(), 128);
        assert!(matches!(pool.resize(64), Err(ShmError::BadResize(..))));
    }
}
