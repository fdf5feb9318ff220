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

//! GPU/CPU drawables. A `Buffer` is a fixed-size pixel allocation with two
//! attachment chains: exporters, queried front to back when someone needs a
//! kernel-visible handle for the buffer, and destructors, run LIFO when the
//! last reference drops. Derived objects (a KMS framebuffer id, for example)
//! hook both chains so they are found on re-export and released with the
//! buffer.
//!
//! References are `Rc<Buffer>`; a view's reference is what keeps a client
//! buffer alive while it is on screen.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use drm_fourcc::DrmFourcc;
use enum_as_inner::EnumAsInner;

use crate::prelude::*;
use crate::protocol::BufferHandle;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ExportKind {
    /// GEM handle on the scanout device.
    GemHandle,
    /// KMS framebuffer id.
    Framebuffer,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, EnumAsInner)]
pub enum Export {
    GemHandle(u32),
    Framebuffer(u32),
}

pub trait Exporter {
    fn export(&self, buffer: &Buffer, kind: ExportKind) -> Option<Export>;
}

/// CPU-visible storage. Buffers without one (imported dma-bufs) can only be
/// composited through their GEM handle or a proxy.
pub trait Mapping {
    /// Runs `f` over the pixel bytes. The slice is `stride * height` long.
    fn with_bytes(&self, f: &mut dyn FnMut(&mut [u8])) -> Result<()>;
}

pub struct Buffer {
    width: u32,
    height: u32,
    stride: u32,
    format: DrmFourcc,
    mapping: Option<Box<dyn Mapping>>,
    /// Intrinsic GEM handle, consulted after the exporter chain misses.
    gem_handle: Option<u32>,
    exporters: RefCell<Vec<Rc<dyn Exporter>>>,
    destructors: RefCell<Vec<Box<dyn FnOnce()>>>,
    /// Client half, told when the compositor stops reading the buffer.
    release_handler: RefCell<Option<Rc<dyn BufferHandle>>>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("mappable", &self.mapping.is_some())
            .field("gem_handle", &self.gem_handle)
            .finish()
    }
}

impl Buffer {
    pub fn new(
        width: u32,
        height: u32,
        stride: u32,
        format: DrmFourcc,
        mapping: Option<Box<dyn Mapping>>,
        gem_handle: Option<u32>,
    ) -> Self {
        Self {
            width,
            height,
            stride,
            format,
            mapping,
            gem_handle,
            exporters: RefCell::new(Vec::new()),
            destructors: RefCell::new(Vec::new()),
            release_handler: RefCell::new(None),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    pub fn size(&self) -> crate::geometry::Size {
        crate::geometry::Size::new(self.width, self.height)
    }

    pub fn is_mappable(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn with_bytes(&self, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        match &self.mapping {
            Some(mapping) => mapping.with_bytes(f),
            None => bail!("buffer has no CPU mapping"),
        }
    }

    /// Walks the exporter chain, falling back to the intrinsic GEM handle.
    pub fn export(&self, kind: ExportKind) -> Option<Export> {
        for exporter in self.exporters.borrow().iter() {
            if let Some(export) = exporter.export(self, kind) {
                return Some(export);
            }
        }
        match kind {
            ExportKind::GemHandle => self.gem_handle.map(Export::GemHandle),
            ExportKind::Framebuffer => None,
        }
    }

    pub fn add_exporter(&self, exporter: Rc<dyn Exporter>) {
        self.exporters.borrow_mut().push(exporter);
    }

    pub fn add_destructor(&self, destructor: impl FnOnce() + 'static) {
        self.destructors.borrow_mut().push(Box::new(destructor));
    }

    pub fn set_release_handler(&self, handler: Rc<dyn BufferHandle>) {
        *self.release_handler.borrow_mut() = Some(handler);
    }

    /// Tells the owning client the compositor is done reading this buffer.
    pub fn release(&self) {
        if let Some(handler) = self.release_handler.borrow().as_ref() {
            handler.release();
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let destructors = std::mem::take(self.destructors.get_mut());
        for destructor in destructors.into_iter().rev() {
            destructor();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct FixedExporter(Export);

    impl Exporter for FixedExporter {
        fn export(&self, _buffer: &Buffer, kind: ExportKind) -> Option<Export> {
            match (kind, self.0) {
                (ExportKind::Framebuffer, Export::Framebuffer(_)) => Some(self.0),
                (ExportKind::GemHandle, Export::GemHandle(_)) => Some(self.0),
                _ => None,
            }
        }
    }

    fn buffer() -> Buffer {
        Buffer::new(4, 4, 16, DrmFourcc::Xrgb8888, None, Some(11))
    }

    #[test]
    fn test_intrinsic_gem_handle() {
        let buf = buffer();
        assert_eq!(buf.export(ExportKind::GemHandle), Some(Export::GemHandle(11)));
        assert_eq!(buf.export(ExportKind::Framebuffer), None);
    }

    #[test]
    fn test_exporter_chain_is_consulted_first() {
        let buf = buffer();
        buf.add_exporter(Rc::new(FixedExporter(Export::Framebuffer(42))));
        assert_eq!(
            buf.export(ExportKind::Framebuffer),
            Some(Export::Framebuffer(42))
        );
        // The chain does not shadow other kinds.
        assert_eq!(buf.export(ExportKind::GemHandle), Some(Export::GemHandle(11)));
    }

    #[test]
    fn test_destructors_run_lifo_exactly_once() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let buf = Rc::new(buffer());
        for i in 0..3 {
            let order = order.clone();
            buf.add_destructor(move || order.borrow_mut().push(i));
        }
        let second = buf.clone();
        drop(buf);
        assert!(order.borrow().is_empty());
        drop(second);
        assert_eq!(&*order.borrow(), &[2, 1, 0]);
    }
}
