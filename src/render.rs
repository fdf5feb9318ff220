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

//! The drawable abstraction the compositor renders through. `RenderContext`
//! allocates buffers, `Renderer` fills and blits regions into a target
//! buffer. The in-tree implementation composites on the CPU (the scanout
//! context in `drm` allocates dumb buffers and reuses `CpuRenderer` for the
//! pixel work); a GPU backend would slot in behind the same traits.
//!
//! `Swapchain` is the per-screen double buffer: damage submitted to it is
//! remembered per backing buffer, so a buffer coming back after a flip knows
//! the total area that went stale while it was off screen.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use drm_fourcc::DrmFourcc;

use crate::buffer::Buffer;
use crate::buffer::Mapping;
use crate::geometry::Rectangle;
use crate::prelude::*;
use crate::region::Region;

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct Capabilities: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct BufferFlags: u32 {
        /// CPU-accessible.
        const MAP = 1 << 0;
        /// Usable as a primary-plane framebuffer.
        const SCANOUT = 1 << 1;
        /// Usable on a cursor plane.
        const CURSOR = 1 << 2;
    }
}

pub trait RenderContext {
    fn create_buffer(
        &self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        flags: BufferFlags,
    ) -> Result<Rc<Buffer>>;
}

pub trait Renderer {
    fn set_target(&self, buffer: &Rc<Buffer>) -> Result<()>;
    /// Paints `region` (target coordinates) with an ARGB color.
    fn fill_region(&self, color: u32, region: &Region);
    /// Blits `region` (source coordinates) from `src` into the target,
    /// offset by (dst_x, dst_y).
    fn copy_region(&self, src: &Rc<Buffer>, dst_x: i32, dst_y: i32, region: &Region);
    fn flush(&self);
    /// What this renderer can do directly with the given buffer's storage.
    fn capabilities(&self, buffer: &Buffer) -> Capabilities;
}

/// Plain heap-backed pixel storage.
pub struct MemoryMapping(RefCell<Vec<u8>>);

impl MemoryMapping {
    pub fn new(len: usize) -> Self {
        Self(RefCell::new(vec![0; len]))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(RefCell::new(bytes))
    }
}

impl Mapping for MemoryMapping {
    fn with_bytes(&self, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        f(&mut self.0.borrow_mut());
        Ok(())
    }
}

fn bytes_per_pixel(format: DrmFourcc) -> Result<u32> {
    match format {
        DrmFourcc::Xrgb8888 | DrmFourcc::Argb8888 => Ok(4),
        other => bail!("unsupported format {other:?}"),
    }
}

/// Allocates malloc'd buffers. Serves cursor staging, proxy buffers, and
/// tests; scanout-capable allocation lives on the DRM device.
#[derive(Default)]
pub struct CpuRenderContext;

impl RenderContext for CpuRenderContext {
    fn create_buffer(
        &self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        flags: BufferFlags,
    ) -> Result<Rc<Buffer>> {
        if flags.intersects(BufferFlags::SCANOUT | BufferFlags::CURSOR) {
            bail!("CPU buffers cannot scan out");
        }
        let stride = width * bytes_per_pixel(format)?;
        let mapping = MemoryMapping::new(stride as usize * height as usize);
        Ok(Rc::new(Buffer::new(
            width,
            height,
            stride,
            format,
            Some(Box::new(mapping)),
            None,
        )))
    }
}

/// Composites with the CPU. Works on any buffer with a mapping.
pub struct CpuRenderer {
    target: RefCell<Option<Rc<Buffer>>>,
}

impl CpuRenderer {
    pub fn new() -> Self {
        Self {
            target: RefCell::new(None),
        }
    }
}

impl Default for CpuRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for CpuRenderer {
    fn set_target(&self, buffer: &Rc<Buffer>) -> Result<()> {
        if !buffer.is_mappable() {
            bail!("target buffer is not mappable");
        }
        *self.target.borrow_mut() = Some(buffer.clone());
        Ok(())
    }

    fn fill_region(&self, color: u32, region: &Region) {
        let target = self.target.borrow();
        let Some(target) = target.as_ref() else {
            return;
        };
        let stride = target.stride() as usize;
        let bounds = Rectangle::new(0, 0, target.width(), target.height());
        target
            .with_bytes(&mut |bytes| {
                for rect in region.rects() {
                    let Some(rect) = rect.intersection(&bounds) else {
                        continue;
                    };
                    for y in rect.y..rect.bottom() {
                        let row = y as usize * stride + rect.x as usize * 4;
                        for px in bytes[row..row + rect.width as usize * 4].chunks_exact_mut(4) {
                            px.copy_from_slice(&color.to_le_bytes());
                        }
                    }
                }
            })
            .log_and_ignore(loc!());
    }

    fn copy_region(&self, src: &Rc<Buffer>, dst_x: i32, dst_y: i32, region: &Region) {
        let target = self.target.borrow();
        let Some(target) = target.as_ref() else {
            return;
        };
        let src_bounds = Rectangle::new(0, 0, src.width(), src.height());
        let dst_bounds = Rectangle::new(0, 0, target.width(), target.height());
        let src_stride = src.stride() as usize;
        let dst_stride = target.stride() as usize;

        src.with_bytes(&mut |src_bytes| {
            target
                .with_bytes(&mut |dst_bytes| {
                    for rect in region.rects() {
                        let Some(rect) = rect.intersection(&src_bounds) else {
                            continue;
                        };
                        let Some(dst_rect) = rect
                            .translated(dst_x, dst_y)
                            .intersection(&dst_bounds)
                        else {
                            continue;
                        };
                        // Clip the source to what survived in the target.
                        let rect = dst_rect.translated(-dst_x, -dst_y);
                        let row_len = rect.width as usize * 4;
                        for dy in 0..rect.height as i32 {
                            let sy = (rect.y + dy) as usize;
                            let ty = (dst_rect.y + dy) as usize;
                            let s = sy * src_stride + rect.x as usize * 4;
                            let t = ty * dst_stride + dst_rect.x as usize * 4;
                            dst_bytes[t..t + row_len].copy_from_slice(&src_bytes[s..s + row_len]);
                        }
                    }
                })
                .log_and_ignore(loc!());
        })
        .log_and_ignore(loc!());
    }

    fn flush(&self) {}

    fn capabilities(&self, buffer: &Buffer) -> Capabilities {
        if buffer.is_mappable() {
            Capabilities::READ | Capabilities::WRITE
        } else {
            Capabilities::empty()
        }
    }
}

struct SwapEntry {
    buffer: Rc<Buffer>,
    /// Damage submitted since this buffer was last taken.
    stale: Region,
    in_use: bool,
}

/// Damage-accumulating double buffer for one screen.
pub struct Swapchain {
    context: Rc<dyn RenderContext>,
    width: u32,
    height: u32,
    format: DrmFourcc,
    flags: BufferFlags,
    entries: Vec<SwapEntry>,
}

impl Swapchain {
    pub fn new(
        context: Rc<dyn RenderContext>,
        width: u32,
        height: u32,
        format: DrmFourcc,
        flags: BufferFlags,
    ) -> Self {
        Self {
            context,
            width,
            height,
            format,
            flags,
            entries: Vec::new(),
        }
    }

    fn next_index(&mut self) -> Result<usize> {
        if let Some(i) = self.entries.iter().position(|e| !e.in_use) {
            return Ok(i);
        }
        let buffer =
            self.context
                .create_buffer(self.width, self.height, self.format, self.flags)?;
        self.entries.push(SwapEntry {
            buffer,
            // A fresh buffer has no valid content at all.
            stale: Region::from_rect(Rectangle::new(0, 0, self.width, self.height)),
            in_use: false,
        });
        Ok(self.entries.len() - 1)
    }

    /// Records new damage and returns the total stale region of the buffer
    /// the next `take()` will return.
    pub fn damage(&mut self, damage: &Region) -> Result<Region> {
        for entry in &mut self.entries {
            entry.stale.union(damage);
        }
        let next = self.next_index()?;
        Ok(self.entries[next].stale.clone())
    }

    /// Takes the next back buffer. Its stale region resets; the caller is
    /// expected to repaint it before presenting.
    pub fn take(&mut self) -> Result<Rc<Buffer>> {
        let i = self.next_index()?;
        let entry = &mut self.entries[i];
        entry.in_use = true;
        entry.stale.clear();
        Ok(entry.buffer.clone())
    }

    /// Returns a previously taken buffer to the pool.
    pub fn release(&mut self, buffer: &Rc<Buffer>) {
        for entry in &mut self.entries {
            if Rc::ptr_eq(&entry.buffer, buffer) {
                entry.in_use = false;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: i32, y: i32, w: u32, h: u32) -> Region {
        Region::from_rect(Rectangle::new(x, y, w, h))
    }

    #[test]
    fn test_fill_and_copy() {
        let ctx = CpuRenderContext;
        let renderer = CpuRenderer::new();
        let a = ctx
            .create_buffer(4, 4, DrmFourcc::Xrgb8888, BufferFlags::MAP)
            .unwrap();
        let b = ctx
            .create_buffer(4, 4, DrmFourcc::Xrgb8888, BufferFlags::MAP)
            .unwrap();

        renderer.set_target(&a).unwrap();
        renderer.fill_region(0xff112233, &region(0, 0, 4, 4));
        renderer.set_target(&b).unwrap();
        renderer.fill_region(0xff000000, &region(0, 0, 4, 4));
        renderer.copy_region(&a, 1, 1, &region(0, 0, 2, 2));

        b.with_bytes(&mut |bytes| {
            let px = |x: usize, y: usize| {
                u32::from_le_bytes(bytes[y * 16 + x * 4..y * 16 + x * 4 + 4].try_into().unwrap())
            };
            assert_eq!(px(0, 0), 0xff000000);
            assert_eq!(px(1, 1), 0xff112233);
            assert_eq!(px(2, 2), 0xff112233);
            assert_eq!(px(3, 3), 0xff000000);
        })
        .unwrap();
    }

    #[test]
    fn test_copy_clips_to_both_buffers() {
        let ctx = CpuRenderContext;
        let renderer = CpuRenderer::new();
        let src = ctx
            .create_buffer(2, 2, DrmFourcc::Xrgb8888, BufferFlags::MAP)
            .unwrap();
        let dst = ctx
            .create_buffer(2, 2, DrmFourcc::Xrgb8888, BufferFlags::MAP)
            .unwrap();
        renderer.set_target(&src).unwrap();
        renderer.fill_region(0xffffffff, &region(0, 0, 2, 2));
        renderer.set_target(&dst).unwrap();
        // Off the edge on both ends; must not panic.
        renderer.copy_region(&src, 1, 1, &region(-1, -1, 4, 4));
        dst.with_bytes(&mut |bytes| {
            let px = |x: usize, y: usize| {
                u32::from_le_bytes(bytes[y * 8 + x * 4..y * 8 + x * 4 + 4].try_into().unwrap())
            };
            assert_eq!(px(0, 0), 0);
            assert_eq!(px(1, 1), 0xffffffff);
        })
        .unwrap();
    }

    #[test]
    fn test_swapchain_tracks_stale_damage_per_buffer() {
        let ctx: Rc<dyn RenderContext> = Rc::new(CpuRenderContext);
        let mut chain = Swapchain::new(ctx, 8, 8, DrmFourcc::Xrgb8888, BufferFlags::MAP);

        // First frame: everything is stale.
        let total = chain.damage(&region(0, 0, 1, 1)).unwrap();
        assert_eq!(total.area(), 64);
        let first = chain.take().unwrap();

        // Second frame while the first buffer is on screen.
        let total = chain.damage(&region(2, 0, 1, 1)).unwrap();
        assert_eq!(total.area(), 64);
        let second = chain.take().unwrap();
        assert!(!Rc::ptr_eq(&first, &second));

        // First buffer comes back; it missed the (2,0) damage plus whatever
        // is new this frame.
        chain.release(&first);
        let total = chain.damage(&region(4, 0, 1, 1)).unwrap();
        assert_eq!(total.area(), 2);
        let third = chain.take().unwrap();
        assert!(Rc::ptr_eq(&first, &third));
    }
}
