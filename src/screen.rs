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

//! Outputs. A screen couples one CRTC with its connectors, a current mode,
//! and two planes: the primary plane showing the composited scene and a
//! cursor plane showing the pointer image. Screen ids are small integers
//! (≤31) so that sets of screens fit in a u32 mask.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use crate::drm::plane::CursorPlane;
use crate::drm::plane::PrimaryPlane;
use crate::event::Signal;
use crate::geometry::Rectangle;
use crate::prelude::*;
use crate::protocol::ScreenId;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OutputMode {
    pub width: u32,
    pub height: u32,
    /// Vertical refresh in mHz, as wl_output reports it.
    pub refresh: u32,
    pub preferred: bool,
}

/// Per-connector facts a wl_output adapter advertises.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct OutputInfo {
    /// Connector name, e.g. "HDMI-A-1".
    pub connector: String,
    /// Physical dimensions in millimetres, (0, 0) when unknown.
    pub physical_width: u32,
    pub physical_height: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Edge {
    Top,
    Bottom,
    Left,
    Right,
}

/// Something that carves space out of a screen's usable geometry; panels
/// dock an edge strut through this.
pub trait ScreenModifier {
    fn modify(&self, geometry: Rectangle, usable: &mut Rectangle);
}

/// An edge strut: reserves `size` pixels along one screen edge.
#[derive(Debug, Copy, Clone)]
pub struct EdgeStrut {
    pub edge: Edge,
    pub size: u32,
}

impl ScreenModifier for EdgeStrut {
    fn modify(&self, geometry: Rectangle, usable: &mut Rectangle) {
        let strut = self.size.min(match self.edge {
            Edge::Top | Edge::Bottom => usable.height,
            Edge::Left | Edge::Right => usable.width,
        });
        match self.edge {
            Edge::Top => {
                let cut = (geometry.y + strut as i32 - usable.y).clamp(0, usable.height as i32);
                usable.y += cut;
                usable.height -= cut as u32;
            },
            Edge::Bottom => {
                let cut = (usable.bottom() - (geometry.bottom() - strut as i32))
                    .clamp(0, usable.height as i32);
                usable.height -= cut as u32;
            },
            Edge::Left => {
                let cut = (geometry.x + strut as i32 - usable.x).clamp(0, usable.width as i32);
                usable.x += cut;
                usable.width -= cut as u32;
            },
            Edge::Right => {
                let cut = (usable.right() - (geometry.right() - strut as i32))
                    .clamp(0, usable.width as i32);
                usable.width -= cut as u32;
            },
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ModifierId(u64);

pub struct Screen {
    id: u8,
    geometry: Cell<Rectangle>,
    usable_geometry: Cell<Rectangle>,
    output: OutputInfo,
    modes: Vec<OutputMode>,
    current_mode: Cell<OutputMode>,
    pub primary: Rc<PrimaryPlane>,
    pub cursor: Option<Rc<CursorPlane>>,
    modifiers: RefCell<Vec<(ModifierId, Rc<dyn ScreenModifier>)>>,
    next_modifier_id: Cell<u64>,
    /// Emitted with the new usable geometry when a modifier changes it.
    pub usable_geometry_signal: Signal<Rectangle>,
    pub destroy_signal: Signal<()>,
}

impl Screen {
    pub(crate) fn new(
        id: u8,
        geometry: Rectangle,
        output: OutputInfo,
        modes: Vec<OutputMode>,
        current_mode: OutputMode,
        primary: Rc<PrimaryPlane>,
        cursor: Option<Rc<CursorPlane>>,
    ) -> Rc<Self> {
        assert!(id <= 31, "screen id {id} out of mask range");
        Rc::new(Self {
            id,
            geometry: Cell::new(geometry),
            usable_geometry: Cell::new(geometry),
            output,
            modes,
            current_mode: Cell::new(current_mode),
            primary,
            cursor,
            modifiers: RefCell::new(Vec::new()),
            next_modifier_id: Cell::new(0),
            usable_geometry_signal: Signal::new(),
            destroy_signal: Signal::new(),
        })
    }

    pub fn id(&self) -> ScreenId {
        ScreenId(self.id)
    }

    pub fn mask(&self) -> u32 {
        1 << self.id
    }

    pub fn geometry(&self) -> Rectangle {
        self.geometry.get()
    }

    pub fn usable_geometry(&self) -> Rectangle {
        self.usable_geometry.get()
    }

    pub fn output(&self) -> &OutputInfo {
        &self.output
    }

    pub fn modes(&self) -> &[OutputMode] {
        &self.modes
    }

    pub fn current_mode(&self) -> OutputMode {
        self.current_mode.get()
    }

    pub fn add_modifier(&self, modifier: Rc<dyn ScreenModifier>) -> ModifierId {
        let id = ModifierId(self.next_modifier_id.get());
        self.next_modifier_id.set(id.0 + 1);
        self.modifiers.borrow_mut().push((id, modifier));
        self.update_usable_geometry();
        id
    }

    pub fn remove_modifier(&self, id: ModifierId) {
        self.modifiers.borrow_mut().retain(|(mid, _)| *mid != id);
        self.update_usable_geometry();
    }

    pub fn update_usable_geometry(&self) {
        let geometry = self.geometry.get();
        let mut usable = geometry;
        for (_, modifier) in self.modifiers.borrow().iter() {
            modifier.modify(geometry, &mut usable);
        }
        if usable != self.usable_geometry.get() {
            debug!("screen {}: usable geometry now {usable:?}", self.id);
            self.usable_geometry.set(usable);
            self.usable_geometry_signal.emit(&usable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_struts_compose() {
        let geometry = Rectangle::new(0, 0, 1920, 1080);
        let mut usable = geometry;
        EdgeStrut {
            edge: Edge::Top,
            size: 24,
        }
        .modify(geometry, &mut usable);
        EdgeStrut {
            edge: Edge::Left,
            size: 48,
        }
        .modify(geometry, &mut usable);
        assert_eq!(usable, Rectangle::new(48, 24, 1872, 1056));
    }

    #[test]
    fn test_strut_does_not_underflow() {
        let geometry = Rectangle::new(0, 0, 100, 100);
        let mut usable = geometry;
        EdgeStrut {
            edge: Edge::Bottom,
            size: 500,
        }
        .modify(geometry, &mut usable);
        assert_eq!(usable.height, 0);
    }
}
