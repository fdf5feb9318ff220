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

//! Focus bookkeeping shared by the keyboard and the pointer. A focus holds
//! the focused view and partitions the bound protocol resources into the
//! *active* set (owned by the focused client) and the *inactive* rest.
//! Enter/leave delivery is the owner's job; this type only computes the
//! transitions.

use std::rc::Rc;

use crate::compositor::CompositorView;
use crate::protocol::ClientId;
use crate::protocol::InputResource;

/// Payload of the keyboard/pointer focus-changed signals.
#[derive(Clone)]
pub struct FocusChange {
    pub old: Option<Rc<CompositorView>>,
    pub new: Option<Rc<CompositorView>>,
}

/// The resource movements resulting from a focus change. `left` is the
/// previously-active set that must receive a leave event on `old_view`;
/// `entered` is the newly-active set that must receive an enter on
/// `new_view`.
pub struct FocusTransition<R: ?Sized> {
    pub old_view: Option<Rc<CompositorView>>,
    pub new_view: Option<Rc<CompositorView>>,
    pub left: Vec<Rc<R>>,
    pub entered: Vec<Rc<R>>,
}

pub struct InputFocus<R: ?Sized> {
    client: Option<ClientId>,
    view: Option<Rc<CompositorView>>,
    active: Vec<Rc<R>>,
    inactive: Vec<Rc<R>>,
}

impl<R: InputResource + ?Sized> InputFocus<R> {
    pub fn new() -> Self {
        Self {
            client: None,
            view: None,
            active: Vec::new(),
            inactive: Vec::new(),
        }
    }

    pub fn client(&self) -> Option<ClientId> {
        self.client
    }

    pub fn view(&self) -> Option<Rc<CompositorView>> {
        self.view.clone()
    }

    pub fn active(&self) -> &[Rc<R>] {
        &self.active
    }

    /// Registers a new resource. Returns true when the resource belongs to
    /// the focused client and therefore needs an immediate enter event.
    pub fn add_resource(&mut self, resource: Rc<R>) -> bool {
        let focused = self.client == Some(resource.client());
        if focused {
            self.active.push(resource);
        } else {
            self.inactive.push(resource);
        }
        focused
    }

    pub fn remove_resource(&mut self, resource: &Rc<R>) {
        self.active.retain(|r| !Rc::ptr_eq(r, resource));
        self.inactive.retain(|r| !Rc::ptr_eq(r, resource));
    }

    /// Refocuses onto `view`, repartitioning the resource lists. Returns
    /// None when the focus did not change.
    pub fn set(&mut self, view: Option<&Rc<CompositorView>>) -> Option<FocusTransition<R>> {
        match (&self.view, view) {
            (Some(a), Some(b)) if Rc::ptr_eq(a, b) => return None,
            (None, None) => return None,
            _ => {},
        }

        let old_view = self.view.take();
        let left = std::mem::take(&mut self.active);
        self.inactive.extend(left.iter().cloned());

        let (client, entered) = match view {
            Some(view) => {
                let client = view.surface().client();
                let mut entered = Vec::new();
                self.inactive.retain(|r| {
                    if r.client() == client {
                        entered.push(r.clone());
                        false
                    } else {
                        true
                    }
                });
                self.active = entered.clone();
                (Some(client), entered)
            },
            None => (None, Vec::new()),
        };

        self.client = client;
        self.view = view.cloned();

        Some(FocusTransition {
            old_view,
            new_view: self.view.clone(),
            left,
            entered,
        })
    }

    /// The focused view is being destroyed: forget it without delivering
    /// leave events (the view is already gone for the client).
    pub fn clear_destroyed_view(&mut self) {
        let active = std::mem::take(&mut self.active);
        self.inactive.extend(active);
        self.client = None;
        self.view = None;
    }
}

impl<R: InputResource + ?Sized> Default for InputFocus<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeResource(ClientId);

    impl InputResource for FakeResource {
        fn client(&self) -> ClientId {
            self.0
        }
    }

    #[test]
    fn test_resources_partition_by_client() {
        let mut focus: InputFocus<FakeResource> = InputFocus::new();
        assert!(!focus.add_resource(Rc::new(FakeResource(ClientId(1)))));
        assert!(!focus.add_resource(Rc::new(FakeResource(ClientId(2)))));
        assert!(focus.client().is_none());
        assert!(focus.active().is_empty());
    }

    #[test]
    fn test_remove_resource() {
        let mut focus: InputFocus<FakeResource> = InputFocus::new();
        let r = Rc::new(FakeResource(ClientId(1)));
        focus.add_resource(r.clone());
        focus.remove_resource(&r);
        assert!(focus.active().is_empty());
    }

    // Focus transitions against real views need a server; the partitioning
    // logic itself is covered above and via the data-device tests.
}
