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

//! Typed fan-out signals. Emitters own a `Signal<T>` per event; subscribers
//! register closures and keep the returned id for removal. Delivery is
//! synchronous. The listener list is snapshotted before dispatch, so
//! emitting, subscribing, or unsubscribing from inside a listener is safe;
//! listeners added during an emit are first called on the next emit.

use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SubscriptionId(u64);

pub struct Signal<T> {
    next_id: Cell<u64>,
    listeners: RefCell<Vec<(SubscriptionId, Rc<dyn Fn(&T)>)>>,
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({} listeners)", self.listeners.borrow().len())
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(0),
            listeners: RefCell::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners.borrow_mut().push((id, Rc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.borrow_mut().retain(|(lid, _)| *lid != id);
    }

    pub fn emit(&self, data: &T) {
        let snapshot: Vec<Rc<dyn Fn(&T)>> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_emit_reaches_all_listeners() {
        let signal = Signal::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            signal.subscribe(move |v: &u32| seen.borrow_mut().push((i, *v)));
        }
        signal.emit(&7);
        assert_eq!(&*seen.borrow(), &[(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_unsubscribe() {
        let signal = Signal::new();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let id = signal.subscribe(move |_: &()| c.set(c.get() + 1));
        signal.emit(&());
        signal.unsubscribe(id);
        signal.emit(&());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_subscribe_during_emit_is_deferred() {
        let signal = Rc::new(Signal::new());
        let count = Rc::new(Cell::new(0));
        {
            let signal2 = signal.clone();
            let count = count.clone();
            signal.subscribe(move |_: &()| {
                let count = count.clone();
                signal2.subscribe(move |_: &()| count.set(count.get() + 1));
            });
        }
        signal.emit(&());
        assert_eq!(count.get(), 0);
        signal.emit(&());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_emit_during_emit() {
        let signal = Rc::new(Signal::new());
        let depth = Rc::new(Cell::new(0));
        let calls = Rc::new(Cell::new(0));
        {
            let signal2 = signal.clone();
            let depth = depth.clone();
            let calls = calls.clone();
            signal.subscribe(move |_: &()| {
                calls.set(calls.get() + 1);
                if depth.get() == 0 {
                    depth.set(1);
                    signal2.emit(&());
                }
            });
        }
        signal.emit(&());
        assert_eq!(calls.get(), 2);
    }
}
