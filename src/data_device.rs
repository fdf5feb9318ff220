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

//! The per-seat selection. A client's data source becomes the selection;
//! whenever the selection changes or keyboard focus crosses clients, a
//! fresh offer enumerating the source's mime types is advertised to the
//! focused client. Offers outliving their source go inert rather than
//! dangling: a stale `receive` is a no-op.

use std::cell::Cell;
use std::cell::RefCell;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::rc::Weak;

use crate::event::Signal;
use crate::event::SubscriptionId;
use crate::protocol::ClientId;
use crate::protocol::DataDeviceResource;
use crate::protocol::DataOfferResource;
use crate::protocol::DataSourceHandle;

/// A client-owned source of selection data.
pub struct DataSource {
    handle: Box<dyn DataSourceHandle>,
    mime_types: RefCell<Vec<String>>,
    /// Offers advertised from this source, to be disarmed on destruction.
    offers: RefCell<Vec<Weak<DataOffer>>>,
    pub destroy_signal: Signal<()>,
}

impl DataSource {
    pub fn new(handle: Box<dyn DataSourceHandle>) -> Rc<Self> {
        Rc::new(Self {
            handle,
            mime_types: RefCell::new(Vec::new()),
            offers: RefCell::new(Vec::new()),
            destroy_signal: Signal::new(),
        })
    }

    /// wl_data_source.offer: one more advertised mime type.
    pub fn add_mime_type(&self, mime_type: &str) {
        self.mime_types.borrow_mut().push(mime_type.to_string());
    }

    pub fn mime_types(&self) -> Vec<String> {
        self.mime_types.borrow().clone()
    }

    /// The client destroyed the source. Live offers are pointed at nothing
    /// so a misbehaving client using a stale offer cannot reach freed state.
    pub fn destroy(&self) {
        for offer in self.offers.borrow().iter() {
            if let Some(offer) = offer.upgrade() {
                offer.source.borrow_mut().take();
            }
        }
        self.destroy_signal.emit(&());
    }
}

/// An offer advertised to some client for the current selection.
pub struct DataOffer {
    source: RefCell<Option<Weak<DataSource>>>,
    resource: Rc<dyn DataOfferResource>,
}

impl DataOffer {
    fn new(source: &Rc<DataSource>, resource: Rc<dyn DataOfferResource>) -> Rc<Self> {
        let offer = Rc::new(Self {
            source: RefCell::new(Some(Rc::downgrade(source))),
            resource,
        });
        source.offers.borrow_mut().push(Rc::downgrade(&offer));
        offer
    }

    fn source(&self) -> Option<Rc<DataSource>> {
        self.source.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// wl_data_offer.accept. Inert on an expired offer.
    pub fn accept(&self, mime_type: Option<&str>) {
        if let Some(source) = self.source() {
            source.handle.target(mime_type);
        }
    }

    /// wl_data_offer.receive. Inert on an expired offer; the fd is dropped
    /// (closed) either way once the source is done with it.
    pub fn receive(&self, mime_type: &str, fd: OwnedFd) {
        if let Some(source) = self.source() {
            source.handle.send(mime_type, fd);
        }
    }
}

pub struct DataDevice {
    selection: RefCell<Option<Rc<DataSource>>>,
    selection_destroy: Cell<Option<SubscriptionId>>,
    resources: RefCell<Vec<Rc<dyn DataDeviceResource>>>,
    pub selection_changed: Signal<()>,
}

impl DataDevice {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            selection: RefCell::new(None),
            selection_destroy: Cell::new(None),
            resources: RefCell::new(Vec::new()),
            selection_changed: Signal::new(),
        })
    }

    pub fn bind(&self, resource: Rc<dyn DataDeviceResource>) {
        self.resources.borrow_mut().push(resource);
    }

    pub fn unbind(&self, resource: &Rc<dyn DataDeviceResource>) {
        self.resources
            .borrow_mut()
            .retain(|r| !Rc::ptr_eq(r, resource));
    }

    pub fn selection(&self) -> Option<Rc<DataSource>> {
        self.selection.borrow().clone()
    }

    /// wl_data_device.set_selection.
    pub fn set_selection(self: &Rc<Self>, source: Option<&Rc<DataSource>>) {
        {
            let current = self.selection.borrow();
            match (&*current, source) {
                (Some(a), Some(b)) if Rc::ptr_eq(a, b) => return,
                (None, None) => return,
                _ => {},
            }
        }

        if let Some(old) = self.selection.borrow_mut().take() {
            old.handle.cancelled();
            if let Some(sub) = self.selection_destroy.take() {
                old.destroy_signal.unsubscribe(sub);
            }
        }

        if let Some(source) = source {
            *self.selection.borrow_mut() = Some(source.clone());
            let device = Rc::downgrade(self);
            let sub = source.destroy_signal.subscribe(move |()| {
                if let Some(device) = device.upgrade() {
                    device.selection.borrow_mut().take();
                    device.selection_destroy.take();
                    device.selection_changed.emit(&());
                }
            });
            self.selection_destroy.set(Some(sub));
        }

        self.selection_changed.emit(&());
    }

    /// Advertises the current selection to `client`: a fresh offer carrying
    /// the source's mime types, or a nil selection when there is none. The
    /// returned offer belongs to the protocol adapter, which routes the
    /// client's accept/receive requests back through it.
    pub fn offer_selection(&self, client: ClientId) -> Option<Rc<DataOffer>> {
        let resource = self
            .resources
            .borrow()
            .iter()
            .find(|r| r.client() == client)
            .cloned();
        // A client with no data device has nothing to be told.
        let resource = resource?;

        match self.selection() {
            Some(source) => {
                let offer_resource = resource.new_offer();
                let offer = DataOffer::new(&source, offer_resource);
                for mime_type in source.mime_types() {
                    offer.resource.offer(&mime_type);
                }
                resource.selection(Some(&offer));
                Some(offer)
            },
            None => {
                resource.selection(None);
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::protocol::InputResource;

    #[derive(Default)]
    struct SourceLog {
        sent: RefCell<Vec<String>>,
        cancelled: Cell<bool>,
    }

    struct LoggingSource(Rc<SourceLog>);

    impl DataSourceHandle for LoggingSource {
        fn target(&self, _mime_type: Option<&str>) {}
        fn send(&self, mime_type: &str, _fd: OwnedFd) {
            self.0.sent.borrow_mut().push(mime_type.to_string());
        }
        fn cancelled(&self) {
            self.0.cancelled.set(true);
        }
    }

    #[derive(Default)]
    struct OfferLog {
        mime_types: RefCell<Vec<String>>,
    }

    struct LoggingOffer(Rc<OfferLog>);

    impl DataOfferResource for LoggingOffer {
        fn offer(&self, mime_type: &str) {
            self.0.mime_types.borrow_mut().push(mime_type.to_string());
        }
    }

    struct DeviceResource {
        client: ClientId,
        offers: RefCell<Vec<Rc<OfferLog>>>,
        selections: Cell<u32>,
        nil_selections: Cell<u32>,
    }

    impl DeviceResource {
        fn new(client: ClientId) -> Rc<Self> {
            Rc::new(Self {
                client,
                offers: RefCell::new(Vec::new()),
                selections: Cell::new(0),
                nil_selections: Cell::new(0),
            })
        }
    }

    impl InputResource for DeviceResource {
        fn client(&self) -> ClientId {
            self.client
        }
    }

    impl DataDeviceResource for DeviceResource {
        fn new_offer(&self) -> Rc<dyn DataOfferResource> {
            let log = Rc::new(OfferLog::default());
            self.offers.borrow_mut().push(log.clone());
            Rc::new(LoggingOffer(log))
        }
        fn selection(&self, offer: Option<&Rc<DataOffer>>) {
            match offer {
                Some(_) => self.selections.set(self.selections.get() + 1),
                None => self.nil_selections.set(self.nil_selections.get() + 1),
            }
        }
    }

    fn pipe_fd() -> OwnedFd {
        let (r, _w) = nix::unistd::pipe().unwrap();
        r
    }

    #[test]
    fn test_selection_flows_to_focused_client() {
        let device = DataDevice::new();
        let resource = DeviceResource::new(ClientId(2));
        device.bind(resource.clone());

        let log = Rc::new(SourceLog::default());
        let source = DataSource::new(Box::new(LoggingSource(log.clone())));
        source.add_mime_type("text/plain");
        device.set_selection(Some(&source));

        let offer = device.offer_selection(ClientId(2)).expect("offer expected");
        assert_eq!(resource.selections.get(), 1);
        assert_eq!(
            &*resource.offers.borrow()[0].mime_types.borrow(),
            &["text/plain".to_string()]
        );

        offer.receive("text/plain", pipe_fd());
        assert_eq!(&*log.sent.borrow(), &["text/plain".to_string()]);
    }

    #[test]
    fn test_client_without_data_device_gets_nothing() {
        let device = DataDevice::new();
        let source = DataSource::new(Box::new(LoggingSource(Rc::new(SourceLog::default()))));
        device.set_selection(Some(&source));
        assert!(device.offer_selection(ClientId(9)).is_none());
    }

    #[test]
    fn test_replacing_selection_cancels_the_old_source() {
        let device = DataDevice::new();
        let old_log = Rc::new(SourceLog::default());
        let old = DataSource::new(Box::new(LoggingSource(old_log.clone())));
        device.set_selection(Some(&old));
        // Setting the same source again is a no-op.
        device.set_selection(Some(&old));
        assert!(!old_log.cancelled.get());

        let new = DataSource::new(Box::new(LoggingSource(Rc::new(SourceLog::default()))));
        device.set_selection(Some(&new));
        assert!(old_log.cancelled.get());
    }

    #[test]
    fn test_stale_offer_is_inert_after_source_destruction() {
        let device = DataDevice::new();
        let resource = DeviceResource::new(ClientId(1));
        device.bind(resource);

        let log = Rc::new(SourceLog::default());
        let source = DataSource::new(Box::new(LoggingSource(log.clone())));
        source.add_mime_type("text/plain");
        device.set_selection(Some(&source));
        let offer = device.offer_selection(ClientId(1)).unwrap();

        source.destroy();
        offer.receive("text/plain", pipe_fd());
        offer.accept(Some("text/plain"));
        assert!(log.sent.borrow().is_empty());
        assert!(device.selection().is_none());
    }

    #[test]
    fn test_selection_changed_fires_on_source_destruction() {
        let device = DataDevice::new();
        let changes = Rc::new(Cell::new(0u32));
        let counter = changes.clone();
        device
            .selection_changed
            .subscribe(move |()| counter.set(counter.get() + 1));

        let source = DataSource::new(Box::new(LoggingSource(Rc::new(SourceLog::default()))));
        device.set_selection(Some(&source));
        assert_eq!(changes.get(), 1);
        source.destroy();
        assert_eq!(changes.get(), 2);
    }
}
