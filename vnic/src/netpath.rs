//! A failover slot holding at most one viport.

use std::sync::Arc;

use crate::types::{LinkIndication, MacAddress, NetpathKind, PathKey, PathRecord};
use crate::viport::Viport;

#[derive(Debug)]
pub struct Netpath {
    kind: NetpathKind,
    viport: Option<Arc<Viport>>,
    connected: bool,
    link_up: bool,
    mtu: u16,
    mac: MacAddress,
    last_failed: Option<PathKey>,
    reconnect_pending: bool,
}

impl Netpath {
    pub fn new(kind: NetpathKind) -> Self {
        Self {
            kind,
            viport: None,
            connected: false,
            link_up: false,
            mtu: 0,
            mac: MacAddress::ZERO,
            last_failed: None,
            reconnect_pending: false,
        }
    }

    pub fn kind(&self) -> NetpathKind {
        self.kind
    }

    pub fn viport(&self) -> Option<&Arc<Viport>> {
        self.viport.as_ref()
    }

    pub fn path(&self) -> Option<&PathRecord> {
        self.viport.as_deref().map(Viport::path)
    }

    pub fn path_key(&self) -> Option<PathKey> {
        self.path().map(PathRecord::key)
    }

    /// Whether `generation` names the viport currently held.
    pub fn holds(&self, generation: u64) -> bool {
        self.viport
            .as_ref()
            .is_some_and(|v| v.generation() == generation)
    }

    pub fn attach(&mut self, viport: Arc<Viport>) {
        self.viport = Some(viport);
        self.connected = false;
        self.link_up = false;
    }

    /// Release the viport. The caller decides whether to shut it down.
    pub fn detach(&mut self) -> Option<Arc<Viport>> {
        self.connected = false;
        self.link_up = false;
        self.viport.take()
    }

    /// The held viport finished bring-up.
    pub fn on_connected(&mut self, link: LinkIndication) {
        self.connected = true;
        self.on_link(link);
    }

    pub fn on_link(&mut self, link: LinkIndication) {
        self.link_up = link.up;
        self.mtu = link.mtu;
        self.mac = link.mac;
    }

    /// A viport is held, has completed bring-up and has not failed since.
    pub fn is_connected(&self) -> bool {
        self.viport.is_some() && self.connected
    }

    pub fn carrier(&self) -> bool {
        self.is_connected() && self.link_up
    }

    pub fn link(&self) -> LinkIndication {
        LinkIndication {
            up: self.carrier(),
            mtu: self.mtu,
            mac: self.mac,
        }
    }

    pub fn last_failed(&self) -> Option<PathKey> {
        self.last_failed
    }

    pub fn set_last_failed(&mut self, key: Option<PathKey>) {
        self.last_failed = key;
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn set_reconnect_pending(&mut self, pending: bool) {
        self.reconnect_pending = pending;
    }
}
