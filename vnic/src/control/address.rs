//! Host copy of the controller's address table and its batched
//! synchronization through configure-addresses.

use crate::error::{Result, VnicError};
use crate::protocol::{
    AddressOp, AddressOperation, Command, ConfigAddresses, MAX_ADDRESS_OPS_PER_PACKET,
};
use crate::types::MacAddress;

pub const BROADCAST_INDEX: u16 = 0;
pub const UNICAST_INDEX: u16 = 1;
pub const FIRST_MULTICAST_INDEX: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressEntry {
    pub mac: MacAddress,
    pub vlan: u16,
    pub valid: bool,
    dirty: bool,
}

/// Whether multicast filtering is exact or has fallen back to receiving all
/// multicast traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastMode {
    Exact,
    Overflow,
}

#[derive(Debug)]
pub struct AddressTable {
    lan_switch: u8,
    entries: Vec<AddressEntry>,
    in_flight: Vec<u16>,
    overflow: bool,
}

impl AddressTable {
    /// Table of `capacity` entries with broadcast and `unicast` installed.
    pub fn new(capacity: u16, lan_switch: u8, unicast: MacAddress, vlan: u16) -> Self {
        let mut entries = vec![AddressEntry::default(); capacity.max(FIRST_MULTICAST_INDEX) as usize];
        entries[BROADCAST_INDEX as usize] = AddressEntry {
            mac: MacAddress::BROADCAST,
            vlan,
            valid: true,
            dirty: true,
        };
        entries[UNICAST_INDEX as usize] = AddressEntry {
            mac: unicast,
            vlan,
            valid: !unicast.is_zero(),
            dirty: true,
        };
        Self {
            lan_switch,
            entries,
            in_flight: Vec::new(),
            overflow: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn multicast_capacity(&self) -> usize {
        self.entries.len() - FIRST_MULTICAST_INDEX as usize
    }

    fn update(&mut self, index: usize, mac: MacAddress, vlan: u16, valid: bool) {
        let e = &mut self.entries[index];
        if e.mac != mac || e.vlan != vlan || e.valid != valid {
            e.mac = mac;
            e.vlan = vlan;
            e.valid = valid;
            e.dirty = true;
        }
    }

    /// Replace the multicast entries with `list`. A list larger than the
    /// table withdraws every multicast entry and reports overflow.
    pub fn set_multicast(&mut self, list: &[MacAddress]) -> MulticastMode {
        let vlan = self.entries[BROADCAST_INDEX as usize].vlan;
        let first = FIRST_MULTICAST_INDEX as usize;
        if list.len() > self.multicast_capacity() {
            for i in first..self.entries.len() {
                self.update(i, MacAddress::ZERO, vlan, false);
            }
            self.overflow = true;
            return MulticastMode::Overflow;
        }
        for i in first..self.entries.len() {
            match list.get(i - first) {
                Some(mac) => self.update(i, *mac, vlan, true),
                None => {
                    let e = self.entries[i];
                    self.update(i, e.mac, vlan, false);
                }
            }
        }
        self.overflow = false;
        MulticastMode::Exact
    }

    pub fn multicast_mode(&self) -> MulticastMode {
        if self.overflow {
            MulticastMode::Overflow
        } else {
            MulticastMode::Exact
        }
    }

    /// True while modified entries remain to be sent or a batch is in flight.
    pub fn has_pending(&self) -> bool {
        !self.in_flight.is_empty() || self.entries.iter().any(|e| e.dirty)
    }

    /// Take the next batch of at most 16 modified entries, lowest index
    /// first. Returns `None` if nothing is pending or a batch is in flight.
    pub fn next_batch(&mut self) -> Option<ConfigAddresses> {
        if !self.in_flight.is_empty() {
            return None;
        }
        let mut ops = Vec::with_capacity(MAX_ADDRESS_OPS_PER_PACKET);
        for (i, e) in self.entries.iter_mut().enumerate() {
            if ops.len() == MAX_ADDRESS_OPS_PER_PACKET {
                break;
            }
            if e.dirty {
                e.dirty = false;
                ops.push(AddressOp {
                    index: i as u16,
                    operation: AddressOperation::Set,
                    valid: e.valid,
                    mac: e.mac,
                    vlan: e.vlan,
                });
            }
        }
        if ops.is_empty() {
            return None;
        }
        self.in_flight = ops.iter().map(|op| op.index).collect();
        Some(ConfigAddresses {
            lan_switch: self.lan_switch,
            ops,
        })
    }

    /// Validate the response to the in-flight batch. A rejected response
    /// puts the batch's entries back up for sending.
    pub fn complete_batch(&mut self, rsp: &ConfigAddresses) -> Result<()> {
        if self.in_flight.is_empty() {
            return Err(VnicError::ProtocolMismatch {
                command: Command::ConfigAddresses,
                reason: "response without a batch in flight".into(),
            });
        }
        if let Err(e) = self.check_batch(rsp) {
            self.requeue_in_flight();
            return Err(e);
        }
        self.in_flight.clear();
        Ok(())
    }

    fn check_batch(&self, rsp: &ConfigAddresses) -> Result<()> {
        let invalid = |reason: String| VnicError::InvalidResponse {
            command: Command::ConfigAddresses,
            reason,
        };
        if rsp.lan_switch != self.lan_switch {
            return Err(invalid(format!(
                "lan switch {} does not match {}",
                rsp.lan_switch, self.lan_switch
            )));
        }
        let sent = &self.in_flight;
        if rsp.ops.len() != sent.len() {
            return Err(invalid(format!(
                "{} entries answered, {} sent",
                rsp.ops.len(),
                sent.len()
            )));
        }
        for (op, index) in rsp.ops.iter().zip(sent) {
            if op.index != *index {
                return Err(invalid(format!("wrong index {} (expected {index})", op.index)));
            }
        }
        Ok(())
    }

    fn requeue_in_flight(&mut self) {
        for index in std::mem::take(&mut self.in_flight) {
            self.entries[index as usize].dirty = true;
        }
    }
}
