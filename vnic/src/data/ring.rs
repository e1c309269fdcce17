//! Ring cursor arithmetic and buffer slot ownership.

use std::marker::PhantomData;

use crate::error::{Result, VnicError};

/// Cursor arithmetic over a power-of-two ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    size: u32,
    mask: u32,
}

impl Ring {
    pub fn new(size: u32) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(VnicError::Config(format!(
                "ring size {size} is not a power of two"
            )));
        }
        Ok(Self {
            size,
            mask: size - 1,
        })
    }

    pub const fn size(&self) -> u32 {
        self.size
    }

    /// `(index + k) mod size`.
    pub const fn advance(&self, index: u32, k: u32) -> u32 {
        index.wrapping_add(k) & self.mask
    }
}

/// Slot is owned by the host and may be offered to the peer.
#[derive(Debug)]
pub struct Free;
/// Slot has been advertised to the peer, which may write into it.
#[derive(Debug)]
pub struct Posted;
/// Slot holds a received frame handed upstream.
#[derive(Debug)]
pub struct Delivered;

/// Ownership token for one receive buffer. Transitions consume the token,
/// so a slot cannot be posted twice or recycled while still posted.
#[derive(Debug)]
pub struct BufferSlot<S> {
    index: u32,
    _state: PhantomData<S>,
}

impl<S> BufferSlot<S> {
    pub fn index(&self) -> u32 {
        self.index
    }

    fn to<T>(self) -> BufferSlot<T> {
        BufferSlot {
            index: self.index,
            _state: PhantomData,
        }
    }
}

impl BufferSlot<Free> {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            _state: PhantomData,
        }
    }

    pub fn post(self) -> BufferSlot<Posted> {
        self.to()
    }
}

impl BufferSlot<Posted> {
    pub fn deliver(self) -> BufferSlot<Delivered> {
        self.to()
    }

    /// Take back a slot the peer never filled.
    pub fn reclaim(self) -> BufferSlot<Free> {
        self.to()
    }
}

impl BufferSlot<Delivered> {
    pub fn release(self) -> BufferSlot<Free> {
        self.to()
    }
}
