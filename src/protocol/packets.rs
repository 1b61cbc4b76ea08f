// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Typed payload layouts for multi-field commands.
//!
//! Single-byte and plain-text payloads are handled inline by the
//! dispatcher; the payloads here have enough structure that hand-parsing
//! them at the call site would scatter offset arithmetic around. Each type
//! round-trips through [`FromWire`]/[`ToWire`].

use crate::io::LeInt;
use crate::io::Read;
use crate::io::Write;
use crate::protocol::wire::Error;
use crate::protocol::wire::FromWire;
use crate::protocol::wire::ToWire;
use crate::protocol::DATA_BLOCK_LENGTH;
use crate::protocol::NODE_WRITE_CHUNK;
use crate::storage::NodeAddr;

use crate::hardware::nvm::UID_LENGTH;
use crate::hardware::nvm::UID_REQUEST_KEY_LENGTH;
use crate::hardware::CPZ_LENGTH;
use crate::hardware::CTR_NONCE_LENGTH;

impl FromWire for NodeAddr {
    fn from_wire<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        Ok(NodeAddr::from_raw(u16::read_from(&mut *r)?))
    }
}

impl ToWire for NodeAddr {
    fn to_wire<W: Write>(&self, mut w: W) -> Result<(), Error> {
        w.write_le(self.raw())?;
        Ok(())
    }
}

/// The `SetFavorite` payload: a slot and the pair to store in it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SetFavoriteRequest {
    /// The favorite slot to write.
    pub slot: u8,
    /// The parent node of the favorite.
    pub parent: NodeAddr,
    /// The child node of the favorite.
    pub child: NodeAddr,
}

impl FromWire for SetFavoriteRequest {
    fn from_wire<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let slot = u8::read_from(&mut *r)?;
        let parent = NodeAddr::from_wire(r)?;
        let child = NodeAddr::from_wire(r)?;
        Ok(Self {
            slot,
            parent,
            child,
        })
    }
}

impl ToWire for SetFavoriteRequest {
    fn to_wire<W: Write>(&self, mut w: W) -> Result<(), Error> {
        w.write_le(self.slot)?;
        self.parent.to_wire(&mut w)?;
        self.child.to_wire(&mut w)?;
        Ok(())
    }
}

/// A `(parent, child)` address pair, as stored in a favorite slot and
/// returned by `GetFavorite`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FavoritePair {
    /// The parent node address.
    pub parent: NodeAddr,
    /// The child node address.
    pub child: NodeAddr,
}

impl FavoritePair {
    /// The unset pair: both addresses null.
    pub const EMPTY: Self = Self {
        parent: NodeAddr::NULL,
        child: NodeAddr::NULL,
    };
}

impl FromWire for FavoritePair {
    fn from_wire<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let parent = NodeAddr::from_wire(r)?;
        let child = NodeAddr::from_wire(r)?;
        Ok(Self { parent, child })
    }
}

impl ToWire for FavoritePair {
    fn to_wire<W: Write>(&self, mut w: W) -> Result<(), Error> {
        self.parent.to_wire(&mut w)?;
        self.child.to_wire(&mut w)?;
        Ok(())
    }
}

/// One packet of a multi-packet `WriteNode` sequence.
///
/// The target address repeats in every packet; `index` orders the packets
/// and selects the staging offset. The final packet of a sequence carries
/// index `NODE_LENGTH / NODE_WRITE_CHUNK` and triggers the page commit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NodeWritePacket {
    /// The node being written.
    pub addr: NodeAddr,
    /// The packet sub-index within the sequence.
    pub index: u8,
    /// Number of valid bytes in `data`.
    pub len: u8,
    /// The packet's chunk of node bytes.
    pub data: [u8; NODE_WRITE_CHUNK],
}

impl NodeWritePacket {
    /// Returns the valid portion of the chunk.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

impl FromWire for NodeWritePacket {
    fn from_wire<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let addr = NodeAddr::from_wire(r)?;
        let index = u8::read_from(&mut *r)?;

        let n = r.remaining_data();
        if n > NODE_WRITE_CHUNK {
            return Err(Error::OutOfRange);
        }
        let mut data = [0; NODE_WRITE_CHUNK];
        r.read_bytes(&mut data[..n])?;

        Ok(Self {
            addr,
            index,
            len: n as u8,
            data,
        })
    }
}

impl ToWire for NodeWritePacket {
    fn to_wire<W: Write>(&self, mut w: W) -> Result<(), Error> {
        self.addr.to_wire(&mut w)?;
        w.write_le(self.index)?;
        w.write_bytes(self.bytes())?;
        Ok(())
    }
}

/// The `WriteDataBlock` payload: a last-block marker and one 32-byte block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DataBlockWrite {
    /// Whether this is the final block of the service's data.
    pub last: bool,
    /// The block contents.
    pub block: [u8; DATA_BLOCK_LENGTH],
}

impl FromWire for DataBlockWrite {
    fn from_wire<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let last = u8::read_from(&mut *r)? != 0;
        let mut block = [0; DATA_BLOCK_LENGTH];
        r.read_bytes(&mut block)?;
        Ok(Self { last, block })
    }
}

impl ToWire for DataBlockWrite {
    fn to_wire<W: Write>(&self, mut w: W) -> Result<(), Error> {
        w.write_le(u8::from(self.last))?;
        w.write_bytes(&self.block)?;
        Ok(())
    }
}

/// A CPZ → CTR-nonce pairing, as carried by `AddCpzCtr` and returned by
/// `GetCpzCtr`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CpzCtrEntry {
    /// The card's code protected zone.
    pub cpz: [u8; CPZ_LENGTH],
    /// The CTR nonce tied to that card.
    pub nonce: [u8; CTR_NONCE_LENGTH],
}

impl FromWire for CpzCtrEntry {
    fn from_wire<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let mut cpz = [0; CPZ_LENGTH];
        r.read_bytes(&mut cpz)?;
        let mut nonce = [0; CTR_NONCE_LENGTH];
        r.read_bytes(&mut nonce)?;
        Ok(Self { cpz, nonce })
    }
}

impl ToWire for CpzCtrEntry {
    fn to_wire<W: Write>(&self, mut w: W) -> Result<(), Error> {
        w.write_bytes(&self.cpz)?;
        w.write_bytes(&self.nonce)?;
        Ok(())
    }
}

/// The `SetUid` payload: the one-time request key and the UID it guards.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UidProvision {
    /// The request key later presented to `GetUid`.
    pub request_key: [u8; UID_REQUEST_KEY_LENGTH],
    /// The device UID.
    pub uid: [u8; UID_LENGTH],
}

impl FromWire for UidProvision {
    fn from_wire<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let mut request_key = [0; UID_REQUEST_KEY_LENGTH];
        r.read_bytes(&mut request_key)?;
        let mut uid = [0; UID_LENGTH];
        r.read_bytes(&mut uid)?;
        Ok(Self { request_key, uid })
    }
}

impl ToWire for UidProvision {
    fn to_wire<W: Write>(&self, mut w: W) -> Result<(), Error> {
        w.write_bytes(&self.request_key)?;
        w.write_bytes(&self.uid)?;
        Ok(())
    }
}
