// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Flash-resident node records.
//!
//! Every record in the credential store occupies one 132-byte slot; a
//! 1056-byte flash page holds eight of them. A slot is addressed by a
//! [`NodeAddr`], a packed `(page, slot)` pair, and starts with a
//! [`NodeFlags`] word that encodes occupancy, the record kind and the
//! owning user. Erased flash reads as all ones, which the flags layout
//! deliberately decodes as "free slot".
//!
//! The three record kinds form the store's hierarchy: [`ParentNode`]s name
//! a service and chain into a per-user doubly linked list; [`ChildNode`]s
//! hold one credential under a parent; [`DataNode`]s hold 32-byte opaque
//! blocks in a singly linked chain under a data-typed parent.
//!
//! All records are [`zerocopy`] types so they can be transmuted directly
//! from the bytes read out of a page, with the layout checked at compile
//! time.

use static_assertions::const_assert_eq;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::crypto::CTR_LENGTH;
use crate::protocol::DESCRIPTION_LENGTH;
use crate::protocol::LOGIN_LENGTH;
use crate::protocol::PASSWORD_LENGTH;
use crate::protocol::SERVICE_LENGTH;

/// Size in bytes of one node slot.
pub const NODE_LENGTH: usize = 132;

/// Node slots per flash page.
pub const NODES_PER_PAGE: u16 = 8;

/// Size in bytes of one flash page.
pub const BYTES_PER_PAGE: usize = NODE_LENGTH * NODES_PER_PAGE as usize;

/// Payload bytes in one [`DataNode`].
pub const DATA_NODE_CAPACITY: usize = 128;

/// 32-byte blocks per [`DataNode`].
pub const BLOCKS_PER_DATA_NODE: u8 = 4;

/// Number of favorite slots per user.
pub const FAVORITE_COUNT: u8 = 16;

/// Number of user profiles the store supports (one per user-id nibble).
pub const USER_COUNT: u8 = 16;

/// The address of a node slot: page number in the high 13 bits, slot
/// within the page in the low 3.
///
/// Address zero is the null sentinel. It can never collide with a real
/// node because page 0 is part of the user-profile region.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, AsBytes,
    FromBytes,
)]
#[repr(transparent)]
pub struct NodeAddr(u16);

impl NodeAddr {
    /// The "no node" sentinel.
    pub const NULL: Self = Self(0);

    /// Builds an address from a page/slot pair.
    pub fn new(page: u16, slot: u8) -> Self {
        Self((page << 3) | u16::from(slot & 0b111))
    }

    /// Reinterprets a raw wire value as an address.
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw wire value.
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Returns the page this address lives on.
    pub fn page(self) -> u16 {
        self.0 >> 3
    }

    /// Returns the slot within the page.
    pub fn slot(self) -> u8 {
        (self.0 & 0b111) as u8
    }

    /// Returns whether this is the null sentinel.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the byte offset of this slot within its page.
    pub fn page_offset(self) -> usize {
        usize::from(self.slot()) * NODE_LENGTH
    }
}

/// The kind of record occupying a slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// A service parent.
    Parent,
    /// A credential child.
    Child,
    /// A data-block node.
    Data,
}

/// Whether a parent names a credential service or a generic data service.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    /// A login/password credential service.
    Credential,
    /// An opaque data service.
    Data,
}

/// A node's flag word.
///
/// Layout, chosen so that erased flash (all ones) decodes as a free slot:
///
/// ```text
/// bit 15    : free marker (1 = free / erased, 0 = occupied)
/// bits 14-13: record kind (00 parent, 01 child, 10 data)
/// bit 12    : service kind on parents (0 credential, 1 data)
/// bits 11-8 : owning user id
/// bits 7-0  : kind-specific (data nodes: valid 32-byte block count)
/// ```
#[derive(
    Copy, Clone, PartialEq, Eq, Debug, AsBytes, FromBytes,
)]
#[repr(transparent)]
pub struct NodeFlags(u16);

const FLAG_FREE: u16 = 1 << 15;
const KIND_SHIFT: u16 = 13;
const KIND_MASK: u16 = 0b11 << KIND_SHIFT;
const FLAG_DATA_SERVICE: u16 = 1 << 12;
const USER_SHIFT: u16 = 8;
const USER_MASK: u16 = 0b1111 << USER_SHIFT;
const AUX_MASK: u16 = 0x00ff;

impl NodeFlags {
    /// Flags for a new parent node.
    pub fn parent(user: u8, service: ServiceKind) -> Self {
        let mut bits = (u16::from(user) << USER_SHIFT) & USER_MASK;
        if service == ServiceKind::Data {
            bits |= FLAG_DATA_SERVICE;
        }
        Self(bits)
    }

    /// Flags for a new credential child node.
    pub fn child(user: u8) -> Self {
        Self(
            (0b01 << KIND_SHIFT)
                | ((u16::from(user) << USER_SHIFT) & USER_MASK),
        )
    }

    /// Flags for a new data node holding `blocks` valid blocks.
    pub fn data(user: u8, blocks: u8) -> Self {
        Self(
            (0b10 << KIND_SHIFT)
                | ((u16::from(user) << USER_SHIFT) & USER_MASK)
                | (u16::from(blocks) & AUX_MASK),
        )
    }

    /// Reinterprets a raw flag word.
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw flag word.
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Returns whether the slot is free (erased or never claimed).
    pub fn is_free(self) -> bool {
        self.0 & FLAG_FREE != 0
    }

    /// Returns the record kind, or `None` for a free slot or a corrupt
    /// kind encoding.
    pub fn kind(self) -> Option<NodeKind> {
        if self.is_free() {
            return None;
        }
        match (self.0 & KIND_MASK) >> KIND_SHIFT {
            0b00 => Some(NodeKind::Parent),
            0b01 => Some(NodeKind::Child),
            0b10 => Some(NodeKind::Data),
            _ => None,
        }
    }

    /// Returns a parent's service kind.
    pub fn service_kind(self) -> ServiceKind {
        if self.0 & FLAG_DATA_SERVICE != 0 {
            ServiceKind::Data
        } else {
            ServiceKind::Credential
        }
    }

    /// Returns the owning user id.
    pub fn user(self) -> u8 {
        ((self.0 & USER_MASK) >> USER_SHIFT) as u8
    }

    /// Returns the kind-specific low byte.
    pub fn aux(self) -> u8 {
        (self.0 & AUX_MASK) as u8
    }

    /// Returns these flags with the low byte replaced.
    pub fn with_aux(self, aux: u8) -> Self {
        Self((self.0 & !AUX_MASK) | u16::from(aux))
    }

    /// Returns these flags claimed for `user`: free marker cleared, user
    /// field replaced. Used when stamping ownership onto a raw node write.
    pub fn claimed_by(self, user: u8) -> Self {
        Self(
            (self.0 & !(FLAG_FREE | USER_MASK))
                | ((u16::from(user) << USER_SHIFT) & USER_MASK),
        )
    }
}

/// Copies `src` into the fixed text field `dst`, zero-filling the rest.
///
/// The final byte of `dst` is always forced to NUL, so a field read back
/// with [`text_of`] is bounded even if `src` filled the whole field.
pub fn copy_text(dst: &mut [u8], src: &[u8]) {
    for b in dst.iter_mut() {
        *b = 0;
    }
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src[..n]);
}

/// Returns the valid portion of a NUL-terminated text field.
pub fn text_of(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// A service parent node.
///
/// Parents of one user and one service kind form a doubly linked list
/// threaded through `prev`/`next`, entered via the user profile's
/// starting-parent pointer. `first_child` heads the service's child (or
/// data-node) chain.
#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct ParentNode {
    /// The slot's flag word.
    pub flags: NodeFlags,
    /// Previous parent in the sibling chain.
    pub prev: NodeAddr,
    /// Next parent in the sibling chain.
    pub next: NodeAddr,
    /// First child (credential) or data node of this service.
    pub first_child: NodeAddr,
    /// The service name, lower-cased, NUL-terminated.
    pub service: [u8; SERVICE_LENGTH],
    /// Reserved. Data parents keep their chain's CTR seed in the first
    /// three bytes.
    pub reserved: [u8; 66],
}
const_assert_eq!(core::mem::size_of::<ParentNode>(), NODE_LENGTH);

impl ParentNode {
    /// A blank parent owned by `user`, named `service`.
    pub fn new(user: u8, kind: ServiceKind, service: &[u8]) -> Self {
        let mut node = Self {
            flags: NodeFlags::parent(user, kind),
            prev: NodeAddr::NULL,
            next: NodeAddr::NULL,
            first_child: NodeAddr::NULL,
            service: [0; SERVICE_LENGTH],
            reserved: [0; 66],
        };
        copy_text(&mut node.service, service);
        node
    }

    /// Returns the service name, NUL stripped.
    pub fn service_name(&self) -> &[u8] {
        text_of(&self.service)
    }

    /// Returns the data chain's CTR seed.
    pub fn data_ctr(&self) -> [u8; CTR_LENGTH] {
        [self.reserved[0], self.reserved[1], self.reserved[2]]
    }

    /// Stores the data chain's CTR seed.
    pub fn set_data_ctr(&mut self, ctr: &[u8; CTR_LENGTH]) {
        self.reserved[..CTR_LENGTH].copy_from_slice(ctr);
    }
}

/// A credential child node.
#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct ChildNode {
    /// The slot's flag word.
    pub flags: NodeFlags,
    /// Previous child in the sibling chain.
    pub prev: NodeAddr,
    /// Next child in the sibling chain.
    pub next: NodeAddr,
    /// Free-form description, NUL-terminated.
    pub description: [u8; DESCRIPTION_LENGTH],
    /// Packed date the credential was created.
    pub date_created: u16,
    /// Packed date the credential was last used.
    pub date_last_used: u16,
    /// CTR value the password field is enciphered under.
    pub ctr: [u8; CTR_LENGTH],
    /// The login, NUL-terminated.
    pub login: [u8; LOGIN_LENGTH],
    /// The password field, enciphered; full field, no terminator.
    pub password: [u8; PASSWORD_LENGTH],
}
const_assert_eq!(core::mem::size_of::<ChildNode>(), NODE_LENGTH);

impl ChildNode {
    /// A blank child owned by `user`, stamped with `date`.
    pub fn new(user: u8, date: u16) -> Self {
        Self {
            flags: NodeFlags::child(user),
            prev: NodeAddr::NULL,
            next: NodeAddr::NULL,
            description: [0; DESCRIPTION_LENGTH],
            date_created: date,
            date_last_used: date,
            ctr: [0; CTR_LENGTH],
            login: [0; LOGIN_LENGTH],
            password: [0; PASSWORD_LENGTH],
        }
    }

    /// Returns the login, NUL stripped.
    pub fn login_name(&self) -> &[u8] {
        text_of(&self.login)
    }

    /// Returns the description, NUL stripped.
    pub fn description_text(&self) -> &[u8] {
        text_of(&self.description)
    }
}

/// A data-block node: up to four 32-byte enciphered blocks.
#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct DataNode {
    /// The slot's flag word; the low byte counts valid blocks.
    pub flags: NodeFlags,
    /// Next data node in the chain.
    pub next: NodeAddr,
    /// Block storage.
    pub data: [u8; DATA_NODE_CAPACITY],
}
const_assert_eq!(core::mem::size_of::<DataNode>(), NODE_LENGTH);

impl DataNode {
    /// An empty data node owned by `user`.
    pub fn new(user: u8) -> Self {
        Self {
            flags: NodeFlags::data(user, 0),
            next: NodeAddr::NULL,
            data: [0; DATA_NODE_CAPACITY],
        }
    }

    /// Returns the number of valid blocks.
    pub fn block_count(&self) -> u8 {
        self.flags.aux().min(BLOCKS_PER_DATA_NODE)
    }

    /// Returns block `index`.
    pub fn block(&self, index: u8) -> &[u8] {
        let start = usize::from(index) * 32;
        &self.data[start..start + 32]
    }

    /// Overwrites block `index` and bumps the valid-block count to cover
    /// it.
    pub fn set_block(&mut self, index: u8, block: &[u8; 32]) {
        let start = usize::from(index) * 32;
        self.data[start..start + 32].copy_from_slice(block);
        if index + 1 > self.block_count() {
            self.flags = self.flags.with_aux(index + 1);
        }
    }
}

/// One favorite slot in a user profile.
#[derive(Copy, Clone, PartialEq, Eq, Debug, AsBytes, FromBytes)]
#[repr(C)]
pub struct FavoriteEntry {
    /// The favorite's parent node.
    pub parent: NodeAddr,
    /// The favorite's child node.
    pub child: NodeAddr,
}

impl FavoriteEntry {
    /// The unset entry.
    pub const EMPTY: Self = Self {
        parent: NodeAddr::NULL,
        child: NodeAddr::NULL,
    };
}

/// A per-user profile record, slot-sized so the profile region is just the
/// first two pages of the node layout (eight profiles per page, sixteen
/// users).
#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct UserProfile {
    /// Head of the user's credential parent chain.
    pub starting_parent: NodeAddr,
    /// Head of the user's data parent chain.
    pub data_starting_parent: NodeAddr,
    /// The profile CTR seed new encipherments draw from.
    pub ctr: [u8; CTR_LENGTH],
    /// Padding to keep `favorites` aligned.
    pub _pad: u8,
    /// The favorite slots.
    pub favorites: [FavoriteEntry; FAVORITE_COUNT as usize],
    /// Reserved for future profile fields.
    pub reserved: [u8; 60],
}
const_assert_eq!(core::mem::size_of::<UserProfile>(), NODE_LENGTH);

impl UserProfile {
    /// A blank profile.
    pub fn blank() -> Self {
        Self {
            starting_parent: NodeAddr::NULL,
            data_starting_parent: NodeAddr::NULL,
            ctr: [0; CTR_LENGTH],
            _pad: 0,
            favorites: [FavoriteEntry::EMPTY; FAVORITE_COUNT as usize],
            reserved: [0; 60],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn addr_packing() {
        let addr = NodeAddr::new(0x12, 5);
        assert_eq!(addr.page(), 0x12);
        assert_eq!(addr.slot(), 5);
        assert_eq!(addr.page_offset(), 5 * NODE_LENGTH);
        assert!(!addr.is_null());
        assert!(NodeAddr::NULL.is_null());
        assert_eq!(NodeAddr::from_raw(addr.raw()), addr);
    }

    #[test]
    fn erased_flash_is_free() {
        let flags = NodeFlags::from_raw(0xffff);
        assert!(flags.is_free());
        assert_eq!(flags.kind(), None);
    }

    #[test]
    fn flags_fields() {
        let flags = NodeFlags::parent(3, ServiceKind::Data);
        assert!(!flags.is_free());
        assert_eq!(flags.kind(), Some(NodeKind::Parent));
        assert_eq!(flags.service_kind(), ServiceKind::Data);
        assert_eq!(flags.user(), 3);

        let flags = NodeFlags::data(9, 2).with_aux(3);
        assert_eq!(flags.kind(), Some(NodeKind::Data));
        assert_eq!(flags.user(), 9);
        assert_eq!(flags.aux(), 3);

        let claimed = NodeFlags::from_raw(0xffff).claimed_by(5);
        assert!(!claimed.is_free());
        assert_eq!(claimed.user(), 5);
    }

    #[test]
    fn text_fields() {
        let mut parent = ParentNode::new(1, ServiceKind::Credential, b"example.com");
        assert_eq!(parent.service_name(), b"example.com");

        // Oversized input is truncated and stays NUL-terminated.
        copy_text(&mut parent.service, &[b'x'; 100]);
        assert_eq!(parent.service_name().len(), SERVICE_LENGTH - 1);
        assert_eq!(parent.service[SERVICE_LENGTH - 1], 0);
    }

    #[test]
    fn data_node_blocks() {
        let mut node = DataNode::new(0);
        assert_eq!(node.block_count(), 0);
        node.set_block(0, &[0xaa; 32]);
        node.set_block(1, &[0xbb; 32]);
        assert_eq!(node.block_count(), 2);
        assert_eq!(node.block(1), &[0xbb; 32]);
    }
}
