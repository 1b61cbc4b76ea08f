// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Operations over the node arena.
//!
//! [`NodeStore`] wraps a [`PageFlash`] and exposes the store's verbs:
//! record reads and staged writes, the free-slot scan, ownership checks,
//! parent/child chain linking and the per-user profile accessors. All
//! address arithmetic lives here; callers never touch page or slot numbers
//! except through [`NodeAddr`].
//!
//! Multi-byte record fields are little-endian, both in flash and on the
//! wire of the raw node commands.

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::LayoutVerified;

use crate::crypto;
use crate::crypto::CTR_LENGTH;
use crate::hardware::flash::PageFlash;
use crate::storage::node::*;
use crate::storage::Error;
use crate::storage::NODE_FIRST_PAGE;

/// A node-slot buffer with the alignment record transmutation needs.
#[derive(Copy, Clone)]
#[repr(align(2))]
struct NodeBuf([u8; NODE_LENGTH]);

/// The node store: an arena of slots over page flash.
pub struct NodeStore<F> {
    flash: F,
    /// First page past the node region (start of the media region).
    node_page_limit: u16,
    /// Allocation cursor: scanning for a free slot resumes here.
    next_free: NodeAddr,
}

impl<F: PageFlash> NodeStore<F> {
    /// Creates a store over `flash`, with node pages running from
    /// [`NODE_FIRST_PAGE`] up to (not including) `node_page_limit`.
    pub fn new(flash: F, node_page_limit: u16) -> Self {
        debug_assert_eq!(flash.page_size(), BYTES_PER_PAGE);
        let node_page_limit = node_page_limit.min(flash.page_count());
        let mut store = Self {
            flash,
            node_page_limit,
            next_free: NodeAddr::new(NODE_FIRST_PAGE, 0),
        };
        store.rescan_usage();
        store
    }

    /// Returns the underlying flash, for the media-import path, which
    /// streams into pages past the node region through the shared staging
    /// buffer.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Returns the first page past the node region.
    pub fn node_page_limit(&self) -> u16 {
        self.node_page_limit
    }

    /// Returns the total number of flash pages.
    pub fn page_count(&self) -> u16 {
        self.flash.page_count()
    }

    fn check_node_addr(&self, addr: NodeAddr) -> Result<(), Error> {
        if addr.is_null()
            || addr.page() < NODE_FIRST_PAGE
            || addr.page() >= self.node_page_limit
        {
            return Err(Error::BadAddress);
        }
        Ok(())
    }

    /// Reads the raw bytes of the slot at `addr`.
    pub fn read_node_raw(
        &self,
        addr: NodeAddr,
    ) -> Result<[u8; NODE_LENGTH], Error> {
        self.check_node_addr(addr)?;
        let mut buf = NodeBuf([0; NODE_LENGTH]);
        self.flash.read(addr.page(), addr.page_offset(), &mut buf.0)?;
        Ok(buf.0)
    }

    fn read_record<T: FromBytes + Copy>(
        &self,
        addr: NodeAddr,
    ) -> Result<T, Error> {
        self.check_node_addr(addr)?;
        let mut buf = NodeBuf([0; NODE_LENGTH]);
        self.flash.read(addr.page(), addr.page_offset(), &mut buf.0)?;
        let lv = LayoutVerified::<_, T>::new(&buf.0[..])
            .ok_or(Error::WrongKind)?;
        Ok(*lv.into_ref())
    }

    /// Reads the flag word of the slot at `addr`.
    pub fn read_flags(&self, addr: NodeAddr) -> Result<NodeFlags, Error> {
        self.check_node_addr(addr)?;
        let mut bytes = [0; 2];
        self.flash.read(addr.page(), addr.page_offset(), &mut bytes)?;
        Ok(NodeFlags::from_raw(u16::from_le_bytes(bytes)))
    }

    /// Reads the parent node at `addr`.
    pub fn read_parent(&self, addr: NodeAddr) -> Result<ParentNode, Error> {
        let node: ParentNode = self.read_record(addr)?;
        match node.flags.kind() {
            Some(NodeKind::Parent) => Ok(node),
            _ => Err(Error::WrongKind),
        }
    }

    /// Reads the child node at `addr`.
    pub fn read_child(&self, addr: NodeAddr) -> Result<ChildNode, Error> {
        let node: ChildNode = self.read_record(addr)?;
        match node.flags.kind() {
            Some(NodeKind::Child) => Ok(node),
            _ => Err(Error::WrongKind),
        }
    }

    /// Reads the data node at `addr`.
    pub fn read_data_node(&self, addr: NodeAddr) -> Result<DataNode, Error> {
        let node: DataNode = self.read_record(addr)?;
        match node.flags.kind() {
            Some(NodeKind::Data) => Ok(node),
            _ => Err(Error::WrongKind),
        }
    }

    /// Writes the raw bytes of the slot at `addr` through the staging
    /// buffer, committing immediately.
    pub fn write_node_raw(
        &mut self,
        addr: NodeAddr,
        bytes: &[u8; NODE_LENGTH],
    ) -> Result<(), Error> {
        self.check_node_addr(addr)?;
        self.flash.load_page(addr.page())?;
        self.flash.stage(addr.page_offset(), bytes)?;
        self.flash.commit(addr.page())?;
        Ok(())
    }

    fn write_record<T: AsBytes>(
        &mut self,
        addr: NodeAddr,
        record: &T,
    ) -> Result<(), Error> {
        self.check_node_addr(addr)?;
        self.flash.load_page(addr.page())?;
        self.flash.stage(addr.page_offset(), record.as_bytes())?;
        self.flash.commit(addr.page())?;
        Ok(())
    }

    /// Writes `node` at `addr`.
    pub fn write_parent(
        &mut self,
        addr: NodeAddr,
        node: &ParentNode,
    ) -> Result<(), Error> {
        self.write_record(addr, node)
    }

    /// Writes `node` at `addr`.
    pub fn write_child(
        &mut self,
        addr: NodeAddr,
        node: &ChildNode,
    ) -> Result<(), Error> {
        self.write_record(addr, node)
    }

    /// Writes `node` at `addr`.
    pub fn write_data_node(
        &mut self,
        addr: NodeAddr,
        node: &DataNode,
    ) -> Result<(), Error> {
        self.write_record(addr, node)
    }

    // Staged (multi-packet) node writes. The dispatcher drives these three
    // in sequence; nothing lands until the commit.

    /// Loads the page containing `addr` into the staging buffer.
    pub fn load_node_page(&mut self, addr: NodeAddr) -> Result<(), Error> {
        self.check_node_addr(addr)?;
        self.flash.load_page(addr.page())?;
        Ok(())
    }

    /// Patches `data` into the staged copy of `addr`'s slot, `offset`
    /// bytes into the node.
    pub fn stage_node(
        &mut self,
        addr: NodeAddr,
        offset: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        self.check_node_addr(addr)?;
        let end = offset.checked_add(data.len()).ok_or(Error::BadAddress)?;
        if end > NODE_LENGTH {
            return Err(Error::BadAddress);
        }
        self.flash.stage(addr.page_offset() + offset, data)?;
        Ok(())
    }

    /// Commits the staging buffer back to `addr`'s page.
    pub fn commit_node_page(&mut self, addr: NodeAddr) -> Result<(), Error> {
        self.check_node_addr(addr)?;
        self.flash.commit(addr.page())?;
        Ok(())
    }

    /// Checks that the node at `addr` exists and belongs to `user`.
    ///
    /// Every node-addressed command calls this before touching data. A
    /// violation fails the command with an error code; it never panics.
    pub fn check_ownership(
        &self,
        addr: NodeAddr,
        user: u8,
    ) -> Result<(), Error> {
        let flags = self.read_flags(addr)?;
        if flags.is_free() || flags.user() != user {
            return Err(Error::Ownership);
        }
        Ok(())
    }

    /// Scans for free node slots starting from `(start_page, start_slot)`,
    /// filling `out` with at most `out.len()` addresses. Returns the number
    /// found. The scan never reports an occupied slot and never leaves the
    /// node region.
    pub fn find_free_nodes(
        &self,
        out: &mut [NodeAddr],
        start_page: u16,
        start_slot: u8,
    ) -> Result<usize, Error> {
        let mut found = 0;
        let mut slot = start_slot;
        let mut page = start_page.max(NODE_FIRST_PAGE);

        while page < self.node_page_limit && found < out.len() {
            while slot < NODES_PER_PAGE as u8 && found < out.len() {
                let addr = NodeAddr::new(page, slot);
                if self.read_flags(addr)?.is_free() {
                    out[found] = addr;
                    found += 1;
                }
                slot += 1;
            }
            slot = 0;
            page += 1;
        }
        Ok(found)
    }

    /// Allocates one free slot, resuming from the allocation cursor.
    pub fn alloc_node(&mut self) -> Result<NodeAddr, Error> {
        let mut out = [NodeAddr::NULL];
        let n = self.find_free_nodes(
            &mut out,
            self.next_free.page(),
            self.next_free.slot(),
        )?;
        if n == 0 {
            // The cursor may have skipped slots freed behind it; retry from
            // the bottom once before giving up.
            let n = self.find_free_nodes(&mut out, NODE_FIRST_PAGE, 0)?;
            if n == 0 {
                return Err(Error::StoreFull);
            }
        }
        self.next_free = out[0];
        Ok(out[0])
    }

    /// Recomputes the allocation cursor from scratch.
    ///
    /// Memory-management mode can rewrite arbitrary slots behind the
    /// cursor; the mode-exit path calls this so later allocations see the
    /// session's writes.
    pub fn rescan_usage(&mut self) {
        let mut out = [NodeAddr::NULL];
        self.next_free =
            match self.find_free_nodes(&mut out, NODE_FIRST_PAGE, 0) {
                Ok(1) => out[0],
                _ => NodeAddr::NULL,
            };
    }

    // User profiles.

    fn profile_addr(user: u8) -> Result<(u16, usize), Error> {
        if user >= USER_COUNT {
            return Err(Error::OutOfRange);
        }
        let page = u16::from(user) / NODES_PER_PAGE;
        let offset =
            usize::from(user % NODES_PER_PAGE as u8) * NODE_LENGTH;
        Ok((page, offset))
    }

    /// Reads `user`'s profile record.
    pub fn read_profile(&self, user: u8) -> Result<UserProfile, Error> {
        let (page, offset) = Self::profile_addr(user)?;
        let mut buf = NodeBuf([0; NODE_LENGTH]);
        self.flash.read(page, offset, &mut buf.0)?;
        let lv = LayoutVerified::<_, UserProfile>::new(&buf.0[..])
            .ok_or(Error::WrongKind)?;
        Ok(*lv.into_ref())
    }

    /// Writes `user`'s profile record.
    pub fn write_profile(
        &mut self,
        user: u8,
        profile: &UserProfile,
    ) -> Result<(), Error> {
        let (page, offset) = Self::profile_addr(user)?;
        self.flash.load_page(page)?;
        self.flash.stage(offset, profile.as_bytes())?;
        self.flash.commit(page)?;
        Ok(())
    }

    /// Initializes `user`'s profile to the blank state. Called when a new
    /// user is enrolled on a card.
    pub fn init_profile(&mut self, user: u8) -> Result<(), Error> {
        self.write_profile(user, &UserProfile::blank())
    }

    /// Returns `user`'s starting parent for `kind`.
    pub fn starting_parent(
        &self,
        user: u8,
        kind: ServiceKind,
    ) -> Result<NodeAddr, Error> {
        let profile = self.read_profile(user)?;
        Ok(match kind {
            ServiceKind::Credential => profile.starting_parent,
            ServiceKind::Data => profile.data_starting_parent,
        })
    }

    /// Replaces `user`'s starting parent for `kind`.
    pub fn set_starting_parent(
        &mut self,
        user: u8,
        kind: ServiceKind,
        addr: NodeAddr,
    ) -> Result<(), Error> {
        let mut profile = self.read_profile(user)?;
        match kind {
            ServiceKind::Credential => profile.starting_parent = addr,
            ServiceKind::Data => profile.data_starting_parent = addr,
        }
        self.write_profile(user, &profile)
    }

    /// Reads favorite `slot` of `user`. An unset slot reads as the null
    /// pair.
    pub fn favorite(
        &self,
        user: u8,
        slot: u8,
    ) -> Result<FavoriteEntry, Error> {
        if slot >= FAVORITE_COUNT {
            return Err(Error::OutOfRange);
        }
        let profile = self.read_profile(user)?;
        Ok(profile.favorites[usize::from(slot)])
    }

    /// Writes favorite `slot` of `user`.
    pub fn set_favorite(
        &mut self,
        user: u8,
        slot: u8,
        entry: FavoriteEntry,
    ) -> Result<(), Error> {
        if slot >= FAVORITE_COUNT {
            return Err(Error::OutOfRange);
        }
        let mut profile = self.read_profile(user)?;
        profile.favorites[usize::from(slot)] = entry;
        self.write_profile(user, &profile)
    }

    /// Reads `user`'s profile CTR seed.
    pub fn profile_ctr(&self, user: u8) -> Result<[u8; CTR_LENGTH], Error> {
        Ok(self.read_profile(user)?.ctr)
    }

    /// Replaces `user`'s profile CTR seed.
    pub fn set_profile_ctr(
        &mut self,
        user: u8,
        ctr: &[u8; CTR_LENGTH],
    ) -> Result<(), Error> {
        let mut profile = self.read_profile(user)?;
        profile.ctr = *ctr;
        self.write_profile(user, &profile)
    }

    /// Takes the current CTR seed and advances the stored one by `step`,
    /// so no two encipherments reuse a counter.
    pub fn take_ctr(
        &mut self,
        user: u8,
        step: u32,
    ) -> Result<[u8; CTR_LENGTH], Error> {
        let mut profile = self.read_profile(user)?;
        let ctr = profile.ctr;
        profile.ctr = crypto::ctr_add(&ctr, step);
        self.write_profile(user, &profile)?;
        Ok(ctr)
    }

    // Chain linking.

    /// Allocates a new parent named `service` and links it at the head of
    /// `user`'s chain of `kind` parents, updating the starting-parent
    /// pointer. Returns the new parent's address.
    pub fn link_new_parent(
        &mut self,
        user: u8,
        kind: ServiceKind,
        service: &[u8],
    ) -> Result<NodeAddr, Error> {
        let addr = self.alloc_node()?;
        let old_head = self.starting_parent(user, kind)?;

        let mut node = ParentNode::new(user, kind, service);
        node.next = old_head;
        self.write_parent(addr, &node)?;

        if !old_head.is_null() {
            let mut head = self.read_parent(old_head)?;
            head.prev = addr;
            self.write_parent(old_head, &head)?;
        }
        self.set_starting_parent(user, kind, addr)?;
        Ok(addr)
    }

    /// Allocates a blank child under `parent`, linking it at the head of
    /// the parent's child chain. Returns the new child's address.
    pub fn create_child(
        &mut self,
        parent_addr: NodeAddr,
        user: u8,
        date: u16,
    ) -> Result<NodeAddr, Error> {
        let mut parent = self.read_parent(parent_addr)?;
        let addr = self.alloc_node()?;

        let mut child = ChildNode::new(user, date);
        child.next = parent.first_child;
        self.write_child(addr, &child)?;

        if !parent.first_child.is_null() {
            let mut old = self.read_child(parent.first_child)?;
            old.prev = addr;
            self.write_child(parent.first_child, &old)?;
        }
        parent.first_child = addr;
        self.write_parent(parent_addr, &parent)?;
        Ok(addr)
    }

    /// Wipes the profile and node regions back to erased flash.
    ///
    /// Development builds only; reached through the erase commands.
    pub fn erase_all(&mut self) -> Result<(), Error> {
        let blank = [0xff; NODE_LENGTH];
        for page in 0..self.node_page_limit {
            self.flash.load_page(page)?;
            for slot in 0..NODES_PER_PAGE {
                self.flash
                    .stage(usize::from(slot) * NODE_LENGTH, &blank)?;
            }
            self.flash.commit(page)?;
        }
        self.rescan_usage();
        Ok(())
    }
}
