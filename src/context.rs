// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The context resolver.
//!
//! A "context" is the `(parent, child)` pair the credential get/set
//! commands operate on. This module maps a service name to a parent node
//! (case-insensitively, because names are lower-cased before they are ever
//! stored), selects or auto-creates the child beneath it, and moves
//! credential bytes in and out with the session cipher applied to the
//! secret fields.
//!
//! The resolver holds the one piece of derived state in the crate: a small
//! lookup table of the active user's credential parents, so repeated
//! lookups do not rescan flash. The table is refreshed on unlock, after a
//! context is added, and on every memory-management transition (whose raw
//! node writes can restructure the chains behind it).

use arrayvec::ArrayVec;

use crate::crypto;
use crate::crypto::guarded_eq;
use crate::crypto::Cipher;
use crate::hardware::flash::PageFlash;
use crate::hardware::Clock;
use crate::protocol::DATA_BLOCK_LENGTH;
use crate::protocol::PASSWORD_LENGTH;
use crate::session::SessionState;
use crate::storage;
use crate::storage::node::copy_text;
use crate::storage::node::text_of;
use crate::storage::node::DataNode;
use crate::storage::node::BLOCKS_PER_DATA_NODE;
use crate::storage::NodeAddr;
use crate::storage::NodeStore;
use crate::storage::ServiceKind;

/// Capacity of the service lookup table.
pub const LUT_CAPACITY: usize = 64;

/// A context-resolution error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An underlying store failure.
    Store(storage::Error),
    /// No service matched the requested name.
    NotFound,
    /// No context (or no child) is resolved for this operation.
    NoContext,
    /// The session is not authenticated and unlocked.
    NotAuthenticated,
    /// The data service has been finalized; no more blocks may be added.
    Closed,
}

impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        Self::Store(e)
    }
}

/// The outcome of a password check.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PasswordCheck {
    /// The candidate matches the stored password.
    Match,
    /// The candidate does not match.
    Mismatch,
    /// No context or child is resolved; there is nothing to compare.
    NotApplicable,
}

/// Resolves service names to contexts and applies operations to them.
pub struct ContextResolver {
    lut: ArrayVec<NodeAddr, LUT_CAPACITY>,
    lut_valid: bool,
}

impl ContextResolver {
    /// Creates a resolver with an empty (invalid) lookup table.
    pub fn new() -> Self {
        Self {
            lut: ArrayVec::new(),
            lut_valid: false,
        }
    }

    /// Drops the lookup table; the next lookup rebuilds it.
    pub fn invalidate_lut(&mut self) {
        self.lut.clear();
        self.lut_valid = false;
    }

    /// Rebuilds the lookup table from `user`'s credential parent chain.
    ///
    /// Chains longer than the table just fall back to flash walks for the
    /// overflow; nothing is dropped silently.
    pub fn populate_lut<F: PageFlash>(
        &mut self,
        store: &NodeStore<F>,
        user: u8,
    ) -> Result<(), Error> {
        self.lut.clear();
        let mut addr = store.starting_parent(user, ServiceKind::Credential)?;
        while !addr.is_null() {
            if self.lut.try_push(addr).is_err() {
                // Table full; leave it valid as a prefix cache.
                break;
            }
            addr = store.read_parent(addr)?.next;
        }
        self.lut_valid = true;
        Ok(())
    }

    /// Finds `user`'s parent of `kind` named `name` (already normalized).
    fn find_parent<F: PageFlash>(
        &mut self,
        store: &NodeStore<F>,
        user: u8,
        name: &[u8],
        kind: ServiceKind,
    ) -> Result<NodeAddr, Error> {
        if kind == ServiceKind::Credential {
            if !self.lut_valid {
                self.populate_lut(store, user)?;
            }
            for &addr in &self.lut {
                let parent = store.read_parent(addr)?;
                if parent.service_name() == name {
                    return Ok(addr);
                }
            }
            // Fall through to a chain walk only past the cached prefix.
            if self.lut.len() < LUT_CAPACITY {
                return Err(Error::NotFound);
            }
        }

        let mut addr = store.starting_parent(user, kind)?;
        while !addr.is_null() {
            let parent = store.read_parent(addr)?;
            if parent.service_name() == name {
                return Ok(addr);
            }
            addr = parent.next;
        }
        Err(Error::NotFound)
    }

    /// Resolves `name` as the current context.
    ///
    /// On success the parent is selected and the child cleared; on failure
    /// the previous context is left untouched.
    pub fn set_current<F: PageFlash>(
        &mut self,
        store: &NodeStore<F>,
        session: &mut SessionState,
        name: &[u8],
        kind: ServiceKind,
    ) -> Result<(), Error> {
        let user = session.user().ok_or(Error::NotAuthenticated)?;
        let parent = self.find_parent(store, user, name, kind)?;
        session.select_context(parent, kind);
        Ok(())
    }

    /// Creates a service named `name` and selects it as the current
    /// context. If the service already exists it is simply selected.
    pub fn add_new<F: PageFlash>(
        &mut self,
        store: &mut NodeStore<F>,
        session: &mut SessionState,
        name: &[u8],
        kind: ServiceKind,
    ) -> Result<(), Error> {
        if !session.is_unlocked() {
            return Err(Error::NotAuthenticated);
        }
        let user = session.user().ok_or(Error::NotAuthenticated)?;

        match self.find_parent(store, user, name, kind) {
            Ok(parent) => {
                session.select_context(parent, kind);
                return Ok(());
            }
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        let parent = store.link_new_parent(user, kind, name)?;
        if kind == ServiceKind::Credential {
            self.invalidate_lut();
            self.populate_lut(store, user)?;
        }
        session.select_context(parent, kind);
        Ok(())
    }

    /// Returns the context's resolved child, auto-creating one when the
    /// parent has none and `create` is set.
    fn resolve_child<F: PageFlash>(
        &mut self,
        store: &mut NodeStore<F>,
        session: &mut SessionState,
        create: bool,
    ) -> Result<NodeAddr, Error> {
        let user = session.user().ok_or(Error::NotAuthenticated)?;
        let date = session.date();
        let ctx = session.context_mut().ok_or(Error::NoContext)?;
        if ctx.kind != ServiceKind::Credential {
            return Err(Error::NoContext);
        }
        if !ctx.child.is_null() {
            return Ok(ctx.child);
        }

        let parent = store.read_parent(ctx.parent)?;
        if !parent.first_child.is_null() {
            ctx.child = parent.first_child;
            return Ok(ctx.child);
        }
        if !create {
            return Err(Error::NoContext);
        }
        let child = store.create_child(ctx.parent, user, date)?;
        ctx.child = child;
        Ok(child)
    }

    /// Copies the context's login into `out`, NUL included. Returns the
    /// copied length.
    pub fn login_for<F: PageFlash>(
        &mut self,
        store: &mut NodeStore<F>,
        session: &mut SessionState,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        let child = self.resolve_child(store, session, false)?;
        let node = store.read_child(child)?;
        let text = node.login_name();
        copy_text(out, text);
        Ok(text.len() + 1)
    }

    /// Copies the context's description into `out`, NUL included. Returns
    /// the copied length.
    pub fn description_for<F: PageFlash>(
        &mut self,
        store: &mut NodeStore<F>,
        session: &mut SessionState,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        let child = self.resolve_child(store, session, false)?;
        let node = store.read_child(child)?;
        let text = node.description_text();
        copy_text(out, text);
        Ok(text.len() + 1)
    }

    /// Deciphers the context's password into `out`, NUL included. Returns
    /// the copied length and stamps the last-used date.
    pub fn password_for<F: PageFlash, E: Cipher>(
        &mut self,
        store: &mut NodeStore<F>,
        session: &mut SessionState,
        cipher: &mut E,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        let date = session.date();
        let child = self.resolve_child(store, session, false)?;
        let mut node = store.read_child(child)?;

        let mut field = node.password;
        cipher.decrypt_ctr(&node.ctr, &mut field);
        let text = text_of(&field);
        copy_text(out, text);
        let len = text.len() + 1;
        for b in field.iter_mut() {
            *b = 0;
        }

        node.date_last_used = date;
        store.write_child(child, &node)?;
        Ok(len)
    }

    /// Stores `login` into the context's child, creating the child if
    /// needed.
    pub fn set_login<F: PageFlash>(
        &mut self,
        store: &mut NodeStore<F>,
        session: &mut SessionState,
        login: &[u8],
    ) -> Result<(), Error> {
        if !session.is_unlocked() {
            return Err(Error::NotAuthenticated);
        }
        let child = self.resolve_child(store, session, true)?;
        let mut node = store.read_child(child)?;
        copy_text(&mut node.login, login);
        store.write_child(child, &node)?;
        Ok(())
    }

    /// Enciphers and stores `password` into the context's child, creating
    /// the child if needed. A fresh CTR value is drawn from the user
    /// profile so no counter is ever reused.
    pub fn set_password<F: PageFlash, E: Cipher>(
        &mut self,
        store: &mut NodeStore<F>,
        session: &mut SessionState,
        cipher: &mut E,
        password: &[u8],
    ) -> Result<(), Error> {
        if !session.is_unlocked() {
            return Err(Error::NotAuthenticated);
        }
        let user = session.user().ok_or(Error::NotAuthenticated)?;
        let child = self.resolve_child(store, session, true)?;
        let mut node = store.read_child(child)?;

        let ctr = store.take_ctr(user, 1)?;
        let mut field = [0u8; PASSWORD_LENGTH];
        copy_text(&mut field, password);
        cipher.encrypt_ctr(&ctr, &mut field);

        node.ctr = ctr;
        node.password = field;
        store.write_child(child, &node)?;
        Ok(())
    }

    /// Compares `candidate` against the context's stored password, under
    /// the minimum-duration guard. The deciphered copy is zeroed before
    /// returning.
    pub fn check_password<F, E, K>(
        &mut self,
        store: &mut NodeStore<F>,
        session: &mut SessionState,
        cipher: &mut E,
        clock: &mut K,
        candidate: &[u8],
    ) -> Result<PasswordCheck, Error>
    where
        F: PageFlash,
        E: Cipher,
        K: Clock,
    {
        let child = match self.resolve_child(store, session, false) {
            Ok(child) => child,
            Err(Error::NoContext) | Err(Error::NotFound) => {
                return Ok(PasswordCheck::NotApplicable)
            }
            Err(e) => return Err(e),
        };
        let node = store.read_child(child)?;

        let mut field = node.password;
        cipher.decrypt_ctr(&node.ctr, &mut field);
        let matched = guarded_eq(clock, text_of(&field), candidate);
        for b in field.iter_mut() {
            *b = 0;
        }

        Ok(if matched {
            PasswordCheck::Match
        } else {
            PasswordCheck::Mismatch
        })
    }

    /// Appends one 32-byte block to the context's data service.
    ///
    /// The first block of a chain draws a CTR seed from the user profile
    /// and parks it in the parent; later blocks encipher under
    /// `seed + block index`. `last` finalizes the chain.
    pub fn append_data_block<F: PageFlash, E: Cipher>(
        &mut self,
        store: &mut NodeStore<F>,
        session: &mut SessionState,
        cipher: &mut E,
        block: &[u8; DATA_BLOCK_LENGTH],
        last: bool,
    ) -> Result<(), Error> {
        if !session.is_unlocked() {
            return Err(Error::NotAuthenticated);
        }
        let user = session.user().ok_or(Error::NotAuthenticated)?;
        let ctx = session.context_mut().ok_or(Error::NoContext)?;
        if ctx.kind != ServiceKind::Data {
            return Err(Error::NoContext);
        }
        if ctx.data_closed {
            return Err(Error::Closed);
        }

        let mut parent = store.read_parent(ctx.parent)?;

        // Resolve the tail on first use: walk to the chain's end, counting
        // blocks so the CTR offset stays aligned with the data.
        if ctx.data_tail.is_null() && !parent.first_child.is_null() {
            let mut addr = parent.first_child;
            let mut total = 0u16;
            loop {
                let node = store.read_data_node(addr)?;
                total += u16::from(node.block_count());
                if node.next.is_null() {
                    break;
                }
                addr = node.next;
            }
            ctx.data_tail = addr;
            ctx.data_written = total;
        }

        let mut enciphered = *block;
        if ctx.data_tail.is_null() {
            // Empty chain: seed the CTR and hang the first node off the
            // parent.
            let seed = store.take_ctr(user, u32::from(u16::MAX))?;
            parent.set_data_ctr(&seed);
            cipher.encrypt_ctr(&seed, &mut enciphered);

            let addr = store.alloc_node()?;
            let mut node = DataNode::new(user);
            node.set_block(0, &enciphered);
            store.write_data_node(addr, &node)?;

            parent.first_child = addr;
            store.write_parent(ctx.parent, &parent)?;
            ctx.data_tail = addr;
            ctx.data_written = 1;
        } else {
            let seed = parent.data_ctr();
            let ctr = crypto::ctr_add(&seed, u32::from(ctx.data_written));
            cipher.encrypt_ctr(&ctr, &mut enciphered);

            let mut tail = store.read_data_node(ctx.data_tail)?;
            if tail.block_count() < BLOCKS_PER_DATA_NODE {
                tail.set_block(tail.block_count(), &enciphered);
                store.write_data_node(ctx.data_tail, &tail)?;
            } else {
                let addr = store.alloc_node()?;
                let mut node = DataNode::new(user);
                node.set_block(0, &enciphered);
                store.write_data_node(addr, &node)?;

                tail.next = addr;
                store.write_data_node(ctx.data_tail, &tail)?;
                ctx.data_tail = addr;
            }
            ctx.data_written += 1;
        }

        if last {
            ctx.data_closed = true;
        }
        Ok(())
    }

    /// Reads and deciphers the next 32-byte block of the context's data
    /// service, advancing the read cursor.
    pub fn read_data_block<F: PageFlash, E: Cipher>(
        &mut self,
        store: &mut NodeStore<F>,
        session: &mut SessionState,
        cipher: &mut E,
        out: &mut [u8; DATA_BLOCK_LENGTH],
    ) -> Result<(), Error> {
        let ctx = session.context_mut().ok_or(Error::NoContext)?;
        if ctx.kind != ServiceKind::Data {
            return Err(Error::NoContext);
        }

        let parent = store.read_parent(ctx.parent)?;
        let (mut addr, mut block) = match ctx.data_read {
            Some(cursor) => cursor,
            None => {
                ctx.data_read_total = 0;
                (parent.first_child, 0)
            }
        };
        if addr.is_null() {
            return Err(Error::NotFound);
        }

        let mut node = store.read_data_node(addr)?;
        if block >= node.block_count() {
            if node.next.is_null() {
                return Err(Error::NotFound);
            }
            addr = node.next;
            block = 0;
            node = store.read_data_node(addr)?;
            if node.block_count() == 0 {
                return Err(Error::NotFound);
            }
        }

        out.copy_from_slice(node.block(block));
        let ctr =
            crypto::ctr_add(&parent.data_ctr(), u32::from(ctx.data_read_total));
        cipher.decrypt_ctr(&ctr, out);

        ctx.data_read = Some((addr, block + 1));
        ctx.data_read_total += 1;
        Ok(())
    }
}

impl Default for ContextResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::fake::XorCipher;
    use crate::crypto::NONCE_LENGTH;
    use crate::hardware::fake::TestClock;
    use crate::hardware::flash::RamFlash;
    use crate::hardware::KEY_LENGTH;
    use crate::storage::node::BYTES_PER_PAGE;
    use crate::storage::node::USER_COUNT;

    type TestFlash = RamFlash<BYTES_PER_PAGE, 8>;

    struct Rig {
        store: NodeStore<TestFlash>,
        session: SessionState,
        resolver: ContextResolver,
        cipher: XorCipher,
        clock: TestClock,
    }

    fn rig() -> Rig {
        let mut store = NodeStore::new(TestFlash::new(), 8);
        for user in 0..USER_COUNT {
            store.init_profile(user).unwrap();
        }
        let mut session = SessionState::new();
        session.unlock(0);
        let mut cipher = XorCipher::new();
        cipher.rekey(&[0x42; KEY_LENGTH], &[0x17; NONCE_LENGTH]);
        Rig {
            store,
            session,
            resolver: ContextResolver::new(),
            cipher,
            clock: TestClock::default(),
        }
    }

    #[test]
    fn add_then_resolve() {
        let mut rig = rig();
        rig.resolver
            .add_new(
                &mut rig.store,
                &mut rig.session,
                b"example.com",
                ServiceKind::Credential,
            )
            .unwrap();
        let added = rig.session.context().unwrap().parent;

        rig.session.clear_context();
        rig.resolver
            .set_current(
                &rig.store,
                &mut rig.session,
                b"example.com",
                ServiceKind::Credential,
            )
            .unwrap();
        assert_eq!(rig.session.context().unwrap().parent, added);

        // Unknown services are not found, and the failed lookup leaves the
        // context alone.
        assert_eq!(
            rig.resolver.set_current(
                &rig.store,
                &mut rig.session,
                b"nothere.com",
                ServiceKind::Credential,
            ),
            Err(Error::NotFound)
        );
        assert_eq!(rig.session.context().unwrap().parent, added);
    }

    #[test]
    fn adding_existing_service_selects_it() {
        let mut rig = rig();
        for _ in 0..2 {
            rig.resolver
                .add_new(
                    &mut rig.store,
                    &mut rig.session,
                    b"dup.com",
                    ServiceKind::Credential,
                )
                .unwrap();
        }
        // Only one parent exists: its chain ends immediately.
        let head = rig
            .store
            .starting_parent(0, ServiceKind::Credential)
            .unwrap();
        assert!(rig.store.read_parent(head).unwrap().next.is_null());
    }

    #[test]
    fn login_round_trip() {
        let mut rig = rig();
        rig.resolver
            .add_new(
                &mut rig.store,
                &mut rig.session,
                b"example.com",
                ServiceKind::Credential,
            )
            .unwrap();
        rig.resolver
            .set_login(&mut rig.store, &mut rig.session, b"alice")
            .unwrap();

        let mut out = [0u8; 64];
        let n = rig
            .resolver
            .login_for(&mut rig.store, &mut rig.session, &mut out)
            .unwrap();
        assert_eq!(&out[..n], b"alice\0");
    }

    #[test]
    fn password_round_trip_is_encrypted_at_rest() {
        let mut rig = rig();
        rig.resolver
            .add_new(
                &mut rig.store,
                &mut rig.session,
                b"example.com",
                ServiceKind::Credential,
            )
            .unwrap();
        rig.resolver
            .set_password(
                &mut rig.store,
                &mut rig.session,
                &mut rig.cipher,
                b"hunter2",
            )
            .unwrap();

        // The stored field must not contain the plaintext.
        let child = rig.session.context().unwrap().child;
        let node = rig.store.read_child(child).unwrap();
        assert!(!node
            .password
            .windows(7)
            .any(|w| w == b"hunter2"));

        let mut out = [0u8; PASSWORD_LENGTH];
        let n = rig
            .resolver
            .password_for(
                &mut rig.store,
                &mut rig.session,
                &mut rig.cipher,
                &mut out,
            )
            .unwrap();
        assert_eq!(&out[..n], b"hunter2\0");
    }

    #[test]
    fn check_password_three_way() {
        let mut rig = rig();

        // No context at all: not applicable.
        assert_eq!(
            rig.resolver
                .check_password(
                    &mut rig.store,
                    &mut rig.session,
                    &mut rig.cipher,
                    &mut rig.clock,
                    b"whatever",
                )
                .unwrap(),
            PasswordCheck::NotApplicable
        );

        rig.resolver
            .add_new(
                &mut rig.store,
                &mut rig.session,
                b"example.com",
                ServiceKind::Credential,
            )
            .unwrap();
        rig.resolver
            .set_password(
                &mut rig.store,
                &mut rig.session,
                &mut rig.cipher,
                b"hunter2",
            )
            .unwrap();

        assert_eq!(
            rig.resolver
                .check_password(
                    &mut rig.store,
                    &mut rig.session,
                    &mut rig.cipher,
                    &mut rig.clock,
                    b"hunter2",
                )
                .unwrap(),
            PasswordCheck::Match
        );
        assert_eq!(
            rig.resolver
                .check_password(
                    &mut rig.store,
                    &mut rig.session,
                    &mut rig.cipher,
                    &mut rig.clock,
                    b"hunter3",
                )
                .unwrap(),
            PasswordCheck::Mismatch
        );
    }

    #[test]
    fn data_blocks_round_trip() {
        let mut rig = rig();
        rig.resolver
            .add_new(
                &mut rig.store,
                &mut rig.session,
                b"backup-codes",
                ServiceKind::Data,
            )
            .unwrap();

        // Six blocks spans two data nodes.
        let mut blocks = Vec::new();
        for i in 0..6u8 {
            let block = [i.wrapping_mul(7) ^ 0x5a; DATA_BLOCK_LENGTH];
            blocks.push(block);
            let last = i == 5;
            rig.resolver
                .append_data_block(
                    &mut rig.store,
                    &mut rig.session,
                    &mut rig.cipher,
                    &block,
                    last,
                )
                .unwrap();
        }

        // The chain is closed now.
        assert_eq!(
            rig.resolver.append_data_block(
                &mut rig.store,
                &mut rig.session,
                &mut rig.cipher,
                &[0; DATA_BLOCK_LENGTH],
                false,
            ),
            Err(Error::Closed)
        );

        // Re-select to reset the read cursor, then read everything back.
        rig.resolver
            .set_current(
                &rig.store,
                &mut rig.session,
                b"backup-codes",
                ServiceKind::Data,
            )
            .unwrap();
        for expected in &blocks {
            let mut out = [0u8; DATA_BLOCK_LENGTH];
            rig.resolver
                .read_data_block(
                    &mut rig.store,
                    &mut rig.session,
                    &mut rig.cipher,
                    &mut out,
                )
                .unwrap();
            assert_eq!(&out, expected);
        }
        let mut out = [0u8; DATA_BLOCK_LENGTH];
        assert_eq!(
            rig.resolver.read_data_block(
                &mut rig.store,
                &mut rig.session,
                &mut rig.cipher,
                &mut out,
            ),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn locked_session_cannot_mutate() {
        let mut rig = rig();
        rig.resolver
            .add_new(
                &mut rig.store,
                &mut rig.session,
                b"example.com",
                ServiceKind::Credential,
            )
            .unwrap();
        rig.session.on_card_removed();

        assert_eq!(
            rig.resolver.set_login(
                &mut rig.store,
                &mut rig.session,
                b"alice"
            ),
            Err(Error::NotAuthenticated)
        );
        assert_eq!(
            rig.resolver.add_new(
                &mut rig.store,
                &mut rig.session,
                b"other.com",
                ServiceKind::Credential,
            ),
            Err(Error::NotAuthenticated)
        );

        // The node itself is untouched, but without a session the lookup
        // cannot even run.
        let mut out = [0u8; 64];
        assert!(matches!(
            rig.resolver.login_for(
                &mut rig.store,
                &mut rig.session,
                &mut out
            ),
            Err(Error::NoContext) | Err(Error::NotAuthenticated)
        ));
    }
}
