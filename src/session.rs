// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Session and authentication state.
//!
//! One value of [`SessionState`] holds everything that must not outlive the
//! user's presence: who is authenticated, whether the card is unlocked,
//! whether the privileged memory-management mode is active, the resolved
//! credential context, and the two cross-packet state machines (the staged
//! node write and the media import).
//!
//! State only changes through the named transitions below, so the
//! invariants live in one place:
//!
//! - [`SessionState::exit_memory_management`] drops the privilege *and*
//!   invalidates any write-in-progress; there is no way to leave the mode
//!   and keep the staging state.
//! - [`SessionState::on_card_removed`] resets everything atomically,
//!   before the next packet can be dispatched.
//! - Selecting a context resets the data-service cursors.

use crate::storage::NodeAddr;
use crate::storage::ServiceKind;

/// The resolved credential context: the service and, once known, the child
/// record that get/set operations apply to.
#[derive(Copy, Clone, Debug)]
pub struct Context {
    /// The resolved parent node.
    pub parent: NodeAddr,
    /// The selected child, or null until one is resolved or auto-created.
    pub child: NodeAddr,
    /// Whether this context is a credential or data service.
    pub kind: ServiceKind,
    /// Data services: the read cursor, as `(data node, block index)`.
    pub data_read: Option<(NodeAddr, u8)>,
    /// Data services: total blocks consumed by the read cursor, which is
    /// also the CTR offset of the next block to decipher.
    pub data_read_total: u16,
    /// Data services: the node currently being appended to.
    pub data_tail: NodeAddr,
    /// Data services: total blocks written to the chain, which is also the
    /// CTR offset of the next block to encipher.
    pub data_written: u16,
    /// Data services: set once the final block has been written.
    pub data_closed: bool,
}

impl Context {
    fn new(parent: NodeAddr, kind: ServiceKind) -> Self {
        Self {
            parent,
            child: NodeAddr::NULL,
            kind,
            data_read: None,
            data_read_total: 0,
            data_tail: NodeAddr::NULL,
            data_written: 0,
            data_closed: false,
        }
    }
}

/// The staged-node-write state machine.
///
/// `Idle -> Staging(addr)` on an accepted first packet;
/// `Staging -> Idle` on the committing packet, a mode exit or card
/// removal. A mid-sequence packet whose address does not match `addr` is
/// rejected without disturbing the state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteState {
    /// No write in progress.
    Idle,
    /// A node's page is in the staging buffer.
    Staging(NodeAddr),
}

/// The media-import state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaImportState {
    /// No import in progress.
    Idle,
    /// An import is approved and streaming; `page`/`offset` locate the
    /// next byte to stage.
    Active {
        /// The flash page being filled.
        page: u16,
        /// The staging offset within that page.
        offset: usize,
    },
}

/// The process-wide session state.
///
/// Lifecycle: created at power-on, progressively privileged by explicit
/// commands, torn down entirely on card removal.
pub struct SessionState {
    user: Option<u8>,
    unlocked: bool,
    management_mode: bool,
    context: Option<Context>,
    write: WriteState,
    media: MediaImportState,
    date: u16,
}

impl SessionState {
    /// The power-on state: nobody authenticated, nothing in flight.
    pub fn new() -> Self {
        Self {
            user: None,
            unlocked: false,
            management_mode: false,
            context: None,
            write: WriteState::Idle,
            media: MediaImportState::Idle,
            date: 0,
        }
    }

    /// Returns the authenticated user, if any.
    pub fn user(&self) -> Option<u8> {
        self.user
    }

    /// Returns whether an unlocked card backs this session.
    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Returns whether memory management mode is active.
    pub fn management_mode(&self) -> bool {
        self.management_mode
    }

    /// Marks the session unlocked for `user`.
    pub fn unlock(&mut self, user: u8) {
        self.user = Some(user);
        self.unlocked = true;
    }

    /// Grants the memory-management privilege.
    ///
    /// The dispatcher only calls this after the confirmation and
    /// re-authentication steps have passed.
    pub fn enter_memory_management(&mut self) {
        self.management_mode = true;
    }

    /// Drops the memory-management privilege and invalidates the staged
    /// write.
    pub fn exit_memory_management(&mut self) {
        self.management_mode = false;
        self.write = WriteState::Idle;
    }

    /// Tears down the whole session: card removal, as one atomic step.
    pub fn on_card_removed(&mut self) {
        *self = Self::new();
    }

    /// Returns the current context.
    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// Returns the current context, mutably.
    pub fn context_mut(&mut self) -> Option<&mut Context> {
        self.context.as_mut()
    }

    /// Replaces the current context with `parent` of `kind`, clearing the
    /// selected child and the data cursors.
    pub fn select_context(&mut self, parent: NodeAddr, kind: ServiceKind) {
        self.context = Some(Context::new(parent, kind));
    }

    /// Drops the current context.
    pub fn clear_context(&mut self) {
        self.context = None;
    }

    /// Returns the staged-write state.
    pub fn write_state(&self) -> WriteState {
        self.write
    }

    /// Begins staging a write of `addr`.
    pub fn begin_node_write(&mut self, addr: NodeAddr) {
        self.write = WriteState::Staging(addr);
    }

    /// Ends the staged write (committed or abandoned).
    pub fn end_node_write(&mut self) {
        self.write = WriteState::Idle;
    }

    /// Returns the media-import state.
    pub fn media_state(&self) -> MediaImportState {
        self.media
    }

    /// Opens a media import at `page`.
    pub fn begin_media_import(&mut self, page: u16) {
        self.media = MediaImportState::Active { page, offset: 0 };
    }

    /// Updates the media-import cursor.
    pub fn set_media_cursor(&mut self, page: u16, offset: usize) {
        self.media = MediaImportState::Active { page, offset };
    }

    /// Closes the media import (completed or aborted).
    pub fn end_media_import(&mut self) {
        self.media = MediaImportState::Idle;
    }

    /// Returns the packed date stamped onto node writes.
    pub fn date(&self) -> u16 {
        self.date
    }

    /// Sets the packed date.
    pub fn set_date(&mut self, date: u16) {
        self.date = date;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
