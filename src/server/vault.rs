// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The command dispatcher.
//!
//! [`Vault`] implements the request -> response "business logic" of the
//! host <-> device interaction: it accepts a packet from a [`HostPort`],
//! walks it through the shared validation pipeline, and routes it to the
//! matching handler.
//!
//! The pipeline order is part of the protocol contract:
//!
//! 1. PIN-prompt / status short-circuit: while the device waits for a PIN,
//!    every request is answered with the status bitmask, as is an explicit
//!    status request at any time.
//! 2. Text-field validation: commands carrying a text field must declare a
//!    nonzero length that is within the field's maximum and exactly
//!    `strlen + 1` (one terminating NUL). Service names are lower-cased in
//!    place here, so every later consumer sees normalized bytes.
//! 3. Privileged range: commands inside the data-management byte range
//!    bounce with the generic error byte unless memory management mode has
//!    been approved.
//! 4. The handler. Data-returning handlers send their payload and return
//!    early; everything else funnels a [`ReturnCode`] through the shared
//!    trailer.
//!
//! Exactly zero or one response leaves per request: cancellation (and an
//! unauthorized bootloader request) is acknowledged by silence.

use crate::context::ContextResolver;
use crate::context::PasswordCheck;
use crate::crypto::guarded_eq;
use crate::crypto::Cipher;
use crate::hardware::flash::PageFlash;
use crate::hardware::nvm;
use crate::hardware::CardStatus;
use crate::hardware::Clock;
use crate::hardware::Confirmation;
use crate::hardware::Nvm;
use crate::hardware::Prompt;
use crate::hardware::Reboot;
use crate::hardware::Rng;
use crate::hardware::Screen;
use crate::hardware::SmartCard;
use crate::hardware::UserInterface;
use crate::hardware::CPZ_LENGTH;
use crate::hardware::CTR_NONCE_LENGTH;
use crate::hardware::KEY_LENGTH;
use crate::io::Write as _;
use crate::net;
use crate::net::host::HostPort;
use crate::net::host::HostRequest;
use crate::protocol::packets::CpzCtrEntry;
use crate::protocol::packets::DataBlockWrite;
use crate::protocol::packets::NodeWritePacket;
use crate::protocol::packets::SetFavoriteRequest;
use crate::protocol::packets::UidProvision;
use crate::protocol::wire::FromWire;
use crate::protocol::wire::ToWire;
use crate::protocol::wire::WireEnum as _;
use crate::protocol::CommandType;
use crate::protocol::Param;
use crate::protocol::ReturnCode;
use crate::protocol::StatusFlag;
use crate::protocol::DATA_BLOCK_LENGTH;
use crate::protocol::FIRMWARE_VERSION;
use crate::protocol::LOGIN_LENGTH;
use crate::protocol::MAX_PAYLOAD;
use crate::protocol::NODE_WRITE_CHUNK;
use crate::server::Error;
use crate::server::Options;
use crate::session::MediaImportState;
use crate::session::SessionState;
use crate::session::WriteState;
use crate::storage::node::FavoriteEntry;
use crate::storage::node::NODE_LENGTH;
use crate::storage::NodeAddr;
use crate::storage::NodeFlags;
use crate::storage::NodeStore;
use crate::storage::ServiceKind;

/// Mandatory wait, in milliseconds, before any update-related command is
/// even considered. Slows brute-force attempts against the boot password.
const VIEW_DELAY_MS: u32 = 3000;

/// Sub-index of the node-write packet that triggers the page commit.
const NODE_WRITE_LAST_INDEX: u8 = (NODE_LENGTH / NODE_WRITE_CHUNK) as u8;

/// Who handed the packet to the dispatcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    /// The regular main loop.
    MainLoop,
    /// The PIN-entry flow, which polls USB while it blocks. Every packet
    /// arriving through it is answered with the status bitmask so the host
    /// can tell the user to look at the device.
    PinEntry,
}

/// The keyvault server.
///
/// One `Vault` owns the node store and all peripheral handles, plus the
/// session state that gates every operation. It processes one packet at a
/// time, to completion; there is no concurrent dispatch.
pub struct Vault<F, C, U, N, R, K, B, E> {
    store: NodeStore<F>,
    card: C,
    ui: U,
    nvm: N,
    rng: R,
    clock: K,
    reboot: B,
    cipher: E,
    session: SessionState,
    resolver: ContextResolver,

    // NVM-backed parameters, cached so readers skip the EEPROM.
    timeout_enabled: bool,
    wheel_reverse: bool,
}

impl<F, C, U, N, R, K, B, E> Vault<F, C, U, N, R, K, B, E>
where
    F: PageFlash,
    C: SmartCard,
    U: UserInterface,
    N: Nvm,
    R: Rng,
    K: Clock,
    B: Reboot,
    E: Cipher,
{
    /// Creates a new `Vault` with the given `Options`.
    pub fn new(opts: Options<F, C, U, N, R, K, B, E>) -> Self {
        let mut vault = Self {
            store: NodeStore::new(opts.flash, opts.media_page_start),
            card: opts.card,
            ui: opts.ui,
            nvm: opts.nvm,
            rng: opts.rng,
            clock: opts.clock,
            reboot: opts.reboot,
            cipher: opts.cipher,
            session: SessionState::new(),
            resolver: ContextResolver::new(),
            timeout_enabled: false,
            wheel_reverse: false,
        };
        vault.refresh_param_caches();
        vault
    }

    /// Returns the session state, for integration code that needs to
    /// inspect it (the inactivity lock, for one).
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Returns whether the inactivity lock timeout is armed.
    pub fn timeout_enabled(&self) -> bool {
        self.timeout_enabled
    }

    /// Returns whether the scroll wheel direction is inverted.
    pub fn wheel_reverse(&self) -> bool {
        self.wheel_reverse
    }

    /// Handles a card-removal event.
    ///
    /// This must run before the next packet is dispatched: it clears the
    /// session, the context, the staged write and any media import, as one
    /// step.
    pub fn on_card_removed(&mut self) {
        info!("card removed; tearing down session");
        self.session.on_card_removed();
        self.resolver.invalidate_lut();
        self.ui.set_screen(Screen::NoCard);
    }

    /// Process a single incoming request.
    ///
    /// The request packet is read from `port`, and the response (if the
    /// command produces one) is written back through it.
    #[cfg_attr(test, inline(never))]
    pub fn process_request(
        &mut self,
        port: &mut dyn HostPort,
        origin: Origin,
    ) -> Result<(), Error> {
        let request = port.receive()?;
        let header = request.header()?;
        let cmd = header.command;

        let mut buf = [0u8; MAX_PAYLOAD];
        let payload_len = {
            let r = request.payload()?;
            let n = r.remaining_data();
            if n > MAX_PAYLOAD {
                warn!("{}: oversized payload ({} bytes)", cmd, n);
                return reply_status(request, cmd, ReturnCode::Error);
            }
            r.read_bytes(&mut buf[..n])?;
            n
        };

        // While the PIN prompt is up, and for explicit status requests,
        // answer with the status bitmask and nothing else.
        if origin == Origin::PinEntry || cmd == CommandType::Status {
            let status = self.status_byte(origin);
            return reply_bytes(request, CommandType::Status, &[status]);
        }

        // Text-field validation, including service-name normalization.
        if let Some(max_len) = cmd.max_text_len() {
            let data = &mut buf[..payload_len];
            if !check_text_field(data, max_len) {
                warn!("{}: text field failed validation", cmd);
                return reply_status(request, cmd, ReturnCode::Error);
            }
            if cmd.is_service_name() {
                data.make_ascii_lowercase();
            }
        }

        // The data-management range is gated on the privileged mode flag.
        if cmd.requires_management_mode() && !self.session.management_mode()
        {
            warn!("{}: rejected outside memory management mode", cmd);
            return reply_status(request, cmd, ReturnCode::Error);
        }

        let payload = &buf[..payload_len];
        trace!("dispatching {} ({} bytes)", cmd, payload_len);
        self.dispatch(request, cmd, payload)
    }

    fn dispatch(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
        payload: &[u8],
    ) -> Result<(), Error> {
        match cmd {
            // Cancellation is acknowledged by silence; the host treats the
            // absence of a response as the ack.
            CommandType::CancelRequest => Ok(()),

            // Handled before dispatch; kept for match exhaustiveness.
            CommandType::Status => Ok(()),

            CommandType::Ping => {
                let n = payload.len().min(4);
                reply_bytes(request, cmd, &payload[..n])
            }

            CommandType::Version => {
                let mut version = [0u8; MAX_PAYLOAD];
                let text = FIRMWARE_VERSION.as_bytes();
                version[..text.len()].copy_from_slice(text);
                reply_bytes(request, cmd, &version[..text.len() + 1])
            }

            CommandType::SetContext | CommandType::SetDataService => {
                self.cmd_set_context(request, cmd, payload)
            }

            CommandType::GetLogin | CommandType::GetDescription => {
                let mut out = [0u8; LOGIN_LENGTH];
                let result = if cmd == CommandType::GetLogin {
                    self.resolver.login_for(
                        &mut self.store,
                        &mut self.session,
                        &mut out,
                    )
                } else {
                    self.resolver.description_for(
                        &mut self.store,
                        &mut self.session,
                        &mut out,
                    )
                };
                match result {
                    Ok(n) => reply_bytes(request, cmd, &out[..n]),
                    Err(_) => reply_status(request, cmd, ReturnCode::Error),
                }
            }

            CommandType::GetPassword => {
                let mut out = [0u8; LOGIN_LENGTH];
                match self.resolver.password_for(
                    &mut self.store,
                    &mut self.session,
                    &mut self.cipher,
                    &mut out,
                ) {
                    Ok(n) => reply_bytes(request, cmd, &out[..n]),
                    Err(_) => reply_status(request, cmd, ReturnCode::Error),
                }
            }

            CommandType::SetLogin => {
                let code = match self.resolver.set_login(
                    &mut self.store,
                    &mut self.session,
                    text_part(payload),
                ) {
                    Ok(()) => ReturnCode::Ok,
                    Err(_) => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::SetPassword => {
                let code = match self.resolver.set_password(
                    &mut self.store,
                    &mut self.session,
                    &mut self.cipher,
                    text_part(payload),
                ) {
                    Ok(()) => ReturnCode::Ok,
                    Err(_) => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::CheckPassword => {
                let code = match self.resolver.check_password(
                    &mut self.store,
                    &mut self.session,
                    &mut self.cipher,
                    &mut self.clock,
                    text_part(payload),
                ) {
                    Ok(PasswordCheck::Match) => ReturnCode::Ok,
                    Ok(PasswordCheck::Mismatch) => ReturnCode::Error,
                    Ok(PasswordCheck::NotApplicable) => {
                        ReturnCode::NotApplicable
                    }
                    Err(_) => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::AddContext | CommandType::AddDataService => {
                let kind = if cmd == CommandType::AddContext {
                    ServiceKind::Credential
                } else {
                    ServiceKind::Data
                };
                let code = match self.resolver.add_new(
                    &mut self.store,
                    &mut self.session,
                    text_part(payload),
                    kind,
                ) {
                    Ok(()) => ReturnCode::Ok,
                    Err(_) => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::WriteDataBlock => {
                let code = match DataBlockWrite::from_wire(&mut &*payload) {
                    Ok(write) => match self.resolver.append_data_block(
                        &mut self.store,
                        &mut self.session,
                        &mut self.cipher,
                        &write.block,
                        write.last,
                    ) {
                        Ok(()) => ReturnCode::Ok,
                        Err(_) => ReturnCode::Error,
                    },
                    Err(_) => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::ReadDataBlock => {
                let mut out = [0u8; DATA_BLOCK_LENGTH];
                match self.resolver.read_data_block(
                    &mut self.store,
                    &mut self.session,
                    &mut self.cipher,
                    &mut out,
                ) {
                    Ok(()) => reply_bytes(request, cmd, &out),
                    Err(_) => reply_status(request, cmd, ReturnCode::Error),
                }
            }

            CommandType::StartMemoryManagement => {
                self.cmd_start_memory_management(request, cmd)
            }

            CommandType::EndMemoryManagement => {
                self.ui.set_screen(Screen::InsertedUnlocked);
                self.session.exit_memory_management();
                if let Some(user) = self.session.user() {
                    let _ = self.resolver.populate_lut(&self.store, user);
                }
                self.store.rescan_usage();
                self.ui.refresh();
                self.ui.activity();
                reply_status(request, cmd, ReturnCode::Ok)
            }

            CommandType::GetStartingParent
            | CommandType::GetDataStartingParent => {
                let kind = if cmd == CommandType::GetStartingParent {
                    ServiceKind::Credential
                } else {
                    ServiceKind::Data
                };
                match self
                    .session
                    .user()
                    .and_then(|u| self.store.starting_parent(u, kind).ok())
                {
                    Some(addr) => {
                        reply_bytes(request, cmd, &addr.raw().to_le_bytes())
                    }
                    None => reply_status(request, cmd, ReturnCode::Error),
                }
            }

            CommandType::SetStartingParent
            | CommandType::SetDataStartingParent => {
                let kind = if cmd == CommandType::SetStartingParent {
                    ServiceKind::Credential
                } else {
                    ServiceKind::Data
                };
                let code = match (self.session.user(), payload) {
                    (Some(user), [a, b]) => {
                        let addr =
                            NodeAddr::from_raw(u16::from_le_bytes([*a, *b]));
                        match self.store.set_starting_parent(user, kind, addr)
                        {
                            Ok(()) => ReturnCode::Ok,
                            Err(_) => ReturnCode::Error,
                        }
                    }
                    _ => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::GetCtrValue => {
                match self
                    .session
                    .user()
                    .and_then(|u| self.store.profile_ctr(u).ok())
                {
                    Some(ctr) => reply_bytes(request, cmd, &ctr),
                    None => reply_status(request, cmd, ReturnCode::Error),
                }
            }

            CommandType::SetCtrValue => {
                let code = match (self.session.user(), payload) {
                    (Some(user), [a, b, c]) => {
                        match self.store.set_profile_ctr(user, &[*a, *b, *c])
                        {
                            Ok(()) => ReturnCode::Ok,
                            Err(_) => ReturnCode::Error,
                        }
                    }
                    _ => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::GetFreeSlots => {
                if payload.len() != 2 {
                    return reply_status(request, cmd, ReturnCode::Error);
                }
                let start = NodeAddr::from_raw(u16::from_le_bytes([
                    payload[0], payload[1],
                ]));
                let mut slots = [NodeAddr::NULL; MAX_PAYLOAD / 2];
                let found = match self.store.find_free_nodes(
                    &mut slots,
                    start.page(),
                    start.slot(),
                ) {
                    Ok(n) => n,
                    Err(_) => {
                        return reply_status(request, cmd, ReturnCode::Error)
                    }
                };
                let mut out = [0u8; MAX_PAYLOAD];
                for (i, addr) in slots[..found].iter().enumerate() {
                    out[i * 2..i * 2 + 2]
                        .copy_from_slice(&addr.raw().to_le_bytes());
                }
                reply_bytes(request, cmd, &out[..found * 2])
            }

            CommandType::GetFavorite => {
                let entry = match (self.session.user(), payload) {
                    (Some(user), [slot]) => self.store.favorite(user, *slot),
                    _ => return reply_status(request, cmd, ReturnCode::Error),
                };
                match entry {
                    Ok(entry) => {
                        let mut out = [0u8; 4];
                        out[..2].copy_from_slice(
                            &entry.parent.raw().to_le_bytes(),
                        );
                        out[2..].copy_from_slice(
                            &entry.child.raw().to_le_bytes(),
                        );
                        reply_bytes(request, cmd, &out)
                    }
                    Err(_) => reply_status(request, cmd, ReturnCode::Error),
                }
            }

            CommandType::SetFavorite => {
                let code = match (
                    self.session.user(),
                    SetFavoriteRequest::from_wire(&mut &*payload),
                ) {
                    (Some(user), Ok(req)) => {
                        let entry = FavoriteEntry {
                            parent: req.parent,
                            child: req.child,
                        };
                        match self.store.set_favorite(user, req.slot, entry) {
                            Ok(()) => ReturnCode::Ok,
                            Err(_) => ReturnCode::Error,
                        }
                    }
                    _ => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::ReadNode => self.cmd_read_node(request, cmd, payload),
            CommandType::WriteNode => {
                self.cmd_write_node(request, cmd, payload)
            }

            CommandType::AddCpzCtr => {
                let code = match (
                    self.session.user(),
                    CpzCtrEntry::from_wire(&mut &*payload),
                ) {
                    (Some(user), Ok(entry))
                        if payload.len()
                            == CPZ_LENGTH + CTR_NONCE_LENGTH =>
                    {
                        if self.cpz_add(user, &entry) {
                            ReturnCode::Ok
                        } else {
                            ReturnCode::Error
                        }
                    }
                    _ => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::GetCpzCtr => {
                let entry = match (self.session.user(), payload) {
                    (Some(user), [index]) => {
                        self.cpz_nth_for_user(user, *index)
                    }
                    _ => None,
                };
                match entry {
                    Some(entry) => {
                        let mut out =
                            [0u8; CPZ_LENGTH + CTR_NONCE_LENGTH];
                        entry
                            .to_wire(&mut &mut out[..])
                            .map_err(Error::Wire)?;
                        reply_bytes(request, cmd, &out)
                    }
                    None => reply_status(request, cmd, ReturnCode::Error),
                }
            }

            CommandType::GetCardCpz => {
                let visible = self.ui.current_screen() == Screen::UnknownCard
                    || self.session.is_unlocked();
                if !visible {
                    return reply_status(request, cmd, ReturnCode::Error);
                }
                let mut cpz = [0u8; CPZ_LENGTH];
                match self.card.read_protected_zone(&mut cpz) {
                    Ok(()) => reply_bytes(request, cmd, &cpz),
                    Err(_) => reply_status(request, cmd, ReturnCode::Error),
                }
            }

            CommandType::ResetCard => self.cmd_reset_card(request, cmd),
            CommandType::UnlockWithPin => {
                self.cmd_unlock_with_pin(request, cmd, payload)
            }
            CommandType::AddUnknownCard => {
                self.cmd_add_unknown_card(request, cmd, payload)
            }

            CommandType::ReadCardLogin => {
                if !self.session.is_unlocked() {
                    return reply_status(request, cmd, ReturnCode::Error);
                }
                let mut zone = [0u8; crate::hardware::CARD_LOGIN_LENGTH];
                match self.card.read_login_zone(&mut zone) {
                    Ok(()) => reply_bytes(request, cmd, &zone),
                    Err(_) => reply_status(request, cmd, ReturnCode::Error),
                }
            }

            CommandType::ReadCardPassword => {
                if !self.session.is_unlocked() {
                    return reply_status(request, cmd, ReturnCode::Error);
                }
                if !self.gate(Prompt::SendCardPassword) {
                    return reply_status(request, cmd, ReturnCode::Error);
                }
                let mut zone = [0u8; crate::hardware::CARD_PASSWORD_LENGTH];
                match self.card.read_password_zone(&mut zone) {
                    Ok(()) => reply_bytes(request, cmd, &zone),
                    Err(_) => reply_status(request, cmd, ReturnCode::Error),
                }
            }

            CommandType::SetCardLogin | CommandType::SetCardPassword => {
                let prompt = if cmd == CommandType::SetCardLogin {
                    Prompt::SetCardLogin
                } else {
                    Prompt::SetCardPassword
                };
                let code = if !self.session.is_unlocked() {
                    ReturnCode::Error
                } else if !self.gate(prompt) {
                    ReturnCode::Error
                } else {
                    let result = if cmd == CommandType::SetCardLogin {
                        self.card.write_login_zone(payload)
                    } else {
                        self.card.write_password_zone(payload)
                    };
                    match result {
                        Ok(()) => ReturnCode::Ok,
                        Err(_) => ReturnCode::Error,
                    }
                };
                reply_status(request, cmd, code)
            }

            CommandType::GetRandomNumber => {
                let mut bytes = [0u8; 32];
                self.rng.fill(&mut bytes);
                reply_bytes(request, cmd, &bytes)
            }

            CommandType::SetDate => {
                let code = match payload {
                    [a, b] => {
                        self.session.set_date(u16::from_le_bytes([*a, *b]));
                        ReturnCode::Ok
                    }
                    _ => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::SetUid => {
                let provisioned = self.nvm.read_byte(nvm::UID_KEY_SET)
                    == nvm::SENTINEL_SET;
                let code = match UidProvision::from_wire(&mut &*payload) {
                    Ok(p)
                        if !provisioned
                            && payload.len()
                                == nvm::UID_REQUEST_KEY_LENGTH
                                    + nvm::UID_LENGTH =>
                    {
                        self.nvm.write_block(
                            nvm::UID_REQUEST_KEY,
                            &p.request_key,
                        );
                        self.nvm.write_block(nvm::UID, &p.uid);
                        // One-time: this sentinel is never cleared.
                        self.nvm
                            .write_byte(nvm::UID_KEY_SET, nvm::SENTINEL_SET);
                        ReturnCode::Ok
                    }
                    _ => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::GetUid => {
                let provisioned = self.nvm.read_byte(nvm::UID_KEY_SET)
                    == nvm::SENTINEL_SET;
                if !provisioned
                    || payload.len() != nvm::UID_REQUEST_KEY_LENGTH
                {
                    return reply_status(request, cmd, ReturnCode::Error);
                }
                let mut key = [0u8; nvm::UID_REQUEST_KEY_LENGTH];
                self.nvm.read_block(nvm::UID_REQUEST_KEY, &mut key);
                let matched = guarded_eq(&mut self.clock, &key, payload);
                for b in key.iter_mut() {
                    *b = 0;
                }
                if matched {
                    let mut uid = [0u8; nvm::UID_LENGTH];
                    self.nvm.read_block(nvm::UID, &mut uid);
                    reply_bytes(request, cmd, &uid)
                } else {
                    reply_status(request, cmd, ReturnCode::Error)
                }
            }

            CommandType::SetBootloaderPassword => {
                let set = self.nvm.read_byte(nvm::BOOT_PASSWORD_SET)
                    == nvm::SENTINEL_SET;
                let code = if !set && payload.len() == MAX_PAYLOAD {
                    self.nvm.write_block(nvm::BOOT_PASSWORD, payload);
                    self.nvm.write_block(
                        nvm::BOOT_KEY_BACKUP,
                        &nvm::BOOT_KEY_APP.to_le_bytes(),
                    );
                    self.nvm.write_byte(
                        nvm::BOOT_PASSWORD_SET,
                        nvm::SENTINEL_SET,
                    );
                    ReturnCode::Ok
                } else {
                    ReturnCode::Error
                };
                reply_status(request, cmd, code)
            }

            CommandType::JumpToBootloader => {
                self.cmd_jump_to_bootloader(payload)
            }

            CommandType::ImportMediaStart => {
                self.cmd_import_media_start(request, cmd, payload)
            }
            CommandType::ImportMedia => {
                self.cmd_import_media(request, cmd, payload)
            }
            CommandType::ImportMediaEnd => {
                self.cmd_import_media_end(request, cmd)
            }

            CommandType::SetParameter => {
                let code = match payload {
                    [id, value] => match Param::from_wire_value(*id) {
                        Some(param) => {
                            self.nvm.write_byte(
                                nvm::PARAM_BASE
                                    + u16::from(param.to_wire_value()),
                                *value,
                            );
                            self.refresh_param_caches();
                            ReturnCode::Ok
                        }
                        None => ReturnCode::Error,
                    },
                    _ => ReturnCode::Error,
                };
                reply_status(request, cmd, code)
            }

            CommandType::GetParameter => {
                match payload {
                    [id] => match Param::from_wire_value(*id) {
                        Some(param) => {
                            let value = self.nvm.read_byte(
                                nvm::PARAM_BASE
                                    + u16::from(param.to_wire_value()),
                            );
                            reply_bytes(request, cmd, &[value])
                        }
                        None => {
                            reply_status(request, cmd, ReturnCode::Error)
                        }
                    },
                    _ => reply_status(request, cmd, ReturnCode::Error),
                }
            }

            CommandType::EraseEeprom
            | CommandType::EraseFlash
            | CommandType::EraseCard => {
                self.cmd_dev_erase(request, cmd)
            }
        }
    }

    // Individual handlers too large to inline in the match.

    fn cmd_set_context(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
        payload: &[u8],
    ) -> Result<(), Error> {
        let kind = if cmd == CommandType::SetContext {
            ServiceKind::Credential
        } else {
            ServiceKind::Data
        };

        // Raw node writes may have restructured the chains; rebuild the
        // lookup table before trusting it.
        if self.session.management_mode() {
            if let Some(user) = self.session.user() {
                let _ = self.resolver.populate_lut(&self.store, user);
            }
        }

        let code = if !self.session.is_unlocked() {
            ReturnCode::NoCard
        } else {
            match self.resolver.set_current(
                &self.store,
                &mut self.session,
                text_part(payload),
                kind,
            ) {
                Ok(()) => ReturnCode::Ok,
                Err(_) => ReturnCode::Error,
            }
        };
        reply_status(request, cmd, code)
    }

    fn cmd_start_memory_management(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
    ) -> Result<(), Error> {
        if !self.session.is_unlocked() {
            return reply_status(request, cmd, ReturnCode::Error);
        }

        let mut code = ReturnCode::Error;
        if self.gate(Prompt::EnterMemoryManagement) {
            // Extra friction on purpose: the user must prove presence a
            // second time with their PIN before the privileged mode opens.
            if self.pin_unlock_attempt() {
                self.ui.set_screen(Screen::MemoryManagement);
                self.session.enter_memory_management();
                code = ReturnCode::Ok;
            } else {
                self.ui.set_screen(Screen::InsertedLocked);
            }
        }
        self.ui.refresh();
        reply_status(request, cmd, code)
    }

    fn cmd_read_node(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
        payload: &[u8],
    ) -> Result<(), Error> {
        let (user, addr) = match (self.session.user(), payload) {
            (Some(user), [a, b]) => {
                (user, NodeAddr::from_raw(u16::from_le_bytes([*a, *b])))
            }
            _ => return reply_status(request, cmd, ReturnCode::Error),
        };
        if !self.node_access_allowed(addr, user) {
            return reply_status(request, cmd, ReturnCode::Error);
        }
        match self.store.read_node_raw(addr) {
            Ok(bytes) => reply_bytes(request, cmd, &bytes),
            Err(_) => reply_status(request, cmd, ReturnCode::Error),
        }
    }

    fn cmd_write_node(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
        payload: &[u8],
    ) -> Result<(), Error> {
        if payload.len() < 3 {
            return reply_status(request, cmd, ReturnCode::Error);
        }
        let packet = match NodeWritePacket::from_wire(&mut &*payload) {
            Ok(p) => p,
            Err(_) => return reply_status(request, cmd, ReturnCode::Error),
        };
        let user = match self.session.user() {
            Some(user) => user,
            None => return reply_status(request, cmd, ReturnCode::Error),
        };

        // The first packet establishes the target and stages its page.
        if packet.index == 0
            && self.node_access_allowed(packet.addr, user)
            && self.store.load_node_page(packet.addr).is_ok()
        {
            self.session.begin_node_write(packet.addr);
        }

        let staging = match self.session.write_state() {
            WriteState::Staging(addr) => addr,
            WriteState::Idle => {
                return reply_status(request, cmd, ReturnCode::Error)
            }
        };
        let offset =
            usize::from(packet.index) * NODE_WRITE_CHUNK;
        let n = usize::from(packet.len);

        // A mismatched address or an overflowing chunk is rejected; the
        // staged state is left exactly as it was.
        if staging != packet.addr || offset + n > NODE_LENGTH {
            return reply_status(request, cmd, ReturnCode::Error);
        }

        let mut chunk = [0u8; NODE_WRITE_CHUNK];
        chunk[..n].copy_from_slice(packet.bytes());
        if packet.index == 0 && n >= 2 {
            // Ownership is stamped by the device, never trusted from the
            // host.
            let flags =
                NodeFlags::from_raw(u16::from_le_bytes([chunk[0], chunk[1]]))
                    .claimed_by(user);
            chunk[..2].copy_from_slice(&flags.raw().to_le_bytes());
        }

        if self.store.stage_node(staging, offset, &chunk[..n]).is_err() {
            return reply_status(request, cmd, ReturnCode::Error);
        }
        if packet.index == NODE_WRITE_LAST_INDEX
            && self.store.commit_node_page(staging).is_err()
        {
            return reply_status(request, cmd, ReturnCode::Error);
        }
        reply_status(request, cmd, ReturnCode::Ok)
    }

    fn cmd_reset_card(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
    ) -> Result<(), Error> {
        if self.ui.current_screen() != Screen::UnknownCard {
            return reply_status(request, cmd, ReturnCode::Error);
        }
        self.ui.activity();
        let code = if self.pin_unlock_attempt()
            && self.card.erase().is_ok()
        {
            self.ui.set_screen(Screen::InvalidCard);
            ReturnCode::Ok
        } else {
            ReturnCode::Error
        };
        self.ui.refresh();
        reply_status(request, cmd, code)
    }

    fn cmd_unlock_with_pin(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
        payload: &[u8],
    ) -> Result<(), Error> {
        // Last-resort unlock for a device with a broken screen; everything
        // has to line up, including an on-device confirmation.
        let pin = match payload {
            [a, b] => u16::from_le_bytes([*a, *b]),
            _ => return reply_status(request, cmd, ReturnCode::Error),
        };
        let code = if self.ui.current_screen() == Screen::InsertedLocked
            && self.card.detect() == CardStatus::KnownUser
            && self.gate(Prompt::PinFromComputer)
            && self.card.unlock_with_pin(pin).is_ok()
            && self.activate_session_from_card()
        {
            self.ui.set_screen(Screen::InsertedUnlocked);
            ReturnCode::Ok
        } else {
            ReturnCode::Error
        };
        self.ui.refresh();
        reply_status(request, cmd, code)
    }

    fn cmd_add_unknown_card(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
        payload: &[u8],
    ) -> Result<(), Error> {
        if payload.len() != CPZ_LENGTH + CTR_NONCE_LENGTH
            || self.ui.current_screen() != Screen::UnknownCard
        {
            return reply_status(request, cmd, ReturnCode::Error);
        }
        let entry = match CpzCtrEntry::from_wire(&mut &*payload) {
            Ok(e) => e,
            Err(_) => return reply_status(request, cmd, ReturnCode::Error),
        };

        let mut cpz = [0u8; CPZ_LENGTH];
        if self.card.read_protected_zone(&mut cpz).is_err()
            || cpz != entry.cpz
        {
            return reply_status(request, cmd, ReturnCode::Error);
        }

        self.ui.activity();
        let code = match self.enroll_new_user(&entry) {
            Some(_) => {
                self.ui.set_screen(Screen::InsertedUnlocked);
                ReturnCode::Ok
            }
            None => ReturnCode::Error,
        };
        self.ui.refresh();
        reply_status(request, cmd, code)
    }

    fn cmd_jump_to_bootloader(
        &mut self,
        payload: &[u8],
    ) -> Result<(), Error> {
        // Mandatory wait, whatever happens next.
        let deadline = self.clock.deadline(VIEW_DELAY_MS);
        self.clock.wait_until(deadline);

        if cfg!(feature = "dev-commands") {
            self.nvm.write_block(
                nvm::BOOT_KEY,
                &nvm::BOOT_KEY_BOOTLOADER.to_le_bytes(),
            );
            self.nvm.write_byte(nvm::BOOT_PASSWORD_SET, 0);
            self.reboot.jump_to_bootloader();
            return Ok(());
        }

        let set = self.nvm.read_byte(nvm::BOOT_PASSWORD_SET)
            == nvm::SENTINEL_SET;
        if set
            && payload.len() == MAX_PAYLOAD
            && self.gate(Prompt::AllowUpdate)
            && self.check_boot_password(payload)
        {
            self.nvm.write_block(
                nvm::BOOT_KEY,
                &nvm::BOOT_KEY_BOOTLOADER.to_le_bytes(),
            );
            self.nvm.write_block(
                nvm::BOOT_KEY_BACKUP,
                &nvm::BOOT_KEY_BOOTLOADER.to_le_bytes(),
            );
            self.nvm.write_byte(nvm::BOOT_PASSWORD_SET, 0);
            self.reboot.jump_to_bootloader();
            return Ok(());
        }

        // Failed update attempts are not acknowledged.
        self.ui.refresh();
        Ok(())
    }

    fn cmd_import_media_start(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
        payload: &[u8],
    ) -> Result<(), Error> {
        let media_start = self.store.node_page_limit();

        if cfg!(feature = "dev-commands") {
            self.session.begin_media_import(media_start);
            return reply_status(request, cmd, ReturnCode::Ok);
        }

        // Mandatory wait before a password-bearing command.
        let deadline = self.clock.deadline(VIEW_DELAY_MS);
        self.clock.wait_until(deadline);

        if payload.len() != MAX_PAYLOAD {
            return reply_status(request, cmd, ReturnCode::Error);
        }
        let pwd_set = self.nvm.read_byte(nvm::BOOT_PASSWORD_SET)
            == nvm::SENTINEL_SET;
        // Updates are free until a bootloader password is provisioned.
        let approved = !pwd_set
            || (self.gate(Prompt::AllowUpdate)
                && self.check_boot_password(payload));
        let code = if approved {
            self.session.begin_media_import(media_start);
            ReturnCode::Ok
        } else {
            ReturnCode::Error
        };
        self.ui.refresh();
        reply_status(request, cmd, code)
    }

    fn cmd_import_media(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
        payload: &[u8],
    ) -> Result<(), Error> {
        let (page, offset) = match self.session.media_state() {
            MediaImportState::Active { page, offset } => (page, offset),
            MediaImportState::Idle => {
                return reply_status(request, cmd, ReturnCode::Error)
            }
        };

        let page_size = self.store.flash_mut().page_size();
        if page >= self.store.page_count()
            || offset + payload.len() > page_size
            || self.store.flash_mut().stage(offset, payload).is_err()
        {
            self.session.end_media_import();
            return reply_status(request, cmd, ReturnCode::Error);
        }

        let mut page = page;
        let mut offset = offset + payload.len();
        if offset == page_size {
            if self.store.flash_mut().commit(page).is_err() {
                self.session.end_media_import();
                return reply_status(request, cmd, ReturnCode::Error);
            }
            page += 1;
            offset = 0;
        }
        self.session.set_media_cursor(page, offset);
        reply_status(request, cmd, ReturnCode::Ok)
    }

    fn cmd_import_media_end(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
    ) -> Result<(), Error> {
        if let MediaImportState::Active { page, offset } =
            self.session.media_state()
        {
            if offset != 0 {
                let _ = self.store.flash_mut().commit(page);
            }
        }
        self.session.end_media_import();

        if cfg!(feature = "factory-programming")
            && self.nvm.read_byte(nvm::BOOT_PASSWORD_SET)
                == nvm::SENTINEL_SET
        {
            // Factory line: a completed import chains straight into the
            // bootloader.
            self.nvm.write_block(
                nvm::BOOT_KEY,
                &nvm::BOOT_KEY_BOOTLOADER.to_le_bytes(),
            );
            self.reboot.jump_to_bootloader();
            return Ok(());
        }
        reply_status(request, cmd, ReturnCode::Ok)
    }

    fn cmd_dev_erase(
        &mut self,
        request: &mut dyn HostRequest,
        cmd: CommandType,
    ) -> Result<(), Error> {
        if !cfg!(feature = "dev-commands") {
            return reply_status(request, cmd, ReturnCode::Error);
        }
        let code = match cmd {
            CommandType::EraseFlash => match self.store.erase_all() {
                Ok(()) => ReturnCode::Ok,
                Err(_) => ReturnCode::Error,
            },
            CommandType::EraseEeprom => {
                // Parameters and the CPZ table only; the UID and
                // bootloader cells keep their one-time guarantees even on
                // a bench wipe.
                for addr in nvm::PARAM_BASE..nvm::PARAM_BASE + nvm::PARAM_COUNT
                {
                    self.nvm.write_byte(addr, 0xff);
                }
                let entries = u16::from(nvm::CPZ_LUT_ENTRIES)
                    * nvm::CPZ_LUT_ENTRY_SIZE as u16;
                for addr in nvm::CPZ_LUT..nvm::CPZ_LUT + entries {
                    self.nvm.write_byte(addr, 0xff);
                }
                self.refresh_param_caches();
                match self.store.erase_all() {
                    Ok(()) => ReturnCode::Ok,
                    Err(_) => ReturnCode::Error,
                }
            }
            CommandType::EraseCard => {
                if self.session.is_unlocked()
                    && self.card.erase().is_ok()
                {
                    ReturnCode::Ok
                } else {
                    ReturnCode::Error
                }
            }
            _ => ReturnCode::Error,
        };
        reply_status(request, cmd, code)
    }

    // Shared helpers.

    fn status_byte(&mut self, origin: Origin) -> u8 {
        let mut status = crate::protocol::DeviceStatus::empty();
        if self.card.is_present() {
            status |= StatusFlag::CardPresent;
        }
        if origin == Origin::PinEntry {
            status |= StatusFlag::AwaitingPin;
        }
        if self.session.is_unlocked() {
            status |= StatusFlag::Unlocked;
        }
        if self.ui.current_screen() == Screen::UnknownCard {
            status |= StatusFlag::UnknownCardScreen;
        }
        status.bits()
    }

    /// The confirmation gate: presents `prompt`, then restores the home
    /// screen whatever the answer was. Timeouts count as denial.
    fn gate(&mut self, prompt: Prompt) -> bool {
        self.ui.activity();
        let answer = self.ui.confirm(prompt);
        self.ui.refresh();
        answer == Confirmation::Approved
    }

    /// One on-device PIN entry and card unlock attempt. The card's own
    /// attempt counter is the rate limiter.
    fn pin_unlock_attempt(&mut self) -> bool {
        match self.ui.prompt_pin() {
            Some(pin) => self.card.unlock_with_pin(pin).is_ok(),
            None => false,
        }
    }

    /// After a successful card unlock: find the user behind the card's
    /// CPZ, re-derive the key material and re-key the cipher, and mark the
    /// session unlocked.
    fn activate_session_from_card(&mut self) -> bool {
        let mut cpz = [0u8; CPZ_LENGTH];
        if self.card.read_protected_zone(&mut cpz).is_err() {
            return false;
        }
        let (user, nonce) = match self.cpz_find(&cpz) {
            Some(found) => found,
            None => return false,
        };
        let mut key = [0u8; KEY_LENGTH];
        if self.card.read_key(&mut key).is_err() {
            return false;
        }
        self.cipher.rekey(&key, &nonce);
        for b in key.iter_mut() {
            *b = 0;
        }
        self.session.unlock(user);
        let _ = self.resolver.populate_lut(&self.store, user);
        true
    }

    /// Enrolls a brand-new user on the inserted card: PIN proof, CPZ
    /// lookup-table entry, blank profile, cipher re-key.
    fn enroll_new_user(&mut self, entry: &CpzCtrEntry) -> Option<u8> {
        if !self.pin_unlock_attempt() {
            return None;
        }
        let user = self.next_free_user()?;
        if !self.cpz_add(user, entry) {
            return None;
        }
        if self.store.init_profile(user).is_err() {
            return None;
        }
        let mut key = [0u8; KEY_LENGTH];
        if self.card.read_key(&mut key).is_err() {
            return None;
        }
        self.cipher.rekey(&key, &entry.nonce);
        for b in key.iter_mut() {
            *b = 0;
        }
        self.session.unlock(user);
        let _ = self.resolver.populate_lut(&self.store, user);
        Some(user)
    }

    /// Compares `candidate` to the stored bootloader password under the
    /// minimum-duration guard.
    fn check_boot_password(&mut self, candidate: &[u8]) -> bool {
        let mut stored = [0u8; MAX_PAYLOAD];
        self.nvm.read_block(nvm::BOOT_PASSWORD, &mut stored);
        let matched = guarded_eq(&mut self.clock, &stored, candidate);
        for b in stored.iter_mut() {
            *b = 0;
        }
        matched
    }

    /// Whether `user` may touch the node at `addr`: the slot is free, or
    /// it carries their user id.
    fn node_access_allowed(&self, addr: NodeAddr, user: u8) -> bool {
        match self.store.read_flags(addr) {
            Ok(flags) => flags.is_free() || flags.user() == user,
            Err(_) => false,
        }
    }

    fn param_value(&self, param: Param) -> u8 {
        self.nvm
            .read_byte(nvm::PARAM_BASE + u16::from(param.to_wire_value()))
    }

    fn refresh_param_caches(&mut self) {
        self.timeout_enabled =
            self.param_value(Param::LockTimeoutEnable) == 1;
        self.wheel_reverse =
            self.param_value(Param::WheelDirectionReverse) == 1;
        let contrast = self.param_value(Param::ScreenContrast);
        self.ui.set_contrast(contrast);
    }

    // CPZ lookup table plumbing (NVM-resident).

    fn cpz_entry_addr(index: u8) -> u16 {
        nvm::CPZ_LUT + u16::from(index) * nvm::CPZ_LUT_ENTRY_SIZE as u16
    }

    fn cpz_entry(&self, index: u8) -> (u8, CpzCtrEntry) {
        let base = Self::cpz_entry_addr(index);
        let user = self.nvm.read_byte(base);
        let mut cpz = [0u8; CPZ_LENGTH];
        self.nvm.read_block(base + 1, &mut cpz);
        let mut nonce = [0u8; CTR_NONCE_LENGTH];
        self.nvm
            .read_block(base + 1 + CPZ_LENGTH as u16, &mut nonce);
        (user, CpzCtrEntry { cpz, nonce })
    }

    fn cpz_find(&self, cpz: &[u8; CPZ_LENGTH]) -> Option<(u8, [u8; CTR_NONCE_LENGTH])> {
        for index in 0..nvm::CPZ_LUT_ENTRIES {
            let (user, entry) = self.cpz_entry(index);
            if user != nvm::CPZ_ENTRY_FREE && entry.cpz == *cpz {
                return Some((user, entry.nonce));
            }
        }
        None
    }

    fn cpz_add(&mut self, user: u8, entry: &CpzCtrEntry) -> bool {
        if self.cpz_find(&entry.cpz).is_some() {
            return false;
        }
        for index in 0..nvm::CPZ_LUT_ENTRIES {
            let (owner, _) = self.cpz_entry(index);
            if owner == nvm::CPZ_ENTRY_FREE {
                let base = Self::cpz_entry_addr(index);
                self.nvm.write_byte(base, user);
                self.nvm.write_block(base + 1, &entry.cpz);
                self.nvm
                    .write_block(base + 1 + CPZ_LENGTH as u16, &entry.nonce);
                return true;
            }
        }
        false
    }

    fn cpz_nth_for_user(&self, user: u8, n: u8) -> Option<CpzCtrEntry> {
        let mut seen = 0;
        for index in 0..nvm::CPZ_LUT_ENTRIES {
            let (owner, entry) = self.cpz_entry(index);
            if owner == user {
                if seen == n {
                    return Some(entry);
                }
                seen += 1;
            }
        }
        None
    }

    fn next_free_user(&self) -> Option<u8> {
        let mut used = [false; crate::storage::node::USER_COUNT as usize];
        for index in 0..nvm::CPZ_LUT_ENTRIES {
            let (owner, _) = self.cpz_entry(index);
            if let Some(slot) = used.get_mut(usize::from(owner)) {
                *slot = true;
            }
        }
        (0..crate::storage::node::USER_COUNT)
            .find(|&u| !used[usize::from(u)])
    }
}

/// Replies with the single-byte status trailer.
fn reply_status(
    request: &mut dyn HostRequest,
    cmd: CommandType,
    code: ReturnCode,
) -> Result<(), Error> {
    let reply = request.reply(net::Header { command: cmd })?;
    let sink = reply.sink()?;
    code.to_wire(&mut *sink)?;
    reply.finish()?;
    Ok(())
}

/// Replies with a data payload.
fn reply_bytes(
    request: &mut dyn HostRequest,
    cmd: CommandType,
    bytes: &[u8],
) -> Result<(), Error> {
    let reply = request.reply(net::Header { command: cmd })?;
    reply.sink()?.write_bytes(bytes).map_err(Error::from)?;
    reply.finish()?;
    Ok(())
}

/// Validates a text-field payload: nonzero declared length, within the
/// field maximum, within a packet, and exactly one terminating NUL at the
/// declared end.
fn check_text_field(data: &[u8], max_len: usize) -> bool {
    let len = data.len();
    if len == 0 || len > max_len || len > MAX_PAYLOAD {
        return false;
    }
    match data.iter().position(|&b| b == 0) {
        Some(n) => n + 1 == len,
        None => false,
    }
}

/// Strips the terminating NUL off a validated text payload.
fn text_part(payload: &[u8]) -> &[u8] {
    match payload.split_last() {
        Some((&0, text)) => text,
        _ => payload,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::crypto::fake::XorCipher;
    use crate::hardware::fake::Card;
    use crate::hardware::fake::FixedRng;
    use crate::hardware::fake::Panel;
    use crate::hardware::fake::RamNvm;
    use crate::hardware::fake::ResetController;
    use crate::hardware::fake::TestClock;
    use crate::hardware::flash::RamFlash;
    use crate::net::host::InMemHost;
    use crate::storage::node::BYTES_PER_PAGE;

    const MEDIA_START: u16 = 12;
    const PIN: u16 = 1234;
    const CPZ: [u8; CPZ_LENGTH] = [0x11; CPZ_LENGTH];
    const NONCE: [u8; CTR_NONCE_LENGTH] = [0x22; CTR_NONCE_LENGTH];

    const OK: u8 = 0x01;
    const ERROR: u8 = 0x00;
    const NA: u8 = 0x02;
    const NO_CARD: u8 = 0x03;

    type TestVault = Vault<
        RamFlash<BYTES_PER_PAGE, 16>,
        Card,
        Panel,
        RamNvm,
        FixedRng,
        TestClock,
        ResetController,
        XorCipher,
    >;

    fn vault() -> TestVault {
        Vault::new(Options {
            flash: RamFlash::new(),
            card: Card::known(PIN, CPZ),
            ui: Panel::approving(Screen::UnknownCard),
            nvm: RamNvm::new(),
            rng: FixedRng(7),
            clock: TestClock::default(),
            reboot: ResetController::default(),
            cipher: XorCipher::new(),
            media_page_start: MEDIA_START,
        })
    }

    fn exec_from(
        vault: &mut TestVault,
        origin: Origin,
        cmd: CommandType,
        payload: &[u8],
    ) -> Option<(CommandType, Vec<u8>)> {
        let mut buf = [0u8; 192];
        let mut host = InMemHost::new(&mut buf);
        host.request(net::Header { command: cmd }, payload);
        vault.process_request(&mut host, origin).unwrap();
        host.response().map(|(h, b)| (h.command, b.to_vec()))
    }

    fn exec(
        vault: &mut TestVault,
        cmd: CommandType,
        payload: &[u8],
    ) -> Option<(CommandType, Vec<u8>)> {
        exec_from(vault, Origin::MainLoop, cmd, payload)
    }

    /// Runs the real enrollment flow for the inserted unknown card.
    fn enroll(vault: &mut TestVault) {
        vault.ui.set_screen(Screen::UnknownCard);
        vault.ui.pins.push_back(PIN);
        let mut payload = [0u8; CPZ_LENGTH + CTR_NONCE_LENGTH];
        payload[..CPZ_LENGTH].copy_from_slice(&vault.card.cpz.clone());
        payload[CPZ_LENGTH..].copy_from_slice(&NONCE);
        let resp = exec(vault, CommandType::AddUnknownCard, &payload);
        assert_eq!(resp, Some((CommandType::AddUnknownCard, vec![OK])));
        assert!(vault.session.is_unlocked());
    }

    /// Runs the real memory-management entry flow.
    fn enter_mgmt(vault: &mut TestVault) {
        vault.ui.pins.push_back(PIN);
        let resp = exec(vault, CommandType::StartMemoryManagement, &[]);
        assert_eq!(
            resp,
            Some((CommandType::StartMemoryManagement, vec![OK]))
        );
        assert!(vault.session.management_mode());
    }

    fn node_write_packet(addr: NodeAddr, index: u8, data: &[u8]) -> Vec<u8> {
        let mut v = addr.raw().to_le_bytes().to_vec();
        v.push(index);
        v.extend_from_slice(data);
        v
    }

    #[test]
    fn ping_echoes() {
        let mut vault = vault();
        let resp = exec(&mut vault, CommandType::Ping, &[1, 2, 3, 4]);
        assert_eq!(resp, Some((CommandType::Ping, vec![1, 2, 3, 4])));

        let resp = exec(&mut vault, CommandType::Ping, &[9]);
        assert_eq!(resp, Some((CommandType::Ping, vec![9])));
    }

    #[test]
    fn version_is_nul_terminated() {
        let mut vault = vault();
        let (cmd, bytes) =
            exec(&mut vault, CommandType::Version, &[]).unwrap();
        assert_eq!(cmd, CommandType::Version);
        assert!(bytes.starts_with(b"8m_v"));
        assert_eq!(*bytes.last().unwrap(), 0);
    }

    #[test]
    fn cancel_is_answered_with_silence() {
        let mut vault = vault();
        assert_eq!(exec(&mut vault, CommandType::CancelRequest, &[]), None);
    }

    #[test]
    fn status_bitmask() {
        let mut vault = vault();
        let (cmd, bytes) =
            exec(&mut vault, CommandType::Status, &[]).unwrap();
        assert_eq!(cmd, CommandType::Status);
        // Card present + unknown-card screen.
        assert_eq!(bytes, vec![0b1001]);

        enroll(&mut vault);
        let (_, bytes) =
            exec(&mut vault, CommandType::Status, &[]).unwrap();
        // Card present + unlocked.
        assert_eq!(bytes, vec![0b0101]);
    }

    #[test]
    fn pin_entry_always_answers_with_status() {
        let mut vault = vault();
        let (cmd, bytes) = exec_from(
            &mut vault,
            Origin::PinEntry,
            CommandType::GetLogin,
            &[],
        )
        .unwrap();
        assert_eq!(cmd, CommandType::Status);
        assert_eq!(bytes, vec![0b1011]); // present + awaiting PIN + unknown
    }

    #[test]
    fn credential_flow() {
        let mut vault = vault();
        enroll(&mut vault);

        // Mixed case on the way in; normalize-on-write makes the later
        // lookups case-insensitive.
        let resp =
            exec(&mut vault, CommandType::AddContext, b"Example.COM\0");
        assert_eq!(resp, Some((CommandType::AddContext, vec![OK])));

        let resp = exec(&mut vault, CommandType::SetLogin, b"alice\0");
        assert_eq!(resp, Some((CommandType::SetLogin, vec![OK])));

        let resp = exec(&mut vault, CommandType::GetLogin, &[]);
        assert_eq!(
            resp,
            Some((CommandType::GetLogin, b"alice\0".to_vec()))
        );

        let resp =
            exec(&mut vault, CommandType::SetContext, b"EXAMPLE.com\0");
        assert_eq!(resp, Some((CommandType::SetContext, vec![OK])));

        let resp = exec(&mut vault, CommandType::SetPassword, b"hunter2\0");
        assert_eq!(resp, Some((CommandType::SetPassword, vec![OK])));
        let resp = exec(&mut vault, CommandType::GetPassword, &[]);
        assert_eq!(
            resp,
            Some((CommandType::GetPassword, b"hunter2\0".to_vec()))
        );

        let resp =
            exec(&mut vault, CommandType::CheckPassword, b"hunter2\0");
        assert_eq!(resp, Some((CommandType::CheckPassword, vec![OK])));
        let resp =
            exec(&mut vault, CommandType::CheckPassword, b"wrong!!\0");
        assert_eq!(resp, Some((CommandType::CheckPassword, vec![ERROR])));
    }

    #[test]
    fn check_password_without_context_is_not_applicable() {
        let mut vault = vault();
        enroll(&mut vault);
        let resp =
            exec(&mut vault, CommandType::CheckPassword, b"whatever\0");
        assert_eq!(resp, Some((CommandType::CheckPassword, vec![NA])));
    }

    #[test]
    fn context_without_card_reports_no_card() {
        let mut vault = vault();
        let resp =
            exec(&mut vault, CommandType::SetContext, b"example.com\0");
        assert_eq!(resp, Some((CommandType::SetContext, vec![NO_CARD])));
    }

    #[test]
    fn text_field_validation() {
        let mut vault = vault();
        enroll(&mut vault);
        exec(&mut vault, CommandType::AddContext, b"example.com\0");

        // Missing terminator.
        let resp = exec(&mut vault, CommandType::SetLogin, b"alice");
        assert_eq!(resp, Some((CommandType::SetLogin, vec![ERROR])));

        // Embedded NUL before the declared end.
        let resp = exec(&mut vault, CommandType::SetLogin, b"ali\0ce\0");
        assert_eq!(resp, Some((CommandType::SetLogin, vec![ERROR])));

        // Empty payload.
        let resp = exec(&mut vault, CommandType::SetLogin, b"");
        assert_eq!(resp, Some((CommandType::SetLogin, vec![ERROR])));

        // Service name over its field maximum.
        let mut long = [b'a'; 60].to_vec();
        long.push(0);
        let resp = exec(&mut vault, CommandType::AddContext, &long);
        assert_eq!(resp, Some((CommandType::AddContext, vec![ERROR])));
    }

    #[test]
    fn privileged_range_needs_management_mode() {
        let mut vault = vault();
        enroll(&mut vault);

        for (cmd, payload) in [
            (CommandType::ReadNode, &[0x10, 0x00][..]),
            (CommandType::GetFreeSlots, &[0x10, 0x00][..]),
            (CommandType::GetStartingParent, &[][..]),
            (CommandType::EndMemoryManagement, &[][..]),
        ] {
            let resp = exec(&mut vault, cmd, payload);
            assert_eq!(resp, Some((cmd, vec![ERROR])), "{}", cmd);
        }
    }

    #[test]
    fn management_mode_entry_denied_by_user() {
        let mut vault = vault();
        enroll(&mut vault);
        vault.ui.script(Confirmation::Denied);
        let resp = exec(&mut vault, CommandType::StartMemoryManagement, &[]);
        assert_eq!(
            resp,
            Some((CommandType::StartMemoryManagement, vec![ERROR]))
        );
        assert!(!vault.session.management_mode());
    }

    #[test]
    fn favorites_round_trip() {
        let mut vault = vault();
        enroll(&mut vault);
        enter_mgmt(&mut vault);

        let resp = exec(
            &mut vault,
            CommandType::SetFavorite,
            &[0x00, 0x10, 0x00, 0x11, 0x00],
        );
        assert_eq!(resp, Some((CommandType::SetFavorite, vec![OK])));

        let resp = exec(&mut vault, CommandType::GetFavorite, &[0x00]);
        assert_eq!(
            resp,
            Some((CommandType::GetFavorite, vec![0x10, 0x00, 0x11, 0x00]))
        );

        // Unset slot reads as the null pair.
        let resp = exec(&mut vault, CommandType::GetFavorite, &[0x01]);
        assert_eq!(
            resp,
            Some((CommandType::GetFavorite, vec![0, 0, 0, 0]))
        );

        // Out-of-range slot is a validation error.
        let resp = exec(&mut vault, CommandType::GetFavorite, &[16]);
        assert_eq!(resp, Some((CommandType::GetFavorite, vec![ERROR])));
    }

    #[test]
    fn starting_parent_and_ctr_accessors() {
        let mut vault = vault();
        enroll(&mut vault);
        exec(&mut vault, CommandType::AddContext, b"alpha.com\0");
        enter_mgmt(&mut vault);

        let (_, head) =
            exec(&mut vault, CommandType::GetStartingParent, &[]).unwrap();
        assert_eq!(head.len(), 2);
        assert_ne!(head, vec![0, 0]);

        let resp =
            exec(&mut vault, CommandType::SetStartingParent, &[0x20, 0x00]);
        assert_eq!(resp, Some((CommandType::SetStartingParent, vec![OK])));
        let (_, head) =
            exec(&mut vault, CommandType::GetStartingParent, &[]).unwrap();
        assert_eq!(head, vec![0x20, 0x00]);

        let resp =
            exec(&mut vault, CommandType::SetCtrValue, &[9, 8, 7]);
        assert_eq!(resp, Some((CommandType::SetCtrValue, vec![OK])));
        let resp = exec(&mut vault, CommandType::GetCtrValue, &[]);
        assert_eq!(resp, Some((CommandType::GetCtrValue, vec![9, 8, 7])));
    }

    #[test]
    fn free_slot_scan() {
        let mut vault = vault();
        enroll(&mut vault);
        enter_mgmt(&mut vault);

        let start = NodeAddr::new(2, 0).raw().to_le_bytes();
        let (_, bytes) =
            exec(&mut vault, CommandType::GetFreeSlots, &start).unwrap();
        assert_eq!(bytes.len(), 31 * 2);
        assert_eq!(
            &bytes[..2],
            &NodeAddr::new(2, 0).raw().to_le_bytes()
        );

        // Bad payload length.
        let resp = exec(&mut vault, CommandType::GetFreeSlots, &[0x10]);
        assert_eq!(resp, Some((CommandType::GetFreeSlots, vec![ERROR])));
    }

    #[test]
    fn multi_packet_node_write() {
        let mut vault = vault();
        enroll(&mut vault);
        enter_mgmt(&mut vault);

        let addr = NodeAddr::new(2, 0);
        let node = crate::storage::node::ParentNode::new(
            0,
            ServiceKind::Credential,
            b"written.com",
        );
        let bytes = zerocopy::AsBytes::as_bytes(&node).to_vec();

        // Three sub-indexed packets reconstruct the node.
        for (index, chunk) in
            bytes.chunks(NODE_WRITE_CHUNK).enumerate()
        {
            let packet = node_write_packet(addr, index as u8, chunk);
            let resp = exec(&mut vault, CommandType::WriteNode, &packet);
            assert_eq!(
                resp,
                Some((CommandType::WriteNode, vec![OK])),
                "packet {}",
                index
            );
        }

        let (_, read) =
            exec(&mut vault, CommandType::ReadNode, &addr.raw().to_le_bytes())
                .unwrap();
        assert_eq!(read, bytes);
    }

    #[test]
    fn node_write_rejects_mismatched_address_mid_sequence() {
        let mut vault = vault();
        enroll(&mut vault);
        enter_mgmt(&mut vault);

        let addr = NodeAddr::new(2, 0);
        let other = NodeAddr::new(2, 1);
        let node = crate::storage::node::ParentNode::new(
            0,
            ServiceKind::Credential,
            b"target.com",
        );
        let bytes = zerocopy::AsBytes::as_bytes(&node).to_vec();
        let chunks: Vec<&[u8]> =
            bytes.chunks(NODE_WRITE_CHUNK).collect();

        let resp = exec(
            &mut vault,
            CommandType::WriteNode,
            &node_write_packet(addr, 0, chunks[0]),
        );
        assert_eq!(resp, Some((CommandType::WriteNode, vec![OK])));

        // A mid-sequence packet for a different node bounces without
        // corrupting the staged page.
        let resp = exec(
            &mut vault,
            CommandType::WriteNode,
            &node_write_packet(other, 1, chunks[1]),
        );
        assert_eq!(resp, Some((CommandType::WriteNode, vec![ERROR])));

        // An overflowing sub-index bounces too.
        let resp = exec(
            &mut vault,
            CommandType::WriteNode,
            &node_write_packet(addr, 3, chunks[1]),
        );
        assert_eq!(resp, Some((CommandType::WriteNode, vec![ERROR])));

        for (index, chunk) in chunks.iter().enumerate().skip(1) {
            let resp = exec(
                &mut vault,
                CommandType::WriteNode,
                &node_write_packet(addr, index as u8, chunk),
            );
            assert_eq!(resp, Some((CommandType::WriteNode, vec![OK])));
        }
        let (_, read) =
            exec(&mut vault, CommandType::ReadNode, &addr.raw().to_le_bytes())
                .unwrap();
        assert_eq!(read, bytes);
    }

    #[test]
    fn read_node_of_other_user_is_denied() {
        let mut vault = vault();
        enroll(&mut vault);
        exec(&mut vault, CommandType::AddContext, b"alpha.com\0");
        enter_mgmt(&mut vault);
        let (_, head) =
            exec(&mut vault, CommandType::GetStartingParent, &[]).unwrap();

        // New card, new user.
        vault.on_card_removed();
        vault.card.cpz = [0x33; CPZ_LENGTH];
        vault.card.unlocked = false;
        vault.ui.set_screen(Screen::UnknownCard);
        vault.ui.pins.push_back(PIN);
        let mut payload = [0u8; CPZ_LENGTH + CTR_NONCE_LENGTH];
        payload[..CPZ_LENGTH].copy_from_slice(&vault.card.cpz.clone());
        payload[CPZ_LENGTH..].copy_from_slice(&[0x44; CTR_NONCE_LENGTH]);
        let resp = exec(&mut vault, CommandType::AddUnknownCard, &payload);
        assert_eq!(resp, Some((CommandType::AddUnknownCard, vec![OK])));
        assert_eq!(vault.session.user(), Some(1));
        enter_mgmt(&mut vault);

        // User 1 may not read user 0's parent: generic error, no payload.
        let resp = exec(&mut vault, CommandType::ReadNode, &head);
        assert_eq!(resp, Some((CommandType::ReadNode, vec![ERROR])));
    }

    #[test]
    fn card_removal_clears_session_and_context() {
        let mut vault = vault();
        enroll(&mut vault);
        exec(&mut vault, CommandType::AddContext, b"example.com\0");
        exec(&mut vault, CommandType::SetLogin, b"alice\0");

        vault.on_card_removed();

        let resp = exec(&mut vault, CommandType::GetLogin, &[]);
        assert_eq!(resp, Some((CommandType::GetLogin, vec![ERROR])));
        assert_eq!(
            vault.session.write_state(),
            WriteState::Idle
        );

        // The node itself survived; re-unlocking finds it again.
        vault.ui.set_screen(Screen::InsertedLocked);
        let resp = exec(
            &mut vault,
            CommandType::UnlockWithPin,
            &PIN.to_le_bytes(),
        );
        assert_eq!(resp, Some((CommandType::UnlockWithPin, vec![OK])));
        exec(&mut vault, CommandType::SetContext, b"example.com\0");
        let resp = exec(&mut vault, CommandType::GetLogin, &[]);
        assert_eq!(resp, Some((CommandType::GetLogin, b"alice\0".to_vec())));
    }

    #[test]
    fn unlock_with_pin_requires_locked_screen_and_right_pin() {
        let mut vault = vault();
        enroll(&mut vault);
        vault.on_card_removed();
        vault.card.unlocked = false;

        // Wrong screen.
        let resp = exec(
            &mut vault,
            CommandType::UnlockWithPin,
            &PIN.to_le_bytes(),
        );
        assert_eq!(resp, Some((CommandType::UnlockWithPin, vec![ERROR])));

        vault.ui.set_screen(Screen::InsertedLocked);
        let resp = exec(
            &mut vault,
            CommandType::UnlockWithPin,
            &9999u16.to_le_bytes(),
        );
        assert_eq!(resp, Some((CommandType::UnlockWithPin, vec![ERROR])));
        assert!(!vault.session.is_unlocked());

        let resp = exec(
            &mut vault,
            CommandType::UnlockWithPin,
            &PIN.to_le_bytes(),
        );
        assert_eq!(resp, Some((CommandType::UnlockWithPin, vec![OK])));
        assert!(vault.session.is_unlocked());
    }

    #[test]
    fn uid_provisioning_is_one_time() {
        let mut vault = vault();
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0xaa; nvm::UID_REQUEST_KEY_LENGTH]);
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6]);

        let resp = exec(&mut vault, CommandType::SetUid, &payload);
        assert_eq!(resp, Some((CommandType::SetUid, vec![OK])));
        let resp = exec(&mut vault, CommandType::SetUid, &payload);
        assert_eq!(resp, Some((CommandType::SetUid, vec![ERROR])));

        // Wrong request key.
        let resp = exec(
            &mut vault,
            CommandType::GetUid,
            &[0xbb; nvm::UID_REQUEST_KEY_LENGTH],
        );
        assert_eq!(resp, Some((CommandType::GetUid, vec![ERROR])));

        let resp = exec(
            &mut vault,
            CommandType::GetUid,
            &[0xaa; nvm::UID_REQUEST_KEY_LENGTH],
        );
        assert_eq!(
            resp,
            Some((CommandType::GetUid, vec![1, 2, 3, 4, 5, 6]))
        );
    }

    #[test]
    fn bootloader_is_password_gated() {
        let mut vault = vault();
        let password = [0xab; MAX_PAYLOAD];

        let resp = exec(
            &mut vault,
            CommandType::SetBootloaderPassword,
            &password,
        );
        assert_eq!(
            resp,
            Some((CommandType::SetBootloaderPassword, vec![OK]))
        );
        // One-time.
        let resp = exec(
            &mut vault,
            CommandType::SetBootloaderPassword,
            &password,
        );
        assert_eq!(
            resp,
            Some((CommandType::SetBootloaderPassword, vec![ERROR]))
        );

        // Wrong password: silence, no reset.
        let resp = exec(
            &mut vault,
            CommandType::JumpToBootloader,
            &[0x00; MAX_PAYLOAD],
        );
        assert_eq!(resp, None);
        assert!(!vault.reboot.bootloader_requested);

        // Right password: silence, reset scheduled.
        let resp =
            exec(&mut vault, CommandType::JumpToBootloader, &password);
        assert_eq!(resp, None);
        assert!(vault.reboot.bootloader_requested);
    }

    #[test]
    fn media_import_streams_pages() {
        let mut vault = vault();

        // Out-of-sequence data is refused.
        let resp = exec(&mut vault, CommandType::ImportMedia, &[0; 32]);
        assert_eq!(resp, Some((CommandType::ImportMedia, vec![ERROR])));

        // No bootloader password provisioned: the start is free (after
        // the mandatory delay).
        let resp = exec(
            &mut vault,
            CommandType::ImportMediaStart,
            &[0; MAX_PAYLOAD],
        );
        assert_eq!(resp, Some((CommandType::ImportMediaStart, vec![OK])));

        // 33 blocks of 32 bytes fill exactly one page.
        for i in 0..33u8 {
            let chunk = [i; 32];
            let resp =
                exec(&mut vault, CommandType::ImportMedia, &chunk);
            assert_eq!(
                resp,
                Some((CommandType::ImportMedia, vec![OK])),
                "block {}",
                i
            );
        }
        let resp = exec(&mut vault, CommandType::ImportMedia, &[0x55; 16]);
        assert_eq!(resp, Some((CommandType::ImportMedia, vec![OK])));
        let resp = exec(&mut vault, CommandType::ImportMediaEnd, &[]);
        assert_eq!(resp, Some((CommandType::ImportMediaEnd, vec![OK])));

        // First full page landed in the media region.
        let mut out = [0u8; 32];
        vault
            .store
            .flash_mut()
            .read(MEDIA_START, 0, &mut out)
            .unwrap();
        assert_eq!(out, [0; 32]);
        vault
            .store
            .flash_mut()
            .read(MEDIA_START, 32 * 32, &mut out)
            .unwrap();
        assert_eq!(out, [32; 32]);
        // The partial tail page was flushed by the end command.
        let mut tail = [0u8; 16];
        vault
            .store
            .flash_mut()
            .read(MEDIA_START + 1, 0, &mut tail)
            .unwrap();
        assert_eq!(tail, [0x55; 16]);

        // The import is closed now.
        let resp = exec(&mut vault, CommandType::ImportMedia, &[0; 32]);
        assert_eq!(resp, Some((CommandType::ImportMedia, vec![ERROR])));
    }

    #[test]
    fn parameters_round_trip_and_refresh_caches() {
        let mut vault = vault();
        assert!(!vault.timeout_enabled());

        let resp = exec(
            &mut vault,
            CommandType::SetParameter,
            &[Param::LockTimeoutEnable.to_wire_value(), 1],
        );
        assert_eq!(resp, Some((CommandType::SetParameter, vec![OK])));
        assert!(vault.timeout_enabled());

        let resp = exec(
            &mut vault,
            CommandType::GetParameter,
            &[Param::LockTimeoutEnable.to_wire_value()],
        );
        assert_eq!(resp, Some((CommandType::GetParameter, vec![1])));

        let resp = exec(
            &mut vault,
            CommandType::SetParameter,
            &[Param::ScreenContrast.to_wire_value(), 0x80],
        );
        assert_eq!(resp, Some((CommandType::SetParameter, vec![OK])));
        assert_eq!(vault.ui.contrast, 0x80);

        // Unknown parameter id.
        let resp =
            exec(&mut vault, CommandType::SetParameter, &[0x77, 1]);
        assert_eq!(resp, Some((CommandType::SetParameter, vec![ERROR])));
    }

    #[test]
    fn random_bytes() {
        let mut vault = vault();
        let (_, bytes) =
            exec(&mut vault, CommandType::GetRandomNumber, &[]).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0], 7);
        assert_eq!(bytes[31], 7 + 31);
    }

    #[test]
    fn card_zone_access() {
        let mut vault = vault();
        // Locked: everything bounces.
        let resp = exec(&mut vault, CommandType::ReadCardLogin, &[]);
        assert_eq!(resp, Some((CommandType::ReadCardLogin, vec![ERROR])));

        enroll(&mut vault);
        let resp =
            exec(&mut vault, CommandType::SetCardLogin, b"me@host\0");
        assert_eq!(resp, Some((CommandType::SetCardLogin, vec![OK])));
        let (_, zone) =
            exec(&mut vault, CommandType::ReadCardLogin, &[]).unwrap();
        assert!(zone.starts_with(b"me@host\0"));

        // The password read is confirmation-gated.
        vault.ui.script(Confirmation::Denied);
        let resp = exec(&mut vault, CommandType::ReadCardPassword, &[]);
        assert_eq!(
            resp,
            Some((CommandType::ReadCardPassword, vec![ERROR]))
        );
        vault.ui.script(Confirmation::Approved);
        let (_, zone) =
            exec(&mut vault, CommandType::ReadCardPassword, &[]).unwrap();
        assert_eq!(zone.len(), crate::hardware::CARD_PASSWORD_LENGTH);
    }

    #[test]
    fn data_service_flow() {
        let mut vault = vault();
        enroll(&mut vault);

        let resp =
            exec(&mut vault, CommandType::AddDataService, b"notes\0");
        assert_eq!(resp, Some((CommandType::AddDataService, vec![OK])));

        let mut first = vec![0u8]; // not last
        first.extend_from_slice(&[0xaa; 32]);
        let resp =
            exec(&mut vault, CommandType::WriteDataBlock, &first);
        assert_eq!(resp, Some((CommandType::WriteDataBlock, vec![OK])));

        let mut second = vec![1u8]; // last
        second.extend_from_slice(&[0xbb; 32]);
        let resp =
            exec(&mut vault, CommandType::WriteDataBlock, &second);
        assert_eq!(resp, Some((CommandType::WriteDataBlock, vec![OK])));

        // Closed chain refuses more data.
        let resp =
            exec(&mut vault, CommandType::WriteDataBlock, &first);
        assert_eq!(
            resp,
            Some((CommandType::WriteDataBlock, vec![ERROR]))
        );

        // Re-select to read back.
        let resp =
            exec(&mut vault, CommandType::SetDataService, b"notes\0");
        assert_eq!(resp, Some((CommandType::SetDataService, vec![OK])));
        let (_, block) =
            exec(&mut vault, CommandType::ReadDataBlock, &[]).unwrap();
        assert_eq!(block, vec![0xaa; 32]);
        let (_, block) =
            exec(&mut vault, CommandType::ReadDataBlock, &[]).unwrap();
        assert_eq!(block, vec![0xbb; 32]);
        let resp = exec(&mut vault, CommandType::ReadDataBlock, &[]);
        assert_eq!(resp, Some((CommandType::ReadDataBlock, vec![ERROR])));
    }

    #[test]
    fn cpz_table_enumeration() {
        let mut vault = vault();
        enroll(&mut vault);
        enter_mgmt(&mut vault);

        // Entry 0 was written by enrollment.
        let (_, bytes) =
            exec(&mut vault, CommandType::GetCpzCtr, &[0]).unwrap();
        assert_eq!(&bytes[..CPZ_LENGTH], &CPZ);
        assert_eq!(&bytes[CPZ_LENGTH..], &NONCE);
        let resp = exec(&mut vault, CommandType::GetCpzCtr, &[1]);
        assert_eq!(resp, Some((CommandType::GetCpzCtr, vec![ERROR])));

        // Add a second pairing for this user.
        let mut entry = Vec::new();
        entry.extend_from_slice(&[0x55; CPZ_LENGTH]);
        entry.extend_from_slice(&[0x66; CTR_NONCE_LENGTH]);
        let resp = exec(&mut vault, CommandType::AddCpzCtr, &entry);
        assert_eq!(resp, Some((CommandType::AddCpzCtr, vec![OK])));
        // Duplicates are refused.
        let resp = exec(&mut vault, CommandType::AddCpzCtr, &entry);
        assert_eq!(resp, Some((CommandType::AddCpzCtr, vec![ERROR])));

        let (_, bytes) =
            exec(&mut vault, CommandType::GetCpzCtr, &[1]).unwrap();
        assert_eq!(&bytes[..CPZ_LENGTH], &[0x55; CPZ_LENGTH]);
    }

    #[test]
    fn get_card_cpz_is_screen_gated() {
        let mut vault = vault();
        vault.ui.set_screen(Screen::NoCard);
        let resp = exec(&mut vault, CommandType::GetCardCpz, &[]);
        assert_eq!(resp, Some((CommandType::GetCardCpz, vec![ERROR])));

        vault.ui.set_screen(Screen::UnknownCard);
        let (_, bytes) =
            exec(&mut vault, CommandType::GetCardCpz, &[]).unwrap();
        assert_eq!(bytes, CPZ.to_vec());
    }

    #[test]
    fn end_memory_management_drops_privilege_and_staging() {
        let mut vault = vault();
        enroll(&mut vault);
        enter_mgmt(&mut vault);

        // Stage a write, then exit the mode; the staging state must die
        // with it.
        let addr = NodeAddr::new(2, 0);
        let node = crate::storage::node::ParentNode::new(
            0,
            ServiceKind::Credential,
            b"late.com",
        );
        let bytes = zerocopy::AsBytes::as_bytes(&node).to_vec();
        let resp = exec(
            &mut vault,
            CommandType::WriteNode,
            &node_write_packet(addr, 0, &bytes[..NODE_WRITE_CHUNK]),
        );
        assert_eq!(resp, Some((CommandType::WriteNode, vec![OK])));

        let resp =
            exec(&mut vault, CommandType::EndMemoryManagement, &[]);
        assert_eq!(
            resp,
            Some((CommandType::EndMemoryManagement, vec![OK]))
        );
        assert!(!vault.session.management_mode());
        assert_eq!(vault.session.write_state(), WriteState::Idle);
        assert_eq!(vault.ui.screen, Screen::InsertedUnlocked);
    }

    #[test]
    fn reset_card_only_from_unknown_card_screen() {
        let mut vault = vault();
        vault.ui.set_screen(Screen::InsertedLocked);
        let resp = exec(&mut vault, CommandType::ResetCard, &[]);
        assert_eq!(resp, Some((CommandType::ResetCard, vec![ERROR])));
        assert!(!vault.card.erased);

        vault.ui.set_screen(Screen::UnknownCard);
        vault.ui.pins.push_back(PIN);
        let resp = exec(&mut vault, CommandType::ResetCard, &[]);
        assert_eq!(resp, Some((CommandType::ResetCard, vec![OK])));
        assert!(vault.card.erased);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut vault = vault();
        let big = [0u8; 80];
        let resp = exec(&mut vault, CommandType::Ping, &big);
        assert_eq!(resp, Some((CommandType::Ping, vec![ERROR])));
    }
}
