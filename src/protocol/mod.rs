// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Protocol messages.
//!
//! A request packet is a fixed header `{ command: u8, length: u8 }`
//! followed by up to `length` payload bytes, the whole packet capped at the
//! transport's transfer size. Responses reuse the same shape; most commands
//! answer with a single [`ReturnCode`] byte echoing the request's command
//! byte, while data-returning commands answer with the natural size of the
//! returned field.
//!
//! The command byte space is split into a general range and the reserved
//! data-management range ([`FIRST_DATA_MGMT_COMMAND`] ..=
//! [`LAST_DATA_MGMT_COMMAND`]) that is only legal while memory management
//! mode is active. Host-side client code depends on that boundary, so it is
//! part of the wire contract, not an implementation detail.
//!
//! This module is deliberately policy-only: [`CommandType`] knows each
//! command's text-field limits and privilege requirements, and the
//! [`packets`] module knows the multi-field payload layouts, but neither
//! touches device state. The dispatcher in [`crate::server`] is the only
//! consumer of the policy table.

#[macro_use]
mod macros;

#[macro_use]
pub mod wire;

pub mod packets;
pub mod status;

pub use status::DeviceStatus;
pub use status::StatusFlag;

/// Maximum payload length of a single packet: the transport's 64-byte
/// transfer minus the two header bytes.
pub const MAX_PAYLOAD: usize = 62;

/// Maximum stored length of a service name, terminating NUL included.
pub const SERVICE_LENGTH: usize = 58;

/// Maximum stored length of a login, terminating NUL included.
pub const LOGIN_LENGTH: usize = 63;

/// Maximum stored length of a password, terminating NUL included.
pub const PASSWORD_LENGTH: usize = 32;

/// Maximum stored length of a credential description, NUL included.
pub const DESCRIPTION_LENGTH: usize = 24;

/// Size of one opaque data-service block.
pub const DATA_BLOCK_LENGTH: usize = 32;

/// Payload bytes per node-write packet: the payload minus the two address
/// bytes and the sub-index byte.
pub const NODE_WRITE_CHUNK: usize = MAX_PAYLOAD - 3;

/// First command byte of the privileged data-management range.
pub const FIRST_DATA_MGMT_COMMAND: u8 = 0xc5;

/// Last command byte of the privileged data-management range.
pub const LAST_DATA_MGMT_COMMAND: u8 = 0xd2;

/// The version string reported by [`CommandType::Version`]: flash-chip
/// designator followed by the firmware version.
pub const FIRMWARE_VERSION: &str = concat!("8m_v", env!("CARGO_PKG_VERSION"));

wire_enum! {
    /// A command byte.
    ///
    /// This enum covers every command the device understands, including the
    /// development-only erase commands; whether a given command is honored
    /// is the dispatcher's decision.
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub enum CommandType: u8 {
        /// Echo check; answers with the request's first payload bytes.
        Ping = 0xa1,
        /// Requests the firmware version string.
        Version = 0xa2,
        /// Selects a credential service as the current context.
        SetContext = 0xa3,
        /// Reads the login of the current context.
        GetLogin = 0xa4,
        /// Reads (and decrypts) the password of the current context.
        GetPassword = 0xa5,
        /// Writes the login of the current context.
        SetLogin = 0xa6,
        /// Writes (and encrypts) the password of the current context.
        SetPassword = 0xa7,
        /// Compares a candidate against the current context's password.
        CheckPassword = 0xa8,
        /// Creates a new credential service and selects it.
        AddContext = 0xa9,
        /// One-time programming of the bootloader password.
        SetBootloaderPassword = 0xaa,
        /// Password-gated reset into the bootloader.
        JumpToBootloader = 0xab,
        /// Requests 32 bytes of hardware randomness.
        GetRandomNumber = 0xac,
        /// Requests entry into memory management mode.
        StartMemoryManagement = 0xad,
        /// Opens a media bundle import session.
        ImportMediaStart = 0xae,
        /// Streams one packet of media bundle data.
        ImportMedia = 0xaf,
        /// Closes a media bundle import session.
        ImportMediaEnd = 0xb0,
        /// Writes a device parameter byte.
        SetParameter = 0xb1,
        /// Reads a device parameter byte.
        GetParameter = 0xb2,
        /// Erases the inserted (unknown) card after an unlock proof.
        ResetCard = 0xb3,
        /// Reads the card-stored login.
        ReadCardLogin = 0xb4,
        /// Reads the card-stored password.
        ReadCardPassword = 0xb5,
        /// Writes the card-stored login.
        SetCardLogin = 0xb6,
        /// Writes the card-stored password.
        SetCardPassword = 0xb7,
        /// Enrolls the current user on an inserted unknown card.
        AddUnknownCard = 0xb8,
        /// Requests the device status bitmask.
        Status = 0xb9,
        /// Reads the description of the current context.
        GetDescription = 0xba,
        /// Sets the packed date stamped onto node writes.
        SetDate = 0xbb,
        /// One-time provisioning of the device UID and its request key.
        SetUid = 0xbc,
        /// Reads the device UID, gated on the request key.
        GetUid = 0xbd,
        /// Selects a data service as the current context.
        SetDataService = 0xbe,
        /// Creates a new data service and selects it.
        AddDataService = 0xbf,
        /// Appends one 32-byte block to the current data service.
        WriteDataBlock = 0xc0,
        /// Reads the next 32-byte block of the current data service.
        ReadDataBlock = 0xc1,
        /// Reads the inserted card's code protected zone.
        GetCardCpz = 0xc2,
        /// Cancels whatever the host is waiting on. Never answered.
        CancelRequest = 0xc3,
        /// Unlocks the card with a PIN typed on the computer; a last
        /// resort for devices with a broken screen.
        UnlockWithPin = 0xc4,
        /// Reads one raw node. Privileged.
        ReadNode = 0xc5,
        /// Writes one raw node across sub-indexed packets. Privileged.
        WriteNode = 0xc6,
        /// Reads a favorite slot. Privileged.
        GetFavorite = 0xc7,
        /// Writes a favorite slot. Privileged.
        SetFavorite = 0xc8,
        /// Reads the credential starting-parent pointer. Privileged.
        GetStartingParent = 0xc9,
        /// Writes the credential starting-parent pointer. Privileged.
        SetStartingParent = 0xca,
        /// Reads the user profile CTR seed. Privileged.
        GetCtrValue = 0xcb,
        /// Writes the user profile CTR seed. Privileged.
        SetCtrValue = 0xcc,
        /// Adds a CPZ → CTR-nonce entry for the current user. Privileged.
        AddCpzCtr = 0xcd,
        /// Reads one indexed CPZ → CTR-nonce entry. Privileged.
        GetCpzCtr = 0xce,
        /// Scans for free node slots from a cursor. Privileged.
        GetFreeSlots = 0xcf,
        /// Reads the data starting-parent pointer. Privileged.
        GetDataStartingParent = 0xd0,
        /// Writes the data starting-parent pointer. Privileged.
        SetDataStartingParent = 0xd1,
        /// Leaves memory management mode. Privileged.
        EndMemoryManagement = 0xd2,
        /// Development builds only: wipe the settings EEPROM.
        EraseEeprom = 0xe0,
        /// Development builds only: wipe the node store.
        EraseFlash = 0xe1,
        /// Development builds only: erase the inserted card.
        EraseCard = 0xe2,
    }
}

impl CommandType {
    /// Returns the maximum text-field length for this command, NUL
    /// included, or `None` if the command does not carry a text field.
    ///
    /// Commands with a text field must have their payload validated (and,
    /// for service names, lower-cased) before any handler runs.
    pub fn max_text_len(self) -> Option<usize> {
        use crate::hardware;
        match self {
            Self::SetContext
            | Self::AddContext
            | Self::SetDataService
            | Self::AddDataService => Some(SERVICE_LENGTH),
            Self::SetLogin => Some(LOGIN_LENGTH),
            Self::SetPassword | Self::CheckPassword => Some(PASSWORD_LENGTH),
            Self::SetCardLogin => Some(hardware::CARD_LOGIN_LENGTH),
            Self::SetCardPassword => Some(hardware::CARD_PASSWORD_LENGTH),
            _ => None,
        }
    }

    /// Returns `true` when this command's text field is a service name,
    /// which is lower-cased in place during validation so that stored names
    /// are always already normalized.
    pub fn is_service_name(self) -> bool {
        matches!(
            self,
            Self::SetContext
                | Self::AddContext
                | Self::SetDataService
                | Self::AddDataService
        )
    }

    /// Returns `true` when this command lies in the reserved
    /// data-management range and therefore requires memory management mode.
    pub fn requires_management_mode(self) -> bool {
        use crate::protocol::wire::WireEnum as _;
        let byte = self.to_wire_value();
        (FIRST_DATA_MGMT_COMMAND..=LAST_DATA_MGMT_COMMAND).contains(&byte)
    }
}

wire_enum! {
    /// A device parameter id, as carried by `SetParameter`/`GetParameter`.
    ///
    /// Each parameter is one byte of NVM. The dispatcher refreshes its
    /// cached copies (and pushes the contrast to the display) whenever one
    /// is written, so readers never go back to NVM on the hot path.
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub enum Param: u8 {
        /// Keyboard layout used when typing credentials out.
        KeyboardLayout = 0x01,
        /// Whether the inactivity lock timeout is armed.
        LockTimeoutEnable = 0x02,
        /// Inactivity lock timeout, in minutes.
        LockTimeout = 0x03,
        /// Screensaver enable.
        Screensaver = 0x04,
        /// Scroll wheel direction inversion.
        WheelDirectionReverse = 0x05,
        /// Display contrast level.
        ScreenContrast = 0x06,
        /// Whether a connected host is required at boot.
        OfflineMode = 0x07,
        /// Flash the screen on user-presence requests.
        FlashScreen = 0x08,
    }
}

wire_enum! {
    /// The single status byte most commands answer with.
    ///
    /// Internally the layers report much finer-grained errors; all of them
    /// collapse to one of these at the protocol boundary.
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub enum ReturnCode: u8 {
        /// The command failed. No detail is surfaced to the host.
        Error = 0x00,
        /// The command succeeded.
        Ok = 0x01,
        /// The command was not applicable (for example, a password check
        /// with no context resolved).
        NotApplicable = 0x02,
        /// The command requires an unlocked card and none is available.
        NoCard = 0x03,
    }
}
