// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Pluggable hardware functionality.
//!
//! This module provides traits for plugging in the device peripherals the
//! core coordinates but does not implement: the smartcard reader, the
//! display/input front panel, the timer/watchdog, the random number
//! generator, the settings EEPROM and the reset controller. `keyvault`
//! consumes these to answer protocol requests; integrations provide real
//! drivers, and the test suite provides the fakes at the bottom of this
//! module.

use static_assertions::assert_obj_safe;

pub mod flash;

/// Length in bytes of a smartcard's code protected zone (CPZ).
pub const CPZ_LENGTH: usize = 8;

/// Length in bytes of the CTR nonce paired with a CPZ in the lookup table.
pub const CTR_NONCE_LENGTH: usize = 16;

/// Length in bytes of the AES key material held by an unlocked card.
pub const KEY_LENGTH: usize = 32;

/// Capacity in bytes of the card's login storage zone.
pub const CARD_LOGIN_LENGTH: usize = 62;

/// Capacity in bytes of the card's password storage zone.
pub const CARD_PASSWORD_LENGTH: usize = 30;

/// What kind of card, if any, is currently in the reader.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CardStatus {
    /// No card inserted.
    Absent,
    /// A card provisioned for this product family.
    KnownUser,
    /// A factory-blank card.
    Blank,
    /// Something unreadable or foreign.
    Invalid,
}

/// A smartcard operation error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CardError {
    /// No card is inserted.
    Absent,
    /// The presented PIN was wrong. The card's own attempt counter is the
    /// rate limiter; this core does not add one.
    WrongPin,
    /// The card refused the operation (attempt counter exhausted, write
    /// protection, etc.).
    Refused,
    /// Electrical or protocol-level failure.
    Comms,
}

/// Provides access to the smartcard in the reader.
///
/// The electrical protocol, zone offsets and attempt counters all live in
/// the driver behind this trait; the core only sees whole-zone reads and
/// writes plus the unlock/erase verbs.
pub trait SmartCard {
    /// Returns whether a card is physically present.
    fn is_present(&self) -> bool;

    /// Identifies the inserted card.
    fn detect(&mut self) -> CardStatus;

    /// Attempts to unlock the card with `pin`.
    fn unlock_with_pin(&mut self, pin: u16) -> Result<(), CardError>;

    /// Erases the card back to its factory-blank state.
    fn erase(&mut self) -> Result<(), CardError>;

    /// Reads the card's code protected zone.
    fn read_protected_zone(
        &self,
        out: &mut [u8; CPZ_LENGTH],
    ) -> Result<(), CardError>;

    /// Reads the AES key material from an unlocked card.
    fn read_key(&self, out: &mut [u8; KEY_LENGTH]) -> Result<(), CardError>;

    /// Reads the card's login zone.
    fn read_login_zone(
        &self,
        out: &mut [u8; CARD_LOGIN_LENGTH],
    ) -> Result<(), CardError>;

    /// Replaces the card's login zone with `data`, zero-padded.
    fn write_login_zone(&mut self, data: &[u8]) -> Result<(), CardError>;

    /// Reads the card's password zone.
    fn read_password_zone(
        &self,
        out: &mut [u8; CARD_PASSWORD_LENGTH],
    ) -> Result<(), CardError>;

    /// Replaces the card's password zone with `data`, zero-padded.
    fn write_password_zone(&mut self, data: &[u8]) -> Result<(), CardError>;
}
assert_obj_safe!(SmartCard);

/// Screens the front panel can display.
///
/// The dispatcher reads the current screen as a coarse mode indicator (for
/// example, card-lifecycle commands are only honored while the matching
/// screen is up) and moves between screens as the session changes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Screen {
    /// No card in the reader.
    NoCard,
    /// A known card is inserted but still locked.
    InsertedLocked,
    /// A known card is inserted and unlocked.
    InsertedUnlocked,
    /// An unknown (but valid) card is inserted.
    UnknownCard,
    /// An unreadable or foreign card is inserted.
    InvalidCard,
    /// Memory management mode is active.
    MemoryManagement,
}

/// Prompts the confirmation gate can put in front of the user.
///
/// The rendering (wording, translation, layout) belongs to the display
/// pipeline; the core only names which question to ask.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Prompt {
    /// "Approve memory management mode?"
    EnterMemoryManagement,
    /// "Send the card-stored password over USB?"
    SendCardPassword,
    /// "Overwrite the card-stored login?"
    SetCardLogin,
    /// "Overwrite the card-stored password?"
    SetCardPassword,
    /// "Allow a firmware/media bundle update?"
    AllowUpdate,
    /// "Accept a PIN typed on the computer?"
    PinFromComputer,
}

/// The outcome of a confirmation prompt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// The user pressed the accept control.
    Approved,
    /// The user pressed the deny control.
    Denied,
    /// The prompt timed out. Treated as a denial everywhere.
    TimedOut,
}

/// Provides access to the display and physical input controls.
pub trait UserInterface {
    /// Returns the screen currently considered "home".
    fn current_screen(&self) -> Screen;

    /// Changes the home screen.
    fn set_screen(&mut self, screen: Screen);

    /// Redraws the home screen, dismissing any overlay a prompt left up.
    fn refresh(&mut self);

    /// Presents `prompt` and blocks until the user answers or the prompt
    /// times out.
    ///
    /// Implementations must service the watchdog while blocking.
    fn confirm(&mut self, prompt: Prompt) -> Confirmation;

    /// Runs the on-device PIN entry flow. Returns `None` if the user backed
    /// out.
    fn prompt_pin(&mut self) -> Option<u16>;

    /// Applies a new display contrast setting.
    fn set_contrast(&mut self, _level: u8) {}

    /// Notes user-visible activity, waking the display and rearming the
    /// inactivity lock timer.
    fn activity(&mut self) {}
}
assert_obj_safe!(UserInterface);

/// An opaque point in time produced by [`Clock::deadline`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(pub u64);

/// Provides deadlines and the idle/watchdog tick.
///
/// The dispatcher busy-waits in exactly two situations: the minimum-duration
/// guard around password comparisons and the mandatory delay before
/// update-related commands. Both go through [`Clock::wait_until`], which
/// services [`Clock::idle_tick`] on every iteration so the watchdog keeps
/// getting fed.
pub trait Clock {
    /// Returns a deadline `ms` milliseconds from now.
    fn deadline(&mut self, ms: u32) -> Deadline;

    /// Returns whether `deadline` has passed.
    fn is_expired(&mut self, deadline: Deadline) -> bool;

    /// Performs one round of idle housekeeping (watchdog feed, at minimum).
    fn idle_tick(&mut self);

    /// Blocks until `deadline` passes, servicing [`Clock::idle_tick`].
    fn wait_until(&mut self, deadline: Deadline)
    where
        Self: Sized,
    {
        while !self.is_expired(deadline) {
            self.idle_tick();
        }
    }
}
assert_obj_safe!(Clock);

/// Provides hardware random bytes.
pub trait Rng {
    /// Fills `out` with random bytes.
    fn fill(&mut self, out: &mut [u8]);
}
assert_obj_safe!(Rng);

/// Provides the watchdog-driven reset into the bootloader.
pub trait Reboot {
    /// Schedules a reset into the bootloader. On real hardware this does
    /// not return; fakes record the call instead.
    fn jump_to_bootloader(&mut self);
}
assert_obj_safe!(Reboot);

/// Byte-addressed persistent settings storage (EEPROM).
///
/// The cells the core uses are laid out by the constants in [`nvm`]; the
/// trait itself is just raw byte access.
pub trait Nvm {
    /// Reads one byte at `addr`.
    fn read_byte(&self, addr: u16) -> u8;

    /// Writes one byte at `addr`.
    fn write_byte(&mut self, addr: u16, value: u8);

    /// Reads `out.len()` bytes starting at `addr`.
    fn read_block(&self, addr: u16, out: &mut [u8]) {
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.read_byte(addr + i as u16);
        }
    }

    /// Writes `data` starting at `addr`.
    fn write_block(&mut self, addr: u16, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.write_byte(addr + i as u16, *b);
        }
    }
}
assert_obj_safe!(Nvm);

/// The NVM cell layout.
///
/// One-time sentinels are a single magic byte: anything else in the cell
/// means "not set". The magic values are arbitrary but must never be 0x00
/// or 0xff, the two states an unprogrammed EEPROM cell can read as.
pub mod nvm {
    use crate::hardware::CPZ_LENGTH;
    use crate::hardware::CTR_NONCE_LENGTH;

    /// Base address of the byte-parameter array.
    pub const PARAM_BASE: u16 = 0x0000;
    /// Number of reserved parameter cells.
    pub const PARAM_COUNT: u16 = 0x20;

    /// "UID request key has been provisioned" sentinel cell.
    pub const UID_KEY_SET: u16 = 0x0020;
    /// The UID request key (16 bytes).
    pub const UID_REQUEST_KEY: u16 = 0x0021;
    /// Length of the UID request key.
    pub const UID_REQUEST_KEY_LENGTH: usize = 16;
    /// The device UID (6 bytes).
    pub const UID: u16 = 0x0031;
    /// Length of the device UID.
    pub const UID_LENGTH: usize = 6;

    /// "Bootloader password has been set" sentinel cell.
    pub const BOOT_PASSWORD_SET: u16 = 0x0037;
    /// The bootloader password (one full packet payload).
    pub const BOOT_PASSWORD: u16 = 0x0038;

    /// Boot key word checked by the bootloader at reset.
    pub const BOOT_KEY: u16 = 0x0076;
    /// Backup copy of the boot key word.
    pub const BOOT_KEY_BACKUP: u16 = 0x0078;

    /// Base address of the CPZ → CTR-nonce lookup table.
    pub const CPZ_LUT: u16 = 0x007a;
    /// Number of entries in the CPZ lookup table.
    pub const CPZ_LUT_ENTRIES: u8 = 16;
    /// Size of one CPZ lookup entry: user id, CPZ, CTR nonce.
    pub const CPZ_LUT_ENTRY_SIZE: usize = 1 + CPZ_LENGTH + CTR_NONCE_LENGTH;

    /// Magic byte marking a one-time sentinel cell as set.
    pub const SENTINEL_SET: u8 = 0x59;
    /// Value of an unused CPZ lookup entry's user-id byte.
    pub const CPZ_ENTRY_FREE: u8 = 0xff;
    /// Boot key value that diverts the next reset into the bootloader.
    pub const BOOT_KEY_BOOTLOADER: u16 = 0x7ab2;
    /// Boot key value for a normal application boot.
    pub const BOOT_KEY_APP: u16 = 0x2ba7;
}
