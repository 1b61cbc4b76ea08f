// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The device status bitmask.
//!
//! The status answer is the one message a host can always get, even while
//! the device is parked on the PIN entry screen; clients poll it to decide
//! whether to tell the user to insert or unlock their card.

use enumflags2::bitflags;
use enumflags2::BitFlags;

/// One bit of the status byte.
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusFlag {
    /// A card is physically present in the reader.
    CardPresent = 0b0001,
    /// The device is waiting for the user to enter their PIN.
    AwaitingPin = 0b0010,
    /// The inserted card has been unlocked.
    Unlocked = 0b0100,
    /// The unknown-card screen is being displayed.
    UnknownCardScreen = 0b1000,
}

/// The status byte: a set of [`StatusFlag`]s.
pub type DeviceStatus = BitFlags<StatusFlag>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bit_assignments() {
        // Host clients hard-code these bit positions.
        assert_eq!(StatusFlag::CardPresent as u8, 1 << 0);
        assert_eq!(StatusFlag::AwaitingPin as u8, 1 << 1);
        assert_eq!(StatusFlag::Unlocked as u8, 1 << 2);
        assert_eq!(StatusFlag::UnknownCardScreen as u8, 1 << 3);

        let status = StatusFlag::CardPresent | StatusFlag::Unlocked;
        assert_eq!(status.bits(), 0b0101);
        assert_eq!(DeviceStatus::empty().bits(), 0);
    }
}
