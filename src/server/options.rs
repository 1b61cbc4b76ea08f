// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Options for initializing a keyvault server.

#[cfg(doc)]
use crate::server::Vault;

/// Options struct for initializing a [`Vault`].
///
/// Every field is an integration-provided hardware handle; the server owns
/// them for its lifetime. `media_page_start` splits the flash: pages below
/// it (past the profile region) hold the node store, pages from it onward
/// hold the media bundle.
pub struct Options<F, C, U, N, R, K, B, E> {
    /// The page flash holding the node store and media region.
    pub flash: F,
    /// The smartcard reader.
    pub card: C,
    /// The display and input front panel.
    pub ui: U,
    /// The settings EEPROM.
    pub nvm: N,
    /// The hardware random number generator.
    pub rng: R,
    /// The timer/watchdog clock.
    pub clock: K,
    /// The reset controller.
    pub reboot: B,
    /// The credential cipher engine.
    pub cipher: E,
    /// First flash page of the media region.
    pub media_page_start: u16,
}
