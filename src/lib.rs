// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! `keyvault` is the firmware core of a hardware password manager: the
//! command dispatcher and flash-node manager sitting between an untrusted
//! host and the device's credential store.
//!
//! The crate deliberately does not implement transport framing, display
//! rendering, smartcard electricals, raw flash programming, AES primitives
//! or the RNG driver. Those are *consumed* through the traits in
//! [`hardware`], [`net`] and [`crypto`], so that the same core can be
//! integrated against real peripherals or against the fake hardware used by
//! the host-side test suite.
//!
//! The interesting pieces:
//!
//! - [`protocol`] defines the fixed `{command, length, payload}` packet
//!   format and the per-command validation policy.
//! - [`storage`] implements the flash-resident node store: parent/child
//!   chains, data-block chains, free-slot scanning, per-user profiles and
//!   ownership enforcement.
//! - [`context`] resolves a service name to a credential context and
//!   performs the encrypted get/set operations against it.
//! - [`server`] ties everything together: [`server::Vault`] parses incoming
//!   packets, walks them through the validation pipeline and routes them to
//!   handlers, gating the privileged ones behind session state and
//!   user confirmation.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

#[cfg(feature = "log")]
extern crate log as __raw_log;

#[macro_use]
mod debug;

#[macro_use]
pub mod protocol;

pub mod context;
pub mod crypto;
pub mod hardware;
pub mod io;
pub mod net;
pub mod server;
pub mod session;
pub mod storage;
