// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The `keyvault` server.
//!
//! A keyvault "server" is the firmware-side endpoint of the host protocol:
//! it receives request packets from a [`crate::net::host::HostPort`],
//! validates them against the session state, routes them to the node store
//! and context resolver, and produces at most one response packet each.
//!
//! [`Vault`] is the server; [`Options`] carries the hardware handles an
//! integration plugs in.

mod options;
mod vault;

pub use options::Options;
pub use vault::Origin;
pub use vault::Vault;

use crate::net;
use crate::protocol::wire;

/// An error returned by the server.
///
/// These are transport-level failures only. Anything that goes wrong
/// *inside* a command is answered on the wire with the generic error byte
/// and is not an `Error`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Indicates an error originating from the transport.
    Network(net::Error),

    /// Represents a failure during marshalling.
    Wire(wire::Error),
}

impl From<net::Error> for Error {
    fn from(e: net::Error) -> Self {
        Self::Network(e)
    }
}

impl From<wire::Error> for Error {
    fn from(e: wire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<crate::io::Error> for Error {
    fn from(e: crate::io::Error) -> Self {
        Self::Wire(wire::Error::Io(e))
    }
}
