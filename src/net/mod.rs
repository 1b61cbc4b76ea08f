// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Transport interfaces.
//!
//! This module provides generic, abstract interfaces for receiving request
//! packets and sending response packets. The term "transport" is used
//! loosely: anything that can deliver a `{command, length, payload}` packet
//! qualifies, whether that is a USB HID endpoint, a UART, or the in-memory
//! port the tests use.
//!
//! The transport owns byte-level framing, including the length byte of the
//! packet header; the core only sees a parsed [`Header`] and a payload
//! stream, and builds responses through the same abstraction.

use crate::io;
use crate::protocol::CommandType;

pub mod host;

/// A transport error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Indicates an underlying I/O error.
    Io(io::Error),
    /// Indicates an error constructing (or interpreting) a packet header,
    /// including an unknown command byte.
    BadHeader,
    /// Indicates that the other end of a connection is "disconnected". This
    /// can mean anything from a connection being explicitly terminated, to
    /// some internal timeout expiring.
    Disconnected,
    /// Indicates that some operation was done out of order, such as
    /// attempting to reference part of the request once a reply has begun.
    OutOfOrder,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// A parsed packet header.
///
/// The length byte is deliberately absent: it describes the payload stream
/// the port hands out, and the port re-derives it for responses from the
/// number of bytes actually written.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Header {
    /// The packet's command byte.
    pub command: CommandType,
}
