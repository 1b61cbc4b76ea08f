// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Device-to-host communication.
//!
//! See [`HostPort`] for detailed information.

use crate::io::Cursor;
use crate::io::Read;
use crate::io::Write;
use crate::net;

/// Represents a physical port over which a host talks to the device.
///
/// This trait provides a generic mechanism for receiving and responding to
/// requests from a host. A value of a type implementing this trait
/// implements the entire stack below the packet layer: it must speak the
/// physical layer and assemble packets out of the physical layer's
/// transfers, verifying lengths and checksums as it goes.
///
/// `HostPort` uses the traits [`HostRequest`] and [`HostResponse`] to
/// describe a request/reply state machine:
/// ```
/// # use keyvault::io::Write as _;
/// # use keyvault::net::{*, host::*};
/// fn process(port: &mut dyn HostPort) -> Result<(), Error> {
///     let req = port.receive()?;
///     let header = req.header()?;
///     let payload = req.payload()?;
///     // ... consume `payload` and decide on a response ...
/// #   let resp_header = header;
///     // After calling `reply`, the payload is no longer accessible.
///     let resp = req.reply(resp_header)?;
///     let sink = resp.sink()?;
/// #   let resp_bytes = [1, 2, 3];
///     sink.write_bytes(&resp_bytes)?;
///     // `finish` signals that no more bytes are coming; the port frames
///     // and transmits the packet here.
///     resp.finish()
/// }
/// ```
/// State transitions out of order must be answered with
/// [`net::Error::OutOfOrder`]; they cannot be prevented statically while
/// keeping the trait object-safe.
///
/// Implementations must be "robust": if a caller walks away mid-exchange
/// and calls `receive()` again, any half-built response state must be
/// dropped on the floor. The dispatcher leans on this for the
/// cancel-request command, which is answered with no response at all.
///
/// [`InMemHost`] is a simple implementation meant for testing; it also
/// serves as a demonstration of the required "Russian nesting dolls" of
/// trait objects.
pub trait HostPort {
    /// Receives an incoming packet from the connected host.
    ///
    /// Returns [`net::Error::Disconnected`] when no packet is pending; the
    /// main loop simply retries on its next iteration.
    fn receive(&mut self) -> Result<&mut dyn HostRequest, net::Error>;
}
impl dyn HostPort {} // Ensure object-safety.

/// Provides the "request" half of a transaction with a host.
///
/// See [`HostPort`] for more information.
pub trait HostRequest {
    /// Returns the header sent by the host for this request.
    ///
    /// This function should not be called after calling `reply()`.
    fn header(&self) -> Result<net::Header, net::Error>;

    /// Returns the raw byte stream for the payload of the request.
    ///
    /// This function should not be called after calling `reply()`.
    fn payload(&mut self) -> Result<&mut dyn Read, net::Error>;

    /// Replies to this request.
    ///
    /// Calling this function performs sufficient transport-level operations
    /// to begin a response, before handing off actually composing the
    /// payload to the caller via the returned [`HostResponse`].
    fn reply(
        &mut self,
        header: net::Header,
    ) -> Result<&mut dyn HostResponse, net::Error>;
}

/// Provides the "response" half of a transaction with a host.
///
/// See [`HostPort`] for more information.
pub trait HostResponse {
    /// Returns the raw byte stream for building the payload of the
    /// response.
    ///
    /// This function should not be called after calling `finish()`.
    fn sink(&mut self) -> Result<&mut dyn Write, net::Error>;

    /// Indicates that all payload data has been written.
    ///
    /// Callers should remember to call this function; failing to do so may
    /// result in a response not being sent.
    fn finish(&mut self) -> Result<(), net::Error>;
}

/// A simple in-memory [`HostPort`].
///
/// This type is both useful for testing, and as a demonstration of how to
/// implement [`HostPort`] and its associated traits.
///
/// # Example
/// ```
/// # use keyvault::net;
/// # use keyvault::net::host::*;
/// # use keyvault::protocol::CommandType;
/// let mut buf = [0; 64];
/// let mut host = InMemHost::new(&mut buf);
///
/// host.request(
///     net::Header { command: CommandType::Ping },
///     &[0xde, 0xad],
/// );
///
/// let req = host.receive()?;
/// assert_eq!(req.header()?.command, CommandType::Ping);
/// # Ok::<(), net::Error>(())
/// ```
pub struct InMemHost<'buf>(InMemInner<'buf>);

/// The actual guts of an `InMemHost`. This struct is used to implement the
/// two "connection state" traits used by `HostPort`.
///
/// This type is separate from `InMemHost` to hide an implementation detail.
/// If the connection state traits were implemented by `InMemHost` itself, a
/// caller could convert the port directly into a `HostResponse`, violating
/// the expected order of operations. This struct can be thought of as making
/// the impls of the connection traits for `InMemHost` "private".
struct InMemInner<'buf> {
    rx_header: Option<net::Header>,
    rx: &'buf [u8],
    tx_header: Option<net::Header>,
    tx: Cursor<'buf>,
    finished: bool,
}

impl<'buf> InMemHost<'buf> {
    /// Creates a new `InMemHost`, with the given output buffer for holding
    /// packets to be "transmitted", acting as the final destination for
    /// replies to this host.
    pub fn new(out: &'buf mut [u8]) -> Self {
        Self(InMemInner {
            rx_header: None,
            rx: &[],
            tx_header: None,
            tx: Cursor::new(out),
            finished: false,
        })
    }

    /// Schedules a new request to be received, with the given parts.
    ///
    /// Calling this function makes `receive()` start working; before, it
    /// will act as though the port were disconnected.
    pub fn request(&mut self, header: net::Header, payload: &'buf [u8]) {
        self.0.rx_header = Some(header);
        self.0.rx = payload;

        self.0.tx_header = None;
        let _ = self.0.tx.take_consumed_bytes();
        self.0.finished = false;
    }

    /// Gets the most recent response, if one was sent, until `request()` is
    /// called again.
    pub fn response(&self) -> Option<(net::Header, &[u8])> {
        if !self.0.finished {
            return None;
        }
        self.0.tx_header.map(|h| (h, self.0.tx.consumed_bytes()))
    }
}

impl HostPort for InMemHost<'_> {
    fn receive(&mut self) -> Result<&mut dyn HostRequest, net::Error> {
        if self.0.rx_header.is_none() {
            return Err(net::Error::Disconnected);
        }
        Ok(&mut self.0)
    }
}

impl HostRequest for InMemInner<'_> {
    fn header(&self) -> Result<net::Header, net::Error> {
        self.rx_header.ok_or(net::Error::OutOfOrder)
    }

    fn payload(&mut self) -> Result<&mut dyn Read, net::Error> {
        if self.rx_header.is_none() {
            return Err(net::Error::OutOfOrder);
        }
        Ok(&mut self.rx)
    }

    fn reply(
        &mut self,
        header: net::Header,
    ) -> Result<&mut dyn HostResponse, net::Error> {
        self.rx_header = None;
        self.tx_header = Some(header);
        Ok(self)
    }
}

impl HostResponse for InMemInner<'_> {
    fn sink(&mut self) -> Result<&mut dyn Write, net::Error> {
        if self.finished {
            return Err(net::Error::OutOfOrder);
        }
        Ok(&mut self.tx)
    }

    fn finish(&mut self) -> Result<(), net::Error> {
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::CommandType;

    #[test]
    fn round_trip() {
        let mut buf = [0; 64];
        let mut host = InMemHost::new(&mut buf);

        host.request(
            net::Header {
                command: CommandType::Ping,
            },
            &[1, 2, 3, 4],
        );

        let req = host.receive().unwrap();
        assert_eq!(req.header().unwrap().command, CommandType::Ping);

        let mut payload = [0; 4];
        req.payload().unwrap().read_bytes(&mut payload).unwrap();
        assert_eq!(payload, [1, 2, 3, 4]);

        let resp = req
            .reply(net::Header {
                command: CommandType::Ping,
            })
            .unwrap();
        resp.sink().unwrap().write_bytes(&payload).unwrap();
        resp.finish().unwrap();

        let (header, bytes) = host.response().unwrap();
        assert_eq!(header.command, CommandType::Ping);
        assert_eq!(bytes, [1, 2, 3, 4]);
    }

    #[test]
    fn no_response_until_finished() {
        let mut buf = [0; 64];
        let mut host = InMemHost::new(&mut buf);
        host.request(
            net::Header {
                command: CommandType::CancelRequest,
            },
            &[],
        );

        // A request that is never replied to leaves no response behind:
        // this is how cancellation's answer-with-silence is observed.
        let _ = host.receive().unwrap();
        assert!(host.response().is_none());
    }
}
