//! Error types for resolver operations.

#![warn(clippy::missing_docs_in_private_items)]

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::Arc;

use crate::xfr::XfrError;

//------------ Error ---------------------------------------------------------

/// Error type for resolver operations.
#[derive(Clone, Debug)]
pub enum Error {
    /// An EDNS(0) level other than 0 or -1 was requested.
    InvalidEdnsLevel(i32),

    /// Looking up the address of the server's host name failed.
    HostLookup(Arc<io::Error>),

    /// The server's host name did not resolve to any address.
    HostNotFound,

    /// Composing the wire format of the query failed.
    ///
    /// This happens when the query does not fit into the maximum message
    /// length even over a stream transport.
    MessageBuilderPushError,

    /// Parsing a message failed.
    MessageParseError,

    /// Octet sequence too short to be a valid DNS message.
    ShortMessage,

    /// The deadline passed before a response was received.
    Timeout,

    /// A response received over TCP carried the wrong message ID.
    IdMismatch {
        /// The ID of the query.
        expected: u16,

        /// The ID found in the response.
        received: u16,
    },

    /// Binding a UDP socket gave an error.
    UdpBind(Arc<io::Error>),

    /// Connecting a UDP socket gave an error.
    UdpConnect(Arc<io::Error>),

    /// Sending over a UDP socket gave an error.
    UdpSend(Arc<io::Error>),

    /// Receiving from a UDP socket gave an error.
    UdpReceive(Arc<io::Error>),

    /// Sending over a UDP socket gave a partial result.
    UdpShortSend,

    /// Connecting to the server over TCP gave an error.
    TcpConnect(Arc<io::Error>),

    /// Writing to a TCP stream gave an error.
    TcpWrite(Arc<io::Error>),

    /// Reading from a TCP stream gave an error.
    TcpRead(Arc<io::Error>),

    /// Reading from a TCP stream ended in the middle of a message.
    TcpUnexpectedEndOfData,

    /// A zone transfer failed.
    ZoneTransfer(XfrError),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::InvalidEdnsLevel(level) => {
                write!(f, "invalid EDNS level {} - must be 0 or -1", level)
            }
            Error::HostLookup(_) => {
                write!(f, "error looking up the server's host name")
            }
            Error::HostNotFound => {
                write!(f, "the server's host name has no address")
            }
            Error::MessageBuilderPushError => {
                write!(f, "error composing the query message")
            }
            Error::MessageParseError => write!(f, "error parsing message"),
            Error::ShortMessage => {
                write!(f, "octet sequence too short to be a valid message")
            }
            Error::Timeout => write!(f, "timeout waiting for response"),
            Error::IdMismatch { expected, received } => {
                write!(
                    f,
                    "invalid message ID: expected {}, got {}",
                    expected, received
                )
            }
            Error::UdpBind(_) => write!(f, "error binding UDP socket"),
            Error::UdpConnect(_) => write!(f, "error connecting UDP socket"),
            Error::UdpSend(_) => write!(f, "error sending to UDP socket"),
            Error::UdpReceive(_) => {
                write!(f, "error receiving from UDP socket")
            }
            Error::UdpShortSend => write!(f, "partial send to UDP socket"),
            Error::TcpConnect(_) => write!(f, "error connecting to server"),
            Error::TcpWrite(_) => write!(f, "error writing to TCP stream"),
            Error::TcpRead(_) => write!(f, "error reading from TCP stream"),
            Error::TcpUnexpectedEndOfData => {
                write!(f, "unexpected end of data")
            }
            Error::ZoneTransfer(err) => {
                write!(f, "zone transfer failed: {}", err)
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::HostLookup(e) => Some(e),
            Error::UdpBind(e) => Some(e),
            Error::UdpConnect(e) => Some(e),
            Error::UdpSend(e) => Some(e),
            Error::UdpReceive(e) => Some(e),
            Error::TcpConnect(e) => Some(e),
            Error::TcpWrite(e) => Some(e),
            Error::TcpRead(e) => Some(e),
            Error::ZoneTransfer(e) => Some(e),
            _ => None,
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            Error::InvalidEdnsLevel(3).to_string(),
            "invalid EDNS level 3 - must be 0 or -1"
        );
        assert_eq!(
            Error::IdMismatch { expected: 17, received: 4711 }.to_string(),
            "invalid message ID: expected 17, got 4711"
        );
        assert_eq!(
            Error::Timeout.to_string(),
            "timeout waiting for response"
        );
    }

    #[test]
    fn source_is_preserved() {
        let err = Error::UdpSend(Arc::new(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert!(error::Error::source(&err).is_some());
        assert!(error::Error::source(&Error::Timeout).is_none());
    }
}
