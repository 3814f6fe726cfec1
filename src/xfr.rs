//! Inbound zone transfers.
//!
//! [`XfrSession`] implements the client side of a full zone transfer
//! (AXFR, [RFC 5936]) over a dedicated TCP connection. A session is opened
//! for the question of a transfer query, driven to completion with
//! [`run`][XfrSession::run], and then holds the transferred records in the
//! order the server sent them.
//!
//! A transfer consists of one or more response messages whose answer
//! sections start with the zone's SOA record and end with that same record
//! repeated. When a TSIG key is used, the response stream is verified as a
//! signed sequence; unlike a single-query exchange, a verification failure
//! terminates the transfer.
//!
//! [RFC 5936]: https://tools.ietf.org/html/rfc5936

#![warn(clippy::missing_docs_in_private_items)]

use core::mem;
use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::vec::Vec;

use bytes::Bytes;
use domain::base::iana::Rcode;
use domain::base::message::Message;
use domain::base::message_builder::{MessageBuilder, StreamTarget};
use domain::base::name::ParsedName;
use domain::base::{HeaderSection, Question, Record, Rtype};
use domain::rdata::tsig::Time48;
use domain::rdata::AllRecordData;
use domain::tsig::{ClientSequence, Key, ValidationError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use crate::protocol::connect_stream;
use crate::resolver::DEFAULT_TIMEOUT;

//------------ XfrRecord -----------------------------------------------------

/// A record received during a zone transfer.
pub type XfrRecord =
    Record<ParsedName<Bytes>, AllRecordData<Bytes, ParsedName<Bytes>>>;

//------------ XfrSession ----------------------------------------------------

/// A single inbound full zone transfer.
pub struct XfrSession {
    /// The question of the transfer request.
    question: Question<ParsedName<Bytes>>,

    /// The server to transfer from.
    server: SocketAddr,

    /// The local address to bind to, if any.
    local: Option<SocketAddr>,

    /// How long the whole transfer is allowed to take.
    timeout: Duration,

    /// The key signing the request and verifying the response stream.
    key: Option<Arc<Key>>,

    /// The records received so far, in arrival order.
    ///
    /// The zone's SOA record appears once, at the start; its repetition
    /// terminating the transfer is not stored again.
    records: Vec<XfrRecord>,
}

impl XfrSession {
    /// Opens a session transferring the zone named by `question`.
    ///
    /// Nothing happens on the network until [`run`][Self::run] is called.
    pub fn open(
        question: Question<ParsedName<Bytes>>,
        server: SocketAddr,
        key: Option<Arc<Key>>,
    ) -> Self {
        XfrSession {
            question,
            server,
            local: None,
            timeout: DEFAULT_TIMEOUT,
            key,
            records: Vec::new(),
        }
    }

    /// Sets the overall timeout for the transfer.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sets the local address to bind to when connecting.
    pub fn set_local_address(&mut self, addr: Option<SocketAddr>) {
        self.local = addr;
    }

    /// Returns the records received so far, in arrival order.
    pub fn records(&self) -> &[XfrRecord] {
        &self.records
    }

    /// Converts the session into the received records.
    pub fn into_records(self) -> Vec<XfrRecord> {
        self.records
    }

    /// Runs the transfer to completion.
    ///
    /// Connects to the server, sends the transfer request, and reads
    /// response messages until the zone's SOA record recurs. Fails if the
    /// deadline passes first.
    pub async fn run(&mut self) -> Result<(), XfrError> {
        let deadline = Instant::now() + self.timeout;
        timeout_at(deadline, self.run_inner())
            .await
            .map_err(|_| XfrError::Timeout)?
    }

    /// The actual transfer, without the deadline applied.
    async fn run_inner(&mut self) -> Result<(), XfrError> {
        let mut target = MessageBuilder::from_target(StreamTarget::new_vec())
            .map_err(|_| XfrError::MessageBuilderPushError)?;
        target.header_mut().set_random_id();
        let id = target.header().id();
        let mut builder = target.question();
        builder
            .push(self.question.clone())
            .map_err(|_| XfrError::MessageBuilderPushError)?;
        let mut additional = builder.additional();
        let mut tsig = match &self.key {
            Some(key) => Some(
                ClientSequence::request(
                    key.clone(),
                    &mut additional,
                    Time48::now(),
                )
                .map_err(|_| XfrError::MessageBuilderPushError)?,
            ),
            None => None,
        };
        let request = additional.finish();

        let mut sock = connect_stream(self.local, self.server)
            .await
            .map_err(|e| XfrError::Connect(Arc::new(e)))?;
        sock.write_all(request.as_stream_slice())
            .await
            .map_err(|e| XfrError::Write(Arc::new(e)))?;

        loop {
            let mut message = read_message(&mut sock).await?;
            if message.header().id() != id {
                return Err(XfrError::IdMismatch);
            }
            if message.header().rcode() != Rcode::NOERROR {
                return Err(XfrError::ServerFailure(message.header().rcode()));
            }
            if let Some(tsig) = tsig.as_mut() {
                tsig.answer(&mut message, Time48::now())
                    .map_err(XfrError::Validation)?;
            }
            let message =
                Message::from_octets(Bytes::from(message.into_octets()))
                    .map_err(|_| XfrError::ShortMessage)?;
            let answer = message
                .answer()
                .map_err(|_| XfrError::MessageParseError)?;
            for record in answer {
                let record = record
                    .map_err(|_| XfrError::MessageParseError)?
                    .into_record::<AllRecordData<_, _>>()
                    .map_err(|_| XfrError::MessageParseError)?
                    .ok_or(XfrError::MessageParseError)?;
                if record.rtype() == Rtype::SOA {
                    if self.records.is_empty() {
                        self.records.push(record);
                        continue;
                    }
                    // The opening SOA has come around again: done.
                    if let Some(tsig) = tsig.take() {
                        tsig.done().map_err(XfrError::Validation)?;
                    }
                    trace!(
                        "zone transfer complete, {} records",
                        self.records.len()
                    );
                    return Ok(());
                }
                if self.records.is_empty() {
                    return Err(XfrError::MissingSoa);
                }
                self.records.push(record);
            }
        }
    }
}

//------------ Helper Functions ----------------------------------------------

/// Reads a single length-prefixed message from the stream.
async fn read_message(
    sock: &mut TcpStream,
) -> Result<Message<Vec<u8>>, XfrError> {
    let len = sock.read_u16().await.map_err(read_err)? as usize;
    if len < mem::size_of::<HeaderSection>() {
        return Err(XfrError::ShortMessage);
    }
    let mut buf = vec![0; len];
    sock.read_exact(&mut buf).await.map_err(read_err)?;
    Message::from_octets(buf).map_err(|_| XfrError::ShortMessage)
}

/// Maps a read error, turning a clean EOF into its own variant.
fn read_err(err: io::Error) -> XfrError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        XfrError::UnexpectedEndOfData
    } else {
        XfrError::Read(Arc::new(err))
    }
}

//------------ XfrError ------------------------------------------------------

/// An error terminating a zone transfer.
#[derive(Clone, Debug)]
pub enum XfrError {
    /// Connecting to the server gave an error.
    Connect(Arc<io::Error>),

    /// Writing the transfer request gave an error.
    Write(Arc<io::Error>),

    /// Reading from the transfer stream gave an error.
    Read(Arc<io::Error>),

    /// The stream ended before the transfer was complete.
    UnexpectedEndOfData,

    /// The deadline passed before the transfer was complete.
    Timeout,

    /// A response message was too short to be valid.
    ShortMessage,

    /// Parsing a response message failed.
    MessageParseError,

    /// Composing the transfer request failed.
    MessageBuilderPushError,

    /// A response message carried the wrong message ID.
    IdMismatch,

    /// The server refused the transfer.
    ServerFailure(Rcode),

    /// The first answer record was not the zone's SOA record.
    MissingSoa,

    /// Verifying the signature of the response stream failed.
    Validation(ValidationError),
}

impl Display for XfrError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            XfrError::Connect(_) => write!(f, "error connecting to server"),
            XfrError::Write(_) => write!(f, "error sending request"),
            XfrError::Read(_) => write!(f, "error reading from stream"),
            XfrError::UnexpectedEndOfData => {
                write!(f, "unexpected end of data")
            }
            XfrError::Timeout => write!(f, "timeout during transfer"),
            XfrError::ShortMessage => {
                write!(f, "octet sequence too short to be a valid message")
            }
            XfrError::MessageParseError => {
                write!(f, "error parsing message")
            }
            XfrError::MessageBuilderPushError => {
                write!(f, "error composing the request message")
            }
            XfrError::IdMismatch => write!(f, "invalid message ID"),
            XfrError::ServerFailure(rcode) => {
                write!(f, "server returned {}", rcode)
            }
            XfrError::MissingSoa => {
                write!(f, "transfer did not start with a SOA record")
            }
            XfrError::Validation(err) => {
                write!(f, "signature verification failed: {}", err)
            }
        }
    }
}

impl error::Error for XfrError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            XfrError::Connect(e) => Some(e),
            XfrError::Write(e) => Some(e),
            XfrError::Read(e) => Some(e),
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
            XfrError::MissingSoa.to_string(),
            "transfer did not start with a SOA record"
        );
        assert!(XfrError::ServerFailure(Rcode::REFUSED)
            .to_string()
            .starts_with("server returned"));
    }

    #[test]
    fn cause_travels_through_resolver_error() {
        let err = crate::error::Error::ZoneTransfer(XfrError::MissingSoa);
        assert_eq!(
            err.to_string(),
            "zone transfer failed: transfer did not start with a SOA record"
        );
    }
}
