//! Underlying transport primitives.
//!
//! All network traffic of a [`Resolver`][crate::resolver::Resolver] goes
//! through an implementation of the [`Exchange`] trait: one complete
//! send-and-receive operation per call, bounded by an absolute deadline.
//! The [`SystemExchange`] type implements the trait atop the operating
//! system's sockets. Test code can substitute its own implementation to
//! script transport behaviour.

#![warn(clippy::missing_docs_in_private_items)]

use core::future::Future;
use core::pin::Pin;
use std::boxed::Box;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::vec::Vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::{timeout_at, Instant};

use crate::error::Error;

/// How many times do we try a new random port if we get ‘address in use.’
const RETRY_RANDOM_PORT: usize = 10;

//------------ Exchange ------------------------------------------------------

/// A single deadline-bounded request/response exchange.
///
/// Both methods send `payload` to `remote`, optionally from `local`, and
/// block until a response arrives or `deadline` passes, in which case they
/// fail with [`Error::Timeout`]. Each call is independent: datagram
/// exchanges use a fresh socket, stream exchanges a fresh connection.
pub trait Exchange: Clone + Send + Sync + 'static {
    /// Exchanges a message over a datagram transport.
    ///
    /// At most `recv_size` octets of the response are received; anything
    /// beyond that is silently discarded by the transport.
    fn exchange_dgram<'a>(
        &'a self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        payload: &'a [u8],
        recv_size: usize,
        deadline: Instant,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, Error>> + Send + 'a>>;

    /// Exchanges a message over a stream transport.
    ///
    /// The implementation is responsible for the 16 bit length value that
    /// frames DNS messages on stream transports; `payload` is the bare
    /// message and the returned octets are a bare message as well.
    fn exchange_stream<'a>(
        &'a self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        payload: &'a [u8],
        deadline: Instant,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, Error>> + Send + 'a>>;
}

//------------ SystemExchange ------------------------------------------------

/// The transport implementation using the system's UDP and TCP sockets.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemExchange;

impl SystemExchange {
    /// Performs a datagram exchange without the deadline applied.
    async fn dgram(
        local: Option<SocketAddr>,
        remote: SocketAddr,
        payload: &[u8],
        recv_size: usize,
    ) -> Result<Vec<u8>, Error> {
        let sock = Self::bind_dgram(local, remote.is_ipv4()).await?;
        sock.connect(remote)
            .await
            .map_err(|e| Error::UdpConnect(Arc::new(e)))?;
        let sent = sock
            .send(payload)
            .await
            .map_err(|e| Error::UdpSend(Arc::new(e)))?;
        if sent != payload.len() {
            return Err(Error::UdpShortSend);
        }
        let mut buf = vec![0; recv_size];
        let len = sock
            .recv(&mut buf)
            .await
            .map_err(|e| Error::UdpReceive(Arc::new(e)))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Binds a UDP socket to the local address.
    ///
    /// Without an explicit local address, explicitly picks a random port
    /// in a suitable range of ports.
    async fn bind_dgram(
        local: Option<SocketAddr>,
        v4: bool,
    ) -> Result<UdpSocket, Error> {
        if let Some(addr) = local {
            return UdpSocket::bind(addr)
                .await
                .map_err(|e| Error::UdpBind(Arc::new(e)));
        }
        let mut i = 0;
        loop {
            let local: SocketAddr = if v4 {
                ([0u8; 4], 0).into()
            } else {
                ([0u16; 8], 0).into()
            };
            match UdpSocket::bind(&local).await {
                Ok(sock) => return Ok(sock),
                Err(err) => {
                    if i == RETRY_RANDOM_PORT {
                        return Err(Error::UdpBind(Arc::new(err)));
                    } else {
                        i += 1
                    }
                }
            }
        }
    }

    /// Performs a stream exchange without the deadline applied.
    async fn stream(
        local: Option<SocketAddr>,
        remote: SocketAddr,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut sock = connect_stream(local, remote)
            .await
            .map_err(|e| Error::TcpConnect(Arc::new(e)))?;
        let len = u16::try_from(payload.len())
            .map_err(|_| Error::MessageBuilderPushError)?;
        sock.write_u16(len)
            .await
            .map_err(|e| Error::TcpWrite(Arc::new(e)))?;
        sock.write_all(payload)
            .await
            .map_err(|e| Error::TcpWrite(Arc::new(e)))?;
        let len = sock.read_u16().await.map_err(read_err)? as usize;
        let mut buf = vec![0; len];
        sock.read_exact(&mut buf).await.map_err(read_err)?;
        Ok(buf)
    }
}

impl Exchange for SystemExchange {
    fn exchange_dgram<'a>(
        &'a self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        payload: &'a [u8],
        recv_size: usize,
        deadline: Instant,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, Error>> + Send + 'a>>
    {
        Box::pin(async move {
            timeout_at(deadline, Self::dgram(local, remote, payload, recv_size))
                .await
                .map_err(|_| Error::Timeout)?
        })
    }

    fn exchange_stream<'a>(
        &'a self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        payload: &'a [u8],
        deadline: Instant,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, Error>> + Send + 'a>>
    {
        Box::pin(async move {
            timeout_at(deadline, Self::stream(local, remote, payload))
                .await
                .map_err(|_| Error::Timeout)?
        })
    }
}

//------------ Helper Functions ----------------------------------------------

/// Opens a TCP connection to `remote`, bound to `local` if given.
pub(crate) async fn connect_stream(
    local: Option<SocketAddr>,
    remote: SocketAddr,
) -> Result<TcpStream, io::Error> {
    match local {
        Some(addr) => {
            let sock = if remote.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            sock.bind(addr)?;
            sock.connect(remote).await
        }
        None => TcpStream::connect(remote).await,
    }
}

/// Maps a read error, turning a clean EOF into its own variant.
fn read_err(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::TcpUnexpectedEndOfData
    } else {
        Error::TcpRead(Arc::new(err))
    }
}
