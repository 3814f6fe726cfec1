//! A blocking interface to the resolver.
//!
//! [`Resolver`][self::Resolver] wraps the asynchronous
//! [`resolver::Resolver`] together with a private current-thread tokio
//! runtime. Sending a query blocks the calling thread until the response
//! has arrived or the query has failed, which makes the resolver usable
//! from code that does not otherwise run inside an async runtime.

#![warn(clippy::missing_docs_in_private_items)]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use std::vec::Vec;

use domain::base::iana::OptionCode;
use domain::base::message::Message;
use domain::tsig::Key;
use octseq::Octets;
use tokio::runtime;

use crate::error::Error;
use crate::resolver::{self, Answer};

//------------ Resolver ------------------------------------------------------

/// A resolver that blocks the calling thread while sending.
pub struct Resolver {
    /// The underlying asynchronous resolver.
    inner: resolver::Resolver,

    /// The runtime driving the resolver's queries.
    runtime: runtime::Runtime,
}

impl Resolver {
    /// Creates a resolver for the process-wide default server.
    pub fn new() -> Result<Self, Error> {
        let runtime = new_runtime();
        let inner = runtime.block_on(resolver::Resolver::new())?;
        Ok(Resolver { inner, runtime })
    }

    /// Creates a resolver for the given host, to be queried on port 53.
    pub fn from_host(host: &str) -> Result<Self, Error> {
        let runtime = new_runtime();
        let inner = runtime.block_on(resolver::Resolver::from_host(host))?;
        Ok(Resolver { inner, runtime })
    }

    /// Creates a resolver for the given server address.
    pub fn from_address(server: SocketAddr) -> Self {
        Resolver {
            inner: resolver::Resolver::from_address(server),
            runtime: new_runtime(),
        }
    }

    /// Sends a query and blocks until the response has arrived.
    ///
    /// This behaves exactly like
    /// [`resolver::Resolver::send`] run to completion.
    pub fn send<Octs: Octets>(
        &self,
        query: &Message<Octs>,
    ) -> Result<Answer, Error> {
        self.runtime.block_on(self.inner.send(query))
    }
}

/// # Configuration
///
/// These methods forward to their namesakes on
/// [`resolver::Resolver`].
impl Resolver {
    /// Returns the address of the server queries are sent to.
    pub fn server(&self) -> SocketAddr {
        self.inner.server()
    }

    /// Sets the address of the server to communicate with.
    pub fn set_address(&mut self, addr: SocketAddr) {
        self.inner.set_address(addr)
    }

    /// Sets the IP address of the server, keeping the configured port.
    pub fn set_ip(&mut self, addr: IpAddr) {
        self.inner.set_ip(addr)
    }

    /// Sets the port to send queries to.
    pub fn set_port(&mut self, port: u16) {
        self.inner.set_port(port)
    }

    /// Sets the local address to bind to when sending queries.
    pub fn set_local_address(&mut self, addr: SocketAddr) {
        self.inner.set_local_address(addr)
    }

    /// Sets the local address to bind to, using an ephemeral port.
    pub fn set_local_ip(&mut self, addr: IpAddr) {
        self.inner.set_local_ip(addr)
    }

    /// Sets whether all queries use TCP.
    pub fn set_tcp(&mut self, flag: bool) {
        self.inner.set_tcp(flag)
    }

    /// Sets whether truncated responses are returned as they are.
    pub fn set_ignore_truncation(&mut self, flag: bool) {
        self.inner.set_ignore_truncation(flag)
    }

    /// Enables or disables EDNS(0) for outgoing queries.
    pub fn set_edns(&mut self, level: i32) -> Result<(), Error> {
        self.inner.set_edns(level)
    }

    /// Enables or disables EDNS(0), providing the details of the record.
    pub fn set_edns_with(
        &mut self,
        level: i32,
        payload_size: u16,
        flags: u16,
        options: Vec<(OptionCode, Vec<u8>)>,
    ) -> Result<(), Error> {
        self.inner
            .set_edns_with(level, payload_size, flags, options)
    }

    /// Sets or clears the TSIG key for signing queries.
    pub fn set_tsig_key(&mut self, key: Option<Arc<Key>>) {
        self.inner.set_tsig_key(key)
    }

    /// Sets the overall timeout for a single send.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.inner.set_timeout(timeout)
    }

    /// Returns the overall timeout for a single send.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout()
    }
}

/// Creates the runtime backing a blocking resolver.
fn new_runtime() -> runtime::Runtime {
    runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
}
