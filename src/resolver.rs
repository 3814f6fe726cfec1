//! A resolver that sends queries to a single server.
//!
//! [`Resolver`] owns the configuration for talking to one name server:
//! its address, an optional local address to bind to, transport and
//! truncation behaviour, EDNS(0) and TSIG settings, and the overall
//! request timeout. Configuration is mutated through setters before
//! sending; sending itself only takes a shared reference, so any number
//! of queries can be in flight on one resolver concurrently.
//!
//! A query is sent with [`send`][Resolver::send], which resolves to an
//! [`Answer`] or an [`Error`], or with [`send_async`][Resolver::send_async],
//! which spawns the query onto the runtime and hands the outcome to a
//! completion handler together with the [`DispatchId`] identifying the
//! dispatch.

#![warn(clippy::missing_docs_in_private_items)]

use core::fmt;
use core::mem;
use std::net::{IpAddr, SocketAddr};
use std::string::String;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::vec::Vec;

use bytes::Bytes;
use domain::base::iana::{Opcode, OptionCode};
use domain::base::message::Message;
use domain::base::message_builder::MessageBuilder;
use domain::base::{HeaderSection, Rtype};
use domain::rdata::tsig::Time48;
use domain::tsig::{ClientTransaction, Key, ValidationError};
use octseq::Octets;
use tokio::net::lookup_host;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::protocol::{Exchange, SystemExchange};
use crate::request::{self, PreparedQuery};
use crate::xfr::{XfrRecord, XfrSession};

//------------ Configuration Constants ---------------------------------------

/// The default port to send queries to.
pub const DEFAULT_PORT: u16 = 53;

/// The default EDNS(0) UDP payload size.
pub const DEFAULT_EDNS_PAYLOAD_SIZE: u16 = 1280;

/// The default request timeout.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// The server name used when nothing else has been configured.
const FALLBACK_SERVER: &str = "localhost";

//------------ Process-wide State --------------------------------------------

/// The configurable default server name.
static DEFAULT_SERVER: Mutex<Option<String>> = Mutex::new(None);

/// The counter minting dispatch identifiers.
static DISPATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sets the process-wide default server name.
///
/// The name is used by [`Resolver::new`] when constructing a resolver
/// without an explicit server. An empty name resets the default, falling
/// back to `"localhost"`.
pub fn set_default_server(name: impl Into<String>) {
    let name = name.into();
    *DEFAULT_SERVER.lock().expect("poisoned lock") =
        if name.is_empty() { None } else { Some(name) };
}

/// Returns the currently configured default server name.
fn default_server() -> String {
    DEFAULT_SERVER
        .lock()
        .expect("poisoned lock")
        .clone()
        .unwrap_or_else(|| FALLBACK_SERVER.into())
}

//------------ EdnsConfig ----------------------------------------------------

/// The EDNS(0) configuration applied to outgoing queries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EdnsConfig {
    /// The UDP payload size advertised in the OPT record.
    udp_payload_size: u16,

    /// The extended flags word. Bit 15 is the DNSSEC OK flag.
    flags: u16,

    /// Additional EDNS options as raw code and data pairs.
    options: Vec<(OptionCode, Vec<u8>)>,
}

impl EdnsConfig {
    /// Creates a new EDNS configuration from its components.
    pub fn new(
        udp_payload_size: u16,
        flags: u16,
        options: Vec<(OptionCode, Vec<u8>)>,
    ) -> Self {
        EdnsConfig {
            udp_payload_size,
            flags,
            options,
        }
    }

    /// Returns the advertised UDP payload size.
    pub fn udp_payload_size(&self) -> u16 {
        self.udp_payload_size
    }

    /// Returns whether the DNSSEC OK flag is to be set.
    pub fn dnssec_ok(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Returns the raw options to be included in the OPT record.
    pub fn options(&self) -> &[(OptionCode, Vec<u8>)] {
        &self.options
    }
}

//------------ DispatchId ----------------------------------------------------

/// An identifier correlating an asynchronous dispatch with its completion.
///
/// Identifiers are unique within the process. They carry no further
/// meaning; their only use is telling concurrent completions apart.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DispatchId(u64);

impl DispatchId {
    /// Mints the next unique identifier.
    fn next() -> Self {
        DispatchId(DISPATCH_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

//------------ TsigStatus ----------------------------------------------------

/// The outcome of TSIG verification for a response.
#[derive(Clone, Debug)]
pub enum TsigStatus {
    /// No TSIG key was configured for the exchange.
    Unsigned,

    /// The response carried a valid signature.
    ///
    /// The TSIG record has been removed from the returned message.
    Verified,

    /// Signature verification failed.
    ///
    /// The response is returned as received. Callers that require message
    /// integrity must treat this as a failed exchange.
    Failed(ValidationError),
}

impl TsigStatus {
    /// Returns whether the response carried a valid signature.
    pub fn is_verified(&self) -> bool {
        matches!(self, TsigStatus::Verified)
    }
}

//------------ Answer --------------------------------------------------------

/// The answer to a query.
///
/// This wraps the response message together with the outcome of TSIG
/// verification. A failed verification does not fail the exchange;
/// callers that require integrity check [`tsig_status`][Self::tsig_status].
#[derive(Clone)]
pub struct Answer {
    /// The response message.
    message: Message<Bytes>,

    /// The outcome of TSIG verification.
    tsig: TsigStatus,
}

impl Answer {
    /// Returns a reference to the response message.
    pub fn message(&self) -> &Message<Bytes> {
        &self.message
    }

    /// Converts the answer into the response message.
    pub fn into_message(self) -> Message<Bytes> {
        self.message
    }

    /// Returns whether the response is truncated.
    pub fn is_truncated(&self) -> bool {
        self.message.header().tc()
    }

    /// Returns the outcome of TSIG verification.
    pub fn tsig_status(&self) -> &TsigStatus {
        &self.tsig
    }
}

impl From<Answer> for Message<Bytes> {
    fn from(answer: Answer) -> Self {
        answer.message
    }
}

//------------ Resolver ------------------------------------------------------

/// A resolver that sends each query to a single name server.
///
/// The resolver is generic over the transport implementation so tests can
/// script network behaviour; production code uses the default
/// [`SystemExchange`].
#[derive(Clone, Debug)]
pub struct Resolver<X = SystemExchange> {
    /// The server to send queries to.
    server: SocketAddr,

    /// The local address to bind to, if any.
    local: Option<SocketAddr>,

    /// Use TCP for all queries.
    use_tcp: bool,

    /// Return truncated responses instead of retrying over TCP.
    ignore_truncation: bool,

    /// The EDNS(0) record to apply to queries, if any.
    edns: Option<EdnsConfig>,

    /// The key used to sign queries and verify responses, if any.
    key: Option<Arc<Key>>,

    /// How long a send is allowed to take overall.
    timeout: Duration,

    /// The transport implementation.
    exchange: X,
}

impl Resolver<SystemExchange> {
    /// Creates a resolver for the process-wide default server.
    ///
    /// The default server name is configured via [`set_default_server`]
    /// and falls back to `"localhost"`.
    pub async fn new() -> Result<Self, Error> {
        Self::from_host(&default_server()).await
    }

    /// Creates a resolver for the given host, to be queried on port 53.
    ///
    /// A literal IP address is used directly; anything else is resolved
    /// through the system's name lookup. The name `"0"` selects the local
    /// host.
    pub async fn from_host(host: &str) -> Result<Self, Error> {
        let addr = resolve_host(host).await?;
        Ok(Self::from_address(SocketAddr::new(addr, DEFAULT_PORT)))
    }

    /// Creates a resolver for the given server address.
    pub fn from_address(server: SocketAddr) -> Self {
        Self::with_exchange(server, SystemExchange)
    }
}

/// # Configuration
///
impl<X> Resolver<X> {
    /// Creates a resolver using the given transport implementation.
    pub fn with_exchange(server: SocketAddr, exchange: X) -> Self {
        Resolver {
            server,
            local: None,
            use_tcp: false,
            ignore_truncation: false,
            edns: None,
            key: None,
            timeout: DEFAULT_TIMEOUT,
            exchange,
        }
    }

    /// Returns the address of the server queries are sent to.
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Sets the address of the server to communicate with.
    pub fn set_address(&mut self, addr: SocketAddr) {
        self.server = addr;
    }

    /// Sets the IP address of the server, keeping the configured port.
    pub fn set_ip(&mut self, addr: IpAddr) {
        self.server = SocketAddr::new(addr, self.server.port());
    }

    /// Sets the port to send queries to, keeping the configured address.
    pub fn set_port(&mut self, port: u16) {
        self.server.set_port(port);
    }

    /// Sets the local address to bind to when sending queries.
    pub fn set_local_address(&mut self, addr: SocketAddr) {
        self.local = Some(addr);
    }

    /// Sets the local address to bind to, using an ephemeral port.
    pub fn set_local_ip(&mut self, addr: IpAddr) {
        self.local = Some(SocketAddr::new(addr, 0));
    }

    /// Sets whether all queries use TCP.
    pub fn set_tcp(&mut self, flag: bool) {
        self.use_tcp = flag;
    }

    /// Sets whether truncated responses are returned as they are.
    ///
    /// By default a truncated UDP response causes the query to be retried
    /// over TCP.
    pub fn set_ignore_truncation(&mut self, flag: bool) {
        self.ignore_truncation = flag;
    }

    /// Enables or disables EDNS(0) for outgoing queries.
    ///
    /// Level 0 enables EDNS with the default payload size, level -1
    /// disables it. Any other level fails with
    /// [`Error::InvalidEdnsLevel`] and leaves the configuration
    /// untouched.
    pub fn set_edns(&mut self, level: i32) -> Result<(), Error> {
        self.set_edns_with(level, 0, 0, Vec::new())
    }

    /// Enables or disables EDNS(0), providing the details of the record.
    ///
    /// A `payload_size` of 0 selects the default of 1280 octets. Bit 15
    /// of `flags` is the DNSSEC OK flag; `options` are included in the
    /// OPT record verbatim.
    pub fn set_edns_with(
        &mut self,
        level: i32,
        payload_size: u16,
        flags: u16,
        options: Vec<(OptionCode, Vec<u8>)>,
    ) -> Result<(), Error> {
        match level {
            0 => {
                let size = if payload_size == 0 {
                    DEFAULT_EDNS_PAYLOAD_SIZE
                } else {
                    payload_size
                };
                self.edns = Some(EdnsConfig::new(size, flags, options));
                Ok(())
            }
            -1 => {
                self.edns = None;
                Ok(())
            }
            _ => Err(Error::InvalidEdnsLevel(level)),
        }
    }

    /// Sets or clears the TSIG key for signing queries.
    pub fn set_tsig_key(&mut self, key: Option<Arc<Key>>) {
        self.key = key;
    }

    /// Returns the configured TSIG key, if any.
    pub fn tsig_key(&self) -> Option<&Key> {
        self.key.as_deref()
    }

    /// Sets the overall timeout for a single send.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Returns the overall timeout for a single send.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// # Sending Queries
///
impl<X: Exchange> Resolver<X> {
    /// Sends a query and waits for the response.
    ///
    /// The query is left untouched; EDNS(0) and TSIG are applied to an
    /// independent copy. The call returns when a response has arrived,
    /// a fatal error was encountered, or the configured timeout has
    /// passed. A query for a full zone transfer is answered through a
    /// dedicated transfer session instead of a single exchange.
    pub async fn send<Octs: Octets>(
        &self,
        query: &Message<Octs>,
    ) -> Result<Answer, Error> {
        trace!("sending query to {}", self.server);

        if query.header().opcode() == Opcode::QUERY {
            if let Some(question) = query.first_question() {
                if question.qtype() == Rtype::AXFR {
                    return self.send_axfr(query).await;
                }
            }
        }

        let mut prepared =
            request::prepare(query, self.edns.as_ref(), self.key.as_ref())?;
        self.exchange_loop(&mut prepared).await
    }

    /// Sends a query asynchronously.
    ///
    /// Mints a fresh [`DispatchId`], spawns the query onto the runtime
    /// and returns immediately. Once the query completes, `complete` is
    /// called exactly once with the identifier and the outcome. The
    /// handler runs on a runtime worker thread, possibly concurrently
    /// with the caller and with other completions; shared state touched
    /// by it must be synchronized by the caller.
    ///
    /// Any number of dispatches may be started concurrently from the
    /// same resolver; they do not affect each other.
    ///
    /// # Panics
    ///
    /// This method must be called from within a tokio runtime.
    pub fn send_async<Octs, F>(
        &self,
        query: &Message<Octs>,
        complete: F,
    ) -> DispatchId
    where
        Octs: Octets,
        F: FnOnce(DispatchId, Result<Answer, Error>) + Send + 'static,
    {
        let id = DispatchId::next();
        let resolver = self.clone();
        let query = query.as_slice().to_vec();
        tokio::spawn(async move {
            let result = match Message::from_octets(query) {
                Ok(query) => resolver.send(&query).await,
                Err(_) => Err(Error::ShortMessage),
            };
            complete(id, result);
        });
        id
    }

    /// Runs the transport loop for a prepared query.
    ///
    /// Repeats exchanges until a response is accepted, a fatal error
    /// occurs, or the deadline passes. The only retries are discarding
    /// stray UDP datagrams with the wrong message ID and a single
    /// one-way upgrade from UDP to TCP when a response arrives
    /// truncated.
    async fn exchange_loop(
        &self,
        prepared: &mut PreparedQuery,
    ) -> Result<Answer, Error> {
        let deadline = Instant::now() + self.timeout;
        let tsig = prepared.take_tsig();
        let id = prepared.id();
        let max_udp = prepared.max_udp_size();
        let payload = prepared.dgram();
        let mut tcp = self.use_tcp;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            if payload.len() > usize::from(max_udp) {
                tcp = true;
            }

            let buf = if tcp {
                self.exchange
                    .exchange_stream(self.local, self.server, payload, deadline)
                    .await?
            } else {
                self.exchange
                    .exchange_dgram(
                        self.local,
                        self.server,
                        payload,
                        usize::from(max_udp),
                        deadline,
                    )
                    .await?
            };

            if buf.len() < mem::size_of::<HeaderSection>() {
                return Err(Error::ShortMessage);
            }

            // Check the ID against the raw octets before parsing so that a
            // malformed response that is not ours does not confuse us.
            let received = u16::from_be_bytes([buf[0], buf[1]]);
            if received != id {
                if tcp {
                    return Err(Error::IdMismatch {
                        expected: id,
                        received,
                    });
                }
                debug!(
                    "expected message ID {}, got {}; discarding datagram",
                    id, received
                );
                continue;
            }

            let (message, status) = parse_and_verify(buf, tsig.as_ref())?;

            if !tcp && !self.ignore_truncation && message.header().tc() {
                trace!("response truncated, retrying over TCP");
                tcp = true;
                continue;
            }

            return Ok(Answer {
                message,
                tsig: status,
            });
        }
    }

    /// Answers a zone transfer query through a dedicated session.
    ///
    /// The transferred records are assembled into a single synthetic
    /// response message carrying the query's ID and question.
    async fn send_axfr<Octs: Octets>(
        &self,
        query: &Message<Octs>,
    ) -> Result<Answer, Error> {
        let query =
            Message::from_octets(Bytes::copy_from_slice(query.as_slice()))
                .map_err(|_| Error::ShortMessage)?;
        let question =
            query.first_question().ok_or(Error::MessageParseError)?;

        let mut session =
            XfrSession::open(question, self.server, self.key.clone());
        session.set_timeout(self.timeout);
        session.set_local_address(self.local);
        session.run().await.map_err(Error::ZoneTransfer)?;

        let tsig = if self.key.is_some() {
            TsigStatus::Verified
        } else {
            TsigStatus::Unsigned
        };
        let message = assemble_axfr_response(&query, session.records())?;
        Ok(Answer {
            message,
            tsig,
        })
    }
}

//------------ Helper Functions ----------------------------------------------

/// Resolves a server host name into an IP address.
async fn resolve_host(host: &str) -> Result<IpAddr, Error> {
    let host = if host == "0" { FALLBACK_SERVER } else { host };
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }
    lookup_host((host, DEFAULT_PORT))
        .await
        .map_err(|e| Error::HostLookup(Arc::new(e)))?
        .next()
        .map(|addr| addr.ip())
        .ok_or(Error::HostNotFound)
}

/// Parses a received buffer and verifies its signature if one is expected.
///
/// A TSIG record that verifies is removed from the returned message. A
/// failed verification leaves the message as received and is reported
/// through the returned status rather than as an error.
fn parse_and_verify(
    buf: Vec<u8>,
    tsig: Option<&ClientTransaction<Arc<Key>>>,
) -> Result<(Message<Bytes>, TsigStatus), Error> {
    let mut message =
        Message::from_octets(buf).map_err(|_| Error::ShortMessage)?;
    check_sections(&message)?;
    let status = match tsig {
        None => TsigStatus::Unsigned,
        Some(tsig) => match tsig.answer(&mut message, Time48::now()) {
            Ok(()) => {
                debug!("TSIG verification succeeded");
                TsigStatus::Verified
            }
            Err(err) => {
                warn!("TSIG verification failed: {}", err);
                TsigStatus::Failed(err)
            }
        },
    };
    let message = Message::from_octets(Bytes::from(message.into_octets()))
        .map_err(|_| Error::ShortMessage)?;
    Ok((message, status))
}

/// Checks that all sections of a message parse.
fn check_sections<Octs: Octets>(
    message: &Message<Octs>,
) -> Result<(), Error> {
    for question in message.question() {
        question.map_err(|_| Error::MessageParseError)?;
    }
    for section in [
        message.answer(),
        message.authority(),
        message.additional(),
    ] {
        for record in section.map_err(|_| Error::MessageParseError)? {
            record.map_err(|_| Error::MessageParseError)?;
        }
    }
    Ok(())
}

/// Builds the synthetic response message for a completed zone transfer.
fn assemble_axfr_response(
    query: &Message<Bytes>,
    records: &[XfrRecord],
) -> Result<Message<Bytes>, Error> {
    let mut target = MessageBuilder::new_bytes();
    {
        let header = target.header_mut();
        header.set_id(query.header().id());
        header.set_qr(true);
        header.set_aa(true);
    }
    let mut builder = target.question();
    for question in query.question() {
        let question = question.map_err(|_| Error::MessageParseError)?;
        builder
            .push(question)
            .map_err(|_| Error::MessageBuilderPushError)?;
    }
    let mut builder = builder.answer();
    for record in records {
        builder
            .push(record)
            .map_err(|_| Error::MessageBuilderPushError)?;
    }
    Ok(builder.into_message())
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Exchange;
    use core::future::Future;
    use core::pin::Pin;
    use domain::base::iana::{Class, Rcode};
    use domain::base::{Name, Serial, Ttl};
    use domain::rdata::{Ns, Soa, A};
    use domain::tsig::Algorithm;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use tokio::time::sleep_until;

    //------------ MockExchange ----------------------------------------------

    /// The transport an attempt went over.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    enum Attempt {
        Udp,
        Tcp,
    }

    /// One scripted transport interaction.
    enum Step {
        /// Answer the query, optionally with the truncation flag set.
        Reply { tc: bool },

        /// Answer the query with a mangled message ID.
        WrongId,

        /// Answer with a buffer shorter than a message header.
        Short,
    }

    /// A transport that replays a script instead of talking to a network.
    ///
    /// Running out of script entries behaves like a silent server: the
    /// exchange sleeps until the deadline and fails with a timeout.
    #[derive(Clone)]
    struct MockExchange {
        inner: Arc<Mutex<MockInner>>,
    }

    /// The shared state of a mock exchange.
    struct MockInner {
        script: VecDeque<Step>,
        attempts: Vec<Attempt>,
    }

    impl MockExchange {
        fn new(script: Vec<Step>) -> Self {
            MockExchange {
                inner: Arc::new(Mutex::new(MockInner {
                    script: script.into(),
                    attempts: Vec::new(),
                })),
            }
        }

        fn attempts(&self) -> Vec<Attempt> {
            self.inner.lock().unwrap().attempts.clone()
        }

        async fn step(
            &self,
            attempt: Attempt,
            payload: &[u8],
            deadline: Instant,
        ) -> Result<Vec<u8>, Error> {
            let step = {
                let mut inner = self.inner.lock().unwrap();
                inner.attempts.push(attempt);
                inner.script.pop_front()
            };
            match step {
                None => {
                    sleep_until(deadline).await;
                    Err(Error::Timeout)
                }
                Some(Step::Reply { tc }) => Ok(Self::reply(payload, tc)),
                Some(Step::WrongId) => {
                    let mut reply = Self::reply(payload, false);
                    reply[0] ^= 0xff;
                    Ok(reply)
                }
                Some(Step::Short) => Ok(vec![0, 1, 2]),
            }
        }

        fn reply(payload: &[u8], tc: bool) -> Vec<u8> {
            let query = Message::from_octets(payload.to_vec()).unwrap();
            let mut builder = MessageBuilder::new_vec()
                .start_answer(&query, Rcode::NOERROR)
                .unwrap();
            builder.header_mut().set_tc(tc);
            builder.into_message().into_octets()
        }
    }

    impl Exchange for MockExchange {
        fn exchange_dgram<'a>(
            &'a self,
            _local: Option<SocketAddr>,
            _remote: SocketAddr,
            payload: &'a [u8],
            _recv_size: usize,
            deadline: Instant,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, Error>> + Send + 'a>>
        {
            Box::pin(self.step(Attempt::Udp, payload, deadline))
        }

        fn exchange_stream<'a>(
            &'a self,
            _local: Option<SocketAddr>,
            _remote: SocketAddr,
            payload: &'a [u8],
            deadline: Instant,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, Error>> + Send + 'a>>
        {
            Box::pin(self.step(Attempt::Tcp, payload, deadline))
        }
    }

    //------------ Helpers ---------------------------------------------------

    const SERVER: SocketAddr =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 53);

    fn new_resolver(script: Vec<Step>) -> Resolver<MockExchange> {
        Resolver::with_exchange(SERVER, MockExchange::new(script))
    }

    fn mock(resolver: &Resolver<MockExchange>) -> MockExchange {
        resolver.exchange.clone()
    }

    fn new_query() -> Message<Vec<u8>> {
        let mut msg = MessageBuilder::new_vec();
        msg.header_mut().set_id(0x2914);
        msg.header_mut().set_rd(true);
        let mut msg = msg.question();
        msg.push((
            Name::<Vec<u8>>::vec_from_str("example.test").unwrap(),
            Rtype::A,
        ))
        .unwrap();
        msg.into_message()
    }

    fn oversized_query() -> Message<Vec<u8>> {
        let msg = MessageBuilder::new_vec();
        let mut msg = msg.question();
        // Unique first labels keep name compression from shrinking the
        // prepared query below the UDP limit.
        for i in 0..24 {
            msg.push((
                Name::<Vec<u8>>::vec_from_str(&format!(
                    "name-{}-with-quite-a-long-unique-prefix-label.test",
                    i
                ))
                .unwrap(),
                Rtype::A,
            ))
            .unwrap();
        }
        msg.into_message()
    }

    //------------ Transport Selection ---------------------------------------

    #[tokio::test]
    async fn small_query_starts_over_udp() {
        let resolver = new_resolver(vec![Step::Reply { tc: false }]);
        let answer = resolver.send(&new_query()).await.unwrap();
        assert!(!answer.is_truncated());
        assert_eq!(answer.message().header().id(), 0x2914);
        assert_eq!(mock(&resolver).attempts(), vec![Attempt::Udp]);
    }

    #[tokio::test]
    async fn oversized_query_starts_over_tcp() {
        let resolver = new_resolver(vec![Step::Reply { tc: false }]);
        let query = oversized_query();
        assert!(query.as_slice().len() > 512);
        resolver.send(&query).await.unwrap();
        assert_eq!(mock(&resolver).attempts(), vec![Attempt::Tcp]);
    }

    #[tokio::test]
    async fn forced_tcp_is_honored() {
        let mut resolver = new_resolver(vec![Step::Reply { tc: false }]);
        resolver.set_tcp(true);
        resolver.send(&new_query()).await.unwrap();
        assert_eq!(mock(&resolver).attempts(), vec![Attempt::Tcp]);
    }

    //------------ ID Handling -----------------------------------------------

    #[tokio::test]
    async fn stray_udp_datagram_is_discarded() {
        let resolver = new_resolver(vec![
            Step::WrongId,
            Step::WrongId,
            Step::Reply { tc: false },
        ]);
        let answer = resolver.send(&new_query()).await.unwrap();
        assert_eq!(answer.message().header().id(), 0x2914);
        assert_eq!(
            mock(&resolver).attempts(),
            vec![Attempt::Udp, Attempt::Udp, Attempt::Udp]
        );
    }

    #[tokio::test]
    async fn tcp_id_mismatch_is_fatal() {
        let mut resolver = new_resolver(vec![Step::WrongId]);
        resolver.set_tcp(true);
        assert!(matches!(
            resolver.send(&new_query()).await,
            Err(Error::IdMismatch {
                expected: 0x2914,
                ..
            })
        ));
    }

    //------------ Truncation ------------------------------------------------

    #[tokio::test]
    async fn truncation_upgrades_to_tcp_once() {
        let resolver = new_resolver(vec![
            Step::Reply { tc: true },
            Step::Reply { tc: true },
        ]);
        let answer = resolver.send(&new_query()).await.unwrap();
        // The second truncated response came over TCP and is final.
        assert!(answer.is_truncated());
        assert_eq!(
            mock(&resolver).attempts(),
            vec![Attempt::Udp, Attempt::Tcp]
        );
    }

    #[tokio::test]
    async fn ignore_truncation_returns_truncated_answer() {
        let mut resolver = new_resolver(vec![Step::Reply { tc: true }]);
        resolver.set_ignore_truncation(true);
        let answer = resolver.send(&new_query()).await.unwrap();
        assert!(answer.is_truncated());
        assert_eq!(mock(&resolver).attempts(), vec![Attempt::Udp]);
    }

    //------------ Malformed Responses ---------------------------------------

    #[tokio::test]
    async fn short_response_is_fatal() {
        let resolver = new_resolver(vec![Step::Short]);
        assert!(matches!(
            resolver.send(&new_query()).await,
            Err(Error::ShortMessage)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let mut resolver = new_resolver(Vec::new());
        resolver.set_timeout(Duration::from_millis(2_000));
        assert!(matches!(
            resolver.send(&new_query()).await,
            Err(Error::Timeout)
        ));
    }

    //------------ Configuration ---------------------------------------------

    #[test]
    fn edns_level_is_validated() {
        let mut resolver = new_resolver(Vec::new());
        assert!(matches!(
            resolver.set_edns(2),
            Err(Error::InvalidEdnsLevel(2))
        ));
        assert!(resolver.edns.is_none());

        resolver.set_edns(0).unwrap();
        assert_eq!(
            resolver.edns.as_ref().unwrap().udp_payload_size(),
            DEFAULT_EDNS_PAYLOAD_SIZE
        );

        assert!(resolver.set_edns(17).is_err());
        assert!(resolver.edns.is_some());

        resolver.set_edns(-1).unwrap();
        assert!(resolver.edns.is_none());
    }

    #[test]
    fn address_setters() {
        let mut resolver = new_resolver(Vec::new());
        resolver.set_port(5353);
        assert_eq!(resolver.server().port(), 5353);
        resolver.set_ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(
            resolver.server(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 5353)
        );
    }

    #[tokio::test]
    async fn default_server_is_used_by_new() {
        set_default_server("127.0.0.1");
        let resolver = Resolver::new().await.unwrap();
        assert_eq!(resolver.server(), SERVER);
        set_default_server("");
    }

    //------------ Asynchronous Dispatch -------------------------------------

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_dispatches_complete_independently() {
        let resolver = new_resolver(
            (0..8).map(|_| Step::Reply { tc: false }).collect(),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut ids = Vec::new();
        let query = new_query();
        for _ in 0..8 {
            let tx = tx.clone();
            ids.push(resolver.send_async(&query, move |id, result| {
                tx.send((id, result.is_ok())).unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let (id, ok) = rx.recv().await.unwrap();
            assert!(ok);
            assert!(ids.contains(&id));
            assert!(!seen.contains(&id));
            seen.push(id);
        }
    }

    #[test]
    fn dispatch_ids_are_unique() {
        let a = DispatchId::next();
        let b = DispatchId::next();
        assert_ne!(a, b);
    }

    //------------ TSIG ------------------------------------------------------

    #[tokio::test]
    async fn unsigned_response_fails_verification_but_not_the_call() {
        let key = Arc::new(
            Key::new(
                Algorithm::Sha256,
                b"not-so-secret-key-bits",
                "tsig.example".parse().unwrap(),
                None,
                None,
            )
            .unwrap(),
        );
        let mut resolver = new_resolver(vec![Step::Reply { tc: false }]);
        resolver.set_tsig_key(Some(key));
        let answer = resolver.send(&new_query()).await.unwrap();
        assert!(matches!(
            answer.tsig_status(),
            TsigStatus::Failed(ValidationError::ServerUnsigned)
        ));
    }

    //------------ AXFR Response Assembly ------------------------------------

    fn example_records() -> Vec<XfrRecord> {
        let apex = Name::<Vec<u8>>::vec_from_str("example.test").unwrap();
        let mut msg = MessageBuilder::new_vec().answer();
        msg.push((
            apex.clone(),
            Class::IN,
            Ttl::from_secs(3600),
            Soa::new(
                Name::<Vec<u8>>::vec_from_str("ns.example.test").unwrap(),
                Name::<Vec<u8>>::vec_from_str("hostmaster.example.test")
                    .unwrap(),
                Serial::from(1),
                Ttl::from_secs(7200),
                Ttl::from_secs(900),
                Ttl::from_secs(86400),
                Ttl::from_secs(3600),
            ),
        ))
        .unwrap();
        msg.push((
            apex,
            Class::IN,
            Ttl::from_secs(3600),
            Ns::new(
                Name::<Vec<u8>>::vec_from_str("ns.example.test").unwrap(),
            ),
        ))
        .unwrap();
        msg.push((
            Name::<Vec<u8>>::vec_from_str("ns.example.test").unwrap(),
            Class::IN,
            Ttl::from_secs(3600),
            A::from_octets(192, 0, 2, 1),
        ))
        .unwrap();
        let msg = Message::from_octets(Bytes::from(
            msg.into_message().into_octets(),
        ))
        .unwrap();
        msg.answer()
            .unwrap()
            .map(|record| {
                record
                    .unwrap()
                    .into_record::<domain::rdata::AllRecordData<_, _>>()
                    .unwrap()
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn axfr_response_assembly() {
        let mut msg = MessageBuilder::new_vec();
        msg.header_mut().set_id(0x0BAD);
        let mut msg = msg.question();
        msg.push((
            Name::<Vec<u8>>::vec_from_str("example.test").unwrap(),
            Rtype::AXFR,
        ))
        .unwrap();
        let query = Message::from_octets(Bytes::from(
            msg.into_message().into_octets(),
        ))
        .unwrap();

        let records = example_records();
        let response = assemble_axfr_response(&query, &records).unwrap();

        let header = response.header();
        assert_eq!(header.id(), 0x0BAD);
        assert!(header.qr());
        assert!(header.aa());
        assert_eq!(response.header_counts().qdcount(), 1);
        assert_eq!(response.header_counts().ancount(), 3);

        let types: Vec<_> = response
            .answer()
            .unwrap()
            .map(|record| record.unwrap().rtype())
            .collect();
        assert_eq!(types, vec![Rtype::SOA, Rtype::NS, Rtype::A]);
    }
}
