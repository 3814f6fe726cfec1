//! A simple single-server DNS stub resolver.
//!
//! This crate sends DNS queries to one configured name server and returns
//! the parsed response. It takes care of the plumbing that sits between a
//! wire-format message and a socket: choosing between UDP and TCP,
//! correlating responses with queries via the message ID, falling back to
//! TCP when a UDP response arrives truncated, applying an EDNS(0) OPT
//! record and a TSIG signature to outgoing queries, enforcing an overall
//! request deadline, and driving full zone transfers (AXFR).
//!
//! It is deliberately _not_ a caching or recursive resolver. There is no
//! server selection, no failover, and no DNSSEC validation. One resolver,
//! one server, one query at a time – although any number of queries may be
//! in flight concurrently.
//!
//! The wire format itself is handled by the [domain] crate. Queries are
//! built with its [`MessageBuilder`][domain::base::MessageBuilder] and
//! responses come back as its [`Message`][domain::base::Message].
//!
//! # Usage
//!
//! Build a query message, create a [`Resolver`] for your server, and send:
//!
//! ```no_run
//! use domain::base::{MessageBuilder, Name, Rtype};
//! use domain_stub::Resolver;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut msg = MessageBuilder::new_vec();
//! msg.header_mut().set_rd(true);
//! let mut msg = msg.question();
//! msg.push((Name::vec_from_str("example.com")?, Rtype::A))?;
//! let query = msg.into_message();
//!
//! let resolver = Resolver::from_host("192.0.2.1").await?;
//! let answer = resolver.send(&query).await?;
//! println!("{} answers", answer.message().header_counts().ancount());
//! # Ok(())
//! # }
//! ```
//!
//! [`Resolver::send`][resolver::Resolver::send] runs the query to
//! completion. [`Resolver::send_async`][resolver::Resolver::send_async]
//! instead spawns the query onto the runtime and reports the outcome
//! through a completion handler, identified by a
//! [`DispatchId`][resolver::DispatchId]. The [`sync`] module provides a
//! blocking interface for code that does not live inside an async runtime.
//!
//! [domain]: https://docs.rs/domain/

#![warn(missing_docs)]

pub mod error;
pub mod protocol;
mod request;
pub mod resolver;
pub mod sync;
pub mod xfr;

pub use self::error::Error;
pub use self::resolver::{Answer, DispatchId, Resolver, TsigStatus};
