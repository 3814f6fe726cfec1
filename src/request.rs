//! Building the message that actually goes out on the wire.
//!
//! The resolver never touches the caller's query. Instead, preparation
//! composes an independent copy, applies the configured EDNS(0) OPT record
//! and TSIG signature to that copy, and serializes it once for both
//! transports.

#![warn(clippy::missing_docs_in_private_items)]

use std::sync::Arc;
use std::vec::Vec;

use domain::base::message::Message;
use domain::base::message_builder::{
    MessageBuilder, StaticCompressor, StreamTarget,
};
use domain::rdata::tsig::Time48;
use domain::rdata::AllRecordData;
use domain::tsig::{ClientTransaction, Key};
use octseq::{Octets, OctetsBuilder};

use crate::error::Error;
use crate::resolver::EdnsConfig;

/// The maximum UDP payload size assumed without EDNS.
const DEFAULT_UDP_SIZE: u16 = 512;

//------------ PreparedQuery -------------------------------------------------

/// A query serialized and ready for transmission.
pub(crate) struct PreparedQuery {
    /// The assembled wire format, usable for both transports.
    target: StreamTarget<Vec<u8>>,

    /// The message ID of the query.
    id: u16,

    /// The maximum UDP payload size applicable to this query.
    max_udp_size: u16,

    /// The TSIG state needed to verify the response, if signing was done.
    tsig: Option<ClientTransaction<Arc<Key>>>,
}

impl PreparedQuery {
    /// Returns the wire format without the stream length prefix.
    pub fn dgram(&self) -> &[u8] {
        self.target.as_dgram_slice()
    }

    /// Returns the message ID of the query.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Returns the maximum UDP payload size applicable to this query.
    ///
    /// This is the payload size advertised in the query's OPT record or
    /// the protocol default of 512 octets if there is none.
    pub fn max_udp_size(&self) -> u16 {
        self.max_udp_size
    }

    /// Takes the TSIG verification state out of the prepared query.
    pub fn take_tsig(&mut self) -> Option<ClientTransaction<Arc<Key>>> {
        self.tsig.take()
    }
}

//------------ prepare -------------------------------------------------------

/// Prepares a caller's query for transmission.
///
/// Copies the message section by section, appends an OPT record built from
/// `edns` unless the query already carries one, and signs the result with
/// `key` if given. Fails with [`Error::MessageBuilderPushError`] if the
/// result exceeds the maximum message length.
pub(crate) fn prepare<Octs: Octets>(
    query: &Message<Octs>,
    edns: Option<&EdnsConfig>,
    key: Option<&Arc<Key>>,
) -> Result<PreparedQuery, Error> {
    let id = query.header().id();

    let mut target = MessageBuilder::from_target(StaticCompressor::new(
        StreamTarget::new_vec(),
    ))
    .map_err(|_| Error::MessageBuilderPushError)?;
    *target.header_mut() = query.header();

    let mut builder = target.question();
    for item in query.question() {
        let question = item.map_err(|_| Error::MessageParseError)?;
        builder
            .push(question)
            .map_err(|_| Error::MessageBuilderPushError)?;
    }

    let mut builder = builder.answer();
    for item in query.answer().map_err(|_| Error::MessageParseError)? {
        let record = parse_record(item)?;
        builder
            .push(record)
            .map_err(|_| Error::MessageBuilderPushError)?;
    }

    let mut builder = builder.authority();
    for item in query.authority().map_err(|_| Error::MessageParseError)? {
        let record = parse_record(item)?;
        builder
            .push(record)
            .map_err(|_| Error::MessageBuilderPushError)?;
    }

    let mut additional = builder.additional();
    for item in query.additional().map_err(|_| Error::MessageParseError)? {
        let record = parse_record(item)?;
        additional
            .push(record)
            .map_err(|_| Error::MessageBuilderPushError)?;
    }

    if let Some(edns) = edns {
        if query.opt().is_none() {
            additional
                .opt(|opt| {
                    opt.set_udp_payload_size(edns.udp_payload_size());
                    opt.set_version(0);
                    if edns.dnssec_ok() {
                        opt.set_dnssec_ok(true);
                    }
                    for (code, data) in edns.options() {
                        let len = u16::try_from(data.len())
                            .map_err(|_| octseq::builder::ShortBuf)?;
                        opt.push_raw_option(*code, len, |target| {
                            target.append_slice(data)
                        })?;
                    }
                    Ok(())
                })
                .map_err(|_| Error::MessageBuilderPushError)?;
        }
    }

    let tsig = match key {
        Some(key) => Some(
            ClientTransaction::request(
                key.clone(),
                &mut additional,
                Time48::now(),
            )
            .map_err(|_| Error::MessageBuilderPushError)?,
        ),
        None => None,
    };

    let max_udp_size = match query.opt() {
        Some(opt) => opt.udp_payload_size(),
        None => match edns {
            Some(edns) => edns.udp_payload_size(),
            None => DEFAULT_UDP_SIZE,
        },
    };

    Ok(PreparedQuery {
        target: additional.finish().into_target(),
        id,
        max_udp_size,
        tsig,
    })
}

/// Converts one parsed record of the caller's query into pushable form.
#[allow(clippy::type_complexity)]
fn parse_record<'a, Octs: Octets + ?Sized>(
    item: Result<
        domain::base::record::ParsedRecord<'a, Octs>,
        domain::base::wire::ParseError,
    >,
) -> Result<
    domain::base::record::Record<
        domain::base::name::ParsedName<Octs::Range<'a>>,
        AllRecordData<Octs::Range<'a>, domain::base::name::ParsedName<Octs::Range<'a>>>,
    >,
    Error,
> {
    item.map_err(|_| Error::MessageParseError)?
        .into_record::<AllRecordData<_, _>>()
        .map_err(|_| Error::MessageParseError)?
        .ok_or(Error::MessageParseError)
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::iana::OptionCode;
    use domain::base::{MessageBuilder, Name, Rtype};
    use domain::tsig::Algorithm;

    fn new_query(id: u16) -> Message<Vec<u8>> {
        let mut msg = MessageBuilder::new_vec();
        msg.header_mut().set_id(id);
        msg.header_mut().set_rd(true);
        let mut msg = msg.question();
        msg.push((
            Name::<Vec<u8>>::vec_from_str("example.test").unwrap(),
            Rtype::A,
        ))
        .unwrap();
        msg.into_message()
    }

    fn test_key() -> Arc<Key> {
        Arc::new(
            Key::new(
                Algorithm::Sha256,
                b"not-so-secret-key-bits",
                "tsig.example".parse().unwrap(),
                None,
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn plain_query_roundtrips() {
        let query = new_query(0x1234);
        let prepared = prepare(&query, None, None).unwrap();
        assert_eq!(prepared.id(), 0x1234);
        assert_eq!(prepared.max_udp_size(), 512);

        let copy =
            Message::from_octets(prepared.dgram().to_vec()).unwrap();
        assert_eq!(copy.header().id(), 0x1234);
        assert!(copy.header().rd());
        assert_eq!(copy.header_counts().qdcount(), 1);
        assert_eq!(copy.header_counts().arcount(), 0);
        assert!(copy.opt().is_none());
    }

    #[test]
    fn edns_is_applied() {
        let query = new_query(1);
        let edns = EdnsConfig::new(
            4096,
            0x8000,
            vec![(OptionCode::PADDING, vec![0; 4])],
        );
        let prepared = prepare(&query, Some(&edns), None).unwrap();
        assert_eq!(prepared.max_udp_size(), 4096);

        let copy =
            Message::from_octets(prepared.dgram().to_vec()).unwrap();
        let opt = copy.opt().unwrap();
        assert_eq!(opt.udp_payload_size(), 4096);
        assert!(opt.dnssec_ok());
    }

    #[test]
    fn existing_opt_is_kept() {
        let mut msg = MessageBuilder::new_vec();
        msg.header_mut().set_id(2);
        let mut msg = msg.question();
        msg.push((
            Name::<Vec<u8>>::vec_from_str("example.test").unwrap(),
            Rtype::A,
        ))
        .unwrap();
        let mut additional = msg.additional();
        additional
            .opt(|opt| {
                opt.set_udp_payload_size(1400);
                Ok(())
            })
            .unwrap();
        let query = additional.into_message();

        let edns = EdnsConfig::new(4096, 0, Vec::new());
        let prepared = prepare(&query, Some(&edns), None).unwrap();
        assert_eq!(prepared.max_udp_size(), 1400);

        let copy =
            Message::from_octets(prepared.dgram().to_vec()).unwrap();
        assert_eq!(copy.header_counts().arcount(), 1);
        assert_eq!(copy.opt().unwrap().udp_payload_size(), 1400);
    }

    #[test]
    fn tsig_is_applied() {
        let query = new_query(3);
        let key = test_key();
        let mut prepared = prepare(&query, None, Some(&key)).unwrap();
        assert!(prepared.take_tsig().is_some());

        let copy =
            Message::from_octets(prepared.dgram().to_vec()).unwrap();
        assert_eq!(copy.header_counts().arcount(), 1);
        let record = copy
            .additional()
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(record.rtype(), Rtype::TSIG);
    }

    #[test]
    fn oversized_query_fails_to_serialize() {
        let msg = MessageBuilder::new_vec();
        let mut msg = msg.question();
        for i in 0..2500 {
            msg.push((
                Name::<Vec<u8>>::vec_from_str(&format!(
                    "a{}.quite-long-label-to-inflate-the-message.test",
                    i
                ))
                .unwrap(),
                Rtype::A,
            ))
            .unwrap();
        }
        let query = msg.into_message();
        assert!(matches!(
            prepare(&query, None, None),
            Err(Error::MessageBuilderPushError)
        ));
    }
}
