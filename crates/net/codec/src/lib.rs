//! Codec building blocks for protobuf-framed protocols.
//!
//! [`ProtocolCodec`] wraps [`quick_protobuf_codec::Codec`] so that protocol
//! crates can work with their own domain types while the wire stays a
//! varint length-prefixed protobuf message.

use std::marker::PhantomData;

use bytes::BytesMut;

mod utils;
pub use utils::{connection_closed, next_message};

/// Generic codec converting between a protobuf message `Proto` and a protocol
/// type `Protocol`, reporting failures as `E`.
pub struct ProtocolCodec<Proto, Protocol, E>(
    quick_protobuf_codec::Codec<Proto>,
    PhantomData<(Protocol, E)>,
);

impl<Proto, Protocol, E> ProtocolCodec<Proto, Protocol, E> {
    /// Create a codec rejecting frames larger than `max_packet_size` bytes.
    pub fn new(max_packet_size: usize) -> Self {
        Self(
            quick_protobuf_codec::Codec::new(max_packet_size),
            PhantomData,
        )
    }
}

impl<Proto, Protocol, E> asynchronous_codec::Encoder for ProtocolCodec<Proto, Protocol, E>
where
    Proto: quick_protobuf::MessageWrite,
    Protocol: Into<Proto>,
    quick_protobuf_codec::Error: Into<E>,
    E: From<std::io::Error>,
{
    type Item<'a> = Protocol;
    type Error = E;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.0.encode(item.into(), dst).map_err(Into::into)
    }
}

impl<Proto, Protocol, PE, E> asynchronous_codec::Decoder for ProtocolCodec<Proto, Protocol, E>
where
    Proto: for<'a> quick_protobuf::MessageRead<'a>,
    Protocol: TryFrom<Proto, Error = PE>,
    PE: Into<E>,
    quick_protobuf_codec::Error: Into<E>,
    E: From<std::io::Error>,
{
    type Item = Protocol;
    type Error = E;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.0.decode(src).map_err(Into::into)? {
            Some(proto) => Protocol::try_from(proto).map(Some).map_err(Into::into),
            None => Ok(None),
        }
    }
}
