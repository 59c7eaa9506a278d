//! Codec for rendezvous messages.

use libp2p::Multiaddr;
use vertex_net_codec::ProtocolCodec;
use vertex_net_utils::{addrs_from_bytes, addrs_to_bytes};

use crate::proto::holepunch::{HolePunch, mod_HolePunch::Type};

/// Codec for [`HolePunchMessage`]s, used in both directions.
pub(crate) type HolePunchCodec = ProtocolCodec<HolePunch, HolePunchMessage, HolePunchCodecError>;

/// Error type for holepunch codec operations.
#[derive(Debug, thiserror::Error)]
pub enum HolePunchCodecError {
    /// Malformed or oversized frame.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<quick_protobuf_codec::Error> for HolePunchCodecError {
    fn from(error: quick_protobuf_codec::Error) -> Self {
        HolePunchCodecError::Protocol(error.to_string())
    }
}

/// A rendezvous message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HolePunchMessage {
    /// Candidate addresses of the sender.
    Connect { observed_addrs: Vec<Multiaddr> },
    /// The sender is about to dial.
    Sync,
}

impl HolePunchMessage {
    pub fn connect(observed_addrs: Vec<Multiaddr>) -> Self {
        Self::Connect { observed_addrs }
    }

    /// Message type name as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "CONNECT",
            Self::Sync => "SYNC",
        }
    }
}

impl TryFrom<HolePunch> for HolePunchMessage {
    type Error = HolePunchCodecError;

    fn try_from(value: HolePunch) -> Result<Self, Self::Error> {
        Ok(match value.type_pb {
            Type::CONNECT => Self::Connect {
                observed_addrs: addrs_from_bytes(value.ObsAddrs),
            },
            Type::SYNC => Self::Sync,
        })
    }
}

impl From<HolePunchMessage> for HolePunch {
    fn from(value: HolePunchMessage) -> Self {
        match value {
            HolePunchMessage::Connect { observed_addrs } => HolePunch {
                type_pb: Type::CONNECT,
                ObsAddrs: addrs_to_bytes(&observed_addrs),
            },
            HolePunchMessage::Sync => HolePunch {
                type_pb: Type::SYNC,
                ObsAddrs: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use asynchronous_codec::{Decoder, Encoder};
    use bytes::BytesMut;

    use crate::constants::MAX_MESSAGE_SIZE;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_connect_to_proto() {
        let addrs = vec![addr("/ip4/1.2.3.4/tcp/4001"), addr("/ip4/1.2.3.4/udp/4001/quic-v1")];
        let proto: HolePunch = HolePunchMessage::connect(addrs.clone()).into();
        assert_eq!(proto.type_pb, Type::CONNECT);
        assert_eq!(proto.ObsAddrs, addrs.iter().map(|a| a.to_vec()).collect::<Vec<_>>());
    }

    #[test]
    fn test_sync_carries_no_addrs() {
        let proto: HolePunch = HolePunchMessage::Sync.into();
        assert_eq!(proto.type_pb, Type::SYNC);
        assert!(proto.ObsAddrs.is_empty());
    }

    #[test]
    fn test_sync_ignores_stray_addrs() {
        let proto = HolePunch {
            type_pb: Type::SYNC,
            ObsAddrs: vec![addr("/ip4/1.2.3.4/tcp/1").to_vec()],
        };
        assert_eq!(HolePunchMessage::try_from(proto).unwrap(), HolePunchMessage::Sync);
    }

    #[test]
    fn test_connect_skips_undecodable_addrs() {
        let good = addr("/ip4/1.2.3.4/tcp/4001");
        let proto = HolePunch {
            type_pb: Type::CONNECT,
            ObsAddrs: vec![vec![0xde, 0xad], good.to_vec()],
        };
        assert_eq!(
            HolePunchMessage::try_from(proto).unwrap(),
            HolePunchMessage::connect(vec![good])
        );
    }

    #[test]
    fn test_framed_encode_decode() {
        let mut codec = HolePunchCodec::new(MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();
        let message = HolePunchMessage::connect(vec![addr("/ip6/2606:4700::1111/tcp/4001")]);

        codec.encode(message.clone(), &mut buf).unwrap();
        codec.encode(HolePunchMessage::Sync, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(message));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(HolePunchMessage::Sync));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_wire_sync_frame() {
        let mut codec = HolePunchCodec::new(MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::from(&[0x03, 0x08, 0xAC, 0x02][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(HolePunchMessage::Sync));
    }

    #[test]
    fn test_missing_or_unknown_type_decodes_as_connect() {
        let mut codec = HolePunchCodec::new(MAX_MESSAGE_SIZE);
        // Empty message, then type = 1.
        let mut buf = BytesMut::from(&[0x00, 0x02, 0x08, 0x01][..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(HolePunchMessage::connect(Vec::new()))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(HolePunchMessage::connect(Vec::new()))
        );
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut encoder = HolePunchCodec::new(MAX_MESSAGE_SIZE * 4);
        let mut buf = BytesMut::new();
        let addrs = (0..600u16)
            .map(|port| addr(&format!("/ip4/1.2.3.4/tcp/{port}")))
            .collect();
        encoder.encode(HolePunchMessage::connect(addrs), &mut buf).unwrap();
        assert!(buf.len() > MAX_MESSAGE_SIZE);

        let mut decoder = HolePunchCodec::new(MAX_MESSAGE_SIZE);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(HolePunchCodecError::Protocol(_))
        ));
    }
}
