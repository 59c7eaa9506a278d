//! Protocol constants.

use std::time::Duration;

use libp2p::StreamProtocol;

/// Protocol name of the rendezvous exchange.
pub const PROTOCOL_NAME: &str = "/libp2p/dcutr";

/// Protocol of the rendezvous exchange.
pub const PROTOCOL: StreamProtocol = StreamProtocol::new(PROTOCOL_NAME);

/// Resource-manager service that rendezvous streams are attached to.
pub const SERVICE_NAME: &str = "libp2p.holepunch";

/// Maximum size of a single rendezvous message.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024;

/// Number of timed connect attempts before giving up on a peer.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default bound on the opportunistic direct dial and on each punch connect.
pub const DEFAULT_DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default I/O deadline for a whole rendezvous exchange.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(60);
