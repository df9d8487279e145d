//! Reliable, ordered message streams over a garlic-routed datagram substrate.
//!
//! This crate is the streaming layer of an anonymous overlay network: a
//! TCP-like protocol (sequencing, reassembly, handshake, orderly shutdown)
//! carried inside end-to-end encrypted tunnels whose endpoints are
//! cryptographic destinations rather than addresses. The substrate itself —
//! garlic encryption, tunnel pools, the lease-set directory — stays outside,
//! consumed through the traits in [`transport`].
//!
//! # Architecture
//!
//! ```text
//! Application
//!     ↓ StreamHandle (send / read / close)
//! StreamingRegistry ── single dispatch loop owning all state
//!     ↓ per destination: StreamingDestination (demux by stream id)
//!     ↓ per connection:  Stream (seqn tracking, reassembly, ACKs)
//!     ↓ gzip data-message framing, garlic wrap
//! tunnel substrate
//! ```
//!
//! All stream and destination state is mutated on one loop task; public
//! entry points post work onto it and never block the caller on I/O.
//!
//! # Example
//!
//! ```rust,ignore
//! use garlic_stream::{RegistryConfig, StreamingRegistry};
//!
//! #[tokio::main]
//! async fn main() -> garlic_stream::Result<()> {
//!     let registry = StreamingRegistry::start(RegistryConfig::default(), network)?;
//!
//!     // Server side: accept incoming streams on the shared destination
//!     registry.set_acceptor(registry.shared_local_destination(), Box::new(|stream| {
//!         println!("incoming stream {}", stream.id());
//!     }))?;
//!
//!     // Client side: open a stream towards a known lease set
//!     let stream = registry.create_stream(remote_lease_set).await?;
//!     stream.send(b"hello", 0)?;
//!
//!     let mut buf = vec![0u8; 1024];
//!     let n = stream.read(&mut buf).await?;
//!     stream.close()?;
//!     Ok(())
//! }
//! ```

pub mod data_message;
pub mod destination;
pub mod error;
pub mod identity;
pub mod lease;
pub mod packet;
pub mod registry;
pub mod stream;
pub mod transport;

// Re-export main types
pub use data_message::{create_data_message, parse_data_message, PROTOCOL_STREAMING};
pub use destination::{Acceptor, StreamingDestination};
pub use error::{Error, Result};
pub use identity::{DestinationKeys, IdentHash, Identity, IDENTITY_SIZE, SIGNATURE_SIZE};
pub use lease::{Lease, LeaseSet};
pub use packet::{Packet, MAX_PACKET_SIZE, STREAMING_MTU};
pub use registry::{RegistryConfig, StreamingRegistry};
pub use stream::{Stream, StreamHandle, StreamState};
pub use transport::{
    GarlicRouter, LeaseSetStore, NetworkContext, OutboundTunnel, TunnelPool, TunnelProvider,
    DEFAULT_TUNNEL_HOPS,
};
