//! Seams to the surrounding router.
//!
//! The streaming layer does not own tunnels, the lease-set directory or the
//! garlic encryptor; it consumes them through these traits. The embedding
//! router implements them against its real machinery, tests wire them to
//! in-memory fakes.

use std::sync::Arc;

use bytes::Bytes;

use crate::identity::IdentHash;
use crate::lease::{Lease, LeaseSet};

/// Default tunnel length for destination pools
pub const DEFAULT_TUNNEL_HOPS: usize = 3;

/// Lease-set directory lookup
pub trait LeaseSetStore: Send + Sync {
    fn find_lease_set(&self, ident: &IdentHash) -> Option<Arc<LeaseSet>>;
}

/// One usable outbound tunnel
pub trait OutboundTunnel: Send + Sync {
    /// Hand a wrapped message to the tunnel, addressed to the remote
    /// gateway/tunnel-id pair. Fire and forget; delivery is best effort.
    fn send_tunnel_data(&self, gateway: &IdentHash, tunnel_id: u32, message: Bytes);
}

/// A destination's managed set of tunnels
pub trait TunnelPool: Send + Sync {
    fn next_outbound_tunnel(&self) -> Option<Arc<dyn OutboundTunnel>>;

    /// Current inbound tunnels, as leases for the destination's lease set
    fn inbound_leases(&self) -> Vec<Lease>;
}

/// Creates tunnel pools for local destinations
pub trait TunnelProvider: Send + Sync {
    fn create_pool(&self, destination: &IdentHash, hops: usize) -> Arc<dyn TunnelPool>;
}

/// End-to-end garlic encryption
pub trait GarlicRouter: Send + Sync {
    /// Wrap `message` for the destination advertised by `remote`, optionally
    /// bundling a serialized local lease set in the same clove.
    fn wrap(&self, remote: &LeaseSet, message: Bytes, lease_set: Option<Bytes>) -> Bytes;
}

/// Everything the streaming layer needs from the router, bundled
#[derive(Clone)]
pub struct NetworkContext {
    pub lease_sets: Arc<dyn LeaseSetStore>,
    pub tunnels: Arc<dyn TunnelProvider>,
    pub garlic: Arc<dyn GarlicRouter>,
}
