use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::identity::{DestinationKeys, IdentHash, Identity};
use crate::lease::{now_ms, LeaseSet};
use crate::packet::Packet;
use crate::registry::Event;
use crate::stream::{SendContext, Stream, StreamHandle};
use crate::transport::{NetworkContext, TunnelPool, DEFAULT_TUNNEL_HOPS};

/// Callback invoked on the dispatch loop for every new incoming stream
pub type Acceptor = Box<dyn FnMut(StreamHandle) + Send>;

/// A local endpoint: key material, a tunnel pool, and the table of active
/// streams indexed by their local (receive) id.
///
/// Owned by the registry and touched only on the dispatch loop.
pub struct StreamingDestination {
    keys: Arc<DestinationKeys>,
    network: NetworkContext,
    pool: Arc<dyn TunnelPool>,
    lease_set: Option<Arc<LeaseSet>>,
    streams: HashMap<u32, Stream>,
    acceptor: Option<Acceptor>,
    events: mpsc::UnboundedSender<Event>,
}

impl StreamingDestination {
    pub(crate) fn new(
        keys: DestinationKeys,
        network: NetworkContext,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let keys = Arc::new(keys);
        let pool = network
            .tunnels
            .create_pool(&keys.ident_hash(), DEFAULT_TUNNEL_HOPS);
        Self {
            keys,
            network,
            pool,
            lease_set: None,
            streams: HashMap::new(),
            acceptor: None,
            events,
        }
    }

    /// Load a persisted destination from a `.dat` file
    pub(crate) fn from_file(
        path: &Path,
        network: NetworkContext,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Self> {
        Ok(Self::new(DestinationKeys::load(path)?, network, events))
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.keys.ident_hash()
    }

    pub fn identity(&self) -> &Identity {
        self.keys.identity()
    }

    /// DSA signature with this destination's signing key
    pub fn sign(&self, data: &[u8]) -> Result<[u8; crate::identity::SIGNATURE_SIZE]> {
        self.keys.sign(data)
    }

    pub(crate) fn set_acceptor(&mut self, acceptor: Acceptor) {
        self.acceptor = Some(acceptor);
    }

    pub(crate) fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Random nonzero id not yet present in the stream table
    fn allocate_stream_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u32 = rng.gen();
            if id != 0 && !self.streams.contains_key(&id) {
                return id;
            }
        }
    }

    fn handle_for(&self, stream: &Stream) -> StreamHandle {
        StreamHandle::new(
            self.keys.ident_hash(),
            stream.recv_stream_id(),
            self.events.clone(),
            stream.shared(),
        )
    }

    /// Client side: allocate and register a stream towards `remote`
    pub(crate) fn create_outgoing_stream(&mut self, remote: Arc<LeaseSet>) -> StreamHandle {
        let id = self.allocate_stream_id();
        let stream = Stream::new_outgoing(id, remote);
        let handle = self.handle_for(&stream);
        self.streams.insert(id, stream);
        debug!("created outgoing stream {} on {}", id, self.ident_hash());
        handle
    }

    fn create_incoming_stream(&mut self) -> u32 {
        let id = self.allocate_stream_id();
        self.streams.insert(id, Stream::new_incoming(id));
        id
    }

    /// Demultiplex one inbound packet to its stream.
    ///
    /// A zero send-stream id announces a new incoming stream: it is created,
    /// handed to the acceptor, and then fed the packet.
    pub(crate) fn handle_next_packet(&mut self, packet: Packet) {
        let send_stream_id = packet.send_stream_id();
        if send_stream_id != 0 {
            if !self.streams.contains_key(&send_stream_id) {
                warn!("unknown stream {} on {}", send_stream_id, self.ident_hash());
                return;
            }
            let mut ctx = self.send_context(send_stream_id);
            if let Some(stream) = self.streams.get_mut(&send_stream_id) {
                stream.handle_next_packet(packet, &mut ctx);
            }
        } else {
            let id = self.create_incoming_stream();
            debug!("new incoming stream {} on {}", id, self.ident_hash());
            if let Some(stream) = self.streams.get(&id) {
                let handle = self.handle_for(stream);
                if let Some(acceptor) = self.acceptor.as_mut() {
                    acceptor(handle);
                }
            }
            let mut ctx = self.send_context(id);
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.handle_next_packet(packet, &mut ctx);
            }
        }
    }

    pub(crate) fn send_on_stream(&mut self, id: u32, data: &[u8]) {
        if !self.streams.contains_key(&id) {
            warn!("send on unknown stream {} on {}", id, self.ident_hash());
            return;
        }
        let mut ctx = self.send_context(id);
        if let Some(stream) = self.streams.get_mut(&id) {
            if let Err(e) = stream.send(data, &mut ctx) {
                warn!("send on stream {} failed: {}", id, e);
            }
        }
    }

    pub(crate) fn close_stream(&mut self, id: u32) {
        if !self.streams.contains_key(&id) {
            return;
        }
        let mut ctx = self.send_context(id);
        if let Some(stream) = self.streams.get_mut(&id) {
            if let Err(e) = stream.close(&mut ctx) {
                warn!("close on stream {} failed: {}", id, e);
            }
        }
    }

    pub(crate) fn drain_stream(&mut self, id: u32, max: usize) -> Vec<u8> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Vec::new();
        };
        let mut buf = vec![0u8; max];
        let n = stream.concatenate_packets(&mut buf);
        buf.truncate(n);
        buf
    }

    /// Unregister and destroy a stream; queued packets are released and any
    /// blocked reader wakes with end-of-stream.
    pub(crate) fn delete_stream(&mut self, id: u32) {
        if self.streams.remove(&id).is_some() {
            debug!("deleted stream {} on {}", id, self.ident_hash());
        }
    }

    /// The destination's current lease set, rebuilt from the tunnel pool
    /// whenever missing or holding an expired lease. After a rebuild every
    /// live stream advertises the fresh set on its next outbound packet.
    pub(crate) fn lease_set(&mut self) -> Option<Arc<LeaseSet>> {
        let now = now_ms();
        let stale = self
            .lease_set
            .as_ref()
            .map_or(true, |ls| ls.has_expired_leases(now));
        if stale {
            let mut fresh = LeaseSet::new(self.keys.ident_hash(), self.pool.inbound_leases());
            match self.keys.sign(&fresh.signable_bytes()) {
                Ok(signature) => fresh.set_signature(signature),
                Err(e) => {
                    warn!("failed to sign lease set for {}: {}", self.ident_hash(), e);
                    return self.lease_set.clone();
                }
            }
            self.lease_set = Some(Arc::new(fresh));
            for stream in self.streams.values_mut() {
                stream.set_lease_set_updated();
            }
            debug!("lease set refreshed for {}", self.ident_hash());
        }
        self.lease_set.clone()
    }

    fn lease_set_bytes(&mut self) -> Option<Bytes> {
        self.lease_set().map(|ls| ls.to_bytes())
    }

    /// Snapshot everything a stream call may need. The piggyback is filled
    /// only when the target stream owes its peer a lease-set update.
    fn send_context(&mut self, stream_id: u32) -> SendContext {
        let piggyback = if self
            .streams
            .get(&stream_id)
            .map_or(false, |s| s.lease_set_updated())
        {
            self.lease_set_bytes()
        } else {
            None
        };
        SendContext {
            keys: self.keys.clone(),
            lease_sets: self.network.lease_sets.clone(),
            garlic: self.network.garlic.clone(),
            pool: self.pool.clone(),
            piggyback,
        }
    }
}
