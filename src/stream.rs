use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::data_message::create_data_message;
use crate::error::{Error, Result};
use crate::identity::{DestinationKeys, IdentHash, Identity, IDENTITY_SIZE, SIGNATURE_SIZE};
use crate::lease::{now_ms, Lease, LeaseSet};
use crate::packet::{
    Packet, FLAG_CLOSE, FLAG_FROM_INCLUDED, FLAG_MAX_PACKET_SIZE_INCLUDED, FLAG_NO_ACK,
    FLAG_SIGNATURE_INCLUDED, FLAG_SYNCHRONIZE, MIN_HEADER_SIZE, STREAMING_MTU,
};
use crate::registry::Event;
use crate::transport::{GarlicRouter, LeaseSetStore, TunnelPool};

/// Cap on out-of-order packets held while waiting for their predecessors
const MAX_SAVED_PACKETS: usize = 256;

/// Stream lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, SYN not yet sent (outgoing streams only)
    Init,
    /// Active, can send/receive
    Open,
    /// Terminal; no further emission
    Closed,
}

/// State shared between a loop-owned [`Stream`] and its [`StreamHandle`]s
#[derive(Debug, Default)]
pub(crate) struct StreamShared {
    pub(crate) closed: AtomicBool,
    pub(crate) read_notify: Notify,
}

/// Everything a stream needs from its destination to emit one packet.
///
/// Built by the owning destination immediately before each call into the
/// stream, so the dispatch loop never holds two mutable borrows at once.
pub(crate) struct SendContext {
    pub(crate) keys: Arc<DestinationKeys>,
    pub(crate) lease_sets: Arc<dyn LeaseSetStore>,
    pub(crate) garlic: Arc<dyn GarlicRouter>,
    pub(crate) pool: Arc<dyn TunnelPool>,
    /// Serialized local lease set, present when this stream owes its peer
    /// an update; consumed by the first packet that goes out.
    pub(crate) piggyback: Option<Bytes>,
}

/// Per-connection send/receive state machine.
///
/// Owned by its destination and mutated only on the dispatch loop;
/// applications talk to it through a [`StreamHandle`].
pub struct Stream {
    recv_stream_id: u32,
    send_stream_id: u32,
    sequence_number: u32,
    last_received_sequence_number: u32,
    state: StreamState,
    is_outgoing: bool,
    lease_set_updated: bool,
    remote_identity: Option<Identity>,
    remote_lease_set: Option<Arc<LeaseSet>>,
    current_remote_lease: Option<Lease>,
    /// Future packets keyed by sequence number, waiting for the gap to fill
    reorder_buffer: BTreeMap<u32, Packet>,
    /// In-order packets with unread payload
    receive_queue: VecDeque<Packet>,
    shared: Arc<StreamShared>,
}

impl Stream {
    /// Client-side stream towards a known remote lease set
    pub(crate) fn new_outgoing(recv_stream_id: u32, remote: Arc<LeaseSet>) -> Self {
        let mut stream = Self::new(recv_stream_id, StreamState::Init, true);
        stream.remote_lease_set = Some(remote);
        stream.pick_remote_lease();
        stream
    }

    /// Server-side stream born from an unsolicited first packet
    pub(crate) fn new_incoming(recv_stream_id: u32) -> Self {
        let mut stream = Self::new(recv_stream_id, StreamState::Open, false);
        // never emits a SYN, and a data packet with sequence 0 would read as
        // a pure ACK on the peer
        stream.sequence_number = 1;
        stream
    }

    fn new(recv_stream_id: u32, state: StreamState, is_outgoing: bool) -> Self {
        Self {
            recv_stream_id,
            send_stream_id: 0,
            sequence_number: 0,
            last_received_sequence_number: 0,
            state,
            is_outgoing,
            lease_set_updated: true,
            remote_identity: None,
            remote_lease_set: None,
            current_remote_lease: None,
            reorder_buffer: BTreeMap::new(),
            receive_queue: VecDeque::new(),
            shared: Arc::new(StreamShared::default()),
        }
    }

    pub fn recv_stream_id(&self) -> u32 {
        self.recv_stream_id
    }

    pub fn send_stream_id(&self) -> u32 {
        self.send_stream_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_outgoing(&self) -> bool {
        self.is_outgoing
    }

    pub(crate) fn lease_set_updated(&self) -> bool {
        self.lease_set_updated
    }

    /// The next outbound packet must advertise our fresh lease set
    pub(crate) fn set_lease_set_updated(&mut self) {
        self.lease_set_updated = true;
    }

    pub(crate) fn shared(&self) -> Arc<StreamShared> {
        self.shared.clone()
    }

    /// Inbound packet already demultiplexed to this stream
    pub(crate) fn handle_next_packet(&mut self, packet: Packet, ctx: &mut SendContext) {
        if self.send_stream_id == 0 {
            self.send_stream_id = packet.recv_stream_id();
        }

        let seqn = packet.seqn();
        if seqn == 0 && !packet.is_syn() {
            trace!("plain ACK received, ack_through={}", packet.ack_through());
            return;
        }

        trace!("received seqn={}", seqn);
        if seqn == 0 || seqn == self.last_received_sequence_number + 1 {
            // next in sequence; drain whatever it unblocks
            self.process_packet(packet, ctx);
            while let Some(saved) = self
                .reorder_buffer
                .remove(&(self.last_received_sequence_number + 1))
            {
                self.process_packet(saved, ctx);
            }
            if self.state == StreamState::Open {
                self.send_quick_ack(ctx);
            }
        } else if seqn <= self.last_received_sequence_number {
            // duplicate: the peer keeps resending, so our ACKs are most
            // likely dying on a stale outbound lease
            debug!("duplicate seqn={} received, switching lease", seqn);
            self.update_current_remote_lease(ctx);
            self.send_quick_ack(ctx);
        } else {
            debug!(
                "missing seqns {}..{}, buffering {}",
                self.last_received_sequence_number + 1,
                seqn - 1,
                seqn
            );
            self.save_packet(packet);
        }
    }

    fn save_packet(&mut self, packet: Packet) {
        if self.reorder_buffer.len() >= MAX_SAVED_PACKETS {
            warn!(
                "reorder buffer full on stream {}, dropping seqn={}",
                self.recv_stream_id,
                packet.seqn()
            );
            return;
        }
        self.reorder_buffer.insert(packet.seqn(), packet);
    }

    fn process_packet(&mut self, mut packet: Packet, ctx: &mut SendContext) {
        let seqn = packet.seqn();
        let flags = packet.flags();
        trace!("process seqn={} flags={:#06x}", seqn, flags);

        let options = packet.option_data();
        let mut cursor = 0usize;
        if flags & FLAG_SYNCHRONIZE != 0 {
            trace!("synchronize");
        }
        if flags & FLAG_FROM_INCLUDED != 0 {
            match Identity::from_bytes(&options[cursor..]) {
                Ok(identity) => {
                    cursor += IDENTITY_SIZE;
                    let hash = identity.hash();
                    if let Some(remote) = &self.remote_lease_set {
                        if hash != remote.ident_hash() {
                            warn!(
                                "unexpected identity {} on stream {}, expected {}",
                                hash,
                                self.recv_stream_id,
                                remote.ident_hash()
                            );
                            // keep the stream, rediscover the lease set later
                            self.remote_lease_set = None;
                        }
                    } else {
                        debug!("stream {} is from {}", self.recv_stream_id, hash);
                    }
                    self.remote_identity = Some(identity);
                }
                Err(_) => {
                    warn!("FROM option truncated, skipping options");
                    cursor += IDENTITY_SIZE;
                }
            }
        }
        if flags & FLAG_MAX_PACKET_SIZE_INCLUDED != 0 {
            if options.len() >= cursor + 2 {
                let mtu = u16::from_be_bytes([options[cursor], options[cursor + 1]]);
                trace!("peer advertises MTU {}", mtu);
            }
            cursor += 2;
        }
        if flags & FLAG_SIGNATURE_INCLUDED != 0 && options.len() >= cursor + SIGNATURE_SIZE {
            // signature is not verified at this layer
            trace!("signature present");
        }

        packet.seek_to_payload();
        if !packet.remaining().is_empty() {
            self.receive_queue.push_back(packet);
            self.shared.read_notify.notify_one();
        }
        // a retransmitted SYN reprocesses with sequence 0; never regress
        self.last_received_sequence_number = self.last_received_sequence_number.max(seqn);

        if flags & FLAG_CLOSE != 0 {
            debug!("stream {} closed by peer", self.recv_stream_id);
            self.send_quick_ack(ctx);
            self.transition_closed();
        }
    }

    /// Build and schedule one packet; the first send opens the stream with a
    /// signed SYN carrying our identity and MTU.
    pub(crate) fn send(&mut self, buf: &[u8], ctx: &mut SendContext) -> Result<usize> {
        match self.state {
            StreamState::Closed => Err(Error::StreamClosed),
            StreamState::Init => {
                self.state = StreamState::Open;
                let packet = self.build_syn_packet(buf, ctx)?;
                self.send_packet(&packet, ctx)?;
                Ok(buf.len())
            }
            StreamState::Open => {
                let packet = self.build_data_packet(buf);
                self.send_packet(&packet, ctx)?;
                Ok(buf.len())
            }
        }
    }

    /// Idempotent close; emits a single signed FIN from the open state
    pub(crate) fn close(&mut self, ctx: &mut SendContext) -> Result<()> {
        match self.state {
            StreamState::Closed => Ok(()),
            StreamState::Init => {
                self.transition_closed();
                Ok(())
            }
            StreamState::Open => {
                let packet = self.build_fin_packet(ctx)?;
                self.transition_closed();
                self.send_packet(&packet, ctx)?;
                debug!("FIN sent on stream {}", self.recv_stream_id);
                Ok(())
            }
        }
    }

    /// Drain delivered payload into `buf`, freeing fully consumed packets.
    /// Non-blocking; returns the number of bytes copied.
    pub(crate) fn concatenate_packets(&mut self, buf: &mut [u8]) -> usize {
        let mut pos = 0;
        while pos < buf.len() {
            let Some(packet) = self.receive_queue.front_mut() else {
                break;
            };
            let remaining = packet.remaining();
            let n = remaining.len().min(buf.len() - pos);
            buf[pos..pos + n].copy_from_slice(&remaining[..n]);
            pos += n;
            packet.advance(n);
            if packet.remaining().is_empty() {
                self.receive_queue.pop_front();
            }
        }
        pos
    }

    fn transition_closed(&mut self) {
        self.state = StreamState::Closed;
        self.shared.closed.store(true, Ordering::Release);
        self.shared.read_notify.notify_waiters();
    }

    fn next_seqn(&mut self) -> u32 {
        let seqn = self.sequence_number;
        self.sequence_number += 1;
        seqn
    }

    fn put_header(&self, buf: &mut BytesMut, seqn: u32) {
        buf.put_u32(self.send_stream_id);
        buf.put_u32(self.recv_stream_id);
        buf.put_u32(seqn);
        buf.put_u32(self.last_received_sequence_number);
        buf.put_u8(0); // NACK count
        buf.put_u8(0); // resend delay
    }

    fn build_syn_packet(&mut self, payload: &[u8], ctx: &SendContext) -> Result<Vec<u8>> {
        let options_size = IDENTITY_SIZE + 2 + SIGNATURE_SIZE;
        let mut buf = BytesMut::with_capacity(MIN_HEADER_SIZE + options_size + payload.len());
        let seqn = self.next_seqn();
        self.put_header(&mut buf, seqn);
        buf.put_u16(
            FLAG_SYNCHRONIZE
                | FLAG_FROM_INCLUDED
                | FLAG_SIGNATURE_INCLUDED
                | FLAG_MAX_PACKET_SIZE_INCLUDED
                | FLAG_NO_ACK,
        );
        buf.put_u16(options_size as u16);
        buf.put_slice(ctx.keys.identity().as_bytes());
        buf.put_u16(STREAMING_MTU);
        let signature_at = buf.len();
        buf.put_slice(&[0u8; SIGNATURE_SIZE]);
        buf.put_slice(payload);

        // sign the finished packet over the zeroed signature region
        let mut packet = buf.to_vec();
        let signature = ctx.keys.sign(&packet)?;
        packet[signature_at..signature_at + SIGNATURE_SIZE].copy_from_slice(&signature);
        Ok(packet)
    }

    fn build_data_packet(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MIN_HEADER_SIZE + payload.len());
        let seqn = self.next_seqn();
        self.put_header(&mut buf, seqn);
        buf.put_u16(0); // no flags
        buf.put_u16(0); // no options
        buf.put_slice(payload);
        buf.to_vec()
    }

    fn build_fin_packet(&mut self, ctx: &SendContext) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(MIN_HEADER_SIZE + SIGNATURE_SIZE);
        let seqn = self.next_seqn();
        self.put_header(&mut buf, seqn);
        buf.put_u16(FLAG_CLOSE | FLAG_SIGNATURE_INCLUDED);
        buf.put_u16(SIGNATURE_SIZE as u16);
        let signature_at = buf.len();
        buf.put_slice(&[0u8; SIGNATURE_SIZE]);

        let mut packet = buf.to_vec();
        let signature = ctx.keys.sign(&packet)?;
        packet[signature_at..signature_at + SIGNATURE_SIZE].copy_from_slice(&signature);
        Ok(packet)
    }

    fn send_quick_ack(&mut self, ctx: &mut SendContext) {
        let mut buf = BytesMut::with_capacity(MIN_HEADER_SIZE);
        self.put_header(&mut buf, 0); // plain ACK, no sequence consumed
        buf.put_u16(0); // no flags
        buf.put_u16(0); // no options
        if self.send_packet(&buf, ctx).is_ok() {
            trace!(
                "quick ACK sent, ack_through={}",
                self.last_received_sequence_number
            );
        }
    }

    /// Wrap one encoded packet and hand it to an outbound tunnel
    fn send_packet(&mut self, packet: &[u8], ctx: &mut SendContext) -> Result<()> {
        if self.remote_lease_set.is_none() {
            self.update_current_remote_lease(ctx);
        }
        let Some(remote) = self.remote_lease_set.clone() else {
            warn!(
                "cannot send on stream {}: missing remote lease set",
                self.recv_stream_id
            );
            return Err(Error::MissingRemoteLeaseSet);
        };

        let piggyback = ctx.piggyback.take();
        if piggyback.is_some() {
            self.lease_set_updated = false;
        }

        let message = create_data_message(packet)?;
        let wrapped = ctx.garlic.wrap(&remote, message, piggyback);

        let now = now_ms();
        if self
            .current_remote_lease
            .as_ref()
            .map_or(true, |l| l.is_expired(now))
        {
            self.update_current_remote_lease(ctx);
        }
        let Some(lease) = self
            .current_remote_lease
            .clone()
            .filter(|l| !l.is_expired(now))
        else {
            warn!("all leases expired for stream {}", self.recv_stream_id);
            return Err(Error::ExpiredLeases);
        };

        let Some(tunnel) = ctx.pool.next_outbound_tunnel() else {
            warn!("no outbound tunnels in the pool");
            return Err(Error::NoOutboundTunnel);
        };
        tunnel.send_tunnel_data(&lease.tunnel_gateway, lease.tunnel_id, wrapped);
        Ok(())
    }

    /// Re-resolve the remote lease set if unbound, then choose a lease.
    ///
    /// Prefers a lease other than the current one when an alternative
    /// exists; with none viable the stream has no path until rediscovery.
    fn update_current_remote_lease(&mut self, ctx: &SendContext) {
        if self.remote_lease_set.is_none() {
            if let Some(identity) = &self.remote_identity {
                let hash = identity.hash();
                self.remote_lease_set = ctx.lease_sets.find_lease_set(&hash);
                if self.remote_lease_set.is_none() {
                    debug!("lease set {} not found", hash);
                }
            }
        }
        self.pick_remote_lease();
    }

    fn pick_remote_lease(&mut self) {
        let Some(remote) = &self.remote_lease_set else {
            self.current_remote_lease = None;
            return;
        };
        let now = now_ms();
        let mut candidates = remote.non_expired_leases(now);
        if candidates.len() > 1 {
            if let Some(current) = &self.current_remote_lease {
                let others: Vec<Lease> = candidates
                    .iter()
                    .filter(|l| *l != current)
                    .cloned()
                    .collect();
                if !others.is_empty() {
                    candidates = others;
                }
            }
        }
        self.current_remote_lease = if candidates.is_empty() {
            None
        } else {
            let i = rand::thread_rng().gen_range(0..candidates.len());
            Some(candidates.swap_remove(i))
        };
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // wake any reader blocked on this stream
        self.shared.closed.store(true, Ordering::Release);
        self.shared.read_notify.notify_waiters();
    }
}

/// Application-facing handle to a loop-owned stream.
///
/// Cheap to clone; every method posts work onto the dispatch loop, so the
/// caller never touches stream state directly.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    destination: IdentHash,
    recv_stream_id: u32,
    events: mpsc::UnboundedSender<Event>,
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    pub(crate) fn new(
        destination: IdentHash,
        recv_stream_id: u32,
        events: mpsc::UnboundedSender<Event>,
        shared: Arc<StreamShared>,
    ) -> Self {
        Self {
            destination,
            recv_stream_id,
            events,
            shared,
        }
    }

    /// The stream's local (receive) id
    pub fn id(&self) -> u32 {
        self.recv_stream_id
    }

    /// Hash of the owning local destination
    pub fn destination(&self) -> IdentHash {
        self.destination
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Schedule `buf` for transmission as a single packet and return the
    /// number of bytes accepted. Transmission failures surface in the logs,
    /// not here. The timeout is advisory; this layer does not retransmit.
    pub fn send(&self, buf: &[u8], _timeout_ms: u64) -> Result<usize> {
        if buf.len() > STREAMING_MTU as usize {
            return Err(Error::PacketTooLarge(buf.len(), STREAMING_MTU as usize));
        }
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        self.events
            .send(Event::Send {
                destination: self.destination,
                stream: self.recv_stream_id,
                data: Bytes::copy_from_slice(buf),
            })
            .map_err(|_| Error::Stopped)?;
        Ok(buf.len())
    }

    /// Wait for in-order payload and copy it into `buf`.
    ///
    /// Returns `Ok(0)` once the stream is closed and drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.shared.read_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (reply, rx) = oneshot::channel();
            self.events
                .send(Event::Drain {
                    destination: self.destination,
                    stream: self.recv_stream_id,
                    max: buf.len(),
                    reply,
                })
                .map_err(|_| Error::Stopped)?;
            let data = rx.await.map_err(|_| Error::Stopped)?;
            if !data.is_empty() {
                buf[..data.len()].copy_from_slice(&data);
                return Ok(data.len());
            }
            if self.is_closed() {
                return Ok(0);
            }
            notified.as_mut().await;
        }
    }

    /// [`read`](Self::read) bounded by a deadline
    pub async fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        tokio::time::timeout(timeout, self.read(buf))
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Schedule a graceful close (signed FIN); idempotent
    pub fn close(&self) -> Result<()> {
        self.events
            .send(Event::Close {
                destination: self.destination,
                stream: self.recv_stream_id,
            })
            .map_err(|_| Error::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_message::parse_data_message;
    use crate::identity::IDENT_HASH_SIZE;
    use std::sync::{Mutex, OnceLock};

    type Sent = Arc<Mutex<Vec<(IdentHash, u32, Bytes)>>>;

    struct CaptureTunnel {
        sent: Sent,
    }

    impl TunnelPool for CaptureTunnel {
        fn next_outbound_tunnel(&self) -> Option<Arc<dyn crate::transport::OutboundTunnel>> {
            Some(Arc::new(CaptureTunnel {
                sent: self.sent.clone(),
            }))
        }

        fn inbound_leases(&self) -> Vec<Lease> {
            Vec::new()
        }
    }

    impl crate::transport::OutboundTunnel for CaptureTunnel {
        fn send_tunnel_data(&self, gateway: &IdentHash, tunnel_id: u32, message: Bytes) {
            self.sent.lock().unwrap().push((*gateway, tunnel_id, message));
        }
    }

    struct NullGarlic;

    impl GarlicRouter for NullGarlic {
        fn wrap(&self, _remote: &LeaseSet, message: Bytes, _lease_set: Option<Bytes>) -> Bytes {
            message
        }
    }

    struct EmptyStore;

    impl LeaseSetStore for EmptyStore {
        fn find_lease_set(&self, _ident: &IdentHash) -> Option<Arc<LeaseSet>> {
            None
        }
    }

    fn test_keys() -> Arc<DestinationKeys> {
        static KEYS: OnceLock<Arc<DestinationKeys>> = OnceLock::new();
        KEYS.get_or_init(|| Arc::new(DestinationKeys::generate().unwrap()))
            .clone()
    }

    fn test_ctx(sent: &Sent) -> SendContext {
        SendContext {
            keys: test_keys(),
            lease_sets: Arc::new(EmptyStore),
            garlic: Arc::new(NullGarlic),
            pool: Arc::new(CaptureTunnel { sent: sent.clone() }),
            piggyback: None,
        }
    }

    fn remote_lease_set(count: usize) -> Arc<LeaseSet> {
        let leases = (0..count)
            .map(|i| Lease {
                tunnel_gateway: [i as u8 + 1; IDENT_HASH_SIZE].into(),
                tunnel_id: i as u32 + 1,
                end_date: now_ms() + 600_000,
            })
            .collect();
        Arc::new(LeaseSet::new([0xEE; IDENT_HASH_SIZE].into(), leases))
    }

    fn inbound_packet(recv_id: u32, seqn: u32, flags: u16, payload: &[u8]) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u32(0); // send stream id (as seen by us)
        buf.put_u32(recv_id); // peer's id, learned as our send id
        buf.put_u32(seqn);
        buf.put_u32(0);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u16(flags);
        buf.put_u16(0);
        buf.put_slice(payload);
        Packet::parse(buf.to_vec()).unwrap()
    }

    /// Decode a captured wire message back into a stream packet
    fn sent_packet(message: &Bytes) -> Packet {
        parse_data_message(message).unwrap()
    }

    fn open_incoming_stream() -> Stream {
        let mut stream = Stream::new_incoming(5);
        stream.remote_lease_set = Some(remote_lease_set(2));
        stream.pick_remote_lease();
        stream
    }

    #[test]
    fn test_first_send_emits_signed_syn() {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&sent);
        let mut stream = Stream::new_outgoing(77, remote_lease_set(1));

        let n = stream.send(b"hi", &mut ctx).unwrap();
        assert_eq!(n, 2);
        assert_eq!(stream.state(), StreamState::Open);

        let messages = sent.lock().unwrap();
        assert_eq!(messages.len(), 1);
        let packet = sent_packet(&messages[0].2);

        assert_eq!(packet.send_stream_id(), 0);
        assert_eq!(packet.recv_stream_id(), 77);
        assert_eq!(packet.seqn(), 0);
        assert_eq!(
            packet.flags(),
            FLAG_SYNCHRONIZE
                | FLAG_FROM_INCLUDED
                | FLAG_SIGNATURE_INCLUDED
                | FLAG_MAX_PACKET_SIZE_INCLUDED
                | FLAG_NO_ACK
        );

        // options in canonical order: identity, MTU, signature
        let options = packet.option_data();
        assert_eq!(options.len(), IDENTITY_SIZE + 2 + SIGNATURE_SIZE);
        assert_eq!(&options[..IDENTITY_SIZE], test_keys().identity().as_bytes());
        assert_eq!(
            u16::from_be_bytes([options[IDENTITY_SIZE], options[IDENTITY_SIZE + 1]]),
            STREAMING_MTU
        );
        assert_ne!(&options[IDENTITY_SIZE + 2..], &[0u8; SIGNATURE_SIZE]);
        assert_eq!(packet.payload(), b"hi");
    }

    #[test]
    fn test_follow_on_send_has_no_options() {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&sent);
        let mut stream = Stream::new_outgoing(77, remote_lease_set(1));

        stream.send(b"first", &mut ctx).unwrap();
        stream.send(b"second", &mut ctx).unwrap();

        let messages = sent.lock().unwrap();
        let packet = sent_packet(&messages[1].2);
        assert_eq!(packet.seqn(), 1);
        assert_eq!(packet.flags(), 0);
        assert_eq!(packet.options_size(), 0);
        assert_eq!(packet.payload(), b"second");
    }

    #[test]
    fn test_reorder_delivers_in_sequence_with_three_acks() {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&sent);
        let mut stream = open_incoming_stream();

        for seqn in [1u32, 3, 2, 5, 4] {
            let payload = seqn.to_string();
            stream.handle_next_packet(
                inbound_packet(91, seqn, 0, payload.as_bytes()),
                &mut ctx,
            );
        }

        assert_eq!(stream.send_stream_id(), 91);
        assert_eq!(stream.last_received_sequence_number, 5);
        assert!(stream.reorder_buffer.is_empty());

        let mut buf = [0u8; 16];
        let n = stream.concatenate_packets(&mut buf);
        assert_eq!(&buf[..n], b"12345");

        // quick-ACKs after 1, after 2→3, after 4→5
        let messages = sent.lock().unwrap();
        let acks: Vec<u32> = messages
            .iter()
            .map(|(_, _, m)| sent_packet(m))
            .filter(|p| p.seqn() == 0 && !p.is_syn())
            .map(|p| p.ack_through())
            .collect();
        assert_eq!(acks, vec![1, 3, 5]);
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn test_missing_predecessor_buffers_without_ack() {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&sent);
        let mut stream = open_incoming_stream();

        stream.handle_next_packet(inbound_packet(91, 2, 0, b"later"), &mut ctx);

        assert_eq!(stream.last_received_sequence_number, 0);
        assert_eq!(stream.reorder_buffer.len(), 1);
        assert!(stream.receive_queue.is_empty());
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_reacks_and_switches_lease() {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&sent);
        let mut stream = open_incoming_stream();

        for seqn in 1..=3u32 {
            stream.handle_next_packet(inbound_packet(91, seqn, 0, b"x"), &mut ctx);
        }
        let lease_before = stream.current_remote_lease.clone().unwrap();
        sent.lock().unwrap().clear();

        stream.handle_next_packet(inbound_packet(91, 2, 0, b"x"), &mut ctx);

        // no payload re-delivered
        assert_eq!(stream.last_received_sequence_number, 3);
        assert_eq!(stream.receive_queue.len(), 3);

        // one re-ACK for the last contiguous seqn
        let messages = sent.lock().unwrap();
        assert_eq!(messages.len(), 1);
        let ack = sent_packet(&messages[0].2);
        assert_eq!(ack.seqn(), 0);
        assert_eq!(ack.ack_through(), 3);

        // with two leases available the current one must change
        let lease_after = stream.current_remote_lease.clone().unwrap();
        assert_ne!(lease_before, lease_after);
    }

    #[test]
    fn test_plain_ack_is_dropped() {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&sent);
        let mut stream = open_incoming_stream();

        stream.handle_next_packet(inbound_packet(91, 0, 0, b""), &mut ctx);

        assert_eq!(stream.last_received_sequence_number, 0);
        assert!(stream.receive_queue.is_empty());
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_peer_close_delivers_payload_then_closes() {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&sent);
        let mut stream = open_incoming_stream();

        stream.handle_next_packet(inbound_packet(91, 1, FLAG_CLOSE, b"bye"), &mut ctx);

        assert_eq!(stream.state(), StreamState::Closed);
        let mut buf = [0u8; 8];
        let n = stream.concatenate_packets(&mut buf);
        assert_eq!(&buf[..n], b"bye");

        // the CLOSE is acknowledged exactly once
        let messages = sent.lock().unwrap();
        assert_eq!(messages.len(), 1);
        let ack = sent_packet(&messages[0].2);
        assert_eq!(ack.seqn(), 0);
        assert_eq!(ack.ack_through(), 1);

        // no further emission from a closed stream
        drop(messages);
        assert!(matches!(
            stream.send(b"more", &mut ctx),
            Err(Error::StreamClosed)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&sent);
        let mut stream = Stream::new_outgoing(77, remote_lease_set(1));

        stream.send(b"data", &mut ctx).unwrap();
        sent.lock().unwrap().clear();

        stream.close(&mut ctx).unwrap();
        stream.close(&mut ctx).unwrap();

        let messages = sent.lock().unwrap();
        assert_eq!(messages.len(), 1);
        let fin = sent_packet(&messages[0].2);
        assert_eq!(fin.flags(), FLAG_CLOSE | FLAG_SIGNATURE_INCLUDED);
        assert_eq!(fin.options_size(), SIGNATURE_SIZE);
        assert_eq!(fin.seqn(), 1);
        assert_ne!(fin.option_data(), &[0u8; SIGNATURE_SIZE]);
    }

    #[test]
    fn test_send_fails_when_all_leases_expired() {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&sent);
        let expired = Arc::new(LeaseSet::new(
            [0xEE; IDENT_HASH_SIZE].into(),
            vec![Lease {
                tunnel_gateway: [1; IDENT_HASH_SIZE].into(),
                tunnel_id: 1,
                end_date: now_ms().saturating_sub(1_000),
            }],
        ));
        let mut stream = Stream::new_outgoing(77, expired);

        assert!(matches!(
            stream.send(b"hi", &mut ctx),
            Err(Error::ExpiredLeases)
        ));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_send_fails_without_remote_lease_set() {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&sent);
        let mut stream = Stream::new_incoming(5);

        assert!(matches!(
            stream.send(b"hi", &mut ctx),
            Err(Error::MissingRemoteLeaseSet)
        ));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_piggyback_consumed_on_first_packet() {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&sent);
        ctx.piggyback = Some(Bytes::from_static(b"lease set bytes"));
        let mut stream = Stream::new_outgoing(77, remote_lease_set(1));

        assert!(stream.lease_set_updated());
        stream.send(b"hi", &mut ctx).unwrap();
        assert!(!stream.lease_set_updated());
        assert!(ctx.piggyback.is_none());
    }
}
