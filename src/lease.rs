use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::identity::{IdentHash, IDENT_HASH_SIZE, SIGNATURE_SIZE};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One inbound tunnel advertisement: gateway router, tunnel id, expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub tunnel_gateway: IdentHash,
    pub tunnel_id: u32,
    /// Milliseconds since epoch; the lease is valid while `now < end_date`
    pub end_date: u64,
}

impl Lease {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.end_date
    }
}

/// A destination's signed advertisement of its inbound tunnels
#[derive(Debug, Clone)]
pub struct LeaseSet {
    ident_hash: IdentHash,
    leases: Vec<Lease>,
    signature: [u8; SIGNATURE_SIZE],
}

impl LeaseSet {
    pub fn new(ident_hash: IdentHash, leases: Vec<Lease>) -> Self {
        Self {
            ident_hash,
            leases,
            signature: [0u8; SIGNATURE_SIZE],
        }
    }

    /// Owning destination's address
    pub fn ident_hash(&self) -> IdentHash {
        self.ident_hash
    }

    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    pub fn non_expired_leases(&self, now: u64) -> Vec<Lease> {
        self.leases
            .iter()
            .filter(|l| !l.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn has_expired_leases(&self, now: u64) -> bool {
        self.leases.iter().any(|l| l.is_expired(now))
    }

    /// The bytes covered by the signature
    pub fn signable_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(self.ident_hash.as_bytes());
        buf.put_u8(self.leases.len() as u8);
        for lease in &self.leases {
            buf.put_slice(lease.tunnel_gateway.as_bytes());
            buf.put_u32(lease.tunnel_id);
            buf.put_u64(lease.end_date);
        }
        buf.freeze()
    }

    pub fn set_signature(&mut self, signature: [u8; SIGNATURE_SIZE]) {
        self.signature = signature;
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.signature
    }

    /// Serialized form, as piggybacked alongside data messages
    pub fn to_bytes(&self) -> Bytes {
        let body = self.signable_bytes();
        let mut buf = BytesMut::with_capacity(body.len() + SIGNATURE_SIZE);
        buf.put_slice(&body);
        buf.put_slice(&self.signature);
        buf.freeze()
    }

    /// Parse a serialized lease set. The signature is carried, not checked;
    /// verification belongs to the directory layer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut cursor = buf;
        if cursor.remaining() < IDENT_HASH_SIZE + 1 {
            return Err(Error::Protocol("lease set truncated".into()));
        }
        let mut hash = [0u8; IDENT_HASH_SIZE];
        cursor.copy_to_slice(&mut hash);
        let count = cursor.get_u8() as usize;

        let mut leases = Vec::with_capacity(count);
        for _ in 0..count {
            if cursor.remaining() < IDENT_HASH_SIZE + 4 + 8 {
                return Err(Error::Protocol("lease set truncated".into()));
            }
            let mut gateway = [0u8; IDENT_HASH_SIZE];
            cursor.copy_to_slice(&mut gateway);
            leases.push(Lease {
                tunnel_gateway: gateway.into(),
                tunnel_id: cursor.get_u32(),
                end_date: cursor.get_u64(),
            });
        }

        if cursor.remaining() < SIGNATURE_SIZE {
            return Err(Error::Protocol("lease set signature missing".into()));
        }
        let mut signature = [0u8; SIGNATURE_SIZE];
        cursor.copy_to_slice(&mut signature);

        Ok(Self {
            ident_hash: hash.into(),
            leases,
            signature,
        })
    }
}
