use std::fmt;
use std::fs;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use dsa::signature::DigestSigner;
use dsa::{Components, KeySize, SigningKey, VerifyingKey};
use num_bigint_dig::BigUint;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// DH public key size inside the identity (2048-bit group element)
pub const ENCRYPTION_KEY_SIZE: usize = 256;

/// DSA public key size inside the identity (1024-bit y)
pub const SIGNING_KEY_SIZE: usize = 128;

/// Trailing identity padding
pub const IDENTITY_PADDING: usize = 3;

/// Canonical identity serialization size
pub const IDENTITY_SIZE: usize = ENCRYPTION_KEY_SIZE + SIGNING_KEY_SIZE + IDENTITY_PADDING;

/// DSA signature size (two 160-bit components)
pub const SIGNATURE_SIZE: usize = 40;

/// Identity hash size (SHA-256)
pub const IDENT_HASH_SIZE: usize = 32;

/// 2048-bit MODP group modulus (RFC 3526, group 14); the generator is 2.
const DH_PRIME_HEX: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
83655D23DCA3AD961C62F356208552BB9ED529077096966D\
670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
15728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// 32-byte address of a destination: SHA-256 of its identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct IdentHash([u8; IDENT_HASH_SIZE]);

impl IdentHash {
    pub fn as_bytes(&self) -> &[u8; IDENT_HASH_SIZE] {
        &self.0
    }
}

impl From<[u8; IDENT_HASH_SIZE]> for IdentHash {
    fn from(bytes: [u8; IDENT_HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for IdentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for IdentHash {
    /// Abbreviated hex form for logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentHash({self})")
    }
}

/// A destination's public identity: DH public key + DSA public key + padding,
/// 387 bytes in canonical serialization
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    bytes: [u8; IDENTITY_SIZE],
}

impl Identity {
    pub fn from_parts(
        encryption_key: &[u8; ENCRYPTION_KEY_SIZE],
        signing_key: &[u8; SIGNING_KEY_SIZE],
    ) -> Self {
        let mut bytes = [0u8; IDENTITY_SIZE];
        bytes[..ENCRYPTION_KEY_SIZE].copy_from_slice(encryption_key);
        bytes[ENCRYPTION_KEY_SIZE..ENCRYPTION_KEY_SIZE + SIGNING_KEY_SIZE]
            .copy_from_slice(signing_key);
        Self { bytes }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < IDENTITY_SIZE {
            return Err(Error::Protocol(format!(
                "identity truncated: {} bytes (expected {})",
                buf.len(),
                IDENTITY_SIZE
            )));
        }
        let mut bytes = [0u8; IDENTITY_SIZE];
        bytes.copy_from_slice(&buf[..IDENTITY_SIZE]);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encryption_key(&self) -> &[u8] {
        &self.bytes[..ENCRYPTION_KEY_SIZE]
    }

    pub fn signing_key(&self) -> &[u8] {
        &self.bytes[ENCRYPTION_KEY_SIZE..ENCRYPTION_KEY_SIZE + SIGNING_KEY_SIZE]
    }

    /// The destination's address
    pub fn hash(&self) -> IdentHash {
        let mut hasher = Sha256::new();
        hasher.update(self.bytes);
        IdentHash(hasher.finalize().into())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.hash())
    }
}

/// Full key material of a local destination
#[derive(Clone)]
pub struct DestinationKeys {
    identity: Identity,
    ident_hash: IdentHash,
    signing_key: SigningKey,
    // DH exponent; never persisted, regenerated on load
    encryption_secret: Vec<u8>,
}

impl DestinationKeys {
    /// Generate a fresh destination keypair
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        #[allow(deprecated)]
        let components = Components::generate(&mut rng, KeySize::DSA_1024_160);
        let signing_key = SigningKey::generate(&mut rng, components);
        let (encryption_key, encryption_secret) = generate_dh_keypair(&mut rng)?;
        Self::assemble(signing_key, encryption_key, encryption_secret)
    }

    fn assemble(
        signing_key: SigningKey,
        encryption_key: [u8; ENCRYPTION_KEY_SIZE],
        encryption_secret: Vec<u8>,
    ) -> Result<Self> {
        let mut signing_public = [0u8; SIGNING_KEY_SIZE];
        write_padded_be(&mut signing_public, signing_key.verifying_key().y())?;
        let identity = Identity::from_parts(&encryption_key, &signing_public);
        let ident_hash = identity.hash();
        Ok(Self {
            identity,
            ident_hash,
            signing_key,
            encryption_secret,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.ident_hash
    }

    /// DH private exponent, for the garlic layer's key agreement
    pub fn encryption_secret(&self) -> &[u8] {
        &self.encryption_secret
    }

    /// DSA-SHA1 signature over `data`, as the fixed-size r||s wire form
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_SIZE]> {
        let digest = Sha1::new_with_prefix(data);
        let sig: dsa::Signature = self
            .signing_key
            .try_sign_digest(digest)
            .map_err(|e| Error::Crypto(format!("DSA signing failed: {e}")))?;
        let mut out = [0u8; SIGNATURE_SIZE];
        write_padded_be(&mut out[..SIGNATURE_SIZE / 2], sig.r())?;
        write_padded_be(&mut out[SIGNATURE_SIZE / 2..], sig.s())?;
        Ok(out)
    }

    /// Persist to a destination file: identity followed by the DSA integers
    /// (p, q, g, y, x) as length-prefixed big-endian values.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_slice(self.identity.as_bytes());
        let verifying = self.signing_key.verifying_key();
        let components = verifying.components();
        for value in [
            components.p(),
            components.q(),
            components.g(),
            verifying.y(),
            self.signing_key.x(),
        ] {
            let bytes = value.to_bytes_be();
            buf.put_u16(bytes.len() as u16);
            buf.put_slice(&bytes);
        }
        fs::write(path, &buf)?;
        Ok(())
    }

    /// Load a destination file written by [`DestinationKeys::save`].
    ///
    /// The DH keypair is regenerated; only the identity and the signing key
    /// survive a restart.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        if data.len() < IDENTITY_SIZE {
            return Err(Error::Crypto(format!(
                "destination file too short: {} bytes",
                data.len()
            )));
        }
        let identity = Identity::from_bytes(&data)?;

        let mut cursor = &data[IDENTITY_SIZE..];
        let mut values = Vec::with_capacity(5);
        for _ in 0..5 {
            if cursor.remaining() < 2 {
                return Err(Error::Crypto("destination file truncated".into()));
            }
            let len = cursor.get_u16() as usize;
            if cursor.remaining() < len {
                return Err(Error::Crypto("destination file truncated".into()));
            }
            values.push(BigUint::from_bytes_be(&cursor[..len]));
            cursor.advance(len);
        }
        let x = values.pop().unwrap_or_default();
        let y = values.pop().unwrap_or_default();
        let g = values.pop().unwrap_or_default();
        let q = values.pop().unwrap_or_default();
        let p = values.pop().unwrap_or_default();

        let components = Components::from_components(p, q, g)
            .map_err(|e| Error::Crypto(format!("bad DSA parameters: {e}")))?;
        let verifying = VerifyingKey::from_components(components, y)
            .map_err(|e| Error::Crypto(format!("bad DSA public key: {e}")))?;
        let signing_key = SigningKey::from_components(verifying, x)
            .map_err(|e| Error::Crypto(format!("bad DSA private key: {e}")))?;

        let ident_hash = identity.hash();
        let (_, encryption_secret) = generate_dh_keypair(&mut rand::thread_rng())?;
        Ok(Self {
            identity,
            ident_hash,
            signing_key,
            encryption_secret,
        })
    }
}

impl fmt::Debug for DestinationKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationKeys")
            .field("ident_hash", &self.ident_hash)
            .finish_non_exhaustive()
    }
}

/// Generate a DH keypair over the MODP group: y = 2^x mod p
fn generate_dh_keypair(rng: &mut impl RngCore) -> Result<([u8; ENCRYPTION_KEY_SIZE], Vec<u8>)> {
    let p = BigUint::parse_bytes(DH_PRIME_HEX, 16)
        .ok_or_else(|| Error::Crypto("bad DH group modulus".into()))?;
    let g = BigUint::from(2u32);
    let mut secret = vec![0u8; ENCRYPTION_KEY_SIZE];
    rng.fill_bytes(&mut secret);
    let x = BigUint::from_bytes_be(&secret);
    let y = g.modpow(&x, &p);
    let mut public = [0u8; ENCRYPTION_KEY_SIZE];
    write_padded_be(&mut public, &y)?;
    Ok((public, secret))
}

/// Write `value` big-endian into `out`, left-padded with zeros
fn write_padded_be(out: &mut [u8], value: &BigUint) -> Result<()> {
    let bytes = value.to_bytes_be();
    if bytes.len() > out.len() {
        return Err(Error::Crypto(format!(
            "integer too large: {} bytes into {}",
            bytes.len(),
            out.len()
        )));
    }
    let start = out.len() - bytes.len();
    out[..start].fill(0);
    out[start..].copy_from_slice(&bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_identity_layout() {
        let identity = Identity::from_parts(&[0x11; ENCRYPTION_KEY_SIZE], &[0x22; SIGNING_KEY_SIZE]);
        assert_eq!(identity.as_bytes().len(), IDENTITY_SIZE);
        assert_eq!(identity.encryption_key(), &[0x11; ENCRYPTION_KEY_SIZE]);
        assert_eq!(identity.signing_key(), &[0x22; SIGNING_KEY_SIZE]);
        // padding stays zero
        assert_eq!(&identity.as_bytes()[IDENTITY_SIZE - IDENTITY_PADDING..], &[0u8; 3]);
    }

    #[test]
    fn test_identity_hash_is_stable() {
        let identity = Identity::from_parts(&[7; ENCRYPTION_KEY_SIZE], &[9; SIGNING_KEY_SIZE]);
        assert_eq!(identity.hash(), identity.hash());
        let other = Identity::from_parts(&[8; ENCRYPTION_KEY_SIZE], &[9; SIGNING_KEY_SIZE]);
        assert_ne!(identity.hash(), other.hash());
    }

    #[test]
    fn test_identity_from_bytes_roundtrip() {
        let identity = Identity::from_parts(&[3; ENCRYPTION_KEY_SIZE], &[4; SIGNING_KEY_SIZE]);
        let parsed = Identity::from_bytes(identity.as_bytes()).unwrap();
        assert_eq!(parsed, identity);
        assert!(Identity::from_bytes(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_generate_and_sign() {
        let keys = DestinationKeys::generate().unwrap();
        assert_eq!(keys.identity().as_bytes().len(), IDENTITY_SIZE);

        let sig = keys.sign(b"payload under test").unwrap();
        assert_eq!(sig.len(), SIGNATURE_SIZE);
        assert_ne!(sig, [0u8; SIGNATURE_SIZE]);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("local.dat");

        let keys = DestinationKeys::generate().unwrap();
        keys.save(&path).unwrap();

        let loaded = DestinationKeys::load(&path).unwrap();
        assert_eq!(loaded.ident_hash(), keys.ident_hash());
        assert_eq!(loaded.identity(), keys.identity());
        // the reconstructed signing key must still produce valid-size signatures
        let sig = loaded.sign(b"after reload").unwrap();
        assert_eq!(sig.len(), SIGNATURE_SIZE);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.dat");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(DestinationKeys::load(&path).is_err());
    }
}
