//! Mesh identity tokens.
//!
//! A token is a node's long-lived cryptographic identity. The 64-byte public
//! key is the X25519 agreement key followed by the Ed25519 verifying key, and
//! the 32-byte identity is the SHA-256 digest of that public key. The private
//! key is the 32-byte Ed25519 seed; the X25519 secret is derived from it.
//!
//! Only identity and public key are ever packed onto the wire.

use crate::error::PeerError;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use mesh_wire::{PackReader, PackWriter, WireError};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey as AgreementKey, StaticSecret};

/// Length of a token identity
pub const IDENTITY_LENGTH: usize = 32;
/// Length of a token public key
pub const PUBLIC_KEY_LENGTH: usize = 64;
/// Length of a token private key
pub const PRIVATE_KEY_LENGTH: usize = 32;
/// Length of a signature
pub const SIGNATURE_LENGTH: usize = 64;
/// Length of a packed token
pub const PACKED_TOKEN_LENGTH: usize = IDENTITY_LENGTH + PUBLIC_KEY_LENGTH;

const AGREEMENT_DOMAIN: &[u8] = b"mesh-token/x25519";

fn identity_of(public_key: &[u8; PUBLIC_KEY_LENGTH]) -> [u8; IDENTITY_LENGTH] {
    Sha256::digest(public_key).into()
}

fn agreement_secret(seed: &[u8; PRIVATE_KEY_LENGTH]) -> StaticSecret {
    let digest: [u8; 32] = Sha256::new()
        .chain_update(AGREEMENT_DOMAIN)
        .chain_update(seed)
        .finalize()
        .into();
    StaticSecret::from(digest)
}

/// Keypair-backed node identity
#[derive(Clone)]
pub struct MeshToken {
    identity: [u8; IDENTITY_LENGTH],
    public_key: [u8; PUBLIC_KEY_LENGTH],
    private_key: Option<[u8; PRIVATE_KEY_LENGTH]>,
}

impl MeshToken {
    /// Generate a fresh keypair from the OS RNG
    pub fn generate() -> Self {
        let mut seed = [0u8; PRIVATE_KEY_LENGTH];
        OsRng.fill_bytes(&mut seed);
        Self::from_private_key(seed)
    }

    /// Rebuild a full token from its private key
    pub fn from_private_key(seed: [u8; PRIVATE_KEY_LENGTH]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let agreement = AgreementKey::from(&agreement_secret(&seed));

        let mut public_key = [0u8; PUBLIC_KEY_LENGTH];
        public_key[..32].copy_from_slice(agreement.as_bytes());
        public_key[32..].copy_from_slice(signing.verifying_key().as_bytes());

        Self {
            identity: identity_of(&public_key),
            public_key,
            private_key: Some(seed),
        }
    }

    /// Token from its public parts, as received from a peer
    pub fn from_parts(identity: [u8; IDENTITY_LENGTH], public_key: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self {
            identity,
            public_key,
            private_key: None,
        }
    }

    /// Identity hash
    pub fn identity(&self) -> &[u8; IDENTITY_LENGTH] {
        &self.identity
    }

    /// Full 64-byte public key
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.public_key
    }

    /// X25519 half of the public key
    pub fn agreement_key(&self) -> &[u8] {
        &self.public_key[..32]
    }

    fn verifying_key(&self) -> Option<VerifyingKey> {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.public_key[32..]);
        VerifyingKey::from_bytes(&bytes).ok()
    }

    /// Whether this token can sign
    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// Identity matches the public key and the verifying key is well formed
    pub fn is_valid(&self) -> bool {
        self.identity == identity_of(&self.public_key) && self.verifying_key().is_some()
    }

    /// Sign `payload` with the private key
    pub fn sign(&self, payload: &[u8]) -> Result<[u8; SIGNATURE_LENGTH], PeerError> {
        let seed = self.private_key.as_ref().ok_or(PeerError::NoPrivateKey)?;
        Ok(SigningKey::from_bytes(seed).sign(payload).to_bytes())
    }

    /// Check a signature made by this token's private key
    pub fn verify(&self, signature: &[u8], payload: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        match self.verifying_key() {
            Some(key) => key.verify_strict(payload, &signature).is_ok(),
            None => false,
        }
    }

    /// Copy without the private key
    pub fn public_only(&self) -> Self {
        Self::from_parts(self.identity, self.public_key)
    }

    /// Packed form: identity followed by public key
    pub fn to_bytes(&self) -> [u8; PACKED_TOKEN_LENGTH] {
        let mut out = [0u8; PACKED_TOKEN_LENGTH];
        out[..IDENTITY_LENGTH].copy_from_slice(&self.identity);
        out[IDENTITY_LENGTH..].copy_from_slice(&self.public_key);
        out
    }

    /// Write identity and public key
    pub fn pack(&self, writer: &mut PackWriter) {
        writer.put_fixed(&self.identity);
        writer.put_fixed(&self.public_key);
    }

    /// Read identity and public key
    pub fn unpack(reader: &mut PackReader) -> Result<Self, WireError> {
        let identity = reader.get_array::<IDENTITY_LENGTH>()?;
        let public_key = reader.get_array::<PUBLIC_KEY_LENGTH>()?;
        Ok(Self::from_parts(identity, public_key))
    }

    /// Short hex prefix of the identity for logs
    pub fn short_id(&self) -> String {
        hex::encode(&self.identity[..6])
    }
}

impl PartialEq for MeshToken {
    fn eq(&self, other: &Self) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.identity == other.identity
            && self.public_key == other.public_key
    }
}

impl fmt::Debug for MeshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshToken")
            .field("identity", &hex::encode(self.identity))
            .field("private", &self.private_key.is_some())
            .finish()
    }
}

impl fmt::Display for MeshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::PackConfig;

    #[test]
    fn test_generated_token_is_valid() {
        let token = MeshToken::generate();
        assert!(token.is_valid());
        assert!(token.has_private_key());
        assert_eq!(token.identity(), &identity_of(token.public_key()));
        assert_ne!(MeshToken::generate(), token);
    }

    #[test]
    fn test_private_key_is_deterministic() {
        let seed = [7u8; PRIVATE_KEY_LENGTH];
        let a = MeshToken::from_private_key(seed);
        let b = MeshToken::from_private_key(seed);
        assert_eq!(a, b);
        assert_eq!(a.agreement_key(), b.agreement_key());
    }

    #[test]
    fn test_sign_and_verify() {
        let token = MeshToken::generate();
        let signature = token.sign(b"challenge").unwrap();

        assert!(token.verify(&signature, b"challenge"));
        assert!(!token.verify(&signature, b"other"));
        assert!(!token.verify(&signature[..63], b"challenge"));
        assert!(!MeshToken::generate().verify(&signature, b"challenge"));

        let public = token.public_only();
        assert!(public.verify(&signature, b"challenge"));
        assert!(matches!(public.sign(b"x"), Err(PeerError::NoPrivateKey)));
    }

    #[test]
    fn test_pack_omits_private_key() {
        let token = MeshToken::generate();
        let mut writer = PackWriter::new(PackConfig::default());
        token.pack(&mut writer);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), PACKED_TOKEN_LENGTH);
        assert_eq!(&bytes[..], &token.to_bytes()[..]);

        let unpacked = MeshToken::unpack(&mut PackReader::new(bytes, PackConfig::default())).unwrap();
        assert!(!unpacked.has_private_key());
        assert_eq!(unpacked, token);
    }

    #[test]
    fn test_invalid_tokens_never_equal() {
        let token = MeshToken::generate();
        let forged = MeshToken::from_parts([0u8; IDENTITY_LENGTH], *token.public_key());
        assert!(!forged.is_valid());
        assert_ne!(forged, token);
        assert_ne!(forged.clone(), forged);
    }

    #[test]
    fn test_debug_hides_private_key() {
        let token = MeshToken::from_private_key([9u8; PRIVATE_KEY_LENGTH]);
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains(&hex::encode([9u8; PRIVATE_KEY_LENGTH])));
        assert!(rendered.contains(&hex::encode(token.identity())));
    }
}
