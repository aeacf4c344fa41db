//! Cryptographic capability for the CoValue engine.
//!
//! The engine never calls a primitive directly: it goes through the
//! [`CryptoProvider`] trait, shared as `Arc<dyn CryptoProvider>`. [`DalekCrypto`]
//! is the native adapter (Ed25519 signing, X25519 sealing, XChaCha20-Poly1305
//! symmetric encryption, BLAKE3 hashing). It holds no state of its own; every
//! hash state is an owned [`StreamingHash`].

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::encoding::{prefixed_blob, prefixed_bytes};
use crate::error::CoreError;

prefixed_bytes!(
    /// A 32-byte BLAKE3 digest (`hash_z…`).
    Hash,
    "hash",
    32
);

prefixed_bytes!(
    /// A 64-byte Ed25519 signature (`signature_z…`).
    Signature,
    "signature",
    64
);

prefixed_bytes!(
    /// An Ed25519 verifying key (`signer_z…`).
    SignerId,
    "signer",
    32
);

prefixed_bytes!(
    /// An X25519 public key (`sealer_z…`).
    SealerId,
    "sealer",
    32
);

prefixed_bytes!(
    /// Identifier of a symmetric read key (`key_z…`), derived from the secret.
    KeyId,
    "key",
    16
);

prefixed_bytes!(secret
    /// An Ed25519 signing key seed (`signerSecret_z…`).
    SignerSecret,
    "signerSecret",
    32
);

prefixed_bytes!(secret
    /// An X25519 static secret (`sealerSecret_z…`).
    SealerSecret,
    "sealerSecret",
    32
);

prefixed_bytes!(secret
    /// A symmetric read key (`keySecret_z…`).
    KeySecret,
    "keySecret",
    32
);

prefixed_blob!(
    /// A payload sealed for one recipient (`sealed_z…`).
    Sealed,
    "sealed"
);

prefixed_blob!(
    /// A payload encrypted under a read key (`encrypted_z…`).
    Encrypted,
    "encrypted"
);

impl Hash {
    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// The public identity of an agent: its sealer and signer keys.
///
/// Encodes as `sealer_z…/signer_z…`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    pub sealer: SealerId,
    pub signer: SignerId,
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sealer, self.signer)
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.signer.to_string();
        write!(f, "AgentId({}…)", &s[..s.len().min(16)])
    }
}

impl FromStr for AgentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sealer, signer) = s
            .split_once('/')
            .ok_or_else(|| CoreError::MalformedId(format!("not an agent id: {s}")))?;
        Ok(Self {
            sealer: sealer.parse()?,
            signer: signer.parse()?,
        })
    }
}

impl serde::Serialize for AgentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for AgentId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The secret half of an agent identity.
///
/// Encodes as `sealerSecret_z…/signerSecret_z…`.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentSecret {
    pub sealer: SealerSecret,
    pub signer: SignerSecret,
}

impl fmt::Display for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sealer, self.signer)
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentSecret(redacted)")
    }
}

impl FromStr for AgentSecret {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sealer, signer) = s
            .split_once('/')
            .ok_or_else(|| CoreError::MalformedId("not an agent secret".into()))?;
        Ok(Self {
            sealer: sealer.parse()?,
            signer: signer.parse()?,
        })
    }
}

/// Incremental BLAKE3 hash state.
///
/// `finalize` does not consume the state, so a session log can keep hashing
/// after reading the digest of its current prefix.
#[derive(Clone, Default)]
pub struct StreamingHash {
    hasher: blake3::Hasher,
}

impl StreamingHash {
    /// Start a fresh hash state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the hash.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Digest of everything fed so far.
    pub fn finalize(&self) -> Hash {
        Hash(*self.hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for StreamingHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamingHash({})", self.finalize())
    }
}

/// The cryptographic capability consumed by the engine.
pub trait CryptoProvider: Send + Sync {
    /// Generate a fresh agent secret.
    fn new_agent_secret(&self) -> AgentSecret;

    /// Derive the public agent identity from a secret.
    fn agent_id(&self, secret: &AgentSecret) -> AgentId;

    /// Sign a message.
    fn sign(&self, secret: &SignerSecret, message: &[u8]) -> Signature;

    /// Verify a signature. Malformed keys verify as `false`.
    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> bool;

    /// X25519 Diffie-Hellman.
    fn ecdh(&self, secret: &SealerSecret, public: &SealerId) -> [u8; 32];

    /// Seal a payload from one sealer to another.
    fn seal(
        &self,
        plaintext: &[u8],
        from: &SealerSecret,
        to: &SealerId,
        nonce_material: &[u8],
    ) -> Result<Sealed, CoreError>;

    /// Open a sealed payload. `None` if it was not sealed for `to`.
    fn unseal(
        &self,
        sealed: &Sealed,
        to: &SealerSecret,
        from: &SealerId,
        nonce_material: &[u8],
    ) -> Option<Vec<u8>>;

    /// Symmetric encryption under a read key.
    fn encrypt(
        &self,
        key: &KeySecret,
        plaintext: &[u8],
        nonce_material: &[u8],
    ) -> Result<Encrypted, CoreError>;

    /// Symmetric decryption. `None` on authentication failure.
    fn decrypt(&self, key: &KeySecret, ciphertext: &Encrypted, nonce_material: &[u8])
        -> Option<Vec<u8>>;

    /// BLAKE3 hash.
    fn hash(&self, bytes: &[u8]) -> Hash;

    /// BLAKE3 in key-derivation mode, domain-separated by `context`.
    fn hash_with_context(&self, context: &str, bytes: &[u8]) -> Hash;

    /// A fresh incremental hash state.
    fn stream_hash(&self) -> StreamingHash {
        StreamingHash::new()
    }

    /// Generate a fresh symmetric read key.
    fn new_key_secret(&self) -> KeySecret;

    /// The identifier of a read key.
    fn key_id(&self, key: &KeySecret) -> KeyId {
        let digest = self.hash_with_context("covalue key id v0", key.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest.0[..16]);
        KeyId(id)
    }

    /// Random bytes for uniqueness nonces and session ids.
    fn random_bytes(&self, len: usize) -> Vec<u8>;
}

/// Native crypto adapter built on the dalek crates, chacha20poly1305 and blake3.
#[derive(Debug, Clone, Copy, Default)]
pub struct DalekCrypto;

impl DalekCrypto {
    /// Create the adapter.
    pub fn new() -> Self {
        Self
    }

    fn nonce(nonce_material: &[u8]) -> XNonce {
        let digest = blake3::derive_key("covalue nonce v0", nonce_material);
        *XNonce::from_slice(&digest[..24])
    }

    fn seal_key(shared: &[u8; 32]) -> [u8; 32] {
        blake3::derive_key("covalue seal v0", shared)
    }

    fn random_32() -> [u8; 32] {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }
}

impl CryptoProvider for DalekCrypto {
    fn new_agent_secret(&self) -> AgentSecret {
        AgentSecret {
            sealer: SealerSecret(Self::random_32()),
            signer: SignerSecret(Self::random_32()),
        }
    }

    fn agent_id(&self, secret: &AgentSecret) -> AgentId {
        let signing_key = SigningKey::from_bytes(&secret.signer.0);
        let sealer = PublicKey::from(&StaticSecret::from(secret.sealer.0));
        AgentId {
            sealer: SealerId(*sealer.as_bytes()),
            signer: SignerId(signing_key.verifying_key().to_bytes()),
        }
    }

    fn sign(&self, secret: &SignerSecret, message: &[u8]) -> Signature {
        let signing_key = SigningKey::from_bytes(&secret.0);
        Signature(signing_key.sign(message).to_bytes())
    }

    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&signer.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        verifying_key.verify(message, &sig).is_ok()
    }

    fn ecdh(&self, secret: &SealerSecret, public: &SealerId) -> [u8; 32] {
        let shared = StaticSecret::from(secret.0).diffie_hellman(&PublicKey::from(public.0));
        *shared.as_bytes()
    }

    fn seal(
        &self,
        plaintext: &[u8],
        from: &SealerSecret,
        to: &SealerId,
        nonce_material: &[u8],
    ) -> Result<Sealed, CoreError> {
        let key = Self::seal_key(&self.ecdh(from, to));
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .encrypt(&Self::nonce(nonce_material), plaintext)
            .map(Sealed)
            .map_err(|e| CoreError::EncodingError(format!("seal failed: {e}")))
    }

    fn unseal(
        &self,
        sealed: &Sealed,
        to: &SealerSecret,
        from: &SealerId,
        nonce_material: &[u8],
    ) -> Option<Vec<u8>> {
        let key = Self::seal_key(&self.ecdh(to, from));
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(&Self::nonce(nonce_material), sealed.0.as_slice())
            .ok()
    }

    fn encrypt(
        &self,
        key: &KeySecret,
        plaintext: &[u8],
        nonce_material: &[u8],
    ) -> Result<Encrypted, CoreError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
        cipher
            .encrypt(&Self::nonce(nonce_material), plaintext)
            .map(Encrypted)
            .map_err(|e| CoreError::EncodingError(format!("encrypt failed: {e}")))
    }

    fn decrypt(
        &self,
        key: &KeySecret,
        ciphertext: &Encrypted,
        nonce_material: &[u8],
    ) -> Option<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
        cipher
            .decrypt(&Self::nonce(nonce_material), ciphertext.0.as_slice())
            .ok()
    }

    fn hash(&self, bytes: &[u8]) -> Hash {
        Hash(*blake3::hash(bytes).as_bytes())
    }

    fn hash_with_context(&self, context: &str, bytes: &[u8]) -> Hash {
        let mut hasher = blake3::Hasher::new_derive_key(context);
        hasher.update(bytes);
        Hash(*hasher.finalize().as_bytes())
    }

    fn new_key_secret(&self) -> KeySecret {
        KeySecret(Self::random_32())
    }

    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let crypto = DalekCrypto::new();
        let secret = crypto.new_agent_secret();
        let agent = crypto.agent_id(&secret);
        let signature = crypto.sign(&secret.signer, b"hello world");

        assert!(crypto.verify(&agent.signer, b"hello world", &signature));
        assert!(!crypto.verify(&agent.signer, b"hello worlD", &signature));
    }

    #[test]
    fn test_agent_id_deterministic() {
        let crypto = DalekCrypto::new();
        let secret = AgentSecret {
            sealer: SealerSecret([0x11; 32]),
            signer: SignerSecret([0x22; 32]),
        };
        assert_eq!(crypto.agent_id(&secret), crypto.agent_id(&secret.clone()));
    }

    #[test]
    fn test_agent_id_string_roundtrip() {
        let crypto = DalekCrypto::new();
        let agent = crypto.agent_id(&crypto.new_agent_secret());
        let encoded = agent.to_string();

        assert!(encoded.starts_with("sealer_z"));
        assert!(encoded.contains("/signer_z"));
        assert_eq!(encoded.parse::<AgentId>().unwrap(), agent);
    }

    #[test]
    fn test_agent_secret_string_roundtrip() {
        let crypto = DalekCrypto::new();
        let secret = crypto.new_agent_secret();
        let encoded = secret.to_string();

        assert!(encoded.starts_with("sealerSecret_z"));
        assert_eq!(encoded.parse::<AgentSecret>().unwrap(), secret);
    }

    #[test]
    fn test_ecdh_agreement() {
        let crypto = DalekCrypto::new();
        let alice = crypto.new_agent_secret();
        let bob = crypto.new_agent_secret();

        let ab = crypto.ecdh(&alice.sealer, &crypto.agent_id(&bob).sealer);
        let ba = crypto.ecdh(&bob.sealer, &crypto.agent_id(&alice).sealer);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_seal_unseal() {
        let crypto = DalekCrypto::new();
        let alice = crypto.new_agent_secret();
        let bob = crypto.new_agent_secret();
        let mallory = crypto.new_agent_secret();
        let alice_id = crypto.agent_id(&alice);
        let bob_id = crypto.agent_id(&bob);

        let sealed = crypto
            .seal(b"read key", &alice.sealer, &bob_id.sealer, b"ctx")
            .unwrap();

        assert_eq!(
            crypto.unseal(&sealed, &bob.sealer, &alice_id.sealer, b"ctx"),
            Some(b"read key".to_vec())
        );
        assert_eq!(
            crypto.unseal(&sealed, &mallory.sealer, &alice_id.sealer, b"ctx"),
            None
        );
        assert_eq!(
            crypto.unseal(&sealed, &bob.sealer, &alice_id.sealer, b"other ctx"),
            None
        );
    }

    #[test]
    fn test_encrypt_decrypt() {
        let crypto = DalekCrypto::new();
        let key = crypto.new_key_secret();
        let other = crypto.new_key_secret();

        let ciphertext = crypto.encrypt(&key, b"secret", b"nonce").unwrap();
        assert_ne!(ciphertext.0, b"secret".to_vec());
        assert_eq!(
            crypto.decrypt(&key, &ciphertext, b"nonce"),
            Some(b"secret".to_vec())
        );
        assert_eq!(crypto.decrypt(&other, &ciphertext, b"nonce"), None);
    }

    #[test]
    fn test_streaming_hash_matches_one_shot() {
        let crypto = DalekCrypto::new();
        let mut stream = crypto.stream_hash();
        stream.update(b"hello ");
        let partial = stream.finalize();
        stream.update(b"world");

        assert_eq!(stream.finalize(), crypto.hash(b"hello world"));
        assert_eq!(partial, crypto.hash(b"hello "));
    }

    #[test]
    fn test_key_id_stable() {
        let crypto = DalekCrypto::new();
        let key = crypto.new_key_secret();
        assert_eq!(crypto.key_id(&key), crypto.key_id(&key.clone()));
        assert_ne!(crypto.key_id(&key), crypto.key_id(&crypto.new_key_secret()));
    }

    #[test]
    fn test_key_secret_debug_is_redacted() {
        let crypto = DalekCrypto::new();
        let key = crypto.new_key_secret();
        assert_eq!(format!("{:?}", key), "KeySecret(redacted)");
        assert!(key.to_string().starts_with("keySecret_z"));
    }

    #[test]
    fn test_signature_serde_as_string() {
        let crypto = DalekCrypto::new();
        let secret = crypto.new_agent_secret();
        let signature = crypto.sign(&secret.signer, b"msg");
        let json = serde_json::to_string(&signature).unwrap();

        assert!(json.starts_with("\"signature_z"));
        assert_eq!(serde_json::from_str::<Signature>(&json).unwrap(), signature);
    }
}
