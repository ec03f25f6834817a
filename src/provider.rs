// Interfaces to the cryptographic primitives consumed by the engine.
//
// The engine contains no primitive implementations: hashes, ciphers, AEADs,
// key agreement, KEMs, signatures and randomness are all injected through the
// CryptoProvider so that the protocol logic stays testable with deterministic
// stand-ins.

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::cipher_suite::BulkCipher;
use crate::error::{Result, TlsError};
use crate::extensions::{NamedGroup, SignatureScheme};

/// Hash algorithms the engine can ask the provider for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn output_size(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

/// Encapsulates an incremental digest (MD5, SHA-256, ...).
pub trait Hasher: Send {
    fn block_size(&self) -> usize;

    /// Expected size of the output digest in bytes.
    fn output_size(&self) -> usize;

    fn update(&mut self, data: &[u8]);

    /// Finalizes the hash of all data accumulated by calls to update().
    ///
    /// NOTE: It is valid to call update() after finish(); later finish()
    /// calls remain cumulative since the construction of this hasher.
    fn finish(&self) -> Vec<u8>;

    /// Clones this hasher with all data seen so far already applied. This is
    /// what makes transcript snapshots cheap.
    fn box_clone(&self) -> Box<dyn Hasher>;
}

/// Cloneable constructor for a fixed hash algorithm.
#[derive(Clone)]
pub struct HasherFactory {
    algorithm: HashAlgorithm,
    ctor: Arc<dyn Fn() -> Box<dyn Hasher> + Send + Sync>,
}

impl HasherFactory {
    pub fn new<F: Fn() -> Box<dyn Hasher> + Send + Sync + 'static>(
        algorithm: HashAlgorithm,
        ctor: F,
    ) -> Self {
        Self {
            algorithm,
            ctor: Arc::new(ctor),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn create(&self) -> Box<dyn Hasher> {
        (self.ctor)()
    }
}

/// Authenticated encryption with associated data (GCM / CCM / ChaCha20).
pub trait Aead: Send + Sync {
    fn key_size(&self) -> usize;

    fn nonce_size(&self) -> usize;

    fn tag_size(&self) -> usize;

    /// Size of the ciphertext produced for a plaintext of the given size.
    fn expanded_size(&self, plaintext_size: usize) -> usize {
        plaintext_size + self.tag_size()
    }

    fn seal(&self, key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8], out: &mut Vec<u8>);

    /// Fails on any authentication mismatch. The error carries no detail; the
    /// record layer maps every failure to bad_record_mac.
    fn open(
        &self,
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()>;

    fn box_clone(&self) -> Box<dyn Aead>;
}

/// Stateful CBC mode block cipher. The chaining IV lives inside; each call
/// continues from the previous one.
pub trait BlockCipher: Send {
    fn block_size(&self) -> usize;

    /// data.len() must be a multiple of block_size().
    fn encrypt(&mut self, data: &[u8]) -> Vec<u8>;

    fn decrypt(&mut self, data: &[u8]) -> Vec<u8>;
}

/// Stateful stream cipher (RC4). Encryption and decryption are the same
/// keystream XOR.
pub trait StreamCipher: Send {
    fn process(&mut self, data: &[u8]) -> Vec<u8>;
}

/// (EC)DHE for one named group (X25519, X448, NIST curves).
///
/// For the NIST curves public values are uncompressed points; for the
/// Montgomery curves they are the raw 32/56 byte scalar-mult outputs.
pub trait KeyAgreement: Send + Sync {
    fn new_secret(&self, rng: &dyn SecureRandom) -> Result<Vec<u8>>;

    fn public_value(&self, secret: &[u8]) -> Result<Vec<u8>>;

    fn shared_secret(&self, remote_public: &[u8], secret: &[u8]) -> Result<Vec<u8>>;
}

/// Key encapsulation (ML-KEM-768 / ML-KEM-1024) for the hybrid groups.
pub trait Kem: Send + Sync {
    fn public_key_size(&self) -> usize;

    fn ciphertext_size(&self) -> usize;

    /// Returns (public_key, secret_key).
    fn generate(&self, rng: &dyn SecureRandom) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Returns (ciphertext, shared_secret).
    fn encapsulate(&self, public_key: &[u8], rng: &dyn SecureRandom)
        -> Result<(Vec<u8>, Vec<u8>)>;

    fn decapsulate(&self, secret_key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KemAlgorithm {
    MlKem768,
    MlKem1024,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Ecdsa,
    Ed25519,
    Ed448,
    Dsa,
}

/// A private key usable for handshake signatures (and RSA key transport).
pub trait PrivateKey: Send + Sync {
    fn key_type(&self) -> KeyType;

    fn supports_scheme(&self, scheme: SignatureScheme) -> bool;

    /// Signs the given payload. For non-EdDSA schemes the provider hashes the
    /// payload with the scheme's hash before signing; EdDSA signs it raw.
    fn sign(&self, scheme: SignatureScheme, data: &[u8]) -> Result<Vec<u8>>;

    /// RSAES-PKCS1-v1_5 decryption for the static RSA key exchange.
    ///
    /// Returns None on any padding or size failure. Callers must not branch
    /// observably on the reason.
    fn rsa_decrypt_pkcs1(&self, _ciphertext: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Public key material extracted from a peer certificate.
pub trait PublicKey: Send + Sync {
    fn key_type(&self) -> KeyType;

    /// Modulus / group size in bits.
    fn bit_length(&self) -> usize;

    fn verify(&self, scheme: SignatureScheme, data: &[u8], signature: &[u8]) -> Result<bool>;

    /// RSAES-PKCS1-v1_5 encryption for the static RSA key exchange.
    fn rsa_encrypt_pkcs1(&self, _rng: &dyn SecureRandom, _plaintext: &[u8]) -> Result<Vec<u8>> {
        Err(TlsError::internal("Key does not support RSA encryption"))
    }
}

pub trait SecureRandom: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

/// Default randomness source backed by the operating system.
pub struct SystemRandom;

impl SecureRandom for SystemRandom {
    fn fill(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}

/// Factory for every primitive the engine consumes, keyed by the algorithm
/// identifiers negotiated on the wire.
pub trait CryptoProvider: Send + Sync {
    fn hasher_factory(&self, algorithm: HashAlgorithm) -> Result<HasherFactory>;

    fn aead(&self, cipher: BulkCipher) -> Result<Box<dyn Aead>>;

    fn block_cipher(
        &self,
        cipher: BulkCipher,
        key: &[u8],
        iv: &[u8],
        encrypting: bool,
    ) -> Result<Box<dyn BlockCipher>>;

    fn stream_cipher(&self, cipher: BulkCipher, key: &[u8]) -> Result<Box<dyn StreamCipher>>;

    fn key_agreement(&self, group: NamedGroup) -> Result<Box<dyn KeyAgreement>>;

    fn kem(&self, algorithm: KemAlgorithm) -> Result<Box<dyn Kem>>;

    /// Extracts the public key from a DER encoded certificate. Chain
    /// validation happens outside the engine.
    fn certificate_public_key(&self, cert_der: &[u8]) -> Result<Box<dyn PublicKey>>;

    fn random(&self) -> &dyn SecureRandom;
}
