// Shared test harness: an in-memory duplex transport and a deterministic
// crypto provider. The provider's hashes (and therefore HMAC/HKDF/PRF and
// every transcript computation) are real SHA-2; the ciphers, key agreement,
// KEM and signatures are structure-preserving stand-ins so that handshakes
// are fully deterministic and need no system entropy.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use num_bigint::BigUint;
use sha2::Digest;

use tls_engine::cipher_suite::BulkCipher;
use tls_engine::error::{Result, TlsError};
use tls_engine::extensions::{NamedGroup, SignatureScheme};
use tls_engine::provider::*;
use tls_engine::record::{StreamReader, StreamWriter};

////////////////////////////////////////////////////////////////////////////////
// In-memory duplex pipes.
////////////////////////////////////////////////////////////////////////////////

struct PipeState {
    buffer: VecDeque<u8>,
    closed: bool,
    read_waker: Option<Waker>,
}

pub struct PipeReader {
    state: Arc<Mutex<PipeState>>,
}

pub struct PipeWriter {
    state: Arc<Mutex<PipeState>>,
}

fn one_way_pipe() -> (PipeWriter, PipeReader) {
    let state = Arc::new(Mutex::new(PipeState {
        buffer: VecDeque::new(),
        closed: false,
        read_waker: None,
    }));

    (
        PipeWriter {
            state: state.clone(),
        },
        PipeReader { state },
    )
}

/// Returns ((client_reader, client_writer), (server_reader, server_writer)).
pub fn duplex() -> ((StreamReader, StreamWriter), (StreamReader, StreamWriter)) {
    let (client_to_server_w, client_to_server_r) = one_way_pipe();
    let (server_to_client_w, server_to_client_r) = one_way_pipe();

    (
        (Box::new(server_to_client_r), Box::new(client_to_server_w)),
        (Box::new(client_to_server_r), Box::new(server_to_client_w)),
    )
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        if let Some(w) = state.read_waker.take() {
            w.wake();
        }
    }
}

impl async_std::io::Read for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut state = self.state.lock().unwrap();

        if state.buffer.is_empty() {
            if state.closed {
                return Poll::Ready(Ok(0));
            }

            state.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let mut n = 0;
        while n < buf.len() {
            match state.buffer.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }

        Poll::Ready(Ok(n))
    }
}

impl async_std::io::Write for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut state = self.state.lock().unwrap();
        state.buffer.extend(buf.iter().copied());
        if let Some(w) = state.read_waker.take() {
            w.wake();
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        if let Some(w) = state.read_waker.take() {
            w.wake();
        }
        Poll::Ready(Ok(()))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Hashes (real SHA-2).
////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Default)]
struct Sha256Hasher {
    inner: sha2::Sha256,
}

impl Hasher for Sha256Hasher {
    fn block_size(&self) -> usize {
        64
    }
    fn output_size(&self) -> usize {
        32
    }
    fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }
    fn finish(&self) -> Vec<u8> {
        self.inner.clone().finalize().to_vec()
    }
    fn box_clone(&self) -> Box<dyn Hasher> {
        Box::new(self.clone())
    }
}

#[derive(Clone, Default)]
struct Sha384Hasher {
    inner: sha2::Sha384,
}

impl Hasher for Sha384Hasher {
    fn block_size(&self) -> usize {
        128
    }
    fn output_size(&self) -> usize {
        48
    }
    fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }
    fn finish(&self) -> Vec<u8> {
        self.inner.clone().finalize().to_vec()
    }
    fn box_clone(&self) -> Box<dyn Hasher> {
        Box::new(self.clone())
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut h = sha2::Sha256::new();
    h.update(data);
    h.finalize().to_vec()
}

////////////////////////////////////////////////////////////////////////////////
// Stand-in ciphers.
////////////////////////////////////////////////////////////////////////////////

fn keystream(key: &[u8], nonce: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![];
    let mut counter = 0u32;
    while out.len() < len {
        let mut material = key.to_vec();
        material.extend_from_slice(nonce);
        material.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&sha256(&material));
        counter += 1;
    }
    out.truncate(len);
    out
}

#[derive(Clone)]
struct XorAead {
    key_size: usize,
}

impl XorAead {
    fn tag(&self, key: &[u8], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Vec<u8> {
        let mut material = b"tag".to_vec();
        material.extend_from_slice(key);
        material.extend_from_slice(nonce);
        material.extend_from_slice(&(aad.len() as u32).to_be_bytes());
        material.extend_from_slice(aad);
        material.extend_from_slice(ciphertext);
        sha256(&material)[..16].to_vec()
    }
}

impl Aead for XorAead {
    fn key_size(&self) -> usize {
        self.key_size
    }
    fn nonce_size(&self) -> usize {
        12
    }
    fn tag_size(&self) -> usize {
        16
    }

    fn seal(&self, key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8], out: &mut Vec<u8>) {
        let ks = keystream(key, nonce, plaintext.len());
        let start = out.len();
        out.extend_from_slice(plaintext);
        for (i, b) in out[start..].iter_mut().enumerate() {
            *b ^= ks[i];
        }

        let tag = {
            let ciphertext = out[start..].to_vec();
            self.tag(key, nonce, aad, &ciphertext)
        };
        out.extend_from_slice(&tag);
    }

    fn open(
        &self,
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if ciphertext.len() < 16 {
            return Err(TlsError::bad_record_mac("Too short"));
        }

        let (body, tag) = ciphertext.split_at(ciphertext.len() - 16);
        if self.tag(key, nonce, aad, body) != tag {
            return Err(TlsError::bad_record_mac("Bad tag"));
        }

        let ks = keystream(key, nonce, body.len());
        out.extend(body.iter().zip(ks.iter()).map(|(a, b)| a ^ b));
        Ok(())
    }

    fn box_clone(&self) -> Box<dyn Aead> {
        Box::new(self.clone())
    }
}

/// A "CBC" stand-in: stateless XOR with a key-derived stream. Inverse of
/// itself, so one instance per direction behaves like a chained cipher from
/// the record layer's point of view.
struct XorBlockCipher {
    key: Vec<u8>,
    block_size: usize,
}

impl BlockCipher for XorBlockCipher {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        assert_eq!(data.len() % self.block_size, 0);
        let ks = keystream(&self.key, b"cbc", data.len());
        data.iter().zip(ks.iter()).map(|(a, b)| a ^ b).collect()
    }

    fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        self.encrypt(data)
    }
}

struct XorStreamCipher {
    key: Vec<u8>,
    offset: usize,
}

impl StreamCipher for XorStreamCipher {
    fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let ks = keystream(&self.key, b"rc4", self.offset + data.len());
        let out = data
            .iter()
            .zip(ks[self.offset..].iter())
            .map(|(a, b)| a ^ b)
            .collect();
        self.offset += data.len();
        out
    }
}

////////////////////////////////////////////////////////////////////////////////
// Key agreement / KEM stand-ins. Discrete log over 2^255-19 gives a real
// commutative exchange with deterministic byte formats.
////////////////////////////////////////////////////////////////////////////////

fn dh_prime() -> BigUint {
    (BigUint::from(1u32) << 255) - BigUint::from(19u32)
}

fn pad32(v: &BigUint) -> Vec<u8> {
    let raw = v.to_bytes_be();
    let mut out = vec![0u8; 32 - raw.len().min(32)];
    out.extend_from_slice(&raw);
    out
}

struct FakeAgreement {
    group: NamedGroup,
}

impl FakeAgreement {
    fn format_public(&self, v: &BigUint) -> Vec<u8> {
        match self.group {
            NamedGroup::x25519 => pad32(v),
            // Uncompressed point shape for the NIST curves.
            _ => {
                let mut out = vec![4u8];
                out.extend_from_slice(&pad32(v));
                out.extend_from_slice(&pad32(v));
                out
            }
        }
    }

    fn parse_public(&self, data: &[u8]) -> Result<BigUint> {
        match self.group {
            NamedGroup::x25519 => Ok(BigUint::from_bytes_be(data)),
            _ => {
                if data.first() != Some(&4) || data.len() < 33 {
                    return Err(TlsError::illegal_parameter("Bad point"));
                }
                Ok(BigUint::from_bytes_be(&data[1..33]))
            }
        }
    }
}

impl KeyAgreement for FakeAgreement {
    fn new_secret(&self, rng: &dyn SecureRandom) -> Result<Vec<u8>> {
        let mut secret = vec![0u8; 32];
        rng.fill(&mut secret);
        Ok(secret)
    }

    fn public_value(&self, secret: &[u8]) -> Result<Vec<u8>> {
        let p = dh_prime();
        let s = BigUint::from_bytes_be(secret);
        let public = BigUint::from(9u32).modpow(&s, &p);
        Ok(self.format_public(&public))
    }

    fn shared_secret(&self, remote_public: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
        let p = dh_prime();
        let base = self.parse_public(remote_public)?;
        let s = BigUint::from_bytes_be(secret);
        Ok(pad32(&base.modpow(&s, &p)))
    }
}

struct FakeKem;

impl Kem for FakeKem {
    fn public_key_size(&self) -> usize {
        32
    }
    fn ciphertext_size(&self) -> usize {
        32
    }

    fn generate(&self, rng: &dyn SecureRandom) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut secret = vec![0u8; 32];
        rng.fill(&mut secret);
        let mut material = b"kem-pk".to_vec();
        material.extend_from_slice(&secret);
        Ok((sha256(&material), secret))
    }

    fn encapsulate(&self, public_key: &[u8], rng: &dyn SecureRandom) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut r = vec![0u8; 32];
        rng.fill(&mut r);

        let mut material = b"kem-ss".to_vec();
        material.extend_from_slice(public_key);
        material.extend_from_slice(&r);
        Ok((r, sha256(&material)))
    }

    fn decapsulate(&self, secret_key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut pk_material = b"kem-pk".to_vec();
        pk_material.extend_from_slice(secret_key);
        let public_key = sha256(&pk_material);

        let mut material = b"kem-ss".to_vec();
        material.extend_from_slice(&public_key);
        material.extend_from_slice(ciphertext);
        Ok(sha256(&material))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Keys and "certificates". A certificate is just the key's seed; signatures
// are seed-keyed MACs, so verification works from the certificate alone.
////////////////////////////////////////////////////////////////////////////////

pub struct FakeKey {
    pub seed: Vec<u8>,
    pub key_type: KeyType,
}

impl FakeKey {
    pub fn new(seed: &[u8], key_type: KeyType) -> Arc<Self> {
        Arc::new(Self {
            seed: seed.to_vec(),
            key_type,
        })
    }

    /// The matching "DER certificate".
    pub fn certificate(&self) -> bytes::Bytes {
        let mut der = vec![match self.key_type {
            KeyType::Rsa => 1u8,
            KeyType::Ecdsa => 2,
            _ => 3,
        }];
        der.extend_from_slice(&self.seed);
        der.into()
    }

    fn mac(&self, scheme: SignatureScheme, data: &[u8]) -> Vec<u8> {
        let mut material = b"sig".to_vec();
        material.extend_from_slice(&self.seed);
        material.extend_from_slice(&scheme.to_value().to_be_bytes());
        material.extend_from_slice(data);
        sha256(&material)
    }
}

impl PrivateKey for FakeKey {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn supports_scheme(&self, scheme: SignatureScheme) -> bool {
        scheme.key_type() == Some(self.key_type)
    }

    fn sign(&self, scheme: SignatureScheme, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.mac(scheme, data))
    }

    fn rsa_decrypt_pkcs1(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let ks = keystream(&self.seed, b"rsa", ciphertext.len());
        Some(ciphertext.iter().zip(ks.iter()).map(|(a, b)| a ^ b).collect())
    }
}

impl PublicKey for FakeKey {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn bit_length(&self) -> usize {
        2048
    }

    fn verify(&self, scheme: SignatureScheme, data: &[u8], signature: &[u8]) -> Result<bool> {
        Ok(self.mac(scheme, data) == signature)
    }

    fn rsa_encrypt_pkcs1(&self, _rng: &dyn SecureRandom, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ks = keystream(&self.seed, b"rsa", plaintext.len());
        Ok(plaintext.iter().zip(ks.iter()).map(|(a, b)| a ^ b).collect())
    }
}

////////////////////////////////////////////////////////////////////////////////
// The provider.
////////////////////////////////////////////////////////////////////////////////

/// Deterministic counter-based randomness, unique per provider instance.
pub struct CountingRandom {
    counter: AtomicU64,
    salt: u64,
}

impl SecureRandom for CountingRandom {
    fn fill(&self, buf: &mut [u8]) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut material = b"rng".to_vec();
        material.extend_from_slice(&self.salt.to_be_bytes());
        material.extend_from_slice(&n.to_be_bytes());

        let mut out = vec![];
        let mut i = 0u32;
        while out.len() < buf.len() {
            let mut m = material.clone();
            m.extend_from_slice(&i.to_be_bytes());
            out.extend_from_slice(&sha256(&m));
            i += 1;
        }
        buf.copy_from_slice(&out[..buf.len()]);
    }
}

pub struct FakeProvider {
    random: CountingRandom,
}

impl FakeProvider {
    pub fn new(salt: u64) -> Arc<Self> {
        Arc::new(Self {
            random: CountingRandom {
                counter: AtomicU64::new(0),
                salt,
            },
        })
    }
}

impl CryptoProvider for FakeProvider {
    fn hasher_factory(&self, algorithm: HashAlgorithm) -> Result<HasherFactory> {
        match algorithm {
            HashAlgorithm::Sha256 => Ok(HasherFactory::new(algorithm, || {
                Box::new(Sha256Hasher::default())
            })),
            HashAlgorithm::Sha384 => Ok(HasherFactory::new(algorithm, || {
                Box::new(Sha384Hasher::default())
            })),
            _ => Err(TlsError::internal("Hash not available in tests")),
        }
    }

    fn aead(&self, cipher: BulkCipher) -> Result<Box<dyn Aead>> {
        Ok(Box::new(XorAead {
            key_size: cipher.key_size(),
        }))
    }

    fn block_cipher(
        &self,
        cipher: BulkCipher,
        key: &[u8],
        _iv: &[u8],
        _encrypting: bool,
    ) -> Result<Box<dyn BlockCipher>> {
        Ok(Box::new(XorBlockCipher {
            key: key.to_vec(),
            block_size: cipher.block_size(),
        }))
    }

    fn stream_cipher(&self, _cipher: BulkCipher, key: &[u8]) -> Result<Box<dyn StreamCipher>> {
        Ok(Box::new(XorStreamCipher {
            key: key.to_vec(),
            offset: 0,
        }))
    }

    fn key_agreement(&self, group: NamedGroup) -> Result<Box<dyn KeyAgreement>> {
        if !group.is_elliptic_curve() {
            return Err(TlsError::internal("Group not available in tests"));
        }
        Ok(Box::new(FakeAgreement { group }))
    }

    fn kem(&self, _algorithm: KemAlgorithm) -> Result<Box<dyn Kem>> {
        Ok(Box::new(FakeKem))
    }

    fn certificate_public_key(&self, cert_der: &[u8]) -> Result<Box<dyn PublicKey>> {
        if cert_der.len() < 2 {
            return Err(TlsError::decode_error("Bad test certificate"));
        }

        let key_type = match cert_der[0] {
            1 => KeyType::Rsa,
            2 => KeyType::Ecdsa,
            _ => KeyType::Ed25519,
        };

        Ok(Box::new(FakeKey {
            seed: cert_der[1..].to_vec(),
            key_type,
        }))
    }

    fn random(&self) -> &dyn SecureRandom {
        &self.random
    }
}

////////////////////////////////////////////////////////////////////////////////
// A simple in-memory session cache.
////////////////////////////////////////////////////////////////////////////////

pub struct MemorySessionCache {
    sessions: Mutex<std::collections::HashMap<Vec<u8>, tls_engine::session::Session>>,
}

impl MemorySessionCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(std::collections::HashMap::new()),
        })
    }
}

impl tls_engine::session::SessionCache for MemorySessionCache {
    fn get(&self, id: &[u8]) -> Option<tls_engine::session::Session> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    fn put(&self, id: &[u8], session: tls_engine::session::Session) {
        self.sessions
            .lock()
            .unwrap()
            .insert(id.to_vec(), session);
    }

    fn clear(&self) {
        self.sessions.lock().unwrap().clear();
    }
}
