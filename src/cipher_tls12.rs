use std::sync::Arc;

use bytes::Bytes;

use crate::cipher_suite::{BulkCipher, CipherSuite};
use crate::error::{Result, TlsError};
use crate::hmac::Hmac;
use crate::key_schedule_tls12::key_block;
use crate::provider::{Aead, BlockCipher, CryptoProvider, HasherFactory, SecureRandom, StreamCipher};
use crate::record::{ContentType, ProtocolVersion, Record};
use crate::utils::constant_time_eq;

/// Cipher state for one direction of a TLS 1.2 connection.
///
/// NOTE: A single instance of this is only used for encrypting or for
/// decrypting, not both.
pub struct CipherEndpointSpecTls12 {
    /// Sequence number for the next record processed with this state.
    /// Starts at 0 for the first record. Never wraps.
    sequence_num: u64,

    version: ProtocolVersion,

    kind: CipherKind,
}

enum CipherKind {
    Aead {
        encryption_key: Bytes,
        implicit_iv: Bytes,
        aead: Box<dyn Aead>,
        nonce_gen: Box<dyn NonceGenerator>,
    },
    Block {
        cipher: Box<dyn BlockCipher>,
        mac_key: Bytes,
        mac_factory: HasherFactory,
        encrypt_then_mac: bool,
        rng: Arc<dyn SecureRandom>,
    },
    Stream {
        cipher: Box<dyn StreamCipher>,
        mac_key: Bytes,
        mac_factory: HasherFactory,
    },
}

impl CipherEndpointSpecTls12 {
    fn next_sequence(&mut self) -> Result<[u8; 8]> {
        if self.sequence_num == u64::MAX {
            return Err(TlsError::internal("Record sequence number overflow"));
        }

        let out = self.sequence_num.to_be_bytes();
        self.sequence_num += 1;
        Ok(out)
    }

    /// MAC input pseudo-header: seq_num || type || version || length.
    fn mac_header(seq: &[u8; 8], typ: ContentType, version: ProtocolVersion, len: usize) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(seq);
        out.push(typ.to_u8());
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out
    }

    fn compute_mac(
        mac_factory: &HasherFactory,
        mac_key: &[u8],
        header: &[u8],
        data: &[u8],
    ) -> Vec<u8> {
        let mut hmac = Hmac::new(mac_factory.clone(), mac_key);
        hmac.update(header);
        hmac.update(data);
        hmac.finish()
    }

    /// Encrypts a TLSPlaintext record into a TLSCiphertext record.
    pub fn encrypt(&mut self, record: Record) -> Result<Record> {
        let seq = self.next_sequence()?;
        let version = self.version;

        let data = match &mut self.kind {
            CipherKind::Aead {
                encryption_key,
                implicit_iv,
                aead,
                nonce_gen,
            } => {
                let additional_data =
                    Self::mac_header(&seq, record.typ, record.legacy_record_version, record.data.len());

                // GenericAEADCipher: explicit nonce followed by ciphertext.
                let mut data = vec![];

                let explicit_nonce = nonce_gen.generate_explicit(&seq);
                data.extend_from_slice(&explicit_nonce);

                let nonce = nonce_gen.generate_full(implicit_iv, &seq, &explicit_nonce);

                let mut ciphertext = vec![];
                aead.seal(
                    encryption_key,
                    &nonce,
                    &record.data,
                    &additional_data,
                    &mut ciphertext,
                );
                data.extend_from_slice(&ciphertext);

                data
            }
            CipherKind::Block {
                cipher,
                mac_key,
                mac_factory,
                encrypt_then_mac,
                rng,
            } => {
                let block_size = cipher.block_size();

                // Per-record explicit IV: a fresh random block is run through
                // the chained cipher in front of the payload, so the first
                // ciphertext block serves as the IV from the peer's side.
                let mut iv_block = vec![0u8; block_size];
                rng.fill(&mut iv_block);

                if *encrypt_then_mac {
                    // RFC 7366: pad + encrypt first, MAC over the ciphertext.
                    let mut plaintext = iv_block;
                    plaintext.extend_from_slice(&record.data);
                    append_cbc_padding(&mut plaintext, block_size);

                    let mut data = cipher.encrypt(&plaintext);

                    let header =
                        Self::mac_header(&seq, record.typ, record.legacy_record_version, data.len());
                    let mac = Self::compute_mac(mac_factory, mac_key, &header, &data);
                    data.extend_from_slice(&mac);
                    data
                } else {
                    // Classic MAC-then-encrypt: the MAC covers the plaintext
                    // fragment only.
                    let header = Self::mac_header(
                        &seq,
                        record.typ,
                        record.legacy_record_version,
                        record.data.len(),
                    );
                    let mac = Self::compute_mac(mac_factory, mac_key, &header, &record.data);

                    let mut plaintext = iv_block;
                    plaintext.extend_from_slice(&record.data);
                    plaintext.extend_from_slice(&mac);
                    append_cbc_padding(&mut plaintext, block_size);

                    cipher.encrypt(&plaintext)
                }
            }
            CipherKind::Stream {
                cipher,
                mac_key,
                mac_factory,
            } => {
                let header = Self::mac_header(
                    &seq,
                    record.typ,
                    record.legacy_record_version,
                    record.data.len(),
                );
                let mac = Self::compute_mac(mac_factory, mac_key, &header, &record.data);

                let mut plaintext = record.data.to_vec();
                plaintext.extend_from_slice(&mac);
                cipher.process(&plaintext)
            }
        };

        Ok(Record {
            legacy_record_version: record.legacy_record_version,
            typ: record.typ,
            data: data.into(),
        })
    }

    pub fn decrypt(&mut self, record: Record) -> Result<Record> {
        let seq = self.next_sequence()?;

        let plaintext = match &mut self.kind {
            CipherKind::Aead {
                encryption_key,
                implicit_iv,
                aead,
                nonce_gen,
            } => {
                let explicit_nonce_size = nonce_gen.explicit_size();
                let overhead = aead.expanded_size(0) + explicit_nonce_size;
                if record.data.len() < overhead {
                    return Err(TlsError::bad_record_mac("Record too short for AEAD"));
                }

                let (explicit_nonce, ciphertext) = record.data.split_at(explicit_nonce_size);

                // The AAD length field MUST exclude the MAC tag and nonce.
                let plaintext_len = record.data.len() - overhead;
                let additional_data = Self::mac_header(
                    &seq,
                    record.typ,
                    record.legacy_record_version,
                    plaintext_len,
                );

                let nonce = nonce_gen.generate_full(implicit_iv, &seq, explicit_nonce);

                let mut plaintext = vec![];
                aead.open(
                    encryption_key,
                    &nonce,
                    ciphertext,
                    &additional_data,
                    &mut plaintext,
                )
                .map_err(|_| TlsError::bad_record_mac("AEAD open failed"))?;

                plaintext
            }
            CipherKind::Block {
                cipher,
                mac_key,
                mac_factory,
                encrypt_then_mac,
                rng: _,
            } => {
                let block_size = cipher.block_size();
                let mac_size = mac_factory.create().output_size();

                if *encrypt_then_mac {
                    // MAC over the ciphertext is verified before decrypting.
                    if record.data.len() < mac_size + 2 * block_size {
                        return Err(TlsError::bad_record_mac("Record too short"));
                    }

                    let (ciphertext, mac) = record.data.split_at(record.data.len() - mac_size);
                    if ciphertext.len() % block_size != 0 {
                        return Err(TlsError::bad_record_mac("Ciphertext not block aligned"));
                    }

                    let header = Self::mac_header(
                        &seq,
                        record.typ,
                        record.legacy_record_version,
                        ciphertext.len(),
                    );
                    let expected = Self::compute_mac(mac_factory, mac_key, &header, ciphertext);
                    if !constant_time_eq(&expected, mac) {
                        return Err(TlsError::bad_record_mac("Bad record MAC"));
                    }

                    let mut plaintext = cipher.decrypt(ciphertext);

                    // Discard the explicit IV block, then unpad. The MAC
                    // already passed so padding errors are simply malformed
                    // records, but they still surface as bad_record_mac.
                    plaintext.drain(0..block_size);
                    let pad_len = *plaintext
                        .last()
                        .ok_or_else(|| TlsError::bad_record_mac("Empty record"))?
                        as usize;
                    if pad_len + 1 > plaintext.len() {
                        return Err(TlsError::bad_record_mac("Bad padding length"));
                    }
                    plaintext.truncate(plaintext.len() - pad_len - 1);
                    plaintext
                } else {
                    if record.data.len() % block_size != 0
                        || record.data.len() < 2 * block_size
                    {
                        return Err(TlsError::bad_record_mac("Ciphertext not block aligned"));
                    }

                    // Decrypt everything first, then run the combined
                    // padding + MAC check without early exits so that a
                    // padding failure is not distinguishable from a MAC
                    // failure by timing.
                    let mut decrypted = cipher.decrypt(&record.data);
                    decrypted.drain(0..block_size); // explicit IV

                    check_mac_then_encrypt_record(
                        &decrypted,
                        &seq,
                        record.typ,
                        record.legacy_record_version,
                        mac_factory,
                        mac_key,
                    )?
                }
            }
            CipherKind::Stream {
                cipher,
                mac_key,
                mac_factory,
            } => {
                let mac_size = mac_factory.create().output_size();
                if record.data.len() < mac_size {
                    return Err(TlsError::bad_record_mac("Record too short"));
                }

                let decrypted = cipher.process(&record.data);
                let (content, mac) = decrypted.split_at(decrypted.len() - mac_size);

                let header = Self::mac_header(
                    &seq,
                    record.typ,
                    record.legacy_record_version,
                    content.len(),
                );
                let expected = Self::compute_mac(mac_factory, mac_key, &header, content);
                if !constant_time_eq(&expected, mac) {
                    return Err(TlsError::bad_record_mac("Bad record MAC"));
                }

                content.to_vec()
            }
        };

        Ok(Record {
            legacy_record_version: record.legacy_record_version,
            typ: record.typ,
            data: plaintext.into(),
        })
    }
}

/// Appends TLS CBC padding: N+1 bytes each holding the value N.
fn append_cbc_padding(data: &mut Vec<u8>, block_size: usize) {
    let pad_len = block_size - (data.len() + 1) % block_size;
    for _ in 0..(pad_len + 1) {
        data.push(pad_len as u8);
    }
}

/// Combined padding + MAC check for a fully decrypted MAC-then-encrypt CBC
/// record (explicit IV already removed).
///
/// Every branch runs to completion: the MAC is always computed, over a
/// best-effort content length when the padding is malformed, and all failure
/// conditions are folded into one flag checked at the end.
fn check_mac_then_encrypt_record(
    decrypted: &[u8],
    seq: &[u8; 8],
    typ: ContentType,
    version: ProtocolVersion,
    mac_factory: &HasherFactory,
    mac_key: &[u8],
) -> Result<Vec<u8>> {
    let mac_size = mac_factory.create().output_size();
    let total = decrypted.len();

    let mut ok: u8 = 1;

    if total < mac_size + 1 {
        return Err(TlsError::bad_record_mac("Record too short"));
    }

    let claimed_pad = decrypted[total - 1] as usize;
    let pad_len = if claimed_pad + 1 + mac_size > total {
        ok = 0;
        0
    } else {
        claimed_pad
    };

    // All padding bytes must equal the length byte.
    let pad_start = total - 1 - pad_len;
    for i in pad_start..(total - 1) {
        if decrypted[i] as usize != claimed_pad {
            ok = 0;
        }
    }

    let content_len = total - mac_size - pad_len - 1;
    let content = &decrypted[0..content_len];
    let received_mac = &decrypted[content_len..(content_len + mac_size)];

    let header = CipherEndpointSpecTls12::mac_header(seq, typ, version, content_len);
    let expected = CipherEndpointSpecTls12::compute_mac(mac_factory, mac_key, &header, content);

    if !constant_time_eq(&expected, received_mac) {
        ok = 0;
    }

    if ok != 1 {
        // Padding and MAC failures intentionally share one error.
        return Err(TlsError::bad_record_mac("Bad record MAC"));
    }

    Ok(content.to_vec())
}

pub trait NonceGenerator: Send + Sync {
    /// Size of the per-record nonce sent on the wire ('record_iv_length').
    fn explicit_size(&self) -> usize;

    /// Size of the keyed nonce prefix ('fixed_iv_length').
    fn implicit_size(&self) -> usize;

    /// Generates the explicit nonce sent in each TLS 1.2 record.
    fn generate_explicit(&self, seq: &[u8; 8]) -> Vec<u8>;

    fn generate_full(&self, implicit_iv: &[u8], seq: &[u8; 8], explicit: &[u8]) -> Vec<u8>;

    fn box_clone(&self) -> Box<dyn NonceGenerator>;
}

/// Nonce generator for the AES GCM/CCM AEAD ciphers.
/// Based on RFC 5288: 4 byte salt from the key block followed by the 8 byte
/// explicit nonce (the sequence number).
#[derive(Clone)]
pub struct GcmNonceGenerator {}

impl GcmNonceGenerator {
    pub fn new() -> Self {
        Self {}
    }
}

impl NonceGenerator for GcmNonceGenerator {
    fn explicit_size(&self) -> usize {
        8
    }

    fn implicit_size(&self) -> usize {
        4
    }

    fn generate_explicit(&self, seq: &[u8; 8]) -> Vec<u8> {
        seq.to_vec()
    }

    fn generate_full(&self, implicit_iv: &[u8], _seq: &[u8; 8], explicit: &[u8]) -> Vec<u8> {
        let mut out = implicit_iv.to_vec();
        out.extend_from_slice(explicit);
        out
    }

    fn box_clone(&self) -> Box<dyn NonceGenerator> {
        Box::new(self.clone())
    }
}

/// Based on RFC 7905: no explicit nonce; the sequence number is XORed into
/// the 12 byte keyed IV, like TLS 1.3.
#[derive(Clone)]
pub struct ChaChaPoly1305NonceGenerator {}

impl ChaChaPoly1305NonceGenerator {
    pub fn new() -> Self {
        Self {}
    }
}

impl NonceGenerator for ChaChaPoly1305NonceGenerator {
    fn explicit_size(&self) -> usize {
        0
    }

    fn implicit_size(&self) -> usize {
        12
    }

    fn generate_explicit(&self, _seq: &[u8; 8]) -> Vec<u8> {
        vec![]
    }

    fn generate_full(&self, implicit_iv: &[u8], seq: &[u8; 8], _explicit: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 12];
        out[4..].copy_from_slice(seq);
        crate::utils::xor_inplace(implicit_iv, &mut out);
        out
    }

    fn box_clone(&self) -> Box<dyn NonceGenerator> {
        Box::new(self.clone())
    }
}

/// The two write states derived from one TLS 1.2 key block.
pub struct PendingCipherStatesTls12 {
    pub client_write: crate::cipher::CipherEndpointSpec,
    pub server_write: crate::cipher::CipherEndpointSpec,
}

/// Expands the key block for a TLS 1.2 connection and builds both pending
/// write states.
///
/// 'is_client' picks the direction each underlying cipher instance will run
/// in: the local write state encrypts, the remote one decrypts.
pub fn calc_pending_states(
    cipher_suite: CipherSuite,
    provider: Arc<dyn CryptoProvider>,
    master_secret: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    version: ProtocolVersion,
    encrypt_then_mac: bool,
    is_client: bool,
) -> Result<PendingCipherStatesTls12> {
    let bulk = cipher_suite.bulk_cipher();
    let mac = cipher_suite.mac();
    let prf_factory = provider.hasher_factory(cipher_suite.prf_hash())?;

    // CBC suites in TLS 1.2 use a fully explicit per-record IV, so only AEAD
    // suites consume IV material from the key block.
    let kb = key_block(
        master_secret,
        client_random,
        server_random,
        &prf_factory,
        mac.key_size(),
        bulk.key_size(),
        bulk.fixed_iv_size(),
    );

    let make = |write_key: &Bytes,
                write_mac_key: &Bytes,
                write_iv: &Bytes,
                encrypting: bool|
     -> Result<crate::cipher::CipherEndpointSpec> {
        let kind = if bulk.is_aead() {
            let nonce_gen: Box<dyn NonceGenerator> = match bulk {
                BulkCipher::ChaCha20Poly1305 => Box::new(ChaChaPoly1305NonceGenerator::new()),
                _ => Box::new(GcmNonceGenerator::new()),
            };

            CipherKind::Aead {
                encryption_key: write_key.clone(),
                implicit_iv: write_iv.clone(),
                aead: provider.aead(bulk)?,
                nonce_gen,
            }
        } else if bulk.is_block() {
            let mac_factory = provider.hasher_factory(
                mac.hash_algorithm()
                    .ok_or_else(|| TlsError::internal("CBC suite without a MAC"))?,
            )?;

            // The chaining IV starts at zero; the explicit per-record IV
            // block randomizes each record.
            let zero_iv = vec![0u8; bulk.block_size()];
            CipherKind::Block {
                cipher: provider.block_cipher(bulk, write_key, &zero_iv, encrypting)?,
                mac_key: write_mac_key.clone(),
                mac_factory,
                encrypt_then_mac,
                rng: Arc::new(ProviderRandom {
                    provider: provider.clone(),
                }),
            }
        } else {
            let mac_factory = provider.hasher_factory(
                mac.hash_algorithm()
                    .ok_or_else(|| TlsError::internal("Stream suite without a MAC"))?,
            )?;

            CipherKind::Stream {
                cipher: provider.stream_cipher(bulk, write_key)?,
                mac_key: write_mac_key.clone(),
                mac_factory,
            }
        };

        Ok(crate::cipher::CipherEndpointSpec::Tls12(
            CipherEndpointSpecTls12 {
                sequence_num: 0,
                version,
                kind,
            },
        ))
    };

    let client_write = make(
        &kb.client_write_key,
        &kb.client_write_mac_key,
        &kb.client_write_iv,
        is_client,
    )?;
    let server_write = make(
        &kb.server_write_key,
        &kb.server_write_mac_key,
        &kb.server_write_iv,
        !is_client,
    )?;

    Ok(PendingCipherStatesTls12 {
        client_write,
        server_write,
    })
}

/// Adapter so cipher states can hold onto the provider's randomness.
struct ProviderRandom {
    provider: Arc<dyn CryptoProvider>,
}

impl SecureRandom for ProviderRandom {
    fn fill(&self, buf: &mut [u8]) {
        self.provider.random().fill(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sha256_factory;

    // Toy AEAD: XOR with the key, tag = sum over everything. Enough to make
    // record round-trips sensitive to keys, nonces and AAD.
    #[derive(Clone)]
    struct ToyAead;

    impl crate::provider::Aead for ToyAead {
        fn key_size(&self) -> usize {
            16
        }
        fn nonce_size(&self) -> usize {
            12
        }
        fn tag_size(&self) -> usize {
            4
        }

        fn seal(&self, key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8], out: &mut Vec<u8>) {
            let start = out.len();
            for (i, b) in plaintext.iter().enumerate() {
                out.push(b ^ key[i % key.len()] ^ nonce[i % nonce.len()]);
            }

            let mut tag = [0u8; 4];
            for (i, b) in key
                .iter()
                .chain(nonce.iter())
                .chain(aad.iter())
                .chain(out[start..].iter())
                .enumerate()
            {
                tag[i % 4] = tag[i % 4].wrapping_add(*b);
            }
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
            if ciphertext.len() < 4 {
                return Err(TlsError::bad_record_mac("short"));
            }
            let (body, tag) = ciphertext.split_at(ciphertext.len() - 4);

            let mut expected = [0u8; 4];
            for (i, b) in key
                .iter()
                .chain(nonce.iter())
                .chain(aad.iter())
                .chain(body.iter())
                .enumerate()
            {
                expected[i % 4] = expected[i % 4].wrapping_add(*b);
            }
            if &expected[..] != tag {
                return Err(TlsError::bad_record_mac("tag"));
            }

            for (i, b) in body.iter().enumerate() {
                out.push(b ^ key[i % key.len()] ^ nonce[i % nonce.len()]);
            }
            Ok(())
        }

        fn box_clone(&self) -> Box<dyn crate::provider::Aead> {
            Box::new(self.clone())
        }
    }

    fn aead_state() -> CipherEndpointSpecTls12 {
        CipherEndpointSpecTls12 {
            sequence_num: 0,
            version: crate::record::TLS_1_2_VERSION,
            kind: CipherKind::Aead {
                encryption_key: Bytes::from(vec![7u8; 16]),
                implicit_iv: Bytes::from(vec![9u8; 4]),
                aead: Box::new(ToyAead),
                nonce_gen: Box::new(GcmNonceGenerator::new()),
            },
        }
    }

    fn plain_record(payload: &[u8]) -> Record {
        Record {
            typ: ContentType::ApplicationData,
            legacy_record_version: crate::record::TLS_1_2_VERSION,
            data: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn aead_record_roundtrip_tracks_sequence() {
        let mut write = aead_state();
        let mut read = aead_state();

        for i in 0..3u8 {
            let encrypted = write.encrypt(plain_record(&[i; 32])).unwrap();
            assert_ne!(&encrypted.data[8..], &[i; 32][..]);

            let decrypted = read.decrypt(encrypted).unwrap();
            assert_eq!(&decrypted.data[..], &[i; 32][..]);
        }

        assert_eq!(write.sequence_num, 3);
        assert_eq!(read.sequence_num, 3);
    }

    #[test]
    fn aead_record_rejects_out_of_sequence() {
        let mut write = aead_state();
        let mut read = aead_state();

        // Drop the first record: the receiver's sequence number no longer
        // matches the AAD the sender used.
        let _dropped = write.encrypt(plain_record(b"first")).unwrap();
        let second = write.encrypt(plain_record(b"second")).unwrap();

        assert!(read.decrypt(second).is_err());
    }

    #[test]
    fn cbc_roundtrip_with_real_hmac() {
        struct XorCbc {
            key: Vec<u8>,
        }
        impl crate::provider::BlockCipher for XorCbc {
            fn block_size(&self) -> usize {
                16
            }
            fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
                data.iter()
                    .enumerate()
                    .map(|(i, b)| b ^ self.key[i % self.key.len()])
                    .collect()
            }
            fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
                self.encrypt(data)
            }
        }

        struct FixedRandom;
        impl SecureRandom for FixedRandom {
            fn fill(&self, buf: &mut [u8]) {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = i as u8;
                }
            }
        }

        let make = |etm: bool| CipherEndpointSpecTls12 {
            sequence_num: 0,
            version: crate::record::TLS_1_2_VERSION,
            kind: CipherKind::Block {
                cipher: Box::new(XorCbc { key: vec![5u8; 16] }),
                mac_key: Bytes::from(vec![3u8; 32]),
                mac_factory: sha256_factory(),
                encrypt_then_mac: etm,
                rng: Arc::new(FixedRandom),
            },
        };

        for etm in [false, true] {
            let mut write = make(etm);
            let mut read = make(etm);

            let encrypted = write.encrypt(plain_record(b"cbc payload bytes")).unwrap();
            let decrypted = read.decrypt(encrypted).unwrap();
            assert_eq!(&decrypted.data[..], b"cbc payload bytes");

            // Flipping ciphertext surfaces as bad_record_mac.
            let mut tampered = write.encrypt(plain_record(b"cbc payload bytes")).unwrap();
            let mut data = tampered.data.to_vec();
            data[20] ^= 1;
            tampered.data = data.into();
            let err = read.decrypt(tampered).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::BadRecordMac);
        }
    }

    #[test]
    fn cbc_padding_fills_to_block() {
        let mut data = vec![0u8; 10];
        append_cbc_padding(&mut data, 16);
        assert_eq!(data.len(), 16);
        assert_eq!(data[15], 5);
        assert_eq!(&data[10..], &[5, 5, 5, 5, 5, 5]);

        // Exactly one block of content forces a full block of padding.
        let mut data = vec![0u8; 16];
        append_cbc_padding(&mut data, 16);
        assert_eq!(data.len(), 32);
        assert_eq!(data[31], 15);
    }

    #[test]
    fn gcm_nonce_layout() {
        let gen = GcmNonceGenerator::new();
        let seq = 7u64.to_be_bytes();
        let explicit = gen.generate_explicit(&seq);
        assert_eq!(explicit, seq.to_vec());

        let nonce = gen.generate_full(&[1, 2, 3, 4], &seq, &explicit);
        assert_eq!(nonce.len(), 12);
        assert_eq!(&nonce[..4], &[1, 2, 3, 4]);
        assert_eq!(&nonce[4..], &seq[..]);
    }

    #[test]
    fn chacha_nonce_is_xored_sequence() {
        let gen = ChaChaPoly1305NonceGenerator::new();
        let seq = 1u64.to_be_bytes();
        assert!(gen.generate_explicit(&seq).is_empty());

        let iv = [0xaau8; 12];
        let nonce = gen.generate_full(&iv, &seq, &[]);
        assert_eq!(nonce.len(), 12);
        assert_eq!(&nonce[..4], &[0xaa; 4]);
        assert_eq!(nonce[11], 0xaa ^ 1);
    }
}
