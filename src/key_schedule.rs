// Key derivation for TLS 1.3.
// https://tools.ietf.org/html/rfc8446#section-7.1

use bytes::Bytes;

use crate::error::{Result, TlsError};
use crate::hkdf::Hkdf;
use crate::hmac::hmac_hash;
use crate::parsing::serialize_varlen_vector;
use crate::provider::{Aead, HasherFactory};
use crate::transcript::Transcript;
use crate::utils::xor_inplace;

/// Which label the binder key derivation uses depends on where the PSK came
/// from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PskKind {
    External,
    Resumption,
}

/// Runs the Early -> Handshake -> Master secret cascade.
///
/// The salt moves forward through the cascade as each input secret gets
/// mixed in; traffic secrets branch off of it at the documented points.
pub struct KeySchedule {
    hkdf: Hkdf,
    hasher_factory: HasherFactory,

    current_salt: Vec<u8>,

    base_keys: Option<HandshakeTrafficSecrets>,

    // Useful precomputed values
    /// Vector of zeros of the same length as the hash function output.
    zero_salt: Vec<u8>,
    /// Hash of an empty transcript. aka hash("")
    empty_transcript_hash: Vec<u8>,
}

impl KeySchedule {
    pub fn new(hkdf: Hkdf, hasher_factory: HasherFactory) -> Self {
        let zero_salt = vec![0u8; hkdf.hash_size()];
        let current_salt = zero_salt.clone();

        let empty_transcript_hash = {
            let mut hasher = hasher_factory.create();
            hasher.update(b"");
            hasher.finish()
        };

        Self {
            hkdf,
            hasher_factory,
            zero_salt,
            current_salt,
            empty_transcript_hash,
            base_keys: None,
        }
    }

    pub fn hasher_factory(&self) -> &HasherFactory {
        &self.hasher_factory
    }

    pub fn hkdf(&self) -> &Hkdf {
        &self.hkdf
    }

    pub fn hash_size(&self) -> usize {
        self.hkdf.hash_size()
    }

    /// Early_Secret = HKDF-Extract(0, PSK or 0).
    pub fn early_secret(&mut self, psk: Option<&[u8]>) -> &[u8] {
        let ikm = psk.unwrap_or(&self.zero_salt).to_vec();
        self.current_salt = self.hkdf.extract(&self.current_salt, &ikm);
        &self.current_salt
    }

    /// binder_key = Derive-Secret(Early_Secret, "ext binder" | "res binder", "").
    ///
    /// Must be called after early_secret() and before handshake_secret().
    pub fn binder_key(&self, kind: PskKind) -> Vec<u8> {
        let label: &[u8] = match kind {
            PskKind::External => b"ext binder",
            PskKind::Resumption => b"res binder",
        };

        hkdf_expand_label(
            &self.hkdf,
            &self.current_salt,
            label,
            &self.empty_transcript_hash,
            self.hkdf.hash_size() as u16,
        )
    }

    pub fn handshake_secret(&mut self, shared_secret: &[u8]) -> &[u8] {
        // Derive-Secret(., "derived", "")
        self.current_salt = hkdf_expand_label(
            &self.hkdf,
            &self.current_salt,
            b"derived",
            &self.empty_transcript_hash,
            self.hkdf.hash_size() as u16,
        );

        // Handshake Secret
        self.current_salt = self.hkdf.extract(&self.current_salt, shared_secret);
        &self.current_salt
    }

    /// Should be called immediately after the ServerHello has entered the
    /// transcript.
    pub fn handshake_traffic_secrets(
        &mut self,
        transcript: &Transcript,
    ) -> HandshakeTrafficSecrets {
        let ch_sh_transcript_hash = transcript.hash(&self.hasher_factory);

        let client_handshake_traffic_secret = hkdf_expand_label(
            &self.hkdf,
            &self.current_salt,
            b"c hs traffic",
            &ch_sh_transcript_hash,
            self.hkdf.hash_size() as u16,
        )
        .into();

        let server_handshake_traffic_secret = hkdf_expand_label(
            &self.hkdf,
            &self.current_salt,
            b"s hs traffic",
            &ch_sh_transcript_hash,
            self.hkdf.hash_size() as u16,
        )
        .into();

        self.base_keys = Some(HandshakeTrafficSecrets {
            client_handshake_traffic_secret,
            server_handshake_traffic_secret,
        });

        self.base_keys.clone().unwrap()
    }

    pub fn master_secret(&mut self) -> &[u8] {
        // Derive-Secret(., "derived", "")
        self.current_salt = hkdf_expand_label(
            &self.hkdf,
            &self.current_salt,
            b"derived",
            &self.empty_transcript_hash,
            self.hkdf.hash_size() as u16,
        );

        // Master Secret
        self.current_salt = self.hkdf.extract(&self.current_salt.clone(), &self.zero_salt);
        &self.current_salt
    }

    /// Call immediately before sending/receiving the server Finished message
    /// to calculate the corresponding verify_data.
    pub fn verify_data_server(&self, transcript: &Transcript) -> Bytes {
        let base_keys = self.base_keys.as_ref().unwrap();
        self.verify_data(&base_keys.server_handshake_traffic_secret, transcript)
    }

    /// Call after the server Finished is in the transcript (and the client's
    /// second flight, if any) to produce the expected client Finished
    /// verify_data.
    pub fn verify_data_client(&self, transcript: &Transcript) -> Bytes {
        let base_keys = self.base_keys.as_ref().unwrap();
        self.verify_data(&base_keys.client_handshake_traffic_secret, transcript)
    }

    fn verify_data(&self, traffic_secret: &[u8], transcript: &Transcript) -> Bytes {
        // finished_key = HKDF-Expand-Label(BaseKey, "finished", "", Hash.length)
        let finished_key = hkdf_expand_label(
            &self.hkdf,
            traffic_secret,
            b"finished",
            b"",
            self.hkdf.hash_size() as u16,
        );

        let transcript_hash = transcript.hash(&self.hasher_factory);

        // verify_data = HMAC(finished_key, Transcript-Hash(...))
        hmac_hash(self.hkdf.hasher_factory(), &finished_key, &transcript_hash).into()
    }

    /// Application traffic secrets. The transcript must cover ClientHello
    /// through the server Finished.
    pub fn application_secrets(&self, transcript: &Transcript) -> ApplicationSecrets {
        let ch_sf_transcript_hash = transcript.hash(&self.hasher_factory);

        ApplicationSecrets {
            client_application_traffic_secret_0: hkdf_expand_label(
                &self.hkdf,
                &self.current_salt,
                b"c ap traffic",
                &ch_sf_transcript_hash,
                self.hkdf.hash_size() as u16,
            )
            .into(),

            server_application_traffic_secret_0: hkdf_expand_label(
                &self.hkdf,
                &self.current_salt,
                b"s ap traffic",
                &ch_sf_transcript_hash,
                self.hkdf.hash_size() as u16,
            )
            .into(),

            exporter_master_secret: hkdf_expand_label(
                &self.hkdf,
                &self.current_salt,
                b"exp master",
                &ch_sf_transcript_hash,
                self.hkdf.hash_size() as u16,
            )
            .into(),
        }
    }

    /// resumption_master_secret. The transcript must cover ClientHello
    /// through the *client* Finished.
    pub fn resumption_master_secret(&self, transcript: &Transcript) -> Bytes {
        let ch_cf_transcript_hash = transcript.hash(&self.hasher_factory);

        hkdf_expand_label(
            &self.hkdf,
            &self.current_salt,
            b"res master",
            &ch_cf_transcript_hash,
            self.hkdf.hash_size() as u16,
        )
        .into()
    }
}

/// PSK = HKDF-Expand-Label(resumption_master_secret, "resumption",
///                         ticket_nonce, Hash.length)
pub fn resumption_psk(hkdf: &Hkdf, resumption_master_secret: &[u8], ticket_nonce: &[u8]) -> Vec<u8> {
    hkdf_expand_label(
        hkdf,
        resumption_master_secret,
        b"resumption",
        ticket_nonce,
        hkdf.hash_size() as u16,
    )
}

#[derive(Clone)]
pub struct HandshakeTrafficSecrets {
    pub client_handshake_traffic_secret: Bytes,
    pub server_handshake_traffic_secret: Bytes,
}

pub struct ApplicationSecrets {
    pub client_application_traffic_secret_0: Bytes,
    pub server_application_traffic_secret_0: Bytes,
    pub exporter_master_secret: Bytes,
}

pub struct TrafficKey {
    pub key: Bytes,
    pub iv: Bytes,
}

/// Keying material derived from one traffic secret; produces the per-record
/// nonce sequence.
pub struct TrafficKeyingMaterial {
    base_key: TrafficKey,
    sequence: u64,
}

impl TrafficKeyingMaterial {
    // [sender]_write_key = HKDF-Expand-Label(Secret, "key", "", key_length)
    // [sender]_write_iv  = HKDF-Expand-Label(Secret, "iv", "", iv_length)
    pub fn from_secret(hkdf: &Hkdf, aead: &dyn Aead, traffic_secret: &[u8]) -> Self {
        let key_length = aead.key_size();
        let iv_length = std::cmp::max(8, aead.nonce_size());

        let key = hkdf_expand_label(hkdf, traffic_secret, b"key", b"", key_length as u16).into();
        let iv = hkdf_expand_label(hkdf, traffic_secret, b"iv", b"", iv_length as u16).into();

        Self {
            base_key: TrafficKey { key, iv },
            sequence: 0,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Calculates the keys for the next record: the 64-bit sequence number
    /// is XORed into the tail of the write IV.
    /// https://tools.ietf.org/html/rfc8446#section-5.3
    pub fn next_keys(&mut self) -> Result<TrafficKey> {
        if self.sequence == u64::MAX {
            // The peer was supposed to rekey long before this point.
            return Err(TlsError::internal("Record sequence number overflow"));
        }

        let mut nonce = vec![0u8; self.base_key.iv.len()];
        let n = nonce.len();
        *array_mut_ref![nonce, n - 8, 8] = self.sequence.to_be_bytes();

        xor_inplace(&self.base_key.iv, &mut nonce);

        self.sequence += 1;

        Ok(TrafficKey {
            key: self.base_key.key.clone(),
            iv: nonce.into(),
        })
    }
}

// HKDF-Expand-Label(Secret, Label, Context, Length) =
//     HKDF-Expand(Secret, HkdfLabel, Length)

pub fn hkdf_expand_label(
    hkdf: &Hkdf,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    length: u16,
) -> Vec<u8> {
    let mut hkdf_label = vec![];
    HkdfLabel {
        length,
        label,
        context,
    }
    .serialize(&mut hkdf_label);

    hkdf.expand(secret, &hkdf_label, length as usize)
}

/// Derive-Secret(Secret, Label, Messages) =
///     HKDF-Expand-Label(Secret, Label, Transcript-Hash(Messages), Hash.length)
pub fn derive_secret(
    hkdf: &Hkdf,
    secret: &[u8],
    label: &[u8],
    transcript_hash: &[u8],
) -> Vec<u8> {
    hkdf_expand_label(hkdf, secret, label, transcript_hash, hkdf.hash_size() as u16)
}

// Where HkdfLabel is specified as:
/*
struct {
    uint16 length = Length;
    opaque label<7..255> = "tls13 " + Label;
    opaque context<0..255> = Context;
} HkdfLabel;
*/
/// NOTE: This never needs to be parsed, so it only supports serialization.
struct HkdfLabel<'a> {
    length: u16,
    // NOTE: Don't include the 'tls13 ' prefix in this
    label: &'a [u8],
    context: &'a [u8],
}

impl HkdfLabel<'_> {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.length.to_be_bytes());
        serialize_varlen_vector(7, 255, out, |out| {
            out.extend_from_slice(b"tls13 ");
            out.extend_from_slice(self.label);
        });
        serialize_varlen_vector(0, 255, out, |out| {
            out.extend_from_slice(self.context);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sha256_factory;

    // Test vectors from RFC 8448 section 3 (simple 1-RTT handshake).

    #[test]
    fn early_and_derived_secret_vectors() {
        let factory = sha256_factory();
        let hkdf = Hkdf::new(factory.clone());
        let mut ks = KeySchedule::new(hkdf, factory);

        let early = ks.early_secret(None).to_vec();
        assert_eq!(
            early,
            hex::decode("33ad0a1c607ec03b09e6cd9893680ce210adf300aa1f2660e1b22e10f170f92a")
                .unwrap()
        );

        let shared = hex::decode(
            "8bd4054fb55b9d63fdfbacf9f04b9f0d35e6d63f537563efd46272900f89492d",
        )
        .unwrap();
        let hs = ks.handshake_secret(&shared).to_vec();
        assert_eq!(
            hs,
            hex::decode("1dc826e93606aa6fdc0aadc12f741b01046aa6b99f691ed221a9f0ca043fbeac")
                .unwrap()
        );
    }

    #[test]
    fn traffic_key_nonce_xor() {
        // The per-record nonce for sequence 0 is the IV itself; sequence 1
        // flips the lowest bit.
        struct NullAead;
        impl Aead for NullAead {
            fn key_size(&self) -> usize {
                16
            }
            fn nonce_size(&self) -> usize {
                12
            }
            fn tag_size(&self) -> usize {
                16
            }
            fn seal(&self, _: &[u8], _: &[u8], _: &[u8], _: &[u8], _: &mut Vec<u8>) {}
            fn open(
                &self,
                _: &[u8],
                _: &[u8],
                _: &[u8],
                _: &[u8],
                _: &mut Vec<u8>,
            ) -> crate::error::Result<()> {
                Ok(())
            }
            fn box_clone(&self) -> Box<dyn Aead> {
                Box::new(NullAead)
            }
        }

        let factory = sha256_factory();
        let hkdf = Hkdf::new(factory);
        let mut keying = TrafficKeyingMaterial::from_secret(&hkdf, &NullAead, &[0x42u8; 32]);

        let k0 = keying.next_keys().unwrap();
        let k1 = keying.next_keys().unwrap();
        assert_eq!(k0.iv.len(), 12);
        assert_eq!(k0.iv[..11], k1.iv[..11]);
        assert_eq!(k0.iv[11] ^ 1, k1.iv[11]);
        assert_eq!(keying.sequence(), 2);
    }
}
