use bytes::Bytes;

use crate::cipher_suite::{CipherSuite, CipherSuiteParts};
use crate::error::{Result, TlsError};
use crate::hkdf::Hkdf;
use crate::key_schedule::*;
use crate::provider::{Aead, CryptoProvider};
use crate::record::{ContentType, Record, MAX_PLAINTEXT_RECORD_SIZE, TLS_1_2_VERSION};

/// Cipher configuration for one direction of a connection.
///
/// An instance is only ever used for encrypting or for decrypting, never
/// both. A fresh instance starts at sequence number zero.
pub enum CipherEndpointSpec {
    Tls12(crate::cipher_tls12::CipherEndpointSpecTls12),
    Tls13(CipherEndpointSpecTls13),
}

impl CipherEndpointSpec {
    pub fn encrypt(&mut self, record: Record) -> Result<Record> {
        match self {
            Self::Tls12(spec) => spec.encrypt(record),
            Self::Tls13(spec) => spec.encrypt(record),
        }
    }

    pub fn decrypt(&mut self, record: Record) -> Result<Record> {
        match self {
            Self::Tls12(spec) => spec.decrypt(record),
            Self::Tls13(spec) => spec.decrypt(record),
        }
    }
}

/// Defines how to encrypt/decrypt data on one half of a TLS 1.3 connection.
///
/// This is negotiated during the TLS handshake and defines which algorithm to
/// use for encryption, what keys are currently in play, and how the keys will
/// change in the future.
///
/// While this only defines one half of the keys in the connection, the other
/// side will almost always be using the same AEAD and HKDF config.
pub struct CipherEndpointSpecTls13 {
    aead: Box<dyn Aead>,

    hkdf: Hkdf,

    traffic_secret: Bytes,

    /// Derived from the above traffic secret.
    keying: TrafficKeyingMaterial,
}

impl CipherEndpointSpecTls13 {
    pub fn new(aead: Box<dyn Aead>, hkdf: Hkdf, traffic_secret: Bytes) -> Self {
        let keying = TrafficKeyingMaterial::from_secret(&hkdf, aead.as_ref(), &traffic_secret);
        Self {
            aead,
            hkdf,
            traffic_secret,
            keying,
        }
    }

    pub fn traffic_secret(&self) -> &Bytes {
        &self.traffic_secret
    }

    pub fn replace_key(&mut self, traffic_secret: Bytes) {
        self.keying =
            TrafficKeyingMaterial::from_secret(&self.hkdf, self.aead.as_ref(), &traffic_secret);
        self.traffic_secret = traffic_secret;
    }

    /// Switches to the next generation of traffic keys. This corresponds to
    /// sending / receiving a KeyUpdate, so it is only valid after the
    /// handshake.
    ///
    /// application_traffic_secret_N+1 =
    ///        HKDF-Expand-Label(application_traffic_secret_N,
    ///                          "traffic upd", "", Hash.length)
    pub fn update_key(&mut self) {
        let next_secret = hkdf_expand_label(
            &self.hkdf,
            &self.traffic_secret,
            b"traffic upd",
            b"",
            self.hkdf.hash_size() as u16,
        )
        .into();

        self.replace_key(next_secret);
    }

    pub fn encrypt(&mut self, record: Record) -> Result<Record> {
        let typ = ContentType::ApplicationData;

        // How much zero padding to append after the content type byte.
        // TODO: Accept a callback so callers can pad to a block size.
        let padding_size = 0;

        // Total expected size of the ciphertext. One extra plaintext byte at
        // the end carries the real content type.
        let total_size = self.aead.expanded_size(record.data.len() + 1) + padding_size;

        // additional_data = the 5 byte record header as sent.
        let mut additional_data = vec![];
        typ.serialize(&mut additional_data);
        additional_data.extend_from_slice(&record.legacy_record_version.to_be_bytes());
        additional_data.extend_from_slice(&(total_size as u16).to_be_bytes());

        // TLSInnerPlaintext: content || real type || zero padding.
        let mut plaintext = vec![0u8; record.data.len() + 1 + padding_size];
        plaintext[0..record.data.len()].copy_from_slice(&record.data);
        plaintext[record.data.len()] = record.typ.to_u8();

        let key = self.keying.next_keys()?;

        let mut ciphertext = Vec::with_capacity(total_size);
        self.aead.seal(
            &key.key,
            &key.iv,
            &plaintext,
            &additional_data,
            &mut ciphertext,
        );

        assert_eq!(ciphertext.len(), total_size);

        Ok(Record {
            legacy_record_version: record.legacy_record_version,
            typ,
            data: ciphertext.into(),
        })
    }

    pub fn decrypt(&mut self, record: Record) -> Result<Record> {
        // Encrypted records always masquerade as application_data with the
        // frozen legacy version.
        if record.typ != ContentType::ApplicationData {
            return Err(TlsError::unexpected_message(
                "Expected only encrypted application_data records",
            ));
        }
        if record.legacy_record_version != TLS_1_2_VERSION {
            return Err(TlsError::illegal_parameter(
                "Bad legacy version on an encrypted record",
            ));
        }

        let key = self.keying.next_keys()?;

        // additional_data = TLSCiphertext.opaque_type ||
        //     TLSCiphertext.legacy_record_version ||
        //     TLSCiphertext.length
        let mut additional_data = vec![];
        record.typ.serialize(&mut additional_data);
        additional_data.extend_from_slice(&record.legacy_record_version.to_be_bytes());
        additional_data.extend_from_slice(&(record.data.len() as u16).to_be_bytes());

        let mut plaintext = vec![];
        self.aead
            .open(
                &key.key,
                &key.iv,
                &record.data,
                &additional_data,
                &mut plaintext,
            )
            .map_err(|_| TlsError::bad_record_mac("AEAD open failed"))?;

        // The content type is the last non-zero byte. All zeros after it are
        // padding.
        let mut content_type_res = None;
        for i in (0..plaintext.len()).rev() {
            if plaintext[i] != 0 {
                content_type_res = Some(i);
                break;
            }
        }

        let content_type_i = content_type_res
            .ok_or_else(|| TlsError::unexpected_message("Record with all zero plaintext"))?;

        let content_type = ContentType::from_u8(plaintext[content_type_i]);

        plaintext.truncate(content_type_i);

        if plaintext.len() > MAX_PLAINTEXT_RECORD_SIZE {
            return Err(TlsError::record_overflow("Inner plaintext too large"));
        }

        Ok(Record {
            legacy_record_version: record.legacy_record_version,
            typ: content_type,
            data: plaintext.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sha256_factory;

    #[derive(Clone)]
    struct ToyAead;

    impl Aead for ToyAead {
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

        fn box_clone(&self) -> Box<dyn Aead> {
            Box::new(ToyAead)
        }
    }

    fn state(secret: &[u8]) -> CipherEndpointSpecTls13 {
        let hkdf = Hkdf::new(sha256_factory());
        CipherEndpointSpecTls13::new(Box::new(ToyAead), hkdf, Bytes::copy_from_slice(secret))
    }

    fn handshake_record(payload: &[u8]) -> Record {
        Record {
            typ: ContentType::Handshake,
            legacy_record_version: TLS_1_2_VERSION,
            data: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn content_type_is_hidden_and_recovered() {
        let mut write = state(&[0x42u8; 32]);
        let mut read = state(&[0x42u8; 32]);

        let encrypted = write.encrypt(handshake_record(b"finished bytes")).unwrap();
        // On the wire everything claims to be application_data at the frozen
        // legacy version.
        assert_eq!(encrypted.typ, ContentType::ApplicationData);
        assert_eq!(encrypted.legacy_record_version, TLS_1_2_VERSION);

        let decrypted = read.decrypt(encrypted).unwrap();
        assert_eq!(decrypted.typ, ContentType::Handshake);
        assert_eq!(&decrypted.data[..], b"finished bytes");
    }

    #[test]
    fn bad_legacy_version_is_illegal_parameter() {
        let mut write = state(&[0x42u8; 32]);
        let mut read = state(&[0x42u8; 32]);

        let mut encrypted = write.encrypt(handshake_record(b"x")).unwrap();
        encrypted.legacy_record_version = crate::record::TLS_1_0_VERSION;

        let err = read.decrypt(encrypted).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalParameter);
    }

    #[test]
    fn key_update_moves_forward_only() {
        let mut write = state(&[0x42u8; 32]);
        let mut read = state(&[0x42u8; 32]);

        let old_secret = write.traffic_secret().clone();
        let before_update = write.encrypt(handshake_record(b"old")).unwrap();
        read.decrypt(before_update).unwrap();

        write.update_key();
        assert_ne!(write.traffic_secret(), &old_secret);

        // Receiver can't read the rekeyed record until it rotates too.
        let after_update = write.encrypt(handshake_record(b"new")).unwrap();
        let replay = Record {
            typ: after_update.typ,
            legacy_record_version: after_update.legacy_record_version,
            data: after_update.data.clone(),
        };
        assert!(read.decrypt(replay).is_err());

        read.update_key();
        let decrypted = read.decrypt(after_update).unwrap();
        assert_eq!(&decrypted.data[..], b"new");
    }
}

/// Builds the (client_write, server_write) cipher states for one epoch of a
/// TLS 1.3 connection from the two traffic secrets.
pub fn calc_tls13_pending_state(
    cipher_suite: CipherSuite,
    provider: &dyn CryptoProvider,
    client_traffic_secret: Bytes,
    server_traffic_secret: Bytes,
) -> Result<(CipherEndpointSpec, CipherEndpointSpec)> {
    let parts = match cipher_suite.decode(provider)? {
        CipherSuiteParts::Tls13(v) => v,
        CipherSuiteParts::Tls12(_) => {
            return Err(TlsError::internal("Not a TLS 1.3 cipher suite"));
        }
    };

    let hkdf = Hkdf::new(parts.hasher_factory.clone());

    let client = CipherEndpointSpec::Tls13(CipherEndpointSpecTls13::new(
        parts.aead.box_clone(),
        hkdf.clone(),
        client_traffic_secret,
    ));

    let server = CipherEndpointSpec::Tls13(CipherEndpointSpecTls13::new(
        parts.aead,
        hkdf,
        server_traffic_secret,
    ));

    Ok((client, server))
}
