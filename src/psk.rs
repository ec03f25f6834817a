// PSK binder computation/verification, server side PSK selection, and the
// server's ticket sealing.
// https://tools.ietf.org/html/rfc8446#section-4.2.11

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::cipher_suite::{BulkCipher, CipherSuite};
use crate::error::{Result, TlsError};
use crate::extensions::OfferedPsks;
use crate::handshake::{ClientHello, Handshake};
use crate::hkdf::Hkdf;
use crate::hmac::hmac_hash;
use crate::key_schedule::{hkdf_expand_label, KeySchedule, PskKind};
use crate::parsing::*;
use crate::provider::{CryptoProvider, HasherFactory, SecureRandom};
use crate::transcript::Transcript;
use crate::utils::constant_time_eq;

/// Everything needed to compute one identity's binder.
pub struct BinderParams {
    pub secret: Vec<u8>,
    pub kind: PskKind,
    pub hasher_factory: HasherFactory,
}

/// binder = HMAC(finished_key, Transcript-Hash(truncated ClientHello))
/// where finished_key hangs off the binder key of the early secret.
pub fn compute_binder(params: &BinderParams, truncated_transcript_hash: &[u8]) -> Vec<u8> {
    let hkdf = Hkdf::new(params.hasher_factory.clone());

    let mut schedule = KeySchedule::new(hkdf.clone(), params.hasher_factory.clone());
    schedule.early_secret(Some(&params.secret));
    let binder_key = schedule.binder_key(params.kind);

    let finished_key = hkdf_expand_label(
        &hkdf,
        &binder_key,
        b"finished",
        b"",
        hkdf.hash_size() as u16,
    );

    hmac_hash(
        &params.hasher_factory,
        &finished_key,
        truncated_transcript_hash,
    )
}

/// Transcript hash over everything before this ClientHello plus the
/// ClientHello itself truncated just before its binders list. The truncation
/// boundary is recomputed from the extension's on-wire layout rather than
/// trusted from any cached offset.
pub fn truncated_transcript_hash(
    transcript_before_ch: &Transcript,
    client_hello_bytes: &Bytes,
    offered: &OfferedPsks,
    hasher_factory: &HasherFactory,
) -> Result<Vec<u8>> {
    let binders_len = offered.binders_wire_len();
    if binders_len >= client_hello_bytes.len() {
        return Err(TlsError::decode_error("Binders longer than the ClientHello"));
    }

    let mut t = transcript_before_ch.copy();
    t.push(client_hello_bytes.clone());
    Ok(t.hash_truncated(hasher_factory, client_hello_bytes.len() - binders_len))
}

/// Client side: replaces the placeholder binders in the hello's
/// pre_shared_key extension with real ones. The extension must already carry
/// one placeholder binder (of the right hash length) per identity.
pub fn fill_binders(
    client_hello: &mut ClientHello,
    transcript_before_ch: &Transcript,
    params: &[BinderParams],
) -> Result<()> {
    let serialized = Handshake::ClientHello(client_hello.clone()).to_bytes();

    let offered = match client_hello.extensions.last_mut() {
        Some(crate::extensions::Extension::PreSharedKeyClientHello(v)) => v,
        _ => {
            return Err(TlsError::internal(
                "pre_shared_key is not the last extension",
            ))
        }
    };

    if offered.binders.len() != params.len() {
        return Err(TlsError::internal("Binder count mismatch"));
    }

    for (i, p) in params.iter().enumerate() {
        let hash =
            truncated_transcript_hash(transcript_before_ch, &serialized, offered, &p.hasher_factory)?;
        offered.binders[i] = compute_binder(p, &hash).into();
    }

    Ok(())
}

/// Server side: recomputes and checks the selected identity's binder.
/// Mismatches are fatal per RFC 8446.
pub fn verify_binder(
    params: &BinderParams,
    transcript_before_ch: &Transcript,
    client_hello_bytes: &Bytes,
    offered: &OfferedPsks,
    index: usize,
) -> Result<()> {
    let hash = truncated_transcript_hash(
        transcript_before_ch,
        client_hello_bytes,
        offered,
        &params.hasher_factory,
    )?;

    let expected = compute_binder(params, &hash);
    let received = offered
        .binders
        .get(index)
        .ok_or_else(|| TlsError::illegal_parameter("Binder index out of range"))?;

    if !constant_time_eq(&expected, received) {
        return Err(TlsError::local(
            crate::error::ErrorKind::DecryptionFailed,
            crate::alert::AlertDescription::decrypt_error,
            "PSK binder verification failed",
        ));
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Server side ticket sealing.
//
// Tickets are opaque to clients: an AEAD sealed state blob. The first
// configured ticket key seals new tickets; every configured key is tried
// when unsealing, so key rotation just prepends a new key.
////////////////////////////////////////////////////////////////////////////////

fn ticket_aead_key(provider: &dyn CryptoProvider, key_material: &[u8]) -> Result<(Vec<u8>, usize)> {
    let aead = provider.aead(BulkCipher::Aes256Gcm)?;
    let hkdf = Hkdf::new(provider.hasher_factory(crate::provider::HashAlgorithm::Sha256)?);

    let prk = hkdf.extract(b"ticket", key_material);
    let key = hkdf.expand(&prk, b"ticket key", aead.key_size());
    Ok((key, aead.nonce_size()))
}

pub fn seal_ticket(
    provider: &dyn CryptoProvider,
    key_material: &[u8],
    plaintext: &[u8],
    rng: &dyn SecureRandom,
) -> Result<Bytes> {
    let aead = provider.aead(BulkCipher::Aes256Gcm)?;
    let (key, nonce_size) = ticket_aead_key(provider, key_material)?;

    let mut nonce = vec![0u8; nonce_size];
    rng.fill(&mut nonce);

    let mut sealed = vec![];
    aead.seal(&key, &nonce, plaintext, b"", &mut sealed);

    let mut ticket = nonce;
    ticket.extend_from_slice(&sealed);
    Ok(ticket.into())
}

pub fn unseal_ticket(
    provider: &dyn CryptoProvider,
    key_materials: &[Bytes],
    ticket: &[u8],
) -> Option<Vec<u8>> {
    let aead = provider.aead(BulkCipher::Aes256Gcm).ok()?;
    let nonce_size = aead.nonce_size();

    if ticket.len() < nonce_size + aead.tag_size() {
        return None;
    }

    let (nonce, sealed) = ticket.split_at(nonce_size);

    for key_material in key_materials {
        let (key, _) = ticket_aead_key(provider, key_material).ok()?;

        let mut plaintext = vec![];
        if aead.open(&key, nonce, sealed, b"", &mut plaintext).is_ok() {
            return Some(plaintext);
        }
    }

    None
}

/// State sealed into a TLS 1.3 ticket.
pub struct TicketStateTls13 {
    pub psk: Bytes,
    pub cipher_suite: CipherSuite,
    pub age_add: u32,
    pub lifetime: u32,
    pub created_unix: u64,
}

impl TicketStateTls13 {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(1); // state version discriminator: TLS 1.3
        self.cipher_suite.serialize(out);
        out.extend_from_slice(&self.age_add.to_be_bytes());
        out.extend_from_slice(&self.lifetime.to_be_bytes());
        out.extend_from_slice(&self.created_unix.to_be_bytes());
        serialize_varlen_vector(1, U8_LIMIT, out, |out| out.extend_from_slice(&self.psk));
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(Bytes::copy_from_slice(data));
        if r.next_u8()? != 1 {
            return Err(TlsError::decode_error("Not a TLS 1.3 ticket state"));
        }

        let cipher_suite = CipherSuite::parse(&mut r)?;
        let age_add = r.next_u32()?;
        let lifetime = r.next_u32()?;
        let created_unix = r.next_u64()?;
        let psk = r.varlen_vector(1, U8_LIMIT)?;
        r.finish()?;

        Ok(Self {
            psk,
            cipher_suite,
            age_add,
            lifetime,
            created_unix,
        })
    }

    pub fn expired(&self, now: SystemTime) -> bool {
        let now_unix = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now_unix.saturating_sub(self.created_unix) > self.lifetime as u64
    }
}

/// State sealed into an RFC 5077 (TLS 1.2) ticket: the resumable session
/// blob plus freshness bounds.
pub struct TicketStateTls12 {
    pub session_blob: Bytes,
    pub lifetime: u32,
    pub created_unix: u64,
}

impl TicketStateTls12 {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(2); // state version discriminator: TLS 1.2
        out.extend_from_slice(&self.lifetime.to_be_bytes());
        out.extend_from_slice(&self.created_unix.to_be_bytes());
        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.session_blob)
        });
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(Bytes::copy_from_slice(data));
        if r.next_u8()? != 2 {
            return Err(TlsError::decode_error("Not a TLS 1.2 ticket state"));
        }

        let lifetime = r.next_u32()?;
        let created_unix = r.next_u64()?;
        let session_blob = r.varlen_vector(0, U16_LIMIT)?;
        r.finish()?;

        Ok(Self {
            session_blob,
            lifetime,
            created_unix,
        })
    }

    pub fn expired(&self, now: SystemTime) -> bool {
        let now_unix = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now_unix.saturating_sub(self.created_unix) > self.lifetime as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{Extension, PskIdentity};
    use crate::testing::sha256_factory;

    fn offered(binder_len: usize) -> OfferedPsks {
        OfferedPsks {
            identities: vec![PskIdentity {
                identity: Bytes::from_static(b"alpha"),
                obfuscated_ticket_age: 0,
            }],
            binders: vec![Bytes::from(vec![0u8; binder_len])],
        }
    }

    fn hello_with_psk() -> ClientHello {
        ClientHello {
            legacy_version: crate::record::TLS_1_2_VERSION,
            random: Bytes::from(vec![1u8; 32]),
            legacy_session_id: Bytes::from(vec![2u8; 32]),
            cipher_suites: vec![CipherSuite::TLS_AES_128_GCM_SHA256],
            legacy_compression_methods: Bytes::from_static(&[0]),
            extensions: vec![Extension::PreSharedKeyClientHello(offered(32))],
        }
    }

    #[test]
    fn binder_roundtrip() {
        let params = BinderParams {
            secret: vec![0x17u8; 32],
            kind: PskKind::External,
            hasher_factory: sha256_factory(),
        };

        let mut ch = hello_with_psk();
        let transcript = Transcript::new();

        fill_binders(&mut ch, &transcript, &[params]).unwrap();

        // The server sees the final serialized hello.
        let ch_bytes = Handshake::ClientHello(ch.clone()).to_bytes();
        let offered = match &ch.extensions[0] {
            Extension::PreSharedKeyClientHello(v) => v.clone(),
            _ => unreachable!(),
        };

        let params = BinderParams {
            secret: vec![0x17u8; 32],
            kind: PskKind::External,
            hasher_factory: sha256_factory(),
        };
        verify_binder(&params, &transcript, &ch_bytes, &offered, 0).unwrap();

        // Wrong secret fails.
        let bad = BinderParams {
            secret: vec![0x18u8; 32],
            kind: PskKind::External,
            hasher_factory: sha256_factory(),
        };
        assert!(verify_binder(&bad, &transcript, &ch_bytes, &offered, 0).is_err());
    }

    #[test]
    fn binder_covers_identity_bytes() {
        let params = BinderParams {
            secret: vec![0x17u8; 32],
            kind: PskKind::External,
            hasher_factory: sha256_factory(),
        };

        let mut ch = hello_with_psk();
        let transcript = Transcript::new();
        fill_binders(
            &mut ch,
            &transcript,
            &[BinderParams {
                secret: params.secret.clone(),
                kind: params.kind,
                hasher_factory: params.hasher_factory.clone(),
            }],
        )
        .unwrap();

        // Tamper with the identity after binding.
        if let Extension::PreSharedKeyClientHello(v) = &mut ch.extensions[0] {
            v.identities[0].identity = Bytes::from_static(b"omega");
        }

        let ch_bytes = Handshake::ClientHello(ch.clone()).to_bytes();
        let offered = match &ch.extensions[0] {
            Extension::PreSharedKeyClientHello(v) => v.clone(),
            _ => unreachable!(),
        };

        assert!(verify_binder(&params, &transcript, &ch_bytes, &offered, 0).is_err());
    }

    #[test]
    fn ticket_state_roundtrip() {
        let state = TicketStateTls13 {
            psk: Bytes::from(vec![5u8; 32]),
            cipher_suite: CipherSuite::TLS_AES_128_GCM_SHA256,
            age_add: 0xdeadbeef,
            lifetime: 7200,
            created_unix: 1_700_000_000,
        };

        let mut blob = vec![];
        state.serialize(&mut blob);
        let parsed = TicketStateTls13::parse(&blob).unwrap();

        assert_eq!(parsed.psk, state.psk);
        assert_eq!(parsed.cipher_suite, state.cipher_suite);
        assert_eq!(parsed.age_add, 0xdeadbeef);
        assert!(!parsed.expired(UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_100)));
        assert!(parsed.expired(UNIX_EPOCH + std::time::Duration::from_secs(1_700_010_000)));

        // A 1.2 state blob is not accepted as a 1.3 one.
        let state12 = TicketStateTls12 {
            session_blob: Bytes::from_static(b"blob"),
            lifetime: 100,
            created_unix: 0,
        };
        let mut blob12 = vec![];
        state12.serialize(&mut blob12);
        assert!(TicketStateTls13::parse(&blob12).is_err());
    }
}
