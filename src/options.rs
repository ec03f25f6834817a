use std::sync::Arc;

use bytes::Bytes;

use crate::cipher_suite::{BulkCipher, CipherSuite, KeyExchangeAlgorithm, MacAlgorithm};
use crate::error::{Result, TlsError};
use crate::extensions::{ECPointFormat, NamedGroup, PskKeyExchangeMode, SignatureScheme};
use crate::key_exchange::SrpDatabase;
use crate::provider::{CryptoProvider, HashAlgorithm, PrivateKey};
use crate::record::{ProtocolVersion, TLS_1_2_VERSION, TLS_1_3_VERSION};
use crate::session::{Session, SessionCache};

/// An externally configured PSK (identity, secret, PRF hash).
#[derive(Clone)]
pub struct PskConfig {
    pub identity: Bytes,
    pub secret: Bytes,
    pub hash: HashAlgorithm,
}

/// A certificate chain (leaf first) plus its private key. Parsing and chain
/// validation happen outside the engine.
#[derive(Clone)]
pub struct CertificateAuth {
    pub chain: Vec<Bytes>,
    pub private_key: Arc<dyn PrivateKey>,
}

/// Knobs shared between the client and server sides. The defaults from
/// recommended() describe a contemporary, interoperable configuration;
/// everything is overridable for testing against odd peers.
#[derive(Clone)]
pub struct Settings {
    pub min_version: ProtocolVersion,
    pub max_version: ProtocolVersion,

    /// Offered/accepted cipher suites in preference order, before the
    /// filters below are applied.
    pub cipher_suites: Vec<CipherSuite>,

    /// Suite filters: a suite survives only if its key exchange family,
    /// bulk cipher and MAC are all listed.
    pub key_exchange_names: Vec<KeyExchangeAlgorithm>,
    pub cipher_names: Vec<BulkCipher>,
    pub mac_names: Vec<MacAlgorithm>,

    /// ECDHE curve preference list.
    pub ecc_curves: Vec<NamedGroup>,
    /// FFDHE group preference list (RFC 7919 names).
    pub dh_groups: Vec<NamedGroup>,
    /// Groups to send actual key shares for in the TLS 1.3 ClientHello.
    pub key_shares: Vec<NamedGroup>,

    pub rsa_sig_hashes: Vec<HashAlgorithm>,
    pub ecdsa_sig_hashes: Vec<HashAlgorithm>,
    pub dsa_sig_hashes: Vec<HashAlgorithm>,
    /// Schemes advertised verbatim on top of the hash-derived ones
    /// (ed25519, PSS-PSS variants, ...).
    pub more_sig_schemes: Vec<SignatureScheme>,

    pub ec_point_formats: Vec<ECPointFormat>,

    /// DH/SRP prime size bounds in bits.
    pub min_key_size: usize,
    pub max_key_size: usize,

    pub use_extended_master_secret: bool,
    pub require_extended_master_secret: bool,
    pub use_encrypt_then_mac: bool,

    pub send_fallback_scsv: bool,

    pub psk_configs: Vec<PskConfig>,
    pub psk_modes: Vec<PskKeyExchangeMode>,

    /// Server side ticket sealing keys. First key seals; all keys unseal.
    /// Empty disables ticket issuance.
    pub ticket_keys: Vec<Bytes>,
    pub ticket_lifetime: u32,
    pub ticket_count: usize,

    /// If > 0, advertise the RFC 8449 record_size_limit extension.
    pub record_size_limit: u16,

    /// RFC 6520.
    pub use_heartbeat_extension: bool,
}

impl Settings {
    pub fn recommended() -> Self {
        Self {
            min_version: TLS_1_2_VERSION,
            max_version: TLS_1_3_VERSION,

            cipher_suites: vec![
                // TLS 1.3, RFC 8446 section 9.1 order.
                CipherSuite::TLS_AES_128_GCM_SHA256,
                CipherSuite::TLS_AES_256_GCM_SHA384,
                CipherSuite::TLS_CHACHA20_POLY1305_SHA256,
                // TLS 1.2 ECDHE AEAD suites.
                CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                CipherSuite::TLS_DHE_RSA_WITH_AES_128_GCM_SHA256,
                // CBC fallbacks.
                CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
                CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA,
            ],

            key_exchange_names: vec![
                KeyExchangeAlgorithm::Tls13,
                KeyExchangeAlgorithm::EcdheEcdsa,
                KeyExchangeAlgorithm::EcdheRsa,
                KeyExchangeAlgorithm::DheRsa,
                KeyExchangeAlgorithm::Rsa,
            ],
            cipher_names: vec![
                BulkCipher::Aes128Gcm,
                BulkCipher::Aes256Gcm,
                BulkCipher::ChaCha20Poly1305,
                BulkCipher::Aes128Ccm,
                BulkCipher::Aes128Ccm8,
                BulkCipher::Aes128Cbc,
                BulkCipher::Aes256Cbc,
            ],
            mac_names: vec![
                MacAlgorithm::Aead,
                MacAlgorithm::Sha256,
                MacAlgorithm::Sha384,
                MacAlgorithm::Sha1,
            ],

            ecc_curves: vec![
                NamedGroup::x25519,
                NamedGroup::secp256r1,
                NamedGroup::secp384r1,
            ],
            dh_groups: vec![NamedGroup::ffdhe2048, NamedGroup::ffdhe3072],
            key_shares: vec![NamedGroup::x25519],

            rsa_sig_hashes: vec![HashAlgorithm::Sha256, HashAlgorithm::Sha384, HashAlgorithm::Sha512],
            ecdsa_sig_hashes: vec![HashAlgorithm::Sha256, HashAlgorithm::Sha384],
            dsa_sig_hashes: vec![],
            more_sig_schemes: vec![SignatureScheme::ed25519],

            ec_point_formats: vec![ECPointFormat::uncompressed],

            min_key_size: 1023,
            max_key_size: 8193,

            use_extended_master_secret: true,
            require_extended_master_secret: false,
            use_encrypt_then_mac: true,

            send_fallback_scsv: false,

            psk_configs: vec![],
            psk_modes: vec![PskKeyExchangeMode::psk_dhe_ke, PskKeyExchangeMode::psk_ke],

            ticket_keys: vec![],
            ticket_lifetime: 7200,
            ticket_count: 2,

            record_size_limit: 0,

            use_heartbeat_extension: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_version > self.max_version {
            return Err(TlsError::internal("min_version above max_version"));
        }

        // The handshake itself only runs at 1.2/1.3. Anything older exists
        // purely as record framing tolerance.
        if self.min_version < TLS_1_2_VERSION || self.max_version > TLS_1_3_VERSION {
            return Err(TlsError::internal(
                "Only TLS 1.2 and 1.3 handshakes are supported",
            ));
        }

        if self.min_key_size < 512 || self.max_key_size > 16384 {
            return Err(TlsError::internal("Unreasonable key size bounds"));
        }

        Ok(())
    }

    /// Applies the name filters and version bounds to the configured suite
    /// list.
    pub fn effective_cipher_suites(&self) -> Vec<CipherSuite> {
        self.cipher_suites
            .iter()
            .copied()
            .filter(|s| {
                !s.is_scsv()
                    && self.key_exchange_names.contains(&s.key_exchange())
                    && self.cipher_names.contains(&s.bulk_cipher())
                    && self.mac_names.contains(&s.mac())
                    && (s.usable_with_version(self.max_version)
                        || s.usable_with_version(self.min_version))
            })
            .collect()
    }

    /// The signature_algorithms advertisement derived from the per-key-type
    /// hash lists plus the extra schemes.
    pub fn supported_signature_schemes(&self) -> Vec<SignatureScheme> {
        let mut out = vec![];

        for h in &self.ecdsa_sig_hashes {
            out.push(match h {
                HashAlgorithm::Sha256 => SignatureScheme::ecdsa_secp256r1_sha256,
                HashAlgorithm::Sha384 => SignatureScheme::ecdsa_secp384r1_sha384,
                HashAlgorithm::Sha512 => SignatureScheme::ecdsa_secp521r1_sha512,
                HashAlgorithm::Sha1 => SignatureScheme::ecdsa_sha1,
                _ => continue,
            });
        }

        for h in &self.rsa_sig_hashes {
            out.push(match h {
                HashAlgorithm::Sha256 => SignatureScheme::rsa_pss_rsae_sha256,
                HashAlgorithm::Sha384 => SignatureScheme::rsa_pss_rsae_sha384,
                HashAlgorithm::Sha512 => SignatureScheme::rsa_pss_rsae_sha512,
                _ => continue,
            });
        }

        for h in &self.rsa_sig_hashes {
            out.push(match h {
                HashAlgorithm::Sha256 => SignatureScheme::rsa_pkcs1_sha256,
                HashAlgorithm::Sha384 => SignatureScheme::rsa_pkcs1_sha384,
                HashAlgorithm::Sha512 => SignatureScheme::rsa_pkcs1_sha512,
                HashAlgorithm::Sha1 => SignatureScheme::rsa_pkcs1_sha1,
                _ => continue,
            });
        }

        for h in &self.dsa_sig_hashes {
            out.push(match h {
                HashAlgorithm::Sha256 => SignatureScheme::dsa_sha256,
                HashAlgorithm::Sha1 => SignatureScheme::dsa_sha1,
                _ => continue,
            });
        }

        for s in &self.more_sig_schemes {
            if !out.contains(s) {
                out.push(*s);
            }
        }

        out
    }

    pub fn supports_tls13(&self) -> bool {
        self.max_version >= TLS_1_3_VERSION
    }

    pub fn supports_tls12(&self) -> bool {
        self.min_version <= TLS_1_2_VERSION
    }
}

/// Configuration for how a TLS client negotiates a handshake with a remote
/// server.
#[derive(Clone)]
pub struct ClientOptions {
    pub settings: Settings,

    /// DNS name of the remote server. e.g. "example.com". Empty disables
    /// SNI (connecting by IP address).
    pub hostname: String,

    /// ALPN ids in descending preference order.
    pub alpn_ids: Vec<Bytes>,

    /// A previous session to offer for resumption.
    pub resume_session: Option<Session>,

    /// Client certificate used if the server asks for one.
    pub certificate_auth: Option<CertificateAuth>,

    /// SRP credentials (username, password).
    pub srp_credentials: Option<(Bytes, Bytes)>,

    pub provider: Arc<dyn CryptoProvider>,

    pub session_cache: Option<Arc<dyn SessionCache>>,
}

impl ClientOptions {
    pub fn recommended(provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            settings: Settings::recommended(),
            hostname: String::new(),
            alpn_ids: vec![],
            resume_session: None,
            certificate_auth: None,
            srp_credentials: None,
            provider,
            session_cache: None,
        }
    }
}

/// Configuration for the server side.
#[derive(Clone)]
pub struct ServerOptions {
    pub settings: Settings,

    /// The server certificate. Optional only for anonymous and PSK-only
    /// deployments.
    pub certificate_auth: Option<CertificateAuth>,

    /// Ask connecting clients for a certificate.
    pub request_client_certificate: bool,

    pub alpn_ids: Vec<Bytes>,

    /// Cached OCSP staple sent when the client asks via status_request.
    pub ocsp_response: Option<Bytes>,

    pub srp_database: Option<Arc<dyn SrpDatabase>>,

    pub provider: Arc<dyn CryptoProvider>,

    pub session_cache: Option<Arc<dyn SessionCache>>,
}

impl ServerOptions {
    pub fn recommended(provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            settings: Settings::recommended(),
            certificate_auth: None,
            request_client_certificate: false,
            alpn_ids: vec![],
            ocsp_response: None,
            srp_database: None,
            provider,
            session_cache: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_drop_unlisted_families() {
        let mut s = Settings::recommended();
        s.cipher_suites = vec![
            CipherSuite::TLS_AES_128_GCM_SHA256,
            CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            CipherSuite::TLS_RSA_WITH_RC4_128_SHA, // Rc4 not in cipher_names
            CipherSuite::TLS_SRP_SHA_WITH_AES_128_CBC_SHA, // SrpSha not in kx names
        ];

        let effective = s.effective_cipher_suites();
        assert!(effective.contains(&CipherSuite::TLS_AES_128_GCM_SHA256));
        assert!(effective.contains(&CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256));
        assert!(!effective.contains(&CipherSuite::TLS_RSA_WITH_RC4_128_SHA));
        assert!(!effective.contains(&CipherSuite::TLS_SRP_SHA_WITH_AES_128_CBC_SHA));
    }

    #[test]
    fn signature_schemes_follow_hash_lists() {
        let mut s = Settings::recommended();
        s.rsa_sig_hashes = vec![HashAlgorithm::Sha256];
        s.ecdsa_sig_hashes = vec![HashAlgorithm::Sha384];
        s.more_sig_schemes = vec![];

        let schemes = s.supported_signature_schemes();
        assert_eq!(
            schemes,
            vec![
                SignatureScheme::ecdsa_secp384r1_sha384,
                SignatureScheme::rsa_pss_rsae_sha256,
                SignatureScheme::rsa_pkcs1_sha256,
            ]
        );
    }

    #[test]
    fn validate_rejects_legacy_floor() {
        let mut s = Settings::recommended();
        assert!(s.validate().is_ok());

        s.min_version = crate::record::TLS_1_0_VERSION;
        assert!(s.validate().is_err());
    }
}
