use crate::error::{Result, TlsError};
use crate::provider::{Aead, CryptoProvider, HashAlgorithm, HasherFactory};
use crate::record::{ProtocolVersion, TLS_1_2_VERSION, TLS_1_3_VERSION};

// There's a nice priority list from mozilla here:
// https://wiki.mozilla.org/Security/Cipher_Suites

tls_enum_u16!(
    #[allow(non_camel_case_types)] CipherSuite => {
        // TLS 1.3
        TLS_AES_128_GCM_SHA256 = 0x1301,
        TLS_AES_256_GCM_SHA384 = 0x1302,
        TLS_CHACHA20_POLY1305_SHA256 = 0x1303,
        TLS_AES_128_CCM_SHA256 = 0x1304,
        TLS_AES_128_CCM_8_SHA256 = 0x1305,

        // TLS 1.2 ECDHE: RFC 8422 recommended to implement
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 = 0xc02f,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 = 0xc030,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 = 0xc02b,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 = 0xc02c,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 = 0xcca8,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 = 0xcca9,
        TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA = 0xc013,
        TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA = 0xc014,
        TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA = 0xc009,
        TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA = 0xc00a,
        TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256 = 0xc027,
        TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256 = 0xc023,

        // DHE
        TLS_DHE_RSA_WITH_AES_128_CBC_SHA = 0x0033,
        TLS_DHE_RSA_WITH_AES_256_CBC_SHA = 0x0039,
        TLS_DHE_RSA_WITH_AES_128_CBC_SHA256 = 0x0067,
        TLS_DHE_RSA_WITH_AES_256_CBC_SHA256 = 0x006b,
        TLS_DHE_RSA_WITH_AES_128_GCM_SHA256 = 0x009e,
        TLS_DHE_RSA_WITH_AES_256_GCM_SHA384 = 0x009f,
        TLS_DHE_RSA_WITH_CHACHA20_POLY1305_SHA256 = 0xccaa,

        // Static RSA key transport
        TLS_RSA_WITH_AES_128_CBC_SHA = 0x002f,
        TLS_RSA_WITH_AES_256_CBC_SHA = 0x0035,
        TLS_RSA_WITH_AES_128_CBC_SHA256 = 0x003c,
        TLS_RSA_WITH_AES_128_GCM_SHA256 = 0x009c,
        TLS_RSA_WITH_AES_256_GCM_SHA384 = 0x009d,
        TLS_RSA_WITH_3DES_EDE_CBC_SHA = 0x000a,
        TLS_RSA_WITH_RC4_128_SHA = 0x0005,
        TLS_RSA_WITH_RC4_128_MD5 = 0x0004,

        // Anonymous key exchange (no server authentication)
        TLS_DH_ANON_WITH_AES_128_CBC_SHA = 0x0034,
        TLS_DH_ANON_WITH_AES_256_CBC_SHA = 0x003a,
        TLS_ECDH_ANON_WITH_AES_128_CBC_SHA = 0xc018,
        TLS_ECDH_ANON_WITH_AES_256_CBC_SHA = 0xc019,

        // SRP (RFC 5054)
        TLS_SRP_SHA_WITH_AES_128_CBC_SHA = 0xc01d,
        TLS_SRP_SHA_RSA_WITH_AES_128_CBC_SHA = 0xc01e,
        TLS_SRP_SHA_WITH_AES_256_CBC_SHA = 0xc020,
        TLS_SRP_SHA_RSA_WITH_AES_256_CBC_SHA = 0xc021,

        // Signaling values. Not real suites.
        TLS_EMPTY_RENEGOTIATION_INFO_SCSV = 0x00ff,
        TLS_FALLBACK_SCSV = 0x5600,
    }
);

/// Key exchange family of a cipher suite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyExchangeAlgorithm {
    /// Static RSA key transport.
    Rsa,
    DheRsa,
    EcdheRsa,
    EcdheEcdsa,
    /// Anonymous finite-field DH.
    DhAnon,
    /// Anonymous ECDH.
    EcdhAnon,
    SrpSha,
    SrpShaRsa,
    /// TLS 1.3 suites don't pin a key exchange; it comes from key_share/PSK.
    Tls13,
}

impl KeyExchangeAlgorithm {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::DhAnon | Self::EcdhAnon)
    }

    pub fn certificate_key_type(&self) -> Option<crate::provider::KeyType> {
        use crate::provider::KeyType;
        match self {
            Self::Rsa | Self::DheRsa | Self::EcdheRsa | Self::SrpShaRsa => Some(KeyType::Rsa),
            Self::EcdheEcdsa => Some(KeyType::Ecdsa),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BulkCipher {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    Aes128Ccm,
    Aes128Ccm8,
    Aes128Cbc,
    Aes256Cbc,
    TripleDesCbc,
    Rc4_128,
}

impl BulkCipher {
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            Self::Aes128Gcm | Self::Aes256Gcm | Self::ChaCha20Poly1305 | Self::Aes128Ccm | Self::Aes128Ccm8
        )
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Self::Aes128Cbc | Self::Aes256Cbc | Self::TripleDesCbc)
    }

    pub fn key_size(&self) -> usize {
        match self {
            Self::Aes128Gcm | Self::Aes128Ccm | Self::Aes128Ccm8 | Self::Aes128Cbc => 16,
            Self::Aes256Gcm | Self::Aes256Cbc | Self::ChaCha20Poly1305 => 32,
            Self::TripleDesCbc => 24,
            Self::Rc4_128 => 16,
        }
    }

    /// Length of the per-connection fixed IV material taken out of the TLS
    /// 1.2 key block ('fixed_iv_length'). For CBC in TLS 1.2 the IV is fully
    /// explicit per record, so no key block material is needed.
    pub fn fixed_iv_size(&self) -> usize {
        match self {
            Self::Aes128Gcm | Self::Aes256Gcm | Self::Aes128Ccm | Self::Aes128Ccm8 => 4,
            Self::ChaCha20Poly1305 => 12,
            Self::Aes128Cbc | Self::Aes256Cbc | Self::TripleDesCbc | Self::Rc4_128 => 0,
        }
    }

    pub fn block_size(&self) -> usize {
        match self {
            Self::Aes128Cbc | Self::Aes256Cbc => 16,
            Self::TripleDesCbc => 8,
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// AEAD suites carry no separate MAC.
    Aead,
    Md5,
    Sha1,
    Sha256,
    Sha384,
}

impl MacAlgorithm {
    pub fn hash_algorithm(&self) -> Option<HashAlgorithm> {
        match self {
            Self::Aead => None,
            Self::Md5 => Some(HashAlgorithm::Md5),
            Self::Sha1 => Some(HashAlgorithm::Sha1),
            Self::Sha256 => Some(HashAlgorithm::Sha256),
            Self::Sha384 => Some(HashAlgorithm::Sha384),
        }
    }

    /// MAC key and output size.
    pub fn key_size(&self) -> usize {
        match self {
            Self::Aead => 0,
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
        }
    }
}

impl CipherSuite {
    pub fn is_scsv(&self) -> bool {
        matches!(
            self,
            Self::TLS_EMPTY_RENEGOTIATION_INFO_SCSV | Self::TLS_FALLBACK_SCSV
        )
    }

    pub fn is_tls13(&self) -> bool {
        matches!(self.to_value(), 0x1301..=0x1305)
    }

    pub fn key_exchange(&self) -> KeyExchangeAlgorithm {
        use CipherSuite::*;
        use KeyExchangeAlgorithm::*;
        match self {
            TLS_AES_128_GCM_SHA256
            | TLS_AES_256_GCM_SHA384
            | TLS_CHACHA20_POLY1305_SHA256
            | TLS_AES_128_CCM_SHA256
            | TLS_AES_128_CCM_8_SHA256 => Tls13,

            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
            | TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
            | TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
            | TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA
            | TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA
            | TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256 => EcdheRsa,

            TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
            | TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
            | TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
            | TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA
            | TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA
            | TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256 => EcdheEcdsa,

            TLS_DHE_RSA_WITH_AES_128_CBC_SHA
            | TLS_DHE_RSA_WITH_AES_256_CBC_SHA
            | TLS_DHE_RSA_WITH_AES_128_CBC_SHA256
            | TLS_DHE_RSA_WITH_AES_256_CBC_SHA256
            | TLS_DHE_RSA_WITH_AES_128_GCM_SHA256
            | TLS_DHE_RSA_WITH_AES_256_GCM_SHA384
            | TLS_DHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => DheRsa,

            TLS_RSA_WITH_AES_128_CBC_SHA
            | TLS_RSA_WITH_AES_256_CBC_SHA
            | TLS_RSA_WITH_AES_128_CBC_SHA256
            | TLS_RSA_WITH_AES_128_GCM_SHA256
            | TLS_RSA_WITH_AES_256_GCM_SHA384
            | TLS_RSA_WITH_3DES_EDE_CBC_SHA
            | TLS_RSA_WITH_RC4_128_SHA
            | TLS_RSA_WITH_RC4_128_MD5 => Rsa,

            TLS_DH_ANON_WITH_AES_128_CBC_SHA | TLS_DH_ANON_WITH_AES_256_CBC_SHA => DhAnon,
            TLS_ECDH_ANON_WITH_AES_128_CBC_SHA | TLS_ECDH_ANON_WITH_AES_256_CBC_SHA => EcdhAnon,

            TLS_SRP_SHA_WITH_AES_128_CBC_SHA | TLS_SRP_SHA_WITH_AES_256_CBC_SHA => SrpSha,
            TLS_SRP_SHA_RSA_WITH_AES_128_CBC_SHA | TLS_SRP_SHA_RSA_WITH_AES_256_CBC_SHA => {
                SrpShaRsa
            }

            TLS_EMPTY_RENEGOTIATION_INFO_SCSV | TLS_FALLBACK_SCSV | CipherSuite::Unknown(_) => {
                // SCSVs and unknown suites are filtered out before anything
                // asks for their parts.
                Tls13
            }
        }
    }

    pub fn bulk_cipher(&self) -> BulkCipher {
        use BulkCipher::*;
        use CipherSuite::*;
        match self {
            TLS_AES_128_GCM_SHA256
            | TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
            | TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
            | TLS_DHE_RSA_WITH_AES_128_GCM_SHA256
            | TLS_RSA_WITH_AES_128_GCM_SHA256 => Aes128Gcm,

            TLS_AES_256_GCM_SHA384
            | TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
            | TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
            | TLS_DHE_RSA_WITH_AES_256_GCM_SHA384
            | TLS_RSA_WITH_AES_256_GCM_SHA384 => Aes256Gcm,

            TLS_CHACHA20_POLY1305_SHA256
            | TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
            | TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
            | TLS_DHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => ChaCha20Poly1305,

            TLS_AES_128_CCM_SHA256 => Aes128Ccm,
            TLS_AES_128_CCM_8_SHA256 => Aes128Ccm8,

            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA
            | TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA
            | TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256
            | TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256
            | TLS_DHE_RSA_WITH_AES_128_CBC_SHA
            | TLS_DHE_RSA_WITH_AES_128_CBC_SHA256
            | TLS_RSA_WITH_AES_128_CBC_SHA
            | TLS_RSA_WITH_AES_128_CBC_SHA256
            | TLS_DH_ANON_WITH_AES_128_CBC_SHA
            | TLS_ECDH_ANON_WITH_AES_128_CBC_SHA
            | TLS_SRP_SHA_WITH_AES_128_CBC_SHA
            | TLS_SRP_SHA_RSA_WITH_AES_128_CBC_SHA => Aes128Cbc,

            TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA
            | TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA
            | TLS_DHE_RSA_WITH_AES_256_CBC_SHA
            | TLS_DHE_RSA_WITH_AES_256_CBC_SHA256
            | TLS_RSA_WITH_AES_256_CBC_SHA
            | TLS_DH_ANON_WITH_AES_256_CBC_SHA
            | TLS_ECDH_ANON_WITH_AES_256_CBC_SHA
            | TLS_SRP_SHA_WITH_AES_256_CBC_SHA
            | TLS_SRP_SHA_RSA_WITH_AES_256_CBC_SHA => Aes256Cbc,

            TLS_RSA_WITH_3DES_EDE_CBC_SHA => TripleDesCbc,
            TLS_RSA_WITH_RC4_128_SHA | TLS_RSA_WITH_RC4_128_MD5 => Rc4_128,

            TLS_EMPTY_RENEGOTIATION_INFO_SCSV | TLS_FALLBACK_SCSV | CipherSuite::Unknown(_) => {
                Aes128Gcm
            }
        }
    }

    pub fn mac(&self) -> MacAlgorithm {
        use CipherSuite::*;
        if self.bulk_cipher().is_aead() {
            return MacAlgorithm::Aead;
        }

        match self {
            TLS_RSA_WITH_RC4_128_MD5 => MacAlgorithm::Md5,
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256
            | TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256
            | TLS_DHE_RSA_WITH_AES_128_CBC_SHA256
            | TLS_DHE_RSA_WITH_AES_256_CBC_SHA256
            | TLS_RSA_WITH_AES_128_CBC_SHA256 => MacAlgorithm::Sha256,
            _ => MacAlgorithm::Sha1,
        }
    }

    /// Hash used for the TLS 1.2 PRF and the TLS 1.3 key schedule.
    pub fn prf_hash(&self) -> HashAlgorithm {
        match self {
            CipherSuite::TLS_AES_256_GCM_SHA384
            | CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
            | CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
            | CipherSuite::TLS_DHE_RSA_WITH_AES_256_GCM_SHA384
            | CipherSuite::TLS_RSA_WITH_AES_256_GCM_SHA384 => HashAlgorithm::Sha384,
            _ => HashAlgorithm::Sha256,
        }
    }

    /// Whether the suite may be negotiated under the given protocol version.
    pub fn usable_with_version(&self, version: ProtocolVersion) -> bool {
        if self.is_scsv() || matches!(self, CipherSuite::Unknown(_)) {
            return false;
        }

        if version >= TLS_1_3_VERSION {
            return self.is_tls13();
        }

        if self.is_tls13() {
            return false;
        }

        // SHA-256 based CBC suites and all AEAD suites require TLS 1.2.
        if version < TLS_1_2_VERSION {
            return !self.bulk_cipher().is_aead() && self.mac() != MacAlgorithm::Sha256;
        }

        true
    }

    pub fn decode(&self, provider: &dyn CryptoProvider) -> Result<CipherSuiteParts> {
        if self.is_scsv() || matches!(self, CipherSuite::Unknown(_)) {
            return Err(TlsError::internal("Not a real cipher suite"));
        }

        let hasher_factory = provider.hasher_factory(self.prf_hash())?;

        if self.is_tls13() {
            return Ok(CipherSuiteParts::Tls13(CipherSuiteTls13 {
                aead: provider.aead(self.bulk_cipher())?,
                hasher_factory,
            }));
        }

        Ok(CipherSuiteParts::Tls12(CipherSuiteTls12 {
            key_exchange: self.key_exchange(),
            bulk_cipher: self.bulk_cipher(),
            mac: self.mac(),
            hasher_factory,
        }))
    }
}

pub enum CipherSuiteParts {
    Tls12(CipherSuiteTls12),
    Tls13(CipherSuiteTls13),
}

pub struct CipherSuiteTls12 {
    pub key_exchange: KeyExchangeAlgorithm,
    pub bulk_cipher: BulkCipher,
    pub mac: MacAlgorithm,

    /// Hasher used with the standard TLS 1.2 PRF and for creating the
    /// handshake transcript hash.
    pub hasher_factory: HasherFactory,
}

pub struct CipherSuiteTls13 {
    pub aead: Box<dyn Aead>,
    pub hasher_factory: HasherFactory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_for_mandatory_suites() {
        let s = CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256;
        assert_eq!(s.to_value(), 0xc02f);
        assert_eq!(s.key_exchange(), KeyExchangeAlgorithm::EcdheRsa);
        assert_eq!(s.bulk_cipher(), BulkCipher::Aes128Gcm);
        assert_eq!(s.mac(), MacAlgorithm::Aead);
        assert_eq!(s.prf_hash(), HashAlgorithm::Sha256);
        assert!(s.usable_with_version(TLS_1_2_VERSION));
        assert!(!s.usable_with_version(TLS_1_3_VERSION));

        let s = CipherSuite::TLS_AES_256_GCM_SHA384;
        assert!(s.is_tls13());
        assert_eq!(s.prf_hash(), HashAlgorithm::Sha384);
        assert!(s.usable_with_version(TLS_1_3_VERSION));
        assert!(!s.usable_with_version(TLS_1_2_VERSION));
    }

    #[test]
    fn scsv_never_negotiable() {
        assert!(CipherSuite::TLS_FALLBACK_SCSV.is_scsv());
        assert!(!CipherSuite::TLS_FALLBACK_SCSV.usable_with_version(TLS_1_2_VERSION));
        assert!(!CipherSuite::TLS_EMPTY_RENEGOTIATION_INFO_SCSV.usable_with_version(TLS_1_2_VERSION));
    }

    #[test]
    fn unknown_suites_roundtrip() {
        let s = CipherSuite::from_value(0x1234);
        assert_eq!(s, CipherSuite::Unknown(0x1234));
        assert_eq!(s.to_value(), 0x1234);
        assert!(!s.usable_with_version(TLS_1_2_VERSION));
    }
}
