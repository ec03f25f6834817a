// Key exchange methods for TLS 1.2 (ServerKeyExchange / ClientKeyExchange)
// and the key_share computations for TLS 1.3, including the hybrid KEM
// groups.

use std::sync::Arc;

use bytes::Bytes;
use lazy_static::lazy_static;
use num_bigint::BigUint;

use crate::error::{Result, TlsError};
use crate::extensions::{KeyShareEntry, NamedGroup};
use crate::parsing::*;
use crate::provider::*;
use crate::record::ProtocolVersion;

////////////////////////////////////////////////////////////////////////////////
// Finite field group tables.
//
// Two lineages are kept: the RFC 7919 groups negotiated through
// supported_groups, and the older RFC 3526 MODP groups used as the server
// fallback when the client advertises nothing usable. The bit-size bounds
// from the settings are applied in one place (check_dh_prime) regardless of
// where the prime came from.
////////////////////////////////////////////////////////////////////////////////

pub struct DhGroup {
    pub p: BigUint,
    pub g: BigUint,
}

pub struct SrpGroup {
    pub n: BigUint,
    pub g: BigUint,
}

fn biguint_from_hex(s: &str) -> BigUint {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    BigUint::parse_bytes(cleaned.as_bytes(), 16).unwrap()
}

const FFDHE2048_HEX: &str = "
    FFFFFFFF FFFFFFFF ADF85458 A2BB4A9A AFDC5620 273D3CF1
    D8B9C583 CE2D3695 A9E13641 146433FB CC939DCE 249B3EF9
    7D2FE363 630C75D8 F681B202 AEC4617A D3DF1ED5 D5FD6561
    2433F51F 5F066ED0 85636555 3DED1AF3 B557135E 7F57C935
    984F0C70 E0E68B77 E2A689DA F3EFE872 1DF158A1 36ADE735
    30ACCA4F 483A797A BC0AB182 B324FB61 D108A94B B2C8E3FB
    B96ADAB7 60D7F468 1D4F42A3 DE394DF4 AE56EDE7 6372BB19
    0B07A7C8 EE0A6D70 9E02FCE1 CDF7E2EC C03404CD 28342F61
    9172FE9C E98583FF 8E4F1232 EEF28183 C3FE3B1B 4C6FAD73
    3BB5FCBC 2EC22005 C58EF183 7D1683B2 C6F34A26 C1B2EFFA
    886B4238 61285C97 FFFFFFFF FFFFFFFF";

const FFDHE3072_HEX: &str = "
    FFFFFFFF FFFFFFFF ADF85458 A2BB4A9A AFDC5620 273D3CF1
    D8B9C583 CE2D3695 A9E13641 146433FB CC939DCE 249B3EF9
    7D2FE363 630C75D8 F681B202 AEC4617A D3DF1ED5 D5FD6561
    2433F51F 5F066ED0 85636555 3DED1AF3 B557135E 7F57C935
    984F0C70 E0E68B77 E2A689DA F3EFE872 1DF158A1 36ADE735
    30ACCA4F 483A797A BC0AB182 B324FB61 D108A94B B2C8E3FB
    B96ADAB7 60D7F468 1D4F42A3 DE394DF4 AE56EDE7 6372BB19
    0B07A7C8 EE0A6D70 9E02FCE1 CDF7E2EC C03404CD 28342F61
    9172FE9C E98583FF 8E4F1232 EEF28183 C3FE3B1B 4C6FAD73
    3BB5FCBC 2EC22005 C58EF183 7D1683B2 C6F34A26 C1B2EFFA
    886B4238 611FCFDC DE355B3B 6519035B BC34F4DE F99C0238
    61B46FC9 D6E6C907 7AD91D26 91F7F7EE 598CB0FA C186D91C
    AEFE1309 85139270 B4130C93 BC437944 F4FD4452 E2D74DD3
    64F2E21E 71F54BFF 5CAE82AB 9C9DF69E E86D2BC5 22363A0D
    ABC52197 9B0DEADA 1DBF9A42 D5C4484E 0ABCD06B FA53DDEF
    3C1B20EE 3FD59D7C 25E41D2B 66C62E37 FFFFFFFF FFFFFFFF";

// RFC 3526, group 14.
const MODP2048_HEX: &str = "
    FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
    29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
    EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
    E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
    EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE45B3D
    C2007CB8 A163BF05 98DA4836 1C55D39A 69163FA8 FD24CF5F
    83655D23 DCA3AD96 1C62F356 208552BB 9ED52907 7096966D
    670C354E 4ABC9804 F1746C08 CA18217C 32905E46 2E36CE3B
    E39E772C 180E8603 9B2783A2 EC07A28F B5C55DF0 6F4C52C9
    DE2BCBF6 95581718 3995497C EA956AE5 15D22618 98FA0510
    15728E5A 8AACAA68 FFFFFFFF FFFFFFFF";

// RFC 5054, appendix A.
const SRP1024_HEX: &str = "
    EEAF0AB9 ADB38DD6 9C33F80A FA8FC5E8 60726187 75FF3C0B
    9EA2314C 9C256576 D674DF74 96EA81D3 383B4813 D692C6E0
    E0D5D8E2 50B98BE4 8E495C1D 6089DAD1 5DC7D7B4 6154D6B6
    CE8EF4AD 69B15D49 82559B29 7BCF1885 C529F566 660E57EC
    68EDBC3C 05726CC0 2FD4CBF4 976EAA9A FD5138FE 8376435B
    9FC61D2F C0EB06E3";

const SRP2048_HEX: &str = "
    AC6BDB41 324A9A9B F166DE5E 1389582F AF72B665 1987EE07
    FC319294 3DB56050 A37329CB B4A099ED 8193E075 7767A13D
    D52312AB 4B03310D CD7F48A9 DA04FD50 E8083969 EDB767B0
    CF609517 9A163AB3 661A05FB D5FAAAE8 2918A996 2F0B93B8
    55F97993 EC975EEA A80D740A DBF4FF74 7359D041 D5C33EA7
    1D281E44 6B14773B CA97B43A 23FB8016 76BD207A 436C6481
    F1D2B907 8717461A 5B9D32E6 88F87748 544523B5 24B0D57D
    5EA77A27 75D2ECFA 032CFBDB F52FB378 61602790 04E57AE6
    AF874E73 03CE5329 9CCC041C 7BC308D8 2A5698F3 A8D0C382
    71AE35F8 E9DBFBB6 94B5C803 D89F7AE4 35DE236D 525F5475
    9B65E372 FCD68EF2 0FA7111F 9E4AFF73";

lazy_static! {
    pub static ref FFDHE2048: DhGroup = DhGroup {
        p: biguint_from_hex(FFDHE2048_HEX),
        g: BigUint::from(2u32),
    };
    pub static ref FFDHE3072: DhGroup = DhGroup {
        p: biguint_from_hex(FFDHE3072_HEX),
        g: BigUint::from(2u32),
    };
    pub static ref MODP2048: DhGroup = DhGroup {
        p: biguint_from_hex(MODP2048_HEX),
        g: BigUint::from(2u32),
    };
    pub static ref SRP1024: SrpGroup = SrpGroup {
        n: biguint_from_hex(SRP1024_HEX),
        g: BigUint::from(2u32),
    };
    pub static ref SRP2048: SrpGroup = SrpGroup {
        n: biguint_from_hex(SRP2048_HEX),
        g: BigUint::from(2u32),
    };
    static ref KNOWN_SRP_GROUPS: Vec<&'static SrpGroup> = vec![&SRP1024, &SRP2048];
}

pub fn ffdhe_group(group: NamedGroup) -> Option<&'static DhGroup> {
    match group {
        NamedGroup::ffdhe2048 => Some(&FFDHE2048),
        NamedGroup::ffdhe3072 => Some(&FFDHE3072),
        _ => None,
    }
}

/// The fallback parameters used when the client offered no usable RFC 7919
/// group.
pub fn default_dh_group() -> &'static DhGroup {
    &MODP2048
}

fn check_prime_bits(p: &BigUint, min_bits: usize, max_bits: usize) -> Result<()> {
    let bits = p.bits() as usize;
    if bits < min_bits || bits > max_bits {
        return Err(TlsError::insufficient_security(format!(
            "Prime of {} bits outside the allowed range",
            bits
        )));
    }

    Ok(())
}

/// Big-endian value, left-padded with zeros to the byte length of 'n'.
fn pad_to(n: &BigUint, value: &BigUint) -> Vec<u8> {
    let len = (n.bits() as usize + 7) / 8;
    let raw = value.to_bytes_be();
    let mut out = vec![0u8; len - raw.len()];
    out.extend_from_slice(&raw);
    out
}

fn random_private_value(p: &BigUint, rng: &dyn SecureRandom) -> BigUint {
    let len = (p.bits() as usize + 7) / 8;
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf);

    // Uniform enough over [2, p-2] for key exchange purposes.
    (BigUint::from_bytes_be(&buf) % (p - BigUint::from(3u32))) + BigUint::from(2u32)
}

////////////////////////////////////////////////////////////////////////////////
// ServerKeyExchange wire structures.
////////////////////////////////////////////////////////////////////////////////

/*
struct {
    opaque point <1..2^8-1>;
} ECPoint;
*/
#[derive(Debug, Clone)]
pub struct ECPoint {
    pub point: Bytes,
}

impl ECPoint {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        Ok(Self {
            point: input.varlen_vector(1, U8_LIMIT)?,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(1, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.point);
        })
    }
}

tls_enum_u8!(ECCurveType => {
    named_curve(3),
    (255)
});

/*
struct {
    ECParameters    curve_params;
    ECPoint         public;
} ServerECDHParams;
*/
#[derive(Debug, Clone)]
pub struct ServerEcdhParams {
    pub named_curve: NamedGroup,
    pub public: ECPoint,
}

impl ServerEcdhParams {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let curve_type = ECCurveType::parse(input)?;
        if curve_type != ECCurveType::named_curve {
            return Err(TlsError::handshake_failure(
                "Only named curves are supported",
            ));
        }

        let named_curve = NamedGroup::parse(input)?;
        let public = ECPoint::parse(input)?;
        Ok(Self {
            named_curve,
            public,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        ECCurveType::named_curve.serialize(out);
        self.named_curve.serialize(out);
        self.public.serialize(out);
    }
}

/*
struct {
    opaque dh_p<1..2^16-1>;
    opaque dh_g<1..2^16-1>;
    opaque dh_Ys<1..2^16-1>;
} ServerDHParams;
*/
#[derive(Debug, Clone)]
pub struct ServerDhParams {
    pub dh_p: Bytes,
    pub dh_g: Bytes,
    pub dh_ys: Bytes,
}

impl ServerDhParams {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        Ok(Self {
            dh_p: input.varlen_vector(1, U16_LIMIT)?,
            dh_g: input.varlen_vector(1, U16_LIMIT)?,
            dh_ys: input.varlen_vector(1, U16_LIMIT)?,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(1, U16_LIMIT, out, |out| out.extend_from_slice(&self.dh_p));
        serialize_varlen_vector(1, U16_LIMIT, out, |out| out.extend_from_slice(&self.dh_g));
        serialize_varlen_vector(1, U16_LIMIT, out, |out| out.extend_from_slice(&self.dh_ys));
    }
}

/*
RFC 5054:
struct {
    opaque srp_N<1..2^16-1>;
    opaque srp_g<1..2^16-1>;
    opaque srp_s<1..2^8-1>;
    opaque srp_B<1..2^16-1>;
} ServerSRPParams;
*/
#[derive(Debug, Clone)]
pub struct ServerSrpParams {
    pub srp_n: Bytes,
    pub srp_g: Bytes,
    pub srp_s: Bytes,
    pub srp_b: Bytes,
}

impl ServerSrpParams {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        Ok(Self {
            srp_n: input.varlen_vector(1, U16_LIMIT)?,
            srp_g: input.varlen_vector(1, U16_LIMIT)?,
            srp_s: input.varlen_vector(1, U8_LIMIT)?,
            srp_b: input.varlen_vector(1, U16_LIMIT)?,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(1, U16_LIMIT, out, |out| out.extend_from_slice(&self.srp_n));
        serialize_varlen_vector(1, U16_LIMIT, out, |out| out.extend_from_slice(&self.srp_g));
        serialize_varlen_vector(1, U8_LIMIT, out, |out| out.extend_from_slice(&self.srp_s));
        serialize_varlen_vector(1, U16_LIMIT, out, |out| out.extend_from_slice(&self.srp_b));
    }
}

////////////////////////////////////////////////////////////////////////////////
// Static RSA key transport.
////////////////////////////////////////////////////////////////////////////////

pub struct RsaKeyExchange {
    /// The version the client *offered* in its ClientHello; the premaster
    /// secret embeds this, not the negotiated version.
    pub client_version: ProtocolVersion,
    /// The negotiated version, accepted as a fallback by the server's check
    /// for buggy clients that embed it instead.
    pub server_version: ProtocolVersion,
}

impl RsaKeyExchange {
    /// Client side: builds the EncryptedPreMasterSecret and returns it with
    /// the plaintext premaster.
    pub fn make_client_key_exchange(
        &self,
        server_public_key: &dyn PublicKey,
        rng: &dyn SecureRandom,
    ) -> Result<(Bytes, Vec<u8>)> {
        let mut premaster = vec![0u8; 48];
        rng.fill(&mut premaster);
        premaster[0..2].copy_from_slice(&self.client_version.to_be_bytes());

        let encrypted = server_public_key.rsa_encrypt_pkcs1(rng, &premaster)?;

        let mut body = vec![];
        serialize_varlen_vector(0, U16_LIMIT, &mut body, |out| {
            out.extend_from_slice(&encrypted)
        });

        Ok((body.into(), premaster))
    }

    /// Server side. Never fails for a decryption reason: any padding, length
    /// or version mismatch silently swaps in a random premaster so the
    /// handshake proceeds and dies at the Finished exchange
    /// (Bleichenbacher countermeasure).
    pub fn process_client_key_exchange(
        &self,
        data: &Bytes,
        private_key: &dyn PrivateKey,
        rng: &dyn SecureRandom,
    ) -> Result<Vec<u8>> {
        let mut r = ByteReader::new(data.clone());
        let encrypted = r.varlen_vector(0, U16_LIMIT)?;
        r.finish()?;

        let mut random_premaster = vec![0u8; 48];
        rng.fill(&mut random_premaster);

        let decrypted = private_key.rsa_decrypt_pkcs1(&encrypted);

        let premaster = match decrypted {
            Some(d) if d.len() == 48 => {
                let version = u16::from_be_bytes([d[0], d[1]]);
                if version == self.client_version || version == self.server_version {
                    d
                } else {
                    random_premaster
                }
            }
            _ => random_premaster,
        };

        Ok(premaster)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Finite field DHE.
////////////////////////////////////////////////////////////////////////////////

pub struct DheKeyExchange {
    pub min_key_bits: usize,
    pub max_key_bits: usize,

    params: Option<DheParams>,
    local_secret: Option<BigUint>,
}

struct DheParams {
    p: BigUint,
    g: BigUint,
    /// The other side's public value.
    peer_public: Option<BigUint>,
}

impl DheKeyExchange {
    pub fn new(min_key_bits: usize, max_key_bits: usize) -> Self {
        Self {
            min_key_bits,
            max_key_bits,
            params: None,
            local_secret: None,
        }
    }

    /// Picks the group for a server: the first RFC 7919 group out of the
    /// client's supported_groups that we also allow, otherwise the first
    /// configured fallback.
    pub fn select_group(
        client_groups: Option<&[NamedGroup]>,
        server_groups: &[NamedGroup],
    ) -> &'static DhGroup {
        if let Some(client_groups) = client_groups {
            for g in client_groups {
                if !server_groups.contains(g) {
                    continue;
                }

                if let Some(group) = ffdhe_group(*g) {
                    return group;
                }
            }
        }

        for g in server_groups {
            if let Some(group) = ffdhe_group(*g) {
                return group;
            }
        }

        default_dh_group()
    }

    /// Server side: picks a private value and produces the ServerDHParams
    /// body.
    pub fn make_server_key_exchange(
        &mut self,
        group: &DhGroup,
        rng: &dyn SecureRandom,
    ) -> Result<ServerDhParams> {
        check_prime_bits(&group.p, self.min_key_bits, self.max_key_bits)?;

        let secret = random_private_value(&group.p, rng);
        let public = group.g.modpow(&secret, &group.p);

        let params = ServerDhParams {
            dh_p: group.p.to_bytes_be().into(),
            dh_g: group.g.to_bytes_be().into(),
            dh_ys: public.to_bytes_be().into(),
        };

        self.params = Some(DheParams {
            p: group.p.clone(),
            g: group.g.clone(),
            peer_public: None,
        });
        self.local_secret = Some(secret);

        Ok(params)
    }

    /// Client side: validates the server's parameters.
    pub fn process_server_key_exchange(&mut self, params: &ServerDhParams) -> Result<()> {
        let p = BigUint::from_bytes_be(&params.dh_p);
        let g = BigUint::from_bytes_be(&params.dh_g);
        let ys = BigUint::from_bytes_be(&params.dh_ys);

        check_prime_bits(&p, self.min_key_bits, self.max_key_bits)?;
        check_dh_public(&p, &ys)?;

        self.params = Some(DheParams {
            p,
            g,
            peer_public: Some(ys),
        });

        Ok(())
    }

    /// Client side: generates our key pair and derives the premaster.
    /// Returns (ClientKeyExchange body, premaster secret).
    pub fn make_client_key_exchange(&mut self, rng: &dyn SecureRandom) -> Result<(Bytes, Vec<u8>)> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| TlsError::internal("No DH params yet"))?;
        let peer = params
            .peer_public
            .as_ref()
            .ok_or_else(|| TlsError::internal("No server public value"))?;

        let secret = random_private_value(&params.p, rng);
        let public = params.g.modpow(&secret, &params.p);

        let shared = peer.modpow(&secret, &params.p);
        check_dh_shared(&shared)?;

        let mut body = vec![];
        serialize_varlen_vector(1, U16_LIMIT, &mut body, |out| {
            out.extend_from_slice(&public.to_bytes_be())
        });

        // RFC 5246 8.1.2: leading zero bytes are stripped.
        Ok((body.into(), shared.to_bytes_be()))
    }

    /// Server side: consumes the client's public value.
    pub fn process_client_key_exchange(&mut self, data: &Bytes) -> Result<Vec<u8>> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| TlsError::internal("No DH params yet"))?;
        let secret = self
            .local_secret
            .as_ref()
            .ok_or_else(|| TlsError::internal("No local secret"))?;

        let mut r = ByteReader::new(data.clone());
        let yc = BigUint::from_bytes_be(&r.varlen_vector(1, U16_LIMIT)?);
        r.finish()?;

        check_dh_public(&params.p, &yc)?;

        let shared = yc.modpow(secret, &params.p);
        check_dh_shared(&shared)?;

        Ok(shared.to_bytes_be())
    }
}

/// Rejects the degenerate public values 0, 1 and p-1.
fn check_dh_public(p: &BigUint, public: &BigUint) -> Result<()> {
    let one = BigUint::from(1u32);
    if public.clone() % p == BigUint::from(0u32)
        || *public == one
        || *public == (p - &one)
        || public >= p
    {
        return Err(TlsError::illegal_parameter("Degenerate DH public value"));
    }

    Ok(())
}

fn check_dh_shared(shared: &BigUint) -> Result<()> {
    if *shared <= BigUint::from(1u32) {
        return Err(TlsError::illegal_parameter("Degenerate DH shared secret"));
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// ECDHE.
////////////////////////////////////////////////////////////////////////////////

pub struct EcdheKeyExchange {
    provider: Arc<dyn CryptoProvider>,

    curve: Option<NamedGroup>,
    local_secret: Option<Vec<u8>>,
    peer_public: Option<Bytes>,
}

impl EcdheKeyExchange {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            provider,
            curve: None,
            local_secret: None,
            peer_public: None,
        }
    }

    /// Picks the first mutually supported curve out of the client's
    /// supported_groups.
    pub fn select_curve(
        client_groups: Option<&[NamedGroup]>,
        server_curves: &[NamedGroup],
    ) -> Option<NamedGroup> {
        let client_groups = client_groups?;
        for g in client_groups {
            if g.is_elliptic_curve() && server_curves.contains(g) {
                return Some(*g);
            }
        }

        None
    }

    pub fn make_server_key_exchange(
        &mut self,
        curve: NamedGroup,
        rng: &dyn SecureRandom,
    ) -> Result<ServerEcdhParams> {
        let agreement = self.provider.key_agreement(curve)?;
        let secret = agreement.new_secret(rng)?;
        let public = agreement.public_value(&secret)?;

        self.curve = Some(curve);
        self.local_secret = Some(secret);

        Ok(ServerEcdhParams {
            named_curve: curve,
            public: ECPoint {
                point: public.into(),
            },
        })
    }

    pub fn process_server_key_exchange(
        &mut self,
        params: &ServerEcdhParams,
        allowed_curves: &[NamedGroup],
    ) -> Result<()> {
        if !allowed_curves.contains(&params.named_curve) {
            return Err(TlsError::illegal_parameter(
                "Server picked a curve we did not offer",
            ));
        }

        check_ec_point(params.named_curve, &params.public.point)?;

        self.curve = Some(params.named_curve);
        self.peer_public = Some(params.public.point.clone());
        Ok(())
    }

    pub fn make_client_key_exchange(&mut self, rng: &dyn SecureRandom) -> Result<(Bytes, Vec<u8>)> {
        let curve = self.curve.ok_or_else(|| TlsError::internal("No curve"))?;
        let peer = self
            .peer_public
            .as_ref()
            .ok_or_else(|| TlsError::internal("No server public value"))?;

        let agreement = self.provider.key_agreement(curve)?;
        let secret = agreement.new_secret(rng)?;
        let public = agreement.public_value(&secret)?;

        let shared = agreement.shared_secret(peer, &secret)?;
        check_ec_shared(&shared)?;

        let mut body = vec![];
        ECPoint {
            point: public.into(),
        }
        .serialize(&mut body);

        Ok((body.into(), shared))
    }

    pub fn process_client_key_exchange(&mut self, data: &Bytes) -> Result<Vec<u8>> {
        let curve = self.curve.ok_or_else(|| TlsError::internal("No curve"))?;
        let secret = self
            .local_secret
            .as_ref()
            .ok_or_else(|| TlsError::internal("No local secret"))?;

        let mut r = ByteReader::new(data.clone());
        let point = ECPoint::parse(&mut r)?;
        r.finish()?;

        check_ec_point(curve, &point.point)?;

        let agreement = self.provider.key_agreement(curve)?;
        let shared = agreement.shared_secret(&point.point, secret)?;
        check_ec_shared(&shared)?;

        Ok(shared)
    }
}

/// Structural validation of a received public value. Full on-curve checks
/// are the provider's job; the cheap format checks live here.
fn check_ec_point(curve: NamedGroup, point: &[u8]) -> Result<()> {
    match curve {
        NamedGroup::x25519 => {
            if point.len() != 32 {
                return Err(TlsError::illegal_parameter("Bad x25519 public length"));
            }
        }
        NamedGroup::x448 => {
            if point.len() != 56 {
                return Err(TlsError::illegal_parameter("Bad x448 public length"));
            }
        }
        _ => {
            // Only uncompressed points are supported.
            if point.first() != Some(&4) {
                return Err(TlsError::illegal_parameter(
                    "Only uncompressed EC points are supported",
                ));
            }
        }
    }

    Ok(())
}

/// The all-zero output marks a low-order input point.
fn check_ec_shared(shared: &[u8]) -> Result<()> {
    if shared.iter().all(|b| *b == 0) {
        return Err(TlsError::illegal_parameter("All zero shared secret"));
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// SRP (RFC 5054). The PAD/H computations use SHA-1 as specified.
////////////////////////////////////////////////////////////////////////////////

/// Verifier database consulted by the server. Out of scope for the engine;
/// only this lookup interface is consumed.
pub trait SrpDatabase: Send + Sync {
    /// Returns (group, salt, verifier) for a username.
    fn lookup(&self, username: &[u8]) -> Option<SrpVerifier>;
}

pub struct SrpVerifier {
    pub group: &'static SrpGroup,
    pub salt: Bytes,
    pub verifier: BigUint,
}

pub struct SrpKeyExchange {
    hasher_factory: HasherFactory,

    pub min_key_bits: usize,
    pub max_key_bits: usize,

    state: Option<SrpState>,
}

struct SrpState {
    n: BigUint,
    g: BigUint,
    salt: Bytes,
    /// Server: (b, v). Client: remembers B.
    server_secret: Option<(BigUint, BigUint)>,
    server_public: BigUint,
}

impl SrpKeyExchange {
    /// 'hasher_factory' must produce SHA-1 (the RFC 5054 group hash).
    pub fn new(hasher_factory: HasherFactory, min_key_bits: usize, max_key_bits: usize) -> Self {
        Self {
            hasher_factory,
            min_key_bits,
            max_key_bits,
            state: None,
        }
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        let mut h = self.hasher_factory.create();
        h.update(data);
        h.finish()
    }

    /// k = H(N | PAD(g))
    fn multiplier(&self, n: &BigUint, g: &BigUint) -> BigUint {
        let mut data = n.to_bytes_be();
        data.extend_from_slice(&pad_to(n, g));
        BigUint::from_bytes_be(&self.hash(&data))
    }

    /// u = H(PAD(A) | PAD(B))
    fn scrambler(&self, n: &BigUint, a: &BigUint, b: &BigUint) -> BigUint {
        let mut data = pad_to(n, a);
        data.extend_from_slice(&pad_to(n, b));
        BigUint::from_bytes_be(&self.hash(&data))
    }

    /// x = H(salt | H(username ":" password))
    fn private_key_x(&self, salt: &[u8], username: &[u8], password: &[u8]) -> BigUint {
        let mut inner = username.to_vec();
        inner.push(b':');
        inner.extend_from_slice(password);
        let inner_hash = self.hash(&inner);

        let mut data = salt.to_vec();
        data.extend_from_slice(&inner_hash);
        BigUint::from_bytes_be(&self.hash(&data))
    }

    /// Server side: B = (k*v + g^b) % N.
    pub fn make_server_key_exchange(
        &mut self,
        verifier: &SrpVerifier,
        rng: &dyn SecureRandom,
    ) -> Result<ServerSrpParams> {
        let n = &verifier.group.n;
        let g = &verifier.group.g;

        check_prime_bits(n, self.min_key_bits, self.max_key_bits)?;

        let b = random_private_value(n, rng);
        let k = self.multiplier(n, g);

        let public = (&k * &verifier.verifier + g.modpow(&b, n)) % n;

        let params = ServerSrpParams {
            srp_n: n.to_bytes_be().into(),
            srp_g: g.to_bytes_be().into(),
            srp_s: verifier.salt.clone(),
            srp_b: public.to_bytes_be().into(),
        };

        self.state = Some(SrpState {
            n: n.clone(),
            g: g.clone(),
            salt: verifier.salt.clone(),
            server_secret: Some((b, verifier.verifier.clone())),
            server_public: public,
        });

        Ok(params)
    }

    /// Client side validation of the server parameters.
    pub fn process_server_key_exchange(&mut self, params: &ServerSrpParams) -> Result<()> {
        let n = BigUint::from_bytes_be(&params.srp_n);
        let g = BigUint::from_bytes_be(&params.srp_g);
        let b = BigUint::from_bytes_be(&params.srp_b);

        check_prime_bits(&n, self.min_key_bits, self.max_key_bits)?;

        // Unauthenticated (g, N) pairs could be attacker chosen; only the
        // published groups are accepted.
        if !KNOWN_SRP_GROUPS
            .iter()
            .any(|grp| grp.n == n && grp.g == g)
        {
            return Err(TlsError::insufficient_security(
                "Unknown SRP group parameters",
            ));
        }

        if b.clone() % &n == BigUint::from(0u32) {
            return Err(TlsError::illegal_parameter("SRP B % N is zero"));
        }

        self.state = Some(SrpState {
            n,
            g,
            salt: params.srp_s.clone(),
            server_secret: None,
            server_public: b,
        });

        Ok(())
    }

    /// Client side: computes A and the premaster.
    pub fn make_client_key_exchange(
        &mut self,
        username: &[u8],
        password: &[u8],
        rng: &dyn SecureRandom,
    ) -> Result<(Bytes, Vec<u8>)> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| TlsError::internal("No SRP params yet"))?;

        let n = &state.n;
        let g = &state.g;
        let b_pub = &state.server_public;

        let a = random_private_value(n, rng);
        let a_pub = g.modpow(&a, n);

        let u = self.scrambler(n, &a_pub, b_pub);
        let x = self.private_key_x(&state.salt, username, password);
        let k = self.multiplier(n, g);

        // S = (B - k * g^x) ^ (a + u*x) % N, kept positive mod N.
        let kgx = (&k * g.modpow(&x, n)) % n;
        let base = (b_pub + n - &kgx) % n;
        let exponent = &a + &u * &x;
        let secret = base.modpow(&exponent, n);

        let mut body = vec![];
        serialize_varlen_vector(1, U16_LIMIT, &mut body, |out| {
            out.extend_from_slice(&a_pub.to_bytes_be())
        });

        Ok((body.into(), secret.to_bytes_be()))
    }

    /// Server side: consumes A, computes the premaster.
    pub fn process_client_key_exchange(&mut self, data: &Bytes) -> Result<Vec<u8>> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| TlsError::internal("No SRP params yet"))?;
        let (b, v) = state
            .server_secret
            .as_ref()
            .ok_or_else(|| TlsError::internal("No server secret"))?;

        let mut r = ByteReader::new(data.clone());
        let a_pub = BigUint::from_bytes_be(&r.varlen_vector(1, U16_LIMIT)?);
        r.finish()?;

        let n = &state.n;
        if a_pub.clone() % n == BigUint::from(0u32) {
            return Err(TlsError::illegal_parameter("SRP A % N is zero"));
        }

        let u = self.scrambler(n, &a_pub, &state.server_public);

        // S = (A * v^u) ^ b % N
        let base = (&a_pub * v.modpow(&u, n)) % n;
        let secret = base.modpow(b, n);

        Ok(secret.to_bytes_be())
    }
}

////////////////////////////////////////////////////////////////////////////////
// TLS 1.3 key shares, including hybrid KEM groups.
////////////////////////////////////////////////////////////////////////////////

/// The secret half of a generated key share.
pub enum KeyShareSecret {
    Classical(Vec<u8>),
    Ffdhe {
        secret: BigUint,
        group: &'static DhGroup,
    },
    Hybrid {
        kem_secret: Vec<u8>,
        classical_secret: Vec<u8>,
    },
}

/// Decomposes a hybrid group: (KEM, classical group, pqc_share_first).
///
/// X25519MLKEM768 puts the post-quantum share first; the NIST hybrids put
/// the classical share first. Shared secret concatenation follows the same
/// order.
fn hybrid_parts(group: NamedGroup) -> Option<(KemAlgorithm, NamedGroup, bool)> {
    match group {
        NamedGroup::x25519mlkem768 => Some((KemAlgorithm::MlKem768, NamedGroup::x25519, true)),
        NamedGroup::secp256r1mlkem768 => {
            Some((KemAlgorithm::MlKem768, NamedGroup::secp256r1, false))
        }
        NamedGroup::secp384r1mlkem1024 => {
            Some((KemAlgorithm::MlKem1024, NamedGroup::secp384r1, false))
        }
        _ => None,
    }
}

/// Generates the client-side key share for one group.
pub fn generate_key_share(
    group: NamedGroup,
    provider: &dyn CryptoProvider,
    rng: &dyn SecureRandom,
) -> Result<(KeyShareEntry, KeyShareSecret)> {
    if let Some((kem_alg, classical, pqc_first)) = hybrid_parts(group) {
        let kem = provider.kem(kem_alg)?;
        let (kem_public, kem_secret) = kem.generate(rng)?;

        let agreement = provider.key_agreement(classical)?;
        let classical_secret = agreement.new_secret(rng)?;
        let classical_public = agreement.public_value(&classical_secret)?;

        let mut key_exchange = vec![];
        if pqc_first {
            key_exchange.extend_from_slice(&kem_public);
            key_exchange.extend_from_slice(&classical_public);
        } else {
            key_exchange.extend_from_slice(&classical_public);
            key_exchange.extend_from_slice(&kem_public);
        }

        return Ok((
            KeyShareEntry {
                group,
                key_exchange: key_exchange.into(),
            },
            KeyShareSecret::Hybrid {
                kem_secret,
                classical_secret,
            },
        ));
    }

    if let Some(dh_group) = ffdhe_group(group) {
        let secret = random_private_value(&dh_group.p, rng);
        let public = dh_group.g.modpow(&secret, &dh_group.p);

        return Ok((
            KeyShareEntry {
                group,
                // RFC 8446: FFDHE shares are left-padded to the prime length.
                key_exchange: pad_to(&dh_group.p, &public).into(),
            },
            KeyShareSecret::Ffdhe {
                secret,
                group: dh_group,
            },
        ));
    }

    let agreement = provider.key_agreement(group)?;
    let secret = agreement.new_secret(rng)?;
    let public = agreement.public_value(&secret)?;

    Ok((
        KeyShareEntry {
            group,
            key_exchange: public.into(),
        },
        KeyShareSecret::Classical(secret),
    ))
}

/// Server side: consumes the client share and produces (server share bytes,
/// shared secret). For hybrids the server encapsulates rather than holding a
/// KEM key pair of its own.
pub fn server_process_key_share(
    group: NamedGroup,
    provider: &dyn CryptoProvider,
    rng: &dyn SecureRandom,
    client_share: &[u8],
) -> Result<(Bytes, Vec<u8>)> {
    if let Some((kem_alg, classical, pqc_first)) = hybrid_parts(group) {
        let kem = provider.kem(kem_alg)?;
        let pk_len = kem.public_key_size();

        if client_share.len() <= pk_len {
            return Err(TlsError::illegal_parameter("Hybrid key share too short"));
        }

        let (kem_public, classical_public) = if pqc_first {
            client_share.split_at(pk_len)
        } else {
            let (c, k) = client_share.split_at(client_share.len() - pk_len);
            (k, c)
        };

        check_ec_point(classical, classical_public)?;

        let (kem_ciphertext, kem_shared) = kem.encapsulate(kem_public, rng)?;

        let agreement = provider.key_agreement(classical)?;
        let classical_secret = agreement.new_secret(rng)?;
        let server_classical_public = agreement.public_value(&classical_secret)?;
        let classical_shared = agreement.shared_secret(classical_public, &classical_secret)?;
        check_ec_shared(&classical_shared)?;

        let mut share = vec![];
        let mut shared = vec![];
        if pqc_first {
            share.extend_from_slice(&kem_ciphertext);
            share.extend_from_slice(&server_classical_public);
            shared.extend_from_slice(&kem_shared);
            shared.extend_from_slice(&classical_shared);
        } else {
            share.extend_from_slice(&server_classical_public);
            share.extend_from_slice(&kem_ciphertext);
            shared.extend_from_slice(&classical_shared);
            shared.extend_from_slice(&kem_shared);
        }

        return Ok((share.into(), shared));
    }

    if let Some(dh_group) = ffdhe_group(group) {
        let peer = BigUint::from_bytes_be(client_share);
        check_dh_public(&dh_group.p, &peer)?;

        let secret = random_private_value(&dh_group.p, rng);
        let public = dh_group.g.modpow(&secret, &dh_group.p);
        let shared = peer.modpow(&secret, &dh_group.p);
        check_dh_shared(&shared)?;

        return Ok((
            pad_to(&dh_group.p, &public).into(),
            pad_to(&dh_group.p, &shared),
        ));
    }

    check_ec_point(group, client_share)?;

    let agreement = provider.key_agreement(group)?;
    let secret = agreement.new_secret(rng)?;
    let public = agreement.public_value(&secret)?;
    let shared = agreement.shared_secret(client_share, &secret)?;
    check_ec_shared(&shared)?;

    Ok((public.into(), shared))
}

/// Client side: combines our stored secret with the server's share.
pub fn client_complete_key_share(
    group: NamedGroup,
    provider: &dyn CryptoProvider,
    secret: &KeyShareSecret,
    server_share: &[u8],
) -> Result<Vec<u8>> {
    match secret {
        KeyShareSecret::Hybrid {
            kem_secret,
            classical_secret,
        } => {
            let (kem_alg, classical, pqc_first) = hybrid_parts(group)
                .ok_or_else(|| TlsError::internal("Hybrid secret for non-hybrid group"))?;

            let kem = provider.kem(kem_alg)?;
            let ct_len = kem.ciphertext_size();

            if server_share.len() <= ct_len {
                return Err(TlsError::illegal_parameter("Hybrid server share too short"));
            }

            let (kem_ciphertext, classical_public) = if pqc_first {
                server_share.split_at(ct_len)
            } else {
                let (c, k) = server_share.split_at(server_share.len() - ct_len);
                (k, c)
            };

            let kem_shared = kem.decapsulate(kem_secret, kem_ciphertext)?;

            let agreement = provider.key_agreement(classical)?;
            let classical_shared =
                agreement.shared_secret(classical_public, classical_secret)?;
            check_ec_shared(&classical_shared)?;

            let mut shared = vec![];
            if pqc_first {
                shared.extend_from_slice(&kem_shared);
                shared.extend_from_slice(&classical_shared);
            } else {
                shared.extend_from_slice(&classical_shared);
                shared.extend_from_slice(&kem_shared);
            }

            Ok(shared)
        }
        KeyShareSecret::Ffdhe { secret, group } => {
            let peer = BigUint::from_bytes_be(server_share);
            check_dh_public(&group.p, &peer)?;

            let shared = peer.modpow(secret, &group.p);
            check_dh_shared(&shared)?;

            Ok(pad_to(&group.p, &shared))
        }
        KeyShareSecret::Classical(secret) => {
            let agreement = provider.key_agreement(group)?;
            let shared = agreement.shared_secret(server_share, secret)?;
            check_ec_shared(&shared)?;

            Ok(shared)
        }
    }
}

/// Signature payload for an authenticated ServerKeyExchange:
/// client_random || server_random || params.
pub fn server_key_exchange_payload(
    client_random: &[u8],
    server_random: &[u8],
    params: &[u8],
) -> Vec<u8> {
    let mut out = vec![];
    out.extend_from_slice(client_random);
    out.extend_from_slice(server_random);
    out.extend_from_slice(params);
    out
}

/// RFC 2945 verifier computation, used to bootstrap test databases:
/// v = g ^ H(s | H(I ":" P)) % N
pub fn srp_verifier(
    hasher_factory: &HasherFactory,
    group: &'static SrpGroup,
    salt: &[u8],
    username: &[u8],
    password: &[u8],
) -> BigUint {
    let kx = SrpKeyExchange::new(hasher_factory.clone(), 0, usize::MAX);
    let x = kx.private_key_x(salt, username, password);
    group.g.modpow(&x, &group.n)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ZeroRandom;
    impl SecureRandom for ZeroRandom {
        fn fill(&self, buf: &mut [u8]) {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (i % 251) as u8 + 1;
            }
        }
    }

    #[test]
    fn group_tables_have_expected_sizes() {
        assert_eq!(FFDHE2048.p.bits(), 2048);
        assert_eq!(FFDHE3072.p.bits(), 3072);
        assert_eq!(MODP2048.p.bits(), 2048);
        assert_eq!(SRP1024.n.bits(), 1024);
        assert_eq!(SRP2048.n.bits(), 2048);
    }

    #[test]
    fn dhe_roundtrip_and_validation() {
        let rng = ZeroRandom;

        let mut server = DheKeyExchange::new(1023, 8193);
        let params = server.make_server_key_exchange(&FFDHE2048, &rng).unwrap();

        let mut client = DheKeyExchange::new(1023, 8193);
        client.process_server_key_exchange(&params).unwrap();

        let (ckx, client_premaster) = client.make_client_key_exchange(&rng).unwrap();
        let server_premaster = server.process_client_key_exchange(&ckx).unwrap();

        assert_eq!(client_premaster, server_premaster);
        assert!(!client_premaster.is_empty());
    }

    #[test]
    fn dhe_rejects_degenerate_public() {
        let p = &FFDHE2048.p;
        assert!(check_dh_public(p, &BigUint::from(0u32)).is_err());
        assert!(check_dh_public(p, &BigUint::from(1u32)).is_err());
        assert!(check_dh_public(p, &(p - BigUint::from(1u32))).is_err());
        assert!(check_dh_public(p, &BigUint::from(2u32)).is_ok());
    }

    #[test]
    fn dhe_rejects_small_primes() {
        let rng = ZeroRandom;
        let small = DhGroup {
            p: BigUint::from(0xffffffffffffffc5u64),
            g: BigUint::from(2u32),
        };

        let mut server = DheKeyExchange::new(1023, 8193);
        assert!(server.make_server_key_exchange(&small, &rng).is_err());
    }

    #[test]
    fn dh_group_selection_prefers_client_rfc7919() {
        let client = [NamedGroup::x25519, NamedGroup::ffdhe3072];
        let server = [NamedGroup::ffdhe2048, NamedGroup::ffdhe3072];

        let group = DheKeyExchange::select_group(Some(&client), &server);
        assert_eq!(group.p, FFDHE3072.p);

        // No usable client groups: the server's first configured one wins.
        let group = DheKeyExchange::select_group(Some(&[NamedGroup::x25519]), &server);
        assert_eq!(group.p, FFDHE2048.p);

        // Nothing configured at all falls back to the MODP table.
        let group = DheKeyExchange::select_group(None, &[]);
        assert_eq!(group.p, MODP2048.p);
    }

    #[test]
    fn ec_point_format_checks() {
        assert!(check_ec_point(NamedGroup::x25519, &[0u8; 32]).is_ok());
        assert!(check_ec_point(NamedGroup::x25519, &[0u8; 31]).is_err());
        assert!(check_ec_point(NamedGroup::secp256r1, &[4u8; 65]).is_ok());
        // Compressed point.
        assert!(check_ec_point(NamedGroup::secp256r1, &[2u8; 33]).is_err());
        assert!(check_ec_shared(&[0u8; 32]).is_err());
        assert!(check_ec_shared(&[1u8; 32]).is_ok());
    }

    #[test]
    fn rsa_premaster_version_check() {
        // A fake key pair where "encryption" is identity.
        struct FakePublic;
        impl PublicKey for FakePublic {
            fn key_type(&self) -> KeyType {
                KeyType::Rsa
            }
            fn bit_length(&self) -> usize {
                2048
            }
            fn verify(
                &self,
                _: crate::extensions::SignatureScheme,
                _: &[u8],
                _: &[u8],
            ) -> Result<bool> {
                Ok(false)
            }
            fn rsa_encrypt_pkcs1(&self, _: &dyn SecureRandom, data: &[u8]) -> Result<Vec<u8>> {
                Ok(data.to_vec())
            }
        }

        struct FakePrivate;
        impl PrivateKey for FakePrivate {
            fn key_type(&self) -> KeyType {
                KeyType::Rsa
            }
            fn supports_scheme(&self, _: crate::extensions::SignatureScheme) -> bool {
                false
            }
            fn sign(
                &self,
                _: crate::extensions::SignatureScheme,
                _: &[u8],
            ) -> Result<Vec<u8>> {
                Err(TlsError::internal("unused"))
            }
            fn rsa_decrypt_pkcs1(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
                Some(ciphertext.to_vec())
            }
        }

        let rng = ZeroRandom;
        let kx = RsaKeyExchange {
            client_version: 0x0303,
            server_version: 0x0303,
        };

        let (body, premaster) = kx.make_client_key_exchange(&FakePublic, &rng).unwrap();
        assert_eq!(premaster.len(), 48);
        assert_eq!(&premaster[0..2], &[0x03, 0x03]);

        // Intact transfer decrypts to the same premaster.
        let out = kx
            .process_client_key_exchange(&body, &FakePrivate, &rng)
            .unwrap();
        assert_eq!(out, premaster);

        // A flipped version byte silently yields a *different* premaster.
        let mut tampered = body.to_vec();
        tampered[2] = 0x02; // first premaster byte, behind the u16 length
        let out = kx
            .process_client_key_exchange(&tampered.to_vec().into(), &FakePrivate, &rng)
            .unwrap();
        assert_eq!(out.len(), 48);
        assert_ne!(out, premaster);
    }

    #[test]
    fn srp_exchange_agrees() {
        let factory = crate::testing::sha256_factory();
        let rng = ZeroRandom;

        let salt = Bytes::from_static(b"some salt");
        let verifier_value = srp_verifier(&factory, &SRP1024, &salt, b"alice", b"password123");
        let verifier = SrpVerifier {
            group: &SRP1024,
            salt: salt.clone(),
            verifier: verifier_value,
        };

        let mut server = SrpKeyExchange::new(factory.clone(), 1023, 8193);
        let params = server.make_server_key_exchange(&verifier, &rng).unwrap();

        let mut client = SrpKeyExchange::new(factory, 1023, 8193);
        client.process_server_key_exchange(&params).unwrap();
        let (ckx, client_premaster) = client
            .make_client_key_exchange(b"alice", b"password123", &rng)
            .unwrap();

        let server_premaster = server.process_client_key_exchange(&ckx).unwrap();
        assert_eq!(client_premaster, server_premaster);
    }

    #[test]
    fn srp_rejects_unknown_group() {
        let factory = crate::testing::sha256_factory();
        let mut client = SrpKeyExchange::new(factory, 1023, 8193);

        let params = ServerSrpParams {
            srp_n: MODP2048.p.to_bytes_be().into(), // not an SRP group
            srp_g: vec![2].into(),
            srp_s: vec![1, 2, 3].into(),
            srp_b: vec![9, 9].into(),
        };

        assert!(client.process_server_key_exchange(&params).is_err());
    }
}
