use bytes::Bytes;

use crate::error::{Result, TlsError};
use crate::handshake::HandshakeType;
use crate::parsing::*;
use crate::record::ProtocolVersion;

// List of all extensions: https://www.iana.org/assignments/tls-extensiontype-values/tls-extensiontype-values.xml

/*
struct {
    ExtensionType extension_type;
    opaque extension_data<0..2^16-1>;
} Extension;
*/

#[derive(Debug, Clone)]
pub enum Extension {
    // An empty server name is only allowed when a server is responding to a client
    // https://datatracker.ietf.org/doc/html/rfc6066#section-3
    ServerName(Option<ServerNameList>),

    MaxFragmentLength(MaxFragmentLength),
    StatusRequest(Option<CertificateStatusRequest>),
    SupportedGroups(NamedGroupList),
    SupportedPointFormats(ECPointFormatList),
    SignatureAlgorithms(SignatureSchemeList),
    SignatureAlgorithmsCert(SignatureSchemeList),
    Heartbeat(HeartbeatMode),
    ALPN(ProtocolNameList),

    /// RFC 5077. An empty body is a request for a new ticket; a non-empty one
    /// offers a previously issued ticket for resumption.
    SessionTicket(Bytes),

    /// RFC 7366.
    EncryptThenMac,
    /// RFC 7627.
    ExtendedMasterSecret,
    /// RFC 8449.
    RecordSizeLimit(u16),
    /// RFC 5746. Carries the renegotiated_connection verify data (always
    /// empty here since renegotiation is refused).
    RenegotiationInfo(Bytes),
    /// RFC 5054: the SRP username offered by the client.
    SrpUsername(Bytes),

    SupportedVersionsClientHello(SupportedVersionsClientHello),
    SupportedVersionsServerHello(SupportedVersionsServerHello),
    Cookie(Cookie),
    PostHandshakeAuth,

    KeyShareClientHello(KeyShareClientHello),
    KeyShareHelloRetryRequest(KeyShareHelloRetryRequest),
    KeyShareServerHello(KeyShareServerHello),

    PreSharedKeyClientHello(OfferedPsks),
    PreSharedKeyServerHello(u16),
    PskKeyExchangeModes(PskKeyExchangeModeList),

    /// Empty in ClientHello / EncryptedExtensions; carries
    /// max_early_data_size on a NewSessionTicket.
    EarlyDataIndication(Option<u32>),

    Unknown {
        typ: u16,
        data: Bytes,
    },
}

impl Extension {
    pub fn typ(&self) -> ExtensionType {
        use Extension::*;
        match self {
            ServerName(_) => ExtensionType::ServerName,
            MaxFragmentLength(_) => ExtensionType::MaxFragmentLength,
            StatusRequest(_) => ExtensionType::StatusRequest,
            SupportedGroups(_) => ExtensionType::SupportedGroups,
            SupportedPointFormats(_) => ExtensionType::SupportedPointFormats,
            SignatureAlgorithms(_) => ExtensionType::SignatureAlgorithms,
            SignatureAlgorithmsCert(_) => ExtensionType::SignatureAlgorithmsCert,
            Heartbeat(_) => ExtensionType::Heartbeat,
            ALPN(_) => ExtensionType::ApplicationLayerProtocolNegotiation,
            SessionTicket(_) => ExtensionType::SessionTicket,
            EncryptThenMac => ExtensionType::EncryptThenMac,
            ExtendedMasterSecret => ExtensionType::ExtendedMasterSecret,
            RecordSizeLimit(_) => ExtensionType::RecordSizeLimit,
            RenegotiationInfo(_) => ExtensionType::RenegotiationInfo,
            SrpUsername(_) => ExtensionType::Srp,
            SupportedVersionsClientHello(_) => ExtensionType::SupportedVersions,
            SupportedVersionsServerHello(_) => ExtensionType::SupportedVersions,
            Cookie(_) => ExtensionType::Cookie,
            PostHandshakeAuth => ExtensionType::PostHandshakeAuth,
            KeyShareClientHello(_) => ExtensionType::KeyShare,
            KeyShareHelloRetryRequest(_) => ExtensionType::KeyShare,
            KeyShareServerHello(_) => ExtensionType::KeyShare,
            PreSharedKeyClientHello(_) => ExtensionType::PreSharedKey,
            PreSharedKeyServerHello(_) => ExtensionType::PreSharedKey,
            PskKeyExchangeModes(_) => ExtensionType::PskKeyExchangeModes,
            EarlyDataIndication(_) => ExtensionType::EarlyData,
            Unknown { typ, .. } => ExtensionType::from_u16(*typ),
        }
    }

    pub fn parse(input: &mut ByteReader, msg_type: HandshakeType, is_hrr: bool) -> Result<Self> {
        let extension_type = ExtensionType::from_u16(input.next_u16()?);
        if !extension_type.allowed(msg_type) {
            return Err(TlsError::illegal_parameter(format!(
                "Extension not allowed in this message: {:?} on {:?}",
                extension_type, msg_type
            )));
        }

        let data = input.varlen_vector(0, U16_LIMIT)?;
        let mut r = ByteReader::new(data.clone());

        let out = match extension_type {
            ExtensionType::ServerName => {
                // Per https://datatracker.ietf.org/doc/html/rfc6066#section-3,
                // a server is allowed to send back an empty server_name.
                if r.is_empty() {
                    Extension::ServerName(None)
                } else {
                    Extension::ServerName(Some(ServerNameList::parse(&mut r)?))
                }
            }
            ExtensionType::MaxFragmentLength => {
                Extension::MaxFragmentLength(MaxFragmentLength::parse(&mut r)?)
            }
            ExtensionType::StatusRequest => {
                if r.is_empty() {
                    Extension::StatusRequest(None)
                } else {
                    Extension::StatusRequest(Some(CertificateStatusRequest::parse(&mut r)?))
                }
            }
            ExtensionType::SupportedGroups => {
                Extension::SupportedGroups(NamedGroupList::parse(&mut r)?)
            }
            ExtensionType::SupportedPointFormats => {
                Extension::SupportedPointFormats(ECPointFormatList::parse(&mut r)?)
            }
            ExtensionType::SignatureAlgorithms => {
                Extension::SignatureAlgorithms(SignatureSchemeList::parse(&mut r)?)
            }
            ExtensionType::SignatureAlgorithmsCert => {
                Extension::SignatureAlgorithmsCert(SignatureSchemeList::parse(&mut r)?)
            }
            ExtensionType::Heartbeat => Extension::Heartbeat(HeartbeatMode::parse(&mut r)?),
            ExtensionType::ApplicationLayerProtocolNegotiation => {
                Extension::ALPN(ProtocolNameList::parse(&mut r)?)
            }
            ExtensionType::SessionTicket => Extension::SessionTicket(r.rest()),
            ExtensionType::EncryptThenMac => Extension::EncryptThenMac,
            ExtensionType::ExtendedMasterSecret => Extension::ExtendedMasterSecret,
            ExtensionType::RecordSizeLimit => Extension::RecordSizeLimit(r.next_u16()?),
            ExtensionType::RenegotiationInfo => {
                Extension::RenegotiationInfo(r.varlen_vector(0, U8_LIMIT)?)
            }
            ExtensionType::Srp => Extension::SrpUsername(r.varlen_vector(1, U8_LIMIT)?),
            ExtensionType::SupportedVersions => match msg_type {
                HandshakeType::ClientHello => Extension::SupportedVersionsClientHello(
                    SupportedVersionsClientHello::parse(&mut r)?,
                ),
                HandshakeType::ServerHello => Extension::SupportedVersionsServerHello(
                    SupportedVersionsServerHello::parse(&mut r)?,
                ),
                _ => {
                    return Err(TlsError::illegal_parameter(
                        "supported_versions in unsupported message",
                    ))
                }
            },
            ExtensionType::Cookie => Extension::Cookie(Cookie::parse(&mut r)?),
            ExtensionType::PostHandshakeAuth => Extension::PostHandshakeAuth,
            ExtensionType::KeyShare => match msg_type {
                HandshakeType::ClientHello => {
                    Extension::KeyShareClientHello(KeyShareClientHello::parse(&mut r)?)
                }
                HandshakeType::ServerHello => {
                    // A HelloRetryRequest is wire-identical to a ServerHello;
                    // only the magic random tells us which key_share form to
                    // expect.
                    if is_hrr {
                        Extension::KeyShareHelloRetryRequest(KeyShareHelloRetryRequest::parse(
                            &mut r,
                        )?)
                    } else {
                        Extension::KeyShareServerHello(KeyShareServerHello::parse(&mut r)?)
                    }
                }
                _ => {
                    return Err(TlsError::illegal_parameter(
                        "key_share in unsupported message",
                    ))
                }
            },
            ExtensionType::PreSharedKey => match msg_type {
                HandshakeType::ClientHello => {
                    Extension::PreSharedKeyClientHello(OfferedPsks::parse(&mut r)?)
                }
                HandshakeType::ServerHello => Extension::PreSharedKeyServerHello(r.next_u16()?),
                _ => {
                    return Err(TlsError::illegal_parameter(
                        "pre_shared_key in unsupported message",
                    ))
                }
            },
            ExtensionType::PskKeyExchangeModes => {
                Extension::PskKeyExchangeModes(PskKeyExchangeModeList::parse(&mut r)?)
            }
            ExtensionType::EarlyData => {
                if msg_type == HandshakeType::NewSessionTicket {
                    Extension::EarlyDataIndication(Some(r.next_u32()?))
                } else {
                    Extension::EarlyDataIndication(None)
                }
            }
            _ => {
                let _ = r.rest();
                return Ok(Extension::Unknown {
                    typ: extension_type.to_u16(),
                    data,
                });
            }
        };

        r.finish()?;
        Ok(out)
    }

    pub fn serialize(&self, msg_type: HandshakeType, out: &mut Vec<u8>) -> Result<()> {
        use Extension::*;

        let typ = self.typ();
        if !typ.allowed(msg_type) {
            return Err(TlsError::internal(format!(
                "Serializing extension not allowed in this message: {:?} on {:?}",
                typ, msg_type
            )));
        }

        out.extend_from_slice(&typ.to_u16().to_be_bytes());

        serialize_varlen_vector(0, U16_LIMIT, out, |out| match self {
            ServerName(e) => {
                if let Some(e) = e {
                    e.serialize(out)
                }
            }
            MaxFragmentLength(e) => e.serialize(out),
            StatusRequest(e) => {
                if let Some(e) = e {
                    e.serialize(out)
                }
            }
            SupportedGroups(e) => e.serialize(out),
            SupportedPointFormats(e) => e.serialize(out),
            SignatureAlgorithms(e) => e.serialize(out),
            SignatureAlgorithmsCert(e) => e.serialize(out),
            Heartbeat(e) => e.serialize(out),
            ALPN(e) => e.serialize(out),
            SessionTicket(data) => out.extend_from_slice(data),
            EncryptThenMac => {}
            ExtendedMasterSecret => {}
            RecordSizeLimit(limit) => out.extend_from_slice(&limit.to_be_bytes()),
            RenegotiationInfo(data) => {
                serialize_varlen_vector(0, U8_LIMIT, out, |out| out.extend_from_slice(data))
            }
            SrpUsername(name) => {
                serialize_varlen_vector(1, U8_LIMIT, out, |out| out.extend_from_slice(name))
            }
            SupportedVersionsClientHello(e) => e.serialize(out),
            SupportedVersionsServerHello(e) => e.serialize(out),
            Cookie(e) => e.serialize(out),
            PostHandshakeAuth => {}
            KeyShareClientHello(e) => e.serialize(out),
            KeyShareHelloRetryRequest(e) => e.serialize(out),
            KeyShareServerHello(e) => e.serialize(out),
            PreSharedKeyClientHello(e) => e.serialize(out),
            PreSharedKeyServerHello(selected) => out.extend_from_slice(&selected.to_be_bytes()),
            PskKeyExchangeModes(e) => e.serialize(out),
            EarlyDataIndication(max) => {
                if let Some(max) = max {
                    out.extend_from_slice(&max.to_be_bytes());
                }
            }
            Unknown { typ: _, data } => out.extend_from_slice(data),
        });

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ExtensionType {
    ServerName,
    MaxFragmentLength,
    StatusRequest,
    SupportedGroups,
    SupportedPointFormats,
    SignatureAlgorithms,
    Srp,
    Heartbeat,
    ApplicationLayerProtocolNegotiation,
    SignedCertificateTimestamp,
    Padding,
    EncryptThenMac,
    ExtendedMasterSecret,
    RecordSizeLimit,
    SessionTicket,
    PreSharedKey,
    EarlyData,
    SupportedVersions,
    Cookie,
    PskKeyExchangeModes,
    CertificateAuthorities,
    OidFilters,
    PostHandshakeAuth,
    SignatureAlgorithmsCert,
    KeyShare,
    RenegotiationInfo,
    Unknown(u16),
}

impl ExtensionType {
    pub fn to_u16(&self) -> u16 {
        use ExtensionType::*;
        match self {
            ServerName => 0,
            MaxFragmentLength => 1,
            StatusRequest => 5,
            SupportedGroups => 10,
            SupportedPointFormats => 11,
            Srp => 12,
            SignatureAlgorithms => 13,
            Heartbeat => 15,
            ApplicationLayerProtocolNegotiation => 16,
            SignedCertificateTimestamp => 18,
            Padding => 21,
            EncryptThenMac => 22,
            ExtendedMasterSecret => 23,
            RecordSizeLimit => 28,
            SessionTicket => 35,
            PreSharedKey => 41,
            EarlyData => 42,
            SupportedVersions => 43,
            Cookie => 44,
            PskKeyExchangeModes => 45,
            CertificateAuthorities => 47,
            OidFilters => 48,
            PostHandshakeAuth => 49,
            SignatureAlgorithmsCert => 50,
            KeyShare => 51,
            RenegotiationInfo => 0xff01,
            Unknown(v) => *v,
        }
    }

    pub fn from_u16(v: u16) -> Self {
        match v {
            0 => Self::ServerName,
            1 => Self::MaxFragmentLength,
            5 => Self::StatusRequest,
            10 => Self::SupportedGroups,
            11 => Self::SupportedPointFormats,
            12 => Self::Srp,
            13 => Self::SignatureAlgorithms,
            15 => Self::Heartbeat,
            16 => Self::ApplicationLayerProtocolNegotiation,
            18 => Self::SignedCertificateTimestamp,
            21 => Self::Padding,
            22 => Self::EncryptThenMac,
            23 => Self::ExtendedMasterSecret,
            28 => Self::RecordSizeLimit,
            35 => Self::SessionTicket,
            41 => Self::PreSharedKey,
            42 => Self::EarlyData,
            43 => Self::SupportedVersions,
            44 => Self::Cookie,
            45 => Self::PskKeyExchangeModes,
            47 => Self::CertificateAuthorities,
            48 => Self::OidFilters,
            49 => Self::PostHandshakeAuth,
            50 => Self::SignatureAlgorithmsCert,
            51 => Self::KeyShare,
            0xff01 => Self::RenegotiationInfo,
            _ => Self::Unknown(v),
        }
    }

    /// See the table on https://tools.ietf.org/html/rfc8446#section-4.2 for
    /// the TLS 1.3 rows; the 1.2-only extensions additionally appear in the
    /// ServerHello.
    pub fn allowed(&self, msg_type: HandshakeType) -> bool {
        use ExtensionType::*;
        use HandshakeType::*;
        match self {
            ServerName => {
                msg_type == ClientHello
                    || msg_type == EncryptedExtensions
                    || msg_type == ServerHello
            }
            MaxFragmentLength => msg_type == ClientHello || msg_type == EncryptedExtensions,
            StatusRequest => {
                msg_type == ClientHello
                    || msg_type == ServerHello
                    || msg_type == CertificateRequest
                    || msg_type == Certificate
            }
            SupportedGroups => msg_type == ClientHello || msg_type == EncryptedExtensions,
            SupportedPointFormats => msg_type == ClientHello || msg_type == ServerHello,
            Srp => msg_type == ClientHello,
            SignatureAlgorithms => msg_type == ClientHello || msg_type == CertificateRequest,
            Heartbeat => {
                msg_type == ClientHello
                    || msg_type == ServerHello
                    || msg_type == EncryptedExtensions
            }
            ApplicationLayerProtocolNegotiation => {
                msg_type == ClientHello
                    || msg_type == EncryptedExtensions
                    || msg_type == ServerHello
            }
            SignedCertificateTimestamp => {
                msg_type == ClientHello || msg_type == CertificateRequest || msg_type == Certificate
            }
            Padding => msg_type == ClientHello,
            EncryptThenMac => msg_type == ClientHello || msg_type == ServerHello,
            ExtendedMasterSecret => msg_type == ClientHello || msg_type == ServerHello,
            RecordSizeLimit => {
                msg_type == ClientHello
                    || msg_type == ServerHello
                    || msg_type == EncryptedExtensions
            }
            SessionTicket => msg_type == ClientHello || msg_type == ServerHello,
            KeyShare => msg_type == ClientHello || msg_type == ServerHello,
            PreSharedKey => msg_type == ClientHello || msg_type == ServerHello,
            PskKeyExchangeModes => msg_type == ClientHello,
            EarlyData => {
                msg_type == ClientHello
                    || msg_type == EncryptedExtensions
                    || msg_type == NewSessionTicket
            }
            Cookie => msg_type == ClientHello || msg_type == ServerHello,
            SupportedVersions => msg_type == ClientHello || msg_type == ServerHello,
            CertificateAuthorities => msg_type == ClientHello || msg_type == CertificateRequest,
            OidFilters => msg_type == CertificateRequest,
            PostHandshakeAuth => msg_type == ClientHello,
            SignatureAlgorithmsCert => msg_type == ClientHello || msg_type == CertificateRequest,
            RenegotiationInfo => msg_type == ClientHello || msg_type == ServerHello,
            ExtensionType::Unknown(_) => true,
        }
    }
}

/// Parses an extension block, enforcing the shared structural rules:
/// no duplicated extension types, and pre_shared_key last in a ClientHello.
pub fn parse_extension_list(
    input: &mut ByteReader,
    msg_type: HandshakeType,
    is_hrr: bool,
) -> Result<Vec<Extension>> {
    let mut out = vec![];
    let mut seen: Vec<ExtensionType> = vec![];

    while !input.is_empty() {
        let e = Extension::parse(input, msg_type, is_hrr)?;
        let typ = e.typ();

        if seen.contains(&typ) {
            return Err(TlsError::illegal_parameter(format!(
                "Duplicated extension: {:?}",
                typ
            )));
        }
        seen.push(typ);

        if msg_type == HandshakeType::ClientHello {
            if let Some(prev) = out.last() {
                if matches!(prev, Extension::PreSharedKeyClientHello(_)) {
                    return Err(TlsError::illegal_parameter(
                        "pre_shared_key must be the last ClientHello extension",
                    ));
                }
            }
        }

        out.push(e);
    }

    Ok(out)
}

////////////////////////////////////////////////////////////////////////////////

/// See RFC 6066 Section 3
#[derive(Debug, Clone)]
pub struct ServerNameList {
    pub names: Vec<ServerName>,
}

impl ServerNameList {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let data = input.varlen_vector(1, U16_LIMIT)?;
        let mut r = ByteReader::new(data);

        let mut names = vec![];
        while !r.is_empty() {
            names.push(ServerName::parse(&mut r)?);
        }

        if names.is_empty() {
            return Err(TlsError::decode_error("Empty server_name list"));
        }

        Ok(Self { names })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(1, U16_LIMIT, out, |out| {
            for n in self.names.iter() {
                n.serialize(out);
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct ServerName {
    pub typ: NameType,

    /// For a host_name this is strictly ASCII.
    pub data: Bytes,
}

impl ServerName {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let typ = NameType::from_u8(input.next_u8()?);
        // NOTE: For backwards compatibility all future types must be
        // represented as a u16 number of bytes.
        let data = input.varlen_vector(1, U16_LIMIT)?;
        Ok(ServerName { typ, data })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.typ.to_u8());
        serialize_varlen_vector(1, U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.data);
        });
    }
}

tls_enum_u8!(NameType => {
    host_name(0), (255)
});

////////////////////////////////////////////////////////////////////////////////

tls_enum_u8!(MaxFragmentLength => {
    pow2_9(1),
    pow2_10(2),
    pow2_11(3),
    pow2_12(4),
    (255)
});

////////////////////////////////////////////////////////////////////////////////
// RFC 6066 section 8: OCSP status request.

tls_enum_u8!(CertificateStatusType => {
    ocsp(1), (255)
});

#[derive(Debug, Clone)]
pub struct CertificateStatusRequest {
    pub status_type: CertificateStatusType,
    pub responder_id_list: Bytes,
    pub request_extensions: Bytes,
}

impl CertificateStatusRequest {
    pub fn ocsp() -> Self {
        Self {
            status_type: CertificateStatusType::ocsp,
            responder_id_list: Bytes::new(),
            request_extensions: Bytes::new(),
        }
    }

    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let status_type = CertificateStatusType::parse(input)?;
        let responder_id_list = input.varlen_vector(0, U16_LIMIT)?;
        let request_extensions = input.varlen_vector(0, U16_LIMIT)?;
        Ok(Self {
            status_type,
            responder_id_list,
            request_extensions,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.status_type.serialize(out);
        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.responder_id_list);
        });
        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.request_extensions);
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// RFC 6520

tls_enum_u8!(HeartbeatMode => {
    peer_allowed_to_send(1),
    peer_not_allowed_to_send(2),
    (255)
});

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct NamedGroupList {
    pub groups: Vec<NamedGroup>,
}

impl NamedGroupList {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let data = input.varlen_vector(2, U16_LIMIT)?;
        let mut r = ByteReader::new(data);

        let mut groups = vec![];
        while !r.is_empty() {
            groups.push(NamedGroup::from_u16(r.next_u16()?));
        }

        Ok(NamedGroupList { groups })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(2, U16_LIMIT, out, |out| {
            for v in self.groups.iter() {
                v.serialize(out);
            }
        })
    }
}

#[derive(Debug, PartialEq, Clone, Copy, Hash, Eq)]
#[allow(non_camel_case_types)]
pub enum NamedGroup {
    // Elliptic Curve Groups (ECDHE)
    secp256r1,
    secp384r1,
    secp521r1,
    x25519,
    x448,

    // Finite Field Groups (DHE)
    ffdhe2048,
    ffdhe3072,
    ffdhe4096,
    ffdhe6144,
    ffdhe8192,

    // Hybrid KEM groups (draft-ietf-tls-ecdhe-mlkem)
    secp256r1mlkem768,
    x25519mlkem768,
    secp384r1mlkem1024,

    // Reserved Code Points
    ffdhe_private_use(u16),
    ecdhe_private_use(u16),

    Unknown(u16),
}

impl NamedGroup {
    pub fn to_u16(&self) -> u16 {
        use NamedGroup::*;
        match self {
            secp256r1 => 0x0017,
            secp384r1 => 0x0018,
            secp521r1 => 0x0019,
            x25519 => 0x001d,
            x448 => 0x001e,
            ffdhe2048 => 0x0100,
            ffdhe3072 => 0x0101,
            ffdhe4096 => 0x0102,
            ffdhe6144 => 0x0103,
            ffdhe8192 => 0x0104,
            secp256r1mlkem768 => 0x11eb,
            x25519mlkem768 => 0x11ec,
            secp384r1mlkem1024 => 0x11ed,
            ffdhe_private_use(v) => *v,
            ecdhe_private_use(v) => *v,
            Unknown(v) => *v,
        }
    }

    pub fn from_u16(v: u16) -> Self {
        match v {
            0x0017 => Self::secp256r1,
            0x0018 => Self::secp384r1,
            0x0019 => Self::secp521r1,
            0x001d => Self::x25519,
            0x001e => Self::x448,
            0x0100 => Self::ffdhe2048,
            0x0101 => Self::ffdhe3072,
            0x0102 => Self::ffdhe4096,
            0x0103 => Self::ffdhe6144,
            0x0104 => Self::ffdhe8192,
            0x11eb => Self::secp256r1mlkem768,
            0x11ec => Self::x25519mlkem768,
            0x11ed => Self::secp384r1mlkem1024,
            0x01fc..=0x01ff => Self::ffdhe_private_use(v),
            0xfe00..=0xfeff => Self::ecdhe_private_use(v),
            _ => Self::Unknown(v),
        }
    }

    pub fn is_ffdhe(&self) -> bool {
        matches!(
            self,
            Self::ffdhe2048 | Self::ffdhe3072 | Self::ffdhe4096 | Self::ffdhe6144 | Self::ffdhe8192
        )
    }

    pub fn is_hybrid_kem(&self) -> bool {
        matches!(
            self,
            Self::x25519mlkem768 | Self::secp256r1mlkem768 | Self::secp384r1mlkem1024
        )
    }

    pub fn is_elliptic_curve(&self) -> bool {
        matches!(
            self,
            Self::secp256r1 | Self::secp384r1 | Self::secp521r1 | Self::x25519 | Self::x448
        )
    }

    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        Ok(Self::from_u16(input.next_u16()?))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_u16().to_be_bytes());
    }
}

////////////////////////////////////////////////////////////////////////////////
// https://tools.ietf.org/html/rfc8446#section-4.2.3
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct SignatureSchemeList {
    pub algorithms: Vec<SignatureScheme>,
}

impl SignatureSchemeList {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let data = input.varlen_vector(2, exp2(16) - 2)?;
        let mut r = ByteReader::new(data);

        let mut algorithms = vec![];
        while !r.is_empty() {
            algorithms.push(SignatureScheme::from_value(r.next_u16()?));
        }

        Ok(Self { algorithms })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(2, exp2(16) - 2, out, |out| {
            for a in self.algorithms.iter() {
                a.serialize(out);
            }
        });
    }
}

tls_enum_u16!(
    /// NOTE: In TLS 1.2, this is the SignatureAndHashAlgorithm struct: the
    /// u16 is a tuple of the 'hash' and 'signature' algorithm ids, although
    /// not all schemes listed below are defined in 1.2.
    #[allow(non_camel_case_types)]
    SignatureScheme => {
        // RSASSA-PKCS1-v1_5 algorithms
        rsa_pkcs1_sha256 = 0x0401,
        rsa_pkcs1_sha384 = 0x0501,
        rsa_pkcs1_sha512 = 0x0601,

        // ECDSA algorithms
        ecdsa_secp256r1_sha256 = 0x0403,
        ecdsa_secp384r1_sha384 = 0x0503,
        ecdsa_secp521r1_sha512 = 0x0603,

        // RSASSA-PSS algorithms with public key OID rsaEncryption
        rsa_pss_rsae_sha256 = 0x0804,
        rsa_pss_rsae_sha384 = 0x0805,
        rsa_pss_rsae_sha512 = 0x0806,

        // EdDSA algorithms
        ed25519 = 0x0807,
        ed448 = 0x0808,

        // RSASSA-PSS algorithms with public key OID RSASSA-PSS
        rsa_pss_pss_sha256 = 0x0809,
        rsa_pss_pss_sha384 = 0x080a,
        rsa_pss_pss_sha512 = 0x080b,

        // Legacy algorithms
        rsa_pkcs1_sha1 = 0x0201,
        ecdsa_sha1 = 0x0203,

        // DSA (TLS 1.2 SignatureAndHashAlgorithm space only)
        dsa_sha1 = 0x0202,
        dsa_sha256 = 0x0402,
    }
);

impl SignatureScheme {
    pub fn hash_algorithm(&self) -> Option<crate::provider::HashAlgorithm> {
        use crate::provider::HashAlgorithm::*;
        Some(match self {
            Self::rsa_pkcs1_sha256
            | Self::ecdsa_secp256r1_sha256
            | Self::rsa_pss_rsae_sha256
            | Self::rsa_pss_pss_sha256
            | Self::dsa_sha256 => Sha256,
            Self::rsa_pkcs1_sha384 | Self::ecdsa_secp384r1_sha384 | Self::rsa_pss_rsae_sha384
            | Self::rsa_pss_pss_sha384 => Sha384,
            Self::rsa_pkcs1_sha512 | Self::ecdsa_secp521r1_sha512 | Self::rsa_pss_rsae_sha512
            | Self::rsa_pss_pss_sha512 => Sha512,
            Self::rsa_pkcs1_sha1 | Self::ecdsa_sha1 | Self::dsa_sha1 => Sha1,
            // EdDSA hashes internally.
            Self::ed25519 | Self::ed448 => return None,
            Self::Unknown(_) => return None,
        })
    }

    pub fn key_type(&self) -> Option<crate::provider::KeyType> {
        use crate::provider::KeyType;
        Some(match self {
            Self::rsa_pkcs1_sha256
            | Self::rsa_pkcs1_sha384
            | Self::rsa_pkcs1_sha512
            | Self::rsa_pkcs1_sha1
            | Self::rsa_pss_rsae_sha256
            | Self::rsa_pss_rsae_sha384
            | Self::rsa_pss_rsae_sha512
            | Self::rsa_pss_pss_sha256
            | Self::rsa_pss_pss_sha384
            | Self::rsa_pss_pss_sha512 => KeyType::Rsa,
            Self::ecdsa_secp256r1_sha256
            | Self::ecdsa_secp384r1_sha384
            | Self::ecdsa_secp521r1_sha512
            | Self::ecdsa_sha1 => KeyType::Ecdsa,
            Self::ed25519 => KeyType::Ed25519,
            Self::ed448 => KeyType::Ed448,
            Self::dsa_sha1 | Self::dsa_sha256 => KeyType::Dsa,
            Self::Unknown(_) => return None,
        })
    }

    /// Schemes that may appear in a TLS 1.3 CertificateVerify.
    pub fn allowed_in_tls13(&self) -> bool {
        !matches!(
            self,
            Self::rsa_pkcs1_sha256
                | Self::rsa_pkcs1_sha384
                | Self::rsa_pkcs1_sha512
                | Self::rsa_pkcs1_sha1
                | Self::ecdsa_sha1
                | Self::dsa_sha1
                | Self::dsa_sha256
        )
    }
}

////////////////////////////////////////////////////////////////////////////////
// RFC 8446 4.2.1. Supported Versions
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct SupportedVersionsClientHello {
    /// At least one version supported by the client.
    pub versions: Vec<ProtocolVersion>,
}

impl SupportedVersionsClientHello {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let data = input.varlen_vector(2, 254)?;
        let mut r = ByteReader::new(data);

        let mut versions = vec![];
        while !r.is_empty() {
            versions.push(r.next_u16()?);
        }

        Ok(Self { versions })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(2, 254, out, |out| {
            for v in self.versions.iter() {
                out.extend_from_slice(&v.to_be_bytes());
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct SupportedVersionsServerHello {
    pub selected_version: ProtocolVersion,
}

impl SupportedVersionsServerHello {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        Ok(Self {
            selected_version: input.next_u16()?,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.selected_version.to_be_bytes());
    }
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct Cookie {
    pub data: Bytes,
}

impl Cookie {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        Ok(Cookie {
            data: input.varlen_vector(1, U16_LIMIT)?,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(1, U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.data);
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// RFC 8446 4.2.8. Key Share
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct KeyShareClientHello {
    pub client_shares: Vec<KeyShareEntry>,
}

impl KeyShareClientHello {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let data = input.varlen_vector(0, U16_LIMIT)?;
        let mut r = ByteReader::new(data);

        let mut client_shares = vec![];
        while !r.is_empty() {
            client_shares.push(KeyShareEntry::parse(&mut r)?);
        }

        Ok(KeyShareClientHello { client_shares })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            for e in self.client_shares.iter() {
                e.serialize(out);
            }
        });
    }
}

tls_struct!(KeyShareHelloRetryRequest => {
    NamedGroup selected_group;
});

tls_struct!(KeyShareServerHello => {
    KeyShareEntry server_share;
});

#[derive(Debug, Clone)]
pub struct KeyShareEntry {
    pub group: NamedGroup,
    pub key_exchange: Bytes,
}

impl KeyShareEntry {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let group = NamedGroup::parse(input)?;
        let key_exchange = input.varlen_vector(1, U16_LIMIT)?;
        Ok(KeyShareEntry {
            group,
            key_exchange,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.group.serialize(out);
        serialize_varlen_vector(1, U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.key_exchange);
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// RFC 8446 4.2.11. Pre-Shared Key
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct PskIdentity {
    pub identity: Bytes,
    pub obfuscated_ticket_age: u32,
}

impl PskIdentity {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let identity = input.varlen_vector(1, U16_LIMIT)?;
        let obfuscated_ticket_age = input.next_u32()?;
        Ok(Self {
            identity,
            obfuscated_ticket_age,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(1, U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.identity);
        });
        out.extend_from_slice(&self.obfuscated_ticket_age.to_be_bytes());
    }
}

#[derive(Debug, Clone)]
pub struct OfferedPsks {
    pub identities: Vec<PskIdentity>,
    pub binders: Vec<Bytes>,
}

impl OfferedPsks {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let identities_data = input.varlen_vector(7, U16_LIMIT)?;
        let mut r = ByteReader::new(identities_data);
        let mut identities = vec![];
        while !r.is_empty() {
            identities.push(PskIdentity::parse(&mut r)?);
        }

        let binders_data = input.varlen_vector(33, U16_LIMIT)?;
        let mut r = ByteReader::new(binders_data);
        let mut binders = vec![];
        while !r.is_empty() {
            binders.push(r.varlen_vector(32, U8_LIMIT)?);
        }

        if binders.len() != identities.len() {
            return Err(TlsError::illegal_parameter(
                "pre_shared_key binder count does not match identity count",
            ));
        }

        Ok(Self {
            identities,
            binders,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(7, U16_LIMIT, out, |out| {
            for i in self.identities.iter() {
                i.serialize(out);
            }
        });
        serialize_varlen_vector(33, U16_LIMIT, out, |out| {
            for b in self.binders.iter() {
                serialize_varlen_vector(32, U8_LIMIT, out, |out| {
                    out.extend_from_slice(b);
                });
            }
        });
    }

    /// On-wire size of the binders list at the tail of the extension. The
    /// binder transcript covers the ClientHello truncated by exactly this
    /// many bytes.
    pub fn binders_wire_len(&self) -> usize {
        2 + self
            .binders
            .iter()
            .map(|b| 1 + b.len())
            .sum::<usize>()
    }
}

tls_enum_u8!(PskKeyExchangeMode => {
    psk_ke(0), psk_dhe_ke(1), (255)
});

#[derive(Debug, Clone)]
pub struct PskKeyExchangeModeList {
    pub modes: Vec<PskKeyExchangeMode>,
}

impl PskKeyExchangeModeList {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let data = input.varlen_vector(1, U8_LIMIT)?;
        let mut r = ByteReader::new(data);

        let mut modes = vec![];
        while !r.is_empty() {
            modes.push(PskKeyExchangeMode::parse(&mut r)?);
        }

        Ok(Self { modes })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(1, U8_LIMIT, out, |out| {
            for m in self.modes.iter() {
                m.serialize(out);
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// RFC 7301: Section 3.1

#[derive(Debug, Clone)]
pub struct ProtocolNameList {
    /// In descending order of preference.
    pub names: Vec<Bytes>,
}

impl ProtocolNameList {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let data = input.varlen_vector(2, U16_LIMIT)?;
        let mut r = ByteReader::new(data);

        let mut names = vec![];
        while !r.is_empty() {
            names.push(r.varlen_vector(1, U8_LIMIT)?);
        }

        Ok(ProtocolNameList { names })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(2, U16_LIMIT, out, |out| {
            for name in &self.names {
                serialize_varlen_vector(1, U8_LIMIT, out, |out| {
                    out.extend_from_slice(name.as_ref());
                })
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// RFC 4492: 5.1.2

tls_enum_u8!(ECPointFormat => {
    uncompressed(0), ansiX962_compressed_prime(1), ansiX962_compressed_char2(2), (255)
});

#[derive(Debug, Clone)]
pub struct ECPointFormatList {
    pub formats: Vec<ECPointFormat>,
}

impl ECPointFormatList {
    pub fn uncompressed_only() -> Self {
        Self {
            formats: vec![ECPointFormat::uncompressed],
        }
    }

    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let data = input.varlen_vector(1, U8_LIMIT)?;
        let mut r = ByteReader::new(data);

        let mut formats = vec![];
        while !r.is_empty() {
            formats.push(ECPointFormat::parse(&mut r)?);
        }

        Ok(Self { formats })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(1, U8_LIMIT, out, |out| {
            for format in &self.formats {
                format.serialize(out);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize_one(e: &Extension, msg_type: HandshakeType) -> Vec<u8> {
        let mut out = vec![];
        e.serialize(msg_type, &mut out).unwrap();
        out
    }

    #[test]
    fn duplicate_extension_rejected() {
        let ems = Extension::ExtendedMasterSecret;
        let mut block = serialize_one(&ems, HandshakeType::ClientHello);
        block.extend_from_slice(&serialize_one(&ems, HandshakeType::ClientHello));

        let mut r = ByteReader::new(block.into());
        let err = parse_extension_list(&mut r, HandshakeType::ClientHello, false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalParameter);
    }

    #[test]
    fn pre_shared_key_must_be_last() {
        let psk = Extension::PreSharedKeyClientHello(OfferedPsks {
            identities: vec![PskIdentity {
                identity: Bytes::from_static(b"alpha"),
                obfuscated_ticket_age: 0,
            }],
            binders: vec![Bytes::from(vec![0u8; 32])],
        });

        let mut block = serialize_one(&psk, HandshakeType::ClientHello);
        block.extend_from_slice(&serialize_one(
            &Extension::ExtendedMasterSecret,
            HandshakeType::ClientHello,
        ));

        let mut r = ByteReader::new(block.into());
        assert!(parse_extension_list(&mut r, HandshakeType::ClientHello, false).is_err());
    }

    #[test]
    fn extension_rejected_in_wrong_context() {
        let modes = Extension::PskKeyExchangeModes(PskKeyExchangeModeList {
            modes: vec![PskKeyExchangeMode::psk_dhe_ke],
        });
        let block = serialize_one(&modes, HandshakeType::ClientHello);

        let mut r = ByteReader::new(block.into());
        assert!(Extension::parse(&mut r, HandshakeType::ServerHello, false).is_err());
    }

    #[test]
    fn key_share_parse_depends_on_hrr_flag() {
        // A bare group id is a valid HRR key_share but not a ServerHello one.
        let hrr = Extension::KeyShareHelloRetryRequest(KeyShareHelloRetryRequest {
            selected_group: NamedGroup::secp256r1,
        });
        let block = serialize_one(&hrr, HandshakeType::ServerHello);

        let mut r = ByteReader::new(Bytes::from(block.clone()));
        let parsed = Extension::parse(&mut r, HandshakeType::ServerHello, true).unwrap();
        assert!(matches!(parsed, Extension::KeyShareHelloRetryRequest(v)
            if v.selected_group == NamedGroup::secp256r1));

        let mut r = ByteReader::new(Bytes::from(block));
        assert!(Extension::parse(&mut r, HandshakeType::ServerHello, false).is_err());
    }

    #[test]
    fn offered_psks_binder_len() {
        let psks = OfferedPsks {
            identities: vec![PskIdentity {
                identity: Bytes::from_static(b"id"),
                obfuscated_ticket_age: 7,
            }],
            binders: vec![Bytes::from(vec![0u8; 32])],
        };

        // 2 byte list length + (1 byte entry length + 32 bytes).
        assert_eq!(psks.binders_wire_len(), 35);

        let mut out = vec![];
        psks.serialize(&mut out);
        let mut r = ByteReader::new(out.into());
        let parsed = OfferedPsks::parse(&mut r).unwrap();
        assert_eq!(parsed.identities.len(), 1);
        assert_eq!(parsed.binders_wire_len(), 35);
    }

    #[test]
    fn hybrid_group_codepoints() {
        assert_eq!(NamedGroup::x25519mlkem768.to_u16(), 0x11ec);
        assert_eq!(NamedGroup::from_u16(0x11eb), NamedGroup::secp256r1mlkem768);
        assert!(NamedGroup::x25519mlkem768.is_hybrid_kem());
        assert!(!NamedGroup::x25519.is_hybrid_kem());
    }
}
