use bytes::Bytes;

use crate::cipher_suite::CipherSuite;
use crate::error::{Result, TlsError};
use crate::extensions::*;
use crate::parsing::*;
use crate::record::{ProtocolVersion, TLS_1_3_VERSION};

/// The fixed ServerHello.random value that marks a HelloRetryRequest:
/// SHA-256 of the ASCII string "HelloRetryRequest" (RFC 8446 section 4.1.3).
pub const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8,
    0x91, 0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8,
    0x33, 0x9c,
];

/*
struct {
    HandshakeType msg_type;    /* handshake type */
    uint24 length;             /* remaining bytes in message */
    select (Handshake.msg_type) { ... };
} Handshake;
*/

#[derive(Debug)]
pub enum Handshake {
    HelloRequest,
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    EndOfEarlyData,
    EncryptedExtensions(EncryptedExtensions),
    CertificateRequest(CertificateRequest),
    CertificateRequestTls12(CertificateRequestTls12),
    Certificate(Certificate),
    CertificateVerify(CertificateVerify),
    CertificateStatus(CertificateStatus),
    Finished(Finished),
    NewSessionTicket(NewSessionTicket),
    NewSessionTicketTls12(NewSessionTicketTls12),
    KeyUpdate(KeyUpdate),
    ServerHelloDone,
    ClientKeyExchange(ClientKeyExchange),
    ServerKeyExchange(ServerKeyExchange),
    NextProtocol(NextProtocol),
}

impl Handshake {
    pub fn typ(&self) -> HandshakeType {
        match self {
            Handshake::HelloRequest => HandshakeType::HelloRequest,
            Handshake::ClientHello(_) => HandshakeType::ClientHello,
            Handshake::ServerHello(_) => HandshakeType::ServerHello,
            Handshake::EndOfEarlyData => HandshakeType::EndOfEarlyData,
            Handshake::EncryptedExtensions(_) => HandshakeType::EncryptedExtensions,
            Handshake::CertificateRequest(_) => HandshakeType::CertificateRequest,
            Handshake::CertificateRequestTls12(_) => HandshakeType::CertificateRequest,
            Handshake::Certificate(_) => HandshakeType::Certificate,
            Handshake::CertificateVerify(_) => HandshakeType::CertificateVerify,
            Handshake::CertificateStatus(_) => HandshakeType::CertificateStatus,
            Handshake::Finished(_) => HandshakeType::Finished,
            Handshake::NewSessionTicket(_) => HandshakeType::NewSessionTicket,
            Handshake::NewSessionTicketTls12(_) => HandshakeType::NewSessionTicket,
            Handshake::KeyUpdate(_) => HandshakeType::KeyUpdate,
            Handshake::ServerHelloDone => HandshakeType::ServerHelloDone,
            Handshake::ClientKeyExchange(_) => HandshakeType::ClientKeyExchange,
            Handshake::ServerKeyExchange(_) => HandshakeType::ServerKeyExchange,
            Handshake::NextProtocol(_) => HandshakeType::NextProtocol,
        }
    }

    /// Parses one complete handshake message (header included). The
    /// defragmenter guarantees completeness before this is called.
    pub fn parse(input: Bytes, protocol_version: ProtocolVersion) -> Result<Self> {
        let mut c = ByteReader::new(input);

        let msg_type = HandshakeType::parse(&mut c)?;
        let payload = c.varlen_vector(0, U24_LIMIT)?;
        c.finish()?;

        let mut r = ByteReader::new(payload);

        let out = match msg_type {
            HandshakeType::HelloRequest => Handshake::HelloRequest,
            HandshakeType::ClientHello => Handshake::ClientHello(ClientHello::parse(&mut r)?),
            HandshakeType::ServerHello => Handshake::ServerHello(ServerHello::parse(&mut r)?),
            HandshakeType::EndOfEarlyData => Handshake::EndOfEarlyData,
            HandshakeType::EncryptedExtensions => {
                Handshake::EncryptedExtensions(EncryptedExtensions::parse(&mut r)?)
            }
            HandshakeType::CertificateRequest => {
                if protocol_version == TLS_1_3_VERSION {
                    Handshake::CertificateRequest(CertificateRequest::parse(&mut r)?)
                } else {
                    Handshake::CertificateRequestTls12(CertificateRequestTls12::parse(&mut r)?)
                }
            }
            HandshakeType::Certificate => {
                Handshake::Certificate(Certificate::parse(&mut r, protocol_version)?)
            }
            HandshakeType::CertificateVerify => {
                Handshake::CertificateVerify(CertificateVerify::parse(&mut r)?)
            }
            HandshakeType::CertificateStatus => {
                Handshake::CertificateStatus(CertificateStatus::parse(&mut r)?)
            }
            HandshakeType::Finished => Handshake::Finished(Finished { verify_data: r.rest() }),
            HandshakeType::NewSessionTicket => {
                if protocol_version == TLS_1_3_VERSION {
                    Handshake::NewSessionTicket(NewSessionTicket::parse(&mut r)?)
                } else {
                    Handshake::NewSessionTicketTls12(NewSessionTicketTls12::parse(&mut r)?)
                }
            }
            HandshakeType::KeyUpdate => Handshake::KeyUpdate(KeyUpdate::parse(&mut r)?),
            HandshakeType::ServerHelloDone => Handshake::ServerHelloDone,
            HandshakeType::ClientKeyExchange => {
                Handshake::ClientKeyExchange(ClientKeyExchange { data: r.rest() })
            }
            HandshakeType::ServerKeyExchange => {
                Handshake::ServerKeyExchange(ServerKeyExchange { data: r.rest() })
            }
            HandshakeType::NextProtocol => Handshake::NextProtocol(NextProtocol::parse(&mut r)?),
            _ => {
                return Err(TlsError::unexpected_message(format!(
                    "Unsupported handshake type: {:?}",
                    msg_type
                )));
            }
        };

        if matches!(
            out,
            Handshake::HelloRequest | Handshake::EndOfEarlyData | Handshake::ServerHelloDone
        ) && !r.is_empty()
        {
            return Err(TlsError::decode_error("Expected empty handshake body"));
        }

        r.finish()?;
        Ok(out)
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.typ().serialize(out);

        serialize_varlen_vector(0, U24_LIMIT, out, |out| match self {
            Handshake::HelloRequest => {}
            Handshake::ClientHello(v) => v.serialize(out),
            Handshake::ServerHello(v) => v.serialize(out),
            Handshake::EndOfEarlyData => {}
            Handshake::EncryptedExtensions(v) => v.serialize(out),
            Handshake::CertificateRequest(v) => v.serialize(out),
            Handshake::CertificateRequestTls12(v) => v.serialize(out),
            Handshake::Certificate(v) => v.serialize(out),
            Handshake::CertificateVerify(v) => v.serialize(out),
            Handshake::CertificateStatus(v) => v.serialize(out),
            Handshake::Finished(v) => v.serialize(out),
            Handshake::NewSessionTicket(v) => v.serialize(out),
            Handshake::NewSessionTicketTls12(v) => v.serialize(out),
            Handshake::KeyUpdate(v) => v.serialize(out),
            Handshake::ServerHelloDone => {}
            Handshake::ClientKeyExchange(v) => out.extend_from_slice(&v.data),
            Handshake::ServerKeyExchange(v) => out.extend_from_slice(&v.data),
            Handshake::NextProtocol(v) => v.serialize(out),
        });
    }

    /// Serialized wire form, as fed to the handshake transcript.
    pub fn to_bytes(&self) -> Bytes {
        let mut data = vec![];
        self.serialize(&mut data);
        data.into()
    }
}

tls_enum_u8!(HandshakeType => {
    HelloRequest(0), // TLS 1.2
    ClientHello(1),
    ServerHello(2),
    NewSessionTicket(4),
    EndOfEarlyData(5),
    EncryptedExtensions(8),
    Certificate(11),
    ServerKeyExchange(12), // TLS 1.2
    CertificateRequest(13),
    ServerHelloDone(14), // TLS 1.2
    CertificateVerify(15),
    ClientKeyExchange(16), // TLS 1.2
    Finished(20),
    CertificateStatus(22), // TLS 1.2, RFC 6066
    KeyUpdate(24),
    NextProtocol(67),
    MessageHash(254),
    (255)
});

////////////////////////////////////////////////////////////////////////////////
// https://tools.ietf.org/html/rfc8446#section-4.1.2
// TLS 1.2 form: https://tools.ietf.org/html/rfc5246#section-7.4.1.2
////////////////////////////////////////////////////////////////////////////////

/*
struct {
    ProtocolVersion legacy_version = 0x0303;    /* TLS v1.2 */
    Random random;
    opaque legacy_session_id<0..32>;
    CipherSuite cipher_suites<2..2^16-2>;
    opaque legacy_compression_methods<1..2^8-1>;
    Extension extensions<8..2^16-1>;
} ClientHello;
*/
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub legacy_version: ProtocolVersion,
    // 32 random bytes
    pub random: Bytes,
    // 0-32 bytes
    pub legacy_session_id: Bytes,
    pub cipher_suites: Vec<CipherSuite>,
    pub legacy_compression_methods: Bytes,
    pub extensions: Vec<Extension>,
}

impl ClientHello {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let legacy_version = input.next_u16()?;
        let random = input.take_exact(32)?;
        let legacy_session_id = input.varlen_vector(0, 32)?;

        let cipher_suites = {
            let data = input.varlen_vector(2, exp2(16) - 2)?;
            if data.len() % 2 != 0 {
                return Err(TlsError::decode_error(
                    "cipher_suites length not a multiple of 2",
                ));
            }

            let mut r = ByteReader::new(data);
            let mut arr = vec![];
            while !r.is_empty() {
                arr.push(CipherSuite::from_value(r.next_u16()?));
            }
            arr
        };

        let legacy_compression_methods = input.varlen_vector(1, U8_LIMIT)?;

        let extensions = if input.is_empty() {
            // Extension-less ClientHellos are still legal in TLS 1.2.
            vec![]
        } else {
            let data = input.varlen_vector(0, U16_LIMIT)?;
            let mut r = ByteReader::new(data);
            parse_extension_list(&mut r, HandshakeType::ClientHello, false)?
        };

        Ok(ClientHello {
            legacy_version,
            random,
            legacy_session_id,
            cipher_suites,
            legacy_compression_methods,
            extensions,
        })
    }

    /// Translates an SSLv2-framed CLIENT-HELLO body (starting at its
    /// msg_type byte) into the normal form. Tolerated from old clients
    /// probing for an upgrade; only the 2-byte cipher specs survive.
    pub fn parse_sslv2(input: Bytes) -> Result<Self> {
        let mut r = ByteReader::new(input);

        let msg_type = r.next_u8()?;
        if msg_type != 1 {
            return Err(TlsError::unexpected_message("Not an SSLv2 ClientHello"));
        }

        let legacy_version = r.next_u16()?;
        let cipher_specs_len = r.next_u16()? as usize;
        let session_id_len = r.next_u16()? as usize;
        let challenge_len = r.next_u16()? as usize;

        if cipher_specs_len % 3 != 0 {
            return Err(TlsError::decode_error(
                "SSLv2 cipher specs length not a multiple of 3",
            ));
        }

        let cipher_specs = r.take_exact(cipher_specs_len)?;
        let legacy_session_id = r.take_exact(session_id_len)?;
        let challenge = r.take_exact(challenge_len)?;
        r.finish()?;

        let mut cipher_suites = vec![];
        for spec in cipher_specs.chunks(3) {
            // 3-byte V2 codes with a leading zero byte are V3+ suites.
            if spec[0] == 0 {
                cipher_suites.push(CipherSuite::from_value(u16::from_be_bytes([
                    spec[1], spec[2],
                ])));
            }
        }

        // The challenge becomes the right-aligned tail of the 32-byte random.
        let mut random = vec![0u8; 32];
        let n = challenge.len().min(32);
        random[(32 - n)..].copy_from_slice(&challenge[challenge.len() - n..]);

        Ok(ClientHello {
            legacy_version,
            random: random.into(),
            legacy_session_id,
            cipher_suites,
            legacy_compression_methods: Bytes::from_static(&[0]),
            extensions: vec![],
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.legacy_version.to_be_bytes());
        assert_eq!(self.random.len(), 32);
        out.extend_from_slice(&self.random);

        serialize_varlen_vector(0, 32, out, |out| {
            out.extend_from_slice(&self.legacy_session_id);
        });
        serialize_varlen_vector(2, exp2(16) - 2, out, |out| {
            for c in self.cipher_suites.iter() {
                c.serialize(out);
            }
        });
        serialize_varlen_vector(1, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.legacy_compression_methods);
        });
        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            for e in self.extensions.iter() {
                e.serialize(HandshakeType::ClientHello, out).unwrap();
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// RFC 8446 4.1.3. Server Hello
////////////////////////////////////////////////////////////////////////////////

/*
struct {
    ProtocolVersion legacy_version = 0x0303;    /* TLS v1.2 */
    Random random;
    opaque legacy_session_id_echo<0..32>;
    CipherSuite cipher_suite;
    uint8 legacy_compression_method = 0;
    Extension extensions<6..2^16-1>;
} ServerHello;
*/

#[derive(Debug, Clone)]
pub struct ServerHello {
    pub legacy_version: ProtocolVersion,
    pub random: Bytes,
    pub legacy_session_id_echo: Bytes,
    pub cipher_suite: CipherSuite,
    pub legacy_compression_method: u8,
    pub extensions: Vec<Extension>,
}

impl ServerHello {
    /// A HelloRetryRequest is recognized purely by the magic random,
    /// regardless of any other field.
    pub fn is_hello_retry_request(&self) -> bool {
        self.random[..] == HELLO_RETRY_REQUEST_RANDOM[..]
    }

    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let legacy_version = input.next_u16()?;
        let random = input.take_exact(32)?;
        let legacy_session_id_echo = input.varlen_vector(0, 32)?;
        let cipher_suite = CipherSuite::parse(input)?;
        let legacy_compression_method = input.next_u8()?;

        let is_hrr = random[..] == HELLO_RETRY_REQUEST_RANDOM[..];

        let extensions = if input.is_empty() {
            vec![]
        } else {
            let data = input.varlen_vector(0, U16_LIMIT)?;
            let mut r = ByteReader::new(data);
            parse_extension_list(&mut r, HandshakeType::ServerHello, is_hrr)?
        };

        Ok(Self {
            legacy_version,
            random,
            legacy_session_id_echo,
            cipher_suite,
            legacy_compression_method,
            extensions,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.legacy_version.to_be_bytes());
        out.extend_from_slice(&self.random);
        serialize_varlen_vector(0, 32, out, |out| {
            out.extend_from_slice(&self.legacy_session_id_echo);
        });
        self.cipher_suite.serialize(out);
        out.push(self.legacy_compression_method);
        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            for e in self.extensions.iter() {
                e.serialize(HandshakeType::ServerHello, out).unwrap();
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////

/*
struct {
    uint32 ticket_lifetime;
    uint32 ticket_age_add;
    opaque ticket_nonce<0..255>;
    opaque ticket<1..2^16-1>;
    Extension extensions<0..2^16-2>;
} NewSessionTicket;
*/

#[derive(Debug)]
pub struct NewSessionTicket {
    pub ticket_lifetime: u32,
    pub ticket_age_add: u32,
    pub ticket_nonce: Bytes,
    pub ticket: Bytes,
    pub extensions: Vec<Extension>,
}

impl NewSessionTicket {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let ticket_lifetime = input.next_u32()?;
        let ticket_age_add = input.next_u32()?;
        let ticket_nonce = input.varlen_vector(0, U8_LIMIT)?;
        let ticket = input.varlen_vector(1, U16_LIMIT)?;

        let extensions_data = input.varlen_vector(0, U16_LIMIT - 1)?;
        let mut r = ByteReader::new(extensions_data);
        let extensions = parse_extension_list(&mut r, HandshakeType::NewSessionTicket, false)?;

        Ok(Self {
            ticket_lifetime,
            ticket_age_add,
            ticket_nonce,
            ticket,
            extensions,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ticket_lifetime.to_be_bytes());
        out.extend_from_slice(&self.ticket_age_add.to_be_bytes());
        serialize_varlen_vector(0, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.ticket_nonce)
        });
        serialize_varlen_vector(1, U16_LIMIT, out, |out| out.extend_from_slice(&self.ticket));
        serialize_varlen_vector(0, U16_LIMIT - 1, out, |out| {
            for extension in &self.extensions {
                extension
                    .serialize(HandshakeType::NewSessionTicket, out)
                    .unwrap();
            }
        });
    }
}

/// RFC 5077 form.
#[derive(Debug)]
pub struct NewSessionTicketTls12 {
    pub ticket_lifetime_hint: u32,
    pub ticket: Bytes,
}

impl NewSessionTicketTls12 {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let ticket_lifetime_hint = input.next_u32()?;
        let ticket = input.varlen_vector(0, U16_LIMIT)?;
        Ok(Self {
            ticket_lifetime_hint,
            ticket,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ticket_lifetime_hint.to_be_bytes());
        serialize_varlen_vector(0, U16_LIMIT, out, |out| out.extend_from_slice(&self.ticket));
    }
}

////////////////////////////////////////////////////////////////////////////////

/*
struct {
    Extension extensions<0..2^16-1>;
} EncryptedExtensions;
*/

#[derive(Debug)]
pub struct EncryptedExtensions {
    pub extensions: Vec<Extension>,
}

impl EncryptedExtensions {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let data = input.varlen_vector(0, U16_LIMIT)?;
        let mut r = ByteReader::new(data);
        let extensions = parse_extension_list(&mut r, HandshakeType::EncryptedExtensions, false)?;
        Ok(Self { extensions })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            for e in self.extensions.iter() {
                e.serialize(HandshakeType::EncryptedExtensions, out).unwrap();
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////

/*
TLS 1.3:
struct {
    opaque certificate_request_context<0..2^8-1>;
    CertificateEntry certificate_list<0..2^24-1>;
} Certificate;

TLS 1.2:
opaque ASN.1Cert<1..2^24-1>;
struct {
    ASN.1Cert certificate_list<0..2^24-1>;
} Certificate;
*/

#[derive(Debug)]
pub struct Certificate {
    pub certificate_request_context: Bytes,
    pub certificate_list: Vec<CertificateEntry>,
}

impl Certificate {
    pub fn parse(input: &mut ByteReader, protocol_version: ProtocolVersion) -> Result<Self> {
        if protocol_version == TLS_1_3_VERSION {
            let certificate_request_context = input.varlen_vector(0, U8_LIMIT)?;
            let data = input.varlen_vector(0, U24_LIMIT)?;
            let mut r = ByteReader::new(data);

            let mut certificate_list = vec![];
            while !r.is_empty() {
                certificate_list.push(CertificateEntry::parse(&mut r)?);
            }

            Ok(Self {
                certificate_request_context,
                certificate_list,
            })
        } else {
            let data = input.varlen_vector(0, U24_LIMIT)?;
            let mut r = ByteReader::new(data);

            let mut certificate_list = vec![];
            while !r.is_empty() {
                let cert = r.varlen_vector(1, U24_LIMIT)?;
                certificate_list.push(CertificateEntry {
                    cert,
                    extensions: vec![],
                });
            }

            Ok(Self {
                certificate_request_context: Bytes::new(),
                certificate_list,
            })
        }
    }

    pub fn serialize_tls13(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(0, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.certificate_request_context);
        });
        serialize_varlen_vector(0, U24_LIMIT, out, |out| {
            for c in self.certificate_list.iter() {
                c.serialize(out);
            }
        });
    }

    pub fn serialize_tls12(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(0, U24_LIMIT, out, |out| {
            for c in self.certificate_list.iter() {
                serialize_varlen_vector(1, U24_LIMIT, out, |out| {
                    out.extend_from_slice(&c.cert);
                });
            }
        });
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        // The enclosing flow picks the encoding; TLS 1.2 senders go through
        // Handshake12Certificate below.
        self.serialize_tls13(out)
    }
}

/// Wrapper used when sending a Certificate under TLS 1.2 framing.
pub fn serialize_certificate_message(
    cert: &Certificate,
    protocol_version: ProtocolVersion,
) -> Bytes {
    let mut out = vec![];
    HandshakeType::Certificate.serialize(&mut out);
    serialize_varlen_vector(0, U24_LIMIT, &mut out, |out| {
        if protocol_version == TLS_1_3_VERSION {
            cert.serialize_tls13(out)
        } else {
            cert.serialize_tls12(out)
        }
    });
    out.into()
}

/// NOTE: Only supports being placed in a Certificate message.
#[derive(Debug)]
pub struct CertificateEntry {
    pub cert: Bytes,
    pub extensions: Vec<Extension>,
}

impl CertificateEntry {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let cert = input.varlen_vector(1, U24_LIMIT)?;
        let data = input.varlen_vector(0, U16_LIMIT)?;
        let mut r = ByteReader::new(data);
        let extensions = parse_extension_list(&mut r, HandshakeType::Certificate, false)?;

        Ok(Self { cert, extensions })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(1, U24_LIMIT, out, |out| {
            out.extend_from_slice(&self.cert);
        });
        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            for e in self.extensions.iter() {
                e.serialize(HandshakeType::Certificate, out).unwrap();
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////

/*
TLS 1.3:
struct {
    opaque certificate_request_context<0..2^8-1>;
    Extension extensions<2..2^16-1>;
} CertificateRequest;
*/

#[derive(Debug)]
pub struct CertificateRequest {
    pub certificate_request_context: Bytes,
    pub extensions: Vec<Extension>,
}

impl CertificateRequest {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let certificate_request_context = input.varlen_vector(0, U8_LIMIT)?;
        let data = input.varlen_vector(2, U16_LIMIT)?;
        let mut r = ByteReader::new(data);
        let extensions = parse_extension_list(&mut r, HandshakeType::CertificateRequest, false)?;

        Ok(Self {
            certificate_request_context,
            extensions,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(0, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.certificate_request_context);
        });
        serialize_varlen_vector(2, U16_LIMIT, out, |out| {
            for e in self.extensions.iter() {
                e.serialize(HandshakeType::CertificateRequest, out).unwrap();
            }
        });
    }
}

/*
TLS 1.2 (RFC 5246 7.4.4):
struct {
    ClientCertificateType certificate_types<1..2^8-1>;
    SignatureAndHashAlgorithm supported_signature_algorithms<2..2^16-2>;
    DistinguishedName certificate_authorities<0..2^16-1>;
} CertificateRequest;
*/

#[derive(Debug)]
pub struct CertificateRequestTls12 {
    pub certificate_types: Bytes,
    pub supported_signature_algorithms: Vec<SignatureScheme>,
    pub certificate_authorities: Bytes,
}

pub const CLIENT_CERTIFICATE_TYPE_RSA_SIGN: u8 = 1;
pub const CLIENT_CERTIFICATE_TYPE_ECDSA_SIGN: u8 = 64;

impl CertificateRequestTls12 {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let certificate_types = input.varlen_vector(1, U8_LIMIT)?;
        let supported_signature_algorithms = SignatureSchemeList::parse(input)?.algorithms;
        let certificate_authorities = input.varlen_vector(0, U16_LIMIT)?;

        Ok(Self {
            certificate_types,
            supported_signature_algorithms,
            certificate_authorities,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(1, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.certificate_types);
        });
        SignatureSchemeList {
            algorithms: self.supported_signature_algorithms.clone(),
        }
        .serialize(out);
        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.certificate_authorities);
        });
    }
}

////////////////////////////////////////////////////////////////////////////////

/// The CertificateVerify message in TLS 1.3 and the DigitallySigned struct
/// in TLS 1.2.
#[derive(Debug, Clone)]
pub struct CertificateVerify {
    pub algorithm: SignatureScheme,
    pub signature: Bytes,
}

impl CertificateVerify {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let algorithm = SignatureScheme::parse(input)?;
        let signature = input.varlen_vector(0, U16_LIMIT)?;
        Ok(Self {
            algorithm,
            signature,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.algorithm.serialize(out);
        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.signature);
        });
    }
}

////////////////////////////////////////////////////////////////////////////////

/// RFC 6066 section 8: the stapled OCSP response.
#[derive(Debug)]
pub struct CertificateStatus {
    pub status_type: CertificateStatusType,
    pub response: Bytes,
}

impl CertificateStatus {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let status_type = CertificateStatusType::parse(input)?;
        let response = input.varlen_vector(1, U24_LIMIT)?;
        Ok(Self {
            status_type,
            response,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.status_type.serialize(out);
        serialize_varlen_vector(1, U24_LIMIT, out, |out| {
            out.extend_from_slice(&self.response);
        });
    }
}

////////////////////////////////////////////////////////////////////////////////

/*
struct {
    opaque verify_data[Hash.length];
} Finished;
*/

#[derive(Debug)]
pub struct Finished {
    pub verify_data: Bytes,
}

impl Finished {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.verify_data);
    }
}

////////////////////////////////////////////////////////////////////////////////

tls_struct!(KeyUpdate => {
    KeyUpdateRequest request_update;
});

tls_enum_u8!(KeyUpdateRequest => {
    update_not_requested(0), update_requested(1), (255)
});

////////////////////////////////////////////////////////////////////////////////

/// NPN's NextProtocol message. Recognized but never negotiated by this
/// engine; kept so the catalog can name it on rejection.
#[derive(Debug)]
pub struct NextProtocol {
    pub selected_protocol: Bytes,
    pub padding: Bytes,
}

impl NextProtocol {
    pub fn parse(input: &mut ByteReader) -> Result<Self> {
        let selected_protocol = input.varlen_vector(0, U8_LIMIT)?;
        let padding = input.varlen_vector(0, U8_LIMIT)?;
        Ok(Self {
            selected_protocol,
            padding,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(0, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.selected_protocol);
        });
        serialize_varlen_vector(0, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.padding);
        });
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Opaque ServerKeyExchange payload. The layout depends on the negotiated key
/// exchange method; the dispatcher in key_exchange decodes it.
#[derive(Debug)]
pub struct ServerKeyExchange {
    pub data: Bytes,
}

/// Opaque ClientKeyExchange payload, same deal.
#[derive(Debug)]
pub struct ClientKeyExchange {
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_roundtrip() {
        let ch = ClientHello {
            legacy_version: crate::record::TLS_1_2_VERSION,
            random: Bytes::from(vec![7u8; 32]),
            legacy_session_id: Bytes::new(),
            cipher_suites: vec![
                CipherSuite::TLS_AES_128_GCM_SHA256,
                CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            ],
            legacy_compression_methods: Bytes::from_static(&[0]),
            extensions: vec![Extension::ExtendedMasterSecret],
        };

        let msg = Handshake::ClientHello(ch).to_bytes();
        let parsed = Handshake::parse(msg, crate::record::TLS_1_2_VERSION).unwrap();

        match parsed {
            Handshake::ClientHello(v) => {
                assert_eq!(v.random.len(), 32);
                assert_eq!(v.cipher_suites.len(), 2);
                assert_eq!(v.extensions.len(), 1);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut msg = Handshake::ServerHelloDone.to_bytes().to_vec();
        // Claim a one byte body for a message which must be empty.
        msg[3] = 1;
        msg.push(0xcc);
        assert!(Handshake::parse(msg.into(), crate::record::TLS_1_2_VERSION).is_err());
    }

    #[test]
    fn sslv2_client_hello_translates() {
        // msg_type=1, version=0x0301, 6 bytes of cipher specs,
        // no session id, 16 byte challenge.
        let mut v2 = vec![1u8, 0x03, 0x01, 0x00, 0x06, 0x00, 0x00, 0x00, 0x10];
        v2.extend_from_slice(&[0x00, 0x00, 0x2f]); // TLS_RSA_WITH_AES_128_CBC_SHA
        v2.extend_from_slice(&[0x07, 0x00, 0xc0]); // V2-only cipher, dropped
        v2.extend_from_slice(&[0xabu8; 16]); // challenge

        let ch = ClientHello::parse_sslv2(v2.into()).unwrap();
        assert_eq!(ch.legacy_version, crate::record::TLS_1_0_VERSION);
        assert_eq!(
            ch.cipher_suites,
            vec![CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA]
        );
        assert_eq!(ch.random.len(), 32);
        assert_eq!(&ch.random[..16], &[0u8; 16]);
        assert_eq!(&ch.random[16..], &[0xabu8; 16]);
    }

    #[test]
    fn hello_retry_request_detected_by_random() {
        let sh = ServerHello {
            legacy_version: crate::record::TLS_1_2_VERSION,
            random: Bytes::from(HELLO_RETRY_REQUEST_RANDOM.to_vec()),
            legacy_session_id_echo: Bytes::new(),
            cipher_suite: CipherSuite::TLS_AES_128_GCM_SHA256,
            legacy_compression_method: 0,
            extensions: vec![],
        };
        assert!(sh.is_hello_retry_request());
    }
}
