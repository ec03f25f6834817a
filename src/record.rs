// Big-endian network order
//
// https://tools.ietf.org/html/rfc8446

use async_std::io::prelude::*;
use bytes::Bytes;

use crate::error::{Result, TlsError};
use crate::parsing::*;

// 'Implementations MUST NOT send zero-length fragments of Handshake,
// Alert, or ChangeCipherSpec content types.  Zero-length fragments of
// Application data MAY be sent as they are potentially useful as a
// traffic analysis countermeasure.'

pub const SSL_3_0_VERSION: u16 = 0x0300;
pub const TLS_1_0_VERSION: u16 = 0x0301;
pub const TLS_1_1_VERSION: u16 = 0x0302;
pub const TLS_1_2_VERSION: u16 = 0x0303;
pub const TLS_1_3_VERSION: u16 = 0x0304;

pub type ProtocolVersion = u16;

/// Maximum size of one record's plaintext fragment.
pub const MAX_PLAINTEXT_RECORD_SIZE: usize = 1 << 14;

/// Encryption overhead slack allowed on top of the plaintext limit. TLS 1.3
/// allows 256 bytes of AEAD expansion; older versions allow 2048 bytes of
/// padding + MAC + IV.
pub const MAX_CIPHERTEXT_EXPANSION_TLS13: usize = 256;
pub const MAX_CIPHERTEXT_EXPANSION_LEGACY: usize = 2048;

pub type StreamReader = Box<dyn Read + Send + Unpin>;
pub type StreamWriter = Box<dyn Write + Send + Unpin>;

/// Outer most data type transmitted on the wire.
#[derive(Debug)]
pub struct Record {
    pub typ: ContentType,
    pub legacy_record_version: ProtocolVersion,
    /// Once encryption starts, this is ciphertext.
    pub data: Bytes,
}

/// What kind of header the next record on a connection is allowed to carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordHeaderMode {
    /// Standard 5-byte SSLv3/TLS header only.
    Tls,
    /// Also tolerate a 2/3-byte SSLv2 header. Only ever allowed for the very
    /// first record received by a server, where old clients may probe with an
    /// SSLv2-formatted ClientHello. A first byte that is not a known TLS
    /// content type is taken as the start of an SSLv2 header.
    TlsOrSslv2,
}

impl Record {
    pub async fn read(
        reader: &mut StreamReader,
        mode: RecordHeaderMode,
        max_ciphertext_size: usize,
    ) -> Result<Record> {
        let mut first = [0u8; 1];
        reader.read_exact(&mut first).await?;

        if mode == RecordHeaderMode::TlsOrSslv2 && !matches!(first[0], 20..=24) {
            return Self::read_sslv2(reader, first[0]).await;
        }

        let mut rest = [0u8; 4];
        reader.read_exact(&mut rest).await?;

        let typ = ContentType::from_u8(first[0]);
        let legacy_record_version = u16::from_be_bytes(*array_ref![rest, 0, 2]);
        let length = u16::from_be_bytes(*array_ref![rest, 2, 2]) as usize;

        if length > max_ciphertext_size {
            return Err(TlsError::record_overflow("Record larger than allowed"));
        }

        let mut data = vec![0u8; length];
        reader.read_exact(&mut data).await?;

        Ok(Record {
            typ,
            legacy_record_version,
            data: Bytes::from(data),
        })
    }

    /// Reads the body of an SSLv2-framed record. Only the ClientHello payload
    /// is tolerated here; it gets translated into the normal form by the
    /// handshake message parser.
    async fn read_sslv2(reader: &mut StreamReader, first: u8) -> Result<Record> {
        let mut second = [0u8; 1];
        reader.read_exact(&mut second).await?;

        let length = ((first as usize & 0x7f) << 8) | second[0] as usize;

        // A set high bit marks the 2-byte header with no padding. With the
        // high bit clear the header is 3 bytes: a padding length field sits
        // between the length and the record body, and that many trailing
        // bytes of the body are padding.
        let padding = if (first & 0x80) != 0 {
            0
        } else {
            let mut pad = [0u8; 1];
            reader.read_exact(&mut pad).await?;
            pad[0] as usize
        };

        if length < 3 || padding >= length || length - padding < 3 {
            return Err(TlsError::decode_error("Truncated SSLv2 record"));
        }

        let mut data = vec![0u8; length];
        reader.read_exact(&mut data).await?;
        data.truncate(length - padding);

        if data[0] != 1 {
            // Not an SSLv2 CLIENT-HELLO.
            return Err(TlsError::unexpected_message(
                "Only the SSLv2 ClientHello is tolerated",
            ));
        }

        // The claimed protocol version follows the message type.
        let legacy_record_version = u16::from_be_bytes(*array_ref![data, 1, 2]);

        Ok(Record {
            typ: ContentType::Sslv2Handshake,
            legacy_record_version,
            data: Bytes::from(data),
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.typ.to_u8());
        out.extend_from_slice(&self.legacy_record_version.to_be_bytes());
        assert!(self.data.len() < U16_LIMIT);
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
    }
}

tls_enum_u8!(ContentType => {
    Invalid(0),
    ChangeCipherSpec(20),
    Alert(21),
    Handshake(22),
    ApplicationData(23),
    Heartbeat(24),
    // Pseudo content type for the tolerated SSLv2 ClientHello. Never appears
    // in a real 5-byte header (26 is unassigned).
    Sslv2Handshake(26),
    (255)
});

/// The plaintext form of a record (after decryption, before encryption).
pub struct RecordInner {
    pub typ: ContentType,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sslv2_client_hello_body() -> Vec<u8> {
        // msg_type=1, version=0x0301, 3 bytes of cipher specs, no session
        // id, 16 byte challenge.
        let mut body = vec![1u8, 0x03, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00, 0x10];
        body.extend_from_slice(&[0x00, 0x00, 0x2f]);
        body.extend_from_slice(&[0xabu8; 16]);
        body
    }

    async fn read_record(wire: Vec<u8>, mode: RecordHeaderMode) -> crate::error::Result<Record> {
        let mut reader: StreamReader = Box::new(async_std::io::Cursor::new(wire));
        Record::read(&mut reader, mode, MAX_PLAINTEXT_RECORD_SIZE).await
    }

    #[test]
    fn sslv2_two_byte_header() {
        let body = sslv2_client_hello_body();

        let mut wire = vec![0x80 | ((body.len() >> 8) as u8), body.len() as u8];
        wire.extend_from_slice(&body);

        let record = async_std::task::block_on(read_record(wire, RecordHeaderMode::TlsOrSslv2))
            .unwrap();
        assert_eq!(record.typ, ContentType::Sslv2Handshake);
        assert_eq!(record.legacy_record_version, TLS_1_0_VERSION);
        assert_eq!(&record.data[..], &body[..]);
    }

    #[test]
    fn sslv2_three_byte_header_strips_padding() {
        let body = sslv2_client_hello_body();
        let padding = 4usize;

        // High bit clear: length counts the body plus the trailing padding,
        // and a 1-byte padding length field completes the header.
        let length = body.len() + padding;
        let mut wire = vec![(length >> 8) as u8, length as u8, padding as u8];
        wire.extend_from_slice(&body);
        wire.extend_from_slice(&[0u8; 4]);

        let record = async_std::task::block_on(read_record(wire, RecordHeaderMode::TlsOrSslv2))
            .unwrap();
        assert_eq!(record.typ, ContentType::Sslv2Handshake);
        assert_eq!(&record.data[..], &body[..]);
    }

    #[test]
    fn sslv2_rejected_outside_first_record_mode() {
        let body = sslv2_client_hello_body();
        let mut wire = vec![0x80 | ((body.len() >> 8) as u8), body.len() as u8];
        wire.extend_from_slice(&body);

        // In plain TLS mode the same bytes are a framing error, not a
        // tolerated probe.
        assert!(async_std::task::block_on(read_record(wire, RecordHeaderMode::Tls)).is_err());
    }

    #[test]
    fn sslv2_padding_longer_than_record_rejected() {
        let body = sslv2_client_hello_body();
        let mut wire = vec![(body.len() >> 8) as u8, body.len() as u8, 0xff];
        wire.extend_from_slice(&body);

        assert!(
            async_std::task::block_on(read_record(wire, RecordHeaderMode::TlsOrSslv2)).is_err()
        );
    }
}
