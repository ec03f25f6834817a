// TLS specific helpers for parsing binary packets.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use crate::error::{Result, TlsError};

pub const U8_LIMIT: usize = u8::max_value() as usize;
pub const U16_LIMIT: usize = u16::max_value() as usize;
pub const U24_LIMIT: usize = 1 << 24;
pub const U32_LIMIT: usize = u32::max_value() as usize;

pub fn exp2(v: usize) -> usize {
    1 << v
}

/// Big-endian cursor over an immutable byte buffer.
///
/// All parsers in this crate operate on one of these. Underflow and
/// out-of-range length fields surface as decode_error.
pub struct ByteReader {
    data: Bytes,
    pos: usize,
}

impl ByteReader {
    pub fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn advance(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(TlsError::decode_error("Input buffer underflow"));
        }

        let s = &self.data[self.pos..(self.pos + n)];
        self.pos += n;
        Ok(s)
    }

    pub fn next_u8(&mut self) -> Result<u8> {
        Ok(self.advance(1)?[0])
    }

    pub fn next_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.advance(2)?))
    }

    pub fn next_u24(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u24(self.advance(3)?))
    }

    pub fn next_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.advance(4)?))
    }

    pub fn next_u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.advance(8)?))
    }

    /// Reads a fixed length run of bytes as a zero-copy slice of the input.
    pub fn take_exact(&mut self, n: usize) -> Result<Bytes> {
        if self.remaining() < n {
            return Err(TlsError::decode_error("Input buffer underflow"));
        }

        let out = self.data.slice(self.pos..(self.pos + n));
        self.pos += n;
        Ok(out)
    }

    /// Takes everything left in the buffer.
    pub fn rest(&mut self) -> Bytes {
        let out = self.data.slice(self.pos..);
        self.pos = self.data.len();
        out
    }

    /// Reads a variable length vector of bytes.
    ///
    /// The max_bytes is used to determine how large the length field is: TLS
    /// encodes the length in the minimum number of bytes required to store
    /// max_bytes.
    pub fn varlen_vector(&mut self, min_bytes: usize, max_bytes: usize) -> Result<Bytes> {
        let len = if max_bytes <= U8_LIMIT {
            self.next_u8()? as usize
        } else if max_bytes <= U16_LIMIT {
            self.next_u16()? as usize
        } else if max_bytes <= U24_LIMIT {
            self.next_u24()? as usize
        } else if max_bytes <= U32_LIMIT {
            self.next_u32()? as usize
        } else {
            return Err(TlsError::internal("Maximum length not supported"));
        };

        if len < min_bytes || len > max_bytes {
            return Err(TlsError::decode_error("Length out of allowed range"));
        }

        self.take_exact(len)
    }

    /// Verifies that every byte of the input has been consumed.
    pub fn finish(self) -> Result<()> {
        if !self.is_empty() {
            return Err(TlsError::decode_error("Unexpected trailing bytes"));
        }

        Ok(())
    }
}

pub fn u24_to_be_bytes(v: u32) -> [u8; 3] {
    let b = v.to_be_bytes();
    [b[1], b[2], b[3]]
}

/// Encodes a byte vector using the length prefixed wire format defined by TLS.
pub fn serialize_varlen_vector<F: FnMut(&mut Vec<u8>)>(
    min_bytes: usize,
    max_bytes: usize,
    out: &mut Vec<u8>,
    mut f: F,
) {
    let i = out.len();
    let n = if max_bytes <= U8_LIMIT {
        1
    } else if max_bytes <= U16_LIMIT {
        2
    } else if max_bytes <= U24_LIMIT {
        3
    } else if max_bytes <= U32_LIMIT {
        4
    } else {
        panic!("Maximum length not supported");
    };

    out.resize(i + n, 0);
    let ii = out.len();

    f(out);

    let size = out.len() - ii;
    assert!(size >= min_bytes && size <= max_bytes);

    match n {
        1 => {
            out[i] = size as u8;
        }
        2 => {
            *array_mut_ref![out, i, 2] = (size as u16).to_be_bytes();
        }
        3 => {
            *array_mut_ref![out, i, 3] = u24_to_be_bytes(size as u32);
        }
        4 => {
            *array_mut_ref![out, i, 4] = (size as u32).to_be_bytes();
        }
        _ => panic!("Should not happen"),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_reader_integers() {
        let mut r = ByteReader::new(Bytes::from_static(&[
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a,
        ]));
        assert_eq!(r.next_u8().unwrap(), 0x01);
        assert_eq!(r.next_u16().unwrap(), 0x0203);
        assert_eq!(r.next_u24().unwrap(), 0x040506);
        assert_eq!(r.next_u32().unwrap(), 0x0708090a);
        assert!(r.next_u8().is_err());
    }

    #[test]
    fn varlen_vector_roundtrip() {
        let mut out = vec![];
        serialize_varlen_vector(0, U16_LIMIT, &mut out, |out| {
            out.extend_from_slice(b"hello");
        });
        assert_eq!(&out[..], &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);

        let mut r = ByteReader::new(out.into());
        let v = r.varlen_vector(0, U16_LIMIT).unwrap();
        assert_eq!(&v[..], b"hello");
        r.finish().unwrap();
    }

    #[test]
    fn varlen_vector_rejects_out_of_range() {
        // 4 byte payload claimed, minimum is 8.
        let mut r = ByteReader::new(Bytes::from_static(&[0x04, 1, 2, 3, 4]));
        assert!(r.varlen_vector(8, U16_LIMIT).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let r = {
            let mut r = ByteReader::new(Bytes::from_static(&[1, 2]));
            r.next_u8().unwrap();
            r
        };
        assert!(r.finish().is_err());
    }
}
