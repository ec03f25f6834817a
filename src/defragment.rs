use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};

use crate::error::{Result, TlsError};
use crate::record::ContentType;

/// Determines when the front of a buffer holds one complete message.
#[derive(Clone, Copy, Debug)]
enum SizeOracle {
    /// Every message of this type has a fixed size.
    Static { size: usize },
    /// The message carries its own length: a big-endian integer of
    /// 'size_of_size' bytes located 'size_offset' bytes into the message,
    /// counting the remaining bytes after the length field.
    Dynamic {
        size_offset: usize,
        size_of_size: usize,
    },
}

struct TypeBuffer {
    typ: ContentType,
    oracle: SizeOracle,
    buffer: BytesMut,
}

impl TypeBuffer {
    /// Size of the first complete message in the buffer, if any.
    fn first_complete_len(&self) -> Option<usize> {
        match self.oracle {
            SizeOracle::Static { size } => {
                if self.buffer.len() >= size {
                    Some(size)
                } else {
                    None
                }
            }
            SizeOracle::Dynamic {
                size_offset,
                size_of_size,
            } => {
                let header = size_offset + size_of_size;
                if self.buffer.len() < header {
                    return None;
                }

                let payload =
                    BigEndian::read_uint(&self.buffer[size_offset..header], size_of_size) as usize;

                if self.buffer.len() >= header + payload {
                    Some(header + payload)
                } else {
                    None
                }
            }
        }
    }
}

/// Reassembles messages that were fragmented (or coalesced) across records.
///
/// Content types are registered together with a completeness oracle; the
/// registration order doubles as the priority order when several types have a
/// complete message buffered.
pub struct Defragmenter {
    // Registration order = priority order. The list is tiny (at most the
    // handful of record content types), so linear scans are fine.
    buffers: Vec<TypeBuffer>,
}

impl Defragmenter {
    pub fn new() -> Self {
        Self { buffers: vec![] }
    }

    pub fn add_static_size(&mut self, typ: ContentType, size: usize) {
        assert!(self.find(typ).is_none());
        self.buffers.push(TypeBuffer {
            typ,
            oracle: SizeOracle::Static { size },
            buffer: BytesMut::new(),
        });
    }

    pub fn add_dynamic_size(&mut self, typ: ContentType, size_offset: usize, size_of_size: usize) {
        assert!(self.find(typ).is_none());
        self.buffers.push(TypeBuffer {
            typ,
            oracle: SizeOracle::Dynamic {
                size_offset,
                size_of_size,
            },
            buffer: BytesMut::new(),
        });
    }

    fn find(&self, typ: ContentType) -> Option<usize> {
        self.buffers.iter().position(|b| b.typ == typ)
    }

    /// Appends record payload bytes for the given content type.
    pub fn add_data(&mut self, typ: ContentType, data: &[u8]) -> Result<()> {
        let i = self
            .find(typ)
            .ok_or_else(|| TlsError::unexpected_message("Data for unregistered content type"))?;

        self.buffers[i].buffer.extend_from_slice(data);
        Ok(())
    }

    /// Pops the first complete message, scanning content types in priority
    /// order. A buffer holding several concatenated messages yields them one
    /// at a time.
    pub fn get_message(&mut self) -> Option<(ContentType, Bytes)> {
        for b in self.buffers.iter_mut() {
            if let Some(n) = b.first_complete_len() {
                let msg = b.buffer.split_to(n).freeze();
                return Some((b.typ, msg));
            }
        }

        None
    }

    /// Whether any partial (or complete) bytes are buffered for this type.
    pub fn has_pending(&self, typ: ContentType) -> bool {
        self.find(typ)
            .map(|i| !self.buffers[i].buffer.is_empty())
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(|b| b.buffer.is_empty())
    }

    pub fn clear_buffers(&mut self) {
        for b in self.buffers.iter_mut() {
            b.buffer.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> Defragmenter {
        let mut d = Defragmenter::new();
        d.add_static_size(ContentType::ChangeCipherSpec, 1);
        d.add_static_size(ContentType::Alert, 2);
        // Handshake: 1 byte type, then u24 length of the remainder.
        d.add_dynamic_size(ContentType::Handshake, 1, 3);
        d
    }

    #[test]
    fn rejects_unregistered_type() {
        let mut d = standard();
        assert!(d.add_data(ContentType::ApplicationData, b"x").is_err());
    }

    #[test]
    fn reassembles_split_handshake_message() {
        let mut d = standard();

        // type=1, length=4, payload "abcd", split across two records.
        d.add_data(ContentType::Handshake, &[1, 0, 0, 4, b'a']).unwrap();
        assert!(d.get_message().is_none());
        assert!(d.has_pending(ContentType::Handshake));

        d.add_data(ContentType::Handshake, &[b'b', b'c', b'd']).unwrap();
        let (typ, msg) = d.get_message().unwrap();
        assert_eq!(typ, ContentType::Handshake);
        assert_eq!(&msg[..], &[1, 0, 0, 4, b'a', b'b', b'c', b'd']);
        assert!(d.is_empty());
    }

    #[test]
    fn splits_coalesced_messages() {
        let mut d = standard();

        d.add_data(ContentType::Handshake, &[1, 0, 0, 1, b'x', 2, 0, 0, 0])
            .unwrap();

        let (_, first) = d.get_message().unwrap();
        assert_eq!(&first[..], &[1, 0, 0, 1, b'x']);

        let (_, second) = d.get_message().unwrap();
        assert_eq!(&second[..], &[2, 0, 0, 0]);

        assert!(d.get_message().is_none());
    }

    #[test]
    fn priority_order_is_registration_order() {
        let mut d = standard();

        d.add_data(ContentType::Handshake, &[1, 0, 0, 0]).unwrap();
        d.add_data(ContentType::Alert, &[1, 0]).unwrap();
        d.add_data(ContentType::ChangeCipherSpec, &[1]).unwrap();

        // CCS was registered first, then alert, then handshake.
        assert_eq!(d.get_message().unwrap().0, ContentType::ChangeCipherSpec);
        assert_eq!(d.get_message().unwrap().0, ContentType::Alert);
        assert_eq!(d.get_message().unwrap().0, ContentType::Handshake);
    }

    #[test]
    fn clear_buffers_discards_partials() {
        let mut d = standard();
        d.add_data(ContentType::Handshake, &[1, 0, 0, 9]).unwrap();
        d.clear_buffers();
        assert!(d.is_empty());
        assert!(!d.has_pending(ContentType::Handshake));
    }
}
