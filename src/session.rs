use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::cipher_suite::CipherSuite;
use crate::error::{Result, TlsError};
use crate::parsing::*;

/// Negotiated state that outlives a connection and can seed a later
/// resumption.
#[derive(Clone, Debug, Default)]
pub struct Session {
    pub session_id: Bytes,

    pub cipher_suite: Option<CipherSuite>,

    /// TLS 1.2 master secret. For TLS 1.3 sessions this stays empty and the
    /// resumption secret below is authoritative.
    pub master_secret: Bytes,

    pub extended_master_secret: bool,
    pub encrypt_then_mac: bool,

    /// Application protocol selected by ALPN, if any.
    pub app_proto: Option<Bytes>,

    /// DER certificates presented by the peer (leaf first).
    pub server_cert_chain: Vec<Bytes>,
    pub client_cert_chain: Vec<Bytes>,

    /// Stapled OCSP response received with the server certificate.
    pub ocsp_response: Option<Bytes>,

    /// Cleared when a fatal error tears the connection down.
    pub resumable: bool,

    // TLS 1.3 state.
    pub resumption_master_secret: Bytes,
    pub cl_app_secret: Bytes,
    pub sr_app_secret: Bytes,

    /// TLS 1.3 tickets usable as PSKs on later connections.
    pub tickets: Vec<Ticket>,

    /// RFC 5077 ticket for TLS 1.2 resumption.
    pub ticket_tls12: Option<Bytes>,
}

impl Session {
    /// A session can seed a resumption iff it still holds secrets and was
    /// not invalidated by a fatal alert.
    pub fn valid(&self) -> bool {
        self.resumable
            && (!self.master_secret.is_empty() || !self.resumption_master_secret.is_empty())
    }

    /// Drops any expired tickets.
    pub fn prune_tickets(&mut self, now: SystemTime) {
        self.tickets.retain(|t| !t.expired(now));
    }

    /// Private serialization used by the session cache. Only this module
    /// ever reads it back.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(
            &self
                .cipher_suite
                .map(|c| c.to_value())
                .unwrap_or(0)
                .to_be_bytes(),
        );

        let flags = (self.resumable as u8)
            | ((self.extended_master_secret as u8) << 1)
            | ((self.encrypt_then_mac as u8) << 2);
        out.push(flags);

        serialize_varlen_vector(0, 32, out, |out| out.extend_from_slice(&self.session_id));
        serialize_varlen_vector(0, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.master_secret)
        });
        serialize_varlen_vector(0, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.resumption_master_secret)
        });
        serialize_varlen_vector(0, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.cl_app_secret)
        });
        serialize_varlen_vector(0, U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.sr_app_secret)
        });

        serialize_varlen_vector(0, U8_LIMIT, out, |out| {
            if let Some(p) = &self.app_proto {
                out.extend_from_slice(p);
            }
        });

        serialize_varlen_vector(0, U24_LIMIT, out, |out| {
            for cert in &self.server_cert_chain {
                serialize_varlen_vector(1, U24_LIMIT, out, |out| out.extend_from_slice(cert));
            }
        });

        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            if let Some(o) = &self.ocsp_response {
                out.extend_from_slice(o);
            }
        });

        serialize_varlen_vector(0, U16_LIMIT, out, |out| {
            if let Some(t) = &self.ticket_tls12 {
                out.extend_from_slice(t);
            }
        });

        serialize_varlen_vector(0, U24_LIMIT, out, |out| {
            for ticket in &self.tickets {
                ticket.serialize(out);
            }
        });
    }

    pub fn parse(data: Bytes) -> Result<Self> {
        let mut r = ByteReader::new(data);

        let suite = r.next_u16()?;
        let cipher_suite = if suite == 0 {
            None
        } else {
            Some(CipherSuite::from_value(suite))
        };

        let flags = r.next_u8()?;

        let session_id = r.varlen_vector(0, 32)?;
        let master_secret = r.varlen_vector(0, U8_LIMIT)?;
        let resumption_master_secret = r.varlen_vector(0, U8_LIMIT)?;
        let cl_app_secret = r.varlen_vector(0, U8_LIMIT)?;
        let sr_app_secret = r.varlen_vector(0, U8_LIMIT)?;

        let app_proto = {
            let v = r.varlen_vector(0, U8_LIMIT)?;
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        };

        let server_cert_chain = {
            let data = r.varlen_vector(0, U24_LIMIT)?;
            let mut rr = ByteReader::new(data);
            let mut certs = vec![];
            while !rr.is_empty() {
                certs.push(rr.varlen_vector(1, U24_LIMIT)?);
            }
            certs
        };

        let ocsp_response = {
            let v = r.varlen_vector(0, U16_LIMIT)?;
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        };

        let ticket_tls12 = {
            let v = r.varlen_vector(0, U16_LIMIT)?;
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        };

        let tickets = {
            let data = r.varlen_vector(0, U24_LIMIT)?;
            let mut rr = ByteReader::new(data);
            let mut tickets = vec![];
            while !rr.is_empty() {
                tickets.push(Ticket::parse(&mut rr)?);
            }
            tickets
        };

        r.finish()?;

        Ok(Self {
            session_id,
            cipher_suite,
            master_secret,
            extended_master_secret: (flags & 0b10) != 0,
            encrypt_then_mac: (flags & 0b100) != 0,
            app_proto,
            server_cert_chain,
            client_cert_chain: vec![],
            ocsp_response,
            resumable: (flags & 0b1) != 0,
            resumption_master_secret,
            cl_app_secret,
            sr_app_secret,
            tickets,
            ticket_tls12,
        })
    }
}

/// One TLS 1.3 NewSessionTicket as stored client-side.
#[derive(Clone, Debug)]
pub struct Ticket {
    pub ticket: Bytes,
    pub lifetime: u32,
    pub age_add: u32,
    pub nonce: Bytes,
    pub received_at: SystemTime,
}

impl Ticket {
    pub fn expired(&self, now: SystemTime) -> bool {
        match now.duration_since(self.received_at) {
            Ok(age) => age > Duration::from_secs(self.lifetime as u64),
            // Clock went backwards; treat the ticket as fresh.
            Err(_) => false,
        }
    }

    /// obfuscated_ticket_age = (age_in_ms + ticket_age_add) mod 2^32
    pub fn obfuscated_age(&self, now: SystemTime) -> u32 {
        let age_ms = now
            .duration_since(self.received_at)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        (age_ms as u32).wrapping_add(self.age_add)
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.lifetime.to_be_bytes());
        out.extend_from_slice(&self.age_add.to_be_bytes());
        serialize_varlen_vector(0, U8_LIMIT, out, |out| out.extend_from_slice(&self.nonce));
        serialize_varlen_vector(1, U16_LIMIT, out, |out| out.extend_from_slice(&self.ticket));

        let unix_secs = self
            .received_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        out.extend_from_slice(&unix_secs.to_be_bytes());
    }

    fn parse(r: &mut ByteReader) -> Result<Self> {
        let lifetime = r.next_u32()?;
        let age_add = r.next_u32()?;
        let nonce = r.varlen_vector(0, U8_LIMIT)?;
        let ticket = r.varlen_vector(1, U16_LIMIT)?;
        let unix_secs = r.next_u64()?;

        Ok(Self {
            ticket,
            lifetime,
            age_add,
            nonce,
            received_at: UNIX_EPOCH
                .checked_add(Duration::from_secs(unix_secs))
                .ok_or_else(|| TlsError::decode_error("Bad ticket timestamp"))?,
        })
    }
}

/// Storage for resumable sessions. The embedder decides the eviction policy
/// and makes it safe for its own concurrency model; the engine only touches
/// it at handshake boundaries.
pub trait SessionCache: Send + Sync {
    fn get(&self, id: &[u8]) -> Option<Session>;

    fn put(&self, id: &[u8], session: Session);

    fn clear(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_requires_secrets_and_resumable() {
        let mut s = Session::default();
        assert!(!s.valid());

        s.master_secret = Bytes::from(vec![1u8; 48]);
        assert!(!s.valid());

        s.resumable = true;
        assert!(s.valid());

        s.master_secret = Bytes::new();
        s.resumption_master_secret = Bytes::from(vec![2u8; 32]);
        assert!(s.valid());
    }

    #[test]
    fn ticket_expiry_and_age() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let t = Ticket {
            ticket: Bytes::from_static(b"tick"),
            lifetime: 7200,
            age_add: 1000,
            nonce: Bytes::new(),
            received_at: now,
        };

        assert!(!t.expired(now + Duration::from_secs(7200)));
        assert!(t.expired(now + Duration::from_secs(7201)));

        // 2500ms of age plus the obfuscation offset.
        assert_eq!(t.obfuscated_age(now + Duration::from_millis(2500)), 3500);
    }

    #[test]
    fn session_blob_roundtrip() {
        let mut s = Session::default();
        s.session_id = Bytes::from(vec![9u8; 32]);
        s.cipher_suite = Some(CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256);
        s.master_secret = Bytes::from(vec![3u8; 48]);
        s.extended_master_secret = true;
        s.resumable = true;
        s.app_proto = Some(Bytes::from_static(b"h2"));
        s.server_cert_chain = vec![Bytes::from_static(b"leaf"), Bytes::from_static(b"ca")];
        s.tickets.push(Ticket {
            ticket: Bytes::from_static(b"tick"),
            lifetime: 300,
            age_add: 7,
            nonce: Bytes::from_static(&[0, 1]),
            received_at: UNIX_EPOCH + Duration::from_secs(77),
        });

        let mut blob = vec![];
        s.serialize(&mut blob);
        let parsed = Session::parse(blob.into()).unwrap();

        assert_eq!(parsed.session_id, s.session_id);
        assert_eq!(parsed.cipher_suite, s.cipher_suite);
        assert_eq!(parsed.master_secret, s.master_secret);
        assert!(parsed.extended_master_secret);
        assert!(!parsed.encrypt_then_mac);
        assert!(parsed.resumable);
        assert_eq!(parsed.app_proto, s.app_proto);
        assert_eq!(parsed.server_cert_chain.len(), 2);
        assert_eq!(parsed.tickets.len(), 1);
        assert_eq!(parsed.tickets[0].age_add, 7);
    }
}
