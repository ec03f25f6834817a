use bytes::Bytes;
use log::{debug, trace, warn};

use crate::alert::*;
use crate::cipher::CipherEndpointSpec;
use crate::defragment::Defragmenter;
use crate::error::{Result, TlsError};
use crate::handshake::*;
use crate::parsing::ByteReader;
use crate::record::*;
use crate::transcript::Transcript;

/// One fully reassembled message from the record layer.
#[derive(Debug)]
pub enum Message {
    ChangeCipherSpec(Bytes),
    Alert(Alert),
    Handshake(Handshake),
    /// Unencrypted data to go directly to the application.
    ApplicationData(Bytes),
    Heartbeat(HeartbeatMessage),
}

/// RFC 6520 heartbeat message. One message always fills an entire record.
#[derive(Debug)]
pub struct HeartbeatMessage {
    pub typ: HeartbeatMessageType,
    pub payload: Bytes,
    pub padding: Bytes,
}

tls_enum_u8!(HeartbeatMessageType => {
    heartbeat_request(1), heartbeat_response(2), (255)
});

impl HeartbeatMessage {
    pub fn parse(data: Bytes) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let typ = HeartbeatMessageType::parse(&mut r)?;
        let payload_length = r.next_u16()? as usize;
        if r.remaining() < payload_length + 16 {
            // RFC 6520: at least 16 bytes of padding must follow. A short
            // claimed payload must be discarded silently, but our caller
            // treats the whole connection as broken either way.
            return Err(TlsError::illegal_parameter("Heartbeat payload too large"));
        }
        let payload = r.take_exact(payload_length)?;
        let padding = r.rest();
        Ok(Self {
            typ,
            payload,
            padding,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.typ.serialize(out);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.padding);
    }
}

/// Stand-in transport installed after the real streams move out of a
/// handshake executor into the ApplicationStream.
pub(crate) struct ClosedTransport;

impl async_std::io::Read for ClosedTransport {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::task::Poll::Ready(Ok(0))
    }
}

impl async_std::io::Write for ClosedTransport {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::task::Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "closed",
        )))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

fn standard_defragmenter() -> Defragmenter {
    let mut d = Defragmenter::new();
    // Priority order: control messages preempt handshake data.
    d.add_static_size(ContentType::ChangeCipherSpec, 1);
    d.add_static_size(ContentType::Alert, 2);
    // Handshake header: 1 byte type then a u24 length of the body.
    d.add_dynamic_size(ContentType::Handshake, 1, 3);
    d
}

/// Receiving half of the record layer.
pub struct RecordReader {
    reader: StreamReader,

    is_server: bool,

    received_first_record: bool,

    /// Version negotiated by the handshake. Governs message parsing and the
    /// allowed ciphertext expansion.
    pub protocol_version: ProtocolVersion,

    /// Cipher parameters used by the remote endpoint to encrypt records.
    /// Initially empty meaning that no encryption is expected. Always set
    /// after the handshake is complete.
    remote_cipher_spec: Option<CipherEndpointSpec>,

    /// State prepared by calc_pending_states / calc_tls13_pending_state,
    /// waiting for change_read_state().
    pending_cipher_spec: Option<CipherEndpointSpec>,

    defragmenter: Defragmenter,

    /// Unencrypted ChangeCipherSpec records tolerated so far (TLS 1.3
    /// middlebox compatibility: at most one before and one after the
    /// ServerHello).
    ccs_tolerated: usize,
}

impl RecordReader {
    pub fn new(reader: StreamReader, is_server: bool) -> Self {
        Self {
            reader,
            is_server,
            received_first_record: false,
            protocol_version: TLS_1_0_VERSION,
            remote_cipher_spec: None,
            pending_cipher_spec: None,
            defragmenter: standard_defragmenter(),
            ccs_tolerated: 0,
        }
    }

    /// Stages the cipher state that the next change_read_state() will
    /// activate.
    pub fn set_pending_state(&mut self, spec: CipherEndpointSpec) {
        self.pending_cipher_spec = Some(spec);
    }

    /// Swaps in the pending read state. The sequence number restarts at zero.
    pub fn change_read_state(&mut self) -> Result<()> {
        if self.defragmenter.has_pending(ContentType::Handshake) {
            return Err(TlsError::unexpected_message(
                "Key change across a partial handshake message",
            ));
        }

        let pending = self
            .pending_cipher_spec
            .take()
            .ok_or_else(|| TlsError::internal("No pending read state"))?;

        self.remote_cipher_spec = Some(pending);
        Ok(())
    }

    pub fn has_active_cipher(&self) -> bool {
        self.remote_cipher_spec.is_some()
    }

    /// Assuming a TLS 1.3 cipher is active, rotates the read keys to a new
    /// traffic secret.
    pub fn replace_remote_key(&mut self, traffic_secret: Bytes) -> Result<()> {
        match self.remote_cipher_spec.as_mut() {
            Some(CipherEndpointSpec::Tls13(cipher_spec)) => {
                cipher_spec.replace_key(traffic_secret);
                Ok(())
            }
            Some(_) => Err(TlsError::internal("Not using TLS 1.3")),
            None => Err(TlsError::internal("Cipher spec not set yet")),
        }
    }

    /// Rotates the read keys one generation forward (KeyUpdate received).
    pub fn update_remote_key(&mut self) -> Result<()> {
        match self.remote_cipher_spec.as_mut() {
            Some(CipherEndpointSpec::Tls13(cipher_spec)) => {
                cipher_spec.update_key();
                Ok(())
            }
            _ => Err(TlsError::internal("Not using TLS 1.3")),
        }
    }

    /// Receives the next full message from the transport.
    ///
    /// Handshake messages may span multiple records (or share one); the
    /// defragmenter reassembles them. During the handshake, pass the
    /// transcript so that every handshake message is appended to it
    /// byte-for-byte as received.
    pub async fn recv(&mut self, mut transcript: Option<&mut Transcript>) -> Result<Message> {
        loop {
            if let Some(msg) = self.pop_message(&mut transcript)? {
                return Ok(msg);
            }

            let record = self.recv_record().await?;

            match record.typ {
                ContentType::Sslv2Handshake => {
                    // Old clients probing for an upgrade. The translated
                    // ClientHello enters the transcript in its v2 form, as
                    // delivered.
                    let hello = ClientHello::parse_sslv2(record.data.clone())?;
                    if let Some(t) = transcript.as_deref_mut() {
                        t.push(record.data);
                    }
                    return Ok(Message::Handshake(Handshake::ClientHello(hello)));
                }
                ContentType::Handshake | ContentType::Alert | ContentType::ChangeCipherSpec => {
                    self.defragmenter.add_data(record.typ, &record.data)?;
                }
                ContentType::ApplicationData => {
                    if self.defragmenter.has_pending(ContentType::Handshake) {
                        return Err(TlsError::unexpected_message(
                            "Data interleaved in a handshake message",
                        ));
                    }
                    return Ok(Message::ApplicationData(record.data));
                }
                ContentType::Heartbeat => {
                    return Ok(Message::Heartbeat(HeartbeatMessage::parse(record.data)?));
                }
                _ => {
                    return Err(TlsError::unexpected_message(format!(
                        "Unknown record type {:?}",
                        record.typ
                    )));
                }
            }
        }
    }

    fn pop_message(
        &mut self,
        transcript: &mut Option<&mut Transcript>,
    ) -> Result<Option<Message>> {
        let (typ, data) = match self.defragmenter.get_message() {
            Some(v) => v,
            None => return Ok(None),
        };

        let msg = match typ {
            ContentType::ChangeCipherSpec => {
                if data[..] != [1] {
                    return Err(TlsError::decode_error("Malformed ChangeCipherSpec"));
                }
                Message::ChangeCipherSpec(data)
            }
            ContentType::Alert => {
                let mut r = ByteReader::new(data);
                let alert = Alert::parse(&mut r)?;
                r.finish()?;
                Message::Alert(alert)
            }
            ContentType::Handshake => {
                let handshake = Handshake::parse(data.clone(), self.protocol_version)?;

                // ClientHello, ServerHello, Finished and KeyUpdate must sit
                // alone on their record boundary in TLS 1.3.
                if self.protocol_version == TLS_1_3_VERSION
                    && matches!(
                        handshake.typ(),
                        HandshakeType::ClientHello
                            | HandshakeType::ServerHello
                            | HandshakeType::Finished
                            | HandshakeType::KeyUpdate
                    )
                    && self.defragmenter.has_pending(ContentType::Handshake)
                {
                    return Err(TlsError::unexpected_message(
                        "Message must occupy a whole handshake record",
                    ));
                }

                // HelloRequests never participate in the transcript.
                if handshake.typ() != HandshakeType::HelloRequest {
                    if let Some(t) = transcript.as_deref_mut() {
                        t.push(data);
                    }
                }

                trace!("recv handshake message: {:?}", handshake.typ());
                Message::Handshake(handshake)
            }
            _ => return Err(TlsError::internal("Unregistered defragmented type")),
        };

        Ok(Some(msg))
    }

    async fn recv_record(&mut self) -> Result<Record> {
        loop {
            let mode = if self.is_server
                && !self.received_first_record
                && self.remote_cipher_spec.is_none()
            {
                RecordHeaderMode::TlsOrSslv2
            } else {
                RecordHeaderMode::Tls
            };

            let expansion = if self.protocol_version == TLS_1_3_VERSION {
                MAX_CIPHERTEXT_EXPANSION_TLS13
            } else {
                MAX_CIPHERTEXT_EXPANSION_LEGACY
            };

            let record =
                Record::read(&mut self.reader, mode, MAX_PLAINTEXT_RECORD_SIZE + expansion).await?;

            // Only the major version is pinned before negotiation completes;
            // the initial flight commonly claims 1.0 while later records
            // claim 1.2 regardless of the real version.
            if record.typ != ContentType::Sslv2Handshake
                && (record.legacy_record_version < SSL_3_0_VERSION
                    || record.legacy_record_version > TLS_1_2_VERSION)
            {
                return Err(TlsError::protocol_version(
                    "Unsupported record layer version",
                ));
            }

            self.received_first_record = true;

            // ChangeCipherSpec is never encrypted. In TLS 1.3 it only exists
            // for middlebox compatibility and is dropped here, at most twice.
            if record.typ == ContentType::ChangeCipherSpec
                && self.protocol_version == TLS_1_3_VERSION
            {
                if record.data[..] != [1] {
                    return Err(TlsError::decode_error("Malformed ChangeCipherSpec"));
                }
                self.ccs_tolerated += 1;
                if self.ccs_tolerated > 2 {
                    return Err(TlsError::unexpected_message(
                        "Too many ChangeCipherSpec records",
                    ));
                }
                continue;
            }

            let inner = match self.remote_cipher_spec.as_mut() {
                Some(_) if record.typ == ContentType::ChangeCipherSpec => record,
                Some(cipher_spec) => cipher_spec.decrypt(record)?,
                None => {
                    if record.typ == ContentType::ApplicationData {
                        return Err(TlsError::unexpected_message(
                            "Received application_data without a cipher",
                        ));
                    }

                    record
                }
            };

            if inner.data.len() > MAX_PLAINTEXT_RECORD_SIZE {
                return Err(TlsError::record_overflow("Plaintext fragment too large"));
            }

            // Zero-length fragments are only allowed for application data.
            if inner.data.is_empty() && inner.typ != ContentType::ApplicationData {
                return Err(TlsError::decode_error("Empty record not allowed"));
            }

            return Ok(inner);
        }
    }
}

/// Sending half of the record layer.
pub struct RecordWriter {
    writer: StreamWriter,

    is_server: bool,

    sent_first_record: bool,

    shutdown: bool,

    pub protocol_version: ProtocolVersion,

    local_cipher_spec: Option<CipherEndpointSpec>,

    pending_cipher_spec: Option<CipherEndpointSpec>,

    /// Upper bound on outgoing plaintext fragments. Lowered when the peer
    /// advertises record_size_limit.
    max_fragment_size: usize,
}

impl RecordWriter {
    pub fn new(writer: StreamWriter, is_server: bool) -> Self {
        Self {
            writer,
            is_server,
            sent_first_record: false,
            shutdown: false,
            protocol_version: TLS_1_0_VERSION,
            local_cipher_spec: None,
            pending_cipher_spec: None,
            max_fragment_size: MAX_PLAINTEXT_RECORD_SIZE,
        }
    }

    pub fn set_max_fragment_size(&mut self, size: usize) {
        self.max_fragment_size = size.clamp(64, MAX_PLAINTEXT_RECORD_SIZE);
    }

    pub fn set_pending_state(&mut self, spec: CipherEndpointSpec) {
        self.pending_cipher_spec = Some(spec);
    }

    /// Swaps in the pending write state. The sequence number restarts at
    /// zero.
    pub fn change_write_state(&mut self) -> Result<()> {
        let pending = self
            .pending_cipher_spec
            .take()
            .ok_or_else(|| TlsError::internal("No pending write state"))?;

        self.local_cipher_spec = Some(pending);
        Ok(())
    }

    pub fn has_active_cipher(&self) -> bool {
        self.local_cipher_spec.is_some()
    }

    pub fn replace_local_key(&mut self, traffic_secret: Bytes) -> Result<()> {
        match self.local_cipher_spec.as_mut() {
            Some(CipherEndpointSpec::Tls13(cipher_spec)) => {
                cipher_spec.replace_key(traffic_secret);
                Ok(())
            }
            Some(_) => Err(TlsError::internal("Not using TLS 1.3")),
            None => Err(TlsError::internal("Cipher spec not set yet")),
        }
    }

    /// Rotates the write keys one generation forward (KeyUpdate sent).
    pub fn update_local_key(&mut self) -> Result<()> {
        match self.local_cipher_spec.as_mut() {
            Some(CipherEndpointSpec::Tls13(cipher_spec)) => {
                cipher_spec.update_key();
                Ok(())
            }
            _ => Err(TlsError::internal("Not using TLS 1.3")),
        }
    }

    pub async fn send_handshake(
        &mut self,
        msg: Handshake,
        transcript: Option<&mut Transcript>,
    ) -> Result<()> {
        let buf = msg.to_bytes();
        trace!("send handshake message: {:?}", msg.typ());
        self.send_raw_handshake(buf, transcript).await
    }

    /// Sends pre-serialized handshake bytes (used where the wire encoding
    /// depends on the negotiated version, e.g. TLS 1.2 Certificates).
    pub async fn send_raw_handshake(
        &mut self,
        buf: Bytes,
        transcript: Option<&mut Transcript>,
    ) -> Result<()> {
        if let Some(transcript) = transcript {
            transcript.push(buf.clone());
        }

        // Large messages (certificate chains) get fragmented across records.
        let mut rest = buf;
        while !rest.is_empty() {
            let n = rest.len().min(self.max_fragment_size);
            let part = rest.split_to(n);
            self.send_record(RecordInner {
                typ: ContentType::Handshake,
                data: part,
            })
            .await?;
        }

        Ok(())
    }

    pub async fn send_change_cipher_spec(&mut self) -> Result<()> {
        self.send_record(RecordInner {
            data: vec![1].into(),
            typ: ContentType::ChangeCipherSpec,
        })
        .await
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.max_fragment_size) {
            self.send_record(RecordInner {
                typ: ContentType::ApplicationData,
                data: Bytes::copy_from_slice(chunk),
            })
            .await?;
        }

        self.flush().await
    }

    pub async fn send_heartbeat(&mut self, msg: &HeartbeatMessage) -> Result<()> {
        let mut data = vec![];
        msg.serialize(&mut data);
        self.send_record(RecordInner {
            typ: ContentType::Heartbeat,
            data: data.into(),
        })
        .await
    }

    /// Sends a fatal alert and stops accepting further writes. This is the
    /// single funnel for the bad path; errors sending the alert itself are
    /// swallowed as the connection is already doomed.
    pub async fn send_fatal_alert(&mut self, description: AlertDescription) {
        if self.shutdown {
            return;
        }

        warn!("sending fatal alert: {:?}", description);
        let _ = self.send_alert(Alert::fatal(description)).await;
        let _ = self.flush().await;
        self.shutdown = true;
    }

    pub async fn send_warning_alert(&mut self, description: AlertDescription) -> Result<()> {
        debug!("sending warning alert: {:?}", description);
        self.send_alert(Alert::warning(description)).await?;
        self.flush().await
    }

    /// Graceful close: sends close_notify and shuts the writer down.
    pub async fn send_close_notify(&mut self) -> Result<()> {
        if self.shutdown {
            return Ok(());
        }

        self.send_alert(Alert::warning(AlertDescription::close_notify))
            .await?;
        self.flush().await?;
        self.shutdown = true;
        Ok(())
    }

    async fn send_alert(&mut self, alert: Alert) -> Result<()> {
        let mut data = vec![];
        alert.serialize(&mut data);

        self.send_record(RecordInner {
            typ: ContentType::Alert,
            data: data.into(),
        })
        .await
    }

    pub async fn flush(&mut self) -> Result<()> {
        use async_std::io::prelude::*;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_record(&mut self, inner: RecordInner) -> Result<()> {
        use async_std::io::prelude::*;

        if self.shutdown {
            return Err(TlsError::closed("Connection is shut down"));
        }

        // All records are sent with a legacy outer version for backwards
        // compatibility.
        // rfc8446: 'a record containing an initial ClientHello SHOULD have
        // version 0x0301 (reflecting TLS 1.0) and a record containing a
        // second ClientHello or a ServerHello MUST have version 0x0303'
        let legacy_record_version = {
            if !self.is_server && !self.sent_first_record {
                TLS_1_0_VERSION
            } else {
                TLS_1_2_VERSION
            }
        };

        let inner = Record {
            legacy_record_version,
            typ: inner.typ,
            data: inner.data,
        };

        let record = match self.local_cipher_spec.as_mut() {
            // ChangeCipherSpec is never encrypted.
            Some(_) if inner.typ == ContentType::ChangeCipherSpec => inner,
            Some(cipher_spec) => cipher_spec.encrypt(inner)?,
            None => {
                if inner.typ == ContentType::ApplicationData {
                    return Err(TlsError::internal(
                        "Should not be sending unencrypted application data",
                    ));
                }

                inner
            }
        };

        self.sent_first_record = true;

        let mut record_data = vec![];
        record.serialize(&mut record_data);

        self.writer.write_all(&record_data).await?;
        Ok(())
    }
}
