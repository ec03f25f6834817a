use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Buf, Bytes};
use log::{debug, warn};

use crate::alert::AlertDescription;
use crate::cipher_suite::CipherSuite;
use crate::error::{Result, TlsError};
use crate::handshake::{Handshake, KeyUpdate, KeyUpdateRequest};
use crate::provider::HasherFactory;
use crate::record::{ProtocolVersion, TLS_1_3_VERSION};
use crate::record_stream::{HeartbeatMessage, HeartbeatMessageType, Message, RecordReader, RecordWriter};
use crate::session::{Session, SessionCache, Ticket};

/// Interesting information collected during the handshake.
#[derive(Clone, Debug)]
pub struct HandshakeSummary {
    pub protocol_version: ProtocolVersion,
    pub cipher_suite: CipherSuite,

    /// If ALPN ids were offered, the one the server picked.
    pub selected_alpn_protocol: Option<Bytes>,

    /// DER certificates presented by the peer (leaf first). Chain validation
    /// is the embedder's job; the engine only verified possession of the
    /// private key.
    pub peer_certificates: Vec<Bytes>,

    pub resumed: bool,

    /// Whether the peer allows us to send heartbeat requests.
    pub peer_accepts_heartbeats: bool,
}

/// Abstraction over the raw record layer for reading/writing application
/// data, and the home of all post-handshake message processing.
pub struct ApplicationStream {
    reader: RecordReader,
    writer: RecordWriter,

    summary: HandshakeSummary,
    session: Session,

    session_cache: Option<Arc<dyn SessionCache>>,
    cache_key: Bytes,

    is_server: bool,

    /// PRF hasher of the negotiated suite, for deriving resumption PSKs out
    /// of received tickets.
    hasher_factory: Option<HasherFactory>,

    read_buffer: Bytes,

    closed: bool,
}

impl ApplicationStream {
    pub(crate) fn new(
        reader: RecordReader,
        writer: RecordWriter,
        summary: HandshakeSummary,
        session: Session,
        session_cache: Option<Arc<dyn SessionCache>>,
        cache_key: Bytes,
        is_server: bool,
        hasher_factory: Option<HasherFactory>,
    ) -> Self {
        Self {
            reader,
            writer,
            summary,
            session,
            session_cache,
            cache_key,
            is_server,
            hasher_factory,
            read_buffer: Bytes::new(),
            closed: false,
        }
    }

    pub fn summary(&self) -> &HandshakeSummary {
        &self.summary
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Reads decrypted application data. Returns 0 on a clean close_notify.
    /// Never buffers more than the last record's plaintext.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.read_buffer.is_empty() {
            let n = std::cmp::min(buf.len(), self.read_buffer.len());
            buf[0..n].copy_from_slice(&self.read_buffer[0..n]);
            self.read_buffer.advance(n);
            return Ok(n);
        }

        if self.closed {
            return Ok(0);
        }

        loop {
            let msg = match self.reader.recv(None).await {
                Ok(v) => v,
                Err(e) => return Err(self.fail(e).await),
            };

            match msg {
                Message::ApplicationData(mut data) => {
                    if data.is_empty() {
                        // Zero length records are legal traffic padding.
                        continue;
                    }

                    let n = std::cmp::min(data.len(), buf.len());
                    buf[0..n].copy_from_slice(&data[0..n]);
                    data.advance(n);
                    self.read_buffer = data;
                    return Ok(n);
                }
                Message::Handshake(handshake) => {
                    if let Err(e) = self.process_post_handshake(handshake).await {
                        return Err(self.fail(e).await);
                    }
                }
                Message::Alert(alert) => {
                    if alert.description == AlertDescription::close_notify {
                        // Clean shutdown: the session stays resumable.
                        self.closed = true;
                        self.update_cache();
                        return Ok(0);
                    }

                    self.session.resumable = false;
                    self.update_cache();
                    return Err(TlsError::RemoteAlert {
                        description: alert.description,
                        level: alert.level,
                    });
                }
                Message::ChangeCipherSpec(_) => {
                    let e = TlsError::unexpected_message(
                        "ChangeCipherSpec after the handshake",
                    );
                    return Err(self.fail(e).await);
                }
                Message::Heartbeat(hb) => {
                    if let Err(e) = self.process_heartbeat(hb).await {
                        return Err(self.fail(e).await);
                    }
                }
            }
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(TlsError::closed("Connection is closed"));
        }

        match self.writer.send(data).await {
            Ok(()) => Ok(data.len()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    /// Graceful close: emits close_notify. The session remains resumable.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.closed = true;
        self.update_cache();
        self.writer.send_close_notify().await
    }

    /// TLS 1.3 only: rotates our write keys, optionally asking the peer to
    /// rotate theirs too.
    pub async fn send_key_update(&mut self, request_peer_update: bool) -> Result<()> {
        if self.summary.protocol_version != TLS_1_3_VERSION {
            return Err(TlsError::internal("KeyUpdate requires TLS 1.3"));
        }

        let request_update = if request_peer_update {
            KeyUpdateRequest::update_requested
        } else {
            KeyUpdateRequest::update_not_requested
        };

        // Rotation applies to records after the KeyUpdate itself.
        self.writer
            .send_handshake(Handshake::KeyUpdate(KeyUpdate { request_update }), None)
            .await?;
        self.writer.update_local_key()?;

        debug!("rotated write traffic keys");
        Ok(())
    }

    /// Sends a heartbeat request if the peer permitted them.
    pub async fn send_heartbeat_request(&mut self, payload: &[u8]) -> Result<()> {
        if !self.summary.peer_accepts_heartbeats {
            return Err(TlsError::internal("Peer does not accept heartbeats"));
        }

        self.writer
            .send_heartbeat(&HeartbeatMessage {
                typ: HeartbeatMessageType::heartbeat_request,
                payload: Bytes::copy_from_slice(payload),
                padding: Bytes::from(vec![0u8; 16]),
            })
            .await
    }

    async fn process_post_handshake(&mut self, handshake: Handshake) -> Result<()> {
        match handshake {
            Handshake::NewSessionTicket(ticket) => {
                if self.is_server {
                    return Err(TlsError::unexpected_message(
                        "NewSessionTicket from a client",
                    ));
                }

                debug!(
                    "received session ticket (lifetime {}s)",
                    ticket.ticket_lifetime
                );

                self.session.tickets.push(Ticket {
                    ticket: ticket.ticket,
                    lifetime: ticket.ticket_lifetime,
                    age_add: ticket.ticket_age_add,
                    nonce: ticket.ticket_nonce,
                    received_at: SystemTime::now(),
                });
                self.update_cache();
                Ok(())
            }
            Handshake::KeyUpdate(ku) => {
                if self.summary.protocol_version != TLS_1_3_VERSION {
                    return Err(TlsError::unexpected_message("KeyUpdate outside TLS 1.3"));
                }

                // The sender rotated its write keys; we rotate our read side.
                self.reader.update_remote_key()?;

                if ku.request_update == KeyUpdateRequest::update_requested {
                    // Answer with a non-requesting KeyUpdate before any
                    // further application data.
                    self.writer
                        .send_handshake(
                            Handshake::KeyUpdate(KeyUpdate {
                                request_update: KeyUpdateRequest::update_not_requested,
                            }),
                            None,
                        )
                        .await?;
                    self.writer.update_local_key()?;
                }

                Ok(())
            }
            // A renegotiation attempt. Politely refused; the message is
            // dropped and the connection stays up.
            Handshake::HelloRequest if !self.is_server => {
                warn!("refusing renegotiation (HelloRequest)");
                self.writer
                    .send_warning_alert(AlertDescription::no_renegotiation)
                    .await
            }
            Handshake::ClientHello(_) if self.is_server => {
                warn!("refusing renegotiation (ClientHello)");
                self.writer
                    .send_warning_alert(AlertDescription::no_renegotiation)
                    .await
            }
            other => Err(TlsError::unexpected_message(format!(
                "Post-handshake message: {:?}",
                other.typ()
            ))),
        }
    }

    async fn process_heartbeat(&mut self, hb: HeartbeatMessage) -> Result<()> {
        match hb.typ {
            HeartbeatMessageType::heartbeat_request => {
                self.writer
                    .send_heartbeat(&HeartbeatMessage {
                        typ: HeartbeatMessageType::heartbeat_response,
                        payload: hb.payload,
                        padding: Bytes::from(vec![0u8; 16]),
                    })
                    .await
            }
            HeartbeatMessageType::heartbeat_response => {
                // No outstanding-request tracking; stray responses are
                // dropped.
                Ok(())
            }
            HeartbeatMessageType::unknown(_) => {
                Err(TlsError::illegal_parameter("Unknown heartbeat type"))
            }
        }
    }

    /// Fatal error funnel: best effort alert, session invalidation, cache
    /// sync.
    async fn fail(&mut self, error: TlsError) -> TlsError {
        if let Some(description) = error.alert_to_send() {
            self.writer.send_fatal_alert(description).await;
        }

        self.closed = true;
        self.session.resumable = false;
        self.update_cache();
        error
    }

    fn update_cache(&self) {
        if let Some(cache) = &self.session_cache {
            if !self.cache_key.is_empty() {
                cache.put(&self.cache_key, self.session.clone());
            }
        }
    }

    /// The PRF hasher, used by resumption logic layered on top.
    pub fn hasher_factory(&self) -> Option<&HasherFactory> {
        self.hasher_factory.as_ref()
    }
}
