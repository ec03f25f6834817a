use bytes::Bytes;
use log::{debug, warn};

use crate::alert::{AlertDescription, AlertLevel};
use crate::error::{ErrorKind, Result, TlsError};
use crate::extensions::SignatureScheme;
use crate::handshake::{CertificateVerify, Finished, Handshake};
use crate::provider::{HasherFactory, PrivateKey, PublicKey};
use crate::record_stream::{Message, RecordReader, RecordWriter};
use crate::transcript::Transcript;
use crate::utils::constant_time_eq;

const TLS13_CERTIFICATEVERIFY_CLIENT_CTX: &[u8] = b"TLS 1.3, client CertificateVerify";
const TLS13_CERTIFICATEVERIFY_SERVER_CTX: &[u8] = b"TLS 1.3, server CertificateVerify";

/// Common plumbing for executing client/server TLS handshakes.
///
/// NOTE: This is an internal interface used by the 'client' and 'server'
/// modules.
pub(crate) struct HandshakeExecutor {
    pub reader: RecordReader,
    pub writer: RecordWriter,
    pub handshake_transcript: Transcript,
    pub is_server: bool,
}

impl HandshakeExecutor {
    pub fn new(reader: RecordReader, writer: RecordWriter, is_server: bool) -> Self {
        Self {
            reader,
            writer,
            handshake_transcript: Transcript::new(),
            is_server,
        }
    }

    pub async fn send_handshake_message(&mut self, handshake: Handshake) -> Result<()> {
        self.writer
            .send_handshake(handshake, Some(&mut self.handshake_transcript))
            .await
    }

    pub async fn send_raw_handshake(&mut self, data: Bytes) -> Result<()> {
        self.writer
            .send_raw_handshake(data, Some(&mut self.handshake_transcript))
            .await
    }

    pub async fn receive_handshake_message(&mut self) -> Result<Handshake> {
        loop {
            let msg = self
                .reader
                .recv(Some(&mut self.handshake_transcript))
                .await?;

            match msg {
                Message::Handshake(m) => {
                    return Ok(m);
                }
                Message::ApplicationData(_) => {
                    return Err(TlsError::unexpected_message(
                        "Application data during the handshake",
                    ));
                }
                Message::ChangeCipherSpec(_) => {
                    return Err(TlsError::unexpected_message(
                        "ChangeCipherSpec at an unexpected point",
                    ));
                }
                Message::Heartbeat(_) => {
                    return Err(TlsError::unexpected_message(
                        "Heartbeat during the handshake",
                    ));
                }
                Message::Alert(alert) => {
                    self.handle_alert(alert)?;
                    continue;
                }
            };
        }
    }

    /// Receives the next handshake-relevant event: a handshake message or a
    /// ChangeCipherSpec. Warning alerts are skipped; anything else is a
    /// protocol violation at this stage.
    pub async fn receive_event(&mut self) -> Result<Message> {
        loop {
            let msg = self
                .reader
                .recv(Some(&mut self.handshake_transcript))
                .await?;

            match msg {
                Message::Handshake(_) | Message::ChangeCipherSpec(_) => return Ok(msg),
                Message::Alert(alert) => {
                    self.handle_alert(alert)?;
                    continue;
                }
                _ => {
                    return Err(TlsError::unexpected_message(
                        "Unexpected record during the handshake",
                    ));
                }
            }
        }
    }

    /// TLS 1.2: waits for the peer's ChangeCipherSpec.
    pub async fn receive_change_cipher_spec(&mut self) -> Result<()> {
        loop {
            let msg = self
                .reader
                .recv(Some(&mut self.handshake_transcript))
                .await?;

            match msg {
                Message::ChangeCipherSpec(_) => return Ok(()),
                Message::Alert(alert) => {
                    self.handle_alert(alert)?;
                    continue;
                }
                _ => {
                    return Err(TlsError::unexpected_message("Expected ChangeCipherSpec"));
                }
            }
        }
    }

    fn handle_alert(&mut self, alert: crate::alert::Alert) -> Result<()> {
        if alert.level == AlertLevel::fatal
            || alert.description == AlertDescription::close_notify
        {
            return Err(TlsError::RemoteAlert {
                description: alert.description,
                level: alert.level,
            });
        }

        warn!("ignoring warning alert: {:?}", alert.description);
        Ok(())
    }

    /// Receives the peer's Finished and compares its verify_data in constant
    /// time.
    pub async fn receive_finished(&mut self, expected_verify_data: &[u8]) -> Result<()> {
        let finished = match self.receive_handshake_message().await? {
            Handshake::Finished(f) => f,
            other => {
                return Err(TlsError::unexpected_message(format!(
                    "Expected Finished, got {:?}",
                    other.typ()
                )));
            }
        };

        if !constant_time_eq(&finished.verify_data, expected_verify_data) {
            return Err(TlsError::local(
                ErrorKind::DecryptionFailed,
                AlertDescription::decrypt_error,
                "Finished verify_data mismatch",
            ));
        }

        debug!("peer Finished verified");
        Ok(())
    }

    pub async fn send_finished(&mut self, verify_data: Bytes) -> Result<()> {
        self.send_handshake_message(Handshake::Finished(Finished { verify_data }))
            .await
    }

    /// Picks the signature scheme for our CertificateVerify /
    /// ServerKeyExchange: first local preference also advertised by the peer
    /// and usable with our key.
    pub fn select_signature_scheme(
        local_supported: &[SignatureScheme],
        remote_supported: &[SignatureScheme],
        private_key: &dyn PrivateKey,
        tls13: bool,
    ) -> Result<SignatureScheme> {
        for scheme in local_supported {
            if !remote_supported.contains(scheme) {
                continue;
            }

            if tls13 && !scheme.allowed_in_tls13() {
                continue;
            }

            if scheme.key_type() != Some(private_key.key_type()) {
                continue;
            }

            if !private_key.supports_scheme(*scheme) {
                continue;
            }

            return Ok(*scheme);
        }

        Err(TlsError::handshake_failure(
            "No mutually supported signature scheme",
        ))
    }

    /// TLS 1.2 default when the peer sent no signature_algorithms
    /// extension: SHA-1 + the key's own algorithm (SHA-256 is tried first as
    /// everyone really supports it).
    pub fn default_signature_schemes(key_type: crate::provider::KeyType) -> Vec<SignatureScheme> {
        use crate::provider::KeyType;
        match key_type {
            KeyType::Rsa => vec![SignatureScheme::rsa_pkcs1_sha256, SignatureScheme::rsa_pkcs1_sha1],
            KeyType::Ecdsa => vec![
                SignatureScheme::ecdsa_secp256r1_sha256,
                SignatureScheme::ecdsa_sha1,
            ],
            KeyType::Dsa => vec![SignatureScheme::dsa_sha256, SignatureScheme::dsa_sha1],
            KeyType::Ed25519 => vec![SignatureScheme::ed25519],
            KeyType::Ed448 => vec![SignatureScheme::ed448],
        }
    }

    /// The TLS 1.3 CertificateVerify payload:
    /// 64 spaces || context string || 0x00 || Transcript-Hash.
    fn certificate_verify_payload(is_server_signing: bool, transcript_hash: &[u8]) -> Vec<u8> {
        let mut plaintext = vec![0x20u8; 64];
        plaintext.extend_from_slice(if is_server_signing {
            TLS13_CERTIFICATEVERIFY_SERVER_CTX
        } else {
            TLS13_CERTIFICATEVERIFY_CLIENT_CTX
        });
        plaintext.push(0);
        plaintext.extend_from_slice(transcript_hash);
        plaintext
    }

    /// Creates our TLS 1.3 CertificateVerify. The transcript must run up to
    /// (and including) the Certificate we just sent.
    pub fn create_certificate_verify(
        &self,
        hasher_factory: &HasherFactory,
        local_supported: &[SignatureScheme],
        remote_supported: &[SignatureScheme],
        private_key: &dyn PrivateKey,
    ) -> Result<CertificateVerify> {
        let transcript_hash = self.handshake_transcript.hash(hasher_factory);
        let payload = Self::certificate_verify_payload(self.is_server, &transcript_hash);

        let algorithm =
            Self::select_signature_scheme(local_supported, remote_supported, private_key, true)?;

        let signature = private_key.sign(algorithm, &payload)?;

        Ok(CertificateVerify {
            algorithm,
            signature: signature.into(),
        })
    }

    /// Receives and checks the peer's TLS 1.3 CertificateVerify against the
    /// leaf certificate's public key. The transcript must run up to the
    /// peer's Certificate message.
    pub async fn receive_certificate_verify_v13(
        &mut self,
        peer_public_key: &dyn PublicKey,
        hasher_factory: &HasherFactory,
        local_supported: &[SignatureScheme],
    ) -> Result<()> {
        let transcript_hash = self.handshake_transcript.hash(hasher_factory);

        let cert_verify = match self.receive_handshake_message().await? {
            Handshake::CertificateVerify(c) => c,
            other => {
                return Err(TlsError::unexpected_message(format!(
                    "Expected CertificateVerify, got {:?}",
                    other.typ()
                )));
            }
        };

        // The signer is the peer: their role string goes into the payload.
        let payload = Self::certificate_verify_payload(!self.is_server, &transcript_hash);

        if !local_supported.contains(&cert_verify.algorithm)
            || !cert_verify.algorithm.allowed_in_tls13()
        {
            return Err(TlsError::illegal_parameter(
                "CertificateVerify uses a non-advertised signature scheme",
            ));
        }

        self.check_signature(&payload, peer_public_key, &cert_verify)
    }

    /// Checks a DigitallySigned/CertificateVerify signature over a payload.
    pub fn check_signature(
        &self,
        payload: &[u8],
        public_key: &dyn PublicKey,
        cert_verify: &CertificateVerify,
    ) -> Result<()> {
        if cert_verify.algorithm.key_type() != Some(public_key.key_type()) {
            return Err(TlsError::illegal_parameter(
                "Signature scheme does not match the certificate key",
            ));
        }

        let good = public_key.verify(cert_verify.algorithm, payload, &cert_verify.signature)?;
        if !good {
            return Err(TlsError::local(
                ErrorKind::AuthenticationFailure,
                AlertDescription::decrypt_error,
                "Invalid handshake signature",
            ));
        }

        Ok(())
    }

    /// Funnel for the bad path: sends the matching fatal alert (best effort)
    /// and hands the error back for propagation. Callers mark their session
    /// non-resumable.
    pub async fn fail(&mut self, error: TlsError) -> TlsError {
        if let Some(description) = error.alert_to_send() {
            self.writer.send_fatal_alert(description).await;
        }

        error
    }
}
