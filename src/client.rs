use std::collections::HashMap;
use std::time::SystemTime;

use bytes::Bytes;
use log::debug;

use crate::alert::AlertDescription;
use crate::application_stream::{ApplicationStream, HandshakeSummary};
use crate::cipher::calc_tls13_pending_state;
use crate::cipher_suite::{CipherSuite, CipherSuiteParts, KeyExchangeAlgorithm};
use crate::cipher_tls12::calc_pending_states;
use crate::error::{ErrorKind, Result, TlsError};
use crate::extensions::*;
use crate::extensions_util::*;
use crate::handshake::*;
use crate::handshake_executor::HandshakeExecutor;
use crate::hkdf::Hkdf;
use crate::key_exchange::*;
use crate::key_schedule::{resumption_psk, KeySchedule, PskKind};
use crate::key_schedule_tls12::*;
use crate::options::ClientOptions;
use crate::provider::{HasherFactory, PublicKey};
use crate::psk::{fill_binders, BinderParams};
use crate::record::*;
use crate::record_stream::{Message, RecordReader, RecordWriter};
use crate::session::{Session, SessionCache};

pub struct Client {
    options: ClientOptions,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    pub async fn connect(
        &self,
        reader: StreamReader,
        writer: StreamWriter,
    ) -> Result<ApplicationStream> {
        self.options.settings.validate()?;

        let mut exec = ClientHandshakeExecutor::new(reader, writer, &self.options);
        match exec.run().await {
            Ok(stream) => Ok(stream),
            // One funnel for the bad path: emit the alert, poison the
            // session, propagate.
            Err(e) => {
                exec.session.resumable = false;
                Err(exec.executor.fail(e).await)
            }
        }
    }
}

/// A PSK offered in the last ClientHello, in identity order.
struct OfferedPskSecret {
    secret: Vec<u8>,
    kind: PskKind,
    hash: crate::provider::HashAlgorithm,
}

/// Performs the handshake for a single connection from the client's point of
/// view.
struct ClientHandshakeExecutor<'a> {
    executor: HandshakeExecutor,

    options: &'a ClientOptions,

    /// Secrets generated for the key shares offered in the last ClientHello.
    secrets: HashMap<NamedGroup, KeyShareSecret>,

    /// PSKs offered in the last ClientHello.
    offered_psks: Vec<OfferedPskSecret>,

    /// The session being built for this connection.
    session: Session,

    selected_alpn_protocol: Option<Bytes>,
    peer_accepts_heartbeats: bool,

    /// Session offered for resumption (1.2 id/ticket path).
    resume_session: Option<Session>,
}

impl<'a> ClientHandshakeExecutor<'a> {
    fn new(
        reader: StreamReader,
        writer: StreamWriter,
        options: &'a ClientOptions,
    ) -> ClientHandshakeExecutor<'a> {
        let resume_session = options
            .resume_session
            .clone()
            .filter(|s| s.valid())
            .or_else(|| {
                options.session_cache.as_ref().and_then(|cache| {
                    cache
                        .get(options.hostname.as_bytes())
                        .filter(|s| s.valid())
                })
            });

        ClientHandshakeExecutor {
            executor: HandshakeExecutor::new(
                RecordReader::new(reader, false),
                RecordWriter::new(writer, false),
                false,
            ),
            options,
            secrets: HashMap::new(),
            offered_psks: vec![],
            session: Session::default(),
            selected_alpn_protocol: None,
            peer_accepts_heartbeats: false,
            resume_session,
        }
    }

    async fn run(&mut self) -> Result<ApplicationStream> {
        let client_hello = self.build_client_hello()?;

        self.executor
            .send_handshake_message(Handshake::ClientHello(client_hello.clone()))
            .await?;

        self.wait_server_hello(client_hello).await
    }

    fn rng(&self) -> &dyn crate::provider::SecureRandom {
        self.options.provider.random()
    }

    fn build_client_hello(&mut self) -> Result<ClientHello> {
        let settings = self.options.settings.clone();

        let mut random = vec![0u8; 32];
        self.rng().fill(&mut random);

        let mut cipher_suites = settings.effective_cipher_suites();

        // SRP suites only make sense with credentials configured.
        if self.options.srp_credentials.is_none() {
            cipher_suites.retain(|s| {
                !matches!(
                    s.key_exchange(),
                    KeyExchangeAlgorithm::SrpSha | KeyExchangeAlgorithm::SrpShaRsa
                )
            });
        }

        if cipher_suites.is_empty() {
            return Err(TlsError::handshake_failure("No usable cipher suites"));
        }

        // Signal "no renegotiation state" on an initial handshake.
        cipher_suites.push(CipherSuite::TLS_EMPTY_RENEGOTIATION_INFO_SCSV);
        if settings.send_fallback_scsv {
            cipher_suites.push(CipherSuite::TLS_FALLBACK_SCSV);
        }

        let mut extensions = vec![];

        if !self.options.hostname.is_empty() {
            extensions.push(Extension::ServerName(Some(ServerNameList {
                names: vec![ServerName {
                    typ: NameType::host_name,
                    data: Bytes::from(self.options.hostname.clone().into_bytes()),
                }],
            })));
        }

        if settings.supports_tls13() {
            let mut versions = vec![TLS_1_3_VERSION];
            if settings.supports_tls12() {
                versions.push(TLS_1_2_VERSION);
            }
            extensions.push(Extension::SupportedVersionsClientHello(
                SupportedVersionsClientHello { versions },
            ));
        }

        // supported_groups: shares first, then the remaining preferences.
        let mut groups = vec![];
        for g in settings
            .key_shares
            .iter()
            .chain(settings.ecc_curves.iter())
            .chain(settings.dh_groups.iter())
        {
            if !groups.contains(g) {
                groups.push(*g);
            }
        }
        extensions.push(Extension::SupportedGroups(NamedGroupList { groups }));

        extensions.push(Extension::SignatureAlgorithms(SignatureSchemeList {
            algorithms: settings.supported_signature_schemes(),
        }));

        extensions.push(Extension::SupportedPointFormats(ECPointFormatList {
            formats: settings.ec_point_formats.clone(),
        }));

        if settings.supports_tls12() {
            if settings.use_extended_master_secret {
                extensions.push(Extension::ExtendedMasterSecret);
            }
            if settings.use_encrypt_then_mac {
                extensions.push(Extension::EncryptThenMac);
            }

            // Empty = please issue a ticket; non-empty = please resume.
            let offered_ticket = self
                .resume_session
                .as_ref()
                .and_then(|s| s.ticket_tls12.clone())
                .unwrap_or_default();
            extensions.push(Extension::SessionTicket(offered_ticket));
        }

        if !self.options.alpn_ids.is_empty() {
            extensions.push(Extension::ALPN(ProtocolNameList {
                names: self.options.alpn_ids.clone(),
            }));
        }

        extensions.push(Extension::StatusRequest(Some(
            CertificateStatusRequest::ocsp(),
        )));

        if settings.record_size_limit > 0 {
            extensions.push(Extension::RecordSizeLimit(settings.record_size_limit));
        }

        if settings.use_heartbeat_extension {
            extensions.push(Extension::Heartbeat(HeartbeatMode::peer_allowed_to_send));
        }

        if let Some((username, _)) = &self.options.srp_credentials {
            extensions.push(Extension::SrpUsername(username.clone()));
        }

        // TLS 1.3 key shares.
        if settings.supports_tls13() {
            let mut client_shares = vec![];
            for group in settings.key_shares.iter().cloned() {
                client_shares.push(self.new_key_share(group)?);
            }
            extensions.push(Extension::KeyShareClientHello(KeyShareClientHello {
                client_shares,
            }));

            if !settings.psk_modes.is_empty() {
                extensions.push(Extension::PskKeyExchangeModes(PskKeyExchangeModeList {
                    modes: settings.psk_modes.clone(),
                }));
            }
        }

        // The 1.2 session-id resumption offer rides in legacy_session_id; in
        // a 1.3-capable hello the field instead carries the middlebox
        // compatibility value.
        let legacy_session_id = if let Some(resume) = &self.resume_session {
            if !resume.session_id.is_empty() && !resume.master_secret.is_empty() {
                resume.session_id.clone()
            } else {
                Bytes::new()
            }
        } else {
            Bytes::new()
        };

        let legacy_session_id = if settings.supports_tls13() && legacy_session_id.is_empty() {
            let mut compat_id = vec![0u8; 32];
            self.rng().fill(&mut compat_id);
            Bytes::from(compat_id)
        } else {
            legacy_session_id
        };

        let mut hello = ClientHello {
            legacy_version: TLS_1_2_VERSION,
            random: random.into(),
            legacy_session_id,
            cipher_suites,
            legacy_compression_methods: Bytes::from_static(&[0]),
            extensions,
        };

        // pre_shared_key MUST be last; binders are filled after the rest of
        // the hello is final.
        self.attach_pre_shared_keys(&mut hello)?;

        Ok(hello)
    }

    /// Appends the pre_shared_key extension (tickets + external PSKs) and
    /// computes the binders.
    fn attach_pre_shared_keys(&mut self, hello: &mut ClientHello) -> Result<()> {
        if !self.options.settings.supports_tls13() {
            return Ok(());
        }

        self.offered_psks.clear();

        let now = SystemTime::now();
        let mut identities = vec![];
        let mut binders = vec![];
        let mut params = vec![];

        // Resumption tickets first.
        if let Some(resume) = &self.resume_session {
            if !resume.resumption_master_secret.is_empty() {
                if let Some(suite) = resume.cipher_suite {
                    let hash = suite.prf_hash();
                    let factory = self.options.provider.hasher_factory(hash)?;
                    let hkdf = Hkdf::new(factory.clone());

                    for ticket in resume.tickets.iter().filter(|t| !t.expired(now)) {
                        let psk =
                            resumption_psk(&hkdf, &resume.resumption_master_secret, &ticket.nonce);

                        identities.push(PskIdentity {
                            identity: ticket.ticket.clone(),
                            obfuscated_ticket_age: ticket.obfuscated_age(now),
                        });
                        binders.push(Bytes::from(vec![0u8; factory.create().output_size()]));
                        params.push(BinderParams {
                            secret: psk,
                            kind: PskKind::Resumption,
                            hasher_factory: factory.clone(),
                        });
                        self.offered_psks.push(OfferedPskSecret {
                            secret: params.last().unwrap().secret.clone(),
                            kind: PskKind::Resumption,
                            hash,
                        });
                    }
                }
            }
        }

        // Externally configured PSKs use an age of zero.
        for config in &self.options.settings.psk_configs {
            let factory = self.options.provider.hasher_factory(config.hash)?;

            identities.push(PskIdentity {
                identity: config.identity.clone(),
                obfuscated_ticket_age: 0,
            });
            binders.push(Bytes::from(vec![0u8; factory.create().output_size()]));
            params.push(BinderParams {
                secret: config.secret.to_vec(),
                kind: PskKind::External,
                hasher_factory: factory,
            });
            self.offered_psks.push(OfferedPskSecret {
                secret: config.secret.to_vec(),
                kind: PskKind::External,
                hash: config.hash,
            });
        }

        if identities.is_empty() {
            return Ok(());
        }

        hello
            .extensions
            .push(Extension::PreSharedKeyClientHello(OfferedPsks {
                identities,
                binders,
            }));

        fill_binders(hello, &self.executor.handshake_transcript, &params)
    }

    /// Generates a new secret and returns the corresponding share entry.
    fn new_key_share(&mut self, group: NamedGroup) -> Result<KeyShareEntry> {
        let (entry, secret) =
            generate_key_share(group, self.options.provider.as_ref(), self.rng())?;

        self.secrets.insert(group, secret);
        Ok(entry)
    }

    async fn wait_server_hello(
        &mut self,
        mut client_hello: ClientHello,
    ) -> Result<ApplicationStream> {
        let mut last_retry: Option<ServerHello> = None;

        loop {
            let server_hello = match self.executor.receive_handshake_message().await? {
                Handshake::ServerHello(sh) => sh,
                other => {
                    return Err(TlsError::unexpected_message(format!(
                        "Expected ServerHello, got {:?}",
                        other.typ()
                    )));
                }
            };

            let is_retry = server_hello.is_hello_retry_request();

            let is_tls13 = server_hello.legacy_version == TLS_1_2_VERSION
                && find_supported_versions_sh(&server_hello.extensions)
                    .map(|sv| sv.selected_version == TLS_1_3_VERSION)
                    .unwrap_or(false);

            if !is_tls13 {
                if last_retry.is_some() {
                    return Err(TlsError::illegal_parameter(
                        "Downgrade to TLS 1.2 after a retry",
                    ));
                }

                if server_hello.legacy_version != TLS_1_2_VERSION
                    || !self.options.settings.supports_tls12()
                {
                    return Err(TlsError::protocol_version(
                        "Server picked an unsupported version",
                    ));
                }

                self.executor.reader.protocol_version = TLS_1_2_VERSION;
                self.executor.writer.protocol_version = TLS_1_2_VERSION;
                return self.run_tls12(client_hello, server_hello).await;
            }

            if server_hello.legacy_compression_method != 0 {
                return Err(TlsError::illegal_parameter(
                    "Unexpected compression method",
                ));
            }

            if server_hello.legacy_session_id_echo != client_hello.legacy_session_id {
                return Err(TlsError::illegal_parameter("Bad legacy_session_id_echo"));
            }

            // The suite must be one we offered.
            if !client_hello
                .cipher_suites
                .contains(&server_hello.cipher_suite)
                || !server_hello.cipher_suite.is_tls13()
            {
                return Err(TlsError::illegal_parameter(
                    "Server selected a cipher suite we did not offer",
                ));
            }

            self.executor.reader.protocol_version = TLS_1_3_VERSION;
            self.executor.writer.protocol_version = TLS_1_3_VERSION;

            if is_retry {
                if last_retry.is_some() {
                    return Err(TlsError::unexpected_message(
                        "Retrying the ClientHello more than once",
                    ));
                }

                client_hello = self
                    .handle_hello_retry(client_hello, &server_hello)
                    .await?;
                last_retry = Some(server_hello);
                continue;
            }

            if let Some(retry) = &last_retry {
                if retry.cipher_suite != server_hello.cipher_suite {
                    return Err(TlsError::illegal_parameter(
                        "cipher_suite changed after the retry",
                    ));
                }
            }

            return self.run_tls13(client_hello, server_hello).await;
        }
    }

    /// RFC 8446 4.1.4: adjust and resend the ClientHello.
    async fn handle_hello_retry(
        &mut self,
        mut client_hello: ClientHello,
        retry: &ServerHello,
    ) -> Result<ClientHello> {
        // ClientHello1 is replaced in the transcript by its hash, with the
        // HelloRetryRequest staying put behind it.
        let suite_factory = self
            .options
            .provider
            .hasher_factory(retry.cipher_suite.prf_hash())?;
        let hrr_bytes = self
            .executor
            .handshake_transcript
            .pop_last()
            .ok_or_else(|| TlsError::internal("Empty transcript at retry"))?;
        self.executor
            .handshake_transcript
            .condense_for_retry(&suite_factory);
        self.executor.handshake_transcript.push(hrr_bytes);

        let selected_group = find_key_share_retry(&retry.extensions)
            .ok_or_else(|| TlsError::illegal_parameter("Retry without a key_share"))?
            .selected_group;

        if self.secrets.contains_key(&selected_group) {
            return Err(TlsError::illegal_parameter(
                "Server retried with a group we already offered",
            ));
        }

        let known = {
            let s = &self.options.settings;
            s.ecc_curves.contains(&selected_group)
                || s.dh_groups.contains(&selected_group)
                || s.key_shares.contains(&selected_group)
        };
        if !known {
            return Err(TlsError::illegal_parameter(
                "Server retried with a group we did not advertise",
            ));
        }

        // Replace the key shares; the server may not back up to a share it
        // already rejected.
        self.secrets.clear();
        client_hello.extensions.retain(|e| {
            !matches!(
                e,
                Extension::KeyShareClientHello(_)
                    | Extension::Cookie(_)
                    | Extension::PreSharedKeyClientHello(_)
            )
        });

        let share = self.new_key_share(selected_group)?;
        client_hello
            .extensions
            .push(Extension::KeyShareClientHello(KeyShareClientHello {
                client_shares: vec![share],
            }));

        if let Some(cookie) = find_cookie(&retry.extensions) {
            client_hello
                .extensions
                .push(Extension::Cookie(cookie.clone()));
        }

        // Binders are recomputed over the updated transcript.
        self.attach_pre_shared_keys(&mut client_hello)?;

        self.executor
            .send_handshake_message(Handshake::ClientHello(client_hello.clone()))
            .await?;

        Ok(client_hello)
    }

    ////////////////////////////////////////////////////////////////////////
    // TLS 1.3
    ////////////////////////////////////////////////////////////////////////

    async fn run_tls13(
        &mut self,
        _client_hello: ClientHello,
        server_hello: ServerHello,
    ) -> Result<ApplicationStream> {
        let cipher_suite = server_hello.cipher_suite;
        let parts = match cipher_suite.decode(self.options.provider.as_ref())? {
            CipherSuiteParts::Tls13(v) => v,
            _ => return Err(TlsError::internal("Suite is not TLS 1.3")),
        };
        let hasher_factory = parts.hasher_factory.clone();
        let hkdf = Hkdf::new(hasher_factory.clone());

        // Which PSK, if any, did the server take?
        let psk = match find_pre_shared_key_sh(&server_hello.extensions) {
            Some(index) => {
                let offered = self
                    .offered_psks
                    .get(index as usize)
                    .ok_or_else(|| {
                        TlsError::illegal_parameter("selected_identity out of range")
                    })?;

                if offered.hash != cipher_suite.prf_hash() {
                    return Err(TlsError::illegal_parameter(
                        "PSK hash does not match the selected suite",
                    ));
                }

                debug!("server accepted PSK identity {}", index);
                Some(offered.secret.clone())
            }
            None => None,
        };

        // Shared secret from the key_share, absent in pure psk_ke mode.
        let shared_secret = match find_key_share_sh(&server_hello.extensions) {
            Some(ks) => {
                let secret = self
                    .secrets
                    .get(&ks.server_share.group)
                    .ok_or_else(|| {
                        TlsError::illegal_parameter(
                            "Server share group was not offered in the last ClientHello",
                        )
                    })?;

                client_complete_key_share(
                    ks.server_share.group,
                    self.options.provider.as_ref(),
                    secret,
                    &ks.server_share.key_exchange,
                )?
            }
            None => {
                if psk.is_none() {
                    return Err(TlsError::illegal_parameter(
                        "ServerHello without key_share or PSK",
                    ));
                }

                vec![0u8; hkdf.hash_size()]
            }
        };

        let mut key_schedule = KeySchedule::new(hkdf.clone(), hasher_factory.clone());
        key_schedule.early_secret(psk.as_deref());
        key_schedule.handshake_secret(&shared_secret);

        let hs_secrets =
            key_schedule.handshake_traffic_secrets(&self.executor.handshake_transcript);
        key_schedule.master_secret();

        let (client_spec, server_spec) = calc_tls13_pending_state(
            cipher_suite,
            self.options.provider.as_ref(),
            hs_secrets.client_handshake_traffic_secret.clone(),
            hs_secrets.server_handshake_traffic_secret.clone(),
        )?;

        self.executor.reader.set_pending_state(server_spec);
        self.executor.reader.change_read_state()?;
        self.executor.writer.set_pending_state(client_spec);

        // Middlebox compatibility CCS goes out before anything encrypted.
        self.executor.writer.send_change_cipher_spec().await?;
        self.executor.writer.change_write_state()?;

        // EncryptedExtensions.
        let ee = match self.executor.receive_handshake_message().await? {
            Handshake::EncryptedExtensions(e) => e,
            other => {
                return Err(TlsError::unexpected_message(format!(
                    "Expected EncryptedExtensions, got {:?}",
                    other.typ()
                )));
            }
        };
        self.process_negotiated_extensions(&ee.extensions)?;

        // Server authentication block.
        let mut cert_request = None;
        if psk.is_none() {
            let mut msg = self.executor.receive_handshake_message().await?;

            if let Handshake::CertificateRequest(req) = msg {
                cert_request = Some(req);
                msg = self.executor.receive_handshake_message().await?;
            }

            let certificate = match msg {
                Handshake::Certificate(c) => c,
                other => {
                    return Err(TlsError::unexpected_message(format!(
                        "Expected Certificate, got {:?}",
                        other.typ()
                    )));
                }
            };

            if certificate.certificate_list.is_empty() {
                return Err(TlsError::local(
                    ErrorKind::AuthenticationFailure,
                    AlertDescription::certificate_required,
                    "Server sent an empty certificate chain",
                ));
            }

            self.session.server_cert_chain = certificate
                .certificate_list
                .iter()
                .map(|e| e.cert.clone())
                .collect();

            let leaf_key = self
                .options
                .provider
                .certificate_public_key(&certificate.certificate_list[0].cert)?;

            self.executor
                .receive_certificate_verify_v13(
                    leaf_key.as_ref(),
                    &hasher_factory,
                    &self.options.settings.supported_signature_schemes(),
                )
                .await?;
        }

        let verify_data_server =
            key_schedule.verify_data_server(&self.executor.handshake_transcript);
        self.executor.receive_finished(&verify_data_server).await?;

        // Application secrets cover the transcript through the server
        // Finished.
        let app_secrets = key_schedule.application_secrets(&self.executor.handshake_transcript);

        // Client authentication flight.
        if let Some(req) = cert_request {
            self.send_client_certificate_tls13(&req, &hasher_factory)
                .await?;
        }

        let verify_data_client =
            key_schedule.verify_data_client(&self.executor.handshake_transcript);
        self.executor.send_finished(verify_data_client).await?;

        let resumption_master_secret =
            key_schedule.resumption_master_secret(&self.executor.handshake_transcript);

        // Switch both directions to application keys.
        let (client_app, server_app) = calc_tls13_pending_state(
            cipher_suite,
            self.options.provider.as_ref(),
            app_secrets.client_application_traffic_secret_0.clone(),
            app_secrets.server_application_traffic_secret_0.clone(),
        )?;
        self.executor.reader.set_pending_state(server_app);
        self.executor.reader.change_read_state()?;
        self.executor.writer.set_pending_state(client_app);
        self.executor.writer.change_write_state()?;

        self.session.cipher_suite = Some(cipher_suite);
        self.session.resumption_master_secret = resumption_master_secret;
        self.session.cl_app_secret = app_secrets.client_application_traffic_secret_0;
        self.session.sr_app_secret = app_secrets.server_application_traffic_secret_0;
        self.session.app_proto = self.selected_alpn_protocol.clone();
        self.session.resumable = true;

        debug!("TLS 1.3 handshake complete ({:?})", cipher_suite);

        Ok(self.finish_stream(TLS_1_3_VERSION, cipher_suite, psk.is_some(), hasher_factory))
    }

    async fn send_client_certificate_tls13(
        &mut self,
        request: &CertificateRequest,
        hasher_factory: &HasherFactory,
    ) -> Result<()> {
        let auth = self.options.certificate_auth.clone();

        let chain: Vec<Bytes> = auth
            .as_ref()
            .map(|a| a.chain.clone())
            .unwrap_or_default();

        let certificate = Certificate {
            certificate_request_context: request.certificate_request_context.clone(),
            certificate_list: chain
                .iter()
                .map(|cert| CertificateEntry {
                    cert: cert.clone(),
                    extensions: vec![],
                })
                .collect(),
        };

        self.session.client_cert_chain = chain.clone();

        self.executor
            .send_handshake_message(Handshake::Certificate(certificate))
            .await?;

        // An empty chain carries no proof of possession.
        let auth = match auth {
            Some(a) if !a.chain.is_empty() => a,
            _ => return Ok(()),
        };

        let server_schemes = find_signature_algorithms(&request.extensions)
            .ok_or_else(|| {
                TlsError::illegal_parameter("CertificateRequest without signature_algorithms")
            })?
            .algorithms
            .clone();

        let cert_verify = self.executor.create_certificate_verify(
            hasher_factory,
            &self.options.settings.supported_signature_schemes(),
            &server_schemes,
            auth.private_key.as_ref(),
        )?;

        self.executor
            .send_handshake_message(Handshake::CertificateVerify(cert_verify))
            .await
    }

    ////////////////////////////////////////////////////////////////////////
    // TLS 1.2
    ////////////////////////////////////////////////////////////////////////

    async fn run_tls12(
        &mut self,
        client_hello: ClientHello,
        server_hello: ServerHello,
    ) -> Result<ApplicationStream> {
        let cipher_suite = server_hello.cipher_suite;

        if !client_hello.cipher_suites.contains(&cipher_suite)
            || !cipher_suite.usable_with_version(TLS_1_2_VERSION)
        {
            return Err(TlsError::illegal_parameter(
                "Server selected a cipher suite we did not offer",
            ));
        }

        if server_hello.legacy_compression_method != 0 {
            return Err(TlsError::illegal_parameter("Unexpected compression method"));
        }

        let ems = has_extended_master_secret(&server_hello.extensions);
        let etm = has_encrypt_then_mac(&server_hello.extensions)
            && cipher_suite.bulk_cipher().is_block();
        let ticket_supported = find_session_ticket(&server_hello.extensions).is_some();

        if self.options.settings.require_extended_master_secret && !ems {
            return Err(TlsError::handshake_failure(
                "Peer refused extended_master_secret",
            ));
        }

        if let Some(reneg) = server_hello.extensions.iter().find_map(|e| match e {
            Extension::RenegotiationInfo(data) => Some(data),
            _ => None,
        }) {
            if !reneg.is_empty() {
                return Err(TlsError::handshake_failure(
                    "Unexpected renegotiated_connection data",
                ));
            }
        }

        self.process_negotiated_extensions(&server_hello.extensions)?;

        let prf_factory = self
            .options
            .provider
            .hasher_factory(cipher_suite.prf_hash())?;

        // Session-id resumption: the server echoed the id we offered.
        let offered_resume = self.resume_session.clone();
        if let Some(resume) = &offered_resume {
            let same_id = !resume.session_id.is_empty()
                && server_hello.legacy_session_id_echo == resume.session_id;

            if same_id {
                // RFC 7627: an EMS session cannot be resumed without EMS.
                if resume.extended_master_secret != ems {
                    return Err(TlsError::handshake_failure(
                        "extended_master_secret changed across resumption",
                    ));
                }

                if resume.cipher_suite != Some(cipher_suite) {
                    return Err(TlsError::illegal_parameter(
                        "Cipher suite changed across resumption",
                    ));
                }

                return self
                    .finish_tls12_resumption(
                        &client_hello,
                        &server_hello,
                        resume.clone(),
                        prf_factory,
                        etm,
                        None,
                    )
                    .await;
            }
        }

        // RFC 5077: a server accepting an offered ticket signals it only by
        // jumping straight to [NewSessionTicket,] ChangeCipherSpec. Peek at
        // the next event to find out which way this goes.
        let mut pending_message = None;
        let offered_ticket = offered_resume
            .as_ref()
            .map(|r| r.ticket_tls12.is_some() && r.cipher_suite == Some(cipher_suite))
            .unwrap_or(false);

        if offered_ticket {
            let first = self.executor.receive_event().await?;
            let accepted = matches!(&first, Message::ChangeCipherSpec(_))
                || matches!(
                    &first,
                    Message::Handshake(Handshake::NewSessionTicketTls12(_))
                );

            if accepted {
                let resume = offered_resume.unwrap();
                if resume.extended_master_secret != ems {
                    return Err(TlsError::handshake_failure(
                        "extended_master_secret changed across resumption",
                    ));
                }

                return self
                    .finish_tls12_resumption(
                        &client_hello,
                        &server_hello,
                        resume,
                        prf_factory,
                        etm,
                        Some(first),
                    )
                    .await;
            }

            pending_message = Some(first);
        }

        self.run_tls12_full(
            client_hello,
            server_hello,
            ems,
            etm,
            ticket_supported,
            prf_factory,
            pending_message,
        )
        .await
    }

    /// Abbreviated handshake: server goes straight to [NewSessionTicket,]
    /// CCS, Finished.
    async fn finish_tls12_resumption(
        &mut self,
        client_hello: &ClientHello,
        server_hello: &ServerHello,
        resume: Session,
        prf_factory: HasherFactory,
        etm: bool,
        first_event: Option<Message>,
    ) -> Result<ApplicationStream> {
        let cipher_suite = server_hello.cipher_suite;
        debug!("resuming TLS 1.2 session by id");

        let key_schedule =
            KeyScheduleTls12::new(prf_factory.clone(), resume.master_secret.to_vec());

        let states = calc_pending_states(
            cipher_suite,
            self.options.provider.clone(),
            resume.master_secret.as_ref(),
            &client_hello.random,
            &server_hello.random,
            TLS_1_2_VERSION,
            etm,
            true,
        )?;
        self.executor.reader.set_pending_state(states.server_write);
        self.executor.writer.set_pending_state(states.client_write);

        // Server may refresh the ticket before its CCS.
        let mut msg = match first_event {
            Some(m) => m,
            None => self.executor.receive_event().await?,
        };
        if let Message::Handshake(Handshake::NewSessionTicketTls12(ticket)) = msg {
            self.session.ticket_tls12 = Some(ticket.ticket);
            msg = self.executor.receive_event().await?;
        }

        match msg {
            Message::ChangeCipherSpec(_) => {}
            _ => return Err(TlsError::unexpected_message("Expected ChangeCipherSpec")),
        }
        self.executor.reader.change_read_state()?;

        let verify_data_server =
            key_schedule.verify_data_server(&self.executor.handshake_transcript);
        self.executor.receive_finished(&verify_data_server).await?;

        self.executor.writer.send_change_cipher_spec().await?;
        self.executor.writer.change_write_state()?;

        let verify_data_client =
            key_schedule.verify_data_client(&self.executor.handshake_transcript);
        self.executor
            .send_finished(verify_data_client.into())
            .await?;

        self.session = Session {
            session_id: resume.session_id.clone(),
            cipher_suite: Some(cipher_suite),
            master_secret: resume.master_secret.clone(),
            extended_master_secret: resume.extended_master_secret,
            encrypt_then_mac: etm,
            app_proto: self.selected_alpn_protocol.clone(),
            server_cert_chain: resume.server_cert_chain.clone(),
            ocsp_response: resume.ocsp_response.clone(),
            resumable: true,
            ticket_tls12: self.session.ticket_tls12.take().or(resume.ticket_tls12),
            ..Session::default()
        };

        Ok(self.finish_stream(TLS_1_2_VERSION, cipher_suite, true, prf_factory))
    }

    async fn run_tls12_full(
        &mut self,
        client_hello: ClientHello,
        server_hello: ServerHello,
        ems: bool,
        etm: bool,
        ticket_supported: bool,
        prf_factory: HasherFactory,
        pending_message: Option<Message>,
    ) -> Result<ApplicationStream> {
        let cipher_suite = server_hello.cipher_suite;
        let kx_algorithm = cipher_suite.key_exchange();
        let settings = self.options.settings.clone();

        let needs_certificate = !kx_algorithm.is_anonymous()
            && kx_algorithm != KeyExchangeAlgorithm::SrpSha;

        // Server flight: Certificate? CertificateStatus? ServerKeyExchange?
        // CertificateRequest? ServerHelloDone.
        let mut certificate: Option<Certificate> = None;
        let mut certificate_status: Option<CertificateStatus> = None;
        let mut server_kx: Option<ServerKeyExchange> = None;
        let mut cert_request: Option<CertificateRequestTls12> = None;

        let mut pending_message = pending_message;
        loop {
            let message = match pending_message.take() {
                Some(Message::Handshake(m)) => m,
                Some(_) => {
                    return Err(TlsError::unexpected_message(
                        "ChangeCipherSpec before the server flight",
                    ))
                }
                None => self.executor.receive_handshake_message().await?,
            };

            match message {
                Handshake::Certificate(c) => {
                    if certificate.is_some() || !needs_certificate {
                        return Err(TlsError::unexpected_message("Unexpected Certificate"));
                    }
                    certificate = Some(c);
                }
                Handshake::CertificateStatus(s) => {
                    if certificate.is_none() || certificate_status.is_some() {
                        return Err(TlsError::unexpected_message(
                            "CertificateStatus out of order",
                        ));
                    }
                    certificate_status = Some(s);
                }
                Handshake::ServerKeyExchange(kx) => {
                    if server_kx.is_some() {
                        return Err(TlsError::unexpected_message(
                            "Duplicate ServerKeyExchange",
                        ));
                    }
                    server_kx = Some(kx);
                }
                Handshake::CertificateRequestTls12(r) => {
                    if cert_request.is_some() {
                        return Err(TlsError::unexpected_message(
                            "Duplicate CertificateRequest",
                        ));
                    }
                    cert_request = Some(r);
                }
                Handshake::ServerHelloDone => break,
                other => {
                    return Err(TlsError::unexpected_message(format!(
                        "Unexpected server flight message: {:?}",
                        other.typ()
                    )));
                }
            }
        }

        if needs_certificate && certificate.is_none() {
            return Err(TlsError::unexpected_message("Server sent no certificate"));
        }

        let server_public_key: Option<Box<dyn PublicKey>> = match &certificate {
            Some(c) if !c.certificate_list.is_empty() => {
                self.session.server_cert_chain = c
                    .certificate_list
                    .iter()
                    .map(|e| e.cert.clone())
                    .collect();
                Some(
                    self.options
                        .provider
                        .certificate_public_key(&c.certificate_list[0].cert)?,
                )
            }
            Some(_) => {
                return Err(TlsError::local(
                    ErrorKind::AuthenticationFailure,
                    AlertDescription::certificate_required,
                    "Server sent an empty certificate chain",
                ))
            }
            None => None,
        };

        if let Some(status) = certificate_status {
            self.session.ocsp_response = Some(status.response);
        }

        // Key exchange dispatch.
        let (ckx_body, premaster) = self
            .process_tls12_key_exchange(
                kx_algorithm,
                &client_hello,
                &server_hello,
                server_kx,
                server_public_key.as_deref(),
            )
            .await?;

        // Client certificate, if requested.
        let client_auth_sends_cv = if let Some(_req) = &cert_request {
            let chain = self
                .options
                .certificate_auth
                .as_ref()
                .map(|a| a.chain.clone())
                .unwrap_or_default();

            let cert_msg = Certificate {
                certificate_request_context: Bytes::new(),
                certificate_list: chain
                    .iter()
                    .map(|c| CertificateEntry {
                        cert: c.clone(),
                        extensions: vec![],
                    })
                    .collect(),
            };

            self.session.client_cert_chain = chain.clone();

            let raw = serialize_certificate_message(&cert_msg, TLS_1_2_VERSION);
            self.executor.send_raw_handshake(raw).await?;

            !chain.is_empty()
        } else {
            false
        };

        self.executor
            .send_handshake_message(Handshake::ClientKeyExchange(ClientKeyExchange {
                data: ckx_body,
            }))
            .await?;

        // Master secret: EMS binds it to the transcript through the
        // ClientKeyExchange just sent; classic uses the randoms.
        let master_secret = if ems {
            let session_hash = self.executor.handshake_transcript.hash(&prf_factory);
            extended_master_secret(&premaster, &session_hash, &prf_factory)
        } else {
            master_secret(
                &premaster,
                &client_hello.random,
                &server_hello.random,
                &prf_factory,
            )
        };

        // CertificateVerify proves possession of the client key. It covers
        // the whole transcript up to this point.
        if client_auth_sends_cv {
            let auth = self.options.certificate_auth.as_ref().unwrap();
            let request = cert_request.as_ref().unwrap();

            let scheme = HandshakeExecutor::select_signature_scheme(
                &settings.supported_signature_schemes(),
                &request.supported_signature_algorithms,
                auth.private_key.as_ref(),
                false,
            )?;

            let payload = self.executor.handshake_transcript.concat();
            let signature = auth.private_key.sign(scheme, &payload)?;

            self.executor
                .send_handshake_message(Handshake::CertificateVerify(CertificateVerify {
                    algorithm: scheme,
                    signature: signature.into(),
                }))
                .await?;
        }

        let key_schedule = KeyScheduleTls12::new(prf_factory.clone(), master_secret.clone());

        let states = calc_pending_states(
            cipher_suite,
            self.options.provider.clone(),
            &master_secret,
            &client_hello.random,
            &server_hello.random,
            TLS_1_2_VERSION,
            etm,
            true,
        )?;
        self.executor.reader.set_pending_state(states.server_write);
        self.executor.writer.set_pending_state(states.client_write);

        self.executor.writer.send_change_cipher_spec().await?;
        self.executor.writer.change_write_state()?;

        let verify_data_client =
            key_schedule.verify_data_client(&self.executor.handshake_transcript);
        self.executor
            .send_finished(verify_data_client.into())
            .await?;

        // Server: [NewSessionTicket,] CCS, Finished.
        let mut msg = self.executor.receive_event().await?;
        if ticket_supported {
            if let Message::Handshake(Handshake::NewSessionTicketTls12(ticket)) = msg {
                self.session.ticket_tls12 = Some(ticket.ticket);
                msg = self.executor.receive_event().await?;
            }
        }

        match msg {
            Message::ChangeCipherSpec(_) => {}
            _ => return Err(TlsError::unexpected_message("Expected ChangeCipherSpec")),
        }
        self.executor.reader.change_read_state()?;

        let verify_data_server =
            key_schedule.verify_data_server(&self.executor.handshake_transcript);
        self.executor.receive_finished(&verify_data_server).await?;

        self.session.session_id = server_hello.legacy_session_id_echo.clone();
        self.session.cipher_suite = Some(cipher_suite);
        self.session.master_secret = master_secret.into();
        self.session.extended_master_secret = ems;
        self.session.encrypt_then_mac = etm;
        self.session.app_proto = self.selected_alpn_protocol.clone();
        self.session.resumable = true;

        debug!("TLS 1.2 handshake complete ({:?})", cipher_suite);

        Ok(self.finish_stream(TLS_1_2_VERSION, cipher_suite, false, prf_factory))
    }

    /// Runs the client half of the negotiated key exchange method:
    /// consumes the ServerKeyExchange (verifying its signature where the
    /// method is authenticated) and produces the ClientKeyExchange body plus
    /// the premaster secret.
    async fn process_tls12_key_exchange(
        &mut self,
        kx_algorithm: KeyExchangeAlgorithm,
        client_hello: &ClientHello,
        server_hello: &ServerHello,
        server_kx: Option<ServerKeyExchange>,
        server_public_key: Option<&dyn PublicKey>,
    ) -> Result<(Bytes, Vec<u8>)> {
        let settings = &self.options.settings;
        use KeyExchangeAlgorithm::*;

        // Everything except static RSA requires a ServerKeyExchange.
        if kx_algorithm != Rsa && server_kx.is_none() {
            return Err(TlsError::unexpected_message("Missing ServerKeyExchange"));
        }

        let verify_skx = |params: &[u8], signed: &CertificateVerify| -> Result<()> {
            let key = server_public_key
                .ok_or_else(|| TlsError::internal("Authenticated kx without a certificate"))?;

            if !settings
                .supported_signature_schemes()
                .contains(&signed.algorithm)
            {
                return Err(TlsError::illegal_parameter(
                    "ServerKeyExchange signed with a non-advertised scheme",
                ));
            }

            let payload = server_key_exchange_payload(
                &client_hello.random,
                &server_hello.random,
                params,
            );
            self.executor.check_signature(&payload, key, signed)
        };

        match kx_algorithm {
            Rsa => {
                let key = server_public_key
                    .ok_or_else(|| TlsError::internal("RSA kx without a certificate"))?;

                let kx = RsaKeyExchange {
                    client_version: client_hello.legacy_version,
                    server_version: server_hello.legacy_version,
                };
                kx.make_client_key_exchange(key, self.rng())
            }
            EcdheRsa | EcdheEcdsa | EcdhAnon => {
                let data = server_kx.unwrap().data;
                let mut r = crate::parsing::ByteReader::new(data);
                let params = ServerEcdhParams::parse(&mut r)?;

                if kx_algorithm != EcdhAnon {
                    let signed = CertificateVerify::parse(&mut r)?;
                    let mut params_raw = vec![];
                    params.serialize(&mut params_raw);
                    verify_skx(&params_raw, &signed)?;
                }
                r.finish()?;

                let mut kx = EcdheKeyExchange::new(self.options.provider.clone());
                kx.process_server_key_exchange(&params, &settings.ecc_curves)?;
                kx.make_client_key_exchange(self.rng())
            }
            DheRsa | DhAnon => {
                let data = server_kx.unwrap().data;
                let mut r = crate::parsing::ByteReader::new(data);
                let params = ServerDhParams::parse(&mut r)?;

                if kx_algorithm != DhAnon {
                    let signed = CertificateVerify::parse(&mut r)?;
                    let mut params_raw = vec![];
                    params.serialize(&mut params_raw);
                    verify_skx(&params_raw, &signed)?;
                }
                r.finish()?;

                let mut kx =
                    DheKeyExchange::new(settings.min_key_size, settings.max_key_size);
                kx.process_server_key_exchange(&params)?;
                kx.make_client_key_exchange(self.rng())
            }
            SrpSha | SrpShaRsa => {
                let (username, password) = self
                    .options
                    .srp_credentials
                    .clone()
                    .ok_or_else(|| TlsError::internal("SRP suite without credentials"))?;

                let data = server_kx.unwrap().data;
                let mut r = crate::parsing::ByteReader::new(data);
                let params = ServerSrpParams::parse(&mut r)?;

                if kx_algorithm == SrpShaRsa {
                    let signed = CertificateVerify::parse(&mut r)?;
                    let mut params_raw = vec![];
                    params.serialize(&mut params_raw);
                    verify_skx(&params_raw, &signed)?;
                }
                r.finish()?;

                let sha1 = self
                    .options
                    .provider
                    .hasher_factory(crate::provider::HashAlgorithm::Sha1)?;
                let mut kx =
                    SrpKeyExchange::new(sha1, settings.min_key_size, settings.max_key_size);
                kx.process_server_key_exchange(&params)?;
                kx.make_client_key_exchange(&username, &password, self.rng())
            }
            Tls13 => Err(TlsError::internal("TLS 1.3 suite in a 1.2 flow")),
        }
    }

    ////////////////////////////////////////////////////////////////////////

    fn process_negotiated_extensions(&mut self, extensions: &[Extension]) -> Result<()> {
        for e in extensions {
            match e {
                Extension::ALPN(protocols) => {
                    if protocols.names.len() != 1 || self.selected_alpn_protocol.is_some() {
                        return Err(TlsError::illegal_parameter(
                            "Expected exactly one ALPN selection",
                        ));
                    }

                    if !self.options.alpn_ids.contains(&protocols.names[0]) {
                        return Err(TlsError::illegal_parameter(
                            "Server selected an ALPN id we did not offer",
                        ));
                    }

                    self.selected_alpn_protocol = Some(protocols.names[0].clone());
                }
                Extension::Heartbeat(mode) => {
                    self.peer_accepts_heartbeats =
                        *mode == HeartbeatMode::peer_allowed_to_send;
                }
                Extension::RecordSizeLimit(limit) => {
                    self.executor
                        .writer
                        .set_max_fragment_size(*limit as usize);
                }
                Extension::ServerName(v) => {
                    if v.is_some() {
                        return Err(TlsError::illegal_parameter(
                            "Server returned a non-empty server_name",
                        ));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn finish_stream(
        &mut self,
        protocol_version: ProtocolVersion,
        cipher_suite: CipherSuite,
        resumed: bool,
        hasher_factory: HasherFactory,
    ) -> ApplicationStream {
        let summary = HandshakeSummary {
            protocol_version,
            cipher_suite,
            selected_alpn_protocol: self.selected_alpn_protocol.clone(),
            peer_certificates: self.session.server_cert_chain.clone(),
            resumed,
            peer_accepts_heartbeats: self.peer_accepts_heartbeats,
        };

        let session = std::mem::take(&mut self.session);

        if let Some(cache) = &self.options.session_cache {
            if !self.options.hostname.is_empty() && session.valid() {
                cache.put(self.options.hostname.as_bytes(), session.clone());
            }
        }

        // Dummy reader/writer swap to move ownership out of the executor.
        let reader = std::mem::replace(
            &mut self.executor.reader,
            RecordReader::new(Box::new(crate::record_stream::ClosedTransport), false),
        );
        let writer = std::mem::replace(
            &mut self.executor.writer,
            RecordWriter::new(Box::new(crate::record_stream::ClosedTransport), false),
        );

        ApplicationStream::new(
            reader,
            writer,
            summary,
            session,
            self.options.session_cache.clone(),
            Bytes::from(self.options.hostname.clone().into_bytes()),
            false,
            Some(hasher_factory),
        )
    }
}

