use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{debug, warn};

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
use crate::options::ServerOptions;
use crate::provider::HasherFactory;
use crate::psk::*;
use crate::record::*;
use crate::record_stream::{RecordReader, RecordWriter};
use crate::session::{Session, SessionCache};

pub struct Server {
    options: ServerOptions,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self { options }
    }

    pub async fn accept(
        &self,
        reader: StreamReader,
        writer: StreamWriter,
    ) -> Result<ApplicationStream> {
        self.options.settings.validate()?;

        let mut exec = ServerHandshakeExecutor::new(reader, writer, &self.options);
        match exec.run().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                exec.session.resumable = false;
                Err(exec.executor.fail(e).await)
            }
        }
    }
}

struct ServerHandshakeExecutor<'a> {
    executor: HandshakeExecutor,
    options: &'a ServerOptions,

    session: Session,
    selected_alpn_protocol: Option<Bytes>,
    peer_accepts_heartbeats: bool,
}

impl<'a> ServerHandshakeExecutor<'a> {
    fn new(
        reader: StreamReader,
        writer: StreamWriter,
        options: &'a ServerOptions,
    ) -> ServerHandshakeExecutor<'a> {
        ServerHandshakeExecutor {
            executor: HandshakeExecutor::new(
                RecordReader::new(reader, true),
                RecordWriter::new(writer, true),
                true,
            ),
            options,
            session: Session::default(),
            selected_alpn_protocol: None,
            peer_accepts_heartbeats: false,
        }
    }

    fn rng(&self) -> &dyn crate::provider::SecureRandom {
        self.options.provider.random()
    }

    async fn run(&mut self) -> Result<ApplicationStream> {
        let client_hello = match self.executor.receive_handshake_message().await? {
            Handshake::ClientHello(v) => v,
            other => {
                return Err(TlsError::unexpected_message(format!(
                    "Expected ClientHello, got {:?}",
                    other.typ()
                )));
            }
        };

        if !client_hello.legacy_compression_methods.contains(&0) {
            return Err(TlsError::illegal_parameter(
                "Client does not offer null compression",
            ));
        }

        let version = self.negotiate_version(&client_hello)?;

        // RFC 7507: a fallback probe below our best version means someone
        // downgraded the client.
        if client_hello
            .cipher_suites
            .contains(&CipherSuite::TLS_FALLBACK_SCSV)
            && version < self.options.settings.max_version
        {
            return Err(TlsError::local(
                ErrorKind::InsufficientSecurity,
                AlertDescription::inappropriate_fallback,
                "Client signaled a version fallback",
            ));
        }

        if version == TLS_1_3_VERSION {
            self.executor.reader.protocol_version = TLS_1_3_VERSION;
            self.executor.writer.protocol_version = TLS_1_3_VERSION;
            self.run_tls13(client_hello).await
        } else {
            self.executor.reader.protocol_version = TLS_1_2_VERSION;
            self.executor.writer.protocol_version = TLS_1_2_VERSION;
            self.run_tls12(client_hello).await
        }
    }

    fn negotiate_version(&self, client_hello: &ClientHello) -> Result<ProtocolVersion> {
        let settings = &self.options.settings;

        if let Some(sv) = find_supported_versions_ch(&client_hello.extensions) {
            // Highest mutually supported version wins.
            let mut best = None;
            for v in &sv.versions {
                if *v >= settings.min_version && *v <= settings.max_version {
                    best = Some(best.map_or(*v, |b: u16| b.max(*v)));
                }
            }

            return best.ok_or_else(|| {
                TlsError::protocol_version("No mutually supported protocol version")
            });
        }

        // Legacy negotiation: meet at the highest version at or below the
        // client's claim.
        let v = client_hello.legacy_version.min(TLS_1_2_VERSION);
        if v < settings.min_version || !settings.supports_tls12() {
            return Err(TlsError::protocol_version(
                "Client version below our minimum",
            ));
        }

        Ok(TLS_1_2_VERSION)
    }

    ////////////////////////////////////////////////////////////////////////
    // TLS 1.3
    ////////////////////////////////////////////////////////////////////////

    async fn run_tls13(&mut self, first_hello: ClientHello) -> Result<ApplicationStream> {
        let settings = &self.options.settings;

        // Groups we are willing to do a (EC)DHE exchange on.
        let our_groups: Vec<NamedGroup> = settings
            .key_shares
            .iter()
            .chain(settings.ecc_curves.iter())
            .chain(settings.dh_groups.iter())
            .copied()
            .collect();

        let mut client_hello = first_hello;
        let mut retried = false;

        // Key share negotiation, possibly via one HelloRetryRequest.
        let client_share = loop {
            let share = find_key_share_ch(&client_hello.extensions).and_then(|ks| {
                ks.client_shares
                    .iter()
                    .find(|s| our_groups.contains(&s.group))
                    .cloned()
            });

            if let Some(share) = share {
                break Some(share);
            }

            // No usable share. If the client at least supports one of our
            // groups, ask it to retry with that group.
            let retry_group = find_supported_groups(&client_hello.extensions)
                .and_then(|groups| {
                    our_groups
                        .iter()
                        .find(|g| groups.groups.contains(g))
                        .copied()
                });

            let retry_group = match retry_group {
                Some(g) => g,
                None => {
                    // PSK-only key establishment is still possible if the
                    // client allows psk_ke.
                    break None;
                }
            };

            if retried {
                return Err(TlsError::handshake_failure(
                    "Client ignored our HelloRetryRequest",
                ));
            }
            retried = true;

            client_hello = self.send_hello_retry(&client_hello, retry_group).await?;
        };

        // Cipher suite selection, preferring one whose PRF hash can also
        // serve an offered PSK.
        let offered_psks = find_pre_shared_key_ch(&client_hello.extensions).cloned();
        let cipher_suite = self.select_tls13_cipher_suite(&client_hello, offered_psks.as_ref())?;

        let parts = match cipher_suite.decode(self.options.provider.as_ref())? {
            CipherSuiteParts::Tls13(v) => v,
            _ => return Err(TlsError::internal("Suite is not TLS 1.3")),
        };
        let hasher_factory = parts.hasher_factory.clone();
        let hkdf = Hkdf::new(hasher_factory.clone());

        // PSK selection + binder verification.
        let psk_modes = find_psk_modes(&client_hello.extensions);
        let selected_psk = match &offered_psks {
            Some(offered) if psk_modes.is_some() => {
                self.select_psk(offered, cipher_suite, &hasher_factory)?
            }
            _ => None,
        };

        // psk_ke drops the (EC)DHE share entirely; psk_dhe_ke and the
        // certificate path both require one.
        let use_dhe = match (&selected_psk, psk_modes) {
            (Some(_), Some(modes)) => {
                if modes.modes.contains(&PskKeyExchangeMode::psk_dhe_ke) && client_share.is_some()
                {
                    true
                } else if modes.modes.contains(&PskKeyExchangeMode::psk_ke) {
                    false
                } else {
                    true
                }
            }
            _ => true,
        };

        if use_dhe && client_share.is_none() {
            return Err(TlsError::handshake_failure(
                "No usable key share and no psk_ke fallback",
            ));
        }

        // Build the ServerHello.
        let mut random = vec![0u8; 32];
        self.rng().fill(&mut random);

        let mut extensions = vec![Extension::SupportedVersionsServerHello(
            SupportedVersionsServerHello {
                selected_version: TLS_1_3_VERSION,
            },
        )];

        let shared_secret = if use_dhe {
            let share = client_share.as_ref().unwrap();
            let (server_share, shared) = server_process_key_share(
                share.group,
                self.options.provider.as_ref(),
                self.rng(),
                &share.key_exchange,
            )?;

            extensions.push(Extension::KeyShareServerHello(KeyShareServerHello {
                server_share: KeyShareEntry {
                    group: share.group,
                    key_exchange: server_share,
                },
            }));

            shared
        } else {
            vec![0u8; hkdf.hash_size()]
        };

        if let Some((index, _)) = &selected_psk {
            extensions.push(Extension::PreSharedKeyServerHello(*index as u16));
        }

        let server_hello = ServerHello {
            legacy_version: TLS_1_2_VERSION,
            random: random.into(),
            legacy_session_id_echo: client_hello.legacy_session_id.clone(),
            cipher_suite,
            legacy_compression_method: 0,
            extensions,
        };

        self.executor
            .send_handshake_message(Handshake::ServerHello(server_hello))
            .await?;

        // Middlebox compatibility CCS.
        self.executor.writer.send_change_cipher_spec().await?;

        // Key schedule up to the handshake traffic keys.
        let mut key_schedule = KeySchedule::new(hkdf.clone(), hasher_factory.clone());
        key_schedule.early_secret(selected_psk.as_ref().map(|(_, psk)| psk.as_slice()));
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
        self.executor.writer.set_pending_state(server_spec);
        self.executor.writer.change_write_state()?;
        self.executor.reader.set_pending_state(client_spec);
        self.executor.reader.change_read_state()?;

        // EncryptedExtensions.
        let mut encrypted_extensions = vec![];

        if let Some(name_list) = find_alpn(&client_hello.extensions) {
            for name in &name_list.names {
                if self.options.alpn_ids.contains(name) {
                    self.selected_alpn_protocol = Some(name.clone());
                    encrypted_extensions.push(Extension::ALPN(ProtocolNameList {
                        names: vec![name.clone()],
                    }));
                    break;
                }
            }
        }

        if find_heartbeat_mode(&client_hello.extensions).is_some()
            && self.options.settings.use_heartbeat_extension
        {
            self.peer_accepts_heartbeats = true;
            encrypted_extensions.push(Extension::Heartbeat(HeartbeatMode::peer_allowed_to_send));
        }

        if let Some(limit) = find_record_size_limit(&client_hello.extensions) {
            self.executor.writer.set_max_fragment_size(*limit as usize);
            if self.options.settings.record_size_limit > 0 {
                encrypted_extensions.push(Extension::RecordSizeLimit(
                    self.options.settings.record_size_limit,
                ));
            }
        }

        self.executor
            .send_handshake_message(Handshake::EncryptedExtensions(EncryptedExtensions {
                extensions: encrypted_extensions,
            }))
            .await?;

        // Certificate authentication is skipped entirely on a PSK
        // handshake.
        let client_signature_schemes = find_signature_algorithms(&client_hello.extensions)
            .map(|l| l.algorithms.clone())
            .unwrap_or_default();

        let mut requested_client_cert = false;
        if selected_psk.is_none() {
            if client_signature_schemes.is_empty() {
                return Err(TlsError::local(
                    ErrorKind::HandshakeFailure,
                    AlertDescription::missing_extension,
                    "ClientHello without signature_algorithms",
                ));
            }

            let auth = self.options.certificate_auth.clone().ok_or_else(|| {
                TlsError::handshake_failure("No server certificate configured")
            })?;

            if self.options.request_client_certificate {
                requested_client_cert = true;
                self.executor
                    .send_handshake_message(Handshake::CertificateRequest(CertificateRequest {
                        certificate_request_context: Bytes::new(),
                        extensions: vec![Extension::SignatureAlgorithms(SignatureSchemeList {
                            algorithms: self.options.settings.supported_signature_schemes(),
                        })],
                    }))
                    .await?;
            }

            let certificate = Certificate {
                certificate_request_context: Bytes::new(),
                certificate_list: auth
                    .chain
                    .iter()
                    .map(|cert| CertificateEntry {
                        cert: cert.clone(),
                        extensions: vec![],
                    })
                    .collect(),
            };
            self.executor
                .send_handshake_message(Handshake::Certificate(certificate))
                .await?;

            let cert_verify = self.executor.create_certificate_verify(
                &hasher_factory,
                &self.options.settings.supported_signature_schemes(),
                &client_signature_schemes,
                auth.private_key.as_ref(),
            )?;
            self.executor
                .send_handshake_message(Handshake::CertificateVerify(cert_verify))
                .await?;
        }

        let verify_data_server =
            key_schedule.verify_data_server(&self.executor.handshake_transcript);
        self.executor.send_finished(verify_data_server).await?;

        // Application secrets cover through the server Finished. The write
        // side flips immediately; the read side stays on handshake keys
        // until the client's Finished arrives.
        let app_secrets = key_schedule.application_secrets(&self.executor.handshake_transcript);
        let (client_app, server_app) = calc_tls13_pending_state(
            cipher_suite,
            self.options.provider.as_ref(),
            app_secrets.client_application_traffic_secret_0.clone(),
            app_secrets.server_application_traffic_secret_0.clone(),
        )?;
        self.executor.writer.set_pending_state(server_app);
        self.executor.writer.change_write_state()?;

        // Client authentication flight.
        if requested_client_cert {
            let certificate = match self.executor.receive_handshake_message().await? {
                Handshake::Certificate(c) => c,
                other => {
                    return Err(TlsError::unexpected_message(format!(
                        "Expected client Certificate, got {:?}",
                        other.typ()
                    )));
                }
            };

            if !certificate.certificate_list.is_empty() {
                self.session.client_cert_chain = certificate
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
        }

        let verify_data_client =
            key_schedule.verify_data_client(&self.executor.handshake_transcript);
        self.executor.receive_finished(&verify_data_client).await?;

        self.executor.reader.set_pending_state(client_app);
        self.executor.reader.change_read_state()?;

        let resumption_master_secret =
            key_schedule.resumption_master_secret(&self.executor.handshake_transcript);

        self.session.cipher_suite = Some(cipher_suite);
        self.session.resumption_master_secret = resumption_master_secret.clone();
        self.session.cl_app_secret = app_secrets.client_application_traffic_secret_0;
        self.session.sr_app_secret = app_secrets.server_application_traffic_secret_0;
        self.session.app_proto = self.selected_alpn_protocol.clone();
        self.session.resumable = true;

        debug!("TLS 1.3 handshake complete ({:?})", cipher_suite);

        // Hand out resumption tickets.
        self.send_session_tickets(cipher_suite, &resumption_master_secret, &hkdf)
            .await?;

        Ok(self.finish_stream(
            TLS_1_3_VERSION,
            cipher_suite,
            selected_psk.is_some(),
            hasher_factory,
        ))
    }

    async fn send_hello_retry(
        &mut self,
        client_hello: &ClientHello,
        retry_group: NamedGroup,
    ) -> Result<ClientHello> {
        // Pick any 1.3 suite for the retry; it must not change afterwards,
        // so use the real selection logic.
        let cipher_suite = self.select_tls13_cipher_suite(client_hello, None)?;

        // ClientHello1 participates in the transcript only as its hash.
        let factory = self
            .options
            .provider
            .hasher_factory(cipher_suite.prf_hash())?;
        self.executor.handshake_transcript.condense_for_retry(&factory);

        let retry = ServerHello {
            legacy_version: TLS_1_2_VERSION,
            random: Bytes::from(HELLO_RETRY_REQUEST_RANDOM.to_vec()),
            legacy_session_id_echo: client_hello.legacy_session_id.clone(),
            cipher_suite,
            legacy_compression_method: 0,
            extensions: vec![
                Extension::SupportedVersionsServerHello(SupportedVersionsServerHello {
                    selected_version: TLS_1_3_VERSION,
                }),
                Extension::KeyShareHelloRetryRequest(KeyShareHelloRetryRequest {
                    selected_group: retry_group,
                }),
            ],
        };

        debug!("sending HelloRetryRequest for {:?}", retry_group);

        self.executor
            .send_handshake_message(Handshake::ServerHello(retry))
            .await?;
        self.executor.writer.send_change_cipher_spec().await?;

        let second = match self.executor.receive_handshake_message().await? {
            Handshake::ClientHello(v) => v,
            other => {
                return Err(TlsError::unexpected_message(format!(
                    "Expected the second ClientHello, got {:?}",
                    other.typ()
                )));
            }
        };

        // The retried hello must keep its cipher suites stable.
        if second.cipher_suites != client_hello.cipher_suites {
            return Err(TlsError::illegal_parameter(
                "cipher_suites changed between ClientHellos",
            ));
        }

        Ok(second)
    }

    fn select_tls13_cipher_suite(
        &self,
        client_hello: &ClientHello,
        offered_psks: Option<&OfferedPsks>,
    ) -> Result<CipherSuite> {
        let ours = self.options.settings.effective_cipher_suites();

        // With PSKs on the table, a suite whose PRF hash matches an offered
        // PSK keeps the resumption alive.
        if let Some(offered) = offered_psks {
            let usable_hashes: Vec<_> = self
                .offered_psk_hashes(offered)
                .into_iter()
                .collect();

            for suite in &client_hello.cipher_suites {
                if suite.is_tls13()
                    && ours.contains(suite)
                    && usable_hashes.contains(&suite.prf_hash())
                {
                    return Ok(*suite);
                }
            }
        }

        for suite in &client_hello.cipher_suites {
            if suite.is_tls13() && ours.contains(suite) {
                return Ok(*suite);
            }
        }

        Err(TlsError::handshake_failure(
            "No mutually supported TLS 1.3 cipher suite",
        ))
    }

    /// Hashes of the PSKs we could actually accept (unsealable tickets and
    /// known external identities).
    fn offered_psk_hashes(&self, offered: &OfferedPsks) -> Vec<crate::provider::HashAlgorithm> {
        let mut out = vec![];

        for identity in &offered.identities {
            for config in &self.options.settings.psk_configs {
                if config.identity == identity.identity {
                    out.push(config.hash);
                }
            }

            if let Some(plaintext) = unseal_ticket(
                self.options.provider.as_ref(),
                &self.options.settings.ticket_keys,
                &identity.identity,
            ) {
                if let Ok(state) = TicketStateTls13::parse(&plaintext) {
                    out.push(state.cipher_suite.prf_hash());
                }
            }
        }

        out
    }

    /// Walks the offered identities and returns the first acceptable PSK,
    /// with its binder verified.
    fn select_psk(
        &mut self,
        offered: &OfferedPsks,
        cipher_suite: CipherSuite,
        hasher_factory: &HasherFactory,
    ) -> Result<Option<(usize, Vec<u8>)>> {
        let now = SystemTime::now();

        // The transcript currently ends with the ClientHello carrying the
        // binders.
        let mut transcript_before_ch = self.executor.handshake_transcript.copy();
        let ch_bytes = transcript_before_ch
            .pop_last()
            .ok_or_else(|| TlsError::internal("Empty transcript"))?;

        for (index, identity) in offered.identities.iter().enumerate() {
            // External PSKs.
            for config in &self.options.settings.psk_configs {
                if config.identity != identity.identity {
                    continue;
                }
                if config.hash != cipher_suite.prf_hash() {
                    continue;
                }

                let params = BinderParams {
                    secret: config.secret.to_vec(),
                    kind: PskKind::External,
                    hasher_factory: hasher_factory.clone(),
                };
                verify_binder(&params, &transcript_before_ch, &ch_bytes, offered, index)?;

                debug!("accepted external PSK at index {}", index);
                return Ok(Some((index, config.secret.to_vec())));
            }

            // Resumption tickets.
            let plaintext = match unseal_ticket(
                self.options.provider.as_ref(),
                &self.options.settings.ticket_keys,
                &identity.identity,
            ) {
                Some(v) => v,
                None => continue,
            };

            let state = match TicketStateTls13::parse(&plaintext) {
                Ok(v) => v,
                Err(_) => continue,
            };

            if state.expired(now) || state.cipher_suite.prf_hash() != cipher_suite.prf_hash() {
                warn!("declining stale or mismatched ticket at index {}", index);
                continue;
            }

            let params = BinderParams {
                secret: state.psk.to_vec(),
                kind: PskKind::Resumption,
                hasher_factory: hasher_factory.clone(),
            };
            verify_binder(&params, &transcript_before_ch, &ch_bytes, offered, index)?;

            debug!("accepted resumption PSK at index {}", index);
            return Ok(Some((index, state.psk.to_vec())));
        }

        Ok(None)
    }

    async fn send_session_tickets(
        &mut self,
        cipher_suite: CipherSuite,
        resumption_master_secret: &[u8],
        hkdf: &Hkdf,
    ) -> Result<()> {
        if self.options.settings.ticket_keys.is_empty() {
            return Ok(());
        }

        let lifetime = self.options.settings.ticket_lifetime;
        let created_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        for i in 0..self.options.settings.ticket_count {
            let nonce = vec![i as u8];
            let psk = resumption_psk(hkdf, resumption_master_secret, &nonce);

            let mut age_add = [0u8; 4];
            self.rng().fill(&mut age_add);
            let age_add = u32::from_be_bytes(age_add);

            let state = TicketStateTls13 {
                psk: psk.into(),
                cipher_suite,
                age_add,
                lifetime,
                created_unix,
            };

            let mut plaintext = vec![];
            state.serialize(&mut plaintext);

            let sealed = seal_ticket(
                self.options.provider.as_ref(),
                &self.options.settings.ticket_keys[0],
                &plaintext,
                self.rng(),
            )?;

            // Post-handshake: not part of the transcript.
            self.executor
                .writer
                .send_handshake(
                    Handshake::NewSessionTicket(NewSessionTicket {
                        ticket_lifetime: lifetime,
                        ticket_age_add: age_add,
                        ticket_nonce: nonce.into(),
                        ticket: sealed,
                        extensions: vec![],
                    }),
                    None,
                )
                .await?;
        }

        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // TLS 1.2
    ////////////////////////////////////////////////////////////////////////

    async fn run_tls12(&mut self, client_hello: ClientHello) -> Result<ApplicationStream> {
        let settings = &self.options.settings;

        let ems = settings.use_extended_master_secret
            && has_extended_master_secret(&client_hello.extensions);

        if settings.require_extended_master_secret && !ems {
            return Err(TlsError::handshake_failure(
                "Client refused extended_master_secret",
            ));
        }

        // A previous session offered through a ticket or the session id.
        let resumption = self.find_tls12_resumption(&client_hello, ems);

        let cipher_suite = match &resumption {
            Some((_, session)) => session.cipher_suite.unwrap(),
            None => self.select_tls12_cipher_suite(&client_hello)?,
        };

        let etm = settings.use_encrypt_then_mac
            && has_encrypt_then_mac(&client_hello.extensions)
            && cipher_suite.bulk_cipher().is_block();

        let tickets_enabled = !settings.ticket_keys.is_empty()
            && find_session_ticket(&client_hello.extensions).is_some();

        // Negotiated ServerHello extensions.
        let mut extensions = vec![];
        if ems {
            extensions.push(Extension::ExtendedMasterSecret);
        }
        if etm {
            extensions.push(Extension::EncryptThenMac);
        }
        if tickets_enabled {
            extensions.push(Extension::SessionTicket(Bytes::new()));
        }
        if client_hello
            .cipher_suites
            .contains(&CipherSuite::TLS_EMPTY_RENEGOTIATION_INFO_SCSV)
            || has_extension(&client_hello.extensions, ExtensionType::RenegotiationInfo)
        {
            extensions.push(Extension::RenegotiationInfo(Bytes::new()));
        }

        if let Some(name_list) = find_alpn(&client_hello.extensions) {
            for name in &name_list.names {
                if self.options.alpn_ids.contains(name) {
                    self.selected_alpn_protocol = Some(name.clone());
                    extensions.push(Extension::ALPN(ProtocolNameList {
                        names: vec![name.clone()],
                    }));
                    break;
                }
            }
        }

        if find_heartbeat_mode(&client_hello.extensions).is_some()
            && settings.use_heartbeat_extension
        {
            self.peer_accepts_heartbeats = true;
            extensions.push(Extension::Heartbeat(HeartbeatMode::peer_allowed_to_send));
        }

        if let Some(limit) = find_record_size_limit(&client_hello.extensions) {
            self.executor.writer.set_max_fragment_size(*limit as usize);
            if settings.record_size_limit > 0 {
                extensions.push(Extension::RecordSizeLimit(settings.record_size_limit));
            }
        }

        let send_ocsp = self.options.ocsp_response.is_some()
            && has_status_request(&client_hello.extensions);
        if send_ocsp {
            extensions.push(Extension::StatusRequest(None));
        }

        if let Some((session_id, session)) = resumption {
            let server_hello = ServerHello {
                legacy_version: TLS_1_2_VERSION,
                random: self.fresh_random(),
                legacy_session_id_echo: session_id,
                cipher_suite,
                legacy_compression_method: 0,
                extensions,
            };

            return self
                .finish_tls12_resumption(&client_hello, server_hello, session, etm, tickets_enabled)
                .await;
        }

        // Full handshake: a fresh session id (when a cache exists) lets the
        // client resume later.
        let session_id = if self.options.session_cache.is_some() {
            let mut id = vec![0u8; 32];
            self.rng().fill(&mut id);
            Bytes::from(id)
        } else {
            Bytes::new()
        };

        let server_hello = ServerHello {
            legacy_version: TLS_1_2_VERSION,
            random: self.fresh_random(),
            legacy_session_id_echo: session_id.clone(),
            cipher_suite,
            legacy_compression_method: 0,
            extensions,
        };

        self.run_tls12_full(
            client_hello,
            server_hello,
            ems,
            etm,
            tickets_enabled,
            send_ocsp,
        )
        .await
    }

    fn fresh_random(&self) -> Bytes {
        let mut random = vec![0u8; 32];
        self.rng().fill(&mut random);
        random.into()
    }

    /// Finds a resumable prior session offered by the client: a sealed
    /// ticket takes priority over a cached session id. RFC 7627 forbids
    /// resuming across a change in EMS status.
    fn find_tls12_resumption(
        &self,
        client_hello: &ClientHello,
        ems_negotiated: bool,
    ) -> Option<(Bytes, Session)> {
        let now = SystemTime::now();

        if let Some(ticket) = find_session_ticket(&client_hello.extensions) {
            if !ticket.is_empty() {
                if let Some(plaintext) = unseal_ticket(
                    self.options.provider.as_ref(),
                    &self.options.settings.ticket_keys,
                    ticket,
                ) {
                    if let Ok(state) = TicketStateTls12::parse(&plaintext) {
                        if !state.expired(now) {
                            if let Ok(session) = Session::parse(state.session_blob.clone()) {
                                if session.valid()
                                    && session.extended_master_secret == ems_negotiated
                                    && self.tls12_session_suite_acceptable(&session, client_hello)
                                {
                                    debug!("resuming TLS 1.2 session from a ticket");
                                    return Some((
                                        client_hello.legacy_session_id.clone(),
                                        session,
                                    ));
                                }
                            }
                        }
                    }
                }

                warn!("declining offered session ticket");
            }
        }

        if client_hello.legacy_session_id.is_empty() {
            return None;
        }

        let cache = self.options.session_cache.as_ref()?;
        let session = cache.get(&client_hello.legacy_session_id)?;

        if !session.valid() || session.master_secret.is_empty() {
            return None;
        }

        // An EMS mismatch forces a fresh handshake rather than a broken
        // resumption.
        if session.extended_master_secret != ems_negotiated {
            warn!("declining resumption: extended_master_secret mismatch");
            return None;
        }

        if !self.tls12_session_suite_acceptable(&session, client_hello) {
            return None;
        }

        debug!("resuming TLS 1.2 session by id");
        Some((client_hello.legacy_session_id.clone(), session))
    }

    fn tls12_session_suite_acceptable(
        &self,
        session: &Session,
        client_hello: &ClientHello,
    ) -> bool {
        match session.cipher_suite {
            Some(suite) => {
                client_hello.cipher_suites.contains(&suite)
                    && self
                        .options
                        .settings
                        .effective_cipher_suites()
                        .contains(&suite)
            }
            None => false,
        }
    }

    fn select_tls12_cipher_suite(&self, client_hello: &ClientHello) -> Result<CipherSuite> {
        let ours = self.options.settings.effective_cipher_suites();

        let cert_key_type = self
            .options
            .certificate_auth
            .as_ref()
            .map(|a| a.private_key.key_type());

        let srp_available = self.options.srp_database.is_some()
            && find_srp_username(&client_hello.extensions).is_some();

        for suite in &client_hello.cipher_suites {
            if !ours.contains(suite) || !suite.usable_with_version(TLS_1_2_VERSION) {
                continue;
            }

            let kx = suite.key_exchange();

            // The suite's authentication must match the key we hold.
            match kx.certificate_key_type() {
                Some(required) => {
                    if cert_key_type != Some(required) {
                        continue;
                    }
                }
                None => {
                    if matches!(kx, KeyExchangeAlgorithm::SrpSha) && !srp_available {
                        continue;
                    }
                }
            }

            if matches!(
                kx,
                KeyExchangeAlgorithm::SrpSha | KeyExchangeAlgorithm::SrpShaRsa
            ) && !srp_available
            {
                continue;
            }

            return Ok(*suite);
        }

        Err(TlsError::handshake_failure(
            "No mutually supported cipher suite",
        ))
    }

    async fn finish_tls12_resumption(
        &mut self,
        client_hello: &ClientHello,
        server_hello: ServerHello,
        session: Session,
        etm: bool,
        tickets_enabled: bool,
    ) -> Result<ApplicationStream> {
        let cipher_suite = server_hello.cipher_suite;
        let prf_factory = self
            .options
            .provider
            .hasher_factory(cipher_suite.prf_hash())?;

        let server_random = server_hello.random.clone();
        let session_id = server_hello.legacy_session_id_echo.clone();

        self.executor
            .send_handshake_message(Handshake::ServerHello(server_hello))
            .await?;

        let key_schedule =
            KeyScheduleTls12::new(prf_factory.clone(), session.master_secret.to_vec());

        let states = calc_pending_states(
            cipher_suite,
            self.options.provider.clone(),
            session.master_secret.as_ref(),
            &client_hello.random,
            &server_random,
            TLS_1_2_VERSION,
            etm,
            false,
        )?;
        self.executor.reader.set_pending_state(states.client_write);
        self.executor.writer.set_pending_state(states.server_write);

        // Refresh the ticket on resumption when the client supports them.
        if tickets_enabled {
            self.send_tls12_ticket(&session).await?;
        }

        self.executor.writer.send_change_cipher_spec().await?;
        self.executor.writer.change_write_state()?;

        let verify_data_server =
            key_schedule.verify_data_server(&self.executor.handshake_transcript);
        self.executor
            .send_finished(verify_data_server.into())
            .await?;

        self.executor.receive_change_cipher_spec().await?;
        self.executor.reader.change_read_state()?;

        let verify_data_client =
            key_schedule.verify_data_client(&self.executor.handshake_transcript);
        self.executor.receive_finished(&verify_data_client).await?;

        self.session = Session {
            session_id,
            app_proto: self.selected_alpn_protocol.clone(),
            resumable: true,
            ..session
        };

        debug!("TLS 1.2 abbreviated handshake complete ({:?})", cipher_suite);

        Ok(self.finish_stream(TLS_1_2_VERSION, cipher_suite, true, prf_factory))
    }

    async fn run_tls12_full(
        &mut self,
        client_hello: ClientHello,
        server_hello: ServerHello,
        ems: bool,
        etm: bool,
        tickets_enabled: bool,
        send_ocsp: bool,
    ) -> Result<ApplicationStream> {
        let cipher_suite = server_hello.cipher_suite;
        let kx_algorithm = cipher_suite.key_exchange();
        let settings = &self.options.settings;

        let prf_factory = self
            .options
            .provider
            .hasher_factory(cipher_suite.prf_hash())?;

        let server_random = server_hello.random.clone();
        let session_id = server_hello.legacy_session_id_echo.clone();

        self.executor
            .send_handshake_message(Handshake::ServerHello(server_hello))
            .await?;

        // Certificate.
        let auth = self.options.certificate_auth.clone();
        let needs_certificate =
            !kx_algorithm.is_anonymous() && kx_algorithm != KeyExchangeAlgorithm::SrpSha;

        if needs_certificate {
            let auth = auth
                .as_ref()
                .ok_or_else(|| TlsError::handshake_failure("No certificate configured"))?;

            let cert_msg = Certificate {
                certificate_request_context: Bytes::new(),
                certificate_list: auth
                    .chain
                    .iter()
                    .map(|c| CertificateEntry {
                        cert: c.clone(),
                        extensions: vec![],
                    })
                    .collect(),
            };

            let raw = serialize_certificate_message(&cert_msg, TLS_1_2_VERSION);
            self.executor.send_raw_handshake(raw).await?;

            if send_ocsp {
                self.executor
                    .send_handshake_message(Handshake::CertificateStatus(CertificateStatus {
                        status_type: CertificateStatusType::ocsp,
                        response: self.options.ocsp_response.clone().unwrap(),
                    }))
                    .await?;
            }
        }

        // ServerKeyExchange, signed where the method is authenticated.
        let client_schemes = find_signature_algorithms(&client_hello.extensions)
            .map(|l| l.algorithms.clone());

        let mut dhe_kx: Option<DheKeyExchange> = None;
        let mut ecdhe_kx: Option<EcdheKeyExchange> = None;
        let mut srp_kx: Option<SrpKeyExchange> = None;

        let skx_params: Option<Vec<u8>> = match kx_algorithm {
            KeyExchangeAlgorithm::Rsa => None,
            KeyExchangeAlgorithm::DheRsa | KeyExchangeAlgorithm::DhAnon => {
                let client_groups =
                    find_supported_groups(&client_hello.extensions).map(|l| l.groups.clone());
                let group =
                    DheKeyExchange::select_group(client_groups.as_deref(), &settings.dh_groups);

                let mut kx = DheKeyExchange::new(settings.min_key_size, settings.max_key_size);
                let params = kx.make_server_key_exchange(group, self.rng())?;
                dhe_kx = Some(kx);

                let mut raw = vec![];
                params.serialize(&mut raw);
                Some(raw)
            }
            KeyExchangeAlgorithm::EcdheRsa
            | KeyExchangeAlgorithm::EcdheEcdsa
            | KeyExchangeAlgorithm::EcdhAnon => {
                let client_groups =
                    find_supported_groups(&client_hello.extensions).map(|l| l.groups.clone());
                let curve = EcdheKeyExchange::select_curve(
                    client_groups.as_deref(),
                    &settings.ecc_curves,
                )
                .ok_or_else(|| {
                    TlsError::handshake_failure("No mutually supported curve")
                })?;

                let mut kx = EcdheKeyExchange::new(self.options.provider.clone());
                let params = kx.make_server_key_exchange(curve, self.rng())?;
                ecdhe_kx = Some(kx);

                let mut raw = vec![];
                params.serialize(&mut raw);
                Some(raw)
            }
            KeyExchangeAlgorithm::SrpSha | KeyExchangeAlgorithm::SrpShaRsa => {
                let username = find_srp_username(&client_hello.extensions)
                    .ok_or_else(|| TlsError::handshake_failure("Missing SRP username"))?;

                let verifier = self
                    .options
                    .srp_database
                    .as_ref()
                    .unwrap()
                    .lookup(username)
                    .ok_or_else(|| {
                        TlsError::local(
                            ErrorKind::UnknownPskIdentity,
                            AlertDescription::unknown_psk_identity,
                            "Unknown SRP username",
                        )
                    })?;

                let sha1 = self
                    .options
                    .provider
                    .hasher_factory(crate::provider::HashAlgorithm::Sha1)?;
                let mut kx =
                    SrpKeyExchange::new(sha1, settings.min_key_size, settings.max_key_size);
                let params = kx.make_server_key_exchange(&verifier, self.rng())?;
                srp_kx = Some(kx);

                let mut raw = vec![];
                params.serialize(&mut raw);
                Some(raw)
            }
            KeyExchangeAlgorithm::Tls13 => {
                return Err(TlsError::internal("TLS 1.3 suite in a 1.2 flow"))
            }
        };

        let needs_signature = matches!(
            kx_algorithm,
            KeyExchangeAlgorithm::DheRsa
                | KeyExchangeAlgorithm::EcdheRsa
                | KeyExchangeAlgorithm::EcdheEcdsa
                | KeyExchangeAlgorithm::SrpShaRsa
        );

        if let Some(params) = &skx_params {
            let mut body = params.clone();

            if needs_signature {
                let auth = auth
                    .as_ref()
                    .ok_or_else(|| TlsError::internal("Signing without a key"))?;

                let remote_schemes = client_schemes.clone().unwrap_or_else(|| {
                    HandshakeExecutor::default_signature_schemes(auth.private_key.key_type())
                });

                let scheme = HandshakeExecutor::select_signature_scheme(
                    &settings.supported_signature_schemes(),
                    &remote_schemes,
                    auth.private_key.as_ref(),
                    false,
                )?;

                let payload = server_key_exchange_payload(
                    &client_hello.random,
                    &server_random,
                    params,
                );
                let signature = auth.private_key.sign(scheme, &payload)?;

                CertificateVerify {
                    algorithm: scheme,
                    signature: signature.into(),
                }
                .serialize(&mut body);
            }

            self.executor
                .send_handshake_message(Handshake::ServerKeyExchange(ServerKeyExchange {
                    data: body.into(),
                }))
                .await?;
        }

        // CertificateRequest.
        let requested_client_cert = self.options.request_client_certificate && !kx_algorithm.is_anonymous();
        if requested_client_cert {
            self.executor
                .send_handshake_message(Handshake::CertificateRequestTls12(
                    CertificateRequestTls12 {
                        certificate_types: Bytes::from_static(&[
                            CLIENT_CERTIFICATE_TYPE_RSA_SIGN,
                            CLIENT_CERTIFICATE_TYPE_ECDSA_SIGN,
                        ]),
                        supported_signature_algorithms: settings.supported_signature_schemes(),
                        certificate_authorities: Bytes::new(),
                    },
                ))
                .await?;
        }

        self.executor
            .send_handshake_message(Handshake::ServerHelloDone)
            .await?;

        // Client flight: [Certificate,] ClientKeyExchange, [CertificateVerify,]
        // CCS, Finished.
        let mut client_cert_key = None;
        if requested_client_cert {
            let certificate = match self.executor.receive_handshake_message().await? {
                Handshake::Certificate(c) => c,
                other => {
                    return Err(TlsError::unexpected_message(format!(
                        "Expected client Certificate, got {:?}",
                        other.typ()
                    )));
                }
            };

            if !certificate.certificate_list.is_empty() {
                self.session.client_cert_chain = certificate
                    .certificate_list
                    .iter()
                    .map(|e| e.cert.clone())
                    .collect();
                client_cert_key = Some(
                    self.options
                        .provider
                        .certificate_public_key(&certificate.certificate_list[0].cert)?,
                );
            }
        }

        let client_kx = match self.executor.receive_handshake_message().await? {
            Handshake::ClientKeyExchange(v) => v,
            other => {
                return Err(TlsError::unexpected_message(format!(
                    "Expected ClientKeyExchange, got {:?}",
                    other.typ()
                )));
            }
        };

        let premaster = match kx_algorithm {
            KeyExchangeAlgorithm::Rsa => {
                let auth = auth
                    .as_ref()
                    .ok_or_else(|| TlsError::internal("RSA kx without a key"))?;

                let kx = RsaKeyExchange {
                    client_version: client_hello.legacy_version,
                    server_version: TLS_1_2_VERSION,
                };
                kx.process_client_key_exchange(
                    &client_kx.data,
                    auth.private_key.as_ref(),
                    self.rng(),
                )?
            }
            KeyExchangeAlgorithm::DheRsa | KeyExchangeAlgorithm::DhAnon => {
                dhe_kx.as_mut().unwrap().process_client_key_exchange(&client_kx.data)?
            }
            KeyExchangeAlgorithm::EcdheRsa
            | KeyExchangeAlgorithm::EcdheEcdsa
            | KeyExchangeAlgorithm::EcdhAnon => {
                ecdhe_kx.as_mut().unwrap().process_client_key_exchange(&client_kx.data)?
            }
            KeyExchangeAlgorithm::SrpSha | KeyExchangeAlgorithm::SrpShaRsa => {
                srp_kx.as_mut().unwrap().process_client_key_exchange(&client_kx.data)?
            }
            KeyExchangeAlgorithm::Tls13 => unreachable!(),
        };

        // Master secret. The EMS session hash covers through the
        // ClientKeyExchange just received.
        let master_secret_bytes = if ems {
            let session_hash = self.executor.handshake_transcript.hash(&prf_factory);
            extended_master_secret(&premaster, &session_hash, &prf_factory)
        } else {
            master_secret(
                &premaster,
                &client_hello.random,
                &server_random,
                &prf_factory,
            )
        };

        // CertificateVerify covers the transcript up to (excluding) itself.
        let cv_payload = self.executor.handshake_transcript.concat();

        if client_cert_key.is_some() {
            let cert_verify = match self.executor.receive_handshake_message().await? {
                Handshake::CertificateVerify(v) => v,
                other => {
                    return Err(TlsError::unexpected_message(format!(
                        "Expected CertificateVerify, got {:?}",
                        other.typ()
                    )));
                }
            };

            if !settings
                .supported_signature_schemes()
                .contains(&cert_verify.algorithm)
            {
                return Err(TlsError::illegal_parameter(
                    "CertificateVerify uses a non-advertised scheme",
                ));
            }

            self.executor.check_signature(
                &cv_payload,
                client_cert_key.as_ref().unwrap().as_ref(),
                &cert_verify,
            )?;
        }

        let key_schedule =
            KeyScheduleTls12::new(prf_factory.clone(), master_secret_bytes.clone());

        let states = calc_pending_states(
            cipher_suite,
            self.options.provider.clone(),
            &master_secret_bytes,
            &client_hello.random,
            &server_random,
            TLS_1_2_VERSION,
            etm,
            false,
        )?;
        self.executor.reader.set_pending_state(states.client_write);
        self.executor.writer.set_pending_state(states.server_write);

        self.executor.receive_change_cipher_spec().await?;
        self.executor.reader.change_read_state()?;

        let verify_data_client =
            key_schedule.verify_data_client(&self.executor.handshake_transcript);
        self.executor.receive_finished(&verify_data_client).await?;

        // Build the resumable session before issuing tickets over it.
        self.session.session_id = session_id.clone();
        self.session.cipher_suite = Some(cipher_suite);
        self.session.master_secret = master_secret_bytes.into();
        self.session.extended_master_secret = ems;
        self.session.encrypt_then_mac = etm;
        self.session.app_proto = self.selected_alpn_protocol.clone();
        self.session.server_cert_chain = auth
            .as_ref()
            .map(|a| a.chain.clone())
            .unwrap_or_default();
        self.session.resumable = true;

        if tickets_enabled {
            let session = self.session.clone();
            self.send_tls12_ticket(&session).await?;
        }

        self.executor.writer.send_change_cipher_spec().await?;
        self.executor.writer.change_write_state()?;

        let verify_data_server =
            key_schedule.verify_data_server(&self.executor.handshake_transcript);
        self.executor
            .send_finished(verify_data_server.into())
            .await?;

        if let Some(cache) = &self.options.session_cache {
            if !session_id.is_empty() {
                cache.put(&session_id, self.session.clone());
            }
        }

        debug!("TLS 1.2 handshake complete ({:?})", cipher_suite);

        Ok(self.finish_stream(TLS_1_2_VERSION, cipher_suite, false, prf_factory))
    }

    async fn send_tls12_ticket(&mut self, session: &Session) -> Result<()> {
        let mut blob = vec![];
        session.serialize(&mut blob);

        let state = TicketStateTls12 {
            session_blob: blob.into(),
            lifetime: self.options.settings.ticket_lifetime,
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };

        let mut plaintext = vec![];
        state.serialize(&mut plaintext);

        let sealed = seal_ticket(
            self.options.provider.as_ref(),
            &self.options.settings.ticket_keys[0],
            &plaintext,
            self.rng(),
        )?;

        self.executor
            .send_handshake_message(Handshake::NewSessionTicketTls12(NewSessionTicketTls12 {
                ticket_lifetime_hint: self.options.settings.ticket_lifetime,
                ticket: sealed,
            }))
            .await
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
            peer_certificates: self.session.client_cert_chain.clone(),
            resumed,
            peer_accepts_heartbeats: self.peer_accepts_heartbeats,
        };

        let session = std::mem::take(&mut self.session);
        let cache_key = session.session_id.clone();

        let reader = std::mem::replace(
            &mut self.executor.reader,
            RecordReader::new(Box::new(crate::record_stream::ClosedTransport), true),
        );
        let writer = std::mem::replace(
            &mut self.executor.writer,
            RecordWriter::new(Box::new(crate::record_stream::ClosedTransport), true),
        );

        ApplicationStream::new(
            reader,
            writer,
            summary,
            session,
            self.options.session_cache.clone(),
            cache_key,
            true,
            Some(hasher_factory),
        )
    }
}
