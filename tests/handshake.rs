// End-to-end handshakes: both endpoints of the engine talking to each other
// over in-memory pipes with the deterministic test provider.

mod common;

use std::sync::Arc;

use async_std::task;
use bytes::Bytes;

use common::{duplex, FakeKey, FakeProvider, MemorySessionCache};
use tls_engine::cipher_suite::CipherSuite;
use tls_engine::extensions::NamedGroup;
use tls_engine::options::{CertificateAuth, ClientOptions, PskConfig, ServerOptions};
use tls_engine::provider::{HashAlgorithm, KeyType};
use tls_engine::record::{TLS_1_2_VERSION, TLS_1_3_VERSION};
use tls_engine::session::{Session, SessionCache};
use tls_engine::{ApplicationStream, Client, Server};

fn server_options_with_rsa_cert(provider: Arc<FakeProvider>) -> ServerOptions {
    let key = FakeKey::new(b"server-rsa-key-seed", KeyType::Rsa);
    let mut options = ServerOptions::recommended(provider);
    options.certificate_auth = Some(CertificateAuth {
        chain: vec![key.certificate(), Bytes::from_static(b"\x01intermediate")],
        private_key: key,
    });
    options
}

fn client_options(provider: Arc<FakeProvider>) -> ClientOptions {
    let mut options = ClientOptions::recommended(provider);
    options.hostname = "test.example".into();
    options
}

/// Runs a full handshake over in-memory pipes and returns both streams.
fn connect(
    client: Client,
    server: Server,
) -> tls_engine::Result<(ApplicationStream, ApplicationStream)> {
    let ((cr, cw), (sr, sw)) = duplex();

    let server_task = task::spawn(async move { server.accept(sr, sw).await });

    task::block_on(async move {
        let client_stream = client.connect(cr, cw).await?;
        let server_stream = server_task.await?;
        Ok((client_stream, server_stream))
    })
}

/// One write+read in each direction.
fn exchange(client: &mut ApplicationStream, server: &mut ApplicationStream, payload: &[u8]) {
    task::block_on(async {
        client.write(payload).await.unwrap();

        let mut buf = vec![0u8; payload.len()];
        let mut read = 0;
        while read < buf.len() {
            read += server.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf[..], payload);

        server.write(payload).await.unwrap();

        let mut buf = vec![0u8; payload.len()];
        let mut read = 0;
        while read < buf.len() {
            read += client.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf[..], payload);
    });
}

#[test]
fn tls13_x25519_handshake() {
    let client = Client::new(client_options(FakeProvider::new(1)));
    let server = Server::new(server_options_with_rsa_cert(FakeProvider::new(2)));

    let (mut cs, mut ss) = connect(client, server).unwrap();

    assert_eq!(cs.summary().protocol_version, TLS_1_3_VERSION);
    assert_eq!(ss.summary().protocol_version, TLS_1_3_VERSION);
    assert_eq!(
        cs.summary().cipher_suite,
        CipherSuite::TLS_AES_128_GCM_SHA256
    );
    assert!(!cs.summary().resumed);
    assert_eq!(cs.summary().peer_certificates.len(), 2);

    exchange(&mut cs, &mut ss, b"hello\n");
}

#[test]
fn tls13_hello_retry_request() {
    let mut client_opts = client_options(FakeProvider::new(3));
    client_opts.settings.key_shares = vec![NamedGroup::x25519];
    client_opts.settings.ecc_curves = vec![NamedGroup::x25519, NamedGroup::secp256r1];

    let mut server_opts = server_options_with_rsa_cert(FakeProvider::new(4));
    server_opts.settings.key_shares = vec![NamedGroup::secp256r1];
    server_opts.settings.ecc_curves = vec![NamedGroup::secp256r1];
    server_opts.settings.dh_groups = vec![];

    let (mut cs, mut ss) = connect(Client::new(client_opts), Server::new(server_opts)).unwrap();

    assert_eq!(cs.summary().protocol_version, TLS_1_3_VERSION);
    exchange(&mut cs, &mut ss, b"after retry");
}

#[test]
fn tls13_hybrid_kem_group() {
    let mut client_opts = client_options(FakeProvider::new(5));
    client_opts.settings.key_shares = vec![NamedGroup::x25519mlkem768];
    client_opts.settings.ecc_curves =
        vec![NamedGroup::x25519mlkem768, NamedGroup::x25519];

    let mut server_opts = server_options_with_rsa_cert(FakeProvider::new(6));
    server_opts.settings.key_shares = vec![NamedGroup::x25519mlkem768];

    let (mut cs, mut ss) = connect(Client::new(client_opts), Server::new(server_opts)).unwrap();

    assert_eq!(cs.summary().protocol_version, TLS_1_3_VERSION);
    exchange(&mut cs, &mut ss, b"post quantum hello");
}

#[test]
fn tls13_external_psk_without_certificate() {
    let psk = PskConfig {
        identity: Bytes::from_static(b"alpha"),
        secret: Bytes::from(vec![0x11u8; 32]),
        hash: HashAlgorithm::Sha256,
    };

    let mut client_opts = client_options(FakeProvider::new(7));
    client_opts.settings.psk_configs = vec![psk.clone()];

    // No certificate at all: only the PSK authenticates this server.
    let mut server_opts = ServerOptions::recommended(FakeProvider::new(8));
    server_opts.settings.psk_configs = vec![psk];

    let (mut cs, mut ss) = connect(Client::new(client_opts), Server::new(server_opts)).unwrap();

    assert!(cs.summary().resumed);
    assert!(ss.summary().resumed);
    assert!(cs.summary().peer_certificates.is_empty());

    exchange(&mut cs, &mut ss, b"psk traffic");
}

#[test]
fn tls13_ticket_resumption() {
    let cache = MemorySessionCache::new();

    let mut client_opts = client_options(FakeProvider::new(9));
    client_opts.session_cache = Some(cache.clone());

    let mut server_opts = server_options_with_rsa_cert(FakeProvider::new(10));
    server_opts.settings.ticket_keys = vec![Bytes::from(vec![0x42u8; 32])];

    let (mut cs, mut ss) = connect(
        Client::new(client_opts.clone()),
        Server::new(server_opts.clone()),
    )
    .unwrap();

    // Reading application data also drains the NewSessionTicket records the
    // server queued right after its handshake.
    exchange(&mut cs, &mut ss, b"first connection");

    let session = cs.session().clone();
    assert!(!session.tickets.is_empty());
    assert!(!session.resumption_master_secret.is_empty());

    // Second connection: offer a ticket as a resumption PSK.
    let mut client_opts2 = client_opts;
    client_opts2.resume_session = Some(session);

    let (mut cs2, mut ss2) =
        connect(Client::new(client_opts2), Server::new(server_opts)).unwrap();

    assert!(cs2.summary().resumed);
    assert!(ss2.summary().resumed);
    // The PSK handshake skips certificate authentication entirely.
    assert!(cs2.summary().peer_certificates.is_empty());

    exchange(&mut cs2, &mut ss2, b"resumed connection");
}

#[test]
fn tls13_key_update() {
    let client = Client::new(client_options(FakeProvider::new(11)));
    let server = Server::new(server_options_with_rsa_cert(FakeProvider::new(12)));

    let (mut cs, mut ss) = connect(client, server).unwrap();

    task::block_on(async {
        // Request that the peer rekeys too.
        cs.send_key_update(true).await.unwrap();
        cs.write(b"under new keys").await.unwrap();

        let mut buf = [0u8; 14];
        let mut read = 0;
        while read < buf.len() {
            read += ss.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf[..], b"under new keys");

        // The server rotated its write keys in response.
        ss.write(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < buf.len() {
            read += cs.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf[..], b"reply");
    });
}

#[test]
fn tls12_ecdhe_rsa_gcm_handshake_and_resumption() {
    let client_cache = MemorySessionCache::new();
    let server_cache = MemorySessionCache::new();

    let mut client_opts = client_options(FakeProvider::new(13));
    client_opts.settings.max_version = TLS_1_2_VERSION;
    client_opts.settings.ecc_curves = vec![NamedGroup::secp256r1];
    client_opts.settings.key_shares = vec![];
    client_opts.session_cache = Some(client_cache.clone());

    let mut server_opts = server_options_with_rsa_cert(FakeProvider::new(14));
    server_opts.settings.max_version = TLS_1_2_VERSION;
    server_opts.session_cache = Some(server_cache.clone());

    let (mut cs, mut ss) = connect(
        Client::new(client_opts.clone()),
        Server::new(server_opts.clone()),
    )
    .unwrap();

    assert_eq!(cs.summary().protocol_version, TLS_1_2_VERSION);
    assert_eq!(
        cs.summary().cipher_suite,
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
    );
    assert!(!cs.summary().resumed);

    let payload = [0xabu8; 32];
    exchange(&mut cs, &mut ss, &payload);
    task::block_on(async {
        cs.close().await.unwrap();
    });

    // Second connection resumes by session id: no certificate or key
    // exchange messages are repeated.
    let (mut cs2, mut ss2) = connect(
        Client::new(client_opts),
        Server::new(server_opts),
    )
    .unwrap();

    assert!(cs2.summary().resumed);
    assert!(ss2.summary().resumed);
    assert_eq!(
        cs2.summary().cipher_suite,
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
    );

    exchange(&mut cs2, &mut ss2, &payload);
}

#[test]
fn tls12_cbc_with_encrypt_then_mac() {
    let mut client_opts = client_options(FakeProvider::new(15));
    client_opts.settings.max_version = TLS_1_2_VERSION;
    client_opts.settings.cipher_suites =
        vec![CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256];

    let mut server_opts = server_options_with_rsa_cert(FakeProvider::new(16));
    server_opts.settings.max_version = TLS_1_2_VERSION;
    server_opts
        .settings
        .cipher_suites
        .push(CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256);

    let (mut cs, mut ss) = connect(Client::new(client_opts), Server::new(server_opts)).unwrap();

    assert_eq!(
        cs.summary().cipher_suite,
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256
    );
    assert!(cs.session().encrypt_then_mac);

    exchange(&mut cs, &mut ss, b"cbc etm payload");
}

#[test]
fn tls12_cbc_mac_then_encrypt() {
    let mut client_opts = client_options(FakeProvider::new(17));
    client_opts.settings.max_version = TLS_1_2_VERSION;
    client_opts.settings.cipher_suites =
        vec![CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256];

    let mut server_opts = server_options_with_rsa_cert(FakeProvider::new(18));
    server_opts.settings.max_version = TLS_1_2_VERSION;
    server_opts.settings.use_encrypt_then_mac = false;
    server_opts
        .settings
        .cipher_suites
        .push(CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256);

    let (mut cs, mut ss) = connect(Client::new(client_opts), Server::new(server_opts)).unwrap();

    assert!(!cs.session().encrypt_then_mac);
    exchange(&mut cs, &mut ss, b"classic cbc payload");
}

#[test]
fn tls12_rsa_key_transport() {
    let mut client_opts = client_options(FakeProvider::new(19));
    client_opts.settings.max_version = TLS_1_2_VERSION;
    client_opts.settings.cipher_suites = vec![CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256];

    let mut server_opts = server_options_with_rsa_cert(FakeProvider::new(20));
    server_opts.settings.max_version = TLS_1_2_VERSION;
    server_opts
        .settings
        .cipher_suites
        .push(CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256);

    let (mut cs, mut ss) = connect(Client::new(client_opts), Server::new(server_opts)).unwrap();

    assert_eq!(
        cs.summary().cipher_suite,
        CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256
    );
    exchange(&mut cs, &mut ss, b"static rsa payload");
}

#[test]
fn tls12_ems_mismatch_declines_resumption() {
    let server_cache = MemorySessionCache::new();

    // A cached session negotiated without extended_master_secret.
    let stale_id = vec![0x77u8; 32];
    let mut stale = Session::default();
    stale.session_id = Bytes::from(stale_id.clone());
    stale.cipher_suite = Some(CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256);
    stale.master_secret = Bytes::from(vec![0x55u8; 48]);
    stale.extended_master_secret = false;
    stale.resumable = true;
    server_cache.put(&stale_id, stale.clone());

    let mut client_opts = client_options(FakeProvider::new(21));
    client_opts.settings.max_version = TLS_1_2_VERSION;
    client_opts.resume_session = Some(stale);

    let mut server_opts = server_options_with_rsa_cert(FakeProvider::new(22));
    server_opts.settings.max_version = TLS_1_2_VERSION;
    server_opts.session_cache = Some(server_cache);

    // Both sides advertise EMS now, so the EMS-less session must not be
    // resumed; a full handshake happens instead.
    let (mut cs, mut ss) = connect(Client::new(client_opts), Server::new(server_opts)).unwrap();

    assert!(!cs.summary().resumed);
    assert!(!ss.summary().resumed);
    assert!(cs.session().extended_master_secret);

    exchange(&mut cs, &mut ss, b"full handshake after decline");
}

#[test]
fn tls12_session_tickets() {
    let mut client_opts = client_options(FakeProvider::new(23));
    client_opts.settings.max_version = TLS_1_2_VERSION;

    let mut server_opts = server_options_with_rsa_cert(FakeProvider::new(24));
    server_opts.settings.max_version = TLS_1_2_VERSION;
    server_opts.settings.ticket_keys = vec![Bytes::from(vec![0x24u8; 32])];

    let (mut cs, mut ss) = connect(
        Client::new(client_opts.clone()),
        Server::new(server_opts.clone()),
    )
    .unwrap();

    exchange(&mut cs, &mut ss, b"ticketed");

    let session = cs.session().clone();
    assert!(session.ticket_tls12.is_some());

    // Offer the ticket on the next connection.
    let mut client_opts2 = client_opts;
    client_opts2.resume_session = Some(session);

    let (mut cs2, mut ss2) =
        connect(Client::new(client_opts2), Server::new(server_opts)).unwrap();

    assert!(cs2.summary().resumed);
    assert!(ss2.summary().resumed);
    exchange(&mut cs2, &mut ss2, b"ticket resumed");
}

#[test]
fn alpn_and_heartbeat_negotiation() {
    let mut client_opts = client_options(FakeProvider::new(25));
    client_opts.alpn_ids = vec![Bytes::from_static(b"h2"), Bytes::from_static(b"http/1.1")];
    client_opts.settings.use_heartbeat_extension = true;

    let mut server_opts = server_options_with_rsa_cert(FakeProvider::new(26));
    server_opts.alpn_ids = vec![Bytes::from_static(b"http/1.1")];
    server_opts.settings.use_heartbeat_extension = true;

    let (mut cs, mut ss) = connect(Client::new(client_opts), Server::new(server_opts)).unwrap();

    assert_eq!(
        cs.summary().selected_alpn_protocol.as_deref(),
        Some(&b"http/1.1"[..])
    );
    assert_eq!(
        ss.summary().selected_alpn_protocol.as_deref(),
        Some(&b"http/1.1"[..])
    );
    assert!(cs.summary().peer_accepts_heartbeats);

    task::block_on(async {
        // A heartbeat request is answered transparently while the peer
        // continues to wait for application data.
        cs.send_heartbeat_request(b"ping").await.unwrap();
        cs.write(b"data").await.unwrap();

        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < buf.len() {
            read += ss.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf[..], b"data");

        ss.write(b"done").await.unwrap();
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < buf.len() {
            read += cs.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf[..], b"done");
    });
}

#[test]
fn close_notify_reads_as_eof() {
    let client = Client::new(client_options(FakeProvider::new(27)));
    let server = Server::new(server_options_with_rsa_cert(FakeProvider::new(28)));

    let (mut cs, mut ss) = connect(client, server).unwrap();

    task::block_on(async {
        cs.write(b"bye").await.unwrap();
        cs.close().await.unwrap();

        let mut buf = [0u8; 3];
        let mut read = 0;
        while read < buf.len() {
            read += ss.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf[..], b"bye");

        // Clean EOF, and the session survives as resumable.
        assert_eq!(ss.read(&mut buf).await.unwrap(), 0);
        assert!(ss.session().resumable);
    });
}
