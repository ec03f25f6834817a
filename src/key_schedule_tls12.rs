// Helpers for deriving the master secret and traffic keys used in TLS 1.2.

use bytes::Bytes;

use crate::hmac::hmac_hash;
use crate::provider::HasherFactory;
use crate::transcript::Transcript;

pub const MASTER_SECRET_LENGTH: usize = 48;
pub const VERIFY_DATA_LENGTH: usize = 12;

/// Standard TLS 1.2 PRF based on the active cipher's PRF hash.
///
/// PRF(secret, label, seed) = P_<hash>(secret, label + seed)
pub fn prf(
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    output_size: usize,
    hasher_factory: &HasherFactory,
) -> Vec<u8> {
    let mut data = label.to_vec();
    data.extend_from_slice(seed);

    p_hash(secret, &data, output_size, hasher_factory)
}

/// Defined in the TLS 1.2 RFC as:
///
/// P_hash(secret, seed) =
///     HMAC_hash(secret, A(1) + seed) +
///     HMAC_hash(secret, A(2) + seed) +
///     HMAC_hash(secret, A(3) + seed) + ...
fn p_hash(
    secret: &[u8],
    seed: &[u8],
    output_size: usize,
    hasher_factory: &HasherFactory,
) -> Vec<u8> {
    // Current value of A(i) where:
    //   A(0) = seed
    //   A(i) = HMAC_hash(secret, A(i-1))
    let mut a = seed.to_vec();

    let mut out = vec![];
    while out.len() < output_size {
        a = hmac_hash(hasher_factory, secret, &a);

        let mut data = a.clone();
        data.extend_from_slice(seed);

        out.extend_from_slice(&hmac_hash(hasher_factory, secret, &data));
    }

    out.truncate(output_size);

    out
}

/// master_secret = PRF(pre_master_secret, "master secret",
///     ClientHello.random + ServerHello.random)[0..47];
pub fn master_secret(
    pre_master_secret: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    hasher_factory: &HasherFactory,
) -> Vec<u8> {
    let mut seed = client_random.to_vec();
    seed.extend_from_slice(server_random);
    prf(
        pre_master_secret,
        b"master secret",
        &seed,
        MASTER_SECRET_LENGTH,
        hasher_factory,
    )
}

/// RFC 7627: master_secret = PRF(pre_master_secret, "extended master secret",
///     session_hash)[0..47];
///
/// session_hash is the transcript digest through the ClientKeyExchange.
pub fn extended_master_secret(
    pre_master_secret: &[u8],
    session_hash: &[u8],
    hasher_factory: &HasherFactory,
) -> Vec<u8> {
    prf(
        pre_master_secret,
        b"extended master secret",
        session_hash,
        MASTER_SECRET_LENGTH,
        hasher_factory,
    )
}

#[derive(Debug)]
pub struct KeyBlock {
    pub client_write_mac_key: Bytes,
    pub server_write_mac_key: Bytes,
    pub client_write_key: Bytes,
    pub server_write_key: Bytes,
    pub client_write_iv: Bytes,
    pub server_write_iv: Bytes,
}

/// key_block = PRF(SecurityParameters.master_secret,
///     "key expansion",
///     SecurityParameters.server_random +
///     SecurityParameters.client_random);
///
/// Partitioned in the order client-MAC, server-MAC, client-key, server-key,
/// client-IV, server-IV.
pub fn key_block(
    master_secret: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    hasher_factory: &HasherFactory,
    mac_key_length: usize,
    enc_key_length: usize,
    fixed_iv_length: usize,
) -> KeyBlock {
    let block_size = 2 * (mac_key_length + enc_key_length + fixed_iv_length);

    let mut seed = vec![];
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);

    let mut block = Bytes::from(prf(
        master_secret,
        b"key expansion",
        &seed,
        block_size,
        hasher_factory,
    ));

    let client_write_mac_key = block.split_to(mac_key_length);
    let server_write_mac_key = block.split_to(mac_key_length);

    let client_write_key = block.split_to(enc_key_length);
    let server_write_key = block.split_to(enc_key_length);

    let client_write_iv = block.split_to(fixed_iv_length);
    let server_write_iv = block.split_to(fixed_iv_length);

    assert_eq!(block.len(), 0);

    KeyBlock {
        client_write_mac_key,
        server_write_mac_key,
        client_write_key,
        server_write_key,
        client_write_iv,
        server_write_iv,
    }
}

/// Finished computation for an established TLS 1.2 connection.
pub struct KeyScheduleTls12 {
    hasher_factory: HasherFactory,
    master_secret: Vec<u8>,
}

impl KeyScheduleTls12 {
    pub fn new(hasher_factory: HasherFactory, master_secret: Vec<u8>) -> Self {
        Self {
            hasher_factory,
            master_secret,
        }
    }

    pub fn master_secret(&self) -> &[u8] {
        &self.master_secret
    }

    /// Transcript should include all handshake messages from the first
    /// ClientHello up to and including the last message before the client
    /// Finished (usually the ClientKeyExchange or CertificateVerify).
    pub fn verify_data_client(&self, handshake_transcript: &Transcript) -> Vec<u8> {
        let hash = handshake_transcript.hash(&self.hasher_factory);
        prf(
            &self.master_secret,
            b"client finished",
            &hash,
            VERIFY_DATA_LENGTH,
            &self.hasher_factory,
        )
    }

    /// Transcript should usually end with the Finished message from the
    /// client (full handshake) or the ServerHello (resumption).
    pub fn verify_data_server(&self, handshake_transcript: &Transcript) -> Vec<u8> {
        let hash = handshake_transcript.hash(&self.hasher_factory);
        prf(
            &self.master_secret,
            b"server finished",
            &hash,
            VERIFY_DATA_LENGTH,
            &self.hasher_factory,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sha256_factory;

    // PRF test vector for TLS 1.2 P_SHA256 that circulates with most
    // implementations' test suites.
    #[test]
    fn prf_sha256_vector() {
        let secret = hex::decode("9bbe436ba940f017b17652849a71db35").unwrap();
        let seed = hex::decode("a0ba9f936cda311827a6f796ffd5198c").unwrap();

        let out = prf(&secret, b"test label", &seed, 100, &sha256_factory());

        assert_eq!(
            out,
            hex::decode(
                "e3f229ba727be17b8d122620557cd453c2aab21d07c3d495329b52d4e61edb5a\
                 6b301791e90d35c9c9a46b4e14baf9af0fa022f7077def17abfd3797c0564bab\
                 4fbc91666e9def9b97fce34f796789baa48082d122ee42c5a72e5a5110fff701\
                 87347b66"
            )
            .unwrap()
        );
    }

    #[test]
    fn key_block_partitioning() {
        let ms = vec![0x0bu8; 48];
        let cr = vec![0x01u8; 32];
        let sr = vec![0x02u8; 32];

        let kb = key_block(&ms, &cr, &sr, &sha256_factory(), 20, 16, 4);
        assert_eq!(kb.client_write_mac_key.len(), 20);
        assert_eq!(kb.server_write_mac_key.len(), 20);
        assert_eq!(kb.client_write_key.len(), 16);
        assert_eq!(kb.server_write_key.len(), 16);
        assert_eq!(kb.client_write_iv.len(), 4);
        assert_eq!(kb.server_write_iv.len(), 4);
        assert_ne!(kb.client_write_key, kb.server_write_key);
    }

    #[test]
    fn ems_differs_from_classic() {
        let pms = vec![0x03u8; 48];
        let cr = vec![0x01u8; 32];
        let sr = vec![0x02u8; 32];
        let session_hash = vec![0x04u8; 32];

        let classic = master_secret(&pms, &cr, &sr, &sha256_factory());
        let ems = extended_master_secret(&pms, &session_hash, &sha256_factory());
        assert_eq!(classic.len(), 48);
        assert_eq!(ems.len(), 48);
        assert_ne!(classic, ems);
    }
}
