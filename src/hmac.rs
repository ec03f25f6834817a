use crate::provider::{Hasher, HasherFactory};
use crate::utils::*;

/// https://tools.ietf.org/html/rfc2104
pub struct Hmac {
    // Bounded by the block size assuming block size <= output size of the
    // hash.
    derived_key: Vec<u8>,

    hash: HasherFactory,

    /// Underlying hashing function used as the inner hasher.
    inner_hasher: Box<dyn Hasher>,
}

impl Hmac {
    pub fn new(hash: HasherFactory, key: &[u8]) -> Self {
        let block_size = hash.create().block_size();

        let mut derived_key = vec![0u8; block_size];
        if key.len() <= block_size {
            derived_key[0..key.len()].copy_from_slice(key);
        } else {
            let key_hash = {
                let mut hasher = hash.create();
                hasher.update(key);
                hasher.finish()
            };
            derived_key[0..key_hash.len()].copy_from_slice(&key_hash);
        };

        let mut inner_hasher = hash.create();

        // Initialize inner hash with 'derived_key xor ipad'.
        let mut inner_start = vec![0u8; block_size];
        let ipad = vec![0x36u8; block_size];
        xor(&ipad, &derived_key, &mut inner_start);
        inner_hasher.update(&inner_start);

        Self {
            hash,
            derived_key,
            inner_hasher,
        }
    }

    pub fn output_size(&self) -> usize {
        self.inner_hasher.output_size()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner_hasher.update(data);
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut outer_hasher = self.hash.create();
        let block_size = outer_hasher.block_size();

        // Initialize outer hasher with 'derived_key xor opad'
        let mut outer_start = vec![0u8; block_size];
        let opad = vec![0x5cu8; block_size];
        xor(&opad, &self.derived_key, &mut outer_start);
        outer_hasher.update(&outer_start);

        outer_hasher.update(self.inner_hasher.finish().as_ref());
        outer_hasher.finish()
    }
}

/// One-shot HMAC(key, data).
pub fn hmac_hash(hash: &HasherFactory, key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut hmac = Hmac::new(hash.clone(), key);
    hmac.update(data);
    hmac.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sha256_factory;

    #[test]
    fn hmac_sha256_rfc4231_case2() {
        let factory = sha256_factory();

        let mut hmac = Hmac::new(factory, b"Jefe");
        hmac.update(b"what do ya want for nothing?");
        assert_eq!(
            &hmac.finish()[..],
            &hex::decode("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
                .unwrap()[..]
        );
    }

    #[test]
    fn hmac_long_key_is_hashed() {
        let factory = sha256_factory();

        // RFC 4231 test case 6: 131 byte key.
        let key = vec![0xaau8; 131];
        let mut hmac = Hmac::new(factory, &key);
        hmac.update(b"Test Using Larger Than Block-Size Key - Hash Key First");
        assert_eq!(
            &hmac.finish()[..],
            &hex::decode("60e431591ee0b67f0d8a26aacbf5b77f8e0bc6213728c5140546040f0ee37f54")
                .unwrap()[..]
        );
    }
}
