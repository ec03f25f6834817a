use bytes::Bytes;

use crate::provider::HasherFactory;

/// Stores the handshake messages seen so far, byte-for-byte as delivered on
/// the wire.
///
/// Keeping the raw messages (rather than one running digest) is what lets the
/// handshake hash the same transcript under several algorithms: TLS 1.2
/// signatures and the TLS 1.3 PRF do not necessarily agree on the hash, and
/// PSK binders need a digest of a truncated prefix.
#[derive(Clone)]
pub struct Transcript {
    messages: Vec<Bytes>,
}

impl Transcript {
    pub fn new() -> Self {
        Self { messages: vec![] }
    }

    pub fn push(&mut self, message: Bytes) {
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Independent snapshot of the transcript at this point.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Removes and returns the most recently pushed message. Used when a
    /// HelloRetryRequest forces the first ClientHello to be condensed while
    /// the retry itself stays in place.
    pub fn pop_last(&mut self) -> Option<Bytes> {
        self.messages.pop()
    }

    /// All messages concatenated, as signed by the TLS 1.2
    /// CertificateVerify.
    pub fn concat(&self) -> Vec<u8> {
        let mut out = vec![];
        for m in self.messages.iter() {
            out.extend_from_slice(m);
        }
        out
    }

    /// Computes the hash of all messages seen.
    pub fn hash(&self, hasher_factory: &HasherFactory) -> Vec<u8> {
        let mut hasher = hasher_factory.create();
        for m in self.messages.iter() {
            hasher.update(m);
        }

        hasher.finish()
    }

    /// Hash of all messages, with the final message truncated to
    /// 'truncate_last_to' bytes. Used for PSK binder computation where the
    /// binders list at the end of the ClientHello is excluded from its own
    /// digest.
    pub fn hash_truncated(&self, hasher_factory: &HasherFactory, truncate_last_to: usize) -> Vec<u8> {
        let mut hasher = hasher_factory.create();
        for (i, m) in self.messages.iter().enumerate() {
            if i + 1 == self.messages.len() {
                hasher.update(&m[0..truncate_last_to.min(m.len())]);
            } else {
                hasher.update(m);
            }
        }

        hasher.finish()
    }

    /// Replaces the current contents with the synthetic 'message_hash' message
    /// defined in RFC 8446 section 4.4.1. Called when a HelloRetryRequest is
    /// seen so that ClientHello1 participates only as its hash.
    pub fn condense_for_retry(&mut self, hasher_factory: &HasherFactory) {
        let ch1_hash = self.hash(hasher_factory);

        let mut synthetic = Vec::with_capacity(4 + ch1_hash.len());
        synthetic.push(254); // HandshakeType::MessageHash
        synthetic.extend_from_slice(&[0, 0, ch1_hash.len() as u8]);
        synthetic.extend_from_slice(&ch1_hash);

        self.messages.clear();
        self.messages.push(synthetic.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sha256_factory;

    #[test]
    fn hash_is_stable_over_fragmentation() {
        let factory = sha256_factory();

        let mut a = Transcript::new();
        a.push(Bytes::from_static(b"hello "));
        a.push(Bytes::from_static(b"world"));

        let mut b = Transcript::new();
        b.push(Bytes::from_static(b"hel"));
        b.push(Bytes::from_static(b"lo world"));

        assert_eq!(a.hash(&factory), b.hash(&factory));
    }

    #[test]
    fn copy_is_independent() {
        let factory = sha256_factory();

        let mut a = Transcript::new();
        a.push(Bytes::from_static(b"one"));

        let snapshot = a.copy();
        a.push(Bytes::from_static(b"two"));

        assert_ne!(a.hash(&factory), snapshot.hash(&factory));
    }

    #[test]
    fn condense_replaces_contents_with_message_hash() {
        let factory = sha256_factory();

        let mut t = Transcript::new();
        t.push(Bytes::from_static(b"client hello one"));

        let ch1_hash = t.hash(&factory);
        t.condense_for_retry(&factory);

        let mut expected = Transcript::new();
        let mut synthetic = vec![254u8, 0, 0, 32];
        synthetic.extend_from_slice(&ch1_hash);
        expected.push(synthetic.into());

        assert_eq!(t.hash(&factory), expected.hash(&factory));
    }
}
